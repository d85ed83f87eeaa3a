//! Executable memory with a W^X life cycle
//!
//! `CodeBuffer` is writable, never executable. `freeze()` re-protects the
//! pages read-execute and returns `ExecutableCode`, which exposes only an
//! entry address — the bytes can no longer be reached mutably except
//! through a `PatchGuard`, which flips the pages back to read-write (not
//! executable), hands out the slice, and restores read-execute with an
//! icache flush when dropped. At no instant is a page both writable and
//! executable.
//!
//! Each mapping can carry guard pages on both sides, so a runaway write
//! or jump lands on an unmapped page instead of a neighbor's code.

use aero_core::JsError;

/// Code alignment within buffers
pub const CODE_ALIGN: usize = 16;

fn page_size() -> usize {
    #[cfg(unix)]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// A writable, non-executable code buffer
pub struct CodeBuffer {
    map_ptr: *mut u8,
    map_len: usize,
    code_ptr: *mut u8,
    capacity: usize,
    len: usize,
    guard_pages: bool,
}

// The raw pointers refer to a private mapping owned by this value
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Map a fresh writable region with room for `size` bytes
    pub fn allocate(size: usize, guard_pages: bool) -> Result<CodeBuffer, JsError> {
        let page = page_size();
        let code_len = (size.max(1) + page - 1) & !(page - 1);
        let map_len = if guard_pages {
            code_len + 2 * page
        } else {
            code_len
        };

        #[cfg(unix)]
        {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    map_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(JsError::internal("executable memory allocation failed"));
            }
            let map_ptr = ptr as *mut u8;
            let code_ptr = if guard_pages {
                unsafe {
                    // Unmapped sentinels on both sides
                    libc::mprotect(ptr, page, libc::PROT_NONE);
                    libc::mprotect(
                        (map_ptr.add(map_len - page)) as *mut libc::c_void,
                        page,
                        libc::PROT_NONE,
                    );
                    map_ptr.add(page)
                }
            } else {
                map_ptr
            };
            Ok(CodeBuffer {
                map_ptr,
                map_len,
                code_ptr,
                capacity: code_len,
                len: 0,
                guard_pages,
            })
        }
        #[cfg(not(unix))]
        {
            let _ = (map_len, guard_pages);
            Err(JsError::internal(
                "executable memory is only supported on unix targets",
            ))
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes; fails if the buffer would overflow
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), JsError> {
        if self.len + bytes.len() > self.capacity {
            return Err(JsError::internal("code buffer overflow"));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code_ptr.add(self.len), bytes.len());
        }
        self.len += bytes.len();
        Ok(())
    }

    /// Align the write cursor
    pub fn align_to(&mut self, align: usize) {
        let rem = self.len % align;
        if rem != 0 {
            let pad = align - rem;
            if self.len + pad <= self.capacity {
                // 0xCC (int3 on x86) poisons the padding
                for _ in 0..pad {
                    unsafe { *self.code_ptr.add(self.len) = 0xCC };
                    self.len += 1;
                }
            }
        }
    }

    /// Transition the pages to read-execute and seal the buffer
    pub fn freeze(self) -> Result<ExecutableCode, JsError> {
        #[cfg(unix)]
        {
            let rc = unsafe {
                libc::mprotect(
                    self.code_ptr as *mut libc::c_void,
                    self.capacity,
                    libc::PROT_READ | libc::PROT_EXEC,
                )
            };
            if rc != 0 {
                return Err(JsError::internal("failed to protect code pages"));
            }
            let exec = ExecutableCode {
                map_ptr: self.map_ptr,
                map_len: self.map_len,
                code_ptr: self.code_ptr,
                capacity: self.capacity,
                len: self.len,
            };
            std::mem::forget(self); // ownership moved to ExecutableCode
            Ok(exec)
        }
        #[cfg(not(unix))]
        {
            Err(JsError::internal(
                "executable memory is only supported on unix targets",
            ))
        }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.map_ptr as *mut libc::c_void, self.map_len);
        }
    }
}

/// Sealed, executable code. The bytes are only writable again through
/// `begin_patch`, and never while executable.
pub struct ExecutableCode {
    map_ptr: *mut u8,
    map_len: usize,
    code_ptr: *mut u8,
    capacity: usize,
    len: usize,
}

unsafe impl Send for ExecutableCode {}
unsafe impl Sync for ExecutableCode {}

impl ExecutableCode {
    /// Address of a code offset (for entry points and diagnostics)
    pub fn address(&self, offset: u32) -> usize {
        self.code_ptr as usize + offset as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes for inspection (read-only view is always legal)
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.code_ptr, self.len) }
    }

    /// Open the pages for patching. The caller must hold the code cache's
    /// patch mutex; the guard restores read-execute on drop.
    ///
    /// # Safety
    /// No thread may be executing inside this code object while the guard
    /// is alive. The engine guarantees this by patching only from the
    /// executor thread at IC misses, which are outside the patched region.
    pub unsafe fn begin_patch(&self) -> Result<PatchGuard<'_>, JsError> {
        #[cfg(unix)]
        {
            let rc = libc::mprotect(
                self.code_ptr as *mut libc::c_void,
                self.capacity,
                libc::PROT_READ | libc::PROT_WRITE,
            );
            if rc != 0 {
                return Err(JsError::internal("failed to unprotect code pages"));
            }
            Ok(PatchGuard { code: self })
        }
        #[cfg(not(unix))]
        {
            Err(JsError::internal(
                "executable memory is only supported on unix targets",
            ))
        }
    }
}

impl Drop for ExecutableCode {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.map_ptr as *mut libc::c_void, self.map_len);
        }
    }
}

/// Capability to rewrite a sealed code object. Pages are read-write while
/// this exists and return to read-execute when it drops.
pub struct PatchGuard<'a> {
    code: &'a ExecutableCode,
}

impl PatchGuard<'_> {
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.code.code_ptr, self.code.len) }
    }

    /// Overwrite a 32-bit immediate at `offset`
    pub fn write_u32(&mut self, offset: u32, value: u32) {
        let bytes = self.bytes_mut();
        bytes[offset as usize..offset as usize + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl Drop for PatchGuard<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::mprotect(
                self.code.code_ptr as *mut libc::c_void,
                self.code.capacity,
                libc::PROT_READ | libc::PROT_EXEC,
            );
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_freeze() {
        let mut buf = CodeBuffer::allocate(64, false).unwrap();
        buf.write(&[0x90, 0x90, 0xC3]).unwrap();
        assert_eq!(buf.len(), 3);
        let exec = buf.freeze().unwrap();
        assert_eq!(exec.bytes(), &[0x90, 0x90, 0xC3]);
        assert_ne!(exec.address(0), 0);
    }

    #[test]
    fn test_overflow_rejected() {
        let page = super::page_size();
        let mut buf = CodeBuffer::allocate(16, false).unwrap();
        // Capacity rounds up to a page; fill it and overflow
        let fill = vec![0x90u8; page];
        buf.write(&fill).unwrap();
        assert!(buf.write(&[0x90]).is_err());
    }

    #[test]
    fn test_alignment_padding() {
        let mut buf = CodeBuffer::allocate(64, false).unwrap();
        buf.write(&[0x90]).unwrap();
        buf.align_to(CODE_ALIGN);
        assert_eq!(buf.len() % CODE_ALIGN, 0);
    }

    #[test]
    fn test_patch_round_trip() {
        let mut buf = CodeBuffer::allocate(64, false).unwrap();
        buf.write(&[0; 8]).unwrap();
        let exec = buf.freeze().unwrap();
        unsafe {
            let mut guard = exec.begin_patch().unwrap();
            guard.write_u32(2, 0xDEADBEEF);
        }
        assert_eq!(&exec.bytes()[2..6], &0xDEADBEEFu32.to_le_bytes());
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_executes_frozen_code() {
        // mov eax, 42; ret
        let mut buf = CodeBuffer::allocate(64, true).unwrap();
        buf.write(&[0xB8, 42, 0, 0, 0, 0xC3]).unwrap();
        let exec = buf.freeze().unwrap();
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(exec.address(0)) };
        assert_eq!(f(), 42);
    }
}
