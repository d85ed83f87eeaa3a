//! Bytecode decoder for the JIT front end
//!
//! Decodes the in-memory opcode stream into a flat instruction array the
//! CFG builder and lifter consume. The table here corresponds one-to-one
//! with the engine opcode set.

use aero_core::JsError;

use crate::bytecode::{read_i32, read_u16, Opcode};

/// Decoded operand payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operands {
    None,
    U8(u8),
    U16(u16),
    I32(i32),
    /// DeclName: kind byte + name index
    Decl(u8, u16),
}

/// One decoded instruction
#[derive(Debug, Clone, Copy)]
pub struct DecodedInstr {
    /// Byte offset of the opcode
    pub offset: usize,
    pub opcode: Opcode,
    pub operands: Operands,
    /// Total encoded size (opcode + operands)
    pub size: usize,
}

impl DecodedInstr {
    pub fn next_offset(&self) -> usize {
        self.offset + self.size
    }

    /// Absolute target of a jump instruction
    pub fn jump_target(&self) -> Option<usize> {
        match (self.opcode, self.operands) {
            (Opcode::Jump | Opcode::JumpIfFalse | Opcode::JumpIfTrue, Operands::I32(rel)) => {
                Some((self.offset as i64 + rel as i64) as usize)
            }
            _ => None,
        }
    }
}

/// Decode a whole function body
pub fn decode_function(code: &[u8]) -> Result<Vec<DecodedInstr>, JsError> {
    let mut out = Vec::with_capacity(code.len() / 2);
    let mut pc = 0usize;
    while pc < code.len() {
        let opcode = Opcode::from_u8(code[pc]).ok_or_else(|| {
            JsError::internal(format!("invalid opcode {:#04x} at {}", code[pc], pc))
        })?;
        let opsize = opcode.operand_size();
        if pc + 1 + opsize > code.len() {
            return Err(JsError::internal(format!(
                "truncated operands for {opcode:?} at {pc}"
            )));
        }
        let operands = match opsize {
            0 => Operands::None,
            1 => Operands::U8(code[pc + 1]),
            2 => Operands::U16(read_u16(code, pc + 1)),
            3 => Operands::Decl(code[pc + 1], read_u16(code, pc + 2)),
            4 => Operands::I32(read_i32(code, pc + 1)),
            _ => unreachable!("no opcode has {opsize} operand bytes"),
        };
        out.push(DecodedInstr {
            offset: pc,
            opcode,
            operands,
            size: 1 + opsize,
        });
        pc += 1 + opsize;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, Const};

    #[test]
    fn test_decode_simple_function() {
        let mut b = BytecodeBuilder::new("t", 0, 0);
        b.load_const(Const::Integer(1));
        b.load_const(Const::Integer(2));
        b.emit(Opcode::Add);
        b.emit(Opcode::Return);
        let f = b.finish();

        let instrs = decode_function(&f.code).unwrap();
        assert_eq!(instrs.len(), 4);
        assert_eq!(instrs[0].opcode, Opcode::LoadConst);
        assert_eq!(instrs[0].operands, Operands::U16(0));
        assert_eq!(instrs[2].opcode, Opcode::Add);
        assert_eq!(instrs[3].opcode, Opcode::Return);
        // Offsets chain correctly
        assert_eq!(instrs[1].offset, instrs[0].next_offset());
    }

    #[test]
    fn test_decode_jump_targets() {
        let mut b = BytecodeBuilder::new("t", 0, 0);
        let top = b.new_label();
        b.bind(top);
        b.emit(Opcode::Nop); // offset 0
        b.jump(top); // offset 1, rel -1
        let f = b.finish();

        let instrs = decode_function(&f.code).unwrap();
        assert_eq!(instrs[1].jump_target(), Some(0));
        assert_eq!(instrs[0].jump_target(), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_function(&[0xEE]).is_err());
        // Truncated LoadConst
        assert!(decode_function(&[Opcode::LoadConst as u8, 0x00]).is_err());
    }
}
