//! Heap strings, symbols and the property-key atom table

use rustc_hash::FxHashMap;

/// Immutable heap-allocated string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsString {
    data: Box<str>,
}

impl JsString {
    pub fn new(s: impl Into<Box<str>>) -> Self {
        JsString { data: s.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// UTF-16 code-unit length, the observable `length` of a JS string
    pub fn utf16_len(&self) -> usize {
        self.data.encode_utf16().count()
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// Symbol cell: identity plus an optional description
#[derive(Debug, Clone)]
pub struct JsSymbol {
    pub description: Option<Box<str>>,
}

/// BigInt cell. Arbitrary-precision arithmetic is a builtin-library
/// concern; the core carries the sign-magnitude i64 fast path the tiered
/// pipeline actually specializes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsBigInt(pub i64);

/// Interned property-key identifier
///
/// Atoms make shape transitions and scope lookups pointer-width compares.
/// Numeric index keys never become atoms; they route to element storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom(pub u32);

/// Interner mapping strings to stable `Atom`s
#[derive(Debug, Default)]
pub struct AtomTable {
    names: Vec<Box<str>>,
    index: FxHashMap<Box<str>, Atom>,
}

impl AtomTable {
    pub fn new() -> Self {
        AtomTable::default()
    }

    /// Intern a name, returning its atom (existing or fresh)
    pub fn intern(&mut self, name: &str) -> Atom {
        if let Some(&atom) = self.index.get(name) {
            return atom;
        }
        let atom = Atom(self.names.len() as u32);
        self.names.push(name.into());
        self.index.insert(name.into(), atom);
        atom
    }

    /// Look up an already-interned name
    pub fn get(&self, name: &str) -> Option<Atom> {
        self.index.get(name).copied()
    }

    /// The string an atom was interned from
    pub fn name(&self, atom: Atom) -> &str {
        &self.names[atom.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A property key as seen by the object model: an interned name, an array
/// index, or a symbol's heap identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    Atom(Atom),
    Index(u32),
    Symbol(crate::heap::ObjectId),
}

impl PropertyKey {
    /// Classify a string key: canonical array indices become `Index`
    pub fn from_str(atoms: &mut AtomTable, key: &str) -> PropertyKey {
        if let Some(idx) = parse_array_index(key) {
            PropertyKey::Index(idx)
        } else {
            PropertyKey::Atom(atoms.intern(key))
        }
    }
}

/// Parse a canonical array index per the ECMAScript definition: the string
/// form of an integer in `0..=u32::MAX - 1`, with no leading zeros.
pub fn parse_array_index(key: &str) -> Option<u32> {
    if key.is_empty() || key.len() > 10 {
        return None;
    }
    if key.len() > 1 && key.starts_with('0') {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = key.parse().ok()?;
    if n < u32::MAX as u64 {
        Some(n as u32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut atoms = AtomTable::new();
        let a = atoms.intern("x");
        let b = atoms.intern("y");
        let c = atoms.intern("x");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(atoms.name(a), "x");
        assert_eq!(atoms.name(b), "y");
    }

    #[test]
    fn test_array_index_parsing() {
        assert_eq!(parse_array_index("0"), Some(0));
        assert_eq!(parse_array_index("42"), Some(42));
        assert_eq!(parse_array_index("4294967294"), Some(u32::MAX - 1));
        assert_eq!(parse_array_index("4294967295"), None); // == u32::MAX
        assert_eq!(parse_array_index("01"), None);
        assert_eq!(parse_array_index("-1"), None);
        assert_eq!(parse_array_index("x"), None);
        assert_eq!(parse_array_index(""), None);
    }

    #[test]
    fn test_property_key_classification() {
        let mut atoms = AtomTable::new();
        assert!(matches!(
            PropertyKey::from_str(&mut atoms, "3"),
            PropertyKey::Index(3)
        ));
        assert!(matches!(
            PropertyKey::from_str(&mut atoms, "length"),
            PropertyKey::Atom(_)
        ));
    }

    #[test]
    fn test_utf16_length() {
        assert_eq!(JsString::new("abc").utf16_len(), 3);
        assert_eq!(JsString::new("日本").utf16_len(), 2);
        assert_eq!(JsString::new("𝄞").utf16_len(), 2); // surrogate pair
    }
}
