//! String interning for property names
//!
//! Property names and global bindings are compared as interned symbols.
//! Each agent owns one interner; symbols are plain integers, so compiled
//! bytecode and compilation snapshots can carry them across threads.

use string_interner::{DefaultStringInterner, DefaultSymbol};

/// An interned property or binding name
pub type Name = DefaultSymbol;

/// Names the runtime itself looks up
#[derive(Debug, Clone, Copy)]
pub struct WellKnownNames {
    pub length: Name,
    pub prototype: Name,
    pub name: Name,
    pub message: Name,
    pub next: Name,
    pub value: Name,
    pub done: Name,
    pub raw: Name,
    pub push: Name,
    pub pop: Name,
}

/// Agent-owned string interner
pub struct Interner {
    strings: DefaultStringInterner,
    /// Pre-interned names used by the runtime
    pub names: WellKnownNames,
}

impl Interner {
    /// Create an interner with the well-known names pre-seeded
    pub fn new() -> Self {
        let mut strings = DefaultStringInterner::new();
        let names = WellKnownNames {
            length: strings.get_or_intern_static("length"),
            prototype: strings.get_or_intern_static("prototype"),
            name: strings.get_or_intern_static("name"),
            message: strings.get_or_intern_static("message"),
            next: strings.get_or_intern_static("next"),
            value: strings.get_or_intern_static("value"),
            done: strings.get_or_intern_static("done"),
            raw: strings.get_or_intern_static("raw"),
            push: strings.get_or_intern_static("push"),
            pop: strings.get_or_intern_static("pop"),
        };
        Self { strings, names }
    }

    /// Intern a string, returning its symbol
    #[inline]
    pub fn intern(&mut self, s: &str) -> Name {
        self.strings.get_or_intern(s)
    }

    /// Symbol for an already-interned string
    #[inline]
    pub fn get(&self, s: &str) -> Option<Name> {
        self.strings.get(s)
    }

    /// Text of a symbol
    #[inline]
    pub fn resolve(&self, name: Name) -> &str {
        self.strings.resolve(name).unwrap_or("")
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Whether nothing has been interned
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_stable() {
        let mut interner = Interner::new();
        let a = interner.intern("foo");
        let b = interner.intern("foo");
        assert_eq!(a, b);
        assert_eq!(interner.resolve(a), "foo");
        assert_eq!(interner.get("length"), Some(interner.names.length));
        assert_eq!(interner.get("missing"), None);
    }
}
