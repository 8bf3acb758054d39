//! Canonical strings for hashing and signing
//!
//! Every signable entity renders itself into a deterministic string:
//! fixed field order, normalized decimals, and set-valued fields rendered as
//! the lexicographically sorted canonical strings of their members. Two
//! nodes holding logically equal sets built in different insertion orders
//! produce byte-identical output, which is what lets independently computed
//! hashes and signatures agree.

use rust_decimal::Decimal;
use std::fmt::Display;

/// Separator between the fields of one entity
pub const FIELD_SEPARATOR: char = ':';

/// Separator between the members of a set-valued field
pub const SET_SEPARATOR: char = '|';

/// Entities with a deterministic string form
pub trait Canonical {
    /// Append this entity's fields to the writer in fixed order
    fn write_canonical(&self, writer: &mut CanonicalWriter);

    /// The canonical string on its own
    fn canonical_string(&self) -> String {
        let mut writer = CanonicalWriter::new();
        self.write_canonical(&mut writer);
        writer.finish()
    }
}

/// Builder for canonical strings
#[derive(Debug, Default)]
pub struct CanonicalWriter {
    buffer: String,
    fields: usize,
}

impl CanonicalWriter {
    /// Create new writer
    pub fn new() -> Self {
        Self::default()
    }

    fn separate(&mut self) {
        if self.fields > 0 {
            self.buffer.push(FIELD_SEPARATOR);
        }
        self.fields += 1;
    }

    /// Write one field
    pub fn field(&mut self, value: impl Display) -> &mut Self {
        self.separate();
        self.buffer.push_str(&value.to_string());
        self
    }

    /// Write a decimal with trailing zeros stripped, so `1.0` and `1.00` agree
    pub fn decimal(&mut self, value: &Decimal) -> &mut Self {
        self.field(value.normalize())
    }

    /// Write an optional string; absent and empty render the same
    pub fn optional(&mut self, value: Option<&str>) -> &mut Self {
        self.field(value.unwrap_or_default())
    }

    /// Write a set-valued field from its members
    pub fn set<'a, T, I>(&mut self, items: I) -> &mut Self
    where
        T: Canonical + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let joined = canonical_set(items);
        self.field(joined)
    }

    /// Write a set-valued field from already-rendered member strings
    pub fn set_of_strings<I>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator<Item = String>,
    {
        let joined = join_sorted(items);
        self.field(joined)
    }

    /// Finalize and return the string
    pub fn finish(self) -> String {
        self.buffer
    }
}

/// Render a set: member strings sorted lexicographically, then joined
pub fn canonical_set<'a, T, I>(items: I) -> String
where
    T: Canonical + 'a,
    I: IntoIterator<Item = &'a T>,
{
    join_sorted(items.into_iter().map(Canonical::canonical_string))
}

fn join_sorted<I>(items: I) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut rendered: Vec<String> = items.into_iter().collect();
    rendered.sort();
    let mut out = String::new();
    for (i, item) in rendered.iter().enumerate() {
        if i > 0 {
            out.push(SET_SEPARATOR);
        }
        out.push_str(item);
    }
    out
}

/// Strip all whitespace; snapshot strings are compared whitespace-free
pub fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    #[derive(Debug, Hash, PartialEq, Eq)]
    struct Item(&'static str, u32);

    impl Canonical for Item {
        fn write_canonical(&self, writer: &mut CanonicalWriter) {
            writer.field(self.0).field(self.1);
        }
    }

    #[test]
    fn test_fields_in_order() {
        let mut writer = CanonicalWriter::new();
        writer.field("a").field(7).field("");
        assert_eq!(writer.finish(), "a:7:");
    }

    #[test]
    fn test_set_is_sorted() {
        let items = vec![Item("b", 2), Item("a", 1), Item("c", 3)];
        assert_eq!(canonical_set(&items), "a:1|b:2|c:3");
    }

    #[test]
    fn test_set_ignores_insertion_order() {
        let mut first = HashSet::new();
        let mut second = HashSet::new();
        for (name, n) in [("x", 1), ("y", 2), ("z", 3), ("w", 4)] {
            first.insert(Item(name, n));
        }
        for (name, n) in [("w", 4), ("z", 3), ("y", 2), ("x", 1)] {
            second.insert(Item(name, n));
        }

        let mut w1 = CanonicalWriter::new();
        w1.field("head").set(&first);
        let mut w2 = CanonicalWriter::new();
        w2.field("head").set(&second);
        assert_eq!(w1.finish(), w2.finish());
    }

    #[test]
    fn test_empty_set() {
        let items: Vec<Item> = Vec::new();
        let mut writer = CanonicalWriter::new();
        writer.field(1).set(&items).field(2);
        assert_eq!(writer.finish(), "1::2");
    }

    #[test]
    fn test_decimal_normalized() {
        let mut w1 = CanonicalWriter::new();
        w1.decimal(&dec!(100.00));
        let mut w2 = CanonicalWriter::new();
        w2.decimal(&dec!(100));
        assert_eq!(w1.finish(), w2.finish());
    }

    #[test]
    fn test_strip_whitespace() {
        assert_eq!(strip_whitespace(" a b\n\tc "), "abc");
    }
}
