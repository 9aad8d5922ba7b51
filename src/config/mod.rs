//! The boot configuration language.
//!
//! A strict, indentation-sensitive, typed key/value format with loadable
//! entry sections:
//!
//! ```text
//! default-entry = main
//!
//! [main]
//! binary:
//!     path = /boot/kernel
//!     allocate-anywhere = true
//! module = /boot/initrd
//! ```
//!
//! Parsing flattens everything into one entry array; entries of the same
//! scope are threaded through relative `next` offsets, and loadable
//! entries additionally chain among themselves. Values borrow from the
//! source text, so a [`Config`] cannot outlive the buffer it was parsed
//! from.

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::errors::BootError;

mod parse;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValueType: u8 {
        const NONE = 1 << 0;
        const BOOLEAN = 1 << 1;
        const UNSIGNED = 1 << 2;
        const SIGNED = 1 << 3;
        const STRING = 1 << 4;
        const OBJECT = 1 << 5;
        const ANY = 0xFF;
    }
}

impl ValueType {
    fn describe(self) -> &'static str {
        if self == ValueType::NONE {
            "None"
        } else if self == ValueType::BOOLEAN {
            "Boolean"
        } else if self == ValueType::UNSIGNED {
            "Unsigned Integer"
        } else if self == ValueType::SIGNED {
            "Signed Integer"
        } else if self == ValueType::STRING {
            "String"
        } else if self == ValueType::OBJECT {
            "Object"
        } else {
            "<multiple>"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueData<'src> {
    None,
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    String(&'src str),
    Object,
}

impl ValueData<'_> {
    pub fn ty(&self) -> ValueType {
        match self {
            ValueData::None => ValueType::NONE,
            ValueData::Bool(_) => ValueType::BOOLEAN,
            ValueData::Unsigned(_) => ValueType::UNSIGNED,
            ValueData::Signed(_) => ValueType::SIGNED,
            ValueData::String(_) => ValueType::STRING,
            ValueData::Object => ValueType::OBJECT,
        }
    }
}

/// A typed value, remembering where in the entry array it came from so
/// that object children and repeated keys can be found from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value<'src> {
    pub(crate) offset: usize,
    pub data: ValueData<'src>,
}

impl<'src> Value<'src> {
    pub fn is_null(&self) -> bool {
        matches!(self.data, ValueData::None)
    }

    pub fn is_object(&self) -> bool {
        matches!(self.data, ValueData::Object)
    }

    pub fn as_str(&self) -> Option<&'src str> {
        match self.data {
            ValueData::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.data {
            ValueData::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self.data {
            ValueData::Unsigned(u) => Some(u),
            _ => None,
        }
    }
}

/// A named configuration section describing one bootable target.
#[derive(Debug, Clone, Copy)]
pub struct LoadableEntry<'src> {
    pub name: &'src str,
    pub(crate) offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Value,
    LoadableEntry,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ConfigEntry<'src> {
    pub(crate) key: &'src str,
    pub(crate) kind: EntryKind,
    pub(crate) value: ValueData<'src>,

    /// Relative offset of the next entry within the same scope; 0 ends
    /// the chain.
    pub(crate) next_within_same_scope: usize,

    /// Relative offset of the next loadable entry; 0 ends the chain.
    pub(crate) next_loadable_entry: usize,
}

/// A parse diagnostic with enough position data for a caret print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: &'static str,

    /// 1-based line of the offending character.
    pub line: usize,

    /// 1-based column within that line.
    pub offset: usize,

    /// 1-based offset within the whole source.
    pub global_offset: usize,
}

impl ConfigError {
    /// Renders the `line | text` + caret diagnostic the user sees.
    pub fn pretty_print(&self, source: &str) -> String {
        use core::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "failed to parse config, error at line {}", self.line);

        let line_start = self.global_offset - self.offset;
        let line_text = source[line_start..]
            .split(['\n', '\r'])
            .next()
            .unwrap_or("");

        let prefix = alloc::format!("{} | ", self.line);
        let _ = writeln!(out, "{prefix}{line_text}");

        for _ in 0..prefix.len() + self.offset.saturating_sub(1) {
            out.push(' ');
        }

        let _ = writeln!(out, "^--- {}", self.message);
        out
    }
}

/// A lookup-time user error: a key that must be unique is repeated, or a
/// key has a type its consumer cannot accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgError {
    NotUnique { key: String },
    TypeMismatch { key: String, found: &'static str, expected: &'static str },
}

impl From<CfgError> for BootError {
    fn from(err: CfgError) -> Self {
        let message = match err {
            CfgError::NotUnique { key } => alloc::format!("\"{key}\" must be unique"),
            CfgError::TypeMismatch {
                key,
                found,
                expected,
            } => alloc::format!("\"{key}\" has an unexpected type of {found}, expected {expected}"),
        };

        BootError::new(message)
    }
}

#[derive(Debug)]
pub struct Config<'src> {
    pub(crate) buffer: Vec<ConfigEntry<'src>>,

    /// Offset + 1 of the first/last loadable entry; 0 means none.
    pub(crate) first_loadable_entry_offset: usize,
    pub(crate) last_loadable_entry_offset: usize,
}

impl<'src> Config<'src> {
    /// Parses `text` into a config tree. On failure the error pinpoints
    /// the offending line and column.
    pub fn parse(text: &'src str) -> Result<Self, ConfigError> {
        parse::parse(text)
    }

    fn find(
        &self,
        scope_offset: Option<usize>,
        key: &str,
        constraint_max: usize,
    ) -> (Option<usize>, usize) {
        let mut offset = match scope_offset {
            None => 0,
            Some(off) => off + 1,
        };

        let mut first = None;
        let mut count = 0;

        while let Some(entry) = self.buffer.get(offset) {
            if entry.kind != EntryKind::Value {
                break;
            }

            if entry.key == key {
                if first.is_none() {
                    first = Some(offset);
                }

                count += 1;

                if constraint_max != 0 && count == constraint_max {
                    break;
                }
            }

            if entry.next_within_same_scope == 0 {
                break;
            }

            offset += entry.next_within_same_scope;
        }

        (first, count)
    }

    fn value_at(&self, offset: usize) -> Value<'src> {
        Value {
            offset,
            data: self.buffer[offset].value,
        }
    }

    fn get_typed(
        &self,
        scope_offset: Option<usize>,
        key: &str,
        mask: ValueType,
        must_be_unique: bool,
    ) -> Result<Option<Value<'src>>, CfgError> {
        let (first, count) = self.find(scope_offset, key, if must_be_unique { 2 } else { 1 });

        let Some(first) = first else {
            return Ok(None);
        };

        if must_be_unique && count > 1 {
            return Err(CfgError::NotUnique { key: key.into() });
        }

        let value = self.value_at(first);
        let ty = value.data.ty();

        if !mask.contains(ty) {
            return Err(CfgError::TypeMismatch {
                key: key.into(),
                found: ty.describe(),
                expected: mask.describe(),
            });
        }

        Ok(Some(value))
    }

    /// A top-level key, outside of any loadable entry.
    pub fn get_global(
        &self,
        key: &str,
        mask: ValueType,
        must_be_unique: bool,
    ) -> Result<Option<Value<'src>>, CfgError> {
        self.get_typed(None, key, mask, must_be_unique)
    }

    /// A direct child of a loadable entry.
    pub fn entry_child(
        &self,
        entry: &LoadableEntry<'src>,
        key: &str,
        mask: ValueType,
        must_be_unique: bool,
    ) -> Result<Option<Value<'src>>, CfgError> {
        self.get_typed(Some(entry.offset), key, mask, must_be_unique)
    }

    /// A direct child of an object value.
    pub fn value_child(
        &self,
        value: &Value<'src>,
        key: &str,
        mask: ValueType,
        must_be_unique: bool,
    ) -> Result<Option<Value<'src>>, CfgError> {
        debug_assert!(value.is_object());
        self.get_typed(Some(value.offset), key, mask, must_be_unique)
    }

    pub fn contains_entry_child(&self, entry: &LoadableEntry<'src>, key: &str) -> bool {
        self.find(Some(entry.offset), key, 1).1 > 0
    }

    /// The next value of the same key within the scope `cursor` came
    /// from. A value of a mismatching type is a user error when
    /// `type_oops` is set and silently skipped otherwise.
    pub fn next_of_key(
        &self,
        cursor: &Value<'src>,
        mask: ValueType,
        type_oops: bool,
    ) -> Result<Option<Value<'src>>, CfgError> {
        let mut offset = cursor.offset;
        let key = self.buffer[offset].key;

        loop {
            let entry = &self.buffer[offset];

            if entry.next_within_same_scope == 0 {
                return Ok(None);
            }

            offset += entry.next_within_same_scope;

            let entry = &self.buffer[offset];

            if entry.kind != EntryKind::Value || entry.key != key {
                if entry.kind != EntryKind::Value {
                    return Ok(None);
                }
                continue;
            }

            let ty = entry.value.ty();
            if !mask.contains(ty) {
                if type_oops {
                    return Err(CfgError::TypeMismatch {
                        key: key.into(),
                        found: ty.describe(),
                        expected: mask.describe(),
                    });
                }

                continue;
            }

            return Ok(Some(self.value_at(offset)));
        }
    }

    pub fn first_loadable_entry(&self) -> Option<LoadableEntry<'src>> {
        if self.first_loadable_entry_offset == 0 {
            return None;
        }

        let offset = self.first_loadable_entry_offset - 1;
        Some(LoadableEntry {
            name: self.buffer[offset].key,
            offset,
        })
    }

    pub fn next_loadable_entry(
        &self,
        entry: &LoadableEntry<'src>,
    ) -> Option<LoadableEntry<'src>> {
        let delta = self.buffer[entry.offset].next_loadable_entry;

        if delta == 0 {
            return None;
        }

        let offset = entry.offset + delta;
        Some(LoadableEntry {
            name: self.buffer[offset].key,
            offset,
        })
    }

    /// Finds a loadable entry by name.
    pub fn get_loadable_entry(&self, name: &str) -> Option<LoadableEntry<'src>> {
        let mut entry = self.first_loadable_entry()?;

        loop {
            if entry.name == name {
                return Some(entry);
            }

            entry = self.next_loadable_entry(&entry)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Config<'_> {
        Config::parse(text).expect("config must parse")
    }

    #[test]
    fn flat_globals() {
        let cfg = parse("default-entry = main\ntimeout = 5\n");

        let v = cfg
            .get_global("default-entry", ValueType::STRING, true)
            .unwrap()
            .unwrap();
        assert_eq!(v.as_str(), Some("main"));

        let v = cfg
            .get_global("timeout", ValueType::UNSIGNED, true)
            .unwrap()
            .unwrap();
        assert_eq!(v.as_unsigned(), Some(5));
    }

    #[test]
    fn value_kinds() {
        let cfg = parse(
            "a = true\nb = false\nc = null\nd = -42\ne = 0x1000\nf = hello\ng = \"true\"\nh = 'spaced value'\n",
        );

        let get = |k: &str| cfg.get_global(k, ValueType::ANY, true).unwrap().unwrap();

        assert_eq!(get("a").as_bool(), Some(true));
        assert_eq!(get("b").as_bool(), Some(false));
        assert!(get("c").is_null());
        assert_eq!(get("d").data, ValueData::Signed(-42));
        assert_eq!(get("e").as_unsigned(), Some(0x1000));
        assert_eq!(get("f").as_str(), Some("hello"));

        // Quoting escapes keyword recognition.
        assert_eq!(get("g").as_str(), Some("true"));
        assert_eq!(get("h").as_str(), Some("spaced value"));
    }

    #[test]
    fn loadable_entries_and_children() {
        let cfg = parse(
            "default-entry = second\n\
             [first]\n\
             binary = /a\n\
             [second]\n\
             binary = /b\n\
             cmdline = hello\n",
        );

        let first = cfg.first_loadable_entry().unwrap();
        assert_eq!(first.name, "first");

        let second = cfg.next_loadable_entry(&first).unwrap();
        assert_eq!(second.name, "second");
        assert!(cfg.next_loadable_entry(&second).is_none());

        let v = cfg
            .entry_child(&second, "binary", ValueType::STRING, true)
            .unwrap()
            .unwrap();
        assert_eq!(v.as_str(), Some("/b"));

        // Keys of one entry are not visible from another.
        assert!(cfg
            .entry_child(&first, "cmdline", ValueType::STRING, true)
            .unwrap()
            .is_none());

        // Globals stop at the first loadable entry.
        assert!(cfg
            .get_global("binary", ValueType::STRING, true)
            .unwrap()
            .is_none());
    }

    #[test]
    fn nested_objects() {
        let cfg = parse(
            "[entry]\n\
             binary:\n\
             \x20\x20path = /boot/kernel\n\
             \x20\x20allocate-anywhere = true\n\
             module = /initrd\n",
        );

        let entry = cfg.first_loadable_entry().unwrap();
        let binary = cfg
            .entry_child(&entry, "binary", ValueType::OBJECT, true)
            .unwrap()
            .unwrap();

        let path = cfg
            .value_child(&binary, "path", ValueType::STRING, true)
            .unwrap()
            .unwrap();
        assert_eq!(path.as_str(), Some("/boot/kernel"));

        let anywhere = cfg
            .value_child(&binary, "allocate-anywhere", ValueType::BOOLEAN, true)
            .unwrap()
            .unwrap();
        assert_eq!(anywhere.as_bool(), Some(true));

        // The object's children are not visible at entry level...
        assert!(cfg
            .entry_child(&entry, "path", ValueType::STRING, true)
            .unwrap()
            .is_none());

        // ...while its sibling is.
        let module = cfg
            .entry_child(&entry, "module", ValueType::STRING, true)
            .unwrap()
            .unwrap();
        assert_eq!(module.as_str(), Some("/initrd"));
    }

    #[test]
    fn repeated_keys_iterate_in_order() {
        let cfg = parse(
            "[e]\n\
             module = /a\n\
             other = 1\n\
             module = /b\n\
             module = /c\n",
        );

        let entry = cfg.first_loadable_entry().unwrap();
        let mut v = cfg
            .entry_child(&entry, "module", ValueType::STRING, false)
            .unwrap()
            .unwrap();
        let mut seen = alloc::vec![v.as_str().unwrap()];

        while let Some(next) = cfg.next_of_key(&v, ValueType::STRING, true).unwrap() {
            seen.push(next.as_str().unwrap());
            v = next;
        }

        assert_eq!(seen, ["/a", "/b", "/c"]);
    }

    #[test]
    fn unique_violation_is_reported() {
        let cfg = parse("[e]\nstack = auto\nstack = auto\n");
        let entry = cfg.first_loadable_entry().unwrap();

        assert!(matches!(
            cfg.entry_child(&entry, "stack", ValueType::ANY, true),
            Err(CfgError::NotUnique { .. })
        ));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let cfg = parse("[e]\ncmdline = 5\n");
        let entry = cfg.first_loadable_entry().unwrap();

        assert!(matches!(
            cfg.entry_child(&entry, "cmdline", ValueType::STRING, true),
            Err(CfgError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn idempotent_parse() {
        let text = "default-entry = main\n[main]\nbinary:\n\tpath = /k\nmodule = /m\n";
        let a = parse(text);
        let b = parse(text);

        assert_eq!(a.buffer.len(), b.buffer.len());

        for (x, y) in a.buffer.iter().zip(b.buffer.iter()) {
            assert_eq!(x.key, y.key);
            assert_eq!(x.value, y.value);
            assert_eq!(x.next_within_same_scope, y.next_within_same_scope);
        }
    }
}
