//! String interning for member names and error messages.
//!
//! The bridge looks up the same handful of attribute names on every type
//! operation, so names are stored once and referenced by `StringId`. Ids for
//! well-known protocol names (`__init__`, `__slots__`, ...) are fixed at
//! compile time via [`StaticNames`]; everything else is interned per bridge.
//!
//! StringIds are laid out as follows:
//! * 0 to count(StaticNames) - well-known protocol and member names
//! * 1000+ - names interned at runtime

use ahash::AHashMap;
use strum::{EnumString, FromRepr, IntoStaticStr};

/// Index into the string interner's storage.
///
/// Uses `u32` to save space. This limits us to ~4 billion unique interns,
/// which is more than sufficient for member names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StringId(u32);

impl StringId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// First id handed out for runtime-interned names.
const RUNTIME_ID_OFFSET: u32 = 1000;

/// Names known at compile time that never need runtime interning.
///
/// The string representation is the guest-visible spelling of the name.
#[repr(u16)]
#[derive(
    Debug, Clone, Copy, FromRepr, EnumString, IntoStaticStr, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum StaticNames {
    #[strum(serialize = "__init__")]
    Init,
    #[strum(serialize = "__new__")]
    New,
    #[strum(serialize = "__slots__")]
    Slots,
    #[strum(serialize = "__dict__")]
    Dict,
    #[strum(serialize = "__name__")]
    Name,
    #[strum(serialize = "__bases__")]
    Bases,
    /// Namespace key naming the host assembly a reflected subtype is emitted into.
    #[strum(serialize = "__assembly__")]
    Assembly,
    /// Namespace key naming the host namespace a reflected subtype is emitted into.
    #[strum(serialize = "__namespace__")]
    Namespace,
    #[strum(serialize = "__instancecheck__")]
    InstanceCheck,
    #[strum(serialize = "__subclasscheck__")]
    SubclassCheck,
    #[strum(serialize = "__class_getitem__")]
    ClassGetItem,
}

impl StaticNames {
    /// Returns the guest-visible spelling of this name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

impl From<StaticNames> for StringId {
    fn from(name: StaticNames) -> Self {
        Self(name as u32)
    }
}

/// Append-only string interner.
///
/// Interning the same string twice returns the same id, so member-name
/// comparison is an integer compare. Lookups are only needed for error
/// messages and display output.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Interns {
    /// Runtime-interned strings, indexed by `StringId - RUNTIME_ID_OFFSET`.
    strings: Vec<String>,
    /// Reverse lookup from string to id for runtime-interned names.
    lookup: AHashMap<String, StringId>,
}

impl Interns {
    /// Creates an empty interner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its stable id.
    ///
    /// Well-known names resolve to their [`StaticNames`] id without touching
    /// the runtime table.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Ok(known) = s.parse::<StaticNames>() {
            return known.into();
        }
        if let Some(&id) = self.lookup.get(s) {
            return id;
        }
        let id = StringId(RUNTIME_ID_OFFSET + u32::try_from(self.strings.len()).expect("interner overflow"));
        self.strings.push(s.to_owned());
        self.lookup.insert(s.to_owned(), id);
        id
    }

    /// Returns the string for an id.
    ///
    /// # Panics
    /// Panics if the id was not produced by this interner.
    #[must_use]
    pub fn get_str(&self, id: StringId) -> &str {
        if id.0 < RUNTIME_ID_OFFSET {
            let known = StaticNames::from_repr(u16::try_from(id.0).expect("static name id out of range"))
                .expect("invalid static name id");
            known.as_str()
        } else {
            &self.strings[(id.0 - RUNTIME_ID_OFFSET) as usize]
        }
    }

    /// Returns the number of runtime-interned strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns whether no runtime strings have been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
