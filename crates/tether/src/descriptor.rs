//! Host class descriptors.
//!
//! A [`ClassDescriptor`] is the validity-checked handle through which every
//! bridge component references a host class. The wrapped token, display name,
//! and kind are bound exactly once; only the validity flag ever changes, and
//! only from valid to invalid, when the host reports the class's assembly
//! unloaded or reloaded.
//!
//! Descriptors live in a [`DescriptorTable`] and are referenced by
//! [`DescriptorId`]. Binding the same class token twice returns the same id,
//! so descriptor identity comparison is an integer compare. Guest objects
//! never own descriptors; proxy types reference them by id.

use ahash::AHashMap;

use crate::host::{ClassKind, ClassToken, HostReflect};

/// Index into the descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DescriptorId(u32);

impl DescriptorId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A validity-checked handle to one host class's reflective metadata.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClassDescriptor {
    class: ClassToken,
    /// Display name cached at bind time so error messages can name the class
    /// even after its metadata is gone.
    name: String,
    kind: ClassKind,
    valid: bool,
}

impl ClassDescriptor {
    /// Returns the wrapped class token.
    #[must_use]
    pub fn class(&self) -> ClassToken {
        self.class
    }

    /// Returns the class's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the class kind recorded at bind time.
    #[must_use]
    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    /// Returns the cached validity flag.
    ///
    /// Prefer [`DescriptorTable::is_valid`], which also consults the live
    /// host query; the flag alone can lag an unload notification.
    #[must_use]
    pub fn valid_flag(&self) -> bool {
        self.valid
    }
}

/// Table of bound descriptors, keyed by host class token.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct DescriptorTable {
    entries: Vec<ClassDescriptor>,
    by_token: AHashMap<ClassToken, DescriptorId>,
}

impl DescriptorTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a descriptor for a class, reusing an existing binding.
    ///
    /// Name and kind are captured from the host at first bind and never
    /// refreshed afterwards.
    pub fn bind(&mut self, host: &impl HostReflect, class: ClassToken) -> DescriptorId {
        if let Some(&id) = self.by_token.get(&class) {
            return id;
        }
        let id = DescriptorId(u32::try_from(self.entries.len()).expect("descriptor table overflow"));
        self.entries.push(ClassDescriptor {
            class,
            name: host.class_name(class).to_owned(),
            kind: host.class_kind(class),
            valid: host.class_is_valid(class),
        });
        self.by_token.insert(class, id);
        id
    }

    /// Returns a bound descriptor.
    #[must_use]
    pub fn get(&self, id: DescriptorId) -> &ClassDescriptor {
        &self.entries[id.index()]
    }

    /// Returns the descriptor id already bound for a class, if any.
    #[must_use]
    pub fn lookup(&self, class: ClassToken) -> Option<DescriptorId> {
        self.by_token.get(&class).copied()
    }

    /// Returns whether the descriptor is still usable.
    ///
    /// Checks the cached flag first and the live host query second, so an
    /// unload that raced ahead of an invalidation notification still answers
    /// false rather than letting a stale descriptor through.
    #[must_use]
    pub fn is_valid(&self, id: DescriptorId, host: &impl HostReflect) -> bool {
        let entry = &self.entries[id.index()];
        entry.valid && host.class_is_valid(entry.class)
    }

    /// Invalidates the descriptors for the given unloaded classes.
    ///
    /// Tokens without a bound descriptor are ignored. Invalidation is
    /// one-way; a reloaded assembly gets fresh tokens and fresh descriptors.
    pub fn invalidate_unloaded(&mut self, classes: &[ClassToken]) {
        for class in classes {
            if let Some(&id) = self.by_token.get(class) {
                self.entries[id.index()].valid = false;
            }
        }
    }

    /// Invalidates every descriptor in the table.
    pub fn invalidate_all(&mut self) {
        for entry in &mut self.entries {
            entry.valid = false;
        }
    }

    /// Returns the number of bound descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
