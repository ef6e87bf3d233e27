//! Guest-side values as the bridge sees them.
//!
//! The bridge does not implement the guest runtime's full value model; it
//! only needs to inspect arguments, store members, and hand back proxy
//! references. [`GuestValue`] covers exactly that surface: the immediate
//! scalar kinds plus references into the bridge's type and instance tables.
//!
//! Reference counting for `Type` and `Instance` values is owned by the
//! respective tables; code that stores or discards such a value goes through
//! the bridge's clone/release helpers rather than copying ids silently.

use std::borrow::Cow;

use crate::typeobj::{InstanceId, InstanceTable, TypeId, TypeTable};

/// A guest value crossing the bridge boundary.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum GuestValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A reference to a proxy type object.
    Type(TypeId),
    /// A reference to a proxy instance.
    Instance(InstanceId),
}

impl GuestValue {
    /// Returns the guest-visible type name of this value.
    ///
    /// Used by error messages; never allocates for scalar kinds.
    #[must_use]
    pub fn kind_name(&self, types: &TypeTable, instances: &InstanceTable) -> Cow<'static, str> {
        match self {
            Self::None => Cow::Borrowed("NoneType"),
            Self::Bool(_) => Cow::Borrowed("bool"),
            Self::Int(_) => Cow::Borrowed("int"),
            Self::Float(_) => Cow::Borrowed("float"),
            Self::Str(_) => Cow::Borrowed("str"),
            Self::Type(id) => Cow::Owned(types.get(*id).name().to_owned()),
            Self::Instance(id) => {
                let type_id = instances.get(*id).type_id();
                Cow::Owned(types.get(type_id).name().to_owned())
            }
        }
    }

    /// Returns the referenced type id, if this value is a type object.
    #[must_use]
    pub fn as_type(&self) -> Option<TypeId> {
        match self {
            Self::Type(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns the referenced instance id, if this value is a proxy instance.
    #[must_use]
    pub fn as_instance(&self) -> Option<InstanceId> {
        match self {
            Self::Instance(id) => Some(*id),
            _ => None,
        }
    }
}
