//! The host reflection collaborator.
//!
//! Everything the bridge needs from the host object model is expressed as
//! the [`HostReflect`] trait: validity and assignability queries, constructor
//! enumeration and invocation, default construction for value types, generic
//! binding, reflected subtype emission, and object pinning. Bridge code is
//! monomorphized over `impl HostReflect`, so a production embedding and the
//! in-memory [`ModelHost`](crate::model::ModelHost) pay no dispatch cost.
//!
//! Tokens crossing the boundary are opaque newtypes. The host hands them out
//! and is the only party that can interpret them; the bridge stores, compares,
//! and returns them.

use std::fmt;

use smallvec::SmallVec;
use strum::{Display, IntoStaticStr};

/// Opaque reference to host reflective metadata for one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ClassToken(u32);

impl ClassToken {
    /// Creates a class token from a raw integer.
    #[must_use]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw integer identifier.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Opaque reference to one live host object instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ObjectToken(u64);

impl ObjectToken {
    /// Creates an object token from a raw integer.
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer identifier.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Opaque reference to one host constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CtorId(u32);

impl CtorId {
    /// Creates a constructor id from a raw integer.
    #[must_use]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw integer identifier.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A pinning handle returned by [`HostReflect::pin`] or [`HostReflect::pin_class`].
///
/// While a handle is live the host garbage collector must not reclaim the
/// pinned object, even if the only remaining reference to it is the guest-side
/// proxy. Handles are released exactly once, on the guest deallocation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RawHandle(u64);

impl RawHandle {
    /// Creates a handle from a raw integer.
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer identifier.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Kind of a host class, as reported by reflection.
///
/// The kind determines subclassability and which instantiation path applies:
/// value types take the default-construction shortcut, and delegates, enums,
/// and arrays refuse guest subclasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum ClassKind {
    Class,
    Interface,
    /// A value type other than a primitive, enum, or the decimal type.
    ValueType,
    Primitive,
    Enum,
    Delegate,
    Array,
    /// The host's fixed-point decimal type.
    Decimal,
}

/// Parameter type of a host constructor, as seen by overload resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HostType {
    Bool,
    Int,
    Float,
    Str,
    /// A reference to an instance of the given class or any assignable subtype.
    Object(ClassToken),
}

/// A raw host value passed to or returned from constructor invocation.
///
/// These are deliberately unwrapped: the instantiation engine returns raw
/// host objects because only the allocating caller knows which proxy type
/// should wrap the result.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum HostValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Object(ObjectToken),
}

/// Failure category reported by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HostErrorKind {
    /// An argument was rejected by the host (wrong type, out of range shape).
    InvalidArgument,
    /// Arithmetic overflow inside host construction.
    Overflow,
    /// The class's assembly was unloaded between lookup and use.
    ClassUnloaded,
    /// A constructor body threw. The interesting cause is nested inside.
    Invocation,
    /// The host cannot perform the requested reflective operation.
    Unsupported,
}

/// A host-side error, possibly wrapping an inner cause.
///
/// Host invocation layers tend to wrap the real failure (a reflection
/// invocation wrapper around the constructor's own exception); callers use
/// [`HostError::unwrap_innermost`] to reach the cause worth reporting.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HostError {
    kind: HostErrorKind,
    message: String,
    inner: Option<Box<HostError>>,
}

impl HostError {
    /// Creates a leaf error with no inner cause.
    #[must_use]
    pub fn new(kind: HostErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            inner: None,
        }
    }

    /// Wraps an existing error as the inner cause of a new one.
    #[must_use]
    pub fn wrapping(kind: HostErrorKind, message: impl Into<String>, inner: Self) -> Self {
        Self {
            kind,
            message: message.into(),
            inner: Some(Box::new(inner)),
        }
    }

    /// Returns the failure category.
    #[must_use]
    pub fn kind(&self) -> HostErrorKind {
        self.kind
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Walks the inner-cause chain to the deepest error.
    #[must_use]
    pub fn unwrap_innermost(&self) -> &Self {
        let mut current = self;
        while let Some(inner) = &current.inner {
            current = inner;
        }
        current
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, " (caused by: {inner})")?;
        }
        Ok(())
    }
}

impl std::error::Error for HostError {}

/// Reflective access to the host object model.
///
/// All methods are synchronous and assumed fast; the caller holds the guest
/// interpreter's global lock for the duration of any call. Implementations
/// must not call back into the bridge from inside these methods.
pub trait HostReflect {
    /// Returns whether the class's metadata is still loaded and usable.
    fn class_is_valid(&self, class: ClassToken) -> bool;

    /// Returns the class's display name for error messages and reprs.
    fn class_name(&self, class: ClassToken) -> &str;

    /// Returns the reflective kind of the class.
    fn class_kind(&self, class: ClassToken) -> ClassKind;

    /// Returns whether guest code may subclass this class.
    ///
    /// Delegates, enums, and array types answer false; the host may refuse
    /// others (sealed classes) as well.
    fn can_subclass(&self, class: ClassToken) -> bool;

    /// Returns whether `derived` is assignable to `base` in host metadata.
    ///
    /// This is the authoritative subtype relation for reflected classes; a
    /// class is assignable to itself.
    fn is_assignable_from(&self, base: ClassToken, derived: ClassToken) -> bool;

    /// Returns whether the class is an open generic definition.
    fn is_generic_definition(&self, class: ClassToken) -> bool;

    /// Binds an open generic definition to concrete argument classes.
    ///
    /// Returns `None` when the class is not generic or the argument count
    /// does not match its parameters.
    fn bind_generic(&mut self, class: ClassToken, args: &[ClassToken]) -> Option<ClassToken>;

    /// Enumerates the class's public constructors.
    ///
    /// Value-type default constructors are typically invisible here; the
    /// instantiation engine handles them through [`Self::default_construct`].
    fn constructors(&self, class: ClassToken) -> SmallVec<[CtorId; 4]>;

    /// Returns the parameter types of a constructor.
    fn constructor_params(&self, ctor: CtorId) -> &[HostType];

    /// Returns the class that declares a constructor.
    fn constructor_owner(&self, ctor: CtorId) -> ClassToken;

    /// Invokes one constructor with already-converted arguments.
    fn invoke_constructor(&mut self, ctor: CtorId, args: &[HostValue]) -> Result<ObjectToken, HostError>;

    /// Constructs a value type through the host's default-construction path.
    fn default_construct(&mut self, class: ClassToken) -> Result<ObjectToken, HostError>;

    /// Emits a reflected subtype of `base` that host code can dispatch into.
    ///
    /// Called when a guest class statement names a target assembly and
    /// namespace. The emitted class is a real host class; the bridge wraps it
    /// like any other.
    fn create_reflected_subtype(
        &mut self,
        name: &str,
        base: ClassToken,
        assembly: &str,
        namespace: &str,
    ) -> Result<ClassToken, HostError>;

    /// Pins a host object, keeping it alive until the handle is released.
    fn pin(&mut self, object: ObjectToken) -> RawHandle;

    /// Pins a class's reflective metadata object.
    fn pin_class(&mut self, class: ClassToken) -> RawHandle;

    /// Resolves a live handle back to the object it pins.
    ///
    /// Returns `None` for class-metadata handles and released handles.
    fn resolve_handle(&self, handle: RawHandle) -> Option<ObjectToken>;

    /// Releases a pinning handle. Each handle is released at most once.
    fn release(&mut self, handle: RawHandle);
}
