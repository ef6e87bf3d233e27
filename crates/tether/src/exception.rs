//! Guest-visible exceptions and the pending-error state.
//!
//! The bridge surfaces every failure synchronously as a [`GuestException`],
//! the shape the embedding interpreter raises to user code. Exception kinds
//! are a closed enum with strum derives so the guest-visible class name is the
//! variant name. Message construction is centralized in helper constructors
//! so call sites never format error text inline.
//!
//! [`ErrorState`] models the guest runtime's pending-error primitive: one
//! slot that operations set on failure and the interpreter fetches when it
//! unwinds. The call protocol clears it before optional lookups, and the
//! instantiation engine saves and restores it around argument-type rendering.

use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

use crate::host::{HostError, HostErrorKind};

/// Result type alias for operations that can raise a guest exception.
pub type BridgeResult<T> = Result<T, GuestException>;

/// Guest exception classes the bridge can raise.
///
/// The string representation matches the variant name exactly, which is also
/// the guest-visible class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum ExcKind {
    TypeError,
    ValueError,
    AttributeError,
    RuntimeError,
    OverflowError,
    /// Internal invariant violations. Not user-recoverable; the operation
    /// that raised it is aborted, never repaired.
    SystemError,
}

/// A guest exception: kind plus rendered message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GuestException {
    kind: ExcKind,
    message: String,
}

impl GuestException {
    /// Creates an exception from a kind and pre-rendered message.
    #[must_use]
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Returns the exception kind.
    #[must_use]
    pub fn kind(&self) -> ExcKind {
        self.kind
    }

    /// Returns the rendered message without the class prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Generic TypeError with a caller-rendered message.
    #[must_use]
    pub fn type_error(msg: impl fmt::Display) -> Self {
        Self::new(ExcKind::TypeError, msg.to_string())
    }

    /// Generic fatal internal error.
    #[must_use]
    pub fn system_error(msg: impl fmt::Display) -> Self {
        Self::new(ExcKind::SystemError, msg.to_string())
    }

    /// More than one base class in a class statement over a managed base.
    #[must_use]
    pub fn multiple_inheritance() -> Self {
        Self::new(ExcKind::TypeError, "cannot use multiple inheritance with managed classes")
    }

    /// The base's type-of-type is neither the bridge metatype nor the guest root.
    #[must_use]
    pub fn invalid_metatype() -> Self {
        Self::new(ExcKind::TypeError, "invalid metatype")
    }

    /// The named host class cannot be used as a base class.
    #[must_use]
    pub fn not_subclassable(class_name: &str, kind: impl fmt::Display) -> Self {
        Self::new(
            ExcKind::TypeError,
            format!("{kind} '{class_name}' cannot be subclassed"),
        )
    }

    /// The named class's host metadata has been unloaded.
    #[must_use]
    pub fn invalid_descriptor(class_name: &str) -> Self {
        Self::new(
            ExcKind::TypeError,
            format!("class '{class_name}' is no longer valid (host metadata unloaded)"),
        )
    }

    /// `__slots__` present in a managed subclass namespace.
    #[must_use]
    pub fn slots_unsupported() -> Self {
        Self::new(ExcKind::TypeError, "__slots__ is not supported on managed classes")
    }

    /// Attribute set through a descriptor that has no set hook.
    #[must_use]
    pub fn read_only_attribute(name: &str) -> Self {
        Self::new(ExcKind::TypeError, format!("attribute '{name}' is read-only"))
    }

    /// Missing attribute on a type object.
    #[must_use]
    pub fn attribute_error(owner: impl fmt::Display, name: &str) -> Self {
        Self::new(
            ExcKind::AttributeError,
            format!("{owner} has no attribute '{name}'"),
        )
    }

    /// Subscript on a type that is not a generic definition.
    #[must_use]
    pub fn unsubscriptable(type_name: &str) -> Self {
        Self::new(
            ExcKind::TypeError,
            format!("'{type_name}' object is unsubscriptable"),
        )
    }

    /// Wrong argument count for a fixed-arity entry point.
    #[must_use]
    pub fn arg_count(name: &str, expected: usize, got: usize) -> Self {
        Self::new(
            ExcKind::TypeError,
            format!("{name}() takes exactly {expected} argument ({got} given)"),
        )
    }

    /// Overload resolution found no constructor for the supplied arguments.
    ///
    /// `declaring_class` is included only when a single candidate was
    /// preselected by the caller. `arg_types` is the rendered tuple of actual
    /// argument type names, e.g. `(int, str)`.
    #[must_use]
    pub fn no_constructor_match(declaring_class: Option<&str>, arg_types: &str) -> Self {
        let message = match declaring_class {
            Some(class_name) => {
                format!("{class_name}: no constructor matches given arguments: {arg_types}")
            }
            None => format!("no constructor matches given arguments: {arg_types}"),
        };
        Self::new(ExcKind::TypeError, message)
    }

    /// Maps a host-side failure to a guest exception.
    ///
    /// The error is unwrapped to its innermost cause first; the outer wrapper
    /// layers a host invocation adds carry no information the guest can act on.
    #[must_use]
    pub fn from_host(err: &HostError) -> Self {
        let inner = err.unwrap_innermost();
        let kind = match inner.kind() {
            HostErrorKind::InvalidArgument => ExcKind::TypeError,
            HostErrorKind::Overflow => ExcKind::OverflowError,
            HostErrorKind::ClassUnloaded => ExcKind::TypeError,
            HostErrorKind::Invocation | HostErrorKind::Unsupported => ExcKind::RuntimeError,
        };
        Self::new(kind, inner.message().to_owned())
    }
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for GuestException {}

/// The guest runtime's pending-error slot.
///
/// Mirrors the error-state get/clear/restore primitives the interpreter
/// exposes. The bridge owns one instance and uses it for the two contracts
/// that reference pending state: clearing lookup errors before the optional
/// initializer call, and keeping error state undisturbed while rendering
/// argument types for constructor-mismatch messages.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ErrorState {
    pending: Option<GuestException>,
}

impl ErrorState {
    /// Creates an empty error state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pending exception, replacing any previous one.
    pub fn set(&mut self, exc: GuestException) {
        self.pending = Some(exc);
    }

    /// Takes the pending exception, leaving the slot clear.
    pub fn fetch(&mut self) -> Option<GuestException> {
        self.pending.take()
    }

    /// Clears the pending exception without inspecting it.
    pub fn clear(&mut self) {
        self.pending = None;
    }

    /// Restores a previously fetched exception (or clears if `None`).
    pub fn restore(&mut self, saved: Option<GuestException>) {
        self.pending = saved;
    }

    /// Returns whether an exception is pending.
    #[must_use]
    pub fn occurred(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns the pending exception without clearing it.
    #[must_use]
    pub fn pending(&self) -> Option<&GuestException> {
        self.pending.as_ref()
    }
}
