//! Guest-side call arguments.
//!
//! Arguments arrive from the guest runtime as a positional tuple plus an
//! optional keyword mapping. [`CallArgs`] deconstructs that shape once, with
//! dedicated variants for the zero/one/two-argument calls that dominate
//! constructor traffic, so the common paths never allocate.

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    exception::{BridgeResult, GuestException},
    typeobj::{InstanceTable, TypeTable},
    value::GuestValue,
};

/// Positional and keyword arguments for one guest-side call.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CallArgs {
    #[default]
    Empty,
    One(GuestValue),
    Two(GuestValue, GuestValue),
    Full {
        args: Vec<GuestValue>,
        kwargs: IndexMap<String, GuestValue>,
    },
}

impl CallArgs {
    /// Builds args from a positional vector, normalizing to the small variants.
    #[must_use]
    pub fn positional(mut args: Vec<GuestValue>) -> Self {
        match args.len() {
            0 => Self::Empty,
            1 => Self::One(args.remove(0)),
            2 => {
                let second = args.pop().expect("length checked above");
                let first = args.pop().expect("length checked above");
                Self::Two(first, second)
            }
            _ => Self::Full {
                args,
                kwargs: IndexMap::new(),
            },
        }
    }

    /// Returns the number of positional arguments.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::One(_) => 1,
            Self::Two(..) => 2,
            Self::Full { args, .. } => args.len(),
        }
    }

    /// Returns whether no positional or keyword arguments were supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::One(_) | Self::Two(..) => false,
            Self::Full { args, kwargs } => args.is_empty() && kwargs.is_empty(),
        }
    }

    /// Returns whether any keyword arguments were supplied.
    #[must_use]
    pub fn has_kwargs(&self) -> bool {
        match self {
            Self::Full { kwargs, .. } => !kwargs.is_empty(),
            _ => false,
        }
    }

    /// Returns the positional arguments as a borrowed slice view.
    #[must_use]
    pub fn positional_view(&self) -> SmallVec<[&GuestValue; 4]> {
        match self {
            Self::Empty => SmallVec::new(),
            Self::One(a) => SmallVec::from_iter([a]),
            Self::Two(a, b) => SmallVec::from_iter([a, b]),
            Self::Full { args, .. } => args.iter().collect(),
        }
    }

    /// Checks that exactly one positional argument was passed, returning it.
    pub fn get_one_arg(&self, name: &str) -> BridgeResult<&GuestValue> {
        match self {
            Self::One(a) => Ok(a),
            Self::Full { args, kwargs } if args.len() == 1 && kwargs.is_empty() => Ok(&args[0]),
            other => Err(GuestException::arg_count(name, 1, other.count())),
        }
    }
}

/// Renders the actual argument types as a parenthesized tuple, e.g. `(int, str)`.
///
/// Used when overload resolution fails. This is a pure rendering over the
/// tables; it never touches the pending error state, which the caller is
/// responsible for saving and restoring around it.
#[must_use]
pub fn render_arg_types(args: &CallArgs, types: &TypeTable, instances: &InstanceTable) -> String {
    let mut rendered = String::from("(");
    for (index, value) in args.positional_view().iter().enumerate() {
        if index > 0 {
            rendered.push_str(", ");
        }
        rendered.push_str(&value.kind_name(types, instances));
    }
    if let CallArgs::Full { kwargs, .. } = args {
        let mut first = args.count() == 0;
        for (key, value) in kwargs {
            if !first {
                rendered.push_str(", ");
            }
            first = false;
            rendered.push_str(key);
            rendered.push('=');
            rendered.push_str(&value.kind_name(types, instances));
        }
    }
    rendered.push(')');
    rendered
}
