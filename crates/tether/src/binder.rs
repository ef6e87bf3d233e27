//! Overload resolution for constructor candidates.
//!
//! The general binding machinery shared by all callable members is an
//! external collaborator; the instantiation engine consumes it through
//! [`OverloadBinder`] and never inspects candidate signatures itself.
//! [`ReflectBinder`] is the default implementation shipped with the crate:
//! exact-arity filtering, per-parameter conversion costs, lowest total cost
//! wins, declaration order breaks ties.

use smallvec::SmallVec;

use crate::{
    args::CallArgs,
    descriptor::DescriptorTable,
    host::{CtorId, HostReflect, HostType, HostValue},
    typeobj::{InstanceTable, TypeTable},
    value::GuestValue,
};

/// A successful binding: the selected constructor and converted arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    /// The selected constructor.
    pub ctor: CtorId,
    /// Arguments converted to host values, in parameter order.
    pub converted: SmallVec<[HostValue; 4]>,
}

/// Read-only runtime context a binder needs to classify argument values.
#[derive(Debug, Clone, Copy)]
pub struct BindView<'a> {
    pub types: &'a TypeTable,
    pub instances: &'a InstanceTable,
    pub descriptors: &'a DescriptorTable,
}

/// Binds guest arguments against a constructor candidate set.
pub trait OverloadBinder {
    /// Selects the best-matching candidate and converts the arguments.
    ///
    /// Returns `None` when no candidate accepts the arguments. Binding must
    /// not invoke anything on the host beyond metadata queries.
    fn bind(
        &self,
        host: &impl HostReflect,
        view: BindView<'_>,
        candidates: &[CtorId],
        args: &CallArgs,
    ) -> Option<Bound>;
}

/// Conversion cost of one argument to one parameter type.
///
/// Exact matches cost nothing; lossless widenings cost one. Anything else
/// fails the candidate.
fn convert(
    host: &impl HostReflect,
    view: BindView<'_>,
    value: &GuestValue,
    param: HostType,
) -> Option<(HostValue, u32)> {
    match (value, param) {
        (GuestValue::Bool(b), HostType::Bool) => Some((HostValue::Bool(*b), 0)),
        (GuestValue::Int(i), HostType::Int) => Some((HostValue::Int(*i), 0)),
        (GuestValue::Int(i), HostType::Float) => Some((HostValue::Float(*i as f64), 1)),
        (GuestValue::Float(f), HostType::Float) => Some((HostValue::Float(*f), 0)),
        (GuestValue::Str(s), HostType::Str) => Some((HostValue::Str(s.clone()), 0)),
        (GuestValue::None, HostType::Object(_)) => Some((HostValue::Null, 1)),
        (GuestValue::Instance(id), HostType::Object(param_class)) => {
            let instance = view.instances.get(*id);
            let descriptor = view.types.get(instance.type_id()).descriptor()?;
            let arg_class = view.descriptors.get(descriptor).class();
            if !host.is_assignable_from(param_class, arg_class) {
                return None;
            }
            let object = instance.host_object()?;
            let cost = u32::from(arg_class != param_class);
            Some((HostValue::Object(object), cost))
        }
        _ => None,
    }
}

/// Default binder: arity filter plus conversion-cost ranking.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReflectBinder;

impl OverloadBinder for ReflectBinder {
    fn bind(
        &self,
        host: &impl HostReflect,
        view: BindView<'_>,
        candidates: &[CtorId],
        args: &CallArgs,
    ) -> Option<Bound> {
        // Constructors bind positionally; named-argument support belongs to
        // the general method binder.
        if args.has_kwargs() {
            return None;
        }
        let positional = args.positional_view();
        let mut best: Option<(u32, Bound)> = None;
        for &ctor in candidates {
            let params = host.constructor_params(ctor);
            if params.len() != positional.len() {
                continue;
            }
            let mut converted: SmallVec<[HostValue; 4]> = SmallVec::with_capacity(params.len());
            let mut total_cost = 0u32;
            let mut matched = true;
            for (value, &param) in positional.iter().zip(params) {
                match convert(host, view, value, param) {
                    Some((host_value, cost)) => {
                        converted.push(host_value);
                        total_cost += cost;
                    }
                    None => {
                        matched = false;
                        break;
                    }
                }
            }
            if !matched {
                continue;
            }
            // Strictly-lower cost wins; ties keep the earliest declaration.
            if best.as_ref().is_none_or(|(cost, _)| total_cost < *cost) {
                best = Some((total_cost, Bound { ctor, converted }));
            }
        }
        best.map(|(_, bound)| bound)
    }
}
