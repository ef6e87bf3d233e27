//! Constructor selection and invocation for host classes.
//!
//! Given a class descriptor and guest-supplied arguments, the engine
//! produces a raw host object. It returns the unwrapped [`ObjectToken`]
//! rather than a finished guest value: only the allocating caller knows
//! which proxy type, base or guest subclass, should wrap the result.
//!
//! Overload selection itself is delegated to an [`OverloadBinder`]; this
//! module owns the sequencing around it: the value-type shortcut, the
//! zero-argument fallback for guest subclasses, error rendering, and the
//! single invocation with innermost-cause unwrapping.

use smallvec::{SmallVec, smallvec};

use crate::{
    args::{CallArgs, render_arg_types},
    binder::{BindView, OverloadBinder},
    descriptor::{DescriptorId, DescriptorTable},
    exception::{BridgeResult, ErrorState, GuestException},
    host::{ClassKind, CtorId, HostReflect, ObjectToken},
    tracer::{BridgeTracer, TraceEvent},
    typeobj::{InstanceTable, TypeTable},
};

/// Borrowed bridge state the engine runs against.
pub(crate) struct EngineCtx<'a, Tr: BridgeTracer> {
    pub descriptors: &'a DescriptorTable,
    pub types: &'a TypeTable,
    pub instances: &'a InstanceTable,
    pub errors: &'a mut ErrorState,
    pub tracer: &'a mut Tr,
}

/// Produces a host object for a descriptor and guest arguments.
///
/// `preselected` narrows binding to a single already-chosen constructor;
/// callers pass it when reflection has identified the overload up front.
pub(crate) fn instantiate<Tr: BridgeTracer>(
    ctx: EngineCtx<'_, Tr>,
    host: &mut impl HostReflect,
    binder: &impl OverloadBinder,
    descriptor: DescriptorId,
    args: &CallArgs,
    preselected: Option<CtorId>,
) -> BridgeResult<ObjectToken> {
    let entry = ctx.descriptors.get(descriptor);
    let class = entry.class();

    // Value-type default constructors are invisible to reflective
    // enumeration, so zero-argument construction goes straight through the
    // host's default-construction path. ClassKind::ValueType already
    // excludes primitives, enums, and the decimal type.
    if entry.kind() == ClassKind::ValueType && args.is_empty() {
        ctx.tracer.record(TraceEvent::DefaultConstructed { class });
        return host.default_construct(class).map_err(|err| GuestException::from_host(&err));
    }

    let view = BindView {
        types: ctx.types,
        instances: ctx.instances,
        descriptors: ctx.descriptors,
    };
    let candidates: SmallVec<[CtorId; 4]> = match preselected {
        Some(ctor) => smallvec![ctor],
        None => host.constructors(class),
    };

    let mut bound = binder.bind(host, view, &candidates, args);

    // A guest subclass's creation step receives the combined constructor and
    // initializer arguments. If nothing binds and a no-argument constructor
    // exists, assume the arguments were meant for the guest-defined
    // initializer. Never second-guess a preselected constructor.
    if bound.is_none() && preselected.is_none() && !args.is_empty() {
        bound = binder.bind(host, view, &candidates, &CallArgs::Empty);
    }

    let Some(bound) = bound else {
        // Rendering argument types walks the tables only; save and restore
        // the pending error slot so a failure already in flight survives.
        let saved = ctx.errors.fetch();
        let rendered = render_arg_types(args, ctx.types, ctx.instances);
        ctx.errors.restore(saved);
        // A preselected candidate names its declaring class, which may be a
        // base of the class being instantiated; otherwise the instantiated
        // class itself is named.
        let class_name = match preselected {
            Some(ctor) => host.class_name(host.constructor_owner(ctor)).to_owned(),
            None => entry.name().to_owned(),
        };
        return Err(GuestException::no_constructor_match(Some(&class_name), &rendered));
    };

    ctx.tracer.record(TraceEvent::ConstructorBound { ctor: bound.ctor });
    match host.invoke_constructor(bound.ctor, &bound.converted) {
        Ok(object) => {
            ctx.tracer.record(TraceEvent::ConstructorInvoked {
                ctor: bound.ctor,
                ok: true,
            });
            Ok(object)
        }
        Err(err) => {
            ctx.tracer.record(TraceEvent::ConstructorInvoked {
                ctor: bound.ctor,
                ok: false,
            });
            Err(GuestException::from_host(&err))
        }
    }
}
