#![doc = include_str!("../../../README.md")]
#![expect(clippy::struct_excessive_bools, reason = "capability flags mirror guest type-flag fields")]

mod args;
mod binder;
mod descriptor;
mod exception;
mod host;
mod instantiate;
mod intern;
mod metatype;
mod model;
mod tracer;
mod typeobj;
mod value;

pub use crate::{
    args::{CallArgs, render_arg_types},
    binder::{BindView, Bound, OverloadBinder, ReflectBinder},
    descriptor::{ClassDescriptor, DescriptorId, DescriptorTable},
    exception::{BridgeResult, ErrorState, ExcKind, GuestException},
    host::{
        ClassKind, ClassToken, CtorId, HostError, HostErrorKind, HostReflect, HostType, HostValue, ObjectToken,
        RawHandle,
    },
    intern::{Interns, StaticNames, StringId},
    metatype::{Bridge, BridgeConfig, HandleCopyPolicy, MetaSnapshot},
    model::ModelHost,
    tracer::{BridgeTracer, NoopTracer, RecordingTracer, StderrTracer, TraceEvent},
    typeobj::{
        InstanceId, InstanceSlot, InstanceTable, Member, ProxyInstance, ProxyType, SetCapability, SlotEntry, Thunk,
        ThunkRegistry, TypeBuilder, TypeFlags, TypeId, TypeSlots, TypeTable,
    },
    value::GuestValue,
};
