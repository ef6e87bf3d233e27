//! The type bridge: proxy types for host classes and the metatype protocol.
//!
//! [`Bridge`] owns the guest-side state of the bridge: the descriptor table,
//! the type and instance tables, the interner, the thunk registry, and the
//! pending-error slot. Its methods are the entry points the guest runtime
//! dispatches into: type creation (`type_new`), the call protocol
//! (`type_call`), attribute assignment (`type_setattro`), indexing
//! (`type_subscript`), the instance/subclass checks, and the deallocation
//! chain.
//!
//! # Locking
//!
//! The guest interpreter is serialized by a single global lock. The bridge
//! performs no locking of its own; every method assumes the caller holds
//! that lock for the duration of the call. Host threads calling back into
//! guest objects must acquire it first.
//!
//! # The singleton metatype
//!
//! `bootstrap` builds two type objects: the guest root type (standing in for
//! the interpreter's own `type`) and the singleton metatype whose instances
//! are the proxy types. The metatype's instance/subclass checks are attached
//! as native thunks under fixed names, so a persisted interpreter image can
//! re-attach them verbatim on restore.

use ahash::AHashMap;
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    args::CallArgs,
    binder::OverloadBinder,
    descriptor::{DescriptorId, DescriptorTable},
    exception::{BridgeResult, ErrorState, GuestException},
    host::{ClassToken, CtorId, HostReflect, ObjectToken},
    instantiate::{EngineCtx, instantiate},
    intern::{Interns, StaticNames, StringId},
    tracer::{BridgeTracer, NoopTracer, TraceEvent},
    typeobj::{
        InstanceId, InstanceTable, Member, SetCapability, SlotEntry, Thunk, ThunkRegistry, TypeBuilder, TypeFlags,
        TypeId, TypeSlots, TypeTable,
    },
    value::GuestValue,
};

/// Display name of the singleton metatype.
const META_TYPE_NAME: &str = "MetaType";
/// Display name of the guest root type object.
const GUEST_ROOT_NAME: &str = "type";

/// When subclass creation copies the type-level handle value from the base.
///
/// The handle slot offset is copied at every level under both policies; only
/// the value copy differs. See DESIGN.md for the rationale behind the
/// default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HandleCopyPolicy {
    /// Copy the handle value from the immediate base at every subclass level.
    #[default]
    EveryLevel,
    /// Copy the handle value only when the base is a root proxy.
    BridgePoint,
}

/// Bridge configuration.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct BridgeConfig {
    pub handle_copy_policy: HandleCopyPolicy,
}

/// Persisted identity of the singleton metatype.
///
/// Captured before interpreter teardown and used to reconstruct the
/// singleton exactly on restore, including re-attaching its native entry
/// points under the same fixed names.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetaSnapshot {
    meta: TypeId,
    name: String,
    thunks: Vec<(String, Thunk)>,
}

impl MetaSnapshot {
    /// Returns the persisted metatype id.
    #[must_use]
    pub fn meta(&self) -> TypeId {
        self.meta
    }

    /// Encodes the snapshot as postcard bytes.
    pub fn to_bytes(&self) -> BridgeResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|err| GuestException::system_error(format!("snapshot encode failed: {err}")))
    }

    /// Decodes a snapshot from postcard bytes.
    pub fn from_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        postcard::from_bytes(bytes).map_err(|err| GuestException::system_error(format!("snapshot decode failed: {err}")))
    }
}

/// Whether a check compares type-vs-type or instance-vs-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckMode {
    Instance,
    Subclass,
}

impl CheckMode {
    fn entry_name(self) -> &'static str {
        match self {
            Self::Instance => StaticNames::InstanceCheck.as_str(),
            Self::Subclass => StaticNames::SubclassCheck.as_str(),
        }
    }
}

/// The type bridge engine.
///
/// Generic over the tracer so the no-op default compiles away. The host
/// reflection collaborator and the overload binder are passed per call; the
/// bridge never owns them.
#[derive(Debug)]
pub struct Bridge<Tr: BridgeTracer = NoopTracer> {
    config: BridgeConfig,
    interns: Interns,
    descriptors: DescriptorTable,
    types: TypeTable,
    instances: InstanceTable,
    thunks: ThunkRegistry,
    errors: ErrorState,
    /// Weak registry of root proxies by descriptor; entries are removed on
    /// type deallocation, so a hit is always live.
    wrappers: AHashMap<DescriptorId, TypeId>,
    guest_root: Option<TypeId>,
    meta: Option<TypeId>,
    tracer: Tr,
}

impl Bridge<NoopTracer> {
    /// Creates a bridge with default configuration and no tracing.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracer(NoopTracer)
    }

    /// Creates a bridge with the given configuration and no tracing.
    #[must_use]
    pub fn with_config(config: BridgeConfig) -> Self {
        let mut bridge = Self::new();
        bridge.config = config;
        bridge
    }
}

impl Default for Bridge<NoopTracer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tr: BridgeTracer> Bridge<Tr> {
    /// Creates a bridge with the given tracer.
    #[must_use]
    pub fn with_tracer(tracer: Tr) -> Self {
        Self {
            config: BridgeConfig::default(),
            interns: Interns::new(),
            descriptors: DescriptorTable::new(),
            types: TypeTable::new(),
            instances: InstanceTable::new(),
            thunks: ThunkRegistry::new(),
            errors: ErrorState::new(),
            wrappers: AHashMap::new(),
            guest_root: None,
            meta: None,
            tracer,
        }
    }

    /// Returns the bridge configuration.
    #[must_use]
    pub fn config(&self) -> BridgeConfig {
        self.config
    }

    /// Returns the type table.
    #[must_use]
    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Returns the instance table.
    #[must_use]
    pub fn instances(&self) -> &InstanceTable {
        &self.instances
    }

    /// Returns the descriptor table.
    #[must_use]
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// Returns the thunk registry.
    #[must_use]
    pub fn thunks(&self) -> &ThunkRegistry {
        &self.thunks
    }

    /// Returns the pending-error state.
    #[must_use]
    pub fn errors(&self) -> &ErrorState {
        &self.errors
    }

    /// Returns the pending-error state mutably.
    pub fn errors_mut(&mut self) -> &mut ErrorState {
        &mut self.errors
    }

    /// Returns the interner.
    #[must_use]
    pub fn interns(&self) -> &Interns {
        &self.interns
    }

    /// Interns a member name.
    pub fn intern(&mut self, name: &str) -> StringId {
        self.interns.intern(name)
    }

    /// Returns the tracer.
    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    /// Returns the singleton metatype, if bootstrapped.
    #[must_use]
    pub fn meta(&self) -> Option<TypeId> {
        self.meta
    }

    /// Returns the guest root type object, if bootstrapped.
    #[must_use]
    pub fn guest_root(&self) -> Option<TypeId> {
        self.guest_root
    }

    // =========================================================================
    // Bootstrap, teardown, persistence
    // =========================================================================

    /// Constructs the singleton metatype on first use.
    ///
    /// Idempotent: a second call resets the thunk registry and re-attaches
    /// the check entry points, leaving the existing singleton in place.
    pub fn bootstrap(&mut self) -> TypeId {
        // Reset cached dispatch state before rebuilding it, so a re-init
        // after a partial teardown never observes stale entries.
        self.thunks.reset();
        self.thunks
            .register(StaticNames::InstanceCheck.as_str(), Thunk::MetaInstanceCheck);
        self.thunks
            .register(StaticNames::SubclassCheck.as_str(), Thunk::MetaSubclassCheck);

        if let Some(meta) = self.meta {
            return meta;
        }

        let root_flags = TypeFlags {
            base_type: true,
            subclassable: true,
            ..TypeFlags::default()
        };
        // The guest root's type-of-type is itself; stored as None to avoid a
        // self-cycle in the refcounts.
        let guest_root = TypeBuilder::new(GUEST_ROOT_NAME).flags(root_flags).publish(&mut self.types);
        self.guest_root = Some(guest_root);

        let meta_flags = TypeFlags {
            heap_type: true,
            base_type: true,
            subclassable: true,
            ..TypeFlags::default()
        };
        let meta = TypeBuilder::new(META_TYPE_NAME)
            .flags(meta_flags)
            .base(guest_root)
            .metatype(guest_root)
            .publish(&mut self.types);
        self.meta = Some(meta);
        self.tracer.record(TraceEvent::Bootstrap { meta });
        meta
    }

    /// Tears down the singleton metatype.
    ///
    /// If anything external still holds a reference to the singleton, the
    /// thunk registry is reset so no stale dispatch state survives into a
    /// later re-initialization; the singleton reference is released either
    /// way.
    pub fn teardown(&mut self, host: &mut impl HostReflect) {
        let Some(meta) = self.meta.take() else {
            return;
        };
        if self.types.refcount(meta) > 1 {
            self.thunks.reset();
        }
        self.type_dec_ref(host, meta);
        if let Some(guest_root) = self.guest_root.take() {
            self.type_dec_ref(host, guest_root);
        }
        self.tracer.record(TraceEvent::Teardown);
    }

    /// Captures the singleton's identity for restart persistence.
    pub fn capture_meta(&self) -> BridgeResult<MetaSnapshot> {
        let meta = self
            .meta
            .ok_or_else(|| GuestException::system_error("cannot capture metatype before bootstrap"))?;
        Ok(MetaSnapshot {
            meta,
            name: self.types.get(meta).name().to_owned(),
            thunks: self.thunks.entries(),
        })
    }

    /// Reconstructs the singleton from a captured snapshot.
    ///
    /// Must run on a bridge whose type table is still empty; the singleton
    /// is rebuilt at its persisted identity and the native entry points are
    /// re-attached under the same fixed names.
    pub fn restore_meta(&mut self, snapshot: &MetaSnapshot) -> BridgeResult<TypeId> {
        if self.meta.is_some() {
            return Err(GuestException::system_error("cannot restore over a live metatype"));
        }
        if self.types.live_count() != 0 {
            return Err(GuestException::system_error("cannot restore into a non-empty type table"));
        }
        let meta = self.bootstrap();
        if meta != snapshot.meta {
            return Err(GuestException::system_error(format!(
                "restored metatype identity mismatch: expected {:?}, got {meta:?}",
                snapshot.meta,
            )));
        }
        self.thunks.reset();
        for (name, thunk) in &snapshot.thunks {
            self.thunks.register(name, *thunk);
        }
        self.tracer.record(TraceEvent::Restored { meta });
        Ok(meta)
    }

    // =========================================================================
    // Wrapping host classes
    // =========================================================================

    /// Exposes a host class to the guest, creating its root proxy type.
    ///
    /// The proxy is created once per distinct host class; later calls return
    /// a fresh reference to the existing type. The handle slot offset is
    /// fixed here, at root creation, and never changes for any subtype.
    pub fn wrap_class(&mut self, host: &mut impl HostReflect, class: ClassToken) -> BridgeResult<TypeId> {
        let meta = self
            .meta
            .ok_or_else(|| GuestException::system_error("bridge is not bootstrapped"))?;
        let descriptor = self.descriptors.bind(host, class);
        if let Some(&existing) = self.wrappers.get(&descriptor) {
            self.types.inc_ref(existing);
            return Ok(existing);
        }
        if !self.descriptors.is_valid(descriptor, host) {
            return Err(GuestException::invalid_descriptor(self.descriptors.get(descriptor).name()));
        }

        let flags = TypeFlags {
            managed_instance: true,
            heap_type: true,
            base_type: true,
            subclassable: host.can_subclass(class),
            gc_participant: true,
            ..TypeFlags::default()
        };
        let type_handle = host.pin_class(class);
        self.tracer.record(TraceEvent::HandlePinned { handle: type_handle });
        let id = TypeBuilder::new(self.descriptors.get(descriptor).name())
            .descriptor(descriptor)
            .flags(flags)
            .slots(TypeSlots::managed())
            .handle_layout(0, 1)
            .handle(type_handle)
            .metatype(meta)
            .publish(&mut self.types);
        self.tracer.record(TraceEvent::TypeCreated {
            type_id: id,
            name: self.types.get(id).name().to_owned(),
        });
        // The registry entry is weak; the caller owns the publish reference.
        self.wrappers.insert(descriptor, id);
        Ok(id)
    }

    // =========================================================================
    // Type creation on subclassing
    // =========================================================================

    /// The guest class-statement entry point for managed bases.
    ///
    /// `bases` is borrowed; the new type takes its own reference on the
    /// base. `namespace` references are transferred into the new type; on
    /// failure they are released before the error propagates.
    pub fn type_new(
        &mut self,
        host: &mut impl HostReflect,
        name: &str,
        bases: &[GuestValue],
        namespace: IndexMap<String, Member>,
    ) -> BridgeResult<TypeId> {
        let Some(meta) = self.meta else {
            self.release_namespace(host, namespace);
            return Err(GuestException::system_error("bridge is not bootstrapped"));
        };
        let Some(guest_root) = self.guest_root else {
            self.release_namespace(host, namespace);
            return Err(GuestException::system_error("bridge is not bootstrapped"));
        };

        // Host metadata models linear base chains; one base, exactly.
        if bases.len() != 1 {
            self.release_namespace(host, namespace);
            return Err(GuestException::multiple_inheritance());
        }
        let Some(base_id) = bases[0].as_type() else {
            self.release_namespace(host, namespace);
            return Err(GuestException::invalid_metatype());
        };
        let base_meta = self.types.get(base_id).metatype();
        if base_meta != Some(meta) && base_meta != Some(guest_root) {
            self.release_namespace(host, namespace);
            return Err(GuestException::invalid_metatype());
        }

        let base_descriptor = self.types.get(base_id).descriptor();
        if let Some(descriptor) = base_descriptor {
            if !self.descriptors.is_valid(descriptor, host) {
                let class_name = self.descriptors.get(descriptor).name().to_owned();
                self.release_namespace(host, namespace);
                return Err(GuestException::invalid_descriptor(&class_name));
            }
            let entry = self.descriptors.get(descriptor);
            if !self.types.get(base_id).flags().subclassable || !host.can_subclass(entry.class()) {
                let (class_name, kind) = (entry.name().to_owned(), entry.kind());
                self.release_namespace(host, namespace);
                return Err(GuestException::not_subclassable(&class_name, kind));
            }
        }

        // Proxy subclasses cannot support guest-defined instance layout;
        // reject before any subtype construction begins.
        if namespace.contains_key(StaticNames::Slots.as_str()) {
            self.release_namespace(host, namespace);
            return Err(GuestException::slots_unsupported());
        }

        let descriptor = match (self.reflected_target(&namespace), base_descriptor) {
            (Some((assembly, ns)), Some(base_descriptor)) => {
                // A named target assembly and namespace means the subtype
                // must be dispatchable from the host side; delegate to the
                // host's subtype-emission routine and wrap the result.
                let base_class = self.descriptors.get(base_descriptor).class();
                match host.create_reflected_subtype(name, base_class, &assembly, &ns) {
                    Ok(token) => Some(self.descriptors.bind(host, token)),
                    Err(err) => {
                        self.release_namespace(host, namespace);
                        return Err(GuestException::from_host(&err));
                    }
                }
            }
            _ => base_descriptor,
        };

        // Ordinary guest type construction, followed by the managed
        // post-construction fixups.
        let base = self.types.get(base_id);
        let base_slots = base.slots();
        let base_offset = base.handle_offset();
        let base_slot_count = base.slot_count();
        let base_handle = base.handle();
        let base_is_sub = base.is_guest_subclass();

        let flags = TypeFlags {
            managed_instance: true,
            heap_type: true,
            base_type: true,
            subclassable: true,
            gc_participant: true,
            ..TypeFlags::default()
        };
        let mut builder = TypeBuilder::new(name)
            .flags(flags)
            // Derived types reuse the base's object-lifetime behavior
            // exactly; the three slots are copied verbatim.
            .slots(base_slots)
            .handle_layout(base_offset, base_slot_count.max(base_offset + 1))
            .base(base_id)
            .metatype(meta)
            .guest_subclass(true);
        if let Some(descriptor) = descriptor {
            builder = builder.descriptor(descriptor);
        }
        if let Some(handle) = base_handle {
            let copy = match self.config.handle_copy_policy {
                HandleCopyPolicy::EveryLevel => true,
                HandleCopyPolicy::BridgePoint => !base_is_sub,
            };
            if copy {
                builder = builder.handle(handle);
            }
        }
        let id = builder.publish(&mut self.types);
        self.tracer.record(TraceEvent::TypeCreated {
            type_id: id,
            name: name.to_owned(),
        });

        if !self.types.get(id).flags().ready {
            // The type construction primitive produced a half-built type.
            // This is an internal invariant violation, not user error.
            self.type_dec_ref(host, id);
            self.release_namespace(host, namespace);
            return Err(GuestException::system_error(format!(
                "type construction returned a non-ready type for '{name}'"
            )));
        }

        // Install the class body last, once nothing can fail; the namespace
        // references are transferred into the type here.
        for (key, member) in namespace {
            let key_id = self.interns.intern(&key);
            self.types.get_mut(id).set_member(key_id, member);
        }
        self.notify_modified(id);
        Ok(id)
    }

    /// Extracts the reflected-subtype target from a class namespace.
    fn reflected_target(&self, namespace: &IndexMap<String, Member>) -> Option<(String, String)> {
        let assembly = namespace.get(StaticNames::Assembly.as_str())?;
        let ns = namespace.get(StaticNames::Namespace.as_str())?;
        match (assembly, ns) {
            (Member::Value(GuestValue::Str(assembly)), Member::Value(GuestValue::Str(ns))) => {
                Some((assembly.clone(), ns.clone()))
            }
            _ => None,
        }
    }

    // =========================================================================
    // Call protocol
    // =========================================================================

    /// Invokes a proxy type as a constructor.
    ///
    /// Runs the type's creation entry, then looks up and invokes an
    /// initializer with the same arguments. An absent initializer is not an
    /// error; a failing one releases the fresh object before propagating.
    pub fn type_call(
        &mut self,
        host: &mut impl HostReflect,
        binder: &impl OverloadBinder,
        type_id: TypeId,
        args: &CallArgs,
    ) -> BridgeResult<GuestValue> {
        let instance = self.instance_new(host, binder, type_id, args)?;

        // The guest's own type-call protocol does not know to invoke
        // initializers for foreign metatypes, so the bridge does it here.
        match self.lookup_member_raising(type_id, StaticNames::Init.into()) {
            Ok((_, Member::Init(thunk))) => {
                if let Err(err) = self.invoke_init_thunk(thunk, instance, args) {
                    self.instance_dec_ref(host, instance);
                    return Err(err);
                }
            }
            // A namespace entry under __init__ that is not an initializer is
            // not invocable; nothing to do.
            Ok(_) => {}
            // The lookup left error state pending; an absent initializer is
            // a recognized non-error, so clear it and continue.
            Err(_) => self.errors.clear(),
        }
        Ok(GuestValue::Instance(instance))
    }

    /// Allocates a proxy instance and binds it to a fresh host object.
    pub fn instance_new(
        &mut self,
        host: &mut impl HostReflect,
        binder: &impl OverloadBinder,
        type_id: TypeId,
        args: &CallArgs,
    ) -> BridgeResult<InstanceId> {
        let ty = self.types.get(type_id);
        if !ty.flags().managed_instance {
            return Err(GuestException::type_error(format!(
                "cannot create instances of '{}'",
                ty.name()
            )));
        }
        let Some(descriptor) = ty.descriptor() else {
            return Err(GuestException::type_error(format!(
                "'{}' does not wrap a host class",
                ty.name()
            )));
        };
        if !self.descriptors.is_valid(descriptor, host) {
            return Err(GuestException::invalid_descriptor(self.descriptors.get(descriptor).name()));
        }
        let offset = ty.handle_offset();
        let slot_count = ty.slot_count();

        let object = instantiate(
            EngineCtx {
                descriptors: &self.descriptors,
                types: &self.types,
                instances: &self.instances,
                errors: &mut self.errors,
                tracer: &mut self.tracer,
            },
            host,
            binder,
            descriptor,
            args,
            None,
        )?;

        let instance = self.instances.allocate(type_id, slot_count.max(offset + 1));
        self.types.inc_ref(type_id);
        let handle = host.pin(object);
        self.tracer.record(TraceEvent::HandlePinned { handle });
        let state = self.instances.get_mut(instance);
        state.set_handle(offset, handle);
        state.set_host_object(object);
        self.tracer.record(TraceEvent::InstanceAllocated { instance, type_id });
        Ok(instance)
    }

    /// Produces a raw host object for a descriptor and arguments.
    ///
    /// Public form of the instantiation engine; `preselected` narrows
    /// binding to one constructor chosen up front.
    pub fn instantiate(
        &mut self,
        host: &mut impl HostReflect,
        binder: &impl OverloadBinder,
        descriptor: DescriptorId,
        args: &CallArgs,
        preselected: Option<CtorId>,
    ) -> BridgeResult<ObjectToken> {
        instantiate(
            EngineCtx {
                descriptors: &self.descriptors,
                types: &self.types,
                instances: &self.instances,
                errors: &mut self.errors,
                tracer: &mut self.tracer,
            },
            host,
            binder,
            descriptor,
            args,
            preselected,
        )
    }

    fn invoke_init_thunk(&mut self, thunk: Thunk, instance: InstanceId, args: &CallArgs) -> BridgeResult<()> {
        match thunk {
            Thunk::RecordInitArgs => {
                let recorded: Vec<GuestValue> = args
                    .positional_view()
                    .into_iter()
                    .map(|value| self.clone_value(value))
                    .collect();
                self.instances.get_mut(instance).record_init_args(recorded);
                Ok(())
            }
            Thunk::RejectCall => Err(GuestException::type_error("native callable rejected call")),
            Thunk::MetaInstanceCheck | Thunk::MetaSubclassCheck => {
                Err(GuestException::system_error("check thunk used as initializer"))
            }
        }
    }

    // =========================================================================
    // Attribute assignment
    // =========================================================================

    /// Sets an attribute on a proxy type.
    ///
    /// A settable descriptor on the type receives the value; a descriptor
    /// without a set hook is read-only; anything else falls back to the
    /// generic attribute set and invalidates the type's attribute cache.
    /// Takes ownership of `value`.
    pub fn type_setattro(
        &mut self,
        host: &mut impl HostReflect,
        type_id: TypeId,
        name: &str,
        value: GuestValue,
    ) -> BridgeResult<()> {
        let name_id = self.interns.intern(name);
        // The descriptor kind is resolved once per set call.
        match self.lookup_member_kind(type_id, name_id) {
            Some((owner, member)) => match member.set_capability() {
                SetCapability::Settable => {
                    let old = match self.types.get_mut(owner).member_mut(name_id) {
                        Some(Member::Property { value: slot, .. } | Member::Extension { value: slot, .. }) => {
                            Some(std::mem::replace(slot, value))
                        }
                        _ => None,
                    };
                    if let Some(old) = old {
                        self.release_value(host, old);
                    }
                    Ok(())
                }
                SetCapability::ReadOnly => {
                    self.release_value(host, value);
                    Err(GuestException::read_only_attribute(name))
                }
                SetCapability::NotDescriptor => self.generic_setattr(host, type_id, name_id, value),
            },
            None => self.generic_setattr(host, type_id, name_id, value),
        }
    }

    /// The guest runtime's generic attribute-set behavior.
    fn generic_setattr(
        &mut self,
        host: &mut impl HostReflect,
        type_id: TypeId,
        name_id: StringId,
        value: GuestValue,
    ) -> BridgeResult<()> {
        let old = self.types.get_mut(type_id).set_member(name_id, Member::Value(value));
        if let Some(old) = old {
            self.release_member(host, old);
        }
        self.notify_modified(type_id);
        Ok(())
    }

    // =========================================================================
    // Indexing
    // =========================================================================

    /// Subscripts a proxy type, binding a generic definition.
    ///
    /// Only generic-type definitions are subscriptable; the bound class is
    /// wrapped like any other host class.
    pub fn type_subscript(
        &mut self,
        host: &mut impl HostReflect,
        type_id: TypeId,
        keys: &[GuestValue],
    ) -> BridgeResult<GuestValue> {
        let ty = self.types.get(type_id);
        let type_name = ty.name().to_owned();
        let Some(descriptor) = ty.descriptor() else {
            return Err(GuestException::unsubscriptable(&type_name));
        };
        if !self.descriptors.is_valid(descriptor, host) {
            return Err(GuestException::invalid_descriptor(self.descriptors.get(descriptor).name()));
        }
        let class = self.descriptors.get(descriptor).class();
        if !host.is_generic_definition(class) {
            return Err(GuestException::unsubscriptable(&type_name));
        }

        let mut key_classes: SmallVec<[ClassToken; 2]> = SmallVec::with_capacity(keys.len());
        for key in keys {
            let key_descriptor = key.as_type().and_then(|key_type| self.types.get(key_type).descriptor());
            let Some(key_descriptor) = key_descriptor else {
                return Err(GuestException::type_error(format!(
                    "generic parameters of '{type_name}' must be managed types"
                )));
            };
            key_classes.push(self.descriptors.get(key_descriptor).class());
        }

        let Some(bound) = host.bind_generic(class, &key_classes) else {
            return Err(GuestException::type_error(format!(
                "cannot bind generic type '{type_name}' with the given parameters"
            )));
        };
        let bound_type = self.wrap_class(host, bound)?;
        Ok(GuestValue::Type(bound_type))
    }

    // =========================================================================
    // Instance and subclass checks
    // =========================================================================

    /// The `__instancecheck__` entry point.
    pub fn instance_check(&self, host: &impl HostReflect, queried: TypeId, args: &CallArgs) -> BridgeResult<bool> {
        self.assignable_check(host, queried, args, CheckMode::Instance)
    }

    /// The `__subclasscheck__` entry point.
    pub fn subclass_check(&self, host: &impl HostReflect, queried: TypeId, args: &CallArgs) -> BridgeResult<bool> {
        self.assignable_check(host, queried, args, CheckMode::Subclass)
    }

    /// Dispatches one of the check entry points through its registered name.
    pub fn invoke_meta_thunk(
        &self,
        host: &impl HostReflect,
        name: &str,
        queried: TypeId,
        args: &CallArgs,
    ) -> BridgeResult<GuestValue> {
        match self.thunks.lookup(name) {
            Some(Thunk::MetaInstanceCheck) => self.instance_check(host, queried, args).map(GuestValue::Bool),
            Some(Thunk::MetaSubclassCheck) => self.subclass_check(host, queried, args).map(GuestValue::Bool),
            Some(_) | None => Err(GuestException::attribute_error(
                format!("type object '{}'", self.types.get(queried).name()),
                name,
            )),
        }
    }

    /// One algorithm for both checks.
    ///
    /// The host assignability relation is authoritative for reflected
    /// classes and replaces the guest's slower MRO walk. Invalid descriptors
    /// answer false on either side; they never raise.
    fn assignable_check(
        &self,
        host: &impl HostReflect,
        queried: TypeId,
        args: &CallArgs,
        mode: CheckMode,
    ) -> BridgeResult<bool> {
        let Some(queried_descriptor) = self.types.get(queried).descriptor() else {
            return Ok(false);
        };
        if !self.descriptors.is_valid(queried_descriptor, host) {
            return Ok(false);
        }

        let arg = args.get_one_arg(mode.entry_name())?;
        let comparand_type = match mode {
            CheckMode::Subclass => arg.as_type(),
            CheckMode::Instance => arg.as_instance().map(|id| self.instances.get(id).type_id()),
        };
        let Some(comparand_type) = comparand_type else {
            return Ok(false);
        };
        let Some(comparand_descriptor) = self.types.get(comparand_type).descriptor() else {
            return Ok(false);
        };
        if !self.descriptors.is_valid(comparand_descriptor, host) {
            return Ok(false);
        }

        let queried_class = self.descriptors.get(queried_descriptor).class();
        let comparand_class = self.descriptors.get(comparand_descriptor).class();
        Ok(host.is_assignable_from(queried_class, comparand_class))
    }

    // =========================================================================
    // Reference counting and deallocation
    // =========================================================================

    /// Increments a type's guest reference count.
    pub fn type_inc_ref(&mut self, type_id: TypeId) {
        self.types.inc_ref(type_id);
    }

    /// Decrements a type's guest reference count, deallocating at zero.
    pub fn type_dec_ref(&mut self, host: &mut impl HostReflect, type_id: TypeId) {
        if self.types.dec_ref_only(type_id) == 0 {
            self.type_dealloc(host, type_id);
        }
    }

    /// The type deallocation entry point.
    ///
    /// A root proxy releases its pinned class-metadata handle; guest
    /// subclasses copied the handle value but do not own it. The reference
    /// on the type's own type-of-type is dropped, and the remaining teardown
    /// is delegated to the root dealloc routine, which ends in the free
    /// routine reclaiming the slot.
    fn type_dealloc(&mut self, host: &mut impl HostReflect, type_id: TypeId) {
        let (taken_handle, metatype) = {
            let ty = self.types.get_mut(type_id);
            let handle = if ty.is_guest_subclass() { None } else { ty.take_handle() };
            (handle, ty.metatype())
        };
        if let Some(handle) = taken_handle {
            host.release(handle);
            self.tracer.record(TraceEvent::HandleReleased { handle });
        }
        if let Some(meta) = metatype
            && meta != type_id
        {
            self.type_dec_ref(host, meta);
        }
        self.base_type_dealloc(host, type_id);
    }

    /// The guest root's type deallocation: drops namespace and base
    /// references, then invokes the free routine on the type's own memory.
    fn base_type_dealloc(&mut self, host: &mut impl HostReflect, type_id: TypeId) {
        let mut ty = self.types.take(type_id);
        self.tracer.record(TraceEvent::TypeFreed { type_id });
        if let Some(descriptor) = ty.descriptor()
            && self.wrappers.get(&descriptor) == Some(&type_id)
        {
            self.wrappers.remove(&descriptor);
        }
        // A guest subclass may still carry a copied handle value here; the
        // root proxy owns the pin, so the copy is dropped without release.
        for (_, member) in ty.take_namespace() {
            self.release_member(host, member);
        }
        if let Some(base) = ty.base() {
            self.type_dec_ref(host, base);
        }
    }

    /// Increments an instance's guest reference count.
    pub fn instance_inc_ref(&mut self, instance: InstanceId) {
        self.instances.inc_ref(instance);
    }

    /// Decrements an instance's guest reference count, deallocating at zero.
    pub fn instance_dec_ref(&mut self, host: &mut impl HostReflect, instance: InstanceId) {
        if self.instances.dec_ref_only(instance) == 0 {
            self.instance_dealloc(host, instance);
        }
    }

    /// Instance deallocation through the type's inherited dispatch slot.
    ///
    /// The handle is released exactly once, at the offset the root proxy
    /// fixed; subclass levels inherit this very routine instead of adding
    /// their own.
    fn instance_dealloc(&mut self, host: &mut impl HostReflect, instance: InstanceId) {
        let type_id = self.instances.get(instance).type_id();
        let (dealloc_slot, offset) = {
            let ty = self.types.get(type_id);
            (ty.slots().dealloc, ty.handle_offset())
        };
        if dealloc_slot == SlotEntry::ManagedDealloc
            && let Some(handle) = self.instances.get_mut(instance).take_handle(offset)
        {
            host.release(handle);
            self.tracer.record(TraceEvent::HandleReleased { handle });
        }
        let mut state = self.instances.take(instance);
        self.tracer.record(TraceEvent::InstanceFreed { instance });
        if let Some(args) = state.take_init_args() {
            for value in args {
                self.release_value(host, value);
            }
        }
        self.type_dec_ref(host, type_id);
    }

    // =========================================================================
    // Cyclic-collection participation
    // =========================================================================

    /// Reports the references an instance holds, for the guest's cycle
    /// detector. Empty when the type does not participate in collection.
    #[must_use]
    pub fn instance_traverse(&self, instance: InstanceId) -> SmallVec<[GuestValue; 4]> {
        let state = self.instances.get(instance);
        let ty = self.types.get(state.type_id());
        if ty.slots().traverse != SlotEntry::GcTraverse {
            return SmallVec::new();
        }
        let mut refs: SmallVec<[GuestValue; 4]> = SmallVec::new();
        refs.push(GuestValue::Type(state.type_id()));
        if let Some(args) = state.init_args() {
            refs.extend(
                args.iter()
                    .filter(|value| value.as_type().is_some() || value.as_instance().is_some())
                    .cloned(),
            );
        }
        refs
    }

    /// Clears an instance's non-handle references to break cycles.
    ///
    /// The pinning handle is never cleared here; it belongs to the dealloc
    /// path.
    pub fn instance_clear(&mut self, host: &mut impl HostReflect, instance: InstanceId) {
        let type_id = self.instances.get(instance).type_id();
        if self.types.get(type_id).slots().clear != SlotEntry::GcClear {
            return;
        }
        if let Some(args) = self.instances.get_mut(instance).take_init_args() {
            for value in args {
                self.release_value(host, value);
            }
        }
    }

    // =========================================================================
    // Notifications and value plumbing
    // =========================================================================

    /// The type-modified notification: bumps the attribute-cache tag.
    pub fn notify_modified(&mut self, type_id: TypeId) {
        let version = self.types.get_mut(type_id).bump_version();
        self.tracer.record(TraceEvent::CacheInvalidated { type_id, version });
    }

    /// Invalidates descriptors for classes whose assembly was unloaded.
    pub fn notify_assembly_unloaded(&mut self, classes: &[ClassToken]) {
        self.descriptors.invalidate_unloaded(classes);
    }

    /// Clones a guest value, adjusting table refcounts.
    #[must_use]
    pub fn clone_value(&mut self, value: &GuestValue) -> GuestValue {
        match value {
            GuestValue::Type(id) => {
                self.types.inc_ref(*id);
                GuestValue::Type(*id)
            }
            GuestValue::Instance(id) => {
                self.instances.inc_ref(*id);
                GuestValue::Instance(*id)
            }
            other => other.clone(),
        }
    }

    /// Releases a guest value, adjusting table refcounts.
    pub fn release_value(&mut self, host: &mut impl HostReflect, value: GuestValue) {
        match value {
            GuestValue::Type(id) => self.type_dec_ref(host, id),
            GuestValue::Instance(id) => self.instance_dec_ref(host, id),
            _ => {}
        }
    }

    /// Releases every reference a member holds.
    fn release_member(&mut self, host: &mut impl HostReflect, member: Member) {
        match member {
            Member::Value(value)
            | Member::Property { value, .. }
            | Member::Method(value)
            | Member::Extension { value, .. } => self.release_value(host, value),
            Member::Init(_) => {}
        }
    }

    /// Releases every reference a namespace mapping holds.
    fn release_namespace(&mut self, host: &mut impl HostReflect, namespace: IndexMap<String, Member>) {
        for (_, member) in namespace {
            self.release_member(host, member);
        }
    }

    /// Finds a member along the base chain without touching error state.
    fn lookup_member_kind(&self, type_id: TypeId, name: StringId) -> Option<(TypeId, Member)> {
        let mut current = Some(type_id);
        while let Some(id) = current {
            let ty = self.types.get(id);
            if let Some(member) = ty.member(name) {
                return Some((id, member.clone()));
            }
            current = ty.base();
        }
        None
    }

    /// Finds a member along the base chain, reporting a miss through the
    /// pending error slot the way the guest's attribute machinery does.
    fn lookup_member_raising(&mut self, type_id: TypeId, name: StringId) -> BridgeResult<(TypeId, Member)> {
        if let Some(found) = self.lookup_member_kind(type_id, name) {
            return Ok(found);
        }
        let exc = GuestException::attribute_error(
            format!("type object '{}'", self.types.get(type_id).name()),
            self.interns.get_str(name),
        );
        self.errors.set(exc.clone());
        Err(exc)
    }
}
