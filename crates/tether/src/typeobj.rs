//! Proxy type objects and the refcounted tables that own them.
//!
//! A [`ProxyType`] is the native state behind one guest-visible type object:
//! the descriptor of the host class it wraps, its capability flags, its
//! lifetime dispatch slots, and the fixed slot offset at which instances
//! store their pinning handle. Types and instances live in slot arenas
//! ([`TypeTable`], [`InstanceTable`]) with explicit reference counts and free
//! lists; the bridge drives deallocation so it can release host handles at
//! the right moment.
//!
//! # Handle offset
//!
//! The offset is fixed when the root proxy type for a host class is created
//! and is copied verbatim into every guest subtype, so the dispatch slots a
//! subtype inherits from its base keep finding the handle where the base
//! put it. Nothing may change the offset after the root type is published.

use ahash::AHashMap;
use indexmap::IndexMap;
use smallvec::SmallVec;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    descriptor::DescriptorId,
    host::{ObjectToken, RawHandle},
    intern::StringId,
    value::GuestValue,
};

/// Index into the type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TypeId(usize);

impl TypeId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index into the instance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InstanceId(usize);

impl InstanceId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Guest-visible capability flags of a proxy type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TypeFlags {
    /// Instances carry an embedded native state with a handle slot.
    pub managed_instance: bool,
    /// The type object itself is heap-allocated.
    pub heap_type: bool,
    /// The type may appear as a base in a guest class statement.
    pub base_type: bool,
    /// Guest code may subclass this type.
    pub subclassable: bool,
    /// Instances participate in the guest's cyclic garbage collection.
    pub gc_participant: bool,
    /// Type construction completed; set by the builder at publication.
    pub ready: bool,
}

/// A lifetime dispatch entry on a proxy type.
///
/// Derived types copy these verbatim from their base, so an entry must be
/// meaningful independent of which exact type it is read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SlotEntry {
    #[default]
    None,
    /// Instance deallocation that releases the pinned handle at the type's
    /// handle offset before freeing the instance.
    ManagedDealloc,
    /// Cyclic-collection traversal over the instance's references.
    GcTraverse,
    /// Cyclic-collection clearing of the instance's non-handle references.
    GcClear,
}

/// The dealloc/traverse/clear dispatch entries of a proxy type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TypeSlots {
    pub dealloc: SlotEntry,
    pub traverse: SlotEntry,
    pub clear: SlotEntry,
}

impl TypeSlots {
    /// The slot set of a root proxy wrapping a host class.
    #[must_use]
    pub fn managed() -> Self {
        Self {
            dealloc: SlotEntry::ManagedDealloc,
            traverse: SlotEntry::GcTraverse,
            clear: SlotEntry::GcClear,
        }
    }
}

/// A native callable registered under a fixed well-known name.
///
/// Thunks stand in for the function pointers a C embedding would register:
/// the registry maps names to variants, teardown resets the registry, and
/// restore re-attaches the same variants under the same names, so no stale
/// dispatch state can survive a re-initialization.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, serde::Serialize, serde::Deserialize,
)]
pub enum Thunk {
    /// The metatype's `__instancecheck__` entry point.
    MetaInstanceCheck,
    /// The metatype's `__subclasscheck__` entry point.
    MetaSubclassCheck,
    /// Initializer that records its arguments on the instance.
    RecordInitArgs,
    /// Initializer that rejects every call with a TypeError.
    RejectCall,
}

/// Registry of native callables keyed by fixed well-known names.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ThunkRegistry {
    entries: AHashMap<String, Thunk>,
}

impl ThunkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a thunk under a name, replacing any previous registration.
    pub fn register(&mut self, name: &str, thunk: Thunk) {
        self.entries.insert(name.to_owned(), thunk);
    }

    /// Looks up a thunk by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Thunk> {
        self.entries.get(name).copied()
    }

    /// Drops every registration.
    ///
    /// Called on teardown whenever external references to the singleton
    /// metatype remain, so a later re-initialization cannot observe entries
    /// from the previous life of the bridge.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Returns the registered (name, thunk) pairs in unspecified order.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Thunk)> {
        self.entries.iter().map(|(name, thunk)| (name.clone(), *thunk)).collect()
    }

    /// Returns the number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What an attribute-set dispatch resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCapability {
    /// A descriptor with a set hook; delegate to it.
    Settable,
    /// A descriptor without a set hook; the attribute is read-only.
    ReadOnly,
    /// Not a descriptor; fall back to the generic attribute set.
    NotDescriptor,
}

/// One entry in a proxy type's namespace.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Member {
    /// A plain attribute value.
    Value(GuestValue),
    /// A data descriptor wrapping a host field or property.
    Property { value: GuestValue, settable: bool },
    /// A bound-method descriptor. Has no set hook.
    Method(GuestValue),
    /// A descriptor belonging to an extension type.
    Extension { value: GuestValue, settable: bool },
    /// An initializer entry invoked by the call protocol.
    Init(Thunk),
}

impl Member {
    /// Resolves the member's attribute-set capability once per set call.
    #[must_use]
    pub fn set_capability(&self) -> SetCapability {
        match self {
            Self::Value(_) => SetCapability::NotDescriptor,
            Self::Property { settable, .. } | Self::Extension { settable, .. } => {
                if *settable {
                    SetCapability::Settable
                } else {
                    SetCapability::ReadOnly
                }
            }
            Self::Method(_) | Self::Init(_) => SetCapability::ReadOnly,
        }
    }
}

/// Native state of one guest-visible type object.
///
/// The descriptor reference, base, and metatype are set exactly once, at
/// construction through [`TypeBuilder`]; after publication only the version
/// tag and the namespace (through attribute assignment) change.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ProxyType {
    name: String,
    descriptor: Option<DescriptorId>,
    flags: TypeFlags,
    slots: TypeSlots,
    /// Slot index at which instances store their pinning handle.
    handle_offset: usize,
    /// Instance slot layout size; `handle_offset < slot_count` for managed types.
    slot_count: usize,
    /// Type-level pinned handle on the host class's reflection object.
    handle: Option<RawHandle>,
    base: Option<TypeId>,
    metatype: Option<TypeId>,
    namespace: IndexMap<StringId, Member>,
    is_guest_subclass: bool,
    /// Attribute-cache tag; bumped by the modified notification.
    version: u64,
}

impl ProxyType {
    /// Returns the type's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the descriptor of the wrapped host class, if any.
    #[must_use]
    pub fn descriptor(&self) -> Option<DescriptorId> {
        self.descriptor
    }

    /// Returns the capability flags.
    #[must_use]
    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    /// Returns the lifetime dispatch slots.
    #[must_use]
    pub fn slots(&self) -> TypeSlots {
        self.slots
    }

    /// Returns the fixed handle slot offset.
    #[must_use]
    pub fn handle_offset(&self) -> usize {
        self.handle_offset
    }

    /// Returns the instance slot layout size.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Returns the type-level pinned handle, if one is set.
    #[must_use]
    pub fn handle(&self) -> Option<RawHandle> {
        self.handle
    }

    /// Removes and returns the type-level handle.
    pub fn take_handle(&mut self) -> Option<RawHandle> {
        self.handle.take()
    }

    /// Returns the base type, if any.
    #[must_use]
    pub fn base(&self) -> Option<TypeId> {
        self.base
    }

    /// Returns the type's metatype.
    #[must_use]
    pub fn metatype(&self) -> Option<TypeId> {
        self.metatype
    }

    /// Returns whether this type was created by a guest class statement.
    #[must_use]
    pub fn is_guest_subclass(&self) -> bool {
        self.is_guest_subclass
    }

    /// Returns the current attribute-cache tag.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Bumps the attribute-cache tag, returning the new value.
    pub fn bump_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Looks up a member defined directly on this type.
    #[must_use]
    pub fn member(&self, name: StringId) -> Option<&Member> {
        self.namespace.get(&name)
    }

    /// Returns a mutable reference to a member defined directly on this type.
    #[must_use]
    pub fn member_mut(&mut self, name: StringId) -> Option<&mut Member> {
        self.namespace.get_mut(&name)
    }

    /// Sets a member, returning the previous entry under that name.
    pub fn set_member(&mut self, name: StringId, member: Member) -> Option<Member> {
        self.namespace.insert(name, member)
    }

    /// Takes the namespace out, leaving it empty. Used on the dealloc path.
    pub fn take_namespace(&mut self) -> IndexMap<StringId, Member> {
        std::mem::take(&mut self.namespace)
    }
}

/// Builder for proxy types.
///
/// Takes a name, at most one base, capability flags, and the fixed handle
/// offset, and publishes an immutable type into the table. Publication
/// increments the reference counts of the base and metatype.
#[derive(Debug)]
pub struct TypeBuilder {
    name: String,
    descriptor: Option<DescriptorId>,
    flags: TypeFlags,
    slots: TypeSlots,
    handle_offset: usize,
    slot_count: usize,
    handle: Option<RawHandle>,
    base: Option<TypeId>,
    metatype: Option<TypeId>,
    namespace: IndexMap<StringId, Member>,
    is_guest_subclass: bool,
}

impl TypeBuilder {
    /// Starts a builder for a type with the given display name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: None,
            flags: TypeFlags::default(),
            slots: TypeSlots::default(),
            handle_offset: 0,
            slot_count: 0,
            handle: None,
            base: None,
            metatype: None,
            namespace: IndexMap::new(),
            is_guest_subclass: false,
        }
    }

    /// Sets the host class descriptor. May be called at most once per build.
    #[must_use]
    pub fn descriptor(mut self, descriptor: DescriptorId) -> Self {
        debug_assert!(self.descriptor.is_none(), "descriptor is bound exactly once");
        self.descriptor = Some(descriptor);
        self
    }

    /// Sets the capability flags.
    #[must_use]
    pub fn flags(mut self, flags: TypeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the lifetime dispatch slots.
    #[must_use]
    pub fn slots(mut self, slots: TypeSlots) -> Self {
        self.slots = slots;
        self
    }

    /// Sets the handle slot offset and instance slot layout size.
    #[must_use]
    pub fn handle_layout(mut self, handle_offset: usize, slot_count: usize) -> Self {
        self.handle_offset = handle_offset;
        self.slot_count = slot_count;
        self
    }

    /// Sets the type-level pinned handle.
    #[must_use]
    pub fn handle(mut self, handle: RawHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Sets the single base type.
    #[must_use]
    pub fn base(mut self, base: TypeId) -> Self {
        self.base = Some(base);
        self
    }

    /// Sets the metatype.
    #[must_use]
    pub fn metatype(mut self, metatype: TypeId) -> Self {
        self.metatype = Some(metatype);
        self
    }

    /// Adds a namespace member.
    #[must_use]
    pub fn member(mut self, name: StringId, member: Member) -> Self {
        self.namespace.insert(name, member);
        self
    }

    /// Marks the type as created by a guest class statement.
    #[must_use]
    pub fn guest_subclass(mut self, is_guest_subclass: bool) -> Self {
        self.is_guest_subclass = is_guest_subclass;
        self
    }

    /// Publishes the type, marking it ready and returning its id.
    pub fn publish(mut self, types: &mut TypeTable) -> TypeId {
        self.flags.ready = true;
        let base = self.base;
        let metatype = self.metatype;
        let id = types.allocate(ProxyType {
            name: self.name,
            descriptor: self.descriptor,
            flags: self.flags,
            slots: self.slots,
            handle_offset: self.handle_offset,
            slot_count: self.slot_count,
            handle: self.handle,
            base,
            metatype,
            namespace: self.namespace,
            is_guest_subclass: self.is_guest_subclass,
            version: 0,
        });
        if let Some(base_id) = base {
            types.inc_ref(base_id);
        }
        // A self-referential metatype (the root of the chain) holds no extra
        // reference on itself.
        if let Some(meta_id) = metatype
            && meta_id != id
        {
            types.inc_ref(meta_id);
        }
        id
    }
}

/// One live slot in the type table.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct TypeEntry {
    refcount: usize,
    ty: ProxyType,
}

/// Slot arena of guest type objects with explicit reference counts.
///
/// Freed slots are recycled through a free list. Reaching a zero refcount
/// does not free the slot by itself; the bridge observes the zero and runs
/// the type's deallocation protocol, which ends in [`TypeTable::take`].
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct TypeTable {
    entries: Vec<Option<TypeEntry>>,
    free_list: Vec<TypeId>,
}

impl TypeTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a slot for a type with an initial refcount of one.
    pub fn allocate(&mut self, ty: ProxyType) -> TypeId {
        let entry = TypeEntry { refcount: 1, ty };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = TypeId(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    /// Returns a live type.
    ///
    /// # Panics
    /// Panics if the id is dead or out of range.
    #[must_use]
    pub fn get(&self, id: TypeId) -> &ProxyType {
        &self.entries[id.index()].as_ref().expect("type slot is dead").ty
    }

    /// Returns a live type mutably.
    ///
    /// # Panics
    /// Panics if the id is dead or out of range.
    #[must_use]
    pub fn get_mut(&mut self, id: TypeId) -> &mut ProxyType {
        &mut self.entries[id.index()].as_mut().expect("type slot is dead").ty
    }

    /// Returns the current refcount of a live slot.
    #[must_use]
    pub fn refcount(&self, id: TypeId) -> usize {
        self.entries[id.index()].as_ref().expect("type slot is dead").refcount
    }

    /// Increments a slot's refcount.
    pub fn inc_ref(&mut self, id: TypeId) {
        self.entries[id.index()].as_mut().expect("type slot is dead").refcount += 1;
    }

    /// Decrements a slot's refcount, returning the new count.
    ///
    /// Does not free the slot; the caller runs the deallocation protocol
    /// when this returns zero.
    pub fn dec_ref_only(&mut self, id: TypeId) -> usize {
        let entry = self.entries[id.index()].as_mut().expect("type slot is dead");
        debug_assert!(entry.refcount > 0, "refcount underflow on {id:?}");
        entry.refcount -= 1;
        entry.refcount
    }

    /// Removes a type, recycling its slot. This is the free routine.
    pub fn take(&mut self, id: TypeId) -> ProxyType {
        let entry = self.entries[id.index()].take().expect("type slot is dead");
        self.free_list.push(id);
        entry.ty
    }

    /// Returns whether a slot is live.
    #[must_use]
    pub fn is_live(&self, id: TypeId) -> bool {
        self.entries.get(id.index()).is_some_and(Option::is_some)
    }

    /// Returns the number of live types.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }
}

/// One slot in a proxy instance's native storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceSlot {
    #[default]
    Empty,
    Handle(RawHandle),
}

/// Native state of one proxy instance.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ProxyInstance {
    type_id: TypeId,
    slots: SmallVec<[InstanceSlot; 2]>,
    /// The wrapped host object, recorded at instantiation for argument
    /// conversion and field access.
    host_object: Option<ObjectToken>,
    /// Arguments recorded by the `RecordInitArgs` initializer thunk.
    init_args: Option<Vec<GuestValue>>,
}

impl ProxyInstance {
    /// Returns the instance's type.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Returns the handle stored at a slot offset, if any.
    #[must_use]
    pub fn handle_at(&self, offset: usize) -> Option<RawHandle> {
        match self.slots.get(offset) {
            Some(InstanceSlot::Handle(handle)) => Some(*handle),
            _ => None,
        }
    }

    /// Stores a handle at a slot offset.
    ///
    /// # Panics
    /// Panics if the slot already holds a handle; a handle is created exactly
    /// once per instantiation.
    pub fn set_handle(&mut self, offset: usize, handle: RawHandle) {
        assert!(
            self.handle_at(offset).is_none(),
            "instance handle slot {offset} written twice"
        );
        self.slots[offset] = InstanceSlot::Handle(handle);
    }

    /// Removes and returns the handle at a slot offset.
    pub fn take_handle(&mut self, offset: usize) -> Option<RawHandle> {
        match self.slots.get_mut(offset).map(std::mem::take) {
            Some(InstanceSlot::Handle(handle)) => Some(handle),
            _ => None,
        }
    }

    /// Returns the wrapped host object.
    #[must_use]
    pub fn host_object(&self) -> Option<ObjectToken> {
        self.host_object
    }

    /// Records the wrapped host object. Set once at instantiation.
    pub fn set_host_object(&mut self, object: ObjectToken) {
        debug_assert!(self.host_object.is_none(), "host object is bound exactly once");
        self.host_object = Some(object);
    }

    /// Records initializer arguments.
    pub fn record_init_args(&mut self, args: Vec<GuestValue>) {
        self.init_args = Some(args);
    }

    /// Returns the recorded initializer arguments, if any.
    #[must_use]
    pub fn init_args(&self) -> Option<&[GuestValue]> {
        self.init_args.as_deref()
    }

    /// Takes the recorded initializer arguments for clearing.
    pub fn take_init_args(&mut self) -> Option<Vec<GuestValue>> {
        self.init_args.take()
    }
}

/// One live slot in the instance table.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct InstanceEntry {
    refcount: usize,
    instance: ProxyInstance,
}

/// Slot arena of proxy instances with explicit reference counts.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct InstanceTable {
    entries: Vec<Option<InstanceEntry>>,
    free_list: Vec<InstanceId>,
}

impl InstanceTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an instance with `slot_count` empty slots and refcount one.
    pub fn allocate(&mut self, type_id: TypeId, slot_count: usize) -> InstanceId {
        let entry = InstanceEntry {
            refcount: 1,
            instance: ProxyInstance {
                type_id,
                slots: smallvec::smallvec![InstanceSlot::Empty; slot_count],
                host_object: None,
                init_args: None,
            },
        };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = InstanceId(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    /// Returns a live instance.
    ///
    /// # Panics
    /// Panics if the id is dead or out of range.
    #[must_use]
    pub fn get(&self, id: InstanceId) -> &ProxyInstance {
        &self.entries[id.index()].as_ref().expect("instance slot is dead").instance
    }

    /// Returns a live instance mutably.
    ///
    /// # Panics
    /// Panics if the id is dead or out of range.
    #[must_use]
    pub fn get_mut(&mut self, id: InstanceId) -> &mut ProxyInstance {
        &mut self.entries[id.index()].as_mut().expect("instance slot is dead").instance
    }

    /// Returns the current refcount of a live slot.
    #[must_use]
    pub fn refcount(&self, id: InstanceId) -> usize {
        self.entries[id.index()].as_ref().expect("instance slot is dead").refcount
    }

    /// Increments a slot's refcount.
    pub fn inc_ref(&mut self, id: InstanceId) {
        self.entries[id.index()].as_mut().expect("instance slot is dead").refcount += 1;
    }

    /// Decrements a slot's refcount, returning the new count.
    pub fn dec_ref_only(&mut self, id: InstanceId) -> usize {
        let entry = self.entries[id.index()].as_mut().expect("instance slot is dead");
        debug_assert!(entry.refcount > 0, "refcount underflow on {id:?}");
        entry.refcount -= 1;
        entry.refcount
    }

    /// Removes an instance, recycling its slot.
    pub fn take(&mut self, id: InstanceId) -> ProxyInstance {
        let entry = self.entries[id.index()].take().expect("instance slot is dead");
        self.free_list.push(id);
        entry.instance
    }

    /// Returns whether a slot is live.
    #[must_use]
    pub fn is_live(&self, id: InstanceId) -> bool {
        self.entries.get(id.index()).is_some_and(Option::is_some)
    }

    /// Returns the number of live instances.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }
}
