//! Integration tests for the type bridge.
//!
//! Covers proxy-type creation and guest subclassing, the call protocol,
//! attribute assignment, indexing of generic definitions, the
//! instance/subclass checks, the deallocation chain with handle accounting,
//! and singleton bootstrap/teardown/restore.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use tether::{
    Bridge, BridgeConfig, CallArgs, ClassKind, ClassToken, ExcKind, GuestValue, HandleCopyPolicy, HostType, Member,
    MetaSnapshot, ModelHost, RecordingTracer, ReflectBinder, Thunk, TraceEvent, TypeSlots,
};

/// A bootstrapped bridge over an empty host model.
fn fresh() -> (ModelHost, Bridge) {
    let mut bridge = Bridge::new();
    bridge.bootstrap();
    (ModelHost::new(), bridge)
}

/// Registers `Animal` and `Dog(Animal)` with zero-argument constructors.
fn zoo(host: &mut ModelHost) -> (ClassToken, ClassToken) {
    let animal = host.register_class("Animal", "Zoo", ClassKind::Class, None);
    host.add_constructor(animal, vec![]);
    let dog = host.register_class("Dog", "Zoo", ClassKind::Class, Some(animal));
    host.add_constructor(dog, vec![]);
    (animal, dog)
}

fn empty_namespace() -> IndexMap<String, Member> {
    IndexMap::new()
}

// =============================================================================
// 1. Proxy-type creation and guest subclassing
// =============================================================================

#[test]
fn base_count_must_be_exactly_one() {
    let (mut host, mut bridge) = fresh();
    let (animal, dog) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let dog_type = bridge.wrap_class(&mut host, dog).unwrap();
    let live_before = bridge.types().live_count();

    let bases = [GuestValue::Type(animal_type), GuestValue::Type(dog_type)];
    let err = bridge
        .type_new(&mut host, "Mixed", &bases, empty_namespace())
        .unwrap_err();
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert_eq!(err.message(), "cannot use multiple inheritance with managed classes");
    assert_eq!(
        bridge.types().live_count(),
        live_before,
        "no proxy type may be created on a failed class statement"
    );

    let err = bridge.type_new(&mut host, "Empty", &[], empty_namespace()).unwrap_err();
    assert_eq!(err.message(), "cannot use multiple inheritance with managed classes");
}

#[test]
fn non_type_base_is_an_invalid_metatype() {
    let (mut host, mut bridge) = fresh();
    let err = bridge
        .type_new(&mut host, "Odd", &[GuestValue::Int(1)], empty_namespace())
        .unwrap_err();
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert_eq!(err.message(), "invalid metatype");
}

#[test]
fn delegates_enums_and_arrays_cannot_be_subclassed() {
    let (mut host, mut bridge) = fresh();
    for (name, kind) in [
        ("Callback", ClassKind::Delegate),
        ("Color", ClassKind::Enum),
        ("IntArray", ClassKind::Array),
    ] {
        let class = host.register_class(name, "Lib", kind, None);
        let base_type = bridge.wrap_class(&mut host, class).unwrap();
        let live_before = bridge.types().live_count();
        let err = bridge
            .type_new(&mut host, "Sub", &[GuestValue::Type(base_type)], empty_namespace())
            .unwrap_err();
        assert_eq!(err.kind(), ExcKind::TypeError, "{kind:?} base must be rejected");
        assert!(
            err.message().contains(name),
            "error should name the class, got: {msg}",
            msg = err.message()
        );
        assert_eq!(bridge.types().live_count(), live_before);
    }
}

#[test]
fn slots_in_the_namespace_are_rejected_before_construction() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let live_before = bridge.types().live_count();

    let mut namespace = empty_namespace();
    namespace.insert(
        "__slots__".to_owned(),
        Member::Value(GuestValue::Str("x".to_owned())),
    );
    let err = bridge
        .type_new(&mut host, "Slotted", &[GuestValue::Type(animal_type)], namespace)
        .unwrap_err();
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert_eq!(err.message(), "__slots__ is not supported on managed classes");
    assert_eq!(bridge.types().live_count(), live_before);
}

#[test]
fn unloaded_base_fails_naming_the_class() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let affected = host.unload_assembly("Zoo");
    bridge.notify_assembly_unloaded(&affected);

    let err = bridge
        .type_new(&mut host, "Ghost", &[GuestValue::Type(animal_type)], empty_namespace())
        .unwrap_err();
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert!(
        err.message().contains("Animal"),
        "error should name the unloaded base, got: {msg}",
        msg = err.message()
    );
}

#[test]
fn subclass_copies_slots_offset_and_handle_from_base() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let sub = bridge
        .type_new(&mut host, "Pet", &[GuestValue::Type(animal_type)], empty_namespace())
        .unwrap();

    let base = bridge.types().get(animal_type);
    let derived = bridge.types().get(sub);
    assert!(derived.is_guest_subclass());
    assert_eq!(derived.slots(), TypeSlots::managed(), "lifetime slots are copied verbatim");
    assert_eq!(derived.handle_offset(), base.handle_offset());
    assert_eq!(derived.handle(), base.handle(), "type-level handle value is copied");
    assert_eq!(derived.descriptor(), base.descriptor(), "ordinary subclasses share the base descriptor");
    let flags = derived.flags();
    assert!(flags.managed_instance && flags.heap_type && flags.base_type && flags.subclassable && flags.gc_participant);
    assert!(flags.ready);
    assert!(derived.version() > 0, "creation must invalidate the attribute cache");
}

#[test]
fn handle_copy_policy_controls_deep_subclass_levels() {
    let mut host = ModelHost::new();
    let (animal, _) = zoo(&mut host);

    // Default policy copies at every level.
    let mut bridge = Bridge::new();
    bridge.bootstrap();
    let root = bridge.wrap_class(&mut host, animal).unwrap();
    let first = bridge
        .type_new(&mut host, "First", &[GuestValue::Type(root)], empty_namespace())
        .unwrap();
    let second = bridge
        .type_new(&mut host, "Second", &[GuestValue::Type(first)], empty_namespace())
        .unwrap();
    assert_eq!(bridge.types().get(second).handle(), bridge.types().get(root).handle());

    // Bridge-point policy stops the value copy below the root proxy.
    let mut bridge = Bridge::with_config(BridgeConfig {
        handle_copy_policy: HandleCopyPolicy::BridgePoint,
    });
    bridge.bootstrap();
    let root = bridge.wrap_class(&mut host, animal).unwrap();
    let first = bridge
        .type_new(&mut host, "First", &[GuestValue::Type(root)], empty_namespace())
        .unwrap();
    let second = bridge
        .type_new(&mut host, "Second", &[GuestValue::Type(first)], empty_namespace())
        .unwrap();
    assert_eq!(bridge.types().get(first).handle(), bridge.types().get(root).handle());
    assert_eq!(bridge.types().get(second).handle(), None);
    // The offset invariant is not policy-dependent.
    assert_eq!(
        bridge.types().get(second).handle_offset(),
        bridge.types().get(root).handle_offset()
    );
}

#[test]
fn wrapping_the_same_class_twice_reuses_the_proxy() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let first = bridge.wrap_class(&mut host, animal).unwrap();
    let second = bridge.wrap_class(&mut host, animal).unwrap();
    assert_eq!(first, second, "one proxy type per distinct host class");
    assert_eq!(host.live_pins(), 1, "the class metadata is pinned once");
    assert_eq!(bridge.types().refcount(first), 2, "the second wrap returns a fresh reference");

    bridge.type_dec_ref(&mut host, first);
    assert!(bridge.types().is_live(first));
    bridge.type_dec_ref(&mut host, first);
    assert!(!bridge.types().is_live(first));
    assert_eq!(host.live_pins(), 0);
}

#[test]
fn reflected_subtype_delegates_to_the_host() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let mut namespace = empty_namespace();
    namespace.insert(
        "__assembly__".to_owned(),
        Member::Value(GuestValue::Str("Emitted".to_owned())),
    );
    namespace.insert(
        "__namespace__".to_owned(),
        Member::Value(GuestValue::Str("Farm".to_owned())),
    );
    let sub = bridge
        .type_new(&mut host, "Horse", &[GuestValue::Type(animal_type)], namespace)
        .unwrap();

    let derived = bridge.types().get(sub);
    assert_ne!(
        derived.descriptor(),
        bridge.types().get(animal_type).descriptor(),
        "a reflected subtype wraps its own emitted host class"
    );
    let descriptor = derived.descriptor().unwrap();
    assert_eq!(bridge.descriptors().get(descriptor).name(), "Farm.Horse");

    // The emitted class is assignable to its base in host metadata.
    let args = CallArgs::One(GuestValue::Type(sub));
    assert!(bridge.subclass_check(&host, animal_type, &args).unwrap());
}

// =============================================================================
// 2. Call protocol
// =============================================================================

#[test]
fn calling_a_proxy_type_builds_and_pins_a_host_object() {
    let (mut host, mut bridge) = fresh();
    let point = host.register_class("Point", "Geometry", ClassKind::Class, None);
    host.add_constructor(point, vec![]);
    host.add_constructor(point, vec![HostType::Int, HostType::Int]);
    let point_type = bridge.wrap_class(&mut host, point).unwrap();
    assert_eq!(host.live_pins(), 1, "wrapping pins the class metadata");

    let args = CallArgs::positional(vec![GuestValue::Int(3), GuestValue::Int(4)]);
    let value = bridge.type_call(&mut host, &ReflectBinder, point_type, &args).unwrap();
    let instance = value.as_instance().unwrap();
    assert_eq!(host.live_pins(), 2, "the instance pins the host object");

    let object = bridge.instances().get(instance).host_object().unwrap();
    assert_eq!(
        host.object_fields(object),
        &[tether::HostValue::Int(3), tether::HostValue::Int(4)]
    );
    assert!(!bridge.errors().occurred(), "absent initializer is not an error");
}

#[test]
fn initializer_receives_the_original_arguments() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let mut namespace = empty_namespace();
    namespace.insert("__init__".to_owned(), Member::Init(Thunk::RecordInitArgs));
    let sub = bridge
        .type_new(&mut host, "Named", &[GuestValue::Type(animal_type)], namespace)
        .unwrap();

    // The arguments bind no constructor; the zero-argument fallback applies
    // and the initializer still sees the original arguments.
    let args = CallArgs::One(GuestValue::Str("rex".to_owned()));
    let value = bridge.type_call(&mut host, &ReflectBinder, sub, &args).unwrap();
    let instance = value.as_instance().unwrap();

    let object = bridge.instances().get(instance).host_object().unwrap();
    assert!(host.object_fields(object).is_empty(), "the zero-argument constructor ran");
    assert_eq!(
        bridge.instances().get(instance).init_args(),
        Some(&[GuestValue::Str("rex".to_owned())][..])
    );
}

#[test]
fn failing_initializer_releases_the_fresh_object() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let mut namespace = empty_namespace();
    namespace.insert("__init__".to_owned(), Member::Init(Thunk::RejectCall));
    let sub = bridge
        .type_new(&mut host, "Grumpy", &[GuestValue::Type(animal_type)], namespace)
        .unwrap();
    let pins_before = host.live_pins();
    let instances_before = bridge.instances().live_count();

    let err = bridge
        .type_call(&mut host, &ReflectBinder, sub, &CallArgs::Empty)
        .unwrap_err();
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert_eq!(
        bridge.instances().live_count(),
        instances_before,
        "the partially constructed instance must be released"
    );
    assert_eq!(host.live_pins(), pins_before, "the object pin must be released with it");
}

// =============================================================================
// 3. Attribute assignment
// =============================================================================

#[test]
fn settable_descriptor_receives_the_value() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let mut namespace = empty_namespace();
    namespace.insert(
        "count".to_owned(),
        Member::Property {
            value: GuestValue::Int(0),
            settable: true,
        },
    );
    let sub = bridge
        .type_new(&mut host, "Counted", &[GuestValue::Type(animal_type)], namespace)
        .unwrap();

    let version_before = bridge.types().get(sub).version();
    bridge.type_setattro(&mut host, sub, "count", GuestValue::Int(7)).unwrap();
    let name = bridge.intern("count");
    assert_eq!(
        bridge.types().get(sub).member(name),
        Some(&Member::Property {
            value: GuestValue::Int(7),
            settable: true,
        })
    );
    assert_eq!(
        bridge.types().get(sub).version(),
        version_before,
        "descriptor assignment does not invalidate the attribute cache"
    );
}

#[test]
fn descriptor_without_set_hook_is_read_only() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let mut namespace = empty_namespace();
    namespace.insert(
        "kind".to_owned(),
        Member::Property {
            value: GuestValue::Str("animal".to_owned()),
            settable: false,
        },
    );
    namespace.insert("speak".to_owned(), Member::Method(GuestValue::None));
    let sub = bridge
        .type_new(&mut host, "Fixed", &[GuestValue::Type(animal_type)], namespace)
        .unwrap();

    let err = bridge
        .type_setattro(&mut host, sub, "kind", GuestValue::Str("mineral".to_owned()))
        .unwrap_err();
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert_eq!(err.message(), "attribute 'kind' is read-only");

    let err = bridge
        .type_setattro(&mut host, sub, "speak", GuestValue::None)
        .unwrap_err();
    assert_eq!(err.message(), "attribute 'speak' is read-only");
}

#[test]
fn generic_attribute_set_invalidates_the_cache() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let version_before = bridge.types().get(animal_type).version();
    bridge
        .type_setattro(&mut host, animal_type, "nickname", GuestValue::Str("bo".to_owned()))
        .unwrap();
    assert!(bridge.types().get(animal_type).version() > version_before);
    let name = bridge.intern("nickname");
    assert_eq!(
        bridge.types().get(animal_type).member(name),
        Some(&Member::Value(GuestValue::Str("bo".to_owned())))
    );
}

// =============================================================================
// 4. Indexing
// =============================================================================

#[test]
fn non_generic_types_are_unsubscriptable() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let err = bridge.type_subscript(&mut host, animal_type, &[]).unwrap_err();
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert_eq!(err.message(), "'Animal' object is unsubscriptable");
}

#[test]
fn generic_definition_binds_and_wraps_the_result() {
    let (mut host, mut bridge) = fresh();
    let list = host.register_class("List", "Collections", ClassKind::Class, None);
    host.mark_generic(list, 1);
    let (animal, _) = zoo(&mut host);
    let list_type = bridge.wrap_class(&mut host, list).unwrap();
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let bound = bridge
        .type_subscript(&mut host, list_type, &[GuestValue::Type(animal_type)])
        .unwrap();
    let bound_type = bound.as_type().unwrap();
    assert_eq!(bridge.types().get(bound_type).name(), "List[Animal]");
}

// =============================================================================
// 5. Instance and subclass checks
// =============================================================================

#[test]
fn assignability_drives_the_subclass_check() {
    let (mut host, mut bridge) = fresh();
    let (animal, dog) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let dog_type = bridge.wrap_class(&mut host, dog).unwrap();

    let dog_arg = CallArgs::One(GuestValue::Type(dog_type));
    let animal_arg = CallArgs::One(GuestValue::Type(animal_type));
    assert!(bridge.subclass_check(&host, animal_type, &dog_arg).unwrap());
    assert!(!bridge.subclass_check(&host, dog_type, &animal_arg).unwrap());
    assert!(bridge.subclass_check(&host, dog_type, &dog_arg).unwrap(), "a class is assignable to itself");
}

#[test]
fn instance_check_uses_the_runtime_type() {
    let (mut host, mut bridge) = fresh();
    let (animal, dog) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let dog_type = bridge.wrap_class(&mut host, dog).unwrap();

    let value = bridge
        .type_call(&mut host, &ReflectBinder, dog_type, &CallArgs::Empty)
        .unwrap();
    let args = CallArgs::One(value);
    assert!(bridge.instance_check(&host, animal_type, &args).unwrap());
    assert!(bridge.instance_check(&host, dog_type, &args).unwrap());
}

#[test]
fn invalid_descriptors_answer_false_without_raising() {
    let (mut host, mut bridge) = fresh();
    let (animal, dog) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let dog_type = bridge.wrap_class(&mut host, dog).unwrap();

    let affected = host.unload_assembly("Zoo");
    bridge.notify_assembly_unloaded(&affected);

    let args = CallArgs::One(GuestValue::Type(dog_type));
    assert!(!bridge.subclass_check(&host, animal_type, &args).unwrap());
    assert!(!bridge.instance_check(&host, animal_type, &args).unwrap());
}

#[test]
fn checks_require_exactly_one_argument() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let err = bridge.subclass_check(&host, animal_type, &CallArgs::Empty).unwrap_err();
    assert_eq!(err.kind(), ExcKind::TypeError);
    assert!(err.message().contains("__subclasscheck__"));

    let two = CallArgs::Two(GuestValue::Int(1), GuestValue::Int(2));
    let err = bridge.instance_check(&host, animal_type, &two).unwrap_err();
    assert!(err.message().contains("__instancecheck__"));
}

#[test]
fn non_bridge_comparands_answer_false() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();

    let args = CallArgs::One(GuestValue::Int(42));
    assert!(!bridge.subclass_check(&host, animal_type, &args).unwrap());
    assert!(!bridge.instance_check(&host, animal_type, &args).unwrap());
}

#[test]
fn checks_dispatch_through_their_fixed_thunk_names() {
    let (mut host, mut bridge) = fresh();
    let (animal, dog) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let dog_type = bridge.wrap_class(&mut host, dog).unwrap();

    let args = CallArgs::One(GuestValue::Type(dog_type));
    let result = bridge
        .invoke_meta_thunk(&host, "__subclasscheck__", animal_type, &args)
        .unwrap();
    assert_eq!(result, GuestValue::Bool(true));

    let err = bridge
        .invoke_meta_thunk(&host, "__missing__", animal_type, &args)
        .unwrap_err();
    assert_eq!(err.kind(), ExcKind::AttributeError);
}

// =============================================================================
// 6. Deallocation and handle accounting
// =============================================================================

#[test]
fn root_proxy_dealloc_releases_its_pin_exactly_once() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let pinned = bridge.types().get(animal_type).handle().unwrap();
    assert_eq!(host.live_pins(), 1);

    bridge.type_dec_ref(&mut host, animal_type);
    assert!(!bridge.types().is_live(animal_type));
    assert_eq!(host.live_pins(), 0);
    assert_eq!(host.released_handles(), &[pinned]);
}

#[test]
fn subclass_type_never_releases_the_copied_handle() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let sub = bridge
        .type_new(&mut host, "Pet", &[GuestValue::Type(animal_type)], empty_namespace())
        .unwrap();
    assert_eq!(bridge.types().get(sub).handle(), bridge.types().get(animal_type).handle());

    bridge.type_dec_ref(&mut host, sub);
    assert_eq!(host.live_pins(), 1, "the copied handle belongs to the root proxy");
    assert!(host.released_handles().is_empty());

    bridge.type_dec_ref(&mut host, animal_type);
    assert_eq!(host.live_pins(), 0);
    assert_eq!(host.released_handles().len(), 1);
}

#[test]
fn instance_dealloc_releases_the_instance_handle_once() {
    let (mut host, mut bridge) = fresh();
    let (_, dog) = zoo(&mut host);
    let dog_type = bridge.wrap_class(&mut host, dog).unwrap();

    let value = bridge
        .type_call(&mut host, &ReflectBinder, dog_type, &CallArgs::Empty)
        .unwrap();
    let instance = value.as_instance().unwrap();
    let offset = bridge.types().get(dog_type).handle_offset();
    let handle = bridge.instances().get(instance).handle_at(offset).unwrap();
    assert_eq!(host.live_pins(), 2);

    bridge.release_value(&mut host, value);
    assert!(!bridge.instances().is_live(instance));
    assert_eq!(host.live_pins(), 1, "only the class pin remains");
    assert_eq!(host.released_handles(), &[handle]);
}

#[test]
fn subclass_instance_releases_only_its_own_pin() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let sub = bridge
        .type_new(&mut host, "Pet", &[GuestValue::Type(animal_type)], empty_namespace())
        .unwrap();

    let value = bridge.type_call(&mut host, &ReflectBinder, sub, &CallArgs::Empty).unwrap();
    let instance = value.as_instance().unwrap();
    let offset = bridge.types().get(sub).handle_offset();
    let own = bridge.instances().get(instance).handle_at(offset).unwrap();
    assert_eq!(host.live_pins(), 2, "the class pin plus the instance pin");

    bridge.release_value(&mut host, value);
    assert_eq!(
        host.released_handles(),
        &[own],
        "the inherited dealloc slot releases the instance's own pin"
    );
    assert_eq!(host.live_pins(), 1, "the root proxy's class pin is untouched");
    assert_eq!(
        bridge.types().get(sub).handle(),
        bridge.types().get(animal_type).handle(),
        "the copied type-level handle value stays in place"
    );
}

#[test]
fn traverse_reports_and_clear_breaks_cross_runtime_cycles() {
    let (mut host, mut bridge) = fresh();
    let (animal, _) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let mut namespace = empty_namespace();
    namespace.insert("__init__".to_owned(), Member::Init(Thunk::RecordInitArgs));
    let sub = bridge
        .type_new(&mut host, "Knot", &[GuestValue::Type(animal_type)], namespace)
        .unwrap();

    let first = bridge.type_call(&mut host, &ReflectBinder, sub, &CallArgs::Empty).unwrap();
    let first_id = first.as_instance().unwrap();

    // The second instance holds the first through its recorded initializer
    // arguments, which is the reference the cycle detector must see.
    let args = CallArgs::One(bridge.clone_value(&first));
    let second = bridge.type_call(&mut host, &ReflectBinder, sub, &args).unwrap();
    let second_id = second.as_instance().unwrap();
    match args {
        CallArgs::One(value) => bridge.release_value(&mut host, value),
        _ => unreachable!(),
    }

    let refs = bridge.instance_traverse(second_id);
    assert!(refs.contains(&GuestValue::Type(sub)), "the type reference is reported");
    assert!(
        refs.contains(&GuestValue::Instance(first_id)),
        "the initializer-argument reference is reported"
    );

    bridge.instance_clear(&mut host, second_id);
    assert_eq!(
        bridge.instance_traverse(second_id).len(),
        1,
        "clear drops the non-handle references"
    );

    bridge.release_value(&mut host, first);
    assert!(!bridge.instances().is_live(first_id), "clearing released the cyclic reference");
    bridge.release_value(&mut host, second);
    assert_eq!(host.live_pins(), 1, "only the class pin remains after both instances die");
}

#[test]
fn full_teardown_leaves_zero_pins_and_empty_tables() {
    let (mut host, mut bridge) = fresh();
    let (animal, dog) = zoo(&mut host);
    let animal_type = bridge.wrap_class(&mut host, animal).unwrap();
    let dog_type = bridge.wrap_class(&mut host, dog).unwrap();
    let value = bridge
        .type_call(&mut host, &ReflectBinder, dog_type, &CallArgs::Empty)
        .unwrap();

    bridge.release_value(&mut host, value);
    bridge.type_dec_ref(&mut host, dog_type);
    bridge.type_dec_ref(&mut host, animal_type);
    bridge.teardown(&mut host);

    assert_eq!(host.live_pins(), 0);
    assert_eq!(bridge.types().live_count(), 0);
    assert_eq!(bridge.instances().live_count(), 0);
}

// =============================================================================
// 7. Bootstrap, teardown, persistence
// =============================================================================

#[test]
fn bootstrap_is_idempotent() {
    let mut bridge = Bridge::new();
    let first = bridge.bootstrap();
    let second = bridge.bootstrap();
    assert_eq!(first, second);
    assert_eq!(bridge.thunks().lookup("__instancecheck__"), Some(Thunk::MetaInstanceCheck));
    assert_eq!(bridge.thunks().lookup("__subclasscheck__"), Some(Thunk::MetaSubclassCheck));
}

#[test]
fn teardown_with_external_references_resets_thunk_state() {
    let mut host = ModelHost::new();
    let mut bridge = Bridge::new();
    let meta = bridge.bootstrap();
    bridge.type_inc_ref(meta);

    bridge.teardown(&mut host);
    assert!(bridge.thunks().is_empty(), "stale dispatch state must be reset");
    assert!(bridge.types().is_live(meta), "the external reference keeps the singleton alive");
}

#[test]
fn teardown_without_external_references_frees_the_singleton() {
    let mut host = ModelHost::new();
    let mut bridge = Bridge::new();
    bridge.bootstrap();
    bridge.teardown(&mut host);
    assert_eq!(bridge.types().live_count(), 0);
    assert_eq!(bridge.meta(), None);
}

#[test]
fn snapshot_round_trips_through_postcard() {
    let mut bridge = Bridge::new();
    bridge.bootstrap();
    let snapshot = bridge.capture_meta().unwrap();
    let bytes = snapshot.to_bytes().unwrap();
    let decoded = MetaSnapshot::from_bytes(&bytes).unwrap();
    assert_eq!(snapshot, decoded);
}

#[test]
fn restore_rebuilds_the_singleton_at_the_same_identity() {
    let mut host = ModelHost::new();
    let mut bridge = Bridge::new();
    bridge.bootstrap();
    let snapshot = bridge.capture_meta().unwrap();
    bridge.teardown(&mut host);

    let mut restored = Bridge::new();
    let meta = restored.restore_meta(&snapshot).unwrap();
    assert_eq!(meta, snapshot.meta());
    assert_eq!(restored.thunks().lookup("__instancecheck__"), Some(Thunk::MetaInstanceCheck));
    assert_eq!(restored.thunks().lookup("__subclasscheck__"), Some(Thunk::MetaSubclassCheck));

    // The restored singleton is fully functional.
    let (animal, dog) = zoo(&mut host);
    let animal_type = restored.wrap_class(&mut host, animal).unwrap();
    let dog_type = restored.wrap_class(&mut host, dog).unwrap();
    let args = CallArgs::One(GuestValue::Type(dog_type));
    assert!(restored.subclass_check(&host, animal_type, &args).unwrap());
}

// =============================================================================
// 8. Tracing
// =============================================================================

#[test]
fn recording_tracer_observes_balanced_pin_release_pairs() {
    let mut host = ModelHost::new();
    let mut bridge = Bridge::with_tracer(RecordingTracer::new());
    bridge.bootstrap();
    let (_, dog) = zoo(&mut host);
    let dog_type = bridge.wrap_class(&mut host, dog).unwrap();
    let value = bridge
        .type_call(&mut host, &ReflectBinder, dog_type, &CallArgs::Empty)
        .unwrap();
    bridge.release_value(&mut host, value);
    bridge.type_dec_ref(&mut host, dog_type);
    bridge.teardown(&mut host);

    let events = bridge.tracer().events();
    let pinned = events.iter().filter(|e| matches!(e, TraceEvent::HandlePinned { .. })).count();
    let released = events
        .iter()
        .filter(|e| matches!(e, TraceEvent::HandleReleased { .. }))
        .count();
    assert_eq!(pinned, 2, "one class pin and one instance pin");
    assert_eq!(released, pinned, "every pin must be released");

    let bound_at = events
        .iter()
        .position(|e| matches!(e, TraceEvent::ConstructorBound { .. }))
        .expect("constructor binding should be traced");
    let invoked_at = events
        .iter()
        .position(|e| matches!(e, TraceEvent::ConstructorInvoked { ok: true, .. }))
        .expect("constructor invocation should be traced");
    assert!(bound_at < invoked_at);
}
