//! In-memory reflective host object model.
//!
//! [`ModelHost`] is a complete [`HostReflect`] implementation backed by plain
//! tables: classes with kinds and base chains, constructor signatures,
//! materialized objects, and pin accounting. The integration tests run the
//! bridge against it, and embedders can prototype guest-side behavior before
//! wiring a real host runtime.
//!
//! Objects are materialized eagerly: invoking a constructor records the class
//! and the converted argument values as the object's fields, which is enough
//! to observe which overload ran and with what data.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::host::{
    ClassKind, ClassToken, CtorId, HostError, HostErrorKind, HostReflect, HostType, HostValue, ObjectToken, RawHandle,
};

/// One registered class.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ModelClass {
    name: String,
    assembly: String,
    kind: ClassKind,
    base: Option<ClassToken>,
    ctors: SmallVec<[CtorId; 4]>,
    generic_params: usize,
    unloaded: bool,
}

/// One registered constructor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ModelCtor {
    owner: ClassToken,
    params: Vec<HostType>,
    /// When set, invocation fails with a clone of this error instead of
    /// producing an object. Used to model throwing constructors.
    failure: Option<HostError>,
}

/// One materialized object.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ModelObject {
    class: ClassToken,
    fields: Vec<HostValue>,
}

/// What a live handle pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pinned {
    Object(ObjectToken),
    Class(ClassToken),
}

/// An in-memory host object model.
///
/// Class and constructor registration happens up front; the bridge then
/// drives the model exclusively through [`HostReflect`]. The model tracks
/// every pin it hands out, so tests can assert that handle release is
/// balanced after teardown.
#[derive(Debug, Default)]
pub struct ModelHost {
    classes: Vec<ModelClass>,
    ctors: Vec<ModelCtor>,
    objects: Vec<ModelObject>,
    pins: AHashMap<u64, Pinned>,
    next_handle: u64,
    released: Vec<RawHandle>,
}

impl ModelHost {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class, returning its token.
    pub fn register_class(
        &mut self,
        name: impl Into<String>,
        assembly: impl Into<String>,
        kind: ClassKind,
        base: Option<ClassToken>,
    ) -> ClassToken {
        let token = ClassToken::new(u32::try_from(self.classes.len()).expect("class table overflow"));
        self.classes.push(ModelClass {
            name: name.into(),
            assembly: assembly.into(),
            kind,
            base,
            ctors: SmallVec::new(),
            generic_params: 0,
            unloaded: false,
        });
        token
    }

    /// Registers a constructor on a class.
    pub fn add_constructor(&mut self, class: ClassToken, params: Vec<HostType>) -> CtorId {
        self.add_ctor_entry(class, params, None)
    }

    /// Registers a constructor that always fails with the given error.
    pub fn add_failing_constructor(&mut self, class: ClassToken, params: Vec<HostType>, failure: HostError) -> CtorId {
        self.add_ctor_entry(class, params, Some(failure))
    }

    fn add_ctor_entry(&mut self, class: ClassToken, params: Vec<HostType>, failure: Option<HostError>) -> CtorId {
        let id = CtorId::new(u32::try_from(self.ctors.len()).expect("ctor table overflow"));
        self.ctors.push(ModelCtor {
            owner: class,
            params,
            failure,
        });
        self.classes[class.raw() as usize].ctors.push(id);
        id
    }

    /// Marks a class as an open generic definition with `params` parameters.
    pub fn mark_generic(&mut self, class: ClassToken, params: usize) {
        self.classes[class.raw() as usize].generic_params = params;
    }

    /// Unloads an assembly, invalidating every class registered under it.
    ///
    /// Returns the affected class tokens so the caller can invalidate the
    /// matching descriptors.
    pub fn unload_assembly(&mut self, assembly: &str) -> Vec<ClassToken> {
        let mut affected = Vec::new();
        for (index, class) in self.classes.iter_mut().enumerate() {
            if class.assembly == assembly && !class.unloaded {
                class.unloaded = true;
                affected.push(ClassToken::new(u32::try_from(index).expect("class table overflow")));
            }
        }
        affected
    }

    /// Returns the recorded field values of a materialized object.
    #[must_use]
    pub fn object_fields(&self, object: ObjectToken) -> &[HostValue] {
        &self.objects[usize::try_from(object.raw()).expect("object token out of range")].fields
    }

    /// Returns the class of a materialized object.
    #[must_use]
    pub fn object_class(&self, object: ObjectToken) -> ClassToken {
        self.objects[usize::try_from(object.raw()).expect("object token out of range")].class
    }

    /// Returns the number of currently live pins.
    #[must_use]
    pub fn live_pins(&self) -> usize {
        self.pins.len()
    }

    /// Returns the handles released so far, in release order.
    #[must_use]
    pub fn released_handles(&self) -> &[RawHandle] {
        &self.released
    }

    fn class(&self, token: ClassToken) -> &ModelClass {
        &self.classes[token.raw() as usize]
    }

    fn materialize(&mut self, class: ClassToken, fields: Vec<HostValue>) -> ObjectToken {
        let token = ObjectToken::new(u64::try_from(self.objects.len()).expect("object table overflow"));
        self.objects.push(ModelObject { class, fields });
        token
    }

    fn next_pin(&mut self, pinned: Pinned) -> RawHandle {
        self.next_handle += 1;
        let handle = RawHandle::new(self.next_handle);
        self.pins.insert(handle.raw(), pinned);
        handle
    }
}

impl HostReflect for ModelHost {
    fn class_is_valid(&self, class: ClassToken) -> bool {
        !self.class(class).unloaded
    }

    fn class_name(&self, class: ClassToken) -> &str {
        &self.class(class).name
    }

    fn class_kind(&self, class: ClassToken) -> ClassKind {
        self.class(class).kind
    }

    fn can_subclass(&self, class: ClassToken) -> bool {
        !matches!(
            self.class(class).kind,
            ClassKind::Delegate | ClassKind::Enum | ClassKind::Array
        )
    }

    fn is_assignable_from(&self, base: ClassToken, derived: ClassToken) -> bool {
        let mut current = Some(derived);
        while let Some(token) = current {
            if token == base {
                return true;
            }
            current = self.class(token).base;
        }
        false
    }

    fn is_generic_definition(&self, class: ClassToken) -> bool {
        self.class(class).generic_params > 0
    }

    fn bind_generic(&mut self, class: ClassToken, args: &[ClassToken]) -> Option<ClassToken> {
        let definition = self.class(class);
        if definition.generic_params == 0 || definition.generic_params != args.len() {
            return None;
        }
        let bound_name = format!(
            "{}[{}]",
            definition.name,
            args.iter()
                .map(|&arg| self.class(arg).name.clone())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let assembly = definition.assembly.clone();
        let kind = definition.kind;
        let base = definition.base;
        let ctors = definition.ctors.clone();
        let token = self.register_class(bound_name, assembly, kind, base);
        self.classes[token.raw() as usize].ctors = ctors;
        Some(token)
    }

    fn constructors(&self, class: ClassToken) -> SmallVec<[CtorId; 4]> {
        self.class(class).ctors.clone()
    }

    fn constructor_params(&self, ctor: CtorId) -> &[HostType] {
        &self.ctors[ctor.raw() as usize].params
    }

    fn constructor_owner(&self, ctor: CtorId) -> ClassToken {
        self.ctors[ctor.raw() as usize].owner
    }

    fn invoke_constructor(&mut self, ctor: CtorId, args: &[HostValue]) -> Result<ObjectToken, HostError> {
        let entry = &self.ctors[ctor.raw() as usize];
        let owner = entry.owner;
        if self.class(owner).unloaded {
            return Err(HostError::new(
                HostErrorKind::ClassUnloaded,
                format!("class '{}' has been unloaded", self.class(owner).name),
            ));
        }
        if let Some(failure) = &self.ctors[ctor.raw() as usize].failure {
            // Wrap the scripted failure the way a reflective invocation layer would.
            let inner = failure.clone();
            return Err(HostError::wrapping(
                HostErrorKind::Invocation,
                "exception has been thrown by the target of an invocation",
                inner,
            ));
        }
        if self.ctors[ctor.raw() as usize].params.len() != args.len() {
            return Err(HostError::new(
                HostErrorKind::InvalidArgument,
                format!(
                    "constructor expects {} arguments, got {}",
                    self.ctors[ctor.raw() as usize].params.len(),
                    args.len()
                ),
            ));
        }
        Ok(self.materialize(owner, args.to_vec()))
    }

    fn default_construct(&mut self, class: ClassToken) -> Result<ObjectToken, HostError> {
        if self.class(class).unloaded {
            return Err(HostError::new(
                HostErrorKind::ClassUnloaded,
                format!("class '{}' has been unloaded", self.class(class).name),
            ));
        }
        Ok(self.materialize(class, Vec::new()))
    }

    fn create_reflected_subtype(
        &mut self,
        name: &str,
        base: ClassToken,
        assembly: &str,
        namespace: &str,
    ) -> Result<ClassToken, HostError> {
        if self.class(base).unloaded {
            return Err(HostError::new(
                HostErrorKind::ClassUnloaded,
                format!("class '{}' has been unloaded", self.class(base).name),
            ));
        }
        let qualified = format!("{namespace}.{name}");
        let ctors = self.class(base).ctors.clone();
        let token = self.register_class(qualified, assembly.to_owned(), ClassKind::Class, Some(base));
        // The emitted subtype is constructible through its base's constructors.
        self.classes[token.raw() as usize].ctors = ctors;
        Ok(token)
    }

    fn pin(&mut self, object: ObjectToken) -> RawHandle {
        self.next_pin(Pinned::Object(object))
    }

    fn pin_class(&mut self, class: ClassToken) -> RawHandle {
        self.next_pin(Pinned::Class(class))
    }

    fn resolve_handle(&self, handle: RawHandle) -> Option<ObjectToken> {
        match self.pins.get(&handle.raw()) {
            Some(Pinned::Object(object)) => Some(*object),
            _ => None,
        }
    }

    fn release(&mut self, handle: RawHandle) {
        let removed = self.pins.remove(&handle.raw());
        debug_assert!(removed.is_some(), "handle {handle:?} released twice");
        self.released.push(handle);
    }
}
