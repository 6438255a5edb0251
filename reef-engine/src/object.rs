use crate::Errno;

use reef_types::Oid;

use std::any::Any;
use std::collections::HashMap;

/// Type-private in-memory state attached to an object.
pub type Membuf = Box<dyn Any + Send>;

/// Opaque per-atom payload a type hands to the transaction engine at
/// registration and receives back in `apply`/`revert`.
///
/// Types give it whatever meaning they need; the deque stores which side
/// of the queue the atom locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationToken(pub u64);

/// A named, typed instance living in the store.
pub struct Object {
    oid: Oid,
    label: String,
    plug: &'static dyn ObjectPlug,
    membuf: Membuf,
}

impl Object {
    pub(crate) fn new(oid: Oid, label: String, plug: &'static dyn ObjectPlug) -> Result<Self, Errno> {
        Ok(Self {
            oid,
            label,
            plug,
            membuf: plug.create()?,
        })
    }

    /// Stable object id.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Name the object was created under.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The type behavior bound at creation, stable for the object's life.
    pub fn plug(&self) -> &'static dyn ObjectPlug {
        self.plug
    }

    /// Borrow the type-private state.
    pub fn membuf<T: 'static>(&self) -> Result<&T, Errno> {
        self.membuf.downcast_ref().ok_or(Errno::WrongObjectType)
    }

    /// Mutably borrow the type-private state.
    pub fn membuf_mut<T: 'static>(&mut self) -> Result<&mut T, Errno> {
        self.membuf.downcast_mut().ok_or(Errno::WrongObjectType)
    }
}

impl core::fmt::Debug for Object {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Object")
            .field("oid", &self.oid)
            .field("label", &self.label)
            .field("type", &self.plug.type_label())
            .finish()
    }
}

/// Behavior table of an object type.
///
/// Exactly one implementation is chosen at object-create time. `apply`
/// and `revert` must not fail once an atom exists: types arrange their
/// writes so that everything fallible happens during the write call.
pub trait ObjectPlug: Send + Sync {
    /// The label the registry resolves to this plug.
    fn type_label(&self) -> &'static str;

    /// Allocate the type-private state of a fresh object.
    fn create(&self) -> Result<Membuf, Errno>;

    /// Rebuild in-memory state for an object loaded from durable storage;
    /// a no-op for the purely in-memory built-ins.
    fn open(&self, object: &mut Object) -> Result<(), Errno> {
        let _ = object;
        Ok(())
    }

    /// Release the type-private state.
    fn close(&self, object: &mut Object) -> Result<(), Errno> {
        let _ = object;
        Ok(())
    }

    /// Promote pending writes whose operation locks are clear.
    fn commit(&self, object: &mut Object) -> Result<(), Errno>;

    /// Discard pending writes whose operation locks are clear.
    fn rollback(&self, object: &mut Object) -> Result<(), Errno>;

    /// Make one atom's writes durable-visible; infallible by contract.
    fn apply(&self, object: &mut Object, mutation: MutationToken);

    /// Undo one atom's writes; infallible by contract.
    fn revert(&self, object: &mut Object, mutation: MutationToken);

    /// Flush durable state, for types that have any.
    fn sync(&self, object: &mut Object) -> Result<(), Errno> {
        let _ = object;
        Ok(())
    }

    /// Destroy durable state, for types that have any.
    fn unlink(&self, object: &mut Object) -> Result<(), Errno> {
        let _ = object;
        Ok(())
    }
}

/// Boot-time map from type label to plug.
pub struct Registry {
    plugs: HashMap<&'static str, &'static dyn ObjectPlug>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            plugs: HashMap::new(),
        }
    }

    /// Registry with the built-in object types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(&crate::types::number::NumberPlug);
        registry.register(&crate::types::deque::DequePlug);
        registry.register(&crate::types::flow::FlowPlug);
        registry.register(&crate::types::counter::CounterPlug);
        registry
    }

    /// Bind a plug under its type label.
    pub fn register(&mut self, plug: &'static dyn ObjectPlug) {
        self.plugs.insert(plug.type_label(), plug);
    }

    /// Resolve a type label.
    pub fn resolve(&self, type_label: &str) -> Option<&'static dyn ObjectPlug> {
        self.plugs.get(type_label).copied()
    }
}
