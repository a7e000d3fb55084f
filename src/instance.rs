//! Entity and collection instances as the application holds them.
//!
//! An [`EntityRef`] is a shared handle; equality and hashing go by the address of the underlying instance, never by
//! its content. A proxy is an instance whose body is still [`InstanceBody::Uninitialized`]; initializing it replaces
//! the body in place so the application's handle stays the canonical reference for the row.

use parking_lot::RwLock;
use std::fmt::Debug;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::OrmError;
use crate::error::Result;
use crate::types::Identifier;
use crate::types::Value;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

fn next_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

pub(crate) enum InstanceBody {
    Initialized(Vec<Value>),
    Uninitialized,
    // A proxy bound to a separately allocated instance which became the managed one for the same key.
    Delegate(EntityRef),
}

struct InstanceInner {
    entity_name: Arc<str>,
    id:          Option<Identifier>,
    body:        InstanceBody,
}

pub struct EntityInstance {
    serial: u64,
    inner:  RwLock<InstanceInner>,
}

#[derive(Clone)]
pub struct EntityRef(Arc<EntityInstance>);

impl EntityRef {
    pub(crate) fn new_initialized(entity_name: Arc<str>, id: Option<Identifier>, state: Vec<Value>) -> Self {
        Self(Arc::new(EntityInstance {
            serial: next_serial(),
            inner:  RwLock::new(InstanceInner {
                entity_name,
                id,
                body: InstanceBody::Initialized(state),
            }),
        }))
    }

    pub(crate) fn new_proxy(entity_name: Arc<str>, id: Identifier) -> Self {
        Self(Arc::new(EntityInstance {
            serial: next_serial(),
            inner:  RwLock::new(InstanceInner {
                entity_name,
                id:   Some(id),
                body: InstanceBody::Uninitialized,
            }),
        }))
    }

    /// Follows a delegating proxy to the instance it is bound to.
    pub fn resolve(&self) -> EntityRef {
        let target = {
            let inner = self.0.inner.read();
            match inner.body {
                InstanceBody::Delegate(ref target) => Some(target.clone()),
                _ => None,
            }
        };
        target.map_or_else(|| self.clone(), |t| t.resolve())
    }

    #[inline]
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Identity comparison after following delegating proxies.
    pub fn same_target(&self, other: &EntityRef) -> bool {
        self.ptr_eq(other) || self.resolve().ptr_eq(&other.resolve())
    }

    /// Process-unique creation number of the instance.
    #[inline]
    pub fn serial(&self) -> u64 {
        self.0.serial
    }

    pub fn entity_name(&self) -> Arc<str> {
        self.0.inner.read().entity_name.clone()
    }

    pub fn id(&self) -> Option<Identifier> {
        self.0.inner.read().id.clone()
    }

    pub fn is_initialized(&self) -> bool {
        match self.0.inner.read().body {
            InstanceBody::Initialized(_) => true,
            InstanceBody::Uninitialized => false,
            InstanceBody::Delegate(ref target) => target.is_initialized(),
        }
    }

    /// A proxy which has never been initialized nor bound to another instance.
    pub fn is_uninitialized_proxy(&self) -> bool {
        matches!(self.0.inner.read().body, InstanceBody::Uninitialized)
    }

    pub fn is_delegate(&self) -> bool {
        matches!(self.0.inner.read().body, InstanceBody::Delegate(_))
    }

    fn lazy_error(&self) -> OrmError {
        let inner = self.0.inner.read();
        OrmError::LazyInitialization(format!(
            "[{}#{}]",
            inner.entity_name,
            inner.id.as_ref().map_or_else(|| "<null>".to_string(), |id| id.to_string())
        ))
    }

    /// Copy of the current property values.
    pub fn state(&self) -> Result<Vec<Value>> {
        let delegate = {
            let inner = self.0.inner.read();
            match inner.body {
                InstanceBody::Initialized(ref state) => return Ok(state.clone()),
                InstanceBody::Uninitialized => None,
                InstanceBody::Delegate(ref target) => Some(target.clone()),
            }
        };
        match delegate {
            Some(target) => target.state(),
            None => Err(self.lazy_error()),
        }
    }

    pub fn value(&self, index: usize) -> Result<Value> {
        let state = self.state()?;
        state
            .get(index)
            .cloned()
            .ok_or_else(|| OrmError::IllegalArgument(format!("property index {index} out of range")))
    }

    pub(crate) fn set_value(&self, index: usize, value: Value) -> Result<()> {
        let target = self.resolve();
        let mut inner = target.0.inner.write();
        match inner.body {
            InstanceBody::Initialized(ref mut state) => {
                let slot = state
                    .get_mut(index)
                    .ok_or_else(|| OrmError::IllegalArgument(format!("property index {index} out of range")))?;
                *slot = value;
                Ok(())
            }
            _ => {
                drop(inner);
                Err(target.lazy_error())
            }
        }
    }

    /// Overwrites the whole state. An uninitialized proxy becomes initialized in place.
    pub(crate) fn replace_state(&self, state: Vec<Value>) {
        let target = self.resolve();
        target.0.inner.write().body = InstanceBody::Initialized(state);
    }

    pub(crate) fn set_id(&self, id: Option<Identifier>) {
        let target = self.resolve();
        target.0.inner.write().id = id;
    }

    /// Narrows the instance to a more specific entity name without allocating a new instance.
    pub(crate) fn narrow(&self, entity_name: Arc<str>) {
        self.0.inner.write().entity_name = entity_name;
    }

    pub(crate) fn delegate_to(&self, target: &EntityRef) {
        if !self.ptr_eq(target) {
            self.0.inner.write().body = InstanceBody::Delegate(target.clone());
        }
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state)
    }
}

impl Debug for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.inner.read();
        let kind = match inner.body {
            InstanceBody::Initialized(_) => "",
            InstanceBody::Uninitialized => " proxy",
            InstanceBody::Delegate(_) => " delegate",
        };
        match inner.id {
            Some(ref id) => write!(f, "EntityRef({}#{id} @{}{kind})", inner.entity_name, self.0.serial),
            None => write!(f, "EntityRef({}#<transient> @{}{kind})", inner.entity_name, self.0.serial),
        }
    }
}

/// Operations recorded against a collection that was not initialized when they were requested.
#[derive(Clone, Debug)]
pub enum QueuedOperation {
    Add(EntityRef),
    Remove(EntityRef),
}

impl QueuedOperation {
    pub fn element(&self) -> &EntityRef {
        match self {
            QueuedOperation::Add(e) | QueuedOperation::Remove(e) => e,
        }
    }
}

struct CollectionInner {
    // None while the collection is uninitialized.
    elements: Option<Vec<EntityRef>>,
    queued:   Vec<QueuedOperation>,
    dirty:    bool,
}

pub struct CollectionInstance {
    serial: u64,
    role:   Arc<str>,
    inner:  RwLock<CollectionInner>,
}

/// Handle of a persistent collection of entities. Set semantics by instance identity.
#[derive(Clone)]
pub struct CollectionRef(Arc<CollectionInstance>);

impl CollectionRef {
    /// A new, empty and initialized collection for the given role.
    pub fn new(role: impl Into<Arc<str>>) -> Self {
        Self::build(role.into(), Some(Vec::new()))
    }

    pub(crate) fn uninitialized(role: Arc<str>) -> Self {
        Self::build(role, None)
    }

    fn build(role: Arc<str>, elements: Option<Vec<EntityRef>>) -> Self {
        Self(Arc::new(CollectionInstance {
            serial: next_serial(),
            role,
            inner: RwLock::new(CollectionInner {
                elements,
                queued: Vec::new(),
                dirty: false,
            }),
        }))
    }

    #[inline]
    pub fn role(&self) -> &str {
        &self.0.role
    }

    #[inline]
    pub fn serial(&self) -> u64 {
        self.0.serial
    }

    pub fn is_initialized(&self) -> bool {
        self.0.inner.read().elements.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        let inner = self.0.inner.read();
        inner.dirty || !inner.queued.is_empty()
    }

    fn lazy_error(&self) -> OrmError {
        OrmError::LazyInitialization(format!("collection of role {}", self.0.role))
    }

    pub fn elements(&self) -> Result<Vec<EntityRef>> {
        self.0.inner.read().elements.clone().ok_or_else(|| self.lazy_error())
    }

    pub fn len(&self) -> Result<usize> {
        self.0
            .inner
            .read()
            .elements
            .as_ref()
            .map(Vec::len)
            .ok_or_else(|| self.lazy_error())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, element: &EntityRef) -> Result<bool> {
        let inner = self.0.inner.read();
        let elements = inner.elements.as_ref().ok_or_else(|| self.lazy_error())?;
        Ok(elements.iter().any(|e| e.same_target(element)))
    }

    /// Adds an element. On an uninitialized collection the addition is queued and applied once the collection is
    /// initialized or flushed; the result is then always `true`.
    pub fn add(&self, element: EntityRef) -> bool {
        let mut inner = self.0.inner.write();
        match inner.elements {
            Some(ref mut elements) => {
                if elements.iter().any(|e| e.same_target(&element)) {
                    return false;
                }
                elements.push(element);
                inner.dirty = true;
                true
            }
            None => {
                inner.queued.push(QueuedOperation::Add(element));
                true
            }
        }
    }

    pub fn remove(&self, element: &EntityRef) -> bool {
        let mut inner = self.0.inner.write();
        match inner.elements {
            Some(ref mut elements) => {
                let before = elements.len();
                elements.retain(|e| !e.same_target(element));
                let removed = elements.len() != before;
                inner.dirty |= removed;
                removed
            }
            None => {
                inner.queued.push(QueuedOperation::Remove(element.clone()));
                true
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        let mut inner = self.0.inner.write();
        match inner.elements {
            Some(ref mut elements) => {
                if !elements.is_empty() {
                    elements.clear();
                    inner.dirty = true;
                }
                Ok(())
            }
            None => {
                drop(inner);
                Err(self.lazy_error())
            }
        }
    }

    pub fn queued_operations(&self) -> Vec<QueuedOperation> {
        self.0.inner.read().queued.clone()
    }

    /// Installs loaded elements and applies operations queued while uninitialized.
    pub(crate) fn initialize_with(&self, loaded: Vec<EntityRef>) {
        let mut inner = self.0.inner.write();
        let queued = std::mem::take(&mut inner.queued);
        let mut elements = loaded;
        let mut dirty = false;
        for op in queued {
            match op {
                QueuedOperation::Add(e) => {
                    if !elements.iter().any(|x| x.same_target(&e)) {
                        elements.push(e);
                        dirty = true;
                    }
                }
                QueuedOperation::Remove(e) => {
                    let before = elements.len();
                    elements.retain(|x| !x.same_target(&e));
                    dirty |= before != elements.len();
                }
            }
        }
        inner.elements = Some(elements);
        inner.dirty = dirty;
    }

    pub(crate) fn take_queued(&self) -> Vec<QueuedOperation> {
        std::mem::take(&mut self.0.inner.write().queued)
    }

    pub(crate) fn clear_dirty(&self) {
        self.0.inner.write().dirty = false;
    }

    pub(crate) fn mark_dirty(&self) {
        self.0.inner.write().dirty = true;
    }

    /// Rebuilds a collection from its decoded parts.
    pub(crate) fn restore(
        role: Arc<str>,
        elements: Option<Vec<EntityRef>>,
        queued: Vec<QueuedOperation>,
        dirty: bool,
    ) -> Self {
        let collection = Self::build(role, elements);
        {
            let mut inner = collection.0.inner.write();
            inner.queued = queued;
            inner.dirty = dirty;
        }
        collection
    }

    pub(crate) fn reset_uninitialized(&self) {
        let mut inner = self.0.inner.write();
        inner.elements = None;
        inner.queued.clear();
        inner.dirty = false;
    }
}

impl PartialEq for CollectionRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CollectionRef {}

impl Hash for CollectionRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state)
    }
}

impl Debug for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.inner.read();
        match inner.elements {
            Some(ref e) => write!(f, "CollectionRef({} @{} len={})", self.0.role, self.0.serial, e.len()),
            None => write!(
                f,
                "CollectionRef({} @{} uninitialized, {} queued)",
                self.0.role,
                self.0.serial,
                inner.queued.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, id: i64) -> EntityRef {
        EntityRef::new_initialized(Arc::from(name), Some(Identifier::Int(id)), vec![Value::Null])
    }

    #[test]
    fn identity_not_content() {
        let a = entity("Parent", 1);
        let b = entity("Parent", 1);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn proxy_initializes_in_place() {
        let proxy = EntityRef::new_proxy(Arc::from("Parent"), Identifier::Int(1));
        let held = proxy.clone();
        assert!(matches!(proxy.state(), Err(OrmError::LazyInitialization(_))));
        proxy.replace_state(vec![Value::from("x")]);
        assert!(held.is_initialized());
        assert_eq!(held.value(0).unwrap(), Value::from("x"));
    }

    #[test]
    fn delegate_forwards_reads_and_writes() {
        let proxy = EntityRef::new_proxy(Arc::from("Parent"), Identifier::Int(1));
        let real = entity("Parent", 1);
        proxy.delegate_to(&real);
        proxy.set_value(0, Value::from(5i64)).unwrap();
        assert_eq!(real.value(0).unwrap(), Value::Int(5));
        assert!(proxy.same_target(&real));
        assert!(!proxy.ptr_eq(&real));
    }

    #[test]
    fn queued_operations_apply_on_initialize() {
        let coll = CollectionRef::uninitialized(Arc::from("Parent.children"));
        let a = entity("Child", 1);
        let b = entity("Child", 2);
        assert!(coll.add(b.clone()));
        assert!(coll.remove(&a));
        assert_eq!(coll.queued_operations().len(), 2);
        assert!(coll.len().is_err());

        coll.initialize_with(vec![a.clone()]);
        let elements = coll.elements().unwrap();
        assert_eq!(elements, vec![b]);
        assert!(coll.is_dirty());
        assert!(coll.queued_operations().is_empty());
    }

    #[test]
    fn set_semantics() {
        let coll = CollectionRef::new("Parent.children");
        let a = entity("Child", 1);
        assert!(coll.add(a.clone()));
        assert!(!coll.add(a.clone()));
        assert!(coll.remove(&a));
        assert!(!coll.remove(&a));
        assert!(coll.is_empty().unwrap());
    }
}
