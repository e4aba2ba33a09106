//! Working contexts
//!
//! A [`Context`] is a confined view over the object graph. It holds the
//! objects it has materialized and its uncommitted changes; everything else
//! is read through its parent, and the root reads from the store.
//!
//! Committing a child pushes its changes into the parent's pending set.
//! Committing the root writes them to disk. Before either, every inserted
//! object is given a permanent identity.

pub mod hierarchy;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{ErrorHandler, StackError, StackResult};
use crate::lane::SerialLane;
use crate::merge::ChangeMergeBroker;
use crate::model::Model;
use crate::object::{ChangeEvent, ChangeSet, ManagedObject, ObjectId, Properties};
use crate::storage::PersistentStore;

pub use hierarchy::ContextHierarchy;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        ContextId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContextRole {
    Root,
    Main,
    Worker,
}

impl fmt::Display for ContextRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextRole::Root => write!(f, "root"),
            ContextRole::Main => write!(f, "main"),
            ContextRole::Worker => write!(f, "worker"),
        }
    }
}

/// What a commit did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommitOutcome {
    /// Nothing was pending; no event was published
    NoChanges,
    /// Changes moved into the parent's pending set
    Pushed { changes: usize },
    /// Changes were written to disk
    Persisted { changes: usize },
}

impl CommitOutcome {
    pub fn changes(&self) -> usize {
        match self {
            CommitOutcome::NoChanges => 0,
            CommitOutcome::Pushed { changes } | CommitOutcome::Persisted { changes } => *changes,
        }
    }
}

enum Confinement {
    /// Runs on a private serial lane
    Lane(Arc<SerialLane>),
    /// Usable only from one thread
    Thread(ThreadId),
}

#[derive(Default)]
struct ContextState {
    /// Objects materialized here: inserted, edited or merged in
    registered: BTreeMap<ObjectId, ManagedObject>,
    pending: ChangeSet,
    next_serial: u64,
    /// Temporary ids already replaced by permanent ones
    assigned: HashMap<ObjectId, ObjectId>,
}

impl ContextState {
    fn canonical(&self, id: ObjectId) -> ObjectId {
        self.assigned.get(&id).copied().unwrap_or(id)
    }

    /// Local changes laid over an object read from the parent
    fn overlay(&self, mut object: ManagedObject) -> Option<ManagedObject> {
        if self.pending.deleted.contains_key(&object.id) {
            return None;
        }
        if let Some(registered) = self.registered.get(&object.id) {
            return Some(registered.clone());
        }
        if let Some(change) = self.pending.updated.get(&object.id) {
            object.apply(&change.values);
        }
        Some(object)
    }

    /// Pre-commit hook: replace every pending temporary id
    ///
    /// Returns how many ids were assigned; zero on a second call.
    fn assign_permanent_ids(&mut self) -> usize {
        let mapping: HashMap<ObjectId, ObjectId> = self
            .pending
            .temporary_ids()
            .into_iter()
            .map(|temporary| (temporary, ObjectId::new_permanent()))
            .collect();
        if mapping.is_empty() {
            return 0;
        }

        self.pending.remap(&mapping);
        self.registered = std::mem::take(&mut self.registered)
            .into_values()
            .map(|mut object| {
                if let Some(permanent) = mapping.get(&object.id) {
                    object.id = *permanent;
                }
                (object.id, object)
            })
            .collect();

        let assigned = mapping.len();
        self.assigned.extend(mapping);
        assigned
    }
}

pub(crate) struct ContextInner {
    id: ContextId,
    role: ContextRole,
    name: String,
    confinement: Confinement,
    parent: Option<Context>,
    store: Option<PersistentStore>,
    model: Option<Arc<Model>>,
    broker: Arc<ChangeMergeBroker>,
    errors: Arc<dyn ErrorHandler>,
    state: Mutex<ContextState>,
}

/// Handle to a working context
///
/// Handles are cheap to clone and may be sent anywhere, but every operation
/// must come from the context's own thread (main and workers) or is hopped
/// onto the private lane (root).
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Context {
    pub(crate) fn root(
        store: PersistentStore,
        lane: Arc<SerialLane>,
        model: Option<Arc<Model>>,
        broker: Arc<ChangeMergeBroker>,
        errors: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self::build(
            ContextRole::Root,
            Confinement::Lane(lane),
            None,
            Some(store),
            model,
            broker,
            errors,
        )
    }

    pub(crate) fn child(role: ContextRole, parent: &Context, owner: ThreadId) -> Self {
        Self::build(
            role,
            Confinement::Thread(owner),
            Some(parent.clone()),
            None,
            parent.inner.model.clone(),
            Arc::clone(&parent.inner.broker),
            Arc::clone(&parent.inner.errors),
        )
    }

    fn build(
        role: ContextRole,
        confinement: Confinement,
        parent: Option<Context>,
        store: Option<PersistentStore>,
        model: Option<Arc<Model>>,
        broker: Arc<ChangeMergeBroker>,
        errors: Arc<dyn ErrorHandler>,
    ) -> Self {
        let id = ContextId::next();
        let name = match role {
            ContextRole::Worker => format!("worker-{}", id),
            _ => role.to_string(),
        };
        debug!(context = %name, "Created context");
        Self {
            inner: Arc::new(ContextInner {
                id,
                role,
                name,
                confinement,
                parent,
                store,
                model,
                broker,
                errors,
                state: Mutex::new(ContextState::default()),
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn role(&self) -> ContextRole {
        self.inner.role
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent_id(&self) -> Option<ContextId> {
        self.inner.parent.as_ref().map(Context::id)
    }

    pub(crate) fn broker(&self) -> &Arc<ChangeMergeBroker> {
        &self.inner.broker
    }

    /// Whether operations from the calling thread are allowed
    pub fn is_accessible(&self) -> bool {
        match &self.inner.confinement {
            Confinement::Lane(_) => true,
            Confinement::Thread(owner) => thread::current().id() == *owner,
        }
    }

    /// Run `f` inside this context's confinement
    fn confined<R, F>(&self, f: F) -> StackResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&ContextInner) -> StackResult<R> + Send + 'static,
    {
        match &self.inner.confinement {
            Confinement::Lane(lane) => {
                let inner = Arc::clone(&self.inner);
                lane.perform_and_wait(move || f(&*inner))?
            }
            Confinement::Thread(owner) => {
                if thread::current().id() != *owner {
                    return Err(StackError::Confinement {
                        context: self.inner.name.clone(),
                    });
                }
                f(&*self.inner)
            }
        }
    }

    fn reported<T>(&self, result: StackResult<T>) -> StackResult<T> {
        if let Err(ref e) = result {
            self.inner.errors.handle(e);
        }
        result
    }

    /// Insert an empty object; returns its temporary id
    pub fn insert(&self, entity: &str) -> StackResult<ObjectId> {
        self.insert_with(entity, Properties::new())
    }

    pub fn insert_with(&self, entity: &str, properties: Properties) -> StackResult<ObjectId> {
        let entity = entity.to_string();
        self.reported(self.confined(move |inner| inner.insert(entity, properties)))
    }

    /// Change one property of an object
    pub fn set(&self, id: ObjectId, key: &str, value: Value) -> StackResult<()> {
        let key = key.to_string();
        self.reported(self.confined(move |inner| inner.set(id, key, value)))
    }

    pub fn delete(&self, id: ObjectId) -> StackResult<()> {
        self.reported(self.confined(move |inner| inner.delete(id)))
    }

    /// This context's view of one object
    pub fn object(&self, id: ObjectId) -> StackResult<Option<ManagedObject>> {
        self.reported(self.confined(move |inner| inner.view_object(id)))
    }

    /// Every object of `entity` visible from this context, ordered by id
    pub fn fetch_all(&self, entity: &str) -> StackResult<Vec<ManagedObject>> {
        let entity = entity.to_string();
        self.reported(self.confined(move |inner| inner.view_all(&entity)))
    }

    pub fn count(&self, entity: &str) -> StackResult<usize> {
        Ok(self.fetch_all(entity)?.len())
    }

    pub fn has_changes(&self) -> StackResult<bool> {
        self.reported(self.confined(|inner| Ok(!inner.state().pending.is_empty())))
    }

    /// Discard uncommitted changes and materialized objects
    pub fn rollback(&self) -> StackResult<()> {
        self.reported(self.confined(|inner| {
            let mut state = inner.state();
            state.pending = ChangeSet::default();
            state.registered.clear();
            Ok(())
        }))
    }

    /// Give every pending inserted object a permanent id now
    pub fn obtain_permanent_ids(&self) -> StackResult<usize> {
        self.reported(self.confined(|inner| Ok(inner.state().assign_permanent_ids())))
    }

    /// Permanent id for `id`, or `id` itself while it is still temporary
    pub fn resolve_id(&self, id: ObjectId) -> StackResult<ObjectId> {
        self.reported(self.confined(move |inner| inner.resolve_id(id)))
    }

    /// Commit pending changes one level up
    ///
    /// Publishes a [`ChangeEvent`] on success. On failure the pending
    /// changes are kept so the commit can be retried.
    pub fn commit(&self) -> StackResult<CommitOutcome> {
        self.reported(self.commit_changes())
    }

    fn commit_changes(&self) -> StackResult<CommitOutcome> {
        if self.inner.role == ContextRole::Root {
            return self.commit_root();
        }

        let Some(changes) = self.confined(|inner| Ok(inner.prepare_push()))? else {
            trace!(context = %self.name(), "Nothing to commit");
            return Ok(CommitOutcome::NoChanges);
        };
        let parent = self.inner.parent.as_ref().ok_or_else(|| {
            StackError::Configuration(format!("context '{}' has no parent", self.name()))
        })?;

        let pushed = changes.clone();
        parent.confined(move |parent| {
            parent.absorb(pushed);
            Ok(())
        })?;
        self.confined(|inner| {
            inner.state().pending = ChangeSet::default();
            Ok(())
        })?;

        let count = changes.len();
        debug!(context = %self.name(), changes = count, "Committed");
        self.inner
            .broker
            .on_commit(self.inner.id, changes.into_event(self.inner.id));
        Ok(CommitOutcome::Pushed { changes: count })
    }

    fn commit_root(&self) -> StackResult<CommitOutcome> {
        // Published in the same lane job as the write, so main-thread
        // deliveries are queued in disk order
        let published = self.confined(|inner| {
            let Some(changes) = inner.persist()? else {
                return Ok(None);
            };
            let count = changes.len();
            let inline = inner.broker.publish(inner.id, changes.into_event(inner.id));
            Ok(Some((count, inline)))
        })?;

        let Some((count, inline)) = published else {
            trace!(context = %self.name(), "Nothing to commit");
            return Ok(CommitOutcome::NoChanges);
        };
        debug!(context = %self.name(), changes = count, "Committed");
        inline.deliver();
        Ok(CommitOutcome::Persisted { changes: count })
    }

    /// Apply another context's committed changes; last writer wins
    pub(crate) fn merge_changes(&self, event: ChangeEvent) -> StackResult<usize> {
        self.confined(move |inner| Ok(inner.merge(event)))
    }
}

impl ContextInner {
    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_error(&self, source: rusqlite::Error) -> StackError {
        StackError::Read {
            context: self.name.clone(),
            source,
        }
    }

    fn parent(&self) -> StackResult<&Context> {
        self.parent.as_ref().ok_or_else(|| {
            StackError::Configuration(format!("context '{}' has no parent or store", self.name))
        })
    }

    fn check_entity(&self, entity: &str) -> StackResult<()> {
        match &self.model {
            Some(model) if !model.contains_entity(entity) => {
                Err(StackError::UnknownEntity(entity.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn check_attribute(&self, entity: &str, attribute: &str) -> StackResult<()> {
        let description = self
            .model
            .as_ref()
            .and_then(|model| model.entity_description(entity));
        match description {
            Some(description) if !description.allows(attribute) => {
                Err(StackError::UnknownAttribute {
                    entity: entity.to_string(),
                    attribute: attribute.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn insert(&self, entity: String, properties: Properties) -> StackResult<ObjectId> {
        self.check_entity(&entity)?;
        for key in properties.keys() {
            self.check_attribute(&entity, key)?;
        }

        let mut state = self.state();
        state.next_serial += 1;
        let id = ObjectId::Temporary {
            context: self.id,
            serial: state.next_serial,
        };
        let object = ManagedObject {
            id,
            entity,
            properties,
        };
        state.registered.insert(id, object.clone());
        state.pending.record_insert(object);
        Ok(id)
    }

    fn set(&self, id: ObjectId, key: String, value: Value) -> StackResult<()> {
        let mut object = self.view_object(id)?.ok_or(StackError::UnknownObject(id))?;
        self.check_attribute(&object.entity, &key)?;

        let mut state = self.state();
        object.properties.insert(key.clone(), value.clone());
        state.pending.record_update(object.id, &object.entity, &key, value);
        state.registered.insert(object.id, object);
        Ok(())
    }

    fn delete(&self, id: ObjectId) -> StackResult<()> {
        let object = self.view_object(id)?.ok_or(StackError::UnknownObject(id))?;

        let mut state = self.state();
        state.registered.remove(&object.id);
        state.pending.record_delete(object.id, &object.entity);
        Ok(())
    }

    fn resolve_id(&self, id: ObjectId) -> StackResult<ObjectId> {
        let state = self.state();
        match id {
            ObjectId::Permanent(_) => Ok(id),
            ObjectId::Temporary { context, .. } => {
                if let Some(permanent) = state.assigned.get(&id) {
                    Ok(*permanent)
                } else if context == self.id && state.registered.contains_key(&id) {
                    Ok(id)
                } else {
                    Err(StackError::UnknownObject(id))
                }
            }
        }
    }

    fn view_object(&self, id: ObjectId) -> StackResult<Option<ManagedObject>> {
        let id = {
            let state = self.state();
            let id = state.canonical(id);
            if state.pending.deleted.contains_key(&id) {
                return Ok(None);
            }
            if let Some(object) = state.registered.get(&id) {
                return Ok(Some(object.clone()));
            }
            id
        };
        if id.is_temporary() {
            return Ok(None);
        }

        // The lock is released while the parent is consulted
        let base = match &self.store {
            Some(store) => store.fetch_object(&id).map_err(|e| self.read_error(e))?,
            None => self
                .parent()?
                .confined(move |parent| parent.view_object(id))?,
        };
        Ok(base.and_then(|object| self.state().overlay(object)))
    }

    fn view_all(&self, entity: &str) -> StackResult<Vec<ManagedObject>> {
        let base = match &self.store {
            Some(store) => store.fetch_entity(entity).map_err(|e| self.read_error(e))?,
            None => {
                let entity = entity.to_string();
                self.parent()?
                    .confined(move |parent| parent.view_all(&entity))?
            }
        };

        let state = self.state();
        let mut visible: BTreeMap<ObjectId, ManagedObject> = base
            .into_iter()
            .filter_map(|object| state.overlay(object))
            .map(|object| (object.id, object))
            .collect();
        for object in state.registered.values() {
            if object.entity == entity && !state.pending.deleted.contains_key(&object.id) {
                visible.insert(object.id, object.clone());
            }
        }
        Ok(visible.into_values().collect())
    }

    /// Child side of a commit: run the hook and snapshot the pending set
    fn prepare_push(&self) -> Option<ChangeSet> {
        let mut state = self.state();
        if state.pending.is_empty() {
            return None;
        }
        let assigned = state.assign_permanent_ids();
        if assigned > 0 {
            trace!(context = %self.name, assigned, "Assigned permanent ids");
        }
        Some(state.pending.clone())
    }

    /// Parent side of a child commit
    fn absorb(&self, changes: ChangeSet) {
        let mut state = self.state();
        for object in changes.inserted.values() {
            state.registered.insert(object.id, object.clone());
        }
        for change in changes.updated.values() {
            if let Some(object) = state.registered.get_mut(&change.id) {
                object.apply(&change.values);
            }
        }
        for id in changes.deleted.keys() {
            state.registered.remove(id);
        }
        state.pending.absorb(changes);
    }

    /// Root commit: flush the pending set in one transaction
    fn persist(&self) -> StackResult<Option<ChangeSet>> {
        let mut state = self.state();
        if state.pending.is_empty() {
            return Ok(None);
        }
        state.assign_permanent_ids();

        let store = self.store.as_ref().ok_or_else(|| {
            StackError::Configuration(format!("context '{}' has no persistent store", self.name))
        })?;
        store.apply(&state.pending).map_err(|source| StackError::Write {
            context: self.name.clone(),
            source,
        })?;

        let changes = std::mem::take(&mut state.pending);
        state.registered.clear();
        Ok(Some(changes))
    }

    /// Fold another context's commit in
    ///
    /// Only objects with local pending changes stay registered; everything
    /// else is read through the parent.
    fn merge(&self, event: ChangeEvent) -> usize {
        let changed = event.changed_ids();
        let mut state = self.state();

        for object in &event.inserted {
            state.pending.forget(&object.id);
        }
        for change in &event.updated {
            state.pending.discard_properties(&change.id, &change.values);
            if let Some(object) = state.registered.get_mut(&change.id) {
                object.apply(&change.values);
            }
        }
        for id in &event.deleted {
            state.pending.forget(id);
        }

        for id in &changed {
            if !state.pending.touches(id) {
                state.registered.remove(id);
            }
        }

        trace!(context = %self.name, source = %event.source, merged = changed.len(), "Merged changes");
        changed.len()
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let dropped = self.broker.forget_source(self.id);
        debug!(context = %self.name, registrations = dropped, "Context released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoggingErrorHandler;
    use crate::lane::MainQueue;
    use crate::storage::StoreOptions;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        queue: MainQueue,
        root: Context,
    }

    fn fixture(model: Option<Model>) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let model = model.map(Arc::new);
        let store = PersistentStore::attach(
            &temp_dir.path().join("sugar.sqlite"),
            model.as_deref(),
            &StoreOptions::plain(),
        )
        .unwrap();
        let queue = MainQueue::for_current_thread();
        let errors: Arc<dyn ErrorHandler> = Arc::new(LoggingErrorHandler);
        let broker = Arc::new(ChangeMergeBroker::new(queue.clone(), Arc::clone(&errors)));
        let lane = Arc::new(SerialLane::spawn("test-root").unwrap());
        let root = Context::root(store, lane, model, broker, errors);
        Fixture {
            _temp_dir: temp_dir,
            queue,
            root,
        }
    }

    fn worker(root: &Context) -> Context {
        Context::child(ContextRole::Worker, root, thread::current().id())
    }

    #[test]
    fn test_root_commit_persists_with_permanent_ids() {
        let f = fixture(None);
        let id = f
            .root
            .insert_with("Person", Properties::from([("name".to_string(), json!("Ada"))]))
            .unwrap();
        assert!(id.is_temporary());
        assert!(f.root.has_changes().unwrap());

        let outcome = f.root.commit().unwrap();
        assert_eq!(outcome, CommitOutcome::Persisted { changes: 1 });
        assert!(!f.root.has_changes().unwrap());

        let permanent = f.root.resolve_id(id).unwrap();
        assert!(permanent.is_permanent());
        let stored = f.root.object(id).unwrap().unwrap();
        assert_eq!(stored.id, permanent);
        assert_eq!(stored.get("name"), Some(&json!("Ada")));
    }

    #[test]
    fn test_child_commit_pushes_without_writing() {
        let f = fixture(None);
        let child = worker(&f.root);
        child.insert("Person").unwrap();

        assert_eq!(
            child.commit().unwrap(),
            CommitOutcome::Pushed { changes: 1 }
        );
        assert!(!child.has_changes().unwrap());
        assert!(f.root.has_changes().unwrap());
        assert_eq!(f.root.count("Person").unwrap(), 1);

        assert_eq!(
            f.root.commit().unwrap(),
            CommitOutcome::Persisted { changes: 1 }
        );
        assert_eq!(f.root.count("Person").unwrap(), 1);
    }

    #[test]
    fn test_commit_without_changes_is_a_no_op() {
        let f = fixture(None);
        let child = worker(&f.root);
        assert_eq!(child.commit().unwrap(), CommitOutcome::NoChanges);
        assert_eq!(f.root.commit().unwrap(), CommitOutcome::NoChanges);
    }

    #[test]
    fn test_permanent_id_assignment_is_idempotent() {
        let f = fixture(None);
        let child = worker(&f.root);
        let temp = child.insert("Person").unwrap();

        assert_eq!(child.obtain_permanent_ids().unwrap(), 1);
        let permanent = child.resolve_id(temp).unwrap();
        assert_eq!(child.obtain_permanent_ids().unwrap(), 0);
        assert_eq!(child.resolve_id(temp).unwrap(), permanent);

        child.commit().unwrap();
        assert_eq!(child.resolve_id(temp).unwrap(), permanent);
    }

    #[test]
    fn test_foreign_temporary_id_is_unknown() {
        let f = fixture(None);
        let first = worker(&f.root);
        let second = worker(&f.root);
        let temp = first.insert("Person").unwrap();

        assert!(matches!(
            second.resolve_id(temp),
            Err(StackError::UnknownObject(_))
        ));
        assert!(second.object(temp).unwrap().is_none());
    }

    #[test]
    fn test_child_reads_through_and_overlays() {
        let f = fixture(None);
        let id = f.root.insert("Person").unwrap();
        f.root.commit().unwrap();
        let id = f.root.resolve_id(id).unwrap();

        let child = worker(&f.root);
        child.set(id, "name", json!("Grace")).unwrap();
        assert_eq!(
            child.object(id).unwrap().unwrap().get("name"),
            Some(&json!("Grace"))
        );
        // The root does not see uncommitted child edits
        assert!(f.root.object(id).unwrap().unwrap().get("name").is_none());

        child.delete(id).unwrap();
        assert!(child.object(id).unwrap().is_none());
        assert_eq!(child.count("Person").unwrap(), 0);
        assert_eq!(f.root.count("Person").unwrap(), 1);

        child.rollback().unwrap();
        assert_eq!(child.count("Person").unwrap(), 1);
    }

    #[test]
    fn test_model_validation() {
        let f = fixture(Some(Model::new().entity("Person", &["name"])));
        assert!(matches!(
            f.root.insert("Pet"),
            Err(StackError::UnknownEntity(ref entity)) if entity == "Pet"
        ));

        let id = f.root.insert("Person").unwrap();
        assert!(matches!(
            f.root.set(id, "age", json!(3)),
            Err(StackError::UnknownAttribute { .. })
        ));
        f.root.set(id, "name", json!("Ada")).unwrap();
    }

    #[test]
    fn test_worker_is_confined_to_its_thread() {
        let f = fixture(None);
        let child = worker(&f.root);

        let handle = child.clone();
        let result = thread::spawn(move || handle.insert("Person")).join().unwrap();
        assert!(matches!(result, Err(StackError::Confinement { .. })));

        // The root hops onto its lane from anywhere
        let root = f.root.clone();
        let result = thread::spawn(move || root.insert("Person")).join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_merge_is_last_writer_wins() {
        let f = fixture(None);
        let id = f.root.insert("Person").unwrap();
        f.root.commit().unwrap();
        let id = f.root.resolve_id(id).unwrap();

        let main = Context::child(ContextRole::Main, &f.root, f.queue.owner());
        f.root.broker().observe(&main, f.root.id(), true);
        main.set(id, "name", json!("local")).unwrap();
        main.set(id, "age", json!(1)).unwrap();

        let other = worker(&f.root);
        other.set(id, "name", json!("remote")).unwrap();
        other.commit().unwrap();
        f.root.commit().unwrap();
        assert_eq!(f.queue.run_pending().unwrap(), 1);

        let merged = main.object(id).unwrap().unwrap();
        assert_eq!(merged.get("name"), Some(&json!("remote")));
        assert_eq!(merged.get("age"), Some(&json!(1)));
        // Only the untouched property is still pending
        assert!(main.has_changes().unwrap());
    }

    #[test]
    fn test_main_does_not_keep_merged_objects() {
        let f = fixture(None);
        let main = Context::child(ContextRole::Main, &f.root, f.queue.owner());
        f.root.broker().observe(&main, f.root.id(), true);

        for n in 0..50 {
            let child = worker(&f.root);
            f.root.broker().observe(&main, child.id(), true);
            child
                .insert_with("Person", Properties::from([("n".to_string(), json!(n))]))
                .unwrap();
            child.commit().unwrap();
        }
        f.root.commit().unwrap();
        assert_eq!(f.queue.run_pending().unwrap(), 51);

        assert!(main.inner.state().registered.is_empty());
        assert_eq!(main.count("Person").unwrap(), 50);
    }

    #[test]
    fn test_merge_keeps_objects_with_local_changes_registered() {
        let f = fixture(None);
        let id = f.root.insert("Person").unwrap();
        f.root.commit().unwrap();
        let id = f.root.resolve_id(id).unwrap();

        let main = Context::child(ContextRole::Main, &f.root, f.queue.owner());
        f.root.broker().observe(&main, f.root.id(), true);
        main.set(id, "name", json!("local")).unwrap();

        f.root.set(id, "name", json!("remote")).unwrap();
        f.root.commit().unwrap();
        f.queue.run_pending().unwrap();

        // The merged value replaced the only pending change
        assert!(!main.has_changes().unwrap());
        assert!(main.inner.state().registered.is_empty());
        assert_eq!(
            main.object(id).unwrap().unwrap().get("name"),
            Some(&json!("remote"))
        );
    }

    #[test]
    fn test_root_deliveries_follow_write_order() {
        let f = fixture(None);
        let id = f.root.insert("Counter").unwrap();
        f.root.commit().unwrap();
        let id = f.root.resolve_id(id).unwrap();

        let main = Context::child(ContextRole::Main, &f.root, f.queue.owner());
        f.root.broker().observe(&main, f.root.id(), true);
        // Keep a registered copy in main so merged values are applied to it
        main.set(id, "other", json!(true)).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let root = f.root.clone();
                thread::spawn(move || {
                    for n in 0..100 {
                        root.set(id, "value", json!(t * 1000 + n)).unwrap();
                        root.commit().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        f.queue.run_pending().unwrap();

        let stored = f.root.object(id).unwrap().unwrap();
        let seen = main.object(id).unwrap().unwrap();
        assert_eq!(seen.get("value"), stored.get("value"));
    }

    #[test]
    fn test_failed_root_write_keeps_pending_changes() {
        let f = fixture(None);
        let path = f._temp_dir.path().join("sugar.sqlite");
        f.root
            .insert_with("Person", Properties::from([("name".to_string(), json!("Ada"))]))
            .unwrap();

        let other = rusqlite::Connection::open(&path).unwrap();
        other
            .execute_batch("ALTER TABLE objects RENAME TO objects_hidden;")
            .unwrap();

        let err = f.root.commit().unwrap_err();
        assert!(matches!(err, StackError::Write { .. }));
        assert!(f.root.has_changes().unwrap());

        other
            .execute_batch("ALTER TABLE objects_hidden RENAME TO objects;")
            .unwrap();
        assert_eq!(
            f.root.commit().unwrap(),
            CommitOutcome::Persisted { changes: 1 }
        );
        assert!(!f.root.has_changes().unwrap());
        assert_eq!(f.root.count("Person").unwrap(), 1);
    }
}
