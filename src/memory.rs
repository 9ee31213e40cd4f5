//! In-memory database used to run the startup trigger outside a full engine.
//!
//! `MemoryBroker` keeps collections and documents in process memory, stages
//! collection changes per transaction and journals every lock and transaction
//! call. `MemoryQueryService` is a dry-run query runtime: a script evaluates
//! to its own trimmed text unless a [`ScriptBehavior`] is registered for it.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::database::{
    AccessContext, Broker, Collection, CompiledQuery, Group, LockMode, Permissions, QueryContext,
    QueryService, SecurityManager, Sequence, Source, SourceResolver, Subject, TransactionManager,
    Txn,
};
use crate::error::{QueryError, StorageError};
use crate::uri::ScriptLocator;

/// Root collection of every database path.
pub const ROOT_COLLECTION: &str = "/db";

/// Lock, transaction and storage calls observed by a [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    LockAcquired { path: String, mode: LockMode },
    LockReleased { path: String, mode: LockMode },
    Begin(u64),
    Commit(u64),
    Abort(u64),
    Close(u64),
    CollectionSaved(String),
    Flush,
}

struct StoredCollection {
    permissions: Permissions,
    /// Document name to content, in insertion order.
    documents: IndexMap<String, String>,
}

#[derive(Default)]
struct PendingTxn {
    collections: BTreeMap<String, Permissions>,
}

#[derive(Default)]
struct Faults {
    deny_open: HashSet<String>,
    deny_listing: HashSet<String>,
    fail_begin: Option<String>,
    fail_commit: Option<String>,
    fail_save: Option<String>,
    fail_flush: Option<String>,
}

struct StoreState {
    collections: BTreeMap<String, StoredCollection>,
    pending: HashMap<u64, PendingTxn>,
    journal: Vec<JournalEntry>,
    faults: Faults,
    next_txn: u64,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("In-memory database mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn guest_permissions() -> Permissions {
    Permissions {
        owner: Subject {
            id: 2,
            name: "guest".to_string(),
        },
        group: Group {
            id: 2,
            name: "guest".to_string(),
        },
    }
}

/// `/db/a/b` -> `["/db", "/db/a", "/db/a/b"]`
fn collection_chain(path: &str) -> Result<Vec<String>, StorageError> {
    let trimmed = path.trim_end_matches('/');
    if trimmed != ROOT_COLLECTION && !trimmed.starts_with("/db/") {
        return Err(StorageError::InvalidPath(path.to_string()));
    }

    let mut chain = Vec::new();
    let mut current = String::new();
    for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        chain.push(current.clone());
    }
    Ok(chain)
}

/// Split `/db/a/doc.xq` into (`/db/a`, `doc.xq`).
fn split_document_path(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    let (collection, name) = (&path[..idx], &path[idx + 1..]);
    if collection.is_empty() || name.is_empty() {
        None
    } else {
        Some((collection, name))
    }
}

/// Security manager with the fixed built-in principals.
pub struct MemorySecurityManager;

impl SecurityManager for MemorySecurityManager {
    fn system_subject(&self) -> Subject {
        Subject {
            id: 1_048_576,
            name: "SYSTEM".to_string(),
        }
    }

    fn dba_group(&self) -> Group {
        Group {
            id: 1,
            name: "dba".to_string(),
        }
    }
}

/// In-memory database-access handle.
pub struct MemoryBroker {
    state: Mutex<StoreState>,
    held_locks: Arc<AtomicUsize>,
    security: MemorySecurityManager,
    queries: MemoryQueryService,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a database holding only the empty root collection.
    pub fn new() -> Self {
        let mut collections = BTreeMap::new();
        collections.insert(
            ROOT_COLLECTION.to_string(),
            StoredCollection {
                permissions: guest_permissions(),
                documents: IndexMap::new(),
            },
        );

        let held_locks = Arc::new(AtomicUsize::new(0));

        Self {
            state: Mutex::new(StoreState {
                collections,
                pending: HashMap::new(),
                journal: Vec::new(),
                faults: Faults::default(),
                next_txn: 1,
            }),
            queries: MemoryQueryService::new(Arc::clone(&held_locks)),
            held_locks,
            security: MemorySecurityManager,
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        lock_recover(&self.state)
    }

    /// Create the collection at `path` and its ancestors outside any
    /// transaction. Existing collections are left untouched.
    pub fn create_collection(&self, path: &str) -> Result<(), StorageError> {
        let chain = collection_chain(path)?;
        let mut state = self.state();
        for p in chain {
            state
                .collections
                .entry(p)
                .or_insert_with(|| StoredCollection {
                    permissions: guest_permissions(),
                    documents: IndexMap::new(),
                });
        }
        Ok(())
    }

    /// Store a document, creating its collection if needed. Re-storing an
    /// existing document replaces its content and keeps its position.
    pub fn store_document(&self, path: &str, content: impl Into<String>) {
        let Some((collection, name)) = split_document_path(path) else {
            warn!("Ignoring document with invalid path '{}'", path);
            return;
        };

        if let Err(e) = self.create_collection(collection) {
            warn!("Ignoring document '{}': {}", path, e);
            return;
        }

        let mut state = self.state();
        if let Some(stored) = state.collections.get_mut(collection) {
            stored.documents.insert(name.to_string(), content.into());
        }
    }

    /// Load a directory tree as the `/db` tree: sub-directories become
    /// collections and files become documents. Entries are loaded in name
    /// order. Returns the number of documents stored.
    pub fn load_directory(&self, root: &Path) -> Result<usize, StorageError> {
        let mut loaded = 0;
        let mut pending = vec![(root.to_path_buf(), ROOT_COLLECTION.to_string())];

        while let Some((dir, collection)) = pending.pop() {
            self.create_collection(&collection)?;

            let mut entries = fs::read_dir(&dir)
                .map_err(|e| StorageError::Io(format!("{}: {}", dir.display(), e)))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::Io(format!("{}: {}", dir.display(), e)))?;
            entries.sort_by_key(|entry| entry.file_name());

            for entry in entries {
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = entry.path();
                let db_path = format!("{}/{}", collection, name);

                if path.is_dir() {
                    pending.push((path, db_path));
                    continue;
                }

                match fs::read_to_string(&path) {
                    Ok(content) => {
                        debug!("Loaded '{}' as '{}'", path.display(), db_path);
                        self.store_document(&db_path, content);
                        loaded += 1;
                    }
                    Err(e) => warn!("Skipping '{}': {}", path.display(), e),
                }
            }
        }

        Ok(loaded)
    }

    /// Permissions of a committed collection.
    pub fn collection_permissions(&self, path: &str) -> Option<Permissions> {
        self.state()
            .collections
            .get(path)
            .map(|c| c.permissions.clone())
    }

    /// Document paths of a committed collection, in storage order.
    pub fn document_paths(&self, path: &str) -> Vec<String> {
        self.state()
            .collections
            .get(path)
            .map(|c| {
                c.documents
                    .keys()
                    .map(|name| format!("{}/{}", path, name))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state().journal.clone()
    }

    /// Number of collection locks currently held.
    pub fn held_locks(&self) -> usize {
        self.held_locks.load(Ordering::SeqCst)
    }

    pub fn deny_open(&self, path: &str) {
        self.state().faults.deny_open.insert(path.to_string());
    }

    pub fn deny_listing(&self, path: &str) {
        self.state().faults.deny_listing.insert(path.to_string());
    }

    pub fn fail_begin(&self, message: &str) {
        self.state().faults.fail_begin = Some(message.to_string());
    }

    /// Make commits fail. The transaction stays active, so the caller still
    /// has to abort it.
    pub fn fail_commit(&self, message: &str) {
        self.state().faults.fail_commit = Some(message.to_string());
    }

    pub fn fail_save(&self, message: &str) {
        self.state().faults.fail_save = Some(message.to_string());
    }

    pub fn fail_flush(&self, message: &str) {
        self.state().faults.fail_flush = Some(message.to_string());
    }

    pub fn queries(&self) -> &MemoryQueryService {
        &self.queries
    }

    fn not_active(txn: &Txn) -> StorageError {
        StorageError::Transaction {
            txn: txn.id(),
            message: "transaction is not active".to_string(),
        }
    }
}

impl TransactionManager for MemoryBroker {
    fn begin_transaction(&self) -> Result<Txn, StorageError> {
        let mut state = self.state();
        if let Some(message) = &state.faults.fail_begin {
            return Err(StorageError::Io(message.clone()));
        }
        let id = state.next_txn;
        state.next_txn += 1;
        state.pending.insert(id, PendingTxn::default());
        state.journal.push(JournalEntry::Begin(id));
        Ok(Txn::new(id))
    }

    fn commit(&self, txn: &Txn) -> Result<(), StorageError> {
        let mut state = self.state();
        if let Some(message) = &state.faults.fail_commit {
            return Err(StorageError::Transaction {
                txn: txn.id(),
                message: message.clone(),
            });
        }
        let pending = state
            .pending
            .remove(&txn.id())
            .ok_or_else(|| Self::not_active(txn))?;

        for (path, permissions) in pending.collections {
            state
                .collections
                .entry(path)
                .and_modify(|c| c.permissions = permissions.clone())
                .or_insert_with(|| StoredCollection {
                    permissions,
                    documents: IndexMap::new(),
                });
        }
        state.journal.push(JournalEntry::Commit(txn.id()));
        Ok(())
    }

    fn abort(&self, txn: &Txn) {
        let mut state = self.state();
        state.pending.remove(&txn.id());
        state.journal.push(JournalEntry::Abort(txn.id()));
    }

    fn close(&self, txn: &Txn) {
        let mut state = self.state();
        if state.pending.remove(&txn.id()).is_some() {
            warn!("Transaction {} closed while still active, discarding changes", txn.id());
        }
        state.journal.push(JournalEntry::Close(txn.id()));
    }
}

impl SourceResolver for MemoryBroker {
    fn resolve(&self, locator: &ScriptLocator) -> Result<Option<Source>, QueryError> {
        let path = locator.db_path();
        let Some((collection, name)) = split_document_path(path) else {
            return Ok(None);
        };

        let state = self.state();
        if state.faults.deny_open.contains(collection) {
            return Err(StorageError::PermissionDenied(collection.to_string()).into());
        }

        Ok(state
            .collections
            .get(collection)
            .and_then(|c| c.documents.get(name))
            .map(|content| Source {
                key: path.to_string(),
                content: content.clone(),
            }))
    }
}

impl Broker for MemoryBroker {
    fn open_collection(
        &self,
        path: &str,
        mode: LockMode,
    ) -> Result<Option<Collection>, StorageError> {
        let mut state = self.state();
        if state.faults.deny_open.contains(path) {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }

        let Some(stored) = state.collections.get(path) else {
            return Ok(None);
        };
        let collection = Collection {
            path: path.to_string(),
            permissions: stored.permissions.clone(),
        };

        self.held_locks.fetch_add(1, Ordering::SeqCst);
        state.journal.push(JournalEntry::LockAcquired {
            path: path.to_string(),
            mode,
        });
        Ok(Some(collection))
    }

    fn release_collection(&self, path: &str, mode: LockMode) {
        let released = self
            .held_locks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if released.is_err() {
            warn!("Released lock on '{}' that was not held", path);
        }
        self.state().journal.push(JournalEntry::LockReleased {
            path: path.to_string(),
            mode,
        });
    }

    fn documents_no_lock(&self, collection: &Collection) -> Result<Vec<String>, StorageError> {
        let state = self.state();
        if state.faults.deny_listing.contains(&collection.path) {
            return Err(StorageError::PermissionDenied(collection.path.clone()));
        }

        let stored = state
            .collections
            .get(&collection.path)
            .ok_or_else(|| StorageError::CollectionNotFound(collection.path.clone()))?;

        Ok(stored
            .documents
            .keys()
            .map(|name| format!("{}/{}", collection.path, name))
            .collect())
    }

    fn get_or_create_collection(&self, txn: &Txn, path: &str) -> Result<Collection, StorageError> {
        let chain = collection_chain(path)?;
        let mut guard = self.state();
        let state = &mut *guard;

        let pending = state
            .pending
            .get_mut(&txn.id())
            .ok_or_else(|| Self::not_active(txn))?;

        for p in chain {
            if !state.collections.contains_key(&p) && !pending.collections.contains_key(&p) {
                debug!("Creating collection '{}' in transaction {}", p, txn.id());
                pending.collections.insert(p, guest_permissions());
            }
        }

        let path = path.trim_end_matches('/');
        let permissions = pending
            .collections
            .get(path)
            .or_else(|| state.collections.get(path).map(|c| &c.permissions))
            .cloned()
            .ok_or_else(|| StorageError::CollectionNotFound(path.to_string()))?;

        Ok(Collection {
            path: path.to_string(),
            permissions,
        })
    }

    fn save_collection(&self, txn: &Txn, collection: &Collection) -> Result<(), StorageError> {
        let mut guard = self.state();
        let state = &mut *guard;

        if let Some(message) = &state.faults.fail_save {
            return Err(StorageError::Io(message.clone()));
        }

        let pending = state
            .pending
            .get_mut(&txn.id())
            .ok_or_else(|| Self::not_active(txn))?;
        pending
            .collections
            .insert(collection.path.clone(), collection.permissions.clone());
        state
            .journal
            .push(JournalEntry::CollectionSaved(collection.path.clone()));
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        let mut state = self.state();
        if let Some(message) = &state.faults.fail_flush {
            return Err(StorageError::Io(message.clone()));
        }
        state.journal.push(JournalEntry::Flush);
        Ok(())
    }

    fn transaction_manager(&self) -> &dyn TransactionManager {
        self
    }

    fn security_manager(&self) -> &dyn SecurityManager {
        &self.security
    }

    fn source_resolver(&self) -> &dyn SourceResolver {
        self
    }

    fn query_service(&self) -> &dyn QueryService {
        &self.queries
    }
}

/// Scripted behaviour of a source in [`MemoryQueryService`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptBehavior {
    /// Compile and evaluate to the given items.
    Return(Vec<Value>),
    FailCompile(String),
    FailPrepare(String),
    FailExecute(String),
    /// Fail execution with a permission error on reading the given path.
    DenyRead(String),
    /// Panic while executing.
    Panic(String),
}

/// Calls observed by a [`MemoryQueryService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    ContextCreated { context: u64, access: AccessContext },
    ModuleLoadPath { context: u64, path: String },
    Compiled { context: u64, source: String },
    Prepared { context: u64 },
    Executed {
        context: u64,
        source: String,
        locks_held: usize,
    },
    CleanedUp { context: u64 },
}

#[derive(Default)]
struct QueryState {
    behaviors: HashMap<String, ScriptBehavior>,
    events: Vec<QueryEvent>,
    next_context: u64,
}

impl QueryState {
    fn record(&mut self, event: QueryEvent) {
        self.events.push(event);
    }
}

/// Dry-run query runtime.
pub struct MemoryQueryService {
    state: Arc<Mutex<QueryState>>,
    held_locks: Arc<AtomicUsize>,
}

impl MemoryQueryService {
    /// `held_locks` is sampled on every execution so callers can check that
    /// no collection lock is held while a script runs.
    pub fn new(held_locks: Arc<AtomicUsize>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueryState::default())),
            held_locks,
        }
    }

    /// Override the behaviour of the source stored at `key`.
    pub fn set_behavior(&self, key: &str, behavior: ScriptBehavior) {
        lock_recover(&self.state)
            .behaviors
            .insert(key.to_string(), behavior);
    }

    pub fn events(&self) -> Vec<QueryEvent> {
        lock_recover(&self.state).events.clone()
    }

    /// Sources executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        lock_recover(&self.state)
            .events
            .iter()
            .filter_map(|e| match e {
                QueryEvent::Executed { source, .. } => Some(source.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn cleanup_count(&self, context: u64) -> usize {
        lock_recover(&self.state)
            .events
            .iter()
            .filter(|e| matches!(e, QueryEvent::CleanedUp { context: c } if *c == context))
            .count()
    }

    fn memory_context(
        context: &mut dyn QueryContext,
    ) -> Result<&mut MemoryQueryContext, QueryError> {
        context
            .as_any_mut()
            .downcast_mut::<MemoryQueryContext>()
            .ok_or_else(|| {
                QueryError::Context("context was not created by this runtime".to_string())
            })
    }
}

struct MemoryQueryContext {
    id: u64,
    module_load_path: Option<String>,
    prepare_error: Option<String>,
    prepared: bool,
    state: Arc<Mutex<QueryState>>,
}

impl QueryContext for MemoryQueryContext {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn set_module_load_path(&mut self, path: &str) {
        self.module_load_path = Some(path.to_string());
        lock_recover(&self.state).record(QueryEvent::ModuleLoadPath {
            context: self.id,
            path: path.to_string(),
        });
    }

    fn module_load_path(&self) -> Option<&str> {
        self.module_load_path.as_deref()
    }

    fn prepare_for_execution(&mut self) -> Result<(), QueryError> {
        if let Some(message) = self.prepare_error.take() {
            return Err(QueryError::Prepare(message));
        }
        self.prepared = true;
        lock_recover(&self.state).record(QueryEvent::Prepared { context: self.id });
        Ok(())
    }

    fn run_cleanup_tasks(&mut self) {
        lock_recover(&self.state).record(QueryEvent::CleanedUp { context: self.id });
    }
}

#[async_trait]
impl QueryService for MemoryQueryService {
    fn new_context(&self, access: AccessContext) -> Result<Box<dyn QueryContext>, QueryError> {
        let mut state = lock_recover(&self.state);
        state.next_context += 1;
        let id = state.next_context;
        state.record(QueryEvent::ContextCreated { context: id, access });

        Ok(Box::new(MemoryQueryContext {
            id,
            module_load_path: None,
            prepare_error: None,
            prepared: false,
            state: Arc::clone(&self.state),
        }))
    }

    fn compile(
        &self,
        context: &mut dyn QueryContext,
        source: &Source,
    ) -> Result<CompiledQuery, QueryError> {
        let context = Self::memory_context(context)?;

        let behavior = {
            let mut state = lock_recover(&self.state);
            state.record(QueryEvent::Compiled {
                context: context.id,
                source: source.key.clone(),
            });
            state.behaviors.get(&source.key).cloned()
        };
        let behavior = behavior.unwrap_or_else(|| {
            ScriptBehavior::Return(vec![Value::String(source.content.trim().to_string())])
        });

        match behavior {
            ScriptBehavior::FailCompile(message) => {
                Err(QueryError::Compile { message, line: None })
            }
            ScriptBehavior::FailPrepare(message) => {
                context.prepare_error = Some(message);
                Ok(CompiledQuery::new(
                    source.key.clone(),
                    ScriptBehavior::Return(Vec::new()),
                ))
            }
            behavior => Ok(CompiledQuery::new(source.key.clone(), behavior)),
        }
    }

    async fn execute(
        &self,
        context: &mut dyn QueryContext,
        query: &CompiledQuery,
        context_sequence: Option<&Sequence>,
    ) -> Result<Sequence, QueryError> {
        let context = Self::memory_context(context)?;
        if !context.prepared {
            return Err(QueryError::Prepare("context was not prepared".to_string()));
        }

        let program = query
            .program::<ScriptBehavior>()
            .cloned()
            .ok_or_else(|| {
                QueryError::Execution("query was not compiled by this runtime".to_string())
            })?;

        lock_recover(&self.state).record(QueryEvent::Executed {
            context: context.id,
            source: query.source_key().to_string(),
            locks_held: self.held_locks.load(Ordering::SeqCst),
        });

        tokio::task::yield_now().await;

        match program {
            ScriptBehavior::Return(mut items) => {
                if let Some(input) = context_sequence {
                    let mut all = input.items().to_vec();
                    all.append(&mut items);
                    items = all;
                }
                Ok(Sequence::from(items))
            }
            ScriptBehavior::FailExecute(message) => Err(QueryError::Execution(message)),
            ScriptBehavior::DenyRead(path) => Err(StorageError::PermissionDenied(path).into()),
            ScriptBehavior::Panic(message) => panic!("{}", message),
            ScriptBehavior::FailCompile(message) | ScriptBehavior::FailPrepare(message) => {
                Err(QueryError::Execution(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_chain() {
        assert_eq!(
            collection_chain("/db/system/autostart").unwrap(),
            vec!["/db", "/db/system", "/db/system/autostart"]
        );
        assert_eq!(collection_chain("/db/").unwrap(), vec!["/db"]);
        assert!(collection_chain("/other/place").is_err());
        assert!(collection_chain("relative").is_err());
    }

    #[test]
    fn test_store_document_keeps_insertion_order() {
        let broker = MemoryBroker::new();
        broker.store_document("/db/apps/z.xq", "z");
        broker.store_document("/db/apps/a.xq", "a");
        broker.store_document("/db/apps/z.xq", "z2");

        assert_eq!(
            broker.document_paths("/db/apps"),
            vec!["/db/apps/z.xq", "/db/apps/a.xq"]
        );
        let source = broker
            .resolve(&ScriptLocator::from_db_path("/db/apps/z.xq").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(source.content, "z2");
    }

    #[test]
    fn test_aborted_transaction_leaves_no_collections() {
        let broker = MemoryBroker::new();
        let txn = broker.begin_transaction().unwrap();
        broker.get_or_create_collection(&txn, "/db/a/b").unwrap();
        broker.abort(&txn);
        broker.close(&txn);

        assert!(broker.collection_permissions("/db/a").is_none());
        assert!(broker.commit(&txn).is_err());
    }

    #[test]
    fn test_get_or_create_existing_collection_keeps_permissions() {
        let broker = MemoryBroker::new();
        broker.create_collection("/db/a").unwrap();
        let txn = broker.begin_transaction().unwrap();
        let collection = broker.get_or_create_collection(&txn, "/db/a").unwrap();
        assert_eq!(collection.permissions, guest_permissions());
        broker.commit(&txn).unwrap();
        broker.close(&txn);
    }

    #[test]
    fn test_open_and_release_track_locks() {
        let broker = MemoryBroker::new();
        let collection = broker.open_collection("/db", LockMode::Read).unwrap().unwrap();
        assert_eq!(broker.held_locks(), 1);
        broker.release_collection(&collection.path, LockMode::Read);
        assert_eq!(broker.held_locks(), 0);
        assert!(broker.open_collection("/db/none", LockMode::Read).unwrap().is_none());
        assert_eq!(broker.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_default_behavior_returns_trimmed_text() {
        let broker = MemoryBroker::new();
        let service = broker.queries();
        let mut context = service.new_context(AccessContext::Trigger).unwrap();
        let source = Source {
            key: "/db/a.xq".to_string(),
            content: "  hello\n".to_string(),
        };

        let query = service.compile(context.as_mut(), &source).unwrap();
        context.prepare_for_execution().unwrap();
        let result = service.execute(context.as_mut(), &query, None).await.unwrap();

        assert_eq!(result.string_value(), "hello");
        assert_eq!(service.executed(), vec!["/db/a.xq"]);
    }

    #[tokio::test]
    async fn test_execute_requires_prepared_context() {
        let broker = MemoryBroker::new();
        let service = broker.queries();
        let mut context = service.new_context(AccessContext::Trigger).unwrap();
        let source = Source {
            key: "/db/a.xq".to_string(),
            content: "x".to_string(),
        };

        let query = service.compile(context.as_mut(), &source).unwrap();
        let err = service.execute(context.as_mut(), &query, None).await.unwrap_err();
        assert!(matches!(err, QueryError::Prepare(_)));
    }

    #[test]
    fn test_fail_prepare_behavior() {
        let broker = MemoryBroker::new();
        let service = broker.queries();
        service.set_behavior("/db/a.xq", ScriptBehavior::FailPrepare("no memory".into()));
        let mut context = service.new_context(AccessContext::Trigger).unwrap();
        let source = Source {
            key: "/db/a.xq".to_string(),
            content: "x".to_string(),
        };

        service.compile(context.as_mut(), &source).unwrap();
        let err = context.prepare_for_execution().unwrap_err();
        assert_eq!(err.to_string(), "Failed to prepare context: no memory");
    }
}
