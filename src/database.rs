//! Interfaces of the database collaborators the startup trigger drives.
//!
//! The storage engine, transaction manager, security manager and query
//! runtime live outside this crate. They are reached through the traits in
//! this module. Locks, transactions and query contexts are wrapped in guards
//! that release them on drop, so every exit path gives the resource back.

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::{QueryError, StorageError};
use crate::uri::ScriptLocator;

/// Lock mode requested when opening a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

/// A security principal known to the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: u32,
    pub name: String,
}

/// A group of security principals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: u32,
    pub name: String,
}

/// Ownership metadata of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permissions {
    pub owner: Subject,
    pub group: Group,
}

impl Permissions {
    pub fn set_owner(&mut self, owner: Subject) {
        self.owner = owner;
    }

    pub fn set_group(&mut self, group: Group) {
        self.group = group;
    }
}

/// Snapshot of a collection as handed out by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub path: String,
    pub permissions: Permissions,
}

/// Handle of an open transaction.
#[derive(Debug, PartialEq, Eq)]
pub struct Txn {
    id: u64,
}

impl Txn {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Transaction primitives of the storage engine.
pub trait TransactionManager: Send + Sync {
    fn begin_transaction(&self) -> Result<Txn, StorageError>;
    fn commit(&self, txn: &Txn) -> Result<(), StorageError>;
    fn abort(&self, txn: &Txn);
    /// Release the transaction handle. Called once per transaction, after
    /// either commit or abort.
    fn close(&self, txn: &Txn);
}

/// Well-known principals of the security subsystem.
pub trait SecurityManager: Send + Sync {
    fn system_subject(&self) -> Subject;
    fn dba_group(&self) -> Group;
}

/// A script source resolved from a locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Database path the source was loaded from.
    pub key: String,
    pub content: String,
}

/// Locates the source of a script. Absence is `Ok(None)`, not an error.
#[cfg_attr(test, mockall::automock)]
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, locator: &ScriptLocator) -> Result<Option<Source>, QueryError>;
}

/// Privilege scope a query context runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessContext {
    /// Scripts fired by internal lifecycle hooks.
    Trigger,
    /// Queries submitted by a user.
    User,
}

/// An ordered sequence of untyped items produced by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequence(Vec<Value>);

impl Sequence {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn items(&self) -> &[Value] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String value of the sequence: the string value of every item,
    /// separated by single spaces.
    pub fn string_value(&self) -> String {
        self.0
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl From<Vec<Value>> for Sequence {
    fn from(items: Vec<Value>) -> Self {
        Self(items)
    }
}

/// A compiled query unit. The program representation is owned by the query
/// runtime that produced it.
pub struct CompiledQuery {
    source_key: String,
    program: Box<dyn Any + Send + Sync>,
}

impl CompiledQuery {
    pub fn new(source_key: impl Into<String>, program: impl Any + Send + Sync) -> Self {
        Self {
            source_key: source_key.into(),
            program: Box::new(program),
        }
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    pub fn program<T: Any>(&self) -> Option<&T> {
        self.program.downcast_ref::<T>()
    }
}

impl fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("source_key", &self.source_key)
            .finish_non_exhaustive()
    }
}

/// Per-query state owned by one execution.
pub trait QueryContext: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn set_module_load_path(&mut self, path: &str);
    fn module_load_path(&self) -> Option<&str>;
    fn prepare_for_execution(&mut self) -> Result<(), QueryError>;
    fn run_cleanup_tasks(&mut self);
}

/// The query compiler and runtime.
#[async_trait]
pub trait QueryService: Send + Sync {
    fn new_context(&self, access: AccessContext) -> Result<Box<dyn QueryContext>, QueryError>;

    fn compile(
        &self,
        context: &mut dyn QueryContext,
        source: &Source,
    ) -> Result<CompiledQuery, QueryError>;

    async fn execute(
        &self,
        context: &mut dyn QueryContext,
        query: &CompiledQuery,
        context_sequence: Option<&Sequence>,
    ) -> Result<Sequence, QueryError>;
}

/// The database-access handle passed to startup triggers.
pub trait Broker: Send + Sync {
    /// Open the collection at `path` and take `mode` on it. `Ok(None)` when
    /// the collection does not exist, in which case no lock is held. On
    /// `Ok(Some(_))` the caller owns the lock and must call
    /// [`Broker::release_collection`].
    fn open_collection(&self, path: &str, mode: LockMode)
    -> Result<Option<Collection>, StorageError>;

    fn release_collection(&self, path: &str, mode: LockMode);

    /// Paths of the documents directly inside `collection`, in the storage
    /// engine's native order. Takes no per-document locks.
    fn documents_no_lock(&self, collection: &Collection) -> Result<Vec<String>, StorageError>;

    /// Fetch the collection at `path`, creating it and any missing ancestors
    /// inside `txn`.
    fn get_or_create_collection(&self, txn: &Txn, path: &str)
    -> Result<Collection, StorageError>;

    fn save_collection(&self, txn: &Txn, collection: &Collection) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;

    fn transaction_manager(&self) -> &dyn TransactionManager;

    fn security_manager(&self) -> &dyn SecurityManager;

    fn source_resolver(&self) -> &dyn SourceResolver;

    fn query_service(&self) -> &dyn QueryService;
}

/// A collection held under a lock, released when the guard drops.
pub struct CollectionGuard<'a> {
    broker: &'a dyn Broker,
    collection: Collection,
    mode: LockMode,
}

impl<'a> CollectionGuard<'a> {
    pub fn open(
        broker: &'a dyn Broker,
        path: &str,
        mode: LockMode,
    ) -> Result<Option<Self>, StorageError> {
        Ok(broker
            .open_collection(path, mode)?
            .map(|collection| Self {
                broker,
                collection,
                mode,
            }))
    }

    /// List the documents covered by this guard's lock.
    pub fn documents(&self) -> Result<Vec<String>, StorageError> {
        self.broker.documents_no_lock(&self.collection)
    }
}

impl Drop for CollectionGuard<'_> {
    fn drop(&mut self) {
        self.broker
            .release_collection(&self.collection.path, self.mode);
    }
}

/// An open transaction, closed exactly once when the guard drops.
///
/// Dropping a guard that was neither committed nor aborted aborts it first.
pub struct TxnGuard<'a> {
    manager: &'a dyn TransactionManager,
    txn: Txn,
    finished: bool,
}

impl<'a> TxnGuard<'a> {
    pub fn begin(manager: &'a dyn TransactionManager) -> Result<Self, StorageError> {
        let txn = manager.begin_transaction()?;
        Ok(Self {
            manager,
            txn,
            finished: false,
        })
    }

    pub fn txn(&self) -> &Txn {
        &self.txn
    }

    pub fn commit(&mut self) -> Result<(), StorageError> {
        self.manager.commit(&self.txn)?;
        self.finished = true;
        Ok(())
    }

    pub fn abort(&mut self) {
        self.manager.abort(&self.txn);
        self.finished = true;
    }
}

impl Drop for TxnGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "Transaction {} dropped without commit or abort, aborting",
                self.txn.id()
            );
            self.manager.abort(&self.txn);
        }
        self.manager.close(&self.txn);
    }
}

/// A query context whose cleanup tasks run exactly once, when the guard drops.
pub struct ContextGuard {
    context: Box<dyn QueryContext>,
}

impl ContextGuard {
    pub fn new(service: &dyn QueryService, access: AccessContext) -> Result<Self, QueryError> {
        Ok(Self {
            context: service.new_context(access)?,
        })
    }

    pub fn context_mut(&mut self) -> &mut dyn QueryContext {
        self.context.as_mut()
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.context.run_cleanup_tasks();
    }
}
