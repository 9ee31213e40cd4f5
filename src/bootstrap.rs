use tracing::{debug, error};

use crate::database::{Broker, TxnGuard};
use crate::error::StorageError;
use crate::uri::AUTOSTART_COLLECTION;

/// Result of a bootstrap attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Created,
    Failed(String),
}

/// Create the autostart collection, owned by the system subject and the DBA
/// group, inside a single transaction.
///
/// Failures are logged and reported, never propagated. The transaction is
/// aborted on failure and closed exactly once on every path.
pub fn create_autostart_collection(broker: &dyn Broker) -> BootstrapOutcome {
    debug!("Creating {}", AUTOSTART_COLLECTION);

    let mut txn = match TxnGuard::begin(broker.transaction_manager()) {
        Ok(txn) => txn,
        Err(e) => {
            error!("Failed to begin transaction for {}: {}", AUTOSTART_COLLECTION, e);
            return BootstrapOutcome::Failed(e.to_string());
        }
    };

    match create_in_transaction(broker, &mut txn) {
        Ok(()) => {
            debug!("Finished creation of collection {}", AUTOSTART_COLLECTION);
            BootstrapOutcome::Created
        }
        Err(e) => {
            error!("Failed to create collection {}: {}", AUTOSTART_COLLECTION, e);
            txn.abort();
            BootstrapOutcome::Failed(e.to_string())
        }
    }
}

fn create_in_transaction(broker: &dyn Broker, txn: &mut TxnGuard<'_>) -> Result<(), StorageError> {
    let mut created = broker.get_or_create_collection(txn.txn(), AUTOSTART_COLLECTION)?;

    let security = broker.security_manager();
    created.permissions.set_owner(security.system_subject());
    created.permissions.set_group(security.dba_group());

    broker.save_collection(txn.txn(), &created)?;
    broker.flush()?;

    txn.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{JournalEntry, MemoryBroker};

    #[test]
    fn test_creates_collection_with_system_ownership() {
        let broker = MemoryBroker::new();

        assert_eq!(create_autostart_collection(&broker), BootstrapOutcome::Created);

        let permissions = broker
            .collection_permissions(AUTOSTART_COLLECTION)
            .expect("collection should exist");
        assert_eq!(permissions.owner, broker.security_manager().system_subject());
        assert_eq!(permissions.group, broker.security_manager().dba_group());
        // intermediate collections are created as well
        assert!(broker.collection_permissions("/db/system").is_some());
    }

    fn txn_events(broker: &MemoryBroker) -> Vec<JournalEntry> {
        broker
            .journal()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    JournalEntry::Begin(_)
                        | JournalEntry::Commit(_)
                        | JournalEntry::Abort(_)
                        | JournalEntry::Close(_)
                )
            })
            .collect()
    }

    #[test]
    fn test_commit_then_close() {
        let broker = MemoryBroker::new();
        create_autostart_collection(&broker);

        assert_eq!(
            txn_events(&broker),
            vec![
                JournalEntry::Begin(1),
                JournalEntry::Commit(1),
                JournalEntry::Close(1)
            ]
        );
    }

    #[test]
    fn test_save_failure_aborts_and_closes_once() {
        let broker = MemoryBroker::new();
        broker.fail_save("disk full");

        let outcome = create_autostart_collection(&broker);
        assert!(matches!(outcome, BootstrapOutcome::Failed(msg) if msg.contains("disk full")));

        let journal = broker.journal();
        assert!(journal.contains(&JournalEntry::Abort(1)));
        assert!(!journal.contains(&JournalEntry::Commit(1)));
        assert_eq!(
            journal
                .iter()
                .filter(|e| matches!(e, JournalEntry::Close(_)))
                .count(),
            1
        );
        // aborted creation leaves nothing behind
        assert!(broker.collection_permissions(AUTOSTART_COLLECTION).is_none());
        assert!(broker.collection_permissions("/db/system").is_none());
    }

    #[test]
    fn test_flush_failure_aborts() {
        let broker = MemoryBroker::new();
        broker.fail_flush("journal unavailable");

        let outcome = create_autostart_collection(&broker);
        assert!(matches!(outcome, BootstrapOutcome::Failed(_)));
        assert!(broker.collection_permissions(AUTOSTART_COLLECTION).is_none());
        assert!(broker.journal().contains(&JournalEntry::Close(1)));
    }

    #[test]
    fn test_commit_failure_aborts_once_then_closes() {
        let broker = MemoryBroker::new();
        broker.fail_commit("log write failed");

        let outcome = create_autostart_collection(&broker);
        assert!(matches!(
            outcome,
            BootstrapOutcome::Failed(msg) if msg.contains("log write failed")
        ));

        assert_eq!(
            txn_events(&broker),
            vec![
                JournalEntry::Begin(1),
                JournalEntry::Abort(1),
                JournalEntry::Close(1)
            ]
        );
        assert!(broker.collection_permissions(AUTOSTART_COLLECTION).is_none());
    }

    #[test]
    fn test_begin_failure_touches_nothing() {
        let broker = MemoryBroker::new();
        broker.fail_begin("too many transactions");

        let outcome = create_autostart_collection(&broker);
        assert_eq!(
            outcome,
            BootstrapOutcome::Failed("Storage failure: too many transactions".to_string())
        );
        assert!(txn_events(&broker).is_empty());
        assert!(broker.collection_permissions("/db/system").is_none());
    }
}
