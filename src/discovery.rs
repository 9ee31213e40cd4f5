//! Discovery of the scripts to run at startup.
//!
//! Two independent sources feed the trigger: the documents stored in the
//! autostart collection and the `xquery` entries of the trigger's
//! configuration parameters. Each source deduplicates on its own terms only;
//! a script reachable from both sources is run twice.

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, error};

use crate::bootstrap::create_autostart_collection;
use crate::database::{Broker, CollectionGuard, LockMode};
use crate::error::StorageError;
use crate::uri::{AUTOSTART_COLLECTION, ScriptLocator, has_xquery_extension};

/// Name of the configuration parameter listing explicit script paths.
pub const XQUERY_PARAMETER: &str = "xquery";

/// Startup parameters of a trigger: parameter name to its values, in
/// configuration order.
pub type ParameterMap = IndexMap<String, Vec<Value>>;

/// List all query scripts stored directly in the autostart collection.
///
/// The collection is read-locked only while its documents are listed. When
/// the collection does not exist it is created and nothing is returned for
/// this run. Storage errors are logged and yield an empty list.
///
/// The order is the storage engine's native listing order and is not sorted.
pub fn scripts_in_startup_collection(broker: &dyn Broker) -> Vec<ScriptLocator> {
    let paths = match list_startup_collection(broker) {
        Ok(Some(paths)) => paths,
        Ok(None) => {
            debug!("Collection '{}' not found.", AUTOSTART_COLLECTION);
            create_autostart_collection(broker);
            Vec::new()
        }
        Err(e) => {
            error!("Unable to read collection '{}': {}", AUTOSTART_COLLECTION, e);
            Vec::new()
        }
    };

    debug!(
        "Found {} xquery scripts in '{}'.",
        paths.len(),
        AUTOSTART_COLLECTION
    );

    paths
}

/// `Ok(None)` when the collection is absent. The read lock is released before
/// this returns, on every path.
fn list_startup_collection(
    broker: &dyn Broker,
) -> Result<Option<Vec<ScriptLocator>>, StorageError> {
    let Some(collection) = CollectionGuard::open(broker, AUTOSTART_COLLECTION, LockMode::Read)?
    else {
        return Ok(None);
    };

    debug!("Scanning collection '{}'.", AUTOSTART_COLLECTION);

    let mut paths = Vec::new();
    for document in collection.documents()? {
        if !has_xquery_extension(&document) {
            debug!("Skipped document '{}', not an xquery script.", document);
            continue;
        }

        match ScriptLocator::from_db_path(&document) {
            Some(locator) => paths.push(locator),
            None => debug!("Skipped document '{}', not an absolute path.", document),
        }
    }

    Ok(Some(paths))
}

/// Collect script locators from the `xquery` parameter.
///
/// String values must be absolute database paths; anything else is logged and
/// skipped without affecting the remaining values. Non-string values are
/// ignored. Duplicates within the parameter are dropped, keeping the first.
pub fn parameter_scripts(params: &ParameterMap) -> Vec<ScriptLocator> {
    let mut paths: Vec<ScriptLocator> = Vec::new();

    for (name, values) in params {
        if name != XQUERY_PARAMETER {
            continue;
        }

        for value in values {
            let Value::String(path) = value else {
                continue;
            };

            match ScriptLocator::from_db_path(path) {
                Some(locator) => {
                    if !paths.contains(&locator) {
                        paths.push(locator);
                    }
                }
                None => error!("Path '{}' should start with a '/'", path),
            }
        }
    }

    debug!("Found {} '{}' entries.", paths.len(), XQUERY_PARAMETER);

    paths
}
