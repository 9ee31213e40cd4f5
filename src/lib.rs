//! Runs query scripts once when the database has finished booting.
//!
//! Scripts come from two places: documents with a query extension stored in
//! the `/db/system/autostart` collection, and the `xquery` parameters of the
//! trigger's startup configuration. Collection scripts run first, then
//! parameter scripts, one at a time. A failing script is logged and skipped;
//! nothing a script does can abort startup.

pub mod bootstrap;
pub mod config;
pub mod database;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod logging;
pub mod memory;
pub mod trigger;
pub mod uri;

pub use discovery::ParameterMap;
pub use executor::{ScriptExecutor, ScriptOutcome};
pub use trigger::{StartupTrigger, TriggerReport, XQueryStartupTrigger};
pub use uri::ScriptLocator;
