use async_trait::async_trait;
use tracing::{info, warn};

use crate::database::Broker;
use crate::discovery::{ParameterMap, parameter_scripts, scripts_in_startup_collection};
use crate::executor::{ScriptExecutor, ScriptOutcome};
use crate::uri::ScriptLocator;

/// A hook the database runs once when it has finished booting.
#[async_trait]
pub trait StartupTrigger: Send + Sync {
    /// Run the hook. Implementations must not fail startup: every error is
    /// handled internally.
    async fn execute(&self, broker: &dyn Broker, params: &ParameterMap);
}

/// Where a startup script was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOrigin {
    AutostartCollection,
    Parameter,
}

/// One script run by the trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRun {
    pub locator: ScriptLocator,
    pub origin: ScriptOrigin,
    pub outcome: ScriptOutcome,
}

/// Everything a trigger run did, in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub runs: Vec<ScriptRun>,
}

impl TriggerReport {
    pub fn completed(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| matches!(r.outcome, ScriptOutcome::Completed { .. }))
            .count()
    }

    pub fn not_found(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| r.outcome == ScriptOutcome::NotFound)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|r| r.outcome.is_failure()).count()
    }

    pub fn locators(&self) -> Vec<&str> {
        self.runs.iter().map(|r| r.locator.as_str()).collect()
    }
}

/// Startup trigger that runs query scripts stored in the autostart
/// collection, then the scripts listed in its `xquery` parameters.
///
/// A script found by both sources runs twice; the sources are not merged.
#[derive(Debug, Clone, Copy, Default)]
pub struct XQueryStartupTrigger;

impl XQueryStartupTrigger {
    pub fn new() -> Self {
        Self
    }

    /// Discover and run all startup scripts, returning what happened to each.
    ///
    /// Both sources are discovered before the first script runs, so no
    /// collection lock is held while scripts execute.
    pub async fn run(&self, broker: &dyn Broker, params: &ParameterMap) -> TriggerReport {
        info!("Starting Startup Trigger for stored XQueries");

        let queue: Vec<(ScriptLocator, ScriptOrigin)> = scripts_in_startup_collection(broker)
            .into_iter()
            .map(|locator| (locator, ScriptOrigin::AutostartCollection))
            .chain(
                parameter_scripts(params)
                    .into_iter()
                    .map(|locator| (locator, ScriptOrigin::Parameter)),
            )
            .collect();

        info!("Found {} startup scripts to run", queue.len());

        let executor = ScriptExecutor::for_broker(broker);
        let mut report = TriggerReport::default();

        for (locator, origin) in queue {
            let outcome = executor.execute_query(&locator).await;
            report.runs.push(ScriptRun {
                locator,
                origin,
                outcome,
            });
        }

        if report.failed() > 0 {
            warn!(
                "Startup scripts finished: {} completed, {} not found, {} failed",
                report.completed(),
                report.not_found(),
                report.failed()
            );
        } else {
            info!(
                "Startup scripts finished: {} completed, {} not found",
                report.completed(),
                report.not_found()
            );
        }

        report
    }
}

#[async_trait]
impl StartupTrigger for XQueryStartupTrigger {
    async fn execute(&self, broker: &dyn Broker, params: &ParameterMap) {
        self.run(broker, params).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, ScriptBehavior};
    use serde_json::json;

    #[tokio::test]
    async fn test_collection_scripts_run_before_parameter_scripts() {
        let broker = MemoryBroker::new();
        broker.store_document("/db/system/autostart/b.xq", "b");
        broker.store_document("/db/system/autostart/a.xq", "a");
        broker.store_document("/db/param.xq", "p");

        let mut params = ParameterMap::new();
        params.insert("xquery".to_string(), vec![json!("/db/param.xq")]);

        let report = XQueryStartupTrigger::new().run(&broker, &params).await;

        assert_eq!(
            report.locators(),
            vec![
                "xmldb:exist:///db/system/autostart/b.xq",
                "xmldb:exist:///db/system/autostart/a.xq",
                "xmldb:exist:///db/param.xq"
            ]
        );
        assert_eq!(report.runs[0].origin, ScriptOrigin::AutostartCollection);
        assert_eq!(report.runs[2].origin, ScriptOrigin::Parameter);
        assert_eq!(report.completed(), 3);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_queue() {
        let broker = MemoryBroker::new();
        broker.store_document("/db/system/autostart/1.xq", "one");
        broker.store_document("/db/system/autostart/2.xq", "two");
        broker.store_document("/db/system/autostart/3.xq", "three");
        broker.queries().set_behavior(
            "/db/system/autostart/2.xq",
            ScriptBehavior::FailExecute("err:FOER0000".into()),
        );

        let report = XQueryStartupTrigger::new()
            .run(&broker, &ParameterMap::new())
            .await;

        assert_eq!(report.completed(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(
            broker.queries().executed(),
            vec![
                "/db/system/autostart/1.xq",
                "/db/system/autostart/2.xq",
                "/db/system/autostart/3.xq"
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_through_trait_object() {
        let broker = MemoryBroker::new();
        broker.store_document("/db/system/autostart/a.xq", "a");

        let trigger: Box<dyn StartupTrigger> = Box::new(XQueryStartupTrigger::new());
        trigger.execute(&broker, &ParameterMap::new()).await;

        assert_eq!(broker.queries().executed(), vec!["/db/system/autostart/a.xq"]);
    }
}
