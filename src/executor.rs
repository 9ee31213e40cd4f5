use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, info};

use crate::database::{AccessContext, Broker, ContextGuard, QueryService, SourceResolver};
use crate::error::{QueryError, QueryStage};
use crate::uri::ScriptLocator;

/// Result of running a single startup script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// The script ran; `result` is the string value of its output.
    Completed { result: String },
    /// No source exists for the locator.
    NotFound,
    /// The query runtime reported an error.
    Failed { stage: QueryStage, message: String },
    /// The query runtime panicked.
    Panicked { message: String },
}

impl ScriptOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ScriptOutcome::Failed { .. } | ScriptOutcome::Panicked { .. }
        )
    }
}

/// A query error tagged with the pipeline step that raised it.
#[derive(Debug)]
struct StagedError {
    stage: QueryStage,
    error: QueryError,
}

trait AtStage<T> {
    fn at(self, stage: QueryStage) -> Result<T, StagedError>;
}

impl<T> AtStage<T> for Result<T, QueryError> {
    fn at(self, stage: QueryStage) -> Result<T, StagedError> {
        self.map_err(|error| StagedError { stage, error })
    }
}

impl From<StagedError> for ScriptOutcome {
    fn from(err: StagedError) -> Self {
        ScriptOutcome::Failed {
            stage: err.stage,
            message: err.error.to_string(),
        }
    }
}

/// Runs startup scripts one at a time, containing every failure.
pub struct ScriptExecutor<'a> {
    resolver: &'a dyn SourceResolver,
    service: &'a dyn QueryService,
}

impl<'a> ScriptExecutor<'a> {
    pub fn new(resolver: &'a dyn SourceResolver, service: &'a dyn QueryService) -> Self {
        Self { resolver, service }
    }

    pub fn for_broker(broker: &'a dyn Broker) -> Self {
        Self::new(broker.source_resolver(), broker.query_service())
    }

    /// Resolve, compile and run the script at `locator`.
    ///
    /// Never fails: errors and panics from the query runtime are logged and
    /// returned as the outcome. When a query context was created its cleanup
    /// tasks have run exactly once by the time this returns.
    pub async fn execute_query(&self, locator: &ScriptLocator) -> ScriptOutcome {
        match AssertUnwindSafe(self.run(locator)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(
                    "An error occurred during preparation/execution of the xquery script {} \
                     ({} stage): {}",
                    locator,
                    e.stage.as_str(),
                    e.error
                );
                ScriptOutcome::from(e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    "The xquery script {} aborted unexpectedly: {}",
                    locator, message
                );
                ScriptOutcome::Panicked { message }
            }
        }
    }

    async fn run(&self, locator: &ScriptLocator) -> Result<ScriptOutcome, StagedError> {
        let Some(source) = self.resolver.resolve(locator).at(QueryStage::Resolve)? else {
            info!("No xquery found at '{}'", locator);
            return Ok(ScriptOutcome::NotFound);
        };

        let mut context =
            ContextGuard::new(self.service, AccessContext::Trigger).at(QueryStage::Context)?;

        // sibling modules are imported relative to the script's collection
        context
            .context_mut()
            .set_module_load_path(locator.module_load_path());

        let compiled = self
            .service
            .compile(context.context_mut(), &source)
            .at(QueryStage::Compile)?;

        info!("Starting xquery at '{}'", locator);

        context
            .context_mut()
            .prepare_for_execution()
            .at(QueryStage::Prepare)?;

        let result = self
            .service
            .execute(context.context_mut(), &compiled, None)
            .await
            .at(QueryStage::Execute)?;

        let result = result.string_value();
        info!("Result xquery: '{}'", result);

        Ok(ScriptOutcome::Completed { result })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
