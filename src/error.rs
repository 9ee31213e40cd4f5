use thiserror::Error;

/// Errors raised by the storage side of the database: collections, locks and
/// transactions.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Invalid collection path: {0}")]
    InvalidPath(String),

    #[error("Transaction {txn} failed: {message}")]
    Transaction { txn: u64, message: String },

    #[error("Storage failure: {0}")]
    Io(String),
}

/// Stage of the query pipeline an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Resolve,
    Context,
    Compile,
    Prepare,
    Execute,
}

impl QueryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStage::Resolve => "resolve",
            QueryStage::Context => "context",
            QueryStage::Compile => "compile",
            QueryStage::Prepare => "prepare",
            QueryStage::Execute => "execute",
        }
    }
}

/// Errors raised by the query runtime.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Failed to resolve source {locator}: {message}")]
    Resolve { locator: String, message: String },

    #[error("Failed to create query context: {0}")]
    Context(String),

    #[error("Compilation error: {message}{}", line_suffix(.line))]
    Compile { message: String, line: Option<u32> },

    #[error("Failed to prepare context: {0}")]
    Prepare(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn line_suffix(line: &Option<u32>) -> String {
    match line {
        Some(line) => format!(" (line {})", line),
        None => String::new(),
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_reports_line() {
        let err = QueryError::Compile {
            message: "unexpected token".to_string(),
            line: Some(3),
        };
        assert_eq!(err.to_string(), "Compilation error: unexpected token (line 3)");

        let err = QueryError::Compile {
            message: "unexpected end".to_string(),
            line: None,
        };
        assert_eq!(err.to_string(), "Compilation error: unexpected end");
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: QueryError = StorageError::PermissionDenied("/db/x.xq".to_string()).into();
        assert_eq!(err.to_string(), "Permission denied: /db/x.xq");
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(QueryStage::Resolve.as_str(), "resolve");
        assert_eq!(QueryStage::Execute.as_str(), "execute");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Invalid {
            key: "logging.format".to_string(),
            reason: "must be 'compact' or 'json'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for logging.format: must be 'compact' or 'json'"
        );
    }
}
