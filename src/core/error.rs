use std::fmt;

/// Common error types for the CDC core module
#[derive(Debug)]
pub enum CoreError {
    /// Configuration errors
    ConfigError {
        message: String,
    },

    /// Catalog errors (listing schemas/tables, DDL lookup)
    CatalogError {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Per-table snapshot errors (missing primary key, chunk read failures)
    SnapshotError {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Position parsing/tracking errors (malformed GTID intervals)
    PositionError {
        message: String,
    },

    /// Replication stream errors
    ReplicationError {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Event dispatch errors; `cancelled` marks the shared-cancellation case
    DispatchError {
        message: String,
        cancelled: bool,
    },

    /// Metadata store errors
    MetaError {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

#[allow(dead_code)]
impl CoreError {
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    pub fn catalog_error(message: impl Into<String>) -> Self {
        Self::CatalogError {
            message: message.into(),
            source: None,
        }
    }

    pub fn catalog_error_with_cause(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::CatalogError {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    pub fn snapshot_error(message: impl Into<String>) -> Self {
        Self::SnapshotError {
            message: message.into(),
            source: None,
        }
    }

    pub fn snapshot_error_with_cause(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SnapshotError {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    pub fn position_error(message: impl Into<String>) -> Self {
        Self::PositionError {
            message: message.into(),
        }
    }

    pub fn replication_error(message: impl Into<String>) -> Self {
        Self::ReplicationError {
            message: message.into(),
            source: None,
        }
    }

    pub fn replication_error_with_cause(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ReplicationError {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    pub fn dispatch_error(message: impl Into<String>) -> Self {
        Self::DispatchError {
            message: message.into(),
            cancelled: false,
        }
    }

    pub fn dispatch_cancelled(message: impl Into<String>) -> Self {
        Self::DispatchError {
            message: message.into(),
            cancelled: true,
        }
    }

    pub fn meta_error(message: impl Into<String>) -> Self {
        Self::MetaError {
            message: message.into(),
            source: None,
        }
    }

    pub fn meta_error_with_cause(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::MetaError {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// True for dispatch failures caused by the shared cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::DispatchError { cancelled: true, .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::ConfigError { message } => write!(f, "Configuration error: {}", message),
            CoreError::CatalogError { message, source } => {
                write!(f, "Catalog error: {}", message)?;
                if let Some(src) = source {
                    write!(f, " (caused by: {})", src)?;
                }
                Ok(())
            }
            CoreError::SnapshotError { message, source } => {
                write!(f, "Snapshot error: {}", message)?;
                if let Some(src) = source {
                    write!(f, " (caused by: {})", src)?;
                }
                Ok(())
            }
            CoreError::PositionError { message } => write!(f, "Position error: {}", message),
            CoreError::ReplicationError { message, source } => {
                write!(f, "Replication error: {}", message)?;
                if let Some(src) = source {
                    write!(f, " (caused by: {})", src)?;
                }
                Ok(())
            }
            CoreError::DispatchError { message, cancelled } => {
                if *cancelled {
                    write!(f, "Dispatch cancelled: {}", message)
                } else {
                    write!(f, "Dispatch error: {}", message)
                }
            }
            CoreError::MetaError { message, source } => {
                write!(f, "Metadata error: {}", message)?;
                if let Some(src) = source {
                    write!(f, " (caused by: {})", src)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::CatalogError { source, .. }
            | CoreError::SnapshotError { source, .. }
            | CoreError::ReplicationError { source, .. }
            | CoreError::MetaError { source, .. } => {
                source.as_ref().map(|e| e.as_ref() as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

/// Result type alias using CoreError
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_creation() {
        let err = CoreError::snapshot_error("table app.orders has no primary key");
        assert!(err.to_string().contains("no primary key"));

        let err = CoreError::config_error("missing CDC_DATASOURCE");
        assert!(err.to_string().contains("missing CDC_DATASOURCE"));

        let err = CoreError::position_error("bad interval '1-'");
        assert!(err.to_string().contains("bad interval"));
    }

    #[test]
    fn test_error_with_cause() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = CoreError::replication_error_with_cause("stream closed", io_err);
        assert!(err.to_string().contains("stream closed"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_cancelled_flag() {
        assert!(CoreError::dispatch_cancelled("shutdown").is_cancelled());
        assert!(!CoreError::dispatch_error("channel closed").is_cancelled());
        assert!(!CoreError::catalog_error("boom").is_cancelled());
    }
}
