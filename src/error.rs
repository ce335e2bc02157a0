//! Error types shared by the Vigil core.

/// Errors raised by storage, ingestion, rule handling and acknowledgement.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A rule configuration was rejected at save time.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// A stored or submitted value could not be interpreted.
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    /// The background evaluation worker is no longer receiving jobs.
    #[error("evaluation queue is closed")]
    QueueClosed,

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_value(field: &'static str, value: impl ToString) -> Self {
        Error::InvalidValue {
            field,
            value: value.to_string(),
        }
    }

    /// Returns true if this error reports a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("channel", 42);
        assert_eq!(err.to_string(), "channel 42 not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_invalid_rule_display() {
        let err = Error::InvalidRule("out-of-range requires both thresholds".to_string());
        assert_eq!(
            err.to_string(),
            "invalid rule: out-of-range requires both thresholds"
        );
        assert!(!err.is_not_found());
    }
}
