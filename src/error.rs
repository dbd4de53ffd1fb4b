use anyhow::anyhow;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    Database,
    InvalidInput,
    NotFound,
    Unavailable,
    Unknown,
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            code: "database_error",
            public,
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "invalid_input",
            public,
            source,
        }
    }

    pub fn invalid_with_code(
        code: &'static str,
        public: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code,
            public,
            source,
        }
    }

    pub fn cyclic_reference(source: anyhow::Error) -> Self {
        Self::invalid_with_code(
            "cyclic_identifying_reference",
            "Identifying relationships cannot form a cycle",
            source,
        )
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            source,
        }
    }

    /// The row changed between the read and the write; the caller should re-issue.
    pub fn conflict(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code: "concurrency_conflict",
            public,
            source,
        }
    }

    pub fn validator_unavailable(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unavailable,
            code: "validator_unavailable",
            public,
            source,
        }
    }

    pub fn unknown(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            code: "unknown_error",
            public,
            source,
        }
    }

    pub fn message(public: &'static str) -> Self {
        Self::unknown(public, anyhow!(public))
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Conflict | ErrorKind::Unavailable)
    }
}

impl std::fmt::Display for LibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.public, self.code, self.source)
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        Self::database("Database request failed", anyhow!(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_and_validator_failures_are_retryable() {
        assert!(LibError::conflict("changed", anyhow!("row gone")).is_retryable());
        assert!(LibError::validator_unavailable("down", anyhow!("timeout")).is_retryable());
        assert!(!LibError::cyclic_reference(anyhow!("cycle")).is_retryable());
        assert!(!LibError::not_found("missing", anyhow!("missing")).is_retryable());
        assert!(!LibError::database("db", anyhow!("db")).is_retryable());
    }

    #[test]
    fn cyclic_reference_is_a_structural_violation() {
        let err = LibError::cyclic_reference(anyhow!("t1 -> t2 -> t1"));
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert_eq!(err.code, "cyclic_identifying_reference");
    }
}
