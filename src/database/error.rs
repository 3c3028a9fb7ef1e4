use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    NotFound,
    UniqueViolation,
    ConnectionError,
    PoolTimeout,
    QueryError,
    Other,
}

#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
    pub message: String,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::new(DatabaseErrorKind::NotFound, err.to_string()),
            sqlx::Error::PoolTimedOut => {
                Self::new(DatabaseErrorKind::PoolTimeout, err.to_string())
            }
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
                Self::new(DatabaseErrorKind::ConnectionError, err.to_string())
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::new(DatabaseErrorKind::UniqueViolation, err.to_string())
            }
            sqlx::Error::Database(_) | sqlx::Error::ColumnDecode { .. } => {
                Self::new(DatabaseErrorKind::QueryError, err.to_string())
            }
            _ => Self::new(DatabaseErrorKind::Other, err.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::ConnectionError | DatabaseErrorKind::PoolTimeout
        )
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for DatabaseError {}
