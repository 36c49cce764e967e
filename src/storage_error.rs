#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    /// Error surfaced by the embedded key-value engine.
    Db(String),
    Codec(String),
    NotFound,
    /// Requested trace table does not exist and creation was not allowed.
    TableNotFound(String),
    InvalidInterval {
        start: u64,
        end: u64,
        level: u8,
    },
    CorruptCounter(String),
    Other(String),
}

impl StorageError {
    pub fn db(e: impl std::fmt::Display) -> Self {
        StorageError::Db(e.to_string())
    }

    pub fn is_table_not_found(&self) -> bool {
        matches!(self, StorageError::TableNotFound(_))
    }
}

impl Clone for StorageError {
    fn clone(&self) -> Self {
        match self {
            StorageError::Io(e) => StorageError::Io(std::io::Error::new(e.kind(), e.to_string())),
            StorageError::Db(s) => StorageError::Db(s.clone()),
            StorageError::Codec(s) => StorageError::Codec(s.clone()),
            StorageError::NotFound => StorageError::NotFound,
            StorageError::TableNotFound(s) => StorageError::TableNotFound(s.clone()),
            StorageError::InvalidInterval { start, end, level } => StorageError::InvalidInterval {
                start: *start,
                end: *end,
                level: *level,
            },
            StorageError::CorruptCounter(s) => StorageError::CorruptCounter(s.clone()),
            StorageError::Other(s) => StorageError::Other(s.clone()),
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Db(e) => write!(f, "Database error: {}", e),
            StorageError::Codec(e) => write!(f, "Serialization error: {}", e),
            StorageError::NotFound => write!(f, "Entity not found"),
            StorageError::TableNotFound(name) => write!(f, "Table not found: {name}"),
            StorageError::InvalidInterval { start, end, level } => {
                write!(f, "Invalid interval [{start}, {end}] at level {level}")
            }
            StorageError::CorruptCounter(name) => write!(f, "Corrupt max counter in {name}"),
            StorageError::Other(e) => write!(f, "Other: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<redb::Error> for StorageError {
    fn from(e: redb::Error) -> Self {
        StorageError::db(e)
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(e: redb::DatabaseError) -> Self {
        StorageError::db(e)
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(e: redb::TransactionError) -> Self {
        StorageError::db(e)
    }
}

impl From<redb::TableError> for StorageError {
    fn from(e: redb::TableError) -> Self {
        StorageError::db(e)
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(e: redb::StorageError) -> Self {
        StorageError::db(e)
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(e: redb::CommitError) -> Self {
        StorageError::db(e)
    }
}
