use thiserror::Error;

/// Failure taxonomy produced by the engine core.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no subnet routes this request")]
    UnknownSubnet,

    #[error("server identifier does not match a local address")]
    WrongServerId,

    #[error("unsupported message type")]
    UnsupportedMessageType,

    #[error("subnet pool exhausted")]
    PoolExhausted,

    #[error("requested address is not available")]
    AddressUnavailable,

    #[error("unknown option type: {0}")]
    BadOption(String),

    #[error("subnet already exists: {0}")]
    DuplicateSubnet(String),

    #[error("subnet overlaps an existing subnet: {0}")]
    SubnetOverlap(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("socket closed")]
    SocketClosed,

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<redb::Error> for EngineError {
    fn from(e: redb::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<redb::StorageError> for EngineError {
    fn from(e: redb::StorageError) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<redb::TableError> for EngineError {
    fn from(e: redb::TableError) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<redb::TransactionError> for EngineError {
    fn from(e: redb::TransactionError) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<redb::CommitError> for EngineError {
    fn from(e: redb::CommitError) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<redb::DatabaseError> for EngineError {
    fn from(e: redb::DatabaseError) -> Self {
        EngineError::Database(e.to_string())
    }
}
