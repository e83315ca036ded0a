pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// protocol errors, the connection is closed on these
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    /// routing errors, logged and the request dropped
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    /// session api errors
    #[error("session {0} cannot respond to a notify")]
    NotifyMode(u64),

    #[error("illegal uid: {0}")]
    IllegalUid(i64),

    #[error("session key not found: {0}")]
    KeyNotFound(String),

    #[error("wrong type for session key: {0}")]
    WrongType(String),

    /// rpc resolution errors, returned to the caller synchronously
    #[error("no server of type '{0}' registered")]
    ServerNotFound(String),

    #[error("server id '{0}' not registered")]
    ServerIdNotFound(String),

    #[error("rpc to the local server type '{0}'")]
    SelfRpc(String),

    #[error("rpc target '{0}' is a frontend server")]
    FrontendTarget(String),

    /// error reported by a remote handler
    #[error("remote error: {0}")]
    Remote(String),

    #[error("session {0} is gone")]
    SessionGone(u64),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("serde error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// lenient by contract: the demultiplexer logs and drops these
    #[error("unrecognized rpc response kind {0}")]
    UnknownResponseKind(u8),

    /// marker error used by the incremental frame parsers
    #[error("incomplete")]
    Incomplete,
}
