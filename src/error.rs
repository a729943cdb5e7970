//! Definition of error types produced by the runtime.

use thiserror::Error;

////////////////////////////////////////////////////////////////////////////////

/// Errors of the byte-level transports.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Transport manager was used before [`initialize`][crate::transport::TransportManager::initialize].
    #[error("transport is not initialized")]
    NotInitialized,

    /// Nobody listens at the requested address.
    #[error("no endpoint at {host}:{port}")]
    Unreachable {
        /// Destination host.
        host: String,
        /// Destination port.
        port: u16,
    },

    /// Remote endpoint rejected our cookie.
    #[error("authentication with {host}:{port} failed")]
    Authentication {
        /// Destination host.
        host: String,
        /// Destination port.
        port: u16,
    },

    /// No port of the configured range could be bound.
    #[error("no free port in range {min}..{max}")]
    NoFreePort {
        /// First port tried.
        min: u16,
        /// Upper bound (exclusive).
        max: u16,
    },

    /// Transport state can not be handed over to another OS process.
    #[error("transport {0} can not be handed over to another process")]
    NotTransferable(String),

    /// Underlying io error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

////////////////////////////////////////////////////////////////////////////////

/// Errors of the binary codec.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Value can not be encoded.
    #[error("can not encode: {0}")]
    Encode(String),

    /// Bytes can not be decoded.
    #[error("can not decode: {0}")]
    Decode(String),

    /// Frame was produced by another codec version.
    #[error("unsupported codec version {0}")]
    Version(u8),

    /// Encoded value does not fit into a buffer.
    #[error("encoded size {size} exceeds limit {limit}")]
    TooBig {
        /// Encoded size.
        size: usize,
        /// Available space.
        limit: usize,
    },
}

////////////////////////////////////////////////////////////////////////////////

/// Errors of the [router][crate::router::Router].
#[derive(Error, Debug)]
pub enum RoutingError {
    /// Destination is the router itself.
    #[error("circular routing to {0}")]
    CircularRouting(String),

    /// No transport satisfies the requested channel capabilities.
    #[error("no transport supports the requested channel")]
    NoAvailableTransport,

    /// Serialized frame does not fit into the message buffer.
    #[error("message of {size} bytes exceeds buffer of {limit} bytes")]
    MessageTooBig {
        /// Encoded size.
        size: usize,
        /// Available space.
        limit: usize,
    },

    /// Frame could not be encoded or decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Peer rejected our cookie.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Every transport was tried and no peer answered.
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// Router was used in a state which does not allow the operation.
    #[error("invalid router state: {0}")]
    InvalidRouterState(String),

    /// Transport failed to deliver bytes.
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for RoutingError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Authentication { host, port } => {
                RoutingError::Authentication(format!("{}:{}", host, port))
            }
            other => RoutingError::Transport(other),
        }
    }
}

impl From<CodecError> for RoutingError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::TooBig { size, limit } => RoutingError::MessageTooBig { size, limit },
            other => RoutingError::InvalidMessage(other.to_string()),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Errors of trace recording and replaying.
#[derive(Error, Debug)]
pub enum TraceError {
    /// File is not a trace of the expected stream type.
    #[error("bad trace format: {0}")]
    Format(String),

    /// Trace was produced by an incompatible runtime version.
    #[error("unsupported trace version: {0}")]
    Version(String),

    /// Receive and send traces do not belong together.
    #[error("trace corrupted: {0}")]
    Corrupted(String),

    /// Replayed run diverged from the recorded one.
    #[error("trace mismatch: {0}")]
    Mismatch(String),

    /// No more records to replay.
    #[error("trace ended: {0}")]
    Ended(String),

    /// Underlying io error.
    #[error("trace io error: {0}")]
    Io(#[from] std::io::Error),
}

////////////////////////////////////////////////////////////////////////////////

/// Control-flow outcome of the blocking operations of a process.
///
/// Every builtin which may wait for other processes returns it, so `?` in
/// algorithm code propagates exits and fatal failures up to the container.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Process requested to exit with the given code.
    #[error("process exited with code {0}")]
    Exit(i32),

    /// Fatal routing failure.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Fatal trace failure.
    #[error(transparent)]
    Trace(#[from] TraceError),

    /// Process was interrupted from outside (its queue was closed).
    #[error("process interrupted")]
    Interrupted,

    /// Failure of user code.
    #[error("{0}")]
    Failed(String),
}

impl From<String> for ProcessError {
    fn from(err: String) -> Self {
        ProcessError::Failed(err)
    }
}

impl From<&str> for ProcessError {
    fn from(err: &str) -> Self {
        ProcessError::Failed(err.to_owned())
    }
}

/// Result of process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;
