use thiserror::Error;

/// Server error codes that mean "this node cannot serve the request right
/// now" (stepped down, not primary, or recovering). A request failing with
/// one of these may succeed against a freshly selected server.
pub const NOT_PRIMARY_CODES: &[i32] = &[
    10107, // NotWritablePrimary
    13435, // NotPrimaryNoSecondaryOk
    13436, // NotPrimaryOrSecondary
    11600, // InterruptedAtShutdown
    11602, // InterruptedDueToReplStateChange
    189,   // PrimarySteppedDown
    91,    // ShutdownInProgress
];

const NOT_PRIMARY_MESSAGES: &[&str] = &["not master", "not primary", "node is recovering"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Protocol error: unknown compressor id {0:#04x}")]
    UnknownCompressor(u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Socket timeout: {0}")]
    SocketTimeout(String),

    #[error("Operation failed: {message} (code {code:?})")]
    OperationFailure { code: Option<i32>, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("No suitable server: {0}")]
    NoSuitableServer(String),

    #[error("Change stream is closed")]
    StreamClosed,
}

pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    /// Socket-level failure (reset, refused, timed out).
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            DriverError::Connection(_) | DriverError::SocketTimeout(_)
        )
    }

    /// Server-side "not primary" or "node is recovering" failure.
    pub fn is_not_primary(&self) -> bool {
        match self {
            DriverError::OperationFailure {
                code: Some(code), ..
            } => NOT_PRIMARY_CODES.contains(code),
            DriverError::OperationFailure {
                code: None,
                message,
            } => {
                let message = message.to_ascii_lowercase();
                NOT_PRIMARY_MESSAGES.iter().any(|m| message.contains(m))
            }
            _ => false,
        }
    }

    /// Whether a failed read may be transparently reissued once.
    pub fn is_resumable(&self) -> bool {
        self.is_network_error() || self.is_not_primary()
    }

    /// Errors caused by malformed frames or payloads. These are never retried.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            DriverError::Protocol(_)
                | DriverError::MessageTooLarge(_)
                | DriverError::UnknownCompressor(_)
        )
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        DriverError::Protocol(msg.into())
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                DriverError::SocketTimeout(err.to_string())
            }
            _ => DriverError::Connection(err.to_string()),
        }
    }
}

impl From<rmp_serde::encode::Error> for DriverError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        DriverError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DriverError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        DriverError::Protocol(format!("Invalid document: {}", err))
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::Protocol(format!("Unexpected reply shape: {}", err))
    }
}
