/// Unified error handling for the slotgate gateway
///
/// Every failure a request can run into maps onto one `GatewayError` kind.
/// The kind decides whether the leased backend connection may be reused and
/// which status the caller receives.
use std::fmt;
use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The slot has no owner and no fallback node is configured
    #[error("No route available for slot {slot}")]
    NoRouteAvailable { slot: u16 },

    /// The per-node connection cap was not freed up within the acquire timeout
    #[error("Connection pool exhausted for {node}")]
    PoolExhausted { node: String },

    /// The inbound request does not fit the operation's shape
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The backend sent something the reply decoder cannot follow
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("Connect timeout to {node}")]
    ConnectTimeout { node: String },

    #[error("Send timeout to {node}")]
    SendTimeout { node: String },

    #[error("Receive timeout from {node}")]
    ReceiveTimeout { node: String },

    /// The redirect hop cap was exceeded
    #[error("Too many redirects ({hops})")]
    TooManyRedirects { hops: u8 },

    #[error("Backend {node} unreachable: {source}")]
    BackendUnreachable {
        node: String,
        #[source]
        source: io::Error,
    },

    /// The caller went away before the response was delivered
    #[error("Request cancelled by client")]
    Cancelled,

    /// Network-related errors on an established connection
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParse(#[from] AddrParseError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Convenience methods for creating specific error types
impl GatewayError {
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        GatewayError::MalformedRequest(message.into())
    }

    pub fn desync<S: Into<String>>(message: S) -> Self {
        GatewayError::ProtocolDesync(message.into())
    }

    pub fn pool_exhausted<S: Into<String>>(node: S) -> Self {
        GatewayError::PoolExhausted { node: node.into() }
    }

    pub fn unreachable<S: Into<String>>(node: S, source: io::Error) -> Self {
        GatewayError::BackendUnreachable {
            node: node.into(),
            source,
        }
    }

    /// Whether a connection involved in this failure must be discarded.
    ///
    /// Anything that may leave bytes in flight on the wire poisons the
    /// connection for every later request.
    pub fn discards_connection(&self) -> bool {
        matches!(
            self,
            GatewayError::ProtocolDesync(_)
                | GatewayError::ConnectTimeout { .. }
                | GatewayError::SendTimeout { .. }
                | GatewayError::ReceiveTimeout { .. }
                | GatewayError::BackendUnreachable { .. }
                | GatewayError::Network(_)
                | GatewayError::Cancelled
        )
    }

    /// Check if this error is recoverable (a later attempt may succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_)
                | GatewayError::PoolExhausted { .. }
                | GatewayError::ConnectTimeout { .. }
                | GatewayError::SendTimeout { .. }
                | GatewayError::ReceiveTimeout { .. }
                | GatewayError::BackendUnreachable { .. }
                | GatewayError::NoRouteAvailable { .. }
        )
    }

    /// Status delivered to the caller when a request aborts with this error.
    ///
    /// These never collide with the status used for backend application
    /// errors, so callers can tell the two apart.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::MalformedRequest(_) => 400,
            GatewayError::PoolExhausted { .. } => 503,
            GatewayError::ConnectTimeout { .. }
            | GatewayError::SendTimeout { .. }
            | GatewayError::ReceiveTimeout { .. } => 504,
            GatewayError::Cancelled => 499,
            GatewayError::NoRouteAvailable { .. }
            | GatewayError::ProtocolDesync(_)
            | GatewayError::TooManyRedirects { .. }
            | GatewayError::BackendUnreachable { .. }
            | GatewayError::Network(_)
            | GatewayError::Config(_)
            | GatewayError::AddressParse(_) => 502,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            GatewayError::Config(_) => ErrorSeverity::Critical,
            GatewayError::ProtocolDesync(_) => ErrorSeverity::Error,
            GatewayError::TooManyRedirects { .. } => ErrorSeverity::Error,
            GatewayError::Network(_) => ErrorSeverity::Warning,
            GatewayError::BackendUnreachable { .. } => ErrorSeverity::Warning,
            GatewayError::ConnectTimeout { .. }
            | GatewayError::SendTimeout { .. }
            | GatewayError::ReceiveTimeout { .. } => ErrorSeverity::Warning,
            GatewayError::PoolExhausted { .. } => ErrorSeverity::Warning,
            GatewayError::NoRouteAvailable { .. } => ErrorSeverity::Warning,
            GatewayError::MalformedRequest(_) => ErrorSeverity::Info,
            GatewayError::Cancelled => ErrorSeverity::Info,
            GatewayError::AddressParse(_) => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
