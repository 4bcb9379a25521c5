use thiserror::Error;

/// Numeric status words carried in the status field of a Response.
pub mod status {
    pub const OK: u32 = 0x0000_0000;
    pub const FORMAT_ERROR: u32 = 0xE000_0001;
    pub const COMMAND_NOT_SUPPORTED: u32 = 0xE000_0002;
    pub const INTERNAL_ERROR: u32 = 0xE000_0003;
    pub const RESOURCE_NOT_FOUND: u32 = 0xE000_0004;
    pub const RESOURCE_DISCONNECTED: u32 = 0xE000_0005;
    pub const LIMIT_EXCEEDED: u32 = 0xE000_0006;
    pub const AUTH_FAILED: u32 = 0xE000_0007;
    pub const PERMISSION_DENIED: u32 = 0xE000_0008;
}

/// Errors produced by the revrpc protocol layer.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("format error: {0}")]
    Format(String),

    #[error("command not supported: {0:#010x}")]
    CommandNotSupported(u32),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource disconnected: {0}")]
    ResourceDisconnected(String),

    #[error("limit exceeded: {len} bytes (limit {limit})")]
    LimitExceeded { len: u64, limit: u64 },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connect to {addr} failed after {attempts} attempt(s)")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("channel closed")]
    ChannelClosed,

    #[error("timeout")]
    Timeout,

    /// Error status received from a peer that has no local variant.
    #[error("remote error {status:#010x}: {message}")]
    Remote { status: u32, message: String },

    #[error("{location}: {source}")]
    Located {
        location: &'static str,
        #[source]
        source: Box<RpcError>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RpcResult<T> = Result<T, RpcError>;

impl RpcError {
    /// Wrap this error with a location hint. The status is preserved.
    pub fn at(self, location: &'static str) -> Self {
        RpcError::Located {
            location,
            source: Box::new(self),
        }
    }

    /// Location hint, if one was attached with [`RpcError::at`].
    pub fn location(&self) -> Option<&'static str> {
        match self {
            RpcError::Located { location, .. } => Some(location),
            _ => None,
        }
    }

    /// Innermost error, skipping location wrappers.
    pub fn kind(&self) -> &RpcError {
        match self {
            RpcError::Located { source, .. } => source.kind(),
            other => other,
        }
    }

    /// Status word this error is reported with on the wire.
    pub fn status(&self) -> u32 {
        match self {
            RpcError::Format(_) => status::FORMAT_ERROR,
            RpcError::CommandNotSupported(_) => status::COMMAND_NOT_SUPPORTED,
            RpcError::ResourceNotFound(_) => status::RESOURCE_NOT_FOUND,
            RpcError::ResourceDisconnected(_) => status::RESOURCE_DISCONNECTED,
            RpcError::LimitExceeded { .. } => status::LIMIT_EXCEEDED,
            RpcError::AuthFailed(_) => status::AUTH_FAILED,
            RpcError::PermissionDenied(_) => status::PERMISSION_DENIED,
            RpcError::Remote { status, .. } => *status,
            RpcError::Located { source, .. } => source.status(),
            RpcError::Internal(_)
            | RpcError::Protocol(_)
            | RpcError::Connect { .. }
            | RpcError::ChannelClosed
            | RpcError::Timeout
            | RpcError::Io(_) => status::INTERNAL_ERROR,
        }
    }

    /// Message body sent in an error Response.
    pub fn wire_message(&self) -> String {
        match self.kind() {
            RpcError::Format(m)
            | RpcError::Internal(m)
            | RpcError::ResourceNotFound(m)
            | RpcError::ResourceDisconnected(m)
            | RpcError::AuthFailed(m)
            | RpcError::PermissionDenied(m)
            | RpcError::Protocol(m) => m.clone(),
            RpcError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a non-OK Response.
    pub fn from_status(code: u32, data: &[u8]) -> Self {
        let message = String::from_utf8_lossy(data).into_owned();
        match code {
            status::FORMAT_ERROR => RpcError::Format(message),
            status::COMMAND_NOT_SUPPORTED => {
                RpcError::CommandNotSupported(parse_code(&message).unwrap_or(0))
            }
            status::INTERNAL_ERROR => RpcError::Internal(message),
            status::RESOURCE_NOT_FOUND => RpcError::ResourceNotFound(message),
            status::RESOURCE_DISCONNECTED => RpcError::ResourceDisconnected(message),
            status::LIMIT_EXCEEDED => {
                let (len, limit) = parse_limit(&message).unwrap_or((0, 0));
                RpcError::LimitExceeded { len, limit }
            }
            status::AUTH_FAILED => RpcError::AuthFailed(message),
            status::PERMISSION_DENIED => RpcError::PermissionDenied(message),
            status => RpcError::Remote { status, message },
        }
    }
}

/// Parses the code out of a "command not supported: 0x..." message.
fn parse_code(message: &str) -> Option<u32> {
    let hex = message.rsplit("0x").next()?;
    u32::from_str_radix(hex.trim(), 16).ok()
}

/// Parses "limit exceeded: N bytes (limit M)".
fn parse_limit(message: &str) -> Option<(u64, u64)> {
    let rest = message.strip_prefix("limit exceeded: ")?;
    let (len, rest) = rest.split_once(" bytes (limit ")?;
    let limit = rest.strip_suffix(')')?;
    Some((len.parse().ok()?, limit.parse().ok()?))
}
