//! Result codes and error types.
//!
//! [`ResultCode`] is the wire-level status carried in the arena header
//! and returned to API callers; it mirrors the compositor API's own
//! convention of zero-success / negative-error. The richer enums below
//! describe layer-internal failures and fold into `ResultCode` at the
//! API boundary.

use std::fmt;
use std::io;

/// Status code carried in the arena header and returned by every
/// compositor API operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,

    ValidationFailure = -1,
    RuntimeFailure = -2,
    OutOfMemory = -3,
    LimitReached = -4,
    SizeInsufficient = -5,
    HandleInvalid = -6,
    CallOrderInvalid = -7,
    SessionRunning = -8,
    SessionNotRunning = -9,
    SessionLost = -10,
    GraphicsDeviceInvalid = -11,
    SwapchainFormatUnsupported = -12,
    FeatureUnsupported = -13,
    TimeInvalid = -14,
    LayerInvalid = -15,
}

impl ResultCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Success,
            -1 => Self::ValidationFailure,
            -2 => Self::RuntimeFailure,
            -3 => Self::OutOfMemory,
            -4 => Self::LimitReached,
            -5 => Self::SizeInsufficient,
            -6 => Self::HandleInvalid,
            -7 => Self::CallOrderInvalid,
            -8 => Self::SessionRunning,
            -9 => Self::SessionNotRunning,
            -10 => Self::SessionLost,
            -11 => Self::GraphicsDeviceInvalid,
            -12 => Self::SwapchainFormatUnsupported,
            -13 => Self::FeatureUnsupported,
            -14 => Self::TimeInvalid,
            -15 => Self::LayerInvalid,
            _ => return None,
        })
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self as i32 >= 0
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ValidationFailure => "validation failure",
            Self::RuntimeFailure => "runtime failure",
            Self::OutOfMemory => "out of memory",
            Self::LimitReached => "limit reached",
            Self::SizeInsufficient => "size insufficient",
            Self::HandleInvalid => "handle invalid",
            Self::CallOrderInvalid => "call order invalid",
            Self::SessionRunning => "session running",
            Self::SessionNotRunning => "session not running",
            Self::SessionLost => "session lost",
            Self::GraphicsDeviceInvalid => "graphics device invalid",
            Self::SwapchainFormatUnsupported => "swapchain format unsupported",
            Self::FeatureUnsupported => "feature unsupported",
            Self::TimeInvalid => "time invalid",
            Self::LayerInvalid => "layer invalid",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Error returned by API-surface calls.
///
/// Wraps a [`ResultCode`] so callers can match on the wire-level status
/// while `Display` stays readable in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallError(pub ResultCode);

impl CallError {
    pub fn code(self) -> ResultCode {
        self.0
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compositor call failed: {}", self.0)
    }
}

impl std::error::Error for CallError {}

impl From<ResultCode> for CallError {
    fn from(code: ResultCode) -> Self {
        CallError(code)
    }
}

/// Convenience alias used across the API surface.
pub type ApiResult<T> = Result<T, CallError>;

/// Errors from the IPC arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// The bump region cannot fit the requested allocation.
    Exhausted { requested: usize, remaining: usize },
    /// The pointer fixup table is full.
    FixupTableFull,
    /// A recorded fixup offset does not lie inside the arena.
    OffsetOutOfBounds { offset: u64, size: usize },
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted {
                requested,
                remaining,
            } => write!(
                f,
                "arena exhausted: need {} bytes, {} remaining",
                requested, remaining
            ),
            Self::FixupTableFull => write!(f, "pointer fixup table full"),
            Self::OffsetOutOfBounds { offset, size } => {
                write!(f, "fixup offset {} outside arena of {} bytes", offset, size)
            }
        }
    }
}

impl std::error::Error for ArenaError {}

/// Errors from channel setup and the RPC transport.
#[derive(Debug)]
pub enum ChannelError {
    /// An OS primitive could not be created or opened.
    Os(io::Error),
    /// The peer process went away.
    PeerGone,
    /// Negotiation was refused by the main process.
    Rejected(RejectReason),
    /// No main process appeared within the connect bound.
    ConnectTimeout,
    /// The request could not be marshalled.
    Arena(ArenaError),
    /// The handshake payload could not be decoded.
    BadHandshake,
}

/// Why the negotiator refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Layer binary versions differ between the two processes.
    VersionMismatch { main: u32, overlay: u32 },
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(e) => write!(f, "channel OS error: {}", e),
            Self::PeerGone => write!(f, "peer process terminated"),
            Self::Rejected(RejectReason::VersionMismatch { main, overlay }) => write!(
                f,
                "negotiation rejected: layer version mismatch (main {:#x}, overlay {:#x})",
                main, overlay
            ),
            Self::ConnectTimeout => write!(f, "no main process within the connect bound"),
            Self::Arena(e) => write!(f, "marshalling failed: {}", e),
            Self::BadHandshake => write!(f, "handshake payload could not be decoded"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Os(e) => Some(e),
            Self::Arena(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        Self::Os(e)
    }
}

impl From<ArenaError> for ChannelError {
    fn from(e: ArenaError) -> Self {
        Self::Arena(e)
    }
}

impl From<ChannelError> for CallError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Rejected(_) | ChannelError::ConnectTimeout => {
                CallError(ResultCode::RuntimeFailure)
            }
            ChannelError::PeerGone => CallError(ResultCode::RuntimeFailure),
            _ => CallError(ResultCode::RuntimeFailure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_roundtrip() {
        let codes = [
            ResultCode::Success,
            ResultCode::RuntimeFailure,
            ResultCode::SizeInsufficient,
            ResultCode::HandleInvalid,
            ResultCode::CallOrderInvalid,
            ResultCode::LayerInvalid,
        ];
        for &code in &codes {
            assert_eq!(ResultCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ResultCode::from_i32(-9999), None);
    }

    #[test]
    fn only_success_is_success() {
        assert!(ResultCode::Success.is_success());
        assert!(!ResultCode::HandleInvalid.is_success());
    }

    #[test]
    fn channel_error_folds_to_runtime_failure() {
        let e: CallError = ChannelError::PeerGone.into();
        assert_eq!(e.code(), ResultCode::RuntimeFailure);
    }
}
