use std::fmt;
use std::io;

/// Why a pool could not hand out a stream.
///
/// NOTE: `Overflow` is an admission failure and leaves the upstream host
/// untouched; `ConnectionFailure` means a connect attempt was made and lost.
#[derive(strum::Display, strum::EnumString, strum::AsRefStr, PartialEq, Clone, Copy, thiserror::Error)]
pub enum PoolFailureReason {
    #[strum(serialize = "pool_overflow")]
    Overflow,
    #[strum(serialize = "pool_connection_failure")]
    ConnectionFailure,
}

impl fmt::Debug for PoolFailureReason {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Why a stream was torn down before normal completion.
///
/// The connection-scoped reasons (`StreamConnectionTermination`,
/// `StreamConnectionFailed`) are reported for every in-flight stream when the
/// underlying connection dies; they are never delivered through per-stream
/// event listeners, only through the codec-client bookkeeping path.
#[derive(
    strum::Display, strum::EnumString, strum::AsRefStr, PartialEq, Clone, Copy, thiserror::Error,
)]
pub enum StreamResetReason {
    #[strum(serialize = "stream_local_reset")]
    StreamLocalReset,
    #[strum(serialize = "stream_remote_reset")]
    StreamRemoteReset,
    #[strum(serialize = "stream_connection_termination")]
    StreamConnectionTermination,
    #[strum(serialize = "stream_connection_failed")]
    StreamConnectionFailed,
}

impl StreamResetReason {
    /// True for reasons that describe the whole connection rather than one
    /// stream.
    #[inline]
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, Self::StreamConnectionTermination | Self::StreamConnectionFailed)
    }
}

impl fmt::Debug for StreamResetReason {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Crate-internal fallible operations.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("connection closed")]
    ConnClosed,
    #[error("encode: {0}")]
    Encode(&'static str),
    #[error("decode: {0}")]
    Decode(&'static str),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}
