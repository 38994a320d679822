//! Error types for the shim core.

use thiserror::Error;

use crate::stack::TcpState;
use crate::wire::WireError;

/// Errors surfaced by the shim core.
///
/// RPC handlers that the protocol says must not reply on failure log these
/// and drop the request; the interceptor observes a read timeout.
#[derive(Debug, Error)]
pub enum ShimError {
    /// The embedded stack could not allocate a PCB or buffer chain.
    #[error("stack allocation failed: {0}")]
    AllocFailure(&'static str),

    /// A PCB was in the wrong state for the requested operation.
    #[error("bad PCB state for {op}: {state:?}")]
    BadState {
        op: &'static str,
        state: TcpState,
    },

    /// No connection matches the supplied descriptor or PCB.
    #[error("no connection for {0}")]
    NotFound(&'static str),

    /// Short read or truncated RPC message.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Local socket I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Negative return from a stack call.
    #[error("stack error {0}")]
    Stack(i32),
}

impl From<nix::Error> for ShimError {
    fn from(e: nix::Error) -> Self {
        ShimError::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}
