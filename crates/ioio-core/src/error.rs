use core::fmt;

use crate::board::{Capabilities, PinId, ResourceKind};
use crate::handle::HandleId;

/// Why a pin request was refused.
///
/// Every variant surfaces to callers as
/// [`ControllerError::InvalidOperation`]; it is a caller error and retrying
/// the same request will fail the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClaimError {
    /// The pin is not part of the board catalog.
    UnknownPin(PinId),
    /// The pin lacks `missing` for the requested function.
    Unsupported { pin: PinId, missing: Capabilities },
    /// The pin is claimed by another live handle.
    PinBusy(PinId),
    /// The same pin was named twice in one request.
    DuplicatePin(PinId),
    /// A source handle is not of a kind that may be converted.
    WrongKind { handle: HandleId, kind: ResourceKind },
    /// More pins than a single claim can hold.
    TooManyPins,
    /// A construction parameter is out of range.
    InvalidParameter(&'static str),
    /// The board refused to set up a resource of this kind.
    Rejected(ResourceKind),
}

impl fmt::Display for ClaimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimError::UnknownPin(pin) => write!(f, "unknown pin {pin}"),
            ClaimError::Unsupported { pin, missing } => {
                write!(f, "pin {pin} does not support {missing:?}")
            }
            ClaimError::PinBusy(pin) => write!(f, "pin {pin} is already in use"),
            ClaimError::DuplicatePin(pin) => {
                write!(f, "pin {pin} requested more than once")
            }
            ClaimError::WrongKind { handle, kind } => {
                write!(f, "handle {handle:?} is a {kind:?} and cannot be converted")
            }
            ClaimError::TooManyPins => f.write_str("too many pins in one claim"),
            ClaimError::InvalidParameter(what) => {
                write!(f, "invalid parameter: {what}")
            }
            ClaimError::Rejected(kind) => {
                write!(f, "board refused to set up {kind:?}")
            }
        }
    }
}

/// Allocator-level open failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpenError {
    /// There is no connected epoch to issue the handle under.
    NotConnected,
    Invalid(ClaimError),
    /// The per-kind module limit is exhausted.
    OutOfResource(ResourceKind),
    /// A source handle is dead or belongs to an earlier epoch.
    StaleHandle(HandleId),
}

impl From<ClaimError> for OpenError {
    fn from(value: ClaimError) -> Self {
        Self::Invalid(value)
    }
}

/// Errors surfaced by [`PeripheralController`](crate::PeripheralController).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerError<E: fmt::Debug> {
    /// The operation needs a live connection (or a live handle) and there
    /// is none. Recoverable by reconnecting.
    ConnectionLost,
    /// A pending `wait_for_connect` was cancelled.
    OperationAborted,
    /// Unsupported pin/capability/mode combination.
    InvalidOperation(ClaimError),
    /// The module limit for this kind is exhausted; close one first.
    OutOfResource(ResourceKind),
    /// The transport failed to establish the link.
    Transport(E),
}

impl<E: fmt::Debug> From<ClaimError> for ControllerError<E> {
    fn from(value: ClaimError) -> Self {
        Self::InvalidOperation(value)
    }
}

impl<E: fmt::Debug> From<OpenError> for ControllerError<E> {
    fn from(value: OpenError) -> Self {
        match value {
            OpenError::NotConnected => Self::ConnectionLost,
            OpenError::Invalid(err) => Self::InvalidOperation(err),
            OpenError::OutOfResource(kind) => Self::OutOfResource(kind),
            OpenError::StaleHandle(_) => Self::ConnectionLost,
        }
    }
}

impl<E: fmt::Debug> fmt::Display for ControllerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConnectionLost => f.write_str("connection lost"),
            ControllerError::OperationAborted => f.write_str("operation aborted"),
            ControllerError::InvalidOperation(err) => {
                write!(f, "invalid operation: {err}")
            }
            ControllerError::OutOfResource(kind) => {
                write!(f, "no free {kind:?} module")
            }
            ControllerError::Transport(err) => write!(f, "transport error: {err:?}"),
        }
    }
}

impl<E: fmt::Debug> core::error::Error for ControllerError<E> {}
