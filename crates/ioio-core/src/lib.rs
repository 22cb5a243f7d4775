#![cfg_attr(not(test), no_std)]
//! Host-side control plane for an IOIO-style expansion board.
//!
//! A [`PeripheralController`] owns one transport link to the board and hands
//! out exclusive peripheral handles bound to physical pins. Every handle is
//! tagged with the connection epoch it was issued under; leaving the
//! connected state (disconnect, reset, or link loss) invalidates all of them
//! and releases their pins in one step.

mod allocator;
mod board;
mod connection;
mod controller;
mod error;
mod handle;
mod registry;
mod transport;

pub use allocator::{HandleRequest, PinSource, Reservation, ResourceAllocator};
pub use board::{
    Board, Capabilities, PinId, PinSpec, ResourceKind, ResourceLimits,
    IOIO_V1, MAX_PINS,
};
pub use connection::{ConnectionState, ConnectionStateMachine, Epoch};
pub use controller::PeripheralController;
pub use error::{ClaimError, ControllerError, OpenError};
pub use handle::{
    AnalogInput, DigitalInput, DigitalOutput, HandleId, Peripheral,
    PwmOutput, ResourceHandle, Spi, Uart,
};
pub use registry::{PinClaim, PinRegistry, PinRequest, PinSet, MAX_CLAIM_PINS};
pub use transport::{
    DeviceInfo, DigitalInputMode, DigitalOutputMode, Parity, PinCommand,
    ResetKind, SpiConfig, StopBits, Transport, UartConfig,
};
