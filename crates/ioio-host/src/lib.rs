//! Host side of the IOIO link: a TCP [`Transport`](ioio_core::Transport),
//! the framed wire protocol and an in-process board simulator.

pub mod clients;
pub mod protocol;
pub mod sim;

pub use clients::*;
pub use ioio_core as core;
pub use sim::{SimHandle, Simulator};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

/// Controller over TCP, shareable between tokio tasks.
pub type TcpController =
    ioio_core::PeripheralController<CriticalSectionRawMutex, TcpTransport>;
