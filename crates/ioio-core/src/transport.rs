use crate::board::PinId;
use crate::registry::PinSet;

/// Identification strings reported by the board during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    pub hardware: heapless::String<16>,
    pub bootloader: heapless::String<16>,
    pub firmware: heapless::String<16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResetKind {
    /// Return every pin to tri-state, keep the link.
    Soft,
    /// Power-cycle the board; the link goes down.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DigitalInputMode {
    #[default]
    Floating,
    PullUp,
    PullDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DigitalOutputMode {
    /// Push-pull.
    #[default]
    Normal,
    /// Logic high leaves the pin floating; needs an external pull-up.
    OpenDrain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UartConfig {
    pub baud: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl UartConfig {
    pub const fn new(baud: u32, parity: Parity, stop_bits: StopBits) -> Self {
        Self { baud, parity, stop_bits }
    }
}

impl Default for UartConfig {
    fn default() -> Self {
        Self::new(9600, Parity::None, StopBits::One)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpiConfig {
    pub rate_hz: u32,
    pub invert_clock: bool,
    pub sample_on_trailing: bool,
}

impl SpiConfig {
    pub const fn new(rate_hz: u32) -> Self {
        Self { rate_hz, invert_clock: false, sample_on_trailing: false }
    }
}

/// Pin configuration the transport applies on the board.
///
/// Open commands are sent right after a claim succeeds; `Release` returns
/// the pins of a closed handle to tri-state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PinCommand {
    DigitalInput { pin: PinId, mode: DigitalInputMode },
    /// Value and drive mode are applied together.
    DigitalOutput { pin: PinId, value: bool, mode: DigitalOutputMode },
    AnalogInput { pin: PinId },
    PwmOutput { pin: PinId, freq_hz: u32, open_drain: bool },
    Uart { rx: PinId, tx: PinId, config: UartConfig },
    Spi { miso: PinId, mosi: PinId, clk: PinId, select: PinId, config: SpiConfig },
    Release { pins: PinSet },
}

/// Link to the board.
///
/// The controller serializes all calls. `disconnect` must be idempotent.
/// Loss detected outside a call is reported through
/// [`PeripheralController::connection_lost`](crate::PeripheralController::connection_lost).
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Error: core::fmt::Debug;

    /// Open the link and perform the handshake.
    ///
    /// The returned future may be dropped at any await point when the
    /// attempt is aborted.
    async fn connect(&mut self) -> Result<DeviceInfo, Self::Error>;

    /// Whether the link is still up. Checked after a failed call to tell a
    /// refused request from a dropped link.
    fn is_alive(&self) -> bool;

    async fn disconnect(&mut self);

    async fn reset(&mut self, kind: ResetKind) -> Result<(), Self::Error>;

    /// Apply `command` on the board. An error with the link still alive
    /// means the board refused the command.
    async fn configure(&mut self, command: &PinCommand) -> Result<(), Self::Error>;
}
