use core::fmt;
use core::ops::Deref;

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::board::{PinId, ResourceKind};
use crate::connection::Epoch;
use crate::controller::PeripheralController;
use crate::error::ControllerError;
use crate::registry::PinSet;
use crate::transport::{
    DigitalInputMode, DigitalOutputMode, SpiConfig, Transport, UartConfig,
};

/// Opaque identity of an issued handle. Never reused by one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HandleId(pub(crate) u32);

impl HandleId {
    pub fn get(self) -> u32 {
        self.0
    }
}

/// Record of one issued resource: identity, kind, pins and issuing epoch.
///
/// Liveness is not stored here. The allocator may kill a handle the caller
/// still holds, so ask the controller (or the typed wrapper) instead.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResourceHandle {
    id: HandleId,
    kind: ResourceKind,
    pins: PinSet,
    epoch: Epoch,
}

impl ResourceHandle {
    pub(crate) fn new(
        id: HandleId,
        kind: ResourceKind,
        pins: PinSet,
        epoch: Epoch,
    ) -> Self {
        Self { id, kind, pins, epoch }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Function the pins were opened for.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Claimed pins, in the order the open call named them.
    pub fn pins(&self) -> &[PinId] {
        &self.pins
    }

    /// Session the handle was issued in.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}

/// A [`ResourceHandle`] bound to the controller that issued it.
///
/// Dropping a peripheral does **not** release its pins; call
/// [`close`](Self::close), or let the next disconnect/reset reclaim them.
pub struct Peripheral<'a, M: RawMutex, T: Transport> {
    controller: &'a PeripheralController<M, T>,
    handle: ResourceHandle,
}

impl<'a, M: RawMutex, T: Transport> Peripheral<'a, M, T> {
    pub(crate) fn new(
        controller: &'a PeripheralController<M, T>,
        handle: ResourceHandle,
    ) -> Self {
        Self { controller, handle }
    }

    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    pub fn pins(&self) -> &[PinId] {
        self.handle.pins()
    }

    pub fn is_live(&self) -> bool {
        self.controller.is_live(&self.handle)
    }

    /// Gate for every codec operation on this peripheral.
    pub fn ensure_live(&self) -> Result<(), ControllerError<T::Error>> {
        if self.is_live() {
            Ok(())
        } else {
            Err(ControllerError::ConnectionLost)
        }
    }

    /// Release the pins and return them to tri-state. Idempotent; a no-op
    /// on a handle that was already invalidated.
    pub async fn close(&self) {
        self.controller.close(&self.handle).await
    }

    pub(crate) fn is_issued_by(
        &self,
        controller: &PeripheralController<M, T>,
    ) -> bool {
        core::ptr::eq(self.controller, controller)
    }
}

impl<M: RawMutex, T: Transport> fmt::Debug for Peripheral<'_, M, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral").field("handle", &self.handle).finish()
    }
}

macro_rules! typed_peripheral {
    ($(#[$meta:meta])* $name:ident { $($field:ident: $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        pub struct $name<'a, M: RawMutex, T: Transport> {
            peripheral: Peripheral<'a, M, T>,
            $($field: $ty,)*
        }

        impl<'a, M: RawMutex, T: Transport> $name<'a, M, T> {
            pub(crate) fn new(
                peripheral: Peripheral<'a, M, T>,
                $($field: $ty,)*
            ) -> Self {
                Self { peripheral, $($field,)* }
            }
        }

        impl<'a, M: RawMutex, T: Transport> Deref for $name<'a, M, T> {
            type Target = Peripheral<'a, M, T>;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.peripheral
            }
        }

        impl<M: RawMutex, T: Transport> fmt::Debug for $name<'_, M, T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("handle", self.peripheral.handle())
                    $(.field(stringify!($field), &self.$field))*
                    .finish()
            }
        }
    };
}

typed_peripheral!(
    /// Pin sampled as a logic level.
    DigitalInput { mode: DigitalInputMode }
);
typed_peripheral!(
    /// Pin driven to a logic level.
    DigitalOutput { mode: DigitalOutputMode, initial_value: bool }
);
typed_peripheral!(
    /// Pin sampled by the ADC.
    AnalogInput {}
);
typed_peripheral!(
    /// Pin driven by a PWM timer.
    PwmOutput { freq_hz: u32, open_drain: bool }
);
typed_peripheral!(
    /// UART module on an RX/TX pin pair.
    Uart { config: UartConfig }
);
typed_peripheral!(
    /// SPI master on MISO, MOSI, CLK and one slave-select pin.
    Spi { config: SpiConfig }
);

impl<M: RawMutex, T: Transport> DigitalInput<'_, M, T> {
    pub fn pin(&self) -> PinId {
        self.pins()[0]
    }

    pub fn mode(&self) -> DigitalInputMode {
        self.mode
    }
}

impl<M: RawMutex, T: Transport> DigitalOutput<'_, M, T> {
    pub fn pin(&self) -> PinId {
        self.pins()[0]
    }

    pub fn mode(&self) -> DigitalOutputMode {
        self.mode
    }

    pub fn initial_value(&self) -> bool {
        self.initial_value
    }
}

impl<M: RawMutex, T: Transport> AnalogInput<'_, M, T> {
    pub fn pin(&self) -> PinId {
        self.pins()[0]
    }
}

impl<M: RawMutex, T: Transport> PwmOutput<'_, M, T> {
    pub fn pin(&self) -> PinId {
        self.pins()[0]
    }

    pub fn freq_hz(&self) -> u32 {
        self.freq_hz
    }

    pub fn open_drain(&self) -> bool {
        self.open_drain
    }
}

impl<M: RawMutex, T: Transport> Uart<'_, M, T> {
    pub fn rx(&self) -> PinId {
        self.pins()[0]
    }

    pub fn tx(&self) -> PinId {
        self.pins()[1]
    }

    pub fn config(&self) -> UartConfig {
        self.config
    }
}

impl<M: RawMutex, T: Transport> Spi<'_, M, T> {
    pub fn miso(&self) -> PinId {
        self.pins()[0]
    }

    pub fn mosi(&self) -> PinId {
        self.pins()[1]
    }

    pub fn clk(&self) -> PinId {
        self.pins()[2]
    }

    pub fn select(&self) -> PinId {
        self.pins()[3]
    }

    pub fn config(&self) -> SpiConfig {
        self.config
    }
}
