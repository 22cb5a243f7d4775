use bitflags::bitflags;

/// Board-defined pin number, as printed on the board.
pub type PinId = u8;

/// Largest pin catalog a [`Board`] may describe.
pub const MAX_PINS: usize = 64;

bitflags! {
    /// Functions a physical pin can be assigned to.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const DIGITAL_IN  = 0b0000_0001;
        const DIGITAL_OUT = 0b0000_0010;
        const ANALOG_IN   = 0b0000_0100;
        const PWM_OUT     = 0b0000_1000;
        const UART_RX     = 0b0001_0000;
        const UART_TX     = 0b0010_0000;
        const SPI         = 0b0100_0000;

        const DIGITAL = Self::DIGITAL_IN.bits() | Self::DIGITAL_OUT.bits();
        /// Remappable peripheral pin (PWM, UART and SPI).
        const PERIPHERAL = Self::PWM_OUT.bits()
            | Self::UART_RX.bits()
            | Self::UART_TX.bits()
            | Self::SPI.bits();
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Capabilities {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Capabilities({=u8:b})", self.bits())
    }
}

/// Kind of resource a handle represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceKind {
    DigitalInput,
    DigitalOutput,
    AnalogInput,
    PwmOutput,
    Uart,
    Spi,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::DigitalInput,
        ResourceKind::DigitalOutput,
        ResourceKind::AnalogInput,
        ResourceKind::PwmOutput,
        ResourceKind::Uart,
        ResourceKind::Spi,
    ];
}

/// One entry of a board's fixed pin catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinSpec {
    pub id: PinId,
    pub capabilities: Capabilities,
}

impl PinSpec {
    pub const fn new(id: PinId, capabilities: Capabilities) -> Self {
        Self { id, capabilities }
    }
}

/// Maximum number of concurrently open resources per kind.
///
/// These are hardware module counts (timers, UART/SPI modules, ADC channels)
/// and apply independently of pin availability. Digital I/O is bounded only
/// by the pins themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResourceLimits {
    pub analog_input: u8,
    pub pwm_output: u8,
    pub uart: u8,
    pub spi: u8,
}

impl ResourceLimits {
    /// Returns the limit for `kind`, or `None` when only pins bound it.
    pub fn limit(&self, kind: ResourceKind) -> Option<usize> {
        match kind {
            ResourceKind::DigitalInput | ResourceKind::DigitalOutput => None,
            ResourceKind::AnalogInput => Some(self.analog_input as usize),
            ResourceKind::PwmOutput => Some(self.pwm_output as usize),
            ResourceKind::Uart => Some(self.uart as usize),
            ResourceKind::Spi => Some(self.spi as usize),
        }
    }
}

/// Static description of a board: its pin catalog and module limits.
#[derive(Debug, Clone, Copy)]
pub struct Board {
    pub name: &'static str,
    pub pins: &'static [PinSpec],
    pub limits: ResourceLimits,
}

impl Board {
    /// Describe a board.
    ///
    /// Panics (at compile time when used in a `const`/`static`) if the
    /// catalog holds more than [`MAX_PINS`] entries or repeats a pin id.
    pub const fn new(
        name: &'static str,
        pins: &'static [PinSpec],
        limits: ResourceLimits,
    ) -> Self {
        assert!(pins.len() <= MAX_PINS, "pin catalog too large");
        let mut i = 0;
        while i < pins.len() {
            let mut j = i + 1;
            while j < pins.len() {
                assert!(pins[i].id != pins[j].id, "duplicate pin id");
                j += 1;
            }
            i += 1;
        }
        Self { name, pins, limits }
    }

    /// Catalog entry for `pin`.
    pub fn spec(&self, pin: PinId) -> Option<&PinSpec> {
        self.pins.iter().find(|spec| spec.id == pin)
    }

    pub(crate) fn index_of(&self, pin: PinId) -> Option<usize> {
        self.pins.iter().position(|spec| spec.id == pin)
    }
}

// IOIO V1: pin 0 drives the on-board stat LED, pins 1-48 are headers.
const IOIO_V1_PIN_COUNT: usize = 49;

const fn ioio_v1_capabilities(pin: PinId) -> Capabilities {
    if pin == 0 {
        return Capabilities::DIGITAL_OUT;
    }
    let mut caps = Capabilities::DIGITAL;
    if pin >= 31 && pin <= 46 {
        caps = caps.union(Capabilities::ANALOG_IN);
    }
    if matches!(pin, 3..=7 | 10..=14 | 27..=32 | 34..=40 | 45..=48) {
        caps = caps.union(Capabilities::PERIPHERAL);
    }
    caps
}

static IOIO_V1_PINS: [PinSpec; IOIO_V1_PIN_COUNT] = {
    let mut pins =
        [PinSpec::new(0, Capabilities::empty()); IOIO_V1_PIN_COUNT];
    let mut i = 0;
    while i < IOIO_V1_PIN_COUNT {
        pins[i] = PinSpec::new(i as PinId, ioio_v1_capabilities(i as PinId));
        i += 1;
    }
    pins
};

/// Pin catalog and module limits of the IOIO V1 board.
pub static IOIO_V1: Board = Board::new(
    "IOIO-V1",
    &IOIO_V1_PINS,
    ResourceLimits { analog_input: 16, pwm_output: 9, uart: 4, spi: 3 },
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioio_v1_catalog() {
        assert_eq!(IOIO_V1.pins.len(), 49);
        assert_eq!(IOIO_V1.spec(0).unwrap().capabilities, Capabilities::DIGITAL_OUT);
        assert!(IOIO_V1.spec(31).unwrap().capabilities.contains(
            Capabilities::ANALOG_IN | Capabilities::PWM_OUT
        ));
        assert!(!IOIO_V1.spec(1).unwrap().capabilities.intersects(Capabilities::PERIPHERAL));
        assert!(IOIO_V1.spec(49).is_none());
    }

    #[test]
    fn digital_kinds_are_unbounded() {
        let limits = IOIO_V1.limits;
        assert_eq!(limits.limit(ResourceKind::DigitalInput), None);
        assert_eq!(limits.limit(ResourceKind::PwmOutput), Some(9));
        assert_eq!(limits.limit(ResourceKind::Spi), Some(3));
    }
}
