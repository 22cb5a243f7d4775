use crate::board::{Board, Capabilities, PinId, ResourceKind, MAX_PINS};
use crate::error::ClaimError;
use crate::handle::HandleId;

/// Most pins a single claim can bind (SPI: MISO, MOSI, CLK, SS).
pub const MAX_CLAIM_PINS: usize = 4;

/// Pins held by one claim, in request order.
pub type PinSet = heapless::Vec<PinId, MAX_CLAIM_PINS>;

/// A pin plus the capabilities the requested function needs from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PinRequest {
    pub pin: PinId,
    pub needs: Capabilities,
}

impl PinRequest {
    pub const fn new(pin: PinId, needs: Capabilities) -> Self {
        Self { pin, needs }
    }
}

/// Exclusive ownership record binding pins to one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PinClaim {
    pub owner: HandleId,
    pub kind: ResourceKind,
    pub pins: PinSet,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    owner: HandleId,
    kind: ResourceKind,
}

/// Tracks which catalog pins are claimed, and by whom.
///
/// A pin holds at most one claim. Multi-pin claims are all-or-nothing: a
/// request either binds every pin it names or leaves the registry untouched.
pub struct PinRegistry {
    board: Board,
    // Indexed like `board.pins`.
    slots: [Option<Slot>; MAX_PINS],
}

impl PinRegistry {
    /// Every pin of `board` unclaimed.
    pub fn new(board: Board) -> Self {
        Self { board, slots: [None; MAX_PINS] }
    }

    /// The catalog this registry was built for.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Returns the capabilities of `pin` if it offers everything in `needs`.
    pub fn capability(
        &self,
        pin: PinId,
        needs: Capabilities,
    ) -> Result<Capabilities, ClaimError> {
        let spec = self.board.spec(pin).ok_or(ClaimError::UnknownPin(pin))?;
        if !spec.capabilities.contains(needs) {
            return Err(ClaimError::Unsupported {
                pin,
                missing: needs.difference(spec.capabilities),
            });
        }
        Ok(spec.capabilities)
    }

    /// Atomically claim every requested pin for `owner`.
    ///
    /// Pins currently held by a handle listed in `adopt` count as free; their
    /// claim is converted to `owner` instead of being double-claimed.
    pub fn try_claim(
        &mut self,
        requests: &[PinRequest],
        kind: ResourceKind,
        owner: HandleId,
        adopt: &[HandleId],
    ) -> Result<PinClaim, ClaimError> {
        if requests.is_empty() {
            return Err(ClaimError::InvalidParameter("no pins requested"));
        }
        if requests.len() > MAX_CLAIM_PINS {
            return Err(ClaimError::TooManyPins);
        }

        let mut indices: heapless::Vec<usize, MAX_CLAIM_PINS> =
            heapless::Vec::new();
        for (n, request) in requests.iter().enumerate() {
            if requests[..n].iter().any(|r| r.pin == request.pin) {
                return Err(ClaimError::DuplicatePin(request.pin));
            }
            self.capability(request.pin, request.needs)?;
            let index = self
                .board
                .index_of(request.pin)
                .ok_or(ClaimError::UnknownPin(request.pin))?;
            if let Some(slot) = self.slots[index] {
                if !adopt.contains(&slot.owner) {
                    return Err(ClaimError::PinBusy(request.pin));
                }
            }
            indices.push(index).map_err(|_| ClaimError::TooManyPins)?;
        }

        let mut pins = PinSet::new();
        for (index, request) in indices.iter().zip(requests) {
            self.slots[*index] = Some(Slot { owner, kind });
            // `requests.len()` was checked against the capacity above.
            let _ = pins.push(request.pin);
        }
        Ok(PinClaim { owner, kind, pins })
    }

    /// Free the pins of `claim` that it still holds. Idempotent.
    pub fn release(&mut self, claim: &PinClaim) -> usize {
        let mut freed = 0;
        for pin in &claim.pins {
            if let Some(index) = self.board.index_of(*pin) {
                if matches!(self.slots[index], Some(slot) if slot.owner == claim.owner)
                {
                    self.slots[index] = None;
                    freed += 1;
                }
            }
        }
        freed
    }

    /// Put `claim` back on its pins after a conversion was undone.
    ///
    /// The pins must be free; any that are not are left alone.
    pub fn restore(&mut self, claim: &PinClaim) -> usize {
        let mut bound = 0;
        for pin in &claim.pins {
            if let Some(index) = self.board.index_of(*pin) {
                if self.slots[index].is_none() {
                    self.slots[index] =
                        Some(Slot { owner: claim.owner, kind: claim.kind });
                    bound += 1;
                }
            }
        }
        bound
    }

    /// Free every pin held by `owner`. Idempotent.
    pub fn release_owner(&mut self, owner: HandleId) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(s) if s.owner == owner) {
                *slot = None;
                freed += 1;
            }
        }
        freed
    }

    /// Free every pin. Returns the number of pins that were claimed.
    pub fn release_all(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if slot.take().is_some() {
                freed += 1;
            }
        }
        freed
    }

    /// Current owner and kind of `pin`, if claimed.
    pub fn claim_of(&self, pin: PinId) -> Option<(HandleId, ResourceKind)> {
        let index = self.board.index_of(pin)?;
        self.slots[index].map(|slot| (slot.owner, slot.kind))
    }

    /// Number of pins currently claimed.
    pub fn claimed_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{PinSpec, ResourceLimits};

    static PINS: [PinSpec; 4] = [
        PinSpec::new(1, Capabilities::DIGITAL),
        PinSpec::new(2, Capabilities::DIGITAL.union(Capabilities::UART_RX)),
        PinSpec::new(3, Capabilities::DIGITAL.union(Capabilities::UART_TX)),
        PinSpec::new(4, Capabilities::DIGITAL_OUT),
    ];
    static BOARD: Board = Board::new(
        "test",
        &PINS,
        ResourceLimits { analog_input: 0, pwm_output: 0, uart: 1, spi: 0 },
    );

    fn uart_request() -> [PinRequest; 2] {
        [
            PinRequest::new(2, Capabilities::UART_RX),
            PinRequest::new(3, Capabilities::UART_TX),
        ]
    }

    #[test]
    fn claim_is_exclusive() {
        let mut registry = PinRegistry::new(BOARD);
        let req = [PinRequest::new(1, Capabilities::DIGITAL_OUT)];
        registry
            .try_claim(&req, ResourceKind::DigitalOutput, HandleId(1), &[])
            .unwrap();
        let err = registry
            .try_claim(&req, ResourceKind::DigitalInput, HandleId(2), &[])
            .unwrap_err();
        assert_eq!(err, ClaimError::PinBusy(1));
        assert_eq!(registry.claim_of(1), Some((HandleId(1), ResourceKind::DigitalOutput)));
    }

    #[test]
    fn failed_multi_pin_claim_leaves_nothing_behind() {
        let mut registry = PinRegistry::new(BOARD);
        registry
            .try_claim(
                &[PinRequest::new(3, Capabilities::DIGITAL_OUT)],
                ResourceKind::DigitalOutput,
                HandleId(1),
                &[],
            )
            .unwrap();

        let err = registry
            .try_claim(&uart_request(), ResourceKind::Uart, HandleId(2), &[])
            .unwrap_err();
        assert_eq!(err, ClaimError::PinBusy(3));
        assert_eq!(registry.claim_of(2), None);
        assert_eq!(registry.claimed_count(), 1);
    }

    #[test]
    fn capability_mismatch_reports_missing_bits() {
        let registry = PinRegistry::new(BOARD);
        assert_eq!(
            registry.capability(4, Capabilities::DIGITAL_IN),
            Err(ClaimError::Unsupported { pin: 4, missing: Capabilities::DIGITAL_IN })
        );
        assert_eq!(
            registry.capability(9, Capabilities::DIGITAL_IN),
            Err(ClaimError::UnknownPin(9))
        );
    }

    #[test]
    fn duplicate_pin_rejected() {
        let mut registry = PinRegistry::new(BOARD);
        let req = [
            PinRequest::new(2, Capabilities::DIGITAL_IN),
            PinRequest::new(2, Capabilities::DIGITAL_OUT),
        ];
        assert_eq!(
            registry.try_claim(&req, ResourceKind::Uart, HandleId(1), &[]),
            Err(ClaimError::DuplicatePin(2))
        );
        assert_eq!(registry.claimed_count(), 0);
    }

    #[test]
    fn adopted_pins_are_converted() {
        let mut registry = PinRegistry::new(BOARD);
        registry
            .try_claim(
                &[PinRequest::new(2, Capabilities::DIGITAL_IN)],
                ResourceKind::DigitalInput,
                HandleId(1),
                &[],
            )
            .unwrap();
        let claim = registry
            .try_claim(&uart_request(), ResourceKind::Uart, HandleId(2), &[HandleId(1)])
            .unwrap();
        assert_eq!(claim.pins.as_slice(), &[2, 3]);
        assert_eq!(registry.claim_of(2), Some((HandleId(2), ResourceKind::Uart)));
        assert_eq!(registry.release_owner(HandleId(1)), 0);
    }

    #[test]
    fn restore_rebinds_released_claim() {
        let mut registry = PinRegistry::new(BOARD);
        let input = registry
            .try_claim(
                &[PinRequest::new(2, Capabilities::DIGITAL_IN)],
                ResourceKind::DigitalInput,
                HandleId(1),
                &[],
            )
            .unwrap();
        let uart = registry
            .try_claim(&uart_request(), ResourceKind::Uart, HandleId(2), &[HandleId(1)])
            .unwrap();

        registry.release(&uart);
        assert_eq!(registry.restore(&input), 1);
        assert_eq!(registry.claim_of(2), Some((HandleId(1), ResourceKind::DigitalInput)));
        assert_eq!(registry.claim_of(3), None);
    }

    #[test]
    fn release_is_idempotent() {
        let mut registry = PinRegistry::new(BOARD);
        let claim = registry
            .try_claim(&uart_request(), ResourceKind::Uart, HandleId(7), &[])
            .unwrap();
        assert_eq!(registry.release(&claim), 2);
        assert_eq!(registry.release(&claim), 0);
        assert_eq!(registry.claimed_count(), 0);
    }
}
