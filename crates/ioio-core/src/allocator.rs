use crate::board::{Board, Capabilities, ResourceKind, ResourceLimits, MAX_PINS};
use crate::connection::Epoch;
use crate::error::{ClaimError, OpenError};
use crate::handle::{HandleId, ResourceHandle};
use crate::registry::{PinClaim, PinRegistry, PinRequest, MAX_CLAIM_PINS};

/// An already-open handle offered as the pin source of a new resource.
#[derive(Debug, Clone, Copy)]
pub struct HandleRequest<'h> {
    pub handle: &'h ResourceHandle,
    /// Kind the source handle must have.
    pub expected: ResourceKind,
    /// Capabilities the new function needs from the handle's pins.
    pub needs: Capabilities,
}

/// Where the pins of a new resource come from.
#[derive(Debug, Clone, Copy)]
pub enum PinSource<'a> {
    /// Fresh pins, named by id.
    Pins(&'a [PinRequest]),
    /// Pins already held by live handles; their claims are converted.
    Handles(&'a [HandleRequest<'a>]),
}

#[derive(Debug, Clone)]
struct Lease {
    claim: PinClaim,
    epoch: Epoch,
}

/// A handle opened by [`ResourceAllocator::reserve`], together with the
/// leases of the source handles it converted.
#[derive(Debug)]
pub struct Reservation {
    handle: ResourceHandle,
    displaced: heapless::Vec<Lease, MAX_CLAIM_PINS>,
}

impl Reservation {
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    /// Keep the handle; the converted sources stay dead.
    pub fn commit(self) -> ResourceHandle {
        self.handle
    }
}

/// Per-kind capacity accounting and live-handle bookkeeping over a
/// [`PinRegistry`].
pub struct ResourceAllocator {
    registry: PinRegistry,
    limits: ResourceLimits,
    // Every lease holds at least one pin, so this can never overflow.
    leases: heapless::Vec<Lease, MAX_PINS>,
    next_id: u32,
}

impl ResourceAllocator {
    /// Nothing open, limits taken from `board`.
    pub fn new(board: Board) -> Self {
        Self {
            registry: PinRegistry::new(board),
            limits: board.limits,
            leases: heapless::Vec::new(),
            next_id: 0,
        }
    }

    /// Read-only view of the pin claims.
    pub fn registry(&self) -> &PinRegistry {
        &self.registry
    }

    /// Open a resource of `kind` under the connected epoch `current`.
    ///
    /// Fails with `NotConnected` when `current` is `None`, `StaleHandle` when
    /// a source handle is dead, `OutOfResource` when the module limit for
    /// `kind` is reached, and `Invalid` when the registry refuses the pins.
    /// On failure nothing is claimed and no source handle is consumed.
    pub fn open(
        &mut self,
        current: Option<Epoch>,
        source: PinSource<'_>,
        kind: ResourceKind,
    ) -> Result<ResourceHandle, OpenError> {
        self.reserve(current, source, kind).map(Reservation::commit)
    }

    /// Like [`open`](Self::open), but the result can still be undone with
    /// [`cancel`](Self::cancel) while the board has not confirmed it.
    pub fn reserve(
        &mut self,
        current: Option<Epoch>,
        source: PinSource<'_>,
        kind: ResourceKind,
    ) -> Result<Reservation, OpenError> {
        let epoch = current.ok_or(OpenError::NotConnected)?;

        let mut requests: heapless::Vec<PinRequest, MAX_CLAIM_PINS> =
            heapless::Vec::new();
        let mut adopt: heapless::Vec<HandleId, MAX_CLAIM_PINS> =
            heapless::Vec::new();
        match source {
            PinSource::Pins(pins) => {
                requests
                    .extend_from_slice(pins)
                    .map_err(|_| ClaimError::TooManyPins)?;
            }
            PinSource::Handles(handles) => {
                for request in handles {
                    let handle = request.handle;
                    if !self.is_live(handle, current) {
                        return Err(OpenError::StaleHandle(handle.id()));
                    }
                    if handle.kind() != request.expected {
                        return Err(ClaimError::WrongKind {
                            handle: handle.id(),
                            kind: handle.kind(),
                        }
                        .into());
                    }
                    for pin in handle.pins() {
                        requests
                            .push(PinRequest::new(*pin, request.needs))
                            .map_err(|_| ClaimError::TooManyPins)?;
                    }
                    adopt
                        .push(handle.id())
                        .map_err(|_| ClaimError::TooManyPins)?;
                }
            }
        }

        if let Some(limit) = self.limits.limit(kind) {
            let converted = self
                .leases
                .iter()
                .filter(|l| l.claim.kind == kind && adopt.contains(&l.claim.owner))
                .count();
            if self.live_count(kind) - converted >= limit {
                return Err(OpenError::OutOfResource(kind));
            }
        }

        let id = self.next_handle_id();
        let claim = self.registry.try_claim(&requests, kind, id, &adopt)?;
        let mut displaced: heapless::Vec<Lease, MAX_CLAIM_PINS> =
            heapless::Vec::new();
        for adopted in &adopt {
            if let Some(index) =
                self.leases.iter().position(|l| l.claim.owner == *adopted)
            {
                // At most one lease per adopted id, and `adopt` fits.
                let _ = displaced.push(self.leases.swap_remove(index));
            }
            self.registry.release_owner(*adopted);
        }
        let handle = ResourceHandle::new(id, kind, claim.pins.clone(), epoch);
        if let Err(lease) = self.leases.push(Lease { claim, epoch }) {
            self.registry.release(&lease.claim);
            self.reinstate(displaced);
            return Err(OpenError::OutOfResource(kind));
        }

        tracing::debug!(
            "claimed pins {:?} for {:?} handle {:?} in epoch {:?}",
            handle.pins(),
            kind,
            id,
            epoch
        );
        Ok(Reservation { handle, displaced })
    }

    /// Undo a [`reserve`](Self::reserve): release the new handle's pins and
    /// give any converted source handles their pins back.
    ///
    /// Does nothing when the new handle was invalidated in the meantime;
    /// the sources died with it.
    pub fn cancel(&mut self, reservation: Reservation) {
        if self.close(&reservation.handle).is_none() {
            return;
        }
        tracing::debug!(
            "undid {:?} handle {:?}",
            reservation.handle.kind(),
            reservation.handle.id()
        );
        self.reinstate(reservation.displaced);
    }

    fn reinstate(&mut self, displaced: heapless::Vec<Lease, MAX_CLAIM_PINS>) {
        for lease in displaced {
            self.registry.restore(&lease.claim);
            // Every lease holds a distinct pin, so this fits.
            let _ = self.leases.push(lease);
        }
    }

    /// Kill `handle` and release its pins.
    ///
    /// Returns the released claim, or `None` when the handle was already
    /// closed, converted or invalidated.
    pub fn close(&mut self, handle: &ResourceHandle) -> Option<PinClaim> {
        let index = self
            .leases
            .iter()
            .position(|l| l.claim.owner == handle.id())?;
        let lease = self.leases.swap_remove(index);
        self.registry.release(&lease.claim);
        Some(lease.claim)
    }

    /// Kill every live handle and release every pin.
    pub fn invalidate_all(&mut self) -> usize {
        let killed = self.leases.len();
        self.leases.clear();
        let freed = self.registry.release_all();
        if killed > 0 {
            tracing::debug!("invalidated {} handles ({} pins)", killed, freed);
        }
        killed
    }

    /// A handle is live iff it was issued under the connected epoch
    /// `current` and has not been closed, converted or invalidated since.
    pub fn is_live(
        &self,
        handle: &ResourceHandle,
        current: Option<Epoch>,
    ) -> bool {
        current == Some(handle.epoch())
            && self.leases.iter().any(|l| {
                l.claim.owner == handle.id() && l.epoch == handle.epoch()
            })
    }

    /// Live handles of `kind`.
    pub fn live_count(&self, kind: ResourceKind) -> usize {
        self.leases.iter().filter(|l| l.claim.kind == kind).count()
    }

    /// Live handles of every kind.
    pub fn live_total(&self) -> usize {
        self.leases.len()
    }

    fn next_handle_id(&mut self) -> HandleId {
        self.next_id = self.next_id.wrapping_add(1);
        HandleId(self.next_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::PinSpec;

    static PINS: [PinSpec; 6] = [
        PinSpec::new(1, Capabilities::DIGITAL),
        PinSpec::new(2, Capabilities::DIGITAL.union(Capabilities::PWM_OUT)),
        PinSpec::new(3, Capabilities::DIGITAL.union(Capabilities::PWM_OUT)),
        PinSpec::new(4, Capabilities::DIGITAL.union(Capabilities::PWM_OUT)),
        PinSpec::new(5, Capabilities::DIGITAL.union(Capabilities::UART_RX)),
        PinSpec::new(6, Capabilities::DIGITAL.union(Capabilities::UART_TX)),
    ];
    static BOARD: Board = Board::new(
        "test",
        &PINS,
        ResourceLimits { analog_input: 0, pwm_output: 2, uart: 1, spi: 0 },
    );

    const EPOCH: Option<Epoch> = Some(Epoch(1));

    fn pwm(pin: u8) -> [PinRequest; 1] {
        [PinRequest::new(pin, Capabilities::PWM_OUT)]
    }

    #[test]
    fn open_requires_connection() {
        let mut alloc = ResourceAllocator::new(BOARD);
        let err = alloc
            .open(None, PinSource::Pins(&pwm(2)), ResourceKind::PwmOutput)
            .unwrap_err();
        assert_eq!(err, OpenError::NotConnected);
        assert_eq!(alloc.registry().claimed_count(), 0);
    }

    #[test]
    fn capacity_is_checked_per_kind() {
        let mut alloc = ResourceAllocator::new(BOARD);
        let first = alloc
            .open(EPOCH, PinSource::Pins(&pwm(2)), ResourceKind::PwmOutput)
            .unwrap();
        alloc
            .open(EPOCH, PinSource::Pins(&pwm(3)), ResourceKind::PwmOutput)
            .unwrap();
        assert_eq!(
            alloc.open(EPOCH, PinSource::Pins(&pwm(4)), ResourceKind::PwmOutput),
            Err(OpenError::OutOfResource(ResourceKind::PwmOutput))
        );
        assert!(alloc.registry().claim_of(4).is_none());

        alloc.close(&first).unwrap();
        alloc
            .open(EPOCH, PinSource::Pins(&pwm(4)), ResourceKind::PwmOutput)
            .unwrap();
    }

    #[test]
    fn conversion_consumes_source_handles() {
        let mut alloc = ResourceAllocator::new(BOARD);
        let rx = alloc
            .open(
                EPOCH,
                PinSource::Pins(&[PinRequest::new(5, Capabilities::DIGITAL_IN)]),
                ResourceKind::DigitalInput,
            )
            .unwrap();
        let tx = alloc
            .open(
                EPOCH,
                PinSource::Pins(&[PinRequest::new(6, Capabilities::DIGITAL_OUT)]),
                ResourceKind::DigitalOutput,
            )
            .unwrap();

        let sources = [
            HandleRequest {
                handle: &rx,
                expected: ResourceKind::DigitalInput,
                needs: Capabilities::UART_RX,
            },
            HandleRequest {
                handle: &tx,
                expected: ResourceKind::DigitalOutput,
                needs: Capabilities::UART_TX,
            },
        ];
        let uart = alloc
            .open(EPOCH, PinSource::Handles(&sources), ResourceKind::Uart)
            .unwrap();

        assert!(!alloc.is_live(&rx, EPOCH));
        assert!(!alloc.is_live(&tx, EPOCH));
        assert!(alloc.is_live(&uart, EPOCH));
        assert_eq!(alloc.live_total(), 1);
        assert_eq!(alloc.registry().claim_of(5), Some((uart.id(), ResourceKind::Uart)));
        assert!(alloc.close(&rx).is_none());
    }

    #[test]
    fn cancelled_conversion_restores_sources() {
        let mut alloc = ResourceAllocator::new(BOARD);
        let output = alloc
            .open(
                EPOCH,
                PinSource::Pins(&[PinRequest::new(2, Capabilities::DIGITAL_OUT)]),
                ResourceKind::DigitalOutput,
            )
            .unwrap();
        let sources = [HandleRequest {
            handle: &output,
            expected: ResourceKind::DigitalOutput,
            needs: Capabilities::PWM_OUT,
        }];

        let reservation = alloc
            .reserve(EPOCH, PinSource::Handles(&sources), ResourceKind::PwmOutput)
            .unwrap();
        let pwm = reservation.handle().clone();
        assert!(!alloc.is_live(&output, EPOCH));

        alloc.cancel(reservation);
        assert!(alloc.is_live(&output, EPOCH));
        assert!(!alloc.is_live(&pwm, EPOCH));
        assert_eq!(
            alloc.registry().claim_of(2),
            Some((output.id(), ResourceKind::DigitalOutput))
        );
        assert_eq!(alloc.live_count(ResourceKind::PwmOutput), 0);
    }

    #[test]
    fn cancel_after_invalidation_restores_nothing() {
        let mut alloc = ResourceAllocator::new(BOARD);
        let output = alloc
            .open(
                EPOCH,
                PinSource::Pins(&[PinRequest::new(2, Capabilities::DIGITAL_OUT)]),
                ResourceKind::DigitalOutput,
            )
            .unwrap();
        let sources = [HandleRequest {
            handle: &output,
            expected: ResourceKind::DigitalOutput,
            needs: Capabilities::PWM_OUT,
        }];
        let reservation = alloc
            .reserve(EPOCH, PinSource::Handles(&sources), ResourceKind::PwmOutput)
            .unwrap();

        alloc.invalidate_all();
        alloc.cancel(reservation);
        assert_eq!(alloc.live_total(), 0);
        assert_eq!(alloc.registry().claimed_count(), 0);
    }

    #[test]
    fn conversion_rejects_wrong_kind() {
        let mut alloc = ResourceAllocator::new(BOARD);
        let input = alloc
            .open(
                EPOCH,
                PinSource::Pins(&[PinRequest::new(2, Capabilities::DIGITAL_IN)]),
                ResourceKind::DigitalInput,
            )
            .unwrap();
        let sources = [HandleRequest {
            handle: &input,
            expected: ResourceKind::DigitalOutput,
            needs: Capabilities::PWM_OUT,
        }];
        assert_eq!(
            alloc.open(EPOCH, PinSource::Handles(&sources), ResourceKind::PwmOutput),
            Err(OpenError::Invalid(ClaimError::WrongKind {
                handle: input.id(),
                kind: ResourceKind::DigitalInput,
            }))
        );
        assert!(alloc.is_live(&input, EPOCH));
    }

    #[test]
    fn invalidate_all_kills_everything() {
        let mut alloc = ResourceAllocator::new(BOARD);
        let a = alloc
            .open(EPOCH, PinSource::Pins(&pwm(2)), ResourceKind::PwmOutput)
            .unwrap();
        assert_eq!(alloc.invalidate_all(), 1);
        assert!(!alloc.is_live(&a, EPOCH));
        assert_eq!(alloc.registry().claimed_count(), 0);

        let sources = [HandleRequest {
            handle: &a,
            expected: ResourceKind::PwmOutput,
            needs: Capabilities::PWM_OUT,
        }];
        assert_eq!(
            alloc.open(EPOCH, PinSource::Handles(&sources), ResourceKind::PwmOutput),
            Err(OpenError::StaleHandle(a.id()))
        );
    }

    #[test]
    fn handle_from_older_epoch_is_dead() {
        let mut alloc = ResourceAllocator::new(BOARD);
        let a = alloc
            .open(EPOCH, PinSource::Pins(&pwm(2)), ResourceKind::PwmOutput)
            .unwrap();
        assert!(!alloc.is_live(&a, Some(Epoch(2))));
        assert!(!alloc.is_live(&a, None));
    }
}
