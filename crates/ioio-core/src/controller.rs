use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use tracing::{debug, info, warn};

use crate::allocator::{HandleRequest, PinSource, ResourceAllocator};
use crate::board::{Board, Capabilities, PinId, ResourceKind};
use crate::connection::{ConnectionState, ConnectionStateMachine, Epoch};
use crate::error::{ClaimError, ControllerError};
use crate::handle::{
    AnalogInput, DigitalInput, DigitalOutput, HandleId, Peripheral,
    PwmOutput, ResourceHandle, Spi, Uart,
};
use crate::registry::PinRequest;
use crate::transport::{
    DeviceInfo, DigitalInputMode, DigitalOutputMode, PinCommand, ResetKind,
    SpiConfig, Transport, UartConfig,
};

type Result<R, T> = core::result::Result<R, ControllerError<<T as Transport>::Error>>;

/// State guarded by the short, synchronous critical section.
struct Shared {
    connection: ConnectionStateMachine,
    allocator: ResourceAllocator,
    device: Option<DeviceInfo>,
}

impl Shared {
    fn drop_link(&mut self) -> ConnectionState {
        self.device = None;
        self.connection.drop_link(&mut self.allocator)
    }
}

/// Public facade over one board connection.
///
/// Lifecycle calls (`wait_for_connect`, `disconnect`, resets) and `open_*`
/// are meant to be driven by a single owner. [`abort_connection`] and
/// [`connection_lost`] may be called from any context at any time.
///
/// [`abort_connection`]: Self::abort_connection
/// [`connection_lost`]: Self::connection_lost
pub struct PeripheralController<M: RawMutex, T: Transport> {
    shared: BlockingMutex<M, RefCell<Shared>>,
    transport: Mutex<M, T>,
    abort: Signal<M, ()>,
}

enum ConnectStart {
    Ready,
    InProgress,
    Begin,
}

impl<M: RawMutex, T: Transport> PeripheralController<M, T> {
    /// A disconnected controller for `board` driving `transport`.
    pub fn new(board: Board, transport: T) -> Self {
        Self {
            shared: BlockingMutex::new(RefCell::new(Shared {
                connection: ConnectionStateMachine::new(),
                allocator: ResourceAllocator::new(board),
                device: None,
            })),
            transport: Mutex::new(transport),
            abort: Signal::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        self.shared.lock(|shared| f(&mut shared.borrow_mut()))
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.with(|s| s.connection.state())
    }

    /// `true` only in `Connected`; handles can be opened.
    pub fn is_connected(&self) -> bool {
        self.with(|s| s.connection.is_connected())
    }

    /// Epoch of the current or most recent session.
    pub fn epoch(&self) -> Epoch {
        self.with(|s| s.connection.epoch())
    }

    /// Identification reported by the board, while connected.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.with(|s| s.device.clone())
    }

    /// The catalog pins are validated against.
    pub fn board(&self) -> Board {
        self.with(|s| *s.allocator.registry().board())
    }

    /// Whether `handle` is still usable in the current session.
    pub fn is_live(&self, handle: &ResourceHandle) -> bool {
        self.with(|s| {
            s.allocator.is_live(handle, s.connection.current_epoch())
        })
    }

    /// Live handles of `kind`.
    pub fn live_count(&self, kind: ResourceKind) -> usize {
        self.with(|s| s.allocator.live_count(kind))
    }

    /// Which live handle, if any, holds `pin`.
    pub fn claim_of(&self, pin: PinId) -> Option<(HandleId, ResourceKind)> {
        self.with(|s| s.allocator.registry().claim_of(pin))
    }

    /// Establish the link, suspending until the handshake finishes or
    /// [`abort_connection`](Self::abort_connection) is called.
    ///
    /// Returns immediately when already connected, or when another attempt
    /// (or a reset) is in progress.
    pub async fn wait_for_connect(&self) -> Result<(), T> {
        let start = self.with(|s| match s.connection.state() {
            ConnectionState::Connected => ConnectStart::Ready,
            ConnectionState::Connecting | ConnectionState::Resetting => {
                ConnectStart::InProgress
            }
            ConnectionState::Disconnected => {
                // Cleared under the same lock that publishes `Connecting`, so
                // an abort issued from here on is kept for the select below.
                self.abort.reset();
                s.connection.begin_connect();
                ConnectStart::Begin
            }
        });
        match start {
            ConnectStart::Ready | ConnectStart::InProgress => return Ok(()),
            ConnectStart::Begin => {}
        }

        debug!("waiting for board connection");
        let mut transport = self.transport.lock().await;
        match select(self.abort.wait(), transport.connect()).await {
            Either::First(()) => {
                self.with(|s| s.connection.abandon_connect());
                transport.disconnect().await;
                info!("connection attempt aborted");
                Err(ControllerError::OperationAborted)
            }
            Either::Second(Err(err)) => {
                self.with(|s| s.connection.abandon_connect());
                warn!("connection attempt failed: {:?}", err);
                Err(ControllerError::Transport(err))
            }
            Either::Second(Ok(device)) => {
                let epoch = self.with(|s| {
                    let epoch = s.connection.complete_connect();
                    if epoch.is_some() {
                        s.device = Some(device.clone());
                    }
                    epoch
                });
                match epoch {
                    Some(epoch) => {
                        info!(
                            "connected to {} (firmware {}), epoch {}",
                            device.hardware.as_str(),
                            device.firmware.as_str(),
                            epoch.0
                        );
                        Ok(())
                    }
                    // Disconnected while the handshake was finishing.
                    None => {
                        transport.disconnect().await;
                        Err(ControllerError::OperationAborted)
                    }
                }
            }
        }
    }

    /// Cancel a pending [`wait_for_connect`](Self::wait_for_connect).
    ///
    /// Has no effect unless an attempt is in progress.
    pub fn abort_connection(&self) {
        let pending = self.with(|s| {
            let pending = s.connection.state() == ConnectionState::Connecting;
            if pending {
                self.abort.signal(());
            }
            pending
        });
        if pending {
            debug!("abort requested for pending connection");
        }
    }

    /// Tear down the link and invalidate every handle. Idempotent.
    ///
    /// A pending connection attempt is cancelled and fails with
    /// `OperationAborted`.
    pub async fn disconnect(&self) {
        let previous = self.with(|s| {
            let previous = s.drop_link();
            if previous == ConnectionState::Connecting {
                self.abort.signal(());
            }
            previous
        });
        if previous != ConnectionState::Disconnected {
            info!("disconnecting (was {:?})", previous);
        }
        self.transport.lock().await.disconnect().await;
    }

    /// Loss notification from the transport.
    ///
    /// Invalidates every handle and moves to `Disconnected`. Callable from
    /// any context; does not touch the transport.
    pub fn connection_lost(&self) {
        let previous = self.with(|s| match s.connection.state() {
            ConnectionState::Connected | ConnectionState::Resetting => {
                Some(s.drop_link())
            }
            _ => None,
        });
        if let Some(previous) = previous {
            warn!("connection lost while {:?}; handles invalidated", previous);
        }
    }

    /// Return every pin to tri-state without dropping the link.
    ///
    /// All handles are invalidated and a new epoch starts.
    pub async fn soft_reset(&self) -> Result<(), T> {
        let mut transport = self.lock_live_transport().await?;
        if !self.with(|s| s.connection.begin_reset(&mut s.allocator)) {
            return Err(ControllerError::ConnectionLost);
        }

        if let Err(err) = transport.reset(ResetKind::Soft).await {
            warn!("soft reset failed: {:?}", err);
            self.with(|s| s.drop_link());
            transport.disconnect().await;
            return Err(ControllerError::ConnectionLost);
        }

        match self.with(|s| s.connection.complete_reset()) {
            Some(epoch) => {
                info!("soft reset complete, epoch {}", epoch.0);
                Ok(())
            }
            None => Err(ControllerError::ConnectionLost),
        }
    }

    /// Power-cycle the board. The link is dropped and not re-established.
    pub async fn hard_reset(&self) -> Result<(), T> {
        let mut transport = self.lock_live_transport().await?;
        if !self.with(|s| s.connection.begin_reset(&mut s.allocator)) {
            return Err(ControllerError::ConnectionLost);
        }

        let result = transport.reset(ResetKind::Hard).await;
        self.with(|s| s.drop_link());
        transport.disconnect().await;
        match result {
            Ok(()) => {
                info!("hard reset issued, board is rebooting");
                Ok(())
            }
            Err(err) => {
                warn!("hard reset failed: {:?}", err);
                Err(ControllerError::ConnectionLost)
            }
        }
    }

    async fn lock_live_transport(
        &self,
    ) -> Result<embassy_sync::mutex::MutexGuard<'_, M, T>, T> {
        if !self.is_connected() {
            return Err(ControllerError::ConnectionLost);
        }
        let transport = self.transport.lock().await;
        if !transport.is_alive() {
            self.connection_lost();
            return Err(ControllerError::ConnectionLost);
        }
        Ok(transport)
    }

    /// Release `handle` and return its pins to tri-state. Idempotent.
    pub async fn close(&self, handle: &ResourceHandle) {
        let Some(claim) = self.with(|s| s.allocator.close(handle)) else {
            return;
        };
        debug!("closed {:?} handle {:?}", claim.kind, claim.owner);
        if !self.is_connected() {
            return;
        }
        let release = PinCommand::Release { pins: claim.pins };
        if let Err(err) = self.transport.lock().await.configure(&release).await {
            warn!("failed to tri-state {:?}: {:?}", release, err);
        }
    }

    /// Claim pins, then have the board apply `command`.
    ///
    /// A failed `command` undoes the claim and hands converted pins back to
    /// their source handles. It is `InvalidOperation` while the link is up
    /// and `ConnectionLost` once it is gone.
    async fn open(
        &self,
        source: PinSource<'_>,
        kind: ResourceKind,
        command: PinCommand,
    ) -> Result<ResourceHandle, T> {
        let reservation = self.with(|s| {
            let current = s.connection.current_epoch();
            s.allocator.reserve(current, source, kind)
        })?;

        let mut transport = self.transport.lock().await;
        if let Err(err) = transport.configure(&command).await {
            let alive = transport.is_alive();
            drop(transport);
            self.with(|s| s.allocator.cancel(reservation));
            if !alive {
                warn!("link dropped while configuring {:?}: {:?}", command, err);
                self.connection_lost();
                return Err(ControllerError::ConnectionLost);
            }
            warn!("board rejected {:?}: {:?}", command, err);
            return Err(ClaimError::Rejected(kind).into());
        }
        drop(transport);

        let handle = reservation.commit();
        // The link may have dropped while the command was in flight.
        if !self.is_live(&handle) {
            return Err(ControllerError::ConnectionLost);
        }
        Ok(handle)
    }

    fn check_source(&self, source: &Peripheral<'_, M, T>) -> Result<(), T> {
        if source.is_issued_by(self) {
            Ok(())
        } else {
            Err(ClaimError::InvalidParameter("handle from another controller").into())
        }
    }

    /// Open `pin` as an input in `mode`.
    pub async fn open_digital_input(
        &self,
        pin: PinId,
        mode: DigitalInputMode,
    ) -> Result<DigitalInput<'_, M, T>, T> {
        let requests = [PinRequest::new(pin, Capabilities::DIGITAL_IN)];
        let handle = self
            .open(
                PinSource::Pins(&requests),
                ResourceKind::DigitalInput,
                PinCommand::DigitalInput { pin, mode },
            )
            .await?;
        Ok(DigitalInput::new(Peripheral::new(self, handle), mode))
    }

    /// Open `pin` as an output already driving `value` in `mode`.
    pub async fn open_digital_output(
        &self,
        pin: PinId,
        value: bool,
        mode: DigitalOutputMode,
    ) -> Result<DigitalOutput<'_, M, T>, T> {
        let requests = [PinRequest::new(pin, Capabilities::DIGITAL_OUT)];
        let handle = self
            .open(
                PinSource::Pins(&requests),
                ResourceKind::DigitalOutput,
                PinCommand::DigitalOutput { pin, value, mode },
            )
            .await?;
        Ok(DigitalOutput::new(Peripheral::new(self, handle), mode, value))
    }

    /// Open `pin` as an analog input. Limited by the board's ADC channels.
    pub async fn open_analog_input(
        &self,
        pin: PinId,
    ) -> Result<AnalogInput<'_, M, T>, T> {
        let requests = [PinRequest::new(pin, Capabilities::ANALOG_IN)];
        let handle = self
            .open(
                PinSource::Pins(&requests),
                ResourceKind::AnalogInput,
                PinCommand::AnalogInput { pin },
            )
            .await?;
        Ok(AnalogInput::new(Peripheral::new(self, handle)))
    }

    /// Open `pin` as a PWM output. Limited by the board's PWM module count.
    pub async fn open_pwm_output(
        &self,
        pin: PinId,
        freq_hz: u32,
    ) -> Result<PwmOutput<'_, M, T>, T> {
        check_non_zero(freq_hz, "PWM frequency must be non-zero")?;
        let requests = [PinRequest::new(pin, Capabilities::PWM_OUT)];
        let handle = self
            .open(
                PinSource::Pins(&requests),
                ResourceKind::PwmOutput,
                PinCommand::PwmOutput { pin, freq_hz, open_drain: false },
            )
            .await?;
        Ok(PwmOutput::new(Peripheral::new(self, handle), freq_hz, false))
    }

    /// Convert an open digital output into a PWM output on the same pin.
    ///
    /// The output's drive mode carries over. On success `output` is dead.
    pub async fn open_pwm_output_from(
        &self,
        output: &DigitalOutput<'_, M, T>,
        freq_hz: u32,
    ) -> Result<PwmOutput<'_, M, T>, T> {
        self.check_source(output)?;
        check_non_zero(freq_hz, "PWM frequency must be non-zero")?;
        let pin = output.pin();
        let open_drain = output.mode() == DigitalOutputMode::OpenDrain;
        let sources = [HandleRequest {
            handle: output.handle(),
            expected: ResourceKind::DigitalOutput,
            needs: Capabilities::PWM_OUT,
        }];
        let handle = self
            .open(
                PinSource::Handles(&sources),
                ResourceKind::PwmOutput,
                PinCommand::PwmOutput { pin, freq_hz, open_drain },
            )
            .await?;
        Ok(PwmOutput::new(Peripheral::new(self, handle), freq_hz, open_drain))
    }

    /// Open a UART receiving on `rx` and transmitting on `tx`.
    pub async fn open_uart(
        &self,
        rx: PinId,
        tx: PinId,
        config: UartConfig,
    ) -> Result<Uart<'_, M, T>, T> {
        check_non_zero(config.baud, "baud rate must be non-zero")?;
        let requests = [
            PinRequest::new(rx, Capabilities::UART_RX),
            PinRequest::new(tx, Capabilities::UART_TX),
        ];
        let handle = self
            .open(
                PinSource::Pins(&requests),
                ResourceKind::Uart,
                PinCommand::Uart { rx, tx, config },
            )
            .await?;
        Ok(Uart::new(Peripheral::new(self, handle), config))
    }

    /// Build a UART on the pins of an open input (RX) and output (TX).
    ///
    /// On success both source handles are dead.
    pub async fn open_uart_from(
        &self,
        rx: &DigitalInput<'_, M, T>,
        tx: &DigitalOutput<'_, M, T>,
        config: UartConfig,
    ) -> Result<Uart<'_, M, T>, T> {
        self.check_source(rx)?;
        self.check_source(tx)?;
        check_non_zero(config.baud, "baud rate must be non-zero")?;
        let command = PinCommand::Uart { rx: rx.pin(), tx: tx.pin(), config };
        let sources = [
            HandleRequest {
                handle: rx.handle(),
                expected: ResourceKind::DigitalInput,
                needs: Capabilities::UART_RX,
            },
            HandleRequest {
                handle: tx.handle(),
                expected: ResourceKind::DigitalOutput,
                needs: Capabilities::UART_TX,
            },
        ];
        let handle = self
            .open(PinSource::Handles(&sources), ResourceKind::Uart, command)
            .await?;
        Ok(Uart::new(Peripheral::new(self, handle), config))
    }

    /// Open an SPI master. `select` only needs to be a digital output.
    pub async fn open_spi(
        &self,
        miso: PinId,
        mosi: PinId,
        clk: PinId,
        select: PinId,
        config: SpiConfig,
    ) -> Result<Spi<'_, M, T>, T> {
        check_non_zero(config.rate_hz, "SPI clock rate must be non-zero")?;
        let requests = [
            PinRequest::new(miso, Capabilities::SPI | Capabilities::DIGITAL_IN),
            PinRequest::new(mosi, Capabilities::SPI | Capabilities::DIGITAL_OUT),
            PinRequest::new(clk, Capabilities::SPI | Capabilities::DIGITAL_OUT),
            PinRequest::new(select, Capabilities::DIGITAL_OUT),
        ];
        let handle = self
            .open(
                PinSource::Pins(&requests),
                ResourceKind::Spi,
                PinCommand::Spi { miso, mosi, clk, select, config },
            )
            .await?;
        Ok(Spi::new(Peripheral::new(self, handle), config))
    }

    /// Build an SPI master on the pins of open digital handles.
    ///
    /// On success all four source handles are dead.
    pub async fn open_spi_from(
        &self,
        miso: &DigitalInput<'_, M, T>,
        mosi: &DigitalOutput<'_, M, T>,
        clk: &DigitalOutput<'_, M, T>,
        select: &DigitalOutput<'_, M, T>,
        config: SpiConfig,
    ) -> Result<Spi<'_, M, T>, T> {
        self.check_source(miso)?;
        for output in [mosi, clk, select] {
            self.check_source(output)?;
        }
        check_non_zero(config.rate_hz, "SPI clock rate must be non-zero")?;
        let command = PinCommand::Spi {
            miso: miso.pin(),
            mosi: mosi.pin(),
            clk: clk.pin(),
            select: select.pin(),
            config,
        };
        let sources = [
            HandleRequest {
                handle: miso.handle(),
                expected: ResourceKind::DigitalInput,
                needs: Capabilities::SPI | Capabilities::DIGITAL_IN,
            },
            reuse_output(mosi, Capabilities::SPI | Capabilities::DIGITAL_OUT),
            reuse_output(clk, Capabilities::SPI | Capabilities::DIGITAL_OUT),
            reuse_output(select, Capabilities::DIGITAL_OUT),
        ];
        let handle = self
            .open(PinSource::Handles(&sources), ResourceKind::Spi, command)
            .await?;
        Ok(Spi::new(Peripheral::new(self, handle), config))
    }
}

fn check_non_zero(value: u32, what: &'static str) -> core::result::Result<(), ClaimError> {
    if value == 0 {
        Err(ClaimError::InvalidParameter(what))
    } else {
        Ok(())
    }
}

fn reuse_output<'h, M: RawMutex, T: Transport>(
    output: &'h DigitalOutput<'_, M, T>,
    needs: Capabilities,
) -> HandleRequest<'h> {
    HandleRequest {
        handle: output.handle(),
        expected: ResourceKind::DigitalOutput,
        needs,
    }
}
