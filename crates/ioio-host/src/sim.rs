//! In-process stand-in for a board, speaking the wire protocol over TCP.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ioio_core::{Board, Capabilities, DeviceInfo, PinCommand, PinId, ResetKind};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Notify;

use crate::protocol::{self, FrameReader, NackCode, Request, Response};

struct SimState {
    board: Board,
    info: DeviceInfo,
    pins: Mutex<BTreeMap<PinId, PinCommand>>,
    sessions: AtomicUsize,
    resets: Mutex<Vec<ResetKind>>,
    kick: Notify,
}

impl SimState {
    fn pins(&self) -> std::sync::MutexGuard<'_, BTreeMap<PinId, PinCommand>> {
        self.pins.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, command: PinCommand) -> Response {
        let needs = required_capabilities(&command);
        for (pin, needs) in &needs {
            let Some(spec) = self.board.spec(*pin) else {
                return Response::Nack(NackCode::UnknownPin(*pin));
            };
            if !spec.capabilities.contains(*needs) {
                return Response::Nack(NackCode::Unsupported(*pin));
            }
        }

        let mut pins = self.pins();
        if let PinCommand::Release { pins: released } = &command {
            for pin in released {
                pins.remove(pin);
            }
        } else {
            for (pin, _) in needs {
                pins.insert(pin, command.clone());
            }
        }
        Response::Ack
    }
}

fn required_capabilities(command: &PinCommand) -> Vec<(PinId, Capabilities)> {
    match command {
        PinCommand::DigitalInput { pin, .. } => vec![(*pin, Capabilities::DIGITAL_IN)],
        PinCommand::DigitalOutput { pin, .. } => vec![(*pin, Capabilities::DIGITAL_OUT)],
        PinCommand::AnalogInput { pin } => vec![(*pin, Capabilities::ANALOG_IN)],
        PinCommand::PwmOutput { pin, .. } => vec![(*pin, Capabilities::PWM_OUT)],
        PinCommand::Uart { rx, tx, .. } => {
            vec![(*rx, Capabilities::UART_RX), (*tx, Capabilities::UART_TX)]
        }
        PinCommand::Spi { miso, mosi, clk, select, .. } => vec![
            (*miso, Capabilities::SPI | Capabilities::DIGITAL_IN),
            (*mosi, Capabilities::SPI | Capabilities::DIGITAL_OUT),
            (*clk, Capabilities::SPI | Capabilities::DIGITAL_OUT),
            (*select, Capabilities::DIGITAL_OUT),
        ],
        PinCommand::Release { pins } => {
            pins.iter().map(|pin| (*pin, Capabilities::empty())).collect()
        }
    }
}

/// Inspect and poke a running [`Simulator`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<SimState>,
}

impl SimHandle {
    /// Current configuration of every non-tri-stated pin.
    pub fn configured(&self) -> BTreeMap<PinId, PinCommand> {
        self.state.pins().clone()
    }

    /// Connections accepted so far.
    pub fn sessions(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> Vec<ResetKind> {
        self.state
            .resets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drop the current connection without a goodbye, as a pulled cable
    /// would.
    pub fn drop_link(&self) {
        self.state.kick.notify_one();
    }
}

/// A board that accepts one host at a time.
pub struct Simulator {
    listener: TcpListener,
    state: Arc<SimState>,
}

impl Simulator {
    pub async fn bind(addr: impl ToSocketAddrs, board: Board) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let mut info = DeviceInfo::default();
        // All three fit the 16-byte capacity.
        let _ = info.hardware.push_str("SIM0001");
        let _ = info.bootloader.push_str("BOOT0100");
        let _ = info.firmware.push_str("IOIO0500");
        let state = Arc::new(SimState {
            board,
            info,
            pins: Mutex::default(),
            sessions: AtomicUsize::new(0),
            resets: Mutex::default(),
            kick: Notify::new(),
        });
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle { state: self.state.clone() }
    }

    pub async fn run(self) -> std::io::Result<()> {
        tracing::info!(
            "simulating {} on {}",
            self.state.board.name,
            self.listener.local_addr()?
        );
        loop {
            let (stream, peer) = self.listener.accept().await?;
            self.state.sessions.fetch_add(1, Ordering::SeqCst);
            tracing::info!("host {peer} connected");
            if let Err(err) = serve(stream, &self.state).await {
                tracing::warn!("session with {peer} failed: {err}");
            }
            // Whatever the host left configured goes back to tri-state.
            self.state.pins().clear();
            tracing::info!("host {peer} gone");
        }
    }
}

async fn serve(stream: TcpStream, state: &SimState) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();
    let mut frames = FrameReader::new(read);

    loop {
        let frame = tokio::select! {
            frame = frames.next_frame() => frame?,
            _ = state.kick.notified() => {
                tracing::info!("dropping link on request");
                return Ok(());
            }
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        let (response, close) = match protocol::decode::<Request>(frame) {
            Ok(Request::Hello) => (Response::Established(state.info.clone()), false),
            Ok(Request::Configure(command)) => (state.apply(command), false),
            Ok(Request::Reset(kind)) => {
                state.pins().clear();
                state
                    .resets
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(kind);
                (Response::Ack, kind == ResetKind::Hard)
            }
            Ok(Request::Goodbye) => return Ok(()),
            Err(err) => {
                tracing::warn!("malformed request: {err}");
                (Response::Nack(NackCode::Malformed), false)
            }
        };

        let reply = protocol::encode(&response)
            .map_err(|err| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
            })?;
        write.write_all(&reply).await?;
        if close {
            // The board reboots; the host sees the socket go away.
            write.shutdown().await?;
            return Ok(());
        }
    }
}
