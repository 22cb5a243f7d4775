use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use ioio_host::core::{
    Board, DigitalInputMode, DigitalOutputMode, Peripheral, PinId, IOIO_V1,
};
use ioio_host::{watch_link, Simulator, TcpController, TcpTransport, DEFAULT_ADDR};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "ioio", about = "Control an IOIO board over TCP")]
struct Args {
    /// Address of the board (or of `ioio sim`)
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: String,

    #[arg(long, value_enum, default_value_t = BoardKind::IoioV1)]
    board: BoardKind,

    /// Abort the handshake after this many milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum BoardKind {
    IoioV1,
}

impl BoardKind {
    fn catalog(self) -> Board {
        match self {
            BoardKind::IoioV1 => IOIO_V1,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ClaimKind {
    DigitalIn,
    DigitalOut,
    Analog,
    Pwm,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, print the board identification and disconnect
    Probe,
    /// Open one pin and hold it until Ctrl+C or link loss
    Claim {
        pin: PinId,
        #[arg(long, value_enum, default_value_t = ClaimKind::DigitalOut)]
        kind: ClaimKind,
        /// Initial level of a digital output
        #[arg(long)]
        high: bool,
        #[arg(long, default_value_t = 1000)]
        freq_hz: u32,
    },
    /// Return every pin to tri-state, or reboot the board with --hard
    Reset {
        #[arg(long)]
        hard: bool,
    },
    /// Serve a simulated board
    Sim {
        #[arg(long, default_value = DEFAULT_ADDR)]
        listen: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// Handshake, abortable by Ctrl+C and by the optional timeout.
async fn connect(
    controller: &Arc<TcpController>,
    timeout: Option<Duration>,
) -> Result<(), BoxError> {
    let aborter = {
        let controller = controller.clone();
        tokio::spawn(async move {
            match timeout {
                Some(timeout) => tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        warn!("no handshake after {timeout:?}, giving up");
                    }
                    _ = tokio::signal::ctrl_c() => {}
                },
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
            controller.abort_connection();
        })
    };
    let result = controller.wait_for_connect().await;
    aborter.abort();
    result?;

    if let Some(device) = controller.device_info() {
        println!(
            "hardware {} / bootloader {} / firmware {}",
            device.hardware, device.bootloader, device.firmware
        );
    }
    Ok(())
}

async fn hold(peripheral: &Peripheral<'_, CriticalSectionRawMutex, TcpTransport>) {
    println!("holding pins {:?}; press Ctrl+C to release", peripheral.pins());
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = interval.tick() => {
                if peripheral.ensure_live().is_err() {
                    warn!("link lost, handle is dead");
                    return;
                }
            }
        }
    }
    peripheral.close().await;
}

async fn claim(
    controller: &TcpController,
    pin: PinId,
    kind: ClaimKind,
    high: bool,
    freq_hz: u32,
) -> Result<(), BoxError> {
    match kind {
        ClaimKind::DigitalIn => {
            let input = controller
                .open_digital_input(pin, DigitalInputMode::Floating)
                .await?;
            hold(&input).await;
        }
        ClaimKind::DigitalOut => {
            let output = controller
                .open_digital_output(pin, high, DigitalOutputMode::Normal)
                .await?;
            hold(&output).await;
        }
        ClaimKind::Analog => {
            let analog = controller.open_analog_input(pin).await?;
            hold(&analog).await;
        }
        ClaimKind::Pwm => {
            let pwm = controller.open_pwm_output(pin, freq_hz).await?;
            hold(&pwm).await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();
    let args = Args::parse();
    let board = args.board.catalog();

    if let Command::Sim { listen } = &args.command {
        let simulator = Simulator::bind(listen.as_str(), board).await?;
        simulator.run().await?;
        return Ok(());
    }

    let transport = TcpTransport::new(args.addr.clone());
    let monitor = transport.monitor();
    let controller = Arc::new(TcpController::new(board, transport));
    let watcher = {
        let controller = controller.clone();
        tokio::spawn(async move { watch_link(&controller, &monitor).await })
    };

    info!("connecting to {} at {}", board.name, args.addr);
    connect(&controller, args.connect_timeout_ms.map(Duration::from_millis)).await?;

    let result = match args.command {
        Command::Probe => Ok(()),
        Command::Claim { pin, kind, high, freq_hz } => {
            claim(&controller, pin, kind, high, freq_hz).await
        }
        Command::Reset { hard: false } => {
            controller.soft_reset().await?;
            println!("soft reset done, epoch {}", controller.epoch().0);
            Ok(())
        }
        Command::Reset { hard: true } => {
            controller.hard_reset().await?;
            println!("board is rebooting");
            Ok(())
        }
        // Served before connecting.
        Command::Sim { .. } => Ok(()),
    };

    controller.disconnect().await;
    watcher.abort();
    result
}
