use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ioio_host::core::{
    ClaimError, ConnectionState, ControllerError, DeviceInfo, DigitalInputMode,
    DigitalOutputMode, Epoch, PinCommand, ResetKind, ResourceKind, SpiConfig,
    UartConfig, IOIO_V1,
};
use ioio_host::protocol::{self, FrameReader, NackCode, Request, Response};
use ioio_host::{
    watch_link, LinkMonitor, SimHandle, Simulator, TcpController, TcpError,
    TcpTransport,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

struct Rig {
    controller: Arc<TcpController>,
    sim: SimHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Rig {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn rig() -> Rig {
    let simulator = Simulator::bind("127.0.0.1:0", IOIO_V1).await.unwrap();
    let addr = simulator.local_addr().unwrap();
    let sim = simulator.handle();
    let server = tokio::spawn(async move {
        let _ = simulator.run().await;
    });

    let transport = TcpTransport::new(addr.to_string());
    let monitor: Arc<LinkMonitor> = transport.monitor();
    let controller = Arc::new(TcpController::new(IOIO_V1, transport));
    let watcher = {
        let controller = controller.clone();
        tokio::spawn(async move { watch_link(&controller, &monitor).await })
    };

    Rig { controller, sim, tasks: vec![server, watcher] }
}

async fn wait_for_state(controller: &TcpController, state: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while controller.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state not reached");
}

#[tokio::test]
async fn handshake_reports_device_info() {
    let rig = rig().await;
    rig.controller.wait_for_connect().await.unwrap();

    let info = rig.controller.device_info().unwrap();
    assert_eq!(info.hardware.as_str(), "SIM0001");
    assert_eq!(info.firmware.as_str(), "IOIO0500");
    assert_eq!(rig.controller.epoch(), Epoch(1));
    assert_eq!(rig.sim.sessions(), 1);
}

#[tokio::test]
async fn open_configures_board_and_close_releases() {
    let rig = rig().await;
    rig.controller.wait_for_connect().await.unwrap();

    let led = rig
        .controller
        .open_digital_output(0, true, DigitalOutputMode::Normal)
        .await
        .unwrap();
    assert_eq!(
        rig.sim.configured().get(&0),
        Some(&PinCommand::DigitalOutput {
            pin: 0,
            value: true,
            mode: DigitalOutputMode::Normal
        })
    );

    led.close().await;
    assert!(rig.sim.configured().is_empty());
}

#[tokio::test]
async fn uart_and_spi_reach_the_board() {
    let rig = rig().await;
    rig.controller.wait_for_connect().await.unwrap();

    let _uart = rig
        .controller
        .open_uart(3, 4, UartConfig::default())
        .await
        .unwrap();
    let _spi = rig
        .controller
        .open_spi(10, 11, 12, 13, SpiConfig::new(1_000_000))
        .await
        .unwrap();

    let configured = rig.sim.configured();
    assert_eq!(configured.len(), 6);
    assert!(matches!(configured.get(&4), Some(PinCommand::Uart { rx: 3, tx: 4, .. })));
    assert!(matches!(configured.get(&13), Some(PinCommand::Spi { select: 13, .. })));
}

#[tokio::test]
async fn soft_reset_clears_board_and_keeps_link() {
    let rig = rig().await;
    rig.controller.wait_for_connect().await.unwrap();
    let pwm = rig.controller.open_pwm_output(3, 50).await.unwrap();

    rig.controller.soft_reset().await.unwrap();

    assert!(!pwm.is_live());
    assert!(rig.sim.configured().is_empty());
    assert_eq!(rig.sim.resets(), vec![ResetKind::Soft]);
    assert_eq!(rig.controller.epoch(), Epoch(2));
    assert_eq!(rig.sim.sessions(), 1);

    let again = rig.controller.open_pwm_output(3, 50).await.unwrap();
    assert!(again.is_live());
}

#[tokio::test]
async fn hard_reset_then_reconnect() {
    let rig = rig().await;
    rig.controller.wait_for_connect().await.unwrap();

    rig.controller.hard_reset().await.unwrap();
    assert_eq!(rig.controller.state(), ConnectionState::Disconnected);
    assert_eq!(rig.sim.resets(), vec![ResetKind::Hard]);

    rig.controller.wait_for_connect().await.unwrap();
    assert_eq!(rig.controller.epoch(), Epoch(2));
    assert_eq!(rig.sim.sessions(), 2);
}

#[tokio::test]
async fn dropped_link_invalidates_handles() {
    let rig = rig().await;
    rig.controller.wait_for_connect().await.unwrap();
    let input = rig
        .controller
        .open_digital_input(5, DigitalInputMode::PullUp)
        .await
        .unwrap();

    rig.sim.drop_link();
    wait_for_state(&rig.controller, ConnectionState::Disconnected).await;

    assert!(!input.is_live());
    assert!(matches!(input.ensure_live(), Err(ControllerError::ConnectionLost)));
    assert!(matches!(
        rig.controller.open_digital_input(6, DigitalInputMode::Floating).await,
        Err(ControllerError::ConnectionLost)
    ));

    rig.controller.wait_for_connect().await.unwrap();
    assert_eq!(rig.controller.epoch(), Epoch(2));
}

#[tokio::test]
async fn refused_connection_is_transport_error() {
    // Bind then drop, so nothing listens on the port.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let controller = TcpController::new(IOIO_V1, TcpTransport::new(addr.to_string()));

    let result = controller.wait_for_connect().await;
    assert!(matches!(result, Err(ControllerError::Transport(TcpError::Io(_)))));
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn abort_unblocks_silent_board() {
    // Accepts but never answers the hello.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        std::future::pending::<()>().await;
    });

    let controller = Arc::new(TcpController::new(IOIO_V1, TcpTransport::new(addr.to_string())));
    let aborter = {
        let controller = controller.clone();
        tokio::spawn(async move {
            while controller.state() != ConnectionState::Connecting {
                tokio::task::yield_now().await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            controller.abort_connection();
        })
    };

    let result = controller.wait_for_connect().await;
    assert!(matches!(result, Err(ControllerError::OperationAborted)));
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    aborter.await.unwrap();
    silent.abort();
}

#[tokio::test]
async fn reconnect_cycles_keep_new_link_alive() {
    let rig = rig().await;
    for session in 1..=5 {
        rig.controller.wait_for_connect().await.unwrap();
        // Time for a stray loss report from the previous link to land.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rig.controller.is_connected());
        assert_eq!(rig.controller.epoch(), Epoch(session));
        rig.controller.disconnect().await;
    }
}

/// Board that answers the first `Configure` it ever sees too late and
/// refuses every later one.
async fn slow_board(listener: TcpListener) {
    let configures = Arc::new(AtomicUsize::new(0));
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(slow_session(stream, configures.clone()));
    }
}

async fn slow_session(stream: TcpStream, configures: Arc<AtomicUsize>) {
    let (read, mut write) = stream.into_split();
    let mut frames = FrameReader::new(read);
    while let Ok(Some(frame)) = frames.next_frame().await {
        let response = match protocol::decode::<Request>(frame) {
            Ok(Request::Hello) => Response::Established(DeviceInfo::default()),
            Ok(Request::Configure(_)) => {
                if configures.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Response::Ack
                } else {
                    Response::Nack(NackCode::Unsupported(0))
                }
            }
            _ => continue,
        };
        let frame = protocol::encode(&response).unwrap();
        if write.write_all(&frame).await.is_err() {
            return;
        }
    }
}

#[tokio::test]
async fn late_reply_is_not_taken_for_the_next_one() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let board = tokio::spawn(slow_board(listener));

    let transport = TcpTransport::new(addr.to_string())
        .with_reply_timeout(Duration::from_millis(100));
    let controller = TcpController::new(IOIO_V1, transport);
    controller.wait_for_connect().await.unwrap();

    let first = controller
        .open_digital_output(0, true, DigitalOutputMode::Normal)
        .await;
    assert!(matches!(first, Err(ControllerError::ConnectionLost)));
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert_eq!(controller.claim_of(0), None);

    controller.wait_for_connect().await.unwrap();
    let second = controller
        .open_digital_output(0, true, DigitalOutputMode::Normal)
        .await;
    assert!(matches!(
        second,
        Err(ControllerError::InvalidOperation(ClaimError::Rejected(
            ResourceKind::DigitalOutput
        )))
    ));
    assert!(controller.is_connected());
    assert_eq!(controller.claim_of(0), None);
    board.abort();
}
