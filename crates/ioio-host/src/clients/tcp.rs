use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use embassy_sync::blocking_mutex::raw::RawMutex;
use ioio_core::{DeviceInfo, PeripheralController, PinCommand, ResetKind, Transport};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::protocol::{self, FrameReader, NackCode, Request, Response};

pub const DEFAULT_ADDR: &str = "127.0.0.1:4545";

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum TcpError {
    Io(std::io::Error),
    Codec(postcard::Error),
    Nack(NackCode),
    Unexpected(Response),
    Timeout,
    Closed,
}

impl From<std::io::Error> for TcpError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<postcard::Error> for TcpError {
    fn from(value: postcard::Error) -> Self {
        Self::Codec(value)
    }
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpError::Io(err) => write!(f, "i/o error: {err}"),
            TcpError::Codec(err) => write!(f, "bad frame: {err}"),
            TcpError::Nack(code) => write!(f, "board refused request: {code:?}"),
            TcpError::Unexpected(resp) => write!(f, "unexpected reply: {resp:?}"),
            TcpError::Timeout => f.write_str("board did not reply in time"),
            TcpError::Closed => f.write_str("link closed"),
        }
    }
}

impl std::error::Error for TcpError {}

/// Link liveness shared between the transport's reader task and whoever
/// forwards loss to the controller.
#[derive(Debug, Default)]
pub struct LinkMonitor {
    alive: AtomicBool,
    lost: Notify,
}

impl LinkMonitor {
    /// `true` between a successful connect and the link going down.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Resolves after the link went down on its own.
    pub async fn lost(&self) {
        self.lost.notified().await
    }

    fn mark_up(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Orderly shutdown; nobody is woken.
    fn mark_down(&self) {
        self.alive.store(false, Ordering::Release);
    }

    fn mark_lost(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            self.lost.notify_one();
        }
    }
}

/// Forward link loss seen by `monitor` to `controller`. Runs forever.
pub async fn watch_link<M, T>(
    controller: &PeripheralController<M, T>,
    monitor: &LinkMonitor,
) where
    M: RawMutex,
    T: Transport,
{
    loop {
        monitor.lost().await;
        // A stale wakeup may arrive after a reconnect.
        if !monitor.is_alive() {
            controller.connection_lost();
        }
    }
}

struct Link {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Response>,
    reader: JoinHandle<()>,
}

/// [`Transport`] speaking the framed protocol over TCP.
pub struct TcpTransport {
    addr: String,
    reply_timeout: Duration,
    monitor: Arc<LinkMonitor>,
    link: Option<Link>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            reply_timeout: REPLY_TIMEOUT,
            monitor: Arc::default(),
            link: None,
        }
    }

    /// How long to wait for each reply before giving the link up.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Liveness of the current link, for [`watch_link`].
    pub fn monitor(&self) -> Arc<LinkMonitor> {
        self.monitor.clone()
    }

    async fn request(&mut self, request: &Request) -> Result<Response, TcpError> {
        let link = self.link.as_mut().ok_or(TcpError::Closed)?;
        let frame = protocol::encode(request)?;
        if let Err(err) = link.writer.write_all(&frame).await {
            self.abandon().await;
            return Err(err.into());
        }
        let reply = tokio::time::timeout(self.reply_timeout, link.replies.recv()).await;
        match reply {
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                self.abandon().await;
                Err(TcpError::Closed)
            }
            Err(_) => {
                // A late reply would be taken as the answer to the next
                // request.
                tracing::warn!("no reply to {request:?}, dropping link");
                self.abandon().await;
                Err(TcpError::Timeout)
            }
        }
    }

    /// Drop the link without a goodbye and report it lost.
    async fn abandon(&mut self) {
        if let Some(link) = self.link.take() {
            stop_reader(link.reader).await;
        }
        self.monitor.mark_lost();
    }

    async fn expect_ack(&mut self, request: &Request) -> Result<(), TcpError> {
        match self.request(request).await? {
            Response::Ack => Ok(()),
            Response::Nack(code) => Err(TcpError::Nack(code)),
            other => Err(TcpError::Unexpected(other)),
        }
    }
}

async fn read_replies(
    read: OwnedReadHalf,
    replies: mpsc::UnboundedSender<Response>,
    monitor: Arc<LinkMonitor>,
) {
    let mut frames = FrameReader::new(read);
    loop {
        match frames.next_frame().await {
            Ok(Some(frame)) => match protocol::decode::<Response>(frame) {
                Ok(response) => {
                    if replies.send(response).is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!("dropping bad frame: {err}"),
            },
            Ok(None) => {
                tracing::debug!("board closed the link");
                break;
            }
            Err(err) => {
                tracing::warn!("link read failed: {err}");
                break;
            }
        }
    }
    monitor.mark_lost();
}

/// Abort the reader and wait until it is gone, so it cannot report loss
/// for a link that has already been replaced.
async fn stop_reader(reader: JoinHandle<()>) {
    reader.abort();
    let _ = reader.await;
}

impl Transport for TcpTransport {
    type Error = TcpError;

    async fn connect(&mut self) -> Result<DeviceInfo, TcpError> {
        self.disconnect().await;

        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let (read, writer) = stream.into_split();
        let (tx, replies) = mpsc::unbounded_channel();
        self.monitor.mark_up();
        let reader = tokio::spawn(read_replies(read, tx, self.monitor.clone()));
        self.link = Some(Link { writer, replies, reader });

        match self.request(&Request::Hello).await {
            Ok(Response::Established(info)) => Ok(info),
            Ok(other) => {
                self.disconnect().await;
                Err(TcpError::Unexpected(other))
            }
            Err(err) => {
                self.disconnect().await;
                Err(err)
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.link.is_some() && self.monitor.is_alive()
    }

    async fn disconnect(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        self.monitor.mark_down();
        if let Ok(frame) = protocol::encode(&Request::Goodbye) {
            let _ = link.writer.write_all(&frame).await;
        }
        let _ = link.writer.shutdown().await;
        stop_reader(link.reader).await;
        tracing::debug!("link to {} closed", self.addr);
    }

    async fn reset(&mut self, kind: ResetKind) -> Result<(), TcpError> {
        self.expect_ack(&Request::Reset(kind)).await
    }

    async fn configure(&mut self, command: &PinCommand) -> Result<(), TcpError> {
        self.expect_ack(&Request::Configure(command.clone())).await
    }
}
