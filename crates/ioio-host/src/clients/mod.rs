pub mod tcp;

pub use tcp::{watch_link, LinkMonitor, TcpError, TcpTransport, DEFAULT_ADDR};
