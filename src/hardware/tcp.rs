use super::{ByteStream, Connector};
use crate::transport::TransportError;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Blocking TCP connector for the serial-to-network bridge.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }

    fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        (host, port)
            .to_socket_addrs()
            .map_err(TransportError::from)?
            .next()
            .ok_or(TransportError::NetworkUnreachable)
    }
}

impl Connector for TcpConnector {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn ByteStream>, TransportError> {
        let addr = Self::resolve(host, port)?;
        debug!("Connecting to {} (timeout {:?})", addr, timeout);
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpByteStream { stream }))
    }
}

struct TcpByteStream {
    stream: TcpStream,
}

impl ByteStream for TcpByteStream {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn recv_with_timeout(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        // A zero read timeout means "block forever" to the OS.
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream.set_read_timeout(Some(timeout))?;
        let mut buf = vec![0u8; max_bytes];
        let n = self.stream.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}
