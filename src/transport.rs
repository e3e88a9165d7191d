//! Wire transports.
//!
//! Datagram transports map one socket read/write to one OpenVPN packet.
//! Stream transports prepend a big-endian 16-bit length to each packet; the
//! reader reassembles frames regardless of how the peer split its writes.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{Options, Proto};
use crate::error::{Error, Result};
use crate::protocol::MAX_PACKET_SIZE;

/// An already-connected packet transport.
///
/// Methods take `&self`: the underlying sockets support concurrent use, and
/// the implementations serialize their read and write paths internally so
/// one reader and one writer can share the transport.
pub trait Transport: Send + Sync {
    /// Read one whole OpenVPN packet, blocking until available or the read
    /// timeout elapses.
    fn read_packet(&self) -> Result<Vec<u8>>;

    /// Write one whole OpenVPN packet.
    fn write_packet(&self, packet: &[u8]) -> Result<()>;

    fn local_addr(&self) -> Result<SocketAddr>;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// UDP transport: one datagram per packet, no extra framing.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn read_packet(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let n = self.socket.recv(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_packet(&self, packet: &[u8]) -> Result<()> {
        let n = self.socket.send(packet)?;
        if n != packet.len() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "short datagram write",
            )));
        }
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.socket.set_read_timeout(timeout)?)
    }

    fn close(&self) -> Result<()> {
        // Nothing to tear down for UDP; the socket closes on drop.
        Ok(())
    }
}

/// TCP transport with 16-bit length framing.
///
/// A partially received frame survives read timeouts: the bytes already
/// consumed stay buffered until the rest of the frame arrives.
pub struct TcpTransport {
    stream: TcpStream,
    rx: Mutex<Vec<u8>>,
    tx: Mutex<()>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            rx: Mutex::new(Vec::new()),
            tx: Mutex::new(()),
        }
    }

    fn frame_ready(pending: &[u8]) -> Option<usize> {
        if pending.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([pending[0], pending[1]]) as usize;
        (pending.len() >= 2 + len).then_some(len)
    }
}

impl Transport for TcpTransport {
    fn read_packet(&self) -> Result<Vec<u8>> {
        let mut pending = self.rx.lock().unwrap();
        loop {
            if let Some(len) = Self::frame_ready(&pending) {
                let frame = pending[2..2 + len].to_vec();
                pending.drain(..2 + len);
                return Ok(frame);
            }
            let mut chunk = [0u8; MAX_PACKET_SIZE];
            match (&self.stream).read(&mut chunk) {
                Ok(0) => return Err(Error::TransportClosed),
                Ok(n) => pending.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn write_packet(&self, packet: &[u8]) -> Result<()> {
        if packet.len() > u16::MAX as usize {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "packet exceeds stream frame limit",
            )));
        }
        let mut frame = Vec::with_capacity(2 + packet.len());
        frame.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        frame.extend_from_slice(packet);

        let _guard = self.tx.lock().unwrap();
        (&self.stream).write_all(&frame)?;
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    fn close(&self) -> Result<()> {
        let _ = self.stream.shutdown(Shutdown::Both);
        Ok(())
    }
}

/// Resolve the configured remote and produce a connected transport.
pub fn dial(options: &Options) -> Result<Box<dyn Transport>> {
    let endpoint = options.remote_endpoint();
    let addr = endpoint
        .to_socket_addrs()
        .map_err(|e| Error::config(format!("cannot resolve {endpoint}: {e}")))?
        .next()
        .ok_or_else(|| Error::config(format!("no addresses found for {endpoint}")))?;

    debug!(%addr, proto = ?options.proto, "dialing");
    match options.proto {
        Proto::Udp => {
            let bind_addr: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(bind_addr)?;
            socket.connect(addr)?;
            info!(%addr, "UDP transport connected");
            Ok(Box::new(UdpTransport::new(socket)))
        }
        Proto::Tcp => {
            let stream = TcpStream::connect(addr)?;
            stream.set_nodelay(true)?;
            info!(%addr, "TCP transport connected");
            Ok(Box::new(TcpTransport::new(stream)))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_tcp_framing_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let transport = TcpTransport::new(stream);
            let packet = transport.read_packet().unwrap();
            transport.write_packet(&packet).unwrap();
        });

        let transport = TcpTransport::new(TcpStream::connect(addr).unwrap());
        let payload: Vec<u8> = (0..=255).cycle().take(2000).map(|b: u16| b as u8).collect();
        transport.write_packet(&payload).unwrap();
        assert_eq!(transport.read_packet().unwrap(), payload);
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_reader_reassembles_split_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // One frame, delivered byte by byte.
            let body = b"split across many writes";
            let mut frame = (body.len() as u16).to_be_bytes().to_vec();
            frame.extend_from_slice(body);
            for byte in frame {
                stream.write_all(&[byte]).unwrap();
                stream.flush().unwrap();
            }
        });

        let transport = TcpTransport::new(TcpStream::connect(addr).unwrap());
        assert_eq!(
            transport.read_packet().unwrap(),
            b"split across many writes"
        );
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_eof_is_transport_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // Write half a header, then close.
            (&stream).write_all(&[0x00]).unwrap();
            drop(stream);
        });

        let transport = TcpTransport::new(TcpStream::connect(addr).unwrap());
        let err = transport.read_packet().unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
        server.join().unwrap();
    }

    #[test]
    fn test_udp_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.connect(server_addr).unwrap();
        let client_addr = client.local_addr().unwrap();

        let transport = UdpTransport::new(client);
        transport.write_packet(b"datagram").unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"datagram");
        assert_eq!(from, client_addr);

        server.send_to(b"reply", from).unwrap();
        assert_eq!(transport.read_packet().unwrap(), b"reply");
    }

    #[test]
    fn test_oversized_stream_frame_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = thread::spawn(move || {
            let _ = listener.accept();
        });
        let transport = TcpTransport::new(TcpStream::connect(addr).unwrap());
        assert!(transport.write_packet(&vec![0u8; 70_000]).is_err());
    }
}
