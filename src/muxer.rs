//! The VPN transport multiplexer.
//!
//! One component interleaves the two logical channels onto the wire: the
//! reliable control sub-channel (hard reset, TLS, key exchange, push) and
//! the unreliable data channel. Processing of incoming packets is driven by
//! reads from the user of the tunnel; there is no background task. If no
//! reads happen for a while, control packets from the server (for example
//! pings) sit unacknowledged until the next read.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::ClientConnection;
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::control;
use crate::data::{DataChannel, Role};
use crate::error::{Error, Result};
use crate::protocol::{Opcode, Packet, MAX_CONTROL_PAYLOAD, PING_MAGIC};
use crate::reliability::{Accept, Reliability, RetransmitConfig};
use crate::session::Session;
use crate::tls::{self, ControlStream};
use crate::transport::{dial, Transport};

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Fresh,
    ResetSent,
    TlsHandshaking,
    AuthSent,
    KeysDerived,
    PushSent,
    Ready,
    Failed,
}

/// Parameters pushed by the server, read-only once populated.
#[derive(Debug, Clone)]
pub struct Tunnel {
    /// The address assigned by the server's `ifconfig` push.
    pub ip: Ipv4Addr,
    /// Every pushed option, verbatim.
    pub options: Vec<String>,
}

/// Data-phase drop counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataStats {
    pub replay_drops: u64,
    pub auth_failures: u64,
}

/// What became of one pulled packet.
pub(crate) enum Dispatch {
    /// Consumed internally (ACK bookkeeping, duplicate, buffered, dropped).
    None,
    /// The server's hard reset was accepted.
    ResetSeen,
    /// An in-order control payload is now readable.
    Control,
    /// A decrypted data payload.
    Data(Vec<u8>),
}

/// State shared between the reader half, the writer half, and the TLS
/// adapter. The transport write path and the id counters serialize
/// internally, so one reader and one writer may run concurrently.
pub(crate) struct MuxerShared {
    transport: Box<dyn Transport>,
    session: Session,
    reliable: Mutex<Reliability>,
    data: DataChannel,
    options: Options,
    tunnel: Mutex<Option<Tunnel>>,
}

impl MuxerShared {
    /// Send a control payload, chunked into CONTROL_V1 packets and retained
    /// for retransmission.
    pub(crate) fn send_control(&self, payload: &[u8]) -> Result<()> {
        let remote = self.session.remote_session_id();
        for chunk in payload.chunks(MAX_CONTROL_PAYLOAD) {
            let packet_id = self.session.next_control_packet_id();
            let packet = Packet::control(
                Opcode::ControlV1,
                self.session.local_key_id(),
                self.session.local_session_id(),
                Vec::new(),
                remote,
                packet_id,
                chunk.to_vec(),
            );
            let wire = packet.to_bytes();
            self.transport.write_packet(&wire)?;
            self.reliable.lock().unwrap().track(packet_id, wire);
        }
        Ok(())
    }

    /// Copy buffered in-order control bytes out for the TLS adapter.
    pub(crate) fn take_control_bytes(&self, buf: &mut [u8]) -> usize {
        self.reliable.lock().unwrap().take_ready(buf)
    }

    /// Pull and dispatch one packet from the transport. A read timeout runs
    /// the retransmit timer instead of surfacing, as long as the handshake
    /// is in progress or unacknowledged control packets remain.
    pub(crate) fn pump_once(&self) -> Result<Dispatch> {
        {
            let reliable = self.reliable.lock().unwrap();
            if reliable.in_handshake() || reliable.has_pending() {
                if let Some(timeout) = reliable.next_timeout(Instant::now()) {
                    self.transport.set_read_timeout(Some(timeout))?;
                }
            }
        }
        match self.transport.read_packet() {
            Ok(raw) => self.dispatch(&raw),
            Err(e) if e.is_timeout() => {
                let mut reliable = self.reliable.lock().unwrap();
                if reliable.in_handshake() || reliable.has_pending() {
                    reliable.retransmit_due(&*self.transport)?;
                    Ok(Dispatch::None)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn dispatch(&self, raw: &[u8]) -> Result<Dispatch> {
        let packet = Packet::parse(raw)?;
        if !packet.acks.is_empty() {
            self.reliable.lock().unwrap().handle_acks(&packet.acks);
        }
        match packet.opcode {
            Opcode::AckV1 => Ok(Dispatch::None),
            Opcode::ControlHardResetServerV2 => self.handle_hard_reset(&packet),
            Opcode::ControlV1 => self.handle_control(&packet),
            Opcode::ControlHardResetClientV2 => {
                warn!("peer sent a client hard reset, ignoring");
                Ok(Dispatch::None)
            }
            Opcode::DataV1 => self.handle_data(&packet),
        }
    }

    fn handle_hard_reset(&self, packet: &Packet) -> Result<Dispatch> {
        let (sid, packet_id) = control::parse_hard_reset_server(packet)?;
        match self.session.remote_session_id() {
            None => {
                self.session.set_remote_session_id(sid)?;
                {
                    let mut reliable = self.reliable.lock().unwrap();
                    // The response implicitly answers our reset; server
                    // control ids continue from the reset's id.
                    reliable.start_at(packet_id + 1);
                    reliable.forget(0);
                }
                // Echo the server's actual packet id.
                self.send_ack(vec![packet_id])?;
                Ok(Dispatch::ResetSeen)
            }
            Some(existing) if existing == sid => {
                // Retransmitted reset: our ACK was lost, answer it again.
                self.send_ack(vec![packet_id])?;
                Ok(Dispatch::None)
            }
            Some(_) => {
                warn!("hard reset with mismatched session id, ignoring");
                Ok(Dispatch::None)
            }
        }
    }

    fn handle_control(&self, packet: &Packet) -> Result<Dispatch> {
        let Some(expected) = self.session.remote_session_id() else {
            warn!("control packet before hard-reset exchange, ignoring");
            return Ok(Dispatch::None);
        };
        if packet.local_session_id != expected {
            warn!("control packet with unknown session id, ignoring");
            return Ok(Dispatch::None);
        }
        // Every accepted or duplicate control packet is acknowledged right
        // away; duplicates are then discarded by the reliability layer.
        self.send_ack(vec![packet.packet_id])?;
        let accepted = self
            .reliable
            .lock()
            .unwrap()
            .accept(packet.packet_id, packet.payload.clone());
        match accepted {
            Accept::Delivered => Ok(Dispatch::Control),
            _ => Ok(Dispatch::None),
        }
    }

    fn handle_data(&self, packet: &Packet) -> Result<Dispatch> {
        if !self.data.ready() {
            warn!("data packet before key negotiation, dropping");
            return Ok(Dispatch::None);
        }
        match self.data.read_packet(packet) {
            Ok(plaintext) if plaintext.as_slice() == PING_MAGIC.as_slice() => {
                debug!("openvpn ping, sending reply");
                self.data.write_packet(&*self.transport, &PING_MAGIC)?;
                Ok(Dispatch::None)
            }
            Ok(plaintext) => Ok(Dispatch::Data(plaintext)),
            Err(Error::Replay) => {
                warn!(drops = self.data.replay_drops(), "dropping replayed data packet");
                Ok(Dispatch::None)
            }
            Err(Error::BadAuthentication) => {
                warn!(
                    failures = self.data.auth_failures(),
                    "dropping unauthenticated data packet"
                );
                Ok(Dispatch::None)
            }
            Err(e) => Err(e),
        }
    }

    fn send_ack(&self, acks: Vec<u32>) -> Result<()> {
        let remote = self
            .session
            .remote_session_id()
            .ok_or_else(|| Error::handshake("no remote session id to acknowledge"))?;
        let packet = Packet::ack(
            self.session.local_key_id(),
            self.session.local_session_id(),
            acks,
            remote,
        );
        self.transport.write_packet(&packet.to_bytes())
    }
}

struct TlsLink {
    conn: ClientConnection,
    stream: ControlStream,
}

impl TlsLink {
    fn write_message(&mut self, data: &[u8]) -> Result<()> {
        let mut stream = rustls::Stream::new(&mut self.conn, &mut self.stream);
        stream.write_all(data).map_err(Error::from_tls_io)
    }

    fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 4096];
        let mut stream = rustls::Stream::new(&mut self.conn, &mut self.stream);
        let n = stream.read(&mut buf).map_err(Error::from_tls_io)?;
        if n == 0 {
            return Err(Error::TransportClosed);
        }
        buf.truncate(n);
        Ok(buf)
    }
}

/// The multiplexer and tunnel endpoint.
///
/// `handshake` runs the session to `Ready`; after that `read`/`write` carry
/// payload through the data channel. `split` yields one reader half and one
/// writer half that may be used from two threads.
pub struct Muxer {
    shared: Arc<MuxerShared>,
    tls: Option<TlsLink>,
    state: MuxState,
    read_buf: VecDeque<u8>,
}

impl Muxer {
    /// Dial the configured remote and wrap it in a muxer.
    pub fn connect(options: Options) -> Result<Self> {
        options.validate()?;
        let transport = dial(&options)?;
        Self::new(transport, options)
    }

    /// Wrap an already-connected transport.
    pub fn new(transport: Box<dyn Transport>, options: Options) -> Result<Self> {
        options.validate()?;
        let data = DataChannel::new(&options, 0, Role::Client);
        let reliable = Reliability::new(RetransmitConfig::from(&options));
        Ok(Self {
            shared: Arc::new(MuxerShared {
                transport,
                session: Session::new(),
                reliable: Mutex::new(reliable),
                data,
                options,
                tunnel: Mutex::new(None),
            }),
            tls: None,
            state: MuxState::Fresh,
            read_buf: VecDeque::new(),
        })
    }

    pub fn state(&self) -> MuxState {
        self.state
    }

    /// Server-pushed tunnel parameters, available once ready.
    pub fn tunnel(&self) -> Option<Tunnel> {
        self.shared.tunnel.lock().unwrap().clone()
    }

    pub fn stats(&self) -> DataStats {
        DataStats {
            replay_drops: self.shared.data.replay_drops(),
            auth_failures: self.shared.data.auth_failures(),
        }
    }

    /// Forward a read deadline to the transport. Only meaningful once the
    /// handshake is done; during the handshake the retransmit timer owns
    /// the socket timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.shared.transport.set_read_timeout(timeout)
    }

    /// Perform the OpenVPN handshake operations serially: hard reset, TLS,
    /// key exchange, key derivation, push. Returns once the session is
    /// ready, or with the first error raised underneath.
    pub fn handshake(&mut self) -> Result<()> {
        match self.run_handshake() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = MuxState::Failed;
                let _ = self.shared.transport.close();
                Err(match e {
                    e if e.is_timeout() => Error::HandshakeTimeout,
                    e => e,
                })
            }
        }
    }

    fn run_handshake(&mut self) -> Result<()> {
        if self.state != MuxState::Fresh {
            return Err(Error::handshake("handshake already performed"));
        }
        let shared = self.shared.clone();
        let deadline = Instant::now() + shared.options.handshake_deadline;
        shared.reliable.lock().unwrap().set_deadline(Some(deadline));

        // 1. Hard reset: exchange session ids.
        let packet = control::hard_reset_client(&shared.session);
        let wire = packet.to_bytes();
        shared.transport.write_packet(&wire)?;
        shared
            .reliable
            .lock()
            .unwrap()
            .track(packet.packet_id, wire);
        self.state = MuxState::ResetSent;

        let remote_sid = loop {
            if let Some(sid) = shared.session.remote_session_id() {
                break sid;
            }
            shared.pump_once()?;
        };
        info!(
            local = %shared.session.local_session_id(),
            remote = %remote_sid,
            "session ids exchanged"
        );

        // 2. TLS handshake over the reliability layer.
        self.state = MuxState::TlsHandshaking;
        let config = tls::client_config(&shared.options)?;
        let name = tls::server_name(&shared.options)?;
        let conn = ClientConnection::new(Arc::new(config), name)?;
        let mut link = TlsLink {
            conn,
            stream: ControlStream::new(shared.clone()),
        };
        while link.conn.is_handshaking() {
            link.conn
                .complete_io(&mut link.stream)
                .map_err(Error::from_tls_io)?;
        }
        info!("TLS handshake done");

        // 3. Key-method 2 exchange.
        self.state = MuxState::AuthSent;
        let message = control::build_control_message(&shared.session, &shared.options)?;
        link.write_message(&message)?;
        let (remote_key, remote_options) = loop {
            let reply = link.read_message()?;
            if control::is_auth_failed(&reply) {
                return Err(Error::AuthFailed);
            }
            if control::is_control_message(&reply) {
                break control::parse_control_message(&reply)?;
            }
            debug!(len = reply.len(), "ignoring unexpected control payload");
        };
        debug!(options = %remote_options, "remote options");
        shared.session.add_remote_key(remote_key)?;

        // 4. Key schedule.
        self.state = MuxState::KeysDerived;
        let key = shared.session.active_key()?;
        shared
            .data
            .setup_keys(&key, shared.session.local_session_id(), remote_sid)?;
        info!(cipher = shared.options.cipher.name(), "data channel keys derived");

        // 5. Push exchange: learn the assigned tunnel address.
        self.state = MuxState::PushSent;
        link.write_message(control::push_request())?;
        let (ip, pushed) = loop {
            let reply = link.read_message()?;
            if control::is_auth_failed(&reply) {
                return Err(Error::AuthFailed);
            }
            if control::is_push_reply(&reply) {
                break control::parse_push_reply(&reply)?;
            }
            debug!("still waiting for push reply");
        };
        for option in &pushed {
            if !option.starts_with("ifconfig") {
                debug!(option = %option, "discarding pushed option");
            }
        }
        *shared.tunnel.lock().unwrap() = Some(Tunnel {
            ip,
            options: pushed,
        });
        info!(%ip, "tunnel established");

        // Ready: the TLS adapter goes drain-only, the retransmit deadline
        // clears, and the socket timeout returns to the caller's hands.
        link.stream.drain_only = true;
        self.tls = Some(link);
        shared.reliable.lock().unwrap().set_deadline(None);
        shared.transport.set_read_timeout(None)?;
        self.state = MuxState::Ready;
        Ok(())
    }

    /// Read decrypted payload, pulling packets from the transport and
    /// dispatching interleaved control traffic until data arrives.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state != MuxState::Ready {
            return Err(Error::handshake("tunnel is not ready"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        while self.read_buf.is_empty() {
            match self.shared.pump_once() {
                Ok(Dispatch::Data(plaintext)) => self.read_buf.extend(plaintext),
                Ok(Dispatch::Control) => self.drain_tls(),
                Ok(_) => {}
                Err(Error::TransportClosed) => {
                    self.state = MuxState::Failed;
                    return Err(Error::TransportClosed);
                }
                Err(e) => return Err(e),
            }
        }
        let n = buf.len().min(self.read_buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.read_buf.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    /// Send payload through the data channel.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.state != MuxState::Ready {
            return Err(Error::handshake("tunnel is not ready"));
        }
        self.shared.data.write_packet(&*self.shared.transport, buf)
    }

    /// Post-handshake control messages arrive through the reliability
    /// layer; decrypt and log them without pulling more packets.
    fn drain_tls(&mut self) {
        let Some(link) = self.tls.as_mut() else {
            return;
        };
        let mut buf = [0u8; 2048];
        let mut stream = rustls::Stream::new(&mut link.conn, &mut link.stream);
        match stream.read(&mut buf) {
            Ok(n) if n > 0 => {
                info!(
                    message = %String::from_utf8_lossy(&buf[..n]),
                    "control channel message after handshake"
                );
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("control channel drain failed: {e}"),
        }
    }

    /// Split into one reader half and one writer half sharing the session.
    pub fn split(self) -> (TunnelReader, TunnelWriter) {
        let shared = self.shared.clone();
        (TunnelReader { muxer: self }, TunnelWriter { shared })
    }
}

impl Read for Muxer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Muxer::read(self, buf).map_err(Error::into_io)
    }
}

impl Write for Muxer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Muxer::write(self, buf).map_err(Error::into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The reading half of a split tunnel. Owns the protocol pump.
pub struct TunnelReader {
    muxer: Muxer,
}

impl TunnelReader {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.muxer.read(buf)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.muxer.set_read_timeout(timeout)
    }

    pub fn tunnel(&self) -> Option<Tunnel> {
        self.muxer.tunnel()
    }

    pub fn stats(&self) -> DataStats {
        self.muxer.stats()
    }
}

impl Read for TunnelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.muxer.read(buf).map_err(Error::into_io)
    }
}

/// The writing half of a split tunnel.
pub struct TunnelWriter {
    shared: Arc<MuxerShared>,
}

impl TunnelWriter {
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.shared.data.write_packet(&*self.shared.transport, buf)
    }
}

impl Write for TunnelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TunnelWriter::write(self, buf).map_err(Error::into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
