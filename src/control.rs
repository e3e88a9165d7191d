//! Control-channel messages: hard reset, the key-method 2 exchange, and
//! push request/reply.
//!
//! Everything here is carried inside the reliability layer; the key-method
//! 2 message additionally travels under TLS.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::protocol::{Opcode, Packet};
use crate::session::{KeySource, Session, SessionId};

const KEY_METHOD: u8 = 2;
const CONTROL_MESSAGE_MAGIC: [u8; 4] = [0, 0, 0, 0];
const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\x00";
const PUSH_REPLY_PREFIX: &[u8] = b"PUSH_REPLY";
const AUTH_FAILED_PREFIX: &[u8] = b"AUTH_FAILED";

/// Build the initial hard-reset packet. Consumes control packet-id 0.
pub fn hard_reset_client(session: &Session) -> Packet {
    Packet::control(
        Opcode::ControlHardResetClientV2,
        session.local_key_id(),
        session.local_session_id(),
        Vec::new(),
        None,
        session.next_control_packet_id(),
        Vec::new(),
    )
}

/// Extract the server's session id and control packet-id from its
/// hard-reset response.
pub fn parse_hard_reset_server(packet: &Packet) -> Result<(SessionId, u32)> {
    if packet.opcode != Opcode::ControlHardResetServerV2 {
        return Err(Error::handshake(format!(
            "expected hard-reset response, got {:?}",
            packet.opcode
        )));
    }
    Ok((packet.local_session_id, packet.packet_id))
}

/// Build the key-method 2 control message carrying our key source,
/// the advertised options string, and optional credentials.
pub fn build_control_message(session: &Session, options: &Options) -> Result<Vec<u8>> {
    let key = session.active_key()?;

    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(&CONTROL_MESSAGE_MAGIC);
    buf.put_u8(KEY_METHOD);
    buf.put_slice(&key.local.pre_master);
    buf.put_slice(&key.local.random1);
    buf.put_slice(&key.local.random2);
    put_cstring(&mut buf, &options.advertised());
    if let (Some(user), Some(pass)) = (&options.username, &options.password) {
        put_cstring(&mut buf, user);
        put_cstring(&mut buf, pass);
    }
    Ok(buf.to_vec())
}

/// Check for the key-method 2 null header.
pub fn is_control_message(data: &[u8]) -> bool {
    data.len() > 5 && data[..4] == CONTROL_MESSAGE_MAGIC && data[4] == KEY_METHOD
}

/// Parse the server's key-method 2 reply: its key source (no pre-master)
/// and its options string.
pub fn parse_control_message(data: &[u8]) -> Result<(KeySource, String)> {
    if !is_control_message(data) {
        return Err(Error::control("expected null header and key-method 2"));
    }
    let mut buf = &data[5..];
    if buf.remaining() < 64 {
        return Err(Error::control("truncated remote key source"));
    }
    let mut random1 = [0u8; 32];
    let mut random2 = [0u8; 32];
    buf.copy_to_slice(&mut random1);
    buf.copy_to_slice(&mut random2);
    let options = get_cstring(&mut buf)?;
    Ok((KeySource::from_remote(random1, random2), options))
}

/// The literal push-request message.
pub fn push_request() -> &'static [u8] {
    PUSH_REQUEST
}

pub fn is_push_reply(data: &[u8]) -> bool {
    data.starts_with(PUSH_REPLY_PREFIX)
}

pub fn is_auth_failed(data: &[u8]) -> bool {
    data.starts_with(AUTH_FAILED_PREFIX)
}

/// Parse a push reply into the assigned tunnel IP (the first `ifconfig`
/// argument) and the full list of pushed options.
pub fn parse_push_reply(data: &[u8]) -> Result<(Ipv4Addr, Vec<String>)> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::control("push reply is not valid UTF-8"))?
        .trim_end_matches(['\0', '\n', '\r']);
    let body = text
        .strip_prefix("PUSH_REPLY,")
        .ok_or_else(|| Error::control("expected push reply"))?;

    let pushed: Vec<String> = body.split(',').map(str::to_string).collect();
    for option in &pushed {
        let mut parts = option.split_whitespace();
        if parts.next() == Some("ifconfig") {
            let ip = parts
                .next()
                .ok_or_else(|| Error::control("ifconfig without address"))?
                .parse::<Ipv4Addr>()
                .map_err(|_| Error::control("unparseable ifconfig address"))?;
            return Ok((ip, pushed));
        }
    }
    Err(Error::control("push reply carried no ifconfig"))
}

/// Append a length-prefixed NUL-terminated string; the NUL is counted in
/// the length.
fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16 + 1);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_cstring(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::control("missing string length"));
    }
    let len = buf.get_u16() as usize;
    if len == 0 || buf.remaining() < len {
        return Err(Error::control("truncated string"));
    }
    let mut raw = buf[..len].to_vec();
    buf.advance(len);
    if raw.last() == Some(&0) {
        raw.pop();
    }
    String::from_utf8(raw).map_err(|_| Error::control("string is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_auth() -> Options {
        Options {
            remote: "vpn.test".into(),
            ca: b"pem".to_vec(),
            username: Some("alice".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_hard_reset_client_shape() {
        let session = Session::new();
        let packet = hard_reset_client(&session);
        assert_eq!(packet.opcode, Opcode::ControlHardResetClientV2);
        assert_eq!(packet.packet_id, 0);
        assert!(packet.payload.is_empty());
        assert_eq!(packet.local_session_id, session.local_session_id());
    }

    #[test]
    fn test_parse_hard_reset_server() {
        let sid = SessionId::from_bytes([7; 8]);
        let packet = Packet::control(
            Opcode::ControlHardResetServerV2,
            0,
            sid,
            vec![0],
            Some(SessionId::from_bytes([1; 8])),
            3,
            Vec::new(),
        );
        let (remote, packet_id) = parse_hard_reset_server(&packet).unwrap();
        assert_eq!(remote, sid);
        assert_eq!(packet_id, 3);

        let wrong = Packet::data(0, Vec::new());
        assert!(parse_hard_reset_server(&wrong).is_err());
    }

    #[test]
    fn test_control_message_layout() {
        let session = Session::new();
        let options = options_with_auth();
        let msg = build_control_message(&session, &options).unwrap();

        assert!(is_control_message(&msg));
        assert_eq!(&msg[..4], &[0, 0, 0, 0]);
        assert_eq!(msg[4], 2);

        let key = session.active_key().unwrap();
        assert_eq!(&msg[5..53], &key.local.pre_master);
        assert_eq!(&msg[53..85], &key.local.random1);
        assert_eq!(&msg[85..117], &key.local.random2);

        // Options string, then username, then password, all NUL-terminated
        // with the NUL counted in the length prefix.
        let mut rest = &msg[117..];
        let advertised = get_cstring(&mut rest).unwrap();
        assert_eq!(advertised, options.advertised());
        assert_eq!(get_cstring(&mut rest).unwrap(), "alice");
        assert_eq!(get_cstring(&mut rest).unwrap(), "hunter2");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_control_message_without_credentials() {
        let session = Session::new();
        let options = Options {
            remote: "vpn.test".into(),
            ca: b"pem".to_vec(),
            cert: Some(b"pem".to_vec()),
            key: Some(b"pem".to_vec()),
            ..Default::default()
        };
        let msg = build_control_message(&session, &options).unwrap();
        let mut rest = &msg[117..];
        get_cstring(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_server_control_message() {
        // Server replies with randoms only, no pre-master.
        let mut msg = BytesMut::new();
        msg.put_slice(&[0, 0, 0, 0, 2]);
        msg.put_slice(&[0x11; 32]);
        msg.put_slice(&[0x22; 32]);
        put_cstring(&mut msg, "V4,dev-type tun,cipher AES-256-GCM");

        let (key, options) = parse_control_message(&msg).unwrap();
        assert_eq!(key.random1, [0x11; 32]);
        assert_eq!(key.random2, [0x22; 32]);
        assert_eq!(key.pre_master, [0u8; 48]);
        assert_eq!(options, "V4,dev-type tun,cipher AES-256-GCM");
    }

    #[test]
    fn test_parse_control_message_rejects_bad_magic() {
        let mut msg = vec![0, 0, 0, 1, 2];
        msg.extend_from_slice(&[0; 70]);
        assert!(parse_control_message(&msg).is_err());
    }

    #[test]
    fn test_push_reply_parsing() {
        let reply = b"PUSH_REPLY,route-gateway 10.8.0.1,ifconfig 10.8.0.6 10.8.0.1,ping 10\x00";
        let (ip, pushed) = parse_push_reply(reply).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 8, 0, 6));
        assert_eq!(pushed.len(), 3);
        assert_eq!(pushed[0], "route-gateway 10.8.0.1");
    }

    #[test]
    fn test_push_reply_requires_ifconfig() {
        let err = parse_push_reply(b"PUSH_REPLY,ping 10\x00").unwrap_err();
        assert!(matches!(err, Error::BadControlMessage(_)));
    }

    #[test]
    fn test_auth_failed_detection() {
        assert!(is_auth_failed(b"AUTH_FAILED"));
        assert!(is_auth_failed(b"AUTH_FAILED,bad credentials\x00"));
        assert!(!is_auth_failed(b"PUSH_REPLY,ifconfig 1.2.3.4 5.6.7.8"));
    }

    #[test]
    fn test_push_request_is_nul_terminated() {
        assert_eq!(push_request(), b"PUSH_REQUEST\x00");
    }
}
