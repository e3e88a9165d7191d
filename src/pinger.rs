//! ICMP echo measurements through the tunnel.
//!
//! The tunnel carries raw IPv4 packets, so the pinger crafts its own
//! IPv4+ICMP echo requests, matches replies by identifier and sequence
//! number, and reports per-reply round-trip times plus a closing summary.

use std::fmt;
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::Result;
use crate::muxer::{TunnelReader, TunnelWriter};

const IPV4_HEADER_LEN: usize = 20;
const ICMP_HEADER_LEN: usize = 8;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ECHO_PAYLOAD: &[u8; 8] = b"ovpnc\0\0\0";

/// Final ping statistics.
#[derive(Debug, Clone)]
pub struct PingSummary {
    pub target: Ipv4Addr,
    pub sent: u32,
    pub received: u32,
    pub loss_pct: f64,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub stddev_ms: f64,
}

impl fmt::Display for PingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- {} ping statistics ---", self.target)?;
        writeln!(
            f,
            "{} packets transmitted, {} received, {:.1}% packet loss",
            self.sent, self.received, self.loss_pct
        )?;
        write!(
            f,
            "rtt min/avg/max/stdev = {:.3}/{:.3}/{:.3}/{:.3} ms",
            self.min_ms, self.avg_ms, self.max_ms, self.stddev_ms
        )
    }
}

struct EchoReply {
    seq: u16,
    ttl: u8,
    source: Ipv4Addr,
}

/// Sends `count` echo requests through the tunnel, one per interval.
pub struct Pinger {
    reader: TunnelReader,
    writer: TunnelWriter,
    source: Ipv4Addr,
    target: Ipv4Addr,
    count: u32,
    interval: Duration,
    id: u16,
    ttl: u8,
}

impl Pinger {
    pub fn new(
        reader: TunnelReader,
        writer: TunnelWriter,
        source: Ipv4Addr,
        target: Ipv4Addr,
        count: u32,
    ) -> Self {
        let id = u16::from_be_bytes(crate::crypto::random_bytes());
        Self {
            reader,
            writer,
            source,
            target,
            count,
            interval: Duration::from_secs(1),
            id,
            ttl: 64,
        }
    }

    /// Run the measurement series and return the summary.
    pub fn run(&mut self) -> Result<PingSummary> {
        let mut rtts: Vec<f64> = Vec::with_capacity(self.count as usize);
        let mut sent = 0u32;

        for seq in 0..self.count {
            let request = build_icmp_packet(
                ICMP_ECHO_REQUEST,
                self.source,
                self.target,
                self.id,
                seq as u16,
                self.ttl,
            );
            self.writer.write(&request)?;
            sent += 1;
            let started = Instant::now();

            match self.await_reply(seq as u16, started)? {
                Some((rtt_ms, ttl)) => {
                    info!(
                        "reply from {}: icmp_seq={} ttl={} time={:.1} ms",
                        self.target, seq, ttl, rtt_ms
                    );
                    rtts.push(rtt_ms);
                }
                None => debug!(seq, "echo reply timed out"),
            }

            if seq + 1 < self.count {
                let elapsed = started.elapsed();
                if elapsed < self.interval {
                    thread::sleep(self.interval - elapsed);
                }
            }
        }

        Ok(summarize(self.target, sent, &rtts))
    }

    fn await_reply(&mut self, seq: u16, started: Instant) -> Result<Option<(f64, u8)>> {
        let deadline = started + self.interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.reader.set_read_timeout(Some(deadline - now))?;

            let mut buf = [0u8; 2048];
            let n = match self.reader.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.is_timeout() => return Ok(None),
                Err(e) => return Err(e),
            };
            if let Some(reply) = parse_echo_reply(&buf[..n], self.id) {
                if reply.seq == seq && reply.source == self.target {
                    let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
                    return Ok(Some((rtt_ms, reply.ttl)));
                }
                debug!(seq = reply.seq, "echo reply for a different probe");
            }
        }
    }

}

fn summarize(target: Ipv4Addr, sent: u32, rtts: &[f64]) -> PingSummary {
    let received = rtts.len() as u32;
    let loss_pct = if sent == 0 {
        0.0
    } else {
        100.0 * (1.0 - received as f64 / sent as f64)
    };
    let (min, max, avg) = if rtts.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let min = rtts.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = rtts.iter().cloned().fold(0.0, f64::max);
        let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
        (min, max, avg)
    };
    let stddev = if rtts.is_empty() {
        0.0
    } else {
        let variance = rtts.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / rtts.len() as f64;
        variance.sqrt()
    };
    PingSummary {
        target,
        sent,
        received,
        loss_pct,
        min_ms: min,
        avg_ms: avg,
        max_ms: max,
        stddev_ms: stddev,
    }
}

/// RFC 1071 ones'-complement checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build a complete IPv4+ICMP echo packet.
fn build_icmp_packet(
    icmp_type: u8,
    source: Ipv4Addr,
    dest: Ipv4Addr,
    id: u16,
    seq: u16,
    ttl: u8,
) -> Vec<u8> {
    let total_len = IPV4_HEADER_LEN + ICMP_HEADER_LEN + ECHO_PAYLOAD.len();
    let mut packet = vec![0u8; total_len];

    packet[0] = 0x45; // version 4, header length 5 words
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[4..6].copy_from_slice(&id.to_be_bytes());
    packet[8] = ttl;
    packet[9] = 1; // ICMP
    packet[12..16].copy_from_slice(&source.octets());
    packet[16..20].copy_from_slice(&dest.octets());
    let header_sum = checksum(&packet[..IPV4_HEADER_LEN]);
    packet[10..12].copy_from_slice(&header_sum.to_be_bytes());

    let icmp = &mut packet[IPV4_HEADER_LEN..];
    icmp[0] = icmp_type;
    icmp[4..6].copy_from_slice(&id.to_be_bytes());
    icmp[6..8].copy_from_slice(&seq.to_be_bytes());
    icmp[ICMP_HEADER_LEN..].copy_from_slice(ECHO_PAYLOAD);
    let icmp_sum = checksum(icmp);
    packet[IPV4_HEADER_LEN + 2..IPV4_HEADER_LEN + 4].copy_from_slice(&icmp_sum.to_be_bytes());

    packet
}

/// Parse an echo reply addressed to our identifier out of a raw IPv4
/// packet, if that is what it is.
fn parse_echo_reply(packet: &[u8], id: u16) -> Option<EchoReply> {
    if packet.len() < IPV4_HEADER_LEN || packet[0] >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(packet[0] & 0x0f) * 4;
    if packet[9] != 1 || packet.len() < header_len + ICMP_HEADER_LEN {
        return None;
    }
    let icmp = &packet[header_len..];
    if icmp[0] != ICMP_ECHO_REPLY || icmp[1] != 0 {
        return None;
    }
    if u16::from_be_bytes([icmp[4], icmp[5]]) != id {
        return None;
    }
    Some(EchoReply {
        seq: u16::from_be_bytes([icmp[6], icmp[7]]),
        ttl: packet[8],
        source: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_reference() {
        // The worked example from RFC 1071.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), 0x220d);
    }

    #[test]
    fn test_checksum_odd_length() {
        // Trailing byte is padded with zero.
        assert_eq!(checksum(&[0xff]), !0xff00);
    }

    #[test]
    fn test_echo_packet_parses_back() {
        let src = Ipv4Addr::new(10, 8, 0, 6);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        // A reply travels dst -> src with type 0.
        let reply = build_icmp_packet(ICMP_ECHO_REPLY, dst, src, 0x1234, 7, 57);

        let parsed = parse_echo_reply(&reply, 0x1234).unwrap();
        assert_eq!(parsed.seq, 7);
        assert_eq!(parsed.ttl, 57);
        assert_eq!(parsed.source, dst);

        // Wrong identifier: not ours.
        assert!(parse_echo_reply(&reply, 0x4321).is_none());
    }

    #[test]
    fn test_echo_request_is_not_a_reply() {
        let src = Ipv4Addr::new(10, 8, 0, 6);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        let request = build_icmp_packet(ICMP_ECHO_REQUEST, src, dst, 1, 0, 64);
        assert!(parse_echo_reply(&request, 1).is_none());
    }

    #[test]
    fn test_loss_percentage_is_fractional() {
        // 1 of 3 lost is 33.3%, not the 0% integer division would give.
        let summary = summarize(Ipv4Addr::new(8, 8, 8, 8), 3, &[1.0, 2.0]);
        assert!((summary.loss_pct - 100.0 / 3.0).abs() < 0.01);
        assert_eq!(summary.received, 2);

        let clean = summarize(Ipv4Addr::new(8, 8, 8, 8), 3, &[1.0, 2.0, 3.0]);
        assert_eq!(clean.loss_pct, 0.0);
        assert_eq!(clean.avg_ms, 2.0);
        assert_eq!(clean.min_ms, 1.0);
        assert_eq!(clean.max_ms, 3.0);
    }

    #[test]
    fn test_ipv4_header_checksum_validates() {
        let packet = build_icmp_packet(
            ICMP_ECHO_REQUEST,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            9,
            1,
            64,
        );
        // Re-summing a header that includes its checksum yields zero.
        assert_eq!(checksum(&packet[..IPV4_HEADER_LEN]), 0);
        assert_eq!(checksum(&packet[IPV4_HEADER_LEN..]), 0);
    }
}
