//! Network timing sources: DNS query and TCP handshake round-trip jitter.
//!
//! Each round trip traverses switch queues, router buffers, resolver load
//! and NIC interrupt coalescing across dozens of independent physical
//! systems. The low byte of the measured RTT is environmental randomness.
//!
//! Both sources degrade to an empty (or truncated) sample when the network
//! is unreachable: a rotation that produces no successful round trips ends
//! the sample immediately rather than grinding through timeouts.

use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::capability::HostCapabilities;
use crate::conditioning::wall_clock_ns;
use crate::sources::{bound_sample, elapsed_ns, EntropySource, Lcg, SourceCategory};

/// Public recursive resolvers queried in rotation.
const RESOLVERS: &[&str] = &["8.8.8.8", "1.1.1.1", "9.9.9.9"];

/// Hostnames resolved in rotation. Stable, heavily anycast names keep the
/// query path short while the jitter stays.
const HOSTNAMES: &[&str] = &["example.com", "google.com", "github.com"];

/// TCP targets: the same resolvers' DNS-over-TCP listeners.
const TCP_TARGETS: &[(&str, u16)] = &[("8.8.8.8", 53), ("1.1.1.1", 53), ("9.9.9.9", 53)];

const QUERY_TIMEOUT: Duration = Duration::from_millis(500);

/// Minimal DNS A-record query packet.
fn build_query(host: &str, txn_id: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(12 + host.len() + 6);
    packet.extend_from_slice(&txn_id.to_be_bytes());
    // Flags: standard query, recursion desired. QDCOUNT = 1.
    packet.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in host.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]);
    packet
}

/// Entropy from DNS query round-trip timing.
pub struct DnsTimingSource;

impl DnsTimingSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// One query round trip; `None` when the resolver did not answer.
    fn query(host: &str, server: &str, txn_id: u16) -> Option<u64> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
        socket.set_read_timeout(Some(QUERY_TIMEOUT)).ok()?;
        let packet = build_query(host, txn_id);
        let mut response = [0u8; 512];

        let start = Instant::now();
        socket.send_to(&packet, (server, 53)).ok()?;
        socket.recv_from(&mut response).ok()?;
        Some(elapsed_ns(start))
    }
}

impl Default for DnsTimingSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for DnsTimingSource {
    fn name(&self) -> &'static str {
        "dns_timing"
    }

    fn description(&self) -> &'static str {
        "DNS query round-trip timing jitter"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Network
    }

    fn estimated_rate_bps(&self) -> f64 {
        100.0
    }

    fn physics(&self) -> Option<&'static str> {
        Some(
            "Each UDP query crosses physical links whose latency fluctuates \
             with queuing, congestion and resolver load. Nanosecond-level RTT \
             variation is genuine environmental noise.",
        )
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        // Route check only; actual reachability is decided per sample.
        UdpSocket::bind(("0.0.0.0", 0))
            .and_then(|s| s.connect(("8.8.8.8", 53)))
            .is_ok()
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let rotation = RESOLVERS.len() * HOSTNAMES.len();
        let rounds = (n_requested / rotation).max(1);
        let mut txn = Lcg(wall_clock_ns() | 1);
        let mut out = Vec::with_capacity(n_requested);

        for _ in 0..rounds {
            let mut round_hits = 0usize;
            for server in RESOLVERS {
                for host in HOSTNAMES {
                    if let Some(rtt) = Self::query(host, server, txn.step() as u16) {
                        out.push((rtt & 0xFF) as u8);
                        round_hits += 1;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            if round_hits == 0 {
                trace!("dns rotation produced no answers, ending sample");
                break;
            }
            if out.len() >= n_requested {
                break;
            }
        }
        bound_sample(out, n_requested)
    }
}

/// Entropy from TCP three-way handshake timing.
///
/// Same physics as DNS with the SYN/ACK round trip and remote accept-queue
/// behaviour added on top.
pub struct TcpConnectSource;

impl TcpConnectSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpConnectSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for TcpConnectSource {
    fn name(&self) -> &'static str {
        "tcp_connect"
    }

    fn description(&self) -> &'static str {
        "TCP handshake round-trip timing jitter"
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Network
    }

    fn estimated_rate_bps(&self) -> f64 {
        50.0
    }

    fn is_available(&self, _caps: &HostCapabilities) -> bool {
        TCP_TARGETS.iter().any(|(host, port)| {
            format!("{host}:{port}")
                .parse::<SocketAddr>()
                .ok()
                .and_then(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).ok())
                .is_some()
        })
    }

    fn sample(&self, n_requested: usize) -> Vec<u8> {
        if n_requested == 0 {
            return Vec::new();
        }
        let rounds = (n_requested / TCP_TARGETS.len()).max(1);
        let mut out = Vec::with_capacity(n_requested);

        for _ in 0..rounds {
            let mut round_hits = 0usize;
            for (host, port) in TCP_TARGETS {
                let Ok(addr) = format!("{host}:{port}").parse::<SocketAddr>() else {
                    continue;
                };
                let start = Instant::now();
                if TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_ok() {
                    out.push((elapsed_ns(start) & 0xFF) as u8);
                    round_hits += 1;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            if round_hits == 0 {
                trace!("tcp rotation produced no connects, ending sample");
                break;
            }
            if out.len() >= n_requested {
                break;
            }
        }
        bound_sample(out, n_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_packet_layout() {
        let packet = build_query("example.com", 0xBEEF);
        assert_eq!(&packet[..2], &[0xBE, 0xEF]);
        // Recursion desired, one question
        assert_eq!(&packet[2..6], &[0x01, 0x00, 0x00, 0x01]);
        // First label length then the label itself
        assert_eq!(packet[12], 7);
        assert_eq!(&packet[13..20], b"example");
        // Terminator, QTYPE=A, QCLASS=IN
        let tail = &packet[packet.len() - 5..];
        assert_eq!(tail, &[0x00, 0x00, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn offline_sample_degrades_to_empty_quickly() {
        // Whatever the network state, a sample request must come back well
        // inside the per-source budget and never panic.
        let source = DnsTimingSource::new();
        let start = Instant::now();
        let data = source.sample(18);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(data.len() <= 27);
    }

    #[test]
    fn zero_request_is_empty() {
        assert!(DnsTimingSource::new().sample(0).is_empty());
        assert!(TcpConnectSource::new().sample(0).is_empty());
    }
}
