//! Linux metrics collector backed by `/proc/net`
//!
//! Parsing is kept in pure functions over the file contents so it can be
//! exercised without a live network stack.

use super::{
    write_connections, write_network_stats, write_port_list, MetricsCollector, NetworkStats,
    CONNECTIONS_KEY, CONNECTIONS_MAX, NETWORK_STATS_KEY, TCP_PORTS_KEY, TCP_PORTS_MAX,
    UDP_PORTS_KEY, UDP_PORTS_MAX,
};
use crate::encoding::{EncodeError, StructuredWriter};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::debug;

const TCP_LISTEN: u8 = 0x0A;
const TCP_ESTABLISHED: u8 = 0x01;

/// One row of `/proc/net/{tcp,udp}[6]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: u8,
}

/// Collector reading socket and interface tables from a procfs root
#[derive(Debug, Clone)]
pub struct ProcNetCollector {
    net_dir: PathBuf,
}

impl Default for ProcNetCollector {
    fn default() -> Self {
        Self::new("/proc/net")
    }
}

impl ProcNetCollector {
    pub fn new<P: Into<PathBuf>>(net_dir: P) -> Self {
        Self {
            net_dir: net_dir.into(),
        }
    }

    fn read(&self, name: &str, metric: &'static str) -> Result<String, EncodeError> {
        std::fs::read_to_string(self.net_dir.join(name))
            .map_err(|e| EncodeError::collector(metric, format!("{name}: {e}")))
    }

    /// IPv6 tables are absent when the kernel has IPv6 disabled
    fn read_optional(&self, name: &str, metric: &'static str) -> Result<String, EncodeError> {
        let path: &Path = &self.net_dir.join(name);
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} not present, treating as empty", path.display());
                Ok(String::new())
            }
            Err(e) => Err(EncodeError::collector(metric, format!("{name}: {e}"))),
        }
    }

    fn socket_table(
        &self,
        v4: &str,
        v6: &str,
        metric: &'static str,
    ) -> Result<Vec<SocketEntry>, EncodeError> {
        let mut entries = parse_socket_table(&self.read(v4, metric)?)
            .map_err(|e| EncodeError::collector(metric, e))?;
        entries.extend(
            parse_socket_table(&self.read_optional(v6, metric)?)
                .map_err(|e| EncodeError::collector(metric, e))?,
        );
        Ok(entries)
    }
}

impl MetricsCollector for ProcNetCollector {
    fn network_stats(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        let stats = parse_net_dev(&self.read("dev", NETWORK_STATS_KEY)?)
            .map_err(|e| EncodeError::collector(NETWORK_STATS_KEY, e))?;
        write_network_stats(writer, &stats)
    }

    fn listening_tcp_ports(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        let entries = self.socket_table("tcp", "tcp6", TCP_PORTS_KEY)?;
        let ports = listening_ports(&entries, |e| e.state == TCP_LISTEN);
        write_port_list(writer, TCP_PORTS_KEY, &ports, TCP_PORTS_MAX)
    }

    fn listening_udp_ports(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError> {
        let entries = self.socket_table("udp", "udp6", UDP_PORTS_KEY)?;
        let ports = listening_ports(&entries, |e| e.remote.port() == 0);
        write_port_list(writer, UDP_PORTS_KEY, &ports, UDP_PORTS_MAX)
    }

    fn established_connections(
        &self,
        writer: &mut dyn StructuredWriter,
    ) -> Result<(), EncodeError> {
        let entries = self.socket_table("tcp", "tcp6", CONNECTIONS_KEY)?;
        let remotes: Vec<SocketAddr> = entries
            .iter()
            .filter(|e| e.state == TCP_ESTABLISHED)
            .map(|e| e.remote)
            .collect();
        write_connections(writer, &remotes, CONNECTIONS_MAX)
    }
}

/// Distinct local ports of the entries matching `is_listening`, ascending
fn listening_ports<F>(entries: &[SocketEntry], is_listening: F) -> Vec<u16>
where
    F: Fn(&SocketEntry) -> bool,
{
    entries
        .iter()
        .filter(|e| is_listening(e))
        .map(|e| e.local.port())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Sum receive/transmit counters over every non-loopback interface
pub fn parse_net_dev(contents: &str) -> Result<NetworkStats, String> {
    let mut stats = NetworkStats::default();

    // Two header lines precede the per-interface rows
    for line in contents.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }

        let fields: Vec<u64> = counters
            .split_whitespace()
            .map(|f| f.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("bad counter for {}: {e}", name.trim()))?;
        if fields.len() < 10 {
            return Err(format!("short counter row for {}", name.trim()));
        }

        stats.bytes_in += fields[0];
        stats.packets_in += fields[1];
        stats.bytes_out += fields[8];
        stats.packets_out += fields[9];
    }

    Ok(stats)
}

/// Parse a `/proc/net/{tcp,udp}[6]` table; the header row is skipped
pub fn parse_socket_table(contents: &str) -> Result<Vec<SocketEntry>, String> {
    let mut entries = Vec::new();

    for line in contents.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(_slot), Some(local), Some(remote), Some(state)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        entries.push(SocketEntry {
            local: parse_hex_endpoint(local)?,
            remote: parse_hex_endpoint(remote)?,
            state: u8::from_str_radix(state, 16).map_err(|e| format!("bad state {state}: {e}"))?,
        });
    }

    Ok(entries)
}

/// Decode `ADDR:PORT` where ADDR is the kernel's native-endian hex dump
fn parse_hex_endpoint(field: &str) -> Result<SocketAddr, String> {
    let (addr, port) = field
        .split_once(':')
        .ok_or_else(|| format!("bad endpoint {field}"))?;
    let port = u16::from_str_radix(port, 16).map_err(|e| format!("bad port {port}: {e}"))?;

    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).map_err(|e| format!("bad addr {addr}: {e}"))?;
            IpAddr::V4(Ipv4Addr::from(word.to_le_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let hex = &addr[i * 8..i * 8 + 8];
                let word =
                    u32::from_str_radix(hex, 16).map_err(|e| format!("bad addr {addr}: {e}"))?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(format!("bad address length in {field}")),
    };

    Ok(SocketAddr::new(ip, port))
}
