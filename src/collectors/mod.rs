//! Device metrics collectors
//!
//! The report builder calls the four [`MetricsCollector`] operations in a fixed
//! order while the report's metrics map is open. Each call appends exactly one
//! keyed entry using the Device Defender short-name schema:
//!
//! - `ns` network byte/packet counters
//! - `tp` listening TCP ports
//! - `up` listening UDP ports
//! - `tc` established TCP connections

pub mod procfs;

pub use procfs::ProcNetCollector;

use crate::encoding::{EncodeError, StructuredWriter};
use std::net::SocketAddr;

pub const NETWORK_STATS_KEY: &str = "ns";
pub const TCP_PORTS_KEY: &str = "tp";
pub const UDP_PORTS_KEY: &str = "up";
pub const CONNECTIONS_KEY: &str = "tc";

/// Maximum list entries emitted per metric; totals still count everything
pub const TCP_PORTS_MAX: usize = 10;
pub const UDP_PORTS_MAX: usize = 10;
pub const CONNECTIONS_MAX: usize = 10;

/// Source of the four report metrics
pub trait MetricsCollector: Send + Sync {
    fn network_stats(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError>;

    fn listening_tcp_ports(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError>;

    fn listening_udp_ports(&self, writer: &mut dyn StructuredWriter) -> Result<(), EncodeError>;

    fn established_connections(
        &self,
        writer: &mut dyn StructuredWriter,
    ) -> Result<(), EncodeError>;
}

/// Aggregate interface counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

/// Append `ns: {bi, bo, pi, po}`
pub fn write_network_stats(
    writer: &mut dyn StructuredWriter,
    stats: &NetworkStats,
) -> Result<(), EncodeError> {
    writer.write_text(NETWORK_STATS_KEY)?;
    writer.begin_map(Some(4))?;
    writer.write_uint_entry("bi", stats.bytes_in)?;
    writer.write_uint_entry("bo", stats.bytes_out)?;
    writer.write_uint_entry("pi", stats.packets_in)?;
    writer.write_uint_entry("po", stats.packets_out)?;
    writer.end_container()
}

/// Append `<key>: {pts: [{pt}], t}` with at most `max` listed ports
pub fn write_port_list(
    writer: &mut dyn StructuredWriter,
    key: &str,
    ports: &[u16],
    max: usize,
) -> Result<(), EncodeError> {
    let shown = &ports[..ports.len().min(max)];

    writer.write_text(key)?;
    writer.begin_map(Some(2))?;
    writer.write_text("pts")?;
    writer.begin_array(Some(shown.len()))?;
    for port in shown {
        writer.begin_map(Some(1))?;
        writer.write_uint_entry("pt", u64::from(*port))?;
        writer.end_container()?;
    }
    writer.end_container()?;
    writer.write_uint_entry("t", ports.len() as u64)?;
    writer.end_container()
}

/// Append `tc: {ec: {cs: [{rad}], t}}` with at most `max` listed peers
pub fn write_connections(
    writer: &mut dyn StructuredWriter,
    remotes: &[SocketAddr],
    max: usize,
) -> Result<(), EncodeError> {
    let shown = &remotes[..remotes.len().min(max)];

    writer.write_text(CONNECTIONS_KEY)?;
    writer.begin_map(Some(1))?;
    writer.write_text("ec")?;
    writer.begin_map(Some(2))?;
    writer.write_text("cs")?;
    writer.begin_array(Some(shown.len()))?;
    for remote in shown {
        writer.begin_map(Some(1))?;
        writer.write_text_entry("rad", &remote.to_string())?;
        writer.end_container()?;
    }
    writer.end_container()?;
    writer.write_uint_entry("t", remotes.len() as u64)?;
    writer.end_container()?;
    writer.end_container()
}
