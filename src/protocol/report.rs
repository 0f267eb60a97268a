//! Metrics report assembly
//!
//! A report is a top-level map with exactly two entries:
//!
//! ```text
//! { "hed": { "rid": <report id>, "v": "1.0" },
//!   "met": { <collector entries...> } }
//! ```
//!
//! The header is a definite two-entry map; the top level and `met` are
//! open-ended since the collectors decide how many entries they append.

use crate::collectors::MetricsCollector;
use crate::encoding::{CborWriter, EncodeError, StructuredWriter};

pub const HEADER_KEY: &str = "hed";
pub const METRICS_KEY: &str = "met";
pub const REPORT_ID_KEY: &str = "rid";
pub const VERSION_KEY: &str = "v";
pub const REPORT_VERSION: &str = "1.0";

/// Encode one report into `buf`, returning the number of bytes written
///
/// Any collector failure aborts the build and is returned unchanged. On error
/// the buffer contents are meaningless and must not be published.
pub fn build_report(
    buf: &mut [u8],
    report_id: u64,
    collector: &dyn MetricsCollector,
) -> Result<usize, EncodeError> {
    let mut writer = CborWriter::new(buf);
    write_report(&mut writer, report_id, collector)?;
    writer.finish()
}

/// Write a report through any structured writer
pub fn write_report(
    writer: &mut dyn StructuredWriter,
    report_id: u64,
    collector: &dyn MetricsCollector,
) -> Result<(), EncodeError> {
    writer.begin_map(None)?;

    writer.write_text(HEADER_KEY)?;
    writer.begin_map(Some(2))?;
    writer.write_uint_entry(REPORT_ID_KEY, report_id)?;
    writer.write_text_entry(VERSION_KEY, REPORT_VERSION)?;
    writer.end_container()?;

    writer.write_text(METRICS_KEY)?;
    writer.begin_map(None)?;
    collector.network_stats(writer)?;
    collector.listening_tcp_ports(writer)?;
    collector.listening_udp_ports(writer)?;
    collector.established_connections(writer)?;
    writer.end_container()?;

    writer.end_container()
}
