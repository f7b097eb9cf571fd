//! Mapping between the monotonic frame clock and wall-clock time

use bytemuck::{Pod, Zeroable};
use chrono::{DateTime, FixedOffset, Local, Offset, Utc};
use serde::{Deserialize, Serialize};

use super::metadata::monotonic_ns;

/// Captured once when a camera group connects; every frame timestamp is converted
/// to UTC through it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct TimebaseMapping {
    pub utc_ns: i64,
    pub monotonic_ns: u64,
    pub local_utc_offset_s: i64,
}

impl TimebaseMapping {
    pub const SIZE: usize = std::mem::size_of::<TimebaseMapping>();

    pub fn now() -> Self {
        let monotonic_ns = monotonic_ns();
        let utc = Utc::now();
        Self {
            utc_ns: utc.timestamp_nanos_opt().unwrap_or_default(),
            monotonic_ns,
            local_utc_offset_s: Local::now().offset().local_minus_utc() as i64,
        }
    }

    pub fn to_utc_ns(&self, monotonic_ns: u64) -> i64 {
        self.utc_ns + (monotonic_ns as i64 - self.monotonic_ns as i64)
    }

    pub fn to_utc(&self, monotonic_ns: u64) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.to_utc_ns(monotonic_ns))
    }

    pub fn to_utc_seconds(&self, monotonic_ns: u64) -> f64 {
        self.to_utc_ns(monotonic_ns) as f64 / 1e9
    }

    /// ISO-8601 in the local offset that was in effect when the mapping was taken.
    pub fn to_local_iso8601(&self, monotonic_ns: u64) -> String {
        let offset = FixedOffset::east_opt(self.local_utc_offset_s as i32)
            .unwrap_or_else(|| Utc.fix());
        self.to_utc(monotonic_ns)
            .with_timezone(&offset)
            .to_rfc3339_opts(chrono::SecondsFormat::Nanos, false)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == Self::SIZE).then(|| bytemuck::pod_read_unaligned(bytes))
    }
}
