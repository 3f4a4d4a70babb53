//! Engine-level metrics
//!
//! Only records through the `metrics` facade; the binary embedding the
//! engine decides whether an exporter is installed.

use metrics::{counter, gauge};

use crate::types::ConnectivityType;

/// Metric names
pub mod names {
    /// Counter: `multipathd reconfigure` invocations by result
    pub const MULTIPATH_RELOADS_TOTAL: &str = "dce_multipath_reloads_total";
    /// Counter: scan commands written to SCSI hosts, by transport
    pub const RESCAN_WRITES_TOTAL: &str = "dce_rescan_writes_total";
    /// Counter: `multipath -f` invocations by outcome
    pub const FLUSHES_TOTAL: &str = "dce_flushes_total";
    /// Gauge: subprocesses currently running through a limited executor
    pub const COMMANDS_IN_FLIGHT: &str = "dce_commands_in_flight";
}

pub fn record_reload(success: bool) {
    counter!(names::MULTIPATH_RELOADS_TOTAL, "success" => success.to_string()).increment(1);
}

pub fn record_rescan_writes(transport: ConnectivityType, hosts: usize) {
    counter!(names::RESCAN_WRITES_TOTAL, "transport" => transport.as_str())
        .increment(hosts as u64);
}

/// `outcome` is one of `flushed`, `vanished` or `failed`.
pub fn record_flush(outcome: &'static str) {
    counter!(names::FLUSHES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn set_commands_in_flight(count: usize) {
    gauge!(names::COMMANDS_IN_FLIGHT).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_reload(true);
        record_rescan_writes(ConnectivityType::Fc, 2);
        record_flush("vanished");
        set_commands_in_flight(0);
    }
}
