//! Device Connectivity Engine
//!
//! Turns a volume exported by a storage array into a local block device on a
//! Linux host, and tears it down again:
//!
//! - `transport`: per-transport host discovery (iSCSI, FC, NVMe-oFC)
//! - `scsi_generic`: multipath resolution, SCSI INQUIRY, flush and slave removal
//! - `connectivity`: the façade the node service talks to
//! - `executor`: every subprocess and sysfs access, behind a trait
//! - `volume_lock`: per-volume mutual exclusion

pub mod connectivity;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod parse;
pub mod scsi_generic;
pub mod transport;
pub mod types;
pub mod volume_lock;

pub use connectivity::{Connectivity, ConnectivityOptions};
pub use error::{ConnectivityError, ErrorKind, Result};
pub use executor::{ControlFile, Executor, LimitedExecutor, SystemExecutor};
pub use scsi_generic::{ScsiGenericHelper, Timeouts};
pub use types::{
    ConnectivityType, FcSubsystem, Iqn, MultipathDevice, SlaveDevice, VolumeIdentity, Wwpn,
};
pub use volume_lock::{VolumeLockGuard, VolumeLocks};
