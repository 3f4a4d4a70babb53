//! Transport-agnostic SCSI and multipath operations.
//!
//! Resolves a volume to its dm multipath device, cross-checks identity with
//! SCSI INQUIRY, flushes dm devices and deletes their SCSI path devices.
//! All OS access goes through the [`Executor`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{ConnectivityError, Result};
use crate::executor::Executor;
use crate::metrics;
use crate::parse::{ScsiInquiry, parse_show_maps};
use crate::types::{
    ConnectivityType, MultipathDevice, SlaveDevice, VolumeIdentity, scsi_host_scan_path,
};

pub const MULTIPATHD: &str = "multipathd";
pub const MULTIPATH: &str = "multipath";
pub const SG_INQ: &str = "sg_inq";

const SHOW_MAPS_ARGS: [&str; 5] = ["show", "maps", "raw", "format", "%w,%d"];
const RECONFIGURE_ARGS: [&str; 1] = ["reconfigure"];

/// Mode used when opening sysfs control files.
pub const CONTROL_FILE_MODE: u32 = 0o200;

/// Deadlines for everything that touches the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// `multipathd show maps` and `multipathd reconfigure`
    pub multipathd: Duration,
    /// `multipath -f`
    pub flush: Duration,
    /// `sg_inq -p 0x83`
    pub sg_inq: Duration,
    /// Each glob, sysfs read, control-file write or `/dev` probe
    pub sysfs: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            multipathd: Duration::from_secs(5),
            flush: Duration::from_secs(60),
            sg_inq: Duration::from_secs(3),
            sysfs: Duration::from_secs(2),
        }
    }
}

/// Shared SCSI/multipath logic used by every transport.
pub struct ScsiGenericHelper {
    executor: Arc<dyn Executor>,
    /// Serializes `multipath -f` across the whole process.
    flush_lock: Arc<Mutex<()>>,
    timeouts: Timeouts,
    require_multiple_paths: bool,
}

impl ScsiGenericHelper {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            flush_lock: Arc::new(Mutex::new(())),
            timeouts: Timeouts::default(),
            require_multiple_paths: false,
        }
    }

    /// Share a flush mutex with other helpers in the process.
    pub fn with_flush_lock(mut self, flush_lock: Arc<Mutex<()>>) -> Self {
        self.flush_lock = flush_lock;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Reject dm devices backed by fewer than two path devices.
    pub fn with_require_multiple_paths(mut self, require: bool) -> Self {
        self.require_multiple_paths = require;
        self
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Run a blocking filesystem call off the runtime, bounded by the sysfs
    /// deadline.
    ///
    /// A stalled sysfs attribute keeps its blocking thread, but the caller
    /// gets [`ConnectivityError::FilesystemTimeout`] on time.
    async fn sysfs<T, F>(&self, operation: String, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Executor) -> Result<T> + Send + 'static,
    {
        let executor = Arc::clone(&self.executor);
        let task = tokio::task::spawn_blocking(move || f(executor.as_ref()));
        match tokio::time::timeout(self.timeouts.sysfs, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ConnectivityError::Io(io::Error::other(e))),
            Err(_) => {
                warn!(
                    operation = %operation,
                    timeout_ms = self.timeouts.sysfs.as_millis() as u64,
                    "Filesystem operation timed out"
                );
                Err(ConnectivityError::FilesystemTimeout {
                    operation,
                    timeout: self.timeouts.sysfs,
                })
            }
        }
    }

    /// Bounded [`Executor::filepath_glob`].
    pub async fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let owned = pattern.to_string();
        self.sysfs(format!("glob {}", pattern), move |executor| {
            executor.filepath_glob(&owned)
        })
        .await
    }

    /// Bounded [`Executor::read_file`].
    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let owned = path.to_path_buf();
        self.sysfs(format!("read {}", path.display()), move |executor| {
            executor.read_file(&owned)
        })
        .await
    }

    /// Bounded [`Executor::path_exists`].
    pub async fn path_exists(&self, path: &Path) -> Result<bool> {
        let owned = path.to_path_buf();
        self.sysfs(format!("stat {}", path.display()), move |executor| {
            Ok(executor.path_exists(&owned))
        })
        .await
    }

    async fn is_executable(&self, name: &'static str) -> Result<()> {
        self.sysfs(format!("lookup {}", name), move |executor| {
            executor.is_executable(name)
        })
        .await
    }

    /// Write `contents` into a sysfs control file; short writes are fatal.
    async fn write_control_file(&self, path: &Path, contents: &str) -> Result<()> {
        let owned_path = path.to_path_buf();
        let owned_contents = contents.to_string();
        let written = self
            .sysfs(format!("write {}", path.display()), move |executor| {
                let mut handle = executor.open_file_write_append(&owned_path, CONTROL_FILE_MODE)?;
                executor.write_string(&mut handle, &owned_contents)
            })
            .await?;
        if written != contents.len() {
            return Err(ConnectivityError::NothingWrittenToScanFile {
                path: path.display().to_string(),
            });
        }
        Ok(())
    }

    /// Ask each SCSI host to probe for `lun`.
    #[instrument(skip(self))]
    pub async fn rescan_devices(
        &self,
        transport: ConnectivityType,
        lun: u32,
        array_ids: &[String],
        hosts: &[u32],
    ) -> Result<()> {
        let command = format!("0 0 {}", lun);
        for &host in hosts {
            let path = scsi_host_scan_path(host);
            debug!(host, path = %path.display(), command = %command, "Writing scan command");
            self.write_control_file(&path, &command).await?;
        }
        metrics::record_rescan_writes(transport, hosts.len());
        info!(lun, hosts = ?hosts, "Rescan requested on {} host(s)", hosts.len());
        Ok(())
    }

    /// Flush a dm device with `multipath -f`.
    ///
    /// Succeeds if the device is already gone.
    #[instrument(skip(self))]
    pub async fn flush_multipath_device(&self, dm_name: &str) -> Result<()> {
        let dm = validate_dm_name(dm_name)?;
        let device = dm.path_string();

        let _guard = self.flush_lock.lock().await;
        info!(device = %device, "Flushing multipath device");

        let err = match self
            .executor
            .execute_with_timeout(self.timeouts.flush, MULTIPATH, &["-f", device.as_str()])
            .await
        {
            Ok(_) => {
                metrics::record_flush("flushed");
                info!(device = %device, "Multipath device flushed");
                return Ok(());
            }
            Err(e) => e,
        };

        // A probe that itself fails counts as the device still being there.
        if !self.path_exists(&dm.path()).await.unwrap_or(true) {
            metrics::record_flush("vanished");
            warn!(device = %device, error = %err, "Flush failed but device no longer exists");
            return Ok(());
        }
        metrics::record_flush("failed");
        warn!(device = %device, error = %err, "Failed to flush multipath device");
        Err(err)
    }

    /// Delete path devices from the SCSI layer.
    ///
    /// Already removed devices are skipped; any other failure aborts the batch.
    #[instrument(skip(self))]
    pub async fn remove_physical_device(&self, slaves: &[SlaveDevice]) -> Result<()> {
        for slave in slaves.iter().filter(|s| !s.name.is_empty()) {
            let path = slave.delete_path();
            match self.write_control_file(&path, "1").await {
                Ok(()) => info!(device = %slave.name, "Removed SCSI device"),
                Err(e) if e.is_not_found() => {
                    warn!(device = %slave.name, path = %path.display(), "SCSI device already removed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Path devices backing a dm device, sorted by name.
    pub async fn get_slave_devices(&self, dm_name: &str) -> Result<Vec<SlaveDevice>> {
        let dm = validate_dm_name(dm_name)?;
        let pattern = format!("/sys/block/{}/slaves/*", dm.name);
        let mut slaves: Vec<SlaveDevice> = self
            .glob(&pattern)
            .await?
            .iter()
            .filter_map(|p| p.file_name())
            .map(|name| SlaveDevice::new(name.to_string_lossy()))
            .collect();
        slaves.sort();
        Ok(slaves)
    }

    /// Names of the dm devices whose wwid belongs to `volume`, deduplicated.
    async fn discover_dm_names(&self, volume: &VolumeIdentity) -> Result<Vec<String>> {
        let output = self
            .executor
            .execute_with_timeout(self.timeouts.multipathd, MULTIPATHD, &SHOW_MAPS_ARGS)
            .await?;
        let output = String::from_utf8_lossy(&output);

        let mut names: Vec<String> = Vec::new();
        for entry in parse_show_maps(&output).filter(|e| e.belongs_to(volume)) {
            if !names.iter().any(|n| n == entry.dm_name) {
                names.push(entry.dm_name.to_string());
            }
        }
        debug!(volume = %volume, dm_names = ?names, "Discovered dm devices");
        Ok(names)
    }

    async fn reload_multipath(&self) -> Result<()> {
        info!("Reloading multipathd configuration");
        let result = self
            .executor
            .execute_with_timeout(self.timeouts.multipathd, MULTIPATHD, &RECONFIGURE_ARGS)
            .await;
        metrics::record_reload(result.is_ok());
        result.map(|_| ())
    }

    /// Confirm via `sg_inq -p 0x83` that `device` reports one of the volume's ids.
    #[instrument(skip(self))]
    pub async fn verify_scsi_identity(&self, device: &str, volume: &VolumeIdentity) -> Result<()> {
        self.is_executable(SG_INQ).await?;
        let output = self
            .executor
            .execute_with_timeout(self.timeouts.sg_inq, SG_INQ, &["-p", "0x83", device])
            .await?;
        let inquiry = ScsiInquiry::parse(device, &String::from_utf8_lossy(&output))?;

        if !volume.matches(&inquiry.wwn) {
            return Err(ConnectivityError::WrongDeviceFound {
                device: device.to_string(),
                reported: inquiry.wwn,
                expected: volume.id_list(),
            });
        }
        debug!(device = %device, wwn = %inquiry.wwn, "SCSI identity confirmed");
        Ok(())
    }

    async fn check_path_count(&self, dm: &MultipathDevice) -> Result<()> {
        if !self.require_multiple_paths {
            return Ok(());
        }
        let slaves = self.get_slave_devices(&dm.name).await?;
        if slaves.len() < 2 {
            return Err(ConnectivityError::MultipleDeviceNotFound {
                dm_name: dm.name.clone(),
                slaves: slaves.into_iter().map(|s| s.name).collect(),
            });
        }
        Ok(())
    }

    /// Single `show maps` pass without reload or INQUIRY.
    ///
    /// Used on tear-down, where provoking a reconfigure is undesirable.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn find_mpath_device(
        &self,
        volume: &VolumeIdentity,
    ) -> Result<Option<MultipathDevice>> {
        let mut names = self.discover_dm_names(volume).await?;
        match names.len() {
            0 => Ok(None),
            1 => Ok(names.pop().map(MultipathDevice::new)),
            _ => Err(ConnectivityError::MultipleDmDevices {
                volume_ids: volume.id_list(),
                dm_names: names,
            }),
        }
    }

    /// Resolve `volume` to exactly one `/dev/dm-N`.
    ///
    /// Zero matches trigger one `multipathd reconfigure` and a second pass;
    /// a device found only after that reload must pass SCSI INQUIRY.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn get_mpath_device(&self, volume: &VolumeIdentity) -> Result<String> {
        let mut reloaded = false;
        let mut names = self.discover_dm_names(volume).await?;

        if names.is_empty() {
            if let Err(e) = self.reload_multipath().await {
                warn!(error = %e, "multipathd reconfigure failed, retrying discovery anyway");
            }
            reloaded = true;
            names = self.discover_dm_names(volume).await?;
        }

        let dm = match names.len() {
            0 => {
                return Err(ConnectivityError::MultipathDeviceNotFound {
                    volume_ids: volume.id_list(),
                });
            }
            1 => MultipathDevice::new(names.remove(0)),
            _ => {
                return Err(ConnectivityError::MultipleDmDevices {
                    volume_ids: volume.id_list(),
                    dm_names: names,
                });
            }
        };
        let device = dm.path_string();

        if reloaded {
            self.verify_scsi_identity(&device, volume).await?;
        } else if matches!(self.path_exists(&dm.path()).await, Ok(false)) {
            warn!(device = %device, "Multipath device node not present yet");
        }

        self.check_path_count(&dm).await?;

        info!(device = %device, reloaded, "Found multipath device");
        Ok(device)
    }
}

/// Accept `dm-N` or `/dev/dm-N`; reject anything that could escape `/dev`.
fn validate_dm_name(name: &str) -> Result<MultipathDevice> {
    let dm = MultipathDevice::from_path(name);
    if dm.name.is_empty() || dm.name.contains('/') || dm.name.contains("..") {
        return Err(ConnectivityError::InvalidArgument(format!(
            "invalid dm device name '{}'",
            name
        )));
    }
    Ok(dm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_dm_name() {
        assert_eq!(validate_dm_name("dm-9").unwrap().name, "dm-9");
        assert_eq!(validate_dm_name("/dev/dm-9").unwrap().name, "dm-9");
        assert!(validate_dm_name("").is_err());
        assert!(validate_dm_name("/dev/").is_err());
        assert!(validate_dm_name("../sda").is_err());
        assert!(validate_dm_name("mapper/mpatha").is_err());
    }

    #[test]
    fn test_default_timeouts() {
        let t = Timeouts::default();
        assert!(t.multipathd < t.flush);
        assert!(t.sg_inq <= t.multipathd);
        assert!(t.sysfs < t.multipathd);
    }
}
