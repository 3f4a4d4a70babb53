//! Per-transport host discovery.
//!
//! Each transport knows how to find the SCSI hosts that can see a storage
//! array and hands them to [`ScsiGenericHelper::rescan_devices`]. The set of
//! transports is closed, so dispatch is a plain enum match.

pub mod fc;
pub mod iscsi;
pub mod nvmeofc;

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::scsi_generic::ScsiGenericHelper;
use crate::types::{ConnectivityType, FcSubsystem, parse_host_number};

pub use fc::FcRescanner;
pub use iscsi::IscsiRescanner;
pub use nvmeofc::NvmeOfcRescanner;

/// Host number from the `host<N>` component directly below `class_dir`.
pub(crate) fn host_number_after(path: &Path, class_dir: &str) -> Option<u32> {
    let mut components = path.components().map(|c| c.as_os_str());
    components.find(|c| *c == class_dir)?;
    parse_host_number(components.next()?.to_str()?)
}

pub enum Rescanner {
    Iscsi(IscsiRescanner),
    Fc(FcRescanner),
    NvmeOfc(NvmeOfcRescanner),
}

impl Rescanner {
    pub fn new(
        connectivity_type: ConnectivityType,
        helper: Arc<ScsiGenericHelper>,
        fc_subsystem: FcSubsystem,
    ) -> Self {
        match connectivity_type {
            ConnectivityType::Iscsi => Rescanner::Iscsi(IscsiRescanner::new(helper)),
            ConnectivityType::Fc => Rescanner::Fc(FcRescanner::new(helper, fc_subsystem)),
            ConnectivityType::NvmeOfc => Rescanner::NvmeOfc(NvmeOfcRescanner::new(helper)),
        }
    }

    pub fn connectivity_type(&self) -> ConnectivityType {
        match self {
            Rescanner::Iscsi(_) => ConnectivityType::Iscsi,
            Rescanner::Fc(_) => ConnectivityType::Fc,
            Rescanner::NvmeOfc(_) => ConnectivityType::NvmeOfc,
        }
    }

    pub fn helper(&self) -> &Arc<ScsiGenericHelper> {
        match self {
            Rescanner::Iscsi(r) => r.helper(),
            Rescanner::Fc(r) => r.helper(),
            Rescanner::NvmeOfc(r) => r.helper(),
        }
    }

    pub async fn rescan(&self, lun: u32, array_ids: &[String]) -> Result<()> {
        match self {
            Rescanner::Iscsi(r) => r.rescan(lun, array_ids).await,
            Rescanner::Fc(r) => r.rescan(lun, array_ids).await,
            Rescanner::NvmeOfc(r) => r.rescan(lun, array_ids).await,
        }
    }

    pub async fn ensure_login(&self, array_ids: &[String]) -> Result<()> {
        match self {
            Rescanner::Iscsi(r) => r.ensure_login(array_ids).await,
            Rescanner::Fc(r) => r.ensure_login(array_ids).await,
            Rescanner::NvmeOfc(r) => r.ensure_login(array_ids).await,
        }
    }
}
