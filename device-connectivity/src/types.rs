//! Type-safe wrappers for the identifiers the connectivity engine works with.
//!
//! Caller-supplied values (connectivity type, volume ids, array identifiers)
//! are validated and normalized here once, so the transport and SCSI code can
//! compare them without re-deriving case or prefix rules.

use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConnectivityError, Result};

// ============================================================================
// ConnectivityType
// ============================================================================

/// Transport used to reach the storage array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityType {
    Iscsi,
    Fc,
    #[serde(rename = "nvmeofc")]
    NvmeOfc,
}

impl ConnectivityType {
    pub const ALL: [ConnectivityType; 3] = [
        ConnectivityType::Iscsi,
        ConnectivityType::Fc,
        ConnectivityType::NvmeOfc,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectivityType::Iscsi => "iscsi",
            ConnectivityType::Fc => "fc",
            ConnectivityType::NvmeOfc => "nvmeofc",
        }
    }
}

impl Display for ConnectivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectivityType {
    type Err = ConnectivityError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "iscsi" => Ok(ConnectivityType::Iscsi),
            "fc" => Ok(ConnectivityType::Fc),
            "nvmeofc" => Ok(ConnectivityType::NvmeOfc),
            _ => Err(ConnectivityError::UnsupportedConnectivityType(s.to_string())),
        }
    }
}

// ============================================================================
// VolumeIdentity
// ============================================================================

/// The identities a storage array may report for one volume.
///
/// Arrays expose the same volume either by UUID or by NGUID; a match on any
/// of them is authoritative. Ids are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeIdentity {
    primary: String,
    alternate: Option<String>,
    name: Option<String>,
}

impl VolumeIdentity {
    /// Create an identity from the primary (UUID) id.
    pub fn new(primary: &str) -> Result<Self> {
        Ok(Self {
            primary: validate_volume_id(primary)?,
            alternate: None,
            name: None,
        })
    }

    /// Attach the alternate (NGUID) id.
    pub fn with_alternate(mut self, alternate: &str) -> Result<Self> {
        let alternate = validate_volume_id(alternate)?;
        if alternate != self.primary {
            self.alternate = Some(alternate);
        }
        Ok(self)
    }

    /// Attach a human-readable volume name, used only for logging.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn alternate(&self) -> Option<&str> {
        self.alternate.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// All ids, primary first.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.alternate.as_deref())
    }

    /// Owned copy of [`Self::ids`], for error payloads.
    pub fn id_list(&self) -> Vec<String> {
        self.ids().map(str::to_string).collect()
    }

    /// Case-insensitive equality against any of the ids.
    pub fn matches(&self, wwn: &str) -> bool {
        let wwn = wwn.trim();
        self.ids().any(|id| id.eq_ignore_ascii_case(wwn))
    }
}

impl Display for VolumeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alternate {
            Some(alt) => write!(f, "{}/{}", self.primary, alt),
            None => write!(f, "{}", self.primary),
        }
    }
}

fn validate_volume_id(id: &str) -> Result<String> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ConnectivityError::InvalidArgument(
            "volume id cannot be empty".into(),
        ));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConnectivityError::InvalidArgument(format!(
            "volume id '{}' must be alphanumeric",
            id
        )));
    }
    Ok(id.to_ascii_lowercase())
}

// ============================================================================
// Array identifiers
// ============================================================================

/// An FC world-wide port name, normalized to bare lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Wwpn(String);

impl Wwpn {
    pub fn parse(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        let bare = lower.strip_prefix("0x").unwrap_or(&lower);
        if bare.is_empty() || !bare.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConnectivityError::InvalidArgument(format!(
                "invalid WWPN '{}'",
                s
            )));
        }
        Ok(Self(bare.to_string()))
    }

    /// Bare lowercase hex, e.g. `500507680b21ac5c`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `0x`-prefixed form sysfs uses in `port_name`.
    pub fn sysfs_form(&self) -> String {
        format!("0x{}", self.0)
    }

    /// Compare against the content of a sysfs `port_name` file, bare or prefixed.
    pub fn matches_port_name(&self, content: &str) -> bool {
        let content = content.trim().to_lowercase();
        content == self.0 || content == self.sysfs_form()
    }
}

impl Display for Wwpn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sysfs_form())
    }
}

impl FromStr for Wwpn {
    type Err = ConnectivityError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// An iSCSI qualified name, compared after trimming whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Iqn(String);

impl Iqn {
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ConnectivityError::InvalidArgument(
                "IQN cannot be empty".into(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against the content of a sysfs `targetname` file.
    pub fn matches_targetname(&self, content: &str) -> bool {
        content.trim() == self.0
    }
}

impl Display for Iqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse every identifier, rejecting an empty list.
pub(crate) fn parse_all<T>(ids: &[String], parse: fn(&str) -> Result<T>) -> Result<Vec<T>> {
    if ids.is_empty() {
        return Err(ConnectivityError::InvalidArgument(
            "array identifiers cannot be empty".into(),
        ));
    }
    ids.iter().map(|id| parse(id)).collect()
}

// ============================================================================
// FC subsystem
// ============================================================================

/// Udev subsystem that FC host adapters hang off.
///
/// On s390x the zfcp adapters are `ccw` devices, which moves the remote-port
/// tree under `/sys/bus/ccw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FcSubsystem {
    Scsi,
    Ccw,
}

impl FcSubsystem {
    /// Subsystem for the architecture this binary was built for.
    pub fn for_host() -> Self {
        if std::env::consts::ARCH == "s390x" {
            FcSubsystem::Ccw
        } else {
            FcSubsystem::Scsi
        }
    }
}

impl Default for FcSubsystem {
    fn default() -> Self {
        Self::for_host()
    }
}

// ============================================================================
// Host adapters and devices
// ============================================================================

/// State of an FC host port as reported by `port_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortState {
    Online,
    Offline,
    Other(String),
}

impl PortState {
    pub fn parse(content: &str) -> Self {
        let state = content.trim().to_lowercase();
        match state.as_str() {
            "online" => PortState::Online,
            "offline" => PortState::Offline,
            _ => PortState::Other(state),
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, PortState::Online)
    }
}

/// Control file that triggers a LUN scan on SCSI host `host`.
pub fn scsi_host_scan_path(host: u32) -> PathBuf {
    PathBuf::from(format!("/sys/class/scsi_host/host{}/scan", host))
}

/// Parse the host number out of a `host<N>` path component.
pub fn parse_host_number(component: &str) -> Option<u32> {
    component.strip_prefix("host")?.parse().ok()
}

/// A path device (e.g. `sdb`) underneath a dm multipath device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SlaveDevice {
    pub name: String,
}

impl SlaveDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn delete_path(&self) -> PathBuf {
        PathBuf::from(format!("/sys/block/{}/device/delete", self.name))
    }
}

/// A device-mapper multipath device, named `dm-N`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultipathDevice {
    pub name: String,
}

impl MultipathDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Accept either `dm-N` or `/dev/dm-N`.
    pub fn from_path(path: &str) -> Self {
        Self::new(path.trim().trim_start_matches("/dev/"))
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}", self.name))
    }

    pub fn path_string(&self) -> String {
        format!("/dev/{}", self.name)
    }
}

impl Display for MultipathDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
