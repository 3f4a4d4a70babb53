//! Type-safe node requests.
//!
//! Requests are parsed once from the orchestrator's volume context at the
//! API boundary; everything downstream works on validated values.

use std::collections::HashMap;
use std::fmt::{self, Display};

use device_connectivity::{ConnectivityType, VolumeIdentity};
use serde::Serialize;

use crate::error::{NodeError, Result};

/// Volume-context keys, snake_case first, camelCase accepted too.
pub mod keys {
    pub const CONNECTIVITY_TYPE: [&str; 2] = ["connectivity_type", "connectivityType"];
    pub const LUN: [&str; 1] = ["lun"];
    pub const ARRAY_IDENTIFIERS: [&str; 8] = [
        "array_identifiers",
        "arrayIdentifiers",
        "array_iqn",
        "arrayIqn",
        "array_wwpns",
        "arrayWwpns",
        "array_nqn",
        "arrayNqn",
    ];
    pub const ALTERNATE_VOLUME_ID: [&str; 3] = ["nguid", "alternate_volume_id", "alternateVolumeId"];
    pub const VOLUME_NAME: [&str; 2] = ["volume_name", "volumeName"];
}

fn lookup<'a>(context: &'a HashMap<String, String>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| context.get(*name))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

/// Validate that a path is absolute and safe to hand to host tooling.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(NodeError::InvalidArgument("path cannot be empty".into()));
    }
    if !path.starts_with('/') {
        return Err(NodeError::InvalidArgument(format!(
            "path '{}' must be absolute",
            path
        )));
    }

    let dangerous_chars = [
        ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
    ];
    if let Some(c) = dangerous_chars.into_iter().find(|c| path.contains(*c)) {
        return Err(NodeError::InvalidArgument(format!(
            "path contains dangerous character: '{}'",
            c
        )));
    }

    if path.contains("..") {
        return Err(NodeError::InvalidArgument(
            "path cannot contain '..' (path traversal)".into(),
        ));
    }
    Ok(())
}

// ============================================================================
// ArrayIdentifiers
// ============================================================================

/// Storage-array endpoints (IQNs, WWPNs or NQNs) for one volume.
///
/// Parsed from a comma-separated list; each entry may only contain
/// alphanumerics, dots, colons, dashes and underscores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ArrayIdentifiers {
    ids: Vec<String>,
}

impl ArrayIdentifiers {
    /// Format: `"id1,id2,..."`; blank entries are skipped.
    pub fn parse(s: &str) -> Result<Self> {
        let mut ids = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let valid = part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_'));
            if !valid {
                return Err(NodeError::InvalidArgument(format!(
                    "array identifier '{}' contains invalid characters",
                    part
                )));
            }
            ids.push(part.to_string());
        }

        if ids.is_empty() {
            return Err(NodeError::InvalidArgument(
                "array identifiers cannot be empty".into(),
            ));
        }
        Ok(Self { ids })
    }

    pub fn as_slice(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Display for ArrayIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ids.join(","))
    }
}

impl<'a> IntoIterator for &'a ArrayIdentifiers {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

// ============================================================================
// Requests
// ============================================================================

fn parse_connectivity_type(context: &HashMap<String, String>) -> Result<ConnectivityType> {
    let token = lookup(context, &keys::CONNECTIVITY_TYPE)
        .ok_or_else(|| NodeError::InvalidArgument("connectivity_type is required".into()))?;
    Ok(token.parse()?)
}

fn parse_lun(context: &HashMap<String, String>, connectivity_type: ConnectivityType) -> Result<u32> {
    match lookup(context, &keys::LUN) {
        Some(lun) => lun
            .parse()
            .map_err(|_| NodeError::InvalidArgument(format!("invalid lun '{}'", lun))),
        // NVMe namespaces are not addressed by LUN.
        None if connectivity_type == ConnectivityType::NvmeOfc => Ok(0),
        None => Err(NodeError::InvalidArgument("lun is required".into())),
    }
}

fn parse_volume(volume_id: &str, context: &HashMap<String, String>) -> Result<VolumeIdentity> {
    if volume_id.trim().is_empty() {
        return Err(NodeError::InvalidArgument("volume id is required".into()));
    }
    let mut volume = VolumeIdentity::new(volume_id)?;
    if let Some(alternate) = lookup(context, &keys::ALTERNATE_VOLUME_ID) {
        volume = volume.with_alternate(alternate)?;
    }
    if let Some(name) = lookup(context, &keys::VOLUME_NAME) {
        volume = volume.with_name(name);
    }
    Ok(volume)
}

/// Attach a volume to this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRequest {
    pub volume: VolumeIdentity,
    pub lun: u32,
    pub array_identifiers: ArrayIdentifiers,
    pub connectivity_type: ConnectivityType,
    pub staging_target_path: String,
}

impl StageRequest {
    pub fn from_context(
        volume_id: &str,
        staging_target_path: &str,
        context: &HashMap<String, String>,
    ) -> Result<Self> {
        let volume = parse_volume(volume_id, context)?;
        validate_path(staging_target_path)?;
        let connectivity_type = parse_connectivity_type(context)?;
        let lun = parse_lun(context, connectivity_type)?;
        let array_identifiers = lookup(context, &keys::ARRAY_IDENTIFIERS)
            .ok_or_else(|| NodeError::InvalidArgument("array identifiers are required".into()))
            .and_then(ArrayIdentifiers::parse)?;

        Ok(Self {
            volume,
            lun,
            array_identifiers,
            connectivity_type,
            staging_target_path: staging_target_path.to_string(),
        })
    }

    pub fn volume_id(&self) -> &str {
        self.volume.primary()
    }
}

/// Detach a volume from this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstageRequest {
    pub volume: VolumeIdentity,
    pub connectivity_type: ConnectivityType,
    pub staging_target_path: String,
}

impl UnstageRequest {
    pub fn from_context(
        volume_id: &str,
        staging_target_path: &str,
        context: &HashMap<String, String>,
    ) -> Result<Self> {
        let volume = parse_volume(volume_id, context)?;
        validate_path(staging_target_path)?;
        let connectivity_type = parse_connectivity_type(context)?;
        Ok(Self {
            volume,
            connectivity_type,
            staging_target_path: staging_target_path.to_string(),
        })
    }

    pub fn volume_id(&self) -> &str {
        self.volume.primary()
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageResponse {
    pub volume_id: String,
    pub device_path: String,
    pub staging_target_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnstageResponse {
    pub volume_id: String,
    /// dm device that was flushed; `None` when the volume was already gone.
    pub device_path: Option<String>,
    pub removed_devices: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "6oui000vendorsi0vendorsie0000000";
    const NGUID: &str = "vendorsie0000000oui0000vendorsi0";

    fn context(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/var/lib/kubelet/plugins/staging").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("var/lib").is_err());
        assert!(validate_path("/var/../etc").is_err());
        assert!(validate_path("/var;ls").is_err());
        assert!(validate_path("/var$HOME").is_err());
        assert!(validate_path("/var`id`").is_err());
    }

    #[test]
    fn test_array_identifiers_parse() {
        let ids = ArrayIdentifiers::parse(" iqn.1986-03.com.ibm:2145.a , ,iqn.1986-03.com.ibm:2145.b").unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.as_slice()[1], "iqn.1986-03.com.ibm:2145.b");
        assert_eq!(ids.to_string(), "iqn.1986-03.com.ibm:2145.a,iqn.1986-03.com.ibm:2145.b");

        assert!(ArrayIdentifiers::parse("").is_err());
        assert!(ArrayIdentifiers::parse(" , ").is_err());
        assert!(ArrayIdentifiers::parse("iqn.x;rm -rf").is_err());
        assert!(ArrayIdentifiers::parse("target$(id)").is_err());
    }

    #[test]
    fn test_stage_request_snake_case() {
        let ctx = context(&[
            ("connectivity_type", "iscsi"),
            ("lun", "3"),
            ("array_iqn", "iqn.1986-03.com.ibm:2145.v7k194.node2"),
            ("nguid", NGUID),
            ("volume_name", "pvc-1234"),
        ]);
        let req = StageRequest::from_context(UUID, "/staging/pv1", &ctx).unwrap();
        assert_eq!(req.volume_id(), UUID);
        assert_eq!(req.volume.alternate(), Some(NGUID));
        assert_eq!(req.volume.name(), Some("pvc-1234"));
        assert_eq!(req.lun, 3);
        assert_eq!(req.connectivity_type, ConnectivityType::Iscsi);
        assert_eq!(req.array_identifiers.len(), 1);
    }

    #[test]
    fn test_stage_request_camel_case() {
        let ctx = context(&[
            ("connectivityType", "FC"),
            ("lun", "0"),
            ("arrayWwpns", "500507680B21AC5C,500507680B22AC5C"),
            ("alternateVolumeId", NGUID),
        ]);
        let req = StageRequest::from_context(UUID, "/staging/pv1", &ctx).unwrap();
        assert_eq!(req.connectivity_type, ConnectivityType::Fc);
        assert_eq!(req.array_identifiers.len(), 2);
        assert_eq!(req.volume.alternate(), Some(NGUID));
    }

    #[test]
    fn test_stage_request_nvme_lun_optional() {
        let ctx = context(&[
            ("connectivity_type", "nvmeofc"),
            ("array_nqn", "nqn.2014-08.org.nvmexpress:uuid:1234"),
        ]);
        let req = StageRequest::from_context(NGUID, "/staging/pv1", &ctx).unwrap();
        assert_eq!(req.lun, 0);
    }

    #[test]
    fn test_stage_request_validation() {
        let good = [
            ("connectivity_type", "iscsi"),
            ("lun", "1"),
            ("array_iqn", "iqn.1986-03.com.ibm:2145.v7k194.node2"),
        ];

        let cases: Vec<(&str, &str, Vec<(&str, &str)>)> = vec![
            ("", "/staging", good.to_vec()),
            ("not-alnum!", "/staging", good.to_vec()),
            (UUID, "relative", good.to_vec()),
            (UUID, "/staging", vec![("lun", "1"), good[2]]),
            (UUID, "/staging", vec![("connectivity_type", "nvmeoftcp"), good[1], good[2]]),
            (UUID, "/staging", vec![good[0], ("lun", "-1"), good[2]]),
            (UUID, "/staging", vec![good[0], ("lun", "abc"), good[2]]),
            (UUID, "/staging", vec![good[0], good[2]]),
            (UUID, "/staging", vec![good[0], good[1], ("array_iqn", " ")]),
            (UUID, "/staging", vec![good[0], good[1]]),
        ];
        for (volume_id, path, pairs) in cases {
            let ctx = context(&pairs);
            let err = StageRequest::from_context(volume_id, path, &ctx).unwrap_err();
            assert_eq!(
                tonic::Status::from(err).code(),
                tonic::Code::InvalidArgument,
                "volume_id={:?} path={:?} ctx={:?}",
                volume_id,
                path,
                pairs
            );
        }
    }

    #[test]
    fn test_unstage_request() {
        let ctx = context(&[("connectivity_type", "iscsi")]);
        let req = UnstageRequest::from_context(UUID, "/staging/pv1", &ctx).unwrap();
        assert_eq!(req.volume_id(), UUID);
        assert!(UnstageRequest::from_context(UUID, "/staging/pv1", &HashMap::new()).is_err());
    }
}
