use std::time::Duration;

use thiserror::Error;

/// Broad classification of a [`ConnectivityError`].
///
/// Callers use the kind to decide between retrying, surfacing to an
/// operator, or aborting the request outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    TargetNotFound,
    DiscoveryAbsence,
    Ambiguity,
    IdentityMismatch,
    ControlFileWrite,
    Concurrency,
    Timeout,
    Internal,
}

#[derive(Error, Debug)]
pub enum ConnectivityError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported connectivity type '{0}': expected iscsi, fc or nvmeofc")]
    UnsupportedConnectivityType(String),

    #[error("no iSCSI session found for storage target(s) {array_ids:?}")]
    StorageTargetNotFound { array_ids: Vec<String> },

    #[error("no online FC host connected to storage target(s) {array_ids:?}")]
    FcHostTargetNotFound { array_ids: Vec<String> },

    #[error("multipath device not found for volume(s) {volume_ids:?}")]
    MultipathDeviceNotFound { volume_ids: Vec<String> },

    #[error("volume(s) {volume_ids:?} resolved to multiple dm devices: {dm_names:?}")]
    MultipleDmDevices {
        volume_ids: Vec<String>,
        dm_names: Vec<String>,
    },

    #[error("dm device '{dm_name}' has a single physical path {slaves:?}, multipath expected")]
    MultipleDeviceNotFound { dm_name: String, slaves: Vec<String> },

    #[error("wrong device found: {device} reports wwn '{reported}', expected one of {expected:?}")]
    WrongDeviceFound {
        device: String,
        reported: String,
        expected: Vec<String>,
    },

    #[error("no wwn found in sg_inq output for {device}")]
    NoRegexWwnMatchInScsiInq { device: String, output: String },

    #[error("nothing was written to scan file {path}")]
    NothingWrittenToScanFile { path: String },

    #[error("volume '{0}' is already being processed")]
    VolumeAlreadyProcessing(String),

    #[error("command '{command}' timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("filesystem operation '{operation}' timed out after {timeout:?}")]
    FilesystemTimeout { operation: String, timeout: Duration },

    #[error("command '{command}' failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("executable '{0}' not found in PATH")]
    ExecutableNotFound(String),

    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectivityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectivityError::InvalidArgument(_)
            | ConnectivityError::UnsupportedConnectivityType(_) => ErrorKind::Validation,
            ConnectivityError::StorageTargetNotFound { .. }
            | ConnectivityError::FcHostTargetNotFound { .. } => ErrorKind::TargetNotFound,
            ConnectivityError::MultipathDeviceNotFound { .. } => ErrorKind::DiscoveryAbsence,
            ConnectivityError::MultipleDmDevices { .. }
            | ConnectivityError::MultipleDeviceNotFound { .. } => ErrorKind::Ambiguity,
            ConnectivityError::WrongDeviceFound { .. }
            | ConnectivityError::NoRegexWwnMatchInScsiInq { .. } => ErrorKind::IdentityMismatch,
            ConnectivityError::NothingWrittenToScanFile { .. } => ErrorKind::ControlFileWrite,
            ConnectivityError::VolumeAlreadyProcessing(_) => ErrorKind::Concurrency,
            ConnectivityError::CommandTimeout { .. }
            | ConnectivityError::FilesystemTimeout { .. } => ErrorKind::Timeout,
            ConnectivityError::CommandFailed { .. }
            | ConnectivityError::ExecutableNotFound(_)
            | ConnectivityError::InvalidGlob { .. }
            | ConnectivityError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the orchestrator may retry the request as-is.
    ///
    /// Identity mismatches are never retryable: retrying risks writing to
    /// the wrong volume.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TargetNotFound | ErrorKind::DiscoveryAbsence | ErrorKind::Concurrency
        )
    }

    /// True when the error is an IO `NotFound`, i.e. the file is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConnectivityError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, ConnectivityError>;
