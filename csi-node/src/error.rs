use device_connectivity::{ConnectivityError, ErrorKind};
use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;

impl From<NodeError> for Status {
    fn from(err: NodeError) -> Self {
        let message = err.to_string();
        match err {
            NodeError::InvalidArgument(_) => Status::invalid_argument(message),
            NodeError::Connectivity(e) => match e.kind() {
                ErrorKind::Validation => Status::invalid_argument(message),
                ErrorKind::TargetNotFound | ErrorKind::DiscoveryAbsence => {
                    Status::not_found(message)
                }
                ErrorKind::Ambiguity => Status::failed_precondition(message),
                ErrorKind::Concurrency => Status::aborted(message),
                ErrorKind::IdentityMismatch
                | ErrorKind::ControlFileWrite
                | ErrorKind::Timeout
                | ErrorKind::Internal => Status::internal(message),
            },
            NodeError::Config(_) | NodeError::Json(_) => Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    fn code(err: ConnectivityError) -> Code {
        Status::from(NodeError::from(err)).code()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            code(ConnectivityError::UnsupportedConnectivityType("x".into())),
            Code::InvalidArgument
        );
        assert_eq!(
            code(ConnectivityError::FcHostTargetNotFound {
                array_ids: vec!["aa".into()]
            }),
            Code::NotFound
        );
        assert_eq!(
            code(ConnectivityError::MultipathDeviceNotFound {
                volume_ids: vec!["v".into()]
            }),
            Code::NotFound
        );
        assert_eq!(
            code(ConnectivityError::MultipleDmDevices {
                volume_ids: vec!["v".into()],
                dm_names: vec!["dm-1".into(), "dm-2".into()],
            }),
            Code::FailedPrecondition
        );
        assert_eq!(
            code(ConnectivityError::VolumeAlreadyProcessing("v".into())),
            Code::Aborted
        );
        assert_eq!(
            code(ConnectivityError::WrongDeviceFound {
                device: "/dev/dm-1".into(),
                reported: "a".into(),
                expected: vec!["b".into()],
            }),
            Code::Internal
        );
        assert_eq!(
            code(ConnectivityError::FilesystemTimeout {
                operation: "glob /sys/class/fc_host/host*/port_state".into(),
                timeout: std::time::Duration::from_secs(2),
            }),
            Code::Internal
        );
    }

    #[test]
    fn test_status_message_is_preserved() {
        let status = Status::from(NodeError::InvalidArgument("lun is required".into()));
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("lun is required"));
    }
}
