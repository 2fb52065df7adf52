use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the service discovery engine.
#[derive(Debug, Error)]
pub enum SdError {
    #[error("service ({service_id:#06x}, {instance_id:#06x}) is already offered")]
    AlreadyOffered { service_id: u16, instance_id: u16 },

    #[error("service ({service_id:#06x}, {instance_id:#06x}) is not offered")]
    NotOffered { service_id: u16, instance_id: u16 },

    #[error("no state machine configured for service ({service_id:#06x}, {instance_id:#06x})")]
    NoStateMachine { service_id: u16, instance_id: u16 },

    #[error("service ({service_id:#06x}, {instance_id:#06x}) is already released")]
    AlreadyReleased { service_id: u16, instance_id: u16 },

    #[error("eventgroup {eventgroup_id:#06x} of service {service_id:#06x} has no subscribers")]
    NotSubscribed { service_id: u16, eventgroup_id: u16 },

    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition { from: &'static str, to: &'static str },

    #[error("malformed SD message: {0}")]
    Malformed(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read configuration {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SdError>;
