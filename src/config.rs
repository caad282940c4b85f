//! Peer and service instance configuration.
//!
//! The configuration objects are plain data structures which can be loaded with any serde
//! format. The engine only reads them and shares them between its contexts with an
//! [std::sync::Arc].
use crate::frame::Gvcid;
use crate::pdu::{ControlWordType, RequestedFrameQuality, UpdateMode};
use crate::ServiceType;
use core::time::Duration;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u8)]
pub enum AuthenticationMode {
    #[default]
    None = 0,
    /// Only the BIND invocation and return carry credentials.
    Bind = 1,
    All = 2,
}

#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u8)]
pub enum HashFunction {
    #[default]
    Sha1 = 0,
    Sha256 = 1,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum DeliveryMode {
    TimelyOnline = 0,
    CompleteOnline = 1,
    Offline = 2,
    FwdOnline = 3,
    FwdOffline = 4,
}

impl DeliveryMode {
    #[inline]
    pub fn is_offline(&self) -> bool {
        matches!(self, DeliveryMode::Offline | DeliveryMode::FwdOffline)
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        !self.is_offline()
    }
}

/// Side of the association which sends the BIND invocation.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    TryFromPrimitive,
    IntoPrimitive,
)]
#[repr(u8)]
pub enum InitiatorSide {
    #[default]
    User = 0,
    Provider = 1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub id: String,
    pub authentication_mode: AuthenticationMode,
    pub authentication_hash: HashFunction,
    pub password: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfiguration {
    pub local_id: String,
    pub local_password: Vec<u8>,
    pub remote_peers: Vec<RemotePeer>,
    /// Accepted difference between the credential time and the local time, in seconds.
    pub authentication_delay: u32,
}

impl PeerConfiguration {
    pub fn remote_peer(&self, id: &str) -> Option<&RemotePeer> {
        self.remote_peers.iter().find(|peer| peer.id == id)
    }

    #[inline]
    pub fn authentication_delay(&self) -> Duration {
        Duration::from_secs(self.authentication_delay as u64)
    }
}

/// Permitted values of the service specific START parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceSpecificConfiguration {
    Raf {
        permitted_frame_quality: Vec<RequestedFrameQuality>,
    },
    Rcf {
        permitted_gvcids: Vec<Gvcid>,
    },
    Rocf {
        permitted_gvcids: Vec<Gvcid>,
        permitted_tc_vcids: Vec<u8>,
        permitted_control_word_types: Vec<ControlWordType>,
        permitted_update_modes: Vec<UpdateMode>,
    },
}

impl ServiceSpecificConfiguration {
    pub fn service_type(&self) -> ServiceType {
        match self {
            ServiceSpecificConfiguration::Raf { .. } => ServiceType::Raf,
            ServiceSpecificConfiguration::Rcf { .. } => ServiceType::Rcf,
            ServiceSpecificConfiguration::Rocf { .. } => ServiceType::Rocf,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstanceConfiguration {
    pub service_instance_identifier: String,
    pub service_type: ServiceType,
    pub initiator: InitiatorSide,
    pub initiator_id: String,
    pub responder_id: String,
    pub responder_port_id: String,
    /// Return timeout period in seconds.
    pub return_timeout_period: u32,
    pub delivery_mode: DeliveryMode,
    /// Latency limit in seconds. Must be [None] for the offline delivery modes.
    pub latency_limit: Option<u32>,
    /// Maximum number of entries of a transfer buffer.
    pub transfer_buffer_size: u32,
    pub min_reporting_cycle: Option<u32>,
    pub max_reporting_cycle: Option<u32>,
    pub service_specific: ServiceSpecificConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("transfer buffer size must be at least 1")]
    ZeroTransferBufferSize,
    #[error("return timeout period must be at least 1 second")]
    ZeroReturnTimeout,
    #[error("latency limit is required for online delivery mode {0:?}")]
    MissingLatencyLimit(DeliveryMode),
    #[error("latency limit is not allowed for offline delivery mode {0:?}")]
    UnexpectedLatencyLimit(DeliveryMode),
    #[error("minimum reporting cycle {min} exceeds maximum reporting cycle {max}")]
    InvalidReportingCycleBounds { min: u32, max: u32 },
    #[error("service specific configuration for {found:?} does not match service type {expected:?}")]
    ServiceTypeMismatch {
        found: ServiceType,
        expected: ServiceType,
    },
    #[error("empty identifier for {0}")]
    EmptyIdentifier(&'static str),
}

impl ServiceInstanceConfiguration {
    #[inline]
    pub fn return_timeout(&self) -> Duration {
        Duration::from_secs(self.return_timeout_period as u64)
    }

    #[inline]
    pub fn latency(&self) -> Option<Duration> {
        self.latency_limit
            .map(|limit| Duration::from_secs(limit as u64))
    }

    /// Identifier of the peer on the other side of the association, seen from the given
    /// side.
    pub fn remote_id(&self, local_is_user: bool) -> &str {
        match (self.initiator, local_is_user) {
            (InitiatorSide::User, true) | (InitiatorSide::Provider, false) => &self.responder_id,
            _ => &self.initiator_id,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_instance_identifier.is_empty() {
            return Err(ConfigError::EmptyIdentifier("service instance"));
        }
        if self.initiator_id.is_empty() {
            return Err(ConfigError::EmptyIdentifier("initiator"));
        }
        if self.responder_id.is_empty() {
            return Err(ConfigError::EmptyIdentifier("responder"));
        }
        if self.transfer_buffer_size == 0 {
            return Err(ConfigError::ZeroTransferBufferSize);
        }
        if self.return_timeout_period == 0 {
            return Err(ConfigError::ZeroReturnTimeout);
        }
        match (self.delivery_mode.is_online(), self.latency_limit) {
            (true, None) => return Err(ConfigError::MissingLatencyLimit(self.delivery_mode)),
            (false, Some(_)) => {
                return Err(ConfigError::UnexpectedLatencyLimit(self.delivery_mode))
            }
            _ => (),
        }
        if let (Some(min), Some(max)) = (self.min_reporting_cycle, self.max_reporting_cycle) {
            if min > max {
                return Err(ConfigError::InvalidReportingCycleBounds { min, max });
            }
        }
        let found = self.service_specific.service_type();
        if found != self.service_type {
            return Err(ConfigError::ServiceTypeMismatch {
                found,
                expected: self.service_type,
            });
        }
        Ok(())
    }
}
