//! # CCSDS Space Link Extension (SLE) return services
//!
//! This crate contains a protocol engine for the CCSDS Space Link Extension return service
//! family. Currently, this includes the following services:
//!
//!  - Return All Frames (RAF) according to
//!    [CCSDS 911.1-B-4](https://public.ccsds.org/Pubs/911x1b4.pdf)
//!  - Return Channel Frames (RCF) according to
//!    [CCSDS 911.2-B-3](https://public.ccsds.org/Pubs/911x2b3.pdf)
//!  - Return Operational Control Field (ROCF) according to
//!    [CCSDS 911.5-B-3](https://public.ccsds.org/Pubs/911x5b3.pdf)
//!
//! The engine covers the service instance state machine for both the initiator and the
//! responder role, the serialized command dispatching with return timeouts, the ISP1
//! credential handling and the transfer buffering of the provider side. The encoding of
//! the PDUs and the transport layer (TML) are external collaborators which are plugged
//! in with the [pdu::PduCodec] and [transport::TransportChannel] traits.
//!
//! The core components are:
//!
//!  - [service::ServiceInstance]: the binding state machine, generic over the side of the
//!    association. [user::ReturnServiceUser] and [provider::ReturnServiceProvider] are the
//!    two concrete flavours.
//!  - [provider::buffer::TransferBufferEngine]: the bounded buffer which accumulates frames
//!    and notifications on the provider side and flushes them according to the
//!    [config::DeliveryMode].
//!  - [provider::FrameAdmission]: the RAF, RCF and ROCF specific frame selection.
//!
//! ## Example
//!
//! ```rust
//! use sleservices::time::CdsTimestamp;
//! use sleservices::frame::Gvcid;
//!
//! let gvcid = Gvcid::new(0x2A, 0, Some(3));
//! assert_eq!(gvcid.virtual_channel_id, Some(3));
//! let now = CdsTimestamp::from_now().expect("Error creating timestamp");
//! println!("{:?}", now);
//! ```
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod frame;
pub mod pdu;
pub mod provider;
pub mod service;
pub mod time;
pub mod transport;
pub mod user;

#[cfg(test)]
pub(crate) mod test_util;

/// Lowest SLE protocol version supported by the return services.
pub const MIN_SLE_VERSION: u16 = 1;
/// Highest SLE protocol version supported by the return services.
pub const MAX_SLE_VERSION: u16 = 5;

/// Generic error type when converting to and from raw byte slices.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ByteConversionError {
    /// The passed slice is too small. Returns the passed slice length and expected minimum size
    #[error("target slice with size {found} is too small, expected size of at least {expected}")]
    ToSliceTooSmall { found: usize, expected: usize },
    /// The provider buffer is too small. Returns the passed slice length and expected minimum size
    #[error("source slice with size {found} too small, expected at least {expected} bytes")]
    FromSliceTooSmall { found: usize, expected: usize },
    /// The [zerocopy] library failed to read from bytes
    #[error("zerocopy serialization error")]
    ZeroCopyFromError,
}

/// The return service types handled by this crate.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum ServiceType {
    Raf = 0,
    Rcf = 1,
    Rocf = 2,
}

impl ServiceType {
    /// Every return service type accepts all SLE versions from 1 to 5.
    pub fn supports_version(&self, version: u16) -> bool {
        (MIN_SLE_VERSION..=MAX_SLE_VERSION).contains(&version)
    }
}

/// Binding state of a service instance.
///
/// The pending states are only visited by the initiator of the corresponding operation,
/// while [BindingState::UnboundWait] is only visited by the responder of the association.
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
pub enum BindingState {
    #[default]
    Unbound = 0,
    UnboundWait = 1,
    BindPending = 2,
    Ready = 3,
    StartPending = 4,
    Active = 5,
    StopPending = 6,
    UnbindPending = 7,
}

impl BindingState {
    /// The association exists, i.e. a BIND operation was completed and no UNBIND or
    /// peer-abort happened yet.
    pub fn is_bound(&self) -> bool {
        matches!(
            self,
            BindingState::Ready
                | BindingState::StartPending
                | BindingState::Active
                | BindingState::StopPending
                | BindingState::UnbindPending
        )
    }
}
