//! # SLE protocol data units of the return services
//!
//! This module models the operations of the RAF, RCF and ROCF services as plain Rust types.
//! The ASN.1 encoding is not part of this crate: a [PduCodec] implementation converts the
//! [SlePdu] sum type to and from the bytes exchanged over the transport channel.
use crate::config::DeliveryMode;
use crate::credentials::Credentials;
use crate::frame::{FrameQuality, Gvcid};
use crate::time::CdsTimestamp;
use crate::ServiceType;
use core::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

pub type InvokeId = i32;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum BindDiagnostic {
    AccessDenied = 0,
    ServiceTypeNotSupported = 1,
    VersionNotSupported = 2,
    NoSuchServiceInstance = 3,
    AlreadyBound = 4,
    SiNotAccessibleToThisInitiator = 5,
    InconsistentServiceType = 6,
    InvalidTime = 7,
    OutOfService = 8,
    OtherReason = 127,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum UnbindReason {
    End = 0,
    Suspend = 1,
    VersionNotSupported = 2,
    Other = 127,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum PeerAbortDiagnostic {
    AccessDenied = 0,
    UnexpectedResponderId = 1,
    OperationalRequirement = 2,
    ProtocolError = 3,
    CommunicationsFailure = 4,
    EncodingError = 5,
    ReturnTimeout = 6,
    EndOfServiceProviderCycle = 7,
    InvalidPeerAbortDiagnostic = 8,
    OtherReason = 127,
}

/// Diagnostics shared by all confirmed operations.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum CommonDiagnostic {
    DuplicateInvokeId = 100,
    OtherReason = 127,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum StartDiagnostic {
    OutOfService = 0,
    UnableToComply = 1,
    InvalidStartTime = 2,
    InvalidStopTime = 3,
    MissingTimeValue = 4,
    InvalidGvcid = 5,
    InvalidControlWordType = 6,
    InvalidTcVcid = 7,
    InvalidUpdateMode = 8,
    InvalidFrameQuality = 9,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum GetParameterDiagnostic {
    UnknownParameter = 0,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum ScheduleStatusReportDiagnostic {
    NotSupportedInThisDeliveryMode = 0,
    AlreadyStopped = 1,
    InvalidReportingCycle = 2,
}

/// Negative result of a confirmed operation, either common or operation specific.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnostic<Specific> {
    Common(CommonDiagnostic),
    Specific(Specific),
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum RequestedFrameQuality {
    GoodFramesOnly = 0,
    ErredFramesOnly = 1,
    AllFrames = 2,
}

impl RequestedFrameQuality {
    pub fn accepts(&self, quality: FrameQuality) -> bool {
        match self {
            RequestedFrameQuality::GoodFramesOnly => quality == FrameQuality::Good,
            RequestedFrameQuality::ErredFramesOnly => quality == FrameQuality::Erred,
            RequestedFrameQuality::AllFrames => true,
        }
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum ControlWordType {
    All = 0,
    Clcw = 1,
    NotClcw = 2,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum UpdateMode {
    Continuous = 0,
    ChangeBased = 1,
}

/// ROCF selection of operational control fields.
///
/// The TC virtual channel ID is only meaningful for [ControlWordType::Clcw]; [None] selects
/// the CLCWs of all TC virtual channels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RocfFilter {
    pub gvcid: Gvcid,
    pub control_word_type: ControlWordType,
    pub tc_vcid: Option<u8>,
    pub update_mode: UpdateMode,
}

/// Service specific selection requested with the START operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestedFrameFilter {
    Raf(RequestedFrameQuality),
    Rcf(Gvcid),
    Rocf(RocfFilter),
}

impl RequestedFrameFilter {
    pub fn service_type(&self) -> ServiceType {
        match self {
            RequestedFrameFilter::Raf(_) => ServiceType::Raf,
            RequestedFrameFilter::Rcf(_) => ServiceType::Rcf,
            RequestedFrameFilter::Rocf(_) => ServiceType::Rocf,
        }
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum LockStatus {
    InLock = 0,
    OutOfLock = 1,
    NotInUse = 2,
    Unknown = 3,
}

impl LockStatus {
    /// A receiver stage which is not used does not break the lock of the chain.
    pub fn is_locked(&self) -> bool {
        matches!(self, LockStatus::InLock | LockStatus::NotInUse)
    }
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
pub enum ProductionStatus {
    Running = 0,
    Interrupted = 1,
    Halted = 2,
    #[default]
    Unknown = 3,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AntennaId {
    /// Object identifier of the antenna.
    Global(Vec<u32>),
    Local(Vec<u8>),
}

impl Default for AntennaId {
    fn default() -> Self {
        AntennaId::Local(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    LossFrameSync {
        time: CdsTimestamp,
        carrier_lock_status: LockStatus,
        subcarrier_lock_status: LockStatus,
        symbol_sync_lock_status: LockStatus,
    },
    ProductionStatusChange(ProductionStatus),
    ExcessiveDataBacklog,
    EndOfData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDataInvocation {
    pub invoker_credentials: Credentials,
    pub earth_receive_time: CdsTimestamp,
    pub antenna_id: AntennaId,
    pub data_link_continuity: i32,
    /// Only present for RAF.
    pub delivered_frame_quality: Option<FrameQuality>,
    pub private_annotation: Option<Vec<u8>>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNotifyInvocation {
    pub invoker_credentials: Credentials,
    pub notification: Notification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameOrNotification {
    Frame(TransferDataInvocation),
    Notification(SyncNotifyInvocation),
}

impl FrameOrNotification {
    pub fn credentials_mut(&mut self) -> &mut Credentials {
        match self {
            FrameOrNotification::Frame(frame) => &mut frame.invoker_credentials,
            FrameOrNotification::Notification(notif) => &mut notif.invoker_credentials,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        match self {
            FrameOrNotification::Frame(frame) => &frame.invoker_credentials,
            FrameOrNotification::Notification(notif) => &notif.invoker_credentials,
        }
    }

    #[inline]
    pub fn is_notification(&self) -> bool {
        matches!(self, FrameOrNotification::Notification(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBuffer {
    pub entries: Vec<FrameOrNotification>,
}

impl TransferBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn frames(&self) -> impl Iterator<Item = &TransferDataInvocation> {
        self.entries.iter().filter_map(|entry| match entry {
            FrameOrNotification::Frame(frame) => Some(frame),
            FrameOrNotification::Notification(_) => None,
        })
    }

    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter().filter_map(|entry| match entry {
            FrameOrNotification::Frame(_) => None,
            FrameOrNotification::Notification(notif) => Some(&notif.notification),
        })
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum ParameterName {
    BufferSize = 0,
    DeliveryMode = 1,
    LatencyLimit = 2,
    MinReportingCycle = 3,
    PermittedFrameQuality = 4,
    PermittedGvcidSet = 5,
    PermittedControlWordTypeSet = 6,
    PermittedTcVcidSet = 7,
    PermittedUpdateModeSet = 8,
    ReportingCycle = 9,
    RequestedFrameQuality = 10,
    RequestedGvcid = 11,
    RequestedControlWordType = 12,
    RequestedTcVcid = 13,
    RequestedUpdateMode = 14,
    ReturnTimeoutPeriod = 15,
}

/// Value of a parameter reported by the GET-PARAMETER operation. Requested values are
/// [None] while no START operation is in effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterValue {
    BufferSize(u32),
    DeliveryMode(DeliveryMode),
    LatencyLimit(Option<u32>),
    MinReportingCycle(Option<u32>),
    PermittedFrameQuality(Vec<RequestedFrameQuality>),
    PermittedGvcidSet(Vec<Gvcid>),
    PermittedControlWordTypeSet(Vec<ControlWordType>),
    PermittedTcVcidSet(Vec<u8>),
    PermittedUpdateModeSet(Vec<UpdateMode>),
    ReportingCycle(Option<u32>),
    RequestedFrameQuality(Option<RequestedFrameQuality>),
    RequestedGvcid(Option<Gvcid>),
    RequestedControlWordType(Option<ControlWordType>),
    RequestedTcVcid(Option<u8>),
    RequestedUpdateMode(Option<UpdateMode>),
    ReturnTimeoutPeriod(u32),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportRequestType {
    Immediately,
    /// Reporting cycle in seconds.
    Periodically(u32),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindInvocation {
    pub invoker_credentials: Credentials,
    pub initiator_identifier: String,
    pub responder_port_identifier: String,
    pub service_type: ServiceType,
    pub version_number: u16,
    pub service_instance_identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindReturn {
    pub performer_credentials: Credentials,
    pub responder_identifier: String,
    /// Negotiated version on success.
    pub result: Result<u16, BindDiagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindInvocation {
    pub invoker_credentials: Credentials,
    pub reason: UnbindReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindReturn {
    pub responder_credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartInvocation {
    pub invoker_credentials: Credentials,
    pub invoke_id: InvokeId,
    pub start_time: Option<CdsTimestamp>,
    pub stop_time: Option<CdsTimestamp>,
    pub filter: RequestedFrameFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReturn {
    pub performer_credentials: Credentials,
    pub invoke_id: InvokeId,
    pub result: Result<(), Diagnostic<StartDiagnostic>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopInvocation {
    pub invoker_credentials: Credentials,
    pub invoke_id: InvokeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReturn {
    pub performer_credentials: Credentials,
    pub invoke_id: InvokeId,
    pub result: Result<(), CommonDiagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetParameterInvocation {
    pub invoker_credentials: Credentials,
    pub invoke_id: InvokeId,
    pub parameter: ParameterName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetParameterReturn {
    pub performer_credentials: Credentials,
    pub invoke_id: InvokeId,
    pub result: Result<ParameterValue, Diagnostic<GetParameterDiagnostic>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStatusReportInvocation {
    pub invoker_credentials: Credentials,
    pub invoke_id: InvokeId,
    pub request: ReportRequestType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStatusReportReturn {
    pub performer_credentials: Credentials,
    pub invoke_id: InvokeId,
    pub result: Result<(), Diagnostic<ScheduleStatusReportDiagnostic>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReportInvocation {
    pub invoker_credentials: Credentials,
    /// Only reported by RAF.
    pub error_free_frame_number: Option<u64>,
    pub delivered_frame_number: u64,
    pub frame_sync_lock_status: LockStatus,
    pub symbol_sync_lock_status: LockStatus,
    pub subcarrier_lock_status: LockStatus,
    pub carrier_lock_status: LockStatus,
    pub production_status: ProductionStatus,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PduKind {
    BindInvocation,
    BindReturn,
    UnbindInvocation,
    UnbindReturn,
    StartInvocation,
    StartReturn,
    StopInvocation,
    StopReturn,
    GetParameterInvocation,
    GetParameterReturn,
    ScheduleStatusReportInvocation,
    ScheduleStatusReportReturn,
    TransferBuffer,
    StatusReport,
}

impl PduKind {
    pub fn name(&self) -> &'static str {
        match self {
            PduKind::BindInvocation => "BIND",
            PduKind::BindReturn => "BIND-RETURN",
            PduKind::UnbindInvocation => "UNBIND",
            PduKind::UnbindReturn => "UNBIND-RETURN",
            PduKind::StartInvocation => "START",
            PduKind::StartReturn => "START-RETURN",
            PduKind::StopInvocation => "STOP",
            PduKind::StopReturn => "STOP-RETURN",
            PduKind::GetParameterInvocation => "GET-PARAMETER",
            PduKind::GetParameterReturn => "GET-PARAMETER-RETURN",
            PduKind::ScheduleStatusReportInvocation => "SCHEDULE-STATUS-REPORT",
            PduKind::ScheduleStatusReportReturn => "SCHEDULE-STATUS-REPORT-RETURN",
            PduKind::TransferBuffer => "TRANSFER-BUFFER",
            PduKind::StatusReport => "STATUS-REPORT",
        }
    }

    #[inline]
    pub fn is_bind_operation(&self) -> bool {
        matches!(self, PduKind::BindInvocation | PduKind::BindReturn)
    }

    /// Kind of the return PDU for confirmed operation invocations.
    pub fn return_kind(&self) -> Option<PduKind> {
        match self {
            PduKind::BindInvocation => Some(PduKind::BindReturn),
            PduKind::UnbindInvocation => Some(PduKind::UnbindReturn),
            PduKind::StartInvocation => Some(PduKind::StartReturn),
            PduKind::StopInvocation => Some(PduKind::StopReturn),
            PduKind::GetParameterInvocation => Some(PduKind::GetParameterReturn),
            PduKind::ScheduleStatusReportInvocation => Some(PduKind::ScheduleStatusReportReturn),
            _ => None,
        }
    }
}

impl Display for PduKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlePdu {
    BindInvocation(BindInvocation),
    BindReturn(BindReturn),
    UnbindInvocation(UnbindInvocation),
    UnbindReturn(UnbindReturn),
    StartInvocation(StartInvocation),
    StartReturn(StartReturn),
    StopInvocation(StopInvocation),
    StopReturn(StopReturn),
    GetParameterInvocation(GetParameterInvocation),
    GetParameterReturn(GetParameterReturn),
    ScheduleStatusReportInvocation(ScheduleStatusReportInvocation),
    ScheduleStatusReportReturn(ScheduleStatusReportReturn),
    TransferBuffer(TransferBuffer),
    StatusReport(StatusReportInvocation),
}

impl SlePdu {
    pub fn kind(&self) -> PduKind {
        match self {
            SlePdu::BindInvocation(_) => PduKind::BindInvocation,
            SlePdu::BindReturn(_) => PduKind::BindReturn,
            SlePdu::UnbindInvocation(_) => PduKind::UnbindInvocation,
            SlePdu::UnbindReturn(_) => PduKind::UnbindReturn,
            SlePdu::StartInvocation(_) => PduKind::StartInvocation,
            SlePdu::StartReturn(_) => PduKind::StartReturn,
            SlePdu::StopInvocation(_) => PduKind::StopInvocation,
            SlePdu::StopReturn(_) => PduKind::StopReturn,
            SlePdu::GetParameterInvocation(_) => PduKind::GetParameterInvocation,
            SlePdu::GetParameterReturn(_) => PduKind::GetParameterReturn,
            SlePdu::ScheduleStatusReportInvocation(_) => PduKind::ScheduleStatusReportInvocation,
            SlePdu::ScheduleStatusReportReturn(_) => PduKind::ScheduleStatusReportReturn,
            SlePdu::TransferBuffer(_) => PduKind::TransferBuffer,
            SlePdu::StatusReport(_) => PduKind::StatusReport,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Invoke ID of confirmed operations and their returns. BIND and UNBIND are correlated
    /// by the association itself and carry no invoke ID.
    pub fn invoke_id(&self) -> Option<InvokeId> {
        match self {
            SlePdu::StartInvocation(pdu) => Some(pdu.invoke_id),
            SlePdu::StartReturn(pdu) => Some(pdu.invoke_id),
            SlePdu::StopInvocation(pdu) => Some(pdu.invoke_id),
            SlePdu::StopReturn(pdu) => Some(pdu.invoke_id),
            SlePdu::GetParameterInvocation(pdu) => Some(pdu.invoke_id),
            SlePdu::GetParameterReturn(pdu) => Some(pdu.invoke_id),
            SlePdu::ScheduleStatusReportInvocation(pdu) => Some(pdu.invoke_id),
            SlePdu::ScheduleStatusReportReturn(pdu) => Some(pdu.invoke_id),
            _ => None,
        }
    }

    /// Invoker or performer credentials. A transfer buffer carries the credentials inside
    /// its entries, so [None] is returned for it.
    pub fn credentials(&self) -> Option<&Credentials> {
        Some(match self {
            SlePdu::BindInvocation(pdu) => &pdu.invoker_credentials,
            SlePdu::BindReturn(pdu) => &pdu.performer_credentials,
            SlePdu::UnbindInvocation(pdu) => &pdu.invoker_credentials,
            SlePdu::UnbindReturn(pdu) => &pdu.responder_credentials,
            SlePdu::StartInvocation(pdu) => &pdu.invoker_credentials,
            SlePdu::StartReturn(pdu) => &pdu.performer_credentials,
            SlePdu::StopInvocation(pdu) => &pdu.invoker_credentials,
            SlePdu::StopReturn(pdu) => &pdu.performer_credentials,
            SlePdu::GetParameterInvocation(pdu) => &pdu.invoker_credentials,
            SlePdu::GetParameterReturn(pdu) => &pdu.performer_credentials,
            SlePdu::ScheduleStatusReportInvocation(pdu) => &pdu.invoker_credentials,
            SlePdu::ScheduleStatusReportReturn(pdu) => &pdu.performer_credentials,
            SlePdu::StatusReport(pdu) => &pdu.invoker_credentials,
            SlePdu::TransferBuffer(_) => return None,
        })
    }

    pub fn credentials_mut(&mut self) -> Option<&mut Credentials> {
        Some(match self {
            SlePdu::BindInvocation(pdu) => &mut pdu.invoker_credentials,
            SlePdu::BindReturn(pdu) => &mut pdu.performer_credentials,
            SlePdu::UnbindInvocation(pdu) => &mut pdu.invoker_credentials,
            SlePdu::UnbindReturn(pdu) => &mut pdu.responder_credentials,
            SlePdu::StartInvocation(pdu) => &mut pdu.invoker_credentials,
            SlePdu::StartReturn(pdu) => &mut pdu.performer_credentials,
            SlePdu::StopInvocation(pdu) => &mut pdu.invoker_credentials,
            SlePdu::StopReturn(pdu) => &mut pdu.performer_credentials,
            SlePdu::GetParameterInvocation(pdu) => &mut pdu.invoker_credentials,
            SlePdu::GetParameterReturn(pdu) => &mut pdu.performer_credentials,
            SlePdu::ScheduleStatusReportInvocation(pdu) => &mut pdu.invoker_credentials,
            SlePdu::ScheduleStatusReportReturn(pdu) => &mut pdu.performer_credentials,
            SlePdu::StatusReport(pdu) => &mut pdu.invoker_credentials,
            SlePdu::TransferBuffer(_) => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("pdu encoding failed: {0}")]
    Encoding(String),
    #[error("pdu decoding failed: {0}")]
    Decoding(String),
}

/// Encoder and decoder of the SLE PDUs, for example an ASN.1 BER codec.
///
/// The encoding rules of some PDUs vary with the SLE version. The service instance calls
/// [PduCodec::use_protocol_version] as soon as the version of an association is known.
pub trait PduCodec: Send {
    fn encode(&self, pdu: &SlePdu) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, raw: &[u8]) -> Result<SlePdu, CodecError>;

    fn use_protocol_version(&mut self, version: u16);
}
