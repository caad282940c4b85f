//! # Return service provider
//!
//! The provider side answers the operations of the user and delivers the frames offered by
//! the data production. Frames pass the service specific [FrameAdmission] of the service
//! instance and are collected by the [TransferBufferEngine].
//!
//! ## Example
//!
//! ```rust
//! use sleservices::frame::FrameQuality;
//! use sleservices::provider::ReceivedFrame;
//! use sleservices::time::CdsTimestamp;
//!
//! let ert = CdsTimestamp::from_now().unwrap();
//! let frame = ReceivedFrame::new(vec![0; 64], FrameQuality::Good, ert).with_data_link_continuity(0);
//! assert_eq!(frame.data_link_continuity, 0);
//! ```
use crate::config::{PeerConfiguration, ServiceInstanceConfiguration, ServiceSpecificConfiguration};
use crate::credentials::Credentials;
use crate::dispatch::{ExecutorHandle, TaskOrigin, TimerHandle, TimerId};
use crate::frame::FrameQuality;
use crate::pdu::{
    AntennaId, Diagnostic, GetParameterDiagnostic, GetParameterReturn, InvokeId, LockStatus,
    ParameterName,
    ParameterValue, PduCodec, PduKind, ProductionStatus, ReportRequestType, RequestedFrameFilter,
    ScheduleStatusReportDiagnostic, ScheduleStatusReportReturn, SlePdu, StartDiagnostic,
    StartInvocation, StartReturn, StopReturn, TransferBuffer, TransferDataInvocation,
};
use crate::service::{HandlerRegistry, ServiceError, ServiceInstance, Session, SessionSide};
use crate::time::CdsTimestamp;
use crate::transport::TransportChannel;
use crate::{BindingState, ServiceType};
use buffer::DeliveredFrames;
use delegate::delegate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub mod buffer;
pub mod raf;
pub mod rcf;
pub mod rocf;

pub use buffer::{ProductionState, TransferBufferEngine};
pub use raf::RafAdmission;
pub use rcf::RcfAdmission;
pub use rocf::RocfAdmission;

/// A frame as received from the space link, together with its annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub data: Vec<u8>,
    pub quality: FrameQuality,
    pub earth_receive_time: CdsTimestamp,
    pub antenna_id: AntennaId,
    /// Number of frames missing before this one, -1 if unknown.
    pub data_link_continuity: i32,
    pub private_annotation: Option<Vec<u8>>,
}

impl ReceivedFrame {
    pub fn new(data: Vec<u8>, quality: FrameQuality, earth_receive_time: CdsTimestamp) -> Self {
        Self {
            data,
            quality,
            earth_receive_time,
            antenna_id: AntennaId::default(),
            data_link_continuity: -1,
            private_annotation: None,
        }
    }

    pub fn with_antenna_id(mut self, antenna_id: AntennaId) -> Self {
        self.antenna_id = antenna_id;
        self
    }

    pub fn with_data_link_continuity(mut self, data_link_continuity: i32) -> Self {
        self.data_link_continuity = data_link_continuity;
        self
    }

    pub fn with_private_annotation(mut self, annotation: Vec<u8>) -> Self {
        self.private_annotation = Some(annotation);
        self
    }

    pub(crate) fn to_transfer_data(&self, data: Vec<u8>) -> TransferDataInvocation {
        TransferDataInvocation {
            invoker_credentials: Credentials::Unused,
            earth_receive_time: self.earth_receive_time,
            antenna_id: self.antenna_id.clone(),
            data_link_continuity: self.data_link_continuity,
            delivered_frame_quality: None,
            private_annotation: self.private_annotation.clone(),
            data,
        }
    }
}

/// Service specific frame selection of a provider.
///
/// The selection is configured with the filter of a START invocation and cleared when the
/// data delivery stops.
pub trait FrameAdmission: Send {
    fn service_type(&self) -> ServiceType;

    /// Check the requested filter against the permitted values and apply it.
    fn configure(&mut self, filter: &RequestedFrameFilter) -> Result<(), StartDiagnostic>;

    fn clear(&mut self);

    /// Whether the frame is delivered. May update the selection state, so it is called once
    /// per offered frame.
    fn admit(&mut self, frame: &ReceivedFrame) -> bool;

    /// Transfer data entry of an admitted frame.
    fn build_entry(&self, frame: &ReceivedFrame) -> TransferDataInvocation;

    /// The entries admitted since the last hand over left for transmission.
    fn buffer_handed_over(&mut self) {}

    /// The entries admitted since the last hand over were discarded.
    fn buffer_discarded(&mut self) {}

    /// Service specific parameter for the GET-PARAMETER operation. [None] if the parameter
    /// does not exist for this service.
    fn parameter(&self, name: ParameterName) -> Option<ParameterValue>;
}

/// Frame selection matching the service specific configuration.
pub fn admission_for(config: &ServiceSpecificConfiguration) -> Box<dyn FrameAdmission> {
    match config {
        ServiceSpecificConfiguration::Raf {
            permitted_frame_quality,
        } => Box::new(RafAdmission::new(permitted_frame_quality.clone())),
        ServiceSpecificConfiguration::Rcf { permitted_gvcids } => {
            Box::new(RcfAdmission::new(permitted_gvcids.clone()))
        }
        ServiceSpecificConfiguration::Rocf {
            permitted_gvcids,
            permitted_tc_vcids,
            permitted_control_word_types,
            permitted_update_modes,
        } => Box::new(RocfAdmission::new(
            permitted_gvcids.clone(),
            permitted_tc_vcids.clone(),
            permitted_control_word_types.clone(),
            permitted_update_modes.clone(),
        )),
    }
}

struct ReportSchedule {
    cycle: u32,
    token: u64,
    timer: Option<TimerId>,
}

pub struct ProviderSide {
    engine: Arc<TransferBufferEngine>,
    report: Option<ReportSchedule>,
    next_report_token: u64,
    /// Invoke id of a STOP waiting for the residual data to be sent.
    stopping: Option<InvokeId>,
}

impl ProviderSide {
    pub fn new(engine: Arc<TransferBufferEngine>) -> Self {
        Self {
            engine,
            report: None,
            next_report_token: 0,
            stopping: None,
        }
    }

    /// Reporting cycle of the periodic status reports, if running.
    pub fn reporting_cycle(&self) -> Option<u32> {
        self.report.as_ref().map(|report| report.cycle)
    }
}

pub type ReturnServiceProvider = ServiceInstance<ProviderSide>;

impl SessionSide for ProviderSide {
    const IS_USER: bool = false;
    const NAME: &'static str = "provider";

    type Shared = Arc<TransferBufferEngine>;

    fn shared(&self) -> Self::Shared {
        self.engine.clone()
    }

    fn register_handlers(handlers: &mut HandlerRegistry<Self>) {
        handlers.register(PduKind::StartInvocation, Session::handle_start_invocation);
        handlers.register(PduKind::StopInvocation, Session::handle_stop_invocation);
        handlers.register(
            PduKind::GetParameterInvocation,
            Session::handle_get_parameter_invocation,
        );
        handlers.register(
            PduKind::ScheduleStatusReportInvocation,
            Session::handle_schedule_status_report_invocation,
        );
    }

    fn attach(&mut self, _si: &Arc<str>, executor: &ExecutorHandle<Session<Self>>, timers: &TimerHandle) {
        self.engine.attach(executor.clone(), timers.clone());
    }

    fn on_reset(session: &mut Session<Self>) {
        session.side.stopping = None;
        session.side.engine.reset();
        session.cancel_status_reports();
    }
}

impl ReturnServiceProvider {
    pub fn new(
        peers: Arc<PeerConfiguration>,
        config: Arc<ServiceInstanceConfiguration>,
        channel: Box<dyn TransportChannel>,
        codec: Box<dyn PduCodec>,
    ) -> Result<Self, ServiceError> {
        let engine = Arc::new(TransferBufferEngine::new(&config));
        Self::with_side(peers, config, channel, codec, ProviderSide::new(engine))
    }

    delegate! {
        to self.shared {
            /// Offer a received frame, see [TransferBufferEngine::transfer_data].
            pub fn transfer_data(&self, frame: ReceivedFrame) -> bool;
            pub fn data_discarded(&self) -> bool;
            pub fn end_of_data(&self) -> bool;
            pub fn update_production_status(
                &self,
                time: CdsTimestamp,
                carrier: LockStatus,
                subcarrier: LockStatus,
                symbol: LockStatus,
                production: ProductionStatus
            );
            pub fn production_state(&self) -> ProductionState;
            pub fn buffered_len(&self) -> usize;
            pub fn discarded_buffers(&self) -> u64;
        }
    }
}

impl Session<ProviderSide> {
    fn validate_start(&self, invocation: &StartInvocation) -> Result<(), StartDiagnostic> {
        if invocation.filter.service_type() != self.config.service_type {
            return Err(StartDiagnostic::UnableToComply);
        }
        if self.config.delivery_mode.is_offline()
            && (invocation.start_time.is_none() || invocation.stop_time.is_none())
        {
            return Err(StartDiagnostic::MissingTimeValue);
        }
        if let (Some(start), Some(stop)) = (invocation.start_time, invocation.stop_time) {
            if stop <= start {
                return Err(StartDiagnostic::InvalidStopTime);
            }
        }
        Ok(())
    }

    fn handle_start_invocation(&mut self, pdu: SlePdu) {
        if self.state() != BindingState::Ready {
            let message = format!("START received in state {:?}", self.state());
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::StartInvocation(invocation) = pdu else {
            return;
        };
        let result = self.validate_start(&invocation).and_then(|()| {
            self.side.engine.start(
                invocation.start_time,
                invocation.stop_time,
                &invocation.filter,
            )
        });
        let accepted = result.is_ok();
        if let Err(diagnostic) = result {
            info!(si = %self.si, ?diagnostic, filter = ?invocation.filter, "START rejected");
        }
        let start_return = SlePdu::StartReturn(StartReturn {
            performer_credentials: Credentials::Unused,
            invoke_id: invocation.invoke_id,
            result: result.map_err(Diagnostic::Specific),
        });
        if self.send_pdu(start_return) && accepted {
            info!(si = %self.si, filter = ?invocation.filter, "data delivery started");
            self.set_state(BindingState::Active);
        }
    }

    fn handle_stop_invocation(&mut self, pdu: SlePdu) {
        if self.state() != BindingState::Active || self.side.stopping.is_some() {
            let message = format!("STOP received in state {:?}", self.state());
            return self.protocol_violation(pdu, message);
        }
        let Some(invoke_id) = pdu.invoke_id() else {
            return;
        };
        // Frames offered from now on are dropped silently. The residual buffer is queued
        // behind the buffers already handed over, the return follows them.
        self.side.engine.stop();
        self.side.stopping = Some(invoke_id);
        self.executor.submit(
            TaskOrigin::FromProvider,
            move |session: &mut Session<ProviderSide>| session.complete_stop(invoke_id),
        );
    }

    fn complete_stop(&mut self, invoke_id: InvokeId) {
        // association ended meanwhile
        if self.side.stopping.take() != Some(invoke_id) {
            return;
        }
        self.side.engine.finish_stop();
        let stop_return = SlePdu::StopReturn(StopReturn {
            performer_credentials: Credentials::Unused,
            invoke_id,
            result: Ok(()),
        });
        if self.send_pdu(stop_return) {
            info!(si = %self.si, "data delivery stopped");
            self.set_state(BindingState::Ready);
        }
    }

    fn parameter_value(&self, name: ParameterName) -> Option<ParameterValue> {
        let value = match name {
            ParameterName::BufferSize => {
                ParameterValue::BufferSize(self.config.transfer_buffer_size)
            }
            ParameterName::DeliveryMode => ParameterValue::DeliveryMode(self.config.delivery_mode),
            ParameterName::LatencyLimit => ParameterValue::LatencyLimit(self.config.latency_limit),
            ParameterName::MinReportingCycle => {
                ParameterValue::MinReportingCycle(self.config.min_reporting_cycle)
            }
            ParameterName::ReportingCycle => {
                ParameterValue::ReportingCycle(self.side.reporting_cycle())
            }
            ParameterName::ReturnTimeoutPeriod => {
                ParameterValue::ReturnTimeoutPeriod(self.config.return_timeout_period)
            }
            other => return self.side.engine.parameter(other),
        };
        Some(value)
    }

    fn handle_get_parameter_invocation(&mut self, pdu: SlePdu) {
        if !matches!(self.state(), BindingState::Ready | BindingState::Active) {
            let message = format!("GET-PARAMETER received in state {:?}", self.state());
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::GetParameterInvocation(invocation) = pdu else {
            return;
        };
        let result = self
            .parameter_value(invocation.parameter)
            .ok_or(Diagnostic::Specific(GetParameterDiagnostic::UnknownParameter));
        debug!(si = %self.si, parameter = ?invocation.parameter, ?result, "GET-PARAMETER");
        self.send_pdu(SlePdu::GetParameterReturn(GetParameterReturn {
            performer_credentials: Credentials::Unused,
            invoke_id: invocation.invoke_id,
            result,
        }));
    }

    fn handle_schedule_status_report_invocation(&mut self, pdu: SlePdu) {
        if !matches!(self.state(), BindingState::Ready | BindingState::Active) {
            let message = format!(
                "SCHEDULE-STATUS-REPORT received in state {:?}",
                self.state()
            );
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::ScheduleStatusReportInvocation(invocation) = pdu else {
            return;
        };
        let result = self.schedule_status_report(invocation.request);
        let immediate = result.is_ok() && invocation.request == ReportRequestType::Immediately;
        let schedule_return = SlePdu::ScheduleStatusReportReturn(ScheduleStatusReportReturn {
            performer_credentials: Credentials::Unused,
            invoke_id: invocation.invoke_id,
            result: result.map_err(Diagnostic::Specific),
        });
        if self.send_pdu(schedule_return) && immediate {
            self.send_status_report();
        }
    }

    fn schedule_status_report(
        &mut self,
        request: ReportRequestType,
    ) -> Result<(), ScheduleStatusReportDiagnostic> {
        if self.config.delivery_mode.is_offline() {
            return Err(ScheduleStatusReportDiagnostic::NotSupportedInThisDeliveryMode);
        }
        match request {
            ReportRequestType::Immediately => Ok(()),
            ReportRequestType::Stop => {
                if self.side.report.is_none() {
                    return Err(ScheduleStatusReportDiagnostic::AlreadyStopped);
                }
                self.cancel_status_reports();
                Ok(())
            }
            ReportRequestType::Periodically(cycle) => {
                let min = self.config.min_reporting_cycle.unwrap_or(1).max(1);
                let max = self.config.max_reporting_cycle.unwrap_or(u32::MAX);
                if !(min..=max).contains(&cycle) {
                    return Err(ScheduleStatusReportDiagnostic::InvalidReportingCycle);
                }
                self.cancel_status_reports();
                let token = self.side.next_report_token;
                self.side.next_report_token += 1;
                self.side.report = Some(ReportSchedule {
                    cycle,
                    token,
                    timer: None,
                });
                self.arm_report_timer();
                debug!(si = %self.si, cycle, "periodic status reports scheduled");
                Ok(())
            }
        }
    }

    fn arm_report_timer(&mut self) {
        let Some(report) = &self.side.report else {
            return;
        };
        let token = report.token;
        let executor = self.executor.clone();
        let timer = self
            .timers
            .schedule(Duration::from_secs(report.cycle as u64), move || {
                executor.submit(
                    TaskOrigin::FromProvider,
                    move |session: &mut Session<ProviderSide>| session.on_report_timer(token),
                );
            });
        if let Some(report) = &mut self.side.report {
            report.timer = timer;
        }
    }

    fn on_report_timer(&mut self, token: u64) {
        if !matches!(&self.side.report, Some(report) if report.token == token) {
            return;
        }
        if self.state().is_bound() {
            self.send_status_report();
            self.arm_report_timer();
        }
    }

    fn cancel_status_reports(&mut self) {
        if let Some(timer) = self.side.report.take().and_then(|report| report.timer) {
            self.timers.cancel(timer);
        }
    }

    fn send_status_report(&mut self) {
        let report = self.side.engine.status_report();
        self.send_pdu(SlePdu::StatusReport(report));
    }

    /// Send a transfer buffer handed over by the engine, unless the data delivery was
    /// stopped or restarted meanwhile.
    fn transmit_buffer(&mut self, buffer: TransferBuffer, generation: u64) {
        let engine = self.side.engine.clone();
        if self.state() != BindingState::Active || !engine.is_current(generation) {
            debug!(si = %self.si, entries = buffer.len(), "outdated transfer buffer dropped");
            return engine.transmission_done(generation, None);
        }
        let delivered = DeliveredFrames::count(&buffer);
        let sent = self.send_pdu(SlePdu::TransferBuffer(buffer));
        engine.transmission_done(generation, sent.then_some(delivered));
    }
}
