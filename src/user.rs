//! # Return service user
//!
//! The user side invokes the START, STOP, GET-PARAMETER and SCHEDULE-STATUS-REPORT
//! operations and receives the transfer buffers and status reports of the provider.
use crate::config::{PeerConfiguration, ServiceInstanceConfiguration};
use crate::credentials::Credentials;
use crate::pdu::{
    FrameOrNotification, GetParameterInvocation, Notification, ParameterName,
    PeerAbortDiagnostic, PduCodec, PduKind, ReportRequestType, RequestedFrameFilter,
    ScheduleStatusReportInvocation, SlePdu, StartInvocation, StopInvocation,
};
use crate::service::{HandlerRegistry, ReturnKey, ServiceError, ServiceInstance, Session, SessionSide};
use crate::time::CdsTimestamp;
use crate::transport::TransportChannel;
use crate::BindingState;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters of the data received by the user since the instance was created.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ReceptionCounters {
    pub transfer_buffers: u64,
    pub frames: u64,
    pub notifications: u64,
    pub status_reports: u64,
}

#[derive(Default)]
pub struct UserSide {
    counters: Arc<Mutex<ReceptionCounters>>,
    requested_filter: Option<RequestedFrameFilter>,
}

impl UserSide {
    pub fn requested_filter(&self) -> Option<&RequestedFrameFilter> {
        self.requested_filter.as_ref()
    }
}

pub type ReturnServiceUser = ServiceInstance<UserSide>;

impl SessionSide for UserSide {
    const IS_USER: bool = true;
    const NAME: &'static str = "user";

    type Shared = Arc<Mutex<ReceptionCounters>>;

    fn shared(&self) -> Self::Shared {
        self.counters.clone()
    }

    fn register_handlers(handlers: &mut HandlerRegistry<Self>) {
        handlers.register(PduKind::StartReturn, Session::handle_start_return);
        handlers.register(PduKind::StopReturn, Session::handle_stop_return);
        handlers.register(
            PduKind::GetParameterReturn,
            Session::handle_get_parameter_return,
        );
        handlers.register(
            PduKind::ScheduleStatusReportReturn,
            Session::handle_schedule_status_report_return,
        );
        handlers.register(PduKind::TransferBuffer, Session::handle_transfer_buffer);
        handlers.register(PduKind::StatusReport, Session::handle_status_report);
    }

    fn on_reset(session: &mut Session<Self>) {
        session.side.requested_filter = None;
    }
}

impl ReturnServiceUser {
    pub fn new(
        peers: Arc<PeerConfiguration>,
        config: Arc<ServiceInstanceConfiguration>,
        channel: Box<dyn TransportChannel>,
        codec: Box<dyn PduCodec>,
    ) -> Result<Self, ServiceError> {
        Self::with_side(peers, config, channel, codec, UserSide::default())
    }

    /// Request the delivery of the frames between the given earth receive times which pass
    /// the service specific filter. Open bounds are only allowed in online delivery modes.
    pub fn start(
        &self,
        start_time: Option<CdsTimestamp>,
        stop_time: Option<CdsTimestamp>,
        filter: RequestedFrameFilter,
    ) {
        self.submit(move |session| session.start(start_time, stop_time, filter));
    }

    pub fn stop(&self) {
        self.submit(|session| session.stop());
    }

    pub fn get_parameter(&self, parameter: ParameterName) {
        self.submit(move |session| session.get_parameter(parameter));
    }

    /// Request a status report. A period of [None] requests a single immediate report,
    /// `is_stop` ends the periodic reporting.
    pub fn schedule_status_report(&self, is_stop: bool, period: Option<u32>) {
        let request = match (is_stop, period) {
            (true, _) => ReportRequestType::Stop,
            (false, Some(period)) => ReportRequestType::Periodically(period),
            (false, None) => ReportRequestType::Immediately,
        };
        self.submit(move |session| session.schedule_status_report(request));
    }

    pub fn reception_counters(&self) -> ReceptionCounters {
        *self.shared.lock()
    }
}

impl Session<UserSide> {
    fn start(
        &mut self,
        start_time: Option<CdsTimestamp>,
        stop_time: Option<CdsTimestamp>,
        filter: RequestedFrameFilter,
    ) {
        if self.state() != BindingState::Ready {
            return self.sequencing_error(format!("START invoked in state {:?}", self.state()));
        }
        if filter.service_type() != self.config.service_type {
            return self.sequencing_error(format!(
                "START with {:?} filter on a {:?} service instance",
                filter.service_type(),
                self.config.service_type
            ));
        }
        let invoke_id = self.next_invoke_id();
        let invocation = SlePdu::StartInvocation(StartInvocation {
            invoker_credentials: Credentials::Unused,
            invoke_id,
            start_time,
            stop_time,
            filter,
        });
        if self.send_confirmed(invocation, ReturnKey::Invoke(invoke_id)) {
            self.side.requested_filter = Some(filter);
            self.set_state(BindingState::StartPending);
        }
    }

    fn stop(&mut self) {
        if self.state() != BindingState::Active {
            return self.sequencing_error(format!("STOP invoked in state {:?}", self.state()));
        }
        let invoke_id = self.next_invoke_id();
        let invocation = SlePdu::StopInvocation(StopInvocation {
            invoker_credentials: Credentials::Unused,
            invoke_id,
        });
        if self.send_confirmed(invocation, ReturnKey::Invoke(invoke_id)) {
            self.set_state(BindingState::StopPending);
        }
    }

    fn get_parameter(&mut self, parameter: ParameterName) {
        if !matches!(self.state(), BindingState::Ready | BindingState::Active) {
            return self.sequencing_error(format!(
                "GET-PARAMETER invoked in state {:?}",
                self.state()
            ));
        }
        let invoke_id = self.next_invoke_id();
        let invocation = SlePdu::GetParameterInvocation(GetParameterInvocation {
            invoker_credentials: Credentials::Unused,
            invoke_id,
            parameter,
        });
        self.send_confirmed(invocation, ReturnKey::Invoke(invoke_id));
    }

    fn schedule_status_report(&mut self, request: ReportRequestType) {
        if !matches!(self.state(), BindingState::Ready | BindingState::Active) {
            return self.sequencing_error(format!(
                "SCHEDULE-STATUS-REPORT invoked in state {:?}",
                self.state()
            ));
        }
        let invoke_id = self.next_invoke_id();
        let invocation = SlePdu::ScheduleStatusReportInvocation(ScheduleStatusReportInvocation {
            invoker_credentials: Credentials::Unused,
            invoke_id,
            request,
        });
        self.send_confirmed(invocation, ReturnKey::Invoke(invoke_id));
    }

    fn handle_start_return(&mut self, pdu: SlePdu) {
        if self.state() != BindingState::StartPending || !self.take_pending_return(&pdu) {
            let message = format!("START-RETURN received in state {:?}", self.state());
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::StartReturn(start_return) = pdu else {
            return;
        };
        match start_return.result {
            Ok(()) => {
                info!(si = %self.si, filter = ?self.side.requested_filter, "data delivery started");
                self.set_state(BindingState::Active);
            }
            Err(diagnostic) => self.abort_association(
                PeerAbortDiagnostic::OtherReason,
                format!("START rejected by the provider with {diagnostic:?}"),
            ),
        }
    }

    fn handle_stop_return(&mut self, pdu: SlePdu) {
        if self.state() != BindingState::StopPending || !self.take_pending_return(&pdu) {
            let message = format!("STOP-RETURN received in state {:?}", self.state());
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::StopReturn(stop_return) = pdu else {
            return;
        };
        match stop_return.result {
            Ok(()) => {
                info!(si = %self.si, "data delivery stopped");
                self.side.requested_filter = None;
                self.set_state(BindingState::Ready);
            }
            Err(diagnostic) => self.abort_association(
                PeerAbortDiagnostic::OtherReason,
                format!("STOP rejected by the provider with {diagnostic:?}"),
            ),
        }
    }

    fn handle_get_parameter_return(&mut self, pdu: SlePdu) {
        if !self.state().is_bound() || !self.take_pending_return(&pdu) {
            let message = format!("unexpected GET-PARAMETER-RETURN in state {:?}", self.state());
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::GetParameterReturn(parameter_return) = pdu else {
            return;
        };
        match parameter_return.result {
            Ok(value) => {
                debug!(si = %self.si, ?value, "parameter received");
                self.update_snapshot(|snapshot| snapshot.last_parameter = Some(value));
            }
            Err(diagnostic) => {
                return self.abort_association(
                    PeerAbortDiagnostic::OtherReason,
                    format!("GET-PARAMETER rejected with {diagnostic:?}"),
                )
            }
        }
        self.publish_state();
    }

    fn handle_schedule_status_report_return(&mut self, pdu: SlePdu) {
        if !self.state().is_bound() || !self.take_pending_return(&pdu) {
            let message = format!(
                "unexpected SCHEDULE-STATUS-REPORT-RETURN in state {:?}",
                self.state()
            );
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::ScheduleStatusReportReturn(schedule_return) = pdu else {
            return;
        };
        if let Err(diagnostic) = schedule_return.result {
            self.abort_association(
                PeerAbortDiagnostic::OtherReason,
                format!("SCHEDULE-STATUS-REPORT rejected with {diagnostic:?}"),
            );
        }
    }

    fn handle_transfer_buffer(&mut self, pdu: SlePdu) {
        if !matches!(
            self.state(),
            BindingState::Active | BindingState::StopPending
        ) {
            let message = format!("TRANSFER-BUFFER received in state {:?}", self.state());
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::TransferBuffer(buffer) = pdu else {
            return;
        };
        let mut counters = self.side.counters.lock();
        counters.transfer_buffers += 1;
        for entry in &buffer.entries {
            match entry {
                FrameOrNotification::Frame(_) => counters.frames += 1,
                FrameOrNotification::Notification(notification) => {
                    counters.notifications += 1;
                    match &notification.notification {
                        Notification::EndOfData => info!(si = %self.si, "end of data"),
                        Notification::ExcessiveDataBacklog => {
                            warn!(si = %self.si, "provider discarded data")
                        }
                        other => debug!(si = %self.si, notification = ?other, "sync notification"),
                    }
                }
            }
        }
    }

    fn handle_status_report(&mut self, pdu: SlePdu) {
        if !self.state().is_bound() {
            let message = format!("STATUS-REPORT received in state {:?}", self.state());
            return self.protocol_violation(pdu, message);
        }
        let SlePdu::StatusReport(report) = pdu else {
            return;
        };
        debug!(si = %self.si, delivered = report.delivered_frame_number, "status report");
        self.side.counters.lock().status_reports += 1;
        self.update_snapshot(|snapshot| snapshot.last_status_report = Some(report));
        self.publish_state();
    }
}
