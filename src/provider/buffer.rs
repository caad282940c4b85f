//! # Transfer buffering engine
//!
//! Frames and notifications offered by the data production are collected in a bounded
//! [TransferBuffer]. The buffer is handed to the session executor for transmission when it
//! is full, when the latency limit elapsed or when a notification forces the flush. At most
//! one buffer is in transmission at a time. What happens to a buffer which becomes ready
//! while the previous one is still in transmission depends on the [DeliveryMode]:
//!
//!  - [DeliveryMode::TimelyOnline]: the new buffer is discarded and the next buffer starts
//!    with an excessive data backlog notification. The producer never blocks.
//!  - all other modes: the producer blocks until the transmission completed.
//!
//! A STOP hands the residual entries over for transmission before data delivery ends.
//!
//! All producer side operations may be called from any thread.
use super::{admission_for, FrameAdmission, ProviderSide, ReceivedFrame};
use crate::config::{DeliveryMode, ServiceInstanceConfiguration};
use crate::credentials::Credentials;
use crate::dispatch::{ExecutorHandle, TaskOrigin, TimerHandle, TimerId};
use crate::frame::FrameQuality;
use crate::pdu::{
    FrameOrNotification, LockStatus, Notification, ParameterName, ParameterValue,
    ProductionStatus, RequestedFrameFilter, StartDiagnostic, StatusReportInvocation,
    SyncNotifyInvocation, TransferBuffer,
};
use crate::service::Session;
use crate::time::CdsTimestamp;
use crate::ServiceType;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Production and receiver lock state as last reported by the data production.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProductionState {
    pub production_status: ProductionStatus,
    pub carrier_lock_status: LockStatus,
    pub subcarrier_lock_status: LockStatus,
    pub symbol_sync_lock_status: LockStatus,
    /// Derived from the other lock states: in lock if every used stage is in lock.
    pub frame_sync_lock_status: LockStatus,
}

impl Default for ProductionState {
    fn default() -> Self {
        Self {
            production_status: ProductionStatus::Unknown,
            carrier_lock_status: LockStatus::Unknown,
            subcarrier_lock_status: LockStatus::Unknown,
            symbol_sync_lock_status: LockStatus::Unknown,
            frame_sync_lock_status: LockStatus::Unknown,
        }
    }
}

/// Frame counters for the STATUS-REPORT, counted when a transfer buffer was sent.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct DeliveredFrames {
    pub frames: u64,
    pub error_free: u64,
}

impl DeliveredFrames {
    pub fn count(buffer: &TransferBuffer) -> Self {
        buffer.frames().fold(Self::default(), |mut counted, frame| {
            counted.frames += 1;
            if frame.delivered_frame_quality == Some(FrameQuality::Good) {
                counted.error_free += 1;
            }
            counted
        })
    }
}

struct Dispatcher {
    executor: ExecutorHandle<Session<ProviderSide>>,
    timers: TimerHandle,
}

struct LatencyTimer {
    token: u64,
    id: TimerId,
}

struct BufferState {
    /// Entries are only accepted while data delivery is started.
    active: bool,
    under_transmission: bool,
    constructing: TransferBuffer,
    /// Incremented with every start and stop, outdates queued transmissions.
    generation: u64,
    latency_timer: Option<LatencyTimer>,
    next_timer_token: u64,
    admission: Box<dyn FrameAdmission>,
    start_time: Option<CdsTimestamp>,
    stop_time: Option<CdsTimestamp>,
    delivered: DeliveredFrames,
    discarded_buffers: u64,
}

impl BufferState {
    fn in_time_window(&self, earth_receive_time: &CdsTimestamp) -> bool {
        self.start_time.map_or(true, |start| *earth_receive_time >= start)
            && self.stop_time.map_or(true, |stop| *earth_receive_time <= stop)
    }
}

/// Bounded transfer buffer shared by the data production and the provider session.
///
/// The latency timer measures the age of the oldest entry of the buffer under construction:
///
///  - it is armed by the first entry of an empty buffer,
///  - it restarts when a flush is postponed or the buffer is discarded,
///  - it is cancelled when the buffer is handed over.
///
/// No entry waits longer than the latency limit and an empty buffer has no timer pending.
pub struct TransferBufferEngine {
    si: Arc<str>,
    service_type: ServiceType,
    delivery_mode: DeliveryMode,
    capacity: usize,
    latency: Option<Duration>,
    state: Mutex<BufferState>,
    transmitted: Condvar,
    production: Mutex<ProductionState>,
    dispatcher: OnceLock<Dispatcher>,
}

impl TransferBufferEngine {
    pub fn new(config: &ServiceInstanceConfiguration) -> Self {
        let capacity = config.transfer_buffer_size.max(1) as usize;
        Self {
            si: Arc::from(config.service_instance_identifier.as_str()),
            service_type: config.service_type,
            delivery_mode: config.delivery_mode,
            capacity,
            latency: config.latency(),
            state: Mutex::new(BufferState {
                active: false,
                under_transmission: false,
                constructing: TransferBuffer::with_capacity(capacity),
                generation: 0,
                latency_timer: None,
                next_timer_token: 0,
                admission: admission_for(&config.service_specific),
                start_time: None,
                stop_time: None,
                delivered: DeliveredFrames::default(),
                discarded_buffers: 0,
            }),
            transmitted: Condvar::new(),
            production: Mutex::new(ProductionState::default()),
            dispatcher: OnceLock::new(),
        }
    }

    pub(crate) fn attach(&self, executor: ExecutorHandle<Session<ProviderSide>>, timers: TimerHandle) {
        if self
            .dispatcher
            .set(Dispatcher { executor, timers })
            .is_err()
        {
            warn!(si = %self.si, "transfer buffer engine already attached");
        }
    }

    /// Whether data delivery is started and frames are accepted.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Number of entries in the buffer under construction.
    pub fn buffered_len(&self) -> usize {
        self.state.lock().constructing.len()
    }

    /// Number of buffers discarded because the previous buffer was still in transmission.
    pub fn discarded_buffers(&self) -> u64 {
        self.state.lock().discarded_buffers
    }

    pub fn production_state(&self) -> ProductionState {
        *self.production.lock()
    }

    /// Offer a received frame. Returns whether the frame passed the time window and the
    /// service specific selection and was added to the transfer buffer.
    ///
    /// In the blocking delivery modes this call blocks while the previous buffer is in
    /// transmission and the current one is full.
    pub fn transfer_data(&self, frame: ReceivedFrame) -> bool {
        let mut state = self.state.lock();
        if !state.active
            || !state.in_time_window(&frame.earth_receive_time)
            || !state.admission.admit(&frame)
        {
            trace!(si = %self.si, quality = ?frame.quality, "frame not selected");
            return false;
        }
        let entry = FrameOrNotification::Frame(state.admission.build_entry(&frame));
        self.append(&mut state, entry, false)
    }

    /// Notify the user that the data production discarded data.
    pub fn data_discarded(&self) -> bool {
        self.append_notification(Notification::ExcessiveDataBacklog)
    }

    /// Notify the user that no more data will be delivered.
    pub fn end_of_data(&self) -> bool {
        self.append_notification(Notification::EndOfData)
    }

    /// Report the receiver lock states and the production status. Loss of frame
    /// synchronisation and production status changes are notified to the user while data
    /// delivery is started in an online delivery mode.
    pub fn update_production_status(
        &self,
        time: CdsTimestamp,
        carrier: LockStatus,
        subcarrier: LockStatus,
        symbol: LockStatus,
        production: ProductionStatus,
    ) {
        let frame_sync = if carrier.is_locked() && subcarrier.is_locked() && symbol.is_locked() {
            LockStatus::InLock
        } else {
            LockStatus::OutOfLock
        };
        let previous = {
            let mut current = self.production.lock();
            let previous = *current;
            *current = ProductionState {
                production_status: production,
                carrier_lock_status: carrier,
                subcarrier_lock_status: subcarrier,
                symbol_sync_lock_status: symbol,
                frame_sync_lock_status: frame_sync,
            };
            previous
        };
        if previous.production_status != production {
            info!(si = %self.si, from = ?previous.production_status, to = ?production, "production status changed");
            self.append_status_notification(Notification::ProductionStatusChange(production));
        }
        if frame_sync == LockStatus::OutOfLock && previous.frame_sync_lock_status != LockStatus::OutOfLock
        {
            info!(si = %self.si, ?carrier, ?subcarrier, ?symbol, "frame synchronisation lost");
            self.append_status_notification(Notification::LossFrameSync {
                time,
                carrier_lock_status: carrier,
                subcarrier_lock_status: subcarrier,
                symbol_sync_lock_status: symbol,
            });
        }
    }

    fn append_status_notification(&self, notification: Notification) {
        if self.delivery_mode.is_offline() {
            return;
        }
        self.append_notification(notification);
    }

    fn append_notification(&self, notification: Notification) -> bool {
        let mut state = self.state.lock();
        if !state.active {
            return false;
        }
        let entry = FrameOrNotification::Notification(SyncNotifyInvocation {
            invoker_credentials: Credentials::Unused,
            notification,
        });
        self.append(&mut state, entry, true)
    }

    fn append(
        &self,
        state: &mut MutexGuard<'_, BufferState>,
        entry: FrameOrNotification,
        forced: bool,
    ) -> bool {
        // Flush a buffer left full by a postponed flush first.
        self.check_buffer(state, false, true);
        if !state.active {
            return false;
        }
        if state.constructing.len() >= self.capacity {
            warn!(si = %self.si, "transfer buffer full, entry dropped");
            return false;
        }
        state.constructing.entries.push(entry);
        self.arm_latency_timer(state);
        self.check_buffer(state, forced, true);
        true
    }

    fn backlog_buffer(&self) -> TransferBuffer {
        let mut buffer = TransferBuffer::with_capacity(self.capacity);
        buffer
            .entries
            .push(FrameOrNotification::Notification(SyncNotifyInvocation {
                invoker_credentials: Credentials::Unused,
                notification: Notification::ExcessiveDataBacklog,
            }));
        buffer
    }

    /// Hand the buffer under construction over for transmission if it is full or the
    /// flush is forced. Must not block if `may_block` is false, a flush which would block
    /// is postponed to the next latency timeout then.
    fn check_buffer(&self, state: &mut MutexGuard<'_, BufferState>, forced: bool, may_block: bool) {
        let full = state.constructing.len() >= self.capacity;
        if state.constructing.is_empty() || !(full || forced) {
            return;
        }
        while state.under_transmission {
            match self.delivery_mode {
                DeliveryMode::TimelyOnline => {
                    let discarded =
                        std::mem::replace(&mut state.constructing, self.backlog_buffer());
                    state.discarded_buffers += 1;
                    state.admission.buffer_discarded();
                    warn!(
                        si = %self.si,
                        entries = discarded.len(),
                        "previous transfer buffer still in transmission, buffer discarded"
                    );
                    self.restart_latency_timer(state);
                    return;
                }
                _ if !may_block => {
                    debug!(si = %self.si, "transmission in progress, flush postponed");
                    self.restart_latency_timer(state);
                    return;
                }
                _ => {
                    self.transmitted.wait(state);
                    if !state.active {
                        return;
                    }
                }
            }
        }
        // Another producer may have flushed while this one was waiting.
        if state.constructing.is_empty() {
            return;
        }
        self.cancel_latency_timer(state);
        let handed_over = self.hand_off_constructing(state);
        state.under_transmission = handed_over;
    }

    fn hand_off_constructing(&self, state: &mut BufferState) -> bool {
        let buffer = std::mem::replace(
            &mut state.constructing,
            TransferBuffer::with_capacity(self.capacity),
        );
        state.admission.buffer_handed_over();
        self.hand_off(buffer, state.generation)
    }

    fn hand_off(&self, buffer: TransferBuffer, generation: u64) -> bool {
        let Some(dispatcher) = self.dispatcher.get() else {
            warn!(si = %self.si, "transfer buffer engine not attached, buffer dropped");
            return false;
        };
        trace!(si = %self.si, entries = buffer.len(), "transfer buffer handed over");
        dispatcher.executor.submit(
            TaskOrigin::FromProvider,
            move |session: &mut Session<ProviderSide>| session.transmit_buffer(buffer, generation),
        )
    }

    /// Called by the session once a handed over buffer was sent or dropped.
    pub(crate) fn transmission_done(&self, generation: u64, delivered: Option<DeliveredFrames>) {
        {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.under_transmission = false;
                if let Some(delivered) = delivered {
                    state.delivered.frames += delivered.frames;
                    state.delivered.error_free += delivered.error_free;
                }
            }
        }
        self.transmitted.notify_all();
    }

    /// Whether a buffer handed over in this generation may still be sent. Buffers handed
    /// over before a STOP stay current until the stop is completed.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn arm_latency_timer(&self, state: &mut BufferState) {
        if state.latency_timer.is_some() || state.constructing.is_empty() {
            return;
        }
        let (Some(latency), Some(dispatcher)) = (self.latency, self.dispatcher.get()) else {
            return;
        };
        let token = state.next_timer_token;
        state.next_timer_token += 1;
        let executor = dispatcher.executor.clone();
        let id = dispatcher.timers.schedule(latency, move || {
            executor.submit(
                TaskOrigin::FromProvider,
                move |session: &mut Session<ProviderSide>| session.side.engine.latency_elapsed(token),
            );
        });
        if let Some(id) = id {
            state.latency_timer = Some(LatencyTimer { token, id });
        }
    }

    fn cancel_latency_timer(&self, state: &mut BufferState) {
        let Some(timer) = state.latency_timer.take() else {
            return;
        };
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.timers.cancel(timer.id);
        }
    }

    fn restart_latency_timer(&self, state: &mut BufferState) {
        self.cancel_latency_timer(state);
        self.arm_latency_timer(state);
    }

    pub(crate) fn latency_elapsed(&self, token: u64) {
        let mut state = self.state.lock();
        // cancelled or restarted meanwhile
        if state.latency_timer.as_ref().map(|timer| timer.token) != Some(token) {
            return;
        }
        state.latency_timer = None;
        if !state.active {
            return;
        }
        trace!(si = %self.si, entries = state.constructing.len(), "latency limit elapsed");
        self.check_buffer(&mut state, true, false);
    }

    /// Apply the filter of a START invocation and start accepting data.
    pub(crate) fn start(
        &self,
        start_time: Option<CdsTimestamp>,
        stop_time: Option<CdsTimestamp>,
        filter: &RequestedFrameFilter,
    ) -> Result<(), StartDiagnostic> {
        let mut state = self.state.lock();
        state.admission.configure(filter)?;
        state.start_time = start_time;
        state.stop_time = stop_time;
        state.generation += 1;
        state.constructing = TransferBuffer::with_capacity(self.capacity);
        state.under_transmission = false;
        state.active = true;
        debug!(si = %self.si, ?filter, "transfer buffering started");
        Ok(())
    }

    fn deactivate(&self, state: &mut BufferState) {
        if !state.constructing.is_empty() {
            info!(
                si = %self.si,
                entries = state.constructing.len(),
                "residual transfer buffer discarded"
            );
        }
        self.cancel_latency_timer(state);
        state.active = false;
        state.under_transmission = false;
        state.generation += 1;
        state.constructing = TransferBuffer::with_capacity(self.capacity);
        state.admission.clear();
        state.start_time = None;
        state.stop_time = None;
    }

    /// Stop accepting data and hand the residual entries over for transmission, behind the
    /// buffer which may still be in transmission. Blocked producers return.
    ///
    /// Called from the session, which completes the stop with [Self::finish_stop] once the
    /// handed over buffers were processed.
    pub(crate) fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.active = false;
            self.cancel_latency_timer(&mut state);
            if !state.constructing.is_empty() {
                debug!(
                    si = %self.si,
                    entries = state.constructing.len(),
                    "residual transfer buffer handed over"
                );
                if self.hand_off_constructing(&mut state) {
                    state.under_transmission = true;
                }
            }
        }
        self.transmitted.notify_all();
    }

    /// Outdate everything handed over so far and clear the selection.
    pub(crate) fn finish_stop(&self) {
        let mut state = self.state.lock();
        self.deactivate(&mut state);
    }

    /// Stop accepting data and clear the counters of the association.
    pub(crate) fn reset(&self) {
        {
            let mut state = self.state.lock();
            self.deactivate(&mut state);
            state.delivered = DeliveredFrames::default();
            state.discarded_buffers = 0;
        }
        self.transmitted.notify_all();
    }

    pub(crate) fn parameter(&self, name: ParameterName) -> Option<ParameterValue> {
        self.state.lock().admission.parameter(name)
    }

    pub(crate) fn status_report(&self) -> StatusReportInvocation {
        let delivered = self.state.lock().delivered;
        let production = self.production_state();
        StatusReportInvocation {
            invoker_credentials: Credentials::Unused,
            error_free_frame_number: (self.service_type == ServiceType::Raf)
                .then_some(delivered.error_free),
            delivered_frame_number: delivered.frames,
            frame_sync_lock_status: production.frame_sync_lock_status,
            symbol_sync_lock_status: production.symbol_sync_lock_status,
            subcarrier_lock_status: production.subcarrier_lock_status,
            carrier_lock_status: production.carrier_lock_status,
            production_status: production.production_status,
        }
    }
}
