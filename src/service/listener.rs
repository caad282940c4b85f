use crate::dispatch::{ExecutorHandle, TaskOrigin};
use crate::pdu::SlePdu;
use crate::service::StateSnapshot;
use std::sync::Arc;
use tracing::trace;

/// Observer of a service instance.
///
/// All callbacks are invoked on the notification thread of the instance, never on the
/// thread processing the protocol, so a slow listener only delays other notifications.
#[allow(unused_variables)]
pub trait ServiceInstanceListener: Send + Sync {
    fn on_state_updated(&self, si: &str, state: &StateSnapshot) {}

    fn on_pdu_sent(&self, si: &str, pdu: &SlePdu) {}

    fn on_pdu_sent_error(&self, si: &str, pdu: &SlePdu, error: &str) {}

    fn on_pdu_received(&self, si: &str, pdu: &SlePdu) {}

    fn on_pdu_decoding_error(&self, si: &str, raw: &[u8]) {}

    fn on_pdu_handling_error(&self, si: &str, pdu: &SlePdu, error: &str) {}
}

#[derive(Debug, Clone)]
pub(crate) enum ListenerEvent {
    StateUpdated(StateSnapshot),
    PduSent(SlePdu),
    PduSentError(SlePdu, String),
    PduReceived(SlePdu),
    PduDecodingError(Vec<u8>),
    PduHandlingError(SlePdu, String),
}

/// Context of the notification executor.
pub(crate) struct ListenerSet {
    si: Arc<str>,
    listeners: Vec<Arc<dyn ServiceInstanceListener>>,
}

impl ListenerSet {
    pub fn new(si: Arc<str>) -> Self {
        Self {
            si,
            listeners: Vec::new(),
        }
    }

    pub fn register(&mut self, listener: Arc<dyn ServiceInstanceListener>) {
        if !self.listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            self.listeners.push(listener);
        }
    }

    pub fn deregister(&mut self, listener: &Arc<dyn ServiceInstanceListener>) {
        self.listeners.retain(|known| !Arc::ptr_eq(known, listener));
    }

    fn dispatch(&self, event: &ListenerEvent) {
        let si = &*self.si;
        for listener in &self.listeners {
            match event {
                ListenerEvent::StateUpdated(state) => listener.on_state_updated(si, state),
                ListenerEvent::PduSent(pdu) => listener.on_pdu_sent(si, pdu),
                ListenerEvent::PduSentError(pdu, error) => {
                    listener.on_pdu_sent_error(si, pdu, error)
                }
                ListenerEvent::PduReceived(pdu) => listener.on_pdu_received(si, pdu),
                ListenerEvent::PduDecodingError(raw) => listener.on_pdu_decoding_error(si, raw),
                ListenerEvent::PduHandlingError(pdu, error) => {
                    listener.on_pdu_handling_error(si, pdu, error)
                }
            }
        }
    }
}

/// Handle used by the protocol thread to queue listener notifications.
#[derive(Clone)]
pub(crate) struct Notifier {
    executor: ExecutorHandle<ListenerSet>,
}

impl Notifier {
    pub fn new(executor: ExecutorHandle<ListenerSet>) -> Self {
        Self { executor }
    }

    pub fn emit(&self, event: ListenerEvent) {
        if !self
            .executor
            .submit(TaskOrigin::FromProvider, move |set: &mut ListenerSet| {
                set.dispatch(&event)
            })
        {
            trace!("notification dropped, listener executor shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SerialExecutor;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<crate::BindingState>>,
    }

    impl ServiceInstanceListener for Recorder {
        fn on_state_updated(&self, _si: &str, state: &StateSnapshot) {
            self.states.lock().push(state.binding_state);
        }
    }

    fn flush(executor: &SerialExecutor<ListenerSet>) {
        let (tx, rx) = mpsc::channel();
        executor.submit(TaskOrigin::FromProvider, move |_| tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_events_reach_registered_listeners_once() {
        let executor =
            SerialExecutor::new("test-notifier", ListenerSet::new(Arc::from("si"))).unwrap();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn ServiceInstanceListener> = recorder.clone();
        let registered = listener.clone();
        let duplicate = listener.clone();
        executor.submit(TaskOrigin::FromUser, move |set| {
            set.register(registered);
            set.register(duplicate);
        });
        let notifier = Notifier::new(executor.handle());
        let snapshot = StateSnapshot {
            binding_state: crate::BindingState::Ready,
            ..Default::default()
        };
        notifier.emit(ListenerEvent::StateUpdated(snapshot));
        flush(&executor);
        assert_eq!(*recorder.states.lock(), vec![crate::BindingState::Ready]);

        executor.submit(TaskOrigin::FromUser, move |set| set.deregister(&listener));
        notifier.emit(ListenerEvent::StateUpdated(StateSnapshot::default()));
        flush(&executor);
        assert_eq!(recorder.states.lock().len(), 1);
    }
}
