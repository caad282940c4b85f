//! User and provider service instances talking over an in-memory transport.
use parking_lot::Mutex;
use sleservices::config::{
    AuthenticationMode, DeliveryMode, HashFunction, InitiatorSide, PeerConfiguration, RemotePeer,
    ServiceInstanceConfiguration, ServiceSpecificConfiguration,
};
use sleservices::credentials::Credentials;
use sleservices::frame::FrameQuality;
use sleservices::pdu::{
    BindReturn, CodecError, ParameterName, ParameterValue, PduCodec, PeerAbortDiagnostic,
    RequestedFrameFilter, RequestedFrameQuality, SlePdu, UnbindReason,
};
use sleservices::provider::{ReceivedFrame, ReturnServiceProvider};
use sleservices::service::BindResponse;
use sleservices::time::CdsTimestamp;
use sleservices::transport::{ChannelError, ChannelObserver, DisconnectReason, TransportChannel};
use sleservices::user::ReturnServiceUser;
use sleservices::{BindingState, ServiceType};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

const USER_ID: &str = "MCS";
const PROVIDER_ID: &str = "GS";

#[derive(Default)]
struct Endpoint {
    observer: Mutex<Option<Arc<dyn ChannelObserver>>>,
}

impl Endpoint {
    fn observer(&self) -> Option<Arc<dyn ChannelObserver>> {
        self.observer.lock().clone()
    }
}

/// One end of an in-memory connection. Whatever is sent on one end is received by the
/// observer of the other end.
struct LoopbackChannel {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
}

fn loopback_pair() -> (LoopbackChannel, LoopbackChannel) {
    let first = Arc::new(Endpoint::default());
    let second = Arc::new(Endpoint::default());
    (
        LoopbackChannel {
            local: first.clone(),
            remote: second.clone(),
        },
        LoopbackChannel {
            local: second,
            remote: first,
        },
    )
}

impl TransportChannel for LoopbackChannel {
    fn register_observer(&mut self, observer: Arc<dyn ChannelObserver>) {
        *self.local.observer.lock() = Some(observer);
    }

    fn connect(&mut self) -> Result<(), ChannelError> {
        let remote = self.remote.observer().ok_or(ChannelError::NotConnected)?;
        remote.on_connected();
        Ok(())
    }

    fn send_pdu(&mut self, raw: &[u8]) -> Result<(), ChannelError> {
        let remote = self.remote.observer().ok_or(ChannelError::NotConnected)?;
        remote.on_pdu_received(raw.to_vec());
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(remote) = self.remote.observer() {
            remote.on_disconnected(DisconnectReason::Regular);
        }
    }

    fn abort(&mut self, diagnostic: u8) {
        let diagnostic =
            PeerAbortDiagnostic::try_from(diagnostic).unwrap_or(PeerAbortDiagnostic::OtherReason);
        if let Some(remote) = self.remote.observer() {
            remote.on_disconnected(DisconnectReason::PeerAbort(diagnostic));
        }
    }
}

#[derive(Default)]
struct PostcardCodec;

impl PduCodec for PostcardCodec {
    fn encode(&self, pdu: &SlePdu) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(pdu).map_err(|error| CodecError::Encoding(error.to_string()))
    }

    fn decode(&self, raw: &[u8]) -> Result<SlePdu, CodecError> {
        postcard::from_bytes(raw).map_err(|error| CodecError::Decoding(error.to_string()))
    }

    fn use_protocol_version(&mut self, _version: u16) {}
}

fn peers(local_id: &str, remote_id: &str, mode: AuthenticationMode) -> Arc<PeerConfiguration> {
    Arc::new(PeerConfiguration {
        local_id: local_id.to_string(),
        local_password: format!("{local_id}-secret").into_bytes(),
        remote_peers: vec![RemotePeer {
            id: remote_id.to_string(),
            authentication_mode: mode,
            authentication_hash: HashFunction::Sha256,
            password: format!("{remote_id}-secret").into_bytes(),
        }],
        authentication_delay: 30,
    })
}

fn raf_config(return_timeout_period: u32) -> Arc<ServiceInstanceConfiguration> {
    Arc::new(ServiceInstanceConfiguration {
        service_instance_identifier: "sagr=3.spack=facility-PASS1.rsl-fg=1.raf=onlt1".to_string(),
        service_type: ServiceType::Raf,
        initiator: InitiatorSide::User,
        initiator_id: USER_ID.to_string(),
        responder_id: PROVIDER_ID.to_string(),
        responder_port_id: "RAF_PORT".to_string(),
        return_timeout_period,
        delivery_mode: DeliveryMode::TimelyOnline,
        latency_limit: Some(1),
        transfer_buffer_size: 20,
        min_reporting_cycle: Some(2),
        max_reporting_cycle: Some(600),
        service_specific: ServiceSpecificConfiguration::Raf {
            permitted_frame_quality: vec![
                RequestedFrameQuality::GoodFramesOnly,
                RequestedFrameQuality::AllFrames,
            ],
        },
    })
}

fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn days_from(time: &CdsTimestamp, offset: i32) -> CdsTimestamp {
    let days = (time.ccsds_days() as i32 + offset) as u16;
    CdsTimestamp::new(days, 0, time.submillis()).unwrap()
}

#[test]
fn authenticated_raf_delivery() {
    let (user_end, provider_end) = loopback_pair();
    let config = raf_config(30);
    let provider = ReturnServiceProvider::new(
        peers(PROVIDER_ID, USER_ID, AuthenticationMode::All),
        config.clone(),
        Box::new(provider_end),
        Box::new(PostcardCodec),
    )
    .unwrap();
    let user = ReturnServiceUser::new(
        peers(USER_ID, PROVIDER_ID, AuthenticationMode::All),
        config,
        Box::new(user_end),
        Box::new(PostcardCodec),
    )
    .unwrap();

    provider.wait_for_bind(BindResponse::Accept);
    assert!(wait_for(|| provider.current_binding_state() == BindingState::UnboundWait));
    user.bind(5);
    assert!(wait_for(|| user.current_binding_state() == BindingState::Ready));
    assert_eq!(provider.current_binding_state(), BindingState::Ready);
    assert_eq!(user.current_state().version, Some(5));

    let now = CdsTimestamp::from_now().unwrap();
    user.start(
        Some(days_from(&now, -1)),
        Some(days_from(&now, 1)),
        RequestedFrameFilter::Raf(RequestedFrameQuality::GoodFramesOnly),
    );
    assert!(wait_for(|| user.current_binding_state() == BindingState::Active));
    assert_eq!(provider.current_binding_state(), BindingState::Active);

    let erred = ReceivedFrame::new(vec![0xaa; 48], FrameQuality::Erred, now);
    assert!(!provider.transfer_data(erred));
    let too_old = ReceivedFrame::new(vec![0xaa; 48], FrameQuality::Good, days_from(&now, -2));
    assert!(!provider.transfer_data(too_old));
    let good = ReceivedFrame::new(vec![0x55; 48], FrameQuality::Good, now);
    assert!(provider.transfer_data(good));
    assert_eq!(provider.buffered_len(), 1);

    // Flushed by the latency limit, every entry carries valid credentials.
    assert!(wait_for(|| user.reception_counters().frames == 1));
    assert_eq!(user.reception_counters().transfer_buffers, 1);
    assert_eq!(user.current_binding_state(), BindingState::Active);

    user.get_parameter(ParameterName::RequestedFrameQuality);
    assert!(wait_for(|| user.current_state().last_parameter.is_some()));
    assert_eq!(
        user.current_state().last_parameter,
        Some(ParameterValue::RequestedFrameQuality(Some(
            RequestedFrameQuality::GoodFramesOnly
        )))
    );

    user.stop();
    assert!(wait_for(|| user.current_binding_state() == BindingState::Ready));
    user.unbind(UnbindReason::End);
    assert!(wait_for(|| user.current_binding_state() == BindingState::Unbound));
    assert!(wait_for(|| provider.current_binding_state() == BindingState::Unbound));
    assert_eq!(user.current_state().last_error, None);
}

enum PeerEvent {
    Pdu(SlePdu),
    Disconnected(DisconnectReason),
}

/// Scripted provider end which reports everything it receives.
struct Inbox {
    events: Mutex<mpsc::Sender<PeerEvent>>,
}

impl ChannelObserver for Inbox {
    fn on_connected(&self) {}

    fn on_disconnected(&self, reason: DisconnectReason) {
        let _ = self.events.lock().send(PeerEvent::Disconnected(reason));
    }

    fn on_pdu_received(&self, raw: Vec<u8>) {
        if let Ok(pdu) = PostcardCodec.decode(&raw) {
            let _ = self.events.lock().send(PeerEvent::Pdu(pdu));
        }
    }
}

fn next_event(events: &mpsc::Receiver<PeerEvent>, timeout: Duration) -> PeerEvent {
    events
        .recv_timeout(timeout)
        .expect("no event received from the user")
}

#[test]
fn unanswered_start_times_out() {
    let (user_end, mut peer_end) = loopback_pair();
    let (tx, events) = mpsc::channel();
    peer_end.register_observer(Arc::new(Inbox {
        events: Mutex::new(tx),
    }));
    let user = ReturnServiceUser::new(
        peers(USER_ID, PROVIDER_ID, AuthenticationMode::None),
        raf_config(2),
        Box::new(user_end),
        Box::new(PostcardCodec),
    )
    .unwrap();

    user.bind(5);
    let PeerEvent::Pdu(SlePdu::BindInvocation(bind)) = next_event(&events, Duration::from_secs(2))
    else {
        panic!("BIND expected");
    };
    assert_eq!(bind.initiator_identifier, USER_ID);
    assert_eq!(bind.version_number, 5);
    let bind_return = SlePdu::BindReturn(BindReturn {
        performer_credentials: Credentials::Unused,
        responder_identifier: PROVIDER_ID.to_string(),
        result: Ok(5),
    });
    peer_end
        .send_pdu(&PostcardCodec.encode(&bind_return).unwrap())
        .unwrap();
    assert!(wait_for(|| user.current_binding_state() == BindingState::Ready));

    user.start(
        None,
        None,
        RequestedFrameFilter::Raf(RequestedFrameQuality::AllFrames),
    );
    let sent_at = Instant::now();
    assert!(matches!(
        next_event(&events, Duration::from_secs(2)),
        PeerEvent::Pdu(SlePdu::StartInvocation(_))
    ));
    assert!(wait_for(|| user.current_binding_state() == BindingState::StartPending));

    // The peer stays silent.
    assert!(matches!(
        next_event(&events, Duration::from_secs(5)),
        PeerEvent::Disconnected(DisconnectReason::PeerAbort(
            PeerAbortDiagnostic::ReturnTimeout
        ))
    ));
    assert!(sent_at.elapsed() >= Duration::from_millis(1900));
    assert!(wait_for(|| user.current_binding_state() == BindingState::Unbound));
    let last_error = user.current_state().last_error.unwrap_or_default();
    assert!(last_error.contains("return timeout"), "{last_error}");
}
