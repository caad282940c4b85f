use crate::config::{
    AuthenticationMode, DeliveryMode, HashFunction, InitiatorSide, PeerConfiguration, RemotePeer,
    ServiceInstanceConfiguration, ServiceSpecificConfiguration,
};
use crate::frame::Gvcid;
use crate::pdu::{
    CodecError, ControlWordType, PduCodec, RequestedFrameQuality, SlePdu, UpdateMode,
};
use crate::transport::{ChannelError, ChannelObserver, DisconnectReason, TransportChannel};
use crate::ServiceType;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const USER_ID: &str = "MCS";
pub const PROVIDER_ID: &str = "GS";

/// Peer configuration of one side, knowing the other side as its only remote peer.
pub fn peer_config(local_id: &str, mode: AuthenticationMode) -> PeerConfiguration {
    let remote_id = if local_id == USER_ID {
        PROVIDER_ID
    } else {
        USER_ID
    };
    PeerConfiguration {
        local_id: local_id.to_string(),
        local_password: format!("{local_id}-pw").into_bytes(),
        remote_peers: vec![RemotePeer {
            id: remote_id.to_string(),
            authentication_mode: mode,
            authentication_hash: HashFunction::Sha256,
            password: format!("{remote_id}-pw").into_bytes(),
        }],
        authentication_delay: 60,
    }
}

fn base_config(
    service_type: ServiceType,
    delivery_mode: DeliveryMode,
    service_specific: ServiceSpecificConfiguration,
) -> ServiceInstanceConfiguration {
    ServiceInstanceConfiguration {
        service_instance_identifier: format!(
            "sagr=1.spack=1.rsl-fg=1.{}=onlt1",
            format!("{service_type:?}").to_lowercase()
        ),
        service_type,
        initiator: InitiatorSide::User,
        initiator_id: USER_ID.to_string(),
        responder_id: PROVIDER_ID.to_string(),
        responder_port_id: "RETURN_PORT".to_string(),
        return_timeout_period: 30,
        delivery_mode,
        latency_limit: if delivery_mode.is_online() {
            Some(1)
        } else {
            None
        },
        transfer_buffer_size: 10,
        min_reporting_cycle: Some(2),
        max_reporting_cycle: Some(600),
        service_specific,
    }
}

pub fn raf_config(delivery_mode: DeliveryMode) -> ServiceInstanceConfiguration {
    base_config(
        ServiceType::Raf,
        delivery_mode,
        ServiceSpecificConfiguration::Raf {
            permitted_frame_quality: vec![
                RequestedFrameQuality::GoodFramesOnly,
                RequestedFrameQuality::ErredFramesOnly,
                RequestedFrameQuality::AllFrames,
            ],
        },
    )
}

pub fn rcf_config(delivery_mode: DeliveryMode) -> ServiceInstanceConfiguration {
    base_config(
        ServiceType::Rcf,
        delivery_mode,
        ServiceSpecificConfiguration::Rcf {
            permitted_gvcids: vec![Gvcid::new(0x2a, 0, Some(1)), Gvcid::master_channel(0x2a, 0)],
        },
    )
}

pub fn rocf_config(delivery_mode: DeliveryMode) -> ServiceInstanceConfiguration {
    base_config(
        ServiceType::Rocf,
        delivery_mode,
        ServiceSpecificConfiguration::Rocf {
            permitted_gvcids: vec![Gvcid::new(0x2a, 0, Some(1))],
            permitted_tc_vcids: vec![0, 3],
            permitted_control_word_types: vec![
                ControlWordType::All,
                ControlWordType::Clcw,
                ControlWordType::NotClcw,
            ],
            permitted_update_modes: vec![UpdateMode::Continuous, UpdateMode::ChangeBased],
        },
    )
}

#[derive(Debug, Default)]
pub struct PostcardCodec {
    pub version: Option<u16>,
}

impl PduCodec for PostcardCodec {
    fn encode(&self, pdu: &SlePdu) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(pdu).map_err(|error| CodecError::Encoding(error.to_string()))
    }

    fn decode(&self, raw: &[u8]) -> Result<SlePdu, CodecError> {
        postcard::from_bytes(raw).map_err(|error| CodecError::Decoding(error.to_string()))
    }

    fn use_protocol_version(&mut self, version: u16) {
        self.version = Some(version);
    }
}

pub fn encode(pdu: &SlePdu) -> Vec<u8> {
    postcard::to_allocvec(pdu).unwrap()
}

#[derive(Default)]
struct MockChannelState {
    observer: Option<Arc<dyn ChannelObserver>>,
    sent: Vec<Vec<u8>>,
    connects: u32,
    listens: u32,
    disconnects: u32,
    aborts: Vec<u8>,
    fail_send: bool,
}

/// Channel recording everything the service instance does with it. Clones share the
/// recorded state, so the test keeps one clone to inspect and to inject PDUs.
#[derive(Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<MockChannelState>>,
}

impl MockChannel {
    pub fn boxed(&self) -> Box<dyn TransportChannel> {
        Box::new(self.clone())
    }

    pub fn sent(&self) -> Vec<SlePdu> {
        self.state
            .lock()
            .sent
            .iter()
            .map(|raw| postcard::from_bytes(raw).unwrap())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn last_sent(&self) -> Option<SlePdu> {
        self.sent().pop()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn listens(&self) -> u32 {
        self.state.lock().listens
    }

    pub fn disconnects(&self) -> u32 {
        self.state.lock().disconnects
    }

    pub fn aborts(&self) -> Vec<u8> {
        self.state.lock().aborts.clone()
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.state.lock().fail_send = fail;
    }

    fn observer(&self) -> Arc<dyn ChannelObserver> {
        self.state.lock().observer.clone().unwrap()
    }

    pub fn inject(&self, pdu: &SlePdu) {
        self.observer().on_pdu_received(encode(pdu));
    }

    pub fn inject_raw(&self, raw: Vec<u8>) {
        self.observer().on_pdu_received(raw);
    }

    pub fn inject_disconnect(&self, reason: DisconnectReason) {
        self.observer().on_disconnected(reason);
    }
}

impl TransportChannel for MockChannel {
    fn register_observer(&mut self, observer: Arc<dyn ChannelObserver>) {
        self.state.lock().observer = Some(observer);
    }

    fn connect(&mut self) -> Result<(), ChannelError> {
        self.state.lock().connects += 1;
        Ok(())
    }

    fn listen(&mut self) -> Result<(), ChannelError> {
        self.state.lock().listens += 1;
        Ok(())
    }

    fn send_pdu(&mut self, raw: &[u8]) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.fail_send {
            return Err(ChannelError::SendFailed("broken pipe".to_string()));
        }
        state.sent.push(raw.to_vec());
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state.lock().disconnects += 1;
    }

    fn abort(&mut self, diagnostic: u8) {
        self.state.lock().aborts.push(diagnostic);
    }
}

/// Poll the condition until it holds or a few seconds passed.
pub fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
