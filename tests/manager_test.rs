use async_trait::async_trait;
use bytes::BytesMut;
use sim_circuits::networking::packets::{
    ChatFromViewer, CompleteAgentMovement, GenericMessage, ImprovedInstantMessage, LogoutReply, LogoutRequest,
    MethodCall, ObjectPropertiesBlock, ObjectUpdate, ObjectUpdateBlock, PacketAck, RegionHandshake, StartPingCheck,
    TerseUpdateBlock, UseCircuitCode,
};
use sim_circuits::networking::scheduler::EmptyScene;
use sim_circuits::networking::serialization::DecodedPacket;
use sim_circuits::networking::{
    CircuitIdentity, CircuitKind, CircuitManager, CircuitState, MessageService, NetworkError, ObjectUpdateRecord,
    Packet, PacketCodec, SceneObjects,
};
use sim_circuits::TransportSettings;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use uuid::Uuid;

const AGENT: Uuid = Uuid::from_u128(0xA);
const SESSION: Uuid = Uuid::from_u128(0x5);

struct RecordingService {
    events: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl MessageService for RecordingService {
    async fn chat(&self, _agent_id: Uuid, chat: ChatFromViewer) {
        let _ = self.events.send(format!("chat:{}", chat.message));
    }

    async fn instant_message(&self, _agent_id: Uuid, message: ImprovedInstantMessage) {
        let _ = self.events.send(format!("im:{}", message.message));
    }

    async fn method(&self, _agent_id: Uuid, _godlike: bool, call: MethodCall) {
        let _ = self.events.send(format!("method:{}", call.method));
    }
}

struct OneObjectScene;

impl SceneObjects for OneObjectScene {
    fn region_handle(&self) -> u64 {
        1
    }

    fn full_update(&self, local_id: u32) -> Option<ObjectUpdateBlock> {
        Some(ObjectUpdateBlock {
            local_id,
            full_id: Uuid::from_u128(local_id as u128),
            ..Default::default()
        })
    }

    fn terse_update(&self, _local_id: u32) -> Option<TerseUpdateBlock> {
        None
    }

    fn properties(&self, _local_id: u32) -> Option<ObjectPropertiesBlock> {
        None
    }

    fn visible_objects(&self, _agent_id: Uuid) -> Vec<ObjectUpdateRecord> {
        vec![ObjectUpdateRecord::changed(77, 1)]
    }
}

/// A fake viewer on a loopback socket
struct Viewer {
    socket: UdpSocket,
    server: SocketAddr,
    sequence: u32,
    acked: Vec<u32>,
}

impl Viewer {
    async fn connect(server: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server,
            sequence: 0,
            acked: Vec::new(),
        }
    }

    async fn send<P: Packet>(&mut self, packet: &P) -> u32 {
        self.sequence += 1;
        let mut body = BytesMut::new();
        packet.encode_body(&mut body).unwrap();
        let data = PacketCodec::encode(P::message_id(), &body, self.sequence, P::RELIABLE, P::ZEROCODED).unwrap();
        self.socket.send_to(&data, self.server).await.unwrap();
        self.sequence
    }

    async fn recv(&mut self) -> DecodedPacket {
        let mut buf = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), self.socket.recv_from(&mut buf))
            .await
            .expect("no datagram from the server")
            .unwrap();
        let packet = PacketCodec::decode(&buf[..len]).unwrap();
        self.acked.extend(&packet.acks);
        if packet.is(PacketAck::message_id()) {
            self.acked.extend(packet.decode::<PacketAck>().unwrap().packets);
        }
        packet
    }

    /// Skip everything until a `P` arrives
    async fn expect<P: Packet>(&mut self) -> (u32, P) {
        loop {
            let packet = self.recv().await;
            if packet.is(P::message_id()) {
                return (packet.header.sequence, packet.decode().unwrap());
            }
        }
    }

    async fn handshake(&mut self, code: u32) -> RegionHandshake {
        let sequence = self
            .send(&UseCircuitCode {
                code,
                session_id: SESSION,
                agent_id: AGENT,
            })
            .await;
        let (_, handshake) = self.expect::<RegionHandshake>().await;
        assert!(self.acked.contains(&sequence));
        handshake
    }
}

fn settings() -> TransportSettings {
    let mut settings = TransportSettings::default();
    settings.network.bind_address = "127.0.0.1:0".parse().unwrap();
    settings.region.name = "Loopback".to_string();
    settings
}

fn identity(expected_address: Option<IpAddr>) -> CircuitIdentity {
    CircuitIdentity {
        agent_id: AGENT,
        session_id: SESSION,
        expected_address,
    }
}

async fn manager_with(
    scene: Arc<dyn SceneObjects>,
) -> (Arc<CircuitManager>, mpsc::UnboundedReceiver<String>) {
    let (events, rx) = mpsc::unbounded_channel();
    let manager = CircuitManager::bind(settings(), scene, Arc::new(RecordingService { events }))
        .await
        .unwrap();
    manager.start();
    (manager, rx)
}

async fn manager() -> (Arc<CircuitManager>, mpsc::UnboundedReceiver<String>) {
    manager_with(Arc::new(EmptyScene::default())).await
}

fn use_circuit_code(code: u32, session_id: Uuid) -> BytesMut {
    let mut body = BytesMut::new();
    UseCircuitCode {
        code,
        session_id,
        agent_id: AGENT,
    }
    .encode_body(&mut body)
    .unwrap();
    PacketCodec::encode(UseCircuitCode::message_id(), &body, 1, true, false).unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_handshake_binds_circuit() {
    let (manager, _events) = manager().await;
    let circuit = manager
        .add_circuit(100, identity(Some("127.0.0.1".parse().unwrap())), CircuitKind::Agent)
        .unwrap();
    assert_eq!(circuit.state(), CircuitState::Created);

    let mut viewer = Viewer::connect(manager.local_addr()).await;
    let handshake = viewer.handshake(100).await;
    assert_eq!(handshake.sim_name, "Loopback");

    let endpoint = viewer.socket.local_addr().unwrap();
    assert_eq!(circuit.endpoint(), Some(endpoint));
    assert_eq!(circuit.state(), CircuitState::Running);
    assert_eq!(manager.registry().by_endpoint(endpoint).unwrap().code(), 100);

    manager.shutdown().await;
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_handshake_from_other_address_family_is_rejected() {
    let (events, _rx) = mpsc::unbounded_channel();
    let manager = CircuitManager::bind(
        settings(),
        Arc::new(EmptyScene::default()),
        Arc::new(RecordingService { events }),
    )
    .await
    .unwrap();
    let circuit = manager
        .add_circuit(200, identity(Some("::1".parse().unwrap())), CircuitKind::Agent)
        .unwrap();

    let source: SocketAddr = "127.0.0.1:47000".parse().unwrap();
    let result = manager.handle_datagram(&use_circuit_code(200, SESSION), source);
    assert!(matches!(result, Err(NetworkError::HandshakeMismatch { code: 200, .. })));
    assert_eq!(circuit.endpoint(), None);
    assert_eq!(circuit.state(), CircuitState::Created);
    assert!(manager.registry().by_endpoint(source).is_none());
}

#[tokio::test]
async fn test_handshake_with_wrong_session_is_rejected() {
    let (events, _rx) = mpsc::unbounded_channel();
    let manager = CircuitManager::bind(
        settings(),
        Arc::new(EmptyScene::default()),
        Arc::new(RecordingService { events }),
    )
    .await
    .unwrap();
    manager.add_circuit(300, identity(None), CircuitKind::Agent).unwrap();

    let source: SocketAddr = "127.0.0.1:47001".parse().unwrap();
    let result = manager.handle_datagram(&use_circuit_code(300, Uuid::from_u128(99)), source);
    assert!(matches!(result, Err(NetworkError::HandshakeMismatch { code: 300, .. })));

    let result = manager.handle_datagram(&use_circuit_code(301, SESSION), source);
    assert!(matches!(result, Err(NetworkError::UnknownCircuit { .. })));
}

#[tokio::test]
async fn test_unbound_traffic_is_dropped() {
    let (events, _rx) = mpsc::unbounded_channel();
    let manager = CircuitManager::bind(
        settings(),
        Arc::new(EmptyScene::default()),
        Arc::new(RecordingService { events }),
    )
    .await
    .unwrap();

    let mut body = BytesMut::new();
    StartPingCheck { ping_id: 1, oldest_unacked: 0 }.encode_body(&mut body).unwrap();
    let data = PacketCodec::encode(StartPingCheck::message_id(), &body, 1, false, false).unwrap();
    let source: SocketAddr = "127.0.0.1:47002".parse().unwrap();
    assert!(matches!(
        manager.handle_datagram(&data, source),
        Err(NetworkError::UnknownCircuit { .. })
    ));
    assert!(matches!(
        manager.handle_datagram(&[0x40, 0, 0], source),
        Err(NetworkError::MalformedPacket { .. })
    ));
}

#[tokio::test]
async fn test_chat_reaches_message_service() {
    let (manager, mut events) = manager().await;
    manager.add_circuit(400, identity(None), CircuitKind::Agent).unwrap();
    let mut viewer = Viewer::connect(manager.local_addr()).await;
    viewer.handshake(400).await;

    viewer
        .send(&ChatFromViewer {
            agent_id: AGENT,
            session_id: SESSION,
            message: "hello region".to_string(),
            chat_type: 1,
            channel: 0,
        })
        .await;
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, "chat:hello region");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_logout_ack_removes_circuit() {
    let (manager, _events) = manager().await;
    let circuit = manager.add_circuit(500, identity(None), CircuitKind::Agent).unwrap();
    let mut viewer = Viewer::connect(manager.local_addr()).await;
    viewer.handshake(500).await;

    let request = viewer
        .send(&LogoutRequest {
            agent_id: AGENT,
            session_id: SESSION,
        })
        .await;
    let (reply_sequence, reply) = viewer.expect::<LogoutReply>().await;
    assert_eq!(reply.agent_id, AGENT);
    assert!(viewer.acked.contains(&request));

    viewer.send(&PacketAck { packets: vec![reply_sequence] }).await;
    assert!(wait_for(|| manager.registry().by_code(500).is_none()).await);
    assert!(circuit.is_closing());
    assert!(manager.scheduler(AGENT).is_none());
}

#[tokio::test]
async fn test_arrival_sends_visible_objects() {
    let (manager, _events) = manager_with(Arc::new(OneObjectScene)).await;
    manager.add_circuit(600, identity(None), CircuitKind::Agent).unwrap();
    let mut viewer = Viewer::connect(manager.local_addr()).await;
    viewer.handshake(600).await;

    viewer
        .send(&CompleteAgentMovement {
            agent_id: AGENT,
            session_id: SESSION,
            circuit_code: 600,
        })
        .await;
    let (_, update) = viewer.expect::<ObjectUpdate>().await;
    assert_eq!(update.objects.len(), 1);
    assert_eq!(update.objects[0].local_id, 77);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_send_to_unknown_agent_fails() {
    let (manager, _events) = manager().await;
    let result = manager.send_to_agent(
        Uuid::from_u128(404),
        sim_circuits::networking::OutgoingMessage::new(StartPingCheck::default()),
    );
    assert!(matches!(result, Err(NetworkError::UnknownCircuit { .. })));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_replaced_circuit_leaves_scheduler_of_newer_circuit() {
    let (events, _rx) = mpsc::unbounded_channel();
    let manager = CircuitManager::bind(
        settings(),
        Arc::new(EmptyScene::default()),
        Arc::new(RecordingService { events }),
    )
    .await
    .unwrap();
    manager.add_circuit(700, identity(None), CircuitKind::Agent).unwrap();
    let newer = manager.add_circuit(701, identity(None), CircuitKind::Agent).unwrap();

    assert!(manager.remove_circuit(700).is_some());
    assert!(!newer.is_closing());
    assert_eq!(manager.registry().by_agent(AGENT).unwrap().code(), 701);
    assert!(manager.scheduler(AGENT).is_some());

    manager.remove_circuit(701);
    assert!(manager.scheduler(AGENT).is_none());
}

#[tokio::test]
async fn test_generic_message_from_foreign_session_is_dropped() {
    let (manager, mut events) = manager().await;
    manager.add_circuit(800, identity(None), CircuitKind::Agent).unwrap();
    let mut viewer = Viewer::connect(manager.local_addr()).await;
    viewer.handshake(800).await;

    let call = |session_id| {
        GenericMessage(MethodCall {
            agent_id: AGENT,
            session_id,
            method: "autopilot".to_string(),
            ..Default::default()
        })
    };
    viewer.send(&call(Uuid::from_u128(99))).await;
    viewer.send(&call(SESSION)).await;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, "method:autopilot");
    assert!(tokio::time::timeout(Duration::from_millis(200), events.recv()).await.is_err());

    manager.shutdown().await;
}
