// End-to-end tests over real loopback sockets: a pair of engines
// negotiating into an established connection, and a scripted peer
// driving the mirrored-write / barrier path of a single engine.

use replica_daemon::config::{DeviceConfig, NetConfig, ResourceConfig};
use replica_daemon::p2p::packet::{
    decode_header, encode_header, Command, PBarrier, PBarrierAck, PBlockAck, PConnectionFeatures,
    PData, PState, PTwopcRequest, PUuids110, PacketInfo, DP_SEND_WRITE_ACK,
};
use replica_daemon::p2p::state::{ConnState, ReplState};
use replica_daemon::p2p::twopc::StateChange;
use replica_daemon::p2p::ReplicationServer;
use replica_common::serializer::Serializer;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn net_config(node: u32, peer: u32, bind_port: u16, peer_port: u16) -> NetConfig {
    let _ = node;
    let mut config: NetConfig = serde_json::from_str(&format!(
        r#"{{
            "peer_node_id": {},
            "peer_address": "127.0.0.1:{}",
            "bind_address": "127.0.0.1:{}",
            "connect_int": 1,
            "ping_int": 3600,
            "ping_timeo": 20
        }}"#,
        peer, peer_port, bind_port
    ))
    .unwrap();
    config.timeout = 100;
    config
}

fn resource_config(name: &str, node: u32, peer: u32, bind_port: u16, peer_port: u16) -> ResourceConfig {
    ResourceConfig {
        name: name.to_owned(),
        node_id: node,
        devices: vec![DeviceConfig {
            volume: 0,
            path: String::new(),
            capacity_sectors: 2048,
            supports_discard: true,
            skip_initial_sync: false,
        }],
        connections: vec![net_config(node, peer, bind_port, peer_port)],
    }
}

// E1: two empty volumes, first connect. The pair must negotiate both
// sockets, agree on the protocol, run the connect transaction, find
// both UUIDs just-created and settle in established with no resync.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_connect_becomes_established() {
    let port_a = free_port().await;
    let port_b = free_port().await;

    let server_a = ReplicationServer::new(resource_config("r0", 0, 1, port_a, port_b))
        .await
        .unwrap();
    let server_b = ReplicationServer::new(resource_config("r0", 1, 0, port_b, port_a))
        .await
        .unwrap();

    server_a.start().await;
    server_b.start().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let mut established = false;
    while tokio::time::Instant::now() < deadline {
        let conn_a = server_a.resource().connection(1).await.unwrap();
        let conn_b = server_b.resource().connection(0).await.unwrap();
        if conn_a.cstate_now() == ConnState::Connected
            && conn_b.cstate_now() == ConnState::Connected
        {
            let pd_a = conn_a.peer_device(0).await.unwrap();
            let pd_b = conn_b.peer_device(0).await.unwrap();
            if pd_a.repl_state_now() == ReplState::Established
                && pd_b.repl_state_now() == ReplState::Established
            {
                established = true;
                break;
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(established, "pair never reached connected/established");

    server_a.stop().await;
    server_b.stop().await;
    sleep(Duration::from_millis(200)).await;
}

// A scripted peer speaking the wire protocol against one engine.
struct ScriptedPeer {
    data: TcpStream,
    meta: TcpStream,
    version: u32,
}

impl ScriptedPeer {
    async fn send<T: Serializer>(
        stream: &mut TcpStream,
        version: u32,
        vnr: i16,
        cmd: Command,
        body: &T,
        payload: &[u8],
    ) {
        let body_bytes = body.to_bytes();
        let mut frame = encode_header(
            version,
            vnr,
            cmd as u16,
            (body_bytes.len() + payload.len()) as u32,
        );
        frame.extend_from_slice(&body_bytes);
        frame.extend_from_slice(payload);
        stream.write_all(&frame).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream, version: u32) -> (PacketInfo, Vec<u8>) {
        let header_len = if version >= 100 { 16 } else { 8 };
        let mut header = vec![0u8; header_len];
        stream.read_exact(&mut header).await.unwrap();
        let pi = decode_header(version, &header).unwrap();
        let mut body = vec![0u8; pi.size as usize];
        stream.read_exact(&mut body).await.unwrap();
        (pi, body)
    }

    async fn send_data(&mut self, cmd: Command, body: &impl Serializer, payload: &[u8]) {
        Self::send(&mut self.data, self.version, 0, cmd, body, payload).await;
    }

    async fn recv_data(&mut self) -> (PacketInfo, Vec<u8>) {
        Self::recv(&mut self.data, self.version).await
    }

    async fn recv_meta(&mut self) -> (PacketInfo, Vec<u8>) {
        Self::recv(&mut self.meta, self.version).await
    }

    // Wait for a specific command on the meta socket, skipping others
    async fn expect_meta(&mut self, cmd: Command) -> Vec<u8> {
        loop {
            let (pi, body) = self.recv_meta().await;
            if pi.cmd == cmd as u16 {
                return body;
            }
            if pi.cmd == Command::Ping as u16 {
                Self::send(&mut self.meta, self.version, 0, Command::PingAck, &Empty, &[]).await;
            }
        }
    }
}

struct Empty;

impl Serializer for Empty {
    fn write(&self, _writer: &mut replica_common::serializer::Writer) {}
    fn read(
        _reader: &mut replica_common::serializer::Reader,
    ) -> Result<Self, replica_common::serializer::ReaderError> {
        Ok(Empty)
    }
    fn size(&self) -> usize {
        0
    }
}

// Bring one engine (node 1) to connected using a scripted peer (node 0)
async fn connect_scripted_peer(engine_port: u16) -> ScriptedPeer {
    let engine_addr: SocketAddr = format!("127.0.0.1:{}", engine_port).parse().unwrap();

    // the engine classifies sockets by their first packet; versions
    // below 95 use the short header until features are agreed
    let mut data = loop {
        match TcpStream::connect(engine_addr).await {
            Ok(stream) => break stream,
            Err(_) => sleep(Duration::from_millis(50)).await,
        }
    };
    data.write_all(&encode_header(86, 0, Command::InitialData as u16, 0))
        .await
        .unwrap();
    let mut meta = TcpStream::connect(engine_addr).await.unwrap();
    meta.write_all(&encode_header(86, 0, Command::InitialMeta as u16, 0))
        .await
        .unwrap();

    // feature exchange on the data socket
    ScriptedPeer::send(
        &mut data,
        86,
        0,
        Command::ConnectionFeatures,
        &PConnectionFeatures {
            protocol_min: 86,
            protocol_max: 110,
            sender_node_id: 0,
            receiver_node_id: 1,
            feature_flags: 1,
        },
        &[],
    )
    .await;
    let (pi, body) = ScriptedPeer::recv(&mut data, 86).await;
    assert_eq!(pi.cmd, Command::ConnectionFeatures as u16);
    let features = PConnectionFeatures::from_bytes(&body).unwrap();
    assert_eq!(features.sender_node_id, 1);

    let mut peer = ScriptedPeer {
        data,
        meta,
        version: 110,
    };

    // the engine sends its protocol options; skip them
    let (pi, _) = peer.recv_data().await;
    assert_eq!(pi.cmd, Command::Protocol as u16);

    // we are node 0 (the smaller id): initiate the connect transaction
    let connect_change = StateChange {
        cstate: Some(ConnState::Connected),
        ..Default::default()
    };
    let (mask, val) = connect_change.pack();
    let prepare = PTwopcRequest {
        tid: 7,
        initiator_node_id: 0,
        target_node_id: 1,
        primary_nodes: 0,
        weak_nodes: 0,
        mask,
        val,
    };
    peer.send_data(Command::TwopcPrepare, &prepare, &[]).await;
    let _ = peer.expect_meta(Command::TwopcYes).await;
    peer.send_data(Command::TwopcCommit, &prepare, &[]).await;

    // engine now sends its initial per-volume packets
    loop {
        let (pi, _) = peer.recv_data().await;
        if pi.cmd == Command::State as u16 {
            break;
        }
    }

    // answer with our own uuids and state: both just created
    peer.send_data(
        Command::Uuids110,
        &PUuids110 {
            current: 0x4,
            dirty_bits: 0,
            flags: 0,
            bitmap_uuids: vec![(1, 0)],
            history: vec![],
        },
        &[],
    )
    .await;
    peer.send_data(
        Command::State,
        &PState {
            role: 2,
            disk: 8,
            repl: 1,
        },
        &[],
    )
    .await;

    peer
}

// E5 over the wire: two mirrored writes, a barrier, one more write.
// The engine must apply both writes, emit exactly one barrier-ack for
// barrier 7 covering two writes, and admit the third write into a
// fresh epoch.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_barrier_flow_with_scripted_peer() {
    let engine_port = free_port().await;
    let unused_port = free_port().await;

    let server = ReplicationServer::new(resource_config("r0", 1, 0, engine_port, unused_port))
        .await
        .unwrap();
    server.start().await;

    let run = async {
        let mut peer = connect_scripted_peer(engine_port).await;

        // wait until the engine's view is established
        let connection = server.resource().connection(0).await.unwrap();
        let peer_device = connection.peer_device(0).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while peer_device.repl_state_now() != ReplState::Established {
            assert!(
                tokio::time::Instant::now() < deadline,
                "engine never reached established"
            );
            sleep(Duration::from_millis(50)).await;
        }

        // two writes into epoch 0
        let block0 = vec![0x11u8; 4096];
        let block1 = vec![0x22u8; 4096];
        peer.send_data(
            Command::Data,
            &PData {
                sector: 0,
                block_id: 100,
                seq_num: 1,
                dp_flags: DP_SEND_WRITE_ACK,
            },
            &block0,
        )
        .await;
        peer.send_data(
            Command::Data,
            &PData {
                sector: 8,
                block_id: 101,
                seq_num: 2,
                dp_flags: DP_SEND_WRITE_ACK,
            },
            &block1,
        )
        .await;

        // both writes are acked on the meta socket
        let ack = PBlockAck::from_bytes(&peer.expect_meta(Command::WriteAck).await).unwrap();
        assert_eq!(ack.block_id, 100);
        let ack = PBlockAck::from_bytes(&peer.expect_meta(Command::WriteAck).await).unwrap();
        assert_eq!(ack.block_id, 101);

        // barrier closes the epoch
        peer.send_data(
            Command::Barrier,
            &PBarrier {
                barrier: 7,
                pad: 0,
            },
            &[],
        )
        .await;
        let back = PBarrierAck::from_bytes(&peer.expect_meta(Command::BarrierAck).await).unwrap();
        assert_eq!(back.barrier, 7);
        assert_eq!(back.set_size, 2);

        // a third write lands in the fresh epoch and still acks
        peer.send_data(
            Command::Data,
            &PData {
                sector: 16,
                block_id: 102,
                seq_num: 3,
                dp_flags: DP_SEND_WRITE_ACK,
            },
            &vec![0x33u8; 4096],
        )
        .await;
        let ack = PBlockAck::from_bytes(&peer.expect_meta(Command::WriteAck).await).unwrap();
        assert_eq!(ack.block_id, 102);
    };

    timeout(Duration::from_secs(60), run)
        .await
        .expect("barrier flow test timed out");

    server.stop().await;
    sleep(Duration::from_millis(200)).await;
}
