use super::{
    connection::{Connection, CF_DISCONNECT_EXPECTED, CF_RESOLVE_CONFLICTS},
    error::P2pError,
    listener::SharedListeners,
    packet::{decode_header, encode_header, header_size, Command, PConnectionFeatures, PacketInfo},
    resource::Resource,
    state::ConnState,
};
use crate::config::{
    CHALLENGE_LEN, MAX_SUBHEADER_SIZE, PRO_FEATURES, PRO_VERSION_MAX, PRO_VERSION_MIN,
    SOCKET_PROBE_DELAY_MS,
};
use log::{debug, info, warn};
use rand::{Rng, RngCore};
use replica_common::{crypto, serializer::Serializer};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};

// Identify a fresh socket as the data or meta channel
async fn send_first_packet(
    connection: &Connection,
    stream: &mut TcpStream,
    cmd: Command,
) -> Result<(), P2pError> {
    let header = encode_header(connection.agreed_pro_version(), 0, cmd as u16, 0);
    stream.write_all(&header).await?;
    Ok(())
}

async fn receive_first_packet(
    connection: &Connection,
    stream: &mut TcpStream,
) -> Result<Command, P2pError> {
    let size = header_size(connection.agreed_pro_version());
    let mut header = vec![0u8; size];
    timeout(connection.net.ping_timeout() * 4, stream.read_exact(&mut header)).await??;
    let pi = decode_header(connection.agreed_pro_version(), &header)?;
    Command::from_wire(pi.cmd)
}

// Liveness probe: a closed socket reports EOF immediately, a live one
// has nothing to read yet
async fn socket_okay(stream: &Option<TcpStream>) -> bool {
    let stream = match stream {
        Some(stream) => stream,
        None => return false,
    };
    let mut probe = [0u8; 1];
    match timeout(Duration::from_millis(1), stream.peek(&mut probe)).await {
        // nothing pending: alive
        Err(_) => true,
        // pending bytes: alive
        Ok(Ok(n)) if n > 0 => true,
        // EOF or error: dead
        _ => false,
    }
}

pub enum ConnectOutcome {
    // both sockets negotiated, features and auth done
    Connected,
    // transient failure, try again after connect_int
    Retry,
    // fatal (incompatible peer, auth failure): drop to standalone
    GiveUp,
}

// Establish the two-socket pair with the peer: alternate outgoing
// connects and accepted sockets, classify each by its first packet,
// resolve crossed pairs by coin flip, then run the feature exchange and
// optional challenge-response authentication.
pub async fn conn_connect(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    listeners: &SharedListeners,
) -> Result<ConnectOutcome, P2pError> {
    connection.clear_flag(CF_DISCONNECT_EXPECTED);
    if connection.cstate_now() != ConnState::Connecting
        && !connection.set_cstate(ConnState::Connecting, true, false)
    {
        return Ok(ConnectOutcome::GiveUp);
    }
    // assume the oldest protocol until the peer tells us better
    connection
        .agreed_pro_version
        .store(PRO_VERSION_MIN, std::sync::atomic::Ordering::SeqCst);

    let peer_ip = connection.net.peer_address.ip();
    let (listener, mut incoming) = listeners
        .register(connection.net.bind_address, peer_ip)
        .await?;

    let mut data_sock: Option<TcpStream> = None;
    let mut meta_sock: Option<TcpStream> = None;

    let result = negotiate_socket_pair(
        resource,
        connection,
        &mut incoming,
        &mut data_sock,
        &mut meta_sock,
    )
    .await;
    listeners.unregister(&listener, peer_ip).await;

    match result {
        Ok(()) => {}
        Err(e) => {
            debug!("socket pair negotiation failed: {}", e);
            return Ok(ConnectOutcome::Retry);
        }
    }

    let mut data_sock = data_sock.expect("negotiation left no data socket");
    let meta_sock = meta_sock.expect("negotiation left no meta socket");
    data_sock.set_nodelay(true)?;
    meta_sock.set_nodelay(true)?;

    match do_features(connection, &mut data_sock).await {
        Ok(true) => {}
        Ok(false) => return Ok(ConnectOutcome::Retry),
        Err(e) => {
            warn!("feature exchange with peer {} failed: {}", connection.peer_node_id, e);
            return Ok(ConnectOutcome::GiveUp);
        }
    }

    if connection.net.cram_hmac_alg.is_some() {
        match do_auth(resource, connection, &mut data_sock).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("authentication of peer failed, trying again");
                return Ok(ConnectOutcome::Retry);
            }
            Err(e) => {
                warn!("authentication of peer failed: {}", e);
                return Ok(ConnectOutcome::GiveUp);
            }
        }
    }

    // hand the sockets over to the writer tasks / reader slots
    let (dr, dw) = data_sock.into_split();
    let (mr, mw) = meta_sock.into_split();
    connection.attach_sockets(
        (Box::new(dr), Box::new(dw)),
        (Box::new(mr), Box::new(mw)),
    );

    Ok(ConnectOutcome::Connected)
}

async fn negotiate_socket_pair(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    incoming: &mut mpsc::Receiver<TcpStream>,
    data_sock: &mut Option<TcpStream>,
    meta_sock: &mut Option<TcpStream>,
) -> Result<(), P2pError> {
    loop {
        if resource.is_shutting_down() || connection.cstate_now() <= ConnState::Disconnecting {
            return Err(P2pError::ShuttingDown);
        }

        // outgoing attempt for whichever socket is still missing
        if data_sock.is_none() || meta_sock.is_none() {
            let attempt = timeout(
                connection.net.ping_timeout() * 4,
                TcpStream::connect(connection.net.peer_address),
            )
            .await;
            if let Ok(Ok(mut stream)) = attempt {
                if data_sock.is_none() {
                    send_first_packet(connection, &mut stream, Command::InitialData).await?;
                    *data_sock = Some(stream);
                } else if meta_sock.is_none() {
                    connection.clear_flag(CF_RESOLVE_CONFLICTS);
                    send_first_packet(connection, &mut stream, Command::InitialMeta).await?;
                    *meta_sock = Some(stream);
                }
            }
        }

        if data_sock.is_some() && meta_sock.is_some() {
            tokio::time::sleep(Duration::from_millis(SOCKET_PROBE_DELAY_MS)).await;
            let ok = socket_okay(data_sock).await && socket_okay(meta_sock).await;
            if ok {
                return Ok(());
            }
            if !socket_okay(data_sock).await {
                *data_sock = None;
            }
            if !socket_okay(meta_sock).await {
                *meta_sock = None;
            }
        }

        // wait for an incoming socket for a while
        let wait = timeout(connection.net.connect_interval(), incoming.recv()).await;
        if let Ok(Some(mut stream)) = wait {
            match receive_first_packet(connection, &mut stream).await {
                Ok(Command::InitialData) => {
                    if data_sock.is_some() {
                        warn!("initial data packet crossed");
                        *data_sock = Some(stream);
                        if coin_flip() {
                            continue;
                        }
                    } else {
                        *data_sock = Some(stream);
                    }
                }
                Ok(Command::InitialMeta) => {
                    connection.set_flag(CF_RESOLVE_CONFLICTS);
                    if meta_sock.is_some() {
                        warn!("initial meta packet crossed");
                        *meta_sock = Some(stream);
                        if coin_flip() {
                            continue;
                        }
                    } else {
                        *meta_sock = Some(stream);
                    }
                }
                Ok(other) => {
                    warn!("unexpected initial packet {}", other);
                    drop(stream);
                    if coin_flip() {
                        continue;
                    }
                }
                Err(e) => {
                    debug!("error receiving initial packet: {}", e);
                    drop(stream);
                }
            }
        }
    }
}

fn coin_flip() -> bool {
    rand::thread_rng().gen::<bool>()
}

// Read one packet header + body from a raw socket (pre-writer phase)
async fn recv_packet_raw(
    connection: &Connection,
    stream: &mut TcpStream,
) -> Result<(PacketInfo, Vec<u8>), P2pError> {
    let size = header_size(connection.agreed_pro_version());
    let mut header = vec![0u8; size];
    timeout(connection.net.ping_timeout() * 4, stream.read_exact(&mut header)).await??;
    let pi = decode_header(connection.agreed_pro_version(), &header)?;
    if pi.size > MAX_SUBHEADER_SIZE {
        return Err(P2pError::WrongPacketSize(pi.cmd, pi.size));
    }
    let mut body = vec![0u8; pi.size as usize];
    timeout(connection.net.ping_timeout() * 4, stream.read_exact(&mut body)).await??;
    connection.touch_last_received();
    Ok((pi, body))
}

async fn send_packet_raw<T: Serializer>(
    connection: &Connection,
    stream: &mut TcpStream,
    cmd: Command,
    body: &T,
    payload: &[u8],
) -> Result<(), P2pError> {
    let body_bytes = body.to_bytes();
    let mut frame = encode_header(
        connection.agreed_pro_version(),
        0,
        cmd as u16,
        (body_bytes.len() + payload.len()) as u32,
    );
    frame.extend_from_slice(&body_bytes);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

// Exchange protocol ranges, node ids and feature flags.
// Ok(true): agreed. Ok(false): transient, retry. Err: incompatible.
async fn do_features(
    connection: &Arc<Connection>,
    data_sock: &mut TcpStream,
) -> Result<bool, P2pError> {
    let resource = match connection.resource() {
        Some(resource) => resource,
        None => return Ok(false),
    };
    let features = PConnectionFeatures {
        protocol_min: PRO_VERSION_MIN,
        protocol_max: PRO_VERSION_MAX,
        sender_node_id: resource.node_id,
        receiver_node_id: connection.peer_node_id,
        feature_flags: PRO_FEATURES,
    };
    send_packet_raw(connection, data_sock, Command::ConnectionFeatures, &features, &[]).await?;

    let (pi, body) = match recv_packet_raw(connection, data_sock).await {
        Ok(result) => result,
        Err(e) if e.is_transient() => return Ok(false),
        Err(e) => return Err(e),
    };
    if pi.cmd != Command::ConnectionFeatures as u16 {
        return Err(P2pError::UnexpectedCommand {
            expected: "ConnectionFeatures",
            got: pi.cmd,
        });
    }
    let peer = PConnectionFeatures::from_bytes(&body)?;
    let peer_max = if peer.protocol_max == 0 {
        peer.protocol_min
    } else {
        peer.protocol_max
    };

    if PRO_VERSION_MAX < peer.protocol_min || PRO_VERSION_MIN > peer_max {
        return Err(P2pError::IncompatibleProtocol {
            min: PRO_VERSION_MIN,
            max: PRO_VERSION_MAX,
            peer_min: peer.protocol_min,
            peer_max,
        });
    }

    let agreed = PRO_VERSION_MAX.min(peer_max);
    connection
        .agreed_pro_version
        .store(agreed, std::sync::atomic::Ordering::SeqCst);
    connection.agreed_features.store(
        PRO_FEATURES & peer.feature_flags,
        std::sync::atomic::Ordering::SeqCst,
    );

    if agreed >= 110 {
        if peer.sender_node_id != connection.peer_node_id {
            warn!(
                "peer presented a node id of {} instead of {}",
                peer.sender_node_id, connection.peer_node_id
            );
            return Ok(false);
        }
        if peer.receiver_node_id != resource.node_id {
            warn!(
                "peer expects me to have a node id of {} instead of {}",
                peer.receiver_node_id, resource.node_id
            );
            return Ok(false);
        }
    }

    info!(
        "handshake successful: agreed network protocol version {}",
        agreed
    );
    Ok(true)
}

// CRAM-HMAC challenge-response over the shared secret. At protocol 110
// and newer the responder salts the challenge with the initiator's node
// id, so a response recorded between two other nodes never verifies.
// Ok(true): authenticated. Ok(false): transient error. Err: reject.
async fn do_auth(
    resource: &Arc<Resource>,
    connection: &Arc<Connection>,
    data_sock: &mut TcpStream,
) -> Result<bool, P2pError> {
    let secret = connection
        .net
        .shared_secret
        .as_deref()
        .ok_or(P2pError::AuthFailed("no shared secret configured"))?
        .as_bytes()
        .to_vec();
    let salted = connection.agreed_pro_version() >= 110;

    let mut my_challenge = vec![0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut my_challenge);

    send_packet_raw(
        connection,
        data_sock,
        Command::AuthChallenge,
        &super::connection::EmptyBody,
        &my_challenge,
    )
    .await?;

    let (pi, peer_challenge) = match recv_packet_raw(connection, data_sock).await {
        Ok(result) => result,
        Err(e) if e.is_transient() => return Ok(false),
        Err(e) => return Err(e),
    };
    if pi.cmd != Command::AuthChallenge as u16 {
        return Err(P2pError::UnexpectedCommand {
            expected: "AuthChallenge",
            got: pi.cmd,
        });
    }
    if (pi.size as usize) < CHALLENGE_LEN || (pi.size as usize) > CHALLENGE_LEN * 2 {
        return Err(P2pError::AuthFailed("challenge payload has unexpected size"));
    }
    if peer_challenge == my_challenge {
        return Err(P2pError::AuthFailed("peer presented the same challenge"));
    }

    // answer the peer's challenge, salted with our node id
    let response = if salted {
        crypto::hmac_sha256(
            &secret,
            &[&peer_challenge, &resource.node_id.to_be_bytes()],
        )?
    } else {
        crypto::hmac_sha256(&secret, &[&peer_challenge])?
    };
    send_packet_raw(
        connection,
        data_sock,
        Command::AuthResponse,
        &super::connection::EmptyBody,
        &response,
    )
    .await?;

    let (pi, peer_response) = match recv_packet_raw(connection, data_sock).await {
        Ok(result) => result,
        Err(e) if e.is_transient() => return Ok(false),
        Err(e) => return Err(e),
    };
    if pi.cmd != Command::AuthResponse as u16 {
        return Err(P2pError::UnexpectedCommand {
            expected: "AuthResponse",
            got: pi.cmd,
        });
    }

    let expected = if salted {
        crypto::hmac_sha256(
            &secret,
            &[&my_challenge[..], &connection.peer_node_id.to_be_bytes()],
        )?
    } else {
        crypto::hmac_sha256(&secret, &[&my_challenge[..]])?
    };
    if !crypto::digests_equal(&peer_response, &expected) {
        return Err(P2pError::AuthFailed("response digest mismatch"));
    }

    info!(
        "peer {} authenticated using {} bytes HMAC",
        connection.peer_node_id,
        expected.len()
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    // the auth logic is symmetric; verify both directions compute the
    // same digests over a loopback socket pair
    #[tokio::test]
    async fn test_auth_round_trip() {
        use crate::config::{NetConfig, ResourceConfig};
        use crate::p2p::pool::PagePool;
        use tokio::net::TcpListener;

        fn resource(node_id: u32) -> Arc<Resource> {
            Resource::new(
                ResourceConfig {
                    name: "r0".to_owned(),
                    node_id,
                    devices: vec![],
                    connections: vec![],
                },
                Arc::new(PagePool::new(4)),
            )
        }

        fn net(peer: u32, secret: Option<&str>) -> NetConfig {
            let mut config: NetConfig = serde_json::from_str(&format!(
                r#"{{
                    "peer_node_id": {},
                    "peer_address": "127.0.0.1:7800",
                    "bind_address": "127.0.0.1:7801"
                }}"#,
                peer
            ))
            .unwrap();
            config.cram_hmac_alg = Some("sha256".to_owned());
            config.shared_secret = secret.map(str::to_owned);
            config
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let resource_a = resource(0);
        let connection_a = Connection::new(&resource_a, net(1, Some("hunter2")));
        connection_a
            .agreed_pro_version
            .store(110, std::sync::atomic::Ordering::SeqCst);
        let resource_b = resource(1);
        let connection_b = Connection::new(&resource_b, net(0, Some("hunter2")));
        connection_b
            .agreed_pro_version
            .store(110, std::sync::atomic::Ordering::SeqCst);

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            do_auth(&resource_b, &connection_b, &mut stream).await
        });
        let mut client = TcpStream::connect(addr).await.unwrap();
        let client_result = do_auth(&resource_a, &connection_a, &mut client).await;
        let server_result = server.await.unwrap();

        assert!(matches!(client_result, Ok(true)));
        assert!(matches!(server_result, Ok(true)));
    }

    #[tokio::test]
    async fn test_auth_wrong_secret_rejected() {
        use crate::config::{NetConfig, ResourceConfig};
        use crate::p2p::pool::PagePool;
        use tokio::net::TcpListener;

        fn resource(node_id: u32) -> Arc<Resource> {
            Resource::new(
                ResourceConfig {
                    name: "r0".to_owned(),
                    node_id,
                    devices: vec![],
                    connections: vec![],
                },
                Arc::new(PagePool::new(4)),
            )
        }

        fn net(peer: u32, secret: &str) -> NetConfig {
            let mut config: NetConfig = serde_json::from_str(&format!(
                r#"{{
                    "peer_node_id": {},
                    "peer_address": "127.0.0.1:7800",
                    "bind_address": "127.0.0.1:7801"
                }}"#,
                peer
            ))
            .unwrap();
            config.cram_hmac_alg = Some("sha256".to_owned());
            config.shared_secret = Some(secret.to_owned());
            config
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let resource_a = resource(0);
        let connection_a = Connection::new(&resource_a, net(1, "hunter2"));
        let resource_b = resource(1);
        let connection_b = Connection::new(&resource_b, net(0, "wrong"));

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            do_auth(&resource_b, &connection_b, &mut stream).await
        });
        let mut client = TcpStream::connect(addr).await.unwrap();
        let client_result = do_auth(&resource_a, &connection_a, &mut client).await;
        let server_result = server.await.unwrap();

        // at least one side must reject; neither may authenticate
        assert!(!matches!(client_result, Ok(true)));
        assert!(!matches!(server_result, Ok(true)));
    }
}
