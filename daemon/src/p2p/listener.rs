use log::{debug, info, warn};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
};

// Listeners are keyed by local bind address and shared by every
// connection of the resource; incoming sockets are routed to the waiter
// whose configured peer address matches the remote end.
pub struct SharedListeners {
    listeners: Mutex<HashMap<SocketAddr, Arc<Listener>>>,
}

pub struct Listener {
    bind: SocketAddr,
    waiters: Mutex<HashMap<IpAddr, mpsc::Sender<TcpStream>>>,
}

impl SharedListeners {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    // Find or create the listener for a bind address and register a
    // waiter for the given peer. Returns the stream receiver.
    pub async fn register(
        &self,
        bind: SocketAddr,
        peer_ip: IpAddr,
    ) -> std::io::Result<(Arc<Listener>, mpsc::Receiver<TcpStream>)> {
        let mut listeners = self.listeners.lock().await;
        let listener = match listeners.get(&bind) {
            Some(listener) => listener.clone(),
            None => {
                let socket = TcpListener::bind(bind).await?;
                let local = socket.local_addr()?;
                info!("listening on {}", local);
                let listener = Arc::new(Listener {
                    bind: local,
                    waiters: Mutex::new(HashMap::new()),
                });
                tokio::spawn(accept_loop(socket, listener.clone()));
                listeners.insert(bind, listener.clone());
                if local != bind {
                    // ephemeral binds are also reachable under their
                    // resolved address
                    listeners.insert(local, listener.clone());
                }
                listener
            }
        };
        drop(listeners);

        let (tx, rx) = mpsc::channel(4);
        listener.waiters.lock().await.insert(peer_ip, tx);
        Ok((listener, rx))
    }

    pub async fn unregister(&self, listener: &Arc<Listener>, peer_ip: IpAddr) {
        listener.waiters.lock().await.remove(&peer_ip);
    }

    // Actual bound address (after ephemeral port resolution); used by
    // tests binding to port 0
    pub async fn bound_addr(&self, bind: SocketAddr) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .await
            .get(&bind)
            .map(|listener| listener.bind)
    }
}

impl Default for SharedListeners {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(socket: TcpListener, listener: Arc<Listener>) {
    loop {
        let (stream, remote) = match socket.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept on {} failed: {}", listener.bind, e);
                continue;
            }
        };
        debug!("incoming connection from {}", remote);

        let waiters = listener.waiters.lock().await;
        match waiters.get(&remote.ip()) {
            Some(tx) => {
                if tx.try_send(stream).is_err() {
                    debug!("waiter for {} is saturated, dropping socket", remote.ip());
                }
            }
            None => {
                debug!("no connection configured for peer {}, rejecting", remote);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_route() {
        let shared = SharedListeners::new();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (listener, mut rx) = shared
            .register(bind, "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.bind;

        // a connection from the registered peer ip is routed to us
        let client = TcpStream::connect(addr).await.unwrap();
        let accepted = rx.recv().await.unwrap();
        assert_eq!(accepted.peer_addr().unwrap().ip(), client.local_addr().unwrap().ip());

        shared.unregister(&listener, "127.0.0.1".parse().unwrap()).await;
    }

    #[tokio::test]
    async fn test_listener_shared_per_bind_addr() {
        let shared = SharedListeners::new();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (first, _rx1) = shared
            .register(bind, "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        // registering the resolved address again reuses the listener
        let (second, _rx2) = shared
            .register(first.bind, "10.0.0.1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(first.bind, second.bind);
    }
}
