//! TCP listener for accepting client connections.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::context::ServerContext;
use super::session::ClientSession;
use super::writer::SharedWriter;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

/// Accepts connections and runs one [`ClientSession`] per client.
pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    slots: Arc<Semaphore>,
}

impl Server {
    pub async fn bind(config: ServerConfig, ctx: Arc<ServerContext>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        info!(
            "Server listening on {} (max {} connections)",
            listener.local_addr()?,
            config.max_connections
        );
        Ok(Self {
            listener,
            ctx,
            slots: Arc::new(Semaphore::new(config.max_connections.max(1))),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then wait for every session to end.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut sessions = JoinSet::new();
        let mut connection_count = 0u64;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, addr)) => {
                    let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                        warn!("Connection limit reached, refusing {}", addr);
                        continue;
                    };
                    connection_count += 1;
                    let client_id = connection_count;
                    info!("[Client {}] New connection from {}", client_id, addr);

                    let ctx = Arc::clone(&self.ctx);
                    let token = shutdown.child_token();
                    sessions.spawn(async move {
                        if let Err(e) = handle_connection(socket, client_id, ctx, token).await {
                            error!("[Client {}] Connection error: {}", client_id, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
            // reap finished sessions
            while sessions.try_join_next().is_some() {}
        }

        info!("Waiting for {} sessions to close", sessions.len());
        while sessions.join_next().await.is_some() {}
        info!("Server stopped");
    }
}

/// Handle a single client connection.
async fn handle_connection(
    socket: TcpStream,
    client_id: u64,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    socket.set_nodelay(true)?;
    let (read, write) = socket.into_split();
    let mut session = ClientSession::new(client_id, ctx, SharedWriter::new(write), shutdown);
    session.run(read).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::context::test_util::test_context;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use vnsi_protocol::{encode_request, Opcode, PROTOCOL_VERSION};

    async fn start(max_connections: usize) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
        let (ctx, _store) = test_context();
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections,
        };
        let server = Server::bind(config, ctx).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { server.run(token).await });
        (addr, shutdown, task)
    }

    async fn login(stream: &mut TcpStream) -> Vec<u8> {
        let mut payload = PROTOCOL_VERSION.to_be_bytes().to_vec();
        payload.extend_from_slice(b"\0tcp\0");
        stream
            .write_all(&encode_request(1, Opcode::Login as u32, &payload))
            .await
            .unwrap();
        let mut head = [0u8; 12];
        stream.read_exact(&mut head).await.unwrap();
        let len = u32::from_be_bytes([head[8], head[9], head[10], head[11]]) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn test_login_over_tcp_and_shutdown() {
        let (addr, shutdown, task) = start(4).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = login(&mut stream).await;
        assert_eq!(&reply[..4], &PROTOCOL_VERSION.to_be_bytes());

        shutdown.cancel();
        task.await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (addr, shutdown, task) = start(1).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        login(&mut first).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut rest = Vec::new();
        second.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        drop(first);
        shutdown.cancel();
        task.await.unwrap();
    }
}
