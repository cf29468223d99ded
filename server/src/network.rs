//! Server network layer: TCP accept loop and periodic maintenance

use crate::ai::FirstLegalMove;
use crate::config::ServerConfig;
use crate::connection::serve_connection;
use crate::dispatcher::Dispatcher;
use crate::registry::RoomRegistry;
use crate::services::{CredentialService, PersistenceService};
use crate::session::SessionManager;
use log::{debug, error, info};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Main server owning the listener and the shared dispatcher
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    /// Binds the listener and wires the registry, session table and
    /// collaborators together.
    pub async fn bind(
        config: ServerConfig,
        credentials: Arc<dyn CredentialService>,
        persistence: Arc<dyn PersistenceService>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr()).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let registry = Arc::new(RoomRegistry::new(
            config.max_rooms,
            config.chat_history,
            Arc::new(FirstLegalMove),
        ));
        let sessions = Arc::new(RwLock::new(
            SessionManager::new(config.max_sessions).with_queue_limit(config.max_queued_frames),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            sessions,
            credentials,
            persistence,
            config.max_violations,
        ));

        Ok(Server {
            listener,
            config,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Spawns task that drops idle sessions and stale rooms
    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let every = self.config.sweep_interval;
        let idle_timeout = self.config.idle_timeout;
        let room_idle_timeout = self.config.room_idle_timeout;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;

            loop {
                interval.tick().await;
                let dropped = dispatcher.sweep(idle_timeout, room_idle_timeout).await;
                if dropped > 0 {
                    info!("Sweep dropped {} sessions", dropped);
                }
            }
        })
    }

    /// Runs until the process is killed.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.run_until(std::future::pending()).await
    }

    /// Main accept loop; returns after `shutdown` resolves and every session
    /// has been closed.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let sweeper = self.spawn_sweeper();
        tokio::pin!(shutdown);

        info!("Server started successfully");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                            }
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let max_frame_bytes = self.config.max_frame_bytes;
                            tokio::spawn(async move {
                                serve_connection(stream, peer, dispatcher, max_frame_bytes).await;
                            });
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                },

                _ = &mut shutdown => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        sweeper.abort();
        self.dispatcher.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{InMemoryCredentials, InMemoryPersistence};
    use shared::protocol::{encode_frame, FrameDecoder};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    async fn bind(config: ServerConfig) -> Server {
        Server::bind(
            config,
            Arc::new(InMemoryCredentials::new()),
            Arc::new(InMemoryPersistence::new()),
        )
        .await
        .unwrap()
    }

    async fn read_frame(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Option<String> {
        loop {
            if let Some(frame) = decoder.next_frame().unwrap() {
                return Some(frame);
            }
            if stream.read_buf(decoder.buffer_mut()).await.unwrap() == 0 {
                return None;
            }
        }
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = ServerConfig {
            max_rooms: 0,
            ..test_config()
        };
        let result = Server::bind(
            config,
            Arc::new(InMemoryCredentials::new()),
            Arc::new(InMemoryPersistence::new()),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ping_over_tcp() {
        let server = bind(test_config()).await;
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&encode_frame("ping")).await.unwrap();
        let mut decoder = FrameDecoder::new(1024);
        assert_eq!(
            read_frame(&mut stream, &mut decoder).await.as_deref(),
            Some("pong")
        );
    }

    #[tokio::test]
    async fn test_capacity_rejects_extra_connection() {
        let config = ServerConfig {
            max_sessions: 1,
            ..test_config()
        };
        let server = bind(config).await;
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(&encode_frame("ping")).await.unwrap();
        let mut decoder = FrameDecoder::new(1024);
        assert_eq!(
            read_frame(&mut first, &mut decoder).await.as_deref(),
            Some("pong")
        );

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut decoder = FrameDecoder::new(1024);
        assert_eq!(
            read_frame(&mut second, &mut decoder).await.as_deref(),
            Some(crate::connection::SERVER_FULL_REPLY)
        );
        assert_eq!(read_frame(&mut second, &mut decoder).await, None);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let server = bind(test_config()).await;
        let addr = server.local_addr().unwrap();
        let dispatcher = server.dispatcher();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = server
                .run_until(async {
                    let _ = rx.await;
                })
                .await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&encode_frame("ping")).await.unwrap();
        let mut decoder = FrameDecoder::new(1024);
        assert_eq!(
            read_frame(&mut stream, &mut decoder).await.as_deref(),
            Some("pong")
        );

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(read_frame(&mut stream, &mut decoder).await, None);
        assert!(dispatcher.sessions().read().await.is_empty());
    }
}
