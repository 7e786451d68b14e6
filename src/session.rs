// Burrow - Reverse TCP tunnel relay exposing NAT-hidden services over a minimal framed protocol
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::BurrowResult;
use crate::mux::{self, Peer, PeerHandle};
use crate::pool::PortPool;
use crate::protocol::{Frame, FrameCodec};

/// How often the acceptor wakes to check whether the host tunnel died.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One public port worth of relay state.
///
/// The first connection accepted on the listener becomes the host tunnel;
/// every later one is a public peer whose bytes are framed onto it. The
/// session owns its listener, tunnel and peer registry exclusively, and
/// returns its port to the pool on every exit path.
pub struct PeerSession {
    port: u16,

    listener: TcpListener,

    pool: Arc<PortPool>,

    host_attach_timeout: Duration,
}

impl PeerSession {
    /// Bind the public listener for an allocated port.
    ///
    /// The caller still owns the port on failure and must release it.
    pub async fn bind(
        bind_address: &str,
        port: u16,
        pool: Arc<PortPool>,
        host_attach_timeout: Duration,
    ) -> BurrowResult<Self> {
        let listener = TcpListener::bind((bind_address, port)).await?;

        Ok(Self {
            port,
            listener,
            pool,
            host_attach_timeout,
        })
    }

    /// Drive the session to completion.
    ///
    /// Terminal events: no host within the attach window, tunnel EOF or
    /// decode failure, or a fatal accept error on the listener.
    pub async fn run(self) {
        let port = self.port;

        debug!("Session listening, awaiting host tunnel (port = {})", port);

        // Host-attachment phase. No authentication; the first dialer wins.
        let tunnel = match timeout(self.host_attach_timeout, self.listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                info!("Host tunnel attached (port = {}) (addr = {})", port, addr);

                stream
            }
            Ok(Err(e)) => {
                error!("Accept failed awaiting host (port = {}): {}", port, e);

                self.pool.release(port).await;

                return;
            }
            Err(_) => {
                info!(
                    "No host attached within {}s, reclaiming (port = {})",
                    self.host_attach_timeout.as_secs(),
                    port
                );

                self.pool.release(port).await;

                return;
            }
        };

        let (tunnel_read, tunnel_write) = tunnel.into_split();

        let frames_in = FramedRead::new(tunnel_read, FrameCodec::new());
        let frames_out = FramedWrite::new(tunnel_write, FrameCodec::new());

        let registry = mux::new_registry();

        let (tx_tunnel, rx_tunnel) = mpsc::unbounded_channel::<Frame>();
        let (tx_dead, rx_dead) = watch::channel(false);

        let writer = mux::spawn_tunnel_writer(frames_out, rx_tunnel);

        // Tunnel reader: frames from the host fan out to registered peers.
        let reader_registry = registry.clone();
        let reader = tokio::spawn(async move {
            let mut frames_in = frames_in;

            while let Some(result) = frames_in.next().await {
                match result {
                    Ok(frame) if frame.is_disconnect() => {
                        let peer = reader_registry.lock().await.remove(&frame.peer_id);

                        if let Some(peer) = peer {
                            debug!("Host closed peer {} (port = {})", frame.peer_id, port);

                            let _ = peer.tx_shutdown.send(true);
                        }
                    }
                    Ok(frame) => {
                        let registry = reader_registry.lock().await;

                        match registry.get(&frame.peer_id) {
                            Some(peer) => {
                                let _ = peer.tx_bytes.send(frame.payload);
                            }
                            // A peer this session already forgot; the host
                            // will learn of the close shortly.
                            None => trace!(
                                "Dropping frame for unknown peer {} (port = {})",
                                frame.peer_id,
                                port
                            ),
                        }
                    }
                    Err(e) => {
                        error!("Tunnel error (port = {}): {}", port, e);

                        break;
                    }
                }
            }

            let _ = tx_dead.send(true);
        });

        info!("Session operating (port = {})", port);

        // Peer acceptor. Ids are monotonic and never reused within the
        // session. The short accept timeout bounds how long a dead host
        // tunnel can go unnoticed.
        let mut next_peer_id: u32 = 1;

        loop {
            if *rx_dead.borrow() {
                break;
            }

            let (stream, addr) = match timeout(ACCEPT_POLL_INTERVAL, self.listener.accept()).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    error!("Accept failed (port = {}): {}", port, e);

                    break;
                }
                Ok(Ok(accepted)) => accepted,
            };

            let peer_id = next_peer_id;
            next_peer_id += 1;

            debug!("Peer {} connected (port = {}) (addr = {})", peer_id, port, addr);

            let (tx_shutdown, rx_shutdown) = watch::channel(false);
            let (tx_bytes, rx_bytes) = mpsc::unbounded_channel();

            registry
                .lock()
                .await
                .insert(peer_id, PeerHandle::new(tx_bytes, tx_shutdown));

            mux::spawn_peer(
                Peer::new(peer_id, addr, stream, rx_shutdown, rx_bytes),
                registry.clone(),
                tx_tunnel.clone(),
            );
        }

        debug!("Session draining (port = {})", port);

        // Teardown: close the listener and tunnel, then drain the registry
        // and shut every peer down before returning the port.
        drop(self.listener);
        drop(tx_tunnel);

        reader.abort();
        writer.abort();

        for (_, peer) in registry.lock().await.drain() {
            let _ = peer.tx_shutdown.send(true);
        }

        self.pool.release(port).await;

        info!("Session released (port = {})", port);
    }
}
