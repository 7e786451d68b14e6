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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, Decoder, Framed, FramedWrite};

use bytes::Bytes;

use futures::sink::SinkExt;

use crate::protocol::{Frame, FrameCodec};

/// Registry of live multiplexed connections, keyed by peer id.
///
/// The relay keeps one per session (public peer sockets); the host keeps
/// one per tunnel (local service sockets). Lookups and mutations are O(1)
/// under the lock; socket I/O never happens while it is held.
pub type PeerRegistry = Arc<Mutex<HashMap<u32, PeerHandle>>>;

pub fn new_registry() -> PeerRegistry {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Registry entry for one multiplexed connection.
pub struct PeerHandle {
    /// Bytes demultiplexed off the tunnel, to be written to the socket.
    ///
    /// The socket itself is owned by the connection's pump task; this is
    /// the only way to reach it.
    pub tx_bytes: mpsc::UnboundedSender<Bytes>,

    /// Connection shutdown sender channel.
    ///
    /// Will drop the connection once sent.
    pub tx_shutdown: watch::Sender<bool>,
}

impl PeerHandle {
    pub fn new(tx_bytes: mpsc::UnboundedSender<Bytes>, tx_shutdown: watch::Sender<bool>) -> Self {
        Self {
            tx_bytes,
            tx_shutdown,
        }
    }
}

/// One socket bound to a peer id, owned by its pump task.
pub struct Peer {
    /// Identifier this connection carries on the tunnel.
    id: u32,

    /// Remote address, for diagnostics only.
    addr: SocketAddr,

    /// Wrap the TcpStream around bytes allows chunked based level operation
    /// rather than raw bytes.
    frame: Framed<TcpStream, BytesCodec>,

    /// Connection shutdown receiver channel.
    rx_shutdown: watch::Receiver<bool>,

    /// Bytes queued for this socket by the tunnel reader.
    rx_bytes: mpsc::UnboundedReceiver<Bytes>,
}

impl Peer {
    pub fn new(
        id: u32,
        addr: SocketAddr,
        stream: TcpStream,
        rx_shutdown: watch::Receiver<bool>,
        rx_bytes: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            id,
            addr,
            frame: BytesCodec::new().framed(stream),
            rx_shutdown,
            rx_bytes,
        }
    }
}

/// Spawn the pump task that owns one multiplexed connection.
///
/// Reads from the socket become `{id, len, payload}` frames on the tunnel
/// channel; bytes arriving on `rx_bytes` are written to the socket. The
/// task exits on EOF, a socket error, or the shutdown signal, and then
/// deregisters itself. The final `{id, 0}` frame is emitted only if the
/// connection was still registered; absence means the other endpoint
/// already signalled the close and must not be told again.
pub fn spawn_peer(peer: Peer, registry: PeerRegistry, tx_tunnel: mpsc::UnboundedSender<Frame>) {
    let mut peer = peer;

    tokio::spawn(async move {
        loop {
            select! {
                _ = peer.rx_shutdown.changed() => {
                    break;
                }
                Some(bytes) = peer.rx_bytes.recv() => {
                    if let Err(e) = peer.frame.send(bytes).await {
                        debug!("Unable to write to connection {} (addr = {}): {}", peer.id, peer.addr, e);

                        break;
                    }
                }
                result = peer.frame.next() => {
                    match result {
                        Some(Ok(buf)) => {
                            if !buf.is_empty() {
                                let _ = tx_tunnel.send(Frame::data(peer.id, buf.freeze()));
                            }
                        }
                        Some(Err(e)) => {
                            debug!("Connection {} read error (addr = {}): {}", peer.id, peer.addr, e);

                            break;
                        }
                        None => {
                            break;
                        }
                    }
                }
            }
        }

        let was_registered = registry.lock().await.remove(&peer.id).is_some();

        if was_registered {
            let _ = tx_tunnel.send(Frame::disconnect(peer.id));
        }

        debug!("Connection {} closed (addr = {})", peer.id, peer.addr);

        // Exiting this future drops the socket, closing the connection
    });
}

/// Spawn the single writer task for a tunnel.
///
/// Every producer sends whole frames through the channel; only this task
/// touches the write half, so a header and its payload can never interleave
/// with another frame. The task ends when all senders drop or the tunnel
/// rejects a write.
pub fn spawn_tunnel_writer(
    frames_out: FramedWrite<OwnedWriteHalf, FrameCodec>,
    rx_tunnel: mpsc::UnboundedReceiver<Frame>,
) -> JoinHandle<()> {
    let mut frames_out = frames_out;
    let mut rx_tunnel = rx_tunnel;

    tokio::spawn(async move {
        while let Some(frame) = rx_tunnel.recv().await {
            if let Err(e) = frames_out.send(frame).await {
                debug!("Tunnel write failed: {}", e);

                break;
            }
        }
    })
}
