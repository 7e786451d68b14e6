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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{BurrowError, BurrowResult};
use crate::mux::{self, Peer, PeerHandle, PeerRegistry};
use crate::protocol::{ControlReply, Frame, FrameCodec};

/// Command-line surface of the host process.
pub struct HostArgs {
    pub relay_ip: IpAddr,
    pub control_port: u16,
    pub local_port: u16,
}

impl HostArgs {
    /// Parse `<relay_ip> <control_port> <local_port>`.
    pub fn parse(args: &[String]) -> BurrowResult<Self> {
        if args.len() != 3 {
            return Err(BurrowError::BadArgs);
        }

        let relay_ip = args[0].parse()?;
        let control_port = args[1].parse()?;
        let local_port = args[2].parse()?;

        Ok(Self {
            relay_ip,
            control_port,
            local_port,
        })
    }
}

/// Request a public port, dial it, and serve the tunnel until it closes.
///
/// Returns once the tunnel is gone; whether to try again is the
/// operator's call.
pub async fn bootstrap(args: &HostArgs) -> BurrowResult<()> {
    info!(
        "Requesting public port (relay = {}:{})",
        args.relay_ip, args.control_port
    );

    let mut control = TcpStream::connect((args.relay_ip, args.control_port)).await?;

    // The relay writes one reply and closes.
    let mut reply = Vec::with_capacity(16);
    control.read_to_end(&mut reply).await?;

    let (_, reply) = ControlReply::parse(&reply).map_err(|_| BurrowError::MalformedReply)?;

    let public_port = match reply {
        ControlReply::Port(port) => port,
        ControlReply::Error(reason) => return Err(BurrowError::Refused(reason.to_string())),
    };

    info!(
        "Assigned public port {}; establishing tunnel (relay = {})",
        public_port, args.relay_ip
    );

    let tunnel = TcpStream::connect((args.relay_ip, public_port)).await?;

    info!(
        "Tunnel established; service is reachable at {}:{}",
        args.relay_ip, public_port
    );

    Demultiplexer::new(args.local_port).run(tunnel).await
}

/// Host-side end of the tunnel.
///
/// Routes frames to local sub-connections, dialling the hidden service
/// lazily on the first payload for an unseen peer id. A sub-connection
/// failure only ever costs that one peer; the tunnel outlives it.
pub struct Demultiplexer {
    /// Port of the hidden service on loopback.
    local_port: u16,

    registry: PeerRegistry,
}

impl Demultiplexer {
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            registry: mux::new_registry(),
        }
    }

    pub async fn run(self, tunnel: TcpStream) -> BurrowResult<()> {
        let (tunnel_read, tunnel_write) = tunnel.into_split();

        let mut frames_in = FramedRead::new(tunnel_read, FrameCodec::new());
        let frames_out = FramedWrite::new(tunnel_write, FrameCodec::new());

        let (tx_tunnel, rx_tunnel) = mpsc::unbounded_channel::<Frame>();

        let writer = mux::spawn_tunnel_writer(frames_out, rx_tunnel);

        let mut result = Ok(());

        while let Some(frame) = frames_in.next().await {
            match frame {
                Ok(frame) if frame.is_disconnect() => {
                    let conn = self.registry.lock().await.remove(&frame.peer_id);

                    if let Some(conn) = conn {
                        debug!("Relay closed peer {}", frame.peer_id);

                        let _ = conn.tx_shutdown.send(true);
                    }
                }
                Ok(frame) => self.route(frame, &tx_tunnel).await,
                Err(e) => {
                    error!("Tunnel error: {}", e);

                    result = Err(e);

                    break;
                }
            }
        }

        debug!("Tunnel closed, draining local connections");

        drop(tx_tunnel);

        writer.abort();

        for (_, conn) in self.registry.lock().await.drain() {
            let _ = conn.tx_shutdown.send(true);
        }

        result
    }

    /// Deliver one payload frame, opening the local sub-connection on the
    /// first payload for an unseen peer id.
    async fn route(&self, frame: Frame, tx_tunnel: &mpsc::UnboundedSender<Frame>) {
        let peer_id = frame.peer_id;

        {
            let registry = self.registry.lock().await;

            if let Some(conn) = registry.get(&peer_id) {
                let _ = conn.tx_bytes.send(frame.payload);

                return;
            }

            // The dial happens outside the lock.
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port));

        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("Opened local connection for peer {} (addr = {})", peer_id, addr);

                let (tx_shutdown, rx_shutdown) = watch::channel(false);
                let (tx_bytes, rx_bytes) = mpsc::unbounded_channel();

                let _ = tx_bytes.send(frame.payload);

                self.registry
                    .lock()
                    .await
                    .insert(peer_id, PeerHandle::new(tx_bytes, tx_shutdown));

                mux::spawn_peer(
                    Peer::new(peer_id, addr, stream, rx_shutdown, rx_bytes),
                    self.registry.clone(),
                    tx_tunnel.clone(),
                );
            }
            Err(e) => {
                warn!(
                    "Unable to reach local service (addr = {}): {}; dropping peer {}",
                    addr, e, peer_id
                );

                // Tell the relay to close the public socket; the tunnel
                // itself stays up.
                let _ = tx_tunnel.send(Frame::disconnect(peer_id));
            }
        }
    }
}
