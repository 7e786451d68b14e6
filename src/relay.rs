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
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::General;
use crate::error::BurrowResult;
use crate::pool::PortPool;
use crate::protocol::ControlReply;
use crate::session::PeerSession;

pub struct Relay {
    /// TCP listener bind for the control endpoint.
    listener: TcpListener,

    /// Pool of public session ports.
    pool: Arc<PortPool>,

    /// Mapping of public port to the session driving it.
    ///
    /// Entries are pruned by the health sweep once a session finishes.
    sessions: Arc<Mutex<HashMap<u16, SessionHandle>>>,

    /// Address session listeners bind to, shared with the control listener.
    bind_address: String,

    /// Bounded wait for a host to dial its assigned port.
    host_attach_timeout: Duration,

    /// Interval between health sweeps.
    health_interval: Duration,
}

struct SessionHandle {
    handle: JoinHandle<()>,
}

impl Relay {
    pub async fn new(config: General) -> BurrowResult<Self> {
        let listener =
            TcpListener::bind((config.bind_address.as_str(), config.control_port)).await?;

        info!(
            "Control endpoint listening (addr = {}:{})",
            config.bind_address, config.control_port
        );

        let pool = Arc::new(PortPool::new(config.pool_low, config.pool_high));

        if pool.capacity() == 0 {
            warn!(
                "Port pool is empty (low = {}) (high = {})",
                config.pool_low, config.pool_high
            );
        }

        Ok(Self {
            listener,
            pool,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            bind_address: config.bind_address,
            host_attach_timeout: Duration::from_secs(config.host_attach_timeout as u64),
            health_interval: Duration::from_secs(config.health_interval as u64),
        })
    }

    /// Pool handle, mainly for introspection.
    pub fn pool(&self) -> Arc<PortPool> {
        self.pool.clone()
    }

    /// Start the main event loop.
    ///
    /// Handles control connections and the periodic health sweep until
    /// interrupted.
    pub async fn up(&mut self) -> BurrowResult<()> {
        let mut sweep = interval(self.health_interval);

        info!("Started processing port requests");

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");

                    // Exit to main; dropping the relay closes the control
                    // listener.
                    return Ok(());
                }
                Ok((stream, addr)) = self.listener.accept() => {
                    debug!("Port request (addr = {})", addr);

                    self.handle_control(stream, addr);
                }
                _ = sweep.tick() => {
                    self.sweep_sessions().await;
                }
            }
        }
    }

    /// Serve one control connection.
    ///
    /// The exchange is one-shot: the client sends nothing and receives
    /// either the ASCII decimal port or `ERROR:<reason>`, then the
    /// connection closes. The session listener is bound before the reply
    /// is written so the host can dial the port the moment it reads it.
    fn handle_control(&self, stream: TcpStream, addr: SocketAddr) {
        let pool = self.pool.clone();
        let sessions = self.sessions.clone();
        let bind_address = self.bind_address.clone();
        let host_attach_timeout = self.host_attach_timeout;

        tokio::spawn(async move {
            let mut stream = stream;

            let port = match pool.acquire().await {
                Some(port) => port,
                None => {
                    warn!("Port pool exhausted (addr = {})", addr);

                    if let Err(e) = stream
                        .write_all(&ControlReply::Error("NoPorts").to_bytes())
                        .await
                    {
                        error!("Unable to send refusal (addr = {}): {}", addr, e);
                    }

                    return;
                }
            };

            let session =
                match PeerSession::bind(&bind_address, port, pool.clone(), host_attach_timeout)
                    .await
                {
                    Ok(session) => session,
                    Err(e) => {
                        error!("Unable to bind session listener (port = {}): {}", port, e);

                        pool.release(port).await;

                        if let Err(e) = stream
                            .write_all(&ControlReply::Error("BindFailed").to_bytes())
                            .await
                        {
                            error!("Unable to send refusal (addr = {}): {}", addr, e);
                        }

                        return;
                    }
                };

            info!("Assigned public port {} (addr = {})", port, addr);

            if let Err(e) = stream
                .write_all(&ControlReply::Port(port).to_bytes())
                .await
            {
                error!("Unable to send port reply (addr = {}): {}", addr, e);

                // Dropping the unstarted session closes its listener.
                pool.release(port).await;

                return;
            }

            let handle = tokio::spawn(session.run());

            sessions.lock().await.insert(port, SessionHandle { handle });
        });
    }

    /// Prune finished sessions and reclaim any port they failed to return.
    ///
    /// Sessions release their own port on every exit path; a reclaim here
    /// means a session leaked its port.
    async fn sweep_sessions(&self) {
        let mut sessions = self.sessions.lock().await;

        let finished: Vec<u16> = sessions
            .iter()
            .filter(|(_, session)| session.handle.is_finished())
            .map(|(port, _)| *port)
            .collect();

        for port in finished {
            sessions.remove(&port);

            if self.pool.release(port).await {
                warn!("Reclaimed port {} from a session that exited without releasing it", port);
            } else {
                debug!("Session finished cleanly (port = {})", port);
            }
        }
    }
}
