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

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use rand::Rng;

use burrow::config::General;
use burrow::host::{self, Demultiplexer, HostArgs};
use burrow::pool::PortPool;
use burrow::protocol::{Frame, FrameCodec};
use burrow::relay::Relay;

// Each test keeps to its own port range so the suite can run in parallel.

fn config(control_port: u16, pool_low: u16, pool_high: u16, host_attach_timeout: u32) -> General {
    General {
        bind_address: "127.0.0.1".to_string(),
        control_port,
        pool_low,
        pool_high,
        host_attach_timeout,
        health_interval: 60,
    }
}

async fn start_relay(general: General) -> Arc<PortPool> {
    let mut relay = Relay::new(general).await.unwrap();

    let pool = relay.pool();

    tokio::spawn(async move {
        let _ = relay.up().await;
    });

    pool
}

/// Plain echo service standing in for the hidden local service.
async fn start_echo(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };

            tokio::spawn(async move {
                let mut buf = [0u8; 4096];

                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
}

/// One-shot control exchange, returning the raw ASCII reply.
async fn request_port(control_port: u16) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", control_port))
        .await
        .unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();

    String::from_utf8(reply).unwrap()
}

/// Attach a host tunnel directly, running the demultiplexer in-process.
async fn attach_host(control_port: u16, local_port: u16) -> u16 {
    let reply = request_port(control_port).await;
    let public_port: u16 = reply.parse().unwrap();

    let tunnel = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();

    tokio::spawn(async move {
        let _ = Demultiplexer::new(local_port).run(tunnel).await;
    });

    // Give the session listener a beat to take the tunnel off its queue.
    sleep(Duration::from_millis(200)).await;

    public_port
}

async fn read_exact_len(read_half: &mut OwnedReadHalf, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;

    while filled < len {
        let n = timeout(Duration::from_secs(30), read_half.read(&mut buf[filled..]))
            .await
            .expect("read timed out")
            .unwrap();

        assert!(n > 0, "stream closed after {} of {} bytes", filled, len);

        filled += n;
    }

    buf
}

#[tokio::test(flavor = "multi_thread")]
async fn single_peer_round_trip() {
    start_echo(36010).await;
    let pool = start_relay(config(36000, 36001, 36005, 300)).await;

    // Drive the real host bootstrap path end to end.
    let args = HostArgs {
        relay_ip: "127.0.0.1".parse().unwrap(),
        control_port: 36000,
        local_port: 36010,
    };

    tokio::spawn(async move {
        let _ = host::bootstrap(&args).await;
    });

    sleep(Duration::from_secs(1)).await;

    assert_eq!(pool.in_use().await, 1);

    let mut peer = TcpStream::connect(("127.0.0.1", 36001)).await.unwrap();

    peer.write_all(b"HELLO").await.unwrap();

    let mut reply = [0u8; 5];
    timeout(Duration::from_secs(5), peer.read_exact(&mut reply))
        .await
        .expect("echo timed out")
        .unwrap();

    assert_eq!(&reply, b"HELLO");

    drop(peer);
    sleep(Duration::from_millis(300)).await;

    // The session survives a peer disconnect; later peers keep working.
    let mut peer = TcpStream::connect(("127.0.0.1", 36001)).await.unwrap();

    peer.write_all(b"world").await.unwrap();

    let mut reply = [0u8; 5];
    timeout(Duration::from_secs(5), peer.read_exact(&mut reply))
        .await
        .expect("echo timed out")
        .unwrap();

    assert_eq!(&reply, b"world");
}

#[tokio::test(flavor = "multi_thread")]
async fn two_peers_interleaved_payloads() {
    const PAYLOAD_LEN: usize = 1 << 20;

    start_echo(36110).await;
    start_relay(config(36100, 36101, 36105, 300)).await;

    let public_port = attach_host(36100, 36110).await;

    let peer_a = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    let peer_b = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();

    let mut data_a = vec![0u8; PAYLOAD_LEN];
    let mut data_b = vec![0u8; PAYLOAD_LEN];
    rand::thread_rng().fill(&mut data_a[..]);
    rand::thread_rng().fill(&mut data_b[..]);

    let exercise = |stream: TcpStream, data: Vec<u8>| async move {
        let (mut read_half, mut write_half) = stream.into_split();

        let sent = data.clone();
        let writer = tokio::spawn(async move {
            for chunk in sent.chunks(16 * 1024) {
                write_half.write_all(chunk).await.unwrap();
            }

            write_half
        });

        let received = read_exact_len(&mut read_half, data.len()).await;

        writer.await.unwrap();

        assert_eq!(received, data, "echoed stream diverged");
    };

    // Both peers pump a megabyte through the same tunnel at once; each
    // must get its own bytes back, in order, unmixed.
    tokio::join!(exercise(peer_a, data_a), exercise(peer_b, data_b));
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_exhaustion_refuses_third_host() {
    start_relay(config(36200, 36201, 36202, 300)).await;

    assert_eq!(request_port(36200).await, "36201");
    assert_eq!(request_port(36200).await, "36202");
    assert_eq!(request_port(36200).await, "ERROR:NoPorts");
}

#[tokio::test(flavor = "multi_thread")]
async fn host_attach_timeout_reclaims_port() {
    let pool = start_relay(config(36300, 36301, 36303, 1)).await;

    assert_eq!(request_port(36300).await, "36301");
    assert_eq!(pool.in_use().await, 1);

    // Never dial the session port; the attach window lapses.
    sleep(Duration::from_millis(2500)).await;

    assert_eq!(pool.in_use().await, 0);
    assert_eq!(request_port(36300).await, "36301");
}

#[tokio::test(flavor = "multi_thread")]
async fn tunnel_crash_drops_peers_and_releases_port() {
    let pool = start_relay(config(36400, 36401, 36410, 300)).await;

    let reply = request_port(36400).await;
    let public_port: u16 = reply.parse().unwrap();

    // Act as the host by hand so the tunnel can be killed mid-session.
    let tunnel = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    let (tunnel_read, tunnel_write) = tunnel.into_split();
    let mut frames = FramedRead::new(tunnel_read, FrameCodec::new());

    sleep(Duration::from_millis(200)).await;

    let mut peer = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    peer.write_all(b"hi").await.unwrap();

    let frame = timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("no frame from relay")
        .unwrap()
        .unwrap();

    assert_eq!(frame, Frame::data(1, bytes::Bytes::from_static(b"hi")));

    // Exactly one disconnect frame follows the peer's payload.
    drop(peer);

    let frame = timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("no disconnect frame from relay")
        .unwrap()
        .unwrap();

    assert_eq!(frame, Frame::disconnect(1));

    // A second peer is mid-session when the tunnel dies.
    let mut survivor = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    survivor.write_all(b"data").await.unwrap();

    let frame = timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("no frame from relay")
        .unwrap()
        .unwrap();

    assert_eq!(frame, Frame::data(2, bytes::Bytes::from_static(b"data")));

    drop(frames);
    drop(tunnel_write);

    // The relay must close the surviving peer within a bounded time.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), survivor.read(&mut buf))
        .await
        .expect("peer not closed after tunnel loss")
        .unwrap();

    assert_eq!(n, 0);

    sleep(Duration::from_secs(2)).await;

    assert_eq!(pool.in_use().await, 0);
    assert_eq!(request_port(36400).await, public_port.to_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_local_service_costs_only_the_peer() {
    start_relay(config(36500, 36501, 36505, 300)).await;

    // No service on 36510 yet; the host's dial will be refused.
    let public_port = attach_host(36500, 36510).await;

    let mut peer = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    peer.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), peer.read(&mut buf))
        .await
        .expect("peer not closed after failed local dial")
        .unwrap();

    assert_eq!(n, 0);

    // The tunnel survives; once the service is up, new peers get through.
    start_echo(36510).await;

    let mut peer = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();

    peer.write_all(b"again").await.unwrap();

    let mut reply = [0u8; 5];
    timeout(Duration::from_secs(5), peer.read_exact(&mut reply))
        .await
        .expect("echo timed out")
        .unwrap();

    assert_eq!(&reply, b"again");
}
