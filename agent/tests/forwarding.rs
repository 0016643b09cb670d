//! End-to-end test driving two real agents through a real relay over TCP
//! loopback: bytes sent to one agent's local listener come back
//! byte-for-byte from an echo server dialed by the peer agent.

use std::sync::Arc;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
};
use waypoint_agent::{config::AgentSettings, notify::Notifier};
use waypoint_relay::{LoggingObserver, Relay};

/// Binds an ephemeral port, returning it immediately freed for reuse by
/// the forwarding rule under test. Accepted as inherently slightly racy,
/// the way other loopback-port tests in this ecosystem are written.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_relay() -> String {
    let relay = Relay::new(Arc::new(LoggingObserver));
    let router = waypoint_relay::http::router(relay);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    format!("ws://{addr}")
}

async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

#[tokio::test]
async fn bytes_sent_to_a_local_listener_echo_back_through_the_peer() {
    let proxy = spawn_relay().await;
    let echo_port = spawn_echo_server().await;
    let local_port = free_port().await;

    let source_settings = AgentSettings {
        proxy: proxy.clone(),
        channel: "c".into(),
        password: "pw".into(),
        name: "a".into(),
    };
    let sink_settings = AgentSettings {
        proxy,
        channel: "c".into(),
        password: "pw".into(),
        name: "b".into(),
    };

    let source_rules = vec![codec::ForwardingRule {
        local_port,
        remote_client: "b".into(),
        remote_host: "127.0.0.1".into(),
        remote_port: echo_port,
        valid: false,
    }];

    let (_source_shutdown_tx, source_shutdown_rx) = watch::channel(false);
    let (_sink_shutdown_tx, sink_shutdown_rx) = watch::channel(false);

    tokio::spawn(waypoint_agent::client::run(
        sink_settings,
        vec![],
        Arc::new(Notifier::default()),
        sink_shutdown_rx,
    ));
    tokio::spawn(waypoint_agent::client::run(
        source_settings,
        source_rules,
        Arc::new(Notifier::default()),
        source_shutdown_rx,
    ));

    // Give both agents time to join, publish MemberInfo, and bind the
    // local listener before a third party dials in.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let mut client = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        TcpStream::connect(("127.0.0.1", local_port)),
    )
    .await
    .expect("listener should be bound by now")
    .expect("connect should succeed");

    let payload = b"hello through the overlay\n";
    client.write_all(payload).await.unwrap();

    let mut received = vec![0u8; payload.len()];
    tokio::time::timeout(std::time::Duration::from_secs(2), client.read_exact(&mut received))
        .await
        .expect("echo should arrive before the timeout")
        .unwrap();

    assert_eq!(received, payload);
}

/// Streams a payload several times larger than `MAX_DATA_FRAGMENT_SIZE`
/// through an established socket-channel in small bursts, exercising the
/// pump's fragmentation into multiple `Data` packets and their
/// reassembly into the same byte stream on the other side.
#[tokio::test]
async fn large_payloads_survive_fragmentation_byte_for_byte() {
    let proxy = spawn_relay().await;
    let echo_port = spawn_echo_server().await;
    let local_port = free_port().await;

    let source_settings = AgentSettings {
        proxy: proxy.clone(),
        channel: "d".into(),
        password: "pw".into(),
        name: "a".into(),
    };
    let sink_settings = AgentSettings {
        proxy,
        channel: "d".into(),
        password: "pw".into(),
        name: "b".into(),
    };

    let source_rules = vec![codec::ForwardingRule {
        local_port,
        remote_client: "b".into(),
        remote_host: "127.0.0.1".into(),
        remote_port: echo_port,
        valid: false,
    }];

    let (_source_shutdown_tx, source_shutdown_rx) = watch::channel(false);
    let (_sink_shutdown_tx, sink_shutdown_rx) = watch::channel(false);

    tokio::spawn(waypoint_agent::client::run(
        sink_settings,
        vec![],
        Arc::new(Notifier::default()),
        sink_shutdown_rx,
    ));
    tokio::spawn(waypoint_agent::client::run(
        source_settings,
        source_rules,
        Arc::new(Notifier::default()),
        source_shutdown_rx,
    ));

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let client = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        TcpStream::connect(("127.0.0.1", local_port)),
    )
    .await
    .expect("listener should be bound by now")
    .expect("connect should succeed");

    let (mut read_half, mut write_half) = client.into_split();

    // A little over 2x MAX_DATA_FRAGMENT_SIZE (1 MiB), sent in 7 KiB
    // bursts, forces the pump to emit several Data packets for one
    // logical write.
    let payload: Vec<u8> = (0..2_500_000u32).map(|i| (i % 256) as u8).collect();
    let writer = {
        let payload = payload.clone();
        tokio::spawn(async move {
            for chunk in payload.chunks(7 * 1024) {
                write_half.write_all(chunk).await.unwrap();
            }
        })
    };

    let mut received = vec![0u8; payload.len()];
    tokio::time::timeout(
        std::time::Duration::from_secs(10),
        read_half.read_exact(&mut received),
    )
    .await
    .expect("full payload should echo back before the timeout")
    .unwrap();

    writer.await.unwrap();
    assert_eq!(received, payload);
}
