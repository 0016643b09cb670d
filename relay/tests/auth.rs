//! Integration test: a second agent joining with a mismatched password is
//! rejected with a CriticalError while the first agent stays connected.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use codec::{framing, Packet, PacketType};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};

async fn spawn_relay() -> std::net::SocketAddr {
    let relay = waypoint_relay::Relay::new(Arc::new(waypoint_relay::LoggingObserver));
    let router = waypoint_relay::http::router(relay);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    addr
}

async fn connect(
    addr: std::net::SocketAddr,
    channel: &str,
    client_name: &str,
    password: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!(
        "ws://{addr}/api/ws/connect?channel={channel}&clientName={client_name}"
    );
    let mut request = url.into_client_request().unwrap();
    let basic = STANDARD.encode(password.as_bytes());
    request.headers_mut().insert(
        "Authorization",
        format!("Basic {basic}").parse().unwrap(),
    );

    let (stream, _response) = tokio_tungstenite::connect_async(request).await.unwrap();
    stream
}

#[tokio::test]
async fn second_agent_with_wrong_password_is_rejected() {
    let addr = spawn_relay().await;

    let mut a = connect(addr, "c", "a", "x").await;
    let mut b = connect(addr, "c", "b", "y").await;

    // A should see at least one ChannelState broadcast and remain open.
    let a_first = a.next().await.expect("a should receive a message").unwrap();
    let a_packet = decode(a_first);
    assert!(matches!(a_packet.r#type, PacketType::ChannelState));

    // B should be told its password was wrong, then the transport closes.
    let mut saw_critical_error = false;
    while let Some(Ok(msg)) = b.next().await {
        if msg.is_close() {
            break;
        }
        let packet = decode(msg);
        if matches!(packet.r#type, PacketType::CriticalError) {
            let text: String = packet.body().unwrap();
            assert!(text.contains("Invalid password for channel: c"));
            saw_critical_error = true;
        }
    }
    assert!(saw_critical_error, "expected a CriticalError before close");

    // A is still usable: sending a MemberInfo doesn't error out.
    let member = codec::ChannelMember {
        id: uuid::Uuid::new_v4(),
        name: "a".into(),
        forwarding_rules: vec![],
    };
    let packet = Packet::with_body(
        PacketType::MemberInfo,
        codec::SocketChannelRef::none(),
        &member,
    )
    .unwrap();
    a.send(Message::Binary(framing::encode(&packet).unwrap()))
        .await
        .unwrap();
}

fn decode(msg: Message) -> Packet {
    match msg {
        Message::Binary(bytes) => framing::decode(&bytes).unwrap(),
        other => panic!("expected a binary frame, got {other:?}"),
    }
}
