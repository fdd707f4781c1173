mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open_socket(server: &common::TestServer) -> Socket {
    let (socket, _) = connect_async(server.ws_url("/api/terminal-session"))
        .await
        .unwrap();
    socket
}

async fn send_init(socket: &mut Socket, token: &str, host_ref: &str) {
    let init = json!({ "type": "init", "authToken": token, "hostRef": host_ref });
    socket
        .send(Message::Text(init.to_string()))
        .await
        .unwrap();
}

/// Next text frame as JSON, skipping binary output.
async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a text frame")
            .expect("socket ended")
            .unwrap();
        if let Message::Text(raw) = msg {
            return serde_json::from_str(&raw).unwrap();
        }
    }
}

#[tokio::test]
async fn typed_input_is_echoed_back_exactly() {
    let server = common::start_server().await;
    let mut socket = open_socket(&server).await;
    send_init(&mut socket, &common::token("u1"), "h1").await;

    let connected = next_json(&mut socket).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["hostRef"], "h1");
    assert!(connected["sessionId"].as_str().is_some());

    socket
        .send(Message::Binary(b"ls\n".to_vec()))
        .await
        .unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < 3 {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Binary(bytes) = msg {
            echoed.extend_from_slice(&bytes);
        }
    }
    assert_eq!(echoed, b"ls\n");
    assert_eq!(server.state.sessions.session_count(), 1);
}

#[tokio::test]
async fn invalid_token_is_rejected_before_spawning() {
    let server = common::start_server().await;
    let mut socket = open_socket(&server).await;
    send_init(&mut socket, "not-a-token", "h1").await;

    let error = next_json(&mut socket).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "AUTH_FAILED");
    assert_eq!(server.state.sessions.session_count(), 0);
}

#[tokio::test]
async fn unknown_host_reports_unreachable() {
    let server = common::start_server().await;
    let mut socket = open_socket(&server).await;
    send_init(&mut socket, &common::token("u1"), "nowhere").await;

    let error = next_json(&mut socket).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "HOST_UNREACHABLE");
}

#[tokio::test]
async fn process_exit_is_reported_then_socket_closes() {
    let server = common::start_server().await;
    let mut socket = open_socket(&server).await;
    send_init(&mut socket, &common::token("u1"), "h-exit").await;

    assert_eq!(next_json(&mut socket).await["type"], "connected");
    socket.send(Message::Binary(b"\n".to_vec())).await.unwrap();
    let exit = next_json(&mut socket).await;
    assert_eq!(exit["type"], "exit");
    assert_eq!(exit["exitCode"], 3);
    assert_eq!(exit["cause"], "process-exited");

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn ping_gets_pong() {
    let server = common::start_server().await;
    let mut socket = open_socket(&server).await;
    send_init(&mut socket, &common::token("u1"), "h1").await;
    assert_eq!(next_json(&mut socket).await["type"], "connected");

    socket
        .send(Message::Text(json!({ "type": "ping" }).to_string()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut socket).await["type"], "pong");
}

#[tokio::test]
async fn dropping_the_socket_tears_the_session_down() {
    let server = common::start_server().await;
    let mut socket = open_socket(&server).await;
    send_init(&mut socket, &common::token("u1"), "h1").await;
    assert_eq!(next_json(&mut socket).await["type"], "connected");
    assert_eq!(server.state.sessions.session_count(), 1);

    drop(socket);

    let gone = tokio::time::timeout(Duration::from_secs(5), async {
        while server.state.sessions.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "session should be removed after disconnect");
}
