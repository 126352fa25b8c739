//! Integration tests for the loopback WebSocket transport.

mod common;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use common::{handshake_request, start_server, TEST_TOKEN};
use files_ipc_core::Rendezvous;

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect_ws(port: u16) -> WsClient {
    let (stream, _response) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
        .await
        .expect("websocket connect");
    stream
}

async fn recv_text(client: &mut WsClient) -> Option<String> {
    loop {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a WebSocket frame")?;
        match frame {
            Ok(WsMessage::Text(text)) => return Some(text),
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => continue,
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

fn parse(frame: &str) -> Value {
    serde_json::from_str(frame).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_over_websocket() {
    let server = start_server(true, false, |_| {}).await;
    let mut client = connect_ws(server.ws_port.unwrap()).await;

    client
        .send(WsMessage::Text(handshake_request(1)))
        .await
        .unwrap();
    let reply = parse(&recv_text(&mut client).await.unwrap());
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["status"], "authenticated");
    assert_eq!(reply["result"]["serverInfo"], "Files IPC Server");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_upgrade_request_gets_400() {
    let server = start_server(true, false, |_| {}).await;
    let port = server.ws_port.unwrap();

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(
        response.starts_with("HTTP/1.1 400"),
        "plain HTTP must get 400: {response}"
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_upgrade_post_gets_400() {
    let server = start_server(true, false, |_| {}).await;
    let port = server.ws_port.unwrap();

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    stream
        .write_all(
            b"POST /anything HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_at_exact_cap_is_accepted() {
    let server = start_server(true, false, |config| {
        config.set_ws_max_message_bytes(1024);
    })
    .await;
    let mut client = connect_ws(server.ws_port.unwrap()).await;

    let mut request =
        r#"{"jsonrpc":"2.0","id":1,"method":"handshake","params":{"token":"TOKEN","clientInfo":"PAD"}}"#
            .replace("TOKEN", TEST_TOKEN);
    let padding = 1024 - request.len();
    request = request.replace("PAD", &"p".repeat(padding + 3));
    assert_eq!(request.len(), 1024);

    client.send(WsMessage::Text(request)).await.unwrap();
    let reply = parse(&recv_text(&mut client).await.unwrap());
    assert_eq!(reply["result"]["status"], "authenticated");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_one_byte_over_cap_closes_the_session() {
    let server = start_server(true, false, |config| {
        config.set_ws_max_message_bytes(1024);
    })
    .await;
    let mut client = connect_ws(server.ws_port.unwrap()).await;

    let mut oversize =
        r#"{"jsonrpc":"2.0","id":1,"method":"getState","params":{"pad":"PAD"}}"#.to_string();
    let padding = 1025 - (oversize.len() - 3);
    oversize = oversize.replace("PAD", &"x".repeat(padding));
    assert_eq!(oversize.len(), 1025);

    client.send(WsMessage::Text(oversize)).await.unwrap();
    assert_eq!(
        recv_text(&mut client).await,
        None,
        "oversize message must close the connection without a reply"
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binary_frame_closes_the_session() {
    let server = start_server(true, false, |_| {}).await;
    let mut client = connect_ws(server.ws_port.unwrap()).await;

    client
        .send(WsMessage::Binary(vec![1, 2, 3]))
        .await
        .unwrap();
    assert_eq!(recv_text(&mut client).await, None);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notifications_reach_websocket_subscribers() {
    let server = start_server(true, false, |_| {}).await;
    let mut client = connect_ws(server.ws_port.unwrap()).await;

    client
        .send(WsMessage::Text(handshake_request(1)))
        .await
        .unwrap();
    recv_text(&mut client).await.unwrap();

    server
        .service
        .runtime()
        .broadcast("itemsChanged", serde_json::json!({"itemCount": 5}));

    let notification = parse(&recv_text(&mut client).await.unwrap());
    assert_eq!(notification["method"], "itemsChanged");
    assert_eq!(notification["params"]["itemCount"], 5);
    assert!(notification.get("id").is_none());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_port_is_published_to_rendezvous() {
    let server = start_server(true, false, |_| {}).await;
    let port = server.ws_port.unwrap();

    let descriptor = Rendezvous::read(server.service.runtime().rendezvous().current_path())
        .unwrap()
        .unwrap();
    assert_eq!(descriptor.web_socket_port, Some(port));
    assert_eq!(descriptor.token, TEST_TOKEN);
    assert_eq!(descriptor.server_pid, std::process::id());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn both_transports_serve_the_same_runtime() {
    let server = start_server(true, true, |_| {}).await;
    let mut ws = connect_ws(server.ws_port.unwrap()).await;
    let mut pipe = common::PipeClient::connect(server.pipe_path.as_ref().unwrap()).await;

    ws.send(WsMessage::Text(handshake_request(1))).await.unwrap();
    pipe.send(&handshake_request(2)).await;
    assert_eq!(
        parse(&recv_text(&mut ws).await.unwrap())["result"]["status"],
        "authenticated"
    );
    assert_eq!(
        parse(&pipe.recv_timeout().await.unwrap())["result"]["status"],
        "authenticated"
    );

    // Both transports are advertised in one descriptor.
    let descriptor = Rendezvous::read(server.service.runtime().rendezvous().current_path())
        .unwrap()
        .unwrap();
    assert!(descriptor.web_socket_port.is_some());
    assert!(descriptor.pipe_name.is_some());

    server.stop().await;
}
