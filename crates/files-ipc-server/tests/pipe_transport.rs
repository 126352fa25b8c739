//! Integration tests for the duplex pipe transport: framing, ACL
//! friendliness to same-user processes, and the full protocol over a real
//! Unix socket.

mod common;

use serde_json::Value;

use common::{handshake_request, start_server, PipeClient, TEST_TOKEN};
use files_ipc_core::Rendezvous;

fn parse(frame: &str) -> Value {
    serde_json::from_str(frame).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_over_pipe() {
    let server = start_server(false, true, |_| {}).await;
    let mut client = PipeClient::connect(server.pipe_path.as_ref().unwrap()).await;

    client.send(&handshake_request(1)).await;
    let reply = parse(&client.recv_timeout().await.unwrap());
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["status"], "authenticated");
    assert_eq!(reply["result"]["epoch"], 1);
    assert_eq!(reply["result"]["serverInfo"], "Files IPC Server");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_token_over_pipe() {
    let server = start_server(false, true, |_| {}).await;
    let mut client = PipeClient::connect(server.pipe_path.as_ref().unwrap()).await;

    client
        .send(r#"{"jsonrpc":"2.0","id":"x","method":"handshake","params":{"token":"wrong"}}"#)
        .await;
    let reply = parse(&client.recv_timeout().await.unwrap());
    assert_eq!(reply["id"], "x");
    assert_eq!(reply["error"]["code"], -32002);
    assert_eq!(reply["error"]["message"], "Invalid token");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_same_user_client_connects() {
    // The ACL grants the current user; a second process (here, a second
    // connection) of the same user must not be locked out.
    let server = start_server(false, true, |_| {}).await;
    let path = server.pipe_path.clone().unwrap();

    let mut first = PipeClient::connect(&path).await;
    let mut second = PipeClient::connect(&path).await;

    first.send(&handshake_request(1)).await;
    second.send(&handshake_request(2)).await;

    assert_eq!(
        parse(&first.recv_timeout().await.unwrap())["result"]["status"],
        "authenticated"
    );
    assert_eq!(
        parse(&second.recv_timeout().await.unwrap())["result"]["status"],
        "authenticated"
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversize_length_prefix_closes_without_reply() {
    let server = start_server(false, true, |config| {
        config.set_pipe_max_message_bytes(4096);
    })
    .await;
    let mut client = PipeClient::connect(server.pipe_path.as_ref().unwrap()).await;

    let oversize = (4096u32 + 1).to_le_bytes();
    client.send_raw(&oversize).await;
    client.send_raw(&[b'x'; 16]).await;

    assert_eq!(client.recv_timeout().await, None, "server must close, not reply");
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_length_prefix_closes_without_reply() {
    let server = start_server(false, true, |_| {}).await;
    let mut client = PipeClient::connect(server.pipe_path.as_ref().unwrap()).await;

    client.send_raw(&0u32.to_le_bytes()).await;
    assert_eq!(client.recv_timeout().await, None);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn boundary_sized_frame_is_accepted() {
    let server = start_server(false, true, |config| {
        config.set_pipe_max_message_bytes(512);
    })
    .await;
    let mut client = PipeClient::connect(server.pipe_path.as_ref().unwrap()).await;

    // A valid request padded to exactly the cap still gets a reply.
    let mut request =
        r#"{"jsonrpc":"2.0","id":7,"method":"handshake","params":{"token":"TOKEN","clientInfo":"PAD"}}"#
            .replace("TOKEN", TEST_TOKEN);
    let padding = 512 - request.len();
    request = request.replace("PAD", &"p".repeat(padding + 3));
    assert_eq!(request.len(), 512);

    client.send(&request).await;
    let reply = parse(&client.recv_timeout().await.unwrap());
    assert_eq!(reply["result"]["status"], "authenticated");
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_request_cycle_over_pipe() {
    let server = start_server(false, true, |_| {}).await;
    let mut client = PipeClient::connect(server.pipe_path.as_ref().unwrap()).await;

    client.send(&handshake_request(1)).await;
    client.recv_timeout().await.unwrap();

    client
        .send(r#"{"jsonrpc":"2.0","id":2,"method":"navigate","params":{"path":"/tmp"}}"#)
        .await;
    let reply = parse(&client.recv_timeout().await.unwrap());
    assert_eq!(reply["result"]["status"], "ok");

    client
        .send(r#"{"jsonrpc":"2.0","id":3,"method":"getState"}"#)
        .await;
    let reply = parse(&client.recv_timeout().await.unwrap());
    assert_eq!(reply["result"]["currentPath"], "/tmp");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_namespace_path_is_rejected() {
    let server = start_server(false, true, |_| {}).await;
    let mut client = PipeClient::connect(server.pipe_path.as_ref().unwrap()).await;

    client.send(&handshake_request(1)).await;
    client.recv_timeout().await.unwrap();

    client
        .send(r#"{"jsonrpc":"2.0","id":9,"method":"navigate","params":{"path":"\\\\?\\C:\\Windows"}}"#)
        .await;
    let reply = parse(&client.recv_timeout().await.unwrap());
    assert_eq!(reply["id"], 9);
    assert_eq!(reply["error"]["code"], -32602);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rotation_expires_pipe_session() {
    let server = start_server(false, true, |_| {}).await;
    let mut client = PipeClient::connect(server.pipe_path.as_ref().unwrap()).await;

    client.send(&handshake_request(1)).await;
    client.recv_timeout().await.unwrap();

    server.service.rotate_token().unwrap();

    client
        .send(r#"{"jsonrpc":"2.0","id":2,"method":"getState"}"#)
        .await;
    let reply = parse(&client.recv_timeout().await.unwrap());
    assert_eq!(reply["error"]["code"], -32004);

    // Exactly one -32004, then the server closes the pipe.
    assert_eq!(client.recv_timeout().await, None);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipe_endpoint_is_published_to_rendezvous() {
    let server = start_server(false, true, |_| {}).await;
    let pipe_path = server.pipe_path.clone().unwrap();

    let descriptor_path = server
        .service
        .runtime()
        .rendezvous()
        .current_path()
        .to_path_buf();
    let descriptor = Rendezvous::read(&descriptor_path).unwrap().unwrap();
    assert_eq!(descriptor.pipe_name.as_deref(), Some(pipe_path.to_str().unwrap()));
    assert_eq!(descriptor.token, TEST_TOKEN);
    assert_eq!(descriptor.epoch, 1);

    let name = pipe_path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("Files_IPC_"));

    server.stop().await;
    assert!(!descriptor_path.exists(), "stop must delete the descriptor");
}
