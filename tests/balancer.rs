//! Load balancer relaying over real TCP.

use std::time::Duration;

use ezrpc::handler::Method;
use ezrpc::protocol::{decode_callback, encode_call, Callback, HEADER_SIZE, NO_SUCH_METHOD};
use ezrpc::{Backend, Client, LoadBalancer, RpcError, Server};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn listener() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.unwrap()
}

async fn backend(name: &'static str) -> Server {
    Server::builder()
        .method(Method::sync("add", |(a, b): (i64, i64)| Ok::<_, String>(a + b)))
        .method(Method::sync("whoami", move |(): ()| Ok::<_, String>(name)))
        .method(Method::sync("fail", |(): ()| Err::<Value, _>("backend failure")))
        .serve(listener().await)
        .unwrap()
}

fn backend_of(server: &Server) -> Backend {
    Backend::new("127.0.0.1", server.local_addr().port())
}

async fn raw_call(stream: &mut TcpStream, message_id: u32, method: &str, args: &[Value]) -> Callback {
    stream
        .write_all(&encode_call(message_id, method, args).unwrap())
        .await
        .unwrap();

    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await.unwrap();
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let mut frame = header.to_vec();
    frame.resize(HEADER_SIZE + len, 0);
    stream.read_exact(&mut frame[HEADER_SIZE..]).await.unwrap();
    decode_callback(&frame).unwrap()
}

#[tokio::test]
async fn test_empty_pool_rejected() {
    let result = LoadBalancer::serve(listener().await, Vec::new());
    assert!(matches!(result, Err(RpcError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_relay_matches_direct_call() {
    let server = backend("a").await;
    let balancer = LoadBalancer::serve(listener().await, vec![backend_of(&server)]).unwrap();

    let mut direct = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut relayed = TcpStream::connect(balancer.local_addr()).await.unwrap();

    for (method, args) in [
        ("add", vec![json!(2), json!(3)]),
        ("fail", vec![]),
        ("missing", vec![]),
    ] {
        let expected = raw_call(&mut direct, 4242, method, &args).await;
        let actual = raw_call(&mut relayed, 4242, method, &args).await;
        assert_eq!(actual, expected, "{method}");
    }
}

#[tokio::test]
async fn test_relay_keeps_caller_message_id() {
    let server = backend("a").await;
    let balancer = LoadBalancer::serve(listener().await, vec![backend_of(&server)]).unwrap();
    let mut stream = TcpStream::connect(balancer.local_addr()).await.unwrap();

    // The balancer's own backend ids start at 0; the caller's do not.
    let callback = raw_call(&mut stream, 900_001, "add", &[json!(1), json!(1)]).await;
    assert_eq!(callback, Callback::ok(900_001, json!(2)));

    let callback = raw_call(&mut stream, 7, "missing", &[]).await;
    assert_eq!(callback, Callback::err(7, NO_SUCH_METHOD));
}

#[tokio::test]
async fn test_local_methods_take_precedence() {
    let server = backend("backend").await;
    let balancer = LoadBalancer::builder()
        .backend(backend_of(&server))
        .method(Method::sync("whoami", |(): ()| Ok::<_, String>("balancer")))
        .serve(listener().await)
        .unwrap();
    let client = Client::connect(balancer.local_addr()).await.unwrap();

    assert_eq!(client.call("whoami", vec![]).await.unwrap(), json!("balancer"));
    assert_eq!(client.call("add", vec![json!(2), json!(2)]).await.unwrap(), json!(4));

    // Deleting the local method exposes the backend's.
    balancer.registry().delete("whoami");
    assert_eq!(client.call("whoami", vec![]).await.unwrap(), json!("backend"));
}

#[tokio::test]
async fn test_round_robin_across_backends() {
    let a = backend("a").await;
    let b = backend("b").await;
    let balancer = LoadBalancer::serve(listener().await, vec![backend_of(&a), backend_of(&b)]).unwrap();
    assert_eq!(balancer.backends().len(), 2);
    let client = Client::connect(balancer.local_addr()).await.unwrap();

    let mut answers = Vec::new();
    for _ in 0..4 {
        answers.push(client.call("whoami", vec![]).await.unwrap());
    }

    assert_eq!(answers, vec![json!("a"), json!("b"), json!("a"), json!("b")]);
}

#[tokio::test]
async fn test_backend_down_becomes_error() {
    let server = backend("a").await;
    let balancer = LoadBalancer::serve(listener().await, vec![backend_of(&server)]).unwrap();
    let client = Client::connect(balancer.local_addr()).await.unwrap();
    assert_eq!(client.call("add", vec![json!(1), json!(2)]).await.unwrap(), json!(3));

    server.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client.call("add", vec![json!(1), json!(2)]).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));
    // The caller's own connection to the balancer survives.
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_backend_list_from_json() {
    let server = backend("json").await;
    let json = format!(r#"[{{"host": "127.0.0.1", "port": {}}}]"#, server.local_addr().port());
    let backends = Backend::parse_list(&json).unwrap();

    let balancer = LoadBalancer::serve(listener().await, backends).unwrap();
    let client = Client::connect(balancer.local_addr()).await.unwrap();

    assert_eq!(client.call("whoami", vec![]).await.unwrap(), json!("json"));
}
