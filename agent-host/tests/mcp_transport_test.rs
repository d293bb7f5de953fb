//! MCP transport integration tests: Streamable-HTTP, SSE and WebSocket

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use agent_host::api;
use agent_host::connection::ConnectionStrategy;
use agent_host::demo::DemoAgent;
use agent_host::host::{AgentHost, HostConfig};

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

struct TestServer {
    addr: SocketAddr,
    _temp_dir: tempfile::TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_test_server() -> TestServer {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let host = AgentHost::new(
        DemoAgent::class(1, ConnectionStrategy::Hibernating),
        HostConfig {
            data_dir: temp_dir.path().to_path_buf(),
            in_memory: false,
            idle_timeout: Duration::from_secs(300),
        },
    )
    .await
    .expect("Failed to create agent host");

    let api_state = api::ApiState {
        host,
        max_body_bytes: 16 * 1024,
    };
    let app: Router = api::router().with_state(api_state);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("Server failed");
    });

    TestServer {
        addr,
        _temp_dir: temp_dir,
        handle,
    }
}

fn initialize(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "0.0.1"}
        }
    })
}

/// JSON payloads of every `data:` line in an SSE body
fn sse_data(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str(data.trim()).ok())
        .collect()
}

async fn post_mcp(
    client: &reqwest::Client,
    addr: SocketAddr,
    session: Option<&str>,
    body: Value,
) -> reqwest::Response {
    let mut request = client
        .post(format!("http://{addr}/mcp"))
        .header("accept", ACCEPT_BOTH)
        .header("content-type", "application/json")
        .body(body.to_string());
    if let Some(session) = session {
        request = request.header("mcp-session-id", session);
    }
    timeout(Duration::from_secs(5), request.send())
        .await
        .expect("Timeout")
        .expect("Request failed")
}

async fn error_code(response: reqwest::Response) -> i64 {
    let body: Value = response.json().await.expect("Invalid JSON");
    body["error"]["code"].as_i64().expect("Missing error code")
}

/// Initialize a Streamable-HTTP session and return its id
async fn open_session(client: &reqwest::Client, addr: SocketAddr) -> String {
    let response = post_mcp(client, addr, None, initialize(1)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let session = response
        .headers()
        .get("mcp-session-id")
        .expect("Missing session header")
        .to_str()
        .unwrap()
        .to_string();
    let body = timeout(Duration::from_secs(5), response.text())
        .await
        .expect("Stream did not close")
        .unwrap();
    let replies = sse_data(&body);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], 1);
    assert_eq!(replies[0]["result"]["protocolVersion"], "2025-03-26");

    let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    let response = post_mcp(client, addr, Some(&session), initialized).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    session
}

#[tokio::test]
async fn test_streamable_round_trip() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let session = open_session(&client, server.addr).await;

    let batch = json!([
        {"jsonrpc": "2.0", "id": "list", "method": "tools/list"},
        {
            "jsonrpc": "2.0",
            "id": "add",
            "method": "tools/call",
            "params": {"name": "add", "arguments": {"a": 2, "b": 3}}
        }
    ]);
    let response = post_mcp(&client, server.addr, Some(&session), batch).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("mcp-session-id").unwrap(),
        session.as_str()
    );

    // The stream ends once both requests are answered
    let body = timeout(Duration::from_secs(5), response.text())
        .await
        .expect("Stream did not close")
        .unwrap();
    let replies = sse_data(&body);
    assert_eq!(replies.len(), 2);

    let list = replies.iter().find(|r| r["id"] == "list").unwrap();
    let names: Vec<&str> = list["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|tool| tool["name"].as_str())
        .collect();
    assert!(names.contains(&"add"));
    assert!(names.contains(&"increment"));

    let add = replies.iter().find(|r| r["id"] == "add").unwrap();
    assert!(add["result"]["isError"].is_null());
    assert_eq!(add["result"]["content"][0]["type"], "text");
}

#[tokio::test]
async fn test_streamable_rejects_two_initializations() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();

    let response = post_mcp(
        &client,
        server.addr,
        None,
        json!([initialize(1), initialize(2)]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, -32600);
}

#[tokio::test]
async fn test_streamable_rejects_initialize_with_session() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();

    let response = post_mcp(&client, server.addr, Some("abc"), initialize(1)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, -32600);
}

#[tokio::test]
async fn test_streamable_requires_session_header() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();

    let response = post_mcp(
        &client,
        server.addr,
        None,
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, -32000);
}

#[tokio::test]
async fn test_streamable_unknown_session_is_not_found() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();

    let response = post_mcp(
        &client,
        server.addr,
        Some("no-such-session"),
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, -32001);
}

#[tokio::test]
async fn test_streamable_content_negotiation() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/mcp", server.addr);

    let response = client
        .post(&url)
        .header("accept", "application/json")
        .header("content-type", "application/json")
        .body(initialize(1).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);

    let response = client
        .post(&url)
        .header("accept", ACCEPT_BOTH)
        .header("content-type", "text/plain")
        .body(initialize(1).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = client
        .post(&url)
        .header("accept", ACCEPT_BOTH)
        .header("content-type", "application/json")
        .body("x".repeat(32 * 1024))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let response = client
        .post(&url)
        .header("accept", ACCEPT_BOTH)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, -32700);

    let response = client
        .post(&url)
        .header("accept", ACCEPT_BOTH)
        .header("content-type", "application/json")
        .body(json!({"jsonrpc": "1.0", "id": 1, "method": "x"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, -32600);
}

#[tokio::test]
async fn test_streamable_delete_terminates_session() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let session = open_session(&client, server.addr).await;

    let response = client
        .delete(format!("http://{}/mcp", server.addr))
        .header("mcp-session-id", &session)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = post_mcp(
        &client,
        server.addr,
        Some(&session),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sse_first_event_is_endpoint() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();

    let mut stream = client
        .get(format!("http://{}/sse", server.addr))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(stream.status(), StatusCode::OK);

    let mut buffer = String::new();
    while !buffer.contains("\n\n") {
        let chunk = timeout(Duration::from_secs(5), stream.chunk())
            .await
            .expect("Timeout waiting for endpoint")
            .expect("Stream failed")
            .expect("Stream ended");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
    let mut lines = buffer.lines();
    let first = lines.next().expect("Empty stream");
    assert_eq!(first.replace(' ', ""), "event:endpoint");

    let endpoint = lines
        .next()
        .and_then(|line| line.strip_prefix("data:"))
        .expect("Missing endpoint data")
        .trim()
        .to_string();
    assert!(endpoint.starts_with("/sse/message?sessionId="));

    let response = client
        .post(format!("http://{}{endpoint}", server.addr))
        .header("content-type", "application/json")
        .body(initialize(9).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let mut reply = None;
    while reply.is_none() {
        let chunk = timeout(Duration::from_secs(5), stream.chunk())
            .await
            .expect("Timeout waiting for reply")
            .expect("Stream failed")
            .expect("Stream ended");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        reply = sse_data(&buffer).into_iter().find(|v| v["id"] == 9);
    }
    let reply = reply.unwrap();
    assert_eq!(reply["result"]["serverInfo"]["name"], "demo-agent");
}

#[tokio::test]
async fn test_sse_message_for_unknown_session_is_not_found() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!(
            "http://{}/sse/message?sessionId=missing",
            server.addr
        ))
        .header("content-type", "application/json")
        .body(initialize(1).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_mcp_over_websocket() {
    let server = start_test_server().await;

    let (mut ws, _) = connect_async(format!("ws://{}/mcp?sessionId=ws-test", server.addr))
        .await
        .expect("Failed to connect");

    ws.send(Message::Text(initialize(1).to_string()))
        .await
        .expect("Send error");
    ws.send(Message::Text(
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "increment", "arguments": {"by": 4}}
        })
        .to_string(),
    ))
    .await
    .expect("Send error");

    let mut seen_notification = false;
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timeout")
            .expect("Stream ended")
            .expect("Frame error");
        let Message::Text(text) = frame else {
            continue;
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        if value["method"] == "notifications/message" {
            seen_notification = true;
        }
        if value["id"] == 2 {
            assert_eq!(value["result"]["content"][0]["type"], "text");
            break;
        }
    }
    // Notifications are delivered on WebSocket sessions
    assert!(seen_notification);

    ws.send(Message::Text("{not json".to_string()))
        .await
        .expect("Send error");
    let frame = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("Timeout")
        .expect("Stream ended")
        .expect("Frame error");
    let Message::Text(text) = frame else {
        panic!("expected a text frame");
    };
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["error"]["code"], -32700);
}
