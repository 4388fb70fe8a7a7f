//! Integration tests for the RPC façade.
//!
//! Drives the server over an in-memory duplex stream, both through the
//! typed client and with raw wire messages, and checks that agent error
//! semantics survive the boundary.

use procwarden::agent::Agent;
use procwarden::backend::{Backend, FakeBackend};
use procwarden::rpc::{AgentClient, AgentServer, RpcError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

fn serve_agent(backend: FakeBackend) -> (DuplexStream, JoinHandle<()>) {
    let agent = Arc::new(Agent::new(backend));
    let server = AgentServer::new(agent);
    let (client_side, server_side) = tokio::io::duplex(8192);
    let task = tokio::spawn(async move {
        let _ = server.serve(server_side).await;
    });
    (client_side, task)
}

#[tokio::test]
async fn test_start_stop_round_trip() {
    let backend = FakeBackend::new();
    let (stream, task) = serve_agent(backend.clone());
    let mut client = AgentClient::new(stream);

    let process_id = client.start_process("echoer v1").await.unwrap();
    assert!(process_id.as_str().starts_with("fake.process."));
    assert!(backend.is_running(&process_id));

    let running = client.list_all().await.unwrap();
    let program_id = backend.program_id("echoer v1");
    assert_eq!(running[&program_id], vec![process_id.clone()]);

    client
        .stop_process(&process_id, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(client.list_all().await.unwrap().is_empty());

    drop(client);
    task.await.unwrap();
}

#[tokio::test]
async fn test_remote_errors_surface_as_error_strings() {
    let backend = FakeBackend::new();
    let (stream, task) = serve_agent(backend.clone());
    let mut client = AgentClient::new(stream);

    let program_id = backend.program_id("flaky");
    backend.fail_next_pull(&program_id);

    let err = client.start_process("flaky").await.unwrap_err();
    match err {
        RpcError::Remote(message) => {
            assert!(message.contains("pulling program"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    // The connection survives a method failure.
    assert!(client.list_all().await.unwrap().is_empty());

    drop(client);
    task.await.unwrap();
}

#[tokio::test]
async fn test_raw_wire_round_trip() {
    let backend = FakeBackend::new();
    let (stream, task) = serve_agent(backend.clone());
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    // Start a process with a hand-written request envelope.
    write
        .write_all(
            b"{\"method_name\":\"rpc/agent.StartProcess\",\"request\":{\"program_name\":\"echoer v1\"}}\n",
        )
        .await
        .unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(envelope["error"], "");
    let process_id = envelope["response"]["process_id"].as_str().unwrap().to_string();
    assert!(process_id.starts_with("fake.process."));

    // Stop it with a one-second timeout in nanoseconds.
    let request = format!(
        "{{\"method_name\":\"rpc/agent.StopProcess\",\"request\":{{\"process_id\":\"{process_id}\",\"timeout\":1000000000}}}}\n"
    );
    write.write_all(request.as_bytes()).await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(envelope["error"], "");
    assert_eq!(envelope["response"], serde_json::json!({}));

    // The listing is empty again.
    write
        .write_all(b"{\"method_name\":\"rpc/agent.ListAll\",\"request\":{}}\n")
        .await
        .unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(envelope["error"], "");
    assert_eq!(envelope["response"]["Running"], serde_json::json!({}));

    drop(write);
    drop(lines);
    task.await.unwrap();
}

#[tokio::test]
async fn test_connections_are_independent() {
    let backend = FakeBackend::new();
    let agent = Arc::new(Agent::new(backend.clone()));
    let server = Arc::new(AgentServer::new(agent));

    let (first_stream, first_side) = tokio::io::duplex(8192);
    let (second_stream, second_side) = tokio::io::duplex(8192);
    let first_server = Arc::clone(&server);
    let first_task = tokio::spawn(async move {
        let _ = first_server.serve(first_side).await;
    });
    let second_task = tokio::spawn(async move {
        let _ = server.serve(second_side).await;
    });

    let mut first = AgentClient::new(first_stream);
    let mut second = AgentClient::new(second_stream);

    let started = first.start_process("echoer v1").await.unwrap();
    let seen = second.list_all().await.unwrap();
    assert_eq!(seen.values().flatten().count(), 1);
    second
        .stop_process(&started, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(first.list_all().await.unwrap().is_empty());

    drop(first);
    drop(second);
    first_task.await.unwrap();
    second_task.await.unwrap();
}
