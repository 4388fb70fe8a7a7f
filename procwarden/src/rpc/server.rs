//! Server side of the agent RPC façade.
//!
//! One [`AgentServer`] services one agent; `serve` runs the per-connection
//! request loop and is spawned once per accepted connection. The set of
//! exposed methods is a fixed dispatch table built at construction.

use super::{
    ListAllResponse, RequestEnvelope, ResponseEnvelope, RpcError, StartProcessRequest,
    StartProcessResponse, StopProcessRequest, StopProcessResponse, METHOD_LIST_ALL,
    METHOD_START_PROCESS, METHOD_STOP_PROCESS,
};
use crate::agent::Agent;
use crate::backend::Backend;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// The fixed set of methods the façade exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Method {
    StartProcess,
    StopProcess,
    ListAll,
}

enum DispatchError {
    /// The request payload did not decode; the connection is dropped after
    /// reporting it.
    Malformed(serde_json::Error),
    /// The method itself failed; reported, connection stays up.
    Failed(String),
}

/// Exposes an agent's operations over bidirectional framed streams.
pub struct AgentServer<B: Backend> {
    agent: Arc<Agent<B>>,
    methods: HashMap<&'static str, Method>,
}

impl<B: Backend> AgentServer<B> {
    pub fn new(agent: Arc<Agent<B>>) -> Self {
        let mut methods = HashMap::new();
        methods.insert(METHOD_START_PROCESS, Method::StartProcess);
        methods.insert(METHOD_STOP_PROCESS, Method::StopProcess);
        methods.insert(METHOD_LIST_ALL, Method::ListAll);
        Self { agent, methods }
    }

    /// Services one connection in arrival order until it closes, an
    /// unsupported method or malformed payload arrives, or transport I/O
    /// fails.
    pub async fn serve<S>(&self, stream: S) -> Result<(), RpcError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        loop {
            let Some(line) = lines.next_line().await.map_err(RpcError::Read)? else {
                debug!("connection closed by peer");
                return Ok(());
            };
            if line.trim().is_empty() {
                continue;
            }

            let envelope: RequestEnvelope = match serde_json::from_str(&line) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(error = %error, "dropping connection on malformed request");
                    send(&mut writer, &ResponseEnvelope::failure(error.to_string())).await?;
                    return Ok(());
                }
            };

            let Some(method) = self.methods.get(envelope.method_name.as_str()).copied() else {
                warn!(method = %envelope.method_name, "unsupported method");
                send(&mut writer, &ResponseEnvelope::failure("unsupported method")).await?;
                return Ok(());
            };

            match self.dispatch(method, envelope.request).await {
                Ok(response) => {
                    send(&mut writer, &ResponseEnvelope::success(response)).await?;
                }
                Err(DispatchError::Failed(message)) => {
                    send(&mut writer, &ResponseEnvelope::failure(message)).await?;
                }
                Err(DispatchError::Malformed(error)) => {
                    warn!(error = %error, "dropping connection on malformed payload");
                    send(&mut writer, &ResponseEnvelope::failure(error.to_string())).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(
        &self,
        method: Method,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, DispatchError> {
        match method {
            Method::StartProcess => {
                let request: StartProcessRequest =
                    serde_json::from_value(request).map_err(DispatchError::Malformed)?;
                let program_id = self.agent.backend().program_id(&request.program_name);
                let process_id = self
                    .agent
                    .start_process(&program_id)
                    .await
                    .map_err(|error| DispatchError::Failed(error.to_string()))?;
                encode(StartProcessResponse { process_id })
            }
            Method::StopProcess => {
                let request: StopProcessRequest =
                    serde_json::from_value(request).map_err(DispatchError::Malformed)?;
                let timeout = Duration::from_nanos(request.timeout);
                self.agent
                    .stop_process(&request.process_id, timeout)
                    .await
                    .map_err(|error| DispatchError::Failed(error.to_string()))?;
                encode(StopProcessResponse {})
            }
            Method::ListAll => {
                let running = self.agent.list_all().await;
                encode(ListAllResponse { running })
            }
        }
    }
}

fn encode<T: serde::Serialize>(response: T) -> Result<serde_json::Value, DispatchError> {
    serde_json::to_value(response).map_err(|error| DispatchError::Failed(error.to_string()))
}

async fn send<W>(writer: &mut W, envelope: &ResponseEnvelope) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(envelope).map_err(RpcError::Encode)?;
    line.push(b'\n');
    writer.write_all(&line).await.map_err(RpcError::Write)?;
    writer.flush().await.map_err(RpcError::Write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeBackend;
    use tokio::io::AsyncReadExt;

    async fn serve_one_line(line: &str) -> String {
        let backend = FakeBackend::new();
        let agent = Arc::new(Agent::new(backend));
        let server = AgentServer::new(agent);

        let (client_side, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let _ = server.serve(server_side).await;
        });

        let (mut read, mut write) = tokio::io::split(client_side);
        write.write_all(line.as_bytes()).await.unwrap();
        write.write_all(b"\n").await.unwrap();
        drop(write);

        let mut reply = String::new();
        read.read_to_string(&mut reply).await.unwrap();
        task.await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_unsupported_method_reports_and_closes() {
        let reply = serve_one_line(r#"{"method_name":"rpc/agent.Nope","request":{}}"#).await;
        assert!(reply.contains(r#""error":"unsupported method""#));
    }

    #[tokio::test]
    async fn test_malformed_request_reports_and_closes() {
        let reply = serve_one_line("this is not json").await;
        let envelope: ResponseEnvelope = serde_json::from_str(reply.trim()).unwrap();
        assert!(!envelope.error.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_reports_and_closes() {
        let reply = serve_one_line(
            r#"{"method_name":"rpc/agent.StopProcess","request":{"process_id":42}}"#,
        )
        .await;
        let envelope: ResponseEnvelope = serde_json::from_str(reply.trim()).unwrap();
        assert!(!envelope.error.is_empty());
    }

    #[tokio::test]
    async fn test_method_failure_keeps_connection_open() {
        let backend = FakeBackend::new();
        let agent = Arc::new(Agent::new(backend));
        let server = AgentServer::new(agent);

        let (client_side, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let _ = server.serve(server_side).await;
        });

        let (read, mut write) = tokio::io::split(client_side);
        let mut lines = BufReader::new(read).lines();

        // Stopping an unknown process fails but does not close the stream.
        let request = r#"{"method_name":"rpc/agent.StopProcess","request":{"process_id":"fake.process.404","timeout":0}}"#;
        write.write_all(request.as_bytes()).await.unwrap();
        write.write_all(b"\n").await.unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        assert!(reply.contains("no such process"));

        // The next request on the same connection still works.
        let request = r#"{"method_name":"rpc/agent.ListAll","request":{}}"#;
        write.write_all(request.as_bytes()).await.unwrap();
        write.write_all(b"\n").await.unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        assert!(reply.contains(r#""error":"""#));

        drop(write);
        drop(lines);
        task.await.unwrap();
    }
}
