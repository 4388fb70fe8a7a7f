//! Client side of the agent RPC façade.
//!
//! A thin typed wrapper used by drivers (and the supervisor) to operate a
//! remote agent over any duplex byte stream.

use super::{
    ListAllRequest, ListAllResponse, RequestEnvelope, ResponseEnvelope, RpcError,
    StartProcessRequest, StartProcessResponse, StopProcessRequest, StopProcessResponse,
    METHOD_LIST_ALL, METHOD_START_PROCESS, METHOD_STOP_PROCESS,
};
use crate::backend::{ProcessId, ProgramId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};

/// Operates a remote agent over a bidirectional stream.
pub struct AgentClient<S> {
    lines: Lines<BufReader<ReadHalf<S>>>,
    writer: WriteHalf<S>,
}

impl<S> AgentClient<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Starts a process of the named program on the remote agent.
    pub async fn start_process(&mut self, program_name: &str) -> Result<ProcessId, RpcError> {
        let response: StartProcessResponse = self
            .call(
                METHOD_START_PROCESS,
                &StartProcessRequest {
                    program_name: program_name.to_string(),
                },
            )
            .await?;
        Ok(response.process_id)
    }

    /// Stops a process on the remote agent with the given drain timeout.
    pub async fn stop_process(
        &mut self,
        process_id: &ProcessId,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let _: StopProcessResponse = self
            .call(
                METHOD_STOP_PROCESS,
                &StopProcessRequest {
                    process_id: process_id.clone(),
                    timeout,
                },
            )
            .await?;
        Ok(())
    }

    /// Lists every program and its processes on the remote agent.
    pub async fn list_all(&mut self) -> Result<HashMap<ProgramId, Vec<ProcessId>>, RpcError> {
        let response: ListAllResponse = self.call(METHOD_LIST_ALL, &ListAllRequest {}).await?;
        Ok(response.running)
    }

    async fn call<Req, Res>(&mut self, method: &str, request: &Req) -> Result<Res, RpcError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let envelope = RequestEnvelope {
            method_name: method.to_string(),
            request: serde_json::to_value(request).map_err(RpcError::Encode)?,
        };
        let mut line = serde_json::to_vec(&envelope).map_err(RpcError::Encode)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(RpcError::Write)?;
        self.writer.flush().await.map_err(RpcError::Write)?;

        let Some(reply) = self.lines.next_line().await.map_err(RpcError::Read)? else {
            return Err(RpcError::ConnectionClosed);
        };
        let envelope: ResponseEnvelope =
            serde_json::from_str(&reply).map_err(RpcError::Decode)?;
        if !envelope.error.is_empty() {
            return Err(RpcError::Remote(envelope.error));
        }
        serde_json::from_value(envelope.response).map_err(RpcError::Decode)
    }
}
