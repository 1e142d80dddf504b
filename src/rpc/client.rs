//! Client side of a two-party `Feature` connection

use super::codec::{framed, recv_message, send_message, DEFAULT_MAX_FRAME_BYTES};
use super::schema::{Bootstrap, Call, CallResult, Method, Return, UNKNOWN_CALL_ID};
use crate::error::{ServeError, ServeResult};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

/// Holds the remote `Feature` bootstrap object of one connection
pub struct FeatureClient {
    transport: Framed<TcpStream, LengthDelimitedCodec>,
    bootstrap: Bootstrap,
    next_call_id: u64,
}

impl FeatureClient {
    /// Connect and receive the server's bootstrap object
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> ServeResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ServeError::Protocol(format!("connect failed: {e}")))?;
        stream.set_nodelay(true).ok();

        let mut transport = framed(stream, DEFAULT_MAX_FRAME_BYTES);
        let bootstrap: Bootstrap = recv_message(&mut transport)
            .await?
            .ok_or_else(|| ServeError::Protocol("closed before bootstrap".to_string()))?;
        if !bootstrap.is_compatible() {
            return Err(ServeError::Protocol(format!(
                "server offers {} v{}",
                bootstrap.interface, bootstrap.schema_version
            )));
        }

        Ok(Self {
            transport,
            bootstrap,
            next_call_id: 1,
        })
    }

    pub fn bootstrap(&self) -> &Bootstrap {
        &self.bootstrap
    }

    /// Invoke `computeFeature` and wait for its result
    pub async fn compute_feature(&mut self, features: &[f64]) -> ServeResult<f64> {
        let call_id = self.next_call_id;
        self.next_call_id += 1;

        let call = Call {
            call_id,
            method: Method::ComputeFeature {
                features: features.to_vec(),
            },
        };
        send_message(&mut self.transport, &call).await?;

        loop {
            let reply: Return = recv_message(&mut self.transport)
                .await?
                .ok_or_else(|| ServeError::Protocol("connection closed".to_string()))?;

            if reply.call_id == call_id {
                return match reply.result {
                    CallResult::Value { value } => Ok(value),
                    CallResult::Failed(err) => Err(err.into()),
                };
            }
            if reply.call_id == UNKNOWN_CALL_ID {
                if let CallResult::Failed(err) = reply.result {
                    return Err(err.into());
                }
            }
            debug!(call_id = reply.call_id, "Ignoring reply for another call");
        }
    }
}
