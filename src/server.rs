//! Connection server: binds an endpoint and serves the `Feature` capability
//!
//! `ConnectionServer` (unbound) -> `bind` -> `BoundServer` -> `serve`. Serving
//! is terminal; the only way out is process termination.

use crate::config::ConnectionConfig;
use crate::error::{ServeError, ServeResult};
use crate::feature::FeatureCapability;
use crate::metrics::ServingMetrics;
use crate::rpc::codec::{framed, send_message};
use crate::rpc::schema::{self, Bootstrap, Call, CallError, CallResult, Return, UNKNOWN_CALL_ID};
use futures::StreamExt;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// Host that means "every local interface"
pub const WILDCARD_HOST: &str = "0.0.0.0";

/// Back-off after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Parsed `HOST[:PORT]` listen address; `*` stands for all interfaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddress {
    host: Option<String>,
    port: u16,
}

impl BindAddress {
    /// `None` for the wildcard host
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// 0 asks the OS for an ephemeral port
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_wildcard(&self) -> bool {
        self.host.is_none()
    }

    /// Resolve to concrete socket addresses
    pub async fn resolve(&self) -> ServeResult<Vec<SocketAddr>> {
        let host = self.host.as_deref().unwrap_or(WILDCARD_HOST);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, self.port))
            .await
            .map_err(|e| ServeError::bind(self.to_string(), format!("cannot resolve: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(ServeError::bind(self.to_string(), "host resolved to no addresses"));
        }
        Ok(addrs)
    }
}

impl FromStr for BindAddress {
    type Err = ServeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| ServeError::bind(s, reason);
        let text = s.trim();
        if text.is_empty() {
            return Err(malformed("empty address"));
        }

        // [v6]:port or [v6]
        let (host, port) = if let Some(rest) = text.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| malformed("unterminated IPv6 literal"))?;
            let port = match after {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(|| malformed("junk after IPv6 literal"))?),
            };
            (host, port)
        } else {
            match text.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(malformed("IPv6 hosts must be bracketed"))
                }
                Some((host, port)) => (host, Some(port)),
                None => (text, None),
            }
        };

        if host.is_empty() {
            return Err(malformed("empty host"));
        }
        let port = match port {
            None => 0,
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| malformed("port must be a number between 0 and 65535"))?,
        };

        Ok(Self {
            host: (host != "*").then(|| host.to_string()),
            port,
        })
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.as_deref() {
            None => write!(f, "*:{}", self.port),
            Some(h) if h.contains(':') => write!(f, "[{}]:{}", h, self.port),
            Some(h) => write!(f, "{}:{}", h, self.port),
        }
    }
}

/// Unbound server: settings only
pub struct ConnectionServer {
    config: ConnectionConfig,
    metrics: Arc<ServingMetrics>,
}

impl ConnectionServer {
    pub fn new(config: ConnectionConfig, metrics: Arc<ServingMetrics>) -> Self {
        Self { config, metrics }
    }

    /// Bind the listening endpoint
    pub async fn bind(self, address: &BindAddress) -> ServeResult<BoundServer> {
        let addrs = address.resolve().await?;
        let listener = TcpListener::bind(addrs.as_slice())
            .await
            .map_err(|e| ServeError::bind(address.to_string(), e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServeError::bind(address.to_string(), e.to_string()))?;

        info!(address = %address, local_addr = %local_addr, "Server bound");

        Ok(BoundServer {
            listener,
            local_addr,
            config: self.config,
            metrics: self.metrics,
        })
    }
}

/// Server holding a listening socket, ready to serve
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ConnectionConfig,
    metrics: Arc<ServingMetrics>,
}

impl BoundServer {
    /// Address actually bound (resolves an ephemeral port)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publish `capability` as the bootstrap object and serve forever.
    ///
    /// Connections are served one at a time; a new connection is accepted
    /// once the current peer disconnects.
    pub async fn serve(self, capability: Arc<FeatureCapability>) -> Infallible {
        info!(
            local_addr = %self.local_addr,
            model = %capability.backend().name(),
            kind = %capability.backend().kind(),
            "Serving Feature capability"
        );

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            self.metrics.record_session();
            info!(peer = %peer, "Accepted connection");

            match serve_session(stream, capability.clone(), &self.config, &self.metrics).await {
                Ok(calls) => info!(peer = %peer, calls = calls, "Connection closed"),
                Err(e) => warn!(peer = %peer, error = %e, "Connection ended with error"),
            }
        }
    }
}

/// Serve one connection until the peer goes away; returns the number of calls
async fn serve_session(
    stream: TcpStream,
    capability: Arc<FeatureCapability>,
    config: &ConnectionConfig,
    metrics: &Arc<ServingMetrics>,
) -> ServeResult<u64> {
    stream.set_nodelay(true).ok();
    let (mut sink, mut frames) = framed(stream, config.max_frame_bytes).split();

    send_message(&mut sink, &Bootstrap::feature()).await?;

    // single writer; call tasks hand their returns over the channel
    let (tx, mut rx) = mpsc::channel::<Return>(config.max_in_flight.max(1) * 2);
    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            send_message(&mut sink, &reply).await?;
        }
        Ok::<_, ServeError>(())
    });

    let in_flight = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
    let mut calls = 0u64;
    let mut session_result = Ok(());

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                session_result = Err(ServeError::Protocol(format!("read failed: {e}")));
                break;
            }
        };

        let call: Call = match schema::decode(&frame) {
            Ok(call) => call,
            Err(e) => {
                warn!(error = %e, "Undecodable call frame");
                let failure = CallError::from(e);
                metrics.record_failure(failure.kind_label());
                let reply = Return {
                    call_id: UNKNOWN_CALL_ID,
                    result: CallResult::Failed(failure),
                };
                if tx.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
        };

        calls += 1;
        let permit = match in_flight.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let capability = capability.clone();
        let metrics = metrics.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let Call { call_id, method } = call;

            let result = tokio::task::spawn_blocking(move || capability.dispatch(method))
                .await
                .unwrap_or_else(|e| {
                    CallResult::Failed(CallError::BackendPrediction {
                        message: format!("prediction task failed: {e}"),
                    })
                });

            let failure = match &result {
                CallResult::Failed(err) => {
                    debug!(call_id = call_id, error = ?err, "Call failed");
                    Some(err.kind_label())
                }
                CallResult::Value { .. } => None,
            };
            metrics.record_call(start.elapsed(), failure);

            // peer may be gone; nothing left to tell it
            let _ = tx.send(Return { call_id, result }).await;
            drop(permit);
        });
    }

    drop(tx);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => session_result = session_result.and(Err(e)),
        Err(e) => {
            session_result =
                session_result.and(Err(ServeError::Protocol(format!("writer task failed: {e}"))))
        }
    }

    session_result.map(|_| calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::models::{BackendKind, InputScaling, SklearnBackend};
    use crate::rpc::codec::{recv_message, DEFAULT_MAX_FRAME_BYTES};
    use crate::rpc::schema::Method;
    use crate::rpc::FeatureClient;
    use bytes::Bytes;
    use futures::SinkExt;
    use std::io::Write;

    #[test]
    fn test_parse_bind_address() {
        let addr: BindAddress = "*:5000".parse().unwrap();
        assert!(addr.is_wildcard());
        assert_eq!(addr.port(), 5000);

        let addr: BindAddress = "*".parse().unwrap();
        assert!(addr.is_wildcard());
        assert_eq!(addr.port(), 0);

        let addr: BindAddress = "localhost".parse().unwrap();
        assert_eq!(addr.host(), Some("localhost"));
        assert_eq!(addr.port(), 0);

        let addr: BindAddress = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(addr.host(), Some("127.0.0.1"));
        assert_eq!(addr.port(), 8080);

        let addr: BindAddress = "[::1]:9000".parse().unwrap();
        assert_eq!(addr.host(), Some("::1"));
        assert_eq!(addr.to_string(), "[::1]:9000");
    }

    #[test]
    fn test_parse_malformed_addresses() {
        for bad in ["", ":80", "host:port", "host:70000", "::1:80", "[::1", "[::1]x"] {
            assert!(
                matches!(bad.parse::<BindAddress>(), Err(ServeError::Bind { .. })),
                "{bad:?} should not parse"
            );
        }
    }

    fn sklearn_capability() -> (tempfile::NamedTempFile, Arc<FeatureCapability>) {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(
            br#"{"estimator": "LogisticRegression", "coef": [[0.5, -0.25, 0.1, 0.2]], "intercept": [-1.0], "classes": [0, 1]}"#,
        )
        .unwrap();
        let backend = SklearnBackend::load(file.path(), InputScaling::identity()).unwrap();
        (file, Arc::new(FeatureCapability::new(Arc::new(backend))))
    }

    async fn start_server(
        capability: Arc<FeatureCapability>,
    ) -> (SocketAddr, tokio::task::JoinHandle<Infallible>) {
        let config = ServerConfig::default();
        let bound = ConnectionServer::new(config.server, Arc::new(ServingMetrics::new()))
            .bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = bound.local_addr();
        (addr, tokio::spawn(bound.serve(capability)))
    }

    #[tokio::test]
    async fn test_ephemeral_wildcard_bind() {
        let server = ConnectionServer::new(
            ServerConfig::default().server,
            Arc::new(ServingMetrics::new()),
        );
        let bound = server.bind(&"*:0".parse().unwrap()).await.unwrap();
        assert_ne!(bound.local_addr().port(), 0);
        assert!(bound.local_addr().ip().is_unspecified());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = ConnectionServer::new(
            ServerConfig::default().server,
            Arc::new(ServingMetrics::new()),
        );
        let result = server
            .bind(&format!("127.0.0.1:{port}").parse().unwrap())
            .await;
        assert!(matches!(result, Err(ServeError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_compute_feature_end_to_end() {
        let (_artifact, capability) = sklearn_capability();
        assert_eq!(capability.backend().kind(), BackendKind::Sklearn);
        let (addr, handle) = start_server(capability).await;

        let mut client = FeatureClient::connect(addr).await.unwrap();
        assert!(client.bootstrap().is_compatible());

        let first = client.compute_feature(&[1.0, 2.0, 3.0, 4.0]).await.unwrap();
        assert_eq!(first, 1.0);
        // same input, same answer
        let second = client.compute_feature(&[1.0, 2.0, 3.0, 4.0]).await.unwrap();
        assert_eq!(first, second);

        handle.abort();
    }

    #[tokio::test]
    async fn test_dimension_mismatch_keeps_session_alive() {
        let (_artifact, capability) = sklearn_capability();
        let (addr, handle) = start_server(capability).await;
        let mut client = FeatureClient::connect(addr).await.unwrap();

        let err = client.compute_feature(&[1.0, 2.0]).await.unwrap_err();
        assert!(matches!(
            err,
            ServeError::DimensionMismatch { expected: 4, actual: 2 }
        ));
        let err = client.compute_feature(&[]).await.unwrap_err();
        assert!(matches!(err, ServeError::DimensionMismatch { actual: 0, .. }));

        let value = client.compute_feature(&[0.0, 0.0, 0.0, 0.0]).await.unwrap();
        assert_eq!(value, 0.0);

        handle.abort();
    }

    #[tokio::test]
    async fn test_non_finite_features_fail_the_call_only() {
        let (_artifact, capability) = sklearn_capability();
        let (addr, handle) = start_server(capability).await;
        let mut client = FeatureClient::connect(addr).await.unwrap();

        // a binary classifier would otherwise map NaN to its first class
        let err = client.compute_feature(&[f64::NAN; 4]).await.unwrap_err();
        assert!(matches!(err, ServeError::InvalidFeature { index: 0, .. }));
        let err = client
            .compute_feature(&[1.0, 2.0, f64::INFINITY, 4.0])
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::InvalidFeature { index: 2, .. }));

        let value = client.compute_feature(&[1.0, 2.0, 3.0, 4.0]).await.unwrap();
        assert_eq!(value, 1.0);

        handle.abort();
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_failed_reply() {
        let (_artifact, capability) = sklearn_capability();
        let (addr, handle) = start_server(capability).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut transport = framed(stream, DEFAULT_MAX_FRAME_BYTES);
        let bootstrap: Bootstrap = recv_message(&mut transport).await.unwrap().unwrap();
        assert_eq!(bootstrap, Bootstrap::feature());

        transport.send(Bytes::from_static(&[0xff, 0xff, 0xff])).await.unwrap();
        let reply: Return = recv_message(&mut transport).await.unwrap().unwrap();
        assert_eq!(reply.call_id, UNKNOWN_CALL_ID);
        assert!(matches!(
            reply.result,
            CallResult::Failed(CallError::MalformedCall { .. })
        ));

        // a well-formed call on the same connection still works
        let call = Call {
            call_id: 9,
            method: Method::ComputeFeature {
                features: vec![1.0, 2.0, 3.0, 4.0],
            },
        };
        send_message(&mut transport, &call).await.unwrap();
        let reply: Return = recv_message(&mut transport).await.unwrap().unwrap();
        assert_eq!(reply.call_id, 9);
        assert_eq!(reply.result, CallResult::Value { value: 1.0 });

        handle.abort();
    }

    #[tokio::test]
    async fn test_next_connection_served_after_disconnect() {
        let (_artifact, capability) = sklearn_capability();
        let (addr, handle) = start_server(capability).await;

        {
            let mut client = FeatureClient::connect(addr).await.unwrap();
            client.compute_feature(&[1.0, 2.0, 3.0, 4.0]).await.unwrap();
        }

        let mut client = FeatureClient::connect(addr).await.unwrap();
        assert_eq!(client.compute_feature(&[1.0, 2.0, 3.0, 4.0]).await.unwrap(), 1.0);

        handle.abort();
    }

    #[tokio::test]
    async fn test_pipelined_calls_are_matched_by_id() {
        let (_artifact, capability) = sklearn_capability();
        let (addr, handle) = start_server(capability).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut transport = framed(stream, DEFAULT_MAX_FRAME_BYTES);
        let _: Option<Bootstrap> = recv_message(&mut transport).await.unwrap();

        let inputs = [[1.0, 2.0, 3.0, 4.0], [0.0, 0.0, 0.0, 0.0]];
        for (i, features) in inputs.iter().enumerate() {
            let call = Call {
                call_id: i as u64 + 1,
                method: Method::ComputeFeature {
                    features: features.to_vec(),
                },
            };
            send_message(&mut transport, &call).await.unwrap();
        }

        let mut replies = Vec::new();
        for _ in 0..inputs.len() {
            let reply: Return = recv_message(&mut transport).await.unwrap().unwrap();
            replies.push(reply);
        }
        replies.sort_by_key(|r| r.call_id);
        assert_eq!(replies[0].result, CallResult::Value { value: 1.0 });
        assert_eq!(replies[1].result, CallResult::Value { value: 0.0 });

        handle.abort();
    }
}
