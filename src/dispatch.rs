//! WebSocket dispatch to analysis workers.
//!
//! Workers speak a one-shot protocol: connect to
//! `ws(s)://<endpoint>/<serviceType>`, send the request as a single JSON text
//! frame, read JSON frames until the response arrives. Every dispatch carries
//! a bounded timeout; expiry is indistinguishable from a worker failure as
//! far as the caller's bookkeeping is concerned.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::errors::DispatchError;
use crate::models::ServiceType;
use crate::pool::Probe;
use crate::protocol::{WorkerRequest, WorkerResponse};

/// One round trip to a remote worker.
#[async_trait]
pub trait AnalysisTransport: Send + Sync {
    async fn dispatch(
        &self,
        url: &str,
        service: ServiceType,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, DispatchError>;
}

/// Production transport over `tokio-tungstenite`.
pub struct WsTransport {
    dispatch_timeout: Duration,
    probe_timeout: Duration,
}

impl WsTransport {
    pub fn new(dispatch_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            dispatch_timeout,
            probe_timeout,
        }
    }

    fn service_url(base: &str, service: ServiceType) -> String {
        format!("{}/{}", base.trim_end_matches('/'), service.as_str())
    }

    async fn round_trip(
        url: &str,
        service: ServiceType,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, DispatchError> {
        let payload = serde_json::to_string(request).map_err(|e| DispatchError::Protocol {
            message: format!("request serialization: {}", e),
        })?;

        let (mut stream, _) = connect_async(url).await.map_err(|e| DispatchError::Remote {
            service,
            message: format!("connect {}: {}", url, e),
        })?;

        stream
            .send(Message::Text(payload))
            .await
            .map_err(|e| DispatchError::Remote {
                service,
                message: format!("send: {}", e),
            })?;

        while let Some(frame) = stream.next().await {
            let frame = frame.map_err(|e| DispatchError::Remote {
                service,
                message: format!("recv: {}", e),
            })?;
            match frame {
                Message::Text(text) => {
                    return serde_json::from_str(&text).map_err(|e| DispatchError::Protocol {
                        message: format!("response parse: {}", e),
                    });
                }
                Message::Close(_) => break,
                // Control and binary frames are not part of the contract.
                _ => continue,
            }
        }

        Err(DispatchError::Remote {
            service,
            message: "connection closed before response".to_string(),
        })
    }
}

#[async_trait]
impl AnalysisTransport for WsTransport {
    async fn dispatch(
        &self,
        url: &str,
        service: ServiceType,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, DispatchError> {
        let full_url = Self::service_url(url, service);
        debug!(service = %service, url = %full_url, "dispatching analysis request");
        match tokio::time::timeout(
            self.dispatch_timeout,
            Self::round_trip(&full_url, service, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout {
                service,
                seconds: self.dispatch_timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl Probe for WsTransport {
    async fn probe(&self, url: &str, service: ServiceType) -> bool {
        let full_url = Self::service_url(url, service);
        let connected =
            tokio::time::timeout(self.probe_timeout, connect_async(&full_url)).await;
        match connected {
            Ok(Ok((mut stream, _))) => {
                let _ = stream.close(None).await;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_url_joins_path_segment() {
        assert_eq!(
            WsTransport::service_url("ws://worker:8100", ServiceType::StaticAnalysis),
            "ws://worker:8100/static_analysis"
        );
        assert_eq!(
            WsTransport::service_url("ws://worker:8100/", ServiceType::AiReview),
            "ws://worker:8100/ai_review"
        );
    }

    #[tokio::test]
    async fn test_dispatch_to_unreachable_endpoint_is_remote_error() {
        // Port 9 (discard) is not listening in the test environment.
        let transport = WsTransport::new(Duration::from_secs(1), Duration::from_millis(200));
        let request = WorkerRequest {
            target_model: "m".into(),
            target_app_number: 1,
            tools: vec![],
        };
        let err = transport
            .dispatch("ws://127.0.0.1:9", ServiceType::Performance, &request)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Remote { .. } | DispatchError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_probe_unreachable_endpoint_is_false() {
        let transport = WsTransport::new(Duration::from_secs(1), Duration::from_millis(200));
        assert!(
            !transport
                .probe("ws://127.0.0.1:9", ServiceType::Performance)
                .await
        );
    }
}
