//! Upstream reachability checks.

use crate::transport::TransportFactory;
use async_trait::async_trait;
use edgefed_types::{Principal, ServiceEndpointType};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Answers whether an upstream service can be reached right now.
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn is_available(&self, service: ServiceEndpointType) -> bool;
}

/// Probes by sending PING to the service endpoint.
///
/// Each probe waits at most [`PROBE_TIMEOUT`](crate::transport::PROBE_TIMEOUT).
pub struct HttpAvailabilityProbe {
    factory: Arc<TransportFactory>,
}

impl HttpAvailabilityProbe {
    pub fn new(factory: Arc<TransportFactory>) -> Self {
        Self { factory }
    }

    /// Round-trip time of a PING, or `None` when unconfigured or unreachable.
    pub async fn latency(&self, service: ServiceEndpointType) -> Option<Duration> {
        if !self.factory.is_configured(service) {
            return None;
        }
        let descriptor = self.factory.config().endpoint(service)?;
        // Probes carry no credentials.
        let transport = match self.factory.for_descriptor(&descriptor, Principal::anonymous()) {
            Ok(t) => t,
            Err(e) => {
                debug!("Cannot probe {}: {}", service, e);
                return None;
            }
        };
        match transport.ping().await {
            Ok(elapsed) => Some(elapsed),
            Err(e) => {
                debug!("{} unreachable: {}", service, e);
                None
            }
        }
    }
}

#[async_trait]
impl AvailabilityProbe for HttpAvailabilityProbe {
    async fn is_available(&self, service: ServiceEndpointType) -> bool {
        self.latency(service).await.is_some()
    }
}
