use std::sync::Arc;

use courier_proto::ConnectionStatus;
use tracing::debug;

use crate::{
    config::{Indicator, SelectorCatalog},
    surface::{AutomationSurface, SurfaceError},
};

/// Classifies the surface. First match wins: chat surface, loading indicator,
/// high-confidence authentication prompt, otherwise unknown. Generic login hints are
/// never consulted because they also appear on authenticated pages.
#[derive(Debug, Clone)]
pub struct StatusDetector {
    catalog: Arc<SelectorCatalog>,
}

impl StatusDetector {
    pub fn new(catalog: Arc<SelectorCatalog>) -> Self {
        Self { catalog }
    }

    pub async fn detect<S: AutomationSurface + ?Sized>(&self, surface: &S) -> ConnectionStatus {
        if !surface.is_alive().await {
            return ConnectionStatus::Disconnected;
        }
        match self.classify(surface).await {
            Ok(status) => status,
            Err(SurfaceError::Closed) => ConnectionStatus::Disconnected,
            Err(err) => {
                debug!(target: "courier.agent", error = %err, "status probe failed");
                ConnectionStatus::Unknown
            }
        }
    }

    async fn classify<S: AutomationSurface + ?Sized>(
        &self,
        surface: &S,
    ) -> Result<ConnectionStatus, SurfaceError> {
        let ordered = [
            (Indicator::ChatReady, ConnectionStatus::Connected),
            (Indicator::Loading, ConnectionStatus::Loading),
            (Indicator::QrHighConfidence, ConnectionStatus::QrPending),
        ];
        for (indicator, status) in ordered {
            let selectors = self.catalog.selectors(indicator);
            if !selectors.is_empty() && surface.probe(selectors).await? {
                return Ok(status);
            }
        }
        Ok(ConnectionStatus::Unknown)
    }
}
