//! Hub context: explicit construction and wiring of the job engine.
//!
//! All process-wide state (session token, panel registry, progress store,
//! subscriber multiplexer) lives on an explicitly constructed [`Hub`]
//! rather than in ambient globals, so tests can run several independent
//! instances side by side.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::HubConfig;
use crate::discovery::DiscoveryEngine;
use crate::executor::ActionExecutor;
use crate::ops::DeviceOps;
use crate::progress::ProgressStore;
use crate::registry::PanelRegistry;
use crate::subscribers::SubscriberMux;

/// The assembled job engine.
///
/// Owns every component and the process session token. Constructed once in
/// `main` (or per test) and shared behind an `Arc` with whatever transport
/// is attached.
pub struct Hub {
    session_token: String,
    registry: Arc<PanelRegistry>,
    store: Arc<ProgressStore>,
    subscribers: Arc<SubscriberMux>,
    discovery: DiscoveryEngine,
    executor: ActionExecutor,
}

impl Hub {
    /// Builds a hub from configuration and a device-operation layer.
    ///
    /// Mints the session token as a side effect; the token is fixed for the
    /// life of this instance.
    pub fn new(config: HubConfig, ops: Arc<dyn DeviceOps>) -> Self {
        let session_token = Uuid::new_v4().to_string();
        let registry = Arc::new(PanelRegistry::new());
        let store = Arc::new(ProgressStore::new(config.executor.terminal_retention));
        let subscribers = Arc::new(SubscriberMux::new());

        let discovery = DiscoveryEngine::new(
            Arc::clone(&ops),
            Arc::clone(&registry),
            Arc::clone(&store),
            config.discovery.clone(),
        );
        let executor = ActionExecutor::new(
            ops,
            Arc::clone(&store),
            Arc::clone(&subscribers),
            config.executor.clone(),
        );

        info!(session_token = %session_token, "Hub initialized");

        Self {
            session_token,
            registry,
            store,
            subscribers,
            discovery,
            executor,
        }
    }

    /// Process-lifetime session token.
    ///
    /// Clients compare it across requests: a changed token means the daemon
    /// restarted and all in-memory job state was lost.
    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    /// The discovery engine (singleton scan).
    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.discovery
    }

    /// The action executor (many concurrent executions).
    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    /// The panel registry populated by discovery.
    pub fn registry(&self) -> &PanelRegistry {
        &self.registry
    }

    /// The shared progress store.
    pub fn progress_store(&self) -> &ProgressStore {
        &self.store
    }

    /// The per-job listener multiplexer.
    pub fn subscribers(&self) -> &SubscriberMux {
        &self.subscribers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use helio_core::Stage;

    use crate::ops::{IdentifyOutcome, ProbeOutcome, StageError};

    struct InertOps;

    #[async_trait]
    impl DeviceOps for InertOps {
        async fn probe(&self, _address: std::net::Ipv4Addr) -> ProbeOutcome {
            ProbeOutcome::NoResponse
        }

        async fn identify(&self, _address: std::net::Ipv4Addr) -> IdentifyOutcome {
            IdentifyOutcome::NotPanel
        }

        async fn run_stage(&self, _profile_id: i64, _stage: &Stage) -> Result<(), StageError> {
            Ok(())
        }

        async fn halt(
            &self,
            _profile_id: i64,
            _interrupted: Option<&Stage>,
        ) -> Result<(), StageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_session_token_is_stable_per_instance() {
        let hub = Hub::new(HubConfig::default(), Arc::new(InertOps));
        let token = hub.session_token().to_string();
        assert!(!token.is_empty());
        assert_eq!(hub.session_token(), token);
    }

    #[tokio::test]
    async fn test_independent_instances_get_distinct_tokens() {
        let a = Hub::new(HubConfig::default(), Arc::new(InertOps));
        let b = Hub::new(HubConfig::default(), Arc::new(InertOps));
        assert_ne!(a.session_token(), b.session_token());
    }

    #[tokio::test]
    async fn test_components_share_state() {
        let hub = Hub::new(HubConfig::default(), Arc::new(InertOps));

        // The engine's progress surfaces through the shared store.
        assert!(!hub.discovery().progress().is_running);
        assert_eq!(hub.progress_store().execution_count(), 0);
        assert!(hub.registry().is_empty());
    }
}
