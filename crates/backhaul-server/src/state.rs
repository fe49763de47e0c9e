use crate::config::ProxyConfig;
use backhaul_control::{ConnectionRegistry, CorrelationTable};
use std::sync::Arc;

/// Shared state injected into every handler
///
/// Lives from server start to shutdown; cloning shares the same registry and
/// table.
#[derive(Debug, Clone)]
pub struct ProxyState {
    pub registry: ConnectionRegistry,
    pub table: CorrelationTable,
    pub config: Arc<ProxyConfig>,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            table: CorrelationTable::new(),
            config: Arc::new(config),
        }
    }
}
