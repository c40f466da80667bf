//! Shared transports for RS-485 multidrop bus devices.
//!
//! Multiple ELL14 devices can share a single serial port. This module
//! provides a static registry to track and reuse open bus transports; each
//! exchange on a [`MessageTransport`] is exclusive, so drivers addressing
//! different modules interleave safely.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use lab_core::{ConnectionConfig, ConnectionDefaults, MessageTransport, Result};

/// Module-local registry for shared bus transports.
static SHARED_BUSES: OnceLock<RwLock<HashMap<String, Arc<MessageTransport>>>> = OnceLock::new();

fn bus_registry() -> &'static RwLock<HashMap<String, Arc<MessageTransport>>> {
    SHARED_BUSES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registry key identifying the physical link of a connection.
pub fn bus_key(connection: &ConnectionConfig) -> String {
    match connection {
        ConnectionConfig::Serial { port, .. } => port.clone(),
        ConnectionConfig::Tcp { host, port } => format!("{host}:{port}"),
        other => format!("{other:?}"),
    }
}

/// Get an existing shared transport if one is already open for `key`.
pub fn get_existing_bus(key: &str) -> Option<Arc<MessageTransport>> {
    bus_registry().read().get(key).cloned()
}

/// Register a newly opened transport in the shared registry.
///
/// If another task registered the same bus first, that transport wins and
/// is returned.
pub fn register_bus(key: &str, transport: Arc<MessageTransport>) -> Arc<MessageTransport> {
    let mut registry = bus_registry().write();
    let entry = registry.entry(key.to_string()).or_insert_with(|| {
        tracing::info!(bus = key, "Registered new shared bus");
        transport
    });
    Arc::clone(entry)
}

/// Remove a bus from the registry (e.g., when it becomes stale).
pub fn remove_bus(key: &str) -> bool {
    let removed = bus_registry().write().remove(key).is_some();
    if removed {
        tracing::info!(bus = key, "Removed shared bus from registry");
    }
    removed
}

/// Get or open the shared transport for `connection`.
pub async fn get_or_open_bus(
    connection: &ConnectionConfig,
    name: &str,
    defaults: &ConnectionDefaults,
) -> Result<Arc<MessageTransport>> {
    let key = bus_key(connection);
    if let Some(bus) = get_existing_bus(&key) {
        tracing::debug!(bus = %key, "Reusing shared bus");
        return Ok(bus);
    }
    let transport = Arc::new(connection.open(name, defaults).await?);
    Ok(register_bus(&key, transport))
}

/// Close all shared buses (for cleanup/testing).
pub fn close_all_buses() {
    if let Some(registry) = SHARED_BUSES.get() {
        let mut guard = registry.write();
        let count = guard.len();
        guard.clear();
        tracing::info!(count, "Closed all shared buses");
    }
}

/// Get the number of currently open shared buses.
pub fn bus_count() -> usize {
    SHARED_BUSES.get().map(|r| r.read().len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::mock::MockInstrument;
    use lab_core::TransportOptions;

    #[test]
    fn bus_key_uses_physical_port() {
        assert_eq!(bus_key(&ConnectionConfig::serial("/dev/ttyUSB1")), "/dev/ttyUSB1");
        assert_eq!(
            bus_key(&ConnectionConfig::Tcp {
                host: "10.0.0.5".into(),
                port: 4001
            }),
            "10.0.0.5:4001"
        );
    }

    #[tokio::test]
    async fn first_registration_wins() {
        let (a, _) = MockInstrument::new().spawn_transport("a", TransportOptions::default());
        let (b, _) = MockInstrument::new().spawn_transport("b", TransportOptions::default());

        let key = "test-bus-first-registration";
        let first = register_bus(key, Arc::new(a));
        let second = register_bus(key, Arc::new(b));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.name(), "a");
        assert!(get_existing_bus(key).is_some());
        assert!(remove_bus(key));
        assert!(get_existing_bus(key).is_none());
    }
}
