//! Layer configuration.
//!
//! All knobs have defaults matching the constants the protocol was
//! designed around; `from_env` lets deployments (and tests, which need
//! unique object names) override them without recompiling.

use std::time::Duration;

/// Version stamp compared during negotiation. Two processes only
/// connect when their stamps are equal.
pub const LAYER_BINARY_VERSION: u32 = 0x0000_0001;

/// Prefix for every system-global named object.
pub const DEFAULT_NAME_PREFIX: &str = "lamina";

#[derive(Debug, Clone)]
pub struct LayerConfig {
    /// Size of each RPC shared-memory arena.
    pub arena_size: usize,

    /// Prefix for named shared memory and semaphores. Override per test
    /// run to avoid collisions between concurrent suites.
    pub name_prefix: String,

    /// Degrade per-session locking to one global call lock.
    pub serialize_everything: bool,

    /// How long an overlay waits for a main process to appear before its
    /// session create fails.
    pub connect_timeout: Duration,

    /// Tick used when waiting on semaphores so peer death and stop
    /// requests are observed within a bounded time.
    pub poll_tick: Duration,

    /// Tick used by the negotiator accept loop.
    pub negotiation_tick: Duration,

    /// Bound on how long anyone waits for the negotiation mutex.
    pub mutex_wait: Duration,

    /// Composition layers cached per overlay connection.
    pub max_overlay_layers: usize,

    /// Events buffered per overlay connection.
    pub max_saved_events: usize,

    /// Layer slots reserved for overlays; subtracted from the runtime's
    /// max layer count before it is reported to the main application.
    pub overlay_layer_budget: u32,
}

impl Default for LayerConfig {
    fn default() -> Self {
        LayerConfig {
            arena_size: 1024 * 1024,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            serialize_everything: false,
            connect_timeout: Duration::from_secs(10),
            poll_tick: Duration::from_millis(500),
            negotiation_tick: Duration::from_secs(2),
            mutex_wait: Duration::from_millis(500),
            max_overlay_layers: 16,
            max_saved_events: 16,
            overlay_layer_budget: 2,
        }
    }
}

impl LayerConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = LayerConfig::default();
        if let Some(v) = env_usize("LAMINA_ARENA_SIZE") {
            cfg.arena_size = v;
        }
        if let Ok(v) = std::env::var("LAMINA_NAME_PREFIX") {
            if !v.is_empty() {
                cfg.name_prefix = v;
            }
        }
        if let Ok(v) = std::env::var("LAMINA_SERIALIZE_EVERYTHING") {
            cfg.serialize_everything = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = env_usize("LAMINA_CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout = Duration::from_millis(v as u64);
        }
        if let Some(v) = env_usize("LAMINA_OVERLAY_LAYER_BUDGET") {
            cfg.overlay_layer_budget = v as u32;
        }
        cfg
    }

    /// Names of the four process-global negotiation objects.
    pub fn negotiation_names(&self) -> NegotiationNames {
        NegotiationNames {
            mutex: format!("{}_negotiation_mutex", self.name_prefix),
            shmem: format!("{}_negotiation_shmem", self.name_prefix),
            overlay_wait_sema: format!("{}_negotiation_overlay_wait_sema", self.name_prefix),
            main_wait_sema: format!("{}_negotiation_main_wait_sema", self.name_prefix),
        }
    }

    /// Names of the per-overlay RPC objects; `pid` is the overlay's.
    pub fn rpc_names(&self, pid: u32) -> RpcNames {
        RpcNames {
            mutex: format!("{}_rpc_mutex_{}", self.name_prefix, pid),
            shmem: format!("{}_rpc_shmem_{}", self.name_prefix, pid),
            request_sema: format!("{}_rpc_request_sema_{}", self.name_prefix, pid),
            response_sema: format!("{}_rpc_response_sema_{}", self.name_prefix, pid),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationNames {
    pub mutex: String,
    pub shmem: String,
    pub overlay_wait_sema: String,
    pub main_wait_sema: String,
}

#[derive(Debug, Clone)]
pub struct RpcNames {
    pub mutex: String,
    pub shmem: String,
    pub request_sema: String,
    pub response_sema: String,
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_names_embed_pid() {
        let cfg = LayerConfig::default();
        let names = cfg.rpc_names(4242);
        assert!(names.shmem.ends_with("_4242"));
        assert!(names.request_sema.contains("request"));
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = LayerConfig::default();
        assert_eq!(cfg.arena_size, 1024 * 1024);
        assert_eq!(cfg.max_overlay_layers, 16);
        assert_eq!(cfg.max_saved_events, 16);
        assert_eq!(cfg.overlay_layer_budget, 2);
    }
}
