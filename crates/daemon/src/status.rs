//! Fleet status aggregation and broadcasting
//!
//! Combines ping reachability, local service-unit state, window
//! presence, and live session info into one per-machine view. Each
//! input has its own TTL cache so a burst of HTTP polls and the
//! broadcast loop share probe work instead of multiplying it.

use crate::hypr::WmBridge;
use crate::registry::FleetRegistry;
use crate::session::SessionManager;
use chrono::{DateTime, Utc};
use fleetdeck_common::{CommandRunner, Geometry, Prober, ScreenPosition, SessionKind, TtlCache};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Snapshot of one machine's health and configuration
#[derive(Debug, Clone, Serialize)]
pub struct MachineStatus {
    pub id: String,
    pub callsign: String,
    pub address: String,
    pub online: bool,
    /// Local systemd user unit backing the machine, when one exists
    pub unit_state: String,
    pub window_present: bool,
    /// Kind of the live session, if any
    pub session: Option<SessionKind>,
    pub geometry: Geometry,
    pub workspace: i64,
    pub position: ScreenPosition,
    pub scratchpad: bool,
    pub enabled: bool,
}

/// Snapshot of the whole fleet
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub machines: BTreeMap<String, MachineStatus>,
    pub generated_at: DateTime<Utc>,
}

pub struct StatusAggregator {
    registry: Arc<FleetRegistry>,
    prober: Arc<Prober>,
    bridge: Arc<WmBridge>,
    sessions: SessionManager,
    runner: Arc<dyn CommandRunner>,
    unit_prefix: String,
    ping_cache: TtlCache<String, bool>,
    unit_cache: TtlCache<String, String>,
    aggregate_cache: TtlCache<(), FleetStatus>,
}

impl StatusAggregator {
    pub fn new(
        registry: Arc<FleetRegistry>,
        prober: Arc<Prober>,
        bridge: Arc<WmBridge>,
        sessions: SessionManager,
        runner: Arc<dyn CommandRunner>,
        unit_prefix: String,
    ) -> Self {
        Self {
            registry,
            prober,
            bridge,
            sessions,
            runner,
            unit_prefix,
            ping_cache: TtlCache::new(Duration::from_secs(10)),
            unit_cache: TtlCache::new(Duration::from_secs(5)),
            aggregate_cache: TtlCache::new(Duration::from_secs(3)),
        }
    }

    /// Assemble (or return the cached) per-machine fleet view.
    pub async fn fleet_status(&self) -> FleetStatus {
        if let Some(cached) = self.aggregate_cache.get(&()) {
            return cached;
        }

        let machines = self.registry.list();
        let pings = self.cached_pings(machines.values().map(|m| m.address.clone())).await;
        let windows = self.bridge.list_windows().await;
        let active = self.sessions.active_kinds();

        let mut out = BTreeMap::new();
        for (id, entry) in machines {
            let unit_state = self.cached_unit_state(&id).await;
            let session = active.get(&entry.address).copied();
            // Match the client's known title formats, not any window
            // that merely mentions the address
            let titles = self
                .sessions
                .window_titles(&entry.address, session.unwrap_or(SessionKind::Rdp));
            let window_present = windows
                .iter()
                .any(|w| titles.iter().any(|t| w.title.starts_with(t)));
            out.insert(
                id.clone(),
                MachineStatus {
                    id,
                    callsign: entry.callsign,
                    online: pings.get(&entry.address).copied().unwrap_or(false),
                    unit_state,
                    window_present,
                    session,
                    address: entry.address,
                    geometry: entry.geometry,
                    workspace: entry.workspace,
                    position: entry.position,
                    scratchpad: entry.scratchpad,
                    enabled: entry.enabled,
                },
            );
        }

        let status = FleetStatus {
            machines: out,
            generated_at: Utc::now(),
        };
        self.aggregate_cache.put((), status.clone());
        status
    }

    /// Drop every cached layer so the next read probes fresh. Called
    /// after mutating operations (connect, disconnect, fleet actions).
    pub fn refresh(&self) {
        self.aggregate_cache.clear();
        self.ping_cache.clear();
        self.unit_cache.clear();
        self.bridge.invalidate();
    }

    /// Purge expired entries from every cache layer. Fresh entries are
    /// untouched.
    pub fn sweep_caches(&self) {
        self.ping_cache.sweep();
        self.unit_cache.sweep();
        self.aggregate_cache.sweep();
        self.bridge.sweep_caches();
    }

    /// Periodic sweep keeping abandoned keys from accumulating.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.sweep_caches();
        }
    }

    /// Ping only the addresses whose cached answer has expired.
    async fn cached_pings(
        &self,
        addresses: impl Iterator<Item = String>,
    ) -> BTreeMap<String, bool> {
        let mut result = BTreeMap::new();
        let mut stale = Vec::new();
        for addr in addresses {
            match self.ping_cache.get(&addr) {
                Some(up) => {
                    result.insert(addr, up);
                }
                None => stale.push(addr),
            }
        }

        if !stale.is_empty() {
            for (addr, up) in self.prober.batch_ping(&stale).await {
                self.ping_cache.put(addr.clone(), up);
                result.insert(addr, up);
            }
        }
        result
    }

    /// `systemctl --user is-active <prefix><id>`; "unknown" when the
    /// call itself fails.
    async fn cached_unit_state(&self, id: &str) -> String {
        if let Some(state) = self.unit_cache.get(&id.to_string()) {
            return state;
        }

        let unit = format!("{}{}", self.unit_prefix, id);
        let args = vec!["--user".to_string(), "is-active".to_string(), unit];
        let state = match self
            .runner
            .run("systemctl", &args, Duration::from_secs(3))
            .await
        {
            // is-active prints the state either way; exit code only
            // distinguishes active from everything else
            Ok(output) => {
                let s = output.stdout.trim();
                if s.is_empty() { "unknown".to_string() } else { s.to_string() }
            }
            Err(e) => {
                debug!("systemctl query for {} failed: {}", id, e);
                "unknown".to_string()
            }
        };
        self.unit_cache.put(id.to_string(), state.clone());
        state
    }
}

/// Broadcast loop pacing: more subscribers, faster updates
pub fn broadcast_interval(subscribers: usize) -> Duration {
    let secs = 8i64.saturating_sub(subscribers as i64).clamp(3, 8);
    Duration::from_secs(secs as u64)
}

/// Emit `status_update` events until the process exits. The interval
/// adapts to subscriber count; failures back off instead of killing
/// the loop.
pub async fn run_broadcaster(
    aggregator: Arc<StatusAggregator>,
    tx: broadcast::Sender<serde_json::Value>,
) {
    let mut consecutive_failures: u32 = 0;
    loop {
        let interval = if consecutive_failures > 0 {
            broadcast_interval(0) * (consecutive_failures.min(4) + 1)
        } else {
            broadcast_interval(tx.receiver_count())
        };
        tokio::time::sleep(interval).await;

        if tx.receiver_count() == 0 {
            continue;
        }

        match serde_json::to_value(aggregator.fleet_status().await) {
            Ok(body) => {
                let event = serde_json::json!({
                    "event": "status_update",
                    "data": body,
                });
                // Send only fails with no receivers; harmless race
                let _ = tx.send(event);
                consecutive_failures = 0;
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    "Status broadcast failed ({} in a row): {}",
                    consecutive_failures, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WmConfig;
    use crate::session::{ClientCommand, ClientLauncher, SessionParams, SessionTiming};
    use fleetdeck_common::{CmdOutput, Error, Result};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;

    struct FakeRunner {
        calls: Mutex<Vec<String>>,
    }

    impl CommandRunner for FakeRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            _timeout: Duration,
        ) -> BoxFuture<'static, Result<CmdOutput>> {
            self.calls.lock().push(program.to_string());
            let res = match program {
                // Only .20 answers ping
                "ping" => Ok(CmdOutput {
                    success: args.last().is_some_and(|a| a.ends_with(".20")),
                    ..Default::default()
                }),
                "systemctl" => Ok(CmdOutput::ok("active\n")),
                // One real client window plus an editor that mentions
                // another machine's address
                "hyprctl" => Ok(CmdOutput::ok(
                    r#"[{"title":"FreeRDP: 192.168.1.20","class":"xfreerdp",
                         "workspace":{"id":1},"at":[0,0],"size":[100,100],"fullscreen":false},
                        {"title":"nvim /tmp/192.168.1.21.txt","class":"kitty",
                         "workspace":{"id":2},"at":[0,0],"size":[100,100],"fullscreen":false}]"#,
                )),
                other => Err(Error::SpawnFailed(other.to_string())),
            };
            Box::pin(async move { res })
        }
    }

    struct NoLauncher;

    impl ClientLauncher for NoLauncher {
        fn command_variants(
            &self,
            _address: &str,
            _kind: SessionKind,
            _params: &SessionParams,
        ) -> Vec<ClientCommand> {
            Vec::new()
        }
    }

    fn aggregator(dir: &tempfile::TempDir) -> Arc<StatusAggregator> {
        let runner: Arc<dyn CommandRunner> = Arc::new(FakeRunner {
            calls: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(FleetRegistry::load(dir.path().join("fleet.toml")));
        let prober = Arc::new(
            Prober::new(runner.clone())
                .with_timeouts(Duration::from_secs(1), Duration::from_millis(200)),
        );
        let bridge = Arc::new(WmBridge::new(runner.clone(), &WmConfig::default()));
        let sessions = SessionManager::new(Box::new(NoLauncher), None, SessionTiming::default());
        Arc::new(StatusAggregator::new(
            registry,
            prober,
            bridge,
            sessions,
            runner,
            "fleetdeck-".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_fleet_status_combines_probe_layers() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(&dir);

        let status = agg.fleet_status().await;
        assert_eq!(status.machines.len(), 6);

        let vm20 = &status.machines["vm20"];
        assert!(vm20.online);
        assert_eq!(vm20.unit_state, "active");
        assert!(vm20.window_present);
        assert!(vm20.session.is_none());

        // An unrelated window mentioning vm21's address does not count
        // as its client window
        let vm21 = &status.machines["vm21"];
        assert!(!vm21.online);
        assert!(!vm21.window_present);
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_entries() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(&dir);

        let first = agg.fleet_status().await;
        agg.sweep_caches();
        // Everything is younger than its TTL, so the aggregate survives
        let second = agg.fleet_status().await;
        assert_eq!(first.generated_at, second.generated_at);
    }

    #[tokio::test]
    async fn test_aggregate_is_cached_until_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(&dir);

        let first = agg.fleet_status().await;
        let second = agg.fleet_status().await;
        assert_eq!(first.generated_at, second.generated_at);

        agg.refresh();
        let third = agg.fleet_status().await;
        assert!(third.generated_at > first.generated_at);
    }

    #[test]
    fn test_broadcast_interval_adapts_and_clamps() {
        assert_eq!(broadcast_interval(0), Duration::from_secs(8));
        assert_eq!(broadcast_interval(3), Duration::from_secs(5));
        assert_eq!(broadcast_interval(5), Duration::from_secs(3));
        // Never below the floor
        assert_eq!(broadcast_interval(50), Duration::from_secs(3));
    }
}
