//! Hyprland bridge
//!
//! Reads window-manager state through `hyprctl -j` and positions
//! session windows by title match. Placement is three sequential
//! dispatch commands (workspace, size, position) with settling delays;
//! the sequence is not transactional and a failure mid-way leaves the
//! window where it got to.

use crate::config::WmConfig;
use fleetdeck_common::{
    CmdOutput, CommandRunner, Error, Geometry, Result, ScreenPosition, SizePreset, TtlCache,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const WINDOW_CACHE_TTL: Duration = Duration::from_secs(2);
const MONITOR_CACHE_TTL: Duration = Duration::from_secs(30);
const HYPRCTL_TIMEOUT: Duration = Duration::from_secs(5);

/// One window as reported by the manager
#[derive(Debug, Clone, Serialize)]
pub struct WindowInfo {
    pub title: String,
    pub class: String,
    pub workspace_id: i64,
    pub position: (i32, i32),
    pub size: (i32, i32),
    pub floating: bool,
    pub fullscreen: bool,
}

/// One monitor as reported by the manager
#[derive(Debug, Clone, Serialize)]
pub struct MonitorInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    pub focused: bool,
    pub active_workspace: i64,
}

// Raw shapes of `hyprctl -j` output
#[derive(Debug, Deserialize)]
struct HyprWorkspaceRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct HyprClient {
    #[serde(default)]
    title: String,
    #[serde(default)]
    class: String,
    workspace: HyprWorkspaceRef,
    at: [i32; 2],
    size: [i32; 2],
    #[serde(default)]
    floating: bool,
    /// Bool in older releases, fullscreen-mode integer in newer ones
    #[serde(default)]
    fullscreen: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct HyprMonitor {
    name: String,
    width: u32,
    height: u32,
    scale: f64,
    #[serde(default)]
    focused: bool,
    #[serde(rename = "activeWorkspace")]
    active_workspace: HyprWorkspaceRef,
}

/// Retry/settle timings for window placement
#[derive(Debug, Clone, Copy)]
pub struct PlacementTiming {
    /// Attempts to wait for the window to appear
    pub appear_retries: u32,
    /// Delay between appearance checks
    pub appear_delay: Duration,
    /// Delay between dispatch commands for manager-side settling
    pub settle: Duration,
}

impl Default for PlacementTiming {
    fn default() -> Self {
        Self {
            appear_retries: 10,
            appear_delay: Duration::from_millis(500),
            settle: Duration::from_millis(300),
        }
    }
}

/// Bridge to the window-manager control tool.
pub struct WmBridge {
    runner: Arc<dyn CommandRunner>,
    hyprctl: String,
    top_margin: u32,
    gap: u32,
    overlay_workspace: String,
    timing: PlacementTiming,
    window_cache: TtlCache<(), Vec<WindowInfo>>,
    monitor_cache: TtlCache<(), Vec<MonitorInfo>>,
}

impl WmBridge {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &WmConfig) -> Self {
        Self {
            runner,
            hyprctl: config.hyprctl_path.clone(),
            top_margin: config.top_margin,
            gap: config.gap,
            overlay_workspace: config.overlay_workspace.clone(),
            timing: PlacementTiming::default(),
            window_cache: TtlCache::new(WINDOW_CACHE_TTL),
            monitor_cache: TtlCache::new(MONITOR_CACHE_TTL),
        }
    }

    pub fn with_timing(mut self, timing: PlacementTiming) -> Self {
        self.timing = timing;
        self
    }

    async fn hyprctl(&self, args: &[&str]) -> Result<CmdOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run(&self.hyprctl, &args, HYPRCTL_TIMEOUT).await
    }

    /// Current window list, cached for a couple of seconds. Parse or
    /// command failures degrade to an empty list.
    pub async fn list_windows(&self) -> Vec<WindowInfo> {
        if let Some(cached) = self.window_cache.get(&()) {
            return cached;
        }
        let windows = self.query_windows().await;
        if !windows.is_empty() {
            self.window_cache.put((), windows.clone());
        }
        windows
    }

    /// Uncached window query, used while waiting for a window to appear.
    async fn query_windows(&self) -> Vec<WindowInfo> {
        let out = match self.hyprctl(&["clients", "-j"]).await {
            Ok(out) if out.success => out,
            Ok(out) => {
                warn!("hyprctl clients failed: {}", out.stderr.trim());
                return Vec::new();
            }
            Err(e) => {
                warn!("hyprctl clients: {}", e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<HyprClient>>(&out.stdout) {
            Ok(clients) => clients
                .into_iter()
                .map(|c| WindowInfo {
                    title: c.title,
                    class: c.class,
                    workspace_id: c.workspace.id,
                    position: (c.at[0], c.at[1]),
                    size: (c.size[0], c.size[1]),
                    floating: c.floating,
                    fullscreen: match c.fullscreen {
                        serde_json::Value::Bool(b) => b,
                        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
                        _ => false,
                    },
                })
                .collect(),
            Err(e) => {
                warn!("hyprctl clients output unparseable: {}", e);
                Vec::new()
            }
        }
    }

    /// Monitor list, cached longer since monitors rarely change.
    pub async fn list_monitors(&self) -> Vec<MonitorInfo> {
        if let Some(cached) = self.monitor_cache.get(&()) {
            return cached;
        }

        let out = match self.hyprctl(&["monitors", "-j"]).await {
            Ok(out) if out.success => out,
            Ok(out) => {
                warn!("hyprctl monitors failed: {}", out.stderr.trim());
                return Vec::new();
            }
            Err(e) => {
                warn!("hyprctl monitors: {}", e);
                return Vec::new();
            }
        };

        let monitors = match serde_json::from_str::<Vec<HyprMonitor>>(&out.stdout) {
            Ok(mons) => mons
                .into_iter()
                .map(|m| MonitorInfo {
                    name: m.name,
                    width: m.width,
                    height: m.height,
                    scale: m.scale,
                    focused: m.focused,
                    active_workspace: m.active_workspace.id,
                })
                .collect(),
            Err(e) => {
                warn!("hyprctl monitors output unparseable: {}", e);
                Vec::new()
            }
        };

        if !monitors.is_empty() {
            self.monitor_cache.put((), monitors.clone());
        }
        monitors
    }

    /// Literal prefix test against the cached window list.
    pub async fn window_exists(&self, title_prefix: &str) -> bool {
        self.list_windows()
            .await
            .iter()
            .any(|w| w.title.starts_with(title_prefix))
    }

    /// Drop cached window-manager state.
    pub fn invalidate(&self) {
        self.window_cache.clear();
        self.monitor_cache.clear();
    }

    pub fn sweep_caches(&self) {
        self.window_cache.sweep();
        self.monitor_cache.sweep();
    }

    /// Monitor owning `workspace_id`, falling back to the focused one.
    async fn monitor_for_workspace(&self, workspace_id: i64) -> Result<MonitorInfo> {
        let monitors = self.list_monitors().await;
        monitors
            .iter()
            .find(|m| m.active_workspace == workspace_id)
            .or_else(|| monitors.iter().find(|m| m.focused))
            .or_else(|| monitors.first())
            .cloned()
            .ok_or_else(|| Error::PlacementFailed("no monitors reported".to_string()))
    }

    /// Target dimensions for a size preset on the monitor owning
    /// `workspace_id`.
    pub async fn resolve_geometry(
        &self,
        workspace_id: i64,
        preset: SizePreset,
        _position: ScreenPosition,
    ) -> Result<Geometry> {
        let monitor = self.monitor_for_workspace(workspace_id).await?;
        Ok(scaled_geometry(monitor.width, monitor.height, preset))
    }

    /// Wait for a window matching `title_prefix`, then run the
    /// move/resize/move sequence. Returns `false` when the window never
    /// appears (no mutation issued) or a dispatch is rejected.
    pub async fn place_window(
        &self,
        title_prefix: &str,
        workspace_id: i64,
        position: ScreenPosition,
        geometry: Geometry,
    ) -> bool {
        if !self.wait_for_window(title_prefix).await {
            return false;
        }

        let monitor = match self.monitor_for_workspace(workspace_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!("placement of '{}': {}", title_prefix, e);
                return false;
            }
        };
        let (x, y) = self.position_offset(&monitor, position, geometry);

        self.dispatch_sequence(title_prefix, &workspace_id.to_string(), geometry, x, y)
            .await
    }

    /// Same placement sequence targeting the overlay workspace.
    pub async fn assign_to_overlay(
        &self,
        title_prefix: &str,
        position: ScreenPosition,
        geometry: Geometry,
    ) -> bool {
        if !self.wait_for_window(title_prefix).await {
            return false;
        }

        let monitors = self.list_monitors().await;
        let monitor = match monitors.iter().find(|m| m.focused).or_else(|| monitors.first()) {
            Some(m) => m.clone(),
            None => {
                warn!("overlay placement of '{}': no monitors reported", title_prefix);
                return false;
            }
        };
        let (x, y) = self.position_offset(&monitor, position, geometry);
        let overlay = self.overlay_workspace.clone();

        self.dispatch_sequence(title_prefix, &overlay, geometry, x, y)
            .await
    }

    async fn wait_for_window(&self, title_prefix: &str) -> bool {
        for attempt in 0..self.timing.appear_retries {
            let found = self
                .query_windows()
                .await
                .iter()
                .any(|w| w.title.starts_with(title_prefix));
            if found {
                return true;
            }
            debug!(
                "waiting for window '{}' (attempt {}/{})",
                title_prefix,
                attempt + 1,
                self.timing.appear_retries
            );
            tokio::time::sleep(self.timing.appear_delay).await;
        }
        warn!("window '{}' never appeared", title_prefix);
        false
    }

    async fn dispatch_sequence(
        &self,
        title_prefix: &str,
        workspace: &str,
        geometry: Geometry,
        x: i32,
        y: i32,
    ) -> bool {
        let selector = format!("title:^({})", title_prefix);
        let steps = [
            vec![
                "dispatch".to_string(),
                "movetoworkspacesilent".to_string(),
                format!("{},{}", workspace, selector),
            ],
            vec![
                "dispatch".to_string(),
                "resizewindowpixel".to_string(),
                format!("exact {} {},{}", geometry.width, geometry.height, selector),
            ],
            vec![
                "dispatch".to_string(),
                "movewindowpixel".to_string(),
                format!("exact {} {},{}", x, y, selector),
            ],
        ];

        for (i, args) in steps.iter().enumerate() {
            match self.runner.run(&self.hyprctl, args, HYPRCTL_TIMEOUT).await {
                Ok(out) if out.success => {}
                Ok(out) => {
                    warn!(
                        "dispatch step {} for '{}' rejected: {}",
                        i + 1,
                        title_prefix,
                        out.stderr.trim()
                    );
                    return false;
                }
                Err(e) => {
                    warn!("dispatch step {} for '{}': {}", i + 1, title_prefix, e);
                    return false;
                }
            }
            if i + 1 < steps.len() {
                tokio::time::sleep(self.timing.settle).await;
            }
        }

        self.window_cache.clear();
        true
    }

    /// Fixed position-to-coordinate lookup; no layout solving.
    fn position_offset(
        &self,
        monitor: &MonitorInfo,
        position: ScreenPosition,
        geometry: Geometry,
    ) -> (i32, i32) {
        let mw = monitor.width as i32;
        let mh = monitor.height as i32;
        let w = geometry.width as i32;
        let h = geometry.height as i32;
        let gap = self.gap as i32;
        let top = (self.top_margin + self.gap) as i32;

        let left_x = gap;
        let center_x = (mw - w) / 2;
        let right_x = mw - w - gap;
        let bottom_y = mh - h - gap;

        match position {
            ScreenPosition::Left => (left_x, top),
            ScreenPosition::Center => (center_x, top),
            ScreenPosition::Right => (right_x, top),
            ScreenPosition::TopLeft => (left_x, top),
            ScreenPosition::TopRight => (right_x, top),
            ScreenPosition::BottomLeft => (left_x, bottom_y),
            ScreenPosition::BottomRight => (right_x, bottom_y),
        }
    }
}

/// Preset fraction of a monitor resolution, rounded to whole pixels.
pub fn scaled_geometry(monitor_width: u32, monitor_height: u32, preset: SizePreset) -> Geometry {
    let (wf, hf) = preset.fractions();
    Geometry::new(
        (monitor_width as f64 * wf).round() as u32,
        (monitor_height as f64 * hf).round() as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetdeck_common::CmdOutput;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;

    const MONITORS_JSON: &str = r#"[
        {"name":"DP-1","width":1920,"height":1080,"scale":1.0,"focused":true,
         "activeWorkspace":{"id":1}},
        {"name":"HDMI-A-1","width":2560,"height":1440,"scale":1.0,"focused":false,
         "activeWorkspace":{"id":2}}
    ]"#;

    fn client_json(title: &str) -> String {
        format!(
            r#"[{{"title":"{}","class":"xfreerdp","workspace":{{"id":1}},
                 "at":[10,50],"size":[800,600],"floating":true,"fullscreen":0}}]"#,
            title
        )
    }

    /// Runner returning scripted hyprctl output and recording dispatches.
    struct FakeHyprctl {
        clients_json: Mutex<String>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeHyprctl {
        fn new(clients_json: &str) -> Self {
            Self {
                clients_json: Mutex::new(clients_json.to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn dispatches(&self) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.first().map(|a| a == "dispatch").unwrap_or(false))
                .cloned()
                .collect()
        }
    }

    impl CommandRunner for FakeHyprctl {
        fn run(
            &self,
            _program: &str,
            args: &[String],
            _timeout: Duration,
        ) -> BoxFuture<'static, fleetdeck_common::Result<CmdOutput>> {
            self.calls.lock().push(args.to_vec());
            let out = match args.first().map(String::as_str) {
                Some("clients") => CmdOutput::ok(self.clients_json.lock().clone()),
                Some("monitors") => CmdOutput::ok(MONITORS_JSON),
                Some("dispatch") => CmdOutput::ok("ok"),
                _ => CmdOutput {
                    success: false,
                    stderr: "unknown command".to_string(),
                    ..Default::default()
                },
            };
            Box::pin(async move { Ok(out) })
        }
    }

    fn fast_timing() -> PlacementTiming {
        PlacementTiming {
            appear_retries: 3,
            appear_delay: Duration::from_millis(5),
            settle: Duration::ZERO,
        }
    }

    fn bridge(runner: Arc<FakeHyprctl>) -> WmBridge {
        WmBridge::new(runner, &crate::config::WmConfig::default()).with_timing(fast_timing())
    }

    #[test]
    fn test_scaled_geometry_presets() {
        assert_eq!(scaled_geometry(1920, 1080, SizePreset::Full), Geometry::new(1824, 1026));
        assert_eq!(scaled_geometry(1920, 1080, SizePreset::Half), Geometry::new(922, 1026));
        assert_eq!(scaled_geometry(1920, 1080, SizePreset::Quarter), Geometry::new(922, 508));
    }

    #[tokio::test]
    async fn test_resolve_geometry_uses_owning_monitor() {
        let runner = Arc::new(FakeHyprctl::new("[]"));
        let bridge = bridge(runner);

        let g = bridge
            .resolve_geometry(1, SizePreset::Full, ScreenPosition::Center)
            .await
            .unwrap();
        assert_eq!(g, Geometry::new(1824, 1026));

        // Workspace 2 lives on the 2560x1440 monitor
        let g = bridge
            .resolve_geometry(2, SizePreset::Full, ScreenPosition::Center)
            .await
            .unwrap();
        assert_eq!(g, Geometry::new(2432, 1368));
    }

    #[tokio::test]
    async fn test_window_listing_and_prefix_match() {
        let runner = Arc::new(FakeHyprctl::new(&client_json("FreeRDP: 192.168.1.20")));
        let bridge = bridge(runner);

        let windows = bridge.list_windows().await;
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].workspace_id, 1);
        assert!(windows[0].floating);

        assert!(bridge.window_exists("FreeRDP: 192.168.1.20").await);
        assert!(bridge.window_exists("FreeRDP:").await);
        // Prefix test, not substring containment
        assert!(!bridge.window_exists("192.168.1.20").await);
    }

    #[tokio::test]
    async fn test_unparseable_listing_degrades_to_empty() {
        let runner = Arc::new(FakeHyprctl::new("Hyprland error: no instance"));
        let bridge = bridge(runner);
        assert!(bridge.list_windows().await.is_empty());
    }

    #[tokio::test]
    async fn test_place_window_missing_title_issues_no_mutations() {
        let runner = Arc::new(FakeHyprctl::new("[]"));
        let bridge = bridge(runner.clone());

        let placed = bridge
            .place_window(
                "FreeRDP: 192.168.1.99",
                1,
                ScreenPosition::Center,
                Geometry::new(800, 600),
            )
            .await;

        assert!(!placed);
        assert!(runner.dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_place_window_runs_three_step_sequence() {
        let runner = Arc::new(FakeHyprctl::new(&client_json("FreeRDP: 192.168.1.20")));
        let bridge = bridge(runner.clone());

        let placed = bridge
            .place_window(
                "FreeRDP: 192.168.1.20",
                1,
                ScreenPosition::Center,
                Geometry::new(1824, 1026),
            )
            .await;
        assert!(placed);

        let dispatches = runner.dispatches();
        assert_eq!(dispatches.len(), 3);
        assert_eq!(dispatches[0][1], "movetoworkspacesilent");
        assert!(dispatches[0][2].starts_with("1,title:^(FreeRDP: 192.168.1.20)"));
        assert_eq!(dispatches[1][1], "resizewindowpixel");
        assert!(dispatches[1][2].starts_with("exact 1824 1026,"));
        assert_eq!(dispatches[2][1], "movewindowpixel");
        // Centered on the 1920-wide monitor
        assert!(dispatches[2][2].starts_with("exact 48 48,"));
    }

    #[tokio::test]
    async fn test_overlay_targets_special_workspace() {
        let runner = Arc::new(FakeHyprctl::new(&client_json("FreeRDP: 192.168.1.21")));
        let bridge = bridge(runner.clone());

        let placed = bridge
            .assign_to_overlay(
                "FreeRDP: 192.168.1.21",
                ScreenPosition::Left,
                Geometry::new(800, 600),
            )
            .await;
        assert!(placed);

        let dispatches = runner.dispatches();
        assert!(dispatches[0][2].starts_with("special:deck,"));
    }
}
