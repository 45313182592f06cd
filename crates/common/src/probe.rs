//! Host and service probing
//!
//! Single-shot reachability checks: one ICMP echo via the system
//! `ping` utility and plain TCP connects against the per-service
//! ports. A probe never errors; anything that goes wrong reads as
//! "not reachable". Callers wanting fresher data re-probe after their
//! cache TTL elapses.

use crate::runner::CommandRunner;
use crate::types::ScannedHost;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// TCP ports checked per service. Overridable so tests can point the
/// prober at loopback listeners.
#[derive(Debug, Clone, Copy)]
pub struct ServicePorts {
    pub rdp: u16,
    pub vnc: u16,
    pub ssh: u16,
}

impl Default for ServicePorts {
    fn default() -> Self {
        Self {
            rdp: 3389,
            vnc: 5900,
            ssh: 22,
        }
    }
}

/// Issues ping and port probes against fleet addresses.
pub struct Prober {
    runner: Arc<dyn CommandRunner>,
    ping_timeout: Duration,
    port_timeout: Duration,
    ports: ServicePorts,
    scan_concurrency: usize,
}

impl Prober {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            ping_timeout: Duration::from_secs(2),
            port_timeout: Duration::from_secs(1),
            ports: ServicePorts::default(),
            scan_concurrency: 50,
        }
    }

    pub fn with_ports(mut self, ports: ServicePorts) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_timeouts(mut self, ping: Duration, port: Duration) -> Self {
        self.ping_timeout = ping;
        self.port_timeout = port;
        self
    }

    /// One ICMP echo with a bounded wait. Non-zero exit, spawn failure,
    /// or timeout all read as unreachable.
    pub async fn ping_host(&self, address: &str) -> bool {
        let secs = self.ping_timeout.as_secs().max(1);
        let args = vec![
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            secs.to_string(),
            address.to_string(),
        ];
        // Give the utility slightly longer than its own deadline
        let bound = self.ping_timeout + Duration::from_millis(500);
        match self.runner.run("ping", &args, bound).await {
            Ok(out) => out.success,
            Err(e) => {
                debug!("ping {} failed: {}", address, e);
                false
            }
        }
    }

    /// One TCP connect with a bounded wait and a clean close. Refusal
    /// and timeout both yield `false`.
    pub async fn check_port(&self, address: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.port_timeout, TcpStream::connect((address, port))).await,
            Ok(Ok(_))
        )
    }

    /// Scan one host for services. Hosts with no open service port are
    /// excluded from discovery (`None`). A host answering on any
    /// service counts as online even when ICMP is filtered.
    pub async fn scan_host(&self, address: &str) -> Option<ScannedHost> {
        let rdp = self.check_port(address, self.ports.rdp).await;
        let vnc = self.check_port(address, self.ports.vnc).await;
        let ssh = self.check_port(address, self.ports.ssh).await;

        if !rdp && !vnc && !ssh {
            return None;
        }

        let online = self.ping_host(address).await || rdp || vnc || ssh;

        Some(ScannedHost {
            address: address.to_string(),
            hostname: self.hostname(address).await,
            os_guess: classify_services(rdp, vnc, ssh).to_string(),
            online,
            rdp,
            vnc,
            ssh,
            last_seen: Utc::now(),
        })
    }

    /// Sweep `base.start ..= base.end` with bounded concurrency.
    /// Returns a completed mapping; no partial results, no streaming.
    pub async fn scan_range(
        &self,
        base: &str,
        start: u8,
        end: u8,
    ) -> HashMap<String, ScannedHost> {
        let addresses: Vec<String> = (start..=end).map(|i| format!("{}.{}", base, i)).collect();

        stream::iter(addresses)
            .map(|addr| async move {
                let host = self.scan_host(&addr).await;
                (addr, host)
            })
            .buffer_unordered(self.scan_concurrency)
            .filter_map(|(addr, host)| async move { host.map(|h| (addr, h)) })
            .collect()
            .await
    }

    /// Ping a batch of addresses with bounded concurrency.
    pub async fn batch_ping(&self, addresses: &[String]) -> HashMap<String, bool> {
        stream::iter(addresses.to_vec())
            .map(|addr| async move {
                let up = self.ping_host(&addr).await;
                (addr, up)
            })
            .buffer_unordered(self.scan_concurrency)
            .collect()
            .await
    }

    /// Reverse name lookup via `getent hosts`; falls back to a
    /// placeholder derived from the last address octet.
    async fn hostname(&self, address: &str) -> String {
        let args = vec!["hosts".to_string(), address.to_string()];
        if let Ok(out) = self.runner.run("getent", &args, Duration::from_secs(2)).await {
            if out.success {
                if let Some(name) = out.stdout.split_whitespace().nth(1) {
                    return name.to_string();
                }
            }
        }
        let octet = address.rsplit('.').next().unwrap_or("0");
        format!("unknown-{}", octet)
    }
}

/// Guess the OS family from which services answer.
fn classify_services(rdp: bool, vnc: bool, ssh: bool) -> &'static str {
    match (rdp, vnc, ssh) {
        (true, _, true) => "windows/wsl",
        (true, _, false) => "windows",
        (false, true, true) => "linux desktop",
        (false, false, true) => "linux server",
        (false, true, false) => "linux/vnc",
        (false, false, false) => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CmdOutput;
    use crate::{Error, Result};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::net::TcpListener;

    /// Runner with canned per-program results.
    struct FakeRunner {
        ping_ok: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn new(ping_ok: bool) -> Self {
            Self {
                ping_ok,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(
            &self,
            program: &str,
            _args: &[String],
            _timeout: Duration,
        ) -> BoxFuture<'static, Result<CmdOutput>> {
            self.calls.lock().push(program.to_string());
            let res = match program {
                "ping" if self.ping_ok => Ok(CmdOutput::ok("")),
                "ping" => Ok(CmdOutput {
                    success: false,
                    ..Default::default()
                }),
                "getent" => Ok(CmdOutput::ok("127.0.0.1  testbox.lan\n")),
                other => Err(Error::SpawnFailed(other.to_string())),
            };
            Box::pin(async move { res })
        }
    }

    fn prober_with(runner: FakeRunner, ports: ServicePorts) -> Prober {
        Prober::new(Arc::new(runner))
            .with_ports(ports)
            .with_timeouts(Duration::from_secs(1), Duration::from_millis(500))
    }

    /// Bind then drop three listeners so the ports are known-closed.
    fn closed_ports() -> ServicePorts {
        let grab = || {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        ServicePorts {
            rdp: grab(),
            vnc: grab(),
            ssh: grab(),
        }
    }

    #[tokio::test]
    async fn test_check_port_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let open = listener.local_addr().unwrap().port();
        let ports = closed_ports();

        let prober = prober_with(FakeRunner::new(true), ports);
        assert!(prober.check_port("127.0.0.1", open).await);
        assert!(!prober.check_port("127.0.0.1", ports.rdp).await);
    }

    #[tokio::test]
    async fn test_scan_excludes_host_without_services() {
        let prober = prober_with(FakeRunner::new(true), closed_ports());
        assert!(prober.scan_host("127.0.0.1").await.is_none());
    }

    #[tokio::test]
    async fn test_scan_reports_service_host_online_without_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut ports = closed_ports();
        ports.ssh = listener.local_addr().unwrap().port();

        // ICMP filtered, but a service answers: still online
        let prober = prober_with(FakeRunner::new(false), ports);
        let host = prober.scan_host("127.0.0.1").await.unwrap();
        assert!(host.online);
        assert!(host.ssh && !host.rdp && !host.vnc);
        assert_eq!(host.os_guess, "linux server");
        assert_eq!(host.hostname, "testbox.lan");
    }

    #[tokio::test]
    async fn test_ping_failure_is_false_not_error() {
        let prober = prober_with(FakeRunner::new(false), closed_ports());
        assert!(!prober.ping_host("192.0.2.1").await);
    }

    #[test]
    fn test_classify_services() {
        assert_eq!(classify_services(true, false, true), "windows/wsl");
        assert_eq!(classify_services(true, false, false), "windows");
        assert_eq!(classify_services(false, true, true), "linux desktop");
        assert_eq!(classify_services(false, true, false), "linux/vnc");
        assert_eq!(classify_services(false, false, false), "unknown");
    }
}
