//! C2 — Network supervisor. Detects host connectivity state from periodic
//! TCP dials (and, on Linux, `/proc/net/dev` link-state heuristics) and
//! broadcasts transitions so the retry engine can park instead of burning
//! attempts during an outage.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connectivity state. `Degraded` gates retry the same as `Up` but is
/// surfaced distinctly in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Unknown,
    Up,
    Down,
    Degraded,
}

impl NetworkState {
    pub fn is_down(self) -> bool {
        matches!(self, NetworkState::Down)
    }

    pub fn permits_retry(self) -> bool {
        matches!(self, NetworkState::Up | NetworkState::Degraded)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => NetworkState::Up,
            2 => NetworkState::Down,
            3 => NetworkState::Degraded,
            _ => NetworkState::Unknown,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            NetworkState::Unknown => 0,
            NetworkState::Up => 1,
            NetworkState::Down => 2,
            NetworkState::Degraded => 3,
        }
    }
}

/// Narrow interface the retry engine needs from the supervisor, so it can
/// depend on a trait object instead of the concrete supervisor type.
#[async_trait]
pub trait NetworkGate: Send + Sync {
    fn state(&self) -> NetworkState;
    /// Resolves once the state transitions to `Up` or `Degraded`.
    async fn wait_for_up(&self);
}

#[derive(Debug, Clone)]
pub struct NetworkSupervisorConfig {
    pub check_interval: Duration,
    pub check_timeout: Duration,
    pub check_hosts: Vec<(String, u16)>,
}

impl Default for NetworkSupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(5),
            check_hosts: vec![
                ("8.8.8.8".to_string(), 53),
                ("1.1.1.1".to_string(), 443),
                ("8.8.4.4".to_string(), 53),
            ],
        }
    }
}

/// Per-interface byte/packet counters, as surfaced by `getInterfaceStats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

struct Inner {
    state: AtomicU8,
    sender: broadcast::Sender<NetworkState>,
    up_notify: tokio::sync::Notify,
}

/// Detects host connectivity state and broadcasts transitions to subscribers.
pub struct NetworkSupervisor {
    inner: Arc<Inner>,
    config: NetworkSupervisorConfig,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl NetworkSupervisor {
    pub fn new(config: NetworkSupervisorConfig) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(NetworkState::Unknown.to_u8()),
                sender,
                up_notify: tokio::sync::Notify::new(),
            }),
            config,
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Spawn the periodic connectivity-check loop. Idempotent: calling
    /// `start` twice without an intervening `stop` is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let config = self.config.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.check_interval);
            loop {
                ticker.tick().await;
                let new_state = probe_connectivity(&config).await;
                set_state(&inner, new_state);
            }
        }));
    }

    /// Cancel the background task and drop all subscribers' senders (the
    /// channel is dropped with `self`, closing every receiver exactly once).
    pub async fn stop(&self) {
        let mut guard = self.task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    pub fn get_state(&self) -> NetworkState {
        NetworkState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_up(&self) -> bool {
        self.get_state().permits_retry()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkState> {
        self.inner.sender.subscribe()
    }

    /// Resolves once the state is, or becomes, `Up`/`Degraded`, or returns
    /// early if `cancel` fires.
    pub async fn wait_for_network(&self, cancel: &tokio_util::sync::CancellationToken) {
        if self.get_state().permits_retry() {
            return;
        }
        tokio::select! {
            _ = self.inner.up_notify.notified() => {}
            _ = cancel.cancelled() => {}
        }
    }

    /// Per-interface rx/tx counters. Linux-only; returns an empty map on
    /// other platforms or if `/proc/net/dev` is unreadable.
    pub fn get_interface_stats(&self) -> HashMap<String, InterfaceStats> {
        read_proc_net_dev().unwrap_or_default()
    }

    /// Force a state transition outside the periodic loop, e.g. in response
    /// to a link-down kernel event. Exposed so a host embedding this crate
    /// can wire in its own link-event source.
    pub fn report_link_down(&self) {
        set_state(&self.inner, NetworkState::Down);
    }
}

#[async_trait]
impl NetworkGate for NetworkSupervisor {
    fn state(&self) -> NetworkState {
        self.get_state()
    }

    async fn wait_for_up(&self) {
        if self.get_state().permits_retry() {
            return;
        }
        self.inner.up_notify.notified().await;
    }
}

fn set_state(inner: &Arc<Inner>, new_state: NetworkState) {
    let old = NetworkState::from_u8(inner.state.swap(new_state.to_u8(), Ordering::SeqCst));
    if old == new_state {
        return;
    }
    match new_state {
        NetworkState::Down => warn!(?old, ?new_state, "network state changed"),
        NetworkState::Degraded => warn!(?old, ?new_state, "network state changed"),
        _ => info!(?old, ?new_state, "network state changed"),
    }
    if new_state.permits_retry() {
        inner.up_notify.notify_waiters();
    }
    // Non-blocking broadcast: a full/lagging subscriber is dropped, never
    // allowed to stall the supervisor.
    let _ = inner.sender.send(new_state);
}

async fn probe_connectivity(config: &NetworkSupervisorConfig) -> NetworkState {
    let mut reachable = 0usize;
    for (host, port) in &config.check_hosts {
        let addr = format!("{host}:{port}");
        let Ok(socket_addrs) = tokio::net::lookup_host(&addr).await else {
            continue;
        };
        let Some(socket_addr): Option<SocketAddr> = socket_addrs.into_iter().next() else {
            continue;
        };
        let dial = tokio::time::timeout(config.check_timeout, TcpStream::connect(socket_addr));
        if let Ok(Ok(_)) = dial.await {
            reachable += 1;
        }
    }

    if reachable == config.check_hosts.len() {
        NetworkState::Up
    } else if reachable > 0 {
        NetworkState::Degraded
    } else {
        NetworkState::Down
    }
}

#[cfg(target_os = "linux")]
fn read_proc_net_dev() -> Option<HashMap<String, InterfaceStats>> {
    let content = std::fs::read_to_string("/proc/net/dev").ok()?;
    let mut out = HashMap::new();
    for line in content.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let parse = |s: &str| s.parse::<u64>().unwrap_or(0);
        out.insert(
            name.trim().to_string(),
            InterfaceStats {
                rx_bytes: parse(fields[0]),
                rx_packets: parse(fields[1]),
                tx_bytes: parse(fields[8]),
                tx_packets: parse(fields[9]),
            },
        );
    }
    Some(out)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_net_dev() -> Option<HashMap<String, InterfaceStats>> {
    None
}

impl Drop for NetworkSupervisor {
    fn drop(&mut self) {
        debug!("network supervisor dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_unknown() {
        let sup = NetworkSupervisor::new(NetworkSupervisorConfig::default());
        assert_eq!(sup.get_state(), NetworkState::Unknown);
        assert!(!sup.is_up());
    }

    #[tokio::test]
    async fn start_stop_is_idempotent_and_cancellable() {
        let sup = NetworkSupervisor::new(NetworkSupervisorConfig {
            check_interval: Duration::from_millis(10),
            ..Default::default()
        })
        .shared();
        sup.start().await;
        sup.start().await; // no-op second call
        tokio::time::sleep(Duration::from_millis(5)).await;
        sup.stop().await;
    }

    #[tokio::test]
    async fn subscribers_observe_state_changes() {
        let sup = NetworkSupervisor::new(NetworkSupervisorConfig::default());
        let mut rx = sup.subscribe();
        set_state(&sup.inner, NetworkState::Down);
        let observed = rx.recv().await.unwrap();
        assert_eq!(observed, NetworkState::Down);
    }

    #[tokio::test]
    async fn wait_for_network_resolves_on_up_transition() {
        let sup = Arc::new(NetworkSupervisor::new(NetworkSupervisorConfig::default()));
        set_state(&sup.inner, NetworkState::Down);
        let sup2 = sup.clone();
        let waiter = tokio::spawn(async move {
            let cancel = tokio_util::sync::CancellationToken::new();
            sup2.wait_for_network(&cancel).await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        set_state(&sup.inner, NetworkState::Up);
        waiter.await.unwrap();
    }

    #[test]
    fn same_state_updates_are_not_errors() {
        let sup = NetworkSupervisor::new(NetworkSupervisorConfig::default());
        set_state(&sup.inner, NetworkState::Up);
        set_state(&sup.inner, NetworkState::Up);
        assert_eq!(sup.get_state(), NetworkState::Up);
    }

    #[test]
    fn interface_stats_never_panics() {
        let sup = NetworkSupervisor::new(NetworkSupervisorConfig::default());
        let _ = sup.get_interface_stats();
    }
}
