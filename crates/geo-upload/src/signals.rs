//! Connectivity and lifecycle watchers.
//!
//! Both are plain watch channels owned by the composition root and injected
//! into the engine. Edge counters live inside the watched value so a quick
//! down/up flap is never coalesced away before a subscriber looks.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Reachability {
    connected: bool,
    rising_edges: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectivityWatcher {
    tx: Arc<watch::Sender<Reachability>>,
}

impl ConnectivityWatcher {
    pub fn new(connected: bool) -> Self {
        let (tx, _rx) = watch::channel(Reachability {
            connected,
            rising_edges: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn is_connected(&self) -> bool {
        self.tx.borrow().connected
    }

    /// Repeated reports of the current value are suppressed here.
    pub fn set_connected(&self, connected: bool) {
        self.tx.send_if_modified(|s| {
            if s.connected == connected {
                return false;
            }
            if connected {
                s.rising_edges = s.rising_edges.saturating_add(1);
                tracing::info!("network became reachable");
            } else {
                tracing::info!("network became unreachable");
            }
            s.connected = connected;
            true
        });
    }

    pub fn subscribe(&self) -> ReachableEdges {
        let rx = self.tx.subscribe();
        let seen = rx.borrow().rising_edges;
        ReachableEdges { rx, seen }
    }
}

/// Stream of unreachable -> reachable transitions.
#[derive(Debug)]
pub struct ReachableEdges {
    rx: watch::Receiver<Reachability>,
    seen: u64,
}

impl ReachableEdges {
    /// `None` once the watcher is gone.
    pub async fn next(&mut self) -> Option<()> {
        loop {
            let cur = *self.rx.borrow_and_update();
            if cur.rising_edges > self.seen {
                self.seen = cur.rising_edges;
                return Some(());
            }
            self.rx.changed().await.ok()?;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lifecycle {
    phase: AppPhase,
    activations: u64,
}

#[derive(Debug, Clone)]
pub struct LifecycleWatcher {
    tx: Arc<watch::Sender<Lifecycle>>,
}

impl LifecycleWatcher {
    pub fn new(phase: AppPhase) -> Self {
        let (tx, _rx) = watch::channel(Lifecycle {
            phase,
            activations: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn phase(&self) -> AppPhase {
        self.tx.borrow().phase
    }

    pub fn is_foreground(&self) -> bool {
        self.phase() == AppPhase::Foreground
    }

    /// Process became foreground-active. Every call is an event.
    pub fn activate(&self) {
        self.tx.send_modify(|s| {
            s.phase = AppPhase::Foreground;
            s.activations = s.activations.saturating_add(1);
        });
    }

    pub fn enter_background(&self) {
        self.tx.send_if_modified(|s| {
            let changed = s.phase != AppPhase::Background;
            s.phase = AppPhase::Background;
            changed
        });
    }

    pub fn subscribe(&self) -> Activations {
        let rx = self.tx.subscribe();
        let seen = rx.borrow().activations;
        Activations { rx, seen }
    }
}

#[derive(Debug)]
pub struct Activations {
    rx: watch::Receiver<Lifecycle>,
    seen: u64,
}

impl Activations {
    pub async fn next(&mut self) -> Option<()> {
        loop {
            let cur = *self.rx.borrow_and_update();
            if cur.activations > self.seen {
                self.seen = cur.activations;
                return Some(());
            }
            self.rx.changed().await.ok()?;
        }
    }
}

/// Feeds `watcher` from periodic TCP connects to `addr`.
pub fn spawn_tcp_probe(
    watcher: ConnectivityWatcher,
    addr: String,
    interval: Duration,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(100));
    tokio::spawn(async move {
        loop {
            let reachable = matches!(
                tokio::time::timeout(interval, TcpStream::connect(addr.as_str())).await,
                Ok(Ok(_))
            );
            tracing::trace!(%addr, reachable, "connectivity probe");
            watcher.set_connected(reachable);
            tokio::time::sleep(interval).await;
        }
    })
}
