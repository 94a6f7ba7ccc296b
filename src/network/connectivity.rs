use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Connected,
    Disconnected,
    Reconnecting,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Connected)
    }
}

/// Network availability as seen by the host.
///
/// Receivers returned by `subscribe` are notified only when the state
/// actually changes; dropping the receiver unsubscribes.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;

    fn subscribe(&self) -> watch::Receiver<ConnectivityState>;
}

/// Host-driven connectivity signal.
///
/// Hosts with their own network events (OS reachability callbacks, a UI
/// toggle) forward them through `set_online`; the probing
/// [`ConnectivityMonitor`] publishes through one of these as well.
#[derive(Clone)]
pub struct ConnectivitySignal {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivitySignal {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::new(ConnectivityState::Connected)
    }

    pub fn offline() -> Self {
        Self::new(ConnectivityState::Disconnected)
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Publish `state`. Returns true if it differs from the previous one.
    pub fn set(&self, state: ConnectivityState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    pub fn set_online(&self, online: bool) -> bool {
        self.set(if online {
            ConnectivityState::Connected
        } else {
            ConnectivityState::Disconnected
        })
    }
}

impl Connectivity for ConnectivitySignal {
    fn is_online(&self) -> bool {
        self.state().is_online()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

/// Periodically probes a TCP endpoint and publishes the result.
pub struct ConnectivityMonitor {
    signal: ConnectivitySignal,
    target: String,
    interval: Duration,
    probe_timeout: Duration,
}

impl ConnectivityMonitor {
    pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new<T: Into<String>>(target: T, interval: Duration) -> Self {
        Self {
            signal: ConnectivitySignal::offline(),
            target: target.into(),
            interval,
            probe_timeout: Self::DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Handle to the published state; stays valid after `run` takes the
    /// monitor.
    pub fn signal(&self) -> ConnectivitySignal {
        self.signal.clone()
    }

    pub async fn run(self) {
        let mut reconnecting = false;

        loop {
            let ok = Self::check_once(&self.target, self.probe_timeout).await;

            let new_state = if ok {
                reconnecting = false;
                ConnectivityState::Connected
            } else if reconnecting {
                ConnectivityState::Reconnecting
            } else {
                reconnecting = true;
                ConnectivityState::Disconnected
            };

            if self.signal.set(new_state) {
                log::info!("Connectivity to {} is now {:?}", self.target, new_state);
            }

            sleep(self.interval).await;
        }
    }

    /// Single probe: can a TCP connection to `target` be opened in time?
    pub async fn check_once(target: &str, probe_timeout: Duration) -> bool {
        matches!(
            timeout(probe_timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        self.signal.is_online()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.signal.subscribe()
    }
}
