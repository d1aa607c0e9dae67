/// One-shot discovery handshake.
///
/// Listens on the discovery port (default 5005) for a broadcast hello from the
/// handheld. A payload containing `HELLO_PC` is answered with `HELLO_3DS`
/// (sent to the sender's IP on the reply port) and the sender becomes the new
/// peer endpoint, persisted to settings.
///
/// State machine: Idle -> Listening -> (Completed | Mismatch | TimedOut |
/// Cancelled | BindFailed | ReceiveFailed | TaskFailed) -> Idle. At most one
/// handshake is in flight; a trigger while Listening is ignored. The wait runs
/// on a tokio task, never on the realtime thread, and is bounded by a timeout
/// and a cancellation token.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ncmidi_protocol::log_queue::LogQueue;
use ncmidi_protocol::{is_hello, DISCOVERY_BUFFER_SIZE, HELLO_ACK};

use crate::config::BridgeConfig;
use crate::error::{SocketRole, TransportError};
use crate::peer::{PeerEndpoint, SharedPeer};
use crate::settings::{SettingsStore, KEY_PEER_IP};
use crate::transport::bind_udp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryState {
    Idle = 0,
    Listening = 1,
}

impl DiscoveryState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Listening,
            _ => Self::Idle,
        }
    }
}

/// How a handshake attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Hello received and acknowledged; carries the published peer address
    Completed(Ipv4Addr),
    /// A datagram arrived without the hello marker; no reply sent
    Mismatch,
    TimedOut,
    Cancelled,
    BindFailed,
    ReceiveFailed,
    /// The handshake task panicked
    TaskFailed,
}

/// Everything a handshake needs, passed explicitly instead of living in a global.
pub struct DiscoveryContext {
    /// Listen address of the discovery socket
    pub listen: SocketAddrV4,
    /// Port on the peer that receives the acknowledgment
    pub reply_port: u16,
    /// Port published with the discovered peer address
    pub peer_port: u16,
    /// None = wait until a datagram arrives or the attempt is cancelled
    pub timeout: Option<Duration>,
    pub peer: SharedPeer,
    pub settings: Arc<dyn SettingsStore>,
    pub log: Arc<LogQueue>,
}

impl DiscoveryContext {
    pub fn from_config(
        config: &BridgeConfig,
        peer: SharedPeer,
        settings: Arc<dyn SettingsStore>,
        log: Arc<LogQueue>,
    ) -> Self {
        let timeout = match config.discovery.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Self {
            listen: config.network.discovery_addr(),
            reply_port: config.network.discovery_reply_port,
            peer_port: config.network.peer_port,
            timeout,
            peer,
            settings,
            log,
        }
    }
}

/// Returns the state to Idle when the task ends, however it ends.
struct ListeningGuard(Arc<AtomicU8>);

impl Drop for ListeningGuard {
    fn drop(&mut self) {
        self.0.store(DiscoveryState::Idle as u8, Ordering::Release);
    }
}

pub struct Discovery {
    ctx: Arc<DiscoveryContext>,
    state: Arc<AtomicU8>,
    current: Mutex<Option<CancellationToken>>,
}

impl Discovery {
    pub fn new(ctx: DiscoveryContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            state: Arc::new(AtomicU8::new(DiscoveryState::Idle as u8)),
            current: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        DiscoveryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Begin a handshake on `runtime`. Returns None if one is already listening.
    pub fn start(&self, runtime: &Handle) -> Option<DiscoveryHandle> {
        if self
            .state
            .compare_exchange(
                DiscoveryState::Idle as u8,
                DiscoveryState::Listening as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("Discovery already in progress, trigger ignored");
            return None;
        }

        self.ctx.log.push("Listening for peer broadcast signal ...");

        let cancel = CancellationToken::new();
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(cancel.clone());

        let (bound_tx, bound_rx) = watch::channel(None);
        let guard = ListeningGuard(Arc::clone(&self.state));
        let ctx = Arc::clone(&self.ctx);
        let token = cancel.clone();

        let join = runtime.spawn(async move {
            let _guard = guard;
            run(&ctx, &token, bound_tx).await
        });

        Some(DiscoveryHandle {
            cancel,
            join,
            bound: bound_rx,
        })
    }

    /// Abort the in-flight handshake, if any.
    pub fn cancel(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(token) = current {
            token.cancel();
        }
    }
}

/// Handle to one handshake attempt. Dropping it leaves the task running
/// until its timeout; call `cancel()` to stop it early.
pub struct DiscoveryHandle {
    cancel: CancellationToken,
    join: JoinHandle<DiscoveryOutcome>,
    bound: watch::Receiver<Option<SocketAddr>>,
}

impl DiscoveryHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Address the discovery socket is bound to, once bound.
    /// None if binding failed.
    pub async fn listening_addr(&mut self) -> Option<SocketAddr> {
        match self.bound.wait_for(|addr| addr.is_some()).await {
            Ok(addr) => *addr,
            Err(_) => None,
        }
    }

    pub async fn wait(self) -> DiscoveryOutcome {
        outcome_of(self.join.await)
    }
}

fn outcome_of(joined: Result<DiscoveryOutcome, JoinError>) -> DiscoveryOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => DiscoveryOutcome::Cancelled,
        Err(e) => {
            error!(error = %e, "Discovery task failed");
            DiscoveryOutcome::TaskFailed
        }
    }
}

async fn run(
    ctx: &DiscoveryContext,
    cancel: &CancellationToken,
    bound: watch::Sender<Option<SocketAddr>>,
) -> DiscoveryOutcome {
    let port = ctx.listen.port();
    let socket = match bind_udp(ctx.listen, true, true).and_then(UdpSocket::from_std) {
        Ok(s) => s,
        Err(source) => {
            let e = TransportError::Bind {
                role: SocketRole::Discovery,
                addr: SocketAddr::V4(ctx.listen),
                source,
            };
            error!(error = %e, "Discovery unavailable");
            ctx.log.push(format!("Failed to bind to port {}", port));
            return DiscoveryOutcome::BindFailed;
        }
    };

    let local = socket.local_addr().ok();
    info!(addr = ?local, timeout = ?ctx.timeout, "Discovery listening for hello broadcast");
    let _ = bound.send(local);

    let mut buf = [0u8; DISCOVERY_BUFFER_SIZE];
    let received = {
        let wait = async {
            match ctx.timeout {
                Some(limit) => tokio::time::timeout(limit, socket.recv_from(&mut buf))
                    .await
                    .ok(),
                None => Some(socket.recv_from(&mut buf).await),
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Discovery cancelled");
                return DiscoveryOutcome::Cancelled;
            }
            r = wait => r,
        }
    };

    let (len, src) = match received {
        Some(Ok(r)) => r,
        Some(Err(e)) => {
            warn!(error = %e, "Discovery receive failed");
            ctx.log.push("No broadcast received.");
            return DiscoveryOutcome::ReceiveFailed;
        }
        None => {
            info!("Discovery timed out");
            ctx.log.push("No broadcast received.");
            return DiscoveryOutcome::TimedOut;
        }
    };

    let IpAddr::V4(sender_ip) = src.ip() else {
        debug!(from = %src, "Ignoring non-IPv4 discovery datagram");
        return DiscoveryOutcome::Mismatch;
    };

    if !is_hello(&buf[..len]) {
        info!(from = %src, len, "Discovery datagram without hello marker");
        ctx.log.push(format!("Ignored discovery datagram from {}", sender_ip));
        return DiscoveryOutcome::Mismatch;
    }

    info!(from = %src, "Hello received from peer");

    let reply_to = SocketAddrV4::new(sender_ip, ctx.reply_port);
    if let Err(e) = socket.send_to(HELLO_ACK, reply_to).await {
        warn!(to = %reply_to, error = %e, "Failed to send discovery acknowledgment");
    }

    ctx.peer.store(PeerEndpoint::new(sender_ip, ctx.peer_port));
    ctx.settings.set_string(KEY_PEER_IP, &sender_ip.to_string());
    if let Err(e) = ctx.settings.save() {
        warn!(error = %e, "Failed to persist discovered peer address");
    }
    ctx.log.push(format!("Found peer IP-Address {}", sender_ip));

    DiscoveryOutcome::Completed(sender_ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;

    const PLACEHOLDER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 0);

    struct Fixture {
        discovery: Discovery,
        peer: SharedPeer,
        settings: Arc<MemorySettings>,
        log: Arc<LogQueue>,
        /// Plays the handheld; receives the acknowledgment
        device: UdpSocket,
    }

    async fn fixture(timeout: Option<Duration>) -> Fixture {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reply_port = device.local_addr().unwrap().port();

        let peer = SharedPeer::new(PeerEndpoint::new(PLACEHOLDER, 9001));
        let settings = Arc::new(MemorySettings::new());
        let log = Arc::new(LogQueue::new(32));

        let ctx = DiscoveryContext {
            listen: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            reply_port,
            peer_port: 9001,
            timeout,
            peer: peer.clone(),
            settings: settings.clone(),
            log: Arc::clone(&log),
        };

        Fixture {
            discovery: Discovery::new(ctx),
            peer,
            settings,
            log,
            device,
        }
    }

    #[tokio::test]
    async fn hello_is_acknowledged_and_published() {
        let f = fixture(Some(Duration::from_secs(5))).await;
        let mut handle = f.discovery.start(&Handle::current()).unwrap();
        assert_eq!(f.discovery.state(), DiscoveryState::Listening);

        let addr = handle.listening_addr().await.unwrap();
        f.device.send_to(b"HELLO_PC", addr).await.unwrap();

        let outcome = handle.wait().await;
        assert_eq!(outcome, DiscoveryOutcome::Completed(Ipv4Addr::LOCALHOST));

        let mut buf = [0u8; 32];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), f.device.recv_from(&mut buf))
            .await
            .expect("acknowledgment should arrive")
            .unwrap();
        assert_eq!(&buf[..len], b"HELLO_3DS");

        assert_eq!(f.peer.load(), PeerEndpoint::new(Ipv4Addr::LOCALHOST, 9001));
        assert_eq!(f.settings.get_string(KEY_PEER_IP).as_deref(), Some("127.0.0.1"));
        assert_eq!(f.discovery.state(), DiscoveryState::Idle);

        let lines = f.log.drain();
        assert_eq!(lines.first().map(String::as_str), Some("Listening for peer broadcast signal ..."));
        assert_eq!(lines.last().map(String::as_str), Some("Found peer IP-Address 127.0.0.1"));
    }

    #[tokio::test]
    async fn payload_without_marker_is_ignored() {
        let f = fixture(Some(Duration::from_secs(5))).await;
        let mut handle = f.discovery.start(&Handle::current()).unwrap();
        let addr = handle.listening_addr().await.unwrap();
        f.device.send_to(b"HELLO_XX", addr).await.unwrap();

        assert_eq!(handle.wait().await, DiscoveryOutcome::Mismatch);

        let mut buf = [0u8; 32];
        let reply =
            tokio::time::timeout(Duration::from_millis(200), f.device.recv_from(&mut buf)).await;
        assert!(reply.is_err(), "no acknowledgment on mismatch");

        assert_eq!(f.peer.load().ip, PLACEHOLDER);
        assert_eq!(f.settings.get_string(KEY_PEER_IP), None);
        assert_eq!(f.discovery.state(), DiscoveryState::Idle);
    }

    #[tokio::test]
    async fn second_trigger_while_listening_is_ignored() {
        let f = fixture(None).await;
        let mut first = f.discovery.start(&Handle::current()).unwrap();
        first.listening_addr().await.unwrap();

        assert!(f.discovery.start(&Handle::current()).is_none());

        f.discovery.cancel();
        assert_eq!(first.wait().await, DiscoveryOutcome::Cancelled);
        assert_eq!(f.discovery.state(), DiscoveryState::Idle);

        // A fresh attempt is possible afterwards
        let again = f.discovery.start(&Handle::current()).unwrap();
        again.cancel();
        assert_eq!(again.wait().await, DiscoveryOutcome::Cancelled);
    }

    #[tokio::test]
    async fn times_out_without_hello() {
        let f = fixture(Some(Duration::from_millis(50))).await;
        let handle = f.discovery.start(&Handle::current()).unwrap();
        assert_eq!(handle.wait().await, DiscoveryOutcome::TimedOut);
        assert_eq!(f.discovery.state(), DiscoveryState::Idle);
        assert_eq!(f.peer.load().ip, PLACEHOLDER);
        assert!(f.log.drain().contains(&"No broadcast received.".to_string()));
    }

    #[tokio::test]
    async fn bind_failure_returns_to_idle() {
        // Held without SO_REUSEADDR, so the discovery bind fails
        let holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let mut f = fixture(Some(Duration::from_millis(200))).await;
        Arc::get_mut(&mut f.discovery.ctx).unwrap().listen =
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);

        let mut handle = f.discovery.start(&Handle::current()).unwrap();
        let bound = handle.listening_addr().await;
        let outcome = handle.wait().await;

        // Some platforms share unicast UDP ports under SO_REUSEADDR
        if outcome == DiscoveryOutcome::BindFailed {
            assert!(bound.is_none());
            assert!(f
                .log
                .drain()
                .contains(&format!("Failed to bind to port {}", port)));
        }
        assert_eq!(f.discovery.state(), DiscoveryState::Idle);
        assert_eq!(f.peer.load().ip, PLACEHOLDER);
    }

    #[tokio::test]
    async fn panicked_task_is_not_reported_as_cancel() {
        let panicked = tokio::spawn(async {
            if true {
                panic!("handshake task crashed");
            }
            DiscoveryOutcome::TimedOut
        })
        .await;
        assert_eq!(outcome_of(panicked), DiscoveryOutcome::TaskFailed);

        let aborted = tokio::spawn(async {
            std::future::pending::<()>().await;
            DiscoveryOutcome::TimedOut
        });
        aborted.abort();
        assert_eq!(outcome_of(aborted.await), DiscoveryOutcome::Cancelled);
    }
}
