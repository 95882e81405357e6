//! Broker: WebSocket server relaying between clients and agents.
//!
//! [`Broker::listen`] claims the port's cross-process lock, binds, and spawns
//! an accept loop plus the router task. Each accepted connection gets a
//! reader (feeding [`BrokerEvent`]s to the router) and a writer (draining the
//! session's outbound queue). [`Broker::close`] may be called at any time,
//! including while a listen is still acquiring the lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tabbridge_types::config::BrokerConfig;
use tabbridge_types::{BridgeError, BridgeResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::credentials::Authenticator;
use crate::lock::PortLock;
use crate::router::{BrokerEvent, BrokerStats, Router};
use crate::session::{write_outbound, Outbound, SessionId};

enum ListenState {
    Idle,
    /// Waiting on the port lock. Setting the flag cancels the attempt.
    Acquiring { cancelled: Arc<AtomicBool> },
    Listening(Running),
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    _lock: PortLock,
}

/// Read-only view of broker counters.
#[derive(Clone)]
pub struct BrokerHandle {
    stats: Arc<BrokerStats>,
}

impl BrokerHandle {
    pub fn agent_count(&self) -> usize {
        self.stats.agent_count()
    }

    pub fn client_count(&self) -> usize {
        self.stats.client_count()
    }

    pub fn pending_count(&self) -> usize {
        self.stats.pending_count()
    }

    pub fn subscription_count(&self) -> usize {
        self.stats.subscription_count()
    }
}

pub struct Broker {
    config: BrokerConfig,
    authenticator: Arc<Authenticator>,
    state: Mutex<ListenState>,
    stats: Arc<BrokerStats>,
}

impl Broker {
    pub fn new(config: BrokerConfig, authenticator: Authenticator) -> Self {
        Self {
            config,
            authenticator: Arc::new(authenticator),
            state: Mutex::new(ListenState::Idle),
            stats: Arc::new(BrokerStats::default()),
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Address actually bound, while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().unwrap_or_else(|e| e.into_inner()) {
            ListenState::Listening(running) => Some(running.local_addr),
            _ => None,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Claim the port lock, bind the configured address and start serving.
    pub async fn listen(&self) -> BridgeResult<SocketAddr> {
        let addr = self.config.socket_addr()?;
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(*state, ListenState::Idle) {
                return Err(BridgeError::Config("broker is already listening".to_string()));
            }
            *state = ListenState::Acquiring {
                cancelled: Arc::clone(&cancelled),
            };
        }

        let lock_dir = self.config.lock_dir();
        let port = addr.port();
        let lock = tokio::task::spawn_blocking(move || PortLock::acquire(&lock_dir, port))
            .await
            .map_err(|e| BridgeError::Lock(format!("lock task failed: {e}")))
            .and_then(|r| r);
        // A close while the lock was pending wins over the lock outcome.
        if cancelled.load(Ordering::SeqCst) {
            self.reset_to_idle();
            info!(port, "Listen cancelled by close while acquiring lock");
            return Err(BridgeError::Cancelled("broker closed during listen".to_string()));
        }
        let lock = match lock {
            Ok(lock) => lock,
            Err(e) => {
                self.reset_to_idle();
                warn!(port, error = %e, "Listen failed: port lock unavailable");
                return Err(e);
            }
        };

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.reset_to_idle();
                return Err(BridgeError::Io(e));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(e) => {
                self.reset_to_idle();
                return Err(BridgeError::Io(e));
            }
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if cancelled.load(Ordering::SeqCst) {
            *state = ListenState::Idle;
            info!(port, "Listen cancelled by close before serving");
            return Err(BridgeError::Cancelled("broker closed during listen".to_string()));
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router = Router::new(
            self.config.clone(),
            Arc::clone(&self.authenticator),
            Arc::clone(&self.stats),
        );
        let router_task = tokio::spawn(run_router(router, events_rx, shutdown_rx.clone()));
        let accept_task = tokio::spawn(accept_loop(listener, events_tx, shutdown_rx));

        *state = ListenState::Listening(Running {
            local_addr,
            shutdown: shutdown_tx,
            tasks: vec![router_task, accept_task],
            _lock: lock,
        });
        info!(addr = %local_addr, "Broker listening");
        Ok(local_addr)
    }

    fn reset_to_idle(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ListenState::Idle;
    }

    /// Stop accepting, close every session and release the port lock.
    pub async fn close(&self) {
        let running = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, ListenState::Idle) {
                ListenState::Idle => return,
                ListenState::Acquiring { cancelled } => {
                    cancelled.store(true, Ordering::SeqCst);
                    *state = ListenState::Acquiring { cancelled };
                    return;
                }
                ListenState::Listening(running) => running,
            }
        };
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Broker task failed during shutdown");
            }
        }
        info!(addr = %running.local_addr, "Broker closed");
    }
}

async fn run_router(
    mut router: Router,
    mut events: mpsc::UnboundedReceiver<BrokerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => router.handle(event),
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    router.shutdown();
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<BrokerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let next_session = AtomicU64::new(1);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let session = SessionId(next_session.fetch_add(1, Ordering::Relaxed));
                    debug!(%session, %addr, "Accepted connection");
                    let events = events.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, session, events, shutdown).await {
                            debug!(%session, %addr, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    session: SessionId,
    events: mpsc::UnboundedSender<BrokerEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> BridgeResult<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| BridgeError::Connection(format!("websocket handshake failed: {e}")))?;
    let (sink, mut source) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();

    if events
        .send(BrokerEvent::Opened {
            session,
            addr,
            outbound: out_tx,
        })
        .is_err()
    {
        return Ok(());
    }

    let writer = tokio::spawn(write_outbound(sink, out_rx));

    loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if events.send(BrokerEvent::Text { session, text: text.to_string() }).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let _ = events.send(BrokerEvent::Binary { session });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%session, error = %e, "Read error");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    let _ = events.send(BrokerEvent::Closed { session });
    // The writer finishes once the router drops this session's sender.
    let _ = writer.await;
    Ok(())
}
