//! Exponential backoff for re-establishing the agent's control connection.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::AgentError;

#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// 0 means retry forever.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 0,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 1.5,
        }
    }
}

/// Backoff bookkeeping. Each scheduled attempt hands out the current delay and grows the next
/// one by `multiplier`, capped at `max_delay`.
#[derive(Debug)]
pub struct ReconnectionManager {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
}

impl ReconnectionManager {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay,
        }
    }

    /// Delay before the next attempt, or `None` once disabled or out of attempts.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.config.enabled {
            return None;
        }
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current_delay;
        self.current_delay = self
            .current_delay
            .mul_f64(self.config.multiplier)
            .min(self.config.max_delay);
        Some(delay)
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

/// A live connection; `closed` resolves when the transport drops.
#[async_trait]
pub trait Connection: Send + 'static {
    async fn closed(&mut self) -> String;
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(&self) -> Result<Self::Conn, AgentError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting { attempt: u32 },
    Connected,
    Waiting { attempt: u32, delay: Duration },
    Disconnected { reason: String },
    GaveUp { attempts: u32 },
    Stopped,
}

/// Owner of a running reconnect loop.
pub struct ReconnectHandle {
    state: watch::Receiver<LinkState>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconnectHandle {
    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Stop reconnecting and drop the current connection.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(target: "reconnect", %err, "reconnect loop aborted");
        }
    }
}

pub struct ReconnectLoop;

impl ReconnectLoop {
    /// Connect now, then reconnect with backoff every time the connection closes or a connect
    /// fails, until `shutdown` fires or attempts run out.
    pub fn spawn<C: Connector>(
        connector: C,
        config: ReconnectConfig,
        shutdown: CancellationToken,
    ) -> ReconnectHandle {
        let (tx, rx) = watch::channel(LinkState::Connecting { attempt: 0 });
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let mut backoff = ReconnectionManager::new(config);
            loop {
                let _ = tx.send(LinkState::Connecting {
                    attempt: backoff.attempts(),
                });
                let connected = tokio::select! {
                    _ = token.cancelled() => break,
                    result = connector.connect() => result,
                };
                match connected {
                    Ok(mut conn) => {
                        backoff.reset();
                        let _ = tx.send(LinkState::Connected);
                        info!(target: "reconnect", "control link connected");
                        let reason = tokio::select! {
                            _ = token.cancelled() => break,
                            reason = conn.closed() => reason,
                        };
                        warn!(target: "reconnect", %reason, "control link closed");
                        let _ = tx.send(LinkState::Disconnected { reason });
                    }
                    Err(err) => {
                        warn!(target: "reconnect", attempt = backoff.attempts(), %err, "connect failed");
                    }
                }

                let Some(delay) = backoff.next_delay() else {
                    warn!(target: "reconnect", attempts = backoff.attempts(), "giving up on reconnect");
                    let _ = tx.send(LinkState::GaveUp {
                        attempts: backoff.attempts(),
                    });
                    return;
                };
                debug!(
                    target: "reconnect",
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                let _ = tx.send(LinkState::Waiting {
                    attempt: backoff.attempts(),
                    delay,
                });
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let _ = tx.send(LinkState::Stopped);
            debug!(target: "reconnect", "reconnect loop stopped");
        });
        ReconnectHandle {
            state: rx,
            shutdown,
            task,
        }
    }
}
