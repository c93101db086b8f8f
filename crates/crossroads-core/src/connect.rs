//! Connection establishment with bounded retry.
//!
//! The simulator needs a moment after launch before it listens on the
//! control port. [`establish`] dials up to `max_attempts` times with a
//! linear backoff; only "not listening yet" is retried. Once connected,
//! the entity subscriptions are registered exactly once for that
//! connection.

use std::time::Duration;

use crossroads_traci::{Connector, ControlClient, ProtocolError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::telemetry::Topology;

/// Errors from [`establish`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Every attempt found nothing listening.
    #[error("control port unreachable after {attempts} attempts: {last}")]
    ConnectionFailed {
        /// Attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last: ProtocolError,
    },

    /// A non-retryable failure (handshake, version, registration).
    #[error("control connection failed: {source}")]
    Fatal {
        /// The underlying protocol error.
        #[from]
        source: ProtocolError,
    },

    /// A stop request arrived while waiting to retry.
    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Attempt count and backoff for [`establish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least 1.
    pub max_attempts: u32,
    /// Attempt `n` (1-based) is followed by a `n * base_delay` pause.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Policy from configuration.
    pub const fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }

    /// Pause after failed attempt `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// A control connection plus what was registered on it.
pub struct Connection {
    client: Box<dyn ControlClient>,
    topology: Option<Topology>,
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("registered", &self.topology.is_some())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap a freshly connected client. Nothing is registered yet.
    pub fn new(client: Box<dyn ControlClient>) -> Self {
        Self {
            client,
            topology: None,
        }
    }

    /// Register entity subscriptions unless already done on this
    /// connection, and return the topology.
    pub async fn ensure_registered(&mut self) -> Result<&Topology, ProtocolError> {
        if self.topology.is_none() {
            let topology = Topology::register(self.client.as_mut()).await?;
            self.topology = Some(topology);
        }
        self.topology
            .as_ref()
            .ok_or_else(|| ProtocolError::Malformed(String::from("registration produced no topology")))
    }

    /// Registered topology, if any.
    pub const fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    /// The client and the topology together, for snapshot assembly.
    pub fn parts(&mut self) -> (&mut dyn ControlClient, Option<&Topology>) {
        (self.client.as_mut(), self.topology.as_ref())
    }

    /// The underlying client.
    pub fn client_mut(&mut self) -> &mut dyn ControlClient {
        self.client.as_mut()
    }
}

/// Connect to `port`, retrying while nothing is listening, then register
/// subscriptions.
pub async fn establish(
    connector: &dyn Connector,
    port: u16,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Connection, ConnectError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    let client = loop {
        attempt = attempt.saturating_add(1);
        match connector.connect(port).await {
            Ok(client) => break client,
            Err(e) if !e.is_retryable() => return Err(ConnectError::Fatal { source: e }),
            Err(e) if attempt >= attempts => {
                warn!(port, attempt, error = %e, "control port unreachable, giving up");
                return Err(ConnectError::ConnectionFailed { attempts: attempt, last: e });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    port,
                    attempt,
                    max_attempts = attempts,
                    retry_in_ms = delay.as_millis(),
                    error = %e,
                    "control port not ready"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(ConnectError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    };
    info!(port, attempt, "control connection established");

    let mut connection = Connection::new(client);
    connection.ensure_registered().await?;
    Ok(connection)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::telemetry::tests::CacheClient;

    /// Connector that fails with a scripted error a fixed number of times.
    pub(crate) struct ScriptedConnector {
        pub calls: Arc<AtomicU32>,
        pub refuse_first: u32,
        pub fatal: bool,
    }

    impl ScriptedConnector {
        pub(crate) fn refusing(refuse_first: u32) -> Self {
            Self {
                calls: Arc::new(AtomicU32::new(0)),
                refuse_first,
                fatal: false,
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, port: u16) -> Result<Box<dyn ControlClient>, ProtocolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(ProtocolError::VersionMismatch {
                    found: 1,
                    minimum: 18,
                });
            }
            if n < self.refuse_first {
                return Err(ProtocolError::NotListening {
                    port,
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                });
            }
            Ok(Box::new(CacheClient::default()))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_port_fails_after_exactly_max_attempts() {
        let connector = ScriptedConnector::refusing(u32::MAX);
        let err = establish(&connector, 8813, policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::ConnectionFailed { attempts: 3, .. }));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_linear_between_attempts() {
        let connector = ScriptedConnector::refusing(u32::MAX);
        let started = tokio::time::Instant::now();
        let _ = establish(&connector, 8813, policy(), &CancellationToken::new()).await;
        // 500 ms after attempt 1, 1000 ms after attempt 2, none after 3.
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_listening_and_registers() {
        let connector = ScriptedConnector::refusing(2);
        let connection = establish(&connector, 8813, policy(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert!(connection.topology().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn version_mismatch_is_not_retried() {
        let connector = ScriptedConnector {
            fatal: true,
            ..ScriptedConnector::refusing(0)
        };
        let err = establish(&connector, 8813, policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Fatal { .. }));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let connector = ScriptedConnector::refusing(u32::MAX);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = establish(&connector, 8813, policy(), &cancel).await.unwrap_err();
        assert!(matches!(err, ConnectError::Cancelled));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registration_is_idempotent_per_connection() {
        let mut client = CacheClient::default();
        client
            .ids
            .insert(crossroads_traci::Domain::TrafficLight, vec![String::from("J1")]);
        let calls = Arc::clone(&client.subscribe_calls);

        let mut connection = Connection::new(Box::new(client));
        connection.ensure_registered().await.unwrap();
        connection.ensure_registered().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            connection.topology().map(|t| t.traffic_lights.len()),
            Some(1)
        );
    }
}
