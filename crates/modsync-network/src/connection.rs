//! Connection establishment with bounded retry

use modsync_types::{Error, ErrorKind, RemoteClient, Result, RetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connect `client`, retrying transient failures with backoff
///
/// A permanent rejection aborts at once. Connection-level and transient failures
/// are retried up to `retry.max_retries` times; after that the last failure is
/// returned as a connection fault.
pub async fn connect_with_retry(
    client: &mut dyn RemoteClient,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let error = match client.connect().await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        if !error.is_recoverable() {
            debug!("Connect failed permanently: {}", error);
            return Err(error);
        }

        if attempt >= retry.max_retries {
            return Err(Error::connection(format!(
                "giving up after {} attempts: {}",
                attempt + 1,
                error
            )));
        }

        let delay = retry.delay_for_attempt(attempt);
        attempt += 1;
        warn!(
            "Connect attempt {}/{} failed: {}; retrying in {:?}",
            attempt,
            retry.max_retries + 1,
            error,
            delay
        );

        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// A worker's long-lived connection
///
/// Owns one client for the worker's lifetime and reconnects it on demand after a
/// failure marked it broken.
pub struct ManagedConnection {
    worker_id: usize,
    client: Box<dyn RemoteClient>,
    retry: RetryConfig,
    connects: u32,
}

impl ManagedConnection {
    /// Wrap a fresh client
    pub fn new(worker_id: usize, client: Box<dyn RemoteClient>, retry: RetryConfig) -> Self {
        Self {
            worker_id,
            client,
            retry,
            connects: 0,
        }
    }

    /// Make sure the client is usable, reconnecting if needed
    pub async fn ensure_connected(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.client.is_connected() {
            return Ok(());
        }
        connect_with_retry(self.client.as_mut(), &self.retry, cancel).await?;
        self.connects += 1;
        if self.connects > 1 {
            info!("Worker {} reconnected", self.worker_id);
        }
        Ok(())
    }

    /// The underlying client
    pub fn client(&mut self) -> &mut dyn RemoteClient {
        self.client.as_mut()
    }

    /// Drop the connection after a failure so the next use reconnects
    pub async fn mark_broken(&mut self, cause: &Error) {
        if matches!(cause.kind(), ErrorKind::Connection | ErrorKind::TransientIo) {
            if let Err(error) = self.client.disconnect().await {
                debug!("Worker {} disconnect failed: {}", self.worker_id, error);
            }
        }
    }

    /// Number of successful connects so far
    pub fn connect_count(&self) -> u32 {
        self.connects
    }

    /// Close the connection
    pub async fn close(mut self) {
        if self.client.is_connected() {
            if let Err(error) = self.client.disconnect().await {
                debug!("Worker {} disconnect failed: {}", self.worker_id, error);
            }
        }
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("worker_id", &self.worker_id)
            .field("connected", &self.client.is_connected())
            .field("connects", &self.connects)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use modsync_types::{RemoteEntry, RemoteStat, RemoteStream};
    use std::collections::VecDeque;

    /// Client whose connect results are scripted
    struct ScriptedClient {
        script: VecDeque<Result<()>>,
        connected: bool,
        attempts: u32,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<()>>) -> Self {
            Self {
                script: script.into(),
                connected: false,
                attempts: 0,
            }
        }
    }

    #[async_trait]
    impl RemoteClient for ScriptedClient {
        async fn connect(&mut self) -> Result<()> {
            self.attempts += 1;
            let outcome = self.script.pop_front().unwrap_or(Ok(()));
            self.connected = outcome.is_ok();
            outcome
        }
        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
        async fn list_directory(&mut self, _path: &str) -> Result<Vec<RemoteEntry>> {
            Ok(Vec::new())
        }
        async fn open_read_range(
            &mut self,
            _path: &str,
            _start: u64,
            _end: u64,
        ) -> Result<RemoteStream> {
            Err(Error::other("unused"))
        }
        async fn stat(&mut self, _path: &str) -> Result<RemoteStat> {
            Ok(RemoteStat { size: 0 })
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mut client = ScriptedClient::new(vec![
            Err(Error::server_reply(421, "too many connections")),
            Err(Error::transient("timed out")),
            Ok(()),
        ]);
        let result =
            connect_with_retry(&mut client, &RetryConfig::immediate(3), &CancellationToken::new())
                .await;
        assert!(result.is_ok());
        assert_eq!(client.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_not_retried() {
        let mut client =
            ScriptedClient::new(vec![Err(Error::server_reply(530, "login incorrect"))]);
        let error =
            connect_with_retry(&mut client, &RetryConfig::immediate(3), &CancellationToken::new())
                .await
                .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Protocol);
        assert_eq!(client.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_bound_is_respected() {
        let mut client = ScriptedClient::new(vec![
            Err(Error::connection("refused")),
            Err(Error::connection("refused")),
            Err(Error::connection("refused")),
        ]);
        let error =
            connect_with_retry(&mut client, &RetryConfig::immediate(2), &CancellationToken::new())
                .await
                .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Connection);
        assert_eq!(client.attempts, 3);
        assert!(error.to_string().contains("giving up after 3 attempts"));
    }

    #[tokio::test]
    async fn test_cancelled_before_connect() {
        let mut client = ScriptedClient::new(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = connect_with_retry(&mut client, &RetryConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(error.is_cancellation());
        assert_eq!(client.attempts, 0);
    }

    #[tokio::test]
    async fn test_managed_connection_reconnects_after_break() {
        let client = ScriptedClient::new(vec![]);
        let mut connection = ManagedConnection::new(0, Box::new(client), RetryConfig::immediate(1));
        let cancel = CancellationToken::new();

        connection.ensure_connected(&cancel).await.unwrap();
        connection.mark_broken(&Error::transient("reset")).await;
        assert!(!connection.client().is_connected());

        connection.ensure_connected(&cancel).await.unwrap();
        assert_eq!(connection.connect_count(), 2);
    }
}
