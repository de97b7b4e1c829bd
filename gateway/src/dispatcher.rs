use std::{future::Future, sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use farm_common::{
    ActionCode, DispatcherConfig, NewActionLog, NewCommand, ParseActionError, QueueCommandRequest,
};

use crate::store::FarmStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("queue did not answer within {0:?}")]
    Timeout(Duration),
    #[error("queue rejected the request with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("queue unreachable: {0}")]
    Transport(String),
}

impl DispatchError {
    /// A timed-out request may still have been applied on the other side.
    pub fn delivery_unknown(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Where queued commands and their history rows end up.
pub trait CommandQueue: Send + Sync {
    fn enqueue(
        &self,
        command: NewCommand,
    ) -> impl Future<Output = Result<u64, DispatchError>> + Send;

    fn record_action(
        &self,
        entry: NewActionLog,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

/// The gateway's own store.
#[derive(Clone)]
pub struct LocalQueue {
    store: FarmStore,
}

impl LocalQueue {
    pub fn new(store: FarmStore) -> Self {
        Self { store }
    }
}

impl CommandQueue for LocalQueue {
    async fn enqueue(&self, command: NewCommand) -> Result<u64, DispatchError> {
        Ok(self.store.enqueue_command(command).await.id)
    }

    async fn record_action(&self, entry: NewActionLog) -> Result<(), DispatchError> {
        self.store.append_action(entry).await;
        Ok(())
    }
}

/// Another gateway's `/api/commands` and `/api/device-actions` endpoints.
#[derive(Clone)]
pub struct RemoteQueue {
    http: reqwest::Client,
    base_url: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct EnqueueReply {
    command_id: u64,
}

impl RemoteQueue {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: Arc::from(base_url),
        }
    }

    async fn post<T: serde::Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, DispatchError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|err| DispatchError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(DispatchError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

impl CommandQueue for RemoteQueue {
    async fn enqueue(&self, command: NewCommand) -> Result<u64, DispatchError> {
        let request = QueueCommandRequest {
            device_id: Some(command.device_id),
            action: Some(command.action.letter().to_string()),
            duration_ms: Some(command.duration_ms),
            location: Some(command.location),
            metadata: Some(command.metadata),
        };
        let reply: EnqueueReply = self
            .post("/api/commands", &request)
            .await?
            .json()
            .await
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        Ok(reply.command_id)
    }

    async fn record_action(&self, entry: NewActionLog) -> Result<(), DispatchError> {
        self.post("/api/device-actions", &entry).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub enum QueueBackend {
    Local(LocalQueue),
    Remote(RemoteQueue),
}

impl CommandQueue for QueueBackend {
    async fn enqueue(&self, command: NewCommand) -> Result<u64, DispatchError> {
        match self {
            Self::Local(queue) => queue.enqueue(command).await,
            Self::Remote(queue) => queue.enqueue(command).await,
        }
    }

    async fn record_action(&self, entry: NewActionLog) -> Result<(), DispatchError> {
        match self {
            Self::Local(queue) => queue.record_action(entry).await,
            Self::Remote(queue) => queue.record_action(entry).await,
        }
    }
}

/// Result of one dispatch. The queue write and the history write are
/// reported separately; only the former decides success.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub action: ActionCode,
    pub command: Result<u64, DispatchError>,
    /// `None` when the command never reached the queue.
    pub audit: Option<Result<(), DispatchError>>,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.command.is_ok()
    }

    pub fn audit_logged(&self) -> bool {
        matches!(self.audit, Some(Ok(())))
    }
}

/// Sends commands to the queue without waiting for the device.
///
/// Delivery is at most once: a failed or timed-out enqueue is reported and
/// never retried here.
pub struct Dispatcher<Q> {
    queue: Q,
    device_id: String,
    timeout: Duration,
    default_duration_ms: u64,
}

impl<Q: CommandQueue> Dispatcher<Q> {
    pub fn new(queue: Q, device_id: &str, config: &DispatcherConfig) -> Self {
        Self {
            queue,
            device_id: device_id.to_string(),
            timeout: Duration::from_millis(config.timeout_ms),
            default_duration_ms: config.default_duration_ms,
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_for_tests(&self) -> &Q {
        &self.queue
    }

    pub async fn dispatch(
        &self,
        token: &str,
        location: &str,
        metadata: Value,
    ) -> Result<DispatchOutcome, ParseActionError> {
        let action = ActionCode::parse_token(token)?;
        Ok(self.dispatch_code(action, location, metadata).await)
    }

    pub async fn dispatch_code(
        &self,
        action: ActionCode,
        location: &str,
        metadata: Value,
    ) -> DispatchOutcome {
        self.submit(NewCommand {
            device_id: self.device_id.clone(),
            action,
            duration_ms: self.default_duration_ms,
            location: location.to_string(),
            metadata,
        })
        .await
    }

    pub async fn submit(&self, command: NewCommand) -> DispatchOutcome {
        let action = command.action;
        let audit_entry = command.audit_entry();
        let location = command.location.clone();

        let queued = tokio::time::timeout(self.timeout, self.queue.enqueue(command))
            .await
            .unwrap_or(Err(DispatchError::Timeout(self.timeout)));

        let audit = match &queued {
            Ok(id) => {
                info!("queued {} ({}) as #{id} from {location}", action.letter(), action.kind());
                let logged =
                    tokio::time::timeout(self.timeout, self.queue.record_action(audit_entry))
                        .await
                        .unwrap_or(Err(DispatchError::Timeout(self.timeout)));
                if let Err(err) = &logged {
                    warn!("command #{id} queued but history entry failed: {err}");
                }
                Some(logged)
            }
            Err(err) => {
                warn!(
                    "failed to queue {} from {location}: {err}{}",
                    action.letter(),
                    if err.delivery_unknown() { " (delivery unknown)" } else { "" }
                );
                None
            }
        };

        DispatchOutcome {
            action,
            command: queued,
            audit,
        }
    }
}
