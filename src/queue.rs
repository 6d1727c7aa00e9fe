//! Task broker contract and the bundled in-process implementation.
//!
//! Delivery is at-least-once; handlers are idempotent through the exports
//! store. Priorities are advisory: queues drain by configurable weights in
//! high, default, low order.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::ExportTaskPayload;

/// Task type carried by export tasks.
pub const TASK_TYPE_EXPORT: &str = "export:run";

/// Current task envelope schema version.
pub const TASK_ENVELOPE_VERSION: u32 = 1;

/// Broker payloads are untyped bytes; this envelope is the single schema
/// they decode to. Unknown types are rejected at dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "type")]
    pub task_type: String,
    pub version: u32,
    pub payload: serde_json::Value,
}

impl TaskEnvelope {
    /// Wrap an export payload into an envelope.
    pub fn export(payload: &ExportTaskPayload) -> serde_json::Result<Self> {
        Ok(Self {
            task_type: TASK_TYPE_EXPORT.to_string(),
            version: TASK_ENVELOPE_VERSION,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload of an `export:run` envelope.
    pub fn decode_export(&self) -> Result<ExportTaskPayload, TaskError> {
        if self.task_type != TASK_TYPE_EXPORT {
            return Err(TaskError::Fatal(format!(
                "unknown task type: {}",
                self.task_type
            )));
        }
        if self.version != TASK_ENVELOPE_VERSION {
            return Err(TaskError::Fatal(format!(
                "unsupported envelope version: {}",
                self.version
            )));
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TaskError::Fatal(format!("invalid payload: {e}")))
    }
}

/// Three advisory priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Default,
    Low,
}

impl Priority {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Self::Default,
            "low" => Self::Low,
            _ => Self::High,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Default => "default",
            Self::Low => "low",
        }
    }
}

/// One delivery. `attempt` counts prior deliveries of the same task.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_type: String,
    pub payload: Vec<u8>,
    pub attempt: u32,
    pub max_retries: u32,
    pub timeout: Duration,
}

/// Enqueue-time options.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    pub max_retries: u32,
    pub timeout: Duration,
    /// How long completed tasks stay inspectable. Advisory; the in-process
    /// broker drops tasks on completion.
    pub retention: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(10 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Handler outcome: `Retry` asks the broker to reschedule with backoff,
/// `Fatal` (and success) end the delivery.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("retryable: {reason}")]
    Retry { after: Duration, reason: String },
    #[error("terminal: {0}")]
    Fatal(String),
}

/// Async task handler invoked per delivery with a per-task cancellation
/// token (cancelled on task timeout and process shutdown).
pub type TaskHandler =
    Arc<dyn Fn(CancellationToken, Task) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// Producer-side broker contract.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    async fn enqueue(
        &self,
        priority: Priority,
        task_type: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> anyhow::Result<()>;
}

struct Channels {
    high: mpsc::UnboundedReceiver<Task>,
    default_: mpsc::UnboundedReceiver<Task>,
    low: mpsc::UnboundedReceiver<Task>,
}

/// In-process broker: three unbounded queues, a weighted scheduler and a
/// semaphore-bounded worker pool sharing the process with the API edge.
pub struct InProcessBroker {
    tx_high: mpsc::UnboundedSender<Task>,
    tx_default: mpsc::UnboundedSender<Task>,
    tx_low: mpsc::UnboundedSender<Task>,
    channels: Mutex<Option<Channels>>,
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessBroker {
    #[must_use]
    pub fn new() -> Self {
        let (tx_high, rx_high) = mpsc::unbounded_channel();
        let (tx_default, rx_default) = mpsc::unbounded_channel();
        let (tx_low, rx_low) = mpsc::unbounded_channel();
        Self {
            tx_high,
            tx_default,
            tx_low,
            channels: Mutex::new(Some(Channels {
                high: rx_high,
                default_: rx_default,
                low: rx_low,
            })),
        }
    }

    /// Start the scheduler and worker pool. May be called once.
    ///
    /// `weights` maps queue names to drain credits per scheduling round
    /// (`high=6,default=3,low=1` by default). `concurrency` bounds the
    /// number of tasks running at once.
    pub fn start_workers(
        &self,
        concurrency: usize,
        weights: &[(String, u32)],
        handler: TaskHandler,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut channels = self
            .channels
            .lock()
            .expect("broker channels lock")
            .take()
            .expect("broker workers already started");

        let weight = |name: &str, fallback: u32| {
            weights
                .iter()
                .find(|(n, _)| n == name)
                .map_or(fallback, |(_, w)| (*w).max(1))
        };
        let credits = [
            weight("high", 6),
            weight("default", 3),
            weight("low", 1),
        ];

        let retry_tx = self.tx_default.clone();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        tokio::spawn(async move {
            info!(concurrency, "task workers started");
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let mut drained = false;
                for (idx, credit) in credits.iter().enumerate() {
                    for _ in 0..*credit {
                        let popped = match idx {
                            0 => channels.high.try_recv(),
                            1 => channels.default_.try_recv(),
                            _ => channels.low.try_recv(),
                        };
                        let Ok(task) = popped else {
                            break;
                        };
                        drained = true;
                        let permit = match Arc::clone(&semaphore).acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => return,
                        };
                        let handler = Arc::clone(&handler);
                        let retry_tx = retry_tx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            run_task(task, handler, retry_tx, shutdown).await;
                            drop(permit);
                        });
                    }
                }
                if !drained {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_millis(50)) => {}
                    }
                }
            }
            debug!("task scheduler stopped");
        })
    }
}

#[async_trait]
impl TaskBroker for InProcessBroker {
    async fn enqueue(
        &self,
        priority: Priority,
        task_type: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> anyhow::Result<()> {
        let task = Task {
            task_type: task_type.to_string(),
            payload,
            attempt: 0,
            max_retries: opts.max_retries,
            timeout: opts.timeout,
        };
        let tx = match priority {
            Priority::High => &self.tx_high,
            Priority::Default => &self.tx_default,
            Priority::Low => &self.tx_low,
        };
        tx.send(task)
            .map_err(|_| anyhow::anyhow!("broker queues closed"))?;
        Ok(())
    }
}

async fn run_task(
    task: Task,
    handler: TaskHandler,
    retry_tx: mpsc::UnboundedSender<Task>,
    shutdown: CancellationToken,
) {
    let token = shutdown.child_token();
    let watchdog = {
        let token = token.clone();
        let timeout = task.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            token.cancel();
        })
    };

    let result = handler(token.clone(), task.clone()).await;
    watchdog.abort();

    match result {
        Ok(()) => {}
        Err(TaskError::Fatal(reason)) => {
            warn!(task_type = %task.task_type, attempt = task.attempt, %reason, "task ended terminally");
        }
        Err(TaskError::Retry { after, reason }) => {
            if task.attempt + 1 >= task.max_retries {
                warn!(task_type = %task.task_type, attempt = task.attempt, %reason,
                    "task retries exhausted");
                return;
            }
            let delay = backoff_with_jitter(after, task.attempt);
            info!(task_type = %task.task_type, attempt = task.attempt, %reason,
                delay_ms = delay.as_millis() as u64, "task rescheduled");
            let mut next = task;
            next.attempt += 1;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = retry_tx.send(next);
            });
        }
    }
}

/// Exponential backoff (1x, 2x, 4x of the hint) plus jitter bounded by 20%
/// of the delay. The jitter source is the clock, not a PRNG; it only has
/// to spread retries, not be unpredictable.
fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let base = if base.is_zero() {
        Duration::from_secs(1)
    } else {
        base
    };
    let delay = base.saturating_mul(1u32 << attempt.min(16));
    let cap = delay / 5;
    if cap.is_zero() {
        return delay;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let jitter = Duration::from_nanos((nanos % cap.as_nanos()) as u64);
    delay + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn recording_handler(
        log: Arc<Mutex<Vec<String>>>,
    ) -> TaskHandler {
        Arc::new(move |_token, task| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                let label = String::from_utf8_lossy(&task.payload).to_string();
                log.lock().unwrap().push(label);
                Ok(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_drains_first() {
        let broker = InProcessBroker::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        // Enqueue before starting workers so ordering is deterministic.
        for (prio, label) in [
            (Priority::Low, "low"),
            (Priority::Default, "default"),
            (Priority::High, "high"),
        ] {
            broker
                .enqueue(prio, TASK_TYPE_EXPORT, label.as_bytes().to_vec(), EnqueueOptions::default())
                .await
                .unwrap();
        }

        broker.start_workers(1, &[], recording_handler(Arc::clone(&log)), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();

        let order = log.lock().unwrap().clone();
        assert_eq!(order, vec!["high", "default", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_reschedule_until_success() {
        let broker = InProcessBroker::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();

        let counter = Arc::clone(&attempts);
        let handler: TaskHandler = Arc::new(move |_token, task| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if task.attempt == 0 {
                    Err(TaskError::Retry {
                        after: Duration::from_millis(10),
                        reason: "flaky".into(),
                    })
                } else {
                    Ok(())
                }
            })
        });

        broker
            .enqueue(
                Priority::Default,
                TASK_TYPE_EXPORT,
                b"x".to_vec(),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        broker.start_workers(2, &[], handler, shutdown.clone());

        tokio::time::sleep(Duration::from_secs(2)).await;
        shutdown.cancel();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_max() {
        let broker = InProcessBroker::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();

        let counter = Arc::clone(&attempts);
        let handler: TaskHandler = Arc::new(move |_token, _task| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::Retry {
                    after: Duration::from_millis(5),
                    reason: "always failing".into(),
                })
            })
        });

        broker
            .enqueue(
                Priority::High,
                TASK_TYPE_EXPORT,
                b"x".to_vec(),
                EnqueueOptions {
                    max_retries: 3,
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
        broker.start_workers(1, &[], handler, shutdown.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn task_timeout_cancels_the_token() {
        let broker = InProcessBroker::new();
        let timed_out = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();

        let flag = Arc::clone(&timed_out);
        let handler: TaskHandler = Arc::new(move |token, _task| {
            let flag = Arc::clone(&flag);
            Box::pin(async move {
                token.cancelled().await;
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        broker
            .enqueue(
                Priority::High,
                TASK_TYPE_EXPORT,
                b"x".to_vec(),
                EnqueueOptions {
                    timeout: Duration::from_millis(100),
                    ..EnqueueOptions::default()
                },
            )
            .await
            .unwrap();
        broker.start_workers(1, &[], handler, shutdown.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn envelope_roundtrip_and_type_check() {
        use crate::types::{ExportFormat, ExportTaskPayload, PromptProfile, SecretStrategy};
        let payload = ExportTaskPayload {
            export_id: "exp_1".into(),
            owner: "acme".into(),
            repo: "widgets".into(),
            reference: "HEAD".into(),
            format: ExportFormat::Zip,
            profile: PromptProfile::Short,
            include_globs: vec!["**/*.rs".into()],
            exclude_globs: vec![],
            secret_scan: true,
            secret_strategy: SecretStrategy::Redacted,
            token_model: String::new(),
            max_binary_size_mb: 0,
            ttl_hours: 0,
            idempotency_key: "k".into(),
        };
        let envelope = TaskEnvelope::export(&payload).unwrap();
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: TaskEnvelope = serde_json::from_slice(&bytes).unwrap();
        let out = decoded.decode_export().unwrap();
        assert_eq!(out.export_id, "exp_1");
        assert_eq!(out.format, ExportFormat::Zip);

        let bad = TaskEnvelope {
            task_type: "export:unknown".into(),
            version: TASK_ENVELOPE_VERSION,
            payload: serde_json::Value::Null,
        };
        assert!(matches!(bad.decode_export(), Err(TaskError::Fatal(_))));
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let base = Duration::from_secs(1);
        for attempt in 0..3u32 {
            let d = backoff_with_jitter(base, attempt);
            let expected = base * (1 << attempt);
            assert!(d >= expected);
            assert!(d <= expected + expected / 5);
        }
    }
}
