use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand_core::{OsRng, RngCore};
use tokio::sync::mpsc::Receiver;
use tokio::sync::{watch, Semaphore};
use tokio::time;
use tracing::{debug, error, info, warn};

use super::{Handler, Publisher};
use crate::config;
use crate::error::CreditError;
use crate::events::Envelope;

/// Error that sent a message to the dead-letter destination.
pub const ERROR_KEY: &str = "x-error";
/// Handler invocations spent on a dead-lettered message.
pub const ATTEMPTS_KEY: &str = "x-delivery-attempts";
/// How many times a narrowed batch has been carved out of its predecessors.
pub const RETRY_BATCH_ATTEMPT_KEY: &str = "x-retry-batch-attempt";

#[derive(Clone, Debug)]
pub struct RouterOptions {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed.
    pub jitter: f64,
    pub concurrency: usize,
}

impl RouterOptions {
    pub fn from_env() -> Self {
        Self {
            max_retries: *config::ROUTER_MAX_RETRIES,
            initial_backoff: Duration::from_millis(*config::ROUTER_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(*config::ROUTER_MAX_BACKOFF_MS),
            concurrency: *config::BALANCE_WORKER_POOL_SIZE,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let unit = OsRng.next_u32() as f64 / u32::MAX as f64;
        let factor = 1.0 + self.jitter * (2.0 * unit - 1.0);
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
            concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Acked,
    /// No handler subscribed to the event name.
    Skipped,
    /// Handler reported a partial failure; this many narrowed messages were republished.
    Republished(usize),
    DeadLettered,
    Cancelled,
}

/// key: bus-router -> dispatch with bounded retries and dead-lettering
pub struct Router {
    handlers: HashMap<String, Arc<dyn Handler>>,
    publisher: Arc<dyn Publisher>,
    dead_letter: Arc<dyn Publisher>,
    options: RouterOptions,
}

impl Router {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        dead_letter: Arc<dyn Publisher>,
        options: RouterOptions,
    ) -> Self {
        Self {
            handlers: HashMap::new(),
            publisher,
            dead_letter,
            options,
        }
    }

    pub fn add_handler(&mut self, event_name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(event_name.into(), handler);
    }

    pub fn subscribed(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Consumes `messages` until the channel closes or `shutdown` flips to `true`.
    /// Each message runs in its own task; at most `concurrency` run at once.
    pub async fn run(
        self: Arc<Self>,
        mut messages: Receiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let concurrency = self.options.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        info!(topics = ?self.subscribed(), concurrency, "router started");

        loop {
            let envelope = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                message = messages.recv() => match message {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let router = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                router.dispatch(envelope, shutdown).await;
                drop(permit);
            });
        }

        let _ = permits.acquire_many(concurrency as u32).await;
        info!("router stopped");
    }

    pub async fn dispatch(&self, envelope: Envelope, mut shutdown: watch::Receiver<bool>) -> Delivery {
        let Some(handler) = self.handlers.get(&envelope.name) else {
            debug!(name = %envelope.name, "no handler subscribed, message skipped");
            return Delivery::Skipped;
        };

        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                result = handler.handle(&envelope) => result,
                _ = wait_for_shutdown(&mut shutdown) => Err(CreditError::Cancelled),
            };

            match result {
                Ok(()) => return Delivery::Acked,
                Err(CreditError::Cancelled) if *shutdown.borrow() => {
                    warn!(id = %envelope.id, name = %envelope.name, "handler cancelled by shutdown");
                    return Delivery::Cancelled;
                }
                Err(CreditError::PartialBatch {
                    failed,
                    total,
                    retry,
                }) => return self.republish_narrowed(envelope, retry, failed, total).await,
                Err(err) if err.is_retryable() && attempt < self.options.max_retries => {
                    let delay = self.options.backoff(attempt);
                    warn!(
                        ?err,
                        id = %envelope.id,
                        name = %envelope.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "handler failed, retrying"
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.dead_letter(envelope, &err, attempt + 1).await;
                    return Delivery::DeadLettered;
                }
            }
        }
    }

    async fn republish_narrowed(
        &self,
        original: Envelope,
        retry: Vec<Envelope>,
        failed: usize,
        total: usize,
    ) -> Delivery {
        let generation = original.metadata_counter(RETRY_BATCH_ATTEMPT_KEY) + 1;
        if generation > self.options.max_retries {
            let err = CreditError::Publish(format!(
                "{failed} of {total} items still failing after {} narrowed retries",
                generation - 1
            ));
            self.dead_letter(original, &err, generation).await;
            return Delivery::DeadLettered;
        }

        let count = retry.len();
        let narrowed: Vec<Envelope> = retry
            .into_iter()
            .map(|envelope| envelope.with_metadata(RETRY_BATCH_ATTEMPT_KEY, generation.to_string()))
            .collect();

        match self.publisher.publish_batch(narrowed).await {
            Ok(()) => {
                warn!(
                    id = %original.id,
                    name = %original.name,
                    failed,
                    total,
                    generation,
                    "partial batch failure, narrowed batch republished"
                );
                Delivery::Republished(count)
            }
            Err(err) => {
                self.dead_letter(original, &err, generation).await;
                Delivery::DeadLettered
            }
        }
    }

    async fn dead_letter(&self, envelope: Envelope, err: &CreditError, attempts: u32) {
        let id = envelope.id.clone();
        let name = envelope.name.clone();
        let envelope = envelope
            .with_metadata(ERROR_KEY, err.to_string())
            .with_metadata(ATTEMPTS_KEY, attempts.to_string());
        if let Err(publish_err) = self.dead_letter.publish(envelope).await {
            error!(?publish_err, %id, %name, "failed to dead-letter message, dropping it");
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
