use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tracing::error;

use super::router::{ATTEMPTS_KEY, ERROR_KEY};
use super::Publisher;
use crate::error::{CreditError, CreditResult};
use crate::events::Envelope;

/// key: bus-in-process -> bounded channel transport for a single process
#[derive(Clone)]
pub struct InProcessBus {
    sender: Sender<Envelope>,
}

impl InProcessBus {
    pub fn channel(capacity: usize) -> (Self, Receiver<Envelope>) {
        let (tx, rx) = channel(capacity.max(1));
        (Self { sender: tx }, rx)
    }
}

#[async_trait]
impl Publisher for InProcessBus {
    async fn publish(&self, envelope: Envelope) -> CreditResult<()> {
        self.sender
            .send(envelope)
            .await
            .map_err(|err| CreditError::Publish(format!("in-process bus closed: {err}")))
    }
}

/// Dead-letter destination that only reports what it receives.
#[derive(Clone, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, envelope: Envelope) -> CreditResult<()> {
        error!(
            id = %envelope.id,
            name = %envelope.name,
            subject = %envelope.subject,
            error = envelope.metadata.get(ERROR_KEY).map(String::as_str).unwrap_or(""),
            attempts = envelope.metadata_counter(ATTEMPTS_KEY),
            "message dead-lettered"
        );
        Ok(())
    }
}

type FailurePredicate = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Keeps every published envelope in memory; optionally refuses some of them.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Envelope>>,
    reject: Option<FailurePredicate>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting<F>(predicate: F) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        Self {
            published: Mutex::new(Vec::new()),
            reject: Some(Box::new(predicate)),
        }
    }

    pub fn published(&self) -> Vec<Envelope> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    pub fn published_named(&self, name: &str) -> Vec<Envelope> {
        self.published()
            .into_iter()
            .filter(|envelope| envelope.name == name)
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, envelope: Envelope) -> CreditResult<()> {
        if matches!(&self.reject, Some(reject) if reject(&envelope)) {
            return Err(CreditError::Publish(format!(
                "publisher rejected {} for {}",
                envelope.name, envelope.subject
            )));
        }
        self.published
            .lock()
            .map_err(|_| CreditError::Publish("recording publisher poisoned".to_string()))?
            .push(envelope);
        Ok(())
    }
}
