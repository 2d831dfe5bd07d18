//! Message bus seams: publishing, handling and the retrying router between them.

pub mod memory;
pub mod router;

use async_trait::async_trait;

use crate::error::CreditResult;
use crate::events::{DomainEvent, Envelope};

pub use memory::{InProcessBus, LogPublisher, RecordingPublisher};
pub use router::{Delivery, Router, RouterOptions};

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> CreditResult<()>;

    async fn publish_batch(&self, envelopes: Vec<Envelope>) -> CreditResult<()> {
        for envelope in envelopes {
            self.publish(envelope).await?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> CreditResult<()>;
}

pub async fn publish_event<E: DomainEvent>(publisher: &dyn Publisher, event: &E) -> CreditResult<()> {
    publisher.publish(Envelope::new(event)?).await
}
