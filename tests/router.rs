use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use credits::bus::router::{ATTEMPTS_KEY, ERROR_KEY, RETRY_BATCH_ATTEMPT_KEY};
use credits::bus::{Delivery, Handler, InProcessBus, Publisher, RecordingPublisher, Router, RouterOptions};
use credits::events::{DomainEvent, EntitlementResetEvent, Envelope};
use credits::{CreditError, CreditResult};

fn options() -> RouterOptions {
    RouterOptions {
        max_retries: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        ..RouterOptions::default()
    }
}

fn reset_envelope(entitlement_id: &str) -> Envelope {
    Envelope::new(&EntitlementResetEvent {
        entitlement_id: entitlement_id.into(),
        namespace: "acme".into(),
        subject_key: "customer-1".into(),
        reset_at: chrono::Utc::now(),
    })
    .unwrap()
}

/// Fails with whatever `fail` returns until it yields `None`.
struct ScriptedHandler<F> {
    calls: AtomicU32,
    fail: F,
}

impl<F> ScriptedHandler<F>
where
    F: Fn(u32) -> Option<CreditError> + Send + Sync,
{
    fn new(fail: F) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> Handler for ScriptedHandler<F>
where
    F: Fn(u32) -> Option<CreditError> + Send + Sync,
{
    async fn handle(&self, _envelope: &Envelope) -> CreditResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.fail)(call) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Hanging;

#[async_trait]
impl Handler for Hanging {
    async fn handle(&self, _envelope: &Envelope) -> CreditResult<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn router_with(
    handler: Arc<dyn Handler>,
) -> (Router, Arc<RecordingPublisher>, Arc<RecordingPublisher>) {
    let republished = Arc::new(RecordingPublisher::new());
    let dead_letters = Arc::new(RecordingPublisher::new());
    let mut router = Router::new(republished.clone(), dead_letters.clone(), options());
    router.add_handler(EntitlementResetEvent::event_name(), handler);
    (router, republished, dead_letters)
}

// key: router-tests -> retries, dead letters and narrowed batches
#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let handler = ScriptedHandler::new(|call| {
        (call < 2).then(|| CreditError::Publish("broker hiccup".into()))
    });
    let (router, _, dead_letters) = router_with(handler.clone());
    let (_tx, shutdown) = watch::channel(false);

    let delivery = router.dispatch(reset_envelope("ent-1"), shutdown).await;

    assert_eq!(delivery, Delivery::Acked);
    assert_eq!(handler.calls(), 3);
    assert!(dead_letters.published().is_empty());
}

#[tokio::test]
async fn permanent_failures_go_straight_to_the_dead_letter_queue() {
    let handler = ScriptedHandler::new(|_| Some(CreditError::validation("malformed")));
    let (router, _, dead_letters) = router_with(handler.clone());
    let (_tx, shutdown) = watch::channel(false);

    let delivery = router.dispatch(reset_envelope("ent-1"), shutdown).await;

    assert_eq!(delivery, Delivery::DeadLettered);
    assert_eq!(handler.calls(), 1);
    let dead = dead_letters.published();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].metadata[ERROR_KEY].contains("malformed"));
    assert_eq!(dead[0].metadata_counter(ATTEMPTS_KEY), 1);
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered() {
    let handler = ScriptedHandler::new(|_| Some(CreditError::UsageQuery("meter offline".into())));
    let (router, _, dead_letters) = router_with(handler.clone());
    let (_tx, shutdown) = watch::channel(false);

    let delivery = router.dispatch(reset_envelope("ent-1"), shutdown).await;

    assert_eq!(delivery, Delivery::DeadLettered);
    assert_eq!(handler.calls(), 4);
    assert_eq!(dead_letters.published()[0].metadata_counter(ATTEMPTS_KEY), 4);
}

#[tokio::test]
async fn partial_batches_are_republished_with_a_generation_counter() {
    let handler = ScriptedHandler::new(|_| {
        Some(CreditError::PartialBatch {
            failed: 1,
            total: 3,
            retry: vec![reset_envelope("ent-2")],
        })
    });
    let (router, republished, dead_letters) = router_with(handler.clone());
    let (_tx, shutdown) = watch::channel(false);

    let delivery = router.dispatch(reset_envelope("ent-1"), shutdown.clone()).await;
    assert_eq!(delivery, Delivery::Republished(1));
    assert_eq!(handler.calls(), 1);

    let narrowed = republished.published();
    assert_eq!(narrowed.len(), 1);
    assert_eq!(narrowed[0].metadata_counter(RETRY_BATCH_ATTEMPT_KEY), 1);

    let exhausted = reset_envelope("ent-1").with_metadata(RETRY_BATCH_ATTEMPT_KEY, "3");
    assert_eq!(router.dispatch(exhausted, shutdown).await, Delivery::DeadLettered);
    assert_eq!(dead_letters.published().len(), 1);
}

#[tokio::test]
async fn unsubscribed_events_are_skipped() {
    let handler = ScriptedHandler::new(|_| None);
    let (mut router, _, _) = router_with(handler.clone());
    router.add_handler("credit.v1.grant.created", handler.clone());
    let (_tx, shutdown) = watch::channel(false);

    let mut envelope = reset_envelope("ent-1");
    envelope.name = "ingest.v2.events.flushed".into();

    assert_eq!(router.dispatch(envelope, shutdown).await, Delivery::Skipped);
    assert_eq!(handler.calls(), 0);
    assert_eq!(
        router.subscribed(),
        vec!["credit.v1.grant.created", "entitlement.v1.usage.reset"]
    );
}

#[tokio::test]
async fn shutdown_cancels_in_flight_handlers() {
    let (router, _, dead_letters) = router_with(Arc::new(Hanging));
    let (tx, shutdown) = watch::channel(false);

    let dispatch = router.dispatch(reset_envelope("ent-1"), shutdown);
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
    };
    let (delivery, _) = tokio::join!(dispatch, trigger);

    assert_eq!(delivery, Delivery::Cancelled);
    assert!(dead_letters.published().is_empty());
}

#[tokio::test]
async fn run_drains_the_bus_until_shutdown() {
    let handler = ScriptedHandler::new(|_| None);
    let (router, _, _) = router_with(handler.clone());
    let (bus, messages) = InProcessBus::channel(8);
    let (tx, shutdown) = watch::channel(false);
    let running = tokio::spawn(Arc::new(router).run(messages, shutdown));

    for id in ["ent-1", "ent-2", "ent-3"] {
        bus.publish(reset_envelope(id)).await.unwrap();
    }
    for _ in 0..100 {
        if handler.calls() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tx.send(true).unwrap();
    running.await.unwrap();

    assert_eq!(handler.calls(), 3);
}
