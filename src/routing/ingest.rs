//! Producers feeding the router's work channel.

use std::sync::Arc;
use std::time::Duration;

use courier_plugin::Payload;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::{Message, Status};
use crate::queue::Delivery;
use crate::store::MessageStore;

/// Correlation ids between hand-off and finalisation.
pub type InFlight = Arc<DashMap<String, ()>>;

/// Sends `message` unless shutdown wins the race. Returns `false` once the
/// producer should stop.
async fn forward(tx: &mpsc::Sender<Message>, message: Message, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(message) => sent.is_ok(),
    }
}

/// Every `interval`, hands the oldest `batch_size` waiting messages that are
/// not already in flight to the router.
pub async fn poll_store(
    store: Arc<dyn MessageStore>,
    tx: mpsc::Sender<Message>,
    in_flight: InFlight,
    interval: Duration,
    batch_size: usize,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = interval.as_millis() as u64, batch_size, "polling store");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let waiting = match store
            .find_top_n_by_status_order_by_reception_time_asc(Status::WaitingForProcessing, batch_size)
            .await
        {
            Ok(waiting) => waiting,
            Err(e) => {
                warn!("could not poll for waiting messages: {e}");
                continue;
            }
        };

        for message in waiting {
            if in_flight.insert(message.correlation_id.clone(), ()).is_some() {
                continue;
            }
            debug!(correlation_id = %message.correlation_id, "polled message");
            if !forward(&tx, message, &cancel).await {
                return;
            }
        }
    }
    debug!("store polling stopped");
}

/// The message a queue delivery turns into.
pub fn message_from_delivery(delivery: &Delivery, procedure: &str) -> Message {
    let mut payload = Payload::new();
    payload.insert(
        "body".into(),
        Value::String(String::from_utf8_lossy(&delivery.body).into_owned()),
    );
    Message::new(procedure, payload)
}

/// Saves `delivery` as a waiting message.
async fn persist(
    store: &dyn MessageStore,
    in_flight: &InFlight,
    delivery: &Delivery,
    procedure: &str,
) -> Option<Message> {
    let message = message_from_delivery(delivery, procedure);
    let correlation_id = message.correlation_id.clone();
    // in flight before the row exists, so the poller never picks it up too
    in_flight.insert(correlation_id.clone(), ());
    match store.save(message).await {
        Ok(saved) => {
            info!(
                target: "message",
                correlation_id = %correlation_id,
                delivery = %delivery.tag,
                bytes = delivery.body.len(),
                "message received from queue"
            );
            Some(saved)
        }
        Err(e) => {
            error!(correlation_id = %correlation_id, delivery = %delivery.tag, "could not persist queued message: {e}");
            in_flight.remove(&correlation_id);
            None
        }
    }
}

/// Turns every delivery into a new message for `procedure`, saved as waiting
/// before it is handed on. On shutdown the deliveries already buffered are
/// saved too; the poller picks them up after a restart.
pub async fn consume_queue(
    store: Arc<dyn MessageStore>,
    mut deliveries: mpsc::Receiver<Delivery>,
    tx: mpsc::Sender<Message>,
    in_flight: InFlight,
    procedure: String,
    cancel: CancellationToken,
) {
    info!(%procedure, "consuming queue");
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => {
                    warn!("queue closed its delivery channel");
                    break;
                }
            },
        };

        let Some(message) = persist(store.as_ref(), &in_flight, &delivery, &procedure).await else {
            continue;
        };
        let correlation_id = message.correlation_id.clone();
        if !forward(&tx, message, &cancel).await {
            in_flight.remove(&correlation_id);
            break;
        }
    }

    // later sends fail and the queue keeps those messages itself
    deliveries.close();
    let mut saved = 0usize;
    while let Some(delivery) = deliveries.recv().await {
        if let Some(message) = persist(store.as_ref(), &in_flight, &delivery, &procedure).await {
            in_flight.remove(&message.correlation_id);
            saved += 1;
        }
    }
    debug!(saved, "queue consumption stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteMessageStore;

    #[test]
    fn deliveries_become_waiting_messages() {
        let delivery = Delivery {
            tag: "t".into(),
            body: b"hello \xF0\x28world".to_vec(),
        };
        let message = message_from_delivery(&delivery, "example-procedure");
        assert_eq!(message.status, Status::WaitingForProcessing);
        assert_eq!(message.procedure, "example-procedure");
        assert_eq!(message.reception_time, message.last_changed_time);
        assert_eq!(message.id, None);
        let body = message.payload["body"].as_str().unwrap();
        assert!(body.starts_with("hello "));
        assert!(body.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn poll_skips_in_flight_messages() {
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let a = store.save(Message::new("p", Payload::new())).await.unwrap();
        let b = store.save(Message::new("p", Payload::new())).await.unwrap();

        let in_flight: InFlight = Arc::new(DashMap::new());
        in_flight.insert(a.correlation_id.clone(), ());

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let poller = tokio::spawn(poll_store(
            store,
            tx,
            Arc::clone(&in_flight),
            Duration::from_millis(20),
            10,
            cancel.clone(),
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.correlation_id, b.correlation_id);

        // later ticks see the same rows but everything is in flight now
        let again = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(again.is_err());

        cancel.cancel();
        poller.await.unwrap();
    }

    #[tokio::test]
    async fn queue_consumer_stops_on_cancel() {
        let (delivery_tx, deliveries) = mpsc::channel(4);
        let (tx, mut rx) = mpsc::channel(4);
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let in_flight: InFlight = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(consume_queue(
            store.clone(),
            deliveries,
            tx,
            Arc::clone(&in_flight),
            "example-procedure".into(),
            cancel.clone(),
        ));

        delivery_tx
            .send(Delivery { tag: "1".into(), body: b"one".to_vec() })
            .await
            .unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.payload["body"], Value::String("one".into()));
        assert!(message.id.is_some());
        assert!(in_flight.contains_key(&message.correlation_id));

        cancel.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn buffered_deliveries_are_saved_on_cancel() {
        let (delivery_tx, deliveries) = mpsc::channel(8);
        // nobody reads the work channel, so the consumer stalls on the first send
        let (tx, _rx) = mpsc::channel(1);
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let in_flight: InFlight = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        for body in ["a", "b", "c", "d"] {
            delivery_tx
                .send(Delivery { tag: body.into(), body: body.as_bytes().to_vec() })
                .await
                .unwrap();
        }
        let consumer = tokio::spawn(consume_queue(
            store.clone(),
            deliveries,
            tx,
            Arc::clone(&in_flight),
            "example-procedure".into(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        consumer.await.unwrap();

        let waiting = store
            .find_top_n_by_status_order_by_reception_time_asc(Status::WaitingForProcessing, 10)
            .await
            .unwrap();
        let mut bodies: Vec<_> = waiting.iter().map(|m| m.payload["body"].as_str().unwrap().to_string()).collect();
        bodies.sort();
        assert_eq!(bodies, vec!["a", "b", "c", "d"]);
        assert!(delivery_tx.send(Delivery { tag: "e".into(), body: b"e".to_vec() }).await.is_err());
    }
}
