//! Event subscription bridge.
//!
//! A [`Subscription`] is fed by a forwarder task that first replays matching
//! history, then follows the live feed, dropping log entries it has already
//! delivered. Delivery stops when the subscription is cancelled or dropped.
//! If the live transport goes away the forwarder stays parked, so a pending
//! [`Subscription::listen_once`] keeps waiting until the caller gives up.

use crate::abi::AbiValue;
use crate::chain::{ChainClient, ChainEvent, EventQuery};
use crate::error::{Result, SdkError};
use crate::primitives::Bytes32;
use futures::Stream;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exact-match constraints on an event's return values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub values: BTreeMap<String, AbiValue>,
    pub from_block: u64,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: AbiValue) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn from_block(mut self, block: u64) -> Self {
        self.from_block = block;
        self
    }

    fn query(&self, contract: &str, event: &str) -> EventQuery {
        EventQuery {
            contract: contract.to_string(),
            event: event.to_string(),
            filter: self.values.clone(),
            from_block: self.from_block,
            to_block: None,
        }
    }
}

/// Cancels a subscription from anywhere, including while it is being awaited.
#[derive(Clone)]
pub struct CancelHandle {
    id: Uuid,
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !self.tx.send_replace(true) {
            debug!(subscription = %self.id, "Subscription cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct Subscription {
    id: Uuid,
    contract: String,
    event: String,
    rx: mpsc::UnboundedReceiver<ChainEvent>,
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// Resolves on the first matching event and then unsubscribes. Fails with
    /// [`SdkError::SubscriptionCancelled`] if cancelled before anything matched.
    pub async fn listen_once(mut self) -> Result<ChainEvent> {
        let first = self.rx.recv().await;
        self.cancel.cancel();
        first.ok_or(SdkError::SubscriptionCancelled(self.id))
    }
}

impl Stream for Subscription {
    type Item = ChainEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct EventBridge {
    chain: Arc<dyn ChainClient>,
}

impl EventBridge {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }

    pub fn subscribe(&self, contract: &str, event: &str, filter: EventFilter) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let query = filter.query(contract, event);

        info!(subscription = %id, contract, event, filters = query.filter.len(), "Subscribing to event");
        let task = tokio::spawn(forward(id, self.chain.clone(), query, tx, cancel_rx));

        Subscription {
            id,
            contract: contract.to_string(),
            event: event.to_string(),
            rx,
            cancel: CancelHandle {
                id,
                tx: Arc::new(cancel_tx),
            },
            task,
        }
    }

    pub async fn once(&self, contract: &str, event: &str, filter: EventFilter) -> Result<ChainEvent> {
        self.subscribe(contract, event, filter).listen_once().await
    }

    /// Matching history up to the current block. Each call re-reads the log.
    pub async fn past_events(&self, contract: &str, event: &str, filter: &EventFilter) -> Result<Vec<ChainEvent>> {
        self.chain.past_events(&filter.query(contract, event)).await
    }

    /// Finite stream over [`EventBridge::past_events`].
    pub async fn history(
        &self,
        contract: &str,
        event: &str,
        filter: &EventFilter,
    ) -> Result<impl Stream<Item = ChainEvent>> {
        let events = self.past_events(contract, event, filter).await?;
        Ok(tokio_stream::iter(events))
    }
}

/// Log entries already handed to a subscriber. As the live feed advances,
/// entries from older blocks are dropped and the feed's block becomes the floor:
/// anything below it counts as delivered.
#[derive(Debug, Default)]
struct DeliveredLog {
    seen: HashMap<(Bytes32, u64), u64>,
    floor: u64,
}

impl DeliveredLog {
    fn record(&mut self, event: &ChainEvent) {
        self.seen.insert(event.log_key(), event.block_number);
    }

    /// True the first time a live event is offered.
    fn first_live(&mut self, event: &ChainEvent) -> bool {
        if event.block_number < self.floor {
            return false;
        }
        if event.block_number > self.floor {
            let floor = event.block_number;
            self.seen.retain(|_, block| *block >= floor);
            self.floor = floor;
        }
        self.seen.insert(event.log_key(), event.block_number).is_none()
    }
}

async fn forward(
    id: Uuid,
    chain: Arc<dyn ChainClient>,
    query: EventQuery,
    tx: mpsc::UnboundedSender<ChainEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    // Attach to the live feed before reading history so nothing falls in between.
    let mut live = match chain.live_events() {
        Ok(rx) => Some(rx),
        Err(e) => {
            warn!(subscription = %id, "Live events unavailable: {}", e);
            None
        }
    };

    let mut delivered = DeliveredLog::default();
    match chain.past_events(&query).await {
        Ok(past) => {
            for event in past {
                if *cancel.borrow() {
                    return;
                }
                delivered.record(&event);
                if tx.send(event).is_err() {
                    return;
                }
            }
        }
        Err(e) => warn!(subscription = %id, "Could not read past events: {}", e),
    }

    if let Some(rx) = live.as_mut() {
        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        debug!(subscription = %id, "Forwarder stopped by cancellation");
                        return;
                    }
                }
                received = rx.recv() => match received {
                    Ok(event) => {
                        if !query.matches(&event) || !delivered.first_live(&event) {
                            continue;
                        }
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(subscription = %id, skipped, "Subscription lagged behind the live feed");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(subscription = %id, "Event transport closed");
                        break;
                    }
                },
            }
        }
    }

    // Transport gone: hold the channel open until cancelled.
    while !*cancel.borrow() {
        if cancel.changed().await.is_err() {
            break;
        }
    }
    debug!(subscription = %id, "Forwarder released");
}
