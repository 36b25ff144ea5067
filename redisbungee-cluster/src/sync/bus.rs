//! Pub/sub message bus
//!
//! One subscription per process covers the fixed channel set. Incoming
//! envelopes are routed by kind to registered handlers; requests are
//! answered by the installed `QueryResponder` and responses are matched to
//! in-flight requests by correlation id.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bytes::Bytes;
use redisbungee_core::models::ProxyId;
use redisbungee_core::ProxyIdentity;

use super::envelope::{Envelope, EnvelopeKind};
use super::events::{Query, QueryReply};
use crate::error::{Error, Result};
use crate::health::HealthTracker;
use crate::store::{KeySpace, StoreClient, StoreMessage, Subscription};

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Receives envelopes of the kinds it was registered for
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope);

    /// Called after the subscription was re-established; notifications may
    /// have been missed while it was down.
    async fn on_resubscribed(&self) {}
}

/// Answers network-wide queries from peers
#[async_trait]
pub trait QueryResponder: Send + Sync {
    async fn answer(&self, query: Query) -> Result<QueryReply>;
}

type PendingReplies = DashMap<String, mpsc::UnboundedSender<(ProxyId, Bytes)>>;

/// Work handed from the subscriber to the delivery task, in arrival order
enum Delivery {
    Envelope(Envelope),
    Resubscribed,
}

/// Removes an in-flight request's reply slot however the request ends
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

pub struct MessageBus {
    store: Arc<dyn StoreClient>,
    identity: ProxyIdentity,
    keys: KeySpace,
    health: Arc<HealthTracker>,
    handlers: RwLock<HashMap<EnvelopeKind, Vec<Arc<dyn EnvelopeHandler>>>>,
    responder: RwLock<Option<Arc<dyn QueryResponder>>>,
    pending: PendingReplies,
    initial_backoff: Duration,
    max_backoff: Duration,
    cancel_token: CancellationToken,
    /// Subscriber and delivery tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    pub fn new(
        store: Arc<dyn StoreClient>,
        identity: ProxyIdentity,
        key_prefix: &str,
        health: Arc<HealthTracker>,
    ) -> Self {
        let keys = KeySpace::new(key_prefix, identity.network_id());
        Self {
            store,
            identity,
            keys,
            health,
            handlers: RwLock::new(HashMap::new()),
            responder: RwLock::new(None),
            pending: DashMap::new(),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Override the resubscription backoff bounds
    #[must_use]
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    #[must_use]
    pub const fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Route envelopes of `kind` to `handler`
    pub fn register(&self, kind: EnvelopeKind, handler: Arc<dyn EnvelopeHandler>) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    pub fn set_responder(&self, responder: Arc<dyn QueryResponder>) {
        *self.responder.write() = Some(responder);
    }

    fn handlers_for(&self, kind: EnvelopeKind) -> Vec<Arc<dyn EnvelopeHandler>> {
        self.handlers.read().get(&kind).cloned().unwrap_or_default()
    }

    fn all_handlers(&self) -> Vec<Arc<dyn EnvelopeHandler>> {
        let handlers = self.handlers.read();
        let mut unique: Vec<Arc<dyn EnvelopeHandler>> = Vec::new();
        for handler in handlers.values().flatten() {
            if !unique.iter().any(|h| Arc::ptr_eq(h, handler)) {
                unique.push(Arc::clone(handler));
            }
        }
        unique
    }

    // ==================== Lifecycle ====================

    /// Subscribe to the network's channels and spawn the subscriber task.
    ///
    /// The first subscription must succeed; later disconnects are retried
    /// with exponential backoff until `shutdown`.
    ///
    /// Handlers run on a separate delivery task, so a handler that issues a
    /// `request` of its own still receives the replies.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::Closed);
        }

        let channels = self.keys.channels();
        let result = self.store.subscribe(&channels).await;
        self.health.observe(&result);
        let subscription = result?;
        info!(
            proxy_id = %self.identity.proxy_id(),
            channels = ?channels,
            "Message bus subscribed"
        );

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let bus = Arc::clone(self);
        let delivery = tokio::spawn(async move {
            bus.run_delivery(delivery_rx).await;
        });
        let bus = Arc::clone(self);
        let subscriber = tokio::spawn(async move {
            bus.run_subscriber(subscription, delivery_tx).await;
        });

        self.tasks.lock().extend([subscriber, delivery]);
        Ok(())
    }

    async fn run_subscriber(
        self: Arc<Self>,
        mut subscription: Subscription,
        delivery: mpsc::UnboundedSender<Delivery>,
    ) {
        let channels = self.keys.channels();
        let mut backoff = self.initial_backoff;

        loop {
            self.consume(&mut subscription, &delivery).await;
            if self.cancel_token.is_cancelled() {
                info!("Message bus subscriber stopped");
                return;
            }

            error!("Bus subscription ended (connection lost), resubscribing");
            self.health
                .record_failure("pub/sub subscription lost".to_string());

            // Reconnect with exponential backoff
            loop {
                tokio::select! {
                    () = self.cancel_token.cancelled() => {
                        info!("Message bus subscriber cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(backoff) => {}
                }

                let result = self.store.subscribe(&channels).await;
                self.health.observe(&result);
                match result {
                    Ok(resubscribed) => {
                        subscription = resubscribed;
                        backoff = self.initial_backoff;
                        info!("Bus resubscribed");
                        let _ = delivery.send(Delivery::Resubscribed);
                        break;
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            backoff_ms = backoff.as_millis() as u64,
                            "Bus resubscribe failed, retrying after backoff"
                        );
                        backoff = (backoff * 2).min(self.max_backoff);
                    }
                }
            }
        }
    }

    /// Drain a subscription until it ends or the bus shuts down
    async fn consume(
        self: &Arc<Self>,
        subscription: &mut Subscription,
        delivery: &mpsc::UnboundedSender<Delivery>,
    ) {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return,
                next = subscription.next() => match next {
                    Some(msg) => self.dispatch(msg, delivery),
                    None => return,
                },
            }
        }
    }

    /// Run handlers one envelope at a time, in the order they arrived
    async fn run_delivery(&self, mut delivery: mpsc::UnboundedReceiver<Delivery>) {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return,
                next = delivery.recv() => match next {
                    Some(Delivery::Envelope(envelope)) => self.deliver_local(&envelope).await,
                    Some(Delivery::Resubscribed) => {
                        for handler in self.all_handlers() {
                            handler.on_resubscribed().await;
                        }
                    }
                    None => return,
                },
            }
        }
    }

    /// Stop the subscriber and fail any in-flight requests
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        self.pending.clear();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Bus task ended abnormally");
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    // ==================== Dispatch ====================

    /// Route one incoming message without waiting on handler work: replies
    /// complete in place, requests are answered on their own task and
    /// everything else is queued for the delivery task.
    fn dispatch(self: &Arc<Self>, msg: StoreMessage, delivery: &mpsc::UnboundedSender<Delivery>) {
        let envelope = match Envelope::decode(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %msg.channel, error = %e, "Dropping malformed envelope");
                return;
            }
        };

        if envelope.network_id != *self.identity.network_id() {
            debug!(
                channel = %msg.channel,
                network_id = %envelope.network_id,
                "Ignoring envelope from another network"
            );
            return;
        }
        // Own envelopes were already applied locally
        if envelope.origin_proxy_id == *self.identity.proxy_id() {
            return;
        }

        match envelope.kind {
            EnvelopeKind::Response => self.complete(envelope),
            EnvelopeKind::Request => {
                let bus = Arc::clone(self);
                tokio::spawn(async move { bus.answer(&envelope).await });
            }
            _ => {
                let _ = delivery.send(Delivery::Envelope(envelope));
            }
        }
    }

    /// Run the local handlers for an envelope as if it had been received
    pub async fn deliver_local(&self, envelope: &Envelope) {
        for handler in self.handlers_for(envelope.kind) {
            handler.handle(envelope).await;
        }
    }

    async fn answer(&self, request: &Envelope) {
        let Some(correlation_id) = request.correlation_id.clone() else {
            warn!(origin = %request.origin_proxy_id, "Dropping request without correlation id");
            return;
        };
        let responder = self.responder.read().clone();
        let Some(responder) = responder else {
            return;
        };

        let query: Query = match request.decode_json() {
            Ok(query) => query,
            Err(e) => {
                warn!(origin = %request.origin_proxy_id, error = %e, "Dropping malformed query");
                return;
            }
        };

        let reply = match responder.answer(query).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, ?query, "Failed to answer query");
                return;
            }
        };

        let response = match Envelope::json(EnvelopeKind::Response, &self.identity, &reply) {
            Ok(envelope) => envelope.with_correlation(correlation_id),
            Err(e) => {
                warn!(error = %e, "Failed to encode query reply");
                return;
            }
        };
        if let Err(e) = self.publish(&response).await {
            warn!(error = %e, "Failed to publish query reply");
        }
    }

    fn complete(&self, response: Envelope) {
        let Some(correlation_id) = response.correlation_id.as_deref() else {
            return;
        };
        // Replies to other proxies' requests, or arriving after the deadline,
        // have no pending slot
        if let Some(slot) = self.pending.get(correlation_id) {
            let _ = slot.send((response.origin_proxy_id, response.payload));
        }
    }

    // ==================== Publishing ====================

    /// Serialize and publish an envelope on its kind's channel
    pub async fn publish(&self, envelope: &Envelope) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let payload = envelope.encode()?;
        let channel = envelope.kind.channel(&self.keys);
        let result = self.store.publish(&channel, &payload).await;
        self.health.observe(&result);
        result
    }

    /// Apply an envelope locally, then publish it to every peer
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<usize> {
        self.deliver_local(envelope).await;
        self.publish(envelope).await
    }

    /// Ask every proxy in `expected` and collect replies until all answered
    /// or `deadline` elapses. Missing peers are simply absent from the result.
    pub async fn request(
        &self,
        query: Query,
        expected: &[ProxyId],
        deadline: Duration,
    ) -> Result<Vec<(ProxyId, QueryReply)>> {
        if expected.is_empty() {
            return Ok(Vec::new());
        }

        let deadline_at = Instant::now() + deadline;
        let correlation_id = nanoid::nanoid!(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(correlation_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        let envelope = Envelope::json(EnvelopeKind::Request, &self.identity, &query)?
            .with_correlation(correlation_id.as_str());
        self.publish(&envelope).await?;

        let mut waiting: HashSet<&ProxyId> = expected.iter().collect();
        let mut replied: HashSet<ProxyId> = HashSet::new();
        let mut replies = Vec::with_capacity(expected.len());
        let timer = tokio::time::sleep_until(deadline_at);
        tokio::pin!(timer);

        while !waiting.is_empty() {
            tokio::select! {
                () = &mut timer => {
                    debug!(
                        correlation_id = %correlation_id,
                        replied = replies.len(),
                        missing = waiting.len(),
                        "Request deadline elapsed, returning partial replies"
                    );
                    break;
                }
                next = rx.recv() => {
                    let Some((origin, payload)) = next else { break };
                    if !replied.insert(origin.clone()) {
                        continue;
                    }
                    waiting.remove(&origin);
                    match serde_json::from_slice::<QueryReply>(&payload) {
                        Ok(reply) => replies.push((origin, reply)),
                        Err(e) => warn!(origin = %origin, error = %e, "Dropping malformed query reply"),
                    }
                }
            }
        }

        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::sync::events::{PluginMessage, RunCommand};

    struct Recorder {
        seen: Mutex<Vec<Envelope>>,
        resubscribed: Mutex<usize>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                resubscribed: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        async fn handle(&self, envelope: &Envelope) {
            self.seen.lock().push(envelope.clone());
        }

        async fn on_resubscribed(&self) {
            *self.resubscribed.lock() += 1;
        }
    }

    struct FixedCount(u64);

    #[async_trait]
    impl QueryResponder for FixedCount {
        async fn answer(&self, query: Query) -> Result<QueryReply> {
            match query {
                Query::PlayerCount => Ok(QueryReply::PlayerCount { count: self.0 }),
            }
        }
    }

    fn bus(store: &MemoryStore, proxy: &str, network: &str) -> Arc<MessageBus> {
        Arc::new(
            MessageBus::new(
                Arc::new(store.clone()),
                ProxyIdentity::new(proxy, network).unwrap(),
                "test",
                Arc::new(HealthTracker::new()),
            )
            .with_reconnect_backoff(Duration::from_millis(20), Duration::from_millis(100)),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_dispatch_by_kind_and_origin() {
        let store = MemoryStore::new();
        let a = bus(&store.connect(), "proxy-a", "main");
        let b = bus(&store.connect(), "proxy-b", "main");

        let recorder = Recorder::new();
        a.register(EnvelopeKind::RunCommand, recorder.clone());
        b.register(EnvelopeKind::RunCommand, recorder.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();

        let command = RunCommand {
            target: None,
            command: "alert hello".into(),
        };
        let envelope = Envelope::json(EnvelopeKind::RunCommand, &b.identity, &command).unwrap();
        b.publish(&envelope).await.unwrap();
        settle().await;

        // Only proxy-a receives it; proxy-b ignores its own envelope
        let seen = recorder.seen.lock().clone();
        assert_eq!(seen, vec![envelope]);
    }

    #[tokio::test]
    async fn test_other_network_and_garbage_are_ignored() {
        let store = MemoryStore::new();
        let main = bus(&store, "proxy-a", "main");
        let recorder = Recorder::new();
        main.register(EnvelopeKind::PluginMessage, recorder.clone());
        main.start().await.unwrap();

        let channel = main.keys().channel_messages();
        store.publish(&channel, b"not an envelope").await.unwrap();

        let other = ProxyIdentity::new("proxy-x", "other").unwrap();
        let message = PluginMessage {
            channel: "c".into(),
            data: Bytes::from_static(b"d"),
        };
        let foreign = Envelope::new(EnvelopeKind::PluginMessage, &other, message.encode().unwrap());
        store
            .publish(&channel, &foreign.encode().unwrap())
            .await
            .unwrap();

        // Subscriber keeps working after both
        let peer = ProxyIdentity::new("proxy-b", "main").unwrap();
        let valid = Envelope::new(EnvelopeKind::PluginMessage, &peer, message.encode().unwrap());
        store.publish(&channel, &valid.encode().unwrap()).await.unwrap();
        settle().await;

        assert_eq!(recorder.seen.lock().clone(), vec![valid]);
    }

    #[tokio::test]
    async fn test_request_collects_replies() {
        let store = MemoryStore::new();
        let requester = bus(&store.connect(), "proxy-a", "main");
        let b = bus(&store.connect(), "proxy-b", "main");
        let c = bus(&store.connect(), "proxy-c", "main");
        b.set_responder(Arc::new(FixedCount(3)));
        c.set_responder(Arc::new(FixedCount(4)));
        for bus in [&requester, &b, &c] {
            bus.start().await.unwrap();
        }

        let expected = [ProxyId::from("proxy-b"), ProxyId::from("proxy-c")];
        let started = Instant::now();
        let replies = requester
            .request(Query::PlayerCount, &expected, Duration::from_secs(5))
            .await
            .unwrap();

        // Returns as soon as every peer answered
        assert!(started.elapsed() < Duration::from_secs(1));
        let total: u64 = replies
            .iter()
            .map(|(_, QueryReply::PlayerCount { count })| count)
            .sum();
        assert_eq!(total, 7);
        assert!(requester.pending.is_empty());
    }

    #[tokio::test]
    async fn test_request_with_no_peers() {
        let store = MemoryStore::new();
        let requester = bus(&store, "proxy-a", "main");
        let replies = requester
            .request(Query::PlayerCount, &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn test_resubscribes_after_outage() {
        let shared = MemoryStore::new();
        let handle = shared.connect();
        let bus = bus(&handle, "proxy-a", "main");
        let recorder = Recorder::new();
        bus.register(EnvelopeKind::Kick, recorder.clone());
        bus.start().await.unwrap();

        handle.set_available(false);
        settle().await;
        assert!(bus.health.is_degraded());

        handle.set_available(true);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*recorder.resubscribed.lock(), 1);
        assert!(!bus.health.is_degraded());

        let peer = ProxyIdentity::new("proxy-b", "main").unwrap();
        let kick = Envelope::new(EnvelopeKind::Kick, &peer, b"{}".to_vec());
        shared
            .publish(&bus.keys().channel_all(), &kick.encode().unwrap())
            .await
            .unwrap();
        settle().await;
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let store = MemoryStore::new();
        let bus = bus(&store, "proxy-a", "main");
        bus.start().await.unwrap();
        bus.shutdown().await;

        let envelope = Envelope::new(EnvelopeKind::ProxyLeaving, &bus.identity, Bytes::new());
        assert!(matches!(bus.publish(&envelope).await, Err(Error::Closed)));
    }
}
