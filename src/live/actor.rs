//! Subscription bookkeeping actor.
//!
//! Owns every subscription and decides, per subscription, whether it is fed by transport
//! pushes or by its own poll task. Poll tasks run detached and only check the shared `active`
//! flag before invoking callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, Reply, WeakActorRef};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::source::DataSource;
use super::subscription::{
    DataCallback, PollContext, SubscriptionId, SubscriptionOptions, spawn_fetch_once,
    spawn_poller,
};
use crate::client::TransportEvent;
use crate::core::{InboundMessage, LiveError, LiveResult, PushUpdate};

pub struct LiveDataActorArgs {
    pub source: Arc<dyn DataSource>,
    pub default_interval: Duration,
    /// Transport state at spawn time; later changes arrive as [`TransportSignal`]s.
    pub connected: bool,
}

enum FeedMode {
    Push,
    Polling(JoinHandle<()>),
}

struct Subscription {
    id: SubscriptionId,
    endpoint: String,
    callback: DataCallback,
    options: SubscriptionOptions,
    interval: Duration,
    active: Arc<AtomicBool>,
    mode: FeedMode,
    /// One-shot REST fetch for `immediate` push subscriptions.
    fetch: Option<JoinHandle<()>>,
}

impl Subscription {
    fn poll_context(&self, source: &Arc<dyn DataSource>) -> PollContext {
        PollContext {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            callback: self.callback.clone(),
            options: self.options.clone(),
            interval: self.interval,
            active: self.active.clone(),
            source: source.clone(),
        }
    }

    fn is_polling(&self) -> bool {
        matches!(self.mode, FeedMode::Polling(_))
    }

    fn start_polling(&mut self, source: &Arc<dyn DataSource>) {
        if !self.is_polling() {
            let task = spawn_poller(self.poll_context(source), false);
            self.mode = FeedMode::Polling(task);
        }
    }

    fn stop_polling(&mut self) {
        if let FeedMode::Polling(task) = std::mem::replace(&mut self.mode, FeedMode::Push) {
            task.abort();
        }
    }

    /// Flag first so an in-flight fetch resolving after the abort delivers nothing.
    fn cancel(mut self) {
        self.active.store(false, Ordering::Release);
        self.stop_polling();
        if let Some(fetch) = self.fetch.take() {
            fetch.abort();
        }
    }

    fn deliver_push(&self, update: &PushUpdate) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        if let Some(data) = self.options.apply(update.content.clone()) {
            (self.callback)(data);
        }
    }
}

/// Snapshot of the service's feed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Reply)]
pub struct LiveStatus {
    pub connected: bool,
    /// Reconnects were exhausted; everything polls from here on.
    pub degraded: bool,
    pub subscriptions: usize,
    pub polling: usize,
}

pub struct LiveDataActor {
    source: Arc<dyn DataSource>,
    default_interval: Duration,
    connected: bool,
    degraded: bool,
    subscriptions: Vec<Subscription>,
}

impl Actor for LiveDataActor {
    type Args = LiveDataActorArgs;
    type Error = LiveError;

    fn name() -> &'static str {
        "LiveDataActor"
    }

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> LiveResult<Self> {
        Ok(Self {
            source: args.source,
            default_interval: args.default_interval,
            connected: args.connected,
            degraded: false,
            subscriptions: Vec::new(),
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> LiveResult<()> {
        self.cancel_all();
        Ok(())
    }
}

impl LiveDataActor {
    fn push_available(&self) -> bool {
        self.connected && !self.degraded
    }

    fn cancel_all(&mut self) -> usize {
        let count = self.subscriptions.len();
        for subscription in self.subscriptions.drain(..) {
            subscription.cancel();
        }
        count
    }

    fn fall_back_to_polling(&mut self) {
        let mut moved = 0usize;
        for subscription in self.subscriptions.iter_mut().filter(|s| !s.is_polling()) {
            subscription.start_polling(&self.source);
            moved += 1;
        }
        if moved > 0 {
            info!(subscriptions = moved, degraded = self.degraded, "falling back to polling");
        }
    }

    fn promote_to_push(&mut self) {
        let mut promoted = 0usize;
        for subscription in self.subscriptions.iter_mut().filter(|s| s.is_polling()) {
            subscription.stop_polling();
            promoted += 1;
        }
        if promoted > 0 {
            info!(subscriptions = promoted, "transport connected; switching polling subscriptions to push");
        }
    }

    fn route_push(&self, update: &PushUpdate) {
        let mut delivered = 0usize;
        for subscription in self
            .subscriptions
            .iter()
            .filter(|s| !s.is_polling())
            .filter(|s| s.options.matches_topic(update.topic, &s.endpoint))
        {
            subscription.deliver_push(update);
            delivered += 1;
        }
        debug!(topic = update.topic.wire_name(), delivered, "push update routed");
    }
}

pub(crate) struct Subscribe {
    pub endpoint: String,
    pub callback: DataCallback,
    pub options: SubscriptionOptions,
}

pub(crate) struct Unsubscribe(pub SubscriptionId);

pub(crate) struct UnsubscribeAll;

pub(crate) struct TransportSignal(pub TransportEvent);

pub(crate) struct GetStatus;

impl KameoMessage<Subscribe> for LiveDataActor {
    type Reply = SubscriptionId;

    async fn handle(&mut self, msg: Subscribe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let Subscribe {
            endpoint,
            callback,
            options,
        } = msg;
        let id = SubscriptionId::generate();
        let interval = options.interval.unwrap_or(self.default_interval);
        let immediate = options.immediate;

        let mut subscription = Subscription {
            id: id.clone(),
            endpoint,
            callback,
            options,
            interval,
            active: Arc::new(AtomicBool::new(true)),
            mode: FeedMode::Push,
            fetch: None,
        };

        if self.push_available() {
            if immediate {
                subscription.fetch = Some(spawn_fetch_once(subscription.poll_context(&self.source)));
            }
        } else {
            let task = spawn_poller(subscription.poll_context(&self.source), immediate);
            subscription.mode = FeedMode::Polling(task);
        }

        debug!(
            subscription = %id,
            endpoint = %subscription.endpoint,
            polling = subscription.is_polling(),
            interval_ms = interval.as_millis() as u64,
            "subscribed"
        );
        self.subscriptions.push(subscription);
        id
    }
}

impl KameoMessage<Unsubscribe> for LiveDataActor {
    type Reply = bool;

    async fn handle(&mut self, msg: Unsubscribe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        match self.subscriptions.iter().position(|s| s.id == msg.0) {
            Some(index) => {
                self.subscriptions.remove(index).cancel();
                debug!(subscription = %msg.0, "unsubscribed");
                true
            }
            None => false,
        }
    }
}

impl KameoMessage<UnsubscribeAll> for LiveDataActor {
    type Reply = usize;

    async fn handle(&mut self, _msg: UnsubscribeAll, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.cancel_all()
    }
}

impl KameoMessage<TransportSignal> for LiveDataActor {
    type Reply = ();

    async fn handle(&mut self, msg: TransportSignal, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        match msg.0 {
            TransportEvent::Message(InboundMessage::Push(update)) => self.route_push(&update),
            TransportEvent::Message(_) | TransportEvent::Error(_) => {}
            TransportEvent::Connected => {
                self.connected = true;
                if !self.degraded {
                    self.promote_to_push();
                }
            }
            TransportEvent::Reconnecting { attempt, .. } => {
                self.connected = false;
                debug!(attempt, "transport reconnecting; push feeds paused");
            }
            TransportEvent::Disconnected { reason, exhausted } => {
                self.connected = false;
                if exhausted && !self.degraded {
                    self.degraded = true;
                    warn!(reason = %reason, "transport gave up; live data degraded to polling");
                }
                self.fall_back_to_polling();
            }
        }
    }
}

impl KameoMessage<GetStatus> for LiveDataActor {
    type Reply = LiveStatus;

    async fn handle(&mut self, _msg: GetStatus, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        LiveStatus {
            connected: self.connected,
            degraded: self.degraded,
            subscriptions: self.subscriptions.len(),
            polling: self.subscriptions.iter().filter(|s| s.is_polling()).count(),
        }
    }
}
