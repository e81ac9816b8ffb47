//! Reconnecting transport actor.
//!
//! Socket IO runs outside kameo: a reader task forwards frames, a heartbeat task ticks, and a
//! writer actor owns the sink. The actor owns connection state, policies and listeners, and
//! receives everything else as messages tagged with the connection epoch they belong to.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use super::events::{EventKind, EventListener, ListenerId, ListenerRegistry, TransportEvent};
use super::writer::{SocketWriter, WriteFrame, spawn_linked_writer};
use crate::core::{
    ConnectionState, ConnectionStats, DisconnectCause, HealthMonitor, HeartbeatResult,
    HeartbeatStrategy, LiveError, LiveResult, OutboundMessage, ReconnectStrategy,
    WebSocketBufferConfig, WsFrame, WsTlsConfig, decode_inbound,
    generate_message_id,
};
use crate::supervision::WriterSupervisor;
use crate::transport::WsTransport;

pub(crate) const NOT_CONNECTED_MESSAGE: &str = "Not connected to agent backend. Please try again.";
pub(crate) const PARSE_FAILED_MESSAGE: &str = "Failed to parse message from backend";
pub(crate) const SEND_FAILED_MESSAGE: &str = "Failed to send message to backend";
pub(crate) const CONNECT_FAILED_MESSAGE: &str = "Connection error to agent backend";

/// Upper bound on how long `disconnect()` waits for the close frame to be written.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Arguments passed when constructing a transport actor.
pub struct TransportActorArgs<T: WsTransport> {
    pub url: String,
    pub label: Option<String>,
    pub tls: WsTlsConfig,
    pub buffers: WebSocketBufferConfig,
    pub transport: T,
    pub reconnect: Box<dyn ReconnectStrategy>,
    pub heartbeat: Box<dyn HeartbeatStrategy>,
}

pub struct TransportActor<T: WsTransport> {
    url: String,
    label: Option<String>,
    tls: WsTlsConfig,
    buffers: WebSocketBufferConfig,
    transport: T,
    reconnect: Box<dyn ReconnectStrategy>,
    heartbeat: Box<dyn HeartbeatStrategy>,
    health: HealthMonitor,
    listeners: ListenerRegistry,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    epoch: u64,
    reconnect_attempts: u32,
    actor_ref: ActorRef<Self>,
    connect_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    writer_ref: Option<ActorRef<SocketWriter<T::Writer>>>,
    writer_supervisor_ref: Option<ActorRef<WriterSupervisor>>,
}

impl<T: WsTransport> Actor for TransportActor<T> {
    type Args = TransportActorArgs<T>;
    type Error = LiveError;

    fn name() -> &'static str {
        "TransportActor"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> LiveResult<Self> {
        let TransportActorArgs {
            url,
            label,
            tls,
            buffers,
            transport,
            reconnect,
            heartbeat,
        } = args;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            url,
            label,
            tls,
            buffers,
            transport,
            reconnect,
            heartbeat,
            health: HealthMonitor::new(),
            listeners: ListenerRegistry::new(),
            state: ConnectionState::Disconnected,
            state_tx,
            epoch: 0,
            reconnect_attempts: 0,
            actor_ref: ctx,
            connect_task: None,
            reconnect_task: None,
            reader_task: None,
            heartbeat_task: None,
            shutdown_tx,
            shutdown_rx,
            writer_ref: None,
            writer_supervisor_ref: None,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> LiveResult<()> {
        self.cancel_pending_connects();
        self.stop_io_tasks().await;
        if let Some(supervisor) = self.writer_supervisor_ref.take() {
            let _ = supervisor.stop_gracefully().await;
        }
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "TransportActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

/// Open the socket unless one is already open or opening.
pub struct Connect;

/// Close the socket, drop listeners and cancel any scheduled reconnect.
pub struct Disconnect;

/// Stamp and send a chat-style message.
pub struct SendRaw(pub OutboundMessage);

/// Send an already-encoded JSON frame.
pub struct SendFrame(pub String);

pub struct AddListener {
    pub kind: EventKind,
    pub listener: Arc<dyn EventListener>,
}

pub struct RemoveListener(pub ListenerId);

pub struct GetConnectionState;

/// Subscribe to state changes. Survives `Disconnect`, unlike event listeners.
pub struct WatchConnectionState;

pub struct GetConnectionStats;

pub(crate) struct ConnectionEstablished<TR: WsTransport> {
    epoch: u64,
    reader: TR::Reader,
    writer: TR::Writer,
}

pub(crate) struct ConnectionFailed {
    epoch: u64,
    error: String,
}

pub(crate) struct InboundFrame {
    epoch: u64,
    frame: WsFrame,
}

pub(crate) struct ConnectionClosed {
    epoch: u64,
    cause: DisconnectCause,
}

pub(crate) struct HeartbeatTick {
    epoch: u64,
}

pub(crate) struct ReconnectDue {
    epoch: u64,
}

impl<T: WsTransport> KameoMessage<Connect> for TransportActor<T> {
    type Reply = LiveResult<()>;

    async fn handle(&mut self, _msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.start_connect();
        Ok(())
    }
}

impl<T: WsTransport> KameoMessage<Disconnect> for TransportActor<T> {
    type Reply = ();

    async fn handle(&mut self, _msg: Disconnect, _ctx: &mut Context<Self, Self::Reply>) {
        self.listeners.clear();
        self.cancel_pending_connects();
        self.epoch = self.epoch.wrapping_add(1);

        if self.writer_ref.is_some() {
            self.set_state(ConnectionState::Closing);
            let close = self.write_frame(WsFrame::client_disconnect());
            if tokio::time::timeout(CLOSE_GRACE, close).await.is_err() {
                debug!(connection = %self.connection_label(), "close frame not flushed in time");
            }
        }
        self.stop_io_tasks().await;

        if self.state != ConnectionState::Disconnected {
            info!(connection = %self.connection_label(), "websocket disconnected by client");
        }
        self.set_state(ConnectionState::Disconnected);
        self.reconnect_attempts = 0;
        self.reconnect.reset();
        self.heartbeat.reset();
    }
}

impl<T: WsTransport> KameoMessage<SendRaw> for TransportActor<T> {
    type Reply = LiveResult<String>;

    async fn handle(&mut self, msg: SendRaw, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.state != ConnectionState::Connected {
            warn!(connection = %self.connection_label(), "dropping message while not connected");
            self.emit(TransportEvent::error(NOT_CONNECTED_MESSAGE));
            return Err(LiveError::NotConnected);
        }

        let id = generate_message_id();
        let message = msg.0.stamp(id.clone(), Utc::now());
        let encoded = sonic_rs::to_string(&message)?;
        if let Err(err) = self.write_frame(WsFrame::text(encoded)).await {
            self.emit(TransportEvent::error(SEND_FAILED_MESSAGE));
            return Err(err);
        }
        Ok(id)
    }
}

impl<T: WsTransport> KameoMessage<SendFrame> for TransportActor<T> {
    type Reply = LiveResult<()>;

    async fn handle(&mut self, msg: SendFrame, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.state != ConnectionState::Connected {
            return Err(LiveError::NotConnected);
        }
        self.write_frame(WsFrame::text(msg.0)).await
    }
}

impl<T: WsTransport> KameoMessage<AddListener> for TransportActor<T> {
    type Reply = ListenerId;

    async fn handle(&mut self, msg: AddListener, _ctx: &mut Context<Self, Self::Reply>) -> ListenerId {
        self.listeners.add(msg.kind, msg.listener)
    }
}

impl<T: WsTransport> KameoMessage<RemoveListener> for TransportActor<T> {
    type Reply = bool;

    async fn handle(&mut self, msg: RemoveListener, _ctx: &mut Context<Self, Self::Reply>) -> bool {
        self.listeners.remove(msg.0)
    }
}

impl<T: WsTransport> KameoMessage<GetConnectionState> for TransportActor<T> {
    type Reply = ConnectionState;

    async fn handle(
        &mut self,
        _msg: GetConnectionState,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> ConnectionState {
        self.state
    }
}

impl<T: WsTransport> KameoMessage<WatchConnectionState> for TransportActor<T> {
    type Reply = LiveResult<watch::Receiver<ConnectionState>>;

    async fn handle(
        &mut self,
        _msg: WatchConnectionState,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.state_tx.subscribe())
    }
}

impl<T: WsTransport> KameoMessage<GetConnectionStats> for TransportActor<T> {
    type Reply = ConnectionStats;

    async fn handle(
        &mut self,
        _msg: GetConnectionStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> ConnectionStats {
        self.health.get_stats(self.state)
    }
}

impl<T: WsTransport> KameoMessage<ConnectionEstablished<T>> for TransportActor<T> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ConnectionEstablished<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!(
                connection = %self.connection_label(),
                epoch = msg.epoch,
                "dropping socket from superseded connect"
            );
            return;
        }
        self.connect_task = None;
        self.on_connection_established(msg.reader, msg.writer).await;
    }
}

impl<T: WsTransport> KameoMessage<ConnectionFailed> for TransportActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: ConnectionFailed, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            return;
        }
        self.connect_task = None;
        self.set_state(ConnectionState::Disconnected);
        self.health.record_error("connect", &msg.error);
        self.emit(TransportEvent::error(CONNECT_FAILED_MESSAGE));
        let cause = DisconnectCause::HandshakeFailed { message: msg.error };
        self.schedule_reconnect("connection_failed", &cause);
    }
}

impl<T: WsTransport> KameoMessage<InboundFrame> for TransportActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: InboundFrame, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connected {
            return;
        }
        self.process_inbound(msg.frame).await;
    }
}

impl<T: WsTransport> KameoMessage<ConnectionClosed> for TransportActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: ConnectionClosed, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connected {
            return;
        }
        self.handle_connection_lost(msg.cause).await;
    }
}

impl<T: WsTransport> KameoMessage<HeartbeatTick> for TransportActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: HeartbeatTick, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connected {
            return;
        }

        if let Some(silent_for) = self.heartbeat.is_stale() {
            self.handle_connection_lost(DisconnectCause::LivenessTimeout { silent_for })
                .await;
            return;
        }

        if let Some(ping) = self.heartbeat.create_ping() {
            debug!(connection = %self.connection_label(), "sending heartbeat");
            if let Err(err) = self.write_frame(ping).await {
                self.handle_connection_lost(DisconnectCause::WriteFailure {
                    error: err.to_string(),
                })
                .await;
            }
        }
    }
}

impl<T: WsTransport> KameoMessage<ReconnectDue> for TransportActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: ReconnectDue, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Disconnected {
            return;
        }
        // The timer task is finishing on its own; dropping the handle detaches it.
        self.reconnect_task = None;
        self.start_connect();
    }
}

impl<T: WsTransport> TransportActor<T> {
    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn start_connect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(
                connection = %self.connection_label(),
                state = %self.state,
                "connect ignored; socket already open or opening"
            );
            return;
        }

        self.cancel_pending_connects();
        self.epoch = self.epoch.wrapping_add(1);
        self.set_state(ConnectionState::Connecting);
        info!(
            connection = %self.connection_label(),
            attempt = self.reconnect_attempts,
            "connecting websocket"
        );

        let epoch = self.epoch;
        let self_ref = self.actor_ref.clone();
        let connecting = self
            .transport
            .connect(self.url.clone(), self.buffers, self.tls);

        self.connect_task = Some(tokio::spawn(async move {
            match connecting.await {
                Ok((reader, writer)) => {
                    let _ = self_ref
                        .tell(ConnectionEstablished::<T> {
                            epoch,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Err(err) => {
                    let _ = self_ref
                        .tell(ConnectionFailed {
                            epoch,
                            error: err.to_string(),
                        })
                        .send()
                        .await;
                }
            }
        }));
    }

    fn cancel_pending_connects(&mut self) {
        if let Some(handle) = self.reconnect_task.take() {
            handle.abort();
        }
        if let Some(handle) = self.connect_task.take() {
            handle.abort();
        }
    }

    async fn on_connection_established(&mut self, reader: T::Reader, writer: T::Writer) {
        info!(connection = %self.connection_label(), "websocket connection established");
        self.health.reset();
        self.reconnect.reset();
        self.heartbeat.reset();
        self.reconnect_attempts = 0;

        let label = self.connection_label().to_string();
        let supervisor = self
            .writer_supervisor_ref
            .get_or_insert_with(|| WriterSupervisor::spawn_for(label))
            .clone();
        let writer = spawn_linked_writer(&supervisor, writer, self.shutdown_rx.clone()).await;
        self.writer_ref = Some(writer);

        self.spawn_reader(reader);
        self.start_heartbeat_loop();

        self.set_state(ConnectionState::Connected);
        self.emit(TransportEvent::Connected);
    }

    fn spawn_reader(&mut self, mut read: T::Reader) {
        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        let label = self.connection_label().to_string();
        let mut shutdown = self.shutdown_rx.clone();

        self.reader_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow_and_update() { break; }
                    }
                    frame = read.next() => {
                        let cause = match frame {
                            Some(Ok(WsFrame::Close(close))) => {
                                info!(connection = %label, close = ?close, "received websocket close frame");
                                let (code, reason) = close
                                    .map(|f| (Some(f.code), f.reason_text().to_string()))
                                    .unwrap_or((None, "remote closed".to_string()));
                                DisconnectCause::RemoteClosed { code, reason }
                            }
                            Some(Ok(frame)) => {
                                if actor_ref.tell(InboundFrame { epoch, frame }).send().await.is_err() {
                                    break;
                                }
                                continue;
                            }
                            Some(Err(err)) => DisconnectCause::ReadFailure { error: err.to_string() },
                            None => DisconnectCause::RemoteClosed {
                                code: None,
                                reason: "stream ended".to_string(),
                            },
                        };
                        let _ = actor_ref.tell(ConnectionClosed { epoch, cause }).send().await;
                        break;
                    }
                }
            }
        }));
    }

    fn start_heartbeat_loop(&mut self) {
        if let Some(handle) = self.heartbeat_task.take() {
            handle.abort();
        }

        let epoch = self.epoch;
        let period = self.heartbeat.interval();
        let actor_ref = self.actor_ref.clone();
        let mut shutdown = self.shutdown_rx.clone();

        self.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = ticker.tick() => {
                        if actor_ref.tell(HeartbeatTick { epoch }).send().await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    async fn process_inbound(&mut self, frame: WsFrame) {
        self.health.record_message();

        match self.heartbeat.handle_inbound(&frame) {
            HeartbeatResult::Reply(reply) => {
                if let Err(err) = self.write_frame(reply).await {
                    debug!(connection = %self.connection_label(), error = %err, "pong reply failed");
                }
                return;
            }
            HeartbeatResult::Ack(rtt) => {
                if let Some(rtt) = rtt {
                    self.health.record_rtt(rtt);
                }
                return;
            }
            HeartbeatResult::NotHeartbeat => {}
        }

        let Some(payload) = frame.payload() else {
            return;
        };

        match decode_inbound(payload) {
            Ok(message) => self.emit(TransportEvent::Message(message)),
            Err(err) => {
                let error = err.to_string();
                self.health.record_error("decode", &error);
                warn!(
                    connection = %self.connection_label(),
                    error = %error,
                    payload_len = payload.len(),
                    "failed to parse inbound frame"
                );
                self.emit(TransportEvent::error(PARSE_FAILED_MESSAGE));
            }
        }
    }

    async fn handle_connection_lost(&mut self, cause: DisconnectCause) {
        self.health.record_error("disconnect", &cause.describe());
        self.stop_io_tasks().await;
        self.set_state(ConnectionState::Disconnected);
        self.heartbeat.reset();

        if cause.is_clean() {
            self.log_reconnect_plan("disconnect", "clean_close", &cause, None);
            self.emit(TransportEvent::Disconnected {
                reason: cause.describe(),
                exhausted: false,
            });
            return;
        }

        self.schedule_reconnect("disconnect", &cause);
    }

    fn schedule_reconnect(&mut self, event: &str, cause: &DisconnectCause) {
        if !self.reconnect.should_retry(self.reconnect_attempts) {
            self.log_reconnect_plan(event, "retry_exhausted", cause, None);
            self.emit(TransportEvent::Disconnected {
                reason: cause.describe(),
                exhausted: true,
            });
            return;
        }

        let delay = self.reconnect.next_delay();
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.health.increment_reconnect();
        self.log_reconnect_plan(event, "scheduled", cause, Some(delay));
        self.emit(TransportEvent::Reconnecting {
            attempt: self.reconnect_attempts,
            delay,
        });

        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        if let Some(handle) = self.reconnect_task.take() {
            handle.abort();
        }
        self.reconnect_task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = actor_ref.tell(ReconnectDue { epoch }).send().await;
        }));
    }

    async fn write_frame(&mut self, frame: WsFrame) -> LiveResult<()> {
        let Some(writer) = self.writer_ref.as_ref() else {
            return Err(LiveError::NotConnected);
        };
        match writer.ask(WriteFrame(frame)).await {
            Ok(()) => {
                self.health.record_sent();
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    SendError::HandlerError(err) => err,
                    other => LiveError::ActorError(other.to_string()),
                };
                let msg = err.to_string();
                self.health.record_error("outbound", &msg);
                warn!(
                    connection = %self.connection_label(),
                    error = %msg,
                    "websocket writer send failed"
                );
                Err(err)
            }
        }
    }

    fn emit(&self, event: TransportEvent) {
        let delivered = self.listeners.emit(&event);
        if delivered == 0 {
            debug!(
                connection = %self.connection_label(),
                kind = ?event.kind(),
                "transport event had no listeners"
            );
        }
    }

    async fn stop_io_tasks(&mut self) {
        let _ = self.shutdown_tx.send(true);
        Self::stop_task(&mut self.reader_task).await;
        Self::stop_task(&mut self.heartbeat_task).await;
        self.teardown_writer().await;
        self.reset_shutdown_channel();
    }

    async fn stop_task(handle: &mut Option<JoinHandle<()>>) {
        if let Some(handle) = handle.take() {
            // The task may be parked on a full mailbox of this very actor.
            handle.abort();
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!("task terminated with error: {err}");
                }
            }
        }
    }

    fn reset_shutdown_channel(&mut self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;
        self.shutdown_rx = shutdown_rx;
    }

    async fn teardown_writer(&mut self) {
        let writer = self.writer_ref.take();

        if let (Some(writer), Some(supervisor)) = (&writer, self.writer_supervisor_ref.as_ref()) {
            let _ = writer.stop_gracefully().await;
            writer.wait_for_shutdown().await;
            writer.unlink(supervisor).await;
        }
    }

    fn connection_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.url)
    }

    fn log_reconnect_plan(
        &self,
        event: &str,
        note: &str,
        cause: &DisconnectCause,
        delay: Option<Duration>,
    ) {
        let delay_ms = delay.map(|d| d.as_millis().min(u64::MAX as u128) as u64);
        let stats = self.health.get_stats(self.state);
        let uptime_ms = stats.uptime.as_millis().min(u64::MAX as u128) as u64;
        let last_message_age_ms = stats.last_message_age.as_millis().min(u64::MAX as u128) as u64;

        if note == "clean_close" {
            info!(
                connection = %self.connection_label(),
                event = %event,
                note = %note,
                cause = ?cause,
                uptime_ms,
                "websocket closed cleanly by server"
            );
        } else {
            warn!(
                connection = %self.connection_label(),
                url = %self.url,
                event = %event,
                note = %note,
                cause = ?cause,
                attempt = self.reconnect_attempts,
                delay_ms,
                uptime_ms,
                last_message_age_ms,
                messages = stats.messages,
                reconnects = stats.reconnects,
                "websocket reconnect plan"
            );
        }
    }
}
