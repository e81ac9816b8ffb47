use futures_util::{Sink, SinkExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::core::{LiveError, LiveResult, WsFrame};
use crate::supervision::WriterSupervisor;

/// Owns the outbound half of one socket; frames are written in mailbox order.
pub struct SocketWriter<W> {
    sink: W,
    closing: watch::Receiver<bool>,
    frames_written: u64,
}

impl<W> Actor for SocketWriter<W>
where
    W: Sink<WsFrame, Error = LiveError> + Send + Sync + Unpin + 'static,
{
    type Args = Self;
    type Error = LiveError;

    fn name() -> &'static str {
        "SocketWriter"
    }

    async fn on_start(args: Self::Args, _actor_ref: ActorRef<Self>) -> LiveResult<Self> {
        Ok(args)
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> LiveResult<()> {
        debug!(frames_written = self.frames_written, "socket writer stopping");
        Ok(())
    }
}

#[derive(Debug)]
pub struct WriteFrame(pub WsFrame);

impl<W> KameoMessage<WriteFrame> for SocketWriter<W>
where
    W: Sink<WsFrame, Error = LiveError> + Send + Sync + Unpin + 'static,
{
    type Reply = LiveResult<()>;

    async fn handle(
        &mut self,
        WriteFrame(frame): WriteFrame,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        // The close frame still goes out while closing so the backend sees a clean close.
        if *self.closing.borrow() && !matches!(frame, WsFrame::Close(_)) {
            return Err(LiveError::InvalidState("socket writer is closing".to_string()));
        }
        trace!(target: "agent_live::writer", frames_written = self.frames_written, "writing frame");
        self.sink.send(frame).await?;
        self.frames_written += 1;
        Ok(())
    }
}

/// Spawn a writer for a freshly opened socket, linked to `supervisor`.
pub async fn spawn_linked_writer<W>(
    supervisor: &ActorRef<WriterSupervisor>,
    sink: W,
    closing: watch::Receiver<bool>,
) -> ActorRef<SocketWriter<W>>
where
    W: Sink<WsFrame, Error = LiveError> + Send + Sync + Unpin + 'static,
{
    let writer = <SocketWriter<W> as Actor>::spawn(SocketWriter {
        sink,
        closing,
        frames_written: 0,
    });
    writer.link(supervisor).await;
    writer
}
