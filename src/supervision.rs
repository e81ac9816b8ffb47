//! Parent for the per-connection socket writers.
//!
//! A dead writer is never restarted: the next reconnect spawns a fresh one for the new socket.
//! The supervisor keeps the writers linked to a long-lived parent and records why they stopped.

use std::convert::Infallible;
use std::ops::ControlFlow;

use kameo::actor::{ActorId, ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, Context, Message as KameoMessage};
use tracing::{debug, warn};

pub struct WriterSupervisor {
    connection: String,
    stopped_writers: u64,
    failed_writers: u64,
}

impl WriterSupervisor {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            stopped_writers: 0,
            failed_writers: 0,
        }
    }

    pub fn spawn_for(connection: impl Into<String>) -> ActorRef<Self> {
        <Self as Actor>::spawn(Self::new(connection))
    }
}

impl Actor for WriterSupervisor {
    type Args = Self;
    type Error = Infallible;

    fn name() -> &'static str {
        "WriterSupervisor"
    }

    async fn on_start(args: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    fn on_link_died(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        id: ActorId,
        reason: ActorStopReason,
    ) -> impl std::future::Future<
        Output = Result<ControlFlow<ActorStopReason>, Self::Error>,
    > + Send {
        self.stopped_writers = self.stopped_writers.saturating_add(1);
        match &reason {
            ActorStopReason::Normal | ActorStopReason::Killed => debug!(
                connection = %self.connection,
                writer = ?id,
                stopped_writers = self.stopped_writers,
                "socket writer stopped"
            ),
            other => {
                self.failed_writers = self.failed_writers.saturating_add(1);
                warn!(
                    connection = %self.connection,
                    writer = ?id,
                    reason = ?other,
                    failed_writers = self.failed_writers,
                    "socket writer died"
                );
            }
        }
        async { Ok(ControlFlow::Continue(())) }
    }
}

/// `(stopped, failed)` writer counts.
#[derive(Debug)]
pub struct WriterCounts;

impl KameoMessage<WriterCounts> for WriterSupervisor {
    type Reply = (u64, u64);

    async fn handle(
        &mut self,
        _msg: WriterCounts,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        (self.stopped_writers, self.failed_writers)
    }
}
