//! Sender and receiver pipelines
//!
//! Each side of a transfer is an explicit state machine. A step consumes
//! the transfer context, performs one unit of work against the
//! collaborators and hands the context back with the next step set and an
//! event telling the driver what to do:
//!
//! - [`StepEvent::Continue`]: run the next step right away
//! - [`StepEvent::Await`]: the transfer waits for an external input, such
//!   as a receipt or the scheduler's completion signal
//! - [`StepEvent::Finished`]: a terminal state was reached
//!
//! [`drive`] is the minimal scheduler: it runs steps until the pipeline
//! awaits or finishes. Persisting contexts between calls is up to the
//! embedding scheduler.

mod receiver;
mod sender;

use async_trait::async_trait;

pub use receiver::{Receiver, ReceiverContext, ReceiverStep};
pub use sender::{Sender, SenderContext, SenderStep, TRANSFER_CONTENT_TYPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Continue,
    Await,
    Finished,
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    type Context: Send + 'static;

    /// Run the context's next step
    async fn step(&self, ctx: Self::Context) -> (Self::Context, StepEvent);
}

/// Run steps until the pipeline awaits input or finishes
pub async fn drive<P>(pipeline: &P, mut ctx: P::Context) -> (P::Context, StepEvent)
where
    P: Pipeline + ?Sized,
{
    loop {
        let (next, event) = pipeline.step(ctx).await;
        ctx = next;
        if event != StepEvent::Continue {
            return (ctx, event);
        }
    }
}
