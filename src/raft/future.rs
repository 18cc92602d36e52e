use futures::channel::oneshot::Receiver;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Sleep, sleep};

use crate::raft::error::ApplyError;

pub(crate) type ApplyResult = Result<u64, ApplyError>;

// Resolves to the log index of a submitted entry once it has been applied to
// the local state machine, or to the reason it never was. Gives up once the
// timeout passed at submission has elapsed.
#[pin_project]
pub struct ApplyFuture {
    #[pin]
    receiver: Receiver<ApplyResult>,
    #[pin]
    deadline: Sleep,
    timeout: Duration,
}

impl ApplyFuture {
    pub(crate) fn new(receiver: Receiver<ApplyResult>, timeout: Duration) -> Self {
        ApplyFuture {
            receiver,
            deadline: sleep(timeout),
            timeout,
        }
    }
}

impl Future for ApplyFuture {
    type Output = ApplyResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.receiver.poll(cx) {
            Poll::Ready(Ok(result)) => return Poll::Ready(result),

            // The engine dropped the sender without answering, which only
            // happens while it is shutting down.
            Poll::Ready(Err(_)) => return Poll::Ready(Err(ApplyError::Shutdown)),
            Poll::Pending => (),
        }
        match this.deadline.poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(ApplyError::Timeout(*this.timeout))),
            Poll::Pending => Poll::Pending,
        }
    }
}
