//! Shared results for deduplicated work.
//!
//! A command has one result but any number of interested callers. Each caller
//! holds a [`Waiter`]: either the sending half of a oneshot channel whose
//! receiving half is a [`Pending`] future, or a callback used internally to
//! resume walkers without blocking a thread.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{Result, TreeError};

type Callback<R> = Box<dyn FnOnce(Result<R>) + Send>;

/// One party interested in a result.
pub(crate) enum Waiter<R> {
    Channel(oneshot::Sender<Result<R>>),
    Callback(Callback<R>),
    Discard,
}

impl<R> Waiter<R> {
    pub(crate) fn callback(callback: impl FnOnce(Result<R>) + Send + 'static) -> Self {
        Self::Callback(Box::new(callback))
    }

    pub(crate) fn resolve(self, result: Result<R>) {
        match self {
            // The receiver may be gone; nobody is listening then.
            Self::Channel(sender) => {
                let _ = sender.send(result);
            }
            Self::Callback(callback) => callback(result),
            Self::Discard => {}
        }
    }
}

impl<R> fmt::Debug for Waiter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Channel(_) => "channel",
            Self::Callback(_) => "callback",
            Self::Discard => "discard",
        };
        f.debug_tuple("Waiter").field(&kind).finish()
    }
}

/// Creates a connected waiter/future pair.
pub(crate) fn channel<R>() -> (Waiter<R>, Pending<R>) {
    let (sender, receiver) = oneshot::channel();
    (Waiter::Channel(sender), Pending { receiver })
}

/// Resolves every waiter with a clone of the same result.
pub(crate) fn resolve_all<R: Clone>(waiters: Vec<Waiter<R>>, result: Result<R>) {
    for waiter in waiters {
        waiter.resolve(result.clone());
    }
}

/// The caller's handle on a result that may not exist yet.
///
/// `Pending` is a [`Future`]; outside async code use [`Pending::wait`] or poll
/// with [`Pending::try_take`]. A result whose producer vanished without
/// answering resolves as [`TreeError::Cancelled`].
pub struct Pending<R> {
    receiver: oneshot::Receiver<Result<R>>,
}

impl<R> Pending<R> {
    pub fn ready(value: R) -> Self {
        Self::settled(Ok(value))
    }

    pub fn rejected(error: TreeError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(result: Result<R>) -> Self {
        let (waiter, pending) = channel();
        waiter.resolve(result);
        pending
    }

    /// Returns the result if it has arrived, without blocking.
    pub fn try_take(&mut self) -> Option<Result<R>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(dropped())),
        }
    }

    /// Blocks the calling thread until the result arrives.
    ///
    /// Must not be called from inside an async runtime or from the consumer
    /// thread that would produce the result.
    pub fn wait(self) -> Result<R> {
        self.receiver.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }
}

fn dropped() -> TreeError {
    TreeError::Cancelled("result producer dropped".to_string())
}

impl<R> Future for Pending<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(dropped())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> fmt::Debug for Pending<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn fan_out_reaches_every_waiter() {
        let (first, mut first_pending) = channel::<u32>();
        let (second, mut second_pending) = channel::<u32>();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let callback = Waiter::callback(move |result| *sink.lock() = Some(result));

        resolve_all(vec![first, second, callback, Waiter::Discard], Ok(7));

        assert_eq!(first_pending.try_take(), Some(Ok(7)));
        assert_eq!(second_pending.try_take(), Some(Ok(7)));
        assert_eq!(*seen.lock(), Some(Ok(7)));
    }

    #[test]
    fn dropped_waiter_reads_as_cancelled() {
        let (waiter, mut pending) = channel::<u32>();
        assert_eq!(pending.try_take(), None);
        drop(waiter);
        assert!(matches!(pending.try_take(), Some(Err(TreeError::Cancelled(_)))));
    }

    #[test]
    fn settled_constructors() {
        assert_eq!(Pending::ready("done").wait(), Ok("done"));
        assert_eq!(
            Pending::<()>::rejected(TreeError::Disposed).wait(),
            Err(TreeError::Disposed)
        );
    }

    #[tokio::test]
    async fn pending_is_awaitable() {
        let (waiter, pending) = channel::<&'static str>();
        std::thread::spawn(move || waiter.resolve(Ok("from thread")));
        assert_eq!(pending.await, Ok("from thread"));
    }
}
