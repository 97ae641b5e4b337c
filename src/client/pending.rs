use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};

use crate::client::client_error::ClientError;

/// Sending side of a [Pending] handle, completed exactly once by the dispatch path (or by
///  connection teardown)
pub type Completer<T> = oneshot::Sender<Result<T, ClientError>>;

/// The caller's handle for the result of an asynchronous client operation.
///
/// It resolves exactly once. If the connection goes away before the operation completes, it
///  resolves to [ClientError::ConnectionClosed]; if the connection has a request timeout
///  configured and it expires first, to [ClientError::Timeout].
///
/// Dropping the handle does not cancel the operation.
#[must_use = "a Pending does nothing unless awaited; the request is sent regardless"]
pub struct Pending<T> {
    state: PendingState<T>,
    deadline: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
}

enum PendingState<T> {
    Waiting(oneshot::Receiver<Result<T, ClientError>>),
    Failed(Option<ClientError>),
}

impl<T> Pending<T> {
    pub fn new(deadline: Option<Instant>) -> (Completer<T>, Pending<T>) {
        let (send, recv) = oneshot::channel();
        (send, Pending {
            state: PendingState::Waiting(recv),
            deadline,
            sleep: None,
        })
    }

    /// A handle that is already resolved with an error
    pub fn failed(err: ClientError) -> Pending<T> {
        Pending {
            state: PendingState::Failed(Some(err)),
            deadline: None,
            sleep: None,
        }
    }
}

impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
    type Output = Result<T, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        let recv = match &mut this.state {
            PendingState::Failed(err) => {
                return Poll::Ready(Err(err.take().unwrap_or(ClientError::ConnectionClosed)));
            }
            PendingState::Waiting(recv) => recv,
        };

        if let Poll::Ready(result) = Pin::new(recv).poll(cx) {
            return Poll::Ready(match result {
                Ok(result) => result,
                Err(_) => Err(ClientError::ConnectionClosed),
            });
        }

        if let Some(deadline) = this.deadline {
            let sleep = this.sleep.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
            if sleep.as_mut().poll(cx).is_ready() {
                this.state = PendingState::Failed(None);
                return Poll::Ready(Err(ClientError::Timeout));
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_completed() {
        let (completer, pending) = Pending::<u32>::new(None);
        completer.send(Ok(5)).unwrap();
        assert_eq!(pending.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_dropped_completer() {
        let (completer, pending) = Pending::<u32>::new(None);
        drop(completer);
        assert!(matches!(pending.await, Err(ClientError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_failed() {
        let pending = Pending::<()>::failed(ClientError::InvalidArgument("x".to_string()));
        assert!(matches!(pending.await, Err(ClientError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (completer, pending) = Pending::<u32>::new(Some(Instant::now() + Duration::from_secs(3)));
        assert!(matches!(pending.await, Err(ClientError::Timeout)));

        // completing after the timeout is harmless
        assert!(completer.send(Ok(1)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_before_timeout() {
        let (completer, pending) = Pending::<u32>::new(Some(Instant::now() + Duration::from_secs(3)));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            completer.send(Ok(9)).unwrap();
        });
        assert_eq!(pending.await.unwrap(), 9);
    }
}
