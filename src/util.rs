//! Async utilities

use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::*;

pin_project! {
    /// Cancellable accepts a param `future` for I/O,
    /// abort the waiting when `cancel_future` returns.
    ///
    /// The `cancel_future` can be a timer or a notification channel recv()
    pub struct Cancellable<F, C> {
        #[pin]
        future: F,
        #[pin]
        cancel_future: C,
    }
}

impl<F: Future + Send, C: Future + Send> Cancellable<F, C> {
    pub fn new(future: F, cancel_future: C) -> Self {
        Self { future, cancel_future }
    }
}

impl<F: Future + Send, C: Future + Send> Future for Cancellable<F, C> {
    type Output = Result<F::Output, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _self = self.project();
        if let Poll::Ready(output) = _self.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }
        if let Poll::Ready(_) = _self.cancel_future.poll(cx) {
            return Poll::Ready(Err(()));
        }
        return Poll::Pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancellable() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let r = Cancellable::new(
                tokio::time::sleep(Duration::from_millis(1)),
                tokio::time::sleep(Duration::from_secs(5)),
            )
            .await;
            assert!(r.is_ok());
            let r = Cancellable::new(
                tokio::time::sleep(Duration::from_secs(5)),
                tokio::time::sleep(Duration::from_millis(1)),
            )
            .await;
            assert!(r.is_err());
        });
    }
}
