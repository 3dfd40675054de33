//! Inbound port (driving): message handlers invoked by the dispatcher.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use tokio::time::Instant;

use crate::error::HandlerError;
use crate::ports::broker::Delivery;

/// Processes one delivered message.
///
/// `deadline` is when the dispatcher stops waiting. Returning (with `Ok` or
/// `Err`) before it gets the message acknowledged; still running at the
/// deadline gets it negatively acknowledged and requeued, and the handler
/// future is dropped.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery, deadline: Instant) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a `MessageHandler`.
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a handler.
///
/// ```
/// use msgbus::handler_fn;
///
/// let handler = handler_fn(|delivery, _deadline| async move {
///     tracing::info!(routing_key = %delivery.routing_key, "event received");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Delivery, Instant) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Delivery, Instant) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery, deadline: Instant) -> Result<(), HandlerError> {
        (self.f)(delivery, deadline).await
    }
}

#[async_trait]
impl<H> MessageHandler for std::sync::Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, delivery: Delivery, deadline: Instant) -> Result<(), HandlerError> {
        (**self).handle(delivery, deadline).await
    }
}
