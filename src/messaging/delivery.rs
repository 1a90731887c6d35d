use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tower::limit::RateLimitLayer;
use tower::{Service, ServiceBuilder, ServiceExt};
use tracing::{debug, info, warn};

use super::{CallbackHandler, DeliveryConfig, StatusReceiver, TaskCallback};

/// `tower` service over a [`CallbackHandler`]
#[derive(Clone)]
pub struct HandlerService {
    handler: Arc<dyn CallbackHandler>,
}

impl HandlerService {
    pub fn new(handler: Arc<dyn CallbackHandler>) -> Self {
        Self { handler }
    }
}

impl Service<TaskCallback> for HandlerService {
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, callback: TaskCallback) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            handler.handle(callback).await;
            Ok(())
        })
    }
}

/// Drain `receiver` into `handler` until the channel closes or `shutdown`
/// fires, with up to `config.concurrency` callbacks in progress at once.
/// Callbacks already handed over finish before this returns. Returns the
/// number of callbacks delivered.
pub async fn run_delivery(
    mut receiver: StatusReceiver,
    handler: Arc<dyn CallbackHandler>,
    config: DeliveryConfig,
    shutdown: CancellationToken,
) -> u64 {
    let throttle = config.throttle;
    let concurrency = config.concurrency.max(1);
    let rate_limit = throttle
        .is_enabled()
        .then(|| RateLimitLayer::new(throttle.max_messages, throttle.period()));

    if throttle.is_enabled() {
        info!(
            max_messages = throttle.max_messages,
            period_ms = throttle.period_ms,
            "Callback delivery throttled"
        );
    }

    let mut service = ServiceBuilder::new()
        .option_layer(rate_limit)
        .service(HandlerService::new(handler));

    let mut in_progress: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
    let mut delivered = 0u64;
    loop {
        if in_progress.len() >= concurrency {
            in_progress.next().await;
            continue;
        }

        let callback = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(()) = in_progress.next(), if !in_progress.is_empty() => continue,
            next = receiver.recv() => match next {
                Some(callback) => callback,
                None => break,
            },
        };

        debug!(
            task_id = %callback.task_id,
            delivery = callback.delivery,
            status = %callback.update.status,
            "Delivering callback"
        );

        let ready = match service.ready().await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "Callback service unavailable");
                break;
            }
        };
        let delivery = ready.call(callback);
        in_progress.push(Box::pin(async move {
            if let Err(e) = delivery.await {
                warn!(error = %e, "Callback delivery failed");
            }
        }));
        delivered += 1;
    }

    while in_progress.next().await.is_some() {}
    debug!(delivered, "Callback delivery stopped");
    delivered
}
