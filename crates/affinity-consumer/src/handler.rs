use affinity_broker::ReceivedMessage;
use async_trait::async_trait;
use std::future::Future;

use crate::state::SessionContext;

/// How the dispatcher should settle a handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Complete,
    Abandon,
}

/// Registered message handler, invoked once per delivery.
///
/// An `Err` or a panic is treated the same as `Settlement::Abandon`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &SessionContext,
        message: &ReceivedMessage,
    ) -> anyhow::Result<Settlement>;
}

/// Adapter from an async closure to `MessageHandler`.
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(SessionContext, ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Settlement>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(SessionContext, ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Settlement>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: &SessionContext,
        message: &ReceivedMessage,
    ) -> anyhow::Result<Settlement> {
        (self.0)(ctx.clone(), message.clone()).await
    }
}
