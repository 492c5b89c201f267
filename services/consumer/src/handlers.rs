// Sample message handler and session lifecycle wired into the service.
use affinity_broker::ReceivedMessage;
use affinity_consumer::{MessageHandler, SessionContext, SessionLifecycle, Settlement};
use async_trait::async_trait;
use bytes::Bytes;

/// Seeded into every session when it is acquired.
pub const OPENING_STATE: &str =
    "Some state specific to this session when the session is opened for processing.";
/// Marks a session whose final message was handled; cleared on close.
pub const FINAL_STATE: &str =
    "Some state that indicates the final message was received for the session";
/// Body a producer sends as the last message of a session.
pub const FINAL_MESSAGE: &str = "end-of-session";

/// Logs each message and completes it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(
        &self,
        ctx: &SessionContext,
        message: &ReceivedMessage,
    ) -> anyhow::Result<Settlement> {
        let body = String::from_utf8_lossy(&message.body);
        tracing::info!(
            session_id = ctx.session_id(),
            sequence = message.sequence,
            delivery_count = message.delivery_count,
            body = %body,
            "received message"
        );
        if message.body == FINAL_MESSAGE.as_bytes() {
            ctx.set_state(Some(Bytes::from_static(FINAL_STATE.as_bytes())))
                .await?;
        }
        Ok(Settlement::Complete)
    }
}

/// Seeds session state on open and clears it on close once the final
/// message has been seen.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStateLifecycle;

#[async_trait]
impl SessionLifecycle for SessionStateLifecycle {
    async fn initializing(&self, ctx: &SessionContext) -> anyhow::Result<()> {
        ctx.set_state(Some(Bytes::from_static(OPENING_STATE.as_bytes())))
            .await?;
        tracing::debug!(session_id = ctx.session_id(), "session state seeded");
        Ok(())
    }

    async fn closing(&self, ctx: &SessionContext) -> anyhow::Result<()> {
        let state = ctx.get_state().await?;
        if state.as_deref() == Some(FINAL_STATE.as_bytes()) {
            ctx.set_state(None).await?;
            tracing::debug!(session_id = ctx.session_id(), "session state cleared");
        }
        Ok(())
    }
}
