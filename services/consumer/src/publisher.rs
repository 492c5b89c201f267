// Demo producer: fills the queue with a few ordered sessions.
use affinity_broker::InMemoryBroker;
use anyhow::{Context, Result};
use bytes::Bytes;

use crate::handlers::FINAL_MESSAGE;

pub fn demo_session_id(index: usize) -> String {
    format!("session-{}", index + 1)
}

/// Send `messages_per_session` messages to each of `sessions` sessions, the
/// last one being the final-message marker. Returns the number sent.
pub fn publish_demo(
    broker: &InMemoryBroker,
    queue: &str,
    sessions: usize,
    messages_per_session: usize,
) -> Result<usize> {
    let mut sent = 0;
    for index in 0..sessions {
        let session_id = demo_session_id(index);
        let bodies: Vec<Bytes> = (1..=messages_per_session)
            .map(|n| {
                if n == messages_per_session {
                    Bytes::from_static(FINAL_MESSAGE.as_bytes())
                } else {
                    Bytes::from(format!("message {n} for {session_id}"))
                }
            })
            .collect();
        broker
            .send_batch(queue, &session_id, &bodies)
            .with_context(|| format!("publish demo session {session_id}"))?;
        sent += bodies.len();
    }
    metrics::counter!("affinity_demo_published_total").increment(sent as u64);
    tracing::info!(queue, sessions, sent, "demo messages published");
    Ok(sent)
}
