use anyhow::Result;
use rand::Rng;
use relay::{DeliveryInfo, Message, MessageHandler};

/// A handler which logs every message it receives.
pub struct LogHandler {
    /// The upper bound of a random pause per message, simulating processing work.
    pub max_work_ms: Option<u64>,
}

#[relay::async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, msg: &Message, info: &DeliveryInfo) -> Result<()> {
        let payload = std::str::from_utf8(&msg.payload).unwrap_or("[binary data]");
        tracing::info!(
            id = %msg.id,
            payload,
            created_at = %msg.created_at,
            sequence = info.stream_sequence,
            delivered = info.delivered,
            "received message",
        );
        if let Some(max) = self.max_work_ms {
            let pause = rand::thread_rng().gen_range(0..=max);
            tokio::time::sleep(std::time::Duration::from_millis(pause)).await;
        }
        Ok(())
    }
}
