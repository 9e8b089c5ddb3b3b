use anyhow::Result;
use async_trait::async_trait;

use crate::model::Message;
use crate::service::DeliveryInfo;

/// A type capable of handling messages delivered to a consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// A method to handle a single delivered message.
    ///
    /// Returning a `Result::Ok` will automatically `ack` the delivery, while returning a
    /// `Result::Err` will automatically `nak` the delivery so that it is redelivered. A panic
    /// within the handler is treated the same as an error.
    async fn handle(&self, msg: &Message, info: &DeliveryInfo) -> Result<()>;
}
