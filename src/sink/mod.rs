use anyhow::Result;
use async_trait::async_trait;

use crate::core::event::Event;

/// Downstream consumer of the unified event stream. Consumers are pluggable;
/// errors are logged by the pump and never stop the stream.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn consume(&self, event: &Event) -> Result<()>;
}

/// Reference consumer: one JSON envelope per line on stdout.
pub struct ConsoleConsumer;

#[async_trait]
impl EventConsumer for ConsoleConsumer {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn consume(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;
        println!("{}", line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_console_consumer_accepts_events() {
        let consumer = ConsoleConsumer;
        assert_eq!(consumer.name(), "console");

        let event = Event::Ddl {
            schema: "app".into(),
            table: "orders".into(),
            ddl: "CREATE TABLE `orders` (`id` int)".into(),
        };
        assert!(consumer.consume(&event).await.is_ok());
    }
}
