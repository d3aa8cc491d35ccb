//! Incoming pipeline
//!
//! Processor for the `in` queue: load the list named by the item's
//! `listid`, evaluate the rules, then run the handler chain.

use crate::handlers::HandlerChain;
use crate::queue::{ItemProcessor, QueueItem};
use crate::rules::RuleEngine;
use async_trait::async_trait;
use listrust_common::{Error, Result};
use listrust_storage::MailingListStore;
use std::sync::Arc;
use tracing::debug;

pub struct IncomingProcessor {
    lists: Arc<dyn MailingListStore>,
    rules: RuleEngine,
    handlers: HandlerChain,
}

impl IncomingProcessor {
    pub fn new(lists: Arc<dyn MailingListStore>, rules: RuleEngine, handlers: HandlerChain) -> Self {
        Self {
            lists,
            rules,
            handlers,
        }
    }
}

#[async_trait]
impl ItemProcessor for IncomingProcessor {
    async fn process(&self, item: &QueueItem) -> Result<()> {
        let list_id = item
            .metadata
            .list_id()
            .ok_or_else(|| Error::Validation("Queued message has no listid".to_string()))?;

        let list = self
            .lists
            .get(list_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mailing list {}", list_id)))?;

        let mut meta = item.metadata.clone();
        let hits = self.rules.evaluate(&list, &item.message, &mut meta).await;

        debug!(list_id = %list.list_id, item_id = %item.id, rules = ?hits, "Rules evaluated");

        self.handlers.run(&list, &item.message, &mut meta).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::metadata::MessageData;
    use chrono::Utc;
    use listrust_storage::InMemoryMailingListStore;
    use uuid::Uuid;

    fn item(metadata: MessageData) -> QueueItem {
        QueueItem {
            id: Uuid::now_v7(),
            message: Message::from_bytes("From: anne@example.com\n\nhi\n").unwrap(),
            metadata,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    fn processor() -> IncomingProcessor {
        IncomingProcessor::new(
            Arc::new(InMemoryMailingListStore::new()),
            RuleEngine::new(Vec::new()),
            HandlerChain::new(Vec::new()),
        )
    }

    #[tokio::test]
    async fn test_missing_listid_is_invalid() {
        let result = processor().process(&item(MessageData::new())).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_list_is_not_found() {
        let result = processor()
            .process(&item(MessageData::for_list("nope.example.com")))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
