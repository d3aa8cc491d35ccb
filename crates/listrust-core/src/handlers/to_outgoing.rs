//! Hands processed messages to the delivery stage

use super::{Handler, PipelineAbort};
use crate::message::Message;
use crate::metadata::MessageData;
use crate::queue::Switchboard;
use async_trait::async_trait;
use listrust_common::Result;
use listrust_storage::MailingList;
use serde_json::Map;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::debug;

pub struct ToOutgoingHandler {
    out: Arc<Switchboard>,
}

impl ToOutgoingHandler {
    pub fn new(out: Arc<Switchboard>) -> Self {
        Self { out }
    }
}

#[async_trait]
impl Handler for ToOutgoingHandler {
    fn name(&self) -> &'static str {
        "to-outgoing"
    }

    fn description(&self) -> &'static str {
        "Send the message to the outgoing queue"
    }

    async fn process(
        &self,
        list: &MailingList,
        msg: &Message,
        meta: &mut MessageData,
    ) -> Result<ControlFlow<PipelineAbort>> {
        let mut outgoing = meta.clone();
        outgoing.insert(crate::metadata::keys::LISTID, list.list_id.clone());

        let id = self.out.enqueue(msg, outgoing, Map::new()).await?;
        debug!(list_id = %list.list_id, item_id = %id, "Queued for delivery");

        Ok(ControlFlow::Continue(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RetryPolicy;
    use listrust_storage::LocalStorage;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_enqueues_on_out() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::from_path(dir.path()).unwrap());
        let out = Arc::new(Switchboard::new("out", storage, RetryPolicy::default()));
        let handler = ToOutgoingHandler::new(out.clone());

        let list = MailingList::new("ant.example.com", "ant@example.com");
        let msg = Message::from_bytes("From: anne@example.com\nSubject: hi\n\nbody\n").unwrap();
        let mut meta = MessageData::new();
        meta.record_rule_miss("administrivia");

        let flow = handler.process(&list, &msg, &mut meta).await.unwrap();
        assert_eq!(flow, ControlFlow::Continue(()));

        let item = out.dequeue().await.unwrap().unwrap();
        assert_eq!(item.message, msg);
        assert_eq!(item.metadata.list_id(), Some("ant.example.com"));
        assert_eq!(item.metadata.rule_misses(), vec!["administrivia".to_string()]);
    }
}
