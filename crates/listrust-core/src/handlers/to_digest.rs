//! Adds list posts to the list's digest

use super::{Handler, PipelineAbort};
use crate::digest::{DigestDispatcher, DigestMailboxes};
use crate::message::Message;
use crate::metadata::MessageData;
use async_trait::async_trait;
use listrust_common::Result;
use listrust_storage::MailingList;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::debug;

pub struct ToDigestHandler {
    mailboxes: Arc<DigestMailboxes>,
    dispatcher: Arc<DigestDispatcher>,
}

impl ToDigestHandler {
    pub fn new(mailboxes: Arc<DigestMailboxes>, dispatcher: Arc<DigestDispatcher>) -> Self {
        Self {
            mailboxes,
            dispatcher,
        }
    }
}

#[async_trait]
impl Handler for ToDigestHandler {
    fn name(&self) -> &'static str {
        "to-digest"
    }

    fn description(&self) -> &'static str {
        "Add the message to the digest, possibly sending it"
    }

    async fn process(
        &self,
        list: &MailingList,
        msg: &Message,
        meta: &mut MessageData,
    ) -> Result<ControlFlow<PipelineAbort>> {
        if !list.digests_enabled || meta.is_digest() {
            return Ok(ControlFlow::Continue(()));
        }

        let appended = {
            let mailbox = self.mailboxes.lock(&list.list_id).await;
            mailbox.append(msg).await?
        };
        debug!(list_id = %list.list_id, appended, "Digest append");

        self.dispatcher
            .maybe_send_digest_now(Some(&list.list_id), false)
            .await?;

        Ok(ControlFlow::Continue(()))
    }
}
