//! Moderation handler
//!
//! Acts on rule hits. The action comes from `moderation_action` in metadata
//! and defaults to holding the message for the list moderators.

use super::{Handler, PipelineAbort};
use crate::message::Message;
use crate::metadata::MessageData;
use crate::queue::Switchboard;
use async_trait::async_trait;
use listrust_common::types::ModerationAction;
use listrust_common::Result;
use listrust_storage::MailingList;
use serde_json::Map;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ModerateHandler {
    held: Arc<Switchboard>,
}

impl ModerateHandler {
    pub fn new(held: Arc<Switchboard>) -> Self {
        Self { held }
    }
}

#[async_trait]
impl Handler for ModerateHandler {
    fn name(&self) -> &'static str {
        "moderate"
    }

    fn description(&self) -> &'static str {
        "Hold, reject or discard messages that hit a rule"
    }

    async fn process(
        &self,
        list: &MailingList,
        msg: &Message,
        meta: &mut MessageData,
    ) -> Result<ControlFlow<PipelineAbort>> {
        let hits = meta.rule_hits();
        if hits.is_empty() {
            return Ok(ControlFlow::Continue(()));
        }

        let action = match meta.moderation_action() {
            Ok(action) => action.unwrap_or(ModerationAction::Hold),
            Err(e) => {
                warn!(list_id = %list.list_id, error = %e, "Bad moderation action, holding");
                ModerationAction::Hold
            }
        };

        let reasons: Vec<String> = meta
            .moderation_reasons()
            .iter()
            .map(|reason| reason.render())
            .collect();

        match action {
            ModerationAction::Hold => {
                let id = self.held.enqueue(msg, meta.clone(), Map::new()).await?;
                info!(
                    list_id = %list.list_id,
                    item_id = %id,
                    rules = ?hits,
                    reasons = ?reasons,
                    "Message held for moderation"
                );
            }
            ModerationAction::Reject | ModerationAction::Discard => {
                info!(
                    list_id = %list.list_id,
                    action = %action,
                    message_id = ?msg.message_id(),
                    rules = ?hits,
                    reasons = ?reasons,
                    "Message moderated"
                );
            }
        }

        Ok(ControlFlow::Break(PipelineAbort::new(
            self.name(),
            format!("{}: {}", action, hits.join(", ")),
        )))
    }
}
