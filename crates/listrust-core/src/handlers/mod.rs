//! Handler chain
//!
//! Handlers run in configured order after the rules. A handler that wants
//! the remaining handlers skipped returns `ControlFlow::Break`; that is a
//! decision, not a failure, and the queue item is still finished. Every
//! handler must tolerate seeing the same item twice.

pub mod moderate;
pub mod to_digest;
pub mod to_outgoing;

pub use moderate::ModerateHandler;
pub use to_digest::ToDigestHandler;
pub use to_outgoing::ToOutgoingHandler;

use crate::message::Message;
use crate::metadata::MessageData;
use async_trait::async_trait;
use listrust_common::{Error, Result};
use listrust_storage::MailingList;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, info};

/// Why the rest of the chain was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineAbort {
    pub handler: &'static str,
    pub reason: String,
}

impl PipelineAbort {
    pub fn new(handler: &'static str, reason: impl Into<String>) -> Self {
        Self {
            handler,
            reason: reason.into(),
        }
    }
}

/// A pipeline handler
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable name used in configuration
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    async fn process(
        &self,
        list: &MailingList,
        msg: &Message,
        meta: &mut MessageData,
    ) -> Result<ControlFlow<PipelineAbort>>;
}

/// Handlers by name
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    /// Resolve configured names into a chain, in order
    pub fn resolve(&self, names: &[String]) -> Result<HandlerChain> {
        let handlers = names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| Error::Config(format!("Unknown handler: {}", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(HandlerChain { handlers })
    }
}

/// Ordered handlers resolved from configuration
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self { handlers }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Run the handlers in order; returns the abort that stopped the chain,
    /// if any
    pub async fn run(
        &self,
        list: &MailingList,
        msg: &Message,
        meta: &mut MessageData,
    ) -> Result<Option<PipelineAbort>> {
        for handler in &self.handlers {
            debug!(list_id = %list.list_id, handler = handler.name(), "Running handler");

            if let ControlFlow::Break(abort) = handler.process(list, msg, meta).await? {
                info!(
                    list_id = %list.list_id,
                    handler = abort.handler,
                    reason = %abort.reason,
                    "Pipeline stopped"
                );
                return Ok(Some(abort));
            }
        }

        Ok(None)
    }
}
