//! Rule engine
//!
//! A rule is a named predicate over (list, message, metadata). Rules catch
//! their own lookup and configuration failures and answer `false`, so a
//! broken rule can never stop a message from being processed. Rules may add
//! entries to metadata but never touch the message.

pub mod administrivia;
pub mod dmarc;
pub mod org_domain;
pub mod suspicious;

pub use administrivia::AdministriviaRule;
pub use dmarc::{DmarcLookup, DmarcMitigationRule};
pub use org_domain::OrgDomainCache;
pub use suspicious::SuspiciousHeaderRule;

use crate::message::Message;
use crate::metadata::MessageData;
use async_trait::async_trait;
use listrust_common::{Error, Result};
use listrust_storage::MailingList;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A pipeline rule
#[async_trait]
pub trait Rule: Send + Sync {
    /// Stable name used in configuration and in `rule_hits`/`rule_misses`
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Whether hits and misses are recorded in metadata
    fn record(&self) -> bool {
        true
    }

    async fn check(&self, list: &MailingList, msg: &Message, meta: &mut MessageData) -> bool;
}

/// Rules by name
#[derive(Default)]
pub struct RuleRegistry {
    rules: HashMap<&'static str, Arc<dyn Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule under its own name, replacing any previous one
    pub fn register(&mut self, rule: Arc<dyn Rule>) {
        self.rules.insert(rule.name(), rule);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Rule>> {
        self.rules.get(name).cloned()
    }

    /// Resolve configured names into an engine, in order
    pub fn resolve(&self, names: &[String]) -> Result<RuleEngine> {
        let rules = names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| Error::Config(format!("Unknown rule: {}", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RuleEngine { rules })
    }
}

/// Ordered rules resolved from configuration
pub struct RuleEngine {
    rules: Vec<Arc<dyn Rule>>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Arc<dyn Rule>>) -> Self {
        Self { rules }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Run every rule; returns the names of the rules that fired
    pub async fn evaluate(
        &self,
        list: &MailingList,
        msg: &Message,
        meta: &mut MessageData,
    ) -> Vec<&'static str> {
        let mut hits = Vec::new();

        for rule in &self.rules {
            let matched = rule.check(list, msg, meta).await;

            debug!(
                list_id = %list.list_id,
                rule = rule.name(),
                matched,
                "Rule evaluated"
            );

            if rule.record() {
                if matched {
                    meta.record_rule_hit(rule.name());
                } else {
                    meta.record_rule_miss(rule.name());
                }
            }

            if matched {
                hits.push(rule.name());
            }
        }

        hits
    }
}
