//! Catch mis-addressed email commands

use super::Rule;
use crate::message::Message;
use crate::metadata::MessageData;
use async_trait::async_trait;
use listrust_common::config::AdministriviaConfig;
use listrust_storage::MailingList;

/// Fires when the Subject or an early body line looks like an email command
pub struct AdministriviaRule {
    config: AdministriviaConfig,
}

impl AdministriviaRule {
    pub fn new(config: AdministriviaConfig) -> Self {
        Self { config }
    }

    /// Subject first, then up to `max_lines` non-blank lines of the first text/plain part
    fn candidate_lines(&self, msg: &Message) -> Vec<String> {
        let mut lines = Vec::new();

        if let Some(subject) = msg.subject().filter(|s| !s.is_empty()) {
            lines.push(subject);
        }

        if let Some(body) = msg.first_text_plain() {
            lines.extend(
                body.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .take(self.config.max_lines)
                    .map(str::to_string),
            );
        }

        lines
    }

    fn is_command(&self, line: &str) -> bool {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return false;
        };

        self.config
            .commands
            .get(&command.to_lowercase())
            .map(|arity| arity.accepts(words.count()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Rule for AdministriviaRule {
    fn name(&self) -> &'static str {
        "administrivia"
    }

    fn description(&self) -> &'static str {
        "Catch mis-addressed email commands."
    }

    async fn check(&self, list: &MailingList, msg: &Message, _meta: &mut MessageData) -> bool {
        if !list.administrivia {
            return false;
        }

        self.candidate_lines(msg)
            .iter()
            .any(|line| self.is_command(line))
    }
}
