//! Match message headers against the list's `bounce_matching_headers`

use super::Rule;
use crate::message::Message;
use crate::metadata::{MessageData, ModerationReason};
use async_trait::async_trait;
use listrust_storage::MailingList;
use regex::{Regex, RegexBuilder};
use tracing::error;

/// Compiled size limit for list-supplied patterns
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

const REASON: &str = "Header \"{}\" matched a bounce_matching_header line";

/// One usable `Header: pattern` line
#[derive(Debug)]
struct HeaderPattern {
    header: String,
    regex: Regex,
}

/// Fires when a configured header matches its pattern
#[derive(Debug, Default)]
pub struct SuspiciousHeaderRule;

impl SuspiciousHeaderRule {
    pub fn new() -> Self {
        Self
    }

    /// Parse the list's pattern text, logging and skipping bad lines
    fn parse_patterns(list: &MailingList) -> Vec<HeaderPattern> {
        let mut patterns = Vec::new();

        for line in list.bounce_matching_headers.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((header, value)) = line.split_once(':') else {
                error!(
                    list_id = %list.list_id,
                    line = %line,
                    "bad bounce_matching_header line: {}",
                    list.list_id
                );
                continue;
            };

            let header = header.trim();
            let value = value.trim();
            let pattern = value
                .strip_prefix('/')
                .and_then(|v| v.strip_suffix('/'))
                .filter(|v| !v.is_empty())
                .unwrap_or(value);

            match RegexBuilder::new(pattern)
                .case_insensitive(true)
                .size_limit(PATTERN_SIZE_LIMIT)
                .build()
            {
                Ok(regex) => patterns.push(HeaderPattern {
                    header: header.to_string(),
                    regex,
                }),
                Err(e) => {
                    error!(
                        list_id = %list.list_id,
                        pattern = %pattern,
                        cause = %e,
                        "bad regexp in bounce_matching_header line: {}",
                        list.list_id
                    );
                }
            }
        }

        patterns
    }
}

#[async_trait]
impl Rule for SuspiciousHeaderRule {
    fn name(&self) -> &'static str {
        "suspicious-header"
    }

    fn description(&self) -> &'static str {
        "Catch messages with suspicious headers."
    }

    async fn check(&self, list: &MailingList, msg: &Message, meta: &mut MessageData) -> bool {
        for pattern in Self::parse_patterns(list) {
            for value in msg.header_all(&pattern.header) {
                if pattern.regex.is_match(value) {
                    meta.add_moderation_reason(ModerationReason::new(
                        REASON,
                        vec![value.to_string()],
                    ));
                    return true;
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn list(patterns: &str) -> MailingList {
        let mut list = MailingList::new("ant.example.com", "ant@example.com");
        list.bounce_matching_headers = patterns.to_string();
        list
    }

    fn message(from: &str) -> Message {
        Message::from_bytes(format!(
            "From: {}\nTo: ant@example.com\nSubject: A message\n\n",
            from
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_matching_header_returns_reason() {
        let rule = SuspiciousHeaderRule::new();
        let mut meta = MessageData::new();

        let matched = rule
            .check(
                &list("From: /spam@example\\.com/"),
                &message("spam@example.com"),
                &mut meta,
            )
            .await;

        assert!(matched);
        assert_eq!(
            meta.moderation_reasons(),
            vec![ModerationReason::new(REASON, vec!["spam@example.com".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_non_matching_header() {
        let rule = SuspiciousHeaderRule::new();
        let mut meta = MessageData::new();
        let matched = rule
            .check(
                &list("from: spam@example.com"),
                &message("user@example.com"),
                &mut meta,
            )
            .await;

        assert!(!matched);
        assert!(meta.moderation_reasons().is_empty());
    }

    #[tokio::test]
    async fn test_bad_lines_are_skipped() {
        let rule = SuspiciousHeaderRule::new();
        let patterns = "This is not a header\nFrom: [a-z\n# comment\n\nto: ANT@";
        let matched = rule
            .check(&list(patterns), &message("user@example.com"), &mut MessageData::new())
            .await;

        // Only the last line is usable, and it matches case-insensitively
        assert!(matched);
        assert_eq!(SuspiciousHeaderRule::parse_patterns(&list(patterns)).len(), 1);
    }

    #[tokio::test]
    async fn test_bad_regexp_never_matches() {
        let rule = SuspiciousHeaderRule::new();
        let matched = rule
            .check(&list("From: [a-z"), &message("user@example.com"), &mut MessageData::new())
            .await;
        assert!(!matched);
    }

    #[tokio::test]
    async fn test_every_header_occurrence_is_tested() {
        let rule = SuspiciousHeaderRule::new();
        let msg = Message::from_bytes(
            "From: anne@example.com\nX-Tag: clean\nX-Tag: bulk-mailer\n\n",
        )
        .unwrap();
        let mut meta = MessageData::new();

        assert!(rule.check(&list("X-Tag: bulk"), &msg, &mut meta).await);
        assert_eq!(meta.moderation_reasons()[0].args, vec!["bulk-mailer"]);
    }
}
