//! Digest builder
//!
//! Consumes triggers from the `digest` queue. Each trigger names a rotated
//! mailbox; the builder renders it as a MIME digest and as an RFC 1153
//! plain-text digest and hands both to the `out` queue.

use super::mailbox::DigestMailboxes;
use crate::message::Message;
use crate::metadata::{keys, MessageData};
use crate::queue::{ItemProcessor, QueueItem, Switchboard};
use async_trait::async_trait;
use chrono::Utc;
use listrust_common::{Error, Result};
use listrust_storage::{MailingList, MailingListStore};
use mail_builder::mime::MimePart;
use mail_builder::MessageBuilder;
use serde_json::{Map, Value};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Metadata key naming the rendering of an outgoing digest
pub const DIGEST_FORMAT: &str = "digest_format";

const RFC1153_RULE: &str = "----------------------------------------------------------------------";
const RFC1153_SEPARATOR: &str = "------------------------------";

/// A digest rendered for one issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestIssue {
    pub volume: i64,
    pub number: i64,
    pub subject: String,
}

impl DigestIssue {
    pub fn new(list: &MailingList, volume: i64, number: i64) -> Self {
        Self {
            volume,
            number,
            subject: format!("{} Digest, Vol {}, Issue {}", list.display_name, volume, number),
        }
    }
}

pub struct DigestBuilder {
    lists: Arc<dyn MailingListStore>,
    mailboxes: Arc<DigestMailboxes>,
    out_queue: Arc<Switchboard>,
}

impl DigestBuilder {
    pub fn new(
        lists: Arc<dyn MailingListStore>,
        mailboxes: Arc<DigestMailboxes>,
        out_queue: Arc<Switchboard>,
    ) -> Self {
        Self {
            lists,
            mailboxes,
            out_queue,
        }
    }

    async fn enqueue(&self, list: &MailingList, message: &Message, format: &str) -> Result<()> {
        let mut metadata = MessageData::for_list(&list.list_id);
        metadata.insert(keys::ISDIGEST, true);

        let mut extras = Map::new();
        extras.insert(DIGEST_FORMAT.to_string(), Value::from(format));

        self.out_queue.enqueue(message, metadata, extras).await?;
        Ok(())
    }
}

#[async_trait]
impl ItemProcessor for DigestBuilder {
    async fn process(&self, item: &QueueItem) -> Result<()> {
        let meta = &item.metadata;
        let list_id = meta
            .list_id()
            .ok_or_else(|| Error::Validation("Digest trigger without listid".to_string()))?;
        let digest_path = meta
            .get_str(keys::DIGEST_PATH)
            .ok_or_else(|| Error::Validation("Digest trigger without digest_path".to_string()))?;
        let volume = meta
            .get_i64(keys::VOLUME)
            .ok_or_else(|| Error::Validation("Digest trigger without volume".to_string()))?;
        let number = meta
            .get_i64(keys::DIGEST_NUMBER)
            .ok_or_else(|| Error::Validation("Digest trigger without digest_number".to_string()))?;

        let list = self
            .lists
            .get(list_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("mailing list {}", list_id)))?;

        // A dispatch queues the trigger before it rotates, under this lock
        let loaded = {
            let _mailbox = self.mailboxes.lock(list_id).await;
            self.mailboxes.load(digest_path).await?
        };
        let Some(messages) = loaded else {
            debug!(list_id, digest_path, "Digest mailbox already built");
            return Ok(());
        };

        if !messages.is_empty() {
            let issue = DigestIssue::new(&list, volume, number);
            let mime = build_mime_digest(&list, &issue, &messages)?;
            let plain = build_rfc1153_digest(&list, &issue, &messages)?;

            self.enqueue(&list, &mime, "mime").await?;
            self.enqueue(&list, &plain, "rfc1153").await?;

            info!(
                list_id,
                volume,
                number,
                messages = messages.len(),
                "Digest built"
            );
        }

        self.mailboxes.remove(digest_path).await
    }
}

fn request_address(list: &MailingList) -> String {
    match list.posting_address.rsplit_once('@') {
        Some((local, host)) => format!("{}-request@{}", local, host),
        None => list.posting_address.clone(),
    }
}

fn digest_message_id(list: &MailingList) -> String {
    format!("{}@{}", Uuid::now_v7(), list.mail_host())
}

/// Sender and subject of a digest entry for the table of contents
fn topic(message: &Message) -> (String, String) {
    let subject = message
        .subject()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "(no subject)".to_string());
    let sender = message.sender().unwrap_or_else(|| "unknown".to_string());
    (subject, sender)
}

fn table_of_contents(messages: &[Message]) -> String {
    let mut toc = format!("Today's Topics ({} messages)\n\n", messages.len());
    for (i, message) in messages.iter().enumerate() {
        let (subject, sender) = topic(message);
        let _ = writeln!(toc, "  {:>2}. {} ({})", i + 1, subject, sender);
    }
    toc
}

fn render(builder: MessageBuilder<'_>) -> Result<Message> {
    let bytes = builder
        .write_to_vec()
        .map_err(|e| Error::Internal(format!("Failed to render digest: {}", e)))?;
    Message::from_bytes(bytes)
}

/// A `message/rfc822` entry, written verbatim
///
/// Only 7bit and 8bit are allowed for this type, so the part carries an
/// explicit transfer encoding and mail-builder leaves the bytes alone.
fn rfc822_part(message: &Message) -> MimePart<'static> {
    let mut bytes = Vec::with_capacity(message.len() + 64);
    let mut prev = 0u8;
    for &b in message.raw() {
        if b == b'\n' && prev != b'\r' {
            bytes.push(b'\r');
        }
        bytes.push(b);
        prev = b;
    }

    let encoding = if bytes.is_ascii() { "7bit" } else { "8bit" };
    MimePart::new("message/rfc822", bytes).transfer_encoding(encoding)
}

/// `multipart/mixed` with the table of contents followed by a
/// `multipart/digest` of the original messages
pub fn build_mime_digest(list: &MailingList, issue: &DigestIssue, messages: &[Message]) -> Result<Message> {
    let request = request_address(list);
    let masthead = format!(
        "Send {} mailing list submissions to\n\t{}\n\n{}",
        list.display_name,
        list.posting_address,
        table_of_contents(messages)
    );

    let entries = messages.iter().map(rfc822_part).collect::<Vec<_>>();

    let builder = MessageBuilder::new()
        .from((list.display_name.as_str(), request.as_str()))
        .to(list.posting_address.as_str())
        .subject(issue.subject.as_str())
        .message_id(digest_message_id(list))
        .date(Utc::now().timestamp())
        .body(MimePart::new(
            "multipart/mixed",
            vec![
                MimePart::new("text/plain", masthead),
                MimePart::new("multipart/digest", entries),
            ],
        ));

    render(builder)
}

/// RFC 1153 plain-text digest
pub fn build_rfc1153_digest(list: &MailingList, issue: &DigestIssue, messages: &[Message]) -> Result<Message> {
    let mut text = String::new();
    let _ = writeln!(text, "{}\n", issue.subject);
    text.push_str(&table_of_contents(messages));
    let _ = writeln!(text, "\n{}\n", RFC1153_RULE);

    for (i, message) in messages.iter().enumerate() {
        if i > 0 {
            let _ = writeln!(text, "{}\n", RFC1153_SEPARATOR);
        }
        for name in ["Date", "From", "Subject", "Message-ID"] {
            if let Some(value) = message.header(name) {
                let _ = writeln!(text, "{}: {}", name, value);
            }
        }
        text.push('\n');

        let body = message.first_text_plain().unwrap_or_default();
        text.push_str(body.trim_end());
        text.push_str("\n\n");
    }

    let _ = writeln!(text, "{}\n", RFC1153_SEPARATOR);
    let trailer = format!("End of {}", issue.subject);
    let _ = writeln!(text, "{}", trailer);
    let _ = writeln!(text, "{}", "*".repeat(trailer.len()));

    let request = request_address(list);
    let builder = MessageBuilder::new()
        .from((list.display_name.as_str(), request.as_str()))
        .to(list.posting_address.as_str())
        .subject(issue.subject.as_str())
        .message_id(digest_message_id(list))
        .date(Utc::now().timestamp())
        .text_body(text);

    render(builder)
}
