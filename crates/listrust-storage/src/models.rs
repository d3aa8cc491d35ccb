//! Database models

use chrono::{DateTime, Utc};
use listrust_common::types::{DigestFrequency, DmarcMitigateAction, ListId};
use listrust_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Mailing list model
///
/// Enum-valued settings are stored as text and parsed where they are used,
/// so a bad value surfaces as an error on the item that needs it instead of
/// failing every row load.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct MailingList {
    pub id: Uuid,
    pub list_id: ListId,
    pub posting_address: String,
    pub display_name: String,

    pub administrivia: bool,
    /// Newline separated `Header: /regex/` lines
    pub bounce_matching_headers: String,
    pub dmarc_mitigate_action: String,
    pub dmarc_moderation_notice: Option<String>,

    pub digests_enabled: bool,
    /// Kilobytes
    pub digest_size_threshold: f64,
    pub digest_volume_frequency: String,
    pub digest_send_periodic: bool,
    pub digest_last_sent_at: Option<DateTime<Utc>>,
    pub volume: i32,
    pub next_digest_number: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MailingList {
    /// A list with default settings
    pub fn new(list_id: impl Into<ListId>, posting_address: impl Into<String>) -> Self {
        let now = Utc::now();
        let list_id = list_id.into();
        Self {
            id: Uuid::now_v7(),
            display_name: list_id.split('.').next().unwrap_or_default().to_string(),
            list_id,
            posting_address: posting_address.into(),
            administrivia: true,
            bounce_matching_headers: String::new(),
            dmarc_mitigate_action: DmarcMitigateAction::NoMitigation.as_str().to_string(),
            dmarc_moderation_notice: None,
            digests_enabled: true,
            digest_size_threshold: 30.0,
            digest_volume_frequency: DigestFrequency::Monthly.to_string(),
            digest_send_periodic: true,
            digest_last_sent_at: None,
            volume: 1,
            next_digest_number: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parsed digest volume frequency
    pub fn digest_frequency(&self) -> Result<DigestFrequency> {
        self.digest_volume_frequency.parse()
    }

    /// Parsed DMARC mitigation action
    pub fn mitigate_action(&self) -> Result<DmarcMitigateAction> {
        self.dmarc_mitigate_action.parse()
    }

    /// Digest size threshold in bytes
    pub fn digest_size_threshold_bytes(&self) -> u64 {
        (self.digest_size_threshold.max(0.0) * 1024.0) as u64
    }

    /// Mail host part of the posting address
    pub fn mail_host(&self) -> &str {
        self.posting_address
            .rsplit_once('@')
            .map(|(_, host)| host)
            .unwrap_or_default()
    }
}

/// Digest counters persisted after a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestState {
    pub volume: i32,
    pub next_digest_number: i32,
    pub digest_last_sent_at: Option<DateTime<Utc>>,
}

impl From<&MailingList> for DigestState {
    fn from(list: &MailingList) -> Self {
        Self {
            volume: list.volume,
            next_digest_number: list.next_digest_number,
            digest_last_sent_at: list.digest_last_sent_at,
        }
    }
}
