//! Common types for ListRust

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dotted list identifier, e.g. `ant.example.com`
pub type ListId = String;

/// Unique identifier for queue items
pub type QueueItemId = Uuid;

/// How often the digest volume number is bumped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestFrequency {
    Yearly,
    Monthly,
    Quarterly,
    Weekly,
    Daily,
}

impl std::fmt::Display for DigestFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestFrequency::Yearly => write!(f, "yearly"),
            DigestFrequency::Monthly => write!(f, "monthly"),
            DigestFrequency::Quarterly => write!(f, "quarterly"),
            DigestFrequency::Weekly => write!(f, "weekly"),
            DigestFrequency::Daily => write!(f, "daily"),
        }
    }
}

impl std::str::FromStr for DigestFrequency {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "yearly" => Ok(DigestFrequency::Yearly),
            "monthly" => Ok(DigestFrequency::Monthly),
            "quarterly" => Ok(DigestFrequency::Quarterly),
            "weekly" => Ok(DigestFrequency::Weekly),
            "daily" => Ok(DigestFrequency::Daily),
            other => Err(crate::Error::FatalConfiguration(format!(
                "Bad DigestFrequency: {}",
                other
            ))),
        }
    }
}

/// What a list does with posts from domains publishing a strict DMARC policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmarcMitigateAction {
    NoMitigation,
    MungeFrom,
    WrapMessage,
    Reject,
    Discard,
}

impl DmarcMitigateAction {
    /// Whether the DMARC rule should fire (and moderate) for this action
    pub fn moderates(&self) -> bool {
        matches!(self, DmarcMitigateAction::Reject | DmarcMitigateAction::Discard)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DmarcMitigateAction::NoMitigation => "no_mitigation",
            DmarcMitigateAction::MungeFrom => "munge_from",
            DmarcMitigateAction::WrapMessage => "wrap_message",
            DmarcMitigateAction::Reject => "reject",
            DmarcMitigateAction::Discard => "discard",
        }
    }
}

impl std::fmt::Display for DmarcMitigateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DmarcMitigateAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "no_mitigation" | "" => Ok(DmarcMitigateAction::NoMitigation),
            "munge_from" => Ok(DmarcMitigateAction::MungeFrom),
            "wrap_message" => Ok(DmarcMitigateAction::WrapMessage),
            "reject" => Ok(DmarcMitigateAction::Reject),
            "discard" => Ok(DmarcMitigateAction::Discard),
            other => Err(crate::Error::Config(format!(
                "Unknown DMARC mitigate action: {}",
                other
            ))),
        }
    }
}

/// Moderation decision recorded by rules and applied by the moderation handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Hold,
    Reject,
    Discard,
}

impl std::fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModerationAction::Hold => write!(f, "hold"),
            ModerationAction::Reject => write!(f, "reject"),
            ModerationAction::Discard => write!(f, "discard"),
        }
    }
}

impl std::str::FromStr for ModerationAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hold" => Ok(ModerationAction::Hold),
            "reject" => Ok(ModerationAction::Reject),
            "discard" => Ok(ModerationAction::Discard),
            other => Err(crate::Error::Validation(format!(
                "Unknown moderation action: {}",
                other
            ))),
        }
    }
}
