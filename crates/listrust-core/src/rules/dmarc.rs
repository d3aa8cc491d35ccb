//! DMARC mitigation rule
//!
//! Looks up the DMARC policy published for the sender's domain, falling back
//! to the organizational domain, and fires when the policy is `reject` or
//! `quarantine` and the list is configured to reject or discard such posts.
//! DNS failures of any kind resolve to "no match".

use super::org_domain::OrgDomainCache;
use super::Rule;
use crate::dns::{normalize_name, DnsError, DnsRecord, DnsResolver, RecordData};
use crate::message::Message;
use crate::metadata::{keys, MessageData, ModerationReason};
use async_trait::async_trait;
use listrust_common::types::{DmarcMitigateAction, ModerationAction};
use listrust_storage::MailingList;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const REJECT_NOTICE: &str = "You are not allowed to post to this mailing list From: a domain \
which publishes a DMARC policy of reject or quarantine, and your message has been \
automatically rejected.  If you think that your messages are being rejected in error, \
contact the mailing list owner at {}.";

const DISCARD_REASON: &str = "DMARC moderation";

/// Outcome of resolving one `_dmarc` name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmarcLookup {
    /// The first `v=DMARC1` record
    Found(String),
    /// No record, or no DMARC record; the organizational domain may still have one
    NotFound,
    /// The CNAME chain revisits a name
    Loop,
    /// The CNAME chain ends at a name with no TXT data
    Dangling,
    TransientError(String),
}

pub struct DmarcMitigationRule {
    resolver: Arc<dyn DnsResolver>,
    org_domains: Arc<OrgDomainCache>,
    lifetime: Duration,
}

impl DmarcMitigationRule {
    pub fn new(
        resolver: Arc<dyn DnsResolver>,
        org_domains: Arc<OrgDomainCache>,
        lifetime: Duration,
    ) -> Self {
        Self {
            resolver,
            org_domains,
            lifetime,
        }
    }

    /// Resolve `dmarc_domain`, following CNAMEs in the answer
    pub async fn lookup(&self, dmarc_domain: &str) -> DmarcLookup {
        match self.resolver.query_txt(dmarc_domain).await {
            Ok(records) => resolve_answer(&normalize_name(dmarc_domain), &records),
            Err(DnsError::NxDomain(_)) | Err(DnsError::NoAnswer(_)) => DmarcLookup::NotFound,
            Err(e) => DmarcLookup::TransientError(e.to_string()),
        }
    }

    /// Whether `email`'s domain publishes a reject or quarantine policy
    async fn prohibited(&self, email: &str) -> bool {
        let email = email.to_lowercase();
        let from_domain = match email.find('@') {
            Some(at) if at > 0 => &email[at + 1..],
            _ => return false,
        };

        let dmarc_domain = format!("_dmarc.{}", from_domain);
        match self.lookup(&dmarc_domain).await {
            DmarcLookup::NotFound => {}
            other => return self.decide(other, &email, &dmarc_domain, false),
        }

        let org_domain = self.org_domains.organizational_domain(from_domain).await;
        if org_domain == from_domain {
            return false;
        }

        let dmarc_domain = format!("_dmarc.{}", org_domain);
        let result = self.lookup(&dmarc_domain).await;
        self.decide(result, &email, &dmarc_domain, true)
    }

    fn decide(&self, result: DmarcLookup, email: &str, dmarc_domain: &str, org: bool) -> bool {
        match result {
            DmarcLookup::Found(record) => {
                let strict = matches!(
                    policy(&record, org).as_deref(),
                    Some("reject") | Some("quarantine")
                );
                if strict {
                    info!(
                        sender = %email,
                        domain = %dmarc_domain,
                        record = %record,
                        "DMARC lookup for {} ({}) found p=reject/quarantine",
                        email,
                        dmarc_domain
                    );
                }
                strict
            }
            DmarcLookup::TransientError(e) => {
                error!(
                    sender = %email,
                    domain = %dmarc_domain,
                    "DNSException: Unable to query DMARC policy for {} ({}). {}",
                    email,
                    dmarc_domain,
                    e
                );
                false
            }
            DmarcLookup::Loop | DmarcLookup::Dangling | DmarcLookup::NotFound => {
                debug!(sender = %email, domain = %dmarc_domain, result = ?result, "No usable DMARC record");
                false
            }
        }
    }

    fn owner_address(list: &MailingList) -> String {
        match list.posting_address.split_once('@') {
            Some((local, host)) => format!("{}-owner@{}", local, host),
            None => format!("{}-owner", list.posting_address),
        }
    }
}

/// Walk the CNAME chain from `name` and pick the DMARC record at its end
fn resolve_answer(name: &str, records: &[DnsRecord]) -> DmarcLookup {
    let mut cnames: HashMap<&str, &str> = HashMap::new();
    let mut texts: HashMap<&str, Vec<&str>> = HashMap::new();

    for record in records {
        match &record.data {
            RecordData::Cname(target) => {
                cnames.insert(record.name.as_str(), target.as_str());
            }
            RecordData::Txt(text) => {
                texts.entry(record.name.as_str()).or_default().push(text.as_str());
            }
        }
    }

    let mut visited: HashSet<&str> = HashSet::from([name]);
    let mut current = name;
    while let Some(&target) = cnames.get(current) {
        if !visited.insert(target) {
            return DmarcLookup::Loop;
        }
        current = target;
    }

    let Some(texts) = texts.get(current) else {
        return if current == name {
            DmarcLookup::NotFound
        } else {
            DmarcLookup::Dangling
        };
    };

    let dmarcs: Vec<&str> = texts.iter().copied().filter(|t| is_dmarc1(t)).collect();
    match dmarcs.first() {
        None => DmarcLookup::NotFound,
        Some(first) => {
            if dmarcs.len() > 1 {
                warn!(
                    domain = %name,
                    count = dmarcs.len(),
                    "RRset of TXT records for {} has {} v=DMARC1 entries",
                    name,
                    dmarcs.len()
                );
            }
            DmarcLookup::Found(first.to_string())
        }
    }
}

/// Tag/value pairs of a DMARC record, names lowercased
fn parse_tags(txt: &str) -> Vec<(String, String)> {
    txt.split(';')
        .filter_map(|part| part.split_once('='))
        .map(|(name, value)| (name.trim().to_lowercase(), value.trim().to_string()))
        .collect()
}

/// The record's first tag must be exactly `v=DMARC1`
fn is_dmarc1(txt: &str) -> bool {
    txt.split(';')
        .next()
        .and_then(|first| first.split_once('='))
        .map(|(name, value)| name.trim() == "v" && value.trim() == "DMARC1")
        .unwrap_or(false)
}

/// Effective policy; `sp=` overrides `p=` when the sender is below the organizational domain
fn policy(record: &str, subdomain: bool) -> Option<String> {
    let tags = parse_tags(record);
    let find = |wanted: &str| {
        tags.iter()
            .find(|(name, _)| name == wanted)
            .map(|(_, value)| value.to_lowercase())
    };

    if subdomain {
        if let Some(sp) = find("sp") {
            return Some(sp);
        }
    }
    find("p")
}

#[async_trait]
impl Rule for DmarcMitigationRule {
    fn name(&self) -> &'static str {
        "dmarc-mitigation"
    }

    fn description(&self) -> &'static str {
        "Find DMARC policy of From: domain."
    }

    async fn check(&self, list: &MailingList, msg: &Message, meta: &mut MessageData) -> bool {
        let action = match list.mitigate_action() {
            Ok(action) => action,
            Err(e) => {
                error!(list_id = %list.list_id, rule = self.name(), error = %e, "Bad DMARC mitigation setting");
                return false;
            }
        };

        if action == DmarcMitigateAction::NoMitigation {
            return false;
        }

        let Some(sender) = msg.sender() else {
            return false;
        };

        let prohibited = match tokio::time::timeout(self.lifetime, self.prohibited(&sender)).await {
            Ok(prohibited) => prohibited,
            Err(_) => {
                error!(
                    list_id = %list.list_id,
                    sender = %sender,
                    "DNSException: Unable to query DMARC policy for {}. Lookup timed out",
                    sender
                );
                false
            }
        };

        if !prohibited {
            return false;
        }

        meta.insert(keys::DMARC, true);

        // Munging and wrapping happen at delivery time
        if !action.moderates() {
            return false;
        }

        let (moderation, reason) = if action == DmarcMitigateAction::Discard {
            (
                ModerationAction::Discard,
                ModerationReason::new(DISCARD_REASON, vec![]),
            )
        } else {
            let reason = match list.dmarc_moderation_notice.as_deref().filter(|n| !n.is_empty()) {
                Some(notice) => ModerationReason::new(notice, vec![]),
                None => ModerationReason::new(REJECT_NOTICE, vec![Self::owner_address(list)]),
            };
            (ModerationAction::Reject, reason)
        };

        meta.set_moderation_action(moderation);
        if !meta.contains_key(keys::MODERATION_SENDER) {
            meta.insert(keys::MODERATION_SENDER, sender);
        }
        meta.add_moderation_reason(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use pretty_assertions::assert_eq;

    fn rule(resolver: StaticResolver) -> DmarcMitigationRule {
        DmarcMitigationRule::new(
            Arc::new(resolver),
            Arc::new(OrgDomainCache::new(None)),
            Duration::from_secs(5),
        )
    }

    fn biz(text: &str) -> StaticResolver {
        StaticResolver::new().with_records(
            "_dmarc.example.biz",
            vec![DnsRecord::txt("_dmarc.example.biz", text)],
        )
    }

    fn list(action: DmarcMitigateAction) -> MailingList {
        let mut list = MailingList::new("ant.example.com", "ant@example.com");
        list.dmarc_mitigate_action = action.to_string();
        list
    }

    fn from(address: &str) -> Message {
        Message::from_bytes(format!(
            "From: {}\nTo: ant@example.com\nSubject: A message\n\n",
            address
        ))
        .unwrap()
    }

    async fn prohibited(resolver: StaticResolver, email: &str) -> bool {
        rule(resolver).prohibited(email).await
    }

    #[tokio::test]
    async fn test_reject_policy_fires() {
        let rule = rule(biz("v=DMARC1; p=reject;"));
        let mut meta = MessageData::new();

        let fired = rule
            .check(&list(DmarcMitigateAction::Reject), &from("anne@example.biz"), &mut meta)
            .await;

        assert!(fired);
        assert!(meta.get_bool(keys::DMARC));
        assert_eq!(meta.moderation_action().unwrap(), Some(ModerationAction::Reject));
        assert_eq!(meta.get_str(keys::MODERATION_SENDER), Some("anne@example.biz"));
        let reasons = meta.moderation_reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].render().ends_with("ant-owner@example.com."));
    }

    #[tokio::test]
    async fn test_other_domain_does_not_fire() {
        let rule = rule(biz("v=DMARC1; p=reject;"));
        let mut meta = MessageData::new();

        let fired = rule
            .check(&list(DmarcMitigateAction::Reject), &from("anne@example.com"), &mut meta)
            .await;

        assert!(!fired);
        assert!(!meta.contains_key(keys::DMARC));
    }

    #[tokio::test]
    async fn test_discard_action() {
        let rule = rule(biz("v=DMARC1; p=quarantine;"));
        let mut meta = MessageData::new();

        assert!(
            rule.check(&list(DmarcMitigateAction::Discard), &from("anne@example.biz"), &mut meta)
                .await
        );
        assert_eq!(meta.moderation_action().unwrap(), Some(ModerationAction::Discard));
    }

    #[tokio::test]
    async fn test_munge_from_records_but_does_not_fire() {
        let rule = rule(biz("v=DMARC1; p=reject;"));
        let mut meta = MessageData::new();

        let fired = rule
            .check(&list(DmarcMitigateAction::MungeFrom), &from("anne@example.biz"), &mut meta)
            .await;

        assert!(!fired);
        assert!(meta.get_bool(keys::DMARC));
        assert_eq!(meta.moderation_action().unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_mitigation_skips_lookup() {
        let resolver = StaticResolver::new()
            .with_error("_dmarc.example.biz", DnsError::Transient("should not be asked".into()));
        let mut meta = MessageData::new();
        let fired = rule(resolver)
            .check(&list(DmarcMitigateAction::NoMitigation), &from("anne@example.biz"), &mut meta)
            .await;
        assert!(!fired);
        assert!(!meta.contains_key(keys::DMARC));
    }

    #[tokio::test]
    async fn test_address_without_at_sign() {
        assert!(!prohibited(biz("v=DMARC1; p=reject;"), "anne").await);
        assert!(!prohibited(biz("v=DMARC1; p=reject;"), "@example.biz").await);
    }

    #[tokio::test]
    async fn test_dns_failure_is_non_match() {
        let resolver = StaticResolver::new()
            .with_error("_dmarc.example.biz", DnsError::Transient("SERVFAIL".into()));
        assert!(!prohibited(resolver, "anne@example.biz").await);
    }

    #[tokio::test]
    async fn test_subdomain_policy_only_applies_to_subdomains() {
        assert!(!prohibited(biz("v=DMARC1; sp=quarantine;"), "anne@example.biz").await);
        assert!(prohibited(biz("v=DMARC1; p=none; sp=quarantine;"), "anne@sub.domain.example.biz").await);
        assert!(!prohibited(biz("v=DMARC1; p=reject; sp=none;"), "anne@sub.domain.example.biz").await);
    }

    #[tokio::test]
    async fn test_version_must_be_dmarc1() {
        assert!(!prohibited(biz("v=DMARC01; p=reject;"), "anne@example.biz").await);
    }

    #[tokio::test]
    async fn test_missing_policy() {
        assert!(!prohibited(biz("v=DMARC1; pct=100;"), "anne@example.biz").await);
    }

    #[tokio::test]
    async fn test_multiple_records_uses_first() {
        let resolver = StaticResolver::new().with_records(
            "_dmarc.example.biz",
            vec![
                DnsRecord::txt("_dmarc.example.biz", "v=DMARC1; p=reject;"),
                DnsRecord::txt("_dmarc.example.biz", "v=DMARC1; p=none;"),
            ],
        );
        assert!(prohibited(resolver, "anne@example.biz").await);
    }

    #[tokio::test]
    async fn test_cname_chain_is_followed() {
        let resolver = StaticResolver::new().with_records(
            "_dmarc.example.biz",
            vec![
                DnsRecord::cname("_dmarc.example.biz", "_dmarc.example.net"),
                DnsRecord::cname("_dmarc.example.net", "_dmarc.example.org"),
                DnsRecord::txt("_dmarc.example.org", "v=DMARC1; p=reject;"),
            ],
        );
        let rule = rule(resolver);
        assert_eq!(
            rule.lookup("_dmarc.example.biz").await,
            DmarcLookup::Found("v=DMARC1; p=reject;".to_string())
        );
    }

    #[tokio::test]
    async fn test_cname_without_txt() {
        let resolver = StaticResolver::new().with_records(
            "_dmarc.example.biz",
            vec![DnsRecord::cname("_dmarc.example.biz", "_dmarc.example.net")],
        );
        let rule = rule(resolver);
        assert_eq!(rule.lookup("_dmarc.example.biz").await, DmarcLookup::Dangling);
        assert!(!rule.prohibited("anne@example.biz").await);
    }

    #[tokio::test]
    async fn test_cname_loop_terminates() {
        let resolver = StaticResolver::new().with_records(
            "_dmarc.example.biz",
            vec![
                DnsRecord::cname("_dmarc.example.biz", "_dmarc.example.org"),
                DnsRecord::cname("_dmarc.example.org", "_dmarc.example.biz"),
                DnsRecord::txt("_dmarc.example.org", "v=DMARC1; p=reject;"),
            ],
        );
        let rule = rule(resolver);
        assert_eq!(rule.lookup("_dmarc.example.biz").await, DmarcLookup::Loop);
        assert!(!rule.prohibited("anne@example.biz").await);
    }

    #[test]
    fn test_policy_tags() {
        assert_eq!(policy("v=DMARC1; p=Reject", false).as_deref(), Some("reject"));
        assert_eq!(policy("v=DMARC1; sp=reject", false), None);
        assert_eq!(policy("v=DMARC1; p=none; sp=reject", true).as_deref(), Some("reject"));
        assert!(is_dmarc1("v=DMARC1"));
        assert!(!is_dmarc1("p=reject; v=DMARC1"));
    }
}
