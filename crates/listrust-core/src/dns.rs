//! DNS collaborator
//!
//! Rules query DNS through [`DnsResolver`] so lookups can be stubbed in
//! tests. A TXT query returns the whole answer section, CNAME records
//! included, with names lowercased and stripped of the trailing dot.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::proto::op::ResponseCode;
use trust_dns_resolver::proto::rr::{RData, RecordType};
use trust_dns_resolver::TokioAsyncResolver;

/// DNS lookup failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    /// The name does not exist
    #[error("NXDOMAIN: {0}")]
    NxDomain(String),

    /// The name exists but has no records of the requested type
    #[error("No answer: {0}")]
    NoAnswer(String),

    /// The query itself was invalid
    #[error("Malformed query: {0}")]
    Malformed(String),

    /// Timeouts, unreachable servers, SERVFAIL
    #[error("Transient DNS failure: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Txt(String),
    /// Canonical name target
    Cname(String),
}

/// One answer record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub data: RecordData,
}

impl DnsRecord {
    pub fn txt(name: &str, text: &str) -> Self {
        Self {
            name: normalize_name(name),
            data: RecordData::Txt(text.to_string()),
        }
    }

    pub fn cname(name: &str, target: &str) -> Self {
        Self {
            name: normalize_name(name),
            data: RecordData::Cname(normalize_name(target)),
        }
    }
}

/// DNS resolver trait
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Query TXT records for `name`
    async fn query_txt(&self, name: &str) -> Result<Vec<DnsRecord>, DnsError>;
}

/// Lowercase and strip the root dot
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Reject names no resolver would accept
fn validate_name(name: &str) -> Result<(), DnsError> {
    if name.is_empty() || name.len() > 253 {
        return Err(DnsError::Malformed(name.to_string()));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(DnsError::Malformed(name.to_string()));
        }
    }
    Ok(())
}

/// Resolver backed by `trust-dns-resolver`
pub struct TrustDnsResolver {
    resolver: TokioAsyncResolver,
}

impl TrustDnsResolver {
    /// Create a resolver using the default upstream configuration
    pub fn new(timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 2;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        Self { resolver }
    }
}

#[async_trait]
impl DnsResolver for TrustDnsResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<DnsRecord>, DnsError> {
        let name = normalize_name(name);
        validate_name(&name)?;

        let lookup = match self.resolver.lookup(format!("{}.", name), RecordType::TXT).await {
            Ok(lookup) => lookup,
            Err(e) => {
                return Err(match e.kind() {
                    ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                        if *response_code == ResponseCode::NXDomain {
                            DnsError::NxDomain(name)
                        } else {
                            DnsError::NoAnswer(name)
                        }
                    }
                    _ => DnsError::Transient(e.to_string()),
                });
            }
        };

        let mut records = Vec::new();
        for record in lookup.records() {
            let owner = record.name().to_string();
            match record.data() {
                Some(RData::TXT(txt)) => {
                    let text = txt
                        .txt_data()
                        .iter()
                        .map(|d| String::from_utf8_lossy(d))
                        .collect::<String>();
                    records.push(DnsRecord::txt(&owner, &text));
                }
                Some(RData::CNAME(target)) => {
                    records.push(DnsRecord::cname(&owner, &target.0.to_string()));
                }
                _ => {}
            }
        }

        debug!(name = %name, answers = records.len(), "TXT lookup");

        Ok(records)
    }
}

/// Resolver answering from a fixed table; unknown names are NXDOMAIN
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    answers: HashMap<String, Result<Vec<DnsRecord>, DnsError>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `name` with the given records
    pub fn with_records(mut self, name: &str, records: Vec<DnsRecord>) -> Self {
        self.answers.insert(normalize_name(name), Ok(records));
        self
    }

    /// Fail queries for `name`
    pub fn with_error(mut self, name: &str, error: DnsError) -> Self {
        self.answers.insert(normalize_name(name), Err(error));
        self
    }
}

#[async_trait]
impl DnsResolver for StaticResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<DnsRecord>, DnsError> {
        let name = normalize_name(name);
        validate_name(&name)?;
        self.answers
            .get(&name)
            .cloned()
            .unwrap_or(Err(DnsError::NxDomain(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::new()
            .with_records("_dmarc.example.biz.", vec![DnsRecord::txt("_dmarc.example.biz", "v=DMARC1; p=reject;")])
            .with_error("_dmarc.example.net", DnsError::Transient("timeout".into()));

        assert_eq!(resolver.query_txt("_DMARC.example.biz").await.unwrap().len(), 1);
        assert!(matches!(
            resolver.query_txt("_dmarc.example.net").await,
            Err(DnsError::Transient(_))
        ));
        assert!(matches!(
            resolver.query_txt("_dmarc.example.com").await,
            Err(DnsError::NxDomain(_))
        ));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("_DMARC.Example.BIZ."), "_dmarc.example.biz");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("_dmarc.example.biz").is_ok());
        assert!(validate_name("_dmarc..example.biz").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn test_record_constructors() {
        let record = DnsRecord::cname("_dmarc.Example.com.", "_dmarc.example.net.");
        assert_eq!(record.name, "_dmarc.example.com");
        assert_eq!(record.data, RecordData::Cname("_dmarc.example.net".to_string()));
    }
}
