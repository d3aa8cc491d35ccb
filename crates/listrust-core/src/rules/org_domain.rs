//! Organizational domain lookup from public suffix data
//!
//! Suffix rules are loaded once from the configured location and owned by
//! an [`OrgDomainCache`] that is handed to the DMARC rule. If loading fails
//! the last two labels are used and loading is retried on the next lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

/// Reversed suffix labels mapped to "is an exception rule"
type SuffixRules = HashMap<Vec<String>, bool>;

pub struct OrgDomainCache {
    source: Option<String>,
    rules: RwLock<Option<Arc<SuffixRules>>>,
    load_lock: Mutex<()>,
    memo: RwLock<HashMap<String, String>>,
}

impl OrgDomainCache {
    /// A cache that loads suffix data from `source` on first use
    pub fn new(source: Option<String>) -> Self {
        Self {
            source,
            rules: RwLock::new(None),
            load_lock: Mutex::new(()),
            memo: RwLock::new(HashMap::new()),
        }
    }

    /// A cache preloaded with public suffix list text
    pub fn from_rules_text(text: &str) -> Self {
        let mut cache = Self::new(None);
        cache.rules = RwLock::new(Some(Arc::new(parse_rules(text))));
        cache
    }

    /// The registrable domain for `domain`
    pub async fn organizational_domain(&self, domain: &str) -> String {
        let domain = domain.trim_end_matches('.').to_lowercase();

        if let Some(hit) = self.memo.read().await.get(&domain) {
            return hit.clone();
        }

        match self.rules().await {
            Some(rules) => {
                let org = org_domain_from_rules(&rules, &domain);
                self.memo.write().await.insert(domain, org.clone());
                org
            }
            None => last_labels(&domain, 2),
        }
    }

    async fn rules(&self) -> Option<Arc<SuffixRules>> {
        if let Some(rules) = self.rules.read().await.as_ref() {
            return Some(rules.clone());
        }

        let source = self.source.as_deref()?;
        let _guard = self.load_lock.lock().await;

        // Another task may have finished loading while we waited
        if let Some(rules) = self.rules.read().await.as_ref() {
            return Some(rules.clone());
        }

        match fetch(source).await {
            Ok(text) => {
                let rules = Arc::new(parse_rules(&text));
                info!(url = %source, rules = rules.len(), "Loaded public suffix data");
                *self.rules.write().await = Some(rules.clone());
                Some(rules)
            }
            Err(reason) => {
                error!(url = %source, "Unable to retrieve data from {}: {}", source, reason);
                None
            }
        }
    }
}

/// Read suffix data from an http(s) URL, a file:// URL or a plain path
async fn fetch(source: &str) -> Result<String, String> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| e.to_string())?;
        let response = client
            .get(source)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?;
        response.text().await.map_err(|e| e.to_string())
    } else {
        let path = source.strip_prefix("file://").unwrap_or(source);
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Parse public suffix list text into reversed-label rules
fn parse_rules(text: &str) -> SuffixRules {
    let mut rules = HashMap::new();

    for line in text.lines() {
        if line.trim().is_empty() || line.starts_with(' ') || line.starts_with("//") {
            continue;
        }
        // Rules end at the first whitespace
        let Some(rule) = line.split_whitespace().next() else {
            continue;
        };
        let rule = rule.to_lowercase();
        let (exception, rule) = match rule.strip_prefix('!') {
            Some(rest) => (true, rest.to_string()),
            None => (false, rule),
        };
        let labels: Vec<String> = rule.split('.').rev().map(str::to_string).collect();
        rules.insert(labels, exception);
    }

    debug!(rules = rules.len(), "Parsed public suffix rules");
    rules
}

fn last_labels(domain: &str, count: usize) -> String {
    let labels: Vec<&str> = domain.split('.').collect();
    labels[labels.len().saturating_sub(count)..].join(".")
}

fn org_domain_from_rules(rules: &SuffixRules, domain: &str) -> String {
    let reversed: Vec<&str> = domain.split('.').rev().collect();

    let hits: Vec<(&Vec<String>, bool)> = rules
        .iter()
        .filter(|(key, _)| {
            key.len() <= reversed.len()
                && key
                    .iter()
                    .zip(&reversed)
                    .all(|(rule, label)| rule == "*" || rule == label)
        })
        .map(|(key, exception)| (key, *exception))
        .collect();

    if hits.is_empty() {
        return last_labels(domain, 2);
    }

    // An exception rule names the registrable domain itself
    if let Some((key, _)) = hits.iter().find(|(_, exception)| *exception) {
        return last_labels(domain, key.len());
    }

    let longest = hits.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    last_labels(domain, longest + 1)
}
