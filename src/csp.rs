//! Content-Security-Policy ratchet for the sandboxed document.
//!
//! Within one document lifetime a policy may only ever grant more: any
//! directive that would drop a previously granted source fails the whole
//! application.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::dom::{Document, DomError, NodeId};

pub const CSP_HTTP_EQUIV: &str = "Content-Security-Policy";

const WILDCARD: &str = "*";
const ALLOWED_SCHEMES: [&str; 4] = ["http", "https", "ws", "wss"];

/// First-party CDNs every widget may load from.
pub const DEFAULT_THIRD_PARTY_DOMAINS: [&str; 6] = [
    "https://cdn.jsdelivr.net",
    "https://unpkg.com",
    "https://cdnjs.cloudflare.com",
    "https://esm.sh",
    "https://fonts.googleapis.com",
    "https://fonts.gstatic.com",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CspError {
    #[error("CSP is being loosened")]
    Loosened,
    #[error("document has no <html> element to hold a <head>")]
    MissingHead,
    #[error("could not edit document head: {0}")]
    Document(#[from] DomError),
}

/// Caller-supplied policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CspConfiguration {
    pub resource_domains: Vec<String>,
    pub connect_domains: Vec<String>,
    pub is_trusted: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedCspConfiguration {
    pub resource_domains: BTreeSet<String>,
    pub connect_domains: BTreeSet<String>,
    pub is_trusted: bool,
}

/// How a directive changes from one policy to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyChange {
    Equal,
    /// Grants everything granted before, and more.
    Widened,
    /// Drops at least one source granted before.
    Narrowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CspOutcome {
    Installed,
    Unchanged,
}

pub fn normalize(config: &CspConfiguration) -> NormalizedCspConfiguration {
    let is_trusted = config.is_trusted.unwrap_or(false);
    let normalize_all = |tokens: &[String]| -> BTreeSet<String> {
        tokens
            .iter()
            .filter_map(|token| normalize_token(token, is_trusted))
            .collect()
    };
    NormalizedCspConfiguration {
        resource_domains: normalize_all(&config.resource_domains),
        connect_domains: normalize_all(&config.connect_domains),
        is_trusted,
    }
}

fn normalize_token(raw: &str, is_trusted: bool) -> Option<String> {
    let token = raw.trim().to_ascii_lowercase();
    if token.is_empty() {
        return None;
    }
    if token == WILDCARD {
        return Some(token);
    }
    let candidate = if token.contains("://") {
        token
    } else {
        format!("https://{token}")
    };
    let url = match Url::parse(&candidate) {
        Ok(url) => url,
        Err(err) => {
            warn!(target = "csp", token = %raw, error = %err, "dropping unparseable csp token");
            return None;
        }
    };
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        warn!(target = "csp", token = %raw, scheme = url.scheme(), "dropping csp token with unsupported scheme");
        return None;
    }
    if is_trusted {
        Some(candidate.trim_end_matches('/').to_string())
    } else {
        Some(url.origin().ascii_serialization())
    }
}

/// Compare one directive's sources. `*` grants everything.
pub fn compare_token_sets(previous: &BTreeSet<String>, next: &BTreeSet<String>) -> PolicyChange {
    if previous == next {
        return PolicyChange::Equal;
    }
    if next.contains(WILDCARD) {
        return PolicyChange::Widened;
    }
    if previous.contains(WILDCARD) {
        return PolicyChange::Narrowed;
    }
    if previous.is_subset(next) {
        PolicyChange::Widened
    } else {
        PolicyChange::Narrowed
    }
}

pub fn compare_policies(
    previous: &NormalizedCspConfiguration,
    next: &NormalizedCspConfiguration,
) -> PolicyChange {
    let trust = match (previous.is_trusted, next.is_trusted) {
        (true, false) => PolicyChange::Narrowed,
        (false, true) => PolicyChange::Widened,
        _ => PolicyChange::Equal,
    };
    let changes = [
        compare_token_sets(&previous.resource_domains, &next.resource_domains),
        compare_token_sets(&previous.connect_domains, &next.connect_domains),
        trust,
    ];
    if changes.contains(&PolicyChange::Narrowed) {
        PolicyChange::Narrowed
    } else if changes.iter().all(|change| *change == PolicyChange::Equal) {
        PolicyChange::Equal
    } else {
        PolicyChange::Widened
    }
}

/// Build the directive string for a normalized policy.
pub fn build_policy(config: &NormalizedCspConfiguration, extra_domains: &[String]) -> String {
    let mut defaults: Vec<&str> = DEFAULT_THIRD_PARTY_DOMAINS.to_vec();
    defaults.extend(extra_domains.iter().map(String::as_str));

    let with = |base: &[&str], domains: &BTreeSet<String>| -> String {
        let mut sources: Vec<&str> = base.to_vec();
        sources.extend(defaults.iter().copied());
        for domain in domains {
            if !sources.contains(&domain.as_str()) {
                sources.push(domain);
            }
        }
        sources.join(" ")
    };
    let resources = &config.resource_domains;

    [
        format!(
            "script-src {}",
            with(&["'self'", "'unsafe-inline'", "'unsafe-eval'", "blob:"], resources)
        ),
        format!("style-src {}", with(&["'self'", "'unsafe-inline'"], resources)),
        format!("img-src {}", with(&["'self'", "data:", "blob:"], resources)),
        format!("font-src {}", with(&["'self'", "data:"], resources)),
        format!("connect-src {}", with(&["'self'"], &config.connect_domains)),
        format!("media-src {}", with(&["'self'", "data:", "blob:"], resources)),
        "object-src 'none'".to_string(),
        "frame-src 'none'".to_string(),
        "base-uri 'self'".to_string(),
        "upgrade-insecure-requests".to_string(),
    ]
    .join("; ")
}

fn is_csp_meta(document: &Document, id: NodeId) -> bool {
    document.tag_name(id) == Some("meta")
        && document
            .attr(id, "http-equiv")
            .is_some_and(|value| value.eq_ignore_ascii_case(CSP_HTTP_EQUIV))
}

/// Policy state for one sandboxed document.
#[derive(Debug, Default)]
pub struct CspManager {
    previous: Option<NormalizedCspConfiguration>,
    current_meta: Option<NodeId>,
    extra_domains: Vec<String>,
}

impl CspManager {
    pub fn new(extra_domains: Vec<String>) -> Self {
        Self {
            previous: None,
            current_meta: None,
            extra_domains,
        }
    }

    pub fn current(&self) -> Option<&NormalizedCspConfiguration> {
        self.previous.as_ref()
    }

    /// Forget the applied policy; the next document starts from scratch.
    pub fn reset(&mut self) {
        self.previous = None;
        self.current_meta = None;
    }

    pub fn apply(
        &mut self,
        document: &mut Document,
        config: &CspConfiguration,
    ) -> Result<CspOutcome, CspError> {
        let next = normalize(config);
        if let Some(previous) = &self.previous {
            match compare_policies(previous, &next) {
                PolicyChange::Narrowed => {
                    warn!(target = "csp", "refusing to loosen content security policy");
                    return Err(CspError::Loosened);
                }
                PolicyChange::Equal => {
                    debug!(target = "csp", "content security policy unchanged");
                    return Ok(CspOutcome::Unchanged);
                }
                PolicyChange::Widened => {}
            }
        }

        let content = build_policy(&next, &self.extra_domains);
        let head = document.head().ok_or(CspError::MissingHead)?;

        let stale: Vec<NodeId> = document
            .children(head)
            .iter()
            .copied()
            .filter(|child| Some(*child) == self.current_meta || is_csp_meta(document, *child))
            .collect();
        for node in stale {
            document.remove(node)?;
        }

        let meta = document.create_element(
            "meta",
            &[("http-equiv", CSP_HTTP_EQUIV), ("content", content.as_str())],
        );
        let first = document.children(head).first().copied();
        document.insert_before(head, meta, first)?;

        info!(
            target = "csp",
            resources = next.resource_domains.len(),
            connect = next.connect_domains.len(),
            trusted = next.is_trusted,
            "installed content security policy"
        );
        self.previous = Some(next);
        self.current_meta = Some(meta);
        Ok(CspOutcome::Installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(domains: &[&str]) -> CspConfiguration {
        CspConfiguration {
            resource_domains: domains.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn meta_tags(document: &Document) -> Vec<NodeId> {
        document
            .elements_by_tag("meta")
            .into_iter()
            .filter(|id| is_csp_meta(document, *id))
            .collect()
    }

    #[test]
    fn normalizes_tokens() {
        let normalized = normalize(&CspConfiguration {
            resource_domains: vec![
                "A.com".into(),
                "https://a.com/path".into(),
                "ftp://files.example".into(),
                "wss://live.example:8443/socket".into(),
                "*".into(),
                " ".into(),
            ],
            connect_domains: vec![],
            is_trusted: None,
        });
        let expected: BTreeSet<String> = ["*", "https://a.com", "wss://live.example:8443"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(normalized.resource_domains, expected);
        assert!(!normalized.is_trusted);
    }

    #[test]
    fn trusted_tokens_keep_their_path() {
        let normalized = normalize(&CspConfiguration {
            resource_domains: vec!["https://a.com/assets/".into()],
            is_trusted: Some(true),
            ..Default::default()
        });
        assert!(normalized.resource_domains.contains("https://a.com/assets"));
    }

    #[test]
    fn token_set_comparison() {
        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        assert_eq!(compare_token_sets(&set(&["a"]), &set(&["a"])), PolicyChange::Equal);
        assert_eq!(compare_token_sets(&set(&["a"]), &set(&["a", "b"])), PolicyChange::Widened);
        assert_eq!(compare_token_sets(&set(&["a", "b"]), &set(&["a"])), PolicyChange::Narrowed);
        assert_eq!(compare_token_sets(&set(&["a", "b"]), &set(&["b", "c"])), PolicyChange::Narrowed);
        assert_eq!(compare_token_sets(&set(&["a"]), &set(&["c"])), PolicyChange::Narrowed);
        assert_eq!(compare_token_sets(&set(&["*"]), &set(&["a"])), PolicyChange::Narrowed);
        assert_eq!(compare_token_sets(&set(&["a"]), &set(&["*"])), PolicyChange::Widened);
    }

    #[test]
    fn ratchets_within_a_document() {
        let mut document = Document::parse("<html><head></head><body></body></html>");
        let mut manager = CspManager::default();

        assert_eq!(
            manager.apply(&mut document, &resources(&["a.com"])).unwrap(),
            CspOutcome::Installed
        );
        let first = meta_tags(&document);
        assert_eq!(first.len(), 1);

        assert_eq!(
            manager.apply(&mut document, &resources(&[])),
            Err(CspError::Loosened)
        );
        assert_eq!(meta_tags(&document), first);

        assert_eq!(
            manager.apply(&mut document, &resources(&["a.com", "b.com"])).unwrap(),
            CspOutcome::Installed
        );
        let second = meta_tags(&document);
        assert_eq!(second.len(), 1);
        assert_ne!(second, first);
        let content = document.attr(second[0], "content").unwrap();
        assert!(content.contains("https://b.com"));
        assert!(content.contains("upgrade-insecure-requests"));

        let before = document.serialize();
        assert_eq!(
            manager.apply(&mut document, &resources(&["b.com", "A.COM"])).unwrap(),
            CspOutcome::Unchanged
        );
        assert_eq!(document.serialize(), before);
    }

    #[test]
    fn losing_trust_is_loosening() {
        let mut document = Document::parse("");
        let mut manager = CspManager::default();
        let trusted = CspConfiguration {
            is_trusted: Some(true),
            ..Default::default()
        };
        manager.apply(&mut document, &trusted).unwrap();
        assert_eq!(
            manager.apply(&mut document, &CspConfiguration::default()),
            Err(CspError::Loosened)
        );
    }

    #[test]
    fn replaces_existing_meta_and_resets() {
        let mut document = Document::parse(
            "<html><head><meta http-equiv=\"content-security-policy\" content=\"default-src 'none'\"></head></html>",
        );
        let mut manager = CspManager::new(vec!["https://assets.example".into()]);
        manager.apply(&mut document, &resources(&["a.com"])).unwrap();
        let tags = meta_tags(&document);
        assert_eq!(tags.len(), 1);
        assert!(document
            .attr(tags[0], "content")
            .unwrap()
            .contains("https://assets.example"));

        manager.reset();
        assert!(manager.current().is_none());
        manager.apply(&mut document, &resources(&[])).unwrap();
        assert_eq!(meta_tags(&document).len(), 1);
    }

    #[test]
    fn widening_after_the_meta_was_detached_installs_a_fresh_one() {
        let mut document = Document::parse("<html><head><title>t</title></head><body></body></html>");
        let mut manager = CspManager::new(Vec::new());
        manager.apply(&mut document, &resources(&["a.com"])).unwrap();
        let installed = meta_tags(&document)[0];
        document.remove(installed).unwrap();

        let outcome = manager.apply(&mut document, &resources(&["a.com", "b.com"]));
        assert!(outcome.is_ok());
        let tags = meta_tags(&document);
        assert_eq!(tags.len(), 1);
        assert_ne!(tags[0], installed);
    }

    #[test]
    fn document_errors_surface_through_csp_error() {
        let err = CspError::from(DomError::MissingNode(7));
        assert_eq!(err.to_string(), "could not edit document head: missing node 7");
    }
}
