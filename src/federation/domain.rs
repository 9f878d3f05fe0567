//! Domain allow/block policy for federation peers

use crate::config::FederationConfig;

/// Decides whether a remote domain may federate with this instance.
#[cfg_attr(test, mockall::automock)]
pub trait DomainGate: Send + Sync {
    fn is_blocked(&self, domain: &str) -> bool;
}

/// Static domain policy built from configuration.
///
/// A blocked entry also covers its subdomains. When an allow list is set
/// (limited federation mode) every domain outside it is blocked too.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    blocked: Vec<String>,
    allowed: Option<Vec<String>>,
}

impl DomainPolicy {
    pub fn new(blocked: Vec<String>, allowed: Option<Vec<String>>) -> Self {
        let normalize = |domains: Vec<String>| -> Vec<String> {
            domains
                .into_iter()
                .map(|d| extract_domain(&d))
                .filter(|d| !d.is_empty())
                .collect()
        };

        Self {
            blocked: normalize(blocked),
            allowed: allowed.map(normalize),
        }
    }

    pub fn from_config(config: &FederationConfig) -> Self {
        Self::new(
            config.blocked_domains.clone(),
            config.allowed_domains.clone(),
        )
    }
}

fn covers(entry: &str, domain: &str) -> bool {
    domain == entry
        || domain
            .strip_suffix(entry)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

impl DomainGate for DomainPolicy {
    fn is_blocked(&self, domain: &str) -> bool {
        let domain = extract_domain(domain);
        if domain.is_empty() {
            return false;
        }

        if self.blocked.iter().any(|entry| covers(entry, &domain)) {
            return true;
        }

        match &self.allowed {
            Some(allowed) => !allowed.iter().any(|entry| covers(entry, &domain)),
            None => false,
        }
    }
}

/// Domain a keyId belongs to.
///
/// `acct:user@host` yields `host`, anything else is treated as a URI.
pub fn key_id_domain(key_id: &str) -> String {
    match key_id.strip_prefix("acct:") {
        Some(handle) => extract_domain(handle.rsplit('@').next().unwrap_or(handle)),
        None => extract_domain(key_id),
    }
}

fn default_port_for_scheme(scheme: &str) -> Option<u16> {
    if scheme.eq_ignore_ascii_case("http") {
        Some(80)
    } else if scheme.eq_ignore_ascii_case("https") {
        Some(443)
    } else {
        None
    }
}

fn format_domain_key(host: &str, port: Option<u16>, scheme: &str) -> String {
    let normalized_host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    let normalized_port = port.filter(|p| Some(*p) != default_port_for_scheme(scheme));

    match normalized_port {
        Some(port) if normalized_host.contains(':') => format!("[{}]:{}", normalized_host, port),
        Some(port) => format!("{}:{}", normalized_host, port),
        None => normalized_host,
    }
}

/// Extract a normalized domain from an actor URI, URL or bare host.
pub fn extract_domain(uri: &str) -> String {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(parsed) = url::Url::parse(trimmed) {
        if let Some(host) = parsed.host_str() {
            return format_domain_key(host, parsed.port(), parsed.scheme());
        }
    }

    let fallback = trimmed.split("://").nth(1).unwrap_or(trimmed);
    let authority = fallback
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(fallback)
        .trim();
    if authority.is_empty() {
        return String::new();
    }

    if let Ok(parsed_authority) = url::Url::parse(&format!("https://{}", authority)) {
        if let Some(host) = parsed_authority.host_str() {
            return format_domain_key(host, parsed_authority.port(), "https");
        }
    }

    authority.trim_end_matches('.').to_ascii_lowercase()
}
