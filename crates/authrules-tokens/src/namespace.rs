//! Custom claim namespacing
//!
//! A custom claim survives finalization only if its key is an absolute
//! `http`/`https` URI whose host is not on a reserved domain. Everything
//! else, including standard claim names like `sub`, is stripped.
use authrules_core::ClaimMap;
use url::Url;

#[derive(Debug, Clone)]
pub struct ClaimNamespace {
    reserved: Vec<String>,
}

impl ClaimNamespace {
    pub fn new<I, S>(reserved: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            reserved: reserved
                .into_iter()
                .map(|d| d.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    pub fn reserved_domains(&self) -> &[String] {
        &self.reserved
    }

    pub fn is_reserved_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.reserved.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn allows(&self, key: &str) -> bool {
        let Ok(url) = Url::parse(key) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        match url.host_str() {
            Some(host) => !self.is_reserved_host(host),
            None => false,
        }
    }

    /// Splits `claims` into the allowed ones and the stripped keys.
    pub fn filter(&self, claims: &ClaimMap) -> (ClaimMap, Vec<String>) {
        let mut kept = ClaimMap::new();
        let mut stripped = Vec::new();
        for (key, value) in claims {
            if self.allows(key) {
                kept.insert(key.clone(), value.clone());
            } else {
                stripped.push(key.clone());
            }
        }
        (kept, stripped)
    }
}
