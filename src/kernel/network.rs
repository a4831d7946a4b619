//! Network bridge
//!
//! Guests see a plain synchronous fetch; the bridge consults the policy
//! engine first (a denial becomes a 403 result without any traffic),
//! then hands the request through a single-slot mailbox to the fetch
//! adapter. Under this single-threaded host the hand-off collapses to a
//! direct call; the mailbox contract stays the same either way.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kernel::mailbox::Mailbox;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FetchResponse {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            status: 403,
            headers: Vec::new(),
            body: Vec::new(),
            error: Some(reason.into()),
        }
    }

    pub fn transport_error(reason: impl Into<String>) -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            body: Vec::new(),
            error: Some(reason.into()),
        }
    }
}

/// Platform adapter actually performing HTTP.
pub trait HttpFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, String>;
}

/// Allowed-hosts list plus an optional method filter.
#[derive(Default)]
pub struct NetworkPolicy {
    allowed_hosts: Vec<String>,
    allowed_methods: Option<Vec<String>>,
}

impl NetworkPolicy {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self {
            allowed_hosts,
            allowed_methods: None,
        }
    }

    pub fn with_methods(mut self, methods: Vec<String>) -> Self {
        self.allowed_methods = Some(methods.iter().map(|m| m.to_uppercase()).collect());
        self
    }

    /// Host portion of a URL: everything between `://` and the next
    /// `/`, `?`, or `#`, with any `:port` stripped.
    fn host_of(url: &str) -> Option<String> {
        let rest = url.split("://").nth(1)?;
        let host = rest
            .split(|c| c == '/' || c == '?' || c == '#')
            .next()
            .unwrap_or("")
            .split('@')
            .last()
            .unwrap_or("");
        let host = host.split(':').next().unwrap_or("");
        if host.is_empty() {
            None
        } else {
            Some(host.to_lowercase())
        }
    }

    /// Check a request; `Err` carries the denial reason.
    pub fn check(&self, request: &FetchRequest) -> Result<(), String> {
        let Some(host) = Self::host_of(&request.url) else {
            return Err(format!("malformed url: {}", request.url));
        };
        let allowed = self.allowed_hosts.iter().any(|entry| {
            let entry = entry.to_lowercase();
            host == entry || host.ends_with(&format!(".{}", entry))
        });
        if !allowed {
            return Err(format!("host not in allowlist: {}", host));
        }
        if let Some(methods) = &self.allowed_methods {
            if !methods.contains(&request.method.to_uppercase()) {
                return Err(format!("method not allowed: {}", request.method));
            }
        }
        Ok(())
    }
}

pub struct NetworkBridge {
    policy: NetworkPolicy,
    fetcher: Option<Box<dyn HttpFetcher>>,
    mailbox: Mailbox<FetchRequest, FetchResponse>,
}

impl NetworkBridge {
    pub fn new(policy: NetworkPolicy, fetcher: Option<Box<dyn HttpFetcher>>) -> Self {
        Self {
            policy,
            fetcher,
            mailbox: Mailbox::new(),
        }
    }

    /// Disabled bridge: every request is denied.
    pub fn disabled() -> Self {
        Self::new(NetworkPolicy::default(), None)
    }

    /// Synchronous-looking fetch as observed by the guest.
    pub async fn fetch(&self, request: FetchRequest) -> FetchResponse {
        if let Err(reason) = self.policy.check(&request) {
            warn!(url = %request.url, %reason, "network request denied");
            return FetchResponse::denied(reason);
        }
        debug!(url = %request.url, method = %request.method, "network fetch");

        if self.mailbox.post_request(request).is_err() {
            return FetchResponse::transport_error("network bridge busy");
        }
        self.pump();
        match self.mailbox.await_response().await {
            Ok(response) => response,
            Err(message) => FetchResponse::transport_error(message),
        }
    }

    /// Service one pending request: take it from the mailbox, run the
    /// adapter, publish the response or error.
    fn pump(&self) {
        let Some(request) = self.mailbox.try_take_request() else {
            return;
        };
        match &self.fetcher {
            None => self.mailbox.post_error("no network adapter configured"),
            Some(fetcher) => match fetcher.fetch(&request) {
                Ok(response) => self.mailbox.post_response(response),
                Err(message) => self.mailbox.post_error(message),
            },
        }
    }
}
