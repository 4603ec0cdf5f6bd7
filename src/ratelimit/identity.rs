//! Client identity resolution.

use std::net::IpAddr;

/// Identity used when nothing about the caller can be resolved.
pub const UNKNOWN_CLIENT: &str = "ip:unknown";

/// What the request pipeline knows about a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Authenticated user id, if the auth layer established one
    pub user_id: Option<String>,
    /// API key presented by the caller
    pub api_key: Option<String>,
    /// Source address of the connection
    pub remote_addr: Option<IpAddr>,
}

impl RequestIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Resolve the stable client identifier.
    ///
    /// Priority is fixed: authenticated user, then API key, then source
    /// address. Blank values count as absent.
    pub fn client_id(&self) -> String {
        if let Some(user) = non_blank(&self.user_id) {
            return format!("user:{}", user);
        }
        if let Some(key) = non_blank(&self.api_key) {
            return format!("apikey:{}", key);
        }
        match self.remote_addr {
            Some(addr) => format!("ip:{}", addr),
            None => UNKNOWN_CLIENT.to_string(),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
