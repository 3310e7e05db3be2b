use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::Authenticator;
use crate::entity::SENTINEL;
use crate::extract::{DetailExtractor, ListingExtractor};
use crate::navigator::Readiness;

pub const USERNAME_ENV: &str = "GATED_HARVEST_USERNAME";
pub const PASSWORD_ENV: &str = "GATED_HARVEST_PASSWORD";

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let username = std::env::var(USERNAME_ENV)
            .map_err(|_| anyhow::anyhow!("{} environment variable must be set", USERNAME_ENV))?;
        let password = std::env::var(PASSWORD_ENV)
            .map_err(|_| anyhow::anyhow!("{} environment variable must be set", PASSWORD_ENV))?;
        Ok(Self { username, password })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Payload of a `StartRun` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub credentials: Credentials,
    pub listing_query: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl WaitPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FieldRead {
    #[default]
    Text,
    Attr {
        name: String,
        #[serde(default)]
        strip_prefix: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub selector: String,
    #[serde(default)]
    pub read: FieldRead,
}

/// Everything site-specific: where to log in, what a candidate link looks
/// like and which fields a detail page carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    pub login_url: String,
    /// `name` or `id` of the username input.
    pub username_field: String,
    pub password_field: String,
    pub submit_selector: String,
    /// Regex matched against the location reached after submitting credentials.
    pub post_login_pattern: String,
    /// Regex whose match is the canonical prefix of a detail location.
    pub entity_link_pattern: String,
    pub identifier_suffix: String,
    pub listing_ready_selector: Option<String>,
    pub detail_ready_selector: Option<String>,
    pub fields: Vec<FieldSpec>,
    pub sentinel: String,
    pub wait: WaitPolicy,
    pub user_agent: String,
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            login_url: "https://www.linkedin.com/login".into(),
            username_field: "username".into(),
            password_field: "password".into(),
            submit_selector: r#"button[type="submit"]"#.into(),
            post_login_pattern: "/feed/".into(),
            entity_link_pattern: r"https://www\.linkedin\.com/in/[^/?#]+".into(),
            identifier_suffix: "/overlay/contact-info".into(),
            listing_ready_selector: None,
            detail_ready_selector: None,
            fields: vec![
                FieldSpec {
                    name: "name".into(),
                    selector: "h1".into(),
                    read: FieldRead::Text,
                },
                FieldSpec {
                    name: "email".into(),
                    selector: "a[href^='mailto:']".into(),
                    read: FieldRead::Attr {
                        name: "href".into(),
                        strip_prefix: Some("mailto:".into()),
                    },
                },
            ],
            sentinel: SENTINEL.into(),
            wait: WaitPolicy::default(),
            user_agent: concat!("gated_harvest/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl SiteProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read site profile {}", path.display()))?;
        let profile: SiteProfile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse site profile {}", path.display()))?;
        profile
            .validate()
            .with_context(|| format!("Invalid site profile {}", path.display()))?;
        Ok(profile)
    }

    /// Compile every pattern and selector once so bad values surface at load.
    pub fn validate(&self) -> Result<()> {
        Authenticator::from_profile(self)?;
        ListingExtractor::from_profile(self)?;
        DetailExtractor::from_profile(self)?;
        Readiness::from_selector("listing_ready_selector", self.listing_ready_selector.as_deref())?;
        Readiness::from_selector("detail_ready_selector", self.detail_ready_selector.as_deref())?;
        Ok(())
    }
}
