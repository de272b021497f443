use crate::external::{UpstreamAuth, UpstreamError};
use crate::mediator::ColleagueOperation;
use crate::run_state::{Domain, OperationKind};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

impl Listener {
    fn admin() -> Self {
        Listener {
            port: 3001,
            ..Listener::default()
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: "sqlite://idp-connections.db".into(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct PaginationConfig {
    /// Public URL the service is reached at; page links are built from it.
    pub base_url: Url,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

fn default_max_page_size() -> u32 {
    100
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct UpstreamConfig {
    pub url: Url,
    #[serde(default = "no_auth")]
    pub auth: UpstreamAuth,
    #[serde(default = "default_upstream_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Most pages one run may fetch from a page-numbered upstream.
    #[serde(default = "default_max_pages")]
    pub max_pages: u64,
}

fn no_auth() -> UpstreamAuth {
    UpstreamAuth::None
}

fn default_upstream_page_size() -> u32 {
    100
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_pages() -> u64 {
    10_000
}

impl UpstreamConfig {
    pub fn http_client(&self) -> Result<reqwest::Client, UpstreamError> {
        Ok(reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?)
    }
}

#[derive(Clone, Deserialize, PartialEq)]
pub struct IdentityCloudConfig {
    pub url: Url,
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Operation keys such as `link:gateway-identity` to refuse up front.
    #[serde(default)]
    pub disabled_operations: Vec<String>,
}

impl std::fmt::Debug for IdentityCloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCloudConfig")
            .field("url", &self.url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .field("scope", &self.scope)
            .field("timeout_secs", &self.timeout_secs)
            .field("disabled_operations", &self.disabled_operations)
            .finish_non_exhaustive()
    }
}

impl IdentityCloudConfig {
    pub fn disabled_operations(&self) -> Result<Vec<ColleagueOperation>, ConfigError> {
        self.disabled_operations
            .iter()
            .map(|key| {
                key.parse::<ColleagueOperation>()
                    .map_err(|e| invalid(format!("identity_cloud.disabled_operations: {e}")))
            })
            .collect()
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ScheduleConfig {
    pub domain: Domain,
    #[serde(default = "default_schedule_kind")]
    pub kind: OperationKind,
    pub every_secs: u64,
}

fn default_schedule_kind() -> OperationKind {
    OperationKind::Aggregation
}

impl ScheduleConfig {
    pub fn job_id(&self) -> String {
        format!("{}:{}", self.domain, self.kind.as_str())
    }

    pub fn every(&self) -> Duration {
        Duration::from_secs(self.every_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default = "Listener::admin")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub pagination: PaginationConfig,
    /// Serves both SAML connections and OIDC clients.
    pub federation: Option<UpstreamConfig>,
    pub legacy: Option<UpstreamConfig>,
    /// Serves both applications and users.
    pub cmdb: Option<UpstreamConfig>,
    pub identity_cloud: Option<IdentityCloudConfig>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

impl Config {
    pub fn upstream(&self, domain: Domain) -> Option<&UpstreamConfig> {
        match domain {
            Domain::FederationSaml | Domain::FederationOidc => self.federation.as_ref(),
            Domain::Legacy => self.legacy.as_ref(),
            Domain::CmdbApplications | Domain::CmdbUsers => self.cmdb.as_ref(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.port == 0 || self.admin_listener.port == 0 {
            return Err(invalid("listener ports must be non-zero"));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("database.max_connections must be positive"));
        }
        if self.pagination.max_page_size == 0 {
            return Err(invalid("pagination.max_page_size must be positive"));
        }

        let upstreams = [
            ("federation", &self.federation),
            ("legacy", &self.legacy),
            ("cmdb", &self.cmdb),
        ];
        for (name, upstream) in upstreams {
            let Some(upstream) = upstream else { continue };
            if upstream.page_size == 0 {
                return Err(invalid(format!("{name}.page_size must be positive")));
            }
            if upstream.timeout_secs == 0 {
                return Err(invalid(format!("{name}.timeout_secs must be positive")));
            }
            if upstream.max_pages == 0 {
                return Err(invalid(format!("{name}.max_pages must be positive")));
            }
        }

        if let Some(identity_cloud) = &self.identity_cloud {
            identity_cloud.disabled_operations()?;
        }

        for schedule in &self.schedules {
            if schedule.every_secs == 0 {
                return Err(invalid(format!("schedule {} has a zero interval", schedule.job_id())));
            }
            if self.upstream(schedule.domain).is_none() {
                return Err(invalid(format!(
                    "schedule {} refers to an unconfigured upstream",
                    schedule.job_id()
                )));
            }
        }

        Ok(())
    }
}
