//! Local mirrors of upstream records.

use crate::store::Record;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Sqlite;
use sqlx::query_builder::Separated;

/// SAML service-provider connection managed by the federation server.
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SamlConnection {
    pub id: String,
    pub name: String,
    pub entity_id: String,
    pub enabled: bool,
    pub acs_url: Option<String>,
    pub aggregated_at: DateTime<Utc>,
}

/// OpenID Connect client managed by the federation server.
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OidcClient {
    pub client_id: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    /// Comma separated.
    pub grant_types: String,
    /// Comma separated.
    pub redirect_uris: String,
    pub aggregated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LegacyConnection {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub enabled: bool,
    pub owner: Option<String>,
    pub aggregated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CmdbApplication {
    pub sys_id: String,
    pub name: String,
    pub description: Option<String>,
    pub business_owner: Option<String>,
    pub technical_owner: Option<String>,
    pub operational_status: Option<String>,
    pub aggregated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CmdbUser {
    pub sys_id: String,
    pub user_name: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub active: bool,
    pub aggregated_at: DateTime<Utc>,
}

impl Record for SamlConnection {
    const KIND: &'static str = "saml connection";
    const TABLE: &'static str = "saml_connections";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] =
        &["id", "name", "entity_id", "enabled", "acs_url", "aggregated_at"];

    fn key(&self) -> &str {
        &self.id
    }

    fn bind_row<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.name.clone())
            .push_bind(self.entity_id.clone())
            .push_bind(self.enabled)
            .push_bind(self.acs_url.clone())
            .push_bind(self.aggregated_at);
    }
}

impl Record for OidcClient {
    const KIND: &'static str = "oidc client";
    const TABLE: &'static str = "oidc_clients";
    const KEY: &'static str = "client_id";
    const COLUMNS: &'static [&'static str] = &[
        "client_id",
        "name",
        "description",
        "enabled",
        "grant_types",
        "redirect_uris",
        "aggregated_at",
    ];

    fn key(&self) -> &str {
        &self.client_id
    }

    fn bind_row<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.client_id.clone())
            .push_bind(self.name.clone())
            .push_bind(self.description.clone())
            .push_bind(self.enabled)
            .push_bind(self.grant_types.clone())
            .push_bind(self.redirect_uris.clone())
            .push_bind(self.aggregated_at);
    }
}

impl Record for LegacyConnection {
    const KIND: &'static str = "legacy connection";
    const TABLE: &'static str = "legacy_connections";
    const KEY: &'static str = "id";
    const COLUMNS: &'static [&'static str] =
        &["id", "name", "protocol", "enabled", "owner", "aggregated_at"];

    fn key(&self) -> &str {
        &self.id
    }

    fn bind_row<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.name.clone())
            .push_bind(self.protocol.clone())
            .push_bind(self.enabled)
            .push_bind(self.owner.clone())
            .push_bind(self.aggregated_at);
    }
}

impl Record for CmdbApplication {
    const KIND: &'static str = "cmdb application";
    const TABLE: &'static str = "cmdb_applications";
    const KEY: &'static str = "sys_id";
    const COLUMNS: &'static [&'static str] = &[
        "sys_id",
        "name",
        "description",
        "business_owner",
        "technical_owner",
        "operational_status",
        "aggregated_at",
    ];

    fn key(&self) -> &str {
        &self.sys_id
    }

    fn bind_row<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.sys_id.clone())
            .push_bind(self.name.clone())
            .push_bind(self.description.clone())
            .push_bind(self.business_owner.clone())
            .push_bind(self.technical_owner.clone())
            .push_bind(self.operational_status.clone())
            .push_bind(self.aggregated_at);
    }
}

impl Record for CmdbUser {
    const KIND: &'static str = "cmdb user";
    const TABLE: &'static str = "cmdb_users";
    const KEY: &'static str = "sys_id";
    const COLUMNS: &'static [&'static str] = &[
        "sys_id",
        "user_name",
        "email",
        "first_name",
        "last_name",
        "active",
        "aggregated_at",
    ];

    fn key(&self) -> &str {
        &self.sys_id
    }

    fn bind_row<'args>(&self, row: &mut Separated<'_, 'args, Sqlite, &'static str>) {
        row.push_bind(self.sys_id.clone())
            .push_bind(self.user_name.clone())
            .push_bind(self.email.clone())
            .push_bind(self.first_name.clone())
            .push_bind(self.last_name.clone())
            .push_bind(self.active)
            .push_bind(self.aggregated_at);
    }
}
