use super::{
    ExternalPage, PageToken, PagedSource, UpstreamAuth, UpstreamError, endpoint, get_json,
    lenient_bool, non_empty,
};
use crate::owners::parse_owners;
use crate::types::{CmdbApplication, CmdbUser};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use url::Url;

const APPLICATIONS_TABLE: &str = "cmdb_ci_appl";
const USERS_TABLE: &str = "sys_user";

#[derive(Deserialize)]
struct CmdbEnvelope<T> {
    #[serde(default = "Vec::new")]
    result: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct CmdbApplicationRecord {
    pub sys_id: String,
    pub name: String,
    pub short_description: Option<String>,
    pub operational_status: Option<String>,
}

impl CmdbApplicationRecord {
    pub fn into_record(self, aggregated_at: DateTime<Utc>) -> CmdbApplication {
        let owners = parse_owners(self.short_description.as_deref());
        CmdbApplication {
            sys_id: self.sys_id,
            name: self.name,
            description: non_empty(self.short_description),
            business_owner: owners.business_owner,
            technical_owner: owners.technical_owner,
            operational_status: non_empty(self.operational_status),
            aggregated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CmdbUserRecord {
    pub sys_id: String,
    pub user_name: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub active: bool,
}

impl CmdbUserRecord {
    pub fn into_record(self, aggregated_at: DateTime<Utc>) -> CmdbUser {
        CmdbUser {
            sys_id: self.sys_id,
            user_name: self.user_name,
            email: non_empty(self.email),
            first_name: non_empty(self.first_name),
            last_name: non_empty(self.last_name),
            active: self.active,
            aggregated_at,
        }
    }
}

/// CMDB table API client. Every field comes back as a string.
#[derive(Clone)]
pub struct CmdbClient {
    http_client: reqwest::Client,
    base_url: Url,
    auth: UpstreamAuth,
    page_size: u32,
}

impl CmdbClient {
    pub fn new(
        http_client: reqwest::Client,
        base_url: Url,
        auth: UpstreamAuth,
        page_size: u32,
    ) -> Self {
        CmdbClient {
            http_client,
            base_url,
            auth,
            page_size,
        }
    }

    pub fn applications(&self) -> CmdbTable<CmdbApplicationRecord> {
        CmdbTable::new(self.clone(), "cmdb-applications", APPLICATIONS_TABLE)
    }

    pub fn users(&self) -> CmdbTable<CmdbUserRecord> {
        CmdbTable::new(self.clone(), "cmdb-users", USERS_TABLE)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        table: &str,
        offset: PageToken,
    ) -> Result<ExternalPage<T>, UpstreamError> {
        let mut url = endpoint(&self.base_url, &format!("api/now/table/{table}"))?;
        url.query_pairs_mut()
            .append_pair("sysparm_offset", &offset.to_string())
            .append_pair("sysparm_limit", &self.page_size.to_string())
            .append_pair("sysparm_exclude_reference_link", "true");

        let request = self
            .auth
            .apply(self.http_client.get(url.clone()))
            .header("Accept", "application/json");
        let envelope: CmdbEnvelope<T> = get_json(request, &url).await?;

        let fetched = envelope.result.len() as u64;
        // The table API has no total; a short page is the last one.
        let next = (fetched > 0 && fetched >= u64::from(self.page_size)).then_some(offset + fetched);
        Ok(ExternalPage {
            items: envelope.result,
            next,
        })
    }
}

pub struct CmdbTable<T> {
    client: CmdbClient,
    name: &'static str,
    table: &'static str,
    item: PhantomData<fn() -> T>,
}

impl<T> CmdbTable<T> {
    fn new(client: CmdbClient, name: &'static str, table: &'static str) -> Self {
        CmdbTable {
            client,
            name,
            table,
            item: PhantomData,
        }
    }
}

#[async_trait]
impl<T> PagedSource for CmdbTable<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Item = T;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch_page(
        &self,
        token: Option<PageToken>,
    ) -> Result<ExternalPage<T>, UpstreamError> {
        self.client.fetch(self.table, token.unwrap_or(0)).await
    }
}
