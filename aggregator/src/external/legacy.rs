use super::{
    ExternalPage, PageToken, PagedSource, UpstreamAuth, UpstreamError, endpoint, get_json,
    lenient_bool, non_empty,
};
use crate::types::LegacyConnection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyEnvelope {
    #[serde(default)]
    result: Vec<LegacyRecord>,
    #[serde(default)]
    total_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct LegacyRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub enabled: bool,
    pub owner: Option<String>,
}

impl LegacyRecord {
    pub fn into_record(self, aggregated_at: DateTime<Utc>) -> LegacyConnection {
        LegacyConnection {
            id: self.id,
            name: self.name,
            protocol: self.protocol.to_ascii_uppercase(),
            enabled: self.enabled,
            owner: non_empty(self.owner),
            aggregated_at,
        }
    }
}

/// Legacy access-management API. Pages by record offset.
pub struct LegacyClient {
    http_client: reqwest::Client,
    base_url: Url,
    auth: UpstreamAuth,
    page_size: u32,
}

impl LegacyClient {
    pub fn new(
        http_client: reqwest::Client,
        base_url: Url,
        auth: UpstreamAuth,
        page_size: u32,
    ) -> Self {
        LegacyClient {
            http_client,
            base_url,
            auth,
            page_size,
        }
    }
}

#[async_trait]
impl PagedSource for LegacyClient {
    type Item = LegacyRecord;

    fn name(&self) -> &'static str {
        "legacy-connections"
    }

    async fn fetch_page(
        &self,
        token: Option<PageToken>,
    ) -> Result<ExternalPage<LegacyRecord>, UpstreamError> {
        let offset = token.unwrap_or(0);
        let mut url = endpoint(&self.base_url, "connections")?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &self.page_size.to_string());

        let request = self.auth.apply(self.http_client.get(url.clone()));
        let envelope: LegacyEnvelope = get_json(request, &url).await?;

        let fetched = envelope.result.len() as u64;
        let next = (fetched > 0 && offset + fetched < envelope.total_count)
            .then_some(offset + fetched);
        Ok(ExternalPage {
            items: envelope.result,
            next,
        })
    }
}
