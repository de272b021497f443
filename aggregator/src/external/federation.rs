use super::{
    ExternalPage, PageToken, PagedSource, UpstreamAuth, UpstreamError, endpoint, get_json,
    lenient_bool, non_empty,
};
use crate::types::{OidcClient, SamlConnection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use url::Url;

const SAML_CONNECTIONS_PATH: &str = "sp/connections";
const OIDC_CLIENTS_PATH: &str = "oauth/clients";
const DEFAULT_MAX_PAGES: u64 = 10_000;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FederationEnvelope<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    /// Link to the next page; only its presence matters.
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationSamlConnection {
    pub id: String,
    pub name: String,
    pub entity_id: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub active: bool,
    pub acs_url: Option<String>,
}

impl FederationSamlConnection {
    pub fn into_record(self, aggregated_at: DateTime<Utc>) -> SamlConnection {
        SamlConnection {
            id: self.id,
            name: self.name,
            entity_id: self.entity_id,
            enabled: self.active,
            acs_url: non_empty(self.acs_url),
            aggregated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationOidcClient {
    pub client_id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub enabled: bool,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

impl FederationOidcClient {
    pub fn into_record(self, aggregated_at: DateTime<Utc>) -> OidcClient {
        OidcClient {
            client_id: self.client_id,
            name: self.name,
            description: non_empty(self.description),
            enabled: self.enabled,
            grant_types: self.grant_types.join(","),
            redirect_uris: self.redirect_uris.join(","),
            aggregated_at,
        }
    }
}

/// Federation server admin API client. Pages are numbered from 1.
#[derive(Clone)]
pub struct FederationClient {
    http_client: reqwest::Client,
    base_url: Url,
    auth: UpstreamAuth,
    page_size: u32,
    max_pages: u64,
}

impl FederationClient {
    pub fn new(
        http_client: reqwest::Client,
        base_url: Url,
        auth: UpstreamAuth,
        page_size: u32,
    ) -> Self {
        FederationClient {
            http_client,
            base_url,
            auth,
            page_size,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Page numbers always advance, so a server that keeps announcing a next
    /// page is cut off here instead.
    pub fn with_max_pages(mut self, max_pages: u64) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn saml_connections(&self) -> FederationSource<FederationSamlConnection> {
        FederationSource::new(self.clone(), "federation-saml", SAML_CONNECTIONS_PATH)
    }

    pub fn oidc_clients(&self) -> FederationSource<FederationOidcClient> {
        FederationSource::new(self.clone(), "federation-oidc", OIDC_CLIENTS_PATH)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        source_name: &'static str,
        path: &str,
        page: PageToken,
    ) -> Result<ExternalPage<T>, UpstreamError> {
        let mut url = endpoint(&self.base_url, path)?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("numberPerPage", &self.page_size.to_string());

        let request = self
            .auth
            .apply(self.http_client.get(url.clone()))
            .header("X-XSRF-Header", "PingFederate");
        let envelope: FederationEnvelope<T> = get_json(request, &url).await?;

        let next = match envelope.next_page {
            Some(_) if !envelope.items.is_empty() => {
                if page >= self.max_pages {
                    tracing::error!(source = source_name, uri = %url, limit = self.max_pages, "page limit reached");
                    return Err(UpstreamError::PageLimit {
                        source_name,
                        limit: self.max_pages,
                    });
                }
                Some(page + 1)
            }
            _ => None,
        };
        Ok(ExternalPage {
            items: envelope.items,
            next,
        })
    }
}

/// One federation collection as a [`PagedSource`].
pub struct FederationSource<T> {
    client: FederationClient,
    name: &'static str,
    path: &'static str,
    item: PhantomData<fn() -> T>,
}

impl<T> FederationSource<T> {
    fn new(client: FederationClient, name: &'static str, path: &'static str) -> Self {
        FederationSource {
            client,
            name,
            path,
            item: PhantomData,
        }
    }
}

#[async_trait]
impl<T> PagedSource for FederationSource<T>
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
        self.client
            .fetch(self.name, self.path, token.unwrap_or(1))
            .await
    }
}
