//! Clients for the systems the aggregator mirrors.
//!
//! Each upstream pages differently; [`PagedSource`] hides that behind a
//! token that is either a page number or a record offset, and
//! [`collect_all`] drains a source into memory.

pub mod cmdb;
pub mod federation;
pub mod legacy;

pub use cmdb::CmdbClient;
pub use federation::FederationClient;
pub use legacy::LegacyClient;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use url::Url;

/// Page number or record offset, depending on the source.
pub type PageToken = u64;

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("upstream {uri} returned status {status}")]
    Status { uri: String, status: u16 },
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("could not decode response from {uri}: {source}")]
    Decode {
        uri: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("{source_name} still had a next page after {limit} pages")]
    PageLimit {
        source_name: &'static str,
        limit: u64,
    },
    #[error("{source_name} did not advance past page token {token}")]
    Stalled {
        source_name: &'static str,
        token: PageToken,
    },
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamAuth {
    None,
    Basic { username: String, password: String },
    ApiKey { header: String, key: String },
}

impl std::fmt::Debug for UpstreamAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamAuth::None => f.write_str("None"),
            UpstreamAuth::Basic { username, .. } => {
                f.debug_struct("Basic").field("username", username).finish_non_exhaustive()
            }
            UpstreamAuth::ApiKey { header, .. } => {
                f.debug_struct("ApiKey").field("header", header).finish_non_exhaustive()
            }
        }
    }
}

impl UpstreamAuth {
    pub(crate) fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            UpstreamAuth::None => request,
            UpstreamAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            UpstreamAuth::ApiKey { header, key } => request.header(header.as_str(), key.as_str()),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct ExternalPage<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

#[async_trait]
pub trait PagedSource: Send + Sync {
    type Item: Send;

    /// Used in logs and errors.
    fn name(&self) -> &'static str;

    /// `None` fetches the first page.
    async fn fetch_page(
        &self,
        token: Option<PageToken>,
    ) -> Result<ExternalPage<Self::Item>, UpstreamError>;
}

/// Fetches every page of `source`. The first failing page aborts the walk and
/// nothing collected so far is returned.
pub async fn collect_all<S>(source: &S) -> Result<Vec<S::Item>, UpstreamError>
where
    S: PagedSource + ?Sized,
{
    let mut items = Vec::new();
    let mut token: Option<PageToken> = None;
    let mut pages = 0;

    loop {
        let page = source.fetch_page(token).await?;
        pages += 1;
        items.extend(page.items);

        match page.next {
            Some(next) if token.is_some_and(|current| next <= current) => {
                return Err(UpstreamError::Stalled {
                    source_name: source.name(),
                    token: next,
                });
            }
            Some(next) => token = Some(next),
            None => break,
        }
    }

    tracing::debug!(source = source.name(), pages, records = items.len(), "fetched upstream pages");
    Ok(items)
}

/// `base` with `path` appended, keeping any path prefix on `base`.
pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url, UpstreamError> {
    let full = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&full).map_err(|e| UpstreamError::InvalidUrl(format!("{full}: {e}")))
}

pub(crate) async fn get_json<T: DeserializeOwned>(
    request: RequestBuilder,
    uri: &Url,
) -> Result<T, UpstreamError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        tracing::warn!(uri = %uri, status = status.as_u16(), "upstream request failed");
        return Err(UpstreamError::Status {
            uri: uri.to_string(),
            status: status.as_u16(),
        });
    }

    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|source| UpstreamError::Decode {
        uri: uri.to_string(),
        source,
    })
}

/// Accepts JSON booleans as well as the string spellings upstreams use
/// (`"true"`, `"1"`, `"Y"`, `"enabled"`, ...). Anything unrecognised is false.
pub(crate) fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(i64),
        Text(String),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Number(n)) => n != 0,
        Some(Flag::Text(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "y" | "yes" | "enabled" | "active"
        ),
        None => false,
    })
}

/// Treats empty strings as absent.
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves canned pages keyed by token and records what was asked for.
    struct ScriptedSource {
        pages: Vec<(Option<PageToken>, Result<ExternalPage<u32>, u16>)>,
        requested: Mutex<Vec<Option<PageToken>>>,
    }

    #[async_trait]
    impl PagedSource for ScriptedSource {
        type Item = u32;

        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_page(
            &self,
            token: Option<PageToken>,
        ) -> Result<ExternalPage<u32>, UpstreamError> {
            self.requested.lock().unwrap().push(token);
            let (_, page) = self
                .pages
                .iter()
                .find(|(t, _)| *t == token)
                .expect("unexpected token");
            match page {
                Ok(page) => Ok(ExternalPage {
                    items: page.items.clone(),
                    next: page.next,
                }),
                Err(status) => Err(UpstreamError::Status {
                    uri: format!("scripted/{token:?}"),
                    status: *status,
                }),
            }
        }
    }

    fn page(items: &[u32], next: Option<PageToken>) -> Result<ExternalPage<u32>, u16> {
        Ok(ExternalPage {
            items: items.to_vec(),
            next,
        })
    }

    #[tokio::test]
    async fn collects_until_no_next_token() {
        let source = ScriptedSource {
            pages: vec![
                (None, page(&[1, 2], Some(2))),
                (Some(2), page(&[3, 4], Some(4))),
                (Some(4), page(&[5], None)),
            ],
            requested: Mutex::default(),
        };

        assert_eq!(collect_all(&source).await.unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(
            *source.requested.lock().unwrap(),
            vec![None, Some(2), Some(4)]
        );
    }

    #[tokio::test]
    async fn failing_page_aborts_the_walk() {
        let source = ScriptedSource {
            pages: vec![
                (None, page(&[1, 2], Some(2))),
                (Some(2), Err(503)),
                (Some(4), page(&[5], None)),
            ],
            requested: Mutex::default(),
        };

        let err = collect_all(&source).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Status { status: 503, .. }));
        assert_eq!(source.requested.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn token_that_does_not_advance_is_an_error() {
        let source = ScriptedSource {
            pages: vec![
                (None, page(&[1], Some(3))),
                (Some(3), page(&[2], Some(3))),
            ],
            requested: Mutex::default(),
        };

        let err = collect_all(&source).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Stalled { token: 3, .. }));
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let base = Url::parse("https://cmdb.example.com/servicenow/").unwrap();
        assert_eq!(
            endpoint(&base, "/api/now/table/sys_user").unwrap().as_str(),
            "https://cmdb.example.com/servicenow/api/now/table/sys_user"
        );
    }

    #[test]
    fn lenient_bool_spellings() {
        #[derive(Deserialize)]
        struct Row {
            #[serde(default, deserialize_with = "lenient_bool")]
            flag: bool,
        }

        let parse = |json: &str| serde_json::from_str::<Row>(json).unwrap().flag;
        assert!(parse(r#"{"flag": true}"#));
        assert!(parse(r#"{"flag": "true"}"#));
        assert!(parse(r#"{"flag": "Y"}"#));
        assert!(parse(r#"{"flag": 1}"#));
        assert!(!parse(r#"{"flag": "false"}"#));
        assert!(!parse(r#"{"flag": ""}"#));
        assert!(!parse(r#"{"flag": null}"#));
        assert!(!parse(r#"{}"#));
    }

    #[test]
    fn auth_debug_hides_secrets() {
        let auth = UpstreamAuth::Basic {
            username: "svc".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{auth:?}").contains("hunter2"));
    }
}
