use super::{LinkOutcome, LinkTarget, LinkingError, LinkingFailure, TokenSource};
use crate::mediator::ColleagueOperation;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Support {
    Supported,
    Unsupported,
}

/// Which linking operations this deployment can perform.
#[derive(Clone, Debug)]
pub struct Capabilities {
    support: HashMap<ColleagueOperation, Support>,
}

impl Default for Capabilities {
    fn default() -> Self {
        let mut support = HashMap::new();
        for target in LinkTarget::ALL {
            support.insert(ColleagueOperation::Link(target), Support::Supported);
            support.insert(ColleagueOperation::Unlink(target), Support::Supported);
        }
        // The identity cloud exposes no gateway unlink endpoint.
        support.insert(
            ColleagueOperation::Unlink(LinkTarget::Gateway),
            Support::Unsupported,
        );
        support.insert(ColleagueOperation::AccountInsights, Support::Unsupported);
        Capabilities { support }
    }
}

impl Capabilities {
    pub fn disable(mut self, operation: ColleagueOperation) -> Self {
        self.support.insert(operation, Support::Unsupported);
        self
    }

    pub fn support(&self, operation: ColleagueOperation) -> Support {
        self.support
            .get(&operation)
            .copied()
            .unwrap_or(Support::Unsupported)
    }

    pub fn require(&self, operation: ColleagueOperation) -> Result<(), LinkingError> {
        match self.support(operation) {
            Support::Supported => Ok(()),
            Support::Unsupported => Err(LinkingError::Unsupported(operation)),
        }
    }

    /// Operation key to support status, sorted by key.
    pub fn as_map(&self) -> Vec<(String, Support)> {
        let mut entries: Vec<_> = self
            .support
            .iter()
            .map(|(op, support)| (op.to_string(), *support))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkRequest<'a> {
    correlation_id: &'a str,
}

pub struct LinkingClient {
    http_client: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenSource>,
    capabilities: Capabilities,
}

impl LinkingClient {
    pub fn new(
        http_client: reqwest::Client,
        base_url: Url,
        tokens: Arc<dyn TokenSource>,
        capabilities: Capabilities,
    ) -> Self {
        LinkingClient {
            http_client,
            base_url,
            tokens,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Links `user_id` to the account identified by `correlation_id`.
    ///
    /// Non-success answers other than 401/403 come back as
    /// [`LinkOutcome::Failed`] rather than an error.
    pub async fn link(
        &self,
        target: LinkTarget,
        user_id: &str,
        correlation_id: &str,
    ) -> Result<LinkOutcome, LinkingError> {
        self.capabilities.require(ColleagueOperation::Link(target))?;
        if correlation_id.is_empty() {
            return Err(LinkingError::InvalidRequest("correlationId is empty".into()));
        }

        let url = self.link_url(target, user_id)?;
        let body = LinkRequest { correlation_id };
        let response = self
            .send_authorized(&url, |token| {
                self.http_client.put(url.clone()).bearer_auth(token).json(&body)
            })
            .await?;

        let status = response.status();
        if status.is_success() {
            let text = response.text().await?;
            let record = if text.trim().is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
            };
            tracing::info!(%target, user_id, "identity linked");
            return Ok(LinkOutcome::Linked(record));
        }

        let message = response.text().await.unwrap_or_default();
        let message = if message.is_empty() {
            status.canonical_reason().unwrap_or("link failed").to_string()
        } else {
            message
        };
        tracing::warn!(%target, user_id, uri = %url, status = status.as_u16(), "link rejected");
        Ok(LinkOutcome::Failed(LinkingFailure::new(status.as_u16(), message)))
    }

    /// Removes the link; anything other than 204 is a conflict.
    pub async fn unlink(&self, target: LinkTarget, user_id: &str) -> Result<(), LinkingError> {
        self.capabilities.require(ColleagueOperation::Unlink(target))?;

        let url = self.link_url(target, user_id)?;
        let response = self
            .send_authorized(&url, |token| {
                self.http_client.delete(url.clone()).bearer_auth(token)
            })
            .await?;

        if response.status() != StatusCode::NO_CONTENT {
            tracing::warn!(%target, user_id, uri = %url, status = response.status().as_u16(), "unlink rejected");
            return Err(LinkingError::Conflict {
                uri: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        tracing::info!(%target, user_id, "identity unlinked");
        Ok(())
    }

    fn link_url(&self, target: LinkTarget, user_id: &str) -> Result<Url, LinkingError> {
        if user_id.is_empty() {
            return Err(LinkingError::InvalidRequest("userId is empty".into()));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| LinkingError::InvalidRequest("identity cloud url cannot be a base".into()))?
            .pop_if_empty()
            .extend(["users", user_id, "links", target.as_str()]);
        Ok(url)
    }

    /// Sends a request, refreshing the token and retrying exactly once on 401/403.
    async fn send_authorized<F>(&self, url: &Url, build: F) -> Result<Response, LinkingError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.tokens.token().await?;
        let response = build(&token).send().await?;
        if !is_unauthorized(response.status()) {
            return Ok(response);
        }

        tracing::info!(uri = %url, status = response.status().as_u16(), "refreshing identity cloud token");
        let token = self.tokens.refresh().await?;
        let response = build(&token).send().await?;
        if is_unauthorized(response.status()) {
            tracing::error!(uri = %url, status = response.status().as_u16(), "unauthorized after token refresh");
            return Err(LinkingError::Unauthorized {
                uri: url.to_string(),
            });
        }
        Ok(response)
    }
}

fn is_unauthorized(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Hands out "token-0", then "token-1" after each refresh.
    #[derive(Default)]
    struct CountingTokens {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for CountingTokens {
        async fn token(&self) -> Result<String, LinkingError> {
            Ok(format!("token-{}", self.refreshes.load(Ordering::SeqCst)))
        }

        async fn refresh(&self) -> Result<String, LinkingError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{n}"))
        }
    }

    fn client(server: &MockServer, tokens: Arc<CountingTokens>) -> LinkingClient {
        LinkingClient::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/identity/", server.uri())).unwrap(),
            tokens,
            Capabilities::default(),
        )
    }

    #[tokio::test]
    async fn link_succeeds_after_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/identity/users/u-1/links/directory-account"))
            .and(header("authorization", "Bearer token-0"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/identity/users/u-1/links/directory-account"))
            .and(header("authorization", "Bearer token-1"))
            .and(body_json(json!({"correlationId": "CN=jdoe,OU=Users"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_id": "link-9"})))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = Arc::new(CountingTokens::default());
        let outcome = client(&server, tokens.clone())
            .link(LinkTarget::Directory, "u-1", "CN=jdoe,OU=Users")
            .await
            .unwrap();

        assert_eq!(outcome, LinkOutcome::Linked(json!({"_id": "link-9"})));
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_unauthorized_is_fatal_without_another_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .expect(2)
            .mount(&server)
            .await;

        let tokens = Arc::new(CountingTokens::default());
        let err = client(&server, tokens.clone())
            .link(LinkTarget::Federation, "u-1", "fed-42")
            .await
            .unwrap_err();

        assert!(matches!(err, LinkingError::Unauthorized { .. }));
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_failures_are_returned_as_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such user"))
            .mount(&server)
            .await;

        let tokens = Arc::new(CountingTokens::default());
        let outcome = client(&server, tokens.clone())
            .link(LinkTarget::Gateway, "missing", "uid=jdoe")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LinkOutcome::Failed(LinkingFailure::new(404, "no such user"))
        );
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unlink_requires_no_content() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/identity/users/u-1/links/federation-account"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/identity/users/u-2/links/federation-account"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let linking = client(&server, Arc::new(CountingTokens::default()));
        linking.unlink(LinkTarget::Federation, "u-1").await.unwrap();

        let err = linking
            .unlink(LinkTarget::Federation, "u-2")
            .await
            .unwrap_err();
        assert!(matches!(err, LinkingError::Conflict { status: 200, .. }));
    }

    #[tokio::test]
    async fn unsupported_operations_never_reach_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let linking = client(&server, Arc::new(CountingTokens::default()));
        let err = linking
            .unlink(LinkTarget::Gateway, "u-1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LinkingError::Unsupported(ColleagueOperation::Unlink(LinkTarget::Gateway))
        ));
    }

    #[test]
    fn capabilities_can_be_narrowed() {
        let caps = Capabilities::default().disable(ColleagueOperation::Link(LinkTarget::Gateway));
        assert_eq!(
            caps.support(ColleagueOperation::Link(LinkTarget::Gateway)),
            Support::Unsupported
        );
        assert_eq!(
            caps.support(ColleagueOperation::Link(LinkTarget::Directory)),
            Support::Supported
        );
        assert_eq!(
            caps.support(ColleagueOperation::Aggregate(crate::run_state::Domain::Legacy)),
            Support::Unsupported
        );
        assert_eq!(caps.as_map().len(), 7);
    }
}
