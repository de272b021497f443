use super::LinkingError;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use url::Url;

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns the cached token, acquiring one if none is cached yet.
    async fn token(&self) -> Result<String, LinkingError>;

    /// Discards the cached token and acquires a new one.
    async fn refresh(&self) -> Result<String, LinkingError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Client-credentials grant against the identity cloud's token endpoint.
///
/// The token has no tracked expiry. It is replaced only when a downstream
/// call is rejected with 401 or 403.
pub struct ClientCredentialsTokenProvider {
    http_client: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    cached_token: RwLock<Option<String>>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(
        http_client: reqwest::Client,
        token_url: Url,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    ) -> Self {
        Self {
            http_client,
            token_url,
            client_id,
            client_secret,
            scope,
            cached_token: RwLock::new(None),
        }
    }

    #[instrument(skip(self), fields(token_url = %self.token_url))]
    async fn acquire_token(&self) -> Result<String, LinkingError> {
        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(scope) = &self.scope {
            params.push(("scope", scope.as_str()));
        }

        let response = self
            .http_client
            .post(self.token_url.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| LinkingError::Token(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LinkingError::Token(format!(
                "token request failed with status {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| LinkingError::Token(format!("failed to parse token response: {e}")))?;

        debug!("acquired identity cloud token");
        Ok(token.access_token)
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsTokenProvider {
    async fn token(&self) -> Result<String, LinkingError> {
        {
            let cache = self.cached_token.read().await;
            if let Some(token) = cache.as_ref() {
                return Ok(token.clone());
            }
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String, LinkingError> {
        let token = self.acquire_token().await?;
        *self.cached_token.write().await = Some(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> ClientCredentialsTokenProvider {
        ClientCredentialsTokenProvider::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/oauth2/token", server.uri())).unwrap(),
            "aggregator".into(),
            "s3cret".into(),
            Some("fr:idm:*".into()),
        )
    }

    #[tokio::test]
    async fn token_is_cached_until_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=aggregator"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "t1", "expires_in": 899})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let tokens = provider(&server);
        assert_eq!(tokens.token().await.unwrap(), "t1");
        assert_eq!(tokens.token().await.unwrap(), "t1");
        assert_eq!(tokens.refresh().await.unwrap(), "t1");
    }

    #[tokio::test]
    async fn rejected_credentials_surface_as_token_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let err = provider(&server).token().await.unwrap_err();
        assert!(matches!(err, LinkingError::Token(msg) if msg.contains("invalid_client")));
    }
}
