use super::LinkingClient;
use crate::errors::AppError;
use crate::mediator::{Colleague, ColleagueOperation, MediatorError};
use crate::metrics_defs::LINK_REQUESTS;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkPayload {
    user_id: String,
    correlation_id: Option<String>,
}

/// Serves link, unlink and account-insight operations.
pub struct LinkingColleague {
    client: Arc<LinkingClient>,
}

impl LinkingColleague {
    pub const NAME: &'static str = "identity-linking";

    pub fn new(client: Arc<LinkingClient>) -> Self {
        LinkingColleague { client }
    }

    pub fn operations() -> impl Iterator<Item = ColleagueOperation> + Clone {
        ColleagueOperation::all().into_iter().filter(|op| {
            matches!(
                op,
                ColleagueOperation::Link(_)
                    | ColleagueOperation::Unlink(_)
                    | ColleagueOperation::AccountInsights
            )
        })
    }
}

#[async_trait]
impl Colleague for LinkingColleague {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn handle(
        &self,
        operation: ColleagueOperation,
        payload: Value,
    ) -> Result<Option<Value>, AppError> {
        let result = self.dispatch(operation, payload).await;
        shared::counter!(
            LINK_REQUESTS,
            "operation" => operation.to_string(),
            "outcome" => outcome_label(&result)
        )
        .increment(1);
        result
    }
}

/// Outcome tag of a linking request: a failure envelope from the identity
/// cloud is "rejected", an error before or during the call is "error".
fn outcome_label(result: &Result<Option<Value>, AppError>) -> &'static str {
    match result {
        Ok(Some(value)) if value.get("containsError").is_some() => "rejected",
        Ok(_) => "success",
        Err(_) => "error",
    }
}

impl LinkingColleague {
    async fn dispatch(
        &self,
        operation: ColleagueOperation,
        payload: Value,
    ) -> Result<Option<Value>, AppError> {
        let invalid = |reason: String| MediatorError::InvalidPayload { operation, reason };

        match operation {
            ColleagueOperation::Link(target) => {
                let payload: LinkPayload =
                    serde_json::from_value(payload).map_err(|e| invalid(e.to_string()))?;
                let correlation_id = payload
                    .correlation_id
                    .ok_or_else(|| invalid("correlationId is required".into()))?;
                let outcome = self
                    .client
                    .link(target, &payload.user_id, &correlation_id)
                    .await?;
                let value =
                    serde_json::to_value(outcome).map_err(|e| invalid(e.to_string()))?;
                Ok(Some(value))
            }
            ColleagueOperation::Unlink(target) => {
                let payload: LinkPayload =
                    serde_json::from_value(payload).map_err(|e| invalid(e.to_string()))?;
                self.client.unlink(target, &payload.user_id).await?;
                Ok(Some(json!({"unlinked": true})))
            }
            other => {
                self.client.capabilities().require(other)?;
                // Supported operations are all matched above.
                Err(super::LinkingError::Unsupported(other).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linking::{Capabilities, LinkTarget, LinkingError, TokenSource};
    use crate::mediator::{Mediator, Provider};
    use url::Url;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedToken;

    #[async_trait]
    impl TokenSource for FixedToken {
        async fn token(&self) -> Result<String, LinkingError> {
            Ok("tok".into())
        }

        async fn refresh(&self) -> Result<String, LinkingError> {
            Ok("tok".into())
        }
    }

    fn mediator(server: &MockServer) -> Mediator {
        let client = LinkingClient::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/openidm", server.uri())).unwrap(),
            Arc::new(FixedToken),
            Capabilities::default(),
        );
        Mediator::builder()
            .keyed_all(
                LinkingColleague::operations(),
                Provider::singleton(LinkingColleague::new(Arc::new(client))),
            )
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn link_payload_reaches_the_identity_cloud() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/openidm/users/u-7/links/federation-account"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(json!({"correlationId": "fed-42"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_id": "link-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let result = mediator(&server)
            .notify(
                "api",
                ColleagueOperation::Link(LinkTarget::Federation),
                json!({"userId": "u-7", "correlationId": "fed-42"}),
            )
            .await;

        assert_eq!(outcome_label(&result), "success");
        assert_eq!(result.unwrap(), Some(json!({"_id": "link-1"})));
    }

    #[tokio::test]
    async fn link_without_correlation_id_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let result = mediator(&server)
            .notify(
                "api",
                ColleagueOperation::Link(LinkTarget::Directory),
                json!({"userId": "u-7"}),
            )
            .await;

        assert_eq!(outcome_label(&result), "error");
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            AppError::Mediator(MediatorError::InvalidPayload { .. })
        ));
        let response = axum::response::IntoResponse::into_response(err);
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejected_link_is_reported_as_a_failure_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such user"))
            .mount(&server)
            .await;

        let result = mediator(&server)
            .notify(
                "api",
                ColleagueOperation::Link(LinkTarget::Gateway),
                json!({"userId": "ghost", "correlationId": "uid=ghost"}),
            )
            .await;

        assert_eq!(outcome_label(&result), "rejected");
        assert_eq!(
            result.unwrap(),
            Some(json!({
                "containsError": true,
                "errorMessage": "no such user",
                "errorStatusCode": 404
            }))
        );
    }

    #[tokio::test]
    async fn unlink_answers_unlinked() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/openidm/users/u-7/links/directory-account"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let result = mediator(&server)
            .notify(
                "api",
                ColleagueOperation::Unlink(LinkTarget::Directory),
                json!({"userId": "u-7"}),
            )
            .await
            .unwrap();

        assert_eq!(result, Some(json!({"unlinked": true})));
    }

    #[tokio::test]
    async fn account_insights_is_unsupported() {
        let server = MockServer::start().await;
        let result = mediator(&server)
            .notify("api", ColleagueOperation::AccountInsights, json!({"userId": "u-7"}))
            .await;

        assert!(matches!(
            result,
            Err(AppError::Linking(LinkingError::Unsupported(
                ColleagueOperation::AccountInsights
            )))
        ));
    }
}
