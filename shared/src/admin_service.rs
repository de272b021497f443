use crate::http::{AdminBody, make_boxed_error_response, make_json_response, make_text_response};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Liveness, readiness and a JSON status view for the admin listener.
///
/// `is_ready` is polled on every `/ready` request. `status` renders the body
/// of `/run-state`.
pub struct AdminService<R, S, E> {
    is_ready: R,
    status: S,
    _error: PhantomData<E>,
}

impl<R, S, E> AdminService<R, S, E>
where
    R: Fn() -> bool,
    S: Fn() -> serde_json::Value,
{
    pub fn new(is_ready: R, status: S) -> Self {
        Self {
            is_ready,
            status,
            _error: PhantomData,
        }
    }
}

impl<R, S, E> Service<Request<Incoming>> for AdminService<R, S, E>
where
    R: Fn() -> bool + Send + 'static,
    S: Fn() -> serde_json::Value + Send + 'static,
    E: Send + 'static,
{
    type Response = Response<AdminBody>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = route(req.method(), req.uri().path(), &self.is_ready, &self.status);
        Box::pin(async move { Ok(res) })
    }
}

fn route(
    method: &Method,
    path: &str,
    is_ready: &impl Fn() -> bool,
    status: &impl Fn() -> serde_json::Value,
) -> Response<AdminBody> {
    if method != Method::GET {
        return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    match path {
        "/health" => make_text_response(StatusCode::OK, "ok\n"),
        "/ready" => match is_ready() {
            true => make_text_response(StatusCode::OK, "ok\n"),
            false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        },
        "/run-state" => make_json_response(&status()),
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn status() -> serde_json::Value {
        serde_json::json!({"federation-saml:aggregation": false})
    }

    #[test]
    fn health_is_always_ok() {
        let res = route(&Method::GET, "/health", &|| false, &status);
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[test]
    fn ready_follows_readiness_check() {
        let res = route(&Method::GET, "/ready", &|| false, &status);
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        let res = route(&Method::GET, "/ready", &|| true, &status);
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn run_state_renders_status() {
        let res = route(&Method::GET, "/run-state", &|| true, &status);
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, status());
    }

    #[test]
    fn unknown_paths_and_methods() {
        let res = route(&Method::GET, "/nope", &|| true, &status);
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = route(&Method::POST, "/health", &|| true, &status);
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
