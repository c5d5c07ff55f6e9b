//! The resolve endpoint.
//!
//! `GET /open_api/data/cache_through_test?id=<i64>` runs
//! [`MissCoordinator::resolve`] for `id` and answers with a JSON envelope:
//!
//! ```text
//! 200 {"code":0,"message":"success","data":{"id":42,"outcome":{"path":"fetched"}}}
//! 400 {"code":400,"message":"query parameter `id` must be an integer"}
//! 502 {"code":502,"message":"lookup for key 42 failed: ..."}
//! ```

use std::error::Error as _;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::coordinator::{Lookup, MissCoordinator, Outcome};
use crate::http::{Method, Request, Response, StatusCode};

/// Path served by [`handle`].
pub const RESOLVE_PATH: &str = "/open_api/data/cache_through_test";

/// JSON envelope returned by every endpoint response.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Payload of a successful resolve.
#[derive(Debug, Serialize)]
pub struct Resolved {
    pub id: i64,
    pub outcome: Outcome,
}

impl Envelope<Resolved> {
    fn success(id: i64, outcome: Outcome) -> Self {
        Self {
            code: 0,
            message: "success".to_owned(),
            data: Some(Resolved { id, outcome }),
        }
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let envelope: Envelope<()> = Envelope {
        code: status.as_u16(),
        message: message.into(),
        data: None,
    };
    Response::json(status, &envelope)
}

/// Routes one request against `coordinator`.
pub async fn handle<L: Lookup>(coordinator: &MissCoordinator<L>, request: Request) -> Response {
    if request.path() != RESOLVE_PATH {
        return failure(StatusCode::NotFound, format!("no route for {}", request.path()));
    }
    if request.method() != &Method::Get {
        return failure(
            StatusCode::MethodNotAllowed,
            format!("{} is not allowed on {RESOLVE_PATH}", request.method()),
        );
    }

    let id = match request.query_param("id").map(str::parse::<i64>) {
        Some(Ok(id)) => id,
        Some(Err(_)) => {
            return failure(StatusCode::BadRequest, "query parameter `id` must be an integer");
        }
        None => return failure(StatusCode::BadRequest, "missing query parameter `id`"),
    };

    info!(id, "receive");
    let start = Instant::now();

    match coordinator.resolve(id).await {
        Ok(outcome) => {
            info!(id, ?outcome, elapsed = ?start.elapsed(), "resolved");
            Response::json(StatusCode::Ok, &Envelope::success(id, outcome))
        }
        Err(e) => {
            let message = match e.source() {
                Some(source) => format!("{e}: {source}"),
                None => e.to_string(),
            };
            warn!(id, error = %message, "resolve failed");
            failure(StatusCode::BadGateway, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;

    use super::*;
    use crate::config::StampedeConfig;
    use crate::coordinator::BackingStoreError;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn body_json(response: &Response) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    fn ok_coordinator() -> (MissCoordinator<impl Lookup>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let lookup = move |_key: i64| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BackingStoreError>(())
            }
        };
        let coordinator = MissCoordinator::from_config(&StampedeConfig::default(), lookup).unwrap();
        (coordinator, calls)
    }

    #[tokio::test]
    async fn resolves_id() {
        let (coordinator, calls) = ok_coordinator();
        let req = request("GET /open_api/data/cache_through_test?id=42 HTTP/1.1\r\n\r\n");

        let response = handle(&coordinator, req).await;
        assert_eq!(response.status(), StatusCode::Ok);

        let body = body_json(&response);
        assert_eq!(body["code"], 0);
        assert_eq!(body["message"], "success");
        assert_eq!(body["data"]["id"], 42);
        assert_eq!(body["data"]["outcome"]["path"], "fetched");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeat_request_uses_cache() {
        let (coordinator, calls) = ok_coordinator();
        let raw = "GET /open_api/data/cache_through_test?id=1 HTTP/1.1\r\n\r\n";

        handle(&coordinator, request(raw)).await;
        let response = handle(&coordinator, request(raw)).await;

        assert_eq!(body_json(&response)["data"]["outcome"]["path"], "cache_hit");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_id_is_bad_request() {
        let (coordinator, _) = ok_coordinator();
        let response = handle(
            &coordinator,
            request("GET /open_api/data/cache_through_test HTTP/1.1\r\n\r\n"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BadRequest);
        assert_eq!(body_json(&response)["code"], 400);
    }

    #[tokio::test]
    async fn non_numeric_id_is_bad_request() {
        let (coordinator, calls) = ok_coordinator();
        let response = handle(
            &coordinator,
            request("GET /open_api/data/cache_through_test?id=abc HTTP/1.1\r\n\r\n"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BadRequest);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (coordinator, _) = ok_coordinator();
        let response = handle(&coordinator, request("GET /health HTTP/1.1\r\n\r\n")).await;
        assert_eq!(response.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn post_is_not_allowed() {
        let (coordinator, _) = ok_coordinator();
        let response = handle(
            &coordinator,
            request("POST /open_api/data/cache_through_test?id=1 HTTP/1.1\r\n\r\n"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::MethodNotAllowed);
    }

    #[tokio::test]
    async fn lookup_failure_is_bad_gateway() {
        let lookup = |_key: i64| async { Err::<(), _>(BackingStoreError::new("db unavailable")) };
        let coordinator = MissCoordinator::from_config(&StampedeConfig::default(), lookup).unwrap();

        let response = handle(
            &coordinator,
            request("GET /open_api/data/cache_through_test?id=3 HTTP/1.1\r\n\r\n"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BadGateway);
        let message = body_json(&response)["message"].as_str().unwrap().to_owned();
        assert!(message.contains("db unavailable"));
        assert!(coordinator.cache().is_empty());
    }
}
