use std::net::SocketAddr;

use bytes::Bytes;
use json_patch::{AddOperation, PatchOperation};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject,
};
use log::{debug, error, info, warn};
use serde_json::json;
use warp::{
    filters::BoxedFilter,
    http::StatusCode,
    reply::{self, Reply, Response},
    Filter,
};

use crate::Error;

const MAX_BODY_BYTES: u64 = 3 * 1024 * 1024;

pub const SPOT_TOLERATION_KEY: &str = "kubernetes.azure.com/scalesetpriority";

/// Admission endpoint. Any POST path is accepted, as the API server calls whatever
/// path the webhook registration names.
pub fn routes() -> BoxedFilter<(Response,)> {
    warp::post()
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .map(mutate_handler)
        .with(warp::log::log("webhook"))
        .map(Reply::into_response)
        .boxed()
}

pub fn health_routes() -> BoxedFilter<(Response,)> {
    warp::get()
        .and(warp::path!("healthz").or(warp::path!("readyz")).unify())
        .map(|| "ok".into_response())
        .boxed()
}

pub async fn run_health(bind: SocketAddr) {
    info!("health probes listening on {bind}");
    warp::serve(health_routes()).run(bind).await;
}

fn failure(status: StatusCode, message: String) -> Response {
    warn!("rejecting admission call ({status}): {message}");
    reply::with_status(message, status).into_response()
}

fn mutate_handler(body: Bytes) -> Response {
    if body.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "empty body".to_string());
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(x) => x,
        Err(e) => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("could not deserialize request: {e}"),
            )
        }
    };
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(x) => x,
        Err(e) => return failure(StatusCode::BAD_REQUEST, format!("invalid request: {e}")),
    };

    let res = match mutate(&req) {
        Ok(x) => x,
        Err(e) => {
            error!("failed to build admission response: {e}");
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("could not serialize response: {e}"),
            );
        }
    };
    match serde_json::to_vec(&res.into_review()) {
        Ok(body) => reply::with_header(body, "content-type", "application/json").into_response(),
        Err(e) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("could not serialize response: {e}"),
        ),
    }
}

/// Allows every request. Pods additionally get the spot toleration.
fn mutate(req: &AdmissionRequest<DynamicObject>) -> Result<AdmissionResponse, Error> {
    let res = AdmissionResponse::from(req);
    if req.kind.kind != "Pod" {
        debug!("allowing {:?} on {} {}", req.operation, req.kind.kind, req.name);
        return Ok(res);
    }

    info!(
        "adding spot toleration: {:?} on Pod {}/{}",
        req.operation,
        req.namespace.as_deref().unwrap_or_default(),
        req.name
    );
    Ok(res.with_patch(json_patch::Patch(vec![spot_toleration()]))?)
}

fn spot_toleration() -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: "/spec/tolerations".to_string(),
        value: json!([{
            "key": SPOT_TOLERATION_KEY,
            "operator": "Equal",
            "value": "spot",
            "effect": "NoSchedule",
        }]),
    })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::ByteString;
    use serde_json::Value;

    use super::*;

    fn review(kind: &str) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "12345",
                "kind": {"group": "", "version": "v1", "kind": kind},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "test-pod",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "v1",
                    "kind": kind,
                    "metadata": {"name": "test-pod"},
                },
            },
        })
    }

    async fn post(body: impl Into<Bytes>) -> warp::http::Response<Bytes> {
        let body: Bytes = body.into();
        warp::test::request()
            .method("POST")
            .path("/mutate")
            .body(body)
            .reply(&routes())
            .await
    }

    #[tokio::test]
    async fn test_empty_body() {
        let res = post(Bytes::new()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.body().as_ref(), b"empty body");
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let res = post(&b"\"empty body\""[..]).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = post(&b"{not json"[..]).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_review_without_request() {
        let body = json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"});
        let res = post(serde_json::to_vec(&body).unwrap()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_body() {
        let res = post(vec![b' '; MAX_BODY_BYTES as usize + 1]).await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let res = warp::test::request()
            .method("POST")
            .path("/mutate")
            .header("content-length", (MAX_BODY_BYTES + 1).to_string())
            .reply(&routes())
            .await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_pod_gets_toleration() {
        let res = post(serde_json::to_vec(&review("Pod")).unwrap()).await;
        assert_eq!(res.status(), StatusCode::OK);

        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["kind"], "AdmissionReview");
        assert_eq!(body["response"]["uid"], "12345");
        assert_eq!(body["response"]["allowed"], true);
        assert_eq!(body["response"]["patchType"], "JSONPatch");

        let patch: ByteString = serde_json::from_value(body["response"]["patch"].clone()).unwrap();
        let patch: Value = serde_json::from_slice(&patch.0).unwrap();
        assert_eq!(
            patch,
            json!([{
                "op": "add",
                "path": "/spec/tolerations",
                "value": [{
                    "key": "kubernetes.azure.com/scalesetpriority",
                    "operator": "Equal",
                    "value": "spot",
                    "effect": "NoSchedule",
                }],
            }])
        );
    }

    #[tokio::test]
    async fn test_other_kinds_pass_through() {
        let res = post(serde_json::to_vec(&review("ConfigMap")).unwrap()).await;
        assert_eq!(res.status(), StatusCode::OK);

        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["response"]["allowed"], true);
        assert!(body["response"]["patch"].is_null());
    }

    #[tokio::test]
    async fn test_any_post_path() {
        let res = warp::test::request()
            .method("POST")
            .path("/")
            .body(serde_json::to_vec(&review("Pod")).unwrap())
            .reply(&routes())
            .await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_routes() {
        for path in ["/healthz", "/readyz"] {
            let res = warp::test::request()
                .path(path)
                .reply(&health_routes())
                .await;
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(res.body().as_ref(), b"ok");
        }

        let res = warp::test::request()
            .path("/other")
            .reply(&health_routes())
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
