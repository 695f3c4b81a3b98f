#![forbid(unsafe_code)]

use http::{Request, Response};
use k8s_openapi::api::core::v1::ConfigMap;
use kiln_core::ResourceVersion;
use kiln_observe::{ApiView, BackendView};
use kube::client::Body;
use kube::core::ApiResource;
use kube::Client;
use serde_json::json;

type Handle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

fn view(namespaced: bool) -> (ApiView, Handle) {
    let (svc, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(svc, "default");
    let resource = ApiResource::erase::<ConfigMap>(&());
    (ApiView::new("replica-0", client, resource, namespaced), handle)
}

/// Serve one request with `body`, returning the path it asked for.
async fn answer(mut handle: Handle, status: u16, body: serde_json::Value) -> String {
    let (req, send) = handle.next_request().await.expect("no request sent");
    let path = req.uri().path().to_string();
    let body = Body::from(serde_json::to_vec(&body).unwrap());
    send.send_response(Response::builder().status(status).body(body).unwrap());
    path
}

#[tokio::test]
async fn namespaced_key_is_read_in_its_own_namespace() {
    let (view, handle) = view(true);
    let server = tokio::spawn(answer(
        handle,
        200,
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "tok", "namespace": "auth", "resourceVersion": "12" }
        }),
    ));

    assert_eq!(view.current_version("auth/tok").await.unwrap(), ResourceVersion(12));
    assert_eq!(server.await.unwrap(), "/api/v1/namespaces/auth/configmaps/tok");
}

#[tokio::test]
async fn object_not_yet_visible_reads_as_version_zero() {
    let (view, handle) = view(true);
    let server = tokio::spawn(answer(
        handle,
        404,
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "configmaps \"tok\" not found",
            "reason": "NotFound",
            "code": 404
        }),
    ));

    assert_eq!(view.current_version("auth/tok").await.unwrap(), ResourceVersion(0));
    assert_eq!(server.await.unwrap(), "/api/v1/namespaces/auth/configmaps/tok");
}

#[tokio::test]
async fn key_scope_must_match_the_kind() {
    let (namespaced, _h1) = view(true);
    let err = namespaced.current_version("tok").await.unwrap_err();
    assert!(err.to_string().contains("no namespace"), "{err}");

    let (cluster, _h2) = view(false);
    let err = cluster.current_version("auth/tok").await.unwrap_err();
    assert!(err.to_string().contains("cluster-scoped"), "{err}");
}
