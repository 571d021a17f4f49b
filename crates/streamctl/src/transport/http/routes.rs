//! HTTP route handlers.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Form, Router,
    extract::{Path, Query, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};

use crate::compare::{CompareOptions, ListOrder};
use crate::registry::{RegistryError, StreamDescriptor, StreamKey, StreamKind, StreamQuery};
use crate::service::ControlPlaneService;

type Params = HashMap<String, String>;

/// Everything a handler can fail with. Rendered as `text/plain`.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("path: {path}\nsegment {position} ('{segment}'): {cause}")]
    BadSegment {
        path: String,
        position: usize,
        segment: String,
        cause: String,
    },
    #[error("path: {path}\n{cause}")]
    NotFound { path: String, cause: String },
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
}

impl RouteError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadSegment { .. } | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::debug!(%status, error = %self, "Request rejected");
        (status, format!("{self}\n")).into_response()
    }
}

/// Parse the path segment at 1-based `position`.
fn parse_segment<T>(uri: &Uri, position: usize, segment: &str) -> Result<T, RouteError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    segment.parse().map_err(|e: T::Err| RouteError::BadSegment {
        path: uri.path().to_string(),
        position,
        segment: segment.to_string(),
        cause: e.to_string(),
    })
}

/// `kind` and `id` sit at `first` and `first + 1`.
fn parse_key(uri: &Uri, first: usize, kind: &str, id: &str) -> Result<StreamKey, RouteError> {
    Ok(StreamKey {
        kind: parse_segment(uri, first, kind)?,
        stream_id: parse_segment(uri, first + 1, id)?,
    })
}

fn reject_unknown(params: &Params, allowed: &[&str]) -> Result<(), RouteError> {
    let mut unknown: Vec<&str> = params
        .keys()
        .map(String::as_str)
        .filter(|k| !allowed.contains(k))
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    unknown.sort_unstable();
    Err(RouteError::BadRequest(format!(
        "unexpected keys: {}",
        unknown.join(", ")
    )))
}

fn parse_param<T>(params: &Params, key: &str) -> Result<Option<T>, RouteError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    params
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| RouteError::BadRequest(format!("invalid {key} '{raw}': {e}")))
        })
        .transpose()
}

fn parse_flag(params: &Params, key: &str) -> Result<bool, RouteError> {
    match params.get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on" | "") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(RouteError::BadRequest(format!("invalid {key} '{v}'"))),
    }
}

async fn list_streams(
    State(service): State<Arc<ControlPlaneService>>,
    Query(params): Query<Params>,
) -> Result<Json<Vec<StreamDescriptor>>, RouteError> {
    reject_unknown(&params, &["streamID", "streamType", "httpPort"])?;
    let query = StreamQuery {
        stream_id: parse_param(&params, "streamID")?,
        kind: parse_param(&params, "streamType")?,
        http_port: parse_param(&params, "httpPort")?,
    };
    let streams = service.query(&query);
    tracing::debug!(?query, found = streams.len(), "List streams");
    Ok(Json(streams))
}

async fn list_kind(
    State(service): State<Arc<ControlPlaneService>>,
    uri: Uri,
    Path(kind): Path<String>,
) -> Result<Json<Vec<StreamDescriptor>>, RouteError> {
    let kind: StreamKind = parse_segment(&uri, 2, &kind)?;
    Ok(Json(service.query(&StreamQuery::by_kind(kind))))
}

async fn get_stream(
    State(service): State<Arc<ControlPlaneService>>,
    uri: Uri,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<StreamDescriptor>, RouteError> {
    let key = parse_key(&uri, 2, &kind, &id)?;
    service
        .registry()
        .get(key)
        .map(Json)
        .ok_or_else(|| RouteError::NotFound {
            path: uri.path().to_string(),
            cause: format!("stream {key} is not registered"),
        })
}

async fn add_stream(
    State(service): State<Arc<ControlPlaneService>>,
    Form(params): Form<Params>,
) -> Result<(StatusCode, Json<StreamDescriptor>), RouteError> {
    const REQUIRED: [&str; 3] = ["streamID", "httpPort", "streamType"];
    reject_unknown(&params, &REQUIRED)?;
    let missing: Vec<&str> = REQUIRED
        .into_iter()
        .filter(|k| !params.contains_key(*k))
        .collect();
    if !missing.is_empty() {
        return Err(RouteError::BadRequest(format!(
            "missing keys: {}",
            missing.join(", ")
        )));
    }

    let descriptor = StreamDescriptor::new(
        parse_param(&params, "streamID")?.unwrap_or_default(),
        parse_param(&params, "httpPort")?.unwrap_or_default(),
        parse_param(&params, "streamType")?.unwrap_or(StreamKind::Generator),
    );
    match service.register(descriptor.clone()) {
        Ok(()) => Ok((StatusCode::CREATED, Json(descriptor))),
        Err(e @ RegistryError::Duplicate(_)) => Err(RouteError::Conflict(e.to_string())),
        Err(e) => Err(RouteError::BadRequest(e.to_string())),
    }
}

async fn delete_stream(
    State(service): State<Arc<ControlPlaneService>>,
    uri: Uri,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<StreamDescriptor>, RouteError> {
    let key = parse_key(&uri, 3, &kind, &id)?;
    let not_found = |cause: String| RouteError::NotFound {
        path: uri.path().to_string(),
        cause,
    };

    let descriptor = service
        .registry()
        .get(key)
        .ok_or_else(|| not_found(format!("stream {key} is not registered")))?;
    // A concurrent delete may win between lookup and removal.
    service
        .deregister(&descriptor)
        .map_err(|e| not_found(e.to_string()))?;
    Ok(Json(descriptor))
}

async fn read_log(State(service): State<Arc<ControlPlaneService>>) -> String {
    service.render_log()
}

async fn append_log(
    State(service): State<Arc<ControlPlaneService>>,
    Form(params): Form<Params>,
) -> Result<StatusCode, RouteError> {
    let message = params
        .get("message")
        .ok_or_else(|| RouteError::BadRequest("missing keys: message".to_string()))?;
    service.append_log(message);
    Ok(StatusCode::NO_CONTENT)
}

async fn alert(
    State(service): State<Arc<ControlPlaneService>>,
    Form(params): Form<Params>,
) -> StatusCode {
    let title = params.get("title").map(String::as_str).unwrap_or("");
    let body = params.get("body").map(String::as_str).unwrap_or("");
    service.alert(title, body).await;
    StatusCode::NO_CONTENT
}

async fn compare(
    State(service): State<Arc<ControlPlaneService>>,
    Query(params): Query<Params>,
) -> Result<String, RouteError> {
    let options = CompareOptions {
        order: parse_param::<ListOrder>(&params, "listOrder")?.unwrap_or_default(),
        include_sync_source_id: parse_flag(&params, "includeSyncSourceID")?,
    };
    Ok(service.compare(&options).await)
}

async fn whois(
    State(service): State<Arc<ControlPlaneService>>,
    Query(params): Query<Params>,
) -> Result<Json<Vec<(String, String)>>, RouteError> {
    let mut ordered = BTreeMap::new();
    for (index, address) in params {
        let index: usize = index
            .parse()
            .map_err(|_| RouteError::BadRequest(format!("whois key '{index}' is not an index")))?;
        ordered.insert(index, address);
    }

    let mut names = Vec::with_capacity(ordered.len());
    for address in ordered.into_values() {
        let name = service.whois_lookup(&address).await;
        names.push((address, name));
    }
    Ok(Json(names))
}

async fn unknown_path(uri: Uri) -> RouteError {
    RouteError::NotFound {
        path: uri.path().to_string(),
        cause: "no such endpoint".to_string(),
    }
}

async fn unsupported_method(method: Method, uri: Uri) -> RouteError {
    RouteError::NotFound {
        path: uri.path().to_string(),
        cause: format!("method {method} not supported"),
    }
}

pub fn routes(service: Arc<ControlPlaneService>) -> Router {
    Router::new()
        .route("/streams", get(list_streams))
        .route("/streams/add", post(add_stream))
        .route("/streams/delete/{kind}/{id}", delete(delete_stream))
        .route("/streams/{kind}", get(list_kind))
        .route("/streams/{kind}/{id}", get(get_stream))
        .route("/log", get(read_log).post(append_log))
        .route("/alert", post(alert))
        .route("/compare", get(compare))
        .route("/whois", get(whois))
        .fallback(unknown_path)
        .method_not_allowed_fallback(unsupported_method)
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whois::{CachedWhois, WhoisResolver};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    fn form(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn service() -> Arc<ControlPlaneService> {
        Arc::new(ControlPlaneService::headless())
    }

    #[tokio::test]
    async fn add_then_fetch_stream() {
        let service = service();
        let app = routes(service.clone());

        let response = app
            .clone()
            .oneshot(form("/streams/add", "streamID=4&httpPort=9104&streamType=receiver"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["streamID"], 4);
        assert_eq!(created["streamType"], "receiver");

        let response = app.oneshot(get_req("/streams/receiver/4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["httpPort"], 9104);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let service = service();
        let app = routes(service.clone());
        let body = "streamID=1&httpPort=9001&streamType=generator";

        let first = app.clone().oneshot(form("/streams/add", body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let second = app.oneshot(form("/streams/add", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert!(body_text(second).await.contains("already registered"));
        assert_eq!(service.registry().len(), 1);
    }

    #[tokio::test]
    async fn add_names_missing_and_unexpected_keys() {
        let app = routes(service());

        let response = app
            .clone()
            .oneshot(form("/streams/add", "streamID=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "missing keys: httpPort, streamType\n");

        let response = app
            .oneshot(form(
                "/streams/add",
                "streamID=1&httpPort=1&streamType=receiver&color=red",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "unexpected keys: color\n");
    }

    #[tokio::test]
    async fn list_filters() {
        let service = service();
        service
            .register(StreamDescriptor::new(1, 9001, StreamKind::Generator))
            .unwrap();
        service
            .register(StreamDescriptor::new(1, 9002, StreamKind::Receiver))
            .unwrap();
        service
            .register(StreamDescriptor::new(2, 9003, StreamKind::Receiver))
            .unwrap();
        let app = routes(service);

        let all = body_json(app.clone().oneshot(get_req("/streams")).await.unwrap()).await;
        assert_eq!(all.as_array().unwrap().len(), 3);

        let by_id = body_json(
            app.clone()
                .oneshot(get_req("/streams?streamID=1"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(by_id.as_array().unwrap().len(), 2);

        let by_port = body_json(
            app.clone()
                .oneshot(get_req("/streams?httpPort=9003&streamID=1"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(by_port[0]["streamID"], 2);

        let receivers = body_json(app.clone().oneshot(get_req("/streams/receiver")).await.unwrap()).await;
        assert_eq!(receivers.as_array().unwrap().len(), 2);

        let bad = app.oneshot(get_req("/streams?owner=me")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bad_segment_reports_position() {
        let app = routes(service());

        let response = app
            .clone()
            .oneshot(get_req("/streams/transmitter/3"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"));
        let text = body_text(response).await;
        assert!(text.contains("path: /streams/transmitter/3"));
        assert!(text.contains("segment 2 ('transmitter')"));

        let response = app.oneshot(get_req("/streams/receiver/abc")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_text(response).await.contains("segment 3 ('abc')"));
    }

    #[tokio::test]
    async fn bad_segment_position_follows_route_shape() {
        let app = routes(service());

        // The id repeats a valid kind; it is still the third segment.
        let text = body_text(
            app.clone()
                .oneshot(get_req("/streams/receiver/receiver"))
                .await
                .unwrap(),
        )
        .await;
        assert!(text.contains("segment 3 ('receiver')"), "{text}");

        let text = body_text(
            app.clone()
                .oneshot(get_req("/streams/receiver/%61bc"))
                .await
                .unwrap(),
        )
        .await;
        assert!(text.contains("segment 3 ('abc')"), "{text}");

        let response = app
            .oneshot(
                Request::delete("/streams/delete/receiver/x1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_text(response).await.contains("segment 4 ('x1')"));
    }

    #[tokio::test]
    async fn wrong_method_is_diagnosed_as_not_found() {
        let app = routes(service());
        let requests = [
            Request::post("/streams").body(Body::empty()).unwrap(),
            get_req("/streams/add"),
            Request::put("/log").body(Body::empty()).unwrap(),
            get_req("/streams/delete/receiver/1"),
        ];

        for request in requests {
            let method = request.method().clone();
            let path = request.uri().path().to_string();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {path}");
            let text = body_text(response).await;
            assert!(text.contains(&format!("path: {path}")), "{text}");
            assert!(text.contains(&format!("method {method} not supported")), "{text}");
        }
    }

    #[tokio::test]
    async fn unknown_path_is_diagnosed() {
        let response = routes(service())
            .oneshot(get_req("/nope/nothing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_text(response).await.contains("path: /nope/nothing"));
    }

    #[tokio::test]
    async fn delete_removes_only_that_kind() {
        let service = service();
        let app = routes(service.clone());
        for kind in ["generator", "receiver"] {
            let body = format!("streamID=7&httpPort=9107&streamType={kind}");
            let response = app.clone().oneshot(form("/streams/add", &body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = app
            .clone()
            .oneshot(
                Request::delete("/streams/delete/generator/7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let remaining = body_json(app.clone().oneshot(get_req("/streams")).await.unwrap()).await;
        let remaining = remaining.as_array().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["streamType"], "receiver");

        let again = app
            .oneshot(
                Request::delete("/streams/delete/generator/7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn log_append_and_read() {
        let app = routes(service());

        let response = app
            .clone()
            .oneshot(form("/log", "message=stream+4+started"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let text = body_text(app.clone().oneshot(get_req("/log")).await.unwrap()).await;
        assert!(text.trim_end().ends_with("stream 4 started"));

        let missing = app.oneshot(form("/log", "msg=x")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn compare_renders_report() {
        let service = service();
        service
            .register(StreamDescriptor::new(3, 9003, StreamKind::Receiver))
            .unwrap();
        let app = routes(service);

        let response = app
            .clone()
            .oneshot(get_req("/compare?listOrder=port"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.starts_with("KIND"));
        assert!(text.contains("receiver"));

        let bad = app
            .oneshot(get_req("/compare?listOrder=sideways"))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    struct Echo;

    #[async_trait]
    impl WhoisResolver for Echo {
        async fn resolve(&self, address: &str) -> Option<String> {
            Some(format!("host-{address}"))
        }
    }

    #[tokio::test]
    async fn whois_answers_in_index_order() {
        let service = Arc::new(
            ControlPlaneService::headless().with_whois(Arc::new(CachedWhois::new(Echo))),
        );
        let response = routes(service)
            .oneshot(get_req("/whois?1=10.0.0.2&0=10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!([["10.0.0.1", "host-10.0.0.1"], ["10.0.0.2", "host-10.0.0.2"]])
        );
    }
}
