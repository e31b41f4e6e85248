use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use reqwest::Url;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const LISTING_PATH: &str = "/api/v1/files/";
const METADATA_SEGMENT: &str = "metadata";

/// One request observed by the mock platform.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub authorization: Option<String>,
    pub as_user: Option<String>,
    pub content_type: Option<String>,
    pub body: Value,
}

/// Scripted state shared by the listing and storage halves of the mock.
#[derive(Clone, Default)]
pub struct MockPlatform {
    inner: Arc<Mutex<PlatformState>>,
}

#[derive(Default)]
struct PlatformState {
    pages: HashMap<String, Vec<Vec<(String, String)>>>,
    failing_listings: HashSet<String>,
    users: Vec<(String, String)>,
    forbidden_files: HashSet<String>,
    flaky_files: HashMap<String, usize>,
    labels: HashMap<String, String>,
    calls: Vec<RecordedCall>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the listing pages of `policy_id`; each entry is `(file_id, owner)`.
    pub fn with_policy(self, policy_id: &str, pages: Vec<Vec<(&str, &str)>>) -> Self {
        let pages = pages
            .into_iter()
            .map(|page| {
                page.into_iter()
                    .map(|(file, owner)| (file.to_owned(), owner.to_owned()))
                    .collect()
            })
            .collect();
        self.state().pages.insert(policy_id.to_owned(), pages);
        self
    }

    pub fn failing_listing(self, policy_id: &str) -> Self {
        self.state().failing_listings.insert(policy_id.to_owned());
        self
    }

    /// Directory users, listed by lookups in the order they were added.
    pub fn with_user(self, login: &str, user_id: &str) -> Self {
        self.state()
            .users
            .push((login.to_owned(), user_id.to_owned()));
        self
    }

    pub fn forbidden_file(self, file_id: &str) -> Self {
        self.state().forbidden_files.insert(file_id.to_owned());
        self
    }

    /// Label writes on `file_id` answer 503 `failures` times.
    pub fn flaky_file(self, file_id: &str, failures: usize) -> Self {
        self.state().flaky_files.insert(file_id.to_owned(), failures);
        self
    }

    /// Pre-existing classification, so a create answers 409.
    pub fn labelled_file(self, file_id: &str, label: &str) -> Self {
        self.state()
            .labels
            .insert(file_id.to_owned(), label.to_owned());
        self
    }

    pub fn label_of(&self, file_id: &str) -> Option<String> {
        self.state().labels.get(file_id).cloned()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn calls_to(&self, method: Method, prefix: &str) -> Vec<RecordedCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.method == method && call.path.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn listing_offsets(&self, policy_id: &str) -> Vec<u64> {
        self.calls_to(Method::POST, LISTING_PATH)
            .into_iter()
            .filter(|call| listing_policy(&call.body).as_deref() == Some(policy_id))
            .filter_map(|call| call.query.get("skip").and_then(|skip| skip.parse().ok()))
            .collect()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PlatformState> {
        self.inner.lock().expect("mock platform poisoned")
    }

    fn handle(&self, call: RecordedCall) -> (StatusCode, Value) {
        let mut state = self.state();
        state.calls.push(call.clone());

        if call.method == Method::POST && call.path == LISTING_PATH {
            return state.list_files(&call);
        }
        if call.method == Method::GET && call.path == "/users" {
            return state.find_user(&call);
        }

        let segments: Vec<&str> = call.path.trim_start_matches('/').split('/').collect();
        match (call.method.clone(), segments.as_slice()) {
            (Method::GET, ["files", file_id]) => state.get_file(file_id),
            (Method::POST, ["files", file_id, METADATA_SEGMENT, "enterprise", _]) => {
                state.create_label(file_id, &call.body)
            }
            (Method::PUT, ["files", file_id, METADATA_SEGMENT, "enterprise", _]) => {
                state.update_label(file_id, &call)
            }
            _ => (
                StatusCode::NOT_FOUND,
                json!({ "message": format!("no route for {} {}", call.method, call.path) }),
            ),
        }
    }
}

impl PlatformState {
    fn list_files(&self, call: &RecordedCall) -> (StatusCode, Value) {
        let Some(policy_id) = listing_policy(&call.body) else {
            return (StatusCode::BAD_REQUEST, json!({ "error": "missing policy filter" }));
        };
        if self.failing_listings.contains(&policy_id) {
            return (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "listing unavailable" }));
        }

        let skip: usize = call
            .query
            .get("skip")
            .and_then(|skip| skip.parse().ok())
            .unwrap_or(0);
        let pages = self.pages.get(&policy_id).cloned().unwrap_or_default();
        let data: Vec<Value> = pages
            .get(skip)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|(file_id, owner)| {
                json!({
                    "id": format!("evt-{file_id}"),
                    "boxItem": { "id": file_id, "owned_by": { "login": owner } },
                })
            })
            .collect();

        (
            StatusCode::OK,
            json!({ "hasNext": skip + 1 < pages.len(), "data": data }),
        )
    }

    fn find_user(&self, call: &RecordedCall) -> (StatusCode, Value) {
        let term = call
            .query
            .get("filter_term")
            .map(|term| term.to_ascii_lowercase())
            .unwrap_or_default();
        let limit: usize = call
            .query
            .get("limit")
            .and_then(|limit| limit.parse().ok())
            .unwrap_or(100);
        let entries: Vec<Value> = self
            .users
            .iter()
            .filter(|(login, _)| login.to_ascii_lowercase().starts_with(&term))
            .take(limit)
            .map(|(login, id)| json!({ "type": "user", "id": id, "login": login }))
            .collect();
        (StatusCode::OK, json!({ "total_count": entries.len(), "entries": entries }))
    }

    fn get_file(&self, file_id: &str) -> (StatusCode, Value) {
        if self.forbidden_files.contains(file_id) {
            return (
                StatusCode::FORBIDDEN,
                json!({ "code": "access_denied_insufficient_permissions" }),
            );
        }
        (
            StatusCode::OK,
            json!({ "type": "file", "id": file_id, "name": format!("{file_id}.pdf") }),
        )
    }

    fn create_label(&mut self, file_id: &str, body: &Value) -> (StatusCode, Value) {
        if let Some(remaining) = self.flaky_files.get_mut(file_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return (StatusCode::SERVICE_UNAVAILABLE, json!({ "code": "unavailable" }));
            }
        }
        if self.labels.contains_key(file_id) {
            return (StatusCode::CONFLICT, json!({ "code": "tuple_already_exists" }));
        }

        let Some(label) = body
            .as_object()
            .and_then(|fields| fields.values().next())
            .and_then(Value::as_str)
        else {
            return (StatusCode::BAD_REQUEST, json!({ "code": "bad_request" }));
        };
        self.labels.insert(file_id.to_owned(), label.to_owned());
        (StatusCode::CREATED, body.clone())
    }

    fn update_label(&mut self, file_id: &str, call: &RecordedCall) -> (StatusCode, Value) {
        let Some(label) = call
            .body
            .as_array()
            .and_then(|ops| ops.first())
            .and_then(|op| op.get("value"))
            .and_then(Value::as_str)
        else {
            return (StatusCode::BAD_REQUEST, json!({ "code": "bad_request" }));
        };
        self.labels.insert(file_id.to_owned(), label.to_owned());
        (StatusCode::OK, json!({ "label": label }))
    }
}

fn listing_policy(body: &Value) -> Option<String> {
    body.pointer("/filters/policy/cabinetmatchedrulesequals/0")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

pub struct MockPlatformServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockPlatformServer {
    pub async fn start(platform: MockPlatform) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock platform listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let platform = platform.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| serve_request(platform.clone(), req)))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock platform server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(
    platform: MockPlatform,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let (parts, request_body) = req.into_parts();
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };

    let bytes = match body::to_bytes(request_body).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("failed to read body: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                let mut response =
                    Response::new(Body::from(format!("invalid JSON payload: {err}")));
                *response.status_mut() = StatusCode::BAD_REQUEST;
                return Ok(response);
            }
        }
    };

    let query = Url::parse(&format!("http://mock{}", parts.uri))
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default();

    let call = RecordedCall {
        method: parts.method.clone(),
        path: parts.uri.path().to_owned(),
        query,
        authorization: header("authorization"),
        as_user: header("as-user"),
        content_type: header("content-type"),
        body,
    };

    let (status, payload) = platform.handle(call);
    let mut response = Response::new(Body::from(payload.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}
