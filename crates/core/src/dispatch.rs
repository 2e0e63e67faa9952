use crate::builders::{ShouldServeOptions, StartDevServerOptions};
use crate::engine::{log_build_failure, BuildExecutor, BuildMatchTable};
use crate::routes::{RouteRequest, RouteResult, RouteTable};
use crate::runtime::{FunctionRuntime, LOCAL_REGION, REGION_VAR};
use crate::store::{normalize, ArtifactStore, ServedArtifact};
use crate::types::{Artifact, InvokePayload};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use http::{Request, Response, StatusCode};
use hyper::body::Bytes;
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const NOT_FOUND_BODY: &str = "The page could not be found\n\nNOT_FOUND\n";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Content type for a served path, from its extension. Text types are
/// served as UTF-8.
pub fn guess_content_type(path: &str) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let essence = mime.essence_str();
    if mime.type_().as_str() == "text" || essence == "application/javascript" {
        format!("{essence}; charset=utf-8")
    } else {
        essence.to_string()
    }
}

/// What the fallback found for a path the store does not serve.
#[derive(Debug)]
pub enum FallbackTarget {
    Artifact(Arc<ServedArtifact>),
    DevServer(u16),
    Failed(String),
}

/// Serves paths that no published artifact covers, such as entrypoints a
/// builder only builds on demand.
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn find(&self, path: &str) -> Option<FallbackTarget>;
}

/// Asks builders that declare `shouldServe` whether they own a path.
///
/// Builders that also declare `startDevServer` get a long-running server
/// started once per entrypoint; others are built on demand.
pub struct BuildFallback {
    table: Arc<BuildMatchTable>,
    executor: Arc<BuildExecutor>,
    env: BTreeMap<String, String>,
}

impl BuildFallback {
    pub fn new(
        table: Arc<BuildMatchTable>,
        executor: Arc<BuildExecutor>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            table,
            executor,
            env,
        }
    }
}

#[async_trait]
impl Fallback for BuildFallback {
    async fn find(&self, path: &str) -> Option<FallbackTarget> {
        for m in self.table.matches() {
            let caps = m.builder.capabilities();
            if !caps.should_serve {
                continue;
            }
            let work_path = {
                let state = m.state().lock().await;
                state.work_path.clone()
            }
            .unwrap_or_else(|| self.executor.cache_root().join("workPaths"));
            let wants = m
                .builder
                .builder
                .should_serve(ShouldServeOptions {
                    entrypoint: m.entrypoint.clone(),
                    request_path: path.to_string(),
                    work_path: work_path.clone(),
                    config: m.effective_config(),
                })
                .await;
            match wants {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    debug!("shouldServe of {} failed: {err}", m.entrypoint);
                    continue;
                }
            }

            if caps.start_dev_server {
                let mut state = m.state().lock().await;
                state.dev_servers.retain_mut(|server| server.is_running());
                if let Some(server) = state.dev_servers.first() {
                    return Some(FallbackTarget::DevServer(server.port));
                }
                let mut env = self.env.clone();
                env.insert(REGION_VAR.to_string(), LOCAL_REGION.to_string());
                let started = m
                    .builder
                    .builder
                    .start_dev_server(StartDevServerOptions {
                        entrypoint: m.entrypoint.clone(),
                        work_path,
                        config: m.effective_config(),
                        env,
                    })
                    .await;
                return Some(match started {
                    Ok(server) => {
                        let port = server.port;
                        state.dev_servers.push(server);
                        FallbackTarget::DevServer(port)
                    }
                    Err(err) => {
                        warn!("dev server for {} failed to start: {err}", m.entrypoint);
                        FallbackTarget::Failed(err.to_string())
                    }
                });
            }

            if let Err(err) = self.executor.build(&m).await {
                log_build_failure(&m.entrypoint, &err);
                return Some(FallbackTarget::Failed(err.to_string()));
            }
            if let Some(served) = self.executor.store().snapshot().get(normalize(path)) {
                return Some(FallbackTarget::Artifact(served.clone()));
            }
        }
        None
    }
}

/// Turns requests into responses using the route table and the store.
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    store: Arc<ArtifactStore>,
    runtime: Arc<dyn FunctionRuntime>,
    fallback: Option<Arc<dyn Fallback>>,
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        routes: Arc<RouteTable>,
        store: Arc<ArtifactStore>,
        runtime: Arc<dyn FunctionRuntime>,
    ) -> Self {
        Self {
            routes,
            store,
            runtime,
            fallback: None,
            client: reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Fallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub async fn dispatch(&self, req: Request<Bytes>) -> Response<Bytes> {
        let path = percent_decode_str(req.uri().path())
            .decode_utf8_lossy()
            .into_owned();
        let route_req = RouteRequest::new(req.method().as_str(), &path, req.uri().query());
        let snapshot = self.store.snapshot();
        let result = self
            .routes
            .resolve(&route_req, |p| snapshot.contains_key(normalize(p)));
        debug!(
            "{} {} -> {} (matched={}, fs={}, rule={:?})",
            req.method(),
            path,
            result.destination_path,
            result.matched,
            result.filesystem_hit,
            result.matched_rule
        );

        if result.is_external {
            let mut url = result.destination_path.clone();
            if !url.contains('?') {
                if let Some(query) = req.uri().query() {
                    url.push('?');
                    url.push_str(query);
                }
            }
            return self.proxy(&req, &url, &result.headers).await;
        }

        if let Some(served) = snapshot.get(normalize(&result.destination_path)) {
            return self.serve_artifact(&req, served, &result).await;
        }

        if let Some(fallback) = &self.fallback {
            match fallback.find(&result.destination_path).await {
                Some(FallbackTarget::Artifact(served)) => {
                    return self.serve_artifact(&req, &served, &result).await;
                }
                Some(FallbackTarget::DevServer(port)) => {
                    let mut url = format!("http://127.0.0.1:{port}{}", result.destination_path);
                    let query = result.query_string();
                    if !query.is_empty() {
                        url.push('?');
                        url.push_str(&query);
                    }
                    return self.proxy(&req, &url, &result.headers).await;
                }
                Some(FallbackTarget::Failed(message)) => {
                    return respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &result.headers,
                        Some("text/plain; charset=utf-8"),
                        Bytes::from(format!("{message}\n")),
                    );
                }
                None => {}
            }
        }

        if result.matched {
            if let Some(status) = result.status.and_then(|s| StatusCode::from_u16(s).ok()) {
                return respond(status, &result.headers, None, Bytes::new());
            }
        }

        respond(
            StatusCode::NOT_FOUND,
            &result.headers,
            Some("text/plain; charset=utf-8"),
            Bytes::from_static(NOT_FOUND_BODY.as_bytes()),
        )
    }

    async fn serve_artifact(
        &self,
        req: &Request<Bytes>,
        served: &ServedArtifact,
        result: &RouteResult,
    ) -> Response<Bytes> {
        match &served.artifact {
            Artifact::Static(file) => {
                let body = match file.content.read().await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        error!("could not read {}: {err}", result.destination_path);
                        return internal_error(&result.headers);
                    }
                };
                let status = result
                    .status
                    .and_then(|s| StatusCode::from_u16(s).ok())
                    .unwrap_or(StatusCode::OK);
                let content_type = file
                    .content_type
                    .clone()
                    .unwrap_or_else(|| guess_content_type(&result.destination_path));
                let body = if req.method() == http::Method::HEAD {
                    Bytes::new()
                } else {
                    Bytes::from(body)
                };
                respond(status, &result.headers, Some(content_type.as_str()), body)
            }
            Artifact::Function(_) => {
                let Some(handle) = &served.runtime else {
                    error!("function at {} has no runtime", result.destination_path);
                    return internal_error(&result.headers);
                };
                let payload = invoke_payload(req, result);
                match self.runtime.invoke(handle, &payload).await {
                    Ok(out) => {
                        let status = StatusCode::from_u16(out.status_code)
                            .unwrap_or(StatusCode::BAD_GATEWAY);
                        let body = match (out.encoding.as_deref(), out.body) {
                            (Some("base64"), Some(body)) => match BASE64.decode(body.as_bytes()) {
                                Ok(bytes) => Bytes::from(bytes),
                                Err(err) => {
                                    error!("function returned bad base64 body: {err}");
                                    return internal_error(&result.headers);
                                }
                            },
                            (_, Some(body)) => Bytes::from(body),
                            (_, None) => Bytes::new(),
                        };
                        let mut headers = result.headers.clone();
                        for (k, v) in out.headers {
                            headers.insert(k.to_ascii_lowercase(), v);
                        }
                        respond(status, &headers, None, body)
                    }
                    Err(err) => {
                        error!("{} {}: {err}", req.method(), result.destination_path);
                        internal_error(&result.headers)
                    }
                }
            }
        }
    }

    async fn proxy(
        &self,
        req: &Request<Bytes>,
        url: &str,
        extra: &BTreeMap<String, String>,
    ) -> Response<Bytes> {
        let mut outbound = self.client.request(req.method().clone(), url);
        for (name, value) in req.headers() {
            if name == HOST || HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            outbound = outbound.header(name, value);
        }
        let upstream = match outbound.body(req.body().clone()).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!("proxy to {url} failed: {err}");
                return respond(StatusCode::BAD_GATEWAY, extra, None, Bytes::new());
            }
        };

        let status = upstream.status();
        let mut builder = Response::builder().status(status);
        for (name, value) in upstream.headers() {
            if !HOP_BY_HOP.contains(&name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(err) => {
                warn!("reading proxied body from {url} failed: {err}");
                return respond(StatusCode::BAD_GATEWAY, extra, None, Bytes::new());
            }
        };
        let mut response = match builder.body(body) {
            Ok(response) => response,
            Err(err) => {
                warn!("bad proxied response from {url}: {err}");
                return respond(StatusCode::BAD_GATEWAY, extra, None, Bytes::new());
            }
        };
        apply_headers(response.headers_mut(), extra);
        response
    }
}

fn invoke_payload(req: &Request<Bytes>, result: &RouteResult) -> InvokePayload {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in req.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    let query = result.query_string();
    let path = if query.is_empty() {
        result.destination_path.clone()
    } else {
        format!("{}?{query}", result.destination_path)
    };
    let (encoding, body) = if req.body().is_empty() {
        (None, None)
    } else {
        (Some("base64".to_string()), Some(BASE64.encode(req.body())))
    };
    InvokePayload {
        method: req.method().as_str().to_string(),
        host: headers.get(HOST.as_str()).cloned(),
        path,
        headers,
        encoding,
        body,
    }
}

fn apply_headers(target: &mut http::HeaderMap, headers: &BTreeMap<String, String>) {
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                target.insert(name, value);
            }
            _ => warn!("dropping invalid response header {name}: {value:?}"),
        }
    }
}

fn respond(
    status: StatusCode,
    headers: &BTreeMap<String, String>,
    content_type: Option<&str>,
    body: Bytes,
) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    if let Some(ct) = content_type.and_then(|ct| HeaderValue::from_str(ct).ok()) {
        response.headers_mut().insert(CONTENT_TYPE, ct);
    }
    apply_headers(response.headers_mut(), headers);
    response
}

fn internal_error(headers: &BTreeMap<String, String>) -> Response<Bytes> {
    respond(
        StatusCode::INTERNAL_SERVER_ERROR,
        headers,
        Some("text/plain; charset=utf-8"),
        Bytes::from_static(b"Internal Server Error\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder_cache::BuilderCache;
    use crate::files::collect_project_files;
    use crate::ignore::IgnoreSet;
    use crate::project::BuildSpec;
    use crate::store::MatchId;
    use crate::testing::{function, project, static_bytes, FnBuilder, MapInstaller, MockRuntime};
    use crate::types::{BuilderOutputs, StaticFile};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Harness {
        store: Arc<ArtifactStore>,
        runtime: Arc<MockRuntime>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(ArtifactStore::new()),
                runtime: Arc::new(MockRuntime::default()),
            }
        }

        async fn publish(&self, origin: MatchId, path: &str, artifact: Artifact) {
            let runtime = match &artifact {
                Artifact::Function(f) => Some(
                    self.runtime
                        .create(f, &BTreeMap::new())
                        .await
                        .expect("create"),
                ),
                Artifact::Static(_) => None,
            };
            self.store.swap(
                origin,
                [(
                    path.to_string(),
                    ServedArtifact {
                        artifact,
                        origin,
                        runtime,
                        serial: 1,
                    },
                )],
            );
        }

        fn dispatcher(&self, routes: Value) -> Dispatcher {
            let routes = RouteTable::compile(routes.as_array().expect("array")).expect("routes");
            Dispatcher::new(Arc::new(routes), self.store.clone(), self.runtime.clone())
        }
    }

    fn request(method: &str, uri: &str, body: &'static [u8]) -> Request<Bytes> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, "localhost:3000")
            .body(Bytes::from_static(body))
            .expect("request")
    }

    fn text(resp: &Response<Bytes>) -> String {
        String::from_utf8_lossy(resp.body()).into_owned()
    }

    #[tokio::test]
    async fn serves_static_files_with_rule_headers() {
        let h = Harness::new();
        h.publish(1, "index.html", static_bytes("<h1>home</h1>")).await;
        let d = h.dispatcher(json!([
            {"handle": "header"},
            {"src": "/(.*)", "headers": {"x-served-by": "devhost"}, "continue": true},
            {"handle": "filesystem"},
            {"src": "/", "dest": "/index.html"}
        ]));

        let resp = d.dispatch(request("GET", "/", b"")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/html; charset=utf-8");
        assert_eq!(resp.headers()["x-served-by"], "devhost");
        assert_eq!(text(&resp), "<h1>home</h1>");

        let head = d.dispatch(request("HEAD", "/index.html", b"")).await;
        assert_eq!(head.status(), StatusCode::OK);
        assert!(head.body().is_empty());
    }

    #[tokio::test]
    async fn explicit_content_type_and_status_override() {
        let h = Harness::new();
        h.publish(1, "404.html", Artifact::Static(StaticFile::from_bytes("gone", Some("text/x-custom"))))
            .await;
        let d = h.dispatcher(json!([{"handle": "error"}, {"src": "/.*", "dest": "/404.html", "status": 404}]));
        let resp = d.dispatch(request("GET", "/nowhere", b"")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/x-custom");
        assert_eq!(text(&resp), "gone");
    }

    #[tokio::test]
    async fn percent_encoded_paths_are_decoded() {
        let h = Harness::new();
        h.publish(1, "my file.txt", static_bytes("spaced")).await;
        let d = h.dispatcher(json!([]));
        let resp = d.dispatch(request("GET", "/my%20file.txt", b"")).await;
        assert_eq!(text(&resp), "spaced");
    }

    #[tokio::test]
    async fn functions_are_invoked_with_the_request() {
        let h = Harness::new();
        h.publish(1, "api/hello", function("hello", 10)).await;
        let d = h.dispatcher(json!([{"src": "/hello", "dest": "/api/hello?from=rule", "headers": {"x-rule": "1"}}]));

        let resp = d.dispatch(request("GET", "/hello?x=1", b"")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-handler"], "hello");
        assert_eq!(resp.headers()["x-rule"], "1");
        assert_eq!(text(&resp), "hello GET /api/hello?from=rule&x=1");
    }

    #[tokio::test]
    async fn binary_request_bodies_round_trip_as_base64() {
        let h = Harness::new();
        h.publish(1, "api/echo", function("echo", 10)).await;
        let d = h.dispatcher(json!([]));
        let resp = d.dispatch(request("POST", "/api/echo", b"\x00\xffbinary")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().as_ref(), b"\x00\xffbinary");
    }

    #[tokio::test]
    async fn invocation_failures_become_500() {
        let h = Harness::new();
        h.publish(1, "api/boom", function("crash", 10)).await;
        let d = h.dispatcher(json!([]));
        let resp = d.dispatch(request("GET", "/api/boom", b"")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let again = d.dispatch(request("GET", "/api/boom", b"")).await;
        assert_eq!(again.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn redirects_answer_with_status_and_headers_only() {
        let h = Harness::new();
        let d = h.dispatcher(json!([
            {"handle": "redirect"},
            {"src": "/old/(.*)", "status": 301, "headers": {"Location": "/new/$1"}}
        ]));
        let resp = d.dispatch(request("GET", "/old/page", b"")).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers()["location"], "/new/page");
        assert!(resp.body().is_empty());
    }

    #[tokio::test]
    async fn misses_are_404_with_accumulated_headers() {
        let h = Harness::new();
        let d = h.dispatcher(json!([
            {"src": "/(.*)", "headers": {"x-trace": "on"}, "continue": true}
        ]));
        let resp = d.dispatch(request("GET", "/nope", b"")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()["x-trace"], "on");
        assert_eq!(text(&resp), NOT_FOUND_BODY);
    }

    #[tokio::test]
    async fn unreachable_external_destinations_are_502() {
        let h = Harness::new();
        let d = h.dispatcher(json!([{"src": "/ext", "dest": "http://127.0.0.1:9/"}]));
        let resp = d.dispatch(request("GET", "/ext", b"")).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn content_types_follow_extensions() {
        assert_eq!(guess_content_type("a/b/style.CSS"), "text/css; charset=utf-8");
        assert_eq!(guess_content_type("api/hello"), "application/octet-stream");
        assert_eq!(guess_content_type("dir.v2/file"), "application/octet-stream");
        assert_eq!(guess_content_type("index.html"), "text/html; charset=utf-8");
    }

    #[test]
    fn content_types_cover_common_media_and_data_files() {
        assert_eq!(guess_content_type("data/report.csv"), "text/csv; charset=utf-8");
        assert_eq!(guess_content_type("media/intro.mp4"), "video/mp4");
        assert_eq!(guess_content_type("media/clip.webm"), "video/webm");
        assert_eq!(guess_content_type("module.wasm"), "application/wasm");
        assert_eq!(guess_content_type("dist/bundle.tar"), "application/x-tar");
    }

    async fn fallback_for(builder: FnBuilder) -> (tempfile::TempDir, Dispatcher, Arc<BuildMatchTable>) {
        let dir = project(&[("pages/lazy.page", "lazy")]);
        let cache = BuilderCache::new(Arc::new(MapInstaller::new().with("lazy", "1.0.0", builder)));
        let files = collect_project_files("**", dir.path(), &IgnoreSet::default()).expect("files");
        let builds = vec![BuildSpec {
            src: "pages/*.page".to_string(),
            builder: "lazy".to_string(),
            config: Default::default(),
        }];
        let table = Arc::new(
            BuildMatchTable::from_config(&builds, &files, &cache)
                .await
                .expect("table"),
        );
        let store = Arc::new(ArtifactStore::new());
        let runtime: Arc<MockRuntime> = Arc::new(MockRuntime::default());
        let executor = Arc::new(BuildExecutor::new(
            dir.path().to_path_buf(),
            dir.path().join(".cache"),
            IgnoreSet::default(),
            BTreeMap::new(),
            store.clone(),
            runtime.clone(),
        ));
        let fallback = Arc::new(BuildFallback::new(table.clone(), executor, BTreeMap::new()));
        let dispatcher = Dispatcher::new(Arc::new(RouteTable::default()), store, runtime)
            .with_fallback(fallback);
        (dir, dispatcher, table)
    }

    #[tokio::test]
    async fn should_serve_builders_build_on_demand() {
        let builder = FnBuilder::new(|_| {
            let mut out = BuilderOutputs::new();
            out.insert("lazy".to_string(), static_bytes("built on demand"));
            Ok(out)
        })
        .serving(|opts| opts.request_path == "/lazy");
        let (_dir, d, _table) = fallback_for(builder.clone()).await;

        let resp = d.dispatch(request("GET", "/lazy", b"")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(text(&resp), "built on demand");
        assert_eq!(builder.calls(), 1);

        let resp = d.dispatch(request("GET", "/lazy", b"")).await;
        assert_eq!(text(&resp), "built on demand");
        assert_eq!(builder.calls(), 1, "second request is served from the store");

        let miss = d.dispatch(request("GET", "/other", b"")).await;
        assert_eq!(miss.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dev_server_builders_are_proxied() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\nconnection: close\r\n\r\nfrom devsv")
                    .await;
            }
        });

        let builder = FnBuilder::empty()
            .serving(|opts| opts.request_path.starts_with("/app"))
            .with_dev_server(port);
        let (_dir, d, table) = fallback_for(builder).await;

        let resp = d.dispatch(request("GET", "/app/page", b"")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(text(&resp), "from devsv");

        let m = table.matches().remove(0);
        assert_eq!(m.state().lock().await.dev_servers.len(), 1);
        d.dispatch(request("GET", "/app/other", b"")).await;
        assert_eq!(m.state().lock().await.dev_servers.len(), 1);
    }
}
