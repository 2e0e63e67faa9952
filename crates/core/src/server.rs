use crate::builder_cache::{BuilderCache, BuilderInstaller};
use crate::dispatch::{BuildFallback, Dispatcher};
use crate::engine::{log_build_failure, BuildExecutor, BuildMatch, BuildMatchTable, BuildReport};
use crate::error::{DevError, Result};
use crate::ignore::resolve_ignores;
use crate::project::ProjectConfig;
use crate::routes::RouteTable;
use crate::store::MatchId;
use crate::runtime::FunctionRuntime;
use crate::types::{Artifact, DevConfig};
use crate::watch::{watch_project, FileChange};
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub port: u16,
    pub url: String,
    pub watching: bool,
    pub builds: usize,
    pub failed_builds: usize,
    pub artifacts: usize,
    pub functions: usize,
}

/// Per-entrypoint view for listings.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub entrypoint: String,
    pub builder: String,
    pub build_count: u64,
    pub outputs: Vec<String>,
    pub last_build: Option<SystemTime>,
    pub last_error: Option<String>,
}

/// A running dev session: builds, routes and serves one project.
pub struct DevSession {
    root: PathBuf,
    config: DevConfig,
    project: ProjectConfig,
    routes: Arc<RouteTable>,
    cache: Arc<BuilderCache>,
    table: Arc<BuildMatchTable>,
    executor: Arc<BuildExecutor>,
    dispatcher: Dispatcher,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Rebuilds started by file changes, by match.
    builds: Mutex<Vec<(MatchId, JoinHandle<()>)>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl DevSession {
    /// Loads the project, builds every entrypoint and starts watching.
    ///
    /// Invalid routes, project files or builders abort startup. Failed
    /// builds do not; they are logged and retried on the next change.
    pub async fn start(
        root: &Path,
        config: DevConfig,
        installer: Arc<dyn BuilderInstaller>,
        runtime: Arc<dyn FunctionRuntime>,
    ) -> Result<Arc<Self>> {
        let root = root.canonicalize().map_err(|e| DevError::fs(root, e))?;
        let ignores = resolve_ignores(&root)?;
        let project = ProjectConfig::load(&root, &config.project_file)?;
        let routes = Arc::new(RouteTable::compile(&project.routes)?);
        let cache = Arc::new(BuilderCache::new(installer));

        let executor = Arc::new(BuildExecutor::new(
            root.clone(),
            config.cache_root(&root),
            ignores.clone(),
            project.env.clone(),
            Arc::new(crate::store::ArtifactStore::new()),
            runtime.clone(),
        ));
        let files = executor.snapshot_files().await?;
        let table = Arc::new(BuildMatchTable::from_config(&project.builds(), &files, &cache).await?);

        let results = executor.build_all(&table.matches()).await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(
            "initial build: {} succeeded, {failed} failed",
            results.len() - failed
        );

        let fallback = BuildFallback::new(table.clone(), executor.clone(), project.env.clone());
        let dispatcher = Dispatcher::new(routes.clone(), executor.store().clone(), runtime)
            .with_fallback(Arc::new(fallback));

        let session = Arc::new(Self {
            root: root.clone(),
            config,
            project,
            routes,
            cache,
            table,
            executor,
            dispatcher,
            tasks: Mutex::new(Vec::new()),
            builds: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        });

        if session.config.watch.enabled {
            let (tx, mut rx) = mpsc::channel::<Vec<FileChange>>(16);
            let debounce = Duration::from_millis(session.config.watch.debounce_ms);
            match watch_project(root, ignores, debounce, files, tx) {
                Ok(watcher) => {
                    let weak = Arc::downgrade(&session);
                    let consumer = tokio::spawn(async move {
                        while let Some(batch) = rx.recv().await {
                            let Some(session) = weak.upgrade() else {
                                break;
                            };
                            session.apply_changes(&batch).await;
                        }
                    });
                    session
                        .tasks
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend([watcher, consumer]);
                }
                Err(err) => warn!("file watching disabled: {err}"),
            }
        }

        Ok(session)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &DevConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn builders(&self) -> &BuilderCache {
        &self.cache
    }

    pub fn table(&self) -> &BuildMatchTable {
        &self.table
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a batch of file changes: changed entrypoints are rebuilt,
    /// new files under a build glob get a match, deleted ones are torn down.
    ///
    /// Each rebuild runs as its own task, so a slow builder never holds up
    /// other entrypoints or the next batch. [`DevSession::wait_for_builds`]
    /// waits for them.
    pub async fn apply_changes(&self, changes: &[FileChange]) {
        let mut to_build: Vec<Arc<BuildMatch>> = Vec::new();
        for change in changes {
            if self
                .project
                .source
                .as_deref()
                .and_then(|p| p.file_name())
                .is_some_and(|name| name.to_string_lossy() == change.path())
            {
                warn!("{} changed; restart to apply it", change.path());
            }
            match change {
                FileChange::Removed(path) => {
                    for m in self.table.find_by_entrypoint(path) {
                        info!("{path} was removed");
                        self.cancel_builds(m.id);
                        to_build.retain(|queued| queued.id != m.id);
                        self.executor.teardown_match(&m).await;
                        self.table.remove(m.id);
                    }
                }
                FileChange::Modified(path) => to_build.extend(self.table.find_by_entrypoint(path)),
                FileChange::Added(path) => to_build.extend(self.table.add_file(path)),
            }
        }
        if to_build.is_empty() {
            return;
        }
        debug!("rebuilding {} entrypoint(s)", to_build.len());
        let mut builds = self.builds.lock().unwrap_or_else(PoisonError::into_inner);
        builds.retain(|(_, task)| !task.is_finished());
        for m in to_build {
            let executor = self.executor.clone();
            let id = m.id;
            let task = tokio::spawn(async move {
                if let Err(err) = executor.build(&m).await {
                    log_build_failure(&m.entrypoint, &err);
                }
            });
            builds.push((id, task));
        }
    }

    fn cancel_builds(&self, id: MatchId) {
        let mut builds = self.builds.lock().unwrap_or_else(PoisonError::into_inner);
        builds.retain(|(owner, task)| {
            if *owner == id {
                task.abort();
                false
            } else {
                true
            }
        });
    }

    /// Waits until every rebuild started by file changes has finished.
    pub async fn wait_for_builds(&self) {
        loop {
            let pending = std::mem::take(&mut *self.builds.lock().unwrap_or_else(PoisonError::into_inner));
            if pending.is_empty() {
                return;
            }
            for (_, task) in pending {
                let _ = task.await;
            }
        }
    }

    /// Rebuilds one entrypoint, or all of them.
    pub async fn rebuild(&self, entrypoint: Option<&str>) -> Vec<(String, Result<BuildReport>)> {
        let matches = match entrypoint {
            Some(entrypoint) => self.table.find_by_entrypoint(entrypoint),
            None => self.table.matches(),
        };
        self.executor
            .build_all(&matches)
            .await
            .into_iter()
            .map(|(m, result)| (m.entrypoint.clone(), result))
            .collect()
    }

    pub async fn build_summaries(&self) -> Vec<BuildSummary> {
        let mut out = Vec::new();
        for m in self.table.matches() {
            let state = m.state().lock().await;
            out.push(BuildSummary {
                entrypoint: m.entrypoint.clone(),
                builder: m.builder.identifier.to_string(),
                build_count: state.build_count,
                outputs: state.output_paths.clone(),
                last_build: state.last_build,
                last_error: state.last_error.clone(),
            });
        }
        out
    }

    pub async fn status(&self) -> ServerStatus {
        let addr = self.local_addr();
        let port = addr.map(|a| a.port()).unwrap_or(self.config.port);
        let host = addr
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| self.config.listen.clone());
        let snapshot = self.executor.store().snapshot();
        let functions = snapshot
            .values()
            .filter(|s| matches!(s.artifact, Artifact::Function(_)))
            .count();
        let failed_builds = self
            .build_summaries()
            .await
            .iter()
            .filter(|b| b.last_error.is_some())
            .count();
        let watching = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|t| !t.is_finished());

        ServerStatus {
            running: addr.is_some(),
            port,
            url: format!("http://{host}:{port}"),
            watching,
            builds: self.table.len(),
            failed_builds,
            artifacts: snapshot.len(),
            functions,
        }
    }

    /// Accepts HTTP/1 connections on `listener` until `shutdown` resolves.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let addr = listener.local_addr().map_err(DevError::Listen)?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        info!("ready on http://{addr}");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!("accept failed: {err}");
                            continue;
                        }
                    };
                    let session = self.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| handle(session.clone(), req));
                        if let Err(err) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!("connection from {peer} ended: {err}");
                        }
                    });
                }
            }
        }

        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    /// Stops watching, then releases every function instance and dev server.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        let builds = std::mem::take(&mut *self.builds.lock().unwrap_or_else(PoisonError::into_inner));
        for (_, task) in &builds {
            task.abort();
        }
        for (_, task) in builds {
            let _ = task.await;
        }
        self.executor.shutdown(&self.table).await;
        info!("dev session for {} stopped", self.root.display());
    }
}

async fn handle(
    session: Arc<DevSession>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let response = session
        .dispatcher
        .dispatch(Request::from_parts(parts, body))
        .await;
    Ok(response.map(Full::new))
}
