use crate::builder_cache::{BuilderCache, BuilderDescriptor};
use crate::builders::{BuildConfig, BuildOptions, DevServerProcess, PrepareCacheOptions};
use crate::error::{format_size, parse_size, DevError, Result};
use crate::files::{collect_project_files, FileSnapshot};
use crate::ignore::IgnoreSet;
use crate::pattern::GlobPattern;
use crate::project::BuildSpec;
use crate::runtime::{FunctionRuntime, RuntimeHandle, LOCAL_REGION, REGION_VAR};
use crate::store::{normalize, ArtifactStore, MatchId, ServedArtifact};
use sha2::{Digest, Sha256};
use crate::types::{Artifact, FileRef};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Function size limit when neither the project nor the builder sets one.
pub const DEFAULT_MAX_LAMBDA_SIZE: u64 = 5 * 1024 * 1024;

const DESTROY_BACKOFF_START: Duration = Duration::from_millis(50);
const DESTROY_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Mutable part of a [`BuildMatch`], guarded by its build lock.
#[derive(Debug, Default)]
pub struct BuildState {
    pub file: Option<FileRef>,
    pub work_path: Option<PathBuf>,
    pub last_build: Option<SystemTime>,
    pub last_error: Option<String>,
    pub output_paths: Vec<String>,
    pub build_count: u64,
    pub dev_servers: Vec<DevServerProcess>,
    /// Files saved by the builder's `prepareCache` after the last build.
    pub cache_files: Vec<String>,
}

/// One entrypoint bound to the builder that handles it.
#[derive(Debug)]
pub struct BuildMatch {
    pub id: MatchId,
    /// Index of the `builds[]` entry this match came from.
    pub spec: usize,
    pub src: String,
    pub entrypoint: String,
    pub builder: Arc<BuilderDescriptor>,
    pub config: BuildConfig,
    state: Mutex<BuildState>,
}

impl BuildMatch {
    /// Build state. Holding the guard blocks builds of this entrypoint.
    pub fn state(&self) -> &Mutex<BuildState> {
        &self.state
    }

    /// Builder config as the builder sees it: defaults overlaid by the
    /// project's `config`.
    pub fn effective_config(&self) -> BuildConfig {
        let mut merged = self.builder.default_config();
        for (k, v) in &self.config {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Largest function payload this match may produce.
    pub fn size_limit(&self) -> Result<u64> {
        let project = match self.config.get("maxLambdaSize") {
            None => None,
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => parse_size(s),
            Some(_) => None,
        };
        if self.config.contains_key("maxLambdaSize") && project.is_none() {
            return Err(DevError::BuildFailed {
                entrypoint: self.entrypoint.clone(),
                message: format!("invalid maxLambdaSize {}", self.config["maxLambdaSize"]),
            });
        }
        Ok(project
            .or_else(|| self.builder.max_lambda_size())
            .unwrap_or(DEFAULT_MAX_LAMBDA_SIZE))
    }
}

#[derive(Debug)]
struct MatchSpec {
    src: GlobPattern,
    builder: Arc<BuilderDescriptor>,
    config: BuildConfig,
}

/// The session's set of build matches, derived from `builds[]`.
#[derive(Debug)]
pub struct BuildMatchTable {
    specs: Vec<MatchSpec>,
    matches: RwLock<BTreeMap<MatchId, Arc<BuildMatch>>>,
    next_id: AtomicU64,
}

impl BuildMatchTable {
    /// Resolves every builder and matches `files` against each build glob.
    ///
    /// An unresolvable builder or an invalid glob fails the whole table.
    pub async fn from_config(
        builds: &[BuildSpec],
        files: &FileSnapshot,
        cache: &BuilderCache,
    ) -> Result<Self> {
        let identifiers: Vec<String> = builds.iter().map(|b| b.builder.clone()).collect();
        let resolved = cache.resolve_all(&identifiers).await;

        let mut specs = Vec::with_capacity(builds.len());
        for (build, descriptor) in builds.iter().zip(resolved) {
            let src = GlobPattern::new(&build.src).map_err(|e| {
                DevError::ProjectConfig(format!("invalid build src {:?}: {e}", build.src))
            })?;
            specs.push(MatchSpec {
                src,
                builder: descriptor?,
                config: build.config.clone(),
            });
        }

        let table = Self {
            specs,
            matches: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        };
        for entrypoint in files.keys() {
            table.add_file(entrypoint);
        }
        info!(
            "{} build(s) matched {} entrypoint(s)",
            table.specs.len(),
            table.len()
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.matches.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All matches in creation order.
    pub fn matches(&self) -> Vec<Arc<BuildMatch>> {
        self.matches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: MatchId) -> Option<Arc<BuildMatch>> {
        self.matches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn find_by_entrypoint(&self, entrypoint: &str) -> Vec<Arc<BuildMatch>> {
        self.matches()
            .into_iter()
            .filter(|m| m.entrypoint == entrypoint)
            .collect()
    }

    /// Creates matches for a file under any build glob it is not yet
    /// matched by. Returns only the new matches.
    pub fn add_file(&self, entrypoint: &str) -> Vec<Arc<BuildMatch>> {
        let mut matches = self.matches.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = Vec::new();
        for (idx, spec) in self.specs.iter().enumerate() {
            if !spec.src.is_match(entrypoint) {
                continue;
            }
            let exists = matches
                .values()
                .any(|m| m.spec == idx && m.entrypoint == entrypoint);
            if exists {
                continue;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let m = Arc::new(BuildMatch {
                id,
                spec: idx,
                src: spec.src.as_str().to_string(),
                entrypoint: entrypoint.to_string(),
                builder: spec.builder.clone(),
                config: spec.config.clone(),
                state: Mutex::new(BuildState::default()),
            });
            debug!("match {id}: {entrypoint} via {}", spec.builder.identifier);
            matches.insert(id, m.clone());
            added.push(m);
        }
        added
    }

    pub fn remove(&self, id: MatchId) -> Option<Arc<BuildMatch>> {
        self.matches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }
}

/// Summary of one successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub entrypoint: String,
    pub serial: u64,
    /// Served path and artifact kind of every output.
    pub outputs: Vec<(String, &'static str)>,
    pub elapsed: Duration,
}

/// Runs builders and publishes their outputs.
pub struct BuildExecutor {
    root: PathBuf,
    cache_root: PathBuf,
    ignores: IgnoreSet,
    env: BTreeMap<String, String>,
    store: Arc<ArtifactStore>,
    runtime: Arc<dyn FunctionRuntime>,
    serial: AtomicU64,
    orphans: Arc<std::sync::Mutex<Vec<RuntimeHandle>>>,
}

/// Runtime handles nobody owns yet: created but not published, or retired
/// but not destroyed. Whatever is still held on drop goes to the executor's
/// orphan list.
struct Pending {
    orphans: Arc<std::sync::Mutex<Vec<RuntimeHandle>>>,
    handles: Vec<RuntimeHandle>,
}

impl Pending {
    fn publish(mut self) {
        self.handles.clear();
    }

    fn take(mut self) -> Vec<RuntimeHandle> {
        std::mem::take(&mut self.handles)
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        debug!("{} runtime(s) left behind by a cancelled task", self.handles.len());
        self.orphans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(&mut self.handles);
    }
}

impl BuildExecutor {
    pub fn new(
        root: PathBuf,
        cache_root: PathBuf,
        ignores: IgnoreSet,
        env: BTreeMap<String, String>,
        store: Arc<ArtifactStore>,
        runtime: Arc<dyn FunctionRuntime>,
    ) -> Self {
        Self {
            root,
            cache_root,
            ignores,
            env,
            store,
            runtime,
            serial: AtomicU64::new(1),
            orphans: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn FunctionRuntime> {
        &self.runtime
    }

    /// Current project files, excluding ignored paths.
    pub async fn snapshot_files(&self) -> Result<FileSnapshot> {
        let root = self.root.clone();
        let ignores = self.ignores.clone();
        tokio::task::spawn_blocking(move || collect_project_files("**", &root, &ignores))
            .await
            .map_err(|e| DevError::fs(&self.root, std::io::Error::other(e)))?
    }

    /// Work directory for `file`, created on first use.
    pub async fn work_path(&self, file: &FileRef) -> Result<PathBuf> {
        let path = self.cache_root.join("workPaths").join(file.cache_key());
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| DevError::fs(&path, e))?;
        Ok(path)
    }

    /// Builds one entrypoint and publishes the result.
    ///
    /// On failure nothing changes in the store and the previous outputs stay
    /// live.
    pub async fn build(&self, m: &BuildMatch) -> Result<BuildReport> {
        self.reap_orphans().await;
        let mut state = m.state.lock().await;
        let result = self.build_locked(m, &mut state).await;
        match &result {
            Ok(report) => {
                info!(
                    "built {} in {}ms ({} output(s))",
                    m.entrypoint,
                    report.elapsed.as_millis(),
                    report.outputs.len()
                );
                state.last_error = None;
            }
            Err(err) => state.last_error = Some(err.to_string()),
        }
        result
    }

    async fn build_locked(&self, m: &BuildMatch, state: &mut BuildState) -> Result<BuildReport> {
        let started = Instant::now();
        let entry_path = self.root.join(&m.entrypoint);
        let meta = tokio::fs::metadata(&entry_path)
            .await
            .map_err(|e| DevError::fs(&entry_path, e))?;
        let file = FileRef::from_metadata(entry_path, &meta);
        let work_path = self.work_path(&file).await?;
        let caching = m.builder.capabilities().prepare_cache;
        if caching {
            self.restore_build_cache(m, &work_path).await;
        }

        let mut files = self.snapshot_files().await?;
        files.insert(m.entrypoint.clone(), file.clone());
        let cache_snapshot = if caching { files.clone() } else { FileSnapshot::new() };

        debug!(
            "building {} with {} in {}",
            m.entrypoint,
            m.builder.identifier,
            work_path.display()
        );
        let outputs = m
            .builder
            .builder
            .build(BuildOptions {
                files,
                entrypoint: m.entrypoint.clone(),
                work_path: work_path.clone(),
                config: m.effective_config(),
                is_dev: true,
            })
            .await
            .map_err(|e| DevError::BuildFailed {
                entrypoint: m.entrypoint.clone(),
                message: e.to_string(),
            })?;

        let limit = m.size_limit()?;
        for (path, artifact) in &outputs {
            if let Artifact::Function(function) = artifact {
                let size = function.packaged_size();
                if size > limit {
                    return Err(DevError::ArtifactTooLarge {
                        path: path.clone(),
                        size,
                        limit,
                    });
                }
                debug!("{path}: {} of {}", format_size(size), format_size(limit));
            }
        }

        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let mut served = Vec::with_capacity(outputs.len());
        let mut pending = Pending {
            orphans: self.orphans.clone(),
            handles: Vec::new(),
        };
        for (path, artifact) in outputs {
            let runtime = match &artifact {
                Artifact::Function(function) => {
                    let mut env = self.env.clone();
                    env.extend(function.environment.clone());
                    env.insert(REGION_VAR.to_string(), LOCAL_REGION.to_string());
                    match self.runtime.create(function, &env).await {
                        Ok(handle) => {
                            pending.handles.push(handle.clone());
                            Some(handle)
                        }
                        Err(err) => {
                            self.destroy_all(pending.take()).await;
                            return Err(err);
                        }
                    }
                }
                Artifact::Static(_) => None,
            };
            served.push((
                path,
                ServedArtifact {
                    artifact,
                    origin: m.id,
                    runtime,
                    serial,
                },
            ));
        }

        let kinds: BTreeMap<String, &'static str> = served
            .iter()
            .map(|(path, s)| (normalize(path).to_string(), s.artifact.kind()))
            .collect();
        let outcome = self.store.swap(m.id, served);
        pending.publish();
        let outputs = outcome
            .published
            .iter()
            .filter_map(|path| kinds.get(path).map(|kind| (path.clone(), *kind)))
            .collect();
        for rejected in &outcome.rejected {
            warn!(
                "{} is already served by match {}; ignoring that output of {}",
                rejected.path, rejected.owner, m.entrypoint
            );
        }
        let retired = outcome
            .rejected
            .iter()
            .filter_map(|r| r.artifact.runtime.clone())
            .chain(outcome.replaced.iter().filter_map(|r| r.runtime.clone()))
            .collect();
        self.destroy_all(retired).await;

        if caching {
            state.cache_files = self.save_build_cache(m, cache_snapshot, &work_path).await;
        }
        state.file = Some(file);
        state.work_path = Some(work_path);
        state.last_build = Some(SystemTime::now());
        state.output_paths = outcome.published;
        state.build_count += 1;

        Ok(BuildReport {
            entrypoint: m.entrypoint.clone(),
            serial,
            outputs,
            elapsed: started.elapsed(),
        })
    }

    /// Builds every match concurrently. Failures are logged and returned;
    /// they do not affect other entrypoints.
    pub async fn build_all(
        &self,
        matches: &[Arc<BuildMatch>],
    ) -> Vec<(Arc<BuildMatch>, Result<BuildReport>)> {
        let results = futures::future::join_all(matches.iter().map(|m| self.build(m))).await;
        matches
            .iter()
            .cloned()
            .zip(results)
            .inspect(|(m, result)| {
                if let Err(err) = result {
                    log_build_failure(&m.entrypoint, err);
                }
            })
            .collect()
    }

    /// Stops serving a match: removes its outputs, destroys their runtimes
    /// and stops its dev servers.
    pub async fn teardown_match(&self, m: &BuildMatch) {
        let mut state = m.state.lock().await;
        let removed = self.store.remove_origin(m.id);
        self.destroy_all(removed.iter().filter_map(|r| r.runtime.clone()).collect())
            .await;
        for server in &mut state.dev_servers {
            server.stop().await;
        }
        state.dev_servers.clear();
        state.output_paths.clear();
        debug!("tore down {}", m.entrypoint);
    }

    /// Tears down every match and anything left in the store.
    pub async fn shutdown(&self, table: &BuildMatchTable) {
        for m in table.matches() {
            self.teardown_match(&m).await;
        }
        let leftovers = self.store.drain();
        self.destroy_all(leftovers.iter().filter_map(|r| r.runtime.clone()).collect())
            .await;
        self.reap_orphans().await;
    }

    /// Destroys runtimes left behind by cancelled builds.
    pub async fn reap_orphans(&self) {
        let orphans = std::mem::take(
            &mut *self.orphans.lock().unwrap_or_else(PoisonError::into_inner),
        );
        self.destroy_all(orphans).await;
    }

    /// Destroys `handles` one by one. A handle stays owed to the orphan
    /// list until its destroy has returned.
    async fn destroy_all(&self, handles: Vec<RuntimeHandle>) {
        if handles.is_empty() {
            return;
        }
        let mut owed = Pending {
            orphans: self.orphans.clone(),
            handles,
        };
        while let Some(handle) = owed.handles.last().cloned() {
            self.destroy_with_retry(&handle).await;
            owed.handles.pop();
        }
    }

    /// Keeps trying until the runtime lets go of the instance. Callers that
    /// must finish, like shutdown, bound the wait themselves.
    async fn destroy_with_retry(&self, handle: &RuntimeHandle) {
        let mut delay = DESTROY_BACKOFF_START;
        let mut attempt = 1u32;
        loop {
            match self.runtime.destroy(handle).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!("destroyed function {} after {attempt} attempts", handle.id);
                    }
                    return;
                }
                Err(err) => {
                    warn!("destroying function {} failed (attempt {attempt}): {err}", handle.id);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(DESTROY_BACKOFF_MAX);
                    attempt += 1;
                }
            }
        }
    }

    fn build_cache_dir(&self, m: &BuildMatch) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(m.src.as_bytes());
        hasher.update([0]);
        hasher.update(m.entrypoint.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.cache_root.join("buildCache").join(&digest[..16])
    }

    /// Copies files saved by an earlier `prepareCache` into `work_path`,
    /// leaving files that already exist there alone.
    async fn restore_build_cache(&self, m: &BuildMatch, work_path: &Path) {
        let dir = self.build_cache_dir(m);
        let saved = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || collect_project_files("**", &dir, &IgnoreSet::default()))
                .await
        };
        let saved = match saved {
            Ok(Ok(saved)) => saved,
            Ok(Err(_)) => return,
            Err(err) => {
                warn!("could not read build cache for {}: {err}", m.entrypoint);
                return;
            }
        };
        for (name, file) in saved {
            let target = work_path.join(&name);
            if tokio::fs::try_exists(&target).await.unwrap_or(true) {
                continue;
            }
            if let Some(parent) = target.parent() {
                if let Err(err) = tokio::fs::create_dir_all(parent).await {
                    warn!("could not restore cached {name}: {err}");
                    continue;
                }
            }
            match tokio::fs::copy(&file.fs_path, &target).await {
                Ok(_) => debug!("restored cached {name} for {}", m.entrypoint),
                Err(err) => warn!("could not restore cached {name}: {err}"),
            }
        }
    }

    /// Runs the builder's `prepareCache` and saves what it returns. Failures
    /// are logged; the build itself already succeeded.
    async fn save_build_cache(
        &self,
        m: &BuildMatch,
        files: FileSnapshot,
        work_path: &Path,
    ) -> Vec<String> {
        let outputs = m
            .builder
            .builder
            .prepare_cache(PrepareCacheOptions {
                files,
                entrypoint: m.entrypoint.clone(),
                work_path: work_path.to_path_buf(),
                config: m.effective_config(),
            })
            .await;
        let outputs = match outputs {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!("prepareCache for {} failed: {err}", m.entrypoint);
                return Vec::new();
            }
        };

        let dir = self.build_cache_dir(m);
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("could not clear build cache {}: {err}", dir.display());
            }
        }
        let mut saved = Vec::with_capacity(outputs.len());
        for (name, content) in outputs {
            let name = normalize(&name).to_string();
            if !is_plain_relative(&name) {
                warn!("prepareCache for {} returned unusable path {name:?}", m.entrypoint);
                continue;
            }
            let target = dir.join(&name);
            let written = async {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let bytes = content.read().await?;
                tokio::fs::write(&target, bytes).await
            };
            match written.await {
                Ok(()) => saved.push(name),
                Err(err) => warn!("could not cache {name} for {}: {err}", m.entrypoint),
            }
        }
        debug!("cached {} file(s) for {}", saved.len(), m.entrypoint);
        saved
    }
}

fn is_plain_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

pub(crate) fn log_build_failure(entrypoint: &str, err: &DevError) {
    match err {
        DevError::ArtifactTooLarge { .. } => error!("{err}"),
        _ => warn!("build of {entrypoint} failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder_cache::BuilderCache;
    use crate::builders::BuilderError;
    use crate::testing::{function, project, static_bytes, FnBuilder, MapInstaller, MockRuntime};
    use crate::types::BuilderOutputs;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        _dir: tempfile::TempDir,
        table: BuildMatchTable,
        executor: BuildExecutor,
        runtime: Arc<MockRuntime>,
        store: Arc<ArtifactStore>,
    }

    async fn fixture(builder: FnBuilder, config: serde_json::Value) -> Fixture {
        let dir = project(&[("api/a.fn", "a"), ("api/b.fn", "b"), ("index.html", "<p>")]);
        let cache = BuilderCache::new(Arc::new(MapInstaller::new().with("mock", "1.0.0", builder)));
        let builds = vec![BuildSpec {
            src: "api/*.fn".to_string(),
            builder: "mock".to_string(),
            config: config.as_object().cloned().unwrap_or_default(),
        }];
        let files = collect_project_files("**", dir.path(), &IgnoreSet::default()).expect("files");
        let table = BuildMatchTable::from_config(&builds, &files, &cache)
            .await
            .expect("table");
        let store = Arc::new(ArtifactStore::new());
        let runtime = Arc::new(MockRuntime::default());
        let mut env = BTreeMap::new();
        env.insert("SHARED".to_string(), "project".to_string());
        env.insert("ONLY_PROJECT".to_string(), "yes".to_string());
        let executor = BuildExecutor::new(
            dir.path().to_path_buf(),
            dir.path().join(".devhost/cache"),
            IgnoreSet::default(),
            env,
            store.clone(),
            runtime.clone(),
        );
        Fixture {
            _dir: dir,
            table,
            executor,
            runtime,
            store,
        }
    }

    fn one_function(size: usize) -> FnBuilder {
        FnBuilder::new(move |opts| {
            let mut out = BuilderOutputs::new();
            let stem = opts.entrypoint.trim_end_matches(".fn").to_string();
            out.insert(stem, function("handler", size));
            Ok(out)
        })
    }

    #[tokio::test]
    async fn table_matches_build_globs() {
        let fx = fixture(FnBuilder::empty(), json!({})).await;
        let entrypoints: Vec<String> = fx.table.matches().iter().map(|m| m.entrypoint.clone()).collect();
        assert_eq!(entrypoints, vec!["api/a.fn", "api/b.fn"]);
        assert_eq!(fx.table.find_by_entrypoint("api/a.fn").len(), 1);
        assert!(fx.table.add_file("api/a.fn").is_empty());
        assert_eq!(fx.table.add_file("api/c.fn").len(), 1);
        assert!(fx.table.add_file("readme.md").is_empty());
    }

    #[tokio::test]
    async fn unknown_builders_fail_the_table() {
        let cache = BuilderCache::new(Arc::new(MapInstaller::new()));
        let builds = vec![BuildSpec {
            src: "**".to_string(),
            builder: "missing".to_string(),
            config: BuildConfig::new(),
        }];
        let err = BuildMatchTable::from_config(&builds, &FileSnapshot::new(), &cache)
            .await
            .expect_err("fatal");
        assert!(matches!(err, DevError::BuilderNotFound { .. }));
    }

    #[tokio::test]
    async fn build_publishes_functions_with_merged_environment() {
        let fx = fixture(one_function(100), json!({})).await;
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);
        let report = fx.executor.build(&m).await.expect("build");
        assert_eq!(report.outputs, vec![("api/a".to_string(), "function")]);

        let snap = fx.store.snapshot();
        let handle = snap["api/a"].runtime.clone().expect("runtime handle");
        let env = fx.runtime.env_of(handle.id).expect("env");
        assert_eq!(env.get("ONLY_PROJECT").map(String::as_str), Some("yes"));
        assert_eq!(env.get("SHARED").map(String::as_str), Some("artifact"));
        assert_eq!(env.get(REGION_VAR).map(String::as_str), Some(LOCAL_REGION));

        let state = m.state().lock().await;
        assert_eq!(state.build_count, 1);
        assert_eq!(state.output_paths, vec!["api/a".to_string()]);
        let work = state.work_path.clone().expect("work path");
        assert!(work.starts_with(fx.executor.cache_root().join("workPaths")));
        assert!(work.is_dir());
    }

    #[tokio::test]
    async fn oversize_functions_fail_without_touching_the_store() {
        let size = Arc::new(AtomicUsize::new(512));
        let builder = {
            let size = size.clone();
            FnBuilder::new(move |_| {
                let mut out = BuilderOutputs::new();
                out.insert("api/a".to_string(), function("handler", size.load(Ordering::SeqCst)));
                Ok(out)
            })
        };
        let fx = fixture(builder, json!({"maxLambdaSize": "1kb"})).await;
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);

        let first = fx.executor.build(&m).await.expect("small build");
        assert_eq!(fx.runtime.created(), 1);

        size.store(2048, Ordering::SeqCst);
        let err = fx.executor.build(&m).await.expect_err("too large");
        match &err {
            DevError::ArtifactTooLarge { path, size, limit } => {
                assert_eq!(path, "api/a");
                assert_eq!(*size, 2048);
                assert_eq!(*limit, 1024);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(fx.runtime.created(), 1, "no runtime for the rejected build");
        assert_eq!(fx.store.snapshot()["api/a"].serial, first.serial);
        assert_eq!(fx.runtime.live(), 1);

        let state = m.state().lock().await;
        assert_eq!(state.build_count, 1);
        assert!(state.last_error.as_deref().is_some_and(|e| e.contains("maxLambdaSize")));
    }

    #[tokio::test]
    async fn builder_defaults_and_fallback_limit_apply() {
        let mut defaults = BuildConfig::new();
        defaults.insert("maxLambdaSize".to_string(), json!(64));
        let fx = fixture(one_function(100).with_defaults(defaults), json!({})).await;
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);
        assert_eq!(m.size_limit().expect("limit"), 64);
        assert!(matches!(
            fx.executor.build(&m).await,
            Err(DevError::ArtifactTooLarge { limit: 64, .. })
        ));

        let fx = fixture(one_function(100), json!({})).await;
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);
        assert_eq!(m.size_limit().expect("limit"), DEFAULT_MAX_LAMBDA_SIZE);

        let fx = fixture(one_function(100), json!({"maxLambdaSize": "huge"})).await;
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);
        assert!(matches!(m.size_limit(), Err(DevError::BuildFailed { .. })));
    }

    #[tokio::test]
    async fn rebuild_swaps_outputs_and_destroys_old_runtimes() {
        let round = Arc::new(AtomicUsize::new(0));
        let builder = {
            let round = round.clone();
            FnBuilder::new(move |_| {
                let mut out = BuilderOutputs::new();
                out.insert("api/a".to_string(), function("handler", 10));
                if round.fetch_add(1, Ordering::SeqCst) == 0 {
                    out.insert("api/a.txt".to_string(), static_bytes("old"));
                }
                Ok(out)
            })
        };
        let fx = fixture(builder, json!({})).await;
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);

        fx.executor.build(&m).await.expect("first");
        let first = fx.store.snapshot()["api/a"].runtime.clone().expect("handle");
        fx.executor.build(&m).await.expect("second");

        let snap = fx.store.snapshot();
        assert!(!snap.contains_key("api/a.txt"));
        assert_ne!(snap["api/a"].runtime.as_ref().map(|h| h.id), Some(first.id));
        assert!(fx.runtime.was_destroyed(first.id));
        assert_eq!(fx.runtime.live(), 1);
    }

    #[tokio::test]
    async fn failed_runtime_creation_rolls_back() {
        let builder = FnBuilder::new(|_| {
            let mut out = BuilderOutputs::new();
            out.insert("api/ok".to_string(), function("handler", 10));
            out.insert("api/zz".to_string(), function("broken", 10));
            Ok(out)
        });
        let fx = fixture(builder, json!({})).await;
        fx.runtime.fail_handler("broken");
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);

        let err = fx.executor.build(&m).await.expect_err("provision fails");
        assert!(matches!(err, DevError::RuntimeProvision { .. }));
        assert!(fx.store.is_empty());
        assert_eq!(fx.runtime.live(), 0);
    }

    #[tokio::test]
    async fn builder_errors_become_build_failures() {
        let fx = fixture(
            FnBuilder::new(|_| Err(BuilderError::Failed("syntax error".to_string()))),
            json!({}),
        )
        .await;
        let results = fx.executor.build_all(&fx.table.matches()).await;
        assert_eq!(results.len(), 2);
        for (_, result) in results {
            assert!(matches!(result, Err(DevError::BuildFailed { .. })));
        }
    }

    #[tokio::test]
    async fn builds_of_one_entrypoint_serialize() {
        let builder = one_function(10).with_delay(Duration::from_millis(40));
        let fx = fixture(builder.clone(), json!({})).await;
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);

        let (a, b, c) = tokio::join!(
            fx.executor.build(&m),
            fx.executor.build(&m),
            fx.executor.build(&m)
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(builder.max_in_flight(), 1);
        assert_eq!(m.state().lock().await.build_count, 3);
        assert_eq!(fx.runtime.live(), 1);
    }

    #[tokio::test]
    async fn different_entrypoints_build_concurrently() {
        let builder = one_function(10).with_delay(Duration::from_millis(40));
        let fx = fixture(builder.clone(), json!({})).await;
        let results = fx.executor.build_all(&fx.table.matches()).await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(builder.max_in_flight(), 2);
        assert_eq!(fx.store.len(), 2);
    }

    #[tokio::test]
    async fn teardown_and_shutdown_release_everything() {
        let fx = fixture(one_function(10), json!({})).await;
        fx.executor.build_all(&fx.table.matches()).await;
        assert_eq!(fx.runtime.live(), 2);

        let a = fx.table.find_by_entrypoint("api/a.fn").remove(0);
        fx.executor.teardown_match(&a).await;
        assert!(!fx.store.snapshot().contains_key("api/a"));
        assert_eq!(fx.runtime.live(), 1);

        fx.executor.shutdown(&fx.table).await;
        assert!(fx.store.is_empty());
        assert_eq!(fx.runtime.live(), 0);
    }

    fn two_functions() -> FnBuilder {
        FnBuilder::new(|_| {
            let mut out = BuilderOutputs::new();
            out.insert("api/one".to_string(), function("handler", 10));
            out.insert("api/two".to_string(), function("handler", 10));
            Ok(out)
        })
    }

    #[tokio::test]
    async fn runtimes_of_a_cancelled_build_are_reclaimed() {
        let fx = fixture(two_functions(), json!({})).await;
        fx.runtime.slow_create(Duration::from_millis(100));
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);

        // Cancelled while the second runtime is still being created.
        let cancelled = tokio::time::timeout(Duration::from_millis(150), fx.executor.build(&m)).await;
        assert!(cancelled.is_err());
        assert!(fx.store.is_empty());
        assert_eq!(fx.runtime.live(), 1);

        fx.runtime.slow_create(Duration::ZERO);
        fx.executor.build(&m).await.expect("build");
        assert!(fx.runtime.was_destroyed(1));
        assert_eq!(fx.runtime.live(), 2);

        fx.executor.shutdown(&fx.table).await;
        assert_eq!(fx.runtime.live(), 0);
    }

    #[tokio::test]
    async fn shutdown_reclaims_runtimes_of_cancelled_builds() {
        let fx = fixture(two_functions(), json!({})).await;
        fx.runtime.slow_create(Duration::from_millis(100));
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);
        let _ = tokio::time::timeout(Duration::from_millis(150), fx.executor.build(&m)).await;
        assert_eq!(fx.runtime.live(), 1);

        fx.executor.shutdown(&fx.table).await;
        assert_eq!(fx.runtime.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_keeps_retrying_until_the_runtime_lets_go() {
        let fx = fixture(one_function(10), json!({})).await;
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);
        fx.executor.build(&m).await.expect("build");
        assert_eq!(fx.runtime.live(), 1);

        fx.runtime.fail_destroys(8);
        fx.executor.teardown_match(&m).await;
        assert_eq!(fx.runtime.live(), 0);
        assert_eq!(fx.runtime.destroy_attempts(), 9);
    }

    #[tokio::test]
    async fn prepare_cache_outputs_refill_a_wiped_work_path() {
        let builder = one_function(10).with_cache(&[("deps/lock.json", "{\"v\":1}"), ("../escape", "x")]);
        let fx = fixture(builder, json!({})).await;
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);
        fx.executor.build(&m).await.expect("build");

        let (first_work, cached) = {
            let state = m.state().lock().await;
            (state.work_path.clone().expect("work path"), state.cache_files.clone())
        };
        assert_eq!(cached, vec!["deps/lock.json".to_string()]);
        assert!(!first_work.join("deps/lock.json").exists());

        // A wiped work path is refilled from the saved cache.
        std::fs::remove_dir_all(&first_work).expect("wipe work path");
        fx.executor.build(&m).await.expect("rebuild");

        let second_work = m.state().lock().await.work_path.clone().expect("work path");
        assert_eq!(second_work, first_work);
        let restored = second_work.join("deps/lock.json");
        assert_eq!(std::fs::read_to_string(restored).expect("restored"), "{\"v\":1}");
    }

    #[tokio::test]
    async fn builders_without_prepare_cache_record_nothing() {
        let fx = fixture(one_function(10), json!({})).await;
        let m = fx.table.find_by_entrypoint("api/a.fn").remove(0);
        fx.executor.build(&m).await.expect("build");
        assert!(m.state().lock().await.cache_files.is_empty());
        assert!(!fx.executor.cache_root().join("buildCache").exists());
    }

    #[tokio::test]
    async fn outputs_claimed_by_another_entrypoint_are_dropped() {
        let builder = FnBuilder::new(|opts| {
            let mut out = BuilderOutputs::new();
            out.insert("api/shared".to_string(), function("handler", 10));
            let own = opts.entrypoint.trim_end_matches(".fn").to_string();
            out.insert(own, static_bytes("own"));
            Ok(out)
        });
        let fx = fixture(builder, json!({})).await;
        let a = fx.table.find_by_entrypoint("api/a.fn").remove(0);
        let b = fx.table.find_by_entrypoint("api/b.fn").remove(0);

        fx.executor.build(&a).await.expect("build a");
        let report = fx.executor.build(&b).await.expect("build b");
        assert_eq!(report.outputs, vec![("api/b".to_string(), "static")]);

        let snap = fx.store.snapshot();
        assert_eq!(snap["api/shared"].origin, a.id);
        assert_eq!(snap["api/b"].origin, b.id);
        assert_eq!(fx.runtime.live(), 1, "the refused function is not kept alive");
        assert_eq!(b.state().lock().await.output_paths, vec!["api/b".to_string()]);

        fx.executor.build(&b).await.expect("rebuild b");
        assert_eq!(fx.store.snapshot()["api/shared"].origin, a.id);
    }
}
