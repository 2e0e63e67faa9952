//! Test doubles shared by the unit tests.

use crate::builder_cache::{BuilderDescriptor, BuilderInstaller};
use crate::builders::{
    BuildConfig, BuildOptions, Builder, BuilderError, BuilderIdentifier, CacheOutputs,
    Capabilities, DevServerProcess, PrepareCacheOptions, ShouldServeOptions,
    StartDevServerOptions,
};
use crate::error::{DevError, Result};
use crate::runtime::{FunctionRuntime, RuntimeHandle};
use crate::types::{
    Artifact, BuilderOutputs, FileContent, FunctionArtifact, InvokePayload, InvokeResult,
    StaticFile,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type BuildFn = dyn Fn(&BuildOptions) -> std::result::Result<BuilderOutputs, BuilderError> + Send + Sync;
type ServeFn = dyn Fn(&ShouldServeOptions) -> bool + Send + Sync;

#[derive(Default)]
struct Counters {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Builder driven by a closure. Clones share their counters.
#[derive(Clone)]
pub(crate) struct FnBuilder {
    build: Arc<BuildFn>,
    serve: Option<Arc<ServeFn>>,
    dev_server_port: Option<u16>,
    capabilities: Capabilities,
    defaults: BuildConfig,
    delay: Duration,
    slow: Arc<HashMap<String, Duration>>,
    cache: Option<Arc<CacheOutputs>>,
    counters: Arc<Counters>,
}

impl FnBuilder {
    pub(crate) fn new(
        build: impl Fn(&BuildOptions) -> std::result::Result<BuilderOutputs, BuilderError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            build: Arc::new(build),
            serve: None,
            dev_server_port: None,
            capabilities: Capabilities::build_only(),
            defaults: BuildConfig::new(),
            delay: Duration::ZERO,
            slow: Arc::default(),
            cache: None,
            counters: Arc::default(),
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(|_| Ok(BuilderOutputs::new()))
    }

    pub(crate) fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub(crate) fn with_defaults(mut self, defaults: BuildConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Builds of `entrypoint` take `delay` instead of the common delay.
    pub(crate) fn slow_for(mut self, entrypoint: &str, delay: Duration) -> Self {
        Arc::make_mut(&mut self.slow).insert(entrypoint.to_string(), delay);
        self
    }

    /// Answers `prepareCache` with one in-memory file per `(name, content)`.
    pub(crate) fn with_cache(mut self, files: &[(&str, &str)]) -> Self {
        let outputs = files
            .iter()
            .map(|(name, content)| {
                (name.to_string(), FileContent::Bytes(content.as_bytes().to_vec()))
            })
            .collect();
        self.cache = Some(Arc::new(outputs));
        self.capabilities.prepare_cache = true;
        self
    }

    pub(crate) fn serving(
        mut self,
        serve: impl Fn(&ShouldServeOptions) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.serve = Some(Arc::new(serve));
        self.capabilities.should_serve = true;
        self
    }

    /// Reports a dev server on `port` without spawning anything.
    pub(crate) fn with_dev_server(mut self, port: u16) -> Self {
        self.dev_server_port = Some(port);
        self.capabilities.start_dev_server = true;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Builder for FnBuilder {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn default_config(&self) -> BuildConfig {
        self.defaults.clone()
    }

    async fn build(&self, opts: BuildOptions) -> std::result::Result<BuilderOutputs, BuilderError> {
        let c = &self.counters;
        c.calls.fetch_add(1, Ordering::SeqCst);
        let now = c.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        c.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self.slow.get(&opts.entrypoint).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = (self.build)(&opts);
        c.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn prepare_cache(
        &self,
        _opts: PrepareCacheOptions,
    ) -> std::result::Result<CacheOutputs, BuilderError> {
        match &self.cache {
            Some(cache) => Ok(cache.as_ref().clone()),
            None => Err(BuilderError::Unsupported("prepareCache")),
        }
    }

    async fn should_serve(&self, opts: ShouldServeOptions) -> std::result::Result<bool, BuilderError> {
        match &self.serve {
            Some(serve) => Ok(serve(&opts)),
            None => Err(BuilderError::Unsupported("shouldServe")),
        }
    }

    async fn start_dev_server(
        &self,
        _opts: StartDevServerOptions,
    ) -> std::result::Result<DevServerProcess, BuilderError> {
        match self.dev_server_port {
            Some(port) => Ok(DevServerProcess::new(port, None)),
            None => Err(BuilderError::Unsupported("startDevServer")),
        }
    }
}

/// Installer backed by a fixed map, counting installs per name.
#[derive(Default)]
pub(crate) struct MapInstaller {
    builders: HashMap<String, (String, FnBuilder)>,
    installs: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
}

impl MapInstaller {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, name: &str, version: &str, builder: FnBuilder) -> Self {
        self.builders
            .insert(name.to_string(), (version.to_string(), builder));
        self
    }

    pub(crate) fn fail_next(&self, name: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .insert(name.to_string());
    }

    pub(crate) fn installs(&self, name: &str) -> usize {
        self.installs
            .lock()
            .expect("installs lock")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl BuilderInstaller for MapInstaller {
    async fn install(&self, identifier: &BuilderIdentifier) -> Result<BuilderDescriptor> {
        *self
            .installs
            .lock()
            .expect("installs lock")
            .entry(identifier.name.clone())
            .or_default() += 1;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let not_found = |reason: &str| DevError::BuilderNotFound {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        };
        if self
            .failing
            .lock()
            .expect("failing lock")
            .remove(&identifier.name)
        {
            return Err(not_found("registry unavailable"));
        }
        let (version, builder) = self
            .builders
            .get(&identifier.name)
            .ok_or_else(|| not_found("unknown builder"))?;
        Ok(BuilderDescriptor::new(
            identifier.clone(),
            version.clone(),
            Arc::new(builder.clone()),
        ))
    }
}

struct MockInstance {
    handler: String,
    env: BTreeMap<String, String>,
}

/// In-memory runtime. Invocations answer with the handler name and the
/// request line; handlers named `crash` fail.
#[derive(Default)]
pub(crate) struct MockRuntime {
    next_id: AtomicU64,
    created: AtomicUsize,
    live: Mutex<BTreeMap<u64, MockInstance>>,
    envs: Mutex<BTreeMap<u64, BTreeMap<String, String>>>,
    destroyed: Mutex<HashSet<u64>>,
    failing: Mutex<HashSet<String>>,
    failing_destroys: AtomicUsize,
    destroy_attempts: AtomicUsize,
    create_delay: Mutex<Duration>,
}

impl MockRuntime {
    /// The next `count` destroy calls fail.
    pub(crate) fn fail_destroys(&self, count: usize) {
        self.failing_destroys.store(count, Ordering::SeqCst);
    }

    pub(crate) fn destroy_attempts(&self) -> usize {
        self.destroy_attempts.load(Ordering::SeqCst)
    }

    /// Each create takes `delay` before the instance exists.
    pub(crate) fn slow_create(&self, delay: Duration) {
        *self.create_delay.lock().expect("delay lock") = delay;
    }

    pub(crate) fn fail_handler(&self, handler: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .insert(handler.to_string());
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn live(&self) -> usize {
        self.live.lock().expect("live lock").len()
    }

    pub(crate) fn was_destroyed(&self, id: u64) -> bool {
        self.destroyed.lock().expect("destroyed lock").contains(&id)
    }

    pub(crate) fn env_of(&self, id: u64) -> Option<BTreeMap<String, String>> {
        self.envs.lock().expect("envs lock").get(&id).cloned()
    }
}

#[async_trait]
impl FunctionRuntime for MockRuntime {
    async fn create(
        &self,
        artifact: &FunctionArtifact,
        env: &BTreeMap<String, String>,
    ) -> Result<RuntimeHandle> {
        if self
            .failing
            .lock()
            .expect("failing lock")
            .contains(&artifact.handler)
        {
            return Err(DevError::provision(&artifact.runtime, "refused by test"));
        }
        let delay = *self.create_delay.lock().expect("delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.fetch_add(1, Ordering::SeqCst);
        self.envs.lock().expect("envs lock").insert(id, env.clone());
        self.live.lock().expect("live lock").insert(
            id,
            MockInstance {
                handler: artifact.handler.clone(),
                env: env.clone(),
            },
        );
        Ok(RuntimeHandle {
            id,
            runtime: artifact.runtime.clone(),
            handler: artifact.handler.clone(),
        })
    }

    async fn invoke(&self, handle: &RuntimeHandle, payload: &InvokePayload) -> Result<InvokeResult> {
        let (handler, region) = {
            let live = self.live.lock().expect("live lock");
            let instance = live
                .get(&handle.id)
                .ok_or_else(|| DevError::invocation("destroyed"))?;
            (
                instance.handler.clone(),
                instance.env.get("DEVHOST_REGION").cloned().unwrap_or_default(),
            )
        };
        if handler == "crash" {
            return Err(DevError::invocation("handler crashed"));
        }
        let mut headers = BTreeMap::new();
        headers.insert("x-handler".to_string(), handler.clone());
        headers.insert("x-region".to_string(), region);
        Ok(InvokeResult {
            status_code: 200,
            headers,
            encoding: payload.encoding.clone(),
            body: Some(match &payload.body {
                Some(body) => body.clone(),
                None => format!("{handler} {} {}", payload.method, payload.path),
            }),
        })
    }

    async fn destroy(&self, handle: &RuntimeHandle) -> Result<()> {
        self.destroy_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_destroys
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DevError::provision(&handle.runtime, "instance busy"));
        }
        self.live.lock().expect("live lock").remove(&handle.id);
        self.destroyed.lock().expect("destroyed lock").insert(handle.id);
        Ok(())
    }
}

/// A function artifact with a zero-filled payload of `size` bytes.
pub(crate) fn function(handler: &str, size: usize) -> Artifact {
    let mut environment = BTreeMap::new();
    environment.insert("SHARED".to_string(), "artifact".to_string());
    Artifact::Function(FunctionArtifact {
        payload: vec![0; size],
        handler: handler.to_string(),
        runtime: "provided".to_string(),
        environment,
    })
}

pub(crate) fn static_bytes(content: &str) -> Artifact {
    Artifact::Static(StaticFile::from_bytes(content, None))
}

/// Scratch project with the given `(relative path, content)` files.
pub(crate) fn project(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for (rel, content) in files {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, content).expect("write");
    }
    dir
}

/// Writes an executable `devhost-builder-<name>` shell script into `dir`.
#[cfg(unix)]
pub(crate) fn fake_builder(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(crate::builder_cache::DefaultInstaller::executable_name(name));
    fs::write(&path, format!("#!/bin/sh\n{script}")).expect("write builder");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}
