use crate::files::FileSnapshot;
use crate::pattern::GlobPattern;
use crate::types::{Artifact, BuilderOutputs, FileContent, FunctionArtifact, StaticFile};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Child;

/// Builder-specific configuration, merged from builder defaults and the
/// project's `builds[].config`.
pub type BuildConfig = Map<String, Value>;

/// Files a builder wants kept between builds.
pub type CacheOutputs = BTreeMap<String, FileContent>;

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("{0}")]
    Failed(String),
    #[error("operation `{0}` is not supported by this builder")]
    Unsupported(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("builder protocol error: {0}")]
    Protocol(String),
}

/// Which operations of the builder contract a builder provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub build: bool,
    pub prepare_cache: bool,
    pub should_serve: bool,
    pub start_dev_server: bool,
}

impl Capabilities {
    pub const fn build_only() -> Self {
        Self {
            build: true,
            prepare_cache: false,
            should_serve: false,
            start_dev_server: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub files: FileSnapshot,
    pub entrypoint: String,
    pub work_path: PathBuf,
    pub config: BuildConfig,
    pub is_dev: bool,
}

#[derive(Debug, Clone)]
pub struct PrepareCacheOptions {
    pub files: FileSnapshot,
    pub entrypoint: String,
    pub work_path: PathBuf,
    pub config: BuildConfig,
}

#[derive(Debug, Clone)]
pub struct ShouldServeOptions {
    pub entrypoint: String,
    pub request_path: String,
    pub work_path: PathBuf,
    pub config: BuildConfig,
}

#[derive(Debug, Clone)]
pub struct StartDevServerOptions {
    pub entrypoint: String,
    pub work_path: PathBuf,
    pub config: BuildConfig,
    pub env: BTreeMap<String, String>,
}

/// A builder-owned server process that answers requests for one entrypoint.
#[derive(Debug)]
pub struct DevServerProcess {
    pub port: u16,
    child: Option<Child>,
}

impl DevServerProcess {
    pub fn new(port: u16, child: Option<Child>) -> Self {
        Self { port, child }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    pub async fn stop(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.child = None;
    }
}

/// The builder contract. Only [`Builder::build`] is mandatory; callers check
/// [`Builder::capabilities`] before using the optional operations.
#[async_trait]
pub trait Builder: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Defaults the project's build config is layered over.
    fn default_config(&self) -> BuildConfig {
        BuildConfig::new()
    }

    async fn build(&self, opts: BuildOptions) -> Result<BuilderOutputs, BuilderError>;

    async fn prepare_cache(&self, _opts: PrepareCacheOptions) -> Result<CacheOutputs, BuilderError> {
        Err(BuilderError::Unsupported("prepareCache"))
    }

    async fn should_serve(&self, _opts: ShouldServeOptions) -> Result<bool, BuilderError> {
        Err(BuilderError::Unsupported("shouldServe"))
    }

    async fn start_dev_server(
        &self,
        _opts: StartDevServerOptions,
    ) -> Result<DevServerProcess, BuilderError> {
        Err(BuilderError::Unsupported("startDevServer"))
    }
}

/// A builder reference as written in `builds[].use`, e.g. `@devhost/static@1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuilderIdentifier {
    pub name: String,
    pub version: Option<String>,
}

impl BuilderIdentifier {
    /// # Examples
    ///
    /// ```
    /// use devhost_core::builders::BuilderIdentifier;
    ///
    /// let id = BuilderIdentifier::parse("@devhost/static@1.2").unwrap();
    /// assert_eq!(id.name, "@devhost/static");
    /// assert_eq!(id.version.as_deref(), Some("1.2"));
    /// assert!(BuilderIdentifier::parse("").is_none());
    /// ```
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let search_from = usize::from(raw.starts_with('@'));
        let (name, version) = match raw[search_from..].find('@') {
            Some(idx) => {
                let at = idx + search_from;
                (&raw[..at], Some(raw[at + 1..].to_string()))
            }
            None => (raw, None),
        };
        let valid = !name.is_empty()
            && name != "@"
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '/' | '.' | '_' | '-'));
        if !valid || version.as_deref() == Some("") {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            version,
        })
    }

    /// Whether an installed version satisfies the requested one. A request
    /// of `1` accepts `1.4.0`; `latest` or no request accepts anything.
    pub fn accepts(&self, installed: &str) -> bool {
        match self.version.as_deref() {
            None | Some("latest") => true,
            Some(wanted) => {
                installed == wanted
                    || installed
                        .strip_prefix(wanted)
                        .is_some_and(|rest| rest.starts_with('.'))
            }
        }
    }
}

impl fmt::Display for BuilderIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// Serves each entrypoint as-is.
#[derive(Debug, Clone, Default)]
pub struct StaticBuilder;

impl StaticBuilder {
    pub const NAME: &'static str = "@devhost/static";
}

#[async_trait]
impl Builder for StaticBuilder {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            should_serve: true,
            ..Capabilities::build_only()
        }
    }

    async fn build(&self, opts: BuildOptions) -> Result<BuilderOutputs, BuilderError> {
        let file = opts.files.get(&opts.entrypoint).ok_or_else(|| {
            BuilderError::Failed(format!("entrypoint `{}` is not a project file", opts.entrypoint))
        })?;
        let mut artifact = StaticFile::from_path(file.fs_path.clone());
        artifact.mode = file.mode;
        artifact.content_type = opts
            .config
            .get("contentType")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let mut output = BuilderOutputs::new();
        output.insert(opts.entrypoint, Artifact::Static(artifact));
        Ok(output)
    }

    async fn should_serve(&self, opts: ShouldServeOptions) -> Result<bool, BuilderError> {
        Ok(opts.request_path.trim_start_matches('/') == opts.entrypoint)
    }
}

/// Packages an executable script (plus `includeFiles`) into a function.
///
/// The function is served at the entrypoint path without its extension, so
/// `api/hello.sh` answers `/api/hello`.
#[derive(Debug, Clone, Default)]
pub struct ExecBuilder;

impl ExecBuilder {
    pub const NAME: &'static str = "@devhost/exec";
    pub const DEFAULT_RUNTIME: &'static str = "provided";
}

#[async_trait]
impl Builder for ExecBuilder {
    fn capabilities(&self) -> Capabilities {
        Capabilities::build_only()
    }

    fn default_config(&self) -> BuildConfig {
        let mut cfg = BuildConfig::new();
        cfg.insert("runtime".to_string(), Value::from(Self::DEFAULT_RUNTIME));
        cfg
    }

    async fn build(&self, opts: BuildOptions) -> Result<BuilderOutputs, BuilderError> {
        let file = opts.files.get(&opts.entrypoint).ok_or_else(|| {
            BuilderError::Failed(format!("entrypoint `{}` is not a project file", opts.entrypoint))
        })?;
        let runtime = opts
            .config
            .get("runtime")
            .and_then(Value::as_str)
            .unwrap_or(Self::DEFAULT_RUNTIME)
            .to_string();
        let base_name = opts
            .entrypoint
            .rsplit('/')
            .next()
            .unwrap_or(&opts.entrypoint)
            .to_string();
        let handler = match opts.config.get("handler").and_then(Value::as_str) {
            Some(handler) => handler.to_string(),
            None if runtime.starts_with("provided") => base_name.clone(),
            None => format!("{}.handler", strip_extension(&base_name)),
        };

        let mut entries = vec![PayloadEntry {
            path: base_name,
            data: tokio::fs::read(&file.fs_path).await?,
            mode: 0o755,
        }];
        for pattern in include_patterns(&opts.config)? {
            for (rel, extra) in opts.files.iter().filter(|(rel, _)| pattern.is_match(rel)) {
                if *rel == opts.entrypoint {
                    continue;
                }
                entries.push(PayloadEntry {
                    path: rel.clone(),
                    data: tokio::fs::read(&extra.fs_path).await?,
                    mode: extra.mode & 0o777,
                });
            }
        }

        let payload = pack_payload(&entries)?;
        tokio::fs::write(opts.work_path.join("payload.tar"), &payload).await?;

        let environment = opts
            .config
            .get("environment")
            .and_then(Value::as_object)
            .map(|env| {
                env.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let mut output = BuilderOutputs::new();
        output.insert(
            strip_extension(&opts.entrypoint).to_string(),
            Artifact::Function(FunctionArtifact {
                payload,
                handler,
                runtime,
                environment,
            }),
        );
        Ok(output)
    }
}

fn include_patterns(config: &BuildConfig) -> Result<Vec<GlobPattern>, BuilderError> {
    let raw: Vec<&str> = match config.get("includeFiles") {
        Some(Value::String(one)) => vec![one.as_str()],
        Some(Value::Array(many)) => many.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|p| {
            GlobPattern::new(p)
                .map_err(|e| BuilderError::Failed(format!("invalid includeFiles glob {p:?}: {e}")))
        })
        .collect()
}

fn strip_extension(path: &str) -> &str {
    let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => &path[..name_start + dot],
        _ => path,
    }
}

/// One file inside a function payload.
#[derive(Debug, Clone)]
pub struct PayloadEntry {
    pub path: String,
    pub data: Vec<u8>,
    pub mode: u32,
}

/// Packs files into the tar archive used as a function payload.
///
/// Headers carry no timestamps, so identical inputs produce identical bytes.
pub fn pack_payload(entries: &[PayloadEntry]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(entry.data.len() as u64);
        header.set_mode(entry.mode);
        archive.append_data(&mut header, &entry.path, entry.data.as_slice())?;
    }
    archive.into_inner()
}

#[cfg(feature = "external-builders")]
pub use external::ExternalBuilder;

#[cfg(feature = "external-builders")]
mod external {
    use super::*;
    use serde_json::json;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::process::{ChildStdin, Command};
    use tracing::debug;

    const DEV_SERVER_STARTUP: Duration = Duration::from_secs(30);

    /// A builder implemented by an executable speaking JSON over stdio.
    #[derive(Debug, Clone)]
    pub struct ExternalBuilder {
        program: PathBuf,
        version: String,
        capabilities: Capabilities,
        defaults: BuildConfig,
    }

    #[derive(Debug, Deserialize)]
    struct Manifest {
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        capabilities: Capabilities,
        #[serde(default)]
        config: BuildConfig,
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type", rename_all = "lowercase")]
    enum ExternalOutput {
        Static {
            #[serde(rename = "fsPath")]
            fs_path: PathBuf,
            #[serde(rename = "contentType", default)]
            content_type: Option<String>,
        },
        Function {
            #[serde(rename = "payloadPath")]
            payload_path: PathBuf,
            handler: String,
            runtime: String,
            #[serde(default)]
            environment: BTreeMap<String, String>,
        },
    }

    impl ExternalBuilder {
        /// Probes `program` for its manifest.
        pub async fn load(program: PathBuf) -> Result<Self, BuilderError> {
            let reply = call(&program, &json!({ "operation": "capabilities" })).await?;
            let manifest: Manifest = serde_json::from_value(reply)
                .map_err(|e| BuilderError::Protocol(format!("bad capabilities reply: {e}")))?;
            Ok(Self {
                program,
                version: manifest.version.unwrap_or_else(|| "0.0.0".to_string()),
                capabilities: manifest.capabilities,
                defaults: manifest.config,
            })
        }

        pub fn version(&self) -> &str {
            &self.version
        }

        pub fn program(&self) -> &Path {
            &self.program
        }
    }

    fn file_map(files: &FileSnapshot) -> BTreeMap<&str, String> {
        files
            .iter()
            .map(|(rel, file)| (rel.as_str(), file.fs_path.to_string_lossy().into_owned()))
            .collect()
    }

    fn resolve(work_path: &Path, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            work_path.join(path)
        }
    }

    #[async_trait]
    impl Builder for ExternalBuilder {
        fn capabilities(&self) -> Capabilities {
            self.capabilities
        }

        fn default_config(&self) -> BuildConfig {
            self.defaults.clone()
        }

        async fn build(&self, opts: BuildOptions) -> Result<BuilderOutputs, BuilderError> {
            let request = json!({
                "operation": "build",
                "files": file_map(&opts.files),
                "entrypoint": opts.entrypoint,
                "workPath": opts.work_path,
                "config": opts.config,
                "isDev": opts.is_dev,
            });
            let reply = call(&self.program, &request).await?;
            let raw: BTreeMap<String, ExternalOutput> = reply
                .get("output")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| BuilderError::Protocol(format!("bad build output: {e}")))?
                .unwrap_or_default();

            let mut output = BuilderOutputs::new();
            for (path, item) in raw {
                let artifact = match item {
                    ExternalOutput::Static {
                        fs_path,
                        content_type,
                    } => Artifact::Static(StaticFile {
                        content: FileContent::Path(resolve(&opts.work_path, fs_path)),
                        content_type,
                        mode: 0o100644,
                    }),
                    ExternalOutput::Function {
                        payload_path,
                        handler,
                        runtime,
                        environment,
                    } => Artifact::Function(FunctionArtifact {
                        payload: tokio::fs::read(resolve(&opts.work_path, payload_path)).await?,
                        handler,
                        runtime,
                        environment,
                    }),
                };
                output.insert(path.trim_start_matches('/').to_string(), artifact);
            }
            Ok(output)
        }

        async fn prepare_cache(
            &self,
            opts: PrepareCacheOptions,
        ) -> Result<CacheOutputs, BuilderError> {
            if !self.capabilities.prepare_cache {
                return Err(BuilderError::Unsupported("prepareCache"));
            }
            let request = json!({
                "operation": "prepareCache",
                "files": file_map(&opts.files),
                "entrypoint": opts.entrypoint,
                "workPath": opts.work_path,
                "config": opts.config,
            });
            let reply = call(&self.program, &request).await?;
            let raw: BTreeMap<String, PathBuf> = reply
                .get("output")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| BuilderError::Protocol(format!("bad cache output: {e}")))?
                .unwrap_or_default();
            Ok(raw
                .into_iter()
                .map(|(k, v)| (k, FileContent::Path(resolve(&opts.work_path, v))))
                .collect())
        }

        async fn should_serve(&self, opts: ShouldServeOptions) -> Result<bool, BuilderError> {
            if !self.capabilities.should_serve {
                return Err(BuilderError::Unsupported("shouldServe"));
            }
            let request = json!({
                "operation": "shouldServe",
                "entrypoint": opts.entrypoint,
                "requestPath": opts.request_path,
                "workPath": opts.work_path,
                "config": opts.config,
            });
            let reply = call(&self.program, &request).await?;
            reply
                .get("result")
                .and_then(Value::as_bool)
                .ok_or_else(|| BuilderError::Protocol("missing boolean `result`".to_string()))
        }

        async fn start_dev_server(
            &self,
            opts: StartDevServerOptions,
        ) -> Result<DevServerProcess, BuilderError> {
            if !self.capabilities.start_dev_server {
                return Err(BuilderError::Unsupported("startDevServer"));
            }
            let request = json!({
                "operation": "startDevServer",
                "entrypoint": opts.entrypoint,
                "workPath": opts.work_path,
                "config": opts.config,
            });
            let mut child = Command::new(&self.program)
                .envs(&opts.env)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| BuilderError::Protocol("dev server stdin unavailable".to_string()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| BuilderError::Protocol("dev server stdout unavailable".to_string()))?;
            let mut lines = BufReader::new(stdout).lines();
            let banner = async {
                let (written, first) =
                    tokio::join!(send_request(stdin, &request), lines.next_line());
                written?;
                first
            };
            let first = tokio::time::timeout(DEV_SERVER_STARTUP, banner)
                .await
                .map_err(|_| BuilderError::Failed("dev server did not report a port".to_string()))??
                .ok_or_else(|| BuilderError::Protocol("dev server exited early".to_string()))?;
            let port = serde_json::from_str::<Value>(&first)
                .ok()
                .and_then(|v| v.get("port").and_then(Value::as_u64))
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| BuilderError::Protocol(format!("bad dev server banner: {first}")))?;
            debug!("builder dev server for {} on port {port}", opts.entrypoint);
            Ok(DevServerProcess::new(port, Some(child)))
        }
    }

    /// Writes the request and closes stdin. A builder that exits without
    /// reading its input is not an error here; its exit status decides.
    async fn send_request(mut stdin: ChildStdin, request: &Value) -> std::io::Result<()> {
        match stdin.write_all(request.to_string().as_bytes()).await {
            Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => Err(err),
            _ => Ok(()),
        }
    }

    async fn call(program: &Path, request: &Value) -> Result<Value, BuilderError> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BuilderError::Protocol("builder stdin unavailable".to_string()))?;
        // stdout is drained while the request is still being written.
        let (written, output) = tokio::join!(send_request(stdin, request), child.wait_with_output());
        let output = output?;
        written?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            debug!(target: "devhost::builder", "{line}");
        }
        if !output.status.success() {
            return Err(BuilderError::Failed(format!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                stderr.trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| BuilderError::Protocol(format!("reply is not JSON: {e}")))
    }
}
