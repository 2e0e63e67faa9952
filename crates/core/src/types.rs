use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One source file on disk.
///
/// Carries enough metadata to notice a change and to derive a stable work
/// directory key. Never mutated; a rebuild stats the file again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub fs_path: PathBuf,
    pub dev: u64,
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub modified: Option<SystemTime>,
}

impl FileRef {
    pub fn from_metadata(fs_path: PathBuf, meta: &Metadata) -> Self {
        #[cfg(unix)]
        let (dev, ino, mode) = {
            use std::os::unix::fs::MetadataExt;
            (meta.dev(), meta.ino(), meta.mode())
        };
        #[cfg(not(unix))]
        let (dev, ino, mode) = (0, 0, if meta.permissions().readonly() { 0o100444 } else { 0o100644 });

        Self {
            fs_path,
            dev,
            ino,
            size: meta.len(),
            mode,
            modified: meta.modified().ok(),
        }
    }

    /// Stats `path` and wraps the result.
    pub fn stat(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self::from_metadata(path.to_path_buf(), &meta))
    }

    /// Key of the work directory for builds of this file.
    ///
    /// Device and inode survive renames within one run. File systems without
    /// inode numbers fall back to a digest of the absolute path and mtime.
    pub fn cache_key(&self) -> String {
        if self.ino != 0 {
            return format!("{}-{}", self.dev, self.ino);
        }
        let mut hasher = Sha256::new();
        hasher.update(self.fs_path.to_string_lossy().as_bytes());
        let nanos = self
            .modified
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        hasher.update(nanos.to_le_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("h{}", &digest[..16])
    }

    /// True when both refs describe the same on-disk revision.
    pub fn same_revision(&self, other: &FileRef) -> bool {
        self.dev == other.dev
            && self.ino == other.ino
            && self.size == other.size
            && self.mode == other.mode
            && self.modified == other.modified
    }
}

/// Where the bytes of a static artifact live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl FileContent {
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        match self {
            FileContent::Path(path) => tokio::fs::read(path).await,
            FileContent::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFile {
    pub content: FileContent,
    pub content_type: Option<String>,
    pub mode: u32,
}

impl StaticFile {
    pub fn from_path(path: PathBuf) -> Self {
        Self {
            content: FileContent::Path(path),
            content_type: None,
            mode: 0o100644,
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        Self {
            content: FileContent::Bytes(bytes.into()),
            content_type: content_type.map(ToString::to_string),
            mode: 0o100644,
        }
    }
}

/// A packaged executable function produced by a builder.
///
/// `payload` is a tar archive holding the handler and its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionArtifact {
    pub payload: Vec<u8>,
    pub handler: String,
    pub runtime: String,
    pub environment: BTreeMap<String, String>,
}

impl FunctionArtifact {
    pub fn packaged_size(&self) -> u64 {
        self.payload.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Static(StaticFile),
    Function(FunctionArtifact),
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Static(_) => "static",
            Artifact::Function(_) => "function",
        }
    }
}

/// Builder output keyed by served path (no leading slash).
pub type BuilderOutputs = BTreeMap<String, Artifact>;

/// Request handed to a function runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokePayload {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Response produced by a function runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResult {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonEnvelope {
    pub status: String,
    pub phase: String,
    pub message: String,
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub invoke_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { invoke_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BuilderSearchConfig {
    /// Extra directories searched for `devhost-builder-*` executables.
    pub dirs: Vec<String>,
}

/// Tool-level settings for a dev session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevConfig {
    pub listen: String,
    pub port: u16,
    /// Cache root; `<project>/.devhost/cache` when empty.
    pub cache_dir: String,
    pub project_file: String,
    pub log_level: String,
    pub timeouts: TimeoutConfig,
    pub watch: WatchConfig,
    pub builders: BuilderSearchConfig,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            port: 3000,
            cache_dir: String::new(),
            project_file: String::new(),
            log_level: "info".to_string(),
            timeouts: TimeoutConfig::default(),
            watch: WatchConfig::default(),
            builders: BuilderSearchConfig::default(),
        }
    }
}

impl DevConfig {
    pub fn cache_root(&self, project_root: &Path) -> PathBuf {
        if self.cache_dir.trim().is_empty() {
            project_root.join(".devhost").join("cache")
        } else {
            PathBuf::from(&self.cache_dir)
        }
    }
}
