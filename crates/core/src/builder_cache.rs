//! Resolution and memoization of builders named in the project config.

use crate::builders::{
    BuildConfig, Builder, BuilderIdentifier, Capabilities, ExecBuilder, StaticBuilder,
};
use crate::error::{parse_size, DevError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::info;

/// An installed builder ready for use.
pub struct BuilderDescriptor {
    pub identifier: BuilderIdentifier,
    pub version: String,
    pub builder: Arc<dyn Builder>,
}

impl BuilderDescriptor {
    pub fn new(identifier: BuilderIdentifier, version: impl Into<String>, builder: Arc<dyn Builder>) -> Self {
        Self {
            identifier,
            version: version.into(),
            builder,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.builder.capabilities()
    }

    pub fn default_config(&self) -> BuildConfig {
        self.builder.default_config()
    }

    /// `maxLambdaSize` declared in the builder defaults, if any.
    pub fn max_lambda_size(&self) -> Option<u64> {
        match self.default_config().get("maxLambdaSize")? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => parse_size(s),
            _ => None,
        }
    }
}

impl std::fmt::Debug for BuilderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderDescriptor")
            .field("identifier", &self.identifier.to_string())
            .field("version", &self.version)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Source of builders. The cache calls it at most once per successful
/// identifier.
#[async_trait]
pub trait BuilderInstaller: Send + Sync {
    async fn install(&self, identifier: &BuilderIdentifier) -> Result<BuilderDescriptor>;
}

/// Installs the built-in builders and, with the `external-builders`
/// feature, `devhost-builder-<name>` executables found on disk.
#[derive(Debug, Clone, Default)]
pub struct DefaultInstaller {
    search_dirs: Vec<PathBuf>,
}

impl DefaultInstaller {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    /// Executable name for an external builder: `@scope/name` becomes
    /// `devhost-builder-scope-name`.
    pub fn executable_name(name: &str) -> String {
        format!(
            "devhost-builder-{}",
            name.trim_start_matches('@').replace('/', "-")
        )
    }

    #[cfg_attr(not(feature = "external-builders"), allow(dead_code))]
    fn find_executable(&self, name: &str) -> Option<PathBuf> {
        let file = Self::executable_name(name);
        let path_dirs = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
            .unwrap_or_default();
        self.search_dirs
            .iter()
            .chain(path_dirs.iter())
            .map(|dir| dir.join(&file))
            .find(|candidate| candidate.is_file())
    }
}

#[async_trait]
impl BuilderInstaller for DefaultInstaller {
    async fn install(&self, identifier: &BuilderIdentifier) -> Result<BuilderDescriptor> {
        let builtin: Option<Arc<dyn Builder>> = match identifier.name.as_str() {
            StaticBuilder::NAME => Some(Arc::new(StaticBuilder)),
            ExecBuilder::NAME => Some(Arc::new(ExecBuilder)),
            _ => None,
        };
        if let Some(builder) = builtin {
            return Ok(BuilderDescriptor::new(
                identifier.clone(),
                env!("CARGO_PKG_VERSION"),
                builder,
            ));
        }

        #[cfg(feature = "external-builders")]
        if let Some(program) = self.find_executable(&identifier.name) {
            tracing::debug!("loading external builder from {}", program.display());
            let external = crate::builders::ExternalBuilder::load(program)
                .await
                .map_err(|e| DevError::BuilderNotFound {
                    identifier: identifier.to_string(),
                    reason: e.to_string(),
                })?;
            let version = external.version().to_string();
            return Ok(BuilderDescriptor::new(
                identifier.clone(),
                version,
                Arc::new(external),
            ));
        }

        Err(DevError::BuilderNotFound {
            identifier: identifier.to_string(),
            reason: format!(
                "no built-in builder or `{}` executable",
                Self::executable_name(&identifier.name)
            ),
        })
    }
}

type Slot = Arc<OnceCell<Arc<BuilderDescriptor>>>;

/// Memoizes installed builders per identifier for the whole session.
///
/// Concurrent requests for one identifier share a single installation.
/// Failed installations are not remembered, so a later request retries.
pub struct BuilderCache {
    installer: Arc<dyn BuilderInstaller>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl BuilderCache {
    pub fn new(installer: Arc<dyn BuilderInstaller>) -> Self {
        Self {
            installer,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, raw: &str) -> Result<Arc<BuilderDescriptor>> {
        let identifier = BuilderIdentifier::parse(raw).ok_or_else(|| DevError::BuilderNotFound {
            identifier: raw.to_string(),
            reason: "not a valid builder identifier".to_string(),
        })?;
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(identifier.to_string()).or_default().clone()
        };
        let descriptor = slot
            .get_or_try_init(|| self.install(&identifier))
            .await?;
        Ok(descriptor.clone())
    }

    /// Resolves several identifiers concurrently, keeping input order.
    pub async fn resolve_all(&self, raw: &[String]) -> Vec<Result<Arc<BuilderDescriptor>>> {
        futures::future::join_all(raw.iter().map(|id| self.resolve(id))).await
    }

    /// Builders installed so far, sorted by identifier.
    pub fn installed(&self) -> Vec<Arc<BuilderDescriptor>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = slots.values().filter_map(|s| s.get().cloned()).collect();
        out.sort_by_key(|d| d.identifier.to_string());
        out
    }

    async fn install(&self, identifier: &BuilderIdentifier) -> Result<Arc<BuilderDescriptor>> {
        let descriptor = self.installer.install(identifier).await?;
        if !identifier.accepts(&descriptor.version) {
            return Err(DevError::BuilderNotFound {
                identifier: identifier.to_string(),
                reason: format!("installed version {} does not match", descriptor.version),
            });
        }
        if !descriptor.capabilities().build {
            return Err(DevError::BuilderContract {
                identifier: identifier.to_string(),
                missing: "build",
            });
        }
        info!("builder {} ready (version {})", identifier, descriptor.version);
        Ok(Arc::new(descriptor))
    }
}
