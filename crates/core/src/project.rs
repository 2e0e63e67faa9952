use crate::builders::{BuildConfig, StaticBuilder};
use crate::error::{DevError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Project files tried in order when no explicit name is configured.
pub const PROJECT_FILES: &[&str] = &["devhost.json", "now.json"];

/// One `builds[]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub src: String,
    #[serde(rename = "use")]
    pub builder: String,
    #[serde(default)]
    pub config: BuildConfig,
}

impl BuildSpec {
    /// Used when the project declares no builds: serve every file as-is.
    pub fn implicit() -> Self {
        Self {
            src: "**".to_string(),
            builder: StaticBuilder::NAME.to_string(),
            config: BuildConfig::new(),
        }
    }
}

/// Contents of the project's `devhost.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    builds: Option<Vec<BuildSpec>>,
    /// Raw route entries, compiled by [`crate::routes::RouteTable::compile`].
    #[serde(default)]
    pub routes: Vec<Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl ProjectConfig {
    /// Loads the project file from `root`.
    ///
    /// `file_name` overrides the default lookup. A missing file yields the
    /// defaults; a malformed one is a [`DevError::ProjectConfig`].
    pub fn load(root: &Path, file_name: &str) -> Result<Self> {
        let candidates: Vec<&str> = if file_name.trim().is_empty() {
            PROJECT_FILES.to_vec()
        } else {
            vec![file_name]
        };

        for name in candidates {
            let path = root.join(name);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(DevError::fs(path, err)),
            };
            let mut config = Self::parse(&content)
                .map_err(|e| DevError::ProjectConfig(format!("{}: {e}", path.display())))?;
            info!("using project config {}", path.display());
            config.source = Some(path);
            return Ok(config);
        }

        debug!("no project config in {}, serving files as-is", root.display());
        Ok(Self::default())
    }

    pub fn parse(content: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Declared builds, or the implicit static build.
    pub fn builds(&self) -> Vec<BuildSpec> {
        match &self.builds {
            Some(builds) => builds.clone(),
            None => vec![BuildSpec::implicit()],
        }
    }
}
