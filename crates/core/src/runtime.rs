//! Local execution of function artifacts.
//!
//! A [`FunctionRuntime`] turns a packaged [`FunctionArtifact`] into a live
//! instance addressed by a [`RuntimeHandle`]. [`ProcessRuntime`] unpacks the
//! payload into a private directory and runs one process per invocation.

use crate::error::{DevError, Result};
use crate::types::{FunctionArtifact, InvokePayload, InvokeResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Environment variable carrying the region name functions run in.
pub const REGION_VAR: &str = "DEVHOST_REGION";
pub const LOCAL_REGION: &str = "dev1";

/// Reference to a live function instance. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeHandle {
    pub id: u64,
    pub runtime: String,
    pub handler: String,
}

#[async_trait]
pub trait FunctionRuntime: Send + Sync {
    async fn create(
        &self,
        artifact: &FunctionArtifact,
        env: &BTreeMap<String, String>,
    ) -> Result<RuntimeHandle>;

    async fn invoke(&self, handle: &RuntimeHandle, payload: &InvokePayload) -> Result<InvokeResult>;

    /// Releases the instance. Destroying an unknown or already destroyed
    /// handle succeeds.
    async fn destroy(&self, handle: &RuntimeHandle) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Launcher {
    Native(PathBuf),
    Node { module: PathBuf, export: String },
    Python { module: String, export: String },
    Deno { module: PathBuf, export: String },
}

const NODE_BOOTSTRAP: &str = r#"
const mod = require(process.env.DEVHOST_MODULE);
let input = '';
process.stdin.setEncoding('utf8');
process.stdin.on('data', (chunk) => { input += chunk; });
process.stdin.on('end', async () => {
  const out = await mod[process.env.DEVHOST_EXPORT](JSON.parse(input));
  process.stdout.write('\n' + JSON.stringify(out) + '\n');
});
"#;

const PYTHON_BOOTSTRAP: &str = r#"
import importlib, json, os, sys
sys.path.insert(0, os.getcwd())
mod = importlib.import_module(os.environ["DEVHOST_MODULE"])
out = getattr(mod, os.environ["DEVHOST_EXPORT"])(json.loads(sys.stdin.read()))
sys.stdout.write("\n" + json.dumps(out) + "\n")
"#;

const DENO_BOOTSTRAP: &str = r#"
const mod = await import(Deno.env.get("DEVHOST_MODULE"));
const input = await new Response(Deno.stdin.readable).text();
const out = await mod[Deno.env.get("DEVHOST_EXPORT")](JSON.parse(input));
console.log("\n" + JSON.stringify(out));
"#;

impl Launcher {
    fn resolve(runtime: &str, handler: &str, dir: &Path) -> Result<Self> {
        if runtime == "provided" || runtime.starts_with("provided.") {
            let path = dir.join(handler);
            if !path.is_file() {
                return Err(DevError::provision(
                    runtime,
                    format!("handler `{handler}` is not in the payload"),
                ));
            }
            return Ok(Launcher::Native(path));
        }

        let (module, export) = handler.rsplit_once('.').ok_or_else(|| {
            DevError::provision(runtime, format!("handler `{handler}` must look like `file.export`"))
        })?;
        let find = |exts: &[&str]| {
            exts.iter()
                .map(|ext| dir.join(format!("{module}.{ext}")))
                .find(|p| p.is_file())
                .ok_or_else(|| {
                    DevError::provision(runtime, format!("module `{module}` is not in the payload"))
                })
        };
        let export = export.to_string();

        if runtime.starts_with("nodejs") {
            Ok(Launcher::Node {
                module: find(&["js", "cjs", "mjs"])?,
                export,
            })
        } else if runtime.starts_with("python3") {
            find(&["py"])?;
            Ok(Launcher::Python {
                module: module.replace('/', "."),
                export,
            })
        } else if runtime == "deno" {
            Ok(Launcher::Deno {
                module: find(&["ts", "js"])?,
                export,
            })
        } else {
            Err(DevError::provision(runtime, "unknown runtime"))
        }
    }

    fn command(&self) -> Command {
        match self {
            Launcher::Native(path) => Command::new(path),
            Launcher::Node { module, export } => {
                let mut cmd = Command::new("node");
                cmd.arg("-e")
                    .arg(NODE_BOOTSTRAP)
                    .env("DEVHOST_MODULE", module)
                    .env("DEVHOST_EXPORT", export);
                cmd
            }
            Launcher::Python { module, export } => {
                let mut cmd = Command::new("python3");
                cmd.arg("-c")
                    .arg(PYTHON_BOOTSTRAP)
                    .env("DEVHOST_MODULE", module)
                    .env("DEVHOST_EXPORT", export);
                cmd
            }
            Launcher::Deno { module, export } => {
                let mut cmd = Command::new("deno");
                let url = url::Url::from_file_path(module)
                    .map(String::from)
                    .unwrap_or_else(|_| module.display().to_string());
                cmd.arg("eval")
                    .arg(DENO_BOOTSTRAP)
                    .env("DEVHOST_MODULE", url)
                    .env("DEVHOST_EXPORT", export);
                cmd
            }
        }
    }
}

struct Instance {
    dir: TempDir,
    launcher: Launcher,
    handler: String,
    env: BTreeMap<String, String>,
}

/// Runs functions as short-lived local processes.
pub struct ProcessRuntime {
    timeout: Duration,
    next_id: AtomicU64,
    instances: Mutex<HashMap<u64, Arc<Instance>>>,
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new(Duration::from_millis(10_000))
    }
}

impl ProcessRuntime {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_id: AtomicU64::new(1),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn live_instances(&self) -> usize {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn instance(&self, handle: &RuntimeHandle) -> Option<Arc<Instance>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.id)
            .cloned()
    }
}

const ETXTBSY: i32 = 26;

async fn spawn_instance(instance: &Instance) -> std::io::Result<tokio::process::Child> {
    let mut attempts = 0;
    loop {
        let spawned = instance
            .launcher
            .command()
            .current_dir(instance.dir.path())
            .envs(&instance.env)
            .env("DEVHOST_HANDLER", &instance.handler)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            // A freshly unpacked executable can still be open in a forked child.
            Err(err) if err.raw_os_error() == Some(ETXTBSY) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20 * attempts)).await;
            }
            other => return other,
        }
    }
}

async fn unpack(payload: Vec<u8>) -> std::io::Result<TempDir> {
    tokio::task::spawn_blocking(move || {
        let dir = tempfile::Builder::new().prefix("devhost-fn-").tempdir()?;
        tar::Archive::new(payload.as_slice()).unpack(dir.path())?;
        Ok(dir)
    })
    .await
    .map_err(std::io::Error::other)?
}

#[async_trait]
impl FunctionRuntime for ProcessRuntime {
    async fn create(
        &self,
        artifact: &FunctionArtifact,
        env: &BTreeMap<String, String>,
    ) -> Result<RuntimeHandle> {
        let dir = unpack(artifact.payload.clone())
            .await
            .map_err(|e| DevError::provision(&artifact.runtime, format!("bad payload: {e}")))?;
        let launcher = Launcher::resolve(&artifact.runtime, &artifact.handler, dir.path())?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "created {} instance {id} for {} in {}",
            artifact.runtime,
            artifact.handler,
            dir.path().display()
        );
        let instance = Instance {
            dir,
            launcher,
            handler: artifact.handler.clone(),
            env: env.clone(),
        };
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(instance));

        Ok(RuntimeHandle {
            id,
            runtime: artifact.runtime.clone(),
            handler: artifact.handler.clone(),
        })
    }

    async fn invoke(&self, handle: &RuntimeHandle, payload: &InvokePayload) -> Result<InvokeResult> {
        let instance = self.instance(handle).ok_or_else(|| {
            DevError::invocation(format!("function instance {} has been destroyed", handle.id))
        })?;
        let input = serde_json::to_vec(payload)
            .map_err(|e| DevError::invocation(format!("could not encode request: {e}")))?;

        let mut child = spawn_instance(&instance)
            .await
            .map_err(|e| DevError::invocation(format!("could not start {}: {e}", handle.handler)))?;

        let stdin = child.stdin.take();
        let id = handle.id;
        let write = async move {
            if let Some(mut stdin) = stdin {
                // A handler may exit without reading its input.
                if let Err(err) = stdin.write_all(&input).await {
                    debug!("function {id} closed stdin early: {err}");
                }
            }
        };
        // The deadline covers delivering the request; the child is killed
        // when the timed-out future drops it.
        let run = async move {
            let ((), output) = tokio::join!(write, child.wait_with_output());
            output
        };
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                DevError::invocation(format!(
                    "{} timed out after {}ms",
                    handle.handler,
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| DevError::invocation(e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            debug!(target: "devhost::function", "[{}] {line}", handle.handler);
        }
        if !output.status.success() {
            return Err(DevError::invocation(format!(
                "{} exited with {}: {}",
                handle.handler,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| DevError::invocation(format!("{} produced no output", handle.handler)))?;
        serde_json::from_str(last.trim())
            .map_err(|e| DevError::invocation(format!("bad response from {}: {e}", handle.handler)))
    }

    async fn destroy(&self, handle: &RuntimeHandle) -> Result<()> {
        let removed = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id);
        let Some(instance) = removed else {
            return Ok(());
        };
        debug!("destroyed instance {}", handle.id);
        // In-flight invocations keep the directory alive until they finish.
        if let Ok(instance) = Arc::try_unwrap(instance) {
            let dir = instance.dir;
            let path = dir.path().to_path_buf();
            tokio::task::spawn_blocking(move || dir.close())
                .await
                .map_err(std::io::Error::other)
                .and_then(|r| r)
                .map_err(|e| DevError::fs(path, e))?;
        }
        Ok(())
    }
}
