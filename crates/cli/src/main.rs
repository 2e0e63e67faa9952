use anyhow::Context;
use clap::{Parser, Subcommand};
use devhost_core::builder_cache::DefaultInstaller;
use devhost_core::project::ProjectConfig;
use devhost_core::repl::run_console;
use devhost_core::routes::RouteTable;
use devhost_core::runtime::ProcessRuntime;
use devhost_core::server::{BuildSummary, DevSession};
use devhost_core::types::{DevConfig, JsonEnvelope};
use serde_json::json;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use toml::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long shutdown may spend releasing functions and dev servers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(
    name = "devhost",
    version,
    about = "Build entrypoints and serve them locally the way the platform would"
)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a commented `.devhost.toml` in the current directory.
    InitConfig {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Build, watch and serve a project.
    Dev {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        listen: Option<String>,
        #[arg(long = "no-watch", default_value_t = false)]
        no_watch: bool,
        #[arg(long, default_value_t = false)]
        debug: bool,
    },
    /// Build every entrypoint once and list the outputs.
    Build {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Print the compiled route table.
    Routes {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { force } = cli.cmd {
        init_config_file(Path::new(".devhost.toml"), force)?;
        println!("initialized .devhost.toml");
        return Ok(());
    }

    let mut cfg = load_config()?;

    match cli.cmd {
        Commands::InitConfig { .. } => {}
        Commands::Dev {
            dir,
            port,
            listen,
            no_watch,
            debug,
        } => {
            if let Some(port) = port {
                cfg.port = port;
            }
            if let Some(listen) = listen {
                cfg.listen = listen;
            }
            if no_watch {
                cfg.watch.enabled = false;
            }
            if debug {
                cfg.log_level = "debug".to_string();
            }
            init_tracing(&cfg.log_level);
            run_dev(&dir, cfg).await?;
        }
        Commands::Build { dir } => {
            init_tracing(&cfg.log_level);
            cfg.watch.enabled = false;
            run_build(&dir, cfg, cli.json).await?;
        }
        Commands::Routes { dir } => {
            init_tracing(&cfg.log_level);
            print_routes(&dir, &cfg, cli.json)?;
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,devhost={level},devhost_core={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn start_session(dir: &Path, cfg: DevConfig) -> anyhow::Result<Arc<DevSession>> {
    let installer = DefaultInstaller::new(cfg.builders.dirs.iter().map(PathBuf::from).collect());
    let runtime = ProcessRuntime::new(Duration::from_millis(cfg.timeouts.invoke_ms));
    DevSession::start(dir, cfg, Arc::new(installer), Arc::new(runtime))
        .await
        .with_context(|| format!("failed to start dev session in {}", dir.display()))
}

async fn run_dev(dir: &Path, cfg: DevConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", cfg.listen, cfg.port);
    let session = start_session(dir, cfg).await?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not listen on {addr}"))?;

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
        })
    };

    if std::io::stdin().is_terminal() {
        let console = run_console(
            session.clone(),
            tokio::io::BufReader::new(tokio::io::stdin()),
            std::io::stdout(),
        );
        tokio::select! {
            result = console => result?,
            _ = tokio::signal::ctrl_c() => println!(),
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutting down");
    let _ = stop.send(());
    match server.await {
        Ok(Err(err)) => warn!("listener stopped with an error: {err}"),
        Err(err) => warn!("listener task failed: {err}"),
        Ok(Ok(())) => {}
    }
    stop_session(&session, SHUTDOWN_GRACE).await;
    Ok(())
}

/// Shuts the session down, giving up after `grace`. Returns whether it
/// finished in time.
async fn stop_session(session: &DevSession, grace: Duration) -> bool {
    match tokio::time::timeout(grace, session.shutdown()).await {
        Ok(()) => true,
        Err(_) => {
            warn!(
                "shutdown did not finish within {}s; some function instances may still be running",
                grace.as_secs()
            );
            false
        }
    }
}

async fn run_build(dir: &Path, cfg: DevConfig, json_output: bool) -> anyhow::Result<()> {
    let session = start_session(dir, cfg).await?;
    let builds = session.build_summaries().await;
    stop_session(&session, SHUTDOWN_GRACE).await;

    let failed = builds.iter().filter(|b| b.last_error.is_some()).count();
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&JsonEnvelope {
                status: if failed == 0 { "ok" } else { "error" }.to_string(),
                phase: "build".to_string(),
                message: format!("{} entrypoint(s), {failed} failed", builds.len()),
                details: json!({ "builds": builds }),
            })?
        );
    } else {
        print_builds(&builds);
    }

    if failed > 0 {
        anyhow::bail!("{failed} build(s) failed");
    }
    Ok(())
}

fn print_builds(builds: &[BuildSummary]) {
    if builds.is_empty() {
        println!("no entrypoints matched");
    }
    for build in builds {
        match &build.last_error {
            Some(err) => println!("x {} [{}]\n    {err}", build.entrypoint, build.builder),
            None => {
                println!("✓ {} [{}]", build.entrypoint, build.builder);
                for output in &build.outputs {
                    println!("    {output}");
                }
            }
        }
    }
}

fn print_routes(dir: &Path, cfg: &DevConfig, json_output: bool) -> anyhow::Result<()> {
    let project = ProjectConfig::load(dir, &cfg.project_file)?;
    let table = RouteTable::compile(&project.routes)?;
    if json_output {
        let rules: Vec<String> = table.rules().iter().map(ToString::to_string).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&JsonEnvelope {
                status: "ok".to_string(),
                phase: "routes".to_string(),
                message: format!("{} rule(s)", rules.len()),
                details: json!({ "rules": rules }),
            })?
        );
        return Ok(());
    }
    if table.is_empty() {
        println!("no routes configured");
    }
    for rule in table.rules() {
        println!("{rule}");
    }
    Ok(())
}

fn load_config() -> anyhow::Result<DevConfig> {
    let local_path = PathBuf::from(".devhost.toml");
    let home_path = std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".devhost.toml"));

    let home = match &home_path {
        Some(path) => read_config_value(path)?,
        None => None,
    };
    let local = read_config_value(&local_path)?;

    resolve_config(home, local, |k| std::env::var(k).ok())
}

fn resolve_config<F>(
    home: Option<Value>,
    local: Option<Value>,
    env_get: F,
) -> anyhow::Result<DevConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = Value::try_from(DevConfig::default())?;
    if let Some(home_value) = home {
        merge_toml(&mut merged, home_value);
    }
    if let Some(local_value) = local {
        merge_toml(&mut merged, local_value);
    }

    let mut cfg: DevConfig = merged.try_into()?;
    apply_env_overrides(&mut cfg, env_get);
    Ok(cfg)
}

fn read_config_value(path: &Path) -> anyhow::Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)?;
    let parsed = raw
        .parse::<Value>()
        .with_context(|| format!("invalid TOML in {}", path.display()))?;
    Ok(Some(parsed))
}

fn merge_toml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_map), Value::Table(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(base_value) = base_map.get_mut(&key) {
                    merge_toml(base_value, value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value;
        }
    }
}

fn apply_env_overrides<F>(cfg: &mut DevConfig, env_get: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = env_get("DEVHOST_LISTEN") {
        cfg.listen = v;
    }
    if let Some(v) = env_get("DEVHOST_PORT").and_then(|v| v.parse::<u16>().ok()) {
        cfg.port = v;
    }
    if let Some(v) = env_get("DEVHOST_CACHE_DIR") {
        cfg.cache_dir = v;
    }
    if let Some(v) = env_get("DEVHOST_PROJECT_FILE") {
        cfg.project_file = v;
    }
    if let Some(v) = env_get("DEVHOST_LOG_LEVEL") {
        cfg.log_level = v;
    }

    if let Some(v) = env_get("DEVHOST_INVOKE_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        cfg.timeouts.invoke_ms = v;
    }

    if let Some(v) = env_get("DEVHOST_WATCH").and_then(|v| parse_bool(&v)) {
        cfg.watch.enabled = v;
    }
    if let Some(v) = env_get("DEVHOST_WATCH_DEBOUNCE_MS").and_then(|v| v.parse::<u64>().ok()) {
        cfg.watch.debounce_ms = v;
    }

    if let Some(v) = env_get("DEVHOST_BUILDER_DIRS") {
        cfg.builders.dirs = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn init_config_file(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; re-run with --force to overwrite",
            path.display()
        );
    }
    fs::write(path, config_template())?;
    Ok(())
}

fn config_template() -> &'static str {
    r#"# devhost configuration
# precedence: CLI > env (DEVHOST_*) > local .devhost.toml > home ~/.devhost.toml > defaults

listen = "127.0.0.1"
port = 3000
# defaults to <project>/.devhost/cache
cache_dir = ""
# defaults to devhost.json, then now.json
project_file = ""
log_level = "info"

[timeouts]
invoke_ms = 10000

[watch]
enabled = true
debounce_ms = 250

[builders]
# directories searched for devhost-builder-<name> executables before PATH
dirs = []
"#
}
