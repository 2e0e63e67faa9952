use crate::server::DevSession;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Status,
    Builds,
    Routes,
    Rebuild(Option<String>),
    Quit,
    Unknown(String),
}

impl ConsoleCommand {
    /// Parses one input line. Blank lines yield `None`; `:` works as an
    /// alias for the `/` prefix.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let body = line
            .strip_prefix('/')
            .or_else(|| line.strip_prefix(':'))
            .unwrap_or(line);
        let (name, arg) = match body.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (body, ""),
        };
        Some(match name {
            "help" | "?" => Self::Help,
            "status" => Self::Status,
            "builds" => Self::Builds,
            "routes" => Self::Routes,
            "rebuild" => Self::Rebuild((!arg.is_empty()).then(|| arg.to_string())),
            "quit" | "exit" => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        })
    }
}

/// Runs the dev console until `/quit` or end of input.
pub async fn run_console<R, W>(session: Arc<DevSession>, input: R, mut out: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    writeln!(out, "devhost console. Type /help for commands.")?;
    loop {
        write!(out, "devhost> ")?;
        out.flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let Some(command) = ConsoleCommand::parse(&line) else {
            continue;
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        execute(&session, command, &mut out).await?;
    }
    Ok(())
}

async fn execute<W: Write>(
    session: &DevSession,
    command: ConsoleCommand,
    out: &mut W,
) -> anyhow::Result<()> {
    match command {
        ConsoleCommand::Help => print_help(out)?,
        ConsoleCommand::Status => {
            let status = session.status().await;
            if status.running {
                writeln!(out, "serving {}", status.url)?;
            } else {
                writeln!(out, "not listening")?;
            }
            writeln!(
                out,
                "{} build(s), {} failing; {} artifact(s), {} function(s); watching: {}",
                status.builds,
                status.failed_builds,
                status.artifacts,
                status.functions,
                if status.watching { "yes" } else { "no" }
            )?;
        }
        ConsoleCommand::Builds => {
            let builds = session.build_summaries().await;
            if builds.is_empty() {
                writeln!(out, "no entrypoints matched")?;
            }
            for build in builds {
                let state = match (&build.last_error, build.build_count) {
                    (Some(_), _) => "failed",
                    (None, 0) => "pending",
                    (None, _) => "ok",
                };
                writeln!(
                    out,
                    "{:<7} {}  [{}] builds={} outputs={}",
                    state,
                    build.entrypoint,
                    build.builder,
                    build.build_count,
                    build.outputs.join(", ")
                )?;
                if let Some(err) = build.last_error {
                    writeln!(out, "        {err}")?;
                }
            }
        }
        ConsoleCommand::Routes => {
            let routes = session.routes();
            if routes.is_empty() {
                writeln!(out, "no routes configured")?;
            }
            for rule in routes.rules() {
                writeln!(out, "{rule}")?;
            }
        }
        ConsoleCommand::Rebuild(entrypoint) => {
            let results = session.rebuild(entrypoint.as_deref()).await;
            if results.is_empty() {
                match entrypoint {
                    Some(e) => writeln!(out, "no build matches {e}")?,
                    None => writeln!(out, "nothing to build")?,
                }
            }
            for (entrypoint, result) in results {
                match result {
                    Ok(report) => writeln!(
                        out,
                        "rebuilt {entrypoint} in {}ms",
                        report.elapsed.as_millis()
                    )?,
                    Err(err) => writeln!(out, "error: {entrypoint}: {err}")?,
                }
            }
        }
        ConsoleCommand::Unknown(line) => {
            writeln!(out, "unknown command: {line} (try /help)")?;
        }
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn print_help<W: Write>(out: &mut W) -> std::io::Result<()> {
    writeln!(out, "devhost console commands")?;
    writeln!(out, "  /help                   show this help")?;
    writeln!(out, "  /status                 show listener and artifact counts")?;
    writeln!(out, "  /builds                 list entrypoints and their last build")?;
    writeln!(out, "  /routes                 print the compiled route table")?;
    writeln!(out, "  /rebuild [entrypoint]   rebuild one entrypoint or all of them")?;
    writeln!(out, "  /quit | /exit           stop the dev server")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::BuilderError;
    use crate::testing::{project, static_bytes, FnBuilder, MapInstaller, MockRuntime};
    use crate::types::{BuilderOutputs, DevConfig};

    #[test]
    fn parses_commands_and_aliases() {
        assert_eq!(ConsoleCommand::parse("  "), None);
        assert_eq!(ConsoleCommand::parse("/help"), Some(ConsoleCommand::Help));
        assert_eq!(ConsoleCommand::parse(":status"), Some(ConsoleCommand::Status));
        assert_eq!(ConsoleCommand::parse("/exit"), Some(ConsoleCommand::Quit));
        assert_eq!(
            ConsoleCommand::parse("/rebuild  api/a.sh "),
            Some(ConsoleCommand::Rebuild(Some("api/a.sh".to_string())))
        );
        assert_eq!(ConsoleCommand::parse("/rebuild"), Some(ConsoleCommand::Rebuild(None)));
        assert_eq!(
            ConsoleCommand::parse("/deploy"),
            Some(ConsoleCommand::Unknown("/deploy".to_string()))
        );
    }

    #[tokio::test]
    async fn console_lists_builds_routes_and_rebuilds() {
        let dir = project(&[
            (
                "devhost.json",
                r#"{"builds":[{"src":"*.txt","use":"txt"}],"routes":[{"src":"/old","status":301,"headers":{"Location":"/a.txt"}}]}"#,
            ),
            ("a.txt", "a"),
            ("bad.txt", "b"),
        ]);
        let builder = FnBuilder::new(|opts| {
            if opts.entrypoint == "bad.txt" {
                return Err(BuilderError::Failed("syntax error".into()));
            }
            let mut out = BuilderOutputs::new();
            out.insert(opts.entrypoint.clone(), static_bytes("ok"));
            Ok(out)
        });
        let mut config = DevConfig::default();
        config.watch.enabled = false;
        let session = DevSession::start(
            dir.path(),
            config,
            Arc::new(MapInstaller::new().with("txt", "1.0.0", builder.clone())),
            Arc::new(MockRuntime::default()),
        )
        .await
        .expect("start");

        let input: &[u8] = b"/builds\n/routes\n\n/rebuild a.txt\n/rebuild nope.txt\n/bogus\n/quit\n/status\n";
        let mut out = Vec::new();
        run_console(session.clone(), input, &mut out)
            .await
            .expect("console");
        let out = String::from_utf8(out).expect("utf8");

        assert!(out.contains("ok      a.txt"));
        assert!(out.contains("failed  bad.txt"));
        assert!(out.contains("syntax error"));
        assert!(out.contains("/old"));
        assert!(out.contains("rebuilt a.txt"));
        assert!(out.contains("no build matches nope.txt"));
        assert!(out.contains("unknown command: /bogus"));
        assert!(!out.contains("not listening"), "input after /quit is ignored");
        assert_eq!(builder.calls(), 3);
        session.shutdown().await;
    }
}
