use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the dev engine.
///
/// Build-time and invocation errors are recovered by the session (logged,
/// previous artifacts stay live). Configuration errors surface from
/// [`crate::server::DevSession::start`] and abort startup.
#[derive(Debug, Error)]
pub enum DevError {
    #[error("file system error at {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("builder `{identifier}` could not be installed: {reason}")]
    BuilderNotFound { identifier: String, reason: String },
    #[error("builder `{identifier}` does not provide the `{missing}` operation")]
    BuilderContract {
        identifier: String,
        missing: &'static str,
    },
    #[error("build of `{entrypoint}` failed: {message}")]
    BuildFailed { entrypoint: String, message: String },
    #[error(
        "function `{path}` is {} which exceeds the configured limit ({}); raise `maxLambdaSize` in the build `config`",
        format_size(*size),
        format_size(*limit)
    )]
    ArtifactTooLarge { path: String, size: u64, limit: u64 },
    #[error("could not provision runtime `{runtime}`: {reason}")]
    RuntimeProvision { runtime: String, reason: String },
    #[error("function invocation failed: {reason}")]
    RuntimeInvocation { reason: String },
    #[error("invalid route at index {index}: {reason}")]
    RouteConfig { index: usize, reason: String },
    #[error("invalid project configuration: {0}")]
    ProjectConfig(String),
    #[error("listener error: {0}")]
    Listen(#[source] std::io::Error),
}

impl DevError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invocation(reason: impl Into<String>) -> Self {
        Self::RuntimeInvocation {
            reason: reason.into(),
        }
    }

    pub(crate) fn provision(runtime: &str, reason: impl Into<String>) -> Self {
        Self::RuntimeProvision {
            runtime: runtime.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = DevError> = std::result::Result<T, E>;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

/// Parses a human size such as `"5mb"`, `"1.5 kb"` or `"2048"` into bytes.
///
/// Units are 1024-based, matching how the hosting platform reads
/// `maxLambdaSize`.
///
/// # Examples
///
/// ```
/// use devhost_core::error::parse_size;
///
/// assert_eq!(parse_size("1kb"), Some(1024));
/// assert_eq!(parse_size("5MB"), Some(5 * 1024 * 1024));
/// assert_eq!(parse_size("512"), Some(512));
/// assert_eq!(parse_size("lots"), None);
/// ```
pub fn parse_size(raw: &str) -> Option<u64> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => KIB,
        "mb" | "m" => MIB,
        "gb" | "g" => GIB,
        _ => return None,
    };
    Some((value * multiplier as f64).round() as u64)
}

/// Formats a byte count the way error messages print it (`"2kb"`, `"5mb"`).
pub fn format_size(bytes: u64) -> String {
    let (unit, label) = if bytes >= GIB {
        (GIB, "gb")
    } else if bytes >= MIB {
        (MIB, "mb")
    } else if bytes >= KIB {
        (KIB, "kb")
    } else {
        return format!("{bytes}b");
    };
    let value = bytes as f64 / unit as f64;
    if (value.fract()).abs() < f64::EPSILON {
        format!("{}{label}", value as u64)
    } else {
        format!("{value:.2}{label}")
    }
}
