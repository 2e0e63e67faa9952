//! Ordered, phased request routing.
//!
//! Route entries come from the project's `routes` list. `{"handle": "<phase>"}`
//! entries switch the phase of the rules that follow; rules declared before
//! any marker belong to [`Phase::Rewrite`]. Phases run in the order of
//! [`Phase::ORDER`], rules within a phase in declaration order.

use crate::error::{DevError, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use url::form_urlencoded;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Header,
    Redirect,
    Filesystem,
    Miss,
    Rewrite,
    Error,
}

impl Phase {
    pub const ORDER: [Phase; 6] = [
        Phase::Header,
        Phase::Redirect,
        Phase::Filesystem,
        Phase::Miss,
        Phase::Rewrite,
        Phase::Error,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "header" | "headers" => Some(Phase::Header),
            "redirect" | "redirects" => Some(Phase::Redirect),
            "filesystem" => Some(Phase::Filesystem),
            "miss" => Some(Phase::Miss),
            "rewrite" | "rewrites" => Some(Phase::Rewrite),
            "error" => Some(Phase::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Header => "header",
            Phase::Redirect => "redirect",
            Phase::Filesystem => "filesystem",
            Phase::Miss => "miss",
            Phase::Rewrite => "rewrite",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(one) => vec![one],
            OneOrMany::Many(many) => many,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    #[serde(default)]
    handle: Option<String>,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default, alias = "pathname")]
    src: Option<String>,
    #[serde(default)]
    methods: Option<OneOrMany>,
    #[serde(default)]
    method: Option<OneOrMany>,
    #[serde(default)]
    dest: Option<String>,
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default, rename = "continue")]
    continue_matching: bool,
}

/// One compiled route rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub phase: Phase,
    /// Position in the project's `routes` list.
    pub index: usize,
    pub src: Regex,
    pub methods: Option<Vec<String>>,
    pub dest: Option<String>,
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub continue_matching: bool,
}

impl RouteRule {
    fn accepts_method(&self, method: &str) -> bool {
        match &self.methods {
            Some(methods) => methods.iter().any(|m| m.eq_ignore_ascii_case(method)),
            None => true,
        }
    }
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:<3} {:<10} ", self.index, self.phase)?;
        if let Some(methods) = &self.methods {
            write!(f, "[{}] ", methods.join(","))?;
        }
        write!(f, "{}", self.src.as_str())?;
        if let Some(dest) = &self.dest {
            write!(f, " -> {dest}")?;
        }
        if let Some(status) = self.status {
            write!(f, " ({status})")?;
        }
        if !self.headers.is_empty() {
            write!(f, " +{} header(s)", self.headers.len())?;
        }
        if self.continue_matching {
            f.write_str(" continue")?;
        }
        Ok(())
    }
}

fn anchor(src: &str) -> String {
    let body = src.strip_prefix('^').unwrap_or(src);
    let body = match body.strip_suffix('$') {
        Some(rest) if !rest.ends_with('\\') => rest,
        _ => body,
    };
    format!("^(?:{body})$")
}

fn compile_rule(index: usize, value: &Value, phase: &mut Phase) -> Result<Option<RouteRule>> {
    let invalid = |reason: String| DevError::RouteConfig { index, reason };
    let raw: RawRoute = serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?;

    if let Some(handle) = &raw.handle {
        *phase = Phase::parse(handle).ok_or_else(|| invalid(format!("unknown phase `{handle}`")))?;
        return Ok(None);
    }

    let rule_phase = match &raw.phase {
        Some(p) => Phase::parse(p).ok_or_else(|| invalid(format!("unknown phase `{p}`")))?,
        None => *phase,
    };
    let src = raw.src.ok_or_else(|| invalid("missing `src`".to_string()))?;
    let regex = Regex::new(&anchor(&src)).map_err(|e| invalid(format!("bad `src` regex: {e}")))?;
    let status = match raw.status {
        None => None,
        Some(code) if (100..=599).contains(&code) => Some(code as u16),
        Some(code) => return Err(invalid(format!("status {code} is out of range"))),
    };
    let methods = raw
        .methods
        .or(raw.method)
        .map(|m| m.into_vec().into_iter().map(|m| m.to_ascii_uppercase()).collect());

    Ok(Some(RouteRule {
        phase: rule_phase,
        index,
        src: regex,
        methods,
        dest: raw.dest,
        status,
        headers: raw
            .headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect(),
        continue_matching: raw.continue_matching,
    }))
}

/// The compiled route list.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

/// What the resolver needs to know about a request.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub method: String,
    /// Percent-decoded path starting with `/`.
    pub path: String,
    pub query: BTreeMap<String, Vec<String>>,
}

impl RouteRequest {
    pub fn new(method: &str, path: &str, raw_query: Option<&str>) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: parse_query(raw_query.unwrap_or("")),
        }
    }
}

/// Outcome of resolving one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteResult {
    pub matched: bool,
    pub destination_path: String,
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, Vec<String>>,
    pub continue_matching: bool,
    pub filesystem_hit: bool,
    pub is_external: bool,
    pub matched_rule: Option<usize>,
    pub matched_phase: Option<Phase>,
}

impl RouteResult {
    /// The query string to forward, empty when there is none.
    pub fn query_string(&self) -> String {
        let mut out = form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.query {
            for value in values {
                out.append_pair(key, value);
            }
        }
        out.finish()
    }
}

pub fn parse_query(raw: &str) -> BTreeMap<String, Vec<String>> {
    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in form_urlencoded::parse(raw.as_bytes()) {
        query.entry(k.into_owned()).or_default().push(v.into_owned());
    }
    query
}

fn is_external(dest: &str) -> bool {
    let lower = dest.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Substitutes `$1`, `$name` and `${name}` references. A numeric reference
/// ends at the first non-digit, so `$1_handler` is group 1 then `_handler`.
/// `$$` is a literal dollar; unknown groups expand to nothing.
fn expand(caps: &Captures<'_>, template: &str) -> String {
    let group = |name: &str| -> String {
        let found = match name.parse::<usize>() {
            Ok(index) => caps.get(index),
            Err(_) => caps.name(name),
        };
        found.map(|m| m.as_str().to_string()).unwrap_or_default()
    };

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(close) => {
                    out.push_str(&group(&braced[..close]));
                    rest = &braced[close + 1..];
                }
                None => {
                    out.push('$');
                    rest = after;
                }
            }
        } else {
            let digits = after.bytes().take_while(u8::is_ascii_digit).count();
            let len = if digits > 0 {
                digits
            } else {
                after
                    .char_indices()
                    .take_while(|(i, c)| {
                        c.is_ascii_alphabetic() || *c == '_' || (*i > 0 && c.is_ascii_digit())
                    })
                    .count()
            };
            if len == 0 {
                out.push('$');
            } else {
                out.push_str(&group(&after[..len]));
            }
            rest = &after[len..];
        }
    }
    out.push_str(rest);
    out
}

struct Walk {
    path: String,
    status: Option<u16>,
    headers: BTreeMap<String, String>,
    query: BTreeMap<String, Vec<String>>,
}

impl Walk {
    fn finish(self, matched: bool, rule: Option<usize>, phase: Option<Phase>) -> RouteResult {
        RouteResult {
            matched,
            destination_path: self.path,
            status: self.status,
            headers: self.headers,
            query: self.query,
            continue_matching: false,
            filesystem_hit: false,
            is_external: false,
            matched_rule: rule,
            matched_phase: phase,
        }
    }
}

impl RouteTable {
    /// Compiles the raw route entries. Any invalid entry fails the table.
    pub fn compile(routes: &[Value]) -> Result<Self> {
        let mut phase = Phase::Rewrite;
        let mut rules = Vec::new();
        for (index, value) in routes.iter().enumerate() {
            if let Some(rule) = compile_rule(index, value, &mut phase)? {
                rules.push(rule);
            }
        }
        rules.sort_by_key(|r| (r.phase, r.index));
        Ok(Self { rules })
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolves a request. `has_artifact` answers whether a path (with its
    /// leading `/`) is currently served.
    pub fn resolve(&self, req: &RouteRequest, has_artifact: impl Fn(&str) -> bool) -> RouteResult {
        let mut walk = Walk {
            path: req.path.clone(),
            status: None,
            headers: BTreeMap::new(),
            query: req.query.clone(),
        };
        let mut continued = false;

        for phase in Phase::ORDER {
            if phase == Phase::Filesystem && has_artifact(&walk.path) {
                let mut result = walk.finish(true, None, Some(phase));
                result.filesystem_hit = true;
                return result;
            }

            for rule in self.rules.iter().filter(|r| r.phase == phase) {
                let next_path = {
                    let Some(caps) = rule.src.captures(&walk.path) else {
                        continue;
                    };
                    if !rule.accepts_method(&req.method) {
                        continue;
                    }
                    for (name, template) in &rule.headers {
                        walk.headers.insert(name.clone(), expand(&caps, template));
                    }
                    rule.dest.as_ref().map(|dest| expand(&caps, dest))
                };
                if let Some(status) = rule.status {
                    walk.status = Some(status);
                }

                if let Some(dest) = next_path {
                    if is_external(&dest) {
                        let mut result = walk.finish(true, Some(rule.index), Some(phase));
                        result.destination_path = dest;
                        result.is_external = true;
                        return result;
                    }
                    let (dest_path, dest_query) = match dest.split_once('?') {
                        Some((p, q)) => (p.to_string(), Some(q)),
                        None => (dest.clone(), None),
                    };
                    if let Some(raw) = dest_query {
                        walk.query.extend(parse_query(raw));
                    }
                    walk.path = if dest_path.starts_with('/') {
                        dest_path
                    } else {
                        format!("/{dest_path}")
                    };

                    if phase == Phase::Filesystem && has_artifact(&walk.path) {
                        let mut result = walk.finish(true, Some(rule.index), Some(phase));
                        result.filesystem_hit = true;
                        return result;
                    }
                }

                if !rule.continue_matching {
                    return walk.finish(true, Some(rule.index), Some(phase));
                }
                continued = true;
            }
        }

        let mut result = walk.finish(false, None, None);
        result.continue_matching = continued;
        result
    }
}
