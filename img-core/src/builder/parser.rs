//! Build script normalizer.
//!
//! Parses Dockerfile-syntax build scripts into normalized stages:
//! - Multi-stage builds with `FROM ... AS name`
//! - Global and per-stage `ARG` with build-arg overrides
//! - Variable substitution for ENV, USER, WORKDIR, VOLUME, EXPOSE, LABEL, ARG
//!   and the FROM image reference
//! - `RUN --mount=type=secret|ssh` declarations
//!
//! Substitution state is threaded as an immutable snapshot: every directive
//! consumes the current [`StageConfig`] and returns a new one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::builder::platform::Platform;

/// Shell used for shell-form commands unless the script sets `SHELL`.
pub const DEFAULT_SHELL: [&str; 2] = ["/bin/sh", "-c"];

/// Default target of secret mounts: `/run/secrets/<id>`.
pub const SECRET_MOUNT_DIR: &str = "/run/secrets";

/// A normalized build stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// Stage name. Unnamed stages use their index, except the final one,
    /// which is the empty string.
    pub name: String,
    /// Position in the script.
    pub index: usize,
    /// Line of the stage's FROM.
    pub line: usize,
    /// What the stage starts from.
    pub base: BaseRef,
    /// Platform pinned with `FROM --platform=...`
    pub platform: Option<Platform>,
    /// Instructions after FROM, in script order.
    pub instructions: Vec<Instruction>,
    /// Metadata accumulated over the whole stage.
    pub config: StageConfig,
}

/// Starting filesystem of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseRef {
    /// Empty filesystem.
    Scratch,
    /// Image resolved through the base image source.
    Image(ImageRef),
    /// Final filesystem of another stage.
    Stage { index: usize, name: String },
}

/// Reference to an image (e.g., "alpine:3.19", "ghcr.io/org/app@sha256:...").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parses `name[:tag][@digest]`.
    pub fn parse(s: &str) -> Self {
        let (name_tag, digest) = match s.find('@') {
            Some(idx) => (&s[..idx], Some(s[idx + 1..].to_string())),
            None => (s, None),
        };

        // A colon after the last slash separates the tag; earlier colons are registry ports.
        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(idx) => {
                let idx = last_slash + idx;
                (&name_tag[..idx], Some(name_tag[idx + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        Self { name: name.to_string(), tag, digest }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// One directive of a stage, with its raw tokens and resolved form.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// 1-based script line.
    pub line: usize,
    /// Argument tokens as written, before substitution.
    pub raw: Vec<String>,
    /// The directive with substitution applied.
    pub directive: Directive,
}

/// Resolved directive kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Directive {
    /// FROM base [AS name]
    From { base: BaseRef, stage_name: Option<String>, platform: Option<String> },
    /// ARG name[=default]
    Arg { name: String, value: Option<String> },
    /// ENV key=value ... | ENV key value
    Env { vars: Vec<(String, String)> },
    /// LABEL key=value ...
    Label { labels: Vec<(String, String)> },
    /// EXPOSE port[/proto] ...
    Expose { ports: Vec<String> },
    /// WORKDIR path
    Workdir { path: String },
    /// USER user[:group]
    User { user: String },
    /// VOLUME path ... | VOLUME ["path", ...]
    Volume { paths: Vec<String> },
    /// RUN [--mount=...] command
    Run { command: RunCommand, mounts: Vec<RunMount> },
    /// COPY/ADD [--from=stage] [--chown=u:g] src... dest
    Copy { from: Option<CopySource>, sources: Vec<String>, destination: String, chown: Option<String> },
    /// ENTRYPOINT
    Entrypoint { command: RunCommand },
    /// CMD
    Cmd { command: RunCommand },
    /// HEALTHCHECK [options] CMD command | HEALTHCHECK NONE
    Healthcheck { config: Option<HealthcheckConfig> },
    /// STOPSIGNAL signal
    Stopsignal { signal: String },
    /// SHELL ["executable", "parameters"]
    Shell { shell: Vec<String> },
}

impl Directive {
    /// True for RUN and COPY, which change the filesystem.
    pub fn mutates_filesystem(&self) -> bool {
        matches!(self, Directive::Run { .. } | Directive::Copy { .. })
    }

    /// Script keyword, for diagnostics.
    pub fn keyword(&self) -> &'static str {
        match self {
            Directive::From { .. } => "FROM",
            Directive::Arg { .. } => "ARG",
            Directive::Env { .. } => "ENV",
            Directive::Label { .. } => "LABEL",
            Directive::Expose { .. } => "EXPOSE",
            Directive::Workdir { .. } => "WORKDIR",
            Directive::User { .. } => "USER",
            Directive::Volume { .. } => "VOLUME",
            Directive::Run { .. } => "RUN",
            Directive::Copy { .. } => "COPY",
            Directive::Entrypoint { .. } => "ENTRYPOINT",
            Directive::Cmd { .. } => "CMD",
            Directive::Healthcheck { .. } => "HEALTHCHECK",
            Directive::Stopsignal { .. } => "STOPSIGNAL",
            Directive::Shell { .. } => "SHELL",
        }
    }
}

/// Where a COPY reads from when `--from` is given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopySource {
    /// A stage of this script, by index.
    Stage(usize),
    /// A name that is not a stage of this script.
    Unresolved(String),
}

/// RUN/CMD/ENTRYPOINT command format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunCommand {
    /// Shell form: RUN apt-get update
    Shell(String),
    /// Exec form: RUN ["apt-get", "update"]
    Exec(Vec<String>),
}

impl RunCommand {
    /// Expands to an argv, wrapping shell form in `shell`.
    pub fn to_argv(&self, shell: &[String]) -> Vec<String> {
        match self {
            RunCommand::Shell(cmd) => {
                let mut argv = shell.to_vec();
                argv.push(cmd.clone());
                argv
            }
            RunCommand::Exec(args) => args.clone(),
        }
    }
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunCommand::Shell(cmd) => f.write_str(cmd),
            RunCommand::Exec(args) => write!(f, "{:?}", args),
        }
    }
}

/// Kind of an ephemeral RUN mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MountKind {
    Secret,
    Ssh,
}

/// `RUN --mount=type=secret|ssh,...`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunMount {
    pub kind: MountKind,
    pub id: String,
    /// Path inside the build container.
    pub target: String,
    /// Fail the step instead of leaving the mount absent.
    pub required: bool,
}

/// Healthcheck configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    pub command: RunCommand,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub start_period: Option<String>,
    pub retries: Option<u32>,
}

/// Image metadata accumulated while walking a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageConfig {
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub entrypoint: Option<RunCommand>,
    pub cmd: Option<RunCommand>,
    pub healthcheck: Option<HealthcheckConfig>,
    pub stop_signal: Option<String>,
    pub shell: Option<Vec<String>>,
}

impl StageConfig {
    /// Returns the configuration after `directive` has been applied.
    pub fn apply(mut self, directive: &Directive) -> Self {
        match directive {
            Directive::Env { vars } => {
                for (key, value) in vars {
                    self.env.insert(key.clone(), value.clone());
                }
            }
            Directive::Label { labels } => {
                for (key, value) in labels {
                    self.labels.insert(key.clone(), value.clone());
                }
            }
            Directive::Expose { ports } => self.exposed_ports.extend(ports.iter().cloned()),
            Directive::Volume { paths } => self.volumes.extend(paths.iter().cloned()),
            Directive::Workdir { path } => {
                self.workdir = Some(join_workdir(self.workdir.as_deref(), path));
            }
            Directive::User { user } => self.user = Some(user.clone()),
            Directive::Entrypoint { command } => {
                self.entrypoint = Some(command.clone());
                // ENTRYPOINT resets an inherited CMD.
                self.cmd = None;
            }
            Directive::Cmd { command } => self.cmd = Some(command.clone()),
            Directive::Healthcheck { config } => self.healthcheck = config.clone(),
            Directive::Stopsignal { signal } => self.stop_signal = Some(signal.clone()),
            Directive::Shell { shell } => self.shell = Some(shell.clone()),
            Directive::From { .. } | Directive::Arg { .. } | Directive::Run { .. } | Directive::Copy { .. } => {}
        }
        self
    }

    /// Shell for shell-form commands.
    pub fn shell(&self) -> Vec<String> {
        self.shell.clone().unwrap_or_else(|| DEFAULT_SHELL.iter().map(|s| s.to_string()).collect())
    }
}

/// Resolves a WORKDIR against the previous one.
fn join_workdir(current: Option<&str>, path: &str) -> String {
    if path.starts_with('/') {
        return path.to_string();
    }
    let base = current.unwrap_or("/");
    if base.ends_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Script parse error.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
    pub hint: Option<String>,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self { line, message: message.into(), hint: None }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Line {}: {}", self.line, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  Hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Parses and normalizes a build script.
///
/// # Examples
/// ```
/// use img_core::builder::parser::normalize;
/// use std::collections::BTreeMap;
///
/// let script = r#"
/// FROM alpine:3.19
/// RUN apk add --no-cache nginx
/// CMD ["nginx", "-g", "daemon off;"]
/// "#;
///
/// let stages = normalize(script, &BTreeMap::new()).unwrap();
/// assert_eq!(stages.len(), 1);
/// ```
pub fn normalize(content: &str, build_args: &BTreeMap<String, String>) -> Result<Vec<Stage>, ParseError> {
    ScriptParser::new(content, build_args).parse()
}

/// Substitutes `${name}`, `$name`, `${name:-word}` and `${name:+word}`.
///
/// Single pass, left to right: substituted text is never scanned again.
/// References to undefined names are kept verbatim. `\$` yields a literal `$`.
pub fn substitute(input: &str, vars: &BTreeMap<String, String>) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\\' && chars.get(i + 1) == Some(&'$') {
            out.push('$');
            i += 2;
            continue;
        }

        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }

        match chars.get(i + 1) {
            Some('{') => {
                let Some(close) = chars[i + 2..].iter().position(|&c| c == '}') else {
                    // Unterminated: keep the rest as is.
                    out.extend(&chars[i..]);
                    break;
                };
                let body: String = chars[i + 2..i + 2 + close].iter().collect();
                let literal: String = chars[i..i + 3 + close].iter().collect();
                out.push_str(&expand_braced(&body, &literal, vars));
                i += close + 3;
            }
            Some(&next) if next == '_' || next.is_ascii_alphabetic() => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end] == '_' || chars[end].is_ascii_alphanumeric()) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                match vars.get(&name) {
                    Some(value) => out.push_str(value),
                    None => out.extend(&chars[i..end]),
                }
                i = end;
            }
            _ => {
                out.push('$');
                i += 1;
            }
        }
    }

    out
}

fn expand_braced(body: &str, literal: &str, vars: &BTreeMap<String, String>) -> String {
    if let Some((name, word)) = body.split_once(":-") {
        return match vars.get(name) {
            Some(value) if !value.is_empty() => value.clone(),
            _ => word.to_string(),
        };
    }
    if let Some((name, word)) = body.split_once(":+") {
        return match vars.get(name) {
            Some(value) if !value.is_empty() => word.to_string(),
            _ => String::new(),
        };
    }
    match vars.get(body) {
        Some(value) => value.clone(),
        None => literal.to_string(),
    }
}

/// Resolves one word: single quotes suppress substitution, double quotes
/// are removed after substitution.
fn resolve_word(raw: &str, vars: &BTreeMap<String, String>) -> String {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return raw[1..raw.len() - 1].to_string();
    }
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return substitute(&raw[1..raw.len() - 1], vars);
    }
    substitute(raw, vars)
}

/// Splits a `key=value` token, resolving the value.
fn resolve_pair(token: &str, vars: &BTreeMap<String, String>) -> Option<(String, String)> {
    let idx = token.find('=')?;
    let key = resolve_word(&token[..idx], vars);
    let value = resolve_word(&token[idx + 1..], vars);
    Some((key, value))
}

/// Per-stage substitution state: build args in scope plus the stage config.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    args: BTreeMap<String, String>,
    config: StageConfig,
}

impl Snapshot {
    /// Variables visible to substitution. ENV shadows ARG.
    fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.args.clone();
        vars.extend(self.config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    fn apply(self, directive: &Directive) -> Self {
        let Snapshot { mut args, config } = self;
        if let Directive::Arg { name, value: Some(value) } = directive {
            args.insert(name.clone(), value.clone());
        }
        Snapshot { args, config: config.apply(directive) }
    }
}

/// Header of a stage, collected before any stage is parsed.
#[derive(Debug, Clone)]
struct StageHeader {
    line: usize,
    image: String,
    alias: Option<String>,
    platform: Option<String>,
}

/// Internal parser state.
struct ScriptParser<'a> {
    lines: Vec<(usize, String)>, // (line_number, content)
    build_args: &'a BTreeMap<String, String>,
}

impl<'a> ScriptParser<'a> {
    fn new(content: &str, build_args: &'a BTreeMap<String, String>) -> Self {
        Self { lines: Self::preprocess(content), build_args }
    }

    /// Preprocess: handle line continuations and remove comments.
    fn preprocess(content: &str) -> Vec<(usize, String)> {
        let mut result = Vec::new();
        let mut current_line = String::new();
        let mut current_line_num = 0;
        let mut continuation = false;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-based line numbers

            // Only whole-line comments are comments; `#` is valid inside arguments.
            if line.trim_start().starts_with('#') {
                continue;
            }

            let trimmed = line.trim_end();

            if trimmed.trim().is_empty() && !continuation {
                continue;
            }

            if continuation {
                current_line.push(' ');
                current_line.push_str(trimmed.trim_end_matches('\\').trim());
            } else {
                current_line_num = line_num;
                current_line = trimmed.trim_end_matches('\\').trim().to_string();
            }

            continuation = trimmed.ends_with('\\');

            if !continuation && !current_line.is_empty() {
                result.push((current_line_num, current_line.clone()));
                current_line.clear();
            }
        }

        // Handle final line if it was a continuation
        if !current_line.is_empty() {
            result.push((current_line_num, current_line));
        }

        result
    }

    fn parse(self) -> Result<Vec<Stage>, ParseError> {
        let mut pos = 0;
        let mut global_args: BTreeMap<String, String> = BTreeMap::new();

        // Global ARGs (before first FROM)
        while pos < self.lines.len() {
            let (line_num, line) = &self.lines[pos];
            let keyword = Self::extract_instruction(line);

            if keyword == "ARG" {
                let (_, rest) = Self::split_keyword(line);
                let (name, value) = self.parse_arg(*line_num, rest, &global_args, None)?;
                if let Some(value) = value {
                    global_args.insert(name, value);
                }
                pos += 1;
            } else if keyword == "FROM" {
                break;
            } else {
                return Err(ParseError::new(*line_num, format!("Expected ARG or FROM, found {}", keyword))
                    .with_hint("Build scripts must start with ARG or FROM"));
            }
        }

        // Split the rest into stage chunks at every FROM.
        let mut chunks: Vec<&[(usize, String)]> = Vec::new();
        let mut start = pos;
        for i in pos + 1..=self.lines.len() {
            if i == self.lines.len() || Self::extract_instruction(&self.lines[i].1) == "FROM" {
                if start < i {
                    chunks.push(&self.lines[start..i]);
                }
                start = i;
            }
        }

        if chunks.is_empty() {
            return Err(ParseError::new(
                self.lines.last().map(|(n, _)| *n).unwrap_or(1),
                "Build script must contain at least one FROM instruction",
            ));
        }

        let headers = chunks
            .iter()
            .map(|chunk| Self::parse_header(chunk[0].0, &chunk[0].1, &global_args))
            .collect::<Result<Vec<_>, _>>()?;

        let names = Self::stage_names(&headers)?;

        let mut stages: Vec<Stage> = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let stage = self.parse_stage(index, chunk, &headers, &names, &global_args, &stages)?;
            stages.push(stage);
        }

        Ok(stages)
    }

    /// Assigns names: `AS` aliases, else the index, else "" for the final stage.
    fn stage_names(headers: &[StageHeader]) -> Result<Vec<String>, ParseError> {
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        let mut names = Vec::with_capacity(headers.len());

        for (index, header) in headers.iter().enumerate() {
            let name = match &header.alias {
                Some(alias) => {
                    let valid = alias.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                        && alias.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c));
                    if !valid {
                        return Err(ParseError::new(header.line, format!("Invalid stage name: {}", alias))
                            .with_hint("Stage names start with a letter and contain only [a-z0-9-_.]"));
                    }
                    alias.to_ascii_lowercase()
                }
                None if index + 1 == headers.len() => String::new(),
                None => index.to_string(),
            };

            if !name.is_empty() {
                if let Some(first) = seen.insert(name.clone(), header.line) {
                    return Err(ParseError::new(header.line, format!("Duplicate stage name: {}", name))
                        .with_hint(format!("Stage {} is already defined on line {}", name, first)));
                }
            }
            names.push(name);
        }

        Ok(names)
    }

    fn parse_header(
        line_num: usize,
        line: &str,
        global_args: &BTreeMap<String, String>,
    ) -> Result<StageHeader, ParseError> {
        // FROM [--platform=<platform>] <image> [AS <name>]
        let (_, rest) = Self::split_keyword(line);
        let (flags, rest) = Self::split_flags(rest);

        let mut platform = None;
        for flag in flags {
            match flag.split_once('=') {
                Some(("--platform", value)) => platform = Some(substitute(value, global_args)),
                _ => {
                    return Err(ParseError::new(line_num, format!("Unknown FROM flag: {}", flag))
                        .with_hint("Usage: FROM [--platform=<platform>] <image> [AS <name>]"));
                }
            }
        }

        let args = Self::tokenize(rest);
        match args.as_slice() {
            [image] => Ok(StageHeader { line: line_num, image: substitute(image, global_args), alias: None, platform }),
            [image, as_kw, name] if as_kw.eq_ignore_ascii_case("AS") => Ok(StageHeader {
                line: line_num,
                image: substitute(image, global_args),
                alias: Some(name.clone()),
                platform,
            }),
            [] => Err(ParseError::new(line_num, "FROM instruction requires an image reference")
                .with_hint("Usage: FROM <image> [AS <name>]")),
            _ => Err(ParseError::new(line_num, "Malformed FROM instruction")
                .with_hint("Usage: FROM <image> [AS <name>]")),
        }
    }

    /// Finds the stage a name or index refers to, rejecting forward references.
    fn lookup_stage(
        line_num: usize,
        reference: &str,
        current: usize,
        names: &[String],
    ) -> Result<Option<usize>, ParseError> {
        let lowered = reference.to_ascii_lowercase();
        let found = names
            .iter()
            .position(|n| !n.is_empty() && *n == lowered)
            .or_else(|| lowered.parse::<usize>().ok().filter(|&i| i < names.len()));

        match found {
            Some(index) if index > current => Err(ParseError::new(
                line_num,
                format!("Stage {} is referenced before it is defined", reference),
            )
            .with_hint("Stages can only refer to stages defined earlier in the script")),
            other => Ok(other),
        }
    }

    fn parse_stage(
        &self,
        index: usize,
        chunk: &[(usize, String)],
        headers: &[StageHeader],
        names: &[String],
        global_args: &BTreeMap<String, String>,
        previous: &[Stage],
    ) -> Result<Stage, ParseError> {
        let header = &headers[index];

        let base = if header.image.eq_ignore_ascii_case("scratch") {
            BaseRef::Scratch
        } else {
            match Self::lookup_stage(header.line, &header.image, index, names)? {
                // A purely numeric image name is never a stage index.
                Some(source) if header.image.parse::<usize>().is_err() => {
                    BaseRef::Stage { index: source, name: names[source].clone() }
                }
                _ => BaseRef::Image(ImageRef::parse(&header.image)),
            }
        };

        let platform = match &header.platform {
            Some(value) => Some(value.parse::<Platform>().map_err(|e| ParseError::new(header.line, e.to_string()))?),
            None => None,
        };

        // A derived stage starts from its parent's metadata.
        let inherited = match &base {
            BaseRef::Stage { index: source, .. } if *source < index => previous[*source].config.clone(),
            _ => StageConfig::default(),
        };

        let mut snapshot = Snapshot { args: global_args.clone(), config: inherited };
        let mut instructions = Vec::with_capacity(chunk.len().saturating_sub(1));

        for (line_num, line) in &chunk[1..] {
            let instruction = self.parse_instruction(*line_num, line, index, names, &snapshot, global_args)?;
            snapshot = snapshot.apply(&instruction.directive);
            instructions.push(instruction);
        }

        Ok(Stage {
            name: names[index].clone(),
            index,
            line: header.line,
            base,
            platform,
            instructions,
            config: snapshot.config,
        })
    }

    fn parse_instruction(
        &self,
        line_num: usize,
        line: &str,
        stage_index: usize,
        names: &[String],
        snapshot: &Snapshot,
        global_args: &BTreeMap<String, String>,
    ) -> Result<Instruction, ParseError> {
        let (keyword, rest) = Self::split_keyword(line);
        let raw = Self::tokenize(rest);
        let vars = snapshot.vars();

        let directive = match keyword.to_uppercase().as_str() {
            "RUN" => self.parse_run(line_num, rest)?,
            "COPY" | "ADD" => self.parse_copy(line_num, rest, stage_index, names)?,
            "ENV" => self.parse_env(line_num, rest, &vars)?,
            "ARG" => {
                let (name, value) = self.parse_arg(line_num, rest, &vars, Some(global_args))?;
                Directive::Arg { name, value }
            }
            "LABEL" => self.parse_label(line_num, &raw, &vars)?,
            "EXPOSE" => self.parse_expose(line_num, &raw, &vars)?,
            "WORKDIR" => Directive::Workdir { path: self.required_value(line_num, "WORKDIR", rest, &vars)? },
            "USER" => Directive::User { user: self.required_value(line_num, "USER", rest, &vars)? },
            "VOLUME" => self.parse_volume(line_num, &raw, &vars)?,
            "ENTRYPOINT" => Directive::Entrypoint { command: self.parse_run_command(rest) },
            "CMD" => Directive::Cmd { command: self.parse_run_command(rest) },
            "HEALTHCHECK" => self.parse_healthcheck(line_num, &raw, rest)?,
            "STOPSIGNAL" => Directive::Stopsignal { signal: rest.trim().to_string() },
            "SHELL" => self.parse_shell(line_num, rest)?,
            "MAINTAINER" => Directive::Label {
                labels: vec![("maintainer".to_string(), rest.trim().to_string())],
            },
            "FROM" => unreachable!("FROM always starts a new stage"),
            other => return Err(ParseError::new(line_num, format!("Unknown instruction: {}", other))),
        };

        Ok(Instruction { line: line_num, raw, directive })
    }

    fn parse_run(&self, line_num: usize, rest: &str) -> Result<Directive, ParseError> {
        let (flags, command) = Self::split_flags(rest);

        let mut mounts = Vec::new();
        for flag in flags {
            match flag.split_once('=') {
                Some(("--mount", spec)) => {
                    let ssh_count = mounts.iter().filter(|m: &&RunMount| m.kind == MountKind::Ssh).count();
                    mounts.push(Self::parse_mount(line_num, spec, ssh_count)?);
                }
                _ => {
                    return Err(ParseError::new(line_num, format!("Unknown RUN flag: {}", flag))
                        .with_hint("Supported: --mount=type=secret|ssh,..."));
                }
            }
        }

        if command.trim().is_empty() {
            return Err(ParseError::new(line_num, "RUN instruction requires a command")
                .with_hint("Usage: RUN <command> or RUN [\"executable\", \"arg1\"]"));
        }

        Ok(Directive::Run { command: self.parse_run_command(command), mounts })
    }

    /// Parses `type=secret|ssh,id=...,target=...,required`.
    fn parse_mount(line_num: usize, spec: &str, ssh_index: usize) -> Result<RunMount, ParseError> {
        let mut kind = None;
        let mut id = None;
        let mut target = None;
        let mut required = false;

        for field in spec.split(',').filter(|f| !f.is_empty()) {
            let (key, value) = field.split_once('=').unwrap_or((field, ""));
            match key {
                "type" => {
                    kind = Some(match value {
                        "secret" => MountKind::Secret,
                        "ssh" => MountKind::Ssh,
                        other => {
                            return Err(ParseError::new(line_num, format!("Unsupported mount type: {}", other))
                                .with_hint("Supported mount types: secret, ssh"));
                        }
                    })
                }
                "id" => id = Some(value.to_string()),
                "target" | "dst" | "destination" => target = Some(value.to_string()),
                "required" => required = value.is_empty() || value == "true",
                // Accepted for compatibility; ownership of mounts is left to the sandbox.
                "mode" | "uid" | "gid" => {}
                _ => {
                    return Err(ParseError::new(line_num, format!("Unknown mount option: {}", key)));
                }
            }
        }

        let kind = kind.ok_or_else(|| {
            ParseError::new(line_num, "Mount is missing type").with_hint("Usage: --mount=type=secret,id=<id>")
        })?;

        let mount = match kind {
            MountKind::Secret => {
                let id = match (id, &target) {
                    (Some(id), _) if !id.is_empty() => id,
                    // BuildKit derives the id from the target's file name.
                    (_, Some(t)) => t.rsplit('/').next().unwrap_or_default().to_string(),
                    _ => {
                        return Err(ParseError::new(line_num, "Secret mount requires an id or target"));
                    }
                };
                let target = target.unwrap_or_else(|| format!("{}/{}", SECRET_MOUNT_DIR, id));
                RunMount { kind, id, target, required }
            }
            MountKind::Ssh => {
                let id = id.filter(|id| !id.is_empty()).unwrap_or_else(|| "default".to_string());
                let target = target.unwrap_or_else(|| format!("/run/buildkit/ssh_agent.{}", ssh_index));
                RunMount { kind, id, target, required }
            }
        };

        if !mount.target.starts_with('/') {
            return Err(ParseError::new(line_num, format!("Mount target must be absolute: {}", mount.target)));
        }

        Ok(mount)
    }

    fn parse_run_command(&self, rest: &str) -> RunCommand {
        let trimmed = rest.trim();
        if trimmed.starts_with('[') {
            if let Ok(exec_args) = serde_json::from_str::<Vec<String>>(trimmed) {
                return RunCommand::Exec(exec_args);
            }
        }

        RunCommand::Shell(trimmed.to_string())
    }

    fn parse_copy(
        &self,
        line_num: usize,
        rest: &str,
        stage_index: usize,
        names: &[String],
    ) -> Result<Directive, ParseError> {
        // COPY [--from=<stage>] [--chown=<user>:<group>] <src>... <dest>
        let (flags, rest) = Self::split_flags(rest);
        let mut from = None;
        let mut chown = None;

        for flag in flags {
            match flag.split_once('=') {
                Some(("--from", value)) => {
                    from = Some(match Self::lookup_stage(line_num, value, stage_index, names)? {
                        Some(index) => CopySource::Stage(index),
                        None => CopySource::Unresolved(value.to_string()),
                    });
                }
                Some(("--chown", value)) => chown = Some(value.to_string()),
                // Permissions and link handling follow the sandbox defaults.
                Some(("--chmod", _)) | Some(("--link", _)) => {}
                _ if flag == "--link" => {}
                _ => return Err(ParseError::new(line_num, format!("Unknown COPY flag: {}", flag))),
            }
        }

        let trimmed = rest.trim();
        let args = if trimmed.starts_with('[') {
            serde_json::from_str::<Vec<String>>(trimmed)
                .map_err(|_| ParseError::new(line_num, "Invalid JSON array for COPY"))?
        } else {
            Self::tokenize(trimmed)
        };

        if args.len() < 2 {
            return Err(ParseError::new(line_num, "COPY requires at least source and destination")
                .with_hint("Usage: COPY <src>... <dest>"));
        }

        let sources = args[..args.len() - 1].to_vec();
        if let Some(url) = sources.iter().find(|s| s.starts_with("http://") || s.starts_with("https://")) {
            return Err(ParseError::new(line_num, format!("Remote sources are not supported: {}", url)));
        }
        let destination = args[args.len() - 1].clone();

        Ok(Directive::Copy { from, sources, destination, chown })
    }

    fn parse_env(&self, line_num: usize, rest: &str, vars: &BTreeMap<String, String>) -> Result<Directive, ParseError> {
        // ENV key=value ... or ENV key value
        let args = Self::tokenize(rest);
        if args.is_empty() {
            return Err(ParseError::new(line_num, "ENV requires at least one key=value pair"));
        }

        let mut resolved = Vec::new();

        if args[0].contains('=') {
            // Later pairs on the same line see earlier ones.
            let mut scope = vars.clone();
            for arg in &args {
                let (key, value) = resolve_pair(arg, &scope)
                    .ok_or_else(|| ParseError::new(line_num, format!("ENV expects key=value, found {}", arg)))?;
                scope.insert(key.clone(), value.clone());
                resolved.push((key, value));
            }
        } else {
            // key value form: the value is the rest of the line, spacing preserved.
            let trimmed = rest.trim_start();
            let key_end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
            let value = trimmed[key_end..].trim();
            if value.is_empty() {
                return Err(ParseError::new(line_num, "ENV requires a value"));
            }
            resolved.push((args[0].clone(), resolve_word(value, vars)));
        }

        Ok(Directive::Env { vars: resolved })
    }

    /// Parses `ARG name[=default]`; in-stage ARGs fall back to global values.
    fn parse_arg(
        &self,
        line_num: usize,
        rest: &str,
        vars: &BTreeMap<String, String>,
        global_args: Option<&BTreeMap<String, String>>,
    ) -> Result<(String, Option<String>), ParseError> {
        let args = Self::tokenize(rest);
        let Some(first) = args.first() else {
            return Err(ParseError::new(line_num, "ARG requires a name").with_hint("Usage: ARG <name>[=<default>]"));
        };

        let (name, default) = match first.split_once('=') {
            Some((name, default)) => (name.to_string(), Some(resolve_word(default, vars))),
            None => (first.clone(), None),
        };

        let value = self
            .build_args
            .get(&name)
            .cloned()
            .or(default)
            .or_else(|| global_args.and_then(|g| g.get(&name).cloned()));

        Ok((name, value))
    }

    fn parse_label(
        &self,
        line_num: usize,
        args: &[String],
        vars: &BTreeMap<String, String>,
    ) -> Result<Directive, ParseError> {
        if args.is_empty() {
            return Err(ParseError::new(line_num, "LABEL requires at least one key=value pair"));
        }

        // Legacy `LABEL key value` form.
        if !args[0].contains('=') {
            if args.len() < 2 {
                return Err(ParseError::new(line_num, "LABEL requires a value"));
            }
            let value = resolve_word(&args[1..].join(" "), vars);
            return Ok(Directive::Label { labels: vec![(resolve_word(&args[0], vars), value)] });
        }

        let mut labels = Vec::new();
        for arg in args {
            let pair = resolve_pair(arg, vars)
                .ok_or_else(|| ParseError::new(line_num, format!("LABEL expects key=value, found {}", arg)))?;
            labels.push(pair);
        }

        Ok(Directive::Label { labels })
    }

    fn parse_expose(
        &self,
        line_num: usize,
        args: &[String],
        vars: &BTreeMap<String, String>,
    ) -> Result<Directive, ParseError> {
        if args.is_empty() {
            return Err(ParseError::new(line_num, "EXPOSE requires at least one port"));
        }

        // Each token resolves independently; the result is not re-split.
        let ports = args.iter().map(|arg| resolve_word(arg, vars)).collect();
        Ok(Directive::Expose { ports })
    }

    fn parse_volume(
        &self,
        line_num: usize,
        args: &[String],
        vars: &BTreeMap<String, String>,
    ) -> Result<Directive, ParseError> {
        // VOLUME ["/data"] or VOLUME /data /var/log
        let paths = if args.len() == 1 && args[0].starts_with('[') {
            serde_json::from_str::<Vec<String>>(&args[0])
                .map_err(|_| ParseError::new(line_num, "Invalid JSON array for VOLUME"))?
                .iter()
                .map(|p| substitute(p, vars))
                .collect()
        } else {
            args.iter().map(|arg| resolve_word(arg, vars)).collect::<Vec<_>>()
        };

        if paths.is_empty() {
            return Err(ParseError::new(line_num, "VOLUME requires at least one path"));
        }

        Ok(Directive::Volume { paths })
    }

    fn required_value(
        &self,
        line_num: usize,
        keyword: &str,
        rest: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<String, ParseError> {
        let value = resolve_word(rest.trim(), vars);
        if value.is_empty() {
            return Err(ParseError::new(line_num, format!("{} requires a value", keyword)));
        }
        Ok(value)
    }

    fn parse_healthcheck(&self, line_num: usize, args: &[String], rest: &str) -> Result<Directive, ParseError> {
        // HEALTHCHECK [OPTIONS] CMD command | HEALTHCHECK NONE
        if args.len() == 1 && args[0].eq_ignore_ascii_case("NONE") {
            return Ok(Directive::Healthcheck { config: None });
        }

        let mut interval = None;
        let mut timeout = None;
        let mut start_period = None;
        let mut retries = None;

        let (flags, command) = Self::split_flags(rest);
        for flag in flags {
            match flag.split_once('=') {
                Some(("--interval", v)) => interval = Some(v.to_string()),
                Some(("--timeout", v)) => timeout = Some(v.to_string()),
                Some(("--start-period", v)) => start_period = Some(v.to_string()),
                Some(("--retries", v)) => {
                    retries = Some(v.parse().map_err(|_| {
                        ParseError::new(line_num, format!("Invalid retries value: {}", v))
                    })?);
                }
                _ => return Err(ParseError::new(line_num, format!("Unknown HEALTHCHECK flag: {}", flag))),
            }
        }

        let (keyword, command) = Self::split_keyword(command);
        if !keyword.eq_ignore_ascii_case("CMD") || command.trim().is_empty() {
            return Err(ParseError::new(line_num, "HEALTHCHECK requires CMD <command> or NONE"));
        }

        Ok(Directive::Healthcheck {
            config: Some(HealthcheckConfig {
                command: self.parse_run_command(command),
                interval,
                timeout,
                start_period,
                retries,
            }),
        })
    }

    fn parse_shell(&self, line_num: usize, rest: &str) -> Result<Directive, ParseError> {
        // SHELL ["executable", "parameters"]
        let shell = serde_json::from_str::<Vec<String>>(rest.trim()).map_err(|_| {
            ParseError::new(line_num, "SHELL requires JSON array format")
                .with_hint("Usage: SHELL [\"executable\", \"arg1\", \"arg2\"]")
        })?;
        if shell.is_empty() {
            return Err(ParseError::new(line_num, "SHELL requires at least one element"));
        }

        Ok(Directive::Shell { shell })
    }

    fn extract_instruction(line: &str) -> String {
        line.split_whitespace().next().unwrap_or("").to_uppercase()
    }

    /// Splits off the instruction keyword, returning the raw remainder.
    fn split_keyword(line: &str) -> (&str, &str) {
        let trimmed = line.trim_start();
        match trimmed.find(char::is_whitespace) {
            Some(idx) => (&trimmed[..idx], trimmed[idx..].trim_start()),
            None => (trimmed, ""),
        }
    }

    /// Splits leading `--flag[=value]` tokens off the raw remainder.
    fn split_flags(rest: &str) -> (Vec<&str>, &str) {
        let mut flags = Vec::new();
        let mut rest = rest.trim_start();
        while rest.starts_with("--") {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            flags.push(&rest[..end]);
            rest = rest[end..].trim_start();
        }
        (flags, rest)
    }

    /// Simple tokenizer that respects quotes and JSON arrays.
    fn tokenize(s: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut quote: Option<char> = None;
        let mut in_json = 0;

        for c in s.chars() {
            match c {
                '"' | '\'' if in_json == 0 && (quote.is_none() || quote == Some(c)) => {
                    quote = if quote.is_some() { None } else { Some(c) };
                    current.push(c);
                }
                '[' if quote.is_none() && current.is_empty() || in_json > 0 && c == '[' => {
                    in_json += 1;
                    current.push(c);
                }
                ']' if quote.is_none() && in_json > 0 => {
                    in_json -= 1;
                    current.push(c);
                    if in_json == 0 {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                ' ' | '\t' if quote.is_none() && in_json == 0 => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            }
        }

        if !current.is_empty() {
            tokens.push(current);
        }

        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(script: &str) -> Vec<Stage> {
        normalize(script, &BTreeMap::new()).unwrap()
    }

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_simple_script() {
        let stages = parse(
            r#"
FROM alpine:3.19
RUN apk add --no-cache nginx
CMD ["nginx", "-g", "daemon off;"]
        "#,
        );
        assert_eq!(stages.len(), 1);

        let stage = &stages[0];
        assert_eq!(stage.name, "");
        assert!(matches!(&stage.base, BaseRef::Image(r) if r.name == "alpine" && r.tag.as_deref() == Some("3.19")));
        assert_eq!(stage.instructions.len(), 2);
        assert_eq!(
            stage.config.cmd,
            Some(RunCommand::Exec(vec!["nginx".into(), "-g".into(), "daemon off;".into()]))
        );
    }

    #[test]
    fn test_multi_stage_build() {
        let stages = parse(
            r#"
FROM golang:1.21 AS builder
WORKDIR /app
COPY . .
RUN go build -o myapp

FROM alpine:3.19
COPY --from=builder /app/myapp /usr/local/bin/
CMD ["myapp"]
        "#,
        );
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].name, "builder");
        assert_eq!(stages[1].name, "");

        match &stages[1].instructions[0].directive {
            Directive::Copy { from, sources, destination, .. } => {
                assert_eq!(from, &Some(CopySource::Stage(0)));
                assert_eq!(sources, &vec!["/app/myapp".to_string()]);
                assert_eq!(destination, "/usr/local/bin/");
            }
            other => panic!("Expected COPY, got {:?}", other),
        }
    }

    #[test]
    fn test_unnamed_intermediate_stage_uses_index() {
        let stages = parse("FROM scratch\nFROM scratch\nCOPY --from=0 /a /b\n");
        assert_eq!(stages[0].name, "0");
        assert_eq!(stages[1].name, "");
        assert!(matches!(
            &stages[1].instructions[0].directive,
            Directive::Copy { from: Some(CopySource::Stage(0)), .. }
        ));
    }

    #[test]
    fn test_global_arg_substitutes_from() {
        let stages = parse("ARG VERSION=1.0\nFROM alpine:${VERSION}\n");
        assert!(matches!(&stages[0].base, BaseRef::Image(r) if r.tag.as_deref() == Some("1.0")));

        let overrides = vars(&[("VERSION", "2.0")]);
        let stages = normalize("ARG VERSION=1.0\nFROM alpine:${VERSION}\n", &overrides).unwrap();
        assert!(matches!(&stages[0].base, BaseRef::Image(r) if r.tag.as_deref() == Some("2.0")));
    }

    #[test]
    fn test_line_continuation() {
        let stages = parse(
            r#"
FROM alpine:3.19
RUN apk add --no-cache \
    nginx \
    curl \
    bash
        "#,
        );
        assert_eq!(stages[0].instructions.len(), 1);
        assert!(matches!(
            &stages[0].instructions[0].directive,
            Directive::Run { command: RunCommand::Shell(cmd), .. } if cmd == "apk add --no-cache nginx curl bash"
        ));
    }

    #[test]
    fn test_comments() {
        let stages = parse(
            r#"
# This is a comment
FROM alpine:3.19
# Another comment
RUN echo "hello # not a comment"
        "#,
        );
        assert_eq!(stages.len(), 1);
        assert!(matches!(
            &stages[0].instructions[0].directive,
            Directive::Run { command: RunCommand::Shell(cmd), .. } if cmd.contains("# not a comment")
        ));
    }

    #[test]
    fn test_env_forms() {
        let stages = parse(
            r#"
FROM alpine
ENV KEY1=value1 KEY2=value2
ENV KEY3 value with spaces
ENV KEY4="quoted value" KEY5=$KEY1
        "#,
        );
        let env = &stages[0].config.env;
        assert_eq!(env.get("KEY1").map(String::as_str), Some("value1"));
        assert_eq!(env.get("KEY3").map(String::as_str), Some("value with spaces"));
        assert_eq!(env.get("KEY4").map(String::as_str), Some("quoted value"));
        assert_eq!(env.get("KEY5").map(String::as_str), Some("value1"));
    }

    #[test]
    fn test_environment_replacement_expose() {
        let stages = parse(
            r#"
  FROM scratch
  ENV port 80
  EXPOSE ${port}
  ENV ports "  99   100 "
  EXPOSE ${ports}
  "#,
        );
        let stage = &stages[0];
        assert!(matches!(
            &stage.instructions[1].directive,
            Directive::Expose { ports } if ports == &vec!["80".to_string()]
        ));
        assert!(matches!(
            &stage.instructions[3].directive,
            Directive::Expose { ports } if ports == &vec!["  99   100 ".to_string()]
        ));
        assert_eq!(stage.instructions[3].raw, vec!["${ports}".to_string()]);
    }

    #[test]
    fn test_environment_replacement_user_volume_workdir() {
        let stages = parse(
            r#"
FROM busybox
ENV user foo
USER ${user}
ENV volume /quux
VOLUME ${volume}
ENV MYWORKDIR /work
RUN mkdir ${MYWORKDIR}
WORKDIR ${MYWORKDIR}
WORKDIR sub
        "#,
        );
        let config = &stages[0].config;
        assert_eq!(config.user.as_deref(), Some("foo"));
        assert!(config.volumes.contains("/quux"));
        assert_eq!(config.workdir.as_deref(), Some("/work/sub"));

        // RUN is left to the shell.
        assert!(matches!(
            &stages[0].instructions[5].directive,
            Directive::Run { command: RunCommand::Shell(cmd), .. } if cmd == "mkdir ${MYWORKDIR}"
        ));
    }

    #[test]
    fn test_undefined_variable_is_literal() {
        let stages = parse("FROM scratch\nUSER ${nobody}\nLABEL a=$missing\n");
        assert_eq!(stages[0].config.user.as_deref(), Some("${nobody}"));
        assert_eq!(stages[0].config.labels.get("a").map(String::as_str), Some("$missing"));
    }

    #[test]
    fn test_substitution_is_single_pass() {
        let env = vars(&[("a", "$b"), ("b", "nested")]);
        assert_eq!(substitute("${a}", &env), "$b");
        assert_eq!(substitute("x-$a-y", &env), "x-$b-y");
    }

    #[test]
    fn test_substitution_modifiers() {
        let env = vars(&[("set", "v"), ("empty", "")]);
        assert_eq!(substitute("${set:-d}", &env), "v");
        assert_eq!(substitute("${empty:-d}", &env), "d");
        assert_eq!(substitute("${unset:-d}", &env), "d");
        assert_eq!(substitute("${set:+alt}", &env), "alt");
        assert_eq!(substitute("${unset:+alt}", &env), "");
        assert_eq!(substitute("\\$set", &env), "$set");
        assert_eq!(substitute("cost: $5", &env), "cost: $5");
    }

    #[test]
    fn test_single_quotes_suppress_substitution() {
        let stages = parse("FROM scratch\nENV a=1\nLABEL x='$a' y=\"$a\"\n");
        let labels = &stages[0].config.labels;
        assert_eq!(labels.get("x").map(String::as_str), Some("$a"));
        assert_eq!(labels.get("y").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_stage_args() {
        let script = "ARG G=global\nFROM scratch\nARG G\nARG L=local\nENV OUT=$G-$L\n";
        let stages = parse(script);
        assert_eq!(stages[0].config.env.get("OUT").map(String::as_str), Some("global-local"));

        let stages = normalize(script, &vars(&[("L", "cli")])).unwrap();
        assert_eq!(stages[0].config.env.get("OUT").map(String::as_str), Some("global-cli"));
    }

    #[test]
    fn test_labels_per_stage() {
        let stages = parse(
            r#"
  FROM scratch as builder
  LABEL stage "builder"
  FROM scratch
  LABEL stage "final"
  "#,
        );
        assert_eq!(stages[0].config.labels.get("stage").map(String::as_str), Some("builder"));
        assert_eq!(stages[1].config.labels.get("stage").map(String::as_str), Some("final"));
    }

    #[test]
    fn test_derived_stage_inherits_config() {
        let stages = parse("FROM scratch AS base\nENV A=1\nLABEL l=base\nFROM base\nENV B=$A\n");
        assert_eq!(stages[1].base, BaseRef::Stage { index: 0, name: "base".into() });
        assert_eq!(stages[1].config.env.get("B").map(String::as_str), Some("1"));
        assert_eq!(stages[1].config.labels.get("l").map(String::as_str), Some("base"));
    }

    #[test]
    fn test_run_mounts() {
        let stages = parse(
            r#"
FROM alpine
RUN --mount=type=secret,id=s1,dst=/tmp/secret1 \
    --mount=type=secret,id=s2 \
    cat /tmp/secret1 /run/secrets/s2
RUN --mount=type=ssh ssh-add -l
RUN --mount=type=ssh,id=key,required ssh-add -l
        "#,
        );
        let mounts: Vec<&Vec<RunMount>> = stages[0]
            .instructions
            .iter()
            .filter_map(|i| match &i.directive {
                Directive::Run { mounts, .. } => Some(mounts),
                _ => None,
            })
            .collect();

        assert_eq!(mounts[0].len(), 2);
        assert_eq!(mounts[0][0].target, "/tmp/secret1");
        assert_eq!(mounts[0][1].target, "/run/secrets/s2");
        assert_eq!(mounts[1][0].kind, MountKind::Ssh);
        assert_eq!(mounts[1][0].id, "default");
        assert_eq!(mounts[1][0].target, "/run/buildkit/ssh_agent.0");
        assert!(mounts[2][0].required);

        assert!(matches!(
            &stages[0].instructions[0].directive,
            Directive::Run { command: RunCommand::Shell(cmd), .. } if cmd == "cat /tmp/secret1 /run/secrets/s2"
        ));
    }

    #[test]
    fn test_unsupported_mount_type() {
        let err = normalize("FROM alpine\nRUN --mount=type=cache,target=/x true\n", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_error_no_from() {
        assert!(normalize("RUN echo hello", &BTreeMap::new()).is_err());
        assert!(normalize("", &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_error_unknown_instruction() {
        let err = normalize("FROM alpine\nINVALID instruction\n", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_error_duplicate_stage_names() {
        let err = normalize("FROM scratch AS a\nFROM scratch AS A\n", &BTreeMap::new()).unwrap_err();
        assert!(err.message.contains("Duplicate stage name"));
    }

    #[test]
    fn test_error_forward_stage_reference() {
        let err = normalize("FROM scratch AS a\nCOPY --from=b /x /y\nFROM scratch AS b\n", &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.line, 2);

        let err = normalize("FROM later\nFROM scratch AS later\n", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_self_reference_is_left_to_graph() {
        let stages = parse("FROM loop AS loop\n");
        assert_eq!(stages[0].base, BaseRef::Stage { index: 0, name: "loop".into() });
    }

    #[test]
    fn test_unknown_copy_source_is_unresolved() {
        let stages = parse("FROM alpine\nCOPY --from=nonexistent /app/file /dest/\n");
        assert!(matches!(
            &stages[0].instructions[0].directive,
            Directive::Copy { from: Some(CopySource::Unresolved(name)), .. } if name == "nonexistent"
        ));
    }

    #[test]
    fn test_from_platform_flag() {
        let stages = parse("FROM --platform=linux/amd64 alpine AS a\nFROM scratch\n");
        assert_eq!(stages[0].platform, Some("linux/amd64".parse().unwrap()));
        assert!(normalize("FROM --platform=a//b alpine\n", &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_image_ref_parse() {
        let r = ImageRef::parse("localhost:5000/app:v1@sha256:abc");
        assert_eq!(r.name, "localhost:5000/app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abc"));

        let r = ImageRef::parse("localhost:5000/app");
        assert_eq!(r.name, "localhost:5000/app");
        assert_eq!(r.tag, None);
    }

    #[test]
    fn test_entrypoint_resets_cmd() {
        let stages = parse("FROM busybox\nCMD echo test\nENTRYPOINT [\"echo\"]\n");
        assert_eq!(stages[0].config.entrypoint, Some(RunCommand::Exec(vec!["echo".into()])));
        assert_eq!(stages[0].config.cmd, None);

        let stages = parse("FROM busybox\nENTRYPOINT [\"echo\"]\nCMD echo test\n");
        assert_eq!(stages[0].config.cmd, Some(RunCommand::Shell("echo test".into())));
    }

    #[test]
    fn test_healthcheck_and_shell() {
        let stages = parse(
            "FROM alpine\nHEALTHCHECK --interval=5s --retries=3 CMD curl -f http://localhost/\nSHELL [\"/bin/bash\", \"-c\"]\n",
        );
        let config = &stages[0].config;
        let health = config.healthcheck.as_ref().unwrap();
        assert_eq!(health.interval.as_deref(), Some("5s"));
        assert_eq!(health.retries, Some(3));
        assert_eq!(config.shell(), vec!["/bin/bash".to_string(), "-c".to_string()]);
    }
}
