//! Container build file parsing
//!
//! Only as much of the Dockerfile grammar as the pipeline needs: instruction
//! splitting with line continuations and comments, plus the handful of
//! instructions that make up the service contract (port, environment,
//! health check, start command). Heredoc bodies (`RUN <<EOF`) are skipped.

use crate::health::{ProbeSettings, DEFAULT_HEALTH_PATH};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Port the service binds when nothing else says otherwise
pub const DEFAULT_SERVICE_PORT: u16 = 8080;

const KNOWN_INSTRUCTIONS: &[&str] = &[
    "ADD", "ARG", "CMD", "COPY", "ENTRYPOINT", "ENV", "EXPOSE", "FROM", "HEALTHCHECK", "LABEL",
    "MAINTAINER", "ONBUILD", "RUN", "SHELL", "STOPSIGNAL", "USER", "VOLUME", "WORKDIR",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildFileError {
    #[error("line {line}: unknown instruction '{keyword}'")]
    UnknownInstruction { line: usize, keyword: String },

    #[error("line {line}: {keyword} requires arguments")]
    MissingArguments { line: usize, keyword: String },

    #[error("line continuation at end of file")]
    DanglingContinuation,

    #[error("line {line}: heredoc '{delimiter}' is never terminated")]
    UnterminatedHeredoc { line: usize, delimiter: String },

    #[error("no FROM instruction")]
    MissingFrom,

    #[error("line {line}: instruction {keyword} before FROM")]
    InstructionBeforeFrom { line: usize, keyword: String },

    #[error("line {line}: invalid HEALTHCHECK option '{option}'")]
    InvalidHealthCheckOption { line: usize, option: String },

    #[error("line {line}: invalid port '{value}'")]
    InvalidPort { line: usize, value: String },

    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
}

/// One logical instruction (continuations already joined)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Upper-cased keyword
    pub keyword: String,
    pub args: String,
    /// Line the instruction starts on (1-based)
    pub line: usize,
}

/// `HEALTHCHECK` instruction contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckInstruction {
    /// `HEALTHCHECK NONE`
    Disabled,
    Command {
        settings: ProbeSettings,
        command: String,
    },
}

/// What the pipeline needs to know about the packaged service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContract {
    pub port: u16,
    /// Probe derived from the build file's health check, if any
    pub health: Option<ProbeSettings>,
}

impl ServiceContract {
    /// Probe settings to use against the deployed service
    pub fn probe_settings(&self) -> ProbeSettings {
        self.health.clone().unwrap_or_default()
    }
}

/// A parsed build file
#[derive(Debug, Clone)]
pub struct BuildFile {
    pub instructions: Vec<Instruction>,
}

impl BuildFile {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BuildFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| BuildFileError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, BuildFileError> {
        let mut instructions = Vec::new();
        let mut pending: Option<(usize, String)> = None;
        // Delimiters still open, with the line that opened them
        let mut heredocs: VecDeque<(usize, String)> = VecDeque::new();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = raw.trim();

            if let Some((_, delimiter)) = heredocs.front() {
                if trimmed == delimiter.as_str() {
                    heredocs.pop_front();
                }
                continue;
            }

            // Comments and blank lines are dropped, even inside a continuation
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (text, continues) = match trimmed.strip_suffix('\\') {
                Some(stripped) => (stripped.trim_end(), true),
                None => (trimmed, false),
            };

            let (start, mut joined) = pending.take().unwrap_or((line_no, String::new()));
            if !joined.is_empty() {
                joined.push(' ');
            }
            joined.push_str(text);

            if continues {
                pending = Some((start, joined));
            } else {
                let instruction = Self::parse_instruction(start, &joined)?;
                if matches!(instruction.keyword.as_str(), "RUN" | "COPY" | "ADD") {
                    heredocs.extend(heredoc_delimiters(&instruction.args).map(|d| (start, d)));
                }
                instructions.push(instruction);
            }
        }

        if pending.is_some() {
            return Err(BuildFileError::DanglingContinuation);
        }
        if let Some((line, delimiter)) = heredocs.pop_front() {
            return Err(BuildFileError::UnterminatedHeredoc { line, delimiter });
        }

        Self::check_order(&instructions)?;

        let build_file = Self { instructions };
        // Surface malformed contract instructions as syntax errors
        build_file.exposed_ports()?;
        build_file.healthcheck()?;

        Ok(build_file)
    }

    fn parse_instruction(line: usize, text: &str) -> Result<Instruction, BuildFileError> {
        let (keyword, args) = match text.split_once(char::is_whitespace) {
            Some((keyword, args)) => (keyword, args.trim()),
            None => (text, ""),
        };
        let keyword = keyword.to_ascii_uppercase();

        if !KNOWN_INSTRUCTIONS.contains(&keyword.as_str()) {
            return Err(BuildFileError::UnknownInstruction { line, keyword });
        }
        if args.is_empty() {
            return Err(BuildFileError::MissingArguments { line, keyword });
        }

        Ok(Instruction {
            keyword,
            args: args.to_string(),
            line,
        })
    }

    /// Only ARG may precede the first FROM
    fn check_order(instructions: &[Instruction]) -> Result<(), BuildFileError> {
        for instruction in instructions {
            match instruction.keyword.as_str() {
                "FROM" => return Ok(()),
                "ARG" => continue,
                _ => {
                    return Err(BuildFileError::InstructionBeforeFrom {
                        line: instruction.line,
                        keyword: instruction.keyword.clone(),
                    })
                }
            }
        }
        Err(BuildFileError::MissingFrom)
    }

    fn all<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a Instruction> + 'a {
        self.instructions.iter().filter(move |i| i.keyword == keyword)
    }

    fn last(&self, keyword: &str) -> Option<&Instruction> {
        self.instructions.iter().rev().find(|i| i.keyword == keyword)
    }

    /// Base image of the final stage
    pub fn base_image(&self) -> Option<&str> {
        self.last("FROM")
            .and_then(|i| i.args.split_whitespace().find(|word| !word.starts_with("--")))
    }

    pub fn workdir(&self) -> Option<&str> {
        self.last("WORKDIR").map(|i| i.args.as_str())
    }

    /// Start command (CMD, falling back to ENTRYPOINT)
    pub fn command(&self) -> Option<&str> {
        self.last("CMD")
            .or_else(|| self.last("ENTRYPOINT"))
            .map(|i| i.args.as_str())
    }

    /// Environment set by ENV instructions, later values winning
    pub fn env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for instruction in self.all("ENV") {
            let args = instruction.args.as_str();
            let first = args.split_whitespace().next().unwrap_or_default();

            if first.contains('=') {
                for pair in split_words(args) {
                    if let Some((key, value)) = pair.split_once('=') {
                        env.insert(key.to_string(), unquote(value));
                    }
                }
            } else if let Some((key, value)) = args.split_once(char::is_whitespace) {
                // Legacy `ENV KEY value with spaces`
                env.insert(key.to_string(), unquote(value.trim()));
            }
        }
        env
    }

    /// Ports from EXPOSE instructions (protocol suffixes dropped, ranges
    /// contribute their first port)
    pub fn exposed_ports(&self) -> Result<Vec<u16>, BuildFileError> {
        let mut ports = Vec::new();
        for instruction in self.all("EXPOSE") {
            for word in instruction.args.split_whitespace() {
                let number = word.split('/').next().unwrap_or(word);
                // Ports may be build args; they can't be checked statically
                if number.starts_with('$') {
                    continue;
                }
                let port = parse_port_spec(number).ok_or_else(|| BuildFileError::InvalidPort {
                    line: instruction.line,
                    value: word.to_string(),
                })?;
                ports.push(port);
            }
        }
        Ok(ports)
    }

    /// The effective HEALTHCHECK, if declared
    pub fn healthcheck(&self) -> Result<Option<HealthCheckInstruction>, BuildFileError> {
        let Some(instruction) = self.last("HEALTHCHECK") else {
            return Ok(None);
        };

        if instruction.args.eq_ignore_ascii_case("NONE") {
            return Ok(Some(HealthCheckInstruction::Disabled));
        }

        let mut settings = ProbeSettings::container_defaults();
        let mut rest = instruction.args.as_str();

        while let Some(option) = rest.strip_prefix("--") {
            let (flag, tail) = option
                .split_once(char::is_whitespace)
                .unwrap_or((option, ""));
            rest = tail.trim_start();

            let invalid = || BuildFileError::InvalidHealthCheckOption {
                line: instruction.line,
                option: format!("--{}", flag),
            };
            let (name, value) = flag.split_once('=').ok_or_else(invalid)?;

            match name {
                "interval" => settings.interval = parse_duration(value).ok_or_else(invalid)?,
                "timeout" => settings.timeout = parse_duration(value).ok_or_else(invalid)?,
                "start-period" => settings.start_period = parse_duration(value).ok_or_else(invalid)?,
                "start-interval" => {
                    parse_duration(value).ok_or_else(invalid)?;
                }
                "retries" => settings.retries = value.parse().map_err(|_| invalid())?,
                _ => return Err(invalid()),
            }
        }

        let command = match rest.split_once(char::is_whitespace) {
            Some((keyword, command)) if keyword.eq_ignore_ascii_case("CMD") => command.trim(),
            _ => {
                return Err(BuildFileError::InvalidHealthCheckOption {
                    line: instruction.line,
                    option: rest.to_string(),
                })
            }
        };

        if let Some(path) = url_path(command) {
            settings.path = path;
        }

        Ok(Some(HealthCheckInstruction::Command {
            settings,
            command: command.to_string(),
        }))
    }

    /// Derive the service contract: EXPOSE, then ENV PORT, then 8080
    pub fn contract(&self) -> Result<ServiceContract, BuildFileError> {
        let port = match self.exposed_ports()?.first() {
            Some(port) => *port,
            None => self
                .env()
                .get("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SERVICE_PORT),
        };

        let health = match self.healthcheck()? {
            Some(HealthCheckInstruction::Command { settings, .. }) => Some(settings),
            Some(HealthCheckInstruction::Disabled) | None => None,
        };

        Ok(ServiceContract { port, health })
    }

    /// Deviations from the deployable-service contract (not fatal)
    pub fn contract_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        let ports = self.exposed_ports().unwrap_or_default();
        if ports.is_empty() {
            issues.push("no EXPOSE instruction; the service port is implicit".to_string());
        }
        if let Some(env_port) = self.env().get("PORT").and_then(|p| p.parse::<u16>().ok()) {
            if !ports.is_empty() && !ports.contains(&env_port) {
                issues.push(format!(
                    "ENV PORT={} is not among exposed ports {:?}",
                    env_port, ports
                ));
            }
        }
        match self.healthcheck() {
            Ok(None) => issues.push("no HEALTHCHECK; liveness is not declared".to_string()),
            Ok(Some(HealthCheckInstruction::Disabled)) => {
                issues.push("HEALTHCHECK is disabled".to_string())
            }
            _ => {}
        }
        if self.command().is_none() {
            issues.push("no CMD or ENTRYPOINT; the image has no default process".to_string());
        }

        issues
    }
}

/// Split on whitespace outside double quotes
fn split_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// `8080` or `8080-8090`; a range yields its first port
fn parse_port_spec(text: &str) -> Option<u16> {
    match text.split_once('-') {
        Some((first, last)) => {
            let first = first.parse::<u16>().ok()?;
            let last = last.parse::<u16>().ok()?;
            (first <= last).then_some(first)
        }
        None => text.parse().ok(),
    }
}

/// Heredoc delimiters opened by an instruction (`<<EOF`, `<<-EOF`, `<<"EOF"`)
fn heredoc_delimiters(args: &str) -> impl Iterator<Item = String> + '_ {
    static HEREDOC: OnceLock<Regex> = OnceLock::new();
    let heredoc = HEREDOC.get_or_init(|| {
        Regex::new(r#"<<-?(?:"([A-Za-z_]\w*)"|'([A-Za-z_]\w*)'|([A-Za-z_]\w*))"#)
            .expect("static regex is valid")
    });

    heredoc.captures_iter(args).filter_map(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string())
    })
}

/// Parse durations like `30s`, `1m30s`, `500ms`, `2h`
pub fn parse_duration(text: &str) -> Option<Duration> {
    if text.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut rest = text;

    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
    }

    Some(total)
}

/// Path component of the first HTTP URL in a command
fn url_path(command: &str) -> Option<String> {
    static URL: OnceLock<Regex> = OnceLock::new();
    let url = URL.get_or_init(|| {
        Regex::new(r#"https?://[^/\s"']+(/[^\s"'\]]*)?"#).expect("static regex is valid")
    });

    url.captures(command).map(|caps| {
        caps.get(1)
            .map(|m| m.as_str().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string())
    })
}
