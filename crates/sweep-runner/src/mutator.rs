//! Turns a topology template into the document handed to the simulator.
//!
//! Rewrites are an ordered list of pattern rules applied one after another.
//! Placeholders the run depends on are required: a template that lacks one is
//! rejected instead of silently keeping stale values.

use regex::{NoExpand, Regex};
use std::path::PathBuf;
use sweep_core::ParameterTuple;
use thiserror::Error;
use tracing::debug;

/// Plugin class that must not be loaded in headless runs.
pub const SERIAL_SOCKET_PLUGIN: &str = "org.contikios.cooja.serialsocket.SerialSocketServer";

const PLUGIN_OPEN: &str = "<plugin>";
const PLUGIN_CLOSE: &str = "</plugin>";

/// Firmware-neutral trust weights written when trust is disabled.
const NEUTRAL_LAMBDA: u32 = 0;
const NEUTRAL_GAMMA: u32 = 1;

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("template has no match for required rule '{rule}'")]
    MissingPlaceholder { rule: &'static str },
    #[error("template has none of the placeholders for '{group}'")]
    MissingAlternatives { group: &'static str },
    #[error("unbalanced {tag} block at byte {offset}")]
    UnbalancedBlock { tag: &'static str, offset: usize },
    #[error("rewrite rule '{rule}' has an invalid pattern: {source}")]
    Pattern {
        rule: &'static str,
        #[source]
        source: regex::Error,
    },
}

/// Run-wide values the rewrite rules draw on, next to the tuple itself.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub sim_time_secs: u64,
    pub send_interval_secs: u64,
    pub warmup_secs: u64,
    pub feedback_path: PathBuf,
}

struct Bindings {
    seed: u64,
    sim_time_ms: u64,
    sim_time_secs: u64,
    feedback_path: String,
    trust: u8,
    attack_rate: u32,
    send_interval: u64,
    warmup: u64,
    lambda: u32,
    gamma: u32,
}

impl Bindings {
    fn new(tuple: &ParameterTuple, settings: &RunSettings) -> Self {
        Self {
            seed: tuple.seed(),
            sim_time_ms: settings.sim_time_secs.saturating_mul(1000),
            sim_time_secs: settings.sim_time_secs,
            feedback_path: settings.feedback_path.to_string_lossy().to_string(),
            trust: u8::from(tuple.trust_enabled()),
            attack_rate: tuple.attack_rate(),
            send_interval: settings.send_interval_secs,
            warmup: settings.warmup_secs,
            lambda: tuple.lambda().unwrap_or(NEUTRAL_LAMBDA),
            gamma: tuple.gamma().unwrap_or(NEUTRAL_GAMMA),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requirement {
    Optional,
    Required,
    /// At least one rule of the named group must match.
    AnyOf(&'static str),
    /// Like `AnyOf`, but only enforced for trust-enabled runs.
    AnyOfWhenTrust(&'static str),
}

#[derive(Debug, Clone, Copy)]
enum Guard {
    Always,
    Contains(&'static str),
    Lacks(&'static str),
}

impl Guard {
    fn allows(&self, doc: &str) -> bool {
        match self {
            Guard::Always => true,
            Guard::Contains(needle) => doc.contains(needle),
            Guard::Lacks(needle) => !doc.contains(needle),
        }
    }
}

struct Rule {
    name: &'static str,
    pattern: Regex,
    render: fn(&Bindings) -> String,
    requirement: Requirement,
    guard: Guard,
}

fn rule(
    name: &'static str,
    pattern: &str,
    render: fn(&Bindings) -> String,
    requirement: Requirement,
) -> Result<Rule, MutationError> {
    guarded(name, pattern, render, requirement, Guard::Always)
}

fn guarded(
    name: &'static str,
    pattern: &str,
    render: fn(&Bindings) -> String,
    requirement: Requirement,
    guard: Guard,
) -> Result<Rule, MutationError> {
    let pattern = Regex::new(pattern).map_err(|source| MutationError::Pattern { rule: name, source })?;
    Ok(Rule {
        name,
        pattern,
        render,
        requirement,
        guard,
    })
}

pub struct ConfigMutator {
    rules: Vec<Rule>,
    plugin_marker: String,
}

impl ConfigMutator {
    pub fn new() -> Result<Self, MutationError> {
        use Requirement::*;
        let rules = vec![
            rule(
                "randomseed",
                r"<randomseed>\d+</randomseed>",
                |b| format!("<randomseed>{}</randomseed>", b.seed),
                Required,
            )?,
            rule("sim-time-ms", r"@SIM_TIME_MS@", |b| b.sim_time_ms.to_string(), AnyOf("sim-time"))?,
            rule("sim-time-sec", r"@SIM_TIME_SEC@", |b| b.sim_time_secs.to_string(), AnyOf("sim-time"))?,
            rule(
                "feedback-path",
                r"@TRUST_FEEDBACK_PATH@",
                |b| b.feedback_path.clone(),
                Required,
            )?,
            rule("brpl-mode", r"BRPL_MODE=\d", |_| "BRPL_MODE=1".to_string(), Optional)?,
            rule(
                "trust-enabled",
                r"TRUST_ENABLED=\d",
                |b| format!("TRUST_ENABLED={}", b.trust),
                Required,
            )?,
            rule(
                "attack-drop",
                r"ATTACK_DROP_PCT=\d+",
                |b| format!("ATTACK_DROP_PCT={}", b.attack_rate),
                Required,
            )?,
            rule(
                "send-interval",
                r"SEND_INTERVAL_SECONDS=\d+",
                |b| format!("SEND_INTERVAL_SECONDS={}", b.send_interval),
                Required,
            )?,
            rule(
                "warmup",
                r"WARMUP_SECONDS=\d+",
                |b| format!("WARMUP_SECONDS={}", b.warmup),
                Required,
            )?,
            rule(
                "project-conf-quoted",
                r#",PROJECT_CONF_PATH="[^"]*""#,
                |_| String::new(),
                Optional,
            )?,
            rule(
                "project-conf",
                r",PROJECT_CONF_PATH=[^,< ]+",
                |_| String::new(),
                Optional,
            )?,
            guarded(
                "trust-gamma",
                r"\bTRUST_GAMMA=\d+",
                |b| format!("TRUST_GAMMA={}", b.gamma),
                Optional,
                Guard::Contains("TRUST_GAMMA="),
            )?,
            guarded(
                "trust-gamma-insert",
                r"\bTRUST_LAMBDA=\d+",
                |b| format!("TRUST_LAMBDA={},TRUST_GAMMA={}", b.lambda, b.gamma),
                Optional,
                Guard::Lacks("TRUST_GAMMA="),
            )?,
            rule(
                "trust-lambda",
                r"\bTRUST_LAMBDA=\d+",
                |b| format!("TRUST_LAMBDA={}", b.lambda),
                AnyOfWhenTrust("trust-lambda"),
            )?,
            rule(
                "trust-penalty-gamma",
                r"\bTRUST_PENALTY_GAMMA=\d+",
                |b| format!("TRUST_PENALTY_GAMMA={}", b.gamma),
                Optional,
            )?,
            rule(
                "trust-lambda-conf",
                r"\bTRUST_LAMBDA_CONF=\d+",
                |b| format!("TRUST_LAMBDA_CONF={}", b.lambda),
                AnyOfWhenTrust("trust-lambda"),
            )?,
            rule(
                "trust-penalty-gamma-conf",
                r"\bTRUST_PENALTY_GAMMA_CONF=\d+",
                |b| format!("TRUST_PENALTY_GAMMA_CONF={}", b.gamma),
                Optional,
            )?,
        ];
        Ok(Self {
            rules,
            plugin_marker: SERIAL_SOCKET_PLUGIN.to_string(),
        })
    }

    /// Applies every rule in order, then strips the headless-unsafe plugin.
    pub fn materialize(
        &self,
        template: &str,
        tuple: &ParameterTuple,
        settings: &RunSettings,
    ) -> Result<String, MutationError> {
        let bindings = Bindings::new(tuple, settings);
        let mut doc = template.to_string();
        let mut matched_groups: Vec<&'static str> = Vec::new();

        for rule in &self.rules {
            let hit = rule.guard.allows(&doc) && rule.pattern.is_match(&doc);
            if hit {
                let value = (rule.render)(&bindings);
                doc = rule.pattern.replace_all(&doc, NoExpand(&value)).into_owned();
            }
            match rule.requirement {
                Requirement::Required if !hit => {
                    return Err(MutationError::MissingPlaceholder { rule: rule.name });
                }
                Requirement::AnyOf(group) | Requirement::AnyOfWhenTrust(group) if hit => {
                    matched_groups.push(group);
                }
                _ => {}
            }
        }

        for rule in &self.rules {
            let group = match rule.requirement {
                Requirement::AnyOf(group) => group,
                Requirement::AnyOfWhenTrust(group) if tuple.trust_enabled() => group,
                _ => continue,
            };
            if !matched_groups.contains(&group) {
                return Err(MutationError::MissingAlternatives { group });
            }
        }

        let (doc, removed) = strip_blocks(&doc, PLUGIN_OPEN, PLUGIN_CLOSE, &self.plugin_marker)?;
        if removed > 0 {
            debug!(removed, marker = %self.plugin_marker, "removed plugin blocks");
        }
        Ok(doc)
    }
}

/// Removes every outermost `open`..`close` block whose body mentions
/// `marker`, together with the whitespace and newline around it when the
/// block occupies whole lines. Returns the new text and the number of
/// blocks removed.
pub fn strip_blocks(
    doc: &str,
    open: &'static str,
    close: &'static str,
    marker: &str,
) -> Result<(String, usize), MutationError> {
    let mut out = String::with_capacity(doc.len());
    let mut copied = 0usize;
    let mut removed = 0usize;
    let mut depth = 0usize;
    let mut block_start = 0usize;
    let mut pos = 0usize;

    loop {
        let next_open = doc[pos..].find(open).map(|i| i + pos);
        let next_close = doc[pos..].find(close).map(|i| i + pos);
        let (at, is_open) = match (next_open, next_close) {
            (None, None) => break,
            (Some(o), None) => (o, true),
            (None, Some(c)) => (c, false),
            (Some(o), Some(c)) => {
                if o < c {
                    (o, true)
                } else {
                    (c, false)
                }
            }
        };
        if is_open {
            if depth == 0 {
                block_start = at;
            }
            depth += 1;
            pos = at + open.len();
            continue;
        }
        if depth == 0 {
            return Err(MutationError::UnbalancedBlock {
                tag: close,
                offset: at,
            });
        }
        depth -= 1;
        pos = at + close.len();
        if depth == 0 && doc[block_start..pos].contains(marker) {
            let (start, end) = widen_to_lines(doc, block_start, pos);
            out.push_str(&doc[copied..start]);
            copied = end;
            removed += 1;
        }
    }

    if depth != 0 {
        return Err(MutationError::UnbalancedBlock {
            tag: open,
            offset: block_start,
        });
    }
    out.push_str(&doc[copied..]);
    Ok((out, removed))
}

fn widen_to_lines(doc: &str, start: usize, end: usize) -> (usize, usize) {
    let bytes = doc.as_bytes();
    let mut s = start;
    while s > 0 && matches!(bytes[s - 1], b' ' | b'\t') {
        s -= 1;
    }
    let line_start = s == 0 || bytes[s - 1] == b'\n';

    let mut e = end;
    while e < bytes.len() && matches!(bytes[e], b' ' | b'\t' | b'\r') {
        e += 1;
    }
    let line_end = e == bytes.len() || bytes[e] == b'\n';

    if line_start && line_end {
        (s, (e + 1).min(bytes.len()))
    } else {
        (start, end)
    }
}
