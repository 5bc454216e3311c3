use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::models::Role;

/// Where a rule is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    /// Rendering in the chat view
    Display,
    /// Text sent to the model
    Context,
}

fn default_true() -> bool {
    true
}

fn unlimited() -> i64 {
    -1
}

/// User-defined find/replace rule, stored per agent in `regex_rules.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegexRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub find_pattern: String,
    #[serde(default)]
    pub replace_with: String,
    #[serde(default)]
    pub apply_to_roles: Vec<Role>,
    #[serde(default = "default_true")]
    pub apply_to_frontend: bool,
    #[serde(default)]
    pub apply_to_context: bool,
    #[serde(default)]
    pub min_depth: i64,
    /// -1 means no upper bound
    #[serde(default = "unlimited")]
    pub max_depth: i64,
}

impl RegexRule {
    pub fn applies(&self, role: Role, depth: usize, target: RuleTarget) -> bool {
        let target_ok = match target {
            RuleTarget::Display => self.apply_to_frontend,
            RuleTarget::Context => self.apply_to_context,
        };
        let depth = depth as i64;
        target_ok
            && self.apply_to_roles.contains(&role)
            && depth >= self.min_depth
            && (self.max_depth < 0 || depth <= self.max_depth)
    }

    /// Converts a SillyTavern regex script export.
    pub fn from_sillytavern(script: &Value) -> Option<Self> {
        let title = script.get("scriptName")?.as_str()?.to_string();
        let depth = |key: &str, default: i64| {
            script.get(key).and_then(Value::as_i64).unwrap_or(default)
        };
        let roles = script
            .get("placement")
            .and_then(Value::as_array)
            .map(|placements| {
                placements
                    .iter()
                    .filter_map(|p| match p.as_i64() {
                        Some(1) => Some(Role::User),
                        Some(2) => Some(Role::Assistant),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            id: format!("rule_{}", chrono::Utc::now().timestamp_millis()),
            title,
            find_pattern: script.get("findRegex")?.as_str()?.to_string(),
            replace_with: script
                .get("replaceString")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            apply_to_roles: roles,
            apply_to_frontend: script
                .get("markdownOnly")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            apply_to_context: script
                .get("promptOnly")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            min_depth: depth("minDepth", 0),
            max_depth: depth("maxDepth", -1),
        })
    }

    fn compile(&self) -> Result<CompiledRule> {
        let (body, flags) = split_pattern(&self.find_pattern);
        let mut builder = RegexBuilder::new(body);
        builder
            .case_insensitive(flags.contains('i'))
            .multi_line(flags.contains('m'))
            .dot_matches_new_line(flags.contains('s'));
        let regex = builder.build().map_err(|e| CoreError::InvalidRule {
            title: self.title.clone(),
            reason: e.to_string(),
        })?;
        Ok(CompiledRule {
            regex,
            global: flags.contains('g'),
            replacement: translate_replacement(&self.replace_with),
            rule: self.clone(),
        })
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: RegexRule,
    regex: Regex,
    global: bool,
    replacement: String,
}

/// Compiled rule list. Rules that fail to compile are dropped with a
/// warning; the rest still apply.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    compiled: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<RegexRule>) -> Self {
        let compiled = rules
            .iter()
            .filter_map(|rule| match rule.compile() {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!("Skipping regex rule: {}", e);
                    None
                }
            })
            .collect();
        Self { compiled }
    }

    /// Parses a `regex_rules.json` array.
    pub fn from_json(json: &str) -> Result<Self> {
        let rules: Vec<RegexRule> = serde_json::from_str(json)?;
        Ok(Self::new(rules))
    }

    /// Missing file means no rules.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Accepts one rule in native or SillyTavern export form. Arrays are
    /// rejected, as are objects of neither shape.
    pub fn import_rule(json: &str) -> Result<RegexRule> {
        let value: Value = serde_json::from_str(json)?;
        let invalid = |reason: &str| CoreError::InvalidRule {
            title: String::new(),
            reason: reason.to_string(),
        };
        if value.is_array() {
            return Err(invalid("rule arrays cannot be imported, import one rule"));
        }
        if value.get("scriptName").is_some() {
            RegexRule::from_sillytavern(&value).ok_or_else(|| invalid("incomplete script"))
        } else if value.get("title").is_some() {
            Ok(serde_json::from_value(value)?)
        } else {
            Err(invalid("unrecognised rule format"))
        }
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &RegexRule> {
        self.compiled.iter().map(|c| &c.rule)
    }

    pub fn apply(&self, text: &str, role: Role, depth: usize, target: RuleTarget) -> String {
        let mut out = text.to_string();
        for compiled in &self.compiled {
            if !compiled.rule.applies(role, depth, target) {
                continue;
            }
            out = if compiled.global {
                compiled
                    .regex
                    .replace_all(&out, compiled.replacement.as_str())
                    .into_owned()
            } else {
                compiled
                    .regex
                    .replace(&out, compiled.replacement.as_str())
                    .into_owned()
            };
        }
        out
    }
}

/// Splits `/body/flags` notation. A bare pattern is treated as global.
fn split_pattern(pattern: &str) -> (&str, &str) {
    if let Some(rest) = pattern.strip_prefix('/') {
        if let Some(end) = rest.rfind('/') {
            let flags = &rest[end + 1..];
            if flags.chars().all(|c| c.is_ascii_alphabetic()) {
                return (&rest[..end], flags);
            }
        }
    }
    (pattern, "g")
}

/// Rewrites JavaScript replacement syntax (`$&`, `$1`) into the regex
/// crate's (`${0}`, `${1}`).
fn translate_replacement(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('$') => {
                chars.next();
                out.push_str("$$");
            }
            Some('&') => {
                chars.next();
                out.push_str("${0}");
            }
            Some(d) if d.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                out.push_str(&format!("${{{}}}", digits));
            }
            _ => out.push_str("$$"),
        }
    }
    out
}
