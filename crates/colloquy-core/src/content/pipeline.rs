use parking_lot::RwLock;

use super::blocks::{transform_special_blocks, transform_user_markup};
use super::fences::{deindent_html, ensure_html_fenced, CodeVault};
use super::format::normalize;
use super::rules::{RuleSet, RuleTarget};
use crate::models::Role;

/// Fence protection through fence restoration. Pure and idempotent for input
/// that does not itself contain placeholder tokens.
pub fn preprocess_markup(text: &str, role: Role) -> String {
    let (protected, mut vault) = CodeVault::protect(text);
    let mut out = deindent_html(&protected);
    out = transform_special_blocks(&out);
    if role == Role::User {
        out = transform_user_markup(&out);
    }
    out = ensure_html_fenced(&out, &mut vault);
    out = normalize(&out);
    vault.restore(&out)
}

/// Content pipeline with the active agent's find/replace rules.
#[derive(Debug, Default)]
pub struct ContentPipeline {
    rules: RwLock<RuleSet>,
}

impl ContentPipeline {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Swaps the rule set, e.g. when the selected agent changes.
    pub fn set_rules(&self, rules: RuleSet) {
        *self.rules.write() = rules;
    }

    /// Markup ready for the markdown engine. Display rules run on the raw
    /// text first.
    pub fn preprocess(&self, raw: &str, role: Role, depth: usize) -> String {
        let ruled = self.rules.read().apply(raw, role, depth, RuleTarget::Display);
        preprocess_markup(&ruled, role)
    }

    /// Text as it should be sent to the model.
    pub fn for_context(&self, raw: &str, role: Role, depth: usize) -> String {
        self.rules.read().apply(raw, role, depth, RuleTarget::Context)
    }
}
