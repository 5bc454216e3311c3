//! Text transforms that turn raw model output into markup for the markdown
//! engine.
//!
//! The fixed order is: user find/replace rules, code fence protection,
//! HTML de-indentation, special block extraction, HTML document fencing,
//! formatting normalizations, code fence restoration. Every step is
//! idempotent so the same function serves streaming partials and the final
//! message.

pub mod blocks;
pub mod depth;
pub mod fences;
pub mod format;
pub mod pipeline;
pub mod rules;

pub use depth::turn_depth;
pub use pipeline::{preprocess_markup, ContentPipeline};
pub use rules::{RegexRule, RuleSet, RuleTarget};
