use std::sync::LazyLock;

use regex::{Captures, Regex};

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\w*.*?```").expect("valid fenced block regex"));

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__CODE_BLOCK_PLACEHOLDER_(\d+)__").expect("valid placeholder regex")
});

/// Prefix shared by every placeholder token.
pub const PLACEHOLDER_PREFIX: &str = "__CODE_BLOCK_PLACEHOLDER_";

const DOCTYPE: &str = "<!doctype html>";
const HTML_CLOSE: &str = "</html>";
const FENCE: &str = "```";

/// Fenced code blocks swapped out for placeholder tokens while the
/// surrounding text is transformed.
#[derive(Debug, Default)]
pub struct CodeVault {
    blocks: Vec<String>,
}

impl CodeVault {
    /// Replaces every complete fenced block with a placeholder. Unterminated
    /// fences stay in place.
    pub fn protect(text: &str) -> (String, CodeVault) {
        let mut vault = CodeVault::default();
        let protected = FENCED_BLOCK
            .replace_all(text, |caps: &Captures| vault.stash(caps[0].to_string()))
            .into_owned();
        (protected, vault)
    }

    pub fn stash(&mut self, block: String) -> String {
        let token = format!("{}{}__", PLACEHOLDER_PREFIX, self.blocks.len());
        self.blocks.push(block);
        token
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Single pass, so a restored block is never expanded again.
    pub fn restore(&self, text: &str) -> String {
        if self.blocks.is_empty() {
            return text.to_string();
        }
        PLACEHOLDER
            .replace_all(text, |caps: &Captures| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| self.blocks.get(index))
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

/// Strips leading whitespace from lines that open an HTML tag outside a
/// fence, so the markdown parser does not read them as indented code.
pub fn deindent_html(text: &str) -> String {
    let mut in_fence = false;
    text.split('\n')
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with(FENCE) {
                in_fence = !in_fence;
            }
            if !in_fence && trimmed.len() < line.len() && opens_tag(trimmed) {
                trimmed
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn opens_tag(line: &str) -> bool {
    let mut chars = line.chars();
    chars.next() == Some('<')
        && chars
            .next()
            .map(|c| c == '!' || c.is_ascii_alphabetic())
            .unwrap_or(false)
}

/// Wraps raw `<!DOCTYPE html> ... </html>` documents in an html fence.
///
/// Fence parity is counted over the output produced so far; a document that
/// sits inside an open fence is left alone. Wrapped documents are stashed in
/// `vault` so later normalizations cannot touch them.
pub fn ensure_html_fenced(text: &str, vault: &mut CodeVault) -> String {
    if find_ignore_ascii_case(text, DOCTYPE, 0).is_none() {
        return text.to_string();
    }

    let mut result = String::with_capacity(text.len() + 16);
    let mut last = 0;
    loop {
        let Some(start) = find_ignore_ascii_case(text, DOCTYPE, last) else {
            result.push_str(&text[last..]);
            break;
        };
        result.push_str(&text[last..start]);

        let Some(end) = find_ignore_ascii_case(text, HTML_CLOSE, start + DOCTYPE.len()) else {
            // no closing tag yet, still streaming
            result.push_str(&text[start..]);
            break;
        };
        let end = end + HTML_CLOSE.len();
        let block = &text[start..end];

        if result.matches(FENCE).count() % 2 == 0 {
            let token = vault.stash(format!("\n```html\n{}\n```\n", block));
            result.push_str(&token);
        } else {
            result.push_str(block);
        }
        last = end;
    }
    result
}

/// `needle` must be ASCII.
fn find_ignore_ascii_case(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if from > hay.len() || needle.len() > hay.len() - from {
        return None;
    }
    hay[from..]
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|pos| pos + from)
}
