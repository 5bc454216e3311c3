use std::sync::LazyLock;

use pulldown_cmark::{html, CowStr, Event, Options, Parser, Tag, TagEnd};
use regex::Regex;

use crate::content::blocks::escape_html;

/// `@mentions` plus straight or CJK double quotes.
static HIGHLIGHT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@[\u{4e00}-\u{9fa5}A-Za-z0-9_]+|"[^"]*"|“[^”]*”"#)
        .expect("valid highlight regex")
});

/// Turns preprocessed markdown into HTML for a message's content slot.
pub trait MarkdownEngine: Send + Sync {
    fn render(&self, markdown: &str) -> String;
}

/// pulldown-cmark renderer. Raw HTML passes through untouched; prose text
/// gets mention and quote highlighting, code does not.
#[derive(Debug, Clone)]
pub struct CmarkEngine {
    options: Options,
    highlight: bool,
}

impl Default for CmarkEngine {
    fn default() -> Self {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);
        Self {
            options,
            highlight: true,
        }
    }
}

impl CmarkEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_highlighting(mut self) -> Self {
        self.highlight = false;
        self
    }
}

impl MarkdownEngine for CmarkEngine {
    fn render(&self, markdown: &str) -> String {
        let mut in_code_block = false;
        let highlight = self.highlight;
        let events = Parser::new_ext(markdown, self.options).map(|event| match event {
            Event::Start(Tag::CodeBlock(kind)) => {
                in_code_block = true;
                Event::Start(Tag::CodeBlock(kind))
            }
            Event::End(TagEnd::CodeBlock) => {
                in_code_block = false;
                Event::End(TagEnd::CodeBlock)
            }
            Event::Text(text) if highlight && !in_code_block && HIGHLIGHT_RE.is_match(&text) => {
                Event::InlineHtml(CowStr::from(highlight_text(&text)))
            }
            other => other,
        });

        let mut out = String::with_capacity(markdown.len() * 3 / 2);
        html::push_html(&mut out, events);
        out
    }
}

fn highlight_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 32);
    let mut last = 0;
    for found in HIGHLIGHT_RE.find_iter(text) {
        out.push_str(&escape_html(&text[last..found.start()]));
        let class = if found.as_str().starts_with('@') {
            "highlighted-tag"
        } else {
            "highlighted-quote"
        };
        out.push_str(&format!(
            "<span class=\"{}\">{}</span>",
            class,
            escape_html(found.as_str())
        ));
        last = found.end();
    }
    out.push_str(&escape_html(&text[last..]));
    out
}
