use std::sync::LazyLock;

use regex::Regex;

static FENCE_MISSING_NEWLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*```\w*)([^\w\r\n])").expect("valid fence newline regex")
});
static INDENTED_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]+(```)").expect("valid indented fence regex"));
static IMG_BEFORE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(<img[^>]+>)\s*(```|__CODE_BLOCK_PLACEHOLDER_)").expect("valid img fence regex")
});

const SPEAKER_SUFFIX: &str = "的发言]:";
pub const IMG_FENCE_SEPARATOR: &str = "<!-- separator -->";

/// Step five of the pipeline, in its fixed order.
pub fn normalize(text: &str) -> String {
    let text = ensure_newline_after_fence(text);
    let text = ensure_space_after_tilde(&text);
    let text = remove_fence_indentation(&text);
    let text = remove_speaker_tags(&text);
    ensure_separator_between_img_and_fence(text)
}

/// Opening fences followed by content on the same line get a line break
/// after the language tag.
pub fn ensure_newline_after_fence(text: &str) -> String {
    FENCE_MISSING_NEWLINE
        .replace_all(text, "$1\n$2")
        .into_owned()
}

/// A lone `~` is followed by a space so the markdown engine does not pair
/// stray tildes into strikethrough.
pub fn ensure_space_after_tilde(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if c == '~' {
            match chars.peek() {
                Some(next) if next.is_whitespace() || *next == '~' => {}
                _ => out.push(' '),
            }
        }
    }
    out
}

pub fn remove_fence_indentation(text: &str) -> String {
    INDENTED_FENCE.replace_all(text, "$1").into_owned()
}

/// Drops leading `[<name>的发言]: ` prefixes some models echo back.
pub fn remove_speaker_tags(text: &str) -> &str {
    let mut rest = text;
    while let Some(stripped) = strip_speaker_tag(rest) {
        rest = stripped;
    }
    rest
}

fn strip_speaker_tag(text: &str) -> Option<&str> {
    if !text.starts_with('[') {
        return None;
    }
    let end = text.find(SPEAKER_SUFFIX)?;
    let inner = &text[1..end];
    if inner.contains('\n') || contains_tag_close(inner) {
        return None;
    }
    Some(text[end + SPEAKER_SUFFIX.len()..].trim_start())
}

/// True when `text` holds `]:` followed by whitespace.
fn contains_tag_close(text: &str) -> bool {
    text.match_indices("]:").any(|(i, _)| {
        text[i + 2..]
            .chars()
            .next()
            .map(char::is_whitespace)
            .unwrap_or(false)
    })
}

pub fn ensure_separator_between_img_and_fence(text: &str) -> String {
    IMG_BEFORE_FENCE
        .replace_all(text, format!("$1\n\n{}\n\n$2", IMG_FENCE_SEPARATOR).as_str())
        .into_owned()
}
