use std::sync::LazyLock;

use regex::{Captures, Regex};

// Each block pattern also swallows indentation at the start of its line so the
// generated markup always begins a line; otherwise a second pass would
// de-indent it and the transform would not be idempotent.
static TOOL_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)(?:^[ \t]+)?\[\[VCP调用结果信息汇总:(.*?)\]\]").expect("valid tool result regex")
});
static TOOL_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)(?:^[ \t]+)?<<<\[TOOL_REQUEST\]>>>(.*?)<<<\[END_TOOL_REQUEST\]>>>")
        .expect("valid tool request regex")
});
static DAILY_NOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)(?:^[ \t]+)?<<<DailyNoteStart>>>(.*?)<<<DailyNoteEnd>>>")
        .expect("valid daily note regex")
});
static BUTTON_CLICK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[\[点击按钮:(.*?)\]\]").expect("valid button click regex")
});

static KEY_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-\s*([^:]+):\s*(.*)").expect("valid key/value regex"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(https?://[^\s]+)").expect("valid url regex"));
static IMAGE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(jpeg|jpg|png|gif)$").expect("valid image url regex"));
static EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"###(.*?)###").expect("valid emphasis regex"));
static TOOL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_name>(.*?)</tool_name>|tool_name:\s*([^\n\r]*)")
        .expect("valid tool name regex")
});
static NOTE_MAID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Maid:\s*([^\n\r]*)").expect("valid maid regex"));
static NOTE_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Date:\s*([^\n\r]*)").expect("valid date regex"));
static NOTE_CONTENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)Content:\s*(.*)").expect("valid content regex"));

const CANVAS_TOKEN: &str = "{{VCPChatCanvas}}";
const KEY_TOOL_NAME: &str = "工具名称";
const KEY_STATUS: &str = "执行状态";
const KEY_URL: &str = "可访问URL";
const KEY_RETURN: &str = "返回内容";

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
    out
}

/// Replaces complete tool result, tool request and daily note blocks with
/// HTML. Spans whose closing delimiter has not arrived yet are left as is.
pub fn transform_special_blocks(text: &str) -> String {
    let text = TOOL_RESULT.replace_all(text, |caps: &Captures| render_tool_result(&caps[1]));
    let text = TOOL_REQUEST.replace_all(&text, |caps: &Captures| render_tool_request(&caps[1]));
    let text = DAILY_NOTE.replace_all(&text, |caps: &Captures| render_daily_note(&caps[1]));
    text.into_owned()
}

/// Markup that only appears in user messages.
pub fn transform_user_markup(text: &str) -> String {
    let text = BUTTON_CLICK.replace_all(text, |caps: &Captures| {
        format!(
            r#"<span class="user-clicked-button-bubble">{}</span>"#,
            escape_html(caps[1].trim())
        )
    });
    text.replace(
        CANVAS_TOKEN,
        r#"<div class="vcp-chat-canvas-placeholder">Canvas collaboration<span class="thinking-indicator-dots">...</span></div>"#,
    )
}

fn render_tool_result(raw: &str) -> String {
    let mut tool_name = "Unknown Tool".to_string();
    let mut status = "Unknown Status".to_string();
    let mut details = Vec::new();
    let mut other = Vec::new();

    for line in raw.trim().lines().filter(|line| !line.trim().is_empty()) {
        match KEY_VALUE.captures(line) {
            Some(kv) => {
                let key = kv[1].trim();
                let value = kv[2].trim();
                match key {
                    KEY_TOOL_NAME => tool_name = value.to_string(),
                    KEY_STATUS => status = value.to_string(),
                    _ => details.push((key.to_string(), value.to_string())),
                }
            }
            None => other.push(line),
        }
    }

    let mut html = String::from(r#"<div class="vcp-tool-result-bubble collapsible">"#);
    html.push_str(r#"<div class="vcp-tool-result-header">"#);
    html.push_str(r#"<span class="vcp-tool-result-label">VCP-ToolResult</span>"#);
    html.push_str(&format!(
        r#"<span class="vcp-tool-result-name">{}</span>"#,
        escape_html(&tool_name)
    ));
    html.push_str(&format!(
        r#"<span class="vcp-tool-result-status">{}</span>"#,
        escape_html(&status)
    ));
    html.push_str(r#"<span class="vcp-result-toggle-icon"></span></div>"#);
    html.push_str(r#"<div class="vcp-tool-result-collapsible-content">"#);
    html.push_str(r#"<div class="vcp-tool-result-details">"#);

    for (key, value) in &details {
        let is_link_key = key == KEY_URL || key == KEY_RETURN;
        let mut rendered = if is_link_key && IMAGE_URL.is_match(value) {
            let src = escape_html(value);
            format!(
                r#"<a href="{src}" target="_blank" rel="noopener noreferrer"><img src="{src}" class="vcp-tool-result-image" alt="Generated Image"></a>"#
            )
        } else {
            URL.replace_all(
                &escape_html(value),
                r#"<a href="$1" target="_blank" rel="noopener noreferrer">$1</a>"#,
            )
            .into_owned()
        };
        if key == KEY_RETURN {
            rendered = EMPHASIS
                .replace_all(&rendered, "<strong>$1</strong>")
                .into_owned();
        }
        html.push_str(&format!(
            r#"<div class="vcp-tool-result-item"><span class="vcp-tool-result-item-key">{}:</span> <span class="vcp-tool-result-item-value">{}</span></div>"#,
            escape_html(key),
            rendered
        ));
    }
    html.push_str("</div>");

    if !other.is_empty() {
        html.push_str(&format!(
            r#"<div class="vcp-tool-result-footer"><pre>{}</pre></div>"#,
            escape_html(&other.join("\n"))
        ));
    }
    html.push_str("</div></div>");
    html
}

fn extract_tool_name(content: &str) -> Option<String> {
    let caps = TOOL_NAME.captures(content)?;
    let raw = caps.get(1).or_else(|| caps.get(2))?.as_str().trim();
    let cleaned = raw.replace("「始」", "").replace("「末」", "");
    let cleaned = cleaned.strip_suffix(',').unwrap_or(&cleaned).trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

fn render_tool_request(content: &str) -> String {
    let tool_name = extract_tool_name(content).unwrap_or_else(|| "Processing...".to_string());
    format!(
        concat!(
            r#"<div class="vcp-tool-use-bubble">"#,
            r#"<div class="vcp-tool-summary"><span class="vcp-tool-label">VCP-ToolUse:</span> "#,
            r#"<span class="vcp-tool-name-highlight">{}</span></div>"#,
            r#"<div class="vcp-tool-details"><pre>{}</pre></div></div>"#
        ),
        escape_html(&tool_name),
        escape_html(content)
    )
}

fn render_daily_note(raw: &str) -> String {
    let content = raw.trim();
    let field = |re: &Regex| {
        re.captures(content)
            .map(|caps| caps[1].trim().to_string())
            .unwrap_or_default()
    };
    let maid = field(&NOTE_MAID);
    let date = field(&NOTE_DATE);
    let body = NOTE_CONTENT
        .captures(content)
        .map(|caps| caps[1].trim().to_string())
        .unwrap_or_else(|| content.to_string());

    let mut html = String::from(r#"<div class="maid-diary-bubble"><div class="diary-header">"#);
    html.push_str(r#"<span class="diary-title">Maid's Diary</span>"#);
    if !date.is_empty() {
        html.push_str(&format!(
            r#"<span class="diary-date">{}</span>"#,
            escape_html(&date)
        ));
    }
    html.push_str("</div>");
    if !maid.is_empty() {
        html.push_str(&format!(
            r#"<div class="diary-maid-info"><span class="diary-maid-label">Maid:</span> <span class="diary-maid-name">{}</span></div>"#,
            escape_html(&maid)
        ));
    }
    html.push_str(&format!(
        r#"<div class="diary-content">{}</div></div>"#,
        escape_html(&body)
    ));
    html
}
