//! URL fetch tool.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::{Tool, ToolContext};

const MAX_BODY_CHARS: usize = 20000;

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("valid script regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("valid blank line regex"));

/// Strip markup from an HTML page, keeping readable text.
fn html_to_text(html: &str) -> String {
    let without_code = SCRIPT_STYLE.replace_all(html, "");
    let text = TAG.replace_all(&without_code, "\n");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    BLANK_LINES
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// Fetch a URL over HTTP(S).
pub struct WebFetch;

#[async_trait]
impl Tool for WebFetch {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch the content of a URL. HTML pages are reduced to text; long bodies are truncated."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        let url = input["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'url' argument"))?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow::anyhow!("Only http(s) URLs are supported: {}", url));
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("agent-dispatch/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;

        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("HTTP error: {}", status));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/html"));
        let body = response.text().await?;
        let text = if is_html { html_to_text(&body) } else { body };

        tracing::debug!(url, bytes = text.len(), "Fetched URL");

        Ok(match text.char_indices().nth(MAX_BODY_CHARS) {
            Some((idx, _)) => format!(
                "{}\n\n[truncated: {} more bytes]",
                &text[..idx],
                text.len() - idx
            ),
            None => text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_text() {
        let html = "<html><head><style>p{}</style><script>var x;</script></head>\
                    <body><h1>Title</h1><p>Fish &amp; chips</p></body></html>";
        assert_eq!(html_to_text(html), "Title\n\nFish & chips");
    }

    #[tokio::test]
    async fn test_rejects_non_http() {
        let err = WebFetch
            .execute(json!({"url": "file:///etc/passwd"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Only http(s)"));
    }
}
