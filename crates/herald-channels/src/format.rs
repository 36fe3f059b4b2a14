//! Recipient validation and per-channel content shaping.

use html2text::render::text_renderer::TrivialDecorator;

use crate::{channel::DeliveryChannel, types::RenderedMessage};

/// Loose structural check: non-empty local part, a single `@`, and a
/// dotted domain without whitespace.
pub fn validate_email(address: &str) -> bool {
    let address = address.trim();
    if address.is_empty() || address.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty() && !domain.starts_with('.'),
        None => false,
    }
}

/// `http`/`https` URL with a host.
pub fn validate_webhook_url(url: &str) -> bool {
    match reqwest::Url::parse(url.trim()) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https")
                && parsed.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}

/// Cut `content` to at most `max_len` characters, ending in `...` when
/// there is room for it. `max_len == 0` means unlimited.
pub fn truncate_content(content: &str, max_len: usize) -> String {
    if max_len == 0 || content.chars().count() <= max_len {
        return content.to_string();
    }
    if max_len > 3 {
        let mut out: String = content.chars().take(max_len - 3).collect();
        out.push_str("...");
        out
    } else {
        content.chars().take(max_len).collect()
    }
}

/// Line width handed to the text layout; wide enough that ordinary
/// paragraphs are not re-wrapped.
const PLAINTEXT_WIDTH: usize = 4096;

/// Render HTML as plain text.
///
/// Head, style and script contents are dropped, entities are decoded and
/// inline emphasis carries no markers. Trailing whitespace is trimmed from
/// every line.
pub fn html_to_plaintext(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let text = html2text::from_read_with_decorator(html.as_bytes(), PLAINTEXT_WIDTH, TrivialDecorator::new());
    text.replace('\u{a0}', " ")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Adapt a message to what `channel` can display.
///
/// Plain-text channels get a stripped copy of the HTML when no text body
/// was rendered; bodies are truncated to the channel's length limit.
pub fn format_for_channel(channel: &dyn DeliveryChannel, message: &RenderedMessage) -> RenderedMessage {
    let mut formatted = message.clone();
    if !channel.supports_html() && formatted.text.trim().is_empty() {
        formatted.text = html_to_plaintext(&formatted.html);
    }
    if let Some(max) = channel.max_content_length() {
        formatted.text = truncate_content(&formatted.text, max);
        formatted.html = truncate_content(&formatted.html, max);
    }
    formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(validate_email("user@example.com"));
        assert!(validate_email("first.last+tag@mail.example.org"));
        assert!(!validate_email(""));
        assert!(!validate_email("userexample.com"));
        assert!(!validate_email("@example.com"));
        assert!(!validate_email("user@"));
        assert!(!validate_email("user@localhost"));
        assert!(!validate_email("us er@example.com"));
        assert!(!validate_email("a@b@example.com"));
    }

    #[test]
    fn webhook_url_validation() {
        assert!(validate_webhook_url("https://example.com/hook"));
        assert!(validate_webhook_url("http://localhost:8080/in"));
        assert!(!validate_webhook_url("ftp://example.com/hook"));
        assert!(!validate_webhook_url("not a url"));
        assert!(!validate_webhook_url(""));
        assert!(!validate_webhook_url("http://"));
    }

    #[test]
    fn truncation() {
        assert_eq!(truncate_content("hello world", 8), "hello...");
        assert_eq!(truncate_content("hello", 10), "hello");
        assert_eq!(truncate_content("hello", 5), "hello");
        assert_eq!(truncate_content("hello", 2), "he");
        assert_eq!(truncate_content("hello", 0), "hello");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_content("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn html_stripping() {
        assert_eq!(html_to_plaintext("<p>Hello <b>World</b></p>"), "Hello World");
        assert_eq!(
            html_to_plaintext("Tom &amp; Jerry&nbsp;&quot;live&quot; &lt;3 &gt;"),
            "Tom & Jerry \"live\" <3 >"
        );
        assert_eq!(html_to_plaintext("plain"), "plain");
        assert_eq!(html_to_plaintext(""), "");
    }

    #[test]
    fn html_stripping_drops_head_style_and_script() {
        let page = "<html><head><style>body { color: red; }</style></head>\
                    <body><p>Hi</p><script>track()</script></body></html>";
        assert_eq!(html_to_plaintext(page), "Hi");
    }

    #[test]
    fn html_stripping_keeps_paragraphs_apart() {
        let text = html_to_plaintext("<p>First</p><p>Second</p>");
        assert!(text.starts_with("First"), "{text:?}");
        assert!(text.ends_with("Second"), "{text:?}");
        assert!(text.contains('\n'), "{text:?}");
    }
}
