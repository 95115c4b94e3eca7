//! Scripts injected into served HTML documents.

use once_cell::sync::Lazy;
use regex::Regex;

pub const COMPAT_MARKER: &str = "/*__HB_HTML_COMPAT__*/";
pub const RESIZER_MARKER: &str = "/*__HB_RESIZER__*/";

const COMPAT_TEMPLATE: &str = include_str!("../assets/hb_html_runtime.js");
const RESIZER_SCRIPT: &str = include_str!("../assets/hb_resizer.js");

static HEAD_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<head\b[^>]*>").expect("valid regex"));
static HTML_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<html\b[^>]*>").expect("valid regex"));
static BODY_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</body\s*>").expect("valid regex"));
static HTML_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</html\s*>").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Host origin used to absolutize root-relative requests. Empty means the document's own origin.
    pub origin: String,
    /// Re-point `<base href="/">` at the host origin (blob: documents).
    pub force_base_href: bool,
}

fn compat_script(options: &RuntimeOptions) -> String {
    let origin = serde_json::Value::String(options.origin.trim().to_string()).to_string();
    let body = COMPAT_TEMPLATE
        .replace("__HB_FORCE_BASE__", if options.force_base_href { "true" } else { "false" })
        .replace("__HB_INJECTED_ORIGIN__", &origin);
    format!("\n<script>{COMPAT_MARKER}\n{body}</script>\n")
}

/// Insert the compatibility runtime right after `<head>`. Idempotent; blank documents pass through.
pub fn inject_compat_runtime(html: &str, options: &RuntimeOptions) -> String {
    if html.trim().is_empty() || html.contains(COMPAT_MARKER) {
        return html.to_string();
    }
    let script = compat_script(options);
    if let Some(m) = HEAD_OPEN.find(html) {
        return format!("{}{script}{}", &html[..m.end()], &html[m.end()..]);
    }
    if let Some(m) = HTML_OPEN.find(html) {
        return format!("{}<head>{script}</head>{}", &html[..m.end()], &html[m.end()..]);
    }
    format!("{script}{html}")
}

/// Insert the height reporter before `</body>`, else `</html>`, else at the end.
pub fn inject_resizer(html: &str) -> String {
    if html.contains(RESIZER_MARKER) {
        return html.to_string();
    }
    let script = format!("<script>{RESIZER_MARKER}\n{RESIZER_SCRIPT}</script>");
    let at = BODY_CLOSE
        .find(html)
        .or_else(|| HTML_CLOSE.find(html))
        .map(|m| m.start());
    match at {
        Some(i) => format!("{}{script}{}", &html[..i], &html[i..]),
        None => format!("{html}{script}"),
    }
}
