//! Root-relative URL rewriting for text assets.
//!
//! Regex based and best effort: it does not parse HTML, CSS or JS. Every
//! rewrite except the bundler public-path fix is gated on [`PathIndex`], so a
//! reference such as `/api/data` that the archive does not contain is never
//! touched.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::archive::{strip_query_and_hash, PathIndex};

static HTML_BASE_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<base\b([^>]*?)\bhref\s*=\s*("/"|'/')([^>]*?)>"#).expect("valid regex")
});
static HTML_MEDIA_SRC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(<\s*(?:script|img|source|video|audio)\b[^>]*\bsrc\s*=\s*)(?:"/([^"']+)"|'/([^"']+)')"#,
    )
    .expect("valid regex")
});
static HTML_LINK_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(<\s*link\b[^>]*\bhref\s*=\s*)(?:"/([^"']+)"|'/([^"']+)')"#)
        .expect("valid regex")
});
static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"/([^"')]+)"|'/([^"')]+)'|/([^"')]+))\s*\)"#)
        .expect("valid regex")
});
static CSS_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)@import\s+(?:url\(\s*)?(?:"/([^"')\s]+)"|'/([^"')\s]+)'|/([^"')\s]+))\s*\)?"#,
    )
    .expect("valid regex")
});
static JS_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""/([^"'`]*)"|'/([^"'`]*)'|`/([^"'`]*)`"#).expect("valid regex")
});
static JS_WEBPACK_P: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(__webpack_require__\.p\s*=\s*)("/"|'/')"#).expect("valid regex")
});
static JS_PUBLIC_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(__webpack_public_path__\s*=\s*)("/"|'/')"#).expect("valid regex")
});

/// Rewrite one text asset according to its content type.
///
/// `vfs_base` is the pathname every in-archive reference is re-rooted on,
/// e.g. `/dist/vfs/<projectId>/`. Disabled rewriting and non-HTML/CSS/JS
/// content pass through unchanged.
pub fn rewrite(
    path: &str,
    content: &str,
    content_type: &str,
    index: &PathIndex,
    vfs_base: &str,
    enabled: bool,
) -> String {
    if !enabled {
        return content.to_string();
    }
    let rewriter = Rewriter { index, vfs_base };
    if content_type.starts_with("text/html") {
        rewriter.html(content)
    } else if content_type.starts_with("text/css") {
        rewriter.css(content)
    } else if content_type.contains("javascript") {
        rewriter.js(content)
    } else {
        log::trace!("no rewrite rule for {path} ({content_type})");
        content.to_string()
    }
}

/// First matched capture among the alternation groups, with the quote it was written in.
fn quoted_rest<'h>(caps: &Captures<'h>, groups: &[(usize, &'static str)]) -> Option<(&'static str, &'h str)> {
    groups
        .iter()
        .find_map(|(i, q)| caps.get(*i).map(|m| (*q, m.as_str())))
}

/// JS: skip strings that look like routes rather than files.
fn is_likely_asset_path(path_only: &str) -> bool {
    if path_only.is_empty() || path_only.chars().any(char::is_whitespace) {
        return false;
    }
    if path_only.ends_with('/') {
        return true;
    }
    path_only
        .split('/')
        .filter(|s| !s.is_empty())
        .last()
        .is_some_and(|last| last.contains('.'))
}

struct Rewriter<'a> {
    index: &'a PathIndex,
    vfs_base: &'a str,
}

impl Rewriter<'_> {
    fn accepts(&self, rest: &str) -> bool {
        !rest.starts_with('/') && self.index.contains_reference(rest)
    }

    fn html(&self, html: &str) -> String {
        let out = HTML_BASE_HREF.replace_all(html, |caps: &Captures| {
            let quote = &caps[2][..1];
            format!("<base{}href={quote}{}{quote}{}>", &caps[1], self.vfs_base, &caps[3])
        });

        let attr = |caps: &Captures| {
            let whole = caps[0].to_string();
            match quoted_rest(caps, &[(2, "\""), (3, "'")]) {
                Some((quote, rest)) if self.accepts(rest) => {
                    format!("{}{quote}{}{rest}{quote}", &caps[1], self.vfs_base)
                }
                _ => whole,
            }
        };
        let out = HTML_MEDIA_SRC.replace_all(&out, attr);
        let out = HTML_LINK_HREF.replace_all(&out, attr);
        out.into_owned()
    }

    fn css(&self, css: &str) -> String {
        let out = CSS_URL.replace_all(css, |caps: &Captures| {
            match quoted_rest(caps, &[(1, "\""), (2, "'"), (3, "")]) {
                Some((quote, rest)) if self.accepts(rest) => {
                    format!("url({quote}{}{rest}{quote})", self.vfs_base)
                }
                _ => caps[0].to_string(),
            }
        });

        let out = CSS_IMPORT.replace_all(&out, |caps: &Captures| {
            match quoted_rest(caps, &[(1, "\""), (2, "'"), (3, "")]) {
                Some((quote, rest)) if self.accepts(rest) => {
                    if caps[0].to_ascii_lowercase().contains("url(") {
                        format!("@import url({quote}{}{rest}{quote})", self.vfs_base)
                    } else {
                        format!("@import {quote}{}{rest}{quote}", self.vfs_base)
                    }
                }
                _ => caps[0].to_string(),
            }
        });
        out.into_owned()
    }

    fn js(&self, js: &str) -> String {
        let out = JS_STRING.replace_all(js, |caps: &Captures| {
            match quoted_rest(caps, &[(1, "\""), (2, "'"), (3, "`")]) {
                Some((quote, rest))
                    if is_likely_asset_path(strip_query_and_hash(rest)) && self.accepts(rest) =>
                {
                    format!("{quote}{}{rest}{quote}", self.vfs_base)
                }
                _ => caps[0].to_string(),
            }
        });

        // Public-path assignments are always a prefix, whitelist or not.
        let public_path = |caps: &Captures| {
            let quote = &caps[2][..1];
            format!("{}{quote}{}{quote}", &caps[1], self.vfs_base)
        };
        let out = JS_WEBPACK_P.replace_all(&out, public_path);
        let out = JS_PUBLIC_PATH.replace_all(&out, public_path);
        out.into_owned()
    }
}
