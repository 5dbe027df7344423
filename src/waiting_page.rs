//! Self-refreshing "waking up" page served during cold starts
//!
//! Refresh is done with `<meta http-equiv="refresh">` only, so it works with
//! JavaScript disabled.

use hyper::StatusCode;

/// Renders the waiting page with fixed branding and refresh interval
#[derive(Debug, Clone)]
pub struct WaitingPage {
    refresh_secs: u64,
    title: String,
    message: String,
}

impl Default for WaitingPage {
    fn default() -> Self {
        Self::new(3, "Waking up...", "Please wait, this usually takes 10-20 seconds.")
    }
}

impl WaitingPage {
    pub const MIN_REFRESH_SECS: u64 = 1;
    pub const MAX_REFRESH_SECS: u64 = 60;

    pub fn new(refresh_secs: u64, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            refresh_secs: refresh_secs.clamp(Self::MIN_REFRESH_SECS, Self::MAX_REFRESH_SECS),
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn refresh_secs(&self) -> u64 {
        self.refresh_secs
    }

    /// Render the page. `bypass_href` is the link that skips the wake logic;
    /// `origin_status` is echoed for diagnostics when present.
    pub fn render(&self, bypass_href: &str, origin_status: Option<StatusCode>) -> String {
        let title = escape_html(&self.title);
        let message = escape_html(&self.message);
        let href = escape_html(bypass_href);
        let status_line = origin_status
            .map(|s| format!("\n    <p class=\"status\">Origin status: {}</p>", s.as_u16()))
            .unwrap_or_default();

        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <meta http-equiv="refresh" content="{refresh}">
    <title>{title}</title>
    <style>
        body {{ font-family: -apple-system, system-ui, sans-serif; display: flex; flex-direction: column; align-items: center; justify-content: center; height: 100vh; background: #0f172a; color: #e2e8f0; margin: 0; }}
        .spinner {{ width: 50px; height: 50px; border: 5px solid #334155; border-top-color: #3b82f6; border-radius: 50%; animation: spin 1s linear infinite; margin-bottom: 20px; }}
        @keyframes spin {{ to {{ transform: rotate(360deg); }} }}
        h1 {{ font-size: 1.5rem; margin-bottom: 1rem; }}
        p {{ color: #94a3b8; }}
        a {{ color: #60a5fa; }}
        .status {{ font-size: 0.8rem; color: #64748b; }}
    </style>
</head>
<body>
    <div class="spinner" role="status" aria-label="Loading"></div>
    <h1>{title}</h1>
    <p>{message}</p>
    <p>This page reloads every {refresh} seconds. <a href="{href}">Skip waiting</a></p>{status_line}
</body>
</html>
"#,
            refresh = self.refresh_secs,
        )
    }
}

/// Link to the current resource with the bypass parameter appended
pub fn bypass_href(path: &str, query: Option<&str>, bypass_param: &str) -> String {
    let param = urlencoding::encode(bypass_param);
    match query.filter(|q| !q.is_empty()) {
        Some(query) => format!("{}?{}&{}=1", path, query, param),
        None => format!("{}?{}=1", path, param),
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
