//! The embedded static asset bundle served in non-dev mode.
//!
//! Unknown paths fall back to `index.html` so client-side routing works.
//! HTML is never cached; everything else is fingerprint-free but changes
//! only with the binary, so it gets a long immutable max-age.

const INDEX_HTML: &str = include_str!("../assets/index.html");
const APP_JS: &str = include_str!("../assets/app.js");
const STYLE_CSS: &str = include_str!("../assets/style.css");

pub struct Asset {
    pub body: &'static str,
    pub content_type: &'static str,
    pub cache_control: &'static str,
}

const IMMUTABLE: &str = "public, max-age=31536000, immutable";
const NO_CACHE: &str = "no-cache";

/// Look up a request path in the bundle. Always returns something — the
/// fallback is the SPA index.
pub fn lookup(path: &str) -> Asset {
    match path.trim_start_matches('/') {
        "app.js" => Asset {
            body: APP_JS,
            content_type: "text/javascript; charset=utf-8",
            cache_control: IMMUTABLE,
        },
        "style.css" => Asset {
            body: STYLE_CSS,
            content_type: "text/css; charset=utf-8",
            cache_control: IMMUTABLE,
        },
        _ => Asset {
            body: INDEX_HTML,
            content_type: "text/html; charset=utf-8",
            cache_control: NO_CACHE,
        },
    }
}
