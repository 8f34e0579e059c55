//! Block pages the proxy redirects to.

use axum::extract::{Query, State};
use axum::http::header::CACHE_CONTROL;
use axum::response::{Html, IntoResponse};
use chrono::Utc;

use crate::models::PageQuery;
use crate::state::Controller;

const STYLE: &str = "body{font-family:system-ui,sans-serif;max-width:36rem;margin:4rem auto;\
padding:0 1rem;color:#1f2933}h1{font-size:1.5rem}code{background:#eef2f6;padding:0 .25rem}";

/// GET /blocked.html
pub async fn blocked(Query(query): Query<PageQuery>) -> impl IntoResponse {
    let domain = escape(&query.domain);
    page(
        "Blocked",
        &format!(
            "<h1><code>{domain}</code> is blocked</h1>\
             <p>This site is on your block list while you focus. \
             Earn a break to visit it.</p>"
        ),
    )
}

/// GET /nuclear-blocked.html
pub async fn nuclear_blocked(
    State(controller): State<Controller>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let domain = escape(&query.domain);
    let now = Utc::now();

    let status = controller
        .nuclear_sites()
        .into_iter()
        .find(|entry| entry.matches_host(&query.domain))
        .map(|entry| match entry.next_transition_at(now) {
            Some(at) => format!(
                "<p>Stage: <strong>{}</strong> until {}.</p>",
                entry.stage_at(now),
                at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
            ),
            None => format!("<p>Stage: <strong>{}</strong>.</p>", entry.stage_at(now)),
        })
        .unwrap_or_default();

    page(
        "Nuclear block",
        &format!(
            "<h1><code>{domain}</code> is under a nuclear block</h1>\
             <p>Nothing unlocks it until its cooldown runs out.</p>{status}"
        ),
    )
}

/// GET /nuclear-block-last-chance.html
pub async fn last_chance(Query(query): Query<PageQuery>) -> impl IntoResponse {
    let domain = escape(&query.domain);
    page(
        "Last chance",
        &format!(
            "<h1>Last chance for <code>{domain}</code></h1>\
             <p>The cooldown is over. Confirming the unblock removes this \
             nuclear block for good. Block it again to start over.</p>"
        ),
    )
}

fn page(title: &str, body: &str) -> impl IntoResponse {
    (
        [(CACHE_CONTROL, "no-store")],
        Html(format!(
            "<!doctype html><html><head><meta charset=\"utf-8\">\
             <title>{title} - Anchor</title><style>{STYLE}</style></head>\
             <body>{body}</body></html>"
        )),
    )
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(
            escape("<script>alert('x')</script>&"),
            "&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;&amp;"
        );
        assert_eq!(escape("youtube.com"), "youtube.com");
    }
}
