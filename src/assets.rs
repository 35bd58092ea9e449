//! Browser client, embedded at build time and served from `/`.

use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;

const INDEX_HTML: &str = include_str!("../web/index.html");
const TERMINAL_JS: &str = include_str!("../web/js/terminal.js");
const STYLE_CSS: &str = include_str!("../web/css/style.css");

/// Paths served by [`router`].
pub const ROUTES: [&str; 4] = ["/", "/index.html", "/js/terminal.js", "/css/style.css"];

/// Routes for the static client files.
pub fn router() -> Router {
    let [root, index_html, script, stylesheet] = ROUTES;
    Router::new()
        .route(root, get(index))
        .route(index_html, get(index))
        .route(script, get(terminal_js))
        .route(stylesheet, get(style_css))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn terminal_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        TERMINAL_JS,
    )
}

async fn style_css() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], STYLE_CSS)
}
