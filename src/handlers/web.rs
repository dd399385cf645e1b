use crate::auth::Username;
use crate::listing::{encode_path, list_files};
use crate::progress::format_bytes;
use crate::state::AppState;
use axum::{
    Extension,
    extract::State,
    http::header::HeaderMap,
    response::Html,
};
use tracing::warn;

/// Escapes `& < > " '` for use in element text and quoted attributes.
fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
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

pub async fn index(
    State(state): State<AppState>,
    Extension(user): Extension<Username>,
    headers: HeaderMap,
) -> Html<String> {
    let host = headers
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("courier")
        .to_string();

    let files = state
        .settings
        .user_dir(&user.0)
        .map(|dir| {
            list_files(&dir, &state.settings.allowed_extensions).unwrap_or_else(|e| {
                warn!("Listing {:?} failed: {}", dir, e);
                Vec::new()
            })
        })
        .unwrap_or_default();
    let history = state.history.list().unwrap_or_else(|e| {
        warn!("Reading history failed: {}", e);
        Vec::new()
    });

    let host = escape_html(&host);
    let mut html = format!(
        "<!DOCTYPE html><html lang=\"en-US\"><head><meta charset=\"utf-8\"><title>{host}</title></head>\
         <body><header><h1>{host}</h1><span id=\"uname\">{}</span></header><main><ul>",
        escape_html(&user.0)
    );

    for file in &files {
        let name = escape_html(&file.name);
        let size = format_bytes(file.size);
        html.push_str(&format!(
            "<li class=\"file\" data-path=\"files/{path}\" data-name=\"{name}\">\
             <a href=\"files/{path}\"><strong>{name}</strong></a> <span>Size: {size}</span></li>",
            path = encode_path(&file.path),
        ));
    }

    html.push_str("</ul></main><section id=\"history\"><ul>");
    for record in &history {
        html.push_str(&format!(
            "<li data-ndx=\"{}\" class=\"{}\">{}</li>",
            record.id,
            record.status,
            escape_html(&record.name)
        ));
    }
    html.push_str("</ul></section></body></html>");

    Html(html)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<a href='x'>&\"</a>"),
            "&lt;a href=&#39;x&#39;&gt;&amp;&quot;&lt;/a&gt;"
        );
    }
}
