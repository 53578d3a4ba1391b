use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::AppState;

pub const WORKSTREAM_HEADER: &str = "x-workstream";

/// Validates that a slug only contains lowercase ASCII letters, digits and hyphens,
/// does not start or end with a hyphen, and is between 2 and 63 characters.
pub fn is_valid_slug(s: &str) -> bool {
    let len = s.len();
    (2..=63).contains(&len)
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Derives a slug from a display name: lowercase ASCII words joined by hyphens.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    slug.chars().take(63).collect::<String>().trim_end_matches('-').to_string()
}

/// The active workstream a public request targets, taken from the `X-Workstream`
/// header or the first subdomain.
#[derive(Debug, Clone)]
pub struct CurrentWorkStream {
    pub id: Uuid,
    pub slug: String,
}

impl FromRequestParts<AppState> for CurrentWorkStream {
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let slug = extract_slug(parts)?;

        let row: Option<(Uuid, bool)> =
            sqlx::query_as("SELECT id, is_active FROM work_streams WHERE slug = $1")
                .bind(&slug)
                .fetch_optional(&state.db)
                .await
                .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "Database error" }))))?;

        match row {
            None => Err((StatusCode::NOT_FOUND, Json(json!({ "error": "Workstream not found" })))),
            Some((_, false)) => Err((StatusCode::FORBIDDEN, Json(json!({ "error": "Workstream is inactive" })))),
            Some((id, true)) => Ok(CurrentWorkStream { id, slug }),
        }
    }
}

fn extract_slug(parts: &Parts) -> Result<String, (StatusCode, Json<Value>)> {
    // 1. X-Workstream header
    if let Some(ws) = parts
        .headers
        .get(WORKSTREAM_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
    {
        if !is_valid_slug(&ws) {
            return Err((StatusCode::BAD_REQUEST, Json(json!({ "error": "Invalid workstream identifier" }))));
        }
        return Ok(ws);
    }

    // 2. Subdomain from Host header
    if let Some(host) = parts.headers.get("Host").and_then(|v| v.to_str().ok()) {
        if let Some(subdomain) = subdomain_of(host) {
            if !is_valid_slug(&subdomain) {
                return Err((StatusCode::BAD_REQUEST, Json(json!({ "error": "Invalid workstream identifier" }))));
            }
            return Ok(subdomain);
        }
    }

    Err((StatusCode::BAD_REQUEST, Json(json!({ "error": "Missing X-Workstream header" }))))
}

fn subdomain_of(host: &str) -> Option<String> {
    let domain = host.split(':').next().unwrap_or(host);
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 3 {
        return None;
    }
    let subdomain = labels[0].to_lowercase();
    (subdomain != "www" && subdomain != "api").then_some(subdomain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn slug_rules() {
        assert!(is_valid_slug("north-district"));
        assert!(is_valid_slug("d7"));
        assert!(!is_valid_slug("a"));
        assert!(!is_valid_slug("-north"));
        assert!(!is_valid_slug("north-"));
        assert!(!is_valid_slug("North"));
        assert!(!is_valid_slug(&"a".repeat(64)));
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  North   District #2 "), "north-district-2");
        assert_eq!(slugify("École Centrale"), "cole-centrale");
        assert!(is_valid_slug(&slugify(&"Long Name ".repeat(20))));
    }

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/api/workstream/info");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn header_takes_precedence_over_subdomain() {
        let p = parts(&[("X-Workstream", "East-Side"), ("Host", "west.edutrack.example:443")]);
        assert_eq!(extract_slug(&p).unwrap(), "east-side");
    }

    #[test]
    fn subdomain_is_used_when_header_absent() {
        let p = parts(&[("Host", "west.edutrack.example")]);
        assert_eq!(extract_slug(&p).unwrap(), "west");

        let p = parts(&[("Host", "www.edutrack.example")]);
        assert_eq!(extract_slug(&p).unwrap_err().0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn invalid_header_is_rejected() {
        let p = parts(&[("X-Workstream", "bad_slug!")]);
        assert_eq!(extract_slug(&p).unwrap_err().0, StatusCode::BAD_REQUEST);
    }
}
