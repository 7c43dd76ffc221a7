//! Resource addressing
//!
//! Maps a request URL to the cache collection it belongs to:
//! `api/vehicles/42` → collection `vehicles`, record `42`.

use url::Url;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub url: Url,
    pub collection_key: String,
    pub record_id: Option<String>,
}

/// Normalize a base URL so relative paths join below it, not beside it.
pub fn parse_base(base_url: &str) -> SyncResult<Url> {
    let mut normalized = base_url.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized)
        .map_err(|e| SyncError::Config(format!("invalid base url '{}': {}", base_url, e)))
}

/// Resolve `input` (absolute or relative to `base`) and derive its collection key.
///
/// Reads keep the query string in the key so filtered listings never
/// overwrite the full collection snapshot.
pub fn resolve(base: &Url, input: &str, keep_query: bool) -> SyncResult<ResourceRef> {
    let url = match Url::parse(input) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base
            .join(input.trim_start_matches('/'))
            .map_err(|e| SyncError::InvalidRequest(format!("invalid url '{}': {}", input, e)))?,
        Err(e) => {
            return Err(SyncError::InvalidRequest(format!(
                "invalid url '{}': {}",
                input, e
            )))
        }
    };

    let path = url.path();
    let relative = if url.origin() == base.origin() {
        path.strip_prefix(base.path()).unwrap_or(path)
    } else {
        path
    };

    let mut segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
    let record_id = match segments.last() {
        Some(last) if segments.len() > 1 && looks_like_id(last) => {
            let id = last.to_string();
            segments.pop();
            Some(id)
        }
        _ => None,
    };

    if segments.is_empty() {
        return Err(SyncError::InvalidRequest(format!(
            "url '{}' does not name a collection",
            input
        )));
    }

    let mut collection_key = segments.join("/");
    if keep_query {
        if let Some(query) = url.query().filter(|q| !q.is_empty()) {
            collection_key.push('?');
            collection_key.push_str(query);
        }
    }

    Ok(ResourceRef {
        url,
        collection_key,
        record_id,
    })
}

fn looks_like_id(segment: &str) -> bool {
    segment.chars().any(|c| c.is_ascii_digit()) || uuid::Uuid::parse_str(segment).is_ok()
}
