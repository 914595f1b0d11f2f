// ==============================================================================
// pagination.rs - Range Header Pagination
// ==============================================================================
// Description: items=<first>-<last> request ranges and Content-Range
//              responses for collection endpoints
// Author: Matt Barham
// Created: 2025-12-16
// Modified: 2025-12-16
// Version: 1.0.0
// ==============================================================================

use axum::http::HeaderMap;

use crate::error::ApiError;

/// Default page size when no Range header is sent.
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// Largest allowed page.
pub const MAX_PAGE_SIZE: u64 = 500;

/// A zero-based inclusive item range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemRange {
    pub first: u64,
    pub last: u64,
}

impl ItemRange {
    pub fn count(&self) -> u64 {
        self.last - self.first + 1
    }

    /// SQL LIMIT/OFFSET pair.
    pub fn limit_offset(&self) -> (i64, i64) {
        (self.count() as i64, self.first as i64)
    }
}

/// Parse the `Range: items=<first>-<last>` header. A missing header
/// yields the default first page; a malformed or oversized range is
/// unsatisfiable.
pub fn parse_range(headers: &HeaderMap) -> Result<ItemRange, ApiError> {
    let Some(value) = headers.get(axum::http::header::RANGE) else {
        return Ok(ItemRange {
            first: 0,
            last: DEFAULT_PAGE_SIZE - 1,
        });
    };

    let value = value
        .to_str()
        .map_err(|_| ApiError::UnsatisfiableRange)?
        .trim();
    let spec = value
        .strip_prefix("items=")
        .ok_or(ApiError::UnsatisfiableRange)?;
    let (first, last) = spec.split_once('-').ok_or(ApiError::UnsatisfiableRange)?;

    let first: u64 = first.parse().map_err(|_| ApiError::UnsatisfiableRange)?;
    let last: u64 = last.parse().map_err(|_| ApiError::UnsatisfiableRange)?;

    if last < first || last - first + 1 > MAX_PAGE_SIZE {
        return Err(ApiError::UnsatisfiableRange);
    }

    Ok(ItemRange { first, last })
}

/// `Content-Range: items <first>-<last>/<total>` value for a page. The
/// reported last item is clamped to what actually exists.
pub fn content_range(range: ItemRange, returned: u64, total: u64) -> String {
    let last = if returned == 0 {
        range.first
    } else {
        range.first + returned - 1
    };
    format!("items {}-{}/{}", range.first, last, total)
}

/// Parse an `order=[±field,…]` parameter against an allowlist, producing
/// an ORDER BY fragment. Only allowlisted names ever reach the SQL
/// string.
pub fn parse_order(
    param: Option<&str>,
    allowed: &[&str],
    default: &str,
) -> Result<String, ApiError> {
    let Some(param) = param.filter(|p| !p.is_empty()) else {
        return Ok(default.to_string());
    };

    let mut terms = Vec::new();
    for field in param.split(',') {
        let field = field.trim();
        let (name, direction) = match field.strip_prefix('-') {
            Some(name) => (name, "DESC"),
            None => (field.strip_prefix('+').unwrap_or(field), "ASC"),
        };
        if !allowed.contains(&name) {
            return Err(ApiError::BadRequest(format!(
                "Cannot order by field: {}",
                name
            )));
        }
        terms.push(format!("{} {}", name, direction));
    }
    Ok(terms.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::RANGE;

    #[test]
    fn test_default_range() {
        let range = parse_range(&HeaderMap::new()).unwrap();
        assert_eq!(range, ItemRange { first: 0, last: 19 });
        assert_eq!(range.limit_offset(), (20, 0));
    }

    #[test]
    fn test_explicit_range() {
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, "items=40-59".parse().unwrap());
        let range = parse_range(&headers).unwrap();
        assert_eq!(range, ItemRange { first: 40, last: 59 });
        assert_eq!(range.limit_offset(), (20, 40));
    }

    #[test]
    fn test_malformed_ranges() {
        for value in ["bytes=0-10", "items=10-5", "items=a-b", "items=5", "items=0-10000"] {
            let mut headers = HeaderMap::new();
            headers.insert(RANGE, value.parse().unwrap());
            assert!(
                matches!(parse_range(&headers), Err(ApiError::UnsatisfiableRange)),
                "accepted: {}",
                value
            );
        }
    }

    #[test]
    fn test_content_range() {
        let range = ItemRange { first: 0, last: 19 };
        assert_eq!(content_range(range, 20, 45), "items 0-19/45");
        assert_eq!(content_range(range, 5, 5), "items 0-4/5");
        assert_eq!(content_range(range, 0, 0), "items 0-0/0");
    }

    #[test]
    fn test_parse_order() {
        let allowed = ["name", "added", "pool_size"];
        assert_eq!(
            parse_order(None, &allowed, "added DESC").unwrap(),
            "added DESC"
        );
        assert_eq!(
            parse_order(Some("name"), &allowed, "added DESC").unwrap(),
            "name ASC"
        );
        assert_eq!(
            parse_order(Some("-added,+name"), &allowed, "added DESC").unwrap(),
            "added DESC, name ASC"
        );
        assert!(parse_order(Some("password"), &allowed, "added DESC").is_err());
        assert!(parse_order(Some("name;drop"), &allowed, "added DESC").is_err());
    }
}
