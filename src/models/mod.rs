pub mod alert;
pub mod device;
pub mod reading;
pub mod report;

use serde::Serialize;

/// Page envelope carried beside every list response.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub total_pages: i64,
}

impl Pagination {
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        Self {
            page,
            limit,
            total,
            total_pages: (total + limit - 1) / limit.max(1),
        }
    }
}

/// Validate `page`/`limit` query values against the endpoint's cap.
pub fn validate_page(
    page: Option<i64>,
    limit: Option<i64>,
    max_limit: i64,
    default_limit: i64,
) -> Result<(i64, i64), crate::error::ApiError> {
    let page = page.unwrap_or(1);
    let limit = limit.unwrap_or(default_limit);
    if page < 1 {
        return Err(crate::error::ApiError::invalid_fields(
            "page must be >= 1",
            vec!["page".into()],
        ));
    }
    if limit < 1 || limit > max_limit {
        return Err(crate::error::ApiError::invalid_fields(
            format!("limit must be in [1, {max_limit}]"),
            vec!["limit".into()],
        ));
    }
    Ok((page, limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_rounds_up() {
        let p = Pagination::new(2, 10, 31);
        assert_eq!(p.total_pages, 4);
        assert_eq!(Pagination::new(1, 10, 30).total_pages, 3);
        assert_eq!(Pagination::new(1, 10, 0).total_pages, 0);
    }

    #[test]
    fn page_bounds_enforced() {
        assert!(validate_page(Some(0), None, 100, 20).is_err());
        assert!(validate_page(None, Some(101), 100, 20).is_err());
        assert_eq!(validate_page(None, None, 100, 20).unwrap(), (1, 20));
        assert_eq!(
            validate_page(Some(3), Some(1000), 1000, 50).unwrap(),
            (3, 1000)
        );
    }
}
