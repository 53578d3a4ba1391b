use serde::Serialize;
use sqlx::{Postgres, QueryBuilder};

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Page number (1-based) and page size taken from `?page=&page_size=`.
#[derive(Debug, Clone, Copy)]
pub struct PageParams {
    pub page: i64,
    pub page_size: i64,
}

impl PageParams {
    pub fn new(page: Option<i64>, page_size: Option<i64>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Saturates so an absurd page number yields an empty page instead of a negative offset.
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn push_limit(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(" LIMIT ")
            .push_bind(self.page_size)
            .push(" OFFSET ")
            .push_bind(self.offset());
    }

    pub fn wrap<T>(&self, count: i64, results: Vec<T>) -> Page<T> {
        Page {
            count,
            page: self.page,
            page_size: self.page_size,
            results,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub count: i64,
    pub page: i64,
    pub page_size: i64,
    pub results: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_clamping() {
        let p = PageParams::new(None, None);
        assert_eq!((p.page, p.page_size, p.offset()), (1, DEFAULT_PAGE_SIZE, 0));

        let p = PageParams::new(Some(0), Some(10_000));
        assert_eq!((p.page, p.page_size), (1, MAX_PAGE_SIZE));

        let p = PageParams::new(Some(3), Some(25));
        assert_eq!(p.offset(), 50);
    }

    #[test]
    fn huge_page_does_not_overflow() {
        let p = PageParams::new(Some(i64::MAX), Some(MAX_PAGE_SIZE));
        assert_eq!(p.offset(), i64::MAX);

        let p = PageParams::new(Some(i64::MAX / 10), Some(DEFAULT_PAGE_SIZE));
        assert!(p.offset() > 0);
    }

    #[test]
    fn limit_clause_is_bound() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM grades WHERE TRUE");
        PageParams::new(Some(2), Some(5)).push_limit(&mut qb);
        assert_eq!(qb.sql(), "SELECT * FROM grades WHERE TRUE LIMIT $1 OFFSET $2");
    }
}
