//! Offset and cursor pagination.

use serde::Serialize;

/// Rows to skip before `page` (1-based) when pages hold `limit` rows.
///
/// Saturates at `i64::MAX`, so an absurd page reads as past the end.
pub fn skip(page: i64, limit: i64) -> i64 {
    (page.max(1) - 1).saturating_mul(limit.max(0))
}

/// Pages needed for `count` rows; zero when `limit` is zero (unbounded).
pub fn total_pages(count: i64, limit: i64) -> i64 {
    if limit <= 0 {
        return 0;
    }
    let count = count.max(0);
    count / limit + i64::from(count % limit != 0)
}

/// Pagination metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub total_items: i64,
    pub current_page: i64,
    pub items_per_page: i64,
    pub item_count: i64,
    pub total_pages: i64,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub meta: PageMeta,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: i64, limit: i64, total_items: i64) -> Self {
        let meta = PageMeta {
            total_items,
            current_page: page,
            items_per_page: limit,
            item_count: items.len() as i64,
            total_pages: total_pages(total_items, limit),
        };
        Self { items, meta }
    }

    /// A page with no items; reports a single (empty) page.
    pub fn empty(page: i64, limit: i64) -> Self {
        Self {
            items: Vec::new(),
            meta: PageMeta {
                total_items: 0,
                current_page: page,
                items_per_page: limit,
                item_count: 0,
                total_pages: 1,
            },
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            meta: self.meta,
        }
    }
}

/// Forward-only page keyed by an opaque token.
///
/// `next` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cursor<T> {
    pub next: Option<String>,
    pub items: Vec<T>,
}

impl<T> Cursor<T> {
    /// Build a cursor from up to `limit + 1` fetched items.
    ///
    /// When more than `limit` items arrived, the extra ones are dropped and
    /// `next_token` is called on the first of them to produce `next`.
    pub fn new(mut items: Vec<T>, limit: i64, next_token: impl FnOnce(&T) -> String) -> Self {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        if items.len() <= limit {
            return Self { next: None, items };
        }
        let next = next_token(&items[limit]);
        items.truncate(limit);
        Self {
            next: Some(next),
            items,
        }
    }

    pub fn empty() -> Self {
        Self {
            next: None,
            items: Vec::new(),
        }
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip() {
        assert_eq!(skip(1, 10), 0);
        assert_eq!(skip(3, 10), 20);
        assert_eq!(skip(0, 10), 0);
        assert_eq!(skip(i64::MAX, 10), i64::MAX);
        assert_eq!(skip(i64::MAX, 0), 0);
    }

    #[test]
    fn test_total_pages() {
        assert_eq!(total_pages(0, 10), 0);
        assert_eq!(total_pages(10, 10), 1);
        assert_eq!(total_pages(11, 10), 2);
        assert_eq!(total_pages(5, 0), 0);
        assert_eq!(total_pages(i64::MAX, 2), i64::MAX / 2 + 1);
        assert_eq!(total_pages(i64::MAX, i64::MAX), 1);
    }

    #[test]
    fn test_page_meta() {
        let page = Page::new(vec![1, 2, 3], 2, 3, 7);
        assert_eq!(page.meta.item_count, 3);
        assert_eq!(page.meta.total_pages, 3);

        let empty = Page::<i32>::empty(1, 10);
        assert_eq!(empty.meta.total_pages, 1);
        assert_eq!(
            serde_json::to_value(empty.meta).unwrap()["itemsPerPage"],
            serde_json::json!(10)
        );
    }

    #[test]
    fn test_cursor_splits_extra_item() {
        let cursor = Cursor::new(vec![1, 2, 3], 2, |next| format!("after-{}", next));
        assert_eq!(cursor.items, vec![1, 2]);
        assert_eq!(cursor.next.as_deref(), Some("after-3"));
        assert!(cursor.has_next());

        let last = Cursor::new(vec![1, 2], 2, |_| unreachable!());
        assert_eq!(last.items, vec![1, 2]);
        assert_eq!(last.next, None);

        let empty = Cursor::<i32>::empty();
        assert!(!empty.has_next());
        assert_eq!(
            serde_json::to_value(&empty).unwrap(),
            serde_json::json!({ "next": null, "items": [] })
        );
    }
}
