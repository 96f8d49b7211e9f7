use super::{Message, MessageId};

/// Bounds applied to history page sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 200,
        }
    }
}

impl HistoryLimits {
    /// Clamps a requested page size into `[1, max_limit]`.
    ///
    /// Out-of-range sizes are clamped rather than rejected; no size at all
    /// means the default.
    pub fn clamp(&self, requested: Option<i64>) -> u32 {
        let max = i64::from(self.max_limit.max(1));
        match requested {
            Some(limit) => limit.clamp(1, max) as u32,
            None => i64::from(self.default_limit).clamp(1, max) as u32,
        }
    }

    /// Parses a raw `limit` query value; anything non-numeric falls back to
    /// the default.
    pub fn parse(&self, raw: Option<&str>) -> u32 {
        let requested = raw
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .and_then(|x| x.parse::<i64>().ok());
        self.clamp(requested)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Id of the oldest message the caller already has.
    pub before: Option<MessageId>,
    pub limit: u32,
}

impl PageRequest {
    pub fn latest(limit: u32) -> Self {
        Self { before: None, limit }
    }

    pub fn before(cursor: MessageId, limit: u32) -> Self {
        Self {
            before: Some(cursor),
            limit,
        }
    }
}

/// One newest-first page plus the cursor for the next (older) page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<MessageId>,
}

impl Page<Message> {
    pub fn new(items: Vec<Message>) -> Self {
        let next_cursor = items.last().map(|x| x.id);
        Self { items, next_cursor }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn clamp_uses_default_when_absent() {
        let limits = HistoryLimits::default();
        assert_eq!(limits.clamp(None), 50);
    }

    #[test]
    fn clamp_bounds_out_of_range_requests() {
        let limits = HistoryLimits::default();
        assert_eq!(limits.clamp(Some(0)), 1);
        assert_eq!(limits.clamp(Some(-7)), 1);
        assert_eq!(limits.clamp(Some(10_000)), 200);
        assert_eq!(limits.clamp(Some(25)), 25);
    }

    #[test]
    fn clamp_caps_a_default_larger_than_max() {
        let limits = HistoryLimits {
            default_limit: 500,
            max_limit: 100,
        };
        assert_eq!(limits.clamp(None), 100);
    }

    #[test]
    fn parse_ignores_garbage() {
        let limits = HistoryLimits::default();
        assert_eq!(limits.parse(Some("abc")), 50);
        assert_eq!(limits.parse(Some("  ")), 50);
        assert_eq!(limits.parse(Some(" 12 ")), 12);
        assert_eq!(limits.parse(None), 50);
    }

    #[test]
    fn empty_page_has_no_cursor() {
        let page = Page::<Message>::new(vec![]);
        assert!(page.is_empty());
        assert_eq!(page.next_cursor, None);
    }
}
