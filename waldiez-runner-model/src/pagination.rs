use serde::{Deserialize, Serialize};

/// Page request: 1-based page number and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    #[serde(default = "Params::default_page")]
    pub page: u64,
    #[serde(default = "Params::default_size")]
    pub size: u64,
}

impl Params {
    pub const MAX_SIZE: u64 = 100;

    pub fn new(page: u64, size: u64) -> Self {
        Self { page, size }.clamped()
    }

    fn default_page() -> u64 {
        1
    }

    fn default_size() -> u64 {
        50
    }

    /// Clamp out-of-range values instead of failing the request.
    pub fn clamped(self) -> Self {
        Self {
            page: self.page.max(1),
            size: self.size.clamp(1, Self::MAX_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1) * self.size
    }
}

impl Default for Params {
    fn default() -> Self {
        Self { page: 1, size: 50 }
    }
}

/// One page of results with totals, the shape every list endpoint returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub size: u64,
    pub pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, params: Params) -> Self {
        let pages = if params.size == 0 {
            0
        } else {
            total.div_ceil(params.size)
        };
        Self {
            items,
            total,
            page: params.page,
            size: params.size,
            pages,
        }
    }

    pub fn empty(params: Params) -> Self {
        Self::new(Vec::new(), 0, params)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            size: self.size,
            pages: self.pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_clamp_to_sane_bounds() {
        let params = Params::new(0, 0);
        assert_eq!(params.page, 1);
        assert_eq!(params.size, 1);
        let params = Params::new(2, 1000);
        assert_eq!(params.size, Params::MAX_SIZE);
        assert_eq!(params.offset(), Params::MAX_SIZE);
    }

    #[test]
    fn page_count_rounds_up() {
        let page = Page::new(vec![1, 2, 3], 7, Params::new(1, 3));
        assert_eq!(page.pages, 3);
        assert_eq!(page.total, 7);
    }
}
