//! 分页状态机 - 所有列表界面共享的增量加载控制器
//!
//! 核心约束：
//! - load_id 为单调递增的加载代号；reset() 使其前进一代
//! - 任何在途请求完成时必须校验其捕获的代号，过期结果直接丢弃
//! - 同一控制器不允许并行「加载更多」；refresh 总是取代在途加载

/// 一次加载的凭据：完成时凭它决定结果是否仍然有效
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadToken {
    load_id: u64,
    page: usize,
}

impl LoadToken {
    /// 本次加载对应的页号（0 起）
    pub fn page(&self) -> usize {
        self.page
    }
}

/// 通用分页状态
#[derive(Debug)]
pub struct PaginationState<T> {
    page_size: usize,
    current_page: usize,
    items: Vec<T>,
    has_more_pages: bool,
    loading: bool,
    load_id: u64,
}

impl<T> PaginationState<T> {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            current_page: 0,
            items: Vec::new(),
            has_more_pages: true,
            loading: false,
            load_id: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    /// 下一页在数据集中的偏移量
    pub fn offset(&self) -> usize {
        self.current_page * self.page_size
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn has_more_pages(&self) -> bool {
        self.has_more_pages
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn load_id(&self) -> u64 {
        self.load_id
    }

    /// 开始新的一代：清空累积项、页号归零、在途加载全部作废
    pub fn reset(&mut self) {
        self.load_id += 1;
        self.current_page = 0;
        self.items.clear();
        self.has_more_pages = true;
        self.loading = false;
    }

    /// 申请开始一次加载。
    ///
    /// - refresh = false：没有更多页或已有在途加载时拒绝
    /// - refresh = true：总是成功，并作废之前的在途加载
    pub fn begin_load(&mut self, refresh: bool) -> Option<LoadToken> {
        if refresh {
            self.reset();
        } else if !self.has_more_pages || self.loading {
            return None;
        }
        self.loading = true;
        Some(LoadToken {
            load_id: self.load_id,
            page: self.current_page,
        })
    }

    /// 应用一页结果。代号不匹配（期间发生过 reset/refresh）时丢弃并返回 false。
    pub fn apply_page(&mut self, token: LoadToken, items: Vec<T>, more_available: bool) -> bool {
        if token.load_id != self.load_id {
            return false;
        }
        self.items.extend(items);
        self.current_page += 1;
        self.has_more_pages = more_available;
        self.loading = false;
        true
    }

    /// 加载失败：仅当代号仍然有效时清除 loading 标记
    pub fn fail(&mut self, token: LoadToken) -> bool {
        if token.load_id != self.load_id {
            return false;
        }
        self.loading = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_accumulate_in_order() {
        let mut p = PaginationState::new(2);
        let t = p.begin_load(false).unwrap();
        assert!(p.apply_page(t, vec!["a", "b"], true));
        let t = p.begin_load(false).unwrap();
        assert_eq!(t.page(), 1);
        assert!(p.apply_page(t, vec!["c"], false));
        assert_eq!(p.items(), &["a", "b", "c"]);
        assert!(!p.has_more_pages());
    }

    #[test]
    fn stale_result_is_dropped_after_reset() {
        let mut p = PaginationState::new(10);
        let stale = p.begin_load(false).unwrap();

        // 在途期间用户触发 refresh
        let fresh = p.begin_load(true).unwrap();

        // 旧的慢响应晚到，必须被丢弃
        assert!(!p.apply_page(stale, vec![1, 2, 3], true));
        assert!(p.items().is_empty());

        assert!(p.apply_page(fresh, vec![9], false));
        assert_eq!(p.items(), &[9]);
    }

    #[test]
    fn concurrent_load_more_is_rejected() {
        let mut p: PaginationState<i32> = PaginationState::new(10);
        let _inflight = p.begin_load(false).unwrap();
        assert!(p.begin_load(false).is_none());
        // refresh 总是取代在途加载
        assert!(p.begin_load(true).is_some());
    }

    #[test]
    fn no_load_more_when_exhausted() {
        let mut p = PaginationState::new(10);
        let t = p.begin_load(false).unwrap();
        p.apply_page(t, vec![1], false);
        assert!(p.begin_load(false).is_none());
    }

    #[test]
    fn failed_load_clears_loading_flag() {
        let mut p: PaginationState<i32> = PaginationState::new(10);
        let t = p.begin_load(false).unwrap();
        assert!(p.fail(t));
        assert!(!p.is_loading());
        assert!(p.begin_load(false).is_some());
    }
}
