//! Static layout of the transaction tree.
//!
//! The transaction id of every page is stored as a 48-bit entry on a tree
//! page; tree pages occupy the top of the page-number space, reserved
//! top-down so the root is always the highest page number. The layout is
//! pure arithmetic: nothing here touches a backend.

use crate::backend::PageNumber;
use crate::util::U48_LEN;

/// Bytes one transaction-id entry occupies on a tree page.
pub const TX_ID_ENTRY_LEN: usize = U48_LEN;

#[derive(Debug, Clone, Copy)]
struct Level {
    start: u32,
    count: u32,
}

#[derive(Debug, Clone)]
pub struct TreeLayout {
    fanout: u32,
    max_normal: u32,
    /// Bottom-up: `levels[0]` holds the entries of normal pages, the last
    /// level is the single root page.
    levels: Vec<Level>,
}

impl TreeLayout {
    #[must_use]
    pub fn new(page_size: u32) -> Self {
        Self::with_max_page_number(page_size, u32::MAX)
    }

    /// Builds the layout for a page-number space capped at
    /// `max_page_number`. The full-width constructor is [`Self::new`]; the
    /// cap exists so the arithmetic can be exercised on small spaces.
    ///
    /// # Panics
    ///
    /// Panics if fewer than two entries fit on a page, or the space cannot
    /// hold even a one-page tree.
    #[must_use]
    pub fn with_max_page_number(page_size: u32, max_page_number: u32) -> Self {
        let fanout = page_size / u32::try_from(TX_ID_ENTRY_LEN).unwrap();
        assert!(fanout >= 2, "page size {page_size} holds fewer than two tree entries");

        let space = u64::from(max_page_number);
        let tree_pages = |max_normal: u64| -> u64 {
            level_counts(max_normal + 1, u64::from(fanout)).iter().sum()
        };

        // The highest max_normal whose tree still fits above it. The sum
        // max_normal + tree_pages(max_normal) is strictly increasing, so
        // this is the fixpoint of the top-down reservation whenever one
        // exists exactly.
        assert!(tree_pages(0) <= space, "page-number space cannot hold the transaction tree");
        let mut lo = 0u64;
        let mut hi = space;
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if mid + tree_pages(mid) <= space {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        let max_normal = lo;
        let counts = level_counts(max_normal + 1, u64::from(fanout));
        let total: u64 = counts.iter().sum();

        // Reserve top-down: the root lands exactly on max_page_number.
        let mut start = space - total + 1;
        debug_assert!(start > max_normal);
        let mut levels = Vec::with_capacity(counts.len());
        for count in counts {
            levels.push(Level {
                start: u32::try_from(start).unwrap(),
                count: u32::try_from(count).unwrap(),
            });
            start += count;
        }
        debug_assert_eq!(start - 1, space);

        Self {
            fanout,
            max_normal: u32::try_from(max_normal).unwrap(),
            levels,
        }
    }

    /// Number of 48-bit entries per tree page.
    #[must_use]
    pub const fn fanout(&self) -> u32 {
        self.fanout
    }

    /// The highest page number addressable by callers.
    #[must_use]
    pub const fn max_normal_page_number(&self) -> PageNumber {
        PageNumber::new(self.max_normal)
    }

    /// The root of the transaction tree; always the top of the space.
    #[must_use]
    pub fn root(&self) -> PageNumber {
        let root = self.levels.last().expect("the layout always has a root level");
        debug_assert_eq!(root.count, 1);
        PageNumber::new(root.start)
    }

    #[must_use]
    pub const fn is_tree_page(&self, page: PageNumber) -> bool {
        page.as_u32() > self.max_normal
    }

    /// Where `page`'s transaction id lives: the tree page and byte offset
    /// holding its 48-bit entry, or `None` for the tree root (whose id is
    /// carried by the index page).
    ///
    /// # Panics
    ///
    /// Panics if `page` is neither a normal page nor a tree page of this
    /// layout.
    #[must_use]
    pub fn tx_id_location(&self, page: PageNumber) -> Option<(PageNumber, usize)> {
        let n = page.as_u32();

        if n <= self.max_normal {
            return Some(self.entry_location(0, n));
        }

        let level = self
            .levels
            .iter()
            .position(|l| n >= l.start && n - l.start < l.count)
            .unwrap_or_else(|| panic!("page {page} is outside the layout"));

        if level == self.levels.len() - 1 {
            return None;
        }

        Some(self.entry_location(level + 1, n - self.levels[level].start))
    }

    fn entry_location(&self, level: usize, entry: u32) -> (PageNumber, usize) {
        let page = self.levels[level].start + entry / self.fanout;
        let offset = (entry % self.fanout) as usize * TX_ID_ENTRY_LEN;

        (PageNumber::new(page), offset)
    }
}

fn level_counts(entries: u64, fanout: u64) -> Vec<u64> {
    let mut counts = Vec::new();
    let mut remaining = entries;

    loop {
        let pages = remaining.div_ceil(fanout);
        counts.push(pages);

        if pages == 1 {
            return counts;
        }

        remaining = pages;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_single_page_tree_is_its_own_root() {
        // fanout 4 over a 6-page space: all normal ids fit on one tree page
        let layout = TreeLayout::with_max_page_number(24, 5);

        assert_eq!(layout.fanout(), 4);
        assert_eq!(layout.root(), PageNumber::new(5));
        assert_eq!(layout.max_normal_page_number(), PageNumber::new(3));
        assert_eq!(layout.tx_id_location(layout.root()), None);
        assert_eq!(
            layout.tx_id_location(PageNumber::new(0)),
            Some((PageNumber::new(5), 0))
        );
        assert_eq!(
            layout.tx_id_location(PageNumber::new(2)),
            Some((PageNumber::new(5), 2 * TX_ID_ENTRY_LEN))
        );
    }

    #[test]
    fn two_level_tree_places_leaves_below_the_root() {
        let layout = TreeLayout::with_max_page_number(24, 10);

        assert_eq!(layout.root(), PageNumber::new(10));
        assert_eq!(layout.max_normal_page_number(), PageNumber::new(7));
        // leaves at 8..=9, root at 10
        assert_eq!(
            layout.tx_id_location(PageNumber::new(5)),
            Some((PageNumber::new(9), TX_ID_ENTRY_LEN))
        );
        assert_eq!(
            layout.tx_id_location(PageNumber::new(8)),
            Some((PageNumber::new(10), 0))
        );
        assert_eq!(
            layout.tx_id_location(PageNumber::new(9)),
            Some((PageNumber::new(10), TX_ID_ENTRY_LEN))
        );
    }

    #[test]
    fn small_space_reserves_top_down() {
        // fanout 2 over a 30-page space: levels stack up to the root at 30
        let layout = TreeLayout::with_max_page_number(12, 30);

        let root = layout.root();
        assert_eq!(root, PageNumber::new(30));

        let max_normal = layout.max_normal_page_number();
        assert!(max_normal.as_u32() < 30);

        // every normal page resolves to a tree page above max_normal
        for n in 0..=max_normal.as_u32() {
            let (page, offset) = layout.tx_id_location(PageNumber::new(n)).unwrap();
            assert!(page.as_u32() > max_normal.as_u32());
            assert!(offset < 12);
        }
    }

    #[test]
    fn tree_pages_resolve_strictly_upward() {
        let layout = TreeLayout::with_max_page_number(8192, 1 << 20);

        let mut page = PageNumber::new(0);
        let mut hops = 0;
        while let Some((parent, _)) = layout.tx_id_location(page) {
            assert!(
                layout.is_tree_page(parent),
                "tx id of {page} must live on a tree page"
            );
            if layout.is_tree_page(page) {
                assert!(parent.as_u32() > page.as_u32());
            }
            page = parent;
            hops += 1;
            assert!(hops < 64, "location chain must terminate at the root");
        }
        assert_eq!(page, layout.root());
    }

    #[test]
    fn full_space_layout_is_consistent() {
        let layout = TreeLayout::new(8192);

        assert_eq!(layout.fanout(), 1365);
        assert_eq!(layout.root(), PageNumber::new(u32::MAX));

        let max_normal = layout.max_normal_page_number().as_u32();
        let (leaf, offset) = layout.tx_id_location(PageNumber::new(0)).unwrap();
        assert_eq!(leaf.as_u32(), max_normal + 1);
        assert_eq!(offset, 0);

        let (last_leaf, _) = layout
            .tx_id_location(PageNumber::new(max_normal))
            .unwrap();
        assert!(last_leaf.as_u32() > max_normal);
        assert!(last_leaf.as_u32() < u32::MAX);
    }

    #[quickcheck_macros::quickcheck]
    fn every_normal_page_resolves_above_max_normal(n: u32) -> bool {
        let layout = TreeLayout::new(4096);
        let max_normal = layout.max_normal_page_number().as_u32();
        let n = n.min(max_normal);

        let (page, offset) = layout.tx_id_location(PageNumber::new(n)).unwrap();

        page.as_u32() > max_normal && offset < 4096
    }

    #[quickcheck_macros::quickcheck]
    fn chains_terminate_at_the_root(n: u32) -> bool {
        let layout = TreeLayout::new(65536);
        let max_normal = layout.max_normal_page_number().as_u32();
        let mut page = PageNumber::new(n.min(max_normal));

        for _ in 0..64 {
            match layout.tx_id_location(page) {
                Some((parent, _)) => page = parent,
                None => return page == layout.root(),
            }
        }

        false
    }
}
