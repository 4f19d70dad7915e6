//! The page store: a copy-on-write cache of logical pages over a backend.
//!
//! Callers read through [`PageStore::get_page`], which never blocks: a page
//! that cannot be produced from cached state is scheduled for loading and
//! the call returns `None`. [`PageStore::loading_finished`] is the flush
//! point that drains every scheduled load into a single coalesced backend
//! read. Writes go through [`PageStore::run_transaction`].
//!
//! A page's logical bytes are its backend bytes at the transaction id
//! recorded in the transaction tree (all zeroes if that id is zero), with
//! the index page's outstanding patches applied on top. Entries carry a
//! `(tx id, patch list)` fingerprint so a newer index page only forces
//! rebuilds of pages that actually changed.

mod entry;
mod transaction;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::backend::{Backend, BackendError, BackendPageId, PageNumber, ReadSet, TransactionId};
use crate::index::{IndexError, IndexPage};
use crate::patch::{Patch, PatchError};
use crate::tree::TreeLayout;
use crate::util::zero_page;

use entry::{EntryKey, PageEntry, RecorderId};

pub use entry::PageBytes;
pub use transaction::{
    PageAccessError, TransactionOutcome, TransactionPages, TransactionResult,
};

pub const MIN_PAGE_SIZE: u32 = 4096;
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Floor for the index-page budget: the bare header plus room for a few
/// tree patches, below which the commit planner cannot make progress.
pub const MIN_INDEX_PAGE_SIZE: u32 = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("page size {0} is outside {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE} or beyond the backend's limit")]
    InvalidPageSize(u32),
    #[error("max index page size {0} is below {MIN_INDEX_PAGE_SIZE} or beyond the backend's limit")]
    InvalidMaxIndexPageSize(u32),
    #[error("page number {0} is beyond the store's highest normal page")]
    PageNumberOutOfRange(PageNumber),
    #[error("a transaction is already running on this store")]
    ConcurrentTransaction,
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone)]
struct CachedIndex {
    tx_id: TransactionId,
    page: Rc<IndexPage>,
}

#[derive(Default)]
struct StoreState {
    /// `None` until the first backend read returns; the cache cannot place
    /// any page before it knows the index.
    index: Option<CachedIndex>,
    entries: HashMap<PageNumber, PageEntry>,
    /// Pages scheduled for loading; drained as one coalesced backend read.
    pending: BTreeSet<PageNumber>,
    refresh_requested: bool,
    recorders: HashMap<RecorderId, Rc<dyn Fn()>>,
    /// While a recorder runs, every `get_page` touch lands here.
    recording: Option<(RecorderId, HashSet<PageNumber>)>,
    queued_changes: HashSet<RecorderId>,
    next_recorder_id: RecorderId,
}

/// Scratch carried through one evaluation pass over the cache.
#[derive(Default)]
struct EvalContext {
    evaluated: HashSet<PageNumber>,
    needed_reads: BTreeSet<BackendPageId>,
    pend: BTreeSet<PageNumber>,
    changed_watchers: HashSet<RecorderId>,
}

/// Clears a flag when dropped, so panics in user code cannot wedge the
/// store in an "active" state.
struct FlagGuard<'a>(&'a Cell<bool>);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct PageStore<B: Backend> {
    backend: B,
    page_size: u32,
    max_index_page_size: u32,
    layout: TreeLayout,
    zero_page: Rc<[u8]>,
    state: RefCell<StoreState>,
    transaction_active: Cell<bool>,
    draining_callbacks: Cell<bool>,
}

impl<B: Backend> PageStore<B> {
    pub fn new(backend: B, page_size: u32, max_index_page_size: u32) -> Result<Self, StoreError> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
            || page_size > backend.max_page_size()
        {
            return Err(StoreError::InvalidPageSize(page_size));
        }

        if max_index_page_size < MIN_INDEX_PAGE_SIZE
            || max_index_page_size > backend.max_page_size()
        {
            return Err(StoreError::InvalidMaxIndexPageSize(max_index_page_size));
        }

        Ok(Self {
            backend,
            page_size,
            max_index_page_size,
            layout: TreeLayout::new(page_size),
            zero_page: zero_page(page_size),
            state: RefCell::new(StoreState::default()),
            transaction_active: Cell::new(false),
            draining_callbacks: Cell::new(false),
        })
    }

    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    /// The highest page number callers may address.
    #[must_use]
    pub const fn max_page_number(&self) -> PageNumber {
        self.layout.max_normal_page_number()
    }

    /// True while scheduled loads (or a requested refresh) are outstanding.
    #[must_use]
    pub fn loading(&self) -> bool {
        let state = self.state.borrow();

        state.refresh_requested || !state.pending.is_empty()
    }

    /// Schedules a check for a newer index page in the backend.
    pub fn refresh(&self) {
        self.state.borrow_mut().refresh_requested = true;
    }

    /// The current logical bytes of `page`, if the cache can produce them
    /// without touching the backend. Otherwise schedules a load and returns
    /// `None`; call [`Self::loading_finished`] and retry.
    #[must_use]
    pub fn get_page(&self, page: PageNumber) -> Option<PageBytes> {
        if page > self.max_page_number() {
            return None;
        }

        let mut state = self.state.borrow_mut();

        if let Some((_, touched)) = &mut state.recording {
            touched.insert(page);
        }

        Some(PageBytes::new(self.lookup_or_pend(&mut state, page)?))
    }

    /// Drains scheduled loads, issuing one coalesced backend read per
    /// round, until nothing is outstanding.
    #[instrument(skip(self))]
    pub fn loading_finished(&self) -> Result<(), StoreError> {
        loop {
            let ids: Option<Vec<BackendPageId>> = {
                let mut state = self.state.borrow_mut();

                if !state.refresh_requested && state.pending.is_empty() {
                    return Ok(());
                }

                // a refresh, or not knowing the index at all, forces a
                // backend round even when no page read is needed
                let force_read = state.refresh_requested || state.index.is_none();
                state.refresh_requested = false;

                let pending: Vec<PageNumber> =
                    std::mem::take(&mut state.pending).into_iter().collect();
                let mut ctx = EvalContext::default();

                if state.index.is_some() {
                    for page in pending {
                        self.evaluate(&mut state, page, &mut ctx)?;
                    }
                } else {
                    // nothing can be placed before the index is known
                    state.pending.extend(pending);
                }

                let pends: Vec<_> = ctx.pend.iter().copied().collect();
                state.pending.extend(pends);
                state.queued_changes.extend(ctx.changed_watchers.iter().copied());

                let ids: Vec<BackendPageId> = ctx.needed_reads.into_iter().collect();
                (force_read || !ids.is_empty()).then_some(ids)
            };

            self.drain_change_callbacks();

            // everything was satisfied from cached state
            let Some(ids) = ids else { continue };

            trace!(pages = ids.len(), "issuing coalesced read");
            let set = self.backend.read_pages(true, &ids)?;
            self.install_read(set)?;
        }
    }

    /// Returns a recorder whose [`ReadsRecorder::record`] invocations track
    /// every page touched inside them. Once any recorded page's observable
    /// content changes, `on_change` fires exactly once; recording an empty
    /// read set deregisters it.
    pub fn reads_recorder(&self, on_change: impl Fn() + 'static) -> ReadsRecorder<'_, B> {
        let mut state = self.state.borrow_mut();
        let id = state.next_recorder_id;
        state.next_recorder_id += 1;
        state.recorders.insert(id, Rc::new(on_change));

        ReadsRecorder { store: self, id }
    }

    /// Current logical bytes if producible without backend I/O; pends a
    /// load otherwise. Shared by `get_page` and the transaction view.
    fn lookup_or_pend(
        &self,
        state: &mut StoreState,
        page: PageNumber,
    ) -> Option<Rc<[u8]>> {
        if let Some(buffer) = state.entries.get(&page).and_then(|e| e.buffer.clone()) {
            return Some(buffer);
        }

        let mut ctx = EvalContext::default();
        let built = self.evaluate(state, page, &mut ctx).ok().flatten();

        let pends: Vec<_> = ctx.pend.iter().copied().collect();
        state.pending.extend(pends);
        state.queued_changes.extend(ctx.changed_watchers.iter().copied());

        if built.is_none() {
            state.pending.insert(page);
        }

        built
    }

    /// Rebuilds (or revalidates) the cache entry for `page`, recursing
    /// through the transaction-tree pages that hold its transaction id.
    /// Returns the logical bytes, or `None` when backend data is missing,
    /// in which case the needed read and re-load are recorded in `ctx`.
    fn evaluate(
        &self,
        state: &mut StoreState,
        page: PageNumber,
        ctx: &mut EvalContext,
    ) -> Result<Option<Rc<[u8]>>, StoreError> {
        if !ctx.evaluated.insert(page) {
            return Ok(state.entries.get(&page).and_then(|e| e.buffer.clone()));
        }

        let Some(index) = state.index.as_ref().map(|c| c.page.clone()) else {
            ctx.pend.insert(page);
            return Ok(None);
        };

        let tx_id = match self.layout.tx_id_location(page) {
            None => index.tx_tree_root(),
            Some((tree_page, offset)) => {
                let Some(parent) = self.evaluate(state, tree_page, ctx)? else {
                    // the parent's evaluation recorded what it is missing
                    let entry = state.entries.entry(page).or_default();
                    entry.buffer = None;
                    entry.key = None;
                    return Ok(None);
                };

                TransactionId::read_from(&parent, offset)
            }
        };

        let patches = index.patches_for(page).cloned();
        let new_key = EntryKey {
            tx_id,
            patches: patches.clone(),
        };

        let entry = state.entries.entry(page).or_default();

        if entry.buffer.is_some() && entry.key.as_ref() == Some(&new_key) {
            // same fingerprint, same bytes; swap the key anyway so patch
            // lists of superseded index pages get released
            entry.key = Some(new_key);
            return Ok(entry.buffer.clone());
        }

        let base = if tx_id.is_zero() {
            self.zero_page.clone()
        } else {
            match &entry.base {
                Some((base_tx, bytes)) if *base_tx == tx_id => bytes.clone(),
                _ => {
                    entry.buffer = None;
                    entry.key = None;
                    ctx.needed_reads.insert(BackendPageId {
                        page_number: page,
                        tx_id,
                    });
                    ctx.pend.insert(page);
                    return Ok(None);
                }
            }
        };

        let buffer: Rc<[u8]> = match &patches {
            None => base.clone(),
            Some(list) => {
                let mut bytes = base.to_vec();
                Patch::apply_all(list, &mut bytes)?;
                Rc::from(bytes)
            }
        };

        trace!(page = %page, tx_id = %tx_id, "rebuilt page");

        entry.buffer = Some(buffer.clone());
        entry.key = Some(new_key);

        let base_is_stale = entry
            .base
            .as_ref()
            .is_some_and(|(base_tx, _)| *base_tx != tx_id);
        if base_is_stale {
            entry.base = None;
        }

        ctx.changed_watchers.extend(entry.watchers.iter().copied());

        Ok(Some(buffer))
    }

    /// One pass over every cache entry: transaction-tree pages top-down
    /// first (a page's transaction id lives on its parent), normal pages
    /// after.
    fn reevaluate_all(
        &self,
        state: &mut StoreState,
        ctx: &mut EvalContext,
    ) -> Result<(), StoreError> {
        let mut pages: Vec<PageNumber> = state.entries.keys().copied().collect();
        pages.sort_by_key(|p| {
            if self.layout.is_tree_page(*p) {
                (0u8, u32::MAX - p.as_u32())
            } else {
                (1, p.as_u32())
            }
        });

        for page in pages {
            self.evaluate(state, page, ctx)?;
        }

        Ok(())
    }

    /// Installs a backend read result: a newer index page replaces the
    /// cached one, returned pages land in their entries, and every entry is
    /// re-evaluated against the new state.
    fn install_read(&self, set: ReadSet) -> Result<(), StoreError> {
        {
            let mut state = self.state.borrow_mut();

            if let Some((tx_id, bytes)) = set.index
                && state.index.as_ref().is_none_or(|c| c.tx_id != tx_id)
            {
                let page = IndexPage::deserialize(&bytes, self.page_size)?;
                debug!(tx_id = %tx_id, patched_pages = page.patches().len(), "installing index page");
                state.index = Some(CachedIndex {
                    tx_id,
                    page: Rc::new(page),
                });
            }

            for (id, bytes) in set.pages {
                let entry = state.entries.entry(id.page_number).or_default();
                entry.base = Some((id.tx_id, Rc::from(bytes)));
            }

            let mut ctx = EvalContext::default();
            self.reevaluate_all(&mut state, &mut ctx)?;

            let pends: Vec<_> = ctx.pend.iter().copied().collect();
            state.pending.extend(pends);
            state.queued_changes.extend(ctx.changed_watchers.iter().copied());
        }

        self.drain_change_callbacks();

        Ok(())
    }

    /// Installs a commit of our own as if the backend had returned it.
    #[instrument(skip(self, index, pages))]
    fn install_commit(
        &self,
        tx_id: TransactionId,
        index: Rc<IndexPage>,
        pages: Vec<(PageNumber, Rc<[u8]>)>,
    ) -> Result<(), StoreError> {
        {
            let mut state = self.state.borrow_mut();

            debug!(tx_id = %tx_id, materialized = pages.len(), "installing committed state");
            state.index = Some(CachedIndex { tx_id, page: index });

            for (page, bytes) in pages {
                let entry = state.entries.entry(page).or_default();
                entry.base = Some((tx_id, bytes));
            }

            let mut ctx = EvalContext::default();
            self.reevaluate_all(&mut state, &mut ctx)?;

            let pends: Vec<_> = ctx.pend.iter().copied().collect();
            state.pending.extend(pends);
            state.queued_changes.extend(ctx.changed_watchers.iter().copied());
        }

        self.drain_change_callbacks();

        Ok(())
    }

    /// Fires every queued change callback, each at most once, outside any
    /// borrow of the store state. Callbacks may read pages and schedule
    /// work, but starting a transaction here is rejected.
    fn drain_change_callbacks(&self) {
        loop {
            let callbacks: Vec<Rc<dyn Fn()>> = {
                let mut state = self.state.borrow_mut();
                let ids: Vec<RecorderId> = state.queued_changes.drain().collect();

                ids.iter()
                    .filter_map(|id| state.recorders.get(id).cloned())
                    .collect()
            };

            if callbacks.is_empty() {
                return;
            }

            self.draining_callbacks.set(true);
            let _guard = FlagGuard(&self.draining_callbacks);

            for callback in &callbacks {
                callback();
            }
        }
    }

    fn remove_recorder(&self, id: RecorderId) {
        let mut state = self.state.borrow_mut();

        state.recorders.remove(&id);
        state.queued_changes.remove(&id);
        for entry in state.entries.values_mut() {
            entry.watchers.remove(&id);
        }
    }
}

/// Records which pages a read block touches and arms a change callback for
/// them. Obtained from [`PageStore::reads_recorder`].
pub struct ReadsRecorder<'store, B: Backend> {
    store: &'store PageStore<B>,
    id: RecorderId,
}

impl<B: Backend> ReadsRecorder<'_, B> {
    /// Runs `read`, recording every page it touches through the store. The
    /// recorded set replaces the previous invocation's; an empty set
    /// deregisters the callback for good.
    ///
    /// # Panics
    ///
    /// Panics if recorders are nested.
    pub fn record<T>(&self, read: impl FnOnce() -> T) -> T {
        {
            let mut state = self.store.state.borrow_mut();
            assert!(
                state.recording.is_none(),
                "read recorders cannot be nested"
            );
            state.recording = Some((self.id, HashSet::new()));
        }

        let out = read();

        let mut state = self.store.state.borrow_mut();
        let (_, touched) = state
            .recording
            .take()
            .expect("the recording started above is still active");

        for entry in state.entries.values_mut() {
            entry.watchers.remove(&self.id);
        }

        if touched.is_empty() {
            state.recorders.remove(&self.id);
            state.queued_changes.remove(&self.id);
        } else {
            for page in touched {
                state.entries.entry(page).or_default().watchers.insert(self.id);
            }
        }

        out
    }
}

impl<B: Backend> Drop for ReadsRecorder<'_, B> {
    fn drop(&mut self) {
        self.store.remove_recorder(self.id);
    }
}
