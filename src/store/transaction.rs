//! Optimistic transactions and commit planning.
//!
//! A transaction runs a caller function against a snapshot view of the
//! store, collects copy-on-write page buffers, and turns them into a
//! commit: an updated index page plus the pages whose patches no longer
//! fit the index budget, spilled to real backend pages. The backend's
//! compare-and-swap decides; on a lost swap the whole attempt re-runs
//! against refreshed state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::backend::{Backend, BackendPageId, PageNumber, TransactionId};
use crate::index::IndexPage;
use crate::patch::Patch;

use super::{FlagGuard, PageStore, StoreError, StoreState};

/// Failure of a transaction-scoped page access.
///
/// `NotLoaded` is the internal retry signal: the attempt loop consumes it,
/// waits for the scheduled loads and re-runs the transaction function. It
/// never reaches `run_transaction`'s caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageAccessError {
    #[error("page {0} is not loaded yet")]
    NotLoaded(PageNumber),
    #[error("page number {0} is beyond the store's highest normal page")]
    OutOfRange(PageNumber),
}

/// What the transaction function decided.
#[derive(Debug)]
pub enum TransactionOutcome<R> {
    Commit(R),
    Abort,
}

/// What `run_transaction` reports back.
#[derive(Debug, PartialEq, Eq)]
pub enum TransactionResult<R> {
    Committed(R),
    NotCommitted,
}

impl<R> TransactionResult<R> {
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    pub fn into_committed(self) -> Option<R> {
        match self {
            Self::Committed(result) => Some(result),
            Self::NotCommitted => None,
        }
    }
}

/// The page view handed to a transaction function.
///
/// Reads come from the store's cache; the first `get_for_update` of a page
/// copies its bytes into a buffer owned by this transaction, and later
/// `get` calls observe that buffer. Nothing here may outlive the attempt.
pub struct TransactionPages<'store, B: Backend> {
    store: &'store PageStore<B>,
    reads: HashMap<PageNumber, Rc<[u8]>>,
    dirty: HashMap<PageNumber, Vec<u8>>,
}

impl<'store, B: Backend> TransactionPages<'store, B> {
    fn new(store: &'store PageStore<B>) -> Self {
        Self {
            store,
            reads: HashMap::new(),
            dirty: HashMap::new(),
        }
    }

    fn snapshot(&mut self, page: PageNumber) -> Result<Rc<[u8]>, PageAccessError> {
        if page > self.store.max_page_number() {
            return Err(PageAccessError::OutOfRange(page));
        }

        if let Some(bytes) = self.reads.get(&page) {
            return Ok(bytes.clone());
        }

        let mut state = self.store.state.borrow_mut();
        let bytes = self
            .store
            .lookup_or_pend(&mut state, page)
            .ok_or(PageAccessError::NotLoaded(page))?;
        drop(state);

        self.reads.insert(page, bytes.clone());
        Ok(bytes)
    }

    /// Read-only bytes of `page` as this transaction observes them.
    pub fn get(&mut self, page: PageNumber) -> Result<&[u8], PageAccessError> {
        if self.dirty.contains_key(&page) {
            return Ok(&self.dirty[&page]);
        }

        self.snapshot(page)?;
        Ok(&self.reads[&page])
    }

    /// Mutable bytes of `page`; the first call copies the current content.
    pub fn get_for_update(&mut self, page: PageNumber) -> Result<&mut [u8], PageAccessError> {
        if !self.dirty.contains_key(&page) {
            let bytes = self.snapshot(page)?.to_vec();
            self.dirty.insert(page, bytes);
        }

        Ok(self
            .dirty
            .get_mut(&page)
            .expect("the buffer was inserted above"))
    }
}

/// One planned commit, ready for the backend.
struct PlannedCommit {
    tx_id: TransactionId,
    prev_tx_id: TransactionId,
    index: IndexPage,
    pages: Vec<(PageNumber, Rc<[u8]>)>,
}

enum Plan {
    /// The dirty set collapses to no observable change.
    NoChange,
    /// A base buffer is missing; loads were scheduled, re-run the attempt.
    MissingBase,
    Write(Box<PlannedCommit>),
}

/// Per-commit scratch for a page being rewritten: `working` is the single
/// source of truth for its bytes, whether it ends up as patches against
/// `base` or as a materialized backend page.
struct ScratchPage {
    base: Rc<[u8]>,
    working: Vec<u8>,
    materialized: bool,
}

impl<B: Backend> PageStore<B> {
    /// Runs `tx_fn` against a snapshot of the store and commits what it
    /// dirtied, optimistically retrying on conflicts up to `retries` extra
    /// attempts (`None` retries without bound).
    ///
    /// At most one transaction may run per store; overlapping calls fail
    /// with [`StoreError::ConcurrentTransaction`].
    #[instrument(skip(self, tx_fn))]
    pub fn run_transaction<R>(
        &self,
        mut tx_fn: impl FnMut(&mut TransactionPages<'_, B>) -> Result<TransactionOutcome<R>, PageAccessError>,
        retries: Option<u32>,
    ) -> Result<TransactionResult<R>, StoreError> {
        if self.transaction_active.get() || self.draining_callbacks.get() {
            return Err(StoreError::ConcurrentTransaction);
        }

        self.transaction_active.set(true);
        let _guard = FlagGuard(&self.transaction_active);

        let mut tried = HashSet::new();
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                self.refresh();
            }
            self.loading_finished()?;

            let mut pages = TransactionPages::new(self);

            match tx_fn(&mut pages) {
                Err(PageAccessError::OutOfRange(page)) => {
                    return Err(StoreError::PageNumberOutOfRange(page));
                }
                Err(PageAccessError::NotLoaded(page)) => {
                    trace!(page = %page, attempt, "transaction touched an unloaded page");
                }
                Ok(TransactionOutcome::Abort) => {
                    return Ok(TransactionResult::NotCommitted);
                }
                Ok(TransactionOutcome::Commit(result)) => {
                    match self.plan_commit(&pages.dirty, &mut tried)? {
                        Plan::NoChange => {
                            return Ok(TransactionResult::Committed(result));
                        }
                        Plan::MissingBase => {
                            trace!(attempt, "commit planning is missing base pages");
                        }
                        Plan::Write(commit) => {
                            let index_bytes = commit.index.serialize();
                            let backend_pages: Vec<(BackendPageId, Vec<u8>)> = commit
                                .pages
                                .iter()
                                .map(|(page, bytes)| {
                                    (
                                        BackendPageId {
                                            page_number: *page,
                                            tx_id: commit.tx_id,
                                        },
                                        bytes.to_vec(),
                                    )
                                })
                                .collect();

                            debug!(
                                tx_id = %commit.tx_id,
                                materialized = backend_pages.len(),
                                index_len = index_bytes.len(),
                                attempt,
                                "writing commit"
                            );

                            if self.backend.write_pages(
                                (commit.tx_id, &index_bytes),
                                commit.prev_tx_id,
                                &backend_pages,
                            )? {
                                let PlannedCommit {
                                    tx_id,
                                    index,
                                    pages,
                                    ..
                                } = *commit;
                                self.install_commit(tx_id, Rc::new(index), pages)?;

                                return Ok(TransactionResult::Committed(result));
                            }

                            debug!(attempt, "lost the index compare-and-swap");
                        }
                    }
                }
            }

            if let Some(max) = retries {
                if attempt >= max {
                    return Ok(TransactionResult::NotCommitted);
                }
            }
            attempt += 1;
        }
    }

    #[instrument(skip(self, dirty, tried))]
    fn plan_commit(
        &self,
        dirty: &HashMap<PageNumber, Vec<u8>>,
        tried: &mut HashSet<TransactionId>,
    ) -> Result<Plan, StoreError> {
        if dirty.is_empty() {
            return Ok(Plan::NoChange);
        }

        let missing = {
            let state = self.state.borrow();
            match self.plan_commit_inner(&state, dirty, tried)? {
                Ok(plan) => return Ok(plan),
                Err(missing) => missing,
            }
        };

        let mut state = self.state.borrow_mut();
        state.pending.extend(missing);

        Ok(Plan::MissingBase)
    }

    /// The planning core; `Err` carries pages whose base bytes must be
    /// loaded before planning can complete.
    #[instrument(skip(self, state, dirty, tried))]
    fn plan_commit_inner(
        &self,
        state: &StoreState,
        dirty: &HashMap<PageNumber, Vec<u8>>,
        tried: &mut HashSet<TransactionId>,
    ) -> Result<Result<Plan, Vec<PageNumber>>, StoreError> {
        let Some(cached) = &state.index else {
            // cannot happen after a completed load, but recoverable: force
            // an index fetch and re-run the attempt
            return Ok(Err(Vec::new()));
        };

        let prev_tx_id = cached.tx_id;
        let index = cached.page.clone();
        let mut patches_map = index.patches().clone();

        // Fold every dirty page into the patch map as a diff against its
        // base bytes.
        let dirty_sorted: BTreeMap<&PageNumber, &Vec<u8>> = dirty.iter().collect();
        let mut changed = false;
        let mut missing = Vec::new();

        for (&page, new_bytes) in dirty_sorted {
            let Some(base) = self.base_of(state, page) else {
                missing.push(page);
                continue;
            };

            let new_patches = Patch::diff(&base, new_bytes)?;

            if new_patches.is_empty() {
                if patches_map.remove(&page).is_some() {
                    changed = true;
                }
            } else if patches_map
                .get(&page)
                .is_none_or(|existing| existing.as_ref() != new_patches.as_slice())
            {
                patches_map.insert(page, Rc::from(new_patches));
                changed = true;
            }
        }

        if !missing.is_empty() {
            return Ok(Err(missing));
        }

        if !changed {
            return Ok(Ok(Plan::NoChange));
        }

        // Pick the next transaction id, skipping ids this transaction has
        // already had rejected.
        let mut tx_id = prev_tx_id.next();
        while tried.contains(&tx_id) {
            tx_id = tx_id.next();
        }
        tried.insert(tx_id);

        // Shrink the index to its budget by spilling the largest patch
        // list to a real backend page, recording the new transaction id in
        // the transaction tree each time.
        let mut tx_tree_root = index.tx_tree_root();
        let mut scratch: HashMap<PageNumber, ScratchPage> = HashMap::new();

        loop {
            let candidate_len = IndexPage::serialized_len_of(&patches_map);
            if candidate_len <= self.max_index_page_size as usize {
                break;
            }

            let spill = *patches_map
                .iter()
                .max_by_key(|(_, list)| Patch::list_serialized_len(list))
                .map(|(page, _)| page)
                .expect("an oversized index always holds at least one patch list");

            trace!(page = %spill, index_len = candidate_len, "spilling largest patch list");

            if !scratch.contains_key(&spill) {
                let Some(base) = self.base_of(state, spill) else {
                    return Ok(Err(vec![spill]));
                };
                let mut working = base.to_vec();
                if let Some(list) = patches_map.get(&spill) {
                    Patch::apply_all(list, &mut working)?;
                }
                scratch.insert(
                    spill,
                    ScratchPage {
                        base,
                        working,
                        materialized: false,
                    },
                );
            }

            scratch
                .get_mut(&spill)
                .expect("inserted above")
                .materialized = true;
            patches_map.remove(&spill);

            match self.layout.tx_id_location(spill) {
                None => {
                    tx_tree_root = tx_id;
                }
                Some((tree_page, offset)) => {
                    if !scratch.contains_key(&tree_page) {
                        let Some(base) = self.base_of(state, tree_page) else {
                            return Ok(Err(vec![tree_page]));
                        };
                        let mut working = base.to_vec();
                        if let Some(list) = patches_map.get(&tree_page) {
                            Patch::apply_all(list, &mut working)?;
                        }
                        scratch.insert(
                            tree_page,
                            ScratchPage {
                                base,
                                working,
                                materialized: false,
                            },
                        );
                    }

                    let slot = scratch.get_mut(&tree_page).expect("inserted above");
                    tx_id.write_to(&mut slot.working, offset);

                    if !slot.materialized {
                        // still index-resident: keep its patch list in sync
                        // with the working bytes
                        let tree_patches = Patch::diff(&slot.base, &slot.working)?;
                        if tree_patches.is_empty() {
                            patches_map.remove(&tree_page);
                        } else {
                            patches_map.insert(tree_page, Rc::from(tree_patches));
                        }
                    }
                    // already materialized this commit: the write above
                    // landed directly in the page bytes going to the backend
                }
            }
        }

        let mut pages: Vec<(PageNumber, Rc<[u8]>)> = scratch
            .into_iter()
            .filter(|(_, slot)| slot.materialized)
            .map(|(page, slot)| (page, Rc::from(slot.working)))
            .collect();
        pages.sort_by_key(|(page, _)| *page);

        let index = IndexPage::new(self.page_size, tx_tree_root, patches_map);

        Ok(Ok(Plan::Write(Box::new(PlannedCommit {
            tx_id,
            prev_tx_id,
            index,
            pages,
        }))))
    }

    /// Base bytes of `page` at its currently effective transaction id, or
    /// `None` when the entry (or its backend buffer) is not loaded.
    fn base_of(&self, state: &StoreState, page: PageNumber) -> Option<Rc<[u8]>> {
        let entry = state.entries.get(&page)?;
        let key = entry.key.as_ref()?;

        if key.tx_id.is_zero() {
            return Some(self.zero_page.clone());
        }

        entry
            .base
            .as_ref()
            .filter(|(base_tx, _)| *base_tx == key.tx_id)
            .map(|(_, bytes)| bytes.clone())
    }
}
