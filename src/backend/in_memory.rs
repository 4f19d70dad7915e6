//! Reference backend holding everything in a mutex-guarded map.
//!
//! This is the minimum a real backend must provide: versioned page reads
//! and an atomic compare-and-swap write on the index transaction id. It is
//! shared between stores (wrap it in `Rc`/`Arc`); the CAS is what makes
//! concurrent commits against one backend safe.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use super::{Backend, BackendError, BackendPageId, PageNumber, ReadSet, TransactionId};

#[derive(Debug, Default)]
struct State {
    index_tx_id: TransactionId,
    index: Vec<u8>,
    pages: HashMap<PageNumber, (TransactionId, Vec<u8>)>,
}

#[derive(Debug)]
pub struct InMemoryBackend {
    max_page_size: u32,
    state: Mutex<State>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_page_size(65536)
    }

    #[must_use]
    pub fn with_max_page_size(max_page_size: u32) -> Self {
        Self {
            max_page_size,
            state: Mutex::new(State::default()),
        }
    }

    /// Number of stored pages, normal and transaction-tree alike. The
    /// index page does not count.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.state.lock().unwrap().pages.len()
    }

    #[must_use]
    pub fn index_tx_id(&self) -> TransactionId {
        self.state.lock().unwrap().index_tx_id
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for InMemoryBackend {
    fn max_page_size(&self) -> u32 {
        self.max_page_size
    }

    fn read_pages(
        &self,
        include_index: bool,
        ids: &[BackendPageId],
    ) -> Result<ReadSet, BackendError> {
        let state = self.state.lock().unwrap();

        let index = include_index.then(|| (state.index_tx_id, state.index.clone()));
        let pages = ids
            .iter()
            .filter_map(|id| match state.pages.get(&id.page_number) {
                Some((tx_id, bytes)) if *tx_id == id.tx_id => Some((*id, bytes.clone())),
                _ => None,
            })
            .collect();

        Ok(ReadSet { index, pages })
    }

    fn write_pages(
        &self,
        new_index: (TransactionId, &[u8]),
        prev_tx_id: TransactionId,
        pages: &[(BackendPageId, Vec<u8>)],
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock().unwrap();

        if state.index_tx_id != prev_tx_id {
            debug!(
                requested = %prev_tx_id,
                current = %state.index_tx_id,
                "rejecting write, index has moved"
            );

            return Ok(false);
        }

        let (tx_id, bytes) = new_index;
        state.index_tx_id = tx_id;
        state.index = bytes.to_vec();

        for (id, bytes) in pages {
            state
                .pages
                .insert(id.page_number, (id.tx_id, bytes.clone()));
        }

        debug!(tx_id = %tx_id, pages = pages.len(), "committed");

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(page: u32, tx: u64) -> BackendPageId {
        BackendPageId {
            page_number: PageNumber::new(page),
            tx_id: TransactionId::new(tx),
        }
    }

    #[test]
    fn fresh_backend_has_an_empty_index() {
        let backend = InMemoryBackend::new();

        let set = backend.read_pages(true, &[]).unwrap();

        assert_eq!(set.index, Some((TransactionId::ZERO, vec![])));
        assert!(set.pages.is_empty());
    }

    #[test]
    fn write_requires_matching_index_tx_id() {
        let backend = InMemoryBackend::new();

        assert!(
            !backend
                .write_pages((TransactionId::new(1), &[1]), TransactionId::new(5), &[])
                .unwrap()
        );
        assert!(
            backend
                .write_pages((TransactionId::new(1), &[1]), TransactionId::ZERO, &[])
                .unwrap()
        );
        assert_eq!(backend.index_tx_id(), TransactionId::new(1));

        // the first writer won; a second writer against the old id loses
        assert!(
            !backend
                .write_pages((TransactionId::new(1), &[2]), TransactionId::ZERO, &[])
                .unwrap()
        );
    }

    #[test]
    fn reads_filter_superseded_page_versions() {
        let backend = InMemoryBackend::new();
        backend
            .write_pages(
                (TransactionId::new(1), &[0]),
                TransactionId::ZERO,
                &[(id(3, 1), vec![0xaa])],
            )
            .unwrap();
        backend
            .write_pages(
                (TransactionId::new(2), &[0]),
                TransactionId::new(1),
                &[(id(3, 2), vec![0xbb])],
            )
            .unwrap();

        let set = backend
            .read_pages(false, &[id(3, 1), id(3, 2), id(9, 1)])
            .unwrap();

        assert_eq!(set.index, None);
        assert_eq!(set.pages, vec![(id(3, 2), vec![0xbb])]);
        assert_eq!(backend.page_count(), 1);
    }
}
