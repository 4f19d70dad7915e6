//! Wrapping a backend with a byte-level transform.
//!
//! A transform is a pure pair of functions applied to every stored buffer:
//! `transform` on the way down, `reverse_transform` on the way up. Page
//! identifiers pass through unchanged, so transforms stack freely.

use super::{Backend, BackendError, BackendPageId, ReadSet, TransactionId};

pub trait PageTransform {
    /// Worst-case growth of a transformed buffer, in bytes. Subtracted from
    /// the inner backend's advertised maximum page size.
    fn max_page_size_overhead(&self) -> u16;

    fn transform(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError>;

    fn reverse_transform(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError>;
}

#[derive(Debug)]
pub struct TransformBackend<T, B> {
    transform: T,
    inner: B,
}

impl<T: PageTransform, B: Backend> TransformBackend<T, B> {
    pub const fn new(transform: T, inner: B) -> Self {
        Self { transform, inner }
    }
}

impl<T: PageTransform, B: Backend> Backend for TransformBackend<T, B> {
    fn max_page_size(&self) -> u32 {
        self.inner
            .max_page_size()
            .saturating_sub(u32::from(self.transform.max_page_size_overhead()))
    }

    fn read_pages(
        &self,
        include_index: bool,
        ids: &[BackendPageId],
    ) -> Result<ReadSet, BackendError> {
        let mut set = self.inner.read_pages(include_index, ids)?;

        if let Some((tx_id, bytes)) = set.index.take() {
            // a never-written index page is an empty buffer and carries no
            // transform
            let bytes = if bytes.is_empty() {
                bytes
            } else {
                self.transform.reverse_transform(&bytes)?
            };
            set.index = Some((tx_id, bytes));
        }

        for (_, bytes) in &mut set.pages {
            *bytes = self.transform.reverse_transform(bytes)?;
        }

        Ok(set)
    }

    fn write_pages(
        &self,
        new_index: (TransactionId, &[u8]),
        prev_tx_id: TransactionId,
        pages: &[(BackendPageId, Vec<u8>)],
    ) -> Result<bool, BackendError> {
        let index_bytes = self.transform.transform(new_index.1)?;
        let pages = pages
            .iter()
            .map(|(id, bytes)| Ok((*id, self.transform.transform(bytes)?)))
            .collect::<Result<Vec<_>, BackendError>>()?;

        self.inner
            .write_pages((new_index.0, &index_bytes), prev_tx_id, &pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PageNumber;
    use crate::backend::in_memory::InMemoryBackend;

    /// Flips every byte; enough to prove both directions run.
    struct Invert;

    impl PageTransform for Invert {
        fn max_page_size_overhead(&self) -> u16 {
            0
        }

        fn transform(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError> {
            Ok(bytes.iter().map(|b| !b).collect())
        }

        fn reverse_transform(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError> {
            self.transform(bytes)
        }
    }

    #[test]
    fn transforms_apply_on_write_and_reverse_on_read() {
        let inner = InMemoryBackend::new();
        let id = BackendPageId {
            page_number: PageNumber::new(0),
            tx_id: TransactionId::new(1),
        };

        {
            let backend = TransformBackend::new(Invert, &inner);
            backend
                .write_pages(
                    (TransactionId::new(1), &[1, 2, 3]),
                    TransactionId::ZERO,
                    &[(id, vec![0xf0])],
                )
                .unwrap();

            let set = backend.read_pages(true, &[id]).unwrap();
            assert_eq!(set.index, Some((TransactionId::new(1), vec![1, 2, 3])));
            assert_eq!(set.pages, vec![(id, vec![0xf0])]);
        }

        // the inner backend holds the transformed bytes
        let raw = inner.read_pages(true, &[id]).unwrap();
        assert_eq!(raw.index, Some((TransactionId::new(1), vec![!1, !2, !3])));
        assert_eq!(raw.pages, vec![(id, vec![0x0f])]);
    }

    #[test]
    fn empty_index_passes_through_untouched() {
        let backend = TransformBackend::new(Invert, InMemoryBackend::new());

        let set = backend.read_pages(true, &[]).unwrap();

        assert_eq!(set.index, Some((TransactionId::ZERO, vec![])));
    }

    #[test]
    fn overhead_shrinks_the_advertised_page_size() {
        struct Padded;

        impl PageTransform for Padded {
            fn max_page_size_overhead(&self) -> u16 {
                100
            }

            fn transform(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError> {
                Ok(bytes.to_vec())
            }

            fn reverse_transform(&self, bytes: &[u8]) -> Result<Vec<u8>, BackendError> {
                Ok(bytes.to_vec())
            }
        }

        let backend = TransformBackend::new(Padded, InMemoryBackend::with_max_page_size(8192));

        assert_eq!(backend.max_page_size(), 8092);
    }
}
