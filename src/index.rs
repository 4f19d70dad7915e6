//! The index page: the single root-of-store page.
//!
//! It carries the transaction id of the transaction-tree root plus every
//! outstanding patch list, keyed by page number. Its serialized form is
//! normative; backends must preserve the bytes verbatim.
//!
//! Layout, big-endian:
//!
//! ```text
//! u16 version = 1
//! u32 page size
//! u48 tx-tree root transaction id
//! u16 number of pages with patches
//!   repeated: u32 page number, u16 patch count, patch frames
//! ```

use std::collections::BTreeMap;
use std::rc::Rc;

use thiserror::Error;

use crate::backend::{PageNumber, TransactionId};
use crate::patch::{Patch, PatchError};
use crate::util::U48_LEN;

pub const INDEX_FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = 2 + 4 + U48_LEN + 2;
const PAGE_HEADER_LEN: usize = 4 + 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("unsupported index page version {0}")]
    UnsupportedVersion(u16),
    #[error("index page was written for page size {stored}, store is configured for {configured}")]
    PageSizeMismatch { stored: u32, configured: u32 },
    #[error("truncated index page")]
    Truncated,
    #[error("index page carries bytes past its declared content")]
    TrailingBytes,
    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// The deserialized index page. An empty backend buffer deserializes to
/// [`IndexPage::empty`], the state of a store that has never been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPage {
    page_size: u32,
    tx_tree_root: TransactionId,
    patches: BTreeMap<PageNumber, Rc<[Patch]>>,
}

impl IndexPage {
    #[must_use]
    pub const fn empty(page_size: u32) -> Self {
        Self {
            page_size,
            tx_tree_root: TransactionId::ZERO,
            patches: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn new(
        page_size: u32,
        tx_tree_root: TransactionId,
        patches: BTreeMap<PageNumber, Rc<[Patch]>>,
    ) -> Self {
        Self {
            page_size,
            tx_tree_root,
            patches,
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub const fn tx_tree_root(&self) -> TransactionId {
        self.tx_tree_root
    }

    #[must_use]
    pub const fn patches(&self) -> &BTreeMap<PageNumber, Rc<[Patch]>> {
        &self.patches
    }

    #[must_use]
    pub fn patches_for(&self, page: PageNumber) -> Option<&Rc<[Patch]>> {
        self.patches.get(&page)
    }

    #[must_use]
    pub fn serialized_len(&self) -> usize {
        HEADER_LEN
            + self
                .patches
                .values()
                .map(|list| PAGE_HEADER_LEN + Patch::list_serialized_len(list))
                .sum::<usize>()
    }

    /// Serialized length of an index with the given patch map, without
    /// constructing it. The commit planner sizes candidates with this.
    #[must_use]
    pub fn serialized_len_of(patches: &BTreeMap<PageNumber, Rc<[Patch]>>) -> usize {
        HEADER_LEN
            + patches
                .values()
                .map(|list| PAGE_HEADER_LEN + Patch::list_serialized_len(list))
                .sum::<usize>()
    }

    /// # Panics
    ///
    /// Panics if a patch list is too long for its u16 count field; the
    /// commit planner's size budget keeps real indexes far below that.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let expected = self.serialized_len();
        let mut out = Vec::with_capacity(expected);

        out.extend_from_slice(&INDEX_FORMAT_VERSION.to_be_bytes());
        out.extend_from_slice(&self.page_size.to_be_bytes());
        let mut root = [0u8; U48_LEN];
        self.tx_tree_root.write_to(&mut root, 0);
        out.extend_from_slice(&root);
        out.extend_from_slice(
            &u16::try_from(self.patches.len())
                .expect("patched page count must fit in u16")
                .to_be_bytes(),
        );

        for (page, list) in &self.patches {
            out.extend_from_slice(&page.as_u32().to_be_bytes());
            out.extend_from_slice(
                &u16::try_from(list.len())
                    .expect("patch count must fit in u16")
                    .to_be_bytes(),
            );
            for patch in list.iter() {
                patch.serialize_into(&mut out);
            }
        }

        assert_eq!(out.len(), expected, "serialized index length must match the precomputed length");

        out
    }

    pub fn deserialize(bytes: &[u8], expected_page_size: u32) -> Result<Self, IndexError> {
        if bytes.is_empty() {
            return Ok(Self::empty(expected_page_size));
        }

        let mut reader = Reader { buf: bytes, pos: 0 };

        let version = reader.u16()?;
        if version != INDEX_FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion(version));
        }

        let page_size = reader.u32()?;
        if page_size != expected_page_size {
            return Err(IndexError::PageSizeMismatch {
                stored: page_size,
                configured: expected_page_size,
            });
        }

        let tx_tree_root = TransactionId::read_from(reader.take(U48_LEN)?, 0);
        let page_count = reader.u16()?;

        let mut patches = BTreeMap::new();
        for _ in 0..page_count {
            let page = PageNumber::new(reader.u32()?);
            let patch_count = reader.u16()?;

            let mut list = Vec::with_capacity(usize::from(patch_count));
            for _ in 0..patch_count {
                let (patch, consumed) = Patch::deserialize(reader.rest())?;
                reader.pos += consumed;
                list.push(patch);
            }

            patches.insert(page, Rc::from(list));
        }

        if reader.pos != bytes.len() {
            return Err(IndexError::TrailingBytes);
        }

        Ok(Self {
            page_size,
            tx_tree_root,
            patches,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexError> {
        if self.pos + n > self.buf.len() {
            return Err(IndexError::Truncated);
        }

        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn u16(&mut self) -> Result<u16, IndexError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, IndexError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IndexPage {
        let mut patches = BTreeMap::new();
        patches.insert(
            PageNumber::new(0),
            Rc::from(vec![Patch::new(0, vec![42]), Patch::new(100, vec![1, 2, 3])]),
        );
        patches.insert(
            PageNumber::new(7),
            Rc::from(vec![Patch::new(8000, vec![0xff; 255])]),
        );

        IndexPage::new(8192, TransactionId::new(12), patches)
    }

    #[test]
    fn empty_buffer_is_the_fresh_store_sentinel() {
        let index = IndexPage::deserialize(&[], 8192).unwrap();

        assert_eq!(index, IndexPage::empty(8192));
        assert_eq!(index.tx_tree_root(), TransactionId::ZERO);
        assert!(index.patches().is_empty());
    }

    #[test]
    fn round_trips() {
        let index = sample();

        let bytes = index.serialize();

        assert_eq!(bytes.len(), index.serialized_len());
        assert_eq!(IndexPage::deserialize(&bytes, 8192).unwrap(), index);
    }

    #[test]
    fn empty_index_serializes_to_the_bare_header() {
        let index = IndexPage::empty(4096);

        let bytes = index.serialize();

        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(IndexPage::deserialize(&bytes, 4096).unwrap(), index);
    }

    #[test]
    fn rejects_unknown_versions() {
        let mut bytes = sample().serialize();
        bytes[0] = 0;
        bytes[1] = 9;

        assert_eq!(
            IndexPage::deserialize(&bytes, 8192),
            Err(IndexError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn rejects_reconfigured_page_size() {
        let bytes = sample().serialize();

        assert_eq!(
            IndexPage::deserialize(&bytes, 4096),
            Err(IndexError::PageSizeMismatch {
                stored: 8192,
                configured: 4096
            })
        );
    }

    #[test]
    fn rejects_truncation_at_every_length() {
        let bytes = sample().serialize();

        for len in 1..bytes.len() {
            let err = IndexPage::deserialize(&bytes[..len], 8192).unwrap_err();
            assert!(
                matches!(err, IndexError::Truncated | IndexError::Patch(PatchError::Truncated)),
                "unexpected error at length {len}: {err:?}"
            );
        }
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = sample().serialize();
        bytes.push(0);

        assert_eq!(
            IndexPage::deserialize(&bytes, 8192),
            Err(IndexError::TrailingBytes)
        );
    }

    #[quickcheck_macros::quickcheck]
    fn arbitrary_patch_maps_round_trip(seed: Vec<(u32, Vec<(u16, Vec<u8>)>)>) -> bool {
        let mut patches = BTreeMap::new();
        for (page, lists) in seed {
            let list: Vec<Patch> = lists
                .into_iter()
                .filter(|(_, bytes)| !bytes.is_empty())
                .map(|(offset, mut bytes)| {
                    bytes.truncate(255);
                    Patch::new(offset, bytes)
                })
                .collect();
            if !list.is_empty() {
                patches.insert(PageNumber::new(page), Rc::from(list));
            }
        }
        let index = IndexPage::new(8192, TransactionId::new(7), patches);

        IndexPage::deserialize(&index.serialize(), 8192).unwrap() == index
    }
}
