//! The block layer beneath the page store.
//!
//! A backend stores one index page plus a set of pages identified by
//! `(page number, transaction id)`. Reads return only pages whose stored
//! transaction id still matches; writes replace the index page and install
//! the given pages atomically, guarded by a compare-and-swap on the index
//! transaction id.

pub mod encryption;
pub mod gzip;
pub mod in_memory;
pub mod transform;

use std::error::Error;
use std::fmt::Display;
use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;

use crate::util::{self, U48_MAX};

/// Identifies one logical page. The high end of the `u32` space is reserved
/// for transaction-tree pages; see [`crate::tree::TreeLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNumber(u32);

impl PageNumber {
    #[must_use]
    pub const fn new(number: u32) -> Self {
        Self(number)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for PageNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 48-bit store version. `ZERO` is the sentinel for "never written";
/// a page at transaction id zero implicitly contains all-zero bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TransactionId(u64);

impl TransactionId {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(U48_MAX);

    /// # Panics
    ///
    /// Panics if `value` does not fit in 48 bits.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        assert!(value <= U48_MAX, "transaction id does not fit in 48 bits");

        Self(value)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self::new(self.0 + 1)
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn read_from(buf: &[u8], offset: usize) -> Self {
        Self(util::read_u48(buf, offset))
    }

    pub fn write_to(self, buf: &mut [u8], offset: usize) {
        util::write_u48(buf, offset, self.0);
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one stored version of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendPageId {
    pub page_number: PageNumber,
    pub tx_id: TransactionId,
}

impl Display for BackendPageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.page_number, self.tx_id)
    }
}

/// The outcome of a [`Backend::read_pages`] call.
///
/// Requested pages whose stored transaction id no longer matches are
/// omitted from `pages`. `index` is present iff the read asked for it; an
/// empty index buffer means the store has never been written.
#[derive(Debug, Default)]
pub struct ReadSet {
    pub index: Option<(TransactionId, Vec<u8>)>,
    pub pages: Vec<(BackendPageId, Vec<u8>)>,
}

/// An error raised by a backend for anything other than a lost
/// compare-and-swap. Propagated verbatim to the caller; the store never
/// retries it.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl BackendError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(
        message: impl Into<String>,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

pub trait Backend {
    /// The largest page (or index page) size in bytes this backend accepts.
    fn max_page_size(&self) -> u32;

    /// Reads the identified pages, plus the index page when `include_index`
    /// is set. Pages whose stored transaction id does not match are left out
    /// of the result.
    fn read_pages(
        &self,
        include_index: bool,
        ids: &[BackendPageId],
    ) -> Result<ReadSet, BackendError>;

    /// Atomically replaces the index page and installs every page in
    /// `pages`, iff `prev_tx_id` equals the currently stored index
    /// transaction id. Returns `Ok(false)` on a mismatch; the caller decides
    /// whether to retry.
    fn write_pages(
        &self,
        new_index: (TransactionId, &[u8]),
        prev_tx_id: TransactionId,
        pages: &[(BackendPageId, Vec<u8>)],
    ) -> Result<bool, BackendError>;
}

macro_rules! delegate_backend {
    ($wrapper:ty) => {
        impl<B: Backend + ?Sized> Backend for $wrapper {
            fn max_page_size(&self) -> u32 {
                (**self).max_page_size()
            }

            fn read_pages(
                &self,
                include_index: bool,
                ids: &[BackendPageId],
            ) -> Result<ReadSet, BackendError> {
                (**self).read_pages(include_index, ids)
            }

            fn write_pages(
                &self,
                new_index: (TransactionId, &[u8]),
                prev_tx_id: TransactionId,
                pages: &[(BackendPageId, Vec<u8>)],
            ) -> Result<bool, BackendError> {
                (**self).write_pages(new_index, prev_tx_id, pages)
            }
        }
    };
}

delegate_backend!(&B);
delegate_backend!(Rc<B>);
delegate_backend!(Arc<B>);
