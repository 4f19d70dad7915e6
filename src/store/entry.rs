//! Cache entries and their change-detection fingerprints.

use std::collections::HashSet;
use std::ops::Deref;
use std::rc::Rc;

use crate::backend::TransactionId;
use crate::patch::Patch;

/// Handle identifying one registered reads recorder.
pub(crate) type RecorderId = u64;

/// A cheap, shared handle to the immutable logical bytes of a page.
///
/// The buffer never changes behind the handle; a newer version of the page
/// gets a fresh buffer in the cache instead.
#[derive(Debug, Clone)]
pub struct PageBytes(Rc<[u8]>);

impl PageBytes {
    pub(crate) const fn new(bytes: Rc<[u8]>) -> Self {
        Self(bytes)
    }
}

impl Deref for PageBytes {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for PageBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The fingerprint of one cache entry: the page's effective transaction id
/// plus its outstanding patch list. Equal fingerprints imply byte-equal
/// logical content; an unequal fingerprint means the entry must be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntryKey {
    pub tx_id: TransactionId,
    pub patches: Option<Rc<[Patch]>>,
}

/// One logical page in the cache. Entries are created on first access and
/// live for the life of the store.
#[derive(Debug, Default)]
pub(crate) struct PageEntry {
    /// Backend bytes of this page at the stored transaction id.
    pub base: Option<(TransactionId, Rc<[u8]>)>,
    /// Current logical bytes; `None` while the entry cannot be built.
    pub buffer: Option<Rc<[u8]>>,
    pub key: Option<EntryKey>,
    /// Recorders to notify when this entry's fingerprint changes.
    pub watchers: HashSet<RecorderId>,
}
