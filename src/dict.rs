//! Dictionary: index and table metadata.
//!
//! The adaptive hash index keys its state off dictionary objects: the index
//! id seeds the fold, `n_uniq` bounds the hashed prefix, the `freed` flag
//! drives lazy teardown, and [`SearchInfo`] carries the self-tuning state.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::constants::MAX_FIXED_LEN;

/// Identifier of an index tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(pub u64);

impl std::fmt::Display for IndexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "index#{}", self.0)
    }
}

/// Physical row format of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowFormat {
    /// Compact format: NULL columns occupy no space; variable-length
    /// columns carry a 1- or 2-byte length in the record header.
    #[default]
    Compact,
    /// Legacy format: a field-end offset array in the record header; NULL
    /// fixed-length columns still occupy their full (zero-filled) length.
    Legacy,
}

/// Metadata of one key column
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    /// Fixed byte length, or `None` for a variable-length column.
    pub fixed_len: Option<u16>,
    /// Maximum byte length. Decides between 1- and 2-byte length encoding
    /// for variable-length columns in the compact format.
    pub max_len: u16,
    /// Whether the column accepts NULL.
    pub nullable: bool,
}

impl FieldDef {
    /// A fixed-length column.
    pub fn fixed(len: u16, nullable: bool) -> Self {
        assert!(len as usize <= MAX_FIXED_LEN);
        Self {
            fixed_len: Some(len),
            max_len: len,
            nullable,
        }
    }

    /// A variable-length column with the given maximum length.
    pub fn variable(max_len: u16, nullable: bool) -> Self {
        Self {
            fixed_len: None,
            max_len,
            nullable,
        }
    }

    /// Whether a length for this column may need two header bytes.
    #[inline]
    pub(crate) fn is_big(&self) -> bool {
        self.max_len > 255
    }
}

/// Logical key tuple used for searches.
///
/// Each field is either `None` (SQL NULL) or a byte string compared with
/// unsigned memcmp semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple {
    fields: Vec<Option<Vec<u8>>>,
    info_bits: u8,
}

impl Tuple {
    /// Flag marking the reserved "minimum record" placeholder.
    pub const MIN_REC_FLAG: u8 = 0x02;

    /// Create a tuple from field values.
    pub fn new(fields: Vec<Option<Vec<u8>>>) -> Self {
        Self {
            fields,
            info_bits: 0,
        }
    }

    /// Create the reserved minimum-record placeholder tuple.
    pub fn min_rec(fields: Vec<Option<Vec<u8>>>) -> Self {
        Self {
            fields,
            info_bits: Self::MIN_REC_FLAG,
        }
    }

    /// Number of fields in the tuple
    #[inline]
    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    /// Value of the n-th field, `None` meaning SQL NULL
    #[inline]
    pub fn field(&self, i: usize) -> Option<&[u8]> {
        self.fields[i].as_deref()
    }

    /// Whether this is the reserved minimum-record placeholder
    #[inline]
    pub fn is_min_rec(&self) -> bool {
        self.info_bits & Self::MIN_REC_FLAG != 0
    }
}

/// Self-tuning state of one index.
///
/// NOTE: these fields are read and written without any latch to keep the
/// heuristic off the hot path. Readers must tolerate torn values; nothing
/// here is authoritative. Every consumer re-checks what matters after
/// acquiring the partition latch.
#[derive(Debug, Default)]
pub struct SearchInfo {
    /// Consecutive potentially successful hash searches (saturating streak)
    n_hash_potential: AtomicU32,
    /// Recommended number of complete prefix fields
    n_fields: AtomicU16,
    /// Recommended number of bytes of the next field
    n_bytes: AtomicU16,
    /// Whether a run of equal folds anchors at its first record
    left_side: AtomicBool,
    /// Whether the last hash search with these parameters succeeded
    last_hash_succ: AtomicBool,
    /// Number of buffer-pool pages hashed for this index
    ref_count: AtomicU32,
    /// Successful hash lookups on this index
    n_hash_succ: AtomicU64,
    /// Failed hash lookups on this index
    n_hash_fail: AtomicU64,
}

impl SearchInfo {
    /// Current potential streak (approximate; racy by design)
    pub fn n_hash_potential(&self) -> u32 {
        self.n_hash_potential.load(Ordering::Relaxed)
    }

    pub(crate) fn set_n_hash_potential(&self, v: u32) {
        self.n_hash_potential.store(v, Ordering::Relaxed);
    }

    pub(crate) fn inc_n_hash_potential(&self) {
        self.n_hash_potential.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn n_fields(&self) -> u16 {
        self.n_fields.load(Ordering::Relaxed)
    }

    pub(crate) fn n_bytes(&self) -> u16 {
        self.n_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn left_side(&self) -> bool {
        self.left_side.load(Ordering::Relaxed)
    }

    pub(crate) fn set_shape(&self, n_fields: u16, n_bytes: u16) {
        self.n_fields.store(n_fields, Ordering::Relaxed);
        self.n_bytes.store(n_bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_left_side(&self, v: bool) {
        self.left_side.store(v, Ordering::Relaxed);
    }

    /// Whether the last hash search with the recommended shape succeeded
    pub fn last_hash_succ(&self) -> bool {
        self.last_hash_succ.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_hash_succ(&self, v: bool) {
        self.last_hash_succ.store(v, Ordering::Relaxed);
    }

    /// Number of buffer-pool pages hashed for this index
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_ref_count(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the previous value.
    pub(crate) fn dec_ref_count(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::Relaxed)
    }

    pub(crate) fn zero_ref_count(&self) {
        self.ref_count.store(0, Ordering::Relaxed);
    }

    pub(crate) fn inc_n_hash_succ(&self) {
        self.n_hash_succ.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_n_hash_succ_saturating(&self) {
        let _ = self
            .n_hash_succ
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub(crate) fn inc_n_hash_fail(&self) {
        self.n_hash_fail.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful hash lookups on this index
    pub fn n_hash_succ(&self) -> u64 {
        self.n_hash_succ.load(Ordering::Relaxed)
    }

    /// Failed hash lookups on this index
    pub fn n_hash_fail(&self) -> u64 {
        self.n_hash_fail.load(Ordering::Relaxed)
    }
}

/// Metadata of one index tree
#[derive(Debug)]
pub struct Index {
    id: IndexId,
    fields: Vec<FieldDef>,
    format: RowFormat,
    n_uniq: u16,
    freed: AtomicBool,
    /// Self-tuning hash search state
    pub search_info: SearchInfo,
    table: OnceLock<Weak<Table>>,
}

impl Index {
    /// Create an index definition.
    ///
    /// `n_uniq` is the number of leading key fields that uniquely identify
    /// a row in the tree; the hashed prefix never exceeds it.
    pub fn new(id: IndexId, fields: Vec<FieldDef>, format: RowFormat, n_uniq: u16) -> Arc<Self> {
        assert!(n_uniq as usize <= fields.len());
        assert!(n_uniq > 0);
        Arc::new(Self {
            id,
            fields,
            format,
            n_uniq,
            freed: AtomicBool::new(false),
            search_info: SearchInfo::default(),
            table: OnceLock::new(),
        })
    }

    /// Index id
    #[inline]
    pub fn id(&self) -> IndexId {
        self.id
    }

    /// Key column metadata
    #[inline]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Row format of the index
    #[inline]
    pub fn format(&self) -> RowFormat {
        self.format
    }

    /// Minimum number of leading key fields that uniquely identify a row
    #[inline]
    pub fn n_uniq(&self) -> u16 {
        self.n_uniq
    }

    /// Whether the index has been dropped from the dictionary
    #[inline]
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn set_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }

    /// Owning table, if still attached
    pub fn table(&self) -> Option<Arc<Table>> {
        self.table.get().and_then(Weak::upgrade)
    }

    fn attach(&self, table: &Arc<Table>) {
        self.table
            .set(Arc::downgrade(table))
            .expect("index attached twice");
    }
}

/// Metadata of one table
#[derive(Debug, Default)]
pub struct Table {
    /// Live indexes
    indexes: Mutex<Vec<Arc<Index>>>,
    /// Dropped indexes still referenced by hashed pages
    freed_indexes: Mutex<Vec<Arc<Index>>>,
}

impl Table {
    /// Create an empty table
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an index to this table
    pub fn add_index(self: &Arc<Self>, index: Arc<Index>) {
        index.attach(self);
        self.indexes.lock().push(index);
    }

    /// Drop an index: mark it freed and move it to the freed list.
    ///
    /// If no hashed page references the index, it is released right away
    /// and never enters the freed list.
    pub fn drop_index(&self, index: &Arc<Index>) {
        index.set_freed();
        let mut live = self.indexes.lock();
        live.retain(|i| !Arc::ptr_eq(i, index));
        drop(live);
        if index.search_info.ref_count() > 0 {
            self.freed_indexes.lock().push(index.clone());
        }
    }

    /// Live indexes of the table
    pub fn indexes(&self) -> Vec<Arc<Index>> {
        self.indexes.lock().clone()
    }

    /// Dropped indexes still referenced by hashed pages
    pub fn freed_indexes(&self) -> Vec<Arc<Index>> {
        self.freed_indexes.lock().clone()
    }

    /// Remove an index from the freed list. Returns whether the table is
    /// now empty of both live and freed indexes.
    pub(crate) fn release_freed_index(&self, index: &Arc<Index>) -> bool {
        let mut freed = self.freed_indexes.lock();
        freed.retain(|i| !Arc::ptr_eq(i, index));
        let empty = freed.is_empty();
        drop(freed);
        empty && self.indexes.lock().is_empty()
    }
}

/// The data dictionary cache
#[derive(Debug, Default)]
pub struct Dictionary {
    tables: RwLock<Vec<Arc<Table>>>,
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table
    pub fn add_table(&self, table: Arc<Table>) {
        self.tables.write().push(table);
    }

    /// Remove a table from the cache. Its memory is released when the last
    /// hashed page of its freed indexes has been drained.
    pub fn drop_table(&self, table: &Arc<Table>) {
        self.tables.write().retain(|t| !Arc::ptr_eq(t, table));
    }

    /// Freeze the dictionary for a consistent walk over all tables.
    ///
    /// The returned guard blocks table registration and removal, not index
    /// state changes.
    pub fn freeze(&self) -> RwLockReadGuard<'_, Vec<Arc<Table>>> {
        self.tables.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index(id: u64) -> Arc<Index> {
        Index::new(
            IndexId(id),
            vec![FieldDef::fixed(8, false), FieldDef::variable(32, true)],
            RowFormat::Compact,
            1,
        )
    }

    #[test]
    fn test_drop_index_without_references_releases_immediately() {
        let table = Table::new();
        let index = sample_index(1);
        table.add_index(index.clone());

        table.drop_index(&index);
        assert!(index.is_freed());
        assert!(table.indexes().is_empty());
        assert!(table.freed_indexes().is_empty());
    }

    #[test]
    fn test_drop_index_with_references_enters_freed_list() {
        let table = Table::new();
        let index = sample_index(2);
        table.add_index(index.clone());
        index.search_info.inc_ref_count();

        table.drop_index(&index);
        assert!(index.is_freed());
        assert_eq!(table.freed_indexes().len(), 1);

        let empty = table.release_freed_index(&index);
        assert!(empty);
    }

    #[test]
    fn test_index_table_backlink() {
        let table = Table::new();
        let index = sample_index(3);
        table.add_index(index.clone());
        assert!(Arc::ptr_eq(&index.table().unwrap(), &table));
    }

    #[test]
    fn test_dictionary_freeze_sees_tables() {
        let dict = Dictionary::new();
        let table = Table::new();
        dict.add_table(table.clone());
        assert_eq!(dict.freeze().len(), 1);
        dict.drop_table(&table);
        assert!(dict.freeze().is_empty());
    }

    #[test]
    fn test_tuple_min_rec_flag() {
        let t = Tuple::new(vec![Some(b"a".to_vec())]);
        assert!(!t.is_min_rec());
        let m = Tuple::min_rec(vec![Some(b"a".to_vec())]);
        assert!(m.is_min_rec());
    }
}
