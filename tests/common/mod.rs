//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;

use oxisearch::buffer::{BlockId, BufferPool, PageId};
use oxisearch::config::{AhiConfig, PoolConfig};
use oxisearch::cursor::{Cursor, CursorFlag, search_leaf};
use oxisearch::dict::{Dictionary, FieldDef, Index, IndexId, RowFormat, Table, Tuple};
use oxisearch::mtr::{LatchMode, Mtr};
use oxisearch::page::SearchMode;
use oxisearch::search::AhiSystem;

/// A single-leaf engine: pool, dictionary and the hash index system.
pub struct Harness {
    pub pool: Arc<BufferPool>,
    pub dict: Arc<Dictionary>,
    pub table: Arc<Table>,
    pub ahi: AhiSystem,
}

pub fn harness(n_pages: usize) -> Harness {
    let pool = Arc::new(BufferPool::new(&PoolConfig { n_pages }));
    let dict = Arc::new(Dictionary::new());
    let table = Table::new();
    dict.add_table(table.clone());
    let ahi = AhiSystem::new(AhiConfig::default(), pool.clone(), dict.clone());
    Harness {
        pool,
        dict,
        table,
        ahi,
    }
}

/// An index over one non-nullable u32 key column.
pub fn u32_index(h: &Harness, id: u64) -> Arc<Index> {
    let index = Index::new(
        IndexId(id),
        vec![FieldDef::fixed(4, false)],
        RowFormat::Compact,
        1,
    );
    h.table.add_index(index.clone());
    index
}

/// An index over two non-nullable u32 key columns.
pub fn pair_index(h: &Harness, id: u64) -> Arc<Index> {
    let index = Index::new(
        IndexId(id),
        vec![FieldDef::fixed(4, false), FieldDef::fixed(4, false)],
        RowFormat::Compact,
        2,
    );
    h.table.add_index(index.clone());
    index
}

pub fn key1(a: u32) -> Tuple {
    Tuple::new(vec![Some(a.to_be_bytes().to_vec())])
}

pub fn key2(a: u32, b: u32) -> Tuple {
    Tuple::new(vec![
        Some(a.to_be_bytes().to_vec()),
        Some(b.to_be_bytes().to_vec()),
    ])
}

/// Materialize a leaf page filled with the given tuples.
pub fn fill_page(h: &Harness, index: &Arc<Index>, page_id: u32, tuples: &[Tuple]) -> BlockId {
    let block_id = h
        .pool
        .create_page(PageId(page_id), index.id(), true)
        .expect("pool full");
    let page = h.pool.block(block_id).page();
    for tuple in tuples {
        page.insert_tuple(index, tuple).expect("page full");
    }
    block_id
}

/// One cursor positioning against a single leaf: hash fast path first,
/// tree-search fallback plus heuristic update otherwise.
///
/// Returns the positioned cursor and whether the hash index served it.
pub fn position(
    h: &Harness,
    index: &Arc<Index>,
    block_id: BlockId,
    tuple: &Tuple,
    mode: SearchMode,
) -> (Cursor, bool) {
    let mut cursor = Cursor::new(index.clone());
    {
        let mut mtr = Mtr::new();
        if h.ahi
            .guess_on_hash(index, tuple, mode, LatchMode::Search, &mut cursor, &mut mtr)
        {
            return (cursor, true);
        }
    }

    let mut mtr = Mtr::new();
    mtr.s_latch(h.pool.block(block_id));
    search_leaf(&h.pool, block_id, tuple, mode, &mut cursor);
    h.ahi.info_update(&cursor);
    mtr.commit();
    (cursor, false)
}

/// Build the page hash index under a shared page latch.
pub fn build(h: &Harness, index: &Arc<Index>, block_id: BlockId, shape: (u16, u16, bool)) {
    let block = h.pool.block(block_id);
    let _latch = block.latch.read();
    h.ahi
        .build_page_hash_index(index, block_id, shape.0, shape.1, shape.2);
}

/// Assert the cursor came through the hash index.
pub fn assert_via_hash(cursor: &Cursor) {
    assert_eq!(cursor.flag, CursorFlag::Hash);
}
