//! Randomized single-page workload: interleaved searches, inserts and
//! deletes with the adaptive hash index live, checking structural
//! invariants along the way.

mod common;

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{harness, key1, position, u32_index};
use oxisearch::buffer::PageId;
use oxisearch::cursor::{Cursor, search_leaf};
use oxisearch::mtr::Mtr;
use oxisearch::page::SearchMode;

#[test]
fn test_fuzz_search_insert_delete() {
    let mut rng = StdRng::seed_from_u64(0x5EA7C4);

    let h = harness(64);
    let index = u32_index(&h, 1);
    let block_id = h
        .pool
        .create_page(PageId(1), index.id(), true)
        .expect("pool full");
    let block = h.pool.block(block_id);
    let page = block.page();

    let mut live: BTreeSet<u32> = BTreeSet::new();
    // Keys are spread out so point lookups are decisive.
    for k in (0..400u32).map(|i| i * 7) {
        page.insert_tuple(&index, &key1(k)).unwrap();
        live.insert(k);
    }

    for round in 0..1500u32 {
        match rng.gen_range(0..10) {
            // Point lookup of a live key; mostly the same key to let the
            // heuristic warm up and build.
            0..=6 => {
                let k = if rng.gen_bool(0.8) {
                    7 * 123
                } else {
                    *live.iter().nth(rng.gen_range(0..live.len())).unwrap()
                };
                if !live.contains(&k) {
                    continue;
                }
                let (cursor, _) = position(&h, &index, block_id, &key1(k), SearchMode::Ge);
                let rec = cursor.rec().expect("positioned");
                assert!(!page.is_sentinel(rec), "round {round}: landed on sentinel");
            }
            // Insert a fresh key next to an LE-positioned cursor.
            7..=8 => {
                let k = rng.gen_range(0..3000u32);
                if live.contains(&k) {
                    continue;
                }
                let tuple = key1(k);
                let mut mtr = Mtr::new();
                mtr.x_latch(block);
                let mut cursor = Cursor::new(index.clone());
                search_leaf(&h.pool, block_id, &tuple, SearchMode::Le, &mut cursor);
                let prev = cursor.rec().expect("positioned");
                if page.insert_after(&index, prev, &tuple, 0).is_some() {
                    h.ahi.update_hash_on_insert(&cursor);
                    live.insert(k);
                }
                mtr.commit();
            }
            // Delete a random live key.
            _ => {
                if live.len() <= 1 {
                    continue;
                }
                let k = *live.iter().nth(rng.gen_range(0..live.len())).unwrap();
                let tuple = key1(k);
                let mut mtr = Mtr::new();
                mtr.x_latch(block);
                let mut cursor = Cursor::new(index.clone());
                search_leaf(&h.pool, block_id, &tuple, SearchMode::Ge, &mut cursor);
                let rec = cursor.rec().expect("positioned");
                if !page.is_sentinel(rec) {
                    h.ahi.update_hash_on_delete(&cursor);
                    assert!(page.delete_rec(rec));
                    live.remove(&k);
                }
                mtr.commit();
            }
        }

        if round % 250 == 0 {
            assert!(h.ahi.validate(|| false), "round {round}: validation failed");
            assert_eq!(page.n_recs() as usize, live.len());
        }
    }

    assert!(h.ahi.validate(|| false));
    // Hash node accounting stayed consistent with the block counter.
    assert_eq!(
        block.ahi.n_pointers() as usize,
        h.ahi.n_hash_nodes(),
        "all nodes point into the single hashed page"
    );

    // Tear down and verify the index is structurally empty.
    {
        let _latch = block.latch.read();
        h.ahi.drop_page_hash_index(block_id, false);
    }
    assert_eq!(h.ahi.n_hash_nodes(), 0);
    assert_eq!(block.ahi.n_pointers(), 0);
}
