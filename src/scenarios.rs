//! End-to-end scenarios exercising `EditTree`/`QueryTree`/`commit` together
//! against the in-memory test double, the way the teacher crate's
//! `test_btree_many_inserts`-style integration tests drive its own engine.

use std::sync::Arc;

use crate::edit_tree::EditTree;
use crate::mempool::Mempool;
use crate::mutation::commit;
use crate::node::Node;
use crate::query_tree::QueryTree;
use crate::store::memory::InMemoryBlockStore;
use crate::store::BlockStore;

#[test]
fn s1_insert_two_pairs_leaf_has_ordered_pairs() {
    let pool = Mempool::new();
    let st = InMemoryBlockStore::new(1024, 0);
    let store: Arc<dyn BlockStore> = Arc::new(st);

    let mut tree = EditTree::open(store.clone(), None, &pool).unwrap();
    tree.insert(b"1", b"1").unwrap();
    tree.insert(b"2", b"2").unwrap();
    let mutation = tree.write().unwrap();
    assert!(mutation.success);

    let bytes = store.get(mutation.new_root.unwrap()).unwrap();
    let parsed = crate::codec::parse_node(&bytes, &pool).unwrap();
    let leaf = parsed.as_leaf().unwrap();
    assert_eq!(leaf.pairs.len(), 2);
    assert_eq!(leaf.pairs[0].0, b"1");
    assert_eq!(leaf.pairs[1].0, b"2");
}

#[test]
fn s2_sequential_inserts_split_into_two_leaves() {
    let pool = Mempool::new();
    let store = InMemoryBlockStore::new(1024, 0);
    let store: Arc<dyn BlockStore> = Arc::new(store);

    let mut tree = EditTree::open(store.clone(), None, &pool).unwrap();
    for i in 0u32..140 {
        let k = i.to_le_bytes();
        let v = i.to_le_bytes();
        tree.insert(&k, &v).unwrap();
    }
    let mutation = tree.write().unwrap();
    assert!(mutation.success);

    let root_id = mutation.new_root.unwrap();
    let bytes = store.get(root_id).unwrap();
    let root = crate::codec::parse_node(&bytes, &pool).unwrap();
    let internal = root.as_internal().expect("root should have split into an internal node");
    assert_eq!(internal.branches.len(), 2);
    let total: u64 = internal.branches.iter().map(|b| b.item_count as u64).sum();
    assert_eq!(total, 140);
}

#[test]
fn s3_many_values_for_one_key_build_an_overflow_chain() {
    let pool = Mempool::new();
    let concrete = Arc::new(InMemoryBlockStore::new(1024, 0));
    let store: Arc<dyn BlockStore> = concrete.clone();

    let mut tree = EditTree::open(store.clone(), None, &pool).unwrap();
    for i in 0u32..300 {
        let v = i.to_le_bytes();
        tree.insert(b"0", &v).unwrap();
    }
    let mutation = tree.write().unwrap();
    assert!(mutation.success);

    // One leaf plus a two-node overflow chain for key 0: three pages total.
    assert_eq!(concrete.page_count(), 3);

    let query = QueryTree::open(store, mutation.new_root, &pool);
    let values = query.get(b"0").unwrap();
    assert_eq!(values.len(), 300);
}

#[test]
fn s4_removing_a_leaf_merges_branches_under_a_new_root() {
    let pool = Mempool::new();
    let st = InMemoryBlockStore::new(1024, 0);
    let store: Arc<dyn BlockStore> = Arc::new(st);

    let mut seed = EditTree::open(store.clone(), None, &pool).unwrap();
    seed.insert(b"1", b"1").unwrap();
    let m0 = seed.write().unwrap();

    let mut grow = EditTree::open(store.clone(), m0.new_root, &pool).unwrap();
    grow.insert(b"2", b"2").unwrap();
    let m1 = grow.write().unwrap();

    let mut remover = EditTree::open(store.clone(), m1.new_root, &pool).unwrap();
    remover.remove(b"1", true).unwrap();
    let mut m2 = remover.write().unwrap();
    assert!(m2.success);

    assert!(commit(store.as_ref(), &mut m2, true));

    let root_id = m2.new_root.unwrap();
    let bytes = store.get(root_id).unwrap();
    let root = crate::codec::parse_node(&bytes, &pool).unwrap();
    match root {
        Node::Leaf(leaf) => assert_eq!(leaf.pairs.len(), 1),
        Node::Internal(internal) => assert_eq!(internal.branches.len(), 1),
        Node::Overflow(_) => panic!("root should not be an overflow page"),
    }
}

#[test]
fn s5_queued_edits_are_visible_before_being_pushed_down() {
    let pool = Mempool::new();
    let st = InMemoryBlockStore::new(1024, 256);
    let store: Arc<dyn BlockStore> = Arc::new(st);

    let mut tree = EditTree::open(store.clone(), None, &pool).unwrap();
    for k in [1u32, 5, 10] {
        tree.insert(&k.to_le_bytes(), &k.to_le_bytes()).unwrap();
    }
    let mutation = tree.write().unwrap();

    let key3 = pool.alloc(&3u32.to_le_bytes());
    let value3 = pool.alloc(&3u32.to_le_bytes());
    let key5 = pool.alloc(&5u32.to_le_bytes());

    let mut query = QueryTree::open(store, mutation.new_root, &pool);
    query.queue_insert(key3, value3);
    query.queue_remove(key5);

    // Queued edits give the logical order 1, 3, 10 (5 removed, 3 inserted).
    let found = query.find(&3u32.to_le_bytes()).unwrap();
    assert_eq!(found.value(), Some(3u32.to_le_bytes().to_vec()));

    let seeked = query.seek(2).unwrap();
    assert_eq!(seeked.value(), Some(10u32.to_le_bytes().to_vec()));
}

#[test]
fn s6_deeply_nested_split_produces_two_levels_of_internal_nodes() {
    let pool = Mempool::new();
    let store = InMemoryBlockStore::new(60, 0);
    let store: Arc<dyn BlockStore> = Arc::new(store);

    let mut tree = EditTree::open(store.clone(), None, &pool).unwrap();
    tree.insert(b"a", b"1").unwrap();
    tree.insert(b"b", b"2").unwrap();
    for i in 0u8..5 {
        tree.insert(b"b", &[i]).unwrap();
    }
    tree.insert(b"c", b"3").unwrap();
    let mutation = tree.write().unwrap();
    assert!(mutation.success);

    let root_id = mutation.new_root.unwrap();
    let bytes = store.get(root_id).unwrap();
    let root = crate::codec::parse_node(&bytes, &pool).unwrap();
    let root_internal = root.as_internal().expect("root should be internal after the leaf grows past bs=60");

    let mut saw_internal_child = false;
    for branch in &root_internal.branches {
        let child_bytes = store.get(branch.id).unwrap();
        let child = crate::codec::parse_node(&child_bytes, &pool).unwrap();
        if child.as_internal().is_some() {
            saw_internal_child = true;
        }
    }
    assert!(saw_internal_child, "expected at least one internal child, giving two levels of internal nodes above the leaves");
}

/// Bulk random inserts, mirroring the teacher crate's `test_btree_many_inserts`:
/// every inserted key is retrievable afterward and a full scan comes back sorted.
#[test]
fn bulk_random_inserts_stay_ordered_and_retrievable() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let pool = Mempool::new();
    let store = InMemoryBlockStore::new(1024, 0);
    let store: Arc<dyn BlockStore> = Arc::new(store);

    let mut rng = StdRng::seed_from_u64(0xB12CE);
    let mut keys: Vec<u32> = (0..500).map(|_| rng.gen()).collect();
    keys.sort_unstable();
    keys.dedup();

    let mut tree = EditTree::open(store.clone(), None, &pool).unwrap();
    for &k in &keys {
        tree.insert(&k.to_le_bytes(), &k.to_le_bytes()).unwrap();
    }
    let mutation = tree.write().unwrap();
    assert!(mutation.success);

    let query = QueryTree::open(store, mutation.new_root, &pool);
    for &k in &keys {
        assert_eq!(query.get(&k.to_le_bytes()).unwrap(), vec![k.to_le_bytes().to_vec()]);
    }

    let mut cursor = query.begin().unwrap();
    let mut seen = Vec::new();
    while let Some(item) = cursor.current() {
        seen.push(u32::from_le_bytes(item.key.try_into().unwrap()));
        if !cursor.next().unwrap() {
            break;
        }
    }
    assert_eq!(seen, keys);
}
