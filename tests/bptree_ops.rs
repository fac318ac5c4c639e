//! B+-tree protocol: split cascades, erase to empty, descent equivalence.

use packdb::{Array, BpTree, SlabAlloc};

#[test]
fn split_cascade_grows_depth_on_schedule() {
    let mut alloc = SlabAlloc::new();
    let mut tree = BpTree::create(&mut alloc, 4).unwrap();

    for i in 1..=4 {
        tree.push(i).unwrap();
        assert_eq!(tree.depth(), 0, "still a root leaf at {} elements", i);
    }

    tree.push(5).unwrap();
    assert_eq!(tree.depth(), 1, "first split introduces an inner root");
    assert_eq!(tree.elem_count(), 5);
    tree.verify().unwrap();

    for i in 6..=16 {
        tree.push(i).unwrap();
    }
    assert_eq!(tree.depth(), 1);

    tree.push(17).unwrap();
    assert_eq!(tree.depth(), 2, "root split doubles the height");
    assert_eq!(tree.elem_count(), 17);
    tree.verify().unwrap();

    for i in 1..=17i64 {
        assert_eq!(tree.get(i as usize - 1).unwrap(), i);
    }
}

#[test]
fn erase_hundred_front_elements_to_empty() {
    let mut alloc = SlabAlloc::new();
    let mut tree = BpTree::create(&mut alloc, 4).unwrap();
    for i in 0..100 {
        tree.push(i).unwrap();
    }

    for _ in 0..100 {
        tree.erase(0).unwrap();
        tree.verify().unwrap();
    }

    assert_eq!(tree.elem_count(), 0);
    let root_ref = tree.root();
    let root = Array::from_ref(&alloc, root_ref);
    assert!(!root.is_inner_bptree_node(), "root collapsed back to a leaf");
    assert!(root.is_empty());
}

#[test]
fn descent_equals_flattened_sequence_after_mixed_ops() {
    let mut alloc = SlabAlloc::new();
    let mut tree = BpTree::create(&mut alloc, 4).unwrap();
    let mut reference: Vec<i64> = Vec::new();

    let mut seed = 0xDEAD_BEEFu64;
    let mut next = move || {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (seed >> 33) as usize
    };

    for step in 0..400i64 {
        let choice = next() % 10;
        if choice < 6 || reference.is_empty() {
            let pos = next() % (reference.len() + 1);
            tree.insert(pos, step).unwrap();
            reference.insert(pos, step);
        } else if choice < 8 {
            let pos = next() % reference.len();
            tree.erase(pos).unwrap();
            reference.remove(pos);
        } else {
            let pos = next() % reference.len();
            tree.set(pos, -step).unwrap();
            reference[pos] = -step;
        }

        tree.verify().unwrap();
        assert_eq!(tree.elem_count(), reference.len(), "after step {}", step);
    }

    for (k, v) in reference.iter().enumerate() {
        assert_eq!(tree.get(k).unwrap(), *v, "element {}", k);
    }
}

#[test]
fn leaf_visitor_reconstructs_the_sequence() {
    let mut alloc = SlabAlloc::new();
    let mut tree = BpTree::create(&mut alloc, 4).unwrap();
    let expected: Vec<i64> = (0..123).map(|i| i * 3 - 50).collect();
    for &v in &expected {
        tree.push(v).unwrap();
    }

    let mut collected = Vec::new();
    let mut visitor = |alloc: &SlabAlloc, info: &packdb::LeafInfo| -> eyre::Result<bool> {
        let leaf = Array::from_ref(alloc, info.leaf_ref);
        for i in 0..leaf.len() {
            collected.push(leaf.get(alloc, i));
        }
        Ok(true)
    };
    tree.visit_leaves(0, &mut visitor).unwrap();

    assert_eq!(collected, expected);
}

#[test]
fn tree_survives_commit_and_reattach() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.pdb");

    let root_ref = {
        let mut alloc = SlabAlloc::attach_file(&path, true).unwrap();
        let mut tree = BpTree::create(&mut alloc, 4).unwrap();
        for i in 0..64 {
            tree.push(i * 2).unwrap();
        }
        let root = tree.root();
        alloc.commit(root).unwrap();
        alloc.top_ref()
    };

    let mut alloc = SlabAlloc::attach_file(&path, false).unwrap();
    assert_eq!(alloc.top_ref(), root_ref);

    let tree = BpTree::from_root(&mut alloc, root_ref, 4);
    tree.verify().unwrap();
    assert_eq!(tree.elem_count(), 64);
    for k in 0..64usize {
        assert_eq!(tree.get(k).unwrap(), k as i64 * 2);
    }
}

#[test]
fn committed_tree_mutates_via_copy_on_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.pdb");

    let mut alloc = SlabAlloc::attach_file(&path, true).unwrap();
    {
        let mut tree = BpTree::create(&mut alloc, 4).unwrap();
        for i in 0..30 {
            tree.push(i).unwrap();
        }
        let root = tree.root();
        alloc.commit(root).unwrap();
    }

    let old_root = alloc.top_ref();
    let new_root = {
        let mut tree = BpTree::from_root(&mut alloc, old_root, 4);
        tree.insert(10, 999).unwrap();
        tree.verify().unwrap();
        assert_eq!(tree.get(10).unwrap(), 999);
        assert_eq!(tree.elem_count(), 31);
        tree.root()
    };

    // The mutated tree lives in slabs; the committed image is untouched.
    assert_ne!(new_root, old_root);
    let committed = BpTree::from_root(&mut alloc, old_root, 4);
    assert_eq!(committed.elem_count(), 30);
    assert_eq!(committed.get(10).unwrap(), 10);
}
