//! Crash consistency: the dual top-ref header publishes a root atomically.

use packdb::{Array, FileHeader, InvalidDatabase, NodeKind, SlabAlloc};
use zerocopy::IntoBytes;

fn build_values(alloc: &mut SlabAlloc, values: &[i64]) -> packdb::Ref {
    let mut arr = Array::create(alloc, NodeKind::Normal, false).unwrap();
    for &v in values {
        arr.add(alloc, v).unwrap();
    }
    arr.node_ref()
}

fn read_values(alloc: &SlabAlloc, ref_: packdb::Ref) -> Vec<i64> {
    let arr = Array::from_ref(alloc, ref_);
    (0..arr.len()).map(|i| arr.get(alloc, i)).collect()
}

#[test]
fn commit_publishes_and_reattach_reproduces() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.pdb");

    let committed = {
        let mut alloc = SlabAlloc::attach_file(&path, true).unwrap();
        let root = build_values(&mut alloc, &[10, 20, 30]);
        alloc.commit(root).unwrap();
        alloc.top_ref()
    };

    let alloc = SlabAlloc::attach_file(&path, false).unwrap();
    assert_eq!(alloc.top_ref(), committed);
    assert_eq!(read_values(&alloc, committed), vec![10, 20, 30]);
}

#[test]
fn crash_before_selector_flip_keeps_the_old_root() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.pdb");

    // Transaction 1, fully committed.
    let old_root = {
        let mut alloc = SlabAlloc::attach_file(&path, true).unwrap();
        let root = build_values(&mut alloc, &[1, 2, 3]);
        alloc.commit(root).unwrap();
        alloc.top_ref()
    };

    // Transaction 2 dies after staging the new root but before the flip.
    {
        let mut alloc = SlabAlloc::attach_file(&path, false).unwrap();
        let new_root = build_values(&mut alloc, &[7, 8, 9, 10]);
        alloc.persist_slabs().unwrap();
        alloc.stage_top_ref(new_root).unwrap();
        // Crash: drop without publish_top_ref.
    }

    let alloc = SlabAlloc::attach_file(&path, false).unwrap();
    assert_eq!(alloc.top_ref(), old_root, "unflipped selector keeps the old root");
    assert_eq!(read_values(&alloc, old_root), vec![1, 2, 3]);
}

#[test]
fn completing_the_flip_publishes_the_staged_root() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.pdb");

    let old_root = {
        let mut alloc = SlabAlloc::attach_file(&path, true).unwrap();
        let root = build_values(&mut alloc, &[1, 2, 3]);
        alloc.commit(root).unwrap();
        alloc.top_ref()
    };

    let staged_root = {
        let mut alloc = SlabAlloc::attach_file(&path, false).unwrap();
        let new_root = build_values(&mut alloc, &[7, 8, 9, 10]);
        alloc.persist_slabs().unwrap();
        alloc.stage_top_ref(new_root).unwrap();
        new_root
        // Crash before the flip.
    };

    // Reattach and flip: exactly the one-byte publish step.
    {
        let mut alloc = SlabAlloc::attach_file(&path, false).unwrap();
        assert_eq!(alloc.top_ref(), old_root);
        alloc.publish_top_ref().unwrap();
    }

    let alloc = SlabAlloc::attach_file(&path, false).unwrap();
    assert_eq!(alloc.top_ref(), staged_root);
    assert_eq!(read_values(&alloc, staged_root), vec![7, 8, 9, 10]);
}

#[test]
fn attach_rejects_truncated_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.pdb");
    std::fs::write(&path, &[0u8; 16]).unwrap();

    let err = SlabAlloc::attach_file(&path, false).unwrap_err();
    assert!(err.downcast_ref::<InvalidDatabase>().is_some());
}

#[test]
fn attach_rejects_wrong_magic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("magic.pdb");
    let mut bytes = FileHeader::new().as_bytes().to_vec();
    bytes[16..20].copy_from_slice(b"NOPE");
    bytes.resize(4096, 0);
    std::fs::write(&path, &bytes).unwrap();

    let err = SlabAlloc::attach_file(&path, false).unwrap_err();
    assert!(err.downcast_ref::<InvalidDatabase>().is_some());
}

#[test]
fn attach_rejects_out_of_range_top_ref() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("range.pdb");
    let mut header = FileHeader::new();
    header.set_slot(0, 1 << 20, 0);
    let mut bytes = header.as_bytes().to_vec();
    bytes.resize(4096, 0);
    std::fs::write(&path, &bytes).unwrap();

    let err = SlabAlloc::attach_file(&path, false).unwrap_err();
    assert!(err.downcast_ref::<InvalidDatabase>().is_some());
}

#[test]
fn buffer_attach_round_trips_a_commit_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.pdb");

    let committed = {
        let mut alloc = SlabAlloc::attach_file(&path, true).unwrap();
        let root = build_values(&mut alloc, &[-5, 0, 5, 1 << 33]);
        alloc.commit(root).unwrap();
        alloc.top_ref()
    };

    // The on-disk image attaches as a plain buffer too.
    let bytes = std::fs::read(&path).unwrap();
    let alloc = SlabAlloc::attach_buffer(bytes).unwrap();

    assert_eq!(alloc.top_ref(), committed);
    assert_eq!(read_values(&alloc, committed), vec![-5, 0, 5, 1 << 33]);
}

#[test]
fn successive_commits_alternate_top_ref_slots() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alt.pdb");
    let mut alloc = SlabAlloc::attach_file(&path, true).unwrap();

    let mut roots = Vec::new();
    for i in 0..4i64 {
        let root = build_values(&mut alloc, &[i, i + 1]);
        alloc.commit(root).unwrap();
        roots.push(alloc.top_ref());

        assert_eq!(read_values(&alloc, alloc.top_ref()), vec![i, i + 1]);
    }

    // Every commit published a distinct, monotonically placed root.
    for pair in roots.windows(2) {
        assert!(pair[0] < pair[1]);
    }
}
