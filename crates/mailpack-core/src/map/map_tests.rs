//! End-to-end tests for the shared-message map.

use std::sync::Arc;

use tempfile::TempDir;

use crate::clock::testing::ManualClock;
use crate::error::Error;
use crate::{Settings, Storage};

// -------------------------------------------------------------------------
// Helper functions
// -------------------------------------------------------------------------

const T0: i64 = 1_600_000_000;
const DAY: i64 = 24 * 3600;

fn test_settings() -> Settings {
    Settings {
        rotate_size: 1_000_000,
        rotate_days: 7,
    }
}

fn create_test_storage() -> (Storage, Arc<ManualClock>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let clock = Arc::new(ManualClock::new(T0));
    let storage = Storage::open_with_clock(temp_dir.path(), test_settings(), clock.clone())
        .expect("Failed to open storage");
    (storage, clock, temp_dir)
}

/// Appends `sizes.len()` messages in one batch and returns the UID range.
fn append_mails(storage: &Storage, sizes: &[usize]) -> (u32, u32) {
    let map = storage.map();
    let mut batch = map.append_begin();
    for &size in sizes {
        let file = batch.append_next(size as u64).expect("append_next");
        file.write_all(&vec![b'x'; size]).expect("write mail body");
        batch.finish_multi_mail().expect("finish_multi_mail");
    }
    let uids = batch.assign_map_uids().expect("assign_map_uids");
    batch.commit().expect("commit");
    map.refresh().expect("refresh after commit");
    uids
}

fn highest_file_id(storage: &Storage) -> u32 {
    let map = storage.map();
    map.refresh().unwrap();
    let view = map.view.read();
    let data = view.header_ext(map.map_ext);
    assert_eq!(data.len(), 4, "map header must be assigned");
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

// -------------------------------------------------------------------------
// Scenario: first appends
// -------------------------------------------------------------------------

#[test]
fn test_first_append_creates_file_one() {
    // Arrange
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();

    // Act
    let (first, last) = append_mails(&storage, &[500]);

    // Assert
    assert_eq!((first, last), (1, 1));
    assert_eq!(highest_file_id(&storage), 1);
    assert_ne!(map.uid_validity(), 0);

    let (file_id, offset) = map.lookup(1).unwrap().expect("entry exists");
    assert_eq!(file_id, 1);
    assert_eq!(offset, crate::dfile::FILE_HEADER_SIZE);

    let msgs = map.get_file_msgs(1).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].map_uid, 1);
    assert_eq!(msgs[0].refcount, 1);
}

#[test]
fn test_second_append_in_batch_reuses_file() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();

    let (first, last) = append_mails(&storage, &[500, 500]);

    assert_eq!((first, last), (1, 2));
    assert_eq!(highest_file_id(&storage), 1);

    let rec1 = map.lookup_rec(1).unwrap();
    let rec2 = map.lookup_rec(2).unwrap();
    assert_eq!(rec1.rec.file_id, 1);
    assert_eq!(rec2.rec.file_id, 1);
    assert_eq!(u64::from(rec2.rec.offset), u64::from(rec1.rec.offset) + 500);
    assert_eq!(rec2.rec.size, 500);
}

#[test]
fn test_new_batch_reuses_file_via_backward_scan() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500, 500]);

    let (first, last) = append_mails(&storage, &[100]);

    assert_eq!((first, last), (3, 3));
    assert_eq!(highest_file_id(&storage), 1);
    let rec = map.lookup_rec(3).unwrap();
    assert_eq!(rec.rec.file_id, 1);
    assert_eq!(
        u64::from(rec.rec.offset),
        crate::dfile::FILE_HEADER_SIZE + 1000
    );
}

// -------------------------------------------------------------------------
// Scenario: rotation
// -------------------------------------------------------------------------

#[test]
fn test_rotate_by_size() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();

    // fill file 1 close to the rotate ceiling
    append_mails(&storage, &[999_500]);
    // the file tail sits at 999_516; another 501 bytes would cross 1_000_000
    append_mails(&storage, &[501]);

    assert_eq!(highest_file_id(&storage), 2);
    let (file_id, _) = map.lookup(2).unwrap().expect("entry exists");
    assert_eq!(file_id, 2);
}

#[test]
fn test_oversized_mail_always_rotates() {
    let (storage, _clock, _temp) = create_test_storage();
    append_mails(&storage, &[100]);

    // mail_size >= rotate_size never reuses an existing file
    append_mails(&storage, &[1_000_000]);

    assert_eq!(highest_file_id(&storage), 2);
}

#[test]
fn test_rotate_by_age() {
    let (storage, clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500]);

    // eight days later the file is past rotate_days = 7
    clock.set(T0 + 8 * DAY);
    append_mails(&storage, &[500]);

    assert_eq!(highest_file_id(&storage), 2);
    let (file_id, _) = map.lookup(2).unwrap().expect("entry exists");
    assert_eq!(file_id, 2);
}

#[test]
fn test_fresh_file_within_age_window_is_reused() {
    let (storage, clock, _temp) = create_test_storage();
    append_mails(&storage, &[500]);

    clock.set(T0 + 2 * DAY);
    append_mails(&storage, &[500]);

    assert_eq!(highest_file_id(&storage), 1);
}

// -------------------------------------------------------------------------
// Scenario: copy via refcounts
// -------------------------------------------------------------------------

#[test]
fn test_copy_increments_refcount() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500, 500]);

    let mut trans = map.transaction_begin(false);
    trans.update_refcounts(&[1], 1).unwrap();
    trans.commit().unwrap();
    map.refresh().unwrap();

    assert_eq!(map.lookup_rec(1).unwrap().refcount, 2);
    assert_eq!(map.lookup_rec(2).unwrap().refcount, 1);
}

#[test]
fn test_zero_ref_files_requires_all_entries_zero() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500, 500]);

    let mut trans = map.transaction_begin(false);
    trans.update_refcounts(&[1], 1).unwrap();
    trans.update_refcounts(&[1], -2).unwrap();
    trans.commit().unwrap();
    map.refresh().unwrap();
    assert_eq!(map.lookup_rec(1).unwrap().refcount, 0);

    // entry 2 still holds a reference
    assert!(!map.get_zero_ref_files().contains(1));

    let mut trans = map.transaction_begin(false);
    trans.update_refcounts(&[2], -1).unwrap();
    trans.commit().unwrap();

    assert!(map.get_zero_ref_files().contains(1));
}

#[test]
fn test_refcount_ceiling_rejected_and_rolled_back() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500]);

    // raise the entry to 32767 references
    let mut trans = map.transaction_begin(false);
    trans.update_refcounts(&[1], 32766).unwrap();
    trans.commit().unwrap();
    map.refresh().unwrap();
    assert_eq!(map.lookup_rec(1).unwrap().refcount, 32767);

    // one more would reach the ceiling; the whole transaction rolls back
    let mut trans = map.transaction_begin(false);
    let err = trans.update_refcounts(&[1], 1).unwrap_err();
    assert!(matches!(err, Error::RefcountLimit));
    drop(trans);

    map.refresh().unwrap();
    assert_eq!(map.lookup_rec(1).unwrap().refcount, 32767);
}

#[test]
fn test_failed_update_discards_earlier_updates_in_transaction() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500, 500]);

    let mut trans = map.transaction_begin(false);
    trans.update_refcounts(&[1], 1).unwrap();
    // unknown UID: the held view cannot be refreshed, so this is corruption
    let err = trans.update_refcounts(&[999], 1).unwrap_err();
    assert!(matches!(err, Error::MapCorrupted { .. }));
    drop(trans);

    map.refresh().unwrap();
    assert_eq!(map.lookup_rec(1).unwrap().refcount, 1);
}

#[test]
fn test_noop_transaction_commit() {
    let (storage, _clock, _temp) = create_test_storage();
    let trans = storage.map().transaction_begin(false);
    trans.commit().unwrap();
}

// -------------------------------------------------------------------------
// Scenario: move
// -------------------------------------------------------------------------

#[test]
fn test_append_move_rewrites_locations() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();

    // three messages fill file 1 far enough that the move batch below must
    // rotate to a fresh file
    append_mails(&storage, &[300_000, 300_000, 300_000]);

    let mut batch = map.append_begin();
    for _ in 0..3 {
        let file = batch.append_next(300_000).unwrap();
        file.write_all(&vec![b'y'; 300_000]).unwrap();
        batch.finish_multi_mail().unwrap();
    }
    batch
        .append_move(&[1, 2, 3], &roaring::RoaringBitmap::new())
        .unwrap();
    batch.commit().unwrap();
    map.refresh().unwrap();

    assert_eq!(highest_file_id(&storage), 2);
    for (uid, expected_offset) in [(1u32, 16u64), (2, 300_016), (3, 600_016)] {
        let (file_id, offset) = map.lookup(uid).unwrap().expect("moved entry");
        assert_eq!(file_id, 2);
        assert_eq!(offset, expected_offset);
    }
    // nothing references file 1 anymore
    assert!(map.get_file_msgs(1).unwrap().is_empty());
}

#[test]
fn test_append_move_expunges_listed_uids() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[400_000, 400_000, 100_000]);

    let mut batch = map.append_begin();
    for _ in 0..2 {
        let file = batch.append_next(400_000).unwrap();
        file.write_all(&vec![b'y'; 400_000]).unwrap();
        batch.finish_multi_mail().unwrap();
    }
    let mut expunge = roaring::RoaringBitmap::new();
    expunge.insert(3);
    batch.append_move(&[1, 2], &expunge).unwrap();
    batch.commit().unwrap();
    map.refresh().unwrap();

    assert!(map.lookup(3).unwrap().is_none());
    assert_eq!(map.lookup(1).unwrap().unwrap().0, 2);
}

#[test]
fn test_remove_file_id_expunges_every_entry() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500, 500, 500]);

    map.remove_file_id(1).unwrap();
    map.refresh().unwrap();

    assert!(map.lookup(1).unwrap().is_none());
    assert!(map.lookup(2).unwrap().is_none());
    assert!(map.lookup(3).unwrap().is_none());
    assert!(map.get_file_msgs(1).unwrap().is_empty());
}

// -------------------------------------------------------------------------
// Rollback durability
// -------------------------------------------------------------------------

#[test]
fn test_dropped_batch_truncates_reused_file() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500]);

    let path = storage.dir().join("m.1");
    let committed_len = std::fs::metadata(&path).unwrap().len();

    {
        let mut batch = map.append_begin();
        let file = batch.append_next(300).unwrap();
        file.write_all(&vec![b'z'; 300]).unwrap();
        batch.finish_multi_mail().unwrap();
        // dropped without assign/commit
    }

    assert_eq!(std::fs::metadata(&path).unwrap().len(), committed_len);
    assert_eq!(map.get_file_msgs(1).unwrap().len(), 1);
}

#[test]
fn test_dropped_batch_unlinks_fresh_file() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();

    {
        let mut batch = map.append_begin();
        let file = batch.append_next(300).unwrap();
        file.write_all(&vec![b'z'; 300]).unwrap();
        batch.finish_multi_mail().unwrap();
    }

    let leftovers: Vec<_> = std::fs::read_dir(storage.dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("m.") || name.starts_with("tmp."))
        .collect();
    assert!(leftovers.is_empty(), "leftover data files: {leftovers:?}");
}

// -------------------------------------------------------------------------
// Concurrent batches
// -------------------------------------------------------------------------

#[test]
fn test_concurrent_batches_use_distinct_files() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500]);

    let mut batch1 = map.append_begin();
    let file1 = batch1.append_next(100).unwrap();
    file1.write_all(&vec![b'a'; 100]).unwrap();
    batch1.finish_multi_mail().unwrap();

    // batch1 holds the lock on file 1, so batch2 must rotate
    let mut batch2 = map.append_begin();
    let file2 = batch2.append_next(100).unwrap();
    assert_eq!(file2.file_id(), 0, "fresh file expected under contention");
    file2.write_all(&vec![b'b'; 100]).unwrap();
    batch2.finish_multi_mail().unwrap();

    let (first1, _) = batch1.assign_map_uids().unwrap();
    batch1.commit().unwrap();
    let (first2, _) = batch2.assign_map_uids().unwrap();
    batch2.commit().unwrap();

    let (id1, _) = map.lookup(first1).unwrap().unwrap();
    let (id2, _) = map.lookup(first2).unwrap().unwrap();
    assert_eq!(id1, 1);
    assert_eq!(id2, 2);
    assert_eq!(highest_file_id(&storage), 2);
}

// -------------------------------------------------------------------------
// Crash atomicity
// -------------------------------------------------------------------------

#[test]
fn test_orphan_index_bytes_invisible_until_rebuild_flagged() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500]);

    // simulate a writer that crashed between appending index records and
    // advancing the committed tail
    {
        let mut file = map.index.writer_handle().unwrap();
        let header = crate::index::read_header(&mut file).unwrap();
        let rec = super::MapRecord {
            file_id: 1,
            offset: 999,
            size: 999,
        };
        let orphan = crate::index::LogRecord::Append {
            uid: 2,
            exts: vec![(0, rec.encode().to_vec())],
        };
        crate::index::append_records(&mut file, header.tail, &[orphan], false).unwrap();
    }

    // readers see none of the crashed batch
    assert!(map.lookup(2).unwrap().is_none());
    assert_eq!(map.get_file_msgs(1).unwrap().len(), 1);

    // the next commit detects the inconsistency and schedules a rebuild
    let mut trans = map.transaction_begin(false);
    trans.update_refcounts(&[1], 1).unwrap();
    trans.commit().unwrap();
    assert!(storage.needs_rebuild());

    map.refresh().unwrap();
    assert_eq!(map.lookup_rec(1).unwrap().refcount, 2);
}

// -------------------------------------------------------------------------
// Corruption surfacing
// -------------------------------------------------------------------------

#[test]
fn test_zeroed_file_id_surfaces_corruption() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500]);

    // zero the record's file_id out-of-band
    {
        let mut sync = map.index.sync_begin().unwrap();
        sync.trans().update_ext(1, map.map_ext, &[0u8; 12]);
        sync.commit().unwrap();
    }
    map.refresh().unwrap();

    let err = map.lookup(1).unwrap_err();
    assert!(matches!(err, Error::MapCorrupted { .. }));
    // every occurrence surfaces again
    let err = map.lookup(1).unwrap_err();
    assert!(matches!(err, Error::MapCorrupted { .. }));
}

#[test]
fn test_truncated_record_surfaces_corruption() {
    let (storage, _clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500]);

    {
        let mut sync = map.index.sync_begin().unwrap();
        sync.trans().update_ext(1, map.map_ext, &[]);
        sync.commit().unwrap();
    }
    map.refresh().unwrap();

    assert!(map.lookup(1).is_err());
    assert!(map.get_file_msgs(1).is_err());
}

// -------------------------------------------------------------------------
// Lookups and uid_validity
// -------------------------------------------------------------------------

#[test]
fn test_lookup_missing_is_none_not_error() {
    let (storage, _clock, _temp) = create_test_storage();
    assert!(storage.map().lookup(42).unwrap().is_none());
}

#[test]
fn test_uid_validity_fallback_is_nonzero() {
    let (storage, _clock, _temp) = create_test_storage();
    assert_ne!(storage.map().uid_validity(), 0);
}

#[test]
fn test_uid_validity_stable_after_first_commit() {
    let (storage, clock, _temp) = create_test_storage();
    let map = storage.map();
    append_mails(&storage, &[500]);

    let validity = map.uid_validity();
    assert_ne!(validity, 0);

    clock.set(T0 + DAY);
    append_mails(&storage, &[500]);
    assert_eq!(map.uid_validity(), validity);
}

#[test]
fn test_zero_ref_scan_on_missing_index_is_empty() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::open(temp.path(), test_settings()).unwrap();
    assert!(storage.map().get_zero_ref_files().is_empty());
}
