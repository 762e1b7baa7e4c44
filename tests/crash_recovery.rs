//! Integration test: reopening tables and recovering from interrupted work.
//!
//! Validates that:
//! - committed parts survive a reopen, and block numbering continues
//! - leftover `tmp_*` directories from interrupted writes are removed
//! - inputs of a merge that committed on disk come back as outdated parts
//! - a part with unreadable metadata fails the open instead of vanishing

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use mergetree::disk_space::{DiskSpaceMonitor, StaticFreeSpace};
use mergetree::merge_tree::reader::read_rows;
use mergetree::merge_tree::{PartName, PartWriter, Row, TableMergeController};
use mergetree::settings::MergeTreeSettings;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn settings() -> MergeTreeSettings {
    MergeTreeSettings {
        min_age_before_merge: Duration::ZERO,
        ..Default::default()
    }
}

fn disk() -> Arc<DiskSpaceMonitor> {
    DiskSpaceMonitor::new(StaticFreeSpace::new(1 << 40), 0)
}

fn open(dir: &TempDir) -> TableMergeController {
    TableMergeController::open("t", dir.path(), settings(), disk()).unwrap()
}

fn names(table: &TableMergeController) -> Vec<String> {
    table.parts().iter().map(|p| p.name().to_string()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn parts_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let table = open(&dir);
        for i in 0..3 {
            table.insert(vec![Row::new(i, 1)]).unwrap();
        }
        table.optimize().unwrap();
        table.insert(vec![Row::new(10, 1)]).unwrap();
    }

    let table = open(&dir);
    assert_eq!(names(&table), vec!["0_0_3_1", "0_3_4_0"]);

    // Numbering continues after the highest block on disk
    let created = table.insert(vec![Row::new(11, 1)]).unwrap();
    assert_eq!(created, vec![PartName::new(0, 4, 5, 0)]);
}

#[test]
fn merged_inputs_reload_as_outdated_and_get_cleared() {
    let dir = TempDir::new().unwrap();
    {
        let table = open(&dir);
        for i in 0..3 {
            table.insert(vec![Row::new(i, 1)]).unwrap();
        }
        table.optimize().unwrap();
        // Default lifetime keeps the inputs on disk past this drop
    }
    assert!(dir.path().join("0_0_1_0").exists());

    let table = open(&dir);
    assert_eq!(names(&table), vec!["0_0_3_1"]);
    assert_eq!(table.part_set().outdated_len(), 3);

    assert_eq!(table.part_set().clear_old_parts(Duration::ZERO).unwrap(), 3);
    assert!(!dir.path().join("0_0_1_0").exists());
    assert!(!dir.path().join("0_2_3_0").exists());
}

#[test]
fn leftover_temporary_directories_are_removed() {
    let dir = TempDir::new().unwrap();
    {
        let table = open(&dir);
        table.insert(vec![Row::new(1, 1)]).unwrap();
        table.insert(vec![Row::new(2, 1)]).unwrap();
    }
    let tmp_merge = dir.path().join("tmp_merge_0_0_2_1");
    let tmp_insert = dir.path().join("tmp_insert_0_2_3_0");
    fs::create_dir_all(&tmp_merge).unwrap();
    fs::write(tmp_merge.join("data.bin"), b"half written").unwrap();
    fs::create_dir_all(&tmp_insert).unwrap();

    let table = open(&dir);
    assert!(!tmp_merge.exists());
    assert!(!tmp_insert.exists());
    assert_eq!(names(&table), vec!["0_0_1_0", "0_1_2_0"]);
    assert!(table.optimize().unwrap().did_work());
}

#[test]
fn merge_committed_on_disk_wins_over_its_inputs() {
    let dir = TempDir::new().unwrap();
    let writer = PartWriter::new(8192);
    for i in 0..2u64 {
        writer
            .write_part(dir.path(), &PartName::new(0, i, i + 1, 0), vec![Row::new(i, 1)])
            .unwrap();
    }
    // Output renamed into place, crash before the inputs were dropped
    writer
        .write_part(
            dir.path(),
            &PartName::new(0, 0, 2, 1),
            vec![Row::new(0, 1), Row::new(1, 1)],
        )
        .unwrap();

    let table = open(&dir);
    assert_eq!(names(&table), vec!["0_0_2_1"]);
    let rows = read_rows(dir.path(), &table.parts()[0]).unwrap();
    assert_eq!(rows.len(), 2);
}

#[test]
fn unreadable_part_metadata_fails_open() {
    let dir = TempDir::new().unwrap();
    {
        let table = open(&dir);
        table.insert(vec![Row::new(1, 1)]).unwrap();
    }
    fs::write(dir.path().join("0_0_1_0").join("meta.json"), b"{ not json").unwrap();

    let err = TableMergeController::open("t", dir.path(), settings(), disk())
        .err()
        .unwrap();
    assert_eq!(err.code(), "CORRUPTED_PART");
}
