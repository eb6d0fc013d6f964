/*!
 * Profile Export Tests
 * Allocation profile files in text and JSON-lines form
 */

use memory_core::memory::numa::NumaTopology;
use memory_core::memory::tracker::TEXT_HEADER;
use memory_core::memory::ProfileFormat;
use memory_core::{ManagerConfig, MemoryError, MemoryManager, MemoryPolicy};
use pretty_assertions::assert_eq;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn manager() -> MemoryManager {
    let config =
        ManagerConfig::compact().with_numa_topology(Arc::new(NumaTopology::single_node()));
    MemoryManager::new(config).unwrap()
}

#[test]
fn test_text_profile_lists_live_allocations() {
    let mgr = manager();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("profile.txt");

    let meshes = MemoryPolicy::default().with_tag("meshes");
    let audio = MemoryPolicy::default().with_tag("audio\tbuffers");
    let a = mgr.allocate(512, &meshes).unwrap();
    let b = mgr.allocate(1500, &audio).unwrap();
    let c = mgr.allocate(64, &meshes).unwrap();
    mgr.deallocate(c, 64, &meshes).unwrap();

    let written = mgr.export_allocation_profile(&path).unwrap();
    assert_eq!(written, 2);

    let contents = fs::read_to_string(&path).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some(TEXT_HEADER));

    let rows: Vec<Vec<&str>> = lines.map(|line| line.split('\t').collect()).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.len() == 4));
    assert!(rows.iter().all(|row| row[2].parse::<u128>().is_ok()));

    let mut summary: Vec<(&str, &str)> = rows.iter().map(|row| (row[0], row[1])).collect();
    summary.sort();
    assert_eq!(summary, vec![("audio buffers", "1500"), ("meshes", "512")]);

    let addresses: Vec<String> = rows.iter().map(|row| row[3].to_string()).collect();
    assert!(addresses.contains(&format!("0x{:x}", a.as_ptr() as usize)));
    assert!(addresses.contains(&format!("0x{:x}", b.as_ptr() as usize)));

    mgr.deallocate(a, 512, &meshes).unwrap();
    mgr.deallocate(b, 1500, &audio).unwrap();
}

#[test]
fn test_json_lines_profile() {
    let mgr = manager();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("profile.jsonl");

    let policy = MemoryPolicy::default().with_tag("network");
    let ptr = mgr.allocate(2048, &policy).unwrap();

    let written = mgr
        .export_allocation_profile_as(&path, ProfileFormat::JsonLines)
        .unwrap();
    assert_eq!(written, 1);

    let contents = fs::read_to_string(&path).unwrap();
    let line: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
    assert_eq!(line["tag"], "network");
    assert_eq!(line["size_bytes"], 2048);
    assert_eq!(
        line["address"],
        format!("0x{:x}", ptr.as_ptr() as usize).as_str()
    );

    mgr.deallocate(ptr, 2048, &policy).unwrap();
}

#[test]
fn test_empty_profile_has_only_header() {
    let mgr = manager();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.txt");

    assert_eq!(mgr.export_allocation_profile(&path).unwrap(), 0);
    assert_eq!(fs::read_to_string(&path).unwrap(), format!("{TEXT_HEADER}\n"));
}

#[test]
fn test_export_overwrites_previous_profile() {
    let mgr = manager();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("profile.txt");
    fs::write(&path, "stale contents that are much longer than the new profile\n".repeat(10))
        .unwrap();

    mgr.export_allocation_profile(&path).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), format!("{TEXT_HEADER}\n"));
}

#[test]
fn test_unwritable_path_is_an_io_error() {
    let mgr = manager();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing").join("profile.txt");

    let err = mgr.export_allocation_profile(&path).unwrap_err();
    match err {
        MemoryError::Io { path: failed, .. } => assert_eq!(failed, path),
        other => panic!("expected an I/O error, got {other:?}"),
    }
}
