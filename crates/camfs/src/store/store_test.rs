//! Tests for the object store against the virtual camera.

use std::time::Duration;

use super::*;
use crate::ptp::virtual_device::{CFEXPRESS_STORAGE_ID, Fault, SD_STORAGE_ID, VirtualCamera};
use crate::ptp::{OperationCode, ResponseCode, SessionManager};
use crate::transport::{Transport, TransportError};

struct Fixture {
    camera: VirtualCamera,
    volumes: Arc<VolumeManager>,
    store: Arc<ObjectStore>,
    stats: Arc<StorageStats>,
}

fn fixture_with(camera: VirtualCamera, budget: u64) -> Fixture {
    let link = Box::new(camera.clone());
    fixture_over(camera, link, budget)
}

fn fixture_over(camera: VirtualCamera, link: Box<dyn Transport>, budget: u64) -> Fixture {
    crate::init_test_logging();
    let stats = Arc::new(StorageStats::new());
    let engine = Arc::new(TransactionEngine::new(link, Arc::clone(&stats), 512 * 1024));
    SessionManager::new(Arc::clone(&engine)).open().unwrap();
    let volumes = Arc::new(VolumeManager::new(Arc::clone(&engine)));
    volumes.scan().unwrap();
    volumes.mount(0).unwrap();
    let store = Arc::new(ObjectStore::new(
        engine,
        Arc::clone(&volumes),
        Arc::clone(&stats),
        budget,
        Duration::from_secs(300),
    ));
    let observer: Arc<dyn VolumeObserver> = store.clone();
    volumes.register_observer(Arc::downgrade(&observer));
    Fixture {
        camera,
        volumes,
        store,
        stats,
    }
}

fn fixture(budget: u64) -> Fixture {
    fixture_with(VirtualCamera::with_two_cards(), budget)
}

/// Sleeps before every transfer to the camera, so exchanges from different threads overlap
/// whenever the engine lets them.
struct SlowLink {
    camera: VirtualCamera,
    delay: Duration,
}

impl Transport for SlowLink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        std::thread::sleep(self.delay);
        self.camera.send(bytes)
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.camera.receive(max_len)
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

// ============================================================================
// Lookup and fetch
// ============================================================================

#[test]
fn test_lookup_misses_without_network() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "IMG_0001.CR3", b"raw");
    let sends = f.camera.send_count();

    assert!(f.store.lookup(handle).is_none());
    assert_eq!(f.camera.send_count(), sends);
}

#[test]
fn test_fetch_then_lookup_returns_same_object() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "IMG_0001.CR3", b"raw data");
    f.camera.set_pixel_size(handle, 8192, 5464);

    let fetched = f.store.fetch_info(handle).unwrap();
    assert_eq!(fetched.handle(), handle);
    assert_eq!(fetched.file_type(), FileType::RawCr3);
    assert_eq!(fetched.size(), 8);
    assert_eq!(fetched.slot(), Some(0));
    assert!(fetched.modified().is_some());
    let capture = fetched.metadata().capture.unwrap();
    assert_eq!((capture.width, capture.height), (8192, 5464));

    let looked_up = f.store.lookup(handle).unwrap();
    assert!(Arc::ptr_eq(&fetched, &looked_up));
    assert_eq!(Arc::strong_count(&fetched), 3);
    f.store.check_consistency().unwrap();
}

#[test]
fn test_fetch_unknown_handle() {
    let f = fixture(1024);
    assert_eq!(
        f.store.fetch_info(0x77).unwrap_err(),
        StorageError::ObjectNotFound { handle: 0x77 }
    );
    assert!(f.store.is_empty());
}

#[test]
fn test_fetch_root_is_rejected_locally() {
    let f = fixture(1024);
    let sends = f.camera.send_count();
    assert!(matches!(
        f.store.fetch_info(ROOT_HANDLE),
        Err(StorageError::InvalidArgument { .. })
    ));
    assert_eq!(f.camera.send_count(), sends);
}

#[test]
fn test_refetch_after_change_drops_cached_payload() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", &pattern(100, 1));
    let object = f.store.fetch_info(handle).unwrap();
    assert!(f.store.cache(&object).unwrap());

    f.camera.set_modified(handle, Utc::now() - chrono::Duration::days(1));
    let again = f.store.fetch_info(handle).unwrap();
    assert!(Arc::ptr_eq(&object, &again));
    assert!(!again.is_cached());
    assert_eq!(f.store.cached_bytes(), 0);
    f.store.check_consistency().unwrap();
}

// ============================================================================
// Reads
// ============================================================================

#[test]
fn test_read_range_uncached_goes_to_device() {
    let f = fixture(1024);
    let data = pattern(300, 7);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", &data);
    let object = f.store.fetch_info(handle).unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(f.store.read_range(&object, &mut buf, 100).unwrap(), 64);
    assert_eq!(&buf[..], &data[100..164]);
    assert_eq!(f.camera.count_commands(OperationCode::GetPartialObject), 1);
    assert!(!object.is_cached());

    let snapshot = f.stats.snapshot();
    assert_eq!(snapshot.cache_misses, 1);
    assert_eq!(snapshot.bytes_read, 64);
}

#[test]
fn test_read_range_clamps_at_end() {
    let f = fixture(1024);
    let data = pattern(50, 3);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", &data);
    let object = f.store.fetch_info(handle).unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(f.store.read_range(&object, &mut buf, 40).unwrap(), 10);
    assert_eq!(&buf[..10], &data[40..]);

    let partial_reads = f.camera.count_commands(OperationCode::GetPartialObject);
    assert_eq!(f.store.read_range(&object, &mut buf, 50).unwrap(), 0);
    assert_eq!(f.store.read_range(&object, &mut buf, 5000).unwrap(), 0);
    assert_eq!(f.camera.count_commands(OperationCode::GetPartialObject), partial_reads);
}

#[test]
fn test_read_past_saturated_size_is_too_large() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "MVI_0001.MP4", b"ftyp");
    let object = f.store.fetch_info(handle).unwrap();
    object.refresh(ObjectMetadata {
        size: u64::from(u32::MAX),
        size_saturated: true,
        ..object.metadata()
    });

    let mut buf = [0u8; 8];
    assert_eq!(f.store.read_range(&object, &mut buf, 0).unwrap(), 4);
    assert_eq!(
        f.store.read_range(&object, &mut buf, u64::from(u32::MAX)),
        Err(StorageError::FileTooLarge { handle })
    );
}

#[test]
fn test_read_range_rejects_offsets_beyond_protocol_range() {
    let camera = VirtualCamera::with_two_cards();
    let f = fixture_with(camera, 1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "clip.mp4", b"x");
    let object = f.store.fetch_info(handle).unwrap();
    object.refresh(ObjectMetadata {
        size: u64::from(u32::MAX) + 100,
        ..object.metadata()
    });

    let mut buf = [0u8; 8];
    assert!(matches!(
        f.store.read_range(&object, &mut buf, u64::from(u32::MAX) + 1),
        Err(StorageError::InvalidArgument { .. })
    ));
}

#[test]
fn test_cached_read_is_a_hit_without_network() {
    let f = fixture(1024);
    let data = pattern(200, 9);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", &data);
    let object = f.store.fetch_info(handle).unwrap();
    assert!(f.store.cache(&object).unwrap());
    let sends = f.camera.send_count();

    let mut buf = [0u8; 100];
    assert_eq!(f.store.read_range(&object, &mut buf, 150).unwrap(), 50);
    assert_eq!(&buf[..50], &data[150..]);
    assert_eq!(f.camera.send_count(), sends);
    assert_eq!(f.stats.snapshot().cache_hits, 1);
}

#[test]
fn test_read_of_deleted_object_is_not_found() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", b"abc");
    let object = f.store.fetch_info(handle).unwrap();
    f.camera.remove_storage(CFEXPRESS_STORAGE_ID);

    let mut buf = [0u8; 3];
    assert_eq!(
        f.store.read_range(&object, &mut buf, 0).unwrap_err(),
        StorageError::ObjectNotFound { handle }
    );
}

// ============================================================================
// Cache budget
// ============================================================================

#[test]
fn test_cache_respects_budget_lru() {
    let f = fixture(250);
    let handles: Vec<u32> = (0..3)
        .map(|i| f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, &format!("IMG_{i}.JPG"), &pattern(100, i)))
        .collect();
    let objects: Vec<ObjectRef> = handles.iter().map(|&h| f.store.fetch_info(h).unwrap()).collect();

    assert!(f.store.cache(&objects[0]).unwrap());
    assert!(f.store.cache(&objects[1]).unwrap());
    f.store.check_consistency().unwrap();

    // Re-access the first so the second becomes the oldest.
    let mut buf = [0u8; 1];
    f.store.read_range(&objects[0], &mut buf, 0).unwrap();

    assert!(f.store.cache(&objects[2]).unwrap());
    assert!(objects[0].is_cached());
    assert!(!objects[1].is_cached());
    assert!(objects[2].is_cached());
    assert!(f.store.cached_bytes() <= 250);
    assert!(f.store.lookup(handles[1]).is_some());
    f.store.check_consistency().unwrap();
}

#[test]
fn test_object_larger_than_budget_is_not_cached() {
    let f = fixture(100);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "big.mov", &pattern(101, 0));
    let object = f.store.fetch_info(handle).unwrap();

    assert!(!f.store.cache(&object).unwrap());
    assert_eq!(f.camera.count_commands(OperationCode::GetObject), 0);
    assert_eq!(f.store.cached_bytes(), 0);
}

#[test]
fn test_caching_twice_downloads_once() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", &pattern(10, 0));
    let object = f.store.fetch_info(handle).unwrap();
    assert!(f.store.cache(&object).unwrap());
    assert!(f.store.cache(&object).unwrap());
    assert_eq!(f.camera.count_commands(OperationCode::GetObject), 1);
    assert_eq!(f.store.cached_count(), 1);
}

#[test]
fn test_lowering_budget_evicts() {
    let f = fixture(1024);
    for i in 0..4 {
        let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, &format!("{i}.jpg"), &pattern(100, i));
        let object = f.store.fetch_info(handle).unwrap();
        f.store.cache(&object).unwrap();
    }
    assert_eq!(f.store.cached_bytes(), 400);

    f.store.set_budget(150);
    assert_eq!(f.store.cached_bytes(), 100);
    f.store.reset_budget();
    assert_eq!(f.store.budget(), 1024);
    f.store.check_consistency().unwrap();
}

#[test]
fn test_cache_failure_leaves_state_untouched() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", &pattern(10, 0));
    let object = f.store.fetch_info(handle).unwrap();
    f.camera.inject_fault(OperationCode::GetObject, Fault::Respond(ResponseCode::DeviceBusy));

    assert_eq!(f.store.cache(&object).unwrap_err(), StorageError::DeviceBusy);
    assert!(!object.is_cached());
    f.store.check_consistency().unwrap();
}

// ============================================================================
// Writes and deletes
// ============================================================================

#[test]
fn test_write_then_read_round_trip() {
    let f = fixture(1024);
    let bytes = pattern(777, 42);

    let object = f.store.write_new("a.jpg", &bytes, ROOT_HANDLE).unwrap();
    assert_eq!(object.size(), 777);
    assert_eq!(object.file_type(), FileType::Jpeg);
    assert_eq!(object.parent(), ROOT_HANDLE);
    assert!(Arc::ptr_eq(&object, &f.store.lookup(object.handle()).unwrap()));

    let mut buf = vec![0u8; 1000];
    let n = f.store.read_range(&object, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], &bytes[..]);

    let stored = f.camera.object(object.handle()).unwrap();
    assert_eq!(stored.data, bytes);
    assert_eq!(stored.info.storage_id, CFEXPRESS_STORAGE_ID);
    assert_eq!(f.stats.snapshot().files_written, 1);
}

#[test]
fn test_write_goes_to_active_volume() {
    let f = fixture(1024);
    f.volumes.mount(1).unwrap();
    f.volumes.set_active(1).unwrap();

    let object = f.store.write_new("memo.wav", b"RIFF", ROOT_HANDLE).unwrap();
    assert_eq!(f.camera.object(object.handle()).unwrap().info.storage_id, SD_STORAGE_ID);
    assert_eq!(object.slot(), Some(1));
}

#[test]
fn test_write_into_folder() {
    let f = fixture(1024);
    let dcim = f.camera.add_folder(CFEXPRESS_STORAGE_ID, 0, "DCIM");
    let object = f.store.write_new("IMG_0002.JPG", b"jpeg", dcim).unwrap();
    assert_eq!(object.parent(), dcim);
    assert_eq!(f.camera.object(object.handle()).unwrap().info.parent, dcim);
}

#[test]
fn test_write_to_protected_volume_is_read_only() {
    let camera = VirtualCamera::with_two_cards();
    camera.set_read_only(CFEXPRESS_STORAGE_ID, true);
    let f = fixture_with(camera, 1024);
    let sends = f.camera.send_count();

    assert_eq!(
        f.store.write_new("a.jpg", b"x", ROOT_HANDLE).unwrap_err(),
        StorageError::ReadOnly
    );
    assert_eq!(f.camera.send_count(), sends);
}

#[test]
fn test_write_without_active_volume() {
    let f = fixture(1024);
    f.volumes.unmount(0).unwrap();
    assert_eq!(
        f.store.write_new("a.jpg", b"x", ROOT_HANDLE).unwrap_err(),
        StorageError::NoSuchDevice { slot: None }
    );
}

#[test]
fn test_write_rejects_bad_names() {
    let f = fixture(1024);
    let long = "x".repeat(256);
    for name in ["", ".", "..", "a/b.jpg", long.as_str()] {
        assert!(
            matches!(
                f.store.write_new(name, b"x", ROOT_HANDLE),
                Err(StorageError::InvalidArgument { .. })
            ),
            "{name:?} should be rejected"
        );
    }
    assert_eq!(f.camera.count_commands(OperationCode::SendObjectInfo), 0);
}

#[test]
fn test_write_to_full_card() {
    let f = fixture(1024);
    f.camera.add_storage(
        CFEXPRESS_STORAGE_ID,
        crate::ptp::virtual_device::removable_card("CFexpress", 1000, 10),
    );
    assert_eq!(
        f.store.write_new("a.jpg", &pattern(20, 0), ROOT_HANDLE).unwrap_err(),
        StorageError::StorageFull
    );
}

#[test]
fn test_delete_removes_from_index_and_cache() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", &pattern(64, 0));
    let object = f.store.fetch_info(handle).unwrap();
    f.store.cache(&object).unwrap();

    f.store.delete(&object).unwrap();
    assert!(f.store.lookup(handle).is_none());
    assert!(!object.is_cached());
    assert_eq!(f.store.cached_bytes(), 0);
    assert!(f.camera.object(handle).is_none());
    assert_eq!(Arc::strong_count(&object), 1);
    f.store.check_consistency().unwrap();
}

#[test]
fn test_delete_failure_keeps_entry() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", b"x");
    let object = f.store.fetch_info(handle).unwrap();
    f.camera
        .inject_fault(OperationCode::DeleteObject, Fault::Respond(ResponseCode::ObjectWriteProtected));

    assert_eq!(f.store.delete(&object).unwrap_err(), StorageError::WriteProtected);
    assert!(f.store.lookup(handle).is_some());
}

// ============================================================================
// Cleanup, volume changes and events
// ============================================================================

#[test]
fn test_cleanup_drops_only_stale_payloads() {
    let f = fixture(1024);
    let old = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "old.jpg", &pattern(10, 0));
    let fresh = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "new.jpg", &pattern(10, 1));
    f.camera.set_modified(old, Utc::now() - chrono::Duration::hours(2));
    let old = f.store.fetch_info(old).unwrap();
    let fresh = f.store.fetch_info(fresh).unwrap();
    f.store.cache(&old).unwrap();
    f.store.cache(&fresh).unwrap();

    assert_eq!(f.store.cleanup_stale(Utc::now()), 1);
    assert!(!old.is_cached());
    assert!(fresh.is_cached());
    assert!(f.store.lookup(old.handle()).is_some());
    f.store.check_consistency().unwrap();
}

#[test]
fn test_objects_without_mtime_are_never_stale() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", &pattern(10, 0));
    let object = f.store.fetch_info(handle).unwrap();
    object.refresh(ObjectMetadata {
        modified: None,
        ..object.metadata()
    });
    f.store.cache(&object).unwrap();

    assert_eq!(f.store.cleanup_stale(Utc::now() + chrono::Duration::days(365)), 0);
    assert!(object.is_cached());
}

#[test]
fn test_unmount_drops_payloads_of_that_slot() {
    let f = fixture(1024);
    let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", &pattern(10, 0));
    let object = f.store.fetch_info(handle).unwrap();
    f.store.cache(&object).unwrap();

    f.volumes.unmount(0).unwrap();
    assert!(!object.is_cached());
    assert!(f.store.lookup(handle).is_some());
    f.store.check_consistency().unwrap();
}

#[test]
fn test_format_forgets_objects_of_that_slot() {
    let f = fixture(1024);
    let cf = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", b"a");
    let sd = f.camera.add_file(SD_STORAGE_ID, 0, "b.jpg", b"b");
    f.store.fetch_info(cf).unwrap();
    f.store.fetch_info(sd).unwrap();

    f.volumes.format(0).unwrap();
    assert!(f.store.lookup(cf).is_none());
    assert!(f.store.lookup(sd).is_some());
}

#[test]
fn test_device_events() {
    let f = fixture(1024);
    let a = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "a.jpg", &pattern(10, 0));
    let b = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, "b.jpg", &pattern(10, 1));
    let a_object = f.store.fetch_info(a).unwrap();
    f.store.fetch_info(b).unwrap();
    f.store.cache(&a_object).unwrap();

    f.store.handle_event(&DeviceEvent::ObjectInfoChanged { handle: a });
    assert!(!a_object.is_cached());
    assert!(f.store.lookup(a).is_some());

    f.store.handle_event(&DeviceEvent::ObjectRemoved { handle: b });
    assert!(f.store.lookup(b).is_none());

    f.store.handle_event(&DeviceEvent::DeviceReset);
    assert!(f.store.is_empty());
}

// ============================================================================
// Concurrent callers
// ============================================================================

#[test]
fn test_concurrent_uploads_pair_info_with_content() {
    let camera = VirtualCamera::with_two_cards();
    let link = Box::new(SlowLink {
        camera: camera.clone(),
        delay: Duration::from_millis(1),
    });
    let f = fixture_over(camera, link, 1 << 20);

    std::thread::scope(|scope| {
        for writer in 0..3u8 {
            let f = &f;
            scope.spawn(move || {
                for round in 0..15usize {
                    let name = format!("W{writer}_{round:02}.JPG");
                    let bytes = pattern(200 + round * 13 + usize::from(writer), writer.wrapping_mul(50));
                    let object = f.store.write_new(&name, &bytes, ROOT_HANDLE).unwrap();

                    let stored = f.camera.object(object.handle()).unwrap();
                    assert_eq!(stored.info.filename, name);
                    assert_eq!(stored.data, bytes);
                    assert_eq!(object.name(), name);
                }
            });
        }
    });

    assert_eq!(f.store.len(), 45);
    assert_eq!(f.stats.snapshot().files_written, 45);
    f.store.check_consistency().unwrap();
}

#[test]
fn test_cleanup_alongside_reads_keeps_index_consistent() {
    let f = fixture(4096);
    let payloads: Vec<Vec<u8>> = (0..6u8).map(|seed| pattern(900 + usize::from(seed), seed)).collect();
    let objects: Vec<ObjectRef> = payloads
        .iter()
        .enumerate()
        .map(|(i, data)| {
            let handle = f.camera.add_file(CFEXPRESS_STORAGE_ID, 0, &format!("IMG_{i:04}.JPG"), data);
            f.store.fetch_info(handle).unwrap()
        })
        .collect();

    std::thread::scope(|scope| {
        for reader in 0..2 {
            let (f, objects, payloads) = (&f, &objects, &payloads);
            scope.spawn(move || {
                let mut buf = vec![0u8; 1024];
                for round in 0..40 {
                    let i = (round + reader * 3) % objects.len();
                    f.store.cache(&objects[i]).unwrap();
                    let n = f.store.read_range(&objects[i], &mut buf, 0).unwrap();
                    assert_eq!(&buf[..n], payloads[i].as_slice());
                }
            });
        }
        let f = &f;
        scope.spawn(move || {
            for round in 0..40 {
                f.store.cleanup_stale(Utc::now() + chrono::Duration::days(1));
                f.store.set_budget(if round % 2 == 0 { 2048 } else { 4096 });
                f.store.check_consistency().unwrap();
            }
        });
    });

    f.store.check_consistency().unwrap();
    assert!(f.store.cached_bytes() <= f.store.budget());
    assert_eq!(f.store.len(), objects.len());
}
