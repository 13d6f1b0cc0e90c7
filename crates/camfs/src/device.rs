//! One attached camera: the engine, its session, the volume manager, the object store and the
//! background tasks that keep them current.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};

use crate::config::CamfsConfig;
use crate::errors::StorageError;
use crate::fs::{CameraFs, MountOptions};
use crate::ignore_poison::{IgnorePoison, IgnorePoisonRw};
use crate::ptp::{DeviceEvent, DeviceInfo, SessionManager, SessionState, TransactionEngine};
use crate::stats::StorageStats;
use crate::store::ObjectStore;
use crate::subsystem::Subsystem;
use crate::tasks::{EventWorker, PeriodicTask};
use crate::transport::Transport;
use crate::volumes::{VolumeManager, VolumeObserver, VolumeStatus};

type Subsystems = Arc<RwLock<Vec<Arc<dyn Subsystem>>>>;

/// Work for the event thread.
enum DeviceMessage {
    Event(DeviceEvent),
    Card { slot: usize, status: VolumeStatus },
}

struct BackgroundTasks {
    refresh: PeriodicTask,
    cleanup: PeriodicTask,
    events: EventWorker<DeviceMessage>,
}

impl BackgroundTasks {
    fn start(
        config: &CamfsConfig,
        volumes: &Arc<VolumeManager>,
        store: &Arc<ObjectStore>,
        subsystems: &Subsystems,
    ) -> Result<Self, StorageError> {
        let refresh_volumes = Arc::clone(volumes);
        let refresh = PeriodicTask::spawn(
            "camfs-volume-refresh",
            config.refresh_initial_delay(),
            config.refresh_interval(),
            move || {
                let refreshed = refresh_volumes.refresh_mounted();
                debug!("Refreshed {refreshed} mounted volume(s)");
            },
        )
        .map_err(|e| StorageError::io(format!("can't start the volume refresh task: {e}")))?;

        let cleanup_store = Arc::clone(store);
        let cleanup = PeriodicTask::spawn(
            "camfs-cache-cleanup",
            config.cleanup_interval(),
            config.cleanup_interval(),
            move || {
                cleanup_store.cleanup_stale(Utc::now());
            },
        )
        .map_err(|e| StorageError::io(format!("can't start the cache cleanup task: {e}")))?;

        let event_volumes = Arc::clone(volumes);
        let event_subsystems = Arc::clone(subsystems);
        let events = EventWorker::spawn("camfs-events", move |message| match message {
            DeviceMessage::Event(event) => {
                debug!("Device event {event:?}");
                let subsystems = event_subsystems.read_ignore_poison().clone();
                for subsystem in subsystems {
                    subsystem.handle_event(&event);
                }
            }
            DeviceMessage::Card { slot, status } => {
                if let Err(e) = event_volumes.handle_card_event(slot, status) {
                    warn!("Card event {status} on slot {slot} failed: {e}");
                }
            }
        })
        .map_err(|e| StorageError::io(format!("can't start the event task: {e}")))?;

        Ok(Self {
            refresh,
            cleanup,
            events,
        })
    }

    fn shutdown(&mut self) {
        self.refresh.shutdown();
        self.cleanup.shutdown();
        self.events.shutdown();
    }
}

pub struct CameraDevice {
    engine: Arc<TransactionEngine>,
    session: SessionManager,
    stats: Arc<StorageStats>,
    volumes: Arc<VolumeManager>,
    store: Arc<ObjectStore>,
    subsystems: Subsystems,
    tasks: Mutex<Option<BackgroundTasks>>,
    device_info: DeviceInfo,
    config: CamfsConfig,
    detached: AtomicBool,
}

impl CameraDevice {
    /// Opens a session over `transport`, reads the device description, scans the card slots
    /// and starts the background tasks. On failure the session is closed again.
    pub fn attach(transport: impl Transport + 'static, config: CamfsConfig) -> Result<Self, StorageError> {
        let stats = Arc::new(StorageStats::new());
        let engine = Arc::new(TransactionEngine::new(
            Box::new(transport),
            Arc::clone(&stats),
            config.max_packet_size,
        ));
        let session = SessionManager::new(Arc::clone(&engine));
        session.open()?;

        let prepared = Self::prepare(&engine, &stats, &config);
        let (device_info, volumes, store) = match prepared {
            Ok(parts) => parts,
            Err(e) => {
                session.close();
                return Err(e);
            }
        };

        let subsystems: Subsystems = Arc::new(RwLock::new(vec![
            Arc::clone(&volumes) as Arc<dyn Subsystem>,
            Arc::clone(&store) as Arc<dyn Subsystem>,
        ]));
        let tasks = match BackgroundTasks::start(&config, &volumes, &store, &subsystems) {
            Ok(tasks) => tasks,
            Err(e) => {
                session.close();
                return Err(e);
            }
        };

        info!(
            "Attached {} {} (serial {}), {} volume(s)",
            device_info.manufacturer,
            device_info.model,
            device_info.serial_number,
            volumes.volumes().iter().filter(|volume| !volume.is_empty()).count()
        );
        Ok(Self {
            engine,
            session,
            stats,
            volumes,
            store,
            subsystems,
            tasks: Mutex::new(Some(tasks)),
            device_info,
            config,
            detached: AtomicBool::new(false),
        })
    }

    fn prepare(
        engine: &Arc<TransactionEngine>,
        stats: &Arc<StorageStats>,
        config: &CamfsConfig,
    ) -> Result<(DeviceInfo, Arc<VolumeManager>, Arc<ObjectStore>), StorageError> {
        let device_info = engine.get_device_info()?;
        if !device_info.supports_upload() {
            info!("{} can't receive objects, volumes are read-only", device_info.model);
        }

        let volumes = Arc::new(VolumeManager::new(Arc::clone(engine)));
        volumes.set_uploads_supported(device_info.supports_upload());
        volumes.scan()?;

        let store = Arc::new(ObjectStore::new(
            Arc::clone(engine),
            Arc::clone(&volumes),
            Arc::clone(stats),
            config.cache_max_bytes,
            config.cache_timeout(),
        ));
        store.set_camera_model(Some(device_info.model.clone()).filter(|model| !model.is_empty()));
        let observer: Arc<dyn VolumeObserver> = store.clone();
        volumes.register_observer(Arc::downgrade(&observer));
        Ok((device_info, volumes, store))
    }

    /// Registers an additional subsystem. It receives every later device event and is detached
    /// with the device.
    pub fn register_subsystem(&self, subsystem: Arc<dyn Subsystem>) {
        debug!("Registered subsystem {}", subsystem.name());
        self.subsystems.write_ignore_poison().push(subsystem);
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Queues a device event for the event thread. Returns false once the device is detached.
    pub fn notify_event(&self, event: DeviceEvent) -> bool {
        self.send(DeviceMessage::Event(event))
    }

    /// Decodes an event container read from the camera's interrupt endpoint and queues it.
    pub fn notify_event_container(&self, frame: &[u8]) -> Result<bool, StorageError> {
        let event = DeviceEvent::decode(frame)?;
        Ok(self.notify_event(event))
    }

    /// Queues a card insertion, removal or condition change for `slot`.
    pub fn notify_card_event(&self, slot: usize, status: VolumeStatus) -> bool {
        self.send(DeviceMessage::Card { slot, status })
    }

    /// Waits until every event queued so far has been handled.
    pub fn flush_events(&self, timeout: Duration) -> bool {
        match self.tasks.lock_ignore_poison().as_ref() {
            Some(tasks) => tasks.events.flush(timeout),
            None => false,
        }
    }

    fn send(&self, message: DeviceMessage) -> bool {
        match self.tasks.lock_ignore_poison().as_ref() {
            Some(tasks) => tasks.events.send(message),
            None => false,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Mounts the filesystem bridge on a slot of this camera.
    pub fn mount_filesystem(&self, options: MountOptions) -> Result<CameraFs, StorageError> {
        if self.is_detached() {
            return Err(StorageError::NotConnected);
        }
        CameraFs::mount(
            Arc::clone(&self.volumes),
            Arc::clone(&self.store),
            Arc::clone(&self.stats),
            options,
            self.config.block_size,
        )
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    pub fn config(&self) -> &CamfsConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    pub fn volumes(&self) -> &Arc<VolumeManager> {
        &self.volumes
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<StorageStats> {
        &self.stats
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Stops and joins the background tasks, detaches every subsystem, then closes the session.
    /// Safe to call more than once.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = self.tasks.lock_ignore_poison().take();
        if let Some(mut tasks) = tasks {
            tasks.shutdown();
        }

        let subsystems: Vec<Arc<dyn Subsystem>> = std::mem::take(&mut *self.subsystems.write_ignore_poison());
        for subsystem in subsystems.iter().rev() {
            debug!("Detaching subsystem {}", subsystem.name());
            subsystem.detach();
        }
        self.volumes.unmount_all();
        self.store.clear();
        self.session.close();
        info!("Detached {}", self.device_info.model);
    }
}

impl Drop for CameraDevice {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::OperationCode;
    use crate::ptp::virtual_device::{CFEXPRESS_STORAGE_ID, Fault, SD_STORAGE_ID, VirtualCamera};
    use std::sync::atomic::AtomicUsize;

    fn attach(camera: &VirtualCamera) -> CameraDevice {
        crate::init_test_logging();
        CameraDevice::attach(camera.clone(), CamfsConfig::default()).unwrap()
    }

    #[derive(Default)]
    struct CountingSubsystem {
        events: AtomicUsize,
        detached: AtomicBool,
    }

    impl Subsystem for CountingSubsystem {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn handle_event(&self, _event: &DeviceEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn detach(&self) {
            self.detached.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_attach_opens_session_and_scans() {
        let camera = VirtualCamera::with_two_cards();
        let device = attach(&camera);

        assert_eq!(device.session_state(), SessionState::Open);
        assert!(camera.session_open());
        assert_eq!(device.device_info().model, "Canon EOS R5");
        let volumes = device.volumes().volumes();
        assert_eq!(volumes[0].status, VolumeStatus::Inserted);
        assert_eq!(volumes[1].status, VolumeStatus::Inserted);
        assert_eq!(camera.commands()[0], (OperationCode::OpenSession, 1));
    }

    #[test]
    fn test_attach_failure_closes_session() {
        let camera = VirtualCamera::with_two_cards();
        camera.inject_fault(OperationCode::GetStorageIds, Fault::Disconnect);
        crate::init_test_logging();

        let err = CameraDevice::attach(camera.clone(), CamfsConfig::default()).err();
        assert_eq!(err, Some(StorageError::Disconnected));
    }

    #[test]
    fn test_card_events_run_on_event_thread() {
        let camera = VirtualCamera::with_two_cards();
        let device = attach(&camera);

        assert!(device.notify_card_event(0, VolumeStatus::Inserted));
        assert!(device.flush_events(Duration::from_secs(5)));
        assert_eq!(device.volumes().volume(0).unwrap().status, VolumeStatus::Mounted);

        assert!(device.notify_card_event(0, VolumeStatus::Empty));
        assert!(device.flush_events(Duration::from_secs(5)));
        assert!(device.volumes().volume(0).unwrap().is_empty());
    }

    #[test]
    fn test_device_events_reach_every_subsystem() {
        let camera = VirtualCamera::with_two_cards();
        let device = attach(&camera);
        let counting = Arc::new(CountingSubsystem::default());
        device.register_subsystem(counting.clone());

        device.volumes().mount(1).unwrap();
        camera.remove_storage(SD_STORAGE_ID);
        assert!(device.notify_event(DeviceEvent::StoreRemoved {
            storage_id: SD_STORAGE_ID
        }));
        assert!(device.notify_event(DeviceEvent::CaptureComplete));
        assert!(device.flush_events(Duration::from_secs(5)));

        assert_eq!(counting.events.load(Ordering::SeqCst), 2);
        assert!(device.volumes().volume(1).unwrap().is_empty());
        assert_eq!(device.volumes().volume(0).unwrap().storage_id, CFEXPRESS_STORAGE_ID);
    }

    #[test]
    fn test_detach_is_idempotent_and_tears_down() {
        let camera = VirtualCamera::with_two_cards();
        let device = attach(&camera);
        let counting = Arc::new(CountingSubsystem::default());
        device.register_subsystem(counting.clone());
        device.volumes().mount(0).unwrap();

        device.detach();
        assert!(device.is_detached());
        assert!(counting.detached.load(Ordering::SeqCst));
        assert!(!camera.session_open());
        assert_eq!(device.session_state(), SessionState::Closed);
        assert!(device.volumes().volume(0).unwrap().is_empty());
        assert!(!device.notify_event(DeviceEvent::DeviceReset));
        assert!(!device.flush_events(Duration::from_millis(10)));
        assert_eq!(
            device.mount_filesystem(MountOptions::slot(0)).err(),
            Some(StorageError::NotConnected)
        );

        let closes = camera.count_commands(OperationCode::CloseSession);
        device.detach();
        assert_eq!(camera.count_commands(OperationCode::CloseSession), closes);
    }

    #[test]
    fn test_drop_detaches() {
        let camera = VirtualCamera::with_two_cards();
        drop(attach(&camera));
        assert!(!camera.session_open());
    }

    #[test]
    fn test_event_container_is_decoded() {
        let camera = VirtualCamera::with_two_cards();
        let device = attach(&camera);
        let frame = crate::ptp::container::Container::event(
            crate::ptp::EventCode::StoreRemoved.code(),
            0,
            &[SD_STORAGE_ID],
        )
        .encode()
        .unwrap();
        device.volumes().mount(1).unwrap();

        assert!(device.notify_event_container(&frame).unwrap());
        assert!(device.flush_events(Duration::from_secs(5)));
        assert!(device.volumes().volume(1).unwrap().is_empty());
        assert!(device.notify_event_container(&[1, 2, 3]).is_err());
    }
}
