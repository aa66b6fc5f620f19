//! Test support utilities shared across unit and integration tests.
//!
//! The mocks here mirror the accessor contracts with scripted, in-memory
//! behaviour: watchers are channels the test fires by hand, lookups read
//! from plain maps the test seeds, and setters invoke a handler the test
//! installs (commonly pushing into a channel for assertions). The dummy
//! provider fabricates deterministic ids (`id-1`, `serial-1`,
//! `/dev/sda1`) so expected records can be written out literally.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use crate::accessor::{
    AccessorError, AccessorFuture, EnvironAccessor, FilesystemAccessor, ItemResult,
    LifecycleManager, LookupError, LookupResult, MachineAccessor, VolumeAccessor,
};
use crate::model::Life;
use crate::provider::{
    BlockDevice, EnvironConfig, Filesystem, FilesystemAttachment, FilesystemAttachmentInfo,
    FilesystemAttachmentParams, FilesystemInfo, FilesystemParams, FilesystemSource, InstanceId,
    PoolConfig, ProviderScope, SourceError, SourceFuture, SourceResult, StorageKind,
    StorageProvider, Volume, VolumeAttachment, VolumeAttachmentInfo, VolumeAttachmentParams,
    VolumeInfo, VolumeParams, VolumeSource,
};
use crate::tags::{
    AttachmentId, FilesystemAttachmentId, FilesystemTag, MachineTag, StorageTag, Tag, UnitTag,
    VolumeAttachmentId, VolumeTag,
};
use crate::watcher::{NotifyWatcher, StringsWatcher, Watcher, WatcherSender, channel};

/// Parses a machine tag, panicking on malformed test input.
#[must_use]
pub fn machine(id: &str) -> MachineTag {
    MachineTag::parse(id).expect("malformed machine tag in test")
}

/// Parses a volume tag, panicking on malformed test input.
#[must_use]
pub fn volume(id: &str) -> VolumeTag {
    VolumeTag::parse(id).expect("malformed volume tag in test")
}

/// Parses a filesystem tag, panicking on malformed test input.
#[must_use]
pub fn filesystem(id: &str) -> FilesystemTag {
    FilesystemTag::parse(id).expect("malformed filesystem tag in test")
}

/// Parses a storage tag, panicking on malformed test input.
#[must_use]
pub fn storage(id: &str) -> StorageTag {
    StorageTag::parse(id).expect("malformed storage tag in test")
}

/// Parses a unit tag, panicking on malformed test input.
#[must_use]
pub fn unit(id: &str) -> UnitTag {
    UnitTag::parse(id).expect("malformed unit tag in test")
}

/// Builds a volume attachment id from its halves.
#[must_use]
pub fn volume_attachment(machine_id: &str, volume_id: &str) -> VolumeAttachmentId {
    AttachmentId::new(machine(machine_id), volume(volume_id))
}

/// Builds a filesystem attachment id from its halves.
#[must_use]
pub fn filesystem_attachment(machine_id: &str, filesystem_id: &str) -> FilesystemAttachmentId {
    AttachmentId::new(machine(machine_id), filesystem(filesystem_id))
}

/// Waits for the next event from a watcher-like future, failing the test
/// after a generous timeout.
pub async fn expect_event<T>(event: impl Future<Output = Option<T>>, activity: &str) -> T {
    match tokio::time::timeout(Duration::from_secs(5), event).await {
        Ok(Some(value)) => value,
        Ok(None) => panic!("stream closed while {activity}"),
        Err(_) => panic!("timed out {activity}"),
    }
}

/// Asserts that no event arrives from a watcher-like future within a
/// short grace period.
pub async fn expect_no_event<T>(event: impl Future<Output = Option<T>>, activity: &str) {
    if let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(100), event).await {
        panic!("unexpected {activity}");
    }
}

fn tag_number(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

// ---------------------------------------------------------------------
// Dummy provider and sources
// ---------------------------------------------------------------------

/// Factory closure a test may install to intercept source construction.
pub type VolumeSourceFactory = Box<
    dyn Fn(&EnvironConfig, &PoolConfig) -> Result<Arc<dyn VolumeSource>, SourceError>
        + Send
        + Sync,
>;

/// Factory closure a test may install to intercept source construction.
pub type FilesystemSourceFactory = Box<
    dyn Fn(&EnvironConfig, &PoolConfig) -> Result<Arc<dyn FilesystemSource>, SourceError>
        + Send
        + Sync,
>;

/// A scriptable storage provider for tests.
pub struct DummyProvider {
    dynamic: bool,
    scope: ProviderScope,
    kinds: Vec<StorageKind>,
    volume_source: Arc<DummyVolumeSource>,
    filesystem_source: Arc<DummyFilesystemSource>,
    volume_source_factory: Mutex<Option<VolumeSourceFactory>>,
    filesystem_source_factory: Mutex<Option<FilesystemSourceFactory>>,
}

impl Default for DummyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyProvider {
    /// Creates a dynamic, environment-scoped provider supporting both
    /// kinds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dynamic: true,
            scope: ProviderScope::Environ,
            kinds: vec![StorageKind::Filesystem, StorageKind::Block],
            volume_source: Arc::new(DummyVolumeSource::default()),
            filesystem_source: Arc::new(DummyFilesystemSource::default()),
            volume_source_factory: Mutex::new(None),
            filesystem_source_factory: Mutex::new(None),
        }
    }

    /// Marks the provider as unable to provision after bootstrap.
    #[must_use]
    pub fn non_dynamic(mut self) -> Self {
        self.dynamic = false;
        self
    }

    /// Scopes the provider's resources to single machines.
    #[must_use]
    pub fn machine_scoped(mut self) -> Self {
        self.scope = ProviderScope::Machine;
        self
    }

    /// Restricts the provider to block storage.
    #[must_use]
    pub fn block_only(mut self) -> Self {
        self.kinds = vec![StorageKind::Block];
        self
    }

    /// Restricts the provider to filesystems.
    #[must_use]
    pub fn filesystem_only(mut self) -> Self {
        self.kinds = vec![StorageKind::Filesystem];
        self
    }

    /// Installs a factory intercepting volume source construction.
    pub fn set_volume_source_factory(&self, factory: VolumeSourceFactory) {
        *self
            .volume_source_factory
            .lock()
            .expect("factory lock poisoned") = Some(factory);
    }

    /// Installs a factory intercepting filesystem source construction.
    pub fn set_filesystem_source_factory(&self, factory: FilesystemSourceFactory) {
        *self
            .filesystem_source_factory
            .lock()
            .expect("factory lock poisoned") = Some(factory);
    }

    /// Returns the default volume source for argument assertions.
    #[must_use]
    pub fn volume_source_handle(&self) -> Arc<DummyVolumeSource> {
        Arc::clone(&self.volume_source)
    }

    /// Returns the default filesystem source for argument assertions.
    #[must_use]
    pub fn filesystem_source_handle(&self) -> Arc<DummyFilesystemSource> {
        Arc::clone(&self.filesystem_source)
    }
}

impl StorageProvider for DummyProvider {
    fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    fn scope(&self) -> ProviderScope {
        self.scope
    }

    fn supports(&self, kind: StorageKind) -> bool {
        self.kinds.contains(&kind)
    }

    fn volume_source(
        &self,
        environ: &EnvironConfig,
        pool: &PoolConfig,
    ) -> Result<Arc<dyn VolumeSource>, SourceError> {
        if let Some(factory) = &*self
            .volume_source_factory
            .lock()
            .expect("factory lock poisoned")
        {
            return factory(environ, pool);
        }
        Ok(Arc::clone(&self.volume_source) as Arc<dyn VolumeSource>)
    }

    fn filesystem_source(
        &self,
        environ: &EnvironConfig,
        pool: &PoolConfig,
    ) -> Result<Arc<dyn FilesystemSource>, SourceError> {
        if let Some(factory) = &*self
            .filesystem_source_factory
            .lock()
            .expect("factory lock poisoned")
        {
            return factory(environ, pool);
        }
        Ok(Arc::clone(&self.filesystem_source) as Arc<dyn FilesystemSource>)
    }
}

/// Volume source fabricating deterministic infos and recording its
/// arguments.
#[derive(Default)]
pub struct DummyVolumeSource {
    /// Every `create_volumes` argument batch, in call order.
    pub create_args: Mutex<Vec<Vec<VolumeParams>>>,
    /// Every `attach_volumes` argument batch, in call order.
    pub attach_args: Mutex<Vec<Vec<VolumeAttachmentParams>>>,
}

impl VolumeSource for DummyVolumeSource {
    fn create_volumes<'a>(
        &'a self,
        params: &'a [VolumeParams],
    ) -> SourceFuture<'a, Vec<SourceResult<Volume>>> {
        Box::pin(async move {
            self.create_args
                .lock()
                .expect("args lock poisoned")
                .push(params.to_vec());
            Ok(params
                .iter()
                .map(|params| {
                    let number = tag_number(params.tag.id());
                    Ok(Volume {
                        tag: params.tag.clone(),
                        info: VolumeInfo {
                            volume_id: format!("id-{number}"),
                            hardware_id: Some(format!("serial-{number}")),
                            size: params.size,
                            persistent: params.attributes.get("persistent") == Some(&json!(true)),
                        },
                    })
                })
                .collect())
        })
    }

    fn attach_volumes<'a>(
        &'a self,
        params: &'a [VolumeAttachmentParams],
    ) -> SourceFuture<'a, Vec<SourceResult<VolumeAttachment>>> {
        Box::pin(async move {
            self.attach_args
                .lock()
                .expect("args lock poisoned")
                .push(params.to_vec());
            Ok(params
                .iter()
                .map(|params| {
                    Ok(VolumeAttachment {
                        volume: params.volume.clone(),
                        machine: params.machine.clone(),
                        info: VolumeAttachmentInfo {
                            device_name: format!("/dev/sda{}", tag_number(params.volume.id())),
                            read_only: params.read_only,
                        },
                    })
                })
                .collect())
        })
    }
}

/// Filesystem source fabricating deterministic infos and recording its
/// arguments.
#[derive(Default)]
pub struct DummyFilesystemSource {
    /// Every `create_filesystems` argument batch, in call order.
    pub create_args: Mutex<Vec<Vec<FilesystemParams>>>,
    /// Every `attach_filesystems` argument batch, in call order.
    pub attach_args: Mutex<Vec<Vec<FilesystemAttachmentParams>>>,
}

impl FilesystemSource for DummyFilesystemSource {
    fn create_filesystems<'a>(
        &'a self,
        params: &'a [FilesystemParams],
    ) -> SourceFuture<'a, Vec<SourceResult<Filesystem>>> {
        Box::pin(async move {
            self.create_args
                .lock()
                .expect("args lock poisoned")
                .push(params.to_vec());
            Ok(params
                .iter()
                .map(|params| {
                    Ok(Filesystem {
                        tag: params.tag.clone(),
                        backing_volume: params.backing_volume.clone(),
                        info: FilesystemInfo {
                            filesystem_id: format!("id-{}", tag_number(params.tag.id())),
                            size: params.size,
                        },
                    })
                })
                .collect())
        })
    }

    fn attach_filesystems<'a>(
        &'a self,
        params: &'a [FilesystemAttachmentParams],
    ) -> SourceFuture<'a, Vec<SourceResult<FilesystemAttachment>>> {
        Box::pin(async move {
            self.attach_args
                .lock()
                .expect("args lock poisoned")
                .push(params.to_vec());
            Ok(params
                .iter()
                .map(|params| {
                    let mount_point = params.mount_point.clone().unwrap_or_else(|| {
                        let id = params
                            .filesystem_id
                            .clone()
                            .unwrap_or_else(|| params.filesystem.id().to_owned());
                        camino::Utf8PathBuf::from(format!("/srv/{id}"))
                    });
                    Ok(FilesystemAttachment {
                        filesystem: params.filesystem.clone(),
                        machine: params.machine.clone(),
                        info: FilesystemAttachmentInfo {
                            mount_point,
                            read_only: params.read_only,
                        },
                    })
                })
                .collect())
        })
    }
}

// ---------------------------------------------------------------------
// Mock accessors
// ---------------------------------------------------------------------

/// Handler a test installs to observe or script a setter.
pub type SetHandler<T> = Box<dyn FnMut(&[T]) -> Result<Vec<ItemResult>, AccessorError> + Send>;

fn default_outcomes<T>(items: &[T]) -> Result<Vec<ItemResult>, AccessorError> {
    Ok(items.iter().map(|_| Ok(())).collect())
}

struct MockVolumesInner {
    volumes_tx: WatcherSender<Vec<String>>,
    volumes_rx: Mutex<Option<StringsWatcher>>,
    attachments_tx: WatcherSender<Vec<VolumeAttachmentId>>,
    attachments_rx: Mutex<Option<Watcher<Vec<VolumeAttachmentId>>>>,
    block_devices_tx: WatcherSender<()>,
    block_devices_rx: Mutex<Option<NotifyWatcher>>,
    provisioned_volumes: Mutex<BTreeMap<VolumeTag, Volume>>,
    provisioned_attachments: Mutex<BTreeMap<VolumeAttachmentId, VolumeAttachment>>,
    provisioned_machines: Mutex<BTreeMap<MachineTag, InstanceId>>,
    block_devices: Mutex<BTreeMap<VolumeAttachmentId, BlockDevice>>,
    set_volume_info: Mutex<Option<SetHandler<Volume>>>,
    set_attachment_info: Mutex<Option<SetHandler<VolumeAttachment>>>,
}

/// Scripted [`VolumeAccessor`].
#[derive(Clone)]
pub struct MockVolumeAccessor {
    inner: Arc<MockVolumesInner>,
}

impl Default for MockVolumeAccessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVolumeAccessor {
    /// Creates an empty mock; watchers fire only when the test says so.
    #[must_use]
    pub fn new() -> Self {
        let (volumes_tx, volumes_rx) = channel();
        let (attachments_tx, attachments_rx) = channel();
        let (block_devices_tx, block_devices_rx) = channel();
        Self {
            inner: Arc::new(MockVolumesInner {
                volumes_tx,
                volumes_rx: Mutex::new(Some(volumes_rx)),
                attachments_tx,
                attachments_rx: Mutex::new(Some(attachments_rx)),
                block_devices_tx,
                block_devices_rx: Mutex::new(Some(block_devices_rx)),
                provisioned_volumes: Mutex::new(BTreeMap::new()),
                provisioned_attachments: Mutex::new(BTreeMap::new()),
                provisioned_machines: Mutex::new(BTreeMap::new()),
                block_devices: Mutex::new(BTreeMap::new()),
                set_volume_info: Mutex::new(None),
                set_attachment_info: Mutex::new(None),
            }),
        }
    }

    /// Emits a volume change set.
    pub fn fire_volumes(&self, ids: &[&str]) {
        self.inner
            .volumes_tx
            .send(ids.iter().map(|id| (*id).to_owned()).collect());
    }

    /// Emits a volume-attachment change set.
    pub fn fire_attachments(&self, ids: Vec<VolumeAttachmentId>) {
        self.inner.attachments_tx.send(ids);
    }

    /// Emits a block-devices notification.
    pub fn fire_block_devices(&self) {
        self.inner.block_devices_tx.send(());
    }

    /// Seeds a provisioned volume.
    pub fn add_provisioned_volume(&self, volume: Volume) {
        self.inner
            .provisioned_volumes
            .lock()
            .expect("mock lock poisoned")
            .insert(volume.tag.clone(), volume);
    }

    /// Seeds a provisioned attachment (as left by a previous session).
    pub fn add_provisioned_attachment(&self, attachment: VolumeAttachment) {
        let id = AttachmentId::new(attachment.machine.clone(), attachment.volume.clone());
        self.inner
            .provisioned_attachments
            .lock()
            .expect("mock lock poisoned")
            .insert(id, attachment);
    }

    /// Seeds a provisioned machine.
    pub fn add_provisioned_machine(&self, tag: &MachineTag, instance_id: &str) {
        self.inner
            .provisioned_machines
            .lock()
            .expect("mock lock poisoned")
            .insert(tag.clone(), InstanceId::new(instance_id));
    }

    /// Seeds a block device visible for an attachment.
    pub fn add_block_device(&self, id: VolumeAttachmentId, device: BlockDevice) {
        self.inner
            .block_devices
            .lock()
            .expect("mock lock poisoned")
            .insert(id, device);
    }

    /// Installs the `set_volume_info` handler.
    pub fn on_set_volume_info(&self, handler: SetHandler<Volume>) {
        *self
            .inner
            .set_volume_info
            .lock()
            .expect("mock lock poisoned") = Some(handler);
    }

    /// Installs the `set_volume_attachment_info` handler.
    pub fn on_set_volume_attachment_info(&self, handler: SetHandler<VolumeAttachment>) {
        *self
            .inner
            .set_attachment_info
            .lock()
            .expect("mock lock poisoned") = Some(handler);
    }
}

impl VolumeAccessor for MockVolumeAccessor {
    fn watch_volumes(&self) -> StringsWatcher {
        self.inner
            .volumes_rx
            .lock()
            .expect("mock lock poisoned")
            .take()
            .expect("volumes watcher already taken")
    }

    fn watch_volume_attachments(&self) -> Watcher<Vec<VolumeAttachmentId>> {
        self.inner
            .attachments_rx
            .lock()
            .expect("mock lock poisoned")
            .take()
            .expect("attachments watcher already taken")
    }

    fn watch_block_devices(&self, _machine: &MachineTag) -> NotifyWatcher {
        self.inner
            .block_devices_rx
            .lock()
            .expect("mock lock poisoned")
            .take()
            .expect("block devices watcher already taken")
    }

    fn volumes<'a>(
        &'a self,
        tags: &'a [VolumeTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<Volume>>> {
        Box::pin(async move {
            let provisioned = self
                .inner
                .provisioned_volumes
                .lock()
                .expect("mock lock poisoned");
            Ok(tags
                .iter()
                .map(|tag| {
                    provisioned
                        .get(tag)
                        .cloned()
                        .ok_or_else(|| LookupError::NotProvisioned(format!("volume \"{tag}\"")))
                })
                .collect())
        })
    }

    fn volume_attachments<'a>(
        &'a self,
        ids: &'a [VolumeAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<VolumeAttachment>>> {
        Box::pin(async move {
            let provisioned = self
                .inner
                .provisioned_attachments
                .lock()
                .expect("mock lock poisoned");
            Ok(ids
                .iter()
                .map(|id| {
                    provisioned.get(id).cloned().ok_or_else(|| {
                        LookupError::NotProvisioned(format!(
                            "volume attachment \"{}\" on \"{}\"",
                            id.attachment, id.machine
                        ))
                    })
                })
                .collect())
        })
    }

    fn volume_params<'a>(
        &'a self,
        tags: &'a [VolumeTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<VolumeParams>>> {
        Box::pin(async move {
            let machines = self
                .inner
                .provisioned_machines
                .lock()
                .expect("mock lock poisoned");
            let target = machine("1");
            Ok(tags
                .iter()
                .map(|tag| {
                    let mut attributes = BTreeMap::new();
                    if tag.id() == "1" {
                        attributes.insert(String::from("persistent"), json!(true));
                    }
                    Ok(VolumeParams {
                        tag: tag.clone(),
                        size: 1024,
                        provider: String::from("dummy"),
                        attributes,
                        resource_tags: BTreeMap::new(),
                        attachment: Some(VolumeAttachmentParams {
                            volume: tag.clone(),
                            volume_id: None,
                            machine: target.clone(),
                            instance_id: machines.get(&target).cloned(),
                            provider: String::from("dummy"),
                            read_only: tag.id() == "1",
                        }),
                    })
                })
                .collect())
        })
    }

    fn volume_attachment_params<'a>(
        &'a self,
        ids: &'a [VolumeAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<VolumeAttachmentParams>>> {
        Box::pin(async move {
            let machines = self
                .inner
                .provisioned_machines
                .lock()
                .expect("mock lock poisoned");
            let volumes = self
                .inner
                .provisioned_volumes
                .lock()
                .expect("mock lock poisoned");
            Ok(ids
                .iter()
                .map(|id| {
                    Ok(VolumeAttachmentParams {
                        volume: id.attachment.clone(),
                        volume_id: volumes
                            .get(&id.attachment)
                            .map(|volume| volume.info.volume_id.clone()),
                        machine: id.machine.clone(),
                        instance_id: machines.get(&id.machine).cloned(),
                        provider: String::from("dummy"),
                        read_only: id.attachment.id() == "1",
                    })
                })
                .collect())
        })
    }

    fn block_devices<'a>(
        &'a self,
        ids: &'a [VolumeAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<BlockDevice>>> {
        Box::pin(async move {
            let devices = self.inner.block_devices.lock().expect("mock lock poisoned");
            Ok(ids
                .iter()
                .map(|id| {
                    devices.get(id).cloned().ok_or_else(|| {
                        LookupError::NotFound(format!(
                            "block device for volume \"{}\" on machine {}",
                            id.attachment, id.machine
                        ))
                    })
                })
                .collect())
        })
    }

    fn set_volume_info<'a>(
        &'a self,
        volumes: &'a [Volume],
    ) -> AccessorFuture<'a, Vec<ItemResult>> {
        Box::pin(async move {
            let mut handler = self
                .inner
                .set_volume_info
                .lock()
                .expect("mock lock poisoned");
            match handler.as_mut() {
                Some(handler) => handler(volumes),
                None => default_outcomes(volumes),
            }
        })
    }

    fn set_volume_attachment_info<'a>(
        &'a self,
        attachments: &'a [VolumeAttachment],
    ) -> AccessorFuture<'a, Vec<ItemResult>> {
        Box::pin(async move {
            let mut handler = self
                .inner
                .set_attachment_info
                .lock()
                .expect("mock lock poisoned");
            match handler.as_mut() {
                Some(handler) => handler(attachments),
                None => default_outcomes(attachments),
            }
        })
    }
}

struct MockFilesystemsInner {
    filesystems_tx: WatcherSender<Vec<String>>,
    filesystems_rx: Mutex<Option<StringsWatcher>>,
    attachments_tx: WatcherSender<Vec<FilesystemAttachmentId>>,
    attachments_rx: Mutex<Option<Watcher<Vec<FilesystemAttachmentId>>>>,
    provisioned_filesystems: Mutex<BTreeMap<FilesystemTag, Filesystem>>,
    provisioned_machines: Mutex<BTreeMap<MachineTag, InstanceId>>,
    set_filesystem_info: Mutex<Option<SetHandler<Filesystem>>>,
    set_attachment_info: Mutex<Option<SetHandler<FilesystemAttachment>>>,
}

/// Scripted [`FilesystemAccessor`].
#[derive(Clone)]
pub struct MockFilesystemAccessor {
    inner: Arc<MockFilesystemsInner>,
}

impl Default for MockFilesystemAccessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFilesystemAccessor {
    /// Creates an empty mock; watchers fire only when the test says so.
    #[must_use]
    pub fn new() -> Self {
        let (filesystems_tx, filesystems_rx) = channel();
        let (attachments_tx, attachments_rx) = channel();
        Self {
            inner: Arc::new(MockFilesystemsInner {
                filesystems_tx,
                filesystems_rx: Mutex::new(Some(filesystems_rx)),
                attachments_tx,
                attachments_rx: Mutex::new(Some(attachments_rx)),
                provisioned_filesystems: Mutex::new(BTreeMap::new()),
                provisioned_machines: Mutex::new(BTreeMap::new()),
                set_filesystem_info: Mutex::new(None),
                set_attachment_info: Mutex::new(None),
            }),
        }
    }

    /// Emits a filesystem change set.
    pub fn fire_filesystems(&self, ids: &[&str]) {
        self.inner
            .filesystems_tx
            .send(ids.iter().map(|id| (*id).to_owned()).collect());
    }

    /// Emits a filesystem-attachment change set.
    pub fn fire_attachments(&self, ids: Vec<FilesystemAttachmentId>) {
        self.inner.attachments_tx.send(ids);
    }

    /// Seeds a provisioned filesystem.
    pub fn add_provisioned_filesystem(&self, filesystem: Filesystem) {
        self.inner
            .provisioned_filesystems
            .lock()
            .expect("mock lock poisoned")
            .insert(filesystem.tag.clone(), filesystem);
    }

    /// Seeds a provisioned machine.
    pub fn add_provisioned_machine(&self, tag: &MachineTag, instance_id: &str) {
        self.inner
            .provisioned_machines
            .lock()
            .expect("mock lock poisoned")
            .insert(tag.clone(), InstanceId::new(instance_id));
    }

    /// Installs the `set_filesystem_info` handler.
    pub fn on_set_filesystem_info(&self, handler: SetHandler<Filesystem>) {
        *self
            .inner
            .set_filesystem_info
            .lock()
            .expect("mock lock poisoned") = Some(handler);
    }

    /// Installs the `set_filesystem_attachment_info` handler.
    pub fn on_set_filesystem_attachment_info(&self, handler: SetHandler<FilesystemAttachment>) {
        *self
            .inner
            .set_attachment_info
            .lock()
            .expect("mock lock poisoned") = Some(handler);
    }
}

impl FilesystemAccessor for MockFilesystemAccessor {
    fn watch_filesystems(&self) -> StringsWatcher {
        self.inner
            .filesystems_rx
            .lock()
            .expect("mock lock poisoned")
            .take()
            .expect("filesystems watcher already taken")
    }

    fn watch_filesystem_attachments(&self) -> Watcher<Vec<FilesystemAttachmentId>> {
        self.inner
            .attachments_rx
            .lock()
            .expect("mock lock poisoned")
            .take()
            .expect("attachments watcher already taken")
    }

    fn filesystems<'a>(
        &'a self,
        tags: &'a [FilesystemTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<Filesystem>>> {
        Box::pin(async move {
            let provisioned = self
                .inner
                .provisioned_filesystems
                .lock()
                .expect("mock lock poisoned");
            Ok(tags
                .iter()
                .map(|tag| {
                    provisioned.get(tag).cloned().ok_or_else(|| {
                        LookupError::NotProvisioned(format!("filesystem \"{tag}\""))
                    })
                })
                .collect())
        })
    }

    fn filesystem_attachments<'a>(
        &'a self,
        ids: &'a [FilesystemAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<FilesystemAttachment>>> {
        Box::pin(async move {
            Ok(ids
                .iter()
                .map(|id| {
                    Err(LookupError::NotProvisioned(format!(
                        "filesystem attachment \"{}\" on \"{}\"",
                        id.attachment, id.machine
                    )))
                })
                .collect())
        })
    }

    fn filesystem_params<'a>(
        &'a self,
        tags: &'a [FilesystemTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<FilesystemParams>>> {
        Box::pin(async move {
            Ok(tags
                .iter()
                .map(|tag| {
                    // Machine-scoped filesystems are volume-backed by the
                    // volume with the same id; environment-scoped ones
                    // come straight from the provider.
                    let backing = tag.machine().map(|_| volume(tag.id()));
                    Ok(FilesystemParams {
                        tag: tag.clone(),
                        backing_volume: backing,
                        size: 1024,
                        provider: String::from("dummy"),
                        attributes: BTreeMap::new(),
                        resource_tags: BTreeMap::new(),
                    })
                })
                .collect())
        })
    }

    fn filesystem_attachment_params<'a>(
        &'a self,
        ids: &'a [FilesystemAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<FilesystemAttachmentParams>>> {
        Box::pin(async move {
            let machines = self
                .inner
                .provisioned_machines
                .lock()
                .expect("mock lock poisoned");
            Ok(ids
                .iter()
                .map(|id| {
                    Ok(FilesystemAttachmentParams {
                        filesystem: id.attachment.clone(),
                        filesystem_id: None,
                        backing_volume: None,
                        machine: id.machine.clone(),
                        instance_id: machines.get(&id.machine).cloned(),
                        provider: String::from("dummy"),
                        mount_point: None,
                        read_only: false,
                    })
                })
                .collect())
        })
    }

    fn set_filesystem_info<'a>(
        &'a self,
        filesystems: &'a [Filesystem],
    ) -> AccessorFuture<'a, Vec<ItemResult>> {
        Box::pin(async move {
            let mut handler = self
                .inner
                .set_filesystem_info
                .lock()
                .expect("mock lock poisoned");
            match handler.as_mut() {
                Some(handler) => handler(filesystems),
                None => default_outcomes(filesystems),
            }
        })
    }

    fn set_filesystem_attachment_info<'a>(
        &'a self,
        attachments: &'a [FilesystemAttachment],
    ) -> AccessorFuture<'a, Vec<ItemResult>> {
        Box::pin(async move {
            let mut handler = self
                .inner
                .set_attachment_info
                .lock()
                .expect("mock lock poisoned");
            match handler.as_mut() {
                Some(handler) => handler(attachments),
                None => default_outcomes(attachments),
            }
        })
    }
}

struct MockMachinesInner {
    instance_ids: Mutex<BTreeMap<MachineTag, InstanceId>>,
    watchers: Mutex<Vec<WatcherSender<()>>>,
}

/// Scripted [`MachineAccessor`].
#[derive(Clone)]
pub struct MockMachineAccessor {
    inner: Arc<MockMachinesInner>,
}

impl Default for MockMachineAccessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMachineAccessor {
    /// Creates an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockMachinesInner {
                instance_ids: Mutex::new(BTreeMap::new()),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Records an instance id for a machine.
    pub fn set_instance_id(&self, tag: &MachineTag, instance_id: &str) {
        self.inner
            .instance_ids
            .lock()
            .expect("mock lock poisoned")
            .insert(tag.clone(), InstanceId::new(instance_id));
    }

    /// Fires every machine watcher handed out so far.
    pub fn fire(&self) {
        self.inner
            .watchers
            .lock()
            .expect("mock lock poisoned")
            .retain(|tx| tx.send(()));
    }
}

impl MachineAccessor for MockMachineAccessor {
    fn instance_ids<'a>(
        &'a self,
        machines: &'a [MachineTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<InstanceId>>> {
        Box::pin(async move {
            let ids = self.inner.instance_ids.lock().expect("mock lock poisoned");
            Ok(machines
                .iter()
                .map(|machine| {
                    ids.get(machine)
                        .cloned()
                        .ok_or_else(|| LookupError::NotProvisioned(format!("machine {machine}")))
                })
                .collect())
        })
    }

    fn watch_machine(&self, _machine: &MachineTag) -> NotifyWatcher {
        let (tx, rx) = channel();
        self.inner
            .watchers
            .lock()
            .expect("mock lock poisoned")
            .push(tx);
        rx
    }
}

struct MockEnvironInner {
    config: Mutex<EnvironConfig>,
    watcher_tx: WatcherSender<()>,
    watcher_rx: Mutex<Option<NotifyWatcher>>,
}

/// Scripted [`EnvironAccessor`].
#[derive(Clone)]
pub struct MockEnvironAccessor {
    inner: Arc<MockEnvironInner>,
}

impl Default for MockEnvironAccessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEnvironAccessor {
    /// Creates a mock with a config carrying the standard test resource
    /// tags.
    #[must_use]
    pub fn new() -> Self {
        let (watcher_tx, watcher_rx) = channel();
        let config = EnvironConfig::new(
            "testenv",
            BTreeMap::from([(String::from("resource-tags"), json!({"very": "fancy"}))]),
        );
        Self {
            inner: Arc::new(MockEnvironInner {
                config: Mutex::new(config),
                watcher_tx,
                watcher_rx: Mutex::new(Some(watcher_rx)),
            }),
        }
    }

    /// Returns the current config.
    #[must_use]
    pub fn config(&self) -> EnvironConfig {
        self.inner.config.lock().expect("mock lock poisoned").clone()
    }

    /// Replaces the config delivered by `model_config`.
    pub fn set_config(&self, config: EnvironConfig) {
        *self.inner.config.lock().expect("mock lock poisoned") = config;
    }

    /// Emits an environ change notification.
    pub fn fire(&self) {
        self.inner.watcher_tx.send(());
    }
}

impl EnvironAccessor for MockEnvironAccessor {
    fn watch_environ(&self) -> NotifyWatcher {
        self.inner
            .watcher_rx
            .lock()
            .expect("mock lock poisoned")
            .take()
            .expect("environ watcher already taken")
    }

    fn model_config(&self) -> AccessorFuture<'_, EnvironConfig> {
        Box::pin(async move { Ok(self.config()) })
    }
}

/// Lifecycle manager reporting everything alive.
#[derive(Clone, Default)]
pub struct MockLifecycleManager;

impl LifecycleManager for MockLifecycleManager {
    fn volume_life<'a>(
        &'a self,
        tags: &'a [VolumeTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<Life>>> {
        Box::pin(async move { Ok(tags.iter().map(|_| Ok(Life::Alive)).collect()) })
    }

    fn filesystem_life<'a>(
        &'a self,
        tags: &'a [FilesystemTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<Life>>> {
        Box::pin(async move { Ok(tags.iter().map(|_| Ok(Life::Alive)).collect()) })
    }
}
