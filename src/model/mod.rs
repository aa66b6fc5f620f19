//! Durable state model for storage entities.
//!
//! The model is a tag-indexed arena: machines, services, units, storage
//! instances, volumes, filesystems and attachments are stored in maps
//! keyed by tag, and reference one another by tag only. Mutations are
//! transactional with respect to a single [`State`] handle (one lock is
//! held for the duration of each operation) and publish change sets to
//! the streams described in the watch methods.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::provider::{
    BlockDevice, EnvironConfig, FilesystemAttachmentInfo, InstanceId, PoolConfig, ProviderScope,
    Registry, StorageKind, StorageProvider, VolumeAttachmentInfo,
};
use crate::tags::{
    AttachmentId, FilesystemAttachmentId, FilesystemTag, MachineTag, StorageTag, Tag, UnitTag,
    VolumeAttachmentId, VolumeTag,
};
use crate::watcher::{Fanout, NotifyWatcher, StringsWatcher, Watcher, WatcherSender, channel};

mod entity;
#[cfg(test)]
mod tests;

pub use entity::{
    Filesystem, FilesystemAttachment, FilesystemAttachmentParams, FilesystemInfo,
    FilesystemParams, Life, Machine, StorageAttachment, StorageConstraints, StorageDeclaration,
    StorageInstance, Volume, VolumeAttachment, VolumeAttachmentParams, VolumeInfo, VolumeParams,
};

/// Errors raised by state model operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// Raised when a service definition cannot be added.
    #[error("cannot add service \"{service}\": {source}")]
    AddService {
        /// Service being added.
        service: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
    /// Raised when a unit cannot be assigned to a machine.
    #[error("cannot assign unit \"{unit}\" to machine {machine}: {source}")]
    AssignUnit {
        /// Unit being assigned.
        unit: UnitTag,
        /// Target machine.
        machine: MachineTag,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
    /// Raised when volume info cannot be recorded.
    #[error("cannot set info for volume \"{volume}\": {source}")]
    SetVolumeInfo {
        /// Volume being provisioned.
        volume: VolumeTag,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
    /// Raised when filesystem info cannot be recorded.
    #[error("cannot set info for filesystem \"{filesystem}\": {source}")]
    SetFilesystemInfo {
        /// Filesystem being provisioned.
        filesystem: FilesystemTag,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
    /// Raised when volume attachment info cannot be recorded.
    #[error("cannot set info for volume attachment {volume}:{machine}: {source}")]
    SetVolumeAttachmentInfo {
        /// Volume half of the attachment.
        volume: VolumeTag,
        /// Machine half of the attachment.
        machine: MachineTag,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
    /// Raised when filesystem attachment info cannot be recorded.
    #[error("cannot set info for filesystem attachment {filesystem}:{machine}: {source}")]
    SetFilesystemAttachmentInfo {
        /// Filesystem half of the attachment.
        filesystem: FilesystemTag,
        /// Machine half of the attachment.
        machine: MachineTag,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
    /// Raised when a named pool is not configured.
    #[error("pool \"{0}\" not found")]
    PoolNotFound(String),
    /// Raised when a machine is unknown.
    #[error("machine {0} not found")]
    MachineNotFound(MachineTag),
    /// Raised when a machine has no instance id yet.
    #[error("machine {0} not provisioned")]
    MachineNotProvisioned(MachineTag),
    /// Raised when a service is unknown.
    #[error("service \"{0}\" not found")]
    ServiceNotFound(String),
    /// Raised when a unit is unknown.
    #[error("unit \"{0}\" not found")]
    UnitNotFound(UnitTag),
    /// Raised when a unit is assigned a second time.
    #[error("unit \"{unit}\" already assigned to machine {machine}")]
    UnitAlreadyAssigned {
        /// Unit in question.
        unit: UnitTag,
        /// Machine it is already assigned to.
        machine: MachineTag,
    },
    /// Raised when a unit has not been assigned to a machine.
    #[error("unit \"{0}\" not assigned to a machine")]
    UnitNotAssigned(UnitTag),
    /// Raised when a storage instance is unknown.
    #[error("storage instance \"{0}\" not found")]
    StorageInstanceNotFound(StorageTag),
    /// Raised when a storage attachment is unknown.
    #[error("storage attachment \"{storage}\" on unit \"{unit}\" not found")]
    StorageAttachmentNotFound {
        /// Storage instance half of the pair.
        storage: StorageTag,
        /// Unit half of the pair.
        unit: UnitTag,
    },
    /// Raised when no filesystem is assigned to a storage instance.
    #[error("filesystem for storage instance \"{0}\" not found")]
    StorageInstanceFilesystemNotFound(StorageTag),
    /// Raised when no volume is assigned to a storage instance.
    #[error("volume for storage instance \"{0}\" not found")]
    StorageInstanceVolumeNotFound(StorageTag),
    /// Raised when a volume is unknown.
    #[error("volume \"{0}\" not found")]
    VolumeNotFound(VolumeTag),
    /// Raised when a volume has params but no info.
    #[error("volume \"{0}\" not provisioned")]
    VolumeNotProvisioned(VolumeTag),
    /// Raised when a volume is not assigned to a storage instance.
    #[error("volume \"{0}\" not assigned to any storage instance")]
    VolumeUnassigned(VolumeTag),
    /// Raised when a filesystem is unknown.
    #[error("filesystem \"{0}\" not found")]
    FilesystemNotFound(FilesystemTag),
    /// Raised when a filesystem has params but no info.
    #[error("filesystem \"{0}\" not provisioned")]
    FilesystemNotProvisioned(FilesystemTag),
    /// Raised when a filesystem is not assigned to a storage instance.
    #[error("filesystem \"{0}\" not assigned to any storage instance")]
    FilesystemUnassigned(FilesystemTag),
    /// Raised when a volume attachment is unknown.
    #[error("volume attachment \"{volume}\" on \"{machine}\" not found")]
    VolumeAttachmentNotFound {
        /// Volume half of the pair.
        volume: VolumeTag,
        /// Machine half of the pair.
        machine: MachineTag,
    },
    /// Raised when a volume attachment has params but no info.
    #[error("volume attachment \"{volume}\" on \"{machine}\" not provisioned")]
    VolumeAttachmentNotProvisioned {
        /// Volume half of the pair.
        volume: VolumeTag,
        /// Machine half of the pair.
        machine: MachineTag,
    },
    /// Raised when a filesystem attachment is unknown.
    #[error("filesystem attachment \"{filesystem}\" on \"{machine}\" not found")]
    FilesystemAttachmentNotFound {
        /// Filesystem half of the pair.
        filesystem: FilesystemTag,
        /// Machine half of the pair.
        machine: MachineTag,
    },
    /// Raised when a filesystem attachment has params but no info.
    #[error("filesystem attachment \"{filesystem}\" on \"{machine}\" not provisioned")]
    FilesystemAttachmentNotProvisioned {
        /// Filesystem half of the pair.
        filesystem: FilesystemTag,
        /// Machine half of the pair.
        machine: MachineTag,
    },
    /// Raised on `volume()` for a filesystem with no backing volume.
    #[error("filesystem has no backing volume")]
    NoBackingVolume,
    /// Raised when provisioned info would change an immutable field.
    #[error("cannot change {field} from \"{from}\" to \"{to}\"")]
    ImmutableField {
        /// Field that may not change (`pool`, `volume id`, `size`).
        field: &'static str,
        /// Previously recorded value.
        from: String,
        /// Rejected new value.
        to: String,
    },
    /// Raised when assigning storage from a non-dynamic provider to an
    /// existing machine.
    #[error("{provider} storage provider does not support dynamic storage")]
    StaticStorageProvider {
        /// Provider selected by the pool.
        provider: String,
    },
    /// Raised when assigning storage to a container machine.
    #[error("adding storage to {container} container not supported")]
    ContainerStorage {
        /// Container type of the target machine.
        container: String,
    },
}

impl Error {
    /// Whether the error is a not-found lookup failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PoolNotFound(_)
                | Self::MachineNotFound(_)
                | Self::ServiceNotFound(_)
                | Self::UnitNotFound(_)
                | Self::StorageInstanceNotFound(_)
                | Self::StorageAttachmentNotFound { .. }
                | Self::StorageInstanceFilesystemNotFound(_)
                | Self::StorageInstanceVolumeNotFound(_)
                | Self::VolumeNotFound(_)
                | Self::FilesystemNotFound(_)
                | Self::VolumeAttachmentNotFound { .. }
                | Self::FilesystemAttachmentNotFound { .. }
        )
    }

    /// Whether the error is a not-provisioned deferral signal.
    #[must_use]
    pub fn is_not_provisioned(&self) -> bool {
        matches!(
            self,
            Self::MachineNotProvisioned(_)
                | Self::VolumeNotProvisioned(_)
                | Self::FilesystemNotProvisioned(_)
                | Self::VolumeAttachmentNotProvisioned { .. }
                | Self::FilesystemAttachmentNotProvisioned { .. }
        )
    }
}

/// Policy selecting the machine a unit is assigned to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AssignmentPolicy {
    /// Provision a fresh machine for the unit.
    CleanEmpty,
}

struct ServiceEntity {
    storage: BTreeMap<String, StorageDeclaration>,
    next_unit: u64,
}

struct UnitEntity {
    service: String,
    machine: Option<MachineTag>,
    storage: Vec<StorageTag>,
}

struct MachineEntity {
    instance_id: Option<InstanceId>,
    container_type: Option<String>,
    block_devices: BTreeMap<VolumeTag, BlockDevice>,
    life: Life,
}

struct StorageInstanceEntity {
    kind: StorageKind,
    owner: UnitTag,
    pool: String,
    size: u64,
    life: Life,
}

struct VolumeEntity {
    storage: Option<StorageTag>,
    params: Option<VolumeParams>,
    info: Option<VolumeInfo>,
    life: Life,
}

struct FilesystemEntity {
    storage: Option<StorageTag>,
    backing_volume: Option<VolumeTag>,
    params: Option<FilesystemParams>,
    info: Option<FilesystemInfo>,
    life: Life,
}

struct VolumeAttachmentEntity {
    params: Option<VolumeAttachmentParams>,
    info: Option<VolumeAttachmentInfo>,
    life: Life,
}

struct FilesystemAttachmentEntity {
    params: Option<FilesystemAttachmentParams>,
    info: Option<FilesystemAttachmentInfo>,
    life: Life,
}

#[derive(Default)]
struct Watchers {
    environ_volumes: Fanout<Vec<String>>,
    machine_volumes: Vec<(MachineTag, WatcherSender<Vec<String>>)>,
    environ_filesystems: Fanout<Vec<String>>,
    machine_filesystems: Vec<(MachineTag, WatcherSender<Vec<String>>)>,
    environ_volume_attachments: Fanout<Vec<VolumeAttachmentId>>,
    machine_volume_attachments: Vec<(MachineTag, WatcherSender<Vec<VolumeAttachmentId>>)>,
    environ_filesystem_attachments: Fanout<Vec<FilesystemAttachmentId>>,
    machine_filesystem_attachments: Vec<(MachineTag, WatcherSender<Vec<FilesystemAttachmentId>>)>,
    volume_attachment_notify: Vec<(VolumeAttachmentId, WatcherSender<()>)>,
    filesystem_attachment_notify: Vec<(FilesystemAttachmentId, WatcherSender<()>)>,
    machine_notify: Vec<(MachineTag, WatcherSender<()>)>,
    block_devices_notify: Vec<(MachineTag, WatcherSender<()>)>,
    environ_notify: Fanout<()>,
}

struct Inner {
    environ: EnvironConfig,
    pools: BTreeMap<String, PoolConfig>,
    machines: BTreeMap<MachineTag, MachineEntity>,
    services: BTreeMap<String, ServiceEntity>,
    units: BTreeMap<UnitTag, UnitEntity>,
    storage_instances: BTreeMap<StorageTag, StorageInstanceEntity>,
    storage_attachments: BTreeMap<(StorageTag, UnitTag), Life>,
    volumes: BTreeMap<VolumeTag, VolumeEntity>,
    filesystems: BTreeMap<FilesystemTag, FilesystemEntity>,
    volume_attachments: BTreeMap<VolumeAttachmentId, VolumeAttachmentEntity>,
    filesystem_attachments: BTreeMap<FilesystemAttachmentId, FilesystemAttachmentEntity>,
    next_machine: u64,
    next_storage: u64,
    next_volume: u64,
    next_filesystem: u64,
    container_sequences: BTreeMap<(MachineTag, String), u64>,
    watchers: Watchers,
}

/// Handle to the shared state model.
#[derive(Clone)]
pub struct State {
    inner: Arc<Mutex<Inner>>,
    registry: Registry,
}

impl State {
    /// Creates a model with the given provider registry, pool
    /// configurations, and initial environment configuration.
    #[must_use]
    pub fn new(registry: Registry, pools: Vec<PoolConfig>, environ: EnvironConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                environ,
                pools: pools
                    .into_iter()
                    .map(|pool| (pool.name.clone(), pool))
                    .collect(),
                machines: BTreeMap::new(),
                services: BTreeMap::new(),
                units: BTreeMap::new(),
                storage_instances: BTreeMap::new(),
                storage_attachments: BTreeMap::new(),
                volumes: BTreeMap::new(),
                filesystems: BTreeMap::new(),
                volume_attachments: BTreeMap::new(),
                filesystem_attachments: BTreeMap::new(),
                next_machine: 0,
                next_storage: 0,
                next_volume: 0,
                next_filesystem: 0,
                container_sequences: BTreeMap::new(),
                watchers: Watchers::default(),
            })),
            registry,
        }
    }

    /// Returns the registry this model resolves providers against.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("state lock poisoned")
    }

    fn pool_provider(
        &self,
        inner: &Inner,
        pool: &str,
    ) -> Result<(PoolConfig, Arc<dyn StorageProvider>), Error> {
        let config = inner
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| Error::PoolNotFound(pool.to_owned()))?;
        let provider = self
            .registry
            .lookup(&config.provider)
            .map_err(|_| Error::PoolNotFound(pool.to_owned()))?;
        Ok((config, provider))
    }

    /// Returns the configuration of a named pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolNotFound`] for unknown pools.
    pub fn pool(&self, name: &str) -> Result<PoolConfig, Error> {
        let inner = self.lock();
        inner
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PoolNotFound(name.to_owned()))
    }

    /// Returns the machines a volume is attached to.
    #[must_use]
    pub fn volume_attachment_machines(&self, volume: &VolumeTag) -> Vec<MachineTag> {
        let inner = self.lock();
        inner
            .volume_attachments
            .keys()
            .filter(|id| &id.attachment == volume)
            .map(|id| id.machine.clone())
            .collect()
    }

    // ----- environment configuration -----

    /// Returns the current environment configuration.
    #[must_use]
    pub fn environ_config(&self) -> EnvironConfig {
        self.lock().environ.clone()
    }

    /// Merges `overrides` into the environment configuration and wakes
    /// environ watchers.
    pub fn update_environ_config(
        &self,
        overrides: BTreeMap<String, serde_json::Value>,
    ) -> EnvironConfig {
        let mut inner = self.lock();
        inner.environ = inner.environ.apply(overrides);
        inner.watchers.environ_notify.publish(&());
        inner.environ.clone()
    }

    /// Watches for environment configuration changes. The initial event
    /// reports the current configuration.
    #[must_use]
    pub fn watch_environ(&self) -> NotifyWatcher {
        self.lock().watchers.environ_notify.subscribe(())
    }

    // ----- machines -----

    /// Adds a host machine and returns its tag.
    #[must_use]
    pub fn add_machine(&self) -> MachineTag {
        let mut inner = self.lock();
        let tag = next_machine_tag(&mut inner);
        inner.machines.insert(
            tag.clone(),
            MachineEntity {
                instance_id: None,
                container_type: None,
                block_devices: BTreeMap::new(),
                life: Life::Alive,
            },
        );
        tag
    }

    /// Adds a container machine nested inside `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MachineNotFound`] when the parent is unknown.
    pub fn add_machine_inside_machine(
        &self,
        parent: &MachineTag,
        container_type: &str,
    ) -> Result<MachineTag, Error> {
        let mut inner = self.lock();
        if !inner.machines.contains_key(parent) {
            return Err(Error::MachineNotFound(parent.clone()));
        }
        let key = (parent.clone(), container_type.to_owned());
        let seq = inner.container_sequences.entry(key).or_insert(0);
        let id = format!("{parent}/{container_type}/{seq}");
        *seq += 1;
        let tag = MachineTag::parse(&id).expect("constructed machine tag is valid");
        inner.machines.insert(
            tag.clone(),
            MachineEntity {
                instance_id: None,
                container_type: Some(container_type.to_owned()),
                block_devices: BTreeMap::new(),
                life: Life::Alive,
            },
        );
        Ok(tag)
    }

    /// Returns a snapshot of a machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MachineNotFound`] for unknown machines.
    pub fn machine(&self, tag: &MachineTag) -> Result<Machine, Error> {
        let inner = self.lock();
        let machine = inner
            .machines
            .get(tag)
            .ok_or_else(|| Error::MachineNotFound(tag.clone()))?;
        Ok(Machine {
            tag: tag.clone(),
            instance_id: machine.instance_id.clone(),
            block_devices: machine.block_devices.clone(),
            life: machine.life,
        })
    }

    /// Records a machine's instance id and wakes its watchers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MachineNotFound`] for unknown machines.
    pub fn set_machine_provisioned(
        &self,
        tag: &MachineTag,
        instance_id: InstanceId,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let machine = inner
            .machines
            .get_mut(tag)
            .ok_or_else(|| Error::MachineNotFound(tag.clone()))?;
        machine.instance_id = Some(instance_id);
        publish_keyed(&mut inner.watchers.machine_notify, tag, &());
        Ok(())
    }

    /// Replaces the set of block devices observed on a machine and wakes
    /// its block-device watchers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MachineNotFound`] for unknown machines.
    pub fn set_machine_block_devices(
        &self,
        tag: &MachineTag,
        devices: BTreeMap<VolumeTag, BlockDevice>,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let machine = inner
            .machines
            .get_mut(tag)
            .ok_or_else(|| Error::MachineNotFound(tag.clone()))?;
        machine.block_devices = devices;
        publish_keyed(&mut inner.watchers.block_devices_notify, tag, &());
        Ok(())
    }

    /// Returns the block device observed for a backing volume on a
    /// machine, if any.
    #[must_use]
    pub fn block_device(&self, machine: &MachineTag, volume: &VolumeTag) -> Option<BlockDevice> {
        let inner = self.lock();
        inner
            .machines
            .get(machine)
            .and_then(|entity| entity.block_devices.get(volume).cloned())
    }

    /// Watches a machine for provisioning changes. The initial event
    /// reports the current state.
    #[must_use]
    pub fn watch_machine(&self, tag: &MachineTag) -> NotifyWatcher {
        subscribe_keyed(&mut self.lock().watchers.machine_notify, tag.clone(), ())
    }

    /// Watches a machine's observed block devices. The initial event
    /// reports the current state.
    #[must_use]
    pub fn watch_block_devices(&self, tag: &MachineTag) -> NotifyWatcher {
        subscribe_keyed(
            &mut self.lock().watchers.block_devices_notify,
            tag.clone(),
            (),
        )
    }

    // ----- services and units -----

    /// Adds a service with the given storage declarations.
    ///
    /// Declarations with an empty pool default to `"rootfs"` for
    /// filesystem kind and `"loop"` for block kind; unknown pools are
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddService`] wrapping the underlying failure.
    pub fn add_service(
        &self,
        name: &str,
        storage: BTreeMap<String, StorageDeclaration>,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let mut resolved = BTreeMap::new();
        for (store, declaration) in storage {
            let pool = if declaration.constraints.pool.is_empty() {
                default_pool(declaration.kind).to_owned()
            } else {
                declaration.constraints.pool.clone()
            };
            if !inner.pools.contains_key(&pool) {
                return Err(Error::AddService {
                    service: name.to_owned(),
                    source: Box::new(Error::PoolNotFound(pool)),
                });
            }
            resolved.insert(
                store,
                StorageDeclaration {
                    kind: declaration.kind,
                    constraints: StorageConstraints {
                        pool,
                        ..declaration.constraints
                    },
                },
            );
        }
        inner.services.insert(
            name.to_owned(),
            ServiceEntity {
                storage: resolved,
                next_unit: 0,
            },
        );
        Ok(())
    }

    /// Returns the resolved storage constraints of a service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] for unknown services.
    pub fn storage_constraints(
        &self,
        service: &str,
    ) -> Result<BTreeMap<String, StorageConstraints>, Error> {
        let inner = self.lock();
        let entity = inner
            .services
            .get(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_owned()))?;
        Ok(entity
            .storage
            .iter()
            .map(|(store, declaration)| (store.clone(), declaration.constraints.clone()))
            .collect())
    }

    /// Adds a unit to a service, creating its storage instances and
    /// storage attachments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] for unknown services.
    pub fn add_unit(&self, service: &str) -> Result<UnitTag, Error> {
        let mut inner = self.lock();
        let entity = inner
            .services
            .get_mut(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_owned()))?;
        let unit_id = format!("{service}/{}", entity.next_unit);
        entity.next_unit += 1;
        let unit = UnitTag::parse(&unit_id).expect("constructed unit tag is valid");
        let declarations: Vec<(String, StorageDeclaration)> = entity
            .storage
            .iter()
            .map(|(store, declaration)| (store.clone(), declaration.clone()))
            .collect();

        let mut storage_tags = Vec::new();
        for (store, declaration) in declarations {
            for _ in 0..declaration.constraints.count {
                let id = format!("{store}/{}", inner.next_storage);
                inner.next_storage += 1;
                let tag = StorageTag::parse(&id).expect("constructed storage tag is valid");
                inner.storage_instances.insert(
                    tag.clone(),
                    StorageInstanceEntity {
                        kind: declaration.kind,
                        owner: unit.clone(),
                        pool: declaration.constraints.pool.clone(),
                        size: declaration.constraints.size,
                        life: Life::Alive,
                    },
                );
                inner
                    .storage_attachments
                    .insert((tag.clone(), unit.clone()), Life::Alive);
                storage_tags.push(tag);
            }
        }
        inner.units.insert(
            unit.clone(),
            UnitEntity {
                service: service.to_owned(),
                machine: None,
                storage: storage_tags,
            },
        );
        Ok(unit)
    }

    /// Assigns a unit to a machine chosen by `policy`, creating the
    /// volume and filesystem entities its storage requires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnitNotFound`] or [`Error::UnitAlreadyAssigned`].
    pub fn assign_unit(
        &self,
        unit: &UnitTag,
        policy: AssignmentPolicy,
    ) -> Result<MachineTag, Error> {
        let AssignmentPolicy::CleanEmpty = policy;
        let mut inner = self.lock();
        check_unit_unassigned(&inner, unit)?;
        let machine = next_machine_tag(&mut inner);
        inner.machines.insert(
            machine.clone(),
            MachineEntity {
                instance_id: None,
                container_type: None,
                block_devices: BTreeMap::new(),
                life: Life::Alive,
            },
        );
        self.assign(&mut inner, unit, &machine)?;
        Ok(machine)
    }

    /// Assigns a unit to an existing machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssignUnit`] when the machine is a container or
    /// a storage pool's provider does not support dynamic storage, and
    /// the usual lookup errors otherwise.
    pub fn assign_unit_to_machine(
        &self,
        unit: &UnitTag,
        machine: &MachineTag,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        check_unit_unassigned(&inner, unit)?;
        let machine_entity = inner
            .machines
            .get(machine)
            .ok_or_else(|| Error::MachineNotFound(machine.clone()))?;
        let wrap = |source: Error| Error::AssignUnit {
            unit: unit.clone(),
            machine: machine.clone(),
            source: Box::new(source),
        };

        let storage_tags = inner
            .units
            .get(unit)
            .ok_or_else(|| Error::UnitNotFound(unit.clone()))?
            .storage
            .clone();
        if !storage_tags.is_empty() {
            if let Some(container) = machine_entity.container_type.clone() {
                return Err(wrap(Error::ContainerStorage { container }));
            }
        }
        for tag in &storage_tags {
            let instance = inner
                .storage_instances
                .get(tag)
                .ok_or_else(|| Error::StorageInstanceNotFound(tag.clone()))?;
            let (_, provider) = self.pool_provider(&inner, &instance.pool.clone())?;
            if !provider.is_dynamic() {
                let pool = instance.pool.clone();
                let config = inner.pools.get(&pool).cloned();
                let provider_name =
                    config.map_or(pool, |pool_config| pool_config.provider);
                return Err(wrap(Error::StaticStorageProvider {
                    provider: provider_name,
                }));
            }
        }
        self.assign(&mut inner, unit, machine)
    }

    /// Creates the storage entities and attachments a unit's storage
    /// instances require on `machine`, then records the assignment.
    fn assign(
        &self,
        inner: &mut Inner,
        unit: &UnitTag,
        machine: &MachineTag,
    ) -> Result<(), Error> {
        let storage_tags = inner
            .units
            .get(unit)
            .ok_or_else(|| Error::UnitNotFound(unit.clone()))?
            .storage
            .clone();

        let mut changed_volumes = Vec::new();
        let mut changed_filesystems = Vec::new();
        let mut changed_volume_attachments = Vec::new();
        let mut changed_filesystem_attachments = Vec::new();

        for storage_tag in storage_tags {
            let (kind, pool, size) = {
                let instance = inner
                    .storage_instances
                    .get(&storage_tag)
                    .ok_or_else(|| Error::StorageInstanceNotFound(storage_tag.clone()))?;
                (instance.kind, instance.pool.clone(), instance.size)
            };
            let (_, provider) = self.pool_provider(inner, &pool)?;
            let scope_machine = match provider.scope() {
                ProviderScope::Machine => Some(machine.clone()),
                ProviderScope::Environ => None,
            };

            match kind {
                StorageKind::Block => {
                    let volume = find_storage_volume(inner, &storage_tag).map_or_else(
                        || {
                            let tag = next_volume_tag(inner, scope_machine.as_ref());
                            inner.volumes.insert(
                                tag.clone(),
                                VolumeEntity {
                                    storage: Some(storage_tag.clone()),
                                    params: Some(VolumeParams {
                                        pool: pool.clone(),
                                        size,
                                    }),
                                    info: None,
                                    life: Life::Alive,
                                },
                            );
                            changed_volumes.push(tag.clone());
                            tag
                        },
                        |tag| tag,
                    );
                    if attach_volume(inner, machine, &volume) {
                        changed_volume_attachments
                            .push(AttachmentId::new(machine.clone(), volume));
                    }
                }
                StorageKind::Filesystem => {
                    let backing = if provider.supports(StorageKind::Filesystem) {
                        None
                    } else {
                        // Block-only providers realise filesystems
                        // through a backing volume in the same pool.
                        Some(
                            find_storage_volume(inner, &storage_tag).map_or_else(
                                || {
                                    let tag =
                                        next_volume_tag(inner, scope_machine.as_ref());
                                    inner.volumes.insert(
                                        tag.clone(),
                                        VolumeEntity {
                                            storage: Some(storage_tag.clone()),
                                            params: Some(VolumeParams {
                                                pool: pool.clone(),
                                                size,
                                            }),
                                            info: None,
                                            life: Life::Alive,
                                        },
                                    );
                                    changed_volumes.push(tag.clone());
                                    tag
                                },
                                |tag| tag,
                            ),
                        )
                    };
                    let filesystem = find_storage_filesystem(inner, &storage_tag)
                        .map_or_else(
                            || {
                                let tag =
                                    next_filesystem_tag(inner, scope_machine.as_ref());
                                inner.filesystems.insert(
                                    tag.clone(),
                                    FilesystemEntity {
                                        storage: Some(storage_tag.clone()),
                                        backing_volume: backing.clone(),
                                        params: Some(FilesystemParams {
                                            pool: pool.clone(),
                                            size,
                                        }),
                                        info: None,
                                        life: Life::Alive,
                                    },
                                );
                                changed_filesystems.push(tag.clone());
                                tag
                            },
                            |tag| tag,
                        );
                    if let Some(volume) = backing {
                        if attach_volume(inner, machine, &volume) {
                            changed_volume_attachments
                                .push(AttachmentId::new(machine.clone(), volume));
                        }
                    }
                    if attach_filesystem(inner, machine, &filesystem) {
                        changed_filesystem_attachments
                            .push(AttachmentId::new(machine.clone(), filesystem));
                    }
                }
            }
        }

        let unit_entity = inner
            .units
            .get_mut(unit)
            .ok_or_else(|| Error::UnitNotFound(unit.clone()))?;
        unit_entity.machine = Some(machine.clone());

        emit_volume_changes(inner, &changed_volumes);
        emit_filesystem_changes(inner, &changed_filesystems);
        emit_volume_attachment_changes(inner, &changed_volume_attachments);
        emit_filesystem_attachment_changes(inner, &changed_filesystem_attachments);
        Ok(())
    }

    /// Returns the machine a unit is assigned to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnitNotAssigned`] before assignment.
    pub fn assigned_machine(&self, unit: &UnitTag) -> Result<MachineTag, Error> {
        let inner = self.lock();
        let entity = inner
            .units
            .get(unit)
            .ok_or_else(|| Error::UnitNotFound(unit.clone()))?;
        entity
            .machine
            .clone()
            .ok_or_else(|| Error::UnitNotAssigned(unit.clone()))
    }

    // ----- storage instances -----

    /// Returns a snapshot of a storage instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageInstanceNotFound`] for unknown instances.
    pub fn storage_instance(&self, tag: &StorageTag) -> Result<StorageInstance, Error> {
        let inner = self.lock();
        let entity = inner
            .storage_instances
            .get(tag)
            .ok_or_else(|| Error::StorageInstanceNotFound(tag.clone()))?;
        Ok(StorageInstance {
            tag: tag.clone(),
            kind: entity.kind,
            owner: entity.owner.clone(),
            pool: entity.pool.clone(),
            size: entity.size,
            life: entity.life,
        })
    }

    /// Returns the storage attachments of a unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnitNotFound`] for unknown units.
    pub fn unit_storage_attachments(
        &self,
        unit: &UnitTag,
    ) -> Result<Vec<StorageAttachment>, Error> {
        let inner = self.lock();
        if !inner.units.contains_key(unit) {
            return Err(Error::UnitNotFound(unit.clone()));
        }
        Ok(inner
            .storage_attachments
            .iter()
            .filter(|((_, attachment_unit), _)| attachment_unit == unit)
            .map(|((storage, attachment_unit), life)| StorageAttachment {
                storage: storage.clone(),
                unit: attachment_unit.clone(),
                life: *life,
            })
            .collect())
    }

    /// Returns the volume currently assigned to a storage instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageInstanceVolumeNotFound`] when no volume is
    /// assigned, including after the instance has been removed.
    pub fn storage_instance_volume(&self, tag: &StorageTag) -> Result<Volume, Error> {
        let inner = self.lock();
        let volume = find_storage_volume(&inner, tag)
            .ok_or_else(|| Error::StorageInstanceVolumeNotFound(tag.clone()))?;
        Ok(volume_snapshot(&inner, &volume))
    }

    /// Returns the filesystem currently assigned to a storage instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageInstanceFilesystemNotFound`] when no
    /// filesystem is assigned, including after the instance has been
    /// removed.
    pub fn storage_instance_filesystem(&self, tag: &StorageTag) -> Result<Filesystem, Error> {
        let inner = self.lock();
        let filesystem = find_storage_filesystem(&inner, tag)
            .ok_or_else(|| Error::StorageInstanceFilesystemNotFound(tag.clone()))?;
        Ok(filesystem_snapshot(&inner, &filesystem))
    }

    /// Marks a storage instance as dying. The associated volume or
    /// filesystem is unassigned only once the instance is removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageInstanceNotFound`] for unknown instances.
    pub fn destroy_storage_instance(&self, tag: &StorageTag) -> Result<(), Error> {
        let mut inner = self.lock();
        let entity = inner
            .storage_instances
            .get_mut(tag)
            .ok_or_else(|| Error::StorageInstanceNotFound(tag.clone()))?;
        if entity.life == Life::Alive {
            entity.life = Life::Dying;
        }
        Ok(())
    }

    /// Marks a storage attachment as dying.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageAttachmentNotFound`] for unknown pairs.
    pub fn destroy_storage_attachment(
        &self,
        storage: &StorageTag,
        unit: &UnitTag,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let life = inner
            .storage_attachments
            .get_mut(&(storage.clone(), unit.clone()))
            .ok_or_else(|| Error::StorageAttachmentNotFound {
                storage: storage.clone(),
                unit: unit.clone(),
            })?;
        if *life == Life::Alive {
            *life = Life::Dying;
        }
        Ok(())
    }

    /// Removes a storage attachment. When this was the last attachment of
    /// a dying instance, the instance is removed and its volume or
    /// filesystem is unassigned; the resource itself survives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageAttachmentNotFound`] for unknown pairs.
    pub fn remove_storage_attachment(
        &self,
        storage: &StorageTag,
        unit: &UnitTag,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        inner
            .storage_attachments
            .remove(&(storage.clone(), unit.clone()))
            .ok_or_else(|| Error::StorageAttachmentNotFound {
                storage: storage.clone(),
                unit: unit.clone(),
            })?;
        if let Some(unit_entity) = inner.units.get_mut(unit) {
            unit_entity.storage.retain(|tag| tag != storage);
        }

        let attachments_remain = inner
            .storage_attachments
            .keys()
            .any(|(attachment_storage, _)| attachment_storage == storage);
        let dying = inner
            .storage_instances
            .get(storage)
            .is_some_and(|instance| instance.life != Life::Alive);
        if !attachments_remain && dying {
            inner.storage_instances.remove(storage);
            for volume in inner.volumes.values_mut() {
                if volume.storage.as_ref() == Some(storage) {
                    volume.storage = None;
                }
            }
            for filesystem in inner.filesystems.values_mut() {
                if filesystem.storage.as_ref() == Some(storage) {
                    filesystem.storage = None;
                }
            }
        }
        Ok(())
    }

    // ----- volumes -----

    /// Returns a snapshot of a volume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VolumeNotFound`] for unknown volumes.
    pub fn volume(&self, tag: &VolumeTag) -> Result<Volume, Error> {
        let inner = self.lock();
        if !inner.volumes.contains_key(tag) {
            return Err(Error::VolumeNotFound(tag.clone()));
        }
        Ok(volume_snapshot(&inner, tag))
    }

    /// Returns the lifecycle state of a volume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VolumeNotFound`] for unknown volumes.
    pub fn volume_life(&self, tag: &VolumeTag) -> Result<Life, Error> {
        let inner = self.lock();
        inner
            .volumes
            .get(tag)
            .map(|volume| volume.life)
            .ok_or_else(|| Error::VolumeNotFound(tag.clone()))
    }

    /// Records provisioned info for a volume. A missing pool is taken
    /// from the params; pool, size and volume id are append-only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SetVolumeInfo`] wrapping the underlying failure.
    pub fn set_volume_info(&self, tag: &VolumeTag, info: VolumeInfo) -> Result<(), Error> {
        let mut inner = self.lock();
        let wrap = |source: Error| Error::SetVolumeInfo {
            volume: tag.clone(),
            source: Box::new(source),
        };
        let entity = inner
            .volumes
            .get(tag)
            .ok_or_else(|| wrap(Error::VolumeNotFound(tag.clone())))?;

        let resolved = match &entity.info {
            Some(existing) => merge_volume_info(existing, info).map_err(&wrap)?,
            None => {
                let mut info = info;
                if info.pool.is_none() {
                    info.pool = entity.params.as_ref().map(|params| params.pool.clone());
                }
                info
            }
        };
        let entity = inner
            .volumes
            .get_mut(tag)
            .ok_or_else(|| wrap(Error::VolumeNotFound(tag.clone())))?;
        entity.info = Some(resolved);
        entity.params = None;
        emit_volume_changes(&mut inner, std::slice::from_ref(tag));
        Ok(())
    }

    /// Returns a snapshot of a volume attachment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VolumeAttachmentNotFound`] for unknown pairs.
    pub fn volume_attachment(
        &self,
        machine: &MachineTag,
        volume: &VolumeTag,
    ) -> Result<VolumeAttachment, Error> {
        let inner = self.lock();
        let id = AttachmentId::new(machine.clone(), volume.clone());
        let entity =
            inner
                .volume_attachments
                .get(&id)
                .ok_or_else(|| Error::VolumeAttachmentNotFound {
                    volume: volume.clone(),
                    machine: machine.clone(),
                })?;
        Ok(VolumeAttachment {
            volume: volume.clone(),
            machine: machine.clone(),
            params: entity.params.clone(),
            info: entity.info.clone(),
            life: entity.life,
        })
    }

    /// Records provisioned info for a volume attachment. Requires the
    /// volume to be provisioned and the machine to have an instance id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SetVolumeAttachmentInfo`] wrapping the underlying
    /// failure.
    pub fn set_volume_attachment_info(
        &self,
        machine: &MachineTag,
        volume: &VolumeTag,
        info: VolumeAttachmentInfo,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let id = AttachmentId::new(machine.clone(), volume.clone());
        let wrap = |source: Error| Error::SetVolumeAttachmentInfo {
            volume: volume.clone(),
            machine: machine.clone(),
            source: Box::new(source),
        };
        if !inner.volume_attachments.contains_key(&id) {
            return Err(wrap(Error::VolumeAttachmentNotFound {
                volume: volume.clone(),
                machine: machine.clone(),
            }));
        }
        let provisioned = inner
            .volumes
            .get(volume)
            .is_some_and(|entity| entity.info.is_some());
        if !provisioned {
            return Err(wrap(Error::VolumeNotProvisioned(volume.clone())));
        }
        check_machine_provisioned(&inner, machine).map_err(&wrap)?;
        let entity = inner
            .volume_attachments
            .get_mut(&id)
            .ok_or_else(|| wrap(Error::VolumeAttachmentNotFound {
                volume: volume.clone(),
                machine: machine.clone(),
            }))?;
        entity.info = Some(info);
        entity.params = None;
        emit_volume_attachment_changes(&mut inner, std::slice::from_ref(&id));
        Ok(())
    }

    // ----- filesystems -----

    /// Returns a snapshot of a filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilesystemNotFound`] for unknown filesystems.
    pub fn filesystem(&self, tag: &FilesystemTag) -> Result<Filesystem, Error> {
        let inner = self.lock();
        if !inner.filesystems.contains_key(tag) {
            return Err(Error::FilesystemNotFound(tag.clone()));
        }
        Ok(filesystem_snapshot(&inner, tag))
    }

    /// Returns the lifecycle state of a filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilesystemNotFound`] for unknown filesystems.
    pub fn filesystem_life(&self, tag: &FilesystemTag) -> Result<Life, Error> {
        let inner = self.lock();
        inner
            .filesystems
            .get(tag)
            .map(|filesystem| filesystem.life)
            .ok_or_else(|| Error::FilesystemNotFound(tag.clone()))
    }

    /// Returns the filesystem backed by a volume, if any.
    #[must_use]
    pub fn volume_filesystem(&self, volume: &VolumeTag) -> Option<Filesystem> {
        let inner = self.lock();
        let tag = inner
            .filesystems
            .iter()
            .find(|(_, entity)| entity.backing_volume.as_ref() == Some(volume))
            .map(|(tag, _)| tag.clone())?;
        Some(filesystem_snapshot(&inner, &tag))
    }

    /// Records provisioned info for a filesystem. A missing pool is
    /// taken from the params; pool, size and filesystem id are
    /// append-only. For a volume-backed filesystem the backing volume's
    /// attachment must already be provisioned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SetFilesystemInfo`] wrapping the underlying
    /// failure.
    pub fn set_filesystem_info(
        &self,
        tag: &FilesystemTag,
        info: FilesystemInfo,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let wrap = |source: Error| Error::SetFilesystemInfo {
            filesystem: tag.clone(),
            source: Box::new(source),
        };
        let entity = inner
            .filesystems
            .get(tag)
            .ok_or_else(|| wrap(Error::FilesystemNotFound(tag.clone())))?;

        if let Some(backing) = entity.backing_volume.clone() {
            let machines: Vec<MachineTag> = inner
                .filesystem_attachments
                .keys()
                .filter(|id| &id.attachment == tag)
                .map(|id| id.machine.clone())
                .collect();
            for machine in machines {
                let backing_id = AttachmentId::new(machine.clone(), backing.clone());
                let provisioned = inner
                    .volume_attachments
                    .get(&backing_id)
                    .is_some_and(|attachment| attachment.info.is_some());
                if !provisioned {
                    return Err(wrap(Error::VolumeAttachmentNotProvisioned {
                        volume: backing,
                        machine,
                    }));
                }
            }
        }

        let entity = inner
            .filesystems
            .get(tag)
            .ok_or_else(|| wrap(Error::FilesystemNotFound(tag.clone())))?;
        let resolved = match &entity.info {
            Some(existing) => merge_filesystem_info(existing, info).map_err(&wrap)?,
            None => {
                let mut info = info;
                if info.pool.is_none() {
                    info.pool = entity.params.as_ref().map(|params| params.pool.clone());
                }
                info
            }
        };
        let entity = inner
            .filesystems
            .get_mut(tag)
            .ok_or_else(|| wrap(Error::FilesystemNotFound(tag.clone())))?;
        entity.info = Some(resolved);
        entity.params = None;
        emit_filesystem_changes(&mut inner, std::slice::from_ref(tag));
        Ok(())
    }

    /// Returns a snapshot of a filesystem attachment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilesystemAttachmentNotFound`] for unknown pairs.
    pub fn filesystem_attachment(
        &self,
        machine: &MachineTag,
        filesystem: &FilesystemTag,
    ) -> Result<FilesystemAttachment, Error> {
        let inner = self.lock();
        let id = AttachmentId::new(machine.clone(), filesystem.clone());
        let entity = inner.filesystem_attachments.get(&id).ok_or_else(|| {
            Error::FilesystemAttachmentNotFound {
                filesystem: filesystem.clone(),
                machine: machine.clone(),
            }
        })?;
        Ok(FilesystemAttachment {
            filesystem: filesystem.clone(),
            machine: machine.clone(),
            params: entity.params.clone(),
            info: entity.info.clone(),
            life: entity.life,
        })
    }

    /// Returns the filesystem attachments present on a machine.
    #[must_use]
    pub fn machine_filesystem_attachments(
        &self,
        machine: &MachineTag,
    ) -> Vec<FilesystemAttachment> {
        let inner = self.lock();
        inner
            .filesystem_attachments
            .iter()
            .filter(|(id, _)| &id.machine == machine)
            .map(|(id, entity)| FilesystemAttachment {
                filesystem: id.attachment.clone(),
                machine: id.machine.clone(),
                params: entity.params.clone(),
                info: entity.info.clone(),
                life: entity.life,
            })
            .collect()
    }

    /// Records provisioned info for a filesystem attachment. Requires
    /// the filesystem to be provisioned and the machine to have an
    /// instance id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SetFilesystemAttachmentInfo`] wrapping the
    /// underlying failure.
    pub fn set_filesystem_attachment_info(
        &self,
        machine: &MachineTag,
        filesystem: &FilesystemTag,
        info: FilesystemAttachmentInfo,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let id = AttachmentId::new(machine.clone(), filesystem.clone());
        let wrap = |source: Error| Error::SetFilesystemAttachmentInfo {
            filesystem: filesystem.clone(),
            machine: machine.clone(),
            source: Box::new(source),
        };
        if !inner.filesystem_attachments.contains_key(&id) {
            return Err(wrap(Error::FilesystemAttachmentNotFound {
                filesystem: filesystem.clone(),
                machine: machine.clone(),
            }));
        }
        let provisioned = inner
            .filesystems
            .get(filesystem)
            .is_some_and(|entity| entity.info.is_some());
        if !provisioned {
            return Err(wrap(Error::FilesystemNotProvisioned(filesystem.clone())));
        }
        check_machine_provisioned(&inner, machine).map_err(&wrap)?;
        let entity = inner
            .filesystem_attachments
            .get_mut(&id)
            .ok_or_else(|| wrap(Error::FilesystemAttachmentNotFound {
                filesystem: filesystem.clone(),
                machine: machine.clone(),
            }))?;
        entity.info = Some(info);
        entity.params = None;
        emit_filesystem_attachment_changes(&mut inner, std::slice::from_ref(&id));
        Ok(())
    }

    // ----- attachment id parsing -----

    /// Parses a `"<machine>:<volume>"` attachment id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::tags::TagError::InvalidAttachmentId`] when either
    /// half fails to parse.
    pub fn parse_volume_attachment_id(
        id: &str,
    ) -> Result<VolumeAttachmentId, crate::tags::TagError> {
        VolumeAttachmentId::parse(id)
    }

    /// Parses a `"<machine>:<filesystem>"` attachment id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::tags::TagError::InvalidAttachmentId`] when either
    /// half fails to parse.
    pub fn parse_filesystem_attachment_id(
        id: &str,
    ) -> Result<FilesystemAttachmentId, crate::tags::TagError> {
        FilesystemAttachmentId::parse(id)
    }

    // ----- change streams -----

    /// Watches environment-scoped volumes. The initial event carries the
    /// current membership.
    #[must_use]
    pub fn watch_environ_volumes(&self) -> StringsWatcher {
        let mut inner = self.lock();
        let initial = inner
            .volumes
            .keys()
            .filter(|tag| tag.machine().is_none())
            .map(ToString::to_string)
            .collect();
        inner.watchers.environ_volumes.subscribe(initial)
    }

    /// Watches volumes scoped to one machine. The initial event carries
    /// the current membership.
    #[must_use]
    pub fn watch_machine_volumes(&self, machine: &MachineTag) -> StringsWatcher {
        let mut inner = self.lock();
        let initial = inner
            .volumes
            .keys()
            .filter(|tag| tag.machine().as_ref() == Some(machine))
            .map(ToString::to_string)
            .collect();
        subscribe_keyed(
            &mut inner.watchers.machine_volumes,
            machine.clone(),
            initial,
        )
    }

    /// Watches environment-scoped filesystems. The initial event carries
    /// the current membership.
    #[must_use]
    pub fn watch_environ_filesystems(&self) -> StringsWatcher {
        let mut inner = self.lock();
        let initial = inner
            .filesystems
            .keys()
            .filter(|tag| tag.machine().is_none())
            .map(ToString::to_string)
            .collect();
        inner.watchers.environ_filesystems.subscribe(initial)
    }

    /// Watches filesystems scoped to one machine. The initial event
    /// carries the current membership.
    #[must_use]
    pub fn watch_machine_filesystems(&self, machine: &MachineTag) -> StringsWatcher {
        let mut inner = self.lock();
        let initial = inner
            .filesystems
            .keys()
            .filter(|tag| tag.machine().as_ref() == Some(machine))
            .map(ToString::to_string)
            .collect();
        subscribe_keyed(
            &mut inner.watchers.machine_filesystems,
            machine.clone(),
            initial,
        )
    }

    /// Watches attachments of environment-scoped volumes. The initial
    /// event carries the current membership.
    #[must_use]
    pub fn watch_environ_volume_attachments(&self) -> Watcher<Vec<VolumeAttachmentId>> {
        let mut inner = self.lock();
        let initial = inner
            .volume_attachments
            .keys()
            .filter(|id| id.attachment.machine().is_none())
            .cloned()
            .collect();
        inner.watchers.environ_volume_attachments.subscribe(initial)
    }

    /// Watches volume attachments on one machine. The initial event
    /// carries the current membership.
    #[must_use]
    pub fn watch_machine_volume_attachments(
        &self,
        machine: &MachineTag,
    ) -> Watcher<Vec<VolumeAttachmentId>> {
        let mut inner = self.lock();
        let initial = inner
            .volume_attachments
            .keys()
            .filter(|id| &id.machine == machine)
            .cloned()
            .collect();
        subscribe_keyed(
            &mut inner.watchers.machine_volume_attachments,
            machine.clone(),
            initial,
        )
    }

    /// Watches attachments of environment-scoped filesystems. The
    /// initial event carries the current membership.
    #[must_use]
    pub fn watch_environ_filesystem_attachments(&self) -> Watcher<Vec<FilesystemAttachmentId>> {
        let mut inner = self.lock();
        let initial = inner
            .filesystem_attachments
            .keys()
            .filter(|id| id.attachment.machine().is_none())
            .cloned()
            .collect();
        inner
            .watchers
            .environ_filesystem_attachments
            .subscribe(initial)
    }

    /// Watches filesystem attachments on one machine. The initial event
    /// carries the current membership.
    #[must_use]
    pub fn watch_machine_filesystem_attachments(
        &self,
        machine: &MachineTag,
    ) -> Watcher<Vec<FilesystemAttachmentId>> {
        let mut inner = self.lock();
        let initial = inner
            .filesystem_attachments
            .keys()
            .filter(|id| &id.machine == machine)
            .cloned()
            .collect();
        subscribe_keyed(
            &mut inner.watchers.machine_filesystem_attachments,
            machine.clone(),
            initial,
        )
    }

    /// Watches one volume attachment for provisioning changes.
    #[must_use]
    pub fn watch_volume_attachment(
        &self,
        machine: &MachineTag,
        volume: &VolumeTag,
    ) -> NotifyWatcher {
        subscribe_keyed(
            &mut self.lock().watchers.volume_attachment_notify,
            AttachmentId::new(machine.clone(), volume.clone()),
            (),
        )
    }

    /// Watches one filesystem attachment for provisioning changes.
    #[must_use]
    pub fn watch_filesystem_attachment(
        &self,
        machine: &MachineTag,
        filesystem: &FilesystemTag,
    ) -> NotifyWatcher {
        subscribe_keyed(
            &mut self.lock().watchers.filesystem_attachment_notify,
            AttachmentId::new(machine.clone(), filesystem.clone()),
            (),
        )
    }
}

fn default_pool(kind: StorageKind) -> &'static str {
    match kind {
        StorageKind::Filesystem => "rootfs",
        StorageKind::Block => "loop",
    }
}

fn check_unit_unassigned(inner: &Inner, unit: &UnitTag) -> Result<(), Error> {
    let entity = inner
        .units
        .get(unit)
        .ok_or_else(|| Error::UnitNotFound(unit.clone()))?;
    match &entity.machine {
        Some(machine) => Err(Error::UnitAlreadyAssigned {
            unit: unit.clone(),
            machine: machine.clone(),
        }),
        None => Ok(()),
    }
}

fn check_machine_provisioned(inner: &Inner, machine: &MachineTag) -> Result<(), Error> {
    let entity = inner
        .machines
        .get(machine)
        .ok_or_else(|| Error::MachineNotFound(machine.clone()))?;
    if entity.instance_id.is_none() {
        return Err(Error::MachineNotProvisioned(machine.clone()));
    }
    Ok(())
}

fn next_machine_tag(inner: &mut Inner) -> MachineTag {
    let id = inner.next_machine.to_string();
    inner.next_machine += 1;
    MachineTag::parse(&id).expect("constructed machine tag is valid")
}

fn next_volume_tag(inner: &mut Inner, machine: Option<&MachineTag>) -> VolumeTag {
    let seq = inner.next_volume;
    inner.next_volume += 1;
    let id = match machine {
        Some(machine) => format!("{machine}/{seq}"),
        None => seq.to_string(),
    };
    VolumeTag::parse(&id).expect("constructed volume tag is valid")
}

fn next_filesystem_tag(inner: &mut Inner, machine: Option<&MachineTag>) -> FilesystemTag {
    let seq = inner.next_filesystem;
    inner.next_filesystem += 1;
    let id = match machine {
        Some(machine) => format!("{machine}/{seq}"),
        None => seq.to_string(),
    };
    FilesystemTag::parse(&id).expect("constructed filesystem tag is valid")
}

fn find_storage_volume(inner: &Inner, storage: &StorageTag) -> Option<VolumeTag> {
    inner
        .volumes
        .iter()
        .find(|(_, entity)| entity.storage.as_ref() == Some(storage))
        .map(|(tag, _)| tag.clone())
}

fn find_storage_filesystem(inner: &Inner, storage: &StorageTag) -> Option<FilesystemTag> {
    inner
        .filesystems
        .iter()
        .find(|(_, entity)| entity.storage.as_ref() == Some(storage))
        .map(|(tag, _)| tag.clone())
}

fn attach_volume(inner: &mut Inner, machine: &MachineTag, volume: &VolumeTag) -> bool {
    let id = AttachmentId::new(machine.clone(), volume.clone());
    if inner.volume_attachments.contains_key(&id) {
        return false;
    }
    inner.volume_attachments.insert(
        id,
        VolumeAttachmentEntity {
            params: Some(VolumeAttachmentParams::default()),
            info: None,
            life: Life::Alive,
        },
    );
    true
}

fn attach_filesystem(inner: &mut Inner, machine: &MachineTag, filesystem: &FilesystemTag) -> bool {
    let id = AttachmentId::new(machine.clone(), filesystem.clone());
    if inner.filesystem_attachments.contains_key(&id) {
        return false;
    }
    inner.filesystem_attachments.insert(
        id,
        FilesystemAttachmentEntity {
            params: Some(FilesystemAttachmentParams::default()),
            info: None,
            life: Life::Alive,
        },
    );
    true
}

fn merge_volume_info(existing: &VolumeInfo, new: VolumeInfo) -> Result<VolumeInfo, Error> {
    check_immutable(
        "pool",
        existing.pool.as_deref().unwrap_or_default(),
        new.pool.as_deref().unwrap_or_default(),
    )?;
    check_immutable_filled("volume id", &existing.volume_id, &new.volume_id)?;
    if existing.size != new.size {
        return Err(Error::ImmutableField {
            field: "size",
            from: existing.size.to_string(),
            to: new.size.to_string(),
        });
    }
    Ok(VolumeInfo {
        pool: existing.pool.clone(),
        volume_id: if new.volume_id.is_empty() {
            existing.volume_id.clone()
        } else {
            new.volume_id
        },
        hardware_id: new.hardware_id.or_else(|| existing.hardware_id.clone()),
        size: existing.size,
        persistent: new.persistent,
    })
}

fn merge_filesystem_info(
    existing: &FilesystemInfo,
    new: FilesystemInfo,
) -> Result<FilesystemInfo, Error> {
    check_immutable(
        "pool",
        existing.pool.as_deref().unwrap_or_default(),
        new.pool.as_deref().unwrap_or_default(),
    )?;
    check_immutable_filled("filesystem id", &existing.filesystem_id, &new.filesystem_id)?;
    if existing.size != new.size {
        return Err(Error::ImmutableField {
            field: "size",
            from: existing.size.to_string(),
            to: new.size.to_string(),
        });
    }
    Ok(FilesystemInfo {
        pool: existing.pool.clone(),
        filesystem_id: if new.filesystem_id.is_empty() {
            existing.filesystem_id.clone()
        } else {
            new.filesystem_id
        },
        size: existing.size,
    })
}

fn check_immutable(field: &'static str, from: &str, to: &str) -> Result<(), Error> {
    if from == to {
        return Ok(());
    }
    Err(Error::ImmutableField {
        field,
        from: from.to_owned(),
        to: to.to_owned(),
    })
}

/// An empty existing value may be filled in later; a non-empty one may
/// not change.
fn check_immutable_filled(field: &'static str, from: &str, to: &str) -> Result<(), Error> {
    if from.is_empty() || to.is_empty() || from == to {
        return Ok(());
    }
    Err(Error::ImmutableField {
        field,
        from: from.to_owned(),
        to: to.to_owned(),
    })
}

fn volume_snapshot(inner: &Inner, tag: &VolumeTag) -> Volume {
    let entity = &inner.volumes[tag];
    Volume {
        tag: tag.clone(),
        storage: entity.storage.clone(),
        params: entity.params.clone(),
        info: entity.info.clone(),
        life: entity.life,
    }
}

fn filesystem_snapshot(inner: &Inner, tag: &FilesystemTag) -> Filesystem {
    let entity = &inner.filesystems[tag];
    Filesystem {
        tag: tag.clone(),
        storage: entity.storage.clone(),
        backing_volume: entity.backing_volume.clone(),
        params: entity.params.clone(),
        info: entity.info.clone(),
        life: entity.life,
    }
}

fn subscribe_keyed<K, T>(
    subscribers: &mut Vec<(K, WatcherSender<T>)>,
    key: K,
    initial: T,
) -> Watcher<T> {
    let (tx, rx) = channel();
    tx.send(initial);
    subscribers.push((key, tx));
    rx
}

fn publish_keyed<K: PartialEq, T: Clone>(
    subscribers: &mut Vec<(K, WatcherSender<T>)>,
    key: &K,
    event: &T,
) {
    subscribers.retain(|(subscriber_key, tx)| {
        if subscriber_key == key {
            tx.send(event.clone())
        } else {
            !tx.is_closed()
        }
    });
}

fn emit_volume_changes(inner: &mut Inner, changed: &[VolumeTag]) {
    let environ: Vec<String> = changed
        .iter()
        .filter(|tag| tag.machine().is_none())
        .map(ToString::to_string)
        .collect();
    if !environ.is_empty() {
        inner.watchers.environ_volumes.publish(&environ);
    }
    inner.watchers.machine_volumes.retain(|(machine, tx)| {
        let subset: Vec<String> = changed
            .iter()
            .filter(|tag| tag.machine().as_ref() == Some(machine))
            .map(ToString::to_string)
            .collect();
        if subset.is_empty() {
            !tx.is_closed()
        } else {
            tx.send(subset)
        }
    });
}

fn emit_filesystem_changes(inner: &mut Inner, changed: &[FilesystemTag]) {
    let environ: Vec<String> = changed
        .iter()
        .filter(|tag| tag.machine().is_none())
        .map(ToString::to_string)
        .collect();
    if !environ.is_empty() {
        inner.watchers.environ_filesystems.publish(&environ);
    }
    inner.watchers.machine_filesystems.retain(|(machine, tx)| {
        let subset: Vec<String> = changed
            .iter()
            .filter(|tag| tag.machine().as_ref() == Some(machine))
            .map(ToString::to_string)
            .collect();
        if subset.is_empty() {
            !tx.is_closed()
        } else {
            tx.send(subset)
        }
    });
}

fn emit_volume_attachment_changes(inner: &mut Inner, changed: &[VolumeAttachmentId]) {
    let environ: Vec<VolumeAttachmentId> = changed
        .iter()
        .filter(|id| id.attachment.machine().is_none())
        .cloned()
        .collect();
    if !environ.is_empty() {
        inner.watchers.environ_volume_attachments.publish(&environ);
    }
    inner
        .watchers
        .machine_volume_attachments
        .retain(|(machine, tx)| {
            let subset: Vec<VolumeAttachmentId> = changed
                .iter()
                .filter(|id| &id.machine == machine)
                .cloned()
                .collect();
            if subset.is_empty() {
                !tx.is_closed()
            } else {
                tx.send(subset)
            }
        });
    for id in changed {
        publish_keyed(&mut inner.watchers.volume_attachment_notify, id, &());
    }
}

fn emit_filesystem_attachment_changes(inner: &mut Inner, changed: &[FilesystemAttachmentId]) {
    let environ: Vec<FilesystemAttachmentId> = changed
        .iter()
        .filter(|id| id.attachment.machine().is_none())
        .cloned()
        .collect();
    if !environ.is_empty() {
        inner
            .watchers
            .environ_filesystem_attachments
            .publish(&environ);
    }
    inner
        .watchers
        .machine_filesystem_attachments
        .retain(|(machine, tx)| {
            let subset: Vec<FilesystemAttachmentId> = changed
                .iter()
                .filter(|id| &id.machine == machine)
                .cloned()
                .collect();
            if subset.is_empty() {
                !tx.is_closed()
            } else {
                tx.send(subset)
            }
        });
    for id in changed {
        publish_keyed(&mut inner.watchers.filesystem_attachment_notify, id, &());
    }
}
