//! Accessor implementations backed by the in-crate state model.
//!
//! These adapters let a complete agent run against a local [`State`]
//! without an RPC layer: the worker sees exactly the contracts it would
//! see over the wire, and the adapters translate between the model's
//! entity snapshots and the plain records the worker consumes.

use crate::model::{self, State};
use crate::provider::{
    BlockDevice, EnvironConfig, Filesystem, FilesystemAttachment, FilesystemAttachmentParams,
    FilesystemInfo, FilesystemParams, InstanceId, Volume, VolumeAttachment,
    VolumeAttachmentParams, VolumeInfo, VolumeParams,
};
use crate::tags::{FilesystemAttachmentId, FilesystemTag, MachineTag, VolumeAttachmentId, VolumeTag};
use crate::watcher::{NotifyWatcher, StringsWatcher, Watcher};

use super::{
    AccessorFuture, EnvironAccessor, FilesystemAccessor, LifecycleManager, LookupError,
    LookupResult, MachineAccessor, OperationError, Scope, VolumeAccessor,
};

/// Volume accessor over a local state model.
pub struct StateVolumes {
    state: State,
    scope: Scope,
}

impl StateVolumes {
    /// Creates an accessor for the given scope.
    #[must_use]
    pub fn new(state: State, scope: Scope) -> Self {
        Self { state, scope }
    }
}

/// Filesystem accessor over a local state model.
pub struct StateFilesystems {
    state: State,
    scope: Scope,
}

impl StateFilesystems {
    /// Creates an accessor for the given scope.
    #[must_use]
    pub fn new(state: State, scope: Scope) -> Self {
        Self { state, scope }
    }
}

/// Machine accessor over a local state model.
pub struct StateMachines {
    state: State,
}

impl StateMachines {
    /// Creates the accessor.
    #[must_use]
    pub fn new(state: State) -> Self {
        Self { state }
    }
}

/// Environ accessor over a local state model.
pub struct StateEnviron {
    state: State,
}

impl StateEnviron {
    /// Creates the accessor.
    #[must_use]
    pub fn new(state: State) -> Self {
        Self { state }
    }
}

/// Lifecycle queries over a local state model.
pub struct StateLifecycle {
    state: State,
}

impl StateLifecycle {
    /// Creates the accessor.
    #[must_use]
    pub fn new(state: State) -> Self {
        Self { state }
    }
}

fn volume_info(info: &model::VolumeInfo) -> VolumeInfo {
    VolumeInfo {
        volume_id: info.volume_id.clone(),
        hardware_id: info.hardware_id.clone(),
        size: info.size,
        persistent: info.persistent,
    }
}

fn filesystem_info(info: &model::FilesystemInfo) -> FilesystemInfo {
    FilesystemInfo {
        filesystem_id: info.filesystem_id.clone(),
        size: info.size,
    }
}

fn lookup_volume(state: &State, tag: &VolumeTag) -> LookupResult<Volume> {
    let volume = state
        .volume(tag)
        .map_err(|_| LookupError::NotFound(format!("volume \"{tag}\"")))?;
    match &volume.info {
        Some(info) => Ok(Volume {
            tag: tag.clone(),
            info: volume_info(info),
        }),
        None => Err(LookupError::NotProvisioned(format!("volume \"{tag}\""))),
    }
}

fn lookup_volume_params(state: &State, tag: &VolumeTag) -> LookupResult<VolumeParams> {
    let volume = state
        .volume(tag)
        .map_err(|_| LookupError::NotFound(format!("volume \"{tag}\"")))?;
    let params = volume
        .params
        .as_ref()
        .ok_or_else(|| LookupError::NotFound(format!("params for volume \"{tag}\"")))?;
    let pool = state
        .pool(&params.pool)
        .map_err(|err| LookupError::Other(err.to_string()))?;
    let attachment = state
        .volume_attachment_machines(tag)
        .into_iter()
        .next()
        .map(|machine| {
            let instance_id = state
                .machine(&machine)
                .ok()
                .and_then(|snapshot| snapshot.instance_id);
            let read_only = state
                .volume_attachment(&machine, tag)
                .ok()
                .and_then(|attachment| attachment.params.map(|params| params.read_only))
                .unwrap_or_default();
            VolumeAttachmentParams {
                volume: tag.clone(),
                volume_id: None,
                machine,
                instance_id,
                provider: pool.provider.clone(),
                read_only,
            }
        });
    Ok(VolumeParams {
        tag: tag.clone(),
        size: params.size,
        provider: pool.provider,
        attributes: pool.attrs,
        resource_tags: Default::default(),
        attachment,
    })
}

fn lookup_volume_attachment_params(
    state: &State,
    id: &VolumeAttachmentId,
) -> LookupResult<VolumeAttachmentParams> {
    let attachment = state
        .volume_attachment(&id.machine, &id.attachment)
        .map_err(|err| LookupError::NotFound(err.to_string()))?;
    let volume = state
        .volume(&id.attachment)
        .map_err(|_| LookupError::NotFound(format!("volume \"{}\"", id.attachment)))?;
    let pool_name = volume
        .info
        .as_ref()
        .and_then(|info| info.pool.clone())
        .or_else(|| volume.params.as_ref().map(|params| params.pool.clone()))
        .unwrap_or_default();
    let provider = state
        .pool(&pool_name)
        .map(|pool| pool.provider)
        .unwrap_or_default();
    let instance_id = state
        .machine(&id.machine)
        .ok()
        .and_then(|snapshot| snapshot.instance_id);
    Ok(VolumeAttachmentParams {
        volume: id.attachment.clone(),
        volume_id: volume.info.as_ref().map(|info| info.volume_id.clone()),
        machine: id.machine.clone(),
        instance_id,
        provider,
        read_only: attachment
            .params
            .map(|params| params.read_only)
            .unwrap_or_default(),
    })
}

impl VolumeAccessor for StateVolumes {
    fn watch_volumes(&self) -> StringsWatcher {
        match &self.scope {
            Scope::Environ(_) => self.state.watch_environ_volumes(),
            Scope::Machine(machine) => self.state.watch_machine_volumes(machine),
        }
    }

    fn watch_volume_attachments(&self) -> Watcher<Vec<VolumeAttachmentId>> {
        match &self.scope {
            Scope::Environ(_) => self.state.watch_environ_volume_attachments(),
            Scope::Machine(machine) => self.state.watch_machine_volume_attachments(machine),
        }
    }

    fn watch_block_devices(&self, machine: &MachineTag) -> NotifyWatcher {
        self.state.watch_block_devices(machine)
    }

    fn volumes<'a>(
        &'a self,
        tags: &'a [VolumeTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<Volume>>> {
        Box::pin(async move {
            Ok(tags
                .iter()
                .map(|tag| lookup_volume(&self.state, tag))
                .collect())
        })
    }

    fn volume_attachments<'a>(
        &'a self,
        ids: &'a [VolumeAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<VolumeAttachment>>> {
        Box::pin(async move {
            Ok(ids
                .iter()
                .map(|id| {
                    let attachment = self
                        .state
                        .volume_attachment(&id.machine, &id.attachment)
                        .map_err(|err| LookupError::NotFound(err.to_string()))?;
                    match &attachment.info {
                        Some(info) => Ok(VolumeAttachment {
                            volume: id.attachment.clone(),
                            machine: id.machine.clone(),
                            info: info.clone(),
                        }),
                        None => Err(LookupError::NotProvisioned(format!(
                            "volume attachment \"{}\" on \"{}\"",
                            id.attachment, id.machine
                        ))),
                    }
                })
                .collect())
        })
    }

    fn volume_params<'a>(
        &'a self,
        tags: &'a [VolumeTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<VolumeParams>>> {
        Box::pin(async move {
            Ok(tags
                .iter()
                .map(|tag| lookup_volume_params(&self.state, tag))
                .collect())
        })
    }

    fn volume_attachment_params<'a>(
        &'a self,
        ids: &'a [VolumeAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<VolumeAttachmentParams>>> {
        Box::pin(async move {
            Ok(ids
                .iter()
                .map(|id| lookup_volume_attachment_params(&self.state, id))
                .collect())
        })
    }

    fn block_devices<'a>(
        &'a self,
        ids: &'a [VolumeAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<BlockDevice>>> {
        Box::pin(async move {
            Ok(ids
                .iter()
                .map(|id| {
                    self.state
                        .block_device(&id.machine, &id.attachment)
                        .ok_or_else(|| {
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
    ) -> AccessorFuture<'a, Vec<super::ItemResult>> {
        Box::pin(async move {
            Ok(volumes
                .iter()
                .map(|volume| {
                    self.state
                        .set_volume_info(
                            &volume.tag,
                            model::VolumeInfo {
                                pool: None,
                                volume_id: volume.info.volume_id.clone(),
                                hardware_id: volume.info.hardware_id.clone(),
                                size: volume.info.size,
                                persistent: volume.info.persistent,
                            },
                        )
                        .map_err(|err| OperationError::new(err.to_string()))
                })
                .collect())
        })
    }

    fn set_volume_attachment_info<'a>(
        &'a self,
        attachments: &'a [VolumeAttachment],
    ) -> AccessorFuture<'a, Vec<super::ItemResult>> {
        Box::pin(async move {
            Ok(attachments
                .iter()
                .map(|attachment| {
                    self.state
                        .set_volume_attachment_info(
                            &attachment.machine,
                            &attachment.volume,
                            attachment.info.clone(),
                        )
                        .map_err(|err| OperationError::new(err.to_string()))
                })
                .collect())
        })
    }
}

fn lookup_filesystem(state: &State, tag: &FilesystemTag) -> LookupResult<Filesystem> {
    let filesystem = state
        .filesystem(tag)
        .map_err(|_| LookupError::NotFound(format!("filesystem \"{tag}\"")))?;
    match &filesystem.info {
        Some(info) => Ok(Filesystem {
            tag: tag.clone(),
            backing_volume: filesystem.backing_volume.clone(),
            info: filesystem_info(info),
        }),
        None => Err(LookupError::NotProvisioned(format!(
            "filesystem \"{tag}\""
        ))),
    }
}

fn lookup_filesystem_params(state: &State, tag: &FilesystemTag) -> LookupResult<FilesystemParams> {
    let filesystem = state
        .filesystem(tag)
        .map_err(|_| LookupError::NotFound(format!("filesystem \"{tag}\"")))?;
    let params = filesystem
        .params
        .as_ref()
        .ok_or_else(|| LookupError::NotFound(format!("params for filesystem \"{tag}\"")))?;
    let pool = state
        .pool(&params.pool)
        .map_err(|err| LookupError::Other(err.to_string()))?;
    Ok(FilesystemParams {
        tag: tag.clone(),
        backing_volume: filesystem.backing_volume.clone(),
        size: params.size,
        provider: pool.provider,
        attributes: pool.attrs,
        resource_tags: Default::default(),
    })
}

fn lookup_filesystem_attachment_params(
    state: &State,
    id: &FilesystemAttachmentId,
) -> LookupResult<FilesystemAttachmentParams> {
    let attachment = state
        .filesystem_attachment(&id.machine, &id.attachment)
        .map_err(|err| LookupError::NotFound(err.to_string()))?;
    let filesystem = state
        .filesystem(&id.attachment)
        .map_err(|_| LookupError::NotFound(format!("filesystem \"{}\"", id.attachment)))?;
    let pool_name = filesystem
        .info
        .as_ref()
        .and_then(|info| info.pool.clone())
        .or_else(|| filesystem.params.as_ref().map(|params| params.pool.clone()))
        .unwrap_or_default();
    let provider = state
        .pool(&pool_name)
        .map(|pool| pool.provider)
        .unwrap_or_default();
    let instance_id = state
        .machine(&id.machine)
        .ok()
        .and_then(|snapshot| snapshot.instance_id);
    let (location, read_only) = attachment
        .params
        .map(|params| (params.location, params.read_only))
        .unwrap_or_default();
    Ok(FilesystemAttachmentParams {
        filesystem: id.attachment.clone(),
        filesystem_id: filesystem
            .info
            .as_ref()
            .map(|info| info.filesystem_id.clone()),
        backing_volume: filesystem.backing_volume.clone(),
        machine: id.machine.clone(),
        instance_id,
        provider,
        mount_point: location,
        read_only,
    })
}

impl FilesystemAccessor for StateFilesystems {
    fn watch_filesystems(&self) -> StringsWatcher {
        match &self.scope {
            Scope::Environ(_) => self.state.watch_environ_filesystems(),
            Scope::Machine(machine) => self.state.watch_machine_filesystems(machine),
        }
    }

    fn watch_filesystem_attachments(&self) -> Watcher<Vec<FilesystemAttachmentId>> {
        match &self.scope {
            Scope::Environ(_) => self.state.watch_environ_filesystem_attachments(),
            Scope::Machine(machine) => self.state.watch_machine_filesystem_attachments(machine),
        }
    }

    fn filesystems<'a>(
        &'a self,
        tags: &'a [FilesystemTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<Filesystem>>> {
        Box::pin(async move {
            Ok(tags
                .iter()
                .map(|tag| lookup_filesystem(&self.state, tag))
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
                    let attachment = self
                        .state
                        .filesystem_attachment(&id.machine, &id.attachment)
                        .map_err(|err| LookupError::NotFound(err.to_string()))?;
                    match &attachment.info {
                        Some(info) => Ok(FilesystemAttachment {
                            filesystem: id.attachment.clone(),
                            machine: id.machine.clone(),
                            info: info.clone(),
                        }),
                        None => Err(LookupError::NotProvisioned(format!(
                            "filesystem attachment \"{}\" on \"{}\"",
                            id.attachment, id.machine
                        ))),
                    }
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
                .map(|tag| lookup_filesystem_params(&self.state, tag))
                .collect())
        })
    }

    fn filesystem_attachment_params<'a>(
        &'a self,
        ids: &'a [FilesystemAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<FilesystemAttachmentParams>>> {
        Box::pin(async move {
            Ok(ids
                .iter()
                .map(|id| lookup_filesystem_attachment_params(&self.state, id))
                .collect())
        })
    }

    fn set_filesystem_info<'a>(
        &'a self,
        filesystems: &'a [Filesystem],
    ) -> AccessorFuture<'a, Vec<super::ItemResult>> {
        Box::pin(async move {
            Ok(filesystems
                .iter()
                .map(|filesystem| {
                    self.state
                        .set_filesystem_info(
                            &filesystem.tag,
                            model::FilesystemInfo {
                                pool: None,
                                filesystem_id: filesystem.info.filesystem_id.clone(),
                                size: filesystem.info.size,
                            },
                        )
                        .map_err(|err| OperationError::new(err.to_string()))
                })
                .collect())
        })
    }

    fn set_filesystem_attachment_info<'a>(
        &'a self,
        attachments: &'a [FilesystemAttachment],
    ) -> AccessorFuture<'a, Vec<super::ItemResult>> {
        Box::pin(async move {
            Ok(attachments
                .iter()
                .map(|attachment| {
                    self.state
                        .set_filesystem_attachment_info(
                            &attachment.machine,
                            &attachment.filesystem,
                            attachment.info.clone(),
                        )
                        .map_err(|err| OperationError::new(err.to_string()))
                })
                .collect())
        })
    }
}

impl MachineAccessor for StateMachines {
    fn instance_ids<'a>(
        &'a self,
        machines: &'a [MachineTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<InstanceId>>> {
        Box::pin(async move {
            Ok(machines
                .iter()
                .map(|machine| {
                    let snapshot = self
                        .state
                        .machine(machine)
                        .map_err(|err| LookupError::NotFound(err.to_string()))?;
                    snapshot.instance_id.ok_or_else(|| {
                        LookupError::NotProvisioned(format!("machine {machine}"))
                    })
                })
                .collect())
        })
    }

    fn watch_machine(&self, machine: &MachineTag) -> NotifyWatcher {
        self.state.watch_machine(machine)
    }
}

impl EnvironAccessor for StateEnviron {
    fn watch_environ(&self) -> NotifyWatcher {
        self.state.watch_environ()
    }

    fn model_config(&self) -> AccessorFuture<'_, EnvironConfig> {
        Box::pin(async move { Ok(self.state.environ_config()) })
    }
}

impl LifecycleManager for StateLifecycle {
    fn volume_life<'a>(
        &'a self,
        tags: &'a [VolumeTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<crate::model::Life>>> {
        Box::pin(async move {
            Ok(tags
                .iter()
                .map(|tag| {
                    self.state
                        .volume_life(tag)
                        .map_err(|err| LookupError::NotFound(err.to_string()))
                })
                .collect())
        })
    }

    fn filesystem_life<'a>(
        &'a self,
        tags: &'a [FilesystemTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<crate::model::Life>>> {
        Box::pin(async move {
            Ok(tags
                .iter()
                .map(|tag| {
                    self.state
                        .filesystem_life(tag)
                        .map_err(|err| LookupError::NotFound(err.to_string()))
                })
                .collect())
        })
    }
}
