//! Filesystem-side reconciliation: reacting to filesystem and
//! filesystem-attachment changes, and realising the pending sets through
//! filesystem sources.
//!
//! Volume-backed filesystems never reach an external provider: they are
//! realised through the [`super::ManagedFilesystemSource`] synthesised
//! from the block devices currently visible on this worker's machine.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::accessor::LookupError;
use crate::model::Life;
use crate::provider::{
    BlockDevice, FilesystemAttachmentParams, FilesystemParams, FilesystemSource,
};
use crate::tags::{
    AttachmentId, FilesystemAttachmentId, FilesystemTag, MachineTag, Tag, VolumeTag,
};

use super::{
    ManagedFilesystemSource, PendingError, ProvisionerError, SourceOpError, SourceSetupError,
    WorkerCore,
};

impl WorkerCore {
    /// Folds a filesystem change set into the pending and provisioned
    /// sets.
    pub(crate) async fn filesystems_changed(
        &mut self,
        ids: Vec<String>,
    ) -> Result<(), ProvisionerError> {
        let mut tags = Vec::with_capacity(ids.len());
        for id in ids {
            match FilesystemTag::parse(&id) {
                Ok(tag) => tags.push(tag),
                Err(err) => warn!(%id, error = %err, "ignoring malformed filesystem id"),
            }
        }
        let lives = self
            .lifecycle
            .filesystem_life(&tags)
            .await
            .map_err(|source| ProvisionerError::Accessor {
                stage: "getting filesystem lifecycle",
                source,
            })?;
        let mut alive = Vec::new();
        for (tag, life) in tags.into_iter().zip(lives) {
            match life {
                Ok(Life::Alive) => alive.push(tag),
                Ok(life) => {
                    debug!(filesystem = %tag, %life, "ignoring non-alive filesystem");
                }
                Err(err) => warn!(filesystem = %tag, error = %err, "getting filesystem life"),
            }
        }

        let lookups = self
            .filesystems
            .filesystems(&alive)
            .await
            .map_err(|source| ProvisionerError::Accessor {
                stage: "getting filesystems",
                source,
            })?;
        let mut unprovisioned = Vec::new();
        for (tag, lookup) in alive.into_iter().zip(lookups) {
            match lookup {
                Ok(filesystem) => {
                    self.pending_filesystems.remove(&tag);
                    self.provisioned_filesystems.insert(tag, filesystem);
                }
                Err(LookupError::NotProvisioned(_) | LookupError::NotFound(_)) => {
                    unprovisioned.push(tag);
                }
                Err(err) => warn!(filesystem = %tag, error = %err, "getting filesystem"),
            }
        }

        if unprovisioned.is_empty() {
            return Ok(());
        }
        let params = self
            .filesystems
            .filesystem_params(&unprovisioned)
            .await
            .map_err(|source| ProvisionerError::Accessor {
                stage: "getting filesystem params",
                source,
            })?;
        for (tag, params) in unprovisioned.into_iter().zip(params) {
            match params {
                Ok(params) => {
                    self.pending_filesystems.insert(tag, params);
                }
                Err(err) => warn!(filesystem = %tag, error = %err, "getting filesystem params"),
            }
        }
        Ok(())
    }

    /// Folds a filesystem-attachment change set into the pending set,
    /// suppressing ids already handled during this session.
    pub(crate) async fn filesystem_attachments_changed(
        &mut self,
        ids: Vec<FilesystemAttachmentId>,
    ) -> Result<(), ProvisionerError> {
        let fresh: Vec<FilesystemAttachmentId> = ids
            .into_iter()
            .filter(|id| !self.session_filesystem_attachments.contains(id))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        let params = self
            .filesystems
            .filesystem_attachment_params(&fresh)
            .await
            .map_err(|source| ProvisionerError::Accessor {
                stage: "getting filesystem attachment params",
                source,
            })?;
        for (id, params) in fresh.into_iter().zip(params) {
            match params {
                Ok(params) => {
                    self.pending_filesystem_attachments.insert(id, params);
                }
                Err(err) => {
                    warn!(attachment = %id, error = %err, "getting filesystem attachment params");
                }
            }
        }
        Ok(())
    }

    /// Fetches the block devices for the given backing volumes on this
    /// worker's machine; absent devices are simply left out.
    async fn backing_block_devices(
        &self,
        machine: &MachineTag,
        backing: &[VolumeTag],
    ) -> Result<BTreeMap<VolumeTag, BlockDevice>, SourceOpError> {
        if backing.is_empty() {
            return Ok(BTreeMap::new());
        }
        let ids: Vec<_> = backing
            .iter()
            .map(|volume| AttachmentId::new(machine.clone(), volume.clone()))
            .collect();
        let results = self
            .volumes
            .block_devices(&ids)
            .await
            .map_err(|err| SourceOpError::BlockDevices(err.to_string()))?;
        let mut devices = BTreeMap::new();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(device) => {
                    devices.insert(id.attachment, device);
                }
                Err(LookupError::NotFound(_) | LookupError::NotProvisioned(_)) => {
                    debug!(volume = %id.attachment, "backing block device not visible yet");
                }
                Err(err) => {
                    warn!(volume = %id.attachment, error = %err, "getting block device");
                }
            }
        }
        Ok(devices)
    }

    /// Creates every pending filesystem that is ready and publishes the
    /// results. Volume-backed filesystems go through the managed source;
    /// the rest are batched per provider source.
    pub(crate) async fn process_pending_filesystems(&mut self) -> Result<(), PendingError> {
        let Some(environ) = self.environ_config.clone() else {
            return Ok(());
        };
        let resource_tags = environ.resource_tags();
        let scope_machine = self.scope.machine().cloned();

        let mut managed_candidates: Vec<FilesystemParams> = Vec::new();
        let mut backing_volumes: Vec<VolumeTag> = Vec::new();
        let mut groups: BTreeMap<String, Vec<FilesystemParams>> = BTreeMap::new();
        for (tag, params) in &self.pending_filesystems {
            let mut params = params.clone();
            if let Some(backing) = params.backing_volume.clone() {
                let Some(_) = &scope_machine else {
                    debug!(
                        filesystem = %tag,
                        "volume-backed filesystems are realised by machine workers"
                    );
                    continue;
                };
                backing_volumes.push(backing);
                managed_candidates.push(params);
                continue;
            }
            let provider = self.registry.lookup(&params.provider).map_err(|err| {
                PendingError::CreatingFilesystems(SourceOpError::FilesystemSource(
                    SourceSetupError::Storage {
                        name: params.provider.clone(),
                        message: err.to_string(),
                    },
                ))
            })?;
            if !self.creation_allowed(provider.is_dynamic()) {
                debug!(
                    filesystem = %tag,
                    provider = %params.provider,
                    "not creating filesystem from non-dynamic provider"
                );
                continue;
            }
            params.resource_tags = resource_tags.clone();
            groups.entry(params.provider.clone()).or_default().push(params);
        }

        if let Some(machine) = &scope_machine {
            let devices = self
                .backing_block_devices(machine, &backing_volumes)
                .await
                .map_err(PendingError::CreatingFilesystems)?;
            let ready: Vec<FilesystemParams> = managed_candidates
                .into_iter()
                .filter(|params| {
                    params
                        .backing_volume
                        .as_ref()
                        .is_some_and(|backing| devices.contains_key(backing))
                })
                .collect();
            if !ready.is_empty() {
                let source = ManagedFilesystemSource::new(
                    self.storage_dir.clone(),
                    machine.clone(),
                    devices,
                    self.provisioned_filesystems.clone(),
                );
                self.create_filesystems_through(&source, &ready).await?;
            }
        }

        for (name, batch) in groups {
            let source = self.filesystem_source(&environ, &name).map_err(|err| {
                PendingError::CreatingFilesystems(SourceOpError::FilesystemSource(err))
            })?;
            self.create_filesystems_through(source.as_ref(), &batch)
                .await?;
        }
        Ok(())
    }

    /// Runs one create batch through a source and publishes the
    /// successes; per-item failures stay pending for the next change.
    async fn create_filesystems_through(
        &mut self,
        source: &dyn FilesystemSource,
        batch: &[FilesystemParams],
    ) -> Result<(), PendingError> {
        let results = source
            .create_filesystems(batch)
            .await
            .map_err(|err| PendingError::CreatingFilesystems(SourceOpError::Call(err)))?;
        let mut created = Vec::new();
        for (params, result) in batch.iter().zip(results) {
            match result {
                Ok(filesystem) => created.push(filesystem),
                Err(err) => {
                    warn!(filesystem = %params.tag, error = %err, "creating filesystem");
                }
            }
        }
        if created.is_empty() {
            return Ok(());
        }
        let outcomes = self
            .filesystems
            .set_filesystem_info(&created)
            .await
            .map_err(|source| PendingError::Setter {
                what: "filesystems",
                source,
            })?;
        for (filesystem, outcome) in created.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    self.pending_filesystems.remove(&filesystem.tag);
                    self.provisioned_filesystems
                        .insert(filesystem.tag.clone(), filesystem);
                }
                Err(err) => {
                    return Err(PendingError::PublishFilesystem {
                        tag: filesystem.tag,
                        message: err.message,
                    });
                }
            }
        }
        Ok(())
    }

    /// Attaches every pending filesystem attachment whose filesystem and
    /// machine are both provisioned, and publishes the results.
    pub(crate) async fn process_pending_filesystem_attachments(
        &mut self,
    ) -> Result<(), PendingError> {
        let Some(environ) = self.environ_config.clone() else {
            return Ok(());
        };
        let scope_machine = self.scope.machine().cloned();

        let mut to_watch = Vec::new();
        let mut managed_batch: Vec<FilesystemAttachmentParams> = Vec::new();
        let mut backing_volumes: Vec<VolumeTag> = Vec::new();
        let mut groups: BTreeMap<String, Vec<FilesystemAttachmentParams>> = BTreeMap::new();
        for (id, params) in &self.pending_filesystem_attachments {
            let mut params = params.clone();
            match self.instance_id_for(&params.machine, params.instance_id.as_ref()) {
                Some(instance_id) => params.instance_id = Some(instance_id),
                None => {
                    debug!(attachment = %id, "deferring attachment until its machine is provisioned");
                    to_watch.push(params.machine.clone());
                    continue;
                }
            }
            let Some(filesystem) = self.provisioned_filesystems.get(&params.filesystem) else {
                debug!(attachment = %id, "deferring attachment until its filesystem is provisioned");
                continue;
            };
            params.filesystem_id = Some(filesystem.info.filesystem_id.clone());
            if params.backing_volume.is_none() {
                params.backing_volume = filesystem.backing_volume.clone();
            }
            match &params.backing_volume {
                Some(backing) if scope_machine.is_some() => {
                    backing_volumes.push(backing.clone());
                    managed_batch.push(params);
                }
                Some(_) => {
                    debug!(
                        attachment = %id,
                        "volume-backed filesystem attachments are realised by machine workers"
                    );
                }
                None => {
                    groups.entry(params.provider.clone()).or_default().push(params);
                }
            }
        }
        for machine in to_watch {
            self.watch_machine(&machine);
        }

        if let Some(machine) = &scope_machine {
            let devices = self
                .backing_block_devices(machine, &backing_volumes)
                .await
                .map_err(PendingError::AttachingFilesystems)?;
            let ready: Vec<FilesystemAttachmentParams> = managed_batch
                .into_iter()
                .filter(|params| {
                    params
                        .backing_volume
                        .as_ref()
                        .is_some_and(|backing| devices.contains_key(backing))
                })
                .collect();
            if !ready.is_empty() {
                let source = ManagedFilesystemSource::new(
                    self.storage_dir.clone(),
                    machine.clone(),
                    devices,
                    self.provisioned_filesystems.clone(),
                );
                self.attach_filesystems_through(&source, &ready).await?;
            }
        }

        for (name, batch) in groups {
            let source = self.filesystem_source(&environ, &name).map_err(|err| {
                PendingError::AttachingFilesystems(SourceOpError::FilesystemSource(err))
            })?;
            self.attach_filesystems_through(source.as_ref(), &batch)
                .await?;
        }
        Ok(())
    }

    /// Runs one attach batch through a source and publishes the
    /// successes, recording them in the session memory.
    async fn attach_filesystems_through(
        &mut self,
        source: &dyn FilesystemSource,
        batch: &[FilesystemAttachmentParams],
    ) -> Result<(), PendingError> {
        let results = source
            .attach_filesystems(batch)
            .await
            .map_err(|err| PendingError::AttachingFilesystems(SourceOpError::Call(err)))?;
        let mut attached = Vec::new();
        for (params, result) in batch.iter().zip(results) {
            match result {
                Ok(attachment) => attached.push(attachment),
                Err(err) => {
                    warn!(
                        filesystem = %params.filesystem,
                        machine = %params.machine,
                        error = %err,
                        "attaching filesystem"
                    );
                }
            }
        }
        if attached.is_empty() {
            return Ok(());
        }
        let outcomes = self
            .filesystems
            .set_filesystem_attachment_info(&attached)
            .await
            .map_err(|source| PendingError::Setter {
                what: "filesystem attachments",
                source,
            })?;
        for (attachment, outcome) in attached.into_iter().zip(outcomes) {
            let id = AttachmentId::new(
                attachment.machine.clone(),
                attachment.filesystem.clone(),
            );
            match outcome {
                Ok(()) => {
                    self.pending_filesystem_attachments.remove(&id);
                    self.session_filesystem_attachments.insert(id);
                }
                Err(err) => {
                    return Err(PendingError::PublishFilesystemAttachment {
                        filesystem: attachment.filesystem,
                        machine: attachment.machine,
                        message: err.message,
                    });
                }
            }
        }
        Ok(())
    }
}
