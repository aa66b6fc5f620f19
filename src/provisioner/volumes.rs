//! Volume-side reconciliation: reacting to volume and volume-attachment
//! changes, and realising the pending sets through volume sources.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::accessor::LookupError;
use crate::model::Life;
use crate::provider::{VolumeAttachmentParams, VolumeParams};
use crate::tags::{AttachmentId, Tag, VolumeAttachmentId, VolumeTag};

use super::{
    PendingError, ProvisionerError, SourceOpError, SourceSetupError, WorkerCore,
};

impl WorkerCore {
    /// Folds a volume change set into the pending and provisioned sets.
    pub(crate) async fn volumes_changed(
        &mut self,
        ids: Vec<String>,
    ) -> Result<(), ProvisionerError> {
        let mut tags = Vec::with_capacity(ids.len());
        for id in ids {
            match VolumeTag::parse(&id) {
                Ok(tag) => tags.push(tag),
                Err(err) => warn!(%id, error = %err, "ignoring malformed volume id"),
            }
        }
        let lives = self
            .lifecycle
            .volume_life(&tags)
            .await
            .map_err(|source| ProvisionerError::Accessor {
                stage: "getting volume lifecycle",
                source,
            })?;
        let mut alive = Vec::new();
        for (tag, life) in tags.into_iter().zip(lives) {
            match life {
                Ok(Life::Alive) => alive.push(tag),
                Ok(life) => {
                    // Destruction is not driven from here yet.
                    debug!(volume = %tag, %life, "ignoring non-alive volume");
                }
                Err(err) => warn!(volume = %tag, error = %err, "getting volume life"),
            }
        }

        let lookups = self
            .volumes
            .volumes(&alive)
            .await
            .map_err(|source| ProvisionerError::Accessor {
                stage: "getting volumes",
                source,
            })?;
        let mut unprovisioned = Vec::new();
        for (tag, lookup) in alive.into_iter().zip(lookups) {
            match lookup {
                Ok(volume) => {
                    self.pending_volumes.remove(&tag);
                    self.provisioned_volumes.insert(tag, volume);
                }
                Err(LookupError::NotProvisioned(_) | LookupError::NotFound(_)) => {
                    unprovisioned.push(tag);
                }
                Err(err) => warn!(volume = %tag, error = %err, "getting volume"),
            }
        }

        if unprovisioned.is_empty() {
            return Ok(());
        }
        let params = self
            .volumes
            .volume_params(&unprovisioned)
            .await
            .map_err(|source| ProvisionerError::Accessor {
                stage: "getting volume params",
                source,
            })?;
        for (tag, params) in unprovisioned.into_iter().zip(params) {
            match params {
                Ok(params) => {
                    self.pending_volumes.insert(tag, params);
                }
                Err(err) => warn!(volume = %tag, error = %err, "getting volume params"),
            }
        }
        Ok(())
    }

    /// Folds a volume-attachment change set into the pending set,
    /// suppressing ids already handled during this session.
    pub(crate) async fn volume_attachments_changed(
        &mut self,
        ids: Vec<VolumeAttachmentId>,
    ) -> Result<(), ProvisionerError> {
        let fresh: Vec<VolumeAttachmentId> = ids
            .into_iter()
            .filter(|id| !self.session_volume_attachments.contains(id))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        let params = self
            .volumes
            .volume_attachment_params(&fresh)
            .await
            .map_err(|source| ProvisionerError::Accessor {
                stage: "getting volume attachment params",
                source,
            })?;
        for (id, params) in fresh.into_iter().zip(params) {
            match params {
                Ok(params) => {
                    self.pending_volume_attachments.insert(id, params);
                }
                Err(err) => {
                    warn!(attachment = %id, error = %err, "getting volume attachment params");
                }
            }
        }
        Ok(())
    }

    /// Creates every pending volume that is ready, batched per source,
    /// and publishes the results.
    pub(crate) async fn process_pending_volumes(&mut self) -> Result<(), PendingError> {
        let Some(environ) = self.environ_config.clone() else {
            return Ok(());
        };
        let resource_tags = environ.resource_tags();

        let mut to_watch = Vec::new();
        let mut groups: BTreeMap<String, Vec<VolumeParams>> = BTreeMap::new();
        for (tag, params) in &self.pending_volumes {
            let mut params = params.clone();
            if let Some(attachment) = &mut params.attachment {
                match self.instance_id_for(&attachment.machine, attachment.instance_id.as_ref()) {
                    Some(instance_id) => attachment.instance_id = Some(instance_id),
                    None => {
                        debug!(
                            volume = %tag,
                            machine = %attachment.machine,
                            "deferring volume until its machine is provisioned"
                        );
                        to_watch.push(attachment.machine.clone());
                        continue;
                    }
                }
            }
            let provider = self.registry.lookup(&params.provider).map_err(|err| {
                PendingError::CreatingVolumes(SourceOpError::VolumeSource(
                    SourceSetupError::Storage {
                        name: params.provider.clone(),
                        message: err.to_string(),
                    },
                ))
            })?;
            if !self.creation_allowed(provider.is_dynamic()) {
                debug!(
                    volume = %tag,
                    provider = %params.provider,
                    "not creating volume from non-dynamic provider"
                );
                continue;
            }
            params.resource_tags = resource_tags.clone();
            groups.entry(params.provider.clone()).or_default().push(params);
        }
        for machine in to_watch {
            self.watch_machine(&machine);
        }

        for (name, batch) in groups {
            let source = self.volume_source(&environ, &name).map_err(|err| {
                PendingError::CreatingVolumes(SourceOpError::VolumeSource(err))
            })?;
            let results = source
                .create_volumes(&batch)
                .await
                .map_err(|err| PendingError::CreatingVolumes(SourceOpError::Call(err)))?;
            let mut created = Vec::new();
            for (params, result) in batch.iter().zip(results) {
                match result {
                    Ok(volume) => created.push(volume),
                    Err(err) => {
                        // Retried when the next change event arrives.
                        warn!(volume = %params.tag, error = %err, "creating volume");
                    }
                }
            }
            if created.is_empty() {
                continue;
            }
            let outcomes = self
                .volumes
                .set_volume_info(&created)
                .await
                .map_err(|source| PendingError::Setter {
                    what: "volumes",
                    source,
                })?;
            for (volume, outcome) in created.into_iter().zip(outcomes) {
                match outcome {
                    Ok(()) => {
                        self.pending_volumes.remove(&volume.tag);
                        self.provisioned_volumes.insert(volume.tag.clone(), volume);
                    }
                    Err(err) => {
                        return Err(PendingError::PublishVolume {
                            tag: volume.tag,
                            message: err.message,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Attaches every pending volume attachment whose volume and machine
    /// are both provisioned, batched per source, and publishes the
    /// results.
    pub(crate) async fn process_pending_volume_attachments(
        &mut self,
    ) -> Result<(), PendingError> {
        let Some(environ) = self.environ_config.clone() else {
            return Ok(());
        };

        let mut to_watch = Vec::new();
        let mut groups: BTreeMap<String, Vec<VolumeAttachmentParams>> = BTreeMap::new();
        for (id, params) in &self.pending_volume_attachments {
            let mut params = params.clone();
            match self.instance_id_for(&params.machine, params.instance_id.as_ref()) {
                Some(instance_id) => params.instance_id = Some(instance_id),
                None => {
                    debug!(attachment = %id, "deferring attachment until its machine is provisioned");
                    to_watch.push(params.machine.clone());
                    continue;
                }
            }
            let Some(volume) = self.provisioned_volumes.get(&params.volume) else {
                debug!(attachment = %id, "deferring attachment until its volume is provisioned");
                continue;
            };
            params.volume_id = Some(volume.info.volume_id.clone());
            groups.entry(params.provider.clone()).or_default().push(params);
        }
        for machine in to_watch {
            self.watch_machine(&machine);
        }

        for (name, batch) in groups {
            let source = self.volume_source(&environ, &name).map_err(|err| {
                PendingError::AttachingVolumes(SourceOpError::VolumeSource(err))
            })?;
            let results = source
                .attach_volumes(&batch)
                .await
                .map_err(|err| PendingError::AttachingVolumes(SourceOpError::Call(err)))?;
            let mut attached = Vec::new();
            for (params, result) in batch.iter().zip(results) {
                match result {
                    Ok(attachment) => attached.push(attachment),
                    Err(err) => {
                        warn!(
                            volume = %params.volume,
                            machine = %params.machine,
                            error = %err,
                            "attaching volume"
                        );
                    }
                }
            }
            if attached.is_empty() {
                continue;
            }
            let outcomes = self
                .volumes
                .set_volume_attachment_info(&attached)
                .await
                .map_err(|source| PendingError::Setter {
                    what: "volume attachments",
                    source,
                })?;
            for (attachment, outcome) in attached.into_iter().zip(outcomes) {
                let id = AttachmentId::new(attachment.machine.clone(), attachment.volume.clone());
                match outcome {
                    Ok(()) => {
                        self.pending_volume_attachments.remove(&id);
                        self.session_volume_attachments.insert(id);
                    }
                    Err(err) => {
                        return Err(PendingError::PublishVolumeAttachment {
                            volume: attachment.volume,
                            machine: attachment.machine,
                            message: err.message,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
