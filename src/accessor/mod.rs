//! Narrow contracts the provisioner worker consumes.
//!
//! Each accessor exposes three things: change streams, lookups of
//! already-provisioned entities, and setters that publish provisioned
//! facts back. Setters return one result per input item; a failure of
//! the setter itself (the outer `Result`) is fatal to the worker, while
//! per-item errors are attributed to individual entities.
//!
//! Concrete implementations adapt either the in-crate state model
//! ([`state`]) or a remote RPC surface.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::model::Life;
use crate::provider::{
    BlockDevice, EnvironConfig, Filesystem, FilesystemAttachment, FilesystemAttachmentParams,
    FilesystemParams, InstanceId, Volume, VolumeAttachment, VolumeAttachmentParams, VolumeParams,
};
use crate::tags::{
    EnvironTag, FilesystemAttachmentId, FilesystemTag, MachineTag, VolumeAttachmentId, VolumeTag,
};
use crate::watcher::{NotifyWatcher, StringsWatcher, Watcher};

pub mod state;

/// The slice of the model a worker is responsible for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Scope {
    /// Environment-scoped resources.
    Environ(EnvironTag),
    /// Resources scoped to a single machine.
    Machine(MachineTag),
}

impl Scope {
    /// Returns the machine for machine-scoped workers.
    #[must_use]
    pub fn machine(&self) -> Option<&MachineTag> {
        match self {
            Self::Environ(_) => None,
            Self::Machine(machine) => Some(machine),
        }
    }
}

/// Fatal accessor failure: the backing stream or surface is broken.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct AccessorError {
    /// Operator-facing description.
    pub message: String,
}

impl AccessorError {
    /// Creates an error from any displayable cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-item lookup failure, typed so callers can discriminate deferral
/// signals from hard failures.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LookupError {
    /// The entity does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The entity exists but has no provisioned info yet.
    #[error("{0} not provisioned")]
    NotProvisioned(String),
    /// Any other per-item failure.
    #[error("{0}")]
    Other(String),
}

/// Per-item result of a lookup.
pub type LookupResult<T> = Result<T, LookupError>;

/// Per-item failure reported by a setter.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct OperationError {
    /// Message attributed to the item.
    pub message: String,
}

impl OperationError {
    /// Creates an error from any displayable cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-item result of a setter.
pub type ItemResult = Result<(), OperationError>;

/// Future returned by accessor operations.
pub type AccessorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, AccessorError>> + Send + 'a>>;

/// Volume-side contract consumed by the worker.
pub trait VolumeAccessor: Send + Sync {
    /// Watches volumes in the worker's scope.
    fn watch_volumes(&self) -> StringsWatcher;

    /// Watches volume attachments in the worker's scope.
    fn watch_volume_attachments(&self) -> Watcher<Vec<VolumeAttachmentId>>;

    /// Watches the block devices observed on a machine.
    fn watch_block_devices(&self, machine: &MachineTag) -> NotifyWatcher;

    /// Looks up provisioned volumes.
    fn volumes<'a>(
        &'a self,
        tags: &'a [VolumeTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<Volume>>>;

    /// Looks up provisioned volume attachments.
    fn volume_attachments<'a>(
        &'a self,
        ids: &'a [VolumeAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<VolumeAttachment>>>;

    /// Looks up desired-state params for unprovisioned volumes.
    fn volume_params<'a>(
        &'a self,
        tags: &'a [VolumeTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<VolumeParams>>>;

    /// Looks up desired-state params for unprovisioned attachments.
    fn volume_attachment_params<'a>(
        &'a self,
        ids: &'a [VolumeAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<VolumeAttachmentParams>>>;

    /// Looks up the block devices backing the given attachments.
    fn block_devices<'a>(
        &'a self,
        ids: &'a [VolumeAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<BlockDevice>>>;

    /// Publishes provisioned volume info back to the model.
    fn set_volume_info<'a>(
        &'a self,
        volumes: &'a [Volume],
    ) -> AccessorFuture<'a, Vec<ItemResult>>;

    /// Publishes provisioned volume attachment info back to the model.
    fn set_volume_attachment_info<'a>(
        &'a self,
        attachments: &'a [VolumeAttachment],
    ) -> AccessorFuture<'a, Vec<ItemResult>>;
}

/// Filesystem-side contract consumed by the worker.
pub trait FilesystemAccessor: Send + Sync {
    /// Watches filesystems in the worker's scope.
    fn watch_filesystems(&self) -> StringsWatcher;

    /// Watches filesystem attachments in the worker's scope.
    fn watch_filesystem_attachments(&self) -> Watcher<Vec<FilesystemAttachmentId>>;

    /// Looks up provisioned filesystems.
    fn filesystems<'a>(
        &'a self,
        tags: &'a [FilesystemTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<Filesystem>>>;

    /// Looks up provisioned filesystem attachments.
    fn filesystem_attachments<'a>(
        &'a self,
        ids: &'a [FilesystemAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<FilesystemAttachment>>>;

    /// Looks up desired-state params for unprovisioned filesystems.
    fn filesystem_params<'a>(
        &'a self,
        tags: &'a [FilesystemTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<FilesystemParams>>>;

    /// Looks up desired-state params for unprovisioned attachments.
    fn filesystem_attachment_params<'a>(
        &'a self,
        ids: &'a [FilesystemAttachmentId],
    ) -> AccessorFuture<'a, Vec<LookupResult<FilesystemAttachmentParams>>>;

    /// Publishes provisioned filesystem info back to the model.
    fn set_filesystem_info<'a>(
        &'a self,
        filesystems: &'a [Filesystem],
    ) -> AccessorFuture<'a, Vec<ItemResult>>;

    /// Publishes provisioned filesystem attachment info back to the
    /// model.
    fn set_filesystem_attachment_info<'a>(
        &'a self,
        attachments: &'a [FilesystemAttachment],
    ) -> AccessorFuture<'a, Vec<ItemResult>>;
}

/// Machine-side contract consumed by the worker.
pub trait MachineAccessor: Send + Sync {
    /// Looks up instance ids for provisioned machines.
    fn instance_ids<'a>(
        &'a self,
        machines: &'a [MachineTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<InstanceId>>>;

    /// Watches a machine for provisioning changes.
    fn watch_machine(&self, machine: &MachineTag) -> NotifyWatcher;
}

/// Environment configuration contract consumed by the worker.
pub trait EnvironAccessor: Send + Sync {
    /// Watches for environment configuration changes.
    fn watch_environ(&self) -> NotifyWatcher;

    /// Fetches the current environment configuration.
    fn model_config(&self) -> AccessorFuture<'_, EnvironConfig>;
}

/// Lifecycle queries consumed by the worker.
pub trait LifecycleManager: Send + Sync {
    /// Returns the lifecycle state of each volume.
    fn volume_life<'a>(
        &'a self,
        tags: &'a [VolumeTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<Life>>>;

    /// Returns the lifecycle state of each filesystem.
    fn filesystem_life<'a>(
        &'a self,
        tags: &'a [FilesystemTag],
    ) -> AccessorFuture<'a, Vec<LookupResult<Life>>>;
}
