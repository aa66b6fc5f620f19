//! Entity snapshots and supporting records for the state model.
//!
//! Entities reference one another by tag only; snapshots returned from
//! queries are owned copies, so holding one never pins the store.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::provider::{
    BlockDevice, FilesystemAttachmentInfo, InstanceId, StorageKind, VolumeAttachmentInfo,
};
use crate::tags::{FilesystemTag, MachineTag, StorageTag, UnitTag, VolumeTag};

use super::Error;

/// Lifecycle of a durable entity.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    /// The entity is in service.
    #[default]
    Alive,
    /// The entity is being torn down.
    Dying,
    /// The entity is gone but not yet removed from the store.
    Dead,
}

impl std::fmt::Display for Life {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Alive => "alive",
            Self::Dying => "dying",
            Self::Dead => "dead",
        })
    }
}

/// Constraints attached to one named storage declaration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StorageConstraints {
    /// Pool name; empty selects the kind's default pool.
    pub pool: String,
    /// Requested size in mebibytes.
    pub size: u64,
    /// Number of storage instances per unit.
    pub count: u64,
}

impl StorageConstraints {
    /// Creates constraints from their parts.
    #[must_use]
    pub fn new(pool: impl Into<String>, size: u64, count: u64) -> Self {
        Self {
            pool: pool.into(),
            size,
            count,
        }
    }
}

/// A named storage declaration carried by a service definition.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StorageDeclaration {
    /// Kind of storage the service requires.
    pub kind: StorageKind,
    /// Constraints chosen when the service was added.
    pub constraints: StorageConstraints,
}

/// A unit's logical storage requirement.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StorageInstance {
    /// Storage instance tag (`data/0`).
    pub tag: StorageTag,
    /// Kind of storage required.
    pub kind: StorageKind,
    /// Unit the requirement belongs to.
    pub owner: UnitTag,
    /// Pool that realises the requirement.
    pub pool: String,
    /// Requested size in mebibytes.
    pub size: u64,
    /// Lifecycle state.
    pub life: Life,
}

/// Binding of a storage instance to a unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StorageAttachment {
    /// Storage instance attached.
    pub storage: StorageTag,
    /// Unit it is attached to.
    pub unit: UnitTag,
    /// Lifecycle state.
    pub life: Life,
}

/// Desired state recorded for an unprovisioned volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeParams {
    /// Pool the volume is to be created from.
    pub pool: String,
    /// Requested size in mebibytes.
    pub size: u64,
}

/// Provisioned facts recorded for a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeInfo {
    /// Pool the volume belongs to; filled from params when omitted.
    pub pool: Option<String>,
    /// Provider-side volume identifier.
    pub volume_id: String,
    /// Hardware serial, when the provider reports one.
    pub hardware_id: Option<String>,
    /// Size in mebibytes.
    pub size: u64,
    /// Whether the volume outlives its attachments.
    pub persistent: bool,
}

/// A block-device volume entity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Volume tag.
    pub tag: VolumeTag,
    /// Storage instance currently assigned to the volume, if any.
    pub storage: Option<StorageTag>,
    /// Desired state, present until the volume is provisioned.
    pub params: Option<VolumeParams>,
    /// Provisioned facts, present from provisioning onwards.
    pub info: Option<VolumeInfo>,
    /// Lifecycle state.
    pub life: Life,
}

impl Volume {
    /// Returns the provisioned info.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VolumeNotProvisioned`] while only params exist.
    pub fn info(&self) -> Result<&VolumeInfo, Error> {
        self.info
            .as_ref()
            .ok_or_else(|| Error::VolumeNotProvisioned(self.tag.clone()))
    }

    /// Returns the desired-state params, when still unprovisioned.
    #[must_use]
    pub fn params(&self) -> Option<&VolumeParams> {
        self.params.as_ref()
    }

    /// Returns the storage instance assigned to this volume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VolumeUnassigned`] when no instance is assigned.
    pub fn storage_instance(&self) -> Result<&StorageTag, Error> {
        self.storage
            .as_ref()
            .ok_or_else(|| Error::VolumeUnassigned(self.tag.clone()))
    }
}

/// Desired state recorded for an unprovisioned filesystem.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilesystemParams {
    /// Pool the filesystem is to be created from.
    pub pool: String,
    /// Requested size in mebibytes.
    pub size: u64,
}

/// Provisioned facts recorded for a filesystem.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FilesystemInfo {
    /// Pool the filesystem belongs to; filled from params when omitted.
    pub pool: Option<String>,
    /// Provider-side filesystem identifier.
    pub filesystem_id: String,
    /// Size in mebibytes.
    pub size: u64,
}

/// A mountable filesystem entity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Filesystem {
    /// Filesystem tag.
    pub tag: FilesystemTag,
    /// Storage instance currently assigned to the filesystem, if any.
    pub storage: Option<StorageTag>,
    /// Backing volume, for volume-backed filesystems.
    pub backing_volume: Option<VolumeTag>,
    /// Desired state, present until the filesystem is provisioned.
    pub params: Option<FilesystemParams>,
    /// Provisioned facts, present from provisioning onwards.
    pub info: Option<FilesystemInfo>,
    /// Lifecycle state.
    pub life: Life,
}

impl Filesystem {
    /// Returns the provisioned info.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilesystemNotProvisioned`] while only params
    /// exist.
    pub fn info(&self) -> Result<&FilesystemInfo, Error> {
        self.info
            .as_ref()
            .ok_or_else(|| Error::FilesystemNotProvisioned(self.tag.clone()))
    }

    /// Returns the desired-state params, when still unprovisioned.
    #[must_use]
    pub fn params(&self) -> Option<&FilesystemParams> {
        self.params.as_ref()
    }

    /// Returns the backing volume of a volume-backed filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoBackingVolume`] for directly-provided
    /// filesystems.
    pub fn volume(&self) -> Result<&VolumeTag, Error> {
        self.backing_volume.as_ref().ok_or(Error::NoBackingVolume)
    }

    /// Returns the storage instance assigned to this filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilesystemUnassigned`] when no instance is
    /// assigned.
    pub fn storage_instance(&self) -> Result<&StorageTag, Error> {
        self.storage
            .as_ref()
            .ok_or_else(|| Error::FilesystemUnassigned(self.tag.clone()))
    }
}

/// Desired state recorded for an unprovisioned volume attachment.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeAttachmentParams {
    /// Whether the attachment should be read-only.
    pub read_only: bool,
}

/// Binding of a volume to a machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeAttachment {
    /// Attached volume.
    pub volume: VolumeTag,
    /// Machine the volume is attached to.
    pub machine: MachineTag,
    /// Desired state, present until the attachment is provisioned.
    pub params: Option<VolumeAttachmentParams>,
    /// Provisioned facts, present from provisioning onwards.
    pub info: Option<VolumeAttachmentInfo>,
    /// Lifecycle state.
    pub life: Life,
}

impl VolumeAttachment {
    /// Returns the provisioned info.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VolumeAttachmentNotProvisioned`] while only
    /// params exist.
    pub fn info(&self) -> Result<&VolumeAttachmentInfo, Error> {
        self.info
            .as_ref()
            .ok_or_else(|| Error::VolumeAttachmentNotProvisioned {
                volume: self.volume.clone(),
                machine: self.machine.clone(),
            })
    }

    /// Returns the desired-state params, when still unprovisioned.
    #[must_use]
    pub fn params(&self) -> Option<&VolumeAttachmentParams> {
        self.params.as_ref()
    }
}

/// Desired state recorded for an unprovisioned filesystem attachment.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FilesystemAttachmentParams {
    /// Requested mount point, when the declaration names one.
    pub location: Option<Utf8PathBuf>,
    /// Whether the mount should be read-only.
    pub read_only: bool,
}

/// Binding of a filesystem to a machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilesystemAttachment {
    /// Attached filesystem.
    pub filesystem: FilesystemTag,
    /// Machine the filesystem is attached to.
    pub machine: MachineTag,
    /// Desired state, present until the attachment is provisioned.
    pub params: Option<FilesystemAttachmentParams>,
    /// Provisioned facts, present from provisioning onwards.
    pub info: Option<FilesystemAttachmentInfo>,
    /// Lifecycle state.
    pub life: Life,
}

impl FilesystemAttachment {
    /// Returns the provisioned info.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilesystemAttachmentNotProvisioned`] while only
    /// params exist.
    pub fn info(&self) -> Result<&FilesystemAttachmentInfo, Error> {
        self.info
            .as_ref()
            .ok_or_else(|| Error::FilesystemAttachmentNotProvisioned {
                filesystem: self.filesystem.clone(),
                machine: self.machine.clone(),
            })
    }

    /// Returns the desired-state params, when still unprovisioned.
    #[must_use]
    pub fn params(&self) -> Option<&FilesystemAttachmentParams> {
        self.params.as_ref()
    }
}

/// A machine known to the model.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Machine {
    /// Machine tag.
    pub tag: MachineTag,
    /// Instance id, present once the machine is provisioned.
    pub instance_id: Option<InstanceId>,
    /// Block devices observed on the machine, keyed by backing volume.
    pub block_devices: std::collections::BTreeMap<VolumeTag, BlockDevice>,
    /// Lifecycle state.
    pub life: Life,
}

impl Machine {
    /// Returns the instance id of a provisioned machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MachineNotProvisioned`] before provisioning.
    pub fn instance_id(&self) -> Result<&InstanceId, Error> {
        self.instance_id
            .as_ref()
            .ok_or_else(|| Error::MachineNotProvisioned(self.tag.clone()))
    }
}
