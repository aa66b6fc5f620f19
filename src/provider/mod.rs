//! Storage provider contract: the capability set a registered provider
//! exposes, the sources it hands out, and the parameter/info records that
//! cross the provider boundary.
//!
//! Providers are never downcast; the worker drives them exclusively
//! through the four batch operations declared on
//! [`VolumeSource`] and [`FilesystemSource`]. Each operation returns one
//! result per input item so that partial success is expressible.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tags::{FilesystemTag, MachineTag, VolumeTag};

pub mod registry;

pub use registry::{Registry, RegistryError};

/// The kind of storage a declaration asks for.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// A mountable filesystem.
    Filesystem,
    /// A raw block device.
    Block,
}

/// Scope of the resources a provider produces: visible to the whole
/// environment, or bound to a single machine.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderScope {
    /// Resources outlive any one machine.
    Environ,
    /// Resources exist on a particular machine only.
    Machine,
}

/// Provider-assigned identifier for a provisioned machine.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Creates an instance id from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Environment configuration as published by the environ accessor.
///
/// Attributes are carried verbatim; the worker only interprets the
/// `resource-tags` attribute, which is passed through to providers.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EnvironConfig {
    /// Environment name.
    pub name: String,
    /// Free-form configuration attributes.
    pub attrs: BTreeMap<String, Value>,
}

impl EnvironConfig {
    /// Creates a config from a name and attribute map.
    #[must_use]
    pub fn new(name: impl Into<String>, attrs: BTreeMap<String, Value>) -> Self {
        Self {
            name: name.into(),
            attrs,
        }
    }

    /// Returns a copy with `overrides` merged over the existing
    /// attributes.
    #[must_use]
    pub fn apply(&self, overrides: BTreeMap<String, Value>) -> Self {
        let mut attrs = self.attrs.clone();
        attrs.extend(overrides);
        Self {
            name: self.name.clone(),
            attrs,
        }
    }

    /// Extracts the resource tags providers should stamp onto created
    /// resources. Non-string entries are ignored.
    #[must_use]
    pub fn resource_tags(&self) -> BTreeMap<String, String> {
        let Some(Value::Object(tags)) = self.attrs.get("resource-tags") else {
            return BTreeMap::new();
        };
        tags.iter()
            .filter_map(|(key, value)| {
                value
                    .as_str()
                    .map(|text| (key.clone(), text.to_owned()))
            })
            .collect()
    }
}

/// Configuration of a storage pool: the provider it selects and the
/// provider-specific attributes it carries.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PoolConfig {
    /// Pool name as referenced by storage declarations.
    pub name: String,
    /// Registered provider the pool selects.
    pub provider: String,
    /// Provider-specific attributes.
    pub attrs: BTreeMap<String, Value>,
}

impl PoolConfig {
    /// Creates a pool configuration with no attributes.
    #[must_use]
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            attrs: BTreeMap::new(),
        }
    }
}

/// Provisioned facts about a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeInfo {
    /// Provider-side volume identifier.
    pub volume_id: String,
    /// Hardware serial, when the provider reports one.
    pub hardware_id: Option<String>,
    /// Size in mebibytes.
    pub size: u64,
    /// Whether the volume outlives the machine it is attached to.
    pub persistent: bool,
}

/// A volume together with its provisioned info, as published to state.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Volume {
    /// Volume this record describes.
    pub tag: VolumeTag,
    /// Provisioned facts.
    pub info: VolumeInfo,
}

/// Provisioned facts about a volume attachment.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeAttachmentInfo {
    /// Device name the volume appears as on the machine.
    pub device_name: String,
    /// Whether the attachment is read-only.
    pub read_only: bool,
}

/// A volume attachment together with its provisioned info.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeAttachment {
    /// Attached volume.
    pub volume: VolumeTag,
    /// Machine the volume is attached to.
    pub machine: MachineTag,
    /// Provisioned facts.
    pub info: VolumeAttachmentInfo,
}

/// Provisioned facts about a filesystem.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FilesystemInfo {
    /// Provider-side filesystem identifier.
    pub filesystem_id: String,
    /// Size in mebibytes.
    pub size: u64,
}

/// A filesystem together with its provisioned info.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Filesystem {
    /// Filesystem this record describes.
    pub tag: FilesystemTag,
    /// Backing volume, for volume-backed filesystems.
    pub backing_volume: Option<VolumeTag>,
    /// Provisioned facts.
    pub info: FilesystemInfo,
}

/// Provisioned facts about a filesystem attachment.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FilesystemAttachmentInfo {
    /// Mount point on the machine.
    pub mount_point: Utf8PathBuf,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// A filesystem attachment together with its provisioned info.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FilesystemAttachment {
    /// Attached filesystem.
    pub filesystem: FilesystemTag,
    /// Machine the filesystem is attached to.
    pub machine: MachineTag,
    /// Provisioned facts.
    pub info: FilesystemAttachmentInfo,
}

/// A block device observed on a machine.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockDevice {
    /// Kernel device name (`xvdf1`).
    pub device_name: String,
    /// Hardware serial, when known.
    pub hardware_id: Option<String>,
    /// Size in mebibytes.
    pub size: u64,
}

/// Desired state of an unprovisioned volume.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeParams {
    /// Volume to create.
    pub tag: VolumeTag,
    /// Requested size in mebibytes.
    pub size: u64,
    /// Provider responsible for the volume.
    pub provider: String,
    /// Provider-specific attributes from the pool configuration.
    pub attributes: BTreeMap<String, Value>,
    /// Tags to stamp onto the created resource, from environ config.
    pub resource_tags: BTreeMap<String, String>,
    /// Machine attachment the volume is destined for, when known.
    pub attachment: Option<VolumeAttachmentParams>,
}

/// Desired state of an unprovisioned volume attachment.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeAttachmentParams {
    /// Volume to attach.
    pub volume: VolumeTag,
    /// Provider-side volume identifier, once the volume is provisioned.
    pub volume_id: Option<String>,
    /// Target machine.
    pub machine: MachineTag,
    /// Instance id of the target machine, once provisioned.
    pub instance_id: Option<InstanceId>,
    /// Provider responsible for the attachment.
    pub provider: String,
    /// Whether the attachment should be read-only.
    pub read_only: bool,
}

/// Desired state of an unprovisioned filesystem.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FilesystemParams {
    /// Filesystem to create.
    pub tag: FilesystemTag,
    /// Backing volume, for volume-backed filesystems.
    pub backing_volume: Option<VolumeTag>,
    /// Requested size in mebibytes.
    pub size: u64,
    /// Provider responsible for the filesystem.
    pub provider: String,
    /// Provider-specific attributes from the pool configuration.
    pub attributes: BTreeMap<String, Value>,
    /// Tags to stamp onto the created resource, from environ config.
    pub resource_tags: BTreeMap<String, String>,
}

/// Desired state of an unprovisioned filesystem attachment.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FilesystemAttachmentParams {
    /// Filesystem to attach.
    pub filesystem: FilesystemTag,
    /// Provider-side filesystem identifier, once provisioned.
    pub filesystem_id: Option<String>,
    /// Backing volume of the filesystem, when volume-backed.
    pub backing_volume: Option<VolumeTag>,
    /// Target machine.
    pub machine: MachineTag,
    /// Instance id of the target machine, once provisioned.
    pub instance_id: Option<InstanceId>,
    /// Provider responsible for the attachment.
    pub provider: String,
    /// Requested mount point, when the declaration names one.
    pub mount_point: Option<Utf8PathBuf>,
    /// Whether the mount should be read-only.
    pub read_only: bool,
}

/// Errors raised by providers and their sources.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SourceError {
    /// Raised per item when a backing block device is not yet visible.
    #[error("block device for volume {volume} on machine {machine} not attached")]
    NotAttached {
        /// Backing volume whose device is missing.
        volume: VolumeTag,
        /// Machine the device was expected on.
        machine: MachineTag,
    },
    /// Raised per item when an input is malformed for this source.
    #[error("invalid {resource} params: {message}")]
    InvalidParams {
        /// Resource kind the params described.
        resource: &'static str,
        /// What was wrong with them.
        message: String,
    },
    /// Wrapper for provider-level failures.
    #[error("{message}")]
    Provider {
        /// Message reported by the provider.
        message: String,
    },
}

impl SourceError {
    /// Wraps any displayable provider failure.
    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }
}

/// Future returned by source operations.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SourceError>> + Send + 'a>>;

/// Per-item outcome of a batch source operation.
pub type SourceResult<T> = Result<T, SourceError>;

/// Creates and attaches volumes.
pub trait VolumeSource: Send + Sync {
    /// Creates the described volumes, one result per input item.
    fn create_volumes<'a>(
        &'a self,
        params: &'a [VolumeParams],
    ) -> SourceFuture<'a, Vec<SourceResult<Volume>>>;

    /// Attaches the described volumes, one result per input item.
    fn attach_volumes<'a>(
        &'a self,
        params: &'a [VolumeAttachmentParams],
    ) -> SourceFuture<'a, Vec<SourceResult<VolumeAttachment>>>;
}

/// Creates and attaches filesystems.
pub trait FilesystemSource: Send + Sync {
    /// Creates the described filesystems, one result per input item.
    fn create_filesystems<'a>(
        &'a self,
        params: &'a [FilesystemParams],
    ) -> SourceFuture<'a, Vec<SourceResult<Filesystem>>>;

    /// Attaches the described filesystems, one result per input item.
    fn attach_filesystems<'a>(
        &'a self,
        params: &'a [FilesystemAttachmentParams],
    ) -> SourceFuture<'a, Vec<SourceResult<FilesystemAttachment>>>;
}

/// Capability set exposed by a registered storage provider.
pub trait StorageProvider: Send + Sync {
    /// Whether the provider can provision after environment bootstrap.
    fn is_dynamic(&self) -> bool;

    /// Scope of the resources this provider produces.
    fn scope(&self) -> ProviderScope;

    /// Whether the provider can natively produce the given kind. A
    /// filesystem declaration on a block-only provider is realised
    /// through a backing volume instead.
    fn supports(&self, kind: StorageKind) -> bool;

    /// Builds a volume source for the given environment and pool.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the configuration cannot support a
    /// source, or the provider cannot produce volumes at all.
    fn volume_source(
        &self,
        environ: &EnvironConfig,
        pool: &PoolConfig,
    ) -> Result<Arc<dyn VolumeSource>, SourceError>;

    /// Builds a filesystem source for the given environment and pool.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the configuration cannot support a
    /// source, or the provider cannot produce filesystems at all.
    fn filesystem_source(
        &self,
        environ: &EnvironConfig,
        pool: &PoolConfig,
    ) -> Result<Arc<dyn FilesystemSource>, SourceError>;
}
