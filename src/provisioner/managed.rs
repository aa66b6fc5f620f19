//! A synthesised filesystem source for volume-backed filesystems.
//!
//! The managed source calls no external service: it is a pure function
//! of the block devices currently visible on one machine and the
//! filesystems already provisioned. Filesystem info is fabricated from
//! the backing block device, and attachments mount under the worker's
//! storage directory. Repeated calls with identical inputs produce
//! identical outputs.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::provider::{
    BlockDevice, Filesystem, FilesystemAttachment, FilesystemAttachmentInfo,
    FilesystemAttachmentParams, FilesystemInfo, FilesystemParams, FilesystemSource, SourceError,
    SourceFuture, SourceResult,
};
use crate::tags::{FilesystemTag, MachineTag, VolumeTag};

/// Filesystem source over already-attached block devices.
#[derive(Clone, Debug)]
pub struct ManagedFilesystemSource {
    storage_dir: Utf8PathBuf,
    machine: MachineTag,
    block_devices: BTreeMap<VolumeTag, BlockDevice>,
    filesystems: BTreeMap<FilesystemTag, Filesystem>,
}

impl ManagedFilesystemSource {
    /// Creates a source from the devices visible on `machine` and the
    /// filesystems already provisioned.
    #[must_use]
    pub fn new(
        storage_dir: Utf8PathBuf,
        machine: MachineTag,
        block_devices: BTreeMap<VolumeTag, BlockDevice>,
        filesystems: BTreeMap<FilesystemTag, Filesystem>,
    ) -> Self {
        Self {
            storage_dir,
            machine,
            block_devices,
            filesystems,
        }
    }

    fn backing_device(&self, volume: &VolumeTag) -> SourceResult<&BlockDevice> {
        self.block_devices
            .get(volume)
            .ok_or_else(|| SourceError::NotAttached {
                volume: volume.clone(),
                machine: self.machine.clone(),
            })
    }

    fn create_one(&self, params: &FilesystemParams) -> SourceResult<Filesystem> {
        let backing = params
            .backing_volume
            .as_ref()
            .ok_or_else(|| SourceError::InvalidParams {
                resource: "filesystem",
                message: format!("filesystem {} has no backing volume", params.tag),
            })?;
        let device = self.backing_device(backing)?;
        Ok(Filesystem {
            tag: params.tag.clone(),
            backing_volume: Some(backing.clone()),
            info: FilesystemInfo {
                filesystem_id: device.device_name.clone(),
                size: device.size,
            },
        })
    }

    fn attach_one(
        &self,
        params: &FilesystemAttachmentParams,
    ) -> SourceResult<FilesystemAttachment> {
        let backing = params
            .backing_volume
            .clone()
            .or_else(|| {
                self.filesystems
                    .get(&params.filesystem)
                    .and_then(|filesystem| filesystem.backing_volume.clone())
            })
            .ok_or_else(|| SourceError::InvalidParams {
                resource: "filesystem attachment",
                message: format!("filesystem {} has no backing volume", params.filesystem),
            })?;
        let device = self.backing_device(&backing)?;
        let mount_point = params
            .mount_point
            .clone()
            .unwrap_or_else(|| self.storage_dir.join(&device.device_name));
        Ok(FilesystemAttachment {
            filesystem: params.filesystem.clone(),
            machine: params.machine.clone(),
            info: FilesystemAttachmentInfo {
                mount_point,
                read_only: true,
            },
        })
    }
}

impl FilesystemSource for ManagedFilesystemSource {
    fn create_filesystems<'a>(
        &'a self,
        params: &'a [FilesystemParams],
    ) -> SourceFuture<'a, Vec<SourceResult<Filesystem>>> {
        Box::pin(async move { Ok(params.iter().map(|params| self.create_one(params)).collect()) })
    }

    fn attach_filesystems<'a>(
        &'a self,
        params: &'a [FilesystemAttachmentParams],
    ) -> SourceFuture<'a, Vec<SourceResult<FilesystemAttachment>>> {
        Box::pin(async move { Ok(params.iter().map(|params| self.attach_one(params)).collect()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{FilesystemTag, Tag};

    fn device(name: &str, size: u64) -> BlockDevice {
        BlockDevice {
            device_name: name.to_owned(),
            hardware_id: None,
            size,
        }
    }

    fn source() -> ManagedFilesystemSource {
        let machine = MachineTag::parse("0").expect("machine tag");
        let volume = VolumeTag::parse("0/0").expect("volume tag");
        let filesystem = FilesystemTag::parse("0/0").expect("filesystem tag");
        ManagedFilesystemSource::new(
            Utf8PathBuf::from("/srv/storage"),
            machine,
            BTreeMap::from([(volume.clone(), device("xvdf1", 123))]),
            BTreeMap::from([(
                filesystem.clone(),
                Filesystem {
                    tag: filesystem,
                    backing_volume: Some(volume),
                    info: FilesystemInfo {
                        filesystem_id: String::from("xvdf1"),
                        size: 123,
                    },
                },
            )]),
        )
    }

    fn create_params(tag: &str, backing: Option<&str>) -> FilesystemParams {
        FilesystemParams {
            tag: FilesystemTag::parse(tag).expect("filesystem tag"),
            backing_volume: backing.map(|id| VolumeTag::parse(id).expect("volume tag")),
            size: 123,
            provider: String::from("managed"),
            attributes: BTreeMap::new(),
            resource_tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn create_fabricates_info_from_the_block_device() {
        let source = source();
        let results = source
            .create_filesystems(&[create_params("0/0", Some("0/0"))])
            .await
            .expect("create should not fail as a whole");
        assert_eq!(
            results,
            vec![Ok(Filesystem {
                tag: FilesystemTag::parse("0/0").expect("filesystem tag"),
                backing_volume: Some(VolumeTag::parse("0/0").expect("volume tag")),
                info: FilesystemInfo {
                    filesystem_id: String::from("xvdf1"),
                    size: 123,
                },
            })]
        );
    }

    #[tokio::test]
    async fn create_reports_missing_devices_per_item() {
        let source = source();
        let results = source
            .create_filesystems(&[
                create_params("0/0", Some("0/0")),
                create_params("0/1", Some("0/1")),
            ])
            .await
            .expect("create should not fail as a whole");
        assert!(results[0].is_ok());
        assert_eq!(
            results[1],
            Err(SourceError::NotAttached {
                volume: VolumeTag::parse("0/1").expect("volume tag"),
                machine: MachineTag::parse("0").expect("machine tag"),
            })
        );
    }

    #[tokio::test]
    async fn attach_mounts_under_the_storage_directory_read_only() {
        let source = source();
        let params = FilesystemAttachmentParams {
            filesystem: FilesystemTag::parse("0/0").expect("filesystem tag"),
            filesystem_id: Some(String::from("xvdf1")),
            backing_volume: None,
            machine: MachineTag::parse("0").expect("machine tag"),
            instance_id: None,
            provider: String::from("managed"),
            mount_point: None,
            read_only: false,
        };
        let results = source
            .attach_filesystems(std::slice::from_ref(&params))
            .await
            .expect("attach should not fail as a whole");
        let attachment = results[0].clone().expect("attachment should succeed");
        assert_eq!(
            attachment.info.mount_point,
            Utf8PathBuf::from("/srv/storage/xvdf1")
        );
        assert!(attachment.info.read_only);
    }

    #[tokio::test]
    async fn repeated_calls_are_idempotent() {
        let source = source();
        let params = [create_params("0/0", Some("0/0"))];
        let first = source
            .create_filesystems(&params)
            .await
            .expect("create should not fail as a whole");
        let second = source
            .create_filesystems(&params)
            .await
            .expect("create should not fail as a whole");
        assert_eq!(first, second);
    }
}
