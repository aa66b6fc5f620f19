//! Structured identifiers for machines, storage entities and attachments.
//!
//! Every durable entity is referred to by a tag: a validated, structured
//! string that round-trips exactly through [`Display`] and [`Tag::parse`].
//! Machine tags may be nested (`0/lxc/1`); volume and filesystem tags are
//! either environment-scoped (`3`) or machine-scoped (`0/3`). An attachment
//! id joins a machine tag and a resource tag with a colon (`0/lxc/1:3`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when parsing tags and attachment ids.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TagError {
    /// Raised when a machine tag is malformed.
    #[error("invalid machine tag {0:?}")]
    InvalidMachine(String),
    /// Raised when a volume tag is malformed.
    #[error("invalid volume tag {0:?}")]
    InvalidVolume(String),
    /// Raised when a filesystem tag is malformed.
    #[error("invalid filesystem tag {0:?}")]
    InvalidFilesystem(String),
    /// Raised when a storage instance tag is malformed.
    #[error("invalid storage tag {0:?}")]
    InvalidStorage(String),
    /// Raised when a unit tag is malformed.
    #[error("invalid unit tag {0:?}")]
    InvalidUnit(String),
    /// Raised when an environment tag is empty.
    #[error("invalid environ tag {0:?}")]
    InvalidEnviron(String),
    /// Raised when an attachment id does not split into two valid tags.
    #[error("invalid {kind} attachment ID {id:?}")]
    InvalidAttachmentId {
        /// Resource kind expected on the right-hand side of the colon.
        kind: &'static str,
        /// The rejected input.
        id: String,
    },
}

/// Common behaviour of all tag types.
pub trait Tag: fmt::Display + Sized {
    /// Human-readable kind used in error messages (`"volume"`).
    const KIND: &'static str;

    /// Parses a tag from its canonical string form.
    ///
    /// # Errors
    ///
    /// Returns a [`TagError`] when the input does not match the tag
    /// grammar.
    fn parse(id: &str) -> Result<Self, TagError>;

    /// Returns the canonical string form.
    fn id(&self) -> &str;
}

fn is_number(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

fn is_container_type(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_lowercase())
}

/// A machine id is a number, optionally nested through container types:
/// `0`, `0/lxc/1`, `0/lxc/1/kvm/0`.
fn is_machine_id(id: &str) -> bool {
    let parts: Vec<&str> = id.split('/').collect();
    if parts.len() % 2 == 0 {
        return false;
    }
    parts
        .iter()
        .enumerate()
        .all(|(i, part)| if i % 2 == 0 { is_number(part) } else { is_container_type(part) })
}

/// Splits a storage resource id (`3` or `0/lxc/1/3`) into its optional
/// machine prefix and sequence number.
fn split_resource_id(id: &str) -> Option<(Option<&str>, &str)> {
    match id.rsplit_once('/') {
        None if is_number(id) => Some((None, id)),
        Some((machine, number)) if is_machine_id(machine) && is_number(number) => {
            Some((Some(machine), number))
        }
        _ => None,
    }
}

macro_rules! tag_common {
    ($name:ident, $kind:literal, $err:ident) => {
        impl Tag for $name {
            const KIND: &'static str = $kind;

            fn parse(id: &str) -> Result<Self, TagError> {
                Self::validate(id)
                    .then(|| Self(id.to_owned()))
                    .ok_or_else(|| TagError::$err(id.to_owned()))
            }

            fn id(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = TagError;

            fn from_str(s: &str) -> Result<Self, TagError> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = TagError;

            fn try_from(value: String) -> Result<Self, TagError> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

/// Identifies a machine, possibly nested inside containers.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineTag(String);

tag_common!(MachineTag, "machine", InvalidMachine);

impl MachineTag {
    fn validate(id: &str) -> bool {
        is_machine_id(id)
    }

    /// Returns the container type for container machines (`lxc` for
    /// `0/lxc/1`), or `None` for host machines.
    #[must_use]
    pub fn container_type(&self) -> Option<&str> {
        let parts: Vec<&str> = self.0.split('/').collect();
        (parts.len() > 1).then(|| parts[parts.len() - 2])
    }
}

/// Identifies a block-device volume.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeTag(String);

tag_common!(VolumeTag, "volume", InvalidVolume);

impl VolumeTag {
    fn validate(id: &str) -> bool {
        split_resource_id(id).is_some()
    }

    /// Returns the owning machine for machine-scoped volumes.
    #[must_use]
    pub fn machine(&self) -> Option<MachineTag> {
        split_resource_id(&self.0)
            .and_then(|(machine, _)| machine)
            .map(|id| MachineTag(id.to_owned()))
    }
}

/// Identifies a mountable filesystem.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilesystemTag(String);

tag_common!(FilesystemTag, "filesystem", InvalidFilesystem);

impl FilesystemTag {
    fn validate(id: &str) -> bool {
        split_resource_id(id).is_some()
    }

    /// Returns the owning machine for machine-scoped filesystems.
    #[must_use]
    pub fn machine(&self) -> Option<MachineTag> {
        split_resource_id(&self.0)
            .and_then(|(machine, _)| machine)
            .map(|id| MachineTag(id.to_owned()))
    }
}

/// Identifies a storage instance (`data/0`).
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageTag(String);

tag_common!(StorageTag, "storage", InvalidStorage);

impl StorageTag {
    fn validate(id: &str) -> bool {
        match id.rsplit_once('/') {
            Some((name, number)) => is_storage_name(name) && is_number(number),
            None => false,
        }
    }
}

/// Identifies a unit of a service (`svc/0`).
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitTag(String);

tag_common!(UnitTag, "unit", InvalidUnit);

impl UnitTag {
    fn validate(id: &str) -> bool {
        match id.rsplit_once('/') {
            Some((name, number)) => is_storage_name(name) && is_number(number),
            None => false,
        }
    }
}

/// Identifies an environment; opaque beyond being non-empty.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvironTag(String);

tag_common!(EnvironTag, "environ", InvalidEnviron);

impl EnvironTag {
    fn validate(id: &str) -> bool {
        !id.is_empty() && !id.contains(':')
    }
}

/// Names used by services, units, and storage declarations: lowercase
/// alphanumerics and hyphens, starting with a letter.
fn is_storage_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_lowercase() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Binds a machine to a storage resource: the wire shape is
/// `"<machine>:<resource>"` with the first colon as separator.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AttachmentId<T> {
    /// Machine half of the attachment.
    pub machine: MachineTag,
    /// Resource half of the attachment.
    pub attachment: T,
}

/// Attachment id for volumes.
pub type VolumeAttachmentId = AttachmentId<VolumeTag>;

/// Attachment id for filesystems.
pub type FilesystemAttachmentId = AttachmentId<FilesystemTag>;

impl<T: Tag> AttachmentId<T> {
    /// Creates an attachment id from its halves.
    #[must_use]
    pub fn new(machine: MachineTag, attachment: T) -> Self {
        Self {
            machine,
            attachment,
        }
    }

    /// Parses an attachment id from its `"<machine>:<resource>"` form.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidAttachmentId`] when the input does not
    /// contain a separator or either half fails to parse.
    pub fn parse(id: &str) -> Result<Self, TagError> {
        let invalid = || TagError::InvalidAttachmentId {
            kind: T::KIND,
            id: id.to_owned(),
        };
        let (machine, attachment) = id.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            machine: MachineTag::parse(machine).map_err(|_| invalid())?,
            attachment: T::parse(attachment).map_err(|_| invalid())?,
        })
    }
}

impl<T: Tag> fmt::Display for AttachmentId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine, self.attachment)
    }
}

impl<T: Tag> FromStr for AttachmentId<T> {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, TagError> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0")]
    #[case("12")]
    #[case("0/lxc/1")]
    #[case("0/lxc/1/kvm/0")]
    fn machine_tags_round_trip(#[case] id: &str) {
        let tag = MachineTag::parse(id).expect("machine tag should parse");
        assert_eq!(tag.to_string(), id);
    }

    #[rstest]
    #[case("")]
    #[case("x")]
    #[case("0/lxc")]
    #[case("0//1")]
    #[case("lxc/0")]
    fn invalid_machine_tags_are_rejected(#[case] id: &str) {
        assert_eq!(
            MachineTag::parse(id),
            Err(TagError::InvalidMachine(id.to_owned()))
        );
    }

    #[rstest]
    #[case("3", None)]
    #[case("0/3", Some("0"))]
    #[case("0/lxc/1/2", Some("0/lxc/1"))]
    fn volume_tags_expose_their_machine(#[case] id: &str, #[case] machine: Option<&str>) {
        let tag = VolumeTag::parse(id).expect("volume tag should parse");
        assert_eq!(tag.to_string(), id);
        assert_eq!(
            tag.machine(),
            machine.map(|m| MachineTag::parse(m).expect("machine"))
        );
    }

    #[rstest]
    #[case("")]
    #[case("foo")]
    #[case("0/")]
    #[case("/0")]
    fn invalid_filesystem_tags_are_rejected(#[case] id: &str) {
        assert!(FilesystemTag::parse(id).is_err());
    }

    #[rstest]
    #[case("0:0", "0", "0")]
    #[case("0:0/1", "0", "0/1")]
    #[case("0/lxc/0:1", "0/lxc/0", "1")]
    fn filesystem_attachment_ids_parse(
        #[case] id: &str,
        #[case] machine: &str,
        #[case] filesystem: &str,
    ) {
        let parsed = FilesystemAttachmentId::parse(id).expect("attachment id should parse");
        assert_eq!(parsed.machine.id(), machine);
        assert_eq!(parsed.attachment.id(), filesystem);
        assert_eq!(parsed.to_string(), id);
    }

    #[rstest]
    #[case("")]
    #[case("0")]
    #[case("0:foo")]
    #[case("bar:0")]
    fn invalid_filesystem_attachment_ids_are_rejected(#[case] id: &str) {
        let err = FilesystemAttachmentId::parse(id).expect_err("expected parse failure");
        assert_eq!(
            err.to_string(),
            format!("invalid filesystem attachment ID {id:?}")
        );
    }

    #[rstest]
    fn volume_attachment_ids_use_the_volume_kind_in_errors() {
        let err = VolumeAttachmentId::parse("0").expect_err("expected parse failure");
        assert_eq!(err.to_string(), r#"invalid volume attachment ID "0""#);
    }

    #[rstest]
    #[case("data/0")]
    #[case("cache-a/12")]
    fn storage_tags_round_trip(#[case] id: &str) {
        let tag = StorageTag::parse(id).expect("storage tag should parse");
        assert_eq!(tag.to_string(), id);
    }

    #[rstest]
    fn storage_tags_require_a_name_and_sequence() {
        assert!(StorageTag::parse("data").is_err());
        assert!(StorageTag::parse("0/0").is_err());
        assert!(StorageTag::parse("Data/0").is_err());
    }
}
