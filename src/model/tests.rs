//! Unit tests for the state model.

use std::collections::BTreeMap;
use std::sync::Arc;

use rstest::rstest;
use serde_json::json;

use crate::provider::{
    EnvironConfig, FilesystemAttachmentInfo, InstanceId, PoolConfig, Registry, StorageKind,
    VolumeAttachmentInfo,
};
use crate::test_support::{
    DummyProvider, expect_event, expect_no_event, filesystem, machine, storage, unit, volume,
};

use super::*;

fn test_registry() -> Registry {
    let registry = Registry::new();
    registry.register(
        "rootfs",
        Some(Arc::new(
            DummyProvider::new()
                .machine_scoped()
                .filesystem_only()
                .non_dynamic(),
        )),
    );
    registry.register(
        "loop",
        Some(Arc::new(DummyProvider::new().machine_scoped().block_only())),
    );
    registry.register("environscoped", Some(Arc::new(DummyProvider::new())));
    registry.register(
        "environscoped-block",
        Some(Arc::new(DummyProvider::new().block_only())),
    );
    registry.register("static", Some(Arc::new(DummyProvider::new().non_dynamic())));
    registry
}

fn test_pools() -> Vec<PoolConfig> {
    vec![
        PoolConfig::new("rootfs", "rootfs"),
        PoolConfig::new("loop", "loop"),
        PoolConfig::new("loop-pool", "loop"),
        PoolConfig::new("environscoped", "environscoped"),
        PoolConfig::new("environscoped-block", "environscoped-block"),
        PoolConfig::new("static", "static"),
    ]
}

fn new_state() -> State {
    State::new(
        test_registry(),
        test_pools(),
        EnvironConfig::new("testenv", BTreeMap::new()),
    )
}

fn declaration(kind: StorageKind, pool: &str, size: u64, count: u64) -> StorageDeclaration {
    StorageDeclaration {
        kind,
        constraints: StorageConstraints::new(pool, size, count),
    }
}

/// Adds the canonical single-store service and one unit, returning the
/// unit and its storage instance.
fn setup_single_storage(state: &State, kind: StorageKind, pool: &str) -> (UnitTag, StorageTag) {
    state
        .add_service(
            "storage-filesystem",
            BTreeMap::from([(String::from("data"), declaration(kind, pool, 1024, 1))]),
        )
        .expect("service should be added");
    let unit = state
        .add_unit("storage-filesystem")
        .expect("unit should be added");
    let attachments = state
        .unit_storage_attachments(&unit)
        .expect("unit should exist");
    assert_eq!(attachments.len(), 1);
    let storage_tag = attachments[0].storage.clone();
    (unit, storage_tag)
}

/// Adds a unit with one filesystem store and assigns it to a fresh
/// machine, asserting the entities the assignment creates.
fn add_unit_with_filesystem(
    state: &State,
    pool: &str,
    with_volume: bool,
) -> (UnitTag, StorageTag, MachineTag) {
    let (unit, storage_tag) = setup_single_storage(state, StorageKind::Filesystem, pool);
    let machine_tag = state
        .assign_unit(&unit, AssignmentPolicy::CleanEmpty)
        .expect("assignment should succeed");

    let instance = state
        .storage_instance(&storage_tag)
        .expect("storage instance should exist");
    assert_eq!(instance.kind, StorageKind::Filesystem);
    assert_eq!(instance.owner, unit);

    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should be assigned");
    assert_eq!(fs.storage_instance().expect("assigned"), &storage_tag);
    assert!(
        fs.info().expect_err("unprovisioned").is_not_provisioned(),
        "expected a not-provisioned error"
    );
    assert!(fs.params().is_some());

    if with_volume {
        let vol = state
            .storage_instance_volume(&storage_tag)
            .expect("volume should be assigned");
        assert_eq!(vol.storage_instance().expect("assigned"), &storage_tag);
        assert_eq!(fs.volume().expect("backed"), &vol.tag);
        state
            .volume_attachment(&machine_tag, &vol.tag)
            .expect("volume attachment should exist");
    } else {
        let err = state
            .storage_instance_volume(&storage_tag)
            .expect_err("no volume expected");
        assert!(err.is_not_found());
        assert_eq!(fs.volume(), Err(Error::NoBackingVolume));
    }

    let attachments = state.machine_filesystem_attachments(&machine_tag);
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].filesystem, fs.tag);
    assert_eq!(attachments[0].machine, machine_tag);
    assert!(
        attachments[0]
            .info()
            .expect_err("unprovisioned")
            .is_not_provisioned()
    );
    assert!(attachments[0].params().is_some());

    (unit, storage_tag, machine_tag)
}

#[rstest]
fn add_service_rejects_unknown_pools() {
    let state = new_state();
    let err = state
        .add_service(
            "storage-filesystem",
            BTreeMap::from([(
                String::from("data"),
                declaration(StorageKind::Filesystem, "invalid-pool", 1024, 1),
            )]),
        )
        .expect_err("unknown pool should be rejected");
    assert_eq!(
        err.to_string(),
        r#"cannot add service "storage-filesystem": pool "invalid-pool" not found"#
    );
}

#[rstest]
#[case(StorageKind::Filesystem, "rootfs")]
#[case(StorageKind::Block, "loop")]
fn add_service_defaults_empty_pools_by_kind(#[case] kind: StorageKind, #[case] expected: &str) {
    let state = new_state();
    state
        .add_service(
            "storage-filesystem",
            BTreeMap::from([(String::from("data"), declaration(kind, "", 1024, 1))]),
        )
        .expect("service should be added");
    let constraints = state
        .storage_constraints("storage-filesystem")
        .expect("service should exist");
    assert_eq!(
        constraints,
        BTreeMap::from([(
            String::from("data"),
            StorageConstraints::new(expected, 1024, 1)
        )])
    );
}

#[rstest]
fn add_filesystem_without_backing_volume() {
    let state = new_state();
    let (_, storage_tag, _) = add_unit_with_filesystem(&state, "rootfs", false);
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");
    assert_eq!(fs.tag, filesystem("0/0"));
}

#[rstest]
fn add_filesystem_with_backing_volume() {
    let state = new_state();
    let (_, storage_tag, _) = add_unit_with_filesystem(&state, "loop", true);
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");
    assert_eq!(fs.tag, filesystem("0/0"));
    assert_eq!(fs.volume().expect("backed"), &volume("0/0"));
}

#[rstest]
fn set_filesystem_info_is_immutable() {
    let state = new_state();
    let (_, storage_tag, machine_tag) = add_unit_with_filesystem(&state, "rootfs", false);
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");
    state
        .set_machine_provisioned(&machine_tag, InstanceId::new("inst-id"))
        .expect("machine should exist");

    let info = FilesystemInfo {
        pool: None,
        filesystem_id: String::new(),
        size: 123,
    };
    state
        .set_filesystem_info(&fs.tag, info.clone())
        .expect("first set should succeed");

    // The first call takes the pool from the params; the second call
    // must carry the recorded pool or nothing changes.
    let err = state
        .set_filesystem_info(&fs.tag, info.clone())
        .expect_err("pool change should be rejected");
    assert_eq!(
        err.to_string(),
        r#"cannot set info for filesystem "0/0": cannot change pool from "rootfs" to """#
    );

    let with_pool = FilesystemInfo {
        pool: Some(String::from("rootfs")),
        ..info
    };
    state
        .set_filesystem_info(&fs.tag, with_pool.clone())
        .expect("matching pool should be accepted");
    let fs = state.filesystem(&fs.tag).expect("filesystem should exist");
    assert_eq!(fs.info().expect("provisioned"), &with_pool);
}

#[rstest]
fn volume_filesystem_round_trips() {
    let state = new_state();
    let (_, storage_tag, _) = add_unit_with_filesystem(&state, "loop", true);
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");
    let volume_tag = fs.volume().expect("backed").clone();
    let backed = state
        .volume_filesystem(&volume_tag)
        .expect("backing volume should map back to its filesystem");
    assert_eq!(backed.tag, fs.tag);
}

#[tokio::test]
async fn watch_filesystem_attachment_ignores_filesystem_changes() {
    let state = new_state();
    let (unit_tag, storage_tag) =
        setup_single_storage(&state, StorageKind::Filesystem, "rootfs");
    let machine_tag = state
        .assign_unit(&unit_tag, AssignmentPolicy::CleanEmpty)
        .expect("assignment should succeed");
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");

    let mut watcher = state.watch_filesystem_attachment(&machine_tag, &fs.tag);
    expect_event(watcher.next(), "waiting for the initial event").await;

    state
        .set_machine_provisioned(&machine_tag, InstanceId::new("inst-id"))
        .expect("machine should exist");
    state
        .set_filesystem_info(
            &fs.tag,
            FilesystemInfo {
                pool: None,
                filesystem_id: String::from("fs-123"),
                size: 0,
            },
        )
        .expect("filesystem info should be recorded");
    expect_no_event(watcher.next(), "attachment event after filesystem change").await;

    state
        .set_filesystem_attachment_info(
            &machine_tag,
            &fs.tag,
            FilesystemAttachmentInfo {
                mount_point: "/srv".into(),
                read_only: false,
            },
        )
        .expect("attachment info should be recorded");
    expect_event(watcher.next(), "waiting for the attachment event").await;
}

#[rstest]
fn filesystem_info_takes_pool_from_params() {
    let state = new_state();
    let (_, storage_tag, machine_tag) = add_unit_with_filesystem(&state, "rootfs", false);
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");
    state
        .set_machine_provisioned(&machine_tag, InstanceId::new("inst-id"))
        .expect("machine should exist");

    state
        .set_filesystem_info(
            &fs.tag,
            FilesystemInfo {
                pool: None,
                filesystem_id: String::from("fs-123"),
                size: 456,
            },
        )
        .expect("filesystem info should be recorded");
    let recorded = state.filesystem(&fs.tag).expect("filesystem should exist");
    assert_eq!(
        recorded.info().expect("provisioned"),
        &FilesystemInfo {
            pool: Some(String::from("rootfs")),
            filesystem_id: String::from("fs-123"),
            size: 456,
        }
    );
    let attachment = state
        .filesystem_attachment(&machine_tag, &fs.tag)
        .expect("attachment should exist");
    assert!(
        attachment
            .info()
            .expect_err("attachment still unprovisioned")
            .is_not_provisioned()
    );

    state
        .set_filesystem_attachment_info(
            &machine_tag,
            &fs.tag,
            FilesystemAttachmentInfo {
                mount_point: "/srv".into(),
                read_only: false,
            },
        )
        .expect("attachment info should be recorded");
    let attachment = state
        .filesystem_attachment(&machine_tag, &fs.tag)
        .expect("attachment should exist");
    assert_eq!(
        attachment.info().expect("provisioned").mount_point,
        camino::Utf8PathBuf::from("/srv")
    );
}

#[rstest]
fn volume_backed_filesystem_takes_the_volume_scope() {
    let state = new_state();
    let (unit_tag, storage_tag) =
        setup_single_storage(&state, StorageKind::Filesystem, "environscoped-block");
    state
        .assign_unit(&unit_tag, AssignmentPolicy::CleanEmpty)
        .expect("assignment should succeed");

    // The backing volume is environment-scoped, so the filesystem is
    // too; both carry environment-scoped tags.
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");
    assert_eq!(fs.tag, filesystem("0"));
    assert_eq!(fs.volume().expect("backed"), &volume("0"));
}

/// Service with one environment-scoped store and two machine-scoped
/// stores per unit.
fn setup_mixed_scope_service(state: &State) {
    state
        .add_service(
            "mixed",
            BTreeMap::from([
                (
                    String::from("data"),
                    declaration(StorageKind::Filesystem, "environscoped", 1024, 1),
                ),
                (
                    String::from("scratch"),
                    declaration(StorageKind::Filesystem, "rootfs", 1024, 2),
                ),
            ]),
        )
        .expect("service should be added");
}

fn add_assigned_unit(state: &State, service: &str) -> MachineTag {
    let unit_tag = state.add_unit(service).expect("unit should be added");
    state
        .assign_unit(&unit_tag, AssignmentPolicy::CleanEmpty)
        .expect("assignment should succeed")
}

#[tokio::test]
async fn watch_environ_filesystems_reports_membership_then_changes() {
    let state = new_state();
    setup_mixed_scope_service(&state);
    add_assigned_unit(&state, "mixed");

    let mut watcher = state.watch_environ_filesystems();
    assert_eq!(
        expect_event(watcher.next(), "waiting for the initial event").await,
        vec![String::from("0")]
    );
    expect_no_event(watcher.next(), "filesystem event").await;

    add_assigned_unit(&state, "mixed");
    assert_eq!(
        expect_event(watcher.next(), "waiting for the change event").await,
        vec![String::from("3")]
    );
    expect_no_event(watcher.next(), "filesystem event").await;
}

#[tokio::test]
async fn watch_environ_filesystem_attachments_reports_membership_then_changes() {
    let state = new_state();
    setup_mixed_scope_service(&state);
    add_assigned_unit(&state, "mixed");

    let mut watcher = state.watch_environ_filesystem_attachments();
    assert_eq!(
        expect_event(watcher.next(), "waiting for the initial event").await,
        vec![FilesystemAttachmentId::parse("0:0").expect("id")]
    );
    expect_no_event(watcher.next(), "attachment event").await;

    add_assigned_unit(&state, "mixed");
    assert_eq!(
        expect_event(watcher.next(), "waiting for the change event").await,
        vec![FilesystemAttachmentId::parse("1:3").expect("id")]
    );
    expect_no_event(watcher.next(), "attachment event").await;
}

#[tokio::test]
async fn watch_machine_filesystems_is_scoped_to_the_machine() {
    let state = new_state();
    setup_mixed_scope_service(&state);
    add_assigned_unit(&state, "mixed");

    let mut watcher = state.watch_machine_filesystems(&machine("0"));
    assert_eq!(
        expect_event(watcher.next(), "waiting for the initial event").await,
        vec![String::from("0/1"), String::from("0/2")]
    );

    // A unit on another machine is of no interest here.
    add_assigned_unit(&state, "mixed");
    expect_no_event(watcher.next(), "filesystem event").await;
}

#[tokio::test]
async fn watch_machine_filesystem_attachments_is_scoped_to_the_machine() {
    let state = new_state();
    setup_mixed_scope_service(&state);
    add_assigned_unit(&state, "mixed");

    let mut watcher = state.watch_machine_filesystem_attachments(&machine("0"));
    assert_eq!(
        expect_event(watcher.next(), "waiting for the initial event").await,
        vec![
            FilesystemAttachmentId::parse("0:0").expect("id"),
            FilesystemAttachmentId::parse("0:0/1").expect("id"),
            FilesystemAttachmentId::parse("0:0/2").expect("id"),
        ]
    );

    add_assigned_unit(&state, "mixed");
    expect_no_event(watcher.next(), "attachment event").await;
}

#[tokio::test]
async fn watch_environ_volumes_reports_membership() {
    let state = new_state();
    let (unit_tag, _) = setup_single_storage(&state, StorageKind::Block, "environscoped");
    state
        .assign_unit(&unit_tag, AssignmentPolicy::CleanEmpty)
        .expect("assignment should succeed");

    let mut watcher = state.watch_environ_volumes();
    assert_eq!(
        expect_event(watcher.next(), "waiting for the initial event").await,
        vec![String::from("0")]
    );
}

#[rstest]
#[case("0:0", "0", "0")]
#[case("0:0/1", "0", "0/1")]
#[case("0/lxc/0:1", "0/lxc/0", "1")]
fn parse_filesystem_attachment_ids(
    #[case] id: &str,
    #[case] machine_id: &str,
    #[case] filesystem_id: &str,
) {
    let parsed = State::parse_filesystem_attachment_id(id).expect("id should parse");
    assert_eq!(parsed.machine, machine(machine_id));
    assert_eq!(parsed.attachment, filesystem(filesystem_id));
}

#[rstest]
#[case("")]
#[case("0")]
#[case("0:foo")]
#[case("bar:0")]
fn parse_filesystem_attachment_id_errors(#[case] id: &str) {
    let err = State::parse_filesystem_attachment_id(id).expect_err("id should be rejected");
    assert_eq!(
        err.to_string(),
        format!("invalid filesystem attachment ID {id:?}")
    );
}

#[rstest]
fn assign_to_machine_with_dynamic_pool() {
    let state = new_state();
    let (unit_tag, _) = setup_single_storage(&state, StorageKind::Filesystem, "loop-pool");
    let machine_tag = state.add_machine();
    state
        .assign_unit_to_machine(&unit_tag, &machine_tag)
        .expect("assignment should succeed");
    let attachments = state.machine_filesystem_attachments(&machine_tag);
    assert_eq!(attachments.len(), 1);
}

#[rstest]
fn assign_to_machine_errors() {
    let state = new_state();
    let (unit_tag, _) = setup_single_storage(&state, StorageKind::Filesystem, "static");
    let machine_tag = state.add_machine();
    let err = state
        .assign_unit_to_machine(&unit_tag, &machine_tag)
        .expect_err("static provider should be rejected");
    assert_eq!(
        err.to_string(),
        r#"cannot assign unit "storage-filesystem/0" to machine 0: static storage provider does not support dynamic storage"#
    );

    let container = state
        .add_machine_inside_machine(&machine_tag, "lxc")
        .expect("container should be added");
    let err = state
        .assign_unit_to_machine(&unit_tag, &container)
        .expect_err("container storage should be rejected");
    assert_eq!(
        err.to_string(),
        r#"cannot assign unit "storage-filesystem/0" to machine 0/lxc/0: adding storage to lxc container not supported"#
    );
}

#[rstest]
fn remove_storage_instance_unassigns_but_keeps_the_resources() {
    let state = new_state();
    let (unit_tag, storage_tag, _) = add_unit_with_filesystem(&state, "loop", true);
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");
    let vol = state
        .storage_instance_volume(&storage_tag)
        .expect("volume should exist");

    state
        .destroy_storage_instance(&storage_tag)
        .expect("instance should exist");
    state
        .destroy_storage_attachment(&storage_tag, &unit_tag)
        .expect("attachment should exist");

    // Dying but not yet removed: the resources stay assigned.
    state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should still be assigned");
    state
        .storage_instance_volume(&storage_tag)
        .expect("volume should still be assigned");

    state
        .remove_storage_attachment(&storage_tag, &unit_tag)
        .expect("attachment should be removed");

    let err = state
        .storage_instance_filesystem(&storage_tag)
        .expect_err("filesystem should be unassigned");
    assert_eq!(
        err.to_string(),
        r#"filesystem for storage instance "data/0" not found"#
    );
    let err = state
        .storage_instance_volume(&storage_tag)
        .expect_err("volume should be unassigned");
    assert_eq!(
        err.to_string(),
        r#"volume for storage instance "data/0" not found"#
    );

    // The resources themselves survive the unassignment.
    state.filesystem(&fs.tag).expect("filesystem should exist");
    state.volume(&vol.tag).expect("volume should exist");
}

#[rstest]
fn set_filesystem_attachment_info_requires_a_provisioned_filesystem() {
    let state = new_state();
    let (_, storage_tag, machine_tag) = add_unit_with_filesystem(&state, "rootfs", false);
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");
    let err = state
        .set_filesystem_attachment_info(
            &machine_tag,
            &fs.tag,
            FilesystemAttachmentInfo::default(),
        )
        .expect_err("unprovisioned filesystem should be rejected");
    assert_eq!(
        err.to_string(),
        r#"cannot set info for filesystem attachment 0/0:0: filesystem "0/0" not provisioned"#
    );
}

#[rstest]
fn set_filesystem_attachment_info_requires_a_provisioned_machine() {
    let state = new_state();
    let (_, storage_tag, machine_tag) = add_unit_with_filesystem(&state, "rootfs", false);
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");
    state
        .set_filesystem_info(
            &fs.tag,
            FilesystemInfo {
                pool: None,
                filesystem_id: String::new(),
                size: 123,
            },
        )
        .expect("filesystem info should be recorded");
    let err = state
        .set_filesystem_attachment_info(
            &machine_tag,
            &fs.tag,
            FilesystemAttachmentInfo::default(),
        )
        .expect_err("unprovisioned machine should be rejected");
    assert_eq!(
        err.to_string(),
        "cannot set info for filesystem attachment 0/0:0: machine 0 not provisioned"
    );
}

#[rstest]
fn set_filesystem_info_requires_the_backing_volume_attachment() {
    let state = new_state();
    let (_, storage_tag, _) = add_unit_with_filesystem(&state, "loop", true);
    let fs = state
        .storage_instance_filesystem(&storage_tag)
        .expect("filesystem should exist");
    let err = state
        .set_filesystem_info(
            &fs.tag,
            FilesystemInfo {
                pool: None,
                filesystem_id: String::new(),
                size: 123,
            },
        )
        .expect_err("missing backing attachment should be rejected");
    assert_eq!(
        err.to_string(),
        r#"cannot set info for filesystem "0/0": volume attachment "0/0" on "0" not provisioned"#
    );
}

#[rstest]
fn set_volume_info_rejects_changing_the_volume_id() {
    let state = new_state();
    let (unit_tag, storage_tag) = setup_single_storage(&state, StorageKind::Block, "loop");
    state
        .assign_unit(&unit_tag, AssignmentPolicy::CleanEmpty)
        .expect("assignment should succeed");
    let vol = state
        .storage_instance_volume(&storage_tag)
        .expect("volume should exist");

    state
        .set_volume_info(
            &vol.tag,
            VolumeInfo {
                pool: None,
                volume_id: String::from("vol-1"),
                hardware_id: None,
                size: 1024,
                persistent: false,
            },
        )
        .expect("volume info should be recorded");
    let err = state
        .set_volume_info(
            &vol.tag,
            VolumeInfo {
                pool: Some(String::from("loop")),
                volume_id: String::from("vol-2"),
                hardware_id: None,
                size: 1024,
                persistent: false,
            },
        )
        .expect_err("volume id change should be rejected");
    assert_eq!(
        err.to_string(),
        r#"cannot set info for volume "0/0": cannot change volume id from "vol-1" to "vol-2""#
    );
}

#[tokio::test]
async fn set_volume_attachment_info_requires_both_endpoints() {
    let state = new_state();
    let (unit_tag, storage_tag) = setup_single_storage(&state, StorageKind::Block, "loop");
    let machine_tag = state
        .assign_unit(&unit_tag, AssignmentPolicy::CleanEmpty)
        .expect("assignment should succeed");
    let vol = state
        .storage_instance_volume(&storage_tag)
        .expect("volume should exist");

    let err = state
        .set_volume_attachment_info(
            &machine_tag,
            &vol.tag,
            VolumeAttachmentInfo::default(),
        )
        .expect_err("unprovisioned volume should be rejected");
    assert_eq!(
        err.to_string(),
        r#"cannot set info for volume attachment 0/0:0: volume "0/0" not provisioned"#
    );

    state
        .set_volume_info(
            &vol.tag,
            VolumeInfo {
                pool: None,
                volume_id: String::from("vol-1"),
                hardware_id: None,
                size: 1024,
                persistent: false,
            },
        )
        .expect("volume info should be recorded");
    state
        .set_machine_provisioned(&machine_tag, InstanceId::new("inst-id"))
        .expect("machine should exist");

    let mut watcher = state.watch_volume_attachment(&machine_tag, &vol.tag);
    expect_event(watcher.next(), "waiting for the initial event").await;
    state
        .set_volume_attachment_info(
            &machine_tag,
            &vol.tag,
            VolumeAttachmentInfo {
                device_name: String::from("/dev/sda1"),
                read_only: true,
            },
        )
        .expect("attachment info should be recorded");
    expect_event(watcher.next(), "waiting for the attachment event").await;

    let attachment = state
        .volume_attachment(&machine_tag, &vol.tag)
        .expect("attachment should exist");
    assert_eq!(
        attachment.info().expect("provisioned").device_name,
        "/dev/sda1"
    );
}

#[rstest]
fn update_environ_config_merges_overrides() {
    let state = new_state();
    let updated = state.update_environ_config(BTreeMap::from([(
        String::from("foo"),
        json!("bar"),
    )]));
    assert_eq!(updated.attrs.get("foo"), Some(&json!("bar")));
    assert_eq!(state.environ_config().attrs.get("foo"), Some(&json!("bar")));
}

#[rstest]
fn storage_and_unit_helpers_round_trip() {
    assert_eq!(storage("data/0").to_string(), "data/0");
    assert_eq!(unit("storage-filesystem/0").to_string(), "storage-filesystem/0");
}
