//! Unit tests for the storage provisioner worker.
//!
//! These drive the worker through scripted accessors: the test fires
//! change streams by hand and observes what the worker publishes back
//! through the setters.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use crate::accessor::state::{
    StateEnviron, StateFilesystems, StateLifecycle, StateMachines, StateVolumes,
};
use crate::accessor::OperationError;
use crate::model::{AssignmentPolicy, State, StorageConstraints, StorageDeclaration};
use crate::provider::{
    BlockDevice, EnvironConfig, Filesystem, FilesystemAttachment, FilesystemAttachmentInfo,
    FilesystemInfo, FilesystemParams, InstanceId, PoolConfig, Registry, SourceError,
    StorageKind, StorageProvider, Volume, VolumeAttachment, VolumeAttachmentInfo,
    VolumeAttachmentParams, VolumeInfo, VolumeParams,
};
use crate::tags::{EnvironTag, Tag};
use crate::test_support::{
    DummyProvider, MockEnvironAccessor, MockFilesystemAccessor, MockLifecycleManager,
    MockMachineAccessor, MockVolumeAccessor, expect_event, expect_no_event, filesystem,
    filesystem_attachment, machine, volume, volume_attachment,
};

use super::{ProvisionerError, Scope, StorageProvisioner};

struct Fixture {
    registry: Registry,
    provider: Arc<DummyProvider>,
    volumes: MockVolumeAccessor,
    filesystems: MockFilesystemAccessor,
    machines: MockMachineAccessor,
    environ: MockEnvironAccessor,
}

impl Fixture {
    fn new() -> Self {
        Self::with_provider(DummyProvider::new())
    }

    fn with_provider(provider: DummyProvider) -> Self {
        let registry = Registry::new();
        let provider = Arc::new(provider);
        let registered: Arc<dyn StorageProvider> = Arc::clone(&provider) as _;
        registry.register("dummy", Some(registered));
        Self {
            registry,
            provider,
            volumes: MockVolumeAccessor::new(),
            filesystems: MockFilesystemAccessor::new(),
            machines: MockMachineAccessor::new(),
            environ: MockEnvironAccessor::new(),
        }
    }

    fn spawn(&self, scope: Scope) -> StorageProvisioner {
        StorageProvisioner::new(
            scope,
            "storage-dir",
            self.registry.clone(),
            Box::new(self.volumes.clone()),
            Box::new(self.filesystems.clone()),
            Box::new(MockLifecycleManager),
            Box::new(self.environ.clone()),
            Box::new(self.machines.clone()),
        )
    }
}

fn environ_scope() -> Scope {
    Scope::Environ(EnvironTag::parse("environment-uuid").expect("environ tag"))
}

fn machine_scope(id: &str) -> Scope {
    Scope::Machine(machine(id))
}

fn record_set_volume_info(mock: &MockVolumeAccessor) -> mpsc::UnboundedReceiver<Vec<Volume>> {
    let (tx, rx) = mpsc::unbounded_channel();
    mock.on_set_volume_info(Box::new(move |items| {
        tx.send(items.to_vec()).expect("test receiver alive");
        Ok(items.iter().map(|_| Ok(())).collect())
    }));
    rx
}

fn record_set_volume_attachment_info(
    mock: &MockVolumeAccessor,
) -> mpsc::UnboundedReceiver<Vec<VolumeAttachment>> {
    let (tx, rx) = mpsc::unbounded_channel();
    mock.on_set_volume_attachment_info(Box::new(move |items| {
        tx.send(items.to_vec()).expect("test receiver alive");
        Ok(items.iter().map(|_| Ok(())).collect())
    }));
    rx
}

fn record_set_filesystem_info(
    mock: &MockFilesystemAccessor,
) -> mpsc::UnboundedReceiver<Vec<Filesystem>> {
    let (tx, rx) = mpsc::unbounded_channel();
    mock.on_set_filesystem_info(Box::new(move |items| {
        tx.send(items.to_vec()).expect("test receiver alive");
        Ok(items.iter().map(|_| Ok(())).collect())
    }));
    rx
}

fn record_set_filesystem_attachment_info(
    mock: &MockFilesystemAccessor,
) -> mpsc::UnboundedReceiver<Vec<FilesystemAttachment>> {
    let (tx, rx) = mpsc::unbounded_channel();
    mock.on_set_filesystem_attachment_info(Box::new(move |items| {
        tx.send(items.to_vec()).expect("test receiver alive");
        Ok(items.iter().map(|_| Ok(())).collect())
    }));
    rx
}

#[tokio::test(start_paused = true)]
async fn start_stop() {
    let fixture = Fixture::new();
    let mut worker = fixture.spawn(environ_scope());
    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn volume_added() {
    let expected_volumes = vec![
        Volume {
            tag: volume("1"),
            info: VolumeInfo {
                volume_id: String::from("id-1"),
                hardware_id: Some(String::from("serial-1")),
                size: 1024,
                persistent: true,
            },
        },
        Volume {
            tag: volume("2"),
            info: VolumeInfo {
                volume_id: String::from("id-2"),
                hardware_id: Some(String::from("serial-2")),
                size: 1024,
                persistent: false,
            },
        },
    ];
    let expected_attachments = vec![
        VolumeAttachment {
            volume: volume("1"),
            machine: machine("1"),
            info: VolumeAttachmentInfo {
                device_name: String::from("/dev/sda1"),
                read_only: true,
            },
        },
        VolumeAttachment {
            volume: volume("2"),
            machine: machine("1"),
            info: VolumeAttachmentInfo {
                device_name: String::from("/dev/sda2"),
                read_only: false,
            },
        },
    ];

    let fixture = Fixture::new();
    fixture
        .volumes
        .add_provisioned_machine(&machine("1"), "already-provisioned-1");
    let mut volume_info_set = record_set_volume_info(&fixture.volumes);
    let mut attachment_info_set = record_set_volume_attachment_info(&fixture.volumes);

    let mut worker = fixture.spawn(environ_scope());

    fixture.volumes.fire_attachments(vec![
        volume_attachment("1", "1"),
        volume_attachment("1", "2"),
    ]);
    expect_no_event(attachment_info_set.recv(), "volume attachment info set").await;

    // The worker should create volumes according to ids "1" and "2",
    // but not until the environment config is available.
    fixture.volumes.fire_volumes(&["1", "2"]);
    expect_no_event(volume_info_set.recv(), "volume info set").await;
    expect_no_event(attachment_info_set.recv(), "volume attachment info set").await;

    fixture.environ.fire();
    assert_eq!(
        expect_event(volume_info_set.recv(), "waiting for volume info to be set").await,
        expected_volumes
    );
    assert_eq!(
        expect_event(
            attachment_info_set.recv(),
            "waiting for volume attachments to be set"
        )
        .await,
        expected_attachments
    );

    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn filesystem_added() {
    let expected = vec![
        Filesystem {
            tag: filesystem("1"),
            backing_volume: None,
            info: FilesystemInfo {
                filesystem_id: String::from("id-1"),
                size: 1024,
            },
        },
        Filesystem {
            tag: filesystem("2"),
            backing_volume: None,
            info: FilesystemInfo {
                filesystem_id: String::from("id-2"),
                size: 1024,
            },
        },
    ];

    let fixture = Fixture::new();
    let mut filesystem_info_set = record_set_filesystem_info(&fixture.filesystems);
    let mut worker = fixture.spawn(environ_scope());

    fixture.filesystems.fire_filesystems(&["1", "2"]);
    expect_no_event(filesystem_info_set.recv(), "filesystem info set").await;

    fixture.environ.fire();
    assert_eq!(
        expect_event(
            filesystem_info_set.recv(),
            "waiting for filesystem info to be set"
        )
        .await,
        expected
    );

    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn volume_needs_instance() {
    let fixture = Fixture::new();
    let mut volume_info_set = record_set_volume_info(&fixture.volumes);
    let mut worker = fixture.spawn(environ_scope());

    fixture.volumes.fire_volumes(&["1"]);
    fixture.environ.fire();
    expect_no_event(volume_info_set.recv(), "volume info set").await;

    fixture.machines.set_instance_id(&machine("1"), "inst-id");
    fixture.machines.fire();
    expect_event(volume_info_set.recv(), "waiting for volume info to be set").await;
    expect_no_event(volume_info_set.recv(), "volume info set").await;

    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn volume_non_dynamic() {
    let fixture = Fixture::with_provider(DummyProvider::new().non_dynamic());
    fixture
        .volumes
        .add_provisioned_machine(&machine("1"), "already-provisioned-1");
    let mut volume_info_set = record_set_volume_info(&fixture.volumes);
    let mut worker = fixture.spawn(environ_scope());

    // Volumes from non-dynamic providers are never created by the
    // environment worker.
    fixture.environ.fire();
    fixture.volumes.fire_volumes(&["1"]);
    expect_no_event(volume_info_set.recv(), "volume info set").await;

    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn volume_attachment_added_and_reattached_once_per_session() {
    // We should see two attachments:
    //   - volume 1 to machine 1, because volume and machine are
    //     provisioned but the attachment is not;
    //   - volume 1 to machine 0, provisioned in a previous session, so
    //     one reattachment is requested.
    let expected = vec![
        VolumeAttachment {
            volume: volume("1"),
            machine: machine("0"),
            info: VolumeAttachmentInfo {
                device_name: String::from("/dev/sda1"),
                read_only: true,
            },
        },
        VolumeAttachment {
            volume: volume("1"),
            machine: machine("1"),
            info: VolumeAttachmentInfo {
                device_name: String::from("/dev/sda1"),
                read_only: true,
            },
        },
    ];

    let fixture = Fixture::new();
    fixture.volumes.add_provisioned_volume(Volume {
        tag: volume("1"),
        info: VolumeInfo {
            volume_id: String::from("vol-123"),
            hardware_id: None,
            size: 0,
            persistent: false,
        },
    });
    fixture
        .volumes
        .add_provisioned_machine(&machine("0"), "already-provisioned-0");
    fixture
        .volumes
        .add_provisioned_machine(&machine("1"), "already-provisioned-1");
    let already_attached = volume_attachment("0", "1");
    fixture.volumes.add_provisioned_attachment(VolumeAttachment {
        volume: volume("1"),
        machine: machine("0"),
        info: VolumeAttachmentInfo::default(),
    });

    let mut attachment_info_set = record_set_volume_attachment_info(&fixture.volumes);
    let mut worker = fixture.spawn(environ_scope());

    fixture.volumes.fire_attachments(vec![
        volume_attachment("1", "1"),
        volume_attachment("1", "2"),
        volume_attachment("2", "1"),
        already_attached.clone(),
    ]);
    expect_no_event(attachment_info_set.recv(), "volume attachment info set").await;

    fixture.volumes.fire_volumes(&["1"]);
    fixture.environ.fire();
    assert_eq!(
        expect_event(
            attachment_info_set.recv(),
            "waiting for volume attachments to be set"
        )
        .await,
        expected
    );

    // Reattachment happens at most once per session.
    fixture.volumes.fire_attachments(vec![already_attached]);
    expect_no_event(attachment_info_set.recv(), "volume attachment info set").await;

    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn filesystem_attachment_added_and_reattached_once_per_session() {
    let expected = vec![
        FilesystemAttachment {
            filesystem: filesystem("1"),
            machine: machine("0"),
            info: FilesystemAttachmentInfo {
                mount_point: "/srv/fs-123".into(),
                read_only: false,
            },
        },
        FilesystemAttachment {
            filesystem: filesystem("1"),
            machine: machine("1"),
            info: FilesystemAttachmentInfo {
                mount_point: "/srv/fs-123".into(),
                read_only: false,
            },
        },
    ];

    let fixture = Fixture::new();
    fixture.filesystems.add_provisioned_filesystem(Filesystem {
        tag: filesystem("1"),
        backing_volume: None,
        info: FilesystemInfo {
            filesystem_id: String::from("fs-123"),
            size: 0,
        },
    });
    fixture
        .filesystems
        .add_provisioned_machine(&machine("0"), "already-provisioned-0");
    fixture
        .filesystems
        .add_provisioned_machine(&machine("1"), "already-provisioned-1");
    let already_attached = filesystem_attachment("0", "1");

    let mut attachment_info_set = record_set_filesystem_attachment_info(&fixture.filesystems);
    let mut worker = fixture.spawn(environ_scope());

    fixture.filesystems.fire_attachments(vec![
        filesystem_attachment("1", "1"),
        filesystem_attachment("1", "2"),
        filesystem_attachment("2", "1"),
        already_attached.clone(),
    ]);
    expect_no_event(attachment_info_set.recv(), "filesystem attachment info set").await;

    fixture.filesystems.fire_filesystems(&["1"]);
    fixture.environ.fire();
    assert_eq!(
        expect_event(
            attachment_info_set.recv(),
            "waiting for filesystem attachments to be set"
        )
        .await,
        expected
    );

    fixture.filesystems.fire_attachments(vec![already_attached]);
    expect_no_event(attachment_info_set.recv(), "filesystem attachment info set").await;

    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn create_volume_backed_filesystems() {
    let fixture = Fixture::new();
    fixture.volumes.add_block_device(
        volume_attachment("0", "0/0"),
        BlockDevice {
            device_name: String::from("xvdf1"),
            hardware_id: None,
            size: 123,
        },
    );

    let mut filesystem_info_set = record_set_filesystem_info(&fixture.filesystems);
    let mut worker = fixture.spawn(machine_scope("0"));

    fixture.filesystems.fire_filesystems(&["0/0", "0/1"]);
    expect_no_event(filesystem_info_set.recv(), "filesystem info set").await;
    fixture.environ.fire();

    // Only the block device for volume 0/0 is attached at the moment,
    // so only the corresponding filesystem is created.
    assert_eq!(
        expect_event(
            filesystem_info_set.recv(),
            "waiting for filesystem info to be set"
        )
        .await,
        vec![Filesystem {
            tag: filesystem("0/0"),
            backing_volume: Some(volume("0/0")),
            info: FilesystemInfo {
                filesystem_id: String::from("xvdf1"),
                size: 123,
            },
        }]
    );

    // Once the second block device appears the provisioner wakes up and
    // creates the remaining filesystem.
    fixture.volumes.add_block_device(
        volume_attachment("0", "0/1"),
        BlockDevice {
            device_name: String::from("xvdf2"),
            hardware_id: None,
            size: 246,
        },
    );
    fixture.volumes.fire_block_devices();
    assert_eq!(
        expect_event(
            filesystem_info_set.recv(),
            "waiting for filesystem info to be set"
        )
        .await,
        vec![Filesystem {
            tag: filesystem("0/1"),
            backing_volume: Some(volume("0/1")),
            info: FilesystemInfo {
                filesystem_id: String::from("xvdf2"),
                size: 246,
            },
        }]
    );

    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn attach_volume_backed_filesystems() {
    let fixture = Fixture::new();
    fixture.filesystems.add_provisioned_filesystem(Filesystem {
        tag: filesystem("0/0"),
        backing_volume: Some(volume("0/0")),
        info: FilesystemInfo {
            filesystem_id: String::from("whatever"),
            size: 123,
        },
    });
    fixture
        .filesystems
        .add_provisioned_machine(&machine("0"), "already-provisioned-0");
    fixture.volumes.add_block_device(
        volume_attachment("0", "0/0"),
        BlockDevice {
            device_name: String::from("xvdf1"),
            hardware_id: None,
            size: 123,
        },
    );

    let mut attachment_info_set = record_set_filesystem_attachment_info(&fixture.filesystems);
    let mut worker = fixture.spawn(machine_scope("0"));

    fixture
        .filesystems
        .fire_attachments(vec![filesystem_attachment("0", "0/0")]);
    expect_no_event(attachment_info_set.recv(), "filesystem attachment info set").await;

    fixture.environ.fire();
    fixture.filesystems.fire_filesystems(&["0/0"]);
    assert_eq!(
        expect_event(
            attachment_info_set.recv(),
            "waiting for filesystem attachment info to be set"
        )
        .await,
        vec![FilesystemAttachment {
            filesystem: filesystem("0/0"),
            machine: machine("0"),
            info: FilesystemAttachmentInfo {
                mount_point: "storage-dir/xvdf1".into(),
                read_only: true,
            },
        }]
    );

    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn update_environ_config_surfaces_source_failures() {
    let fixture = Fixture::new();
    fixture
        .volumes
        .add_provisioned_machine(&machine("1"), "already-provisioned-1");
    fixture.provider.set_volume_source_factory(Box::new(|config, _pool| {
        assert_eq!(config.attrs.get("foo"), Some(&json!("bar")));
        Err(SourceError::provider("zinga"))
    }));

    fixture
        .environ
        .set_config(fixture.environ.config().apply(BTreeMap::from([(
            String::from("foo"),
            json!("bar"),
        )])));

    let mut worker = fixture.spawn(environ_scope());
    fixture.environ.fire();
    fixture.volumes.fire_volumes(&["1", "2"]);

    let err = worker.wait().await.expect_err("worker should fail");
    assert_eq!(
        err.to_string(),
        r#"processing pending volumes: creating volumes: getting volume source: getting storage source "dummy": zinga"#
    );
}

#[tokio::test(start_paused = true)]
async fn resource_tags_are_passed_through_to_sources() {
    let fixture = Fixture::new();
    fixture
        .volumes
        .add_provisioned_machine(&machine("1"), "already-provisioned-1");
    let mut volume_info_set = record_set_volume_info(&fixture.volumes);
    let mut filesystem_info_set = record_set_filesystem_info(&fixture.filesystems);

    let mut worker = fixture.spawn(environ_scope());

    fixture.volumes.fire_volumes(&["1"]);
    fixture.filesystems.fire_filesystems(&["1"]);
    fixture.environ.fire();
    expect_event(volume_info_set.recv(), "waiting for volume info to be set").await;
    expect_event(
        filesystem_info_set.recv(),
        "waiting for filesystem info to be set",
    )
    .await;

    let volume_args = fixture.provider.volume_source_handle();
    let volume_args = volume_args.create_args.lock().expect("args lock");
    assert_eq!(
        *volume_args,
        vec![vec![VolumeParams {
            tag: volume("1"),
            size: 1024,
            provider: String::from("dummy"),
            attributes: BTreeMap::from([(String::from("persistent"), json!(true))]),
            resource_tags: BTreeMap::from([(String::from("very"), String::from("fancy"))]),
            attachment: Some(VolumeAttachmentParams {
                volume: volume("1"),
                volume_id: None,
                machine: machine("1"),
                instance_id: Some(InstanceId::new("already-provisioned-1")),
                provider: String::from("dummy"),
                read_only: true,
            }),
        }]]
    );

    let filesystem_args = fixture.provider.filesystem_source_handle();
    let filesystem_args = filesystem_args.create_args.lock().expect("args lock");
    assert_eq!(
        *filesystem_args,
        vec![vec![FilesystemParams {
            tag: filesystem("1"),
            backing_volume: None,
            size: 1024,
            provider: String::from("dummy"),
            attributes: BTreeMap::new(),
            resource_tags: BTreeMap::from([(String::from("very"), String::from("fancy"))]),
        }]]
    );

    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn set_volume_info_error_stops_the_worker() {
    let fixture = Fixture::new();
    fixture
        .volumes
        .add_provisioned_machine(&machine("1"), "already-provisioned-1");
    fixture.volumes.on_set_volume_info(Box::new(|items| {
        Ok(items
            .iter()
            .map(|_| Err(OperationError::new("message")))
            .collect())
    }));

    let mut worker = fixture.spawn(environ_scope());

    fixture.volumes.fire_volumes(&["1"]);
    fixture.environ.fire();

    let err = worker.wait().await.expect_err("worker should fail");
    assert_eq!(
        err.to_string(),
        "processing pending volumes: publishing volume 1 to state: message"
    );
    assert!(matches!(err, ProvisionerError::PendingVolumes(_)));
}

/// Drives a full agent assembly: worker + state-backed accessors + a
/// dummy provider, provisioning a unit's environment-scoped volume end
/// to end.
#[tokio::test(start_paused = true)]
async fn provisions_state_backed_storage_end_to_end() {
    let registry = Registry::new();
    registry.register("environscoped", Some(Arc::new(DummyProvider::new())));
    let state = State::new(
        registry.clone(),
        vec![PoolConfig::new("environscoped", "environscoped")],
        EnvironConfig::new("testenv", BTreeMap::new()),
    );

    state
        .add_service(
            "db",
            BTreeMap::from([(
                String::from("data"),
                StorageDeclaration {
                    kind: StorageKind::Block,
                    constraints: StorageConstraints::new("environscoped", 1024, 1),
                },
            )]),
        )
        .expect("service should be added");
    let unit = state.add_unit("db").expect("unit should be added");
    let machine_tag = state
        .assign_unit(&unit, AssignmentPolicy::CleanEmpty)
        .expect("assignment should succeed");
    state
        .set_machine_provisioned(&machine_tag, InstanceId::new("inst-1"))
        .expect("machine should exist");

    let scope = Scope::Environ(EnvironTag::parse("environment-uuid").expect("environ tag"));
    let mut volume_events = state.watch_environ_volumes();
    assert_eq!(
        expect_event(volume_events.next(), "waiting for the initial event").await,
        vec![String::from("0")]
    );
    let mut attachment_events = state.watch_volume_attachment(&machine_tag, &volume("0"));
    expect_event(attachment_events.next(), "waiting for the initial event").await;

    let mut worker = StorageProvisioner::new(
        scope.clone(),
        "storage-dir",
        registry,
        Box::new(StateVolumes::new(state.clone(), scope.clone())),
        Box::new(StateFilesystems::new(state.clone(), scope)),
        Box::new(StateLifecycle::new(state.clone())),
        Box::new(StateEnviron::new(state.clone())),
        Box::new(StateMachines::new(state.clone())),
    );

    // The worker provisions the volume, then its attachment.
    expect_event(volume_events.next(), "waiting for the volume to be provisioned").await;
    let provisioned = state.volume(&volume("0")).expect("volume should exist");
    let info = provisioned.info().expect("provisioned").clone();
    assert_eq!(info.volume_id, "id-0");
    assert_eq!(info.size, 1024);
    assert_eq!(info.pool, Some(String::from("environscoped")));

    expect_event(
        attachment_events.next(),
        "waiting for the attachment to be provisioned",
    )
    .await;
    let attachment = state
        .volume_attachment(&machine_tag, &volume("0"))
        .expect("attachment should exist");
    assert_eq!(
        attachment.info().expect("provisioned").device_name,
        "/dev/sda0"
    );

    worker.kill();
    assert_eq!(worker.wait().await, Ok(()));
}
