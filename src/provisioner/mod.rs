//! The storage provisioner worker.
//!
//! Given a scope (the whole environment, or one machine) and a storage
//! directory, the worker merges the accessor change streams into a
//! single reconciliation task and drives storage providers so that the
//! provisioned state they report matches the desired state recorded in
//! the model. The worker owns no durable state: everything it knows is
//! rebuilt from the streams and lookups each session.
//!
//! No provider side-effect happens before the first environment
//! configuration event has been observed; until then changed entities
//! accumulate in the pending sets.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::accessor::{
    AccessorError, EnvironAccessor, FilesystemAccessor, LifecycleManager, LookupError,
    MachineAccessor, VolumeAccessor,
};
use crate::provider::{
    EnvironConfig, Filesystem, FilesystemParams, FilesystemSource, InstanceId, PoolConfig,
    Registry, Volume, VolumeParams, VolumeSource,
};
use crate::tags::{
    FilesystemAttachmentId, FilesystemTag, MachineTag, VolumeAttachmentId, VolumeTag,
};
use crate::watcher::NotifyWatcher;

pub use crate::accessor::Scope;

mod filesystems;
mod managed;
#[cfg(test)]
mod tests;
mod volumes;

pub use managed::ManagedFilesystemSource;

/// Errors that terminate the worker. The display string identifies the
/// pipeline stage that failed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionerError {
    /// A failure while realising pending volumes.
    #[error("processing pending volumes: {0}")]
    PendingVolumes(#[source] PendingError),
    /// A failure while realising pending volume attachments.
    #[error("processing pending volume attachments: {0}")]
    PendingVolumeAttachments(#[source] PendingError),
    /// A failure while realising pending filesystems.
    #[error("processing pending filesystems: {0}")]
    PendingFilesystems(#[source] PendingError),
    /// A failure while realising pending filesystem attachments.
    #[error("processing pending filesystem attachments: {0}")]
    PendingFilesystemAttachments(#[source] PendingError),
    /// A change stream ended while the worker was still running.
    #[error("watching {stream}: change stream closed")]
    StreamClosed {
        /// Stream that ended.
        stream: &'static str,
    },
    /// An accessor query failed outright.
    #[error("{stage}: {source}")]
    Accessor {
        /// What the worker was doing.
        stage: &'static str,
        /// Underlying accessor failure.
        #[source]
        source: AccessorError,
    },
    /// The worker task ended abnormally.
    #[error("storage provisioner task failed: {0}")]
    Task(String),
}

/// Stage-level failures inside one pending pipeline.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PendingError {
    /// Creating volumes through a source failed as a whole.
    #[error("creating volumes: {0}")]
    CreatingVolumes(#[source] SourceOpError),
    /// Attaching volumes through a source failed as a whole.
    #[error("attaching volumes: {0}")]
    AttachingVolumes(#[source] SourceOpError),
    /// Creating filesystems through a source failed as a whole.
    #[error("creating filesystems: {0}")]
    CreatingFilesystems(#[source] SourceOpError),
    /// Attaching filesystems through a source failed as a whole.
    #[error("attaching filesystems: {0}")]
    AttachingFilesystems(#[source] SourceOpError),
    /// A per-item error surfaced while publishing a volume.
    #[error("publishing volume {tag} to state: {message}")]
    PublishVolume {
        /// Volume that could not be published.
        tag: VolumeTag,
        /// Message attributed to the item.
        message: String,
    },
    /// A per-item error surfaced while publishing a filesystem.
    #[error("publishing filesystem {tag} to state: {message}")]
    PublishFilesystem {
        /// Filesystem that could not be published.
        tag: FilesystemTag,
        /// Message attributed to the item.
        message: String,
    },
    /// A per-item error surfaced while publishing a volume attachment.
    #[error("publishing attachment of volume {volume} to machine {machine} to state: {message}")]
    PublishVolumeAttachment {
        /// Volume half of the attachment.
        volume: VolumeTag,
        /// Machine half of the attachment.
        machine: MachineTag,
        /// Message attributed to the item.
        message: String,
    },
    /// A per-item error surfaced while publishing a filesystem
    /// attachment.
    #[error(
        "publishing attachment of filesystem {filesystem} to machine {machine} to state: {message}"
    )]
    PublishFilesystemAttachment {
        /// Filesystem half of the attachment.
        filesystem: FilesystemTag,
        /// Machine half of the attachment.
        machine: MachineTag,
        /// Message attributed to the item.
        message: String,
    },
    /// The setter itself failed while publishing a batch.
    #[error("publishing {what} to state: {source}")]
    Setter {
        /// Batch being published (`volumes`, `filesystem attachments`).
        what: &'static str,
        /// Underlying accessor failure.
        #[source]
        source: AccessorError,
    },
}

/// Failures constructing a provider source.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SourceOpError {
    /// The volume source could not be built.
    #[error("getting volume source: {0}")]
    VolumeSource(#[source] SourceSetupError),
    /// The filesystem source could not be built.
    #[error("getting filesystem source: {0}")]
    FilesystemSource(#[source] SourceSetupError),
    /// The block-device lookup backing a managed source failed.
    #[error("getting block devices: {0}")]
    BlockDevices(String),
    /// The source call itself failed as a whole.
    #[error("{0}")]
    Call(#[source] crate::provider::SourceError),
}

/// The storage-source lookup failure underneath [`SourceOpError`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SourceSetupError {
    /// Looking up or constructing the named source failed.
    #[error("getting storage source \"{name}\": {message}")]
    Storage {
        /// Provider name the pool selected.
        name: String,
        /// Underlying failure message.
        message: String,
    },
}

/// Handle to a running storage provisioner worker.
pub struct StorageProvisioner {
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    handle: JoinHandle<Result<(), ProvisionerError>>,
}

impl StorageProvisioner {
    /// Spawns a worker for `scope`, mounting managed filesystems under
    /// `storage_dir`, resolving providers through `registry`.
    #[must_use]
    pub fn new(
        scope: Scope,
        storage_dir: impl Into<Utf8PathBuf>,
        registry: Registry,
        volumes: Box<dyn VolumeAccessor>,
        filesystems: Box<dyn FilesystemAccessor>,
        lifecycle: Box<dyn LifecycleManager>,
        environ: Box<dyn EnvironAccessor>,
        machines: Box<dyn MachineAccessor>,
    ) -> Self {
        let (kill_tx, kill_rx) = oneshot::channel();
        let (machine_tx, machine_rx) = mpsc::unbounded_channel();
        let core = WorkerCore {
            scope,
            storage_dir: storage_dir.into(),
            registry,
            volumes,
            filesystems,
            lifecycle,
            environ,
            machines,
            environ_config: None,
            volume_sources: HashMap::new(),
            filesystem_sources: HashMap::new(),
            pending_volumes: BTreeMap::new(),
            pending_volume_attachments: BTreeMap::new(),
            pending_filesystems: BTreeMap::new(),
            pending_filesystem_attachments: BTreeMap::new(),
            provisioned_volumes: BTreeMap::new(),
            provisioned_filesystems: BTreeMap::new(),
            instance_ids: BTreeMap::new(),
            session_volume_attachments: HashSet::new(),
            session_filesystem_attachments: HashSet::new(),
            machine_tx,
            watched_machines: HashSet::new(),
            machine_tasks: Vec::new(),
        };
        let handle = tokio::spawn(run(core, kill_rx, machine_rx));
        Self {
            kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            handle,
        }
    }

    /// Asks the worker to stop. Idempotent.
    pub fn kill(&self) {
        let sender = self
            .kill_tx
            .lock()
            .expect("kill lock poisoned")
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// Waits for the worker to stop, returning the first fatal error
    /// observed, or `Ok` after a clean kill.
    pub async fn wait(&mut self) -> Result<(), ProvisionerError> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(err) => Err(ProvisionerError::Task(err.to_string())),
        }
    }
}

pub(crate) struct WorkerCore {
    pub(crate) scope: Scope,
    pub(crate) storage_dir: Utf8PathBuf,
    pub(crate) registry: Registry,
    pub(crate) volumes: Box<dyn VolumeAccessor>,
    pub(crate) filesystems: Box<dyn FilesystemAccessor>,
    pub(crate) lifecycle: Box<dyn LifecycleManager>,
    pub(crate) environ: Box<dyn EnvironAccessor>,
    pub(crate) machines: Box<dyn MachineAccessor>,

    pub(crate) environ_config: Option<EnvironConfig>,
    pub(crate) volume_sources: HashMap<String, Arc<dyn VolumeSource>>,
    pub(crate) filesystem_sources: HashMap<String, Arc<dyn FilesystemSource>>,

    pub(crate) pending_volumes: BTreeMap<VolumeTag, VolumeParams>,
    pub(crate) pending_volume_attachments:
        BTreeMap<VolumeAttachmentId, crate::provider::VolumeAttachmentParams>,
    pub(crate) pending_filesystems: BTreeMap<FilesystemTag, FilesystemParams>,
    pub(crate) pending_filesystem_attachments:
        BTreeMap<FilesystemAttachmentId, crate::provider::FilesystemAttachmentParams>,

    pub(crate) provisioned_volumes: BTreeMap<VolumeTag, Volume>,
    pub(crate) provisioned_filesystems: BTreeMap<FilesystemTag, Filesystem>,
    pub(crate) instance_ids: BTreeMap<MachineTag, InstanceId>,

    pub(crate) session_volume_attachments: HashSet<VolumeAttachmentId>,
    pub(crate) session_filesystem_attachments: HashSet<FilesystemAttachmentId>,

    machine_tx: mpsc::UnboundedSender<MachineTag>,
    watched_machines: HashSet<MachineTag>,
    machine_tasks: Vec<JoinHandle<()>>,
}

async fn run(
    mut core: WorkerCore,
    mut kill_rx: oneshot::Receiver<()>,
    mut machine_rx: mpsc::UnboundedReceiver<MachineTag>,
) -> Result<(), ProvisionerError> {
    let mut volumes_w = core.volumes.watch_volumes();
    let mut volume_attachments_w = core.volumes.watch_volume_attachments();
    let mut filesystems_w = core.filesystems.watch_filesystems();
    let mut filesystem_attachments_w = core.filesystems.watch_filesystem_attachments();
    let mut environ_w = core.environ.watch_environ();
    let mut block_devices_w = core
        .scope
        .machine()
        .map(|machine| core.volumes.watch_block_devices(machine));

    let result = loop {
        tokio::select! {
            _ = &mut kill_rx => break Ok(()),
            changes = volumes_w.next() => {
                let Some(changes) = changes else {
                    break Err(ProvisionerError::StreamClosed { stream: "volumes" });
                };
                if let Err(err) = core.volumes_changed(changes).await {
                    break Err(err);
                }
            }
            changes = volume_attachments_w.next() => {
                let Some(changes) = changes else {
                    break Err(ProvisionerError::StreamClosed { stream: "volume attachments" });
                };
                if let Err(err) = core.volume_attachments_changed(changes).await {
                    break Err(err);
                }
            }
            changes = filesystems_w.next() => {
                let Some(changes) = changes else {
                    break Err(ProvisionerError::StreamClosed { stream: "filesystems" });
                };
                if let Err(err) = core.filesystems_changed(changes).await {
                    break Err(err);
                }
            }
            changes = filesystem_attachments_w.next() => {
                let Some(changes) = changes else {
                    break Err(ProvisionerError::StreamClosed {
                        stream: "filesystem attachments",
                    });
                };
                if let Err(err) = core.filesystem_attachments_changed(changes).await {
                    break Err(err);
                }
            }
            event = environ_w.next() => {
                let Some(()) = event else {
                    break Err(ProvisionerError::StreamClosed { stream: "environ" });
                };
                if let Err(err) = core.environ_changed().await {
                    break Err(err);
                }
            }
            Some(()) = next_block_device_event(&mut block_devices_w) => {
                debug!("block devices changed; re-evaluating pending filesystems");
            }
            machine = machine_rx.recv() => {
                // The worker holds the sender, so the channel never closes.
                let Some(machine) = machine else {
                    break Err(ProvisionerError::StreamClosed { stream: "machines" });
                };
                if let Err(err) = core.machine_changed(&machine).await {
                    break Err(err);
                }
            }
        }
        if let Err(err) = core.process_pending().await {
            break Err(err);
        }
    };

    for task in core.machine_tasks.drain(..) {
        task.abort();
    }
    result
}

async fn next_block_device_event(watcher: &mut Option<NotifyWatcher>) -> Option<()> {
    match watcher {
        Some(watcher) => watcher.next().await,
        None => std::future::pending().await,
    }
}

impl WorkerCore {
    /// Applies a fresh environment configuration and drops cached
    /// sources so they are rebuilt lazily against the new config.
    pub(crate) async fn environ_changed(&mut self) -> Result<(), ProvisionerError> {
        let config = self
            .environ
            .model_config()
            .await
            .map_err(|source| ProvisionerError::Accessor {
                stage: "getting environ config",
                source,
            })?;
        debug!(environ = %config.name, "environ configuration updated");
        self.environ_config = Some(config);
        self.volume_sources.clear();
        self.filesystem_sources.clear();
        Ok(())
    }

    /// Refreshes the instance id of a machine one of our pending items
    /// is waiting on.
    pub(crate) async fn machine_changed(
        &mut self,
        machine: &MachineTag,
    ) -> Result<(), ProvisionerError> {
        let results = self
            .machines
            .instance_ids(std::slice::from_ref(machine))
            .await
            .map_err(|source| ProvisionerError::Accessor {
                stage: "getting machine instance ids",
                source,
            })?;
        match results.into_iter().next() {
            Some(Ok(instance_id)) => {
                debug!(%machine, %instance_id, "machine provisioned");
                self.instance_ids.insert(machine.clone(), instance_id);
            }
            Some(Err(LookupError::NotProvisioned(_) | LookupError::NotFound(_))) | None => {}
            Some(Err(err)) => {
                warn!(%machine, error = %err, "looking up machine instance id");
            }
        }
        Ok(())
    }

    /// Starts a watcher for a machine a pending item needs an instance
    /// id for. Idempotent per machine and session.
    pub(crate) fn watch_machine(&mut self, machine: &MachineTag) {
        if !self.watched_machines.insert(machine.clone()) {
            return;
        }
        let mut watcher = self.machines.watch_machine(machine);
        let tx = self.machine_tx.clone();
        let tag = machine.clone();
        self.machine_tasks.push(tokio::spawn(async move {
            while watcher.next().await.is_some() {
                if tx.send(tag.clone()).is_err() {
                    break;
                }
            }
        }));
    }

    /// Resolves the instance id for a machine from pending params or the
    /// session cache.
    pub(crate) fn instance_id_for(
        &self,
        machine: &MachineTag,
        known: Option<&InstanceId>,
    ) -> Option<InstanceId> {
        known
            .cloned()
            .or_else(|| self.instance_ids.get(machine).cloned())
    }

    /// Builds (or returns the cached) volume source for a provider.
    pub(crate) fn volume_source(
        &mut self,
        environ: &EnvironConfig,
        name: &str,
    ) -> Result<Arc<dyn VolumeSource>, SourceSetupError> {
        if let Some(source) = self.volume_sources.get(name) {
            return Ok(Arc::clone(source));
        }
        let provider = self
            .registry
            .lookup(name)
            .map_err(|err| SourceSetupError::Storage {
                name: name.to_owned(),
                message: err.to_string(),
            })?;
        let source = provider
            .volume_source(environ, &PoolConfig::new(name, name))
            .map_err(|err| SourceSetupError::Storage {
                name: name.to_owned(),
                message: err.to_string(),
            })?;
        self.volume_sources.insert(name.to_owned(), Arc::clone(&source));
        Ok(source)
    }

    /// Builds (or returns the cached) filesystem source for a provider.
    pub(crate) fn filesystem_source(
        &mut self,
        environ: &EnvironConfig,
        name: &str,
    ) -> Result<Arc<dyn FilesystemSource>, SourceSetupError> {
        if let Some(source) = self.filesystem_sources.get(name) {
            return Ok(Arc::clone(source));
        }
        let provider = self
            .registry
            .lookup(name)
            .map_err(|err| SourceSetupError::Storage {
                name: name.to_owned(),
                message: err.to_string(),
            })?;
        let source = provider
            .filesystem_source(environ, &PoolConfig::new(name, name))
            .map_err(|err| SourceSetupError::Storage {
                name: name.to_owned(),
                message: err.to_string(),
            })?;
        self.filesystem_sources
            .insert(name.to_owned(), Arc::clone(&source));
        Ok(source)
    }

    /// Reports whether provider-backed creation may go ahead for a
    /// provider: dynamic providers always may, non-dynamic ones only
    /// when this worker provisions a machine's own storage.
    pub(crate) fn creation_allowed(&self, dynamic: bool) -> bool {
        dynamic || matches!(self.scope, Scope::Machine(_))
    }

    /// One reconciliation pass over all four pending sets, in dependency
    /// order. No provider side-effect happens before the environment
    /// configuration is known.
    pub(crate) async fn process_pending(&mut self) -> Result<(), ProvisionerError> {
        if self.environ_config.is_none() {
            debug!("deferring reconciliation until environ config is known");
            return Ok(());
        }
        self.process_pending_volumes()
            .await
            .map_err(ProvisionerError::PendingVolumes)?;
        self.process_pending_volume_attachments()
            .await
            .map_err(ProvisionerError::PendingVolumeAttachments)?;
        self.process_pending_filesystems()
            .await
            .map_err(ProvisionerError::PendingFilesystems)?;
        self.process_pending_filesystem_attachments()
            .await
            .map_err(ProvisionerError::PendingFilesystemAttachments)?;
        Ok(())
    }
}
