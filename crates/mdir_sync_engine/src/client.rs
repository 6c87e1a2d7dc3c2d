//! Client runtime.
//!
//! A [`SyncClient`] owns one mirror root and keeps it synchronized through a
//! [`Transport`]. Three roles share one connection:
//!
//! - the connector ([`SyncClient::run`]) connects, reconnects with backoff and
//!   invalidates outstanding commands after every connection loss;
//! - the reader applies incoming patches through each folder's reassembly
//!   buffer and hands responses to the command tracker;
//! - the writer walks the folder tree, reconciles mirrors and issues
//!   SUB/UNSUB/PUT/REM. It sleeps until woken by [`SyncClient::notify_changed`]
//!   or an incoming message, or until the poll interval elapses.

use crate::config::SyncConfig;
use crate::content::ContentStore;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::{self, Reconciler};
use crate::tracker::{Command, CommandTracker, Finalizer};
use crate::transport::{Connection, Transport};
use crate::tree::{Discovery, FolderTree, PendingCreation};
use mdir_codec::{decode_text, DocType, Header};
use mdir_core::{
    Digest, DirId, DirectoryFolderStorage, Folder, FolderKind, FolderRegistry, MirrorRoot,
    OfferOutcome, SyncMap,
};
use mdir_protocol::{
    validate_dir_id, Action, CommandKind, Patch, Request, Response, Seq, ServerMessage,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters readable while the client runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Remote patches committed to a journal.
    pub patches_applied: u64,
    /// Remote patches discarded as retransmissions or duplicates.
    pub duplicates_discarded: u64,
    /// Commands sent.
    pub commands_issued: u64,
    /// Commands answered with 200.
    pub commands_succeeded: u64,
    /// Commands answered with another status.
    pub commands_failed: u64,
    /// Connections established after the first.
    pub reconnects: u64,
    /// Reconciliation conflicts (local copy kept aside).
    pub conflicts: u64,
}

#[derive(Debug, Default)]
struct Subscriptions {
    subscribing: HashSet<DirId>,
    subscribed: HashSet<DirId>,
}

struct ClientInner {
    config: SyncConfig,
    mirror: MirrorRoot,
    registry: FolderRegistry,
    tracker: CommandTracker,
    tree: Mutex<FolderTree>,
    content: Arc<dyn ContentStore>,
    subscriptions: Mutex<Subscriptions>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Request>>>,
    connection: Mutex<Option<CancellationToken>>,
    wake: Notify,
    shutdown: CancellationToken,
    stats: RwLock<SyncStats>,
    connected_before: AtomicBool,
}

/// Keeps a mirror root synchronized with a server.
pub struct SyncClient<T: Transport> {
    inner: Arc<ClientInner>,
    transport: Arc<T>,
}

impl<T: Transport> Clone for SyncClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport> std::fmt::Debug for SyncClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("root", &self.inner.config.root)
            .field("user", &self.inner.config.user)
            .finish()
    }
}

impl<T: Transport> SyncClient<T> {
    /// Opens the mirror at `config.root`, recovering every mirrored folder.
    ///
    /// # Errors
    ///
    /// Fails if the mirror root or the folder tree cannot be read, or a
    /// journal is corrupt or locked by another process.
    pub fn new(
        config: SyncConfig,
        transport: T,
        content: Arc<dyn ContentStore>,
    ) -> SyncResult<Self> {
        let mirror = MirrorRoot::open(&config.root)?;
        let registry = FolderRegistry::new(
            Arc::new(DirectoryFolderStorage::new(mirror.mdirs_dir())),
            config.journal.clone(),
        )?;
        let tree = FolderTree::load(&mirror.tree_path(), DirId::new(config.root_dir_id.clone()))?;

        for (path, dir_id) in tree.folders() {
            let folder_mirror = mirror.folder(&dir_id);
            folder_mirror.create()?;
            if dir_id.is_transient() {
                continue;
            }
            let folder = registry.get_or_open(&dir_id)?;
            let version = folder_mirror.recover_version(folder.version())?;
            debug!(path = %path, %dir_id, version, "folder recovered");
        }
        info!(root = %config.root.display(), user = %config.user, "mirror opened");

        Ok(Self {
            inner: Arc::new(ClientInner {
                tracker: CommandTracker::new(config.command_timeout),
                config,
                mirror,
                registry,
                tree: Mutex::new(tree),
                content,
                subscriptions: Mutex::new(Subscriptions::default()),
                outgoing: Mutex::new(None),
                connection: Mutex::new(None),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                stats: RwLock::new(SyncStats::default()),
                connected_before: AtomicBool::new(false),
            }),
            transport: Arc::new(transport),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Returns true while a connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.outgoing.lock().is_some()
    }

    /// Identifier linked at tree path `path`.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<DirId> {
        let path = FolderTree::normalize(path).ok()?;
        self.inner.tree.lock().resolve(&path)
    }

    /// Local directory mirroring the folder at `path`.
    pub fn folder_dir(&self, path: &str) -> SyncResult<PathBuf> {
        let dir_id = self
            .resolve(path)
            .ok_or_else(|| SyncError::UnknownFolder {
                path: path.to_string(),
            })?;
        Ok(self.inner.mirror.folder(&dir_id).path().to_path_buf())
    }

    /// The open folder linked at `path`.
    #[must_use]
    pub fn folder(&self, path: &str) -> Option<Arc<Folder>> {
        let dir_id = self.resolve(path)?;
        self.inner.registry.lookup(&dir_id)
    }

    /// Returns true once the server confirmed the subscription to the folder
    /// at `path`.
    #[must_use]
    pub fn is_subscribed(&self, path: &str) -> bool {
        self.resolve(path)
            .is_some_and(|dir_id| self.inner.subscriptions.lock().subscribed.contains(&dir_id))
    }

    /// Every linked folder, top folder first.
    #[must_use]
    pub fn folders(&self) -> Vec<(String, DirId)> {
        self.inner.tree.lock().folders()
    }

    /// Creates a plain sub-folder. See [`create_folder_with_kind`](Self::create_folder_with_kind).
    pub fn create_folder(&self, path: &str) -> SyncResult<DirId> {
        self.create_folder_with_kind(path, FolderKind::Plain)
    }

    /// Creates a sub-folder at `path`.
    ///
    /// Works offline: the path is linked to a transient identifier at once
    /// and the directory document is staged in the parent's mirror. The
    /// link is rewritten when the server assigns the durable identifier.
    /// An existing link is returned unchanged.
    ///
    /// # Errors
    ///
    /// Fails if the path is malformed or its parent is not linked.
    pub fn create_folder_with_kind(&self, path: &str, kind: FolderKind) -> SyncResult<DirId> {
        let path = FolderTree::normalize(path)?;
        let (parent_path, name) = FolderTree::split(&path)
            .ok_or_else(|| SyncError::invalid_path(&path, "the top folder always exists"))?;

        let mut tree = self.inner.tree.lock();
        if let Some(existing) = tree.resolve(&path) {
            return Ok(existing);
        }
        let parent = tree
            .resolve(parent_path)
            .ok_or_else(|| SyncError::UnknownFolder {
                path: parent_path.to_string(),
            })?;

        let transient = tree.create_transient(&path, kind)?;
        let parent_mirror = self.inner.mirror.folder(&parent);
        parent_mirror.create()?;
        let staged = parent_mirror.stage_put(&kind.directory(name))?;
        tree.set_staged(&transient, staged_name(&staged));
        self.inner.mirror.folder(&transient).create()?;
        tree.save()?;
        drop(tree);

        info!(path = %path, %transient, %parent, "folder created locally");
        self.inner.wake.notify_one();
        Ok(transient)
    }

    /// Asks the writer for an immediate pass.
    pub fn notify_changed(&self) {
        self.inner.wake.notify_one();
    }

    /// Ends the session: sends QUIT if connected, then stops [`run`](Self::run).
    pub async fn shutdown(&self) {
        let connection = self.inner.connection.lock().clone();
        if let Some(connection) = connection {
            let root = self.inner.tree.lock().root_id().clone();
            if let Some(seq) = self.inner.tracker.try_issue(CommandKind::Quit, &root, "").issued() {
                self.inner.send(Request::Quit { seq });
                tokio::select! {
                    () = connection.cancelled() => {}
                    () = tokio::time::sleep(self.inner.config.command_timeout) => {
                        warn!(seq, "QUIT not acknowledged");
                    }
                }
            }
        }
        self.inner.shutdown.cancel();
    }

    /// Runs the connector until [`shutdown`](Self::shutdown) or until
    /// reconnecting is given up.
    ///
    /// # Errors
    ///
    /// Returns the last connection error once the retry policy is exhausted,
    /// or immediately for a non-retryable error.
    pub async fn run(&self) -> SyncResult<()> {
        let shutdown = self.inner.shutdown.clone();
        let retry = self.inner.config.retry.clone();
        let mut failures = 0u32;

        while !shutdown.is_cancelled() {
            let connected = tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.transport.connect() => result,
            };
            match connected {
                Ok(connection) => {
                    failures = 0;
                    self.serve(connection).await;
                }
                Err(e) if e.is_retryable() => {
                    failures = failures.saturating_add(1);
                    if !retry.should_retry(failures) {
                        error!(failures, error = %e, "giving up connecting");
                        return Err(e);
                    }
                    let delay = retry.delay_for_attempt(failures);
                    debug!(failures, ?delay, error = %e, "connect failed, retrying");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "connect failed");
                    return Err(e);
                }
            }
        }
        info!("sync client stopped");
        Ok(())
    }

    /// Drives one connection until it is lost or cancelled.
    async fn serve(&self, connection: Connection) {
        let inner = Arc::clone(&self.inner);
        let Connection {
            outgoing,
            mut incoming,
        } = connection;

        let stale = inner.tracker.invalidate_all();
        {
            let mut subscriptions = inner.subscriptions.lock();
            subscriptions.subscribing.clear();
            subscriptions.subscribed.clear();
        }
        if inner.connected_before.swap(true, Ordering::SeqCst) {
            inner.stats.write().reconnects += 1;
        }
        let token = inner.shutdown.child_token();
        *inner.outgoing.lock() = Some(outgoing.clone());
        *inner.connection.lock() = Some(token.clone());
        info!(stale, "connected");

        let writer = tokio::spawn(writer_loop(Arc::clone(&inner), outgoing, token.clone()));

        loop {
            let message = tokio::select! {
                () = token.cancelled() => break,
                message = incoming.recv() => message,
            };
            match message {
                Some(message) => inner.handle_message(message),
                None => {
                    info!("connection lost");
                    break;
                }
            }
        }

        token.cancel();
        if let Err(e) = writer.await {
            error!(error = %e, "writer task failed");
        }
        *inner.outgoing.lock() = None;
        *inner.connection.lock() = None;
    }
}

async fn writer_loop(
    inner: Arc<ClientInner>,
    outgoing: mpsc::UnboundedSender<Request>,
    token: CancellationToken,
) {
    loop {
        let pass = {
            let inner = Arc::clone(&inner);
            let outgoing = outgoing.clone();
            tokio::task::spawn_blocking(move || inner.sync_pass(&outgoing))
        };
        match pass.await {
            Ok(sent) if sent > 0 => debug!(sent, "writer pass done"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "writer pass failed"),
        }
        tokio::select! {
            () = token.cancelled() => break,
            () = inner.wake.notified() => {}
            () = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    }
}

impl ClientInner {
    fn send(&self, request: Request) {
        let outgoing = self.outgoing.lock().clone();
        let sent = outgoing.is_some_and(|outgoing| outgoing.send(request).is_ok());
        if !sent {
            debug!("not connected, request dropped");
        }
    }

    /// Records a command and builds its request, unless an equivalent one
    /// is in flight.
    fn issue(
        &self,
        kind: CommandKind,
        dir_id: &DirId,
        path: &str,
        build: impl FnOnce(Seq) -> Request,
    ) -> SyncResult<Option<Request>> {
        self.tree.lock().guard_dir_id(dir_id)?;
        let Some(seq) = self.tracker.try_issue(kind, dir_id, path).issued() else {
            return Ok(None);
        };
        self.stats.write().commands_issued += 1;
        debug!(seq, %kind, %dir_id, path, "command issued");
        Ok(Some(build(seq)))
    }

    fn handle_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Response(response) => {
                let mut finalizer = ClientFinalizer { inner: self };
                match self.tracker.resolve(&response, &mut finalizer) {
                    Some(_) => {
                        let mut stats = self.stats.write();
                        if response.is_success() {
                            stats.commands_succeeded += 1;
                        } else {
                            stats.commands_failed += 1;
                            let err = SyncError::Rejected {
                                seq: response.seq,
                                status: response.status,
                            };
                            warn!(error = %err, "command failed");
                        }
                    }
                    None => debug!(seq = response.seq, "response to no outstanding command"),
                }
            }
            ServerMessage::Patch { dir_id, patch } => {
                let applied = checked_dir_id(&dir_id)
                    .and_then(|dir_id| self.apply_patch(&dir_id, patch));
                if let Err(e) = applied {
                    error!(%dir_id, error = %e, "patch not applied");
                }
            }
        }
        self.wake.notify_one();
    }

    fn apply_patch(&self, dir_id: &DirId, patch: Patch) -> SyncResult<()> {
        if dir_id.is_transient() {
            return Err(SyncError::invalid_path(dir_id.as_str(), "patch for a transient folder"));
        }
        let folder = self.registry.get_or_open(dir_id)?;
        let report = folder.apply_remote(patch)?;
        if report.outcome != OfferOutcome::Buffered {
            self.stats.write().duplicates_discarded += 1;
            return Ok(());
        }
        if report.applied.is_empty() {
            debug!(%dir_id, pending = report.pending, "patch buffered behind a gap");
            return Ok(());
        }

        let mirror = self.mirror.folder(dir_id);
        mirror.create()?;
        for patch in &report.applied {
            match patch.action {
                Action::Add => {
                    mirror.hide_document(&patch.header)?;
                    if patch.header.doc_type() == DocType::Directory {
                        self.discover(dir_id, &patch.header)?;
                    }
                }
                Action::Remove => {
                    let Some(target) = patch.header.target() else {
                        continue;
                    };
                    if let Some((removed, _)) = folder.journal().read(target)? {
                        mirror.unhide_document(&removed)?;
                        if removed.doc_type() == DocType::Directory {
                            self.drop_directory(dir_id, &removed)?;
                        }
                    }
                }
            }
        }
        mirror.save_version(folder.version())?;
        self.stats.write().patches_applied += report.applied.len() as u64;
        Ok(())
    }

    /// Folds a directory entry of the folder `parent` into the tree.
    fn discover(&self, parent: &DirId, header: &Header) -> SyncResult<()> {
        let (Some(name), Some(child)) = (header.name(), header.dir_id()) else {
            return Ok(());
        };
        let child = checked_dir_id(child)?;
        let mut tree = self.tree.lock();
        let Some(parent_path) = tree.path_of(parent) else {
            return Ok(());
        };
        self.registry.set_kind(&child, FolderKind::of_directory(header));
        match tree.discover(&parent_path, name, &child)? {
            Discovery::Linked => {
                self.mirror.folder(&child).create()?;
                info!(path = %FolderTree::join(&parent_path, name), dir_id = %child, "folder discovered");
            }
            Discovery::Merge(transient) => self.adopt(&mut tree, &transient, &child)?,
            Discovery::Known | Discovery::Shadowed(_) => return Ok(()),
        }
        tree.save()
    }

    /// Unlinks the folder a removed directory entry pointed at.
    fn drop_directory(&self, parent: &DirId, header: &Header) -> SyncResult<()> {
        let (Some(name), Some(child)) = (header.name(), header.dir_id()) else {
            return Ok(());
        };
        let mut tree = self.tree.lock();
        let Some(parent_path) = tree.path_of(parent) else {
            return Ok(());
        };
        let path = FolderTree::join(&parent_path, name);
        if tree.resolve(&path).as_ref().map(DirId::as_str) == Some(child) {
            tree.unlink(&path);
            tree.save()?;
            info!(path = %path, dir_id = child, "folder unlinked after remote removal");
        }
        Ok(())
    }

    /// Turns the transient folder into `durable`: moves its mirror and
    /// rewrites its link. A staged creation not yet sent is withdrawn.
    fn adopt(&self, tree: &mut FolderTree, transient: &DirId, durable: &DirId) -> SyncResult<()> {
        tree.guard_dir_id(durable)?;
        let staged = tree
            .pending()
            .find(|(id, _)| *id == transient)
            .and_then(|(_, creation)| Some((creation.path.clone(), creation.staged.clone()?)));
        if let Some((path, staged)) = staged {
            self.withdraw_creation(tree, &path, &staged)?;
        }
        if tree.path_of(transient).is_some() {
            self.registry.forget(transient);
            self.mirror.rename_folder(transient, durable)?;
        }
        tree.confirm(transient, durable)?;
        Ok(())
    }

    fn withdraw_creation(&self, tree: &FolderTree, path: &str, staged: &str) -> SyncResult<()> {
        let Some(parent) = FolderTree::split(path).and_then(|(parent, _)| tree.resolve(parent)) else {
            return Ok(());
        };
        let staged_path = self.mirror.folder(&parent).put_dir().join(staged);
        let key = staged_path.to_string_lossy();
        if self.tracker.outstanding(CommandKind::Put, &key).is_none() {
            remove_if_exists(&staged_path)?;
        }
        Ok(())
    }

    /// One writer pass. Returns the number of requests sent.
    fn sync_pass(&self, outgoing: &mpsc::UnboundedSender<Request>) -> usize {
        let timed_out = self.tracker.sweep();
        if timed_out > 0 {
            debug!(timed_out, "commands timed out");
        }
        let folders = self.tree.lock().folders();
        let mut requests = Vec::new();

        for (path, dir_id) in folders.iter().filter(|(_, id)| !id.is_transient()) {
            if let Err(e) = self.subscribe(dir_id, &mut requests) {
                error!(path = %path, %dir_id, error = %e, "subscription failed");
            }
        }
        let linked: HashSet<&DirId> = folders.iter().map(|(_, id)| id).collect();
        self.unsubscribe_unlinked(&linked, &mut requests);
        self.resolve_pending_creations();

        let known = self.known_resources(&folders);
        for (path, dir_id) in folders.iter().filter(|(_, id)| !id.is_transient()) {
            if let Err(e) = self.sync_folder(dir_id, &known, &mut requests) {
                error!(path = %path, %dir_id, error = %e, "folder pass failed");
            }
        }

        let mut sent = 0;
        for request in requests {
            if outgoing.send(request).is_err() {
                debug!("connection closed during writer pass");
                break;
            }
            sent += 1;
        }
        sent
    }

    fn subscribe(&self, dir_id: &DirId, requests: &mut Vec<Request>) -> SyncResult<()> {
        let folder = self.registry.get_or_open(dir_id)?;
        self.mirror.folder(dir_id).create()?;
        if self.subscriptions.lock().subscribed.contains(dir_id) {
            return Ok(());
        }
        let request = self.issue(CommandKind::Sub, dir_id, dir_id.as_str(), |seq| Request::Sub {
            seq,
            dir_id: dir_id.to_string(),
            from_version: folder.version(),
        })?;
        if let Some(request) = request {
            self.subscriptions.lock().subscribing.insert(dir_id.clone());
            requests.push(request);
        }
        Ok(())
    }

    fn unsubscribe_unlinked(&self, linked: &HashSet<&DirId>, requests: &mut Vec<Request>) {
        let unlinked: Vec<DirId> = self
            .subscriptions
            .lock()
            .subscribed
            .iter()
            .filter(|id| !linked.contains(id))
            .cloned()
            .collect();
        for dir_id in unlinked {
            let request = self.issue(CommandKind::Unsub, &dir_id, dir_id.as_str(), |seq| {
                Request::Unsub {
                    seq,
                    dir_id: dir_id.to_string(),
                }
            });
            match request {
                Ok(Some(request)) => requests.push(request),
                Ok(None) => {}
                Err(e) => error!(%dir_id, error = %e, "unsubscribe failed"),
            }
        }
    }

    fn resolve_pending_creations(&self) {
        let pending: Vec<(DirId, PendingCreation)> = self
            .tree
            .lock()
            .pending()
            .map(|(id, creation)| (id.clone(), creation.clone()))
            .collect();
        for (transient, creation) in pending {
            if let Err(e) = self.resolve_creation(&transient, &creation) {
                warn!(path = %creation.path, %transient, error = %e, "folder creation not resolved");
            }
        }
    }

    /// Settles a creation whose PUT is no longer staged: answered without an
    /// identifier, rejected, or lost. The parent's view decides whether the
    /// folder exists by now; otherwise the creation is staged again.
    fn resolve_creation(&self, transient: &DirId, creation: &PendingCreation) -> SyncResult<()> {
        let Some((parent_path, name)) = FolderTree::split(&creation.path) else {
            return Ok(());
        };
        let Some(parent) = self.tree.lock().resolve(parent_path) else {
            return Ok(());
        };
        if parent.is_transient() {
            return Ok(());
        }
        let parent_mirror = self.mirror.folder(&parent);
        if let Some(staged) = &creation.staged {
            if parent_mirror.put_dir().join(staged).exists() {
                return Ok(());
            }
        }
        // the parent's view must be current before deciding
        if !self.subscriptions.lock().subscribed.contains(&parent) {
            return Ok(());
        }

        let folder = self.registry.get_or_open(&parent)?;
        let existing = folder
            .with_view(|view| view.directory_by_name(name))
            .and_then(|record| record.dir_id);
        let mut tree = self.tree.lock();
        match existing {
            Some(durable) => self.adopt(&mut tree, transient, &DirId::new(durable))?,
            None => {
                let staged = parent_mirror.stage_put(&creation.kind.directory(name))?;
                tree.set_staged(transient, staged_name(&staged));
                debug!(path = %creation.path, %transient, "folder creation staged again");
            }
        }
        tree.save()
    }

    /// Resources already on the server, by digest.
    fn known_resources(&self, folders: &[(String, DirId)]) -> HashMap<Digest, String> {
        let mut known = HashMap::new();
        for (_, dir_id) in folders {
            if let Some(folder) = self.registry.lookup(dir_id) {
                for record in folder.files() {
                    known
                        .entry(Digest::from_hex(record.digest))
                        .or_insert(record.resource);
                }
            }
        }
        known
    }

    /// Reconciles one subscribed folder and issues its staged changes.
    fn sync_folder(
        &self,
        dir_id: &DirId,
        known: &HashMap<Digest, String>,
        requests: &mut Vec<Request>,
    ) -> SyncResult<()> {
        let mirror = self.mirror.folder(dir_id);
        if self.subscriptions.lock().subscribed.contains(dir_id) {
            let folder = self.registry.get_or_open(dir_id)?;
            let remote = folder.files();
            let map_path = mirror.sync_map_path();
            let mut map = SyncMap::load(&map_path)?;
            let plan = reconcile::plan(&mirror, &map, &remote)?;
            if !plan.is_empty() {
                let cache_dir = self.mirror.cache_dir();
                let report = Reconciler::new(&mirror, &cache_dir, self.content.as_ref(), known)
                    .execute(&plan, &mut map, &remote);
                map.save(&map_path)?;
                debug!(%dir_id, ?report, busy = plan.busy.len(), "folder reconciled");
                self.stats.write().conflicts += report.conflicts as u64;
            }
        }

        for staged in mirror.staged_puts()? {
            if let Err(e) = self.tree.lock().guard_header(&staged.header) {
                error!(path = %staged.path.display(), error = %e, "staged document not sent");
                continue;
            }
            let key = staged.path.to_string_lossy();
            let header = staged.header;
            if let Some(request) = self.issue(CommandKind::Put, dir_id, &key, |seq| Request::Put {
                seq,
                dir_id: dir_id.to_string(),
                header,
            })? {
                requests.push(request);
            }
        }
        for removal in mirror.staged_removals()? {
            let key = removal.path.to_string_lossy();
            if let Some(request) = self.issue(CommandKind::Rem, dir_id, &key, |seq| Request::Rem {
                seq,
                dir_id: dir_id.to_string(),
                version: removal.version,
            })? {
                requests.push(request);
            }
        }
        Ok(())
    }

    /// A rejected file upload leaves no trace in the sync map, so the next
    /// pass sees the local file as new again instead of as deleted remotely.
    fn forget_upload(&self, dir_id: &DirId, header: &Header) -> SyncResult<()> {
        let Some(name) = header.name() else {
            return Ok(());
        };
        let map_path = self.mirror.folder(dir_id).sync_map_path();
        let mut map = SyncMap::load(&map_path)?;
        if map.remove(name).is_some() {
            map.save(&map_path)?;
        }
        Ok(())
    }
}

struct ClientFinalizer<'a> {
    inner: &'a ClientInner,
}

impl ClientFinalizer<'_> {
    fn finish_put(&self, command: &Command, response: &Response) -> SyncResult<()> {
        let staged = Path::new(&command.path);
        let header = fs::read_to_string(staged)
            .ok()
            .and_then(|text| decode_text(&text).ok());
        remove_if_exists(staged)?;

        let mut tree = self.inner.tree.lock();
        let pending = tree.pending_by_staged(staged_name(staged));
        match (pending, response.is_success()) {
            (Some(transient), true) => match response.put_ack().and_then(|ack| ack.dir_id) {
                Some(durable) => {
                    let durable = DirId::new(durable);
                    if let Some(header) = &header {
                        self.inner
                            .registry
                            .set_kind(&durable, FolderKind::of_directory(header));
                    }
                    self.inner.adopt(&mut tree, &transient, &durable)?;
                }
                None => tree.mark_unresolved(&transient),
            },
            (Some(transient), false) => tree.mark_unresolved(&transient),
            (None, true) => return Ok(()),
            (None, false) => {
                drop(tree);
                if let Some(header) = header.filter(|h| h.doc_type() == DocType::File) {
                    self.inner.forget_upload(&command.dir_id, &header)?;
                }
                return Ok(());
            }
        }
        tree.save()
    }
}

impl Finalizer for ClientFinalizer<'_> {
    fn on_sub(&mut self, command: &Command, response: &Response) {
        let mut subscriptions = self.inner.subscriptions.lock();
        subscriptions.subscribing.remove(&command.dir_id);
        if response.is_success() {
            subscriptions.subscribed.insert(command.dir_id.clone());
            info!(dir_id = %command.dir_id, "subscribed");
        }
    }

    fn on_unsub(&mut self, command: &Command, response: &Response) {
        if response.is_success() {
            self.inner
                .subscriptions
                .lock()
                .subscribed
                .remove(&command.dir_id);
            info!(dir_id = %command.dir_id, "unsubscribed");
        }
    }

    fn on_put(&mut self, command: &Command, response: &Response) {
        if let Err(e) = self.finish_put(command, response) {
            error!(seq = command.seq, path = %command.path, error = %e, "PUT completion failed");
        }
    }

    fn on_rem(&mut self, command: &Command, _response: &Response) {
        if let Err(e) = remove_if_exists(Path::new(&command.path)) {
            error!(seq = command.seq, path = %command.path, error = %e, "REM completion failed");
        }
    }

    fn on_quit(&mut self, _command: &Command, _response: &Response) {
        if let Some(connection) = self.inner.connection.lock().as_ref() {
            connection.cancel();
        }
    }
}

/// A folder identifier from the server, refused unless it names exactly
/// one directory under the mirror root.
fn checked_dir_id(dir_id: &str) -> SyncResult<DirId> {
    validate_dir_id(dir_id)?;
    Ok(DirId::new(dir_id))
}

fn staged_name(path: &Path) -> &str {
    path.file_name().and_then(|name| name.to_str()).unwrap_or_default()
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
