//! Command handling.
//!
//! Every command is answered on the session's own stream. Patches committed
//! by a command are broadcast to the folder's subscribers before the command
//! is answered, and a subscriber's catch-up patches precede the answer to its
//! SUB, so a client never sees the acknowledgement of a change it has not
//! received yet.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::policy::{Creation, CreationPolicy, MergeByName};
use mdir_codec::{DocType, Header, FIELD_DIR_ID};
use mdir_core::{CoreError, DirId, Folder, FolderKind, FolderRegistry};
use mdir_protocol::{validate_dir_id, PutAck, Request, Response, Seq, ServerMessage, Version};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Identifier of one client session.
pub type SessionId = u64;

/// A connected client.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Authenticated user name.
    pub user: String,
    sender: UnboundedSender<ServerMessage>,
}

impl Session {
    fn send(&self, message: impl Into<ServerMessage>) {
        // a closed stream means the session is ending; its reader cleans up
        let _ = self.sender.send(message.into());
    }
}

/// What the connection should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading commands.
    Continue,
    /// The client said QUIT.
    Quit,
}

struct Subscription {
    folder: Arc<Folder>,
    sessions: HashMap<SessionId, UnboundedSender<ServerMessage>>,
}

/// State shared by every session.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    registry: FolderRegistry,
    policy: Box<dyn CreationPolicy>,
    /// Folders that exist: the root, everything in storage, and everything
    /// created since.
    known: RwLock<HashSet<DirId>>,
    subscriptions: RwLock<HashMap<DirId, Subscription>>,
    /// Serializes arbitration and the append it decides on.
    creation: Mutex<()>,
    next_session: AtomicU64,
}

impl HandlerContext {
    /// Creates a handler context over `registry` with the default creation
    /// policy.
    pub fn new(config: ServerConfig, registry: FolderRegistry) -> ServerResult<Self> {
        Self::with_policy(config, registry, Box::new(MergeByName))
    }

    /// Creates a handler context with a custom creation policy.
    pub fn with_policy(
        config: ServerConfig,
        registry: FolderRegistry,
        policy: Box<dyn CreationPolicy>,
    ) -> ServerResult<Self> {
        let mut known: HashSet<DirId> = registry.known_ids()?.into_iter().collect();
        known.insert(DirId::new(config.root_dir_id.as_str()));
        Ok(Self {
            config,
            registry,
            policy,
            known: RwLock::new(known),
            subscriptions: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
            next_session: AtomicU64::new(1),
        })
    }

    /// The folder registry.
    pub fn registry(&self) -> &FolderRegistry {
        &self.registry
    }

    /// Starts a session for `user` whose messages go to `sender`.
    pub fn open_session(&self, user: impl Into<String>, sender: UnboundedSender<ServerMessage>) -> Session {
        let session = Session {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            user: user.into(),
            sender,
        };
        info!(session = session.id, user = %session.user, "session opened");
        session
    }

    /// Drops every subscription of `session`.
    pub fn end_session(&self, session: &Session) {
        let mut subscriptions = self.subscriptions.write();
        subscriptions.retain(|_, subscription| {
            subscription.sessions.remove(&session.id);
            !subscription.sessions.is_empty()
        });
        info!(session = session.id, "session closed");
    }

    /// Number of sessions subscribed to `dir_id`.
    #[must_use]
    pub fn subscriber_count(&self, dir_id: &DirId) -> usize {
        self.subscriptions
            .read()
            .get(dir_id)
            .map_or(0, |subscription| subscription.sessions.len())
    }

    fn open(&self, dir_id: &DirId) -> ServerResult<Arc<Folder>> {
        if let Some(subscription) = self.subscriptions.read().get(dir_id) {
            return Ok(Arc::clone(&subscription.folder));
        }
        if !self.known.read().contains(dir_id) {
            return Err(CoreError::DocumentNotFound {
                dir_id: dir_id.clone(),
                version: 0,
            }
            .into());
        }
        Ok(self.registry.get_or_open(dir_id)?)
    }

    /// Runs `op` against `folder` and broadcasts the patch it commits.
    ///
    /// Holding the subscription table across both keeps a concurrent SUB
    /// from slipping between the append and the broadcast.
    fn commit(
        &self,
        folder: &Folder,
        op: impl FnOnce(&Folder) -> Result<mdir_protocol::Patch, CoreError>,
    ) -> ServerResult<mdir_protocol::Patch> {
        let subscriptions = self.subscriptions.read();
        let patch = op(folder)?;
        if let Some(subscription) = subscriptions.get(folder.dir_id()) {
            let message = ServerMessage::Patch {
                dir_id: folder.dir_id().to_string(),
                patch: patch.clone(),
            };
            for sender in subscription.sessions.values() {
                let _ = sender.send(message.clone());
            }
        }
        debug!(
            dir_id = %folder.dir_id(),
            version = patch.new_version,
            action = %patch.action,
            "patch committed"
        );
        Ok(patch)
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("config", &self.config)
            .field("open_folders", &self.registry.len())
            .field("subscribed_folders", &self.subscriptions.read().len())
            .finish()
    }
}

/// Handler for client commands.
#[derive(Debug, Clone)]
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Handles one command, answering it on the session's stream.
    pub fn handle(&self, session: &Session, request: Request) -> Flow {
        let seq = request.seq();
        let kind = request.kind();
        let result = match request {
            Request::Sub {
                dir_id,
                from_version,
                ..
            } => self.handle_sub(session, seq, &dir_id, from_version),
            Request::Unsub { dir_id, .. } => self.handle_unsub(session, seq, &dir_id),
            Request::Put { dir_id, header, .. } => self.handle_put(seq, &dir_id, header),
            Request::Rem { dir_id, version, .. } => self.handle_rem(seq, &dir_id, version),
            Request::Quit { .. } => {
                session.send(Response::ok(seq));
                return Flow::Quit;
            }
        };

        let response = result.unwrap_or_else(|e| {
            if e.is_server_error() {
                warn!(session = session.id, seq, %kind, error = %e, "command failed");
            } else {
                debug!(session = session.id, seq, %kind, error = %e, "command refused");
            }
            Response::error(seq, e.status_code(), e.to_string())
        });
        session.send(response);
        Flow::Continue
    }

    /// Subscribes the session; catch-up patches are sent before returning.
    pub fn handle_sub(
        &self,
        session: &Session,
        seq: Seq,
        dir_id: &str,
        from_version: Version,
    ) -> ServerResult<Response> {
        let dir_id = parse_dir_id(dir_id)?;
        let folder = self.context.open(&dir_id)?;
        if !folder.allows(&session.user) {
            return Err(ServerError::Forbidden {
                user: session.user.clone(),
                dir_id: dir_id.to_string(),
            });
        }

        let mut subscriptions = self.context.subscriptions.write();
        let patches = folder.patches_since(from_version.max(0))?;
        subscriptions
            .entry(dir_id.clone())
            .or_insert_with(|| Subscription {
                folder: Arc::clone(&folder),
                sessions: HashMap::new(),
            })
            .sessions
            .insert(session.id, session.sender.clone());
        let count = patches.len();
        for patch in patches {
            session.send(ServerMessage::Patch {
                dir_id: dir_id.to_string(),
                patch,
            });
        }
        drop(subscriptions);

        debug!(session = session.id, %dir_id, from_version, count, "subscribed");
        Ok(Response::ok(seq))
    }

    /// Removes the session from a folder's subscribers.
    pub fn handle_unsub(&self, session: &Session, seq: Seq, dir_id: &str) -> ServerResult<Response> {
        let dir_id = parse_dir_id(dir_id)?;
        let mut subscriptions = self.context.subscriptions.write();
        if let Some(subscription) = subscriptions.get_mut(&dir_id) {
            subscription.sessions.remove(&session.id);
            if subscription.sessions.is_empty() {
                subscriptions.remove(&dir_id);
            }
        }
        Ok(Response::ok(seq))
    }

    /// Appends a document. Directory entries go through the creation policy
    /// and are answered with the folder identifier.
    pub fn handle_put(&self, seq: Seq, dir_id: &str, header: Header) -> ServerResult<Response> {
        let dir_id = parse_dir_id(dir_id)?;
        let folder = self.context.open(&dir_id)?;

        if header.doc_type() != DocType::Directory {
            let patch = self.context.commit(&folder, |folder| folder.add(header))?;
            return Ok(Response::put_ok(
                seq,
                &PutAck {
                    version: patch.new_version,
                    dir_id: None,
                },
            ));
        }

        let _creation = self.context.creation.lock();
        let ack = self.create_directory(&folder, header)?;
        Ok(Response::put_ok(seq, &ack))
    }

    fn create_directory(&self, parent: &Folder, mut header: Header) -> ServerResult<PutAck> {
        let name = header
            .name()
            .map(str::to_string)
            .ok_or_else(|| ServerError::InvalidRequest("directory entry without a name".into()))?;

        if let Creation::Existing { dir_id, version } = self.context.policy.decide(parent, &name)? {
            debug!(parent = %parent.dir_id(), %name, %dir_id, "creation merged");
            return Ok(PutAck {
                version,
                dir_id: Some(dir_id.to_string()),
            });
        }

        let child = match header.dir_id() {
            Some(id) => parse_dir_id(id)?,
            None => self.context.registry.allocate_dir_id(),
        };
        header.set(FIELD_DIR_ID, child.as_str());
        let kind = FolderKind::of_directory(&header);
        self.context.registry.set_kind(&child, kind);
        self.context.registry.get_or_open_with_kind(&child, kind)?;
        self.context.known.write().insert(child.clone());

        let patch = self.context.commit(parent, |parent| parent.add(header))?;
        info!(parent = %parent.dir_id(), %name, dir_id = %child, %kind, "folder created");
        Ok(PutAck {
            version: patch.new_version,
            dir_id: Some(child.to_string()),
        })
    }

    /// Removes the live document committed at `version`.
    pub fn handle_rem(&self, seq: Seq, dir_id: &str, version: Version) -> ServerResult<Response> {
        let dir_id = parse_dir_id(dir_id)?;
        let folder = self.context.open(&dir_id)?;
        self.context.commit(&folder, |folder| folder.remove(version))?;
        Ok(Response::ok(seq))
    }
}

/// Accepts identifiers that are durable and safe as a storage directory
/// name.
fn parse_dir_id(dir_id: &str) -> ServerResult<DirId> {
    let id = DirId::new(dir_id);
    if id.is_transient() {
        return Err(CoreError::TransientIdLeak(id).into());
    }
    validate_dir_id(dir_id)
        .map_err(|_| ServerError::InvalidRequest(format!("bad folder identifier {dir_id:?}")))?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RejectDuplicates;
    use mdir_protocol::{Action, STATUS_BAD_REQUEST, STATUS_CONFLICT, STATUS_FORBIDDEN, STATUS_NOT_FOUND};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn handler_with(policy: Box<dyn CreationPolicy>) -> RequestHandler {
        let context =
            HandlerContext::with_policy(ServerConfig::default(), FolderRegistry::in_memory(), policy)
                .unwrap();
        RequestHandler::new(Arc::new(context))
    }

    fn handler() -> RequestHandler {
        handler_with(Box::new(MergeByName))
    }

    fn session(handler: &RequestHandler, user: &str) -> (Session, UnboundedReceiver<ServerMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (handler.context().open_session(user, sender), receiver)
    }

    fn drain(receiver: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn put(seq: Seq, dir_id: &str, header: Header) -> Request {
        Request::Put {
            seq,
            dir_id: dir_id.into(),
            header,
        }
    }

    fn sub(seq: Seq, dir_id: &str, from_version: Version) -> Request {
        Request::Sub {
            seq,
            dir_id: dir_id.into(),
            from_version,
        }
    }

    #[test]
    fn patch_precedes_put_answer() {
        let handler = handler();
        let (alice, mut stream) = session(&handler, "alice");
        handler.handle(&alice, sub(1, "root", 0));
        handler.handle(&alice, put(2, "root", Header::file("a.txt", "ab", "ab")));

        let messages = drain(&mut stream);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Response::ok(1).into());
        assert!(matches!(
            &messages[1],
            ServerMessage::Patch { dir_id, patch } if dir_id == "root" && patch.new_version == 1
        ));
        assert_eq!(messages[2], Response::ok_with(2, "1").into());
    }

    #[test]
    fn catch_up_precedes_sub_answer() {
        let handler = handler();
        let (alice, mut alice_stream) = session(&handler, "alice");
        for seq in 1..=3 {
            handler.handle(&alice, put(seq, "root", Header::new().with("subject", "hi")));
        }
        handler.handle(&alice, Request::Rem { seq: 4, dir_id: "root".into(), version: 2 });
        drain(&mut alice_stream);

        let (bob, mut bob_stream) = session(&handler, "bob");
        handler.handle(&bob, sub(1, "root", 1));
        let messages = drain(&mut bob_stream);
        let versions: Vec<_> = messages
            .iter()
            .filter_map(|message| match message {
                ServerMessage::Patch { patch, .. } => Some((patch.new_version, patch.action)),
                ServerMessage::Response(_) => None,
            })
            .collect();
        assert_eq!(versions, vec![(2, Action::Add), (3, Action::Add), (4, Action::Remove)]);
        assert_eq!(messages.last(), Some(&Response::ok(1).into()));
    }

    #[test]
    fn directory_put_allocates_identifier() {
        let handler = handler();
        let (alice, mut stream) = session(&handler, "alice");
        handler.handle(&alice, put(1, "root", Header::directory("docs")));
        let Some(ServerMessage::Response(response)) = drain(&mut stream).pop() else {
            panic!("no response");
        };
        let ack = response.put_ack().unwrap();
        let child = ack.dir_id.unwrap();
        assert_eq!(ack.version, 1);

        // the new folder exists and can be subscribed
        handler.handle(&alice, sub(2, &child, 0));
        assert_eq!(drain(&mut stream), vec![Response::ok(2).into()]);
        assert_eq!(handler.context().subscriber_count(&DirId::new(child)), 1);
    }

    #[test]
    fn merge_returns_existing_folder() {
        let handler = handler();
        let (alice, mut stream) = session(&handler, "alice");
        handler.handle(&alice, put(1, "root", Header::directory("shared")));
        handler.handle(&alice, put(2, "root", Header::directory("shared")));
        let acks: Vec<_> = drain(&mut stream)
            .into_iter()
            .filter_map(|message| match message {
                ServerMessage::Response(response) => response.put_ack(),
                ServerMessage::Patch { .. } => None,
            })
            .collect();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0], acks[1]);

        let root = handler.context().registry().get_or_open(&DirId::new("root")).unwrap();
        assert_eq!(root.version(), 1);
    }

    #[test]
    fn duplicates_can_be_rejected() {
        let handler = handler_with(Box::new(RejectDuplicates));
        let (alice, mut stream) = session(&handler, "alice");
        handler.handle(&alice, put(1, "root", Header::directory("shared")));
        handler.handle(&alice, put(2, "root", Header::directory("shared")));
        let last = drain(&mut stream).pop();
        assert!(matches!(last, Some(ServerMessage::Response(r)) if r.status == STATUS_CONFLICT));
    }

    #[test]
    fn permissions_gate_subscription() {
        let handler = handler();
        let (alice, mut alice_stream) = session(&handler, "alice");
        handler.handle(&alice, put(1, "root", Header::permission(["alice"])));
        handler.handle(&alice, sub(2, "root", 0));
        assert_eq!(drain(&mut alice_stream).last(), Some(&Response::ok(2).into()));

        let (mallory, mut mallory_stream) = session(&handler, "mallory");
        handler.handle(&mallory, sub(1, "root", 0));
        let messages = drain(&mut mallory_stream);
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], ServerMessage::Response(r) if r.status == STATUS_FORBIDDEN));
    }

    #[test]
    fn refusals() {
        let handler = handler();
        let (alice, mut stream) = session(&handler, "alice");
        handler.handle(&alice, sub(1, "42", 0));
        handler.handle(&alice, Request::Rem { seq: 2, dir_id: "root".into(), version: 7 });
        handler.handle(&alice, sub(3, "_abc", 0));
        handler.handle(&alice, sub(4, "../etc", 0));
        let statuses: Vec<_> = drain(&mut stream)
            .into_iter()
            .filter_map(|message| match message {
                ServerMessage::Response(response) => Some(response.status),
                ServerMessage::Patch { .. } => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![STATUS_NOT_FOUND, STATUS_NOT_FOUND, STATUS_BAD_REQUEST, STATUS_BAD_REQUEST]
        );
    }

    #[test]
    fn unsubscribe_and_quit() {
        let handler = handler();
        let (alice, mut stream) = session(&handler, "alice");
        let root = DirId::new("root");
        handler.handle(&alice, sub(1, "root", 0));
        assert_eq!(handler.context().subscriber_count(&root), 1);
        handler.handle(&alice, Request::Unsub { seq: 2, dir_id: "root".into() });
        assert_eq!(handler.context().subscriber_count(&root), 0);

        handler.handle(&alice, put(3, "root", Header::new().with("subject", "quiet")));
        assert_eq!(handler.handle(&alice, Request::Quit { seq: 4 }), Flow::Quit);
        let messages = drain(&mut stream);
        assert!(messages.iter().all(|m| matches!(m, ServerMessage::Response(_))));
        assert_eq!(messages.last(), Some(&Response::ok(4).into()));
    }

    #[test]
    fn ending_a_session_drops_its_subscriptions() {
        let handler = handler();
        let (alice, _alice_stream) = session(&handler, "alice");
        let (bob, _bob_stream) = session(&handler, "bob");
        let root = DirId::new("root");
        handler.handle(&alice, sub(1, "root", 0));
        handler.handle(&bob, sub(1, "root", 0));
        handler.context().end_session(&alice);
        assert_eq!(handler.context().subscriber_count(&root), 1);
        handler.context().end_session(&bob);
        assert_eq!(handler.context().subscriber_count(&root), 0);
    }
}
