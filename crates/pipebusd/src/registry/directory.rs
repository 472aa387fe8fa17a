use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pipebus_core::{make_pipe, ChannelPaths, ChannelReader, ClientId, ReadMode};
use pipebus_protocol::{RegistrationMessage, RegistrationOp, RequestHandler};

use super::{RegistryError, Shutdown, MAX_SESSIONS};
use crate::session::{ClientSession, ClientState, SessionSettings, SessionView};

#[derive(Default)]
struct SessionMap {
    live: HashMap<ClientId, Arc<ClientSession>>,
    /// Ids whose session is being built outside the lock.
    pending: HashSet<ClientId>,
}

// ============================================================================
// Registration Directory
// ============================================================================

/// Listens on the registration pipe and owns one session per registered id.
///
/// All session-map mutations happen under a single mutex. It is held for
/// map updates only: pipes are created, session threads spawned and joined
/// with it released.
pub struct RegistrationDirectory {
    inner: Arc<DirectoryInner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

struct DirectoryInner {
    paths: ChannelPaths,
    settings: SessionSettings,
    handler: Arc<dyn RequestHandler>,
    max_sessions: usize,
    sessions: Mutex<SessionMap>,
    reader: ChannelReader,
    /// Stops the registration loop only.
    cancel: CancellationToken,
    /// Parent of every session token.
    sessions_root: CancellationToken,
}

impl RegistrationDirectory {
    /// Creates the registration pipe (replacing any stale one) and opens it.
    pub fn new(
        paths: ChannelPaths,
        settings: SessionSettings,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, RegistryError> {
        make_pipe(paths.registration())?;
        let reader = ChannelReader::open(paths.registration(), settings.channel)?;

        info!(path = %paths.registration().display(), "Registration pipe ready");

        Ok(Self {
            inner: Arc::new(DirectoryInner {
                paths,
                settings,
                handler,
                max_sessions: MAX_SESSIONS,
                sessions: Mutex::new(SessionMap::default()),
                reader,
                cancel: CancellationToken::new(),
                sessions_root: CancellationToken::new(),
            }),
            loop_handle: Mutex::new(None),
        })
    }

    /// Overrides the session cap. Only takes effect before `start()`.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.max_sessions = max;
        }
        self
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.inner.paths
    }

    /// Spawns the registration loop. Calling it twice is a no-op.
    pub fn start(&self) -> Result<(), RegistryError> {
        let mut slot = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("registration".to_string())
            .spawn(move || inner.run())
            .map_err(|source| RegistryError::Spawn {
                what: "registration".to_string(),
                source,
            })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stops the registration loop, then applies `shutdown` to live sessions.
    pub fn stop(&self, shutdown: Shutdown) {
        self.inner.cancel.cancel();

        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Registration loop panicked");
            }
        }

        match shutdown {
            Shutdown::StopSessions => self.inner.stop_all(),
            Shutdown::LeaveSessions => {
                debug!(live = self.len(), "Leaving sessions running");
            }
        }
    }

    /// Registers `id` directly, bypassing the pipe.
    pub fn register(&self, id: ClientId) -> Result<(), RegistryError> {
        self.inner.register(id)
    }

    /// Unregisters `id` directly. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ClientId) -> bool {
        self.inner.unregister(id)
    }

    /// Applies one registration line as if it had been read from the pipe.
    pub fn handle_message(&self, line: &str) {
        self.inner.handle_message(line);
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.inner.sessions().live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_of(&self, id: ClientId) -> Option<ClientState> {
        self.inner.sessions().live.get(&id).map(|s| s.state())
    }

    /// Snapshot of all sessions, ordered by id.
    pub fn sessions(&self) -> Vec<SessionView> {
        let mut views: Vec<SessionView> =
            self.inner.sessions().live.values().map(|s| s.view()).collect();
        views.sort_by_key(|v| v.id);
        views
    }
}

impl DirectoryInner {
    fn sessions(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        info!("Registration loop started");

        while !self.cancel.is_cancelled() {
            match self.reader.read(ReadMode::NonBlocking) {
                Ok(lines) => {
                    for line in lines {
                        self.handle_message(&line);
                    }
                }
                Err(e) => {
                    // The pipe is ours; a read error here is not recoverable.
                    error!(error = %e, "Registration read failed");
                    break;
                }
            }
            thread::sleep(self.settings.channel.poll_interval);
        }

        info!("Registration loop stopped");
    }

    fn handle_message(&self, line: &str) {
        let message = match RegistrationMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(line, error = %e, "Ignoring malformed registration message");
                return;
            }
        };

        match message.op {
            RegistrationOp::Register => {
                if let Err(e) = self.register(message.id) {
                    warn!(client_id = %message.id, error = %e, "Registration rejected");
                }
            }
            RegistrationOp::Unregister => {
                self.unregister(message.id);
            }
        }
    }

    fn register(&self, id: ClientId) -> Result<(), RegistryError> {
        self.reserve(id)?;
        let built = self.build_session(id);

        let mut sessions = self.sessions();
        sessions.pending.remove(&id);
        let session = built?;

        // stop_all cancels the root before it snapshots the map, so a
        // session inserted after that would never be stopped.
        if self.sessions_root.is_cancelled() {
            drop(sessions);
            session.shutdown();
            return Err(RegistryError::ShuttingDown(id));
        }

        sessions.live.insert(id, Arc::new(session));
        info!(client_id = %id, total = sessions.live.len(), "Client registered");
        Ok(())
    }

    /// Claims a slot for `id`, counting sessions still under construction.
    fn reserve(&self, id: ClientId) -> Result<(), RegistryError> {
        let mut sessions = self.sessions();

        if sessions.live.contains_key(&id) || sessions.pending.contains(&id) {
            debug!(client_id = %id, "Client already registered, rejecting");
            return Err(RegistryError::AlreadyRegistered(id));
        }
        let current = sessions.live.len() + sessions.pending.len();
        if current >= self.max_sessions {
            warn!(
                client_id = %id,
                current,
                max = self.max_sessions,
                "Registry is full, rejecting registration"
            );
            return Err(RegistryError::RegistryFull {
                max: self.max_sessions,
            });
        }

        sessions.pending.insert(id);
        Ok(())
    }

    fn build_session(&self, id: ClientId) -> Result<ClientSession, RegistryError> {
        let session = ClientSession::new(
            id,
            &self.paths,
            self.settings,
            Arc::clone(&self.handler),
            self.sessions_root.child_token(),
        )?;
        if let Err(source) = session.start() {
            session.join();
            return Err(RegistryError::Spawn {
                what: format!("session-{id}"),
                source,
            });
        }
        Ok(session)
    }

    fn unregister(&self, id: ClientId) -> bool {
        let session = {
            let sessions = self.sessions();
            match sessions.live.get(&id) {
                None => {
                    debug!(client_id = %id, "Unregister for unknown client ignored");
                    return false;
                }
                Some(session) if session.state() == ClientState::Unregistering => {
                    debug!(client_id = %id, "Client already unregistering");
                    return false;
                }
                Some(session) => {
                    session.begin_unregister();
                    Arc::clone(session)
                }
            }
        };

        // Joined outside the lock so other registrations are not held up.
        session.shutdown();

        let mut sessions = self.sessions();
        if sessions
            .live
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            sessions.live.remove(&id);
        }
        info!(client_id = %id, total = sessions.live.len(), "Client unregistered");
        true
    }

    fn stop_all(&self) {
        self.sessions_root.cancel();

        let live: Vec<Arc<ClientSession>> = self.sessions().live.values().cloned().collect();
        for session in &live {
            session.begin_unregister();
            session.join();
        }

        // Entries go only once their session has stopped.
        let mut sessions = self.sessions();
        for session in &live {
            if sessions
                .live
                .get(&session.id())
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.live.remove(&session.id());
            }
        }

        if !live.is_empty() {
            info!(count = live.len(), "Stopped all sessions");
        }
    }
}

/// Sessions cannot outlive their directory: dropping it stops them all,
/// even after an earlier `stop(Shutdown::LeaveSessions)`.
impl Drop for RegistrationDirectory {
    fn drop(&mut self) {
        self.stop(Shutdown::StopSessions);
    }
}
