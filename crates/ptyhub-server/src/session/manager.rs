//! Session registry and lifecycle orchestration.
//!
//! Tracks all live sessions, enforces per-user quotas, starts one reader
//! task per session, and reaps idle sessions on a fixed interval. Whoever
//! removes an entry from the registry is the one that tears it down, so an
//! explicit close racing the sweep closes the session exactly once.

use super::pty::SpawnOptions;
use super::pty_session::PtySession;
use super::quota::{QuotaLedger, QuotaPermit};
use super::reader::{self, ByteSource, ReaderExit, ReaderTask};
use super::stream::OutputStream;
use ptyhub_core::{OutputDelta, PtyError, PtyResult, SessionStatus, SessionSummary};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Tunables for a [`PtyManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Sessions without client activity for longer than this are reaped.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_sessions_per_user: usize,
    /// Cap across all users.
    pub max_sessions: usize,
    /// Output chunks retained per session.
    pub buffer_chunks: usize,
    /// Largest single read from a pty.
    pub read_chunk_size: usize,
    /// How long a hung-up shell gets before it is killed.
    pub close_grace: Duration,
    pub default_shell: String,
    /// Falls back to the process working directory when unset.
    pub default_cwd: Option<PathBuf>,
    pub skip_shell_rc: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            max_sessions_per_user: 20,
            max_sessions: 200,
            buffer_chunks: 10_000,
            read_chunk_size: 4096,
            close_grace: Duration::from_secs(1),
            default_shell: "bash".to_string(),
            default_cwd: None,
            skip_shell_rc: true,
        }
    }
}

struct Entry {
    session: Arc<PtySession>,
    reader: AbortHandle,
    /// Held for the entry's lifetime; dropping it frees the quota slot.
    _permit: QuotaPermit,
}

struct Registry {
    config: ManagerConfig,
    sessions: RwLock<HashMap<String, Entry>>,
    quota: QuotaLedger,
}

/// Owns every live session. Construct once at startup, share via `Arc`,
/// and call [`PtyManager::shutdown`] on the way out.
pub struct PtyManager {
    registry: Arc<Registry>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PtyManager {
    pub fn new(config: ManagerConfig) -> Self {
        let quota = QuotaLedger::new(config.max_sessions_per_user, config.max_sessions);
        Self {
            registry: Arc::new(Registry {
                config,
                sessions: RwLock::new(HashMap::new()),
                quota,
            }),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    /// Start the idle sweep. Calling it again is a no-op.
    pub fn start(&self) {
        let mut sweeper = self.lock_sweeper();
        if sweeper.is_some() {
            return;
        }

        let registry = Arc::downgrade(&self.registry);
        let period = self.registry.config.sweep_interval;
        info!(
            interval_ms = period.as_millis() as u64,
            idle_timeout_secs = self.registry.config.idle_timeout.as_secs(),
            "starting idle sweep"
        );
        *sweeper = Some(tokio::spawn(sweep_loop(registry, period)));
    }

    /// Stop the sweep and close every session.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.lock_sweeper().take() {
            handle.abort();
        }

        let drained: Vec<(String, Entry)> = self.registry.sessions.write().await.drain().collect();
        info!(count = drained.len(), "closing all sessions");
        teardown_all(drained).await;
    }

    /// Spawn a shell for `user` and start reading its output.
    ///
    /// `cwd` and `shell` fall back to the configured defaults. Fails with
    /// `ResourceExhausted` when the user is at quota and with
    /// `CreationFailed` when the shell cannot be started; either way nothing
    /// is registered.
    pub async fn create_session(
        &self,
        user: &str,
        rows: u16,
        cols: u16,
        cwd: Option<&Path>,
        shell: Option<&str>,
    ) -> PtyResult<String> {
        self.registry.create(user, rows, cols, cwd, shell).await
    }

    /// Look up a live session.
    pub async fn get_session(&self, session_id: &str) -> PtyResult<Arc<PtySession>> {
        self.registry.get(session_id).await
    }

    /// Forward keystrokes to a session.
    pub async fn input(&self, session_id: &str, data: &[u8]) -> PtyResult<()> {
        let session = self.registry.get(session_id).await?;
        session.write_input(data)?;
        session.touch();
        Ok(())
    }

    /// Output produced after `seq`.
    pub async fn output(&self, session_id: &str, seq: u64) -> PtyResult<OutputDelta> {
        let session = self.registry.get(session_id).await?;
        let delta = session.output_since(seq);
        session.touch();
        Ok(delta)
    }

    /// Resize a session's terminal. Accepted silently once the shell exited.
    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> PtyResult<()> {
        let session = self.registry.get(session_id).await?;
        session.resize(rows, cols)?;
        session.touch();
        Ok(())
    }

    /// Close a session. Returns whether this call closed it; closing an
    /// unknown or already-closed session is not an error.
    pub async fn close_session(&self, session_id: &str) -> bool {
        self.registry.close(session_id).await
    }

    /// Detailed status. Does not count as activity.
    pub async fn status(&self, session_id: &str) -> PtyResult<SessionStatus> {
        Ok(self.registry.get(session_id).await?.status())
    }

    /// Snapshot of `user`'s sessions, oldest first. Does not count as activity.
    pub async fn list_sessions(&self, user: &str) -> Vec<SessionSummary> {
        let sessions = self.registry.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions
            .values()
            .filter(|e| e.session.user() == user)
            .map(|e| e.session.summary())
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    /// Follow a session's output from `from_seq`.
    pub async fn subscribe(&self, session_id: &str, from_seq: u64) -> PtyResult<OutputStream> {
        let session = self.registry.get(session_id).await?;
        session.touch();
        Ok(OutputStream::new(session, from_seq))
    }

    /// Run one idle sweep now. Returns the IDs that were reaped.
    pub async fn sweep(&self) -> Vec<String> {
        self.registry.sweep().await
    }

    pub async fn count(&self) -> usize {
        self.registry.sessions.read().await.len()
    }

    pub async fn count_for_user(&self, user: &str) -> usize {
        self.registry
            .sessions
            .read()
            .await
            .values()
            .filter(|e| e.session.user() == user)
            .count()
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PtyManager {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_sweeper().take() {
            handle.abort();
        }
    }
}

impl Registry {
    async fn create(
        self: &Arc<Self>,
        user: &str,
        rows: u16,
        cols: u16,
        cwd: Option<&Path>,
        shell: Option<&str>,
    ) -> PtyResult<String> {
        let permit = self.quota.try_acquire(user).map_err(|e| {
            warn!(user, error = %e, "session quota exceeded");
            e
        })?;

        let opts = SpawnOptions {
            rows,
            cols,
            cwd: self.resolve_cwd(cwd)?,
            shell: shell.unwrap_or(self.config.default_shell.as_str()).to_string(),
            skip_shell_rc: self.config.skip_shell_rc,
        };
        let session_id = self.fresh_id().await;

        let (session, pty_reader) = PtySession::spawn(
            session_id.clone(),
            user.to_string(),
            &opts,
            self.config.buffer_chunks,
            self.config.close_grace,
        )
        .map_err(|e| {
            warn!(user, shell = %opts.shell, error = %e, "session creation failed");
            e
        })?;
        let source =
            reader::spawn_blocking_source(&session_id, pty_reader, self.config.read_chunk_size)
                .map_err(|e| PtyError::CreationFailed(format!("failed to start PTY reader: {e}")))?;

        self.register(session, permit, source).await;
        info!(session_id = %session_id, user, shell = %opts.shell, "session created");
        Ok(session_id)
    }

    /// Insert a spawned session and start its reader task.
    async fn register(self: &Arc<Self>, session: Arc<PtySession>, permit: QuotaPermit, source: ByteSource) {
        let session_id = session.id().to_string();
        // Held across spawn so a failing reader cannot try to close the
        // session before it is registered.
        let mut sessions = self.sessions.write().await;

        let reader = tokio::spawn(ReaderTask::new(session.clone(), source).run());
        let abort = reader.abort_handle();
        session.mark_running();
        tokio::spawn(supervise(Arc::downgrade(self), session_id.clone(), reader));

        sessions.insert(
            session_id,
            Entry {
                session,
                reader: abort,
                _permit: permit,
            },
        );
    }

    async fn get(&self, session_id: &str) -> PtyResult<Arc<PtySession>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.session.clone())
            .ok_or_else(|| PtyError::NotFound(session_id.to_string()))
    }

    async fn close(&self, session_id: &str) -> bool {
        let entry = self.sessions.write().await.remove(session_id);
        match entry {
            Some(entry) => {
                teardown(entry).await;
                true
            }
            None => {
                debug!(session_id, "close on unknown session ignored");
                false
            }
        }
    }

    async fn sweep(&self) -> Vec<String> {
        let timeout = self.config.idle_timeout;
        let candidates: Vec<String> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.session.idle_for() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        // Re-check under the write lock: a client may have polled since the scan.
        let mut doomed = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            for id in candidates {
                let still_idle = sessions
                    .get(&id)
                    .is_some_and(|e| e.session.idle_for() > timeout);
                if still_idle {
                    if let Some(entry) = sessions.remove(&id) {
                        warn!(
                            session_id = %id,
                            idle_secs = entry.session.idle_for().as_secs(),
                            "session expired (idle)"
                        );
                        doomed.push((id, entry));
                    }
                }
            }
        }

        let reaped: Vec<String> = doomed.iter().map(|(id, _)| id.clone()).collect();
        teardown_all(doomed).await;
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "sweep removed sessions");
        }
        reaped
    }

    fn resolve_cwd(&self, cwd: Option<&Path>) -> PtyResult<PathBuf> {
        if let Some(dir) = cwd.or(self.config.default_cwd.as_deref()) {
            return Ok(dir.to_path_buf());
        }
        std::env::current_dir()
            .map_err(|e| PtyError::CreationFailed(format!("no working directory: {e}")))
    }

    async fn fresh_id(&self) -> String {
        let sessions = self.sessions.read().await;
        loop {
            let id = generate_session_id();
            if !sessions.contains_key(&id) {
                return id;
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        // Aborted readers drop their session handles, which kills the shells.
        for entry in self.sessions.get_mut().values() {
            entry.reader.abort();
        }
    }
}

async fn sweep_loop(registry: Weak<Registry>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        let reaped = registry.sweep().await;
        if !reaped.is_empty() {
            info!(count = reaped.len(), "idle sessions reaped");
        }
    }
    debug!("idle sweep stopped");
}

/// Watch a reader task and close its session if it fails or panics.
async fn supervise(registry: Weak<Registry>, session_id: String, reader: JoinHandle<ReaderExit>) {
    let reason = match reader.await {
        Ok(ReaderExit::Exited(code)) => {
            debug!(session_id = %session_id, exit_code = ?code, "reader finished");
            return;
        }
        Ok(ReaderExit::Stopped) => return,
        Ok(ReaderExit::Failed(e)) => e.to_string(),
        Err(e) if e.is_cancelled() => return,
        Err(e) => format!("reader task panicked: {e}"),
    };

    error!(session_id = %session_id, reason = %reason, "reader failed, closing session");
    if let Some(registry) = registry.upgrade() {
        registry.close(&session_id).await;
    }
}

async fn teardown(entry: Entry) {
    entry.reader.abort();
    entry.session.close().await;
}

/// Close several sessions concurrently; a panicking close is logged, not propagated.
async fn teardown_all(entries: Vec<(String, Entry)>) {
    let mut set = JoinSet::new();
    for (_, entry) in entries {
        set.spawn(teardown(entry));
    }
    while let Some(result) = set.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "session teardown panicked");
        }
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
