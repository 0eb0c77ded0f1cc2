use super::connector::{Connector, CursorConnection, PgConnector};
use super::context::QueryContext;
use super::cursor::{CursorState, Direction};
use super::reaper::ReaperHandle;
use crate::config::PoolConfig;
use crate::error::{CancelReason, DriverError, Phase};
use crate::query::{statement_body, OneShotExecutor, Row};
use crate::template::{render, Params};
use crate::{PgReportError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on how long tearing down one session may take
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type SessionSlot<T> = Arc<tokio::sync::Mutex<Option<CursorState<T>>>>;
type SlotGuard<T> = tokio::sync::OwnedMutexGuard<Option<CursorState<T>>>;

/// Registry entry: the session's clock plus its own lock around the cursor.
///
/// `last_used` is readable without the session lock so the reaper can judge
/// idleness without waiting behind an in-flight fetch. The slot is emptied on
/// teardown, so a fetch that looked the entry up just before removal finds
/// nothing instead of a closed connection.
struct SessionEntry<T: CursorConnection> {
    id: String,
    created_at: Instant,
    last_used: Mutex<Instant>,
    cursor: SessionSlot<T>,
}

impl<T: CursorConnection> SessionEntry<T> {
    fn new(id: &str, state: CursorState<T>) -> Self {
        let now = Instant::now();
        SessionEntry {
            id: id.to_string(),
            created_at: now,
            last_used: Mutex::new(now),
            cursor: Arc::new(tokio::sync::Mutex::new(Some(state))),
        }
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn expired(&self, now: Instant, idle_timeout: Duration, max_age: Option<Duration>) -> bool {
        let idle = now.saturating_duration_since(*self.last_used.lock()) > idle_timeout;
        let too_old = max_age.is_some_and(|max| now.saturating_duration_since(self.created_at) > max);
        idle || too_old
    }
}

/// Pool of per-session server-side cursors.
///
/// The registry lock only guards the map's shape and is never held across a
/// database call. Each session has its own lock that serializes fetches on
/// that session while other sessions page concurrently.
pub struct CursorPool<C: Connector = PgConnector> {
    connector: C,
    config: PoolConfig,
    sessions: Mutex<HashMap<String, Arc<SessionEntry<C::Connection>>>>,
    permits: Arc<Semaphore>,
    reaper: Mutex<Option<ReaperHandle>>,
}

impl CursorPool<PgConnector> {
    /// Pool over a PostgreSQL server
    pub fn connect(pg_config: tokio_postgres::Config, config: PoolConfig) -> Result<Self> {
        Self::new(PgConnector::new(pg_config), config)
    }
}

impl<C: Connector> CursorPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Cursor pool ready (max connections: {}, idle timeout: {:?}, page size: {})",
            config.max_connections, config.idle_timeout, config.page_size
        );
        Ok(CursorPool {
            connector,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            config,
            sessions: Mutex::new(HashMap::new()),
            reaper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn default_page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn available_page_sizes(&self) -> &[usize] {
        &self.config.available_page_sizes
    }

    pub fn next_page_size(&self, current: usize) -> usize {
        self.config.next_page_size(current)
    }

    /// Session id for callers that did not bring one
    pub fn new_session_id() -> String {
        format!("sess-{}", Uuid::new_v4().simple())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// Connections currently free under the connection cap
    pub fn available_connections(&self) -> usize {
        self.permits.available_permits()
    }

    /// Check the database answers within `timeout`
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let ctx = QueryContext::with_timeout(timeout);
        let result = async {
            let _permit = self.acquire_permit(&ctx).await?;
            let mut conn = ctx
                .run(Phase::Connect, async {
                    self.connector.connect().await.map_err(PgReportError::Connectivity)
                })
                .await?;
            ctx.run(Phase::Ping, async {
                conn.execute("SELECT 1").await.map_err(PgReportError::Connectivity)
            })
            .await
        }
        .await;

        match result {
            Err(PgReportError::Cancelled { phase, reason: CancelReason::DeadlineExceeded }) => {
                Err(PgReportError::Connectivity(DriverError::with_code(
                    "08006",
                    format!("no response within {timeout:?} during {phase}"),
                )))
            }
            other => other,
        }
    }

    /// Render `template`, open a cursor for it under `session_id` and return
    /// the first page. An existing session with the same id is torn down
    /// before the new cursor is declared.
    ///
    /// A fetch that fails on the server closes the session, including the
    /// first one made here.
    pub async fn execute_query(
        &self,
        ctx: &QueryContext,
        session_id: &str,
        template: &str,
        page_size: usize,
        params: &Params,
    ) -> Result<Vec<Row>> {
        let sql = render(template, params);
        let query = statement_body(&sql);
        if query.is_empty() {
            return Err(PgReportError::CursorDeclare {
                session_id: session_id.to_string(),
                source: DriverError::with_code("42601", "template rendered to an empty query"),
            });
        }
        let page_size = if page_size == 0 { self.config.page_size } else { page_size };

        let previous = self.sessions.lock().get(session_id).cloned();
        if let Some(previous) = previous {
            info!("Replacing cursor for session {}", session_id);
            self.replace(ctx, &previous).await?;
        }

        let permit = self.acquire_permit(ctx).await?;
        let conn = ctx
            .run(Phase::Connect, async {
                self.connector.connect().await.map_err(PgReportError::Connectivity)
            })
            .await?;
        let state = CursorState::open(ctx, session_id, conn, permit, query, page_size).await?;

        let entry = Arc::new(SessionEntry::new(session_id, state));
        let displaced = self
            .sessions
            .lock()
            .insert(session_id.to_string(), entry.clone());
        if let Some(displaced) = displaced {
            // A concurrent execute_query for the same id installed first
            debug!("Session {} was reopened concurrently, closing the older cursor", session_id);
            Self::teardown(displaced).await;
        }
        info!(
            "Opened cursor for session {} (page size {}, active sessions: {})",
            session_id,
            page_size,
            self.session_count()
        );

        self.fetch_entry(ctx, &entry, Direction::Next).await
    }

    /// Move the session's cursor and fetch one page
    pub async fn fetch_page(
        &self,
        ctx: &QueryContext,
        session_id: &str,
        direction: Direction,
    ) -> Result<Vec<Row>> {
        let entry = self.sessions.lock().get(session_id).cloned();
        let entry = entry.ok_or_else(|| PgReportError::SessionNotFound(session_id.to_string()))?;
        self.fetch_entry(ctx, &entry, direction).await
    }

    async fn fetch_entry(
        &self,
        ctx: &QueryContext,
        entry: &SessionEntry<C::Connection>,
        direction: Direction,
    ) -> Result<Vec<Row>> {
        let mut slot = ctx
            .run(Phase::Fetch, async { Ok::<_, PgReportError>(entry.cursor.lock().await) })
            .await?;
        let state = slot
            .as_mut()
            .ok_or_else(|| PgReportError::SessionNotFound(entry.id.clone()))?;

        entry.touch();
        match state.fetch(ctx, direction).await {
            Ok(rows) => {
                debug!(
                    "Fetched {} rows ({}) from {} for session {}",
                    rows.len(),
                    direction,
                    state.cursor_name(),
                    entry.id
                );
                Ok(rows)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                // The server aborted the cursor's transaction; nothing but
                // ROLLBACK would succeed on it again
                warn!("Fetch failed for session {}, closing it: {}", entry.id, e);
                let failed = slot.take();
                drop(slot);
                self.unregister(entry);
                if let Some(state) = failed {
                    Self::close_state(&entry.id, state).await;
                }
                Err(e)
            }
        }
    }

    /// Close the session being replaced by a new execute_query. Waiting for
    /// its in-flight fetch counts against the caller's deadline; when that
    /// runs out the old session stays registered and untouched.
    async fn replace(
        &self,
        ctx: &QueryContext,
        previous: &Arc<SessionEntry<C::Connection>>,
    ) -> Result<()> {
        let mut slot = ctx
            .run(Phase::Acquire, async {
                Ok::<_, PgReportError>(previous.cursor.clone().lock_owned().await)
            })
            .await?;
        self.unregister(previous);
        let state = slot.take();
        drop(slot);
        if let Some(state) = state {
            // Past the caller's deadline the state is dropped, closing the
            // connection without a rollback
            let _ = ctx
                .run(Phase::Acquire, async {
                    Self::close_state(&previous.id, state).await;
                    Ok::<_, PgReportError>(())
                })
                .await;
        }
        Ok(())
    }

    /// Remove `entry` from the registry unless the id was already reused
    fn unregister(&self, entry: &SessionEntry<C::Connection>) {
        let mut sessions = self.sessions.lock();
        if sessions.get(&entry.id).is_some_and(|e| std::ptr::eq(e.as_ref(), entry)) {
            sessions.remove(&entry.id);
        }
    }

    /// Run a bounded query outside any session
    pub async fn query(&self, ctx: &QueryContext, text: &str, limit: usize) -> Result<Vec<Row>> {
        let limit = if limit == 0 { self.config.page_size } else { limit };
        let _permit = self.acquire_permit(ctx).await?;
        OneShotExecutor::query(&self.connector, ctx, text, limit).await
    }

    /// Render `template` and run it as a bounded query outside any session
    pub async fn query_template(
        &self,
        ctx: &QueryContext,
        template: &str,
        params: &Params,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let sql = render(template, params);
        self.query(ctx, &sql, limit).await
    }

    /// Tear down one session. Returns false when the id was not registered.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let entry = self.sessions.lock().remove(session_id);
        match entry {
            Some(entry) => {
                Self::teardown(entry).await;
                info!("Closed session {}", session_id);
                true
            }
            None => false,
        }
    }

    /// Evict sessions idle past the idle timeout, or older than the absolute
    /// lifetime when one is configured. Sessions with a fetch in flight are
    /// left for the next sweep. Returns how many sessions were evicted.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|id, entry| {
                if !entry.expired(now, self.config.idle_timeout, self.config.absolute_timeout) {
                    return true;
                }
                match entry.cursor.clone().try_lock_owned() {
                    Ok(slot) => {
                        evicted.push((id.clone(), slot));
                        false
                    }
                    Err(_) => {
                        debug!("Session {} is busy, deferring eviction", id);
                        true
                    }
                }
            });
        }

        let count = evicted.len();
        futures::future::join_all(evicted.into_iter().map(|(id, mut slot)| async move {
            info!("Closing idle cursor: {}", id);
            if let Some(state) = slot.take() {
                Self::close_state(&id, state).await;
            }
        }))
        .await;
        count
    }

    /// Start the background reaper; a no-op when it is already running
    pub fn start_reaper(self: &Arc<Self>) {
        let mut reaper = self.reaper.lock();
        if reaper.as_ref().is_some_and(|r| !r.is_finished()) {
            return;
        }
        *reaper = Some(ReaperHandle::spawn(self, self.config.reap_interval));
    }

    /// Stop the reaper, refuse new connections and tear down every session
    pub async fn shutdown(&self) {
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }
        self.permits.close();

        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, entry)| entry).collect();
        let count = sessions.len();
        futures::future::join_all(sessions.into_iter().map(Self::teardown)).await;
        info!("Cursor pool shut down, closed {} sessions", count);
    }

    async fn acquire_permit(&self, ctx: &QueryContext) -> Result<OwnedSemaphorePermit> {
        ctx.check(Phase::Acquire)?;
        ctx.run(Phase::Acquire, async {
            self.permits.clone().acquire_owned().await.map_err(|_| {
                PgReportError::Connectivity(DriverError::new("cursor pool is shut down"))
            })
        })
        .await
    }

    /// Wait for any in-flight fetch on the session, then close its cursor.
    ///
    /// The wait is bounded by [`TEARDOWN_TIMEOUT`]; past it the close is left
    /// to a background task that runs once the fetch lets go of the session.
    async fn teardown(entry: Arc<SessionEntry<C::Connection>>) {
        match tokio::time::timeout(TEARDOWN_TIMEOUT, entry.cursor.clone().lock_owned()).await {
            Ok(slot) => Self::close_slot(&entry.id, slot).await,
            Err(_) => {
                warn!(
                    "Session {} still busy after {:?}, closing it in the background",
                    entry.id, TEARDOWN_TIMEOUT
                );
                let cursor = entry.cursor.clone();
                let id = entry.id.clone();
                tokio::spawn(async move {
                    let slot = cursor.lock_owned().await;
                    Self::close_slot(&id, slot).await;
                });
            }
        }
    }

    async fn close_slot(session_id: &str, mut slot: SlotGuard<C::Connection>) {
        let state = slot.take();
        drop(slot);
        if let Some(state) = state {
            Self::close_state(session_id, state).await;
        }
    }

    async fn close_state(session_id: &str, state: CursorState<C::Connection>) {
        match tokio::time::timeout(TEARDOWN_TIMEOUT, state.close()).await {
            Ok(Ok(())) => debug!("Rolled back cursor transaction for session {}", session_id),
            Ok(Err(e)) => warn!("Rollback for session {} failed: {}", session_id, e),
            Err(_) => warn!("Rollback for session {} timed out, dropping connection", session_id),
        }
    }
}
