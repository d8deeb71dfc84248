//! Session registry and switching policy.
//!
//! The manager owns every [`Session`] and the single "active session"
//! selection. One lock serializes every registry mutation; session locks are
//! only taken while the manager lock is held (never the other way round), and
//! the manager lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::record::{Session, SessionInfo};
use super::state::{SessionId, SessionState};
use crate::connector::SessionConnector;
use crate::error::{MuxError, Result};

/// Per-state session counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Registered sessions.
    pub total: usize,
    /// Sessions not yet dialed.
    pub created: usize,
    /// Sessions being connected.
    pub connecting: usize,
    /// Sessions in the foreground (zero or one).
    pub active: usize,
    /// Connected background sessions.
    pub idle: usize,
    /// Failed sessions awaiting an explicit close.
    pub error: usize,
    /// Sessions closed but not yet removed.
    pub closed: usize,
}

/// Registry contents, guarded by the manager lock.
#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Insertion order; the switching order.
    order: Vec<SessionId>,
    active: Option<SessionId>,
}

impl Registry {
    fn position(&self, id: &SessionId) -> Option<usize> {
        self.order.iter().position(|key| key == id)
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<Session>> + '_ {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }
}

/// Thread-safe registry of all sessions.
pub struct SessionManager {
    registry: Mutex<Registry>,
    active_tx: watch::Sender<Option<SessionId>>,
}

impl SessionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        let (active_tx, _) = watch::channel(None);
        Self {
            registry: Mutex::new(Registry::default()),
            active_tx,
        }
    }

    /// Registers a new session for `user@host`.
    ///
    /// Fails with `DuplicateActive` if a session for the same pair is already
    /// connected or connecting. The session is not connected.
    pub fn create(&self, host: &str, user: &str) -> Result<Arc<Session>> {
        let mut registry = self.registry.lock();

        let duplicate = registry
            .sessions
            .values()
            .any(|s| {
                s.host() == host
                    && s.user() == user
                    && (s.is_ready() || s.state() == SessionState::Connecting)
            });
        if duplicate {
            return Err(MuxError::DuplicateActive {
                host: host.to_string(),
                user: user.to_string(),
            });
        }

        let session = Arc::new(Session::new(host, user));
        let id = session.id().clone();
        registry.sessions.insert(id.clone(), Arc::clone(&session));
        registry.order.push(id.clone());

        tracing::info!(session_id = %id, host = %host, user = %user, "Created session");
        Ok(session)
    }

    /// Returns the session with the given ID.
    pub fn get(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.registry
            .lock()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| MuxError::NotFound(id.clone()))
    }

    /// Returns the session at `index` in switching order.
    pub fn get_by_index(&self, index: usize) -> Option<Arc<Session>> {
        let registry = self.registry.lock();
        registry
            .order
            .get(index)
            .and_then(|id| registry.sessions.get(id))
            .cloned()
    }

    /// Returns the active session.
    pub fn get_active(&self) -> Result<Arc<Session>> {
        let registry = self.registry.lock();
        registry
            .active
            .as_ref()
            .and_then(|id| registry.sessions.get(id))
            .cloned()
            .ok_or(MuxError::NoActiveSession)
    }

    /// Returns the active session ID.
    pub fn active_id(&self) -> Option<SessionId> {
        self.registry.lock().active.clone()
    }

    /// Returns whether `id` is the current selection.
    pub fn is_active(&self, id: &SessionId) -> bool {
        self.registry.lock().active.as_ref() == Some(id)
    }

    /// Subscribes to changes of the active selection.
    pub fn subscribe_active(&self) -> watch::Receiver<Option<SessionId>> {
        self.active_tx.subscribe()
    }

    /// Makes `id` the active session.
    ///
    /// The previously active session is demoted to `Idle` if it is still
    /// `Active`. The target is promoted to `Active` when it is connected;
    /// sessions that are not connected can be selected but keep their state.
    pub fn set_active(&self, id: &SessionId) -> Result<()> {
        let mut registry = self.registry.lock();
        if !registry.sessions.contains_key(id) {
            return Err(MuxError::NotFound(id.clone()));
        }
        self.activate(&mut registry, Some(id.clone()));
        Ok(())
    }

    /// Clears the active selection, demoting the previous active session.
    pub fn clear_active(&self) {
        let mut registry = self.registry.lock();
        self.activate(&mut registry, None);
    }

    /// Selects the next session in insertion order, wrapping around.
    ///
    /// Returns the new active ID; a no-op with fewer than two sessions.
    pub fn switch_next(&self) -> Option<SessionId> {
        self.switch(1)
    }

    /// Selects the previous session in insertion order, wrapping around.
    pub fn switch_previous(&self) -> Option<SessionId> {
        self.switch(-1)
    }

    fn switch(&self, step: isize) -> Option<SessionId> {
        let mut registry = self.registry.lock();
        let len = registry.order.len();
        if len < 2 {
            return registry.active.clone();
        }

        // Unset selection counts as "before the first session".
        let current = registry
            .active
            .as_ref()
            .and_then(|id| registry.position(id))
            .map(|i| i as isize)
            .unwrap_or(-1);
        let next = (current + step).rem_euclid(len as isize) as usize;
        let target = registry.order[next].clone();

        self.activate(&mut registry, Some(target.clone()));
        Some(target)
    }

    /// Demote/promote under the manager lock, then publish the selection.
    fn activate(&self, registry: &mut Registry, target: Option<SessionId>) {
        if registry.active != target {
            if let Some(previous) = registry.active.as_ref().and_then(|id| registry.sessions.get(id)) {
                previous.demote();
            }
        }

        if let Some(session) = target.as_ref().and_then(|id| registry.sessions.get(id)) {
            if !session.promote() {
                session.touch();
            }
            tracing::debug!(session_id = %session.id(), host = %session.host(), "Session selected");
        }

        registry.active = target.clone();
        self.active_tx.send_replace(target);
    }

    /// Connects a registered session and, if it is the current selection,
    /// brings it to the foreground.
    pub async fn connect(&self, id: &SessionId, connector: &SessionConnector) -> Result<Arc<Session>> {
        let session = self.get(id)?;
        connector.connect(&session).await?;

        let registry = self.registry.lock();
        if registry.active.as_ref() == Some(id) && registry.sessions.contains_key(id) {
            session.promote();
        }
        Ok(session)
    }

    /// Closes a session and removes it from the registry.
    ///
    /// When the closed session was active, the session that followed it in
    /// switching order (wrapping to the first) becomes active; with nothing
    /// left the selection is cleared.
    pub async fn close(&self, id: &SessionId) -> Result<()> {
        let session = {
            let mut registry = self.registry.lock();
            let position = registry
                .position(id)
                .ok_or_else(|| MuxError::NotFound(id.clone()))?;

            registry.order.remove(position);
            let session = registry
                .sessions
                .remove(id)
                .ok_or_else(|| MuxError::NotFound(id.clone()))?;

            if registry.active.as_ref() == Some(id) {
                // Forget the closed session first so activate() does not demote it.
                registry.active = None;
                let successor = if registry.order.is_empty() {
                    None
                } else {
                    Some(registry.order[position % registry.order.len()].clone())
                };
                self.activate(&mut registry, successor);
            }
            session
        };

        if let Err(e) = session.close().await {
            tracing::warn!(session_id = %id, error = %e, "Session closed with cleanup errors");
        }

        tracing::info!(session_id = %id, "Session removed");
        Ok(())
    }

    /// Closes every session best-effort and clears the registry.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut registry = self.registry.lock();
            let order = std::mem::take(&mut registry.order);
            let mut sessions = std::mem::take(&mut registry.sessions);
            registry.active = None;
            self.active_tx.send_replace(None);
            order.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let count = sessions.len();
        for session in sessions {
            if let Err(e) = session.close().await {
                tracing::warn!(
                    session_id = %session.id(),
                    error = %e,
                    "Session closed with cleanup errors"
                );
            }
        }

        tracing::info!(count, "Closed all sessions");
    }

    /// Lists sessions in switching order.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.lock().ordered().map(|s| s.info()).collect()
    }

    /// Returns the number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    /// Returns the number of sessions in `Active` state.
    pub fn active_count(&self) -> usize {
        self.stats().active
    }

    /// Returns the number of connected (`Active` or `Idle`) sessions.
    pub fn connected_count(&self) -> usize {
        let stats = self.stats();
        stats.active + stats.idle
    }

    /// Returns per-state counts.
    ///
    /// Taken under the manager lock, so every promotion/demotion is either
    /// fully visible or not at all.
    pub fn stats(&self) -> ManagerStats {
        let registry = self.registry.lock();
        let mut stats = ManagerStats {
            total: registry.sessions.len(),
            ..ManagerStats::default()
        };
        for session in registry.sessions.values() {
            match session.state() {
                SessionState::Created => stats.created += 1,
                SessionState::Connecting => stats.connecting += 1,
                SessionState::Active => stats.active += 1,
                SessionState::Idle => stats.idle += 1,
                SessionState::Error => stats.error += 1,
                SessionState::Closed => stats.closed += 1,
            }
        }
        stats
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tokio::sync::{mpsc, oneshot};

    use crate::session::io::{RemoteShell, ShellExit, TransportHandle};

    struct NoopTransport;

    #[async_trait]
    impl TransportHandle for NoopTransport {
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Installs a shell whose remote ends are dropped immediately.
    fn make_ready(session: &Session) {
        let (control, _) = mpsc::channel(8);
        let (input, _) = mpsc::channel(8);
        let (_, output) = mpsc::channel(8);
        let (_exit_tx, exit) = oneshot::channel::<ShellExit>();
        session.mark_connecting().unwrap();
        session
            .install(RemoteShell {
                transport: Arc::new(NoopTransport),
                control,
                exit,
                input,
                output,
                size: (80, 24),
            })
            .unwrap();
    }

    fn hosts(manager: &SessionManager, names: &[&str]) -> Vec<Arc<Session>> {
        names
            .iter()
            .map(|h| manager.create(h, "ops").unwrap())
            .collect()
    }

    fn active_host(manager: &SessionManager) -> String {
        manager.get_active().unwrap().host().to_string()
    }

    #[test]
    fn test_create_registers_session() {
        let manager = SessionManager::new();
        let session = manager.create("web1", "ops").unwrap();

        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(manager.session_count(), 1);
        assert_eq!(manager.get(session.id()).unwrap().id(), session.id());
        // Creating does not select.
        assert!(manager.active_id().is_none());
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let manager = SessionManager::new();
        assert!(matches!(
            manager.get(&"missing".to_string()),
            Err(MuxError::NotFound(_))
        ));
    }

    #[test]
    fn test_get_active_without_sessions() {
        let manager = SessionManager::new();
        assert_eq!(manager.get_active().unwrap_err(), MuxError::NoActiveSession);

        let session = manager.create("web1", "ops").unwrap();
        manager.set_active(session.id()).unwrap();
        assert_eq!(manager.get_active().unwrap().id(), session.id());
    }

    #[test]
    fn test_set_active_unknown_id() {
        let manager = SessionManager::new();
        hosts(&manager, &["a"]);
        assert!(matches!(
            manager.set_active(&"nope".to_string()),
            Err(MuxError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_active_promotes_and_demotes() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a", "b"]);
        sessions.iter().for_each(|s| make_ready(s));

        manager.set_active(sessions[0].id()).unwrap();
        assert_eq!(sessions[0].state(), SessionState::Active);
        assert_eq!(sessions[1].state(), SessionState::Idle);

        manager.set_active(sessions[1].id()).unwrap();
        assert_eq!(sessions[0].state(), SessionState::Idle);
        assert_eq!(sessions[1].state(), SessionState::Active);
        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.connected_count(), 2);
    }

    #[test]
    fn test_set_active_keeps_error_state() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a", "b"]);
        make_ready(&sessions[0]);
        sessions[1].mark_connecting().unwrap();
        sessions[1].fail("refused");

        manager.set_active(sessions[0].id()).unwrap();
        manager.set_active(sessions[1].id()).unwrap();

        assert_eq!(sessions[0].state(), SessionState::Idle);
        assert_eq!(sessions[1].state(), SessionState::Error);
        assert_eq!(manager.active_id().as_ref(), Some(sessions[1].id()));
    }

    #[test]
    fn test_clear_active() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a"]);
        make_ready(&sessions[0]);
        manager.set_active(sessions[0].id()).unwrap();

        manager.clear_active();
        assert!(manager.active_id().is_none());
        assert_eq!(sessions[0].state(), SessionState::Idle);
    }

    #[test]
    fn test_switch_next_scenario() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a", "b", "c"]);

        manager.set_active(sessions[0].id()).unwrap();
        manager.switch_next();
        manager.switch_next();
        assert_eq!(active_host(&manager), "c");

        manager.switch_next();
        assert_eq!(active_host(&manager), "a");
    }

    #[test]
    fn test_switch_previous_wraps() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a", "b", "c"]);

        manager.set_active(sessions[0].id()).unwrap();
        manager.switch_previous();
        assert_eq!(active_host(&manager), "c");
    }

    #[test]
    fn test_switch_from_unset_selection() {
        let manager = SessionManager::new();
        hosts(&manager, &["a", "b", "c"]);
        manager.switch_next();
        assert_eq!(active_host(&manager), "a");

        manager.clear_active();
        manager.switch_previous();
        assert_eq!(active_host(&manager), "c");
    }

    #[test]
    fn test_switch_is_noop_with_few_sessions() {
        let manager = SessionManager::new();
        assert!(manager.switch_next().is_none());
        assert!(manager.switch_previous().is_none());

        let only = manager.create("a", "ops").unwrap();
        assert!(manager.switch_next().is_none());
        manager.set_active(only.id()).unwrap();
        assert_eq!(manager.switch_next().as_ref(), Some(only.id()));
        assert_eq!(manager.switch_previous().as_ref(), Some(only.id()));
    }

    #[test]
    fn test_switch_publishes_selection() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a", "b"]);
        let rx = manager.subscribe_active();

        manager.set_active(sessions[0].id()).unwrap();
        manager.switch_next();
        assert_eq!(rx.borrow().as_ref(), Some(sessions[1].id()));
    }

    #[test]
    fn test_duplicate_connected_pair() {
        let manager = SessionManager::new();
        let first = manager.create("db1", "root").unwrap();

        // Not connected yet: a second record for the same pair is allowed.
        let second = manager.create("db1", "root").unwrap();
        make_ready(&first);

        let err = manager.create("db1", "root").unwrap_err();
        assert_eq!(
            err,
            MuxError::DuplicateActive {
                host: "db1".to_string(),
                user: "root".to_string()
            }
        );

        // Different user on the same host is fine.
        assert!(manager.create("db1", "admin").is_ok());
        drop(second);
    }

    #[test]
    fn test_duplicate_connecting_pair() {
        let manager = SessionManager::new();
        let first = manager.create("db1", "root").unwrap();
        first.mark_connecting().unwrap();

        assert!(matches!(
            manager.create("db1", "root"),
            Err(MuxError::DuplicateActive { .. })
        ));

        // A failed attempt no longer blocks the pair.
        first.fail("dial failed");
        assert!(manager.create("db1", "root").is_ok());
    }

    #[tokio::test]
    async fn test_create_after_close_succeeds() {
        let manager = SessionManager::new();
        let first = manager.create("db1", "root").unwrap();
        make_ready(&first);
        manager.set_active(first.id()).unwrap();
        assert!(manager.create("db1", "root").is_err());

        manager.close(first.id()).await.unwrap();
        assert!(manager.create("db1", "root").is_ok());
    }

    #[tokio::test]
    async fn test_close_unknown_is_not_found() {
        let manager = SessionManager::new();
        assert!(matches!(
            manager.close(&"ghost".to_string()).await,
            Err(MuxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_active_promotes_successor() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a", "b", "c"]);
        sessions.iter().for_each(|s| make_ready(s));

        manager.set_active(sessions[1].id()).unwrap();
        manager.close(sessions[1].id()).await.unwrap();

        assert_eq!(sessions[1].state(), SessionState::Closed);
        assert_eq!(active_host(&manager), "c");
        assert_eq!(sessions[2].state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_close_last_active_wraps_to_first() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a", "b", "c"]);

        manager.set_active(sessions[2].id()).unwrap();
        manager.close(sessions[2].id()).await.unwrap();
        assert_eq!(active_host(&manager), "a");
    }

    #[tokio::test]
    async fn test_close_only_session_clears_selection() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a"]);
        manager.set_active(sessions[0].id()).unwrap();

        manager.close(sessions[0].id()).await.unwrap();
        assert!(manager.active_id().is_none());
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_close_inactive_keeps_selection() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a", "b"]);
        manager.set_active(sessions[0].id()).unwrap();

        manager.close(sessions[1].id()).await.unwrap();
        assert_eq!(manager.active_id().as_ref(), Some(sessions[0].id()));
    }

    #[tokio::test]
    async fn test_close_all() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a", "b", "c"]);
        sessions.iter().for_each(|s| make_ready(s));
        manager.set_active(sessions[0].id()).unwrap();

        manager.close_all().await;

        assert_eq!(manager.session_count(), 0);
        assert!(manager.active_id().is_none());
        assert!(sessions.iter().all(|s| s.state() == SessionState::Closed));
    }

    #[test]
    fn test_list_is_in_insertion_order() {
        let manager = SessionManager::new();
        hosts(&manager, &["c", "a", "b"]);
        let listed: Vec<String> = manager.list_sessions().into_iter().map(|i| i.host).collect();
        assert_eq!(listed, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_get_by_index() {
        let manager = SessionManager::new();
        hosts(&manager, &["a", "b"]);
        assert_eq!(manager.get_by_index(1).unwrap().host(), "b");
        assert!(manager.get_by_index(2).is_none());
    }

    #[test]
    fn test_stats() {
        let manager = SessionManager::new();
        let sessions = hosts(&manager, &["a", "b", "c", "d"]);
        make_ready(&sessions[0]);
        make_ready(&sessions[1]);
        sessions[2].mark_connecting().unwrap();
        manager.set_active(sessions[0].id()).unwrap();

        let stats = manager.stats();
        assert_eq!(
            stats,
            ManagerStats {
                total: 4,
                created: 1,
                connecting: 1,
                active: 1,
                idle: 1,
                error: 0,
                closed: 0,
            }
        );
    }
}
