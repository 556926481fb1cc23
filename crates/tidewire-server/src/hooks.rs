//! Connection lifecycle callbacks.

use std::sync::Arc;

use crate::connection::Connection;

/// Called by a connection as it starts and stops.
///
/// `on_start` runs once, after the connection is running. `on_stop` runs
/// once, during the first effective stop, and only for connections that
/// were started. Both run synchronously on whichever task triggered the
/// transition; a hook may call [`Connection::stop`] safely.
pub trait ConnectionHooks: Send + Sync {
    /// The connection is running.
    fn on_start(&self, _conn: &Arc<Connection>) {}

    /// The connection is stopping.
    fn on_stop(&self, _conn: &Arc<Connection>) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ConnectionHooks for NoopHooks {}

type HookFn = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Closure-based hooks registered on a [`Server`](crate::Server).
#[derive(Default)]
pub struct ServerHooks {
    on_start: Option<HookFn>,
    on_stop: Option<HookFn>,
}

impl ServerHooks {
    /// No hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` for every connection that starts.
    #[must_use]
    pub fn on_conn_start(mut self, f: impl Fn(&Arc<Connection>) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Run `f` for every started connection that stops.
    #[must_use]
    pub fn on_conn_stop(mut self, f: impl Fn(&Arc<Connection>) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(f));
        self
    }
}

impl ConnectionHooks for ServerHooks {
    fn on_start(&self, conn: &Arc<Connection>) {
        if let Some(f) = &self.on_start {
            f(conn);
        }
    }

    fn on_stop(&self, conn: &Arc<Connection>) {
        if let Some(f) = &self.on_stop {
            f(conn);
        }
    }
}

impl std::fmt::Debug for ServerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_connection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn closures_are_invoked() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let hooks = ServerHooks::new()
            .on_conn_start({
                let starts = Arc::clone(&starts);
                move |_| {
                    let _ = starts.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_conn_stop({
                let stops = Arc::clone(&stops);
                move |_| {
                    let _ = stops.fetch_add(1, Ordering::SeqCst);
                }
            });

        let (conn, _peer) = test_connection(1);
        hooks.on_start(&conn);
        hooks.on_stop(&conn);
        hooks.on_stop(&conn);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unset_hooks_are_noops() {
        let (conn, _peer) = test_connection(1);
        ServerHooks::new().on_start(&conn);
        NoopHooks.on_stop(&conn);
    }

    #[test]
    fn debug_shows_which_hooks_are_set() {
        let hooks = ServerHooks::new().on_conn_stop(|_| {});
        let shown = format!("{hooks:?}");
        assert!(shown.contains("on_start: false"));
        assert!(shown.contains("on_stop: true"));
    }
}
