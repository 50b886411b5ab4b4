//! Socket ownership and crash-loop supervision of the gRPC server.

use std::future::Future;
use std::io;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api::device_plugin_server::DevicePluginServer;
use crate::error::PluginError;
use crate::error::PluginResult;
use crate::service::DevicePluginService;
use crate::transport::dial;
use crate::transport::DIAL_TIMEOUT;

/// A server that stays up longer than this between crashes gets its
/// restart budget back.
pub const CRASH_WINDOW: Duration = Duration::from_secs(3600);

/// Restarts tolerated inside [`CRASH_WINDOW`].
pub const MAX_RESTARTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    Restart,
    GiveUp,
}

/// Counts consecutive server crashes.
///
/// A crash more than [`CRASH_WINDOW`] after the previous one resets the count
/// to 1. The crash that pushes the count past [`MAX_RESTARTS`] is fatal.
/// The count is updated before it is checked, so the 6th crash inside the
/// window gives up rather than the 7th.
#[derive(Debug, Clone)]
pub struct CrashLoopTracker {
    last_crash: Instant,
    restart_count: u32,
}

impl CrashLoopTracker {
    pub fn new(started_at: Instant) -> Self {
        Self {
            last_crash: started_at,
            restart_count: 0,
        }
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn record_crash(&mut self, now: Instant) -> CrashVerdict {
        let since_last_crash = now.saturating_duration_since(self.last_crash);
        self.last_crash = now;

        if since_last_crash > CRASH_WINDOW {
            self.restart_count = 1;
        } else {
            self.restart_count += 1;
        }

        if self.restart_count > MAX_RESTARTS {
            CrashVerdict::GiveUp
        } else {
            CrashVerdict::Restart
        }
    }
}

/// Removes the socket file at `path`. A missing file is not an error.
pub fn remove_socket(path: &Path) -> PluginResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Report::new(e).change_context(PluginError::Cleanup {
            path: path.display().to_string(),
        })),
    }
}

/// Owns the plugin socket and the background task serving it.
#[derive(Debug)]
pub struct ServerSupervisor {
    socket_path: PathBuf,
    cancellation_token: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl ServerSupervisor {
    pub fn new(socket_path: PathBuf, cancellation_token: CancellationToken) -> Self {
        Self {
            socket_path,
            cancellation_token,
            server: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    /// Binds the socket, spawns the supervised server and waits until it
    /// accepts a connection.
    pub async fn start(&mut self, service: DevicePluginService) -> PluginResult<()> {
        let path = self.socket_path.display().to_string();
        info!("start device plugin server: {}", path);

        remove_socket(&self.socket_path)?;

        let listener = StdUnixListener::bind(&self.socket_path)
            .change_context(PluginError::Bind { path: path.clone() })?;
        listener
            .set_nonblocking(true)
            .change_context(PluginError::Bind { path: path.clone() })?;

        info!("gRPC server is bound to: {}", path);

        let socket_path = self.socket_path.clone();
        let token = self.cancellation_token.clone();
        self.server = Some(tokio::spawn(async move {
            let exit = supervise(&token, || {
                serve_once(&listener, service.clone(), &socket_path, &token)
            })
            .await;
            if exit == SupervisionExit::CrashLoop {
                std::process::exit(1);
            }
        }));

        // blocking dial as readiness check
        let channel = dial(&self.socket_path, DIAL_TIMEOUT).await?;
        drop(channel);

        Ok(())
    }

    /// Force-stops the server, wakes every pending `ListAndWatch` and removes
    /// the socket. Does nothing when no server runs.
    pub async fn stop(&mut self) -> PluginResult<()> {
        let Some(server) = self.server.take() else {
            return Ok(());
        };

        info!("stopping device plugin server: {}", self.socket_path.display());
        server.abort();
        self.cancellation_token.cancel();
        // the listener must be gone before the socket file is removed
        if let Err(e) = server.await {
            if !e.is_cancelled() {
                error!("device plugin server task failed: {e}");
            }
        }

        remove_socket(&self.socket_path)
    }
}

/// How supervision of a server ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionExit {
    /// The owning instance was cancelled.
    Stopped,
    /// The server crashed too often inside [`CRASH_WINDOW`].
    CrashLoop,
}

/// Calls `serve` again right after every return that was not caused by
/// `cancellation_token`, until the crash-loop policy gives up.
pub async fn supervise<S, Fut>(
    cancellation_token: &CancellationToken,
    mut serve: S,
) -> SupervisionExit
where
    S: FnMut() -> Fut,
    Fut: Future<Output = PluginResult<()>>,
{
    let mut tracker = CrashLoopTracker::new(Instant::now());

    loop {
        info!("starting gRPC server");
        let result = serve().await;

        if cancellation_token.is_cancelled() {
            info!("gRPC server stopped");
            return SupervisionExit::Stopped;
        }

        match result {
            Ok(()) => warn!("gRPC server exited unexpectedly"),
            Err(e) => warn!("gRPC server crashed with error: {e:?}"),
        }

        if tracker.record_crash(Instant::now()) == CrashVerdict::GiveUp {
            error!("gRPC server has repeatedly crashed recently. Quitting");
            return SupervisionExit::CrashLoop;
        }
        info!(
            "restarting gRPC server, restart count: {}",
            tracker.restart_count()
        );
    }
}

async fn serve_once(
    listener: &StdUnixListener,
    service: DevicePluginService,
    socket_path: &Path,
    cancellation_token: &CancellationToken,
) -> PluginResult<()> {
    let path = socket_path.display().to_string();

    let listener = listener
        .try_clone()
        .and_then(UnixListener::from_std)
        .change_context(PluginError::Serve { path: path.clone() })?;

    let token = cancellation_token.clone();
    tonic::transport::Server::builder()
        .add_service(DevicePluginServer::new(service))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
            token.cancelled().await;
            info!("shutting down gRPC server");
        })
        .await
        .change_context(PluginError::Serve { path })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio::sync::mpsc;
    use tokio::sync::Mutex;

    use super::*;
    use crate::api::device_plugin_client::DevicePluginClient;
    use crate::api::Empty;
    use crate::device_registry::DeviceRegistry;

    const MINUTE: Duration = Duration::from_secs(60);

    fn idle_service(token: &CancellationToken) -> DevicePluginService {
        let (_health_tx, health_rx) = mpsc::channel(1);
        DevicePluginService::new(
            Arc::new(DeviceRegistry::new("acme.test/widget", 1)),
            Arc::new(Mutex::new(health_rx)),
            token.clone(),
        )
    }

    fn serve_failure() -> PluginResult<()> {
        Err(Report::new(PluginError::Serve {
            path: "plugin.sock".to_string(),
        }))
    }

    #[test]
    fn sixth_crash_within_an_hour_is_fatal() {
        let start = Instant::now();
        let mut tracker = CrashLoopTracker::new(start);

        for i in 1..=5 {
            let verdict = tracker.record_crash(start + MINUTE * i);
            assert_eq!(verdict, CrashVerdict::Restart, "crash {i}");
        }
        assert_eq!(tracker.restart_count(), 5);

        assert_eq!(
            tracker.record_crash(start + MINUTE * 6),
            CrashVerdict::GiveUp
        );
    }

    #[test]
    fn long_healthy_run_resets_the_budget() {
        let start = Instant::now();
        let mut tracker = CrashLoopTracker::new(start);

        let mut now = start;
        for _ in 0..5 {
            now += MINUTE;
            tracker.record_crash(now);
        }
        assert_eq!(tracker.restart_count(), 5);

        now += CRASH_WINDOW + Duration::from_secs(1);
        assert_eq!(tracker.record_crash(now), CrashVerdict::Restart);
        assert_eq!(tracker.restart_count(), 1);

        for _ in 0..4 {
            now += MINUTE;
            assert_eq!(tracker.record_crash(now), CrashVerdict::Restart);
        }
        assert_eq!(tracker.restart_count(), 5);
    }

    #[test]
    fn crashes_spaced_over_an_hour_never_give_up() {
        let start = Instant::now();
        let mut tracker = CrashLoopTracker::new(start);

        let mut now = start;
        for _ in 0..20 {
            now += CRASH_WINDOW + MINUTE;
            assert_eq!(tracker.record_crash(now), CrashVerdict::Restart);
            assert_eq!(tracker.restart_count(), 1);
        }
    }

    #[test]
    fn exactly_one_hour_does_not_reset() {
        let start = Instant::now();
        let mut tracker = CrashLoopTracker::new(start);

        tracker.record_crash(start + MINUTE);
        tracker.record_crash(start + MINUTE + CRASH_WINDOW);

        assert_eq!(tracker.restart_count(), 2);
    }

    #[test]
    fn removing_missing_socket_is_ok() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("absent.sock");

        assert!(remove_socket(&path).is_ok());
    }

    #[test]
    fn removing_existing_socket_deletes_it() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").expect("should create stale file");

        remove_socket(&path).expect("should remove socket");

        assert!(!path.exists());
    }

    #[test(tokio::test)]
    async fn stop_without_start_is_noop() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut supervisor =
            ServerSupervisor::new(dir.path().join("idle.sock"), CancellationToken::new());

        supervisor.stop().await.expect("stop should succeed");
        assert!(!supervisor.is_running());
    }

    #[test(tokio::test)]
    async fn exited_server_is_served_again_on_the_same_socket() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("plugin.sock");
        let listener = StdUnixListener::bind(&path).expect("should bind socket");
        listener
            .set_nonblocking(true)
            .expect("should make socket nonblocking");

        let token = CancellationToken::new();
        let service = idle_service(&token);
        let attempts = Arc::new(AtomicU32::new(0));

        let supervision = tokio::spawn({
            let token = token.clone();
            let attempts = attempts.clone();
            let path = path.clone();
            async move {
                supervise(&token, || {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let serve = serve_once(&listener, service.clone(), &path, &token);
                    async move {
                        // the first two runs die right away
                        if attempt < 3 {
                            return serve_failure();
                        }
                        serve.await
                    }
                })
                .await
            }
        });

        {
            let channel = dial(&path, DIAL_TIMEOUT)
                .await
                .expect("should dial the listener");
            let options = DevicePluginClient::new(channel)
                .get_device_plugin_options(Empty {})
                .await
                .expect("third run should serve")
                .into_inner();
            assert!(!options.pre_start_required);
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        token.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), supervision)
            .await
            .expect("supervision should end after cancel")
            .expect("supervision task should not panic");
        assert_eq!(exit, SupervisionExit::Stopped);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test(tokio::test)]
    async fn repeated_exits_give_up_on_the_sixth_crash() {
        let token = CancellationToken::new();
        let mut attempts = 0;

        let exit = supervise(&token, || {
            attempts += 1;
            async { Ok(()) }
        })
        .await;

        assert_eq!(exit, SupervisionExit::CrashLoop);
        assert_eq!(attempts, MAX_RESTARTS + 1);
    }

    #[test(tokio::test)]
    async fn cancel_during_serve_is_not_a_crash() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let supervision = supervise(&token, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let token = token.clone();
            async move {
                token.cancelled().await;
                serve_failure()
            }
        });
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        };
        let (exit, ()) = tokio::join!(supervision, cancel);

        assert_eq!(exit, SupervisionExit::Stopped);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn stop_after_server_panic_still_removes_socket() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("plugin.sock");
        std::fs::write(&path, b"").expect("should create socket file");

        let server: JoinHandle<()> = tokio::spawn(async { panic!("server task failed") });
        while !server.is_finished() {
            tokio::task::yield_now().await;
        }

        let mut supervisor = ServerSupervisor::new(path.clone(), CancellationToken::new());
        supervisor.server = Some(server);

        supervisor.stop().await.expect("stop should succeed");
        assert!(!supervisor.is_running());
        assert!(!path.exists());
    }
}
