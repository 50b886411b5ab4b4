//! Event sources feeding the lifecycle loop: the device plugin directory
//! and process signals.

use std::ffi::OsStr;
use std::ffi::OsString;
use std::path::Path;

use error_stack::ResultExt;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::select;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::PluginError;
use crate::error::PluginResult;
use crate::lifecycle::LifecycleEvent;
use crate::lifecycle::PluginSignal;

/// Maps a raw filesystem event to a lifecycle event.
///
/// Only the creation of the kubelet socket asks for a restart; everything
/// else in the directory is plain activity.
pub fn classify_fs_event(event: &Event, kubelet_socket_name: &OsStr) -> LifecycleEvent {
    let kubelet_socket_created = matches!(event.kind, EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(kubelet_socket_name));

    if kubelet_socket_created {
        LifecycleEvent::KubeletRestarted
    } else {
        LifecycleEvent::FsActivity
    }
}

/// Watches `plugin_dir` and forwards its events into `tx`.
///
/// Events stop flowing once the returned watcher is dropped.
pub fn watch_plugin_dir(
    plugin_dir: &Path,
    kubelet_socket: &Path,
    tx: mpsc::Sender<LifecycleEvent>,
) -> PluginResult<RecommendedWatcher> {
    let path = plugin_dir.display().to_string();
    let kubelet_socket_name = kubelet_socket
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let event = match res {
            Ok(event) => {
                debug!("Filesystem event: {:?}", event);
                classify_fs_event(&event, &kubelet_socket_name)
            }
            Err(e) => LifecycleEvent::WatchError(e.to_string()),
        };
        // receiver gone means the lifecycle loop has exited
        let _ = tx.blocking_send(event);
    })
    .change_context(PluginError::Watch { path: path.clone() })?;

    watcher
        .watch(plugin_dir, RecursiveMode::NonRecursive)
        .change_context(PluginError::Watch { path })?;

    Ok(watcher)
}

/// Forwards HUP, INT, TERM and QUIT into `tx`.
pub fn forward_signals(tx: mpsc::Sender<LifecycleEvent>) -> PluginResult<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup()).change_context(PluginError::Signal)?;
    let mut interrupt = signal(SignalKind::interrupt()).change_context(PluginError::Signal)?;
    let mut terminate = signal(SignalKind::terminate()).change_context(PluginError::Signal)?;
    let mut quit = signal(SignalKind::quit()).change_context(PluginError::Signal)?;

    Ok(tokio::spawn(async move {
        loop {
            let received = select! {
                Some(()) = hangup.recv() => PluginSignal::Hangup,
                Some(()) = interrupt.recv() => PluginSignal::Interrupt,
                Some(()) = terminate.recv() => PluginSignal::Terminate,
                Some(()) = quit.recv() => PluginSignal::Quit,
                else => break,
            };

            if tx.send(LifecycleEvent::Signal(received)).await.is_err() {
                break;
            }
        }
    }))
}
