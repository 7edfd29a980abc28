use std::ffi::OsString;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;

use super::KubeletError;

/// Observes the kubelet registration socket being (re)created, which happens
/// every time the kubelet restarts and forgets its plugins.
pub struct KubeletWatcher {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<()>,
}

impl KubeletWatcher {
    pub fn new(kubelet_socket: &Path) -> Result<Self, Report<KubeletError>> {
        let dir = kubelet_socket
            .parent()
            .ok_or_else(|| Report::new(KubeletError::Watch(kubelet_socket.to_path_buf())))?;
        let socket_name: Option<OsString> = kubelet_socket.file_name().map(Into::into);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let created = matches!(event.kind, EventKind::Create(_))
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == socket_name.as_deref());
                    if created {
                        debug!("kubelet socket created: {:?}", event.paths);
                        let _ = tx.send(());
                    }
                }
                Err(e) => error!("kubelet socket watch error: {e:?}"),
            },
            Config::default(),
        )
        .change_context_lazy(|| KubeletError::Watch(dir.to_path_buf()))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .change_context_lazy(|| KubeletError::Watch(dir.to_path_buf()))?;

        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }

    /// Resolves on the next kubelet restart, `None` once the watcher failed.
    pub async fn restarted(&mut self) -> Option<()> {
        self.events.recv().await
    }
}
