//! Watches the resource-config file and reloads the client registry.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use notify::event::{AccessKind, AccessMode};
use notify::{Error, Event, EventKind, RecommendedWatcher, Watcher};

use crate::config::load_resource_config;
use crate::scheduler::Scheduler;

pub struct ConfigWatcher {
    rx: Receiver<Result<Event, Error>>,
    // dropping the watcher detaches the notification stream
    _watcher: RecommendedWatcher,
    sched: Arc<Scheduler>,
    file_name: OsString,
    full_path: PathBuf,
}

impl ConfigWatcher {
    /// Watch `dir` for close-after-write events on `file_name`.
    pub fn new<P: AsRef<Path>>(
        dir: P,
        file_name: &str,
        sched: Arc<Scheduler>,
    ) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel::<Result<Event, Error>>();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(dir.as_ref(), notify::RecursiveMode::NonRecursive)?;
        tracing::info!(dir = %dir.as_ref().display(), file = %file_name, "watching resource config");

        Ok(Self {
            rx,
            _watcher: watcher,
            sched,
            file_name: OsString::from(file_name),
            full_path: dir.as_ref().join(file_name),
        })
    }

    /// Consume filesystem events until the notification stream closes.
    pub fn run(&self) {
        for res in self.rx.iter() {
            match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Access(AccessKind::Close(AccessMode::Write))
                    ) {
                        continue;
                    }
                    let matches_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(self.file_name.as_os_str()));
                    if matches_file {
                        tracing::info!(file = ?self.file_name, "resource config modified, updating client settings");
                        self.reload();
                    }
                }
                Err(err) => tracing::error!(%err, "watch error"),
            }
        }
    }

    /// Reload the registry from disk. Failures keep the prior registry.
    fn reload(&self) {
        match load_resource_config(&self.full_path) {
            Ok(limits) => {
                let mut state = self.sched.lock();
                state.registry.apply(&limits, &self.sched.params);
                tracing::info!(clients = state.registry.len(), "client registry reloaded");
            }
            Err(err) => {
                tracing::warn!(%err, "resource config reload failed, keeping previous settings");
            }
        }
    }
}
