use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::GobbleError;
use crate::events::Emitter;
use crate::session::Session;

/// Leaf node whose output is an existing directory, returned as given.
pub struct SourceNode {
    dir: Utf8PathBuf,
    name: String,
    id: String,
    events: Arc<Emitter>,
    active: AtomicBool,
}

impl SourceNode {
    pub(crate) fn new(dir: Utf8PathBuf) -> Self {
        let name = dir.file_name().unwrap_or("source").to_owned();
        let id = super::uid(&name);

        Self {
            dir,
            name,
            id,
            events: Arc::new(Emitter::new()),
            active: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub(crate) fn events(&self) -> &Arc<Emitter> {
        &self.events
    }

    pub fn ready(&self, session: &Session) -> BoxFuture<'static, Result<Utf8PathBuf, GobbleError>> {
        let dir = self.dir.clone();
        let destroyed = session.is_destroyed();

        async move {
            if destroyed {
                return Err(GobbleError::session_destroyed());
            }

            match tokio::fs::metadata(&dir).await {
                Ok(meta) if meta.is_dir() => Ok(dir),
                _ => Err(GobbleError::missing_directory(&dir)),
            }
        }
        .boxed()
    }

    pub fn start(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            tracing::trace!(node = %self.id, dir = %self.dir, "source started");
        }
    }

    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::trace!(node = %self.id, "source stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
