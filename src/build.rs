//! One-off builds of a node tree into a destination directory.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::GobbleError;
use crate::events::{Emitter, Event, EventKind, Info, InfoCode, ListenerId};
use crate::fs;
use crate::node::Node;
use crate::report::as_overhead;
use crate::session::{Mode, Session, SessionConfig, resolve_gobbledir};

/// Default temporary root for build tasks.
pub const DEFAULT_BUILD_GOBBLEDIR: &str = ".gobble-build";

/// Post-processing step that rewrites source maps of the final output so
/// they point at the original sources instead of intermediate directories.
///
/// Failures are reported as error events on the build but do not fail it;
/// the unflattened output is copied instead.
pub trait Flatten: Send + Sync {
    fn flatten<'a>(
        &'a self,
        inputdir: &'a Utf8Path,
        dest: &'a Utf8Path,
        node: &'a Node,
    ) -> BoxFuture<'a, Result<Utf8PathBuf, GobbleError>>;
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct BuildOptions {
    pub dest: Option<Utf8PathBuf>,
    /// Empty a non-empty destination instead of refusing to build.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub gobbledir: Option<Utf8PathBuf>,
    /// Leave the session root on disk after the build.
    #[serde(default)]
    pub keep_gobbledir: bool,
    #[serde(skip)]
    pub flatten: Option<Arc<dyn Flatten>>,
}

impl BuildOptions {
    pub fn new(dest: impl Into<Utf8PathBuf>) -> Self {
        Self {
            dest: Some(dest.into()),
            ..Default::default()
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn gobbledir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.gobbledir = Some(dir.into());
        self
    }

    pub fn keep_gobbledir(mut self, keep: bool) -> Self {
        self.keep_gobbledir = keep;
        self
    }

    pub fn flatten(mut self, flatten: impl Flatten + 'static) -> Self {
        self.flatten = Some(Arc::new(flatten));
        self
    }
}

impl fmt::Debug for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildOptions")
            .field("dest", &self.dest)
            .field("force", &self.force)
            .field("gobbledir", &self.gobbledir)
            .field("keep_gobbledir", &self.keep_gobbledir)
            .field("flatten", &self.flatten.is_some())
            .finish()
    }
}

/// A running build.
///
/// The task is lazy: nothing happens until it is awaited or spawned, so
/// listeners registered with [`BuildTask::on`] beforehand see every event.
/// Info events of the whole tree are relayed once each; the task ends with
/// exactly one `Complete` or `Error` event.
pub struct BuildTask {
    events: Arc<Emitter>,
    future: BoxFuture<'static, Result<(), GobbleError>>,
}

impl BuildTask {
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }
}

impl Future for BuildTask {
    type Output = Result<(), GobbleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl fmt::Debug for BuildTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildTask")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Builds `node` into `options.dest`.
///
/// A missing destination is rejected immediately; every other failure is
/// reported through the returned task.
pub fn build(node: &Node, options: BuildOptions) -> Result<BuildTask, GobbleError> {
    let dest = options
        .dest
        .clone()
        .filter(|dest| !dest.as_str().is_empty())
        .ok_or_else(GobbleError::missing_dest_dir)?;

    let gobbledir = resolve_gobbledir(options.gobbledir.as_deref(), DEFAULT_BUILD_GOBBLEDIR)?;
    let session = Session::create(SessionConfig {
        gobbledir: Some(gobbledir),
        mode: Mode::Build,
        env: None,
    })?;

    let events = Arc::new(Emitter::new());
    let future = run(node.clone(), session, dest, options, events.clone()).boxed();

    Ok(BuildTask { events, future })
}

async fn run(
    node: Node,
    session: Session,
    dest: Utf8PathBuf,
    options: BuildOptions,
    events: Arc<Emitter>,
) -> Result<(), GobbleError> {
    let start = Instant::now();
    let result = execute(&node, &session, &dest, &options, &events).await;

    node.stop();

    match result {
        Ok(()) => {
            tracing::info!("Built {} into {dest} {}", node.id(), as_overhead(start));
            events.emit(Event::Complete);
            teardown(&session, &options).await;
            Ok(())
        }
        Err(err) => {
            tracing::debug!(code = %err.code, "build failed");
            teardown(&session, &options).await;
            events.emit(Event::Error(err.clone()));
            Err(err)
        }
    }
}

async fn execute(
    node: &Node,
    session: &Session,
    dest: &Utf8Path,
    options: &BuildOptions,
    events: &Arc<Emitter>,
) -> Result<(), GobbleError> {
    fs::cleanup(session.root()).await?;

    // A destination that cannot be listed is treated as not existing yet;
    // the final copy creates it.
    if let Ok(files) = fs::readdir(dest).await {
        if !files.is_empty() && !options.force {
            return Err(GobbleError::dir_not_empty(dest));
        }
        fs::cleanup(dest).await?;
    }

    events.emit(Event::Info(Info::new(InfoCode::BuildStart)));

    let relay = relay_info(node, events);
    node.start(session);

    let result = deliver(node, session, dest, options, events).await;
    node.off(relay);
    result
}

/// Forwards the tree's info events to the task, skipping repeats of the
/// same event delivered through several paths.
fn relay_info(node: &Node, events: &Arc<Emitter>) -> ListenerId {
    let events = events.clone();
    let last = AtomicU64::new(0);

    node.on(EventKind::Info, move |event| {
        if let Event::Info(info) = event
            && last.swap(info.seq, Ordering::SeqCst) != info.seq
        {
            events.emit(event.clone());
        }
    })
}

async fn deliver(
    node: &Node,
    session: &Session,
    dest: &Utf8Path,
    options: &BuildOptions,
    events: &Arc<Emitter>,
) -> Result<(), GobbleError> {
    let inputdir = node.ready(session).await?;

    let inputdir = match &options.flatten {
        Some(flatten) => match flatten.flatten(&inputdir, dest, node).await {
            Ok(dir) => dir,
            Err(err) => {
                tracing::warn!(code = %err.code, "flattening source maps failed: {err}");
                events.emit(Event::Error(err));
                inputdir
            }
        },
        None => inputdir,
    };

    fs::copydir(&inputdir).to(dest).await
}

async fn teardown(session: &Session, options: &BuildOptions) {
    session.destroy();

    if options.keep_gobbledir {
        return;
    }

    if let Err(err) = fs::rimraf(session.root()).await {
        tracing::warn!(root = %session.root(), "could not remove temporary directory: {err}");
    }
}
