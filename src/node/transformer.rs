use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use camino::Utf8PathBuf;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, future};
use indicatif::ProgressStyle;
use tracing::Instrument;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{ErrorCode, GobbleError};
use crate::events::{Emitter, Event, EventKind, Info, InfoCode, ListenerId};
use crate::fs;
use crate::session::{CACHE_DIR, Session};
use crate::transform::{Options, TransformContext, Transformer};

use super::Node;

type Ready = Shared<BoxFuture<'static, Result<Utf8PathBuf, GobbleError>>>;

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

/// Where the latest cycle of a [`TransformerNode`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// No cycle has been started yet.
    Idle,
    AwaitingInput,
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// Node that runs a user transform over the output of its input node.
///
/// Each cycle writes into a fresh, numbered output directory under the
/// node's directory in the session root. Cycle `n` is published only after
/// the transform settled successfully, at which point the directories of
/// older cycles are removed.
pub struct TransformerNode {
    input: Node,
    transformer: Transformer,
    options: Options,
    name: String,
    id: String,
    events: Arc<Emitter>,
    state: Mutex<State>,
}

struct State {
    active: bool,
    relays: Vec<ListenerId>,
    /// Counter the next cycle will use.
    counter: u64,
    phase: CycleState,
    cycle: Option<Cycle>,
}

/// The memoized, in-flight or settled cycle.
struct Cycle {
    session: u64,
    counter: u64,
    aborted: Arc<AtomicBool>,
    ready: Ready,
}

/// Failure of a cycle, split by whether this node is the one to report it.
enum Failure {
    /// Originated here; emitted as an error event by this node.
    Own(GobbleError),
    /// Came from upstream or from a queue abort; passed on as is.
    Passed(GobbleError),
}

impl TransformerNode {
    pub(crate) fn new(input: Node, name: String, transformer: Transformer, options: Options) -> Self {
        let id = super::uid(&name);

        Self {
            input,
            transformer,
            options,
            name,
            id,
            events: Arc::new(Emitter::new()),
            state: Mutex::new(State {
                active: false,
                relays: Vec::new(),
                counter: 1,
                phase: CycleState::Idle,
                cycle: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &Node {
        &self.input
    }

    pub(crate) fn events(&self) -> &Arc<Emitter> {
        &self.events
    }

    pub fn state(&self) -> CycleState {
        self.lock().phase
    }

    /// Counter the next cycle will be allocated.
    pub fn counter(&self) -> u64 {
        self.lock().counter
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ready(self: &Arc<Self>, session: &Session) -> BoxFuture<'static, Result<Utf8PathBuf, GobbleError>> {
        if session.is_destroyed() {
            return future::ready(Err(GobbleError::session_destroyed())).boxed();
        }

        let mut state = self.lock();

        if let Some(cycle) = &state.cycle
            && cycle.session == session.id()
        {
            return cycle.ready.clone().boxed();
        }

        let counter = state.counter;
        state.counter += 1;

        let aborted = Arc::new(AtomicBool::new(false));
        let ready = Arc::clone(self)
            .cycle(session.clone(), counter, aborted.clone())
            .boxed()
            .shared();

        state.cycle = Some(Cycle {
            session: session.id(),
            counter,
            aborted,
            ready: ready.clone(),
        });

        tracing::trace!(node = %self.id, counter, "cycle allocated");
        ready.boxed()
    }

    pub fn start(self: &Arc<Self>, session: &Session) {
        {
            let mut state = self.lock();
            if state.active {
                return;
            }
            state.active = true;

            let weak = Arc::downgrade(self);
            let info = self.input.on(EventKind::Info, {
                let weak = weak.clone();
                move |event| {
                    if let Some(node) = weak.upgrade() {
                        node.events.emit(event.clone());
                    }
                }
            });
            let error = self.input.on(EventKind::Error, move |event| {
                if let Some(node) = weak.upgrade() {
                    node.invalidate();
                    node.events.emit(event.clone());
                }
            });

            state.relays = vec![info, error];
        }

        let dir = session.node_dir(&self.id);
        match std::fs::create_dir_all(&dir) {
            Ok(()) => self.input.start(session),
            Err(err) => {
                let err = GobbleError::io(&dir, err).with_id(&self.id);
                self.events.emit(Event::Error(err));
            }
        }
    }

    pub fn stop(&self) {
        let relays = {
            let mut state = self.lock();
            if !state.active {
                return;
            }
            state.active = false;
            mem::take(&mut state.relays)
        };

        for id in relays {
            self.input.off(id);
        }

        self.input.stop();
    }

    pub fn invalidate(&self) {
        if let Some(cycle) = self.lock().cycle.take() {
            cycle.aborted.store(true, Ordering::SeqCst);
            tracing::debug!(node = %self.id, counter = cycle.counter, "cycle invalidated");
        }
    }

    /// Drops the memo only if it still belongs to `counter`; a newer cycle
    /// may already have replaced it.
    fn forget(&self, counter: u64) {
        let mut state = self.lock();

        if state.cycle.as_ref().is_some_and(|cycle| cycle.counter == counter)
            && let Some(cycle) = state.cycle.take()
        {
            cycle.aborted.store(true, Ordering::SeqCst);
        }
    }

    fn set_phase(&self, counter: u64, phase: CycleState) {
        let mut state = self.lock();

        // Only the most recently allocated cycle reports its progress.
        if state.counter == counter + 1 {
            state.phase = phase;
        }
    }

    async fn cycle(
        self: Arc<Self>,
        session: Session,
        counter: u64,
        aborted: Arc<AtomicBool>,
    ) -> Result<Utf8PathBuf, GobbleError> {
        match self.run_cycle(&session, counter, aborted).await {
            Ok(dir) => {
                self.set_phase(counter, CycleState::Succeeded);
                Ok(dir)
            }
            Err(failure) => {
                self.forget(counter);
                self.set_phase(counter, CycleState::Failed);
                session.queue().abort();

                match failure {
                    Failure::Own(err) => {
                        tracing::debug!(node = %self.id, counter, code = %err.code, "cycle failed");
                        self.events.emit(Event::Error(err.clone()));
                        Err(err)
                    }
                    Failure::Passed(err) => Err(err),
                }
            }
        }
    }

    async fn run_cycle(
        &self,
        session: &Session,
        counter: u64,
        aborted: Arc<AtomicBool>,
    ) -> Result<Utf8PathBuf, Failure> {
        self.set_phase(counter, CycleState::AwaitingInput);

        let outputdir = session.output_dir(&self.id, counter);
        let cachedir = session.cache_dir(&self.id);
        fs::mkdir(&outputdir).await.map_err(|err| Failure::Own(err.with_id(&self.id)))?;
        fs::mkdir(&cachedir).await.map_err(|err| Failure::Own(err.with_id(&self.id)))?;

        let inputdir = self.input.ready(session).await.map_err(Failure::Passed)?;

        self.set_phase(counter, CycleState::Queued);

        let span = tracing::info_span!("transform", node = %self.id, counter);
        let context = TransformContext {
            id: self.id.as_str().into(),
            name: self.name.as_str().into(),
            cachedir,
            env: session.env().clone(),
            events: self.events.clone(),
            aborted,
            span: span.clone(),
        };

        session
            .queue()
            .add(|| self.invoke(session, context, inputdir, outputdir, counter))
            .instrument(span)
            .await
            .map_err(|err| match err.code {
                ErrorCode::Aborted => Failure::Passed(err),
                _ => Failure::Own(err),
            })
    }

    /// Body of the queued unit. Holds the queue slot for its whole duration.
    async fn invoke(
        &self,
        session: &Session,
        context: TransformContext,
        inputdir: Utf8PathBuf,
        outputdir: Utf8PathBuf,
        counter: u64,
    ) -> Result<Utf8PathBuf, GobbleError> {
        self.set_phase(counter, CycleState::Running);

        let info = Info::for_node(InfoCode::TransformStart, &self.id).progress();
        self.events.emit(Event::Info(info));

        context.span.pb_set_style(&TASK_STYLE);
        context.span.pb_set_message(&format!("running {}", self.id));

        let start = Instant::now();
        let outcome = self
            .transformer
            .invoke(&context, inputdir, outputdir.clone(), self.options.clone())
            .await;

        let result = match outcome {
            Ok(()) => {
                let duration = start.elapsed();
                let info = Info::for_node(InfoCode::TransformComplete, &self.id)
                    .with_duration(duration)
                    .progress();
                self.events.emit(Event::Info(info));

                tracing::debug!(node = %self.id, counter, ?duration, "transform complete");

                self.prune(session, counter)
                    .map(|()| outputdir)
                    .map_err(|err| err.with_id(&self.id))
            }
            Err(cause) => Err(GobbleError::transformation(&self.id, cause)),
        };

        // Abort while still holding the slot so no waiting unit slips in.
        if result.is_err() {
            session.queue().abort();
        }

        result
    }

    /// Removes the output directories of cycles older than `published`.
    /// Newer cycles may already own a directory while they wait in the
    /// queue, so those are left alone, as is the cache. Synchronous, so
    /// nothing can observe a half-pruned directory from this task between
    /// publishing and pruning.
    fn prune(&self, session: &Session, published: u64) -> Result<(), GobbleError> {
        let dir = session.node_dir(&self.id);

        for name in fs::readdir_sync(&dir)? {
            if name == CACHE_DIR {
                continue;
            }
            if let Ok(counter) = name.parse::<u64>()
                && counter < published
            {
                fs::rimraf_sync(&dir.join(&name))?;
            }
        }

        Ok(())
    }
}
