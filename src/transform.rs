//! The contract between nodes and user-supplied transforms.
//!
//! A transform maps one directory to another. It is handed its input and a
//! freshly allocated output directory, a private copy of the node's options
//! and a [`Completion`] signal. It finishes by signalling completion, by
//! returning a future, or both; whichever settles first decides the outcome.

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, OnceLock, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::Cause;
use crate::events::{Emitter, Event, Info, InfoCode};
use crate::fs::Fs;
use crate::session::Environment;

/// Future a transform may return instead of, or in addition to, signalling.
pub type TransformFuture = BoxFuture<'static, anyhow::Result<()>>;

type TransformFn =
    dyn Fn(&TransformContext, TransformArgs) -> anyhow::Result<Option<TransformFuture>> + Send + Sync;

/// Options configured on a node, as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(Map<String, Value>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Typed access to a single option; `Ok(None)` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.0.get(key) {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }

    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Options {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Single-assignment completion signal.
///
/// The first call to [`Completion::complete`] decides the outcome; later
/// calls are ignored and report `false`. Clones share the same cell.
#[derive(Clone)]
pub struct Completion {
    shared: Arc<Signal>,
}

struct Signal {
    outcome: Arc<OnceLock<Result<(), Cause>>>,
    notify: Mutex<Option<oneshot::Sender<()>>>,
}

/// Waiting side of a [`Completion`].
pub(crate) struct Settled {
    outcome: Arc<OnceLock<Result<(), Cause>>>,
    notified: oneshot::Receiver<()>,
}

impl Completion {
    pub(crate) fn pair() -> (Completion, Settled) {
        let outcome = Arc::new(OnceLock::new());
        let (tx, rx) = oneshot::channel();

        let completion = Completion {
            shared: Arc::new(Signal {
                outcome: outcome.clone(),
                notify: Mutex::new(Some(tx)),
            }),
        };

        (completion, Settled { outcome, notified: rx })
    }

    pub fn complete(&self, result: anyhow::Result<()>) -> bool {
        let accepted = self.shared.outcome.set(result.map_err(Cause::from)).is_ok();

        if accepted
            && let Some(tx) = self
                .shared
                .notify
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        {
            let _ = tx.send(());
        }

        accepted
    }

    pub fn ok(&self) -> bool {
        self.complete(Ok(()))
    }

    pub fn fail(&self, err: impl Into<anyhow::Error>) -> bool {
        self.complete(Err(err.into()))
    }

    pub fn is_settled(&self) -> bool {
        self.shared.outcome.get().is_some()
    }

    /// The accepted outcome, if any.
    pub fn outcome(&self) -> Option<Result<(), Cause>> {
        self.shared.outcome.get().cloned()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl Settled {
    /// Resolves once the signal is completed, or once every [`Completion`]
    /// handle has been dropped without completing it.
    pub(crate) async fn wait(self) -> Result<(), Cause> {
        let _ = self.notified.await;

        match self.outcome.get() {
            Some(outcome) => outcome.clone(),
            None => Err(Cause::new(anyhow::anyhow!(
                "transform finished without signalling completion"
            ))),
        }
    }
}

pub struct TransformArgs {
    pub input: Utf8PathBuf,
    pub output: Utf8PathBuf,
    /// Private copy of the node's options.
    pub options: Options,
    pub done: Completion,
}

/// Arguments of the two-signal convention: `success` on success, `error` on
/// failure.
pub struct LegacyArgs {
    pub input: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub options: Options,
    pub success: Success,
    pub error: Completion,
}

/// Success half of [`LegacyArgs`].
#[derive(Debug, Clone)]
pub struct Success(Completion);

impl Success {
    pub fn call(&self) -> bool {
        self.0.ok()
    }
}

/// What a running transform can see of the node it belongs to.
#[derive(Clone)]
pub struct TransformContext {
    pub(crate) id: Arc<str>,
    pub(crate) name: Arc<str>,
    pub(crate) cachedir: Utf8PathBuf,
    pub(crate) env: Arc<Environment>,
    pub(crate) events: Arc<Emitter>,
    pub(crate) aborted: Arc<AtomicBool>,
    pub(crate) span: tracing::Span,
}

impl TransformContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory that persists across the node's rebuild cycles.
    pub fn cachedir(&self) -> &Utf8Path {
        &self.cachedir
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn fs(&self) -> Fs {
        Fs
    }

    /// Whether the cycle this context belongs to has been invalidated.
    /// Long-running transforms may poll this and stop early.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(parent: &self.span, node = %self.id, "{message}");

        let info = Info::for_node(InfoCode::TransformLog, &self.id)
            .with_message(message)
            .progress();
        self.events.emit(Event::Info(info));
    }
}

impl fmt::Debug for TransformContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformContext")
            .field("id", &self.id)
            .field("cachedir", &self.cachedir)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// A named, user-supplied directory transformation.
#[derive(Clone)]
pub struct Transformer {
    name: Cow<'static, str>,
    func: Arc<TransformFn>,
}

impl Transformer {
    /// Full contract: the function may signal `args.done`, return a future,
    /// or return an error synchronously.
    ///
    /// When the signal settles before the returned future does, the future
    /// is cancelled at its next await point. Work it handed to other tasks
    /// or threads is not cancelled and must not touch the output directory
    /// after signalling.
    pub fn new<F>(name: impl Into<Cow<'static, str>>, func: F) -> Self
    where
        F: Fn(&TransformContext, TransformArgs) -> anyhow::Result<Option<TransformFuture>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn from_async<F, Fut>(name: impl Into<Cow<'static, str>>, func: F) -> Self
    where
        F: Fn(TransformContext, Utf8PathBuf, Utf8PathBuf, Options) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(name, move |ctx, args| {
            Ok(Some(
                func(ctx.clone(), args.input, args.output, args.options).boxed(),
            ))
        })
    }

    /// Synchronous body, executed on the blocking pool.
    pub fn from_fn<F>(name: impl Into<Cow<'static, str>>, func: F) -> Self
    where
        F: Fn(&TransformContext, &Utf8Path, &Utf8Path, &Options) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        let func = Arc::new(func);

        Self::new(name, move |ctx, args| {
            let func = func.clone();
            let ctx = ctx.clone();

            let task = tokio::task::spawn_blocking(move || {
                func(&ctx, args.input.as_path(), args.output.as_path(), &args.options)
            });

            Ok(Some(
                async move {
                    match task.await {
                        Ok(result) => result,
                        Err(err) if err.is_panic() => {
                            Err(anyhow::anyhow!(panic_message(&*err.into_panic())))
                        }
                        Err(err) => Err(anyhow::anyhow!("transform was cancelled: {err}")),
                    }
                }
                .boxed(),
            ))
        })
    }

    /// Adapts a transform written against the two-signal convention.
    pub fn legacy<F>(name: impl Into<Cow<'static, str>>, func: F) -> Self
    where
        F: Fn(&TransformContext, LegacyArgs) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        warn_legacy(&name);

        Self::new(name, move |ctx, args| {
            let TransformArgs {
                input,
                output,
                options,
                done,
            } = args;

            let args = LegacyArgs {
                input,
                output,
                options,
                success: Success(done.clone()),
                error: done,
            };

            func(ctx, args)?;
            Ok(None)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the transform once and waits for its first settlement.
    pub(crate) async fn invoke(
        &self,
        ctx: &TransformContext,
        input: Utf8PathBuf,
        output: Utf8PathBuf,
        options: Options,
    ) -> Result<(), Cause> {
        let (done, settled) = Completion::pair();
        let args = TransformArgs {
            input,
            output,
            options,
            done: done.clone(),
        };

        let mut task = None;

        match panic::catch_unwind(AssertUnwindSafe(|| (self.func)(ctx, args))) {
            Ok(Ok(None)) => {}
            Ok(Ok(Some(future))) => {
                let done = done.clone();
                task = Some(tokio::spawn(async move {
                    let result = match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => Err(anyhow::anyhow!(panic_message(&*panic))),
                    };
                    done.complete(result);
                }));
            }
            Ok(Err(err)) => {
                done.complete(Err(err));
            }
            Err(panic) => {
                done.complete(Err(anyhow::anyhow!(panic_message(&*panic))));
            }
        }

        // Only handles held by the transform may keep the signal open now.
        drop(done);
        let outcome = settled.wait().await;

        // The queue slot is released once this returns.
        if let Some(task) = task {
            task.abort();
        }

        outcome
    }
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("transform panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("transform panicked: {s}")
    } else {
        String::from("transform panicked with unknown payload")
    }
}

static WARNED: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(Default::default);

/// Warns about the two-signal convention once per transform name.
fn warn_legacy(name: &str) -> bool {
    let first = WARNED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.to_owned());

    if first {
        tracing::warn!(
            transform = name,
            "transform uses the deprecated success/error callback convention, \
             switch to a single completion signal or a returned future"
        );
    }

    first
}
