use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use console::Style;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::build::BuildTask;
use crate::error::GobbleError;
use crate::events::{Event, EventKind, Info, InfoCode};

const ANSI_BLUE: Style = Style::new().blue();
const ANSI_RED: Style = Style::new().red();

pub fn as_overhead(s: Instant) -> impl Display {
    as_duration(s.elapsed())
}

fn as_duration(duration: Duration) -> impl Display {
    ANSI_BLUE.apply_to(format!("(+{}ms)", duration.as_millis()))
}

/// Renders an event as a single human-readable line (errors may span more).
pub fn describe(event: &Event) -> String {
    match event {
        Event::Info(info) => describe_info(info),
        Event::Error(err) => describe_error(err),
        Event::Complete => String::from("build complete"),
    }
}

fn describe_info(info: &Info) -> String {
    let id = info.id.as_deref().unwrap_or("build");

    match info.code {
        InfoCode::BuildStart => String::from("build started"),
        InfoCode::TransformStart => format!("running {id}"),
        InfoCode::TransformComplete => match info.duration {
            Some(duration) => format!("{id} done {}", as_duration(duration)),
            None => format!("{id} done"),
        },
        InfoCode::TransformLog => format!("{id}: {}", info.message.as_deref().unwrap_or_default()),
    }
}

pub fn describe_error(err: &GobbleError) -> String {
    let mut out = format!("{} {}", ANSI_RED.apply_to(err.code), err.message);

    if let Some(id) = &err.id {
        out.push_str(&format!(" in {id}"));
    }
    if let Some(original) = &err.original {
        out.push_str(&format!("\n  caused by: {original}"));
    }
    if let Some(location) = &err.location {
        out.push_str(&format!("\n  at {location}"));
    }
    if let Some(path) = &err.path {
        out.push_str(&format!("\n  path: {path}"));
    }

    out
}

/// Logs the events of a [`BuildTask`] through `tracing`, keeping a spinner
/// span open while a transform is running.
#[derive(Default)]
pub struct Reporter {
    active: Mutex<Option<tracing::Span>>,
}

impl Reporter {
    pub fn attach(task: &BuildTask) -> Arc<Reporter> {
        let reporter = Arc::new(Reporter::default());

        for kind in [EventKind::Info, EventKind::Error, EventKind::Complete] {
            let reporter = reporter.clone();
            task.on(kind, move |event| reporter.handle(event));
        }

        reporter
    }

    pub fn handle(&self, event: &Event) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        match event {
            Event::Info(info) if info.code == InfoCode::TransformStart => {
                let span = tracing::info_span!("gobble", node = info.id.as_deref().unwrap_or_default());
                span.pb_set_style(&indicatif::ProgressStyle::default_spinner());
                span.pb_set_message(&describe(event));
                *active = Some(span);
            }
            Event::Info(info) if info.code == InfoCode::TransformLog => match active.as_ref() {
                Some(span) => span.pb_set_message(&describe(event)),
                None => tracing::info!("{}", describe(event)),
            },
            Event::Info(_) => {
                active.take();
                tracing::info!("{}", describe(event));
            }
            Event::Error(_) => {
                active.take();
                tracing::error!("{}", describe(event));
            }
            Event::Complete => {
                active.take();
                tracing::info!("{}", describe(event));
            }
        }
    }

    pub fn is_spinning(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Installs a global subscriber printing through indicatif, filtered by
/// `RUST_LOG` (default `info`).
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
}
