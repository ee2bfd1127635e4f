use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, GobbleError};
use crate::queue::ExecutionQueue;

/// Environment variable overriding the default temporary root.
pub const GOBBLE_TMP_DIR: &str = "GOBBLE_TMP_DIR";
/// Environment variable naming the environment transforms run in.
pub const GOBBLE_ENV: &str = "GOBBLE_ENV";
/// Default temporary root for long-lived sessions.
pub const DEFAULT_GOBBLEDIR: &str = ".gobble";
/// Name of the per-node directory that survives rebuild cycles.
pub const CACHE_DIR: &str = ".cache";

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// The mode the pipeline was started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// A one-off build into a destination directory.
    #[default]
    Build,
    /// A long-lived session that serves and rebuilds on demand.
    Serve,
}

/// Snapshot of the process environment handed to every transform.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Environment name, `development` unless configured otherwise.
    pub name: String,
    pub mode: Mode,
    /// Process environment variables at session creation, sorted by key.
    pub vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn capture(name: Option<String>, mode: Mode) -> Self {
        let vars: BTreeMap<String, String> = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect();
        let name = name
            .or_else(|| vars.get(GOBBLE_ENV).cloned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "development".to_owned());

        Self { name, mode, vars }
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn is_production(&self) -> bool {
        self.name == "production"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Temporary root; falls back to `GOBBLE_TMP_DIR`, then `.gobble`.
    #[serde(default)]
    pub gobbledir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub mode: Mode,
    /// Environment name; falls back to `GOBBLE_ENV`.
    #[serde(default)]
    pub env: Option<String>,
}

/// Resolves the temporary root: explicit option, then the environment, then
/// `default`, always made absolute against the working directory.
pub(crate) fn resolve_gobbledir(
    explicit: Option<&Utf8Path>,
    default: &str,
) -> Result<Utf8PathBuf, GobbleError> {
    let dir = match explicit {
        Some(dir) => dir.to_path_buf(),
        None => std::env::var(GOBBLE_TMP_DIR)
            .ok()
            .filter(|dir| !dir.is_empty())
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from(default)),
    };

    let absolute = std::path::absolute(&dir).map_err(|err| GobbleError::io(&dir, err))?;

    Utf8PathBuf::from_path_buf(absolute).map_err(|path| {
        GobbleError::new(
            ErrorCode::Io,
            format!("temporary directory {} is not valid UTF-8", path.display()),
        )
        .with_path(&dir)
    })
}

/// Temporary-directory namespace and scheduling context of one build or one
/// long-lived server.
///
/// Cloning is cheap and every clone refers to the same session. All nodes
/// driven through a session share its [`ExecutionQueue`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    root: Utf8PathBuf,
    queue: ExecutionQueue,
    env: Arc<Environment>,
    destroyed: AtomicBool,
}

impl Session {
    pub fn create(config: SessionConfig) -> Result<Self, GobbleError> {
        Self::with_queue(config, ExecutionQueue::new())
    }

    /// Creates a session that schedules on an existing queue, for callers
    /// that want several sessions to share one serializer.
    pub fn with_queue(config: SessionConfig, queue: ExecutionQueue) -> Result<Self, GobbleError> {
        let root = resolve_gobbledir(config.gobbledir.as_deref(), DEFAULT_GOBBLEDIR)?;
        let env = Environment::capture(config.env, config.mode);
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(session = id, root = %root, env = %env.name, "session created");

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                root,
                queue,
                env: Arc::new(env),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn root(&self) -> &Utf8Path {
        &self.inner.root
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.inner.queue
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.inner.env
    }

    /// `{root}/{id}`
    pub fn node_dir(&self, id: &str) -> Utf8PathBuf {
        self.inner.root.join(id)
    }

    /// `{root}/{id}/.cache`
    pub fn cache_dir(&self, id: &str) -> Utf8PathBuf {
        self.node_dir(id).join(CACHE_DIR)
    }

    /// `{root}/{id}/{counter}`
    pub fn output_dir(&self, id: &str, counter: u64) -> Utf8PathBuf {
        self.node_dir(id).join(counter.to_string())
    }

    /// Marks the session as finished. Returns `false` if it already was.
    pub fn destroy(&self) -> bool {
        let first = !self.inner.destroyed.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!(session = self.inner.id, "session destroyed");
        }
        first
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("root", &self.inner.root)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
