//! Build graph nodes.
//!
//! A pipeline is a tree of [`Node`]s. Leaves are source directories, every
//! other node transforms the ready output of exactly one upstream node.
//! Nodes never hold a session; the session is handed to them whenever they
//! are started or asked for their output.

mod source;
mod transformer;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::BoxFuture;

use crate::error::GobbleError;
use crate::events::{Emitter, Event, EventKind, ListenerId};
use crate::session::Session;
use crate::transform::{Options, Transformer};

pub use self::source::SourceNode;
pub use self::transformer::{CycleState, TransformerNode};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique, filesystem-safe id for a node called `name`.
pub(crate) fn uid(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    let safe = if safe.is_empty() { "unknown" } else { &safe };
    format!("{safe}-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// A node of the build graph.
#[derive(Clone)]
pub enum Node {
    Source(Arc<SourceNode>),
    Transformer(Arc<TransformerNode>),
}

impl Node {
    /// Leaf node reading an existing directory.
    pub fn source(dir: impl Into<Utf8PathBuf>) -> Self {
        Node::Source(Arc::new(SourceNode::new(dir.into())))
    }

    /// Downstream node running `transformer` over this node's output. The
    /// node is named after the transformer.
    pub fn transform(&self, transformer: Transformer, options: Options) -> Self {
        let name = match transformer.name() {
            "" => "unknown".to_owned(),
            name => name.to_owned(),
        };
        self.transform_as(name, transformer, options)
    }

    pub fn transform_as(
        &self,
        name: impl Into<String>,
        transformer: Transformer,
        options: Options,
    ) -> Self {
        let node = TransformerNode::new(self.clone(), name.into(), transformer, options);
        Node::Transformer(Arc::new(node))
    }

    pub fn id(&self) -> &str {
        match self {
            Node::Source(node) => node.id(),
            Node::Transformer(node) => node.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Source(node) => node.name(),
            Node::Transformer(node) => node.name(),
        }
    }

    /// The node's output directory, computed at most once per cycle.
    ///
    /// Every caller during a cycle receives the same result. After a
    /// failure or an explicit [`Node::invalidate`] the next call starts a
    /// new cycle.
    pub fn ready(&self, session: &Session) -> BoxFuture<'static, Result<Utf8PathBuf, GobbleError>> {
        match self {
            Node::Source(node) => node.ready(session),
            Node::Transformer(node) => node.ready(session),
        }
    }

    /// Activates the node and, transitively, everything upstream of it.
    /// Idempotent.
    pub fn start(&self, session: &Session) {
        match self {
            Node::Source(node) => node.start(),
            Node::Transformer(node) => node.start(session),
        }
    }

    /// Deactivates the node and everything upstream of it. Idempotent.
    pub fn stop(&self) {
        match self {
            Node::Source(node) => node.stop(),
            Node::Transformer(node) => node.stop(),
        }
    }

    /// Forgets the memoized output so that the next [`Node::ready`] call
    /// runs a new cycle.
    pub fn invalidate(&self) {
        match self {
            Node::Source(_) => {}
            Node::Transformer(node) => node.invalidate(),
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Node::Source(node) => node.is_active(),
            Node::Transformer(node) => node.is_active(),
        }
    }

    /// State of the latest cycle; `None` for source nodes.
    pub fn state(&self) -> Option<CycleState> {
        match self {
            Node::Source(_) => None,
            Node::Transformer(node) => Some(node.state()),
        }
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events().on(kind, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events().off(id)
    }

    pub(crate) fn events(&self) -> &Arc<Emitter> {
        match self {
            Node::Source(node) => node.events(),
            Node::Transformer(node) => node.events(),
        }
    }

    /// The source directory of a source node.
    pub fn dir(&self) -> Option<&Utf8Path> {
        match self {
            Node::Source(node) => Some(node.dir()),
            Node::Transformer(_) => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Source(node) => f.debug_tuple("Source").field(&node.id()).finish(),
            Node::Transformer(node) => f.debug_tuple("Transformer").field(&node.id()).finish(),
        }
    }
}
