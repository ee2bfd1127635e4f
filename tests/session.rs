use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use gobble::{
    CycleState, ErrorCode, Event, EventKind, InfoCode, Node, Options, Session, SessionConfig,
    Transformer,
};
use tempfile::TempDir;

struct Fixture {
    _tmp: TempDir,
    root: Utf8PathBuf,
    session: Session,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();

        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/a.txt"), "hi").unwrap();

        let session = Session::create(SessionConfig {
            gobbledir: Some(root.join(".gobble")),
            ..Default::default()
        })
        .unwrap();

        Self {
            _tmp: tmp,
            root,
            session,
        }
    }

    fn source(&self) -> Node {
        Node::source(self.root.join("src"))
    }
}

fn listing(dir: &Utf8Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

fn counting(calls: &Arc<AtomicUsize>) -> Transformer {
    let calls = calls.clone();
    Transformer::from_fn("copy", move |_, input, output, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::fs::copy(input.join("a.txt"), output.join("a.txt"))?;
        Ok(())
    })
}

#[tokio::test]
async fn ready_is_idempotent() {
    let fx = Fixture::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let node = fx.source().transform(counting(&calls), Options::new());
    node.start(&fx.session);

    let first = node.ready(&fx.session).await.unwrap();
    let second = node.ready(&fx.session).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first, fx.session.output_dir(node.id(), 1));
}

#[tokio::test]
async fn rebuild_publishes_next_counter_and_prunes_previous() {
    let fx = Fixture::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let node = fx.source().transform(counting(&calls), Options::new());
    node.start(&fx.session);

    let first = node.ready(&fx.session).await.unwrap();
    assert_eq!(first.file_name(), Some("1"));
    assert_eq!(listing(&fx.session.node_dir(node.id())), vec![".cache", "1"]);

    node.invalidate();
    let second = node.ready(&fx.session).await.unwrap();

    assert_eq!(second.file_name(), Some("2"));
    assert_eq!(listing(&fx.session.node_dir(node.id())), vec![".cache", "2"]);
    assert!(!first.exists());
}

#[tokio::test]
async fn cache_survives_cycles() {
    let fx = Fixture::new();
    let runs = Transformer::from_fn("runs", |ctx, _, output, _| {
        let marker = ctx.cachedir().join("runs");
        let previous: u32 = match std::fs::read_to_string(&marker) {
            Ok(text) => text.parse()?,
            Err(_) => 0,
        };
        std::fs::write(&marker, (previous + 1).to_string())?;
        std::fs::write(output.join("runs.txt"), (previous + 1).to_string())?;
        Ok(())
    });

    let node = fx.source().transform(runs, Options::new());
    node.start(&fx.session);

    node.ready(&fx.session).await.unwrap();
    node.invalidate();
    let dir = node.ready(&fx.session).await.unwrap();

    assert_eq!(std::fs::read_to_string(dir.join("runs.txt")).unwrap(), "2");
}

#[tokio::test]
async fn cache_survives_a_failed_cycle() {
    let fx = Fixture::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let remember = {
        let attempts = attempts.clone();
        Transformer::from_fn("remember", move |ctx, _, output, _| {
            let marker = ctx.cachedir().join("marker");
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                std::fs::write(&marker, "from the first cycle")?;
                anyhow::bail!("first cycle fails");
            }
            std::fs::copy(&marker, output.join("marker"))?;
            Ok(())
        })
    };

    let node = fx.source().transform(remember, Options::new());
    node.start(&fx.session);

    let err = node.ready(&fx.session).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TransformationFailed);

    let dir = node.ready(&fx.session).await.unwrap();

    assert_eq!(dir.file_name(), Some("2"));
    assert_eq!(
        std::fs::read_to_string(dir.join("marker")).unwrap(),
        "from the first cycle"
    );
    assert_eq!(listing(&fx.session.node_dir(node.id())), vec![".cache", "2"]);
}

#[tokio::test]
async fn rebuild_requested_while_running_keeps_its_directory() {
    let fx = Fixture::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let slow = {
        let attempts = attempts.clone();
        Transformer::from_async("slow", move |_, input, output, _| {
            let first = attempts.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                tokio::fs::copy(input.join("a.txt"), output.join("a.txt")).await?;
                Ok(())
            }
        })
    };

    let node = fx.source().transform(slow, Options::new());
    node.start(&fx.session);

    let first = tokio::spawn(node.ready(&fx.session));
    while node.state() != Some(CycleState::Running) {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    node.invalidate();
    let second = node.ready(&fx.session).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(first.file_name(), Some("1"));
    assert_eq!(second.file_name(), Some("2"));
    assert_eq!(std::fs::read_to_string(second.join("a.txt")).unwrap(), "hi");
    assert_eq!(listing(&fx.session.node_dir(node.id())), vec![".cache", "2"]);
}

#[tokio::test]
async fn options_are_copied_per_invocation() {
    let fx = Fixture::new();
    let leaked = Arc::new(AtomicBool::new(false));
    let mutate = {
        let leaked = leaked.clone();
        Transformer::new("mutate", move |_, mut args| {
            if args.options.raw("touched").is_some() {
                leaked.store(true, Ordering::SeqCst);
            }
            args.options.insert("touched", true);
            args.done.ok();
            Ok(None)
        })
    };

    let node = fx.source().transform(mutate, Options::new().with("level", 1));
    node.ready(&fx.session).await.unwrap();
    node.invalidate();
    node.ready(&fx.session).await.unwrap();

    assert!(!leaked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn invocations_never_overlap() {
    let fx = Fixture::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let slow = |name: &'static str| {
        let log = log.clone();
        Transformer::from_async(name, move |_, _, _, _| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("start {name}"));
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push(format!("end {name}"));
                Ok(())
            }
        })
    };

    let a = fx.source().transform(slow("a"), Options::new());
    let b = fx.source().transform(slow("b"), Options::new());

    let (ra, rb) = tokio::join!(a.ready(&fx.session), b.ready(&fx.session));
    ra.unwrap();
    rb.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 4);
    for pair in log.chunks(2) {
        let started = pair[0].strip_prefix("start ").unwrap();
        assert_eq!(pair[1], format!("end {started}"));
    }
}

#[tokio::test]
async fn failure_aborts_waiting_siblings() {
    let fx = Fixture::new();
    let ran = Arc::new(AtomicBool::new(false));

    let sibling = {
        let ran = ran.clone();
        fx.source().transform(
            Transformer::new("sibling", move |_, args| {
                ran.store(true, Ordering::SeqCst);
                args.done.ok();
                Ok(None)
            }),
            Options::new(),
        )
    };

    let failing = {
        let sibling = sibling.clone();
        fx.source().transform(
            Transformer::from_async("failing", move |_, _, _, _| {
                let sibling = sibling.clone();
                async move {
                    while sibling.state() != Some(CycleState::Queued) {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    Err(anyhow::anyhow!("failing broke"))
                }
            }),
            Options::new(),
        )
    };

    let sibling_errors = Arc::new(AtomicUsize::new(0));
    {
        let sibling_errors = sibling_errors.clone();
        sibling.on(EventKind::Error, move |_| {
            sibling_errors.fetch_add(1, Ordering::SeqCst);
        });
    }

    let first = tokio::spawn(failing.ready(&fx.session));
    while failing.state() != Some(CycleState::Running) {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let second = tokio::spawn(sibling.ready(&fx.session));

    let first = first.await.unwrap().unwrap_err();
    let second = second.await.unwrap().unwrap_err();

    assert_eq!(first.code, ErrorCode::TransformationFailed);
    assert_eq!(first.original_message().as_deref(), Some("failing broke"));
    assert_eq!(second.code, ErrorCode::Aborted);
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(sibling_errors.load(Ordering::SeqCst), 0);

    // Work submitted after the abort is accepted again.
    assert!(sibling.ready(&fx.session).await.is_ok());
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn errors_are_relayed_downstream() {
    let fx = Fixture::new();
    let upstream = fx.source().transform(
        Transformer::new("broken", |_, _| Err(anyhow::anyhow!("nope"))),
        Options::new(),
    );
    let downstream = upstream.transform(
        Transformer::new("after", |_, args| {
            args.done.ok();
            Ok(None)
        }),
        Options::new(),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        downstream.on(EventKind::Error, move |event| {
            if let Event::Error(err) = event {
                seen.lock().unwrap().push(err.id.clone());
            }
        });
    }

    downstream.start(&fx.session);
    let err = downstream.ready(&fx.session).await.unwrap_err();

    assert_eq!(err.id.as_deref(), Some(upstream.id()));
    assert_eq!(*seen.lock().unwrap(), vec![Some(upstream.id().to_owned())]);
    assert_eq!(upstream.state(), Some(CycleState::Failed));
    assert_eq!(downstream.state(), Some(CycleState::Failed));
}

#[tokio::test]
async fn transform_logs_reach_downstream_listeners() {
    let fx = Fixture::new();
    let chatty = Transformer::new("chatty", |ctx, args| {
        ctx.log("working");
        args.done.ok();
        Ok(None)
    });
    let upstream = fx.source().transform(chatty, Options::new());
    let downstream = upstream.transform(
        Transformer::new("quiet", |_, args| {
            args.done.ok();
            Ok(None)
        }),
        Options::new(),
    );

    let messages = Arc::new(Mutex::new(Vec::new()));
    {
        let messages = messages.clone();
        downstream.on(EventKind::Info, move |event| {
            if let Event::Info(info) = event
                && info.code == InfoCode::TransformLog
            {
                messages.lock().unwrap().push(info.message.clone());
            }
        });
    }

    downstream.start(&fx.session);
    downstream.ready(&fx.session).await.unwrap();

    assert_eq!(*messages.lock().unwrap(), vec![Some(String::from("working"))]);
}

#[tokio::test]
async fn dropped_completion_fails_the_cycle() {
    let fx = Fixture::new();
    let node = fx.source().transform(
        Transformer::new("forgetful", |_, _| Ok(None)),
        Options::new(),
    );

    let err = node.ready(&fx.session).await.unwrap_err();

    assert_eq!(err.code, ErrorCode::TransformationFailed);
    assert_eq!(
        err.original_message().as_deref(),
        Some("transform finished without signalling completion")
    );
}

#[tokio::test]
async fn start_reports_unusable_root() {
    let tmp = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::write(root.join("blocker"), "not a directory").unwrap();

    let session = Session::create(SessionConfig {
        gobbledir: Some(root.join("blocker/.gobble")),
        ..Default::default()
    })
    .unwrap();

    let upstream = Node::source(root.join("src"));
    let node = upstream.transform(
        Transformer::new("never", |_, args| {
            args.done.ok();
            Ok(None)
        }),
        Options::new(),
    );

    let codes = Arc::new(Mutex::new(Vec::new()));
    {
        let codes = codes.clone();
        node.on(EventKind::Error, move |event| {
            if let Event::Error(err) = event {
                codes.lock().unwrap().push(err.code);
            }
        });
    }

    node.start(&session);

    assert_eq!(*codes.lock().unwrap(), vec![ErrorCode::Io]);
    assert!(!upstream.is_active());
}
