use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use futures::future::BoxFuture;
use gobble::{
    BuildOptions, BuildTask, ErrorCode, Event, EventKind, Flatten, GobbleError, Node, Options,
    Transformer, build,
};
use tempfile::TempDir;

struct Fixture {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();

        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/a.txt"), "hi").unwrap();

        Self { _tmp: tmp, root }
    }

    fn source(&self) -> Node {
        Node::source(self.root.join("src"))
    }

    fn dest(&self) -> Utf8PathBuf {
        self.root.join("dest")
    }

    fn gobbledir(&self) -> Utf8PathBuf {
        self.root.join(".gobble-build")
    }

    fn options(&self) -> BuildOptions {
        BuildOptions::new(self.dest()).gobbledir(self.gobbledir())
    }
}

fn uppercase() -> Transformer {
    Transformer::from_fn("uppercase", |_, input, output, _| {
        for entry in std::fs::read_dir(input)? {
            let entry = entry?;
            let text = std::fs::read_to_string(entry.path())?;
            std::fs::write(output.as_std_path().join(entry.file_name()), text.to_uppercase())?;
        }
        Ok(())
    })
}

fn failing(message: &'static str) -> Transformer {
    Transformer::new("failing", move |_, args| {
        args.done.fail(anyhow::anyhow!(message));
        Ok(None)
    })
}

fn record(task: &BuildTask) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));

    for kind in [EventKind::Info, EventKind::Error, EventKind::Complete] {
        let log = log.clone();
        task.on(kind, move |event| {
            let entry = match event {
                Event::Info(info) => format!("info {:?}", info.code),
                Event::Error(err) => format!("error {}", err.code),
                Event::Complete => String::from("complete"),
            };
            log.lock().unwrap().push(entry);
        });
    }

    log
}

fn listing(dir: &Utf8Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn uppercase_pipeline_builds_into_empty_dest() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.dest()).unwrap();

    let node = fx.source().transform(uppercase(), Options::new());
    let task = build(&node, fx.options()).unwrap();
    let log = record(&task);

    task.await.unwrap();

    assert_eq!(std::fs::read_to_string(fx.dest().join("a.txt")).unwrap(), "HI");
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "info BuildStart",
            "info TransformStart",
            "info TransformComplete",
            "complete",
        ]
    );
    assert!(!fx.gobbledir().exists());
    assert!(!node.is_active());
}

#[tokio::test]
async fn missing_dest_is_created() {
    let fx = Fixture::new();
    let node = fx.source().transform(uppercase(), Options::new());

    build(&node, fx.options()).unwrap().await.unwrap();

    assert_eq!(listing(&fx.dest()), vec!["a.txt"]);
}

#[tokio::test]
async fn failing_transform_rejects_and_leaves_dest_empty() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.dest()).unwrap();

    let node = fx.source().transform(failing("boom"), Options::new());
    let task = build(&node, fx.options()).unwrap();
    let log = record(&task);

    let err = task.await.unwrap_err();

    assert_eq!(err.code, ErrorCode::TransformationFailed);
    assert_eq!(err.original_message().as_deref(), Some("boom"));
    assert_eq!(err.id.as_deref(), Some(node.id()));
    assert!(listing(&fx.dest()).is_empty());
    assert_eq!(
        *log.lock().unwrap(),
        vec!["info BuildStart", "info TransformStart", "error TRANSFORMATION_FAILED"]
    );
}

#[tokio::test]
async fn non_empty_dest_is_left_untouched() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.dest().join("nested")).unwrap();
    std::fs::write(fx.dest().join("keep.txt"), "precious").unwrap();
    std::fs::write(fx.dest().join("nested/deep.bin"), [0u8, 1, 2, 3]).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counting = {
        let calls = calls.clone();
        Transformer::new("counting", move |_, args| {
            calls.fetch_add(1, Ordering::SeqCst);
            args.done.ok();
            Ok(None)
        })
    };

    let node = fx.source().transform(counting, Options::new());
    let task = build(&node, fx.options()).unwrap();
    let log = record(&task);

    let err = task.await.unwrap_err();

    assert_eq!(err.code, ErrorCode::DirNotEmpty);
    assert_eq!(err.path.as_deref(), Some(fx.dest().as_path()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(listing(&fx.dest()), vec!["keep.txt", "nested"]);
    assert_eq!(std::fs::read_to_string(fx.dest().join("keep.txt")).unwrap(), "precious");
    assert_eq!(std::fs::read(fx.dest().join("nested/deep.bin")).unwrap(), vec![0u8, 1, 2, 3]);
    assert_eq!(*log.lock().unwrap(), vec!["error DIR_NOT_EMPTY"]);
}

#[tokio::test]
async fn force_replaces_dest_contents() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.dest()).unwrap();
    std::fs::write(fx.dest().join("stale.txt"), "old").unwrap();

    let node = fx.source().transform(uppercase(), Options::new());
    build(&node, fx.options().force(true)).unwrap().await.unwrap();

    assert_eq!(listing(&fx.dest()), vec!["a.txt"]);
}

#[tokio::test]
async fn missing_source_directory() {
    let fx = Fixture::new();
    let node = Node::source(fx.root.join("nope")).transform(uppercase(), Options::new());

    let err = build(&node, fx.options()).unwrap().await.unwrap_err();

    assert_eq!(err.code, ErrorCode::MissingDirectory);
}

#[tokio::test]
async fn chained_transforms_relay_each_event_once() {
    let fx = Fixture::new();
    let exclaim = Transformer::from_fn("exclaim", |_, input, output, _| {
        let text = std::fs::read_to_string(input.join("a.txt"))?;
        std::fs::write(output.join("a.txt"), format!("{text}!"))?;
        Ok(())
    });

    let node = fx
        .source()
        .transform(uppercase(), Options::new())
        .transform(exclaim, Options::new());
    let task = build(&node, fx.options()).unwrap();
    let log = record(&task);

    task.await.unwrap();

    assert_eq!(std::fs::read_to_string(fx.dest().join("a.txt")).unwrap(), "HI!");
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "info BuildStart",
            "info TransformStart",
            "info TransformComplete",
            "info TransformStart",
            "info TransformComplete",
            "complete",
        ]
    );
}

#[tokio::test]
async fn upstream_failure_is_reported_once() {
    let fx = Fixture::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let downstream = {
        let calls = calls.clone();
        Transformer::new("downstream", move |_, args| {
            calls.fetch_add(1, Ordering::SeqCst);
            args.done.ok();
            Ok(None)
        })
    };

    let upstream = fx.source().transform(failing("upstream broke"), Options::new());
    let node = upstream.transform(downstream, Options::new());
    let task = build(&node, fx.options()).unwrap();
    let log = record(&task);

    let err = task.await.unwrap_err();

    assert_eq!(err.code, ErrorCode::TransformationFailed);
    assert_eq!(err.id.as_deref(), Some(upstream.id()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let errors = log
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.starts_with("error"))
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn keep_gobbledir_retains_session_root() {
    let fx = Fixture::new();
    let node = fx.source().transform(uppercase(), Options::new());

    build(&node, fx.options().keep_gobbledir(true))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(listing(&fx.gobbledir().join(node.id())), vec![".cache", "1"]);
}

struct Rewrite;

impl Flatten for Rewrite {
    fn flatten<'a>(
        &'a self,
        inputdir: &'a Utf8Path,
        _dest: &'a Utf8Path,
        _node: &'a Node,
    ) -> BoxFuture<'a, Result<Utf8PathBuf, GobbleError>> {
        async move {
            let flat = inputdir.parent().unwrap().join("flat");
            std::fs::create_dir_all(&flat).unwrap();
            std::fs::write(flat.join("a.txt"), "flattened").unwrap();
            Ok(flat)
        }
        .boxed()
    }
}

struct Broken;

impl Flatten for Broken {
    fn flatten<'a>(
        &'a self,
        _inputdir: &'a Utf8Path,
        _dest: &'a Utf8Path,
        _node: &'a Node,
    ) -> BoxFuture<'a, Result<Utf8PathBuf, GobbleError>> {
        async { Err(GobbleError::new(ErrorCode::Io, "bad sourcemap")) }.boxed()
    }
}

#[tokio::test]
async fn flatten_output_is_copied() {
    let fx = Fixture::new();
    let node = fx.source().transform(uppercase(), Options::new());

    build(&node, fx.options().flatten(Rewrite)).unwrap().await.unwrap();

    assert_eq!(std::fs::read_to_string(fx.dest().join("a.txt")).unwrap(), "flattened");
}

#[tokio::test]
async fn flatten_failure_does_not_fail_build() {
    let fx = Fixture::new();
    let node = fx.source().transform(uppercase(), Options::new());
    let task = build(&node, fx.options().flatten(Broken)).unwrap();
    let log = record(&task);

    task.await.unwrap();

    assert_eq!(std::fs::read_to_string(fx.dest().join("a.txt")).unwrap(), "HI");

    let log = log.lock().unwrap();
    assert!(log.contains(&String::from("error IO_ERROR")));
    assert_eq!(log.last().map(String::as_str), Some("complete"));
}
