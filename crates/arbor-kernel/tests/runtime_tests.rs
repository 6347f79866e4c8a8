//! End-to-end tests: a master and real workers on localhost.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arbor_kernel::relay::{IoRelay, shared_sink};
use arbor_kernel::{Endpoint, Locale, Master, NodeConfig, NodeError, Role, RpcChannel, SlaveRegistry, Worker};
use arbor_types::{CommandRequest, FileKind, FileRecord, Hello, InfoReply, RegisterAck, SubmitReply};
use tokio::time::{sleep, timeout};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl tokio::io::AsyncWrite for Capture {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

fn master_config(dir: &Path) -> NodeConfig {
    NodeConfig {
        control: format!("unix:{}", dir.join("master.sock").display()),
        listen: "127.0.0.1:0".into(),
        ..Default::default()
    }
}

fn worker_config(id: &str, parent: &Endpoint, dir: &Path) -> NodeConfig {
    NodeConfig {
        id: id.into(),
        parent: parent.to_string(),
        listen: "127.0.0.1:0".into(),
        relay_bind: "127.0.0.1:0".into(),
        private_dir: Some(dir.join(format!("node-{id}"))),
        ..Default::default()
    }
}

async fn wait_for(registry: &SlaveRegistry, n: usize) {
    timeout(Duration::from_secs(5), async {
        while registry.len() < n {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("children registered");
}

/// Start a master; returns its control and registration endpoints.
async fn start_master(dir: &Path) -> (Endpoint, Endpoint, Arc<SlaveRegistry>) {
    let master = Master::bind(&master_config(dir)).await.unwrap();
    let control = master.control_endpoint().unwrap();
    let listen = master.listen_endpoint().unwrap();
    let registry = master.registry().clone();
    tokio::spawn(master.serve());
    (control, listen, registry)
}

async fn start_worker(id: &str, parent: &Endpoint, dir: &Path) -> (Endpoint, Arc<SlaveRegistry>) {
    let worker = Worker::start(&worker_config(id, parent, dir)).await.unwrap();
    assert_eq!(worker.id(), id);
    let listen = worker.listen_endpoint().unwrap();
    let registry = worker.registry().clone();
    tokio::spawn(worker.serve());
    (listen, registry)
}

/// Submit like a client would and collect everything written back.
async fn submit(control: &Endpoint, mut req: CommandRequest) -> (SubmitReply, String) {
    let relay = IoRelay::bind(&Endpoint::parse("127.0.0.1:0")).await.unwrap();
    req = req.with_peer(relay.endpoint().to_string());

    let channel = RpcChannel::connect(control).await.unwrap();
    channel.send("hello", &Hello::Submit).await.unwrap();
    channel.send("submit", &req).await.unwrap();
    let reply: SubmitReply = channel.recv("reply").await.unwrap();

    let capture = Capture::default();
    if let SubmitReply::Dispatched(n) = reply {
        timeout(Duration::from_secs(10), relay.start(n, shared_sink(capture.clone())).wait())
            .await
            .expect("all output collected");
    }
    (reply, capture.text())
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test]
async fn local_binary_runs_on_worker() {
    let dir = tempfile::tempdir().unwrap();
    let (control, listen, registry) = start_master(dir.path()).await;
    start_worker("1", &listen, dir.path()).await;
    wait_for(&registry, 1).await;

    let mut req = CommandRequest::new(vec!["/bin/echo".into(), "hello".into()]).with_nodes("1");
    req.local_bin = true;
    let (reply, out) = submit(&control, req).await;

    assert_eq!(reply, SubmitReply::Dispatched(1));
    assert_eq!(out, "hello\n");
}

#[tokio::test]
async fn staged_script_is_shipped_and_run() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("greet.sh");
    std::fs::write(&script, "#!/bin/sh\necho staged \"$1\"\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (control, listen, registry) = start_master(dir.path()).await;
    start_worker("1", &listen, dir.path()).await;
    wait_for(&registry, 1).await;

    let req = CommandRequest::new(vec![script.display().to_string(), "there".into()])
        .with_nodes("1")
        .with_files(vec![
            FileRecord::new(&script, FileKind::Regular).with_mode(0o755),
        ]);
    let (reply, out) = submit(&control, req).await;

    assert_eq!(reply, SubmitReply::Dispatched(1));
    assert_eq!(out, "staged there\n");
    // The copy lives in the worker's private directory.
    let staged = arbor_types::rooted(&dir.path().join("node-1"), &script);
    assert!(staged.exists());
}

#[tokio::test]
async fn two_levels_report_through_interior_relay() {
    let dir = tempfile::tempdir().unwrap();
    let (control, listen, registry) = start_master(dir.path()).await;
    let (interior, interior_registry) = start_worker("1", &listen, dir.path()).await;
    start_worker("11", &interior, dir.path()).await;
    wait_for(&registry, 1).await;
    wait_for(&interior_registry, 1).await;

    let mut req = CommandRequest::new(vec!["/bin/echo".into(), "hi".into()]).with_nodes("1/11");
    req.local_bin = true;
    let (reply, out) = submit(&control, req).await;

    // The master dispatched once; node 1 ran locally and forwarded to 11.
    assert_eq!(reply, SubmitReply::Dispatched(1));
    assert_eq!(out, "hi\nhi\n");
}

#[tokio::test]
async fn launch_failure_is_reported_inline() {
    let dir = tempfile::tempdir().unwrap();
    let (control, listen, registry) = start_master(dir.path()).await;
    start_worker("1", &listen, dir.path()).await;
    wait_for(&registry, 1).await;

    let mut req = CommandRequest::new(vec!["/nonexistent/arbor-tool".into()]).with_nodes("1");
    req.local_bin = true;
    let (reply, out) = submit(&control, req).await;

    assert_eq!(reply, SubmitReply::Dispatched(1));
    assert!(out.contains("node 1: cannot run /nonexistent/arbor-tool"), "got {out:?}");
}

#[tokio::test]
async fn rejections() {
    let dir = tempfile::tempdir().unwrap();
    let (control, _listen, _registry) = start_master(dir.path()).await;

    let req = CommandRequest::new(vec!["/bin/true".into()]).with_nodes("3-1");
    let (reply, _) = submit(&control, req).await;
    assert!(matches!(reply, SubmitReply::Rejected(ref r) if r.contains("bad range")));

    let req = CommandRequest::new(vec!["/bin/true".into()]).with_nodes(".");
    let (reply, _) = submit(&control, req).await;
    assert_eq!(reply, SubmitReply::Rejected("no hosts ready".into()));
}

#[tokio::test]
async fn info_lists_children() {
    let dir = tempfile::tempdir().unwrap();
    let (control, listen, registry) = start_master(dir.path()).await;
    start_worker("2", &listen, dir.path()).await;
    start_worker("1", &listen, dir.path()).await;
    wait_for(&registry, 2).await;

    let channel = RpcChannel::connect(&control).await.unwrap();
    channel.send("hello", &Hello::Info).await.unwrap();
    let info: InfoReply = channel.recv("info").await.unwrap();

    let ids: Vec<&str> = info.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2"]);
    assert!(info.nodes.iter().all(|n| n.server_addr.starts_with("127.0.0.1:")));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn assigned_id_when_none_given() {
    let dir = tempfile::tempdir().unwrap();
    let (_control, listen, _registry) = start_master(dir.path()).await;

    let mut config = worker_config("", &listen, dir.path());
    config.private_dir = Some(dir.path().join("anon"));
    let worker = Worker::start(&config).await.unwrap();
    assert_eq!(worker.id(), "1");
}

/// Topology looked up somewhere other than the node's own config.
struct FixedLocale {
    parent: String,
}

impl Locale for FixedLocale {
    fn init(&self, _role: Role) -> anyhow::Result<()> {
        Ok(())
    }

    fn parent_address(&self) -> Option<String> {
        Some(self.parent.clone())
    }

    fn self_address(&self) -> String {
        "127.0.0.1:0".into()
    }
}

#[tokio::test]
async fn locale_supplies_worker_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let (_control, listen, registry) = start_master(dir.path()).await;

    // Neither address in the config is usable; the locale's are.
    let config = NodeConfig {
        id: "8".into(),
        listen: "192.0.2.1:1".into(),
        private_dir: Some(dir.path().join("node-8")),
        ..Default::default()
    };
    let locale = FixedLocale {
        parent: listen.to_string(),
    };
    let worker = Worker::start_in(&config, &locale).await.unwrap();

    assert_eq!(worker.id(), "8");
    assert!(worker.listen_endpoint().unwrap().to_string().starts_with("127.0.0.1:"));
    wait_for(&registry, 1).await;
}

#[tokio::test]
async fn worker_needs_a_parent_address() {
    let dir = tempfile::tempdir().unwrap();
    let config = NodeConfig {
        listen: "127.0.0.1:0".into(),
        private_dir: Some(dir.path().join("orphan")),
        ..Default::default()
    };
    assert!(matches!(Worker::start(&config).await, Err(NodeError::NoParent)));
}

#[tokio::test]
async fn worker_exits_when_parent_goes_away() {
    let dir = tempfile::tempdir().unwrap();
    let parent = Endpoint::parse("127.0.0.1:0").bind().await.unwrap();
    let parent_ep = parent.local_endpoint().unwrap();

    // A parent that acknowledges the registration and then hangs up.
    let fake_parent = tokio::spawn(async move {
        let (conn, peer) = parent.accept().await.unwrap();
        let channel = RpcChannel::new(conn, peer);
        let _hello: Hello = channel.recv("hello").await.unwrap();
        channel.send("ack", &RegisterAck { id: "5".into() }).await.unwrap();
    });

    let worker = Worker::start(&worker_config("5", &parent_ep, dir.path())).await.unwrap();
    fake_parent.await.unwrap();

    let result = timeout(Duration::from_secs(5), worker.serve())
        .await
        .expect("worker notices");
    assert!(matches!(result, Err(NodeError::ParentLost(_))));
}

#[tokio::test]
async fn child_disconnect_removes_registration() {
    let dir = tempfile::tempdir().unwrap();
    let (_control, listen, registry) = start_master(dir.path()).await;

    let worker = Worker::start(&worker_config("4", &listen, dir.path())).await.unwrap();
    wait_for(&registry, 1).await;
    drop(worker);

    timeout(Duration::from_secs(5), async {
        while !registry.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registration dropped");
}
