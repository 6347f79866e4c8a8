//! Running a delegated command on this node.
//!
//! Without isolation the staged executable is spawned directly. With
//! isolation the worker re-executes its own binary in the `launch` role,
//! which enters a private mount namespace and then execs the command; the
//! worker's own mounts are never touched.
//!
//! Either way stdout and stderr are copied into the upstream sink as they
//! arrive, and a launch failure is reported into the same sink so the
//! submitter sees it inline with everyone else's output.
//!
//! The launch role gets a status pipe as its stdin. It writes there only when
//! isolation fails; exec'ing the command closes the pipe. Nothing the command
//! does, its exit code included, can pass for a setup failure.

use std::io::{self, Write as _};
use std::os::fd::{AsFd as _, OwnedFd};
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use arbor_types::{CommandRequest, FileKind, rooted};

use crate::libs::library_search_path;
use crate::namespace;
use crate::relay::SharedSink;

/// Role name the worker passes when re-executing itself for isolation.
pub const LAUNCH_ROLE: &str = "launch";

/// Exit code of the launch role when namespace setup fails. The worker goes
/// by the status pipe, never by this.
pub const NAMESPACE_FAILURE: i32 = 121;

/// Exit code when the command could not be started at all.
pub const LAUNCH_FAILURE: i32 = 127;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("namespace setup failed for {path}: {reason}")]
    Namespace { path: PathBuf, reason: String },

    #[error("creating launch status pipe: {0}")]
    StatusPipe(#[source] io::Error),

    #[error("starting {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("locating own executable: {0}")]
    SelfExe(#[source] io::Error),
}

/// Everything needed to start one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// What to execute.
    pub program: PathBuf,
    /// `argv[0]` as the command will see it.
    pub arg0: String,
    pub args: Vec<String>,
    /// Replacement environment; `None` inherits the node's.
    pub env: Option<Vec<(String, String)>>,
    pub ld_library_path: Option<String>,
    pub cwd: PathBuf,
    /// Private directory to isolate, when a namespace was requested.
    pub isolate: Option<PathBuf>,
    /// Binary run in the launch role; `None` is the running executable.
    pub launcher: Option<PathBuf>,
}

/// A command ready to spawn.
pub struct Prepared {
    pub command: Command,
    /// Read end of the launch role's status pipe, under isolation.
    pub status: Option<io::PipeReader>,
}

impl LaunchPlan {
    /// Plan the launch of `req` with its files staged under `private_dir`.
    pub fn for_request(req: &CommandRequest, private_dir: &Path, lib_path: &[String], force_private: bool) -> Self {
        let arg0 = req.program().unwrap_or_default().to_string();
        let program = if req.local_bin {
            PathBuf::from(&arg0)
        } else {
            rooted(private_dir, Path::new(&arg0))
        };

        let env = (!req.env.is_empty()).then(|| {
            req.env
                .iter()
                .filter_map(|kv| kv.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        });

        let ld_library_path = if req.local_bin {
            None
        } else {
            let lib_path = if req.lib_path.is_empty() { lib_path } else { &req.lib_path };
            Some(staged_library_path(req, private_dir, lib_path))
        };

        let cwd = if !req.cwd.as_os_str().is_empty() && req.cwd.is_dir() {
            req.cwd.clone()
        } else {
            private_dir.to_path_buf()
        };

        Self {
            program,
            arg0,
            args: req.argv.iter().skip(1).cloned().collect(),
            env,
            ld_library_path,
            cwd,
            isolate: (req.private || force_private).then(|| private_dir.to_path_buf()),
            launcher: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Option<PathBuf>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Build the process, wired for output capture.
    pub fn command(&self) -> Result<Prepared, LaunchError> {
        let mut status = None;
        let mut cmd = match &self.isolate {
            Some(dir) => {
                let exe = match &self.launcher {
                    Some(exe) => exe.clone(),
                    None => std::env::current_exe().map_err(LaunchError::SelfExe)?,
                };
                let (reader, writer) = io::pipe().map_err(LaunchError::StatusPipe)?;
                status = Some(reader);

                let mut cmd = Command::new(exe);
                cmd.arg(LAUNCH_ROLE)
                    .arg(dir)
                    .arg(&self.program)
                    .arg(&self.arg0)
                    .args(&self.args)
                    .stdin(writer);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.program);
                cmd.arg0(&self.arg0).args(&self.args).stdin(Stdio::null());
                cmd
            }
        };

        if let Some(env) = &self.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k, v)));
        }
        if let Some(path) = &self.ld_library_path
            && !path.is_empty()
        {
            cmd.env("LD_LIBRARY_PATH", path);
        }

        cmd.current_dir(&self.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(Prepared { command: cmd, status })
    }
}

/// Library search path for staged binaries: configured directories first,
/// then every directory a staged shared object landed in.
fn staged_library_path(req: &CommandRequest, private_dir: &Path, lib_path: &[String]) -> String {
    let mut dirs: Vec<String> = Vec::new();
    let configured = library_search_path(private_dir, lib_path);
    if !configured.is_empty() {
        dirs.extend(configured.split(':').map(String::from));
    }
    for rec in &req.files {
        let is_lib = rec.kind == FileKind::Regular
            && rec.name.file_name().is_some_and(|n| n.to_string_lossy().contains(".so"));
        if !is_lib {
            continue;
        }
        if let Some(parent) = rec.name.parent() {
            let dir = rooted(private_dir, parent).display().to_string();
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }
    dirs.join(":")
}

/// Run `plan`, copying its output into `sink`, and return its exit code.
///
/// A command that cannot be started is reported into the sink and counts as
/// exit 127. Only a failed namespace setup is an error: the node can no
/// longer isolate anything and must not keep accepting work.
pub async fn run(plan: &LaunchPlan, sink: SharedSink, node_id: &str) -> Result<i32, LaunchError> {
    let program = plan.arg0.clone();
    // The command is dropped here, closing our copy of the status pipe.
    let spawned = plan.command().and_then(|Prepared { mut command, status }| {
        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;
        Ok((child, status))
    });

    let (mut child, status) = match spawned {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::warn!("cannot run {}: {}", program, e);
            report(&sink, &format!("arbor: node {node_id}: cannot run {program}: {e}\n")).await;
            return Ok(LAUNCH_FAILURE);
        }
    };

    let stdout_task = child.stdout.take().map(|pipe| tokio::spawn(pump(pipe, sink.clone())));
    let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(pump(pipe, sink.clone())));

    let setup_failure = match status {
        Some(reader) => read_status(reader).await,
        None => None,
    };
    let code = wait(&mut child, &program).await?;

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    if let (Some(path), Some(reason)) = (&plan.isolate, setup_failure) {
        return Err(LaunchError::Namespace {
            path: path.clone(),
            reason,
        });
    }

    tracing::info!("{} exited with {}", program, code);
    Ok(code)
}

async fn wait(child: &mut Child, program: &str) -> Result<i32, LaunchError> {
    let status = child.wait().await.map_err(|source| LaunchError::Wait {
        program: program.to_string(),
        source,
    })?;
    Ok(status.code().unwrap_or_else(|| {
        use std::os::unix::process::ExitStatusExt;
        128 + status.signal().unwrap_or(0)
    }))
}

/// Read the launch role's status pipe to EOF. EOF alone means the command
/// was exec'd; any text is the reason isolation failed.
async fn read_status(reader: io::PipeReader) -> Option<String> {
    let mut status = match pipe::Receiver::from_owned_fd(OwnedFd::from(reader)) {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!("launch status pipe unusable: {}", e);
            return None;
        }
    };
    let mut reason = String::new();
    if let Err(e) = status.read_to_string(&mut reason).await {
        tracing::debug!("reading launch status: {}", e);
    }
    let reason = reason.trim();
    (!reason.is_empty()).then(|| reason.to_string())
}

/// Copy a pipe into the sink until EOF.
async fn pump<R: AsyncRead + Unpin>(mut pipe: R, sink: SharedSink) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut out = sink.lock().await;
        if let Err(e) = out.write_all(&buf[..n]).await {
            tracing::debug!("output sink closed: {}", e);
            break;
        }
        let _ = out.flush().await;
    }
}

async fn report(sink: &SharedSink, msg: &str) {
    let mut out = sink.lock().await;
    let _ = out.write_all(msg.as_bytes()).await;
    let _ = out.flush().await;
}

/// Body of the `launch` role: `launch <private-dir> <program> <arg0> [args...]`.
///
/// Enters a private mount namespace, then replaces this process with the
/// command. Returns only on failure, with the exit code to use.
pub fn launch_role(args: &[String]) -> i32 {
    let [dir, program, arg0, rest @ ..] = args else {
        eprintln!("usage: arbor launch <private-dir> <program> <arg0> [args...]");
        return 2;
    };
    let dir = Path::new(dir);

    if let Err(e) = namespace::isolate(dir) {
        eprintln!("arbor launch: {e}");
        report_setup_failure(&e);
        return NAMESPACE_FAILURE;
    }

    // Replacing stdin closes the status pipe in the command.
    let err = std::process::Command::new(program)
        .arg0(arg0)
        .args(rest)
        .stdin(Stdio::null())
        .exec();
    eprintln!("arbor launch: cannot run {program}: {err}");
    if let Err(e) = namespace::unmount(dir) {
        tracing::debug!("{}", e);
    }
    LAUNCH_FAILURE
}

/// Write the failure to the status pipe the worker passed as our stdin.
fn report_setup_failure(err: &namespace::NamespaceError) {
    let written = io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .map(std::fs::File::from)
        .and_then(|mut status| writeln!(status, "{err}"));
    if let Err(e) = written {
        eprintln!("arbor launch: cannot report setup failure: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::shared_sink;
    use arbor_types::FileRecord;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl tokio::io::AsyncWrite for Capture {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_plan_staged_program() {
        let req = CommandRequest::new(vec!["/bin/echo".into(), "hi".into()]).with_files(vec![
            FileRecord::new("/bin/echo", FileKind::Regular),
            FileRecord::new("/lib/x86_64-linux-gnu/libc.so.6", FileKind::Regular),
        ]);
        let plan = LaunchPlan::for_request(&req, Path::new("/tmp/arbor-1"), &["lib".into()], false);

        assert_eq!(plan.program, PathBuf::from("/tmp/arbor-1/bin/echo"));
        assert_eq!(plan.arg0, "/bin/echo");
        assert_eq!(plan.args, vec!["hi"]);
        assert_eq!(
            plan.ld_library_path.as_deref(),
            Some("/tmp/arbor-1/lib:/tmp/arbor-1/lib/x86_64-linux-gnu")
        );
        assert_eq!(plan.cwd, PathBuf::from("/tmp/arbor-1"));
        assert!(plan.isolate.is_none());
    }

    #[test]
    fn test_plan_local_bin_and_private() {
        let mut req = CommandRequest::new(vec!["/bin/true".into()]);
        req.local_bin = true;
        req.private = true;
        req.env = vec!["A=1".into(), "junk".into()];
        let plan = LaunchPlan::for_request(&req, Path::new("/tmp/p"), &[], false);

        assert_eq!(plan.program, PathBuf::from("/bin/true"));
        assert!(plan.ld_library_path.is_none());
        assert_eq!(plan.env, Some(vec![("A".to_string(), "1".to_string())]));
        assert_eq!(plan.isolate, Some(PathBuf::from("/tmp/p")));
    }

    #[tokio::test]
    async fn test_run_copies_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = CommandRequest::new(vec!["/bin/sh".into(), "-c".into(), "echo out; echo err >&2".into()]);
        req.local_bin = true;
        let plan = LaunchPlan::for_request(&req, dir.path(), &[], false);

        let capture = Capture::default();
        let code = run(&plan, shared_sink(capture.clone()), "1").await.unwrap();
        assert_eq!(code, 0);
        let text = capture.text();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }

    #[tokio::test]
    async fn test_run_reports_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let req = CommandRequest::new(vec!["/bin/does-not-exist".into()]);
        let plan = LaunchPlan::for_request(&req, dir.path(), &[], false);

        let capture = Capture::default();
        let code = run(&plan, shared_sink(capture.clone()), "4").await.unwrap();
        assert_eq!(code, LAUNCH_FAILURE);
        assert!(capture.text().contains("node 4: cannot run /bin/does-not-exist"));
    }

    /// Stand-in for the launch role, same argument layout, no namespace.
    fn launcher(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("launch.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn isolated(dir: &Path, script: &str, launcher: PathBuf) -> LaunchPlan {
        let mut req = CommandRequest::new(vec!["/bin/sh".into(), "-c".into(), script.into()]);
        req.local_bin = true;
        req.private = true;
        LaunchPlan::for_request(&req, dir, &[], false).with_launcher(Some(launcher))
    }

    #[tokio::test]
    async fn test_isolated_exit_121_is_only_an_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let exe = launcher(dir.path(), r#"exec 0</dev/null; prog="$3"; shift 4; exec "$prog" "$@""#);
        let plan = isolated(dir.path(), "echo ran; exit 121", exe);

        let capture = Capture::default();
        let code = run(&plan, shared_sink(capture.clone()), "1").await.unwrap();
        assert_eq!(code, NAMESPACE_FAILURE);
        assert_eq!(capture.text(), "ran\n");
    }

    #[tokio::test]
    async fn test_setup_failure_comes_from_status_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let exe = launcher(dir.path(), "echo 'unshare mount namespace: EPERM' >&0; exit 3");
        let plan = isolated(dir.path(), "echo never", exe);

        let capture = Capture::default();
        match run(&plan, shared_sink(capture.clone()), "1").await {
            Err(LaunchError::Namespace { path, reason }) => {
                assert_eq!(path, dir.path());
                assert_eq!(reason, "unshare mount namespace: EPERM");
            }
            other => panic!("expected a namespace failure, got {other:?}"),
        }
        assert!(!capture.text().contains("never"));
    }

    #[test]
    fn test_launch_role_usage() {
        assert_eq!(launch_role(&["only-dir".to_string()]), 2);
    }
}
