//! The compiler-replacement shim (spec §4.11). A thin client: resolve the
//! real compiler, ship the invocation to the daemon, stream its response
//! back out, and fall back to running the compiler directly the moment
//! anything about the daemon looks untrustworthy — a broken daemon must
//! never break a build.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::protocol::{ClientJob, ClientJobResponseBody, Message, MessageCodec};

fn default_socket_path() -> PathBuf {
    std::env::var("PLAST_SOCKET_FILE").map(PathBuf::from).unwrap_or_else(|_| {
        directories::UserDirs::new()
            .map(|d| d.home_dir().join(".plastd.sock"))
            .unwrap_or_else(|| PathBuf::from("/tmp/.plastd.sock"))
    })
}

/// Recovers the real compiler name from `argv[0]` (the shim is installed
/// under e.g. `cc`, `gcc`, `clang++`), or `PLAST_COMPILER` if set.
fn real_compiler_name(argv0: &OsString) -> OsString {
    std::env::var_os("PLAST_COMPILER").unwrap_or_else(|| {
        PathBuf::from(argv0).file_name().map(OsString::from).unwrap_or_else(|| argv0.clone())
    })
}

/// Runs the compiler directly, never returning on success (spec §4.11
/// fallback path). Only reached when the daemon is unreachable, errors
/// mid-stream, or reports an infrastructure failure.
fn exec_fallback(compiler: &std::path::Path, args: &[OsString]) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(compiler).args(args).exec();
        warn!("fallback exec of {} failed: {}", compiler.display(), err);
        127
    }
    #[cfg(not(unix))]
    {
        match std::process::Command::new(compiler).args(args).status() {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => {
                warn!("fallback execution of {} failed: {}", compiler.display(), e);
                127
            }
        }
    }
}

/// Runs one shim invocation end to end, returning the process exit status.
pub async fn run(argv: Vec<OsString>) -> i32 {
    let Some(argv0) = argv.first().cloned() else { return 1 };
    let args = &argv[1..];
    let compiler_name = real_compiler_name(&argv0);

    let resolved = match which::which(&compiler_name) {
        Ok(path) => path,
        Err(e) => {
            warn!("could not resolve compiler {:?}: {}", compiler_name, e);
            return 127;
        }
    };

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let env: Vec<(String, String)> = std::env::vars().collect();
    let job = ClientJob {
        argv: std::iter::once(compiler_name.to_string_lossy().into_owned())
            .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect(),
        resolved_compiler: resolved.clone(),
        env,
        cwd,
    };

    match try_daemon(job).await {
        Ok(status) => status,
        Err(e) => {
            debug!("falling back to direct execution: {}", e);
            exec_fallback(&resolved, args)
        }
    }
}

async fn try_daemon(job: ClientJob) -> std::io::Result<i32> {
    let stream = UnixStream::connect(default_socket_path()).await?;
    let mut framed = Framed::new(stream, MessageCodec::default());
    framed.send(Message::ClientJob(job)).await?;

    let stdout = std::io::stdout();
    let stderr = std::io::stderr();

    while let Some(message) = framed.next().await {
        match message? {
            Message::ClientJobResponse(resp) => match resp.body {
                ClientJobResponseBody::OutputChunk { stdout: out, stderr: err } => {
                    if !out.is_empty() {
                        let _ = stdout.lock().write_all(&out);
                    }
                    if !err.is_empty() {
                        let _ = stderr.lock().write_all(&err);
                    }
                }
                ClientJobResponseBody::Finished { exit_status, infrastructure_failure } => {
                    if infrastructure_failure {
                        return Err(std::io::Error::new(std::io::ErrorKind::Other, "daemon reported an infrastructure failure"));
                    }
                    return Ok(exit_status);
                }
            },
            other => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, format!("unexpected message from daemon: {:?}", other)));
            }
        }
    }
    Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "daemon closed the connection without finishing the job"))
}
