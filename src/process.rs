//! Spawning helpers shared by the exec runner and `sanity exec`

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

/// `CREATE_NO_WINDOW` process creation flag
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

fn exit_status_code_parts(code: Option<i32>, _signal: Option<i32>) -> i32 {
    if let Some(code) = code {
        return code;
    }
    #[cfg(unix)]
    {
        if let Some(signal) = _signal {
            return 128 + signal;
        }
    }
    -1
}

/// Numeric exit code for reporting: 128+signal for signal deaths on Unix,
/// -1 when the platform gives nothing.
pub(crate) fn exit_status_code(status: &std::process::ExitStatus) -> i32 {
    let code = status.code();
    #[cfg(unix)]
    let signal = status.signal();
    #[cfg(not(unix))]
    let signal = None;
    exit_status_code_parts(code, signal)
}

/// Keep console programs from flashing a window when spawned from a GUI
/// host or a scheduled task.
pub(crate) fn hide_console_window(cmd: &mut Command) {
    #[cfg(windows)]
    {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(windows))]
    {
        let _ = cmd;
    }
}

/// Which pipe of a child failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum OutputWaitError {
    #[error("error reading {}: {source}", .stream.as_str())]
    Read {
        stream: OutputStream,
        source: std::io::Error,
    },
    #[error("error waiting for process: {0}")]
    Wait(#[source] std::io::Error),
}

async fn read_lossy<R>(pipe: Option<R>, stream: OutputStream) -> Result<String, OutputWaitError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .await
        .map_err(|source| OutputWaitError::Read { stream, source })?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Drain both pipes concurrently, then reap the child
///
/// Windows console tools write in the OEM code page, so output is decoded lossily.
pub(crate) async fn wait_for_child_output(
    child: &mut Child,
) -> Result<(String, String, std::process::ExitStatus), OutputWaitError> {
    let stdout_fut = read_lossy(child.stdout.take(), OutputStream::Stdout);
    let stderr_fut = read_lossy(child.stderr.take(), OutputStream::Stderr);

    let (stdout, stderr) = match tokio::try_join!(stdout_fut, stderr_fut) {
        Ok(result) => result,
        Err(e) => {
            let _ = child.kill().await;
            return Err(e);
        }
    };

    let status = child
        .wait()
        .await
        .map_err(OutputWaitError::Wait)?;

    Ok((stdout, stderr, status))
}
