//! Local client process driver shared by the transports.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use super::{CommandOutput, OutputPolicy, OutputSink, RunOptions, Stream, TransportError};
use crate::node::Node;

async fn pump<R>(
    reader: R,
    node: &Node,
    stream: Stream,
    sink: Option<&dyn OutputSink>,
) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut captured = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        if let Some(sink) = sink {
            sink.line(node, stream, line.trim_end_matches(['\n', '\r']));
        }
        captured.push_str(&line);
    }
    Ok(captured)
}

/// Run a client program (`ssh`, `scp`, `docker`) on behalf of `node`.
///
/// Output is read line by line from both streams concurrently so a chatty
/// stderr cannot stall stdout. When the deadline passes the child is killed
/// and [`TransportError::Timeout`] is returned.
pub(super) async fn run_client(
    mut cmd: Command,
    program: &str,
    node: &Node,
    display: &str,
    sink: &Arc<dyn OutputSink>,
    opts: &RunOptions,
) -> Result<CommandOutput, TransportError> {
    let started = Instant::now();
    let deadline = opts.effective_deadline(started);

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TransportError::Spawn {
            node: node.to_string(),
            program: program.to_string(),
            source,
        })?;

    let io_error = |source| TransportError::Io {
        node: node.to_string(),
        source,
    };
    let missing_pipe = || io_error(std::io::Error::other("child output pipe was not captured"));
    let stdout = child.stdout.take().ok_or_else(missing_pipe)?;
    let stderr = child.stderr.take().ok_or_else(missing_pipe)?;

    let sink = match opts.output {
        OutputPolicy::Capture => None,
        OutputPolicy::LogAndCapture => Some(sink.as_ref()),
    };

    let work = async {
        let (out, err, status) = tokio::join!(
            pump(stdout, node, Stream::Stdout, sink),
            pump(stderr, node, Stream::Stderr, sink),
            child.wait(),
        );
        Ok::<_, std::io::Error>((out?, err?, status?))
    };

    let finished = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, work)
            .await
            .map_err(|_| TransportError::Timeout {
                node: node.to_string(),
                command: display.to_string(),
                elapsed: started.elapsed(),
            })?,
        None => work.await,
    };
    let (stdout, stderr, status) = finished.map_err(io_error)?;

    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}
