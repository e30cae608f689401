//! Local helper programs (`docker`, `vagrant`, `ssh-keygen`).

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::ToolError;

fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a local program to completion and return its standard output.
///
/// # Errors
///
/// Returns [`ToolError`] if the program cannot be started or exits non-zero.
pub(crate) async fn run_tool<I, S>(
    program: &str,
    args: I,
    cwd: Option<&Path>,
) -> Result<String, ToolError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let command = command_line(program, &args);
    debug!(command = %command, "Running local tool");

    let mut cmd = Command::new(program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await.map_err(|e| ToolError {
        command: command.clone(),
        exit_code: None,
        stderr: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(ToolError {
            command,
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
