use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::{DuplexStream, SharedWriter};

/// How to launch a peer program with piped stdio.
#[derive(Debug, Clone, Default)]
pub struct ChildCommand {
    /// Program to run. Resolved against `PATH` when it has no directory part.
    pub program: PathBuf,
    /// Arguments, in order.
    pub args: Vec<OsString>,
    /// Extra environment variables.
    pub env: Vec<(OsString, OsString)>,
    /// Start from an empty environment instead of inheriting ours.
    pub clear_env: bool,
    /// Working directory for the child.
    pub dir: Option<PathBuf>,
}

/// Resolve `program` to an executable path.
///
/// Paths with a directory component are taken as-is; bare names are looked
/// up on `PATH`.
pub fn resolve_program(program: &Path) -> Result<PathBuf> {
    if program.components().count() > 1 {
        return Ok(program.to_path_buf());
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| TransportError::ProgramNotFound {
            name: program.display().to_string(),
        })
}

/// Spawn `command` with stdin and stdout piped, stderr inherited.
///
/// The returned stream writes to the child's stdin and reads its stdout.
/// Its closer drops the stdin pipe, which is the child's cue to exit.
pub fn spawn_piped(command: &ChildCommand) -> Result<(Child, DuplexStream)> {
    let program = resolve_program(&command.program)?;

    let mut cmd = Command::new(&program);
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if command.clear_env {
        cmd.env_clear();
    }
    cmd.envs(command.env.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str())));
    if let Some(dir) = &command.dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
        program: program.clone(),
        source,
    })?;
    debug!(program = %program.display(), pid = child.id(), args = ?display_args(&command.args), "spawned peer");

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(TransportError::MissingPipe("stdio"));
    };

    let writer = SharedWriter::new(stdin);
    let closer = writer.closer();
    let stream = DuplexStream::from_parts(stdout, writer, Some(Box::new(closer))).with_kind("child");
    Ok((child, stream))
}

fn display_args(args: &[OsString]) -> Vec<&OsStr> {
    args.iter().map(OsString::as_os_str).collect()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
