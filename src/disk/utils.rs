use log::{error, trace};
use std::ffi::OsStr;
use std::io::{BufRead, BufReader};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;

/// Failure of an external command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` failed with {status}{}", stderr_summary(.stderr))]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// First non-empty line of stderr, prefixed for appending to a message.
fn stderr_summary(stderr: &str) -> String {
    match stderr.lines().map(str::trim).find(|line| !line.is_empty()) {
        Some(line) => format!(": {}", line),
        None => String::new(),
    }
}

impl CommandError {
    /// Captured stderr of the failed command (empty if it never started).
    pub fn stderr(&self) -> &str {
        match self {
            Self::Spawn { .. } => "",
            Self::Failed { stderr, .. } => stderr.as_str(),
        }
    }

    /// Exit code of the failed command, if it ran to completion.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Spawn { .. } => None,
            Self::Failed { status, .. } => status.code(),
        }
    }
}

/// Run command returning decoded stdout and stderr.
pub fn run_command<I, S>(commands: I) -> Result<(String, String), CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let commands = commands
        .into_iter()
        .map(|s| s.as_ref().to_os_string())
        .collect::<Vec<_>>();
    let program = &commands[0];
    let program_name = program.to_string_lossy().to_string();
    let args = &commands[1..];

    trace!(
        "running command: '{} {}'",
        program_name,
        args.join(OsStr::new(" ")).to_string_lossy()
    );

    let spawn_err = |source| CommandError::Spawn {
        program: program_name.clone(),
        source,
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    // Log stdout and stderr of child process from separate threads
    let stdout = child.stdout.take().ok_or_else(|| {
        spawn_err(std::io::Error::other("failed to capture stdout"))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        spawn_err(std::io::Error::other("failed to capture stderr"))
    })?;

    let (stdout_tx, stdout_rx) = mpsc::channel::<String>();
    let (stderr_tx, stderr_rx) = mpsc::channel::<String>();
    let stdout_log_target = program_name.clone();
    let stderr_log_target = program_name.clone();

    let stdout_thread = thread::spawn(move || {
        BufReader::new(stdout)
            .lines()
            .map_while(Result::ok)
            .for_each(|line| {
                trace!(target: stdout_log_target.as_str(), "{}", line);
                // receiver lives until both threads are joined
                let _ = stdout_tx.send(line);
            });
    });

    let stderr_thread = thread::spawn(move || {
        BufReader::new(stderr)
            .lines()
            .map_while(Result::ok)
            .for_each(|line| {
                trace!(target: stderr_log_target.as_str(), "{}", line);
                let _ = stderr_tx.send(line);
            });
    });

    let exit_status = child.wait().map_err(spawn_err)?;

    let _ = stdout_thread.join();
    let _ = stderr_thread.join();

    let stdout = stdout_rx.into_iter().collect::<Vec<String>>().join("\n");
    let stderr = stderr_rx.into_iter().collect::<Vec<String>>().join("\n");

    if exit_status.success() {
        Ok((stdout, stderr))
    } else {
        stderr
            .lines()
            .for_each(|line| error!(target: program_name.as_str(), "{}", line));
        Err(CommandError::Failed {
            program: program_name,
            status: exit_status,
            stderr,
        })
    }
}
