//! Async subprocess runner for the external toolchains
//!
//! Compilers, signers and attestation helpers are all awaited on the event
//! loop. Argv is logged at debug verbosity; stderr is suppressed unless debug
//! logging is enabled; a non-zero exit becomes [`ProcessRunError`].

use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{Error, Result};

/// External command exited non-zero
#[derive(Debug, Error)]
#[error("command {args:?} exited with code {code}")]
pub struct ProcessRunError {
    pub args: Vec<String>,
    pub code: i32,
}

fn stderr_stdio() -> Stdio {
    if tracing::enabled!(tracing::Level::DEBUG) {
        Stdio::inherit()
    } else {
        Stdio::null()
    }
}

fn command(args: &[String], env: &[(String, String)]) -> Command {
    debug!("{}", args.join(" "));

    let mut cmd = Command::new(&args[0]);
    cmd.args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr_stdio());
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd
}

fn check_status(args: &[String], code: Option<i32>) -> Result<()> {
    match code {
        Some(0) => Ok(()),
        code => Err(Error::Build(ProcessRunError {
            args: args.to_vec(),
            code: code.unwrap_or(-1),
        })),
    }
}

/// Run a command and wait for it to finish.
pub async fn run(args: &[String]) -> Result<()> {
    let status = command(args, &[]).status().await?;
    check_status(args, status.code())
}

/// Run a command with stdout redirected to `output`.
pub async fn run_redirect(args: &[String], output: &Path) -> Result<()> {
    let file = std::fs::File::create(output)?;
    let status = command(args, &[]).stdout(file).status().await?;
    check_status(args, status.code())
}

/// Run a command with extra environment variables, capturing stdout.
pub async fn run_output(args: &[String], env: &[(String, String)]) -> Result<Vec<u8>> {
    let out = command(args, env)
        .stdout(Stdio::piped())
        .output()
        .await?;
    check_status(args, out.status.code())?;
    Ok(out.stdout)
}

/// Spawn a command in the background, returning a handle for later kill.
pub async fn run_background(args: &[String]) -> Result<Child> {
    debug!("{} &", args.join(" "));

    let child = Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr_stdio())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

/// Run a command line through the shell.
pub async fn run_shell(cmdline: &str) -> Result<()> {
    debug!("{cmdline}");

    let status = Command::new("sh")
        .arg("-c")
        .arg(cmdline)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr_stdio())
        .status()
        .await?;
    check_status(&["sh".into(), "-c".into(), cmdline.into()], status.code())
}

/// Generate `length` random bytes from the OS RNG.
pub fn generate_key(length: usize) -> Vec<u8> {
    let mut key = vec![0u8; length];
    OsRng.fill_bytes(&mut key);
    key
}

/// Convenience for building argv vectors.
pub fn argv<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}
