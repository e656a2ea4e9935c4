use std::collections::HashMap;
use std::io;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use anyhow::{anyhow, Context, Result};
use log::debug;

use crate::docker::tarball::ImageTarball;
use crate::http::ByteCountCallback;

pub const DEFAULT_DOCKER_EXECUTABLE: &str = "docker";

/// Calls the `docker` command line tool.
#[derive(Debug, Clone)]
pub struct DockerClient {
    executable: PathBuf,
    environment: HashMap<String, String>,
}

impl Default for DockerClient {
    fn default() -> Self {
        DockerClient::new(DEFAULT_DOCKER_EXECUTABLE, HashMap::new())
    }
}

impl DockerClient {
    pub fn new(executable: impl Into<PathBuf>, environment: HashMap<String, String>) -> DockerClient {
        DockerClient {
            executable: executable.into(),
            environment,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// True when `docker` can be started at all.
    pub fn is_available(&self) -> bool {
        self.command().arg("version").stdout(Stdio::null()).stderr(Stdio::null()).status().is_ok()
    }

    /// Streams the tarball into `docker load` and returns what docker printed.
    pub fn load(&self, tarball: &ImageTarball, written: Option<ByteCountCallback>) -> Result<String> {
        let mut child = self
            .command()
            .arg("load")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {}", self.executable.display()))?;

        let mut write_result = Ok(());
        if let Some(stdin) = child.stdin.take() {
            let mut stdin = CountingWriter { inner: stdin, written };
            write_result = tarball.write_to(&mut stdin).and_then(|_| stdin.flush());
        }
        let output = child.wait_with_output().context("failed to wait for docker load")?;
        let output = self.check_output("load", output)?;
        match write_result {
            // docker closed its end early; its exit status above already said why if it failed.
            Err(err) if err.kind() != ErrorKind::BrokenPipe => Err(err).context("failed to write the image tarball to docker load"),
            _ => Ok(output),
        }
    }

    /// `docker tag <source> <target>`
    pub fn tag(&self, source: &str, target: &str) -> Result<()> {
        let output = self
            .command()
            .args(["tag", source, target])
            .output()
            .with_context(|| format!("failed to start {}", self.executable.display()))?;
        self.check_output("tag", output)?;
        Ok(())
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.executable);
        command.envs(&self.environment);
        command
    }

    fn check_output(&self, subcommand: &str, output: Output) -> Result<String> {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("'docker {}' command failed with {}: {}", subcommand, output.status, stderr.trim()));
        }
        debug!("docker {}: {}", subcommand, stdout);
        Ok(stdout)
    }
}

struct CountingWriter<W> {
    inner: W,
    written: Option<ByteCountCallback>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        if let Some(written) = &self.written {
            written(count as u64);
        }
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
