//! Local child-process transport substrate: talks to `git-upload-pack` /
//! `git-receive-pack` (or the umbrella `git` binary) over piped stdio.
//!
//! Follows `lockframe_client::transport`'s shape of wrapping an async
//! stream and bridging it into the shared framed-packet seam, adapted from
//! a QUIC stream to a spawned child process's stdio pipes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use gitmirror_core::{ConnectionError, FramedStream, PacketTransport, ServiceTransport};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Errors specific to resolving or spawning the local git service binary.
#[derive(Error, Debug)]
pub enum FileTransportError {
    /// The given path is not a directory containing an `objects`
    /// subdirectory, so it isn't a git repository this transport will open.
    #[error("{0:?} does not look like a git repository (no objects/ subdirectory)")]
    NotARepository(PathBuf),

    /// Neither the dedicated binary nor the umbrella binary could be
    /// spawned.
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        /// The binary that failed to spawn.
        binary: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

impl From<FileTransportError> for ConnectionError {
    fn from(err: FileTransportError) -> Self {
        ConnectionError::TransportOpenError(err.to_string())
    }
}

/// Which git service to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceName {
    /// The fetch-side service.
    UploadPack,
    /// The push-side service.
    ReceivePack,
}

impl ServiceName {
    fn dedicated_binary(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    fn umbrella_subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    /// The `GIT_PROTOCOL=version=<n>` value this service is opened with:
    /// v2 for fetch, v1 for push, per the design doc's transport section.
    #[must_use]
    pub fn preferred_protocol_version(self) -> u8 {
        match self {
            Self::UploadPack => 2,
            Self::ReceivePack => 1,
        }
    }
}

/// A duplex byte stream over a child process's stdio pipes.
pub type ChildDuplex = tokio::io::Join<ChildStdout, ChildStdin>;

/// A spawned local service: its framed stream plus the handles needed to
/// close it down cleanly.
pub struct OpenService {
    /// The packet-framed stream to drive a connection over.
    pub stream: FramedStream<ChildDuplex>,
    child: Child,
    stderr_task: JoinHandle<()>,
}

impl OpenService {
    /// Close the service: terminate the child if it's still running, await
    /// its exit, then cancel and await the stderr drainer.
    pub async fn close(mut self) -> Result<(), ConnectionError> {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.start_kill();
        }
        let _ = self.child.wait().await;
        self.stderr_task.abort();
        let _ = self.stderr_task.await;
        Ok(())
    }
}

#[async_trait]
impl PacketTransport for OpenService {
    async fn write_packet(&mut self, packet: &gitmirror_core::OwnedPacket) -> Result<(), ConnectionError> {
        self.stream.write_packet(packet).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_raw(bytes).await
    }

    async fn flush(&mut self) -> Result<(), ConnectionError> {
        self.stream.flush().await
    }

    async fn read_packet(&mut self) -> Result<Option<gitmirror_core::OwnedPacket>, ConnectionError> {
        self.stream.read_packet().await
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        self.stream.read_raw(buf).await
    }
}

/// The local child-process transport substrate, scoped to one repository
/// path on disk.
#[derive(Debug)]
pub struct FileTransport {
    repo_path: PathBuf,
}

impl FileTransport {
    /// True if `url` uses the `file://` scheme this transport handles.
    #[must_use]
    pub fn can_handle(url: &url::Url) -> bool {
        url.scheme() == "file"
    }

    /// Build a transport for the repository at `url`'s path.
    ///
    /// # Errors
    ///
    /// [`FileTransportError::NotARepository`] if the path doesn't contain
    /// an `objects` subdirectory.
    pub fn new(url: &url::Url) -> Result<Self, FileTransportError> {
        let repo_path = PathBuf::from(url.path());
        validate_repository(&repo_path)?;
        Ok(Self { repo_path })
    }

    /// Spawn the requested service against this transport's repository.
    pub async fn open_service(&self, service: ServiceName) -> Result<OpenService, ConnectionError> {
        let mut child = spawn(service, &self.repo_path).await?;

        let stdout = child.stdout.take().expect("child spawned with piped stdout");
        let stdin = child.stdin.take().expect("child spawned with piped stdin");
        let stderr = child.stderr.take().expect("child spawned with piped stderr");

        let stderr_task = tokio::spawn(drain_stderr(stderr));

        let stream = FramedStream::new(tokio::io::join(stdout, stdin));
        Ok(OpenService { stream, child, stderr_task })
    }
}

#[async_trait]
impl ServiceTransport for FileTransport {
    fn can_handle(&self, url: &str) -> bool {
        url::Url::parse(url).is_ok_and(|u| Self::can_handle(&u))
    }

    async fn open_fetch(&self) -> Result<Box<dyn PacketTransport>, ConnectionError> {
        Ok(Box::new(self.open_service(ServiceName::UploadPack).await?))
    }

    async fn open_push(&self) -> Result<Box<dyn PacketTransport>, ConnectionError> {
        Ok(Box::new(self.open_service(ServiceName::ReceivePack).await?))
    }
}

fn validate_repository(path: &Path) -> Result<(), FileTransportError> {
    if !path.join("objects").is_dir() {
        return Err(FileTransportError::NotARepository(path.to_path_buf()));
    }
    Ok(())
}

async fn spawn(service: ServiceName, repo_path: &Path) -> Result<Child, FileTransportError> {
    let env_value = format!("version={}", service.preferred_protocol_version());

    let dedicated = service.dedicated_binary();
    match Command::new(dedicated)
        .arg(repo_path)
        .env("GIT_PROTOCOL", &env_value)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => Ok(child),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Command::new("git")
            .arg(service.umbrella_subcommand())
            .arg(repo_path)
            .env("GIT_PROTOCOL", &env_value)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FileTransportError::Spawn { binary: "git".to_string(), source }),
        Err(source) => Err(FileTransportError::Spawn { binary: dedicated.to_string(), source }),
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::error!(child_stderr = %line, "local service stderr"),
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%err, "failed reading child stderr");
                break;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_versions_match_design() {
        assert_eq!(ServiceName::UploadPack.preferred_protocol_version(), 2);
        assert_eq!(ServiceName::ReceivePack.preferred_protocol_version(), 1);
    }

    #[test]
    fn rejects_non_repository_path() {
        let dir = std::env::temp_dir().join("gitmirror-file-transport-test-not-a-repo");
        let _ = std::fs::create_dir_all(&dir);
        let err = validate_repository(&dir).unwrap_err();
        assert!(matches!(err, FileTransportError::NotARepository(_)));
        let _ = std::fs::remove_dir(&dir);
    }

    #[test]
    fn can_handle_only_file_scheme() {
        assert!(FileTransport::can_handle(&url::Url::parse("file:///srv/repo.git").unwrap()));
        assert!(!FileTransport::can_handle(&url::Url::parse("https://example.com/repo.git").unwrap()));
    }
}
