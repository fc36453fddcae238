//! SSH local-forward tunnel lifecycle.
//!
//! One tunnel per session: a private temp directory holds the forwarded API
//! socket and the ssh control socket, an ssh master runs in the background,
//! and teardown goes through the control channel. Host-key verification is
//! off; the targets are ephemeral test machines that get reimaged between
//! runs.

use crate::config::TunnelConfig;
use crate::endpoint::{Auth, Credentials, Endpoint};
use crate::error::{DutError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// A live forward: the ssh master process plus the private directory holding
/// its sockets.
pub struct TunnelHandle {
    temp_dir: Option<TempDir>,
    local_socket: PathBuf,
    control_socket: PathBuf,
    host: String,
    child: Child,
}

impl TunnelHandle {
    /// Local Unix socket standing in for the remote control socket.
    pub fn local_socket(&self) -> &Path {
        &self.local_socket
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("local_socket", &self.local_socket)
            .field("host", &self.host)
            .finish()
    }
}

/// Opens and closes SSH local forwards.
pub struct TunnelManager;

impl TunnelManager {
    /// Open a forward to `endpoint` and wait for the local socket.
    pub async fn open(endpoint: &Endpoint, credentials: &Credentials) -> Result<TunnelHandle> {
        Self::open_with_timeout(endpoint, credentials, TunnelConfig::SOCKET_WAIT_TIMEOUT).await
    }

    /// As [`TunnelManager::open`], with an explicit readiness timeout.
    pub async fn open_with_timeout(
        endpoint: &Endpoint,
        credentials: &Credentials,
        wait: Duration,
    ) -> Result<TunnelHandle> {
        let temp_dir =
            TempDir::new().map_err(|e| DutError::io_with_path(e, std::env::temp_dir()))?;
        let local_socket = temp_dir.path().join("api.sock");
        let control_socket = temp_dir.path().join("ssh.sock");

        clear_stale(&control_socket, &local_socket).await;

        // The key only ever exists as a transient file; ssh wants a path,
        // not an environment variable or a pipe.
        let key_file = match &credentials.auth {
            Auth::Key(pem) => {
                let mut file = tempfile::NamedTempFile::new_in(temp_dir.path())
                    .map_err(|e| DutError::io_with_path(e, temp_dir.path()))?;
                file.write_all(pem.as_bytes())
                    .and_then(|_| file.flush())
                    .map_err(|e| DutError::io_with_path(e, file.path()))?;
                Some(file)
            }
            Auth::Password(_) => None,
        };

        let argv = forward_args(
            endpoint,
            credentials,
            key_file.as_ref().map(|f| f.path()),
            &control_socket,
            &local_socket,
        );
        debug!("Starting forward for {endpoint}");
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DutError::Connection {
                message: format!("spawning {}: {e}", argv[0]),
                source: Some(e),
            })?;

        if let Err(e) = wait_for_socket(
            &local_socket,
            &mut child,
            wait,
            TunnelConfig::SOCKET_POLL_INTERVAL,
        )
        .await
        {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        // Socket up means ssh has read the key; the transient file can go.
        drop(key_file);

        Ok(TunnelHandle {
            temp_dir: Some(temp_dir),
            local_socket,
            control_socket,
            host: endpoint.host.clone(),
            child,
        })
    }

    /// Tear the forward down: explicit exit over the control channel
    /// (non-fatal when the master is already gone), reap the process, delete
    /// the temp directory.
    pub async fn close(mut handle: TunnelHandle) -> Result<()> {
        let exit = Command::new("ssh")
            .arg("-S")
            .arg(&handle.control_socket)
            .args(["-O", "exit", &handle.host])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match exit {
            Ok(status) if status.success() => debug!("Forward for {} asked to exit", handle.host),
            Ok(status) => warn!("Tunnel exit request returned {status}"),
            Err(e) => warn!("Tunnel exit request failed: {e}"),
        }

        match tokio::time::timeout(TunnelConfig::EXIT_GRACE, handle.child.wait()).await {
            Ok(Ok(status)) => debug!("Forward process exited: {status}"),
            Ok(Err(e)) => warn!("Reaping forward process: {e}"),
            Err(_) => {
                let _ = handle.child.start_kill();
                let _ = handle.child.wait().await;
            }
        }

        if let Some(dir) = handle.temp_dir.take() {
            if let Err(e) = dir.close() {
                // The master unlinks its sockets on exit; losing that race
                // is fine.
                debug!("Temp dir cleanup raced: {e}");
            }
        }
        Ok(())
    }
}

/// Argument vector for the forward process.
///
/// Key auth points `-i` at the transient key file; password auth wraps the
/// whole command in `sshpass`. The remote command is a plain sleep: once the
/// engine connects through the forward, ssh stays up until the control
/// channel says exit.
fn forward_args(
    endpoint: &Endpoint,
    credentials: &Credentials,
    key_path: Option<&Path>,
    control_socket: &Path,
    local_socket: &Path,
) -> Vec<String> {
    let mut argv: Vec<String> = Vec::new();
    if let Auth::Password(password) = &credentials.auth {
        argv.extend(["sshpass".into(), "-p".into(), password.clone()]);
    }
    argv.extend([
        "ssh".into(),
        "-S".into(),
        control_socket.display().to_string(),
        "-M".into(),
    ]);
    if let Some(key) = key_path {
        argv.extend(["-i".into(), key.display().to_string()]);
    }
    argv.extend([
        // LogLevel silences the "Permanently added" host-key chatter.
        "-o".into(),
        "LogLevel=ERROR".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "ExitOnForwardFailure=yes".into(),
        "-L".into(),
        format!(
            "{}:{}",
            local_socket.display(),
            endpoint.socket_path.display()
        ),
        "-p".into(),
        endpoint.port.to_string(),
        format!("{}@{}", credentials.username, endpoint.host),
        "sleep".into(),
        TunnelConfig::FORWARD_HOLD_SECS.to_string(),
    ]);
    argv
}

/// Ask any stale master using these paths to exit, then unlink the socket
/// files so readiness detection starts from a clean slate.
async fn clear_stale(control_socket: &Path, local_socket: &Path) {
    if tokio::fs::try_exists(control_socket).await.unwrap_or(false) {
        let _ = Command::new("ssh")
            .arg("-S")
            .arg(control_socket)
            .args(["-O", "exit", "0.0.0.0"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        tokio::time::sleep(TunnelConfig::STALE_EXIT_PAUSE).await;
        let _ = tokio::fs::remove_file(control_socket).await;
    }
    let _ = tokio::fs::remove_file(local_socket).await;
}

/// Poll for the forwarded socket to appear, watching the forward process.
///
/// A refused or misconfigured forward makes ssh exit long before the wait
/// budget runs out, so a dead child fails the wait immediately instead of
/// burning the whole timeout.
async fn wait_for_socket(
    path: &Path,
    child: &mut Child,
    wait: Duration,
    interval: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            return Err(DutError::connection(format!(
                "forward process exited ({status}) before socket {} appeared",
                path.display()
            )));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DutError::connection(format!(
                "forwarded socket {} has not appeared within {wait:?}",
                path.display()
            )));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn endpoint() -> Endpoint {
        Endpoint::new("10.0.1.5", 22, "/run/engine/api.sock")
    }

    /// A child that stays alive for the duration of a test.
    fn idle_child() -> Child {
        Command::new("sleep")
            .arg("5")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_forward_args_with_key() {
        let argv = forward_args(
            &endpoint(),
            &Credentials::with_key("testuser", "-----BEGIN KEY-----"),
            Some(Path::new("/tmp/run/key")),
            Path::new("/tmp/run/ssh.sock"),
            Path::new("/tmp/run/api.sock"),
        );

        assert_eq!(argv[0], "ssh");
        let joined = argv.join(" ");
        assert!(joined.contains("-S /tmp/run/ssh.sock -M"));
        assert!(joined.contains("-i /tmp/run/key"));
        assert!(joined.contains("-o StrictHostKeyChecking=no"));
        assert!(joined.contains("-o ExitOnForwardFailure=yes"));
        assert!(joined.contains("-L /tmp/run/api.sock:/run/engine/api.sock"));
        assert!(joined.contains("-p 22 testuser@10.0.1.5"));
        assert!(joined.ends_with("sleep 30"));
        assert!(!joined.contains("sshpass"));
    }

    #[test]
    fn test_forward_args_with_password_helper() {
        let argv = forward_args(
            &endpoint(),
            &Credentials::with_password("testuser", "hunter2"),
            None,
            Path::new("/tmp/run/ssh.sock"),
            Path::new("/tmp/run/api.sock"),
        );

        assert_eq!(&argv[..4], &["sshpass", "-p", "hunter2", "ssh"]);
        assert!(!argv.contains(&"-i".to_string()));
    }

    #[tokio::test]
    async fn test_wait_for_socket_present() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("api.sock");
        std::fs::write(&path, b"").unwrap();

        let mut child = idle_child();
        wait_for_socket(
            &path,
            &mut child,
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_socket_appearing_late() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("api.sock");
        let create_at = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&create_at, b"").unwrap();
        });

        let mut child = idle_child();
        wait_for_socket(
            &path,
            &mut child,
            Duration::from_secs(2),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_socket_never_appearing_is_a_connection_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("api.sock");

        let mut child = idle_child();
        let err = wait_for_socket(
            &path,
            &mut child,
            Duration::from_millis(150),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(err.is_connection());
        assert!(err.to_string().contains("has not appeared"));
    }

    #[tokio::test]
    async fn test_wait_for_socket_fails_fast_when_forward_dies() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("api.sock");

        let mut child = Command::new("true").spawn().unwrap();
        let started = std::time::Instant::now();
        let err = wait_for_socket(
            &path,
            &mut child,
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(err.is_connection());
        assert!(err.to_string().contains("exited"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_open_without_a_forward_is_a_connection_error() {
        // A port that was just bound and released refuses connections, so
        // the forward either fails to spawn or dies right away. Neither
        // outcome should leave open() hanging for the full socket wait.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::new("127.0.0.1", port, "/run/engine/api.sock");
        let creds = Credentials::with_key("testuser", "-----BEGIN KEY-----");

        let err = TunnelManager::open_with_timeout(&endpoint, &creds, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_clear_stale_unlinks_leftovers() {
        let tmp = TempDir::new().unwrap();
        let control = tmp.path().join("ssh.sock");
        let local = tmp.path().join("api.sock");
        std::fs::write(&control, b"").unwrap();
        std::fs::write(&local, b"").unwrap();

        clear_stale(&control, &local).await;

        assert!(!control.exists());
        assert!(!local.exists());
    }
}
