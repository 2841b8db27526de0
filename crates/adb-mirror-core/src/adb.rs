//! Thin async wrapper over the debug-tool CLI surface (`devices -l`,
//! `shell`, `pair`, `connect`, `disconnect`, `track-devices`, `push`,
//! `install`, `forward`). Mirrors the teacher's dedicated debug-tool
//! module: every call is a `tokio::process::Command` invocation guarded
//! by a timeout, never a direct libusb/adb-server protocol call.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::errors::{CoreError, LaunchError};

/// Per-query timeout for read-only metadata probes (spec.md §5).
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-query timeout for write-side settings changes (spec.md §5).
pub const SETTINGS_TIMEOUT: Duration = Duration::from_secs(10);
/// Hard deadline for the pairing handshake (spec.md §4.3).
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the debug-tool binary; resolved once at construction and
/// reused for every invocation.
#[derive(Debug, Clone)]
pub struct AdbTool {
    binary: String,
}

impl AdbTool {
    /// `path` overrides the binary; `None` resolves from `PATH` at spawn
    /// time (the OS does this for us when we exec a bare name).
    pub fn new(path: Option<String>) -> Self {
        AdbTool {
            binary: path.unwrap_or_else(|| "adb".to_string()),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// `adb devices -l`, returning raw stdout for the caller to parse.
    pub async fn devices_long(&self) -> Result<String, CoreError> {
        self.run(&["devices", "-l"], METADATA_TIMEOUT).await
    }

    /// `adb -s <serial> shell <cmd...>` with a caller-supplied timeout.
    pub async fn shell(
        &self,
        serial: &str,
        args: &[&str],
        timeout_dur: Duration,
    ) -> Result<String, CoreError> {
        let mut full = vec!["-s", serial, "shell"];
        full.extend_from_slice(args);
        self.run(&full, timeout_dur).await
    }

    /// `adb push <local> <remote>`.
    pub async fn push(&self, local: &str, remote: &str) -> Result<(), CoreError> {
        self.run(&["push", local, remote], SETTINGS_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// `adb install <apk>`.
    pub async fn install(&self, apk_path: &str) -> Result<(), CoreError> {
        self.run(&["install", apk_path], SETTINGS_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// `adb -s <serial> forward tcp:<localport> localabstract:<name>`.
    pub async fn forward(&self, serial: &str, local_port: u16, name: &str) -> Result<(), CoreError> {
        let local = format!("tcp:{local_port}");
        let remote = format!("localabstract:{name}");
        self.run(
            &["-s", serial, "forward", &local, &remote],
            SETTINGS_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    /// `adb disconnect <host:port>`.
    pub async fn disconnect(&self, addr: &str) -> Result<(), CoreError> {
        self.run(&["disconnect", addr], SETTINGS_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// `adb connect <ip>:<port>`; success means the combined output
    /// contains "connected to" or "already connected".
    pub async fn connect(&self, addr: &str) -> Result<(), CoreError> {
        let out = self.run(&["connect", addr], SETTINGS_TIMEOUT).await?;
        if out.contains("connected to") || out.contains("already connected") {
            Ok(())
        } else {
            Err(LaunchError::ConnectFailed(out).into())
        }
    }

    /// `adb pair <addr>`, feeding `code` on stdin once the tool prompts.
    /// Success means the combined output contains "successfully paired"
    /// or "paired to". A 30s wallclock deadline kills the child.
    pub async fn pair(&self, addr: &str, code: &str) -> Result<(), CoreError> {
        let mut child = self
            .command()
            .args(["pair", addr])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LaunchError::Io(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(format!("{code}\n").as_bytes()).await;
        }

        let output = match timeout(PAIRING_TIMEOUT, wait_with_output(&mut child)).await {
            Ok(res) => res?,
            Err(_) => {
                let _ = child.start_kill();
                return Err(LaunchError::PairingFailed("timed out".into()).into());
            }
        };

        if output.contains("successfully paired") || output.contains("paired to") {
            Ok(())
        } else {
            Err(LaunchError::PairingFailed(output).into())
        }
    }

    /// Spawn `track-devices`, returning the child for the caller to read
    /// its stdout as a continuous length-prefixed stream.
    pub fn spawn_track_devices(&self) -> Result<Child, CoreError> {
        self.command()
            .arg("track-devices")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Io(e.to_string()).into())
    }

    /// Spawn `-s <serial> shell <args...>` with piped stdout/stderr for a
    /// long-lived process the caller streams from (the agent launcher's
    /// `start` invocation).
    pub fn spawn_shell_stream(&self, serial: &str, args: &[String]) -> Result<Child, CoreError> {
        let mut full = vec!["-s".to_string(), serial.to_string(), "shell".to_string()];
        full.extend_from_slice(args);
        self.command()
            .args(&full)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Io(e.to_string()).into())
    }

    async fn run(&self, args: &[&str], timeout_dur: Duration) -> Result<String, CoreError> {
        let fut = self.command().args(args).output();
        let output = match timeout(timeout_dur, fut).await {
            Ok(res) => res.map_err(|e| LaunchError::Io(e.to_string()))?,
            Err(_) => return Err(CoreError::CommandFailure(format!("{args:?} timed out"))),
        };
        if !output.status.success() {
            return Err(CoreError::CommandFailure(format!(
                "{args:?} exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

async fn wait_with_output(child: &mut Child) -> Result<String, CoreError> {
    let status = child.wait().await.map_err(|e| LaunchError::Io(e.to_string()))?;
    let mut out = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        use tokio::io::AsyncReadExt;
        let _ = stdout.read_to_string(&mut out).await;
    }
    if let Some(mut stderr) = child.stderr.take() {
        use tokio::io::AsyncReadExt;
        let mut err = String::new();
        let _ = stderr.read_to_string(&mut err).await;
        out.push_str(&err);
    }
    let _ = status;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_default_binary_name() {
        let tool = AdbTool::new(None);
        assert_eq!(tool.binary, "adb");
    }

    #[test]
    fn honors_custom_path() {
        let tool = AdbTool::new(Some("/opt/platform-tools/adb".into()));
        assert_eq!(tool.binary, "/opt/platform-tools/adb");
    }
}
