//! Agent push/launch (C3): pushes the agent binary, invokes the debug
//! tool to start it, relays recognized stdout/stderr lines as status,
//! and tears it down on session end. Pairing and wifi-connect are
//! one-shot helpers delegated straight to [`crate::adb::AdbTool`].

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adb::AdbTool;
use crate::errors::{CoreError, LaunchError};
use crate::types::Codec;

/// Lines starting with one of these are forwarded as status; anything
/// else is swallowed (the agent logs plenty of noise we don't surface).
const RECOGNIZED_PREFIXES: &[&str] = &["INFO:", "WARN:", "ERROR:", "DEBUG:", "VERBOSE:"];

const STDERR_TAIL_CAPACITY: usize = 50;

/// Bit-exact argv for the agent's `start` invocation (spec.md §6).
#[derive(Debug, Clone)]
pub struct AgentLaunchArgs {
    pub scid: String,
    pub log_level: String,
    pub bit_rate: u32,
    pub max_fps: u32,
    pub max_size: u32,
    pub lock_video_orientation: Option<i32>,
    pub tunnel_forward: bool,
    pub control: bool,
    pub audio: bool,
    pub video_codec: Codec,
    pub audio_codec: Option<Codec>,
    pub clipboard_autosync: bool,
    pub stay_awake: bool,
    pub show_touches: bool,
    pub power_off_on_close: bool,
    pub cleanup: bool,
}

impl AgentLaunchArgs {
    /// Render as the `key=value` pairs the agent expects, in a stable
    /// order; unknown future keys are not invented here, only the
    /// contract named in spec.md §6.
    pub fn to_argv(&self) -> Vec<String> {
        let codec_name = |c: Codec| match c {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Av1 => "av1",
        };
        let mut argv = vec![
            format!("scid={}", self.scid),
            format!("log_level={}", self.log_level),
            format!("bit_rate={}", self.bit_rate),
            format!("max_fps={}", self.max_fps),
            format!("max_size={}", self.max_size),
        ];
        if let Some(lock) = self.lock_video_orientation {
            argv.push(format!("lock_video_orientation={lock}"));
        }
        argv.push(format!("tunnel_forward={}", self.tunnel_forward));
        argv.push(format!("control={}", self.control));
        argv.push(format!("audio={}", self.audio));
        argv.push(format!("video_codec={}", codec_name(self.video_codec)));
        if let Some(audio_codec) = self.audio_codec {
            argv.push(format!("audio_codec={}", codec_name(audio_codec)));
        }
        argv.push(format!("clipboard_autosync={}", self.clipboard_autosync));
        argv.push(format!("stay_awake={}", self.stay_awake));
        argv.push(format!("show_touches={}", self.show_touches));
        argv.push(format!("power_off_on_close={}", self.power_off_on_close));
        argv.push(format!("cleanup={}", self.cleanup));
        argv
    }
}

/// Pushes and invokes the agent binary on one device.
pub struct AgentLauncher {
    adb: AdbTool,
    remote_path: String,
    server_main_class: String,
}

impl AgentLauncher {
    pub fn new(adb: AdbTool, remote_path: impl Into<String>, server_main_class: impl Into<String>) -> Self {
        AgentLauncher {
            adb,
            remote_path: remote_path.into(),
            server_main_class: server_main_class.into(),
        }
    }

    /// Push the agent binary to its known device-side location and grant
    /// execute permission.
    pub async fn push_agent(&self, serial: &str, local_path: &str) -> Result<(), CoreError> {
        self.adb.push(local_path, &self.remote_path).await?;
        self.adb
            .shell(
                serial,
                &["chmod", "755", &self.remote_path],
                crate::adb::SETTINGS_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    /// Invoke the debug tool to start the agent with `args`, relaying
    /// recognized output lines to `on_status` until the process exits,
    /// at which point `on_error` fires with the exit status and the
    /// captured stderr tail.
    pub fn start<S, E>(
        &self,
        serial: &str,
        args: &AgentLaunchArgs,
        on_status: S,
        on_error: E,
    ) -> Result<LaunchedAgent, CoreError>
    where
        S: Fn(String) + Send + Sync + 'static,
        E: Fn(String) + Send + 'static,
    {
        let mut full_args = vec![
            "CLASSPATH=".to_string() + &self.remote_path,
            "app_process".to_string(),
            "/".to_string(),
            self.server_main_class.clone(),
        ];
        full_args.extend(args.to_argv());

        let mut child = self.adb.spawn_shell_stream(serial, &full_args)?;
        debug!(serial, "agent process spawned");

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_CAPACITY)));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let on_status = Arc::new(on_status);

        if let Some(stdout) = stdout {
            let on_status = Arc::clone(&on_status);
            tokio::spawn(relay_recognized_lines(stdout, on_status));
        }
        if let Some(stderr) = stderr {
            let on_status = Arc::clone(&on_status);
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(relay_stderr(stderr, on_status, tail));
        }

        let serial = serial.to_string();
        let wait_task = tokio::spawn(async move {
            let status = child.wait().await;
            let stderr_lines = stderr_tail.lock().await;
            let stderr_text = stderr_lines.iter().cloned().collect::<Vec<_>>().join("\n");
            match status {
                Ok(status) if status.success() => {
                    info!(serial, "agent process exited cleanly");
                }
                Ok(status) => {
                    warn!(serial, code = ?status.code(), "agent process exited non-zero");
                    on_error(format!(
                        "agent exited with {:?}: {}",
                        status.code(),
                        stderr_text
                    ));
                }
                Err(e) => {
                    on_error(format!("agent wait failed: {e}"));
                }
            }
        });

        Ok(LaunchedAgent { wait_task })
    }

    /// `pair <addr>` delegated to the debug tool.
    pub async fn pair(&self, addr: &str, code: &str) -> Result<(), CoreError> {
        self.adb.pair(addr, code).await
    }

    /// `connect <ip>:<port>` delegated to the debug tool.
    pub async fn connect(&self, addr: &str) -> Result<(), CoreError> {
        self.adb.connect(addr).await
    }
}

/// Handle to a running agent invocation; dropping it does not kill the
/// process (teardown is explicit via [`LaunchedAgent::kill`]).
pub struct LaunchedAgent {
    wait_task: tokio::task::JoinHandle<()>,
}

impl LaunchedAgent {
    /// Stop waiting on this agent; does not kill the underlying process
    /// since ownership of `Child` is held by the wait task. Teardown of
    /// the process itself happens via the session's own kill of the
    /// adb shell invocation (killing the shell child kills the agent).
    pub fn abort(&self) {
        self.wait_task.abort();
    }
}

async fn relay_recognized_lines<S>(stdout: tokio::process::ChildStdout, on_status: Arc<S>)
where
    S: Fn(String) + Send + Sync + 'static,
{
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if RECOGNIZED_PREFIXES.iter().any(|p| line.starts_with(p)) {
            on_status(line);
        }
    }
}

async fn relay_stderr<S>(
    stderr: tokio::process::ChildStderr,
    on_status: Arc<S>,
    tail: Arc<Mutex<VecDeque<String>>>,
) where
    S: Fn(String) + Send + Sync + 'static,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if RECOGNIZED_PREFIXES.iter().any(|p| line.starts_with(p)) {
            on_status(line.clone());
        }
        let mut tail = tail.lock().await;
        if tail.len() == STDERR_TAIL_CAPACITY {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Errors surfaced from pairing/connect that are not already
/// [`CoreError`] variants are normalized here for callers building their
/// own retry UI.
pub fn describe_launch_error(err: &LaunchError) -> String {
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_includes_required_keys_in_order() {
        let args = AgentLaunchArgs {
            scid: "abcd1234".into(),
            log_level: "info".into(),
            bit_rate: 8_000_000,
            max_fps: 60,
            max_size: 0,
            lock_video_orientation: None,
            tunnel_forward: true,
            control: true,
            audio: true,
            video_codec: Codec::H264,
            audio_codec: None,
            clipboard_autosync: true,
            stay_awake: true,
            show_touches: false,
            power_off_on_close: false,
            cleanup: true,
        };
        let argv = args.to_argv();
        assert_eq!(argv[0], "scid=abcd1234");
        assert!(argv.contains(&"video_codec=h264".to_string()));
        assert!(!argv.iter().any(|a| a.starts_with("lock_video_orientation")));
    }

    #[test]
    fn argv_includes_orientation_lock_when_set() {
        let args = AgentLaunchArgs {
            scid: "abcd1234".into(),
            log_level: "info".into(),
            bit_rate: 8_000_000,
            max_fps: 60,
            max_size: 0,
            lock_video_orientation: Some(1),
            tunnel_forward: true,
            control: true,
            audio: false,
            video_codec: Codec::Av1,
            audio_codec: Some(Codec::H264),
            clipboard_autosync: false,
            stay_awake: false,
            show_touches: false,
            power_off_on_close: false,
            cleanup: false,
        };
        let argv = args.to_argv();
        assert!(argv.contains(&"lock_video_orientation=1".to_string()));
        assert!(argv.contains(&"audio_codec=h264".to_string()));
    }
}
