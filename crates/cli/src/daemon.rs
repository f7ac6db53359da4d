//! PID file and shutdown signal handling for the `start` daemon.

use std::path::PathBuf;
#[cfg(not(test))]
use tokio::signal;
use tracing::info;
#[cfg(not(test))]
use tracing::warn;

/// PID file management
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.taskgate/taskgate.pid`
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".taskgate").join("taskgate.pid")
    }

    /// Writes the current process ID, creating parent directories.
    pub async fn write(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pid = std::process::id().to_string();
        tokio::fs::write(&self.path, pid).await?;
        info!("PID file written: {}", self.path.display());
        Ok(())
    }

    /// Removes the PID file if it exists.
    pub async fn remove(&self) {
        if self.path.exists() {
            let _ = tokio::fs::remove_file(&self.path).await;
            info!("PID file removed: {}", self.path.display());
        }
    }
}

/// Wait for SIGTERM or SIGINT shutdown signal
#[cfg(not(test))]
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
                return;
            }
            Err(e) => warn!("Failed to register SIGTERM handler: {e}"),
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C, shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_points_to_taskgate_pid() {
        let path = PidFile::default_path();
        let text = path.to_string_lossy();
        assert!(text.contains(".taskgate"));
        assert!(text.ends_with("taskgate.pid"));
    }

    #[tokio::test]
    async fn write_and_remove_pid_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pid_path = tmp.path().join("nested/taskgate.pid");
        let pid_file = PidFile::new(&pid_path);

        pid_file.write().await.expect("pid write");
        let written = tokio::fs::read_to_string(&pid_path)
            .await
            .expect("read pid");
        assert_eq!(written.parse::<u32>().expect("numeric pid"), std::process::id());

        pid_file.remove().await;
        assert!(!pid_path.exists());

        // Removing twice is harmless.
        pid_file.remove().await;
    }
}
