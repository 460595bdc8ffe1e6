//! Plugin child-process lifecycle.
//!
//! A plugin is an external executable that owns placement, naming, and
//! durability of the backup stream. For streaming, the helper spawns
//! `<plugin> backup_data <config> <path>` with the child's stdin bound to
//! the helper's output, or `<plugin> restore_data <config> <path>` with
//! the child's stdout bound to the helper's input. The child pid is kept
//! and cleanup waits for it; a non-zero exit is a helper failure.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HelperError, HelperResult};

/// Parsed plugin configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "executablepath")]
    pub executable_path: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl PluginConfig {
    pub fn load(path: &Path) -> HelperResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Run a lifecycle sub-command (`setup_plugin_for_backup`,
    /// `cleanup_plugin_for_restore`, `delete_backup`, ...) to completion.
    pub fn run_subcommand(
        config_path: &Path,
        subcommand: &str,
        extra_args: &[&str],
    ) -> HelperResult<()> {
        let config = Self::load(config_path)?;
        let status = Command::new(&config.executable_path)
            .arg(subcommand)
            .arg(config_path)
            .args(extra_args)
            .status()?;
        if !status.success() {
            return Err(HelperError::PluginFailed {
                command: format!("{} {}", config.executable_path, subcommand),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

/// A running plugin child bound to one end of the helper's stream.
pub struct PluginProcess {
    child: Child,
    command: String,
}

impl PluginProcess {
    /// Spawn the streaming backup side: bytes written to the returned
    /// stdin handle belong to the plugin from then on.
    pub fn spawn_backup_stream(
        config_path: &Path,
        data_file: &Path,
    ) -> HelperResult<(Self, ChildStdin)> {
        let config = PluginConfig::load(config_path)?;
        let mut child = Command::new(&config.executable_path)
            .arg("backup_data")
            .arg(config_path)
            .arg(data_file)
            .stdin(Stdio::piped())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HelperError::Io(std::io::Error::other("plugin stdin unavailable")))?;
        debug!(plugin = %config.executable_path, pid = child.id(), "spawned backup_data plugin");
        Ok((
            Self {
                child,
                command: format!("{} backup_data", config.executable_path),
            },
            stdin,
        ))
    }

    /// Spawn the streaming restore side: the returned stdout handle is
    /// the backup stream.
    pub fn spawn_restore_stream(
        config_path: &Path,
        data_file: &Path,
    ) -> HelperResult<(Self, ChildStdout)> {
        let config = PluginConfig::load(config_path)?;
        let mut child = Command::new(&config.executable_path)
            .arg("restore_data")
            .arg(config_path)
            .arg(data_file)
            .stdout(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HelperError::Io(std::io::Error::other("plugin stdout unavailable")))?;
        debug!(plugin = %config.executable_path, pid = child.id(), "spawned restore_data plugin");
        Ok((
            Self {
                child,
                command: format!("{} restore_data", config.executable_path),
            },
            stdout,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Reap the child and fail on a non-zero exit. The caller must have
    /// dropped the stream handle first so the child sees EOF.
    pub fn wait(mut self) -> HelperResult<()> {
        let status = self.child.wait()?;
        if !status.success() {
            return Err(HelperError::PluginFailed {
                command: self.command,
                status: status.to_string(),
            });
        }
        Ok(())
    }

    /// Best-effort kill for cleanup paths.
    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_plugin_config(dir: &Path, executable: &str) -> std::path::PathBuf {
        let path = dir.join("plugin.yaml");
        std::fs::write(
            &path,
            format!("executablepath: {}\noptions:\n  bucket: test\n", executable),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_load_plugin_config() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin_config(dir.path(), "/usr/local/bin/heron_s3");
        let config = PluginConfig::load(&path).unwrap();
        assert_eq!(config.executable_path, "/usr/local/bin/heron_s3");
        assert_eq!(config.options["bucket"], "test");
    }

    #[test]
    fn test_backup_stream_feeds_plugin_stdin() {
        // `cat > /dev/null` style sink: use `sh -c` via a wrapper script.
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake_plugin.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > \"$3\"\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let config_path = write_plugin_config(dir.path(), &script.to_string_lossy());
        let data_file = dir.path().join("stream.out");
        let (proc, mut stdin) =
            PluginProcess::spawn_backup_stream(&config_path, &data_file).unwrap();
        stdin.write_all(b"streamed bytes").unwrap();
        drop(stdin);
        proc.wait().unwrap();

        assert_eq!(std::fs::read(&data_file).unwrap(), b"streamed bytes");
    }

    #[test]
    fn test_restore_stream_reads_plugin_stdout() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake_plugin.sh");
        std::fs::write(&script, "#!/bin/sh\ncat \"$3\"\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let data_file = dir.path().join("stream.in");
        std::fs::write(&data_file, b"plugin payload").unwrap();
        let config_path = write_plugin_config(dir.path(), &script.to_string_lossy());

        let (proc, mut stdout) =
            PluginProcess::spawn_restore_stream(&config_path, &data_file).unwrap();
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut stdout, &mut contents).unwrap();
        drop(stdout);
        proc.wait().unwrap();

        assert_eq!(contents, b"plugin payload");
    }

    #[test]
    fn test_run_lifecycle_subcommand() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake_plugin.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"$1\" > \"$(dirname \"$2\")/invoked\"\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let config_path = write_plugin_config(dir.path(), &script.to_string_lossy());
        PluginConfig::run_subcommand(&config_path, "setup_plugin_for_backup", &[]).unwrap();
        let invoked = std::fs::read_to_string(dir.path().join("invoked")).unwrap();
        assert_eq!(invoked.trim(), "setup_plugin_for_backup");
    }

    #[test]
    fn test_plugin_nonzero_exit_is_an_error() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake_plugin.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 4\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let config_path = write_plugin_config(dir.path(), &script.to_string_lossy());
        let (proc, stdin) =
            PluginProcess::spawn_backup_stream(&config_path, &dir.path().join("out")).unwrap();
        drop(stdin);
        let err = proc.wait().unwrap_err();
        assert!(matches!(err, HelperError::PluginFailed { .. }));
    }
}
