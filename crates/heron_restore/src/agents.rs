//! Driver-side orchestration of the per-segment helper agents.
//!
//! The driver creates the first `copy_prefetch` FIFOs on every segment
//! before the agents start, so the database never opens a pipe that does
//! not exist yet. It then launches one `heron_helper` per segment through
//! the cluster fan-out, writes `<pipe>_skip_<oid>` markers when a table
//! copy fails under on-error-continue, and checks for `<pipe>_error`
//! sentinels once the copies are done: an agent that died during its last
//! table copy can otherwise look successful.

use std::path::PathBuf;

use tracing::info;

use heron_cluster::{execute_cluster_command, Cluster, RemoteOutput, Scope, SegmentConfig};
use heron_common::layout;

use crate::error::{RestoreError, RestoreResult};

/// Per-run settings shared by every helper agent command.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub timestamp: String,
    /// Path of the helper binary on the segment hosts.
    pub helper_binary: PathBuf,
    pub compression_level: u32,
    pub copy_prefetch: usize,
    pub single_data_file: bool,
    pub with_filters: bool,
    pub on_error_continue: bool,
    pub plugin_config: Option<PathBuf>,
}

impl AgentOptions {
    pub fn new(timestamp: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            helper_binary: PathBuf::from("heron_helper"),
            compression_level: 0,
            copy_prefetch: 1,
            single_data_file: true,
            with_filters: false,
            on_error_continue: false,
            plugin_config: None,
        }
    }
}

/// Which side the launched agents serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Backup,
    Restore,
}

/// The full helper argv for one segment, matching the helper's stable
/// CLI.
pub fn build_helper_command(
    segment: &SegmentConfig,
    options: &AgentOptions,
    role: AgentRole,
) -> Vec<String> {
    let data_dir = &segment.data_dir;
    let content = segment.content_id;
    let ts = &options.timestamp;

    let mut argv = vec![
        options.helper_binary.to_string_lossy().into_owned(),
        match role {
            AgentRole::Backup => "--backup-agent".to_string(),
            AgentRole::Restore => "--restore-agent".to_string(),
        },
        "--content".to_string(),
        content.to_string(),
        "--compression-level".to_string(),
        options.compression_level.to_string(),
        "--copy-prefetch".to_string(),
        options.copy_prefetch.to_string(),
        "--data-file".to_string(),
        layout::data_file_path(data_dir, content, ts).to_string_lossy().into_owned(),
        "--oid-file".to_string(),
        layout::oid_file_path(data_dir, content, ts).to_string_lossy().into_owned(),
        "--pipe-file".to_string(),
        layout::pipe_file_prefix(data_dir, content, ts).to_string_lossy().into_owned(),
        "--toc-file".to_string(),
        layout::toc_file_path(data_dir, content, ts).to_string_lossy().into_owned(),
    ];
    if options.single_data_file {
        argv.push("--single-data-file".to_string());
    }
    if options.with_filters {
        argv.push("--with-filters".to_string());
    }
    if role == AgentRole::Restore && options.on_error_continue {
        argv.push("--on-error-continue".to_string());
    }
    if let Some(plugin_config) = &options.plugin_config {
        argv.push("--plugin-config".to_string());
        argv.push(plugin_config.to_string_lossy().into_owned());
    }
    argv
}

/// Create the first `copy_prefetch` FIFOs on every segment. `oids` is the
/// ascending oid list shared by all segments.
pub fn create_initial_pipes(
    cluster: &Cluster,
    options: &AgentOptions,
    oids: &[u32],
) -> RemoteOutput {
    let prefetched = oids.len().min(options.copy_prefetch);
    execute_cluster_command(cluster, Scope::Segments, |segment| {
        let prefix =
            layout::pipe_file_prefix(&segment.data_dir, segment.content_id, &options.timestamp);
        let mut argv = vec!["mkfifo".to_string()];
        for &oid in &oids[..prefetched] {
            argv.push(format!("{}_{}", prefix.to_string_lossy(), oid));
        }
        argv
    })
}

/// Launch one detached helper agent per segment.
pub fn start_agents(cluster: &Cluster, options: &AgentOptions, role: AgentRole) -> RemoteOutput {
    info!(
        timestamp = %options.timestamp,
        segments = cluster.segment_count(),
        "launching helper agents"
    );
    execute_cluster_command(cluster, Scope::Segments, |segment| {
        let helper = build_helper_command(segment, options, role).join(" ");
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("nohup {} >/dev/null 2>&1 &", helper),
        ]
    })
}

/// Mark one table as skipped on every segment; the restore agents drain
/// its bytes and move on.
pub fn write_skip_markers(cluster: &Cluster, options: &AgentOptions, oid: u32) -> RemoteOutput {
    execute_cluster_command(cluster, Scope::Segments, |segment| {
        let prefix =
            layout::pipe_file_prefix(&segment.data_dir, segment.content_id, &options.timestamp);
        vec![
            "touch".to_string(),
            format!("{}_skip_{}", prefix.to_string_lossy(), oid),
        ]
    })
}

/// After the table copies finish, fail if any segment's agent left its
/// `_error` sentinel behind.
pub fn check_agent_error_files(cluster: &Cluster, options: &AgentOptions) -> RestoreResult<()> {
    let output = execute_cluster_command(cluster, Scope::Segments, |segment| {
        let prefix =
            layout::pipe_file_prefix(&segment.data_dir, segment.content_id, &options.timestamp);
        vec![
            "test".to_string(),
            "-f".to_string(),
            format!("{}_error", prefix.to_string_lossy()),
        ]
    });

    // `test -f` exits zero when the sentinel exists, so here success
    // means failure.
    let failed: Vec<i32> = output
        .results
        .iter()
        .filter(|(_, result)| !result.failed())
        .map(|(content, _)| *content)
        .collect();
    if failed.is_empty() {
        return Ok(());
    }
    Err(RestoreError::AgentFailure {
        contents: failed
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Remove leftover helper artifacts: pipes, skip markers, and error
/// sentinels.
pub fn clean_up_helper_artifacts(cluster: &Cluster, options: &AgentOptions) -> RemoteOutput {
    execute_cluster_command(cluster, Scope::Segments, |segment| {
        let prefix =
            layout::pipe_file_prefix(&segment.data_dir, segment.content_id, &options.timestamp);
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("rm -f {}_*", prefix.to_string_lossy()),
        ]
    })
}

/// Run a plugin lifecycle sub-command (`setup_plugin_for_restore`,
/// `cleanup_plugin_for_backup`, ...) on every targeted node. The plugin
/// config file must already be present at `config_path` on each host.
pub fn run_plugin_lifecycle(
    cluster: &Cluster,
    scope: Scope,
    plugin_executable: &std::path::Path,
    config_path: &std::path::Path,
    subcommand: &str,
) -> RemoteOutput {
    execute_cluster_command(cluster, scope, |_segment| {
        vec![
            plugin_executable.to_string_lossy().into_owned(),
            subcommand.to_string(),
            config_path.to_string_lossy().into_owned(),
        ]
    })
}

/// Best-effort stop of any still-running agents for this timestamp.
pub fn terminate_agents(cluster: &Cluster, options: &AgentOptions) -> RemoteOutput {
    execute_cluster_command(cluster, Scope::Segments, |segment| {
        vec![
            "pkill".to_string(),
            "-f".to_string(),
            format!(
                "{} .*{}",
                options.helper_binary.to_string_lossy(),
                layout::pipe_file_prefix(
                    &segment.data_dir,
                    segment.content_id,
                    &options.timestamp
                )
                .to_string_lossy()
            ),
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use tempfile::TempDir;

    fn local_cluster(dir: &TempDir, num_segments: i32) -> Cluster {
        let mut all = vec![SegmentConfig {
            content_id: -1,
            hostname: "localhost".to_string(),
            data_dir: dir.path().join("coordinator"),
            port: 5432,
        }];
        for content in 0..num_segments {
            let data_dir = dir.path().join(format!("seg{content}"));
            std::fs::create_dir_all(&data_dir).unwrap();
            all.push(SegmentConfig {
                content_id: content,
                hostname: "localhost".to_string(),
                data_dir,
                port: 6000 + content as u16,
            });
        }
        Cluster::new(all).unwrap()
    }

    fn options() -> AgentOptions {
        AgentOptions::new("20170101010101")
    }

    #[test]
    fn test_build_helper_command_backup() {
        let dir = TempDir::new().unwrap();
        let cluster = local_cluster(&dir, 1);
        let mut opts = options();
        opts.compression_level = 6;
        opts.copy_prefetch = 4;

        let argv = build_helper_command(&cluster.segments()[0], &opts, AgentRole::Backup);
        let line = argv.join(" ");
        assert!(line.starts_with("heron_helper --backup-agent --content 0"));
        assert!(line.contains("--compression-level 6"));
        assert!(line.contains("--copy-prefetch 4"));
        assert!(line.contains("--data-file"));
        assert!(line.contains("heron_0_20170101010101"));
        assert!(line.contains("--single-data-file"));
        assert!(!line.contains("--on-error-continue"));
    }

    #[test]
    fn test_build_helper_command_restore_flags() {
        let dir = TempDir::new().unwrap();
        let cluster = local_cluster(&dir, 1);
        let mut opts = options();
        opts.on_error_continue = true;
        opts.with_filters = true;
        opts.plugin_config = Some(PathBuf::from("/etc/heron/plugin.yaml"));

        let argv = build_helper_command(&cluster.segments()[0], &opts, AgentRole::Restore);
        let line = argv.join(" ");
        assert!(line.contains("--restore-agent"));
        assert!(line.contains("--with-filters"));
        assert!(line.contains("--on-error-continue"));
        assert!(line.contains("--plugin-config /etc/heron/plugin.yaml"));
    }

    #[test]
    fn test_create_initial_pipes_makes_fifos() {
        let dir = TempDir::new().unwrap();
        let cluster = local_cluster(&dir, 2);
        let mut opts = options();
        opts.copy_prefetch = 2;

        let output = create_initial_pipes(&cluster, &opts, &[10, 11, 12]);
        assert_eq!(output.num_errors(), 0);

        for segment in cluster.segments() {
            for oid in [10u32, 11] {
                let pipe = heron_common::layout::pipe_file_prefix(
                    &segment.data_dir,
                    segment.content_id,
                    &opts.timestamp,
                );
                let pipe = PathBuf::from(format!("{}_{}", pipe.to_string_lossy(), oid));
                let meta = std::fs::metadata(&pipe).unwrap();
                assert!(meta.file_type().is_fifo(), "{} is not a fifo", pipe.display());
            }
            let absent = heron_common::layout::pipe_file_prefix(
                &segment.data_dir,
                segment.content_id,
                &opts.timestamp,
            );
            assert!(!PathBuf::from(format!("{}_12", absent.to_string_lossy())).exists());
        }
    }

    #[test]
    fn test_write_skip_markers() {
        let dir = TempDir::new().unwrap();
        let cluster = local_cluster(&dir, 2);
        let opts = options();

        let output = write_skip_markers(&cluster, &opts, 4242);
        assert_eq!(output.num_errors(), 0);
        for segment in cluster.segments() {
            let prefix = heron_common::layout::pipe_file_prefix(
                &segment.data_dir,
                segment.content_id,
                &opts.timestamp,
            );
            assert!(PathBuf::from(format!("{}_skip_4242", prefix.to_string_lossy())).exists());
        }
    }

    #[test]
    fn test_check_agent_error_files_reports_sentinels() {
        let dir = TempDir::new().unwrap();
        let cluster = local_cluster(&dir, 2);
        let opts = options();

        assert!(check_agent_error_files(&cluster, &opts).is_ok());

        // Segment 1's agent died; its sentinel is on disk.
        let seg1 = &cluster.segments()[1];
        let prefix = heron_common::layout::pipe_file_prefix(
            &seg1.data_dir,
            seg1.content_id,
            &opts.timestamp,
        );
        std::fs::write(format!("{}_error", prefix.to_string_lossy()), b"").unwrap();

        let err = check_agent_error_files(&cluster, &opts).unwrap_err();
        assert_eq!(
            err.to_string(),
            "helper agent failure on segment(s) [1]: error sentinel present"
        );
    }

    #[test]
    fn test_clean_up_removes_helper_artifacts() {
        let dir = TempDir::new().unwrap();
        let cluster = local_cluster(&dir, 1);
        let opts = options();

        let seg = &cluster.segments()[0];
        let prefix = heron_common::layout::pipe_file_prefix(
            &seg.data_dir,
            seg.content_id,
            &opts.timestamp,
        );
        let prefix = prefix.to_string_lossy().into_owned();
        for suffix in ["_7", "_skip_7", "_error"] {
            std::fs::write(format!("{prefix}{suffix}"), b"").unwrap();
        }

        let output = clean_up_helper_artifacts(&cluster, &opts);
        assert_eq!(output.num_errors(), 0);
        for suffix in ["_7", "_skip_7", "_error"] {
            assert!(!PathBuf::from(format!("{prefix}{suffix}")).exists());
        }
    }
}
