//! Shell/SSH command fan-out across the cluster.
//!
//! One thread per targeted segment; commands on the local host run
//! directly, remote ones are wrapped in `ssh`. The harness is stateless:
//! it reports per-segment exit status and output, and leaves fatality to
//! the caller.

use std::collections::BTreeMap;
use std::process::Command;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cluster::{Cluster, ClusterError, Scope, SegmentConfig};

/// Outcome of one segment's command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn failed(&self) -> bool {
        self.exit_code != 0
    }
}

/// Aggregated fan-out report, keyed by content id.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteOutput {
    pub results: BTreeMap<i32, CommandResult>,
}

impl RemoteOutput {
    /// Number of segments whose command exited non-zero.
    pub fn num_errors(&self) -> usize {
        self.results.values().filter(|r| r.failed()).count()
    }

    /// Content ids of the failed segments, ascending.
    pub fn failed_contents(&self) -> Vec<i32> {
        self.results
            .iter()
            .filter(|(_, r)| r.failed())
            .map(|(content, _)| *content)
            .collect()
    }

    /// JSON form for machine consumers.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Run one command per targeted segment and collect the results.
///
/// `build_command` produces the argv for each segment; an empty argv
/// records a usage failure for that segment instead of running anything.
pub fn execute_cluster_command<F>(cluster: &Cluster, scope: Scope, build_command: F) -> RemoteOutput
where
    F: Fn(&SegmentConfig) -> Vec<String> + Sync,
{
    let targets = cluster.targets(scope);
    let mut results = BTreeMap::new();

    std::thread::scope(|s| {
        let handles: Vec<_> = targets
            .into_iter()
            .map(|segment| {
                let argv = build_command(segment);
                let content = segment.content_id;
                let hostname = segment.hostname.clone();
                (
                    content,
                    s.spawn(move || run_on_host(&hostname, content, argv)),
                )
            })
            .collect();

        for (content, handle) in handles {
            let result = handle.join().unwrap_or_else(|_| CommandResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: "fan-out worker panicked".to_string(),
            });
            results.insert(content, result);
        }
    });

    RemoteOutput { results }
}

/// Log per-segment failures from a fan-out and, when `fatal` is set, turn
/// them into an error naming the failed content ids.
pub fn check_cluster_error(
    output: &RemoteOutput,
    verb: &str,
    fatal: bool,
) -> Result<(), ClusterError> {
    let failed = output.failed_contents();
    if failed.is_empty() {
        return Ok(());
    }
    for content in &failed {
        let result = &output.results[content];
        warn!(
            content = content,
            exit_code = result.exit_code,
            stderr = %result.stderr.trim_end(),
            "{} failed on segment",
            verb
        );
    }
    if fatal {
        return Err(ClusterError::PartialFailure {
            verb: verb.to_string(),
            count: failed.len(),
            contents: failed
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        });
    }
    Ok(())
}

fn run_on_host(hostname: &str, content: i32, argv: Vec<String>) -> CommandResult {
    if argv.is_empty() {
        return CommandResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: "empty command".to_string(),
        };
    }
    debug!(content = content, host = hostname, command = %argv.join(" "), "dispatching");

    let output = if is_local_host(hostname) {
        Command::new(&argv[0]).args(&argv[1..]).output()
    } else {
        Command::new("ssh")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg(hostname)
            .arg(shell_join(&argv))
            .output()
    };

    match output {
        Ok(out) => CommandResult {
            // Processes killed by a signal have no exit code; report -1.
            exit_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        },
        Err(e) => CommandResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("failed to spawn: {}", e),
        },
    }
}

/// Is this hostname the machine we are running on?
fn is_local_host(hostname: &str) -> bool {
    if matches!(hostname, "localhost" | "127.0.0.1" | "::1") {
        return true;
    }
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy() == hostname)
        .unwrap_or(false)
}

/// Join an argv into a single shell word sequence, single-quoting each
/// argument for the remote shell.
fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c)) {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn local_cluster(num_segments: i32) -> Cluster {
        let mut all = vec![SegmentConfig {
            content_id: -1,
            hostname: "localhost".to_string(),
            data_dir: PathBuf::from("/data/coordinator"),
            port: 5432,
        }];
        for content in 0..num_segments {
            all.push(SegmentConfig {
                content_id: content,
                hostname: "localhost".to_string(),
                data_dir: PathBuf::from(format!("/data/seg{}", content)),
                port: 6000 + content as u16,
            });
        }
        Cluster::new(all).unwrap()
    }

    #[test]
    fn test_fanout_collects_stdout_per_segment() {
        let cluster = local_cluster(3);
        let output = execute_cluster_command(&cluster, Scope::Segments, |seg| {
            vec![
                "echo".to_string(),
                format!("content {}", seg.content_id),
            ]
        });

        assert_eq!(output.results.len(), 3);
        assert_eq!(output.num_errors(), 0);
        assert_eq!(output.results[&1].stdout.trim(), "content 1");
    }

    #[test]
    fn test_fanout_counts_partial_failures() {
        let cluster = local_cluster(3);
        let output = execute_cluster_command(&cluster, Scope::Segments, |seg| {
            if seg.content_id == 1 {
                vec!["false".to_string()]
            } else {
                vec!["true".to_string()]
            }
        });

        assert_eq!(output.num_errors(), 1);
        assert_eq!(output.failed_contents(), vec![1]);
        assert!(output.results[&1].failed());
        assert!(!output.results[&0].failed());
    }

    #[test]
    fn test_fanout_includes_coordinator_when_scoped() {
        let cluster = local_cluster(2);
        let output =
            execute_cluster_command(&cluster, Scope::SegmentsAndCoordinator, |_| {
                vec!["true".to_string()]
            });
        assert_eq!(
            output.results.keys().copied().collect::<Vec<_>>(),
            vec![-1, 0, 1]
        );
    }

    #[test]
    fn test_fanout_records_spawn_failures() {
        let cluster = local_cluster(1);
        let output = execute_cluster_command(&cluster, Scope::Segments, |_| {
            vec!["/nonexistent/heron/binary".to_string()]
        });
        assert_eq!(output.num_errors(), 1);
        assert!(output.results[&0].stderr.contains("failed to spawn"));
    }

    #[test]
    fn test_check_cluster_error_fatal_and_nonfatal() {
        let cluster = local_cluster(2);
        let output = execute_cluster_command(&cluster, Scope::Segments, |seg| {
            if seg.content_id == 0 {
                vec!["false".to_string()]
            } else {
                vec!["true".to_string()]
            }
        });

        assert!(check_cluster_error(&output, "smoke test", false).is_ok());
        let err = check_cluster_error(&output, "smoke test", true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "smoke test failed on 1 segment(s): contents [0]"
        );
    }

    #[test]
    fn test_shell_join_quotes_only_when_needed() {
        let argv = vec![
            "mkfifo".to_string(),
            "/tmp/pipe_1".to_string(),
            "has space".to_string(),
        ];
        assert_eq!(shell_join(&argv), "mkfifo /tmp/pipe_1 'has space'");
    }
}
