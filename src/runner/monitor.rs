//! Periodic memory / CPU sampling of a running child process.

use crate::errors::RunnerError;
use std::time::{Duration, Instant};
use tracing::debug;

/// One observation of a process's resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSample {
    /// Resident set size in kilobytes.
    pub rss_kb: Option<u64>,
    /// User + system CPU time consumed so far.
    pub cpu_time: Option<Duration>,
}

/// Checks a child process against memory and CPU-time ceilings.
#[derive(Debug)]
pub struct ResourceMonitor {
    pid: Option<u32>,
    max_memory_mb: Option<u64>,
    max_cpu_secs: Option<u64>,
    started: Instant,
}

impl ResourceMonitor {
    pub fn new(pid: Option<u32>, max_memory_mb: Option<u64>, max_cpu_secs: Option<u64>) -> Self {
        Self {
            pid,
            max_memory_mb,
            max_cpu_secs,
            started: Instant::now(),
        }
    }

    /// Whether there is anything to poll for.
    pub fn is_active(&self) -> bool {
        self.pid.is_some() && (self.max_memory_mb.is_some() || self.max_cpu_secs.is_some())
    }

    /// Sample the process and return the first ceiling it exceeds, if any.
    pub async fn check(&self) -> Option<RunnerError> {
        let pid = self.pid?;
        let sample = sample_process(pid).await;
        debug!(pid, rss_kb = ?sample.rss_kb, cpu = ?sample.cpu_time, "resource sample");
        self.evaluate(sample)
    }

    /// Compare a sample against the configured ceilings.
    ///
    /// When the platform cannot report CPU time, elapsed wall-clock time
    /// since the monitor was created stands in for it.
    pub fn evaluate(&self, sample: ResourceSample) -> Option<RunnerError> {
        if let (Some(limit_mb), Some(rss_kb)) = (self.max_memory_mb, sample.rss_kb) {
            let observed_mb = rss_kb / 1024;
            if observed_mb > limit_mb {
                return Some(RunnerError::MemoryExceeded {
                    limit_mb,
                    observed_mb,
                });
            }
        }

        if let Some(limit_secs) = self.max_cpu_secs {
            let used = sample.cpu_time.unwrap_or_else(|| self.started.elapsed());
            if used > Duration::from_secs(limit_secs) {
                return Some(RunnerError::CpuTimeExceeded { limit_secs });
            }
        }

        None
    }
}

#[cfg(target_os = "linux")]
async fn sample_process(pid: u32) -> ResourceSample {
    let status = tokio::fs::read_to_string(format!("/proc/{}/status", pid))
        .await
        .ok();
    let stat = tokio::fs::read_to_string(format!("/proc/{}/stat", pid))
        .await
        .ok();

    let ticks_per_sec = clock_ticks_per_second();
    ResourceSample {
        rss_kb: status.as_deref().and_then(parse_vm_rss_kb),
        cpu_time: stat
            .as_deref()
            .and_then(parse_cpu_ticks)
            .map(|ticks| Duration::from_millis(ticks.saturating_mul(1000) / ticks_per_sec)),
    }
}

#[cfg(not(target_os = "linux"))]
async fn sample_process(pid: u32) -> ResourceSample {
    let output = tokio::process::Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .await
        .ok();

    ResourceSample {
        rss_kb: output.and_then(|o| String::from_utf8_lossy(&o.stdout).trim().parse().ok()),
        cpu_time: None,
    }
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_second() -> u64 {
    // SAFETY: sysconf has no preconditions for _SC_CLK_TCK.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as u64 } else { 100 }
}

/// Extract `VmRSS` (kB) from the text of `/proc/<pid>/status`.
pub fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Extract `utime + stime` (clock ticks) from the text of `/proc/<pid>/stat`.
///
/// The command name field may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] is field 3 (state); utime is field 14, stime field 15.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tnode\nVmPeak:\t  900 kB\nVmRSS:\t  204800 kB\nThreads:\t7\n";
        assert_eq!(parse_vm_rss_kb(status), Some(204800));
    }

    #[test]
    fn test_parse_vm_rss_missing() {
        assert_eq!(parse_vm_rss_kb("Name:\tzombie\n"), None);
    }

    #[test]
    fn test_parse_cpu_ticks_with_spaces_in_name() {
        let stat = "4242 (my (weird) cmd) S 1 4242 4242 0 -1 4194304 100 0 0 0 250 50 0 0 20 0 1 0";
        assert_eq!(parse_cpu_ticks(stat), Some(300));
    }

    #[test]
    fn test_evaluate_memory_exceeded() {
        let monitor = ResourceMonitor::new(Some(1), Some(100), None);
        let err = monitor
            .evaluate(ResourceSample {
                rss_kb: Some(200 * 1024),
                cpu_time: None,
            })
            .unwrap();
        assert!(matches!(
            err,
            RunnerError::MemoryExceeded {
                limit_mb: 100,
                observed_mb: 200
            }
        ));
    }

    #[test]
    fn test_evaluate_cpu_exceeded() {
        let monitor = ResourceMonitor::new(Some(1), None, Some(2));
        let err = monitor.evaluate(ResourceSample {
            rss_kb: None,
            cpu_time: Some(Duration::from_secs(3)),
        });
        assert!(matches!(err, Some(RunnerError::CpuTimeExceeded { limit_secs: 2 })));
    }

    #[test]
    fn test_evaluate_within_limits() {
        let monitor = ResourceMonitor::new(Some(1), Some(512), Some(60));
        let sample = ResourceSample {
            rss_kb: Some(1024),
            cpu_time: Some(Duration::from_secs(1)),
        };
        assert!(monitor.evaluate(sample).is_none());
    }

    #[test]
    fn test_inactive_without_limits() {
        assert!(!ResourceMonitor::new(Some(1), None, None).is_active());
        assert!(!ResourceMonitor::new(None, Some(1), None).is_active());
    }
}
