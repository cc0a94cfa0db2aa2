use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub batches_received: u64,
    pub checks_received: u64,
    pub hosts_tracked: usize,
    pub services_tracked: usize,
    pub memory_usage_mb: f32,
    pub open_files: usize,
    /// Date RFC3339 de la dernière publication de config (null avant la 1ère)
    pub last_publish: Option<String>,
}

/// Compteurs internes du kernel, partagés entre le handler HTTP et le
/// générateur. Clonable à volonté (tout est Arc derrière).
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    batches: Arc<AtomicU64>,
    checks: Arc<AtomicU64>,
    last_publish: Arc<parking_lot::Mutex<Option<String>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            batches: Arc::new(AtomicU64::new(0)),
            checks: Arc::new(AtomicU64::new(0)),
            last_publish: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Un batch NRDP accepté, contenant `checks` résultats.
    pub fn record_batch(&self, checks: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.checks.fetch_add(checks, Ordering::Relaxed);
    }

    /// Le générateur vient de publier une nouvelle config.
    pub fn mark_published(&self) {
        let now = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        *self.last_publish.lock() = Some(now);
    }

    pub fn snapshot(&self, hosts_tracked: usize, services_tracked: usize) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            batches_received: self.batches.load(Ordering::Relaxed),
            checks_received: self.checks.load(Ordering::Relaxed),
            hosts_tracked,
            services_tracked,
            memory_usage_mb: get_memory_usage_mb(),
            open_files: count_open_files(),
            last_publish: self.last_publish.lock().clone(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<u64>() {
                            return (kb as f32) / 1024.0;
                        }
                    }
                }
            }
        }
    }

    // Fallback approximatif hors Linux
    12.0
}

fn count_open_files() -> usize {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
            return entries.count();
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let tracker = HealthTracker::new();
        tracker.record_batch(3);
        tracker.record_batch(1);

        let health = tracker.snapshot(5, 12);
        assert_eq!(health.batches_received, 2);
        assert_eq!(health.checks_received, 4);
        assert_eq!(health.hosts_tracked, 5);
        assert_eq!(health.services_tracked, 12);
    }

    #[test]
    fn test_last_publish_starts_empty_then_fills() {
        let tracker = HealthTracker::new();
        assert!(tracker.snapshot(0, 0).last_publish.is_none());
        tracker.mark_published();
        let stamp = tracker.snapshot(0, 0).last_publish.unwrap();
        // RFC3339, ex: 2026-08-23T10:00:00Z
        assert!(stamp.contains('T'));
    }

    #[test]
    fn test_clones_share_state() {
        let tracker = HealthTracker::new();
        let clone = tracker.clone();
        clone.record_batch(2);
        assert_eq!(tracker.snapshot(0, 0).batches_received, 1);
    }
}
