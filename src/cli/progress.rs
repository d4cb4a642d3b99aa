//! Progress reporting module
//!
//! Periodic one-line transfer summaries for the binary.

use std::time::{Duration, Instant};

use tracing::info;

use crate::transfer::Orchestrator;

/// Snapshot of one torrent's transfer state
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes per second over the last sample interval
    pub download_speed: u64,
    pub upload_speed: u64,
    pub peers: usize,
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub left: u64,
}

impl TransferStats {
    pub fn from_orchestrator(orchestrator: &Orchestrator) -> Self {
        let torrent = orchestrator.torrent();
        let announce = orchestrator.announce_stats();
        Self {
            downloaded: announce.downloaded,
            uploaded: announce.uploaded,
            download_speed: orchestrator.current_download_speed(),
            upload_speed: orchestrator.current_upload_speed(),
            peers: orchestrator.swarm().connected_count(),
            completed_pieces: torrent.completed_count(),
            total_pieces: torrent.piece_count(),
            left: announce.left,
        }
    }

    /// Completed fraction in 0.0..=1.0
    pub fn progress(&self) -> f64 {
        if self.total_pieces == 0 {
            return 1.0;
        }
        self.completed_pieces as f64 / self.total_pieces as f64
    }

    /// Format bytes to human readable string
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit = 0;
        while size >= 1024.0 && unit < UNITS.len() - 1 {
            size /= 1024.0;
            unit += 1;
        }
        format!("{:.2} {}", size, UNITS[unit])
    }

    pub fn format_speed(bytes_per_sec: u64) -> String {
        format!("{}/s", Self::format_bytes(bytes_per_sec))
    }

    pub fn format_duration(duration: Duration) -> String {
        let total = duration.as_secs();
        let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Remaining time at the current download speed
    pub fn eta(&self) -> Option<Duration> {
        if self.download_speed == 0 || self.left == 0 {
            return None;
        }
        Some(Duration::from_secs(self.left / self.download_speed))
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let eta = self
            .eta()
            .map(Self::format_duration)
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{:.1}% ({}/{} pieces) | down {} at {} | up {} at {} | peers {} | eta {}",
            self.progress() * 100.0,
            self.completed_pieces,
            self.total_pieces,
            Self::format_bytes(self.downloaded),
            Self::format_speed(self.download_speed),
            Self::format_bytes(self.uploaded),
            Self::format_speed(self.upload_speed),
            self.peers,
            eta,
        )
    }
}

/// Rate-limited progress logger
pub struct ProgressReporter {
    start_time: Instant,
    last_report: Option<Instant>,
    interval: Duration,
    quiet: bool,
}

impl ProgressReporter {
    pub fn new(quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_report: None,
            interval,
            quiet,
        }
    }

    /// Log `stats` unless the previous report is more recent than the interval
    pub fn update(&mut self, stats: &TransferStats) -> bool {
        if self.quiet {
            return false;
        }
        if self.last_report.map_or(false, |t| t.elapsed() < self.interval) {
            return false;
        }
        self.last_report = Some(Instant::now());
        info!("{}", stats.summary());
        true
    }

    /// Final summary with elapsed time
    pub fn finish(&self, stats: &TransferStats) {
        if !self.quiet {
            info!(
                "Finished in {}: {}",
                TransferStats::format_duration(self.start_time.elapsed()),
                stats.summary()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_helpers() {
        assert_eq!(TransferStats::format_bytes(512), "512.00 B");
        assert_eq!(TransferStats::format_bytes(1536), "1.50 KB");
        assert_eq!(TransferStats::format_speed(1024 * 1024), "1.00 MB/s");
        assert_eq!(TransferStats::format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(TransferStats::format_duration(Duration::from_secs(42)), "42s");
    }

    #[test]
    fn test_progress_and_eta() {
        let stats = TransferStats {
            download_speed: 100,
            completed_pieces: 1,
            total_pieces: 4,
            left: 1000,
            ..Default::default()
        };
        assert_eq!(stats.progress(), 0.25);
        assert_eq!(stats.eta(), Some(Duration::from_secs(10)));
        assert!(stats.summary().starts_with("25.0% (1/4 pieces)"));

        let idle = TransferStats::default();
        assert_eq!(idle.progress(), 1.0);
        assert!(idle.eta().is_none());
    }

    #[test]
    fn test_reporter_throttles() {
        let stats = TransferStats::default();
        let mut reporter = ProgressReporter::new(false, Duration::from_secs(60));
        assert!(reporter.update(&stats));
        assert!(!reporter.update(&stats));

        let mut quiet = ProgressReporter::new(true, Duration::ZERO);
        assert!(!quiet.update(&stats));
    }
}
