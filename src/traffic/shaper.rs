//! Traffic shaping
//!
//! A [`TrafficShaper`] holds an upload and a download limiter plus raw byte
//! counters. Per-peer shapers are created as children of the torrent shaper:
//! bytes counted on a child are also counted (and limited) on the parent.
//! Current rates are only ever derived from the raw counters by [`sample`].
//!
//! [`sample`]: TrafficShaper::sample

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::limiter::RateLimiter;

/// Throughput sampled over the last interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    /// Configured download ceiling (0 = unlimited)
    pub download_limit: u64,
    /// Configured upload ceiling (0 = unlimited)
    pub upload_limit: u64,
    /// Sampled download rate in bytes/sec
    pub download_rate: u64,
    /// Sampled upload rate in bytes/sec
    pub upload_rate: u64,
}

#[derive(Debug)]
struct SampleState {
    last_downloaded: u64,
    last_uploaded: u64,
    last_sample: Instant,
    download_rate: u64,
    upload_rate: u64,
}

/// Rate limiting and throughput accounting for a torrent or a single peer
#[derive(Debug)]
pub struct TrafficShaper {
    download: RateLimiter,
    upload: RateLimiter,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    sample: Mutex<SampleState>,
    parent: Option<Arc<TrafficShaper>>,
    children: Mutex<Vec<Weak<TrafficShaper>>>,
}

impl TrafficShaper {
    /// Create a top-level shaper (0 = unlimited)
    pub fn new(download_limit: u64, upload_limit: u64) -> Arc<Self> {
        Arc::new(Self::build(download_limit, upload_limit, None))
    }

    /// Create a shaper whose traffic also counts against `self`
    pub fn child(self: &Arc<Self>, download_limit: u64, upload_limit: u64) -> Arc<Self> {
        let child = Arc::new(Self::build(download_limit, upload_limit, Some(self.clone())));
        let mut children = self.children.lock();
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child));
        child
    }

    fn build(download_limit: u64, upload_limit: u64, parent: Option<Arc<TrafficShaper>>) -> Self {
        Self {
            download: RateLimiter::new(download_limit),
            upload: RateLimiter::new(upload_limit),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            sample: Mutex::new(SampleState {
                last_downloaded: 0,
                last_uploaded: 0,
                last_sample: Instant::now(),
                download_rate: 0,
                upload_rate: 0,
            }),
            parent,
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn set_download_limit(&self, bytes_per_sec: u64) {
        debug!("Download limit set to {} B/s", bytes_per_sec);
        self.download.set_rate(bytes_per_sec);
    }

    pub fn set_upload_limit(&self, bytes_per_sec: u64) {
        debug!("Upload limit set to {} B/s", bytes_per_sec);
        self.upload.set_rate(bytes_per_sec);
    }

    pub fn download_limit(&self) -> u64 {
        self.download.rate()
    }

    pub fn upload_limit(&self) -> u64 {
        self.upload.rate()
    }

    /// Total bytes received
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Total bytes sent
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Download rate as of the last sample
    pub fn current_download_speed(&self) -> u64 {
        self.sample.lock().download_rate
    }

    /// Upload rate as of the last sample
    pub fn current_upload_speed(&self) -> u64 {
        self.sample.lock().upload_rate
    }

    pub fn counters(&self) -> TrafficCounters {
        let sample = self.sample.lock();
        TrafficCounters {
            download_limit: self.download_limit(),
            upload_limit: self.upload_limit(),
            download_rate: sample.download_rate,
            upload_rate: sample.upload_rate,
        }
    }

    /// Count `bytes` received and wait until the allowance covers them
    pub async fn throttle_download(&self, bytes: usize) {
        let mut shaper = Some(self);
        while let Some(current) = shaper {
            current.downloaded.fetch_add(bytes as u64, Ordering::Relaxed);
            current.download.acquire(bytes).await;
            shaper = current.parent.as_deref();
        }
    }

    /// Wait until the allowance covers `bytes`, then count them as sent
    pub async fn throttle_upload(&self, bytes: usize) {
        let mut shaper = Some(self);
        while let Some(current) = shaper {
            current.upload.acquire(bytes).await;
            current.uploaded.fetch_add(bytes as u64, Ordering::Relaxed);
            shaper = current.parent.as_deref();
        }
    }

    /// Recompute current rates from the raw counters, for this shaper and its live children
    pub fn sample(&self) {
        {
            let mut sample = self.sample.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(sample.last_sample).as_secs_f64();
            if elapsed > 0.0 {
                let downloaded = self.downloaded();
                let uploaded = self.uploaded();
                sample.download_rate = ((downloaded - sample.last_downloaded) as f64 / elapsed) as u64;
                sample.upload_rate = ((uploaded - sample.last_uploaded) as f64 / elapsed) as u64;
                sample.last_downloaded = downloaded;
                sample.last_uploaded = uploaded;
                sample.last_sample = now;
                trace!("Sampled rates: down {} B/s, up {} B/s", sample.download_rate, sample.upload_rate);
            }
        }

        let children: Vec<Arc<TrafficShaper>> = {
            let mut children = self.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.sample();
        }
    }

    /// Sample every `interval` until the returned task is aborted
    pub fn spawn_sampler(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let shaper = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match shaper.upgrade() {
                    Some(shaper) => shaper.sample(),
                    None => break,
                }
            }
        })
    }
}
