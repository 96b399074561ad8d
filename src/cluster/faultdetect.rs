// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Edge fault detection.
//!
//! Every member runs one [EdgeMonitor] per subject it observes. The monitor
//! probes its subject on a fixed interval and feeds heartbeat inter-arrival
//! times into an [AdaptiveAccrualFailureDetector]; when the current silence
//! becomes unusual relative to the sampled history, the edge is reported
//! down to the local state machine.
use super::proto::{rapid_response, Endpoint, NodeStatus, ProbeMessage};
use super::Msg;
use crate::transport::Client;
use log::{debug, info};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};

/// An accrual failure estimator over heartbeat inter-arrival times.
///
/// `suspicion(t)` is the fraction of sampled intervals that fit within the
/// scaled silence `α·(t − freshness)`: the longer the silence relative to
/// history, the more intervals fit, and the likelier the peer is dead.
///
/// Not thread-safe; each instance is owned by a single monitor. Two
/// instances fed the same history report identical suspicion.
pub struct AdaptiveAccrualFailureDetector {
    threshold: f64,
    max_sample_size: usize,
    scaling_factor: f64,
    intervals: VecDeque<u64>,
    freshness: Option<u64>,
}

impl AdaptiveAccrualFailureDetector {
    /// Create a detector.
    ///
    /// # Panics
    /// Panics unless `threshold > 0`, `max_sample_size > 0` and
    /// `scaling_factor > 0`.
    pub fn new(threshold: f64, max_sample_size: usize, scaling_factor: f64) -> Self {
        assert!(threshold > 0.0);
        assert!(max_sample_size > 0);
        assert!(scaling_factor > 0.0);

        Self {
            threshold,
            max_sample_size,
            scaling_factor,
            intervals: VecDeque::new(),
            freshness: None,
        }
    }

    /// Record a heartbeat at `now` (nanoseconds on a monotonic clock).
    ///
    /// The first heartbeat only establishes the freshness point; no
    /// interval is recorded for it.
    pub fn heartbeat(&mut self, now: u64) {
        let Some(freshness) = self.freshness.replace(now) else {
            return;
        };

        if self.intervals.len() == self.max_sample_size {
            self.intervals.pop_front();
        }
        self.intervals.push_back(now.saturating_sub(freshness));
    }

    /// The suspicion level at `now`, in `[0, 1]`.
    pub fn suspicion(&self, now: u64) -> f64 {
        let Some(freshness) = self.freshness else {
            return 0.0;
        };
        if self.intervals.is_empty() {
            return 0.0;
        }

        let silence = now.saturating_sub(freshness) as f64 * self.scaling_factor;
        let fitting = (self.intervals.iter())
            .filter(|&&interval| interval as f64 <= silence)
            .count();

        fitting as f64 / self.intervals.len() as f64
    }

    /// Whether the peer looks alive at `now`.
    pub fn is_available(&self, now: u64) -> bool {
        self.suspicion(now) < self.threshold
    }
}

/// The number of `BOOTSTRAPPING` probe responses that still count as
/// heartbeats; past this, a perpetually joining peer stops looking healthy.
pub const BOOTSTRAP_COUNT_LIMIT: usize = 30;

/// A cooperative task probing one subject on behalf of the local observer.
///
/// Monitors are aborted when the state machine leaves its Active state and
/// re-created against the next configuration, so a stale report can never
/// outlive the view it was observed in.
pub(crate) struct EdgeMonitor {
    pub(crate) local: Endpoint,
    pub(crate) subject: Endpoint,
    pub(crate) configuration_id: u64,
    pub(crate) detector: AdaptiveAccrualFailureDetector,
    pub(crate) client: Arc<dyn Client>,
    pub(crate) inbox: mpsc::Sender<Msg>,
    pub(crate) interval: Duration,
    pub(crate) probe_timeout: Duration,
    pub(crate) expect_first_heartbeat_after: Duration,
}

impl EdgeMonitor {
    /// Probe the subject until it fails or the monitor is aborted.
    pub(crate) async fn run(mut self) {
        let started = Instant::now();
        let mut ticker = time::interval(self.interval);

        // the first real heartbeat arrives after connection setup; one
        // synthetic heartbeat keeps that latency out of the sample.
        let mut synthetic_pending = true;

        // heartbeats counts every probe reply applied to the detector;
        // bootstraps counts the subset that were BOOTSTRAPPING, which stop
        // being applied past the cap so a perpetually joining peer runs
        // out of heartbeats like any other silent one.
        let mut heartbeats = 0usize;
        let mut bootstraps = 0usize;

        loop {
            ticker.tick().await;
            let now = started.elapsed().as_nanos() as u64;

            if synthetic_pending && started.elapsed() >= self.expect_first_heartbeat_after {
                // only worth doing if the subject hasn't answered yet;
                // otherwise it would record a near-zero interval.
                if heartbeats == 0 {
                    self.detector.heartbeat(now);
                }
                synthetic_pending = false;
            }

            if heartbeats > 0 && !self.detector.is_available(now) {
                info!(
                    "subject unavailable: subject={} suspicion={:.3}",
                    self.subject,
                    self.detector.suspicion(now)
                );

                let down = Msg::SubjectDown {
                    configuration_id: self.configuration_id,
                    subject: self.subject.clone(),
                };

                // report exactly once, then stop probing. late probe
                // responses die with the task.
                let _ = self.inbox.send(down).await;
                return;
            }

            let probe = ProbeMessage {
                sender: self.local.clone(),
            };

            let send = self.client.send(&self.subject, probe.into());
            match time::timeout(self.probe_timeout, send).await {
                Ok(Ok(resp)) => match resp.content {
                    Some(rapid_response::Content::Probe(p))
                        if p.node_status() == NodeStatus::Ok =>
                    {
                        self.detector.heartbeat(started.elapsed().as_nanos() as u64);
                        heartbeats += 1;
                    }
                    Some(rapid_response::Content::Probe(_)) if bootstraps < BOOTSTRAP_COUNT_LIMIT => {
                        self.detector.heartbeat(started.elapsed().as_nanos() as u64);
                        heartbeats += 1;
                        bootstraps += 1;
                    }
                    _ => {}
                },
                Ok(Err(e)) => debug!("probe of {} failed: {}", self.subject, e),
                Err(_) => debug!("probe of {} timed out", self.subject),
            }
        }
    }
}
