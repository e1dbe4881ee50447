//! Pattern detection over the audit stream.
//!
//! A thin, pure consumer of [`AuditEntry`](crate::audit::AuditEntry)
//! batches: no I/O, no state between scans. Runs asynchronously from the
//! hot path - callers load a range from the audit log and hand it over.
//!
//! Three generic patterns are flagged; business rules built on top of
//! them (referral payouts, account suspension) live outside the core.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use crate::audit::AuditEntry;

/// Event-data key naming the referring subject on referral events.
const REFERRER_KEY: &str = "referrer";

/// Event-data key naming the referred subject on referral events.
const REFERRED_KEY: &str = "referred";

/// Event-data key carrying a device fingerprint, when the caller has one.
const DEVICE_KEY: &str = "device";

/// Thresholds for the pattern scan.
#[derive(Debug, Clone, Copy)]
pub struct FraudConfig {
    /// Window for the spam-burst count
    pub spam_window: Duration,
    /// Events by one subject inside the window that count as a burst
    pub spam_threshold: u32,
    /// Distinct subjects on one device that count as a cluster
    pub device_cluster_threshold: u32,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            spam_window: Duration::from_secs(60),
            spam_threshold: 20,
            device_cluster_threshold: 3,
        }
    }
}

/// A flagged pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FraudSignal {
    /// A subject referred itself
    SelfReferral {
        /// The subject on both sides of the referral
        subject_id: String,
    },
    /// Many subjects share one device fingerprint
    DeviceCluster {
        /// The shared device fingerprint
        device: String,
        /// Subjects seen on it, sorted
        subjects: Vec<String>,
    },
    /// One subject produced an event burst
    SpamBurst {
        /// The bursting subject
        subject_id: String,
        /// Events counted inside the window
        count: u32,
    },
}

/// Stateless scanner for fraud patterns.
#[derive(Debug, Clone, Default)]
pub struct FraudDetector {
    config: FraudConfig,
}

impl FraudDetector {
    /// Create a detector with the given thresholds.
    pub fn new(config: FraudConfig) -> Self {
        Self { config }
    }

    /// Scan a batch of audit entries for fraud patterns.
    ///
    /// Entries are expected in chain order (ascending timestamp); each
    /// pattern is reported at most once per offender.
    pub fn scan(&self, entries: &[AuditEntry]) -> Vec<FraudSignal> {
        let mut signals = Vec::new();
        self.scan_self_referrals(entries, &mut signals);
        self.scan_device_clusters(entries, &mut signals);
        self.scan_spam_bursts(entries, &mut signals);
        signals
    }

    fn scan_self_referrals(&self, entries: &[AuditEntry], signals: &mut Vec<FraudSignal>) {
        let mut flagged = BTreeSet::new();
        for entry in entries {
            let (Some(referrer), Some(referred)) =
                (entry.event_data.get(REFERRER_KEY), entry.event_data.get(REFERRED_KEY))
            else {
                continue;
            };
            if referrer == referred && flagged.insert(referrer.clone()) {
                signals.push(FraudSignal::SelfReferral { subject_id: referrer.clone() });
            }
        }
    }

    fn scan_device_clusters(&self, entries: &[AuditEntry], signals: &mut Vec<FraudSignal>) {
        let mut by_device: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for entry in entries {
            if let Some(device) = entry.event_data.get(DEVICE_KEY) {
                by_device.entry(device).or_default().insert(&entry.subject_id);
            }
        }

        for (device, subjects) in by_device {
            if subjects.len() as u32 >= self.config.device_cluster_threshold {
                signals.push(FraudSignal::DeviceCluster {
                    device: device.to_string(),
                    subjects: subjects.into_iter().map(str::to_string).collect(),
                });
            }
        }
    }

    fn scan_spam_bursts(&self, entries: &[AuditEntry], signals: &mut Vec<FraudSignal>) {
        let window_ms = self.config.spam_window.as_millis() as u64;
        let mut by_subject: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
        for entry in entries {
            by_subject.entry(&entry.subject_id).or_default().push(entry.timestamp);
        }

        for (subject, timestamps) in by_subject {
            let mut window_start = 0usize;
            for end in 0..timestamps.len() {
                while timestamps[window_start] + window_ms <= timestamps[end] {
                    window_start += 1;
                }
                let count = (end - window_start + 1) as u32;
                if count >= self.config.spam_threshold {
                    signals.push(FraudSignal::SpamBurst { subject_id: subject.to_string(), count });
                    break;
                }
            }
        }
    }
}
