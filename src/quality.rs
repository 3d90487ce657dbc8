//! Rolling per-participant network quality scoring and threshold alerts.

use crate::id_types::ParticipantId;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, warn};

/// Derived quality bucket, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Low,
    Medium,
    High,
}

impl QualityLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => QualityLevel::High,
            50..=79 => QualityLevel::Medium,
            _ => QualityLevel::Low,
        }
    }
}

/// Raw transport statistics for one participant, one sampling interval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransportStats {
    /// Packet loss in percent.
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub rtt_ms: f64,
    /// Estimated available downlink bandwidth, bits per second.
    pub available_bps: u64,
    /// Pre-computed score; when present it overrides local scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
}

/// One scored sample retained in the rolling window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualitySample {
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub rtt_ms: f64,
    pub available_bps: u64,
    pub score: u8,
    pub level: QualityLevel,
    pub at: DateTime<Utc>,
}

/// Warning/critical pair for one metric where larger is worse.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

/// Warning/critical floor for bandwidth, where smaller is worse.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandwidthFloor {
    pub warning: u64,
    pub critical: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub packet_loss: Threshold,
    pub rtt: Threshold,
    pub jitter: Threshold,
    pub min_bandwidth: BandwidthFloor,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        QualityThresholds {
            packet_loss: Threshold {
                warning: 3.0,
                critical: 10.0,
            },
            rtt: Threshold {
                warning: 200.0,
                critical: 500.0,
            },
            jitter: Threshold {
                warning: 50.0,
                critical: 100.0,
            },
            min_bandwidth: BandwidthFloor {
                warning: 500_000,
                critical: 250_000,
            },
        }
    }
}

/// Banded scoring over loss, RTT, jitter and bandwidth; total 100.
pub fn score_stats(stats: &TransportStats) -> u8 {
    let loss = match stats.packet_loss {
        l if l < 1.0 => 40,
        l if l < 3.0 => 30,
        l if l < 5.0 => 20,
        l if l < 10.0 => 10,
        _ => 0,
    };
    let rtt = match stats.rtt_ms {
        r if r < 100.0 => 30,
        r if r < 200.0 => 20,
        r if r < 400.0 => 10,
        _ => 0,
    };
    let jitter = match stats.jitter_ms {
        j if j < 20.0 => 20,
        j if j < 50.0 => 15,
        j if j < 100.0 => 10,
        _ => 0,
    };
    let bandwidth = match stats.available_bps {
        b if b > 3_000_000 => 10,
        b if b > 1_000_000 => 7,
        b if b > 500_000 => 4,
        _ => 0,
    };
    loss + rtt + jitter + bandwidth
}

pub type LevelChangeHandler =
    dyn Fn(&ParticipantId, QualityLevel, QualityLevel) + Send + Sync;

/// Ingests periodic transport stats and keeps a bounded per-participant
/// history. Threshold crossings become observability events; level
/// transitions invoke the registered handler.
pub struct QualityMonitor {
    history: DashMap<ParticipantId, VecDeque<QualitySample>>,
    history_limit: usize,
    thresholds: QualityThresholds,
    on_level_change: RwLock<Option<Arc<LevelChangeHandler>>>,
}

impl QualityMonitor {
    pub fn new(thresholds: QualityThresholds, history_limit: usize) -> Self {
        QualityMonitor {
            history: DashMap::new(),
            history_limit: history_limit.max(1),
            thresholds,
            on_level_change: RwLock::new(None),
        }
    }

    /// Registers the handler invoked on every level transition. Replaces
    /// any previous handler.
    pub fn on_level_change<F>(&self, handler: F)
    where
        F: Fn(&ParticipantId, QualityLevel, QualityLevel) + Send + Sync + 'static,
    {
        *self.on_level_change.write().unwrap() = Some(Arc::new(handler));
    }

    /// Scores and records one sample, returning it.
    pub fn record(&self, participant: &ParticipantId, stats: TransportStats) -> QualitySample {
        let score = stats.score.unwrap_or_else(|| score_stats(&stats));
        let level = QualityLevel::from_score(score);
        let sample = QualitySample {
            packet_loss: stats.packet_loss,
            jitter_ms: stats.jitter_ms,
            rtt_ms: stats.rtt_ms,
            available_bps: stats.available_bps,
            score,
            level,
            at: Utc::now(),
        };

        self.check_thresholds(participant, &sample);

        let previous_level = {
            let mut window = self
                .history
                .entry(participant.clone())
                .or_insert_with(VecDeque::new);
            let previous = window.back().map(|s| s.level);
            if window.len() == self.history_limit {
                window.pop_front();
            }
            window.push_back(sample);
            previous
        };

        if let Some(previous) = previous_level {
            if previous != level {
                let handler = self.on_level_change.read().unwrap().clone();
                if let Some(handler) = handler {
                    handler(participant, previous, level);
                }
            }
        }
        sample
    }

    fn check_thresholds(&self, participant: &ParticipantId, sample: &QualitySample) {
        let t = &self.thresholds;
        if sample.packet_loss >= t.packet_loss.critical {
            error!(participant = %participant, packet_loss = sample.packet_loss, "packet loss above critical threshold");
        } else if sample.packet_loss >= t.packet_loss.warning {
            warn!(participant = %participant, packet_loss = sample.packet_loss, "packet loss above warning threshold");
        }
        if sample.rtt_ms >= t.rtt.critical {
            error!(participant = %participant, rtt_ms = sample.rtt_ms, "round-trip time above critical threshold");
        } else if sample.rtt_ms >= t.rtt.warning {
            warn!(participant = %participant, rtt_ms = sample.rtt_ms, "round-trip time above warning threshold");
        }
        if sample.jitter_ms >= t.jitter.critical {
            error!(participant = %participant, jitter_ms = sample.jitter_ms, "jitter above critical threshold");
        } else if sample.jitter_ms >= t.jitter.warning {
            warn!(participant = %participant, jitter_ms = sample.jitter_ms, "jitter above warning threshold");
        }
        if sample.available_bps <= t.min_bandwidth.critical {
            error!(participant = %participant, available_bps = sample.available_bps, "bandwidth below critical floor");
        } else if sample.available_bps <= t.min_bandwidth.warning {
            warn!(participant = %participant, available_bps = sample.available_bps, "bandwidth below warning floor");
        }
    }

    /// Latest derived level, if any sample exists.
    pub fn level(&self, participant: &ParticipantId) -> Option<QualityLevel> {
        self.history
            .get(participant)
            .and_then(|window| window.back().map(|s| s.level))
    }

    /// Latest bandwidth estimate, if any sample exists.
    pub fn available_bps(&self, participant: &ParticipantId) -> Option<u64> {
        self.history
            .get(participant)
            .and_then(|window| window.back().map(|s| s.available_bps))
    }

    /// Mean score over samples recorded in the past `window`.
    pub fn average_score(&self, participant: &ParticipantId, window: Duration) -> Option<f64> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::seconds(0));
        let history = self.history.get(participant)?;
        let recent: Vec<u8> = history
            .iter()
            .filter(|s| s.at >= cutoff)
            .map(|s| s.score)
            .collect();
        if recent.is_empty() {
            return None;
        }
        Some(recent.iter().map(|&s| s as f64).sum::<f64>() / recent.len() as f64)
    }

    pub fn samples(&self, participant: &ParticipantId) -> Vec<QualitySample> {
        self.history
            .get(participant)
            .map(|window| window.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops all state for a departed participant.
    pub fn forget(&self, participant: &ParticipantId) {
        self.history.remove(participant);
    }
}
