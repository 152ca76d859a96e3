#![forbid(unsafe_code)]

// RTC stats aggregation - raw engine records to per-participant connection metrics

use super::engine::{RawStat, RawStatsReport, StreamKind};
use serde::Serialize;

const OUTBOUND_RTP: &str = "outbound-rtp";
const INBOUND_RTP: &str = "inbound-rtp";
const REMOTE_INBOUND_RTP: &str = "remote-inbound-rtp";
const CANDIDATE_PAIR: &str = "candidate-pair";

/// Connection quality classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Quality {
    #[default]
    Normal,
    Limited,
}

/// Derived connection metrics for one participant stream
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcMetric {
    pub participant_id: String,
    pub user_id: Option<String>,
    pub stream_kind: Option<StreamKind>,
    pub latency_ms: Option<f64>,
    pub fps: Option<f64>,
    pub packet_loss: Option<i64>,
    pub quality: Quality,
    /// Cumulative seconds the encoder was limited by CPU
    pub cpu_limited_secs: f64,
    /// Cumulative seconds the encoder was limited by bandwidth
    pub network_limited_secs: f64,
}

/// First record of each type found in a report
#[derive(Debug, Default)]
struct Classified<'a> {
    outbound: Option<&'a RawStat>,
    inbound: Option<&'a RawStat>,
    remote_inbound: Option<&'a RawStat>,
    candidate_pair: Option<&'a RawStat>,
}

fn classify(report: &RawStatsReport) -> Classified<'_> {
    let mut classified = Classified::default();
    for record in report.values() {
        let slot = match record.record_type.as_str() {
            OUTBOUND_RTP => &mut classified.outbound,
            INBOUND_RTP => &mut classified.inbound,
            REMOTE_INBOUND_RTP => &mut classified.remote_inbound,
            CANDIDATE_PAIR => &mut classified.candidate_pair,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(record);
        }
    }
    classified
}

/// Derives a metric from one raw report. `viewer` selects the inbound side
/// (a subscribed remote stream) over the outbound side (our own stream).
pub fn derive_metric(participant_id: &str, stream_kind: Option<StreamKind>, report: &RawStatsReport, viewer: bool) -> RtcMetric {
    let records = classify(report);

    let quality = match records.outbound.and_then(|o| o.quality_limitation_reason.as_deref()) {
        Some(reason) if reason != "none" => Quality::Limited,
        _ => Quality::Normal,
    };
    let latency_ms = records
        .candidate_pair
        .and_then(|c| c.current_round_trip_time)
        .map(|rtt| rtt * 1000.0);
    let (fps, packet_loss) = if viewer {
        (
            records.inbound.and_then(|r| r.frames_per_second),
            records.inbound.and_then(|r| r.packets_lost),
        )
    } else {
        (
            records.outbound.and_then(|r| r.frames_per_second),
            records.remote_inbound.and_then(|r| r.packets_lost),
        )
    };
    let durations = records.outbound.and_then(|o| o.quality_limitation_durations.as_ref());
    let limited = |key: &str| durations.and_then(|d| d.get(key).copied()).unwrap_or(0.0);

    RtcMetric {
        participant_id: participant_id.to_string(),
        user_id: None,
        stream_kind,
        latency_ms,
        fps,
        packet_loss,
        quality,
        cpu_limited_secs: limited("cpu"),
        network_limited_secs: limited("bandwidth"),
    }
}

/// Keeps the latest self metric and the per-participant viewer metrics.
#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    self_metric: Option<RtcMetric>,
    viewer_metrics: Vec<RtcMetric>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a report of one of our own published streams
    pub fn record_self(&mut self, participant_id: &str, stream_kind: StreamKind, report: &RawStatsReport) -> &RtcMetric {
        self.self_metric
            .insert(derive_metric(participant_id, Some(stream_kind), report, false))
    }

    /// Folds a report of a subscribed remote stream; replaces the
    /// participant's previous metric or appends a new one.
    pub fn record_viewer(
        &mut self,
        participant_id: &str,
        user_id: Option<&str>,
        stream_kind: StreamKind,
        report: &RawStatsReport,
    ) -> &RtcMetric {
        let mut metric = derive_metric(participant_id, Some(stream_kind), report, true);
        metric.user_id = user_id.map(str::to_string);
        let index = match self
            .viewer_metrics
            .iter()
            .position(|m| m.participant_id == participant_id)
        {
            Some(index) => {
                self.viewer_metrics[index] = metric;
                index
            }
            None => {
                self.viewer_metrics.push(metric);
                self.viewer_metrics.len() - 1
            }
        };
        &self.viewer_metrics[index]
    }

    /// Drops metrics of participants that are gone
    pub fn retain_participants(&mut self, keep: impl Fn(&str) -> bool) {
        self.viewer_metrics.retain(|m| keep(&m.participant_id));
    }

    pub fn self_metric(&self) -> Option<&RtcMetric> {
        self.self_metric.as_ref()
    }

    pub fn viewer_metrics(&self) -> &[RtcMetric] {
        &self.viewer_metrics
    }

    pub fn clear(&mut self) {
        self.self_metric = None;
        self.viewer_metrics.clear();
    }
}
