//! Per-emitter RSSI smoothing.
//!
//! BLE RSSI is noisy and occasionally wild (body shadowing, reflections).
//! The filter keeps the last N raw samples, rejects outliers with a
//! Tukey 1.5×IQR fence once enough history has accumulated, and returns a
//! recency-weighted mean of the survivors.

use std::collections::VecDeque;

use crate::config::ReceiverConfig;

#[derive(Debug, Clone)]
pub struct RssiFilter {
    history: VecDeque<i32>,
    history_n: usize,
    outlier_arm_n: usize,
    iqr_min_retained: usize,
}

impl RssiFilter {
    pub fn new(cfg: &ReceiverConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(cfg.rssi_history_n),
            history_n: cfg.rssi_history_n,
            outlier_arm_n: cfg.rssi_outlier_arm_n,
            iqr_min_retained: cfg.rssi_iqr_min_retained,
        }
    }

    /// Record a raw sample and return the smoothed value, rounded to dBm.
    pub fn push(&mut self, raw_dbm: i32) -> i32 {
        self.history.push_back(raw_dbm);
        while self.history.len() > self.history_n {
            self.history.pop_front();
        }
        self.smoothed()
    }

    /// Weighted mean of the outlier-filtered history. Weights grow 1..n in
    /// arrival order so recent samples dominate.
    pub fn smoothed(&self) -> i32 {
        let values: Vec<f64> = self.history.iter().map(|&v| v as f64).collect();
        if values.is_empty() {
            return 0;
        }

        let retained = if values.len() >= self.outlier_arm_n {
            let mut sorted = values.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let q1 = quantile(&sorted, 0.25);
            let q3 = quantile(&sorted, 0.75);
            let iqr = q3 - q1;
            let lo = q1 - 1.5 * iqr;
            let hi = q3 + 1.5 * iqr;
            let kept: Vec<f64> =
                values.iter().copied().filter(|v| (lo..=hi).contains(v)).collect();
            if kept.len() < self.iqr_min_retained { values } else { kept }
        } else {
            values
        };

        let denom: f64 = (1..=retained.len()).sum::<usize>() as f64;
        let num: f64 = retained
            .iter()
            .enumerate()
            .map(|(i, v)| v * (i + 1) as f64)
            .sum();
        (num / denom).round() as i32
    }

    pub fn history(&self) -> &VecDeque<i32> {
        &self.history
    }
}

/// Linear-interpolated quantile of a sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
    }
}
