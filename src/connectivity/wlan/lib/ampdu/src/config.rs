// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{error::Error, rate::RateIndex, window::BA_WINDOW_CAPACITY},
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

/// Early-acknowledgement thresholds, counted in frames accepted but not yet completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectlyAckThresholds {
    /// Early acknowledgement stops once this many frames are in flight.
    pub high: usize,
    /// Early acknowledgement resumes once fewer than this many frames are in flight.
    pub low: usize,
}

/// Tunables of the aggregation engine. Missing fields take their default value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AmpduConfig {
    /// Upper bound on MPDUs per aggregate. Also clipped to the negotiated window size.
    pub max_aggregate_count: usize,
    /// Attempts after which an unacknowledged MPDU is dropped.
    pub max_retry: u8,
    /// How long a sent MPDU may wait for a block-ack before it is retried.
    pub ba_wait_timeout_ms: u64,
    /// Interval of the periodic timeout sweep.
    pub sweep_period_ms: u64,
    /// Bytes the hardware appends to each MPDU when the pairwise cipher is AEAD (CCMP MIC).
    pub aead_mic_len: usize,
    /// Largest aggregate the peer accepts, in bytes.
    pub max_ampdu_size: usize,
    /// Rate used to size aggregates when the scheduled rate cannot carry one.
    pub fallback_rate: RateIndex,
    /// Queued-aggregate frame count at which the backend queue is throttled.
    pub flow_control_high: usize,
    /// Queued-aggregate frame count at which the throttle is released.
    pub flow_control_low: usize,
    pub directly_ack: Option<DirectlyAckThresholds>,
}

impl Default for AmpduConfig {
    fn default() -> Self {
        Self {
            max_aggregate_count: 24,
            max_retry: 2,
            ba_wait_timeout_ms: 100,
            sweep_period_ms: 50,
            aead_mic_len: 8,
            max_ampdu_size: 65535,
            fallback_rate: RateIndex::HT_MCS0,
            flow_control_high: 48,
            flow_control_low: 24,
            directly_ack: None,
        }
    }
}

impl AmpduConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for malformed JSON or unknown fields and `Error::InvalidConfig` for
    /// out-of-range values.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_aggregate_count == 0 || self.max_aggregate_count > BA_WINDOW_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "max_aggregate_count {} not in [1, {}]",
                self.max_aggregate_count, BA_WINDOW_CAPACITY
            )));
        }
        if self.max_retry == 0 {
            return Err(Error::InvalidConfig("max_retry must be positive".to_string()));
        }
        if self.ba_wait_timeout_ms == 0 || self.sweep_period_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be positive".to_string()));
        }
        if self.max_ampdu_size == 0 {
            return Err(Error::InvalidConfig("max_ampdu_size must be positive".to_string()));
        }
        if self.flow_control_low > self.flow_control_high {
            return Err(Error::InvalidConfig(format!(
                "flow control low watermark {} above high watermark {}",
                self.flow_control_low, self.flow_control_high
            )));
        }
        if let Some(thresholds) = self.directly_ack {
            if thresholds.low > thresholds.high {
                return Err(Error::InvalidConfig(format!(
                    "directly-ack low threshold {} above high threshold {}",
                    thresholds.low, thresholds.high
                )));
            }
        }
        Ok(())
    }

    pub fn ba_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.ba_wait_timeout_ms)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms)
    }
}
