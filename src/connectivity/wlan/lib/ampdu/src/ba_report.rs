// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Block-ack report processing.
//!
//! A report names the MPDUs the firmware attempted (the manifest) together with the peer's
//! compressed bitmap. Acknowledged MPDUs are marked done, the rest are marked for retry, and the
//! window then retires whatever run of finished MPDUs begins at its head.
//!
//! See IEEE Std 802.11-2016, 9.3.1.9.3.

use {
    crate::{
        config::AmpduConfig,
        flow::{Flow, Outbox},
        frame::TxStatus,
        sequence::SeqNum,
        window::BA_WINDOW_CAPACITY,
    },
    log::{error, warn},
};

/// Number of MPDUs covered by a compressed block-ack bitmap.
pub const BA_BITMAP_BITS: u16 = 64;

/// Compressed block-ack bitmap as two little-endian words. Bit `i` acknowledges
/// `starting_ssn + i`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BaBitmap(pub [u32; 2]);

impl BaBitmap {
    pub fn from_u64(bits: u64) -> Self {
        Self([bits as u32, (bits >> 32) as u32])
    }

    pub fn is_set(&self, bit: u16) -> bool {
        bit < BA_BITMAP_BITS && self.0[(bit / 32) as usize] & (1 << (bit % 32)) != 0
    }

    /// Bit position of `ssn` in a bitmap starting at `start`, or `None` if it lies beyond the
    /// first `span` bits. `span` is the negotiated window size, capped at the bitmap length.
    pub fn bit_index(start: SeqNum, ssn: SeqNum, span: u16) -> Option<u16> {
        let distance = start.distance_to(ssn);
        if distance < span.min(BA_BITMAP_BITS) {
            Some(distance)
        } else {
            None
        }
    }
}

/// MPDUs attempted and acknowledged by one block-ack report, for rate control.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BaOutcome {
    pub attempted: usize,
    pub acked: usize,
}

impl Flow {
    /// Applies a block-ack bitmap to the frames named by `manifest`.
    ///
    /// Manifest entries missing from the window are logged and skipped. Sent frames named past the
    /// window capacity are dropped; frames already awaiting retry keep their place in the retry
    /// queue.
    pub(crate) fn ba_map_walker(
        &self,
        start: SeqNum,
        bitmap: &BaBitmap,
        manifest: &[SeqNum],
        config: &AmpduConfig,
        out: &mut Outbox,
    ) -> BaOutcome {
        let mut window = self.window.lock();
        if !self.is_operational() {
            return BaOutcome::default();
        }
        let mut acked = 0;
        let mut retries = 0;
        let mut dropped = 0;
        let span = window.size();
        for (i, &ssn) in manifest.iter().enumerate() {
            let frame = match window.get_mut(ssn) {
                Some(frame) => frame,
                None => {
                    error!("{}: block-ack for ssn {} which is not in the window", self.id, ssn);
                    self.stats.record_desync();
                    continue;
                }
            };
            if frame.status() != TxStatus::Sent {
                continue;
            }
            if i >= BA_WINDOW_CAPACITY {
                warn!("{}: block-ack manifest exceeds window; dropping ssn {}", self.id, ssn);
                frame.set_status(TxStatus::Dropped);
                dropped += 1;
                continue;
            }
            let covered =
                BaBitmap::bit_index(start, ssn, span).map_or(false, |bit| bitmap.is_set(bit));
            if covered {
                frame.set_status(TxStatus::Done);
                acked += 1;
            } else {
                retries += 1;
                if frame.mark_retry(config.max_retry) == TxStatus::Dropped {
                    dropped += 1;
                }
            }
        }
        let released = window.release_in_order();
        drop(window);

        for _ in 0..retries {
            self.stats.record_retry();
        }
        self.stats.record_discards(dropped);
        self.stats.record_ba_report(acked);
        out.complete(released);
        BaOutcome { attempted: manifest.len(), acked }
    }

    /// Applies a report that none of the frames in `manifest` were acknowledged.
    pub(crate) fn no_ba(
        &self,
        manifest: &[SeqNum],
        config: &AmpduConfig,
        out: &mut Outbox,
    ) -> usize {
        let mut window = self.window.lock();
        if !self.is_operational() {
            return 0;
        }
        let mut dropped = 0;
        for &ssn in manifest {
            match window.get_mut(ssn) {
                Some(frame) => {
                    if frame.mark_retry(config.max_retry) == TxStatus::Dropped {
                        dropped += 1;
                    }
                }
                None => {
                    error!("{}: no-BA for ssn {} which is not in the window", self.id, ssn);
                    self.stats.record_desync();
                }
            }
        }
        let released = window.release_in_order();
        drop(window);

        self.stats.record_no_ba();
        self.stats.record_discards(dropped);
        out.complete(released);
        manifest.len()
    }
}
