// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Transmit-side A-MPDU aggregation with block-ack bookkeeping, for SoftMAC devices whose firmware
//! leaves aggregation to the host.
//!
//! Frames handed to a [`Device`] are packed into aggregates per station and TID, tracked in a
//! block-ack window until the peer acknowledges them, retried when reports or timeouts say they
//! were lost, and completed strictly in sequence-number order. The bus, the rate controller and
//! the OS transmit-status path are supplied by the caller through the [`Transmitter`],
//! [`RateSource`] and [`CompletionSink`] traits.
//!
//! [`Device`]: crate::device::Device
//! [`Transmitter`]: crate::device::Transmitter
//! [`RateSource`]: crate::device::RateSource
//! [`CompletionSink`]: crate::device::CompletionSink

pub mod aggregate;
pub mod ba_report;
pub mod config;
pub mod device;
pub mod error;
pub mod flow;
pub mod frame;
pub mod rate;
mod retry;
pub mod sequence;
pub mod stats;
#[cfg(test)]
mod test_utils;
pub mod window;
pub mod worker;

pub use {
    ba_report::{BaBitmap, BaOutcome},
    config::AmpduConfig,
    device::{
        AcceptOutcome, CompletionSink, Device, QueueId, RateSource, Transmitter, TxFlags, TxUnit,
    },
    error::Error,
    flow::{FlowId, FlowState},
    frame::{Frame, StationId, TxStatus},
    rate::{RateIndex, RateSchedule, StaticRateTable},
    sequence::SeqNum,
};
