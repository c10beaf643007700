// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        aggregate::AmpduTx,
        config::AmpduConfig,
        device::{CompletionSink, Device, QueueId, RateSource, Transmitter, TxFlags, TxUnit},
        error::Error,
        frame::{Frame, StationId},
        rate::{RateIndex, RateSchedule},
    },
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

pub struct FakeTransmitter {
    pub ampdus: Mutex<Vec<(AmpduTx, QueueId, TxFlags)>>,
    pub mpdus: Mutex<Vec<(Frame, QueueId)>>,
    pub throttles: Mutex<Vec<(QueueId, bool)>>,
    pub idle: AtomicBool,
    pub fail_sends: AtomicBool,
}

impl FakeTransmitter {
    pub fn new() -> Self {
        Self {
            ampdus: Mutex::new(vec![]),
            mpdus: Mutex::new(vec![]),
            throttles: Mutex::new(vec![]),
            idle: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn take_ampdus(&self) -> Vec<AmpduTx> {
        self.ampdus.lock().drain(..).map(|(ampdu, _, _)| ampdu).collect()
    }

    pub fn manifests(&self) -> Vec<Vec<u16>> {
        self.ampdus
            .lock()
            .iter()
            .map(|(ampdu, _, _)| ampdu.manifest.iter().map(|ssn| ssn.get()).collect())
            .collect()
    }
}

impl Transmitter for FakeTransmitter {
    fn send(&self, unit: TxUnit, queue: QueueId, flags: TxFlags) -> Result<(), Error> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transmit("fake transmitter failure".to_string()));
        }
        match unit {
            TxUnit::Ampdu(ampdu) => self.ampdus.lock().push((ampdu, queue, flags)),
            TxUnit::Mpdu(frame) => self.mpdus.lock().push((frame, queue)),
        }
        Ok(())
    }

    fn queue_is_empty(&self, _queue: QueueId) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    fn set_queue_throttle(&self, queue: QueueId, enabled: bool) {
        self.throttles.lock().push((queue, enabled));
    }
}

/// Answers every rate with `default_length` unless overridden.
pub struct FakeRateSource {
    pub default_length: usize,
    pub lengths: Mutex<HashMap<RateIndex, usize>>,
    pub reports: Mutex<Vec<(StationId, u8, usize, usize)>>,
}

impl FakeRateSource {
    pub fn new(default_length: usize) -> Self {
        Self { default_length, lengths: Mutex::new(HashMap::new()), reports: Mutex::new(vec![]) }
    }

    pub fn set_length(&self, rate: RateIndex, length: usize) {
        self.lengths.lock().insert(rate, length);
    }
}

impl RateSource for FakeRateSource {
    fn max_aggregate_length(&self, _station: StationId, rate: RateIndex) -> usize {
        self.lengths.lock().get(&rate).copied().unwrap_or(self.default_length)
    }

    fn retry_schedule(&self, _station: StationId, current: &RateSchedule) -> RateSchedule {
        RateSchedule::single(current.lowest())
    }

    fn on_ampdu_report(&self, station: StationId, tid: u8, attempted: usize, acked: usize) {
        self.reports.lock().push((station, tid, attempted, acked));
    }
}

pub struct RecordingSink {
    pub completions: Mutex<Vec<(Frame, bool)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self { completions: Mutex::new(vec![]) }
    }

    /// Sequence numbers completed so far with their acknowledgement, in completion order.
    pub fn completed(&self) -> Vec<(u16, bool)> {
        self.completions.lock().iter().map(|(frame, acked)| (frame.ssn().get(), *acked)).collect()
    }
}

impl CompletionSink for RecordingSink {
    fn notify(&self, frame: Frame, acked: bool) {
        self.completions.lock().push((frame, acked));
    }
}

pub struct TestHarness {
    pub device: Arc<Device>,
    pub transmitter: Arc<FakeTransmitter>,
    pub rate_source: Arc<FakeRateSource>,
    pub sink: Arc<RecordingSink>,
}

impl TestHarness {
    pub fn new(config: AmpduConfig, default_length: usize) -> Self {
        let transmitter = Arc::new(FakeTransmitter::new());
        let rate_source = Arc::new(FakeRateSource::new(default_length));
        let sink = Arc::new(RecordingSink::new());
        let device = Arc::new(
            Device::new(config, transmitter.clone(), rate_source.clone(), sink.clone())
                .expect("valid test config"),
        );
        Self { device, transmitter, rate_source, sink }
    }
}
