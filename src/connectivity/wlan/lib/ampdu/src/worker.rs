// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Event threads driving a `Device`.
//!
//! The transmit thread takes frames from the OS stack. The status thread takes block-ack reports
//! and transmit completions from firmware, and runs the periodic sweep whenever a sweep period has
//! passed. Both only talk to the device through its public operations, so reports race freely with
//! aggregation.

use {
    crate::{
        ba_report::BaBitmap,
        device::Device,
        flow::FlowId,
        frame::Frame,
        sequence::SeqNum,
    },
    anyhow::{bail, format_err, Error},
    crossbeam::channel::{self, select, Receiver, Sender},
    log::{error, info, warn},
    std::{
        sync::Arc,
        thread::{self, JoinHandle},
        time::Instant,
    },
};

pub enum TxEvent {
    Frame(Frame),
    Stop,
}

pub enum RxEvent {
    BlockAck { flow: FlowId, starting_ssn: SeqNum, bitmap: BaBitmap, manifest: Vec<SeqNum> },
    NoBlockAck { flow: FlowId, manifest: Vec<SeqNum> },
    Stop,
}

/// Transmit status from the backend.
pub enum TxCompletion {
    AggregateSent { flow: FlowId, manifest: Vec<SeqNum>, at: Instant },
    /// The backend drained its queues.
    QueueIdle,
}

pub struct AmpduWorkers {
    tx_sender: Sender<TxEvent>,
    rx_sender: Sender<RxEvent>,
    completion_sender: Sender<TxCompletion>,
    tx_thread: JoinHandle<Result<(), Error>>,
    rx_thread: JoinHandle<Result<(), Error>>,
}

impl AmpduWorkers {
    pub fn spawn(device: Arc<Device>) -> Result<Self, Error> {
        let (tx_sender, tx_receiver) = channel::unbounded();
        let (rx_sender, rx_receiver) = channel::unbounded();
        let (completion_sender, completion_receiver) = channel::unbounded();

        let tx_device = device.clone();
        let tx_thread = thread::Builder::new()
            .name("ampdu-tx".to_string())
            .spawn(move || serve_tx(tx_device, tx_receiver))?;
        let rx_thread = thread::Builder::new()
            .name("ampdu-status".to_string())
            .spawn(move || serve_rx(device, rx_receiver, completion_receiver))?;
        Ok(Self { tx_sender, rx_sender, completion_sender, tx_thread, rx_thread })
    }

    pub fn tx_sender(&self) -> Sender<TxEvent> {
        self.tx_sender.clone()
    }

    pub fn rx_sender(&self) -> Sender<RxEvent> {
        self.rx_sender.clone()
    }

    pub fn completion_sender(&self) -> Sender<TxCompletion> {
        self.completion_sender.clone()
    }

    /// Stops both threads once they have handled every event sent on their own channel before
    /// this call.
    pub fn shutdown(self) -> Result<(), Error> {
        // A thread that already exited reports its own error on join.
        let _ = self.tx_sender.send(TxEvent::Stop);
        let _ = self.rx_sender.send(RxEvent::Stop);
        let tx_result =
            self.tx_thread.join().map_err(|_| format_err!("AMPDU transmit thread panicked"))?;
        let rx_result =
            self.rx_thread.join().map_err(|_| format_err!("AMPDU status thread panicked"))?;
        tx_result?;
        rx_result
    }
}

fn serve_tx(device: Arc<Device>, events: Receiver<TxEvent>) -> Result<(), Error> {
    loop {
        match events.recv() {
            Ok(TxEvent::Frame(frame)) => {
                if let Err(e) = device.accept(frame) {
                    error!("failed to transmit frame: {}", e);
                }
            }
            Ok(TxEvent::Stop) => {
                info!("AMPDU transmit thread stopping");
                return Ok(());
            }
            Err(_) => bail!("AMPDU transmit event stream closed"),
        }
    }
}

fn serve_rx(
    device: Arc<Device>,
    events: Receiver<RxEvent>,
    completions: Receiver<TxCompletion>,
) -> Result<(), Error> {
    let period = device.config().sweep_period();
    let mut next_sweep = Instant::now() + period;
    loop {
        let wait = next_sweep.saturating_duration_since(Instant::now());
        select! {
            recv(events) -> event => match event {
                Ok(RxEvent::BlockAck { flow, starting_ssn, bitmap, manifest }) => {
                    if let Err(e) = device.on_ba_report(flow, starting_ssn, bitmap, &manifest[..]) {
                        warn!("dropping block-ack report: {}", e);
                    }
                }
                Ok(RxEvent::NoBlockAck { flow, manifest }) => {
                    if let Err(e) = device.on_no_ba(flow, &manifest[..]) {
                        warn!("dropping missing block-ack report: {}", e);
                    }
                }
                Ok(RxEvent::Stop) => {
                    info!("AMPDU status thread stopping");
                    return Ok(());
                }
                Err(_) => bail!("AMPDU status event stream closed"),
            },
            recv(completions) -> completion => match completion {
                Ok(TxCompletion::AggregateSent { flow, manifest, at }) => {
                    if let Err(e) = device.on_aggregate_sent(flow, &manifest[..], at) {
                        warn!("dropping transmit status: {}", e);
                    }
                }
                Ok(TxCompletion::QueueIdle) => {
                    device.ampdu_flush();
                }
                Err(_) => bail!("AMPDU completion stream closed"),
            },
            default(wait) => {}
        }
        let now = Instant::now();
        if now >= next_sweep {
            device.periodic_sweep(now);
            next_sweep = now + period;
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::AmpduConfig,
            frame::{test_utils::make_frame, StationId},
            test_utils::TestHarness,
        },
        std::time::Duration,
    };

    fn flow_id() -> FlowId {
        FlowId::new(StationId(1), 0)
    }

    fn harness(config: AmpduConfig) -> TestHarness {
        let h = TestHarness::new(config, 65535);
        h.device.add_station(StationId(1)).expect("add station");
        h.device.start_flow(flow_id()).expect("start flow");
        h.device.operational(flow_id(), 64).expect("operational");
        h
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for workers");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn frames_flow_through_workers() {
        let h = harness(AmpduConfig { ba_wait_timeout_ms: 60_000, ..AmpduConfig::default() });
        let workers = AmpduWorkers::spawn(h.device.clone()).expect("spawn workers");
        h.transmitter.set_idle(false);
        let tx = workers.tx_sender();
        for ssn in 0..3 {
            tx.send(TxEvent::Frame(make_frame(1, 0, ssn, 100))).expect("send frame");
        }
        wait_for(|| h.device.frames_in_flight() == 3);
        assert!(h.transmitter.ampdus.lock().is_empty());

        workers.completion_sender().send(TxCompletion::QueueIdle).expect("send idle");
        wait_for(|| !h.transmitter.ampdus.lock().is_empty());
        let manifest: Vec<SeqNum> = (0..3).map(SeqNum::new).collect();
        assert_eq!(h.transmitter.take_ampdus()[0].manifest, manifest);

        h.device.on_aggregate_sent(flow_id(), &manifest[..], Instant::now()).expect("sent");
        workers
            .rx_sender()
            .send(RxEvent::BlockAck {
                flow: flow_id(),
                starting_ssn: SeqNum::new(0),
                bitmap: BaBitmap::from_u64(0b111),
                manifest,
            })
            .expect("send block-ack");
        workers.shutdown().expect("shutdown");

        assert_eq!(h.sink.completed(), vec![(0, true), (1, true), (2, true)]);
    }

    #[test]
    fn sweep_retries_unacknowledged_frames() {
        let config =
            AmpduConfig { ba_wait_timeout_ms: 20, sweep_period_ms: 5, ..AmpduConfig::default() };
        let h = harness(config);
        let workers = AmpduWorkers::spawn(h.device.clone()).expect("spawn workers");
        workers.tx_sender().send(TxEvent::Frame(make_frame(1, 0, 0, 100))).expect("send frame");
        wait_for(|| !h.transmitter.ampdus.lock().is_empty());
        workers
            .completion_sender()
            .send(TxCompletion::AggregateSent {
                flow: flow_id(),
                manifest: vec![SeqNum::new(0)],
                at: Instant::now(),
            })
            .expect("send status");

        wait_for(|| h.transmitter.ampdus.lock().iter().any(|(ampdu, _, _)| ampdu.retry));
        workers.shutdown().expect("shutdown");
        assert!(h.sink.completed().is_empty());
    }

    #[test]
    fn reports_for_unknown_flows_are_ignored() {
        let h = harness(AmpduConfig::default());
        let workers = AmpduWorkers::spawn(h.device.clone()).expect("spawn workers");
        workers
            .rx_sender()
            .send(RxEvent::NoBlockAck {
                flow: FlowId::new(StationId(9), 0),
                manifest: vec![SeqNum::new(0)],
            })
            .expect("send report");
        workers.shutdown().expect("shutdown");
        assert!(h.rate_source.reports.lock().is_empty());
    }
}
