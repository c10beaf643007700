// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        flow::{FlowId, FlowState},
        frame::StationId,
        sequence::SeqNum,
    },
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of buffers; requested {0} bytes")]
    NoResources(usize),
    #[error("block-ack window has {free} free slots; {needed} required")]
    WindowFull { needed: usize, free: usize },
    #[error("sequence number {ssn} lies beyond the block-ack window starting at {head}")]
    OutsideWindow { ssn: SeqNum, head: SeqNum },
    #[error("sequence number {ssn} precedes the block-ack window starting at {head}")]
    StaleSequence { ssn: SeqNum, head: SeqNum },
    #[error("window slot for sequence number {ssn} is held by {occupant}")]
    SlotCollision { ssn: SeqNum, occupant: SeqNum },
    #[error("no aggregation flow for {0}")]
    UnknownFlow(FlowId),
    #[error("station {0} is already registered")]
    StationExists(StationId),
    #[error("{flow} cannot leave state {state:?} this way")]
    BadState { flow: FlowId, state: FlowState },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("error parsing configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("transmit backend rejected frame: {0}")]
    Transmit(String),
}
