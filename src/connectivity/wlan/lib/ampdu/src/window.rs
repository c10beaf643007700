// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Block-ack window of an originator.
//!
//! The window maps each outstanding sequence number to the frame sent with it. Slots are indexed
//! by `ssn % BA_WINDOW_CAPACITY`. Frames may be acknowledged in any order, but they leave the
//! window strictly in sequence order starting at the head.
//!
//! See IEEE Std 802.11-2016, 10.24.7.

use {
    crate::{
        error::Error,
        frame::{Frame, FrameArena, FrameHandle, TxStatus},
        sequence::{SeqNum, SEQ_MODULUS},
    },
    log::{debug, error},
};

/// Largest negotiable block-ack buffer size, and the number of window slots.
pub const BA_WINDOW_CAPACITY: usize = 64;

/// Snapshot of a window for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowStatus {
    /// Oldest outstanding sequence number, or `None` when the window is empty.
    pub head: Option<SeqNum>,
    /// Tracked number of occupied slots.
    pub occupancy: usize,
    /// Number of occupied slots found by inspecting every slot.
    pub occupied_slots: usize,
    /// Negotiated window size.
    pub size: u16,
}

pub struct BlockAckWindow {
    slots: [Option<FrameHandle>; BA_WINDOW_CAPACITY],
    frames: FrameArena,
    head: Option<SeqNum>,
    occupancy: usize,
    size: u16,
}

impl Default for BlockAckWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockAckWindow {
    pub fn new() -> Self {
        Self {
            slots: [None; BA_WINDOW_CAPACITY],
            frames: FrameArena::new(),
            head: None,
            occupancy: 0,
            size: BA_WINDOW_CAPACITY as u16,
        }
    }

    pub fn head(&self) -> Option<SeqNum> {
        self.head
    }

    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Sets the negotiated window size, clipped to `[1, BA_WINDOW_CAPACITY]`. A size of zero
    /// selects the full capacity.
    pub fn set_size(&mut self, size: u16) {
        self.size = match size {
            0 => BA_WINDOW_CAPACITY as u16,
            n => n.min(BA_WINDOW_CAPACITY as u16),
        };
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn free_slots(&self) -> usize {
        BA_WINDOW_CAPACITY.saturating_sub(self.occupancy)
    }

    pub fn status(&self) -> WindowStatus {
        WindowStatus {
            head: self.head,
            occupancy: self.occupancy,
            occupied_slots: self.occupied_slots(),
            size: self.size,
        }
    }

    fn occupied_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Checks that every frame of `manifest` could be inserted without disturbing the window.
    ///
    /// Each sequence number must fall within `window_size` of the head (or of the first manifest
    /// entry when the window is empty) and map to a free slot.
    pub fn can_accept(&self, manifest: &[SeqNum]) -> Result<(), Error> {
        let first = match manifest.first() {
            Some(first) => *first,
            None => return Ok(()),
        };
        if manifest.len() > self.free_slots() {
            return Err(Error::WindowFull { needed: manifest.len(), free: self.free_slots() });
        }
        let head = self.head.unwrap_or(first);
        for &ssn in manifest {
            if ssn.precedes(head) {
                return Err(Error::StaleSequence { ssn, head });
            }
            if head.distance_to(ssn) >= self.size {
                return Err(Error::OutsideWindow { ssn, head });
            }
            if let Some(occupant) = self.occupant(ssn) {
                return Err(Error::SlotCollision { ssn, occupant });
            }
        }
        Ok(())
    }

    /// Sequence number of whatever frame occupies the slot `ssn` maps to.
    fn occupant(&self, ssn: SeqNum) -> Option<SeqNum> {
        let handle = self.slots[ssn.slot(BA_WINDOW_CAPACITY)]?;
        self.frames.get(handle).map(Frame::ssn)
    }

    /// Frees the slot for `ssn` and returns its previous occupant, if any. An occupied slot means
    /// the window lost track of a frame; the occupant is abandoned and handed back so that it can
    /// still be completed.
    fn acquire_slot(&mut self, ssn: SeqNum) -> Option<Frame> {
        let index = ssn.slot(BA_WINDOW_CAPACITY);
        let handle = self.slots[index].take()?;
        self.occupancy = self.occupancy.saturating_sub(1);
        let abandoned = self.frames.remove(handle);
        error!(
            "window slot {} for ssn {} already held ssn {:?}; abandoning it",
            index,
            ssn,
            abandoned.as_ref().map(Frame::ssn)
        );
        abandoned
    }

    /// Places `frame` in the slot for its sequence number. The head is set to the frame if the
    /// window was empty. Returns any frame that was abandoned to make room.
    pub fn insert(&mut self, frame: Frame) -> Option<Frame> {
        let ssn = frame.ssn();
        let abandoned = self.acquire_slot(ssn);
        let handle = self.frames.insert(frame);
        self.slots[ssn.slot(BA_WINDOW_CAPACITY)] = Some(handle);
        self.occupancy += 1;
        if self.head.is_none() {
            self.head = Some(ssn);
        }
        abandoned
    }

    pub fn handle(&self, ssn: SeqNum) -> Option<FrameHandle> {
        let handle = self.slots[ssn.slot(BA_WINDOW_CAPACITY)]?;
        match self.frames.get(handle) {
            Some(frame) if frame.ssn() == ssn => Some(handle),
            _ => None,
        }
    }

    /// Returns the frame sent with `ssn`. A slot holding a different sequence number yields
    /// `None`.
    pub fn get(&self, ssn: SeqNum) -> Option<&Frame> {
        self.handle(ssn).and_then(|handle| self.frames.get(handle))
    }

    pub fn get_mut(&mut self, ssn: SeqNum) -> Option<&mut Frame> {
        let handle = self.handle(ssn)?;
        self.frames.get_mut(handle)
    }

    pub fn get_by_handle(&self, handle: FrameHandle) -> Option<&Frame> {
        self.frames.get(handle)
    }

    pub fn get_mut_by_handle(&mut self, handle: FrameHandle) -> Option<&mut Frame> {
        self.frames.get_mut(handle)
    }

    /// Takes a frame out of the window regardless of its position. Does not move the head.
    pub fn take(&mut self, handle: FrameHandle) -> Option<Frame> {
        let index = self.frames.get(handle)?.ssn().slot(BA_WINDOW_CAPACITY);
        if self.slots[index] == Some(handle) {
            self.slots[index] = None;
            self.occupancy = self.occupancy.saturating_sub(1);
        }
        self.frames.remove(handle)
    }

    /// Visits every occupied slot from the head forward, passing the offset from the head, the
    /// frame handle and the frame.
    pub fn for_each_outstanding<F>(&mut self, mut f: F)
    where
        F: FnMut(u16, FrameHandle, &mut Frame),
    {
        let head = match self.head {
            Some(head) => head,
            None => return,
        };
        for offset in 0..BA_WINDOW_CAPACITY as u16 {
            let ssn = head.add(offset);
            let handle = match self.handle(ssn) {
                Some(handle) => handle,
                None => continue,
            };
            if let Some(frame) = self.frames.get_mut(handle) {
                f(offset, handle, frame);
            }
        }
    }

    /// Retires the contiguous run of `Done` or `Dropped` frames starting at the head.
    ///
    /// Stops at the first frame that is still outstanding. An empty slot at the head empties the
    /// window when nothing else is tracked. Otherwise the head moves to the next occupied slot;
    /// such gaps are left by frames sent outside the window as singletons.
    pub fn release_in_order(&mut self) -> Vec<Frame> {
        let mut released = Vec::new();
        while let Some(head) = self.head {
            let index = head.slot(BA_WINDOW_CAPACITY);
            let handle = match self.slots[index] {
                Some(handle) => handle,
                None => {
                    if self.occupancy == 0 {
                        self.head = None;
                    } else {
                        debug!(
                            "block-ack window head {} is empty with {} frames outstanding",
                            head, self.occupancy
                        );
                        self.head = self.next_occupied(head);
                        if self.head.is_none() {
                            error!("block-ack window lost all {} frames", self.occupancy);
                            self.occupancy = 0;
                        }
                    }
                    continue;
                }
            };
            let retired = match self.frames.get(handle) {
                Some(frame) if frame.ssn() != head => {
                    error!("block-ack window head {} holds ssn {}", head, frame.ssn());
                    self.head = Some(frame.ssn());
                    continue;
                }
                Some(frame) => frame.status().is_retired(),
                None => {
                    error!("block-ack window slot {} held a stale handle", index);
                    self.slots[index] = None;
                    self.occupancy = self.occupancy.saturating_sub(1);
                    continue;
                }
            };
            if !retired {
                break;
            }
            self.slots[index] = None;
            self.occupancy = self.occupancy.saturating_sub(1);
            if let Some(frame) = self.frames.remove(handle) {
                released.push(frame);
            }
            self.head = Some(head.next());
        }
        released
    }

    /// Sequence number of the first occupied slot after `from`.
    fn next_occupied(&self, from: SeqNum) -> Option<SeqNum> {
        (1..BA_WINDOW_CAPACITY).find_map(|offset| {
            let index = (from.slot(BA_WINDOW_CAPACITY) + offset) % BA_WINDOW_CAPACITY;
            self.slots[index].and_then(|handle| self.frames.get(handle)).map(Frame::ssn)
        })
    }

    /// Marks every outstanding frame `Dropped`, except frames waiting in the retry queue.
    pub fn drop_outstanding(&mut self) {
        self.for_each_outstanding(|_, _, frame| {
            if frame.status() != TxStatus::RetryQueued {
                frame.set_status(TxStatus::Dropped);
            }
        });
    }

    /// Empties the window, returning every frame ordered from the head.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut handles: Vec<FrameHandle> =
            self.slots.iter_mut().filter_map(Option::take).collect();
        if let Some(head) = self.head {
            handles.sort_by_key(|&handle| {
                self.frames.get(handle).map_or(SEQ_MODULUS, |frame| head.distance_to(frame.ssn()))
            });
        }
        self.head = None;
        self.occupancy = 0;
        handles.into_iter().filter_map(|handle| self.frames.remove(handle)).collect()
    }

    /// Compares the tracked occupancy with the slots actually in use. A mismatch is logged and
    /// reported but left in place.
    pub fn verify_occupancy(&self) -> bool {
        let occupied = self.occupied_slots();
        if occupied != self.occupancy {
            error!(
                "block-ack window occupancy {} does not match {} occupied slots (head {:?})",
                self.occupancy, occupied, self.head
            );
            return false;
        }
        true
    }
}
