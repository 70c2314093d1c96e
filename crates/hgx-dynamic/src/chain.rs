//! Append-only frame chain
//!
//! Frames are kept in index order with their computed addresses. Only the
//! most recent `window` frames are retained; older ones are served by the
//! transport. A party that joins through a share grant starts its chain at
//! the granted head, so the first retained index need not be zero.

use std::collections::VecDeque;

use hgx_core::{Address, Frame, HgxError, Result};

#[derive(Debug, Clone)]
struct Link {
    frame: Frame,
    address: Address,
}

/// Accepted frames of one object
#[derive(Debug, Clone)]
pub struct FrameChain {
    object: Address,
    /// Index of the oldest retained frame
    base: u64,
    window: usize,
    links: VecDeque<Link>,
}

impl FrameChain {
    /// Empty chain expecting the genesis frame, retaining at most `window` frames
    pub fn new(object: Address, window: usize) -> Self {
        Self {
            object,
            base: 0,
            window: window.max(1),
            links: VecDeque::new(),
        }
    }

    /// Chain starting at a granted head frame
    pub fn starting_at(head: Frame, window: usize) -> Self {
        let address = head.address();
        Self {
            object: head.object,
            base: head.index,
            window: window.max(1),
            links: VecDeque::from([Link {
                frame: head,
                address,
            }]),
        }
    }

    /// Object the chain belongs to
    pub fn object(&self) -> &Address {
        &self.object
    }

    /// Index the next appended frame must carry
    pub fn next_index(&self) -> u64 {
        self.base + self.links.len() as u64
    }

    /// Address the next appended frame must name as previous
    pub fn head_address(&self) -> Address {
        self.links.back().map(|l| l.address).unwrap_or(self.object)
    }

    /// Most recently accepted frame
    pub fn head(&self) -> Option<&Frame> {
        self.links.back().map(|l| &l.frame)
    }

    /// Number of retained frames
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no frame is retained
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Append the frame at [`Self::next_index`]
    pub fn append(&mut self, frame: Frame) -> Result<Address> {
        let expected = self.next_index();
        if frame.object != self.object {
            return Err(HgxError::invalid("frame belongs to another object"));
        }
        if frame.index != expected {
            return Err(HgxError::ratchet_mismatch(
                self.object,
                frame.index,
                format!("chain expects index {expected}"),
            ));
        }
        if frame.previous != self.head_address() {
            return Err(HgxError::ratchet_mismatch(
                self.object,
                frame.index,
                "frame does not extend the chain head",
            ));
        }
        let address = frame.address();
        self.links.push_back(Link { frame, address });
        while self.links.len() > self.window {
            self.links.pop_front();
            self.base += 1;
        }
        Ok(address)
    }

    /// Frame accepted at `index`
    pub fn get(&self, index: u64) -> Option<&Frame> {
        self.position(index).map(|i| &self.links[i].frame)
    }

    /// Address of the frame accepted at `index`, if still retained
    pub fn address_at(&self, index: u64) -> Option<Address> {
        self.position(index).map(|i| self.links[i].address)
    }

    /// Frames in `[from, to)` that this chain still holds
    pub fn range(&self, from: u64, to: u64) -> impl Iterator<Item = &Frame> {
        self.links
            .iter()
            .map(|l| &l.frame)
            .filter(move |f| f.index >= from && f.index < to)
    }

    /// Drop every frame
    pub fn clear(&mut self) {
        self.base += self.links.len() as u64;
        self.links.clear();
    }

    fn position(&self, index: u64) -> Option<usize> {
        let offset = index.checked_sub(self.base)?;
        let offset = usize::try_from(offset).ok()?;
        (offset < self.links.len()).then_some(offset)
    }
}
