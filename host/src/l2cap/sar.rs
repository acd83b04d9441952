use heapless::Vec;

use crate::config::L2CAP_MTU;
use crate::types::l2cap::{Frame, L2CAP_HEADER_LEN};
use crate::Error;

// Handles reassembling of L2CAP frames split over several HCI ACL packets.
pub(crate) struct AclReassembly {
    frame: Frame,
    // Target length of the assembly, basic header included.
    target: usize,
}

impl AclReassembly {
    pub const fn new() -> Self {
        Self {
            frame: Frame::new(),
            target: 0,
        }
    }

    /// Returns whether or not there is a reassembly in progress.
    pub fn in_progress(&self) -> bool {
        self.target != 0
    }

    /// Deletes any reassembly in progress.
    pub fn clear(&mut self) {
        self.frame.clear();
        self.target = 0;
    }

    /// Start a new frame from the first ACL fragment.
    ///
    /// Returns the complete frame if the fragment carries all of it.
    /// Returns InvalidValue if the frame does not fit in a buffer or if the
    /// fragment is longer than the frame it starts.
    pub fn start(&mut self, data: &[u8]) -> Result<Option<Frame>, Error> {
        self.clear();
        let [l0, l1, ..] = data else {
            return Err(Error::InvalidValue);
        };
        let target = L2CAP_HEADER_LEN + u16::from_le_bytes([*l0, *l1]) as usize;
        if data.len() < L2CAP_HEADER_LEN || data.len() > target || target > self.frame.capacity() {
            return Err(Error::InvalidValue);
        }
        self.frame.extend_from_slice(data).map_err(|_| Error::OutOfMemory)?;
        self.target = target;
        Ok(self.take_if_complete())
    }

    /// Updates the frame in progress with a continuation fragment.
    ///
    /// If the reassembly is complete, the complete frame is returned.
    pub fn update(&mut self, data: &[u8]) -> Result<Option<Frame>, Error> {
        if !self.in_progress() {
            return Err(Error::NotFound);
        }
        if self.frame.len() + data.len() > self.target {
            self.clear();
            return Err(Error::InvalidValue);
        }
        self.frame.extend_from_slice(data).map_err(|_| Error::OutOfMemory)?;
        Ok(self.take_if_complete())
    }

    fn take_if_complete(&mut self) -> Option<Frame> {
        if self.frame.len() == self.target {
            let frame = core::mem::take(&mut self.frame);
            self.target = 0;
            Some(frame)
        } else {
            None
        }
    }
}

/// Reassembly of an SDU received over an LE credit based channel.
pub(crate) struct SduReassembly {
    sdu: Vec<u8, L2CAP_MTU>,
    length: Option<u16>,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SduError {
    /// First K-frame shorter than the SDU length field.
    MissingLength,
    /// Announced SDU length larger than the receive MTU.
    TooLarge,
    /// Segments carry more data than the SDU length announced.
    Overflow,
}

impl SduReassembly {
    pub const fn new() -> Self {
        Self {
            sdu: Vec::new(),
            length: None,
        }
    }

    pub fn clear(&mut self) {
        self.sdu.clear();
        self.length = None;
    }

    /// Add the payload of one K-frame. Returns the SDU once it is complete.
    pub fn push(&mut self, payload: &[u8], mtu: u16) -> Result<Option<&[u8]>, SduError> {
        let data = match self.length {
            Some(_) => payload,
            None => {
                let [l0, l1, rest @ ..] = payload else {
                    return Err(SduError::MissingLength);
                };
                let length = u16::from_le_bytes([*l0, *l1]);
                if length > mtu || length as usize > self.sdu.capacity() {
                    return Err(SduError::TooLarge);
                }
                self.sdu.clear();
                self.length = Some(length);
                rest
            }
        };
        let target = self.length.unwrap_or(0) as usize;
        if self.sdu.len() + data.len() > target {
            self.clear();
            return Err(SduError::Overflow);
        }
        self.sdu.extend_from_slice(data).map_err(|_| SduError::Overflow)?;
        if self.sdu.len() == target {
            self.length = None;
            Ok(Some(&self.sdu[..]))
        } else {
            Ok(None)
        }
    }
}

/// Splits an SDU into K-frame payloads, the first one prefixed by the SDU length.
pub(crate) struct Segmenter<'a> {
    data: &'a [u8],
    first: bool,
    mps: usize,
}

impl<'a> Segmenter<'a> {
    pub fn new(data: &'a [u8], mps: usize) -> Self {
        Self {
            data,
            first: true,
            mps: mps.max(3),
        }
    }

    /// Number of K-frames needed for an SDU of `len` bytes.
    pub fn count(len: usize, mps: usize) -> usize {
        let mps = mps.max(3);
        (len + 2).div_ceil(mps)
    }
}

impl<'a> Iterator for Segmenter<'a> {
    /// SDU length prefix (only on the first segment) and payload.
    type Item = (Option<u16>, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.first {
            self.first = false;
            let n = self.data.len().min(self.mps - 2);
            let (head, tail) = self.data.split_at(n);
            let len = self.data.len() as u16;
            self.data = tail;
            return Some((Some(len), head));
        }
        if self.data.is_empty() {
            return None;
        }
        let n = self.data.len().min(self.mps);
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some((None, head))
    }
}
