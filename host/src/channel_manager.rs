use crate::channel::{ChannelState, ChannelStorage};
use crate::types::l2cap::L2CAP_CID_DYN_START;
use crate::Error;

const BASE_ID: u16 = L2CAP_CID_DYN_START;

/// Arena of channel control blocks.
///
/// The local CID of a channel is derived from its slot index, so a free slot is
/// all the state an allocation needs.
pub(crate) struct ChannelManager<'d> {
    channels: &'d mut [ChannelStorage],
}

impl<'d> ChannelManager<'d> {
    pub(crate) fn new(channels: &'d mut [ChannelStorage]) -> Self {
        for channel in channels.iter_mut() {
            channel.reset();
        }
        Self { channels }
    }

    pub(crate) fn cid(index: usize) -> u16 {
        BASE_ID + index as u16
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn get(&self, index: usize) -> &ChannelStorage {
        &self.channels[index]
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut ChannelStorage {
        &mut self.channels[index]
    }

    /// Slot index of an in-use channel by local CID.
    pub(crate) fn index_of(&self, cid: u16) -> Option<usize> {
        let index = cid.checked_sub(BASE_ID)? as usize;
        match self.channels.get(index) {
            Some(c) if c.in_use() => Some(index),
            _ => None,
        }
    }

    pub(crate) fn find_by_local_cid(&self, link: usize, cid: u16) -> Option<usize> {
        self.index_of(cid).filter(|i| self.channels[*i].link == link)
    }

    /// Remote CIDs are only unique within one link.
    pub(crate) fn find_by_remote_cid(&self, link: usize, remote_cid: u16) -> Option<usize> {
        if remote_cid == 0 {
            return None;
        }
        self.channels
            .iter()
            .position(|c| c.on_link(link) && c.remote_cid == remote_cid)
    }

    /// Channel on `link` waiting for the response to our request `id`.
    pub(crate) fn find_by_local_id(&self, link: usize, id: u8) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| c.on_link(link) && c.local_id == id && c.state == ChannelState::W4L2capConnectRsp)
    }

    pub(crate) fn count_on_link(&self, link: usize) -> usize {
        self.channels.iter().filter(|c| c.on_link(link)).count()
    }

    /// Indices of the channels on `link`, starting at slot `from` and wrapping around.
    pub(crate) fn on_link_from(&self, link: usize, from: usize) -> impl Iterator<Item = usize> + '_ {
        let n = self.channels.len();
        (0..n)
            .map(move |i| (from + i) % n)
            .filter(move |i| self.channels[*i].on_link(link))
    }

    /// Allocate a channel on `link`.
    ///
    /// Fails with ChannelLimitExceeded if every slot is taken or if the link
    /// already carries `max_per_link` channels.
    pub(crate) fn alloc(&mut self, link: usize, max_per_link: usize) -> Result<usize, Error> {
        if self.count_on_link(link) >= max_per_link {
            warn!("[l2cap] link {} reached its channel limit", link);
            return Err(Error::ChannelLimitExceeded);
        }
        for (idx, storage) in self.channels.iter_mut().enumerate() {
            if !storage.in_use() {
                storage.reset();
                storage.state = ChannelState::Closed;
                storage.link = link;
                trace!("[l2cap][cid = {}] allocated on link {}", Self::cid(idx), link);
                return Ok(idx);
            }
        }
        warn!("[l2cap] no free channel slot");
        Err(Error::ChannelLimitExceeded)
    }

    /// Free a channel slot, dropping anything still queued on it.
    pub(crate) fn release(&mut self, index: usize) {
        trace!("[l2cap][cid = {}] released", Self::cid(index));
        self.channels[index].reset();
    }
}
