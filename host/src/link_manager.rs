use bt_hci::param::{BdAddr, ConnHandle};

use crate::link::{LinkState, LinkStorage};
use crate::types::Transport;
use crate::Error;

/// Arena of link control blocks.
///
/// A link is identified by its slot index for its whole lifetime. There is never
/// more than one link per address and transport.
pub(crate) struct LinkManager<'d> {
    links: &'d mut [LinkStorage],
}

impl<'d> LinkManager<'d> {
    pub(crate) fn new(links: &'d mut [LinkStorage]) -> Self {
        for link in links.iter_mut() {
            link.reset();
        }
        Self { links }
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    pub(crate) fn get(&self, index: usize) -> &LinkStorage {
        &self.links[index]
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut LinkStorage {
        &mut self.links[index]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &LinkStorage)> {
        self.links.iter().enumerate().filter(|(_, l)| l.in_use())
    }

    pub(crate) fn find_by_handle(&self, handle: ConnHandle) -> Option<usize> {
        self.links
            .iter()
            .position(|l| l.in_use() && l.handle == Some(handle))
    }

    pub(crate) fn find_by_addr(&self, addr: &BdAddr, transport: Transport) -> Option<usize> {
        self.links.iter().position(|l| l.is(addr, transport))
    }

    /// Look up the link to `addr`, creating it if there is none.
    ///
    /// Returns the slot index and whether the link was created by this call.
    pub(crate) fn find_or_create(&mut self, addr: &BdAddr, transport: Transport) -> Result<(usize, bool), Error> {
        if let Some(index) = self.find_by_addr(addr, transport) {
            return Ok((index, false));
        }
        for (index, link) in self.links.iter_mut().enumerate() {
            if !link.in_use() {
                link.reset();
                link.state = LinkState::Connecting;
                link.addr.replace(*addr);
                link.transport = transport;
                trace!("[link][idx = {}] allocated", index);
                return Ok((index, true));
            }
        }
        warn!("[link] no free link slot");
        Err(Error::LinkLimitExceeded)
    }

    pub(crate) fn release(&mut self, index: usize) {
        trace!("[link][idx = {}] released", index);
        self.links[index].reset();
    }

    pub(crate) fn print(&self) {
        for (idx, link) in self.iter() {
            debug!("[link][idx = {}] {:?}", idx, link);
        }
    }
}
