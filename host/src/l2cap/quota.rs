//! Sharing of controller ACL buffers between links.
//!
//! High priority links get a fixed quota each, the rest is split between the low
//! priority links. When there are more low priority links than buffers left, they
//! share the remainder in round-robin fashion with one packet in flight each.

use bt_hci::param::ConnHandle;

use crate::channel_manager::ChannelManager;
use crate::context::L2capContext;
use crate::link::{AclPriority, LinkState, LinkTimer};

impl<'d> L2capContext<'d> {
    /// Recompute the transmit quota of every link.
    pub(crate) fn adjust_allocation(&mut self) {
        let buffers = self.config.controller_buffers;
        let (mut num_high, mut num_low) = (0u16, 0u16);
        for (_, l) in self.links.iter() {
            match l.priority {
                AclPriority::High => num_high += 1,
                AclPriority::Normal => num_low += 1,
            }
        }
        if num_high == 0 && num_low == 0 {
            self.round_robin = Default::default();
            return;
        }

        let reserved = if num_low > 0 { 1 } else { 0 };
        let mut high_quota = self.config.max_high_priority_quota;
        while high_quota > 0 && num_high * high_quota + reserved > buffers {
            high_quota -= 1;
        }
        let high_total = num_high * high_quota;
        let low_total = if high_total < buffers { buffers - high_total } else { 1 };

        let (per_link, mut remainder) = if num_low > low_total {
            self.round_robin.quota = low_total;
            (1, 0)
        } else if num_low > 0 {
            self.round_robin = Default::default();
            (low_total / num_low, low_total % num_low)
        } else {
            self.round_robin = Default::default();
            (1, 0)
        };
        debug!(
            "[quota] high links {} x {}, low links {} sharing {}, round robin {}",
            num_high, high_quota, num_low, low_total, self.round_robin.quota
        );

        let mut rr_unacked = 0;
        for link in 0..self.links.len() {
            let l = self.links.get_mut(link);
            if !l.in_use() {
                continue;
            }
            match l.priority {
                AclPriority::High => l.quota = high_quota,
                AclPriority::Normal => {
                    l.quota = per_link;
                    if remainder > 0 {
                        l.quota += 1;
                        remainder -= 1;
                    }
                    rr_unacked += l.sent_not_acked;
                }
            }
            trace!(
                "[quota] link {} {:?} quota {} in flight {}",
                link,
                l.priority,
                l.quota,
                l.sent_not_acked
            );
        }
        if self.round_robin.quota > 0 {
            self.round_robin.unacked = rr_unacked;
        }

        let timeout = self.config.link_flow_control_timeout;
        for link in 0..self.links.len() {
            let l = self.links.get(link);
            if l.state == LinkState::Connected && l.sent_not_acked >= l.quota && self.has_queued(link) {
                trace!("[quota] link {} waiting for buffers", link);
                self.links.get_mut(link).timer = Some((self.now + timeout, LinkTimer::FlowControl));
            }
        }
    }

    /// Whether anything is waiting to be sent on `link`.
    fn has_queued(&self, link: usize) -> bool {
        !self.links.get(link).signal_queue.is_empty()
            || self
                .channels
                .on_link_from(link, 0)
                .any(|idx| !self.channels.get(idx).tx.is_empty())
    }

    fn in_round_robin(&self, link: usize) -> bool {
        self.round_robin.quota > 0 && self.links.get(link).priority == AclPriority::Normal
    }

    fn can_send(&self, link: usize) -> bool {
        let l = self.links.get(link);
        if l.sent_not_acked >= l.quota {
            return false;
        }
        !self.in_round_robin(link) || self.round_robin.unacked < self.round_robin.quota
    }

    /// Move frames of every link to the outbox.
    pub(crate) fn service_all(&mut self) {
        for link in 0..self.links.len() {
            if self.links.get(link).state == LinkState::Connected {
                self.service_link(link);
            }
        }
    }

    /// Move frames of `link` to the outbox while it has quota left.
    ///
    /// Signalling goes first, then channels take turns one frame at a time.
    pub(crate) fn service_link(&mut self, link: usize) {
        let l = self.links.get(link);
        let Some(handle) = l.handle else {
            return;
        };
        if l.state != LinkState::Connected {
            return;
        }
        let mut sent = 0;
        while !self.outbox.is_full() && self.can_send(link) {
            let frame = match self.links.get_mut(link).signal_queue.pop_front() {
                Some(frame) => frame,
                None => match self.next_channel_frame(link) {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if self.in_round_robin(link) {
                self.round_robin.unacked += 1;
            }
            self.links.get_mut(link).sent_not_acked += 1;
            if self.outbox.push_back((handle, frame)).is_err() {
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            trace!("[quota][handle = {}] sent {} frames", handle.raw(), sent);
        }
        self.clear_congestion(link);
    }

    /// Take the next frame from the channels of `link`, round robin.
    fn next_channel_frame(&mut self, link: usize) -> Option<crate::types::l2cap::Frame> {
        let from = self.links.get(link).next_channel;
        let idx = self.channels.on_link_from(link, from).find(|idx| {
            let ch = self.channels.get(*idx);
            !ch.tx.is_empty() && (!ch.is_le() || ch.le.peer_credits > 0)
        })?;
        let ch = self.channels.get_mut(idx);
        let frame = ch.tx.pop_front()?;
        if ch.is_le() {
            ch.le.peer_credits -= 1;
        }
        self.links.get_mut(link).next_channel = (idx + 1) % self.channels.len();
        Some(frame)
    }

    /// Tell sinks their channel drained below the congestion threshold.
    fn clear_congestion(&mut self, link: usize) {
        let threshold = self.config.cong_threshold;
        for idx in 0..self.channels.len() {
            let ch = self.channels.get_mut(idx);
            if !ch.on_link(link) || !ch.cong_sent || ch.congested(threshold) {
                continue;
            }
            ch.cong_sent = false;
            debug!("[l2cap][cid = {}] congestion cleared", ChannelManager::cid(idx));
            if let Some(sink) = self.sink_of(idx) {
                sink.on_congestion_changed(ChannelManager::cid(idx), false);
            }
        }
    }

    /// HCI number of completed packets event for one handle.
    pub fn on_completed_packets(&mut self, handle: ConnHandle, completed: u16) {
        let Some(link) = self.links.find_by_handle(handle) else {
            debug!("[quota] completed packets for unknown handle {}", handle.raw());
            return;
        };
        if self.in_round_robin(link) {
            self.round_robin.unacked = self.round_robin.unacked.saturating_sub(completed);
        }
        let l = self.links.get_mut(link);
        l.sent_not_acked = l.sent_not_acked.saturating_sub(completed);
        if matches!(l.timer, Some((_, LinkTimer::FlowControl))) {
            l.timer = None;
        }
        self.service_all();
    }
}
