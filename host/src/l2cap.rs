//! HCI input, frame routing and timers.

use bt_hci::cmd::link_control::DisconnectParams;
use bt_hci::data::{AclPacketBoundary, AclPacketHeader};
use bt_hci::param::{BdAddr, ConnHandle, DisconnectReason, LeConnRole};
use bt_hci::FromHciBytes;
use embassy_time::Instant;

use crate::channel::ChannelState;
use crate::codec;
use crate::context::{HciCommand, L2capContext};
use crate::link::{InfoExchange, LinkState, LinkTimer};
use crate::sink::{ConnectResult, DisconnectResult};
use crate::types::l2cap::{
    decode_l2cap_header, Frame, SignalCode, L2CAP_CID_ATT, L2CAP_CID_CONNECTIONLESS, L2CAP_CID_DYN_START,
    L2CAP_CID_LE_U_SIGNAL, L2CAP_CID_SIGNAL, L2CAP_CID_SMP,
};
use crate::types::Transport;

pub(crate) mod conn_params;
mod credits;
mod le_signal;
mod quota;
pub(crate) mod sar;
mod signal;
mod state;

pub(crate) use state::CloseNotice;

/// Signalling frame that arrived before the connection complete event of its handle.
pub(crate) struct HeldFrame {
    handle: ConnHandle,
    frame: Frame,
    expired: u8,
}

impl<'d> L2capContext<'d> {
    /// Process one HCI ACL data packet, header included.
    pub fn process_acl(&mut self, packet: &[u8]) {
        let Ok((header, data)) = AclPacketHeader::from_hci_bytes(packet) else {
            warn!("[l2cap] acl packet shorter than its header");
            return;
        };
        if header.data_len() != data.len() {
            warn!(
                "[l2cap] acl length {} does not match payload length {}",
                header.data_len(),
                data.len()
            );
            return;
        }
        // The header accessor asserts on handles outside the valid range.
        let raw = { header.handle } & 0x0FFF;
        let continuation = header.boundary_flag() == AclPacketBoundary::Continuing;
        if raw > 0x0EFF {
            warn!("[l2cap] acl packet for invalid handle {:04x}", raw);
            return;
        }
        let handle = ConnHandle::new(raw);
        let Some(link) = self.links.find_by_handle(handle) else {
            if !continuation {
                self.hold_frame(handle, data);
            }
            return;
        };

        let rx = &mut self.links.get_mut(link).rx;
        let result = if continuation {
            rx.update(data)
        } else {
            if rx.in_progress() {
                warn!("[l2cap][handle = {}] dropping incomplete frame", raw);
            }
            rx.start(data)
        };
        match result {
            Ok(Some(frame)) => self.process_frame(link, &frame),
            Ok(None) => {}
            Err(e) => warn!("[l2cap][handle = {}] dropping fragment: {:?}", raw, e),
        }
        self.service_all();
    }

    /// A connection to `addr` is up, either requested locally or by the peer.
    pub fn on_connection_complete(&mut self, handle: ConnHandle, addr: BdAddr, transport: Transport, role: LeConnRole) {
        let link = match self.links.find_or_create(&addr, transport) {
            Ok((link, _)) => link,
            Err(_) => {
                warn!("[link] no room for handle {}, disconnecting", handle.raw());
                self.push_command(HciCommand::Disconnect(DisconnectParams {
                    handle,
                    reason: DisconnectReason::RemoteDeviceTerminatedConnLowResources,
                }));
                return;
            }
        };
        let l = self.links.get_mut(link);
        l.state = LinkState::Connected;
        l.handle.replace(handle);
        l.role = role;
        l.timer = None;
        info!("[link][handle = {}] connected to {:?} over {:?}", handle.raw(), addr, transport);

        self.adjust_allocation();
        for idx in 0..self.channels.len() {
            let ch = self.channels.get(idx);
            if ch.on_link(link) && ch.state == ChannelState::Closed {
                self.start_connect(idx);
            }
        }
        self.replay_held(handle);
        self.service_all();
    }

    /// A locally requested connection could not be established.
    pub fn on_connection_failed(&mut self, addr: BdAddr, transport: Transport, status: u8) {
        let Some(link) = self.links.find_by_addr(&addr, transport) else {
            return;
        };
        warn!("[link] connection to {:?} failed with status {:02x}", addr, status);
        for idx in 0..self.channels.len() {
            if self.channels.get(idx).on_link(link) {
                self.close_channel(idx, CloseNotice::ConnectConfirm(ConnectResult::LinkLost));
            }
        }
        self.links.release(link);
        self.adjust_allocation();
    }

    /// The link behind `handle` is gone. Every channel on it is closed.
    pub fn on_disconnection_complete(&mut self, handle: ConnHandle, reason: u8) {
        let Some(link) = self.links.find_by_handle(handle) else {
            debug!("[link] disconnection of unknown handle {}", handle.raw());
            return;
        };
        info!("[link][handle = {}] disconnected, reason {:02x}", handle.raw(), reason);
        for idx in 0..self.channels.len() {
            let ch = self.channels.get(idx);
            if !ch.on_link(link) {
                continue;
            }
            let notice = match ch.state {
                ChannelState::Closed | ChannelState::W4L2capConnectRsp => {
                    CloseNotice::ConnectConfirm(ConnectResult::LinkLost)
                }
                ChannelState::W4L2capDisconnectRsp => CloseNotice::DisconnectConfirm(DisconnectResult::Success),
                _ => CloseNotice::DisconnectIndication,
            };
            self.close_channel(idx, notice);
        }
        self.links.release(link);
        self.adjust_allocation();
        self.service_all();
    }

    /// Fire every timer that expired at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        self.now = now;
        for idx in 0..self.channels.len() {
            let ch = self.channels.get_mut(idx);
            if ch.in_use() && matches!(ch.timer, Some(t) if t <= now) {
                ch.timer = None;
                self.on_channel_timeout(idx);
            }
        }
        for link in 0..self.links.len() {
            let l = self.links.get(link);
            if !l.in_use() {
                continue;
            }
            if matches!(l.info, InfoExchange::Waiting(t) if t <= now) {
                self.on_info_timeout(link);
            }
            if matches!(self.links.get(link).update_timer, Some(t) if t <= now) {
                self.on_conn_update_timeout(link);
            }
            match self.links.get(link).timer {
                Some((t, kind)) if t <= now => {
                    self.links.get_mut(link).timer = None;
                    match kind {
                        LinkTimer::Idle => self.on_idle_timeout(link),
                        LinkTimer::FlowControl => self.service_link(link),
                    }
                }
                _ => {}
            }
        }
        if matches!(self.hold_timer, Some(t) if t <= now) {
            self.on_hold_timeout();
        }
        self.service_all();
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let channels = (0..self.channels.len()).filter_map(|idx| {
            let ch = self.channels.get(idx);
            if ch.in_use() {
                ch.timer
            } else {
                None
            }
        });
        let links = self.links.iter().flat_map(|(_, l)| {
            let info = match l.info {
                InfoExchange::Waiting(t) => Some(t),
                _ => None,
            };
            info.into_iter().chain(l.timer.map(|(t, _)| t)).chain(l.update_timer)
        });
        channels.chain(links).chain(self.hold_timer).min()
    }

    fn process_frame(&mut self, link: usize, frame: &[u8]) {
        let (_, cid, payload) = match decode_l2cap_header(frame) {
            Ok(v) => v,
            Err(e) => {
                warn!("[l2cap] link {} dropping frame: {:?}", link, e);
                return;
            }
        };
        let transport = self.links.get(link).transport;
        match cid {
            L2CAP_CID_SIGNAL if transport == Transport::BrEdr => self.process_signal(link, payload),
            L2CAP_CID_LE_U_SIGNAL if transport == Transport::Le => self.process_le_signal(link, payload),
            L2CAP_CID_SIGNAL | L2CAP_CID_LE_U_SIGNAL => {
                debug!("[l2cap] link {} signalling on cid {} of the other transport", link, cid);
            }
            L2CAP_CID_CONNECTIONLESS | L2CAP_CID_ATT | L2CAP_CID_SMP => {
                trace!("[l2cap] link {} ignoring fixed channel {}", link, cid);
            }
            cid if cid >= L2CAP_CID_DYN_START => self.process_data(link, cid, payload),
            cid => trace!("[l2cap] link {} ignoring reserved cid {}", link, cid),
        }
    }

    /// Keep a connection or information request for a handle we do not know yet.
    fn hold_frame(&mut self, handle: ConnHandle, data: &[u8]) {
        let holdable = match decode_l2cap_header(data) {
            Ok((_, L2CAP_CID_SIGNAL, payload)) => matches!(
                payload.first().map(|c| SignalCode::try_from(*c)),
                Some(Ok(SignalCode::ConnectionReq | SignalCode::InformationReq))
            ),
            _ => false,
        };
        if !holdable {
            debug!("[l2cap] dropping frame for unknown handle {}", handle.raw());
            return;
        }
        let Ok(frame) = Frame::from_slice(data) else {
            return;
        };
        let held = HeldFrame {
            handle,
            frame,
            expired: 0,
        };
        if self.held.push_back(held).is_err() {
            warn!("[l2cap] hold queue full, dropping frame for handle {}", handle.raw());
            return;
        }
        debug!("[l2cap] holding signalling frame for handle {}", handle.raw());
        if self.hold_timer.is_none() {
            self.hold_timer = Some(self.now + self.config.hold_timeout);
        }
    }

    fn replay_held(&mut self, handle: ConnHandle) {
        for _ in 0..self.held.len() {
            let Some(held) = self.held.pop_front() else {
                break;
            };
            if held.handle != handle {
                let _ = self.held.push_back(held);
                continue;
            }
            if let Some(link) = self.links.find_by_handle(handle) {
                debug!("[l2cap][handle = {}] replaying held frame", handle.raw());
                self.process_frame(link, &held.frame);
            }
        }
        if self.held.is_empty() {
            self.hold_timer = None;
        }
    }

    fn on_hold_timeout(&mut self) {
        self.hold_timer = None;
        let retries = self.config.hold_retries;
        for _ in 0..self.held.len() {
            let Some(mut held) = self.held.pop_front() else {
                break;
            };
            held.expired += 1;
            if held.expired >= retries {
                warn!("[l2cap] discarding held frame for handle {}", held.handle.raw());
            } else {
                let _ = self.held.push_back(held);
            }
        }
        if !self.held.is_empty() {
            self.hold_timer = Some(self.now + self.config.hold_timeout);
        }
    }

    /// Queue a signalling frame on a link.
    pub(crate) fn send_signal(&mut self, link: usize, frame: Result<Frame, codec::Error>) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[signal] link {} unable to encode command: {:?}", link, e);
                return;
            }
        };
        if self.links.get_mut(link).signal_queue.push_back(frame).is_err() {
            warn!("[signal] link {} signal queue full, dropping command", link);
            return;
        }
        self.service_link(link);
    }
}
