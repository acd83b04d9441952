//! Channel lifecycle: connect, configure, disconnect and the channel timers.

use bt_hci::cmd::link_control::DisconnectParams;
use bt_hci::param::DisconnectReason;

use crate::channel::{ChannelState, ConfigProgress, DirectionConfig};
use crate::channel_manager::ChannelManager;
use crate::config::{FRAME_SIZE, L2CAP_MTU};
use crate::context::{HciCommand, L2capContext};
use crate::link::{InfoExchange, LinkState, LinkTimer};
use crate::sink::{ConnectResult, DisconnectResult};
use crate::types::l2cap::*;
use crate::types::Transport;

/// What the sink of a channel is told when the channel is released.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseNotice {
    Silent,
    DisconnectIndication,
    ConnectConfirm(ConnectResult),
    DisconnectConfirm(DisconnectResult),
}

/// Transmit window and timers offered when a channel runs in retransmission or streaming mode.
const FCR_TX_WINDOW: u8 = 10;
const FCR_MAX_TRANSMIT: u8 = 20;
const FCR_RETRANSMISSION_TIMEOUT: u16 = 2000;
const FCR_MONITOR_TIMEOUT: u16 = 12000;

pub(crate) fn fcr_options(mode: FcrMode, mps: u16) -> FcrOptions {
    FcrOptions {
        mode: mode.to_option(),
        tx_window: FCR_TX_WINDOW,
        max_transmit: FCR_MAX_TRANSMIT,
        retransmission_timeout: FCR_RETRANSMISSION_TIMEOUT,
        monitor_timeout: FCR_MONITOR_TIMEOUT,
        mps,
    }
}

impl<'d> L2capContext<'d> {
    /// Apply the PSM registration to a freshly allocated channel.
    pub(crate) fn init_channel(&mut self, idx: usize, psm: u16, incoming: bool) {
        let transport = self.transport_of(idx);
        let registration = self.registration(transport, psm);
        let config = self.config;
        let ch = self.channels.get_mut(idx);
        ch.psm = psm;
        ch.incoming = incoming;
        match transport {
            Transport::BrEdr => {
                let c = registration.map(|r| r.config).unwrap_or_default();
                ch.ours = DirectionConfig {
                    mtu: c.mtu,
                    flush_timeout: c.flush_timeout,
                    qos: None,
                    mode: c.mode,
                    fcs: None,
                };
                ch.peer = DirectionConfig::DEFAULT;
            }
            Transport::Le => {
                let le = registration.map(|r| r.le).unwrap_or_default();
                let max_mps = (FRAME_SIZE - L2CAP_HEADER_LEN).min(LE_MAX_MPS as usize) as u16;
                ch.ours.mode = FcrMode::LeCredit;
                ch.peer.mode = FcrMode::LeCredit;
                ch.le.mtu = le.mtu.clamp(LE_MIN_MTU, L2CAP_MTU as u16);
                ch.le.mps = le.mps.unwrap_or(config.le_default_mps).clamp(LE_MIN_MPS, max_mps);
                ch.le.remote_credits = le.initial_credits.unwrap_or(config.le_default_credits);
            }
        }
    }

    /// Start connecting a channel in the closed state, if its link allows it.
    pub(crate) fn start_connect(&mut self, idx: usize) {
        let link = self.channels.get(idx).link;
        let l = self.links.get(link);
        if l.state != LinkState::Connected {
            return;
        }
        match (l.transport, l.info) {
            (Transport::Le, _) => self.send_le_connect_req(idx),
            (Transport::BrEdr, InfoExchange::NotStarted) => self.start_info_exchange(link),
            (Transport::BrEdr, InfoExchange::Waiting(_)) => {}
            (Transport::BrEdr, InfoExchange::Done) => self.send_connect_req(idx),
        }
    }

    fn send_connect_req(&mut self, idx: usize) {
        let cid = ChannelManager::cid(idx);
        let link = self.channels.get(idx).link;
        let id = self.links.get_mut(link).next_signal_id();
        let timeout = self.now + self.config.connect_timeout;
        let ch = self.channels.get_mut(idx);
        ch.local_id = id;
        ch.state = ChannelState::W4L2capConnectRsp;
        ch.timer = Some(timeout);
        let req = ConnReq { psm: ch.psm, scid: cid };
        debug!("[l2cap][cid = {}] connecting to psm {:04x}", cid, req.psm);
        self.send_signal(link, encode_connect_req(id, &req));
    }

    /// Ask the peer for its extended features before the first channel connects.
    pub(crate) fn start_info_exchange(&mut self, link: usize) {
        let deadline = self.now + self.config.info_timeout;
        let l = self.links.get_mut(link);
        let id = l.next_signal_id();
        l.info = InfoExchange::Waiting(deadline);
        trace!("[signal] link {} requesting extended features", link);
        let req = InfoReq {
            info_type: InfoType::ExtendedFeatures as u16,
        };
        self.send_signal(
            link,
            encode_signal(L2CAP_CID_SIGNAL, id, SignalCode::InformationReq, &req, &[]),
        );
    }

    /// Information exchange finished or gave up. Channels waiting on it connect now.
    pub(crate) fn finish_info_exchange(&mut self, link: usize) {
        self.links.get_mut(link).info = InfoExchange::Done;
        for idx in 0..self.channels.len() {
            let ch = self.channels.get(idx);
            if ch.on_link(link) && ch.state == ChannelState::Closed {
                self.send_connect_req(idx);
            }
        }
    }

    pub(crate) fn on_info_timeout(&mut self, link: usize) {
        warn!("[signal] link {} information request timed out", link);
        self.finish_info_exchange(link);
    }

    /// Answer a connection request the sink left pending.
    pub(crate) fn answer_connect(&mut self, idx: usize, accept: bool) {
        if self.channels.get(idx).is_le() {
            self.le_answer_connect(idx, accept);
            return;
        }
        let cid = ChannelManager::cid(idx);
        let ch = self.channels.get(idx);
        let link = ch.link;
        let id = ch.remote_id;
        let remote_cid = ch.remote_cid;
        if accept {
            let rsp = ConnRsp {
                dcid: cid,
                scid: remote_cid,
                result: ConnectionResult::Success as u16,
                status: 0,
            };
            self.send_signal(link, encode_connect_rsp(id, &rsp));
            self.enter_config(idx);
        } else {
            self.send_connect_refusal(idx);
            self.close_channel(idx, CloseNotice::Silent);
        }
    }

    /// Negative response to the peer's connection request on a pending channel.
    fn send_connect_refusal(&mut self, idx: usize) {
        if self.channels.get(idx).is_le() {
            self.send_le_connect_refusal(idx);
            return;
        }
        let ch = self.channels.get(idx);
        let link = ch.link;
        let rsp = ConnRsp {
            dcid: 0,
            scid: ch.remote_cid,
            result: ConnectionResult::NoResources as u16,
            status: 0,
        };
        let id = ch.remote_id;
        self.send_signal(link, encode_connect_rsp(id, &rsp));
    }

    /// Both sides agreed to open the channel, start the configuration exchange.
    pub(crate) fn enter_config(&mut self, idx: usize) {
        let timeout = self.now + self.config.config_timeout;
        let ch = self.channels.get_mut(idx);
        ch.state = ChannelState::Config;
        ch.config = ConfigProgress::NEW;
        ch.timer = Some(timeout);
        trace!("[l2cap][cid = {}] configuring", ChannelManager::cid(idx));
        self.send_config_req(idx);
    }

    pub(crate) fn send_config_req(&mut self, idx: usize) {
        let link = self.channels.get(idx).link;
        let id = self.links.get_mut(link).next_signal_id();
        let ch = self.channels.get_mut(idx);
        ch.local_id = id;
        let mut options = ConfigOptions {
            mtu: Some(ch.ours.mtu),
            flush_timeout: ch.ours.flush_timeout,
            ..Default::default()
        };
        if ch.ours.mode != FcrMode::Basic {
            options.fcr = Some(fcr_options(ch.ours.mode, ch.ours.mtu));
        }
        let header = ConfigReqHeader {
            dcid: ch.remote_cid,
            flags: 0,
        };
        self.send_signal(link, encode_config_req(id, &header, &options));
    }

    /// Open the channel once both configuration directions are done.
    pub(crate) fn check_config_done(&mut self, idx: usize) {
        let cid = ChannelManager::cid(idx);
        let ch = self.channels.get_mut(idx);
        if ch.state != ChannelState::Config || !ch.config.outbound_done || !ch.config.inbound_done {
            return;
        }
        if ch.ours.mode != ch.peer.mode {
            warn!("[l2cap][cid = {}] modes {:?} and {:?} do not match", cid, ch.ours.mode, ch.peer.mode);
            if let Some(sink) = self.sink_of(idx) {
                sink.on_config_confirm(cid, ConfigResult::Rejected, 0);
            }
            self.send_disconnect_req(idx);
            return;
        }
        ch.state = ChannelState::Open;
        ch.timer = None;
        let mtu = ch.peer.mtu;
        info!("[l2cap][cid = {}] open, peer mtu {}", cid, mtu);
        if let Some(sink) = self.sink_of(idx) {
            sink.on_config_confirm(cid, ConfigResult::Success, mtu);
        }
        let link = self.channels.get(idx).link;
        self.service_link(link);
    }

    /// Local request to close a channel.
    pub(crate) fn local_disconnect(&mut self, idx: usize) {
        let cid = ChannelManager::cid(idx);
        match self.channels.get(idx).state {
            ChannelState::Free => {}
            ChannelState::W4L2capDisconnectRsp => {
                debug!("[l2cap][cid = {}] disconnect already in progress", cid);
            }
            ChannelState::Closed => {
                self.close_channel(idx, CloseNotice::DisconnectConfirm(DisconnectResult::Success));
            }
            ChannelState::W4L2capConnectRsp => {
                debug!("[l2cap][cid = {}] disconnecting once the peer answers", cid);
                self.channels.get_mut(idx).disconnect_pending = true;
            }
            ChannelState::W4L2caConnectRsp => self.answer_connect(idx, false),
            ChannelState::Config | ChannelState::Open => self.send_disconnect_req(idx),
        }
    }

    /// Send a disconnection request and wait for the response.
    pub(crate) fn send_disconnect_req(&mut self, idx: usize) {
        let timeout = self.now + self.config.disconnect_timeout;
        let id = self.send_disconnect_frame(idx);
        let ch = self.channels.get_mut(idx);
        ch.local_id = id;
        ch.state = ChannelState::W4L2capDisconnectRsp;
        ch.timer = Some(timeout);
        ch.tx.clear();
        ch.cong_sent = false;
        debug!("[l2cap][cid = {}] disconnecting", ChannelManager::cid(idx));
    }

    fn send_disconnect_frame(&mut self, idx: usize) -> u8 {
        let ch = self.channels.get(idx);
        let link = ch.link;
        let signal = if ch.is_le() {
            L2CAP_CID_LE_U_SIGNAL
        } else {
            L2CAP_CID_SIGNAL
        };
        let req = DisconnReq {
            dcid: ch.remote_cid,
            scid: ChannelManager::cid(idx),
        };
        let id = self.links.get_mut(link).next_signal_id();
        self.send_signal(link, encode_disconn_req(signal, id, &req));
        id
    }

    pub(crate) fn on_channel_timeout(&mut self, idx: usize) {
        let cid = ChannelManager::cid(idx);
        let state = self.channels.get(idx).state;
        warn!("[l2cap][cid = {}] timed out in {:?}", cid, state);
        match state {
            ChannelState::Free | ChannelState::Open => {}
            ChannelState::Closed | ChannelState::W4L2capConnectRsp => {
                self.close_channel(idx, CloseNotice::ConnectConfirm(ConnectResult::Timeout));
            }
            ChannelState::W4L2caConnectRsp => {
                self.send_connect_refusal(idx);
                self.close_channel(idx, CloseNotice::DisconnectIndication);
            }
            ChannelState::Config => {
                self.send_disconnect_frame(idx);
                self.close_channel(idx, CloseNotice::DisconnectIndication);
            }
            ChannelState::W4L2capDisconnectRsp => {
                self.close_channel(idx, CloseNotice::DisconnectConfirm(DisconnectResult::Timeout));
            }
        }
    }

    /// Release a channel and tell its sink.
    pub(crate) fn close_channel(&mut self, idx: usize, notice: CloseNotice) {
        let cid = ChannelManager::cid(idx);
        let link = self.channels.get(idx).link;
        let sink = self.sink_of(idx);
        self.channels.release(idx);
        debug!("[l2cap][cid = {}] closed ({:?})", cid, notice);
        if let Some(sink) = sink {
            match notice {
                CloseNotice::Silent => {}
                CloseNotice::DisconnectIndication => sink.on_disconnect_indication(cid),
                CloseNotice::ConnectConfirm(result) => sink.on_connect_confirm(cid, result),
                CloseNotice::DisconnectConfirm(result) => sink.on_disconnect_confirm(cid, result),
            }
        }
        self.check_link_idle(link);
    }

    /// Start the idle timer of a link that no longer carries dynamic channels.
    fn check_link_idle(&mut self, link: usize) {
        if self.channels.count_on_link(link) > 0 {
            return;
        }
        let l = self.links.get(link);
        let timeout = match (l.state, l.transport) {
            (LinkState::Connected | LinkState::Connecting, Transport::BrEdr) => self.config.disconnect_timeout,
            (LinkState::Connected | LinkState::Connecting, Transport::Le) => self.config.ble_link_timeout,
            _ => return,
        };
        trace!("[link][idx = {}] idle", link);
        self.links.get_mut(link).timer = Some((self.now + timeout, LinkTimer::Idle));
    }

    pub(crate) fn on_idle_timeout(&mut self, link: usize) {
        if self.channels.count_on_link(link) > 0 {
            return;
        }
        match self.links.get(link).handle {
            Some(handle) => {
                let disconnect = HciCommand::Disconnect(DisconnectParams {
                    handle,
                    reason: DisconnectReason::RemoteUserTerminatedConn,
                });
                if !self.push_command(disconnect) {
                    debug!("[link][handle = {}] idle, disconnect deferred", handle.raw());
                    self.links.get_mut(link).deferred.disconnect = true;
                    return;
                }
                info!("[link][handle = {}] idle, disconnecting", handle.raw());
                self.links.get_mut(link).state = LinkState::Disconnecting;
            }
            None => {
                debug!("[link][idx = {}] dropping idle link that never connected", link);
                self.links.release(link);
                self.adjust_allocation();
            }
        }
    }
}
