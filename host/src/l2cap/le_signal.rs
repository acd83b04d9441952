//! Signalling on the LE signalling channel.

use bt_hci::param::{BdAddr, LeConnRole};

use super::conn_params::params_valid;
use super::CloseNotice;
use crate::channel::ChannelState;
use crate::channel_manager::ChannelManager;
use crate::context::L2capContext;
use crate::cursor::ReadCursor;
use crate::sink::{ConnectDecision, ConnectResult};
use crate::types::l2cap::*;
use crate::types::Transport;

impl<'d> L2capContext<'d> {
    /// Process a PDU received on the LE signalling channel.
    pub(crate) fn process_le_signal(&mut self, link: usize, pdu: &[u8]) {
        let mut r = ReadCursor::new(pdu);
        while r.available() >= SIGNAL_HEADER_LEN {
            let cmd = match decode_signalling_command(&mut r) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!("[le-signal] link {} stopping at truncated command: {:?}", link, e);
                    return;
                }
            };
            let Ok(code) = SignalCode::try_from(cmd.code) else {
                warn!("[le-signal] link {} unknown command {:02x}", link, cmd.code);
                self.reject_not_understood(link, cmd.identifier);
                return;
            };
            trace!("[le-signal] link {} {:?} id {}", link, code, cmd.identifier);
            if let Err(e) = self.handle_le_signal(link, code, cmd.identifier, cmd.payload) {
                warn!("[le-signal] link {} dropping rest of pdu after {:?}: {:?}", link, code, e);
                return;
            }
        }
    }

    fn reject_not_understood(&mut self, link: usize, id: u8) {
        self.send_signal(
            link,
            encode_command_reject(L2CAP_CID_LE_U_SIGNAL, id, RejectReason::NotUnderstood, &[]),
        );
    }

    fn handle_le_signal(&mut self, link: usize, code: SignalCode, id: u8, payload: &[u8]) -> Result<(), DecodeError> {
        let mut r = ReadCursor::new(payload);
        match code {
            SignalCode::CommandRejectRes => {
                let reject: CommandRejectRes = r.read()?;
                debug!("[le-signal] link {} command {} rejected: {:04x}", link, id, reject.reason);
            }
            SignalCode::ConnParamUpdateReq => self.on_conn_param_update_req(link, id, r.read()?),
            SignalCode::ConnParamUpdateRes => {
                let rsp: ConnParamUpdateRsp = r.read()?;
                debug!("[le-signal] link {} parameter update result {}", link, rsp.result);
            }
            SignalCode::LeCreditConnReq => self.on_le_connect_req(link, id, r.read()?),
            SignalCode::LeCreditConnRes => self.on_le_connect_res(link, id, r.read()?),
            SignalCode::LeCreditFlowInd => self.on_flow_credit(link, r.read()?),
            SignalCode::DisconnectionReq => self.on_disconnect_req(link, L2CAP_CID_LE_U_SIGNAL, id, r.read()?),
            SignalCode::DisconnectionRes => self.on_disconnect_rsp(link, id, r.read()?),
            SignalCode::InformationReq => {
                self.on_info_req(link, L2CAP_CID_LE_U_SIGNAL, id, r.read()?, LE_FEATURE_MASK);
            }
            _ => {
                debug!("[le-signal] link {} {:?} not supported on le", link, code);
                self.reject_not_understood(link, id);
            }
        }
        Ok(())
    }

    fn on_conn_param_update_req(&mut self, link: usize, id: u8, req: ConnParamUpdateReq) {
        if self.links.get(link).role != LeConnRole::Central {
            debug!("[le-signal] link {} parameter update request as peripheral", link);
            self.reject_not_understood(link, id);
            return;
        }
        if !params_valid(req.interval_min, req.interval_max, req.latency, req.timeout) {
            warn!(
                "[le-signal] link {} rejecting parameters {}..{} latency {} timeout {}",
                link, req.interval_min, req.interval_max, req.latency, req.timeout
            );
            self.send_signal(link, encode_conn_param_update_rsp(id, CONN_PARAM_REJECTED));
            return;
        }
        let (mut min, mut max) = (req.interval_min, req.interval_max);
        self.adjust_connection_intervals(&mut min, &mut max, CONN_INTERVAL_MIN);
        self.send_signal(link, encode_conn_param_update_rsp(id, CONN_PARAM_ACCEPTED));

        let l = self.links.get_mut(link);
        l.params.interval_min = min;
        l.params.interval_max = max;
        l.params.latency = req.latency;
        l.params.timeout = req.timeout;
        l.update.new_conn_param = true;
        self.start_conn_update(link);
    }

    fn reject_le_connection(&mut self, link: usize, id: u8, result: LeCreditConnResultCode) {
        let res = LeCreditConnRes {
            dcid: 0,
            mtu: 0,
            mps: 0,
            credits: 0,
            result: result as u16,
        };
        self.send_signal(link, encode_credit_based_conn_res(id, &res));
    }

    fn on_le_connect_req(&mut self, link: usize, id: u8, req: LeCreditConnReq) {
        if req.scid < L2CAP_CID_DYN_START {
            self.reject_le_connection(link, id, LeCreditConnResultCode::InvalidSourceId);
            return;
        }
        if self.channels.find_by_remote_cid(link, req.scid).is_some() {
            warn!("[le-signal] link {} remote cid {:04x} already in use", link, req.scid);
            self.reject_le_connection(link, id, LeCreditConnResultCode::ScidAlreadyAllocated);
            return;
        }
        let registration = match self.registration(Transport::Le, req.psm) {
            Some(r) if r.accepts_incoming => r,
            _ => {
                warn!("[le-signal] link {} connect request for psm {:04x} refused", link, req.psm);
                self.reject_le_connection(link, id, LeCreditConnResultCode::SpsmNotSupported);
                return;
            }
        };
        let idx = match self.channels.alloc(link, self.config.max_channels_per_link) {
            Ok(idx) => idx,
            Err(_) => {
                self.reject_le_connection(link, id, LeCreditConnResultCode::NoResources);
                return;
            }
        };
        if req.mtu < LE_MIN_MTU || !(LE_MIN_MPS..=LE_MAX_MPS).contains(&req.mps) {
            warn!("[le-signal] link {} unusable mtu {} mps {}", link, req.mtu, req.mps);
            self.channels.release(idx);
            self.reject_le_connection(link, id, LeCreditConnResultCode::NoResources);
            return;
        }

        self.init_channel(idx, req.psm, true);
        let cid = ChannelManager::cid(idx);
        let timeout = self.now + self.config.connect_timeout;
        let ch = self.channels.get_mut(idx);
        ch.remote_cid = req.scid;
        ch.remote_id = id;
        ch.le.peer_mtu = req.mtu;
        ch.le.peer_mps = req.mps;
        ch.le.peer_credits = req.credits;
        ch.state = ChannelState::W4L2caConnectRsp;
        ch.timer = Some(timeout);
        let l = self.links.get_mut(link);
        l.timer = None;
        let addr = l.addr.unwrap_or(BdAddr::new([0; 6]));

        debug!("[le-signal] link {} incoming channel {} for psm {:04x}", link, cid, req.psm);
        match registration.sink.on_connect_indication(req.psm, addr, cid) {
            ConnectDecision::Accept => self.le_answer_connect(idx, true),
            ConnectDecision::Pending => trace!("[l2cap][cid = {}] waiting for the local answer", cid),
            ConnectDecision::Reject => self.le_answer_connect(idx, false),
        }
    }

    fn on_le_connect_res(&mut self, link: usize, id: u8, res: LeCreditConnRes) {
        let Some(idx) = self.channels.find_by_local_id(link, id) else {
            debug!("[le-signal] link {} no request waiting for response {}", link, id);
            return;
        };
        let cid = ChannelManager::cid(idx);
        if res.result != LeCreditConnResultCode::Success as u16 {
            debug!("[l2cap][cid = {}] connect refused with {:04x}", cid, res.result);
            self.close_channel(idx, CloseNotice::ConnectConfirm(ConnectResult::Refused(res.result)));
            return;
        }
        let usable = res.mtu >= LE_MIN_MTU
            && (LE_MIN_MPS..=LE_MAX_MPS).contains(&res.mps)
            && res.dcid >= L2CAP_CID_DYN_START
            && self.channels.find_by_remote_cid(link, res.dcid).is_none();
        if !usable {
            warn!(
                "[l2cap][cid = {}] unusable response: cid {:04x} mtu {} mps {}",
                cid, res.dcid, res.mtu, res.mps
            );
            self.close_channel(
                idx,
                CloseNotice::ConnectConfirm(ConnectResult::Refused(LeCreditConnResultCode::NoResources as u16)),
            );
            return;
        }
        let ch = self.channels.get_mut(idx);
        ch.remote_cid = res.dcid;
        ch.le.peer_mtu = res.mtu;
        ch.le.peer_mps = res.mps;
        ch.le.peer_credits = res.credits;
        if ch.disconnect_pending {
            self.send_disconnect_req(idx);
            return;
        }
        self.le_open(idx);
    }

    fn on_flow_credit(&mut self, link: usize, ind: LeCreditFlowInd) {
        let Some(idx) = self.channels.find_by_remote_cid(link, ind.cid) else {
            debug!("[credits] link {} credits for unknown cid {:04x}", link, ind.cid);
            return;
        };
        let cid = ChannelManager::cid(idx);
        let ch = self.channels.get_mut(idx);
        let total = ch.le.peer_credits as u32 + ind.credits as u32;
        if total > LE_CREDIT_MAX as u32 {
            warn!("[credits][cid = {}] peer granted {} credits, over the limit", cid, total);
            if ch.state == ChannelState::Open {
                self.send_disconnect_req(idx);
            }
            return;
        }
        ch.le.peer_credits = total as u16;
        trace!("[credits][cid = {}] +{} = {}", cid, ind.credits, total);
        self.service_link(link);
    }

    /// Send the credit based connection request of an outgoing channel.
    pub(crate) fn send_le_connect_req(&mut self, idx: usize) {
        let cid = ChannelManager::cid(idx);
        let link = self.channels.get(idx).link;
        let id = self.links.get_mut(link).next_signal_id();
        let timeout = self.now + self.config.connect_timeout;
        let ch = self.channels.get_mut(idx);
        ch.local_id = id;
        ch.state = ChannelState::W4L2capConnectRsp;
        ch.timer = Some(timeout);
        let req = LeCreditConnReq {
            psm: ch.psm,
            scid: cid,
            mtu: ch.le.mtu,
            mps: ch.le.mps,
            credits: ch.le.remote_credits,
        };
        debug!("[l2cap][cid = {}] connecting to spsm {:04x}", cid, req.psm);
        self.send_signal(link, encode_credit_based_conn_req(id, &req));
    }

    pub(crate) fn le_answer_connect(&mut self, idx: usize, accept: bool) {
        if !accept {
            self.send_le_connect_refusal(idx);
            self.close_channel(idx, CloseNotice::Silent);
            return;
        }
        let cid = ChannelManager::cid(idx);
        let ch = self.channels.get(idx);
        let link = ch.link;
        let id = ch.remote_id;
        let res = LeCreditConnRes {
            dcid: cid,
            mtu: ch.le.mtu,
            mps: ch.le.mps,
            credits: ch.le.remote_credits,
            result: LeCreditConnResultCode::Success as u16,
        };
        self.send_signal(link, encode_credit_based_conn_res(id, &res));
        self.le_open(idx);
    }

    pub(crate) fn send_le_connect_refusal(&mut self, idx: usize) {
        let ch = self.channels.get(idx);
        let (link, id) = (ch.link, ch.remote_id);
        self.reject_le_connection(link, id, LeCreditConnResultCode::InsufficientAuthorization);
    }

    /// Credit based channels have no configuration stage.
    fn le_open(&mut self, idx: usize) {
        let cid = ChannelManager::cid(idx);
        let ch = self.channels.get_mut(idx);
        ch.state = ChannelState::Open;
        ch.timer = None;
        let (incoming, link, mtu) = (ch.incoming, ch.link, ch.le.peer_mtu);
        info!(
            "[l2cap][cid = {}] open, peer mtu {} mps {} credits {}",
            cid, mtu, ch.le.peer_mps, ch.le.peer_credits
        );
        if let Some(sink) = self.sink_of(idx) {
            if !incoming {
                sink.on_connect_confirm(cid, ConnectResult::Success);
            }
            sink.on_config_confirm(cid, ConfigResult::Success, mtu);
        }
        self.service_link(link);
    }
}

#[cfg(test)]
mod tests {
    use bt_hci::param::ConnHandle;

    use super::*;
    use crate::channel::ChannelStorage;
    use crate::config::Config;
    use crate::context::{HciRequest, PsmRegistration};
    use crate::link::LinkStorage;
    use crate::sink::ChannelEventSink;

    const ADDR: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

    struct Accepting;

    impl ChannelEventSink for Accepting {
        fn on_connect_indication(&self, _: u16, _: BdAddr, _: u16) -> ConnectDecision {
            ConnectDecision::Accept
        }
        fn on_connect_confirm(&self, _: u16, _: ConnectResult) {}
        fn on_config_confirm(&self, _: u16, _: ConfigResult, _: u16) {}
        fn on_disconnect_indication(&self, _: u16) {}
        fn on_data_received(&self, _: u16, _: &[u8]) {}
        fn on_congestion_changed(&self, _: u16, _: bool) {}
    }

    fn le_signal(code: SignalCode, id: u8, body: &[u8]) -> std::vec::Vec<u8> {
        let frame = unwrap!(encode_signal_with(L2CAP_CID_LE_U_SIGNAL, id, code, body.len(), |w| {
            w.append(body)
        }));
        let mut v = std::vec::Vec::new();
        v.extend_from_slice(&0x0040u16.to_le_bytes());
        v.extend_from_slice(&(frame.len() as u16).to_le_bytes());
        v.extend_from_slice(&frame);
        v
    }

    fn sent_signals(ctx: &mut L2capContext<'_>) -> std::vec::Vec<(u8, u8, std::vec::Vec<u8>)> {
        let mut out = std::vec::Vec::new();
        while let Some(req) = ctx.poll_outbound() {
            if let HciRequest::Acl { handle, frame } = req {
                ctx.on_completed_packets(handle, 1);
                let (_, _, payload) = unwrap!(decode_l2cap_header(&frame));
                let mut r = ReadCursor::new(payload);
                let cmd = unwrap!(decode_signalling_command(&mut r));
                out.push((cmd.code, cmd.identifier, cmd.payload.to_vec()));
            }
        }
        out
    }

    #[test]
    fn duplicate_source_cid_refused() {
        let mut links = [LinkStorage::NEW];
        let mut channels = [ChannelStorage::NEW, ChannelStorage::NEW];
        let sink = Accepting;
        let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
        unwrap!(ctx.register(Transport::Le, 0x0080, PsmRegistration::new(&sink)));
        ctx.on_connection_complete(
            ConnHandle::new(0x40),
            BdAddr::new(ADDR),
            Transport::Le,
            LeConnRole::Peripheral,
        );

        // psm 0x80, scid 0x0050, mtu 100, mps 50, credits 5
        let req = [0x80, 0x00, 0x50, 0x00, 0x64, 0x00, 0x32, 0x00, 0x05, 0x00];
        ctx.process_acl(&le_signal(SignalCode::LeCreditConnReq, 3, &req));
        let sent = sent_signals(&mut ctx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, SignalCode::LeCreditConnRes as u8);
        let info = unwrap!(ctx.channel_info(0x40));
        assert_eq!(info.state, ChannelState::Open);
        assert_eq!(info.peer_credits, 5);

        ctx.process_acl(&le_signal(SignalCode::LeCreditConnReq, 4, &req));
        let sent = sent_signals(&mut ctx);
        assert_eq!(sent.len(), 1);
        let mut r = ReadCursor::new(&sent[0].2[..]);
        let res: LeCreditConnRes = unwrap!(r.read());
        assert_eq!(res.result, LeCreditConnResultCode::ScidAlreadyAllocated as u16);
        assert!(ctx.channel_info(0x41).is_none());
    }

    #[test]
    fn update_request_as_peripheral_not_understood() {
        let mut links = [LinkStorage::NEW];
        let mut channels = [ChannelStorage::NEW];
        let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
        ctx.on_connection_complete(
            ConnHandle::new(0x40),
            BdAddr::new(ADDR),
            Transport::Le,
            LeConnRole::Peripheral,
        );
        let req = [0x10, 0x00, 0x20, 0x00, 0x00, 0x00, 0x80, 0x00];
        ctx.process_acl(&le_signal(SignalCode::ConnParamUpdateReq, 9, &req));
        let sent = sent_signals(&mut ctx);
        assert_eq!(sent, [(SignalCode::CommandRejectRes as u8, 9, vec![0x00, 0x00])]);
    }

    #[test]
    fn credit_overflow_disconnects() {
        let mut links = [LinkStorage::NEW];
        let mut channels = [ChannelStorage::NEW];
        let sink = Accepting;
        let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
        unwrap!(ctx.register(Transport::Le, 0x0080, PsmRegistration::new(&sink)));
        ctx.on_connection_complete(
            ConnHandle::new(0x40),
            BdAddr::new(ADDR),
            Transport::Le,
            LeConnRole::Central,
        );
        let req = [0x80, 0x00, 0x50, 0x00, 0x64, 0x00, 0x32, 0x00, 0xff, 0xff];
        ctx.process_acl(&le_signal(SignalCode::LeCreditConnReq, 1, &req));
        sent_signals(&mut ctx);

        ctx.process_acl(&le_signal(SignalCode::LeCreditFlowInd, 2, &[0x50, 0x00, 0x01, 0x00]));
        let sent = sent_signals(&mut ctx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, SignalCode::DisconnectionReq as u8);
        assert_eq!(sent[0].2, [0x50, 0x00, 0x40, 0x00]);
        assert_eq!(
            unwrap!(ctx.channel_info(0x40)).state,
            ChannelState::W4L2capDisconnectRsp
        );
    }
}
