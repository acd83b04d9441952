//! Data path of dynamic channels and LE credit based flow control.

use super::sar::Segmenter;
use crate::channel::ChannelState;
use crate::channel_manager::ChannelManager;
use crate::config::FRAME_SIZE;
use crate::context::{L2capContext, WriteResult};
use crate::types::l2cap::*;

impl<'d> L2capContext<'d> {
    /// Queue `data` on a channel and try to send it right away.
    pub(crate) fn data_write(&mut self, idx: usize, data: &[u8]) -> WriteResult {
        let cid = ChannelManager::cid(idx);
        let ch = self.channels.get(idx);
        if ch.state != ChannelState::Open {
            warn!("[l2cap][cid = {}] write in {:?}", cid, ch.state);
            return WriteResult::Failed;
        }
        let peer_mtu = if ch.is_le() { ch.le.peer_mtu } else { ch.peer.mtu };
        let checks_mtu = ch.is_le() || ch.ours.mode == FcrMode::Basic;
        if checks_mtu && data.len() > peer_mtu as usize {
            warn!("[l2cap][cid = {}] {} bytes exceed peer mtu {}", cid, data.len(), peer_mtu);
            return WriteResult::Failed;
        }
        if ch.cong_sent {
            warn!("[l2cap][cid = {}] write while congested, {} queued", cid, ch.tx.len());
            return WriteResult::Failed;
        }

        let mps = (ch.le.peer_mps as usize).min(FRAME_SIZE - L2CAP_HEADER_LEN);
        let needed = if ch.is_le() { Segmenter::count(data.len(), mps) } else { 1 };
        if ch.tx.capacity() - ch.tx.len() < needed {
            warn!("[l2cap][cid = {}] no room for {} frames", cid, needed);
            return WriteResult::Failed;
        }

        let (link, remote_cid, is_le) = (ch.link, ch.remote_cid, ch.is_le());
        let ch = self.channels.get_mut(idx);
        if is_le {
            for (length, segment) in Segmenter::new(data, mps) {
                let prefix = length.map(u16::to_le_bytes);
                let frame = encode_basic_frame(remote_cid, prefix.as_ref().map_or(&[][..], |p| &p[..]), segment);
                match frame {
                    Ok(frame) => {
                        let _ = ch.tx.push_back(frame);
                    }
                    Err(e) => {
                        warn!("[l2cap][cid = {}] unable to encode k-frame: {:?}", cid, e);
                        return WriteResult::Failed;
                    }
                }
            }
        } else {
            match encode_basic_frame(remote_cid, &[], data) {
                Ok(frame) => {
                    let _ = ch.tx.push_back(frame);
                }
                Err(e) => {
                    warn!("[l2cap][cid = {}] unable to encode frame: {:?}", cid, e);
                    return WriteResult::Failed;
                }
            }
        }
        trace!("[l2cap][cid = {}] queued {} bytes", cid, data.len());
        self.service_link(link);

        let threshold = self.config.cong_threshold;
        let ch = self.channels.get_mut(idx);
        if ch.cong_sent {
            return WriteResult::Congested;
        }
        if ch.congested(threshold) {
            ch.cong_sent = true;
            debug!("[l2cap][cid = {}] congested", cid);
            if let Some(sink) = self.sink_of(idx) {
                sink.on_congestion_changed(cid, true);
            }
            return WriteResult::Congested;
        }
        WriteResult::Success
    }

    /// Frame received on a dynamic channel, basic header stripped.
    pub(crate) fn process_data(&mut self, link: usize, cid: u16, payload: &[u8]) {
        let Some(idx) = self.channels.find_by_local_cid(link, cid) else {
            debug!("[l2cap] link {} data for unknown cid {:04x}", link, cid);
            return;
        };
        let ch = self.channels.get(idx);
        let state = ch.state;
        if ch.is_le() {
            if state == ChannelState::Open {
                self.process_k_frame(idx, payload);
            } else {
                debug!("[l2cap][cid = {}] dropping k-frame in {:?}", cid, state);
            }
            return;
        }
        match ch.peer.mode {
            FcrMode::Basic if state == ChannelState::Open => {
                if let Some(sink) = self.sink_of(idx) {
                    sink.on_data_received(cid, payload);
                }
            }
            FcrMode::Ertm | FcrMode::Streaming if matches!(state, ChannelState::Open | ChannelState::Config) => {
                match self.fcr {
                    Some(fcr) => fcr.process_fcr_pdu(cid, payload),
                    None => warn!("[l2cap][cid = {}] no processor for {:?} frames", cid, ch.peer.mode),
                }
            }
            mode => debug!("[l2cap][cid = {}] dropping {:?} frame in {:?}", cid, mode, state),
        }
    }

    fn process_k_frame(&mut self, idx: usize, payload: &[u8]) {
        let cid = ChannelManager::cid(idx);
        let sink = self.sink_of(idx);
        let ch = self.channels.get_mut(idx);
        if ch.le.remote_credits == 0 {
            warn!("[credits][cid = {}] k-frame received without credits", cid);
            self.send_disconnect_req(idx);
            return;
        }
        if payload.len() > ch.le.mps as usize {
            warn!("[credits][cid = {}] k-frame of {} bytes exceeds mps {}", cid, payload.len(), ch.le.mps);
            self.send_disconnect_req(idx);
            return;
        }
        ch.le.remote_credits -= 1;
        let mtu = ch.le.mtu;
        match ch.sdu.push(payload, mtu) {
            Ok(Some(sdu)) => {
                trace!("[l2cap][cid = {}] sdu of {} bytes", cid, sdu.len());
                if let Some(sink) = sink {
                    sink.on_data_received(cid, sdu);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("[l2cap][cid = {}] bad sdu: {:?}", cid, e);
                self.send_disconnect_req(idx);
                return;
            }
        }
        self.replenish_credits(idx);
    }

    /// Top the peer's credits back up once they fall to the threshold.
    fn replenish_credits(&mut self, idx: usize) {
        let cid = ChannelManager::cid(idx);
        let (threshold, default) = (self.config.le_credit_threshold, self.config.le_default_credits);
        let ch = self.channels.get_mut(idx);
        if ch.state != ChannelState::Open || ch.le.remote_credits > threshold || ch.le.remote_credits >= default {
            return;
        }
        let credits = default - ch.le.remote_credits;
        ch.le.remote_credits = default;
        let link = ch.link;
        trace!("[credits][cid = {}] granting {}", cid, credits);
        let id = self.links.get_mut(link).next_signal_id();
        self.send_signal(link, encode_flow_control_credit(id, &LeCreditFlowInd { cid, credits }));
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use bt_hci::param::{BdAddr, ConnHandle, LeConnRole};

    use super::*;
    use crate::channel::ChannelStorage;
    use crate::config::Config;
    use crate::context::{HciRequest, PsmRegistration};
    use crate::cursor::ReadCursor;
    use crate::link::LinkStorage;
    use crate::sink::{ChannelEventSink, ConnectDecision, ConnectResult};
    use crate::types::Transport;

    const ADDR: [u8; 6] = [0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6];

    #[derive(Default)]
    struct Recorder {
        data: RefCell<std::vec::Vec<std::vec::Vec<u8>>>,
    }

    impl ChannelEventSink for Recorder {
        fn on_connect_indication(&self, _: u16, _: BdAddr, _: u16) -> ConnectDecision {
            ConnectDecision::Accept
        }
        fn on_connect_confirm(&self, _: u16, _: ConnectResult) {}
        fn on_config_confirm(&self, _: u16, _: ConfigResult, _: u16) {}
        fn on_disconnect_indication(&self, _: u16) {}
        fn on_data_received(&self, _: u16, data: &[u8]) {
            self.data.borrow_mut().push(data.to_vec());
        }
        fn on_congestion_changed(&self, _: u16, _: bool) {}
    }

    fn acl(frame: &[u8]) -> std::vec::Vec<u8> {
        let mut v = std::vec::Vec::new();
        v.extend_from_slice(&0x0001u16.to_le_bytes());
        v.extend_from_slice(&(frame.len() as u16).to_le_bytes());
        v.extend_from_slice(frame);
        v
    }

    fn k_frame(cid: u16, payload: &[u8]) -> std::vec::Vec<u8> {
        let frame = unwrap!(encode_basic_frame(cid, &[], payload));
        acl(&frame)
    }

    fn drain(ctx: &mut L2capContext<'_>) -> std::vec::Vec<Frame> {
        let mut out = std::vec::Vec::new();
        while let Some(req) = ctx.poll_outbound() {
            if let HciRequest::Acl { handle, frame } = req {
                ctx.on_completed_packets(handle, 1);
                out.push(frame);
            }
        }
        out
    }

    /// Open an incoming LE channel with the given peer MPS and credits.
    fn open_le<'d>(ctx: &mut L2capContext<'d>, sink: &'d Recorder, mps: u16, credits: u16) {
        unwrap!(ctx.register(Transport::Le, 0x0025, PsmRegistration::new(sink)));
        ctx.on_connection_complete(ConnHandle::new(1), BdAddr::new(ADDR), Transport::Le, LeConnRole::Central);
        let req = LeCreditConnReq {
            psm: 0x0025,
            scid: 0x0060,
            mtu: 200,
            mps,
            credits,
        };
        let frame = unwrap!(encode_credit_based_conn_req(5, &req));
        ctx.process_acl(&acl(&frame));
        drain(ctx);
    }

    #[test]
    fn sdu_segmented_to_peer_mps() {
        let mut links = [LinkStorage::NEW];
        let mut channels = [ChannelStorage::NEW];
        let sink = Recorder::default();
        let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
        open_le(&mut ctx, &sink, 23, 10);

        let data = [0x55u8; 50];
        assert_eq!(ctx.write(0x40, &data), WriteResult::Success);
        let frames = drain(&mut ctx);
        // 52 bytes with the length prefix, 23 per frame
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..6], &[23, 0, 0x60, 0, 50, 0]);
        assert_eq!(frames[1].len(), L2CAP_HEADER_LEN + 23);
        assert_eq!(frames[2].len(), L2CAP_HEADER_LEN + 6);
        assert_eq!(unwrap!(ctx.channel_info(0x40)).peer_credits, 7);
    }

    #[test]
    fn credits_replenished_at_threshold() {
        let mut links = [LinkStorage::NEW];
        let mut channels = [ChannelStorage::NEW];
        let sink = Recorder::default();
        let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
        open_le(&mut ctx, &sink, 100, 10);

        // Six single frame SDUs leave the peer with 4 credits, the seventh triggers a grant
        for i in 0..7u8 {
            ctx.process_acl(&k_frame(0x40, &[0x01, 0x00, i]));
            if i < 6 {
                assert!(drain(&mut ctx).is_empty());
            }
        }
        let frames = drain(&mut ctx);
        assert_eq!(frames.len(), 1);
        let (_, cid, payload) = unwrap!(decode_l2cap_header(&frames[0]));
        assert_eq!(cid, L2CAP_CID_LE_U_SIGNAL);
        let mut r = ReadCursor::new(payload);
        let cmd = unwrap!(decode_signalling_command(&mut r));
        assert_eq!(cmd.code, SignalCode::LeCreditFlowInd as u8);
        assert_eq!(cmd.payload, &[0x40, 0x00, 0x07, 0x00]);
        assert_eq!(unwrap!(ctx.channel_info(0x40)).remote_credits, 10);
        assert_eq!(sink.data.borrow().len(), 7);
    }

    #[test]
    fn oversized_k_frame_disconnects() {
        let mut links = [LinkStorage::NEW];
        let mut channels = [ChannelStorage::NEW];
        let mut config = Config::default();
        config.le_default_mps = 30;
        let sink = Recorder::default();
        let mut ctx = L2capContext::new(&mut links, &mut channels, config);
        open_le(&mut ctx, &sink, 100, 10);

        ctx.process_acl(&k_frame(0x40, &[0u8; 31]));
        let frames = drain(&mut ctx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][4], SignalCode::DisconnectionReq as u8);
        assert!(sink.data.borrow().is_empty());
    }

    #[test]
    fn write_larger_than_peer_mtu_fails() {
        let mut links = [LinkStorage::NEW];
        let mut channels = [ChannelStorage::NEW];
        let sink = Recorder::default();
        let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
        open_le(&mut ctx, &sink, 100, 10);

        assert_eq!(ctx.write(0x40, &[0u8; 201]), WriteResult::Failed);
        assert_eq!(ctx.write(0x41, &[0u8; 1]), WriteResult::Failed);
        assert!(drain(&mut ctx).is_empty());
    }
}
