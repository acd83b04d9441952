//! Signalling on the classic signalling channel.

use bt_hci::param::BdAddr;

use super::state::fcr_options;
use super::CloseNotice;
use crate::channel::ChannelState;
use crate::channel_manager::ChannelManager;
use crate::codec::to_bytes;
use crate::config::L2CAP_MTU;
use crate::context::{FcrModes, L2capContext};
use crate::cursor::ReadCursor;
use crate::link::InfoExchange;
use crate::sink::{ConnectDecision, ConnectResult, DisconnectResult};
use crate::types::l2cap::*;
use crate::types::Transport;

/// Largest echo payload that still fits a response in the signalling MTU.
const ECHO_MAX_DATA: usize = L2CAP_SIGNAL_MTU - SIGNAL_HEADER_LEN;

/// Fixed channels reported in information responses.
const FIXED_CHANNELS: u8 = FIXED_CHANNEL_SIGNAL_BIT
    | FIXED_CHANNEL_CONNECTIONLESS_BIT
    | FIXED_CHANNEL_ATT_BIT
    | FIXED_CHANNEL_LE_SIGNAL_BIT
    | FIXED_CHANNEL_SMP_BIT;

fn is_classic(code: SignalCode) -> bool {
    !matches!(
        code,
        SignalCode::ConnParamUpdateReq
            | SignalCode::ConnParamUpdateRes
            | SignalCode::LeCreditConnReq
            | SignalCode::LeCreditConnRes
            | SignalCode::LeCreditFlowInd
    )
}

impl<'d> L2capContext<'d> {
    /// Process a PDU received on the classic signalling channel.
    ///
    /// Commands are handled in order. A truncated command, or a command too short
    /// for its fixed fields, ends processing of the PDU.
    pub(crate) fn process_signal(&mut self, link: usize, pdu: &[u8]) {
        if pdu.len() > L2CAP_SIGNAL_MTU {
            warn!("[signal] link {} pdu of {} bytes exceeds the signalling mtu", link, pdu.len());
            let mut r = ReadCursor::new(pdu);
            while let Ok(cmd) = decode_signalling_command(&mut r) {
                if matches!(SignalCode::try_from(cmd.code), Ok(code) if code.is_request()) {
                    let mtu = (L2CAP_SIGNAL_MTU as u16).to_le_bytes();
                    self.send_signal(
                        link,
                        encode_command_reject(L2CAP_CID_SIGNAL, cmd.identifier, RejectReason::MtuExceeded, &mtu),
                    );
                    break;
                }
            }
            return;
        }

        let mut r = ReadCursor::new(pdu);
        while r.available() >= SIGNAL_HEADER_LEN {
            let cmd = match decode_signalling_command(&mut r) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!("[signal] link {} stopping at truncated command: {:?}", link, e);
                    return;
                }
            };
            let code = match SignalCode::try_from(cmd.code) {
                Ok(code) if is_classic(code) => code,
                _ => {
                    warn!("[signal] link {} command {:02x} not understood", link, cmd.code);
                    self.send_signal(
                        link,
                        encode_command_reject(L2CAP_CID_SIGNAL, cmd.identifier, RejectReason::NotUnderstood, &[]),
                    );
                    return;
                }
            };
            trace!("[signal] link {} {:?} id {}", link, code, cmd.identifier);
            if let Err(e) = self.handle_signal(link, code, cmd.identifier, cmd.payload) {
                warn!("[signal] link {} dropping rest of pdu after {:?}: {:?}", link, code, e);
                return;
            }
        }
    }

    fn handle_signal(&mut self, link: usize, code: SignalCode, id: u8, payload: &[u8]) -> Result<(), DecodeError> {
        let mut r = ReadCursor::new(payload);
        match code {
            SignalCode::CommandRejectRes => self.on_command_reject(link, r)?,
            SignalCode::ConnectionReq => self.on_connect_req(link, id, r.read()?),
            SignalCode::ConnectionRes => self.on_connect_rsp(link, id, r.read()?),
            SignalCode::ConfigurationReq => {
                let header: ConfigReqHeader = r.read()?;
                let parsed = decode_config_options(r.remaining(), payload.len())?;
                self.on_config_req(link, id, header, parsed);
            }
            SignalCode::ConfigurationRes => {
                let header: ConfigRspHeader = r.read()?;
                let parsed = decode_config_options(r.remaining(), payload.len())?;
                self.on_config_rsp(link, id, header, &parsed.options);
            }
            SignalCode::DisconnectionReq => self.on_disconnect_req(link, L2CAP_CID_SIGNAL, id, r.read()?),
            SignalCode::DisconnectionRes => self.on_disconnect_rsp(link, id, r.read()?),
            SignalCode::EchoReq => self.on_echo_req(link, id, payload),
            SignalCode::EchoRes => self.on_echo_rsp(link, id, payload),
            SignalCode::InformationReq => {
                let mut features = self.config.extended_features;
                if self.fcr.is_some() {
                    features |= EXT_FEATURE_ERTM | EXT_FEATURE_STREAMING;
                }
                self.on_info_req(link, L2CAP_CID_SIGNAL, id, r.read()?, features);
            }
            SignalCode::InformationRes => {
                let header: InfoRspHeader = r.read()?;
                self.on_info_rsp(link, header, r)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_command_reject(&mut self, link: usize, mut r: ReadCursor<'_>) -> Result<(), DecodeError> {
        let reject: CommandRejectRes = r.read()?;
        match RejectReason::try_from(reject.reason) {
            Ok(RejectReason::MtuExceeded) => {
                let mtu: u16 = r.read()?;
                warn!("[signal] link {} peer signalling mtu is {}", link, mtu);
            }
            Ok(RejectReason::InvalidCid) => {
                let data: InvalidCidData = r.read()?;
                let (remote_cid, local_cid) = (data.scid, data.dcid);
                warn!("[signal] link {} peer rejected cid {:04x}/{:04x}", link, local_cid, remote_cid);
                if let Some(idx) = self.channels.find_by_local_cid(link, local_cid) {
                    if self.channels.get(idx).remote_cid == remote_cid {
                        self.close_channel(idx, CloseNotice::DisconnectIndication);
                    }
                }
            }
            Ok(RejectReason::NotUnderstood) => {
                debug!("[signal] link {} command not understood by peer", link);
                if matches!(self.links.get(link).info, InfoExchange::Waiting(_)) {
                    debug!("[signal] link {} peer does not answer information requests", link);
                    self.finish_info_exchange(link);
                }
            }
            Err(_) => debug!("[signal] link {} command rejected: {:04x}", link, reject.reason),
        }
        Ok(())
    }

    fn send_connect_rsp(&mut self, link: usize, id: u8, dcid: u16, scid: u16, result: ConnectionResult) {
        let rsp = ConnRsp {
            dcid,
            scid,
            result: result as u16,
            status: 0,
        };
        self.send_signal(link, encode_connect_rsp(id, &rsp));
    }

    fn on_connect_req(&mut self, link: usize, id: u8, req: ConnReq) {
        let registration = match self.registration(Transport::BrEdr, req.psm) {
            Some(r) if r.accepts_incoming => r,
            Some(_) => {
                warn!("[signal] link {} connect request for outgoing-only psm {:04x}", link, req.psm);
                self.send_connect_rsp(link, id, 0, req.scid, ConnectionResult::PsmNotSupported);
                return;
            }
            None => {
                warn!("[signal] link {} connect request for unknown psm {:04x}", link, req.psm);
                self.send_connect_rsp(link, id, 0, req.scid, ConnectionResult::PsmNotSupported);
                return;
            }
        };
        if req.scid < L2CAP_CID_DYN_START {
            self.send_connect_rsp(link, id, 0, req.scid, ConnectionResult::InvalidScid);
            return;
        }
        if self.channels.find_by_remote_cid(link, req.scid).is_some() {
            warn!("[signal] link {} remote cid {:04x} already in use", link, req.scid);
            self.send_connect_rsp(link, id, 0, req.scid, ConnectionResult::ScidAlreadyAllocated);
            return;
        }
        let idx = match self.channels.alloc(link, self.config.max_channels_per_link) {
            Ok(idx) => idx,
            Err(_) => {
                self.send_connect_rsp(link, id, 0, req.scid, ConnectionResult::NoResources);
                return;
            }
        };
        self.init_channel(idx, req.psm, true);
        let cid = ChannelManager::cid(idx);
        let timeout = self.now + self.config.connect_timeout;
        let ch = self.channels.get_mut(idx);
        ch.remote_cid = req.scid;
        ch.remote_id = id;
        ch.state = ChannelState::W4L2caConnectRsp;
        ch.timer = Some(timeout);
        let l = self.links.get_mut(link);
        l.timer = None;
        let addr = l.addr.unwrap_or(BdAddr::new([0; 6]));

        debug!("[signal] link {} incoming channel {} for psm {:04x}", link, cid, req.psm);
        match registration.sink.on_connect_indication(req.psm, addr, cid) {
            ConnectDecision::Accept => self.answer_connect(idx, true),
            ConnectDecision::Pending => {
                self.send_connect_rsp(link, id, cid, req.scid, ConnectionResult::Pending);
            }
            ConnectDecision::Reject => self.answer_connect(idx, false),
        }
    }

    fn on_connect_rsp(&mut self, link: usize, id: u8, rsp: ConnRsp) {
        let Some(idx) = self.channels.find_by_local_cid(link, rsp.scid) else {
            warn!("[signal] link {} connect response for unknown cid {:04x}", link, rsp.scid);
            return;
        };
        let ch = self.channels.get(idx);
        if ch.local_id != id {
            warn!("[signal] link {} connect response id {} expected {}", link, id, ch.local_id);
            return;
        }
        if ch.state != ChannelState::W4L2capConnectRsp {
            debug!("[signal] link {} ignoring connect response in {:?}", link, ch.state);
            return;
        }
        let cid = ChannelManager::cid(idx);
        if rsp.result == ConnectionResult::Success as u16 {
            if rsp.dcid < L2CAP_CID_DYN_START || self.channels.find_by_remote_cid(link, rsp.dcid).is_some() {
                warn!("[signal] link {} peer picked unusable cid {:04x}", link, rsp.dcid);
                self.close_channel(
                    idx,
                    CloseNotice::ConnectConfirm(ConnectResult::Refused(ConnectionResult::NoResources as u16)),
                );
                return;
            }
            let ch = self.channels.get_mut(idx);
            ch.remote_cid = rsp.dcid;
            if ch.disconnect_pending {
                self.send_disconnect_req(idx);
                return;
            }
            if let Some(sink) = self.sink_of(idx) {
                sink.on_connect_confirm(cid, ConnectResult::Success);
            }
            self.enter_config(idx);
        } else if rsp.result == ConnectionResult::Pending as u16 {
            trace!("[l2cap][cid = {}] connect pending, status {}", cid, rsp.status);
            self.channels.get_mut(idx).timer = Some(self.now + self.config.connect_timeout);
        } else {
            debug!("[l2cap][cid = {}] connect refused with {:04x}", cid, rsp.result);
            self.close_channel(idx, CloseNotice::ConnectConfirm(ConnectResult::Refused(rsp.result)));
        }
    }

    fn on_config_req(&mut self, link: usize, id: u8, header: ConfigReqHeader, parsed: ParsedConfig) {
        let Some(idx) = self.channels.find_by_local_cid(link, header.dcid) else {
            warn!("[signal] link {} config request for unknown cid {:04x}", link, header.dcid);
            let data = InvalidCidData {
                scid: header.dcid,
                dcid: 0,
            };
            if let Ok(bytes) = to_bytes::<_, 4>(&data) {
                self.send_signal(
                    link,
                    encode_command_reject(L2CAP_CID_SIGNAL, id, RejectReason::InvalidCid, &bytes),
                );
            }
            return;
        };
        let ch = self.channels.get_mut(idx);
        ch.remote_id = id;
        if !matches!(ch.state, ChannelState::Config | ChannelState::Open) {
            debug!("[signal] link {} ignoring config request in {:?}", link, ch.state);
            return;
        }
        let (remote_cid, psm) = (ch.remote_cid, ch.psm);
        if parsed.reject {
            debug!("[signal] link {} rejecting unknown config options", link);
            self.send_signal(link, encode_config_rej(id, remote_cid, 0, &parsed.rejected));
            return;
        }

        let o = parsed.options;
        let mut unacceptable = ConfigOptions::default();
        if let Some(mtu) = o.mtu {
            if mtu < L2CAP_MIN_MTU {
                unacceptable.mtu = Some(L2CAP_MIN_MTU);
            }
        }
        if o.flush_timeout == Some(0) {
            unacceptable.flush_timeout = Some(0xFFFF);
        }
        if let Some(qos) = o.qos {
            if qos.service_type > QOS_GUARANTEED {
                unacceptable.qos = Some(QosOptions {
                    service_type: QOS_BEST_EFFORT,
                    ..qos
                });
            }
        }

        let mode = match o.fcr {
            Some(fcr) => FcrMode::from_option(fcr.mode),
            None => Some(FcrMode::Basic),
        };
        let allowed = self
            .registration(Transport::BrEdr, psm)
            .map(|r| r.config.allowed_modes)
            .unwrap_or(FcrModes::BASIC);
        let fcr_available = self.fcr.is_some();
        let ch = self.channels.get_mut(idx);
        let mode = match mode {
            Some(m) if m == FcrMode::Basic && allowed.basic => Some(m),
            Some(m) if allowed.contains(m) && fcr_available => Some(m),
            _ => None,
        };
        let mut mode_changed = false;
        match mode {
            Some(m) => {
                mode_changed = m != ch.ours.mode;
            }
            None => {
                ch.config.mode_rejections += 1;
                if ch.config.mode_rejections > 1 {
                    warn!("[signal] link {} channel modes cannot be reconciled", link);
                    let cid = ChannelManager::cid(idx);
                    if let Some(sink) = self.sink_of(idx) {
                        sink.on_config_confirm(cid, ConfigResult::Rejected, 0);
                    }
                    self.send_disconnect_req(idx);
                    return;
                }
                unacceptable.fcr = Some(fcr_options(ch.ours.mode, ch.ours.mtu));
            }
        }

        if !unacceptable.is_empty() {
            debug!("[signal] link {} config request unacceptable", link);
            let rsp = ConfigRspHeader {
                scid: remote_cid,
                flags: 0,
                result: ConfigResult::UnacceptableParams as u16,
            };
            self.send_signal(link, encode_config_rsp(id, &rsp, &unacceptable));
            return;
        }

        let ch = self.channels.get_mut(idx);
        let mode = mode.unwrap_or(FcrMode::Basic);
        if let Some(mtu) = o.mtu {
            ch.peer.mtu = if mode == FcrMode::Basic {
                mtu.min(L2CAP_MTU as u16)
            } else {
                mtu
            };
        }
        if o.flush_timeout.is_some() {
            ch.peer.flush_timeout = o.flush_timeout;
        }
        if o.qos.is_some() {
            ch.peer.qos = o.qos;
        }
        if o.fcs.is_some() {
            ch.peer.fcs = o.fcs;
        }
        ch.peer.mode = mode;

        let continuation = header.flags & CONFIG_FLAG_CONTINUATION;
        let echo = ConfigOptions {
            mtu: o.mtu.map(|_| ch.peer.mtu),
            ..Default::default()
        };
        let rsp = ConfigRspHeader {
            scid: remote_cid,
            flags: continuation,
            result: ConfigResult::Success as u16,
        };
        if continuation == 0 {
            ch.config.inbound_done = true;
        }
        self.send_signal(link, encode_config_rsp(id, &rsp, &echo));

        if mode_changed {
            // Offer the mode the peer asked for in our own direction as well.
            let ch = self.channels.get_mut(idx);
            ch.ours.mode = mode;
            ch.config.outbound_done = false;
            self.send_config_req(idx);
        }
        self.check_config_done(idx);
    }

    fn on_config_rsp(&mut self, link: usize, id: u8, header: ConfigRspHeader, options: &ConfigOptions) {
        let Some(idx) = self.channels.find_by_local_cid(link, header.scid) else {
            warn!("[signal] link {} config response for unknown cid {:04x}", link, header.scid);
            return;
        };
        let cid = ChannelManager::cid(idx);
        let ch = self.channels.get_mut(idx);
        if ch.local_id != id {
            warn!("[signal] link {} config response id {} expected {}", link, id, ch.local_id);
            return;
        }
        if ch.state != ChannelState::Config {
            debug!("[signal] link {} ignoring config response in {:?}", link, ch.state);
            return;
        }
        match ConfigResult::try_from(header.result) {
            Ok(ConfigResult::Success) => {
                if header.flags & CONFIG_FLAG_CONTINUATION != 0 {
                    trace!("[l2cap][cid = {}] config response continues", cid);
                    return;
                }
                ch.config.outbound_done = true;
                self.check_config_done(idx);
            }
            Ok(ConfigResult::Pending) => {
                ch.timer = Some(self.now + self.config.config_timeout);
            }
            Ok(ConfigResult::UnacceptableParams) if ch.config.retries < self.config.max_config_retries => {
                ch.config.retries += 1;
                if let Some(mtu) = options.mtu {
                    ch.ours.mtu = mtu.max(L2CAP_MIN_MTU);
                }
                if let Some(flush_timeout) = options.flush_timeout {
                    ch.ours.flush_timeout = Some(flush_timeout);
                }
                if let Some(mode) = options.fcr.and_then(|f| FcrMode::from_option(f.mode)) {
                    if mode == FcrMode::Basic || self.fcr.is_some() {
                        ch.ours.mode = mode;
                    }
                }
                debug!("[l2cap][cid = {}] offering adjusted configuration", cid);
                self.send_config_req(idx);
            }
            result => {
                warn!("[l2cap][cid = {}] configuration failed: {:?}", cid, result);
                if let Some(sink) = self.sink_of(idx) {
                    sink.on_config_confirm(cid, ConfigResult::Rejected, 0);
                }
                self.send_disconnect_req(idx);
            }
        }
    }

    /// Disconnection request, shared by both signalling channels.
    pub(crate) fn on_disconnect_req(&mut self, link: usize, signal_cid: u16, id: u8, req: DisconnReq) {
        let (local_cid, remote_cid) = (req.dcid, req.scid);
        let rsp = DisconnRsp {
            dcid: local_cid,
            scid: remote_cid,
        };
        let Some(idx) = self.channels.find_by_local_cid(link, local_cid) else {
            debug!("[signal] link {} disconnect request for unknown cid {:04x}", link, local_cid);
            self.send_signal(link, encode_disconn_rsp(signal_cid, id, &rsp));
            return;
        };
        let ch = self.channels.get(idx);
        if ch.remote_cid != remote_cid {
            warn!(
                "[signal] link {} disconnect request for {:04x} with remote cid {:04x}",
                link, local_cid, remote_cid
            );
            return;
        }
        let notice = if ch.state == ChannelState::W4L2capDisconnectRsp {
            CloseNotice::DisconnectConfirm(DisconnectResult::Success)
        } else {
            CloseNotice::DisconnectIndication
        };
        self.send_signal(link, encode_disconn_rsp(signal_cid, id, &rsp));
        self.close_channel(idx, notice);
    }

    /// Disconnection response, shared by both signalling channels.
    pub(crate) fn on_disconnect_rsp(&mut self, link: usize, id: u8, rsp: DisconnRsp) {
        let (remote_cid, local_cid) = (rsp.dcid, rsp.scid);
        let Some(idx) = self.channels.find_by_local_cid(link, local_cid) else {
            debug!("[signal] link {} disconnect response for unknown cid {:04x}", link, local_cid);
            return;
        };
        let ch = self.channels.get(idx);
        if ch.remote_cid != remote_cid || ch.local_id != id || ch.state != ChannelState::W4L2capDisconnectRsp {
            debug!("[signal] link {} ignoring stale disconnect response", link);
            return;
        }
        self.close_channel(idx, CloseNotice::DisconnectConfirm(DisconnectResult::Success));
    }

    fn on_echo_req(&mut self, link: usize, id: u8, data: &[u8]) {
        let data = &data[..data.len().min(ECHO_MAX_DATA)];
        self.send_signal(
            link,
            encode_signal_with(L2CAP_CID_SIGNAL, id, SignalCode::EchoRes, data.len(), |w| {
                w.append(data)
            }),
        );
    }

    pub(crate) fn send_echo_req(&mut self, link: usize, id: u8) {
        self.send_signal(
            link,
            encode_signal_with(L2CAP_CID_SIGNAL, id, SignalCode::EchoReq, 0, |_| Ok(())),
        );
    }

    fn on_echo_rsp(&mut self, link: usize, id: u8, data: &[u8]) {
        let l = self.links.get_mut(link);
        let psm = match l.echo {
            Some((expected, psm)) if expected == id => psm,
            _ => {
                debug!("[signal] link {} unexpected echo response {}", link, id);
                return;
            }
        };
        l.echo = None;
        let addr = l.addr.unwrap_or(BdAddr::new([0; 6]));
        if let Some(registration) = self.registration(Transport::BrEdr, psm) {
            registration.sink.on_echo_response(addr, data);
        }
    }

    /// Answer an information request. `features` is the extended feature mask of the transport.
    pub(crate) fn on_info_req(&mut self, link: usize, signal_cid: u16, id: u8, req: InfoReq, features: u32) {
        let success = |info_type| InfoRspHeader {
            info_type,
            result: INFO_RESULT_SUCCESS,
        };
        let frame = if req.info_type == InfoType::ExtendedFeatures as u16 {
            encode_signal(
                signal_cid,
                id,
                SignalCode::InformationRes,
                &success(req.info_type),
                &features.to_le_bytes(),
            )
        } else if req.info_type == InfoType::FixedChannels as u16 {
            let mut mask = [0u8; 8];
            mask[0] = FIXED_CHANNELS;
            encode_signal(signal_cid, id, SignalCode::InformationRes, &success(req.info_type), &mask)
        } else {
            let rsp = InfoRspHeader {
                info_type: req.info_type,
                result: INFO_RESULT_NOT_SUPPORTED,
            };
            encode_signal(signal_cid, id, SignalCode::InformationRes, &rsp, &[])
        };
        self.send_signal(link, frame);
    }

    fn on_info_rsp(&mut self, link: usize, header: InfoRspHeader, mut r: ReadCursor<'_>) -> Result<(), DecodeError> {
        let waiting = matches!(self.links.get(link).info, InfoExchange::Waiting(_));
        if header.result == INFO_RESULT_SUCCESS {
            if header.info_type == InfoType::ExtendedFeatures as u16 {
                let features: u32 = r.read()?;
                debug!("[signal] link {} peer features {:08x}", link, features);
                let l = self.links.get_mut(link);
                l.peer_ext_features = features;
                if waiting && features & EXT_FEATURE_FIXED_CHANNELS != 0 {
                    let id = l.next_signal_id();
                    l.info = InfoExchange::Waiting(self.now + self.config.info_timeout);
                    let req = InfoReq {
                        info_type: InfoType::FixedChannels as u16,
                    };
                    self.send_signal(
                        link,
                        encode_signal(L2CAP_CID_SIGNAL, id, SignalCode::InformationReq, &req, &[]),
                    );
                    return Ok(());
                }
            } else if header.info_type == InfoType::FixedChannels as u16 {
                let mask: [u8; 8] = r.read()?;
                self.links.get_mut(link).peer_fixed_channels = mask[0];
            }
        }
        if waiting {
            self.finish_info_exchange(link);
        }
        Ok(())
    }
}
