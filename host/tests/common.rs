#![allow(dead_code)]
use std::cell::{Cell, RefCell};

use bt_hci::param::{BdAddr, ConnHandle};
use trouble_l2cap::cursor::ReadCursor;
use trouble_l2cap::types::l2cap::{decode_l2cap_header, decode_signalling_command, ConfigResult, SignalCode};
use trouble_l2cap::{
    ChannelEventSink, ChannelState, ConnectDecision, ConnectResult, DisconnectResult, HciCommand, HciRequest,
    L2capContext,
};

pub const CID_SIGNAL: u16 = 0x0001;
pub const CID_LE_SIGNAL: u16 = 0x0005;

/// Something a sink was told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConnectIndication { psm: u16, cid: u16 },
    ConnectConfirm(u16, ConnectResult),
    ConfigConfirm(u16, ConfigResult, u16),
    DisconnectIndication(u16),
    DisconnectConfirm(u16, DisconnectResult),
    Data(u16, Vec<u8>),
    Congestion(u16, bool),
    Echo(Vec<u8>),
}

/// Sink that records every event and answers connection requests with a fixed decision.
pub struct Recorder {
    events: RefCell<Vec<Event>>,
    decision: Cell<ConnectDecision>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::with_decision(ConnectDecision::Accept)
    }

    pub fn with_decision(decision: ConnectDecision) -> Self {
        Self {
            events: RefCell::new(Vec::new()),
            decision: Cell::new(decision),
        }
    }

    pub fn take(&self) -> Vec<Event> {
        self.events.take()
    }

    fn push(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

impl ChannelEventSink for Recorder {
    fn on_connect_indication(&self, psm: u16, _addr: BdAddr, local_cid: u16) -> ConnectDecision {
        self.push(Event::ConnectIndication { psm, cid: local_cid });
        self.decision.get()
    }

    fn on_connect_confirm(&self, local_cid: u16, result: ConnectResult) {
        self.push(Event::ConnectConfirm(local_cid, result));
    }

    fn on_config_confirm(&self, local_cid: u16, result: ConfigResult, mtu: u16) {
        self.push(Event::ConfigConfirm(local_cid, result, mtu));
    }

    fn on_disconnect_indication(&self, local_cid: u16) {
        self.push(Event::DisconnectIndication(local_cid));
    }

    fn on_disconnect_confirm(&self, local_cid: u16, result: DisconnectResult) {
        self.push(Event::DisconnectConfirm(local_cid, result));
    }

    fn on_data_received(&self, local_cid: u16, data: &[u8]) {
        self.push(Event::Data(local_cid, data.to_vec()));
    }

    fn on_congestion_changed(&self, local_cid: u16, congested: bool) {
        self.push(Event::Congestion(local_cid, congested));
    }

    fn on_echo_response(&self, _addr: BdAddr, data: &[u8]) {
        self.push(Event::Echo(data.to_vec()));
    }
}

/// HCI ACL packet carrying a complete L2CAP frame.
pub fn acl(handle: u16, cid: u16, payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&(handle | 0x2000).to_le_bytes());
    v.extend_from_slice(&(payload.len() as u16 + 4).to_le_bytes());
    v.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    v.extend_from_slice(&cid.to_le_bytes());
    v.extend_from_slice(payload);
    v
}

/// HCI ACL packet carrying a single signalling command.
pub fn signal(handle: u16, signal_cid: u16, code: SignalCode, id: u8, body: &[u8]) -> Vec<u8> {
    let mut pdu = vec![code as u8, id];
    pdu.extend_from_slice(&(body.len() as u16).to_le_bytes());
    pdu.extend_from_slice(body);
    acl(handle, signal_cid, &pdu)
}

/// Little endian encoding of a list of u16 fields.
pub fn le16(fields: &[u16]) -> Vec<u8> {
    fields.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// A frame or command the context handed to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Signal { cid: u16, code: u8, id: u8, payload: Vec<u8> },
    Data { cid: u16, payload: Vec<u8> },
    Hci(HciCommand),
}

/// Take everything queued for the controller, acknowledging each ACL packet as it goes.
pub fn drain(ctx: &mut L2capContext<'_>) -> Vec<Sent> {
    let mut out = Vec::new();
    while let Some(req) = ctx.poll_outbound() {
        let (handle, frame) = match req {
            HciRequest::Acl { handle, frame } => (handle, frame),
            HciRequest::Command(cmd) => {
                out.push(Sent::Hci(cmd));
                continue;
            }
        };
        ctx.on_completed_packets(handle, 1);
        let (_, cid, payload) = decode_l2cap_header(&frame).unwrap();
        if cid == CID_SIGNAL || cid == CID_LE_SIGNAL {
            let mut r = ReadCursor::new(payload);
            while let Ok(cmd) = decode_signalling_command(&mut r) {
                out.push(Sent::Signal {
                    cid,
                    code: cmd.code,
                    id: cmd.identifier,
                    payload: cmd.payload.to_vec(),
                });
            }
        } else {
            out.push(Sent::Data {
                cid,
                payload: payload.to_vec(),
            });
        }
    }
    out
}

/// Signalling commands among `sent`, as code, identifier and payload.
pub fn signals(sent: &[Sent]) -> Vec<(u8, u8, Vec<u8>)> {
    sent.iter()
        .filter_map(|s| match s {
            Sent::Signal { code, id, payload, .. } => Some((*code, *id, payload.clone())),
            _ => None,
        })
        .collect()
}

/// The only signalling command in `sent` with the given code.
pub fn expect_signal(sent: &[Sent], code: SignalCode) -> (u8, Vec<u8>) {
    let found: Vec<_> = signals(sent).into_iter().filter(|(c, _, _)| *c == code as u8).collect();
    assert_eq!(found.len(), 1, "expected one {:?} in {:?}", code, sent);
    let (_, id, payload) = found.into_iter().next().unwrap();
    (id, payload)
}

pub fn handle(raw: u16) -> ConnHandle {
    ConnHandle::new(raw)
}

/// Accept a classic channel from the peer on handle 1 and run its configuration up to,
/// but not including, the peer's configuration request.
pub fn accept_incoming(ctx: &mut L2capContext<'_>, psm: u16, scid: u16) -> u16 {
    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConnectionReq, 1, &le16(&[psm, scid])));
    let sent = drain(ctx);
    let (_, rsp) = expect_signal(&sent, SignalCode::ConnectionRes);
    let cid = u16::from_le_bytes([rsp[0], rsp[1]]);
    let (id, _) = expect_signal(&sent, SignalCode::ConfigurationReq);
    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConfigurationRes, id, &le16(&[cid, 0, 0])));
    cid
}

/// Accept and fully configure a classic channel from the peer on handle 1.
pub fn open_incoming(ctx: &mut L2capContext<'_>, psm: u16, scid: u16) -> u16 {
    let cid = accept_incoming(ctx, psm, scid);
    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConfigurationReq, 2, &le16(&[cid, 0])));
    drain(ctx);
    assert_eq!(ctx.channel_info(cid).unwrap().state, ChannelState::Open);
    cid
}
