use bt_hci::param::{BdAddr, LeConnRole};
use trouble_l2cap::types::l2cap::SignalCode;
use trouble_l2cap::{
    ChannelState, ChannelStorage, Config, ConnectResult, DisconnectResult, Error, HciCommand, HciRequest,
    L2capContext, LinkStorage, PsmRegistration, Transport, WriteResult,
};

mod common;
use common::*;

const RFCOMM: u16 = 0x0003;
const LE_PSM: u16 = 0x0081;

fn peer() -> BdAddr {
    BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11])
}

#[test]
fn disconnect_is_idempotent() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, RFCOMM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    let cid = open_incoming(&mut ctx, RFCOMM, 0x0070);
    sink.take();

    ctx.disconnect(cid).unwrap();
    ctx.disconnect(cid).unwrap();
    let sent = drain(&mut ctx);
    let (id, payload) = expect_signal(&sent, SignalCode::DisconnectionReq);
    assert_eq!(payload, le16(&[0x0070, cid]));
    assert_eq!(ctx.channel_info(cid).unwrap().state, ChannelState::W4L2capDisconnectRsp);

    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::DisconnectionRes, id, &le16(&[0x0070, cid])));
    assert_eq!(sink.take(), vec![Event::DisconnectConfirm(cid, DisconnectResult::Success)]);
    assert_eq!(ctx.disconnect(cid), Err(Error::NotFound));
    assert!(sink.take().is_empty());
}

#[test]
fn stale_disconnect_response_ignored() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, RFCOMM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    let cid = open_incoming(&mut ctx, RFCOMM, 0x0070);
    sink.take();

    ctx.disconnect(cid).unwrap();
    let (id, _) = expect_signal(&drain(&mut ctx), SignalCode::DisconnectionReq);
    ctx.process_acl(&signal(
        1,
        CID_SIGNAL,
        SignalCode::DisconnectionRes,
        id.wrapping_add(1),
        &le16(&[0x0070, cid]),
    ));
    assert!(sink.take().is_empty());
    assert_eq!(ctx.channel_info(cid).unwrap().state, ChannelState::W4L2capDisconnectRsp);
}

#[test]
fn config_response_after_local_disconnect_ignored() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, RFCOMM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);

    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConnectionReq, 1, &le16(&[RFCOMM, 0x0070])));
    let sent = drain(&mut ctx);
    let (config_id, _) = expect_signal(&sent, SignalCode::ConfigurationReq);
    let cid = 0x0040;
    assert_eq!(ctx.channel_info(cid).unwrap().state, ChannelState::Config);
    sink.take();

    ctx.disconnect(cid).unwrap();
    let (disc_id, _) = expect_signal(&drain(&mut ctx), SignalCode::DisconnectionReq);
    let deadline = ctx.next_deadline();

    // Answer to our configuration request, then one reusing the disconnect's identifier
    for id in [config_id, disc_id] {
        ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConfigurationRes, id, &le16(&[cid, 0, 0])));
        assert_eq!(ctx.channel_info(cid).unwrap().state, ChannelState::W4L2capDisconnectRsp);
        assert_eq!(ctx.next_deadline(), deadline);
        assert!(sink.take().is_empty());
        assert!(drain(&mut ctx).is_empty());
    }
}

#[test]
fn connect_response_after_local_disconnect_ignored() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, RFCOMM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Central);

    let cid = ctx.connect(RFCOMM, peer(), 0).unwrap();
    let (id, _) = expect_signal(&drain(&mut ctx), SignalCode::InformationReq);
    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::InformationRes, id, &le16(&[2, 0, 0, 0])));
    let (connect_id, _) = expect_signal(&drain(&mut ctx), SignalCode::ConnectionReq);

    ctx.disconnect(cid).unwrap();
    assert!(drain(&mut ctx).is_empty());
    assert_eq!(ctx.channel_info(cid).unwrap().state, ChannelState::W4L2capConnectRsp);

    // The peer's answer lets the deferred disconnect go out
    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConnectionRes, connect_id, &le16(&[0x0071, cid, 0, 0])));
    let (disc_id, payload) = expect_signal(&drain(&mut ctx), SignalCode::DisconnectionReq);
    assert_eq!(payload, le16(&[0x0071, cid]));
    assert!(sink.take().is_empty());
    let deadline = ctx.next_deadline();

    // Repeated success, a pending result and a refusal all arrive too late
    for (id, result) in [(connect_id, 0), (disc_id, 0), (disc_id, 1), (disc_id, 4)] {
        ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConnectionRes, id, &le16(&[0x0072, cid, result, 0])));
        let info = ctx.channel_info(cid).unwrap();
        assert_eq!(info.state, ChannelState::W4L2capDisconnectRsp);
        assert_eq!(info.remote_cid, 0x0071);
        assert_eq!(ctx.next_deadline(), deadline);
        assert!(sink.take().is_empty());
        assert!(drain(&mut ctx).is_empty());
    }
}

#[test]
fn le_connect_response_after_local_disconnect_ignored() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::Le, LE_PSM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(2), peer(), Transport::Le, LeConnRole::Central);
    drain(&mut ctx);

    let cid = ctx.connect_le(LE_PSM, peer(), 0).unwrap();
    let (connect_id, _) = expect_signal(&drain(&mut ctx), SignalCode::LeCreditConnReq);
    ctx.disconnect(cid).unwrap();
    assert!(drain(&mut ctx).is_empty());

    // dcid, mtu, mps, credits, result
    ctx.process_acl(&signal(
        2,
        CID_LE_SIGNAL,
        SignalCode::LeCreditConnRes,
        connect_id,
        &le16(&[0x0060, 100, 50, 2, 0]),
    ));
    let (disc_id, _) = expect_signal(&drain(&mut ctx), SignalCode::DisconnectionReq);
    assert!(sink.take().is_empty());
    let deadline = ctx.next_deadline();

    for (id, result) in [(connect_id, 0), (disc_id, 0), (disc_id, 0x0004)] {
        ctx.process_acl(&signal(
            2,
            CID_LE_SIGNAL,
            SignalCode::LeCreditConnRes,
            id,
            &le16(&[0x0061, 200, 60, 5, result]),
        ));
        let info = ctx.channel_info(cid).unwrap();
        assert_eq!(info.state, ChannelState::W4L2capDisconnectRsp);
        assert_eq!((info.remote_cid, info.peer_mtu, info.peer_credits), (0x0060, 100, 2));
        assert_eq!(ctx.next_deadline(), deadline);
        assert!(sink.take().is_empty());
        assert!(drain(&mut ctx).is_empty());
    }
}

#[test]
fn oversized_signalling_pdu_rejected_once() {
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    drain(&mut ctx);

    // An echo response, then two requests, past the signalling mtu
    let mut pdu = vec![0x09, 0x01, 0x01, 0x00, 0xaa];
    pdu.extend_from_slice(&[0x08, 0x02, 0xa4, 0x02]);
    pdu.extend_from_slice(&[0u8; 0x02a4]);
    pdu.extend_from_slice(&[0x0a, 0x03, 0x02, 0x00, 0x02, 0x00]);
    assert!(pdu.len() > 672);
    ctx.process_acl(&acl(1, CID_SIGNAL, &pdu));
    assert_eq!(
        signals(&drain(&mut ctx)),
        vec![(SignalCode::CommandRejectRes as u8, 2, vec![0x01, 0x00, 0xa0, 0x02])]
    );

    // Nothing to reject when the pdu only carries responses
    let mut pdu = vec![0x09, 0x04, 0xa4, 0x02];
    pdu.extend_from_slice(&[0u8; 0x02a4]);
    ctx.process_acl(&acl(1, CID_SIGNAL, &pdu));
    assert!(drain(&mut ctx).is_empty());
}

#[test]
fn full_acl_outbox_does_not_hold_back_commands() {
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 1];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.on_connection_complete(handle(2), peer(), Transport::Le, LeConnRole::Central);
    drain(&mut ctx);

    // Eight echo requests, each rejected as not understood on LE
    let mut pdu = Vec::new();
    for id in 1..=8u8 {
        pdu.extend_from_slice(&[0x08, id, 0x00, 0x00]);
    }
    ctx.process_acl(&acl(2, CID_LE_SIGNAL, &pdu));
    ctx.update_ble_conn_params(peer(), 0x0010, 0x0020, 0, 0x0100).unwrap();
    assert!(ctx.link_info(&peer(), Transport::Le).unwrap().update.update_pending);

    match ctx.poll_outbound() {
        Some(HciRequest::Command(HciCommand::LeConnUpdate(u))) => {
            assert_eq!(({ u.conn_interval_min }.as_u16(), { u.conn_interval_max }.as_u16()), (0x0010, 0x0020));
        }
        other => panic!("expected the parameter update first, got {:?}", other),
    }
    let rejects = signals(&drain(&mut ctx))
        .into_iter()
        .filter(|(code, _, _)| *code == SignalCode::CommandRejectRes as u8)
        .count();
    assert_eq!(rejects, 8);
}

#[test]
fn truncated_command_ends_processing() {
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    drain(&mut ctx);

    // Echo request using exactly the bytes left, then a configuration request
    // claiming more than the pdu holds.
    let pdu = [
        0x08, 0x01, 0x02, 0x00, 0xaa, 0xbb, //
        0x04, 0x02, 0x0a, 0x00, 0x40, 0x00, 0x00, 0x00,
    ];
    ctx.process_acl(&acl(1, CID_SIGNAL, &pdu));

    let sent = signals(&drain(&mut ctx));
    assert_eq!(sent, vec![(SignalCode::EchoRes as u8, 1, vec![0xaa, 0xbb])]);
}

#[test]
fn malformed_mtu_option_gets_no_reply() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, RFCOMM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    let cid = accept_incoming(&mut ctx, RFCOMM, 0x0070);

    // Flush timeout followed by an mtu option three bytes long
    let mut req = le16(&[cid, 0]);
    req.extend_from_slice(&[0x02, 0x02, 0x64, 0x00, 0x01, 0x03, 0x00, 0x02, 0x00]);
    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConfigurationReq, 3, &req));
    assert!(drain(&mut ctx).is_empty());
    assert_eq!(ctx.channel_info(cid).unwrap().state, ChannelState::Config);

    let mut req = le16(&[cid, 0]);
    req.extend_from_slice(&[0x01, 0x02, 0x00, 0x02]);
    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConfigurationReq, 4, &req));
    let (id, _) = expect_signal(&drain(&mut ctx), SignalCode::ConfigurationRes);
    assert_eq!(id, 4);
    let info = ctx.channel_info(cid).unwrap();
    assert_eq!(info.state, ChannelState::Open);
    assert_eq!(info.peer_mtu, 0x0200);
}

#[test]
fn remote_cids_unique_per_link() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 4];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, RFCOMM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    open_incoming(&mut ctx, RFCOMM, 0x0070);
    sink.take();

    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConnectionReq, 7, &le16(&[RFCOMM, 0x0070])));
    let (_, payload) = expect_signal(&drain(&mut ctx), SignalCode::ConnectionRes);
    assert_eq!(payload, le16(&[0x0000, 0x0070, 0x0007, 0x0000]));
    assert_eq!(ctx.link_info(&peer(), Transport::BrEdr).unwrap().channels, 1);

    // An outgoing channel whose peer answers with the same cid is refused
    let cid = ctx.connect(RFCOMM, peer(), 0).unwrap();
    let (id, _) = expect_signal(&drain(&mut ctx), SignalCode::InformationReq);
    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::InformationRes, id, &le16(&[2, 0, 0, 0])));
    let (id, _) = expect_signal(&drain(&mut ctx), SignalCode::ConnectionReq);
    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::ConnectionRes, id, &le16(&[0x0070, cid, 0, 0])));
    assert_eq!(sink.take(), vec![Event::ConnectConfirm(cid, ConnectResult::Refused(0x0004))]);
    assert!(ctx.channel_info(cid).is_none());
}

#[test]
fn in_flight_frames_bounded_by_quota() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut config = Config::default();
    config.controller_buffers = 2;
    let mut ctx = L2capContext::new(&mut links, &mut channels, config);
    ctx.register(Transport::BrEdr, RFCOMM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    let cid = open_incoming(&mut ctx, RFCOMM, 0x0070);

    for n in 0..5u8 {
        assert_eq!(ctx.write(cid, &[n]), WriteResult::Success);
        let link = ctx.link_info(&peer(), Transport::BrEdr).unwrap();
        assert!(link.sent_not_acked <= link.quota);
    }

    let mut delivered = Vec::new();
    while delivered.len() < 5 {
        while let Some(req) = ctx.poll_outbound() {
            match req {
                HciRequest::Acl { frame, .. } => delivered.push(frame[4]),
                other => panic!("unexpected request {:?}", other),
            }
            let link = ctx.link_info(&peer(), Transport::BrEdr).unwrap();
            assert!(link.sent_not_acked <= link.quota);
        }
        ctx.on_completed_packets(handle(1), 1);
    }
    assert_eq!(delivered, [0, 1, 2, 3, 4]);
}

#[test]
fn congestion_reported_and_cleared() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut config = Config::default();
    config.controller_buffers = 1;
    let mut ctx = L2capContext::new(&mut links, &mut channels, config);
    ctx.register(Transport::BrEdr, RFCOMM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    let cid = open_incoming(&mut ctx, RFCOMM, 0x0070);
    sink.take();

    // One frame in flight, the next four fill the queue up to the threshold
    for n in 0..4u8 {
        assert_eq!(ctx.write(cid, &[n]), WriteResult::Success);
    }
    assert_eq!(ctx.write(cid, &[4]), WriteResult::Congested);
    assert_eq!(sink.take(), vec![Event::Congestion(cid, true)]);
    assert_eq!(ctx.write(cid, &[5]), WriteResult::Failed);

    assert!(ctx.poll_outbound().is_some());
    ctx.on_completed_packets(handle(1), 1);
    assert_eq!(sink.take(), vec![Event::Congestion(cid, false)]);
    assert_eq!(ctx.channel_info(cid).unwrap().queued, 3);
}
