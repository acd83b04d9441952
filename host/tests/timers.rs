use bt_hci::cmd::link_control::DisconnectParams;
use bt_hci::param::{BdAddr, DisconnectReason, LeConnRole};
use trouble_l2cap::types::l2cap::SignalCode;
use trouble_l2cap::{
    ChannelStorage, Config, ConnectResult, DisconnectResult, HciCommand, L2capContext, LinkState, LinkStorage,
    PsmRegistration, Transport,
};

mod common;
use common::*;

const PSM: u16 = 0x1003;

fn peer() -> BdAddr {
    BdAddr::new([0xc0, 0xff, 0xee, 0x00, 0x00, 0x01])
}

#[test]
fn unanswered_connect_times_out_then_link_idles_out() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, PSM, PsmRegistration::new(&sink)).unwrap();

    let cid = ctx.connect(PSM, peer(), 0).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Central);
    let (id, _) = expect_signal(&drain(&mut ctx), SignalCode::InformationReq);
    ctx.process_acl(&signal(1, CID_SIGNAL, SignalCode::InformationRes, id, &le16(&[2, 0, 0, 0])));
    expect_signal(&drain(&mut ctx), SignalCode::ConnectionReq);

    let deadline = ctx.now() + ctx.config().connect_timeout;
    assert_eq!(ctx.next_deadline(), Some(deadline));
    ctx.poll_timers(deadline);
    assert_eq!(sink.take(), vec![Event::ConnectConfirm(cid, ConnectResult::Timeout)]);
    assert!(ctx.channel_info(cid).is_none());

    let idle = ctx.next_deadline().unwrap();
    assert_eq!(idle, deadline + ctx.config().disconnect_timeout);
    ctx.poll_timers(idle);
    assert_eq!(
        drain(&mut ctx),
        vec![Sent::Hci(HciCommand::Disconnect(DisconnectParams {
            handle: handle(1),
            reason: DisconnectReason::RemoteUserTerminatedConn,
        }))]
    );
    assert_eq!(ctx.link_info(&peer(), Transport::BrEdr).unwrap().state, LinkState::Disconnecting);

    ctx.on_disconnection_complete(handle(1), 0x16);
    assert!(ctx.link_info(&peer(), Transport::BrEdr).is_none());
    assert_eq!(ctx.next_deadline(), None);
}

#[test]
fn silent_peer_does_not_block_connect() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, PSM, PsmRegistration::new(&sink)).unwrap();

    let cid = ctx.connect(PSM, peer(), 0).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Central);
    expect_signal(&drain(&mut ctx), SignalCode::InformationReq);

    ctx.poll_timers(ctx.now() + ctx.config().info_timeout);
    let (_, payload) = expect_signal(&drain(&mut ctx), SignalCode::ConnectionReq);
    assert_eq!(payload, le16(&[PSM, cid]));
}

#[test]
fn configuration_timeout_disconnects() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, PSM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    let cid = accept_incoming(&mut ctx, PSM, 0x0055);
    sink.take();

    ctx.poll_timers(ctx.now() + ctx.config().config_timeout);
    let (_, payload) = expect_signal(&drain(&mut ctx), SignalCode::DisconnectionReq);
    assert_eq!(payload, le16(&[0x0055, cid]));
    assert_eq!(sink.take(), vec![Event::DisconnectIndication(cid)]);
    assert!(ctx.channel_info(cid).is_none());
}

#[test]
fn unanswered_disconnect_still_closes() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, PSM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    let cid = open_incoming(&mut ctx, PSM, 0x0055);
    sink.take();

    ctx.disconnect(cid).unwrap();
    drain(&mut ctx);
    ctx.poll_timers(ctx.now() + ctx.config().disconnect_timeout);
    assert_eq!(sink.take(), vec![Event::DisconnectConfirm(cid, DisconnectResult::Timeout)]);
    assert!(ctx.channel_info(cid).is_none());
}

#[test]
fn link_loss_closes_every_channel() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, PSM, PsmRegistration::new(&sink)).unwrap();
    ctx.on_connection_complete(handle(1), peer(), Transport::BrEdr, LeConnRole::Peripheral);
    let open = open_incoming(&mut ctx, PSM, 0x0055);
    let pending = ctx.connect(PSM, peer(), 0).unwrap();
    drain(&mut ctx);
    sink.take();

    ctx.on_disconnection_complete(handle(1), 0x08);
    assert_eq!(
        sink.take(),
        vec![
            Event::DisconnectIndication(open),
            Event::ConnectConfirm(pending, ConnectResult::LinkLost),
        ]
    );
    assert!(ctx.link_info(&peer(), Transport::BrEdr).is_none());
    assert!(drain(&mut ctx).is_empty());
}

#[test]
fn failed_link_reports_channels_lost() {
    let sink = Recorder::new();
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 2];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.register(Transport::BrEdr, PSM, PsmRegistration::new(&sink)).unwrap();

    let cid = ctx.connect(PSM, peer(), 0).unwrap();
    drain(&mut ctx);
    ctx.on_connection_failed(peer(), Transport::BrEdr, 0x04);
    assert_eq!(sink.take(), vec![Event::ConnectConfirm(cid, ConnectResult::LinkLost)]);
    assert!(ctx.link_info(&peer(), Transport::BrEdr).is_none());
}

#[test]
fn connection_update_without_completion_is_sent_again() {
    let mut links = [LinkStorage::NEW; 1];
    let mut channels = [ChannelStorage::NEW; 1];
    let mut ctx = L2capContext::new(&mut links, &mut channels, Config::default());
    ctx.on_connection_complete(handle(3), peer(), Transport::Le, LeConnRole::Central);
    drain(&mut ctx);

    ctx.update_ble_conn_params(peer(), 0x0010, 0x0020, 0, 0x0100).unwrap();
    let updates = |sent: Vec<Sent>| -> usize {
        sent.iter()
            .filter(|s| matches!(s, Sent::Hci(HciCommand::LeConnUpdate(_))))
            .count()
    };
    assert_eq!(updates(drain(&mut ctx)), 1);
    assert!(ctx.link_info(&peer(), Transport::Le).unwrap().update.update_pending);

    // A second request is staged behind the one in flight
    ctx.update_ble_conn_params(peer(), 0x0018, 0x0028, 0, 0x0100).unwrap();
    assert_eq!(updates(drain(&mut ctx)), 0);

    let deadline = ctx.now() + ctx.config().conn_update_timeout;
    assert_eq!(ctx.next_deadline(), Some(deadline));
    ctx.poll_timers(deadline);
    match drain(&mut ctx).as_slice() {
        [Sent::Hci(HciCommand::LeConnUpdate(u))] => {
            assert_eq!(({ u.conn_interval_min }.as_u16(), { u.conn_interval_max }.as_u16()), (0x0018, 0x0028));
        }
        other => panic!("expected the update to be sent again, got {:?}", other),
    }
    let info = ctx.link_info(&peer(), Transport::Le).unwrap();
    assert!(info.update.update_pending);
    assert_eq!(ctx.next_deadline(), Some(deadline + ctx.config().conn_update_timeout));
}
