//! Async glue between an [`HciDriver`] and the [`L2capContext`].
use core::cell::RefCell;

use bt_hci::cmd::le::{LeConnUpdate, LeCreateConn};
use bt_hci::cmd::link_control::Disconnect;
use bt_hci::data::{AclBroadcastFlag, AclPacket, AclPacketBoundary};
use bt_hci::event::le::LeEvent;
use bt_hci::event::Event;
use bt_hci::param::LeConnRole;
use bt_hci::{FromHciBytes, PacketKind};
use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Instant, Timer};

use crate::config::FRAME_SIZE;
use crate::context::{HciCommand, HciRequest, L2capContext};
use crate::driver::HciDriver;
use crate::types::hci::{
    ConnectionComplete, CreateConn, LeRemoteConnParamRequestNegativeReply, LeRemoteConnParamRequestReply,
    EVENT_CONNECTION_COMPLETE,
};
use crate::types::Transport;

const RX_BUFFER_SIZE: usize = FRAME_SIZE + 4;

/// Context shared between the runner and the application.
///
/// Sinks are called with the context borrowed, they must not call back into it.
pub struct SharedContext<'d> {
    inner: Mutex<NoopRawMutex, RefCell<L2capContext<'d>>>,
    wake: Signal<NoopRawMutex, ()>,
}

impl<'d> SharedContext<'d> {
    pub fn new(context: L2capContext<'d>) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(context)),
            wake: Signal::new(),
        }
    }

    /// Run `f` on the context and wake the runner so anything it queued gets sent.
    ///
    /// Timers are brought up to date first so timeouts armed by `f` start now.
    pub fn with<R>(&self, f: impl FnOnce(&mut L2capContext<'d>) -> R) -> R {
        let now = Instant::now();
        let r = self.inner.lock(|c| {
            let mut c = c.borrow_mut();
            c.poll_timers(now);
            f(&mut c)
        });
        self.wake.signal(());
        r
    }

    fn lock<R>(&self, f: impl FnOnce(&mut L2capContext<'d>) -> R) -> R {
        self.inner.lock(|c| f(&mut c.borrow_mut()))
    }
}

/// Drives a [`SharedContext`] from an HCI driver.
pub struct Runner<'a, 'd, D: HciDriver> {
    shared: &'a SharedContext<'d>,
    driver: D,
}

impl<'a, 'd, D: HciDriver> Runner<'a, 'd, D> {
    pub fn new(shared: &'a SharedContext<'d>, driver: D) -> Self {
        Self { shared, driver }
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Process HCI traffic and timers until the driver fails.
    pub async fn run(&mut self) -> Result<(), D::Error> {
        let mut rx = [0u8; RX_BUFFER_SIZE];
        loop {
            self.flush().await?;
            let deadline = self.shared.lock(|c| c.next_deadline()).unwrap_or(Instant::MAX);
            let result = select3(self.driver.read(&mut rx), Timer::at(deadline), self.shared.wake.wait()).await;
            let now = Instant::now();
            match result {
                Either3::First(Ok((kind, len))) => {
                    let packet = &rx[..len];
                    self.shared.lock(|c| {
                        c.poll_timers(now);
                        dispatch(c, kind, packet);
                    });
                }
                Either3::First(Err(e)) => {
                    warn!("[runner] read failed, stopping");
                    return Err(e);
                }
                Either3::Second(_) => self.shared.lock(|c| c.poll_timers(now)),
                Either3::Third(_) => {}
            }
        }
    }

    /// Write every pending request to the driver.
    pub async fn flush(&mut self) -> Result<usize, D::Error> {
        let mut written = 0;
        while let Some(req) = self.shared.lock(|c| c.poll_outbound()) {
            match req {
                HciRequest::Acl { handle, frame } => {
                    let packet = AclPacket::new(
                        handle,
                        AclPacketBoundary::FirstFlushable,
                        AclBroadcastFlag::PointToPoint,
                        &frame,
                    );
                    self.driver.write(&packet).await?;
                }
                HciRequest::Command(cmd) => self.write_command(cmd).await?,
            }
            written += 1;
        }
        Ok(written)
    }

    async fn write_command(&mut self, cmd: HciCommand) -> Result<(), D::Error> {
        match cmd {
            HciCommand::LeConnUpdate(p) => self.driver.write(&LeConnUpdate::from(p)).await,
            HciCommand::RemoteConnParamReply(p) => self.driver.write(&LeRemoteConnParamRequestReply::from(p)).await,
            HciCommand::RemoteConnParamNegativeReply(p) => {
                self.driver.write(&LeRemoteConnParamRequestNegativeReply::from(p)).await
            }
            HciCommand::Disconnect(p) => self.driver.write(&Disconnect::from(p)).await,
            HciCommand::CreateConn(p) => self.driver.write(&CreateConn::from(p)).await,
            HciCommand::LeCreateConn(p) => self.driver.write(&LeCreateConn::from(p)).await,
        }
    }
}

/// Hand one packet read from the controller to the context.
pub(crate) fn dispatch(ctx: &mut L2capContext<'_>, kind: PacketKind, packet: &[u8]) {
    match kind {
        PacketKind::AclData => ctx.process_acl(packet),
        PacketKind::Event => match Event::from_hci_bytes(packet) {
            Ok((event, _)) => process_event(ctx, event),
            // Also covers LE subevents bt-hci does not know
            Err(e) => debug!("[runner] skipping event: {:?}", e),
        },
        other => warn!("[runner] ignoring {:?} packet from controller", other),
    }
}

fn process_event(ctx: &mut L2capContext<'_>, event: Event<'_>) {
    match event {
        Event::Unknown {
            code: EVENT_CONNECTION_COMPLETE,
            params,
        } => {
            let Ok((e, _)) = ConnectionComplete::from_hci_bytes(params) else {
                warn!("[runner] malformed connection complete");
                return;
            };
            let (status, handle, addr) = ({ e.status }, { e.handle }, e.bd_addr);
            if status.to_result().is_err() {
                ctx.on_connection_failed(addr, Transport::BrEdr, status.into_inner());
                return;
            }
            let role = if ctx.is_connecting(&addr, Transport::BrEdr) {
                LeConnRole::Central
            } else {
                LeConnRole::Peripheral
            };
            ctx.on_connection_complete(handle, addr, Transport::BrEdr, role);
        }
        Event::DisconnectionComplete(e) => {
            if e.status.to_result().is_ok() {
                ctx.on_disconnection_complete(e.handle, e.reason.into_inner());
            }
        }
        Event::NumberOfCompletedPackets(c) => {
            for entry in c.completed_packets {
                match (entry.handle(), entry.num_completed_packets()) {
                    (Ok(handle), Ok(count)) => ctx.on_completed_packets(handle, count),
                    _ => warn!("[runner] malformed completed packets entry"),
                }
            }
        }
        Event::Le(event) => process_le_event(ctx, event),
        other => trace!("[runner] ignoring event {:?}", other),
    }
}

fn process_le_event(ctx: &mut L2capContext<'_>, event: LeEvent<'_>) {
    match event {
        LeEvent::LeConnectionComplete(e) => match e.status.to_result() {
            Ok(()) => ctx.on_connection_complete(e.handle, e.peer_addr, Transport::Le, e.role),
            Err(_) => ctx.on_connection_failed(e.peer_addr, Transport::Le, e.status.into_inner()),
        },
        LeEvent::LeEnhancedConnectionComplete(e) => match e.status.to_result() {
            Ok(()) => ctx.on_connection_complete(e.handle, e.peer_addr, Transport::Le, e.role),
            Err(_) => ctx.on_connection_failed(e.peer_addr, Transport::Le, e.status.into_inner()),
        },
        LeEvent::LeConnectionUpdateComplete(e) => ctx.on_conn_update_complete(
            e.handle,
            e.status,
            e.conn_interval.as_u16(),
            e.peripheral_latency,
            e.supervision_timeout.as_u16(),
        ),
        LeEvent::LeReadRemoteFeaturesComplete(e) => {
            if e.status.to_result().is_ok() {
                ctx.on_read_remote_features_complete(e.handle, e.le_features);
            }
        }
        LeEvent::LeRemoteConnectionParameterRequest(e) => ctx.on_remote_conn_param_request(
            e.handle,
            e.interval_min.as_u16(),
            e.interval_max.as_u16(),
            e.max_latency,
            e.timeout.as_u16(),
        ),
        other => trace!("[runner] ignoring le event {:?}", other),
    }
}
