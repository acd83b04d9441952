//! The L2CAP context and its local API.

use bt_hci::cmd::le::{LeConnUpdateParams, LeCreateConnParams};
use bt_hci::cmd::link_control::DisconnectParams;
use bt_hci::param::{AddrKind, BdAddr, ConnHandle, Duration, LeConnRole};
use embassy_time::Instant;
use heapless::{Deque, FnvIndexMap};

use crate::channel::{ChannelState, ChannelStorage};
use crate::channel_manager::ChannelManager;
use crate::config::{Config, COMMAND_QUEUE_SIZE, L2CAP_MTU, MAX_REGISTRATIONS, OUTBOX_SIZE};
use crate::l2cap::HeldFrame;
use crate::link::{AclPriority, ConnUpdateFlags, LinkState, LinkStorage};
use crate::link_manager::LinkManager;
use crate::sink::{ChannelEventSink, FcrProcessor};
use crate::types::hci::{
    CreateConnParams, LeRemoteConnParamRequestNegativeReplyParams, LeRemoteConnParamRequestReplyParams,
    ACL_PACKET_TYPES,
};
use crate::types::l2cap::{FcrMode, Frame, L2CAP_DEFAULT_MTU, L2CAP_MIN_MTU, LE_MIN_MTU};
use crate::types::Transport;
use crate::Error;

/// Channel modes a classic PSM is willing to run.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcrModes {
    pub basic: bool,
    pub ertm: bool,
    pub streaming: bool,
}

impl FcrModes {
    pub const BASIC: Self = Self {
        basic: true,
        ertm: false,
        streaming: false,
    };

    pub fn contains(&self, mode: FcrMode) -> bool {
        match mode {
            FcrMode::Basic => self.basic,
            FcrMode::Ertm => self.ertm,
            FcrMode::Streaming => self.streaming,
            FcrMode::LeCredit => false,
        }
    }
}

/// Configuration offered on classic channels of a PSM.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Largest SDU we accept.
    pub mtu: u16,
    pub flush_timeout: Option<u16>,
    pub mode: FcrMode,
    /// Modes accepted when the peer proposes something else.
    pub allowed_modes: FcrModes,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mtu: L2CAP_DEFAULT_MTU,
            flush_timeout: None,
            mode: FcrMode::Basic,
            allowed_modes: FcrModes::BASIC,
        }
    }
}

/// Parameters of LE credit based channels of a PSM.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeChannelConfig {
    pub mtu: u16,
    /// Defaults to [`Config::le_default_mps`].
    pub mps: Option<u16>,
    /// Defaults to [`Config::le_default_credits`].
    pub initial_credits: Option<u16>,
}

impl Default for LeChannelConfig {
    fn default() -> Self {
        Self {
            mtu: L2CAP_MTU as u16,
            mps: None,
            initial_credits: None,
        }
    }
}

/// A PSM registered with the context.
#[derive(Clone, Copy)]
pub struct PsmRegistration<'d> {
    pub sink: &'d dyn ChannelEventSink,
    /// Outgoing-only services refuse incoming connection requests.
    pub accepts_incoming: bool,
    pub config: ChannelConfig,
    pub le: LeChannelConfig,
}

impl<'d> PsmRegistration<'d> {
    pub fn new(sink: &'d dyn ChannelEventSink) -> Self {
        Self {
            sink,
            accepts_incoming: true,
            config: ChannelConfig::default(),
            le: LeChannelConfig::default(),
        }
    }
}

/// HCI command the context wants the controller to run.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HciCommand {
    LeConnUpdate(LeConnUpdateParams),
    RemoteConnParamReply(LeRemoteConnParamRequestReplyParams),
    RemoteConnParamNegativeReply(LeRemoteConnParamRequestNegativeReplyParams),
    Disconnect(DisconnectParams),
    CreateConn(CreateConnParams),
    LeCreateConn(LeCreateConnParams),
}

impl HciCommand {
    /// Command opening an ACL link to `addr`.
    pub(crate) fn create_connection(addr: BdAddr, transport: Transport) -> Self {
        match transport {
            Transport::BrEdr => Self::CreateConn(CreateConnParams {
                bd_addr: addr,
                packet_type: ACL_PACKET_TYPES,
                page_scan_repetition_mode: 0x01,
                reserved: 0,
                clock_offset: 0,
                allow_role_switch: true,
            }),
            Transport::Le => Self::LeCreateConn(LeCreateConnParams {
                le_scan_interval: Duration::from_u16(0x0060),
                le_scan_window: Duration::from_u16(0x0030),
                use_filter_accept_list: false,
                peer_addr_kind: AddrKind::PUBLIC,
                peer_addr: addr,
                own_addr_kind: AddrKind::PUBLIC,
                conn_interval_min: Duration::from_u16(0x0018),
                conn_interval_max: Duration::from_u16(0x0028),
                max_latency: 0,
                supervision_timeout: Duration::from_u16(0x01F4),
                min_ce_length: Duration::from_u16(0),
                max_ce_length: Duration::from_u16(0),
            }),
        }
    }
}

/// Something the context wants the controller to do.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciRequest {
    /// Send a complete L2CAP frame.
    Acl { handle: ConnHandle, frame: Frame },
    Command(HciCommand),
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Success,
    /// Data was queued and the channel is now congested.
    Congested,
    Failed,
}

/// Snapshot of a channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub state: ChannelState,
    pub psm: u16,
    pub local_cid: u16,
    pub remote_cid: u16,
    pub mode: FcrMode,
    /// Largest SDU we accept.
    pub local_mtu: u16,
    /// Largest SDU the peer accepts.
    pub peer_mtu: u16,
    pub peer_mps: u16,
    pub peer_credits: u16,
    pub remote_credits: u16,
    pub queued: usize,
    pub congested: bool,
}

/// Snapshot of a link.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub state: LinkState,
    pub handle: Option<ConnHandle>,
    pub role: LeConnRole,
    pub priority: AclPriority,
    pub quota: u16,
    pub sent_not_acked: u16,
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
    pub update: ConnUpdateFlags,
    pub channels: usize,
}

/// Quota shared by low priority links when there are more of them than buffers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RoundRobin {
    pub quota: u16,
    pub unacked: u16,
}

/// Host L2CAP state.
///
/// All link and channel state lives in the storage slices handed to [`L2capContext::new`].
/// The context is driven by HCI input (`process_acl`, `on_*`), by the local API
/// and by [`poll_timers`](Self::poll_timers). Output is collected with
/// [`poll_outbound`](Self::poll_outbound).
pub struct L2capContext<'d> {
    pub(crate) config: Config,
    pub(crate) links: LinkManager<'d>,
    pub(crate) channels: ChannelManager<'d>,
    pub(crate) registry: FnvIndexMap<(Transport, u16), PsmRegistration<'d>, MAX_REGISTRATIONS>,
    pub(crate) fcr: Option<&'d dyn FcrProcessor>,
    pub(crate) outbox: Deque<(ConnHandle, Frame), OUTBOX_SIZE>,
    pub(crate) commands: Deque<HciCommand, COMMAND_QUEUE_SIZE>,
    pub(crate) held: Deque<HeldFrame, { crate::config::HOLD_QUEUE_SIZE }>,
    pub(crate) hold_timer: Option<Instant>,
    pub(crate) round_robin: RoundRobin,
    pub(crate) interval_floor: Option<u16>,
    pub(crate) now: Instant,
}

impl<'d> L2capContext<'d> {
    pub fn new(links: &'d mut [LinkStorage], channels: &'d mut [ChannelStorage], config: Config) -> Self {
        let mut config = config;
        config.max_channels_per_link = config
            .max_channels_per_link
            .min(crate::config::MAX_CHANNELS_PER_LINK_LIMIT);
        Self {
            config,
            links: LinkManager::new(links),
            channels: ChannelManager::new(channels),
            registry: FnvIndexMap::new(),
            fcr: None,
            outbox: Deque::new(),
            commands: Deque::new(),
            held: Deque::new(),
            hold_timer: None,
            round_robin: RoundRobin::default(),
            interval_floor: None,
            now: Instant::from_ticks(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Instant of the last [`poll_timers`](Self::poll_timers) call.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Register `psm` on `transport`.
    ///
    /// Classic PSMs must be odd with an even upper octet, LE PSMs must be in `0x0001..=0x00FF`.
    /// Registering an already registered PSM replaces its registration.
    pub fn register(&mut self, transport: Transport, psm: u16, registration: PsmRegistration<'d>) -> Result<(), Error> {
        let valid = match transport {
            Transport::BrEdr => psm & 0x0001 == 0x0001 && psm & 0x0100 == 0,
            Transport::Le => (0x0001..=0x00FF).contains(&psm),
        };
        if !valid {
            return Err(Error::InvalidValue);
        }
        if transport == Transport::BrEdr {
            let c = &registration.config;
            if c.mtu < L2CAP_MIN_MTU || !c.allowed_modes.contains(c.mode) {
                return Err(Error::InvalidValue);
            }
            if c.mode != FcrMode::Basic && self.fcr.is_none() {
                return Err(Error::InvalidValue);
            }
        } else if registration.le.mtu < LE_MIN_MTU {
            return Err(Error::InvalidValue);
        }
        self.registry
            .insert((transport, psm), registration)
            .map_err(|_| Error::OutOfMemory)?;
        debug!("[l2cap] registered psm {:04x} on {:?}", psm, transport);
        Ok(())
    }

    pub fn unregister(&mut self, transport: Transport, psm: u16) -> Result<(), Error> {
        self.registry.remove(&(transport, psm)).map(|_| ()).ok_or(Error::NotFound)
    }

    /// Install the processor for retransmission and streaming mode frames.
    pub fn set_fcr_processor(&mut self, fcr: &'d dyn FcrProcessor) {
        self.fcr.replace(fcr);
    }

    /// Update the number of ACL buffers of the controller and redistribute quota.
    pub fn set_controller_buffers(&mut self, buffers: u16) {
        self.config.controller_buffers = buffers;
        self.adjust_allocation();
        self.service_all();
    }

    /// Raise the smallest connection interval accepted from peers, for example while
    /// devices with tighter timing requirements are bonded.
    pub fn set_min_interval_floor(&mut self, floor: Option<u16>) {
        self.interval_floor = floor;
    }

    /// Open a classic channel to `psm` on `addr`, creating the ACL link if needed.
    ///
    /// Returns the local CID. The outcome is reported through the PSM's sink.
    pub fn connect(&mut self, psm: u16, addr: BdAddr, security: u16) -> Result<u16, Error> {
        self.connect_on(Transport::BrEdr, psm, addr, security)
    }

    /// Open an LE credit based channel to `psm` on `addr`, creating the LE link if needed.
    pub fn connect_le(&mut self, psm: u16, addr: BdAddr, security: u16) -> Result<u16, Error> {
        self.connect_on(Transport::Le, psm, addr, security)
    }

    fn connect_on(&mut self, transport: Transport, psm: u16, addr: BdAddr, security: u16) -> Result<u16, Error> {
        if !self.registry.contains_key(&(transport, psm)) {
            warn!("[l2cap] connect to unregistered psm {:04x}", psm);
            return Err(Error::NotFound);
        }
        if let Some(link) = self.links.find_by_addr(&addr, transport) {
            if self.links.get(link).state == LinkState::Disconnecting {
                return Err(Error::InvalidState);
            }
        }
        let (link, created) = self.links.find_or_create(&addr, transport)?;
        if created && self.commands.is_full() {
            warn!("[l2cap] command queue full, unable to create link");
            self.links.release(link);
            return Err(Error::Busy);
        }
        let idx = match self.channels.alloc(link, self.config.max_channels_per_link) {
            Ok(idx) => idx,
            Err(e) => {
                if created {
                    self.links.release(link);
                }
                return Err(e);
            }
        };
        self.init_channel(idx, psm, false);
        let timeout = self.config.connect_timeout;
        let ch = self.channels.get_mut(idx);
        ch.security = security;
        ch.timer = Some(self.now + timeout);

        if created {
            self.push_command(HciCommand::create_connection(addr, transport));
        }
        if self.links.get(link).timer.is_some() {
            self.links.get_mut(link).timer = None;
        }
        if self.links.get(link).state == LinkState::Connected {
            self.start_connect(idx);
        }
        Ok(ChannelManager::cid(idx))
    }

    /// Answer an incoming connection that the sink left pending.
    pub fn connect_response(&mut self, local_cid: u16, accept: bool) -> Result<(), Error> {
        let idx = self.channels.index_of(local_cid).ok_or(Error::NotFound)?;
        if self.channels.get(idx).state != ChannelState::W4L2caConnectRsp {
            return Err(Error::InvalidState);
        }
        self.answer_connect(idx, accept);
        Ok(())
    }

    /// Close a channel.
    ///
    /// Calling it again while the disconnect is in progress does nothing.
    pub fn disconnect(&mut self, local_cid: u16) -> Result<(), Error> {
        let idx = self.channels.index_of(local_cid).ok_or(Error::NotFound)?;
        self.local_disconnect(idx);
        Ok(())
    }

    /// Queue an SDU, or a pre-formatted PDU for channels in retransmission or
    /// streaming mode.
    pub fn write(&mut self, local_cid: u16, data: &[u8]) -> WriteResult {
        let Some(idx) = self.channels.index_of(local_cid) else {
            warn!("[l2cap] write on unknown cid {:04x}", local_cid);
            return WriteResult::Failed;
        };
        self.data_write(idx, data)
    }

    /// Stage new connection parameters for the LE link to `addr`.
    pub fn update_ble_conn_params(
        &mut self,
        addr: BdAddr,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
    ) -> Result<(), Error> {
        let link = self.connected_le_link(&addr)?;
        if !crate::l2cap::conn_params::params_valid(interval_min, interval_max, latency, timeout) {
            return Err(Error::InvalidValue);
        }
        let l = self.links.get_mut(link);
        l.params.interval_min = interval_min;
        l.params.interval_max = interval_max;
        l.params.latency = latency;
        l.params.timeout = timeout;
        l.update.new_conn_param = true;
        self.start_conn_update(link);
        Ok(())
    }

    /// Stage the connection event length range, in 0.625 ms slots, for the LE link
    /// to `addr`. It goes out with the next parameter update.
    pub fn set_ble_ce_length(&mut self, addr: BdAddr, min_ce_len: u16, max_ce_len: u16) -> Result<(), Error> {
        let link = self.connected_le_link(&addr)?;
        if min_ce_len > max_ce_len {
            return Err(Error::InvalidValue);
        }
        let l = self.links.get_mut(link);
        l.params.min_ce_len = min_ce_len;
        l.params.max_ce_len = max_ce_len;
        Ok(())
    }

    /// Allow or forbid connection parameter updates on the LE link to `addr`.
    pub fn enable_ble_conn_updates(&mut self, addr: BdAddr, enable: bool) -> Result<(), Error> {
        let link = self.connected_le_link(&addr)?;
        self.links.get_mut(link).update.disabled = !enable;
        debug!("[conn-params] updates {} on link {}", if enable { "enabled" } else { "disabled" }, link);
        self.start_conn_update(link);
        Ok(())
    }

    /// Raise `min` and `max` to the interval floor in effect.
    pub fn adjust_connection_intervals(&self, min: &mut u16, max: &mut u16, floor: u16) {
        let floor = self.interval_floor.unwrap_or(floor);
        if *min < floor {
            debug!("[conn-params] min interval {} raised to {}", *min, floor);
            *min = floor;
        }
        if *max < floor {
            debug!("[conn-params] max interval {} raised to {}", *max, floor);
            *max = floor;
        }
    }

    /// Change the priority tier of every link to `addr` and redistribute quota.
    pub fn set_acl_priority(&mut self, addr: BdAddr, priority: AclPriority) -> Result<(), Error> {
        let mut found = false;
        for transport in [Transport::BrEdr, Transport::Le] {
            if let Some(link) = self.links.find_by_addr(&addr, transport) {
                self.links.get_mut(link).priority = priority;
                found = true;
            }
        }
        if !found {
            return Err(Error::NotFound);
        }
        self.adjust_allocation();
        self.service_all();
        Ok(())
    }

    /// Send an echo request on the classic link to `addr`. The answer goes to the
    /// sink registered for `psm`.
    pub fn ping(&mut self, addr: BdAddr, psm: u16) -> Result<(), Error> {
        if !self.registry.contains_key(&(Transport::BrEdr, psm)) {
            return Err(Error::NotFound);
        }
        let link = self.links.find_by_addr(&addr, Transport::BrEdr).ok_or(Error::NotFound)?;
        let l = self.links.get_mut(link);
        if l.state != LinkState::Connected {
            return Err(Error::InvalidState);
        }
        if l.echo.is_some() {
            return Err(Error::Busy);
        }
        let id = l.next_signal_id();
        l.echo = Some((id, psm));
        self.send_echo_req(link, id);
        Ok(())
    }

    /// Take the next request for the controller.
    ///
    /// Queued commands go out before ACL frames.
    pub fn poll_outbound(&mut self) -> Option<HciRequest> {
        if let Some(cmd) = self.commands.pop_front() {
            self.retry_deferred();
            return Some(HciRequest::Command(cmd));
        }
        let (handle, frame) = self.outbox.pop_front()?;
        self.service_all();
        Some(HciRequest::Acl { handle, frame })
    }

    pub fn channel_info(&self, local_cid: u16) -> Option<ChannelInfo> {
        let idx = self.channels.index_of(local_cid)?;
        let ch = self.channels.get(idx);
        let (local_mtu, peer_mtu) = if ch.is_le() {
            (ch.le.mtu, ch.le.peer_mtu)
        } else {
            (ch.ours.mtu, ch.peer.mtu)
        };
        Some(ChannelInfo {
            state: ch.state,
            psm: ch.psm,
            local_cid,
            remote_cid: ch.remote_cid,
            mode: ch.ours.mode,
            local_mtu,
            peer_mtu,
            peer_mps: ch.le.peer_mps,
            peer_credits: ch.le.peer_credits,
            remote_credits: ch.le.remote_credits,
            queued: ch.tx.len(),
            congested: ch.cong_sent,
        })
    }

    pub fn link_info(&self, addr: &BdAddr, transport: Transport) -> Option<LinkInfo> {
        let idx = self.links.find_by_addr(addr, transport)?;
        let l = self.links.get(idx);
        Some(LinkInfo {
            state: l.state,
            handle: l.handle,
            role: l.role,
            priority: l.priority,
            quota: l.quota,
            sent_not_acked: l.sent_not_acked,
            interval_min: l.params.interval_min,
            interval_max: l.params.interval_max,
            latency: l.params.latency,
            timeout: l.params.timeout,
            update: l.update,
            channels: self.channels.count_on_link(idx),
        })
    }

    /// Whether a link to `addr` was requested locally and is not connected yet.
    pub fn is_connecting(&self, addr: &BdAddr, transport: Transport) -> bool {
        self.links
            .find_by_addr(addr, transport)
            .map(|l| self.links.get(l).state == LinkState::Connecting)
            .unwrap_or(false)
    }

    pub fn log_status(&self) {
        self.links.print();
    }

    fn connected_le_link(&self, addr: &BdAddr) -> Result<usize, Error> {
        let link = self.links.find_by_addr(addr, Transport::Le).ok_or(Error::NotFound)?;
        if self.links.get(link).state != LinkState::Connected {
            return Err(Error::InvalidState);
        }
        Ok(link)
    }

    /// Queue a command for the controller. Returns false when the command queue is full.
    pub(crate) fn push_command(&mut self, cmd: HciCommand) -> bool {
        if self.commands.push_back(cmd).is_err() {
            warn!("[l2cap] command queue full");
            return false;
        }
        true
    }

    /// Send the commands links had to put off while the command queue was full.
    fn retry_deferred(&mut self) {
        for link in 0..self.links.len() {
            if self.commands.is_full() {
                return;
            }
            let l = self.links.get_mut(link);
            if !l.in_use() || !l.deferred.any() {
                continue;
            }
            let deferred = core::mem::take(&mut l.deferred);
            let connected = l.state == LinkState::Connected;
            trace!("[l2cap] link {} retrying deferred commands {:?}", link, deferred);
            if deferred.disconnect && connected {
                self.on_idle_timeout(link);
            }
            if deferred.conn_update && self.links.get(link).state == LinkState::Connected {
                self.start_conn_update(link);
            }
        }
    }

    pub(crate) fn transport_of(&self, idx: usize) -> Transport {
        self.links.get(self.channels.get(idx).link).transport
    }

    pub(crate) fn registration(&self, transport: Transport, psm: u16) -> Option<PsmRegistration<'d>> {
        self.registry.get(&(transport, psm)).copied()
    }

    /// Sink of the PSM a channel belongs to.
    pub(crate) fn sink_of(&self, idx: usize) -> Option<&'d dyn ChannelEventSink> {
        let psm = self.channels.get(idx).psm;
        self.registration(self.transport_of(idx), psm).map(|r| r.sink)
    }
}
