//! Link control blocks.

use bt_hci::param::{BdAddr, ConnHandle, LeConnRole};
use embassy_time::Instant;
use heapless::Deque;

use crate::config::LINK_SIGNAL_QUEUE_SIZE;
use crate::l2cap::sar::AclReassembly;
use crate::types::l2cap::Frame;
use crate::types::Transport;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Slot not in use.
    Idle,
    /// Waiting for the controller to report the ACL connection.
    Connecting,
    Connected,
    /// HCI disconnect requested, waiting for disconnection complete.
    Disconnecting,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclPriority {
    Normal,
    High,
}

/// Connection parameter update bookkeeping of an LE link.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnUpdateFlags {
    /// Parameters were staged and not yet sent.
    pub new_conn_param: bool,
    /// An update was sent to the controller and has not completed.
    pub update_pending: bool,
    /// The application disabled parameter updates.
    pub disabled: bool,
    /// The link runs with parameters other than those it was created with.
    pub not_default: bool,
}

impl ConnUpdateFlags {
    pub const NONE: Self = Self {
        new_conn_param: false,
        update_pending: false,
        disabled: false,
        not_default: false,
    };
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConnParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
    pub min_ce_len: u16,
    pub max_ce_len: u16,
}

impl ConnParams {
    pub(crate) const NONE: Self = Self {
        interval_min: 0,
        interval_max: 0,
        latency: 0,
        timeout: 0,
        min_ce_len: 0,
        max_ce_len: 0,
    };
}

/// Progress of the information request exchange on a classic link.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InfoExchange {
    NotStarted,
    Waiting(Instant),
    Done,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkTimer {
    /// Disconnect the ACL link, no dynamic channel is left on it.
    Idle,
    /// Revisit a link with queued data after quota was re-distributed.
    FlowControl,
}

/// Controller commands of a link that found the command queue full and are sent
/// again once a slot frees up.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct DeferredCommands {
    pub conn_update: bool,
    pub disconnect: bool,
}

impl DeferredCommands {
    pub(crate) const NONE: Self = Self {
        conn_update: false,
        disconnect: false,
    };

    pub(crate) fn any(&self) -> bool {
        self.conn_update || self.disconnect
    }
}

/// Storage for a single link.
pub struct LinkStorage {
    pub(crate) state: LinkState,
    pub(crate) handle: Option<ConnHandle>,
    pub(crate) addr: Option<BdAddr>,
    pub(crate) transport: Transport,
    pub(crate) role: LeConnRole,
    pub(crate) priority: AclPriority,

    pub(crate) params: ConnParams,
    pub(crate) conn_interval: u16,
    pub(crate) update: ConnUpdateFlags,
    /// Deadline of the connection update in flight.
    pub(crate) update_timer: Option<Instant>,
    pub(crate) peer_conn_param_req: bool,
    pub(crate) deferred: DeferredCommands,

    pub(crate) quota: u16,
    pub(crate) sent_not_acked: u16,

    pub(crate) signal_id: u8,
    pub(crate) signal_queue: Deque<Frame, LINK_SIGNAL_QUEUE_SIZE>,
    pub(crate) info: InfoExchange,
    pub(crate) peer_ext_features: u32,
    pub(crate) peer_fixed_channels: u8,
    /// Identifier of an outstanding echo request and the PSM whose sink gets the answer.
    pub(crate) echo: Option<(u8, u16)>,

    pub(crate) timer: Option<(Instant, LinkTimer)>,
    pub(crate) rx: AclReassembly,
    /// Next channel slot to be served by the scheduler.
    pub(crate) next_channel: usize,
}

impl LinkStorage {
    pub const NEW: LinkStorage = LinkStorage {
        state: LinkState::Idle,
        handle: None,
        addr: None,
        transport: Transport::Le,
        role: LeConnRole::Peripheral,
        priority: AclPriority::Normal,
        params: ConnParams::NONE,
        conn_interval: 0,
        update: ConnUpdateFlags::NONE,
        update_timer: None,
        peer_conn_param_req: false,
        deferred: DeferredCommands::NONE,
        quota: 0,
        sent_not_acked: 0,
        signal_id: 0,
        signal_queue: Deque::new(),
        info: InfoExchange::NotStarted,
        peer_ext_features: 0,
        peer_fixed_channels: 0,
        echo: None,
        timer: None,
        rx: AclReassembly::new(),
        next_channel: 0,
    };

    pub(crate) fn in_use(&self) -> bool {
        self.state != LinkState::Idle
    }

    pub(crate) fn is(&self, addr: &BdAddr, transport: Transport) -> bool {
        self.in_use() && self.transport == transport && self.addr.as_ref() == Some(addr)
    }

    /// Allocate the identifier of the next signalling request on this link.
    ///
    /// Identifiers wrap around and skip zero, which is reserved.
    pub(crate) fn next_signal_id(&mut self) -> u8 {
        self.signal_id = self.signal_id.wrapping_add(1);
        if self.signal_id == 0 {
            self.signal_id = 1;
        }
        self.signal_id
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::NEW;
    }
}

impl core::fmt::Debug for LinkStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LinkStorage")
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("transport", &self.transport)
            .field("quota", &self.quota)
            .field("sent_not_acked", &self.sent_not_acked)
            .field("update", &self.update)
            .finish()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for LinkStorage {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(
            f,
            "state = {}, conn = {}, transport = {}, quota = {}, sent = {}",
            self.state,
            self.handle,
            self.transport,
            self.quota,
            self.sent_not_acked,
        );
    }
}
