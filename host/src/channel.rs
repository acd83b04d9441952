//! Channel control blocks.

use embassy_time::Instant;
use heapless::Deque;

use crate::config::L2CAP_TX_QUEUE_SIZE;
use crate::l2cap::sar::SduReassembly;
use crate::types::l2cap::{FcrMode, Frame, QosOptions, L2CAP_DEFAULT_MTU};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Slot not in use.
    Free,
    /// Allocated, waiting for the link or the information exchange before connecting.
    Closed,
    /// Connection request sent, waiting for the peer's response.
    W4L2capConnectRsp,
    /// Connection request received, waiting for the local accept decision.
    W4L2caConnectRsp,
    /// Configuration exchange in progress.
    Config,
    Open,
    /// Disconnection request sent, waiting for the peer's response.
    W4L2capDisconnectRsp,
}

/// Progress of the two independent configuration directions.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConfigProgress {
    /// The peer accepted our request.
    pub outbound_done: bool,
    /// We accepted the peer's request.
    pub inbound_done: bool,
    /// Number of times our request was re-sent after the peer found it unacceptable.
    pub retries: u8,
    /// Number of times the peer's mode was refused.
    pub mode_rejections: u8,
}

impl ConfigProgress {
    pub(crate) const NEW: Self = Self {
        outbound_done: false,
        inbound_done: false,
        retries: 0,
        mode_rejections: 0,
    };
}

/// Configuration of one direction of a classic channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirectionConfig {
    pub mtu: u16,
    pub flush_timeout: Option<u16>,
    pub qos: Option<QosOptions>,
    pub mode: FcrMode,
    pub fcs: Option<u8>,
}

impl DirectionConfig {
    pub(crate) const DEFAULT: Self = Self {
        mtu: L2CAP_DEFAULT_MTU,
        flush_timeout: None,
        qos: None,
        mode: FcrMode::Basic,
        fcs: None,
    };
}

/// Credit based flow control state of an LE channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LeFlow {
    pub peer_mtu: u16,
    pub peer_mps: u16,
    /// Credits the peer granted us.
    pub peer_credits: u16,
    /// Credits we granted the peer and it has not used yet.
    pub remote_credits: u16,
    pub mtu: u16,
    pub mps: u16,
}

impl LeFlow {
    pub(crate) const NEW: Self = Self {
        peer_mtu: 0,
        peer_mps: 0,
        peer_credits: 0,
        remote_credits: 0,
        mtu: 0,
        mps: 0,
    };
}

/// Storage for a single channel.
pub struct ChannelStorage {
    pub(crate) state: ChannelState,
    pub(crate) link: usize,
    pub(crate) psm: u16,
    pub(crate) remote_cid: u16,
    /// Identifier of our outstanding request.
    pub(crate) local_id: u8,
    /// Identifier of the peer's last request.
    pub(crate) remote_id: u8,
    pub(crate) security: u16,
    pub(crate) incoming: bool,
    /// Disconnect as soon as the pending connection request is answered.
    pub(crate) disconnect_pending: bool,

    pub(crate) ours: DirectionConfig,
    pub(crate) peer: DirectionConfig,
    pub(crate) config: ConfigProgress,

    pub(crate) le: LeFlow,
    pub(crate) sdu: SduReassembly,

    pub(crate) tx: Deque<Frame, L2CAP_TX_QUEUE_SIZE>,
    pub(crate) cong_sent: bool,
    pub(crate) timer: Option<Instant>,
}

impl ChannelStorage {
    pub const NEW: ChannelStorage = ChannelStorage {
        state: ChannelState::Free,
        link: 0,
        psm: 0,
        remote_cid: 0,
        local_id: 0,
        remote_id: 0,
        security: 0,
        incoming: false,
        disconnect_pending: false,
        ours: DirectionConfig::DEFAULT,
        peer: DirectionConfig::DEFAULT,
        config: ConfigProgress::NEW,
        le: LeFlow::NEW,
        sdu: SduReassembly::new(),
        tx: Deque::new(),
        cong_sent: false,
        timer: None,
    };

    pub(crate) fn in_use(&self) -> bool {
        self.state != ChannelState::Free
    }

    pub(crate) fn on_link(&self, link: usize) -> bool {
        self.in_use() && self.link == link
    }

    pub(crate) fn is_le(&self) -> bool {
        self.ours.mode == FcrMode::LeCredit
    }

    /// Whether queued data should be reported as congestion to the upper layer.
    pub(crate) fn congested(&self, threshold: usize) -> bool {
        self.tx.len() >= threshold || (self.is_le() && self.le.peer_credits == 0 && !self.tx.is_empty())
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::NEW;
    }
}

impl core::fmt::Debug for ChannelStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelStorage")
            .field("state", &self.state)
            .field("link", &self.link)
            .field("psm", &self.psm)
            .field("remote_cid", &self.remote_cid)
            .field("queued", &self.tx.len())
            .finish()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ChannelStorage {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(
            f,
            "state = {}, link = {}, psm = {}, remote_cid = {}, queued = {}",
            self.state,
            self.link,
            self.psm,
            self.remote_cid,
            self.tx.len(),
        );
    }
}
