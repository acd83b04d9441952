//! Configuration.
//!
//! Buffer and table capacities are fixed at compile time, since every queue in the
//! engine is a `heapless` container sized by one of the constants below. Timeouts,
//! credit policy and the controller buffer budget live in [`Config`] and can be
//! changed per [`L2capContext`](crate::L2capContext).

use embassy_time::Duration;

/// Largest SDU accepted or sent on a dynamic channel.
///
/// Peer MTUs above this value are clamped in basic mode. LE credit based channels
/// advertise at most this value as their receive MTU.
///
/// Default: 1024.
pub const L2CAP_MTU: usize = 1024;

/// Largest L2CAP frame buffered by the engine, basic header included.
///
/// Every queued transmit frame and every reassembled inbound frame occupies one
/// buffer of this size.
pub const FRAME_SIZE: usize = L2CAP_MTU + 4 + 2;

/// Per-channel transmit queue depth, in frames.
///
/// Default: 8.
pub const L2CAP_TX_QUEUE_SIZE: usize = 8;

/// Per-link queue of outgoing signalling frames.
///
/// Default: 4.
pub const LINK_SIGNAL_QUEUE_SIZE: usize = 4;

/// Number of ACL frames that can wait for the transport at once.
///
/// Default: 8.
pub const OUTBOX_SIZE: usize = 8;

/// Number of HCI commands that can wait for the transport at once.
///
/// Commands are queued apart from ACL frames so data traffic never crowds them out.
///
/// Default: 8.
pub const COMMAND_QUEUE_SIZE: usize = 8;

/// Number of signalling frames held while the HCI connection complete event is outstanding.
///
/// Default: 2.
pub const HOLD_QUEUE_SIZE: usize = 2;

/// Maximum number of PSM registrations. Must be a power of two.
///
/// Default: 8.
pub const MAX_REGISTRATIONS: usize = 8;

/// Upper bound for [`Config::max_channels_per_link`].
///
/// Default: 8.
pub const MAX_CHANNELS_PER_LINK_LIMIT: usize = 8;

/// Upper bound for the number of channel storage slots handed to a context.
///
/// Local CIDs are allocated from `0x0040` upwards, one per slot.
///
/// Default: 32.
pub const L2CAP_MAX_CHANNELS: usize = 32;

/// Runtime configuration of an [`L2capContext`](crate::L2capContext).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Time to wait for a connect response from the peer.
    pub connect_timeout: Duration,
    /// Time to wait for the configuration exchange to complete.
    pub config_timeout: Duration,
    /// Time to wait for a disconnect response before force closing.
    pub disconnect_timeout: Duration,
    /// Time to wait for an information response before connecting anyway.
    pub info_timeout: Duration,
    /// Time before revisiting a link that has queued data but no quota.
    pub link_flow_control_timeout: Duration,
    /// Time a signalling frame for an unknown handle is held before retrying.
    pub hold_timeout: Duration,
    /// Number of hold periods before a held frame is discarded.
    pub hold_retries: u8,
    /// Idle time before an LE link with no dynamic channels is disconnected.
    pub ble_link_timeout: Duration,
    /// Time to wait for the controller to complete a connection update before
    /// sending the staged parameters again.
    pub conn_update_timeout: Duration,
    /// Credits granted to the peer when an LE credit based channel opens and
    /// the level they are topped back up to.
    pub le_default_credits: u16,
    /// Remote credit level at or below which credits are replenished.
    pub le_credit_threshold: u16,
    /// MPS advertised on LE credit based channels.
    pub le_default_mps: u16,
    /// Maximum number of dynamic channels on a single link.
    pub max_channels_per_link: usize,
    /// Total number of ACL buffers in the controller.
    pub controller_buffers: u16,
    /// Starting per-link quota for high priority links.
    pub max_high_priority_quota: u16,
    /// Queued frames on a channel before congestion is reported.
    pub cong_threshold: usize,
    /// Number of times a rejected configuration is offered again.
    pub max_config_retries: u8,
    /// Local controller supports the LE connection parameters request procedure.
    pub conn_param_request_supported: bool,
    /// Extended feature mask reported in information responses on classic links.
    pub extended_features: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            config_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(10),
            info_timeout: Duration::from_secs(3),
            link_flow_control_timeout: Duration::from_secs(2),
            hold_timeout: Duration::from_secs(1),
            hold_retries: 2,
            ble_link_timeout: Duration::from_secs(30),
            conn_update_timeout: Duration::from_secs(40),
            le_default_credits: 10,
            le_credit_threshold: 3,
            le_default_mps: 251,
            max_channels_per_link: MAX_CHANNELS_PER_LINK_LIMIT,
            controller_buffers: 8,
            max_high_priority_quota: 5,
            cong_threshold: L2CAP_TX_QUEUE_SIZE / 2,
            max_config_retries: 3,
            conn_param_request_supported: false,
            extended_features: crate::types::l2cap::EXT_FEATURE_FIXED_CHANNELS,
        }
    }
}
