//! HCI commands and events the L2CAP core needs that `bt-hci` does not define.
//!
//! Everything else exchanged with the controller uses the `bt-hci` types directly.

use bt_hci::cmd;
use bt_hci::param::{BdAddr, ConnHandle, Duration, Status};

/// Event code of the classic Connection Complete event.
pub const EVENT_CONNECTION_COMPLETE: u8 = 0x03;

/// Packet types offered when creating classic connections, DM1/DH1/DM3/DH3/DM5/DH5.
pub const ACL_PACKET_TYPES: u16 = 0xCC18;

bt_hci::param! {
    /// Parameters of the classic Connection Complete event.
    struct ConnectionComplete {
        status: Status,
        handle: ConnHandle,
        bd_addr: BdAddr,
        link_type: u8,
        encryption_enabled: bool,
    }
}

cmd! {
    /// Create Connection command of a classic ACL link.
    CreateConn(LINK_CONTROL, 0x0005) {
        CreateConnParams {
            bd_addr: BdAddr,
            packet_type: u16,
            page_scan_repetition_mode: u8,
            reserved: u8,
            clock_offset: u16,
            allow_role_switch: bool,
        }
    }
}

cmd! {
    /// LE Remote Connection Parameter Request Reply command.
    LeRemoteConnParamRequestReply(LE, 0x0020) {
        LeRemoteConnParamRequestReplyParams {
            handle: ConnHandle,
            interval_min: Duration<1_250>,
            interval_max: Duration<1_250>,
            max_latency: u16,
            timeout: Duration<10_000>,
            min_ce_length: Duration<625>,
            max_ce_length: Duration<625>,
        }
    }
}

cmd! {
    /// LE Remote Connection Parameter Request Negative Reply command.
    LeRemoteConnParamRequestNegativeReply(LE, 0x0021) {
        LeRemoteConnParamRequestNegativeReplyParams {
            handle: ConnHandle,
            reason: Status,
        }
    }
}
