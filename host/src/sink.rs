//! Upper layer interfaces.
//!
//! Every registered PSM owns a [`ChannelEventSink`] that receives the events of the
//! channels opened on it. Sinks are called while the context is mutably borrowed and
//! therefore only get `&self`; they record what happened and act on it later
//! through the context API.

use bt_hci::param::BdAddr;

use crate::types::l2cap::ConfigResult;

/// Answer of a sink to an incoming connection request.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    Accept,
    /// Answer later through [`L2capContext::connect_response`](crate::L2capContext::connect_response).
    Pending,
    Reject,
}

/// Outcome of an outgoing connection attempt.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Success,
    /// The peer refused with the given result code.
    Refused(u16),
    /// No response before the connect timer expired.
    Timeout,
    /// The link went away before the channel was established.
    LinkLost,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    Success,
    /// The peer did not answer; the channel was closed anyway.
    Timeout,
}

/// Events delivered for channels of one PSM.
pub trait ChannelEventSink {
    /// A peer wants to open a channel on `psm`.
    fn on_connect_indication(&self, psm: u16, addr: BdAddr, local_cid: u16) -> ConnectDecision;

    /// Result of a locally initiated connection.
    fn on_connect_confirm(&self, local_cid: u16, result: ConnectResult);

    /// Configuration finished. On success the channel is open and `mtu` is the
    /// largest SDU the peer accepts.
    fn on_config_confirm(&self, local_cid: u16, result: ConfigResult, mtu: u16);

    /// The channel was closed by the peer, by a protocol error or by link loss.
    fn on_disconnect_indication(&self, local_cid: u16);

    /// A locally requested disconnect finished.
    fn on_disconnect_confirm(&self, local_cid: u16, result: DisconnectResult) {
        let _ = (local_cid, result);
    }

    fn on_data_received(&self, local_cid: u16, data: &[u8]);

    fn on_congestion_changed(&self, local_cid: u16, congested: bool);

    /// Answer to a [`ping`](crate::L2capContext::ping) issued on behalf of this sink.
    fn on_echo_response(&self, addr: BdAddr, data: &[u8]) {
        let _ = (addr, data);
    }
}

/// Retransmission and streaming mode processing.
///
/// Frames of channels configured for enhanced retransmission or streaming mode are
/// handed over untouched, basic L2CAP header excluded.
pub trait FcrProcessor {
    fn process_fcr_pdu(&self, local_cid: u16, pdu: &[u8]);
}
