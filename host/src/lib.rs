//! Host side L2CAP core.
//!
//! Link and channel bookkeeping, the signalling dispatchers for the classic and LE
//! signalling channels, LE credit based flow control, connection parameter
//! negotiation and the transmit quota scheduler. The engine is driven by HCI
//! events and by the local API of [`L2capContext`], and hands everything it wants
//! to send back as [`HciRequest`]s: ACL frames, or [`HciCommand`]s carrying
//! `bt-hci` command parameters.
#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

mod fmt;

pub mod codec;
pub mod config;
pub mod cursor;
pub mod types;

mod channel;
mod channel_manager;
mod context;
mod l2cap;
mod link;
mod link_manager;

pub mod driver;
pub mod runner;
pub mod sink;

pub use channel::{ChannelState, ChannelStorage};
pub use config::Config;
pub use context::{
    ChannelConfig, ChannelInfo, FcrModes, HciCommand, HciRequest, L2capContext, LeChannelConfig, LinkInfo, PsmRegistration,
    WriteResult,
};
pub use link::{AclPriority, ConnUpdateFlags, LinkState, LinkStorage};
pub use runner::{Runner, SharedContext};
pub use sink::{ChannelEventSink, ConnectDecision, ConnectResult, DisconnectResult, FcrProcessor};
pub use types::l2cap::DecodeError;
pub use types::Transport;

/// Errors returned by the local API.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    NotFound,
    ChannelLimitExceeded,
    LinkLimitExceeded,
    InvalidState,
    InvalidValue,
    OutOfMemory,
    Busy,
    Codec(codec::Error),
    Decode(DecodeError),
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        Self::Codec(error)
    }
}

impl From<DecodeError> for Error {
    fn from(error: DecodeError) -> Self {
        Self::Decode(error)
    }
}
