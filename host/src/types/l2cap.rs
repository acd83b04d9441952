//! L2CAP wire format.
//!
//! Frame headers, signalling commands and configuration options, decoded through
//! [`ReadCursor`] so that no field is ever read past the end of its command.

use heapless::Vec;
use trouble_l2cap_macros::*;

use crate::codec::{Decode, Encode, Error, FixedSize};
use crate::config::FRAME_SIZE;
use crate::cursor::{ReadCursor, WriteCursor};

pub(crate) const L2CAP_CID_SIGNAL: u16 = 0x0001;
pub(crate) const L2CAP_CID_CONNECTIONLESS: u16 = 0x0002;
pub(crate) const L2CAP_CID_ATT: u16 = 0x0004;
pub(crate) const L2CAP_CID_LE_U_SIGNAL: u16 = 0x0005;
pub(crate) const L2CAP_CID_SMP: u16 = 0x0006;
pub(crate) const L2CAP_CID_DYN_START: u16 = 0x0040;

pub(crate) const L2CAP_HEADER_LEN: usize = 4;
pub(crate) const SIGNAL_HEADER_LEN: usize = 4;

/// MTU of the classic signalling channel.
pub const L2CAP_SIGNAL_MTU: usize = 672;
/// Default MTU of a classic channel when the peer does not configure one.
pub const L2CAP_DEFAULT_MTU: u16 = 672;
/// Smallest MTU accepted on a classic channel.
pub const L2CAP_MIN_MTU: u16 = 48;

pub const LE_MIN_MTU: u16 = 23;
pub const LE_MIN_MPS: u16 = 23;
pub const LE_MAX_MPS: u16 = 65533;
pub const LE_CREDIT_MAX: u16 = 65535;

/// Connection interval bounds, in 1.25ms units.
pub const CONN_INTERVAL_MIN: u16 = 0x0006;
pub const CONN_INTERVAL_MAX: u16 = 0x0C80;
pub const CONN_LATENCY_MAX: u16 = 0x03E8;
/// Supervision timeout bounds, in 10ms units.
pub const SUPERVISION_TIMEOUT_MIN: u16 = 0x000A;
pub const SUPERVISION_TIMEOUT_MAX: u16 = 0x0C80;

pub const CONFIG_FLAG_CONTINUATION: u16 = 0x0001;

pub const EXT_FEATURE_ERTM: u32 = 0x0000_0008;
pub const EXT_FEATURE_STREAMING: u32 = 0x0000_0010;
pub const EXT_FEATURE_FCS: u32 = 0x0000_0020;
pub const EXT_FEATURE_FIXED_CHANNELS: u32 = 0x0000_0080;
pub const LE_FEATURE_MASK: u32 = 0x0000_0000;

pub const FIXED_CHANNEL_SIGNAL_BIT: u8 = 0x02;
pub const FIXED_CHANNEL_CONNECTIONLESS_BIT: u8 = 0x04;
pub const FIXED_CHANNEL_ATT_BIT: u8 = 0x10;
pub const FIXED_CHANNEL_LE_SIGNAL_BIT: u8 = 0x20;
pub const FIXED_CHANNEL_SMP_BIT: u8 = 0x40;

/// A single L2CAP frame, basic header included.
pub type Frame = Vec<u8, FRAME_SIZE>;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalCode {
    CommandRejectRes = 0x01,
    ConnectionReq = 0x02,
    ConnectionRes = 0x03,
    ConfigurationReq = 0x04,
    ConfigurationRes = 0x05,
    DisconnectionReq = 0x06,
    DisconnectionRes = 0x07,
    EchoReq = 0x08,
    EchoRes = 0x09,
    InformationReq = 0x0A,
    InformationRes = 0x0B,
    ConnParamUpdateReq = 0x12,
    ConnParamUpdateRes = 0x13,
    LeCreditConnReq = 0x14,
    LeCreditConnRes = 0x15,
    LeCreditFlowInd = 0x16,
}

impl TryFrom<u8> for SignalCode {
    type Error = Error;
    fn try_from(val: u8) -> Result<Self, Error> {
        Ok(match val {
            0x01 => Self::CommandRejectRes,
            0x02 => Self::ConnectionReq,
            0x03 => Self::ConnectionRes,
            0x04 => Self::ConfigurationReq,
            0x05 => Self::ConfigurationRes,
            0x06 => Self::DisconnectionReq,
            0x07 => Self::DisconnectionRes,
            0x08 => Self::EchoReq,
            0x09 => Self::EchoRes,
            0x0A => Self::InformationReq,
            0x0B => Self::InformationRes,
            0x12 => Self::ConnParamUpdateReq,
            0x13 => Self::ConnParamUpdateRes,
            0x14 => Self::LeCreditConnReq,
            0x15 => Self::LeCreditConnRes,
            0x16 => Self::LeCreditFlowInd,
            _ => return Err(Error::InvalidValue),
        })
    }
}

impl SignalCode {
    /// Whether the command expects a response from the receiver.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::ConnectionReq
                | Self::ConfigurationReq
                | Self::DisconnectionReq
                | Self::EchoReq
                | Self::InformationReq
                | Self::ConnParamUpdateReq
                | Self::LeCreditConnReq
        )
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RejectReason {
    NotUnderstood = 0x0000,
    MtuExceeded = 0x0001,
    InvalidCid = 0x0002,
}

impl TryFrom<u16> for RejectReason {
    type Error = Error;
    fn try_from(val: u16) -> Result<Self, Error> {
        Ok(match val {
            0x0000 => Self::NotUnderstood,
            0x0001 => Self::MtuExceeded,
            0x0002 => Self::InvalidCid,
            _ => return Err(Error::InvalidValue),
        })
    }
}

/// Result field of a classic connection response.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConnectionResult {
    Success = 0x0000,
    Pending = 0x0001,
    PsmNotSupported = 0x0002,
    SecurityBlock = 0x0003,
    NoResources = 0x0004,
    InvalidScid = 0x0006,
    ScidAlreadyAllocated = 0x0007,
}

/// Result field of a configuration response.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConfigResult {
    Success = 0x0000,
    UnacceptableParams = 0x0001,
    Rejected = 0x0002,
    UnknownOptions = 0x0003,
    Pending = 0x0004,
}

impl TryFrom<u16> for ConfigResult {
    type Error = Error;
    fn try_from(val: u16) -> Result<Self, Error> {
        Ok(match val {
            0x0000 => Self::Success,
            0x0001 => Self::UnacceptableParams,
            0x0002 => Self::Rejected,
            0x0003 => Self::UnknownOptions,
            0x0004 => Self::Pending,
            _ => return Err(Error::InvalidValue),
        })
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LeCreditConnResultCode {
    Success = 0x0000,
    SpsmNotSupported = 0x0002,
    NoResources = 0x0004,
    InsufficientAuthentication = 0x0005,
    InsufficientAuthorization = 0x0006,
    EncryptionKeyTooShort = 0x0007,
    InsufficientEncryption = 0x0008,
    InvalidSourceId = 0x0009,
    ScidAlreadyAllocated = 0x000A,
    UnacceptableParameters = 0x000B,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InfoType {
    ConnectionlessMtu = 0x0001,
    ExtendedFeatures = 0x0002,
    FixedChannels = 0x0003,
}

pub const INFO_RESULT_SUCCESS: u16 = 0x0000;
pub const INFO_RESULT_NOT_SUPPORTED: u16 = 0x0001;

pub const CONN_PARAM_ACCEPTED: u16 = 0x0000;
pub const CONN_PARAM_REJECTED: u16 = 0x0001;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct L2capHeader {
    pub length: u16,
    pub channel: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct SignalHeader {
    pub code: u8,
    pub identifier: u8,
    pub length: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct CommandRejectRes {
    pub reason: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct InvalidCidData {
    pub scid: u16,
    pub dcid: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct ConnReq {
    pub psm: u16,
    pub scid: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct ConnRsp {
    pub dcid: u16,
    pub scid: u16,
    pub result: u16,
    pub status: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct ConfigReqHeader {
    pub dcid: u16,
    pub flags: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct ConfigRspHeader {
    pub scid: u16,
    pub flags: u16,
    pub result: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct DisconnReq {
    pub dcid: u16,
    pub scid: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct DisconnRsp {
    pub dcid: u16,
    pub scid: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct InfoReq {
    pub info_type: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct InfoRspHeader {
    pub info_type: u16,
    pub result: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct ConnParamUpdateReq {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub timeout: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct ConnParamUpdateRsp {
    pub result: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct LeCreditConnReq {
    pub psm: u16,
    pub scid: u16,
    pub mtu: u16,
    pub mps: u16,
    pub credits: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct LeCreditConnRes {
    pub dcid: u16,
    pub mtu: u16,
    pub mps: u16,
    pub credits: u16,
    pub result: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Codec)]
pub struct LeCreditFlowInd {
    pub cid: u16,
    pub credits: u16,
}

/// Quality of service option, type 0x03.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Codec)]
pub struct QosOptions {
    pub flags: u8,
    pub service_type: u8,
    pub token_rate: u32,
    pub token_bucket_size: u32,
    pub peak_bandwidth: u32,
    pub latency: u32,
    pub delay_variation: u32,
}

pub const QOS_BEST_EFFORT: u8 = 0x01;
pub const QOS_GUARANTEED: u8 = 0x02;

/// Retransmission and flow control option, type 0x04.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Codec)]
pub struct FcrOptions {
    pub mode: u8,
    pub tx_window: u8,
    pub max_transmit: u8,
    pub retransmission_timeout: u16,
    pub monitor_timeout: u16,
    pub mps: u16,
}

/// Extended flow specification option, type 0x06.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Codec)]
pub struct ExtFlowSpec {
    pub identifier: u8,
    pub service_type: u8,
    pub max_sdu: u16,
    pub sdu_inter_time: u32,
    pub access_latency: u32,
    pub flush_timeout: u32,
}

const OPTION_MTU: u8 = 0x01;
const OPTION_FLUSH_TIMEOUT: u8 = 0x02;
const OPTION_QOS: u8 = 0x03;
const OPTION_FCR: u8 = 0x04;
const OPTION_FCS: u8 = 0x05;
const OPTION_EXT_FLOW: u8 = 0x06;
const OPTION_HINT: u8 = 0x80;
const OPTION_OVERHEAD: usize = 2;

/// Channel mode carried in the retransmission and flow control option.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcrMode {
    Basic,
    Ertm,
    Streaming,
    LeCredit,
}

impl FcrMode {
    pub fn from_option(mode: u8) -> Option<Self> {
        match mode {
            0x00 => Some(Self::Basic),
            0x03 => Some(Self::Ertm),
            0x04 => Some(Self::Streaming),
            _ => None,
        }
    }

    pub fn to_option(self) -> u8 {
        match self {
            Self::Basic | Self::LeCredit => 0x00,
            Self::Ertm => 0x03,
            Self::Streaming => 0x04,
        }
    }
}

/// The set of options present in a configuration request or response.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigOptions {
    pub mtu: Option<u16>,
    pub flush_timeout: Option<u16>,
    pub qos: Option<QosOptions>,
    pub fcr: Option<FcrOptions>,
    pub fcs: Option<u8>,
    pub ext_flow: Option<ExtFlowSpec>,
}

impl ConfigOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Encoded length of all present options.
    pub fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.mtu.is_some() {
            len += OPTION_OVERHEAD + u16::SIZE;
        }
        if self.flush_timeout.is_some() {
            len += OPTION_OVERHEAD + u16::SIZE;
        }
        if self.qos.is_some() {
            len += OPTION_OVERHEAD + QosOptions::SIZE;
        }
        if self.fcr.is_some() {
            len += OPTION_OVERHEAD + FcrOptions::SIZE;
        }
        if self.fcs.is_some() {
            len += OPTION_OVERHEAD + u8::SIZE;
        }
        if self.ext_flow.is_some() {
            len += OPTION_OVERHEAD + ExtFlowSpec::SIZE;
        }
        len
    }

    pub fn encode_into(&self, w: &mut WriteCursor<'_>) -> Result<(), Error> {
        fn option<E: Encode>(w: &mut WriteCursor<'_>, kind: u8, value: &E) -> Result<(), Error> {
            w.write(kind)?;
            w.write(value.size() as u8)?;
            w.write_ref(value)
        }
        if let Some(mtu) = &self.mtu {
            option(w, OPTION_MTU, mtu)?;
        }
        if let Some(flush) = &self.flush_timeout {
            option(w, OPTION_FLUSH_TIMEOUT, flush)?;
        }
        if let Some(qos) = &self.qos {
            option(w, OPTION_QOS, qos)?;
        }
        if let Some(fcr) = &self.fcr {
            option(w, OPTION_FCR, fcr)?;
        }
        if let Some(fcs) = &self.fcs {
            option(w, OPTION_FCS, fcs)?;
        }
        if let Some(ext) = &self.ext_flow {
            option(w, OPTION_EXT_FLOW, ext)?;
        }
        Ok(())
    }
}

/// Options of a configuration command together with any unknown options that must be rejected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedConfig {
    pub options: ConfigOptions,
    /// Set when at least one unknown, non-hint option was present.
    pub reject: bool,
    /// Unknown non-hint options, copied verbatim for the rejecting response.
    pub rejected: Vec<u8, L2CAP_SIGNAL_MTU>,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame shorter than its header, or declared length not matching the payload.
    MalformedHeader,
    /// A command or option extends past the end of its container.
    Truncated,
    /// A known option declared a length other than the one fixed for its type.
    BadOptionLength { option: u8 },
    Codec(Error),
}

impl From<Error> for DecodeError {
    fn from(e: Error) -> Self {
        match e {
            Error::InsufficientSpace => Self::Truncated,
            other => Self::Codec(other),
        }
    }
}

/// Decode the basic L2CAP header, returning `(length, cid, payload)`.
pub fn decode_l2cap_header(buf: &[u8]) -> Result<(u16, u16, &[u8]), DecodeError> {
    let mut r = ReadCursor::new(buf);
    let header: L2capHeader = r.read().map_err(|_| DecodeError::MalformedHeader)?;
    let payload = r.remaining();
    if header.length as usize != payload.len() {
        return Err(DecodeError::MalformedHeader);
    }
    Ok((header.length, header.channel, payload))
}

/// One command taken from a signalling PDU.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalCommand<'d> {
    pub code: u8,
    pub identifier: u8,
    pub payload: &'d [u8],
}

/// Take the next command off a signalling PDU.
///
/// Fails with [`DecodeError::Truncated`] if fewer than four bytes remain or if the
/// declared command length exceeds what is left. The cursor is only advanced on success.
pub fn decode_signalling_command<'d>(r: &mut ReadCursor<'d>) -> Result<SignalCommand<'d>, DecodeError> {
    let mut ahead = r.clone();
    let header: SignalHeader = ahead.read()?;
    let payload = ahead.slice(header.length as usize)?;
    *r = ahead;
    Ok(SignalCommand {
        code: header.code,
        identifier: header.identifier,
        payload,
    })
}

fn fixed_option<'d, T: Decode<'d> + FixedSize>(
    r: &mut ReadCursor<'d>,
    kind: u8,
    len: u8,
) -> Result<T, DecodeError> {
    if len as usize != T::SIZE {
        return Err(DecodeError::BadOptionLength { option: kind });
    }
    Ok(r.read()?)
}

/// Decode the option list of a configuration request or response.
///
/// `cmd_len` is the length of the whole command and bounds the length an unknown
/// option may declare. Any known option with a length that does not match its
/// type fails the whole list, so no option of a malformed list is ever applied.
pub fn decode_config_options(payload: &[u8], cmd_len: usize) -> Result<ParsedConfig, DecodeError> {
    let mut parsed = ParsedConfig::default();
    let mut r = ReadCursor::new(payload);
    while !r.is_empty() {
        let kind: u8 = r.read()?;
        let len: u8 = r.read()?;
        let o = &mut parsed.options;
        match kind & !OPTION_HINT {
            OPTION_MTU => o.mtu = Some(fixed_option(&mut r, kind, len)?),
            OPTION_FLUSH_TIMEOUT => o.flush_timeout = Some(fixed_option(&mut r, kind, len)?),
            OPTION_QOS => o.qos = Some(fixed_option(&mut r, kind, len)?),
            OPTION_FCR => o.fcr = Some(fixed_option(&mut r, kind, len)?),
            OPTION_FCS => o.fcs = Some(fixed_option(&mut r, kind, len)?),
            OPTION_EXT_FLOW => o.ext_flow = Some(fixed_option(&mut r, kind, len)?),
            _ => {
                if len as usize + OPTION_OVERHEAD > cmd_len {
                    parsed.reject = true;
                    break;
                }
                let value = r.slice(len as usize)?;
                if kind & OPTION_HINT == 0 {
                    parsed.reject = true;
                    // Options that do not fit the echo buffer are left out of the response.
                    if parsed.rejected.capacity() - parsed.rejected.len() >= value.len() + OPTION_OVERHEAD {
                        let _ = parsed.rejected.push(kind);
                        let _ = parsed.rejected.push(len);
                        let _ = parsed.rejected.extend_from_slice(value);
                    }
                }
            }
        }
    }
    Ok(parsed)
}

/// Builds a single signalling command frame on `cid`.
pub(crate) fn encode_signal<S: Encode>(
    cid: u16,
    identifier: u8,
    code: SignalCode,
    body: &S,
    extra: &[u8],
) -> Result<Frame, Error> {
    encode_signal_with(cid, identifier, code, body.size() + extra.len(), |w| {
        w.write_ref(body)?;
        w.append(extra)
    })
}

pub(crate) fn encode_signal_with<F>(
    cid: u16,
    identifier: u8,
    code: SignalCode,
    body_len: usize,
    f: F,
) -> Result<Frame, Error>
where
    F: FnOnce(&mut WriteCursor<'_>) -> Result<(), Error>,
{
    let total = L2CAP_HEADER_LEN + SIGNAL_HEADER_LEN + body_len;
    let mut frame = Frame::new();
    frame.resize(total, 0).map_err(|_| Error::InsufficientSpace)?;
    let mut w = WriteCursor::new(&mut frame[..]);
    w.write(L2capHeader {
        length: (SIGNAL_HEADER_LEN + body_len) as u16,
        channel: cid,
    })?;
    w.write(SignalHeader {
        code: code as u8,
        identifier,
        length: body_len as u16,
    })?;
    f(&mut w)?;
    if w.len() != total {
        return Err(Error::InvalidValue);
    }
    Ok(frame)
}

/// Builds a basic information frame carrying `data` on `cid`.
pub(crate) fn encode_basic_frame(cid: u16, prefix: &[u8], data: &[u8]) -> Result<Frame, Error> {
    let total = L2CAP_HEADER_LEN + prefix.len() + data.len();
    let mut frame = Frame::new();
    frame.resize(total, 0).map_err(|_| Error::InsufficientSpace)?;
    let mut w = WriteCursor::new(&mut frame[..]);
    w.write(L2capHeader {
        length: (prefix.len() + data.len()) as u16,
        channel: cid,
    })?;
    w.append(prefix)?;
    w.append(data)?;
    Ok(frame)
}

pub fn encode_command_reject(cid: u16, identifier: u8, reason: RejectReason, data: &[u8]) -> Result<Frame, Error> {
    encode_signal(
        cid,
        identifier,
        SignalCode::CommandRejectRes,
        &CommandRejectRes { reason: reason as u16 },
        data,
    )
}

pub fn encode_connect_req(identifier: u8, req: &ConnReq) -> Result<Frame, Error> {
    encode_signal(L2CAP_CID_SIGNAL, identifier, SignalCode::ConnectionReq, req, &[])
}

pub fn encode_connect_rsp(identifier: u8, rsp: &ConnRsp) -> Result<Frame, Error> {
    encode_signal(L2CAP_CID_SIGNAL, identifier, SignalCode::ConnectionRes, rsp, &[])
}

pub fn encode_config_req(identifier: u8, header: &ConfigReqHeader, options: &ConfigOptions) -> Result<Frame, Error> {
    encode_signal_with(
        L2CAP_CID_SIGNAL,
        identifier,
        SignalCode::ConfigurationReq,
        header.size() + options.encoded_len(),
        |w| {
            w.write_ref(header)?;
            options.encode_into(w)
        },
    )
}

pub fn encode_config_rsp(identifier: u8, header: &ConfigRspHeader, options: &ConfigOptions) -> Result<Frame, Error> {
    encode_signal_with(
        L2CAP_CID_SIGNAL,
        identifier,
        SignalCode::ConfigurationRes,
        header.size() + options.encoded_len(),
        |w| {
            w.write_ref(header)?;
            options.encode_into(w)
        },
    )
}

/// Configuration response rejecting unknown options, which are echoed back verbatim.
pub fn encode_config_rej(identifier: u8, scid: u16, flags: u16, rejected: &[u8]) -> Result<Frame, Error> {
    let header = ConfigRspHeader {
        scid,
        flags,
        result: ConfigResult::UnknownOptions as u16,
    };
    encode_signal(L2CAP_CID_SIGNAL, identifier, SignalCode::ConfigurationRes, &header, rejected)
}

pub fn encode_disconn_req(cid: u16, identifier: u8, req: &DisconnReq) -> Result<Frame, Error> {
    encode_signal(cid, identifier, SignalCode::DisconnectionReq, req, &[])
}

pub fn encode_disconn_rsp(cid: u16, identifier: u8, rsp: &DisconnRsp) -> Result<Frame, Error> {
    encode_signal(cid, identifier, SignalCode::DisconnectionRes, rsp, &[])
}

pub fn encode_credit_based_conn_req(identifier: u8, req: &LeCreditConnReq) -> Result<Frame, Error> {
    encode_signal(L2CAP_CID_LE_U_SIGNAL, identifier, SignalCode::LeCreditConnReq, req, &[])
}

pub fn encode_credit_based_conn_res(identifier: u8, res: &LeCreditConnRes) -> Result<Frame, Error> {
    encode_signal(L2CAP_CID_LE_U_SIGNAL, identifier, SignalCode::LeCreditConnRes, res, &[])
}

pub fn encode_flow_control_credit(identifier: u8, ind: &LeCreditFlowInd) -> Result<Frame, Error> {
    encode_signal(L2CAP_CID_LE_U_SIGNAL, identifier, SignalCode::LeCreditFlowInd, ind, &[])
}

pub fn encode_conn_param_update_req(identifier: u8, req: &ConnParamUpdateReq) -> Result<Frame, Error> {
    encode_signal(L2CAP_CID_LE_U_SIGNAL, identifier, SignalCode::ConnParamUpdateReq, req, &[])
}

pub fn encode_conn_param_update_rsp(identifier: u8, result: u16) -> Result<Frame, Error> {
    encode_signal(
        L2CAP_CID_LE_U_SIGNAL,
        identifier,
        SignalCode::ConnParamUpdateRes,
        &ConnParamUpdateRsp { result },
        &[],
    )
}
