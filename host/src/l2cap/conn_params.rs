//! LE connection parameter updates.
//!
//! Parameter changes are staged on the link and sent one at a time. A central
//! sends them straight to its controller, a peripheral asks the central over
//! the LE signalling channel unless both controllers support the connection
//! parameters request procedure.

use bt_hci::cmd::le::LeConnUpdateParams;
use bt_hci::param::{ConnHandle, Duration, LeConnRole, LeFeatureMask, Status};

use crate::context::{HciCommand, L2capContext};
use crate::types::hci::{LeRemoteConnParamRequestNegativeReplyParams, LeRemoteConnParamRequestReplyParams};
use crate::types::l2cap::*;

/// Latency requested when falling back to fast parameters.
const FAST_LATENCY: u16 = 0;
/// Supervision timeout requested when falling back to fast parameters, 20s.
const FAST_TIMEOUT: u16 = 0x07D0;

/// Whether a set of connection parameters is within the ranges allowed on air.
pub(crate) fn params_valid(interval_min: u16, interval_max: u16, latency: u16, timeout: u16) -> bool {
    let intervals = CONN_INTERVAL_MIN..=CONN_INTERVAL_MAX;
    intervals.contains(&interval_min)
        && intervals.contains(&interval_max)
        && interval_min <= interval_max
        && latency <= CONN_LATENCY_MAX
        && (SUPERVISION_TIMEOUT_MIN..=SUPERVISION_TIMEOUT_MAX).contains(&timeout)
}

impl<'d> L2capContext<'d> {
    /// Send the staged parameters of an LE link, unless an update is in flight.
    ///
    /// The link's update flags only change once the request is queued. A central
    /// that finds the command queue full retries when a slot frees up.
    pub(crate) fn start_conn_update(&mut self, link: usize) {
        let l = self.links.get(link);
        let Some(handle) = l.handle else {
            return;
        };
        if l.update.update_pending {
            trace!("[conn-params] link {} update pending, staging", link);
            return;
        }
        let use_hci = l.role == LeConnRole::Central || (self.config.conn_param_request_supported && l.peer_conn_param_req);
        let fallback = l.update.disabled;

        let params = if fallback {
            if !(l.update.not_default && l.params.interval_min > CONN_INTERVAL_MIN) {
                return;
            }
            let (mut min, mut max) = (CONN_INTERVAL_MIN, CONN_INTERVAL_MIN);
            self.adjust_connection_intervals(&mut min, &mut max, CONN_INTERVAL_MIN);
            debug!("[conn-params] link {} updates disabled, back to fast parameters", link);
            ConnParamUpdateReq {
                interval_min: min,
                interval_max: max,
                latency: FAST_LATENCY,
                timeout: FAST_TIMEOUT,
            }
        } else {
            if !l.update.new_conn_param {
                return;
            }
            ConnParamUpdateReq {
                interval_min: l.params.interval_min,
                interval_max: l.params.interval_max,
                latency: l.params.latency,
                timeout: l.params.timeout,
            }
        };

        if use_hci {
            debug!(
                "[conn-params] link {} requesting {}..{} latency {} timeout {}",
                link, params.interval_min, params.interval_max, params.latency, params.timeout
            );
            let update = LeConnUpdateParams {
                handle,
                conn_interval_min: Duration::from_u16(params.interval_min),
                conn_interval_max: Duration::from_u16(params.interval_max),
                max_latency: params.latency,
                supervision_timeout: Duration::from_u16(params.timeout),
                min_ce_length: Duration::from_u16(l.params.min_ce_len),
                max_ce_length: Duration::from_u16(l.params.max_ce_len),
            };
            if !self.push_command(HciCommand::LeConnUpdate(update)) {
                debug!("[conn-params] link {} update deferred", link);
                self.links.get_mut(link).deferred.conn_update = true;
                return;
            }
            let deadline = self.now + self.config.conn_update_timeout;
            let l = self.links.get_mut(link);
            l.update.update_pending = true;
            l.update_timer = Some(deadline);
        } else {
            let id = self.links.get_mut(link).next_signal_id();
            debug!("[conn-params] link {} asking the central for new parameters", link);
            self.send_signal(link, encode_conn_param_update_req(id, &params));
        }

        let l = self.links.get_mut(link);
        if fallback {
            l.update.not_default = false;
            l.update.new_conn_param = true;
        } else {
            l.update.new_conn_param = false;
            l.update.not_default = true;
        }
    }

    /// The controller never completed the update in flight, send the staged parameters again.
    pub(crate) fn on_conn_update_timeout(&mut self, link: usize) {
        let l = self.links.get_mut(link);
        l.update_timer = None;
        if !l.update.update_pending {
            return;
        }
        warn!("[conn-params] link {} update timed out", link);
        l.update.update_pending = false;
        if l.update.disabled {
            l.update.not_default = true;
        } else {
            l.update.new_conn_param = true;
        }
        self.start_conn_update(link);
    }

    /// HCI LE connection update complete event.
    pub fn on_conn_update_complete(
        &mut self,
        handle: ConnHandle,
        status: Status,
        interval: u16,
        latency: u16,
        timeout: u16,
    ) {
        let Some(link) = self.links.find_by_handle(handle) else {
            warn!("[conn-params] update complete for unknown handle {}", handle.raw());
            return;
        };
        let l = self.links.get_mut(link);
        l.update.update_pending = false;
        l.update_timer = None;
        match status.to_result() {
            Ok(()) => {
                l.conn_interval = interval;
                debug!(
                    "[conn-params][handle = {}] interval {} latency {} timeout {}",
                    handle.raw(),
                    interval,
                    latency,
                    timeout
                );
            }
            Err(e) => warn!("[conn-params][handle = {}] update failed: {:?}", handle.raw(), e),
        }
        self.start_conn_update(link);
    }

    /// HCI LE remote connection parameter request event.
    pub fn on_remote_conn_param_request(
        &mut self,
        handle: ConnHandle,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        timeout: u16,
    ) {
        let Some(link) = self.links.find_by_handle(handle) else {
            warn!("[conn-params] parameter request for unknown handle {}", handle.raw());
            return;
        };
        let negative = HciCommand::RemoteConnParamNegativeReply(LeRemoteConnParamRequestNegativeReplyParams {
            handle,
            reason: Status::UNACCEPTABLE_CONN_PARAMETERS,
        });
        if !params_valid(interval_min, interval_max, latency, timeout) {
            warn!("[conn-params][handle = {}] peer requested invalid parameters", handle.raw());
            self.push_command(negative);
            return;
        }
        let l = self.links.get_mut(link);
        l.params.interval_min = interval_min;
        l.params.interval_max = interval_max;
        l.params.latency = latency;
        l.params.timeout = timeout;
        if l.update.disabled {
            debug!("[conn-params][handle = {}] updates disabled, refusing", handle.raw());
            l.update.new_conn_param = true;
            self.push_command(negative);
            return;
        }
        let reply = LeRemoteConnParamRequestReplyParams {
            handle,
            interval_min: Duration::from_u16(interval_min),
            interval_max: Duration::from_u16(interval_max),
            max_latency: latency,
            timeout: Duration::from_u16(timeout),
            min_ce_length: Duration::from_u16(l.params.min_ce_len),
            max_ce_length: Duration::from_u16(l.params.max_ce_len),
        };
        self.push_command(HciCommand::RemoteConnParamReply(reply));
    }

    /// HCI LE read remote features complete event.
    pub fn on_read_remote_features_complete(&mut self, handle: ConnHandle, features: LeFeatureMask) {
        if let Some(link) = self.links.find_by_handle(handle) {
            let supported = features.supports_conn_parameters_request_procedure();
            trace!("[conn-params][handle = {}] peer parameter requests: {}", handle.raw(), supported);
            self.links.get_mut(link).peer_conn_param_req = supported;
        }
    }
}
