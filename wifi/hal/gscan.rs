// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Background scans: scan buckets, BSSID hotlist, significant change, ePNO
//! and passpoint network lists, and cached results.
//!
//! Each operation installs its event handlers as a [`Subscription`] before
//! sending the request, so that no event can race the registration. Stopping
//! the operation disables the handlers before the stop request is sent.

use crate::contract::{GscanResults, WireContract};
use crate::error::{Error, Result};
use crate::{read_u32_array, Interface};
use bitflags::bitflags;
use log::{debug, info, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wifi_hal_nlattr::{Attribute, Attrs, ParseError};
use wifi_hal_vendor::{
    generate_request_id, Command, Completed, Dispatcher, EventKey, Fragment, FragmentAccumulator,
    Handler, ListLayout, RequestIdPolicy, Subscription, Transport,
};

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_BUCKETS: usize = 16;
pub const MAX_CHANNELS: usize = 16;
pub const MAX_HOTLIST_APS: usize = 128;
pub const MAX_SIGNIFICANT_CHANGE_APS: usize = 64;
pub const MAX_EPNO_NETWORKS: usize = 64;
pub const MAX_PASSPOINT_NETWORKS: usize = 16;
pub const MAX_BLACKLIST_BSSIDS: usize = 16;

/// Access point seen by a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Time of discovery, in microseconds since boot
    pub ts: u64,
    pub ssid: Vec<u8>,
    pub bssid: [u8; 6],
    /// Frequency in MHz
    pub channel: u32,
    pub rssi: i32,
    /// 0 when not measured
    pub rtt: u32,
    pub rtt_sd: u32,
    /// 0 when not reported. Hotlist and significant change events leave
    /// out the beacon period and the capability.
    pub beacon_period: u16,
    /// Capability field of the beacon, 0 when not reported
    pub capability: u16,
    pub ie_data: Vec<u8>,
}

impl ScanResult {
    fn decode(c: &GscanResults, attrs: &Attrs) -> Result<Self, ParseError> {
        let ssid = attrs.bytes(c.ssid)?;
        let ssid_len = ssid.iter().position(|&b| b == 0).unwrap_or(ssid.len()).min(MAX_SSID_LEN);
        let ie_data = match attrs.optional(c.ie_length, Attribute::as_u32)? {
            None | Some(0) => vec![],
            Some(len) => {
                let data = attrs.bytes(c.ie_data)?;
                let len = len as usize;
                if data.len() < len {
                    return Err(ParseError::TruncatedAttribute { tag: c.ie_data, expected: len, actual: data.len() });
                }
                data[..len].to_vec()
            }
        };
        Ok(Self {
            ts: attrs.u64(c.time_stamp)?,
            ssid: ssid[..ssid_len].to_vec(),
            bssid: attrs.require(c.bssid)?.as_array()?,
            channel: attrs.u32(c.channel)?,
            rssi: attrs.i32(c.rssi)?,
            rtt: attrs.optional(c.rtt, Attribute::as_u32)?.unwrap_or(0),
            rtt_sd: attrs.optional(c.rtt_sd, Attribute::as_u32)?.unwrap_or(0),
            beacon_period: attrs.optional(c.beacon_period, Attribute::as_u16)?.unwrap_or(0),
            capability: attrs.optional(c.capability, Attribute::as_u16)?.unwrap_or(0),
            ie_data,
        })
    }

    #[cfg(test)]
    pub(crate) fn to_attrs(&self, c: &GscanResults) -> Vec<Attribute> {
        vec![
            Attribute::u64(c.time_stamp, self.ts),
            Attribute::bytes(c.ssid, &self.ssid),
            Attribute::bytes(c.bssid, &self.bssid),
            Attribute::u32(c.channel, self.channel),
            Attribute::i32(c.rssi, self.rssi),
            Attribute::u32(c.rtt, self.rtt),
            Attribute::u32(c.rtt_sd, self.rtt_sd),
            Attribute::u16(c.beacon_period, self.beacon_period),
            Attribute::u16(c.capability, self.capability),
            Attribute::u32(c.ie_length, self.ie_data.len() as u32),
            Attribute::bytes(c.ie_data, &self.ie_data),
        ]
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScanFlags: u32 {
        /// The scan was cut short, results are incomplete
        const INTERRUPTED = 1;
    }
}

/// Results of one scan, from the firmware cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedScanResults {
    pub scan_id: u32,
    pub flags: ScanFlags,
    /// Bitmap of the buckets scanned, 0 when not reported
    pub buckets_scanned: u32,
    pub results: Vec<ScanResult>,
}

/// Part of a cached scan carried by one reply
#[derive(Debug)]
struct CachedChunk {
    flags: ScanFlags,
    buckets_scanned: u32,
    results: Vec<ScanResult>,
}

impl CachedScanResults {
    fn assemble(completed: Completed<CachedChunk>) -> Vec<Self> {
        completed
            .groups
            .into_iter()
            .map(|group| {
                let mut scan = CachedScanResults {
                    scan_id: group.id.unwrap_or_default(),
                    flags: ScanFlags::empty(),
                    buckets_scanned: 0,
                    results: vec![],
                };
                for chunk in group.records {
                    scan.flags |= chunk.flags;
                    scan.buckets_scanned |= chunk.buckets_scanned;
                    scan.results.extend(chunk.results);
                }
                scan
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ScanEvent {
    ResultsAvailable = 0,
    ThresholdNumScans = 1,
    ThresholdPercent = 2,
    Failed = 3,
}

/// RSSI history of an access point whose signal changed significantly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignificantChange {
    pub bssid: [u8; 6],
    pub channel: u32,
    pub rssi: Vec<i32>,
}

impl SignificantChange {
    fn decode(c: &GscanResults, attrs: &Attrs) -> Result<Self, ParseError> {
        let num_rssi = attrs.u32(c.significant_change_num_rssi)? as usize;
        let rssi = read_u32_array(attrs, c.significant_change_rssi_list, num_rssi)?;
        Ok(Self {
            bssid: attrs.require(c.significant_change_bssid)?.as_array()?,
            channel: attrs.u32(c.significant_change_channel)?,
            rssi: rssi.into_iter().map(|v| v as i32).collect(),
        })
    }
}

/// Passpoint network matched by the firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasspointMatch {
    /// Id of the network in the configured list
    pub network_id: u32,
    pub result: ScanResult,
    pub anqp: Vec<u8>,
}

impl PasspointMatch {
    fn decode(c: &GscanResults, attrs: &Attrs) -> Result<Self, ParseError> {
        let results = attrs.nested(c.list)?;
        let Some(first) = results.iter().next() else {
            return Err(ParseError::MissingAttribute(c.list));
        };
        let anqp = match attrs.u32(c.passpoint_anqp_len)? as usize {
            0 => vec![],
            len => {
                let data = attrs.bytes(c.passpoint_anqp)?;
                if data.len() < len {
                    return Err(ParseError::TruncatedAttribute {
                        tag: c.passpoint_anqp,
                        expected: len,
                        actual: data.len(),
                    });
                }
                data[..len].to_vec()
            }
        };
        Ok(Self {
            network_id: attrs.u32(c.passpoint_match_id)?,
            result: ScanResult::decode(c, &first.children()?)?,
            anqp,
        })
    }
}

/// Scan limits of the firmware
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub max_scan_cache_size: u32,
    pub max_scan_buckets: u32,
    pub max_ap_cache_per_scan: u32,
    pub max_rssi_sample_size: u32,
    pub max_scan_reporting_threshold: i32,
    pub max_hotlist_bssids: u32,
    pub max_significant_wifi_change_aps: u32,
    pub max_bssid_history_entries: u32,
    /// Limits below are 0 when the firmware does not report them.
    pub max_hotlist_ssids: u32,
    pub max_number_epno_networks: u32,
    pub max_number_epno_networks_by_ssid: u32,
    pub max_number_of_white_listed_ssid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum WifiBand {
    Unspecified = 0,
    Bg = 1,
    A = 2,
    Abg = 3,
    ADfs = 4,
    AWithDfs = 6,
    AbgWithDfs = 7,
}

bitflags! {
    /// When the results of a bucket are reported
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReportEvents: u8 {
        const EACH_SCAN = 1;
        const FULL_RESULTS = 2;
        const NO_BATCH = 4;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub channel: u32,
    pub dwell_time_ms: u32,
    pub passive: bool,
}

/// Set of channels scanned together, with its own period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSpec {
    pub index: u8,
    /// Channels to scan, when `channels` is empty
    pub band: WifiBand,
    pub period_ms: u32,
    pub report_events: ReportEvents,
    /// Exponential backoff: the period grows up to `max_period_ms`
    pub max_period_ms: u32,
    pub base: u32,
    pub step_count: u32,
    pub channels: Vec<ChannelSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParams {
    pub base_period_ms: u32,
    pub max_ap_per_scan: u32,
    pub report_threshold_percent: u8,
    pub report_threshold_num_scans: u8,
    pub buckets: Vec<BucketSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApThreshold {
    pub bssid: [u8; 6],
    pub low: i32,
    pub high: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotlistParams {
    pub lost_ap_sample_size: u32,
    pub aps: Vec<ApThreshold>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignificantChangeParams {
    pub rssi_sample_size: u32,
    pub lost_ap_sample_size: u32,
    pub min_breaching: u32,
    pub aps: Vec<ApThreshold>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpnoNetwork {
    pub ssid: String,
    pub flags: u8,
    pub auth_bit_field: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpnoParams {
    pub min_5ghz_rssi: i32,
    pub min_24ghz_rssi: i32,
    pub initial_score_max: i32,
    pub current_connection_bonus: i32,
    pub same_network_bonus: i32,
    pub secure_bonus: i32,
    pub band_5ghz_bonus: i32,
    pub networks: Vec<EpnoNetwork>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasspointNetwork {
    pub id: u32,
    pub realm: String,
    pub roaming_consortium_ids: [i64; 16],
    pub plmn: [u8; 3],
}

/// Receiver of gscan events, one method per event class. Every method
/// runs on the poll thread.
pub trait GscanEvents: Send + Sync {
    fn on_scan_event(&self, _request_id: u32, _event: ScanEvent) {}
    fn on_full_scan_result(&self, _request_id: u32, _result: &ScanResult, _buckets_scanned: u32) {}
    fn on_hotlist_ap_found(&self, _request_id: u32, _results: &[ScanResult]) {}
    fn on_hotlist_ap_lost(&self, _request_id: u32, _results: &[ScanResult]) {}
    fn on_significant_change(&self, _request_id: u32, _results: &[SignificantChange]) {}
    fn on_pno_network_found(&self, _request_id: u32, _results: &[ScanResult]) {}
    fn on_passpoint_network_found(&self, _request_id: u32, _found: &PasspointMatch) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Session {
    Scan,
    Hotlist,
    SignificantChange,
    Epno,
    Passpoint,
}

impl Session {
    fn name(self) -> &'static str {
        match self {
            Session::Scan => "gscan",
            Session::Hotlist => "hotlist",
            Session::SignificantChange => "significant change",
            Session::Epno => "ePNO",
            Session::Passpoint => "passpoint",
        }
    }
}

pub struct Gscan {
    transport: Arc<Transport>,
    dispatcher: Arc<Dispatcher>,
    contract: Arc<WireContract>,
    sessions: Mutex<HashMap<Session, Subscription>>,
}

impl Gscan {
    pub fn new(transport: Arc<Transport>, dispatcher: Arc<Dispatcher>, contract: Arc<WireContract>) -> Self {
        Self { transport, dispatcher, contract, sessions: Mutex::new(HashMap::new()) }
    }

    fn key(&self, subcmd: u32) -> EventKey {
        EventKey::new(self.contract.oui, subcmd)
    }

    fn command(&self, iface: &Interface, subcmd: u32, request_id: u32) -> Result<Command> {
        let mut cmd = Command::with_request_id(
            self.transport.clone(),
            self.key(subcmd),
            self.contract.gscan_config.request_id,
            request_id,
        );
        cmd.set_iface(iface.index)?;
        Ok(cmd)
    }

    /// Handler of "count, more data, list" events
    fn list_handler<R: Send + 'static>(
        &self,
        subcmd: u32,
        request_id: u32,
        policy: RequestIdPolicy,
        record: fn(&GscanResults, &Attrs) -> Result<R, ParseError>,
        deliver: impl Fn(u32, Vec<R>) + Send + Sync + 'static,
    ) -> Arc<Handler<R>> {
        let c = self.contract.gscan_results.clone();
        let layout = ListLayout { count: c.num_results, more_data: Some(c.more_data), list: c.list };
        let handler = Handler::fragmented(self.key(subcmd), request_id, move |attrs| {
            // Required, a fragment without it cannot be placed.
            attrs.u8(c.more_data)?;
            layout.decode(attrs, |entry| record(&c, entry))
        });
        Arc::new(
            handler
                .with_request_id_tag(self.contract.gscan_results.request_id)
                .with_policy(policy)
                .with_callback(move |completed| deliver(completed.request_id, completed.into_records())),
        )
    }

    /// Cancel the running session of `kind`, and return an empty one for
    /// `request_id`.
    fn supersede(&self, kind: Session, request_id: u32) -> Subscription {
        if let Some(previous) = self.sessions.lock().unwrap().remove(&kind) {
            info!("{} session {} superseded", kind.name(), previous.request_id());
            previous.cancel();
        }
        Subscription::new(self.dispatcher.clone(), request_id)
    }

    /// Send `cmd`, and install `subscription` as the session of `kind` once
    /// the driver accepts it.
    fn start_session(&self, kind: Session, subscription: Subscription, mut cmd: Command) -> Result<()> {
        cmd.request_response()?;
        self.sessions.lock().unwrap().insert(kind, subscription);
        Ok(())
    }

    /// Disable the handlers of session `kind`, send `subcmd` to stop it,
    /// and unregister the handlers.
    fn stop_session(&self, iface: &Interface, kind: Session, subcmd: u32) -> Result<()> {
        let Some(subscription) = self.sessions.lock().unwrap().remove(&kind) else {
            return Err(Error::NotStarted(kind.name()));
        };
        subscription.disable();
        let mut cmd = self.command(iface, subcmd, subscription.request_id())?;
        let result = cmd.request_response();
        subscription.cancel();
        Ok(result?)
    }

    fn is_active(&self, kind: Session) -> bool {
        self.sessions.lock().unwrap().contains_key(&kind)
    }

    pub fn is_scanning(&self) -> bool {
        self.is_active(Session::Scan)
    }

    /// Start background scans of `params`
    pub fn start(
        &self,
        iface: &Interface,
        request_id: u32,
        params: &ScanParams,
        events: Arc<dyn GscanEvents>,
    ) -> Result<()> {
        if params.buckets.is_empty() || params.buckets.len() > MAX_BUCKETS {
            return Err(Error::InvalidArgument("number of buckets"));
        }
        if params.buckets.iter().any(|bucket| bucket.channels.len() > MAX_CHANNELS) {
            return Err(Error::InvalidArgument("number of channels in a bucket"));
        }
        let s = &self.contract.gscan_subcmd;
        let c = self.contract.gscan_results.clone();
        let mut subscription = self.supersede(Session::Scan, request_id);

        let tx = events.clone();
        let results_available = Handler::single_shot(self.key(s.results_available), request_id, |_| Ok(()))
            .with_request_id_tag(c.request_id)
            .with_callback(move |completed| tx.on_scan_event(completed.request_id, ScanEvent::ThresholdNumScans));
        subscription.add(self.key(s.results_available), Arc::new(results_available))?;

        let tx = events.clone();
        let decode = c.clone();
        let full_scan_result = Handler::single_shot(self.key(s.full_scan_result), request_id, move |attrs| {
            let buckets = attrs.optional(decode.buckets_scanned, Attribute::as_u32)?.unwrap_or(0);
            Ok((ScanResult::decode(&decode, attrs)?, buckets))
        })
        .with_request_id_tag(c.request_id)
        .with_policy(RequestIdPolicy::AdoptOwn)
        .with_callback(move |completed| {
            for (result, buckets) in completed.records() {
                tx.on_full_scan_result(completed.request_id, result, *buckets);
            }
        });
        subscription.add(self.key(s.full_scan_result), Arc::new(full_scan_result))?;

        let tx = events;
        let event_type = c.scan_event_type;
        let scan_event =
            Handler::single_shot(self.key(s.scan_event), request_id, move |attrs| attrs.u8(event_type))
                .with_request_id_tag(c.request_id)
                .with_callback(move |completed| {
                    for &event in completed.records() {
                        match ScanEvent::from_u8(event) {
                            Some(event) => tx.on_scan_event(completed.request_id, event),
                            None => warn!("unknown scan event {}", event),
                        }
                    }
                });
        subscription.add(self.key(s.scan_event), Arc::new(scan_event))?;

        let cmd = self.start_command(iface, request_id, params)?;
        self.start_session(Session::Scan, subscription, cmd)?;
        info!("gscan {} started with {} buckets", request_id, params.buckets.len());
        Ok(())
    }

    fn start_command(&self, iface: &Interface, request_id: u32, params: &ScanParams) -> Result<Command> {
        let g = &self.contract.gscan_config;
        let mut cmd = self.command(iface, self.contract.gscan_subcmd.start, request_id)?;
        cmd.put(Attribute::u32(g.base_period, params.base_period_ms))?;
        cmd.put(Attribute::u32(g.max_ap_per_scan, params.max_ap_per_scan))?;
        cmd.put(Attribute::u8(g.report_threshold_percent, params.report_threshold_percent))?;
        cmd.put(Attribute::u8(g.report_threshold_num_scans, params.report_threshold_num_scans))?;
        cmd.put(Attribute::u8(g.num_buckets, params.buckets.len() as u8))?;
        cmd.put(Attribute::array(
            g.bucket_spec,
            params.buckets.iter().map(|bucket| {
                vec![
                    Attribute::u8(g.bucket_index, bucket.index),
                    Attribute::u8(g.bucket_band, bucket.band as u8),
                    Attribute::u32(g.bucket_period, bucket.period_ms),
                    Attribute::u8(g.bucket_report_events, bucket.report_events.bits()),
                    Attribute::u32(g.bucket_num_channel_specs, bucket.channels.len() as u32),
                    Attribute::u32(g.bucket_max_period, bucket.max_period_ms),
                    Attribute::u32(g.bucket_base, bucket.base),
                    Attribute::u32(g.bucket_step_count, bucket.step_count),
                    Attribute::array(
                        g.channel_spec,
                        bucket.channels.iter().map(|spec| {
                            vec![
                                Attribute::u32(g.channel, spec.channel),
                                Attribute::u32(g.dwell_time, spec.dwell_time_ms),
                                Attribute::u8(g.passive, spec.passive.into()),
                            ]
                        }),
                    ),
                ]
            }),
        ))?;
        Ok(cmd)
    }

    pub fn stop(&self, iface: &Interface) -> Result<()> {
        self.stop_session(iface, Session::Scan, self.contract.gscan_subcmd.stop)
    }

    fn ap_thresholds(&self, aps: &[ApThreshold]) -> Attribute {
        let g = &self.contract.gscan_config;
        Attribute::array(
            g.ap_threshold_param,
            aps.iter().map(|ap| {
                vec![
                    Attribute::bytes(g.ap_bssid, &ap.bssid),
                    Attribute::i32(g.ap_rssi_low, ap.low),
                    Attribute::i32(g.ap_rssi_high, ap.high),
                ]
            }),
        )
    }

    /// Report access points of the hotlist when found and lost
    pub fn set_bssid_hotlist(
        &self,
        iface: &Interface,
        request_id: u32,
        params: &HotlistParams,
        events: Arc<dyn GscanEvents>,
    ) -> Result<()> {
        if params.aps.len() > MAX_HOTLIST_APS {
            return Err(Error::InvalidArgument("number of hotlist access points"));
        }
        let s = &self.contract.gscan_subcmd;
        let mut subscription = self.supersede(Session::Hotlist, request_id);
        let tx = events.clone();
        let found = self.list_handler(
            s.hotlist_ap_found,
            request_id,
            RequestIdPolicy::Strict,
            ScanResult::decode,
            move |id, results| tx.on_hotlist_ap_found(id, &results),
        );
        subscription.add(self.key(s.hotlist_ap_found), found)?;
        let lost = self.list_handler(
            s.hotlist_ap_lost,
            request_id,
            RequestIdPolicy::Strict,
            ScanResult::decode,
            move |id, results| events.on_hotlist_ap_lost(id, &results),
        );
        subscription.add(self.key(s.hotlist_ap_lost), lost)?;

        let g = &self.contract.gscan_config;
        let mut cmd = self.command(iface, s.set_bssid_hotlist, request_id)?;
        cmd.put(Attribute::u32(g.hotlist_lost_ap_sample_size, params.lost_ap_sample_size))?;
        cmd.put(Attribute::u32(g.hotlist_num_ap, params.aps.len() as u32))?;
        cmd.put(self.ap_thresholds(&params.aps))?;
        self.start_session(Session::Hotlist, subscription, cmd)
    }

    pub fn reset_bssid_hotlist(&self, iface: &Interface) -> Result<()> {
        self.stop_session(iface, Session::Hotlist, self.contract.gscan_subcmd.reset_bssid_hotlist)
    }

    /// Report access points whose signal changes significantly
    pub fn set_significant_change(
        &self,
        iface: &Interface,
        request_id: u32,
        params: &SignificantChangeParams,
        events: Arc<dyn GscanEvents>,
    ) -> Result<()> {
        if params.aps.len() > MAX_SIGNIFICANT_CHANGE_APS {
            return Err(Error::InvalidArgument("number of significant change access points"));
        }
        let s = &self.contract.gscan_subcmd;
        let mut subscription = self.supersede(Session::SignificantChange, request_id);
        subscription.add(
            self.key(s.significant_change),
            self.list_handler(
                s.significant_change,
                request_id,
                RequestIdPolicy::Strict,
                SignificantChange::decode,
                move |id, results| events.on_significant_change(id, &results),
            ),
        )?;

        let g = &self.contract.gscan_config;
        let mut cmd = self.command(iface, s.set_significant_change, request_id)?;
        cmd.put(Attribute::u32(g.significant_rssi_sample_size, params.rssi_sample_size))?;
        cmd.put(Attribute::u32(g.significant_lost_ap_sample_size, params.lost_ap_sample_size))?;
        cmd.put(Attribute::u32(g.significant_min_breaching, params.min_breaching))?;
        cmd.put(Attribute::u32(g.significant_num_ap, params.aps.len() as u32))?;
        cmd.put(self.ap_thresholds(&params.aps))?;
        self.start_session(Session::SignificantChange, subscription, cmd)
    }

    pub fn reset_significant_change(&self, iface: &Interface) -> Result<()> {
        self.stop_session(
            iface,
            Session::SignificantChange,
            self.contract.gscan_subcmd.reset_significant_change,
        )
    }

    /// Look for the networks of `params` while disconnected
    pub fn set_epno_list(
        &self,
        iface: &Interface,
        request_id: u32,
        params: &EpnoParams,
        events: Arc<dyn GscanEvents>,
    ) -> Result<()> {
        if params.networks.len() > MAX_EPNO_NETWORKS {
            return Err(Error::InvalidArgument("number of ePNO networks"));
        }
        let s = &self.contract.gscan_subcmd;
        let mut subscription = self.supersede(Session::Epno, request_id);
        subscription.add(
            self.key(s.pno_network_found),
            self.list_handler(
                s.pno_network_found,
                request_id,
                RequestIdPolicy::AdoptOwn,
                ScanResult::decode,
                move |id, results| events.on_pno_network_found(id, &results),
            ),
        )?;

        let p = &self.contract.pno;
        let mut cmd = self.command(iface, s.pno_set_list, request_id)?;
        cmd.put(Attribute::i32(p.min_5ghz_rssi, params.min_5ghz_rssi))?;
        cmd.put(Attribute::i32(p.min_24ghz_rssi, params.min_24ghz_rssi))?;
        cmd.put(Attribute::i32(p.initial_score_max, params.initial_score_max))?;
        cmd.put(Attribute::i32(p.current_connection_bonus, params.current_connection_bonus))?;
        cmd.put(Attribute::i32(p.same_network_bonus, params.same_network_bonus))?;
        cmd.put(Attribute::i32(p.secure_bonus, params.secure_bonus))?;
        cmd.put(Attribute::i32(p.band_5ghz_bonus, params.band_5ghz_bonus))?;
        cmd.put(Attribute::u32(p.num_networks, params.networks.len() as u32))?;
        cmd.put(Attribute::array(
            p.networks_list,
            params.networks.iter().map(|network| {
                vec![
                    Attribute::string(p.network_ssid, &network.ssid),
                    Attribute::u8(p.network_flags, network.flags),
                    Attribute::u8(p.network_auth_bit, network.auth_bit_field),
                ]
            }),
        ))?;
        self.start_session(Session::Epno, subscription, cmd)
    }

    /// Clear the ePNO list, sent as a list without networks
    pub fn reset_epno_list(&self, iface: &Interface) -> Result<()> {
        let Some(subscription) = self.sessions.lock().unwrap().remove(&Session::Epno) else {
            return Err(Error::NotStarted(Session::Epno.name()));
        };
        subscription.disable();
        let mut cmd = self.command(iface, self.contract.gscan_subcmd.pno_set_list, subscription.request_id())?;
        cmd.put(Attribute::u32(self.contract.pno.num_networks, 0))?;
        let result = cmd.request_response();
        subscription.cancel();
        Ok(result?)
    }

    /// Match the passpoint networks of `networks`
    pub fn set_passpoint_list(
        &self,
        iface: &Interface,
        request_id: u32,
        networks: &[PasspointNetwork],
        events: Arc<dyn GscanEvents>,
    ) -> Result<()> {
        if networks.len() > MAX_PASSPOINT_NETWORKS {
            return Err(Error::InvalidArgument("number of passpoint networks"));
        }
        let s = &self.contract.gscan_subcmd;
        let c = self.contract.gscan_results.clone();
        let layout = ListLayout { count: c.passpoint_num_matches, more_data: None, list: c.passpoint_match_list };
        let decode = c.clone();
        let found = Handler::single_shot(self.key(s.pno_passpoint_network_found), request_id, move |attrs| {
            layout.records(attrs, |entry| PasspointMatch::decode(&decode, entry))
        })
        .with_request_id_tag(c.request_id)
        .with_policy(RequestIdPolicy::AdoptOwn)
        .with_callback(move |completed| {
            for found in completed.records().flatten() {
                events.on_passpoint_network_found(completed.request_id, found);
            }
        });
        let mut subscription = self.supersede(Session::Passpoint, request_id);
        subscription.add(self.key(s.pno_passpoint_network_found), Arc::new(found))?;

        let p = &self.contract.pno;
        let mut cmd = self.command(iface, s.pno_set_passpoint_list, request_id)?;
        cmd.put(Attribute::u32(p.passpoint_num, networks.len() as u32))?;
        cmd.put(Attribute::array(
            p.passpoint_network_array,
            networks.iter().map(|network| {
                let ids: Vec<u8> =
                    network.roaming_consortium_ids.iter().flat_map(|id| id.to_ne_bytes()).collect();
                vec![
                    Attribute::u32(p.passpoint_id, network.id),
                    Attribute::string(p.passpoint_realm, &network.realm),
                    Attribute::bytes(p.passpoint_roam_consortium_ids, &ids),
                    Attribute::bytes(p.passpoint_roam_plmn, &network.plmn),
                ]
            }),
        ))?;
        self.start_session(Session::Passpoint, subscription, cmd)
    }

    pub fn reset_passpoint_list(&self, iface: &Interface) -> Result<()> {
        self.stop_session(iface, Session::Passpoint, self.contract.gscan_subcmd.pno_reset_passpoint_list)
    }

    /// Fetch up to `max` scans from the firmware cache, emptying it when
    /// `flush` is set.
    ///
    /// Results arrive as replies split by the driver. When the driver stops
    /// answering midway, or a reply is malformed, the scans received so far
    /// are returned, the last one flagged [`ScanFlags::INTERRUPTED`]. A
    /// malformed reply is also reported to the error sink.
    pub fn get_cached_results(&self, iface: &Interface, flush: bool, max: usize) -> Result<Vec<CachedScanResults>> {
        let request_id = generate_request_id();
        let g = &self.contract.gscan_config;
        let mut cmd = self.command(iface, self.contract.gscan_subcmd.cached_results, request_id)?;
        cmd.put(Attribute::u8(g.cached_flush, flush.into()))?;
        cmd.put(Attribute::u32(g.cached_max, max.try_into().unwrap_or(u32::MAX)))?;
        let sent = cmd.request_response();

        let c = &self.contract.gscan_results;
        let mut acc = FragmentAccumulator::with_group_limit(max);
        let mut malformed = None;
        for reply in cmd.replies() {
            let fragment = match cached_fragment(c, request_id, reply) {
                Ok(Some(fragment)) => fragment,
                Ok(None) => continue,
                Err(err) => {
                    // Replies past a malformed one cannot be placed.
                    warn!("malformed cached results reply: {}", err);
                    let err = wifi_hal_vendor::Error::Parse(err);
                    self.dispatcher.report(Some(cmd.key()), &err);
                    malformed = Some(err);
                    break;
                }
            };
            if let Some(done) = acc.push(request_id, fragment) {
                return Ok(CachedScanResults::assemble(done));
            }
        }

        let cause = match (malformed, sent) {
            (Some(err), _) => err,
            (None, Err(err)) if err.is_timeout() => err,
            (None, Err(err)) => return Err(err.into()),
            (None, Ok(())) => {
                debug!("cached results acknowledged without final fragment");
                return Ok(acc.take_partial(request_id).map(CachedScanResults::assemble).unwrap_or_default());
            }
        };
        let Some(partial) = acc.take_partial(request_id).filter(|partial| partial.record_count() > 0) else {
            return Err(cause.into());
        };
        let mut scans = CachedScanResults::assemble(partial);
        if let Some(last) = scans.last_mut() {
            last.flags |= ScanFlags::INTERRUPTED;
        }
        warn!("cached results interrupted ({}), returning {} scans", cause, scans.len());
        Ok(scans)
    }

    pub fn capabilities(&self, iface: &Interface) -> Result<Capabilities> {
        let mut cmd = self.command(iface, self.contract.gscan_subcmd.capabilities, generate_request_id())?;
        cmd.request_response()?;
        let reply = cmd.reply()?;
        let c = &self.contract.gscan_results;
        Ok(Capabilities {
            max_scan_cache_size: reply.u32(c.max_scan_cache_size)?,
            max_scan_buckets: reply.u32(c.max_scan_buckets)?,
            max_ap_cache_per_scan: reply.u32(c.max_ap_cache_per_scan)?,
            max_rssi_sample_size: reply.u32(c.max_rssi_sample_size)?,
            max_scan_reporting_threshold: reply.i32(c.max_scan_reporting_threshold)?,
            max_hotlist_bssids: reply.u32(c.max_hotlist_bssids)?,
            max_significant_wifi_change_aps: reply.u32(c.max_significant_wifi_change_aps)?,
            max_bssid_history_entries: reply.u32(c.max_bssid_history_entries)?,
            max_hotlist_ssids: optional_limit(reply, c.max_hotlist_ssids)?,
            max_number_epno_networks: optional_limit(reply, c.max_epno_networks)?,
            max_number_epno_networks_by_ssid: optional_limit(reply, c.max_epno_networks_by_ssid)?,
            max_number_of_white_listed_ssid: optional_limit(reply, c.max_whitelisted_ssids)?,
        })
    }

    /// Set the OUI of the random MAC address used while scanning
    pub fn set_scanning_mac_oui(&self, iface: &Interface, oui: [u8; 3]) -> Result<()> {
        let mut cmd = Command::create(self.transport.clone(), self.key(self.contract.gscan_subcmd.scanning_mac_oui));
        cmd.set_iface(iface.index)?;
        cmd.put(Attribute::bytes(self.contract.gscan_config.scanning_mac_oui, &oui))?;
        Ok(cmd.request_response()?)
    }

    /// Keep the firmware from roaming to any of `bssids`
    pub fn set_bssid_blacklist(&self, iface: &Interface, request_id: u32, bssids: &[[u8; 6]]) -> Result<()> {
        if bssids.len() > MAX_BLACKLIST_BSSIDS {
            return Err(Error::InvalidArgument("number of blacklisted BSSIDs"));
        }
        let r = &self.contract.roam;
        let mut cmd = Command::create(self.transport.clone(), self.key(r.subcmd));
        cmd.set_iface(iface.index)?;
        cmd.put(Attribute::u32(r.attr_subcmd, r.set_blacklist_bssid))?;
        cmd.put(Attribute::u32(r.request_id, request_id))?;
        cmd.put(Attribute::u32(r.bssid_params_num, bssids.len() as u32))?;
        cmd.put(Attribute::array(
            r.bssid_params,
            bssids.iter().map(|bssid| vec![Attribute::bytes(r.bssid_params_bssid, bssid)]),
        ))?;
        debug!("blacklisting {} BSSIDs for request {}", bssids.len(), request_id);
        Ok(cmd.request_response()?)
    }

    /// Channels of `band`, at most `max`
    pub fn valid_channels(&self, iface: &Interface, band: WifiBand, max: usize) -> Result<Vec<u32>> {
        let g = &self.contract.gscan_config;
        let mut cmd = self.command(iface, self.contract.gscan_subcmd.valid_channels, generate_request_id())?;
        cmd.put(Attribute::u32(g.band, band as u32))?;
        cmd.put(Attribute::u32(g.max_channels, max.try_into().unwrap_or(u32::MAX)))?;
        cmd.request_response()?;
        let reply = cmd.reply()?;
        let c = &self.contract.gscan_results;
        let count = (reply.u32(c.num_channels)? as usize).min(max);
        if count == 0 {
            return Ok(vec![]);
        }
        Ok(read_u32_array(reply, c.channels, count)?)
    }
}

fn optional_limit(reply: &Attrs, tag: u16) -> Result<u32, ParseError> {
    let limit = reply.optional(tag, Attribute::as_u32)?;
    if limit.is_none() {
        debug!("capability {} not reported", tag);
    }
    Ok(limit.unwrap_or(0))
}

/// Cached scans of one reply, `None` when the reply belongs to another request
fn cached_fragment(
    c: &GscanResults,
    request_id: u32,
    reply: &Attrs,
) -> Result<Option<Fragment<CachedChunk>>, ParseError> {
    let id = reply.u32(c.request_id)?;
    if id != request_id {
        warn!("cached results reply for request {}, expected {}", id, request_id);
        return Ok(None);
    }
    let mut fragment = Fragment::empty(reply.u8(c.more_data)? != 0);
    let count = reply.u32(c.num_results)? as usize;
    if count == 0 {
        return Ok(Some(fragment));
    }

    let results = ListLayout { count: c.num_results, more_data: None, list: c.list };
    let entries = reply.nested(c.cached_list)?;
    if entries.len() < count {
        return Err(ParseError::CountMismatch { tag: c.cached_list, expected: count, actual: entries.len() });
    }
    for entry in entries.iter().take(count) {
        let entry = entry.children()?;
        let chunk = CachedChunk {
            flags: ScanFlags::from_bits_retain(entry.u32(c.cached_flags)?),
            buckets_scanned: entry.optional(c.buckets_scanned, Attribute::as_u32)?.unwrap_or(0),
            results: results.records(&entry, |result| ScanResult::decode(c, result))?,
        };
        fragment.push_group(entry.u32(c.cached_scan_id)?, vec![chunk]);
    }
    Ok(Some(fragment))
}
