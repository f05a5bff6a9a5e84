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

//! Link layer statistics.

use crate::contract::{LlStats as Codes, WireContract};
use crate::error::Result;
use crate::{read_u32_array, Interface};
use log::{debug, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::sync::Arc;
use wifi_hal_nlattr::{Attribute, Attrs, ParseError};
use wifi_hal_vendor::{generate_request_id, EventKey, SingletonCommand, Transport};

/// Statistics requested by [`LinkLayerStats::get`]: radio, interface and peers
const GET_ALL: u32 = 0x7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
enum StatsType {
    Radio = 1,
    Iface = 2,
    Peers = 3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsParams {
    /// MPDUs larger than this are counted separately
    pub mpdu_size_threshold: u32,
    pub aggressive_statistics_gathering: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub width: u32,
    pub center_freq: u32,
    pub center_freq0: u32,
    pub center_freq1: u32,
    pub on_time: u32,
    pub cca_busy_time: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RadioStats {
    pub radio: u32,
    pub on_time: u32,
    pub tx_time: u32,
    pub rx_time: u32,
    pub on_time_scan: u32,
    pub on_time_nbd: u32,
    pub on_time_gscan: u32,
    pub on_time_roam_scan: u32,
    pub on_time_pno_scan: u32,
    pub on_time_hs20: u32,
    pub tx_time_per_level: Vec<u32>,
    pub channels: Vec<ChannelStats>,
}

/// Counters of one access category
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WmmStats {
    pub ac: u32,
    pub tx_mpdu: u32,
    pub rx_mpdu: u32,
    pub mpdu_lost: u32,
    pub retries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfaceStats {
    pub beacon_rx: u32,
    pub mgmt_rx: u32,
    pub mgmt_action_rx: u32,
    pub mgmt_action_tx: u32,
    pub rssi_mgmt: i32,
    pub rssi_data: i32,
    pub rssi_ack: i32,
    /// Not reported by every firmware
    pub leaky_ap_guard_time: Option<u32>,
    pub wmm: Vec<WmmStats>,
    pub num_peers: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub peer_type: u32,
    pub mac: [u8; 6],
    pub capabilities: u32,
}

/// Statistics of one `get`, gathered from every reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub radios: Vec<RadioStats>,
    pub iface: Option<IfaceStats>,
    pub peers: Vec<PeerStats>,
}

/// Answer of the driver to a clear request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearResponse {
    /// Statistics actually cleared
    pub mask: u32,
    pub stopped: bool,
}

fn entries<R>(
    attrs: &Attrs,
    tag: u16,
    count: usize,
    decode: impl Fn(&Attrs) -> Result<R, ParseError>,
) -> Result<Vec<R>, ParseError> {
    if count == 0 {
        return Ok(vec![]);
    }
    let list = attrs.nested(tag)?;
    if list.len() < count {
        return Err(ParseError::CountMismatch { tag, expected: count, actual: list.len() });
    }
    list.iter().take(count).map(|entry| decode(&entry.children()?)).collect()
}

impl RadioStats {
    fn decode(l: &Codes, attrs: &Attrs) -> Result<Self, ParseError> {
        let num_channels = attrs.u32(l.radio_num_channels)? as usize;
        let num_tx_levels = attrs.optional(l.radio_num_tx_levels, Attribute::as_u32)?.unwrap_or(0) as usize;
        let tx_time_per_level = match num_tx_levels {
            0 => vec![],
            n => read_u32_array(attrs, l.radio_tx_time_per_level, n)?,
        };
        Ok(Self {
            radio: attrs.u32(l.radio_id)?,
            on_time: attrs.u32(l.radio_on_time)?,
            tx_time: attrs.u32(l.radio_tx_time)?,
            rx_time: attrs.u32(l.radio_rx_time)?,
            on_time_scan: attrs.u32(l.radio_on_time_scan)?,
            on_time_nbd: attrs.u32(l.radio_on_time_nbd)?,
            on_time_gscan: attrs.u32(l.radio_on_time_gscan)?,
            on_time_roam_scan: attrs.u32(l.radio_on_time_roam_scan)?,
            on_time_pno_scan: attrs.u32(l.radio_on_time_pno_scan)?,
            on_time_hs20: attrs.u32(l.radio_on_time_hs20)?,
            tx_time_per_level,
            channels: entries(attrs, l.channel_info, num_channels, |channel| {
                Ok(ChannelStats {
                    width: channel.u32(l.channel_width)?,
                    center_freq: channel.u32(l.channel_center_freq)?,
                    center_freq0: channel.u32(l.channel_center_freq0)?,
                    center_freq1: channel.u32(l.channel_center_freq1)?,
                    on_time: channel.u32(l.channel_on_time)?,
                    cca_busy_time: channel.u32(l.channel_cca_busy_time)?,
                })
            })?,
        })
    }
}

impl IfaceStats {
    fn decode(l: &Codes, attrs: &Attrs) -> Result<Self, ParseError> {
        let wmm = match attrs.optional(l.wmm_info, Attribute::children)? {
            None => vec![],
            Some(list) => list
                .iter()
                .map(|entry| {
                    let ac = entry.children()?;
                    Ok(WmmStats {
                        ac: ac.u32(l.wmm_ac)?,
                        tx_mpdu: ac.u32(l.wmm_tx_mpdu)?,
                        rx_mpdu: ac.u32(l.wmm_rx_mpdu)?,
                        mpdu_lost: ac.u32(l.wmm_mpdu_lost)?,
                        retries: ac.u32(l.wmm_retries)?,
                    })
                })
                .collect::<Result<_, ParseError>>()?,
        };
        Ok(Self {
            beacon_rx: attrs.u32(l.iface_beacon_rx)?,
            mgmt_rx: attrs.u32(l.iface_mgmt_rx)?,
            mgmt_action_rx: attrs.u32(l.iface_mgmt_action_rx)?,
            mgmt_action_tx: attrs.u32(l.iface_mgmt_action_tx)?,
            rssi_mgmt: attrs.i32(l.iface_rssi_mgmt)?,
            rssi_data: attrs.i32(l.iface_rssi_data)?,
            rssi_ack: attrs.i32(l.iface_rssi_ack)?,
            leaky_ap_guard_time: attrs.optional(l.iface_leaky_ap_guard_time, Attribute::as_u32)?,
            wmm,
            // Absent when no peer is connected
            num_peers: attrs.optional(l.iface_num_peers, Attribute::as_u32)?.unwrap_or(0),
        })
    }
}

fn decode_peers(l: &Codes, attrs: &Attrs) -> Result<Vec<PeerStats>, ParseError> {
    let num_peers = attrs.u32(l.iface_num_peers)? as usize;
    entries(attrs, l.peer_info, num_peers, |peer| {
        Ok(PeerStats {
            peer_type: peer.u32(l.peer_type)?,
            mac: peer.require(l.peer_mac_address)?.as_array()?,
            capabilities: peer.u32(l.peer_capabilities)?,
        })
    })
}

impl LinkStats {
    /// Gather the replies of a get request
    pub fn from_replies(l: &Codes, replies: &[Attrs]) -> Result<Self, ParseError> {
        let mut stats = LinkStats::default();
        for reply in replies {
            let kind = reply.u32(l.stats_type)?;
            match StatsType::from_u32(kind) {
                Some(StatsType::Radio) => stats.radios.push(RadioStats::decode(l, reply)?),
                Some(StatsType::Iface) => stats.iface = Some(IfaceStats::decode(l, reply)?),
                Some(StatsType::Peers) => stats.peers.extend(decode_peers(l, reply)?),
                None => warn!("ignoring link stats reply of type {}", kind),
            }
        }
        Ok(stats)
    }
}

/// Link layer statistics requests, one in flight at a time.
pub struct LinkLayerStats {
    command: SingletonCommand,
    contract: Arc<WireContract>,
}

impl LinkLayerStats {
    pub fn new(transport: Arc<Transport>, contract: Arc<WireContract>) -> Self {
        Self { command: SingletonCommand::new(transport, contract.oui), contract }
    }

    /// Start gathering statistics
    pub fn set(&self, iface: &Interface, params: &StatsParams) -> Result<()> {
        let l = &self.contract.llstats;
        self.command.request_response(l.subcmd_set, |cmd| {
            cmd.set_iface(iface.index)?;
            cmd.put(Attribute::u32(l.set_mpdu_size_threshold, params.mpdu_size_threshold))?;
            cmd.put(Attribute::u32(l.set_aggressive, params.aggressive_statistics_gathering))
        })?;
        Ok(())
    }

    pub fn get(&self, iface: &Interface) -> Result<LinkStats> {
        let l = &self.contract.llstats;
        let request_id = generate_request_id();
        let replies = self.command.request_response(l.subcmd_get, |cmd| {
            cmd.set_iface(iface.index)?;
            cmd.put(Attribute::u32(l.get_request_id, request_id))?;
            cmd.put(Attribute::u32(l.get_request_mask, GET_ALL))
        })?;
        debug!("link stats {}: {} replies", request_id, replies.len());
        Ok(LinkStats::from_replies(l, &replies)?)
    }

    /// Clear the statistics of `mask`, and stop gathering them when `stop`
    /// is set. The driver must answer with what it cleared.
    pub fn clear(&self, iface: &Interface, mask: u32, stop: bool) -> Result<ClearResponse> {
        let l = &self.contract.llstats;
        let replies = self.command.request_response(l.subcmd_clear, |cmd| {
            cmd.set_iface(iface.index)?;
            cmd.put(Attribute::u32(l.clear_request_mask, mask))?;
            cmd.put(Attribute::u8(l.clear_stop_request, stop.into()))
        })?;
        let Some(reply) = replies.first() else {
            let key = EventKey::new(self.contract.oui, l.subcmd_clear);
            return Err(wifi_hal_vendor::Error::NoResponse(key).into());
        };
        Ok(ClearResponse {
            mask: reply.u32(l.clear_response_mask)?,
            stopped: reply.u8(l.clear_stop_response)? != 0,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.command.is_busy()
    }
}
