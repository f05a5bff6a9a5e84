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

//! Wire contract with the driver: generic netlink family, vendor OUI, and
//! the subcommand and attribute ids of every feature.
//!
//! Defaults match the Qualcomm driver. Any value can be overridden from an
//! INI file, one section per table below, keys named after the fields:
//!
//! ```ini
//! [nl80211]
//! family_name = nl80211
//! groups = vendor
//!
//! [vendor]
//! oui = 0x001374
//!
//! [gscan.subcmd]
//! start = 20
//! ```

use configparser::ini::Ini;
use std::path::Path;
use thiserror::Error;
use wifi_hal_vendor::Family;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read wire contract: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid wire contract: {0}")]
    Parse(String),
    #[error("[{section}] {key} = {value} is out of range")]
    OutOfRange { section: String, key: String, value: u64 },
}

fn parse_int(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

fn read<T: TryFrom<u64>>(ini: &Ini, section: &str, key: &str) -> Result<Option<T>, ConfigError> {
    let Some(raw) = ini.get(section, key) else {
        return Ok(None);
    };
    let value = parse_int(&raw)
        .ok_or_else(|| ConfigError::Parse(format!("[{}] {} = {} is not an integer", section, key, raw)))?;
    T::try_from(value)
        .map(Some)
        .map_err(|_| ConfigError::OutOfRange { section: section.into(), key: key.into(), value })
}

macro_rules! codes {
    ($(#[$meta:meta])* $name:ident [$section:literal] {
        $( $(#[$fmeta:meta])* $field:ident: $t:ty = $default:expr, )*
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $t, )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self { $( $field: $default, )* }
            }
        }

        impl $name {
            fn load(ini: &Ini) -> Result<Self, ConfigError> {
                let mut codes = Self::default();
                $(
                    if let Some(value) = read(ini, $section, stringify!($field))? {
                        codes.$field = value;
                    }
                )*
                Ok(codes)
            }
        }
    };
}

codes! {
    /// nl80211 command and attribute codes framing vendor messages
    Nl80211 ["nl80211"] {
        vendor_cmd: u8 = 103,
        attr_ifindex: u16 = 3,
        attr_vendor_id: u16 = 195,
        attr_vendor_subcmd: u16 = 196,
        attr_vendor_data: u16 = 197,
    }
}

codes! {
    GscanSubcmds ["gscan.subcmd"] {
        start: u32 = 20,
        stop: u32 = 21,
        valid_channels: u32 = 22,
        capabilities: u32 = 23,
        cached_results: u32 = 24,
        results_available: u32 = 25,
        full_scan_result: u32 = 26,
        scan_event: u32 = 27,
        hotlist_ap_found: u32 = 28,
        set_bssid_hotlist: u32 = 29,
        reset_bssid_hotlist: u32 = 30,
        significant_change: u32 = 31,
        set_significant_change: u32 = 32,
        reset_significant_change: u32 = 33,
        scanning_mac_oui: u32 = 39,
        hotlist_ap_lost: u32 = 41,
        pno_set_list: u32 = 69,
        pno_set_passpoint_list: u32 = 70,
        pno_reset_passpoint_list: u32 = 71,
        pno_network_found: u32 = 72,
        pno_passpoint_network_found: u32 = 73,
    }
}

codes! {
    /// Attributes of gscan replies and events
    GscanResults ["gscan.results"] {
        request_id: u16 = 1,
        status: u16 = 2,
        num_channels: u16 = 3,
        channels: u16 = 4,
        max_scan_cache_size: u16 = 5,
        max_scan_buckets: u16 = 6,
        max_ap_cache_per_scan: u16 = 7,
        max_rssi_sample_size: u16 = 8,
        max_scan_reporting_threshold: u16 = 9,
        max_hotlist_bssids: u16 = 10,
        max_significant_wifi_change_aps: u16 = 11,
        max_bssid_history_entries: u16 = 12,
        num_results: u16 = 13,
        list: u16 = 14,
        time_stamp: u16 = 15,
        ssid: u16 = 16,
        bssid: u16 = 17,
        channel: u16 = 18,
        rssi: u16 = 19,
        rtt: u16 = 20,
        rtt_sd: u16 = 21,
        beacon_period: u16 = 22,
        capability: u16 = 23,
        ie_length: u16 = 24,
        ie_data: u16 = 25,
        more_data: u16 = 26,
        scan_event_type: u16 = 27,
        scan_event_status: u16 = 28,
        significant_change_bssid: u16 = 29,
        significant_change_channel: u16 = 30,
        significant_change_num_rssi: u16 = 31,
        significant_change_rssi_list: u16 = 32,
        cached_list: u16 = 33,
        cached_scan_id: u16 = 34,
        cached_flags: u16 = 35,
        passpoint_num_matches: u16 = 36,
        passpoint_match_list: u16 = 37,
        passpoint_match_id: u16 = 38,
        passpoint_anqp_len: u16 = 39,
        passpoint_anqp: u16 = 40,
        max_hotlist_ssids: u16 = 41,
        max_epno_networks: u16 = 42,
        max_epno_networks_by_ssid: u16 = 43,
        max_whitelisted_ssids: u16 = 44,
        buckets_scanned: u16 = 45,
    }
}

codes! {
    /// Attributes of gscan requests
    GscanConfig ["gscan.config"] {
        request_id: u16 = 1,
        band: u16 = 2,
        max_channels: u16 = 3,
        channel: u16 = 4,
        dwell_time: u16 = 5,
        passive: u16 = 6,
        bucket_index: u16 = 8,
        bucket_band: u16 = 9,
        bucket_period: u16 = 10,
        bucket_report_events: u16 = 11,
        bucket_num_channel_specs: u16 = 12,
        channel_spec: u16 = 13,
        base_period: u16 = 14,
        max_ap_per_scan: u16 = 15,
        report_threshold_percent: u16 = 16,
        num_buckets: u16 = 17,
        bucket_spec: u16 = 18,
        cached_flush: u16 = 19,
        cached_max: u16 = 20,
        ap_bssid: u16 = 21,
        ap_rssi_low: u16 = 22,
        ap_rssi_high: u16 = 23,
        hotlist_num_ap: u16 = 25,
        ap_threshold_param: u16 = 26,
        significant_rssi_sample_size: u16 = 27,
        significant_lost_ap_sample_size: u16 = 28,
        significant_min_breaching: u16 = 29,
        significant_num_ap: u16 = 30,
        hotlist_lost_ap_sample_size: u16 = 31,
        bucket_max_period: u16 = 32,
        bucket_base: u16 = 33,
        bucket_step_count: u16 = 34,
        report_threshold_num_scans: u16 = 35,
        scanning_mac_oui: u16 = 1,
    }
}

codes! {
    /// Attributes of ePNO and passpoint requests
    Pno ["pno"] {
        passpoint_num: u16 = 1,
        passpoint_network_array: u16 = 2,
        passpoint_id: u16 = 3,
        passpoint_realm: u16 = 4,
        passpoint_roam_consortium_ids: u16 = 5,
        passpoint_roam_plmn: u16 = 6,
        num_networks: u16 = 7,
        networks_list: u16 = 8,
        network_ssid: u16 = 9,
        network_flags: u16 = 11,
        network_auth_bit: u16 = 12,
        min_5ghz_rssi: u16 = 16,
        min_24ghz_rssi: u16 = 17,
        initial_score_max: u16 = 18,
        current_connection_bonus: u16 = 19,
        same_network_bonus: u16 = 20,
        secure_bonus: u16 = 21,
        band_5ghz_bonus: u16 = 22,
    }
}

codes! {
    /// Roaming subcommand and attributes
    Roam ["roam"] {
        subcmd: u32 = 64,
        set_blacklist_bssid: u32 = 6,
        attr_subcmd: u16 = 1,
        request_id: u16 = 2,
        bssid_params: u16 = 18,
        bssid_params_num: u16 = 19,
        bssid_params_bssid: u16 = 20,
    }
}

codes! {
    /// Link layer statistics subcommands and attributes
    LlStats ["llstats"] {
        subcmd_set: u32 = 14,
        subcmd_get: u32 = 15,
        subcmd_clear: u32 = 16,
        set_mpdu_size_threshold: u16 = 1,
        set_aggressive: u16 = 2,
        get_request_id: u16 = 1,
        get_request_mask: u16 = 2,
        clear_request_mask: u16 = 1,
        clear_stop_request: u16 = 2,
        clear_response_mask: u16 = 3,
        clear_stop_response: u16 = 4,
        result_request_id: u16 = 1,
        iface_beacon_rx: u16 = 2,
        iface_mgmt_rx: u16 = 3,
        iface_mgmt_action_rx: u16 = 4,
        iface_mgmt_action_tx: u16 = 5,
        iface_rssi_mgmt: u16 = 6,
        iface_rssi_data: u16 = 7,
        iface_rssi_ack: u16 = 8,
        wmm_ac: u16 = 18,
        wmm_tx_mpdu: u16 = 19,
        wmm_rx_mpdu: u16 = 20,
        wmm_mpdu_lost: u16 = 25,
        wmm_retries: u16 = 26,
        iface_num_peers: u16 = 33,
        peer_type: u16 = 34,
        peer_mac_address: u16 = 35,
        peer_capabilities: u16 = 36,
        radio_id: u16 = 49,
        radio_on_time: u16 = 50,
        radio_tx_time: u16 = 51,
        radio_rx_time: u16 = 52,
        radio_on_time_scan: u16 = 53,
        radio_on_time_nbd: u16 = 54,
        radio_on_time_gscan: u16 = 55,
        radio_on_time_roam_scan: u16 = 56,
        radio_on_time_pno_scan: u16 = 57,
        radio_on_time_hs20: u16 = 58,
        radio_num_channels: u16 = 59,
        channel_width: u16 = 60,
        channel_center_freq: u16 = 61,
        channel_center_freq0: u16 = 62,
        channel_center_freq1: u16 = 63,
        channel_on_time: u16 = 64,
        channel_cca_busy_time: u16 = 65,
        channel_info: u16 = 67,
        peer_info: u16 = 68,
        wmm_info: u16 = 70,
        iface_leaky_ap_guard_time: u16 = 75,
        stats_type: u16 = 76,
        radio_num_tx_levels: u16 = 77,
        radio_tx_time_per_level: u16 = 78,
    }
}

codes! {
    /// RSSI monitoring subcommand and attributes
    Rssi ["rssi"] {
        subcmd: u32 = 80,
        control: u16 = 1,
        request_id: u16 = 2,
        max_rssi: u16 = 3,
        min_rssi: u16 = 4,
        cur_bssid: u16 = 5,
        cur_rssi: u16 = 6,
    }
}

/// Complete wire contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireContract {
    /// Generic netlink family of vendor messages
    pub family_name: String,
    /// Multicast groups joined by the event socket
    pub groups: Vec<String>,
    /// Vendor OUI of every subcommand
    pub oui: u32,
    pub nl80211: Nl80211,
    pub gscan_subcmd: GscanSubcmds,
    pub gscan_results: GscanResults,
    pub gscan_config: GscanConfig,
    pub pno: Pno,
    pub roam: Roam,
    pub llstats: LlStats,
    pub rssi: Rssi,
}

impl Default for WireContract {
    fn default() -> Self {
        Self {
            family_name: "nl80211".into(),
            groups: vec!["vendor".into()],
            oui: 0x001374,
            nl80211: Default::default(),
            gscan_subcmd: Default::default(),
            gscan_results: Default::default(),
            gscan_config: Default::default(),
            pno: Default::default(),
            roam: Default::default(),
            llstats: Default::default(),
            rssi: Default::default(),
        }
    }
}

impl WireContract {
    /// Defaults overridden by the INI file at `path`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_ini_str(&std::fs::read_to_string(path)?)
    }

    /// Defaults overridden by INI `content`. Unknown sections and keys are
    /// ignored.
    pub fn from_ini_str(content: &str) -> Result<Self, ConfigError> {
        let mut ini = Ini::new();
        ini.read(content.to_string()).map_err(ConfigError::Parse)?;

        let mut contract = Self {
            nl80211: Nl80211::load(&ini)?,
            gscan_subcmd: GscanSubcmds::load(&ini)?,
            gscan_results: GscanResults::load(&ini)?,
            gscan_config: GscanConfig::load(&ini)?,
            pno: Pno::load(&ini)?,
            roam: Roam::load(&ini)?,
            llstats: LlStats::load(&ini)?,
            rssi: Rssi::load(&ini)?,
            ..Default::default()
        };
        if let Some(name) = ini.get("nl80211", "family_name") {
            contract.family_name = name.trim().to_string();
        }
        if let Some(groups) = ini.get("nl80211", "groups") {
            contract.groups = groups
                .split(',')
                .map(str::trim)
                .filter(|group| !group.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(oui) = read::<u32>(&ini, "vendor", "oui")? {
            if oui > 0xffffff {
                return Err(ConfigError::OutOfRange { section: "vendor".into(), key: "oui".into(), value: oui.into() });
            }
            contract.oui = oui;
        }
        Ok(contract)
    }

    /// Framing of vendor messages within the family
    pub fn family(&self) -> Family {
        Family {
            vendor_cmd: self.nl80211.vendor_cmd,
            ifindex_attr: self.nl80211.attr_ifindex,
            vendor_id_attr: self.nl80211.attr_vendor_id,
            subcmd_attr: self.nl80211.attr_vendor_subcmd,
            data_attr: self.nl80211.attr_vendor_data,
        }
    }
}
