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

use crate::gscan::*;
use crate::llstats::StatsParams;
use crate::rssi::{RssiBreach, RssiEvents};
use crate::*;
use std::io::Write;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use wifi_hal_nlattr::{Attribute, Attrs, GenericMessage, Packet};
use wifi_hal_vendor::loopback::{loopback, Peer};
use wifi_hal_vendor::{EventKey, TransportConfig};

const WAIT: Duration = Duration::from_secs(1);

fn setup(ack_timeout: Duration) -> (WifiHal, Peer) {
    let contract = WireContract::default();
    let config = TransportConfig { family: contract.family(), ack_timeout, ..Default::default() };
    let (transport, peer) = loopback(config).unwrap();
    (WifiHal::with_transport(Arc::new(transport), contract), peer)
}

fn wlan0() -> Interface {
    Interface::new("wlan0", 3)
}

fn key(hal: &WifiHal, subcmd: u32) -> EventKey {
    EventKey::new(hal.contract().oui, subcmd)
}

fn scan_result(channel: u32) -> ScanResult {
    ScanResult {
        ts: 42,
        ssid: b"home".to_vec(),
        bssid: [2, 0, 0, 0, 0, channel as u8],
        channel,
        rssi: -55,
        ..Default::default()
    }
}

fn cached_reply(c: &GscanResults, request_id: u32, scan_id: u32, channel: u32, more_data: bool) -> Attrs {
    Attrs::from_iter([
        Attribute::u32(c.request_id, request_id),
        Attribute::u32(c.num_results, 1),
        Attribute::u8(c.more_data, more_data.into()),
        Attribute::u32(c.cached_scan_id, scan_id),
        Attribute::array(
            c.cached_list,
            [vec![
                Attribute::u32(c.cached_scan_id, scan_id),
                Attribute::u32(c.cached_flags, 0),
                Attribute::u32(c.num_results, 1),
                Attribute::array(c.list, [scan_result(channel).to_attrs(c)]),
            ]],
        ),
    ])
}

fn list_event(c: &GscanResults, request_id: u32, channels: &[u32], more_data: bool) -> Attrs {
    Attrs::from_iter([
        Attribute::u32(c.request_id, request_id),
        Attribute::u32(c.num_results, channels.len() as u32),
        Attribute::u8(c.more_data, more_data.into()),
        Attribute::array(c.list, channels.iter().map(|&ch| scan_result(ch).to_attrs(c))),
    ])
}

#[derive(Debug, PartialEq)]
enum Received {
    ScanEvent(u32, ScanEvent),
    FullScanResult(u32, u32),
    HotlistFound(u32, Vec<u32>),
    PnoFound(u32, Vec<u32>),
}

struct Events(Mutex<mpsc::Sender<Received>>);

impl Events {
    fn new() -> (Arc<Self>, mpsc::Receiver<Received>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Events(Mutex::new(tx))), rx)
    }

    fn send(&self, received: Received) {
        self.0.lock().unwrap().send(received).unwrap();
    }
}

fn channels(results: &[ScanResult]) -> Vec<u32> {
    results.iter().map(|result| result.channel).collect()
}

impl GscanEvents for Events {
    fn on_scan_event(&self, request_id: u32, event: ScanEvent) {
        self.send(Received::ScanEvent(request_id, event));
    }

    fn on_full_scan_result(&self, request_id: u32, result: &ScanResult, _buckets_scanned: u32) {
        self.send(Received::FullScanResult(request_id, result.channel));
    }

    fn on_hotlist_ap_found(&self, request_id: u32, results: &[ScanResult]) {
        self.send(Received::HotlistFound(request_id, channels(results)));
    }

    fn on_pno_network_found(&self, request_id: u32, results: &[ScanResult]) {
        self.send(Received::PnoFound(request_id, channels(results)));
    }
}

/// Answer the next command with `replies`, then acknowledge it
fn answer(peer: &Peer, replies: Vec<Attrs>) -> wifi_hal_vendor::VendorMessage {
    let (seq, cmd) = peer.recv_command(WAIT).unwrap();
    for reply in replies {
        peer.reply(seq, reply).unwrap();
    }
    peer.ack(seq, 0).unwrap();
    cmd
}

#[test]
fn cached_results_reassembly() {
    let (hal, peer) = setup(WAIT);
    let c = hal.contract().gscan_results.clone();
    let subcmd = hal.contract().gscan_subcmd.cached_results;
    let config = hal.contract().gscan_config.clone();

    let kernel = thread::spawn(move || {
        let (seq, cmd) = peer.recv_command(WAIT).unwrap();
        assert_eq!(cmd.key.subcmd, subcmd);
        assert_eq!(cmd.ifindex, Some(3));
        assert_eq!(cmd.data.u8(config.cached_flush), Ok(1));
        assert_eq!(cmd.data.u32(config.cached_max), Ok(10));
        let request_id = cmd.data.u32(config.request_id).unwrap();
        peer.reply(seq, cached_reply(&c, request_id, 7, 2412, true)).unwrap();
        peer.reply(seq, cached_reply(&c, request_id, 7, 2437, false)).unwrap();
        peer.ack(seq, 0).unwrap();
        peer
    });

    let scans = hal.gscan().get_cached_results(&wlan0(), true, 10).unwrap();
    kernel.join().unwrap();

    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].scan_id, 7);
    assert_eq!(scans[0].flags, ScanFlags::empty());
    assert_eq!(channels(&scans[0].results), vec![2412, 2437]);
}

#[test]
fn cached_results_capped() {
    let (hal, peer) = setup(WAIT);
    let c = hal.contract().gscan_results.clone();
    let request_id_tag = hal.contract().gscan_config.request_id;

    let kernel = thread::spawn(move || {
        let (seq, cmd) = peer.recv_command(WAIT).unwrap();
        let request_id = cmd.data.u32(request_id_tag).unwrap();
        peer.reply(seq, cached_reply(&c, request_id, 1, 2412, true)).unwrap();
        peer.reply(seq, cached_reply(&c, request_id, 2, 2437, true)).unwrap();
        peer.reply(seq, cached_reply(&c, request_id, 3, 2462, false)).unwrap();
        peer.ack(seq, 0).unwrap();
        peer
    });

    let scans = hal.gscan().get_cached_results(&wlan0(), false, 2).unwrap();
    kernel.join().unwrap();
    assert_eq!(scans.iter().map(|scan| scan.scan_id).collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn cached_results_timeout_keeps_partial() {
    let (hal, peer) = setup(Duration::from_millis(200));
    let c = hal.contract().gscan_results.clone();
    let request_id_tag = hal.contract().gscan_config.request_id;

    let kernel = thread::spawn(move || {
        let (seq, cmd) = peer.recv_command(WAIT).unwrap();
        let request_id = cmd.data.u32(request_id_tag).unwrap();
        peer.reply(seq, cached_reply(&c, request_id, 1, 2412, true)).unwrap();
        peer.reply(seq, cached_reply(&c, request_id, 2, 2437, true)).unwrap();
        peer
    });

    let scans = hal.gscan().get_cached_results(&wlan0(), false, 10).unwrap();
    kernel.join().unwrap();
    assert_eq!(scans.len(), 2);
    assert_eq!(scans[0].flags, ScanFlags::empty());
    assert_eq!(scans[1].flags, ScanFlags::INTERRUPTED);
}

struct Reports(Mutex<mpsc::Sender<(Option<EventKey>, String)>>);

impl wifi_hal_vendor::ErrorSink for Reports {
    fn report(&self, key: Option<EventKey>, error: &wifi_hal_vendor::Error) {
        self.0.lock().unwrap().send((key, error.to_string())).unwrap();
    }
}

#[test]
fn cached_results_malformed_keeps_partial() {
    let (hal, peer) = setup(WAIT);
    let (tx, reports) = mpsc::channel();
    hal.set_error_sink(Arc::new(Reports(Mutex::new(tx))));
    let c = hal.contract().gscan_results.clone();
    let request_id_tag = hal.contract().gscan_config.request_id;

    let kernel = thread::spawn(move || {
        let (seq, cmd) = peer.recv_command(WAIT).unwrap();
        let request_id = cmd.data.u32(request_id_tag).unwrap();
        peer.reply(seq, cached_reply(&c, request_id, 1, 2412, true)).unwrap();
        let mut short = cached_reply(&c, request_id, 2, 2437, false);
        short.push(Attribute::u32(c.num_results, 5));
        peer.reply(seq, short).unwrap();
        peer.ack(seq, 0).unwrap();
        peer
    });

    let scans = hal.gscan().get_cached_results(&wlan0(), false, 10).unwrap();
    kernel.join().unwrap();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].scan_id, 1);
    assert_eq!(scans[0].flags, ScanFlags::INTERRUPTED);

    let cached = key(&hal, hal.contract().gscan_subcmd.cached_results);
    let Ok((reported, error)) = reports.recv_timeout(WAIT) else {
        panic!("no report of the malformed reply");
    };
    assert_eq!(reported, Some(cached));
    assert!(error.contains("advertises 5 entries"), "{}", error);
}

#[test]
fn cached_results_timeout_without_results() {
    let (hal, peer) = setup(Duration::from_millis(100));
    let result = hal.gscan().get_cached_results(&wlan0(), false, 10);
    assert!(result.as_ref().is_err_and(|err| err.is_timeout()), "{:?}", result);
    drop(peer);
}

#[test]
fn hotlist_fragments_through_poll_loop() {
    let (hal, peer) = setup(WAIT);
    let (events, rx) = Events::new();
    let c = hal.contract().gscan_results.clone();
    let found = key(&hal, hal.contract().gscan_subcmd.hotlist_ap_found);

    let params = HotlistParams {
        lost_ap_sample_size: 3,
        aps: vec![ApThreshold { bssid: [2, 0, 0, 0, 0, 1], low: -80, high: -40 }],
    };
    let kernel = thread::spawn(move || {
        let cmd = answer(&peer, vec![]);
        peer.emit_event(found, list_event(&c, 5, &[1, 6], true)).unwrap();
        peer.emit_event(found, list_event(&c, 6, &[11], false)).unwrap();
        peer.emit_event(found, list_event(&c, 5, &[36], false)).unwrap();
        (cmd, peer)
    });
    hal.gscan().set_bssid_hotlist(&wlan0(), 5, &params, events).unwrap();
    let (cmd, peer) = kernel.join().unwrap();

    let g = &hal.contract().gscan_config;
    assert_eq!(cmd.data.u32(g.hotlist_num_ap), Ok(1));
    let Ok(aps) = cmd.data.nested(g.ap_threshold_param) else {
        panic!("no access point thresholds");
    };
    let Some(ap) = aps.iter().next() else {
        panic!("empty access point thresholds");
    };
    assert_eq!(ap.children().unwrap().i32(g.ap_rssi_low), Ok(-80));

    // The fragment of request 6 is dropped.
    assert_eq!(rx.recv_timeout(WAIT), Ok(Received::HotlistFound(5, vec![1, 6, 36])));

    let kernel = thread::spawn(move || answer(&peer, vec![]));
    hal.gscan().reset_bssid_hotlist(&wlan0()).unwrap();
    let reset = kernel.join().unwrap();
    assert_eq!(reset.key.subcmd, hal.contract().gscan_subcmd.reset_bssid_hotlist);
    assert_eq!(reset.data.u32(g.request_id), Ok(5));
    assert!(!hal.dispatcher().is_registered(found));
    assert!(matches!(hal.gscan().reset_bssid_hotlist(&wlan0()), Err(Error::NotStarted(_))));
}

#[test]
fn gscan_session() {
    let (hal, peer) = setup(WAIT);
    let (events, rx) = Events::new();
    let c = hal.contract().gscan_results.clone();
    let s = hal.contract().gscan_subcmd.clone();
    let (full, scan_event) = (key(&hal, s.full_scan_result), key(&hal, s.scan_event));

    let params = ScanParams {
        base_period_ms: 10000,
        max_ap_per_scan: 16,
        report_threshold_percent: 80,
        report_threshold_num_scans: 4,
        buckets: vec![BucketSpec {
            index: 0,
            band: WifiBand::Unspecified,
            period_ms: 10000,
            report_events: ReportEvents::EACH_SCAN | ReportEvents::FULL_RESULTS,
            max_period_ms: 0,
            base: 0,
            step_count: 0,
            channels: vec![
                ChannelSpec { channel: 2412, dwell_time_ms: 20, passive: false },
                ChannelSpec { channel: 5180, dwell_time_ms: 30, passive: true },
            ],
        }],
    };
    let kernel = thread::spawn(move || {
        let cmd = answer(&peer, vec![]);
        // Full scan results of a stale request id are handled as ours.
        let mut result: Attrs = scan_result(2412).to_attrs(&c).into_iter().collect();
        result.push(Attribute::u32(c.request_id, 99));
        peer.emit_event(full, result).unwrap();
        peer.emit_event(
            scan_event,
            Attrs::from_iter([Attribute::u32(c.request_id, 8), Attribute::u8(c.scan_event_type, 0)]),
        )
        .unwrap();
        (cmd, peer)
    });
    hal.gscan().start(&wlan0(), 8, &params, events).unwrap();
    let (cmd, peer) = kernel.join().unwrap();
    assert!(hal.gscan().is_scanning());

    let g = &hal.contract().gscan_config;
    assert_eq!(cmd.data.u8(g.num_buckets), Ok(1));
    let buckets = cmd.data.nested(g.bucket_spec).unwrap();
    let Some(bucket) = buckets.iter().next() else {
        panic!("no bucket");
    };
    let bucket = bucket.children().unwrap();
    assert_eq!(bucket.u8(g.bucket_report_events), Ok(3));
    assert_eq!(bucket.nested(g.channel_spec).map(|specs| specs.len()), Ok(2));

    assert_eq!(rx.recv_timeout(WAIT), Ok(Received::FullScanResult(8, 2412)));
    assert_eq!(rx.recv_timeout(WAIT), Ok(Received::ScanEvent(8, ScanEvent::ResultsAvailable)));

    let kernel = thread::spawn(move || answer(&peer, vec![]));
    hal.gscan().stop(&wlan0()).unwrap();
    assert_eq!(kernel.join().unwrap().key.subcmd, s.stop);
    assert!(!hal.gscan().is_scanning());
    assert!(!hal.dispatcher().is_registered(full));
}

#[test]
fn epno_network_found() {
    let (hal, peer) = setup(WAIT);
    let (events, rx) = Events::new();
    let c = hal.contract().gscan_results.clone();
    let found = key(&hal, hal.contract().gscan_subcmd.pno_network_found);

    let params = EpnoParams {
        min_5ghz_rssi: -80,
        networks: vec![EpnoNetwork { ssid: "home".into(), flags: 0, auth_bit_field: 2 }],
        ..Default::default()
    };
    let kernel = thread::spawn(move || {
        let cmd = answer(&peer, vec![]);
        // Without request id
        let mut event = list_event(&c, 0, &[5180], false);
        event = event.into_iter().filter(|attr| attr.tag() != c.request_id).collect();
        peer.emit_event(found, event).unwrap();
        (cmd, peer)
    });
    hal.gscan().set_epno_list(&wlan0(), 12, &params, events).unwrap();
    let (cmd, peer) = kernel.join().unwrap();
    let p = &hal.contract().pno;
    assert_eq!(cmd.data.i32(p.min_5ghz_rssi), Ok(-80));
    assert_eq!(cmd.data.u32(p.num_networks), Ok(1));

    assert_eq!(rx.recv_timeout(WAIT), Ok(Received::PnoFound(12, vec![5180])));

    let kernel = thread::spawn(move || answer(&peer, vec![]));
    hal.gscan().reset_epno_list(&wlan0()).unwrap();
    let reset = kernel.join().unwrap();
    assert_eq!(reset.data.u32(p.num_networks), Ok(0));
}

#[test]
fn valid_channels_and_capabilities() {
    let (hal, peer) = setup(WAIT);
    let c = hal.contract().gscan_results.clone();

    let kernel = thread::spawn(move || {
        let list: Vec<u8> = [2412u32, 2437, 2462].iter().flat_map(|ch| ch.to_ne_bytes()).collect();
        answer(
            &peer,
            vec![Attrs::from_iter([Attribute::u32(c.num_channels, 3), Attribute::bytes(c.channels, &list)])],
        );
        answer(
            &peer,
            vec![Attrs::from_iter([
                Attribute::u32(c.max_scan_cache_size, 1024),
                Attribute::u32(c.max_scan_buckets, 16),
                Attribute::u32(c.max_ap_cache_per_scan, 32),
                Attribute::u32(c.max_rssi_sample_size, 8),
                Attribute::i32(c.max_scan_reporting_threshold, 100),
                Attribute::u32(c.max_hotlist_bssids, 128),
                Attribute::u32(c.max_significant_wifi_change_aps, 64),
            ])],
        );
    });

    let channels = hal.gscan().valid_channels(&wlan0(), WifiBand::Bg, 2).unwrap();
    assert_eq!(channels, vec![2412, 2437]);

    let result = hal.gscan().capabilities(&wlan0());
    kernel.join().unwrap();
    let tag = hal.contract().gscan_results.max_bssid_history_entries;
    assert!(matches!(
        result,
        Err(Error::Vendor(wifi_hal_vendor::Error::Parse(wifi_hal_nlattr::ParseError::MissingAttribute(t)))) if t == tag
    ));
}

#[test]
fn capabilities_unreported_limits() {
    let (hal, peer) = setup(WAIT);
    let c = hal.contract().gscan_results.clone();
    let limits = [
        Attribute::u32(c.max_scan_cache_size, 1024),
        Attribute::u32(c.max_scan_buckets, 16),
        Attribute::u32(c.max_ap_cache_per_scan, 32),
        Attribute::u32(c.max_rssi_sample_size, 8),
        Attribute::i32(c.max_scan_reporting_threshold, 100),
        Attribute::u32(c.max_hotlist_bssids, 128),
        Attribute::u32(c.max_significant_wifi_change_aps, 64),
        Attribute::u32(c.max_bssid_history_entries, 8),
    ];

    let kernel = thread::spawn(move || {
        let mut full = Attrs::from_iter(limits.clone());
        full.push(Attribute::u32(c.max_hotlist_ssids, 4));
        full.push(Attribute::u32(c.max_epno_networks, 64));
        full.push(Attribute::u32(c.max_epno_networks_by_ssid, 16));
        full.push(Attribute::u32(c.max_whitelisted_ssids, 8));
        answer(&peer, vec![full]);
        answer(&peer, vec![Attrs::from_iter(limits)]);
    });

    let Ok(full) = hal.gscan().capabilities(&wlan0()) else { panic!("capabilities failed") };
    assert_eq!(full.max_bssid_history_entries, 8);
    assert_eq!(
        (
            full.max_hotlist_ssids,
            full.max_number_epno_networks,
            full.max_number_epno_networks_by_ssid,
            full.max_number_of_white_listed_ssid
        ),
        (4, 64, 16, 8)
    );

    let Ok(basic) = hal.gscan().capabilities(&wlan0()) else { panic!("capabilities failed") };
    kernel.join().unwrap();
    assert_eq!(basic.max_scan_cache_size, 1024);
    assert_eq!(
        (
            basic.max_hotlist_ssids,
            basic.max_number_epno_networks,
            basic.max_number_epno_networks_by_ssid,
            basic.max_number_of_white_listed_ssid
        ),
        (0, 0, 0, 0)
    );
}

#[test]
fn scanning_mac_oui() {
    let (hal, peer) = setup(WAIT);
    let kernel = thread::spawn(move || answer(&peer, vec![]));

    hal.gscan().set_scanning_mac_oui(&wlan0(), [0x00, 0x50, 0xf2]).unwrap();
    let cmd = kernel.join().unwrap();
    assert_eq!(cmd.key, key(&hal, hal.contract().gscan_subcmd.scanning_mac_oui));
    assert_eq!(cmd.ifindex, Some(3));
    assert_eq!(cmd.data.bytes(hal.contract().gscan_config.scanning_mac_oui), Ok(&[0x00u8, 0x50, 0xf2][..]));
}

#[test]
fn bssid_blacklist() {
    let (hal, peer) = setup(WAIT);
    let bssids = [[0x02, 0, 0, 0, 0, 1], [0x02, 0, 0, 0, 0, 2]];
    let kernel = thread::spawn(move || {
        let cmd = answer(&peer, vec![]);
        (cmd, peer)
    });

    hal.gscan().set_bssid_blacklist(&wlan0(), 12, &bssids).unwrap();
    let (cmd, peer) = kernel.join().unwrap();
    let r = &hal.contract().roam;
    assert_eq!(cmd.key, key(&hal, r.subcmd));
    assert_eq!(cmd.data.u32(r.attr_subcmd), Ok(r.set_blacklist_bssid));
    assert_eq!(cmd.data.u32(r.request_id), Ok(12));
    assert_eq!(cmd.data.u32(r.bssid_params_num), Ok(2));
    let Ok(entries) = cmd.data.nested(r.bssid_params) else { panic!("no BSSID list") };
    let sent: Vec<Vec<u8>> = entries
        .iter()
        .map(|entry| entry.children().unwrap().bytes(r.bssid_params_bssid).unwrap().to_vec())
        .collect();
    assert_eq!(sent, vec![bssids[0].to_vec(), bssids[1].to_vec()]);

    let too_many = vec![[0u8; 6]; MAX_BLACKLIST_BSSIDS + 1];
    assert!(matches!(
        hal.gscan().set_bssid_blacklist(&wlan0(), 13, &too_many),
        Err(Error::InvalidArgument(_))
    ));
    assert!(!peer.has_request().unwrap());
}

#[test]
fn llstats_get_and_clear() {
    let (hal, peer) = setup(WAIT);
    let l = hal.contract().llstats.clone();

    let kernel = thread::spawn(move || {
        let set = answer(&peer, vec![]);
        assert_eq!(set.data.u32(l.set_mpdu_size_threshold), Ok(128));

        let mut iface = Attrs::from_iter([Attribute::u32(l.stats_type, 2)]);
        for tag in [
            l.iface_beacon_rx,
            l.iface_mgmt_rx,
            l.iface_mgmt_action_rx,
            l.iface_mgmt_action_tx,
            l.iface_rssi_mgmt,
            l.iface_rssi_data,
            l.iface_rssi_ack,
        ] {
            iface.push(Attribute::u32(tag, 9));
        }
        let peers = Attrs::from_iter([
            Attribute::u32(l.stats_type, 3),
            Attribute::u32(l.iface_num_peers, 1),
            Attribute::array(
                l.peer_info,
                [vec![
                    Attribute::u32(l.peer_type, 0),
                    Attribute::bytes(l.peer_mac_address, &[1, 2, 3, 4, 5, 6]),
                    Attribute::u32(l.peer_capabilities, 4),
                ]],
            ),
        ]);
        let get = answer(&peer, vec![iface, peers]);
        assert_eq!(get.data.u32(l.get_request_mask), Ok(7));

        let clear = answer(
            &peer,
            vec![Attrs::from_iter([Attribute::u32(l.clear_response_mask, 1), Attribute::u8(l.clear_stop_response, 1)])],
        );
        assert_eq!(clear.data.u8(l.clear_stop_request), Ok(1));
    });

    let params = StatsParams { mpdu_size_threshold: 128, aggressive_statistics_gathering: 0 };
    hal.llstats().set(&wlan0(), &params).unwrap();
    let stats = hal.llstats().get(&wlan0()).unwrap();
    let cleared = hal.llstats().clear(&wlan0(), 7, true).unwrap();
    kernel.join().unwrap();

    let Some(iface) = stats.iface else {
        panic!("no interface stats");
    };
    assert_eq!(iface.beacon_rx, 9);
    assert_eq!(iface.rssi_ack, 9);
    assert_eq!(iface.num_peers, 0);
    assert_eq!(stats.peers.len(), 1);
    assert_eq!(stats.peers[0].mac, [1, 2, 3, 4, 5, 6]);
    assert_eq!(cleared.mask, 1);
    assert!(cleared.stopped);
    assert!(!hal.llstats().is_busy());
}

#[test]
fn llstats_clear_without_reply() {
    let (hal, peer) = setup(WAIT);
    let kernel = thread::spawn(move || answer(&peer, vec![]));

    let result = hal.llstats().clear(&wlan0(), 1, false);
    kernel.join().unwrap();
    let clear = key(&hal, hal.contract().llstats.subcmd_clear);
    assert!(
        matches!(result, Err(Error::Vendor(wifi_hal_vendor::Error::NoResponse(k))) if k == clear),
        "{:?}",
        result
    );
    assert!(!hal.llstats().is_busy());
}

struct Breaches(Mutex<mpsc::Sender<(u32, RssiBreach)>>);

impl RssiEvents for Breaches {
    fn on_rssi_threshold_breached(&self, request_id: u32, breach: RssiBreach) {
        self.0.lock().unwrap().send((request_id, breach)).unwrap();
    }
}

#[test]
fn rssi_monitoring() {
    let (hal, peer) = setup(WAIT);
    let (tx, rx) = mpsc::channel();
    let r = hal.contract().rssi.clone();
    let event_key = key(&hal, r.subcmd);

    let kernel = thread::spawn(move || {
        let start = answer(&peer, vec![]);
        assert_eq!(start.data.u32(r.control), Ok(1));
        assert_eq!(start.data.i8(r.max_rssi), Ok(-40));
        assert_eq!(start.data.i8(r.min_rssi), Ok(-70));
        peer.emit_event(
            event_key,
            Attrs::from_iter([
                Attribute::u32(r.request_id, 21),
                Attribute::bytes(r.cur_bssid, &[1, 1, 1, 1, 1, 1]),
                Attribute::i8(r.cur_rssi, -75),
            ]),
        )
        .unwrap();
        peer
    });
    hal.rssi().start(&wlan0(), 21, -40, -70, Arc::new(Breaches(Mutex::new(tx)))).unwrap();
    let peer = kernel.join().unwrap();
    assert_eq!(rx.recv_timeout(WAIT), Ok((21, RssiBreach { bssid: [1; 6], rssi: -75 })));

    let r = hal.contract().rssi.clone();
    let kernel = thread::spawn(move || answer(&peer, vec![]));
    hal.rssi().stop(&wlan0()).unwrap();
    let stop = kernel.join().unwrap();
    assert_eq!(stop.data.u32(r.control), Ok(2));
    assert_eq!(stop.data.u32(r.request_id), Ok(21));
    assert!(!hal.rssi().is_monitoring());
}

#[test]
fn rssi_state_readable_while_starting() {
    let (hal, peer) = setup(WAIT);
    let (tx, _rx) = mpsc::channel();
    let subcmd = hal.contract().rssi.subcmd;

    thread::scope(|scope| {
        let starting =
            scope.spawn(|| hal.rssi().start(&wlan0(), 4, -30, -90, Arc::new(Breaches(Mutex::new(tx)))));
        let (seq, cmd) = peer.recv_command(WAIT).unwrap();
        assert_eq!(cmd.key.subcmd, subcmd);
        // Does not wait for the outstanding start.
        assert!(!hal.rssi().is_monitoring());
        peer.ack(seq, 0).unwrap();
        assert!(starting.join().unwrap().is_ok());
    });
    assert!(hal.rssi().is_monitoring());
}

#[test]
fn resolve_nl80211() {
    let config = TransportConfig::default();
    let (transport, peer) = loopback(config).unwrap();

    let kernel = thread::spawn(move || {
        let request = peer.recv_request(WAIT).unwrap();
        assert_eq!(request.family, GENL_ID_CTRL);
        assert_eq!(request.attrs.str(2), Ok("nl80211"));
        let attrs = Attrs::from_iter([
            Attribute::u16(1, 0x22),
            Attribute::array(
                7,
                [
                    vec![Attribute::string(1, "scan"), Attribute::u32(2, 4)],
                    vec![Attribute::string(1, "vendor"), Attribute::u32(2, 6)],
                ],
            ),
        ]);
        let mut reply = GenericMessage::new(GENL_ID_CTRL, 1, attrs);
        reply.seq = request.seq;
        peer.send_cmd(&Packet::Generic(reply)).unwrap();
        peer.ack(request.seq, 0).unwrap();
    });

    let family = resolve_family(&transport, "nl80211", WAIT).unwrap();
    kernel.join().unwrap();
    assert_eq!(family.id, 0x22);
    assert_eq!(family.group("vendor"), Some(6));
    assert_eq!(family.group("mlme"), None);
}

#[test]
fn unknown_family() {
    let (transport, peer) = loopback(TransportConfig::default()).unwrap();
    let kernel = thread::spawn(move || {
        let request = peer.recv_request(WAIT).unwrap();
        peer.ack(request.seq, -2).unwrap();
    });
    let result = resolve_family(&transport, "nl80211", WAIT);
    kernel.join().unwrap();
    assert!(matches!(result, Err(Error::FamilyNotFound(name)) if name == "nl80211"));
}

#[test]
fn contract_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[vendor]\noui = 0x001018\n\n[rssi]\nsubcmd = 90\n").unwrap();
    let contract = WireContract::from_file(file.path()).unwrap();
    assert_eq!(contract.oui, 0x001018);
    assert_eq!(contract.rssi.subcmd, 90);
    assert_eq!(contract.gscan_subcmd, GscanSubcmds::default());

    assert!(matches!(WireContract::from_file("/nonexistent/wifi_hal.ini"), Err(ConfigError::Io(_))));
}

#[test]
fn hotlist_superseded() {
    let (hal, peer) = setup(WAIT);
    let (events, rx) = Events::new();
    let c = hal.contract().gscan_results.clone();
    let found = key(&hal, hal.contract().gscan_subcmd.hotlist_ap_found);
    let params = HotlistParams { lost_ap_sample_size: 1, aps: vec![] };

    let kernel = thread::spawn(move || {
        answer(&peer, vec![]);
        answer(&peer, vec![]);
        peer.emit_event(found, list_event(&c, 5, &[1], false)).unwrap();
        peer.emit_event(found, list_event(&c, 9, &[11], false)).unwrap();
        peer
    });
    hal.gscan().set_bssid_hotlist(&wlan0(), 5, &params, events.clone()).unwrap();
    hal.gscan().set_bssid_hotlist(&wlan0(), 9, &params, events).unwrap();
    let _peer = kernel.join().unwrap();

    assert_eq!(rx.recv_timeout(WAIT), Ok(Received::HotlistFound(9, vec![11])));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}
