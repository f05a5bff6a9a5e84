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

//! RSSI monitoring: the firmware reports when the signal of the current
//! access point leaves a range.

use crate::contract::WireContract;
use crate::error::{Error, Result};
use crate::Interface;
use log::info;
use std::sync::{Arc, Mutex};
use wifi_hal_nlattr::Attribute;
use wifi_hal_vendor::{Command, Dispatcher, EventKey, Handler, Subscription, Transport};

const CONTROL_START: u32 = 1;
const CONTROL_STOP: u32 = 2;

/// Signal of the current access point out of range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiBreach {
    pub bssid: [u8; 6],
    pub rssi: i8,
}

pub trait RssiEvents: Send + Sync {
    fn on_rssi_threshold_breached(&self, request_id: u32, breach: RssiBreach);
}

pub struct RssiMonitor {
    transport: Arc<Transport>,
    dispatcher: Arc<Dispatcher>,
    contract: Arc<WireContract>,
    session: Mutex<Option<Subscription>>,
}

impl RssiMonitor {
    pub fn new(transport: Arc<Transport>, dispatcher: Arc<Dispatcher>, contract: Arc<WireContract>) -> Self {
        Self { transport, dispatcher, contract, session: Mutex::new(None) }
    }

    fn command(&self, iface: &Interface, request_id: u32, control: u32) -> Result<Command> {
        let r = &self.contract.rssi;
        let key = EventKey::new(self.contract.oui, r.subcmd);
        let mut cmd = Command::with_request_id(self.transport.clone(), key, r.request_id, request_id);
        cmd.set_iface(iface.index)?;
        cmd.put(Attribute::u32(r.control, control))?;
        Ok(cmd)
    }

    /// Report when the RSSI leaves `[min_rssi, max_rssi]`. Supersedes a
    /// running monitoring.
    pub fn start(
        &self,
        iface: &Interface,
        request_id: u32,
        max_rssi: i8,
        min_rssi: i8,
        events: Arc<dyn RssiEvents>,
    ) -> Result<()> {
        if min_rssi > max_rssi {
            return Err(Error::InvalidArgument("min_rssi above max_rssi"));
        }
        let r = self.contract.rssi.clone();
        let key = EventKey::new(self.contract.oui, r.subcmd);
        let handler = Handler::single_shot(key, request_id, move |attrs| {
            Ok(RssiBreach { bssid: attrs.require(r.cur_bssid)?.as_array()?, rssi: attrs.i8(r.cur_rssi)? })
        })
        .with_request_id_tag(self.contract.rssi.request_id)
        .with_callback(move |completed| {
            for breach in completed.records() {
                events.on_rssi_threshold_breached(completed.request_id, *breach);
            }
        });

        let previous = self.session.lock().unwrap().take();
        if let Some(previous) = previous {
            info!("rssi monitoring {} superseded", previous.request_id());
            previous.cancel();
        }
        let mut subscription = Subscription::new(self.dispatcher.clone(), request_id);
        subscription.add(key, Arc::new(handler))?;

        let r = &self.contract.rssi;
        let mut cmd = self.command(iface, request_id, CONTROL_START)?;
        cmd.put(Attribute::i8(r.max_rssi, max_rssi))?;
        cmd.put(Attribute::i8(r.min_rssi, min_rssi))?;
        cmd.request_response()?;
        if let Some(other) = self.session.lock().unwrap().replace(subscription) {
            other.cancel();
        }
        info!("rssi monitoring {} started, range [{}, {}]", request_id, min_rssi, max_rssi);
        Ok(())
    }

    pub fn stop(&self, iface: &Interface) -> Result<()> {
        let Some(subscription) = self.session.lock().unwrap().take() else {
            return Err(Error::NotStarted("rssi monitoring"));
        };
        subscription.disable();
        let mut cmd = self.command(iface, subscription.request_id(), CONTROL_STOP)?;
        let result = cmd.request_response();
        subscription.cancel();
        Ok(result?)
    }

    pub fn is_monitoring(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }
}
