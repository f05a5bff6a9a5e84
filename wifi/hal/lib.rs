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

//! Wi-Fi vendor HAL
//!
//! Wires the vendor command and event engine to the driver, and exposes
//! the features built on it:
//!
//! ```text
//!                   WifiHal
//!     ________________|__________________
//!    |         |            |            |
//!  Gscan   LinkLayerStats  RssiMonitor  poll thread
//!    |         |            |            |
//!    |   SingletonCommand   |        Dispatcher --> Handlers
//!    |_________|____________|____________|
//!                     |
//!                 Transport (nl80211 vendor commands and events)
//! ```
//!
//! Subcommand and attribute ids come from a [`WireContract`], which can be
//! loaded from an INI file.

mod contract;
mod error;
pub mod gscan;
pub mod llstats;
mod nlctrl;
pub mod rssi;

#[cfg(test)]
mod tests;

pub use contract::{
    ConfigError, GscanConfig, GscanResults, GscanSubcmds, LlStats, Nl80211, Pno, Rssi, WireContract,
};
pub use error::{Error, Result};
pub use nlctrl::{resolve_family, FamilyInfo, GENL_ID_CTRL};

use gscan::Gscan;
use llstats::LinkLayerStats;
use log::{error, info};
use rssi::RssiMonitor;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use wifi_hal_nlattr::{Attrs, ParseError};
use wifi_hal_vendor::{Dispatcher, ErrorSink, LocalIdentity, Transport, TransportConfig};

/// Inits logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    android_logger::init_once(android_logger::Config::default().with_tag("wifi_hal"));
}

/// Inits logging for host
#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    env_logger::Builder::new().parse_default_env().try_init().ok();
}

/// Network interface commands are addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
}

impl Interface {
    pub fn new(name: &str, index: u32) -> Self {
        Self { name: name.into(), index }
    }

    /// Look up the index of interface `name`
    pub fn from_name(name: &str) -> Result<Self> {
        let index = nix::net::if_::if_nametoindex(name).map_err(|_| Error::InterfaceNotFound(name.into()))?;
        Ok(Self::new(name, index))
    }
}

/// Read `count` native endian 32 bits values packed in attribute `tag`
pub(crate) fn read_u32_array(attrs: &Attrs, tag: u16, count: usize) -> Result<Vec<u32>, ParseError> {
    let data = attrs.bytes(tag)?;
    let expected = count.saturating_mul(4);
    if data.len() < expected {
        return Err(ParseError::TruncatedAttribute { tag, expected, actual: data.len() });
    }
    Ok(data.chunks_exact(4).take(count).map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]])).collect())
}

/// Process-wide state of the HAL: the transport, the dispatcher and its
/// poll thread, and the feature modules sharing them.
pub struct WifiHal {
    contract: Arc<WireContract>,
    transport: Arc<Transport>,
    dispatcher: Arc<Dispatcher>,
    poll_thread: Option<JoinHandle<()>>,
    gscan: Gscan,
    llstats: LinkLayerStats,
    rssi: RssiMonitor,
}

impl WifiHal {
    /// Open the netlink sockets of `identity`, resolve the family and the
    /// multicast groups of `contract`, and start the poll thread.
    pub fn initialize(identity: LocalIdentity, contract: WireContract) -> Result<Self> {
        let config = TransportConfig { family: contract.family(), ..Default::default() };
        let transport = Transport::open(identity, config)?;

        let family = resolve_family(&transport, &contract.family_name, transport.config().ack_timeout)?;
        transport.set_family_id(family.id);
        for name in contract.groups.iter() {
            let group = family.group(name).ok_or_else(|| Error::GroupNotFound(name.clone()))?;
            transport.join_group(group)?;
        }
        info!("{} family {} ready", contract.family_name, family.id);
        Ok(Self::with_transport(Arc::new(transport), contract))
    }

    /// Build over a transport already set up, and start the poll thread
    pub fn with_transport(transport: Arc<Transport>, contract: WireContract) -> Self {
        let contract = Arc::new(contract);
        let dispatcher = Arc::new(Dispatcher::new());
        let poll_thread = {
            let (transport, dispatcher) = (transport.clone(), dispatcher.clone());
            thread::spawn(move || match transport.run_poll_loop(&dispatcher) {
                Ok(()) => info!("poll loop stopped"),
                Err(err) => error!("poll loop terminated: {}", err),
            })
        };

        Self {
            gscan: Gscan::new(transport.clone(), dispatcher.clone(), contract.clone()),
            llstats: LinkLayerStats::new(transport.clone(), contract.clone()),
            rssi: RssiMonitor::new(transport.clone(), dispatcher.clone(), contract.clone()),
            contract,
            transport,
            dispatcher,
            poll_thread: Some(poll_thread),
        }
    }

    pub fn contract(&self) -> &WireContract {
        &self.contract
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Receive the events that could not be decoded
    pub fn set_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        self.dispatcher.set_error_sink(sink);
    }

    pub fn gscan(&self) -> &Gscan {
        &self.gscan
    }

    pub fn llstats(&self) -> &LinkLayerStats {
        &self.llstats
    }

    pub fn rssi(&self) -> &RssiMonitor {
        &self.rssi
    }

    /// Stop the poll thread and close the transport
    pub fn cleanup(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.poll_thread.take() else {
            return;
        };
        self.transport.shutdown();
        if thread.join().is_err() {
            error!("poll thread panicked");
        }
    }
}

impl Drop for WifiHal {
    fn drop(&mut self) {
        self.shutdown();
    }
}
