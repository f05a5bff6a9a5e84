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

use crate::contract::ConfigError;
use thiserror::Error;
use wifi_hal_nlattr::ParseError;
use wifi_hal_vendor::TransportError;

/// Errors of the HAL entry points
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Vendor(#[from] wifi_hal_vendor::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot open netlink sockets: {0}")]
    Io(#[from] std::io::Error),
    #[error("generic netlink family {0} not found")]
    FamilyNotFound(String),
    #[error("multicast group {0} not found")]
    GroupNotFound(String),
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no {0} operation in progress")]
    NotStarted(&'static str),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Vendor(err.into())
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Vendor(err.into())
    }
}

impl Error {
    /// The driver did not answer in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Vendor(err) if err.is_timeout())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
