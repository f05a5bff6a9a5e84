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

//! Generic netlink controller queries.

use crate::error::{Error, Result};
use log::debug;
use std::collections::HashMap;
use std::time::Duration;
use wifi_hal_nlattr::{Attribute, Attrs, GenericMessage, ParseError};
use wifi_hal_vendor::Transport;

/// Family id of the controller
pub const GENL_ID_CTRL: u16 = 0x10;

const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;
const CTRL_ATTR_MCAST_GROUPS: u16 = 7;
const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

/// Family id and multicast groups of a generic netlink family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyInfo {
    pub id: u16,
    pub groups: HashMap<String, u32>,
}

impl FamilyInfo {
    pub fn group(&self, name: &str) -> Option<u32> {
        self.groups.get(name).copied()
    }

    /// Controller attributes of a GETFAMILY reply
    pub fn from_attrs(attrs: &Attrs) -> Result<Self, ParseError> {
        let mut groups = HashMap::new();
        if let Some(list) = attrs.optional(CTRL_ATTR_MCAST_GROUPS, Attribute::children)? {
            for entry in list.iter() {
                let group = entry.children()?;
                groups.insert(
                    group.str(CTRL_ATTR_MCAST_GRP_NAME)?.to_string(),
                    group.u32(CTRL_ATTR_MCAST_GRP_ID)?,
                );
            }
        }
        Ok(Self { id: attrs.u16(CTRL_ATTR_FAMILY_ID)?, groups })
    }
}

/// Resolve family `name`
pub fn resolve_family(transport: &Transport, name: &str, timeout: Duration) -> Result<FamilyInfo> {
    let attrs = Attrs::from_iter([Attribute::string(CTRL_ATTR_FAMILY_NAME, name)]);
    let request = GenericMessage::new(GENL_ID_CTRL, CTRL_CMD_GETFAMILY, attrs);
    let replies = transport.request(request, timeout).map_err(|err| match err {
        wifi_hal_vendor::TransportError::Rejected { .. } => Error::FamilyNotFound(name.into()),
        err => err.into(),
    })?;
    let Some(reply) = replies.first() else {
        return Err(Error::FamilyNotFound(name.into()));
    };
    let info = FamilyInfo::from_attrs(&reply.attrs)?;
    debug!("family {} has id {}, groups {:?}", name, info.id, info.groups);
    Ok(info)
}
