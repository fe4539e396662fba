//! Translation between host and container user and group IDs.

use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::Result;

/// One contiguous range of an ID mapping, in the same sense as a line of
/// `/proc/<pid>/uid_map`: `size` IDs starting at `container_id` inside the
/// container correspond to IDs starting at `host_id` outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMap {
    /// First ID of the range as seen in the container.
    pub container_id: u32,
    /// First ID of the range as seen on the host.
    pub host_id: u32,
    /// Number of IDs in the range.
    pub size: u32,
}

impl IdMap {
    fn translate(&self, id: u32, from: u32, to: u32) -> Option<u32> {
        let offset = u64::from(id).checked_sub(u64::from(from))?;
        if offset >= u64::from(self.size) {
            return None;
        }
        u32::try_from(u64::from(to) + offset).ok()
    }
}

impl FromStr for IdMap {
    type Err = anyhow::Error;

    /// Parse `container:host:size`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let mut next = |what: &str| -> Result<u32> {
            let v = parts
                .next()
                .ok_or_else(|| anyhow!("Missing {what} in ID map {s:?}"))?;
            v.parse()
                .with_context(|| format!("Parsing {what} in ID map {s:?}"))
        };
        Ok(Self {
            container_id: next("container ID")?,
            host_id: next("host ID")?,
            size: next("size")?,
        })
    }
}

/// A user and group ID pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPair {
    /// User ID
    pub uid: u32,
    /// Group ID
    pub gid: u32,
}

impl FromStr for IdPair {
    type Err = anyhow::Error;

    /// Parse `uid:gid`.
    fn from_str(s: &str) -> Result<Self> {
        let (uid, gid) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("Expected uid:gid, found {s:?}"))?;
        Ok(Self {
            uid: uid.parse().with_context(|| format!("Parsing uid in {s:?}"))?,
            gid: gid.parse().with_context(|| format!("Parsing gid in {s:?}"))?,
        })
    }
}

/// UID and GID mappings used together.  An empty list for either means
/// IDs of that kind pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMappings {
    uid_map: Vec<IdMap>,
    gid_map: Vec<IdMap>,
}

impl IdMappings {
    /// Combine UID and GID mappings.
    pub fn new(uid_map: Vec<IdMap>, gid_map: Vec<IdMap>) -> Self {
        Self { uid_map, gid_map }
    }

    /// True if neither mapping has any ranges.
    pub fn is_empty(&self) -> bool {
        self.uid_map.is_empty() && self.gid_map.is_empty()
    }

    /// Map container IDs to host IDs.
    pub fn to_host(&self, ids: IdPair) -> Result<IdPair> {
        let uid = map_id(&self.uid_map, ids.uid, |m| (m.container_id, m.host_id))
            .ok_or_else(|| anyhow!("Container UID {} has no host mapping", ids.uid))?;
        let gid = map_id(&self.gid_map, ids.gid, |m| (m.container_id, m.host_id))
            .ok_or_else(|| anyhow!("Container GID {} has no host mapping", ids.gid))?;
        Ok(IdPair { uid, gid })
    }

    /// Map host IDs to container IDs.
    pub fn to_container(&self, ids: IdPair) -> Result<IdPair> {
        let uid = map_id(&self.uid_map, ids.uid, |m| (m.host_id, m.container_id))
            .ok_or_else(|| anyhow!("Host UID {} has no container mapping", ids.uid))?;
        let gid = map_id(&self.gid_map, ids.gid, |m| (m.host_id, m.container_id))
            .ok_or_else(|| anyhow!("Host GID {} has no container mapping", ids.gid))?;
        Ok(IdPair { uid, gid })
    }
}

/// The first range containing `id` wins.
fn map_id(maps: &[IdMap], id: u32, direction: impl Fn(&IdMap) -> (u32, u32)) -> Option<u32> {
    if maps.is_empty() {
        return Some(id);
    }
    maps.iter().find_map(|m| {
        let (from, to) = direction(m);
        m.translate(id, from, to)
    })
}
