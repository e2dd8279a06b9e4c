/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Building bags from record streams.
//!
//! One pass over the input feeds every configured request: each record is
//! mapped through the request's key extractor (a record field, a country
//! lookup, or a prefix-map lookup) and its counter contribution (one per
//! record, or the packet or byte count) is added to the request's bag.

use super::{AddStatus, Bag, KeyType};
use crate::flow::{ip_to_u128, u128_is_v4, FlowRecord};
use crate::io::{is_stdio, Metadata};
use crate::pmap::{PmapContent, PrefixMap};
use anyhow::{bail, ensure, Context, Result};
use std::path::PathBuf;

/// Which end of the conversation an address-derived key uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Src,
    Dst,
}

/// The key half of a `--bag-file=KEY,COUNTER,PATH` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BagKey {
    Sip,
    Dip,
    Nhip,
    Sport,
    Dport,
    Proto,
    Packets,
    Bytes,
    Flags,
    InitFlags,
    RestFlags,
    TcpState,
    Application,
    Sensor,
    Input,
    Output,
    /// Start time, in epoch seconds.
    Stime,
    /// End time, in epoch seconds.
    Etime,
    /// Duration, in seconds.
    Dur,
    /// Country code of the source or destination address.
    Country(Side),
    /// IP prefix-map value of the source or destination address.
    IpPmap(Side),
    /// Proto/port prefix-map value of the source or destination port.
    PortPmap(Side),
}

impl BagKey {
    pub fn parse(name: &str) -> Result<BagKey> {
        Ok(match name.trim().to_ascii_lowercase().as_str() {
            "sip" => BagKey::Sip,
            "dip" => BagKey::Dip,
            "nhip" => BagKey::Nhip,
            "sport" => BagKey::Sport,
            "dport" => BagKey::Dport,
            "proto" | "protocol" => BagKey::Proto,
            "packets" => BagKey::Packets,
            "bytes" => BagKey::Bytes,
            "flags" => BagKey::Flags,
            "init-flags" => BagKey::InitFlags,
            "rest-flags" => BagKey::RestFlags,
            "tcp-state" => BagKey::TcpState,
            "application" => BagKey::Application,
            "sensor" => BagKey::Sensor,
            "in" | "input" => BagKey::Input,
            "out" | "output" => BagKey::Output,
            "stime" => BagKey::Stime,
            "etime" => BagKey::Etime,
            "dur" | "duration" => BagKey::Dur,
            "sip-country" => BagKey::Country(Side::Src),
            "dip-country" => BagKey::Country(Side::Dst),
            "sip-pmap" => BagKey::IpPmap(Side::Src),
            "dip-pmap" => BagKey::IpPmap(Side::Dst),
            "sport-pmap" => BagKey::PortPmap(Side::Src),
            "dport-pmap" => BagKey::PortPmap(Side::Dst),
            other => bail!("Unknown bag key {:?}", other),
        })
    }

    /// The key type the request's bag starts with; IP bags may widen.
    fn key_type(&self) -> KeyType {
        match self {
            BagKey::Sip | BagKey::Dip | BagKey::Nhip => KeyType::Ipv4,
            BagKey::Proto
            | BagKey::Flags
            | BagKey::InitFlags
            | BagKey::RestFlags
            | BagKey::TcpState => KeyType::U8,
            BagKey::Sport
            | BagKey::Dport
            | BagKey::Application
            | BagKey::Sensor
            | BagKey::Input
            | BagKey::Output => KeyType::U16,
            // Times, pmap values, and country codes share the 32-bit path.
            BagKey::Packets
            | BagKey::Bytes
            | BagKey::Stime
            | BagKey::Etime
            | BagKey::Dur
            | BagKey::Country(_)
            | BagKey::IpPmap(_)
            | BagKey::PortPmap(_) => KeyType::U32,
        }
    }

    fn needs_pmap(&self) -> Option<PmapNeed> {
        match self {
            BagKey::Country(_) => Some(PmapNeed::Country),
            BagKey::IpPmap(_) => Some(PmapNeed::Ip),
            BagKey::PortPmap(_) => Some(PmapNeed::ProtoPort),
            _ => None,
        }
    }

    fn side(&self) -> Option<Side> {
        match self {
            BagKey::Country(side) | BagKey::IpPmap(side) | BagKey::PortPmap(side) => Some(*side),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PmapNeed {
    Country,
    Ip,
    ProtoPort,
}

/// The counter half of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BagCounter {
    Records,
    SumPackets,
    SumBytes,
}

impl BagCounter {
    pub fn parse(name: &str) -> Result<BagCounter> {
        Ok(match name.trim().to_ascii_lowercase().as_str() {
            "records" | "flows" => BagCounter::Records,
            "sum-packets" | "packets" => BagCounter::SumPackets,
            "sum-bytes" | "bytes" => BagCounter::SumBytes,
            other => bail!("Unknown bag counter {:?}", other),
        })
    }

    fn value(self, rec: &FlowRecord) -> u64 {
        match self {
            BagCounter::Records => 1,
            BagCounter::SumPackets => rec.packets as u64,
            BagCounter::SumBytes => rec.bytes as u64,
        }
    }
}

/// One `--bag-file=KEY,COUNTER,PATH` request.
#[derive(Debug, Clone)]
pub struct BagRequest {
    pub key: BagKey,
    /// Prefix-map name, when several maps are loaded.
    pub map_name: Option<String>,
    pub counter: BagCounter,
    pub output: PathBuf,
}

impl BagRequest {
    /// Parses `KEY[:MAPNAME],COUNTER,PATH`.
    pub fn parse(text: &str) -> Result<BagRequest> {
        let mut parts = text.splitn(3, ',');
        let (Some(key_text), Some(counter_text), Some(path)) =
            (parts.next(), parts.next(), parts.next())
        else {
            bail!("Bag request {:?} is not KEY,COUNTER,PATH", text);
        };
        let (key_text, map_name) = match key_text.split_once(':') {
            Some((key, map)) => (key, Some(map.trim().to_owned())),
            None => (key_text, None),
        };
        let key = BagKey::parse(key_text)?;
        ensure!(
            key.needs_pmap().is_some() || map_name.is_none(),
            "Key {:?} does not take a prefix-map name",
            key_text.trim()
        );
        Ok(BagRequest {
            key,
            map_name,
            counter: BagCounter::parse(counter_text)?,
            output: PathBuf::from(path),
        })
    }
}

struct Slot {
    request: BagRequest,
    bag: Bag,
    /// Index into the pipeline's map list, for pmap-derived keys.
    map: Option<usize>,
    overflow_logged: bool,
}

/// Reads records once and feeds every configured bag.
pub struct BagPipeline {
    slots: Vec<Slot>,
    pmaps: Vec<PrefixMap>,
    country: Option<PrefixMap>,
}

impl BagPipeline {
    /// Validates the requests against the loaded maps: pmap keys must
    /// reference a loaded map of the matching content type, and at most
    /// one request may write to standard output.
    pub fn new(
        requests: Vec<BagRequest>,
        pmaps: Vec<PrefixMap>,
        country: Option<PrefixMap>,
    ) -> Result<Self> {
        ensure!(!requests.is_empty(), "No bags requested");
        let stdout_sinks = requests
            .iter()
            .filter(|request| is_stdio(&request.output))
            .count();
        ensure!(
            stdout_sinks <= 1,
            "At most one bag may be written to standard output"
        );
        if let Some(map) = &country {
            ensure!(
                map.content().is_ip(),
                "The country map must be an IP prefix map"
            );
        }
        let mut slots = Vec::with_capacity(requests.len());
        for request in requests {
            let map = match request.key.needs_pmap() {
                None => None,
                Some(PmapNeed::Country) => {
                    ensure!(
                        country.is_some(),
                        "Key of {} needs --country-file",
                        request.output.display()
                    );
                    None
                }
                Some(need) => {
                    let wanted = match need {
                        PmapNeed::Ip => PmapContent::Ipv4,
                        _ => PmapContent::ProtoPort,
                    };
                    let matches_content = |map: &PrefixMap| match need {
                        PmapNeed::Ip => map.content().is_ip(),
                        _ => map.content() == PmapContent::ProtoPort,
                    };
                    let index = match &request.map_name {
                        Some(name) => pmaps
                            .iter()
                            .position(|map| map.name() == name)
                            .with_context(|| format!("No prefix map named {:?} loaded", name))?,
                        None => {
                            let mut candidates =
                                pmaps.iter().enumerate().filter(|(_, m)| matches_content(m));
                            let (index, _) = candidates.next().with_context(|| {
                                format!("Key of {} needs --pmap-file", request.output.display())
                            })?;
                            ensure!(
                                candidates.next().is_none(),
                                "Several prefix maps loaded; qualify the key as KEY:MAPNAME"
                            );
                            index
                        }
                    };
                    ensure!(
                        matches_content(&pmaps[index]),
                        "Prefix map {:?} has the wrong content type for {:?} keys ({:?} needed)",
                        pmaps[index].name(),
                        request.key,
                        wanted
                    );
                    Some(index)
                }
            };
            let bag = Bag::new(request.key.key_type());
            slots.push(Slot {
                request,
                bag,
                map,
                overflow_logged: false,
            });
        }
        Ok(BagPipeline {
            slots,
            pmaps,
            country,
        })
    }

    /// Adds one record to every bag.
    pub fn process(&mut self, rec: &FlowRecord) -> Result<()> {
        for slot in &mut self.slots {
            let map = slot.map.map(|index| &self.pmaps[index]);
            let Some(key) = compute_key(&slot.request.key, rec, map, self.country.as_ref()) else {
                continue;
            };
            if slot.bag.key_type() == KeyType::Ipv4 && !u128_is_v4(key) {
                slot.bag.promote(KeyType::Ipv6)?;
            }
            if let AddStatus::Overflow = slot.bag.insert_or_add(key, slot.request.counter.value(rec))
            {
                if !slot.overflow_logged {
                    log::warn!(
                        "Counter overflow in bag {}; counters saturated",
                        slot.request.output.display()
                    );
                    slot.overflow_logged = true;
                }
            }
        }
        Ok(())
    }

    /// Writes every bag to its configured sink with the given metadata.
    pub fn finish(self, metadata: &Metadata) -> Result<()> {
        for slot in self.slots {
            slot.bag
                .write(&slot.request.output, metadata)
                .with_context(|| {
                    format!("Could not write bag {}", slot.request.output.display())
                })?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn bag(&self, index: usize) -> &Bag {
        &self.slots[index].bag
    }
}

fn compute_key(
    key: &BagKey,
    rec: &FlowRecord,
    map: Option<&PrefixMap>,
    country: Option<&PrefixMap>,
) -> Option<u128> {
    let side_addr = |key: &BagKey| match key.side() {
        Some(Side::Src) => rec.sip,
        _ => rec.dip,
    };
    Some(match key {
        BagKey::Sip => ip_to_u128(rec.sip),
        BagKey::Dip => ip_to_u128(rec.dip),
        BagKey::Nhip => ip_to_u128(rec.nhip),
        BagKey::Sport => rec.sport as u128,
        BagKey::Dport => rec.dport as u128,
        BagKey::Proto => rec.proto as u128,
        BagKey::Packets => rec.packets as u128,
        BagKey::Bytes => rec.bytes as u128,
        BagKey::Flags => rec.flags.bits() as u128,
        BagKey::InitFlags => rec.init_flags.bits() as u128,
        BagKey::RestFlags => rec.rest_flags.bits() as u128,
        BagKey::TcpState => rec.tcp_state as u128,
        BagKey::Application => rec.application as u128,
        BagKey::Sensor => rec.sensor as u128,
        BagKey::Input => rec.input as u128,
        BagKey::Output => rec.output as u128,
        BagKey::Stime => (rec.stime_ms / 1000) as u128,
        BagKey::Etime => (rec.etime_ms() / 1000) as u128,
        BagKey::Dur => (rec.dur_ms / 1000) as u128,
        BagKey::Country(_) => country?.lookup_ip(side_addr(key))? as u128,
        BagKey::IpPmap(_) => map?.lookup_ip(side_addr(key))? as u128,
        BagKey::PortPmap(_) => {
            let port = match key.side() {
                Some(Side::Src) => rec.sport,
                _ => rec.dport,
            };
            map?.lookup_proto_port(rec.proto, port)? as u128
        }
    })
}
