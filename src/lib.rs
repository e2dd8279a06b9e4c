/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

#![doc = include_str!("../README.md")]
#![deny(unstable_features)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(clippy::empty_loop)]
#![deny(unreachable_code)]
#![deny(unreachable_patterns)]
#![deny(unused_macro_rules)]
#![deny(unused_doc_comments)]

pub mod bag;
pub mod daemon;
pub mod dedupe;
pub mod fields;
pub mod flow;
pub mod io;
pub mod ipset;
pub mod pmap;
pub mod shutdown;
pub mod sorter;
pub mod spool;

#[cfg(feature = "cli")]
pub mod cli;

pub mod prelude {
    pub use crate::bag::{Bag, BagReader, KeyType};
    pub use crate::dedupe::{DedupeConfig, Deduper};
    pub use crate::fields::{FieldKind, FieldProvider, KeyExtractor};
    pub use crate::flow::{FlowRecord, TcpFlags};
    pub use crate::io::{IpPolicy, Metadata, RecordReader, RecordWriter};
    pub use crate::ipset::IpSet;
    pub use crate::pmap::{PmapContent, PrefixMap};
    pub use crate::sorter::{ExternalSorter, SorterConfig};
    pub use crate::spool::TempSpool;
}
