//! Deadline-unit resolution for payment-supplied timestamps.
//!
//! Payment responses report their "submit result by" deadline as a bare
//! integer whose unit is not part of the wire contract: observed values have
//! been Unix seconds, Unix milliseconds, and blockchain slot numbers. The
//! unit is guessed by magnitude relative to the current time, and slot
//! numbers are converted using the network's genesis time and 1-second slot
//! length. This is a heuristic to preserve as-is until the upstream contract
//! pins the unit down; see DESIGN.md.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Shelley-era genesis of the mainnet chain, Unix seconds.
const MAINNET_GENESIS: i64 = 1_596_059_091;

/// Genesis of the preprod test chain, Unix seconds.
const PREPROD_GENESIS: i64 = 1_654_041_600;

/// How far behind `now` a value may sit and still read as a timestamp.
const PLAUSIBLE_PAST: i64 = 24 * 60 * 60;

/// How far ahead of `now` a value may sit and still read as a timestamp.
/// Payment deadlines are hours to days out; a year is generous.
const PLAUSIBLE_FUTURE: i64 = 366 * 24 * 60 * 60;

/// The blockchain network the payment service settles on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Preprod,
}

impl Network {
    /// Genesis time of the network; slot `n` begins at `genesis + n` seconds.
    pub fn genesis(&self) -> DateTime<Utc> {
        let secs = match self {
            Network::Mainnet => MAINNET_GENESIS,
            Network::Preprod => PREPROD_GENESIS,
        };
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    /// Parse from a config string; anything that is not "mainnet" is preprod.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("mainnet") {
            Network::Mainnet
        } else {
            Network::Preprod
        }
    }
}

impl core::fmt::Display for Network {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Preprod => write!(f, "preprod"),
        }
    }
}

fn plausible_timestamp(secs: i64, now: DateTime<Utc>) -> bool {
    let now_secs = now.timestamp();
    secs >= now_secs - PLAUSIBLE_PAST && secs <= now_secs + PLAUSIBLE_FUTURE
}

/// Resolve a raw deadline value into an absolute instant.
///
/// Tried in order:
/// 1. Unix seconds, if the value lands near the present.
/// 2. Unix milliseconds, if the value divided by 1000 lands near the present.
/// 3. Otherwise a slot number: `genesis + raw` seconds.
pub fn resolve_deadline(raw: i64, now: DateTime<Utc>, network: Network) -> DateTime<Utc> {
    if plausible_timestamp(raw, now) {
        return Utc.timestamp_opt(raw, 0).single().unwrap_or(now);
    }

    let as_millis = raw / 1000;
    if plausible_timestamp(as_millis, now) {
        return Utc.timestamp_opt(as_millis, 0).single().unwrap_or(now);
    }

    network
        .genesis()
        .checked_add_signed(Duration::seconds(raw.max(0)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
