//! GTID set algebra.
//!
//! A `GtidSet` maps each source server UUID to an ordered list of closed
//! integer intervals of transaction sequence numbers. The incremental engine
//! updates it once per GTID event, so `set` is allocation-free on the hot
//! path (a sequentially committing source only ever extends the last
//! interval).

use std::collections::BTreeMap;
use std::fmt;

use mysql_async::{GnoInterval, Sid};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::core::error::{CoreError, CoreResult};

/// A closed interval `[start, end]` of GNOs, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GnoRange {
    pub start: u64,
    pub end: u64,
}

impl GnoRange {
    fn parse(s: &str) -> CoreResult<Self> {
        let s = s.trim();
        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (a, b),
            // MySQL prints singleton intervals without the dash
            None => (s, s),
        };
        let start: u64 = start
            .parse()
            .map_err(|_| CoreError::position_error(format!("bad GTID interval '{}'", s)))?;
        let end: u64 = end
            .parse()
            .map_err(|_| CoreError::position_error(format!("bad GTID interval '{}'", s)))?;
        if start > end || start == 0 {
            return Err(CoreError::position_error(format!(
                "bad GTID interval '{}'",
                s
            )));
        }
        Ok(GnoRange { start, end })
    }
}

impl fmt::Display for GnoRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Union of GTIDs, kept per source UUID as an ordered interval list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    ranges: BTreeMap<Uuid, Vec<GnoRange>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the map form `{ uuid: ["start-end", ...] }`, the shape the
    /// metadata store persists. Malformed UUIDs or intervals are rejected.
    pub fn parse(map: &BTreeMap<String, Vec<String>>) -> CoreResult<Self> {
        let mut ranges = BTreeMap::new();
        for (uuid, intervals) in map {
            let uuid = Uuid::parse_str(uuid.trim())
                .map_err(|_| CoreError::position_error(format!("bad source UUID '{}'", uuid)))?;
            let mut parsed = intervals
                .iter()
                .map(|s| GnoRange::parse(s))
                .collect::<CoreResult<Vec<_>>>()?;
            parsed.sort();
            ranges.insert(uuid, parsed);
        }
        Ok(GtidSet { ranges })
    }

    /// Parse the textual form. Accepts both this module's serialization
    /// (`uuid:1-2,4-4,uuid2:10-10`, intervals comma-separated) and the
    /// `@@GLOBAL.gtid_executed` flavor (`uuid:1-2:4-4,uuid2:10-10`, intervals
    /// colon-separated), with embedded newlines stripped.
    pub fn parse_str(input: &str) -> CoreResult<Self> {
        let cleaned = input.replace(['\n', '\r'], "");
        let mut ranges: BTreeMap<Uuid, Vec<GnoRange>> = BTreeMap::new();
        let mut current: Option<Uuid> = None;

        for token in cleaned.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if token.contains(':') {
                // A new UUID section, optionally followed by colon-separated
                // intervals.
                let mut parts = token.split(':');
                let uuid_str = parts.next().unwrap_or_default();
                let uuid = Uuid::parse_str(uuid_str.trim()).map_err(|_| {
                    CoreError::position_error(format!("bad source UUID '{}'", uuid_str))
                })?;
                let entry = ranges.entry(uuid).or_default();
                for interval in parts {
                    entry.push(GnoRange::parse(interval)?);
                }
                current = Some(uuid);
            } else {
                // A bare interval belongs to the most recent UUID section.
                let uuid = current.ok_or_else(|| {
                    CoreError::position_error(format!("interval '{}' without a UUID", token))
                })?;
                ranges
                    .entry(uuid)
                    .or_default()
                    .push(GnoRange::parse(token)?);
            }
        }

        for intervals in ranges.values_mut() {
            intervals.sort();
        }
        Ok(GtidSet { ranges })
    }

    /// Record one observed GTID. Extends the last interval of that UUID when
    /// `gno` is its immediate successor, otherwise appends a new singleton
    /// interval (including non-monotonic arrivals; merging across gaps is not
    /// attempted).
    pub fn set(&mut self, uuid: Uuid, gno: u64) {
        let intervals = self.ranges.entry(uuid).or_default();
        if let Some(last) = intervals.last_mut() {
            if last.end + 1 == gno {
                last.end = gno;
                return;
            }
        }
        intervals.push(GnoRange {
            start: gno,
            end: gno,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of source UUIDs in the set.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self, uuid: &Uuid) -> Option<&[GnoRange]> {
        self.ranges.get(uuid).map(|v| v.as_slice())
    }

    /// SID blocks for a `COM_BINLOG_DUMP_GTID` request. Wire intervals are
    /// half-open, hence the `end + 1`.
    pub fn sids(&self) -> Vec<Sid<'static>> {
        self.ranges
            .iter()
            .map(|(uuid, intervals)| {
                let mut sid = Sid::new(*uuid.as_bytes());
                for r in intervals {
                    sid = sid.with_interval(GnoInterval::new(r.start, r.end + 1));
                }
                sid
            })
            .collect()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first_uuid = true;
        for (uuid, intervals) in &self.ranges {
            if !first_uuid {
                f.write_str(",")?;
            }
            first_uuid = false;
            write!(f, "{}:", uuid)?;
            for (i, r) in intervals.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}", r)?;
            }
        }
        Ok(())
    }
}

impl Serialize for GtidSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.ranges.len()))?;
        for (uuid, intervals) in &self.ranges {
            let intervals: Vec<String> = intervals.iter().map(|r| r.to_string()).collect();
            map.serialize_entry(uuid, &intervals)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for GtidSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, Vec<String>>::deserialize(deserializer)?;
        GtidSet::parse(&map).map_err(D::Error::custom)
    }
}
