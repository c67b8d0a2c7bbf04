//! Source-log coordinates: a tagged sum of GTID set or binlog file/offset.
//!
//! The wire decoding of either form is out of scope for this crate (see the
//! top-level spec) — `GtidSet` is a simple ordered set of opaque transaction
//! id strings, and `BinlogPos` is a plain `(file, offset)` pair. Both support
//! clone, equality, and a stable string form; neither variant is ever
//! compared across the other (mixing positions across a run is a caller
//! error, not something this crate tries to reconcile).

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque set of globally-unique transaction identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet(BTreeSet<String>);

impl GtidSet {
    pub fn empty() -> Self {
        GtidSet(BTreeSet::new())
    }

    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I) -> Self {
        GtidSet(ids.into_iter().collect())
    }

    /// Union with another GTID set, consuming neither.
    pub fn union(&self, other: &GtidSet) -> GtidSet {
        GtidSet(self.0.union(&other.0).cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn parse(s: &str) -> GtidSet {
        if s.is_empty() {
            return GtidSet::empty();
        }
        GtidSet(s.split(',').map(|id| id.trim().to_string()).collect())
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.0.iter().cloned().collect::<Vec<_>>().join(",");
        write!(f, "{joined}")
    }
}

/// A `(file-name, byte-offset)` coordinate in the source's binlog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinlogPos {
    pub file: String,
    pub pos: u32,
}

impl PartialOrd for BinlogPos {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogPos {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file.cmp(&other.file).then(self.pos.cmp(&other.pos))
    }
}

impl fmt::Display for BinlogPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.file, self.pos)
    }
}

/// The variant is fixed at supervisor start from configuration (`gtid_mode`)
/// and never changes within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    Gtid(GtidSet),
    Binlog(BinlogPos),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Gtid(g) => write!(f, "{g}"),
            Position::Binlog(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct GtidDoc {
    gtid: String,
}

#[derive(Serialize, Deserialize)]
struct BinlogDoc {
    name: String,
    pos: u32,
}

impl Position {
    pub fn empty_gtid() -> Position {
        Position::Gtid(GtidSet::empty())
    }

    pub fn zero_binlog() -> Position {
        Position::Binlog(BinlogPos::default())
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Position::Gtid(g) => serde_json::to_value(GtidDoc {
                gtid: g.to_string(),
            })
            .expect("gtid doc always serialisable"),
            Position::Binlog(b) => serde_json::to_value(BinlogDoc {
                name: b.file.clone(),
                pos: b.pos,
            })
            .expect("binlog doc always serialisable"),
        }
    }

    /// Deserialisation requires the caller to know which variant to expect,
    /// selected by `gtid_mode`.
    pub fn from_json(gtid_mode: bool, value: &serde_json::Value) -> Result<Position, PositionError> {
        if gtid_mode {
            let doc: GtidDoc =
                serde_json::from_value(value.clone()).map_err(|e| PositionError::Malformed(e.to_string()))?;
            Ok(Position::Gtid(GtidSet::parse(&doc.gtid)))
        } else {
            let doc: BinlogDoc =
                serde_json::from_value(value.clone()).map_err(|e| PositionError::Malformed(e.to_string()))?;
            Ok(Position::Binlog(BinlogPos {
                file: doc.name,
                pos: doc.pos,
            }))
        }
    }

    /// True when `self` and `other` are the same variant — used by
    /// `mymy-state` to reject a position of the wrong variant being fed back
    /// in (the two variants are never mixed within a single run).
    pub fn same_variant(&self, other: &Position) -> bool {
        matches!(
            (self, other),
            (Position::Gtid(_), Position::Gtid(_)) | (Position::Binlog(_), Position::Binlog(_))
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    #[error("malformed position document: {0}")]
    Malformed(String),
}

/// A position plus a `force` flag, enqueued by the producer whenever the
/// source signals "position advanced."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub position: Position,
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gtid_round_trip() {
        let pos = Position::Gtid(GtidSet::from_ids(["a-1".into(), "b-2".into()]));
        let doc = pos.to_json();
        assert_eq!(doc, serde_json::json!({"gtid": "a-1,b-2"}));
        let back = Position::from_json(true, &doc).unwrap();
        assert_eq!(pos, back);
    }

    #[test]
    fn binlog_round_trip() {
        let pos = Position::Binlog(BinlogPos {
            file: "mysql-bin.000003".into(),
            pos: 4567,
        });
        let doc = pos.to_json();
        assert_eq!(doc, serde_json::json!({"name": "mysql-bin.000003", "pos": 4567}));
        let back = Position::from_json(false, &doc).unwrap();
        assert_eq!(pos, back);
    }

    #[test]
    fn empty_gtid_is_valid() {
        let pos = Position::empty_gtid();
        assert_eq!(pos.to_string(), "");
    }

    #[test]
    fn binlog_pos_compares_file_then_offset() {
        let a = BinlogPos { file: "mysql-bin.000001".into(), pos: 900 };
        let b = BinlogPos { file: "mysql-bin.000002".into(), pos: 100 };
        assert!(a < b);

        let c = BinlogPos { file: "mysql-bin.000001".into(), pos: 100 };
        assert!(c < a);
    }

    #[test]
    fn cross_variant_not_equal() {
        let g = Position::empty_gtid();
        let b = Position::zero_binlog();
        assert_ne!(g, b);
        assert!(!g.same_variant(&b));
    }
}
