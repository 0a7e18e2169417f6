//! Domain models for note sync
//!
//! Notes, region assignments, progress markers and the small state records
//! persisted by the store.

use crate::error::{ErrorClass, Result, SyncError};
use chrono::{DateTime, Utc};
use geo::BoundingRect;
use geo_types::{Coord, LineString, MultiPolygon, Point, Polygon, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type NoteId = i64;
pub type RegionId = i64;

/// WGS84 position of a note
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Result<Self> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(SyncError::DataValidation(format!("latitude out of range: {lat}")));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(SyncError::DataValidation(format!("longitude out of range: {lon}")));
        }
        Ok(Self { lat, lon })
    }

    /// Geometry point in (x = lon, y = lat) order
    pub fn to_point(self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

/// Lifecycle state of a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteStatus {
    Open,
    Closed,
    Hidden,
}

impl NoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteStatus::Open => "open",
            NoteStatus::Closed => "closed",
            NoteStatus::Hidden => "hidden",
        }
    }
}

impl fmt::Display for NoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "open" => Ok(NoteStatus::Open),
            "closed" => Ok(NoteStatus::Closed),
            "hidden" => Ok(NoteStatus::Hidden),
            other => Err(SyncError::DataValidation(format!("invalid note status: {other}"))),
        }
    }
}

/// One entry in a note's discussion thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteComment {
    pub note_id: NoteId,
    pub seq: i32,
    pub action: String,
    pub created_at: DateTime<Utc>,
    pub author: Option<String>,
    pub text: String,
}

/// A note as produced by the feed or the bulk converter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: NoteId,
    pub location: Coordinates,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: NoteStatus,
    #[serde(default)]
    pub comments: Vec<NoteComment>,
}

/// Outcome of spatial assignment
///
/// `KnownUnassigned` means the point was tested and lies in no region (open
/// sea, disputed areas); `Unknown` means it has not been determined yet or
/// was invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "region_id", rename_all = "snake_case")]
pub enum RegionAssignment {
    Assigned(RegionId),
    KnownUnassigned,
    Unknown,
}

impl RegionAssignment {
    /// Column pair `(region_state, region_id)` used by the store
    pub fn to_columns(self) -> (&'static str, Option<RegionId>) {
        match self {
            RegionAssignment::Assigned(id) => ("assigned", Some(id)),
            RegionAssignment::KnownUnassigned => ("unassigned", None),
            RegionAssignment::Unknown => ("unknown", None),
        }
    }

    pub fn from_columns(state: &str, region_id: Option<RegionId>) -> Result<Self> {
        match (state, region_id) {
            ("assigned", Some(id)) => Ok(RegionAssignment::Assigned(id)),
            ("unassigned", None) => Ok(RegionAssignment::KnownUnassigned),
            ("unknown", None) => Ok(RegionAssignment::Unknown),
            (state, id) => Err(SyncError::Consistency(format!(
                "invalid region assignment columns: state={state}, region_id={id:?}"
            ))),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, RegionAssignment::Unknown)
    }
}

/// Canonical-store projection of a note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNote {
    pub id: NoteId,
    pub location: Coordinates,
    pub updated_at: DateTime<Utc>,
    pub status: NoteStatus,
    pub region: RegionAssignment,
}

/// Last durably committed point of the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark(pub DateTime<Utc>);

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Admission token for a rate-limited remote resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub queue: String,
    pub seq: i64,
    pub issued_at: DateTime<Utc>,
}

/// Snapshot of a ticket queue's shared counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    /// Ticket currently allowed to proceed (or next to be issued when idle)
    pub now_serving: i64,
    /// Next sequence number to hand out
    pub next_ticket: i64,
    /// When `now_serving` became current
    pub serving_since: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
    Pending,
    Processing,
    Done,
    Failed,
    Quarantined,
}

impl PartitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionState::Pending => "pending",
            PartitionState::Processing => "processing",
            PartitionState::Done => "done",
            PartitionState::Failed => "failed",
            PartitionState::Quarantined => "quarantined",
        }
    }

    /// Anything but `Done` is re-run when a batch is retried; `Pending` and
    /// `Processing` are left behind by a process that stopped mid-batch
    pub fn needs_run(&self) -> bool {
        !matches!(self, PartitionState::Done)
    }
}

impl FromStr for PartitionState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PartitionState::Pending),
            "processing" => Ok(PartitionState::Processing),
            "done" => Ok(PartitionState::Done),
            "failed" => Ok(PartitionState::Failed),
            "quarantined" => Ok(PartitionState::Quarantined),
            other => Err(SyncError::Consistency(format!("invalid partition state: {other}"))),
        }
    }
}

/// Bounded slice `[start, end)` of a bulk source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Dense 1..N within a batch
    pub id: u32,
    pub start: u64,
    pub end: u64,
    pub state: PartitionState,
}

impl Partition {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// A region boundary with its precomputed bounding box
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    pub boundary: MultiPolygon<f64>,
    pub bbox: Rect<f64>,
}

impl Region {
    pub fn new(id: RegionId, name: impl Into<String>, boundary: MultiPolygon<f64>) -> Result<Self> {
        let bbox = boundary
            .bounding_rect()
            .ok_or_else(|| SyncError::DataValidation(format!("region {id} has an empty boundary")))?;
        Ok(Self {
            id,
            name: name.into(),
            boundary,
            bbox,
        })
    }

    /// Axis-aligned rectangle region, handy for fixtures
    pub fn rect(id: RegionId, name: &str, min: (f64, f64), max: (f64, f64)) -> Result<Self> {
        let rect = Rect::new(Coord { x: min.0, y: min.1 }, Coord { x: max.0, y: max.1 });
        Self::new(id, name, MultiPolygon::new(vec![rect.to_polygon()]))
    }
}

/// Wire and storage form of a region boundary
///
/// `polygons[i][0]` is the exterior ring of polygon `i`, further rings are
/// holes; positions are `[lon, lat]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionBoundary {
    pub id: RegionId,
    pub name: String,
    pub polygons: Vec<Vec<Vec<[f64; 2]>>>,
}

impl RegionBoundary {
    pub fn into_region(self) -> Result<Region> {
        let mut polygons = Vec::with_capacity(self.polygons.len());
        for rings in self.polygons {
            let mut rings = rings.into_iter().map(|ring| {
                LineString::from(ring.into_iter().map(|[x, y]| Coord { x, y }).collect::<Vec<_>>())
            });
            let exterior = rings.next().ok_or_else(|| {
                SyncError::DataValidation(format!("region {} has a polygon without rings", self.id))
            })?;
            polygons.push(Polygon::new(exterior, rings.collect()));
        }
        Region::new(self.id, self.name, MultiPolygon::new(polygons))
    }

    pub fn from_region(region: &Region) -> Self {
        let ring = |ls: &LineString<f64>| ls.coords().map(|c| [c.x, c.y]).collect::<Vec<_>>();
        Self {
            id: region.id,
            name: region.name.clone(),
            polygons: region
                .boundary
                .iter()
                .map(|p| {
                    std::iter::once(ring(p.exterior()))
                        .chain(p.interiors().iter().map(ring))
                        .collect()
                })
                .collect(),
        }
    }
}

/// Controller state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Deciding,
    DirectApply,
    TriggerBulkSync,
    Committing,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Deciding => "deciding",
            SyncPhase::DirectApply => "direct_apply",
            SyncPhase::TriggerBulkSync => "trigger_bulk_sync",
            SyncPhase::Committing => "committing",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one controller cycle, as recorded in the status record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Applied,
    BulkSynced,
    NoWork,
    Failed,
}

/// Persisted sync status, queryable while the daemon runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusRecord {
    pub instance: String,
    pub phase: SyncPhase,
    pub last_outcome: Option<CycleOutcome>,
    pub last_error_class: Option<ErrorClass>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub watermark: Option<Watermark>,
    pub updated_at: DateTime<Utc>,
}

impl SyncStatusRecord {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            phase: SyncPhase::Idle,
            last_outcome: None,
            last_error_class: None,
            last_error: None,
            consecutive_failures: 0,
            watermark: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use geo::Contains;

    #[test]
    fn test_coordinates_validation() {
        assert!(Coordinates::new(45.0, 7.0).is_ok());
        assert!(Coordinates::new(91.0, 7.0).is_err());
        assert!(Coordinates::new(0.0, -180.5).is_err());
        assert!(Coordinates::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_region_assignment_columns() {
        for assignment in [
            RegionAssignment::Assigned(42),
            RegionAssignment::KnownUnassigned,
            RegionAssignment::Unknown,
        ] {
            let (state, id) = assignment.to_columns();
            assert_eq!(RegionAssignment::from_columns(state, id).unwrap(), assignment);
        }
        assert!(RegionAssignment::from_columns("assigned", None).is_err());
        assert!(RegionAssignment::from_columns("unknown", Some(3)).is_err());
    }

    #[test]
    fn test_region_boundary_keeps_holes() {
        let boundary = RegionBoundary {
            id: 7,
            name: "ring".into(),
            polygons: vec![vec![
                vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]],
                vec![[4.0, 4.0], [6.0, 4.0], [6.0, 6.0], [4.0, 6.0], [4.0, 4.0]],
            ]],
        };
        let region = boundary.clone().into_region().unwrap();

        assert!(region.boundary.contains(&Point::new(1.0, 1.0)));
        assert!(!region.boundary.contains(&Point::new(5.0, 5.0)));
        assert_eq!(region.bbox.max(), Coord { x: 10.0, y: 10.0 });
        assert_eq!(RegionBoundary::from_region(&region), boundary);
    }

    #[test]
    fn test_empty_boundary_rejected() {
        let err = Region::new(1, "empty", MultiPolygon::new(vec![])).unwrap_err();
        assert_eq!(err.class(), ErrorClass::DataValidation);
    }

    #[test]
    fn test_watermark_ordering() {
        let earlier = Watermark("2024-01-01T00:00:00Z".parse().unwrap());
        let later = Watermark("2024-06-01T00:00:00Z".parse().unwrap());
        assert!(earlier < later);
        assert_eq!(earlier.max(later), later);
    }
}
