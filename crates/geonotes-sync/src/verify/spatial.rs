//! Point-to-region resolution
//!
//! A uniform lat/lon grid maps each cell to the regions whose bounding box
//! touches it. Resolving a point looks up its cell, keeps only the regions
//! whose bounding box holds the point, and runs the exact polygon test on
//! those survivors alone. Points on a region's edge belong to it.

use crate::error::{Result, SyncError};
use crate::models::{Coordinates, Region, RegionAssignment, RegionId};
use geo::Intersects;
use geo_types::{Point, Rect};
use std::collections::HashMap;

/// Counters for how points were resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    /// Points confirmed against their current region by key lookup
    pub fast_path_hits: u64,
    /// Points that needed a search over the grid
    pub full_searches: u64,
    /// Candidates that survived the bounding-box filter
    pub bbox_candidates: u64,
    /// Exact polygon containment tests run
    pub exact_tests: u64,
}

impl ResolveStats {
    pub fn merge(&mut self, other: ResolveStats) {
        self.fast_path_hits += other.fast_path_hits;
        self.full_searches += other.full_searches;
        self.bbox_candidates += other.bbox_candidates;
        self.exact_tests += other.exact_tests;
    }
}

type Cell = (i32, i32);

pub struct RegionIndex {
    regions: HashMap<RegionId, Region>,
    cells: HashMap<Cell, Vec<RegionId>>,
    cell_degrees: f64,
}

impl RegionIndex {
    pub fn build(regions: Vec<Region>, cell_degrees: f64) -> Result<Self> {
        if !(cell_degrees.is_finite() && cell_degrees > 0.0) {
            return Err(SyncError::Config(format!("grid cell size must be positive, got {cell_degrees}")));
        }

        let mut index = Self {
            regions: HashMap::with_capacity(regions.len()),
            cells: HashMap::new(),
            cell_degrees,
        };
        for region in regions {
            let (min_x, min_y) = index.cell_of(region.bbox.min().x, region.bbox.min().y);
            let (max_x, max_y) = index.cell_of(region.bbox.max().x, region.bbox.max().y);
            for x in min_x..=max_x {
                for y in min_y..=max_y {
                    index.cells.entry((x, y)).or_default().push(region.id);
                }
            }
            index.regions.insert(region.id, region);
        }
        for ids in index.cells.values_mut() {
            ids.sort_unstable();
            ids.dedup();
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn cell_of(&self, lon: f64, lat: f64) -> Cell {
        (
            ((lon + 180.0) / self.cell_degrees).floor() as i32,
            ((lat + 90.0) / self.cell_degrees).floor() as i32,
        )
    }

    /// Region a point belongs to
    ///
    /// With a `hint`, the hinted region is tested first by direct lookup and
    /// the grid is only searched if it no longer contains the point. Ties
    /// between overlapping regions go to the lowest id.
    pub fn resolve(&self, location: Coordinates, hint: Option<RegionId>, stats: &mut ResolveStats) -> RegionAssignment {
        let point = location.to_point();

        if let Some(region) = hint.and_then(|id| self.regions.get(&id)) {
            stats.exact_tests += 1;
            if region.boundary.intersects(&point) {
                stats.fast_path_hits += 1;
                return RegionAssignment::Assigned(region.id);
            }
        }

        stats.full_searches += 1;
        let Some(candidates) = self.cells.get(&self.cell_of(point.x(), point.y())) else {
            return RegionAssignment::KnownUnassigned;
        };
        for id in candidates {
            let Some(region) = self.regions.get(id) else {
                continue;
            };
            if Some(*id) == hint || !rect_contains(&region.bbox, &point) {
                continue;
            }
            stats.bbox_candidates += 1;
            stats.exact_tests += 1;
            if region.boundary.intersects(&point) {
                return RegionAssignment::Assigned(*id);
            }
        }
        RegionAssignment::KnownUnassigned
    }
}

fn rect_contains(rect: &Rect<f64>, point: &Point<f64>) -> bool {
    let (min, max) = (rect.min(), rect.max());
    point.x() >= min.x && point.x() <= max.x && point.y() >= min.y && point.y() <= max.y
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn at(lat: f64, lon: f64) -> Coordinates {
        Coordinates::new(lat, lon).unwrap()
    }

    fn index() -> RegionIndex {
        RegionIndex::build(
            vec![
                Region::rect(1, "west", (0.0, 0.0), (10.0, 10.0)).unwrap(),
                Region::rect(2, "east", (10.0, 0.0), (20.0, 10.0)).unwrap(),
                Region::rect(3, "overlap", (5.5, 5.5), (15.0, 15.0)).unwrap(),
                Region::rect(4, "far", (100.0, -40.0), (110.0, -30.0)).unwrap(),
            ],
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn test_fast_path_confirms_current_region() {
        let index = index();
        let mut stats = ResolveStats::default();

        let resolved = index.resolve(at(2.0, 2.0), Some(1), &mut stats);

        assert_eq!(resolved, RegionAssignment::Assigned(1));
        assert_eq!(stats.fast_path_hits, 1);
        assert_eq!(stats.full_searches, 0);
    }

    #[test]
    fn test_mismatch_falls_back_to_search() {
        let index = index();
        let mut stats = ResolveStats::default();

        let resolved = index.resolve(at(2.0, 18.0), Some(1), &mut stats);

        assert_eq!(resolved, RegionAssignment::Assigned(2));
        assert_eq!(stats.fast_path_hits, 0);
        assert_eq!(stats.full_searches, 1);
    }

    #[test]
    fn test_exact_tests_only_on_bbox_survivors() {
        let index = index();
        let mut stats = ResolveStats::default();

        // Cell holds west and overlap; only west's box holds the point
        assert_eq!(index.resolve(at(5.2, 5.2), None, &mut stats), RegionAssignment::Assigned(1));
        assert_eq!(stats.exact_tests, stats.bbox_candidates);
        assert!(stats.exact_tests < index.len() as u64);
    }

    #[test]
    fn test_overlap_prefers_lowest_id() {
        let index = index();
        let mut stats = ResolveStats::default();
        assert_eq!(index.resolve(at(7.0, 7.0), None, &mut stats), RegionAssignment::Assigned(1));
    }

    #[test]
    fn test_point_on_shared_edge_is_assigned() {
        let index = index();
        let mut stats = ResolveStats::default();

        // lon 10 is the border between west and east
        assert_eq!(index.resolve(at(5.0, 10.0), None, &mut stats), RegionAssignment::Assigned(1));
        assert_eq!(index.resolve(at(5.0, 10.0), Some(2), &mut stats), RegionAssignment::Assigned(2));
        assert_eq!(index.resolve(at(0.0, 0.0), None, &mut stats), RegionAssignment::Assigned(1));
    }

    #[test]
    fn test_outside_every_region_is_known_unassigned() {
        let index = index();
        let mut stats = ResolveStats::default();
        assert_eq!(index.resolve(at(-50.0, -120.0), None, &mut stats), RegionAssignment::KnownUnassigned);
        assert_eq!(index.resolve(at(30.0, 30.0), Some(99), &mut stats), RegionAssignment::KnownUnassigned);
    }

    #[test]
    fn test_invalid_cell_size() {
        assert!(RegionIndex::build(Vec::new(), 0.0).is_err());
    }
}
