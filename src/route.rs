//! # Route Model
//!
//! An immutable, densified polyline with cumulative distance, elevation and
//! elevation change at every vertex.
//!
//! Raw survey geometry is normalised so that consecutive vertices are between
//! `min_point_spacing_ft` and `max_point_spacing_ft` apart: vertices too close to
//! their predecessor are dropped, wide gaps are filled by linear interpolation of
//! position and elevation.
//!
//! Projection finds the closest point on the polyline (perpendicular distance to
//! each segment, not just the nearest vertex). Candidate segments come from an
//! R-tree over the vertices: the nearest segment always touches a vertex within
//! `nearest_vertex_distance + max_spacing` of the query, so only those are tested.

use geo::{Coord, Line};
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::error::{OptionExt, Result, TrackerError};
use crate::geo_utils::{feet_to_miles, haversine_distance_ft, interpolate, LocalFrame};
use crate::GpsPoint;

/// Extra search radius on top of the maximum spacing, covering the difference
/// between the planar index and great-circle spacing.
const SEARCH_SLACK: f64 = 1.5;

/// Distances closer than this (feet) are treated as ties.
const TIE_EPSILON_FT: f64 = 1e-6;

/// A raw survey point as read from the map service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurveyPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation in feet
    #[serde(default)]
    pub elevation: f64,
}

impl SurveyPoint {
    pub fn new(latitude: f64, longitude: f64, elevation: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation,
        }
    }

    fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    fn lerp(&self, other: &SurveyPoint, t: f64) -> SurveyPoint {
        let p = interpolate(&self.position(), &other.position(), t);
        SurveyPoint::new(
            p.latitude,
            p.longitude,
            self.elevation + t * (other.elevation - self.elevation),
        )
    }
}

/// Raw route geometry: a named list of survey points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSurvey {
    pub name: String,
    pub points: Vec<SurveyPoint>,
}

/// One vertex of the densified route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    /// Distance from the start in miles (raw route space)
    pub cumulative_distance: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation in feet
    pub elevation: f64,
}

impl RoutePoint {
    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// Result of projecting a position onto the route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Interpolated cumulative distance at the closest point (raw miles)
    pub mile_mark: f64,
    /// Perpendicular distance from the position to the route (feet)
    pub deviation_ft: f64,
    /// Index of the segment's first vertex
    pub segment: usize,
    /// Closest point on the route
    pub point: GpsPoint,
}

/// A route vertex with its index, in route-frame feet, for R-tree queries.
#[derive(Debug, Clone, Copy)]
struct IndexedVertex {
    idx: usize,
    x: f64,
    y: f64,
}

impl RTreeObject for IndexedVertex {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.x, self.y])
    }
}

impl PointDistance for IndexedVertex {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.x - point[0];
        let dy = self.y - point[1];
        dx * dx + dy * dy
    }
}

/// The densified race route.
#[derive(Debug)]
pub struct Route {
    name: String,
    points: Vec<RoutePoint>,
    /// Cumulative elevation gain (feet) at each vertex
    gains: Vec<f64>,
    /// Cumulative elevation loss (feet) at each vertex
    losses: Vec<f64>,
    max_spacing_ft: f64,
    frame: LocalFrame,
    index: RTree<IndexedVertex>,
}

impl Route {
    /// Build a route from raw survey points.
    pub fn from_survey(survey: &RouteSurvey, config: &TrackerConfig) -> Result<Self> {
        Self::from_points(&survey.name, &survey.points, config)
    }

    /// Build a route from raw survey points, enforcing the configured spacing.
    pub fn from_points(name: &str, raw: &[SurveyPoint], config: &TrackerConfig) -> Result<Self> {
        if raw.len() < 2 {
            return Err(TrackerError::InsufficientPoints {
                route_name: name.to_string(),
                point_count: raw.len(),
                minimum_required: 2,
            });
        }
        if let Some(bad) = raw.iter().position(|p| !p.position().is_valid() || !p.elevation.is_finite()) {
            return Err(TrackerError::InvalidCoordinates {
                name: name.to_string(),
                message: format!("survey point {} is not a valid position", bad),
            });
        }

        let dense = densify(
            name,
            raw,
            config.min_point_spacing_ft,
            config.max_point_spacing_ft,
        )?;

        let mut points = Vec::with_capacity(dense.len());
        let mut gains = Vec::with_capacity(dense.len());
        let mut losses = Vec::with_capacity(dense.len());
        let mut cumulative = 0.0;
        let mut gain = 0.0;
        let mut loss = 0.0;

        for (i, p) in dense.iter().enumerate() {
            if i > 0 {
                let prev = &dense[i - 1];
                cumulative += feet_to_miles(haversine_distance_ft(&prev.position(), &p.position()));
                let change = p.elevation - prev.elevation;
                if change > 0.0 {
                    gain += change;
                } else {
                    loss -= change;
                }
            }
            points.push(RoutePoint {
                cumulative_distance: cumulative,
                latitude: p.latitude,
                longitude: p.longitude,
                elevation: p.elevation,
            });
            gains.push(gain);
            losses.push(loss);
        }

        let frame = LocalFrame::new(&points[0].position());
        let indexed: Vec<IndexedVertex> = points
            .iter()
            .enumerate()
            .map(|(idx, p)| {
                let c = frame.project(&p.position());
                IndexedVertex { idx, x: c.x, y: c.y }
            })
            .collect();

        log::info!(
            "[Route] '{}': {} survey points densified to {} ({:.2} mi)",
            name,
            raw.len(),
            points.len(),
            cumulative
        );

        Ok(Self {
            name: name.to_string(),
            points,
            gains,
            losses,
            max_spacing_ft: config.max_point_spacing_ft,
            frame,
            index: RTree::bulk_load(indexed),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[RoutePoint] {
        &self.points
    }

    /// Total raw length in miles.
    pub fn length(&self) -> f64 {
        self.points
            .last()
            .map(|p| p.cumulative_distance)
            .unwrap_or(0.0)
    }

    pub fn start(&self) -> &RoutePoint {
        &self.points[0]
    }

    pub fn finish(&self) -> &RoutePoint {
        &self.points[self.points.len() - 1]
    }

    /// Total elevation gain in feet.
    pub fn gain(&self) -> f64 {
        self.gains.last().copied().unwrap_or(0.0)
    }

    /// Total elevation loss in feet.
    pub fn loss(&self) -> f64 {
        self.losses.last().copied().unwrap_or(0.0)
    }

    /// Cumulative (gain, loss) in feet at a raw mile mark.
    pub fn elevation_change_at(&self, mile_mark: f64) -> (f64, f64) {
        let (i, t) = self.locate(mile_mark);
        if t == 0.0 {
            return (self.gains[i], self.losses[i]);
        }
        (
            self.gains[i] + t * (self.gains[i + 1] - self.gains[i]),
            self.losses[i] + t * (self.losses[i + 1] - self.losses[i]),
        )
    }

    /// Interpolated route point at a raw mile mark (clamped to the route).
    pub fn point_at(&self, mile_mark: f64) -> RoutePoint {
        let (i, t) = self.locate(mile_mark);
        let a = &self.points[i];
        if t == 0.0 {
            return *a;
        }
        let b = &self.points[i + 1];
        let p = interpolate(&a.position(), &b.position(), t);
        RoutePoint {
            cumulative_distance: a.cumulative_distance
                + t * (b.cumulative_distance - a.cumulative_distance),
            latitude: p.latitude,
            longitude: p.longitude,
            elevation: a.elevation + t * (b.elevation - a.elevation),
        }
    }

    /// Segment index and fraction along it for a raw mile mark.
    fn locate(&self, mile_mark: f64) -> (usize, f64) {
        let last = self.points.len() - 1;
        if mile_mark <= 0.0 || !mile_mark.is_finite() {
            return (0, 0.0);
        }
        if mile_mark >= self.length() {
            return (last, 0.0);
        }
        // First vertex strictly beyond the mile mark
        let upper = self
            .points
            .partition_point(|p| p.cumulative_distance <= mile_mark);
        let i = upper - 1;
        let a = self.points[i].cumulative_distance;
        let b = self.points[upper].cumulative_distance;
        (i, (mile_mark - a) / (b - a))
    }

    /// Project a position onto the route.
    ///
    /// Equidistant candidates resolve to the one with the later cumulative distance.
    pub fn project(&self, position: &GpsPoint) -> Projection {
        let segments = self.candidate_segments(position, 0.0);
        self.closest_among(position, segments)
            .unwrap_or_else(|| self.fallback_projection(position))
    }

    /// Every distinct pass of the route near a position.
    ///
    /// Candidate segments are grouped into contiguous runs and the closest point
    /// of each run is kept when it lies within `radius_ft` of the overall closest
    /// point. Out-and-back sections and loops yield one projection per pass,
    /// ordered by mile mark. The result is never empty.
    pub fn project_passes(&self, position: &GpsPoint, radius_ft: f64) -> Vec<Projection> {
        let segments = self.candidate_segments(position, radius_ft);

        let mut passes: Vec<Projection> = Vec::new();
        let mut run_start = 0;
        for i in 1..=segments.len() {
            if i == segments.len() || segments[i] != segments[i - 1] + 1 {
                if let Some(p) = self.closest_among(position, segments[run_start..i].iter().copied()) {
                    passes.push(p);
                }
                run_start = i;
            }
        }

        let best = passes
            .iter()
            .map(|p| p.deviation_ft)
            .fold(f64::INFINITY, f64::min);
        passes.retain(|p| p.deviation_ft <= best + radius_ft);
        if passes.is_empty() {
            passes.push(self.fallback_projection(position));
        }
        passes
    }

    /// Sorted indices of segments that may hold the closest point, widened by `extra_ft`.
    fn candidate_segments(&self, position: &GpsPoint, extra_ft: f64) -> Vec<usize> {
        let query = self.frame.project(position);
        let query = [query.x, query.y];

        match self.index.nearest_neighbor(&query) {
            Some(nearest) => {
                let radius = nearest.distance_2(&query).sqrt()
                    + self.max_spacing_ft * SEARCH_SLACK
                    + extra_ft;
                let mut segments: Vec<usize> = self
                    .index
                    .locate_within_distance(query, radius * radius)
                    .flat_map(|v| [v.idx.checked_sub(1), Some(v.idx)])
                    .flatten()
                    .filter(|&s| s + 1 < self.points.len())
                    .collect();
                segments.sort_unstable();
                segments.dedup();
                segments
            }
            None => (0..self.points.len() - 1).collect(),
        }
    }

    /// Project a position considering only the route between two raw mile marks.
    ///
    /// Used to resolve aid stations on courses that pass the same spot twice.
    /// Returns `None` when the range contains no segment.
    pub fn project_in_range(&self, position: &GpsPoint, from_mile: f64, to_mile: f64) -> Option<Projection> {
        let last_segment = self.points.len() - 2;
        let first = self
            .points
            .partition_point(|p| p.cumulative_distance <= from_mile)
            .saturating_sub(1)
            .min(last_segment);
        let end = self
            .points
            .partition_point(|p| p.cumulative_distance < to_mile)
            .min(last_segment + 1);
        if end <= first {
            return None;
        }
        self.closest_among(position, first..end)
    }

    fn closest_among(
        &self,
        position: &GpsPoint,
        segments: impl IntoIterator<Item = usize>,
    ) -> Option<Projection> {
        let local = LocalFrame::new(position);
        let origin = Coord { x: 0.0, y: 0.0 };
        let mut best: Option<Projection> = None;

        // Ascending segment order: a tie always goes to the later segment.
        for seg in segments {
            let a = &self.points[seg];
            let b = &self.points[seg + 1];
            let line = Line::new(local.project(&a.position()), local.project(&b.position()));
            let (t, closest) = closest_on_segment(&line, origin);
            let offset = closest - origin;
            let deviation_ft = offset.x.hypot(offset.y);

            let replace = match &best {
                None => true,
                Some(current) => deviation_ft <= current.deviation_ft + TIE_EPSILON_FT,
            };
            if !replace {
                continue;
            }

            let (mile_mark, point) = if t <= 0.0 {
                (a.cumulative_distance, a.position())
            } else if t >= 1.0 {
                (b.cumulative_distance, b.position())
            } else {
                (
                    a.cumulative_distance + t * (b.cumulative_distance - a.cumulative_distance),
                    interpolate(&a.position(), &b.position(), t),
                )
            };

            best = Some(Projection {
                mile_mark,
                deviation_ft,
                segment: seg,
                point,
            });
        }
        best
    }

    fn fallback_projection(&self, position: &GpsPoint) -> Projection {
        let start = self.points[0].position();
        Projection {
            mile_mark: 0.0,
            deviation_ft: haversine_distance_ft(position, &start),
            segment: 0,
            point: start,
        }
    }
}

/// Clamped fraction along a segment and the closest point to `p`.
fn closest_on_segment(line: &Line<f64>, p: Coord<f64>) -> (f64, Coord<f64>) {
    let delta = line.delta();
    let length_2 = delta.x * delta.x + delta.y * delta.y;
    if length_2 == 0.0 {
        return (0.0, line.start);
    }
    let to_p = p - line.start;
    let t = ((to_p.x * delta.x + to_p.y * delta.y) / length_2).clamp(0.0, 1.0);
    if t == 0.0 {
        return (t, line.start);
    }
    if t == 1.0 {
        return (t, line.end);
    }
    (t, line.start + delta * t)
}

/// Drop points closer than `min_ft` to their predecessor and subdivide gaps
/// wider than `max_ft`. The first and last survey points are always kept.
fn densify(name: &str, raw: &[SurveyPoint], min_ft: f64, max_ft: f64) -> Result<Vec<SurveyPoint>> {
    let first = *raw.first().ok_or_insufficient_points(name, raw.len(), 2)?;
    let mut kept: Vec<SurveyPoint> = vec![first];
    let mut last_dropped = false;

    for p in &raw[1..] {
        let prev = kept[kept.len() - 1];
        let d = haversine_distance_ft(&prev.position(), &p.position());
        if d < min_ft {
            last_dropped = true;
            continue;
        }
        last_dropped = false;
        push_filled(&mut kept, *p, d, max_ft);
    }

    if last_dropped {
        let finish = raw[raw.len() - 1];
        let distance_to = |p: &SurveyPoint| haversine_distance_ft(&p.position(), &finish.position());
        while kept.len() > 1 && distance_to(&kept[kept.len() - 1]) < min_ft {
            kept.pop();
        }
        let d = distance_to(&kept[kept.len() - 1]);
        if d < min_ft {
            return Err(TrackerError::RouteTooShort {
                route_name: name.to_string(),
                length_ft: d,
                minimum_ft: min_ft,
            });
        }
        push_filled(&mut kept, finish, d, max_ft);
    }

    Ok(kept)
}

fn push_filled(kept: &mut Vec<SurveyPoint>, next: SurveyPoint, distance_ft: f64, max_ft: f64) {
    let prev = kept[kept.len() - 1];
    let steps = ((distance_ft / max_ft).ceil() as usize).max(1);
    for j in 1..steps {
        kept.push(prev.lerp(&next, j as f64 / steps as f64));
    }
    kept.push(next);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geo_utils::{miles_to_feet, EARTH_RADIUS_M, FEET_PER_METER};

    /// Degrees of latitude per mile along a meridian.
    pub(crate) fn degrees_per_mile() -> f64 {
        (miles_to_feet(1.0) / FEET_PER_METER / EARTH_RADIUS_M).to_degrees()
    }

    /// Straight route heading north, with a survey point every `step_miles`.
    pub(crate) fn straight_survey(length_miles: f64, step_miles: f64) -> Vec<SurveyPoint> {
        let count = (length_miles / step_miles).round() as usize;
        (0..=count)
            .map(|i| {
                let miles = i as f64 * step_miles;
                SurveyPoint::new(40.0 + miles * degrees_per_mile(), -105.0, 5000.0 + 10.0 * miles)
            })
            .collect()
    }

    fn spacing_ok(route: &Route, config: &TrackerConfig) -> bool {
        route.points().windows(2).all(|w| {
            let d = haversine_distance_ft(&w[0].position(), &w[1].position());
            d >= config.min_point_spacing_ft - 1e-6 && d <= config.max_point_spacing_ft + 1e-6
        })
    }

    #[test]
    fn test_sparse_points_are_interpolated() {
        let config = TrackerConfig::default();
        let route = Route::from_points("sparse", &straight_survey(1.0, 0.1), &config).unwrap();
        assert!(spacing_ok(&route, &config));
        assert!((route.length() - 1.0).abs() < 1e-6);
        assert!(route.points().len() > 200);
    }

    #[test]
    fn test_dense_points_are_decimated() {
        let config = TrackerConfig::default();
        // A point every ~1 ft
        let raw = straight_survey(0.2, 1.0 / 5280.0);
        let route = Route::from_points("dense", &raw, &config).unwrap();
        assert!(spacing_ok(&route, &config));
        assert!(route.points().len() < raw.len() / 5);
        assert_eq!(route.finish().latitude, raw[raw.len() - 1].latitude);
    }

    #[test]
    fn test_short_tail_is_absorbed() {
        let config = TrackerConfig::default();
        let mut raw = straight_survey(0.1, 0.01);
        let last = raw[raw.len() - 1];
        // Final point 3 ft beyond the previous one
        raw.push(SurveyPoint::new(
            last.latitude + 3.0 / 5280.0 * degrees_per_mile(),
            last.longitude,
            last.elevation,
        ));
        let route = Route::from_points("tail", &raw, &config).unwrap();
        assert!(spacing_ok(&route, &config));
        assert_eq!(route.finish().latitude, raw[raw.len() - 1].latitude);
    }

    #[test]
    fn test_degenerate_routes_rejected() {
        let config = TrackerConfig::default();
        let single = vec![SurveyPoint::new(40.0, -105.0, 0.0)];
        assert!(matches!(
            Route::from_points("one", &single, &config),
            Err(TrackerError::InsufficientPoints { .. })
        ));

        let tiny = vec![
            SurveyPoint::new(40.0, -105.0, 0.0),
            SurveyPoint::new(40.000001, -105.0, 0.0),
        ];
        assert!(matches!(
            Route::from_points("tiny", &tiny, &config),
            Err(TrackerError::RouteTooShort { .. })
        ));

        let invalid = vec![
            SurveyPoint::new(40.0, -105.0, 0.0),
            SurveyPoint::new(f64::NAN, -105.0, 0.0),
        ];
        assert!(matches!(
            Route::from_points("nan", &invalid, &config),
            Err(TrackerError::InvalidCoordinates { .. })
        ));
    }

    #[test]
    fn test_project_vertex_is_exact() {
        let config = TrackerConfig::default();
        let route = Route::from_points("r", &straight_survey(2.0, 0.05), &config).unwrap();
        for idx in [0, 1, 17, route.points().len() / 2, route.points().len() - 1] {
            let vertex = route.points()[idx];
            let projection = route.project(&vertex.position());
            assert!(
                (projection.mile_mark - vertex.cumulative_distance).abs() < 1e-9,
                "vertex {}: {} vs {}",
                idx,
                projection.mile_mark,
                vertex.cumulative_distance
            );
            assert!(projection.deviation_ft < 1e-6);
        }
    }

    #[test]
    fn test_project_offset_point() {
        let config = TrackerConfig::default();
        let route = Route::from_points("r", &straight_survey(2.0, 0.05), &config).unwrap();
        let on_route = route.point_at(1.234);
        // 50 ft east of the route
        let ft_per_deg_lng =
            miles_to_feet(1.0) / degrees_per_mile() * on_route.latitude.to_radians().cos();
        let offset = GpsPoint::new(on_route.latitude, on_route.longitude + 50.0 / ft_per_deg_lng);

        let projection = route.project(&offset);
        assert!((projection.mile_mark - 1.234).abs() < 1e-4);
        assert!((projection.deviation_ft - 50.0).abs() < 0.5);
    }

    #[test]
    fn test_project_beyond_ends_clamps() {
        let config = TrackerConfig::default();
        let route = Route::from_points("r", &straight_survey(1.0, 0.05), &config).unwrap();
        let before = GpsPoint::new(40.0 - 0.1 * degrees_per_mile(), -105.0);
        let projection = route.project(&before);
        assert_eq!(projection.mile_mark, 0.0);
        assert!((projection.deviation_ft - 528.0).abs() < 1.0);
    }

    #[test]
    fn test_out_and_back_tie_prefers_later_distance() {
        let config = TrackerConfig::default();
        let mut raw = straight_survey(0.5, 0.05);
        let mut back: Vec<SurveyPoint> = raw.iter().rev().skip(1).copied().collect();
        // Return leg 40 ft east so the two legs never share vertices
        let shift = 40.0 / (miles_to_feet(1.0) / degrees_per_mile() * 40.0_f64.to_radians().cos());
        for p in &mut back {
            p.longitude += shift;
        }
        raw.extend(back);
        let route = Route::from_points("out-and-back", &raw, &config).unwrap();

        let p = route.point_at(0.25).position();
        let midway = GpsPoint::new(p.latitude, p.longitude + shift / 2.0);
        let first = route.project(&midway);
        let second = route.project(&midway);
        assert_eq!(first, second);
        assert!(first.mile_mark > 0.5, "expected return leg, got {}", first.mile_mark);
    }

    #[test]
    fn test_project_in_range_picks_requested_pass() {
        let config = TrackerConfig::default();
        let mut raw = straight_survey(0.5, 0.05);
        let back: Vec<SurveyPoint> = raw.iter().rev().skip(1).copied().collect();
        raw.extend(back);
        let route = Route::from_points("out-and-back", &raw, &config).unwrap();

        let spot = route.point_at(0.2).position();
        let outbound = route.project_in_range(&spot, 0.0, 0.5).unwrap();
        let inbound = route.project_in_range(&spot, 0.5, route.length()).unwrap();
        assert!((outbound.mile_mark - 0.2).abs() < 1e-6);
        assert!((inbound.mile_mark - 0.8).abs() < 1e-3);
        assert!(route.project_in_range(&spot, 5.0, 6.0).is_none());
    }

    #[test]
    fn test_project_passes_on_out_and_back() {
        let config = TrackerConfig::default();
        let mut raw = straight_survey(0.5, 0.05);
        let back: Vec<SurveyPoint> = raw.iter().rev().skip(1).copied().collect();
        raw.extend(back);
        let route = Route::from_points("out-and-back", &raw, &config).unwrap();

        let spot = route.point_at(0.2).position();
        let passes = route.project_passes(&spot, 100.0);
        assert_eq!(passes.len(), 2);
        assert!((passes[0].mile_mark - 0.2).abs() < 1e-3);
        assert!((passes[1].mile_mark - 0.8).abs() < 1e-3);

        // A one-way route has a single pass
        let straight = Route::from_points("r", &straight_survey(1.0, 0.05), &config).unwrap();
        assert_eq!(straight.project_passes(&spot, 100.0).len(), 1);
    }

    #[test]
    fn test_elevation_profile() {
        let config = TrackerConfig::default();
        let route = Route::from_points("r", &straight_survey(2.0, 0.1), &config).unwrap();
        assert!((route.gain() - 20.0).abs() < 1e-6);
        assert_eq!(route.loss(), 0.0);
        let (gain, _) = route.elevation_change_at(1.0);
        assert!((gain - 10.0).abs() < 1e-3);
        assert!((route.point_at(0.5).elevation - 5005.0).abs() < 1e-3);
    }
}
