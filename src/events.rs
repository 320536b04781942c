//! Sparse event storage and the octree index the integrator queries.
//!
//! **Context**: integration never rasterizes the measurement into a dense
//! grid. Events stay as weighted points (center, signal, squared error) and
//! every integration volume is resolved by walking a box tree: nodes cache
//! their totals, so regions that swallow a whole box are settled without
//! touching its events, and boxes that cannot reach the region are pruned by
//! their bounds.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use nalgebra::{Point3, Vector3};
use ndarray::Array1;

use crate::errors::PeakqError;
use crate::geom::Aabb;
use crate::settings::{BACKGROUND_KEEP_FRACTION, MAX_EVENTS_PER_LEAF, MAX_TREE_DEPTH};


/// A weighted point measurement in momentum space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub center: Point3<f64>,
    pub signal: f64,
    pub error_sq: f64,
}

/// Radial coordinate used by the integration queries.
///
/// `Sphere` measures plain squared Euclidean distance from the center, so
/// thresholds are squared radii. `Ellipsoid` measures the normalized
/// `sum(((p - center) . axis_i / radius_i)^2)`, which puts the ellipsoid
/// surface at 1; shell queries in ellipsoid mode pass ratios of 1.
#[derive(Debug, Clone)]
pub enum RadialTransform {
    Sphere {
        center: Point3<f64>,
    },
    Ellipsoid {
        center: Point3<f64>,
        axes: [Vector3<f64>; 3],
        radii: [f64; 3],
    },
}

impl RadialTransform {
    pub fn sphere(center: Point3<f64>) -> Self {
        Self::Sphere { center }
    }

    /// Axes must be orthonormal and radii positive.
    pub fn ellipsoid(center: Point3<f64>, axes: [Vector3<f64>; 3], radii: [f64; 3]) -> Self {
        Self::Ellipsoid {
            center,
            axes,
            radii,
        }
    }

    pub fn center(&self) -> &Point3<f64> {
        match self {
            Self::Sphere { center } => center,
            Self::Ellipsoid { center, .. } => center,
        }
    }

    pub fn distance_sq(&self, point: &Point3<f64>) -> f64 {
        match self {
            Self::Sphere { center } => (point - center).norm_squared(),
            Self::Ellipsoid {
                center,
                axes,
                radii,
            } => {
                let delta = point - center;
                let mut rho_sq = 0.0;
                for (axis, radius) in axes.iter().zip(radii.iter()) {
                    let u = delta.dot(axis) / radius;
                    rho_sq += u * u;
                }
                rho_sq
            }
        }
    }

    /// `(smin, smax)` with `smin * d^2 <= distance_sq(p) <= smax * d^2` for
    /// any point at Euclidean distance `d` from the center. The box pruning
    /// relies on these bounds being conservative.
    fn scale_bounds(&self) -> (f64, f64) {
        match self {
            Self::Sphere { .. } => (1.0, 1.0),
            Self::Ellipsoid { radii, .. } => {
                let mut rmin = radii[0];
                let mut rmax = radii[0];
                for &r in &radii[1..] {
                    rmin = rmin.min(r);
                    rmax = rmax.max(r);
                }
                (1.0 / (rmax * rmax), 1.0 / (rmin * rmin))
            }
        }
    }
}

/// The queryable seam between the integrator and its event storage.
pub trait EventIndex: Sync {
    /// Total (signal, squared error) with `distance_sq` in
    /// `[inner_radius_sq, radius_sq]`. With `use_one_percent` set and a
    /// positive inner radius (a background-shell query), contributing boxes
    /// are ranked by signal density and the densest 1% discarded.
    fn integrate_sphere(
        &self,
        transform: &RadialTransform,
        radius_sq: f64,
        inner_radius_sq: f64,
        use_one_percent: bool,
    ) -> (f64, f64);

    /// Calls `visit` for every event with `distance_sq <= radius_sq`.
    fn visit_events_within(
        &self,
        transform: &RadialTransform,
        radius_sq: f64,
        visit: &mut dyn FnMut(&Event),
    );

    /// Integrates a finite cylinder (unit `axis`, total `length`) and bins
    /// the signal along the axis into `n_bins` steps. Returns
    /// (signal, error_sq, profile, profile_err_sq).
    fn integrate_cylinder(
        &self,
        center: &Point3<f64>,
        axis: &Vector3<f64>,
        radius: f64,
        length: f64,
        n_bins: usize,
    ) -> (f64, f64, Array1<f64>, Array1<f64>);
}

/// One box's share of a background-shell query.
struct BoxContribution {
    signal: f64,
    error_sq: f64,
    density: f64,
}

/// Keeps the `BACKGROUND_KEEP_FRACTION` least-dense contributions and sums
/// them. Ties keep their gathering order (stable sort), so repeated runs
/// produce identical results.
fn one_percent_filtered(mut boxes: Vec<BoxContribution>) -> (f64, f64) {
    boxes.sort_by(|a, b| a.density.partial_cmp(&b.density).expect("NaN encountered"));
    let keep = (BACKGROUND_KEEP_FRACTION * boxes.len() as f64).ceil() as usize;
    boxes
        .iter()
        .take(keep)
        .fold((0.0, 0.0), |(s, e), b| (s + b.signal, e + b.error_sq))
}

struct Node {
    /// Tight bounds of the events in `[start, end)`.
    bounds: Aabb,
    signal: f64,
    error_sq: f64,
    start: usize,
    end: usize,
    /// Octant-cell share of the root volume at this node's depth
    /// (root volume / 8^depth); signal-density ranking uses this rather
    /// than the tight bounds, whose volume collapses for point-like leaves.
    cell_volume: f64,
    children: Vec<usize>,
}

/// Octree over events, stored as a flat arena. Events are reordered at
/// construction so that every node owns a contiguous slice, and each node
/// caches its totals for whole-box fast paths.
pub struct EventTree {
    events: Vec<Event>,
    nodes: Vec<Node>,
}

impl EventTree {
    pub fn from_events(mut events: Vec<Event>) -> Self {
        let bounds = Aabb::from_points(events.iter().map(|e| &e.center));
        let cell_volume = bounds.volume();
        let mut nodes = Vec::new();
        build(&mut events, 0, bounds, cell_volume, 0, &mut nodes);
        Self { events, nodes }
    }

    /// Reads whitespace-separated `x y z signal error_sq` lines. Blank lines
    /// and lines starting with `#` are skipped.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PeakqError> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields: Vec<f64> = trimmed
                .split_whitespace()
                .map(|f| {
                    f.parse::<f64>().map_err(|_| {
                        PeakqError::invalid(format!(
                            "events file line {}: '{}' is not a number",
                            number + 1,
                            f
                        ))
                    })
                })
                .collect::<Result<_, _>>()?;
            if fields.len() != 5 {
                return Err(PeakqError::invalid(format!(
                    "events file line {}: expected 5 fields, got {}",
                    number + 1,
                    fields.len()
                )));
            }
            events.push(Event {
                center: Point3::new(fields[0], fields[1], fields[2]),
                signal: fields[3],
                error_sq: fields[4],
            });
        }
        Ok(Self::from_events(events))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn total_signal(&self) -> f64 {
        self.nodes[0].signal
    }

    pub fn bounds(&self) -> &Aabb {
        &self.nodes[0].bounds
    }

    fn integrate_node(
        &self,
        index: usize,
        transform: &RadialTransform,
        radius_sq: f64,
        inner_radius_sq: f64,
        smin: f64,
        smax: f64,
    ) -> (f64, f64) {
        let node = &self.nodes[index];
        let center = transform.center();
        let dmin_sq = node.bounds.min_distance_sq(center);
        if dmin_sq * smin > radius_sq {
            return (0.0, 0.0);
        }
        let dmax_sq = node.bounds.max_distance_sq(center);
        if inner_radius_sq > 0.0 && dmax_sq * smax < inner_radius_sq {
            return (0.0, 0.0);
        }
        // Whole box inside the outer surface and clear of the hole.
        if dmax_sq * smax <= radius_sq && dmin_sq * smin >= inner_radius_sq {
            return (node.signal, node.error_sq);
        }
        if node.children.is_empty() {
            let mut signal = 0.0;
            let mut error_sq = 0.0;
            for event in &self.events[node.start..node.end] {
                let rho_sq = transform.distance_sq(&event.center);
                if rho_sq <= radius_sq && rho_sq >= inner_radius_sq {
                    signal += event.signal;
                    error_sq += event.error_sq;
                }
            }
            (signal, error_sq)
        } else {
            let mut signal = 0.0;
            let mut error_sq = 0.0;
            for &child in &node.children {
                let (s, e) =
                    self.integrate_node(child, transform, radius_sq, inner_radius_sq, smin, smax);
                signal += s;
                error_sq += e;
            }
            (signal, error_sq)
        }
    }

    /// Shell gathering for the one-percent cut drills all the way to leaves
    /// so the density ranking always works at the same box granularity.
    fn gather_shell_boxes(
        &self,
        index: usize,
        transform: &RadialTransform,
        radius_sq: f64,
        inner_radius_sq: f64,
        smin: f64,
        smax: f64,
        boxes: &mut Vec<BoxContribution>,
    ) {
        let node = &self.nodes[index];
        let center = transform.center();
        let dmin_sq = node.bounds.min_distance_sq(center);
        if dmin_sq * smin > radius_sq {
            return;
        }
        let dmax_sq = node.bounds.max_distance_sq(center);
        if dmax_sq * smax < inner_radius_sq {
            return;
        }

        if !node.children.is_empty() {
            for &child in &node.children {
                self.gather_shell_boxes(
                    child,
                    transform,
                    radius_sq,
                    inner_radius_sq,
                    smin,
                    smax,
                    boxes,
                );
            }
            return;
        }

        let (signal, error_sq) =
            if dmax_sq * smax <= radius_sq && dmin_sq * smin >= inner_radius_sq {
                (node.signal, node.error_sq)
            } else {
                let mut signal = 0.0;
                let mut error_sq = 0.0;
                for event in &self.events[node.start..node.end] {
                    let rho_sq = transform.distance_sq(&event.center);
                    if rho_sq <= radius_sq && rho_sq >= inner_radius_sq {
                        signal += event.signal;
                        error_sq += event.error_sq;
                    }
                }
                (signal, error_sq)
            };

        if signal != 0.0 || error_sq != 0.0 {
            let density = if node.cell_volume > 0.0 {
                signal / node.cell_volume
            } else {
                f64::INFINITY
            };
            boxes.push(BoxContribution {
                signal,
                error_sq,
                density,
            });
        }
    }

    fn visit_node(
        &self,
        index: usize,
        transform: &RadialTransform,
        radius_sq: f64,
        smin: f64,
        smax: f64,
        visit: &mut dyn FnMut(&Event),
    ) {
        let node = &self.nodes[index];
        let center = transform.center();
        let dmin_sq = node.bounds.min_distance_sq(center);
        if dmin_sq * smin > radius_sq {
            return;
        }
        // Whole box inside: hand over the slice without per-event tests.
        if node.bounds.max_distance_sq(center) * smax <= radius_sq {
            for event in &self.events[node.start..node.end] {
                visit(event);
            }
            return;
        }
        if node.children.is_empty() {
            for event in &self.events[node.start..node.end] {
                if transform.distance_sq(&event.center) <= radius_sq {
                    visit(event);
                }
            }
        } else {
            for &child in &node.children {
                self.visit_node(child, transform, radius_sq, smin, smax, visit);
            }
        }
    }

    fn cylinder_node(
        &self,
        index: usize,
        center: &Point3<f64>,
        axis: &Vector3<f64>,
        radius: f64,
        half_length: f64,
        bound_sq: f64,
        profile: &mut Array1<f64>,
        profile_err_sq: &mut Array1<f64>,
    ) -> (f64, f64) {
        let node = &self.nodes[index];
        if node.bounds.min_distance_sq(center) > bound_sq {
            return (0.0, 0.0);
        }
        if node.children.is_empty() {
            let n_bins = profile.len();
            let mut signal = 0.0;
            let mut error_sq = 0.0;
            for event in &self.events[node.start..node.end] {
                let delta = event.center - center;
                let t = delta.dot(axis);
                if t.abs() > half_length {
                    continue;
                }
                if (delta - axis * t).norm_squared() > radius * radius {
                    continue;
                }
                let mut bin =
                    (((t + half_length) / (2.0 * half_length)) * n_bins as f64) as usize;
                if bin >= n_bins {
                    bin = n_bins - 1;
                }
                profile[bin] += event.signal;
                profile_err_sq[bin] += event.error_sq;
                signal += event.signal;
                error_sq += event.error_sq;
            }
            (signal, error_sq)
        } else {
            let mut signal = 0.0;
            let mut error_sq = 0.0;
            for &child in &node.children {
                let (s, e) = self.cylinder_node(
                    child,
                    center,
                    axis,
                    radius,
                    half_length,
                    bound_sq,
                    profile,
                    profile_err_sq,
                );
                signal += s;
                error_sq += e;
            }
            (signal, error_sq)
        }
    }
}

impl EventIndex for EventTree {
    fn integrate_sphere(
        &self,
        transform: &RadialTransform,
        radius_sq: f64,
        inner_radius_sq: f64,
        use_one_percent: bool,
    ) -> (f64, f64) {
        let (smin, smax) = transform.scale_bounds();
        if use_one_percent && inner_radius_sq > 0.0 {
            let mut boxes = Vec::new();
            self.gather_shell_boxes(
                0,
                transform,
                radius_sq,
                inner_radius_sq,
                smin,
                smax,
                &mut boxes,
            );
            return one_percent_filtered(boxes);
        }
        self.integrate_node(0, transform, radius_sq, inner_radius_sq, smin, smax)
    }

    fn visit_events_within(
        &self,
        transform: &RadialTransform,
        radius_sq: f64,
        visit: &mut dyn FnMut(&Event),
    ) {
        let (smin, smax) = transform.scale_bounds();
        self.visit_node(0, transform, radius_sq, smin, smax, visit);
    }

    fn integrate_cylinder(
        &self,
        center: &Point3<f64>,
        axis: &Vector3<f64>,
        radius: f64,
        length: f64,
        n_bins: usize,
    ) -> (f64, f64, Array1<f64>, Array1<f64>) {
        let mut profile = Array1::zeros(n_bins);
        let mut profile_err_sq = Array1::zeros(n_bins);
        let half_length = 0.5 * length;
        // Farthest cylinder point from its center bounds the reach.
        let bound_sq = half_length * half_length + radius * radius;
        let (signal, error_sq) = self.cylinder_node(
            0,
            center,
            axis,
            radius,
            half_length,
            bound_sq,
            &mut profile,
            &mut profile_err_sq,
        );
        (signal, error_sq, profile, profile_err_sq)
    }
}

fn octant(point: &Point3<f64>, center: &Point3<f64>) -> usize {
    ((point.x >= center.x) as usize)
        | (((point.y >= center.y) as usize) << 1)
        | (((point.z >= center.z) as usize) << 2)
}

fn build(
    events: &mut [Event],
    offset: usize,
    bounds: Aabb,
    cell_volume: f64,
    depth: usize,
    nodes: &mut Vec<Node>,
) -> usize {
    let signal: f64 = events.iter().map(|e| e.signal).sum();
    let error_sq: f64 = events.iter().map(|e| e.error_sq).sum();
    let index = nodes.len();
    nodes.push(Node {
        bounds: bounds.clone(),
        signal,
        error_sq,
        start: offset,
        end: offset + events.len(),
        cell_volume,
        children: Vec::new(),
    });

    if events.len() <= MAX_EVENTS_PER_LEAF || depth >= MAX_TREE_DEPTH {
        return index;
    }

    // Stable sort groups the slice into octants around the box center while
    // keeping insertion order within each octant, so rebuilds are identical.
    let center = bounds.center();
    events.sort_by_key(|e| octant(&e.center, &center));

    let mut children = Vec::new();
    let mut begin = 0;
    for oct in 0..8 {
        let len = events[begin..]
            .iter()
            .take_while(|e| octant(&e.center, &center) == oct)
            .count();
        if len == 0 {
            continue;
        }
        let slice = &mut events[begin..begin + len];
        let child_bounds = Aabb::from_points(slice.iter().map(|e| &e.center));
        let child = build(
            slice,
            offset + begin,
            child_bounds,
            cell_volume / 8.0,
            depth + 1,
            nodes,
        );
        children.push(child);
        begin += len;
    }
    nodes[index].children = children;
    index
}
