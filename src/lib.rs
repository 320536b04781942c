//! # peakq
//!
//! Geometric classification and intensity integration of Bragg peaks in
//! momentum space.
//!
//! The crate answers two questions about a set of peaks:
//! - which peaks (treated as spheres) intersect a box region or a bounded
//!   planar surface, and
//! - what the integrated intensity of each peak is, using spherical,
//!   ellipsoidal or cylindrical integration volumes over an event list,
//!   with shell background subtraction and detector edge corrections.
//!
//! [`job::Job`] ties the pieces together: it loads a peak set, runs the
//! configured task and writes the artifacts.

pub mod cylinder;
pub mod detector;
pub mod ellipsoid;
pub mod errors;
pub mod events;
pub mod geom;
pub mod integrate;
pub mod intersect;
pub mod job;
pub mod output;
pub mod peak;
pub mod region;
pub mod result;
pub mod settings;
pub mod shape;
pub mod surface;
pub mod synthetic;
