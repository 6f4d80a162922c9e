//! Thin client over the Overpass API: endpoint cascade, JSON decode, error surfacing.

pub mod client;
pub mod types;

pub use client::{OverpassClient, OverpassResult};
pub use types::{LatLon, OverpassElement, OverpassResponse, RelationMember};
