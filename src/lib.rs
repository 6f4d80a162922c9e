//! boundaryd - an OSM administrative-boundary download and clipping service.
//!
//! Given a set of OpenStreetMap administrative-boundary relation ids, fetches
//! their geometry through Overpass, optionally clips to land, and streams
//! progress to a client over server-sent events.

pub mod catalog;
pub mod config;
pub mod downloader;
pub mod error;
pub mod geometry;
pub mod http;
pub mod jobs;
pub mod land;
pub mod overpass;
pub mod preview;
pub mod storage;
pub mod util;

pub use config::Config;
pub use error::ApiError;
