//! Small pure helpers shared across subsystems: slugification and tag lookups.

pub mod slug;
pub mod tags;

pub use slug::slugify;
pub use tags::{iso2_from_tags, preferred_english_name_from_tags, preferred_name_from_tags};
