//! Polymorphic Overpass response elements modeled as a tagged variant.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OverpassElement {
    Relation {
        id: i64,
        #[serde(default)]
        members: Vec<RelationMember>,
        #[serde(default)]
        tags: HashMap<String, String>,
    },
    Way {
        id: i64,
        #[serde(default)]
        nodes: Vec<i64>,
        #[serde(default)]
        geometry: Option<Vec<LatLon>>,
        #[serde(default)]
        tags: HashMap<String, String>,
    },
    Node {
        id: i64,
        lat: f64,
        lon: f64,
        #[serde(default)]
        tags: HashMap<String, String>,
    },
    #[serde(other)]
    Unknown,
}

impl OverpassElement {
    pub fn id(&self) -> Option<i64> {
        match self {
            OverpassElement::Relation { id, .. } => Some(*id),
            OverpassElement::Way { id, .. } => Some(*id),
            OverpassElement::Node { id, .. } => Some(*id),
            OverpassElement::Unknown => None,
        }
    }

    pub fn tags(&self) -> Option<&HashMap<String, String>> {
        match self {
            OverpassElement::Relation { tags, .. } => Some(tags),
            OverpassElement::Way { tags, .. } => Some(tags),
            OverpassElement::Node { tags, .. } => Some(tags),
            OverpassElement::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelationMember {
    Way {
        #[serde(rename = "ref")]
        ref_: i64,
        #[serde(default)]
        role: String,
    },
    Node {
        #[serde(rename = "ref")]
        ref_: i64,
        #[serde(default)]
        role: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverpassResponse {
    #[serde(default)]
    pub elements: Vec<OverpassElement>,
}
