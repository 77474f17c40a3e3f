//! Typed schema for the canonical "R" version 1 serialization.
//!
//! The `scheduling` key is opaque scheduler payload; it is carried as a raw
//! JSON value so that it survives byte-for-byte.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level R object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rv1 {
    pub version: i64,
    pub execution: Execution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<Value>,
}

/// The `execution` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    #[serde(rename = "R_lite")]
    pub r_lite: Vec<RliteEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodelist: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starttime: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nslots: Option<u64>,
}

/// One R_lite entry: a set of ranks sharing identical child pools.
///
/// `children.core` is always present (may be empty); other classes appear
/// only when non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RliteEntry {
    pub rank: String,
    pub children: BTreeMap<String, String>,
}
