//! Plain data exchanged as `value` arguments and results.
//!
//! Both sides of the bridge use these types: the worker serializes them into
//! replies, the proxies deserialize them back.

use serde::{Deserialize, Serialize};

/// Summary of a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub len: usize,
    pub circular: bool,
}

/// One hit of a sequence search. `end` may exceed the sequence length for
/// hits spanning the origin of a circular sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub start: usize,
    pub end: usize,
    pub fwd: bool,
}

/// Placement of one fragment inside an assembly product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentInfo {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblySettings {
    #[serde(default)]
    pub circular: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primer {
    pub name: String,
    pub seq: String,
}

impl Primer {
    pub fn new(name: impl Into<String>, seq: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seq: seq.into(),
        }
    }
}

/// PCR simulation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcrSettings {
    /// Length of the 3' footprint that has to match exactly.
    pub min_fp: usize,
    pub min_len: usize,
    pub max_len: usize,
}

impl Default for PcrSettings {
    fn default() -> Self {
        Self {
            min_fp: 15,
            min_len: 50,
            max_len: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PcrStatus {
    pub done: bool,
    pub cancelled: bool,
    pub percent: f64,
}

/// A primer binding site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrMatch {
    pub primer: String,
    pub start: usize,
    pub len: usize,
    pub fwd: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcrProduct {
    pub primer_fwd: String,
    pub primer_rev: String,
    pub start: usize,
    pub end: usize,
    pub len: usize,
}
