//! Typed configuration for the heap and collectors, parsed from the same
//! `key=value,key=value` shape as the VM's `-Xgc:`/`-Xmx`-style flags.
//!
//! Mirrors the teacher's `util::options` module: plain fields with parse
//! validation, `EnumString` for the handful of enum-valued options, and a
//! `Result<(), String>` error channel rather than panicking on bad input
//! (configuration is typically attacker/user controlled at process
//! startup).

use std::str::FromStr;
use strum_macros::EnumString;

use crate::util::constants::UTILIZATION_SCALE;

#[derive(Copy, Clone, Eq, PartialEq, Debug, EnumString)]
pub enum HeapSourceBackend {
    /// A dlmalloc-shaped native heap (spec.md §4.5).
    Malloc,
    /// The block-structured bump allocator backing the mostly-copying
    /// engine (spec.md §4.7).
    Copying,
}

#[derive(Clone, Debug)]
pub struct Options {
    /// `targetUtilization` expressed as a ratio × [`UTILIZATION_SCALE`]
    /// (spec.md §3: `∈ [1, 1024]`).
    pub target_utilization: u32,
    pub min_free: usize,
    pub max_free: usize,
    pub initial_size: usize,
    pub growth_limit: usize,
    pub maximum_size: usize,
    pub heap_source_backend: HeapSourceBackend,
    /// Require a precise register map for stack scanning; if `false`,
    /// falls back to conservative scanning with a warning (spec.md §4.6
    /// error handling, §9 design note: this must be an explicit policy
    /// flag, not a silent fallback).
    pub require_precise_register_map: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            target_utilization: 512, // 0.5
            min_free: 2 << 20,
            max_free: 8 << 20,
            initial_size: 4 << 20,
            growth_limit: 64 << 20,
            maximum_size: 256 << 20,
            heap_source_backend: HeapSourceBackend::Malloc,
            require_precise_register_map: false,
        }
    }
}

impl Options {
    /// Parses `key=value` pairs separated by `,`. Unknown keys are an
    /// error rather than silently ignored, matching the source's strict
    /// `-X` flag parser.
    pub fn parse(spec: &str) -> Result<Options, String> {
        let mut options = Options::default();
        if spec.trim().is_empty() {
            return Ok(options);
        }
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| format!("malformed option (expected key=value): {entry}"))?;
            options.set(key.trim(), value.trim())?;
        }
        options.validate()?;
        Ok(options)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "targetUtilization" => {
                let ratio: f32 = value
                    .parse()
                    .map_err(|_| format!("invalid targetUtilization: {value}"))?;
                if !(0.2..=0.8).contains(&ratio) {
                    return Err(format!("targetUtilization out of range [0.2, 0.8]: {ratio}"));
                }
                self.target_utilization = (ratio * UTILIZATION_SCALE as f32) as u32;
            }
            "minFree" => self.min_free = parse_usize(value)?,
            "maxFree" => self.max_free = parse_usize(value)?,
            "initialSize" => self.initial_size = parse_usize(value)?,
            "growthLimit" => self.growth_limit = parse_usize(value)?,
            "maximumSize" => self.maximum_size = parse_usize(value)?,
            "heapSourceBackend" => {
                self.heap_source_backend = HeapSourceBackend::from_str(value)
                    .map_err(|_| format!("invalid heapSourceBackend: {value}"))?;
            }
            "requirePreciseRegisterMap" => {
                self.require_precise_register_map = value
                    .parse()
                    .map_err(|_| format!("invalid requirePreciseRegisterMap: {value}"))?;
            }
            _ => return Err(format!("unknown option: {key}")),
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), String> {
        if self.min_free > self.max_free {
            return Err(format!(
                "minFree ({}) must be <= maxFree ({})",
                self.min_free, self.max_free
            ));
        }
        if self.growth_limit > self.maximum_size {
            return Err(format!(
                "growthLimit ({}) must be <= maximumSize ({})",
                self.growth_limit, self.maximum_size
            ));
        }
        if self.initial_size > self.growth_limit {
            return Err(format!(
                "initialSize ({}) must be <= growthLimit ({})",
                self.initial_size, self.growth_limit
            ));
        }
        Ok(())
    }

    pub fn target_utilization_ratio(&self) -> f64 {
        self.target_utilization as f64 / UTILIZATION_SCALE as f64
    }
}

fn parse_usize(value: &str) -> Result<usize, String> {
    value.parse().map_err(|_| format!("invalid byte count: {value}"))
}
