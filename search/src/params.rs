//! Search-policy parameters.
//!
//! Typed configuration with builder defaults, plus a permissive reader for
//! the string-keyed parameter maps a driver hands in. Unknown keys are
//! ignored; a known key with the wrong type is a configuration error.

use std::collections::HashMap;

use bon::bon;

use crate::error::*;

/// A loosely-typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Parameter keys accepted by [`SearchParams::from_map`].
pub mod keys {
    pub const EPS_GREEDY: &str = "eps_greedy";
    pub const POPULATION: &str = "EvolutionarySearch.population";
    pub const USE_MEASURED_RATIO: &str = "EvolutionarySearch.use_measured_ratio";
    pub const MAX_INNERMOST_SPLIT_FACTOR: &str = "max_innermost_split_factor";
    pub const MAX_VECTORIZE_SIZE: &str = "max_vectorize_size";
    pub const DISABLE_CHANGE_COMPUTE_LOCATION: &str = "disable_change_compute_location";
    pub const CPU_MULTI_LEVEL_TILING_STRUCTURE: &str = "MultiLevelTiling.cpu_structure";
}

/// Tuning knobs of the sketch search policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    /// Fraction of each measurement batch drawn from the random pool.
    pub eps_greedy: f64,
    /// Initial population target per search round.
    pub population: usize,
    /// Fraction of the population seeded from the best measured states.
    pub use_measured_ratio: f64,
    /// Cap on innermost tile-size candidates.
    pub max_innermost_split_factor: i64,
    /// Cap on the fused extent handed to vectorize.
    pub max_vectorize_size: i64,
    /// Skip the compute-location mutation rule entirely.
    pub disable_change_compute_location: bool,
    /// Multi-level tiling structure for CPU, e.g. "SSRSRS".
    pub cpu_multi_level_tiling_structure: String,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            eps_greedy: 0.05,
            population: 2048,
            use_measured_ratio: 0.2,
            max_innermost_split_factor: 16,
            max_vectorize_size: 16,
            disable_change_compute_location: false,
            cpu_multi_level_tiling_structure: "SSRSRS".to_string(),
        }
    }
}

#[bon]
impl SearchParams {
    /// Build parameters with explicit overrides.
    #[builder]
    pub fn new(
        #[builder(default = 0.05)] eps_greedy: f64,
        #[builder(default = 2048)] population: usize,
        #[builder(default = 0.2)] use_measured_ratio: f64,
        #[builder(default = 16)] max_innermost_split_factor: i64,
        #[builder(default = 16)] max_vectorize_size: i64,
        #[builder(default = false)] disable_change_compute_location: bool,
        #[builder(default = "SSRSRS".to_string())] cpu_multi_level_tiling_structure: String,
    ) -> Self {
        Self {
            eps_greedy,
            population,
            use_measured_ratio,
            max_innermost_split_factor,
            max_vectorize_size,
            disable_change_compute_location,
            cpu_multi_level_tiling_structure,
        }
    }

    /// Read parameters from a string-keyed map. Missing keys keep their
    /// defaults, unknown keys are ignored.
    pub fn from_map(map: &HashMap<String, ParamValue>) -> Result<Self> {
        let mut params = Self::default();
        for (key, value) in map {
            match key.as_str() {
                keys::EPS_GREEDY => params.eps_greedy = float_param(key, value)?,
                keys::POPULATION => params.population = int_param(key, value)? as usize,
                keys::USE_MEASURED_RATIO => params.use_measured_ratio = float_param(key, value)?,
                keys::MAX_INNERMOST_SPLIT_FACTOR => {
                    params.max_innermost_split_factor = int_param(key, value)?
                }
                keys::MAX_VECTORIZE_SIZE => params.max_vectorize_size = int_param(key, value)?,
                keys::DISABLE_CHANGE_COMPUTE_LOCATION => {
                    params.disable_change_compute_location = bool_param(key, value)?
                }
                keys::CPU_MULTI_LEVEL_TILING_STRUCTURE => {
                    params.cpu_multi_level_tiling_structure = str_param(key, value)?
                }
                _ => {}
            }
        }
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.eps_greedy) {
            return ConfigurationSnafu {
                key: keys::EPS_GREEDY,
                reason: format!("must be within [0, 1], got {}", self.eps_greedy),
            }
            .fail();
        }
        if self.max_innermost_split_factor < 1 {
            return ConfigurationSnafu {
                key: keys::MAX_INNERMOST_SPLIT_FACTOR,
                reason: format!("must be at least 1, got {}", self.max_innermost_split_factor),
            }
            .fail();
        }
        let structure = &self.cpu_multi_level_tiling_structure;
        let valid_structure = !structure.is_empty()
            && structure.chars().all(|c| matches!(c.to_ascii_lowercase(), 's' | 'r'))
            && structure.chars().any(|c| c.eq_ignore_ascii_case(&'s'));
        if !valid_structure {
            return ConfigurationSnafu {
                key: keys::CPU_MULTI_LEVEL_TILING_STRUCTURE,
                reason: format!("must be a string over {{S, R}} with at least one S, got {structure:?}"),
            }
            .fail();
        }
        Ok(())
    }
}

fn float_param(key: &str, value: &ParamValue) -> Result<f64> {
    match value {
        ParamValue::Float(v) => Ok(*v),
        ParamValue::Int(v) => Ok(*v as f64),
        other => ConfigurationSnafu { key, reason: format!("expected a float, got {other:?}") }.fail(),
    }
}

fn int_param(key: &str, value: &ParamValue) -> Result<i64> {
    match value {
        ParamValue::Int(v) => Ok(*v),
        other => ConfigurationSnafu { key, reason: format!("expected an integer, got {other:?}") }.fail(),
    }
}

fn bool_param(key: &str, value: &ParamValue) -> Result<bool> {
    match value {
        ParamValue::Bool(v) => Ok(*v),
        ParamValue::Int(v) => Ok(*v != 0),
        other => ConfigurationSnafu { key, reason: format!("expected a boolean, got {other:?}") }.fail(),
    }
}

fn str_param(key: &str, value: &ParamValue) -> Result<String> {
    match value {
        ParamValue::Str(v) => Ok(v.clone()),
        other => ConfigurationSnafu { key, reason: format!("expected a string, got {other:?}") }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let params = SearchParams::default();
        assert_eq!(params.eps_greedy, 0.05);
        assert_eq!(params.population, 2048);
        assert_eq!(params.cpu_multi_level_tiling_structure, "SSRSRS");
    }

    #[test]
    fn builder_overrides() {
        let params = SearchParams::builder().eps_greedy(0.1).population(64).build();
        assert_eq!(params.eps_greedy, 0.1);
        assert_eq!(params.population, 64);
        assert_eq!(params.max_vectorize_size, 16);
    }

    #[test]
    fn from_map_reads_known_keys_and_ignores_unknown() {
        let mut map = HashMap::new();
        map.insert(keys::EPS_GREEDY.to_string(), ParamValue::Float(0.2));
        map.insert(keys::POPULATION.to_string(), ParamValue::Int(128));
        map.insert(keys::DISABLE_CHANGE_COMPUTE_LOCATION.to_string(), ParamValue::Int(1));
        map.insert("some.unknown.key".to_string(), ParamValue::Str("x".into()));
        let params = SearchParams::from_map(&map).unwrap();
        assert_eq!(params.eps_greedy, 0.2);
        assert_eq!(params.population, 128);
        assert!(params.disable_change_compute_location);
    }

    #[test]
    fn from_map_rejects_malformed_values() {
        let mut map = HashMap::new();
        map.insert(keys::EPS_GREEDY.to_string(), ParamValue::Str("fast".into()));
        assert!(SearchParams::from_map(&map).is_err());

        let mut map = HashMap::new();
        map.insert(keys::CPU_MULTI_LEVEL_TILING_STRUCTURE.to_string(), ParamValue::Str("SSXS".into()));
        assert!(SearchParams::from_map(&map).is_err());
    }

    #[test]
    fn structure_requires_a_spatial_level() {
        let mut map = HashMap::new();
        map.insert(keys::CPU_MULTI_LEVEL_TILING_STRUCTURE.to_string(), ParamValue::Str("RRRR".into()));
        assert!(SearchParams::from_map(&map).is_err());

        let mut map = HashMap::new();
        map.insert(keys::CPU_MULTI_LEVEL_TILING_STRUCTURE.to_string(), ParamValue::Str("SRS".into()));
        assert!(SearchParams::from_map(&map).is_ok());
    }
}
