//! Engine configuration.
//!
//! Every section has defaults matching the stock pool layout, can be loaded
//! from JSON, and can be overridden from `VGPU_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command_pool::{CommandPoolSpec, PoolClass};
use crate::dependency::{HazardPolicy, MAX_DEPENDENTS};
use crate::error::VgpuError;
use crate::id_pool::OverflowPolicy;
use crate::memory::{AccessPattern, MemoryPoolSpec, POOL_ADDRESS_STRIDE};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("malformed configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ConfigError> for VgpuError {
    fn from(err: ConfigError) -> Self {
        VgpuError::BadArgument(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdPoolConfig {
    pub buffer_recycle_capacity: usize,
    pub texture_recycle_capacity: usize,
    pub command_buffer_recycle_capacity: usize,
    pub transfer_recycle_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for IdPoolConfig {
    fn default() -> Self {
        Self {
            buffer_recycle_capacity: 256,
            texture_recycle_capacity: 128,
            command_buffer_recycle_capacity: 64,
            transfer_recycle_capacity: 32,
            overflow_policy: OverflowPolicy::EvictOldestQuarter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPoolConfig {
    pub pools: Vec<CommandPoolSpec>,
    pub allow_expansion: bool,
    /// Largest capacity any sub-pool may grow to.
    pub hard_cap: u32,
    pub allow_sibling_fallback: bool,
    pub registry_capacity: usize,
    /// Return ids of completed, non-reusable buffers to the id pool.
    pub recycle_ids_on_complete: bool,
}

impl Default for CommandPoolConfig {
    fn default() -> Self {
        Self {
            pools: vec![
                CommandPoolSpec::new("critical", PoolClass::Critical, 32),
                CommandPoolSpec::new("standard", PoolClass::Standard, 128),
                CommandPoolSpec::new("compute", PoolClass::Compute, 64),
                CommandPoolSpec::new("background", PoolClass::Background, 64),
            ],
            allow_expansion: true,
            hard_cap: 512,
            allow_sibling_fallback: true,
            registry_capacity: 256,
            recycle_ids_on_complete: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    pub policy: HazardPolicy,
    pub max_dependents: usize,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            policy: HazardPolicy::PriorityHeuristic,
            max_dependents: MAX_DEPENDENTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub pools: Vec<MemoryPoolSpec>,
    pub alignment: u64,
    pub expansion_ceiling: u64,
    pub allow_expansion: bool,
    pub allow_sibling_fallback: bool,
    pub batching_enabled: bool,
    /// Writes strictly smaller than this are batched.
    pub batch_threshold: u64,
    /// A priority queue reaching this depth is flushed immediately.
    pub batch_queue_depth: usize,
    pub coherency_cache_capacity: usize,
    /// Low-priority writes at least this large may be deferred...
    pub stall_threshold_bytes: u64,
    /// ...while at least this many submissions are in flight.
    pub stall_inflight_submissions: usize,
    /// Device context that receives transfer submissions.
    pub transfer_context_id: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pools: vec![
                MemoryPoolSpec::new("fast-coherent", 16 * MIB, AccessPattern::Frequent)
                    .coherent(true),
                MemoryPoolSpec::new("standard", 64 * MIB, AccessPattern::Mixed),
                MemoryPoolSpec::new("texture-optimized", 128 * MIB, AccessPattern::ReadMostly),
                MemoryPoolSpec::new("streaming", 32 * MIB, AccessPattern::Streaming)
                    .coherent(true),
                MemoryPoolSpec::new("bulk", 256 * MIB, AccessPattern::Sequential),
            ],
            alignment: 256,
            expansion_ceiling: GIB,
            allow_expansion: true,
            allow_sibling_fallback: true,
            batching_enabled: true,
            batch_threshold: 8 * KIB,
            batch_queue_depth: 32,
            coherency_cache_capacity: 64,
            stall_threshold_bytes: 4 * MIB,
            stall_inflight_submissions: 4,
            transfer_context_id: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramePacingConfig {
    pub enabled: bool,
    pub interval_us: u64,
}

impl Default for FramePacingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_us: 16_667,
        }
    }
}

impl FramePacingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Context used by `create_command_buffer` when none is given.
    pub default_context_id: u32,
    pub ids: IdPoolConfig,
    pub command_pools: CommandPoolConfig,
    pub dependencies: DependencyConfig,
    pub memory: MemoryConfig,
    pub frame_pacing: FramePacingConfig,
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `VGPU_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let env = Env(&lookup);

        if let Some(v) = env.parse("VGPU_DEFAULT_CONTEXT")? {
            config.default_context_id = v;
        }
        if let Some(v) = env.flag("VGPU_COMMAND_POOL_EXPANSION")? {
            config.command_pools.allow_expansion = v;
        }
        if let Some(v) = env.parse("VGPU_COMMAND_POOL_HARD_CAP")? {
            config.command_pools.hard_cap = v;
        }
        if let Some(v) = env.parse("VGPU_REGISTRY_CAPACITY")? {
            config.command_pools.registry_capacity = v;
        }
        if let Some(v) = env.flag("VGPU_RECYCLE_ON_COMPLETE")? {
            config.command_pools.recycle_ids_on_complete = v;
        }
        if let Some(raw) = lookup("VGPU_HAZARD_POLICY") {
            config.dependencies.policy = match raw.trim() {
                "priority_heuristic" | "heuristic" => HazardPolicy::PriorityHeuristic,
                "resource_access" | "access" => HazardPolicy::ResourceAccess,
                _ => return Err(ConfigError::InvalidEnv("VGPU_HAZARD_POLICY")),
            };
        }
        if let Some(v) = env.parse("VGPU_MEMORY_ALIGNMENT")? {
            config.memory.alignment = v;
        }
        if let Some(v) = env.parse("VGPU_MEMORY_EXPANSION_CEILING")? {
            config.memory.expansion_ceiling = v;
        }
        if let Some(v) = env.flag("VGPU_MEMORY_EXPANSION")? {
            config.memory.allow_expansion = v;
        }
        if let Some(v) = env.flag("VGPU_TRANSFER_BATCHING")? {
            config.memory.batching_enabled = v;
        }
        if let Some(v) = env.parse("VGPU_BATCH_THRESHOLD")? {
            config.memory.batch_threshold = v;
        }
        if let Some(v) = env.flag("VGPU_FRAME_PACING")? {
            config.frame_pacing.enabled = v;
        }
        if let Some(v) = env.parse("VGPU_FRAME_INTERVAL_US")? {
            config.frame_pacing.interval_us = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let pools = &self.command_pools;
        if pools.pools.is_empty() {
            return invalid("at least one command buffer pool is required".into());
        }
        if pools.hard_cap == 0 {
            return invalid("command pool hard_cap must be > 0".into());
        }
        for spec in &pools.pools {
            if spec.capacity == 0 || spec.capacity > pools.hard_cap {
                return invalid(format!(
                    "command pool '{}' capacity {} must be in 1..={}",
                    spec.name, spec.capacity, pools.hard_cap
                ));
            }
        }
        if pools.registry_capacity == 0 {
            return invalid("registry_capacity must be > 0".into());
        }

        let deps = &self.dependencies;
        if deps.max_dependents == 0 || deps.max_dependents > MAX_DEPENDENTS {
            return invalid(format!("max_dependents must be in 1..={MAX_DEPENDENTS}"));
        }

        let mem = &self.memory;
        if mem.pools.is_empty() {
            return invalid("at least one memory pool is required".into());
        }
        if !mem.alignment.is_power_of_two() {
            return invalid(format!("alignment {} is not a power of two", mem.alignment));
        }
        if mem.expansion_ceiling == 0 || mem.expansion_ceiling > POOL_ADDRESS_STRIDE {
            return invalid(format!(
                "expansion_ceiling must be in 1..={POOL_ADDRESS_STRIDE} bytes"
            ));
        }
        for spec in &mem.pools {
            let limit = spec.max_size.unwrap_or(mem.expansion_ceiling);
            if spec.size == 0 || spec.size > limit || limit > mem.expansion_ceiling {
                return invalid(format!(
                    "memory pool '{}' size {} exceeds its limit",
                    spec.name, spec.size
                ));
            }
        }
        if mem.coherency_cache_capacity == 0 {
            return invalid("coherency_cache_capacity must be > 0".into());
        }
        if mem.batch_queue_depth == 0 {
            return invalid("batch_queue_depth must be > 0".into());
        }

        if self.frame_pacing.enabled && self.frame_pacing.interval_us == 0 {
            return invalid("frame pacing interval must be > 0".into());
        }
        Ok(())
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: std::str::FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match (self.0)(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidEnv(key)),
        }
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        match (self.0)(key).as_deref().map(str::trim) {
            None => Ok(None),
            Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
            Some("0" | "false" | "no" | "off") => Ok(Some(false)),
            Some(_) => Err(ConfigError::InvalidEnv(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.command_pools.registry_capacity, 256);
        assert_eq!(config.command_pools.hard_cap, 512);
        assert_eq!(config.memory.alignment, 256);
        assert_eq!(config.memory.batch_threshold, 8 * 1024);
        assert_eq!(config.memory.pools.len(), 5);
    }

    #[test]
    fn env_overrides_apply() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("VGPU_COMMAND_POOL_EXPANSION", "0"),
            ("VGPU_HAZARD_POLICY", "resource_access"),
            ("VGPU_FRAME_INTERVAL_US", "8333"),
        ]))
        .unwrap();
        assert!(!config.command_pools.allow_expansion);
        assert_eq!(config.dependencies.policy, HazardPolicy::ResourceAccess);
        assert_eq!(config.frame_pacing.interval(), Duration::from_micros(8333));
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let err = EngineConfig::from_lookup(lookup(&[("VGPU_REGISTRY_CAPACITY", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv("VGPU_REGISTRY_CAPACITY")));
        let err =
            EngineConfig::from_lookup(lookup(&[("VGPU_TRANSFER_BATCHING", "maybe")])).unwrap_err();
        assert_eq!(err.to_string(), "invalid value for env var VGPU_TRANSFER_BATCHING");
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = EngineConfig::from_json(
            r#"{"command_pools":{"allow_expansion":false},"memory":{"alignment":512}}"#,
        )
        .unwrap();
        assert!(!config.command_pools.allow_expansion);
        assert_eq!(config.command_pools.pools.len(), 4);
        assert_eq!(config.memory.alignment, 512);
        assert_eq!(config.memory.expansion_ceiling, GIB);
    }

    #[test]
    fn validation_rejects_inconsistent_limits() {
        let mut config = EngineConfig::default();
        config.memory.alignment = 300;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.command_pools.pools[0].capacity = 600;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.memory.pools[0].size = 2 * GIB;
        assert!(config.validate().is_err());

        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(ConfigError::Json(_))
        ));
    }
}
