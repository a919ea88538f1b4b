//! Run configuration for the contrastive objective.
//!
//! `RankCseConfig` aggregates the pooling, contrastive, rank-correlation and
//! masked-language-model sections. It is loaded once per run and never
//! mutated afterwards.
//!
//! # Loading Configuration
//!
//! ```rust,ignore
//! use rankcse::RankCseConfig;
//!
//! let config = RankCseConfig::from_file("rankcse.toml")?.with_env_overrides();
//! config.validate()?;
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! [pooling]
//! pooler_type = "cls"
//! mlp_only_train = false
//! backbone_pooling_layer = false
//!
//! [contrastive]
//! temperature = 0.05
//! hard_negative_weight = 0.0
//!
//! [rank]
//! enabled = true
//! metric = "spearman"
//! thresh_low = -1.0
//! thresh_upp = 1.0
//! lambda = 0.05
//! combination = "weighted_sum"
//!
//! [mlm]
//! enabled = false
//! weight = 0.1
//! ```
//!
//! Selector fields (`pooler_type`, `metric`, `combination`) are closed enums.
//! An unknown value fails with `RankCseError::UnsupportedConfig` while the
//! file is parsed, never on first use.

use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RankCseError, RankCseResult};

// ============================================================================
// SELECTOR ENUMS
// ============================================================================

/// Strategy used to reduce per-token hidden states to one sentence vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum PoolerType {
    /// First token of the last layer, followed by the MLP projection head.
    #[default]
    Cls,
    /// First token of the last layer, no projection head.
    ClsBeforePooler,
    /// Mask-weighted mean of the last layer.
    Avg,
    /// Mask-weighted mean of the average of the last two layers.
    AvgTop2,
    /// Mask-weighted mean of the average of the first and last layers.
    AvgFirstLast,
}

impl PoolerType {
    /// Returns all pooler types.
    pub fn all() -> &'static [PoolerType] {
        &[
            PoolerType::Cls,
            PoolerType::ClsBeforePooler,
            PoolerType::Avg,
            PoolerType::AvgTop2,
            PoolerType::AvgFirstLast,
        ]
    }

    /// Returns the pooler name as snake_case string.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolerType::Cls => "cls",
            PoolerType::ClsBeforePooler => "cls_before_pooler",
            PoolerType::Avg => "avg",
            PoolerType::AvgTop2 => "avg_top2",
            PoolerType::AvgFirstLast => "avg_first_last",
        }
    }

    /// Whether the backbone must return the hidden states of every layer.
    pub fn needs_hidden_states(&self) -> bool {
        matches!(self, PoolerType::AvgTop2 | PoolerType::AvgFirstLast)
    }

    /// Whether this pooler is paired with the MLP projection head.
    pub fn uses_projection_head(&self) -> bool {
        matches!(self, PoolerType::Cls)
    }
}

impl FromStr for PoolerType {
    type Err = RankCseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PoolerType::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| RankCseError::unsupported(format!("unrecognized pooling type '{}'", s)))
    }
}

impl TryFrom<String> for PoolerType {
    type Error = RankCseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for PoolerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the contrastive loss and the rank-correlation loss are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum LossCombination {
    /// `contrastive + λ · rank`
    #[default]
    WeightedSum,
    /// `max(contrastive, λ · rank)`
    Hinge,
}

impl LossCombination {
    /// Returns all combination policies.
    pub fn all() -> &'static [LossCombination] {
        &[LossCombination::WeightedSum, LossCombination::Hinge]
    }

    /// Returns the policy name as snake_case string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LossCombination::WeightedSum => "weighted_sum",
            LossCombination::Hinge => "hinge",
        }
    }
}

impl FromStr for LossCombination {
    type Err = RankCseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LossCombination::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| RankCseError::unsupported(format!("unrecognized loss combination '{}'", s)))
    }
}

impl TryFrom<String> for LossCombination {
    type Error = RankCseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for LossCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric used to build the rank target from auxiliary distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum RankMetric {
    /// Spearman-style correlation of stable-sort ranks.
    #[default]
    Spearman,
}

impl RankMetric {
    /// Returns the metric name as snake_case string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RankMetric::Spearman => "spearman",
        }
    }
}

impl FromStr for RankMetric {
    type Err = RankCseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spearman" | "spearmanr" => Ok(RankMetric::Spearman),
            _ => Err(RankCseError::unsupported(format!(
                "similarity metric '{}' is not implemented",
                s
            ))),
        }
    }
}

impl TryFrom<String> for RankMetric {
    type Error = RankCseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// POOLING CONFIG
// ============================================================================

/// Pooling and projection-head settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingConfig {
    /// Pooling strategy.
    #[serde(default)]
    pub pooler_type: PoolerType,

    /// Use the projection head during training only; sentence-embedding
    /// forwards then return the raw pooled vector.
    #[serde(default)]
    pub mlp_only_train: bool,

    /// Whether the backbone exposes its own pooling head. When set, the
    /// backbone's pooled output is passed through in sentence-embedding mode.
    #[serde(default)]
    pub backbone_pooling_layer: bool,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            pooler_type: PoolerType::default(),
            mlp_only_train: false,
            backbone_pooling_layer: false,
        }
    }
}

// ============================================================================
// CONTRASTIVE CONFIG
// ============================================================================

/// In-batch contrastive loss settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastiveConfig {
    /// Cosine similarity divisor. Must be positive.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Logit bonus added to each anchor's own hard negative.
    #[serde(default)]
    pub hard_negative_weight: f32,
}

fn default_temperature() -> f32 {
    0.05
}

impl Default for ContrastiveConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            hard_negative_weight: 0.0,
        }
    }
}

impl ContrastiveConfig {
    /// Validate contrastive settings.
    ///
    /// # Errors
    /// - `RankCseError::ConfigError` if temperature is not a positive finite
    ///   number or the hard-negative weight is not finite
    pub fn validate(&self) -> RankCseResult<()> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(RankCseError::ConfigError {
                message: format!("temperature must be positive, got {}", self.temperature),
            });
        }
        if !self.hard_negative_weight.is_finite() {
            return Err(RankCseError::ConfigError {
                message: format!(
                    "hard_negative_weight must be finite, got {}",
                    self.hard_negative_weight
                ),
            });
        }
        Ok(())
    }
}

// ============================================================================
// RANK CONFIG
// ============================================================================

/// Rank-correlation auxiliary loss settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankConfig {
    /// Whether the rank-correlation term is computed at all.
    #[serde(default = "default_rank_enabled")]
    pub enabled: bool,

    /// Metric used to build the target matrix.
    #[serde(default)]
    pub metric: RankMetric,

    /// Inclusive lower bound of the target-value window.
    #[serde(default = "default_thresh_low")]
    pub thresh_low: f32,

    /// Inclusive upper bound of the target-value window.
    #[serde(default = "default_thresh_upp")]
    pub thresh_upp: f32,

    /// Weight λ of the rank-correlation term.
    #[serde(default = "default_lambda")]
    pub lambda: f32,

    /// Combination policy.
    #[serde(default)]
    pub combination: LossCombination,
}

fn default_rank_enabled() -> bool {
    true
}

fn default_thresh_low() -> f32 {
    -1.0
}

fn default_thresh_upp() -> f32 {
    1.0
}

fn default_lambda() -> f32 {
    0.05
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            enabled: default_rank_enabled(),
            metric: RankMetric::default(),
            thresh_low: default_thresh_low(),
            thresh_upp: default_thresh_upp(),
            lambda: default_lambda(),
            combination: LossCombination::default(),
        }
    }
}

impl RankConfig {
    /// Validate rank-loss settings.
    ///
    /// Thresholds outside `[-1, 1]` are accepted: they simply select no
    /// entries, and the rank term falls back to zero.
    ///
    /// # Errors
    /// - `RankCseError::ConfigError` if a threshold or λ is not finite, or
    ///   `thresh_low > thresh_upp`
    pub fn validate(&self) -> RankCseResult<()> {
        if !self.thresh_low.is_finite() || !self.thresh_upp.is_finite() {
            return Err(RankCseError::ConfigError {
                message: format!(
                    "thresholds must be finite, got [{}, {}]",
                    self.thresh_low, self.thresh_upp
                ),
            });
        }
        if self.thresh_low > self.thresh_upp {
            return Err(RankCseError::ConfigError {
                message: format!(
                    "thresh_low ({}) must be <= thresh_upp ({})",
                    self.thresh_low, self.thresh_upp
                ),
            });
        }
        if !self.lambda.is_finite() {
            return Err(RankCseError::ConfigError {
                message: format!("lambda must be finite, got {}", self.lambda),
            });
        }
        Ok(())
    }

    /// Whether `value` falls inside the inclusive threshold window.
    pub fn accepts(&self, value: f32) -> bool {
        value >= self.thresh_low && value <= self.thresh_upp
    }
}

// ============================================================================
// MLM CONFIG
// ============================================================================

/// Masked-language-model auxiliary term settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlmConfig {
    /// Whether an LM head is expected to be attached to the encoder.
    #[serde(default)]
    pub enabled: bool,

    /// Weight of the MLM loss in the total.
    #[serde(default = "default_mlm_weight")]
    pub weight: f32,
}

fn default_mlm_weight() -> f32 {
    0.1
}

impl Default for MlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weight: default_mlm_weight(),
        }
    }
}

impl MlmConfig {
    /// Validate MLM settings.
    pub fn validate(&self) -> RankCseResult<()> {
        if !self.weight.is_finite() {
            return Err(RankCseError::ConfigError {
                message: format!("mlm weight must be finite, got {}", self.weight),
            });
        }
        Ok(())
    }
}

// ============================================================================
// ROOT CONFIG
// ============================================================================

/// Root configuration for the contrastive objective.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankCseConfig {
    /// Pooling and projection head.
    #[serde(default)]
    pub pooling: PoolingConfig,

    /// Contrastive cross-entropy.
    #[serde(default)]
    pub contrastive: ContrastiveConfig,

    /// Rank-correlation auxiliary loss.
    #[serde(default)]
    pub rank: RankConfig,

    /// Masked-language-model auxiliary loss.
    #[serde(default)]
    pub mlm: MlmConfig,
}

impl RankCseConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `RankCseError::IoError` if the file cannot be read
    /// - `RankCseError::ConfigError` if the file cannot be parsed
    /// - `RankCseError::UnsupportedConfig` if a selector value is unknown
    pub fn from_file(path: impl AsRef<Path>) -> RankCseResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        toml::from_str(&contents).map_err(|e| parse_error(e, &path.display().to_string()))
    }

    /// Create configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> RankCseResult<Self> {
        toml::from_str(toml).map_err(|e| parse_error(e, "<string>"))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml_string(&self) -> RankCseResult<String> {
        toml::to_string_pretty(self).map_err(|e| RankCseError::ConfigError {
            message: format!("Failed to serialize to TOML: {}", e),
        })
    }

    /// Validate all sections, returning the first error found.
    pub fn validate(&self) -> RankCseResult<()> {
        self.contrastive
            .validate()
            .map_err(|e| section_error("contrastive", e))?;
        self.rank.validate().map_err(|e| section_error("rank", e))?;
        self.mlm.validate().map_err(|e| section_error("mlm", e))?;
        Ok(())
    }

    /// Apply environment variable overrides. Prefix: `RANKCSE_`.
    ///
    /// | Variable | Config Path |
    /// |----------|-------------|
    /// | `RANKCSE_POOLER_TYPE` | `pooling.pooler_type` |
    /// | `RANKCSE_TEMPERATURE` | `contrastive.temperature` |
    /// | `RANKCSE_HARD_NEGATIVE_WEIGHT` | `contrastive.hard_negative_weight` |
    /// | `RANKCSE_RANK_LAMBDA` | `rank.lambda` |
    /// | `RANKCSE_RANK_THRESH_LOW` | `rank.thresh_low` |
    /// | `RANKCSE_RANK_THRESH_UPP` | `rank.thresh_upp` |
    /// | `RANKCSE_LOSS_COMBINATION` | `rank.combination` |
    /// | `RANKCSE_MLM_WEIGHT` | `mlm.weight` |
    ///
    /// Values that fail to parse are ignored with a warning.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<PoolerType>("RANKCSE_POOLER_TYPE") {
            self.pooling.pooler_type = v;
        }
        if let Some(v) = env_parse::<f32>("RANKCSE_TEMPERATURE") {
            self.contrastive.temperature = v;
        }
        if let Some(v) = env_parse::<f32>("RANKCSE_HARD_NEGATIVE_WEIGHT") {
            self.contrastive.hard_negative_weight = v;
        }
        if let Some(v) = env_parse::<f32>("RANKCSE_RANK_LAMBDA") {
            self.rank.lambda = v;
        }
        if let Some(v) = env_parse::<f32>("RANKCSE_RANK_THRESH_LOW") {
            self.rank.thresh_low = v;
        }
        if let Some(v) = env_parse::<f32>("RANKCSE_RANK_THRESH_UPP") {
            self.rank.thresh_upp = v;
        }
        if let Some(v) = env_parse::<LossCombination>("RANKCSE_LOSS_COMBINATION") {
            self.rank.combination = v;
        }
        if let Some(v) = env_parse::<f32>("RANKCSE_MLM_WEIGHT") {
            self.mlm.weight = v;
        }
        self
    }
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Ignoring {}={}: {}", key, raw, e);
            None
        }
    }
}

fn section_error(section: &str, e: RankCseError) -> RankCseError {
    match e {
        RankCseError::ConfigError { message } => RankCseError::ConfigError {
            message: format!("[{}] {}", section, message),
        },
        other => other,
    }
}

/// Selector enums fail through `TryFrom<String>`; their messages surface here
/// wrapped in the TOML error, so they are re-classified as unsupported.
fn parse_error(e: toml::de::Error, origin: &str) -> RankCseError {
    let message = e.message().to_string();
    if message.starts_with("Unsupported configuration: ") {
        RankCseError::UnsupportedConfig {
            message: message["Unsupported configuration: ".len()..].to_string(),
        }
    } else {
        RankCseError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", origin, e),
        }
    }
}
