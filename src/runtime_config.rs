// =============================================================================
// Runtime Configuration — Fusion engine settings with atomic save
// =============================================================================
//
// Loaded once at startup and immutable afterwards: the engine holds it behind
// an `Arc` and never mutates it. Every field carries `#[serde(default)]` so a
// partial JSON file still loads; `validate()` then rejects anything the
// pipeline cannot run with. Validation failures are fatal at startup, never
// deferred to the first inference call.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::{TrackId, TrackMap, TRACK_COUNT};

/// Tolerance used when checking that a static profile sums to one.
const PROFILE_SUM_TOLERANCE: f64 = 1e-6;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_tracks() -> Vec<TrackSpec> {
    TrackId::ALL
        .iter()
        .map(|&track| TrackSpec {
            track,
            window_len: default_window_len(track),
        })
        .collect()
}

fn default_window_len(track: TrackId) -> usize {
    match track {
        TrackId::M1 => 480,
        TrackId::M5 => 288,
        TrackId::M15 => 192,
        TrackId::H1 => 96,
        TrackId::H4 => 48,
    }
}

fn default_feature_dim() -> usize {
    24
}

fn default_model_width() -> usize {
    64
}

fn default_encoder_layers() -> usize {
    2
}

fn default_heads() -> usize {
    4
}

fn default_ffn_multiplier() -> usize {
    2
}

fn default_magnitude_outputs() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_decay_rate() -> f64 {
    0.98
}

fn default_weight_ceiling() -> f64 {
    0.6
}

fn default_entropy_floor() -> f64 {
    1.0
}

fn default_active_profile() -> String {
    "balanced".to_string()
}

fn default_profiles() -> BTreeMap<String, [f64; TRACK_COUNT]> {
    let mut profiles = BTreeMap::new();
    profiles.insert("balanced".to_string(), [0.2, 0.2, 0.2, 0.2, 0.2]);
    profiles.insert("scalp".to_string(), [0.35, 0.30, 0.20, 0.10, 0.05]);
    profiles.insert("intraday".to_string(), [0.10, 0.25, 0.30, 0.25, 0.10]);
    profiles.insert("swing".to_string(), [0.05, 0.10, 0.20, 0.30, 0.35]);
    profiles
}

fn default_staleness_threshold_secs() -> u64 {
    600
}

// =============================================================================
// Sub-sections
// =============================================================================

/// Window length for one resolution track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSpec {
    pub track: TrackId,
    pub window_len: usize,
}

/// Shape of the functional form used by freshness decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayMode {
    /// `w(t) = rate^(L-1-t)`
    #[default]
    Exponential,
    /// `w(t) = (t+1)/L`; the rate is unused.
    Linear,
}

/// How the static profile is combined with the dynamic fusion weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReweightMode {
    /// Dynamic attention weights only; the static profile is ignored.
    Disabled,
    /// Learned sigmoid gate blends dynamic and static.
    #[default]
    Gated,
    /// Fixed equal blend followed by renormalization (no learned gate).
    Renormalized,
}

/// Model dimensions and parameter source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Shared hidden width `D` across all tracks.
    #[serde(default = "default_model_width")]
    pub model_width: usize,

    /// Stacked recurrent layers per encoder.
    #[serde(default = "default_encoder_layers")]
    pub encoder_layers: usize,

    /// Heads in each intra-track attention pool.
    #[serde(default = "default_heads")]
    pub pool_heads: usize,

    /// Heads in the cross-track self-attention.
    #[serde(default = "default_heads")]
    pub fusion_heads: usize,

    /// Feed-forward expansion factor inside cross-track fusion.
    #[serde(default = "default_ffn_multiplier")]
    pub ffn_multiplier: usize,

    /// Number of magnitude scalars emitted by the magnitude head.
    #[serde(default = "default_magnitude_outputs")]
    pub magnitude_outputs: usize,

    /// Seed for deterministic parameter initialization.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Optional path to serialized trained parameters. When absent the
    /// engine runs with seeded initial parameters.
    #[serde(default)]
    pub weights_path: Option<String>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model_width: default_model_width(),
            encoder_layers: default_encoder_layers(),
            pool_heads: default_heads(),
            fusion_heads: default_heads(),
            ffn_multiplier: default_ffn_multiplier(),
            magnitude_outputs: default_magnitude_outputs(),
            seed: default_seed(),
            weights_path: None,
        }
    }
}

/// Freshness decay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayParams {
    #[serde(default)]
    pub mode: DecayMode,

    /// Initial value of the learned decay rate; must lie in (0, 1).
    #[serde(default = "default_decay_rate")]
    pub initial_rate: f64,
}

impl Default for DecayParams {
    fn default() -> Self {
        Self {
            mode: DecayMode::default(),
            initial_rate: default_decay_rate(),
        }
    }
}

/// Mode-specific reweighting and the normalization limits applied to the
/// final fusion weight vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReweightParams {
    #[serde(default)]
    pub mode: ReweightMode,

    /// Name of the static profile in `profiles` to blend against.
    #[serde(default = "default_active_profile")]
    pub active_profile: String,

    /// Named static per-track preference profiles (canonical track order).
    #[serde(default = "default_profiles")]
    pub profiles: BTreeMap<String, [f64; TRACK_COUNT]>,

    /// Maximum weight any single track may receive after normalization.
    #[serde(default = "default_weight_ceiling")]
    pub weight_ceiling: f64,

    /// Minimum Shannon entropy (nats) of the final weight vector.
    #[serde(default = "default_entropy_floor")]
    pub entropy_floor: f64,
}

impl Default for ReweightParams {
    fn default() -> Self {
        Self {
            mode: ReweightMode::default(),
            active_profile: default_active_profile(),
            profiles: default_profiles(),
            weight_ceiling: default_weight_ceiling(),
            entropy_floor: default_entropy_floor(),
        }
    }
}

impl ReweightParams {
    /// The active static profile. Only valid after `RuntimeConfig::validate`.
    pub fn active(&self) -> Option<[f64; TRACK_COUNT]> {
        self.profiles.get(&self.active_profile).copied()
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the fusion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// One entry per track, canonical order, fixed window lengths.
    #[serde(default = "default_tracks")]
    pub tracks: Vec<TrackSpec>,

    /// Per-bar feature count `F`, shared by every track after alignment.
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,

    #[serde(default)]
    pub model: ModelParams,

    #[serde(default)]
    pub decay: DecayParams,

    #[serde(default)]
    pub reweighting: ReweightParams,

    /// Maximum gap between session updates before cached state is discarded.
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tracks: default_tracks(),
            feature_dim: default_feature_dim(),
            model: ModelParams::default(),
            decay: DecayParams::default(),
            reweighting: ReweightParams::default(),
            staleness_threshold_secs: default_staleness_threshold_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Does not validate; callers run [`RuntimeConfig::validate`] next so that
    /// a missing file and an invalid file can be handled differently.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            feature_dim = config.feature_dim,
            model_width = config.model.model_width,
            reweighting = ?config.reweighting.mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Like [`RuntimeConfig::load`], but a missing file yields the defaults.
    /// A file that exists and fails to read or parse is still an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "runtime config not found, using defaults");
                Ok(Self::default())
            }
            _ => Self::load(path),
        }
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Window lengths keyed by track. Falls back to the track default for a
    /// track missing from `tracks`; `validate` rejects that case anyway.
    pub fn window_lens(&self) -> TrackMap<usize> {
        TrackMap::from_fn(|track| {
            self.tracks
                .iter()
                .find(|spec| spec.track == track)
                .map_or_else(|| default_window_len(track), |spec| spec.window_len)
        })
    }

    /// Reject any configuration the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidConfig(msg));

        // --- Tracks -----------------------------------------------------------
        if self.tracks.len() != TRACK_COUNT {
            return invalid(format!(
                "expected {TRACK_COUNT} track entries, found {}",
                self.tracks.len()
            ));
        }
        for (spec, expected) in self.tracks.iter().zip(TrackId::ALL) {
            if spec.track != expected {
                return invalid(format!(
                    "tracks must be listed in canonical order: expected {expected}, found {}",
                    spec.track
                ));
            }
            if spec.window_len == 0 {
                return invalid(format!("track {} has a zero window length", spec.track));
            }
        }
        if self.feature_dim == 0 {
            return invalid("feature_dim must be positive".into());
        }

        // --- Model ------------------------------------------------------------
        let m = &self.model;
        if m.model_width == 0 || m.encoder_layers == 0 || m.ffn_multiplier == 0 {
            return invalid("model_width, encoder_layers and ffn_multiplier must be positive".into());
        }
        if m.magnitude_outputs == 0 {
            return invalid("magnitude_outputs must be at least 1".into());
        }
        for (name, heads) in [("pool_heads", m.pool_heads), ("fusion_heads", m.fusion_heads)] {
            if heads == 0 || m.model_width % heads != 0 {
                return invalid(format!(
                    "{name}={heads} must be positive and divide model_width={}",
                    m.model_width
                ));
            }
        }

        // --- Decay ------------------------------------------------------------
        let rate = self.decay.initial_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return invalid(format!("decay.initial_rate={rate} must lie in (0, 1)"));
        }

        // --- Reweighting ------------------------------------------------------
        let rw = &self.reweighting;
        let uniform = 1.0 / TRACK_COUNT as f64;
        if !(rw.weight_ceiling >= uniform && rw.weight_ceiling <= 1.0) {
            return invalid(format!(
                "weight_ceiling={} must lie in [{uniform}, 1]",
                rw.weight_ceiling
            ));
        }
        let max_entropy = (TRACK_COUNT as f64).ln();
        if !(rw.entropy_floor >= 0.0 && rw.entropy_floor <= max_entropy) {
            return invalid(format!(
                "entropy_floor={} must lie in [0, ln {TRACK_COUNT}]",
                rw.entropy_floor
            ));
        }
        for (name, profile) in &rw.profiles {
            if profile.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return invalid(format!("profile {name:?} has a negative or non-finite entry"));
            }
            let sum: f64 = profile.iter().sum();
            if (sum - 1.0).abs() > PROFILE_SUM_TOLERANCE {
                return invalid(format!("profile {name:?} sums to {sum}, expected 1"));
            }
        }
        if !rw.profiles.contains_key(&rw.active_profile) {
            return invalid(format!(
                "active_profile {:?} is not among the configured profiles",
                rw.active_profile
            ));
        }

        if self.staleness_threshold_secs == 0 {
            return invalid("staleness_threshold_secs must be positive".into());
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = RuntimeConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.tracks.len(), TRACK_COUNT);
        assert_eq!(cfg.window_lens()[TrackId::M1], 480);
        assert_eq!(cfg.window_lens()[TrackId::H4], 48);
        assert_eq!(cfg.reweighting.mode, ReweightMode::Gated);
        assert!((cfg.reweighting.weight_ceiling - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.feature_dim, 24);
        assert_eq!(cfg.model.model_width, 64);
        assert_eq!(cfg.decay.mode, DecayMode::Exponential);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "reweighting": { "mode": "disabled" }, "decay": { "mode": "linear" } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.reweighting.mode, ReweightMode::Disabled);
        assert_eq!(cfg.reweighting.active_profile, "balanced");
        assert_eq!(cfg.decay.mode, DecayMode::Linear);
        assert!((cfg.decay.initial_rate - 0.98).abs() < f64::EPSILON);
    }

    #[test]
    fn profile_not_summing_to_one_is_fatal() {
        let mut cfg = RuntimeConfig::default();
        cfg.reweighting
            .profiles
            .insert("broken".into(), [0.5, 0.5, 0.5, 0.0, 0.0]);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(ref m) if m.contains("broken")));
    }

    #[test]
    fn negative_profile_entry_is_fatal() {
        let mut cfg = RuntimeConfig::default();
        cfg.reweighting
            .profiles
            .insert("neg".into(), [1.2, -0.2, 0.0, 0.0, 0.0]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_active_profile_is_fatal() {
        let mut cfg = RuntimeConfig::default();
        cfg.reweighting.active_profile = "nope".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn heads_must_divide_width() {
        let mut cfg = RuntimeConfig::default();
        cfg.model.pool_heads = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn decay_rate_outside_unit_interval_is_fatal() {
        for rate in [0.0, 1.0, 1.5, -0.1] {
            let mut cfg = RuntimeConfig::default();
            cfg.decay.initial_rate = rate;
            assert!(cfg.validate().is_err(), "rate {rate} accepted");
        }
    }

    #[test]
    fn ceiling_below_uniform_is_fatal() {
        let mut cfg = RuntimeConfig::default();
        cfg.reweighting.weight_ceiling = 0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tracks_out_of_order_are_fatal() {
        let mut cfg = RuntimeConfig::default();
        cfg.tracks.swap(0, 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("aurora-fusion-absent-{}.json", std::process::id()));
        let cfg = RuntimeConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg.reweighting.active_profile, "balanced");
    }

    #[test]
    fn malformed_profile_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("aurora-fusion-bad-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"reweighting":{"active_profile":"scalp","profiles":{"scalp":[0.5,0.5]}}}"#,
        )
        .unwrap();
        let result = RuntimeConfig::load_or_default(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = std::env::temp_dir().join(format!("aurora-fusion-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fusion_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.staleness_threshold_secs = 1234;
        cfg.save(&path).unwrap();
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.staleness_threshold_secs, 1234);
        assert_eq!(loaded.tracks, cfg.tracks);

        std::fs::remove_dir_all(&dir).ok();
    }
}
