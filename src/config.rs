//! Decoder configuration.
//!
//! Search parameters are loaded from multiple sources with `figment`, in
//! increasing priority: built-in defaults, `decoder.toml`, `decoder.yaml`, and
//! environment variables prefixed with `DECODER_`. Compile-time values that never
//! change live in [`crate::constants`].

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::lattice::DEFAULT_FRAME_RATE;
use crate::constants::score::DEFAULT_LOG_BASE;
use crate::constants::tables::{ACTIVE_INITIAL, BP_TABLE_INITIAL};
use crate::error::{DecoderError, Result};
use crate::types::Beam;

// Default value functions for serde defaults
fn default_log_base() -> f64 { DEFAULT_LOG_BASE }
fn default_beam() -> Beam { Beam(1e-48) }
fn default_pbeam() -> Beam { Beam(1e-48) }
fn default_wbeam() -> Beam { Beam(7e-29) }
fn default_fwdflat_beam() -> Beam { Beam(1e-64) }
fn default_fwdflat_wbeam() -> Beam { Beam(7e-29) }
fn default_lw() -> f32 { 6.5 }
fn default_fwdflat_lw() -> f32 { 8.5 }
fn default_bestpath_lw() -> f32 { 9.5 }
fn default_wip() -> f64 { 0.65 }
fn default_silprob() -> f64 { 0.005 }
fn default_fillprob() -> f64 { 1e-8 }
fn default_max_sf_win() -> usize { 25 }
fn default_partial_interval() -> usize { 10 }
fn default_frame_rate() -> u32 { DEFAULT_FRAME_RATE }
fn default_true() -> bool { true }
fn default_bp_table_initial() -> usize { BP_TABLE_INITIAL }
fn default_active_initial() -> usize { ACTIVE_INITIAL }
fn default_log_level() -> String { "info".to_string() }

/// Search configuration shared by all passes of a decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Base of the integer log domain
    #[serde(default = "default_log_base")]
    pub log_base: f64,

    // Tree pass
    /// Main HMM beam of the tree pass
    #[serde(default = "default_beam")]
    pub beam: Beam,

    /// Beam for phone transitions in the tree pass
    #[serde(default = "default_pbeam")]
    pub pbeam: Beam,

    /// Beam for word exits in the tree pass
    #[serde(default = "default_wbeam")]
    pub wbeam: Beam,

    /// Language weight of the tree pass
    #[serde(default = "default_lw")]
    pub lw: f32,

    // Flat pass
    /// Run the flat-lexicon pass
    #[serde(default = "default_true")]
    pub fwdflat: bool,

    /// Main HMM beam of the flat pass
    #[serde(default = "default_fwdflat_beam")]
    pub fwdflat_beam: Beam,

    /// Beam for word exits in the flat pass
    #[serde(default = "default_fwdflat_wbeam")]
    pub fwdflat_wbeam: Beam,

    /// Language weight of the flat pass
    #[serde(default = "default_fwdflat_lw")]
    pub fwdflat_lw: f32,

    /// Frames around a tree-pass word start in which the flat pass may enter it
    #[serde(default = "default_max_sf_win")]
    pub max_sf_win: usize,

    // Bestpath pass
    /// Run the lattice bestpath pass
    #[serde(default = "default_true")]
    pub bestpath: bool,

    /// Language weight of the bestpath pass
    #[serde(default = "default_bestpath_lw")]
    pub bestpath_lw: f32,

    // Shared word penalties
    /// Word insertion penalty (probability)
    #[serde(default = "default_wip")]
    pub wip: f64,

    /// Silence word probability
    #[serde(default = "default_silprob")]
    pub silprob: f64,

    /// Filler word probability
    #[serde(default = "default_fillprob")]
    pub fillprob: f64,

    // Streaming
    /// Frames between partial hypotheses of the tree pass (0 disables them)
    #[serde(default = "default_partial_interval")]
    pub partial_interval: usize,

    /// Frames per second, for times in lattice files
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Keep acoustic scores on emitted arcs
    #[serde(default = "default_true")]
    pub keep_scores: bool,

    // Table sizing
    /// Initial backpointer table entries
    #[serde(default = "default_bp_table_initial")]
    pub bp_table_initial: usize,

    /// Initial per-frame active array slots
    #[serde(default = "default_active_initial")]
    pub active_initial: usize,

    // Logging
    /// Default log level when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            log_base: default_log_base(),
            beam: default_beam(),
            pbeam: default_pbeam(),
            wbeam: default_wbeam(),
            lw: default_lw(),
            fwdflat: true,
            fwdflat_beam: default_fwdflat_beam(),
            fwdflat_wbeam: default_fwdflat_wbeam(),
            fwdflat_lw: default_fwdflat_lw(),
            max_sf_win: default_max_sf_win(),
            bestpath: true,
            bestpath_lw: default_bestpath_lw(),
            wip: default_wip(),
            silprob: default_silprob(),
            fillprob: default_fillprob(),
            partial_interval: default_partial_interval(),
            frame_rate: default_frame_rate(),
            keep_scores: true,
            bp_table_initial: default_bp_table_initial(),
            active_initial: default_active_initial(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl DecoderConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables prefixed `DECODER_` (highest priority)
    /// 2. decoder.yaml (if exists)
    /// 3. decoder.toml (if exists)
    /// 4. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        Self::extract(
            Self::default_figment()
                .merge(Toml::file("decoder.toml"))
                .merge(Yaml::file("decoder.yaml"))
                .merge(Env::prefixed("DECODER_")),
        )
    }

    /// Load configuration from a specific TOML or YAML file over the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::default_figment().merge(Yaml::file(path)),
            _ => Self::default_figment().merge(Toml::file(path)),
        };
        debug!("Loading decoder configuration from {:?}", path);
        Self::extract(figment.merge(Env::prefixed("DECODER_")))
    }

    fn default_figment() -> Figment {
        Figment::from(Serialized::defaults(DecoderConfig::default()))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: DecoderConfig = figment.extract().map_err(|e| {
            DecoderError::Configuration(format!("Failed to load configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !(self.log_base > 1.0) || !self.log_base.is_finite() {
            return Err(DecoderError::Configuration(format!(
                "log_base must be greater than 1, got {}",
                self.log_base
            )));
        }

        for (name, beam) in [
            ("beam", self.beam),
            ("pbeam", self.pbeam),
            ("wbeam", self.wbeam),
            ("fwdflat_beam", self.fwdflat_beam),
            ("fwdflat_wbeam", self.fwdflat_wbeam),
        ] {
            Beam::new(beam.value()).map_err(|_| {
                DecoderError::Configuration(format!("{} must be in (0, 1], got {}", name, beam))
            })?;
        }

        for (name, lw) in [
            ("lw", self.lw),
            ("fwdflat_lw", self.fwdflat_lw),
            ("bestpath_lw", self.bestpath_lw),
        ] {
            if !(lw > 0.0) || !lw.is_finite() {
                return Err(DecoderError::Configuration(format!(
                    "{} must be positive, got {}",
                    name, lw
                )));
            }
        }

        for (name, prob) in [
            ("wip", self.wip),
            ("silprob", self.silprob),
            ("fillprob", self.fillprob),
        ] {
            if !(prob > 0.0 && prob <= 1.0) {
                return Err(DecoderError::Configuration(format!(
                    "{} must be a probability in (0, 1], got {}",
                    name, prob
                )));
            }
        }

        if self.bestpath && !self.fwdflat {
            debug!("bestpath enabled without fwdflat: lattice will be built from tree-pass arcs");
        }

        if self.frame_rate == 0 {
            return Err(DecoderError::Configuration(
                "frame_rate must be non-zero".to_string(),
            ));
        }

        if self.bp_table_initial == 0 || self.active_initial == 0 {
            return Err(DecoderError::Configuration(
                "initial table sizes must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Export configuration to TOML format
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DecoderError::Configuration(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Export configuration to YAML format
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| DecoderError::Configuration(format!("Failed to serialize to YAML: {}", e)))
    }
}
