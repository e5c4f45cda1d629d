use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// Tunables for the annotation core. The tolerance, backoff and sweep
/// numbers were picked empirically; keep them overridable rather than baked in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AnnotatorConfig {
    /// Max character drift between a cached signature and fresh text before
    /// the cached score is considered stale.
    pub length_tolerance: usize,
    /// Texts shorter than this many characters are calibrated as short-form.
    pub short_form_threshold: usize,
    /// Fewer words than this and the text is rejected before estimation.
    pub min_words: usize,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// How many times a caller waits on a held key before computing anyway.
    pub max_backoff_retries: u32,
    pub sweep_debounce_ms: u64,
    pub sweep_interval_ms: u64,
    pub channel_name: String,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            length_tolerance: 5,
            short_form_threshold: 100,
            min_words: 5,
            backoff_min_ms: 50,
            backoff_max_ms: 150,
            max_backoff_retries: 3,
            sweep_debounce_ms: 150,
            sweep_interval_ms: 2_000,
            channel_name: "iq-annotator-sync".into(),
        }
    }
}

impl AnnotatorConfig {
    /// Reads a JSON config file. A missing file yields defaults, and so does
    /// a file that fails to parse (after a warning).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring malformed config {}: {err}", path.display());
                Self::default()
            })
        } else {
            Self::default()
        };

        if debug_mode() {
            config.sweep_debounce_ms = config.sweep_debounce_ms.min(50);
            config.sweep_interval_ms = config.sweep_interval_ms.min(500);
        }

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn backoff_range(&self) -> (Duration, Duration) {
        let min = self.backoff_min_ms.min(self.backoff_max_ms);
        let max = self.backoff_min_ms.max(self.backoff_max_ms);
        (Duration::from_millis(min), Duration::from_millis(max))
    }

    pub fn sweep_debounce(&self) -> Duration {
        Duration::from_millis(self.sweep_debounce_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

fn debug_mode() -> bool {
    std::env::var("IQ_ANNOTATOR_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
