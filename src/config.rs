//! Engine configuration read from a TOML file.
//!
//! Every field has a default so a missing or partial file still produces a
//! usable configuration.

use {
    crate::bake::BakeSettings,
    serde::Deserialize,
    std::path::{Path, PathBuf},
};

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root every scene-file asset path resolves against.
    pub content_root: PathBuf,
    /// Directory holding compiled SPIR-V shader blobs.
    pub shader_root: PathBuf,
    /// `env_logger`-style filter string.
    pub log_filter: String,
    pub bake: BakeSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            content_root: PathBuf::from("content"),
            shader_root: PathBuf::from("assets/shaders"),
            log_filter: "info".to_owned(),
            bake: BakeSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Read a config file; a missing file or a parse error falls back to
    /// defaults (the error is logged, not fatal).
    pub fn read(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(err) => {
                    log::warn!("config {}: {err}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn shader_path(&self, name: &str) -> PathBuf {
        self.shader_root.join(name)
    }
}

/// Initialize the process logger honoring the configured filter; safe to
/// call more than once.
pub fn init_logging(config: &EngineConfig) {
    let _ = pretty_env_logger::formatted_builder()
        .parse_filters(&config.log_filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: EngineConfig =
            toml::from_str("content_root = \"game\"\n[bake]\nresolution = 64\n")
                .unwrap();
        assert_eq!(config.content_root, PathBuf::from("game"));
        assert_eq!(config.bake.resolution, 64);
        // Untouched fields fall back.
        assert_eq!(config.shader_root, PathBuf::from("assets/shaders"));
        assert!(config.bake.enable_shadows);
    }

    #[test]
    fn missing_file_is_defaults() {
        let config = EngineConfig::read("/definitely/not/here.toml");
        assert_eq!(config.log_filter, "info");
    }
}
