//! Provenance header written at the top of every record.
//!
//! Every measurement record and every sweep summary starts with three sections
//! that make a file self-describing long after the run:
//!
//! - **`software`**: name and version of this program, the git revision it was built
//!   from (when known) and the host name of the computer that ran the measurement.
//! - **`experiment settings`**: the execution control flags in effect.
//! - **`chip`**: the chip name and the path of its description file.
//!
//! The header is captured once per engine run with [`MetadataBuilder`] and then
//! copied into each record.

use crate::config::Settings;
use serde::{Deserialize, Serialize};

/// Software and host information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoftwareInfo {
    pub name: String,
    pub version: String,
    #[serde(rename = "git rev")]
    pub git_rev: String,
    pub computer: String,
}

impl Default for SoftwareInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_rev: option_env!("LABEXEC_GIT_REV").unwrap_or("unknown").to_string(),
            computer: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// Execution flags in effect while a record was written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExperimentSettingsInfo {
    #[serde(rename = "pause after each device")]
    pub pause_after_each_device: bool,
    #[serde(rename = "auto move stages to device")]
    pub auto_move_stages: bool,
    #[serde(rename = "execute search for peak")]
    pub search_for_peak: bool,
}

/// Chip identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChipInfo {
    pub name: String,
    #[serde(rename = "description file path")]
    pub description_file_path: String,
}

/// The full provenance header.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub software: SoftwareInfo,
    #[serde(rename = "experiment settings")]
    pub experiment_settings: ExperimentSettingsInfo,
    pub chip: ChipInfo,
}

impl Metadata {
    /// Capture the header for the given settings.
    pub fn from_settings(settings: &Settings) -> Self {
        MetadataBuilder::new()
            .chip(&settings.chip.name, &settings.chip.description_path)
            .pause_after_each_device(settings.execution.pause_after_each_device)
            .auto_move_stages(settings.execution.auto_move_stages)
            .search_for_peak(settings.execution.search_for_peak)
            .build()
    }

    /// Write the three header sections into a free-form JSON document.
    pub fn write_into(
        &self,
        target: &mut serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Result<()> {
        target.insert("software".into(), serde_json::to_value(&self.software)?);
        target.insert(
            "experiment settings".into(),
            serde_json::to_value(&self.experiment_settings)?,
        );
        target.insert("chip".into(), serde_json::to_value(&self.chip)?);
        Ok(())
    }
}

/// A builder for constructing `Metadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chip(mut self, name: &str, description_file_path: &str) -> Self {
        self.inner.chip = ChipInfo {
            name: name.to_string(),
            description_file_path: description_file_path.to_string(),
        };
        self
    }

    pub fn pause_after_each_device(mut self, value: bool) -> Self {
        self.inner.experiment_settings.pause_after_each_device = value;
        self
    }

    pub fn auto_move_stages(mut self, value: bool) -> Self {
        self.inner.experiment_settings.auto_move_stages = value;
        self
    }

    pub fn search_for_peak(mut self, value: bool) -> Self {
        self.inner.experiment_settings.search_for_peak = value;
        self
    }

    pub fn build(self) -> Metadata {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_keys_use_record_names() {
        let meta = MetadataBuilder::new()
            .chip("wafer7", "/chips/wafer7.json")
            .search_for_peak(true)
            .build();
        let mut doc = serde_json::Map::new();
        meta.write_into(&mut doc).unwrap();

        let keys: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(keys, ["software", "experiment settings", "chip"]);
        assert_eq!(doc["chip"]["description file path"], "/chips/wafer7.json");
        assert_eq!(doc["experiment settings"]["execute search for peak"], true);
        assert!(doc["software"].get("git rev").is_some());
    }

    #[test]
    fn test_from_settings() {
        let mut settings = Settings::default();
        settings.chip.name = "wafer9".into();
        settings.execution.pause_after_each_device = true;
        let meta = Metadata::from_settings(&settings);
        assert_eq!(meta.chip.name, "wafer9");
        assert!(meta.experiment_settings.pause_after_each_device);
        assert!(!meta.experiment_settings.auto_move_stages);
    }
}
