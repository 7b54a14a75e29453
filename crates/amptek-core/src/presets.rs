//! Bundled default configurations.
//!
//! Presets are vendor configuration files compiled into the crate and parsed
//! once per process. Entries the target model cannot take are dropped while
//! loading, so applying a preset only ever sends parameters the model knows.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{AmptekError, Result};
use crate::params::{Configuration, ParamCode};
use crate::protocol::DeviceModel;

const BUNDLED: &[(DeviceModel, &str, &str)] = &[
    (
        DeviceModel::Dp5,
        "SDD Default DP5",
        include_str!("../presets/DP5/sdd_default.txt"),
    ),
    (
        DeviceModel::Dp5,
        "Si-PIN Default DP5",
        include_str!("../presets/DP5/sipin_default.txt"),
    ),
    (
        DeviceModel::Px5,
        "SDD Default PX5",
        include_str!("../presets/PX5/sdd_default.txt"),
    ),
    (
        DeviceModel::Dp5g,
        "NaI Default DP5G",
        include_str!("../presets/DP5G/nai_default.txt"),
    ),
    (
        DeviceModel::Mca8000d,
        "MCA8000D Default",
        include_str!("../presets/MCA8000D/default.txt"),
    ),
    (
        DeviceModel::Tb5,
        "NaI Default TB5",
        include_str!("../presets/TB5/nai_default.txt"),
    ),
    (
        DeviceModel::Dp5x,
        "Si-PIN Default DP5X",
        include_str!("../presets/DP5X/sipin_default.txt"),
    ),
];

static BUNDLED_STORE: Lazy<PresetStore> =
    Lazy::new(|| PresetStore::from_sources(BUNDLED.iter().copied()));

/// One named default configuration for one model.
#[derive(Debug, Clone)]
pub struct Preset {
    pub model: DeviceModel,
    pub name: String,
    pub config: Configuration,
}

/// Read-only table model -> preset name -> configuration.
#[derive(Debug, Default)]
pub struct PresetStore {
    presets: BTreeMap<DeviceModel, BTreeMap<String, Preset>>,
}

impl PresetStore {
    /// The presets compiled into this crate.
    pub fn bundled() -> &'static PresetStore {
        &BUNDLED_STORE
    }

    pub fn from_sources<'a>(
        sources: impl IntoIterator<Item = (DeviceModel, &'a str, &'a str)>,
    ) -> Self {
        let mut presets: BTreeMap<DeviceModel, BTreeMap<String, Preset>> = BTreeMap::new();
        for (model, name, text) in sources {
            let config = parse_preset(model, text);
            debug!(model = %model, preset = name, params = config.len(), "Loaded preset");
            presets.entry(model).or_default().insert(
                name.to_string(),
                Preset {
                    model,
                    name: name.to_string(),
                    config,
                },
            );
        }
        Self { presets }
    }

    /// Preset names available for `model`, sorted.
    pub fn names(&self, model: DeviceModel) -> Vec<&str> {
        self.presets
            .get(&model)
            .map(|p| p.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn all_names(&self) -> BTreeMap<DeviceModel, Vec<&str>> {
        self.presets
            .keys()
            .map(|model| (*model, self.names(*model)))
            .collect()
    }

    pub fn get(&self, model: DeviceModel, name: &str) -> Result<&Preset> {
        self.presets
            .get(&model)
            .and_then(|p| p.get(name))
            .ok_or_else(|| AmptekError::NotFound(format!("preset '{}' for {}", name, model)))
    }
}

/// Parse vendor configuration text for `model`.
///
/// Bracketed header lines are skipped. Unknown codes and anything `model`
/// does not support are dropped. `RTDS=0` is stored as `2`, the sensitivity
/// the firmware uses when risetime discrimination is off.
pub fn parse_preset(model: DeviceModel, text: &str) -> Configuration {
    let mut config = Configuration::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || (line.starts_with('[') && line.ends_with(']')) {
            continue;
        }
        for part in line.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim().to_ascii_uppercase(), value.trim());
            if key.is_empty() || value.is_empty() {
                continue;
            }
            let Ok(code) = ParamCode::parse(&key) else {
                debug!(code = %key, "Skipping unknown preset parameter");
                continue;
            };
            if !code.is_supported_by(model) || code.refuses_value(value, model) {
                debug!(code = %code, model = %model, "Skipping parameter unsupported by model");
                continue;
            }
            let value = if code.is("RTDS") && value == "0" { "2" } else { value };
            config.set(code, value);
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ConfigValue, ValidationContext, validate};

    #[test]
    fn test_bundled_names() {
        let store = PresetStore::bundled();
        let names = store.names(DeviceModel::Dp5);
        assert!(names.contains(&"SDD Default DP5"));
        assert!(names.contains(&"Si-PIN Default DP5"));
        assert_eq!(store.all_names().len(), DeviceModel::ALL.len());
    }

    #[test]
    fn test_missing_preset_is_not_found() {
        let store = PresetStore::bundled();
        assert!(matches!(
            store.get(DeviceModel::Px5, "SDD Default DP5"),
            Err(AmptekError::NotFound(_))
        ));
    }

    #[test]
    fn test_parse_skips_header_unknown_and_unsupported() {
        let text = "[DP5 Configuration File]\nresc=Y; MCAC=1024;PRCL=1;VOLU=ON;\nRTDS=0;TPEA=;";
        let config = parse_preset(DeviceModel::Dp5, text);
        let codes: Vec<_> = config.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(codes, ["RESC", "MCAC", "RTDS"]);
        assert_eq!(config.get("RTDS"), Some(&ConfigValue::Text("2".into())));
    }

    #[test]
    fn test_unsupported_value_dropped() {
        let preset = PresetStore::bundled()
            .get(DeviceModel::Dp5x, "Si-PIN Default DP5X")
            .unwrap();
        assert!(preset.config.get("AUO2").is_none());
        assert!(preset.config.get("TECS").is_none());
    }

    #[test]
    fn test_bundled_presets_validate_for_their_model() {
        let store = PresetStore::bundled();
        for model in DeviceModel::ALL {
            for name in store.names(model) {
                let preset = store.get(model, name).unwrap();
                let ctx = ValidationContext {
                    model: Some(model),
                    hv_polarity_positive: Some(true),
                    channels: preset
                        .config
                        .get("MCAC")
                        .and_then(|v| v.to_text().parse().ok()),
                    ..Default::default()
                };
                for (code, value) in preset.config.iter() {
                    if let Err(e) = validate(*code, value, &ctx) {
                        panic!("{} / {}: {}", model, name, e);
                    }
                }
            }
        }
    }
}
