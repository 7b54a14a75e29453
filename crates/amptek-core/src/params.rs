//! Configuration parameter table and validation.
//!
//! Every parameter is a four-letter ASCII mnemonic with a value kind, a legal
//! range and the models that do not implement it. A [`ParamCode`] can only be
//! obtained from this table, so an unknown mnemonic never reaches the wire.

use std::fmt;
use std::str::FromStr;

use crate::error::{AmptekError, Result};
use crate::protocol::constants::CHANNEL_COUNTS;
use crate::protocol::status::{DeviceModel, DeviceStatus};

use DeviceModel::*;

/// Shape of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueKind {
    Integer { min: i64, max: i64 },
    Decimal { min: f64, max: f64 },
    IntegerOrOff { min: i64, max: i64 },
    DecimalOrOff { min: f64, max: f64 },
    Choice(&'static [&'static str]),
    /// Free-form token checked only for wire safety.
    Token,
}

pub struct ParamSpec {
    pub code: &'static str,
    pub description: &'static str,
    pub kind: ValueKind,
    pub unsupported: &'static [DeviceModel],
}

const ON_OFF: ValueKind = ValueKind::Choice(&["ON", "OFF"]);

const fn spec(
    code: &'static str,
    description: &'static str,
    kind: ValueKind,
    unsupported: &'static [DeviceModel],
) -> ParamSpec {
    ParamSpec {
        code,
        description,
        kind,
        unsupported,
    }
}

pub static PARAMS: &[ParamSpec] = &[
    spec("AINP", "Analog input polarity", ValueKind::Choice(&["POS", "NEG"]), &[Mca8000d]),
    spec("AU34", "Auxiliary outputs 3 and 4", ValueKind::Token, &[Dp5, Dp5x, Mca8000d]),
    spec("AUO1", "Auxiliary output 1 selection", ValueKind::Token, &[]),
    spec("AUO2", "Auxiliary output 2 selection", ValueKind::Token, &[]),
    spec("BLRD", "Baseline restoration down correction", ValueKind::Integer { min: 0, max: 3 }, &[Mca8000d]),
    spec("BLRM", "Baseline restoration mode", ValueKind::Choice(&["1", "OFF"]), &[Mca8000d]),
    spec("BLRU", "Baseline restoration up correction", ValueKind::Integer { min: 0, max: 3 }, &[Mca8000d]),
    spec("BOOT", "Turn supplies on at power up", ON_OFF, &[Px5, Dp5g, Mca8000d, Tb5]),
    spec("CLCK", "FPGA clock", ValueKind::Choice(&["AUTO", "20", "80"]), &[Mca8000d]),
    spec("CLKL", "Clock low", ValueKind::Token, &[Mca8000d]),
    spec("CON1", "Connector 1 mode", ValueKind::Token, &[Dp5, Dp5x, Mca8000d]),
    spec("CON2", "Connector 2 mode", ValueKind::Token, &[Dp5, Dp5x, Mca8000d]),
    spec("CUSP", "Non-trapezoidal shaping", ValueKind::Integer { min: 0, max: 100 }, &[Mca8000d]),
    spec("DACF", "DAC offset", ValueKind::Token, &[Mca8000d]),
    spec("DACO", "DAC output", ValueKind::Choice(&["OFF", "FAST", "SHAPED", "INPUT", "PEAK"]), &[Mca8000d]),
    spec("GAIF", "Fine gain", ValueKind::Decimal { min: 0.75, max: 1.25 }, &[Mca8000d]),
    spec("GAIN", "Total gain (analog times fine)", ValueKind::Decimal { min: 0.75, max: 500.0 }, &[]),
    spec("GATE", "Gate control", ValueKind::Choice(&["OFF", "HIGH", "LOW"]), &[Px5, Dp5g, Tb5]),
    spec("GPED", "G.P. counter edge", ValueKind::Choice(&["RISING", "FALLING"]), &[]),
    spec("GPGA", "G.P. counter uses gate", ON_OFF, &[]),
    spec("GPIN", "G.P. counter input", ValueKind::Token, &[]),
    spec("GPMC", "G.P. counter cleared with MCA", ON_OFF, &[]),
    spec("GPME", "G.P. counter uses MCA enable", ON_OFF, &[]),
    spec("HVSE", "High voltage setpoint (V)", ValueKind::DecimalOrOff { min: -5000.0, max: 5000.0 }, &[Mca8000d]),
    spec("INOF", "Input offset", ValueKind::Token, &[Dp5g, Mca8000d, Tb5]),
    spec("INOG", "Input offset gain", ValueKind::Choice(&["LOW", "HIGH"]), &[Dp5, Dp5x, Dp5g, Mca8000d, Tb5]),
    spec("MCAC", "MCA channels", ValueKind::Choice(&["256", "512", "1024", "2048", "4096", "8192"]), &[]),
    spec("MCAE", "MCA enable at power up", ON_OFF, &[]),
    spec("MCAS", "MCA source", ValueKind::Choice(&["NORM", "MCS", "FAST", "PUR", "RTD"]), &[]),
    spec("MCSH", "MCS high threshold (channel)", ValueKind::Integer { min: 0, max: 8191 }, &[]),
    spec("MCSL", "MCS low threshold (channel)", ValueKind::Integer { min: 0, max: 8191 }, &[]),
    spec("MCST", "MCS timebase (s)", ValueKind::Decimal { min: 0.01, max: 655.35 }, &[]),
    spec("PAPS", "Preamp power supplies", ValueKind::Choice(&["8.5", "5", "OFF", "ON"]), &[]),
    spec("PAPZ", "Pole-zero", ValueKind::Token, &[Dp5g, Mca8000d, Dp5x, Tb5]),
    spec("PDMD", "Peak detect mode", ValueKind::Choice(&["NORM", "MIN"]), &[Dp5x]),
    spec("PREC", "Preset counts", ValueKind::IntegerOrOff { min: 0, max: 4_294_967_295 }, &[]),
    spec("PREL", "Preset live time (s)", ValueKind::DecimalOrOff { min: 0.0, max: 99_999_999.9 }, &[Dp5, Px5, Dp5x, Dp5g, Tb5]),
    spec("PRER", "Preset real time (s)", ValueKind::DecimalOrOff { min: 0.0, max: 4_294_967.29 }, &[]),
    spec("PRET", "Preset acquisition time (s)", ValueKind::DecimalOrOff { min: 0.0, max: 99_999_999.9 }, &[]),
    spec("PURE", "Pile-up rejection", ValueKind::Choice(&["ON", "OFF", "MAX"]), &[]),
    spec("PURS", "Pile-up reject interval", ValueKind::Token, &[Px5, Dp5g, Mca8000d, Tb5]),
    spec("RESC", "Reset configuration", ValueKind::Choice(&["Y", "N", "YES", "NO"]), &[]),
    spec("RESL", "Reset lockout (us)", ValueKind::Token, &[Mca8000d]),
    spec("RTDD", "RTD custom threshold", ValueKind::Token, &[Mca8000d]),
    spec("RTDE", "Risetime discrimination", ON_OFF, &[Mca8000d]),
    spec("RTDS", "RTD sensitivity", ValueKind::Token, &[Mca8000d]),
    spec("RTDT", "RTD threshold", ValueKind::Token, &[Mca8000d]),
    spec("RTDW", "RTD reject window", ValueKind::Token, &[Mca8000d]),
    spec("SCOE", "Scope trigger edge", ValueKind::Choice(&["RISING", "FALLING", "BOTH"]), &[]),
    spec("SCOG", "Digital scope gain", ValueKind::Token, &[]),
    spec("SCOT", "Scope trigger position", ValueKind::Token, &[]),
    spec("SCTC", "Scintillator time constant", ValueKind::Token, &[Dp5, Px5, Dp5x, Mca8000d]),
    spec("SOFF", "Set spectrum offset", ValueKind::Token, &[]),
    spec("SYNC", "List-mode sync", ValueKind::Token, &[Mca8000d]),
    spec("TECS", "Cooler setpoint (K)", ValueKind::IntegerOrOff { min: 0, max: 299 }, &[Dp5g, Mca8000d, Dp5x, Tb5]),
    spec("TFLA", "Flat top width (us)", ValueKind::Token, &[Mca8000d]),
    spec("THFA", "Fast threshold", ValueKind::Decimal { min: 0.0, max: 511.937 }, &[Mca8000d]),
    spec("THSL", "Slow threshold (%)", ValueKind::Decimal { min: 0.0, max: 24.9 }, &[]),
    spec("TLLD", "LLD threshold", ValueKind::Token, &[]),
    spec("TPEA", "Peaking time (us)", ValueKind::Decimal { min: 0.05, max: 102.4 }, &[]),
    spec("TPFA", "Fast channel peaking time (ns)", ValueKind::Choice(&["50", "100", "400", "800", "1600", "3200"]), &[Mca8000d]),
    spec("TPMO", "Test pulser", ON_OFF, &[Mca8000d, Dp5x]),
    spec("VOLU", "Speaker", ON_OFF, &[Dp5, Dp5g, Mca8000d, Dp5x, Tb5]),
];

/// `(code, value, models)` combinations refused even though the code exists.
static UNSUPPORTED_VALUES: &[(&str, &str, &[DeviceModel])] = &[("AUO2", "STREAM", &[Dp5x])];

/// What a caller may learn about a parameter before setting it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    pub code: &'static str,
    pub description: &'static str,
    pub kind: ValueKind,
    /// Models that implement the parameter.
    pub supported: Vec<DeviceModel>,
}

/// Handle to an entry of [`PARAMS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamCode(u8);

impl ParamCode {
    pub fn parse(code: &str) -> Result<Self> {
        let upper = code.trim().to_ascii_uppercase();
        PARAMS
            .iter()
            .position(|p| p.code == upper)
            .map(|i| ParamCode(i as u8))
            .ok_or_else(|| AmptekError::invalid(code.trim(), "unknown parameter code"))
    }

    pub fn spec(&self) -> &'static ParamSpec {
        &PARAMS[usize::from(self.0)]
    }

    pub fn as_str(&self) -> &'static str {
        self.spec().code
    }

    pub fn is(&self, code: &str) -> bool {
        self.as_str() == code
    }

    pub fn description(&self) -> &'static str {
        self.spec().description
    }

    /// Description, accepted values and supporting models of this parameter.
    ///
    /// The value shape is the one [`validate`] enforces under `ctx`, so
    /// ranges such as `GAIN` or `HVSE` follow the model and polarity.
    pub fn info(&self, ctx: &ValidationContext) -> ParamInfo {
        let spec = self.spec();
        ParamInfo {
            code: spec.code,
            description: spec.description,
            kind: ctx.kind_for(spec),
            supported: DeviceModel::ALL
                .into_iter()
                .filter(|m| self.is_supported_by(*m))
                .collect(),
        }
    }

    pub fn is_supported_by(&self, model: DeviceModel) -> bool {
        !self.spec().unsupported.contains(&model)
    }

    /// Whether `model` refuses this particular value although it knows the code.
    pub fn refuses_value(&self, value: &str, model: DeviceModel) -> bool {
        UNSUPPORTED_VALUES.iter().any(|(c, v, models)| {
            self.is(c) && value.trim().eq_ignore_ascii_case(v) && models.contains(&model)
        })
    }
}

impl fmt::Display for ParamCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamCode {
    type Err = AmptekError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A value about to be written.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ConfigValue {
    /// ASCII form before validation.
    pub fn to_text(&self) -> String {
        match self {
            ConfigValue::Int(v) => v.to_string(),
            ConfigValue::Float(v) => v.to_string(),
            ConfigValue::Text(v) => v.trim().to_string(),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<i32> for ConfigValue {
    fn from(v: i32) -> Self {
        ConfigValue::Int(i64::from(v))
    }
}

impl From<u32> for ConfigValue {
    fn from(v: u32) -> Self {
        ConfigValue::Int(i64::from(v))
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Text(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Text(v)
    }
}

/// Ordered set of parameter assignments. Setting a code twice keeps its
/// first position and the last value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    entries: Vec<(ParamCode, ConfigValue)>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, code: ParamCode, value: impl Into<ConfigValue>) -> &mut Self {
        let value = value.into();
        match self.entries.iter_mut().find(|(c, _)| *c == code) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((code, value)),
        }
        self
    }

    /// Builder form that parses the code.
    pub fn with(mut self, code: &str, value: impl Into<ConfigValue>) -> Result<Self> {
        let code = ParamCode::parse(code)?;
        self.set(code, value);
        Ok(self)
    }

    pub fn get(&self, code: &str) -> Option<&ConfigValue> {
        self.entries
            .iter()
            .find(|(c, _)| c.is(code))
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, code: &str) -> Option<ConfigValue> {
        let index = self.entries.iter().position(|(c, _)| c.is(code))?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ParamCode, ConfigValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse `CODE=VALUE;CODE=VALUE` text. Unknown codes are an error.
    pub fn parse_text(text: &str) -> Result<Self> {
        let mut config = Self::new();
        for (code, value) in split_assignments(text) {
            config.set(ParamCode::parse(code)?, value);
        }
        Ok(config)
    }
}

/// `CODE=VALUE` pairs of a `;`-separated command string.
pub(crate) fn split_assignments(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.split(';')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .filter_map(|c| c.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
}

/// What the validator knows about the target device.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationContext {
    pub model: Option<DeviceModel>,
    pub hv_polarity_positive: Option<bool>,
    pub hpge_option: bool,
    /// Channel count that bounds MCSL/MCSH.
    pub channels: Option<usize>,
}

impl ValidationContext {
    pub fn for_status(status: &DeviceStatus) -> Self {
        Self {
            model: Some(status.model),
            hv_polarity_positive: status.flags.hv_polarity_positive,
            hpge_option: status.hpge_option,
            channels: None,
        }
    }

    /// Largest HV magnitude the model's supply accepts.
    pub fn hv_limit(&self) -> f64 {
        match self.model {
            Some(Dp5x) => 300.0,
            Some(Px5) if self.hpge_option => 5000.0,
            Some(_) => 1500.0,
            None => 5000.0,
        }
    }

    fn kind_for(&self, spec: &ParamSpec) -> ValueKind {
        match (spec.code, self.model) {
            ("GAIN", Some(Dp5)) => ValueKind::Decimal { min: 0.75, max: 150.0 },
            ("GAIN", Some(Px5)) => ValueKind::Decimal { min: 0.75, max: 500.0 },
            ("GAIN", Some(Dp5g | Tb5)) => ValueKind::Decimal { min: 1.0, max: 10.0 },
            ("GAIN", Some(Mca8000d)) => ValueKind::Choice(&["1", "10"]),
            ("GAIN", Some(Dp5x)) => ValueKind::Decimal { min: 2.67, max: 150.0 },
            ("PAPS", Some(Px5)) => ValueKind::Choice(&["8.5", "5", "OFF"]),
            ("HVSE", _) => {
                let limit = self.hv_limit();
                let (min, max) = match self.hv_polarity_positive {
                    Some(true) => (0.0, limit),
                    Some(false) => (-limit, 0.0),
                    None => (-limit, limit),
                };
                ValueKind::DecimalOrOff { min, max }
            }
            ("MCSL" | "MCSH", _) => {
                let channels = self.channels.unwrap_or(CHANNEL_COUNTS[CHANNEL_COUNTS.len() - 1]);
                ValueKind::Integer {
                    min: 0,
                    max: channels as i64 - 1,
                }
            }
            _ => spec.kind,
        }
    }
}

/// Validate one assignment and return the value text to put on the wire.
pub fn validate(code: ParamCode, value: &ConfigValue, ctx: &ValidationContext) -> Result<String> {
    let spec = code.spec();
    let text = value.to_text();

    if let Some(model) = ctx.model {
        if !code.is_supported_by(model) {
            return Err(AmptekError::invalid(spec.code, format!("not supported by {}", model)));
        }
        if code.refuses_value(&text, model) {
            return Err(AmptekError::invalid(
                spec.code,
                format!("value {} not supported by {}", text, model),
            ));
        }
    }

    check_kind(ctx.kind_for(spec), &text).map_err(|reason| AmptekError::invalid(spec.code, reason))
}

fn check_kind(kind: ValueKind, text: &str) -> std::result::Result<String, String> {
    let is_off = text.eq_ignore_ascii_case("OFF");
    match kind {
        ValueKind::Integer { min, max } => check_integer(text, min, max),
        ValueKind::IntegerOrOff { .. } | ValueKind::DecimalOrOff { .. } if is_off => {
            Ok("OFF".to_string())
        }
        ValueKind::IntegerOrOff { min, max } => check_integer(text, min, max),
        ValueKind::Decimal { min, max } | ValueKind::DecimalOrOff { min, max } => {
            let v: f64 = text
                .parse()
                .map_err(|_| format!("'{}' is not a number", text))?;
            if !v.is_finite() || v < min || v > max {
                return Err(format!("{} outside {}..={}", text, min, max));
            }
            Ok(text.to_string())
        }
        ValueKind::Choice(choices) => {
            let normalized = text.parse::<f64>().ok().map(|v| v.to_string());
            choices
                .iter()
                .find(|c| c.eq_ignore_ascii_case(text) || normalized.as_deref() == Some(**c))
                .map(|c| c.to_string())
                .ok_or_else(|| format!("'{}' is not one of {}", text, choices.join(", ")))
        }
        ValueKind::Token => {
            let ok = !text.is_empty()
                && text.len() <= 32
                && text.bytes().all(|b| b.is_ascii_graphic() && b != b';' && b != b'=');
            if ok {
                Ok(text.to_ascii_uppercase())
            } else {
                Err(format!("'{}' is not a valid token", text))
            }
        }
    }
}

fn check_integer(text: &str, min: i64, max: i64) -> std::result::Result<String, String> {
    let v: i64 = text
        .parse()
        .map_err(|_| format!("'{}' is not an integer", text))?;
    if v < min || v > max {
        return Err(format!("{} outside {}..={}", v, min, max));
    }
    Ok(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(model: DeviceModel) -> ValidationContext {
        ValidationContext {
            model: Some(model),
            ..Default::default()
        }
    }

    fn check(code: &str, value: impl Into<ConfigValue>, ctx: &ValidationContext) -> Result<String> {
        validate(ParamCode::parse(code)?, &value.into(), ctx)
    }

    #[test]
    fn test_unknown_code_rejected() {
        let err = ParamCode::parse("ZZZZ").unwrap_err();
        assert!(matches!(err, AmptekError::InvalidParameter { .. }));
        assert_eq!(ParamCode::parse(" mcac ").unwrap().as_str(), "MCAC");
    }

    #[test]
    fn test_parameter_info() {
        let info = ParamCode::parse("volu").unwrap().info(&ValidationContext::default());
        assert_eq!(info.code, "VOLU");
        assert_eq!(info.description, "Speaker");
        assert_eq!(info.kind, ValueKind::Choice(&["ON", "OFF"]));
        assert_eq!(info.supported, [Px5]);

        let gain = ParamCode::parse("GAIN").unwrap();
        assert_eq!(gain.description(), "Total gain (analog times fine)");
        assert_eq!(gain.info(&ctx(Dp5)).kind, ValueKind::Decimal { min: 0.75, max: 150.0 });
        assert_eq!(gain.info(&ctx(Mca8000d)).kind, ValueKind::Choice(&["1", "10"]));
        assert_eq!(gain.info(&ctx(Dp5)).supported.len(), DeviceModel::ALL.len());

        let hv = ParamCode::parse("HVSE").unwrap().info(&ValidationContext {
            hv_polarity_positive: Some(false),
            ..ctx(Dp5x)
        });
        assert_eq!(hv.kind, ValueKind::DecimalOrOff { min: -300.0, max: 0.0 });
        assert!(!hv.supported.contains(&Mca8000d));
    }

    #[test]
    fn test_channel_count_choices() {
        let c = ctx(Dp5);
        assert_eq!(check("MCAC", 2048, &c).unwrap(), "2048");
        assert_eq!(check("MCAC", 2048.0, &c).unwrap(), "2048");
        assert!(check("MCAC", 3000, &c).is_err());
    }

    #[test]
    fn test_gain_range_depends_on_model() {
        assert!(check("GAIN", 200.0, &ctx(Px5)).is_ok());
        assert!(check("GAIN", 200.0, &ctx(Dp5)).is_err());
        assert!(check("GAIN", 10, &ctx(Mca8000d)).is_ok());
        assert!(check("GAIN", 5, &ctx(Mca8000d)).is_err());
        assert!(check("GAIN", 2.0, &ctx(Dp5x)).is_err());
    }

    #[test]
    fn test_unsupported_parameter_for_model() {
        let err = check("VOLU", "ON", &ctx(Dp5)).unwrap_err();
        assert!(err.to_string().contains("not supported by DP5"));
        assert_eq!(check("VOLU", "on", &ctx(Px5)).unwrap(), "ON");
        assert!(check("AUO2", "STREAM", &ctx(Dp5x)).is_err());
        assert!(check("AUO2", "STREAM", &ctx(Dp5)).is_ok());
    }

    #[test]
    fn test_presets_accept_off() {
        let c = ctx(Dp5);
        assert_eq!(check("PRET", "off", &c).unwrap(), "OFF");
        assert_eq!(check("PRER", 10.5, &c).unwrap(), "10.5");
        assert!(check("PREC", -1, &c).is_err());
        assert!(check("TECS", 300, &c).is_err());
        assert_eq!(check("TECS", 220, &c).unwrap(), "220");
    }

    #[test]
    fn test_hv_limits_follow_polarity() {
        let mut c = ctx(Dp5);
        c.hv_polarity_positive = Some(false);
        assert!(check("HVSE", -500, &c).is_ok());
        assert!(check("HVSE", 100, &c).is_err());
        assert!(check("HVSE", -1600, &c).is_err());

        let mut c = ctx(Px5);
        c.hv_polarity_positive = Some(true);
        assert!(check("HVSE", 2000, &c).is_err());
        c.hpge_option = true;
        assert!(check("HVSE", 2000, &c).is_ok());

        assert!(check("HVSE", 250, &ctx(Dp5x)).is_ok());
        assert!(check("HVSE", 350, &ctx(Dp5x)).is_err());
        assert!(check("HVSE", 100, &ctx(Mca8000d)).is_err());
    }

    #[test]
    fn test_mcs_thresholds_bounded_by_channels() {
        let mut c = ctx(Dp5);
        c.channels = Some(1024);
        assert!(check("MCSH", 1023, &c).is_ok());
        assert!(check("MCSH", 1024, &c).is_err());
    }

    #[test]
    fn test_configuration_order_and_replace() {
        let mut config = Configuration::new()
            .with("TPEA", 4.0)
            .unwrap()
            .with("MCAC", 1024)
            .unwrap();
        config.set(ParamCode::parse("TPEA").unwrap(), 2.4);
        let codes: Vec<_> = config.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(codes, ["TPEA", "MCAC"]);
        assert_eq!(config.get("TPEA"), Some(&ConfigValue::Float(2.4)));
        assert_eq!(config.remove("MCAC"), Some(ConfigValue::Int(1024)));
        assert_eq!(config.len(), 1);
    }

    #[test]
    fn test_parse_text() {
        let config = Configuration::parse_text("RESC=Y; mcac=2048;;GAIN=20").unwrap();
        assert_eq!(config.len(), 3);
        assert_eq!(config.get("MCAC"), Some(&ConfigValue::Text("2048".into())));
        assert!(Configuration::parse_text("NOPE=1;").is_err());
    }

    #[test]
    fn test_token_rejects_separators() {
        let c = ctx(Dp5);
        assert!(check("SOFF", "a;b", &c).is_err());
        assert_eq!(check("SOFF", "off", &c).unwrap(), "OFF");
    }
}
