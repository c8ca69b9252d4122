use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::record::Amount;
use crate::types::PipelineVersion;

/// Prefix of environment overrides, e.g. `FINFLOW__EXTRACTION__WORKERS=8`.
pub const ENV_PREFIX: &str = "FINFLOW";

/// Canonical fields that `validation.required_fields` may name.
pub const REQUIRABLE_FIELDS: [&str; 9] = [
    "vendor",
    "invoice_number",
    "invoice_date",
    "due_date",
    "line_items",
    "subtotal",
    "tax",
    "total",
    "currency",
];

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub pipeline_version: String,
    pub intake: IntakeSettings,
    pub classifier: ClassifierSettings,
    pub extraction: ExtractionSettings,
    pub transform: TransformSettings,
    pub validation: ValidationSettings,
    pub load: LoadSettings,
    pub runtime: RuntimeSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            pipeline_version: default_pipeline_version(),
            intake: IntakeSettings::default(),
            classifier: ClassifierSettings::default(),
            extraction: ExtractionSettings::default(),
            transform: TransformSettings::default(),
            validation: ValidationSettings::default(),
            load: LoadSettings::default(),
            runtime: RuntimeSettings::default(),
        }
    }
}

impl PipelineSettings {
    /// Load defaults overlaid with `FINFLOW__*` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(None::<&Path>)
    }

    /// Load defaults, then an optional file, then environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            let path = path.as_ref().to_string_lossy().to_string();
            builder = builder.add_source(File::with_name(&path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn version(&self) -> PipelineVersion {
        PipelineVersion::new(self.pipeline_version.clone())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(CoreError::InvalidSettings(msg.to_string()));

        if self.pipeline_version.trim().is_empty() {
            return invalid("pipeline_version must not be empty");
        }
        if self.extraction.workers == 0 {
            return invalid("extraction.workers must be at least 1");
        }
        if self.runtime.cpu_workers == 0 || self.runtime.io_workers == 0 {
            return invalid("runtime worker pools must have at least 1 slot");
        }
        if self.load.concurrency == 0 {
            return invalid("load.concurrency must be at least 1");
        }
        for retry in [&self.intake.retry, &self.extraction.retry] {
            retry.validate()?;
        }
        if self.validation.tolerance.value < 0.0 {
            return invalid("validation.tolerance.value must not be negative");
        }
        if !(0.0..=1.0).contains(&self.validation.confidence_floor) {
            return invalid("validation.confidence_floor must be within 0.0 - 1.0");
        }
        if let Some(field) = self
            .validation
            .required_fields
            .iter()
            .find(|f| !REQUIRABLE_FIELDS.contains(&f.as_str()))
        {
            return Err(CoreError::InvalidSettings(format!(
                "unknown required field: {}",
                field
            )));
        }

        let mut names = HashSet::new();
        for sink in &self.load.sinks {
            if !names.insert(sink.name.as_str()) {
                return Err(CoreError::InvalidSettings(format!(
                    "duplicate sink name: {}",
                    sink.name
                )));
            }
            sink.retry.validate()?;
        }

        // One external call must fit inside a lease TTL.
        let longest_call = self
            .load
            .sinks
            .iter()
            .map(|s| s.timeout_ms)
            .chain([self.extraction.page_timeout_ms])
            .max()
            .unwrap_or(0);
        if self.runtime.lease_ttl_ms <= longest_call {
            return Err(CoreError::InvalidSettings(format!(
                "runtime.lease_ttl_ms ({}) must exceed the longest per-call timeout ({})",
                self.runtime.lease_ttl_ms, longest_call
            )));
        }
        Ok(())
    }
}

fn default_pipeline_version() -> String {
    "1".to_string()
}

/// Retry budget shared by every retried call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay_ms(mut self, ms: u64) -> Self {
        self.initial_delay_ms = ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CoreError::InvalidSettings(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(CoreError::InvalidSettings(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeSettings {
    pub max_document_bytes: u64,
    pub retry: RetrySettings,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self {
            max_document_bytes: 50 * 1024 * 1024,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Minimum share of printable text before a document counts as having a text layer
    pub text_layer_min_ratio: f32,
    /// `table_likelihood` at or above which `has_tables` is set
    pub table_threshold: f32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            text_layer_min_ratio: 0.85,
            table_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Pages analyzed concurrently per document
    pub workers: usize,
    pub page_timeout_ms: u64,
    pub retry: RetrySettings,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            page_timeout_ms: 30_000,
            retry: RetrySettings::default(),
        }
    }
}

impl ExtractionSettings {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }
}

/// How ambiguous slash dates such as `03/04/2024` are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOrder {
    MonthFirst,
    DayFirst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSettings {
    pub date_order: DateOrder,
    /// Number of leading regions on the first page treated as the header band
    pub header_band: usize,
    /// Confidence multiplier for vendors inferred from the header band
    pub header_vendor_penalty: f32,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            date_order: DateOrder::MonthFirst,
            header_band: 3,
            header_vendor_penalty: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceMode {
    /// `value` is a currency amount
    Absolute,
    /// `value` is a percentage of the expected amount
    Relative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToleranceSettings {
    pub mode: ToleranceMode,
    pub value: f64,
}

impl Default for ToleranceSettings {
    fn default() -> Self {
        Self {
            mode: ToleranceMode::Absolute,
            value: 0.01,
        }
    }
}

impl ToleranceSettings {
    /// Allowed difference when comparing against `expected`.
    pub fn allowance(&self, expected: Amount) -> Amount {
        match self.mode {
            ToleranceMode::Absolute => Amount::from_f64(self.value),
            ToleranceMode::Relative => expected.abs().percent(self.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub tolerance: ToleranceSettings,
    /// Fields below this confidence produce a warning
    pub confidence_floor: f32,
    /// Canonical fields that must be present (`total` and `currency` always are)
    pub required_fields: Vec<String>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            tolerance: ToleranceSettings::default(),
            confidence_floor: 0.6,
            required_fields: vec!["total".to_string(), "currency".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Relational,
    Object,
    Feature,
    Vector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSettings {
    pub name: String,
    pub kind: SinkKind,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl SinkSettings {
    pub fn new(name: impl Into<String>, kind: SinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: default_required(),
            timeout_ms: default_sink_timeout_ms(),
            retry: RetrySettings::default(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_required() -> bool {
    true
}

fn default_sink_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSettings {
    /// Sinks written concurrently per run
    pub concurrency: usize,
    pub sinks: Vec<SinkSettings>,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            sinks: vec![SinkSettings::new("relational", SinkKind::Relational)],
        }
    }
}

impl LoadSettings {
    pub fn sink(&self, name: &str) -> Option<&SinkSettings> {
        self.sinks.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Concurrent CPU-bound stage jobs (classification, transformation, validation)
    pub cpu_workers: usize,
    /// Concurrent I/O-bound stage jobs (staging, extraction, loading)
    pub io_workers: usize,
    pub lease_ttl_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            cpu_workers: num_cpus::get().max(1),
            io_workers: 16,
            lease_ttl_ms: 300_000,
        }
    }
}

impl RuntimeSettings {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = PipelineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.pipeline_version, "1");
        assert_eq!(settings.transform.date_order, DateOrder::MonthFirst);
        assert_eq!(settings.load.sinks.len(), 1);
        assert!(settings.load.sinks[0].required);
    }

    #[test]
    fn test_tolerance_allowance() {
        let absolute = ToleranceSettings::default();
        assert_eq!(absolute.allowance(Amount::from_minor(10800)), Amount::from_minor(1));

        let relative = ToleranceSettings {
            mode: ToleranceMode::Relative,
            value: 1.0,
        };
        assert_eq!(relative.allowance(Amount::from_minor(-10000)), Amount::from_minor(100));
    }

    #[test]
    fn test_validate_rejects_duplicate_sinks() {
        let mut settings = PipelineSettings::default();
        settings
            .load
            .sinks
            .push(SinkSettings::new("relational", SinkKind::Object).optional());
        assert!(matches!(settings.validate(), Err(CoreError::InvalidSettings(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_required_field() {
        let mut settings = PipelineSettings::default();
        settings.validation.required_fields.push("iban".to_string());
        assert!(matches!(settings.validate(), Err(CoreError::InvalidSettings(_))));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut settings = PipelineSettings::default();
        settings.extraction.retry.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_lease_shorter_than_calls() {
        let mut settings = PipelineSettings::default();
        settings.runtime.lease_ttl_ms = settings.extraction.page_timeout_ms;
        assert!(matches!(settings.validate(), Err(CoreError::InvalidSettings(_))));

        let mut settings = PipelineSettings::default();
        settings.runtime.lease_ttl_ms = 20_000;
        settings.extraction.page_timeout_ms = 5_000;
        settings.load.sinks[0].timeout_ms = 25_000;
        assert!(settings.validate().is_err());

        settings.load.sinks[0].timeout_ms = 10_000;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
pipeline_version = "2"

[extraction]
workers = 2

[validation.tolerance]
mode = "relative"
value = 0.5

[[load.sinks]]
name = "warehouse"
kind = "relational"

[[load.sinks]]
name = "search"
kind = "vector"
required = false
"#
        )
        .unwrap();

        let settings = PipelineSettings::load_from(Some(file.path())).unwrap();
        assert_eq!(settings.pipeline_version, "2");
        assert_eq!(settings.extraction.workers, 2);
        assert_eq!(settings.extraction.page_timeout_ms, 30_000);
        assert_eq!(settings.validation.tolerance.mode, ToleranceMode::Relative);
        assert_eq!(settings.load.sinks.len(), 2);
        assert!(!settings.load.sink("search").unwrap().required);
    }
}
