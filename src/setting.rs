//! Effective trace configuration: levels, modes and the per-model/global setting object.

use std::{collections::HashMap, fmt, sync::Arc};

use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    field::{Field, FieldUpdate},
    file::TraceFile,
    otel::{self, OtelError, OtelPipeline},
};

bitflags! {
    /// Which kinds of trace activity a setting records.
    ///
    /// `TIMESTAMPS` and `TENSORS` are independent bits: a setting can record tensor payloads
    /// without timestamps, or both, or neither (`DISABLED`, the empty set).
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    #[serde(transparent)]
    pub struct TraceLevel: u8 {
        /// No activities are recorded; this setting cannot sample requests.
        const DISABLED = 0;
        /// Record activity timestamps.
        const TIMESTAMPS = 0b0000_0001;
        /// Record tensor payloads.
        const TENSORS = 0b0000_0010;
    }
}

/// Destination a sampled trace is reported through.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    /// Collect activities into JSON fragments persisted through a [`TraceFile`].
    Triton,
    /// Report activities as spans pushed to an OTLP/HTTP collector.
    OpenTelemetry,
}

impl Default for TraceMode {
    fn default() -> Self {
        Self::Triton
    }
}

/// Mode-specific free-form options, keyed by mode identifier then option name.
///
/// The only mode currently consulted here is `"OTEL"`, whose `"url"` option overrides the
/// collector endpoint for that setting's OpenTelemetry pipeline.
pub type ConfigMap = HashMap<String, HashMap<String, String>>;

/// Requested change to a [`TraceSetting`], as passed to
/// [`crate::TraceManager::update_trace_setting`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[non_exhaustive]
pub struct TraceSettingUpdate {
    /// Change to the recorded activity level.
    #[serde(default)]
    pub level: FieldUpdate<TraceLevel>,
    /// Change to the sampling rate: one in every `rate` requests is a sampling candidate.
    #[serde(default)]
    pub rate: FieldUpdate<u32>,
    /// Change to the remaining sample budget. Negative means unlimited.
    #[serde(default)]
    pub count: FieldUpdate<i64>,
    /// Change to how many collected traces accumulate before a stream is flushed to file.
    #[serde(default)]
    pub log_frequency: FieldUpdate<u32>,
    /// Change to the base path collected traces are persisted under, in TRITON mode.
    #[serde(default)]
    pub filepath: FieldUpdate<String>,
    /// Change to the reporting destination.
    #[serde(default)]
    pub mode: FieldUpdate<TraceMode>,
    /// Change to mode-specific options.
    #[serde(default)]
    pub config_map: FieldUpdate<ConfigMap>,
}

/// Error produced while validating or applying a [`TraceSettingUpdate`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SettingError {
    /// The requested effective setting is invalid for a reason other than disabling tracing.
    #[error("invalid trace setting: {0}")]
    Invalid(String),
    /// Building the OTEL-mode trace pipeline failed.
    #[error("failed to build OpenTelemetry pipeline: {0}")]
    Otel(#[from] OtelError),
}

/// Outcome of validating a setting's resolved field values.
enum Validity {
    /// All constraints hold; the setting can sample requests.
    Valid,
    /// The only violated constraint is `level == DISABLED`; tracing is off but the update is
    /// otherwise well-formed and must be accepted.
    DisabledOnly,
    /// Some other constraint is violated; the update must be rejected.
    Invalid(String),
}

fn classify(
    level: TraceLevel,
    rate: u32,
    mode: TraceMode,
    filepath: Option<&str>,
) -> Validity {
    let mut reasons = Vec::new();
    if rate == 0 {
        reasons.push("rate must be non-zero".to_string());
    }
    if matches!(mode, TraceMode::Triton) && filepath.unwrap_or("").is_empty() {
        reasons.push("filepath must be non-empty in triton mode".to_string());
    }
    if !reasons.is_empty() {
        return Validity::Invalid(reasons.join("; "));
    }
    if level.is_empty() {
        return Validity::DisabledOnly;
    }
    Validity::Valid
}

/// Live counters mutated as traces are sampled and collected. Protected by one mutex so
/// [`TraceSetting::sample`] and [`TraceSetting::write_trace`] each see a consistent snapshot.
struct Counters {
    /// Number of `SampleTrace` calls seen so far.
    sample: u64,
    /// Number of traces actually created so far.
    created: u64,
    /// Number of traces whose activities have been collected (written) so far.
    collected: u64,
    /// Remaining sample budget. Negative means unlimited; never decremented past 0.
    count_remaining: i64,
    /// Collected fragments waiting for the next flush.
    trace_stream: String,
    /// Number of traces currently buffered in `trace_stream`.
    sample_in_stream: u64,
}

/// A fully resolved trace configuration: either the manager's global default, or a per-model
/// override built by merging a [`TraceSettingUpdate`] against the current setting and the
/// fallback (global) setting.
///
/// Shared by `Arc` between the manager's registry slot and every in-flight [`crate::Trace`]
/// sampled under it, so updating a model's setting never disturbs traces already in progress.
#[non_exhaustive]
pub struct TraceSetting {
    level: Field<TraceLevel>,
    rate: Field<u32>,
    count: Field<i64>,
    log_frequency: Field<u32>,
    filepath: Field<String>,
    mode: Field<TraceMode>,
    config_map: Field<ConfigMap>,

    effective_level: TraceLevel,
    effective_rate: u32,
    effective_log_frequency: u32,
    effective_mode: TraceMode,
    effective_filepath: Option<String>,
    effective_config_map: ConfigMap,

    file: Option<Arc<TraceFile>>,
    otel: Option<OtelPipeline>,

    counters: Mutex<Counters>,
}

impl fmt::Debug for TraceSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSetting")
            .field("level", &self.effective_level)
            .field("rate", &self.effective_rate)
            .field("mode", &self.effective_mode)
            .finish_non_exhaustive()
    }
}

/// Resolved field values, passed in by [`crate::TraceManager`] once it has merged an update
/// against the current and fallback settings.
pub(crate) struct ResolvedFields {
    pub(crate) level: Field<TraceLevel>,
    pub(crate) effective_level: TraceLevel,
    pub(crate) rate: Field<u32>,
    pub(crate) effective_rate: u32,
    pub(crate) count: Field<i64>,
    pub(crate) effective_count: i64,
    pub(crate) log_frequency: Field<u32>,
    pub(crate) effective_log_frequency: u32,
    pub(crate) filepath: Field<String>,
    pub(crate) effective_filepath: Option<String>,
    pub(crate) mode: Field<TraceMode>,
    pub(crate) effective_mode: TraceMode,
    pub(crate) config_map: Field<ConfigMap>,
    pub(crate) effective_config_map: ConfigMap,
}

impl TraceSetting {
    /// Build a new effective setting from already-merged fields.
    ///
    /// `file` resolves the effective filepath to a (possibly shared) [`TraceFile`] handle; it is
    /// only consulted in TRITON mode. `resource` is the OTel resource shared by every OTEL-mode
    /// pipeline this process builds.
    ///
    /// # Errors
    ///
    /// Returns [`SettingError::Invalid`] if the resolved fields violate a constraint other than
    /// `level == DISABLED`. Returns [`SettingError::Otel`] if OTEL mode is selected and the
    /// trace pipeline cannot be built.
    pub(crate) fn build(
        fields: ResolvedFields,
        file: impl FnOnce(&str) -> Arc<TraceFile>,
        resource: impl FnOnce() -> opentelemetry_sdk::Resource,
    ) -> Result<Self, SettingError> {
        match classify(
            fields.effective_level,
            fields.effective_rate,
            fields.effective_mode,
            fields.effective_filepath.as_deref(),
        ) {
            Validity::Invalid(reason) => return Err(SettingError::Invalid(reason)),
            Validity::Valid | Validity::DisabledOnly => {}
        }

        let resolved_file = match (fields.effective_mode, &fields.effective_filepath) {
            (TraceMode::Triton, Some(path)) if !path.is_empty() => Some(file(path)),
            _ => None,
        };
        let otel_pipeline = match fields.effective_mode {
            TraceMode::OpenTelemetry => {
                let endpoint = otel::configured_endpoint(&fields.effective_config_map);
                Some(OtelPipeline::build(resource(), endpoint)?)
            }
            TraceMode::Triton => None,
        };

        Ok(Self {
            level: fields.level,
            rate: fields.rate,
            count: fields.count,
            log_frequency: fields.log_frequency,
            filepath: fields.filepath,
            mode: fields.mode,
            config_map: fields.config_map,
            effective_level: fields.effective_level,
            effective_rate: fields.effective_rate,
            effective_log_frequency: fields.effective_log_frequency,
            effective_mode: fields.effective_mode,
            effective_filepath: fields.effective_filepath,
            effective_config_map: fields.effective_config_map,
            file: resolved_file,
            otel: otel_pipeline,
            counters: Mutex::new(Counters {
                sample: 0,
                created: 0,
                collected: 0,
                count_remaining: fields.effective_count,
                trace_stream: String::new(),
                sample_in_stream: 0,
            }),
        })
    }

    /// Whether this setting's resolved fields satisfy every validity constraint.
    ///
    /// A setting with `level == DISABLED` is well-formed but never valid: it exists so tracing
    /// can be turned off for a model without rejecting the update, but [`Self::sample`] always
    /// returns `false` for it.
    #[must_use]
    pub fn valid(&self) -> bool {
        matches!(
            classify(
                self.effective_level,
                self.effective_rate,
                self.effective_mode,
                self.effective_filepath.as_deref(),
            ),
            Validity::Valid
        )
    }

    /// Human-readable reason this setting is not [`Self::valid`], if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        match classify(
            self.effective_level,
            self.effective_rate,
            self.effective_mode,
            self.effective_filepath.as_deref(),
        ) {
            Validity::Valid => None,
            Validity::DisabledOnly => Some("level is DISABLED".to_string()),
            Validity::Invalid(reason) => Some(reason),
        }
    }

    /// Whether the named tracked field carries an explicit override on this setting.
    #[must_use]
    pub(crate) fn tracked_fields_specified(&self) -> [bool; 5] {
        [
            self.level.specified(),
            self.rate.specified(),
            self.count.specified(),
            self.log_frequency.specified(),
            self.filepath.specified(),
        ]
    }

    pub(crate) fn level_field(&self) -> &Field<TraceLevel> {
        &self.level
    }

    pub(crate) fn rate_field(&self) -> &Field<u32> {
        &self.rate
    }

    pub(crate) fn count_field(&self) -> &Field<i64> {
        &self.count
    }

    pub(crate) fn log_frequency_field(&self) -> &Field<u32> {
        &self.log_frequency
    }

    pub(crate) fn filepath_field(&self) -> &Field<String> {
        &self.filepath
    }

    pub(crate) fn mode_field(&self) -> &Field<TraceMode> {
        &self.mode
    }

    pub(crate) fn config_map_field(&self) -> &Field<ConfigMap> {
        &self.config_map
    }

    /// Effective recorded activity level.
    #[must_use]
    pub fn level(&self) -> TraceLevel {
        self.effective_level
    }

    /// Effective sampling rate.
    #[must_use]
    pub fn rate(&self) -> u32 {
        self.effective_rate
    }

    /// Remaining sample budget. Negative means unlimited.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.counters.lock().count_remaining
    }

    /// Effective flush threshold, in collected traces, for indexed TRITON-mode files.
    #[must_use]
    pub fn log_frequency(&self) -> u32 {
        self.effective_log_frequency
    }

    /// Effective base path traces are persisted under, in TRITON mode.
    #[must_use]
    pub fn filepath(&self) -> Option<&str> {
        self.effective_filepath.as_deref()
    }

    /// Effective reporting destination.
    #[must_use]
    pub fn mode(&self) -> TraceMode {
        self.effective_mode
    }

    /// Effective mode-specific options.
    #[must_use]
    pub fn config_map(&self) -> &ConfigMap {
        &self.effective_config_map
    }

    /// The tracer used to start OTEL-mode spans for traces sampled under this setting, if any.
    #[must_use]
    pub(crate) fn otel_tracer(&self) -> Option<&opentelemetry_sdk::trace::Tracer> {
        self.otel.as_ref().map(OtelPipeline::tracer)
    }

    /// The file traces collected under this setting are persisted to, in TRITON mode.
    #[must_use]
    pub(crate) fn file(&self) -> Option<&Arc<TraceFile>> {
        self.file.as_ref()
    }

    /// Run the rate/count arithmetic for one `SampleTrace` call.
    ///
    /// Returns `true` iff a trace should be created for this call. Mutex-protected so concurrent
    /// callers see a consistent, monotonically advancing `sample` sequence.
    #[must_use]
    pub(crate) fn sample(&self) -> bool {
        if !self.valid() {
            return false;
        }
        let mut counters = self.counters.lock();
        counters.sample = counters.sample.wrapping_add(1);
        if counters.sample % u64::from(self.effective_rate) != 0 {
            return false;
        }
        if counters.count_remaining == 0 {
            return false;
        }
        if counters.count_remaining > 0 {
            counters.count_remaining -= 1;
        }
        counters.created += 1;
        true
    }

    /// Append one trace's collected fragments to the current stream, flushing it if the trace
    /// budget has just drained or the log frequency threshold has just been reached.
    pub(crate) fn write_trace(&self, fragments: &str) {
        let flush = {
            let mut counters = self.counters.lock();
            if counters.sample_in_stream != 0 {
                counters.trace_stream.push(',');
            }
            counters.trace_stream.push_str(fragments);
            counters.sample_in_stream += 1;
            counters.collected += 1;

            let drained = counters.count_remaining == 0 && counters.collected == counters.sample;
            let rotated = self.effective_log_frequency != 0
                && counters.sample_in_stream >= u64::from(self.effective_log_frequency);
            if drained || rotated {
                counters.sample_in_stream = 0;
                Some(std::mem::take(&mut counters.trace_stream))
            } else {
                None
            }
        };
        if let Some(buffer) = flush {
            if let Some(file) = &self.file {
                file.save_traces(&buffer, true);
            }
        }
    }
}

impl Drop for TraceSetting {
    fn drop(&mut self) {
        if !matches!(self.effective_mode, TraceMode::Triton) {
            return;
        }
        let buffer = {
            let mut counters = self.counters.lock();
            if counters.sample_in_stream == 0 {
                return;
            }
            counters.sample_in_stream = 0;
            std::mem::take(&mut counters.trace_stream)
        };
        if let Some(file) = &self.file {
            file.save_traces(&buffer, self.effective_log_frequency != 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(level: TraceLevel, rate: u32, count: i64) -> ResolvedFields {
        ResolvedFields {
            level: Field::Specified(level),
            effective_level: level,
            rate: Field::Specified(rate),
            effective_rate: rate,
            count: Field::Specified(count),
            effective_count: count,
            log_frequency: Field::Inherited,
            effective_log_frequency: 0,
            filepath: Field::Inherited,
            effective_filepath: None,
            mode: Field::Inherited,
            effective_mode: TraceMode::Triton,
            config_map: Field::Inherited,
            effective_config_map: ConfigMap::new(),
        }
    }

    fn no_file(_: &str) -> Arc<TraceFile> {
        unreachable!("filepath-less test settings never resolve a file")
    }

    fn no_resource() -> opentelemetry_sdk::Resource {
        unreachable!("triton-mode test settings never build an otel pipeline")
    }

    #[test]
    fn disabled_level_is_well_formed_but_invalid() {
        let f = fields(TraceLevel::DISABLED, 1, -1);
        let setting = TraceSetting::build(f, no_file, no_resource).unwrap();
        assert!(!setting.valid());
        assert_eq!(setting.reason().as_deref(), Some("level is DISABLED"));
        assert!(!setting.sample());
    }

    #[test]
    fn zero_rate_is_rejected() {
        let f = fields(TraceLevel::TIMESTAMPS, 0, -1);
        let err = TraceSetting::build(f, no_file, no_resource).unwrap_err();
        assert!(matches!(err, SettingError::Invalid(_)));
    }

    #[test]
    fn sample_respects_rate_and_budget() {
        let f = fields(TraceLevel::TIMESTAMPS, 2, 2);
        let setting = TraceSetting::build(f, no_file, no_resource).unwrap();
        assert!(!setting.sample());
        assert!(setting.sample());
        assert_eq!(setting.count(), 1);
        assert!(!setting.sample());
        assert!(setting.sample());
        assert_eq!(setting.count(), 0);
        assert!(!setting.sample());
        assert!(!setting.sample());
    }

    #[test]
    fn negative_count_never_decrements() {
        let f = fields(TraceLevel::TIMESTAMPS, 1, -1);
        let setting = TraceSetting::build(f, no_file, no_resource).unwrap();
        for _ in 0..5 {
            assert!(setting.sample());
        }
        assert_eq!(setting.count(), -1);
    }
}
