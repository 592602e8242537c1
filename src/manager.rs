//! Registry of global and per-model trace settings, sampling entry point, and host-runtime
//! callback trampolines.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Weak},
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::{
    field::Field,
    file::TraceFile,
    host::{Activity, DeviceCopier, HostRuntime, HostTrace, TensorView},
    otel::OpenTelemetryConfig,
    setting::{ResolvedFields, SettingError, TraceSetting, TraceSettingUpdate},
    trace::{ActivityIdentity, Trace},
};

/// Error produced while applying a [`TraceSettingUpdate`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    /// The update was rejected; see [`crate::SettingError`] for the reason.
    #[error(transparent)]
    Setting(#[from] SettingError),
}

/// Registry of global and per-model [`TraceSetting`]s.
///
/// Owns the sampling entry point, the weak file cache, and the callback trampolines the host
/// runtime drives as requests progress. See the crate-level concurrency notes for the
/// `w_mu -> r_mu -> setting.mu -> file.mu` lock ordering this type and [`TraceSetting`] jointly
/// maintain.
#[non_exhaustive]
pub struct TraceManager {
    /// Immutable startup defaults; the ultimate fallback for global updates.
    global_default: Arc<TraceSetting>,
    /// Current global setting; the fallback for model updates. `r_mu` equivalent: held only to
    /// clone or replace the reference.
    global_setting: RwLock<Arc<TraceSetting>>,
    /// Per-model settings, independently short-lock-guarded by `DashMap`'s sharding.
    model_settings: DashMap<String, Arc<TraceSetting>>,
    /// Serializes updates; also the home of the `fallback_used_models` set, so both are
    /// protected by the same critical section for the duration of one update.
    w_mu: Mutex<HashSet<String>>,
    /// Filepath -> weak `TraceFile` cache, consulted only while `w_mu` is held.
    trace_files: Mutex<HashMap<PathBuf, Weak<TraceFile>>>,
    otel_config: OpenTelemetryConfig,
    host: Arc<dyn HostRuntime>,
    device: Option<Arc<dyn DeviceCopier>>,
}

impl TraceManager {
    /// Create a manager with the given startup defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the startup defaults are themselves invalid, or (in OTEL mode) if the
    /// trace pipeline cannot be built.
    pub fn new(
        defaults: TraceSettingUpdate,
        otel_config: OpenTelemetryConfig,
        host: Arc<dyn HostRuntime>,
        device: Option<Arc<dyn DeviceCopier>>,
    ) -> Result<Self, ManagerError> {
        let trace_files = Mutex::new(HashMap::new());
        let fields = ResolvedFields {
            level: Field::Inherited,
            effective_level: match &defaults.level {
                crate::FieldUpdate::Set(v) => *v,
                _ => Default::default(),
            },
            rate: Field::Inherited,
            effective_rate: match &defaults.rate {
                crate::FieldUpdate::Set(v) => *v,
                _ => 1,
            },
            count: Field::Inherited,
            effective_count: match &defaults.count {
                crate::FieldUpdate::Set(v) => *v,
                _ => -1,
            },
            log_frequency: Field::Inherited,
            effective_log_frequency: match &defaults.log_frequency {
                crate::FieldUpdate::Set(v) => *v,
                _ => 0,
            },
            filepath: Field::Inherited,
            effective_filepath: match &defaults.filepath {
                crate::FieldUpdate::Set(v) if !v.is_empty() => Some(v.clone()),
                _ => None,
            },
            mode: Field::Inherited,
            effective_mode: match &defaults.mode {
                crate::FieldUpdate::Set(v) => *v,
                _ => Default::default(),
            },
            config_map: Field::Inherited,
            effective_config_map: match &defaults.config_map {
                crate::FieldUpdate::Set(v) => v.clone(),
                _ => Default::default(),
            },
        };

        let manager = Self {
            global_default: Arc::new(TraceSetting::build(
                fields_clone(&fields),
                |path| resolve_file(&trace_files, path),
                || otel_config.resource(),
            )?),
            global_setting: RwLock::new(Arc::new(TraceSetting::build(
                fields,
                |path| resolve_file(&trace_files, path),
                || otel_config.resource(),
            )?)),
            model_settings: DashMap::new(),
            w_mu: Mutex::new(HashSet::new()),
            trace_files,
            otel_config,
            host,
            device,
        };
        Ok(manager)
    }

    /// Apply `update` to the global setting (`model_name` empty) or to one model's setting.
    ///
    /// A global update re-applies a no-op update to every model in `fallback_used_models` so
    /// models that partially inherit from the global see the change.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting effective setting is invalid for a reason other than
    /// disabling tracing, or if an OTEL-mode pipeline cannot be built.
    pub fn update_trace_setting(
        &self,
        model_name: &str,
        update: &TraceSettingUpdate,
    ) -> Result<(), ManagerError> {
        let mut fallback_used = self.w_mu.lock();
        self.apply_update(&mut fallback_used, model_name, update)?;
        if model_name.is_empty() {
            let affected: Vec<String> = fallback_used.iter().cloned().collect();
            let noop = TraceSettingUpdate::default();
            for model in affected {
                self.apply_update(&mut fallback_used, &model, &noop)?;
            }
        }
        Ok(())
    }

    fn apply_update(
        &self,
        fallback_used: &mut HashSet<String>,
        model_name: &str,
        update: &TraceSettingUpdate,
    ) -> Result<(), ManagerError> {
        let is_global = model_name.is_empty();
        let fallback: Arc<TraceSetting> = if is_global {
            self.global_default.clone()
        } else {
            self.global_setting.read().clone()
        };
        let current: Option<Arc<TraceSetting>> = if is_global {
            Some(self.global_setting.read().clone())
        } else {
            self.model_settings.get(model_name).map(|entry| entry.clone())
        };
        let current = current.as_deref();

        let fallback_level = fallback.level();
        let (level, effective_level) = update
            .level
            .merge(current.map(TraceSetting::level_field), &fallback_level);
        let fallback_rate = fallback.rate();
        let (rate, effective_rate) = update
            .rate
            .merge(current.map(TraceSetting::rate_field), &fallback_rate);
        let fallback_count = fallback.count();
        let (count, effective_count) = update
            .count
            .merge(current.map(TraceSetting::count_field), &fallback_count);
        let fallback_log_frequency = fallback.log_frequency();
        let (log_frequency, effective_log_frequency) = update.log_frequency.merge(
            current.map(TraceSetting::log_frequency_field),
            &fallback_log_frequency,
        );
        let fallback_filepath = fallback.filepath().unwrap_or("").to_string();
        let (filepath, effective_filepath_raw) = update
            .filepath
            .merge(current.map(TraceSetting::filepath_field), &fallback_filepath);
        let fallback_mode = fallback.mode();
        let (mode, effective_mode) = update
            .mode
            .merge(current.map(TraceSetting::mode_field), &fallback_mode);
        let (config_map, effective_config_map) = update.config_map.merge(
            current.map(TraceSetting::config_map_field),
            fallback.config_map(),
        );

        let tracked_specified = [
            level.specified(),
            rate.specified(),
            count.specified(),
            log_frequency.specified(),
            filepath.specified(),
        ];
        let specified_count = tracked_specified.iter().filter(|b| **b).count();

        let effective_filepath = (!effective_filepath_raw.is_empty()).then_some(effective_filepath_raw);

        let fields = ResolvedFields {
            level,
            effective_level,
            rate,
            effective_rate,
            count,
            effective_count,
            log_frequency,
            effective_log_frequency,
            filepath,
            effective_filepath,
            mode,
            effective_mode,
            config_map,
            effective_config_map,
        };

        let new_setting = Arc::new(TraceSetting::build(
            fields,
            |path| resolve_file(&self.trace_files, path),
            || self.otel_config.resource(),
        )?);

        if is_global {
            *self.global_setting.write() = new_setting;
            return Ok(());
        }

        match specified_count {
            0 => {
                self.model_settings.remove(model_name);
                fallback_used.remove(model_name);
            }
            5 => {
                self.model_settings.insert(model_name.to_string(), new_setting);
                fallback_used.remove(model_name);
            }
            _ => {
                self.model_settings.insert(model_name.to_string(), new_setting);
                fallback_used.insert(model_name.to_string());
            }
        }
        Ok(())
    }

    /// The per-model setting if one is registered, else the current global setting.
    #[must_use]
    pub fn get_trace_setting(&self, model_name: &str) -> Arc<TraceSetting> {
        if model_name.is_empty() {
            return self.global_setting.read().clone();
        }
        self.model_settings
            .get(model_name)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| self.global_setting.read().clone())
    }

    /// Ask the applicable setting to sample a request for `model_name`.
    ///
    /// On a sampler hit, asks the host runtime for a native trace handle and binds the new
    /// [`Trace`] to the setting that sampled it. Returns `None` on a sampler miss or if the host
    /// fails to create a handle (logged, not propagated: sampling never blocks the request
    /// path).
    #[must_use]
    pub fn sample_trace(&self, model_name: &str) -> Option<Arc<Trace>> {
        let setting = self.get_trace_setting(model_name);
        if !setting.sample() {
            return None;
        }
        match self.host.create_trace() {
            Ok(host_trace) => Some(Arc::new(Trace::new(host_trace, setting))),
            Err(err) => {
                tracing::warn!(%err, model = model_name, "host runtime failed to create trace handle");
                None
            }
        }
    }

    /// Host callback fired when a native trace handle (root or child) is released.
    ///
    /// In this crate's ownership model every clone of the shared `Trace` holder the host was
    /// given corresponds to one native handle; dropping this clone here lets Rust's reference
    /// counting retire the aggregator exactly when the root's is the last one released.
    pub fn trace_release(&self, trace: Arc<Trace>, parent_id: u64) {
        tracing::trace!(
            trace_id = trace.id(),
            parent_id,
            model_name = %trace.host().model_name(),
            "releasing trace handle"
        );
    }

    /// Host callback fired for a timestamp activity.
    ///
    /// `sub_trace` is the host's handle for whichever trace (root or child) this activity
    /// concerns, not necessarily `trace`'s own root handle; its identity fields are what go into
    /// the `REQUEST_START` header, so a child's fan-out request reports the child's own
    /// `model_name`/`model_version`/`request_id`/`parent_id` rather than the root's.
    pub fn trace_activity(&self, trace: &Trace, sub_trace: &dyn HostTrace, activity: Activity, ts_ns: u64) {
        let identity = (activity == Activity::RequestStart).then(|| ActivityIdentity {
            model_name: sub_trace.model_name(),
            model_version: sub_trace.model_version(),
            request_id: sub_trace.request_id(),
            parent_id: sub_trace.parent_id(),
        });
        trace.capture_timestamp(sub_trace.id(), &activity, ts_ns, identity.as_ref());
    }

    /// Host callback fired for a tensor activity.
    ///
    /// Rejects non-tensor activity kinds with a log. Copies device-resident tensors to host
    /// memory first; a missing [`DeviceCopier`] or a failed copy drops the event with a log.
    pub fn trace_tensor_activity(&self, trace: &Trace, sub_id: u64, activity: Activity, tensor: &TensorView<'_>) {
        if !activity.is_tensor() {
            tracing::warn!(%activity, "rejecting non-tensor activity passed to trace_tensor_activity");
            return;
        }
        if tensor.needs_copy() {
            let Some(device) = &self.device else {
                tracing::warn!(
                    tensor = tensor.name,
                    "tensor resides in device memory but no device copier is configured; dropping event"
                );
                return;
            };
            match device.copy_to_host(tensor) {
                Ok(data) => trace.capture_tensor(sub_id, &activity, tensor, &data),
                Err(err) => {
                    tracing::warn!(%err, tensor = tensor.name, "device-to-host tensor copy failed; dropping event");
                }
            }
        } else {
            trace.capture_tensor(sub_id, &activity, tensor, tensor.data);
        }
    }
}

fn resolve_file(cache: &Mutex<HashMap<PathBuf, Weak<TraceFile>>>, path: &str) -> Arc<TraceFile> {
    let path_buf = PathBuf::from(path);
    let mut files = cache.lock();
    if let Some(weak) = files.get(&path_buf) {
        if let Some(strong) = weak.upgrade() {
            return strong;
        }
    }
    let file = Arc::new(TraceFile::new(path_buf.clone()));
    files.insert(path_buf, Arc::downgrade(&file));
    file
}

/// `ResolvedFields` carries no `Clone` impl of its own, since a merged update normally consumes
/// its fields exactly once; `global_default` and the initial `global_setting` are the one case
/// that legitimately need two independent `TraceSetting`s built from the same startup values.
fn fields_clone(fields: &ResolvedFields) -> ResolvedFields {
    ResolvedFields {
        level: fields.level.clone(),
        effective_level: fields.effective_level,
        rate: fields.rate.clone(),
        effective_rate: fields.effective_rate,
        count: fields.count.clone(),
        effective_count: fields.effective_count,
        log_frequency: fields.log_frequency.clone(),
        effective_log_frequency: fields.effective_log_frequency,
        filepath: fields.filepath.clone(),
        effective_filepath: fields.effective_filepath.clone(),
        mode: fields.mode.clone(),
        effective_mode: fields.effective_mode,
        config_map: fields.config_map.clone(),
        effective_config_map: fields.effective_config_map.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::{Path, PathBuf},
        sync::atomic::{AtomicU64, Ordering},
    };

    use super::*;
    use crate::{field::FieldUpdate, host::HostError, setting::TraceLevel};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn scratch_path(label: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "modeltrace-manager-test-{label}-{}-{n}.json",
            std::process::id()
        ))
    }

    struct FakeTrace {
        id: u64,
    }

    impl HostTrace for FakeTrace {
        fn id(&self) -> u64 {
            self.id
        }
        fn parent_id(&self) -> u64 {
            0
        }
        fn model_name(&self) -> String {
            "model".to_string()
        }
        fn model_version(&self) -> i64 {
            1
        }
        fn request_id(&self) -> Option<String> {
            None
        }
        fn created_at_steady_ns(&self) -> u64 {
            0
        }
    }

    struct FakeHost {
        next_id: AtomicU64,
    }

    impl FakeHost {
        fn new() -> Self {
            Self { next_id: AtomicU64::new(1) }
        }
    }

    impl HostRuntime for FakeHost {
        fn create_trace(&self) -> Result<Box<dyn HostTrace>, HostError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeTrace { id }))
        }
    }

    /// A full 5-field update (`level`/`rate`/`count`/`log_frequency`/`filepath` all `Set`);
    /// `mode`/`config_map` stay `Unchanged` since the tests below never exercise OTEL mode.
    fn full_update(level: TraceLevel, rate: u32, count: i64, filepath: &str) -> TraceSettingUpdate {
        TraceSettingUpdate {
            level: FieldUpdate::Set(level),
            rate: FieldUpdate::Set(rate),
            count: FieldUpdate::Set(count),
            log_frequency: FieldUpdate::Set(0),
            filepath: FieldUpdate::Set(filepath.to_string()),
            mode: FieldUpdate::Unchanged,
            config_map: FieldUpdate::Unchanged,
        }
    }

    fn test_manager(path: &Path) -> TraceManager {
        let defaults = full_update(TraceLevel::TIMESTAMPS, 1, -1, &path.display().to_string());
        TraceManager::new(defaults, OpenTelemetryConfig::default(), Arc::new(FakeHost::new()), None)
            .expect("valid startup defaults must build")
    }

    #[test]
    fn global_update_fans_out_to_models_without_overrides() {
        let path = scratch_path("global");
        let manager = test_manager(&path);
        assert_eq!(manager.get_trace_setting("").rate(), 1);

        let update = full_update(TraceLevel::TIMESTAMPS, 4, -1, &path.display().to_string());
        manager.update_trace_setting("", &update).unwrap();

        assert_eq!(manager.get_trace_setting("").rate(), 4);
        assert_eq!(manager.get_trace_setting("unregistered_model").rate(), 4);
    }

    #[test]
    fn partial_model_override_stays_in_fallback_set_and_tracks_global_changes() {
        let path = scratch_path("partial");
        let manager = test_manager(&path);

        let mut rate_only = TraceSettingUpdate::default();
        rate_only.rate = FieldUpdate::Set(7);
        manager.update_trace_setting("model_a", &rate_only).unwrap();

        let model_setting = manager.get_trace_setting("model_a");
        assert_eq!(model_setting.rate(), 7);
        assert_eq!(model_setting.level(), TraceLevel::TIMESTAMPS);

        let update = full_update(
            TraceLevel::TIMESTAMPS | TraceLevel::TENSORS,
            1,
            -1,
            &path.display().to_string(),
        );
        manager.update_trace_setting("", &update).unwrap();

        let model_setting = manager.get_trace_setting("model_a");
        assert_eq!(model_setting.rate(), 7, "model-specified field must survive a global update");
        assert_eq!(
            model_setting.level(),
            TraceLevel::TIMESTAMPS | TraceLevel::TENSORS,
            "inherited field must track the new global value"
        );
    }

    #[test]
    fn clearing_every_override_removes_the_model_entry() {
        let path = scratch_path("clear");
        let manager = test_manager(&path);

        let full = full_update(TraceLevel::TIMESTAMPS, 9, 3, &path.display().to_string());
        manager.update_trace_setting("model_b", &full).unwrap();
        assert_eq!(manager.get_trace_setting("model_b").rate(), 9);

        let clear = TraceSettingUpdate {
            level: FieldUpdate::Clear,
            rate: FieldUpdate::Clear,
            count: FieldUpdate::Clear,
            log_frequency: FieldUpdate::Clear,
            filepath: FieldUpdate::Clear,
            mode: FieldUpdate::Unchanged,
            config_map: FieldUpdate::Unchanged,
        };
        manager.update_trace_setting("model_b", &clear).unwrap();

        assert!(Arc::ptr_eq(
            &manager.get_trace_setting("model_b"),
            &manager.get_trace_setting("")
        ));
    }

    #[test]
    fn in_flight_trace_flushes_to_the_file_it_was_sampled_under() {
        let path_a = scratch_path("preupdate");
        let path_b = scratch_path("postupdate");
        let manager = test_manager(&path_a);

        let trace = manager.sample_trace("model_c").expect("rate 1 / count -1 always samples");
        let sub_trace = trace.host();
        manager.trace_activity(&trace, sub_trace, Activity::RequestStart, 0);

        let switch_file = full_update(TraceLevel::TIMESTAMPS, 1, -1, &path_b.display().to_string());
        manager.update_trace_setting("", &switch_file).unwrap();

        drop(trace);

        let contents = fs::read_to_string(&path_a).expect("trace must flush to the pre-update file");
        assert!(contents.contains("REQUEST_START"));
        assert!(!path_b.exists(), "the post-update file must not receive this in-flight trace");

        fs::remove_file(&path_a).ok();
    }
}
