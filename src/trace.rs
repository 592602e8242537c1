//! Per-sampled-request aggregator.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use opentelemetry::{
    trace::{Span as _, SpanKind, Tracer as _},
    KeyValue,
};
use parking_lot::Mutex;
use serde_json::json;

use crate::{
    host::{Activity, DataType, HostTrace, TensorView},
    setting::{TraceLevel, TraceMode, TraceSetting},
};

/// Request identity fields attached to the `REQUEST_START` fragment/span.
pub(crate) struct ActivityIdentity {
    pub(crate) model_name: String,
    pub(crate) model_version: i64,
    pub(crate) request_id: Option<String>,
    pub(crate) parent_id: u64,
}

/// Per-sampled-request aggregator.
///
/// The root trace and every child trace spawned from it during the same request share one
/// `Trace` (held by the host as an opaque `Arc<Trace>` "user pointer"); activities for any of
/// them land in [`Self::streams`], keyed by whichever sub-trace id the host reports.
#[non_exhaustive]
pub struct Trace {
    trace_id: u64,
    host: Box<dyn HostTrace>,
    setting: Arc<TraceSetting>,
    streams: Mutex<BTreeMap<u64, String>>,
    /// `wall_now - steady_now` at construction, where `steady_now` is the root's
    /// [`HostTrace::created_at_steady_ns`] reading. Adding a later steady-clock event timestamp
    /// (`ts_ns`, in the same clock domain) to this offset yields that event's wall-clock instant,
    /// without assuming the steady clock's epoch is itself wall-clock time. See the crate-level
    /// design notes on time translation.
    time_offset: i64,
    span: Mutex<Option<opentelemetry_sdk::trace::Span>>,
}

impl Trace {
    /// Build a new aggregator for a freshly sampled root trace.
    pub(crate) fn new(host: Box<dyn HostTrace>, setting: Arc<TraceSetting>) -> Self {
        let steady_now = host.created_at_steady_ns();
        let time_offset = now_wall_ns().saturating_sub(steady_now as i64);
        Self {
            trace_id: host.id(),
            host,
            setting,
            streams: Mutex::new(BTreeMap::new()),
            time_offset,
            span: Mutex::new(None),
        }
    }

    /// Host-assigned id of the root trace.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.trace_id
    }

    pub(crate) fn host(&self) -> &dyn HostTrace {
        self.host.as_ref()
    }

    pub(crate) fn setting(&self) -> &Arc<TraceSetting> {
        &self.setting
    }

    fn wall_time(&self, ts_ns: u64) -> SystemTime {
        let nanos = self.time_offset.saturating_add_unsigned(ts_ns).max(0);
        SystemTime::UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    }

    /// Record a timestamp activity for `sub_id`, iff this trace's level includes `TIMESTAMPS`.
    ///
    /// `identity` is supplied only on `REQUEST_START`, and carries the fields that open a new
    /// sub-trace's JSON stream (TRITON mode) or populate the span's `triton.*` attributes
    /// (OTEL mode, where the root span is lazily opened on first use).
    pub(crate) fn capture_timestamp(
        &self,
        sub_id: u64,
        activity: &Activity,
        ts_ns: u64,
        identity: Option<&ActivityIdentity>,
    ) {
        if !self.setting.level().contains(TraceLevel::TIMESTAMPS) {
            return;
        }
        match self.setting.mode() {
            TraceMode::Triton => {
                let mut streams = self.streams.lock();
                let stream = streams.entry(sub_id).or_default();
                if let Some(identity) = identity {
                    push_fragment(stream, &header_fragment(sub_id, identity));
                }
                push_fragment(stream, &timestamp_fragment(sub_id, activity, ts_ns));
            }
            TraceMode::OpenTelemetry => {
                self.with_span(ts_ns, |span| {
                    if let Some(identity) = identity {
                        span.set_attribute(KeyValue::new(
                            "triton.model_name",
                            identity.model_name.clone(),
                        ));
                        span.set_attribute(KeyValue::new(
                            "triton.model_version",
                            identity.model_version,
                        ));
                        span.set_attribute(KeyValue::new(
                            "triton.trace_parent_id",
                            identity.parent_id as i64,
                        ));
                        if let Some(request_id) = &identity.request_id {
                            span.set_attribute(KeyValue::new(
                                "triton.trace_request_id",
                                request_id.clone(),
                            ));
                        }
                    }
                    span.add_event(
                        activity.to_string(),
                        vec![KeyValue::new("triton.steady_timestamp_ns", ts_ns as i64)],
                    );
                });
            }
        }
    }

    /// Record a tensor activity for `sub_id`, iff this trace's level includes `TENSORS`.
    ///
    /// `data` is the tensor's bytes, already copied to host memory if it originated on device.
    /// OTEL mode does not support tensor tracing; the event is logged and dropped.
    pub(crate) fn capture_tensor(
        &self,
        sub_id: u64,
        activity: &Activity,
        tensor: &TensorView<'_>,
        data: &[u8],
    ) {
        if !self.setting.level().contains(TraceLevel::TENSORS) {
            return;
        }
        match self.setting.mode() {
            TraceMode::Triton => {
                let fragment = tensor_fragment(sub_id, activity, tensor, data);
                let mut streams = self.streams.lock();
                let stream = streams.entry(sub_id).or_default();
                push_fragment(stream, &fragment);
            }
            TraceMode::OpenTelemetry => {
                tracing::warn!(
                    %activity,
                    tensor = tensor.name,
                    "tensor tracing is unsupported in OpenTelemetry mode; dropping event"
                );
            }
        }
    }

    fn with_span(&self, first_ts_ns: u64, f: impl FnOnce(&mut opentelemetry_sdk::trace::Span)) {
        let Some(tracer) = self.setting.otel_tracer() else {
            return;
        };
        let mut guard = self.span.lock();
        if guard.is_none() {
            let span = tracer
                .span_builder("InferRequest")
                .with_kind(SpanKind::Server)
                .with_start_time(self.wall_time(first_ts_ns))
                .start(tracer);
            *guard = Some(span);
        }
        if let Some(span) = guard.as_mut() {
            f(span);
        }
    }
}

fn now_wall_ns() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn push_fragment(stream: &mut String, fragment: &str) {
    if !stream.is_empty() {
        stream.push(',');
    }
    stream.push_str(fragment);
}

fn header_fragment(id: u64, identity: &ActivityIdentity) -> String {
    let mut map = serde_json::Map::new();
    map.insert("id".to_string(), json!(id));
    map.insert("model_name".to_string(), json!(identity.model_name));
    map.insert("model_version".to_string(), json!(identity.model_version));
    if let Some(request_id) = &identity.request_id {
        map.insert("request_id".to_string(), json!(request_id));
    }
    if identity.parent_id != 0 {
        map.insert("parent_id".to_string(), json!(identity.parent_id));
    }
    serde_json::Value::Object(map).to_string()
}

fn timestamp_fragment(id: u64, activity: &Activity, ts_ns: u64) -> String {
    json!({
        "id": id,
        "timestamps": [{"name": activity.to_string(), "ns": ts_ns}],
    })
    .to_string()
}

fn tensor_fragment(id: u64, activity: &Activity, tensor: &TensorView<'_>, data: &[u8]) -> String {
    let data_str = serialize_tensor_data(tensor.dtype, data, tensor.byte_size);
    let shape_str = tensor
        .shape
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    json!({
        "id": id,
        "activity": activity.to_string(),
        "tensor": {
            "name": tensor.name,
            "data": data_str,
            "shape": shape_str,
            "dtype": tensor.dtype.to_string(),
        },
    })
    .to_string()
}

/// Serialize tensor bytes into the comma-separated decimal form the JSON output expects.
///
/// `FP16`/`BF16` are emitted empty; `BYTES` entries are length-prefixed (4-byte little-endian
/// length, then that many bytes) and serialization stops silently if an entry would overflow
/// `byte_size`.
fn serialize_tensor_data(dtype: DataType, data: &[u8], byte_size: usize) -> String {
    let data = &data[..data.len().min(byte_size)];
    match dtype {
        DataType::Fp16 | DataType::Bf16 => String::new(),
        DataType::Bool => join_chunks(data, 1, |c| {
            if c[0] != 0 { "true" } else { "false" }.to_string()
        }),
        DataType::Uint8 => join_chunks(data, 1, |c| c[0].to_string()),
        DataType::Int8 => join_chunks(data, 1, |c| (c[0] as i8).to_string()),
        DataType::Uint16 => join_chunks(data, 2, |c| u16::from_le_bytes([c[0], c[1]]).to_string()),
        DataType::Int16 => join_chunks(data, 2, |c| i16::from_le_bytes([c[0], c[1]]).to_string()),
        DataType::Uint32 => join_chunks(data, 4, |c| {
            u32::from_le_bytes(c.try_into().unwrap()).to_string()
        }),
        DataType::Int32 => join_chunks(data, 4, |c| {
            i32::from_le_bytes(c.try_into().unwrap()).to_string()
        }),
        DataType::Fp32 => join_chunks(data, 4, |c| {
            f32::from_le_bytes(c.try_into().unwrap()).to_string()
        }),
        DataType::Uint64 => join_chunks(data, 8, |c| {
            u64::from_le_bytes(c.try_into().unwrap()).to_string()
        }),
        DataType::Int64 => join_chunks(data, 8, |c| {
            i64::from_le_bytes(c.try_into().unwrap()).to_string()
        }),
        DataType::Fp64 => join_chunks(data, 8, |c| {
            f64::from_le_bytes(c.try_into().unwrap()).to_string()
        }),
        DataType::Bytes => serialize_bytes_entries(data),
    }
}

fn join_chunks(data: &[u8], width: usize, format: impl Fn(&[u8]) -> String) -> String {
    // chunks_exact(width) guarantees each chunk has exactly `width` bytes, so the `try_into`
    // calls inside `format` closures above never fail.
    data.chunks_exact(width)
        .map(format)
        .collect::<Vec<_>>()
        .join(",")
}

fn serialize_bytes_entries(data: &[u8]) -> String {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > data.len() {
            break;
        }
        let value = String::from_utf8_lossy(&data[pos..pos + len]);
        entries.push(json!(value).to_string());
        pos += len;
    }
    entries.join(",")
}

impl Drop for Trace {
    fn drop(&mut self) {
        match self.setting.mode() {
            TraceMode::Triton => {
                let streams = self.streams.get_mut();
                if streams.is_empty() {
                    return;
                }
                let joined = streams
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(",");
                self.setting.write_trace(&joined);
            }
            TraceMode::OpenTelemetry => {
                if let Some(mut span) = self.span.get_mut().take() {
                    span.end();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_tensor_serializes_true_false() {
        let data = [1u8, 0, 1];
        assert_eq!(serialize_tensor_data(DataType::Bool, &data, 3), "true,false,true");
    }

    #[test]
    fn int32_tensor_serializes_little_endian() {
        let data = 7i32.to_le_bytes();
        assert_eq!(serialize_tensor_data(DataType::Int32, &data, 4), "7");
    }

    #[test]
    fn fp16_tensor_serializes_empty() {
        let data = [0u8, 1, 2, 3];
        assert_eq!(serialize_tensor_data(DataType::Fp16, &data, 4), "");
    }

    #[test]
    fn bytes_tensor_serializes_length_prefixed_strings() {
        let mut data = Vec::new();
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(b"abc");
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(b"xy");
        assert_eq!(
            serialize_tensor_data(DataType::Bytes, &data, data.len()),
            "\"abc\",\"xy\""
        );
    }

    #[test]
    fn bytes_tensor_stops_silently_on_overflow() {
        let mut data = Vec::new();
        data.extend_from_slice(&10u32.to_le_bytes());
        data.extend_from_slice(b"short");
        assert_eq!(serialize_tensor_data(DataType::Bytes, &data, data.len()), "");
    }

    #[test]
    fn header_fragment_omits_parent_id_for_root() {
        let identity = ActivityIdentity {
            model_name: "m".to_string(),
            model_version: 1,
            request_id: None,
            parent_id: 0,
        };
        let fragment = header_fragment(42, &identity);
        assert_eq!(fragment, r#"{"id":42,"model_name":"m","model_version":1}"#);
    }

    #[test]
    fn header_fragment_includes_parent_id_for_child() {
        let identity = ActivityIdentity {
            model_name: "m".to_string(),
            model_version: 1,
            request_id: Some("r1".to_string()),
            parent_id: 7,
        };
        let fragment = header_fragment(42, &identity);
        assert_eq!(
            fragment,
            r#"{"id":42,"model_name":"m","model_version":1,"request_id":"r1","parent_id":7}"#
        );
    }
}
