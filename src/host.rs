//! Narrow interfaces standing in for the host inference runtime and its GPU-copy primitives.
//!
//! This crate does not bind to any particular server's ABI. The host runtime instead implements
//! [`HostRuntime`] (to let this crate request native trace handles) and calls the
//! [`crate::TraceManager`] activity callbacks directly; [`DeviceCopier`] is the narrow interface
//! used to pull tensor data out of device memory when tracing tensor activities.

use std::fmt;

use thiserror::Error;

/// Error returned when the host runtime fails to create a native trace handle.
#[derive(Debug, Error)]
#[error("host runtime failed to create inference trace handle: {0}")]
pub struct HostError(pub String);

/// Error returned when copying a tensor out of device memory fails.
#[derive(Debug, Error)]
#[error("device-to-host tensor copy failed: {0}")]
pub struct DeviceCopyError(pub String);

/// A point in the inference-request lifetime reported by the host runtime.
///
/// Named activities mirror the trace-activity kinds of the reference inference server API;
/// [`Activity::Custom`] covers any additional activity name the host chooses to report.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Activity {
    /// Request has been received and admitted.
    RequestStart,
    /// Request has been placed in the scheduling queue.
    QueueStart,
    /// Model computation has started.
    ComputeStart,
    /// Model computation has finished consuming its inputs.
    ComputeInputEnd,
    /// Model computation has started producing outputs.
    ComputeOutputStart,
    /// Model computation has finished.
    ComputeEnd,
    /// Request processing has finished.
    RequestEnd,
    /// Input tensor observed while queued.
    TensorQueueInput,
    /// Input tensor observed by the backend.
    TensorBackendInput,
    /// Output tensor produced by the backend.
    TensorBackendOutput,
    /// Host-reported activity with a name this crate doesn't otherwise recognize.
    Custom(String),
}

impl Activity {
    /// Whether this activity kind carries a tensor payload.
    #[must_use]
    pub fn is_tensor(&self) -> bool {
        matches!(
            self,
            Self::TensorQueueInput | Self::TensorBackendInput | Self::TensorBackendOutput
        )
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestStart => write!(f, "REQUEST_START"),
            Self::QueueStart => write!(f, "QUEUE_START"),
            Self::ComputeStart => write!(f, "COMPUTE_START"),
            Self::ComputeInputEnd => write!(f, "COMPUTE_INPUT_END"),
            Self::ComputeOutputStart => write!(f, "COMPUTE_OUTPUT_START"),
            Self::ComputeEnd => write!(f, "COMPUTE_END"),
            Self::RequestEnd => write!(f, "REQUEST_END"),
            Self::TensorQueueInput => write!(f, "TENSOR_QUEUE_INPUT"),
            Self::TensorBackendInput => write!(f, "TENSOR_BACKEND_INPUT"),
            Self::TensorBackendOutput => write!(f, "TENSOR_BACKEND_OUTPUT"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// Memory residency of a tensor buffer, as reported by the host runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryType {
    /// Regular host (CPU) memory.
    Cpu,
    /// Pinned host memory, still directly readable.
    CpuPinned,
    /// Device (GPU) memory; requires a [`DeviceCopier`] to read.
    Gpu,
}

/// Tensor element data type, as it must appear in serialized trace JSON.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum DataType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp16,
    Fp32,
    Fp64,
    Bf16,
    Bytes,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bool => "BOOL",
            Self::Uint8 => "UINT8",
            Self::Uint16 => "UINT16",
            Self::Uint32 => "UINT32",
            Self::Uint64 => "UINT64",
            Self::Int8 => "INT8",
            Self::Int16 => "INT16",
            Self::Int32 => "INT32",
            Self::Int64 => "INT64",
            Self::Fp16 => "FP16",
            Self::Fp32 => "FP32",
            Self::Fp64 => "FP64",
            Self::Bf16 => "BF16",
            Self::Bytes => "BYTES",
        };
        write!(f, "{s}")
    }
}

/// A tensor snapshot passed to [`crate::TraceManager::trace_tensor_activity`].
#[non_exhaustive]
pub struct TensorView<'a> {
    /// Tensor name as reported by the host.
    pub name: &'a str,
    /// Element data type.
    pub dtype: DataType,
    /// Tensor dimensions.
    pub shape: &'a [i64],
    /// Raw tensor bytes. Only valid to read directly when `memory_type == MemoryType::Cpu` (or
    /// `CpuPinned`); otherwise must be copied to host memory with a [`DeviceCopier`] first.
    pub data: &'a [u8],
    /// Declared byte size of the tensor payload, independent of `data.len()` for `BYTES`
    /// tensors whose length-prefixed entries might not fill the full buffer.
    pub byte_size: usize,
    /// Residency of `data`.
    pub memory_type: MemoryType,
    /// Device index `data` resides on, meaningful only when `memory_type == MemoryType::Gpu`.
    pub memory_type_id: i64,
}

impl TensorView<'_> {
    /// Whether this tensor needs a device-to-host copy before it can be serialized.
    #[must_use]
    pub fn needs_copy(&self) -> bool {
        self.memory_type == MemoryType::Gpu
    }
}

/// A handle to one native inference-trace object owned by the host runtime.
///
/// Implemented by the host; root and child traces created for the same request share one
/// [`crate::Trace`] aggregator through the manager's callback trampolines, but each carries its
/// own `HostTrace` handle.
pub trait HostTrace: Send + Sync {
    /// Id assigned to this trace by the host. Unique across all traces the host has created.
    fn id(&self) -> u64;
    /// Id of the parent trace, or `0` if this is a root trace.
    fn parent_id(&self) -> u64;
    /// Name of the model handling the traced request.
    fn model_name(&self) -> String;
    /// Version of the model handling the traced request.
    fn model_version(&self) -> i64;
    /// Client-supplied request id, if any.
    fn request_id(&self) -> Option<String>;
    /// Host steady/monotonic clock reading, in the same clock domain as the `ts_ns` timestamps
    /// later reported through [`crate::TraceManager`]'s activity callbacks, taken at the moment
    /// this handle was created. Lets the trace correlate those steady timestamps to wall-clock
    /// time without assuming the steady clock's epoch is wall-clock time itself.
    fn created_at_steady_ns(&self) -> u64;
}

/// Factory the host runtime implements so sampled traces can be bound to a native trace object.
pub trait HostRuntime: Send + Sync {
    /// Create a native inference-trace handle for a freshly sampled root trace.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the host is unable to allocate a trace handle for this request.
    fn create_trace(&self) -> Result<Box<dyn HostTrace>, HostError>;
}

/// Narrow interface over the host's GPU-to-host memory copy primitive.
pub trait DeviceCopier: Send + Sync {
    /// Copy `tensor`'s data into a freshly allocated host buffer.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the underlying device copy fails.
    fn copy_to_host(&self, tensor: &TensorView<'_>) -> Result<Vec<u8>, DeviceCopyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_display_matches_host_naming() {
        assert_eq!(Activity::RequestStart.to_string(), "REQUEST_START");
        assert_eq!(Activity::TensorBackendOutput.to_string(), "TENSOR_BACKEND_OUTPUT");
        assert_eq!(Activity::Custom("FOO_BAR".into()).to_string(), "FOO_BAR");
    }

    #[test]
    fn only_tensor_activities_are_tensor() {
        assert!(Activity::TensorQueueInput.is_tensor());
        assert!(Activity::TensorBackendInput.is_tensor());
        assert!(Activity::TensorBackendOutput.is_tensor());
        assert!(!Activity::RequestStart.is_tensor());
        assert!(!Activity::ComputeStart.is_tensor());
    }

    #[test]
    fn datatype_display() {
        assert_eq!(DataType::Fp16.to_string(), "FP16");
        assert_eq!(DataType::Bytes.to_string(), "BYTES");
        assert_eq!(DataType::Int64.to_string(), "INT64");
    }
}
