#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod errors;
mod field;
mod file;
mod host;
mod manager;
mod otel;
mod setting;
mod trace;

pub use self::{
    errors::IoError,
    field::{Field, FieldUpdate},
    file::TraceFile,
    host::{
        Activity, DataType, DeviceCopier, DeviceCopyError, HostError, HostRuntime, HostTrace,
        MemoryType, TensorView,
    },
    manager::{ManagerError, TraceManager},
    otel::{OpenTelemetryConfig, OtelError},
    setting::{ConfigMap, SettingError, TraceLevel, TraceMode, TraceSetting, TraceSettingUpdate},
    trace::Trace,
};
