//! Protobuf messages published by the telemetry receivers.
//!
//! Both receivers publish one encoded batch per queue message.

/// A batch of metric samples.
///
/// .proto:
/// ```protobuf
/// message MetricBatch {
///   repeated Metric metrics = 1;
/// }
/// ```
#[derive(prost::Message, Clone, PartialEq)]
pub struct MetricBatch {
    /// Samples in the batch.
    #[prost(message, repeated, tag = "1")]
    pub metrics: Vec<Metric>,
}

/// A single metric sample.
///
/// .proto:
/// ```protobuf
/// message Metric {
///   string name = 1;
///   string type = 2;
///   double value = 3;
///   google.protobuf.Timestamp timestamp = 4;
///   repeated string tags = 5;
///   string project_name = 6;
///   string hostname = 7;
///   string os = 8;
///   string unique_id = 9;
///   string unit = 10;
/// }
/// ```
#[derive(prost::Message, Clone, PartialEq)]
pub struct Metric {
    /// Metric name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Metric kind, such as `rate` or `gauge`.
    #[prost(string, tag = "2")]
    pub r#type: String,
    /// Sample value.
    #[prost(double, tag = "3")]
    pub value: f64,
    /// Time the sample was taken.
    #[prost(message, optional, tag = "4")]
    pub timestamp: Option<prost_types::Timestamp>,
    /// Tags, usually `key:value` pairs.
    #[prost(string, repeated, tag = "5")]
    pub tags: Vec<String>,
    /// Project the emitter belongs to.
    #[prost(string, tag = "6")]
    pub project_name: String,
    /// Host the sample or line was produced on.
    #[prost(string, tag = "7")]
    pub hostname: String,
    /// Operating system of the host.
    #[prost(string, tag = "8")]
    pub os: String,
    /// Identity of the emitter.
    #[prost(string, tag = "9")]
    pub unique_id: String,
    /// Unit of the value.
    #[prost(string, tag = "10")]
    pub unit: String,
}

/// A batch of log lines.
///
/// .proto:
/// ```protobuf
/// message LogBatch {
///   repeated Log logs = 1;
/// }
/// ```
#[derive(prost::Message, Clone, PartialEq)]
pub struct LogBatch {
    /// Lines in the batch.
    #[prost(message, repeated, tag = "1")]
    pub logs: Vec<Log>,
}

/// A single log line.
///
/// .proto:
/// ```protobuf
/// message Log {
///   string message = 1;
///   string level = 2;
///   google.protobuf.Timestamp timestamp = 3;
///   string hostname = 4;
///   string service = 5;
///   string file = 6;
///   int32 line = 7;
///   string function = 8;
/// }
/// ```
#[derive(prost::Message, Clone, PartialEq)]
pub struct Log {
    /// Log message.
    #[prost(string, tag = "1")]
    pub message: String,
    /// Log level.
    #[prost(string, tag = "2")]
    pub level: String,
    /// Time the line was logged.
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<prost_types::Timestamp>,
    /// Host the sample or line was produced on.
    #[prost(string, tag = "4")]
    pub hostname: String,
    /// Service that logged the line.
    #[prost(string, tag = "5")]
    pub service: String,
    /// Source file.
    #[prost(string, tag = "6")]
    pub file: String,
    /// Source line.
    #[prost(int32, tag = "7")]
    pub line: i32,
    /// Source function.
    #[prost(string, tag = "8")]
    pub function: String,
}
