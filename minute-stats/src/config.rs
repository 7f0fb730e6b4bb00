use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SinkKind {
    File,
    Kafka,
    Print,
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "file" => Ok(SinkKind::File),
            "kafka" => Ok(SinkKind::Kafka),
            "print" => Ok(SinkKind::Print),
            _ => Err(format!("Unknown stats sink: {s}, must be file, kafka or print")),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:8080")]
    pub address: SocketAddr,

    #[envconfig(nested = true)]
    pub redis: RedisConfig,

    #[envconfig(default = "file")]
    pub stats_sink: SinkKind,

    #[envconfig(default = "stats.log")]
    pub log_file_path: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    // Must be one minute for every bucket to be flushed exactly once
    #[envconfig(default = "60000")]
    pub flush_interval_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub notify_timeout_ms: EnvMsDuration,

    // How long shutdown waits for an in-flight flush tick
    #[envconfig(default = "10000")]
    pub shutdown_grace_ms: EnvMsDuration,

    // Deadline for handling one HTTP request, 0 disables it
    #[envconfig(default = "10000")]
    pub request_timeout_ms: EnvMsDuration,

    // How long shutdown waits for open HTTP connections to drain
    #[envconfig(default = "30000")]
    pub http_shutdown_timeout_ms: EnvMsDuration,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "minute-stats")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub log_level: Level,
}

#[derive(Envconfig, Clone)]
pub struct RedisConfig {
    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "verve")]
    pub redis_key_prefix: String,

    // Deadline applied to every store call, connection included
    #[envconfig(default = "5000")]
    pub redis_timeout_ms: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we give up delivering a stat
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "verve-stats")]
    pub kafka_topic: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
    #[envconfig(default = "")]
    pub kafka_client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}
