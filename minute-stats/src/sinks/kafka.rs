use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use crate::config::KafkaConfig;
use crate::minute::Minute;
use crate::sinks::{FinalizedStat, SinkError, StatsSink};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("minute_stats_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("minute_stats_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("minute_stats_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("minute_stats_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("minute_stats_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            if let Some(rtt) = stats.rtt {
                gauge!(
                    "minute_stats_kafka_produce_rtt_latency_us",
                    "quantile" => "p50",
                    "broker" => id_string.clone()
                )
                .set(rtt.p50 as f64);
                gauge!(
                    "minute_stats_kafka_produce_rtt_latency_us",
                    "quantile" => "p99",
                    "broker" => id_string.clone()
                )
                .set(rtt.p99 as f64);
            }

            counter!(
                "minute_stats_kafka_broker_tx_errors_total",
                "broker" => id_string.clone()
            )
            .absolute(stats.txerrs);
            counter!(
                "minute_stats_kafka_broker_request_timeouts",
                "broker" => id_string
            )
            .absolute(stats.req_timeouts);
        }
    }
}

/// Publishes one message per finalized minute, keyed by the minute's epoch seconds.
///
/// librdkafka retries transient broker errors internally until
/// `message.timeout.ms` runs out; nothing is retried on top of that.
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    message_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> anyhow::Result<KafkaSink> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if !config.kafka_client_id.is_empty() {
            client_config.set("client.id", &config.kafka_client_id);
        }

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(KafkaSink {
            producer,
            topic: config.kafka_topic.clone(),
            message_timeout: Duration::from_millis(config.kafka_message_timeout_ms.into()),
            closed: AtomicBool::new(false),
        })
    }

    fn kafka_send(&self, minute: Minute, count: u64) -> Result<DeliveryFuture, SinkError> {
        let payload = serde_json::to_string(&FinalizedStat::new(minute, count)).map_err(|e| {
            error!("failed to serialize stat: {}", e);
            SinkError::Serialization(e.to_string())
        })?;
        let key = minute.epoch_seconds().to_string();

        self.producer
            .send_result(FutureRecord::to(&self.topic).payload(&payload).key(&key))
            .map_err(|(e, _)| {
                counter!("minute_stats_kafka_produce_errors_total").increment(1);
                error!("failed to enqueue stat for {}: {}", minute, e);
                SinkError::Produce(e.to_string())
            })
    }

    async fn process_ack(&self, delivery: DeliveryFuture) -> Result<(), SinkError> {
        match delivery.await {
            Err(_) => {
                // Cancelled while the producer was shutting down
                counter!("minute_stats_kafka_produce_errors_total").increment(1);
                error!("stat delivery cancelled before the broker acknowledged it");
                Err(SinkError::Produce("delivery cancelled".to_string()))
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), _))) => {
                counter!("minute_stats_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(SinkError::Timeout(self.message_timeout))
            }
            Ok(Err((err, _))) => {
                counter!("minute_stats_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(SinkError::Produce(err.to_string()))
            }
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl StatsSink for KafkaSink {
    #[instrument(skip(self))]
    async fn write_stats(&self, minute: Minute, count: u64) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }

        let ack = self.kafka_send(minute, count)?;
        let result = self
            .process_ack(ack)
            .instrument(info_span!("ack_wait_one"))
            .await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!("minute_stats_sink_writes_total", "sink" => "kafka", "outcome" => outcome)
            .increment(1);
        result
    }

    async fn close(&self) -> Result<(), SinkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("flushing Kafka producer");
        let producer = self.producer.clone();
        match tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut))) => {
                Err(SinkError::Timeout(FLUSH_TIMEOUT))
            }
            Ok(Err(err)) => Err(SinkError::Produce(err.to_string())),
            Err(err) => Err(SinkError::Produce(format!("flush task failed: {err}"))),
        }
    }
}
