//! Example run descriptors written by `brokerload init`.

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Template {
    /// One topic, one shared subscription
    Simple,
    /// Several topics, partitions and subscription modes
    Stress,
}

impl Template {
    pub fn contents(self) -> &'static str {
        match self {
            Template::Simple => SIMPLE_TEMPLATE,
            Template::Stress => STRESS_TEMPLATE,
        }
    }

    pub fn default_file_name(self) -> &'static str {
        match self {
            Template::Simple => "simple_test.yaml",
            Template::Stress => "stress_test.yaml",
        }
    }
}

pub const SIMPLE_TEMPLATE: &str = r#"# Single-topic throughput run
test_name: "simple_throughput_test"
description: "Three rate-limited producers and a shared subscription of three consumers"

broker:
  service_url: "memory://local"

execution:
  duration: "2m"

topics:
  - name: "/default/test"
    partitions: 0
    schema_type: "string"

producers:
  - name: "test_producers"
    topic: "/default/test"
    count: 3
    rate_per_second: 50
    message_size: 256

consumers:
  - name: "test_consumers"
    topic: "/default/test"
    subscription: "sub_shared"
    subscription_type: "shared"
    count: 3

metrics:
  enabled: true
  report_interval: "5s"
  percentiles: [50, 95, 99]
  output_format: "terminal"
  export_path: "./results"
"#;

pub const STRESS_TEMPLATE: &str = r#"# Multi-topic stress run
test_name: "multi_topic_stress_test"
description: "Several topics with partitions and every subscription mode"

broker:
  service_url: "memory://local"

execution:
  duration: "5m"

topics:
  - name: "/default/orders"
    partitions: 3
    schema_type: "json"
    json_schema: |
      {"type":"object","properties":{"seq":{"type":"integer"},"msg":{"type":"string"}},"required":["seq"]}
    dispatch_strategy: "reliable"
  - name: "/default/events"
    partitions: 1
    schema_type: "string"
  - name: "/default/metrics"
    partitions: 0
    schema_type: "int64"

producers:
  - name: "order_producers"
    topic: "/default/orders"
    count: 5
    rate_per_second: 100
    message_size: 1024
  - name: "event_producers"
    topic: "/default/events"
    count: 3
    rate_per_second: 50
    message_size: 512
  - name: "metric_producers"
    topic: "/default/metrics"
    count: 2
    rate_per_second: 200
    message_size: 64

consumers:
  - name: "order_processor"
    topic: "/default/orders"
    subscription: "order_processing"
    subscription_type: "shared"
    count: 3
  - name: "order_analytics"
    topic: "/default/orders"
    subscription: "analytics"
    subscription_type: "exclusive"
    count: 1
  - name: "order_backup"
    topic: "/default/orders"
    subscription: "backup"
    subscription_type: "failover"
    count: 2
  - name: "event_handler"
    topic: "/default/events"
    subscription: "event_processing"
    subscription_type: "shared"
    count: 2

metrics:
  enabled: true
  report_interval: "5s"
  percentiles: [50, 95, 99, 99.9]
  output_format: "terminal"
  export_path: "./results"
"#;
