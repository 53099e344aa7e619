//! Prometheus metrics for PulseHub
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.
//! Useful for Grafana dashboards, alerts, and capacity planning.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All PulseHub metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub connections_rejected_total: IntCounter,

    // Fan-out metrics
    pub events_published_total: IntCounter,
    pub events_delivered_total: IntCounter,
    pub events_shed_total: IntCounter,
    pub slow_consumers_total: IntCounter,
    pub hub_restarts_total: IntCounter,

    // Cluster metrics
    pub cluster_messages_sent_total: IntCounter,
    pub cluster_messages_received_total: IntCounter,
    pub cluster_publish_errors_total: IntCounter,

    // Request metrics
    pub requests_total: IntCounterVec,
}

fn counter(name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    IntCounter::with_opts(Opts::new(name, help))
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = counter(
            "pulsehub_connections_total",
            "Total number of WebSocket connections since startup",
        )?;
        let connections_current = IntGauge::with_opts(Opts::new(
            "pulsehub_connections_current",
            "Current number of open WebSocket connections",
        ))?;
        let connections_rejected_total = counter(
            "pulsehub_connections_rejected_total",
            "Connections refused because the server was at its limit",
        )?;

        let events_published_total = counter(
            "pulsehub_events_published_total",
            "Events published on this server",
        )?;
        let events_delivered_total = counter(
            "pulsehub_events_delivered_total",
            "Events enqueued onto connection queues",
        )?;
        let events_shed_total = counter(
            "pulsehub_events_shed_total",
            "Droppable events shed because a connection queue was congested",
        )?;
        let slow_consumers_total = counter(
            "pulsehub_slow_consumers_total",
            "Connections disconnected because their queue was full",
        )?;
        let hub_restarts_total = counter(
            "pulsehub_hub_restarts_total",
            "Hub loops restarted after a panic",
        )?;

        let cluster_messages_sent_total = counter(
            "pulsehub_cluster_messages_sent_total",
            "Messages published to the cluster",
        )?;
        let cluster_messages_received_total = counter(
            "pulsehub_cluster_messages_received_total",
            "Messages from peer servers handed to a cluster handler",
        )?;
        let cluster_publish_errors_total = counter(
            "pulsehub_cluster_publish_errors_total",
            "Cluster publishes that failed",
        )?;

        let requests_total = IntCounterVec::new(
            Opts::new("pulsehub_requests_total", "Client requests by action"),
            &["action"],
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_current.clone()))?;
        registry.register(Box::new(connections_rejected_total.clone()))?;
        registry.register(Box::new(events_published_total.clone()))?;
        registry.register(Box::new(events_delivered_total.clone()))?;
        registry.register(Box::new(events_shed_total.clone()))?;
        registry.register(Box::new(slow_consumers_total.clone()))?;
        registry.register(Box::new(hub_restarts_total.clone()))?;
        registry.register(Box::new(cluster_messages_sent_total.clone()))?;
        registry.register(Box::new(cluster_messages_received_total.clone()))?;
        registry.register(Box::new(cluster_publish_errors_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;

        Ok(Metrics {
            registry,
            connections_total,
            connections_current,
            connections_rejected_total,
            events_published_total,
            events_delivered_total,
            events_shed_total,
            slow_consumers_total,
            hub_restarts_total,
            cluster_messages_sent_total,
            cluster_messages_received_total,
            cluster_publish_errors_total,
            requests_total,
        })
    }

    // Helper methods for common operations

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_current.dec();
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected_total.inc();
    }

    pub fn event_published(&self) {
        self.events_published_total.inc();
    }

    pub fn event_delivered(&self) {
        self.events_delivered_total.inc();
    }

    pub fn event_shed(&self) {
        self.events_shed_total.inc();
    }

    pub fn slow_consumer(&self) {
        self.slow_consumers_total.inc();
    }

    pub fn hub_restarted(&self) {
        self.hub_restarts_total.inc();
    }

    pub fn cluster_message_sent(&self) {
        self.cluster_messages_sent_total.inc();
    }

    pub fn cluster_message_received(&self) {
        self.cluster_messages_received_total.inc();
    }

    pub fn cluster_publish_error(&self) {
        self.cluster_publish_errors_total.inc();
    }

    pub fn request(&self, action: &str) {
        self.requests_total.with_label_values(&[action]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn test_registry_exports_everything() {
        let metrics = Metrics::new().unwrap();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.request("ping");
        metrics.request("ping");
        metrics.slow_consumer();

        assert_eq!(metrics.connections_total.get(), 2);
        assert_eq!(metrics.connections_current.get(), 1);
        assert_eq!(metrics.requests_total.with_label_values(&["ping"]).get(), 2);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("pulsehub_slow_consumers_total 1"));
        assert!(text.contains("pulsehub_hub_restarts_total 0"));
        assert!(text.contains(r#"pulsehub_requests_total{action="ping"} 2"#));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.event_published();
        assert_eq!(a.events_published_total.get(), 1);
        assert_eq!(b.events_published_total.get(), 0);
    }
}
