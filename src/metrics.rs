use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::thread;
use tracing::{error, info};

/// Every collector the node exports. Owned by the node, shared through `Arc`.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub header_timeouts: IntCounterVec,
    pub header_request_seconds: Histogram,
    pub headers_in: IntCounter,
    pub dedup_suppressed: IntCounter,
    pub publish_dropped: IntCounter,
    pub sink_failures: IntCounterVec,
    pub connected_peers: IntGauge,
    pub handshake_failures: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        // Prefix metrics with `peercollect_` for namespacing.
        let registry = Registry::new_custom(Some("peercollect".into()), None)?;

        let header_timeouts = IntCounterVec::new(
            Opts::new("header_timeouts_total", "Fetch requests that expired without a response"),
            &["kind"],
        )?;
        let header_request_seconds = Histogram::with_opts(
            HistogramOpts::new("header_request_seconds", "Round trip of answered fetch requests")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0]),
        )?;
        let headers_in = IntCounter::new("headers_in_total", "Headers delivered to fetch callers")?;
        let dedup_suppressed =
            IntCounter::new("dedup_suppressed_total", "Records suppressed as already seen")?;
        let publish_dropped =
            IntCounter::new("publish_dropped_total", "Records rejected by a full publish queue")?;
        let sink_failures = IntCounterVec::new(
            Opts::new("sink_failures_total", "Records a sink failed to accept"),
            &["sink"],
        )?;
        let connected_peers = IntGauge::new("connected_peers", "Peers with a live session")?;
        let handshake_failures =
            IntCounter::new("handshake_failures_total", "Connections dropped during handshake")?;

        registry.register(Box::new(header_timeouts.clone()))?;
        registry.register(Box::new(header_request_seconds.clone()))?;
        registry.register(Box::new(headers_in.clone()))?;
        registry.register(Box::new(dedup_suppressed.clone()))?;
        registry.register(Box::new(publish_dropped.clone()))?;
        registry.register(Box::new(sink_failures.clone()))?;
        registry.register(Box::new(connected_peers.clone()))?;
        registry.register(Box::new(handshake_failures.clone()))?;

        Ok(Self {
            registry,
            header_timeouts,
            header_request_seconds,
            headers_in,
            dedup_suppressed,
            publish_dropped,
            sink_failures,
            connected_peers,
            handshake_failures,
        })
    }

    pub fn render(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Serve the text exposition format on `cfg.bind` from a background thread.
pub fn serve(cfg: &crate::config::Metrics, metrics: Metrics) -> Result<()> {
    let bind_addr = cfg.bind.clone();
    let server = tiny_http::Server::http(&bind_addr)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {}", bind_addr, e))?;
    let content_type: tiny_http::Header = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid content type header"))?;
    info!(bind = %bind_addr, "metrics exporter listening");

    thread::spawn(move || {
        for request in server.incoming_requests() {
            let buffer = match metrics.render() {
                Ok(b) => b,
                Err(e) => {
                    error!(err = %e, "could not encode metrics");
                    continue;
                }
            };
            let response = tiny_http::Response::from_data(buffer).with_header(content_type.clone());
            let _ = request.respond(response);
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_namespaced_counters() {
        let m = Metrics::new().unwrap();
        m.header_timeouts.with_label_values(&["headers"]).inc();
        m.sink_failures.with_label_values(&["store"]).inc_by(2);
        let text = String::from_utf8(m.render().unwrap()).unwrap();
        assert!(text.contains("peercollect_header_timeouts_total{kind=\"headers\"} 1"));
        assert!(text.contains("peercollect_sink_failures_total{sink=\"store\"} 2"));
    }
}
