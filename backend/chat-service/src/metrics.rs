use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, TextEncoder};

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|_| panic!("failed to create {name}"));
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|_| panic!("failed to register {name}"));
    counter
}

pub static MESSAGES_SENT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_service_messages_sent_total",
        "Messages persisted by the conversation engine",
    )
});

pub static DELIVERY_LIVE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_service_delivery_live_total",
        "Pushes delivered to a live connection",
    )
});

pub static DELIVERY_QUEUED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_service_delivery_queued_total",
        "Pushes parked in a per-user offline queue",
    )
});

pub static DELIVERY_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_service_delivery_dropped_total",
        "Pushes dropped because queueing is disabled",
    )
});

pub static QUEUE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_service_queue_evictions_total",
        "Oldest queued pushes evicted from a full offline queue",
    )
});

pub static SUPERSESSIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_service_supersessions_total",
        "Live connections replaced by a newer connection for the same user",
    )
});

pub static SYNC_TRUNCATED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "chat_service_sync_truncated_total",
        "Catch-up batches truncated at the configured limit",
    )
});

pub static LIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::with_opts(Opts::new(
        "chat_service_live_connections",
        "Currently registered live connections",
    ))
    .expect("failed to create chat_service_live_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register chat_service_live_connections");
    gauge
});

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, encoder.format_type())
        .body(buffer.into())
        .unwrap_or_else(|err| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(err.to_string().into())
                .expect("failed to build metrics error response")
        })
}
