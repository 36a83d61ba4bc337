use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, TextEncoder};

use crate::models::ProviderKind;

static MESSAGE_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "push_gateway_messages_total",
            "Delivery outcomes recorded by the push gateway",
        ),
        &["provider", "outcome"],
    )
    .expect("failed to create push_gateway_messages_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_gateway_messages_total");
    counter
});

static FEEDBACK_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "push_gateway_feedback_events_total",
            "APNS feedback events processed by the push gateway",
        ),
        &["outcome"],
    )
    .expect("failed to create push_gateway_feedback_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register push_gateway_feedback_events_total");
    counter
});

pub fn observe_message_outcome(kind: ProviderKind, outcome: &str) {
    MESSAGE_OUTCOMES
        .with_label_values(&[kind.as_str(), outcome])
        .inc();
}

pub fn observe_feedback_event(outcome: &str) {
    FEEDBACK_EVENTS.with_label_values(&[outcome]).inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
