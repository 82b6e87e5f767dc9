//! Exchange outcome recording.

use media_telemetry::{COLLECTORS_ACTIVE, EXCHANGES_TOTAL, EXCHANGE_DURATION, UNSOLICITED_PACKETS};
use stanza_bus::{CorrelationRegistry, ExchangeClient, ExchangeError, Reply};

/// Outcome label for `media_exchanges_total`.
pub fn outcome_label(outcome: &Result<Reply, ExchangeError>) -> &'static str {
    match outcome {
        Ok(_) => "completed",
        Err(ExchangeError::Remote { .. }) => "remote_error",
        Err(ExchangeError::Timeout { .. }) => "timed_out",
        Err(ExchangeError::Cancelled) => "cancelled",
        Err(_) => "failed",
    }
}

/// Record one finished exchange issued by `check`.
pub fn record_exchange(
    check: &str,
    client: &ExchangeClient,
    outcome: &Result<Reply, ExchangeError>,
) {
    EXCHANGES_TOTAL
        .with_label_values(&[check, outcome_label(outcome)])
        .inc();
    if let Ok(reply) = outcome {
        EXCHANGE_DURATION.observe(reply.response_time.as_secs_f64());
    }
    refresh_collectors_active(client.registry());
}

/// Set `media_collectors_active` from the registry's live count.
pub fn refresh_collectors_active(registry: &CorrelationRegistry) {
    COLLECTORS_ACTIVE.set(registry.len() as i64);
}

pub fn record_unsolicited() {
    UNSOLICITED_PACKETS.inc();
}
