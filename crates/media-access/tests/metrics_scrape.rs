//! Scrape-time metrics. Kept in its own test binary so no other test moves
//! the process-wide gauges underneath it.

use std::sync::Arc;

use media_access::{MediaAccessService, MediaServerConfig};
use stanza_bus::{ChannelConnection, Collector, CorrelationFilter};
use tokio::sync::mpsc;

fn gauge_line(exposition: &str) -> Option<&str> {
    exposition
        .lines()
        .find(|line| line.starts_with("media_collectors_active "))
}

#[tokio::test]
async fn test_collector_gauge_tracks_registry_between_checks() {
    media_telemetry::register_metrics().unwrap();

    let (connection, _outbound) = ChannelConnection::pair("media.localhost", 8);
    let (_inbound, inbound_rx) = mpsc::channel(8);
    let service =
        MediaAccessService::start(MediaServerConfig::default(), Arc::new(connection), inbound_rx)
            .unwrap();

    // An exchange registered directly on the client, outside any check.
    let collector = Collector::new(CorrelationFilter::id("direct"));
    let handle = service.client().registry().register(&collector).unwrap();

    let scraped = service.encode_metrics().unwrap();
    assert_eq!(gauge_line(&scraped), Some("media_collectors_active 1"));

    service.client().registry().unregister(&handle).unwrap();
    let scraped = service.encode_metrics().unwrap();
    assert_eq!(gauge_line(&scraped), Some("media_collectors_active 0"));

    service.shutdown().await.unwrap();
}
