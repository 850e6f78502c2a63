//! End-to-end test of the gateway pipeline: UDP datagrams in, summary lines out.

use figment::providers::{Format, Toml};
use figment::Figment;
use std::sync::Arc;
use std::time::Duration;
use telemetry_gateway::config::GatewayConfig;
use telemetry_gateway::data::storage::open_sink;
use telemetry_gateway::gateway::Gateway;
use telemetry_gateway::network::UdpReceiver;
use telemetry_gateway::transport::{ConsoleTransport, RebootAction, Transport};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;

struct NoReboot;

impl RebootAction for NoReboot {
    fn trigger(&self) {}
}

fn config(dir: &TempDir) -> GatewayConfig {
    let toml = format!(
        r#"
        [transport]
        kind = "console"

        [serial]
        vendor_id = "1234"
        product_id = "5678"

        [udp]
        ip_address = "127.0.0.1"
        port = 0
        udp_last_seen_file = "{last_seen}"

        [gateway]
        flush_interval = "50ms"

        [storage]
        csv_path = "{archive}"

        [[channels]]
        id = "EHZ"
        averaging_window = "0s"

        [[channels]]
        id = "EHN"
        averaging_window = "1h"
        "#,
        last_seen = dir.path().join("udp_last_seen").display(),
        archive = dir.path().join("archive.csv").display(),
    );
    GatewayConfig::from_figment(Figment::from(Toml::string(&toml))).unwrap()
}

async fn next_line(lines: &mut Lines<BufReader<DuplexStream>>) -> String {
    timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("timed out waiting for a summary line")
        .unwrap()
        .expect("output closed")
}

#[tokio::test]
async fn test_datagrams_become_summary_lines() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let (_input_host, input) = tokio::io::duplex(64);
    let (output, output_host) = tokio::io::duplex(4096);
    let transport: Arc<dyn Transport> =
        Arc::new(ConsoleTransport::with_io(input, output, Arc::new(NoReboot)));

    let mut receiver = UdpReceiver::bind(&config.udp).await.unwrap();
    let target = receiver.local_addr().unwrap();
    let sink = open_sink(&config.storage).unwrap();
    let mut gateway = Gateway::from_config(&config, transport.clone(), sink);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(async move {
        gateway.run(&mut receiver, shutdown_rx).await;
    });

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for datagram in [
        "{'XYZ', 1.0, 1, 2}",
        "garbage",
        "{'EHN', 1.0, 5, 5}",
        "{'EHZ', 1700000000.5, 10, 20, 30}",
        "{'EHZ', 1700000001.0, 7}",
    ] {
        sender.send_to(datagram.as_bytes(), target).await.unwrap();
    }

    let mut lines = BufReader::new(output_host).lines();
    assert_eq!(
        next_line(&mut lines).await,
        "EHZ;1700000000.5;1700000000.5;3;0;6;10"
    );
    assert_eq!(
        next_line(&mut lines).await,
        "EHZ;1700000001.0;1700000001.0;1;0;0;0"
    );

    shutdown_tx.send_replace(true);
    running.await.unwrap();
    transport.close();
    transport.join().await;

    // Everything that parsed was archived, including the unknown channel.
    let archive = std::fs::read_to_string(dir.path().join("archive.csv")).unwrap();
    let rows: Vec<&str> = archive.lines().skip(1).collect();
    assert_eq!(rows.len(), 4);
    assert!(rows[0].starts_with("1,XYZ,1.0,"));
    assert!(rows[3].starts_with("4,EHZ,1700000001.0,"));

    let last_seen: f64 = std::fs::read_to_string(dir.path().join("udp_last_seen"))
        .unwrap()
        .parse()
        .unwrap();
    assert!(last_seen > 0.0);
}
