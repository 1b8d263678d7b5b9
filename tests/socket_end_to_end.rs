use anyhow::Result;
use mb_harness::{
    Cancellation, ClientConfiguration, ClientFactory, ConsumerConfig, Harness, HarnessOptions,
    SocketClientFactory, WaitOutcome,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn options() -> HarnessOptions {
    HarnessOptions {
        startup_delay: Duration::from_millis(200),
        wait_timeout: Duration::from_secs(20),
    }
}

fn write_config(dir: &TempDir, name: &str, xml: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, xml).unwrap();
    path
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Two competing consumers share the messages of two publishers over a
/// Unix domain socket, and every output file is written.
#[tokio::test]
async fn uds_run_delivers_every_message_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("e2e.sock");
    let received = dir.path().join("out/received.jsonl");
    let consumer_stats = dir.path().join("out/consumer.csv");
    let publisher_stats = dir.path().join("out/publisher.csv");

    let xml = format!(
        r#"<base>
  <consumer count="2">
    <transport>uds</transport>
    <socketPath>{socket}</socketPath>
    <destinationName>e2e</destinationName>
    <maximumMessagesToReceive>50</maximumMessagesToReceive>
    <printsPerMessageCount>25</printsPerMessageCount>
    <filePathToWriteReceivedMessages>{received}</filePathToWriteReceivedMessages>
    <filePathToWriteStatistics>{consumer_stats}</filePathToWriteStatistics>
  </consumer>
  <publisher count="2">
    <transport>uds</transport>
    <socketPath>{socket}</socketPath>
    <destinationName>e2e</destinationName>
    <numberOfMessagesToSend>50</numberOfMessagesToSend>
    <messageSize>256</messageSize>
    <printsPerMessageCount>25</printsPerMessageCount>
    <filePathToWriteStatistics>{publisher_stats}</filePathToWriteStatistics>
  </publisher>
</base>"#,
        socket = socket.display(),
        received = received.display(),
        consumer_stats = consumer_stats.display(),
        publisher_stats = publisher_stats.display(),
    );
    let config = write_config(&dir, "uds.xml", &xml);

    let harness = Harness::new(SocketClientFactory::new(), options());
    let run = harness.run(&config, &Cancellation::never()).await?;

    let summary = run.summary().clone();
    assert_eq!(summary.wait_outcome, Some(WaitOutcome::Completed));
    assert_eq!(summary.consumer_replicas, Some(2));
    assert_eq!(summary.publisher_replicas, Some(2));
    assert_eq!(summary.messages_received, Some(100));
    assert!(summary.consumer_tps.unwrap() > 0.0);
    assert!(summary.average_latency_ms.unwrap() >= 0.0);

    let publisher = run.publisher().unwrap().clone();
    assert_eq!(
        publisher
            .wait_until_done_or_timeout(Duration::from_secs(10))
            .await,
        WaitOutcome::Completed
    );
    assert_eq!(publisher.sent_message_count(), 100);

    run.shutdown();

    let records = read_lines(&received);
    assert_eq!(records.len(), 100);
    let mut seen: Vec<(u64, u64)> = records
        .iter()
        .map(|line| {
            let record: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(record["payload_bytes"], 256);
            (
                record["publisher"].as_u64().unwrap(),
                record["message_id"].as_u64().unwrap(),
            )
        })
        .collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 100);

    let consumer_lines = read_lines(&consumer_stats);
    assert_eq!(
        consumer_lines[0],
        mb_harness::client::consumer::STATISTICS_HEADER
    );
    assert_eq!(consumer_lines.len(), 101);

    let publisher_lines = read_lines(&publisher_stats);
    assert_eq!(
        publisher_lines[0],
        mb_harness::client::publisher::STATISTICS_HEADER
    );
    assert_eq!(publisher_lines.len(), 101);

    // The consumer owned the socket file and removed it on stop.
    assert!(!socket.exists());
    Ok(())
}

#[tokio::test]
async fn tcp_run_with_fan_in_publishers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let xml = r#"<base>
  <consumer>
    <transport>tcp</transport>
    <host>127.0.0.1</host>
    <port>19181</port>
    <maximumMessagesToReceive>60</maximumMessagesToReceive>
  </consumer>
  <publisher count="3">
    <transport>tcp</transport>
    <host>127.0.0.1</host>
    <port>19181</port>
    <numberOfMessagesToSend>20</numberOfMessagesToSend>
    <messageSize>64</messageSize>
  </publisher>
</base>"#;
    let config = write_config(&dir, "tcp.xml", xml);

    let harness = Harness::new(SocketClientFactory::new(), options());
    let run = harness.run(&config, &Cancellation::never()).await?;

    assert_eq!(run.summary().wait_outcome, Some(WaitOutcome::Completed));
    assert_eq!(run.summary().messages_received, Some(60));
    assert!(run.summary().consumer_tps.unwrap() > 0.0);

    run.shutdown();
    Ok(())
}

/// A publisher-only document runs against a destination owned by a
/// consumer outside the harness.
#[tokio::test]
async fn publisher_only_run_against_external_consumer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("external.sock");

    let consumer_config = write_config(
        &dir,
        "consumer.xml",
        &format!(
            r#"<base><consumer>
  <transport>uds</transport>
  <socketPath>{}</socketPath>
  <maximumMessagesToReceive>30</maximumMessagesToReceive>
</consumer></base>"#,
            socket.display()
        ),
    );
    let publisher_config = write_config(
        &dir,
        "publisher.xml",
        &format!(
            r#"<base><publisher>
  <transport>uds</transport>
  <socketPath>{}</socketPath>
  <numberOfMessagesToSend>30</numberOfMessagesToSend>
</publisher></base>"#,
            socket.display()
        ),
    );

    let external = SocketClientFactory::new();
    let consumer = external.construct(
        ClientConfiguration::Consumer(ConsumerConfig::from_path(&consumer_config)?),
        1,
        true,
    )?;
    consumer.start().await?;

    let harness = Harness::new(
        SocketClientFactory::new(),
        HarnessOptions {
            startup_delay: Duration::from_millis(50),
            wait_timeout: Duration::from_secs(10),
        },
    );
    let run = harness.run(&publisher_config, &Cancellation::never()).await?;
    assert_eq!(run.summary().wait_outcome, None);
    assert_eq!(
        run.await_background(&Cancellation::never()).await,
        Some(WaitOutcome::Completed)
    );
    run.shutdown();

    assert_eq!(
        consumer
            .wait_until_done_or_timeout(Duration::from_secs(10))
            .await,
        WaitOutcome::Completed
    );
    assert_eq!(consumer.received_message_count(), 30);
    consumer.stop()?;
    consumer.stop()?;
    Ok(())
}

#[tokio::test]
async fn publisher_without_destination_fails_the_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = write_config(
        &dir,
        "orphan.xml",
        &format!(
            r#"<base><publisher>
  <transport>uds</transport>
  <socketPath>{}</socketPath>
</publisher></base>"#,
            dir.path().join("nobody-listens.sock").display()
        ),
    );

    let harness = Harness::new(
        SocketClientFactory::new(),
        HarnessOptions {
            startup_delay: Duration::from_millis(10),
            wait_timeout: Duration::from_secs(5),
        },
    );
    let err = harness
        .run(&config, &Cancellation::never())
        .await
        .err()
        .unwrap();
    assert!(format!("{:#}", err).contains("failed to connect"));
    Ok(())
}
