//! Startup policy, settings reload and end-to-end runs

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use oemgateway::*;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

fn memory(name: &str) -> InstanceConfig {
    InstanceConfig::new(name, "memory")
}

fn duplicate_document(policy: InstancePolicy) -> GatewayDocument {
    let mut document = GatewayDocument::default()
        .with_buffer(memory("first"))
        .with_buffer(memory("twin"))
        .with_buffer(memory("twin").with_runtime(Settings::new().with("active", true)))
        .with_buffer(InstanceConfig::new("mystery", "carrier-pigeon"))
        .with_buffer(memory("last"));
    document.gateway.on_invalid_instance = policy;
    document
}

#[test]
fn duplicate_names_are_skipped() {
    let registry = PluginRegistry::with_builtins();
    let gateway = Gateway::from_config(&registry, &duplicate_document(InstancePolicy::Skip)).unwrap();

    let names: Vec<_> = gateway.buffers().iter().map(|b| b.name().to_string()).collect();
    assert_eq!(names, vec!["first", "twin", "last"]);
    assert!(!gateway.buffer("twin").unwrap().is_active());

    assert_eq!(gateway.skipped().len(), 2);
    assert!(matches!(
        gateway.skipped()[0],
        GatewayError::Config(ConfigError::DuplicateName(_))
    ));
    assert!(matches!(
        gateway.skipped()[1],
        GatewayError::Config(ConfigError::UnknownType { .. })
    ));
}

#[test]
fn duplicate_names_abort_under_strict_policy() {
    let registry = PluginRegistry::with_builtins();
    let result = Gateway::from_config(&registry, &duplicate_document(InstancePolicy::Abort));
    assert!(matches!(
        result,
        Err(GatewayError::Config(ConfigError::DuplicateName(name))) if name == "twin"
    ));
}

#[test]
fn listener_and_buffer_cannot_share_a_name() {
    let registry = PluginRegistry::with_builtins();
    let mut document = GatewayDocument::default()
        .with_listener(InstanceConfig::new("node", "socket").with_init(Settings::new().with("port", 0)))
        .with_buffer(memory("node"));
    document.gateway.on_invalid_instance = InstancePolicy::Skip;

    let gateway = Gateway::from_config(&registry, &document).unwrap();
    assert_eq!(gateway.listener_names(), vec!["node"]);
    assert!(gateway.buffers().is_empty());
    assert_eq!(gateway.skipped().len(), 1);
}

#[tokio::test]
async fn unparseable_reload_keeps_current_settings() {
    let mut file = NamedTempFile::new().unwrap();
    let document = GatewayDocument::default()
        .with_buffer(memory("mem").with_runtime(Settings::new().with("active", true)));
    file.write_all(document.to_json().unwrap().as_bytes()).unwrap();

    let source = FileConfigSource::new(file.path());
    let mut gateway = Gateway::from_config(&PluginRegistry::with_builtins(), &source.load().await.unwrap()).unwrap();
    gateway.set_config_source(Arc::new(source.clone()));

    std::fs::write(file.path(), "{ \"buffers\": [ oops").unwrap();
    assert!(matches!(gateway.reload().await, Err(GatewayError::Config(ConfigError::Parse(_)))));
    assert!(gateway.buffer("mem").unwrap().is_active());
    assert_eq!(gateway.settings().revision("mem"), Some(0));
}

#[tokio::test]
async fn reload_loop_applies_runtime_settings_and_log_level() {
    let mut document = GatewayDocument::default().with_buffer(memory("mem"));
    document.gateway.reload_interval = 1;

    let source = Arc::new(StaticConfigSource::new(document.clone()));
    let mut gateway = Gateway::from_config(&PluginRegistry::with_builtins(), &document).unwrap();
    gateway.set_config_source(source.clone());

    let levels = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&levels);
    gateway.set_log_level_hook(Box::new(move |level| sink.lock().unwrap().push(level)));

    let gateway = Arc::new(gateway);
    let shutdown = CancellationToken::new();
    let runner = {
        let gateway = Arc::clone(&gateway);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { gateway.run(shutdown).await })
    };

    let mut updated = document.clone();
    updated.gateway.loglevel = LogLevel::Debug;
    updated.buffers[0].runtime_settings = Some(Settings::new().with("active", true));
    source.set(updated);

    let adapter = gateway.buffer("mem").unwrap();
    assert!(wait_until(Duration::from_secs(5), || adapter.is_active()).await);
    assert!(wait_until(Duration::from_secs(1), || gateway.log_level() == LogLevel::Debug).await);
    assert_eq!(*levels.lock().unwrap(), vec![LogLevel::Debug]);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn listener_sees_new_settings_before_next_reading() {
    let mut gateway = Gateway::new();
    let (listener, feed, applied) = FeedListener::new();
    gateway
        .add_listener(
            &InstanceConfig::new("feed", "feed").with_runtime(Settings::new().with("sensor1", "28.A")),
            Box::new(listener),
        )
        .unwrap();
    let mem = gateway
        .add_buffer(&memory("mem"), BufferAdapter::new("mem", &Settings::new(), Box::new(MemoryDestination::new())).unwrap())
        .unwrap();

    let gateway = Arc::new(gateway);
    let shutdown = CancellationToken::new();
    let runner = {
        let gateway = Arc::clone(&gateway);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { gateway.run(shutdown).await })
    };

    feed.send(reading(1, 1.0)).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || mem.queue_len() == 1).await);

    let document = GatewayDocument::default()
        .with_listener(InstanceConfig::new("feed", "feed").with_runtime(Settings::new().with("sensor1", "28.B")))
        .with_buffer(memory("mem"));
    assert_eq!(gateway.refresh(&document).published, vec!["feed".to_string()]);
    feed.send(reading(2, 2.0)).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || mem.queue_len() == 2).await);

    {
        let applied = applied.lock().unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1].get_str("sensor1").unwrap().as_deref(), Some("28.B"));
    }
    assert_eq!(gateway.settings().revision("feed"), Some(1));

    // Closing the feed is an unrecoverable source error
    drop(feed);
    assert!(
        wait_until(Duration::from_secs(2), || {
            gateway.status().listeners[0].state == ListenerState::Stopped
        })
        .await
    );
    assert_eq!(gateway.status().health, HealthStatus::Unhealthy);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mem.queue_len(), 2);
}

#[tokio::test]
async fn socket_frames_reach_every_buffer() {
    let port = {
        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        free.local_addr().unwrap().port()
    };

    let document = GatewayDocument::from_json(&format!(
        r#"{{
            "listeners": [
                {{ "name": "sock", "type": "socket",
                   "init_settings": {{ "port": {} }}, "runtime_settings": {{}} }}
            ],
            "buffers": [
                {{ "name": "a", "type": "memory", "init_settings": {{}}, "runtime_settings": {{}} }},
                {{ "name": "b", "type": "memory", "init_settings": {{}}, "runtime_settings": {{}} }}
            ]
        }}"#,
        port
    ))
    .unwrap();
    let gateway = Arc::new(Gateway::from_config(&PluginRegistry::with_builtins(), &document).unwrap());
    assert!(gateway.skipped().is_empty());

    let shutdown = CancellationToken::new();
    let runner = {
        let gateway = Arc::clone(&gateway);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { gateway.run(shutdown).await })
    };

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"10 21.5 230\r\nnonsense\r\n11 19.0\r\n").await.unwrap();
    stream.shutdown().await.unwrap();

    let a = gateway.buffer("a").unwrap();
    let b = gateway.buffer("b").unwrap();
    assert!(wait_until(Duration::from_secs(5), || a.queue_len() == 2 && b.queue_len() == 2).await);

    let queued: Vec<_> = a.queued().iter().map(|r| r.node()).collect();
    assert_eq!(queued, vec![10, 11]);
    let status = gateway.status();
    assert_eq!(status.listeners[0].readings, 2);
    assert_eq!(status.listeners[0].acquisition_errors, 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn running_listener_rejection_leaves_store_untouched() {
    let mut gateway = Gateway::new();
    let (listener, feed, applied) = FeedListener::new();
    let accepted = Settings::new().with("sensor1", "28.A");
    gateway
        .add_listener(&InstanceConfig::new("feed", "feed").with_runtime(accepted.clone()), Box::new(listener))
        .unwrap();

    let gateway = Arc::new(gateway);
    let shutdown = CancellationToken::new();
    let runner = {
        let gateway = Arc::clone(&gateway);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { gateway.run(shutdown).await })
    };
    assert!(
        wait_until(Duration::from_secs(2), || {
            gateway.status().listeners[0].state == ListenerState::Running
        })
        .await
    );

    let refused = GatewayDocument::default().with_listener(
        InstanceConfig::new("feed", "feed").with_runtime(Settings::new().with("invalid", true)),
    );
    let report = gateway.refresh(&refused);
    assert_eq!(report.published, vec!["feed".to_string()]);
    assert!(report.changed.is_empty());

    assert!(
        wait_until(Duration::from_secs(2), || {
            gateway.refresh(&refused).rejected == vec!["feed".to_string()]
        })
        .await
    );
    assert_eq!(gateway.settings().revision("feed"), Some(0));
    assert_eq!(*gateway.settings().runtime("feed").unwrap(), accepted);
    assert_eq!(applied.lock().unwrap().len(), 1);

    // Reverting to the accepted settings needs no new snapshot
    let reverted = GatewayDocument::default()
        .with_listener(InstanceConfig::new("feed", "feed").with_runtime(accepted));
    assert_eq!(gateway.refresh(&reverted), RefreshReport::default());

    drop(feed);
    shutdown.cancel();
    runner.await.unwrap();
}
