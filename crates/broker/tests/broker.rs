use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use openlink_server_broker::{
    Error, hex_token,
    checker::Source,
    domains::{AccessControl, BrokerOptions, DomainBroker, DomainRequest, DomainStatus, Location},
    exec::{ExecChannel, ExecError, ExecOutput},
    nginx::SENTINEL,
    permits::Permission,
};

/// Scripted exec channel: performs the staged config moves against the real
/// filesystem, answers nslookup from a table and accepts every nginx test
/// and reload.
#[derive(Default)]
struct MockExec {
    commands: Mutex<Vec<String>>,
    dns: Mutex<HashMap<String, bool>>,
}

impl MockExec {
    fn resolve(&self, name: &str, resolves: bool) {
        self.dns.lock().unwrap().insert(name.to_string(), resolves);
    }

    fn saw(&self, needle: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|it| it.contains(needle))
    }
}

fn ok(stdout: &str) -> Result<ExecOutput, ExecError> {
    Ok(ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        status: Some(0),
    })
}

fn fail(stdout: &str) -> Result<ExecOutput, ExecError> {
    Ok(ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        status: Some(1),
    })
}

impl ExecChannel for MockExec {
    async fn exec_local(&self, command: &str) -> Result<ExecOutput, ExecError> {
        self.commands.lock().unwrap().push(command.to_string());

        if let Some(rest) = command.strip_prefix("mv ") {
            let (src, dst) = rest.split_once(' ').unwrap();
            std::fs::rename(src, dst).map_err(|e| ExecError::Spawn(e.to_string()))?;
            return ok("");
        }

        if command.starts_with("nginx -t") || command.starts_with("nginx -s reload") {
            return ok("");
        }

        if let Some(name) = command.strip_prefix("nslookup ") {
            return match self.dns.lock().unwrap().get(name) {
                Some(true) => ok(&format!(
                    "Server: 127.0.0.53\nAddress: 127.0.0.53#53\n\nName: {name}\nAddress: 203.0.113.7\n"
                )),
                _ => fail(&format!("** server can't find {name}: NXDOMAIN\n")),
            };
        }

        if command.starts_with("grep ") {
            return fail("");
        }

        ok("")
    }

    async fn exec_remote(&self, _command: &str) -> Result<ExecOutput, ExecError> {
        Err(ExecError::Spawn("no remote in tests".to_string()))
    }

    async fn upload(&self, _local: &Path, _remote: &str) -> Result<ExecOutput, ExecError> {
        Err(ExecError::Spawn("no remote in tests".to_string()))
    }
}

fn conf_path() -> PathBuf {
    std::env::temp_dir().join(format!("openlink-test-{}.conf", hex_token(6)))
}

fn broker(conf: &Path) -> (Arc<DomainBroker<MockExec>>, Arc<MockExec>) {
    let exec = Arc::new(MockExec::default());
    let broker = DomainBroker::new(
        BrokerOptions {
            base_domains: vec!["openlink.local".to_string(), "raywonderis.me".to_string()],
            port_range: (8000..8010).into(),
            max_domain_life: Duration::from_secs(24 * 3600),
            max_permit_duration: Duration::from_secs(7 * 24 * 3600),
            temp_url_ttl: Duration::from_secs(15 * 60),
            cleanup_interval: Duration::from_secs(15 * 60),
            local_conf: conf.to_string_lossy().into_owned(),
            remote_conf: None,
            remote_upstream_host: "192.168.1.20".to_string(),
        },
        exec.clone(),
    );

    (broker, exec)
}

fn request(subdomain: &str, base: &str, peer: &str) -> DomainRequest {
    DomainRequest {
        subdomain: subdomain.to_string(),
        base_domain: base.to_string(),
        peer_id: peer.to_string(),
        target_host: "127.0.0.1".to_string(),
        target_port: 8765,
        ssl: false,
        permit_token: None,
        temporary: false,
        duration_ms: None,
        access: None,
    }
}

#[tokio::test]
async fn domain_lifecycle_round_trips_the_aggregate() {
    let conf = conf_path();
    std::fs::write(&conf, "# managed by operator\n").unwrap();
    let (broker, exec) = broker(&conf);

    let record = broker
        .request_domain(request("foo", "openlink.local", "peer-1"))
        .await
        .unwrap();

    assert_eq!(record.status, DomainStatus::Active);
    assert_eq!(record.location, Location::Local);
    assert_eq!(record.proxy_port, 8000);
    assert_eq!(record.access_url.as_deref(), Some("http://foo.openlink.local"));
    assert_eq!(broker.allocated_ports(), 1);

    let aggregate = std::fs::read_to_string(&conf).unwrap();
    assert!(aggregate.contains("# OpenLink Domain: foo.openlink.local (ID:"));
    assert!(aggregate.contains("server_name foo.openlink.local;"));
    assert!(exec.saw("nginx -t"));
    assert!(exec.saw("nginx -s reload"));

    broker.release_domain(&record.id).await.unwrap();

    let aggregate = std::fs::read_to_string(&conf).unwrap();
    assert_eq!(aggregate, "# managed by operator\n");
    assert!(!aggregate.contains(SENTINEL));
    assert_eq!(broker.allocated_ports(), 0);

    // The name is free again.
    let again = broker
        .request_domain(request("foo", "openlink.local", "peer-1"))
        .await
        .unwrap();
    assert_eq!(again.proxy_port, 8000);

    std::fs::remove_file(&conf).ok();
}

#[tokio::test]
async fn externally_managed_names_are_rejected_without_side_effects() {
    let conf = conf_path();
    let (broker, exec) = broker(&conf);

    exec.resolve("bar.raywonderis.me", true);
    broker
        .checker()
        .seed("bar.raywonderis.me", true, Source::Dns);

    let error = broker
        .request_domain(request("bar", "raywonderis.me", "peer-1"))
        .await
        .unwrap_err();

    assert!(matches!(error, Error::ExternallyManaged(_)));
    assert_eq!(broker.allocated_ports(), 0);
    assert!(!conf.exists());
    assert!(!exec.saw("mv "));
}

#[tokio::test]
async fn release_of_an_unknown_domain_is_not_found() {
    let conf = conf_path();
    let (broker, _) = broker(&conf);

    assert!(matches!(
        broker.release_domain("0000000000000000").await.unwrap_err(),
        Error::NotFound
    ));
}

#[tokio::test]
async fn released_twice_is_not_found() {
    let conf = conf_path();
    let (broker, _) = broker(&conf);

    let record = broker
        .request_domain(request("foo", "openlink.local", "peer-1"))
        .await
        .unwrap();

    broker.release_domain(&record.id).await.unwrap();
    assert!(matches!(
        broker.release_domain(&record.id).await.unwrap_err(),
        Error::NotFound
    ));

    std::fs::remove_file(&conf).ok();
}

#[tokio::test]
async fn port_range_exhaustion_is_a_conflict() {
    let conf = conf_path();
    let exec = Arc::new(MockExec::default());
    let broker = DomainBroker::new(
        BrokerOptions {
            base_domains: vec!["openlink.local".to_string()],
            port_range: (8000..8002).into(),
            local_conf: conf.to_string_lossy().into_owned(),
            ..Default::default()
        },
        exec,
    );

    for subdomain in ["one", "two"] {
        broker
            .request_domain(request(subdomain, "openlink.local", "peer-1"))
            .await
            .unwrap();
    }

    let error = broker
        .request_domain(request("three", "openlink.local", "peer-1"))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Conflict(_)));

    std::fs::remove_file(&conf).ok();
}

#[tokio::test]
async fn malformed_requests_are_rejected_before_any_state_change() {
    let conf = conf_path();
    let (broker, _) = broker(&conf);

    for bad in [
        request("Foo", "openlink.local", "peer-1"),
        request("foo_bar", "openlink.local", "peer-1"),
        request("foo", "not-allowed.dev", "peer-1"),
        request("", "openlink.local", "peer-1"),
        request("foo", "openlink.local", ""),
    ] {
        assert!(matches!(
            broker.request_domain(bad).await.unwrap_err(),
            Error::MalformedRequest(_)
        ));
    }

    let mut bad_port = request("foo", "openlink.local", "peer-1");
    bad_port.target_port = 0;
    assert!(matches!(
        broker.request_domain(bad_port).await.unwrap_err(),
        Error::MalformedRequest(_)
    ));

    assert_eq!(broker.allocated_ports(), 0);
    assert!(broker.list_domains().is_empty());
}

#[tokio::test]
async fn owner_extends_while_a_foreign_peer_needs_a_permit() {
    let conf = conf_path();
    let (broker, _) = broker(&conf);

    let record = broker
        .request_domain(request("foo", "openlink.local", "peer-1"))
        .await
        .unwrap();

    // Owner coming back extends instead of reprovisioning.
    let again = broker
        .request_domain(request("foo", "openlink.local", "peer-1"))
        .await
        .unwrap();
    assert_eq!(again.id, record.id);
    assert_eq!(broker.allocated_ports(), 1);

    // A foreign peer without a permit is denied.
    let denied = broker
        .request_domain(request("foo", "openlink.local", "peer-2"))
        .await
        .unwrap_err();
    assert!(matches!(denied, Error::AccessDenied(_)));

    // With a matching permit it is let through.
    let permit = broker.create_permit(
        "foo.openlink.local",
        Some(Duration::from_secs(60)),
        vec![Permission::Connect],
        None,
        "peer-1",
    );

    let mut authorized = request("foo", "openlink.local", "peer-2");
    authorized.permit_token = Some(permit.token.clone());
    let shared = broker.request_domain(authorized).await.unwrap();
    assert_eq!(shared.id, record.id);

    let used = broker.get_permit(&permit.token).unwrap();
    assert_eq!(used.usage_count, 1);
    assert!(used.last_used.is_some());

    std::fs::remove_file(&conf).ok();
}

#[tokio::test]
async fn permit_only_domains_mint_a_default_permit() {
    let conf = conf_path();
    let (broker, _) = broker(&conf);

    let mut gated = request("gated", "openlink.local", "peer-1");
    gated.access = Some(AccessControl::PermitOnly);

    let record = broker.request_domain(gated).await.unwrap();
    assert_eq!(record.permits.len(), 1);
    assert!(broker.validate_permit(&record.permits[0], Some("gated.openlink.local")));

    std::fs::remove_file(&conf).ok();
}

#[tokio::test]
async fn temp_urls_count_uses_and_log_accesses() {
    let conf = conf_path();
    let (broker, _) = broker(&conf);

    let record = broker
        .request_domain(request("foo", "openlink.local", "peer-1"))
        .await
        .unwrap();

    let url = broker
        .create_temp_url(&record.id, None, 2, vec![Permission::Read])
        .unwrap();
    assert!(url.access_url.contains(&url.token));

    assert!(broker.validate_temp_url(&url.id, &url.token, Some("client-1")));
    assert!(broker.validate_temp_url(&url.id, &url.token, None));
    assert!(!broker.validate_temp_url(&url.id, &url.token, None));

    assert!(!broker.validate_temp_url(&url.id, "wrong-token", None));

    std::fs::remove_file(&conf).ok();
}

#[tokio::test]
async fn gc_drops_expired_permits_and_urls() {
    let conf = conf_path();
    let (broker, _) = broker(&conf);

    let permit = broker.create_permit(
        "*",
        Some(Duration::from_millis(0)),
        vec![Permission::Read],
        None,
        "test",
    );

    broker.gc().await;
    assert!(broker.get_permit(&permit.token).is_none());
}
