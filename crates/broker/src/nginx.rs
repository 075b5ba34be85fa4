use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
    Error, hex_token,
    domains::{DomainRecord, Location},
    exec::{ExecChannel, ExecError, ExecOutput},
};

/// Every generated server block starts with this sentinel comment; it is the
/// single discriminator the inverse operation keys on.
pub const SENTINEL: &str = "# OpenLink Domain:";

pub fn sentinel_line(record: &DomainRecord) -> String {
    format!(
        "{SENTINEL} {} (ID: {}, Location: {})",
        record.full_name,
        record.id,
        record.location.as_str()
    )
}

/// compose the self contained server block for one domain.
///
/// TLS is terminated elsewhere; the block listens on port 80 and proxies to
/// the upstream with duplex-upgrade passthrough, wide open CORS and the
/// health and status probes.
pub fn compose_server_block(record: &DomainRecord, upstream_host: &str) -> String {
    let name = &record.full_name;
    let scheme = if record.ssl { "https" } else { "http" };
    let upstream = format!("{scheme}://{upstream_host}:{}", record.target_port);

    format!(
        r#"{sentinel}
server {{
    listen 80;
    server_name {name};

    add_header X-Frame-Options SAMEORIGIN;
    add_header X-Content-Type-Options nosniff;
    add_header X-XSS-Protection "1; mode=block";
    add_header Referrer-Policy strict-origin-when-cross-origin;

    location / {{
        proxy_pass {upstream};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_read_timeout 300s;
        proxy_send_timeout 300s;
        proxy_connect_timeout 10s;

        add_header Access-Control-Allow-Origin * always;
        add_header Access-Control-Allow-Methods "GET, POST, PUT, DELETE, OPTIONS" always;
        add_header Access-Control-Allow-Headers "Authorization, Content-Type" always;

        if ($request_method = OPTIONS) {{
            return 204;
        }}
    }}

    location /health {{
        add_header Content-Type text/plain;
        return 200 "healthy: {name}\n";
    }}

    location /.openlink/status {{
        add_header Content-Type application/json;
        return 200 '{{"domain":"{name}","id":"{id}","location":"{location}","status":"active"}}';
    }}
}}
"#,
        sentinel = sentinel_line(record),
        id = record.id,
        location = record.location.as_str(),
    )
}

/// remove a domain's sentinel delimited block from the aggregate.
///
/// The block runs from its sentinel line up to, but excluding, the next
/// sentinel or end of file; everything around it is preserved byte for byte.
/// `None` when the sentinel is absent.
pub fn splice_out(aggregate: &str, full_name: &str) -> Option<String> {
    let needle = format!("{SENTINEL} {full_name} (");

    let mut offset = 0;
    let mut start = None;
    let mut end = aggregate.len();

    for line in aggregate.split_inclusive('\n') {
        if start.is_none() {
            if line.starts_with(&needle) {
                start = Some(offset);
            }
        } else if line.starts_with(SENTINEL) {
            end = offset;
            break;
        }

        offset += line.len();
    }

    let start = start?;
    let mut next = String::with_capacity(aggregate.len());
    next.push_str(&aggregate[..start]);
    next.push_str(&aggregate[end..]);
    Some(next)
}

/// Reconciles generated server blocks with the aggregate config file of each
/// location, local or on the remote proxy host, through the exec channel.
pub struct NginxWriter<E> {
    exec: Arc<E>,
    local_conf: String,
    remote_conf: Option<String>,
    /// Upstream host written into remote blocks: the LAN address the remote
    /// proxy tunnels back to.
    remote_upstream_host: String,
    // Serializes external config mutations; registry locks are never held
    // while this is.
    write_lock: Mutex<()>,
}

impl<E> NginxWriter<E>
where
    E: ExecChannel,
{
    pub fn new(
        exec: Arc<E>,
        local_conf: String,
        remote_conf: Option<String>,
        remote_upstream_host: String,
    ) -> Self {
        Self {
            exec,
            local_conf,
            remote_conf,
            remote_upstream_host,
            write_lock: Mutex::new(()),
        }
    }

    fn conf_path(&self, location: Location) -> Result<&str, Error> {
        match location {
            Location::Local => Ok(&self.local_conf),
            Location::Remote => self
                .remote_conf
                .as_deref()
                .ok_or_else(|| Error::Transient("no remote proxy configured".to_string())),
        }
    }

    fn upstream_host<'a>(&'a self, record: &'a DomainRecord) -> &'a str {
        match record.location {
            Location::Local => &record.target_host,
            Location::Remote => &self.remote_upstream_host,
        }
    }

    /// append the domain's server block, then test and hot reload the proxy.
    ///
    /// A failing config test restores the previous aggregate before the
    /// error is surfaced.
    pub async fn add(&self, record: &DomainRecord) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;

        let previous = self.read(record.location).await?;

        // Re-adding the same name replaces its block.
        let mut next = splice_out(&previous, &record.full_name).unwrap_or_else(|| previous.clone());
        if !next.is_empty() && !next.ends_with('\n') {
            next.push('\n');
        }
        next.push_str(&compose_server_block(record, self.upstream_host(record)));

        self.install_checked(record.location, &next, &previous).await
    }

    /// splice the domain's block out, then test and hot reload the proxy.
    ///
    /// Removing a block that is not present is a no-op success.
    pub async fn remove(&self, record: &DomainRecord) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;

        let previous = self.read(record.location).await?;
        let Some(next) = splice_out(&previous, &record.full_name) else {
            return Ok(());
        };

        self.install_checked(record.location, &next, &previous).await
    }

    async fn install_checked(
        &self,
        location: Location,
        next: &str,
        previous: &str,
    ) -> Result<(), Error> {
        self.install(location, next).await?;

        let test = self.run(location, "nginx -t").await?;
        if !test.success() {
            self.install(location, previous).await?;
            let _ = self.run(location, "nginx -s reload").await;
            return Err(Error::Transient(format!(
                "nginx config test failed: {}",
                test.stderr.trim()
            )));
        }

        let reload = self.run(location, "nginx -s reload").await?;
        if !reload.success() {
            return Err(Error::Transient(format!(
                "nginx reload failed: {}",
                reload.stderr.trim()
            )));
        }

        Ok(())
    }

    async fn read(&self, location: Location) -> Result<String, Error> {
        let conf = self.conf_path(location)?;

        match location {
            Location::Local => Ok(tokio::fs::read_to_string(conf).await.unwrap_or_default()),
            Location::Remote => {
                let output = self
                    .exec
                    .exec_remote(&format!("cat {conf} 2>/dev/null || true"))
                    .await
                    .map_err(transient)?;
                Ok(output.stdout)
            }
        }
    }

    /// stage the new aggregate to a temp file and atomically move it into
    /// place.
    async fn install(&self, location: Location, content: &str) -> Result<(), Error> {
        let conf = self.conf_path(location)?;
        let stage = std::env::temp_dir().join(format!("openlink-nginx-{}.conf", hex_token(4)));

        tokio::fs::write(&stage, content)
            .await
            .map_err(|e| Error::Transient(format!("stage write failed: {e}")))?;

        let result = match location {
            Location::Local => {
                self.exec
                    .exec_local(&format!("mv {} {conf}", stage.display()))
                    .await
            }
            Location::Remote => {
                let remote_stage = format!("/tmp/openlink-nginx-{}.conf", hex_token(4));
                let upload = self.exec.upload(&stage, &remote_stage).await;
                let _ = tokio::fs::remove_file(&stage).await;
                match upload {
                    Ok(output) if output.success() => {
                        self.exec
                            .exec_remote(&format!("mv {remote_stage} {conf}"))
                            .await
                    }
                    Ok(output) => {
                        return Err(Error::Transient(format!(
                            "upload failed: {}",
                            output.stderr.trim()
                        )));
                    }
                    Err(e) => return Err(transient(e)),
                }
            }
        };

        let output = result.map_err(transient)?;
        if !output.success() {
            return Err(Error::Transient(format!(
                "config install failed: {}",
                output.stderr.trim()
            )));
        }

        Ok(())
    }

    async fn run(&self, location: Location, command: &str) -> Result<ExecOutput, Error> {
        match location {
            Location::Local => self.exec.exec_local(command).await.map_err(transient),
            Location::Remote => self.exec.exec_remote(command).await.map_err(transient),
        }
    }
}

fn transient(error: ExecError) -> Error {
    Error::Transient(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::{AccessControl, DomainStatus};

    fn record() -> DomainRecord {
        DomainRecord {
            id: "aabbccddeeff0011".to_string(),
            peer_id: "peer-1".to_string(),
            subdomain: "foo".to_string(),
            base_domain: "openlink.local".to_string(),
            full_name: "foo.openlink.local".to_string(),
            target_host: "127.0.0.1".to_string(),
            target_port: 8765,
            ssl: false,
            proxy_port: 8000,
            location: Location::Local,
            status: DomainStatus::Creating,
            created_at: 0,
            expires_at: 0,
            access: AccessControl::Public,
            permits: Vec::new(),
            temp_urls: Vec::new(),
            requests: 0,
            access_url: None,
        }
    }

    #[test]
    fn block_carries_the_sentinel_and_probes() {
        let block = compose_server_block(&record(), "127.0.0.1");

        assert!(block.starts_with(
            "# OpenLink Domain: foo.openlink.local (ID: aabbccddeeff0011, Location: local)"
        ));
        assert!(block.contains("server_name foo.openlink.local;"));
        assert!(block.contains("proxy_pass http://127.0.0.1:8765;"));
        assert!(block.contains("return 200 \"healthy: foo.openlink.local\\n\";"));
        assert!(block.contains(
            "'{\"domain\":\"foo.openlink.local\",\"id\":\"aabbccddeeff0011\",\"location\":\"local\",\"status\":\"active\"}'"
        ));
    }

    #[test]
    fn splice_restores_the_previous_aggregate_byte_for_byte() {
        let base = "# managed by operator\nserver { listen 8080; }\n";
        let block = compose_server_block(&record(), "127.0.0.1");

        let merged = format!("{base}{block}");
        assert_eq!(
            splice_out(&merged, "foo.openlink.local").as_deref(),
            Some(base)
        );
    }

    #[test]
    fn splice_removes_only_the_named_block() {
        let mut other = record();
        other.subdomain = "bar".to_string();
        other.full_name = "bar.openlink.local".to_string();
        other.id = "1100ffeeddccbbaa".to_string();

        let foo = compose_server_block(&record(), "127.0.0.1");
        let bar = compose_server_block(&other, "127.0.0.1");

        let merged = format!("{foo}{bar}");
        let spliced = splice_out(&merged, "foo.openlink.local").unwrap();

        assert_eq!(spliced, bar);
    }

    #[test]
    fn splice_of_an_absent_name_is_none() {
        assert!(splice_out("server {}\n", "foo.openlink.local").is_none());
    }
}
