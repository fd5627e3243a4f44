// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liveness checks against the cluster's status page

use async_trait::async_trait;
use regex::Regex;
use slog::{Logger, debug};
use std::net::Ipv6Addr;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

// Older status pages link to "machines.jsp"; newer ones add "?type=active".
static ACTIVE_WORKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<a href="machines\.jsp(?:\?type=active)?">(\d+)</a>"#)
        .unwrap()
});

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),
    #[error("failed to fetch {url}")]
    Request {
        url: String,
        #[source]
        err: reqwest::Error,
    },
}

/// Extract the number of active worker processes from a status page
///
/// A page that doesn't contain the worker link (or is empty) counts as zero
/// workers.
pub fn parse_worker_count(page: &str) -> u32 {
    ACTIVE_WORKERS
        .captures(page)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Build the URL of the status page served by `host`
pub fn status_url(host: &str, port: u16, path: &str) -> String {
    match host.parse::<Ipv6Addr>() {
        Ok(_) => format!("http://[{}]:{}{}", host, port, path),
        Err(_) => format!("http://{}:{}{}", host, port, path),
    }
}

/// Fetch the status page at `url`, making up to `retries` additional
/// attempts when the request fails.
pub async fn fetch_status_page(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    retries: u32,
) -> Result<String, ProbeError> {
    let mut attempt = 0;
    loop {
        let result: Result<String, reqwest::Error> = async {
            client
                .get(url)
                .timeout(timeout)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await
        }
        .await;
        match result {
            Ok(page) => return Ok(page),
            Err(err) if attempt >= retries => {
                return Err(ProbeError::Request { url: url.to_string(), err });
            }
            Err(_) => attempt += 1,
        }
    }
}

/// Issue one request to the status page at `url` and return the number of
/// active workers it reports
///
/// Connection-level failures are returned to the caller; it's up to the
/// caller (usually a poll loop) to decide they're transient.
pub async fn probe_worker_count(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    retries: u32,
) -> Result<u32, ProbeError> {
    let page = fetch_status_page(client, url, timeout, retries).await?;
    Ok(parse_worker_count(&page))
}

/// Readiness checks the orchestrator needs from a running cluster
///
/// Errors from either method mean "couldn't tell this time"; callers retry.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Succeeds once the status service on `host` answers at all
    async fn check_responds(&self, host: &str) -> Result<(), Self::Error>;

    /// Returns the number of worker processes `host` reports as active
    async fn worker_count(&self, host: &str) -> Result<u32, Self::Error>;
}

/// [`StatusProbe`] that scrapes the coordinator's HTML status page
pub struct HttpStatusProbe {
    client: reqwest::Client,
    port: u16,
    path: String,
    timeout: Duration,
    retries: u32,
    log: Logger,
}

impl HttpStatusProbe {
    pub fn new(
        port: u16,
        path: &str,
        timeout: Duration,
        retries: u32,
        log: &Logger,
    ) -> Result<HttpStatusProbe, ProbeError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(timeout)
            .build()
            .map_err(ProbeError::Client)?;
        Ok(HttpStatusProbe {
            client,
            port,
            path: path.to_string(),
            timeout,
            retries,
            log: log.new(slog::o!("component" => "HttpStatusProbe")),
        })
    }

    fn url(&self, host: &str) -> String {
        status_url(host, self.port, &self.path)
    }
}

#[async_trait]
impl StatusProbe for HttpStatusProbe {
    type Error = ProbeError;

    async fn check_responds(&self, host: &str) -> Result<(), ProbeError> {
        let url = self.url(host);
        fetch_status_page(&self.client, &url, self.timeout, 0).await?;
        debug!(self.log, "status page answered"; "url" => &url);
        Ok(())
    }

    async fn worker_count(&self, host: &str) -> Result<u32, ProbeError> {
        let url = self.url(host);
        let count =
            probe_worker_count(&self.client, &url, self.timeout, self.retries)
                .await?;
        debug!(
            self.log,
            "probed worker count";
            "url" => &url,
            "count" => count,
        );
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_worker_count() {
        assert_eq!(parse_worker_count(r#"<a href="machines.jsp">7</a>"#), 7);
        assert_eq!(
            parse_worker_count(r#"<a href="machines.jsp?type=active">3</a>"#),
            3
        );
        assert_eq!(
            parse_worker_count(
                "<html><body><h1>Starting up</h1>\
                 <a href=\"jobs.jsp\">12</a></body></html>"
            ),
            0
        );
        assert_eq!(parse_worker_count(""), 0);
    }

    #[test]
    fn test_parse_worker_count_in_table() {
        let page = r#"
            <table border="1" cellpadding="5" cellspacing="0">
            <tr><th>Maps</th><th>Reduces</th><th>Nodes</th></tr>
            <tr><td>0</td><td>0</td>
            <td><a href="machines.jsp?type=active">12</a></td></tr>
            </table>
        "#;
        assert_eq!(parse_worker_count(page), 12);
    }

    #[test]
    fn test_parse_worker_count_overflow() {
        assert_eq!(
            parse_worker_count(r#"<a href="machines.jsp">99999999999999</a>"#),
            0
        );
    }

    #[test]
    fn test_status_url() {
        assert_eq!(
            status_url("jt.example.com", 50030, "/jobtracker.jsp"),
            "http://jt.example.com:50030/jobtracker.jsp"
        );
        assert_eq!(
            status_url("::1", 50030, "/jobtracker.jsp"),
            "http://[::1]:50030/jobtracker.jsp"
        );
    }
}
