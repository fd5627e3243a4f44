// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status page probing over HTTP

use cluster_launch::probe::{HttpStatusProbe, ProbeError, StatusProbe};
use cluster_launch::readiness::{Readiness, ReadinessOrchestrator};
use httptest::Expectation;
use httptest::matchers::request;
use httptest::responders::status_code;
use slog::Logger;
use std::time::Duration;

mod common;
use common::{status_page, test_setup_log};

const STATUS_PATH: &str = "/jobtracker.jsp";

fn probe_for(port: u16, log: &Logger) -> HttpStatusProbe {
    HttpStatusProbe::new(port, STATUS_PATH, Duration::from_secs(5), 2, log)
        .unwrap()
}

fn serve(body: String) -> httptest::Server {
    let server = httptest::Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", STATUS_PATH))
            .times(..)
            .respond_with(status_code(200).body(body)),
    );
    server
}

#[tokio::test]
async fn test_worker_count_formats() {
    let logctx = test_setup_log("test_worker_count_formats");
    let cases = [
        (String::from(r#"<a href="machines.jsp">7</a>"#), 7),
        (String::from(r#"<a href="machines.jsp?type=active">3</a>"#), 3),
        (String::from("<html><body>Starting up</body></html>"), 0),
        (status_page(12), 12),
    ];
    for (body, expected) in cases {
        let server = serve(body);
        let probe = probe_for(server.addr().port(), &logctx.log);
        let host = server.addr().ip().to_string();
        probe.check_responds(&host).await.unwrap();
        assert_eq!(probe.worker_count(&host).await.unwrap(), expected);
    }
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_error_status_is_an_error() {
    let logctx = test_setup_log("test_error_status_is_an_error");
    let server = httptest::Server::run();
    // One attempt plus two retries.
    server.expect(
        Expectation::matching(request::method_path("GET", STATUS_PATH))
            .times(3)
            .respond_with(status_code(503)),
    );
    let probe = probe_for(server.addr().port(), &logctx.log);
    let host = server.addr().ip().to_string();
    let err = probe.worker_count(&host).await.unwrap_err();
    assert!(matches!(err, ProbeError::Request { .. }), "{}", err);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_connection_refused() {
    let logctx = test_setup_log("test_connection_refused");
    // Find a port nothing is listening on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let probe = probe_for(port, &logctx.log);
    assert!(probe.check_responds("127.0.0.1").await.is_err());
    assert!(probe.worker_count("127.0.0.1").await.is_err());
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_readiness_over_http() {
    let logctx = test_setup_log("test_readiness_over_http");
    let server = serve(status_page(5));
    let probe = probe_for(server.addr().port(), &logctx.log);
    let orchestrator = ReadinessOrchestrator::new(
        &probe,
        Duration::from_millis(50),
        Duration::from_secs(30),
        &logctx.log,
    );
    let host = server.addr().ip().to_string();

    let readiness = orchestrator.await_cluster_ready(Some(&host), 5).await;
    assert_eq!(readiness, Readiness::Ready { workers: 5 });

    // Fewer workers than that never show up.
    let readiness = ReadinessOrchestrator::new(
        &probe,
        Duration::from_millis(50),
        Duration::from_millis(500),
        &logctx.log,
    )
    .await_cluster_ready(Some(&host), 6)
    .await;
    assert!(!readiness.is_ready());
    logctx.cleanup_successful();
}
