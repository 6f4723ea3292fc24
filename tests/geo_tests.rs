use std::net::SocketAddr;

use axum::{http::StatusCode, routing::get, Router};
use intruder_watch::error::GeoError;
use intruder_watch::geo::{GeoResolver, IpInfoResolver};
use intruder_watch::types::UNKNOWN;

fn resolver(endpoint: String) -> IpInfoResolver {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    IpInfoResolver::with_client(client, endpoint)
}

/// Local stand-in for the IP-info service.
async fn fake_ipinfo() -> SocketAddr {
    let app = Router::new()
        .route(
            "/ok",
            get(|| async {
                (
                    [("content-type", "application/json")],
                    r#"{"ip":"1.2.3.4","hostname":"h","loc":"10,20","city":"X","region":"R",
                        "country":"Y","org":"AS1 Example","postal":"0001","timezone":"UTC"}"#,
                )
            }),
        )
        .route("/down", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .route("/garbage", get(|| async { "<html>not json</html>" }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn resolves_location_fields() {
    let addr = fake_ipinfo().await;
    let info = resolver(format!("http://{addr}/ok")).resolve().await;
    assert_eq!(info.ip, "1.2.3.4");
    assert_eq!(info.loc, "10,20");
    assert_eq!(info.city, "X");
    assert_eq!(info.region, "R");
    assert_eq!(info.country, "Y");
    assert_eq!(info.org, "AS1 Example");
    assert_eq!(info.postal, "0001");
}

#[tokio::test]
async fn error_status_yields_sentinel() {
    let addr = fake_ipinfo().await;
    let resolver = resolver(format!("http://{addr}/down"));
    assert!(matches!(resolver.fetch().await, Err(GeoError::Status(503))));
    let info = resolver.resolve().await;
    assert_eq!((info.ip.as_str(), info.loc.as_str()), (UNKNOWN, UNKNOWN));
}

#[tokio::test]
async fn unparsable_body_yields_sentinel() {
    let addr = fake_ipinfo().await;
    let resolver = resolver(format!("http://{addr}/garbage"));
    assert!(matches!(resolver.fetch().await, Err(GeoError::Parse(_))));
    assert!(resolver.resolve().await.is_unknown());
}

#[tokio::test]
async fn unreachable_service_yields_sentinel() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let resolver = resolver(format!("http://{addr}/json"));
    assert!(matches!(resolver.fetch().await, Err(GeoError::Http(_))));
    assert!(resolver.resolve().await.is_unknown());
}
