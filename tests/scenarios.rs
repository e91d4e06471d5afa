//! End-to-end scenario tests (S1-S6).
//!
//! Each scenario stands up a local `axum` server bound to an ephemeral
//! loopback port and runs a plan against it, so the crawler is exercised
//! over a real (if local) transport rather than a record/replay mock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path as AxumPath, RawQuery};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Map};
use tokio::net::TcpListener;
use tokio::sync::watch;

use api_crawler::ApiCrawler;

async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn raw_query_params(raw: &Option<String>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(raw) = raw else { return out };
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            percent_encoding::percent_decode_str(s)
                .decode_utf8_lossy()
                .into_owned()
        };
        out.insert(decode(k), decode(v));
    }
    out
}

// S1: integer offset pagination, sequential.
#[tokio::test]
async fn s1_integer_offset_pagination_is_sequential() {
    let offsets: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let app = Router::new().route(
        "/page",
        get({
            let offsets = offsets.clone();
            move |RawQuery(q): RawQuery| {
                let offsets = offsets.clone();
                async move {
                    let params = raw_query_params(&q);
                    offsets.lock().unwrap().push(params.get("offset").cloned().unwrap_or_default());
                    Json(json!({"items": []}))
                }
            }
        }),
    );
    let base = spawn_server(app).await;

    let yaml = format!(
        r#"
rootContext: {{}}
steps:
  - type: request
    request:
      url: "{base}/page"
      pagination:
        params:
          - name: offset
            location: query
            type: int
            default: "0"
            increment: "50"
        stopOn:
          - type: pageNum
            value: 3
"#
    );

    let (crawler, errors, setup_err) = ApiCrawler::new(yaml.as_str());
    assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    assert!(setup_err.is_none(), "unexpected setup error: {setup_err:?}");
    let mut crawler = crawler.unwrap();
    crawler.run(no_cancel(), Map::new()).await.unwrap();

    let seen = offsets.lock().unwrap().clone();
    assert_eq!(seen, vec!["0".to_string(), "50".to_string(), "100".to_string()]);
}

// S2: forEach results keep caller order under a bounded, rate-limited
// worker pool, regardless of completion order.
#[tokio::test]
async fn s2_for_each_preserves_order_under_parallelism() {
    let app = Router::new().route(
        "/items/:id",
        get(|AxumPath(id): AxumPath<u64>| async move {
            // Higher ids resolve faster so completion order is scrambled.
            let delay_ms = 50u64.saturating_sub(id * 10);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Json(json!({"id": id, "server": true}))
        }),
    );
    let base = spawn_server(app).await;

    let yaml = format!(
        r#"
rootContext:
  items: [1, 2, 3, 4, 5]
steps:
  - type: forEach
    path: ".items"
    as: item
    parallelism:
      maxConcurrency: 5
      requestsPerSecond: 10
      burst: 2
    mergeOn: ".results = $res"
    steps:
      - type: request
        request:
          url: "{base}/items/{{{{ .item }}}}"
"#
    );

    let (crawler, errors, setup_err) = ApiCrawler::new(yaml.as_str());
    assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    assert!(setup_err.is_none(), "unexpected setup error: {setup_err:?}");
    let mut crawler = crawler.unwrap();
    crawler.run(no_cancel(), Map::new()).await.unwrap();

    let data = crawler.get_data();
    let results = data["results"].as_array().unwrap();
    let ids: Vec<u64> = results.iter().map(|r| r["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

// S3: a nested merge targeting an ancestor context accumulates across
// siblings without disturbing the descendant's own value.
#[tokio::test]
async fn s3_nested_merge_to_ancestor_context() {
    let app = Router::new().route(
        "/stations/:id",
        get(|AxumPath(id): AxumPath<u64>| async move {
            Json(json!({"places": [format!("place-{id}")]}))
        }),
    );
    let base = spawn_server(app).await;

    let yaml = format!(
        r#"
rootContext:
  locations:
    - id: loc1
      stations: [1, 2]
    - id: loc2
      stations: [3]
steps:
  - type: forEach
    path: ".locations"
    as: location
    mergeOn: ".locations = $res"
    steps:
      - type: forEach
        path: ".location.stations"
        as: station
        noopMerge: true
        steps:
          - type: request
            mergeWithContext:
              name: location
              rule: ".allPlaces += $res.places"
            request:
              url: "{base}/stations/{{{{ .station }}}}"
"#
    );

    let (crawler, errors, setup_err) = ApiCrawler::new(yaml.as_str());
    assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    assert!(setup_err.is_none(), "unexpected setup error: {setup_err:?}");
    let mut crawler = crawler.unwrap();
    crawler.run(no_cancel(), Map::new()).await.unwrap();

    let data = crawler.get_data();
    let locations = data.as_array().unwrap();

    let loc1 = locations.iter().find(|l| l["id"] == json!("loc1")).unwrap();
    let mut places: Vec<String> = loc1["allPlaces"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    places.sort();
    assert_eq!(places, vec!["place-1".to_string(), "place-2".to_string()]);
    assert_eq!(loc1["stations"], json!([1, 2]));

    let loc2 = locations.iter().find(|l| l["id"] == json!("loc2")).unwrap();
    assert_eq!(loc2["allPlaces"], json!(["place-3"]));
}

// S4: cookie auth refreshes once its cached credential has aged past
// `maxAgeSeconds`, and both requests carry the cookie it issued.
#[tokio::test]
async fn s4_cookie_auth_refreshes_after_expiry() {
    use api_crawler::auth::Authenticator;
    use api_crawler::plan::{AuthConfig, RequestSpec};

    let login_calls: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));

    let app = Router::new().route(
        "/login",
        get({
            let login_calls = login_calls.clone();
            move || {
                let login_calls = login_calls.clone();
                async move {
                    *login_calls.lock().unwrap() += 1;
                    (
                        [(axum::http::header::SET_COOKIE, "sid=X; Path=/")],
                        Json(json!({"ok": true})),
                    )
                }
            }
        }),
    );
    let base = spawn_server(app).await;

    let config = AuthConfig::Cookie {
        login_request: RequestSpec {
            url: format!("{base}/login"),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            pagination: None,
            auth: None,
        },
        cookie_name: "sid".to_string(),
        max_age_seconds: 1,
    };

    let auth = Authenticator::new(reqwest::Client::new(), config);

    let first = auth.apply(reqwest::Client::new().get(base.as_str())).await.unwrap();
    assert!(format!("{first:?}").contains("sid=X"));
    assert_eq!(*login_calls.lock().unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let second = auth.apply(reqwest::Client::new().get(base.as_str())).await.unwrap();
    assert!(format!("{second:?}").contains("sid=X"));
    assert_eq!(*login_calls.lock().unwrap(), 2);
}

// S5: streaming mode drains the root context's array into the stream
// channel and leaves `GetData()` holding the empty sequence behind.
#[tokio::test]
async fn s5_streaming_mode_drains_root_into_channel() {
    let app = Router::new().route(
        "/items",
        get(|| async { Json(json!({"items": [{"id": 1}, {"id": 2}]})) }),
    );
    let base = spawn_server(app).await;

    let yaml = format!(
        r#"
rootContext: []
stream: true
steps:
  - type: request
    resultTransformer: ".items"
    request:
      url: "{base}/items"
"#
    );

    let (crawler, errors, setup_err) = ApiCrawler::new(yaml.as_str());
    assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    assert!(setup_err.is_none(), "unexpected setup error: {setup_err:?}");
    let mut crawler = crawler.unwrap();

    let mut stream = crawler.get_data_stream().expect("plan declares stream: true");
    crawler.run(no_cancel(), Map::new()).await.unwrap();

    let first = stream.recv().await.unwrap();
    let second = stream.recv().await.unwrap();
    assert_eq!(first, json!({"id": 1}));
    assert_eq!(second, json!({"id": 2}));

    assert_eq!(crawler.get_data(), json!([]));
}

// S6: a server-issued nextPageUrl with an unescaped `#`/`+` survives as an
// opaque token rather than being parsed as a URL fragment.
#[tokio::test]
async fn s6_next_page_url_survives_reserved_characters() {
    let calls: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base = format!("http://{addr}");
    let next_url = format!("{base}/s6?token=abc#def+xyz");

    let app = Router::new().route(
        "/s6",
        get({
            let calls = calls.clone();
            move |RawQuery(q): RawQuery| {
                let calls = calls.clone();
                let next_url = next_url.clone();
                async move {
                    let params = raw_query_params(&q);
                    let token = params.get("token").cloned();
                    let is_first = calls.lock().unwrap().is_empty();
                    calls.lock().unwrap().push(token);
                    if is_first {
                        Json(json!({"next": next_url, "items": []}))
                    } else {
                        Json(json!({"items": []}))
                    }
                }
            }
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let yaml = format!(
        r#"
rootContext: {{}}
steps:
  - type: request
    request:
      url: "{base}/s6"
      pagination:
        nextPageUrlSelector: ".next"
"#
    );

    let (crawler, errors, setup_err) = ApiCrawler::new(yaml.as_str());
    assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    assert!(setup_err.is_none(), "unexpected setup error: {setup_err:?}");

    let mut crawler = crawler.unwrap();
    crawler.run(no_cancel(), Map::new()).await.unwrap();

    let seen = calls.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].as_deref(), Some("abc#def+xyz"));
}
