use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use prost::Message;
use steam_cm::{KeyExchange, SessionKey};
use steam_content::manifest::{METADATA_MAGIC, PAYLOAD_MAGIC};
use steam_content::proto::{ChunkData, ContentManifestMetadata, ContentManifestPayload, FileMapping};
use steam_content::{
    download_depot, ChunkId, ChunkPlan, ContentError, ContentPool, DepotJob, DepotKey,
    DirectorySink, HttpClient, HttpRequest, HttpResponse, Method,
};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const WAIT: Duration = Duration::from_secs(10);
const TICKET: &[u8] = b"app-ticket";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    url: String,
    auth: Option<String>,
}

type Responder = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// Content server stand-in that records every request.
struct MockCdn {
    requests: Mutex<Vec<Recorded>>,
    init_gate: Option<Semaphore>,
    stall: Option<(&'static str, Duration)>,
    respond: Responder,
}

impl MockCdn {
    fn new(respond: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            init_gate: None,
            stall: None,
            respond: Box::new(respond),
        }
    }

    /// Holds every `/initsession/` until `open_init` is called.
    fn gated(mut self) -> Self {
        self.init_gate = Some(Semaphore::new(0));
        self
    }

    /// Delays the response to every URL containing `needle`.
    fn stalling(mut self, needle: &'static str, delay: Duration) -> Self {
        self.stall = Some((needle, delay));
        self
    }

    fn open_init(&self, count: usize) {
        if let Some(gate) = &self.init_gate {
            gate.add_permits(count);
        }
    }

    fn recorded(&self) -> Vec<Recorded> {
        self.requests.lock().expect("lock").clone()
    }

    fn count(&self, needle: &str) -> usize {
        self.recorded().iter().filter(|r| r.url.contains(needle)).count()
    }
}

#[async_trait]
impl HttpClient for MockCdn {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, ContentError> {
        if request.url.ends_with("/initsession/") {
            if let Some(gate) = &self.init_gate {
                gate.acquire().await.expect("gate").forget();
            }
        }
        self.requests.lock().expect("lock").push(Recorded {
            method: request.method,
            url: request.url.clone(),
            auth: request.header_value("x-steam-auth").map(str::to_string),
        });
        if let Some((needle, delay)) = self.stall {
            if request.url.contains(needle) {
                sleep(delay).await;
            }
        }
        Ok((self.respond)(&request))
    }
}

fn ok(body: impl Into<Vec<u8>>) -> HttpResponse {
    HttpResponse { status: 200, body: body.into() }
}

fn init_response() -> HttpResponse {
    ok("\"response\"\n{\n\t\"sessionid\"\t\"2756818007967047057\"\n\t\"req-counter\"\t\"5\"\n}\n")
}

/// Answers the session endpoints and echoes the URL for everything else.
fn echo(request: &HttpRequest) -> HttpResponse {
    if request.url.ends_with("/initsession/") {
        init_response()
    } else if request.url.ends_with("/authdepot/") {
        ok(Vec::new())
    } else {
        ok(request.url.clone())
    }
}

fn pool(servers: &[&str], http: Arc<MockCdn>) -> ContentPool<MockCdn> {
    let exchange = KeyExchange::backend().expect("backend key");
    let servers = servers.iter().map(|s| s.to_string()).collect();
    ContentPool::with_key_exchange(servers, TICKET.to_vec(), http, exchange)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached");
}

fn zipped(data: &[u8]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file("z", options).expect("start entry");
    writer.write_all(data).expect("write entry");
    writer.finish().expect("finish archive").into_inner()
}

fn section(magic: u32, body: &[u8]) -> Vec<u8> {
    let mut out = magic.to_le_bytes().to_vec();
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn depot_key() -> DepotKey {
    SessionKey::new([0x33; 32])
}

fn chunk_data(id: u8, offset: u64, size: u32) -> ChunkData {
    ChunkData {
        sha: Some(vec![id; 20]),
        crc: Some(0),
        offset: Some(offset),
        cb_original: Some(size),
        cb_compressed: Some(size),
    }
}

fn mapping(name: &str, key: &DepotKey, size: u64, chunks: Vec<ChunkData>) -> FileMapping {
    let mut plain = name.as_bytes().to_vec();
    plain.push(0);
    FileMapping {
        filename: Some(base64::engine::general_purpose::STANDARD.encode(key.encrypt(&plain))),
        size: Some(size),
        flags: Some(0),
        chunks,
        ..Default::default()
    }
}

/// Zipped manifest body with two files sharing chunk 0x02.
fn manifest_body(key: &DepotKey) -> Vec<u8> {
    let payload = ContentManifestPayload {
        mappings: vec![
            mapping("first.bin", key, 8, vec![chunk_data(1, 0, 4), chunk_data(2, 4, 4)]),
            mapping("sub\\second.bin", key, 4, vec![chunk_data(2, 0, 4)]),
        ],
    };
    let metadata = ContentManifestMetadata {
        depot_id: Some(7),
        gid_manifest: Some(123),
        filenames_encrypted: Some(true),
        ..Default::default()
    };
    let mut body = section(PAYLOAD_MAGIC, &payload.encode_to_vec());
    body.extend(section(METADATA_MAGIC, &metadata.encode_to_vec()));
    zipped(&body)
}

fn chunk_body(key: &DepotKey, data: &[u8]) -> Vec<u8> {
    key.encrypt(&zipped(data))
}

fn depot_server(request: &HttpRequest) -> HttpResponse {
    let key = depot_key();
    let url = request.url.as_str();
    if url.ends_with("/manifest/123/5") {
        ok(manifest_body(&key))
    } else if url.ends_with(&format!("/chunk/{}", ChunkId(vec![1; 20]).to_hex())) {
        ok(chunk_body(&key, b"AAAA"))
    } else if url.ends_with(&format!("/chunk/{}", ChunkId(vec![2; 20]).to_hex())) {
        ok(chunk_body(&key, b"BBBB"))
    } else {
        echo(request)
    }
}

#[tokio::test]
async fn authdepot_is_cached_until_the_depot_changes() {
    init_logging();
    let http = Arc::new(MockCdn::new(echo));
    let pool = pool(&["cs1", "cs2"], Arc::clone(&http));
    wait_until(|| pool.ready_count() == 2).await;

    for path in ["/manifest/1/5", "/manifest/2/5", "/manifest/3/5"] {
        let body = pool.request(7, TICKET, path).await.expect("request");
        assert!(String::from_utf8(body).expect("utf8").ends_with(&format!("/depot/7{path}")));
    }
    assert_eq!(http.count("/authdepot/"), 1);

    pool.request(8, TICKET, "/manifest/4/5").await.expect("other depot");
    pool.request(7, TICKET, "/manifest/5/5").await.expect("back to first depot");
    assert_eq!(http.count("/authdepot/"), 2);
    assert_eq!(http.count("/depot/"), 5);
    assert_eq!(pool.ready_count(), 2);
    assert_eq!(pool.live_count(), 2);
}

#[tokio::test]
async fn queued_requests_authorize_each_connection_once() {
    init_logging();
    let http =
        Arc::new(MockCdn::new(echo).gated().stalling("/depot/7/", Duration::from_millis(100)));
    let pool = pool(&["cs1", "cs2"], Arc::clone(&http));

    let mut requests = Vec::new();
    for path in ["/manifest/1/5", "/manifest/2/5", "/manifest/3/5"] {
        requests.push(tokio::spawn({
            let pool = pool.clone();
            async move { pool.request(7, TICKET, path).await }
        }));
    }
    wait_until(|| pool.queued_count() == 3).await;

    http.open_init(2);
    for request in requests {
        timeout(WAIT, request).await.expect("in time").expect("join").expect("request");
    }

    let recorded = http.recorded();
    assert_eq!(http.count("/authdepot/"), 2);
    for host in ["http://cs1/", "http://cs2/"] {
        let on_host: Vec<_> = recorded.iter().filter(|r| r.url.starts_with(host)).collect();
        let first_get = on_host
            .iter()
            .position(|r| r.url.contains("/depot/7/"))
            .expect("host served a request");
        let auths = on_host.iter().filter(|r| r.url.ends_with("/authdepot/")).count();
        let auths_before = on_host[..first_get]
            .iter()
            .filter(|r| r.url.ends_with("/authdepot/"))
            .count();
        assert_eq!((auths, auths_before), (1, 1), "{host}");
    }
}

#[tokio::test]
async fn request_counter_continues_from_server_value() {
    init_logging();
    let http = Arc::new(MockCdn::new(echo));
    let pool = pool(&["cs1"], Arc::clone(&http));
    wait_until(|| pool.ready_count() == 1).await;

    pool.request(7, TICKET, "/manifest/1/5").await.expect("request");

    let signed: Vec<_> = http.recorded().into_iter().filter(|r| r.auth.is_some()).collect();
    assert_eq!(signed.len(), 2);
    assert_eq!(signed[0].method, Method::Post);
    assert!(signed[0].url.ends_with("/authdepot/"));
    assert!(signed[0].auth.as_deref().expect("auth").contains("req-counter=6;"));
    assert_eq!(signed[1].method, Method::Get);
    assert_eq!(signed[1].url, "http://cs1/depot/7/manifest/1/5");
    let auth = signed[1].auth.as_deref().expect("auth");
    assert!(auth.starts_with("sessionid=2756818007967047057;req-counter=7;hash="));
}

#[tokio::test]
async fn queued_requests_are_served_in_arrival_order() {
    init_logging();
    let http = Arc::new(MockCdn::new(echo).gated());
    let pool = pool(&["cs1"], Arc::clone(&http));

    let first = tokio::spawn({
        let pool = pool.clone();
        async move { pool.request(7, TICKET, "/first").await }
    });
    wait_until(|| pool.queued_count() == 1).await;
    let second = tokio::spawn({
        let pool = pool.clone();
        async move { pool.request(7, TICKET, "/second").await }
    });
    wait_until(|| pool.queued_count() == 2).await;

    http.open_init(1);
    timeout(WAIT, first).await.expect("first in time").expect("join").expect("first");
    timeout(WAIT, second).await.expect("second in time").expect("join").expect("second");

    let gets: Vec<_> =
        http.recorded().into_iter().filter(|r| r.method == Method::Get).map(|r| r.url).collect();
    assert_eq!(gets, vec!["http://cs1/depot/7/first", "http://cs1/depot/7/second"]);
    assert_eq!(pool.queued_count(), 0);
    assert_eq!(pool.ready_count(), 1);
}

#[tokio::test]
async fn failed_request_evicts_the_connection() {
    init_logging();
    let http = Arc::new(MockCdn::new(|request: &HttpRequest| {
        if request.url.contains("/broken") {
            HttpResponse { status: 500, body: Vec::new() }
        } else {
            echo(request)
        }
    }));
    let pool = pool(&["cs1"], Arc::clone(&http));
    wait_until(|| pool.ready_count() == 1).await;

    let err = pool.request(7, TICKET, "/broken").await.expect_err("server error");
    assert!(matches!(err, ContentError::Status { status: 500, .. }));
    assert_eq!(pool.live_count(), 0);

    let err = pool.request(7, TICKET, "/manifest/1/5").await.expect_err("nothing left");
    assert!(matches!(err, ContentError::PoolExhausted));
    assert_eq!(http.count("/broken"), 1);
}

#[tokio::test]
async fn queued_requests_fail_when_every_server_is_gone() {
    init_logging();
    let http = Arc::new(
        MockCdn::new(|request: &HttpRequest| {
            if request.url.ends_with("/initsession/") {
                HttpResponse { status: 403, body: Vec::new() }
            } else {
                echo(request)
            }
        })
        .gated(),
    );
    let pool = pool(&["cs1", "cs2"], Arc::clone(&http));

    let waiting = tokio::spawn({
        let pool = pool.clone();
        async move { pool.request(7, TICKET, "/manifest/1/5").await }
    });
    wait_until(|| pool.queued_count() == 1).await;

    http.open_init(2);
    let result = timeout(WAIT, waiting).await.expect("in time").expect("join");
    assert!(matches!(result, Err(ContentError::PoolExhausted)));
    assert_eq!(pool.initializing_count(), 0);
    assert_eq!(http.count("/depot/"), 0);
}

#[tokio::test]
async fn downloads_manifest_and_chunks() {
    init_logging();
    let http = Arc::new(MockCdn::new(depot_server));
    let pool = pool(&["cs1"], Arc::clone(&http));
    let key = depot_key();

    let manifest = pool.download_manifest(7, 123, TICKET, &key).await.expect("manifest");
    let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["first.bin", "sub/second.bin"]);
    assert_eq!(manifest.metadata.as_ref().map(|m| m.manifest_id), Some(123));
    assert_eq!(manifest.total_size(), 12);

    let chunk = pool.download_chunk(7, &ChunkId(vec![2; 20]), TICKET, &key).await.expect("chunk");
    assert_eq!(chunk, b"BBBB");
    let expected = format!("http://cs1/depot/7/chunk/{}", "02".repeat(20));
    assert_eq!(http.count(&expected), 1);
}

#[tokio::test]
async fn shared_chunk_is_fetched_once_and_written_twice() {
    init_logging();
    let http = Arc::new(MockCdn::new(depot_server));
    let pool = pool(&["cs1", "cs2"], Arc::clone(&http));
    let key = depot_key();
    let dir = tempfile::tempdir().expect("tempdir");

    let manifest = pool.download_manifest(7, 123, TICKET, &key).await.expect("manifest");
    let plan = ChunkPlan::from_files(&manifest.files);
    assert_eq!(plan.len(), 2);
    assert_eq!(plan.write_count(), 3);

    let job = DepotJob::new(7, TICKET.to_vec(), key);
    let sink = Arc::new(DirectorySink::new(dir.path()));
    let stats = download_depot(&pool, &job, &plan, sink).await.expect("download");

    assert_eq!(stats.chunks_fetched, 2);
    assert_eq!(stats.chunk_writes, 3);
    assert_eq!(stats.bytes_fetched, 8);
    assert_eq!(http.count(&format!("/chunk/{}", "02".repeat(20))), 1);
    assert_eq!(http.count(&format!("/chunk/{}", "01".repeat(20))), 1);

    let first = tokio::fs::read(dir.path().join("first.bin")).await.expect("first");
    let second = tokio::fs::read(dir.path().join("sub/second.bin")).await.expect("second");
    assert_eq!(first, b"AAAABBBB");
    assert_eq!(second, b"BBBB");
}

#[tokio::test]
async fn cancelled_request_gives_up_its_connection() {
    init_logging();
    let http = Arc::new(MockCdn::new(echo).stalling("/slow", Duration::from_secs(3600)));
    let pool = pool(&["cs1"], Arc::clone(&http));
    wait_until(|| pool.ready_count() == 1).await;

    let stalled = tokio::spawn({
        let pool = pool.clone();
        async move { pool.request(7, TICKET, "/slow").await }
    });
    wait_until(|| http.count("/depot/7/slow") == 1).await;
    let queued = tokio::spawn({
        let pool = pool.clone();
        async move { pool.request(7, TICKET, "/manifest/1/5").await }
    });
    wait_until(|| pool.queued_count() == 1).await;

    stalled.abort();
    let result = timeout(WAIT, queued).await.expect("queued request not stuck").expect("join");
    assert!(matches!(result, Err(ContentError::PoolExhausted)));
    assert_eq!(pool.live_count(), 0);
    assert_eq!(pool.ready_count(), 0);
}

#[tokio::test]
async fn timed_out_request_does_not_leak_the_connection() {
    init_logging();
    let http = Arc::new(MockCdn::new(echo).stalling("/slow", Duration::from_secs(3600)));
    let pool = pool(&["cs1"], Arc::clone(&http));
    wait_until(|| pool.ready_count() == 1).await;

    let elapsed = timeout(Duration::from_millis(200), pool.request(7, TICKET, "/slow")).await;
    assert!(elapsed.is_err());
    assert_eq!(pool.live_count(), 0);

    let err = timeout(WAIT, pool.request(7, TICKET, "/manifest/1/5"))
        .await
        .expect("no hang")
        .expect_err("connection is gone");
    assert!(matches!(err, ContentError::PoolExhausted));
}

#[tokio::test]
async fn failed_download_lets_in_flight_chunks_finish() {
    init_logging();
    let missing = format!("/chunk/{}", "01".repeat(20));
    let http = Arc::new(
        MockCdn::new(move |request: &HttpRequest| {
            if request.url.ends_with(&missing) {
                HttpResponse { status: 404, body: Vec::new() }
            } else {
                depot_server(request)
            }
        })
        .stalling("/chunk/0202", Duration::from_millis(300)),
    );
    let pool = pool(&["cs1", "cs2"], Arc::clone(&http));
    wait_until(|| pool.ready_count() == 2).await;
    let key = depot_key();

    let manifest = pool.download_manifest(7, 123, TICKET, &key).await.expect("manifest");
    let plan = ChunkPlan::from_files(&manifest.files);
    let dir = tempfile::tempdir().expect("tempdir");
    let job = DepotJob::new(7, TICKET.to_vec(), key);
    let sink = Arc::new(DirectorySink::new(dir.path()));

    let err = download_depot(&pool, &job, &plan, sink).await.expect_err("missing chunk");
    assert!(matches!(err, ContentError::Status { status: 404, .. }));
    assert_eq!(http.count(&format!("/chunk/{}", "02".repeat(20))), 1);
    assert_eq!(pool.live_count(), 1);
    assert_eq!(pool.ready_count(), 1);

    let body = timeout(WAIT, pool.request(7, TICKET, "/manifest/9/5"))
        .await
        .expect("no hang")
        .expect("surviving connection");
    assert!(String::from_utf8(body).expect("utf8").ends_with("/depot/7/manifest/9/5"));
}
