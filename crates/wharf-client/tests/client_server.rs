//! End-to-end tests: the HTTP client talking to the HTTP server backed by
//! the in-memory registry.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::http::Request;
use axum::middleware::{self, Next};
use bytes::Bytes;

use wharf_client::{ClientConfig, RemoteRegistry};
use wharf_core::model::media_type;
use wharf_core::registry::{
    byte_stream, collect_entries, Registry, RegistryDeleter as _, RegistryLister as _,
    RegistryReader as _, RegistryWriter as _,
};
use wharf_core::{Descriptor, DistributionErrorCode, Manifest, OciDigest};
use wharf_http::RegistryServer;
use wharf_mem::MemRegistry;

/// One observed request: method, path, Content-Range header if any.
type WireLog = Arc<Mutex<Vec<(String, String, Option<String>)>>>;

static INIT: std::sync::Once = std::sync::Once::new();

fn init() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("wharf_client=trace,wharf_http=debug")
            .with_test_writer()
            .compact()
            .init();
    });
}

async fn record<B>(log: WireLog, req: Request<B>, next: Next<B>) -> axum::response::Response {
    log.lock().unwrap().push((
        req.method().to_string(),
        req.uri().path().to_string(),
        req.headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    ));
    next.run(req).await
}

async fn serve(backend: Arc<dyn Registry>) -> (SocketAddr, WireLog) {
    let log: WireLog = Arc::new(Mutex::new(Vec::new()));
    let recorder = log.clone();
    let app = RegistryServer::new(backend).router().layer(middleware::from_fn(
        move |req: Request<axum::body::Body>, next: Next<axum::body::Body>| {
            record(recorder.clone(), req, next)
        },
    ));
    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
        .serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    (addr, log)
}

async fn client() -> (RemoteRegistry, MemRegistry, WireLog) {
    init();
    let mem = MemRegistry::new();
    let (addr, log) = serve(Arc::new(mem.clone())).await;
    let remote = RemoteRegistry::new(
        &format!("127.0.0.1:{}", addr.port()),
        ClientConfig {
            insecure: true,
            ..Default::default()
        },
    )
    .unwrap();
    (remote, mem, log)
}

fn image_manifest_bytes(config: &Descriptor) -> Bytes {
    Bytes::from(
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::IMAGE_MANIFEST,
            "config": config,
            "layers": [],
        }))
        .unwrap(),
    )
}

#[tokio::test]
async fn ping() {
    let (remote, _, _) = client().await;
    remote.ping().await.unwrap();
}

#[tokio::test]
async fn monolithic_push_and_fetch() {
    let (remote, _, _) = client().await;
    let desc = Descriptor::from_content(media_type::OCTET_STREAM, b"hi");
    let pushed = remote
        .push_blob("r", &desc, byte_stream(Bytes::from_static(b"hi")))
        .await
        .unwrap();
    assert_eq!(pushed.size, 2);

    let blob = remote.get_blob("r", &desc.digest).await.unwrap();
    assert_eq!(blob.descriptor.size, 2);
    assert_eq!(blob.collect().await.unwrap().as_ref(), b"hi");

    let resolved = remote.resolve_blob("r", &desc.digest).await.unwrap();
    assert_eq!(resolved.digest, desc.digest);
    assert_eq!(resolved.size, 2);
}

#[tokio::test]
async fn chunked_upload_emits_three_patches() {
    let (remote, _, log) = client().await;

    let mut w = remote.push_blob_chunked("r", Some(3)).await.unwrap();
    w.write(Bytes::from_static(b"abcdefghi")).await.unwrap();
    assert_eq!(w.size(), 9);
    let digest = OciDigest::from("abcdefghi".as_bytes());
    let committed = w.commit(&digest).await.unwrap();
    assert_eq!(committed, digest);

    let blob = remote.get_blob("r", &digest).await.unwrap();
    assert_eq!(blob.collect().await.unwrap().as_ref(), b"abcdefghi");

    let ranges: Vec<Option<String>> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|(method, _, _)| method == "PATCH")
        .map(|(_, _, range)| range.clone())
        .collect();
    assert_eq!(
        ranges,
        vec![
            Some("0-2".to_string()),
            Some("3-5".to_string()),
            Some("6-8".to_string())
        ]
    );
}

#[tokio::test]
async fn chunked_upload_close_and_resume() {
    let (remote, _, _) = client().await;

    let mut w = remote.push_blob_chunked("r", Some(4)).await.unwrap();
    w.write(Bytes::from_static(b"abcdef")).await.unwrap();
    let id = w.close().await.unwrap();

    let mut w = remote.resume_blob_chunked("r", &id, Some(4)).await.unwrap();
    // the server reports how much it already holds
    assert_eq!(w.size(), 6);
    w.write(Bytes::from_static(b"ghi")).await.unwrap();
    let digest = OciDigest::from("abcdefghi".as_bytes());
    w.commit(&digest).await.unwrap();

    let blob = remote.get_blob("r", &digest).await.unwrap();
    assert_eq!(blob.collect().await.unwrap().as_ref(), b"abcdefghi");
}

#[tokio::test]
async fn chunked_upload_cancel() {
    let (remote, _, _) = client().await;
    let mut w = remote.push_blob_chunked("r", None).await.unwrap();
    w.write(Bytes::from_static(b"doomed")).await.unwrap();
    w.cancel().await.unwrap();
}

#[tokio::test]
async fn manifest_push_and_resolve_tag() {
    let (remote, _, _) = client().await;
    let config = Descriptor::from_content(media_type::OCTET_STREAM, b"{}");
    remote
        .push_blob("r", &config, byte_stream(Bytes::from_static(b"{}")))
        .await
        .unwrap();

    let body = image_manifest_bytes(&config);
    let pushed = remote
        .push_manifest("r", Some("v1"), body.clone(), media_type::IMAGE_MANIFEST)
        .await
        .unwrap();
    assert_eq!(pushed.digest, OciDigest::from(body.as_ref()));
    assert_eq!(pushed.size, body.len() as u64);

    let resolved = remote.resolve_tag("r", "v1").await.unwrap();
    assert_eq!(resolved.digest, pushed.digest);
    assert_eq!(resolved.size, body.len() as u64);
    assert_eq!(resolved.media_type, media_type::IMAGE_MANIFEST);

    let fetched = remote.get_tag("r", "v1").await.unwrap();
    assert_eq!(fetched.descriptor.digest, pushed.digest);
    assert_eq!(fetched.collect().await.unwrap(), body);

    let by_digest = remote.get_manifest("r", &pushed.digest).await.unwrap();
    let fetched_bytes = by_digest.collect().await.unwrap();
    let parsed = Manifest::from_slice(&fetched_bytes).unwrap();
    assert_eq!(parsed.config.unwrap().digest, config.digest);
}

#[tokio::test]
async fn mount_between_repositories() {
    let (remote, _, _) = client().await;
    let desc = Descriptor::from_content(media_type::OCTET_STREAM, b"shared");
    remote
        .push_blob("src", &desc, byte_stream(Bytes::from_static(b"shared")))
        .await
        .unwrap();

    let mounted = remote.mount_blob("src", "dst", &desc.digest).await.unwrap();
    assert_eq!(mounted.digest, desc.digest);
    let blob = remote.get_blob("dst", &desc.digest).await.unwrap();
    assert_eq!(blob.collect().await.unwrap().as_ref(), b"shared");
}

#[tokio::test]
async fn listings_through_the_wire() {
    let (remote, _, _) = client().await;
    let config = Descriptor::from_content(media_type::OCTET_STREAM, b"{}");
    for repo in ["alpha", "beta"] {
        remote
            .push_blob(repo, &config, byte_stream(Bytes::from_static(b"{}")))
            .await
            .unwrap();
    }
    let body = image_manifest_bytes(&config);
    for tag in ["v1", "v3", "v2"] {
        remote
            .push_manifest("alpha", Some(tag), body.clone(), media_type::IMAGE_MANIFEST)
            .await
            .unwrap();
    }

    let repos = collect_entries(remote.repositories(None)).await.unwrap();
    assert_eq!(repos, vec!["alpha", "beta"]);

    let tags = collect_entries(remote.tags("alpha", None)).await.unwrap();
    assert_eq!(tags, vec!["v1", "v2", "v3"]);

    let tags = collect_entries(remote.tags("alpha", Some("v1".into())))
        .await
        .unwrap();
    assert_eq!(tags, vec!["v2", "v3"]);
}

#[tokio::test]
async fn referrers_through_the_wire() {
    let (remote, _, _) = client().await;
    let config = Descriptor::from_content(media_type::OCTET_STREAM, b"{}");
    remote
        .push_blob("r", &config, byte_stream(Bytes::from_static(b"{}")))
        .await
        .unwrap();
    let subject = remote
        .push_manifest(
            "r",
            Some("base"),
            image_manifest_bytes(&config),
            media_type::IMAGE_MANIFEST,
        )
        .await
        .unwrap();

    let referrer_body = Bytes::from(
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::IMAGE_MANIFEST,
            "artifactType": "application/example+type",
            "config": config,
            "layers": [],
            "subject": subject,
        }))
        .unwrap(),
    );
    let referrer = remote
        .push_manifest("r", None, referrer_body, media_type::IMAGE_MANIFEST)
        .await
        .unwrap();

    let listed = collect_entries(remote.referrers("r", &subject.digest, None))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].digest, referrer.digest);
    assert_eq!(
        listed[0].artifact_type.as_deref(),
        Some("application/example+type")
    );

    let filtered = collect_entries(remote.referrers(
        "r",
        &subject.digest,
        Some("application/other".into()),
    ))
    .await
    .unwrap();
    assert!(filtered.is_empty());
}

#[tokio::test]
async fn deletes_through_the_wire() {
    let (remote, _, _) = client().await;
    let config = Descriptor::from_content(media_type::OCTET_STREAM, b"{}");
    remote
        .push_blob("r", &config, byte_stream(Bytes::from_static(b"{}")))
        .await
        .unwrap();
    let manifest = remote
        .push_manifest(
            "r",
            Some("v1"),
            image_manifest_bytes(&config),
            media_type::IMAGE_MANIFEST,
        )
        .await
        .unwrap();

    remote.delete_manifest("r", &manifest.digest).await.unwrap();
    let err = remote.resolve_tag("r", "v1").await.unwrap_err();
    assert!(err.is_code(DistributionErrorCode::ManifestUnknown));

    remote.delete_blob("r", &config.digest).await.unwrap();
    let err = remote.resolve_blob("r", &config.digest).await.unwrap_err();
    assert!(err.is_code(DistributionErrorCode::BlobUnknown));
}

#[tokio::test]
async fn typed_errors_cross_the_wire() {
    let (remote, _, _) = client().await;
    let absent = OciDigest::from("absent".as_bytes());

    let err = remote.get_blob("missing", &absent).await.unwrap_err();
    assert!(err.is_code(DistributionErrorCode::NameUnknown));

    remote
        .push_blob(
            "r",
            &Descriptor::from_content(media_type::OCTET_STREAM, b"x"),
            byte_stream(Bytes::from_static(b"x")),
        )
        .await
        .unwrap();
    let err = remote.get_blob("r", &absent).await.unwrap_err();
    assert!(err.is_code(DistributionErrorCode::BlobUnknown));

    let err = remote.get_tag("r", "missing").await.unwrap_err();
    assert!(err.is_code(DistributionErrorCode::ManifestUnknown));
}

#[tokio::test]
async fn corrupted_content_fails_digest_verification() {
    use axum::routing::get;

    // a server that answers every blob GET with the wrong bytes
    let app = axum::Router::new().route(
        "/v2/r/blobs/:digest",
        get(|| async {
            (
                [("content-type", media_type::OCTET_STREAM)],
                Bytes::from_static(b"evil"),
            )
        }),
    );
    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
        .serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });

    let remote = RemoteRegistry::new(
        &format!("127.0.0.1:{}", addr.port()),
        ClientConfig {
            insecure: true,
            ..Default::default()
        },
    )
    .unwrap();

    // "good" and "evil" have the same length, so only the digest check can
    // catch the substitution
    let expected = Descriptor::from_content(media_type::OCTET_STREAM, b"good");
    let blob = remote.get_blob("r", &expected.digest).await.unwrap();
    let err = blob.collect().await.unwrap_err();
    assert!(err.is_code(DistributionErrorCode::DigestInvalid));
}
