//! Cache maintenance flows: discovery of installed models, purge,
//! manifest refresh, and repair of damaged installs.

use mlx_fetch::{
    DownloadCoordinator, FetchError, HubClient, HubLayout, MetadataStore, NetworkFailureManager,
    ProgressBus, RepairOutcome, VerificationService,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REPO: &str = "mlx-community/Tiny-1M";

fn tree_entry(name: &str, content: &[u8]) -> serde_json::Value {
    json!({
        "type": "file",
        "path": name,
        "size": content.len(),
        "lfs": { "oid": format!("{:x}", Sha256::digest(content)), "size": content.len() }
    })
}

async fn mount_repo(server: &MockServer, files: &[(&str, &[u8])]) {
    let entries: Vec<serde_json::Value> =
        files.iter().map(|(name, content)| tree_entry(name, content)).collect();
    Mock::given(method("GET"))
        .and(path(format!("/api/models/{REPO}/tree/main")))
        .and(query_param("recursive", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(entries))
        .mount(server)
        .await;
    for (name, content) in files {
        Mock::given(method("GET"))
            .and(path(format!("/{REPO}/resolve/main/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(content.to_vec()))
            .mount(server)
            .await;
    }
}

async fn downloaded_coordinator(
    workspace: &TempDir,
    server: &MockServer,
) -> (DownloadCoordinator, std::path::PathBuf) {
    let coordinator = DownloadCoordinator::new(
        HubClient::with_endpoint(server.uri()),
        MetadataStore::new(workspace.path().join("downloads")),
        HubLayout::new(workspace.path().join("hub")),
        NetworkFailureManager::new(),
        ProgressBus::new(),
    );
    let model_dir = workspace.path().join("models").join(REPO);
    coordinator
        .download_model(
            REPO,
            &model_dir,
            &workspace.path().join("staging").join(REPO),
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("seed download should succeed");
    (coordinator, model_dir)
}

fn seed_files() -> Vec<(&'static str, &'static [u8])> {
    vec![
        ("config.json", br#"{"model_type":"tiny"}"#.as_slice()),
        ("tokenizer.json", br#"{"vocab":{}}"#.as_slice()),
        ("model.safetensors", b"tiny weights".as_slice()),
    ]
}

#[tokio::test]
async fn discovery_reports_installed_models_sorted() {
    let workspace = TempDir::new().expect("workspace");
    let server = MockServer::start().await;
    mount_repo(&server, &seed_files()).await;
    let (coordinator, _) = downloaded_coordinator(&workspace, &server).await;

    // A second, hand-placed install in the plain `<owner>/<repo>` shape.
    let other = workspace.path().join("hub").join("aaa/zzz");
    for (name, body) in [("tokenizer.model", "t"), ("weights.gguf", "w")] {
        std::fs::create_dir_all(&other).expect("mkdir");
        std::fs::write(other.join(name), body).expect("write");
    }

    let models = coordinator.list_downloaded_models();
    let ids: Vec<&str> = models.iter().map(|m| m.hub_id.as_str()).collect();
    assert_eq!(ids, vec!["aaa/zzz", REPO]);
}

#[tokio::test]
async fn purge_removes_layout_mirror_and_manifest() {
    let workspace = TempDir::new().expect("workspace");
    let server = MockServer::start().await;
    mount_repo(&server, &seed_files()).await;
    let (coordinator, _) = downloaded_coordinator(&workspace, &server).await;

    assert!(coordinator.layout().model_root(REPO).exists());
    assert!(coordinator.layout().legacy_dir(REPO).exists());
    assert!(coordinator.metadata().metadata_path(REPO).exists());

    coordinator.purge_model(REPO).expect("purge should succeed");

    assert!(!coordinator.layout().model_root(REPO).exists());
    assert!(!coordinator.layout().legacy_dir(REPO).exists());
    assert!(!coordinator.metadata().metadata_path(REPO).exists());
    assert!(coordinator.list_downloaded_models().is_empty());
}

#[tokio::test]
async fn refresh_metadata_replaces_the_cached_manifest() {
    let workspace = TempDir::new().expect("workspace");
    let server = MockServer::start().await;
    mount_repo(&server, &seed_files()).await;
    let (coordinator, _) = downloaded_coordinator(&workspace, &server).await;

    // The repo grew a new shard upstream.
    server.reset().await;
    let mut files = seed_files();
    files.push(("model-00002.safetensors", b"more weights".as_slice()));
    mount_repo(&server, &files).await;

    let refreshed = coordinator.refresh_metadata(REPO).await.expect("refresh");
    assert_eq!(refreshed.len(), 4);
    let cached = coordinator
        .metadata()
        .load_cached_metadata(REPO)
        .expect("cache should exist");
    assert_eq!(cached, refreshed);
}

#[tokio::test]
async fn damaged_snapshot_is_repaired_from_the_model_dir() {
    let workspace = TempDir::new().expect("workspace");
    let server = MockServer::start().await;
    mount_repo(&server, &seed_files()).await;
    let (coordinator, model_dir) = downloaded_coordinator(&workspace, &server).await;

    let snapshot = coordinator.layout().snapshots_dir(REPO).join("main");
    std::fs::remove_file(snapshot.join("tokenizer.json")).expect("damage the snapshot");
    assert!(!VerificationService::is_directory_complete(&snapshot));

    let service = VerificationService::new(coordinator.metadata().clone(), ProgressBus::new());
    let outcome = service
        .check_and_repair(REPO, &model_dir, &snapshot)
        .expect("repair should run");
    assert_eq!(outcome, RepairOutcome::Repaired);

    assert!(VerificationService::is_directory_complete(&snapshot));
    let repaired = std::fs::read(snapshot.join("tokenizer.json")).expect("repaired file");
    let source = std::fs::read(model_dir.join("tokenizer.json")).expect("source file");
    assert_eq!(repaired, source);
}

#[tokio::test]
async fn stale_refs_pointer_is_reconciled() {
    let workspace = TempDir::new().expect("workspace");
    let server = MockServer::start().await;
    mount_repo(&server, &seed_files()).await;
    let (coordinator, _) = downloaded_coordinator(&workspace, &server).await;

    // Externally clobber refs/main with a revision that does not exist.
    let refs = coordinator.layout().refs_dir(REPO).join("main");
    std::fs::write(&refs, "0123abcd").expect("tamper with refs");

    let resolved = coordinator
        .layout()
        .normalize_snapshot_references(REPO)
        .expect("normalization should succeed");
    assert!(resolved.is_dir());
    let main_ref = std::fs::read_to_string(&refs).expect("refs/main");
    assert!(coordinator.layout().snapshots_dir(REPO).join(main_ref).is_dir());
}

#[tokio::test]
async fn refresh_is_gated_by_backoff() {
    let workspace = TempDir::new().expect("workspace");
    let server = MockServer::start().await;
    let coordinator = DownloadCoordinator::new(
        HubClient::with_endpoint(server.uri()),
        MetadataStore::new(workspace.path().join("downloads")),
        HubLayout::new(workspace.path().join("hub")),
        NetworkFailureManager::new(),
        ProgressBus::new(),
    );

    coordinator.failures().record_failure(
        REPO,
        "download",
        &FetchError::Transient("connection refused".to_owned()),
    );

    let err = coordinator.refresh_metadata(REPO).await.expect_err("gated");
    assert!(matches!(err, FetchError::NetworkUnavailable { .. }), "got {err:?}");
}
