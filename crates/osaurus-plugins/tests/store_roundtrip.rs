//! End-to-end installer tests against a local HTTP fixture serving a
//! central index and plugin archives.

use std::collections::HashMap;
use std::io::Write;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use ed25519_dalek::{Signer, SigningKey};
use semver::Version;
use sha2::{Digest, Sha256};

use osaurus_plugins::index::{PluginSpec, Requires, SpecArtifact, SpecVersion};
use osaurus_plugins::{IndexClient, PluginInstaller, PluginStore, StoreError};

struct Fixture {
    installer: PluginInstaller,
    _root: tempfile::TempDir,
}

#[derive(Clone)]
struct Served {
    index_json: String,
    archives: HashMap<String, Vec<u8>>,
}

async fn index_handler(State(served): State<Served>) -> String {
    served.index_json.clone()
}

async fn archive_handler(
    State(served): State<Served>,
    axum::extract::Path(name): axum::extract::Path<String>,
) -> Vec<u8> {
    served.archives.get(&name).cloned().unwrap_or_default()
}

fn zip_bytes(lib_name: &str, contents: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer.start_file(lib_name, options).unwrap();
    writer.write_all(contents).unwrap();
    writer.finish().unwrap().into_inner()
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

/// Stand up an index with `dev.example.echo` at 0.1.0 and 0.2.0, both
/// signed; `corrupt_signature` breaks 0.1.0's signature.
async fn fixture(corrupt_signature: bool) -> Fixture {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let zip_010 = zip_bytes("libecho.dylib", b"echo library v0.1.0");
    let zip_020 = zip_bytes("nested/libecho.dylib", b"echo library v0.2.0");

    let artifact = |name: &str, bytes: &[u8], signature: Option<String>| SpecArtifact {
        os: std::env::consts::OS.into(),
        arch: std::env::consts::ARCH.into(),
        url: format!("http://{addr}/archives/{name}"),
        sha256: hex::encode(Sha256::digest(bytes)),
        size: Some(bytes.len() as u64),
        signature,
    };
    let sign = |bytes: &[u8]| Some(hex::encode(signing_key().sign(bytes).to_bytes()));

    let signature_010 = if corrupt_signature {
        Some(hex::encode([0u8; 64]))
    } else {
        sign(&zip_010)
    };

    let spec = PluginSpec {
        plugin_id: "dev.example.echo".into(),
        name: Some("Echo".into()),
        description: Some("Echoes its input".into()),
        versions: vec![
            SpecVersion {
                version: "0.1.0".parse().unwrap(),
                artifacts: vec![artifact("echo-0.1.0.zip", &zip_010, signature_010)],
                requires: None,
            },
            SpecVersion {
                version: "0.2.0".parse().unwrap(),
                artifacts: vec![artifact("echo-0.2.0.zip", &zip_020, sign(&zip_020))],
                requires: Some(Requires {
                    min_host_version: Some("0.0.1".parse().unwrap()),
                }),
            },
        ],
        public_keys: [(
            "ed25519".to_string(),
            hex::encode(signing_key().verifying_key().to_bytes()),
        )]
        .into_iter()
        .collect(),
    };

    let served = Served {
        index_json: serde_json::json!({ "plugins": [spec] }).to_string(),
        archives: [
            ("echo-0.1.0.zip".to_string(), zip_010),
            ("echo-0.2.0.zip".to_string(), zip_020),
        ]
        .into_iter()
        .collect(),
    };

    let router = Router::new()
        .route("/index.json", get(index_handler))
        .route("/archives/{name}", get(archive_handler))
        .with_state(served);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let root = tempfile::tempdir().unwrap();
    let store = PluginStore::new(root.path().into());
    store.init().unwrap();
    let index = IndexClient::new(format!("http://{addr}/index.json"));
    Fixture {
        installer: PluginInstaller::new(store, index),
        _root: root,
    }
}

fn v(s: &str) -> Version {
    s.parse().unwrap()
}

#[tokio::test]
async fn install_writes_receipt_and_flips_current() {
    let fx = fixture(false).await;
    let outcome = fx
        .installer
        .install("dev.example.echo", Some(&v("0.1.0")))
        .await
        .unwrap();
    assert_eq!(outcome.version, v("0.1.0"));

    let store = fx.installer.store();
    let installed = store.list_installed().unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].versions, vec![v("0.1.0")]);
    assert_eq!(installed[0].current, Some(v("0.1.0")));

    let receipt = store.read_receipt("dev.example.echo", &v("0.1.0")).unwrap();
    assert_eq!(receipt.dylib_filename, "libecho.dylib");
    assert_eq!(receipt.dylib_sha256, outcome.dylib_sha256);

    // Freshly installed versions verify clean.
    let reports = store.verify().unwrap();
    assert!(reports.iter().all(|r| r.ok), "verify failed: {reports:?}");
}

#[tokio::test]
async fn install_without_preference_takes_highest() {
    let fx = fixture(false).await;
    let outcome = fx.installer.install("dev.example.echo", None).await.unwrap();
    assert_eq!(outcome.version, v("0.2.0"));
}

#[tokio::test]
async fn upgrade_then_rollback_round_trip() {
    let fx = fixture(false).await;
    fx.installer
        .install("dev.example.echo", Some(&v("0.1.0")))
        .await
        .unwrap();

    let outcomes = fx.installer.upgrade(Some("dev.example.echo")).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].version, v("0.2.0"));

    let store = fx.installer.store();
    assert_eq!(store.current_version("dev.example.echo"), Some(v("0.2.0")));

    // Rollback flips current back without deleting 0.2.0.
    let target = store.rollback("dev.example.echo").unwrap();
    assert_eq!(target, v("0.1.0"));
    assert_eq!(store.current_version("dev.example.echo"), Some(v("0.1.0")));
    assert!(store.dylib_path("dev.example.echo", &v("0.2.0")).unwrap().exists());

    // A second upgrade pass brings it forward again.
    let outcomes = fx.installer.upgrade(None).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(store.current_version("dev.example.echo"), Some(v("0.2.0")));
}

#[tokio::test]
async fn corrupted_signature_leaves_no_trace() {
    let fx = fixture(true).await;
    let err = fx
        .installer
        .install("dev.example.echo", Some(&v("0.1.0")))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SignatureInvalid(_)), "got {err:?}");

    let store = fx.installer.store();
    assert!(!store.version_dir("dev.example.echo", &v("0.1.0")).exists());
    assert!(store.list_installed().unwrap().is_empty());
}

#[tokio::test]
async fn corrupted_signature_preserves_existing_current() {
    // Install the good 0.2.0 first, then fail on 0.1.0's bad signature.
    let fx = fixture(true).await;
    fx.installer
        .install("dev.example.echo", Some(&v("0.2.0")))
        .await
        .unwrap();

    let err = fx
        .installer
        .install("dev.example.echo", Some(&v("0.1.0")))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SignatureInvalid(_)));

    let store = fx.installer.store();
    assert_eq!(store.current_version("dev.example.echo"), Some(v("0.2.0")));
    assert!(!store.version_dir("dev.example.echo", &v("0.1.0")).exists());
}

#[tokio::test]
async fn unknown_plugin_is_spec_not_found() {
    let fx = fixture(false).await;
    assert!(matches!(
        fx.installer.install("dev.example.ghost", None).await,
        Err(StoreError::SpecNotFound(_))
    ));
}
