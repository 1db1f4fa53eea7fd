//! End-to-end builds against the offline package index.

mod common;

use buildlite::BuildliteError;
use buildlite::db::{BuildStatus, BuildStore, Database};
use buildlite::image::inspect_layout;
use common::{Fixture, PYPROJECT};

#[tokio::test]
async fn test_build_installs_production_closure_only() {
    let fixture = Fixture::standard();
    let outcome = fixture
        .builder(fixture.options(), "image")
        .build()
        .await
        .unwrap();

    let pins = outcome.environment.pins();
    assert!(pins.contains(&"foo==1.2.0".to_string()));
    assert!(pins.contains(&"uvicorn==0.30.0".to_string()));
    assert!(!outcome.environment.contains("pytest"));
    assert_eq!(
        outcome.environment.project.as_ref().map(|p| p.pin()),
        Some("quarto-backend==0.1.0".to_string())
    );

    let image = inspect_layout(&outcome.image.path).unwrap();
    assert_eq!(image.manifest_digest, outcome.image.manifest_digest);
    assert!(!image.all_entries().any(|p| p.contains("pytest")));
    assert!(
        image
            .all_entries()
            .any(|p| p == "project/src/quarto_backend/main.py")
    );
    assert!(
        image
            .all_entries()
            .any(|p| p == "project/.venv/bin/uvicorn")
    );
    assert!(!image.all_entries().any(|p| p.ends_with(".pyc")));
}

#[tokio::test]
async fn test_runtime_image_is_minimal() {
    let fixture = Fixture::standard();
    let outcome = fixture
        .builder(fixture.options(), "image")
        .build()
        .await
        .unwrap();

    let image = inspect_layout(&outcome.image.path).unwrap();
    assert!(image.minimality_violations().is_empty());
    for entry in image.all_entries() {
        assert!(!entry.ends_with("pdm.lock"), "{}", entry);
        assert!(!entry.ends_with("/pyproject.toml"), "{}", entry);
        assert!(!entry.contains(".git/"), "{}", entry);
    }
    assert!(image.env_var("PDM_CHECK_UPDATE").is_none());
}

#[tokio::test]
async fn test_process_configuration() {
    let fixture = Fixture::standard();
    let outcome = fixture
        .builder(fixture.options(), "image")
        .build()
        .await
        .unwrap();

    let image = inspect_layout(&outcome.image.path).unwrap();
    let path = image.env_var("PATH").unwrap();
    assert!(path.starts_with("/project/.venv/bin:"));
    assert_eq!(image.env_var("PYTHONPATH").as_deref(), Some("/project/src"));
    assert_eq!(image.exposed_ports(), vec!["8000/tcp".to_string()]);
    assert_eq!(
        image.entrypoint()[..6],
        [
            "uvicorn",
            "quarto_backend.main:app",
            "--host",
            "0.0.0.0",
            "--port",
            "8000"
        ]
    );
    assert_eq!(image.base_image().as_deref(), Some("python:3.12-slim"));
}

#[tokio::test]
async fn test_identical_inputs_build_identical_images() {
    let fixture = Fixture::standard();
    let mut options = fixture.options();
    options.cache = false;

    let first = fixture
        .builder(options.clone(), "first")
        .build()
        .await
        .unwrap();
    let second = fixture.builder(options, "second").build().await.unwrap();

    assert!(!first.cache_hit && !second.cache_hit);
    assert_ne!(first.build_id, second.build_id);
    assert_eq!(first.input_digest, second.input_digest);
    assert_eq!(first.environment, second.environment);
    assert_eq!(first.environment_digest, second.environment_digest);
    assert_eq!(first.image.layer_digests(), second.image.layer_digests());
}

#[tokio::test]
async fn test_cached_environment_is_reused() {
    let fixture = Fixture::standard();
    let first = fixture
        .builder(fixture.options(), "first")
        .build()
        .await
        .unwrap();
    let second = fixture
        .builder(fixture.options(), "second")
        .build()
        .await
        .unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.environment_digest, second.environment_digest);
    assert_eq!(first.image.layer_digests(), second.image.layer_digests());
}

#[tokio::test]
async fn test_pin_violating_manifest_fails_before_install() {
    let manifest = PYPROJECT.replace("foo>=1.0", "foo>=1.3");
    let fixture = Fixture::new(&manifest, "1.1.0");
    let store = BuildStore::new(Database::open_in_memory().unwrap());

    let err = fixture
        .builder(fixture.options(), "image")
        .with_store(store.clone())
        .build()
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some("builder"));
    assert!(matches!(err.root(), BuildliteError::Integrity(_)));
    assert!(err.to_string().contains("foo==1.1.0"));

    assert!(!fixture.out("image").exists());
    let builds = fixture.home().builds_dir();
    let leftover = std::fs::read_dir(&builds)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0, "build workspace was not cleaned up");

    let records = store.list(10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BuildStatus::Failed);
    assert_eq!(records[0].failed_stage.as_deref(), Some("builder"));
    assert!(records[0].environment_digest.is_none());
}

#[tokio::test]
async fn test_edited_manifest_makes_lock_stale() {
    let fixture = Fixture::standard();
    let pyproject = fixture.project().join("pyproject.toml");
    std::fs::write(&pyproject, PYPROJECT.replace("foo>=1.0", "foo>=1.0,<2")).unwrap();

    let err = fixture
        .builder(fixture.options(), "image")
        .check()
        .await
        .unwrap_err();
    assert!(matches!(err.root(), BuildliteError::Integrity(_)));
    assert!(err.to_string().contains("content hash"));
}

#[tokio::test]
async fn test_check_reports_production_pins() {
    let fixture = Fixture::standard();
    let report = fixture
        .builder(fixture.options(), "image")
        .check()
        .await
        .unwrap();

    assert!(report.checked.contains(&"foo==1.2.0".to_string()));
    assert!(!report.checked.iter().any(|p| p.starts_with("pytest")));
    assert!(!fixture.out("image").exists());
}

#[tokio::test]
async fn test_successful_builds_are_recorded() {
    let fixture = Fixture::standard();
    let store = BuildStore::new(Database::open_in_memory().unwrap());
    let mut options = fixture.options();
    options.cache = false;

    for out in ["a", "b"] {
        fixture
            .builder(options.clone(), out)
            .with_store(store.clone())
            .build()
            .await
            .unwrap();
    }

    let records = store.list(10).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == BuildStatus::Succeeded));
    assert!(store.verify_determinism().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_package_in_index_is_resolution_error() {
    let fixture = Fixture::standard();
    std::fs::remove_dir_all(fixture.index().join("uvicorn")).unwrap();

    let err = fixture
        .builder(fixture.options(), "image")
        .build()
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some("builder"));
    assert!(matches!(err.root(), BuildliteError::Resolution(_)));
}

#[tokio::test]
async fn test_missing_app_module_is_layout_error() {
    let fixture = Fixture::standard();
    let mut options = fixture.options();
    options.app = "quarto_backend.server:app".into();

    let err = fixture
        .builder(options, "image")
        .build()
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some("runtime"));
    assert!(matches!(err.root(), BuildliteError::Layout(_)));
    assert!(!fixture.out("image").exists());
}

#[tokio::test]
async fn test_build_on_base_layout() {
    let fixture = Fixture::standard();
    fixture.write_base_layout("3.12.4");
    let mut options = fixture.options();
    options.base_layout = Some("base-image".into());

    let outcome = fixture.builder(options, "image").build().await.unwrap();
    let base_digest = outcome.image.base_digest.clone().unwrap();

    let image = inspect_layout(&outcome.image.path).unwrap();
    assert_eq!(image.base_digest(), Some(base_digest));
    assert!(image.layers[0].image_path.is_none());
    assert_eq!(image.layers.len(), outcome.image.layers.len() + 1);
    assert_eq!(image.config.rootfs().diff_ids().len(), image.layers.len());
    assert!(image.all_entries().any(|p| p == "usr/local/bin/python3"));
    assert_eq!(image.env_var("LANG").as_deref(), Some("C.UTF-8"));
    assert!(image.env_var("PATH").unwrap().starts_with("/project/.venv/bin:"));
    assert!(image.minimality_violations().is_empty());
}

#[tokio::test]
async fn test_base_layout_with_other_interpreter_rejected() {
    let fixture = Fixture::standard();
    fixture.write_base_layout("3.11.9");
    let mut options = fixture.options();
    options.base_layout = Some("base-image".into());

    let err = fixture
        .builder(options, "image")
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err.root(), BuildliteError::Config(_)));
    assert!(err.to_string().contains("3.11.9"));
    assert!(!fixture.out("image").exists());
}
