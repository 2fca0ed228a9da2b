//! Tests for the impulse response catalogs.
//!
//! Tests include:
//! - HTTP catalog listing and downloads against a mock server
//! - Directory catalog listing, prefixes and path rejection
//! - Decode cache behaviour through a mocked catalog
//! - Catalog selection from configuration

mod common;

use async_trait::async_trait;
use common::*;
use mockall::mock;
use soul_effects::config::CatalogSettings;
use soul_effects::ir::{self, ImpulseResponseCache, LIST_PATH};
use soul_effects::{DirectoryIrCatalog, EffectsError, HttpIrCatalog, IrCatalog, Result};
use std::fs;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mock! {
    pub Catalog {}

    #[async_trait]
    impl IrCatalog for Catalog {
        async fn list(&self) -> Result<Vec<String>>;
        async fn fetch(&self, id: &str) -> Result<Vec<u8>>;
    }
}

// =============================================================================
// HTTP Catalog Tests
// =============================================================================

mod http_catalog {
    use super::*;

    #[test]
    fn test_rejects_unsupported_scheme() {
        let result = HttpIrCatalog::new("ftp://example.com");
        assert!(matches!(result, Err(EffectsError::InvalidUrl(_))));
    }

    #[test]
    fn test_rejects_garbage_url() {
        assert!(HttpIrCatalog::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_list_returns_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .and(header_exists("user-agent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(vec!["/eq/irs/hall.irs", "/eq/irs/plate.irs"]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let catalog = HttpIrCatalog::new(&server.uri()).unwrap();
        let ids = catalog.list().await.unwrap();

        assert_eq!(ids, vec!["/eq/irs/hall.irs", "/eq/irs/plate.irs"]);
    }

    #[tokio::test]
    async fn test_fetch_downloads_bytes() {
        let server = MockServer::start().await;
        let wav = wav_bytes(48000, 2, 64);
        Mock::given(method("GET"))
            .and(path("/eq/irs/hall.irs"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(wav.clone()))
            .mount(&server)
            .await;

        let catalog = HttpIrCatalog::new(&server.uri()).unwrap();
        let bytes = catalog.fetch("/eq/irs/hall.irs").await.unwrap();

        assert_eq!(bytes, wav);
    }

    #[tokio::test]
    async fn test_error_status_maps_to_catalog_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let catalog = HttpIrCatalog::new(&server.uri()).unwrap();
        match catalog.list().await.unwrap_err() {
            EffectsError::Catalog { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("Expected Catalog error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_listing_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"irs\": 3}"))
            .mount(&server)
            .await;

        let catalog = HttpIrCatalog::new(&server.uri()).unwrap();
        assert!(matches!(
            catalog.list().await,
            Err(EffectsError::Request(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_listing_reconciles_to_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let catalog = HttpIrCatalog::new(&server.uri()).unwrap();
        let reconciled = ir::reconcile_selection(catalog.list().await, Some("/eq/irs/hall.irs"));

        assert!(reconciled.available.is_empty());
        assert_eq!(reconciled.selected, None);
    }

    #[tokio::test]
    async fn test_session_decodes_from_http_catalog() {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LIST_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec!["/eq/irs/hall.irs"]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/eq/irs/hall.irs"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(wav_bytes(48000, 2, 256)))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config();
        config.catalog.base_url = Some(server.uri());
        let session = soul_effects::EffectsSession::builder()
            .config(config)
            .without_storage()
            .build()
            .unwrap();
        session
            .initialize(std::sync::Arc::new(soul_audio::SilentMedia::new()), 1.0)
            .await
            .unwrap();

        session.set_convolver_enabled(true).await;
        // Toggling again hits the decoded buffer, not the server
        session.set_convolver_enabled(false).await;
        session.set_convolver_enabled(true).await;

        assert!(session.snapshot().convolver.impulse_buffer.is_some());
    }
}

// =============================================================================
// Directory Catalog Tests
// =============================================================================

mod directory_catalog {
    use super::*;

    fn populated_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plate.irs"), wav_bytes(48000, 2, 32)).unwrap();
        fs::write(dir.path().join("hall.irs"), wav_bytes(48000, 2, 32)).unwrap();
        fs::write(dir.path().join("notes.txt"), b"not an impulse").unwrap();
        fs::create_dir(dir.path().join("nested.irs")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_lists_sorted_irs_files_under_prefix() {
        let dir = populated_dir();
        let catalog = DirectoryIrCatalog::new(dir.path(), "/eq/irs/");

        let ids = catalog.list().await.unwrap();

        assert_eq!(ids, vec!["/eq/irs/hall.irs", "/eq/irs/plate.irs"]);
    }

    #[tokio::test]
    async fn test_fetch_by_listed_id() {
        let dir = populated_dir();
        let catalog = DirectoryIrCatalog::new(dir.path(), "/eq/irs/");

        let bytes = catalog.fetch("/eq/irs/hall.irs").await.unwrap();
        assert_eq!(bytes, wav_bytes(48000, 2, 32));
    }

    #[tokio::test]
    async fn test_missing_file_is_unknown() {
        let dir = populated_dir();
        let catalog = DirectoryIrCatalog::new(dir.path(), "/eq/irs/");

        assert!(matches!(
            catalog.fetch("/eq/irs/room.irs").await,
            Err(EffectsError::UnknownImpulseResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_path_escapes_are_rejected() {
        let dir = populated_dir();
        let catalog = DirectoryIrCatalog::new(dir.path(), "/eq/irs/");

        for id in ["/eq/irs/../secret.irs", "/eq/irs/..", "/eq/irs/"] {
            assert!(
                matches!(
                    catalog.fetch(id).await,
                    Err(EffectsError::UnknownImpulseResponse(_))
                ),
                "{id} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_directory_fails_listing() {
        let catalog = DirectoryIrCatalog::new("/definitely/not/here", "/eq/irs/");
        assert!(matches!(catalog.list().await, Err(EffectsError::Io(_))));
    }
}

// =============================================================================
// Decode Cache Tests
// =============================================================================

mod decode_cache {
    use super::*;

    #[tokio::test]
    async fn test_second_load_served_from_cache() {
        let wav = wav_bytes(48000, 2, 128);
        let mut catalog = MockCatalog::new();
        catalog
            .expect_fetch()
            .withf(|id| id == "/eq/irs/hall.irs")
            .times(1)
            .returning(move |_| Ok(wav.clone()));

        let cache = ImpulseResponseCache::new(4);
        let first = ir::load_impulse_response(&catalog, &cache, "/eq/irs/hall.irs", 48000)
            .await
            .unwrap();
        let second = ir::load_impulse_response(&catalog, &cache, "/eq/irs/hall.irs", 48000)
            .await
            .unwrap();

        assert!(std::sync::Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_is_part_of_the_key() {
        let wav = wav_bytes(44100, 1, 441);
        let mut catalog = MockCatalog::new();
        catalog
            .expect_fetch()
            .times(2)
            .returning(move |_| Ok(wav.clone()));

        let cache = ImpulseResponseCache::new(4);
        let at_44 = ir::load_impulse_response(&catalog, &cache, "/ir.irs", 44100)
            .await
            .unwrap();
        let at_48 = ir::load_impulse_response(&catalog, &cache, "/ir.irs", 48000)
            .await
            .unwrap();

        assert_eq!(at_44.sample_rate(), 44100);
        assert_eq!(at_48.sample_rate(), 48000);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_least_recent_entry_evicted() {
        let wav = wav_bytes(48000, 1, 16);
        let mut catalog = MockCatalog::new();
        catalog
            .expect_fetch()
            .returning(move |_| Ok(wav.clone()));

        let cache = ImpulseResponseCache::new(2);
        for id in ["/a.irs", "/b.irs", "/c.irs"] {
            ir::load_impulse_response(&catalog, &cache, id, 48000)
                .await
                .unwrap();
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get("/a.irs", 48000).is_none());
        assert!(cache.get("/c.irs", 48000).is_some());
    }

    #[tokio::test]
    async fn test_undecodable_bytes_are_not_cached() {
        let mut catalog = MockCatalog::new();
        catalog
            .expect_fetch()
            .returning(|_| Ok(b"RIFF but not really".to_vec()));

        let cache = ImpulseResponseCache::new(2);
        let result = ir::load_impulse_response(&catalog, &cache, "/bad.irs", 48000).await;

        assert!(matches!(result, Err(EffectsError::Audio(_))));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_errors_propagate() {
        let mut catalog = MockCatalog::new();
        catalog
            .expect_fetch()
            .returning(|id| Err(EffectsError::UnknownImpulseResponse(id.to_string())));

        let cache = ImpulseResponseCache::new(2);
        let result = ir::load_impulse_response(&catalog, &cache, "/gone.irs", 48000).await;
        assert!(matches!(
            result,
            Err(EffectsError::UnknownImpulseResponse(_))
        ));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod from_config {
    use super::*;

    fn settings() -> CatalogSettings {
        test_config().catalog
    }

    #[test]
    fn test_nothing_configured() {
        assert!(ir::catalog_from_config(&settings()).unwrap().is_none());
    }

    #[test]
    fn test_directory_configured() {
        let mut settings = settings();
        settings.directory = Some("/srv/irs".into());
        assert!(ir::catalog_from_config(&settings).unwrap().is_some());
    }

    #[test]
    fn test_bad_url_is_an_error() {
        let mut settings = settings();
        settings.base_url = Some("mailto:someone".to_string());
        assert!(ir::catalog_from_config(&settings).is_err());
    }
}
