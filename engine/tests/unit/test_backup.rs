//! Backup and restore tests

use std::collections::BTreeMap;

use deckhand::deploy::fsm::AppStatus;
use deckhand::errors::{BackupStage, EngineError, ErrorKind};
use deckhand::models::app::{AppKind, AppSpec};
use deckhand::models::backup::{BackupOptions, RestoreOptions};

use crate::common::Harness;

fn only(f: impl FnOnce(&mut RestoreOptions)) -> RestoreOptions {
    let mut options = RestoreOptions::default();
    f(&mut options);
    options
}

#[tokio::test]
async fn test_create_registers_archive() {
    let h = Harness::new().await;
    h.create("blog").await;

    let backup = h.state.backups.create(BackupOptions::default()).await.unwrap();
    assert!(backup.path.is_file());
    assert!(backup.path.to_string_lossy().ends_with(".tar.gz"));
    assert!(backup.size_bytes > 0);
    assert!(backup.contents.database);
    assert!(backup.contents.config);
    assert!(backup.contents.volumes.is_empty());
    assert!(!backup.contents.builds);

    let listed = h.state.backups.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, backup.id);
    assert_eq!(listed[0].contents, backup.contents);

    // Staging is gone and nothing partial is left behind
    assert!(!h.layout().staging_dir().path().join(&backup.id).exists());
    let names = h.layout().backups_dir().list_names().await.unwrap();
    assert!(names.iter().all(|n| !n.ends_with(".partial")));
}

#[tokio::test]
async fn test_backup_ids_are_unique() {
    let h = Harness::new().await;
    let first = h.state.backups.create(BackupOptions::default()).await.unwrap();
    let second = h.state.backups.create(BackupOptions::default()).await.unwrap();
    assert_ne!(first.id, second.id);
    assert!(first.id < second.id);
}

#[tokio::test]
async fn test_backup_conflicts_with_cross_app_operation() {
    let h = Harness::new().await;
    let _ops = h.state.engine.locks().try_lock_cross_app("test").unwrap();

    let err = h.state.backups.create(BackupOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = h.state.engine.prune_images(1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_restore_database() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.deploy_image("blog", "ghost:5").await.unwrap();
    let backup = h.state.backups.create(BackupOptions::default()).await.unwrap();

    h.create("shop").await;
    assert_eq!(h.state.engine.list_apps().unwrap().len(), 2);

    let summary = h
        .state
        .backups
        .restore(&backup.id, only(|o| o.restore_database = true))
        .await
        .unwrap();
    assert!(summary.database_restored);
    assert_eq!(summary.restart_recommended, vec!["blog".to_string()]);

    let apps = h.state.engine.list_apps().unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].name, "blog");
    assert_eq!(apps[0].status, AppStatus::Running);

    // Backups survive a database restore, and the old database is kept aside
    assert_eq!(h.state.backups.list().unwrap().len(), 1);
    let kept_aside = std::fs::read_dir(h.dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .any(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("deckhand.db.pre-restore-")
        });
    assert!(kept_aside);
}

#[tokio::test]
async fn test_restore_database_conflicts_with_busy_app() {
    let h = Harness::new().await;
    h.create("blog").await;
    let backup = h.state.backups.create(BackupOptions::default()).await.unwrap();

    let _guard = h.state.engine.locks().try_lock_app("blog").unwrap();
    let err = h
        .state
        .backups
        .restore(&backup.id, RestoreOptions::all())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_restore_config_moves_current_aside() {
    let h = Harness::new().await;
    let settings = h.layout().settings_file();
    settings.write_bytes(br#"{"log_level":"debug"}"#).await.unwrap();
    let extra = h.layout().config_dir().file("caddy.json");
    extra.write_bytes(b"{\"v\":1}").await.unwrap();

    let backup = h.state.backups.create(BackupOptions::default()).await.unwrap();

    settings.write_bytes(br#"{"log_level":"error"}"#).await.unwrap();
    extra.write_bytes(b"{\"v\":2}").await.unwrap();

    let summary = h
        .state
        .backups
        .restore(&backup.id, only(|o| o.restore_config = true))
        .await
        .unwrap();
    assert_eq!(
        summary.config_restored,
        vec!["settings.json".to_string(), "config".to_string()]
    );
    assert!(!summary.database_restored);

    assert_eq!(settings.read_string().await.unwrap(), r#"{"log_level":"debug"}"#);
    assert_eq!(extra.read_string().await.unwrap(), "{\"v\":1}");

    let aside = std::fs::read_dir(h.dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .find(|n| n.starts_with("settings.json.bak-"))
        .unwrap();
    let previous = std::fs::read_to_string(h.dir.path().join(aside)).unwrap();
    assert_eq!(previous, r#"{"log_level":"error"}"#);
}

#[tokio::test]
async fn test_sites_and_volumes_round_trip() {
    let h = Harness::new().await;
    h.state
        .engine
        .create_app(AppSpec::new("docs", AppKind::StaticSite))
        .await
        .unwrap();
    let site = h.layout().site_dir("docs");
    site.create().await.unwrap();
    site.file("index.html").write_bytes(b"v1").await.unwrap();

    let mut spec = AppSpec::new("blog", AppKind::Container);
    spec.volumes = BTreeMap::from([("blog-data".to_string(), "/var/lib/ghost".to_string())]);
    h.state.engine.create_app(spec).await.unwrap();
    h.runtime.put_volume("blog-data", b"posts-v1");
    h.runtime.put_volume("unrelated", b"ignored");

    let backup = h
        .state
        .backups
        .create(BackupOptions {
            include_volumes: true,
            include_builds: false,
        })
        .await
        .unwrap();
    assert_eq!(backup.contents.sites, vec!["docs".to_string()]);
    assert_eq!(backup.contents.volumes, vec!["blog-data".to_string()]);

    site.file("index.html").write_bytes(b"v2").await.unwrap();
    h.runtime.put_volume("blog-data", b"posts-v2");

    let summary = h
        .state
        .backups
        .restore(
            &backup.id,
            only(|o| {
                o.restore_apps = true;
                o.restore_volumes = true;
            }),
        )
        .await
        .unwrap();
    assert_eq!(summary.apps_restored, vec!["docs".to_string()]);
    assert_eq!(summary.volumes_restored, vec!["blog-data".to_string()]);

    assert_eq!(site.file("index.html").read_string().await.unwrap(), "v1");
    assert_eq!(h.runtime.volume("blog-data").unwrap(), b"posts-v1".to_vec());

    // The replaced volume was exported first
    assert_eq!(summary.volumes_set_aside.len(), 1);
    let aside = &summary.volumes_set_aside[0];
    assert!(aside.starts_with(h.layout().volume_asides_dir().path()));
    assert!(aside
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("blog-data.tar.bak-"));
    assert_eq!(std::fs::read(aside).unwrap(), b"posts-v2".to_vec());
}

#[tokio::test]
async fn test_backup_without_volumes_leaves_volumes_alone() {
    let h = Harness::new().await;
    let mut spec = AppSpec::new("blog", AppKind::Container);
    spec.volumes = BTreeMap::from([("blog-data".to_string(), "/var/lib/ghost".to_string())]);
    h.state.engine.create_app(spec).await.unwrap();
    h.runtime.put_volume("blog-data", b"posts-v1");

    let backup = h.state.backups.create(BackupOptions::default()).await.unwrap();
    assert!(backup.contents.volumes.is_empty());

    h.runtime.put_volume("blog-data", b"posts-v2");
    let summary = h
        .state
        .backups
        .restore(&backup.id, only(|o| o.restore_volumes = true))
        .await
        .unwrap();

    assert!(summary.volumes_restored.is_empty());
    assert!(summary.volumes_set_aside.is_empty());
    assert_eq!(h.runtime.volume("blog-data").unwrap(), b"posts-v2".to_vec());
}

#[tokio::test]
async fn test_full_round_trip_restores_config_byte_for_byte() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.deploy_image("blog", "ghost:5").await.unwrap();

    let settings = h.layout().settings_file();
    let original_settings = b"{\n  \"log_level\": \"debug\"\n}\n".to_vec();
    settings.write_bytes(&original_settings).await.unwrap();
    let extra = h.layout().config_dir().file("caddy.json");
    let original_extra = vec![0x7b, 0x00, 0xff, 0x0a, 0x7d];
    extra.write_bytes(&original_extra).await.unwrap();

    let backup = h
        .state
        .backups
        .create(BackupOptions {
            include_volumes: true,
            include_builds: true,
        })
        .await
        .unwrap();

    settings.write_bytes(b"{}").await.unwrap();
    extra.delete().await.unwrap();
    h.create("shop").await;

    let summary = h
        .state
        .backups
        .restore(&backup.id, RestoreOptions::all())
        .await
        .unwrap();
    assert!(summary.database_restored);
    assert!(
        summary.warnings.iter().all(|w| !w.contains("missing")),
        "{:?}",
        summary.warnings
    );

    assert_eq!(std::fs::read(settings.path()).unwrap(), original_settings);
    assert_eq!(std::fs::read(extra.path()).unwrap(), original_extra);

    let names: Vec<String> = h
        .state
        .engine
        .list_apps()
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec!["blog".to_string()]);
}

#[tokio::test]
async fn test_restore_corrupt_archive_fails_at_extract() {
    let h = Harness::new().await;
    let backup = h.state.backups.create(BackupOptions::default()).await.unwrap();
    std::fs::write(&backup.path, b"not a tarball").unwrap();

    let err = h
        .state
        .backups
        .restore(&backup.id, RestoreOptions::all())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RestoreFailed {
            stage: BackupStage::Extract,
            ..
        }
    ));
}

#[tokio::test]
async fn test_delete_backup() {
    let h = Harness::new().await;
    let backup = h.state.backups.create(BackupOptions::default()).await.unwrap();

    let warnings = h.state.backups.delete(&backup.id).await.unwrap();
    assert!(warnings.is_empty());
    assert!(!backup.path.exists());
    assert!(h.state.backups.list().unwrap().is_empty());

    let err = h.state.backups.delete(&backup.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h
        .state
        .backups
        .restore(&backup.id, RestoreOptions::all())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_delete_backup_with_missing_archive_warns() {
    let h = Harness::new().await;
    let backup = h.state.backups.create(BackupOptions::default()).await.unwrap();
    std::fs::remove_file(&backup.path).unwrap();

    let warnings = h.state.backups.delete(&backup.id).await.unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(h.state.backups.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_stale_leftovers() {
    let h = Harness::new().await;
    h.layout().staging_dir().subdir("20260101-000000-000").create().await.unwrap();
    h.layout()
        .backups_dir()
        .file("20260101-000000-000.tar.gz.partial")
        .write_bytes(b"half")
        .await
        .unwrap();

    assert_eq!(h.state.backups.sweep_stale().await.unwrap(), 2);
    assert_eq!(h.state.backups.sweep_stale().await.unwrap(), 0);
}
