//! SQLite store tests

use std::collections::BTreeMap;

use chrono::Utc;

use deckhand::deploy::fsm::{AppEvent, AppFsm, AppStatus};
use deckhand::models::app::{App, AppKind, ResourceLimits};
use deckhand::models::deployment::{Deployment, DeploymentStatus, SourceKind};
use deckhand::storage::store::{snapshot_app_statuses, SqliteStore, StateStore};

fn app(name: &str, host_port: u16) -> App {
    App {
        id: format!("id-{}", name),
        name: name.to_string(),
        kind: AppKind::Container,
        status: AppStatus::Pending,
        domain: Some(format!("{}.example.com", name)),
        aliases: vec![format!("www.{}.example.com", name)],
        image: None,
        env: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
        port: Some(8080),
        host_port: Some(host_port),
        resources: ResourceLimits {
            memory_mb: Some(256),
            cpus: Some(0.5),
        },
        volumes: BTreeMap::new(),
        services: Vec::new(),
        health_check: None,
        ssl: true,
        expose: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn finished(mut deployment: Deployment, image: &str) -> Deployment {
    deployment.image = Some(image.to_string());
    deployment.status = DeploymentStatus::Deployed;
    deployment.finished_at = Some(Utc::now());
    deployment
}

#[test]
fn test_app_persistence() {
    let store = SqliteStore::open_in_memory().unwrap();
    let blog = app("blog", 20000);
    store.insert_app(&blog).unwrap();

    let loaded = store.get_app("blog").unwrap().unwrap();
    assert_eq!(loaded.id, blog.id);
    assert_eq!(loaded.env, blog.env);
    assert_eq!(loaded.aliases, blog.aliases);
    assert_eq!(loaded.resources, blog.resources);
    assert!(loaded.ssl);
    assert!(store.get_app("nope").unwrap().is_none());

    assert!(store.insert_app(&blog).is_err());
}

#[test]
fn test_hostnames_and_ports() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.next_host_port(20000).unwrap(), 20000);

    let blog = app("blog", 20000);
    store.insert_app(&blog).unwrap();
    assert_eq!(store.next_host_port(20000).unwrap(), 20001);

    assert!(store.hostname_in_use("blog.example.com", None).unwrap());
    assert!(store.hostname_in_use("www.blog.example.com", None).unwrap());
    assert!(!store.hostname_in_use("blog.example.com", Some(blog.id.as_str())).unwrap());
    assert!(!store.hostname_in_use("shop.example.com", None).unwrap());
}

#[test]
fn test_transitions_are_persisted() {
    let store = SqliteStore::open_in_memory().unwrap();
    let blog = app("blog", 20000);
    store.insert_app(&blog).unwrap();

    let transition = AppFsm::transition(blog.status, &AppEvent::DeployAccepted).unwrap();
    store.apply_transition(&blog.id, &transition).unwrap();
    assert_eq!(store.get_app("blog").unwrap().unwrap().status, AppStatus::Building);
}

#[test]
fn test_activation_and_demotion() {
    let store = SqliteStore::open_in_memory().unwrap();
    let blog = app("blog", 20000);
    store.insert_app(&blog).unwrap();

    let first = Deployment::new(&blog.id, SourceKind::Image, Some("ghost:5".to_string()));
    store.insert_deployment(&first).unwrap();
    let first = finished(first, "ghost:5");
    store.finish_deployment(&first).unwrap();
    store.activate_deployment(&blog.id, &first.id, false).unwrap();

    let second = Deployment::new(&blog.id, SourceKind::Image, Some("ghost:6".to_string()));
    store.insert_deployment(&second).unwrap();
    let second = finished(second, "ghost:6");
    store.finish_deployment(&second).unwrap();
    store.activate_deployment(&blog.id, &second.id, false).unwrap();

    let active = store.active_deployment(&blog.id).unwrap().unwrap();
    assert_eq!(active.id, second.id);
    assert_eq!(
        store.get_app("blog").unwrap().unwrap().image.as_deref(),
        Some("ghost:6")
    );

    // Rolling back demotes the deployment it replaces
    store.activate_deployment(&blog.id, &first.id, true).unwrap();
    let listed = store.list_deployments(&blog.id).unwrap();
    assert_eq!(listed[0].id, first.id);
    assert!(listed[0].active);
    assert_eq!(listed[1].status, DeploymentStatus::RolledBack);
    assert!(!listed[1].active);
}

#[test]
fn test_finish_rejects_building_status() {
    let store = SqliteStore::open_in_memory().unwrap();
    let blog = app("blog", 20000);
    store.insert_app(&blog).unwrap();

    let deployment = Deployment::new(&blog.id, SourceKind::Upload, None);
    store.insert_deployment(&deployment).unwrap();
    assert!(store.finish_deployment(&deployment).is_err());
}

#[test]
fn test_logs_append_in_order_and_cascade() {
    let store = SqliteStore::open_in_memory().unwrap();
    let blog = app("blog", 20000);
    store.insert_app(&blog).unwrap();
    let deployment = Deployment::new(&blog.id, SourceKind::Upload, None);
    store.insert_deployment(&deployment).unwrap();

    store.append_log(&deployment.id, b"step 1\n").unwrap();
    store.append_log(&deployment.id, b"").unwrap();
    store.append_log(&deployment.id, b"step 2\n").unwrap();
    assert_eq!(store.read_log(&deployment.id).unwrap(), b"step 1\nstep 2\n".to_vec());

    assert!(store.delete_app(&blog.id).unwrap());
    assert!(store.get_deployment(&deployment.id).unwrap().is_none());
    assert!(store.read_log(&deployment.id).unwrap().is_empty());
}

#[test]
fn test_snapshot_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("deckhand.db")).unwrap();
    store.insert_app(&app("blog", 20000)).unwrap();

    let snapshot = dir.path().join("snapshot.sqlite");
    store.snapshot_to(&snapshot).unwrap();
    assert_eq!(
        snapshot_app_statuses(&snapshot).unwrap(),
        vec![("blog".to_string(), AppStatus::Pending)]
    );

    store.insert_app(&app("shop", 20001)).unwrap();
    store.restore_from(&snapshot).unwrap();

    let names: Vec<String> = store.list_apps().unwrap().into_iter().map(|a| a.name).collect();
    assert_eq!(names, vec!["blog".to_string()]);
}
