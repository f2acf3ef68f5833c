//! Route derivation and sync tests

use deckhand::deploy::fsm::AppStatus;
use deckhand::routes::desired_route;

use crate::common::Harness;

#[tokio::test]
async fn test_desired_route_rules() {
    let h = Harness::new().await;
    let mut app = h.create("blog").await;

    assert!(desired_route(&app, None).is_none());
    let route = desired_route(&app, Some("apps.test")).unwrap();
    assert_eq!(route.hosts, vec!["blog.apps.test".to_string()]);
    assert!(!route.tls);

    app.domain = Some("blog.example.com".to_string());
    app.aliases = vec!["blog.example.com".to_string(), "www.blog.example.com".to_string()];
    app.ssl = true;
    let route = desired_route(&app, Some("apps.test")).unwrap();
    assert_eq!(
        route.hosts,
        vec!["blog.example.com".to_string(), "www.blog.example.com".to_string()]
    );
    assert!(route.tls);

    app.expose = false;
    assert!(desired_route(&app, Some("apps.test")).is_none());

    app.expose = true;
    app.host_port = None;
    assert!(desired_route(&app, Some("apps.test")).is_none());
}

#[tokio::test]
async fn test_proxy_outage_does_not_fail_deploy() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.proxy.set_down(true);

    h.deploy_image("blog", "ghost:5").await.unwrap();
    assert_eq!(h.app("blog").status, AppStatus::Running);
    assert!(h.proxy.route("deckhand-blog").is_none());
    assert_eq!(h.state.engine.routes().pending(), vec!["blog".to_string()]);

    // The next sweep retries the push
    h.proxy.set_down(false);
    h.state.monitor.sweep().await.unwrap();
    assert!(h.proxy.route("deckhand-blog").is_some());
    assert!(h.state.engine.routes().pending().is_empty());
}

#[tokio::test]
async fn test_pending_removal_is_retried() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.deploy_image("blog", "ghost:5").await.unwrap();
    assert!(h.proxy.route("deckhand-blog").is_some());

    h.proxy.set_down(true);
    h.state.engine.delete_app("blog").await.unwrap();
    assert_eq!(h.state.engine.routes().pending(), vec!["blog".to_string()]);

    h.proxy.set_down(false);
    h.state.engine.routes().retry_pending(h.store.as_ref()).await.unwrap();
    assert!(h.proxy.route("deckhand-blog").is_none());
    assert!(h.state.engine.routes().pending().is_empty());
}

#[tokio::test]
async fn test_recover_resyncs_routes() {
    let h = Harness::new().await;
    h.create("blog").await;
    h.create("idle").await;
    h.proxy.set_down(true);
    h.deploy_image("blog", "ghost:5").await.unwrap();
    h.proxy.set_down(false);

    h.state.recover().await.unwrap();
    assert!(h.proxy.route("deckhand-blog").is_some());
    assert!(h.proxy.route("deckhand-idle").is_none());
}
