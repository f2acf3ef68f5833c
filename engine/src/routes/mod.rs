//! Route derivation and synchronization

pub mod syncer;

pub use syncer::RouteSyncer;

use crate::models::app::App;
use crate::proxy::Route;
use crate::runtime;

/// Proxy route id of an app
pub fn route_id(app: &str) -> String {
    runtime::container_name(app)
}

/// `<name>.<base_domain>`, used by apps without a domain of their own
pub fn generated_host(app: &str, base_domain: Option<&str>) -> Option<String> {
    base_domain
        .filter(|base| !base.is_empty())
        .map(|base| format!("{}.{}", app, base))
}

/// The route an app should have, or `None` if it should have none.
///
/// Apps get a route when exposed, published on a host port, and reachable by
/// a hostname: their own domain or `<name>.<base_domain>`.
pub fn desired_route(app: &App, base_domain: Option<&str>) -> Option<Route> {
    if !app.expose {
        return None;
    }
    let host_port = app.host_port?;

    let primary = match &app.domain {
        Some(domain) => domain.clone(),
        None => generated_host(&app.name, base_domain)?,
    };

    let mut hosts = vec![primary];
    for alias in &app.aliases {
        if !hosts.contains(alias) {
            hosts.push(alias.clone());
        }
    }

    Some(Route {
        id: route_id(&app.name),
        hosts,
        upstream: format!("127.0.0.1:{}", host_port),
        tls: app.ssl,
    })
}
