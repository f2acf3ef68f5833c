mod common;

mod test_backup;
mod test_health;
mod test_routes;
mod test_server;
mod test_store;
