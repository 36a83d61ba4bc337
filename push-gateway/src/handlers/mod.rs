/// JSON control API
///
/// Thin HTTP surface over the store and the dispatch engine; all state
/// lives behind those. Responses follow the `{success, ...}` envelope.
pub mod devices;
pub mod messages;

use actix_web::web;

/// Mount every control route on `cfg`.
pub fn register_routes(cfg: &mut web::ServiceConfig) {
    devices::register_routes(cfg);
    messages::register_routes(cfg);
}
