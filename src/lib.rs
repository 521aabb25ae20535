// reauth-proxy - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod log_buffer;
pub mod message;
pub mod middleware;
pub mod observer;
pub mod routes;
pub mod scope;
pub mod url_compare;
