pub mod http;
pub mod router;
pub mod server;
