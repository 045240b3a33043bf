pub mod config;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod registry;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod telemetry;
pub mod tls;
pub mod token;

pub use config::Config;
pub use error::ServerError;
pub use server::{RunningServer, start};
