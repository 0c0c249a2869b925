//! # MQTT Relay Gateway
//!
//! Bridges HTTP clients and an MQTT broker:
//!
//! - **Publish**: `POST /sendMessage` opens a broker connection, publishes one
//!   JSON message and disconnects
//! - **Stream**: `GET /messages` holds a dedicated subscription per client and
//!   forwards every broker message as a Server-Sent Event
//! - **Background consumer**: one long-lived subscription with bounded retry,
//!   buffering messages for `GET /subscriber/messages`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Request ID → Trace → CORS → Body Limit)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (relay, consumer, health)                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Services (Publisher, Stream, BackgroundConsumer)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Broker / BrokerConnection (ConnectionGuard, RetryPolicy)   │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  MqttBroker (rumqttc, TCP)   │  MemoryBroker (in-process)   │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mqtt_relay::{AppState, Config, broker::build_broker, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let broker = build_broker(&config);
//!
//!     let state = AppState::new(broker, config.clone());
//!     let app = build_router(state.clone());
//!
//!     let listener = tokio::net::TcpListener::bind(config.server_addr()).await?;
//!     axum::serve(listener, app).await?;
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Run without a broker:
//! ```bash
//! BROKER_KIND=memory cargo run
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use broker::{Broker, BrokerConnection, MemoryBroker, MqttBroker};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use state::AppState;
