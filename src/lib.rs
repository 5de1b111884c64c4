//! Switchboard - local-first gateway between messaging channels and AI agents
//!
//! One process multiplexes many transports onto a pool of agents running a
//! Think–Tool–Act loop against LLM providers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Transports                        │
//! │   Chat platforms  │  Voice bridges  │  Web clients  │
//! └────────────────────┬────────────────────────────────┘
//!                      │  channel plugins (capability adapters)
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Switchboard                        │
//! │  Routing │ Lanes │ Agent runner │ Event bus │ RPC   │
//! └────────────────────┬────────────────────────────────┘
//!                      │  auth-profile pool
//! ┌────────────────────▼────────────────────────────────┐
//! │                 LLM providers                        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod cancel;
pub mod channels;
pub mod config;
pub mod context;
pub mod cron;
pub mod error;
pub mod events;
pub mod gateway;
pub mod llm;
pub mod media;
pub mod nodes;
pub mod outbound;
pub mod providers;
pub mod routing;
pub mod rpc;
pub mod scheduler;
pub mod security;
pub mod session;
pub mod skills;
pub mod tools;

pub use cancel::CancelToken;
pub use config::{Config, ConfigHandle};
pub use error::{Error, ErrorBody, ErrorCode, Result};
pub use gateway::Gateway;
pub use routing::{ChatKind, Envelope, resolve};
pub use session::{SessionKey, SessionScope};
