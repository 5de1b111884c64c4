//! RPC surface
//!
//! Frame-oriented JSON over WebSocket: validation, method routing with
//! per-method scope checks, event fan-out and heartbeat.

pub mod frames;
pub mod methods;
pub mod server;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::channels::ChannelRegistry;
use crate::config::ConfigHandle;
use crate::cron::CronService;
use crate::events::EventBus;
use crate::llm::ProviderRegistry;
use crate::nodes::NodeRegistry;
use crate::outbound::OutboundDeliverer;
use crate::providers::AuthProfilePool;
use crate::scheduler::LaneScheduler;
use crate::security::device::DeviceRegistry;
use crate::session::store::SessionStore;
use crate::skills::SkillRegistry;
use crate::tools::ApprovalBroker;

/// Retained log lines for `logs.tail`
const LOG_BUFFER_CAPACITY: usize = 500;

/// In-memory ring of recent gateway log lines
#[derive(Default)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<(DateTime<Utc>, String)>>,
}

impl LogBuffer {
    /// Empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line, evicting the oldest past capacity
    pub fn push(&self, line: impl Into<String>) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() >= LOG_BUFFER_CAPACITY {
                lines.pop_front();
            }
            lines.push_back((Utc::now(), line.into()));
        }
    }

    /// Last `limit` lines, oldest first
    #[must_use]
    pub fn tail(&self, limit: usize) -> Vec<(DateTime<Utc>, String)> {
        self.lines
            .lock()
            .map(|lines| {
                let skip = lines.len().saturating_sub(limit);
                lines.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }
}

/// Everything the method handlers reach
pub struct GatewayState {
    pub config: ConfigHandle,
    /// Config file backing `config.apply`, when loaded from disk
    pub config_path: Option<PathBuf>,
    pub sessions: Arc<SessionStore>,
    pub scheduler: LaneScheduler,
    pub pool: Arc<AuthProfilePool>,
    pub providers: ProviderRegistry,
    pub channels: ChannelRegistry,
    pub deliverer: Arc<OutboundDeliverer>,
    pub bus: Arc<EventBus>,
    pub approvals: Arc<ApprovalBroker>,
    pub cron: Arc<CronService>,
    pub skills: Arc<SkillRegistry>,
    pub nodes: Arc<NodeRegistry>,
    pub devices: Arc<DeviceRegistry>,
    pub started_at: DateTime<Utc>,
    pub logs: LogBuffer,
}
