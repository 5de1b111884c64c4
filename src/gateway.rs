//! Gateway daemon
//!
//! Constructs process-wide state in dependency order (config, stores, auth
//! pool, providers, channels, scheduler, RPC listener), pumps inbound
//! envelopes from channels through routing and admission into lanes, and
//! tears everything down in reverse with a drain deadline on shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::agent::AgentRunner;
use crate::cancel::CancelToken;
use crate::channels::{ChannelPlugin as _, ChannelRegistry, SecurityAdapter as _};
use crate::config::{Config, ConfigHandle, DmPolicy};
use crate::cron::CronService;
use crate::events::{EventBus, GatewayEvent};
use crate::llm::http::HttpProvider;
use crate::llm::ProviderRegistry;
use crate::media::MediaStore;
use crate::nodes::NodeRegistry;
use crate::outbound::{DeliveryRequest, OutboundDeliverer};
use crate::providers::store::ProfileStore;
use crate::providers::{AuthProfile, AuthProfilePool};
use crate::routing::{ChatKind, Envelope};
use crate::rpc::{GatewayState, LogBuffer};
use crate::scheduler::LaneScheduler;
use crate::security::device::DeviceRegistry;
use crate::security::PairingManager;
use crate::session::store::SessionStore;
use crate::skills::SkillRegistry;
use crate::tools::{ApprovalBroker, ToolRegistry};
use crate::Result;

/// Emoji acknowledging receipt of an inbound message
const ACK_REACTION: &str = "👀";

/// How long in-flight runs get to drain on shutdown
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Media GC cadence
const MEDIA_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Inbound queue depth between channels and the ingest loop
const INBOUND_QUEUE: usize = 256;

/// The assembled gateway process
pub struct Gateway {
    state: Arc<GatewayState>,
    media: Arc<MediaStore>,
    pairing: Arc<PairingManager>,
    inbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: mpsc::Receiver<Envelope>,
    shutdown: CancelToken,
}

impl Gateway {
    /// Build the gateway from a validated config. Channels are registered
    /// by the caller; everything else is constructed here.
    ///
    /// # Errors
    ///
    /// Returns an error when any store cannot be opened.
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        channels: ChannelRegistry,
        tools: ToolRegistry,
    ) -> Result<Self> {
        let data_dir = config.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;

        let config_handle = ConfigHandle::new(config);
        let snapshot = config_handle.snapshot();

        // Stores first; everything else hangs off them
        let sessions = Arc::new(SessionStore::open(data_dir.join("sessions"))?);
        let media = Arc::new(MediaStore::open(
            data_dir.join("media"),
            snapshot.media.clone(),
        )?);

        let profiles: Vec<AuthProfile> = snapshot
            .providers
            .iter()
            .map(|p| AuthProfile {
                id: p.id.clone(),
                provider: p.provider.clone(),
                api_key: p.api_key.clone(),
                base_url: p.base_url.clone(),
                state: crate::providers::ProfileState::default(),
            })
            .collect();
        let pool = Arc::new(AuthProfilePool::new(
            profiles,
            Some(ProfileStore::new(data_dir.join("auth-profiles.json"))),
        ));

        // One HTTP provider per distinct provider name in the pool
        let mut providers = ProviderRegistry::new();
        let llm_timeout = Duration::from_secs(snapshot.limits.llm_timeout_secs);
        for name in pool.providers()? {
            providers.register(Arc::new(HttpProvider::new(name, llm_timeout)?));
        }

        let bus = Arc::new(EventBus::new());
        let approvals = Arc::new(ApprovalBroker::new());
        let deliverer = Arc::new(OutboundDeliverer::new(
            channels.clone(),
            Duration::from_secs(snapshot.limits.channel_send_timeout_secs),
        ));

        let skills = Arc::new(SkillRegistry::new());
        match skills.scan(&snapshot.skill_dirs) {
            Ok(count) if count > 0 => tracing::info!(count, "skills discovered"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "skill scan failed"),
        }

        let runner = Arc::new(AgentRunner {
            config: config_handle.clone(),
            sessions: Arc::clone(&sessions),
            pool: Arc::clone(&pool),
            providers: providers.clone(),
            tools,
            bus: Arc::clone(&bus),
            deliverer: Arc::clone(&deliverer),
            approvals: Arc::clone(&approvals),
            skills: Arc::clone(&skills),
        });
        let scheduler = LaneScheduler::new(runner, config_handle.clone());

        let cron = Arc::new(CronService::open(data_dir.join("cron.json"))?);
        let nodes = Arc::new(NodeRegistry::open(
            data_dir.join("nodes.json"),
            data_dir.join("node-pairing.json"),
        )?);
        let devices = Arc::new(DeviceRegistry::open(data_dir.join("devices.json"))?);
        let pairing = Arc::new(PairingManager::open(data_dir.join("paired-peers.json"))?);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let state = Arc::new(GatewayState {
            config: config_handle,
            config_path,
            sessions,
            scheduler,
            pool,
            providers,
            channels,
            deliverer,
            bus,
            approvals,
            cron,
            skills,
            nodes,
            devices,
            started_at: Utc::now(),
            logs: LogBuffer::new(),
        });

        Ok(Self {
            state,
            media,
            pairing,
            inbound_tx,
            inbound_rx,
            shutdown: CancelToken::new(),
        })
    }

    /// Shared state handle, for embedding and tests
    #[must_use]
    pub fn state(&self) -> Arc<GatewayState> {
        Arc::clone(&self.state)
    }

    /// Inbound sink handed to channels started outside [`Gateway::run`]
    #[must_use]
    pub fn inbound_sink(&self) -> mpsc::Sender<Envelope> {
        self.inbound_tx.clone()
    }

    /// Token that stops the gateway when cancelled
    #[must_use]
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token fires or ctrl-c arrives.
    ///
    /// # Errors
    ///
    /// Returns an error when startup fails; runtime errors are logged and
    /// survived where possible.
    pub async fn run(mut self) -> Result<()> {
        let state = Arc::clone(&self.state);
        state.logs.push("gateway starting");

        // Start order: scheduler, cron, channels, media sweep, rpc
        state.scheduler.start();
        Arc::clone(&state.cron).start(state.scheduler.clone());
        state.channels.start_all(&self.inbound_tx).await?;

        let sweep_media = Arc::clone(&self.media);
        let sweep_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(MEDIA_SWEEP_INTERVAL) => {
                        if let Err(e) = sweep_media.sweep_expired() {
                            tracing::warn!(error = %e, "media sweep failed");
                        }
                    }
                    () = sweep_shutdown.cancelled() => return,
                }
            }
        });

        // One tick loop for the whole process; the bus stamps each
        // connection's own sequence numbers
        let tick_state = Arc::clone(&state);
        let tick_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let every = Duration::from_millis(
                tick_state.config.snapshot().rpc.tick_interval_ms.max(1000),
            );
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tick_state.bus.publish(GatewayEvent::Tick { now: Utc::now() });
                    }
                    () = tick_shutdown.cancelled() => return,
                }
            }
        });

        let rpc_state = Arc::clone(&state);
        let rpc_shutdown = self.shutdown.clone();
        let rpc_task = tokio::spawn(async move {
            if let Err(e) = crate::rpc::server::serve(rpc_state, rpc_shutdown).await {
                tracing::error!(error = %e, "rpc listener failed");
            }
        });

        let ctrlc_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
                ctrlc_shutdown.cancel();
            }
        });

        state.logs.push("gateway running");
        tracing::info!(port = state.config.snapshot().rpc.port, "gateway running");

        // Ingest loop: channels → routing → admission → lanes
        loop {
            tokio::select! {
                envelope = self.inbound_rx.recv() => match envelope {
                    Some(envelope) => self.ingest(envelope).await,
                    None => break,
                },
                () = self.shutdown.cancelled() => break,
            }
        }

        // Teardown in reverse: announce, drain runs, stop channels
        tracing::info!("gateway shutting down");
        state.bus.publish(GatewayEvent::Shutdown {
            restart_expected_ms: None,
        });

        let drain_started = tokio::time::Instant::now();
        while !state.scheduler.active_run_ids().is_empty()
            && drain_started.elapsed() < DRAIN_DEADLINE
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        state.scheduler.shutdown();
        state.channels.stop_all().await;
        rpc_task.abort();
        state.logs.push("gateway stopped");
        tracing::info!("gateway stopped");
        Ok(())
    }

    /// One envelope through normalization, routing and admission
    async fn ingest(&self, mut envelope: Envelope) {
        let state = &self.state;

        // Channel-supplied normalization and echo suppression
        if let Some(channel) = state.channels.get(&envelope.channel) {
            if let Some(security) = channel.security() {
                if security.is_self(&envelope.peer) {
                    return;
                }
                envelope.peer = security.normalize_peer(&envelope.peer);
                envelope.account = security.normalize_peer(&envelope.account);
            }
        }

        let decision = crate::routing::resolve(&envelope, &state.config.snapshot());

        if let Some(reason) = decision.policy.blocked {
            // Silent discard: a diagnostic log line, never a user-visible
            // error that could probe the policy
            tracing::info!(
                channel = %envelope.channel,
                peer = %envelope.peer,
                reason = ?reason,
                "envelope blocked by policy"
            );
            state.logs.push(format!(
                "blocked {} from {}: {reason:?}",
                envelope.channel, envelope.peer
            ));
            return;
        }

        // Pairing admission needs live state, so it happens here
        if decision.policy.dm == DmPolicy::Pairing
            && envelope.chat_kind == ChatKind::Dm
            && !self.pairing.is_paired(&envelope.channel, &envelope.peer)
        {
            self.handle_pairing(&envelope).await;
            return;
        }

        // Receipt feedback before the run starts
        if let Some(message_id) = envelope.reply_to.clone() {
            state
                .deliverer
                .ack_reaction(
                    &envelope.channel,
                    &envelope.account,
                    &envelope.peer,
                    &message_id,
                    ACK_REACTION,
                )
                .await;
        }
        state
            .deliverer
            .typing(&envelope.channel, &envelope.account, &envelope.peer)
            .await;

        if let Err(e) = state.scheduler.enqueue(&decision.session_key, envelope) {
            tracing::error!(error = %e, session = %decision.session_key, "enqueue failed");
        }
    }

    /// Code-based pairing exchange for unknown peers
    async fn handle_pairing(&self, envelope: &Envelope) {
        let trimmed = envelope.text.trim();
        let looks_like_code =
            trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_digit());

        if looks_like_code {
            match self
                .pairing
                .verify(&envelope.channel, &envelope.peer, trimmed)
            {
                Ok(true) => {
                    self.send_pairing_text(
                        envelope,
                        "Pairing successful. You can start chatting now.",
                    )
                    .await;
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(error = %e, "pairing verification failed");
                    return;
                }
            }
        }

        match self.pairing.begin(&envelope.channel, &envelope.peer) {
            Ok(Some(code)) => {
                self.send_pairing_text(
                    envelope,
                    &format!(
                        "Enter this pairing code to start chatting: {code}\n(expires in 10 minutes)"
                    ),
                )
                .await;
            }
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "pairing code issue failed"),
        }
    }

    async fn send_pairing_text(&self, envelope: &Envelope, text: &str) {
        let result = self
            .state
            .deliverer
            .deliver(DeliveryRequest {
                channel: envelope.channel.clone(),
                account: envelope.account.clone(),
                target: envelope.peer.clone(),
                text: text.to_string(),
                media: Vec::new(),
                reply_to: envelope.reply_to.clone(),
                delivery_key: format!(
                    "pairing:{}:{}:{}",
                    envelope.channel,
                    envelope.peer,
                    envelope.timestamp.timestamp_millis()
                ),
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "pairing message send failed");
        }
    }
}
