//! The worker supervisor.
//!
//! Builds every component in leaf-to-root order, wires the channels,
//! runs the tick loops (command poll, retry sweep, health heartbeat, TTL
//! cleanup, persistence debounce), and drives signal-initiated graceful
//! shutdown: close subscriptions, flush the retry queue and relay stats,
//! remove the PID and health files, exit cleanly.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use pulse_groups::history::GroupHistory;
use pulse_groups::manager::GroupManager;
use pulse_relay::pool::{new_shared_health, now_ms, PoolConfig, RelayPool};
use pulse_relay::session::IncomingEvent;
use pulse_store::message_log::MessageLog;
use pulse_store::paths::DataDir;
use pulse_store::storage_key;
use pulse_types::command::CommandResult;
use pulse_types::error::ErrorCode;
use pulse_types::event::Filter;
use pulse_types::message::QueuedKind;

use crate::bus::MessageBus;
use crate::config::DaemonConfig;
use crate::dispatch::{Dispatcher, WebhookSink};
use crate::health::Counters;
use crate::identity::Identity;
use crate::inbox::{append_results, CommandInbox};
use crate::retry::{DropReason, RetryQueue};
use crate::service;
use crate::{Result, WorkerError};

/// Everything the worker's tasks share.
pub struct WorkerContext {
    pub data: DataDir,
    pub config: DaemonConfig,
    pub identity: Identity,
    pub pool: RelayPool,
    pub groups: Arc<Mutex<GroupManager>>,
    pub history: GroupHistory,
    pub log: Arc<MessageLog>,
    pub retry: Mutex<RetryQueue>,
    pub counters: Arc<Counters>,
    /// Delivered-message fan-out for embedders.
    pub bus: MessageBus,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Sign, encrypt, and publish a direct message.
pub(crate) async fn publish_direct(
    ctx: &Arc<WorkerContext>,
    target_hex: &str,
    content: &str,
    now: i64,
) -> Result<()> {
    let event = crate::outbound::direct_event(
        ctx.identity.keypair(),
        target_hex,
        content,
        &ctx.config.primary_topic,
        now,
    )?;
    ctx.pool.publish(&event).await?;
    ctx.counters.incr(&ctx.counters.sent);
    Ok(())
}

/// Encrypt under the group key and publish to the topic.
pub(crate) async fn publish_group(
    ctx: &Arc<WorkerContext>,
    group_id: &str,
    topic: &str,
    content: &str,
    now: i64,
) -> Result<pulse_types::event::Event> {
    let event =
        crate::outbound::group_event(ctx.identity.keypair(), group_id, topic, content, now)?;
    ctx.pool.publish(&event).await?;
    ctx.counters.incr(&ctx.counters.sent);
    Ok(event)
}

/// Resolve the `(group_id, topic)` a queued group send republishes under.
///
/// Entries persisted before the `groupId` field existed fall back to the
/// topic.
pub(crate) fn group_send_args(entry: &pulse_types::message::QueuedMessage) -> (&str, &str) {
    let topic = entry.topic.as_deref().unwrap_or(&entry.target);
    let group_id = entry.group_id.as_deref().unwrap_or(topic);
    (group_id, topic)
}

/// One retry sweep: attempt every due entry, reschedule failures, surface
/// terminal drops as result records.
pub(crate) async fn retry_tick(ctx: &Arc<WorkerContext>) -> Vec<CommandResult> {
    let now = now_ms();
    let due = {
        let retry = ctx.retry.lock().unwrap_or_else(PoisonError::into_inner);
        retry.due(now)
    };

    let mut terminal = Vec::new();
    for entry in due {
        let outcome = match entry.kind {
            QueuedKind::Send => publish_direct(ctx, &entry.target, &entry.content, now).await,
            QueuedKind::GroupSend => {
                let (group_id, topic) = group_send_args(&entry);
                publish_group(ctx, group_id, topic, &entry.content, now)
                    .await
                    .map(|_| ())
            }
        };

        let mut retry = ctx.retry.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(()) => {
                debug!(id = %entry.id, "queued message delivered");
                retry.mark_delivered(&entry.id);
            }
            Err(e) => {
                if let Some(dropped) = retry.mark_failed(&entry.id, &e.to_string(), now) {
                    terminal.push(CommandResult::fail_with(
                        dropped.message.id.clone(),
                        ErrorCode::MessageRetryExhausted,
                        dropped
                            .message
                            .last_error
                            .unwrap_or_else(|| "retries exhausted".to_string()),
                        now,
                    ));
                }
            }
        }
    }

    let pending = {
        let retry = ctx.retry.lock().unwrap_or_else(PoisonError::into_inner);
        retry.len()
    };
    ctx.counters
        .set(&ctx.counters.pending_queue_size, pending as u64);
    terminal
}

/// One TTL sweep over the retry queue.
pub(crate) fn expiry_tick(ctx: &Arc<WorkerContext>) -> Vec<CommandResult> {
    let now = now_ms();
    let expired = {
        let mut retry = ctx.retry.lock().unwrap_or_else(PoisonError::into_inner);
        retry.expire(now)
    };
    expired
        .into_iter()
        .filter(|d| d.reason == DropReason::Expired)
        .map(|d| {
            CommandResult::fail_with(
                d.message.id,
                ErrorCode::MessageExpired,
                "expired before delivery",
                now,
            )
        })
        .collect()
}

/// Run the worker in the foreground until a stop signal.
pub async fn run(data: DataDir, config: DaemonConfig) -> Result<()> {
    data.ensure_created()?;
    service::claim_pid_file(&data)?;
    info!(pid = std::process::id(), root = %data.root().display(), "worker starting");

    // Leaves first: identity, storage, groups, queue.
    let identity = Identity::load_or_create(&data, config.ephemeral)?;
    let key = storage_key::load_or_create(&data)?;
    let log = Arc::new(MessageLog::new(data.messages_file(), key));
    let groups = Arc::new(Mutex::new(GroupManager::load(data.clone())?));
    let history = GroupHistory::new(data.clone());
    let retry = Mutex::new(RetryQueue::load(data.clone())?);
    let counters = Arc::new(Counters::default());

    // Relay layer.
    let health = match pulse_relay::health::HealthTracker::load(&data) {
        Ok(tracker) => Arc::new(Mutex::new(tracker)),
        Err(e) => {
            warn!(error = %e, "relay stats unreadable; starting fresh");
            new_shared_health()
        }
    };
    let (events_tx, events_rx) = mpsc::channel::<IncomingEvent>(256);
    let pool = RelayPool::new(
        PoolConfig {
            relays: config.relays.clone(),
            ..PoolConfig::default()
        },
        events_tx,
        health,
    );

    let (shutdown_tx, _) = broadcast::channel(4);
    let bus = MessageBus::default();
    let ctx = Arc::new(WorkerContext {
        data: data.clone(),
        config: config.clone(),
        identity,
        pool,
        groups,
        history,
        log,
        retry,
        counters,
        bus: bus.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });

    // Subscriptions: the primary topic plus every joined group.
    let now_secs = now_ms() / 1000;
    ctx.pool.subscribe(
        &config.primary_topic,
        Filter::for_topic(&config.primary_topic, now_secs),
    );
    {
        let groups = ctx.groups.lock().unwrap_or_else(PoisonError::into_inner);
        for group in groups.groups() {
            ctx.pool
                .subscribe(&group.topic, Filter::for_topic(&group.topic, now_secs));
        }
        ctx.counters
            .set(&ctx.counters.group_count, groups.len() as u64);
    }

    // Dispatcher task.
    let dispatcher = Dispatcher::new(
        ctx.identity.keypair().clone(),
        ctx.groups.clone(),
        ctx.history.clone(),
        ctx.log.clone(),
        ctx.counters.clone(),
        config.webhook().map(WebhookSink::new),
        bus,
    );
    let dispatcher_task = tokio::spawn(crate::dispatch::run(
        dispatcher,
        events_rx,
        shutdown_tx.subscribe(),
    ));

    // Presence announce, best effort.
    let announce_task = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let now = now_ms();
            match crate::outbound::announce_event(
                ctx.identity.keypair(),
                &ctx.config.primary_topic,
                &ctx.config.agent_name,
                now,
            ) {
                Ok(event) => {
                    if let Err(e) = ctx.pool.publish(&event).await {
                        debug!(error = %e, "startup announce not delivered");
                    }
                }
                Err(e) => debug!(error = %e, "startup announce build failed"),
            }
        })
    };

    let started = Instant::now();
    let mut inbox = CommandInbox::new(ctx.clone());
    let mut poll_tick = tokio::time::interval(config.poll_interval());
    let mut retry_tick_timer = tokio::time::interval(config.retry_interval());
    let mut health_tick = tokio::time::interval(config.health_interval());
    let mut expiry_tick_timer = tokio::time::interval(config.expiry_interval());
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    retry_tick_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    expiry_tick_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut shutdown_rx = shutdown_tx.subscribe();
    spawn_signal_forwarders(shutdown_tx.clone())?;

    info!(pubkey = ctx.identity.public_hex(), "worker ready");
    loop {
        tokio::select! {
            _ = poll_tick.tick() => {
                if let Err(e) = inbox.tick().await {
                    warn!(error = %e, "command tick failed");
                    ctx.counters.incr(&ctx.counters.errors);
                }
            }
            _ = retry_tick_timer.tick() => {
                let terminal = retry_tick(&ctx).await;
                if !terminal.is_empty() {
                    if let Err(e) = append_results(&ctx.data, terminal) {
                        warn!(error = %e, "terminal retry results not recorded");
                    }
                }
                let mut retry = ctx.retry.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = retry.maybe_flush() {
                    warn!(error = %e, "retry queue flush failed");
                }
            }
            _ = health_tick.tick() => {
                let stats = ctx.counters.stats();
                if let Err(e) = crate::health::write_snapshot(
                    &ctx.data,
                    started,
                    ctx.pool.is_connected(),
                    ctx.pool.connected_count(),
                    stats,
                    now_ms(),
                ) {
                    warn!(error = %e, "health snapshot failed");
                }
                if let Err(e) = ctx.pool.maybe_persist_health(&ctx.data) {
                    warn!(error = %e, "relay stats persist failed");
                }
            }
            _ = expiry_tick_timer.tick() => {
                let expired = expiry_tick(&ctx);
                if !expired.is_empty() {
                    if let Err(e) = append_results(&ctx.data, expired) {
                        warn!(error = %e, "expiry results not recorded");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    shutdown(ctx, dispatcher_task, announce_task).await;
    Ok(())
}

async fn shutdown(
    ctx: Arc<WorkerContext>,
    dispatcher_task: tokio::task::JoinHandle<()>,
    announce_task: tokio::task::JoinHandle<()>,
) {
    // Stop ingestion and fan the signal out to every task.
    let _ = ctx.shutdown_tx.send(());
    let _ = dispatcher_task.await;
    announce_task.abort();
    let _ = announce_task.await;

    {
        let mut retry = ctx.retry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = retry.flush() {
            error!(error = %e, "retry queue not persisted");
        }
    }
    if let Err(e) = ctx.pool.persist_health(&ctx.data) {
        error!(error = %e, "relay stats not persisted");
    }

    crate::health::remove_snapshot(&ctx.data);
    service::release_pid_file(&ctx.data);

    // Close relay subscriptions last; sessions drain outstanding writes.
    match Arc::try_unwrap(ctx) {
        Ok(ctx) => ctx.pool.shutdown().await,
        Err(ctx) => {
            // A straggler task still holds the context; sessions get the
            // close signal without the join.
            warn!("context still shared at shutdown");
            for sub in ctx.pool.subscription_ids() {
                ctx.pool.unsubscribe(&sub);
            }
        }
    }
    info!("worker stopped");
}

/// Route SIGTERM and Ctrl-C into the shutdown channel.
fn spawn_signal_forwarders(shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .map_err(WorkerError::Io)?;
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("termination signal received");
                let _ = tx.send(());
            }
        });
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = shutdown_tx.send(());
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_types::command::{Command, CommandKind};

    async fn test_context(dir: &tempfile::TempDir) -> Arc<WorkerContext> {
        let data = DataDir::new(dir.path());
        data.ensure_created().expect("create");
        let config = DaemonConfig {
            relays: vec!["ws://127.0.0.1:1".into()],
            ..DaemonConfig::default()
        };
        let identity = Identity::load_or_create(&data, true).expect("identity");
        let key = storage_key::load_or_create(&data).expect("key");
        let (events_tx, _events_rx) = mpsc::channel(8);
        let pool = RelayPool::new(
            PoolConfig {
                relays: config.relays.clone(),
                connect_timeout: std::time::Duration::from_millis(100),
                publish_timeout: std::time::Duration::from_millis(200),
            },
            events_tx,
            new_shared_health(),
        );
        let (shutdown_tx, _) = broadcast::channel(4);
        Arc::new(WorkerContext {
            data: data.clone(),
            config,
            identity,
            pool,
            groups: Arc::new(Mutex::new(GroupManager::load(data.clone()).expect("groups"))),
            history: GroupHistory::new(data.clone()),
            log: Arc::new(MessageLog::new(
                data.messages_file(),
                pulse_crypto::envelope::StorageKey::generate(),
            )),
            retry: Mutex::new(RetryQueue::load(data).expect("retry")),
            counters: Arc::new(Counters::default()),
            bus: MessageBus::default(),
            shutdown_tx,
        })
    }

    #[tokio::test]
    async fn test_send_command_queues_when_offline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(&dir).await;
        let target = pulse_crypto::keys::Keypair::generate();

        crate::inbox::submit_command(
            &ctx.data,
            &Command {
                id: "c1".into(),
                kind: CommandKind::Send {
                    target: target.public_hex().to_string(),
                    content: "hello".into(),
                },
            },
        )
        .expect("submit");

        let mut inbox = CommandInbox::new(ctx.clone());
        assert_eq!(inbox.tick().await.expect("tick"), 1);

        // Unreachable relays: the message must be parked in the queue
        let retry = ctx.retry.lock().expect("lock");
        assert_eq!(retry.len(), 1);
        assert_eq!(retry.entries()[0].kind, QueuedKind::Send);

        let results: Vec<CommandResult> =
            pulse_store::atomic::read_jsonl(&ctx.data.results_file()).expect("read");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cmd_id, "c1");
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(&dir).await;

        crate::inbox::submit_command(
            &ctx.data,
            &Command {
                id: "c1".into(),
                kind: CommandKind::Send {
                    target: "not-a-key".into(),
                    content: "hello".into(),
                },
            },
        )
        .expect("submit");

        let mut inbox = CommandInbox::new(ctx.clone());
        inbox.tick().await.expect("tick");

        let results: Vec<CommandResult> =
            pulse_store::atomic::read_jsonl(&ctx.data.results_file()).expect("read");
        assert!(!results[0].success);
        assert_eq!(results[0].code, "INVALID_PUBKEY");
        assert!(ctx.retry.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_group_send_mute_enforced_then_cleared() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(&dir).await;
        let me = ctx.identity.public_hex().to_string();
        let alice = pulse_crypto::keys::Keypair::generate();

        // Alice owns the group; we are a muted member.
        let group = {
            let mut groups = ctx.groups.lock().expect("lock");
            let group = groups
                .create_group("demo", alice.public_hex(), 1000)
                .expect("create");
            groups
                .join_group(&group.id, &group.topic, &me, None, 1001)
                .expect("join");
            groups
                .mute_member(&group.id, alice.public_hex(), &me, 0, 1002)
                .expect("mute");
            group
        };

        let group_send = |id: &str| Command {
            id: id.into(),
            kind: CommandKind::GroupSend {
                group_id: group.id.clone(),
                topic: group.topic.clone(),
                content: "hi".into(),
            },
        };

        crate::inbox::submit_command(&ctx.data, &group_send("c1")).expect("submit");
        let mut inbox = CommandInbox::new(ctx.clone());
        inbox.tick().await.expect("tick");

        let results: Vec<CommandResult> =
            pulse_store::atomic::read_jsonl(&ctx.data.results_file()).expect("read");
        assert!(!results[0].success);
        assert_eq!(results[0].code, "MEMBER_MUTED");
        assert!(ctx.history.read(&group.id, None).expect("read").is_empty());

        // After unmute, the send passes the check and is queued against
        // the unreachable relays.
        {
            let mut groups = ctx.groups.lock().expect("lock");
            groups
                .unmute_member(&group.id, alice.public_hex(), &me)
                .expect("unmute");
        }
        crate::inbox::submit_command(&ctx.data, &group_send("c2")).expect("submit");
        inbox.tick().await.expect("tick");

        let results: Vec<CommandResult> =
            pulse_store::atomic::read_jsonl(&ctx.data.results_file()).expect("read");
        let second = results.iter().find(|r| r.cmd_id == "c2").expect("result");
        assert!(second.success);
        assert_eq!(ctx.history.read(&group.id, None).expect("read").len(), 1);
    }

    #[tokio::test]
    async fn test_join_and_leave_group_subscriptions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(&dir).await;

        crate::inbox::submit_command(
            &ctx.data,
            &Command {
                id: "c1".into(),
                kind: CommandKind::JoinGroup {
                    group_id: "g1".into(),
                    topic: "group-g1".into(),
                },
            },
        )
        .expect("submit");
        let mut inbox = CommandInbox::new(ctx.clone());
        inbox.tick().await.expect("tick");
        assert!(ctx
            .pool
            .subscription_ids()
            .contains(&"group-g1".to_string()));

        crate::inbox::submit_command(
            &ctx.data,
            &Command {
                id: "c2".into(),
                kind: CommandKind::LeaveGroup {
                    group_id: "g1".into(),
                    topic: "group-g1".into(),
                },
            },
        )
        .expect("submit");
        inbox.tick().await.expect("tick");
        assert!(ctx.pool.subscription_ids().is_empty());
    }

    #[tokio::test]
    async fn test_retry_tick_reschedules_and_exhausts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(&dir).await;
        let target = pulse_crypto::keys::Keypair::generate();

        {
            let mut retry = ctx.retry.lock().expect("lock");
            retry.enqueue(
                QueuedKind::Send,
                target.public_hex(),
                "m",
                None,
                None,
                now_ms(),
            );
        }

        // First sweep: attempt fails against unreachable relays
        let terminal = retry_tick(&ctx).await;
        assert!(terminal.is_empty());
        {
            let retry = ctx.retry.lock().expect("lock");
            assert_eq!(retry.entries()[0].retry_count, 1);
            assert!(retry.entries()[0].next_retry_at > now_ms());
        }

        // Force the remaining attempts due immediately
        for _ in 0..pulse_types::MAX_RETRIES {
            let terminal = retry_tick_with_forced_due(&ctx).await;
            if !terminal.is_empty() {
                assert_eq!(terminal[0].code, "MESSAGE_RETRY_EXHAUSTED");
                assert!(ctx.retry.lock().expect("lock").is_empty());
                return;
            }
        }
        unreachable!("queue never exhausted");
    }

    #[tokio::test]
    async fn test_group_retry_republishes_real_group_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(&dir).await;
        let me = ctx.identity.public_hex().to_string();

        let group = {
            let mut groups = ctx.groups.lock().expect("lock");
            groups.create_group("demo", &me, 1000).expect("create")
        };
        assert_ne!(group.id, group.topic);

        // The publish fails against unreachable relays and the message is
        // parked in the queue.
        crate::inbox::submit_command(
            &ctx.data,
            &Command {
                id: "c1".into(),
                kind: CommandKind::GroupSend {
                    group_id: group.id.clone(),
                    topic: group.topic.clone(),
                    content: "hi".into(),
                },
            },
        )
        .expect("submit");
        let mut inbox = CommandInbox::new(ctx.clone());
        inbox.tick().await.expect("tick");

        let entry = {
            let retry = ctx.retry.lock().expect("lock");
            retry.entries()[0].clone()
        };
        assert_eq!(entry.kind, QueuedKind::GroupSend);
        assert_eq!(entry.group_id.as_deref(), Some(group.id.as_str()));
        assert_eq!(entry.topic.as_deref(), Some(group.topic.as_str()));

        // The redelivered event carries the real group id, not the topic.
        let (group_id, topic) = group_send_args(&entry);
        let event = crate::outbound::group_event(
            ctx.identity.keypair(),
            group_id,
            topic,
            &entry.content,
            now_ms(),
        )
        .expect("build");
        let key = pulse_crypto::group::GroupKey::derive(&group.topic).expect("derive");
        let plaintext = key.decrypt(&event.content).expect("decrypt");
        let envelope: pulse_types::payload::SignedEnvelope =
            serde_json::from_slice(&plaintext).expect("envelope");
        let payload: pulse_types::payload::Payload =
            serde_json::from_value(envelope.content).expect("payload");
        assert_eq!(payload.group_id.as_deref(), Some(group.id.as_str()));
        assert_eq!(payload.content, Some(serde_json::json!("hi")));
    }

    /// Like retry_tick, but treats every entry as due.
    async fn retry_tick_with_forced_due(ctx: &Arc<WorkerContext>) -> Vec<CommandResult> {
        let due = {
            let retry = ctx.retry.lock().expect("lock");
            retry.due(i64::MAX)
        };
        let now = now_ms();
        let mut terminal = Vec::new();
        for entry in due {
            let outcome = publish_direct(ctx, &entry.target, &entry.content, now).await;
            let mut retry = ctx.retry.lock().expect("lock");
            match outcome {
                Ok(()) => retry.mark_delivered(&entry.id),
                Err(e) => {
                    if let Some(dropped) = retry.mark_failed(&entry.id, &e.to_string(), now) {
                        terminal.push(CommandResult::fail_with(
                            dropped.message.id,
                            ErrorCode::MessageRetryExhausted,
                            "retries exhausted",
                            now,
                        ));
                    }
                }
            }
        }
        terminal
    }

    #[tokio::test]
    async fn test_stop_command_signals_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(&dir).await;
        let mut shutdown_rx = ctx.shutdown_tx.subscribe();

        crate::inbox::submit_command(
            &ctx.data,
            &Command {
                id: "c1".into(),
                kind: CommandKind::Stop,
            },
        )
        .expect("submit");
        let mut inbox = CommandInbox::new(ctx.clone());
        inbox.tick().await.expect("tick");

        shutdown_rx.try_recv().expect("shutdown signaled");
    }
}
