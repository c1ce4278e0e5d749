//! The command inbox.
//!
//! On a short tick the worker drains `commands.jsonl` under the
//! cross-process lock, truncates it, releases the lock, then executes each
//! command in file order and appends one result per command to
//! `results.jsonl`. A lock timeout skips the tick; the commands stay in
//! place for the next one. A global token bucket bounds command
//! throughput: commands past the budget are written back for the next
//! tick rather than dropped.

use std::sync::PoisonError;
use std::time::Instant;

use tracing::{debug, warn};

use pulse_crypto::bech32;
use pulse_crypto::keys::is_valid_pubkey_hex;
use pulse_relay::pool::now_ms;
use pulse_store::atomic::{self, FileMode};
use pulse_store::lock::{self, LockGuard};
use pulse_store::paths::DataDir;
use pulse_types::command::{Command, CommandKind, CommandResult};
use pulse_types::error::ErrorCode;
use pulse_types::event::Filter;
use pulse_types::group::Group;
use pulse_types::message::{QueuedKind, StoredMessage};
use pulse_types::RESULTS_RETENTION;

use crate::ratelimit::TokenBucket;
use crate::worker::{publish_direct, publish_group, WorkerContext};
use crate::{Result, WorkerError};

/// Drives command processing; one instance owned by the worker.
pub struct CommandInbox {
    ctx: std::sync::Arc<WorkerContext>,
    bucket: TokenBucket,
}

impl CommandInbox {
    pub fn new(ctx: std::sync::Arc<WorkerContext>) -> Self {
        Self {
            ctx,
            bucket: TokenBucket::for_commands(Instant::now()),
        }
    }

    /// Drain and execute pending commands. Returns how many ran.
    pub async fn tick(&mut self) -> Result<usize> {
        let commands = match drain_commands(&self.ctx.data) {
            Ok(commands) => commands,
            Err(WorkerError::Store(pulse_store::StoreError::LockTimeout(_))) => {
                debug!("command drain skipped; lock contended");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        if commands.is_empty() {
            return Ok(0);
        }

        let mut results = Vec::new();
        let mut deferred = Vec::new();
        let mut iter = commands.into_iter();
        for line in iter.by_ref() {
            if !self.bucket.try_take(Instant::now()) {
                deferred.push(line);
                break;
            }
            if let Some(result) = self.execute_line(&line).await {
                results.push(result);
            }
        }
        deferred.extend(iter);

        if !deferred.is_empty() {
            requeue_commands(&self.ctx.data, &deferred)?;
        }
        let executed = results.len();
        if !results.is_empty() {
            append_results(&self.ctx.data, results)?;
        }
        Ok(executed)
    }

    /// Parse and execute one command line; `None` for unattributable junk.
    async fn execute_line(&self, line: &str) -> Option<CommandResult> {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "skipping unparsable command line");
                return None;
            }
        };
        let cmd_id = value.get("id").and_then(|v| v.as_str())?.to_string();

        let command: Command = match serde_json::from_value(value) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, "unknown command shape");
                return Some(CommandResult::fail(cmd_id, ErrorCode::UnknownCommand, now_ms()));
            }
        };

        self.ctx.counters.incr(&self.ctx.counters.commands);
        Some(self.execute(command).await)
    }

    async fn execute(&self, command: Command) -> CommandResult {
        let now = now_ms();
        match command.kind {
            CommandKind::Send { target, content } => {
                self.cmd_send(&command.id, &target, &content, now).await
            }
            CommandKind::GroupSend {
                group_id,
                topic,
                content,
            } => {
                self.cmd_group_send(&command.id, &group_id, &topic, &content, now)
                    .await
            }
            CommandKind::JoinGroup { group_id, topic } => {
                self.cmd_join(&command.id, &group_id, &topic, now)
            }
            CommandKind::LeaveGroup { group_id, topic } => {
                self.cmd_leave(&command.id, &group_id, &topic)
            }
            CommandKind::Stop => {
                debug!("stop requested via command file");
                let _ = self.ctx.shutdown_tx.send(());
                CommandResult::ok(&command.id, now)
            }
        }
    }

    async fn cmd_send(
        &self,
        cmd_id: &str,
        target: &str,
        content: &str,
        now: i64,
    ) -> CommandResult {
        let target_hex = match bech32::normalize_pubkey(target) {
            Ok(hex) if is_valid_pubkey_hex(&hex) => hex,
            _ => return CommandResult::fail(cmd_id, ErrorCode::InvalidPubkey, now),
        };
        if content.is_empty() {
            return CommandResult::fail_with(
                cmd_id,
                ErrorCode::InvalidArgs,
                "empty message content",
                now,
            );
        }

        match publish_direct(&self.ctx, &target_hex, content, now).await {
            Ok(()) => CommandResult::ok(cmd_id, now),
            Err(WorkerError::InvalidArgs(detail)) => {
                CommandResult::fail_with(cmd_id, ErrorCode::InvalidArgs, detail, now)
            }
            Err(e) => {
                debug!(error = %e, "direct publish failed; queueing");
                let mut retry = self.ctx.retry.lock().unwrap_or_else(PoisonError::into_inner);
                let (queue_id, _evicted) =
                    retry.enqueue(QueuedKind::Send, &target_hex, content, None, None, now);
                CommandResult {
                    cmd_id: cmd_id.to_string(),
                    success: true,
                    code: "OK".to_string(),
                    message: Some(format!("queued for retry as {queue_id}")),
                    ts: now,
                }
            }
        }
    }

    async fn cmd_group_send(
        &self,
        cmd_id: &str,
        group_id: &str,
        topic: &str,
        content: &str,
        now: i64,
    ) -> CommandResult {
        let me = self.ctx.identity.public_hex().to_string();
        let topic = if topic.is_empty() {
            Group::default_topic(group_id)
        } else {
            topic.to_string()
        };

        {
            let mut groups = self
                .ctx
                .groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = groups.can_send_message(group_id, &me, now) {
                return CommandResult::fail(cmd_id, e.code(), now);
            }
        }

        match publish_group(&self.ctx, group_id, &topic, content, now).await {
            Ok(event) => {
                self.record_own_group_message(group_id, &event.id, content, now);
                CommandResult::ok(cmd_id, now)
            }
            Err(WorkerError::InvalidArgs(detail)) => {
                CommandResult::fail_with(cmd_id, ErrorCode::InvalidArgs, detail, now)
            }
            Err(e) => {
                debug!(error = %e, "group publish failed; queueing");
                let mut retry = self.ctx.retry.lock().unwrap_or_else(PoisonError::into_inner);
                let (queue_id, _evicted) = retry.enqueue(
                    QueuedKind::GroupSend,
                    &topic,
                    content,
                    Some(group_id),
                    Some(&topic),
                    now,
                );
                self.record_own_group_message(group_id, &queue_id, content, now);
                CommandResult {
                    cmd_id: cmd_id.to_string(),
                    success: true,
                    code: "OK".to_string(),
                    message: Some(format!("queued for retry as {queue_id}")),
                    ts: now,
                }
            }
        }
    }

    /// Our own outgoing group message lands in the group's history.
    fn record_own_group_message(&self, group_id: &str, id: &str, content: &str, now: i64) {
        let message = StoredMessage {
            id: id.to_string(),
            from: self.ctx.identity.public_hex().to_string(),
            content: serde_json::json!(content),
            timestamp: now,
            received_at: now,
            is_group: true,
            group_id: Some(group_id.to_string()),
            signature_valid: Some(true),
        };
        if let Err(e) = self.ctx.history.append(group_id, &message, now) {
            warn!(error = %e, group = group_id, "history append for own message failed");
        }
    }

    fn cmd_join(&self, cmd_id: &str, group_id: &str, topic: &str, now: i64) -> CommandResult {
        let me = self.ctx.identity.public_hex().to_string();
        let topic = if topic.is_empty() {
            Group::default_topic(group_id)
        } else {
            topic.to_string()
        };

        let joined = {
            let mut groups = self
                .ctx
                .groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            groups.join_group(group_id, &topic, &me, None, now)
        };
        match joined {
            Ok(group) => {
                self.ctx
                    .pool
                    .subscribe(&group.topic, Filter::for_topic(&group.topic, now / 1000));
                self.refresh_group_count();
                CommandResult::ok(cmd_id, now)
            }
            Err(e) => CommandResult::fail(cmd_id, e.code(), now),
        }
    }

    fn cmd_leave(&self, cmd_id: &str, group_id: &str, topic: &str) -> CommandResult {
        let now = now_ms();
        let me = self.ctx.identity.public_hex().to_string();
        let topic = if topic.is_empty() {
            Group::default_topic(group_id)
        } else {
            topic.to_string()
        };

        // Subscription teardown is idempotent and happens regardless of
        // membership state.
        self.ctx.pool.unsubscribe(&topic);

        let left = {
            let mut groups = self
                .ctx
                .groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            groups.leave_group(group_id, &me)
        };
        match left {
            Ok(_) => {
                self.refresh_group_count();
                CommandResult::ok(cmd_id, now)
            }
            Err(pulse_groups::GroupError::NotFound(_))
            | Err(pulse_groups::GroupError::MemberNotFound(_)) => CommandResult::ok(cmd_id, now),
            Err(e) => CommandResult::fail(cmd_id, e.code(), now),
        }
    }

    fn refresh_group_count(&self) {
        let groups = self
            .ctx
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.ctx
            .counters
            .set(&self.ctx.counters.group_count, groups.len() as u64);
    }
}

/// Read and truncate the command file under the lock. Raw lines are
/// returned so malformed entries survive for diagnostics.
fn drain_commands(data: &DataDir) -> Result<Vec<String>> {
    let guard = LockGuard::acquire(&data.lock_dir())?;
    let lines = atomic::read_lines(&data.commands_file())?;
    if !lines.is_empty() {
        atomic::truncate(&data.commands_file())?;
    }
    drop(guard);
    Ok(lines)
}

/// Write deferred command lines back for the next tick.
fn requeue_commands(data: &DataDir, lines: &[String]) -> Result<()> {
    lock::with_lock(&data.lock_dir(), lock::DEFAULT_TIMEOUT, || {
        for line in lines {
            atomic::append_line(&data.commands_file(), line, FileMode::Shared)?;
        }
        Ok(())
    })?
    .map_err(WorkerError::Store)
}

/// Append results under the lock, pruning the file to its newest entries.
pub fn append_results(data: &DataDir, new_results: Vec<CommandResult>) -> Result<()> {
    lock::with_lock(&data.lock_dir(), lock::DEFAULT_TIMEOUT, || {
        let mut all: Vec<CommandResult> = atomic::read_jsonl(&data.results_file())?;
        all.extend(new_results);
        let skip = all.len().saturating_sub(RESULTS_RETENTION);
        atomic::write_jsonl(&data.results_file(), &all[skip..], FileMode::Shared)?;
        Ok(())
    })?
    .map_err(WorkerError::Store)
}

/// Append one command to the inbox, as a CLI process would.
pub fn submit_command(data: &DataDir, command: &Command) -> Result<()> {
    let line = serde_json::to_string(command)
        .map_err(|e| pulse_store::StoreError::Serialization(e.to_string()))?;
    lock::with_lock(&data.lock_dir(), lock::DEFAULT_TIMEOUT, || {
        atomic::append_line(&data.commands_file(), &line, FileMode::Shared)
    })?
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_then_drain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        data.ensure_created().expect("create");

        let cmd = Command {
            id: "c1".into(),
            kind: CommandKind::Stop,
        };
        submit_command(&data, &cmd).expect("submit");
        submit_command(
            &data,
            &Command {
                id: "c2".into(),
                kind: CommandKind::JoinGroup {
                    group_id: "g1".into(),
                    topic: "group-g1".into(),
                },
            },
        )
        .expect("submit");

        let lines = drain_commands(&data).expect("drain");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"c1\""));

        // Drained means gone
        assert!(drain_commands(&data).expect("drain").is_empty());
    }

    #[test]
    fn test_results_retention() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        data.ensure_created().expect("create");

        let batch: Vec<CommandResult> = (0..RESULTS_RETENTION + 10)
            .map(|i| CommandResult::ok(format!("c{i}"), i as i64))
            .collect();
        append_results(&data, batch).expect("append");

        let kept: Vec<CommandResult> = atomic::read_jsonl(&data.results_file()).expect("read");
        assert_eq!(kept.len(), RESULTS_RETENTION);
        assert_eq!(kept[0].cmd_id, "c10");
    }

    #[test]
    fn test_concurrent_submitters_preserved() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        data.ensure_created().expect("create");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let data = DataDir::new(dir.path());
                std::thread::spawn(move || {
                    for j in 0..5 {
                        submit_command(
                            &data,
                            &Command {
                                id: format!("c{i}-{j}"),
                                kind: CommandKind::Stop,
                            },
                        )
                        .expect("submit");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let lines = drain_commands(&data).expect("drain");
        assert_eq!(lines.len(), 40);
        // Every command id appears exactly once
        let mut ids: Vec<String> = lines
            .iter()
            .map(|l| {
                serde_json::from_str::<Command>(l)
                    .expect("parse")
                    .id
            })
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 40);
    }
}
