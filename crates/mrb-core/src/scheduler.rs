//! Canned messages sent on a schedule.
//!
//! - Daily `HH:MM` (local time) or standard 5-field cron (min hour dom mon dow)
//! - One task per job, sleeping until the next fire time
//! - Chats are resolved through the entity resolver on every run (cache hit
//!   after the first)
//! - A failed send is logged and the job keeps its schedule

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Datelike, Local, Timelike};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    domain::{ChatIdentifier, MessageRef},
    messaging::port::MessagingPort,
    resolver::EntityResolver,
    Error, Result,
};

pub const DEFAULT_TIME: &str = "08:00";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledMessage {
    pub chat: ChatIdentifier,
    pub text: String,
    /// Normalized 5-field cron expression.
    pub cron: String,
}

impl ScheduledMessage {
    /// Every day at `HH:MM` local time.
    pub fn daily(chat: ChatIdentifier, text: impl Into<String>, time: &str) -> Result<Self> {
        let (hour, minute) = parse_daily_time(time)?;
        Ok(Self {
            chat,
            text: text.into(),
            cron: format!("{minute} {hour} * * *"),
        })
    }

    pub fn cron(chat: ChatIdentifier, text: impl Into<String>, expr: &str) -> Result<Self> {
        CronExpr::parse(expr)?;
        Ok(Self {
            chat,
            text: text.into(),
            cron: expr.split_whitespace().collect::<Vec<_>>().join(" "),
        })
    }
}

pub fn parse_daily_time(raw: &str) -> Result<(u32, u32)> {
    let bad = || Error::Config(format!("invalid time (expected HH:MM): {raw}"));
    let (h, m) = raw.trim().split_once(':').ok_or_else(bad)?;
    let hour: u32 = h.trim().parse().map_err(|_| bad())?;
    let minute: u32 = m.trim().parse().map_err(|_| bad())?;
    if hour > 23 || minute > 59 {
        return Err(bad());
    }
    Ok((hour, minute))
}

struct Job {
    message: ScheduledMessage,
    expr: CronExpr,
}

pub struct MessageScheduler {
    jobs: Vec<Arc<Job>>,
    resolver: Arc<EntityResolver>,
    messenger: Arc<dyn MessagingPort>,
}

impl MessageScheduler {
    pub fn new(
        messages: Vec<ScheduledMessage>,
        resolver: Arc<EntityResolver>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        let mut jobs = Vec::with_capacity(messages.len());
        for (idx, message) in messages.into_iter().enumerate() {
            match CronExpr::parse(&message.cron) {
                Ok(expr) => jobs.push(Arc::new(Job { message, expr })),
                Err(e) => warn!(job = idx + 1, "scheduled message skipped: {e}"),
            }
        }
        Self {
            jobs,
            resolver,
            messenger,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Chats referenced by any job.
    pub fn chats(&self) -> Vec<ChatIdentifier> {
        self.jobs.iter().map(|j| j.message.chat.clone()).collect()
    }

    /// Spawn one task per job. Tasks exit when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        if self.jobs.is_empty() {
            info!("no scheduled messages configured");
            return Vec::new();
        }

        let handles = self
            .jobs
            .iter()
            .map(|job| {
                info!(chat = %job.message.chat, cron = %job.message.cron, "scheduled message added");
                let scheduler = self.clone();
                let job = job.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { scheduler.job_loop(job, cancel).await })
            })
            .collect::<Vec<_>>();

        info!(jobs = handles.len(), "scheduler started");
        handles
    }

    async fn job_loop(&self, job: Arc<Job>, cancel: CancellationToken) {
        loop {
            let now = Local::now();
            let Some(next) = job.expr.next_after(now) else {
                error!(cron = %job.message.cron, "job has no future run; stopping");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {
                    if let Err(e) = self.send(&job.message).await {
                        error!(chat = %job.message.chat, "scheduled message failed: {e}");
                    }
                }
            }
        }
    }

    /// Resolve the job's chat and send its text once.
    pub async fn send(&self, message: &ScheduledMessage) -> Result<MessageRef> {
        let target = self
            .resolver
            .resolve(&message.chat)
            .await
            .ok_or_else(|| Error::NotFound(format!("chat {} could not be resolved", message.chat)))?;
        let sent = self
            .messenger
            .send_text(target.chat_id(), &message.text, &[])
            .await?;
        info!(chat = %message.chat, "scheduled message sent");
        Ok(sent)
    }
}

// === Cron expression engine ===

/// Parsed 5-field cron expression. Each field is a bitmask of allowed values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    days: u32,
    months: u16,
    weekdays: u8,
    days_restricted: bool,
    weekdays_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts = expr.split_whitespace().collect::<Vec<_>>();
        let [min, hour, dom, mon, dow] = parts.as_slice() else {
            return Err(Error::Config(format!(
                "cron expression needs 5 fields, got {}: {expr}",
                parts.len()
            )));
        };

        let (minutes, _) = parse_field(min, 0, 59)?;
        let (hours, _) = parse_field(hour, 0, 23)?;
        let (days, days_restricted) = parse_field(dom, 1, 31)?;
        let (months, _) = parse_field(mon, 1, 12)?;
        // 7 is an alias for Sunday.
        let (weekdays, weekdays_restricted) = parse_field(dow, 0, 7)?;
        let weekdays = (weekdays | (weekdays >> 7)) & 0x7f;

        Ok(Self {
            minutes,
            hours: hours as u32,
            days: days as u32,
            months: months as u16,
            weekdays: weekdays as u8,
            days_restricted,
            weekdays_restricted,
        })
    }

    fn day_matches(&self, dt: &DateTime<Local>) -> bool {
        if self.months & (1 << dt.month()) == 0 {
            return false;
        }
        let dom = self.days & (1 << dt.day()) != 0;
        let dow = self.weekdays & (1 << dt.weekday().num_days_from_sunday()) != 0;

        // Both restricted: either may match. A `*` field (stepped or not)
        // only narrows through its own bits.
        if self.days_restricted && self.weekdays_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    pub fn matches(&self, dt: &DateTime<Local>) -> bool {
        self.day_matches(dt)
            && self.hours & (1 << dt.hour()) != 0
            && self.minutes & (1 << dt.minute()) != 0
    }

    /// First matching minute strictly after `now`.
    pub fn next_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut t = (now + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        // Roughly five years of hours, enough for Feb 29.
        for _ in 0..(5 * 366 * 24) {
            if !self.day_matches(&t) || self.hours & (1 << t.hour()) == 0 {
                t += chrono::Duration::minutes(60 - i64::from(t.minute()));
                continue;
            }
            for _ in t.minute()..60 {
                if self.minutes & (1 << t.minute()) != 0 {
                    return Some(t);
                }
                t += chrono::Duration::minutes(1);
            }
        }
        None
    }
}

/// Parse one field into a bitmask over `lo..=hi`. The flag is false when the
/// field is a bare `*`.
fn parse_field(raw: &str, lo: u32, hi: u32) -> Result<(u64, bool)> {
    let bad = |what: &str| Error::Config(format!("invalid cron field `{raw}`: {what}"));

    if raw == "*" {
        return Ok((range_mask(lo, hi, 1), false));
    }

    let mut mask = 0u64;
    for item in raw.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((b, s)) => {
                let step: u32 = s.parse().map_err(|_| bad("step"))?;
                if step == 0 {
                    return Err(bad("step must be positive"));
                }
                (b, step)
            }
            None => (item, 1),
        };

        let (start, end) = if base == "*" {
            (lo, hi)
        } else if let Some((a, b)) = base.split_once('-') {
            (
                a.parse().map_err(|_| bad("range start"))?,
                b.parse().map_err(|_| bad("range end"))?,
            )
        } else {
            let v: u32 = base.parse().map_err(|_| bad("value"))?;
            // `5/15` means from 5 to the end of the range.
            if step > 1 {
                (v, hi)
            } else {
                (v, v)
            }
        };

        if start < lo || end > hi || start > end {
            return Err(bad("out of range"));
        }
        mask |= range_mask(start, end, step);
    }

    if mask == 0 {
        return Err(bad("empty"));
    }
    Ok((mask, !raw.starts_with('*')))
}

fn range_mask(start: u32, end: u32, step: u32) -> u64 {
    (start..=end)
        .step_by(step as usize)
        .fold(0u64, |m, v| m | (1 << v))
}

// === Tests ===
