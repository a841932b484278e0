//! Timer specs, per-instance timer records and the shared timer queue.
//!
//! Timers are owned by node instances and persisted with their process
//! instance. The `TimerService` only knows when each one is due; a firing is
//! delivered back through the runtime manager like any other signal, so the
//! owning session is bound (or rebuilt) before the timer touches state.

use crate::types::{EventType, NodeInstanceId, TimerId, Timestamp};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

// ─── Clock ────────────────────────────────────────────────────

/// Source of "now" for timer computation.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) -> Timestamp {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

// ─── Timer spec ───────────────────────────────────────────────

/// When a timer fires.
///
/// String form: ISO 8601 duration (`PT5S`), RFC 3339 date, or cycle
/// `R[n]/<period>` / `R[n]/<delay>/<period>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerSpec {
    Duration {
        ms: u64,
    },
    Date {
        at: Timestamp,
    },
    Cycle {
        delay_ms: u64,
        period_ms: u64,
        /// `None` repeats until the owner goes away.
        repeats: Option<u32>,
    },
}

impl TimerSpec {
    pub fn duration_ms(ms: u64) -> Self {
        TimerSpec::Duration { ms }
    }

    pub fn cycle(period_ms: u64, repeats: Option<u32>) -> Self {
        TimerSpec::Cycle {
            delay_ms: period_ms,
            period_ms,
            repeats,
        }
    }

    pub fn first_fire(&self, now: Timestamp) -> Timestamp {
        match self {
            TimerSpec::Duration { ms } => now.saturating_add(clamp_ms(*ms)),
            TimerSpec::Date { at } => *at,
            TimerSpec::Cycle { delay_ms, .. } => now.saturating_add(clamp_ms(*delay_ms)),
        }
    }

    /// Number of fires before the timer removes itself, `None` for unbounded.
    pub fn initial_repeats(&self) -> Option<u32> {
        match self {
            TimerSpec::Duration { .. } | TimerSpec::Date { .. } => Some(1),
            TimerSpec::Cycle { repeats, .. } => *repeats,
        }
    }
}

impl fmt::Display for TimerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerSpec::Duration { ms } => f.write_str(&format_duration(*ms)),
            TimerSpec::Date { at } => match Utc.timestamp_millis_opt(*at).single() {
                Some(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                None => write!(f, "@{at}"),
            },
            TimerSpec::Cycle {
                delay_ms,
                period_ms,
                repeats,
            } => {
                let count = repeats.map(|r| r.to_string()).unwrap_or_default();
                if delay_ms == period_ms {
                    write!(f, "R{count}/{}", format_duration(*period_ms))
                } else {
                    write!(
                        f,
                        "R{count}/{}/{}",
                        format_duration(*delay_ms),
                        format_duration(*period_ms)
                    )
                }
            }
        }
    }
}

impl FromStr for TimerSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('R') {
            let parts: Vec<&str> = rest.split('/').collect();
            let repeats = match parts[0] {
                "" => None,
                n => Some(
                    n.parse::<u32>()
                        .map_err(|_| format!("invalid repeat count in cycle '{s}'"))?,
                ),
            };
            return match parts.as_slice() {
                [_, period] => {
                    let period_ms = parse_duration_ms(period)?;
                    Ok(TimerSpec::Cycle {
                        delay_ms: period_ms,
                        period_ms,
                        repeats,
                    })
                }
                [_, delay, period] => Ok(TimerSpec::Cycle {
                    delay_ms: parse_duration_ms(delay)?,
                    period_ms: parse_duration_ms(period)?,
                    repeats,
                }),
                _ => Err(format!("invalid cycle expression '{s}'")),
            };
        }
        if s.starts_with('P') {
            return Ok(TimerSpec::Duration {
                ms: parse_duration_ms(s)?,
            });
        }
        DateTime::parse_from_rfc3339(s)
            .map(|dt| TimerSpec::Date {
                at: dt.timestamp_millis(),
            })
            .map_err(|e| format!("invalid timer expression '{s}': {e}"))
    }
}

/// Milliseconds as a timestamp offset, saturating at `i64::MAX`.
fn clamp_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Parse an ISO 8601 duration (`P[nD][T[nH][nM][n[.fff]S]]`) into milliseconds.
pub fn parse_duration_ms(s: &str) -> Result<u64, String> {
    let body = s
        .strip_prefix('P')
        .ok_or_else(|| format!("duration must start with 'P': '{s}'"))?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (body, None),
    };

    let mut total: u64 = 0;
    let mut saw_unit = false;

    let mut number = String::new();
    for c in date_part.chars() {
        match c {
            '0'..='9' => number.push(c),
            'D' | 'W' => {
                let n: u64 = number
                    .parse()
                    .map_err(|_| format!("invalid number in duration '{s}'"))?;
                let unit = if c == 'D' { 86_400_000 } else { 7 * 86_400_000 };
                total = total.saturating_add(n.saturating_mul(unit));
                number.clear();
                saw_unit = true;
            }
            _ => return Err(format!("unsupported date component '{c}' in duration '{s}'")),
        }
    }
    if !number.is_empty() {
        return Err(format!("dangling number in duration '{s}'"));
    }

    if let Some(time_part) = time_part {
        for c in time_part.chars() {
            match c {
                '0'..='9' | '.' => number.push(c),
                'H' | 'M' => {
                    let n: u64 = number
                        .parse()
                        .map_err(|_| format!("invalid number in duration '{s}'"))?;
                    let unit = if c == 'H' { 3_600_000 } else { 60_000 };
                    total = total.saturating_add(n.saturating_mul(unit));
                    number.clear();
                    saw_unit = true;
                }
                'S' => {
                    let (whole, frac) = number.split_once('.').unwrap_or((number.as_str(), ""));
                    let secs: u64 = whole
                        .parse()
                        .map_err(|_| format!("invalid seconds in duration '{s}'"))?;
                    let mut millis = String::from(frac);
                    millis.truncate(3);
                    while millis.len() < 3 {
                        millis.push('0');
                    }
                    let millis: u64 = millis
                        .parse()
                        .map_err(|_| format!("invalid fraction in duration '{s}'"))?;
                    total = total.saturating_add(secs.saturating_mul(1000).saturating_add(millis));
                    number.clear();
                    saw_unit = true;
                }
                _ => return Err(format!("unsupported time component '{c}' in duration '{s}'")),
            }
        }
        if !number.is_empty() {
            return Err(format!("dangling number in duration '{s}'"));
        }
    }

    if !saw_unit {
        return Err(format!("empty duration '{s}'"));
    }
    Ok(total)
}

/// Canonical ISO 8601 rendering used in timer event types.
pub fn format_duration(ms: u64) -> String {
    let days = ms / 86_400_000;
    let hours = (ms / 3_600_000) % 24;
    let minutes = (ms / 60_000) % 60;
    let seconds = (ms / 1000) % 60;
    let millis = ms % 1000;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours > 0 || minutes > 0 || seconds > 0 || millis > 0 || days == 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if millis > 0 {
            out.push_str(&format!("{seconds}.{millis:03}S"));
        } else if seconds > 0 || (hours == 0 && minutes == 0) {
            out.push_str(&format!("{seconds}S"));
        }
    }
    out
}

// ─── Timer record (persisted with the process instance) ──────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub id: TimerId,
    pub owner: NodeInstanceId,
    pub spec: TimerSpec,
    pub next_fire: Timestamp,
    /// Fires left, `None` for unbounded cycles.
    pub remaining: Option<u32>,
    pub fired: u32,
}

impl TimerRecord {
    pub fn new(id: TimerId, owner: NodeInstanceId, spec: TimerSpec, now: Timestamp) -> Self {
        Self {
            id,
            owner,
            next_fire: spec.first_fire(now),
            remaining: spec.initial_repeats(),
            spec,
            fired: 0,
        }
    }

    /// Event type the firing is delivered as.
    pub fn event_type(&self) -> EventType {
        EventType::timer(self.owner, self.spec.to_string())
    }

    /// Account for one firing. Returns `false` when the timer is spent and
    /// must be removed.
    pub fn record_fire(&mut self) -> bool {
        self.fired += 1;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                return false;
            }
        }
        match &self.spec {
            TimerSpec::Cycle { period_ms, .. } => {
                self.next_fire = self.next_fire.saturating_add(clamp_ms(*period_ms));
                true
            }
            _ => false,
        }
    }
}

// ─── Timer service ────────────────────────────────────────────

/// A due timer handed to the delivery path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerFiring {
    pub process_instance_id: Uuid,
    pub timer_id: TimerId,
    pub owner: NodeInstanceId,
    pub due: Timestamp,
}

type TimerKey = (Uuid, TimerId);

#[derive(Default)]
struct TimerQueue {
    by_due: BTreeSet<(Timestamp, Uuid, TimerId)>,
    entries: HashMap<TimerKey, (Timestamp, NodeInstanceId)>,
}

impl TimerQueue {
    fn insert(&mut self, pi: Uuid, record: &TimerRecord) {
        self.remove(&(pi, record.id));
        self.by_due.insert((record.next_fire, pi, record.id));
        self.entries
            .insert((pi, record.id), (record.next_fire, record.owner));
    }

    fn remove(&mut self, key: &TimerKey) -> bool {
        match self.entries.remove(key) {
            Some((due, _)) => {
                self.by_due.remove(&(due, key.0, key.1));
                true
            }
            None => false,
        }
    }
}

/// Process-wide schedule of pending timers, shared by every session of a
/// deployment.
#[derive(Default)]
pub struct TimerService {
    queue: Mutex<TimerQueue>,
    changed: Notify,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, TimerQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or move a timer.
    pub fn schedule(&self, process_instance_id: Uuid, record: &TimerRecord) {
        self.queue().insert(process_instance_id, record);
        self.changed.notify_one();
    }

    pub fn cancel(&self, process_instance_id: Uuid, timer_id: TimerId) -> bool {
        self.queue().remove(&(process_instance_id, timer_id))
    }

    /// Drop every pending timer owned by one node instance.
    pub fn cancel_owner(&self, process_instance_id: Uuid, owner: NodeInstanceId) -> usize {
        let mut queue = self.queue();
        let keys: Vec<TimerKey> = queue
            .entries
            .iter()
            .filter(|((pi, _), (_, o))| *pi == process_instance_id && *o == owner)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            queue.remove(key);
        }
        keys.len()
    }

    /// Replace the schedule of one instance with its persisted timer records.
    pub fn sync_instance<'a>(
        &self,
        process_instance_id: Uuid,
        records: impl IntoIterator<Item = &'a TimerRecord>,
    ) {
        {
            let mut queue = self.queue();
            let stale: Vec<TimerKey> = queue
                .entries
                .keys()
                .filter(|(pi, _)| *pi == process_instance_id)
                .copied()
                .collect();
            for key in &stale {
                queue.remove(key);
            }
            for record in records {
                queue.insert(process_instance_id, record);
            }
        }
        self.changed.notify_one();
    }

    pub fn remove_instance(&self, process_instance_id: Uuid) -> usize {
        let mut queue = self.queue();
        let keys: Vec<TimerKey> = queue
            .entries
            .keys()
            .filter(|(pi, _)| *pi == process_instance_id)
            .copied()
            .collect();
        for key in &keys {
            queue.remove(key);
        }
        keys.len()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.queue().by_due.iter().next().map(|(due, _, _)| *due)
    }

    /// Remove and return every timer due at or before `now`, earliest first.
    ///
    /// The delivery path re-schedules cycles from the updated record.
    pub fn take_due(&self, now: Timestamp) -> Vec<TimerFiring> {
        let mut queue = self.queue();
        let due: Vec<(Timestamp, Uuid, TimerId)> = queue
            .by_due
            .iter()
            .take_while(|(due, _, _)| *due <= now)
            .copied()
            .collect();
        due.into_iter()
            .filter_map(|(due, pi, timer_id)| {
                let owner = queue.entries.get(&(pi, timer_id)).map(|(_, o)| *o)?;
                queue.remove(&(pi, timer_id));
                Some(TimerFiring {
                    process_instance_id: pi,
                    timer_id,
                    owner,
                    due,
                })
            })
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.queue().entries.len()
    }

    pub fn pending_for(&self, process_instance_id: Uuid) -> usize {
        self.queue()
            .entries
            .keys()
            .filter(|(pi, _)| *pi == process_instance_id)
            .count()
    }

    /// Resolves after the next schedule change.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}
