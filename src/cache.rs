//! Last-known-good derived data, shared between refresh loops and handlers.
//!
//! Refresh loops are the only writers; HTTP handlers only read. Every write
//! replaces a slot's full value under a single write lock, so a reader sees
//! either the previous snapshot or the new one, never a mix. Reads never
//! wait on a refresh — a service in trouble degrades to stale data, not to
//! blocked requests.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// One timetable period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimetableEntry {
    pub subject: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub room: String,
    /// Group/class names attending; may be empty.
    pub classes: Vec<String>,
}

/// One school holiday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolidayEntry {
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Access token for the Microsoft Graph, plus its validity window.
///
/// Sensitive — lives in the cache for handlers to use, but is never written
/// into the on-disk cache snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Account the token belongs to (user principal name).
    pub account: String,
}

#[derive(Debug, Clone, Default)]
struct Slot<T> {
    data: T,
    updated_at: Option<DateTime<Utc>>,
}

/// A read-out of one cache slot.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    pub data: T,
    /// When the slot was last successfully replaced. `None` = never.
    pub updated_at: Option<DateTime<Utc>>,
}

/// In-memory cache of everything the refresh loops derive.
#[derive(Default)]
pub struct DataCache {
    timetable: RwLock<Slot<Vec<TimetableEntry>>>,
    holidays: RwLock<Slot<Vec<HolidayEntry>>>,
    mail_token: RwLock<Option<MailToken>>,
}

/// Serializable cache state, written at shutdown and restored at startup.
/// Carries no secrets: the mail token is deliberately absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    #[serde(default)]
    pub timetable: Vec<TimetableEntry>,
    pub timetable_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub holidays: Vec<HolidayEntry>,
    pub holidays_updated_at: Option<DateTime<Utc>>,
}

impl DataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the timetable wholesale. Entries are sorted ascending by
    /// start time here so every reader sees the sort invariant hold.
    pub async fn store_timetable(&self, mut entries: Vec<TimetableEntry>) {
        entries.sort_by_key(|e| e.start);
        let mut slot = self.timetable.write().await;
        *slot = Slot {
            data: entries,
            updated_at: Some(Utc::now()),
        };
    }

    pub async fn store_holidays(&self, holidays: Vec<HolidayEntry>) {
        let mut slot = self.holidays.write().await;
        *slot = Slot {
            data: holidays,
            updated_at: Some(Utc::now()),
        };
    }

    pub async fn store_mail_token(&self, token: Option<MailToken>) {
        *self.mail_token.write().await = token;
    }

    /// Last successful timetable snapshot, possibly empty, never blocking on
    /// a refresh.
    pub async fn timetable(&self) -> CacheRead<Vec<TimetableEntry>> {
        let slot = self.timetable.read().await;
        CacheRead {
            data: slot.data.clone(),
            updated_at: slot.updated_at,
        }
    }

    /// Timetable entries starting within `[today, today + day_range)`.
    pub async fn timetable_window(&self, today: NaiveDate, day_range: u32) -> CacheRead<Vec<TimetableEntry>> {
        let end = today
            .checked_add_days(Days::new(u64::from(day_range)))
            .unwrap_or(NaiveDate::MAX);
        let slot = self.timetable.read().await;
        CacheRead {
            data: slot
                .data
                .iter()
                .filter(|e| e.start.date() >= today && e.start.date() < end)
                .cloned()
                .collect(),
            updated_at: slot.updated_at,
        }
    }

    pub async fn holidays(&self) -> CacheRead<Vec<HolidayEntry>> {
        let slot = self.holidays.read().await;
        CacheRead {
            data: slot.data.clone(),
            updated_at: slot.updated_at,
        }
    }

    pub async fn mail_token(&self) -> Option<MailToken> {
        self.mail_token.read().await.clone()
    }

    /// The lesson running at `now`, if any.
    pub async fn current_lesson(&self, now: NaiveDateTime) -> Option<TimetableEntry> {
        let slot = self.timetable.read().await;
        slot.data
            .iter()
            .find(|e| e.start <= now && now <= e.end)
            .cloned()
    }

    /// All lessons on `now`'s calendar day.
    pub async fn lessons_today(&self, now: NaiveDateTime) -> Vec<TimetableEntry> {
        let today = now.date();
        let slot = self.timetable.read().await;
        slot.data
            .iter()
            .filter(|e| e.start.date() == today)
            .cloned()
            .collect()
    }

    /// All lessons in `now`'s calendar week (Monday through Sunday).
    pub async fn lessons_week(&self, now: NaiveDateTime) -> Vec<TimetableEntry> {
        let today = now.date();
        let monday = today - Days::new(u64::from(today.weekday().num_days_from_monday()));
        let sunday = monday + Days::new(6);
        let slot = self.timetable.read().await;
        slot.data
            .iter()
            .filter(|e| e.start.date() >= monday && e.start.date() <= sunday)
            .cloned()
            .collect()
    }

    /// The next holiday starting strictly after `today`, if any.
    pub async fn next_holiday(&self, today: NaiveDate) -> Option<HolidayEntry> {
        let slot = self.holidays.read().await;
        slot.data
            .iter()
            .filter(|h| h.start > today)
            .min_by_key(|h| h.start)
            .cloned()
    }

    /// Counts for status endpoints.
    pub async fn counts(&self) -> (usize, usize) {
        let timetable = self.timetable.read().await.data.len();
        let holidays = self.holidays.read().await.data.len();
        (timetable, holidays)
    }

    /// Copy of the persistable state, taken by the lifecycle coordinator.
    pub async fn snapshot(&self) -> CacheSnapshot {
        let timetable = self.timetable.read().await;
        let holidays = self.holidays.read().await;
        CacheSnapshot {
            timetable: timetable.data.clone(),
            timetable_updated_at: timetable.updated_at,
            holidays: holidays.data.clone(),
            holidays_updated_at: holidays.updated_at,
        }
    }

    /// Restore a snapshot loaded from disk, keeping its original timestamps
    /// so restored data still reads as stale.
    pub async fn restore(&self, snapshot: CacheSnapshot) {
        let mut entries = snapshot.timetable;
        entries.sort_by_key(|e| e.start);
        *self.timetable.write().await = Slot {
            data: entries,
            updated_at: snapshot.timetable_updated_at,
        };
        *self.holidays.write().await = Slot {
            data: snapshot.holidays,
            updated_at: snapshot.holidays_updated_at,
        };
    }
}
