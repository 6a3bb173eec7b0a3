//! WebUntis timetable provider adapter.
//!
//! Speaks the WebUntis JSON-RPC dialect: `authenticate` yields a session id
//! that is replayed as a `JSESSIONID` cookie on `getTimetable`,
//! `getHolidays`, and `logout`. Dates come as `yyyymmdd` integers and times
//! as `hhmm` integers in the school's local time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::cache::{HolidayEntry, TimetableEntry};
use crate::credentials::{CredentialSlot, UntisCredentials};
use crate::errors::SessionError;
use crate::session::SessionClient;

/// Live WebUntis session. Exclusively owned by the session manager.
#[derive(Debug, Clone)]
pub struct UntisSession {
    pub session_id: String,
    pub person_id: Option<i64>,
    pub person_type: Option<i64>,
}

/// What the untis service facade needs from its provider; split out so tests
/// can drive the facade with a scripted stub.
#[async_trait]
pub trait TimetableFetch: SessionClient<Handle = UntisSession> {
    async fn fetch_timetable(
        &self,
        session: &UntisSession,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TimetableEntry>, SessionError>;

    async fn fetch_holidays(
        &self,
        session: &UntisSession,
    ) -> Result<Vec<HolidayEntry>, SessionError>;
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: &'a str,
    method: &'a str,
    params: serde_json::Value,
    jsonrpc: &'a str,
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResult {
    session_id: String,
    person_id: Option<i64>,
    person_type: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawNamed {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPeriod {
    date: u32,
    start_time: u32,
    end_time: u32,
    #[serde(default)]
    su: Vec<RawNamed>,
    #[serde(default)]
    ro: Vec<RawNamed>,
    #[serde(default)]
    kl: Vec<RawNamed>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHoliday {
    name: Option<String>,
    long_name: Option<String>,
    start_date: u32,
    end_date: u32,
}

// ── Parsers ──────────────────────────────────────────────────────────

/// `20260807` → 2026-08-07.
fn parse_untis_date(n: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt((n / 10000) as i32, n / 100 % 100, n % 100)
}

/// `(20260807, 950)` → 2026-08-07 09:50.
fn parse_untis_datetime(date: u32, time: u32) -> Option<NaiveDateTime> {
    parse_untis_date(date)?.and_hms_opt(time / 100, time % 100, 0)
}

/// `2026-08-07` → `20260807`, the integer date format the RPC expects.
fn untis_date(date: NaiveDate) -> u32 {
    date.year() as u32 * 10000 + date.month() * 100 + date.day()
}

fn entry_from_period(period: RawPeriod) -> Option<TimetableEntry> {
    let start = parse_untis_datetime(period.date, period.start_time)?;
    let end = parse_untis_datetime(period.date, period.end_time)?;
    let first_name = |items: &[RawNamed]| {
        items
            .first()
            .and_then(|n| n.name.clone())
            .unwrap_or_default()
    };
    Some(TimetableEntry {
        subject: first_name(&period.su),
        start,
        end,
        room: first_name(&period.ro),
        classes: period.kl.into_iter().filter_map(|k| k.name).collect(),
    })
}

fn holiday_from_raw(raw: RawHoliday) -> Option<HolidayEntry> {
    Some(HolidayEntry {
        name: raw.long_name.or(raw.name).unwrap_or_default(),
        start: parse_untis_date(raw.start_date)?,
        end: parse_untis_date(raw.end_date)?,
    })
}

/// Map a WebUntis RPC error code onto the session error taxonomy.
///
/// `-8504` bad credentials, `-8500` invalid school — both are configuration
/// problems, not worth retrying. `-8520` means the session cookie is no
/// longer accepted.
fn classify_rpc_error(code: i64, message: &str) -> SessionError {
    match code {
        -8504 | -8500 => SessionError::InvalidCredentials,
        -8520 => SessionError::Expired,
        _ => SessionError::transient(format!("untis rpc error {code}: {message}")),
    }
}

fn transport_error(e: &reqwest::Error) -> SessionError {
    if e.is_timeout() {
        SessionError::transient("untis request timed out")
    } else {
        SessionError::transient(format!("untis request failed: {e}"))
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// HTTP implementation of the timetable provider.
pub struct HttpUntisClient {
    http: reqwest::Client,
    creds: Arc<CredentialSlot<UntisCredentials>>,
}

impl HttpUntisClient {
    pub fn new(creds: Arc<CredentialSlot<UntisCredentials>>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("build untis http client");
        Self { http, creds }
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        creds: &UntisCredentials,
        session_id: Option<&str>,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, SessionError> {
        let url = format!(
            "https://{}/WebUntis/jsonrpc.do?school={}",
            creds.server, creds.school
        );
        let mut request = self
            .http
            .post(&url)
            .header(reqwest::header::USER_AGENT, &creds.user_agent)
            .json(&RpcRequest {
                id: "clockd",
                method,
                params,
                jsonrpc: "2.0",
            });
        if let Some(sid) = session_id {
            request = request.header(reqwest::header::COOKIE, format!("JSESSIONID={sid}"));
        }

        let response = request.send().await.map_err(|e| transport_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::transient(format!(
                "untis http status {status}"
            )));
        }
        let envelope: RpcEnvelope<T> = response.json().await.map_err(|e| transport_error(&e))?;
        if let Some(err) = envelope.error {
            return Err(classify_rpc_error(err.code, &err.message));
        }
        envelope
            .result
            .ok_or_else(|| SessionError::transient("untis rpc response missing result"))
    }
}

#[async_trait]
impl SessionClient for HttpUntisClient {
    type Handle = UntisSession;

    async fn login(&self) -> Result<UntisSession, SessionError> {
        let Some(creds) = self.creds.get().await else {
            return Err(SessionError::NotConfigured);
        };
        let auth: AuthResult = self
            .rpc(
                &creds,
                None,
                "authenticate",
                json!({
                    "user": &creds.username,
                    "password": &creds.password,
                    "client": &creds.user_agent,
                }),
            )
            .await?;
        info!(server = %creds.server, user = %creds.username, "untis login ok");
        Ok(UntisSession {
            session_id: auth.session_id,
            person_id: auth.person_id,
            person_type: auth.person_type,
        })
    }

    async fn logout(&self, handle: Arc<UntisSession>) {
        let Some(creds) = self.creds.get().await else {
            return;
        };
        // Best-effort; the server expires the session on its own anyway.
        let result = self
            .rpc::<serde_json::Value>(&creds, Some(&handle.session_id), "logout", json!({}))
            .await;
        if let Err(e) = result {
            debug!("untis logout ignored failure: {e}");
        }
    }
}

#[async_trait]
impl TimetableFetch for HttpUntisClient {
    async fn fetch_timetable(
        &self,
        session: &UntisSession,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TimetableEntry>, SessionError> {
        let Some(creds) = self.creds.get().await else {
            return Err(SessionError::NotConfigured);
        };
        let person_id = session
            .person_id
            .ok_or_else(|| SessionError::transient("untis session has no person id"))?;
        // Person type 5 = student, the only kind a clock account ever is.
        let person_type = session.person_type.unwrap_or(5);

        let periods: Vec<RawPeriod> = self
            .rpc(
                &creds,
                Some(&session.session_id),
                "getTimetable",
                json!({
                    "id": person_id,
                    "type": person_type,
                    "startDate": untis_date(start),
                    "endDate": untis_date(end),
                }),
            )
            .await?;

        let total = periods.len();
        let entries: Vec<TimetableEntry> =
            periods.into_iter().filter_map(entry_from_period).collect();
        if entries.len() < total {
            debug!(
                "untis: dropped {} periods with malformed date/time",
                total - entries.len()
            );
        }
        Ok(entries)
    }

    async fn fetch_holidays(
        &self,
        session: &UntisSession,
    ) -> Result<Vec<HolidayEntry>, SessionError> {
        let Some(creds) = self.creds.get().await else {
            return Err(SessionError::NotConfigured);
        };
        let holidays: Vec<RawHoliday> = self
            .rpc(&creds, Some(&session.session_id), "getHolidays", json!({}))
            .await?;
        Ok(holidays.into_iter().filter_map(holiday_from_raw).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_untis_date() {
        assert_eq!(
            parse_untis_date(20260807),
            NaiveDate::from_ymd_opt(2026, 8, 7)
        );
        assert!(parse_untis_date(20261345).is_none());
    }

    #[test]
    fn test_parse_untis_datetime() {
        let dt = parse_untis_datetime(20260807, 950).unwrap();
        assert_eq!(dt.to_string(), "2026-08-07 09:50:00");
        assert!(parse_untis_datetime(20260807, 2570).is_none());
    }

    #[test]
    fn test_untis_date_roundtrip() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 7).unwrap();
        assert_eq!(untis_date(date), 20260807);
        assert_eq!(parse_untis_date(untis_date(date)), Some(date));
    }

    #[test]
    fn test_period_maps_to_entry() {
        let raw: RawPeriod = serde_json::from_value(json!({
            "date": 20260807,
            "startTime": 800,
            "endTime": 950,
            "su": [{"id": 1, "name": "AM"}],
            "ro": [{"id": 2, "name": "B204"}],
            "kl": [{"id": 3, "name": "5AHITS"}, {"id": 4, "name": "5BHITS"}],
        }))
        .unwrap();

        let entry = entry_from_period(raw).unwrap();
        assert_eq!(entry.subject, "AM");
        assert_eq!(entry.room, "B204");
        assert_eq!(entry.classes, ["5AHITS", "5BHITS"]);
        assert_eq!(entry.start.to_string(), "2026-08-07 08:00:00");
        assert_eq!(entry.end.to_string(), "2026-08-07 09:50:00");
    }

    #[test]
    fn test_period_without_subject_or_room() {
        let raw: RawPeriod = serde_json::from_value(json!({
            "date": 20260807,
            "startTime": 1000,
            "endTime": 1050,
        }))
        .unwrap();

        let entry = entry_from_period(raw).unwrap();
        assert_eq!(entry.subject, "");
        assert_eq!(entry.room, "");
        assert!(entry.classes.is_empty());
    }

    #[test]
    fn test_malformed_period_is_dropped() {
        let raw: RawPeriod = serde_json::from_value(json!({
            "date": 20269999,
            "startTime": 800,
            "endTime": 950,
        }))
        .unwrap();
        assert!(entry_from_period(raw).is_none());
    }

    #[test]
    fn test_holiday_prefers_long_name() {
        let raw: RawHoliday = serde_json::from_value(json!({
            "name": "Sem",
            "longName": "Semesterferien",
            "startDate": 20260216,
            "endDate": 20260222,
        }))
        .unwrap();

        let holiday = holiday_from_raw(raw).unwrap();
        assert_eq!(holiday.name, "Semesterferien");
        assert_eq!(holiday.start.to_string(), "2026-02-16");
        assert_eq!(holiday.end.to_string(), "2026-02-22");
    }

    #[test]
    fn test_rpc_error_classification() {
        assert_eq!(
            classify_rpc_error(-8504, "bad credentials"),
            SessionError::InvalidCredentials
        );
        assert_eq!(
            classify_rpc_error(-8500, "invalid schoolname"),
            SessionError::InvalidCredentials
        );
        assert_eq!(classify_rpc_error(-8520, "not authenticated"), SessionError::Expired);
        assert!(matches!(
            classify_rpc_error(-32601, "method not found"),
            SessionError::Transient(_)
        ));
    }

    #[test]
    fn test_envelope_with_error_has_no_result() {
        let envelope: RpcEnvelope<AuthResult> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "clockd",
            "error": {"code": -8504, "message": "bad credentials"},
        }))
        .unwrap();
        assert!(envelope.result.is_none());
        assert_eq!(envelope.error.map(|e| e.code), Some(-8504));
    }

    #[test]
    fn test_auth_result_parses() {
        let envelope: RpcEnvelope<AuthResult> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "clockd",
            "result": {"sessionId": "F4D6…", "personId": 1234, "personType": 5, "klasseId": 0},
        }))
        .unwrap();
        let auth = envelope.result.unwrap();
        assert_eq!(auth.person_id, Some(1234));
        assert_eq!(auth.person_type, Some(5));
    }
}
