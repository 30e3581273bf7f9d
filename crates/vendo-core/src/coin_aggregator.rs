//! CoinAggregator (§4.3): the single, appliance-wide insert-window state
//! machine. Guards the physical coin slot's mutual exclusion.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

const PULSE_IDLE: Duration = Duration::seconds(30);
const ABSOLUTE_DEADLINE: Duration = Duration::seconds(60);

/// Whether the open session accepts pulses from any source or only one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendoMode {
    Auto,
    Manual,
}

/// A transient, at-most-one-per-appliance insert window.
#[derive(Debug, Clone)]
pub struct CoinSession {
    pub owner_mac: String,
    pub owner_client_id: Option<String>,
    pub pending_amount: i64,
    pub per_source_amount: BTreeMap<String, i64>,
    pub mode: VendoMode,
    pub target_source: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub timer_deadline: DateTime<Utc>,
    pub pulse_count: i64,
    relay_energized: bool,
}

impl CoinSession {
    fn new(owner_mac: String, owner_client_id: Option<String>, mode: VendoMode, target: Option<String>, now: DateTime<Utc>) -> Self {
        let relay_energized = match (mode, target.as_deref()) {
            (VendoMode::Auto, _) => true,
            (VendoMode::Manual, Some("hardware")) => true,
            (VendoMode::Manual, _) => false,
        };
        Self {
            owner_mac,
            owner_client_id,
            pending_amount: 0,
            per_source_amount: BTreeMap::new(),
            mode,
            target_source: target,
            opened_at: now,
            last_activity_at: now,
            timer_deadline: now + PULSE_IDLE,
            pulse_count: 0,
            relay_energized,
        }
    }

    pub fn relay_energized(&self) -> bool {
        self.relay_energized
    }

    fn absolute_deadline(&self) -> DateTime<Utc> {
        self.opened_at + ABSOLUTE_DEADLINE
    }
}

/// What `start_insert` did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Opened,
    Reopened,
    Busy,
}

/// What `pulse` did with an incoming pulse event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PulseOutcome {
    Accepted { pending_amount: i64 },
    DroppedWrongTarget,
    DroppedIdle,
    Banned,
}

/// The accumulated session handed off for crediting once a session closes.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub owner_mac: String,
    pub owner_client_id: Option<String>,
    pub per_source_amount: BTreeMap<String, i64>,
}

/// A read-only snapshot of the open coin-insert window, for `status()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSessionView {
    pub owner_mac: String,
    pub mode: VendoMode,
    pub target_source: Option<String>,
    pub pending_amount: i64,
    pub pulse_count: i64,
    pub timer_deadline: DateTime<Utc>,
}

#[derive(Debug)]
enum State {
    Idle,
    Open(CoinSession),
    Committing(CoinSession),
}

/// One aggregator instance per appliance; internally synchronized so
/// pulse/start/done calls from different tasks serialize cleanly.
pub struct CoinAggregator {
    state: Mutex<State>,
    ban_limit_pulses_per_window: i64,
}

impl CoinAggregator {
    pub fn new(ban_limit_pulses_per_window: i64) -> Self {
        Self {
            state: Mutex::new(State::Idle),
            ban_limit_pulses_per_window,
        }
    }

    pub fn start_insert(
        &self,
        owner_mac: &str,
        owner_client_id: Option<&str>,
        mode: VendoMode,
        target: Option<&str>,
        now: DateTime<Utc>,
    ) -> StartOutcome {
        let mut state = self.state.lock().unwrap();
        match &*state {
            State::Idle => {
                *state = State::Open(CoinSession::new(
                    owner_mac.to_string(),
                    owner_client_id.map(str::to_string),
                    mode,
                    target.map(str::to_string),
                    now,
                ));
                StartOutcome::Opened
            }
            State::Open(session) if session.owner_mac == owner_mac => {
                StartOutcome::Reopened
            }
            _ => StartOutcome::Busy,
        }
    }

    /// Pulses arriving in `Idle` are dropped; callers should log this.
    pub fn pulse(&self, source: &str, count: i64, pulse_value_pesos: i64, now: DateTime<Utc>) -> PulseOutcome {
        let mut state = self.state.lock().unwrap();
        let State::Open(session) = &mut *state else {
            return PulseOutcome::DroppedIdle;
        };

        if session.mode == VendoMode::Manual {
            if session.target_source.as_deref() != Some(source) {
                return PulseOutcome::DroppedWrongTarget;
            }
        }

        session.pulse_count += count;
        if session.pulse_count > self.ban_limit_pulses_per_window {
            *state = State::Idle;
            return PulseOutcome::Banned;
        }

        let priced = count * pulse_value_pesos;
        session.pending_amount += priced;
        *session.per_source_amount.entry(source.to_string()).or_insert(0) += priced;
        session.last_activity_at = now;
        session.timer_deadline = now + PULSE_IDLE;

        PulseOutcome::Accepted { pending_amount: session.pending_amount }
    }

    /// Explicit "done": closes the window and hands off for commit.
    /// Returns `None` if there was no open session.
    pub fn done(&self) -> Option<CommitRequest> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Idle) {
            State::Open(session) => {
                let request = CommitRequest {
                    owner_mac: session.owner_mac.clone(),
                    owner_client_id: session.owner_client_id.clone(),
                    per_source_amount: session.per_source_amount.clone(),
                };
                *state = State::Committing(session);
                Some(request)
            }
            other => {
                *state = other;
                None
            }
        }
    }

    /// Called periodically (alongside the Ticker) to fire the pulse-idle
    /// or absolute deadline even with no further pulses.
    pub fn poll_deadline(&self, now: DateTime<Utc>) -> Option<CommitRequest> {
        let mut state = self.state.lock().unwrap();
        let expired = matches!(&*state, State::Open(session)
            if now >= session.timer_deadline || now >= session.absolute_deadline());
        if !expired {
            return None;
        }
        match std::mem::replace(&mut *state, State::Idle) {
            State::Open(session) => {
                let request = CommitRequest {
                    owner_mac: session.owner_mac.clone(),
                    owner_client_id: session.owner_client_id.clone(),
                    per_source_amount: session.per_source_amount.clone(),
                };
                *state = State::Committing(session);
                Some(request)
            }
            other => {
                *state = other;
                None
            }
        }
    }

    /// CreditApplier reported terminal success: return to Idle.
    pub fn commit_complete(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(&*state, State::Committing(_)) {
            *state = State::Idle;
        }
    }

    /// An operator explicitly abandons a stuck commit.
    pub fn abort_commit(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(&*state, State::Committing(_)) {
            *state = State::Idle;
        }
    }

    /// Snapshot of the pending amount, if a session is open.
    pub fn pending_amount(&self) -> Option<i64> {
        match &*self.state.lock().unwrap() {
            State::Open(session) => Some(session.pending_amount),
            _ => None,
        }
    }

    pub fn is_committing(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), State::Committing(_))
    }

    /// Snapshot of the open session, if any, for `status()`'s `coin_session`
    /// field.
    pub fn current_session(&self) -> Option<CoinSessionView> {
        match &*self.state.lock().unwrap() {
            State::Open(session) => Some(CoinSessionView {
                owner_mac: session.owner_mac.clone(),
                mode: session.mode,
                target_source: session.target_source.clone(),
                pending_amount: session.pending_amount,
                pulse_count: session.pulse_count,
                timer_deadline: session.timer_deadline,
            }),
            _ => None,
        }
    }

    /// The mode of the open session, or `Auto` (the appliance default) when
    /// idle — `status()`'s `vendo_mode` field is always present.
    pub fn mode(&self) -> VendoMode {
        match &*self.state.lock().unwrap() {
            State::Open(session) | State::Committing(session) => session.mode,
            State::Idle => VendoMode::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn start_insert_opens_session_when_idle() {
        let agg = CoinAggregator::new(200);
        let outcome = agg.start_insert("aa:bb:cc:dd:ee:01", Some("c1"), VendoMode::Auto, None, now());
        assert_eq!(outcome, StartOutcome::Opened);
    }

    #[test]
    fn start_insert_by_different_owner_is_busy() {
        let agg = CoinAggregator::new(200);
        agg.start_insert("aa:bb:cc:dd:ee:01", None, VendoMode::Auto, None, now());
        let outcome = agg.start_insert("aa:bb:cc:dd:ee:02", None, VendoMode::Auto, None, now());
        assert_eq!(outcome, StartOutcome::Busy);
    }

    #[test]
    fn same_owner_reopening_preserves_pending_amount() {
        let agg = CoinAggregator::new(200);
        agg.start_insert("aa:bb:cc:dd:ee:01", None, VendoMode::Auto, None, now());
        agg.pulse("hardware", 2, 1, now());
        let outcome = agg.start_insert("aa:bb:cc:dd:ee:01", None, VendoMode::Auto, None, now());
        assert_eq!(outcome, StartOutcome::Reopened);
        assert_eq!(agg.pending_amount(), Some(2));
    }

    #[test]
    fn pulse_in_idle_is_dropped() {
        let agg = CoinAggregator::new(200);
        let outcome = agg.pulse("hardware", 1, 1, now());
        assert_eq!(outcome, PulseOutcome::DroppedIdle);
    }

    #[test]
    fn manual_mode_drops_pulses_from_non_target_source() {
        // S3
        let agg = CoinAggregator::new(200);
        agg.start_insert("aa:bb:cc:dd:ee:01", None, VendoMode::Manual, Some("remote:a"), now());
        let dropped = agg.pulse("hardware", 2, 1, now());
        assert_eq!(dropped, PulseOutcome::DroppedWrongTarget);
        let accepted = agg.pulse("remote:a", 3, 1, now());
        assert_eq!(accepted, PulseOutcome::Accepted { pending_amount: 3 });

        let request = agg.done().unwrap();
        assert_eq!(request.per_source_amount.len(), 1);
        assert_eq!(request.per_source_amount["remote:a"], 3);
    }

    #[test]
    fn pulse_applies_per_source_pricing_at_the_aggregator() {
        let agg = CoinAggregator::new(200);
        agg.start_insert("aa:bb:cc:dd:ee:01", None, VendoMode::Auto, None, now());
        let outcome = agg.pulse("remote:a", 4, 2, now());
        assert_eq!(outcome, PulseOutcome::Accepted { pending_amount: 8 });
    }

    #[test]
    fn exceeding_ban_limit_drops_session_without_committing() {
        let agg = CoinAggregator::new(5);
        agg.start_insert("aa:bb:cc:dd:ee:01", None, VendoMode::Auto, None, now());
        let outcome = agg.pulse("hardware", 10, 1, now());
        assert_eq!(outcome, PulseOutcome::Banned);
        assert_eq!(agg.done(), None);
    }

    #[test]
    fn done_on_idle_returns_none() {
        let agg = CoinAggregator::new(200);
        assert!(agg.done().is_none());
    }

    #[test]
    fn poll_deadline_commits_after_pulse_idle_window() {
        // S2
        let agg = CoinAggregator::new(200);
        let t0 = now();
        agg.start_insert("aa:bb:cc:dd:ee:01", None, VendoMode::Auto, None, t0);
        agg.pulse("hardware", 5, 1, t0);

        assert!(agg.poll_deadline(t0 + Duration::seconds(20)).is_none());
        let commit = agg.poll_deadline(t0 + Duration::seconds(31)).unwrap();
        assert_eq!(commit.per_source_amount["hardware"], 5);
        assert!(agg.is_committing());

        agg.commit_complete();
        assert!(!agg.is_committing());
    }

    #[test]
    fn auto_mode_energizes_local_relay() {
        let agg = CoinAggregator::new(200);
        agg.start_insert("aa:bb:cc:dd:ee:01", None, VendoMode::Auto, None, now());
        let request = agg.done();
        assert!(request.is_some());
    }

    #[test]
    fn manual_mode_with_remote_target_leaves_relay_deenergized() {
        let session = CoinSession::new("m".to_string(), None, VendoMode::Manual, Some("remote:a".to_string()), now());
        assert!(!session.relay_energized());
    }

    #[test]
    fn manual_mode_with_local_target_energizes_relay() {
        let session = CoinSession::new("m".to_string(), None, VendoMode::Manual, Some("hardware".to_string()), now());
        assert!(session.relay_energized());
    }

    #[test]
    fn current_session_reflects_open_window_and_clears_on_done() {
        let agg = CoinAggregator::new(200);
        assert!(agg.current_session().is_none());
        assert_eq!(agg.mode(), VendoMode::Auto);

        agg.start_insert("aa:bb:cc:dd:ee:01", None, VendoMode::Manual, Some("remote:a"), now());
        agg.pulse("remote:a", 4, 2, now());

        let view = agg.current_session().unwrap();
        assert_eq!(view.owner_mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(view.mode, VendoMode::Manual);
        assert_eq!(view.target_source.as_deref(), Some("remote:a"));
        assert_eq!(view.pending_amount, 8);
        assert_eq!(agg.mode(), VendoMode::Manual);

        agg.done();
        assert!(agg.current_session().is_none());
    }
}
