use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::trace;

use crate::config::FlapSettings;

/// Bound on the recorded transition history per device.
pub const K_HISTORY: usize = 10;

/// Flap threshold applied to ISP uplinks instead of the configured one.
pub const ISP_FLAP_THRESHOLD: u32 = 2;

/// Snapshot of the per-device state machine columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StateFields {
    pub down_since: Option<DateTime<Utc>>,
    pub is_flapping: bool,
    pub flap_count: i32,
    pub flapping_since: Option<DateTime<Utc>>,
    pub last_flap_detected: Option<DateTime<Utc>>,
    pub status_change_times: Vec<DateTime<Utc>>,
}

impl StateFields {
    pub fn up() -> Self {
        StateFields {
            down_since: None,
            is_flapping: false,
            flap_count: 0,
            flapping_since: None,
            last_flap_detected: None,
            status_change_times: vec![],
        }
    }

    pub fn is_up(&self) -> bool {
        self.down_since.is_none()
    }

    pub fn status_label(&self) -> &'static str {
        if self.is_up() {
            "up"
        } else {
            "down"
        }
    }

    fn changes_in_window(&self, now: DateTime<Utc>, window: ChronoDuration) -> Vec<DateTime<Utc>> {
        let cutoff = now - window;
        self.status_change_times
            .iter()
            .copied()
            .filter(|t| *t >= cutoff)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    WentDown,
    Recovered,
    FlappingStarted,
    FlappingCleared,
}

/// Outcome of feeding one ping result through the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub fields: StateFields,
    pub status_changed: bool,
    pub events: Vec<StateEvent>,
}

/// Pure transition function; the caller applies `fields` under a row lock.
pub fn apply_ping(
    current: &StateFields,
    reachable: bool,
    now: DateTime<Utc>,
    flap: &FlapSettings,
    isp_uplink: bool,
) -> Transition {
    let mut fields = current.clone();
    let mut events = Vec::new();

    let status_changed = match (current.down_since, reachable) {
        (None, false) => {
            fields.down_since = Some(now);
            events.push(StateEvent::WentDown);
            true
        }
        (Some(_), true) => {
            fields.down_since = None;
            events.push(StateEvent::Recovered);
            true
        }
        _ => false,
    };

    if status_changed {
        fields.status_change_times.push(now);
        let len = fields.status_change_times.len();
        if len > K_HISTORY {
            fields.status_change_times.drain(..len - K_HISTORY);
        }
    }

    let window = ChronoDuration::from_std(flap.window).unwrap_or_else(|_| ChronoDuration::zero());
    let clear_window =
        ChronoDuration::from_std(flap.clear_window).unwrap_or_else(|_| ChronoDuration::zero());
    let threshold = if isp_uplink {
        ISP_FLAP_THRESHOLD
    } else {
        flap.threshold
    };

    let in_window = fields.changes_in_window(now, window);
    if status_changed && in_window.len() as u32 >= threshold {
        fields.last_flap_detected = Some(now);
        if !fields.is_flapping {
            fields.is_flapping = true;
            fields.flapping_since = in_window.first().copied();
            fields.flap_count += 1;
            events.push(StateEvent::FlappingStarted);
        }
    } else if fields.is_flapping {
        let quiet = fields.changes_in_window(now, clear_window).is_empty();
        if quiet {
            fields.is_flapping = false;
            fields.flapping_since = None;
            events.push(StateEvent::FlappingCleared);
        }
    }

    trace!(
        "state: reachable={} changed={} flapping={} window_changes={}",
        reachable,
        status_changed,
        fields.is_flapping,
        in_window.len()
    );

    Transition {
        fields,
        status_changed,
        events,
    }
}

/// Post-transition consistency check; a violation is logged and counted,
/// never panicked on.
pub fn invariant_violation(fields: &StateFields, reachable: bool) -> Option<&'static str> {
    match (fields.down_since, reachable) {
        (None, false) => Some("device reported unreachable but down_since is null"),
        (Some(_), true) => Some("device reported reachable but down_since is set"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn flap_settings() -> FlapSettings {
        FlapSettings {
            window: Duration::from_secs(300),
            threshold: 3,
            clear_window: Duration::from_secs(900),
        }
    }

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn up_stays_up_on_success() {
        let tr = apply_ping(&StateFields::up(), true, t(0), &flap_settings(), false);
        assert!(tr.fields.is_up());
        assert!(!tr.status_changed);
        assert!(tr.events.is_empty());
    }

    #[test]
    fn outage_and_recovery() {
        let flap = flap_settings();
        let tr = apply_ping(&StateFields::up(), false, t(30), &flap, false);
        assert_eq!(tr.fields.down_since, Some(t(30)));
        assert!(tr.status_changed);
        assert_eq!(tr.events, vec![StateEvent::WentDown]);

        let tr2 = apply_ping(&tr.fields, true, t(60), &flap, false);
        assert!(tr2.fields.is_up());
        assert_eq!(tr2.events, vec![StateEvent::Recovered]);
        assert_eq!(tr2.fields.status_change_times, vec![t(30), t(60)]);
    }

    #[test]
    fn down_stays_down_without_new_transition() {
        let flap = flap_settings();
        let down = apply_ping(&StateFields::up(), false, t(0), &flap, false).fields;
        let tr = apply_ping(&down, false, t(30), &flap, false);
        assert!(!tr.status_changed);
        assert_eq!(tr.fields.down_since, Some(t(0)));
        assert_eq!(tr.fields.status_change_times.len(), 1);
    }

    #[test]
    fn replaying_same_result_is_idempotent() {
        let flap = flap_settings();
        let down = apply_ping(&StateFields::up(), false, t(0), &flap, false).fields;
        let replay = apply_ping(&down, false, t(0), &flap, false);
        assert_eq!(replay.fields, down);
        assert!(replay.events.is_empty());
    }

    #[test]
    fn flapping_requires_exactly_threshold_transitions() {
        let flap = flap_settings();
        let mut fields = StateFields::up();
        // two transitions inside the window: not yet flapping
        fields = apply_ping(&fields, false, t(0), &flap, false).fields;
        fields = apply_ping(&fields, true, t(60), &flap, false).fields;
        assert!(!fields.is_flapping);

        // third transition trips the threshold
        let tr = apply_ping(&fields, false, t(120), &flap, false);
        assert!(tr.fields.is_flapping);
        assert!(tr.events.contains(&StateEvent::FlappingStarted));
        assert_eq!(tr.fields.flap_count, 1);
        assert_eq!(tr.fields.flapping_since, Some(t(0)));
    }

    #[test]
    fn isp_uplink_flaps_at_two_transitions() {
        let flap = flap_settings();
        let mut fields = StateFields::up();
        fields = apply_ping(&fields, false, t(0), &flap, true).fields;
        assert!(!fields.is_flapping);
        let tr = apply_ping(&fields, true, t(60), &flap, true);
        assert!(tr.fields.is_flapping);
        assert!(tr.events.contains(&StateEvent::FlappingStarted));
    }

    #[test]
    fn transitions_outside_window_do_not_count() {
        let flap = flap_settings();
        let mut fields = StateFields::up();
        fields = apply_ping(&fields, false, t(0), &flap, false).fields;
        fields = apply_ping(&fields, true, t(400), &flap, false).fields;
        // only the t=400 and t=700 transitions are inside the 300 s window
        let tr = apply_ping(&fields, false, t(700), &flap, false);
        assert!(!tr.fields.is_flapping);
    }

    #[test]
    fn flapping_clears_after_quiet_period() {
        let flap = flap_settings();
        let mut fields = StateFields::up();
        fields = apply_ping(&fields, false, t(0), &flap, false).fields;
        fields = apply_ping(&fields, true, t(60), &flap, false).fields;
        fields = apply_ping(&fields, false, t(120), &flap, false).fields;
        assert!(fields.is_flapping);

        // still inside the clear window: stays flapping
        let tr = apply_ping(&fields, false, t(600), &flap, false);
        assert!(tr.fields.is_flapping);

        // 15 minutes after the last transition: cleared
        let tr = apply_ping(&tr.fields, false, t(120 + 901), &flap, false);
        assert!(!tr.fields.is_flapping);
        assert!(tr.events.contains(&StateEvent::FlappingCleared));
        // flap_count is cumulative and survives the clear
        assert_eq!(tr.fields.flap_count, 1);
    }

    #[test]
    fn history_is_bounded() {
        let flap = flap_settings();
        let mut fields = StateFields::up();
        for i in 0..2 * K_HISTORY as i64 {
            let reachable = i % 2 == 1;
            fields = apply_ping(&fields, reachable, t(i * 1000), &flap, false).fields;
        }
        assert_eq!(fields.status_change_times.len(), K_HISTORY);
        // the kept entries are the most recent ones
        assert!(fields.status_change_times[0] > t(0));
    }

    #[test]
    fn invariant_check_catches_mismatch() {
        let up = StateFields::up();
        assert!(invariant_violation(&up, true).is_none());
        assert!(invariant_violation(&up, false).is_some());
    }
}
