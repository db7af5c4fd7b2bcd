//! Per-device presence state machine
//!
//! ```text
//! New --sample--> Tracking --skip_ms silent--> Closing --close_ms silent--> Closed
//!                    ^                             |                          |
//!                    +----------sample (Reopen)----+--------------------------+
//! ```
//!
//! Eviction after `forget_ms` of silence is decided here but carried out by
//! the collection. Counting is an orthogonal flag with enter/exit hysteresis.

use crate::domain::types::MacAddress;
use crate::services::distance::{distance, DistanceGuard};
use crate::services::filter::AdaptiveFilter;
use crate::services::matcher::Admission;
use crate::services::tunables::Tunables;
use serde::Serialize;
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    New,
    Tracking,
    Closing,
    Closed,
}

/// Transition produced by a fingerprint, relayed to the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Add,
    Reopen,
    Close,
    Left,
    CountAdd,
    CountDel,
}

pub type Transitions = SmallVec<[Lifecycle; 2]>;

#[derive(Debug, Clone)]
pub struct Fingerprint {
    id: String,
    alias: String,
    name: String,
    address: MacAddress,
    resolved_by_irk: bool,
    device_cal_rssi: Option<i32>,
    cal_rssi: i32,
    filter: AdaptiveFilter,
    guard: DistanceGuard,
    raw_rssi: Option<i32>,
    filtered_rssi: Option<f64>,
    first_seen_ms: u64,
    last_seen_ms: u64,
    last_in_range_ms: u64,
    seen_count: u64,
    state: PresenceState,
    counted: bool,
    out_of_range: bool,
    count_pending: bool,
    last_count_check_ms: Option<u64>,
}

/// Serializable view for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FingerprintReport {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub mac: String,
    pub rssi: Option<i32>,
    pub rssi_1m: i32,
    pub filtered_rssi: Option<f64>,
    pub distance: Option<f64>,
    pub state: PresenceState,
    pub counted: bool,
    pub out_of_range: bool,
    pub seen: u64,
}

impl Fingerprint {
    pub fn new(admission: &Admission, tunables: &Tunables, now_ms: u64) -> Self {
        let mut fingerprint = Self {
            id: admission.key.clone(),
            alias: String::new(),
            name: String::new(),
            address: admission.address,
            resolved_by_irk: admission.resolved_by_irk,
            device_cal_rssi: None,
            cal_rssi: tunables.ref_rssi,
            filter: AdaptiveFilter::new(tunables.filter),
            guard: DistanceGuard::new(),
            raw_rssi: None,
            filtered_rssi: None,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            last_in_range_ms: now_ms,
            seen_count: 0,
            state: PresenceState::New,
            counted: false,
            out_of_range: false,
            count_pending: false,
            last_count_check_ms: None,
        };
        fingerprint.refresh_identity(admission);
        fingerprint.cal_rssi = fingerprint.device_cal_rssi.unwrap_or(tunables.ref_rssi);
        fingerprint
    }

    /// Pick up the latest address, name and calibration for this identity
    pub fn refresh_identity(&mut self, admission: &Admission) {
        self.address = admission.address;
        self.resolved_by_irk = admission.resolved_by_irk;
        if let Some(name) = &admission.name {
            self.name.clone_from(name);
        }
        match &admission.device {
            Some(device) => {
                self.alias.clone_from(&device.alias);
                self.device_cal_rssi = device.cal_rssi;
            }
            None => {
                self.alias.clear();
                self.device_cal_rssi = None;
            }
        }
    }

    /// Apply one RSSI sample.
    ///
    /// The filter always advances and every sample refreshes `last_seen`, so
    /// eviction follows radio silence only. Samples clamped to the max distance
    /// count as "left range": they move the presence state only when they are
    /// the first sample, and the close timers keep running against
    /// `last_in_range`.
    pub fn ingest(&mut self, rssi: i32, now_ms: u64, tunables: &Tunables) -> Transitions {
        let mut transitions = Transitions::new();
        let first = self.seen_count == 0;

        self.seen_count += 1;
        self.raw_rssi = Some(rssi);
        let filtered = self.filter.update(f64::from(rssi), now_ms);
        self.filtered_rssi = Some(filtered);

        self.cal_rssi = self.device_cal_rssi.unwrap_or(tunables.ref_rssi);
        let candidate = distance(f64::from(self.cal_rssi), filtered, tunables.absorption());
        let reading = self.guard.update(candidate, tunables.skip_distance, tunables.max_distance);
        self.out_of_range = reading.out_of_range;
        self.last_seen_ms = self.last_seen_ms.max(now_ms);

        if !first && reading.out_of_range {
            return transitions;
        }

        self.last_in_range_ms = self.last_in_range_ms.max(now_ms);
        match self.state {
            PresenceState::New => transitions.push(Lifecycle::Add),
            PresenceState::Closing | PresenceState::Closed => transitions.push(Lifecycle::Reopen),
            PresenceState::Tracking => {}
        }
        self.state = PresenceState::Tracking;
        transitions
    }

    /// Advance `Tracking -> Closing -> Closed` once nothing in range was heard; may cascade
    pub fn check_close(&mut self, now_ms: u64, tunables: &Tunables) -> Transitions {
        let mut transitions = Transitions::new();
        let silent = now_ms.saturating_sub(self.last_in_range_ms);

        if self.state == PresenceState::Tracking && silent > tunables.skip_ms {
            self.state = PresenceState::Closing;
            transitions.push(Lifecycle::Close);
        }
        if self.state == PresenceState::Closing && silent > tunables.close_ms {
            self.state = PresenceState::Closed;
            transitions.push(Lifecycle::Left);
        }
        transitions
    }

    /// Occupancy hysteresis, evaluated at most once per `count_ms`
    pub fn check_count(&mut self, now_ms: u64, tunables: &Tunables) -> Option<Lifecycle> {
        if let Some(last) = self.last_count_check_ms {
            if tunables.count_ms > 0 && now_ms.saturating_sub(last) < tunables.count_ms {
                return None;
            }
        }
        self.last_count_check_ms = Some(now_ms);

        let countable = tunables.is_countable(&self.id, &self.alias);
        let present = self.state == PresenceState::Tracking && !self.out_of_range;
        let distance = self.distance();

        if self.counted {
            let beyond_exit = distance.map_or(true, |d| d > tunables.count_exit);
            if !countable || !present || beyond_exit {
                self.counted = false;
                self.count_pending = false;
                return Some(Lifecycle::CountDel);
            }
            return None;
        }

        let within_enter = distance.is_some_and(|d| d < tunables.count_enter);
        if countable && present && within_enter {
            if self.count_pending {
                self.counted = true;
                self.count_pending = false;
                return Some(Lifecycle::CountAdd);
            }
            self.count_pending = true;
        } else {
            self.count_pending = false;
        }
        None
    }

    /// Drop the counted flag unconditionally, e.g. before eviction
    pub fn release_count(&mut self) -> Option<Lifecycle> {
        self.count_pending = false;
        std::mem::take(&mut self.counted).then_some(Lifecycle::CountDel)
    }

    pub fn should_forget(&self, now_ms: u64, tunables: &Tunables) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) > tunables.forget_ms
    }

    /// Visible distance in meters; `None` before the first sample
    pub fn distance(&self) -> Option<f64> {
        self.guard.current().map(|r| r.meters)
    }

    pub fn report(&self) -> FingerprintReport {
        FingerprintReport {
            id: self.id.clone(),
            alias: self.alias.clone(),
            name: self.name.clone(),
            mac: self.address.to_string(),
            rssi: self.raw_rssi,
            rssi_1m: self.cal_rssi,
            filtered_rssi: self.filtered_rssi.map(|v| (v * 100.0).round() / 100.0),
            distance: self.distance().map(|d| (d * 100.0).round() / 100.0),
            state: self.state,
            counted: self.counted,
            out_of_range: self.out_of_range,
            seen: self.seen_count,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    pub fn resolved_by_irk(&self) -> bool {
        self.resolved_by_irk
    }

    /// Calibration used for the latest distance
    pub fn cal_rssi(&self) -> i32 {
        self.cal_rssi
    }

    pub fn filter(&self) -> &AdaptiveFilter {
        &self.filter
    }

    pub fn raw_rssi(&self) -> Option<i32> {
        self.raw_rssi
    }

    pub fn filtered_rssi(&self) -> Option<f64> {
        self.filtered_rssi
    }

    pub fn first_seen_ms(&self) -> u64 {
        self.first_seen_ms
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms
    }

    pub fn last_in_range_ms(&self) -> u64 {
        self.last_in_range_ms
    }

    pub fn seen_count(&self) -> u64 {
        self.seen_count
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn counted(&self) -> bool {
        self.counted
    }

    pub fn out_of_range(&self) -> bool {
        self.out_of_range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::DeviceConfig;
    use crate::services::filter::FilterParams;

    const CAL: i32 = -59;

    /// Filter that follows its input almost exactly at 1 s spacing
    fn tunables() -> Tunables {
        Tunables {
            absorption: 2.0,
            ref_rssi: CAL,
            skip_distance: 0.0,
            count_ms: 0,
            filter: FilterParams { fcmin: 1.0, beta: 0.0, dcutoff: 1.0 },
            ..Default::default()
        }
    }

    fn rssi_for(meters: f64) -> i32 {
        (f64::from(CAL) - 20.0 * meters.log10()).round() as i32
    }

    fn admission(key: &str) -> Admission {
        Admission {
            key: key.to_string(),
            address: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            resolved_by_irk: false,
            device: None,
            name: None,
        }
    }

    #[test]
    fn test_first_sample_adds() {
        let t = tunables();
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 1_000);
        assert_eq!(fp.distance(), None);
        assert_eq!(fp.state(), PresenceState::New);

        let transitions = fp.ingest(CAL, 1_000, &t);
        assert_eq!(transitions.as_slice(), &[Lifecycle::Add]);
        assert_eq!(fp.state(), PresenceState::Tracking);
        assert_eq!(fp.filtered_rssi(), Some(f64::from(CAL)));
        assert!((fp.distance().unwrap() - 1.0).abs() < 1e-9);

        assert!(fp.ingest(CAL, 2_000, &t).is_empty());
        assert_eq!(fp.seen_count(), 2);
    }

    #[test]
    fn test_device_calibration_and_ref_rssi() {
        let mut t = tunables();
        let mut with_device = admission("aabbccddeeff");
        with_device.device = Some(DeviceConfig { id: "aabbccddeeff".into(), cal_rssi: Some(-70), ..Default::default() });
        let mut fp = Fingerprint::new(&with_device, &t, 0);
        fp.ingest(-70, 0, &t);
        assert_eq!(fp.cal_rssi(), -70);
        assert!((fp.distance().unwrap() - 1.0).abs() < 1e-9);

        // Without a device entry the collection reference is used, read at ingest time
        let mut fp = Fingerprint::new(&admission("112233445566"), &t, 0);
        t.ref_rssi = -65;
        fp.ingest(-65, 0, &t);
        assert_eq!(fp.cal_rssi(), -65);
    }

    #[test]
    fn test_skip_distance_holds_one_update() {
        let mut t = tunables();
        t.skip_distance = 1.0;
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        fp.ingest(-59, 1_000, &t);

        fp.ingest(-79, 2_000, &t);
        assert!((fp.distance().unwrap() - 1.0).abs() < 1e-9);
        // Filter advanced regardless
        assert!(fp.filtered_rssi().unwrap() < -78.9);

        fp.ingest(-79, 3_000, &t);
        assert!((fp.distance().unwrap() - 10.0).abs() < 0.05);
    }

    #[test]
    fn test_close_then_left_cascade() {
        let t = tunables();
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        fp.ingest(CAL, 0, &t);

        assert!(fp.check_close(t.skip_ms, &t).is_empty());
        assert_eq!(fp.check_close(t.skip_ms + 1, &t).as_slice(), &[Lifecycle::Close]);
        assert_eq!(fp.state(), PresenceState::Closing);
        assert!(fp.check_close(t.skip_ms + 2, &t).is_empty());
        assert_eq!(fp.check_close(t.close_ms + 1, &t).as_slice(), &[Lifecycle::Left]);
        assert_eq!(fp.state(), PresenceState::Closed);
        assert!(fp.check_close(t.close_ms + 5_000, &t).is_empty());

        let mut fp = Fingerprint::new(&admission("112233445566"), &t, 0);
        fp.ingest(CAL, 0, &t);
        assert_eq!(fp.check_close(t.close_ms + 1, &t).as_slice(), &[Lifecycle::Close, Lifecycle::Left]);
    }

    #[test]
    fn test_reopen_after_close() {
        let t = tunables();
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        fp.ingest(CAL, 0, &t);
        fp.check_close(t.close_ms + 1, &t);

        let transitions = fp.ingest(CAL, t.close_ms + 2, &t);
        assert_eq!(transitions.as_slice(), &[Lifecycle::Reopen]);
        assert_eq!(fp.state(), PresenceState::Tracking);
    }

    #[test]
    fn test_out_of_range_keeps_alive_but_closes() {
        let t = tunables();
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        fp.ingest(CAL, 0, &t);

        fp.ingest(-95, 1_000, &t);
        assert!(fp.out_of_range());
        assert_eq!(fp.distance(), Some(t.max_distance));
        assert_eq!(fp.last_seen_ms(), 1_000);
        assert_eq!(fp.last_in_range_ms(), 0);

        // Close timers run from the last in-range sample
        assert_eq!(fp.check_close(t.close_ms + 1, &t).as_slice(), &[Lifecycle::Close, Lifecycle::Left]);

        // Closed devices stay closed while only out-of-range samples arrive
        assert!(fp.ingest(-95, t.close_ms + 2, &t).is_empty());
        assert_eq!(fp.state(), PresenceState::Closed);
        assert_eq!(fp.last_seen_ms(), t.close_ms + 2);
        assert!(!fp.should_forget(t.close_ms + 2 + t.forget_ms, &t));

        // Back in range reopens
        assert_eq!(fp.ingest(CAL, t.close_ms + 1_002, &t).as_slice(), &[Lifecycle::Reopen]);
    }

    #[test]
    fn test_first_sample_out_of_range_still_adds() {
        let t = tunables();
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 500);
        assert_eq!(fp.ingest(-95, 500, &t).as_slice(), &[Lifecycle::Add]);
        assert!(fp.out_of_range());
        assert_eq!(fp.last_seen_ms(), 500);
    }

    #[test]
    fn test_count_needs_two_evaluations() {
        let t = tunables();
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        fp.ingest(rssi_for(1.0), 0, &t);
        assert_eq!(fp.check_count(0, &t), None);
        assert!(!fp.counted());
        assert_eq!(fp.check_count(1, &t), Some(Lifecycle::CountAdd));
        assert!(fp.counted());
    }

    #[test]
    fn test_count_hysteresis_band_never_toggles() {
        let mut t = tunables();
        t.count_enter = 2.0;
        t.count_exit = 3.0;

        // Counted device oscillating inside the band stays counted
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        let mut now = 0;
        for _ in 0..2 {
            now += 1_000;
            fp.ingest(rssi_for(1.5), now, &t);
            fp.check_count(now, &t);
        }
        assert!(fp.counted());
        for i in 0..20 {
            now += 1_000;
            let d = if i % 2 == 0 { 2.5 } else { 2.9 };
            fp.ingest(rssi_for(d), now, &t);
            assert_eq!(fp.check_count(now, &t), None, "toggled at {d}");
        }
        assert!(fp.counted());

        now += 1_000;
        fp.ingest(rssi_for(4.0), now, &t);
        assert_eq!(fp.check_count(now, &t), Some(Lifecycle::CountDel));

        // Uncounted device oscillating inside the band never enters
        let mut fp = Fingerprint::new(&admission("112233445566"), &t, 0);
        for i in 0..20 {
            now += 1_000;
            let d = if i % 2 == 0 { 2.5 } else { 2.9 };
            fp.ingest(rssi_for(d), now, &t);
            assert_eq!(fp.check_count(now, &t), None);
        }
        assert!(!fp.counted());
    }

    #[test]
    fn test_count_throttled_by_count_ms() {
        let mut t = tunables();
        t.count_ms = 10_000;
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        fp.ingest(rssi_for(1.0), 0, &t);
        assert_eq!(fp.check_count(0, &t), None);
        assert_eq!(fp.check_count(5_000, &t), None);
        assert!(!fp.counted());
        assert_eq!(fp.check_count(10_000, &t), Some(Lifecycle::CountAdd));
    }

    #[test]
    fn test_count_drops_when_closing_or_not_countable() {
        let mut t = tunables();
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        fp.ingest(rssi_for(1.0), 0, &t);
        fp.check_count(0, &t);
        fp.check_count(0, &t);
        assert!(fp.counted());

        fp.check_close(t.skip_ms + 1, &t);
        assert_eq!(fp.check_count(t.skip_ms + 1, &t), Some(Lifecycle::CountDel));

        t.count_ids = crate::services::matcher::PatternSet::parse("phone-");
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        fp.ingest(rssi_for(1.0), 0, &t);
        fp.check_count(0, &t);
        assert_eq!(fp.check_count(0, &t), None);
        assert!(!fp.counted());
    }

    #[test]
    fn test_should_forget() {
        let t = tunables();
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        fp.ingest(CAL, 0, &t);
        assert!(!fp.should_forget(t.forget_ms, &t));
        assert!(fp.should_forget(t.forget_ms + 1, &t));
    }

    #[test]
    fn test_refresh_identity_tracks_config() {
        let t = tunables();
        let mut adm = admission("aabbccddeeff");
        adm.name = Some("Watch".into());
        let mut fp = Fingerprint::new(&adm, &t, 0);
        assert_eq!(fp.name(), "Watch");

        adm.name = None;
        adm.device = Some(DeviceConfig { id: "aabbccddeeff".into(), alias: "wrist".into(), ..Default::default() });
        fp.refresh_identity(&adm);
        assert_eq!(fp.name(), "Watch");
        assert_eq!(fp.alias(), "wrist");

        adm.device = None;
        fp.refresh_identity(&adm);
        assert_eq!(fp.alias(), "");
    }

    #[test]
    fn test_report_serializes() {
        let t = tunables();
        let mut fp = Fingerprint::new(&admission("aabbccddeeff"), &t, 0);
        fp.ingest(CAL, 0, &t);
        let json = serde_json::to_value(fp.report()).unwrap();
        assert_eq!(json["id"], "aabbccddeeff");
        assert_eq!(json["mac"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(json["state"], "tracking");
        assert_eq!(json["distance"], 1.0);
        assert!(json.get("alias").is_none());
    }
}
