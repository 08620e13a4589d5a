//! Motion model for a single simulated unit.

use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use realtime::GeoPoint;
use tokio::time::Instant;

use crate::config::SimulatorConfig;
use crate::position::Position;
use crate::proximity::{haversine_km, initial_bearing};

pub const KM_PER_MILE: f64 = 1.609_34;

// peak slope of the cubic ease-in-out, reached mid segment
const EASE_PEAK_RATE: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No route: the unit holds its position.
    Idle,
    Moving,
    Waiting,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Idle,
    Moving { origin: GeoPoint, started: Instant, eta: Duration },
    Waiting { until: Instant },
}

/// A unit driven around a closed loop of waypoints.
///
/// Segments are travelled with a cubic ease-in-out. The ETA is sized from the
/// segment length so that the eased speed peaks at the current cruise speed
/// mid segment; reported speeds never exceed it. On arrival the unit dwells at
/// the waypoint for a random interval and picks a new cruise speed.
#[derive(Debug)]
pub struct SimulatedUnit {
    position: GeoPoint,
    heading: f64,
    route: Vec<GeoPoint>,
    next: usize,
    cruise_mph: f64,
    state: State,
    last_step: Instant,
    config: SimulatorConfig,
    rng: StdRng,
}

impl SimulatedUnit {
    #[must_use]
    pub fn new(
        start: GeoPoint, route: Vec<GeoPoint>, config: SimulatorConfig, mut rng: StdRng,
        now: Instant,
    ) -> Self {
        let config = sanitize(config);
        let cruise_mph = rng.gen_range(config.speed_min_mph..=config.speed_max_mph);
        let mut unit = Self {
            position: start,
            heading: 0.0,
            route,
            next: 0,
            cruise_mph,
            state: State::Idle,
            last_step: now,
            config,
            rng,
        };
        if !unit.route.is_empty() {
            unit.depart(now);
        }
        unit
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self.state {
            State::Idle => Phase::Idle,
            State::Moving { .. } => Phase::Moving,
            State::Waiting { .. } => Phase::Waiting,
        }
    }

    #[must_use]
    pub const fn position(&self) -> GeoPoint {
        self.position
    }

    #[must_use]
    pub const fn cruise_mph(&self) -> f64 {
        self.cruise_mph
    }

    /// Advances the unit to `now` and returns the report to write. Speed is
    /// the distance travelled along the eased path since the previous step,
    /// in mph; snapping onto a waypoint does not count as travel.
    pub fn step(&mut self, now: Instant) -> Position {
        let previous = self.position;
        let elapsed = now.saturating_duration_since(self.last_step);
        self.last_step = now;

        let travelled_to = match self.state {
            State::Idle => previous,
            State::Waiting { until } => {
                if now >= until {
                    self.next = (self.next + 1) % self.route.len();
                    self.depart(now);
                }
                previous
            }
            State::Moving { origin, started, eta } => self.advance(origin, started, eta, now),
        };

        if haversine_km(previous, self.position) > 0.0 {
            self.heading = initial_bearing(previous, self.position);
        }
        let speed = mph(haversine_km(previous, travelled_to), elapsed);
        Position::at(self.position).with_motion(speed, self.heading)
    }

    fn depart(&mut self, now: Instant) {
        let target = self.route[self.next];
        let length_km = haversine_km(self.position, target);
        if length_km <= self.config.arrival_epsilon_km {
            self.position = target;
            self.arrive(now);
            return;
        }

        let hours = length_km * EASE_PEAK_RATE / (self.cruise_mph * KM_PER_MILE);
        let eta = Duration::try_from_secs_f64(hours * 3600.0).unwrap_or(Duration::MAX);
        self.heading = initial_bearing(self.position, target);
        self.state = State::Moving { origin: self.position, started: now, eta };
    }

    // Moves along the eased path and returns the eased point, before any
    // snap onto the waypoint.
    fn advance(
        &mut self, origin: GeoPoint, started: Instant, eta: Duration, now: Instant,
    ) -> GeoPoint {
        let target = self.route[self.next];
        let fraction = if eta.is_zero() {
            1.0
        } else {
            (now.saturating_duration_since(started).as_secs_f64() / eta.as_secs_f64()).min(1.0)
        };

        let eased = ease_in_out_cubic(fraction);
        let point = GeoPoint {
            lat: (target.lat - origin.lat).mul_add(eased, origin.lat),
            lng: (target.lng - origin.lng).mul_add(eased, origin.lng),
        };
        self.position = point;

        if fraction >= 1.0 || haversine_km(point, target) <= self.config.arrival_epsilon_km {
            self.position = target;
            self.arrive(now);
        }
        point
    }

    fn arrive(&mut self, now: Instant) {
        let dwell = self.rng.gen_range(self.config.dwell_min..=self.config.dwell_max);
        self.cruise_mph =
            self.rng.gen_range(self.config.speed_min_mph..=self.config.speed_max_mph);
        self.state = State::Waiting { until: now + dwell };
    }
}

/// Cubic ease-in-out over `[0, 1]`.
#[must_use]
pub fn ease_in_out_cubic(t: f64) -> f64 {
    if t < 0.5 { 4.0 * t * t * t } else { 1.0 - (-2.0f64).mul_add(t, 2.0).powi(3) / 2.0 }
}

// Orders the dwell and speed ranges and replaces unusable speeds, so the
// random draws always have a valid range.
fn sanitize(mut config: SimulatorConfig) -> SimulatorConfig {
    let defaults = SimulatorConfig::default();
    if config.dwell_min > config.dwell_max {
        std::mem::swap(&mut config.dwell_min, &mut config.dwell_max);
    }

    let usable = |mph: f64| mph.is_finite() && mph > 0.0;
    if !usable(config.speed_min_mph) || !usable(config.speed_max_mph) {
        config.speed_min_mph = defaults.speed_min_mph;
        config.speed_max_mph = defaults.speed_max_mph;
    } else if config.speed_min_mph > config.speed_max_mph {
        std::mem::swap(&mut config.speed_min_mph, &mut config.speed_max_mph);
    }
    config
}

fn mph(distance_km: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    distance_km / KM_PER_MILE / secs * 3600.0
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    const A: GeoPoint = GeoPoint { lat: 33.7490, lng: -84.3880 };
    const C: GeoPoint = GeoPoint { lat: 33.7580, lng: -84.3880 };

    fn config() -> SimulatorConfig {
        SimulatorConfig {
            dwell_min: Duration::from_secs(2),
            dwell_max: Duration::from_secs(2),
            speed_min_mph: 36.0,
            speed_max_mph: 36.0,
            ..SimulatorConfig::default()
        }
    }

    fn unit(route: Vec<GeoPoint>, now: Instant) -> SimulatedUnit {
        SimulatedUnit::new(A, route, config(), StdRng::seed_from_u64(7), now)
    }

    #[test]
    fn easing_endpoints() {
        assert!(ease_in_out_cubic(0.0).abs() < f64::EPSILON);
        assert!((ease_in_out_cubic(0.5) - 0.5).abs() < f64::EPSILON);
        assert!((ease_in_out_cubic(1.0) - 1.0).abs() < f64::EPSILON);
        assert!(ease_in_out_cubic(0.25) < 0.25);
        assert!(ease_in_out_cubic(0.75) > 0.75);
    }

    #[test]
    fn idle_holds_position() {
        let t0 = Instant::now();
        let mut unit = unit(vec![], t0);
        assert_eq!(unit.phase(), Phase::Idle);

        let position = unit.step(t0 + Duration::from_secs(1));
        assert_eq!(position.lat, A.lat);
        assert_eq!(position.lng, A.lng);
        assert_eq!(position.speed, Some(0.0));
    }

    #[test]
    fn travels_dwells_and_continues() {
        let t0 = Instant::now();
        let mut unit = unit(vec![C, A], t0);
        assert_eq!(unit.phase(), Phase::Moving);

        // 1 km peaking at 36 mph takes about 186 s; arrival is declared within
        // 10 m of the waypoint, some 25 s earlier
        let mut last = A;
        let mut secs = 0;
        while unit.phase() == Phase::Moving && secs < 240 {
            secs += 1;
            let position = unit.step(t0 + Duration::from_secs(secs));
            assert!(position.lat >= last.lat, "progress is monotonic");
            assert!(position.heading.is_some_and(|h| h < 1.0 || h > 359.0), "heading north");
            last = GeoPoint { lat: position.lat, lng: position.lng };
        }
        assert!((155..=187).contains(&secs), "arrived after {secs} s");
        assert_eq!(unit.phase(), Phase::Waiting);
        assert_eq!(unit.position(), C);

        // dwelling reports no movement
        let position = unit.step(t0 + Duration::from_secs(secs + 1));
        assert_eq!(position.speed, Some(0.0));
        assert_eq!(unit.phase(), Phase::Waiting);

        // dwell over: next waypoint, wrapping round the loop
        unit.step(t0 + Duration::from_secs(secs + 2));
        assert_eq!(unit.phase(), Phase::Moving);
        let position = unit.step(t0 + Duration::from_secs(secs + 10));
        assert!(position.lat < C.lat);
        assert!(position.heading.is_some_and(|h| (h - 180.0).abs() < 1.0), "heading south");
    }

    #[test]
    fn reported_speed_peaks_at_cruise() {
        let t0 = Instant::now();
        let mut unit = unit(vec![C, A], t0);

        let speeds: Vec<f64> = (1..=150)
            .filter_map(|secs| unit.step(t0 + Duration::from_secs(secs)).speed)
            .collect();
        assert_eq!(unit.phase(), Phase::Moving);
        assert!(speeds.iter().all(|speed| *speed >= 0.0));
        assert!(speeds.iter().all(|speed| *speed <= 36.0 * 1.001), "never above cruise");
        assert!(speeds.iter().any(|speed| *speed > 34.0), "close to cruise mid segment");
        assert!(speeds[0] < 1.0, "eases out of the start");
    }

    #[test]
    fn default_speed_range_is_respected() {
        let t0 = Instant::now();
        let config = SimulatorConfig::default();
        let rng = StdRng::seed_from_u64(3);
        let mut unit = SimulatedUnit::new(A, vec![C, A], config.clone(), rng, t0);

        for secs in 1..=600 {
            let speed = unit.step(t0 + Duration::from_secs(secs)).speed.unwrap_or_default();
            assert!(speed <= config.speed_max_mph * 1.001, "{speed} mph at {secs} s");
        }
    }

    #[test]
    fn waypoint_at_start_is_reached_immediately() {
        let t0 = Instant::now();
        let unit = unit(vec![A, C], t0);
        assert_eq!(unit.phase(), Phase::Waiting);
        assert_eq!(unit.position(), A);
    }

    #[test]
    fn inverted_ranges_do_not_panic() {
        let t0 = Instant::now();
        let config = SimulatorConfig {
            dwell_min: Duration::from_secs(5),
            dwell_max: Duration::from_secs(1),
            speed_min_mph: 60.0,
            speed_max_mph: 20.0,
            ..SimulatorConfig::default()
        };
        let mut unit = SimulatedUnit::new(A, vec![A, C], config, StdRng::seed_from_u64(1), t0);
        assert!((20.0..=60.0).contains(&unit.cruise_mph()));
        assert_eq!(unit.phase(), Phase::Waiting);
        unit.step(t0 + Duration::from_secs(6));
        assert_eq!(unit.phase(), Phase::Moving);

        let unusable = SimulatorConfig {
            speed_min_mph: f64::NAN,
            speed_max_mph: 0.0,
            ..SimulatorConfig::default()
        };
        let unit = SimulatedUnit::new(A, vec![C], unusable, StdRng::seed_from_u64(1), t0);
        assert!((20.0..=60.0).contains(&unit.cruise_mph()));
    }
}
