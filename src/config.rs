//! Service level settings read from the environment. Engine settings live in
//! [`tracking::Config`].

use std::env;

pub fn bind_addr() -> String {
    env::var("BIND_ADDR").unwrap_or_else(|_| {
        let default = "0.0.0.0:8000".to_string();
        tracing::trace!("BIND_ADDR not set, using default: {default}");
        default
    })
}

/// Base URL of the durable record service. `None` selects the in-memory store.
pub fn records_url() -> Option<String> {
    let url = env::var("RECORDS_URL").ok()?;
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        tracing::trace!("RECORDS_URL empty, using in-memory records");
        return None;
    }
    Some(trimmed.to_string())
}

pub fn seed_from_records() -> bool {
    env::var("SIM_SEED_FROM_RECORDS").is_ok_and(|value| parse_flag(&value))
}

/// Unit ids to start simulating at boot.
pub fn sim_units() -> Vec<String> {
    env::var("SIM_UNITS").map(|value| parse_unit_list(&value)).unwrap_or_default()
}

pub fn route_waypoints() -> usize {
    env::var("ROUTE_WAYPOINTS")
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|count| *count > 0)
        .unwrap_or_else(|| {
            tracing::trace!("ROUTE_WAYPOINTS not set, using default: 4");
            4
        })
}

pub fn route_radius_km() -> f64 {
    env::var("ROUTE_RADIUS_KM")
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|radius| radius.is_finite() && *radius > 0.0)
        .unwrap_or_else(|| {
            tracing::trace!("ROUTE_RADIUS_KM not set, using default: 1.5");
            1.5
        })
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_unit_list(value: &str) -> Vec<String> {
    let mut units: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|unit| !unit.is_empty())
        .map(ToString::to_string)
        .collect();
    units.sort();
    units.dedup();
    units
}
