//! Route acquisition for simulated units.

use realtime::{GeoPoint, Result, RouteSource};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How a simulated unit obtains its patrol loop.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePlan {
    /// Drive the given waypoints in order, wrapping to the first. An empty
    /// list leaves the unit stationary.
    Explicit(Vec<GeoPoint>),

    /// Ask the [`RouteSource`] for a loop around the start point.
    #[default]
    Synthesize,
}

impl RoutePlan {
    /// Rejects explicit routes containing invalid waypoints.
    ///
    /// # Errors
    ///
    /// Returns [`realtime::Error::BadRequest`] naming the first bad waypoint.
    pub fn validate(&self) -> Result<()> {
        if let Self::Explicit(waypoints) = self {
            for waypoint in waypoints {
                waypoint.validate()?;
            }
        }
        Ok(())
    }
}

/// Resolves the plan into waypoints. A routing failure or an unusable route
/// degrades to an empty route so the unit stays put instead of failing.
pub async fn resolve<S: RouteSource>(
    unit_id: &str, start: GeoPoint, plan: RoutePlan, routes: &S,
) -> Vec<GeoPoint> {
    match plan {
        RoutePlan::Explicit(waypoints) => waypoints,
        RoutePlan::Synthesize => match routes.patrol_route(start).await {
            Ok(waypoints) if waypoints.is_empty() => {
                warn!(unit_id = %unit_id, "no waypoints returned, unit stays stationary");
                vec![]
            }
            Ok(waypoints) => {
                if let Some(bad) = waypoints.iter().find(|w| w.validate().is_err()) {
                    warn!(unit_id = %unit_id, ?bad, "invalid waypoint, unit stays stationary");
                    return vec![];
                }
                waypoints
            }
            Err(e) => {
                warn!(unit_id = %unit_id, error = %e, "routing failed, unit stays stationary");
                vec![]
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    const START: GeoPoint = GeoPoint { lat: 33.7490, lng: -84.3880 };

    struct Routes(Option<Vec<GeoPoint>>);

    impl RouteSource for Routes {
        async fn patrol_route(&self, _: GeoPoint) -> anyhow::Result<Vec<GeoPoint>> {
            self.0.clone().ok_or_else(|| anyhow!("routing unavailable"))
        }
    }

    #[tokio::test]
    async fn explicit_is_used_verbatim() {
        let waypoints = vec![START, GeoPoint { lat: 33.75, lng: -84.39 }];
        let plan = RoutePlan::Explicit(waypoints.clone());
        let route = resolve("U1", START, plan, &Routes(None)).await;
        assert_eq!(route, waypoints);
    }

    #[tokio::test]
    async fn synthesized() {
        let waypoints = vec![GeoPoint { lat: 33.75, lng: -84.39 }];
        let routes = Routes(Some(waypoints.clone()));
        assert_eq!(resolve("U1", START, RoutePlan::Synthesize, &routes).await, waypoints);
    }

    #[tokio::test]
    async fn failures_leave_unit_stationary() {
        assert!(resolve("U1", START, RoutePlan::Synthesize, &Routes(None)).await.is_empty());
        let empty = Routes(Some(vec![]));
        assert!(resolve("U1", START, RoutePlan::Synthesize, &empty).await.is_empty());

        let bad = Routes(Some(vec![GeoPoint { lat: 95.0, lng: 0.0 }]));
        assert!(resolve("U1", START, RoutePlan::Synthesize, &bad).await.is_empty());
    }

    #[test]
    fn explicit_waypoints_are_validated() {
        let plan = RoutePlan::Explicit(vec![START, GeoPoint { lat: 0.0, lng: 200.0 }]);
        assert!(plan.validate().is_err());
        assert!(RoutePlan::Synthesize.validate().is_ok());
    }
}
