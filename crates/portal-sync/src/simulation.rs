//! Synthetic portal traffic used when no live channel is available.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use rand::distr::{Bernoulli, Distribution, Uniform};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::envelope::{EventEnvelope, EventOrigin, MINOR_UNITS_PER_UNIT, PortalEvent};
use crate::error::{ControlError, Result};
use crate::state::PortalId;

pub const SIMULATOR_SOURCE: &str = "simulator";

const ACTIVITY_PORTALS: [PortalId; 3] = [PortalId::Employee, PortalId::Customer, PortalId::Supplier];
const SALES_PORTALS: [PortalId; 2] = [PortalId::Employee, PortalId::Customer];

const ACTORS: [&str; 6] = [
    "Cashier",
    "Store Associate",
    "Inventory Clerk",
    "Customer",
    "Loyalty Member",
    "Supplier Rep",
];

const ACTIONS: [&str; 7] = [
    "processed a sale",
    "updated stock levels",
    "browsed the catalogue",
    "redeemed loyalty points",
    "submitted a purchase order",
    "confirmed a delivery",
    "printed a receipt",
];

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub activity_interval: Duration,
    pub activity_probability: f64,
    pub metrics_interval: Duration,
    /// Local business hours as `[start, end)`.
    pub business_hours_start: u32,
    pub business_hours_end: u32,
    pub utc_offset_hours: i32,
    pub business_multiplier: f64,
    pub off_hours_multiplier: f64,
    /// Whole currency units.
    pub transaction_amount_min: u64,
    pub transaction_amount_max: u64,
    pub max_base_transactions: u32,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            activity_interval: Duration::from_secs(30),
            activity_probability: 0.3,
            metrics_interval: Duration::from_secs(10),
            business_hours_start: 8,
            business_hours_end: 20,
            utc_offset_hours: 3,
            business_multiplier: 1.5,
            off_hours_multiplier: 0.3,
            transaction_amount_min: 5_000,
            transaction_amount_max: 50_000,
            max_base_transactions: 3,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn activity_multiplier(&self, at: DateTime<Utc>) -> f64 {
        let local = at + chrono::Duration::hours(i64::from(self.utc_offset_hours));
        let hour = local.hour();
        if hour >= self.business_hours_start && hour < self.business_hours_end {
            self.business_multiplier
        } else {
            self.off_hours_multiplier
        }
    }
}

/// Generates envelopes shaped exactly like live traffic, tagged
/// [`EventOrigin::Simulated`].
pub struct SimulationEngine {
    config: SimulationConfig,
    rng: StdRng,
    clock: Arc<dyn Clock>,
}

impl SimulationEngine {
    pub fn new(config: SimulationConfig, clock: Arc<dyn Clock>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { config, rng, clock }
    }

    /// One activity tick. Generation errors skip the tick.
    pub fn activity_tick(&mut self) -> Option<EventEnvelope> {
        match self.try_activity_tick() {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "simulated activity tick skipped");
                None
            }
        }
    }

    /// One metrics tick. Generation errors skip the tick.
    pub fn metrics_tick(&mut self) -> Vec<EventEnvelope> {
        match self.try_metrics_tick() {
            Ok(envelopes) => envelopes,
            Err(error) => {
                warn!(%error, "simulated metrics tick skipped");
                Vec::new()
            }
        }
    }

    pub fn try_activity_tick(&mut self) -> Result<Option<EventEnvelope>> {
        let fires = Bernoulli::new(self.config.activity_probability).map_err(|error| {
            ControlError::Simulation(format!(
                "activity probability {}: {error}",
                self.config.activity_probability
            ))
        })?;
        if !fires.sample(&mut self.rng) {
            return Ok(None);
        }

        let portal = *pick(&ACTIVITY_PORTALS, &mut self.rng)?;
        let actor = *pick(&ACTORS, &mut self.rng)?;
        let action = *pick(&ACTIONS, &mut self.rng)?;
        debug!(portal = portal.as_str(), actor, action, "simulated activity");
        Ok(Some(self.envelope(
            portal,
            PortalEvent::PortalActivity {
                actor: actor.to_string(),
                action: action.to_string(),
            },
        )))
    }

    pub fn try_metrics_tick(&mut self) -> Result<Vec<EventEnvelope>> {
        let amounts = Uniform::new_inclusive(
            self.config.transaction_amount_min,
            self.config.transaction_amount_max,
        )
        .map_err(|error| {
            ControlError::Simulation(format!(
                "transaction amount range {}..={}: {error}",
                self.config.transaction_amount_min, self.config.transaction_amount_max
            ))
        })?;
        let multiplier = self.config.activity_multiplier(self.clock.now());
        if !multiplier.is_finite() || multiplier < 0.0 {
            return Err(ControlError::Simulation(format!(
                "invalid activity multiplier {multiplier}"
            )));
        }

        let base = self.rng.random_range(0..=self.config.max_base_transactions);
        let count = (f64::from(base) * multiplier).round() as u32;
        let mut envelopes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let portal = *pick(&SALES_PORTALS, &mut self.rng)?;
            let amount = amounts.sample(&mut self.rng);
            envelopes.push(self.envelope(
                portal,
                PortalEvent::TransactionAlert {
                    amount_minor: amount.saturating_mul(MINOR_UNITS_PER_UNIT),
                },
            ));
        }
        debug!(base, multiplier, count, "simulated metrics tick");
        Ok(envelopes)
    }

    fn envelope(&self, portal: PortalId, event: PortalEvent) -> EventEnvelope {
        EventEnvelope::new(portal, event, self.clock.now(), SIMULATOR_SOURCE)
            .with_origin(EventOrigin::Simulated)
    }
}

fn pick<'a, T>(items: &'a [T], rng: &mut StdRng) -> Result<&'a T> {
    items
        .choose(rng)
        .ok_or_else(|| ControlError::Simulation("empty vocabulary".to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;

    fn at_utc(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, hour, 0, 0)
            .single()
            .expect("valid time")
    }

    fn engine(config: SimulationConfig, hour_utc: u32) -> SimulationEngine {
        SimulationEngine::new(
            SimulationConfig {
                seed: Some(7),
                ..config
            },
            Arc::new(ManualClock::new(at_utc(hour_utc))),
        )
    }

    #[test]
    fn business_hours_use_the_configured_offset() {
        let config = SimulationConfig::default();
        // 05:00 UTC is 08:00 at UTC+3.
        assert_eq!(config.activity_multiplier(at_utc(5)), 1.5);
        assert_eq!(config.activity_multiplier(at_utc(4)), 0.3);
        assert_eq!(config.activity_multiplier(at_utc(16)), 1.5);
        // 17:00 UTC is 20:00 local, the first off-hours hour.
        assert_eq!(config.activity_multiplier(at_utc(17)), 0.3);
    }

    #[test]
    fn same_seed_produces_same_traffic() {
        let config = SimulationConfig {
            activity_probability: 0.5,
            ..SimulationConfig::default()
        };
        let mut first = engine(config.clone(), 9);
        let mut second = engine(config, 9);
        for _ in 0..20 {
            assert_eq!(first.activity_tick(), second.activity_tick());
            assert_eq!(first.metrics_tick(), second.metrics_tick());
        }
    }

    #[test]
    fn activity_probability_bounds_are_respected() {
        let mut never = engine(
            SimulationConfig {
                activity_probability: 0.0,
                ..SimulationConfig::default()
            },
            9,
        );
        assert!((0..100).all(|_| never.activity_tick().is_none()));

        let mut always = engine(
            SimulationConfig {
                activity_probability: 1.0,
                ..SimulationConfig::default()
            },
            9,
        );
        for _ in 0..100 {
            let envelope = always.activity_tick().expect("activity every tick");
            assert_ne!(envelope.portal, PortalId::Manager);
            assert_eq!(envelope.origin, EventOrigin::Simulated);
            assert_eq!(envelope.from, SIMULATOR_SOURCE);
            assert!(matches!(envelope.event, PortalEvent::PortalActivity { .. }));
        }
    }

    #[test]
    fn metrics_tick_is_scaled_by_time_of_day() {
        let mut busy = engine(SimulationConfig::default(), 9);
        let mut quiet = engine(SimulationConfig::default(), 22);
        let mut busy_total = 0;
        let mut quiet_total = 0;
        for _ in 0..200 {
            let busy_batch = busy.metrics_tick();
            let quiet_batch = quiet.metrics_tick();
            assert!(busy_batch.len() <= 5);
            assert!(quiet_batch.len() <= 1);
            for envelope in busy_batch.iter().chain(&quiet_batch) {
                match envelope.event {
                    PortalEvent::TransactionAlert { amount_minor } => {
                        assert!((500_000..=5_000_000).contains(&amount_minor));
                        assert_eq!(amount_minor % MINOR_UNITS_PER_UNIT, 0);
                    }
                    ref other => panic!("unexpected event: {other:?}"),
                }
            }
            busy_total += busy_batch.len();
            quiet_total += quiet_batch.len();
        }
        assert!(busy_total > quiet_total);
    }

    #[test]
    fn generator_errors_skip_the_tick() {
        let mut broken = engine(
            SimulationConfig {
                activity_probability: 1.5,
                transaction_amount_min: 10,
                transaction_amount_max: 5,
                ..SimulationConfig::default()
            },
            9,
        );
        assert!(broken.try_activity_tick().is_err());
        assert!(broken.try_metrics_tick().is_err());
        assert_eq!(broken.activity_tick(), None);
        assert!(broken.metrics_tick().is_empty());
    }
}
