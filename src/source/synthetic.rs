use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::SkipReason;
use crate::schema::{EventTime, ExtractedEvent, Field, Value};
use crate::util::{self, KEY_SEPARATOR};

use super::adapter::EventSource;

/// Random measurement generator.
///
/// Emits uniformly distributed scalars for the configured keys at
/// 120 Hz spaced event times. Keys containing the separator are
/// emitted nested (`ipm2__sum` -> group `ipm2`, subkey `sum`) so the
/// worker's flattening path is exercised the same way as real data.
pub struct SyntheticSource {
    run_id: i64,
    keys: Vec<String>,
    detectors: Vec<String>,
    damage_probability: f64,
    remaining: Option<u64>,
    clock: EventTime,
    rng: StdRng,
}

/// Nanoseconds between two generated events (120 Hz).
const EVENT_SPACING_NS: u32 = 8_333_333;

impl SyntheticSource {
    pub fn new(
        run_id: i64,
        keys: Vec<String>,
        detectors: Vec<String>,
        damage_probability: f64,
        events: Option<u64>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            run_id,
            keys,
            detectors,
            damage_probability: damage_probability.clamp(0.0, 1.0),
            remaining: events,
            clock: util::now_event_time(),
            rng,
        }
    }

    fn tick(&mut self) -> EventTime {
        let now = self.clock;
        let nanos = now.nanoseconds + EVENT_SPACING_NS;
        self.clock = if nanos >= 1_000_000_000 {
            EventTime::new(now.seconds + 1, nanos - 1_000_000_000)
        } else {
            EventTime::new(now.seconds, nanos)
        };
        now
    }
}

#[async_trait::async_trait]
impl EventSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn next_event(&mut self) -> Option<Result<ExtractedEvent, SkipReason>> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }

        // Generation never blocks; give other tasks a turn.
        tokio::task::yield_now().await;

        let mut fields: BTreeMap<String, Field> = BTreeMap::new();
        for key in &self.keys {
            let value = Field::Value(Value::Float(self.rng.random_range(0.0..1.0)));
            match key.split_once(KEY_SEPARATOR) {
                Some((group, subkey)) => {
                    let entry = fields
                        .entry(group.to_string())
                        .or_insert_with(|| Field::Group(BTreeMap::new()));
                    if let Field::Group(sub) = entry {
                        sub.insert(subkey.to_string(), value);
                    }
                }
                None => {
                    fields.insert(key.clone(), value);
                }
            }
        }

        let damage = self
            .detectors
            .iter()
            .map(|d| {
                let damaged = self.rng.random_bool(self.damage_probability);
                (d.clone(), if damaged { 0.0 } else { 1.0 })
            })
            .collect();

        Some(Ok(ExtractedEvent {
            event_time: self.tick(),
            run_id: Some(self.run_id),
            fields,
            damage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_requested_number_of_nested_events() {
        let mut source = SyntheticSource::new(
            5,
            vec!["ipm2__sum".to_string(), "gas".to_string()],
            vec!["ipm2".to_string()],
            0.0,
            Some(3),
            Some(42),
        );

        let mut count = 0;
        let mut last_time: Option<EventTime> = None;
        while let Some(event) = source.next_event().await {
            let event = event.unwrap();
            assert_eq!(event.run_id, Some(5));
            assert!(matches!(event.fields["ipm2"], Field::Group(_)));
            assert_eq!(event.damage["ipm2"], 1.0);
            if let Some(prev) = last_time {
                assert!(event.event_time.as_secs_f64() > prev.as_secs_f64());
            }
            last_time = Some(event.event_time);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn certain_damage_marks_every_detector() {
        let mut source =
            SyntheticSource::new(1, vec![], vec!["evr0".to_string()], 1.0, Some(1), Some(1));
        let event = source.next_event().await.unwrap().unwrap();
        assert_eq!(event.damage["evr0"], 0.0);
    }
}
