//! Random event producers running on their own threads.
//!
//! Each producer wakes once per step interval and emits a burst of events
//! of randomly chosen kinds at random positions. They talk to the store
//! directly, concurrently with the step loop and with each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;
use rand::seq::IndexedRandom as _;
use stimulus_core::store::SpatialStimulusStore;
use stimulus_types::{EmitRequest, IntVec3};
use tracing::{debug, info, warn};

use crate::demo::DemoConfig;
use crate::error::EngineError;

/// Kind of event a producer can emit.
#[derive(Debug, Clone, Copy)]
struct EventKind {
    type_id: &'static str,
    range: f64,
    weight: f64,
    lifetime_steps: i32,
}

/// Catalogue producers draw from.
const KINDS: [EventKind; 4] = [
    EventKind {
        type_id: "footstep",
        range: 8.0,
        weight: 1.0,
        lifetime_steps: 10,
    },
    EventKind {
        type_id: "door",
        range: 12.0,
        weight: 2.0,
        lifetime_steps: 20,
    },
    EventKind {
        type_id: "gunshot",
        range: 16.0,
        weight: 6.0,
        lifetime_steps: 30,
    },
    EventKind {
        type_id: "explosion",
        range: 64.0,
        weight: 10.0,
        lifetime_steps: 40,
    },
];

/// Running producer threads.
pub struct Producers {
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    emitted: Arc<AtomicU64>,
    accepted: Arc<AtomicU64>,
}

impl Producers {
    /// Start `config.producers` threads emitting into `store`.
    pub fn spawn(
        config: &DemoConfig,
        store: &Arc<SpatialStimulusStore>,
        floor_y: i32,
    ) -> Result<Self, EngineError> {
        Self::start_with(config, store, floor_y, |index, worker| {
            std::thread::Builder::new()
                .name(format!("stimulus-producer-{index}"))
                .spawn(move || worker.run())
        })
    }

    /// Start producers through `spawn`. If any fails to start, the ones
    /// already running are stopped and joined before the error returns.
    fn start_with<F>(
        config: &DemoConfig,
        store: &Arc<SpatialStimulusStore>,
        floor_y: i32,
        mut spawn: F,
    ) -> Result<Self, EngineError>
    where
        F: FnMut(usize, ProducerLoop) -> std::io::Result<JoinHandle<()>>,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let emitted = Arc::new(AtomicU64::new(0));
        let accepted = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::with_capacity(config.producers);

        for index in 0..config.producers {
            let worker = ProducerLoop {
                store: Arc::clone(store),
                stop: Arc::clone(&stop),
                emitted: Arc::clone(&emitted),
                accepted: Arc::clone(&accepted),
                world_id: config.world_id.clone(),
                world_size: config.world_size,
                floor_y,
                burst: config.events_per_producer_step,
                interval: Duration::from_millis(config.step_interval_ms),
            };
            match spawn(index, worker) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    let started = Self {
                        handles,
                        stop,
                        emitted,
                        accepted,
                    };
                    if let Err(join) = started.shutdown() {
                        warn!(error = %join, "producer failed while stopping after spawn error");
                    }
                    return Err(EngineError::Producer {
                        message: format!("failed to spawn producer {index}: {e}"),
                    });
                }
            }
        }
        info!(producers = handles.len(), "producers started");
        Ok(Self {
            handles,
            stop,
            emitted,
            accepted,
        })
    }


    /// Events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Events the store accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Signal every producer to stop and wait for them.
    pub fn shutdown(self) -> Result<(), EngineError> {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles {
            handle.join().map_err(|payload| EngineError::Producer {
                message: format!("producer thread panicked: {}", panic_message(payload.as_ref())),
            })?;
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

struct ProducerLoop {
    store: Arc<SpatialStimulusStore>,
    stop: Arc<AtomicBool>,
    emitted: Arc<AtomicU64>,
    accepted: Arc<AtomicU64>,
    world_id: String,
    world_size: i32,
    floor_y: i32,
    burst: usize,
    interval: Duration,
}

impl ProducerLoop {
    fn run(self) {
        let mut rng = rand::rng();
        while !self.stop.load(Ordering::Acquire) {
            for _ in 0..self.burst {
                let Some(request) = self.random_event(&mut rng) else {
                    continue;
                };
                let outcome = self.store.add_event(request);
                self.emitted.fetch_add(1, Ordering::Relaxed);
                if outcome.is_stored() {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!(?outcome, "emission not stored");
                }
            }
            std::thread::sleep(self.interval);
        }
    }

    fn random_event(&self, rng: &mut impl Rng) -> Option<EmitRequest> {
        let kind = KINDS.choose(rng)?;
        let position = IntVec3::new(
            rng.random_range(0..self.world_size),
            self.floor_y.saturating_add(1),
            rng.random_range(0..self.world_size),
        );
        Some(EmitRequest::new(
            kind.type_id,
            position,
            self.world_id.clone(),
            kind.range,
            kind.weight,
            kind.lifetime_steps,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use stimulus_core::attenuation::{AttenuationEngine, OpenField};
    use stimulus_core::config::StimulusConfig;

    use super::*;

    fn store() -> Arc<SpatialStimulusStore> {
        let config = StimulusConfig::default();
        Arc::new(SpatialStimulusStore::new(
            &config,
            AttenuationEngine::new(Arc::new(OpenField), &config.attenuation),
        ))
    }

    #[test]
    fn failed_spawn_stops_started_producers() {
        let config = DemoConfig {
            producers: 3,
            step_interval_ms: 5,
            ..DemoConfig::default()
        };
        let finished = Arc::new(AtomicUsize::new(0));
        let result = Producers::start_with(&config, &store(), 64, |index, worker| {
            if index == 2 {
                return Err(std::io::Error::other("no more threads"));
            }
            let finished = Arc::clone(&finished);
            std::thread::Builder::new().spawn(move || {
                worker.run();
                finished.fetch_add(1, Ordering::SeqCst);
            })
        });

        assert!(matches!(result, Err(EngineError::Producer { .. })));
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn producers_emit_until_shut_down() {
        let config = DemoConfig {
            producers: 2,
            step_interval_ms: 5,
            ..DemoConfig::default()
        };
        let store = store();
        let producers = Producers::spawn(&config, &store, 64).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        producers.shutdown().unwrap();
        assert!(!store.is_empty());
    }
}
