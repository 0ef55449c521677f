//! End-to-end behavior of the stimulus engine through its public API.
//!
//! Every test builds its own store or runtime over an in-memory obstruction
//! service; nothing external is required.

// Integration tests use unwrap extensively for clarity -- panicking on
// failure is the correct behavior in test code.
#![allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::cast_possible_truncation,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use stimulus_core::attenuation::{
    AttenuationEngine, Material, ObstructionError, ObstructionQuery, OpenField, RaycastHit,
};
use stimulus_core::config::StimulusConfig;
use stimulus_core::runtime::{AgentState, StimulusRuntime};
use stimulus_core::scheduler::SchedulerManager;
use stimulus_core::store::{AddOutcome, AgentQuery, EventKey, RejectReason, SpatialStimulusStore};
use stimulus_types::{AgentId, EmitRequest, EventId, IntVec3, Vec3, WorldId};

fn store_with(config: &StimulusConfig) -> SpatialStimulusStore {
    SpatialStimulusStore::new(
        config,
        AttenuationEngine::new(Arc::new(OpenField), &config.attenuation),
    )
}

fn query_at(x: f64, y: f64, z: f64) -> AgentQuery {
    AgentQuery {
        agent_id: AgentId::new(),
        world_id: WorldId::parse("w").unwrap(),
        position: Vec3::new(x, y, z),
        eye_position: Vec3::new(x, y, z),
        current_event_id: None,
    }
}

fn event_a(weight: f64) -> EmitRequest {
    EmitRequest::new("a", IntVec3::new(0, 0, 0), "w", 10.0, weight, 20)
}

fn key_a() -> EventKey {
    EventKey {
        world_id: WorldId::parse("w").unwrap(),
        position: IntVec3::new(0, 0, 0),
        event_id: EventId::parse("a").unwrap(),
    }
}

#[test]
fn event_is_found_until_it_expires() {
    let store = store_with(&StimulusConfig::default());
    let scheduler = SchedulerManager::new(&StimulusConfig::default().scheduler);
    assert_eq!(store.add_event(event_a(5.0)), AddOutcome::Inserted);

    let agent = query_at(5.0, 0.0, 0.0);
    let found = store.find_best(&agent, &scheduler).unwrap();
    assert_eq!(found.event_id.as_str(), "a");

    for _ in 0..19 {
        store.tick();
    }
    assert!(store.get(&key_a()).is_some());

    store.tick();
    assert!(store.get(&key_a()).is_none());
    assert!(store.find_best(&agent, &scheduler).is_none());
}

#[test]
fn stronger_emission_replaces_weaker_one() {
    let store = store_with(&StimulusConfig::default());
    assert!(store.add_event(event_a(5.0)).is_stored());

    // Same step: the dedup window already rejects it.
    assert_eq!(
        store.add_event(event_a(3.0)),
        AddOutcome::Rejected(RejectReason::Duplicate)
    );
    store.tick();
    store.tick();
    assert_eq!(
        store.add_event(event_a(3.0)),
        AddOutcome::Rejected(RejectReason::WeakerThanExisting)
    );
    assert!((store.get(&key_a()).unwrap().weight - 5.0).abs() < f64::EPSILON);

    assert_eq!(store.add_event(event_a(8.0)), AddOutcome::Replaced);
    assert_eq!(store.len(), 1);
    assert!((store.get(&key_a()).unwrap().weight - 8.0).abs() < f64::EPSILON);
}

#[test]
fn dedup_spans_current_and_next_step() {
    let store = store_with(&StimulusConfig::default());
    // Different explicit ids, same world/type/block.
    assert!(store.add_event(event_a(1.0).with_event_id("first")).is_stored());
    assert!(!store.add_event(event_a(1.0).with_event_id("second")).is_stored());
    store.tick();
    assert!(!store.add_event(event_a(1.0).with_event_id("third")).is_stored());
    store.tick();
    assert!(store.add_event(event_a(1.0).with_event_id("fourth")).is_stored());
    assert_eq!(store.len(), 2);
}

#[test]
fn capacity_keeps_size_and_evicts_minimum() {
    let mut config = StimulusConfig::default();
    config.store.max_events_tracked = 3;
    let store = store_with(&config);
    for (i, weight) in [2.0, 1.0, 3.0].into_iter().enumerate() {
        let x = i32::try_from(i).unwrap();
        assert!(
            store
                .add_event(EmitRequest::new(format!("t{i}"), IntVec3::new(x, 0, 0), "w", 10.0, weight, 20))
                .is_stored()
        );
    }

    let weak = EmitRequest::new("weak", IntVec3::new(9, 0, 0), "w", 10.0, 0.5, 20);
    assert_eq!(
        store.add_event(weak),
        AddOutcome::Rejected(RejectReason::BelowCapacityFloor)
    );
    assert_eq!(store.len(), 3);

    let strong = EmitRequest::new("strong", IntVec3::new(8, 0, 0), "w", 10.0, 4.0, 20);
    match store.add_event(strong) {
        AddOutcome::Evicted { evicted } => assert_eq!(evicted.event_id.as_str(), "t1"),
        other => panic!("expected eviction, got {other:?}"),
    }
    assert_eq!(store.len(), 3);
}

/// Obstructs every integer `x` plane with a rotating material.
struct Planes;

impl ObstructionQuery for Planes {
    fn raycast(
        &self,
        _world: &WorldId,
        start: Vec3,
        end: Vec3,
    ) -> Result<Option<RaycastHit>, ObstructionError> {
        let next = start.x.floor() + 1.0;
        if next >= end.x {
            return Ok(None);
        }
        let x = next as i32;
        let material = match x.rem_euclid(4) {
            0 => Material::Stone,
            1 => Material::Wool,
            2 => Material::Glass,
            _ => Material::Wood,
        };
        Ok(Some(RaycastHit {
            position: IntVec3::new(x, 0, 0),
            material,
        }))
    }
}

#[test]
fn attenuation_never_amplifies() {
    let config = StimulusConfig::default();
    let engine = AttenuationEngine::new(Arc::new(Planes), &config.attenuation);
    let world = WorldId::parse("w").unwrap();
    let id = EventId::parse("a").unwrap();
    for step in 0..40_u32 {
        let listener = Vec3::new(f64::from(step) + 0.25, 0.5, 0.5);
        let out = engine
            .attenuate(&world, IntVec3::new(0, 0, 0), listener, 32.0, 4.0, &id, u64::from(step))
            .unwrap();
        assert!(out.range <= 32.0);
        assert!(out.weight <= 4.0);
        assert!(out.range >= 0.0 && out.weight >= 0.0);
    }
}

#[test]
fn advisory_result_supersedes_synchronous_pick() {
    let mut runtime = StimulusRuntime::new(StimulusConfig::default(), Arc::new(OpenField));
    let store = runtime.store();
    // Strong but barely in reach.
    assert!(
        store
            .add_event(EmitRequest::new("loud", IntVec3::new(0, 64, 0), "w", 5.0, 3.0, 200))
            .is_stored()
    );
    // Weak but right next to the agent.
    assert!(
        store
            .add_event(EmitRequest::new("near", IntVec3::new(5, 64, 0), "w", 16.0, 1.0, 200))
            .is_stored()
    );

    let agent = AgentState {
        id: AgentId::new(),
        world_id: WorldId::parse("w").unwrap(),
        position: Vec3::new(5.0, 64.0, 0.5),
        eye_position: Vec3::new(5.0, 64.5, 0.5),
        health: 10.0,
        alive: true,
        current_event_id: None,
    };
    let agents = [agent.clone()];

    let first = runtime.step(&agents);
    assert_eq!(first.picks[&agent.id].event_id.as_str(), "loud");

    let started = Instant::now();
    let mut picked = String::new();
    while started.elapsed() < Duration::from_secs(2) {
        std::thread::sleep(Duration::from_millis(5));
        let summary = runtime.step(&agents);
        picked = summary.picks[&agent.id].event_id.as_str().to_owned();
        if picked == "near" {
            break;
        }
    }
    assert_eq!(picked, "near");
}

#[test]
fn producers_on_many_threads_respect_capacity() {
    let mut config = StimulusConfig::default();
    config.store.max_events_tracked = 50;
    let store = Arc::new(store_with(&config));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..100 {
                    let request = EmitRequest::new(
                        format!("p{t}"),
                        IntVec3::new(i, 0, t),
                        "w",
                        8.0,
                        f64::from(i % 7) + 0.5,
                        20,
                    );
                    store.add_event(request);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.len(), 50);
}
