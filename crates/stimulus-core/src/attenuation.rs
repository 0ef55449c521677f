//! Obstruction attenuation between an event source and a listener.
//!
//! A line is cast from the source block toward the listener through the
//! host's [`ObstructionQuery`]. Every obstructing segment multiplies both
//! range and weight by its material factor, so results never exceed the
//! inputs. The resulting factors are cached per `(world, event, listener
//! block, source block)` either in a pluggable [`ExternalCache`] or in a
//! local [`LocalAttenuationCache`] with TTL and then oldest-first eviction.
//! Cached factors are scaled by the caller's range and weight, so an event
//! re-emitted at a different strength under the same id is never served
//! the previous emission's values.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use stimulus_types::{EventId, IntVec3, Vec3, WorldId};
use tracing::{debug, warn};

use crate::config::AttenuationConfig;

/// Attenuation stops once range falls below this.
pub const MIN_RANGE: f64 = 0.1;

/// Attenuation stops once weight falls below this.
pub const MIN_WEIGHT: f64 = 0.01;

// ---------------------------------------------------------------------------
// Host obstruction service
// ---------------------------------------------------------------------------

/// Material category of an obstructing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Material {
    /// Open space; never attenuates.
    Air,
    /// Leaves, grass, and similar.
    Foliage,
    /// Glass and ice.
    Glass,
    /// Water, lava, and other fluids.
    Liquid,
    /// Planks, logs.
    Wood,
    /// Stone, brick, earth.
    Stone,
    /// Metal blocks.
    Metal,
    /// Wool, carpet, and other dampening blocks.
    Wool,
    /// Anything unclassified.
    Other,
}

/// A block hit by a raycast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaycastHit {
    /// The obstructing block.
    pub position: IntVec3,
    /// Its material.
    pub material: Material,
}

/// Errors reported by the host obstruction service.
#[derive(Debug, thiserror::Error)]
pub enum ObstructionError {
    /// The world is not loaded or unknown to the host.
    #[error("world {0} is not available for raycasts")]
    WorldUnavailable(WorldId),

    /// Any other host failure.
    #[error("raycast failed: {message}")]
    Host {
        /// Description of the failure.
        message: String,
    },
}

/// Line-of-sight query provided by the host.
pub trait ObstructionQuery: Send + Sync {
    /// First obstructing block on the segment `start -> end`, if any.
    fn raycast(
        &self,
        world: &WorldId,
        start: Vec3,
        end: Vec3,
    ) -> Result<Option<RaycastHit>, ObstructionError>;
}

/// An obstruction service for worlds with nothing in the way.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenField;

impl ObstructionQuery for OpenField {
    fn raycast(
        &self,
        _world: &WorldId,
        _start: Vec3,
        _end: Vec3,
    ) -> Result<Option<RaycastHit>, ObstructionError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Results and cache keys
// ---------------------------------------------------------------------------

/// Effective range and weight after obstruction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attenuation {
    /// Effective reach.
    pub range: f64,
    /// Effective strength.
    pub weight: f64,
}

impl Attenuation {
    /// Factors of these effective values relative to the emitted ones.
    pub const fn relative_to(self, range: f64, weight: f64) -> Self {
        Self {
            range: ratio(self.range, range),
            weight: ratio(self.weight, weight),
        }
    }

    /// Scale emitted values by these factors.
    pub const fn apply(self, range: f64, weight: f64) -> Self {
        Self {
            range: range * self.range,
            weight: weight * self.weight,
        }
    }
}

const fn ratio(value: f64, emitted: f64) -> f64 {
    if emitted > 0.0 {
        (value / emitted).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Cache key for one source/listener pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RaycastKey {
    /// World of both endpoints.
    pub world_id: WorldId,
    /// Event being attenuated.
    pub event_id: EventId,
    /// Listener block.
    pub listener: IntVec3,
    /// Source block.
    pub source: IntVec3,
}

impl fmt::Display for RaycastKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "atten:{}:{}:{},{},{}:{},{},{}",
            self.world_id,
            self.event_id,
            self.listener.x,
            self.listener.y,
            self.listener.z,
            self.source.x,
            self.source.y,
            self.source.z
        )
    }
}

// ---------------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------------

/// Errors reported by an external cache service.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The service could not be reached.
    #[error("cache service unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },
}

/// Keyed cache service living outside the process.
pub trait ExternalCache: Send + Sync {
    /// Whether the service can currently be used.
    fn is_available(&self) -> bool;

    /// Fetch cached attenuation factors.
    fn get(&self, key: &str) -> Result<Option<Attenuation>, CacheError>;

    /// Store attenuation factors for `ttl_steps` simulation steps.
    fn put(&self, key: &str, value: Attenuation, ttl_steps: u64) -> Result<(), CacheError>;
}

/// Host memory pressure signal.
pub trait MemoryPressure: Send + Sync {
    /// Whether the host is short on memory.
    fn under_pressure(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct CachedAttenuation {
    value: Attenuation,
    stored_at_step: u64,
}

/// In-process attenuation cache with TTL and size bounds.
#[derive(Debug)]
pub struct LocalAttenuationCache {
    entries: DashMap<RaycastKey, CachedAttenuation>,
}

impl LocalAttenuationCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Cached value for `key` if it is at most `ttl_steps` old.
    pub fn get(&self, key: &RaycastKey, step: u64, ttl_steps: u64) -> Option<Attenuation> {
        let entry = self.entries.get(key)?;
        (step.saturating_sub(entry.stored_at_step) <= ttl_steps).then_some(entry.value)
    }

    /// Store `value` as of `step`.
    pub fn put(&self, key: RaycastKey, value: Attenuation, step: u64) {
        self.entries.insert(
            key,
            CachedAttenuation {
                value,
                stored_at_step: step,
            },
        );
    }

    /// Drop expired entries, then the oldest entries beyond `capacity`.
    ///
    /// Returns the number of entries removed.
    pub fn evict(&self, step: u64, ttl_steps: u64, capacity: usize) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| step.saturating_sub(e.stored_at_step) <= ttl_steps);

        let excess = self.entries.len().saturating_sub(capacity);
        if excess > 0 {
            let mut by_age: Vec<(u64, RaycastKey)> = self
                .entries
                .iter()
                .map(|e| (e.stored_at_step, e.key().clone()))
                .collect();
            by_age.sort_by_key(|(stored_at, _)| *stored_at);
            for (_, key) in by_age.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }
        before.saturating_sub(self.entries.len())
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for LocalAttenuationCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Errors that can occur while attenuating.
#[derive(Debug, thiserror::Error)]
pub enum AttenuationError {
    /// The host raycast failed.
    #[error("obstruction query failed: {source}")]
    Obstruction {
        /// The underlying host error.
        #[from]
        source: ObstructionError,
    },

    /// The listener position is not a finite point.
    #[error("listener position is not finite")]
    InvalidListener,
}

#[derive(Debug, Clone)]
struct AttenuationSettings {
    max_segments: u32,
    ttl_steps: u64,
    capacity: usize,
    factors: BTreeMap<Material, f64>,
}

impl AttenuationSettings {
    fn from_config(config: &AttenuationConfig) -> Self {
        let mut factors = BTreeMap::from([(Material::Air, 1.0)]);
        factors.extend(config.material_factors.iter().map(|(m, f)| (*m, *f)));
        Self {
            max_segments: config.max_segments,
            ttl_steps: config.raycast_cache_ttl_steps,
            capacity: config.raycast_cache_capacity,
            factors,
        }
    }

    fn factor(&self, material: Material) -> f64 {
        self.factors
            .get(&material)
            .or_else(|| self.factors.get(&Material::Other))
            .copied()
            .unwrap_or(1.0)
            .clamp(0.0, 1.0)
    }
}

/// Computes obstruction-adjusted range and weight.
pub struct AttenuationEngine {
    query: Arc<dyn ObstructionQuery>,
    external: Option<Arc<dyn ExternalCache>>,
    pressure: Option<Arc<dyn MemoryPressure>>,
    local: LocalAttenuationCache,
    settings: RwLock<AttenuationSettings>,
}

impl AttenuationEngine {
    /// Create an engine over the host obstruction service.
    pub fn new(query: Arc<dyn ObstructionQuery>, config: &AttenuationConfig) -> Self {
        Self {
            query,
            external: None,
            pressure: None,
            local: LocalAttenuationCache::new(),
            settings: RwLock::new(AttenuationSettings::from_config(config)),
        }
    }

    /// Use an external cache service when it is available.
    #[must_use]
    pub fn with_external_cache(mut self, cache: Arc<dyn ExternalCache>) -> Self {
        self.external = Some(cache);
        self
    }

    /// Bypass the external cache while the host reports memory pressure.
    #[must_use]
    pub fn with_memory_pressure(mut self, pressure: Arc<dyn MemoryPressure>) -> Self {
        self.pressure = Some(pressure);
        self
    }

    /// Apply new settings and drop locally cached results.
    pub fn reconfigure(&self, config: &AttenuationConfig) {
        *self.settings.write() = AttenuationSettings::from_config(config);
        self.local.clear();
    }

    /// The local fallback cache.
    pub const fn local_cache(&self) -> &LocalAttenuationCache {
        &self.local
    }

    /// Attenuate an event heard at `listener`.
    ///
    /// # Errors
    ///
    /// Returns [`AttenuationError`] if the listener is not finite or the
    /// host raycast fails.
    #[allow(clippy::too_many_arguments)]
    pub fn attenuate(
        &self,
        world: &WorldId,
        source: IntVec3,
        listener: Vec3,
        range: f64,
        weight: f64,
        event_id: &EventId,
        step: u64,
    ) -> Result<Attenuation, AttenuationError> {
        if !listener.is_finite() {
            return Err(AttenuationError::InvalidListener);
        }
        let key = RaycastKey {
            world_id: world.clone(),
            event_id: event_id.clone(),
            listener: listener.block(),
            source,
        };
        if let Some(factors) = self.cached(&key, step) {
            return Ok(factors.apply(range, weight));
        }

        let settings = self.settings.read().clone();
        let value = self.walk(&settings, world, source, listener, range, weight)?;
        self.store(key, value.relative_to(range, weight), step, settings.ttl_steps);
        Ok(value)
    }

    /// Cached attenuation factors for `key`, without casting any rays.
    pub fn peek(&self, key: &RaycastKey, step: u64) -> Option<Attenuation> {
        self.cached(key, step)
    }

    /// Expire and trim the local cache.
    pub fn maintain(&self, step: u64) -> usize {
        let (ttl, capacity) = {
            let s = self.settings.read();
            (s.ttl_steps, s.capacity)
        };
        self.local.evict(step, ttl, capacity)
    }

    fn external_usable(&self) -> Option<&Arc<dyn ExternalCache>> {
        let external = self.external.as_ref()?;
        if self.pressure.as_ref().is_some_and(|p| p.under_pressure()) {
            return None;
        }
        external.is_available().then_some(external)
    }

    fn cached(&self, key: &RaycastKey, step: u64) -> Option<Attenuation> {
        if let Some(external) = self.external_usable() {
            match external.get(&key.to_string()) {
                Ok(hit) => return hit,
                Err(e) => debug!(error = %e, "external cache read failed, using local cache"),
            }
        }
        let ttl = self.settings.read().ttl_steps;
        self.local.get(key, step, ttl)
    }

    fn store(&self, key: RaycastKey, value: Attenuation, step: u64, ttl_steps: u64) {
        if let Some(external) = self.external_usable() {
            match external.put(&key.to_string(), value, ttl_steps) {
                Ok(()) => return,
                Err(e) => debug!(error = %e, "external cache write failed, using local cache"),
            }
        }
        self.local.put(key, value, step);
    }

    fn walk(
        &self,
        settings: &AttenuationSettings,
        world: &WorldId,
        source: IntVec3,
        listener: Vec3,
        range: f64,
        weight: f64,
    ) -> Result<Attenuation, AttenuationError> {
        let origin = source.center();
        let length = origin.distance(listener);
        let mut result = Attenuation { range, weight };
        if length <= f64::EPSILON {
            return Ok(result);
        }

        let listener_block = listener.block();
        let step_t = 1.0 / length;
        let mut start = origin;
        let mut last_hit: Option<IntVec3> = None;

        for _ in 0..settings.max_segments {
            let Some(hit) = self.query.raycast(world, start, listener)? else {
                break;
            };
            if hit.position == listener_block {
                break;
            }
            if last_hit == Some(hit.position) {
                warn!(
                    world = %world,
                    block = ?hit.position,
                    "raycast stalled on the same block, stopping"
                );
                break;
            }
            last_hit = Some(hit.position);

            let factor = settings.factor(hit.material);
            result.range *= factor;
            result.weight *= factor;
            if result.range < MIN_RANGE || result.weight < MIN_WEIGHT {
                break;
            }

            let t = projection(origin, listener, hit.position.center(), length) + step_t;
            if t >= 1.0 {
                break;
            }
            start = origin.lerp(listener, t);
        }
        Ok(result)
    }
}

/// Fraction along `from -> to` closest to `point`.
fn projection(from: Vec3, to: Vec3, point: Vec3, length: f64) -> f64 {
    let (dx, dy, dz) = (to.x - from.x, to.y - from.y, to.z - from.z);
    let (px, py, pz) = (point.x - from.x, point.y - from.y, point.z - from.z);
    let dot = pz.mul_add(dz, px.mul_add(dx, py * dy));
    (dot / (length * length)).clamp(0.0, 1.0)
}

impl fmt::Debug for AttenuationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttenuationEngine")
            .field("external_cache", &self.external.is_some())
            .field("local_entries", &self.local.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::cast_possible_truncation,
    clippy::arithmetic_side_effects
)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Walls of a single material on every plane `x = k * spacing`.
    struct Walls {
        spacing: i32,
        material: Material,
        calls: AtomicUsize,
    }

    impl ObstructionQuery for Walls {
        fn raycast(
            &self,
            _world: &WorldId,
            start: Vec3,
            end: Vec3,
        ) -> Result<Option<RaycastHit>, ObstructionError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let (lo, hi) = (start.x.min(end.x), start.x.max(end.x));
            let mut k = (lo / f64::from(self.spacing)).ceil() as i32;
            while f64::from(k * self.spacing) <= hi {
                let x = k * self.spacing;
                if f64::from(x) > lo {
                    let t = (f64::from(x) - start.x) / (end.x - start.x);
                    let p = start.lerp(end, t);
                    return Ok(Some(RaycastHit {
                        position: IntVec3::new(x, p.y.floor() as i32, p.z.floor() as i32),
                        material: self.material,
                    }));
                }
                k += 1;
            }
            Ok(None)
        }
    }

    /// Always reports the same block.
    struct Stuck;

    impl ObstructionQuery for Stuck {
        fn raycast(
            &self,
            _world: &WorldId,
            _start: Vec3,
            _end: Vec3,
        ) -> Result<Option<RaycastHit>, ObstructionError> {
            Ok(Some(RaycastHit {
                position: IntVec3::new(3, 0, 0),
                material: Material::Glass,
            }))
        }
    }

    struct Failing;

    impl ObstructionQuery for Failing {
        fn raycast(
            &self,
            world: &WorldId,
            _start: Vec3,
            _end: Vec3,
        ) -> Result<Option<RaycastHit>, ObstructionError> {
            Err(ObstructionError::WorldUnavailable(world.clone()))
        }
    }

    #[derive(Default)]
    struct MapCache {
        available: AtomicBool,
        entries: Mutex<BTreeMap<String, Attenuation>>,
    }

    impl ExternalCache for MapCache {
        fn is_available(&self) -> bool {
            self.available.load(Ordering::Relaxed)
        }

        fn get(&self, key: &str) -> Result<Option<Attenuation>, CacheError> {
            Ok(self.entries.lock().get(key).copied())
        }

        fn put(&self, key: &str, value: Attenuation, _ttl: u64) -> Result<(), CacheError> {
            self.entries.lock().insert(key.to_owned(), value);
            Ok(())
        }
    }

    struct Pressure(bool);

    impl MemoryPressure for Pressure {
        fn under_pressure(&self) -> bool {
            self.0
        }
    }

    fn world() -> WorldId {
        WorldId::parse("w").unwrap()
    }

    fn event() -> EventId {
        EventId::parse("e").unwrap()
    }

    #[test]
    fn open_field_leaves_values_untouched() {
        let engine = AttenuationEngine::new(Arc::new(OpenField), &AttenuationConfig::default());
        let out = engine
            .attenuate(&world(), IntVec3::new(0, 0, 0), Vec3::new(5.5, 0.5, 0.5), 10.0, 5.0, &event(), 0)
            .unwrap();
        assert_eq!(out, Attenuation { range: 10.0, weight: 5.0 });
    }

    #[test]
    fn each_wall_multiplies_both_values() {
        let walls = Walls { spacing: 4, material: Material::Stone, calls: AtomicUsize::new(0) };
        let engine = AttenuationEngine::new(Arc::new(walls), &AttenuationConfig::default());
        // Walls at x = 4 and x = 8 between source (0) and listener (10.5).
        let out = engine
            .attenuate(&world(), IntVec3::new(0, 0, 0), Vec3::new(10.5, 0.5, 0.5), 20.0, 4.0, &event(), 0)
            .unwrap();
        assert!((out.range - 20.0 * 0.4 * 0.4).abs() < 1e-9);
        assert!((out.weight - 4.0 * 0.4 * 0.4).abs() < 1e-9);
    }

    #[test]
    fn attenuation_never_increases_values() {
        for material in [Material::Air, Material::Glass, Material::Wool, Material::Metal] {
            let walls = Walls { spacing: 2, material, calls: AtomicUsize::new(0) };
            let engine = AttenuationEngine::new(Arc::new(walls), &AttenuationConfig::default());
            let out = engine
                .attenuate(&world(), IntVec3::new(0, 0, 0), Vec3::new(15.5, 0.5, 0.5), 16.0, 3.0, &event(), 0)
                .unwrap();
            assert!(out.range <= 16.0);
            assert!(out.weight <= 3.0);
        }
    }

    #[test]
    fn segment_count_is_bounded() {
        let walls = Walls { spacing: 1, material: Material::Glass, calls: AtomicUsize::new(0) };
        let config = AttenuationConfig { max_segments: 3, ..AttenuationConfig::default() };
        let engine = AttenuationEngine::new(Arc::new(walls), &config);
        let out = engine
            .attenuate(&world(), IntVec3::new(0, 0, 0), Vec3::new(30.5, 0.5, 0.5), 30.0, 1.0, &event(), 0)
            .unwrap();
        assert!((out.weight - 0.8_f64.powi(3)).abs() < 1e-9);
    }

    #[test]
    fn stalled_raycast_stops_after_one_segment() {
        let engine = AttenuationEngine::new(Arc::new(Stuck), &AttenuationConfig::default());
        let out = engine
            .attenuate(&world(), IntVec3::new(0, 0, 0), Vec3::new(10.5, 0.5, 0.5), 10.0, 1.0, &event(), 0)
            .unwrap();
        assert!((out.weight - 0.8).abs() < 1e-9);
    }

    #[test]
    fn weak_results_stop_early() {
        let walls = Walls { spacing: 1, material: Material::Wool, calls: AtomicUsize::new(0) };
        let config = AttenuationConfig { max_segments: 50, ..AttenuationConfig::default() };
        let engine = AttenuationEngine::new(Arc::new(walls), &config);
        let out = engine
            .attenuate(&world(), IntVec3::new(0, 0, 0), Vec3::new(40.5, 0.5, 0.5), 40.0, 1.0, &event(), 0)
            .unwrap();
        // 0.2^3 = 0.008 < MIN_WEIGHT after the third wall.
        assert!((out.weight - 0.008).abs() < 1e-9);
    }

    #[test]
    fn host_errors_propagate() {
        let engine = AttenuationEngine::new(Arc::new(Failing), &AttenuationConfig::default());
        let out = engine.attenuate(&world(), IntVec3::new(0, 0, 0), Vec3::new(3.0, 0.0, 0.0), 5.0, 1.0, &event(), 0);
        assert!(matches!(out, Err(AttenuationError::Obstruction { .. })));
    }

    #[test]
    fn results_are_cached_locally_until_ttl() {
        let walls = Arc::new(Walls { spacing: 4, material: Material::Stone, calls: AtomicUsize::new(0) });
        let config = AttenuationConfig { raycast_cache_ttl_steps: 2, ..AttenuationConfig::default() };
        let engine = AttenuationEngine::new(walls.clone(), &config);
        let listener = Vec3::new(6.5, 0.5, 0.5);

        engine.attenuate(&world(), IntVec3::new(0, 0, 0), listener, 10.0, 1.0, &event(), 0).unwrap();
        let after_first = walls.calls.load(Ordering::Relaxed);
        engine.attenuate(&world(), IntVec3::new(0, 0, 0), listener, 10.0, 1.0, &event(), 2).unwrap();
        assert_eq!(walls.calls.load(Ordering::Relaxed), after_first);

        engine.attenuate(&world(), IntVec3::new(0, 0, 0), listener, 10.0, 1.0, &event(), 3).unwrap();
        assert!(walls.calls.load(Ordering::Relaxed) > after_first);
    }

    #[test]
    fn cached_factors_scale_with_a_stronger_emission() {
        let walls = Arc::new(Walls { spacing: 4, material: Material::Stone, calls: AtomicUsize::new(0) });
        let engine = AttenuationEngine::new(walls.clone(), &AttenuationConfig::default());
        let listener = Vec3::new(6.5, 0.5, 0.5);

        let weak = engine.attenuate(&world(), IntVec3::new(0, 0, 0), listener, 16.0, 5.0, &event(), 0).unwrap();
        assert!((weak.weight - 5.0 * 0.4).abs() < 1e-9);
        let calls = walls.calls.load(Ordering::Relaxed);

        // Same id and endpoints, re-emitted stronger: served from cache, scaled.
        let strong = engine.attenuate(&world(), IntVec3::new(0, 0, 0), listener, 16.0, 8.0, &event(), 1).unwrap();
        assert_eq!(walls.calls.load(Ordering::Relaxed), calls);
        assert!((strong.weight - 8.0 * 0.4).abs() < 1e-9);
        assert!((strong.range - 16.0 * 0.4).abs() < 1e-9);
    }

    #[test]
    fn open_field_cache_returns_full_strength_after_replacement() {
        let engine = AttenuationEngine::new(Arc::new(OpenField), &AttenuationConfig::default());
        let listener = Vec3::new(2.5, 0.5, 0.5);
        engine.attenuate(&world(), IntVec3::new(0, 0, 0), listener, 16.0, 5.0, &event(), 0).unwrap();
        let out = engine.attenuate(&world(), IntVec3::new(0, 0, 0), listener, 16.0, 8.0, &event(), 1).unwrap();
        assert_eq!(out, Attenuation { range: 16.0, weight: 8.0 });
    }

    #[test]
    fn local_cache_evicts_expired_then_oldest() {
        let cache = LocalAttenuationCache::new();
        let value = Attenuation { range: 1.0, weight: 1.0 };
        for (i, step) in [0_u64, 5, 6, 7].into_iter().enumerate() {
            let key = RaycastKey {
                world_id: world(),
                event_id: event(),
                listener: IntVec3::new(i32::try_from(i).unwrap(), 0, 0),
                source: IntVec3::default(),
            };
            cache.put(key, value, step);
        }
        // Step 8, TTL 4: the step-0 entry expires; capacity 2 drops step 5.
        let removed = cache.evict(8, 4, 2);
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn external_cache_used_when_available() {
        let external = Arc::new(MapCache::default());
        external.available.store(true, Ordering::Relaxed);
        let engine = AttenuationEngine::new(Arc::new(OpenField), &AttenuationConfig::default())
            .with_external_cache(external.clone());

        engine
            .attenuate(&world(), IntVec3::new(0, 0, 0), Vec3::new(2.5, 0.5, 0.5), 5.0, 1.0, &event(), 0)
            .unwrap();
        assert_eq!(external.entries.lock().len(), 1);
        assert!(engine.local_cache().is_empty());
    }

    #[test]
    fn external_cache_bypassed_when_unavailable_or_under_pressure() {
        let external = Arc::new(MapCache::default());
        let engine = AttenuationEngine::new(Arc::new(OpenField), &AttenuationConfig::default())
            .with_external_cache(external.clone());
        engine
            .attenuate(&world(), IntVec3::new(0, 0, 0), Vec3::new(2.5, 0.5, 0.5), 5.0, 1.0, &event(), 0)
            .unwrap();
        assert!(external.entries.lock().is_empty());
        assert_eq!(engine.local_cache().len(), 1);

        external.available.store(true, Ordering::Relaxed);
        let engine = AttenuationEngine::new(Arc::new(OpenField), &AttenuationConfig::default())
            .with_external_cache(external.clone())
            .with_memory_pressure(Arc::new(Pressure(true)));
        engine
            .attenuate(&world(), IntVec3::new(0, 0, 0), Vec3::new(2.5, 0.5, 0.5), 5.0, 1.0, &event(), 0)
            .unwrap();
        assert!(external.entries.lock().is_empty());
        assert_eq!(engine.local_cache().len(), 1);
    }
}
