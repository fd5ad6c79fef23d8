//! Core engine for the quorum-sensing simulation.
//!
//! A bounded square world is stepped one discrete cycle at a time. Cells
//! forage for food, absorb a diffusible hormone signal, estimate their
//! absorption rate from a bounded memory of absorption cycles, and switch a
//! binary display state when the estimated rate crosses a threshold. Food is
//! scattered into the world every cycle and hormones are emitted by cells and
//! decay under friction. The whole pipeline is sequential and driven by a
//! single seeded RNG, so a run is reproducible from its seed and parameters.

use ordered_float::OrderedFloat;
use quorum_index::{ProximityIndex, Rect, UniformGridIndex};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{Key, SlotMap, new_key_type};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::debug;

new_key_type! {
    /// Stable handle for cells backed by a generational slot map.
    pub struct CellId;
    /// Stable handle for food items.
    pub struct FoodId;
    /// Stable handle for hormone particles.
    pub struct HormoneId;
}

/// Maximum number of absorption cycles a cell remembers.
pub const MEMORY_SPAN: usize = 11;

/// Hormones travel along their heading until speed decays to this floor.
const HORMONE_SPEED_FLOOR: f32 = 1.0;

const FULL_TURN: f32 = std::f32::consts::TAU;

/// Discrete simulation cycle counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Cycle(pub u64);

impl Cycle {
    /// The cycle before the first step runs.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The cycle following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// 2D position in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to `other`.
    #[must_use]
    pub fn distance_sq(&self, other: Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// Binary display state of a cell, re-derived from its absorbing frequency
/// every cycle. There is no hysteresis band: flicker at the threshold
/// boundary is expected behavior, not a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    #[default]
    Dark,
    Luminescent,
}

/// Health-management policy applied when a cell forages successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthPolicy {
    /// Health is capped at `max_health`.
    #[default]
    Capped,
    /// Health above `reproducing_threshold` spawns one offspring and resets
    /// the parent to `initial_health`.
    Reproducing,
}

/// Errors raised when validating world configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Indicates a parameter outside its documented valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a quorum world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Side length of the square domain in world units.
    pub world_dimension: u32,
    /// Number of cells seeded at initialization.
    pub ncell: usize,
    /// Spreading factor scaling the emission probability.
    pub alpha: f32,
    /// Radius within which a cell perceives food to pursue.
    pub ray_of_perception: f32,
    /// Interaction radius for foraging and absorption, and the offset at
    /// which emitted hormones appear.
    pub cell_radius: f32,
    /// Amplitude of the cell random walk; also the per-cycle pursuit step.
    pub wandering_amplitude: f32,
    /// Initial speed inherited by emitted hormones.
    pub spreading_speed: f32,
    /// Health gained per consumed food item.
    pub increase_of_health: i32,
    /// Health assigned to cells at creation and after a reproduction reset.
    pub initial_health: i32,
    /// Upper health cap under `HealthPolicy::Capped`.
    pub max_health: i32,
    /// Health above which a cell reproduces under `HealthPolicy::Reproducing`.
    pub reproducing_threshold: i32,
    /// Absorbing frequency above which a cell turns luminescent.
    pub lightning_threshold: f32,
    /// Per-cycle probability of a spontaneous memory sample.
    pub spontaneous_sample_rate: f32,
    /// Health-management policy on foraging.
    pub health_policy: HealthPolicy,
    /// Countdown age assigned to emitted hormones.
    pub hormone_lifetime: u32,
    /// Speed lost by a hormone each directed-travel cycle.
    pub hormone_friction: f32,
    /// Speed a hormone resets to once it drops below the travel floor.
    pub hormone_baseline_speed: f32,
    /// Number of food items scattered uniformly each cycle.
    pub food_rnd: u32,
    /// Number of additional food items clustered each cycle; 0 disables
    /// clustering.
    pub food_cluster: u32,
    /// Radius of the per-cycle food cluster disk.
    pub cluster_dim: f32,
    /// Amplitude of the food random walk.
    pub food_step: f32,
    /// Period in cycles of probabilistic culling; 0 disables culling.
    pub culling_period: u32,
    /// Removal probability applied on culling cycles.
    pub culling_probability: f32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent cycle summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            world_dimension: 200,
            ncell: 50,
            alpha: 0.5,
            ray_of_perception: 10.0,
            cell_radius: 3.0,
            wandering_amplitude: 2.0,
            spreading_speed: 3.0,
            increase_of_health: 50,
            initial_health: 100,
            max_health: 300,
            reproducing_threshold: 200,
            lightning_threshold: 0.05,
            spontaneous_sample_rate: 0.015,
            health_policy: HealthPolicy::Capped,
            hormone_lifetime: 50,
            hormone_friction: 0.05,
            hormone_baseline_speed: 0.95,
            food_rnd: 10,
            food_cluster: 0,
            cluster_dim: 10.0,
            food_step: 1.0,
            culling_period: 0,
            culling_probability: 0.95,
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl QuorumConfig {
    /// Observed variant with health capped at `max_health`, periodic culling,
    /// and clustered food generation.
    #[must_use]
    pub fn capped() -> Self {
        Self {
            health_policy: HealthPolicy::Capped,
            culling_period: 2_000,
            food_cluster: 20,
            ..Self::default()
        }
    }

    /// Observed variant with reproduce-and-reset health management, no
    /// culling, and uniform-only food generation.
    #[must_use]
    pub fn reproducing() -> Self {
        Self {
            health_policy: HealthPolicy::Reproducing,
            culling_period: 0,
            food_cluster: 0,
            ..Self::default()
        }
    }

    /// Validates the configuration. A run must not start on failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.world_dimension < 4 {
            return Err(ConfigError::InvalidConfig(
                "world_dimension must be at least 4",
            ));
        }
        if self.ncell == 0 {
            return Err(ConfigError::InvalidConfig("ncell must be positive"));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "alpha must be non-negative and finite",
            ));
        }
        if !self.ray_of_perception.is_finite() || self.ray_of_perception <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "ray_of_perception must be positive",
            ));
        }
        if !self.cell_radius.is_finite() || self.cell_radius <= 0.0 {
            return Err(ConfigError::InvalidConfig("cell_radius must be positive"));
        }
        if !self.wandering_amplitude.is_finite() || self.wandering_amplitude < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "wandering_amplitude must be non-negative",
            ));
        }
        if !self.spreading_speed.is_finite() || self.spreading_speed < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "spreading_speed must be non-negative",
            ));
        }
        if self.increase_of_health < 0 {
            return Err(ConfigError::InvalidConfig(
                "increase_of_health must be non-negative",
            ));
        }
        if self.initial_health <= 0 {
            return Err(ConfigError::InvalidConfig("initial_health must be positive"));
        }
        if self.max_health < self.initial_health {
            return Err(ConfigError::InvalidConfig(
                "max_health cannot be below initial_health",
            ));
        }
        if self.reproducing_threshold <= self.initial_health {
            return Err(ConfigError::InvalidConfig(
                "reproducing_threshold must exceed initial_health",
            ));
        }
        if !self.lightning_threshold.is_finite() || self.lightning_threshold < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "lightning_threshold must be non-negative",
            ));
        }
        if !self.spontaneous_sample_rate.is_finite()
            || !(0.0..=1.0).contains(&self.spontaneous_sample_rate)
        {
            return Err(ConfigError::InvalidConfig(
                "spontaneous_sample_rate must be within [0, 1]",
            ));
        }
        if self.hormone_lifetime == 0 {
            return Err(ConfigError::InvalidConfig(
                "hormone_lifetime must be positive",
            ));
        }
        if !self.hormone_friction.is_finite() || self.hormone_friction <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "hormone_friction must be positive",
            ));
        }
        if !self.hormone_baseline_speed.is_finite() || self.hormone_baseline_speed <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "hormone_baseline_speed must be positive",
            ));
        }
        if self.food_cluster > 0 && (!self.cluster_dim.is_finite() || self.cluster_dim <= 0.0) {
            return Err(ConfigError::InvalidConfig(
                "cluster_dim must be positive when clustering is enabled",
            ));
        }
        if !self.food_step.is_finite() || self.food_step < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "food_step must be non-negative",
            ));
        }
        if !self.culling_probability.is_finite()
            || !(0.0..=1.0).contains(&self.culling_probability)
        {
            return Err(ConfigError::InvalidConfig(
                "culling_probability must be within [0, 1]",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "history_capacity must be positive",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }

    /// Domain side length as a float.
    #[must_use]
    fn extent(&self) -> f32 {
        self.world_dimension as f32
    }

    /// Interior bound beyond which food and hormones are removed.
    #[must_use]
    fn interior_max(&self) -> f32 {
        self.extent() - 1.0
    }
}

/// Bounded FIFO memory of cycles at which absorption events occurred.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbsorptionMemory {
    entries: VecDeque<u64>,
}

impl AbsorptionMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of remembered absorption cycles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once the memory holds `MEMORY_SPAN` entries.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() == MEMORY_SPAN
    }

    /// Iterate over remembered cycles, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().copied()
    }

    /// Record an absorption event, evicting the oldest entry past the cap.
    pub fn record(&mut self, cycle: Cycle) {
        self.entries.push_back(cycle.0);
        if self.entries.len() > MEMORY_SPAN {
            self.entries.pop_front();
        }
        debug_assert!(self.entries.len() <= MEMORY_SPAN);
    }

    /// Record a spontaneous sample: the entry is dropped again if it
    /// duplicates the most recent one, then the cap is enforced.
    pub fn record_spontaneous(&mut self, cycle: Cycle) {
        self.entries.push_back(cycle.0);
        let len = self.entries.len();
        if len >= 2 && self.entries[len - 1] == self.entries[len - 2] {
            self.entries.pop_back();
        }
        while self.entries.len() > MEMORY_SPAN {
            self.entries.pop_front();
        }
    }

    /// Estimate the absorption frequency as the reciprocal of the mean
    /// spacing between remembered cycles. Returns `None` while the memory is
    /// not full, and `None` for the degenerate all-equal memory (zero mean
    /// spacing), in which case the caller retains its previous estimate.
    #[must_use]
    pub fn estimate(&self) -> Option<f32> {
        if !self.is_full() {
            return None;
        }
        let mut diff_sum = 0u64;
        for pair in 0..MEMORY_SPAN - 1 {
            diff_sum += self.entries[pair + 1] - self.entries[pair];
        }
        if diff_sum == 0 {
            return None;
        }
        let mean = diff_sum as f32 / (MEMORY_SPAN - 1) as f32;
        Some(1.0 / mean)
    }
}

/// A cell: the behaviorally rich agent of the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub position: Position,
    pub health: i32,
    pub display_state: DisplayState,
    pub absorbing_frequency: f32,
    pub memory: AbsorptionMemory,
}

impl Cell {
    /// Create a cell at `position` with the configured initial health.
    #[must_use]
    pub fn spawned_at(position: Position, initial_health: i32) -> Self {
        Self {
            position,
            health: initial_health,
            display_state: DisplayState::Dark,
            absorbing_frequency: 0.0,
            memory: AbsorptionMemory::new(),
        }
    }
}

/// A food item. No internal state beyond position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Food {
    pub position: Position,
}

/// A hormone particle diffusing under friction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hormone {
    pub position: Position,
    pub heading: f32,
    pub speed: f32,
    pub age: u32,
}

/// Generational-key dense arena; the world owns one per species.
#[derive(Debug, Clone)]
pub struct Arena<K: Key, T> {
    slots: SlotMap<K, usize>,
    handles: Vec<K>,
    rows: Vec<T>,
}

impl<K: Key, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, T> Arena<K, T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns true if `id` refers to a live entry.
    #[must_use]
    pub fn contains(&self, id: K) -> bool {
        self.slots.contains_key(id)
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: K) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Borrow the entry for `id`.
    #[must_use]
    pub fn get(&self, id: K) -> Option<&T> {
        self.index_of(id).map(|index| &self.rows[index])
    }

    /// Mutably borrow the entry for `id`.
    #[must_use]
    pub fn get_mut(&mut self, id: K) -> Option<&mut T> {
        let index = self.index_of(id)?;
        Some(&mut self.rows[index])
    }

    /// Iterate over live handles in dense registry order.
    pub fn iter_handles(&self) -> impl Iterator<Item = K> + '_ {
        self.handles.iter().copied()
    }

    /// Iterate over `(handle, entry)` pairs in dense registry order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.handles.iter().copied().zip(self.rows.iter())
    }

    /// Insert a new entry and return its handle.
    pub fn insert(&mut self, row: T) -> K {
        let index = self.rows.len();
        self.rows.push(row);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id`, returning its entry if it was present.
    pub fn remove(&mut self, id: K) -> Option<T> {
        let index = self.slots.remove(id)?;
        let removed = self.rows.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }
}

/// Aggregate counts emitted after each cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: Cycle,
    /// Live cells (all have health > 0 after their own update).
    pub cells: usize,
    pub luminescent: usize,
    pub dark: usize,
    pub food: usize,
    pub hormones: usize,
    pub births: usize,
    pub deaths: usize,
}

/// Persistence sink invoked after each cycle.
pub trait WorldPersistence: Send {
    fn on_cycle(&mut self, summary: &CycleSummary);
}

/// No-op persistence sink.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl WorldPersistence for NullPersistence {
    fn on_cycle(&mut self, _summary: &CycleSummary) {}
}

/// Read-only per-cell snapshot exposed to logging, charting, and rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    pub id: CellId,
    pub position: Position,
    pub health: i32,
    pub display_state: DisplayState,
    pub absorbing_frequency: f32,
}

/// Read-only per-food snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodState {
    pub id: FoodId,
    pub position: Position,
}

/// Read-only per-hormone snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HormoneState {
    pub id: HormoneId,
    pub position: Position,
    pub heading: f32,
    pub speed: f32,
    pub age: u32,
}

/// Immutable snapshot of all live agents at the end of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub cycle: Cycle,
    pub cells: Vec<CellState>,
    pub food: Vec<FoodState>,
    pub hormones: Vec<HormoneState>,
}

/// The simulation world: domain bounds, agent registries, spatial indices,
/// the shared RNG, and the cycle scheduler.
pub struct World {
    config: QuorumConfig,
    cycle: Cycle,
    rng: SmallRng,
    cells: Arena<CellId, Cell>,
    food: Arena<FoodId, Food>,
    hormones: Arena<HormoneId, Hormone>,
    cell_index: UniformGridIndex,
    food_index: UniformGridIndex,
    hormone_index: UniformGridIndex,
    food_index_ids: Vec<FoodId>,
    hormone_index_ids: Vec<HormoneId>,
    food_index_dirty: bool,
    hormone_index_dirty: bool,
    persistence: Box<dyn WorldPersistence>,
    history: VecDeque<CycleSummary>,
    births: usize,
    deaths: usize,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("config", &self.config)
            .field("cycle", &self.cycle)
            .field("cells", &self.cells.len())
            .field("food", &self.food.len())
            .field("hormones", &self.hormones.len())
            .finish()
    }
}

impl World {
    /// Instantiate a world and seed its initial cell population at random
    /// domain locations. RNG draws: two per seeded cell, in registry order.
    pub fn new(config: QuorumConfig) -> Result<Self, ConfigError> {
        Self::with_persistence(config, Box::new(NullPersistence))
    }

    /// Instantiate a world with a persistence sink.
    pub fn with_persistence(
        config: QuorumConfig,
        persistence: Box<dyn WorldPersistence>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let grid_cell = config.ray_of_perception.max(config.cell_radius);
        let extent = config.extent();
        let history_capacity = config.history_capacity;
        let ncell = config.ncell;
        let initial_health = config.initial_health;
        let mut world = Self {
            cell_index: UniformGridIndex::new(grid_cell, extent),
            food_index: UniformGridIndex::new(grid_cell, extent),
            hormone_index: UniformGridIndex::new(grid_cell, extent),
            config,
            cycle: Cycle::zero(),
            rng,
            cells: Arena::new(),
            food: Arena::new(),
            hormones: Arena::new(),
            food_index_ids: Vec::new(),
            hormone_index_ids: Vec::new(),
            food_index_dirty: true,
            hormone_index_dirty: true,
            persistence,
            history: VecDeque::with_capacity(history_capacity),
            births: 0,
            deaths: 0,
        };
        for _ in 0..ncell {
            let position = world.random_interior_position();
            world.cells.insert(Cell::spawned_at(position, initial_health));
        }
        Ok(world)
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    /// Current simulation cycle.
    #[must_use]
    pub const fn cycle(&self) -> Cycle {
        self.cycle
    }

    /// Read-only access to the cell registry.
    #[must_use]
    pub fn cells(&self) -> &Arena<CellId, Cell> {
        &self.cells
    }

    /// Read-only access to the food registry.
    #[must_use]
    pub fn food(&self) -> &Arena<FoodId, Food> {
        &self.food
    }

    /// Read-only access to the hormone registry.
    #[must_use]
    pub fn hormones(&self) -> &Arena<HormoneId, Hormone> {
        &self.hormones
    }

    /// Number of live cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Count live cells satisfying `predicate`.
    pub fn count_cells(&self, predicate: impl Fn(&Cell) -> bool) -> usize {
        self.cells.iter().filter(|(_, cell)| predicate(cell)).count()
    }

    /// Handles of live cells inside `region`, in registry order.
    pub fn cells_inside(&mut self, region: Rect) -> Vec<CellId> {
        self.refresh_cell_index();
        let ids: Vec<CellId> = self.cells.iter_handles().collect();
        let mut out = Vec::new();
        self.cell_index
            .inside(region, &mut |idx| out.push(ids[idx]));
        out
    }

    /// Handles of live cells within `radius` of `center`, in registry order.
    pub fn cells_within(&mut self, center: Position, radius: f32) -> Vec<CellId> {
        self.refresh_cell_index();
        let ids: Vec<CellId> = self.cells.iter_handles().collect();
        let mut out = Vec::new();
        self.cell_index.within(
            (center.x, center.y),
            radius,
            &mut |idx, _dist_sq: OrderedFloat<f32>| {
                out.push(ids[idx]);
            },
        );
        out
    }

    /// Uniform random point inside `region`, clipped to the domain interior.
    /// Two RNG draws.
    pub fn random_point_in(&mut self, region: Rect) -> Position {
        let max = self.config.interior_max();
        let min_x = region.min_x.clamp(1.0, max);
        let max_x = region.max_x.clamp(1.0, max);
        let min_y = region.min_y.clamp(1.0, max);
        let max_y = region.max_y.clamp(1.0, max);
        Position {
            x: if max_x > min_x {
                self.rng.random_range(min_x..max_x)
            } else {
                min_x
            },
            y: if max_y > min_y {
                self.rng.random_range(min_y..max_y)
            } else {
                min_y
            },
        }
    }

    /// Replace the persistence sink.
    pub fn set_persistence(&mut self, persistence: Box<dyn WorldPersistence>) {
        self.persistence = persistence;
    }

    /// Iterate over retained cycle summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &CycleSummary> {
        self.history.iter()
    }

    /// Produce a full read-only snapshot of live agents.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            cycle: self.cycle,
            cells: self
                .cells
                .iter()
                .map(|(id, cell)| CellState {
                    id,
                    position: cell.position,
                    health: cell.health,
                    display_state: cell.display_state,
                    absorbing_frequency: cell.absorbing_frequency,
                })
                .collect(),
            food: self
                .food
                .iter()
                .map(|(id, food)| FoodState {
                    id,
                    position: food.position,
                })
                .collect(),
            hormones: self
                .hormones
                .iter()
                .map(|(id, hormone)| HormoneState {
                    id,
                    position: hormone.position,
                    heading: hormone.heading,
                    speed: hormone.speed,
                    age: hormone.age,
                })
                .collect(),
        }
    }

    /// Spawn a food item. Intended for scenario setup; the scheduler scatters
    /// food itself each cycle.
    pub fn spawn_food(&mut self, position: Position) -> FoodId {
        self.food_index_dirty = true;
        self.food.insert(Food { position })
    }

    /// Spawn a hormone particle.
    pub fn spawn_hormone(&mut self, position: Position, heading: f32, speed: f32) -> HormoneId {
        self.hormone_index_dirty = true;
        self.hormones.insert(Hormone {
            position,
            heading,
            speed,
            age: self.config.hormone_lifetime,
        })
    }

    /// Spawn a cell with the configured initial health.
    pub fn spawn_cell(&mut self, position: Position) -> CellId {
        self.cells
            .insert(Cell::spawned_at(position, self.config.initial_health))
    }

    /// Execute one simulation cycle and return its summary.
    ///
    /// Discipline: immediate-visibility sequential processing. Agents alive
    /// at cycle start are processed in registry order, species by species
    /// (cells, then food, then hormones) after global food generation.
    /// Removals and spawns apply to the live registry at once and are seen
    /// by agents processed later in the same cycle; agents spawned mid-cycle
    /// first act next cycle.
    pub fn step(&mut self) -> CycleSummary {
        self.cycle = self.cycle.next();
        self.births = 0;
        self.deaths = 0;

        // Food and hormone rosters are fixed before generation and emission
        // so that agents spawned this cycle skip their own update until the
        // next one. Cells snapshot their roster at stage start for the same
        // reason; offspring never act on their birth cycle.
        let food_alive: Vec<FoodId> = self.food.iter_handles().collect();
        let hormones_alive: Vec<HormoneId> = self.hormones.iter_handles().collect();

        self.stage_food_generation();
        self.stage_cells();
        self.stage_food(&food_alive);
        self.stage_hormones(&hormones_alive);

        let summary = self.summarize();
        self.persistence.on_cycle(&summary);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        debug!(
            cycle = summary.cycle.0,
            cells = summary.cells,
            luminescent = summary.luminescent,
            food = summary.food,
            hormones = summary.hormones,
            "cycle complete",
        );
        summary
    }

    fn summarize(&self) -> CycleSummary {
        let luminescent = self.count_cells(|cell| cell.display_state == DisplayState::Luminescent);
        CycleSummary {
            cycle: self.cycle,
            cells: self.cells.len(),
            luminescent,
            dark: self.cells.len() - luminescent,
            food: self.food.len(),
            hormones: self.hormones.len(),
            births: self.births,
            deaths: self.deaths,
        }
    }

    /// Uniform random position in the interior `[1, world_dimension - 1]`.
    /// Two RNG draws.
    fn random_interior_position(&mut self) -> Position {
        let max = self.config.interior_max();
        Position {
            x: self.rng.random_range(1.0..max),
            y: self.rng.random_range(1.0..max),
        }
    }

    fn clamp_to_interior(&self, position: Position) -> Position {
        let max = self.config.interior_max();
        Position {
            x: position.x.clamp(1.0, max),
            y: position.y.clamp(1.0, max),
        }
    }

    fn outside_interior(&self, position: Position) -> bool {
        let max = self.config.interior_max();
        position.x <= 1.0 || position.x >= max || position.y <= 1.0 || position.y >= max
    }

    /// True on cycles where periodic culling applies (never on cycle 0).
    fn culling_due(&self) -> bool {
        let period = self.config.culling_period;
        period > 0 && self.cycle.0 != 0 && self.cycle.0.is_multiple_of(u64::from(period))
    }

    fn refresh_cell_index(&mut self) {
        // Cells move every cycle, so this index is rebuilt per query rather
        // than tracked with a dirty flag.
        let positions: Vec<(f32, f32)> = self
            .cells
            .iter()
            .map(|(_, cell)| (cell.position.x, cell.position.y))
            .collect();
        let _ = self.cell_index.rebuild(&positions);
    }

    fn refresh_food_index(&mut self) {
        if !self.food_index_dirty {
            return;
        }
        self.food_index_ids.clear();
        let mut positions = Vec::with_capacity(self.food.len());
        for (id, food) in self.food.iter() {
            self.food_index_ids.push(id);
            positions.push((food.position.x, food.position.y));
        }
        // Grid parameters are validated at construction; rebuild cannot fail.
        let _ = self.food_index.rebuild(&positions);
        self.food_index_dirty = false;
    }

    fn refresh_hormone_index(&mut self) {
        if !self.hormone_index_dirty {
            return;
        }
        self.hormone_index_ids.clear();
        let mut positions = Vec::with_capacity(self.hormones.len());
        for (id, hormone) in self.hormones.iter() {
            self.hormone_index_ids.push(id);
            positions.push((hormone.position.x, hormone.position.y));
        }
        let _ = self.hormone_index.rebuild(&positions);
        self.hormone_index_dirty = false;
    }

    /// Live food within `radius` of `center`, in registry order with squared
    /// distances. The index tracks the live registry, so entries returned
    /// here are always still present.
    pub fn food_within(&mut self, center: Position, radius: f32) -> Vec<(FoodId, f32)> {
        self.refresh_food_index();
        let ids = &self.food_index_ids;
        let mut out = Vec::new();
        self.food_index.within(
            (center.x, center.y),
            radius,
            &mut |idx, dist_sq: OrderedFloat<f32>| {
                out.push((ids[idx], dist_sq.into_inner()));
            },
        );
        out
    }

    /// Live hormones within `radius` of `center`, in registry order.
    pub fn hormones_within(&mut self, center: Position, radius: f32) -> Vec<HormoneId> {
        self.refresh_hormone_index();
        let ids = &self.hormone_index_ids;
        let mut out = Vec::new();
        self.hormone_index.within(
            (center.x, center.y),
            radius,
            &mut |idx, _dist_sq: OrderedFloat<f32>| {
                out.push(ids[idx]);
            },
        );
        out
    }

    /// Remove a food item. Returns false when the handle is already stale.
    /// The scenario-setup counterpart of [`World::spawn_food`]; the scheduler
    /// also routes consumption and boundary removal through here.
    pub fn remove_food(&mut self, id: FoodId) -> bool {
        let removed = self.food.remove(id).is_some();
        if removed {
            self.food_index_dirty = true;
        }
        removed
    }

    /// Remove a hormone particle. Returns false when the handle is stale.
    pub fn remove_hormone(&mut self, id: HormoneId) -> bool {
        let removed = self.hormones.remove(id).is_some();
        if removed {
            self.hormone_index_dirty = true;
        }
        removed
    }

    /// Remove a cell outside the scheduler. Scenario hook; does not count
    /// toward the cycle's death tally.
    pub fn remove_cell(&mut self, id: CellId) -> bool {
        self.cells.remove(id).is_some()
    }

    /// Global behavior: scatter the uniform food batch and, when clustering
    /// is enabled, an additional batch inside a disk around a fresh random
    /// center.
    fn stage_food_generation(&mut self) {
        for _ in 0..self.config.food_rnd {
            let position = self.random_interior_position();
            self.spawn_food(position);
        }
        if self.config.food_cluster > 0 {
            let center = self.random_interior_position();
            let radius = self.config.cluster_dim;
            for _ in 0..self.config.food_cluster {
                // Polar draw for a uniform distribution over the disk.
                let r = radius * self.rng.random::<f32>().sqrt();
                let theta = self.rng.random_range(0.0..FULL_TURN);
                let position = self.clamp_to_interior(Position {
                    x: center.x + r * theta.cos(),
                    y: center.y + r * theta.sin(),
                });
                self.spawn_food(position);
            }
        }
    }

    fn stage_cells(&mut self) {
        let alive: Vec<CellId> = self.cells.iter_handles().collect();
        for id in alive {
            // A fault that removed this cell earlier in the cycle must not
            // abort the cycle for other agents.
            if !self.cells.contains(id) {
                continue;
            }
            self.step_cell(id);
        }
    }

    /// Run one cell's guarded behaviors in declared order.
    ///
    /// RNG draw order, fixed per cell per cycle: wander (2 draws, only when
    /// no food is perceived and the amplitude is positive), foraging pick
    /// (1 draw when any candidate), absorption pick (1 draw when any
    /// candidate), spontaneous sample gate (1 draw), emission gate (1 draw,
    /// plus 1 heading draw on success), culling gate (1 draw on culling
    /// cycles). Reproduction adds 2 jitter draws at spawn time.
    fn step_cell(&mut self, id: CellId) {
        let Some(position) = self.cells.get(id).map(|cell| cell.position) else {
            return;
        };

        // 1. Movement: pursue the nearest perceived food, else wander.
        let perceived = self.food_within(position, self.config.ray_of_perception);
        let position = if let Some(target) = self.nearest_food(&perceived) {
            self.pursue(position, target)
        } else {
            self.wander(position, self.config.wandering_amplitude)
        };
        if let Some(cell) = self.cells.get_mut(id) {
            cell.position = position;
        }

        // 2. Foraging: uniform pick among food in reach, consume exactly one.
        let in_reach = self.food_within(position, self.config.cell_radius);
        if !in_reach.is_empty() {
            let pick = self.rng.random_range(0..in_reach.len());
            self.remove_food(in_reach[pick].0);
            self.apply_health_gain(id, position);
        }

        // 3. Absorption: uniform pick among hormones in reach.
        let in_reach = self.hormones_within(position, self.config.cell_radius);
        if !in_reach.is_empty() {
            let pick = self.rng.random_range(0..in_reach.len());
            self.remove_hormone(in_reach[pick]);
            let cycle = self.cycle;
            if let Some(cell) = self.cells.get_mut(id) {
                cell.memory.record(cycle);
            }
        }

        // 4. Spontaneous memory sample.
        let sampled = self.rng.random::<f32>() < self.config.spontaneous_sample_rate;
        if sampled {
            let cycle = self.cycle;
            if let Some(cell) = self.cells.get_mut(id) {
                cell.memory.record_spontaneous(cycle);
            }
        }

        // 5. Frequency estimation: only with a full memory, and the previous
        // estimate is retained on a degenerate zero mean spacing.
        if let Some(frequency) = self.cells.get(id).and_then(|cell| cell.memory.estimate()) {
            if let Some(cell) = self.cells.get_mut(id) {
                cell.absorbing_frequency = frequency;
            }
        }

        // 6. Emission: Bernoulli at clamp(frequency * alpha, 0, 1).
        let frequency = self
            .cells
            .get(id)
            .map_or(0.0, |cell| cell.absorbing_frequency);
        let emission_probability = (frequency * self.config.alpha).clamp(0.0, 1.0);
        if self.rng.random::<f32>() < emission_probability {
            let theta = self.rng.random_range(0.0..FULL_TURN);
            let offset = self.config.cell_radius;
            let origin = Position {
                x: position.x + offset * theta.cos(),
                y: position.y + offset * theta.sin(),
            };
            let speed = self.config.spreading_speed;
            self.spawn_hormone(origin, theta, speed);
        }

        // 7. Display update: threshold comparison, re-derived every cycle.
        let threshold = self.config.lightning_threshold;
        if let Some(cell) = self.cells.get_mut(id) {
            cell.display_state = if cell.absorbing_frequency > threshold {
                DisplayState::Luminescent
            } else {
                DisplayState::Dark
            };
        }

        // 8. Aging: terminal when health reaches zero.
        if let Some(cell) = self.cells.get_mut(id) {
            cell.health -= 1;
            if cell.health <= 0 {
                self.cells.remove(id);
                self.deaths += 1;
                return;
            }
        }

        // 9. Periodic culling.
        if self.culling_due() && self.rng.random::<f32>() < self.config.culling_probability {
            self.cells.remove(id);
            self.deaths += 1;
        }
    }

    /// Nearest food position among `candidates`; ties keep the first-found
    /// (lowest registry order) candidate.
    fn nearest_food(&self, candidates: &[(FoodId, f32)]) -> Option<Position> {
        let mut best: Option<(FoodId, f32)> = None;
        for &(id, dist_sq) in candidates {
            match best {
                Some((_, best_sq)) if dist_sq >= best_sq => {}
                _ => best = Some((id, dist_sq)),
            }
        }
        best.and_then(|(id, _)| self.food.get(id)).map(|food| food.position)
    }

    /// Advance toward `target` by at most the wander amplitude, stopping on
    /// the target. No RNG draws.
    fn pursue(&self, from: Position, target: Position) -> Position {
        let step = self.config.wandering_amplitude;
        let dx = target.x - from.x;
        let dy = target.y - from.y;
        let distance = (dx * dx + dy * dy).sqrt();
        if distance <= step || distance == 0.0 {
            return self.clamp_to_interior(target);
        }
        let scale = step / distance;
        self.clamp_to_interior(Position {
            x: from.x + dx * scale,
            y: from.y + dy * scale,
        })
    }

    /// Bounded random walk of the given amplitude. Two RNG draws when the
    /// amplitude is positive.
    fn wander(&mut self, from: Position, amplitude: f32) -> Position {
        if amplitude <= 0.0 {
            return from;
        }
        let dx = self.rng.random_range(-amplitude..amplitude);
        let dy = self.rng.random_range(-amplitude..amplitude);
        self.clamp_to_interior(Position {
            x: from.x + dx,
            y: from.y + dy,
        })
    }

    /// Apply the foraging health gain under the configured policy.
    fn apply_health_gain(&mut self, id: CellId, position: Position) {
        let gain = self.config.increase_of_health;
        let policy = self.config.health_policy;
        let reproduces = {
            let Some(cell) = self.cells.get_mut(id) else {
                return;
            };
            cell.health += gain;
            match policy {
                HealthPolicy::Capped => {
                    cell.health = cell.health.min(self.config.max_health);
                    false
                }
                HealthPolicy::Reproducing => cell.health > self.config.reproducing_threshold,
            }
        };
        if reproduces {
            let offspring_at = self.wander(position, self.config.wandering_amplitude.max(1.0));
            self.spawn_cell(offspring_at);
            self.births += 1;
            if let Some(cell) = self.cells.get_mut(id) {
                cell.health = self.config.initial_health;
            }
        }
    }

    fn stage_food(&mut self, alive: &[FoodId]) {
        let amplitude = self.config.food_step;
        for &id in alive {
            if !self.food.contains(id) {
                continue;
            }
            let Some(position) = self.food.get(id).map(|food| food.position) else {
                continue;
            };
            let mut position = position;
            if amplitude > 0.0 {
                position.x += self.rng.random_range(-amplitude..amplitude);
                position.y += self.rng.random_range(-amplitude..amplitude);
            }
            if self.outside_interior(position) {
                self.remove_food(id);
                continue;
            }
            if let Some(food) = self.food.get_mut(id) {
                food.position = position;
            }
            self.food_index_dirty = true;
            if self.culling_due() && self.rng.random::<f32>() < self.config.culling_probability {
                self.remove_food(id);
            }
        }
    }

    fn stage_hormones(&mut self, alive: &[HormoneId]) {
        for &id in alive {
            if !self.hormones.contains(id) {
                continue;
            }
            let Some(mut hormone) = self.hormones.get(id).copied() else {
                continue;
            };
            if hormone.speed > HORMONE_SPEED_FLOOR {
                // Directed travel with linear friction.
                hormone.position.x += hormone.speed * hormone.heading.cos();
                hormone.position.y += hormone.speed * hormone.heading.sin();
                hormone.speed -= self.config.hormone_friction;
            } else {
                // Below the floor: reset speed and take an undirected step.
                hormone.speed = self.config.hormone_baseline_speed;
                hormone.heading = self.rng.random_range(0.0..FULL_TURN);
                hormone.position.x += hormone.speed * hormone.heading.cos();
                hormone.position.y += hormone.speed * hormone.heading.sin();
            }
            if self.outside_interior(hormone.position) {
                self.remove_hormone(id);
                continue;
            }
            hormone.age -= 1;
            if hormone.age == 0 {
                self.remove_hormone(id);
                continue;
            }
            if let Some(live) = self.hormones.get_mut(id) {
                *live = hormone;
            }
            self.hormone_index_dirty = true;
            if self.culling_due() && self.rng.random::<f32>() < self.config.culling_probability {
                self.remove_hormone(id);
            }
        }
    }
}
