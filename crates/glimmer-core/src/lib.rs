//! Core types and behavior for the Glimmer fairy simulation.
//!
//! A fairy is a small autonomous agent driven once per simulation tick. In
//! safe weather it drifts between pseudo-random wander targets near the
//! ground; when it turns dark or rainy it hunts for the nearest open shelter
//! structure, dwells on it for a few ticks, then closes the shelter behind
//! itself and despawns. The host engine (world blocks, shelter registry,
//! movement resolution) sits behind the [`HostWorld`] trait so the behavior
//! can run against the real engine, the in-memory host, or a scripted test
//! double.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use slotmap::{SlotMap, new_key_type};
use std::collections::VecDeque;
use thiserror::Error;

new_key_type! {
    /// Stable handle for fairies backed by a generational slot map.
    pub struct FairyId;
}

/// Errors raised while constructing or reconfiguring a world.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    /// Indicates a configuration value the tick pipeline cannot work with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// World-space vector with f64 components.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    /// The zero vector, also used as the "no target yet" sentinel.
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    /// Construct a new vector.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean length.
    #[must_use]
    pub fn length(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Squared distance to another point.
    #[must_use]
    pub fn squared_distance_to(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    /// Component-wise difference.
    #[must_use]
    pub fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    /// Uniform scale.
    #[must_use]
    pub fn scale(self, factor: f64) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }

    /// Whether this is exactly the zero vector (the unset-target sentinel).
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

/// Discrete block-grid coordinate.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    /// Construct a new block position.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The block containing a continuous world-space point.
    #[must_use]
    pub fn from_world(point: Vec3) -> Self {
        Self {
            x: point.x.floor() as i32,
            y: point.y.floor() as i32,
            z: point.z.floor() as i32,
        }
    }

    /// Continuous center of this block (+0.5 on each axis).
    #[must_use]
    pub fn center(self) -> Vec3 {
        Vec3::new(
            f64::from(self.x) + 0.5,
            f64::from(self.y) + 0.5,
            f64::from(self.z) + 0.5,
        )
    }

    /// Squared distance between block positions.
    #[must_use]
    pub fn squared_distance_to(self, other: Self) -> f64 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        let dz = f64::from(self.z - other.z);
        dx * dx + dy * dy + dz * dz
    }
}

/// Environmental readout gating behavior-mode selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ambient {
    pub is_daylight: bool,
    pub is_raining: bool,
    pub is_thundering: bool,
}

impl Ambient {
    /// Clear daytime weather.
    #[must_use]
    pub const fn clear_day() -> Self {
        Self {
            is_daylight: true,
            is_raining: false,
            is_thundering: false,
        }
    }

    /// Fairies seek shelter whenever it is dark or raining.
    #[must_use]
    pub const fn is_unsafe(self) -> bool {
        !self.is_daylight || self.is_raining
    }
}

/// Shelter structure occupancy state as reported by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShelterState {
    Empty,
    Open,
    Closed,
}

impl ShelterState {
    /// Whether a fairy may pick this shelter as a destination.
    #[must_use]
    pub const fn is_viable(self) -> bool {
        matches!(self, Self::Empty | Self::Open)
    }
}

/// World facilities consumed by the fairy behavior each tick.
///
/// All queries are synchronous reads of host-owned state. The behavior never
/// retains anything returned here across ticks; shelter references are plain
/// coordinates re-validated through [`HostWorld::shelter_state`] on every use.
pub trait HostWorld {
    /// Current ambient conditions.
    fn ambient(&self) -> Ambient;

    /// Whether the block at `pos` is open enough to hover inside (air-like).
    /// `false` means solid ground a fairy treats as standable.
    fn can_spawn_inside(&self, pos: BlockPos) -> bool;

    /// Shelter state at `pos`, or `None` when no shelter structure exists there.
    fn shelter_state(&self, pos: BlockPos) -> Option<ShelterState>;

    /// Transition the shelter structure at `pos` to `state`.
    fn set_shelter_state(&mut self, pos: BlockPos, state: ShelterState);

    /// Snapshot of every known shelter position. Consumed as a frozen
    /// sequence for the duration of one scan.
    fn shelters(&self) -> Vec<BlockPos>;

    /// Resolve one Euler step of movement against world collision, returning
    /// the new position.
    fn resolve_move(&self, position: Vec3, velocity: Vec3) -> Vec3;
}

/// Why a tick removed a fairy. External kills bypass the tick pipeline via
/// [`World::kill_fairy`] and are tallied separately in [`TickSummary`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DespawnCause {
    /// Caught fire.
    Burned,
    /// Dwelled on an open shelter long enough to slip inside.
    EnteredShelter,
}

/// Static configuration for a Glimmer world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlimmerConfig {
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Steering step magnitude per tick.
    pub cruise_speed: f64,
    /// Fixed vertical velocity applied while hovering over solid ground.
    pub hover_ascent: f64,
    /// Fraction of the previous velocity retained when blending toward the target.
    pub velocity_retention: f64,
    /// Gaussian spread of horizontal wander offsets.
    pub wander_spread: f64,
    /// Gaussian spread of vertical wander offsets.
    pub wander_vertical_spread: f64,
    /// Wander targets are clamped to [ground, ground + hover_band].
    pub hover_band: f64,
    /// Maximum downward blocks scanned by the ground probe.
    pub ground_probe_depth: u32,
    /// Squared distance at which a wander target counts as reached.
    pub arrival_radius_sq: f64,
    /// Ticks between shelter registry scans.
    pub shelter_scan_interval: u32,
    /// Ticks a fairy must dwell on a shelter block before entering.
    pub enter_delay: i32,
    /// Modulus applied to the raw cooldown sample (signed remainder, so the
    /// cooldown can start negative, i.e. already expired).
    pub cooldown_modulus: i32,
    /// Squared displacement below which a fairy counts as stalled.
    pub stall_threshold_sq: f64,
    /// Cooldown decrement applied on a stalled tick (1 otherwise).
    pub stall_cooldown_penalty: i32,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
    /// Interval (ticks) between persistence flushes. 0 disables persistence.
    pub persistence_interval: u32,
}

impl Default for GlimmerConfig {
    fn default() -> Self {
        Self {
            rng_seed: None,
            cruise_speed: 0.1,
            hover_ascent: 0.05,
            velocity_retention: 0.9,
            wander_spread: 10.0,
            wander_vertical_spread: 2.0,
            hover_band: 4.0,
            ground_probe_depth: 20,
            arrival_radius_sq: 9.0,
            shelter_scan_interval: 5,
            enter_delay: 4,
            cooldown_modulus: 100,
            stall_threshold_sq: 0.0125,
            stall_cooldown_penalty: 10,
            history_capacity: 256,
            persistence_interval: 0,
        }
    }
}

impl GlimmerConfig {
    /// Validates the configuration against what the tick pipeline divides,
    /// scales, and takes remainders by.
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.cruise_speed <= 0.0 {
            return Err(WorldError::InvalidConfig("cruise_speed must be positive"));
        }
        if !(0.0..=1.0).contains(&self.velocity_retention) {
            return Err(WorldError::InvalidConfig(
                "velocity_retention must be within [0, 1]",
            ));
        }
        if self.wander_spread < 0.0 || self.wander_vertical_spread < 0.0 {
            return Err(WorldError::InvalidConfig(
                "wander spreads must be non-negative",
            ));
        }
        if self.hover_band <= 0.0 {
            return Err(WorldError::InvalidConfig("hover_band must be positive"));
        }
        if self.shelter_scan_interval == 0 {
            return Err(WorldError::InvalidConfig(
                "shelter_scan_interval must be non-zero",
            ));
        }
        if self.enter_delay <= 0 {
            return Err(WorldError::InvalidConfig("enter_delay must be positive"));
        }
        if self.cooldown_modulus == 0 {
            return Err(WorldError::InvalidConfig(
                "cooldown_modulus must be non-zero",
            ));
        }
        if self.stall_threshold_sq < 0.0 {
            return Err(WorldError::InvalidConfig(
                "stall_threshold_sq must be non-negative",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Complete per-fairy state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fairy {
    /// Current world-space position.
    pub position: Vec3,
    /// Current velocity.
    pub velocity: Vec3,
    /// Position at the start of the previous tick, for stall detection.
    pub prev_position: Vec3,
    /// Packed 0xRRGGBB appearance color.
    pub color: i32,
    /// Current steering destination; the zero vector means "unset".
    pub target: Vec3,
    /// Forces wander target re-selection once it reaches zero or below.
    pub target_change_cooldown: i32,
    /// Candidate shelter, held as a coordinate and re-validated every use.
    pub shelter: Option<BlockPos>,
    /// Ticks remaining before the fairy slips into the shelter it stands on.
    pub enter_timer: i32,
    /// Cached result of the last downward ground probe.
    pub ground_level: f64,
    /// Set once the fairy has despawned; further ticks are ignored.
    pub removed: bool,
    /// Environmental flag mirrored from the host; a burning fairy despawns.
    pub on_fire: bool,
}

impl Fairy {
    /// Create a fairy at `position` with an explicit color.
    #[must_use]
    pub fn new(position: Vec3, color: i32) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            prev_position: position,
            color,
            target: Vec3::ZERO,
            target_change_cooldown: 0,
            shelter: None,
            enter_timer: 4,
            ground_level: 0.0,
            removed: false,
            on_fire: false,
        }
    }

    /// Create a fairy at `position` with a freshly sampled dual-tone color.
    #[must_use]
    pub fn with_random_color(position: Vec3, rng: &mut SmallRng) -> Self {
        Self::new(position, random_dual_tone(rng))
    }

    /// The block this fairy currently occupies.
    #[must_use]
    pub fn block_pos(&self) -> BlockPos {
        BlockPos::from_world(self.position)
    }

    /// The block the current target rounds to, sampled half a block above
    /// the target point so hovering at a block's surface counts as arrived.
    #[must_use]
    pub fn target_block_pos(&self) -> BlockPos {
        BlockPos::from_world(Vec3::new(
            self.target.x,
            self.target.y + 0.5,
            self.target.z,
        ))
    }

    /// Write engine save data. Only the color survives a save; everything
    /// else is rebuilt from behavior within a tick or two of loading.
    pub fn write_save_data(&self, tag: &mut SaveTag) {
        tag.put_int("color", self.color);
    }

    /// Read engine save data. A stored color of exactly 0 reads back as
    /// "absent" and is skipped, so a dual-tone that rounds to black is lost
    /// on reload.
    pub fn read_save_data(&mut self, tag: &SaveTag) {
        let color = tag.get_int("color");
        if color != 0 {
            self.color = color;
        }
    }
}

/// Spawn eligibility queried by the host spawner: fairies only appear in
/// daylight while it is not thundering.
#[must_use]
pub const fn spawn_allowed(ambient: Ambient) -> bool {
    ambient.is_daylight && !ambient.is_thundering
}

/// Sample a dual-tone color: one RGB channel suppressed to zero, the other
/// two uniform in [0, 1), packed as 0xRRGGBB.
#[must_use]
pub fn random_dual_tone(rng: &mut SmallRng) -> i32 {
    let suppressed = rng.random_range(0..3usize);
    let mut channels = [0.0f32; 3];
    for (idx, channel) in channels.iter_mut().enumerate() {
        if idx != suppressed {
            *channel = rng.random::<f32>();
        }
    }
    pack_rgb(channels)
}

/// Pack unit-range RGB channels into a 0xRRGGBB integer with round-half-up
/// 8-bit scaling.
#[must_use]
pub fn pack_rgb(channels: [f32; 3]) -> i32 {
    let scale = |value: f32| (((value * 255.0 + 0.5) as i32).clamp(0, 255)) & 0xFF;
    (scale(channels[0]) << 16) | (scale(channels[1]) << 8) | scale(channels[2])
}

/// Key/value save compound exchanged with the host save system.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveTag(Map<String, Value>);

impl SaveTag {
    /// An empty compound.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an integer field.
    pub fn put_int(&mut self, key: &str, value: i32) {
        self.0.insert(key.to_string(), Value::from(value));
    }

    /// Fetch an integer field; absent or non-integer fields read as 0,
    /// matching the host engine's compound-tag semantics.
    #[must_use]
    pub fn get_int(&self, key: &str) -> i32 {
        self.0
            .get(key)
            .and_then(Value::as_i64)
            .map_or(0, |v| v as i32)
    }
}

/// Advance one fairy by one tick against the host world.
///
/// Returns the despawn cause when this tick removed the fairy. The caller is
/// responsible for dropping removed fairies from whatever collection owns
/// them; the `removed` flag makes a second tick of a dead fairy a no-op.
pub fn tick_fairy(
    fairy: &mut Fairy,
    host: &mut dyn HostWorld,
    rng: &mut SmallRng,
    tick: Tick,
    config: &GlimmerConfig,
) -> Option<DespawnCause> {
    if fairy.removed {
        return None;
    }
    if fairy.on_fire {
        fairy.removed = true;
        return Some(DespawnCause::Burned);
    }

    // Stalled fairies burn through their cooldown ten times faster so they
    // re-roll targets instead of bumping a wall for a hundred ticks.
    let moved_sq = fairy.position.squared_distance_to(fairy.prev_position);
    fairy.target_change_cooldown -= if moved_sq < config.stall_threshold_sq {
        config.stall_cooldown_penalty
    } else {
        1
    };
    fairy.prev_position = fairy.position;

    if host.ambient().is_unsafe() {
        if let Some(cause) = seek_shelter(fairy, host, rng, tick, config) {
            fairy.removed = true;
            return Some(cause);
        }
    } else if fairy.target.is_zero()
        || fairy.position.squared_distance_to(fairy.target) < config.arrival_radius_sq
        || fairy.target_change_cooldown <= 0
    {
        select_wander_target(fairy, host, rng, config);
    }

    steer(fairy, host, rng, config);
    None
}

/// Shelter-seeking sub-behavior, run while the ambient readout is unsafe.
///
/// Re-validates the remembered shelter coordinate, runs the dwell timer, and
/// every `shelter_scan_interval` ticks scans the registry snapshot for the
/// closest viable shelter. Returns `Some` when the fairy entered a shelter
/// this tick.
fn seek_shelter(
    fairy: &mut Fairy,
    host: &mut dyn HostWorld,
    rng: &mut SmallRng,
    tick: Tick,
    config: &GlimmerConfig,
) -> Option<DespawnCause> {
    if let Some(pos) = fairy.shelter {
        // The coordinate may no longer host a shelter, or it may have closed
        // behind another fairy since last tick.
        match host.shelter_state(pos) {
            Some(state) if state != ShelterState::Closed => {}
            _ => fairy.shelter = None,
        }

        if let Some(pos) = fairy.shelter {
            if fairy.block_pos() == pos {
                fairy.enter_timer -= 1;
            } else {
                fairy.enter_timer = config.enter_delay;
            }
            if fairy.enter_timer <= 0 {
                host.set_shelter_state(pos, ShelterState::Closed);
                return Some(DespawnCause::EnteredShelter);
            }
        }
    }

    if tick.0 % u64::from(config.shelter_scan_interval) == 0 && fairy.shelter.is_none() {
        let candidates: Vec<BlockPos> = host
            .shelters()
            .into_iter()
            .filter(|pos| host.shelter_state(*pos).is_some_and(ShelterState::is_viable))
            .collect();

        if let Some(&first) = candidates.first() {
            // Min-by-squared-distance scan seeded with the first candidate;
            // ties keep the first-encountered entry.
            let here = fairy.block_pos();
            let mut closest = first;
            for &candidate in &candidates {
                if here.squared_distance_to(candidate) < here.squared_distance_to(closest) {
                    closest = candidate;
                }
            }
            fairy.shelter = Some(closest);
            fairy.target = closest.center();
        } else {
            select_wander_target(fairy, host, rng, config);
        }
    }

    None
}

/// Pick a fresh pseudo-random wander target near the ground.
fn select_wander_target(
    fairy: &mut Fairy,
    host: &mut dyn HostWorld,
    rng: &mut SmallRng,
    config: &GlimmerConfig,
) {
    // Downward probe: the first solid block within range sets the hover
    // floor; finding none degrades to a ground level of 0.
    fairy.ground_level = 0.0;
    for step in 0..config.ground_probe_depth {
        let probe = BlockPos::from_world(Vec3::new(
            fairy.position.x,
            fairy.position.y - f64::from(step),
            fairy.position.z,
        ));
        if !host.can_spawn_inside(probe) {
            fairy.ground_level = fairy.position.y - f64::from(step);
        }
        if fairy.ground_level != 0.0 {
            break;
        }
    }

    let gauss = |rng: &mut SmallRng| -> f64 { rng.sample(StandardNormal) };
    fairy.target.x = fairy.position.x + gauss(rng) * config.wander_spread;
    fairy.target.y = (fairy.position.y + gauss(rng) * config.wander_vertical_spread)
        .clamp(fairy.ground_level, fairy.ground_level + config.hover_band);
    fairy.target.z = fairy.position.z + gauss(rng) * config.wander_spread;

    // A target inside an open block gets nudged one block up, away from the
    // surface the probe just found.
    if host.can_spawn_inside(BlockPos::from_world(fairy.target)) {
        fairy.target.y += 1.0;
    }

    // Signed remainder: the cooldown can come out negative, which simply
    // means it is already expired next tick.
    fairy.target_change_cooldown = rng.random::<i32>() % config.cooldown_modulus;
}

/// Steering and locomotion, run every tick after target resolution.
fn steer(fairy: &mut Fairy, host: &mut dyn HostWorld, rng: &mut SmallRng, config: &GlimmerConfig) {
    let offset = fairy.target.sub(fairy.position);
    let length = offset.length();
    let direction = if length > 0.0 {
        offset.scale(config.cruise_speed / length)
    } else {
        Vec3::ZERO
    };

    let blend: f64 = rng.random::<f64>() * 0.5;
    let keep = config.velocity_retention;
    let below = BlockPos::from_world(Vec3::new(
        fairy.position.x,
        fairy.position.y - 0.1,
        fairy.position.z,
    ));

    if !host.can_spawn_inside(below) {
        // Grounded: hover gently upward instead of blending the vertical axis.
        fairy.velocity = Vec3::new(
            keep * fairy.velocity.x + blend * direction.x,
            config.hover_ascent,
            keep * fairy.velocity.z + blend * direction.z,
        );
    } else {
        fairy.velocity = Vec3::new(
            keep * fairy.velocity.x + blend * direction.x,
            keep * fairy.velocity.y + blend * direction.y,
            keep * fairy.velocity.z + blend * direction.z,
        );
    }

    // Already on the target block: skip the positional update to avoid
    // jittering around the arrival point. Only while wandering — a shelter
    // target rounds to the block above the shelter, and stopping there would
    // strand the fairy one block short of entering.
    if fairy.shelter.is_some() || fairy.block_pos() != fairy.target_block_pos() {
        fairy.position = host.resolve_move(fairy.position, fairy.velocity);
    }
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    /// Fairies that entered a shelter this tick.
    pub entered_shelter: usize,
    /// Fairies that burned up this tick.
    pub burned: usize,
}

/// Summary emitted to persistence hooks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickSummary {
    pub tick: Tick,
    pub fairy_count: usize,
    pub entered_shelter: usize,
    pub burned: usize,
    /// External kills accumulated since the previous flush.
    pub killed: usize,
}

/// Snapshot of a single fairy forwarded to persistence sinks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FairyState {
    pub id: FairyId,
    pub fairy: Fairy,
}

/// Aggregate payload forwarded to persistence sinks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceBatch {
    pub summary: TickSummary,
    pub fairies: Vec<FairyState>,
}

/// Persistence sink invoked on the configured tick interval.
pub trait WorldPersistence: Send {
    fn on_tick(&mut self, payload: &PersistenceBatch);
}

/// No-op persistence sink.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl WorldPersistence for NullPersistence {
    fn on_tick(&mut self, _payload: &PersistenceBatch) {}
}

/// Aggregate simulation state: the fairy population, clock, RNG, and
/// persistence plumbing. Host world state stays outside, passed into
/// [`World::step`] by the engine each tick.
pub struct World {
    config: GlimmerConfig,
    tick: Tick,
    rng: SmallRng,
    fairies: SlotMap<FairyId, Fairy>,
    pending_despawns: Vec<FairyId>,
    persistence: Box<dyn WorldPersistence>,
    history: VecDeque<TickSummary>,
    last_killed: usize,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("fairy_count", &self.fairies.len())
            .finish()
    }
}

impl World {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: GlimmerConfig) -> Result<Self, WorldError> {
        Self::with_persistence(config, Box::new(NullPersistence))
    }

    /// Instantiate a new world with a persistence sink attached.
    pub fn with_persistence(
        config: GlimmerConfig,
        persistence: Box<dyn WorldPersistence>,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            tick: Tick::zero(),
            rng,
            fairies: SlotMap::with_key(),
            pending_despawns: Vec::new(),
            persistence,
            history: VecDeque::with_capacity(history_capacity),
            last_killed: 0,
        })
    }

    /// Execute one simulation tick for every live fairy.
    pub fn step(&mut self, host: &mut dyn HostWorld) -> TickEvents {
        let next_tick = self.tick.next();
        let mut events = TickEvents {
            tick: next_tick,
            ..TickEvents::default()
        };

        let ids: Vec<FairyId> = self.fairies.keys().collect();
        for id in ids {
            let Some(fairy) = self.fairies.get_mut(id) else {
                continue;
            };
            match tick_fairy(fairy, host, &mut self.rng, next_tick, &self.config) {
                Some(DespawnCause::EnteredShelter) => {
                    events.entered_shelter += 1;
                    self.pending_despawns.push(id);
                }
                Some(DespawnCause::Burned) => {
                    events.burned += 1;
                    self.pending_despawns.push(id);
                }
                None => {}
            }
        }
        for id in self.pending_despawns.drain(..) {
            self.fairies.remove(id);
        }

        self.stage_persistence(next_tick, &events);
        self.tick = next_tick;
        events
    }

    fn stage_persistence(&mut self, next_tick: Tick, events: &TickEvents) {
        let interval = self.config.persistence_interval;
        if interval == 0 || next_tick.0 % u64::from(interval) != 0 {
            return;
        }
        // Kills accumulate between flushes so none drop out of the summaries.
        let killed = std::mem::take(&mut self.last_killed);
        let summary = TickSummary {
            tick: next_tick,
            fairy_count: self.fairies.len(),
            entered_shelter: events.entered_shelter,
            burned: events.burned,
            killed,
        };
        let fairies = self
            .fairies
            .iter()
            .map(|(id, fairy)| FairyState {
                id,
                fairy: fairy.clone(),
            })
            .collect();
        let batch = PersistenceBatch {
            summary: summary.clone(),
            fairies,
        };
        self.persistence.on_tick(&batch);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Spawn a fairy at `position` with a random dual-tone color, returning
    /// its handle.
    pub fn spawn_fairy(&mut self, position: Vec3) -> FairyId {
        let fairy = Fairy::with_random_color(position, &mut self.rng);
        self.fairies.insert(fairy)
    }

    /// Place a fairy with an explicit color (load path, debug commands).
    pub fn place_fairy(&mut self, position: Vec3, color: i32) -> FairyId {
        self.fairies.insert(Fairy::new(position, color))
    }

    /// External kill command. Returns whether the fairy was alive; killing
    /// twice has no additional effect.
    pub fn kill_fairy(&mut self, id: FairyId) -> bool {
        match self.fairies.get_mut(id) {
            Some(fairy) if !fairy.removed => {
                fairy.removed = true;
                self.fairies.remove(id);
                self.last_killed += 1;
                true
            }
            _ => false,
        }
    }

    /// Mark a fairy as burning; it despawns on its next tick.
    pub fn ignite_fairy(&mut self, id: FairyId) -> bool {
        match self.fairies.get_mut(id) {
            Some(fairy) => {
                fairy.on_fire = true;
                true
            }
            None => false,
        }
    }

    /// Borrow a fairy by handle.
    #[must_use]
    pub fn fairy(&self, id: FairyId) -> Option<&Fairy> {
        self.fairies.get(id)
    }

    /// Mutably borrow a fairy by handle.
    #[must_use]
    pub fn fairy_mut(&mut self, id: FairyId) -> Option<&mut Fairy> {
        self.fairies.get_mut(id)
    }

    /// Iterate over live fairies.
    pub fn fairies(&self) -> impl Iterator<Item = (FairyId, &Fairy)> {
        self.fairies.iter()
    }

    /// Number of live fairies.
    #[must_use]
    pub fn fairy_count(&self) -> usize {
        self.fairies.len()
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &GlimmerConfig {
        &self.config
    }

    /// Replace the persistence sink.
    pub fn set_persistence(&mut self, persistence: Box<dyn WorldPersistence>) {
        self.persistence = persistence;
    }

    /// Iterate over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0x5EED)
    }

    #[test]
    fn block_pos_floors_world_coordinates() {
        assert_eq!(
            BlockPos::from_world(Vec3::new(1.9, -0.1, 2.0)),
            BlockPos::new(1, -1, 2)
        );
    }

    #[test]
    fn block_center_offsets_half_on_each_axis() {
        assert_eq!(
            BlockPos::new(3, -2, 0).center(),
            Vec3::new(3.5, -1.5, 0.5)
        );
    }

    #[test]
    fn pack_rgb_scales_channels() {
        assert_eq!(pack_rgb([1.0, 0.0, 0.0]), 0x00FF_0000);
        assert_eq!(pack_rgb([0.0, 1.0, 1.0]), 0x0000_FFFF);
        assert_eq!(pack_rgb([0.0, 0.0, 0.0]), 0);
    }

    #[test]
    fn dual_tone_always_suppresses_one_channel() {
        let mut rng = rng();
        for _ in 0..64 {
            let color = random_dual_tone(&mut rng);
            let r = (color >> 16) & 0xFF;
            let g = (color >> 8) & 0xFF;
            let b = color & 0xFF;
            assert!(
                r == 0 || g == 0 || b == 0,
                "expected a suppressed channel in {color:#08x}"
            );
        }
    }

    #[test]
    fn save_tag_round_trips_color() {
        let mut fairy = Fairy::new(Vec3::ZERO, 0x00AB_CDEF);
        let mut tag = SaveTag::new();
        fairy.write_save_data(&mut tag);

        let mut restored = Fairy::new(Vec3::ZERO, 0x0011_2233);
        restored.read_save_data(&tag);
        assert_eq!(restored.color, fairy.color);
    }

    #[test]
    fn save_tag_treats_zero_color_as_absent() {
        // Known lossy case: a legitimately black dual-tone cannot survive a
        // save/load cycle.
        let fairy = Fairy::new(Vec3::ZERO, 0);
        let mut tag = SaveTag::new();
        fairy.write_save_data(&mut tag);

        let mut restored = Fairy::new(Vec3::ZERO, 0x0044_5566);
        restored.read_save_data(&tag);
        assert_eq!(restored.color, 0x0044_5566);
    }

    #[test]
    fn save_tag_missing_field_reads_as_zero() {
        let tag = SaveTag::new();
        assert_eq!(tag.get_int("color"), 0);
    }

    #[test]
    fn spawn_allowed_requires_daylight_without_thunder() {
        assert!(spawn_allowed(Ambient::clear_day()));
        assert!(!spawn_allowed(Ambient {
            is_daylight: false,
            is_raining: false,
            is_thundering: false,
        }));
        assert!(!spawn_allowed(Ambient {
            is_daylight: true,
            is_raining: false,
            is_thundering: true,
        }));
        // Plain rain does not block spawning, only darkness and thunder do.
        assert!(spawn_allowed(Ambient {
            is_daylight: true,
            is_raining: true,
            is_thundering: false,
        }));
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let mut config = GlimmerConfig::default();
        config.shelter_scan_interval = 0;
        assert_eq!(
            config.validate(),
            Err(WorldError::InvalidConfig(
                "shelter_scan_interval must be non-zero"
            ))
        );

        let mut config = GlimmerConfig::default();
        config.cruise_speed = 0.0;
        assert!(config.validate().is_err());

        let mut config = GlimmerConfig::default();
        config.velocity_retention = 1.5;
        assert!(config.validate().is_err());

        assert!(GlimmerConfig::default().validate().is_ok());
    }

    #[test]
    fn unsafe_ambient_covers_darkness_and_rain() {
        assert!(!Ambient::clear_day().is_unsafe());
        assert!(Ambient {
            is_daylight: false,
            is_raining: false,
            is_thundering: false,
        }
        .is_unsafe());
        assert!(Ambient {
            is_daylight: true,
            is_raining: true,
            is_thundering: false,
        }
        .is_unsafe());
    }

    #[test]
    fn viable_shelter_states() {
        assert!(ShelterState::Empty.is_viable());
        assert!(ShelterState::Open.is_viable());
        assert!(!ShelterState::Closed.is_viable());
    }

    #[test]
    fn target_block_rounds_half_a_block_up() {
        let mut fairy = Fairy::new(Vec3::ZERO, 1);
        fairy.target = Vec3::new(2.2, 3.6, -1.4);
        assert_eq!(fairy.target_block_pos(), BlockPos::new(2, 4, -2));
    }
}
