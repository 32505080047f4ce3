//! Simulation core for the trail-race game.
//!
//! Agents move continuously over heightmapped terrain, each leaving a
//! persistent trail. Crossing any trail, or dipping below the water level,
//! eliminates the agent. This crate owns the per-tick decision and motion
//! models, the incremental trail/collision store, scoring, and the round
//! state machine. Rendering, windowing, and asset loading live elsewhere and
//! reach in through the read-only accessors on [`Round`].

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Convenience alias for associating side data with agents.
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// Margin below which a segment-intersection parameter is treated as an
/// endpoint touch. Consecutive trail points always share an endpoint, so
/// touching must never count as a crossing.
const INTERSECT_MARGIN: f32 = 1e-4;

/// Analog steering input below this magnitude is discarded as stick noise.
const ANALOG_DEAD_ZONE: f32 = 0.2;

/// Smoothing factor for the cosmetic slope angle (fraction of the previous
/// value retained each tick).
const SLOPE_SMOOTHING: f32 = 31.0 / 32.0;

/// Upper bound on rejection-sampling attempts per pickup before giving up.
const PICKUP_SAMPLE_ATTEMPTS: usize = 1024;

const MAX_PAD_AXES: usize = 10;
const MAX_PAD_BUTTONS: usize = 20;

/// 2D point/vector in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Unit direction for a heading angle. Headings are free-running, so any
    /// real value is acceptable here.
    #[must_use]
    pub fn from_heading(heading: f32) -> Self {
        Self::new(heading.sin(), heading.cos())
    }

    #[must_use]
    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    #[must_use]
    pub fn distance(self, other: Self) -> f32 {
        (other - self).length()
    }

    /// Z component of the 2D cross product.
    #[must_use]
    pub fn cross(self, other: Self) -> f32 {
        self.x * other.y - self.y * other.x
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }
}

impl std::ops::Add for Vec2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Mul<f32> for Vec2 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

/// 3D point used when sampling the terrain surface.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

impl std::ops::Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Directed line segment between two trail points.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Segment {
    pub a: Vec2,
    pub b: Vec2,
}

impl Segment {
    #[must_use]
    pub const fn new(a: Vec2, b: Vec2) -> Self {
        Self { a, b }
    }

    /// Classic parametric segment-segment test. Parallel, collinear, and
    /// zero-length segments report no intersection; both parameters must lie
    /// strictly inside the segment interiors, so a shared endpoint is never a
    /// crossing.
    #[must_use]
    pub fn intersection(&self, other: &Segment) -> Option<Vec2> {
        let r = self.b - self.a;
        let s = other.b - other.a;
        let denom = r.cross(s);
        if denom.abs() <= f32::EPSILON {
            return None;
        }
        let offset = other.a - self.a;
        let t = offset.cross(s) / denom;
        let u = offset.cross(r) / denom;
        let interior = INTERSECT_MARGIN..=(1.0 - INTERSECT_MARGIN);
        if interior.contains(&t) && interior.contains(&u) {
            Some(self.a + r * t)
        } else {
            None
        }
    }

    #[must_use]
    pub fn intersects(&self, other: &Segment) -> bool {
        self.intersection(other).is_some()
    }

    /// Shortest distance from a point to this segment.
    #[must_use]
    pub fn distance_to(&self, point: Vec2) -> f32 {
        let r = self.b - self.a;
        let len_sq = r.dot(r);
        if len_sq <= f32::EPSILON {
            return self.a.distance(point);
        }
        let t = ((point - self.a).dot(r) / len_sq).clamp(0.0, 1.0);
        (self.a + r * t).distance(point)
    }
}

/// Errors emitted when constructing a round.
#[derive(Debug, Error)]
pub enum RoundError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Rejection sampling could not place the requested pickups above water.
    #[error("could not place {0} pickup(s) above water")]
    PickupPlacement(usize),
}

/// Heightmapped terrain queried by the core. Implemented by the host.
pub trait Terrain {
    /// Surface point (with elevation) for a 2D position. `interpolated`
    /// selects smooth sampling where the implementation supports it.
    fn surface(&self, position: Vec2, interpolated: bool) -> Vec3;

    /// Whether the surface at `position` sits below the water level, with
    /// `tolerance` extra headroom.
    fn below_water(&self, position: Vec2, tolerance: f32) -> bool;
}

/// Polled input device access. Absent devices contribute nothing.
pub trait InputSource {
    /// Whether the key with the given code is currently held.
    fn key_pressed(&self, code: u32) -> bool;

    /// Copy the analog axes of pad `pad` into `axes`, returning the number of
    /// axes written. Zero means no such device.
    fn pad_axes(&self, pad: usize, axes: &mut [f32]) -> usize;

    /// Copy the button states of pad `pad` into `buttons`, returning the
    /// number written. Zero means no such device.
    fn pad_buttons(&self, pad: usize, buttons: &mut [bool]) -> usize;
}

/// Input source with no devices attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInput;

impl InputSource for NoInput {
    fn key_pressed(&self, _code: u32) -> bool {
        false
    }

    fn pad_axes(&self, _pad: usize, _axes: &mut [f32]) -> usize {
        0
    }

    fn pad_buttons(&self, _pad: usize, _buttons: &mut [bool]) -> usize {
        0
    }
}

/// Ephemeral per-tick output of a strategy, unclamped until the motion model
/// applies the configured limits.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Decision {
    pub acceleration: f32,
    pub steer: f32,
}

/// Key codes and pad slot a player strategy polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputBinding {
    pub accel_up: u32,
    pub accel_down: u32,
    pub steer_left: u32,
    pub steer_right: u32,
    /// Pad index polled for analog axes and buttons.
    pub pad: usize,
}

/// Closed set of decision strategies. A two-way branch, not an open registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Strategy {
    /// Reads a fixed input binding each tick.
    Player(InputBinding),
    /// Reactive one-step-lookahead avoidance heuristic.
    Autonomous,
}

impl Strategy {
    /// Produce this tick's decision for `agent`.
    #[must_use]
    pub fn decide(
        &self,
        agent: &Agent,
        trails: &TrailStore,
        terrain: &dyn Terrain,
        input: &dyn InputSource,
        config: &RaceConfig,
    ) -> Decision {
        match self {
            Self::Player(binding) => Self::decide_player(binding, input, config),
            Self::Autonomous => Self::decide_autonomous(agent, trails, terrain, config),
        }
    }

    fn decide_player(binding: &InputBinding, input: &dyn InputSource, config: &RaceConfig) -> Decision {
        let mut accel = 0.0_f32;
        let mut steer = 0.0_f32;

        if input.key_pressed(binding.accel_up) {
            accel += 1.0;
        }
        if input.key_pressed(binding.accel_down) {
            accel -= 1.0;
        }
        if input.key_pressed(binding.steer_left) {
            steer += 1.0;
        }
        if input.key_pressed(binding.steer_right) {
            steer -= 1.0;
        }

        let mut axes = [0.0_f32; MAX_PAD_AXES];
        if input.pad_axes(binding.pad, &mut axes) >= 2 {
            if axes[0].abs() < ANALOG_DEAD_ZONE {
                axes[0] = 0.0;
            }
            steer -= axes[0] * 2.0;
        }

        let mut buttons = [false; MAX_PAD_BUTTONS];
        if input.pad_buttons(binding.pad, &mut buttons) >= 2 {
            if buttons[0] {
                accel += 1.0;
            }
            if buttons[1] {
                accel -= 1.0;
            }
        }

        Decision {
            acceleration: accel.clamp(-1.0, 1.0) * config.acceleration,
            steer: steer.clamp(-1.0, 1.0) * config.turn_speed,
        }
    }

    fn decide_autonomous(
        agent: &Agent,
        trails: &TrailStore,
        terrain: &dyn Terrain,
        config: &RaceConfig,
    ) -> Decision {
        // Probe horizon scales with speed, not elapsed time. Deliberate: the
        // avoidance difficulty is tuned around this coupling.
        let dir = Vec2::from_heading(agent.heading());
        let ahead = agent.position() + dir * (agent.speed() * config.ai_lookahead);
        let probe = Segment::new(agent.position(), ahead);

        if trails.intersects_any(&probe) || terrain.below_water(ahead, config.water_tolerance) {
            Decision {
                acceleration: -config.acceleration,
                steer: -config.turn_speed,
            }
        } else {
            Decision {
                acceleration: config.acceleration,
                steer: 0.0,
            }
        }
    }
}

/// Life cycle of one agent within a round. `Out` and `OutSettled` are
/// terminal; the settled flag lags one tick so a final effect can play
/// before the agent is suppressed from drawing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AgentPhase {
    #[default]
    Active,
    Out,
    OutSettled,
}

/// Trail-emitter state updated alongside motion, consumed by the particle
/// renderer. Gameplay-inert.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EmitterState {
    pub position: Vec3,
    pub direction: Vec3,
    pub rate: f32,
}

/// One racer: pose, speed, phase, and its decision strategy.
#[derive(Debug, Clone)]
pub struct Agent {
    position: Vec2,
    heading: f32,
    speed: f32,
    slope_angle: f32,
    camera_anchor: Vec2,
    phase: AgentPhase,
    strategy: Strategy,
    emitter: EmitterState,
}

impl Agent {
    /// Construct an agent at its start pose. The camera anchor begins one
    /// unit behind the agent along its heading.
    #[must_use]
    pub fn new(position: Vec2, heading: f32, speed: f32, strategy: Strategy) -> Self {
        Self {
            position,
            heading,
            speed,
            slope_angle: 0.0,
            camera_anchor: position - Vec2::from_heading(heading),
            phase: AgentPhase::Active,
            strategy,
            emitter: EmitterState::default(),
        }
    }

    /// Integrate one decision over `dt`. No-op unless the agent is active.
    ///
    /// Acceleration and steering are clamped to the configured per-tick
    /// limits, speed to `[min_speed, max_speed]`. The heading is left
    /// unbounded; trig consumers accept any real value.
    pub fn advance(&mut self, decision: Decision, dt: f32, config: &RaceConfig, terrain: &dyn Terrain) {
        if self.phase != AgentPhase::Active {
            return;
        }

        let accel = decision
            .acceleration
            .clamp(-config.acceleration, config.acceleration);
        let steer = decision.steer.clamp(-config.turn_speed, config.turn_speed);

        self.speed = (self.speed + accel * dt).clamp(config.min_speed, config.max_speed);
        self.heading += steer * dt;

        let dir = Vec2::from_heading(self.heading);
        self.position = self.position + dir * (self.speed * dt);

        // Trailing camera anchor at a fixed follow distance.
        let offset = self.position - self.camera_anchor;
        let offset_len = offset.length();
        if offset_len > f32::EPSILON {
            self.camera_anchor = self.position - offset * (config.camera_distance / offset_len);
        }

        let base = terrain.surface(self.position, false);
        let ahead = terrain.surface(self.position + dir, false);
        let slope = ahead - base;
        let slope_len = slope.length();
        if slope_len > f32::EPSILON {
            // Smooth the pitch sample to reduce shakiness.
            let sample = (slope.y / slope_len).clamp(-1.0, 1.0).asin().to_degrees();
            self.slope_angle = self.slope_angle * SLOPE_SMOOTHING + sample * (1.0 - SLOPE_SMOOTHING);
        }

        self.emitter = EmitterState {
            position: base + Vec3::new(0.0, 2.0, 0.0) + slope * 4.0,
            direction: slope,
            rate: (self.speed / 5.0).powi(3) * config.particle_rate / 100.0,
        };
    }

    /// Transition `Active -> Out`. Set by the round controller on
    /// elimination; terminal for the rest of the round.
    pub fn mark_out(&mut self) {
        if self.phase == AgentPhase::Active {
            self.phase = AgentPhase::Out;
        }
    }

    /// Transition `Out -> OutSettled` one tick after elimination.
    pub fn settle_out(&mut self) {
        if self.phase == AgentPhase::Out {
            self.phase = AgentPhase::OutSettled;
        }
    }

    #[must_use]
    pub const fn position(&self) -> Vec2 {
        self.position
    }

    #[must_use]
    pub const fn heading(&self) -> f32 {
        self.heading
    }

    #[must_use]
    pub const fn speed(&self) -> f32 {
        self.speed
    }

    #[must_use]
    pub const fn phase(&self) -> AgentPhase {
        self.phase
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase == AgentPhase::Active
    }

    #[must_use]
    pub const fn camera_anchor(&self) -> Vec2 {
        self.camera_anchor
    }

    /// Smoothed terrain pitch in degrees. Cosmetic.
    #[must_use]
    pub const fn slope_angle(&self) -> f32 {
        self.slope_angle
    }

    #[must_use]
    pub const fn emitter(&self) -> &EmitterState {
        &self.emitter
    }

    #[must_use]
    pub const fn strategy(&self) -> &Strategy {
        &self.strategy
    }
}

/// One committed trail segment and the agent that walked it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailSegment {
    pub owner: AgentId,
    pub segment: Segment,
}

/// Append-only store of every trail walked this round.
///
/// Points are kept per agent in temporal order; committed segments live in
/// one global list so a new segment can be tested against everything walked
/// so far in a single scan. Linear in the total segment count per query,
/// which is fine at genre scale (single-digit agents, bounded rounds).
#[derive(Debug, Clone, Default)]
pub struct TrailStore {
    points: AgentMap<Vec<Vec2>>,
    segments: Vec<TrailSegment>,
    latest: AgentMap<usize>,
}

impl TrailStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `point` to `agent`'s trail, committing the segment from the
    /// previous point, and report whether that segment crosses any previously
    /// committed segment.
    ///
    /// The agent's own immediately-preceding segment is excluded (it shares
    /// an endpoint with the new one by construction), but older self-segments
    /// are fair game: crossing your own trail eliminates you. The first point
    /// of a trail commits nothing and reports no intersection.
    pub fn add_point(&mut self, agent: AgentId, point: Vec2) -> bool {
        let previous = self.points.get(agent).and_then(|trail| trail.last().copied());

        if let Some(trail) = self.points.get_mut(agent) {
            trail.push(point);
        } else {
            self.points.insert(agent, vec![point]);
        }

        let Some(previous) = previous else {
            return false;
        };

        let committed = Segment::new(previous, point);
        let skip = self.latest.get(agent).copied();
        let hit = self
            .segments
            .iter()
            .enumerate()
            .any(|(idx, existing)| Some(idx) != skip && committed.intersects(&existing.segment));

        self.segments.push(TrailSegment {
            owner: agent,
            segment: committed,
        });
        self.latest.insert(agent, self.segments.len() - 1);
        hit
    }

    /// Whether `probe` crosses any committed segment. Used by the autonomous
    /// strategy; a probe rooted at a trail endpoint is safe because endpoint
    /// touches never count.
    #[must_use]
    pub fn intersects_any(&self, probe: &Segment) -> bool {
        self.segments
            .iter()
            .any(|existing| probe.intersects(&existing.segment))
    }

    /// The points walked by one agent, in temporal order.
    #[must_use]
    pub fn trail(&self, agent: AgentId) -> &[Vec2] {
        self.points.get(agent).map_or(&[], Vec::as_slice)
    }

    /// Every committed segment across all agents, in commit order.
    #[must_use]
    pub fn segments(&self) -> &[TrailSegment] {
        &self.segments
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

/// Accumulated points per agent. Mutated only by the round controller.
#[derive(Debug, Clone, Default)]
pub struct ScoreLedger {
    points: AgentMap<u32>,
}

impl ScoreLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&mut self, agent: AgentId) {
        self.points.insert(agent, 0);
    }

    pub fn award(&mut self, agent: AgentId, points: u32) {
        if let Some(total) = self.points.get_mut(agent) {
            *total += points;
        } else {
            self.points.insert(agent, points);
        }
    }

    #[must_use]
    pub fn score(&self, agent: AgentId) -> u32 {
        self.points.get(agent).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (AgentId, u32)> + '_ {
        self.points.iter().map(|(agent, total)| (agent, *total))
    }
}

/// Start pose assigned to one roster slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartPose {
    pub position: Vec2,
    pub heading: f32,
}

/// Static configuration for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceConfig {
    /// Number of agents racing; also selects the win condition (solo rounds
    /// end at zero alive, multiplayer below two).
    pub player_count: usize,
    /// Start pose per roster slot; must cover `player_count`.
    pub start_poses: Vec<StartPose>,
    /// Strategy per roster slot; must cover `player_count`.
    pub strategies: Vec<Strategy>,
    /// Speed assigned at round start.
    pub start_speed: f32,
    /// Maximum acceleration magnitude per tick.
    pub acceleration: f32,
    /// Maximum turn rate magnitude per tick.
    pub turn_speed: f32,
    /// Lower speed clamp; agents never stop.
    pub min_speed: f32,
    /// Upper speed clamp.
    pub max_speed: f32,
    /// Headroom handed to `Terrain::below_water`.
    pub water_tolerance: f32,
    /// Follow distance of the trailing camera anchor.
    pub camera_distance: f32,
    /// Lookahead multiplier on current speed for the autonomous probe.
    /// Tunable; the horizon intentionally tracks speed, not frame time.
    pub ai_lookahead: f32,
    /// Base emission rate fed to the trail emitter.
    pub particle_rate: f32,
    /// Number of pickups placed at round start.
    pub pickup_count: usize,
    /// Proximity radius at which a pickup is consumed.
    pub pickup_radius: f32,
    /// Points awarded for a pickup.
    pub pickup_bonus: u32,
    /// Lower corner of the level bounds used for pickup placement.
    pub level_min: Vec2,
    /// Upper corner of the level bounds used for pickup placement.
    pub level_max: Vec2,
    /// Optional RNG seed for reproducible pickup placement.
    pub rng_seed: Option<u64>,
}

impl Default for RaceConfig {
    fn default() -> Self {
        use std::f32::consts::{FRAC_PI_2, PI};
        Self {
            player_count: 2,
            start_poses: vec![
                StartPose {
                    position: Vec2::new(-40.0, 0.0),
                    heading: FRAC_PI_2,
                },
                StartPose {
                    position: Vec2::new(40.0, 0.0),
                    heading: -FRAC_PI_2,
                },
                StartPose {
                    position: Vec2::new(0.0, -40.0),
                    heading: 0.0,
                },
                StartPose {
                    position: Vec2::new(0.0, 40.0),
                    heading: PI,
                },
            ],
            strategies: vec![Strategy::Autonomous; 4],
            start_speed: 10.0,
            acceleration: 10.0,
            turn_speed: 2.0,
            min_speed: 5.0,
            max_speed: 40.0,
            water_tolerance: 0.2,
            camera_distance: 10.0,
            ai_lookahead: 5.0,
            particle_rate: 100.0,
            pickup_count: 3,
            pickup_radius: 3.0,
            pickup_bonus: 1,
            level_min: Vec2::new(-100.0, -100.0),
            level_max: Vec2::new(100.0, 100.0),
            rng_seed: None,
        }
    }
}

impl RaceConfig {
    /// Validate the configuration before a round may start.
    pub fn validate(&self) -> Result<(), RoundError> {
        if self.player_count == 0 {
            return Err(RoundError::InvalidConfig("player_count must be at least 1"));
        }
        if self.start_poses.len() < self.player_count {
            return Err(RoundError::InvalidConfig(
                "start_poses must cover every roster slot",
            ));
        }
        if self.strategies.len() < self.player_count {
            return Err(RoundError::InvalidConfig(
                "strategies must cover every roster slot",
            ));
        }
        if !(self.min_speed > 0.0 && self.min_speed <= self.max_speed) {
            return Err(RoundError::InvalidConfig(
                "speed limits must satisfy 0 < min_speed <= max_speed",
            ));
        }
        if self.start_speed < self.min_speed || self.start_speed > self.max_speed {
            return Err(RoundError::InvalidConfig(
                "start_speed must lie within the speed limits",
            ));
        }
        if self.acceleration <= 0.0 || self.turn_speed <= 0.0 {
            return Err(RoundError::InvalidConfig(
                "acceleration and turn_speed must be positive",
            ));
        }
        if self.water_tolerance < 0.0 {
            return Err(RoundError::InvalidConfig(
                "water_tolerance must be non-negative",
            ));
        }
        if self.camera_distance <= 0.0 {
            return Err(RoundError::InvalidConfig(
                "camera_distance must be positive",
            ));
        }
        if self.ai_lookahead <= 0.0 {
            return Err(RoundError::InvalidConfig("ai_lookahead must be positive"));
        }
        if self.particle_rate < 0.0 {
            return Err(RoundError::InvalidConfig(
                "particle_rate must be non-negative",
            ));
        }
        if self.pickup_radius <= 0.0 {
            return Err(RoundError::InvalidConfig("pickup_radius must be positive"));
        }
        if self.level_min.x >= self.level_max.x || self.level_min.y >= self.level_max.y {
            return Err(RoundError::InvalidConfig(
                "level bounds must span a non-empty area",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
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

/// Why an agent was eliminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EliminationCause {
    /// Its new segment crossed a committed trail segment.
    Trail,
    /// Its position dipped below the water level.
    Water,
}

impl fmt::Display for EliminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trail => f.write_str("ran into a trail"),
            Self::Water => f.write_str("ran into the water"),
        }
    }
}

/// One elimination recorded during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elimination {
    pub agent: AgentId,
    pub cause: EliminationCause,
}

/// Why a round terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Multiplayer: fewer than two agents remain alive.
    LastStanding,
    /// Solo: the single agent went out.
    SoloOut,
    /// External quit signal.
    Aborted,
}

/// Round life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Running,
    Ended(EndReason),
}

/// Events emitted by one simulation tick.
#[derive(Debug, Clone, Default)]
pub struct TickEvents {
    /// Agents eliminated this tick, in roster order.
    pub eliminations: Vec<Elimination>,
    /// Pickups consumed this tick: collector and position.
    pub pickups: Vec<(AgentId, Vec2)>,
    /// Set when the termination predicate was satisfied during this tick.
    pub ended: Option<EndReason>,
}

/// Round controller: owns the agents, the trail store, the pickups, and the
/// scoring ledger, and drives the decide -> move -> collide -> score ->
/// terminate pipeline each tick.
pub struct Round {
    config: RaceConfig,
    agents: SlotMap<AgentId, Agent>,
    roster: Vec<AgentId>,
    trails: TrailStore,
    pickups: Vec<Vec2>,
    scores: ScoreLedger,
    alive: usize,
    status: RoundStatus,
}

impl fmt::Debug for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Round")
            .field("player_count", &self.config.player_count)
            .field("alive", &self.alive)
            .field("status", &self.status)
            .field("segments", &self.trails.segment_count())
            .finish()
    }
}

impl Round {
    /// Build a round from configuration: spawn agents at their start poses,
    /// seed each trail with its start position, and place pickups by
    /// rejection-sampling above-water positions inside the level bounds.
    ///
    /// Failing to construct valid initial state is the only fatal path in
    /// the core; nothing inside the tick loop errors.
    pub fn new(config: RaceConfig, terrain: &dyn Terrain) -> Result<Self, RoundError> {
        config.validate()?;

        let mut agents = SlotMap::with_key();
        let mut roster = Vec::with_capacity(config.player_count);
        let mut trails = TrailStore::new();
        let mut scores = ScoreLedger::new();

        for slot in 0..config.player_count {
            let pose = config.start_poses[slot];
            let strategy = config.strategies[slot].clone();
            let id = agents.insert(Agent::new(
                pose.position,
                pose.heading,
                config.start_speed,
                strategy,
            ));
            roster.push(id);
            trails.add_point(id, pose.position);
            scores.track(id);
        }

        let pickups = Self::place_pickups(&config, terrain)?;
        let alive = config.player_count;

        Ok(Self {
            config,
            agents,
            roster,
            trails,
            pickups,
            scores,
            alive,
            status: RoundStatus::Running,
        })
    }

    fn place_pickups(config: &RaceConfig, terrain: &dyn Terrain) -> Result<Vec<Vec2>, RoundError> {
        let mut rng = config.seeded_rng();
        let mut pickups = Vec::with_capacity(config.pickup_count);
        for _ in 0..config.pickup_count {
            let mut placed = false;
            for _ in 0..PICKUP_SAMPLE_ATTEMPTS {
                let candidate = Vec2::new(
                    rng.random_range(config.level_min.x..config.level_max.x),
                    rng.random_range(config.level_min.y..config.level_max.y),
                );
                if !terrain.below_water(candidate, config.water_tolerance) {
                    pickups.push(candidate);
                    placed = true;
                    break;
                }
            }
            if !placed {
                return Err(RoundError::PickupPlacement(config.pickup_count));
            }
        }
        Ok(pickups)
    }

    /// Advance the simulation by one tick.
    ///
    /// Agents are processed strictly in roster order: decide, integrate
    /// motion, commit the new trail point, then resolve elimination, scoring,
    /// and pickups. Later agents therefore observe earlier agents' fresh
    /// segments within the same tick. Returns the events the tick produced;
    /// ticking an ended round is a no-op.
    pub fn tick(&mut self, dt: f32, input: &dyn InputSource, terrain: &dyn Terrain) -> TickEvents {
        let mut events = TickEvents::default();
        if matches!(self.status, RoundStatus::Ended(_)) {
            return events;
        }

        // Agents eliminated on a previous tick settle now.
        for &id in &self.roster {
            self.agents[id].settle_out();
        }

        for slot in 0..self.roster.len() {
            let id = self.roster[slot];
            if !self.agents[id].is_active() {
                continue;
            }

            let decision = {
                let agent = &self.agents[id];
                agent
                    .strategy()
                    .decide(agent, &self.trails, terrain, input, &self.config)
            };
            self.agents[id].advance(decision, dt, &self.config, terrain);
            let position = self.agents[id].position();

            let crossed = self.trails.add_point(id, position);
            let submerged = terrain.below_water(position, self.config.water_tolerance);
            if crossed || submerged {
                self.agents[id].mark_out();
                self.alive -= 1;
                let cause = if crossed {
                    EliminationCause::Trail
                } else {
                    EliminationCause::Water
                };
                events.eliminations.push(Elimination { agent: id, cause });

                for &other in &self.roster {
                    if other != id && self.agents[other].is_active() {
                        self.scores.award(other, 1);
                    }
                }

                self.check_termination();
            }

            // The pickup scan still runs for an agent eliminated this very
            // tick; it entered the tick alive.
            let mut index = 0;
            while index < self.pickups.len() {
                if self.pickups[index].distance(position) < self.config.pickup_radius {
                    let consumed = self.pickups.remove(index);
                    self.scores.award(id, self.config.pickup_bonus);
                    events.pickups.push((id, consumed));
                } else {
                    index += 1;
                }
            }
        }

        if let RoundStatus::Ended(reason) = self.status {
            events.ended = Some(reason);
        }
        events
    }

    fn check_termination(&mut self) {
        if matches!(self.status, RoundStatus::Ended(_)) {
            return;
        }
        // Solo rounds are "survive": they run until the lone agent is out.
        // Multiplayer is last-one-standing: below two alive ends the round.
        if self.config.player_count == 1 {
            if self.alive == 0 {
                self.status = RoundStatus::Ended(EndReason::SoloOut);
            }
        } else if self.alive < 2 {
            self.status = RoundStatus::Ended(EndReason::LastStanding);
        }
    }

    /// End the round in response to an external quit signal.
    pub fn abort(&mut self) {
        if self.status == RoundStatus::Running {
            self.status = RoundStatus::Ended(EndReason::Aborted);
        }
    }

    #[must_use]
    pub fn config(&self) -> &RaceConfig {
        &self.config
    }

    #[must_use]
    pub const fn status(&self) -> RoundStatus {
        self.status
    }

    /// Agent handles in roster (processing) order.
    #[must_use]
    pub fn roster(&self) -> &[AgentId] {
        &self.roster
    }

    #[must_use]
    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Number of agents still active.
    #[must_use]
    pub const fn alive_count(&self) -> usize {
        self.alive
    }

    /// Read access to every trail for the renderer.
    #[must_use]
    pub const fn trails(&self) -> &TrailStore {
        &self.trails
    }

    /// Remaining pickup positions.
    #[must_use]
    pub fn pickups(&self) -> &[Vec2] {
        &self.pickups
    }

    #[must_use]
    pub const fn scores(&self) -> &ScoreLedger {
        &self.scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    struct DryTerrain;

    impl Terrain for DryTerrain {
        fn surface(&self, position: Vec2, _interpolated: bool) -> Vec3 {
            Vec3::new(position.x, 0.0, position.y)
        }

        fn below_water(&self, _position: Vec2, _tolerance: f32) -> bool {
            false
        }
    }

    struct WaterBeyond {
        x: f32,
    }

    impl Terrain for WaterBeyond {
        fn surface(&self, position: Vec2, _interpolated: bool) -> Vec3 {
            Vec3::new(position.x, 0.0, position.y)
        }

        fn below_water(&self, position: Vec2, _tolerance: f32) -> bool {
            position.x > self.x
        }
    }

    #[derive(Default)]
    struct FixedInput {
        keys: Vec<u32>,
        axes: Vec<f32>,
        buttons: Vec<bool>,
    }

    impl InputSource for FixedInput {
        fn key_pressed(&self, code: u32) -> bool {
            self.keys.contains(&code)
        }

        fn pad_axes(&self, _pad: usize, axes: &mut [f32]) -> usize {
            let count = self.axes.len().min(axes.len());
            axes[..count].copy_from_slice(&self.axes[..count]);
            count
        }

        fn pad_buttons(&self, _pad: usize, buttons: &mut [bool]) -> usize {
            let count = self.buttons.len().min(buttons.len());
            buttons[..count].copy_from_slice(&self.buttons[..count]);
            count
        }
    }

    fn binding() -> InputBinding {
        InputBinding {
            accel_up: 1,
            accel_down: 2,
            steer_left: 3,
            steer_right: 4,
            pad: 0,
        }
    }

    #[test]
    fn segments_cross_mid_span() {
        let a = Segment::new(Vec2::new(-1.0, 0.0), Vec2::new(1.0, 0.0));
        let b = Segment::new(Vec2::new(0.0, -1.0), Vec2::new(0.0, 1.0));
        let point = a.intersection(&b).expect("crossing");
        assert!(point.x.abs() < 1e-5);
        assert!(point.y.abs() < 1e-5);
        assert!(b.intersects(&a));
    }

    #[test]
    fn parallel_and_collinear_segments_do_not_intersect() {
        let a = Segment::new(Vec2::new(0.0, 0.0), Vec2::new(4.0, 0.0));
        let parallel = Segment::new(Vec2::new(0.0, 1.0), Vec2::new(4.0, 1.0));
        let collinear = Segment::new(Vec2::new(2.0, 0.0), Vec2::new(6.0, 0.0));
        assert!(!a.intersects(&parallel));
        assert!(!a.intersects(&collinear));
    }

    #[test]
    fn zero_length_segment_never_faults() {
        let degenerate = Segment::new(Vec2::new(1.0, 1.0), Vec2::new(1.0, 1.0));
        let other = Segment::new(Vec2::new(0.0, 0.0), Vec2::new(2.0, 2.0));
        assert!(!degenerate.intersects(&other));
        assert!(!other.intersects(&degenerate));
    }

    #[test]
    fn shared_endpoint_is_not_a_crossing() {
        let a = Segment::new(Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0));
        let b = Segment::new(Vec2::new(1.0, 0.0), Vec2::new(1.0, 1.0));
        assert!(!a.intersects(&b));
        assert!(!b.intersects(&a));
    }

    #[test]
    fn distance_to_segment_handles_interior_and_ends() {
        let seg = Segment::new(Vec2::new(0.0, 0.0), Vec2::new(4.0, 0.0));
        assert!((seg.distance_to(Vec2::new(2.0, 3.0)) - 3.0).abs() < 1e-5);
        assert!((seg.distance_to(Vec2::new(-3.0, 4.0)) - 5.0).abs() < 1e-5);
        let point = Segment::new(Vec2::new(1.0, 1.0), Vec2::new(1.0, 1.0));
        assert!((point.distance_to(Vec2::new(4.0, 5.0)) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn first_point_commits_nothing() {
        let mut agents: SlotMap<AgentId, ()> = SlotMap::with_key();
        let id = agents.insert(());
        let mut store = TrailStore::new();
        assert!(!store.add_point(id, Vec2::new(0.0, 0.0)));
        assert_eq!(store.segment_count(), 0);
        assert_eq!(store.trail(id).len(), 1);
    }

    #[test]
    fn straight_trail_never_self_intersects() {
        let mut agents: SlotMap<AgentId, ()> = SlotMap::with_key();
        let id = agents.insert(());
        let mut store = TrailStore::new();
        for step in 0..200 {
            assert!(
                !store.add_point(id, Vec2::new(step as f32, 0.0)),
                "false positive at step {step}"
            );
        }
        assert_eq!(store.segment_count(), 199);
    }

    #[test]
    fn turn_does_not_report_the_preceding_segment() {
        let mut agents: SlotMap<AgentId, ()> = SlotMap::with_key();
        let id = agents.insert(());
        let mut store = TrailStore::new();
        assert!(!store.add_point(id, Vec2::new(0.0, 0.0)));
        assert!(!store.add_point(id, Vec2::new(1.0, 0.0)));
        // Right-angle turn: the new segment touches the previous one at the
        // shared corner only.
        assert!(!store.add_point(id, Vec2::new(1.0, 1.0)));
    }

    #[test]
    fn figure_eight_crosses_own_trail() {
        let mut agents: SlotMap<AgentId, ()> = SlotMap::with_key();
        let id = agents.insert(());
        let mut store = TrailStore::new();
        assert!(!store.add_point(id, Vec2::new(0.0, 0.0)));
        assert!(!store.add_point(id, Vec2::new(4.0, 0.0)));
        assert!(!store.add_point(id, Vec2::new(4.0, 2.0)));
        // Cuts back through the first segment at (3, 0).
        assert!(store.add_point(id, Vec2::new(2.0, -2.0)));
    }

    #[test]
    fn crossing_another_trail_reports_hit() {
        let mut agents: SlotMap<AgentId, ()> = SlotMap::with_key();
        let a = agents.insert(());
        let b = agents.insert(());
        let mut store = TrailStore::new();
        assert!(!store.add_point(a, Vec2::new(-2.0, 0.0)));
        assert!(!store.add_point(a, Vec2::new(2.0, 0.0)));
        assert!(!store.add_point(b, Vec2::new(0.0, -2.0)));
        assert!(store.add_point(b, Vec2::new(0.0, 2.0)));
        // The crossing is recorded; a's store is unchanged by b's test.
        assert_eq!(store.segment_count(), 2);
    }

    #[test]
    fn probe_query_scans_every_segment() {
        let mut agents: SlotMap<AgentId, ()> = SlotMap::with_key();
        let id = agents.insert(());
        let mut store = TrailStore::new();
        assert!(!store.intersects_any(&Segment::new(
            Vec2::new(0.0, -1.0),
            Vec2::new(0.0, 1.0)
        )));
        store.add_point(id, Vec2::new(-2.0, 0.0));
        store.add_point(id, Vec2::new(2.0, 0.0));
        assert!(store.intersects_any(&Segment::new(
            Vec2::new(0.0, -1.0),
            Vec2::new(0.0, 1.0)
        )));
        assert!(!store.intersects_any(&Segment::new(
            Vec2::new(5.0, -1.0),
            Vec2::new(5.0, 1.0)
        )));
    }

    #[test]
    fn player_inputs_combine_and_clamp() {
        let config = RaceConfig::default();
        let strategy = Strategy::Player(binding());
        let agent = Agent::new(Vec2::default(), 0.0, config.start_speed, strategy.clone());
        let store = TrailStore::new();

        // Key plus two pad buttons held: accel saturates at the scaled limit.
        let input = FixedInput {
            keys: vec![1, 3],
            axes: vec![0.0, 0.0],
            buttons: vec![true, false],
        };
        let decision = strategy.decide(&agent, &store, &DryTerrain, &input, &config);
        assert!((decision.acceleration - config.acceleration).abs() < 1e-5);
        assert!((decision.steer - config.turn_speed).abs() < 1e-5);
    }

    #[test]
    fn analog_dead_zone_filters_small_axes() {
        let config = RaceConfig::default();
        let strategy = Strategy::Player(binding());
        let agent = Agent::new(Vec2::default(), 0.0, config.start_speed, strategy.clone());
        let store = TrailStore::new();

        let noisy = FixedInput {
            axes: vec![0.1, 0.0],
            ..Default::default()
        };
        let decision = strategy.decide(&agent, &store, &DryTerrain, &noisy, &config);
        assert_eq!(decision.steer, 0.0);

        let deflected = FixedInput {
            axes: vec![0.4, 0.0],
            ..Default::default()
        };
        let decision = strategy.decide(&agent, &store, &DryTerrain, &deflected, &config);
        // -0.4 * 2 = -0.8, scaled by the turn speed.
        assert!((decision.steer + 0.8 * config.turn_speed).abs() < 1e-5);
    }

    #[test]
    fn autonomous_brakes_before_a_trail() {
        let config = RaceConfig::default();
        let agent = Agent::new(
            Vec2::new(0.0, 0.0),
            FRAC_PI_2,
            config.start_speed,
            Strategy::Autonomous,
        );

        let mut agents: SlotMap<AgentId, ()> = SlotMap::with_key();
        let blocker = agents.insert(());
        let mut store = TrailStore::new();
        store.add_point(blocker, Vec2::new(5.0, -10.0));
        store.add_point(blocker, Vec2::new(5.0, 10.0));

        let decision = Strategy::Autonomous.decide(&agent, &store, &DryTerrain, &NoInput, &config);
        assert!((decision.acceleration + config.acceleration).abs() < 1e-5);
        assert!((decision.steer + config.turn_speed).abs() < 1e-5);
    }

    #[test]
    fn autonomous_brakes_before_water() {
        let config = RaceConfig::default();
        let agent = Agent::new(
            Vec2::new(0.0, 0.0),
            FRAC_PI_2,
            config.start_speed,
            Strategy::Autonomous,
        );
        let store = TrailStore::new();
        let terrain = WaterBeyond { x: 20.0 };

        let decision = Strategy::Autonomous.decide(&agent, &store, &terrain, &NoInput, &config);
        assert!(decision.acceleration < 0.0);
    }

    #[test]
    fn autonomous_accelerates_when_clear() {
        let config = RaceConfig::default();
        let agent = Agent::new(
            Vec2::new(0.0, 0.0),
            FRAC_PI_2,
            config.start_speed,
            Strategy::Autonomous,
        );
        let store = TrailStore::new();

        let decision = Strategy::Autonomous.decide(&agent, &store, &DryTerrain, &NoInput, &config);
        assert!((decision.acceleration - config.acceleration).abs() < 1e-5);
        assert_eq!(decision.steer, 0.0);
    }

    #[test]
    fn speed_stays_clamped_for_any_decision() {
        let config = RaceConfig::default();
        let mut agent = Agent::new(
            Vec2::default(),
            0.3,
            config.start_speed,
            Strategy::Autonomous,
        );
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..500 {
            let decision = Decision {
                acceleration: rng.random_range(-100.0..100.0),
                steer: rng.random_range(-100.0..100.0),
            };
            agent.advance(decision, 0.05, &config, &DryTerrain);
            assert!(agent.speed() >= config.min_speed);
            assert!(agent.speed() <= config.max_speed);
            assert!(agent.position().x.is_finite());
            assert!(agent.position().y.is_finite());
        }
    }

    #[test]
    fn out_agent_ignores_decisions() {
        let config = RaceConfig::default();
        let mut agent = Agent::new(
            Vec2::new(3.0, 4.0),
            0.0,
            config.start_speed,
            Strategy::Autonomous,
        );
        agent.mark_out();
        let before = agent.position();
        agent.advance(
            Decision {
                acceleration: 10.0,
                steer: 1.0,
            },
            0.1,
            &config,
            &DryTerrain,
        );
        assert_eq!(agent.position(), before);
        assert_eq!(agent.phase(), AgentPhase::Out);

        agent.settle_out();
        assert_eq!(agent.phase(), AgentPhase::OutSettled);
        // Terminal: settling again changes nothing.
        agent.settle_out();
        assert_eq!(agent.phase(), AgentPhase::OutSettled);
    }

    #[test]
    fn config_validation_rejects_bad_limits() {
        let mut config = RaceConfig::default();
        config.min_speed = 20.0;
        config.max_speed = 10.0;
        assert!(matches!(
            config.validate(),
            Err(RoundError::InvalidConfig(_))
        ));

        let mut config = RaceConfig::default();
        config.player_count = 0;
        assert!(config.validate().is_err());

        let mut config = RaceConfig::default();
        config.player_count = 8;
        assert!(config.validate().is_err(), "not enough start poses");

        assert!(RaceConfig::default().validate().is_ok());
    }

    #[test]
    fn seeded_pickups_land_above_water_and_reproduce() {
        let config = RaceConfig {
            rng_seed: Some(99),
            ..RaceConfig::default()
        };
        let terrain = WaterBeyond { x: 0.0 };
        let round_a = Round::new(config.clone(), &terrain).expect("round_a");
        let round_b = Round::new(config.clone(), &terrain).expect("round_b");
        assert_eq!(round_a.pickups().len(), config.pickup_count);
        assert_eq!(round_a.pickups(), round_b.pickups());
        for pickup in round_a.pickups() {
            assert!(!terrain.below_water(*pickup, config.water_tolerance));
        }
    }

    #[test]
    fn pickup_placement_failure_is_an_error() {
        struct Flooded;
        impl Terrain for Flooded {
            fn surface(&self, position: Vec2, _interpolated: bool) -> Vec3 {
                Vec3::new(position.x, -10.0, position.y)
            }
            fn below_water(&self, _position: Vec2, _tolerance: f32) -> bool {
                true
            }
        }
        let config = RaceConfig {
            rng_seed: Some(1),
            ..RaceConfig::default()
        };
        assert!(matches!(
            Round::new(config, &Flooded),
            Err(RoundError::PickupPlacement(_))
        ));
    }

    #[test]
    fn round_seeds_each_trail_with_the_start_position() {
        let config = RaceConfig {
            rng_seed: Some(5),
            ..RaceConfig::default()
        };
        let round = Round::new(config.clone(), &DryTerrain).expect("round");
        assert_eq!(round.roster().len(), config.player_count);
        for (slot, &id) in round.roster().iter().enumerate() {
            let trail = round.trails().trail(id);
            assert_eq!(trail.len(), 1);
            assert_eq!(trail[0], config.start_poses[slot].position);
            assert_eq!(round.scores().score(id), 0);
        }
        assert_eq!(round.alive_count(), config.player_count);
        assert_eq!(round.status(), RoundStatus::Running);
    }
}
