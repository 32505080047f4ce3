//! Headless demo shell: four autonomous racers over rolling procedural
//! terrain, ticked at a fixed rate until the round ends.

use anyhow::Result;
use tracing::{info, warn};
use trailrace_core::{NoInput, RaceConfig, Round, Strategy, Terrain, Vec2, Vec3};

const TICK_DT: f32 = 1.0 / 60.0;
const MAX_TICKS: u64 = 200_000;

/// Procedural stand-in for the heightmapped terrain collaborator: gentle
/// sine hills with a flat water level.
struct RollingTerrain {
    water_level: f32,
}

impl RollingTerrain {
    fn height(&self, position: Vec2) -> f32 {
        (position.x * 0.05).sin() * 6.0 + (position.y * 0.05).cos() * 6.0
    }
}

impl Terrain for RollingTerrain {
    fn surface(&self, position: Vec2, _interpolated: bool) -> Vec3 {
        Vec3::new(position.x, self.height(position), position.y)
    }

    fn below_water(&self, position: Vec2, tolerance: f32) -> bool {
        self.height(position) < self.water_level + tolerance
    }
}

fn main() -> Result<()> {
    init_tracing();

    let config = RaceConfig {
        player_count: 4,
        strategies: vec![Strategy::Autonomous; 4],
        rng_seed: Some(0x7261_6365),
        ..RaceConfig::default()
    };
    let terrain = RollingTerrain { water_level: -4.0 };

    let mut round = Round::new(config, &terrain)?;
    info!(
        players = round.config().player_count,
        pickups = round.pickups().len(),
        "round started"
    );

    let mut ticks = 0_u64;
    loop {
        let events = round.tick(TICK_DT, &NoInput, &terrain);
        ticks += 1;

        for elimination in &events.eliminations {
            let slot = round
                .roster()
                .iter()
                .position(|&id| id == elimination.agent);
            info!(
                slot = ?slot,
                cause = %elimination.cause,
                alive = round.alive_count(),
                "agent out"
            );
        }
        for (agent, position) in &events.pickups {
            let slot = round.roster().iter().position(|id| id == agent);
            info!(slot = ?slot, x = position.x, y = position.y, "pickup collected");
        }

        if let Some(reason) = events.ended {
            info!(?reason, ticks, "round ended");
            break;
        }
        if ticks >= MAX_TICKS {
            warn!(ticks, "tick budget exhausted, aborting round");
            round.abort();
            break;
        }
    }

    for (slot, &id) in round.roster().iter().enumerate() {
        if let Some(agent) = round.agent(id) {
            info!(
                slot,
                score = round.scores().score(id),
                phase = ?agent.phase(),
                x = agent.position().x,
                y = agent.position().y,
                "final standing"
            );
        }
    }

    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
