use anyhow::Result;
use glimmer_core::{
    Ambient, BlockPos, GlimmerConfig, PersistenceBatch, ShelterState, Vec3, World,
    WorldPersistence, spawn_allowed,
};
use glimmer_host::InMemoryWorld;
use tracing::{debug, info};

const DAY_TICKS: u64 = 240;
const NIGHT_TICKS: u64 = 240;

/// Persistence sink that forwards summaries to the tracing pipeline.
#[derive(Debug, Default)]
struct LogPersistence;

impl WorldPersistence for LogPersistence {
    fn on_tick(&mut self, payload: &PersistenceBatch) {
        debug!(
            tick = payload.summary.tick.0,
            fairies = payload.summary.fairy_count,
            entered_shelter = payload.summary.entered_shelter,
            burned = payload.summary.burned,
            "persistence flush",
        );
    }
}

fn main() -> Result<()> {
    init_tracing();

    let mut host = InMemoryWorld::with_flat_floor(32, 0);
    host.add_shelter(BlockPos::new(6, 1, 6), ShelterState::Empty);
    host.add_shelter(BlockPos::new(-10, 1, 4), ShelterState::Empty);
    host.add_shelter(BlockPos::new(14, 1, -9), ShelterState::Open);

    let config = GlimmerConfig {
        rng_seed: Some(0xFAE0_1234_5678_9ABC),
        persistence_interval: 30,
        ..GlimmerConfig::default()
    };
    let mut world = World::with_persistence(config, Box::new(LogPersistence))?;

    seed_fairies(&mut world, &host);
    info!(fairies = world.fairy_count(), "Starting Glimmer simulation");

    run_day_night_cycle(&mut world, &mut host);

    info!(
        fairies = world.fairy_count(),
        open_shelters = host.shelter_count(ShelterState::Open)
            + host.shelter_count(ShelterState::Empty),
        closed_shelters = host.shelter_count(ShelterState::Closed),
        "Simulation finished",
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn seed_fairies(world: &mut World, host: &InMemoryWorld) {
    use glimmer_core::HostWorld;

    if !spawn_allowed(host.ambient()) {
        info!("Ambient conditions forbid spawning; world starts empty");
        return;
    }
    let spawn_points = [
        Vec3::new(0.5, 3.0, 0.5),
        Vec3::new(-8.0, 2.5, 3.0),
        Vec3::new(12.0, 4.0, -5.0),
        Vec3::new(4.0, 2.0, 11.0),
    ];
    for point in spawn_points {
        let id = world.spawn_fairy(point);
        let color = world.fairy(id).map_or(0, |f| f.color);
        debug!(?id, color = format!("{color:#08x}"), "spawned fairy");
    }
}

fn run_day_night_cycle(world: &mut World, host: &mut InMemoryWorld) {
    for _ in 0..DAY_TICKS {
        world.step(host);
    }
    info!(
        tick = world.tick().0,
        fairies = world.fairy_count(),
        "Dusk falls; fairies head for shelter",
    );

    host.set_ambient(Ambient {
        is_daylight: false,
        is_raining: false,
        is_thundering: false,
    });
    for _ in 0..NIGHT_TICKS {
        let events = world.step(host);
        if events.entered_shelter > 0 {
            info!(
                tick = events.tick.0,
                entered = events.entered_shelter,
                remaining = world.fairy_count(),
                "fairies entered shelter",
            );
        }
    }
}
