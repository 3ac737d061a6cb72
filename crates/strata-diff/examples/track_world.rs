//! Headless change tracking demo -- a handful of units chase each other while
//! a tracker reports what changed each tick, then the last tick is undone.
//!
//! Run with:
//!   RUST_LOG=strata_diff=debug cargo run --example track_world -p strata-diff

use std::sync::Arc;

use strata_diff::prelude::*;
use strata_ecs::prelude::*;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
struct Position {
    x: f32,
    y: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
struct Health(u32);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
struct Chase {
    target: EntityId,
}

fn main() -> Result<(), DiffError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let mut registry = TypeRegistry::new();
    registry.register::<Position>("position");
    registry.register::<Health>("health");
    registry.register_with_entity_refs::<Chase>("chase", &[std::mem::offset_of!(Chase, target)]);
    let registry = Arc::new(registry);

    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = ChangeTracker::new(Arc::clone(&registry));
    let mut ids = StableIdGenerator::seeded(42);

    // Printer
    tracker.register_change_callback(
        |ctx, changes| {
            let summary = serde_json::to_string(&changes.summary()).unwrap_or_default();
            println!("pass {}: {summary}", ctx.pass());
            for (id, pos) in changes.set_values::<Position>() {
                println!("  {id} moved to ({:.1}, {:.1})", pos.x, pos.y);
            }
            for id in changes.destroyed_stable_ids() {
                println!("  {id} destroyed");
            }
        },
        0,
    );

    // Units at zero health are removed; runs after the printer and triggers
    // another pass when it despawns anything.
    tracker.register_change_callback(
        |ctx, changes| {
            let fallen: Vec<EntityId> = changes
                .set_values::<Health>()
                .into_iter()
                .filter(|(_, health)| health.0 == 0)
                .filter_map(|(id, _)| ctx.world().find_by_stable_id(id))
                .collect();
            for entity in fallen {
                if let Err(err) = ctx.world_mut().despawn(entity) {
                    tracing::warn!(?entity, %err, "could not remove fallen unit");
                }
            }
        },
        10,
    );

    let mut units = Vec::new();
    for i in 0..4 {
        let mut bundle = ComponentBundle::new();
        bundle.add(world.registry(), Position { x: i as f32 * 10.0, y: 0.0 });
        bundle.add(world.registry(), Health(2));
        units.push(world.spawn_with_stable_id(ids.next_id(), bundle));
    }
    for (i, &unit) in units.iter().enumerate() {
        let target = units[(i + 1) % units.len()];
        world.insert(unit, Chase { target })?;
    }
    tracker.update(&mut world);

    let mut last = None;
    for tick in 0..3u32 {
        println!("-- tick {tick}");
        for &unit in &units {
            let (Some(pos), Some(chase)) = (world.get::<Position>(unit), world.get::<Chase>(unit))
            else {
                continue;
            };
            let Some(goal) = world.get::<Position>(chase.target) else {
                continue;
            };
            world.set(unit, Position { x: (pos.x + goal.x) / 2.0, y: pos.y + 1.0 })?;
        }
        if let Some(&victim) = units.get(tick as usize) {
            if let Some(health) = world.get::<Health>(victim) {
                world.set(victim, Health(health.0.saturating_sub(2)))?;
            }
        }
        // Keep a copy of the final tick's diff for the undo below.
        let before = world.clone();
        let report = tracker.update(&mut world);
        println!("   {} passes, {} dispatches", report.passes, report.dispatches);
        last = Some(diff_worlds(&before, &world, tracker.config()));
    }

    if let Some(changes) = last {
        let report = changes.undo(&mut world)?;
        println!("-- undo last tick: {}", serde_json::to_string(&report).unwrap_or_default());
        println!("   {} entities alive", world.entity_count());
    }
    Ok(())
}
