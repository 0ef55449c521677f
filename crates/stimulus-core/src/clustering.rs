//! Greedy leader/follower clustering of agents.
//!
//! Healthiest agents are preferred as leaders, leaders are kept apart by a
//! spacing radius, followers join the nearest leader with room, and the
//! outermost followers per angular sector become the group's edge agents.
//! The result is greedy rather than optimal; it depends only on input order
//! and a stable sort, so equal inputs always give equal outputs.
//!
//! Every loop checks the [`Deadline`] and returns what it has so far once
//! it passes.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;

use stimulus_types::{AgentId, AgentSnapshot, GroupComputeResult, GroupConfig, Vec3, WorldId};
use tracing::debug;

use crate::deadline::Deadline;

/// Cluster `agents` into groups.
pub fn compute_groups(
    world_id: WorldId,
    agents: &[AgentSnapshot],
    config: &GroupConfig,
    deadline: &Deadline,
) -> GroupComputeResult {
    let mut result = GroupComputeResult::empty(world_id);

    let mut alive: Vec<&AgentSnapshot> = agents.iter().filter(|a| a.alive).collect();
    alive.sort_by(|a, b| b.health.total_cmp(&a.health));
    let Some(first) = alive.first().copied() else {
        return result;
    };

    // Leaders.
    let spacing = config.group_radius * config.leader_spacing_multiplier;
    let mut leaders: Vec<&AgentSnapshot> = Vec::new();
    for &candidate in &alive {
        if leaders.len() >= config.max_leaders {
            break;
        }
        if deadline.is_expired() {
            debug!(leaders = leaders.len(), "clustering deadline hit while picking leaders");
            break;
        }
        let spaced = leaders
            .iter()
            .all(|l| l.position.horizontal_distance(candidate.position) > spacing);
        if spaced {
            leaders.push(candidate);
        }
    }
    if leaders.is_empty() {
        leaders.push(first);
    }
    for leader in &leaders {
        result.agent_id_to_leader_id.insert(leader.id, leader.id);
    }
    if deadline.is_expired() {
        return result;
    }

    // Followers.
    let leader_ids: BTreeSet<AgentId> = leaders.iter().map(|l| l.id).collect();
    let mut members: Vec<Vec<&AgentSnapshot>> = vec![Vec::new(); leaders.len()];
    for &agent in alive.iter().filter(|a| !leader_ids.contains(&a.id)) {
        if deadline.is_expired() {
            debug!("clustering deadline hit while assigning followers");
            return result;
        }
        let nearest = leaders
            .iter()
            .zip(members.iter())
            .enumerate()
            .filter(|(_, (_, group))| group.len() < config.max_group_size)
            .map(|(i, (leader, _))| (i, leader.position.horizontal_distance(agent.position)))
            .filter(|(_, d)| *d <= config.group_radius)
            .min_by(|a, b| a.1.total_cmp(&b.1));
        let slot = nearest.and_then(|(i, _)| Some((i, members.get_mut(i)?)));
        match slot {
            Some((i, group)) => {
                group.push(agent);
                if let Some(leader) = leaders.get(i) {
                    result.agent_id_to_leader_id.insert(agent.id, leader.id);
                }
            }
            None => {
                result.deserted_agent_ids.insert(agent.id);
            }
        }
    }

    // Edge agents.
    for (leader, group) in leaders.iter().zip(&members) {
        if deadline.is_expired() {
            debug!("clustering deadline hit while picking edge agents");
            break;
        }
        let edges = edge_agents(leader.position, group, config);
        if !edges.is_empty() {
            result.edge_agents_by_leader_id.insert(leader.id, edges);
        }
    }
    result
}

/// Farthest members per angular sector around `leader`.
///
/// Falls back to the single farthest member when sectors produce nothing.
fn edge_agents(leader: Vec3, group: &[&AgentSnapshot], config: &GroupConfig) -> BTreeSet<AgentId> {
    let mut edges = BTreeSet::new();
    if group.is_empty() {
        return edges;
    }

    if config.num_sectors > 0 && config.edge_agents_per_sector > 0 {
        let mut sectors: BTreeMap<usize, Vec<(f64, AgentId)>> = BTreeMap::new();
        for member in group {
            let sector = sector_of(leader, member.position, config.num_sectors);
            let distance = leader.horizontal_distance(member.position);
            sectors.entry(sector).or_default().push((distance, member.id));
        }
        for members in sectors.values_mut() {
            members.sort_by(|a, b| b.0.total_cmp(&a.0));
            edges.extend(
                members
                    .iter()
                    .take(config.edge_agents_per_sector)
                    .map(|(_, id)| *id),
            );
        }
    }

    if edges.is_empty() {
        let farthest = group.iter().max_by(|a, b| {
            leader
                .horizontal_distance(a.position)
                .total_cmp(&leader.horizontal_distance(b.position))
        });
        if let Some(member) = farthest {
            edges.insert(member.id);
        }
    }
    edges
}

/// Angular sector in `[0, sectors)` of `point` as seen from `leader`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn sector_of(leader: Vec3, point: Vec3, sectors: usize) -> usize {
    let angle = (point.z - leader.z).atan2(point.x - leader.x);
    let n = sectors as f64;
    let raw = ((angle + PI) / (2.0 * PI) * n).floor();
    (raw.max(0.0) as usize).min(sectors.saturating_sub(1))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_precision_loss
)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::deadline::ManualClock;

    fn agent(x: f64, z: f64, health: f64) -> AgentSnapshot {
        AgentSnapshot {
            id: AgentId::new(),
            position: Vec3::new(x, 64.0, z),
            health,
            alive: true,
        }
    }

    fn world() -> WorldId {
        WorldId::parse("w").unwrap()
    }

    /// Deterministic scatter for property checks.
    fn scatter(seed: u64, n: usize) -> Vec<AgentSnapshot> {
        let mut state = seed;
        let mut next = move || {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 33) as f64 / f64::from(1_u32 << 31)
        };
        (0..n)
            .map(|_| {
                let mut a = agent(next() * 200.0 - 100.0, next() * 200.0 - 100.0, next() * 20.0);
                a.alive = next() > 0.1;
                a
            })
            .collect()
    }

    #[test]
    fn healthiest_agent_leads() {
        let weak = agent(0.0, 0.0, 1.0);
        let strong = agent(2.0, 0.0, 9.0);
        let out = compute_groups(world(), &[weak.clone(), strong.clone()], &GroupConfig::default(), &Deadline::unbounded());
        assert_eq!(out.leaders().collect::<Vec<_>>(), [strong.id]);
        assert_eq!(out.agent_id_to_leader_id.get(&weak.id), Some(&strong.id));
        assert!(out.deserted_agent_ids.is_empty());
    }

    #[test]
    fn dead_agents_are_ignored() {
        let mut dead = agent(0.0, 0.0, 50.0);
        dead.alive = false;
        let live = agent(1.0, 0.0, 1.0);
        let out = compute_groups(world(), &[dead.clone(), live.clone()], &GroupConfig::default(), &Deadline::unbounded());
        assert!(!out.agent_id_to_leader_id.contains_key(&dead.id));
        assert_eq!(out.agent_id_to_leader_id.get(&live.id), Some(&live.id));
    }

    #[test]
    fn no_leaders_allowed_still_forces_one() {
        let config = GroupConfig { max_leaders: 0, ..GroupConfig::default() };
        let agents = [agent(0.0, 0.0, 5.0), agent(3.0, 0.0, 1.0)];
        let out = compute_groups(world(), &agents, &config, &Deadline::unbounded());
        assert_eq!(out.leaders().count(), 1);
    }

    #[test]
    fn full_groups_and_far_agents_desert() {
        let config = GroupConfig { max_leaders: 1, max_group_size: 1, ..GroupConfig::default() };
        let agents = [
            agent(0.0, 0.0, 10.0),
            agent(1.0, 0.0, 5.0),
            agent(2.0, 0.0, 4.0),
            agent(500.0, 0.0, 3.0),
        ];
        let out = compute_groups(world(), &agents, &config, &Deadline::unbounded());
        assert_eq!(out.members_of(agents[0].id).count(), 1);
        assert_eq!(out.deserted_agent_ids.len(), 2);
    }

    #[test]
    fn one_edge_agent_per_sector() {
        let leader = agent(0.0, 0.0, 10.0);
        let east_near = agent(3.0, 0.0, 1.0);
        let east_far = agent(9.0, 0.1, 1.0);
        let west = agent(-5.0, 0.1, 1.0);
        let out = compute_groups(
            world(),
            &[leader.clone(), east_near.clone(), east_far.clone(), west.clone()],
            &GroupConfig::default(),
            &Deadline::unbounded(),
        );
        let edges = out.edge_agents_by_leader_id.get(&leader.id).unwrap();
        assert_eq!(edges, &BTreeSet::from([east_far.id, west.id]));
    }

    #[test]
    fn zero_sectors_fall_back_to_farthest_member() {
        let config = GroupConfig { num_sectors: 0, ..GroupConfig::default() };
        let leader = agent(0.0, 0.0, 10.0);
        let near = agent(2.0, 0.0, 1.0);
        let far = agent(0.0, 7.0, 1.0);
        let out = compute_groups(world(), &[leader.clone(), near, far.clone()], &config, &Deadline::unbounded());
        assert_eq!(out.edge_agents_by_leader_id.get(&leader.id), Some(&BTreeSet::from([far.id])));
    }

    #[test]
    fn sectors_cover_full_circle() {
        let origin = Vec3::new(0.0, 0.0, 0.0);
        assert_eq!(sector_of(origin, Vec3::new(-1.0, 0.0, -1e-9), 8), 0);
        assert_eq!(sector_of(origin, Vec3::new(-1.0, 0.0, 0.0), 8), 7);
        assert_eq!(sector_of(origin, Vec3::new(1.0, 0.0, 0.0), 8), 4);
        for i in 0..32 {
            let angle = f64::from(i) * PI / 16.0;
            let s = sector_of(origin, Vec3::new(angle.cos(), 0.0, angle.sin()), 8);
            assert!(s < 8);
        }
    }

    #[test]
    fn expired_deadline_returns_partial_result() {
        let clock = Arc::new(ManualClock::new());
        let deadline = Deadline::with_clock(clock, Duration::ZERO);
        let agents = scatter(7, 40);
        let out = compute_groups(world(), &agents, &GroupConfig::default(), &deadline);
        // Only the forced leader is recorded.
        assert_eq!(out.agent_id_to_leader_id.len(), 1);
        assert!(out.edge_agents_by_leader_id.is_empty());
    }

    #[test]
    fn invariants_hold_on_scattered_inputs() {
        let config = GroupConfig { max_group_size: 4, ..GroupConfig::default() };
        let spacing = config.group_radius * config.leader_spacing_multiplier;
        for seed in 1..30 {
            let agents = scatter(seed, 60);
            let by_id: BTreeMap<AgentId, &AgentSnapshot> = agents.iter().map(|a| (a.id, a)).collect();
            let out = compute_groups(world(), &agents, &config, &Deadline::unbounded());

            for (agent, leader) in &out.agent_id_to_leader_id {
                let d = by_id[agent].position.horizontal_distance(by_id[leader].position);
                assert!(d <= config.group_radius);
            }
            let leaders: Vec<AgentId> = out.leaders().collect();
            for leader in &leaders {
                assert!(out.members_of(*leader).count() <= config.max_group_size);
            }
            for (i, a) in leaders.iter().enumerate() {
                for b in leaders.iter().skip(i + 1) {
                    let d = by_id[a].position.horizontal_distance(by_id[b].position);
                    assert!(d > spacing);
                }
            }
            let alive = agents.iter().filter(|a| a.alive).count();
            assert_eq!(out.agent_id_to_leader_id.len() + out.deserted_agent_ids.len(), alive);
        }
    }
}
