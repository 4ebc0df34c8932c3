//! Visibility queries and the per-participant visible set.
//!
//! The world collision model answers spatial questions through
//! [`VisibilityMap`]. [`visible_entities`] walks the common frame once per
//! viewpoint: the participant's eye, plus at most one level of portal
//! viewpoints pushed onto an explicit stack.

use tracing::debug;

use super::entity::{ShareFlags, SharedEntity};
use super::storage::{CommonFrame, SnapshotStorage};
use crate::core::{MAX_AREA_BYTES, SnapshotError};
use crate::sync::PlayerState;

/// Region and cluster containing a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf {
    /// Region (area) index, or -1 outside the world.
    pub area: i32,
    /// Visibility cluster, or -1 outside the world.
    pub cluster: i32,
}

/// Spatial visibility data of the world.
pub trait VisibilityMap {
    /// Leaf containing `point`.
    fn point_leaf(&self, point: [f32; 3]) -> Leaf;

    /// True if regions `a` and `b` are joined through open connections.
    fn areas_connected(&self, a: i32, b: i32) -> bool;

    /// OR the bits of every region connected to `area` into `bits`,
    /// returning the number of bytes that carry regions.
    fn write_area_bits(&self, area: i32, bits: &mut [u8]) -> usize;

    /// Potentially-visible-cluster bitmask of `cluster`. `None` means
    /// everything is visible.
    fn cluster_pvs(&self, cluster: i32) -> Option<&[u8]>;
}

/// A world with one region and one cluster where everything is visible.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenWorld;

impl VisibilityMap for OpenWorld {
    fn point_leaf(&self, _point: [f32; 3]) -> Leaf {
        Leaf {
            area: 0,
            cluster: 0,
        }
    }

    fn areas_connected(&self, _a: i32, _b: i32) -> bool {
        true
    }

    fn write_area_bits(&self, _area: i32, bits: &mut [u8]) -> usize {
        if let Some(first) = bits.first_mut() {
            *first |= 1;
        }
        1
    }

    fn cluster_pvs(&self, _cluster: i32) -> Option<&[u8]> {
        None
    }
}

/// Per-entity "already added this build" marks.
#[derive(Debug, Clone)]
pub struct Generations {
    marks: Vec<u32>,
    current: u32,
}

impl Generations {
    /// Marks for `entities` ids.
    pub fn new(entities: usize) -> Self {
        Self {
            marks: vec![0; entities],
            current: 0,
        }
    }

    /// Start a new build; earlier marks are implicitly cleared.
    pub fn next(&mut self) {
        self.current = self.current.wrapping_add(1);
        if self.current == 0 {
            self.marks.fill(0);
            self.current = 1;
        }
    }

    /// Mark `id`, returning false if it was already marked this build.
    pub fn mark(&mut self, id: usize) -> bool {
        match self.marks.get_mut(id) {
            Some(m) if *m == self.current => false,
            Some(m) => {
                *m = self.current;
                true
            }
            None => false,
        }
    }
}

/// Result of a visibility pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleSet {
    /// Arena slots of visible entities, ascending by id.
    pub slots: Vec<usize>,
    /// Inverted region mask: set bits are regions the participant cannot
    /// see.
    pub area_bits: [u8; MAX_AREA_BYTES],
    /// Bytes of `area_bits` carrying regions.
    pub area_bytes: usize,
}

fn in_pvs(pvs: Option<&[u8]>, clusters: &[i32]) -> bool {
    let Some(pvs) = pvs else {
        return true;
    };
    clusters.iter().any(|&c| {
        c >= 0
            && pvs
                .get(c as usize >> 3)
                .is_some_and(|byte| byte & (1 << (c & 7)) != 0)
    })
}

fn distance_sq(a: [f32; 3], b: [f32; 3]) -> f32 {
    (0..3).map(|i| (a[i] - b[i]) * (a[i] - b[i])).sum()
}

/// Compute the entities of `frame` visible to the participant whose
/// player state is `ps`.
///
/// The participant's own entity is never included; it is rebuilt from the
/// player state. At most `max_visible` entities are returned, extras are
/// dropped silently.
pub fn visible_entities(
    storage: &SnapshotStorage,
    frame: &CommonFrame,
    entities: &[SharedEntity],
    map: &dyn VisibilityMap,
    ps: &PlayerState,
    generations: &mut Generations,
    max_visible: usize,
) -> Result<VisibleSet, SnapshotError> {
    generations.next();
    let me = ps.participant;
    generations.mark(me as usize);

    let mut set = VisibleSet {
        slots: Vec::new(),
        area_bits: [0; MAX_AREA_BYTES],
        area_bytes: 0,
    };
    let mut ids = Vec::new();
    let mut unordered = false;
    let mut dropped = 0usize;

    // (viewpoint, is portal pass)
    let mut passes = vec![(ps.eye(), false)];
    if let Some(own) = entities
        .get(me as usize)
        .filter(|e| e.flags.contains(ShareFlags::SELF_PORTAL))
    {
        passes.push((own.state.origin2, true));
        unordered = true;
    }

    while let Some((origin, portal)) = passes.pop() {
        let leaf = map.point_leaf(origin);
        set.area_bytes = set
            .area_bytes
            .max(map.write_area_bits(leaf.area, &mut set.area_bits));
        let pvs = map.cluster_pvs(leaf.cluster);

        for (slot, state) in storage.frame_entities(frame) {
            let Some(ent) = entities.get(state.number as usize) else {
                continue;
            };
            if !ent.delivers_to(u32::from(me)) {
                continue;
            }
            if !ent.flags.contains(ShareFlags::BROADCAST) {
                let place = &ent.placement;
                let reachable = map.areas_connected(leaf.area, place.area)
                    || (place.area2 != -1 && map.areas_connected(leaf.area, place.area2));
                if !reachable || !in_pvs(pvs, &place.clusters) {
                    continue;
                }
            }
            if !generations.mark(state.number as usize) {
                continue;
            }

            if ids.len() >= max_visible {
                dropped += 1;
                continue;
            }
            set.slots.push(slot);
            ids.push(state.number);

            if ent.flags.contains(ShareFlags::PORTAL) && !portal {
                if state.generic1 != 0 {
                    let range = state.generic1 as f32;
                    if distance_sq(state.origin, origin) > range * range {
                        continue;
                    }
                }
                passes.push((state.origin2, true));
                unordered = true;
            }
        }
    }

    if dropped > 0 {
        debug!(participant = me, dropped, "visible entity cap reached");
    }

    if unordered {
        let mut pairs: Vec<(u16, usize)> = ids.iter().copied().zip(set.slots.iter().copied()).collect();
        pairs.sort_unstable_by_key(|&(id, _)| id);
        ids = pairs.iter().map(|&(id, _)| id).collect();
        set.slots = pairs.into_iter().map(|(_, slot)| slot).collect();
    }
    if let Some(w) = ids.windows(2).find(|w| w[0] >= w[1]) {
        return Err(SnapshotError::DuplicateEntity(w[1]));
    }

    for byte in &mut set.area_bits[..] {
        *byte = !*byte;
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::entity::Placement;
    use crate::sync::EntityState;

    /// Two rooms (areas 0 and 1, clusters 0 and 1) and a sealed vault
    /// (area 2, cluster 2). Rooms see each other; nobody sees the vault.
    struct Rooms {
        pvs: [[u8; 1]; 3],
    }

    impl Rooms {
        fn new() -> Self {
            Self {
                pvs: [[0b011], [0b011], [0b100]],
            }
        }
    }

    impl VisibilityMap for Rooms {
        fn point_leaf(&self, point: [f32; 3]) -> Leaf {
            let region = if point[0] < 100.0 {
                0
            } else if point[0] < 200.0 {
                1
            } else {
                2
            };
            Leaf {
                area: region,
                cluster: region,
            }
        }

        fn areas_connected(&self, a: i32, b: i32) -> bool {
            a == b || (a < 2 && b < 2 && a >= 0 && b >= 0)
        }

        fn write_area_bits(&self, area: i32, bits: &mut [u8]) -> usize {
            bits[0] |= if area == 2 { 0b100 } else { 0b011 };
            1
        }

        fn cluster_pvs(&self, cluster: i32) -> Option<&[u8]> {
            self.pvs.get(cluster as usize).map(|p| &p[..])
        }
    }

    fn world(entities: &[(u16, f32, ShareFlags)]) -> Vec<SharedEntity> {
        let mut out = vec![SharedEntity::default(); 16];
        for (i, e) in out.iter_mut().enumerate() {
            e.state.number = i as u16;
        }
        for &(n, x, flags) in entities {
            let region = Rooms::new().point_leaf([x, 0.0, 0.0]).area;
            out[n as usize] = SharedEntity {
                flags,
                ..SharedEntity::linked(
                    EntityState {
                        number: n,
                        origin: [x, 0.0, 0.0],
                        ..EntityState::default()
                    },
                    Placement::at(region, region),
                )
            };
        }
        out
    }

    fn run(entities: &[SharedEntity], ps: &PlayerState, max: usize) -> (Vec<u16>, VisibleSet) {
        let mut storage = SnapshotStorage::new(64);
        let shared: Vec<EntityState> = entities
            .iter()
            .filter(|e| e.is_shared())
            .map(|e| e.state.clone())
            .collect();
        let frame = storage.build(&shared).unwrap();
        let mut generations = Generations::new(16);
        let set = visible_entities(&storage, &frame, entities, &Rooms::new(), ps, &mut generations, max).unwrap();
        let ids = set.slots.iter().map(|&s| storage.entity(s).number).collect();
        (ids, set)
    }

    fn viewer(x: f32) -> PlayerState {
        PlayerState {
            participant: 0,
            origin: [x, 0.0, 0.0],
            ..PlayerState::default()
        }
    }

    #[test]
    fn test_rooms_visible_vault_hidden() {
        let entities = world(&[
            (0, 10.0, ShareFlags::NONE),
            (3, 50.0, ShareFlags::NONE),
            (4, 150.0, ShareFlags::NONE),
            (5, 250.0, ShareFlags::NONE),
        ]);
        let (ids, set) = run(&entities, &viewer(10.0), 256);
        // Own entity 0 excluded, vault entity 5 hidden.
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(set.area_bits[0], !0b011);
        assert_eq!(set.area_bytes, 1);
    }

    #[test]
    fn test_broadcast_ignores_visibility() {
        let entities = world(&[(5, 250.0, ShareFlags::BROADCAST)]);
        let (ids, _) = run(&entities, &viewer(10.0), 256);
        assert_eq!(ids, vec![5]);
    }

    #[test]
    fn test_portal_merges_remote_view() {
        let mut entities = world(&[
            (2, 20.0, ShareFlags::PORTAL),
            (6, 260.0, ShareFlags::NONE),
            (7, 30.0, ShareFlags::NONE),
        ]);
        entities[2].state.origin2 = [255.0, 0.0, 0.0];
        let (ids, set) = run(&entities, &viewer(10.0), 256);
        assert_eq!(ids, vec![2, 6, 7]);
        assert_eq!(set.area_bits[0], !0b111);
    }

    #[test]
    fn test_portal_out_of_range() {
        let mut entities = world(&[(2, 90.0, ShareFlags::PORTAL), (6, 260.0, ShareFlags::NONE)]);
        entities[2].state.origin2 = [255.0, 0.0, 0.0];
        entities[2].state.generic1 = 10;
        let (ids, _) = run(&entities, &viewer(10.0), 256);
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_portal_cycle_terminates() {
        let mut entities = world(&[
            (2, 20.0, ShareFlags::PORTAL),
            (8, 250.0, ShareFlags::PORTAL),
            (9, 60.0, ShareFlags::NONE),
        ]);
        entities[2].state.origin2 = [255.0, 0.0, 0.0];
        // The vault portal would lead back into room 0.
        entities[8].state.origin2 = [60.0, 0.0, 0.0];
        entities[9].placement = Placement::at(1, 1);
        entities[9].state.origin = [150.0, 0.0, 0.0];
        let (ids, _) = run(&entities, &viewer(10.0), 256);
        assert_eq!(ids, vec![2, 8, 9]);
    }

    #[test]
    fn test_cap_drops_silently() {
        let entities = world(&[
            (3, 10.0, ShareFlags::NONE),
            (4, 20.0, ShareFlags::NONE),
            (5, 30.0, ShareFlags::NONE),
        ]);
        let (ids, _) = run(&entities, &viewer(10.0), 2);
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_self_portal() {
        let mut entities = world(&[(0, 10.0, ShareFlags::SELF_PORTAL), (5, 250.0, ShareFlags::NONE)]);
        entities[0].state.origin2 = [250.0, 0.0, 0.0];
        let (ids, _) = run(&entities, &viewer(10.0), 256);
        assert_eq!(ids, vec![5]);
    }

    #[test]
    fn test_generations_wrap() {
        let mut g = Generations::new(2);
        g.current = u32::MAX;
        g.marks[1] = 1;
        g.next();
        assert!(g.mark(1));
        assert!(!g.mark(1));
        assert!(!g.mark(5));
    }
}
