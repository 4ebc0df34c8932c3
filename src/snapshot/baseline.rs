//! Entity baselines: the reference for entities entering a participant's view.

use super::entity::SharedEntity;
use crate::core::MAX_ENTITIES;
use crate::sync::EntityState;

/// One full entity state per id, captured at world load.
#[derive(Debug, Clone)]
pub struct Baselines {
    states: Vec<Option<EntityState>>,
}

impl Default for Baselines {
    fn default() -> Self {
        Self::new()
    }
}

impl Baselines {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            states: vec![None; MAX_ENTITIES],
        }
    }

    /// Replace the table with the current state of every linked entity.
    pub fn capture(&mut self, entities: &[SharedEntity]) {
        self.states.iter_mut().for_each(|s| *s = None);
        for (number, ent) in entities.iter().enumerate().take(MAX_ENTITIES - 1) {
            if ent.linked {
                let mut state = ent.state.clone();
                state.number = number as u16;
                self.states[number] = Some(state);
            }
        }
    }

    /// Set a single baseline.
    pub fn set(&mut self, state: EntityState) {
        if let Some(slot) = self.states.get_mut(state.number as usize) {
            *slot = Some(state);
        }
    }

    /// Baseline of `number`.
    pub fn get(&self, number: u16) -> Option<&EntityState> {
        self.states.get(number as usize)?.as_ref()
    }

    /// Baseline of `number`, or the null state when none was captured.
    pub fn reference(&self, number: u16) -> EntityState {
        self.get(number)
            .cloned()
            .unwrap_or_else(|| EntityState::null(number))
    }

    /// Captured baselines, ascending by id.
    pub fn iter(&self) -> impl Iterator<Item = &EntityState> {
        self.states.iter().flatten()
    }

    /// Number of captured baselines.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// True with no captured baselines.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::entity::Placement;

    #[test]
    fn test_capture_linked_only() {
        let mut entities = vec![SharedEntity::default(); 4];
        entities[1] = SharedEntity::linked(
            EntityState {
                model_index: 7,
                ..EntityState::default()
            },
            Placement::at(0, 0),
        );
        entities[3] = SharedEntity::linked(EntityState::default(), Placement::at(0, 0));

        let mut baselines = Baselines::new();
        baselines.set(EntityState::null(2));
        baselines.capture(&entities);

        let ids: Vec<u16> = baselines.iter().map(|s| s.number).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(baselines.get(1).map(|s| s.model_index), Some(7));
        assert_eq!(baselines.reference(2), EntityState::null(2));
        assert_eq!(baselines.len(), 2);
    }
}
