//! Bidirectional attachment index between stages and iterators.

use std::collections::HashMap;

/// Key of an iterator: `(stage_id, iter_id)`.
pub type IterKey = (usize, usize);

/// Tracks which stages are computed at which iterators.
///
/// Both directions are kept in sync at all times: for every entry
/// `stage -> (target, iter)` there is a matching `(target, iter) -> [.., stage, ..]`
/// entry and vice versa. Attached stage lists preserve insertion order so
/// walks over them are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachMap {
    stage_to_attach_iter: HashMap<usize, IterKey>,
    iter_to_attached_stages: HashMap<IterKey, Vec<usize>>,
}

impl AttachMap {
    /// Attach `stage_id` at `(target_stage_id, target_iter_id)`, replacing any
    /// previous attachment of the same stage.
    pub fn set_compute_at_iter(&mut self, stage_id: usize, target_stage_id: usize, target_iter_id: usize) {
        self.delete_stage_entry(stage_id);
        let key = (target_stage_id, target_iter_id);
        self.stage_to_attach_iter.insert(stage_id, key);
        self.iter_to_attached_stages.entry(key).or_default().push(stage_id);
    }

    /// Remove every record of `stage_id`: its own attachment and any stages
    /// attached to its iterators.
    pub fn delete_stage(&mut self, stage_id: usize) {
        self.delete_stage_entry(stage_id);
        // Stages that were attached at iterators of the removed stage fall
        // back to having no attachment entry at all; the caller resets their
        // compute location explicitly.
        let removed: Vec<IterKey> =
            self.iter_to_attached_stages.keys().filter(|(sid, _)| *sid == stage_id).copied().collect();
        for key in removed {
            if let Some(stages) = self.iter_to_attached_stages.remove(&key) {
                for s in stages {
                    self.stage_to_attach_iter.remove(&s);
                }
            }
        }
    }

    fn delete_stage_entry(&mut self, stage_id: usize) {
        if let Some(key) = self.stage_to_attach_iter.remove(&stage_id)
            && let Some(stages) = self.iter_to_attached_stages.get_mut(&key)
        {
            stages.retain(|s| *s != stage_id);
            if stages.is_empty() {
                self.iter_to_attached_stages.remove(&key);
            }
        }
    }

    /// Remap iterator keys after a split/fuse changed iterator positions.
    ///
    /// `from` and `to` are parallel lists of old and new keys.
    pub fn update_iters(&mut self, from: &[IterKey], to: &[IterKey]) {
        debug_assert_eq!(from.len(), to.len());
        // Detach everything first: applying the moves one by one could remap
        // an already-moved entry a second time when keys overlap.
        let mut moved: Vec<(IterKey, Vec<usize>)> = Vec::new();
        for (old_key, new_key) in from.iter().zip(to) {
            if let Some(stages) = self.iter_to_attached_stages.remove(old_key) {
                moved.push((*new_key, stages));
            }
        }
        for (new_key, stages) in moved {
            for s in &stages {
                self.stage_to_attach_iter.insert(*s, new_key);
            }
            self.iter_to_attached_stages.entry(new_key).or_default().extend(stages);
        }
    }

    /// Shift every stage id at or above `pos` by one, after a stage insertion.
    pub fn shift_stage_ids(&mut self, pos: usize) {
        let bump = |id: usize| if id >= pos { id + 1 } else { id };
        self.stage_to_attach_iter = std::mem::take(&mut self.stage_to_attach_iter)
            .into_iter()
            .map(|(s, (t, i))| (bump(s), (bump(t), i)))
            .collect();
        self.iter_to_attached_stages = std::mem::take(&mut self.iter_to_attached_stages)
            .into_iter()
            .map(|((t, i), stages)| ((bump(t), i), stages.into_iter().map(bump).collect()))
            .collect();
    }

    /// The attachment point of `stage_id`, if any.
    pub fn attach_iter_of(&self, stage_id: usize) -> Option<IterKey> {
        self.stage_to_attach_iter.get(&stage_id).copied()
    }

    /// Stages attached at `(stage_id, iter_id)`, in attachment order.
    pub fn attached_stages_at(&self, stage_id: usize, iter_id: usize) -> &[usize] {
        self.iter_to_attached_stages.get(&(stage_id, iter_id)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether any stage is attached at `(stage_id, iter_id)`.
    pub fn has_attached_stages(&self, stage_id: usize, iter_id: usize) -> bool {
        !self.attached_stages_at(stage_id, iter_id).is_empty()
    }

    /// All entries as `(stage, target, iter)` triples, sorted for stable output.
    pub fn sorted_entries(&self) -> Vec<(usize, usize, usize)> {
        let mut entries: Vec<(usize, usize, usize)> =
            self.stage_to_attach_iter.iter().map(|(s, (t, i))| (*s, *t, *i)).collect();
        entries.sort_unstable();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_stay_in_sync() {
        let mut map = AttachMap::default();
        map.set_compute_at_iter(1, 3, 2);
        map.set_compute_at_iter(0, 3, 2);
        assert_eq!(map.attach_iter_of(1), Some((3, 2)));
        assert_eq!(map.attached_stages_at(3, 2), &[1, 0]);

        // Re-attaching moves the stage.
        map.set_compute_at_iter(1, 3, 4);
        assert_eq!(map.attached_stages_at(3, 2), &[0]);
        assert_eq!(map.attached_stages_at(3, 4), &[1]);
    }

    #[test]
    fn delete_stage_clears_both_sides() {
        let mut map = AttachMap::default();
        map.set_compute_at_iter(1, 3, 2);
        map.set_compute_at_iter(2, 1, 0);
        map.delete_stage(1);
        assert_eq!(map.attach_iter_of(1), None);
        assert_eq!(map.attach_iter_of(2), None);
        assert!(!map.has_attached_stages(3, 2));
        assert!(!map.has_attached_stages(1, 0));
    }

    #[test]
    fn update_iters_moves_attachments() {
        let mut map = AttachMap::default();
        map.set_compute_at_iter(1, 3, 2);
        map.update_iters(&[(3, 2)], &[(3, 5)]);
        assert_eq!(map.attach_iter_of(1), Some((3, 5)));
        assert_eq!(map.attached_stages_at(3, 5), &[1]);
    }

    #[test]
    fn shift_stage_ids_after_insertion() {
        let mut map = AttachMap::default();
        map.set_compute_at_iter(1, 3, 2);
        map.shift_stage_ids(2);
        assert_eq!(map.attach_iter_of(1), Some((4, 2)));
        assert_eq!(map.attached_stages_at(4, 2), &[1]);
    }
}
