//! # Persistent IDs
//!
//! Stable per-particle identities that survive compaction. The table maps
//! an ID to the instance index it occupied this frame; IDs of killed
//! particles go back on a free list and are handed out again on spawn.

/// ID → instance index table with a recycled free list.
///
/// # Ordering
///
/// When the table grows, the new IDs are placed *under* the existing free
/// list in reverse order. IDs released earlier are reused first, and fresh
/// IDs come out in increasing order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistentIds {
    /// Index of each ID this frame (-1 when unused).
    id_to_index: Vec<i32>,
    /// Index of each ID last frame.
    prev_id_to_index: Vec<i32>,
    /// IDs available for acquisition. Popped from the back.
    free_ids: Vec<i32>,
    /// Highest ID written this frame, -1 when none.
    max_used_id: i32,
    /// Tag stamped on IDs acquired this frame.
    acquire_tag: i32,
}

impl PersistentIds {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_used_id: -1,
            ..Self::default()
        }
    }

    /// Size of the ID table.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.id_to_index.len()
    }

    /// Whether no ID has ever been allocated.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id_to_index.is_empty()
    }

    /// Number of IDs ready to be acquired.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_ids.len()
    }

    /// Highest ID in use this frame, -1 when none.
    #[inline]
    #[must_use]
    pub const fn max_used_id(&self) -> i32 {
        self.max_used_id
    }

    /// Tag given to IDs acquired this frame.
    #[inline]
    #[must_use]
    pub const fn acquire_tag(&self) -> i32 {
        self.acquire_tag
    }

    /// Sets the acquire tag for the coming frame.
    #[inline]
    pub fn set_acquire_tag(&mut self, tag: i32) {
        self.acquire_tag = tag;
    }

    /// Grows the table so at least `required` IDs exist.
    pub fn grow(&mut self, required: usize) {
        let old_len = self.id_to_index.len();
        if required <= old_len {
            return;
        }
        let Ok(required_id) = i32::try_from(required) else {
            tracing::warn!("persistent ID table capped at {} entries", i32::MAX);
            return;
        };

        self.id_to_index.resize(required, -1);
        self.prev_id_to_index.resize(required, -1);

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let first_new = old_len as i32;
        let mut free: Vec<i32> = (first_new..required_id).rev().collect();
        free.extend_from_slice(&self.free_ids);
        self.free_ids = free;
    }

    /// Takes a free ID. `None` when the table was not grown far enough.
    #[inline]
    pub fn acquire(&mut self) -> Option<i32> {
        self.free_ids.pop()
    }

    /// Records where `id` lives this frame.
    ///
    /// A negative `index` marks the particle dead and releases the ID.
    pub fn update(&mut self, id: i32, index: i32) {
        let Some(slot) = usize::try_from(id).ok().and_then(|i| self.id_to_index.get_mut(i)) else {
            return;
        };
        if index >= 0 {
            *slot = index;
            self.max_used_id = self.max_used_id.max(id);
        } else {
            *slot = -1;
            self.free_ids.push(id);
        }
    }

    /// Instance index of `id` this frame.
    #[must_use]
    pub fn index_of(&self, id: i32) -> Option<usize> {
        Self::lookup(&self.id_to_index, id)
    }

    /// Instance index of `id` last frame.
    #[must_use]
    pub fn prev_index_of(&self, id: i32) -> Option<usize> {
        Self::lookup(&self.prev_id_to_index, id)
    }

    /// Promotes this frame's table to last frame's and clears the current one.
    pub fn tick(&mut self) {
        std::mem::swap(&mut self.id_to_index, &mut self.prev_id_to_index);
        self.id_to_index.fill(-1);
        self.max_used_id = -1;
    }

    /// Undoes [`tick`](Self::tick): this frame's table comes back and last
    /// frame's is cleared.
    pub fn rewind(&mut self) {
        std::mem::swap(&mut self.id_to_index, &mut self.prev_id_to_index);
        self.prev_id_to_index.fill(-1);
        self.max_used_id = self
            .id_to_index
            .iter()
            .rposition(|&index| index >= 0)
            .and_then(|id| i32::try_from(id).ok())
            .unwrap_or(-1);
    }

    /// Forgets every ID.
    pub fn reset(&mut self) {
        self.id_to_index.clear();
        self.prev_id_to_index.clear();
        self.free_ids.clear();
        self.max_used_id = -1;
    }

    fn lookup(table: &[i32], id: i32) -> Option<usize> {
        let index = *table.get(usize::try_from(id).ok()?)?;
        usize::try_from(index).ok()
    }
}
