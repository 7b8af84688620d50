//! Window Arena
//!
//! Generation-counted storage for window records. Events reference
//! windows by [`WindowId`]; a stale id (the window was destroyed, or
//! destroyed and its slot reused) resolves to "not found" and the
//! event is dropped at dispatch instead of reaching a dead window.

use tracing::debug;

use crate::event::Rect;

/// Stable handle to a window record.
///
/// The generation counter detects slot reuse: an id minted before a
/// `remove` never resolves again, even if the slot index is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId {
    index: u32,
    generation: u32,
}

/// Per-window record tracked by the arena.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowInfo {
    /// Root-relative geometry.
    pub geometry: Rect,

    /// Whether the window is currently viewable.
    pub mapped: bool,

    /// Opaque embedder tag (toolkit user data).
    pub tag: Option<u64>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<WindowInfo>,
}

/// Arena of live windows, keyed by stable generation-counted ids.
#[derive(Debug, Default)]
pub struct WindowArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl WindowArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Register a window and return its id.
    pub fn insert(&mut self, info: WindowInfo) -> WindowId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(info);
            return WindowId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(info),
        });
        WindowId {
            index,
            generation: 0,
        }
    }

    /// Remove a window. Bumps the slot generation so outstanding ids
    /// for it go stale. Returns the record, or None if already gone.
    pub fn remove(&mut self, id: WindowId) -> Option<WindowInfo> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.entry.is_none() {
            debug!("remove of stale window id {:?}", id);
            return None;
        }
        let info = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        info
    }

    /// Resolve an id, or None if the window is gone.
    pub fn get(&self, id: WindowId) -> Option<&WindowInfo> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: WindowId) -> Option<&mut WindowInfo> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Whether the id still refers to a live window.
    pub fn contains(&self, id: WindowId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live windows.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Topmost live window containing the point, preferring the most
    /// recently inserted. Returns the id and window origin.
    pub fn window_at(&self, x: i32, y: i32) -> Option<(WindowId, (i32, i32))> {
        self.slots
            .iter()
            .enumerate()
            .rev()
            .filter_map(|(index, slot)| {
                let info = slot.entry.as_ref()?;
                if info.mapped && info.geometry.contains(x, y) {
                    Some((
                        WindowId {
                            index: index as u32,
                            generation: slot.generation,
                        },
                        (info.geometry.x, info.geometry.y),
                    ))
                } else {
                    None
                }
            })
            .next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_at(x: i32, y: i32, w: u32, h: u32) -> WindowInfo {
        WindowInfo {
            geometry: Rect::new(x, y, w, h),
            mapped: true,
            tag: None,
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let mut arena = WindowArena::new();
        let id = arena.insert(mapped_at(0, 0, 100, 100));
        assert!(arena.contains(id));
        assert_eq!(arena.len(), 1);

        let info = arena.remove(id).expect("live window");
        assert!(info.mapped);
        assert!(!arena.contains(id));
        assert!(arena.get(id).is_none());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_stale_id_after_slot_reuse() {
        let mut arena = WindowArena::new();
        let old = arena.insert(WindowInfo::default());
        arena.remove(old);

        // Reuses the slot with a new generation.
        let new = arena.insert(WindowInfo::default());
        assert_ne!(old, new);
        assert!(!arena.contains(old));
        assert!(arena.contains(new));
        assert!(arena.remove(old).is_none());
    }

    #[test]
    fn test_window_at_prefers_topmost() {
        let mut arena = WindowArena::new();
        let below = arena.insert(mapped_at(0, 0, 200, 200));
        let above = arena.insert(mapped_at(50, 50, 100, 100));

        assert_eq!(arena.window_at(60, 60).map(|(id, _)| id), Some(above));
        assert_eq!(arena.window_at(10, 10).map(|(id, _)| id), Some(below));
        assert!(arena.window_at(300, 300).is_none());

        let (_, origin) = arena.window_at(60, 60).unwrap();
        assert_eq!(origin, (50, 50));
    }
}
