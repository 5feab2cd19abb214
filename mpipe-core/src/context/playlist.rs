//! Ordered list of playable sources with a cursor

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One playlist entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    /// Id assigned by [`Playlist::add`], starting at 1, never reused
    pub id: u32,
    pub uri: String,
    pub name: String,
    /// Opaque per-item options forwarded to the source opener
    pub options: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Playlist {
    items: Vec<PlaylistItem>,
    current: Option<usize>,
    looping: bool,
    last_id: u32,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, uri: &str, name: &str, options: Vec<String>) -> u32 {
        self.last_id += 1;
        let id = self.last_id;
        self.items.push(PlaylistItem {
            id,
            uri: uri.to_string(),
            name: name.to_string(),
            options,
        });
        debug!("Playlist: added item {} ({})", id, uri);
        id
    }

    /// Remove an item; removing the current item clears the cursor
    pub fn remove(&mut self, id: u32) -> Result<PlaylistItem> {
        let index = self.index_of(id)?;
        let item = self.items.remove(index);

        self.current = match self.current {
            Some(current) if current == index => None,
            Some(current) if current > index => Some(current - 1),
            other => other,
        };
        Ok(item)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.current = None;
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[PlaylistItem] {
        &self.items
    }

    pub fn get(&self, id: u32) -> Option<&PlaylistItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn current(&self) -> Option<&PlaylistItem> {
        self.current.and_then(|index| self.items.get(index))
    }

    /// Move the cursor to `id`
    pub fn select(&mut self, id: u32) -> Result<&PlaylistItem> {
        let index = self.index_of(id)?;
        self.current = Some(index);
        Ok(&self.items[index])
    }

    /// Advance the cursor; wraps to the first item only when looping
    ///
    /// With no cursor, starts at the first item. Returns `None` (cursor
    /// unchanged) at the end of a non-looping list.
    pub fn next(&mut self) -> Option<&PlaylistItem> {
        let len = self.items.len();
        if len == 0 {
            return None;
        }

        let next = match self.current {
            None => 0,
            Some(index) if index + 1 < len => index + 1,
            Some(_) if self.looping => 0,
            Some(_) => return None,
        };
        self.current = Some(next);
        self.items.get(next)
    }

    /// Step the cursor back; wraps to the last item only when looping
    pub fn previous(&mut self) -> Option<&PlaylistItem> {
        let len = self.items.len();
        if len == 0 {
            return None;
        }

        let previous = match self.current {
            None => len - 1,
            Some(index) if index > 0 => index - 1,
            Some(_) if self.looping => len - 1,
            Some(_) => return None,
        };
        self.current = Some(previous);
        self.items.get(previous)
    }

    pub fn set_loop(&mut self, enabled: bool) {
        self.looping = enabled;
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    fn index_of(&self, id: u32) -> Result<usize> {
        self.items
            .iter()
            .position(|item| item.id == id)
            .ok_or_else(|| Error::NotFound(format!("playlist item {}", id)))
    }
}
