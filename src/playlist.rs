use serde::Serialize;
use std::path::{Path, PathBuf};

/// Ordered tracks plus a cursor; the cursor is always a valid index or `None`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Playlist {
    tracks: Vec<PathBuf>,
    current: Option<usize>,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<I>(&mut self, tracks: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.tracks.extend(tracks);
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.current = None;
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[PathBuf] {
        &self.tracks
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_track(&self) -> Option<&Path> {
        self.current.map(|i| self.tracks[i].as_path())
    }

    /// Move the cursor and return the new position.
    ///
    /// `pos` is 1-based and wins over `delta`; it is taken as-is and ignored when out
    /// of range. Relative moves wrap around the ends. With no current track, `+1`
    /// selects the first track and any other delta the last one.
    pub fn reposition(&mut self, delta: i64, pos: Option<i64>) -> Option<usize> {
        if self.tracks.is_empty() {
            self.current = None;
            return None;
        }

        let last = self.tracks.len() as i64 - 1;
        let target = match pos {
            Some(pos) => pos - 1,
            None => {
                let target = match self.current {
                    Some(current) => current as i64 + delta,
                    None if delta == 1 => 0,
                    None => last,
                };
                if target < 0 {
                    last
                } else if target > last {
                    0
                } else {
                    target
                }
            }
        };

        if (0..=last).contains(&target) {
            self.current = Some(target as usize);
        }
        self.current
    }
}
