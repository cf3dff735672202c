//! Credential selection for channels holding several keys
//!
//! Polling mode keeps one cursor per channel id. The cursor survives index
//! reloads so rotation does not restart when channels are re-read.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use channel::{Channel, MultiKeyMode};
use common::Secret;
use parking_lot::RwLock;
use rand::RngExt;

/// A credential chosen for one request.
#[derive(Debug, Clone)]
pub struct PickedKey {
    pub index: usize,
    pub key: Secret<String>,
}

#[derive(Default)]
pub struct KeyResolver {
    cursors: RwLock<HashMap<i64, Arc<AtomicUsize>>>,
}

impl KeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a usable credential, or `None` if the channel has no enabled key.
    ///
    /// Polling hands out enabled keys in index order, wrapping around, and
    /// advances the cursor past the key it returned. Random draws uniformly
    /// among enabled keys.
    pub fn pick_key(&self, channel: &Channel) -> Option<PickedKey> {
        let len = channel.keys.len();
        if len == 0 {
            return None;
        }

        let index = if !channel.is_multi_key() {
            channel.key_enabled(0).then_some(0)?
        } else {
            match channel.multi_key_mode {
                MultiKeyMode::Polling => self.next_polled(channel)?,
                MultiKeyMode::Random => {
                    let enabled: Vec<usize> = (0..len).filter(|&i| channel.key_enabled(i)).collect();
                    if enabled.is_empty() {
                        return None;
                    }
                    enabled[rand::rng().random_range(0..enabled.len())]
                }
            }
        };

        Some(PickedKey {
            index,
            key: channel.keys[index].clone(),
        })
    }

    fn next_polled(&self, channel: &Channel) -> Option<usize> {
        let len = channel.keys.len();
        let cursor = self.cursor(channel.id);
        let mut picked = None;

        // The cursor is stored modulo len, so it never leaves [0, len).
        let _ = cursor.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            picked = None;
            let start = current % len;
            let index = (0..len)
                .map(|offset| (start + offset) % len)
                .find(|&i| channel.key_enabled(i))?;
            picked = Some(index);
            Some((index + 1) % len)
        });
        picked
    }

    fn cursor(&self, channel_id: i64) -> Arc<AtomicUsize> {
        if let Some(cursor) = self.cursors.read().get(&channel_id) {
            return Arc::clone(cursor);
        }
        Arc::clone(self.cursors.write().entry(channel_id).or_default())
    }

    /// Current cursor position for a channel, if one has been created.
    pub fn cursor_position(&self, channel_id: i64) -> Option<usize> {
        self.cursors
            .read()
            .get(&channel_id)
            .map(|c| c.load(Ordering::Acquire))
    }

    /// Drop cursors for channels that no longer exist.
    pub fn retain(&self, keep: impl Fn(i64) -> bool) {
        self.cursors.write().retain(|id, _| keep(*id));
    }
}
