// THEORY:
// The `BackgroundCache` is the memory of the adaptive background model. It keeps
// a spread of previously observed, obstruction-free frames, one per luminance
// bucket, so that when ambient light drifts the pipeline can swap in a background
// captured under similar lighting instead of rebuilding one from scratch.
//
// Key principles:
// 1.  **Bounded, monotonic growth**: new buckets are only admitted while the cache
//     holds fewer than `capacity` entries. Nothing is evicted individually.
// 2.  **Freshest per bucket**: a frame landing in an existing bucket always replaces
//     the stored one, even when the cache is full.
// 3.  **Darker first**: `find_nearest` probes outwards from the requested bucket and
//     checks the darker neighbour before the brighter one at every radius.
// 4.  **Incremental extrema**: the lowest and highest bucket ever inserted are
//     tracked on insert rather than recomputed by scanning.

use crate::core_modules::frame::{Frame, LuminanceKey};
use std::collections::BTreeMap;
use tracing::trace;

pub const DEFAULT_CAPACITY: usize = 200;
pub const DEFAULT_SEARCH_RADIUS: i32 = 100;

/// What an `insert` did with the offered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new bucket was created.
    Inserted,
    /// The bucket existed and now holds the offered frame.
    Overwritten,
    /// The bucket is new but the cache is at capacity; the frame was discarded.
    Full,
}

/// A bounded map from luminance bucket to background frame.
#[derive(Debug)]
pub struct BackgroundCache {
    entries: BTreeMap<LuminanceKey, Frame>,
    capacity: usize,
    search_radius: i32,
    lowest: Option<LuminanceKey>,
    highest: Option<LuminanceKey>,
}

impl Default for BackgroundCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_SEARCH_RADIUS)
    }
}

impl BackgroundCache {
    pub fn new(capacity: usize, search_radius: i32) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
            search_radius,
            lowest: None,
            highest: None,
        }
    }

    pub fn insert(&mut self, key: LuminanceKey, frame: Frame) -> InsertOutcome {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = frame;
            trace!(key, "background bucket refreshed");
            return InsertOutcome::Overwritten;
        }
        if self.entries.len() >= self.capacity {
            trace!(key, capacity = self.capacity, "background cache full");
            return InsertOutcome::Full;
        }

        self.entries.insert(key, frame);
        self.lowest = Some(self.lowest.map_or(key, |low| low.min(key)));
        self.highest = Some(self.highest.map_or(key, |high| high.max(key)));
        trace!(key, len = self.entries.len(), "background bucket added");
        InsertOutcome::Inserted
    }

    /// The stored frame closest to `key`, preferring the darker one on ties.
    pub fn find_nearest(&self, key: LuminanceKey) -> Option<&Frame> {
        (0..self.search_radius).find_map(|radius| {
            self.entries
                .get(&key.saturating_sub(radius))
                .or_else(|| self.entries.get(&key.saturating_add(radius)))
        })
    }

    pub fn get(&self, key: LuminanceKey) -> Option<&Frame> {
        self.entries.get(&key)
    }

    pub fn contains(&self, key: LuminanceKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The lowest and highest bucket ever inserted.
    pub fn luminance_range(&self) -> Option<(LuminanceKey, LuminanceKey)> {
        self.lowest.zip(self.highest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn frame(value: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(2, 2, Rgb([value, value, value])))
    }

    #[test]
    fn nearest_prefers_smaller_distance() {
        let mut cache = BackgroundCache::default();
        let darker = frame(97);
        cache.insert(97, darker.clone());
        cache.insert(105, frame(105));
        let found = cache.find_nearest(100).unwrap();
        assert!(found.shares_pixels_with(&darker));
    }

    #[test]
    fn nearest_prefers_darker_at_equal_distance() {
        let mut cache = BackgroundCache::default();
        let darker = frame(96);
        cache.insert(104, frame(104));
        cache.insert(96, darker.clone());
        assert!(cache.find_nearest(100).unwrap().shares_pixels_with(&darker));
    }

    #[test]
    fn exact_bucket_wins() {
        let mut cache = BackgroundCache::default();
        let exact = frame(100);
        cache.insert(99, frame(99));
        cache.insert(100, exact.clone());
        assert!(cache.find_nearest(100).unwrap().shares_pixels_with(&exact));
    }

    #[test]
    fn search_stops_before_radius_one_hundred() {
        let mut cache = BackgroundCache::default();
        cache.insert(0, frame(0));
        assert!(cache.find_nearest(99).is_some());
        assert!(cache.find_nearest(100).is_none());
        assert!(cache.find_nearest(-100).is_none());
    }

    #[test]
    fn empty_cache_has_no_match() {
        let cache = BackgroundCache::default();
        assert!(cache.find_nearest(128).is_none());
        assert_eq!(cache.luminance_range(), None);
    }

    #[test]
    fn new_keys_stop_at_capacity() {
        let mut cache = BackgroundCache::default();
        for key in 0..DEFAULT_CAPACITY as i32 {
            assert_eq!(cache.insert(key, frame(1)), InsertOutcome::Inserted);
        }
        assert_eq!(cache.len(), DEFAULT_CAPACITY);
        assert_eq!(cache.insert(500, frame(1)), InsertOutcome::Full);
        assert_eq!(cache.len(), DEFAULT_CAPACITY);
        assert!(!cache.contains(500));
        assert_eq!(cache.luminance_range(), Some((0, 199)));
    }

    #[test]
    fn existing_key_is_overwritten_even_when_full() {
        let mut cache = BackgroundCache::new(2, DEFAULT_SEARCH_RADIUS);
        cache.insert(10, frame(10));
        cache.insert(20, frame(20));
        let fresh = frame(21);
        assert_eq!(cache.insert(20, fresh.clone()), InsertOutcome::Overwritten);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(20).unwrap().shares_pixels_with(&fresh));
    }

    #[test]
    fn first_insert_seeds_both_extrema() {
        let mut cache = BackgroundCache::default();
        cache.insert(120, frame(120));
        assert_eq!(cache.luminance_range(), Some((120, 120)));
        cache.insert(80, frame(80));
        cache.insert(140, frame(140));
        cache.insert(100, frame(100));
        assert_eq!(cache.luminance_range(), Some((80, 140)));
    }
}
