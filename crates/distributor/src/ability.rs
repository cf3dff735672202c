//! Ability index: which channels serve which model in which group
//!
//! Built once per reload from the full channel list and never mutated.
//! Status changes produce a new index through [`AbilityIndex::with_status`],
//! so readers holding an older snapshot keep a consistent view.

use std::collections::HashMap;
use std::sync::Arc;

use channel::{Channel, ChannelStatus};

/// Immutable group → model → candidates map.
///
/// Candidate lists are ordered by priority descending, then id ascending.
/// Manually disabled channels are kept in the id map (so pinned lookups can
/// report them as disabled) but never appear as candidates.
#[derive(Debug, Default)]
pub struct AbilityIndex {
    channels: HashMap<i64, Arc<Channel>>,
    routes: HashMap<String, HashMap<String, Vec<Arc<Channel>>>>,
}

impl AbilityIndex {
    pub fn build(channels: Vec<Channel>) -> Self {
        Self::from_shared(channels.into_iter().map(Arc::new).collect())
    }

    fn from_shared(channels: Vec<Arc<Channel>>) -> Self {
        let mut routes: HashMap<String, HashMap<String, Vec<Arc<Channel>>>> = HashMap::new();

        for channel in channels.iter().filter(|c| c.is_routable()) {
            for group in channel.groups.iter().map(|g| g.trim()).filter(|g| !g.is_empty()) {
                let models = routes.entry(group.to_string()).or_default();
                for model in channel.eligible_models() {
                    models
                        .entry(model.to_string())
                        .or_default()
                        .push(Arc::clone(channel));
                }
            }
        }

        for candidates in routes.values_mut().flat_map(|models| models.values_mut()) {
            candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        }

        Self {
            channels: channels.into_iter().map(|c| (c.id, c)).collect(),
            routes,
        }
    }

    /// Candidates for a model in a group. Falls back to the model name with
    /// its trailing date stamp removed when the exact name has no channels.
    pub fn candidates(&self, group: &str, model: &str) -> &[Arc<Channel>] {
        let Some(models) = self.routes.get(group) else {
            return &[];
        };
        if let Some(exact) = models.get(model).filter(|c| !c.is_empty()) {
            return exact;
        }
        normalize_model_name(model)
            .and_then(|base| models.get(base))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Any channel by id, including ones excluded from routing.
    pub fn channel(&self, id: i64) -> Option<&Arc<Channel>> {
        self.channels.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Models routable in a group, sorted.
    pub fn models(&self, group: &str) -> Vec<&str> {
        let mut models: Vec<&str> = self
            .routes
            .get(group)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        models.sort_unstable();
        models
    }

    /// A copy of this index with one channel's status replaced. Returns an
    /// equivalent index if the channel is unknown.
    pub fn with_status(&self, id: i64, status: ChannelStatus) -> Self {
        let channels = self
            .channels
            .values()
            .map(|c| {
                if c.id == id && c.status != status {
                    let mut updated = Channel::clone(c);
                    updated.status = status;
                    Arc::new(updated)
                } else {
                    Arc::clone(c)
                }
            })
            .collect();
        Self::from_shared(channels)
    }
}

/// Strip a trailing date stamp (`-2024-08-06` or `-20240806`) from a model
/// name. Returns `None` if there is none.
pub fn normalize_model_name(model: &str) -> Option<&str> {
    let digits = |s: &str, n: usize| s.len() == n && s.bytes().all(|b| b.is_ascii_digit());

    let (head, last) = model.rsplit_once('-')?;
    if digits(last, 8) {
        return (!head.is_empty()).then_some(head);
    }
    if !digits(last, 2) {
        return None;
    }
    let (head, month) = head.rsplit_once('-')?;
    if !digits(month, 2) {
        return None;
    }
    let (head, year) = head.rsplit_once('-')?;
    (digits(year, 4) && !head.is_empty()).then_some(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: i64, priority: i64, groups: &[&str], models: &[&str]) -> Channel {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("ch{id}"),
            "type": 1,
            "priority": priority,
            "groups": groups,
            "models": models,
            "keys": ["sk"],
        }))
        .unwrap()
    }

    fn ids(candidates: &[Arc<Channel>]) -> Vec<i64> {
        candidates.iter().map(|c| c.id).collect()
    }

    #[test]
    fn candidates_sorted_by_priority_then_id() {
        let index = AbilityIndex::build(vec![
            channel(3, 0, &["default"], &["gpt-4"]),
            channel(1, 10, &["default"], &["gpt-4"]),
            channel(2, 0, &["default"], &["gpt-4"]),
        ]);
        assert_eq!(ids(index.candidates("default", "gpt-4")), vec![1, 2, 3]);
    }

    #[test]
    fn groups_are_isolated() {
        let index = AbilityIndex::build(vec![
            channel(1, 0, &["default"], &["gpt-4"]),
            channel(2, 0, &["vip"], &["gpt-4"]),
        ]);
        assert_eq!(ids(index.candidates("vip", "gpt-4")), vec![2]);
        assert!(index.candidates("other", "gpt-4").is_empty());
    }

    #[test]
    fn manually_disabled_channels_are_not_candidates() {
        let mut disabled = channel(2, 0, &["default"], &["gpt-4"]);
        disabled.status = ChannelStatus::ManuallyDisabled;
        let mut auto = channel(3, 0, &["default"], &["gpt-4"]);
        auto.status = ChannelStatus::AutoDisabled;

        let index = AbilityIndex::build(vec![channel(1, 0, &["default"], &["gpt-4"]), disabled, auto]);
        assert_eq!(ids(index.candidates("default", "gpt-4")), vec![1, 3]);
        assert!(index.channel(2).is_some());
    }

    #[test]
    fn mapping_sources_are_routable() {
        let mut ch = channel(1, 0, &["default"], &[]);
        ch.model_mapping.insert("alias".into(), "gpt-4".into());
        let index = AbilityIndex::build(vec![ch]);
        assert_eq!(ids(index.candidates("default", "alias")), vec![1]);
    }

    #[test]
    fn dated_model_falls_back_to_base_name() {
        let index = AbilityIndex::build(vec![channel(1, 0, &["default"], &["gpt-4o"])]);
        assert_eq!(ids(index.candidates("default", "gpt-4o-2024-08-06")), vec![1]);
        assert_eq!(ids(index.candidates("default", "gpt-4o-20240806")), vec![1]);
        assert!(index.candidates("default", "gpt-4o-mini").is_empty());
    }

    #[test]
    fn exact_match_wins_over_fallback() {
        let index = AbilityIndex::build(vec![
            channel(1, 0, &["default"], &["gpt-4o"]),
            channel(2, 0, &["default"], &["gpt-4o-2024-08-06"]),
        ]);
        assert_eq!(ids(index.candidates("default", "gpt-4o-2024-08-06")), vec![2]);
    }

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_model_name("claude-3-5-sonnet-20241022"), Some("claude-3-5-sonnet"));
        assert_eq!(normalize_model_name("gpt-4o-2024-08-06"), Some("gpt-4o"));
        assert_eq!(normalize_model_name("gpt-4"), None);
        assert_eq!(normalize_model_name("gpt-4-0613"), None);
        assert_eq!(normalize_model_name("-20241022"), None);
        assert_eq!(normalize_model_name("2024-08-06"), None);
    }

    #[test]
    fn with_status_rebuilds_routes() {
        let index = AbilityIndex::build(vec![
            channel(1, 0, &["default"], &["gpt-4"]),
            channel(2, 0, &["default"], &["gpt-4"]),
        ]);
        let updated = index.with_status(1, ChannelStatus::ManuallyDisabled);
        assert_eq!(ids(updated.candidates("default", "gpt-4")), vec![2]);
        assert_eq!(ids(index.candidates("default", "gpt-4")), vec![1, 2]);
        assert_eq!(
            updated.channel(1).map(|c| c.status),
            Some(ChannelStatus::ManuallyDisabled)
        );
    }

    #[test]
    fn models_listing_is_sorted() {
        let index = AbilityIndex::build(vec![channel(1, 0, &["default"], &["b", "a"])]);
        assert_eq!(index.models("default"), vec!["a", "b"]);
        assert!(index.models("none").is_empty());
    }
}
