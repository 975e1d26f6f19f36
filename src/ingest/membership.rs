use std::collections::BTreeMap;

/// Topic → pipeline mapping with a version bumped on every change.
#[derive(Debug, Default)]
pub(crate) struct Membership {
    topics: BTreeMap<String, String>,
    version: u64,
}

impl Membership {
    pub(crate) fn add(&mut self, topic: &str, pipeline_id: &str) -> bool {
        let previous = self.topics.insert(topic.to_string(), pipeline_id.to_string());
        let changed = previous.as_deref() != Some(pipeline_id);
        if changed {
            self.version += 1;
        }
        changed
    }

    pub(crate) fn remove(&mut self, topic: &str) -> bool {
        let removed = self.topics.remove(topic).is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Exact topic first, then any mapped topic sharing the text before the first `.`.
    pub(crate) fn resolve(&self, topic: &str) -> Option<String> {
        if let Some(pipeline) = self.topics.get(topic) {
            return Some(pipeline.clone());
        }
        let prefix = prefix_of(topic);
        self.topics
            .iter()
            .find(|(mapped, _)| prefix_of(mapped) == prefix)
            .map(|(_, pipeline)| pipeline.clone())
    }
}

fn prefix_of(topic: &str) -> &str {
    topic.split('.').next().unwrap_or(topic)
}
