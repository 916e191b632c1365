use crate::models::Monitor;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// An immutable snapshot of the configured monitor fleet. Reload builds a
/// fresh set and swaps it in whole, so readers never observe a torn set.
pub struct MonitorSet {
    monitors: Vec<Arc<Monitor>>,
    by_name: HashMap<String, Arc<Monitor>>,
    groups: Vec<String>,
}

impl MonitorSet {
    pub fn new(monitors: Vec<Monitor>) -> MonitorSet {
        let monitors: Vec<Arc<Monitor>> = monitors.into_iter().map(Arc::new).collect();
        let by_name = monitors
            .iter()
            .map(|m| (m.name.clone(), m.clone()))
            .collect();
        let mut groups = Vec::new();
        for monitor in &monitors {
            if !groups.contains(&monitor.group) {
                groups.push(monitor.group.clone());
            }
        }
        MonitorSet {
            monitors,
            by_name,
            groups,
        }
    }

    pub fn empty() -> MonitorSet {
        MonitorSet::new(Vec::new())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Monitor>> {
        self.monitors.iter()
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Monitor>> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Group names in configuration order.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn group_members(&self, group: &str) -> Vec<&Arc<Monitor>> {
        self.monitors.iter().filter(|m| m.group == group).collect()
    }
}

/// Owner of the monitor set. Reads clone the current `Arc` and are never
/// blocked by a reload in progress.
pub struct MonitorManager {
    inner: RwLock<Arc<MonitorSet>>,
}

impl MonitorManager {
    pub fn new(set: MonitorSet) -> MonitorManager {
        MonitorManager {
            inner: RwLock::new(Arc::new(set)),
        }
    }

    pub fn current(&self) -> Arc<MonitorSet> {
        self.inner.read().unwrap().clone()
    }

    /// Atomically replace the whole monitor set.
    pub fn replace(&self, set: MonitorSet) {
        *self.inner.write().unwrap() = Arc::new(set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::monitor;
    use crate::models::MonitorKind;

    fn named(name: &str, group: &str) -> Monitor {
        let mut m = monitor(MonitorKind::Tcp, name);
        m.group = group.to_string();
        m
    }

    #[test]
    fn lookups_and_groups() {
        let set = MonitorSet::new(vec![
            named("a", "core"),
            named("b", "core"),
            named("c", "edge"),
        ]);
        assert_eq!(set.len(), 3);
        assert!(set.contains("b"));
        assert!(set.get("missing").is_none());
        assert_eq!(set.groups(), &["core".to_string(), "edge".to_string()]);
        assert_eq!(set.group_members("core").len(), 2);
    }

    #[test]
    fn replace_swaps_atomically_for_existing_readers() {
        let manager = MonitorManager::new(MonitorSet::new(vec![named("a", "core")]));
        let before = manager.current();

        manager.replace(MonitorSet::new(vec![named("b", "core")]));

        // the old snapshot is untouched, the new one is visible
        assert!(before.contains("a"));
        assert!(!manager.current().contains("a"));
        assert!(manager.current().contains("b"));
    }
}
