// src/task/resources.rs

//! Admission-control table of resource keys held by running tasks

use std::collections::HashMap;

/// Sentinel key conflicting with every local-repo resource
pub const ALL_LOCAL_REPOS_RESOURCES_KEY: &str = "__alllocalrepos__";

/// Sentinel key conflicting with every resource
pub const ALL_RESOURCES_KEY: &str = "__all__";

/// Tag carried by every local-repo resource key
const LOCAL_REPO_TAG: char = 'L';

fn is_local_repo_key(key: &str) -> bool {
    key.starts_with(LOCAL_REPO_TAG)
}

/// Which task currently holds each resource key
///
/// The table never blocks: the owning scheduler guards it with its own lock
/// and consults it on submission and on every completion.
#[derive(Debug, Default)]
pub struct ResourcesSet {
    set: HashMap<String, u64>,
}

impl ResourcesSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `resources` for `task_id`
    pub fn mark_in_use(&mut self, resources: &[String], task_id: u64) {
        for resource in resources {
            self.set.insert(resource.clone(), task_id);
        }
    }

    /// Distinct ids of the tasks holding anything that conflicts with `resources`
    ///
    /// Sentinels work in both directions: requesting `__all__` conflicts with
    /// every holder, and a held `__all__` conflicts with every request; the
    /// local-repo sentinel does the same for keys tagged `L`.
    pub fn used_by(&self, resources: &[String]) -> Vec<u64> {
        let mut tasks = Vec::new();
        let mut push = |task_id: u64| {
            if !tasks.contains(&task_id) {
                tasks.push(task_id);
            }
        };

        for resource in resources {
            if resource == ALL_RESOURCES_KEY {
                self.set.values().for_each(|&id| push(id));
                break;
            }

            if resource == ALL_LOCAL_REPOS_RESOURCES_KEY {
                for (held, &id) in &self.set {
                    if is_local_repo_key(held) || held == ALL_LOCAL_REPOS_RESOURCES_KEY {
                        push(id);
                    }
                }
            } else if let Some(&id) = self.set.get(resource) {
                push(id);
            }

            if is_local_repo_key(resource) {
                if let Some(&id) = self.set.get(ALL_LOCAL_REPOS_RESOURCES_KEY) {
                    push(id);
                }
            }
            if let Some(&id) = self.set.get(ALL_RESOURCES_KEY) {
                push(id);
            }
        }

        tasks
    }

    /// Release `resources`
    pub fn free(&mut self, resources: &[String]) {
        for resource in resources {
            self.set.remove(resource);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_disjoint_keys_do_not_conflict() {
        let mut set = ResourcesSet::new();
        set.mark_in_use(&keys(&["Lrepo1", "Ssnap"]), 1);

        assert!(set.used_by(&keys(&["Lrepo2"])).is_empty());
        assert_eq!(set.used_by(&keys(&["Ssnap", "Lrepo1"])), vec![1]);
    }

    #[test]
    fn test_local_repos_sentinel() {
        let mut set = ResourcesSet::new();
        set.mark_in_use(&keys(&["Lrepo1"]), 1);
        set.mark_in_use(&keys(&["Ssnap"]), 2);

        assert_eq!(set.used_by(&keys(&[ALL_LOCAL_REPOS_RESOURCES_KEY])), vec![1]);

        let mut held = ResourcesSet::new();
        held.mark_in_use(&keys(&[ALL_LOCAL_REPOS_RESOURCES_KEY]), 5);
        assert_eq!(held.used_by(&keys(&["Lother"])), vec![5]);
        assert!(held.used_by(&keys(&["Rmirror"])).is_empty());
    }

    #[test]
    fn test_global_sentinel() {
        let mut set = ResourcesSet::new();
        set.mark_in_use(&keys(&["Lrepo1"]), 1);
        set.mark_in_use(&keys(&["Rmirror"]), 2);

        let mut holders = set.used_by(&keys(&[ALL_RESOURCES_KEY]));
        holders.sort();
        assert_eq!(holders, vec![1, 2]);

        let mut held = ResourcesSet::new();
        held.mark_in_use(&keys(&[ALL_RESOURCES_KEY]), 9);
        assert_eq!(held.used_by(&keys(&["anything"])), vec![9]);
    }

    #[test]
    fn test_free_releases_keys() {
        let mut set = ResourcesSet::new();
        let resources = keys(&["Lrepo1", "prefix:fs:."]);
        set.mark_in_use(&resources, 1);
        set.free(&resources);

        assert!(set.is_empty());
        assert!(set.used_by(&resources).is_empty());
    }
}
