use std::collections::{HashMap, HashSet};

/// Group membership state. Owned exclusively by the server's dispatcher
/// task, so it needs no synchronization of its own.
///
/// Groups and memberships only accumulate; nothing here removes them.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: HashMap<String, HashSet<String>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty group. Fails on an empty name or when the group
    /// already exists; the two cases are not distinguished.
    pub fn create_group(&mut self, group: &str) -> bool {
        if group.is_empty() || self.groups.contains_key(group) {
            return false;
        }
        self.groups.insert(group.to_string(), HashSet::new());
        true
    }

    /// Adds `user` to an existing group. Fails on empty arguments or a
    /// missing group; joining a group twice succeeds and changes nothing.
    pub fn join_group(&mut self, group: &str, user: &str) -> bool {
        if group.is_empty() || user.is_empty() {
            return false;
        }
        match self.groups.get_mut(group) {
            Some(members) => {
                members.insert(user.to_string());
                true
            }
            None => false,
        }
    }

    pub fn is_member(&self, group: &str, user: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|members| members.contains(user))
    }

    pub fn group_exists(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_join() {
        let mut registry = GroupRegistry::new();
        assert!(registry.create_group("room"));
        assert!(registry.group_exists("room"));
        assert!(!registry.is_member("room", "alice"));

        assert!(registry.join_group("room", "alice"));
        assert!(registry.is_member("room", "alice"));
    }

    #[test]
    fn create_rejects_empty_and_duplicate_names() {
        let mut registry = GroupRegistry::new();
        assert!(!registry.create_group(""));
        assert!(registry.create_group("room"));
        assert!(!registry.create_group("room"));
        // The failed duplicate leaves the original group intact.
        assert!(registry.group_exists("room"));
    }

    #[test]
    fn join_rejects_empty_args_and_missing_group() {
        let mut registry = GroupRegistry::new();
        registry.create_group("room");

        assert!(!registry.join_group("", "alice"));
        assert!(!registry.join_group("room", ""));
        assert!(!registry.join_group("other", "alice"));
        assert!(!registry.is_member("room", "alice"));
    }

    #[test]
    fn join_is_idempotent() {
        let mut registry = GroupRegistry::new();
        registry.create_group("room");

        assert!(registry.join_group("room", "alice"));
        assert!(registry.join_group("room", "alice"));
        assert!(registry.is_member("room", "alice"));
    }

    #[test]
    fn membership_is_per_group() {
        let mut registry = GroupRegistry::new();
        registry.create_group("red");
        registry.create_group("blue");
        registry.join_group("red", "alice");

        assert!(registry.is_member("red", "alice"));
        assert!(!registry.is_member("blue", "alice"));
        assert!(!registry.is_member("green", "alice"));
    }
}
