//! Process-wide allow-list of runnable programs.
//!
//! Set once at server start and shared read-only by every session. An empty
//! list means no restriction. Matching is an exact comparison against
//! `argv[0]`: `/bin/ls` and `ls` are different entries.

use hrun_core::{HrunError, HrunResult};
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct AllowList {
    /// Entries in configuration order (for logging).
    commands: Vec<String>,
    /// Pre-computed lookup set.
    lookup: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered = Vec::new();
        let mut lookup = HashSet::new();
        for command in commands {
            let command = command.into();
            if lookup.insert(command.clone()) {
                ordered.push(command);
            }
        }
        Self {
            commands: ordered,
            lookup,
        }
    }

    /// An allow-list that permits every program.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_restricted(&self) -> bool {
        !self.commands.is_empty()
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn is_allowed(&self, program: &str) -> bool {
        !self.is_restricted() || self.lookup.contains(program)
    }

    /// Check `program`, returning `CommandNotAllowed` on a miss.
    pub fn check(&self, program: &str) -> HrunResult<()> {
        if self.is_allowed(program) {
            Ok(())
        } else {
            warn!(program = %program, "command not in allow-list");
            Err(HrunError::CommandNotAllowed(program.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_everything() {
        let list = AllowList::unrestricted();
        assert!(!list.is_restricted());
        assert!(list.check("rm").is_ok());
    }

    #[test]
    fn exact_match_only() {
        let list = AllowList::new(["ls", "cat"]);
        assert!(list.check("ls").is_ok());
        assert!(list.check("cat").is_ok());
        assert!(matches!(
            list.check("rm"),
            Err(HrunError::CommandNotAllowed(p)) if p == "rm"
        ));
        assert!(list.check("/bin/ls").is_err());
        assert!(list.check("ls ").is_err());
        assert!(list.check("LS").is_err());
    }

    #[test]
    fn keeps_order_and_drops_duplicates() {
        let list = AllowList::new(vec!["vim".to_string(), "ls".to_string(), "vim".to_string()]);
        assert_eq!(list.commands(), &["vim".to_string(), "ls".to_string()]);
    }
}
