//! Agents module - the four research roles and the turn loop that drives them.
//!
//! # Roles
//! - **Researcher**: gathers information (web_search, calculator)
//! - **Analyst**: finds patterns and quantifies them (calculator)
//! - **Writer**: turns findings into a report
//! - **Critic**: reviews the work and ends the run with `TERMINATE`
//!
//! # Design Principles
//! - Roles always speak in canonical order; routing may only drop roles
//! - The conversation is an explicit accumulator owned by one run
//! - Persistence happens through a `TurnObserver`, never inside the loop

mod context;
pub mod orchestrator;
mod prompts;
pub mod routing;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use context::AgentContext;
pub use orchestrator::{
    NoopObserver, Orchestrator, RunConfig, RunOutcome, RunStats, StopReason, Transcript, Turn,
    TurnObserver,
};
pub use routing::classify;

/// A fixed persona bound to the model gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Researcher,
    Analyst,
    Writer,
    Critic,
}

impl Role {
    /// Canonical speaking order.
    pub const ALL: [Role; 4] = [Role::Researcher, Role::Analyst, Role::Writer, Role::Critic];

    pub fn name(self) -> &'static str {
        match self {
            Self::Researcher => "Researcher",
            Self::Analyst => "Analyst",
            Self::Writer => "Writer",
            Self::Critic => "Critic",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Researcher => "Expert at research and information gathering",
            Self::Analyst => "Expert at analysis and interpretation",
            Self::Writer => "Expert at writing and documentation",
            Self::Critic => "Expert at review and quality assurance",
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::Researcher => prompts::RESEARCHER,
            Self::Analyst => prompts::ANALYST,
            Self::Writer => prompts::WRITER,
            Self::Critic => prompts::CRITIC,
        }
    }

    /// Tools this role may call.
    pub fn tool_names(self) -> &'static [&'static str] {
        match self {
            Self::Researcher => &["web_search", "calculator"],
            Self::Analyst => &["calculator"],
            Self::Writer | Self::Critic => &[],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown role '{s}'"))
    }
}

/// The roles taking part in a run, always in canonical order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleSet(Vec<Role>);

impl RoleSet {
    pub fn all() -> Self {
        Self(Role::ALL.to_vec())
    }

    /// Build a set from any roles; duplicates are dropped and order is
    /// normalised.
    pub fn from_roles<I: IntoIterator<Item = Role>>(roles: I) -> Self {
        let mut roles: Vec<Role> = roles.into_iter().collect();
        roles.sort();
        roles.dedup();
        Self(roles)
    }

    pub fn contains(&self, role: Role) -> bool {
        self.0.contains(&role)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Role] {
        &self.0
    }

    /// Role speaking at 0-based turn `turn`, cycling through the set.
    pub fn speaker(&self, turn: u32) -> Option<Role> {
        if self.0.is_empty() {
            return None;
        }
        self.0.get(turn as usize % self.0.len()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names_roundtrip() {
        for role in Role::ALL {
            assert_eq!(role.name().parse::<Role>().unwrap(), role);
        }
        assert_eq!("critic".parse::<Role>().unwrap(), Role::Critic);
        assert!("Editor".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_set_keeps_canonical_order() {
        let set = RoleSet::from_roles([Role::Critic, Role::Researcher, Role::Critic]);
        assert_eq!(set.as_slice(), &[Role::Researcher, Role::Critic]);
        assert_eq!(set.speaker(0), Some(Role::Researcher));
        assert_eq!(set.speaker(1), Some(Role::Critic));
        assert_eq!(set.speaker(2), Some(Role::Researcher));
        assert_eq!(RoleSet::from_roles([]).speaker(0), None);
    }

    #[test]
    fn test_tool_allow_lists() {
        assert_eq!(Role::Researcher.tool_names(), &["web_search", "calculator"]);
        assert_eq!(Role::Analyst.tool_names(), &["calculator"]);
        assert!(Role::Writer.tool_names().is_empty());
        assert!(Role::Critic.tool_names().is_empty());
    }
}
