//! Task classification for dynamic routing.

use super::{Role, RoleSet};

const ANALYSIS_KEYWORDS: [&str; 8] = [
    "analyze",
    "analysis",
    "trend",
    "pattern",
    "data",
    "statistics",
    "compare",
    "calculate",
];

const CALCULATION_WORDS: [&str; 3] = ["calculate", "compute", "what is"];

/// Decide which roles a task needs.
///
/// Researcher and Critic always run. Analyst joins when the text asks for
/// analysis; Writer is dropped only for a bare arithmetic question.
pub fn classify(text: &str) -> RoleSet {
    let lower = text.to_lowercase();
    let mut roles = vec![Role::Researcher, Role::Critic];

    if ANALYSIS_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        roles.push(Role::Analyst);
    }
    // A bare arithmetic question has no findings to write up. The Critic
    // checks the computed answer directly, so the Writer turn is skipped.
    if !is_pure_calculation(&lower) {
        roles.push(Role::Writer);
    }
    RoleSet::from_roles(roles)
}

/// Only numbers, operators and a leading "calculate"/"compute"/"what is".
fn is_pure_calculation(lower: &str) -> bool {
    let mut rest = lower.to_string();
    for word in CALCULATION_WORDS {
        rest = rest.replace(word, " ");
    }
    let has_digit = rest.chars().any(|c| c.is_ascii_digit());
    has_digit
        && rest.chars().all(|c| {
            c.is_ascii_digit() || c.is_whitespace() || "+-*/%^().,?=:".contains(c)
        })
}
