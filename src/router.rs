//! Maps hook categories to their collection

use crate::shard::Collection;

/// Semantic category of a hook call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// `after_story_complete`
    KnowledgeCapture,

    /// `store_best_practice`
    BestPractice,

    /// `store_chat_decision`
    ChatDecision,

    /// `before_story_start`
    StoryContext,

    /// `after_architecture_decision` and `before_architecture_decision`
    ArchitectureDecision,

    /// `after_bug_fix`
    BugFix,
}

/// Collection a hook reads from or writes to
pub fn route(kind: HookKind) -> Collection {
    match kind {
        HookKind::KnowledgeCapture | HookKind::ArchitectureDecision | HookKind::BugFix => {
            Collection::Knowledge
        }
        HookKind::BestPractice => Collection::BestPractices,
        HookKind::ChatDecision | HookKind::StoryContext => Collection::AgentMemory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_are_fixed() {
        assert_eq!(route(HookKind::KnowledgeCapture), Collection::Knowledge);
        assert_eq!(route(HookKind::BestPractice), Collection::BestPractices);
        assert_eq!(route(HookKind::ChatDecision), Collection::AgentMemory);
        assert_eq!(route(HookKind::StoryContext), Collection::AgentMemory);
        assert_eq!(route(HookKind::ArchitectureDecision), Collection::Knowledge);
        assert_eq!(route(HookKind::BugFix), Collection::Knowledge);
    }
}
