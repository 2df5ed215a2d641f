//! Intent router: decides which provider kind handles a user turn.
//!
//! Rules run in priority order and the first match wins. The rationale
//! string is returned alongside the decision so callers can log it for
//! observability without the router needing to know about logging itself.

use std::sync::Arc;

use crate::security::SecurityPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Agentic,
    Conversational,
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub provider: ProviderKind,
    pub reason: String,
}

/// Keywords that suggest the user wants an action performed rather than a
/// conversational reply. Deliberately short and homelab-flavored rather than
/// an exhaustive NLP classifier — this is a heuristic, not a language
/// model.
const ACTION_KEYWORDS: &[&str] = &[
    "start", "stop", "restart", "reboot", "show", "play", "search", "status",
    "list", "check", "run",
];

/// A short follow-up turn is one unlikely to introduce a new topic on its
/// own — "yes", "do it", "confirmed", a bare vmid. Anything under this many
/// code points qualifies.
const FOLLOW_UP_MAX_LEN: usize = 20;

pub struct IntentRouter {
    policy: Arc<SecurityPolicy>,
}

impl IntentRouter {
    pub fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self { policy }
    }

    /// `previous_provider` is the provider kind the last assistant turn in
    /// this session used, if any.
    pub fn route(&self, user_turn: &str, previous_provider: Option<ProviderKind>) -> RoutingDecision {
        if !self.policy.override_key.is_empty() && user_turn.contains(self.policy.override_key.as_str()) {
            return RoutingDecision {
                provider: ProviderKind::Agentic,
                reason: "override key present".to_owned(),
            };
        }

        let lower = user_turn.to_lowercase();
        if mentions_entity(&lower) || ACTION_KEYWORDS.iter().any(|kw| contains_word(&lower, kw)) {
            return RoutingDecision {
                provider: ProviderKind::Agentic,
                reason: "action keyword or entity pattern matched".to_owned(),
            };
        }

        if previous_provider == Some(ProviderKind::Agentic) && user_turn.chars().count() <= FOLLOW_UP_MAX_LEN {
            return RoutingDecision {
                provider: ProviderKind::Agentic,
                reason: "short follow-up to an agentic turn".to_owned(),
            };
        }

        RoutingDecision {
            provider: ProviderKind::Conversational,
            reason: "no action signal; defaulting to conversational".to_owned(),
        }
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.split(|c: char| !c.is_alphanumeric()).any(|tok| tok == word)
}

/// Recognizes node-name, vmid, and URL-shaped entities that imply an
/// infrastructure action even without one of the literal action keywords,
/// e.g. "pve 105" or "http://...".
fn mentions_entity(lower: &str) -> bool {
    lower.contains("vm ")
        || lower.contains("vmid")
        || lower.contains("http://")
        || lower.contains("https://")
        || lower.split_whitespace().any(|tok| tok.chars().all(|c| c.is_ascii_digit()) && !tok.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProtectedResources;

    fn policy(override_key: &str) -> Arc<SecurityPolicy> {
        Arc::new(SecurityPolicy::new(
            ProtectedResources::default(),
            vec![],
            vec![],
            override_key.to_owned(),
            "confirmed".to_owned(),
            600,
            6000,
        ))
    }

    #[test]
    fn override_key_forces_agentic() {
        let router = IntentRouter::new(policy("jarvis-unlock"));
        let decision = router.route("jarvis-unlock delete everything", None);
        assert_eq!(decision.provider, ProviderKind::Agentic);
        assert!(decision.reason.contains("override"));
    }

    #[test]
    fn action_keyword_selects_agentic() {
        let router = IntentRouter::new(policy(""));
        let decision = router.route("stop vm 105 on pve", None);
        assert_eq!(decision.provider, ProviderKind::Agentic);
    }

    #[test]
    fn plain_chit_chat_selects_conversational() {
        let router = IntentRouter::new(policy(""));
        let decision = router.route("what time is it", None);
        assert_eq!(decision.provider, ProviderKind::Conversational);
    }

    #[test]
    fn short_follow_up_stays_agentic() {
        let router = IntentRouter::new(policy(""));
        let decision = router.route("yes confirmed", Some(ProviderKind::Agentic));
        assert_eq!(decision.provider, ProviderKind::Agentic);
        assert!(decision.reason.contains("follow-up"));
    }

    #[test]
    fn long_turn_after_agentic_does_not_stick() {
        let router = IntentRouter::new(policy(""));
        let decision = router.route(
            "tell me a long story about the history of proxmox clustering",
            Some(ProviderKind::Agentic),
        );
        assert_eq!(decision.provider, ProviderKind::Conversational);
    }
}
