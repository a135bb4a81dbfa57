use std::collections::HashSet;

use super::ParticipantMetadata;

/// Decides whether a participant is the voice agent.
///
/// Must tolerate missing metadata: anything it cannot recognise is not the agent.
pub trait AgentIdentity: Send + Sync {
    fn is_agent(&self, participant: &ParticipantMetadata) -> bool;
}

impl<F> AgentIdentity for F
where
    F: Fn(&ParticipantMetadata) -> bool + Send + Sync,
{
    fn is_agent(&self, participant: &ParticipantMetadata) -> bool {
        self(participant)
    }
}

/// Matches the agent by the user name it joins with.
#[derive(Debug, Clone)]
pub struct UserNameMatcher {
    names: HashSet<String>,
}

impl UserNameMatcher {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for UserNameMatcher {
    fn default() -> Self {
        Self::new(["Chatbot"])
    }
}

impl AgentIdentity for UserNameMatcher {
    fn is_agent(&self, participant: &ParticipantMetadata) -> bool {
        participant
            .user_name
            .as_deref()
            .is_some_and(|name| self.names.contains(name))
    }
}

/// Matches the agent by a boolean flag in the participant's `user_data`.
#[derive(Debug, Clone)]
pub struct UserDataFlag {
    key: String,
}

impl UserDataFlag {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl AgentIdentity for UserDataFlag {
    fn is_agent(&self, participant: &ParticipantMetadata) -> bool {
        participant
            .user_data
            .as_ref()
            .and_then(|data| data.get(&self.key))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn named(name: Option<&str>) -> ParticipantMetadata {
        ParticipantMetadata {
            session_id: "p1".into(),
            user_name: name.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn name_matcher_defaults_to_chatbot() {
        let matcher = UserNameMatcher::default();
        assert!(matcher.is_agent(&named(Some("Chatbot"))));
        assert!(!matcher.is_agent(&named(Some("chatbot"))));
        assert!(!matcher.is_agent(&named(None)));
    }

    #[test]
    fn data_flag_ignores_missing_or_non_bool_values() {
        let flag = UserDataFlag::new("ai");
        let mut meta = named(None);
        assert!(!flag.is_agent(&meta));

        meta.user_data = Some(json!({"ai": "yes"}));
        assert!(!flag.is_agent(&meta));

        meta.user_data = Some(json!({"ai": true}));
        assert!(flag.is_agent(&meta));
    }

    #[test]
    fn closures_are_predicates() {
        let by_id = |p: &ParticipantMetadata| p.user_id.as_deref() == Some("agent-1");
        let mut meta = named(None);
        assert!(!by_id.is_agent(&meta));
        meta.user_id = Some("agent-1".into());
        assert!(by_id.is_agent(&meta));
    }
}
