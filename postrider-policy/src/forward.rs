//! Recipient rewriting by ordered regex substitution.

use postrider_common::Mailbox;
use regex::Regex;
use tracing::warn;

use crate::{PolicyAction, PolicyReject, QueuePolicy};

/// Rewrites each recipient through an ordered list of regex mappings.
/// The first rule that matches a recipient wins; recipients matching no
/// rule pass through unchanged.
#[derive(Debug, Default)]
pub struct Forward {
    mapping: Vec<(Regex, String)>,
}

impl Forward {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapping rule. `replacement` may use capture references as
    /// accepted by [`Regex::replace`].
    #[must_use]
    pub fn with_mapping(mut self, pattern: Regex, replacement: impl Into<String>) -> Self {
        self.mapping.push((pattern, replacement.into()));
        self
    }

    pub fn add_mapping(&mut self, pattern: Regex, replacement: impl Into<String>) {
        self.mapping.push((pattern, replacement.into()));
    }
}

impl QueuePolicy for Forward {
    fn apply(
        &self,
        envelope: &mut postrider_common::Envelope,
    ) -> Result<PolicyAction, PolicyReject> {
        for recipient in &mut envelope.recipients {
            for (pattern, replacement) in &self.mapping {
                if !pattern.is_match(recipient.as_str()) {
                    continue;
                }
                let rewritten = pattern
                    .replace_all(recipient.as_str(), replacement.as_str())
                    .into_owned();
                match Mailbox::parse(&rewritten) {
                    Ok(mailbox) => *recipient = mailbox,
                    Err(err) => {
                        // A rule that produces garbage keeps the original
                        // recipient rather than poisoning the envelope.
                        warn!(original = %recipient, %rewritten, %err, "forward rule produced an invalid address");
                    }
                }
                break;
            }
        }
        Ok(PolicyAction::Keep)
    }
}

#[cfg(test)]
mod tests {
    use postrider_common::{Envelope, Mailbox};
    use regex::Regex;

    use super::Forward;
    use crate::QueuePolicy;

    fn envelope_with(rcpts: &[&str]) -> Envelope {
        let mut env = Envelope::default();
        env.recipients = rcpts.iter().map(|r| Mailbox::parse(r).unwrap()).collect();
        env
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = Forward::new()
            .with_mapping(Regex::new("@old.example$").unwrap(), "@new.example")
            .with_mapping(Regex::new("@old.example$").unwrap(), "@other.example");
        let mut env = envelope_with(&["user@old.example"]);
        policy.apply(&mut env).unwrap();
        assert_eq!(env.recipients[0].as_str(), "user@new.example");
    }

    #[test]
    fn unmatched_recipients_pass_through() {
        let policy =
            Forward::new().with_mapping(Regex::new("@old.example$").unwrap(), "@new.example");
        let mut env = envelope_with(&["user@stable.example"]);
        policy.apply(&mut env).unwrap();
        assert_eq!(env.recipients[0].as_str(), "user@stable.example");
    }

    #[test]
    fn capture_groups_are_substituted() {
        let policy = Forward::new().with_mapping(
            Regex::new("^([^@]+)@example.com$").unwrap(),
            "$1@mail.example.com",
        );
        let mut env = envelope_with(&["alice@example.com", "bob@example.org"]);
        policy.apply(&mut env).unwrap();
        assert_eq!(env.recipients[0].as_str(), "alice@mail.example.com");
        assert_eq!(env.recipients[1].as_str(), "bob@example.org");
    }

    #[test]
    fn invalid_rewrite_keeps_original() {
        let policy = Forward::new().with_mapping(Regex::new("^.*$").unwrap(), "not-an-address");
        let mut env = envelope_with(&["user@example.com"]);
        policy.apply(&mut env).unwrap();
        assert_eq!(env.recipients[0].as_str(), "user@example.com");
    }
}
