//! Policies that partition an envelope's recipient list.

use postrider_common::Envelope;

use crate::{PolicyAction, PolicyReject, QueuePolicy};

/// Replaces a multi-recipient envelope with one envelope per recipient.
/// Each copy gets its own header block; single-recipient envelopes pass
/// through untouched.
#[derive(Debug, Default)]
pub struct RecipientSplit;

impl RecipientSplit {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl QueuePolicy for RecipientSplit {
    fn apply(&self, envelope: &mut Envelope) -> Result<PolicyAction, PolicyReject> {
        if envelope.recipients.len() <= 1 {
            return Ok(PolicyAction::Keep);
        }
        let copies = envelope
            .recipients
            .iter()
            .map(|rcpt| envelope.copy_with_recipients(vec![rcpt.clone()]))
            .collect();
        Ok(PolicyAction::Split(copies))
    }
}

/// Replaces an envelope whose recipients span several domains with one
/// envelope per unique domain (case-insensitive), preserving recipient
/// order within each group.
#[derive(Debug, Default)]
pub struct RecipientDomainSplit;

impl RecipientDomainSplit {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl QueuePolicy for RecipientDomainSplit {
    fn apply(&self, envelope: &mut Envelope) -> Result<PolicyAction, PolicyReject> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, rcpt) in envelope.recipients.iter().enumerate() {
            let domain = rcpt.domain();
            match groups.iter_mut().find(|(d, _)| *d == domain) {
                Some((_, indexes)) => indexes.push(index),
                None => groups.push((domain, vec![index])),
            }
        }
        if groups.len() <= 1 {
            return Ok(PolicyAction::Keep);
        }
        let copies = groups
            .into_iter()
            .map(|(_, indexes)| envelope.narrowed(&indexes))
            .collect();
        Ok(PolicyAction::Split(copies))
    }
}

#[cfg(test)]
mod tests {
    use postrider_common::{Envelope, Mailbox};

    use super::{RecipientDomainSplit, RecipientSplit};
    use crate::{PolicyAction, QueuePolicy};

    fn envelope_with(rcpts: &[&str]) -> Envelope {
        let mut env = Envelope::default();
        env.recipients = rcpts.iter().map(|r| Mailbox::parse(r).unwrap()).collect();
        env.body = b"shared body".to_vec();
        env
    }

    #[test]
    fn recipient_split_forks_per_recipient() {
        let mut env = envelope_with(&["a@x.example", "b@x.example", "c@y.example"]);
        let PolicyAction::Split(copies) = RecipientSplit::new().apply(&mut env).unwrap() else {
            panic!("expected a split");
        };
        assert_eq!(copies.len(), 3);
        for copy in &copies {
            assert_eq!(copy.recipients.len(), 1);
            assert_eq!(copy.body, b"shared body");
        }
    }

    #[test]
    fn recipient_split_keeps_single_recipient() {
        let mut env = envelope_with(&["a@x.example"]);
        assert!(matches!(
            RecipientSplit::new().apply(&mut env).unwrap(),
            PolicyAction::Keep
        ));
    }

    #[test]
    fn domain_split_groups_case_insensitively() {
        let mut env = envelope_with(&["a@X.example", "b@y.example", "c@x.EXAMPLE"]);
        let PolicyAction::Split(copies) =
            RecipientDomainSplit::new().apply(&mut env).unwrap()
        else {
            panic!("expected a split");
        };
        assert_eq!(copies.len(), 2);
        assert_eq!(
            copies[0]
                .recipients
                .iter()
                .map(|r| r.as_str())
                .collect::<Vec<_>>(),
            vec!["a@X.example", "c@x.EXAMPLE"]
        );
        assert_eq!(copies[1].recipients[0].as_str(), "b@y.example");
    }

    #[test]
    fn domain_split_keeps_single_domain() {
        let mut env = envelope_with(&["a@x.example", "b@x.example"]);
        assert!(matches!(
            RecipientDomainSplit::new().apply(&mut env).unwrap(),
            PolicyAction::Keep
        ));
    }
}
