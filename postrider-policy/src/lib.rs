//! Queue policies: synchronous envelope transformations run in order
//! before a message is persisted. A policy may mutate the envelope in
//! place, replace it with several envelopes, or reject it outright with
//! an SMTP reply.

#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod forward;
pub mod headers;
pub mod split;

use postrider_common::{Envelope, Reply};
use thiserror::Error;

pub use forward::Forward;
pub use headers::{AddDateHeader, AddMessageIdHeader, AddReceivedHeader};
pub use split::{RecipientDomainSplit, RecipientSplit};

/// Rejection raised by a policy; the edge turns the reply into the
/// response for the DATA terminator.
#[derive(Debug, Error)]
#[error("rejected by policy: {reply}")]
pub struct PolicyReject {
    pub reply: Reply,
}

impl PolicyReject {
    #[must_use]
    pub fn new(reply: Reply) -> Self {
        Self { reply }
    }
}

/// Outcome of applying one policy to one envelope.
#[derive(Debug)]
pub enum PolicyAction {
    /// The envelope (possibly mutated in place) continues on its own.
    Keep,
    /// The envelope is replaced by these envelopes; each continues
    /// through the remaining policies independently.
    Split(Vec<Envelope>),
}

/// A pre-queue policy. Implementations must be cheap and synchronous;
/// they run inline on the enqueue path.
pub trait QueuePolicy: Send + Sync + std::fmt::Debug {
    fn apply(&self, envelope: &mut Envelope) -> Result<PolicyAction, PolicyReject>;
}

/// Run `policies` in order over `envelope`, expanding splits as the
/// original does: a replacement envelope resumes at the next policy, not
/// the first.
pub fn run_policies(
    policies: &[Box<dyn QueuePolicy>],
    envelope: Envelope,
) -> Result<Vec<Envelope>, PolicyReject> {
    fn recurse(
        policies: &[Box<dyn QueuePolicy>],
        mut envelope: Envelope,
        index: usize,
        out: &mut Vec<Envelope>,
    ) -> Result<(), PolicyReject> {
        let Some(policy) = policies.get(index) else {
            out.push(envelope);
            return Ok(());
        };
        match policy.apply(&mut envelope)? {
            PolicyAction::Keep => recurse(policies, envelope, index + 1, out),
            PolicyAction::Split(replacements) => {
                for replacement in replacements {
                    recurse(policies, replacement, index + 1, out)?;
                }
                Ok(())
            }
        }
    }

    let mut out = Vec::new();
    recurse(policies, envelope, 0, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use postrider_common::{Envelope, Mailbox, Reply};

    use super::{PolicyAction, PolicyReject, QueuePolicy, run_policies};

    #[derive(Debug)]
    struct Tag(&'static str);

    impl QueuePolicy for Tag {
        fn apply(&self, envelope: &mut Envelope) -> Result<PolicyAction, PolicyReject> {
            envelope.append_header("X-Tag", self.0);
            Ok(PolicyAction::Keep)
        }
    }

    #[derive(Debug)]
    struct SplitPerRecipient;

    impl QueuePolicy for SplitPerRecipient {
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

    #[derive(Debug)]
    struct RejectAll;

    impl QueuePolicy for RejectAll {
        fn apply(&self, _envelope: &mut Envelope) -> Result<PolicyAction, PolicyReject> {
            Err(PolicyReject::new(Reply::new(550, "5.7.1 Not today")))
        }
    }

    fn envelope_with(rcpts: &[&str]) -> Envelope {
        let mut env = Envelope::default();
        env.recipients = rcpts.iter().map(|r| Mailbox::parse(r).unwrap()).collect();
        env
    }

    #[test]
    fn policies_apply_in_order() {
        let policies: Vec<Box<dyn QueuePolicy>> = vec![Box::new(Tag("one")), Box::new(Tag("two"))];
        let out = run_policies(&policies, envelope_with(&["a@x.example"])).unwrap();
        assert_eq!(out.len(), 1);
        let names: Vec<&str> = out[0].headers.iter().map(|h| h.text()).collect();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[test]
    fn split_children_resume_at_next_policy() {
        let policies: Vec<Box<dyn QueuePolicy>> = vec![
            Box::new(Tag("before")),
            Box::new(SplitPerRecipient),
            Box::new(Tag("after")),
        ];
        let out = run_policies(
            &policies,
            envelope_with(&["a@x.example", "b@y.example"]),
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        for env in &out {
            let tags: Vec<&str> = env.headers.iter().map(|h| h.text()).collect();
            // "before" applied once, split, then only "after" for children.
            assert_eq!(tags, vec!["before", "after"]);
            assert_eq!(env.recipients.len(), 1);
        }
    }

    #[test]
    fn rejection_propagates() {
        let policies: Vec<Box<dyn QueuePolicy>> = vec![Box::new(RejectAll)];
        let err = run_policies(&policies, envelope_with(&["a@x.example"])).unwrap_err();
        assert_eq!(err.reply.code(), 550);
    }
}
