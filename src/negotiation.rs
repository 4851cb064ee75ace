//! Per-link format negotiation.
//!
//! A link fixes no format when it is made; the first push (or an explicit
//! [`Link::negotiate`](crate::stage::pad::Link::negotiate)) runs this
//! protocol:
//!
//! 1. Start from the intersection of both pads' template caps. Empty
//!    means the link should never have been made and negotiation fails.
//! 2. Each round, the upstream side proposes the deterministic fixation
//!    of the current caps (first clause, each field fixated).
//! 3. Downstream either accepts the proposal
//!    ([`Stage::set_format`](crate::stage::Stage::set_format) returns
//!    true), or counter-proposes via
//!    [`Stage::propose_format`](crate::stage::Stage::propose_format).
//!    A counter-proposal must be a non-empty subset of the round's caps;
//!    widening is a protocol violation and fails immediately.
//! 4. After [`MAX_NEGOTIATION_ROUNDS`] rounds without agreement the
//!    negotiation fails. Ping-pong cannot happen: caps shrink every
//!    round.
//!
//! The agreed caps are fixed, recorded on both pads, and attached to
//! every buffer crossing the link that carries no caps of its own.

use crate::caps::Caps;
use crate::error::NegotiationError;
use crate::stage::pad::Pad;
use std::sync::Arc;

/// Upper bound on proposal/counter-proposal rounds per negotiation.
pub const MAX_NEGOTIATION_ROUNDS: usize = 3;

/// Run the negotiation protocol on the link between `src` and `sink`.
///
/// On success the agreed caps are recorded on both pads and returned.
/// The downstream stage's callbacks drive acceptance; a pad without an
/// owning stage accepts the first proposal.
pub fn negotiate(src: &Arc<Pad>, sink: &Arc<Pad>) -> Result<Arc<Caps>, NegotiationError> {
    let mut current = src.template_caps().intersect(sink.template_caps());
    if current.is_empty() {
        return Err(NegotiationError::NoCommonFormat {
            src: src.full_name(),
            sink: sink.full_name(),
            explanation: format!(
                "templates {} and {} do not intersect",
                src.template_caps(),
                sink.template_caps()
            ),
        });
    }

    let sink_owner = sink.owner();
    for round in 1..=MAX_NEGOTIATION_ROUNDS {
        // A fully unconstrained link stays unconstrained: buffers carry
        // their own format across it.
        let proposal = if current.is_any() {
            Caps::any()
        } else {
            current
                .fixate_caps()
                .ok_or_else(|| NegotiationError::CannotFixate {
                    src: src.full_name(),
                    sink: sink.full_name(),
                    reason: "no clauses left to fixate".into(),
                })?
        };
        tracing::debug!(
            src = %src.full_name(),
            sink = %sink.full_name(),
            round,
            %proposal,
            "proposing format"
        );

        let accepted = match &sink_owner {
            Some(node) => node.accepts_format(sink.name(), &proposal),
            None => true,
        };
        if accepted {
            let caps = Arc::new(proposal);
            src.set_negotiated_caps(Some(caps.clone()));
            sink.set_negotiated_caps(Some(caps.clone()));
            tracing::debug!(
                src = %src.full_name(),
                sink = %sink.full_name(),
                caps = %caps,
                round,
                "format agreed"
            );
            return Ok(caps);
        }

        let counter = sink_owner
            .as_ref()
            .and_then(|node| node.counter_format(sink.name(), &current));
        match counter {
            None => {
                return Err(NegotiationError::NoCommonFormat {
                    src: src.full_name(),
                    sink: sink.full_name(),
                    explanation: format!("downstream rejected {proposal} with no counter-proposal"),
                });
            }
            Some(counter) => {
                if counter.is_empty() {
                    return Err(NegotiationError::NoCommonFormat {
                        src: src.full_name(),
                        sink: sink.full_name(),
                        explanation: "downstream countered with empty caps".into(),
                    });
                }
                if !counter.is_subset(&current) {
                    return Err(NegotiationError::WidenedCounterProposal {
                        sink: sink.full_name(),
                    });
                }
                tracing::debug!(
                    sink = %sink.full_name(),
                    round,
                    counter = %counter,
                    "counter-proposal"
                );
                current = counter;
            }
        }
    }

    Err(NegotiationError::NoConvergence {
        src: src.full_name(),
        sink: sink.full_name(),
        rounds: MAX_NEGOTIATION_ROUNDS,
    })
}
