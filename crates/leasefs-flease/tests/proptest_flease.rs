//! Property-based tests for leasefs-flease using proptest.

use leasefs_flease::comm::Outbox;
use leasefs_flease::{
    CellId, FleaseAcceptor, FleaseConfig, FleaseMessage, MessageKind, ProposalNumber,
};
use proptest::prelude::*;

const NOW: i64 = 1_700_000_000_000;

/// Generator for non-empty ballots.
fn any_ballot() -> impl Strategy<Value = ProposalNumber> {
    (1i64..1_000_000, 1i32..64).prop_map(|(seq, sender)| ProposalNumber::new(seq, sender))
}

/// Generator for arbitrary messages as they appear on the wire.
fn any_message() -> impl Strategy<Value = FleaseMessage> {
    (
        0u8..12,
        proptest::collection::vec(any::<u8>(), 0..64),
        any_ballot(),
        any_ballot(),
        proptest::option::of("[a-z0-9.:-]{1,24}"),
        any::<i64>(),
        any::<i64>(),
        any::<i32>(),
        any::<i64>(),
    )
        .prop_map(
            |(kind, cell, ballot, prev, holder, timeout, ts, view, epoch)| {
                let mut msg = FleaseMessage::new(
                    MessageKind::from_ordinal(kind).unwrap(),
                    CellId::new(cell),
                );
                msg.proposal_no = ballot;
                msg.prev_proposal_no = prev;
                msg.lease_holder = holder;
                msg.lease_timeout_ms = timeout;
                msg.send_timestamp_ms = ts;
                msg.view_id = view;
                msg.master_epoch = epoch;
                msg
            },
        )
}

proptest! {
    /// Encoding then decoding any message reproduces it exactly.
    #[test]
    fn test_message_codec_roundtrip(msg in any_message()) {
        let bytes = msg.to_bytes();
        prop_assert_eq!(bytes.len(), msg.encoded_len());
        prop_assert_eq!(FleaseMessage::decode(&bytes).unwrap(), msg);
    }

    /// Any strict prefix of an encoding is rejected, never misread.
    #[test]
    fn test_truncated_message_rejected(msg in any_message(), cut in 0usize..256) {
        let bytes = msg.to_bytes();
        let cut = cut % bytes.len();
        prop_assert!(FleaseMessage::decode(&bytes[..cut]).is_err());
    }

    /// Ballot ordering is total and consistent with before/after.
    #[test]
    fn test_ballot_order_is_total(a in any_ballot(), b in any_ballot()) {
        prop_assert_eq!(a.before(&b), b.after(&a));
        prop_assert_eq!(a == b, !a.before(&b) && !a.after(&b));
        prop_assert!(ProposalNumber::EMPTY.before(&a));
    }

    /// Once an acceptor promised a ballot, every older PREPARE or ACCEPT is rejected.
    #[test]
    fn test_acceptor_rejects_older_ballots(
        ballots in proptest::collection::vec(any_ballot(), 1..20),
        accept_mask in proptest::collection::vec(any::<bool>(), 20),
    ) {
        let mut acceptor = FleaseAcceptor::new(FleaseConfig::new("acc"));
        let mut outbox = Outbox::new();
        let mut highest = ProposalNumber::EMPTY;
        for (ballot, accept) in ballots.into_iter().zip(accept_mask) {
            let kind = if accept { MessageKind::Accept } else { MessageKind::Prepare };
            let mut msg = FleaseMessage::new(kind, CellId::from("cell"));
            msg.proposal_no = ballot;
            msg.lease_holder = Some("x".into());
            msg.lease_timeout_ms = NOW + 10_000;
            msg.send_timestamp_ms = NOW;
            let reply = acceptor.process_message(&msg, NOW, &mut outbox).unwrap();
            if ballot.before(&highest) {
                prop_assert!(matches!(
                    reply.kind,
                    MessageKind::PrepareNack | MessageKind::AcceptNack
                ));
                prop_assert_eq!(reply.prev_proposal_no, highest);
            } else {
                prop_assert!(matches!(
                    reply.kind,
                    MessageKind::PrepareAck | MessageKind::AcceptAck
                ));
                highest = ballot;
            }
        }
    }
}
