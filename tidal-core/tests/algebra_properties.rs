mod common;

use common::{
    actions_strategy, applied, build_document, build_op, document_strategy, text_document,
    Action, Segment,
};
use proptest::prelude::*;
use tidal_core::{
    compose, invert, transform, transform_with, Component, ConflictPolicy, DocOp, TransformError,
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn test_transform_converges(
        document in document_strategy(),
        client_actions in actions_strategy(),
        server_actions in actions_strategy(),
    ) {
        let client = build_op(&document, &client_actions);
        let server = build_op(&document, &server_actions);
        let (client_prime, server_prime) = transform(&client, &server).unwrap();

        let via_client = applied(&applied(&document, &client), &server_prime);
        let via_server = applied(&applied(&document, &server), &client_prime);
        prop_assert_eq!(&via_client, &via_server);

        let left = applied(&document, &compose(&client, &server_prime).unwrap());
        let right = applied(&document, &compose(&server, &client_prime).unwrap());
        prop_assert_eq!(left, right);
    }

    #[test]
    fn test_reject_policy_agrees_when_it_succeeds(
        document in document_strategy(),
        client_actions in actions_strategy(),
        server_actions in actions_strategy(),
    ) {
        let client = build_op(&document, &client_actions);
        let server = build_op(&document, &server_actions);
        match transform_with(&client, &server, ConflictPolicy::Reject) {
            Ok(strict) => prop_assert_eq!(strict, transform(&client, &server).unwrap()),
            Err(error) => {
                let is_conflict = matches!(error, TransformError::Conflict { .. });
                prop_assert!(is_conflict)
            }
        }
    }

    #[test]
    fn test_invert_restores_document(
        document in document_strategy(),
        actions in actions_strategy(),
    ) {
        let op = build_op(&document, &actions);
        let inverse = invert(&op);
        prop_assert_eq!(&applied(&applied(&document, &op), &inverse), &document);
        prop_assert_eq!(invert(&inverse), op);
    }

    #[test]
    fn test_compose_matches_sequential_application(
        document in document_strategy(),
        first_actions in actions_strategy(),
        second_actions in actions_strategy(),
    ) {
        let first = build_op(&document, &first_actions);
        let middle = applied(&document, &first);
        let second = build_op(&middle, &second_actions);

        let composed = compose(&first, &second).unwrap();
        prop_assert_eq!(composed.input_len(), first.input_len());
        prop_assert_eq!(composed.output_len(), second.output_len());
        prop_assert_eq!(applied(&document, &composed), applied(&middle, &second));
    }

    #[test]
    fn test_compose_is_associative(
        document in document_strategy(),
        a_actions in actions_strategy(),
        b_actions in actions_strategy(),
        c_actions in actions_strategy(),
    ) {
        let a = build_op(&document, &a_actions);
        let after_a = applied(&document, &a);
        let b = build_op(&after_a, &b_actions);
        let after_b = applied(&after_a, &b);
        let c = build_op(&after_b, &c_actions);

        let left = compose(&compose(&a, &b).unwrap(), &c).unwrap();
        let right = compose(&a, &compose(&b, &c).unwrap()).unwrap();
        prop_assert_eq!(applied(&document, &left), applied(&document, &right));
    }
}

#[test]
fn test_concurrent_inserts_into_empty_document() {
    // Local "hello" and remote "hi " both typed into an empty document.
    let empty = text_document("");
    let local = DocOp::builder().characters("hello").build().unwrap();
    let remote = DocOp::builder().characters("hi ").build().unwrap();

    let (local_prime, remote_prime) = transform(&local, &remote).unwrap();
    let local_replica = applied(&applied(&empty, &local), &remote_prime);
    let remote_replica = applied(&applied(&empty, &remote), &local_prime);
    assert_eq!(local_replica.text(), "hi hello");
    assert_eq!(remote_replica.text(), "hi hello");
}

#[test]
fn test_sequential_inserts_compose() {
    let first = DocOp::builder().characters("abc").build().unwrap();
    let second = DocOp::builder().characters("x").retain(3).build().unwrap();
    let composed = compose(&first, &second).unwrap();
    assert_eq!(composed.components(), &[Component::Characters("xabc".into())]);
}

#[test]
fn test_in_flight_delete_against_remote_insert() {
    let document = text_document("abcde");
    let local = DocOp::builder().delete_characters("abcde").build().unwrap();
    let remote = DocOp::builder()
        .retain(2)
        .characters("X")
        .retain(3)
        .build()
        .unwrap();

    let (local_prime, remote_prime) = transform(&local, &remote).unwrap();
    assert_eq!(
        local_prime.components(),
        &[
            Component::DeleteCharacters("ab".into()),
            Component::Retain(1),
            Component::DeleteCharacters("cde".into()),
        ]
    );
    assert_eq!(remote_prime.components(), &[Component::Characters("X".into())]);
    assert_eq!(applied(&applied(&document, &local), &remote_prime).text(), "X");
}

#[test]
fn test_concurrent_markup_on_nested_element_converges() {
    // <e id=0>ab<e id=1>c</e></e>
    let document = build_document(vec![Segment::Nested(0, "ab".into(), "c".into())]);
    let local = build_op(
        &document,
        &[Action::ReplaceAttributes(2), Action::Annotate(3, "lang", Some("red"))],
    );
    let remote = build_op(
        &document,
        &[
            Action::SetAttribute("id", Some("1")),
            Action::Retain(1),
            Action::Annotate(4, "style", Some("blue")),
        ],
    );

    let (local_prime, remote_prime) = transform(&local, &remote).unwrap();
    let local_replica = applied(&applied(&document, &local), &remote_prime);
    let remote_replica = applied(&applied(&document, &remote), &local_prime);
    assert_eq!(local_replica, remote_replica);
    assert_eq!(local_replica.text(), "abc");
    assert_eq!(local_replica.annotation(2, "lang"), Some("red"));
    assert_eq!(local_replica.annotation(2, "style"), Some("blue"));
    assert_eq!(local_replica.annotation(4, "lang"), None);
}
