//! Couple-space lifecycle and identity scoping, end to end.
//!
//! These tests run against in-memory storage and need no API key.

use companion_core::events::CompanionEvent;
use companion_core::identity::AccountRef;
use companion_core::relationship::{Privacy, RelationshipBook, Sender};
use companion_core::testing::{assert_no_section, assert_not_mentioned, assert_section_contains};
use companion_core::{
    Mask, MemoryDomain, MemoryRecord, ProfileUpdate, RelationshipError, RelationshipStatus,
    SectionKind, TestHarness,
};

const ALICE: &str = "alice";
const BOB: &str = "bob";

// =============================================================================
// Invite, accept, conflict
// =============================================================================

#[tokio::test]
async fn test_invite_accept_then_conflict() {
    let harness = TestHarness::new();
    let book = harness.session.relationships().await.unwrap();
    let mut events = harness.session.events().subscribe();

    book.invite(ALICE, Sender::User).await.unwrap();
    book.accept(ALICE).await.unwrap();

    let current = book.current().await.unwrap().unwrap();
    assert_eq!(current.status, RelationshipStatus::Active);
    assert_eq!(current.character_id, ALICE);
    assert!(current.accepted_at.is_some());

    let err = book.invite(BOB, Sender::Character).await.unwrap_err();
    assert!(matches!(
        err,
        RelationshipError::Conflict { ref character_id } if character_id == ALICE
    ));

    // The failed invite left the record alone.
    let current = book.current().await.unwrap().unwrap();
    assert_eq!(current.character_id, ALICE);

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CompanionEvent::RelationshipChanged { status, .. } = event {
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        vec![Some(RelationshipStatus::Pending), Some(RelationshipStatus::Active)]
    );
}

#[tokio::test]
async fn test_accept_wrong_character() {
    let harness = TestHarness::new();
    let book = harness.session.relationships().await.unwrap();

    book.invite(ALICE, Sender::Character).await.unwrap();
    assert!(matches!(
        book.accept(BOB).await,
        Err(RelationshipError::NoPendingInvite { .. })
    ));
    assert!(book.has_pending().await.unwrap());
}

// =============================================================================
// Reject and re-invite
// =============================================================================

#[tokio::test]
async fn test_reject_then_reinvite() {
    let mut harness = TestHarness::new().with_persona(companion_core::Persona::new(
        ALICE,
        "Alice",
        "A shy florist.",
    ));
    let book = harness.session.relationships().await.unwrap();

    book.invite(ALICE, Sender::Character).await.unwrap();
    book.reject(ALICE).await.unwrap();
    assert!(book.can_send_invite().await.unwrap());

    harness.expect_reply("oh. okay.");
    let response = harness.say("sorry, not yet").await.unwrap();
    assert_section_contains(
        &response.context,
        SectionKind::FeatureStatus,
        "turned down your couple-space invitation",
    );
    assert_section_contains(&response.context, SectionKind::WorldState, "you don't have one yet");

    // The outcome is mentioned once.
    harness.expect_reply("it's fine, really");
    let response = harness.say("are you mad?").await.unwrap();
    assert_not_mentioned(&response.context, "turned down your couple-space");

    let again = book.invite(ALICE, Sender::User).await.unwrap();
    assert_eq!(again.status, RelationshipStatus::Pending);
    let context = harness.peek().await.unwrap();
    assert_section_contains(
        &context,
        SectionKind::WorldState,
        "the user invited you and is waiting for your answer",
    );
}

// =============================================================================
// Ending keeps the content
// =============================================================================

#[tokio::test]
async fn test_end_preserves_content() {
    let harness = TestHarness::new().with_persona(companion_core::Persona::new(
        ALICE,
        "Alice",
        "A shy florist.",
    ));
    let book = harness.session.relationships().await.unwrap();
    let content = harness.session.couple_content().await.unwrap();

    book.invite(ALICE, Sender::User).await.unwrap();
    book.accept(ALICE).await.unwrap();
    content
        .add_note(ALICE, "User", "good morning, sunshine")
        .await
        .unwrap();
    content
        .add_photo(ALICE, "User", "picnic by the lake", chrono::Utc::now())
        .await
        .unwrap();

    let context = harness.peek().await.unwrap();
    assert_section_contains(&context, SectionKind::WorldState, "share a couple space");
    assert_section_contains(&context, SectionKind::WorldState, "good morning, sunshine");
    assert_section_contains(&context, SectionKind::WorldState, "picnic by the lake");

    let ended = book.end().await.unwrap();
    assert_eq!(ended.status, RelationshipStatus::Ended);
    assert!(book.current().await.unwrap().is_none());
    assert!(matches!(book.end().await, Err(RelationshipError::NotActive)));

    assert_eq!(content.notes(ALICE).await.unwrap().len(), 1);
    assert_eq!(content.photos(ALICE).await.unwrap().len(), 1);

    let context = harness.peek().await.unwrap();
    assert_section_contains(&context, SectionKind::FeatureStatus, "has ended");
    assert_section_contains(&context, SectionKind::WorldState, "you don't have one yet");
}

// =============================================================================
// Singleton under arbitrary sequences
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    Invite(&'static str),
    Accept(&'static str),
    Reject(&'static str),
    Cancel(&'static str),
    End,
}

const OPS: [Op; 9] = [
    Op::Invite(ALICE),
    Op::Invite(BOB),
    Op::Accept(ALICE),
    Op::Accept(BOB),
    Op::Reject(ALICE),
    Op::Reject(BOB),
    Op::Cancel(ALICE),
    Op::Cancel(BOB),
    Op::End,
];

async fn apply(book: &RelationshipBook, op: Op) {
    // Failures are expected; only the resulting state is checked.
    let _ = match op {
        Op::Invite(c) => book.invite(c, Sender::User).await,
        Op::Accept(c) => book.accept(c).await,
        Op::Reject(c) => book.reject(c).await,
        Op::Cancel(c) => book.cancel(c).await,
        Op::End => book.end().await,
    };
}

#[tokio::test]
async fn test_at_most_one_relationship_for_any_sequence() {
    // Every sequence of length 4 over the operation set, driven by a
    // mixed-radix counter.
    let total = OPS.len().pow(4);
    for n in 0..total {
        let harness = TestHarness::new();
        let book = harness.session.relationships().await.unwrap();

        let mut k = n;
        let mut active_owner: Option<String> = None;
        for _ in 0..4 {
            let op = OPS[k % OPS.len()];
            k /= OPS.len();
            apply(&book, op).await;

            let view = book.view().await.unwrap();
            if let Some(active) = view.slot.active() {
                // Once active, only `end` may change the partner.
                if let Some(owner) = &active_owner {
                    assert_eq!(owner, &active.character_id, "sequence {n}: partner swapped");
                }
                active_owner = Some(active.character_id.clone());
            } else {
                active_owner = None;
            }
            assert!(
                view.slot.active().is_none() || view.slot.pending().is_none(),
                "sequence {n}: active and pending at once"
            );
        }
    }
}

#[tokio::test]
async fn test_stale_view_rejected() {
    let harness = TestHarness::new();
    let book = harness.session.relationships().await.unwrap();
    let seen = book.view().await.unwrap();

    book.invite(ALICE, Sender::User).await.unwrap();

    let stale = book.clone().at_version(seen.version);
    assert!(matches!(
        stale.invite(BOB, Sender::User).await,
        Err(RelationshipError::StaleVersion { .. })
    ));
    assert_eq!(book.current().await.unwrap().unwrap().character_id, ALICE);
}

// =============================================================================
// Identity scoping
// =============================================================================

#[tokio::test]
async fn test_secondary_account_sees_nothing_from_main() {
    let harness = TestHarness::new().with_persona(companion_core::Persona::new(
        ALICE,
        "Alice",
        "A shy florist.",
    ));
    let book = harness.session.relationships().await.unwrap();
    book.invite(ALICE, Sender::User).await.unwrap();
    book.accept(ALICE).await.unwrap();
    book.set_privacy(Privacy::Public).await.unwrap();
    harness
        .remember(MemoryRecord::new(
            ALICE,
            MemoryDomain::Chat,
            "Cat",
            "User adopted a cat named Mochi",
        ))
        .await
        .unwrap();

    let identity = harness.session.identity();
    let account = identity.create_account("Night Owl", "owl.png").await.unwrap();
    let switched = identity
        .switch_account(AccountRef::Secondary(account.id.clone()))
        .await
        .unwrap();
    assert!(switched.is_secondary_account());

    let context = harness.peek().await.unwrap();
    assert_section_contains(&context, SectionKind::Identity, "Night Owl");
    assert_section_contains(&context, SectionKind::Identity, "stranger");
    assert_no_section(&context, SectionKind::Memory);
    assert_not_mentioned(&context, "Mochi");
    assert_section_contains(&context, SectionKind::WorldState, "you don't have one yet");

    let secondary_book = harness.session.relationships().await.unwrap();
    assert!(secondary_book.current().await.unwrap().is_none());
    assert_eq!(secondary_book.privacy().await.unwrap(), Privacy::Private);

    // Back on main, everything is where it was.
    identity.switch_account(AccountRef::Main).await.unwrap();
    let context = harness.peek().await.unwrap();
    assert_section_contains(&context, SectionKind::Memory, "Mochi");
    assert_section_contains(&context, SectionKind::WorldState, "share a couple space");
}

#[tokio::test]
async fn test_mask_keeps_main_scope() {
    let harness = TestHarness::new().with_persona(companion_core::Persona::new(
        ALICE,
        "Alice",
        "A shy florist.",
    ));
    harness
        .remember(MemoryRecord::new(
            ALICE,
            MemoryDomain::Chat,
            "Trip",
            "User went hiking in the rain",
        ))
        .await
        .unwrap();

    let identity = harness.session.identity();
    let mask = identity
        .create_mask(
            Mask::new("Captain", "captain.png")
                .with_real_name("Rin")
                .with_persona("A pirate captain who never admits defeat"),
        )
        .await
        .unwrap();
    let worn = identity.wear_mask(&mask.id).await.unwrap();
    assert_eq!(worn.display_name, "Captain");
    assert!(!worn.is_secondary_account());

    let context = harness.peek().await.unwrap();
    assert_section_contains(&context, SectionKind::Identity, "\"Captain\"");
    assert_section_contains(&context, SectionKind::Identity, "pirate captain");
    assert_section_contains(&context, SectionKind::Memory, "hiking in the rain");
    assert_not_mentioned(&context, "stranger");
}

#[tokio::test]
async fn test_nickname_change_mentioned_once() {
    let mut harness = TestHarness::new();

    // The first turn only records the baseline.
    harness.expect_reply("hi!");
    let first = harness.say("hello").await.unwrap();
    assert_not_mentioned(&first.context, "changed their nickname");

    harness
        .session
        .identity()
        .update_main_profile(ProfileUpdate::new().nickname("Moonlight"))
        .await
        .unwrap();

    harness.expect_reply("ooh, new name");
    let second = harness.say("notice anything?").await.unwrap();
    assert_section_contains(
        &second.context,
        SectionKind::Nudges,
        "changed their nickname to \"Moonlight\"",
    );

    harness.expect_reply("still cute");
    let third = harness.say("and now?").await.unwrap();
    assert_not_mentioned(&third.context, "changed their nickname");
}
