use std::collections::HashSet;

use proptest::prelude::*;

use presence_channel::presence::{PresenceReconciler, SnapshotSource, unique_valid_users};
use presence_channel::protocol::ConnectedUser;

// --- Generators ---

fn arb_id() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        3 => (0u8..6).prop_map(|n| Some(format!("u{n}"))),
        1 => Just(Some(String::new())),
        1 => Just(None),
    ]
}

fn arb_name() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        3 => "[a-z]{1,8}".prop_map(Some),
        1 => Just(Some("   ".to_string())),
        1 => Just(None),
    ]
}

fn arb_user() -> impl Strategy<Value = ConnectedUser> {
    (arb_id(), arb_name(), arb_name(), 1u32..4).prop_map(
        |(id, username, first_name, session_count)| ConnectedUser {
            id,
            username,
            first_name,
            last_name: None,
            role: None,
            connected_at: None,
            session_count,
        },
    )
}

#[derive(Debug, Clone)]
enum Op {
    Snapshot(Vec<ConnectedUser>),
    Connected(ConnectedUser),
    Disconnected(String),
    Logout(String),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => prop::collection::vec(arb_user(), 0..6).prop_map(Op::Snapshot),
        3 => arb_user().prop_map(Op::Connected),
        2 => (0u8..6).prop_map(|n| Op::Disconnected(format!("u{n}"))),
        1 => (0u8..6).prop_map(|n| Op::Logout(format!("u{n}"))),
    ]
}

fn apply(presence: &PresenceReconciler, op: &Op) {
    match op {
        Op::Snapshot(users) => presence.replace_all(users.clone(), SnapshotSource::Frame),
        Op::Connected(user) => presence.user_connected(user.clone()),
        Op::Disconnected(id) => presence.user_disconnected(id),
        Op::Logout(id) => {
            presence.remove_user(id);
        }
    }
}

// --- Derived view ---

proptest! {
    #[test]
    fn view_never_repeats_an_id(ops in prop::collection::vec(arb_op(), 0..40)) {
        let presence = PresenceReconciler::new();
        for op in &ops {
            apply(&presence, op);
            let view = presence.current();
            let mut seen = HashSet::new();
            for user in &view {
                prop_assert!(user.is_valid());
                if let Some(id) = user.id.as_deref().filter(|id| !id.is_empty()) {
                    prop_assert!(seen.insert(id.to_string()), "duplicate id {id}");
                }
            }
        }
    }

    #[test]
    fn snapshot_supersedes_history(
        history in prop::collection::vec(arb_op(), 0..20),
        snapshot in prop::collection::vec(arb_user(), 0..6),
    ) {
        let presence = PresenceReconciler::new();
        for op in &history {
            apply(&presence, op);
        }
        presence.replace_all(snapshot.clone(), SnapshotSource::Fallback);
        prop_assert_eq!(presence.current(), unique_valid_users(&snapshot));
    }

    #[test]
    fn disconnected_id_is_absent(
        ops in prop::collection::vec(arb_op(), 0..20),
        n in 0u8..6,
    ) {
        let presence = PresenceReconciler::new();
        for op in &ops {
            apply(&presence, op);
        }
        let id = format!("u{n}");
        presence.user_disconnected(&id);
        prop_assert!(presence.current().iter().all(|u| u.id.as_deref() != Some(id.as_str())));
    }

    #[test]
    fn connected_user_is_visible(
        ops in prop::collection::vec(arb_op(), 0..20),
        n in 0u8..6,
        name in "[a-z]{1,8}",
    ) {
        let presence = PresenceReconciler::new();
        for op in &ops {
            apply(&presence, op);
        }
        let id = format!("u{n}");
        presence.user_connected(ConnectedUser {
            id: Some(id.clone()),
            username: Some(name.clone()),
            first_name: None,
            last_name: None,
            role: None,
            connected_at: None,
            session_count: 7,
        });
        let view = presence.current();
        let matching: Vec<_> = view.iter().filter(|u| u.id.as_deref() == Some(id.as_str())).collect();
        prop_assert_eq!(matching.len(), 1);
        prop_assert_eq!(matching[0].username.as_deref(), Some(name.as_str()));
        prop_assert_eq!(matching[0].session_count, 1);
    }

    #[test]
    fn unique_valid_users_is_idempotent(users in prop::collection::vec(arb_user(), 0..10)) {
        let once = unique_valid_users(&users);
        prop_assert_eq!(unique_valid_users(&once), once.clone());
    }
}
