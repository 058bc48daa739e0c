//! Accounts and follow edges.
//!
//! `conduit-users-<v>` holds every registered account and is where sign-up
//! validation happens: the reducer sees the full list, so duplicate checks
//! are consistent for everyone. `conduit-followers-<v>` holds follower →
//! leader edges as a two-level map, which keeps concurrent follows of
//! different pairs order-insensitive. Profiles are the read-side join of the
//! two plus the current identity.

use undertow::{Responder, SharedReducer};

use crate::errors::ValidationErrors;

pub const USERS_VERSION: u32 = 1;

pub fn users_stream() -> String {
    format!("conduit-users-{USERS_VERSION}")
}

pub fn followers_stream() -> String {
    format!("conduit-followers-{USERS_VERSION}")
}

pub type Uid = String;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub email: String,
    pub bio: Option<String>,
    pub image: Option<String>,
    pub uid: Uid,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub username: String,
    pub bio: Option<String>,
    pub image: Option<String>,
    pub uid: Uid,
    pub following: bool,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(tag = "type")]
pub enum UserAction {
    #[serde(rename = "SIGN_UP")]
    SignUp { user: User },
    #[serde(rename = "UPDATE")]
    Update {
        #[serde(rename = "newUser")]
        new_user: User,
        uid: Uid,
    },
}

pub struct UsersReducer;

impl SharedReducer for UsersReducer {
    type State = im::Vector<User>;
    type Action = UserAction;
    type Response = ValidationErrors;

    fn definition(&self) -> &str {
        "conduit users v1: SIGN_UP refuses duplicate email/username/uid; UPDATE replaces the acting uid's own account"
    }

    fn reduce(
        &self,
        users: im::Vector<User>,
        action: UserAction,
        responder: &mut Responder<ValidationErrors>,
    ) -> im::Vector<User> {
        match action {
            UserAction::SignUp { user } => {
                let mut errors = ValidationErrors::default();
                if users.iter().any(|u| u.email == user.email) {
                    errors.add("email", "already in use");
                }
                if users.iter().any(|u| u.username == user.username) {
                    errors.add("username", "already in use");
                }
                if users.iter().any(|u| u.uid == user.uid) {
                    errors.add("uid", "already in use");
                }
                if errors.is_empty() {
                    responder.resolve(errors);
                    let mut users = users;
                    users.push_back(user);
                    users
                } else {
                    responder.resolve(errors);
                    users
                }
            }
            UserAction::Update { new_user, uid } => {
                if uid.is_empty() {
                    responder.resolve(ValidationErrors::unauthorized("to perform update to user"));
                    return users;
                }
                responder.resolve(ValidationErrors::default());
                users
                    .iter()
                    .map(|u| if u.uid == uid { new_user.clone() } else { u.clone() })
                    .collect()
            }
        }
    }
}

pub type FollowerMap = im::OrdMap<Uid, im::OrdMap<Uid, bool>>;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(tag = "type")]
pub enum FollowAction {
    #[serde(rename = "FollowAction")]
    Follow { follower: Uid, leader: Uid, uid: Uid },
    #[serde(rename = "UnfollowAction")]
    Unfollow { follower: Uid, leader: Uid, uid: Uid },
}

pub struct FollowersReducer;

impl SharedReducer for FollowersReducer {
    type State = FollowerMap;
    type Action = FollowAction;
    type Response = ValidationErrors;

    fn definition(&self) -> &str {
        "conduit followers v1: FollowAction/UnfollowAction set the follower->leader edge; only the follower may act"
    }

    fn reduce(
        &self,
        followers: FollowerMap,
        action: FollowAction,
        responder: &mut Responder<ValidationErrors>,
    ) -> FollowerMap {
        let (follower, leader, uid, following) = match action {
            FollowAction::Follow {
                follower,
                leader,
                uid,
            } => (follower, leader, uid, true),
            FollowAction::Unfollow {
                follower,
                leader,
                uid,
            } => (follower, leader, uid, false),
        };

        if uid != follower || uid.is_empty() {
            responder.resolve(ValidationErrors::unauthorized("to perform this action"));
            return followers;
        }

        responder.resolve(ValidationErrors::default());
        let leaders = followers.get(&follower).cloned().unwrap_or_default();
        followers.update(follower, leaders.update(leader, following))
    }
}

/// All accounts as profiles, with `following` resolved against the current
/// identity. The composed view of the users and followers streams.
pub fn compose_profiles(
    current_uid: Option<&str>,
    users: &im::Vector<User>,
    followers: &FollowerMap,
) -> Vec<Profile> {
    users
        .iter()
        .map(|user| Profile {
            username: user.username.clone(),
            bio: user.bio.clone(),
            image: user.image.clone(),
            uid: user.uid.clone(),
            following: current_uid
                .and_then(|me| followers.get(me))
                .and_then(|leaders| leaders.get(&user.uid))
                .copied()
                .unwrap_or(false),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> User {
        User {
            username: name.to_string(),
            email: format!("{name}@example.com"),
            bio: None,
            image: None,
            uid: format!("uid-{name}"),
        }
    }

    #[test]
    fn sign_up_appends_a_new_account() {
        let (mut responder, mut rx) = Responder::capture();
        let users = UsersReducer.reduce(
            im::Vector::new(),
            UserAction::SignUp { user: user("alice") },
            &mut responder,
        );

        assert_eq!(users.len(), 1);
        assert_eq!(rx.try_recv(), Ok(Some(Some(ValidationErrors::default()))));
    }

    #[test]
    fn sign_up_with_a_taken_email_reports_it_and_changes_nothing() {
        let mut existing = user("alice");
        existing.username = "someone-else".to_string();
        existing.uid = "uid-other".to_string();
        let users = im::Vector::from(vec![existing]);

        let (mut responder, mut rx) = Responder::capture();
        let next = UsersReducer.reduce(
            users.clone(),
            UserAction::SignUp { user: user("alice") },
            &mut responder,
        );

        assert_eq!(next, users);
        let response = rx.try_recv().unwrap().flatten().unwrap();
        assert_eq!(response.messages("email"), ["already in use"]);
        assert!(response.messages("username").is_empty());
    }

    #[test]
    fn update_without_an_identity_is_unauthorized() {
        let users = im::Vector::from(vec![user("alice")]);

        let (mut responder, mut rx) = Responder::capture();
        let mut changed = user("alice");
        changed.bio = Some("hello".to_string());
        let next = UsersReducer.reduce(
            users.clone(),
            UserAction::Update {
                new_user: changed,
                uid: String::new(),
            },
            &mut responder,
        );

        assert_eq!(next, users);
        let response = rx.try_recv().unwrap().flatten().unwrap();
        assert!(!response.messages("unauthorized").is_empty());
    }

    #[test]
    fn update_replaces_only_the_acting_uids_account() {
        let users = im::Vector::from(vec![user("alice"), user("bob")]);
        let mut changed = user("alice");
        changed.bio = Some("hello".to_string());

        let (mut responder, _rx) = Responder::capture();
        let next = UsersReducer.reduce(
            users,
            UserAction::Update {
                new_user: changed,
                uid: "uid-alice".to_string(),
            },
            &mut responder,
        );

        assert_eq!(next[0].bio.as_deref(), Some("hello"));
        assert_eq!(next[1].bio, None);
    }

    #[test]
    fn concurrent_follows_of_disjoint_pairs_commute() {
        let follow = |follower: &str, leader: &str| FollowAction::Follow {
            follower: follower.to_string(),
            leader: leader.to_string(),
            uid: follower.to_string(),
        };

        let mut one = FollowerMap::default();
        let mut other = FollowerMap::default();
        for (state, actions) in [
            (&mut one, [follow("a", "c"), follow("b", "c")]),
            (&mut other, [follow("b", "c"), follow("a", "c")]),
        ] {
            for action in actions {
                let (mut responder, _rx) = Responder::capture();
                *state = FollowersReducer.reduce(state.clone(), action, &mut responder);
            }
        }

        assert_eq!(one, other);
        assert_eq!(one.get("a").and_then(|m| m.get("c")), Some(&true));
        assert_eq!(one.get("b").and_then(|m| m.get("c")), Some(&true));
    }

    #[test]
    fn following_on_someone_elses_behalf_is_refused() {
        let (mut responder, mut rx) = Responder::capture();
        let next = FollowersReducer.reduce(
            FollowerMap::default(),
            FollowAction::Follow {
                follower: "a".to_string(),
                leader: "c".to_string(),
                uid: "mallory".to_string(),
            },
            &mut responder,
        );

        assert!(next.is_empty());
        let response = rx.try_recv().unwrap().flatten().unwrap();
        assert!(!response.messages("unauthorized").is_empty());
    }

    #[test]
    fn unfollow_clears_the_edge() {
        let mut state = FollowerMap::default();
        for (action, expected) in [
            (
                FollowAction::Follow {
                    follower: "a".to_string(),
                    leader: "c".to_string(),
                    uid: "a".to_string(),
                },
                true,
            ),
            (
                FollowAction::Unfollow {
                    follower: "a".to_string(),
                    leader: "c".to_string(),
                    uid: "a".to_string(),
                },
                false,
            ),
        ] {
            let (mut responder, _rx) = Responder::capture();
            state = FollowersReducer.reduce(state, action, &mut responder);
            assert_eq!(state.get("a").and_then(|m| m.get("c")), Some(&expected));
        }
    }

    #[test]
    fn profiles_resolve_following_against_the_current_identity() {
        let users = im::Vector::from(vec![user("alice"), user("bob")]);
        let mut followers = FollowerMap::default();
        followers = followers.update(
            "uid-me".to_string(),
            im::OrdMap::unit("uid-alice".to_string(), true),
        );

        let profiles = compose_profiles(Some("uid-me"), &users, &followers);
        assert!(profiles[0].following);
        assert!(!profiles[1].following);

        let signed_out = compose_profiles(None, &users, &followers);
        assert!(signed_out.iter().all(|p| !p.following));
    }
}
