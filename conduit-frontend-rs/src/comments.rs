//! Comment threads, keyed by article slug.
//!
//! `conduit-comments-<v>` is one map from slug to the ordered list of stored
//! comments. Comment ids are client-generated random numbers; creation time
//! is client wall-clock, carried in the action. The read side resolves each
//! comment's author profile.

use undertow::{Responder, SharedReducer};

use crate::errors::ValidationErrors;
use crate::users::{Profile, Uid};

pub fn comments_stream() -> String {
    format!("conduit-comments-{}", crate::articles::ARTICLES_VERSION)
}

pub fn previous_comments_stream() -> String {
    format!("conduit-comments-{}", crate::articles::ARTICLES_VERSION - 1)
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct StoredComment {
    pub uid: Uid,
    pub body: String,
    pub comment_id: u64,
    pub created_at: i64,
}

pub type CommentMap = im::OrdMap<String, im::Vector<StoredComment>>;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(tag = "type")]
pub enum CommentAction {
    CreateComment {
        uid: Uid,
        body: String,
        slug: String,
        #[serde(rename = "commentId")]
        comment_id: u64,
        #[serde(rename = "createdAt")]
        created_at: i64,
    },
    DeleteComment {
        uid: Uid,
        slug: String,
        #[serde(rename = "commentId")]
        comment_id: u64,
    },
}

pub struct CommentsReducer;

impl SharedReducer for CommentsReducer {
    type State = CommentMap;
    type Action = CommentAction;
    type Response = ValidationErrors;

    fn definition(&self) -> &str {
        "conduit comments v2: CreateComment appends to the slug's thread; DeleteComment removes the author's own comment"
    }

    fn reduce(
        &self,
        comments: CommentMap,
        action: CommentAction,
        responder: &mut Responder<ValidationErrors>,
    ) -> CommentMap {
        match action {
            CommentAction::CreateComment {
                uid,
                body,
                slug,
                comment_id,
                created_at,
            } => {
                if uid.is_empty() {
                    responder.resolve(ValidationErrors::unauthorized("to perform this action"));
                    return comments;
                }
                responder.resolve(ValidationErrors::default());
                let mut thread = comments.get(&slug).cloned().unwrap_or_default();
                thread.push_back(StoredComment {
                    uid,
                    body,
                    comment_id,
                    created_at,
                });
                comments.update(slug, thread)
            }
            CommentAction::DeleteComment {
                uid,
                slug,
                comment_id,
            } => {
                let thread = comments.get(&slug).cloned().unwrap_or_default();
                let owned = thread
                    .iter()
                    .any(|comment| comment.comment_id == comment_id && comment.uid == uid);
                if uid.is_empty() || !owned {
                    responder.resolve(ValidationErrors::unauthorized("to perform this action"));
                    return comments;
                }
                responder.resolve(ValidationErrors::default());
                let thread: im::Vector<StoredComment> = thread
                    .iter()
                    .filter(|comment| comment.comment_id != comment_id)
                    .cloned()
                    .collect();
                comments.update(slug, thread)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub comment_id: u64,
    pub body: String,
    pub created_at: i64,
    pub author: Option<Profile>,
}

/// One article's thread with author profiles resolved. The composed view of
/// the comments and users streams.
pub fn compose_comments(slug: &str, comments: &CommentMap, profiles: &[Profile]) -> Vec<Comment> {
    comments
        .get(slug)
        .map(|thread| {
            thread
                .iter()
                .map(|comment| Comment {
                    comment_id: comment.comment_id,
                    body: comment.body.clone(),
                    created_at: comment.created_at,
                    author: profiles.iter().find(|p| p.uid == comment.uid).cloned(),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(slug: &str, uid: &str, comment_id: u64) -> CommentAction {
        CommentAction::CreateComment {
            uid: uid.to_string(),
            body: "nice article".to_string(),
            slug: slug.to_string(),
            comment_id,
            created_at: 1_000,
        }
    }

    fn reduce(
        state: CommentMap,
        action: CommentAction,
    ) -> (CommentMap, Option<ValidationErrors>) {
        let (mut responder, mut rx) = Responder::capture();
        let next = CommentsReducer.reduce(state, action, &mut responder);
        (next, rx.try_recv().unwrap().flatten())
    }

    #[test]
    fn comments_append_to_their_slugs_thread() {
        let (comments, _) = reduce(CommentMap::default(), create("s", "a", 1));
        let (comments, response) = reduce(comments, create("s", "b", 2));
        let (comments, _) = reduce(comments, create("other", "a", 3));

        assert_eq!(response.unwrap(), ValidationErrors::default());
        assert_eq!(comments.get("s").unwrap().len(), 2);
        assert_eq!(comments.get("other").unwrap().len(), 1);
    }

    #[test]
    fn anonymous_comments_are_refused() {
        let (comments, response) = reduce(CommentMap::default(), create("s", "", 1));

        assert!(comments.is_empty());
        assert!(!response.unwrap().messages("unauthorized").is_empty());
    }

    #[test]
    fn only_the_author_may_delete_a_comment() {
        let (comments, _) = reduce(CommentMap::default(), create("s", "a", 1));

        let (comments, response) = reduce(
            comments,
            CommentAction::DeleteComment {
                uid: "b".to_string(),
                slug: "s".to_string(),
                comment_id: 1,
            },
        );
        assert_eq!(comments.get("s").unwrap().len(), 1);
        assert!(!response.unwrap().messages("unauthorized").is_empty());

        let (comments, response) = reduce(
            comments,
            CommentAction::DeleteComment {
                uid: "a".to_string(),
                slug: "s".to_string(),
                comment_id: 1,
            },
        );
        assert!(comments.get("s").unwrap().is_empty());
        assert_eq!(response.unwrap(), ValidationErrors::default());
    }

    #[test]
    fn composed_comments_resolve_their_authors() {
        let (comments, _) = reduce(CommentMap::default(), create("s", "uid-a", 1));
        let profiles = [Profile {
            username: "alice".to_string(),
            bio: None,
            image: None,
            uid: "uid-a".to_string(),
            following: false,
        }];

        let thread = compose_comments("s", &comments, &profiles);
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].author.as_ref().unwrap().username, "alice");

        assert!(compose_comments("missing", &comments, &profiles).is_empty());
    }
}
