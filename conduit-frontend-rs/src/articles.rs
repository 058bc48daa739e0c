//! Articles, their tag edges, and favorite edges.
//!
//! Three streams, versioned together: `conduit-articles-<v>` (the stored
//! articles), `conduit-tags-<v>` (slug → tag edges, replaced wholesale per
//! article), and `conduit-favorites-<v>` (a double index, slug → uid and
//! uid → slug, so both "who favorited this" and "what did I favorite" are
//! cheap). The articles stream seeds from its previous version's latest
//! value, which is how the version bump migrates data.
//!
//! The read side joins all three with profiles into fully denormalized
//! [`Article`] values.

use undertow::{Responder, SharedReducer};

use crate::errors::ValidationErrors;
use crate::users::{Profile, Uid};

pub const ARTICLES_VERSION: u32 = 2;

pub fn articles_stream() -> String {
    format!("conduit-articles-{ARTICLES_VERSION}")
}

/// The stream the current articles stream was migrated from.
pub fn previous_articles_stream() -> String {
    format!("conduit-articles-{}", ARTICLES_VERSION - 1)
}

pub fn tags_stream() -> String {
    format!("conduit-tags-{ARTICLES_VERSION}")
}

pub fn favorites_stream() -> String {
    format!("conduit-favorites-{ARTICLES_VERSION}")
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct StoredArticle {
    pub slug: String,
    pub title: String,
    pub description: String,
    pub body: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub uid: Uid,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct ArticleDraft {
    pub title: String,
    pub description: String,
    pub body: String,
    pub tag_list: Vec<String>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(tag = "type")]
pub enum ArticleAction {
    CreateArticleAction {
        article: ArticleDraft,
        uid: Uid,
        slug: String,
        #[serde(rename = "createdAt")]
        created_at: i64,
    },
    UpdateArticleAction {
        article: ArticleDraft,
        slug: String,
        uid: Uid,
        #[serde(rename = "updatedAt")]
        updated_at: i64,
    },
    DeleteArticleAction {
        slug: String,
        uid: Uid,
    },
}

/// What an article emission resolves with: the slug on success, field errors
/// otherwise.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct ArticleOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<ValidationErrors>,
}

impl ArticleOutcome {
    fn ok(slug: String) -> Self {
        Self {
            slug: Some(slug),
            errors: None,
        }
    }

    fn failed(errors: ValidationErrors) -> Self {
        Self {
            slug: None,
            errors: Some(errors),
        }
    }
}

pub struct ArticlesReducer;

impl SharedReducer for ArticlesReducer {
    type State = im::Vector<StoredArticle>;
    type Action = ArticleAction;
    type Response = ArticleOutcome;

    fn definition(&self) -> &str {
        "conduit articles v2: Create appends; Update rewrites the author's own article by slug; Delete removes it, author only"
    }

    fn reduce(
        &self,
        articles: im::Vector<StoredArticle>,
        action: ArticleAction,
        responder: &mut Responder<ArticleOutcome>,
    ) -> im::Vector<StoredArticle> {
        match action {
            ArticleAction::CreateArticleAction {
                article,
                uid,
                slug,
                created_at,
            } => {
                if uid.is_empty() {
                    responder.resolve(ArticleOutcome::failed(ValidationErrors::unauthorized(
                        "to edit article",
                    )));
                    return articles;
                }
                let mut articles = articles;
                articles.push_back(StoredArticle {
                    slug: slug.clone(),
                    title: article.title,
                    description: article.description,
                    body: article.body,
                    created_at,
                    updated_at: created_at,
                    uid,
                });
                responder.resolve(ArticleOutcome::ok(slug));
                articles
            }
            ArticleAction::UpdateArticleAction {
                article,
                slug,
                uid,
                updated_at,
            } => {
                if uid.is_empty() {
                    responder.resolve(ArticleOutcome::failed(ValidationErrors::unauthorized(
                        "to edit article",
                    )));
                    return articles;
                }
                responder.resolve(ArticleOutcome::ok(slug.clone()));
                articles
                    .iter()
                    .map(|existing| {
                        if existing.slug == slug && existing.uid == uid {
                            StoredArticle {
                                title: article.title.clone(),
                                description: article.description.clone(),
                                body: article.body.clone(),
                                updated_at,
                                ..existing.clone()
                            }
                        } else {
                            existing.clone()
                        }
                    })
                    .collect()
            }
            ArticleAction::DeleteArticleAction { slug, uid } => {
                if uid.is_empty() {
                    responder.resolve(ArticleOutcome::failed(ValidationErrors::unauthorized(
                        "to edit article",
                    )));
                    return articles;
                }
                match articles.iter().find(|a| a.slug == slug) {
                    Some(existing) if existing.uid == uid => {
                        responder.resolve(ArticleOutcome::ok(slug.clone()));
                        articles.iter().filter(|a| a.slug != slug).cloned().collect()
                    }
                    Some(_) => {
                        // not the author; leave the article alone
                        responder.resolve(ArticleOutcome::ok(slug));
                        articles
                    }
                    None => {
                        let mut errors = ValidationErrors::default();
                        errors.add("article", "not found");
                        responder.resolve(ArticleOutcome::failed(errors));
                        articles
                    }
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct ArticleTag {
    pub slug: String,
    pub tag: String,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(tag = "type")]
pub enum TagAction {
    UpdateArticleTags {
        slug: String,
        #[serde(rename = "tagList")]
        tag_list: Vec<String>,
        uid: Uid,
    },
}

pub struct TagsReducer;

impl SharedReducer for TagsReducer {
    type State = im::Vector<ArticleTag>;
    type Action = TagAction;
    type Response = ValidationErrors;

    fn definition(&self) -> &str {
        "conduit tags v2: UpdateArticleTags replaces the tag set of a slug"
    }

    fn reduce(
        &self,
        tags: im::Vector<ArticleTag>,
        action: TagAction,
        responder: &mut Responder<ValidationErrors>,
    ) -> im::Vector<ArticleTag> {
        let TagAction::UpdateArticleTags {
            slug,
            tag_list,
            uid,
        } = action;

        if uid.is_empty() {
            responder.resolve(ValidationErrors::unauthorized("to edit article"));
            return tags;
        }

        responder.resolve(ValidationErrors::default());
        let mut next: im::Vector<ArticleTag> = tags
            .iter()
            .filter(|existing| existing.slug != slug || tag_list.contains(&existing.tag))
            .cloned()
            .collect();
        for tag in tag_list {
            if !next.iter().any(|existing| existing.slug == slug && existing.tag == tag) {
                next.push_back(ArticleTag {
                    slug: slug.clone(),
                    tag,
                });
            }
        }
        next
    }
}

/// Every distinct tag in use, in first-seen order.
pub fn all_tags(tags: &im::Vector<ArticleTag>) -> Vec<String> {
    let mut seen = Vec::new();
    for tag in tags.iter() {
        if !seen.contains(&tag.tag) {
            seen.push(tag.tag.clone());
        }
    }
    seen
}

/// Favorite edges, indexed both ways.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct Favorites {
    pub articles: im::OrdMap<String, im::OrdMap<Uid, bool>>,
    pub users: im::OrdMap<Uid, im::OrdMap<String, bool>>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(tag = "type")]
pub enum FavoriteAction {
    FavoriteAction { slug: String, uid: Uid },
    UnfavoriteAction { slug: String, uid: Uid },
}

pub struct FavoritesReducer;

impl SharedReducer for FavoritesReducer {
    type State = Favorites;
    type Action = FavoriteAction;
    type Response = ValidationErrors;

    fn definition(&self) -> &str {
        "conduit favorites v2: FavoriteAction/UnfavoriteAction keep the slug->uid and uid->slug indexes in step"
    }

    fn reduce(
        &self,
        favorites: Favorites,
        action: FavoriteAction,
        responder: &mut Responder<ValidationErrors>,
    ) -> Favorites {
        let (slug, uid, favorite) = match action {
            FavoriteAction::FavoriteAction { slug, uid } => (slug, uid, true),
            FavoriteAction::UnfavoriteAction { slug, uid } => (slug, uid, false),
        };

        if uid.is_empty() {
            responder.resolve(ValidationErrors::unauthorized("to perform this action"));
            return favorites;
        }

        responder.resolve(ValidationErrors::default());
        let by_article = favorites.articles.get(&slug).cloned().unwrap_or_default();
        let by_user = favorites.users.get(&uid).cloned().unwrap_or_default();
        Favorites {
            articles: favorites
                .articles
                .update(slug.clone(), by_article.update(uid.clone(), favorite)),
            users: favorites.users.update(uid, by_user.update(slug, favorite)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub slug: String,
    pub title: String,
    pub description: String,
    pub body: String,
    pub tag_list: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub favorited: bool,
    pub favorites_count: usize,
    pub author: Option<Profile>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct MultipleArticles {
    pub articles: Vec<Article>,
    pub articles_count: usize,
}

/// The fully denormalized read model: articles joined with their tag edges,
/// favorite counts, and author profiles.
pub fn compose_articles(
    current_uid: Option<&str>,
    stored: &im::Vector<StoredArticle>,
    tags: &im::Vector<ArticleTag>,
    favorites: &Favorites,
    profiles: &[Profile],
) -> Vec<Article> {
    stored
        .iter()
        .map(|article| {
            let favorited = current_uid
                .and_then(|me| favorites.articles.get(&article.slug).and_then(|m| m.get(me)))
                .copied()
                .unwrap_or(false);
            let favorites_count = favorites
                .articles
                .get(&article.slug)
                .map_or(0, |m| m.values().filter(|favorite| **favorite).count());
            Article {
                slug: article.slug.clone(),
                title: article.title.clone(),
                description: article.description.clone(),
                body: article.body.clone(),
                tag_list: tags
                    .iter()
                    .filter(|tag| tag.slug == article.slug)
                    .map(|tag| tag.tag.clone())
                    .collect(),
                created_at: article.created_at,
                updated_at: article.updated_at,
                favorited,
                favorites_count,
                author: profiles.iter().find(|p| p.uid == article.uid).cloned(),
            }
        })
        .collect()
}

/// Lowercased title words joined with hyphens, plus a short random suffix so
/// equal titles never collide.
pub fn slugify(title: &str) -> String {
    let words: Vec<&str> = title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    let base = words.join("-").to_lowercase();
    if base.is_empty() {
        eyedee::short_id()
    } else {
        format!("{base}-{}", eyedee::short_id())
    }
}
