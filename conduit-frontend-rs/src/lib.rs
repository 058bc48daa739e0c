mod articles;
mod comments;
mod errors;
mod session;
#[cfg(target_arch = "wasm32")]
mod supabase;
mod users;
mod utils;

use std::sync::LazyLock;

use futures::future::LocalBoxFuture;
use undertow::cache::LocalCache;
use undertow::{Engine, InitialValue, ListenerKey, LogStore};
use wasm_bindgen::prelude::*;

pub use articles::{
    all_tags, compose_articles, Article, ArticleAction, ArticleDraft, ArticleOutcome, ArticleTag,
    ArticlesReducer, FavoriteAction, Favorites, FavoritesReducer, MultipleArticles, StoredArticle,
    TagAction, TagsReducer,
};
pub use comments::{
    compose_comments, Comment, CommentAction, CommentMap, CommentsReducer, StoredComment,
};
pub use errors::ValidationErrors;
pub use users::{
    compose_profiles, FollowAction, FollowerMap, FollowersReducer, Profile, User, UserAction,
    UsersReducer,
};

use crate::session::Session;

#[cfg(target_arch = "wasm32")]
type AppStore = undertow::supabase::SupabaseStore;
#[cfg(not(target_arch = "wasm32"))]
type AppStore = undertow::memory::MemoryStore;

#[cfg(target_arch = "wasm32")]
type AppCache = undertow::cache::WebStorageCache;
#[cfg(not(target_arch = "wasm32"))]
type AppCache = undertow::cache::MemoryCache;

// putting this inside LOGGER prevents us from accidentally initializing the logger more than once
#[allow(clippy::declare_interior_mutable_const)]
const LOGGER: LazyLock<()> = LazyLock::new(|| {
    utils::set_panic_hook();

    wasm_logger::init(wasm_logger::Config::default());
    log::info!("Logging initialized");
});

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct TagList {
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct CommentThread {
    pub comments: Vec<Comment>,
}

/// All accounts as profiles. Absent until the users and followers streams
/// have both settled.
pub fn profiles_view<L, C>(engine: &Engine<L, C>, current_uid: Option<&str>) -> Option<Vec<Profile>>
where
    L: LogStore + 'static,
    C: LocalCache + 'static,
{
    let accounts = engine.ready_state::<UsersReducer>(&users::users_stream())?;
    let followers = engine.ready_state::<FollowersReducer>(&users::followers_stream())?;
    Some(compose_profiles(current_uid, &accounts, &followers))
}

/// The denormalized article feed. Absent until every constituent stream
/// (users, followers, articles, tags, favorites) has settled.
pub fn feed_view<L, C>(engine: &Engine<L, C>, current_uid: Option<&str>) -> Option<MultipleArticles>
where
    L: LogStore + 'static,
    C: LocalCache + 'static,
{
    let profiles = profiles_view(engine, current_uid)?;
    let stored = engine.ready_state::<ArticlesReducer>(&articles::articles_stream())?;
    let tags = engine.ready_state::<TagsReducer>(&articles::tags_stream())?;
    let favorites = engine.ready_state::<FavoritesReducer>(&articles::favorites_stream())?;
    let list = compose_articles(current_uid, &stored, &tags, &favorites, &profiles);
    Some(MultipleArticles {
        articles_count: list.len(),
        articles: list,
    })
}

/// One article's comment thread with authors resolved. Absent until the
/// comments, users and followers streams have settled.
pub fn comments_view<L, C>(
    engine: &Engine<L, C>,
    current_uid: Option<&str>,
    slug: &str,
) -> Option<CommentThread>
where
    L: LogStore + 'static,
    C: LocalCache + 'static,
{
    let profiles = profiles_view(engine, current_uid)?;
    let comments = engine.ready_state::<CommentsReducer>(&comments::comments_stream())?;
    Some(CommentThread {
        comments: compose_comments(slug, &comments, &profiles),
    })
}

/// Every tag in use. A single-stream view, so it may paint from the cached
/// warm-start value while the stream is still loading.
pub fn tags_view<L, C>(engine: &Engine<L, C>) -> Option<TagList>
where
    L: LogStore + 'static,
    C: LocalCache + 'static,
{
    let tags = engine.display_state::<TagsReducer>(&articles::tags_stream())?;
    Some(TagList {
        tags: all_tags(&tags),
    })
}

#[wasm_bindgen]
pub struct Conduit {
    // btw, we should never hold a borrow across an .await. by avoiding this, we guarantee the absence of "borrow while locked" panics
    engine: Engine<AppStore, AppCache>,
    session: Session,
    on_update: js_sys::Function,
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
impl Conduit {
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen(constructor))]
    pub fn new(user_id: Option<String>, on_update: js_sys::Function) -> Conduit {
        // used to only initialize the logger once
        #[allow(clippy::borrow_interior_mutable_const)]
        *LOGGER;

        #[cfg(target_arch = "wasm32")]
        let store = AppStore::new(supabase::supabase_config());
        #[cfg(not(target_arch = "wasm32"))]
        let store = AppStore::new();

        let engine = Engine::new(store, AppCache::default());

        let callback = on_update.clone();
        engine.subscribe(move |stream_id| {
            #[cfg(target_arch = "wasm32")]
            {
                let this = JsValue::null();
                let stream_js = JsValue::from_str(&stream_id);
                let _ = callback.call1(&this, &stream_js);
            }
            #[cfg(not(target_arch = "wasm32"))]
            {
                let _ = (&callback, stream_id);
            }
        });

        Conduit {
            engine,
            session: Session::new(user_id),
            on_update,
        }
    }

    /// The auth provider's signed-in identity changed.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn set_user(&self, user_id: Option<String>) {
        if self.session.set(user_id) {
            // `following` and `favorited` resolve against the identity, so
            // every composed view is stale now
            self.notify_session_change();
        }
    }

    #[cfg(target_arch = "wasm32")]
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn set_access_token(&self, token: Option<String>) {
        self.engine.store().set_access_token(token);
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn subscribe_to_stream(
        &self,
        stream_id: String,
        callback: js_sys::Function,
    ) -> ListenerKey {
        self.engine.subscribe(move |changed| {
            if changed == stream_id {
                #[cfg(target_arch = "wasm32")]
                {
                    let this = JsValue::null();
                    let _ = callback.call0(&this);
                }
                #[cfg(not(target_arch = "wasm32"))]
                {
                    let _ = &callback;
                }
            }
        })
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn unsubscribe(&self, key: ListenerKey) {
        self.engine.unsubscribe(key)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn request_users(&self) {
        let _flusher = FlushLater::new(self); // The addition of a new stream can trigger listeners, so we want to make sure to flush them after.
        self.spawn_driver(self.engine.open_stream(
            &users::users_stream(),
            UsersReducer,
            InitialValue::Now(im::Vector::new()),
        ));
        self.spawn_driver(self.engine.open_stream(
            &users::followers_stream(),
            FollowersReducer,
            InitialValue::Now(FollowerMap::default()),
        ));
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn request_articles(&self) {
        let _flusher = FlushLater::new(self);
        let migrated = self
            .engine
            .seed_from::<im::Vector<StoredArticle>>(&articles::previous_articles_stream());
        self.spawn_driver(self.engine.open_stream(
            &articles::articles_stream(),
            ArticlesReducer,
            migrated,
        ));
        self.spawn_driver(self.engine.open_stream(
            &articles::tags_stream(),
            TagsReducer,
            InitialValue::Now(im::Vector::new()),
        ));
        self.spawn_driver(self.engine.open_stream(
            &articles::favorites_stream(),
            FavoritesReducer,
            InitialValue::Now(Favorites::default()),
        ));
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn request_comments(&self) {
        let _flusher = FlushLater::new(self);
        let migrated = self
            .engine
            .seed_from::<CommentMap>(&comments::previous_comments_stream());
        self.spawn_driver(self.engine.open_stream(
            &comments::comments_stream(),
            CommentsReducer,
            migrated,
        ));
    }

    /// Stop syncing a stream (component teardown).
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn close_stream(&self, stream_id: String) {
        self.engine.close_stream(&stream_id);
    }

    // =======
    // read side
    // =======

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn get_user(&self) -> Option<User> {
        let uid = self.session.current()?;
        let accounts = self
            .engine
            .display_state::<UsersReducer>(&users::users_stream())?;
        accounts.iter().find(|u| u.uid == uid).cloned()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn get_profile(&self, username: String) -> Option<Profile> {
        let uid = self.session.current();
        profiles_view(&self.engine, uid.as_deref())?
            .into_iter()
            .find(|p| p.username == username)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn get_articles(&self) -> Option<MultipleArticles> {
        let uid = self.session.current();
        feed_view(&self.engine, uid.as_deref())
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn get_article(&self, slug: String) -> Option<Article> {
        self.get_articles()?
            .articles
            .into_iter()
            .find(|article| article.slug == slug)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn get_tags(&self) -> Option<TagList> {
        tags_view(&self.engine)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn get_comments(&self, slug: String) -> Option<CommentThread> {
        let uid = self.session.current();
        comments_view(&self.engine, uid.as_deref(), &slug)
    }

    // =======
    // write side; each call resolves with the reducer's response
    // =======

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn sign_up(&self, user: User) -> Result<JsValue, JsValue> {
        let response = self
            .engine
            .emit::<UsersReducer>(&users::users_stream(), UserAction::SignUp { user })
            .await
            .map_err(err_to_js)?;
        to_js(&response)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn update_user(&self, new_user: User) -> Result<JsValue, JsValue> {
        let action = UserAction::Update {
            new_user,
            uid: self.acting_uid(),
        };
        let response = self
            .engine
            .emit::<UsersReducer>(&users::users_stream(), action)
            .await
            .map_err(err_to_js)?;
        to_js(&response)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn follow(&self, leader: String) -> Result<JsValue, JsValue> {
        self.emit_follow(leader, true).await
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn unfollow(&self, leader: String) -> Result<JsValue, JsValue> {
        self.emit_follow(leader, false).await
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn favorite(&self, slug: String) -> Result<JsValue, JsValue> {
        self.emit_favorite(slug, true).await
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn unfavorite(&self, slug: String) -> Result<JsValue, JsValue> {
        self.emit_favorite(slug, false).await
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn create_article(&self, draft: ArticleDraft) -> Result<JsValue, JsValue> {
        let uid = self.acting_uid();
        let slug = articles::slugify(&draft.title);
        let tag_action = TagAction::UpdateArticleTags {
            slug: slug.clone(),
            tag_list: draft.tag_list.clone(),
            uid: uid.clone(),
        };
        let action = ArticleAction::CreateArticleAction {
            article: draft,
            uid,
            slug,
            created_at: utils::now_ms(),
        };
        let outcome = self
            .engine
            .emit::<ArticlesReducer>(&articles::articles_stream(), action)
            .await
            .map_err(err_to_js)?;
        // tag edges ride along on their own stream
        let _ = self
            .engine
            .emit::<TagsReducer>(&articles::tags_stream(), tag_action)
            .await;
        to_js(&outcome)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn update_article(
        &self,
        slug: String,
        draft: ArticleDraft,
    ) -> Result<JsValue, JsValue> {
        let uid = self.acting_uid();
        let tag_action = TagAction::UpdateArticleTags {
            slug: slug.clone(),
            tag_list: draft.tag_list.clone(),
            uid: uid.clone(),
        };
        let action = ArticleAction::UpdateArticleAction {
            article: draft,
            slug,
            uid,
            updated_at: utils::now_ms(),
        };
        let outcome = self
            .engine
            .emit::<ArticlesReducer>(&articles::articles_stream(), action)
            .await
            .map_err(err_to_js)?;
        let _ = self
            .engine
            .emit::<TagsReducer>(&articles::tags_stream(), tag_action)
            .await;
        to_js(&outcome)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn delete_article(&self, slug: String) -> Result<JsValue, JsValue> {
        let action = ArticleAction::DeleteArticleAction {
            slug,
            uid: self.acting_uid(),
        };
        let outcome = self
            .engine
            .emit::<ArticlesReducer>(&articles::articles_stream(), action)
            .await
            .map_err(err_to_js)?;
        to_js(&outcome)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn add_comment(&self, slug: String, body: String) -> Result<JsValue, JsValue> {
        let action = CommentAction::CreateComment {
            uid: self.acting_uid(),
            body,
            slug,
            comment_id: eyedee::fresh_correlation_id(),
            created_at: utils::now_ms(),
        };
        let response = self
            .engine
            .emit::<CommentsReducer>(&comments::comments_stream(), action)
            .await
            .map_err(err_to_js)?;
        to_js(&response)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn delete_comment(&self, slug: String, comment_id: u64) -> Result<JsValue, JsValue> {
        let action = CommentAction::DeleteComment {
            uid: self.acting_uid(),
            slug,
            comment_id,
        };
        let response = self
            .engine
            .emit::<CommentsReducer>(&comments::comments_stream(), action)
            .await
            .map_err(err_to_js)?;
        to_js(&response)
    }
}

impl Conduit {
    fn acting_uid(&self) -> String {
        self.session.current().unwrap_or_default()
    }

    async fn emit_follow(&self, leader: String, following: bool) -> Result<JsValue, JsValue> {
        let uid = self.acting_uid();
        let action = if following {
            FollowAction::Follow {
                follower: uid.clone(),
                leader,
                uid,
            }
        } else {
            FollowAction::Unfollow {
                follower: uid.clone(),
                leader,
                uid,
            }
        };
        let response = self
            .engine
            .emit::<FollowersReducer>(&users::followers_stream(), action)
            .await
            .map_err(err_to_js)?;
        to_js(&response)
    }

    async fn emit_favorite(&self, slug: String, favorite: bool) -> Result<JsValue, JsValue> {
        let uid = self.acting_uid();
        let action = if favorite {
            FavoriteAction::FavoriteAction { slug, uid }
        } else {
            FavoriteAction::UnfavoriteAction { slug, uid }
        };
        let response = self
            .engine
            .emit::<FavoritesReducer>(&articles::favorites_stream(), action)
            .await
            .map_err(err_to_js)?;
        to_js(&response)
    }

    fn spawn_driver(&self, driver: LocalBoxFuture<'static, undertow::Result<()>>) {
        #[cfg(target_arch = "wasm32")]
        wasm_bindgen_futures::spawn_local(async move {
            if let Err(e) = driver.await {
                log::error!("Stream driver stopped: {e}");
            }
        });
        #[cfg(not(target_arch = "wasm32"))]
        drop(driver);
    }

    fn notify_session_change(&self) {
        #[cfg(target_arch = "wasm32")]
        {
            let this = JsValue::null();
            let _ = self.on_update.call1(&this, &JsValue::from_str("session"));
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = &self.on_update;
        }
    }
}

fn to_js<T: serde::Serialize>(value: &T) -> Result<JsValue, JsValue> {
    serde_wasm_bindgen::to_value(value).map_err(|e| JsValue::from_str(&e.to_string()))
}

fn err_to_js(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// A simple struct that flushes event listeners when dropped. THis is useful if you want to ensure you don't forget to flush listeners, regardless of the code path a function takes.
struct FlushLater<'a> {
    conduit: &'a Conduit,
}

impl<'a> FlushLater<'a> {
    fn new(conduit: &'a Conduit) -> Self {
        Self { conduit }
    }
}

impl<'a> Drop for FlushLater<'a> {
    fn drop(&mut self) {
        self.conduit.engine.flush_notifications();
    }
}
