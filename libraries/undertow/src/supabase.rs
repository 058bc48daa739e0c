//! Supabase REST backend for the remote log, polled over PostgREST.
//!
//! Expected tables (each with a `bigserial id` primary key, used for
//! latest-row ordering):
//! - `stream_events(id, stream text, value jsonb, ts timestamptz default now(), correlation_id bigint)`
//! - `behavior_snapshots(id, stream text, value jsonb, ts timestamptz)`
//! - `behavior_reducers(stream text unique, definition_hash text, initial jsonb)`
//!
//! The live feed is a poll of the newest record per stream. Stream names end
//! up in query strings, so keep them URL-safe (`conduit-users-1` style).

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use futures::stream::LocalBoxStream;
use serde::Deserialize;

use crate::data_model::{EventRecord, NewEventRecord, ReducerManifest, SnapshotRecord};
use crate::store::{Error, LogStore, Result};

const POLL_INTERVAL_MS: i32 = 2_000;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct SupabaseConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

#[derive(Clone)]
pub struct SupabaseStore {
    client: reqwest::Client,
    config: SupabaseConfig,
    access_token: Rc<RefCell<Option<String>>>,
}

#[derive(Deserialize)]
struct EventRow {
    value: serde_json::Value,
    ts: DateTime<Utc>,
    correlation_id: i64,
}

#[derive(Deserialize)]
struct SnapshotRow {
    value: serde_json::Value,
    ts: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ManifestRow {
    definition_hash: String,
    initial: serde_json::Value,
}

impl SupabaseStore {
    pub fn new(config: SupabaseConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            access_token: Rc::new(RefCell::new(None)),
        }
    }

    /// Token of the signed-in user. Anonymous requests fall back to the anon
    /// key.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.borrow_mut() = token;
    }

    fn bearer(&self) -> String {
        self.access_token
            .borrow()
            .clone()
            .unwrap_or_else(|| self.config.supabase_anon_key.clone())
    }

    fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.config.supabase_url)
    }

    async fn insert(
        &self,
        table: &str,
        prefer: &str,
        body: serde_json::Value,
    ) -> std::result::Result<(), String> {
        let response = self
            .client
            .post(self.endpoint(table))
            .header("apikey", &self.config.supabase_anon_key)
            .header("Prefer", prefer)
            .bearer_auth(self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("unexpected status {}", response.status()));
        }
        Ok(())
    }

    async fn select_rows<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        stream: &str,
    ) -> Result<Vec<T>> {
        let response = self
            .client
            .get(url)
            .header("apikey", &self.config.supabase_anon_key)
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(|e| Error::Fetch {
                stream: stream.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Error::Fetch {
                stream: stream.to_string(),
                message: format!("unexpected status {}", response.status()),
            });
        }
        response.json::<Vec<T>>().await.map_err(|e| Error::Fetch {
            stream: stream.to_string(),
            message: e.to_string(),
        })
    }

    async fn fetch_latest_event(&self, stream: &str) -> Result<Option<EventRecord>> {
        let url = format!(
            "{}?select=value,ts,correlation_id&stream=eq.{stream}&order=id.desc&limit=1",
            self.endpoint("stream_events")
        );
        let rows: Vec<EventRow> = self.select_rows(&url, stream).await?;
        Ok(rows.into_iter().next().map(|row| EventRecord {
            value: row.value,
            ts: row.ts,
            // bigint round-trip of the unsigned correlation id
            correlation_id: row.correlation_id as u64,
        }))
    }
}

impl LogStore for SupabaseStore {
    fn append(&self, stream: &str, record: NewEventRecord) -> LocalBoxFuture<'static, Result<()>> {
        let this = self.clone();
        let stream = stream.to_string();
        Box::pin(async move {
            let body = serde_json::json!({
                "stream": stream,
                "value": record.value,
                "correlation_id": record.correlation_id as i64,
            });
            this.insert("stream_events", "return=minimal", body)
                .await
                .map_err(|message| Error::Append { stream, message })
        })
    }

    fn latest_snapshot(
        &self,
        stream: &str,
    ) -> LocalBoxFuture<'static, Result<Option<SnapshotRecord>>> {
        let this = self.clone();
        let stream = stream.to_string();
        Box::pin(async move {
            let url = format!(
                "{}?select=value,ts&stream=eq.{stream}&order=id.desc&limit=1",
                this.endpoint("behavior_snapshots")
            );
            let rows: Vec<SnapshotRow> = this.select_rows(&url, &stream).await?;
            Ok(rows.into_iter().next().map(|row| SnapshotRecord {
                value: row.value,
                ts: row.ts,
            }))
        })
    }

    fn persist_snapshot(
        &self,
        stream: &str,
        snapshot: SnapshotRecord,
    ) -> LocalBoxFuture<'static, Result<()>> {
        let this = self.clone();
        let stream = stream.to_string();
        Box::pin(async move {
            let body = serde_json::json!({
                "stream": stream,
                "value": snapshot.value,
                "ts": snapshot.ts,
            });
            this.insert("behavior_snapshots", "return=minimal", body)
                .await
                .map_err(|message| Error::Append { stream, message })
        })
    }

    fn reducer_manifest(
        &self,
        stream: &str,
    ) -> LocalBoxFuture<'static, Result<Option<ReducerManifest>>> {
        let this = self.clone();
        let stream = stream.to_string();
        Box::pin(async move {
            let url = format!(
                "{}?select=definition_hash,initial&stream=eq.{stream}&limit=1",
                this.endpoint("behavior_reducers")
            );
            let rows: Vec<ManifestRow> = this.select_rows(&url, &stream).await?;
            Ok(rows.into_iter().next().map(|row| ReducerManifest {
                definition_hash: row.definition_hash,
                initial: row.initial,
            }))
        })
    }

    fn register_manifest(
        &self,
        stream: &str,
        manifest: ReducerManifest,
    ) -> LocalBoxFuture<'static, Result<()>> {
        let this = self.clone();
        let stream = stream.to_string();
        Box::pin(async move {
            let body = serde_json::json!({
                "stream": stream,
                "definition_hash": manifest.definition_hash,
                "initial": manifest.initial,
            });
            // first registration wins
            this.insert(
                "behavior_reducers",
                "resolution=ignore-duplicates,return=minimal",
                body,
            )
            .await
            .map_err(|message| Error::Append { stream, message })
        })
    }

    fn subscribe_latest(&self, stream: &str) -> LocalBoxStream<'static, EventRecord> {
        let this = self.clone();
        let stream_name = stream.to_string();
        Box::pin(futures::stream::unfold(
            None::<(DateTime<Utc>, u64)>,
            move |last| {
                let this = this.clone();
                let stream_name = stream_name.clone();
                async move {
                    loop {
                        match this.fetch_latest_event(&stream_name).await {
                            Ok(Some(record)) => {
                                let key = (record.ts, record.correlation_id);
                                if last != Some(key) {
                                    return Some((record, Some(key)));
                                }
                            }
                            Ok(None) => {}
                            Err(e) => log::warn!("Polling {stream_name} failed: {e}"),
                        }
                        sleep_ms(POLL_INTERVAL_MS).await;
                    }
                }
            },
        ))
    }
}

async fn sleep_ms(ms: i32) {
    let promise = js_sys::Promise::new(&mut |resolve, _reject| {
        let window = web_sys::window().expect("no window in this context");
        window
            .set_timeout_with_callback_and_timeout_and_arguments_0(&resolve, ms)
            .expect("setTimeout failed");
    });
    let _ = wasm_bindgen_futures::JsFuture::from(promise).await;
}
