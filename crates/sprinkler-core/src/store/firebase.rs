//! Firebase Realtime Database adapter (REST + server-sent events).
//!
//! ```text
//!   create  POST   <db>/<collection>.json      -> {"name": "<push key>"}
//!   update  PATCH  <db>/<collection>/<key>.json
//!   remove  DELETE <db>/<path>.json
//!   watch   GET    <db>/<collection>.json  (Accept: text/event-stream)
//! ```
//!
//! The event stream reports `put`/`patch` operations at paths below the
//! watched collection. [`CollectionCache`] replays them onto a local copy so
//! subscribers get whole child records, the way `child_changed` delivers them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{merge_fields, ChildChange, Fields, RecordRef, RemoteStore};
use crate::error::{Result, SprinklerError};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FirebaseStore {
    client: reqwest::Client,
    database_url: String,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    path: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl FirebaseStore {
    pub fn new(database_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            database_url: database_url.into().trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.database_url, path.trim_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token)]),
            None => builder,
        }
    }

    async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        builder
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(SprinklerError::remote)
    }
}

#[async_trait]
impl RemoteStore for FirebaseStore {
    async fn create_record(&self, collection: &str, fields: Fields) -> Result<RecordRef> {
        let resp = Self::send(self.request(reqwest::Method::POST, collection).json(&fields)).await?;
        let push: PushResponse = resp.json().await.map_err(SprinklerError::remote)?;
        Ok(RecordRef::new(collection, push.name))
    }

    async fn update(&self, record: &RecordRef, fields: Fields) -> Result<()> {
        Self::send(
            self.request(reqwest::Method::PATCH, &record.path())
                .json(&fields),
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, record: &RecordRef) -> Result<()> {
        Self::send(self.request(reqwest::Method::DELETE, &record.path())).await?;
        Ok(())
    }

    async fn remove_collection(&self, collection: &str) -> Result<()> {
        Self::send(self.request(reqwest::Method::DELETE, collection)).await?;
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<mpsc::UnboundedReceiver<ChildChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let collection = collection.to_string();
        tokio::spawn(async move {
            let mut cache = CollectionCache::default();
            while !tx.is_closed() {
                match store.stream_once(&collection, &mut cache, &tx).await {
                    Ok(()) => info!(collection = %collection, "event stream closed by server"),
                    Err(e) => warn!(collection = %collection, error = %e, "event stream failed"),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            debug!(collection = %collection, "subscriber gone, stopping event stream");
        });
        Ok(rx)
    }
}

impl FirebaseStore {
    async fn stream_once(
        &self,
        collection: &str,
        cache: &mut CollectionCache,
        tx: &mpsc::UnboundedSender<ChildChange>,
    ) -> Result<()> {
        let resp = Self::send(
            self.request(reqwest::Method::GET, collection)
                .header(reqwest::header::ACCEPT, "text/event-stream"),
        )
        .await?;
        info!(collection = %collection, "event stream connected");

        let mut body = resp.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(SprinklerError::remote)?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            // Normalise CRLF so block splitting works for any server.
            if buffer.contains('\r') {
                buffer = buffer.replace("\r\n", "\n");
            }
            while let Some(end) = buffer.find("\n\n") {
                let block: String = buffer.drain(..end + 2).collect();
                let Some(event) = parse_sse_block(&block) else {
                    continue;
                };
                match event.event.as_str() {
                    "put" | "patch" => {
                        let payload: StreamPayload = serde_json::from_str(&event.data)?;
                        let patch = event.event == "patch";
                        for key in cache.apply(patch, &payload.path, payload.data) {
                            if let Some(value) = cache.get(&key) {
                                let change = ChildChange {
                                    record: RecordRef::new(collection, key),
                                    value: value.clone(),
                                };
                                if tx.send(change).is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    "keep-alive" => {}
                    "cancel" | "auth_revoked" => {
                        return Err(SprinklerError::RemoteStore(format!(
                            "event stream {}: {}",
                            event.event, event.data
                        )));
                    }
                    other => debug!(event = other, "ignoring unknown stream event"),
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Parse one `\n\n`-terminated SSE block. Blocks without an `event:` line
/// are ignored.
pub(crate) fn parse_sse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if let Some(v) = line.strip_prefix("event:") {
            event = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("data:") {
            data.push(v.strip_prefix(' ').unwrap_or(v));
        }
    }
    Some(SseEvent {
        event: event?,
        data: data.join("\n"),
    })
}

// ---------------------------------------------------------------------------
// CollectionCache
// ---------------------------------------------------------------------------

/// Local copy of a watched collection, keyed by child key.
#[derive(Debug, Default)]
pub(crate) struct CollectionCache {
    children: HashMap<String, serde_json::Value>,
}

impl CollectionCache {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.children.get(key)
    }

    /// Apply a `put` (or `patch` when `patch` is set) at `path` and return
    /// the keys of pre-existing children that changed.
    pub fn apply(&mut self, patch: bool, path: &str, data: serde_json::Value) -> Vec<String> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((key, rest)) = segments.split_first() else {
            return self.apply_root(patch, data);
        };
        let key = (*key).to_string();
        let existed = self.children.contains_key(&key);

        if rest.is_empty() && !patch && data.is_null() {
            self.children.remove(&key);
            return Vec::new();
        }

        let child = self
            .children
            .entry(key.clone())
            .or_insert(serde_json::Value::Null);
        let target = descend(child, rest);
        match (patch, data) {
            (true, serde_json::Value::Object(map)) => merge_fields(target, &map),
            (_, data) => *target = data,
        }

        if existed {
            vec![key]
        } else {
            Vec::new()
        }
    }

    fn apply_root(&mut self, patch: bool, data: serde_json::Value) -> Vec<String> {
        let serde_json::Value::Object(map) = data else {
            if !patch {
                self.children.clear();
            }
            return Vec::new();
        };
        if !patch {
            // Whole collection replaced: initial snapshot or a reset.
            self.children = map.into_iter().filter(|(_, v)| !v.is_null()).collect();
            return Vec::new();
        }
        let mut changed = Vec::new();
        for (key, value) in map {
            let existed = self.children.contains_key(&key);
            if value.is_null() {
                self.children.remove(&key);
                continue;
            }
            self.children.insert(key.clone(), value);
            if existed {
                changed.push(key);
            }
        }
        changed
    }
}

/// Walk `path` below `value`, creating objects along the way.
fn descend<'a>(value: &'a mut serde_json::Value, path: &[&str]) -> &'a mut serde_json::Value {
    let mut current = value;
    for segment in path {
        if !current.is_object() {
            *current = serde_json::Value::Object(Fields::new());
        }
        let serde_json::Value::Object(map) = current else {
            unreachable!("current was just made an object");
        };
        current = map
            .entry((*segment).to_string())
            .or_insert(serde_json::Value::Null);
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fields;
    use mockito::Matcher;
    use serde_json::json;

    #[test]
    fn parses_event_blocks() {
        let block = "event: put\ndata: {\"path\":\"/\",\"data\":null}\n\n";
        assert_eq!(
            parse_sse_block(block),
            Some(SseEvent {
                event: "put".into(),
                data: "{\"path\":\"/\",\"data\":null}".into(),
            })
        );
        assert_eq!(parse_sse_block(": comment\n\n"), None);
    }

    #[test]
    fn cache_reports_only_changed_existing_children() {
        let mut cache = CollectionCache::default();
        let initial = json!({"-a": {"id": 1, "state": "off"}});
        assert!(cache.apply(false, "/", initial).is_empty());

        // New child: an add, not a change.
        assert!(cache.apply(false, "/-b", json!({"id": 2})).is_empty());

        assert_eq!(cache.apply(false, "/-a/state", json!("on")), vec!["-a"]);
        assert_eq!(cache.get("-a").unwrap(), &json!({"id": 1, "state": "on"}));

        assert_eq!(
            cache.apply(true, "/-b", json!({"state": "activating"})),
            vec!["-b"]
        );
        assert_eq!(
            cache.get("-b").unwrap(),
            &json!({"id": 2, "state": "activating"})
        );

        assert!(cache.apply(false, "/-b", serde_json::Value::Null).is_empty());
        assert!(cache.get("-b").is_none());
    }

    #[test]
    fn root_patch_replaces_children() {
        let mut cache = CollectionCache::default();
        cache.apply(false, "/", json!({"-a": {"state": "off"}}));
        let changed = cache.apply(true, "/", json!({"-a": {"state": "on"}, "-c": {"x": 1}}));
        assert_eq!(changed, vec!["-a"]);
        assert!(cache.get("-c").is_some());
    }

    #[tokio::test]
    async fn create_posts_to_collection_with_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/dev_sprinklers.json")
            .match_query(Matcher::UrlEncoded("auth".into(), "secret".into()))
            .match_body(Matcher::Json(json!({"id": 1, "state": "off"})))
            .with_status(200)
            .with_body(r#"{"name":"-Nabc"}"#)
            .create_async()
            .await;

        let store = FirebaseStore::new(format!("{}/", server.url()), Some("secret".into()));
        let record = store
            .create_record("dev_sprinklers", fields(json!({"id": 1, "state": "off"})))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(record, RecordRef::new("dev_sprinklers", "-Nabc"));
    }

    #[tokio::test]
    async fn update_patches_record_path() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/dev_sprinklers/-Nabc.json")
            .match_body(Matcher::Json(json!({"state": "on"})))
            .with_status(200)
            .with_body(r#"{"state":"on"}"#)
            .create_async()
            .await;

        let store = FirebaseStore::new(server.url(), None);
        store
            .update(
                &RecordRef::new("dev_sprinklers", "-Nabc"),
                fields(json!({"state": "on"})),
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_become_remote_store_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("DELETE", "/scenarios.json")
            .with_status(401)
            .create_async()
            .await;

        let store = FirebaseStore::new(server.url(), None);
        let err = store.remove_collection("scenarios").await.unwrap_err();
        assert!(matches!(err, SprinklerError::RemoteStore(_)));
    }

    #[tokio::test]
    async fn subscribe_turns_stream_events_into_child_changes() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "event: put\n",
            "data: {\"path\":\"/\",\"data\":{\"-a\":{\"id\":1,\"state\":\"off\"}}}\n\n",
            "event: keep-alive\n",
            "data: null\n\n",
            "event: put\n",
            "data: {\"path\":\"/-a/state\",\"data\":\"on\"}\n\n",
        );
        let _mock = server
            .mock("GET", "/dev_sprinklers.json")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let store = FirebaseStore::new(server.url(), None);
        let mut rx = store.subscribe("dev_sprinklers").await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.record, RecordRef::new("dev_sprinklers", "-a"));
        assert_eq!(change.value, json!({"id": 1, "state": "on"}));
    }
}
