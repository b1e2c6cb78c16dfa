//! Trello adapter
//!
//! Cards live in board lists, so a status is a list id and a status change
//! is a card move. Priorities are board label ids. Requests authenticate
//! with the application key plus the member's token.

use super::http::ProviderHttp;
use super::{
    connection_check, ConnectionCheck, CreatedItem, ExternalItem, ItemPatch, NamedRef, NewItem,
    ProviderAdapter, StatusChange, UpdateOutcome,
};
use crate::config::ProviderSettings;
use crate::domain::ProviderType;
use crate::integration::{BoardTarget, ProviderConfig};
use crate::vault::AccessToken;
use crate::{BridgeError, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const CARD_FIELDS: &str = "name,desc,idList,idLabels,idBoard,shortUrl,url";

#[derive(Debug, Clone)]
pub struct TrelloAdapter {
    http: ProviderHttp,
    api_base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrelloNamed {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TrelloCard {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    desc: String,
    #[serde(rename = "idList", default)]
    id_list: String,
    #[serde(rename = "idLabels", default)]
    id_labels: Vec<String>,
    #[serde(rename = "shortUrl", default)]
    short_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl TrelloCard {
    fn link(&self) -> Option<String> {
        self.short_url.clone().or_else(|| self.url.clone())
    }
}

#[derive(Debug, Deserialize)]
struct Member {
    username: String,
    #[serde(rename = "fullName", default)]
    full_name: Option<String>,
}

impl TrelloAdapter {
    pub fn new(http: ProviderHttp, api_base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// The application key is the board provider's `client_id`
    pub fn from_settings(settings: &ProviderSettings, timeout: Duration) -> Result<Self> {
        let http = ProviderHttp::new(ProviderType::Board, timeout, settings.requests_per_second)?;
        Ok(Self::new(
            http,
            settings.api_base_url(ProviderType::Board),
            settings.client_id.clone(),
        ))
    }

    fn authorized(&self, method: Method, path: &str, token: &AccessToken) -> Result<RequestBuilder> {
        let key = self.api_key.as_deref().ok_or_else(|| {
            BridgeError::not_configured("Trello API key missing (set providers.board.client_id)")
        })?;
        let url = format!("{}{}", self.api_base_url, path);

        Ok(self.http.request(method, &url).header(
            "Authorization",
            format!(
                "OAuth oauth_consumer_key=\"{}\", oauth_token=\"{}\"",
                key,
                token.secret()
            ),
        ))
    }

    async fn board_lists(&self, token: &AccessToken, board_id: &str) -> Result<Vec<TrelloNamed>> {
        let path = format!("/boards/{}/lists", urlencoding::encode(board_id));
        self.http
            .send_json(
                self.authorized(Method::GET, &path, token)?
                    .query(&[("filter", "open"), ("fields", "name")]),
            )
            .await
    }

    async fn fetch_card(&self, token: &AccessToken, card_id: &str) -> Result<(TrelloCard, Value)> {
        let path = format!("/cards/{}", urlencoding::encode(card_id));
        debug!(card = %card_id, "Fetching Trello card");

        let raw: Value = self
            .http
            .send_json(self.authorized(Method::GET, &path, token)?.query(&[("fields", CARD_FIELDS)]))
            .await?;
        let card = serde_json::from_value(raw.clone())?;
        Ok((card, raw))
    }

    /// List for a new card: the mapped list if it is on the board, else the
    /// configured default, else the board's first open list
    async fn resolve_create_list(
        &self,
        token: &AccessToken,
        target: &BoardTarget,
        mapped: Option<&str>,
    ) -> Result<String> {
        let lists = self.board_lists(token, &target.board_id).await?;

        if let Some(wanted) = mapped {
            if lists.iter().any(|l| l.id == wanted) {
                return Ok(wanted.to_string());
            }
            warn!(board = %target.board_id, list = %wanted, "Mapped list is not on the board, using the default list");
        }

        target
            .default_list_id
            .clone()
            .or_else(|| lists.into_iter().next().map(|l| l.id))
            .ok_or_else(|| {
                BridgeError::not_configured(format!(
                    "board {} has no open list for new cards",
                    target.board_id
                ))
            })
    }

    async fn sync_priority_label(
        &self,
        token: &AccessToken,
        card: &TrelloCard,
        wanted: &str,
        known: &[String],
    ) -> Result<()> {
        let labels_path = format!("/cards/{}/idLabels", urlencoding::encode(&card.id));

        if !card.id_labels.iter().any(|l| l == wanted) {
            self.http
                .send_empty(
                    self.authorized(Method::POST, &labels_path, token)?
                        .query(&[("value", wanted)]),
                )
                .await?;
        }

        for stale in card
            .id_labels
            .iter()
            .filter(|l| l.as_str() != wanted && known.contains(l))
        {
            let path = format!("{}/{}", labels_path, urlencoding::encode(stale));
            self.http
                .send_empty(self.authorized(Method::DELETE, &path, token)?)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for TrelloAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Board
    }

    async fn list_projects(&self, token: &AccessToken, _config: &ProviderConfig) -> Result<Vec<NamedRef>> {
        let boards: Vec<TrelloNamed> = self
            .http
            .send_json(
                self.authorized(Method::GET, "/members/me/boards", token)?
                    .query(&[("filter", "open"), ("fields", "name")]),
            )
            .await?;

        Ok(boards.into_iter().map(|b| NamedRef::new(b.id, b.name)).collect())
    }

    async fn list_categories(
        &self,
        token: &AccessToken,
        _config: &ProviderConfig,
        project_id: &str,
    ) -> Result<Vec<NamedRef>> {
        Ok(self
            .board_lists(token, project_id)
            .await?
            .into_iter()
            .map(|l| NamedRef::new(l.id, l.name))
            .collect())
    }

    async fn create_item(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        item: &NewItem,
    ) -> Result<CreatedItem> {
        let target = config.as_board()?;
        let list_id = self
            .resolve_create_list(token, target, item.mapped_status.as_deref())
            .await?;

        let labels: Vec<&String> = item.mapped_priority.iter().chain(item.mapped_labels.iter()).collect();
        let body = json!({
            "idList": list_id,
            "name": item.title,
            "desc": item.description.clone().unwrap_or_default(),
            "idLabels": labels,
        });

        let card: TrelloCard = self
            .http
            .send_json(self.authorized(Method::POST, "/cards", token)?.json(&body))
            .await?;
        info!(card = %card.id, list = %list_id, "Created Trello card");

        Ok(CreatedItem {
            url: card.link(),
            external_id: card.id,
        })
    }

    async fn update_item(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        external_id: &str,
        patch: &ItemPatch,
    ) -> Result<UpdateOutcome> {
        let target = config.as_board()?;
        let card_path = format!("/cards/{}", urlencoding::encode(external_id));

        let mut fields = Map::new();
        if let Some(ref title) = patch.title {
            fields.insert("name".into(), json!(title));
        }
        if let Some(ref description) = patch.description {
            fields.insert("desc".into(), json!(description));
        }
        if !fields.is_empty() {
            self.http
                .send_empty(self.authorized(Method::PUT, &card_path, token)?.json(&fields))
                .await?;
        }

        if patch.mapped_priority.is_none() && patch.mapped_status.is_none() {
            return Ok(UpdateOutcome {
                fields_updated: !fields.is_empty(),
                status: StatusChange::NotRequested,
            });
        }

        let (card, _) = self.fetch_card(token, external_id).await?;
        if let Some(ref priority) = patch.mapped_priority {
            self.sync_priority_label(token, &card, priority, &patch.known_priorities)
                .await?;
        }
        let fields_updated = !fields.is_empty() || patch.mapped_priority.is_some();
        if fields_updated {
            info!(card = %external_id, "Updated Trello card");
        }

        let status = match patch.mapped_status {
            None => StatusChange::NotRequested,
            Some(ref wanted) if card.id_list == *wanted => StatusChange::Unchanged,
            Some(ref wanted) => {
                let lists = self.board_lists(token, &target.board_id).await?;
                if lists.iter().any(|l| l.id == *wanted) {
                    self.http
                        .send_empty(
                            self.authorized(Method::PUT, &card_path, token)?
                                .json(&json!({"idList": wanted})),
                        )
                        .await?;
                    info!(card = %external_id, list = %wanted, "Moved Trello card");
                    StatusChange::Applied { to: wanted.clone() }
                } else {
                    let reason = format!("list {} is not an open list on board {}", wanted, target.board_id);
                    warn!(card = %external_id, "Skipping Trello card move: {}", reason);
                    StatusChange::Skipped {
                        requested: wanted.clone(),
                        reason,
                    }
                }
            }
        };

        Ok(UpdateOutcome {
            fields_updated,
            status,
        })
    }

    async fn get_item(
        &self,
        token: &AccessToken,
        _config: &ProviderConfig,
        external_id: &str,
    ) -> Result<ExternalItem> {
        let (card, raw) = self.fetch_card(token, external_id).await?;

        Ok(ExternalItem {
            url: card.link(),
            external_id: card.id,
            title: card.name,
            description: card.desc,
            mapped_status: Some(card.id_list).filter(|l| !l.is_empty()),
            status_aliases: Vec::new(),
            mapped_priority: None,
            labels: card.id_labels,
            raw,
        })
    }

    async fn test_connection(&self, token: &AccessToken, _config: &ProviderConfig) -> Result<ConnectionCheck> {
        let request = self.authorized(Method::GET, "/members/me", token)?;
        let identity = self
            .http
            .send_json::<Member>(request.query(&[("fields", "username,fullName")]))
            .await
            .map(|me| match me.full_name {
                Some(name) if !name.is_empty() => format!("{} (@{})", name, me.username),
                _ => format!("@{}", me.username),
            });

        connection_check(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const AUTH: &str = "OAuth oauth_consumer_key=\"app-key\", oauth_token=\"member-token\"";

    fn adapter(server: &MockServer) -> TrelloAdapter {
        let http = ProviderHttp::new(ProviderType::Board, Duration::from_secs(2), 100).unwrap();
        TrelloAdapter::new(http, server.base_url(), Some("app-key".to_string()))
    }

    fn config(default_list: Option<&str>) -> ProviderConfig {
        ProviderConfig::Board(BoardTarget {
            board_id: "board1".to_string(),
            default_list_id: default_list.map(str::to_string),
        })
    }

    fn token() -> AccessToken {
        AccessToken::new("member-token", None)
    }

    async fn mock_lists(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/boards/board1/lists");
                then.status(200).json_body(json!([
                    {"id": "list1", "name": "Open"},
                    {"id": "list2", "name": "Resolved"}
                ]));
            })
            .await;
    }

    #[tokio::test]
    async fn test_create_card_in_mapped_list() {
        let server = MockServer::start_async().await;
        mock_lists(&server).await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/cards")
                    .header("authorization", AUTH)
                    .json_body(json!({
                        "idList": "list2",
                        "name": "Broken export",
                        "desc": "CSV is empty",
                        "idLabels": ["label-high"]
                    }));
                then.status(200).json_body(json!({
                    "id": "card9",
                    "idList": "list2",
                    "shortUrl": "https://trello.com/c/abc"
                }));
            })
            .await;

        let item = NewItem {
            title: "Broken export".into(),
            description: Some("CSV is empty".into()),
            mapped_priority: Some("label-high".into()),
            mapped_status: Some("list2".into()),
            ..Default::default()
        };
        let created = adapter(&server).create_item(&token(), &config(None), &item).await.unwrap();

        create.assert_async().await;
        assert_eq!(created.external_id, "card9");
        assert_eq!(created.url.as_deref(), Some("https://trello.com/c/abc"));
    }

    #[tokio::test]
    async fn test_create_falls_back_to_default_list() {
        let server = MockServer::start_async().await;
        mock_lists(&server).await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST).path("/cards").json_body_partial(r#"{"idList": "list1"}"#);
                then.status(200).json_body(json!({"id": "card10", "idList": "list1"}));
            })
            .await;

        let item = NewItem {
            title: "Typo".into(),
            mapped_status: Some("other-board-list".into()),
            ..Default::default()
        };
        adapter(&server)
            .create_item(&token(), &config(Some("list1")), &item)
            .await
            .unwrap();
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_moves_card_and_swaps_priority_label() {
        let server = MockServer::start_async().await;
        mock_lists(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/cards/card9");
                then.status(200).json_body(json!({
                    "id": "card9",
                    "idList": "list1",
                    "idLabels": ["label-high", "label-ui"]
                }));
            })
            .await;
        let add_label = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/cards/card9/idLabels")
                    .query_param("value", "label-low");
                then.status(200).json_body(json!(["label-low"]));
            })
            .await;
        let remove_label = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/cards/card9/idLabels/label-high");
                then.status(200).json_body(json!({}));
            })
            .await;
        let rename = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/cards/card9")
                    .json_body(json!({"name": "Renamed"}));
                then.status(200).json_body(json!({"id": "card9"}));
            })
            .await;
        let moved = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/cards/card9")
                    .json_body(json!({"idList": "list2"}));
                then.status(200).json_body(json!({"id": "card9"}));
            })
            .await;

        let patch = ItemPatch {
            title: Some("Renamed".into()),
            mapped_priority: Some("label-low".into()),
            known_priorities: vec!["label-high".into(), "label-low".into()],
            mapped_status: Some("list2".into()),
            ..Default::default()
        };
        let outcome = adapter(&server)
            .update_item(&token(), &config(None), "card9", &patch)
            .await
            .unwrap();

        rename.assert_async().await;
        add_label.assert_async().await;
        remove_label.assert_async().await;
        moved.assert_async().await;
        assert!(outcome.fields_updated);
        assert_eq!(outcome.status, StatusChange::Applied { to: "list2".into() });
    }

    #[tokio::test]
    async fn test_update_to_foreign_list_is_skipped() {
        let server = MockServer::start_async().await;
        mock_lists(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/cards/card9");
                then.status(200).json_body(json!({"id": "card9", "idList": "list2", "idLabels": []}));
            })
            .await;

        let patch = ItemPatch {
            mapped_status: Some("archived-list".into()),
            ..Default::default()
        };
        let outcome = adapter(&server)
            .update_item(&token(), &config(None), "card9", &patch)
            .await
            .unwrap();
        assert!(matches!(outcome.status, StatusChange::Skipped { .. }));
        assert!(!outcome.fields_updated);
    }

    #[tokio::test]
    async fn test_get_item_reports_list_and_labels() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/cards/card9");
                then.status(200).json_body(json!({
                    "id": "card9",
                    "name": "Broken export",
                    "desc": "CSV is empty",
                    "idList": "list2",
                    "idLabels": ["label-high"],
                    "url": "https://trello.com/c/abc/1-broken-export"
                }));
            })
            .await;

        let item = adapter(&server).get_item(&token(), &config(None), "card9").await.unwrap();
        assert_eq!(item.mapped_status.as_deref(), Some("list2"));
        assert_eq!(item.mapped_priority, None);
        assert_eq!(item.labels, vec!["label-high".to_string()]);
        assert_eq!(item.url.as_deref(), Some("https://trello.com/c/abc/1-broken-export"));
    }

    #[tokio::test]
    async fn test_connection_identity() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/members/me").header("authorization", AUTH);
                then.status(200).json_body(json!({"username": "ada", "fullName": "Ada L"}));
            })
            .await;

        let check = adapter(&server).test_connection(&token(), &config(None)).await.unwrap();
        assert_eq!(
            check,
            ConnectionCheck::Ok {
                identity_label: "Ada L (@ada)".into()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_api_key_is_not_configured() {
        let server = MockServer::start_async().await;
        let http = ProviderHttp::new(ProviderType::Board, Duration::from_secs(2), 100).unwrap();
        let adapter = TrelloAdapter::new(http, server.base_url(), None);
        let err = adapter.list_projects(&token(), &config(None)).await.unwrap_err();
        assert!(matches!(err, BridgeError::IntegrationNotConfigured(_)));
    }
}
