//! Azure DevOps Boards adapter
//!
//! Work items are written with JSON Patch documents. Status is the
//! `System.State` field, validated against the states of the item's type
//! before it is set. Descriptions are HTML.

use super::http::ProviderHttp;
use super::rich_text::{html_to_text, text_to_html};
use super::{
    connection_check, ConnectionCheck, CreatedItem, ExternalItem, ItemPatch, NamedRef, NewItem,
    ProviderAdapter, StatusChange, UpdateOutcome,
};
use crate::config::ProviderSettings;
use crate::domain::ProviderType;
use crate::integration::{ProviderConfig, WorkItemTarget};
use crate::vault::AccessToken;
use crate::Result;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const API_VERSION: &str = "7.1";
const PROJECT_PAGE_SIZE: &str = "100";
const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";
const JSON_PATCH: &str = "application/json-patch+json";

const FIELD_TITLE: &str = "System.Title";
const FIELD_DESCRIPTION: &str = "System.Description";
const FIELD_STATE: &str = "System.State";
const FIELD_TYPE: &str = "System.WorkItemType";
const FIELD_TAGS: &str = "System.Tags";
const FIELD_PRIORITY: &str = "Microsoft.VSTS.Common.Priority";

#[derive(Debug, Clone)]
pub struct AzureDevOpsAdapter {
    http: ProviderHttp,
    api_base_url: String,
    /// Profile service host (the OAuth host)
    profile_base_url: String,
}

#[derive(Debug, Serialize)]
struct PatchOp {
    op: &'static str,
    path: String,
    value: Value,
}

impl PatchOp {
    fn set(field: &str, value: Value) -> Self {
        Self {
            op: "add",
            path: format!("/fields/{}", field),
            value,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValueList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct AdoProject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AdoWorkItemType {
    name: String,
    #[serde(rename = "isDisabled", default)]
    is_disabled: bool,
}

#[derive(Debug, Deserialize)]
struct AdoState {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AdoWorkItem {
    id: i64,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(rename = "_links", default)]
    links: Option<Value>,
}

impl AdoWorkItem {
    fn text(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    fn html_link(&self) -> Option<String> {
        self.links
            .as_ref()?
            .pointer("/html/href")?
            .as_str()
            .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(rename = "emailAddress", default)]
    email: Option<String>,
}

/// Priority is numeric on the wire when it parses as one
fn priority_value(mapped: &str) -> Value {
    mapped
        .trim()
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(mapped))
}

fn split_tags(tags: &str) -> Vec<String> {
    tags.split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

impl AzureDevOpsAdapter {
    pub fn new(
        http: ProviderHttp,
        api_base_url: impl Into<String>,
        profile_base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            profile_base_url: profile_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_settings(settings: &ProviderSettings, timeout: Duration) -> Result<Self> {
        let http = ProviderHttp::new(ProviderType::WorkItem, timeout, settings.requests_per_second)?;
        Ok(Self::new(
            http,
            settings.api_base_url(ProviderType::WorkItem),
            settings.auth_base_url(ProviderType::WorkItem),
        ))
    }

    fn org_url(&self, target: &WorkItemTarget) -> String {
        format!(
            "{}/{}",
            self.api_base_url,
            urlencoding::encode(&target.organization)
        )
    }

    fn project_url(&self, target: &WorkItemTarget) -> String {
        format!(
            "{}/{}",
            self.org_url(target),
            urlencoding::encode(&target.project)
        )
    }

    fn edit_url(&self, target: &WorkItemTarget, id: i64) -> String {
        format!("{}/_workitems/edit/{}", self.project_url(target), id)
    }

    async fn patch_work_item(
        &self,
        token: &AccessToken,
        method: Method,
        url: &str,
        ops: &[PatchOp],
    ) -> Result<AdoWorkItem> {
        self.http
            .send_json(
                self.http
                    .request(method, url)
                    .bearer_auth(token.secret())
                    .query(&[("api-version", API_VERSION)])
                    .header(CONTENT_TYPE, JSON_PATCH)
                    .body(serde_json::to_vec(ops)?),
            )
            .await
    }

    async fn fetch_work_item(
        &self,
        token: &AccessToken,
        target: &WorkItemTarget,
        id: &str,
        fields: Option<&str>,
    ) -> Result<(AdoWorkItem, Value)> {
        let url = format!(
            "{}/_apis/wit/workitems/{}",
            self.project_url(target),
            urlencoding::encode(id)
        );
        debug!(id = %id, "Fetching Azure DevOps work item");

        let mut request = self
            .http
            .request(Method::GET, &url)
            .bearer_auth(token.secret())
            .query(&[("api-version", API_VERSION)]);
        request = match fields {
            Some(fields) => request.query(&[("fields", fields)]),
            None => request.query(&[("$expand", "links")]),
        };

        let raw: Value = self.http.send_json(request).await?;
        let item = serde_json::from_value(raw.clone())?;
        Ok((item, raw))
    }

    /// Set `System.State` if the item's type defines the requested state
    async fn apply_status(
        &self,
        token: &AccessToken,
        target: &WorkItemTarget,
        id: &str,
        wanted: &str,
    ) -> Result<StatusChange> {
        let fields = format!("{},{}", FIELD_STATE, FIELD_TYPE);
        let (item, _) = self.fetch_work_item(token, target, id, Some(&fields)).await?;

        let current = item.text(FIELD_STATE).unwrap_or_default();
        if current.eq_ignore_ascii_case(wanted) {
            return Ok(StatusChange::Unchanged);
        }

        let item_type = item
            .text(FIELD_TYPE)
            .unwrap_or_else(|| target.work_item_type.clone());
        let url = format!(
            "{}/_apis/wit/workitemtypes/{}/states",
            self.project_url(target),
            urlencoding::encode(&item_type)
        );
        let states: ValueList<AdoState> = self
            .http
            .send_json(
                self.http
                    .request(Method::GET, &url)
                    .bearer_auth(token.secret())
                    .query(&[("api-version", API_VERSION)]),
            )
            .await?;

        let Some(state) = states.value.iter().find(|s| s.name.eq_ignore_ascii_case(wanted)) else {
            let reason = format!("'{}' is not a state of work item type '{}'", wanted, item_type);
            warn!(id = %id, "Skipping Azure DevOps state change: {}", reason);
            return Ok(StatusChange::Skipped {
                requested: wanted.to_string(),
                reason,
            });
        };

        let url = format!(
            "{}/_apis/wit/workitems/{}",
            self.project_url(target),
            urlencoding::encode(id)
        );
        self.patch_work_item(
            token,
            Method::PATCH,
            &url,
            &[PatchOp::set(FIELD_STATE, json!(state.name))],
        )
        .await?;
        info!(id = %id, from = %current, to = %state.name, "Changed Azure DevOps work item state");

        Ok(StatusChange::Applied {
            to: state.name.clone(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for AzureDevOpsAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::WorkItem
    }

    async fn list_projects(&self, token: &AccessToken, config: &ProviderConfig) -> Result<Vec<NamedRef>> {
        let target = config.as_work_item()?;
        let url = format!("{}/_apis/projects", self.org_url(target));

        let mut projects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .http
                .request(Method::GET, &url)
                .bearer_auth(token.secret())
                .query(&[("api-version", API_VERSION), ("$top", PROJECT_PAGE_SIZE)]);
            if let Some(ref cursor) = continuation {
                request = request.query(&[("continuationToken", cursor)]);
            }

            let response = self.http.send(request).await?;
            let next = response
                .headers()
                .get(CONTINUATION_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            let page: ValueList<AdoProject> = self.http.decode(response).await?;

            // Project names are the path segment used everywhere else
            projects.extend(page.value.into_iter().map(|p| NamedRef::new(p.name.clone(), p.name)));
            match next {
                Some(cursor) if continuation.as_deref() != Some(cursor.as_str()) => {
                    continuation = Some(cursor)
                }
                _ => break,
            }
        }

        debug!(count = projects.len(), "Listed Azure DevOps projects");
        Ok(projects)
    }

    async fn list_categories(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        project_id: &str,
    ) -> Result<Vec<NamedRef>> {
        let target = config.as_work_item()?;
        let url = format!(
            "{}/{}/_apis/wit/workitemtypes",
            self.org_url(target),
            urlencoding::encode(project_id)
        );

        let types: ValueList<AdoWorkItemType> = self
            .http
            .send_json(
                self.http
                    .request(Method::GET, &url)
                    .bearer_auth(token.secret())
                    .query(&[("api-version", API_VERSION)]),
            )
            .await?;

        Ok(types
            .value
            .into_iter()
            .filter(|t| !t.is_disabled)
            .map(|t| NamedRef::new(t.name.clone(), t.name))
            .collect())
    }

    async fn create_item(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        item: &NewItem,
    ) -> Result<CreatedItem> {
        let target = config.as_work_item()?;

        let mut ops = vec![PatchOp::set(FIELD_TITLE, json!(item.title))];
        if let Some(ref description) = item.description {
            ops.push(PatchOp::set(FIELD_DESCRIPTION, json!(text_to_html(description))));
        }
        if let Some(ref priority) = item.mapped_priority {
            ops.push(PatchOp::set(FIELD_PRIORITY, priority_value(priority)));
        }
        if !item.mapped_labels.is_empty() {
            ops.push(PatchOp::set(FIELD_TAGS, json!(item.mapped_labels.join("; "))));
        }

        let url = format!(
            "{}/_apis/wit/workitems/${}",
            self.project_url(target),
            urlencoding::encode(&target.work_item_type)
        );
        let created = self.patch_work_item(token, Method::POST, &url, &ops).await?;
        let external_id = created.id.to_string();
        info!(id = %external_id, project = %target.project, "Created Azure DevOps work item");

        // New items start in the type's initial state; move afterwards
        if let Some(ref status) = item.mapped_status {
            if let Err(e) = self.apply_status(token, target, &external_id, status).await {
                warn!(id = %external_id, error = %e, "Created Azure DevOps work item but could not set its state");
            }
        }

        Ok(CreatedItem {
            url: Some(
                created
                    .html_link()
                    .unwrap_or_else(|| self.edit_url(target, created.id)),
            ),
            external_id,
        })
    }

    async fn update_item(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        external_id: &str,
        patch: &ItemPatch,
    ) -> Result<UpdateOutcome> {
        let target = config.as_work_item()?;

        let mut ops = Vec::new();
        if let Some(ref title) = patch.title {
            ops.push(PatchOp::set(FIELD_TITLE, json!(title)));
        }
        if let Some(ref description) = patch.description {
            ops.push(PatchOp::set(FIELD_DESCRIPTION, json!(text_to_html(description))));
        }
        if let Some(ref priority) = patch.mapped_priority {
            ops.push(PatchOp::set(FIELD_PRIORITY, priority_value(priority)));
        }

        let fields_updated = !ops.is_empty();
        if fields_updated {
            let url = format!(
                "{}/_apis/wit/workitems/{}",
                self.project_url(target),
                urlencoding::encode(external_id)
            );
            self.patch_work_item(token, Method::PATCH, &url, &ops).await?;
            info!(id = %external_id, fields = ops.len(), "Updated Azure DevOps work item");
        }

        let status = match patch.mapped_status {
            Some(ref wanted) => self.apply_status(token, target, external_id, wanted).await?,
            None => StatusChange::NotRequested,
        };

        Ok(UpdateOutcome {
            fields_updated,
            status,
        })
    }

    async fn get_item(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        external_id: &str,
    ) -> Result<ExternalItem> {
        let target = config.as_work_item()?;
        let (item, raw) = self.fetch_work_item(token, target, external_id, None).await?;

        Ok(ExternalItem {
            external_id: item.id.to_string(),
            title: item.text(FIELD_TITLE).unwrap_or_default(),
            description: item
                .text(FIELD_DESCRIPTION)
                .map(|html| html_to_text(&html))
                .unwrap_or_default(),
            mapped_status: item.text(FIELD_STATE),
            status_aliases: Vec::new(),
            mapped_priority: item.text(FIELD_PRIORITY),
            labels: item.text(FIELD_TAGS).map(|t| split_tags(&t)).unwrap_or_default(),
            url: Some(item.html_link().unwrap_or_else(|| self.edit_url(target, item.id))),
            raw,
        })
    }

    async fn test_connection(&self, token: &AccessToken, _config: &ProviderConfig) -> Result<ConnectionCheck> {
        let url = format!("{}/_apis/profile/profiles/me", self.profile_base_url);

        let identity = self
            .http
            .send_json::<Profile>(
                self.http
                    .request(Method::GET, &url)
                    .bearer_auth(token.secret())
                    .query(&[("api-version", API_VERSION)]),
            )
            .await
            .map(|me| match me.email {
                Some(email) => format!("{} <{}>", me.display_name, email),
                None => me.display_name,
            });

        connection_check(identity)
    }
}
