//! Jira Cloud adapter
//!
//! Talks to the REST API v3 through the Atlassian API gateway
//! (`{api}/ex/jira/{cloud_id}/rest/api/3`) with an OAuth bearer token.
//! Mapped priorities are priority ids; mapped statuses are workflow status
//! names or ids.

use super::http::ProviderHttp;
use super::rich_text::{adf_to_text, text_to_adf};
use super::{
    connection_check, ConnectionCheck, CreatedItem, ExternalItem, ItemPatch, NamedRef, NewItem,
    ProviderAdapter, StatusChange, UpdateOutcome,
};
use crate::config::ProviderSettings;
use crate::domain::ProviderType;
use crate::integration::{IssueTrackerTarget, ProviderConfig};
use crate::vault::AccessToken;
use crate::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const PROJECT_PAGE_SIZE: u32 = 50;
const ISSUE_FIELDS: &str = "summary,description,status,priority,labels";

/// Jira Cloud REST client
#[derive(Debug, Clone)]
pub struct JiraAdapter {
    http: ProviderHttp,
    api_base_url: String,
}

#[derive(Debug, Deserialize)]
struct ProjectPage {
    #[serde(default)]
    values: Vec<JiraProject>,
    #[serde(rename = "isLast", default = "default_true")]
    is_last: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct JiraProject {
    key: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProjectDetail {
    #[serde(rename = "issueTypes", default)]
    issue_types: Vec<IssueType>,
}

#[derive(Debug, Deserialize)]
struct IssueType {
    id: String,
    name: String,
    #[serde(default)]
    subtask: bool,
}

#[derive(Debug, Deserialize)]
struct CreatedIssue {
    key: String,
}

#[derive(Debug, Deserialize)]
struct JiraIssue {
    key: String,
    fields: JiraFields,
}

#[derive(Debug, Deserialize)]
struct JiraFields {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    description: Value,
    #[serde(default)]
    status: Option<JiraNamed>,
    #[serde(default)]
    priority: Option<JiraNamed>,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct JiraNamed {
    #[serde(default)]
    id: Option<String>,
    name: String,
}

impl JiraNamed {
    fn matches(&self, wanted: &str) -> bool {
        self.name.eq_ignore_ascii_case(wanted) || self.id.as_deref() == Some(wanted)
    }
}

#[derive(Debug, Deserialize)]
struct TransitionsResponse {
    #[serde(default)]
    transitions: Vec<JiraTransition>,
}

#[derive(Debug, Deserialize)]
struct JiraTransition {
    id: String,
    to: JiraNamed,
}

#[derive(Debug, Deserialize)]
struct Myself {
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(rename = "emailAddress", default)]
    email: Option<String>,
}

impl JiraAdapter {
    pub fn new(http: ProviderHttp, api_base_url: impl Into<String>) -> Self {
        Self {
            http,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_settings(settings: &ProviderSettings, timeout: Duration) -> Result<Self> {
        let http = ProviderHttp::new(
            ProviderType::IssueTracker,
            timeout,
            settings.requests_per_second,
        )?;
        Ok(Self::new(
            http,
            settings.api_base_url(ProviderType::IssueTracker),
        ))
    }

    fn base_url(&self, target: &IssueTrackerTarget) -> String {
        format!(
            "{}/ex/jira/{}/rest/api/3",
            self.api_base_url,
            urlencoding::encode(&target.cloud_id)
        )
    }

    fn browse_url(target: &IssueTrackerTarget, key: &str) -> String {
        format!("{}/browse/{}", target.site_url.trim_end_matches('/'), key)
    }

    async fn fetch_issue(
        &self,
        token: &AccessToken,
        target: &IssueTrackerTarget,
        key: &str,
        fields: &str,
    ) -> Result<Value> {
        let url = format!("{}/issue/{}", self.base_url(target), urlencoding::encode(key));
        debug!(key = %key, "Fetching Jira issue");

        self.http
            .send_json(
                self.http
                    .request(Method::GET, &url)
                    .bearer_auth(token.secret())
                    .query(&[("fields", fields)]),
            )
            .await
    }

    /// Move the issue to the requested status through a workflow transition
    async fn apply_status(
        &self,
        token: &AccessToken,
        target: &IssueTrackerTarget,
        key: &str,
        wanted: &str,
    ) -> Result<StatusChange> {
        let raw = self.fetch_issue(token, target, key, "status").await?;
        let current: Option<JiraNamed> = raw
            .pointer("/fields/status")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        if current.as_ref().is_some_and(|s| s.matches(wanted)) {
            return Ok(StatusChange::Unchanged);
        }

        let url = format!(
            "{}/issue/{}/transitions",
            self.base_url(target),
            urlencoding::encode(key)
        );
        let available: TransitionsResponse = self
            .http
            .send_json(self.http.request(Method::GET, &url).bearer_auth(token.secret()))
            .await?;

        let Some(transition) = available.transitions.iter().find(|t| t.to.matches(wanted)) else {
            let reason = format!(
                "no workflow transition from '{}' to '{}'",
                current.map(|s| s.name).unwrap_or_default(),
                wanted
            );
            warn!(key = %key, status = %wanted, "Skipping Jira status change: {}", reason);
            return Ok(StatusChange::Skipped {
                requested: wanted.to_string(),
                reason,
            });
        };

        info!(key = %key, transition_id = %transition.id, to = %transition.to.name, "Transitioning Jira issue");
        self.http
            .send_empty(
                self.http
                    .request(Method::POST, &url)
                    .bearer_auth(token.secret())
                    .json(&json!({"transition": {"id": transition.id}})),
            )
            .await?;

        Ok(StatusChange::Applied {
            to: transition.to.name.clone(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for JiraAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::IssueTracker
    }

    async fn list_projects(&self, token: &AccessToken, config: &ProviderConfig) -> Result<Vec<NamedRef>> {
        let target = config.as_issue_tracker()?;
        let url = format!("{}/project/search", self.base_url(target));

        let mut projects = Vec::new();
        let mut start_at = 0u32;
        loop {
            let page: ProjectPage = self
                .http
                .send_json(
                    self.http
                        .request(Method::GET, &url)
                        .bearer_auth(token.secret())
                        .query(&[
                            ("startAt", start_at.to_string()),
                            ("maxResults", PROJECT_PAGE_SIZE.to_string()),
                        ]),
                )
                .await?;

            let fetched = page.values.len() as u32;
            projects.extend(page.values.into_iter().map(|p| NamedRef::new(p.key, p.name)));
            if page.is_last || fetched == 0 {
                break;
            }
            start_at += fetched;
        }

        debug!(count = projects.len(), "Listed Jira projects");
        Ok(projects)
    }

    async fn list_categories(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        project_id: &str,
    ) -> Result<Vec<NamedRef>> {
        let target = config.as_issue_tracker()?;
        let url = format!(
            "{}/project/{}",
            self.base_url(target),
            urlencoding::encode(project_id)
        );

        let project: ProjectDetail = self
            .http
            .send_json(self.http.request(Method::GET, &url).bearer_auth(token.secret()))
            .await?;

        Ok(project
            .issue_types
            .into_iter()
            .filter(|t| !t.subtask)
            .map(|t| NamedRef::new(t.id, t.name))
            .collect())
    }

    async fn create_item(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        item: &NewItem,
    ) -> Result<CreatedItem> {
        let target = config.as_issue_tracker()?;

        let mut fields = Map::new();
        fields.insert("project".into(), json!({"key": target.project_key}));
        fields.insert("issuetype".into(), json!({"id": target.issue_type_id}));
        fields.insert("summary".into(), json!(item.title));
        if let Some(ref description) = item.description {
            fields.insert("description".into(), text_to_adf(description));
        }
        if let Some(ref priority) = item.mapped_priority {
            fields.insert("priority".into(), json!({"id": priority}));
        }
        let labels: Vec<&String> = target.labels.iter().chain(item.mapped_labels.iter()).collect();
        if !labels.is_empty() {
            fields.insert("labels".into(), json!(labels));
        }

        let url = format!("{}/issue", self.base_url(target));
        let created: CreatedIssue = self
            .http
            .send_json(
                self.http
                    .request(Method::POST, &url)
                    .bearer_auth(token.secret())
                    .json(&json!({"fields": fields})),
            )
            .await?;
        info!(key = %created.key, project = %target.project_key, "Created Jira issue");

        // The issue exists now; a failed transition must not lose it
        if let Some(ref status) = item.mapped_status {
            match self.apply_status(token, target, &created.key, status).await {
                Ok(_) => {}
                Err(e) => warn!(key = %created.key, error = %e, "Created Jira issue but could not set its status"),
            }
        }

        Ok(CreatedItem {
            url: Some(Self::browse_url(target, &created.key)),
            external_id: created.key,
        })
    }

    async fn update_item(
        &self,
        token: &AccessToken,
        config: &ProviderConfig,
        external_id: &str,
        patch: &ItemPatch,
    ) -> Result<UpdateOutcome> {
        let target = config.as_issue_tracker()?;

        let mut fields = Map::new();
        if let Some(ref title) = patch.title {
            fields.insert("summary".into(), json!(title));
        }
        if let Some(ref description) = patch.description {
            fields.insert("description".into(), text_to_adf(description));
        }
        if let Some(ref priority) = patch.mapped_priority {
            fields.insert("priority".into(), json!({"id": priority}));
        }

        let fields_updated = !fields.is_empty();
        if fields_updated {
            let url = format!(
                "{}/issue/{}",
                self.base_url(target),
                urlencoding::encode(external_id)
            );
            self.http
                .send_empty(
                    self.http
                        .request(Method::PUT, &url)
                        .bearer_auth(token.secret())
                        .json(&json!({"fields": fields})),
                )
                .await?;
            info!(key = %external_id, "Updated Jira issue fields");
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
        let target = config.as_issue_tracker()?;
        let raw = self.fetch_issue(token, target, external_id, ISSUE_FIELDS).await?;
        let issue: JiraIssue = serde_json::from_value(raw.clone())?;
        let (mapped_status, status_aliases) = match issue.fields.status {
            Some(status) => (Some(status.name), status.id.into_iter().collect()),
            None => (None, Vec::new()),
        };

        Ok(ExternalItem {
            url: Some(Self::browse_url(target, &issue.key)),
            external_id: issue.key,
            title: issue.fields.summary,
            description: adf_to_text(&issue.fields.description),
            mapped_status,
            status_aliases,
            mapped_priority: issue.fields.priority.and_then(|p| p.id.or(Some(p.name))),
            labels: issue.fields.labels,
            raw,
        })
    }

    async fn test_connection(&self, token: &AccessToken, config: &ProviderConfig) -> Result<ConnectionCheck> {
        let target = config.as_issue_tracker()?;
        let url = format!("{}/myself", self.base_url(target));

        let identity = self
            .http
            .send_json::<Myself>(self.http.request(Method::GET, &url).bearer_auth(token.secret()))
            .await
            .map(|me| match me.email {
                Some(email) => format!("{} <{}>", me.display_name, email),
                None => me.display_name,
            });

        connection_check(identity)
    }
}
