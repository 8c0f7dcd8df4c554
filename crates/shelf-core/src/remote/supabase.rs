//! Supabase (PostgREST) remote store.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::config::RemoteConfig;
use crate::error::{RemoteError, RemoteResult};
use crate::util::compact_text;

use super::{RemoteFilter, RemoteRow, RemoteStore, RowPayload};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote store backed by a Supabase project's REST endpoint.
///
/// Requests authenticate with the anon key until a user access token is
/// installed with [`SupabaseRemoteStore::set_access_token`].
pub struct SupabaseRemoteStore {
    rest_url: String,
    anon_key: String,
    access_token: RwLock<Option<String>>,
    client: Client,
}

impl std::fmt::Debug for SupabaseRemoteStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SupabaseRemoteStore")
            .field("rest_url", &self.rest_url)
            .field("anon_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl SupabaseRemoteStore {
    pub fn new(config: &RemoteConfig) -> RemoteResult<Self> {
        Ok(Self {
            rest_url: config.rest_url(),
            anon_key: config.anon_key.clone(),
            access_token: RwLock::new(None),
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
        })
    }

    /// Install (or clear) the signed-in user's access token.
    pub fn set_access_token(&self, token: Option<String>) {
        let mut guard = self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = token.filter(|token| !token.trim().is_empty());
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{table}", self.rest_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.anon_key.clone());

        request
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {bearer}"))
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn single_row(&self, request: RequestBuilder, table: &str) -> RemoteResult<RemoteRow> {
        let response = self
            .send(request.header("Prefer", "return=representation"))
            .await?;
        read_rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Validation(format!("{table} write returned no row")))
    }
}

#[async_trait]
impl RemoteStore for SupabaseRemoteStore {
    async fn select(&self, table: &str, filter: &RemoteFilter) -> RemoteResult<Vec<RemoteRow>> {
        let request = self
            .client
            .get(self.table_url(table))
            .query(&[("select", "*")])
            .query(&filter.query_pairs());
        let response = self.send(request).await?;
        read_rows(response).await
    }

    async fn insert(&self, table: &str, row: RowPayload) -> RemoteResult<RemoteRow> {
        let request = self.client.post(self.table_url(table)).json(&row);
        self.single_row(request, table).await
    }

    async fn update(
        &self,
        table: &str,
        remote_id: i64,
        fields: RowPayload,
    ) -> RemoteResult<RemoteRow> {
        let request = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{remote_id}"))])
            .json(&fields);
        self.single_row(request, table).await
    }

    async fn delete(&self, table: &str, remote_id: i64) -> RemoteResult<()> {
        let request = self
            .client
            .delete(self.table_url(table))
            .query(&[("id", format!("eq.{remote_id}"))]);
        self.send(request).await?;
        Ok(())
    }
}

async fn read_rows(response: Response) -> RemoteResult<Vec<RemoteRow>> {
    response
        .json::<Vec<RemoteRow>>()
        .await
        .map_err(|error| RemoteError::Validation(format!("Unexpected response body: {error}")))
}

/// Map a failed HTTP status onto the remote error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Permission(message),
        StatusCode::BAD_REQUEST
        | StatusCode::NOT_FOUND
        | StatusCode::NOT_ACCEPTABLE
        | StatusCode::CONFLICT
        | StatusCode::UNPROCESSABLE_ENTITY => RemoteError::Validation(message),
        _ => RemoteError::Network(message),
    }
}

#[derive(Debug, Deserialize)]
struct PostgrestErrorResponse {
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
    code: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<PostgrestErrorResponse>(body) {
        if let Some(message) = payload.message.or(payload.details).or(payload.hint) {
            let message = compact_text(&message);
            return match payload.code {
                Some(code) => format!("{message} [{code}] ({})", status.as_u16()),
                None => format!("{message} ({})", status.as_u16()),
            };
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compact_text(trimmed), status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> SupabaseRemoteStore {
        let config = RemoteConfig::new("https://demo.supabase.co/", "anon").unwrap();
        SupabaseRemoteStore::new(&config).unwrap()
    }

    #[test]
    fn table_url_targets_rest_endpoint() {
        assert_eq!(
            store().table_url("media_items"),
            "https://demo.supabase.co/rest/v1/media_items"
        );
    }

    #[test]
    fn classify_status_maps_auth_failures_to_permission() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            RemoteError::Permission(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, ""),
            RemoteError::Permission(_)
        ));
    }

    #[test]
    fn classify_status_maps_rejections_to_validation() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::NOT_FOUND,
            StatusCode::CONFLICT,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            assert!(matches!(
                classify_status(status, ""),
                RemoteError::Validation(_)
            ));
        }
    }

    #[test]
    fn classify_status_treats_server_faults_as_network() {
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            RemoteError::Network(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            RemoteError::Network(_)
        ));
    }

    #[test]
    fn parse_api_error_prefers_postgrest_message() {
        let body = json!({
            "code": "23503",
            "message": "insert violates foreign key constraint",
            "details": null,
            "hint": null
        })
        .to_string();

        assert_eq!(
            parse_api_error(StatusCode::CONFLICT, &body),
            "insert violates foreign key constraint [23503] (409)"
        );
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, ""),
            "HTTP 502"
        );
    }

    #[test]
    fn access_token_replaces_anon_bearer() {
        let store = store();
        store.set_access_token(Some("user-jwt".to_string()));
        let request = store
            .authorized(store.client.get(store.table_url("runs")))
            .build()
            .unwrap();
        assert_eq!(
            request.headers().get("Authorization").unwrap(),
            "Bearer user-jwt"
        );
        assert_eq!(request.headers().get("apikey").unwrap(), "anon");

        store.set_access_token(None);
        let request = store
            .authorized(store.client.get(store.table_url("runs")))
            .build()
            .unwrap();
        assert_eq!(
            request.headers().get("Authorization").unwrap(),
            "Bearer anon"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires SHELF_SUPABASE_URL and SHELF_SUPABASE_ANON_KEY"]
    async fn live_select_categories() {
        dotenvy::dotenv().ok();
        let Some(config) = RemoteConfig::from_env().unwrap() else {
            return;
        };
        let store = SupabaseRemoteStore::new(&config).unwrap();
        store
            .select("categories", &RemoteFilter::all())
            .await
            .unwrap();
    }
}
