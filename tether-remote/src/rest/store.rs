use super::{RestClient, encode_path, error_code, error_message};
use crate::error::{RemoteError, RemoteResult};
use crate::store::RemoteStore;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tether_types::{BlobPath, EntityId, Record, TableId};
use tracing::debug;

const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";
const RETURN_REPRESENTATION: &str = "return=representation";
const MERGE_DUPLICATES: &str = "return=representation,resolution=merge-duplicates";
/// PostgREST code for "single object requested, zero rows found".
const NO_ROWS: &str = "PGRST116";

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

/// [`RemoteStore`] over PostgREST and the storage API.
#[derive(Clone)]
pub struct RestStore {
    client: RestClient,
}

impl RestStore {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }

    fn table_path(table: &TableId) -> String {
        format!("/rest/v1/{}", urlencoding::encode(table.as_str()))
    }

    fn object_path(path: &BlobPath) -> String {
        format!(
            "/storage/v1/object/{}/{}",
            urlencoding::encode(path.bucket.as_str()),
            encode_path(&path.file_name)
        )
    }
}

/// First row of a `return=representation` body; an empty array means the
/// filter matched nothing.
fn single_row(value: Value, what: impl FnOnce() -> String) -> RemoteResult<Record> {
    if value.as_array().is_some_and(Vec::is_empty) {
        return Err(RemoteError::NotFound(what()));
    }
    Record::from_response(value).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn fetch_by_id(
        &self,
        table: &TableId,
        id: EntityId,
        select: &str,
    ) -> RemoteResult<Option<Record>> {
        let request = self
            .client
            .request(Method::GET, &Self::table_path(table))
            .await
            .query(&[("id", format!("eq.{id}")), ("select", select.to_string())])
            .header(ACCEPT, SINGLE_OBJECT);
        let response = self.client.execute(request).await?;

        if response.status() == StatusCode::NOT_ACCEPTABLE {
            let body = response.text().await.unwrap_or_default();
            if error_code(&body).as_deref() == Some(NO_ROWS) {
                debug!(%table, %id, "row not found");
                return Ok(None);
            }
            return Err(RemoteError::Http {
                status: StatusCode::NOT_ACCEPTABLE.as_u16(),
                message: error_message(&body),
            });
        }
        if !response.status().is_success() {
            return Err(self.client.error_from(response).await);
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("failed to parse row: {e}")))?;
        match value {
            Value::Null => Ok(None),
            Value::Array(ref rows) if rows.is_empty() => Ok(None),
            other => Record::from_response(other)
                .map(Some)
                .map_err(|e| RemoteError::InvalidResponse(e.to_string())),
        }
    }

    async fn update(&self, table: &TableId, id: EntityId, fields: Record) -> RemoteResult<Record> {
        let request = self
            .client
            .request(Method::PATCH, &Self::table_path(table))
            .await
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", RETURN_REPRESENTATION)
            .json(&fields);
        let value = self.client.send_json(request).await?;
        single_row(value, || format!("{table}/{id}"))
    }

    async fn upsert(
        &self,
        table: &TableId,
        id: EntityId,
        mut fields: Record,
    ) -> RemoteResult<Record> {
        fields.set_id(id);
        let request = self
            .client
            .request(Method::POST, &Self::table_path(table))
            .await
            .header("Prefer", MERGE_DUPLICATES)
            .json(&fields);
        let value = self.client.send_json(request).await?;
        single_row(value, || format!("{table}/{id}"))
    }

    async fn insert(&self, table: &TableId, fields: Record) -> RemoteResult<Record> {
        let request = self
            .client
            .request(Method::POST, &Self::table_path(table))
            .await
            .header("Prefer", RETURN_REPRESENTATION)
            .json(&fields);
        let value = self.client.send_json(request).await?;
        single_row(value, || table.to_string())
    }

    async fn insert_many(&self, table: &TableId, rows: Vec<Record>) -> RemoteResult<Vec<Record>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let request = self
            .client
            .request(Method::POST, &Self::table_path(table))
            .await
            .header("Prefer", RETURN_REPRESENTATION)
            .json(&rows);
        let value = self.client.send_json(request).await?;
        Record::rows_from_response(value).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn delete(&self, table: &TableId, id: EntityId) -> RemoteResult<()> {
        let request = self
            .client
            .request(Method::DELETE, &Self::table_path(table))
            .await
            .query(&[("id", format!("eq.{id}"))]);
        self.client.send(request).await?;
        Ok(())
    }

    async fn upload_blob(
        &self,
        path: &BlobPath,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> RemoteResult<BlobPath> {
        let size = bytes.len();
        let request = self
            .client
            .request(Method::POST, &Self::object_path(path))
            .await
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes);
        self.client.send(request).await?;
        debug!(key = %path, size, "blob uploaded");
        Ok(path.clone())
    }

    async fn delete_blob(&self, path: &BlobPath) -> RemoteResult<()> {
        let request = self
            .client
            .request(
                Method::DELETE,
                &format!("/storage/v1/object/{}", urlencoding::encode(path.bucket.as_str())),
            )
            .await
            .json(&json!({ "prefixes": [path.file_name] }));
        self.client.send(request).await?;
        Ok(())
    }

    async fn signed_url(&self, path: &BlobPath, ttl: Duration) -> RemoteResult<String> {
        let request = self
            .client
            .request(
                Method::POST,
                &format!(
                    "/storage/v1/object/sign/{}/{}",
                    urlencoding::encode(path.bucket.as_str()),
                    encode_path(&path.file_name)
                ),
            )
            .await
            .json(&json!({ "expiresIn": ttl.as_secs() }));
        let value = self.client.send_json(request).await?;
        let signed: SignedUrlResponse = serde_json::from_value(value)
            .map_err(|e| RemoteError::InvalidResponse(format!("failed to parse signed URL: {e}")))?;

        // The API answers with a path relative to the storage root.
        if signed.signed_url.starts_with("http") {
            Ok(signed.signed_url)
        } else {
            Ok(self.client.url(&format!("/storage/v1{}", signed.signed_url)))
        }
    }
}
