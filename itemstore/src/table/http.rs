//! REST client for the table service
//!
//! Speaks the table service's JSON protocol (`odata=nometadata`) over
//! reqwest and authenticates every request with Shared Key Lite: an
//! HMAC-SHA256 over the request date and the canonicalized resource, keyed
//! with the base64-decoded account key.
//!
//! Cloud accounts are addressed as `https://{account}.table.{endpoint}/`;
//! the local emulator uses path-style `http://{endpoint}/{account}/`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, ETAG, IF_MATCH};
use reqwest::{Method, Response, Url};
use serde::Deserialize;
use sha2::Sha256;

use super::client::{
    entity_keys, Continuation, ETag, IfMatch, QueryPage, TableClient, TableEntity, TableError,
};
use super::query::TableQuery;
use crate::config::TableStoreConfig;

const API_VERSION: &str = "2019-02-02";
const ACCEPT_JSON: &str = "application/json;odata=nometadata";
const DATA_SERVICE_VERSION: &str = "3.0;NetFx";
const NEXT_PARTITION_KEY: &str = "x-ms-continuation-nextpartitionkey";
const NEXT_ROW_KEY: &str = "x-ms-continuation-nextrowkey";
const ERROR_CODE_HEADER: &str = "x-ms-error-code";

type HmacSha256 = Hmac<Sha256>;

/// [`TableClient`] over HTTPS (or HTTP for the emulator)
#[derive(Debug, Clone)]
pub struct HttpTableClient {
    http: reqwest::Client,
    base_url: Url,
    account_name: String,
    key: Vec<u8>,
    table_name: String,
}

impl HttpTableClient {
    /// Build a client from configuration; performs no network I/O
    pub fn new(config: &TableStoreConfig) -> Result<Self, TableError> {
        if config.account_name.trim().is_empty() || config.account_key.trim().is_empty() {
            return Err(TableError::other(
                "invalid connection settings: missing account name or key",
            ));
        }

        let key = BASE64
            .decode(config.account_key.trim())
            .map_err(|e| TableError::other("account key is not valid base64").with_source(e))?;
        let base_url = service_url(&config.account_name, &config.endpoint, config.use_emulator)?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TableError::other("failed to build HTTP client").with_source(e))?;

        Ok(Self {
            http,
            base_url,
            account_name: config.account_name.clone(),
            key,
            table_name: config.table_name.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, relative: &str) -> Result<Url, TableError> {
        self.base_url
            .join(relative)
            .map_err(|e| TableError::other(format!("invalid resource path '{}'", relative)).with_source(e))
    }

    fn entity_url(&self, partition_key: &str, row_key: &str) -> Result<Url, TableError> {
        self.url(&entity_path(&self.table_name, partition_key, row_key))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        if_match: Option<&IfMatch>,
        body: Option<&serde_json::Value>,
    ) -> Result<Response, TableError> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let signature = sign(&self.key, &string_to_sign(&date, &self.account_name, &url))?;

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header("DataServiceVersion", DATA_SERVICE_VERSION)
            .header("MaxDataServiceVersion", DATA_SERVICE_VERSION)
            .header(ACCEPT, ACCEPT_JSON)
            .header(
                AUTHORIZATION,
                format!("SharedKeyLite {}:{}", self.account_name, signature),
            );
        if let Some(if_match) = if_match {
            request = request.header(IF_MATCH, if_match.header_value());
        }
        if let Some(body) = body {
            request = request.header("Prefer", "return-no-content").json(body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::debug!(%method, url = %url, error = %e, "Table request failed");
            TableError::transport(e)
        })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let header_code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        let error = parse_error(status, header_code, &body);
        tracing::debug!(%method, url = %url, status, code = ?error.code(), "Table request rejected");
        Err(error)
    }
}

#[async_trait]
impl TableClient for HttpTableClient {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn create_table(&self) -> Result<(), TableError> {
        let body = serde_json::json!({ "TableName": self.table_name });
        self.send(Method::POST, self.url("Tables")?, None, Some(&body))
            .await?;
        Ok(())
    }

    async fn insert_entity(&self, entity: TableEntity) -> Result<ETag, TableError> {
        let body = serde_json::Value::Object(entity);
        let response = self
            .send(Method::POST, self.url(&self.table_name)?, None, Some(&body))
            .await?;
        etag(response.headers())
    }

    async fn get_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<(TableEntity, ETag), TableError> {
        let url = self.entity_url(partition_key, row_key)?;
        let response = self.send(Method::GET, url, None, None).await?;
        let etag = etag(response.headers())?;
        let entity = response
            .json::<TableEntity>()
            .await
            .map_err(|e| TableError::other("malformed entity body").with_source(e))?;
        Ok((entity, etag))
    }

    async fn replace_entity(
        &self,
        entity: TableEntity,
        if_match: IfMatch,
    ) -> Result<ETag, TableError> {
        let (partition_key, row_key) = entity_keys(&entity)?;
        let url = self.entity_url(&partition_key, &row_key)?;
        let body = serde_json::Value::Object(entity);
        let response = self
            .send(Method::PUT, url, Some(&if_match), Some(&body))
            .await?;
        etag(response.headers())
    }

    async fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
        if_match: IfMatch,
    ) -> Result<(), TableError> {
        let url = self.entity_url(partition_key, row_key)?;
        self.send(Method::DELETE, url, Some(&if_match), None).await?;
        Ok(())
    }

    async fn query_entities(
        &self,
        query: &TableQuery,
        continuation: Option<&Continuation>,
    ) -> Result<QueryPage, TableError> {
        let url = query_url(self.url(&format!("{}()", self.table_name))?, query, continuation);
        let response = self.send(Method::GET, url, None, None).await?;
        let next = continuation_from(response.headers());

        #[derive(Deserialize)]
        struct QueryBody {
            #[serde(default)]
            value: Vec<TableEntity>,
        }

        let body = response
            .json::<QueryBody>()
            .await
            .map_err(|e| TableError::other("malformed query body").with_source(e))?;

        Ok(QueryPage {
            entities: body.value,
            continuation: next,
        })
    }
}

/// Root URL of the table service for an account
fn service_url(account_name: &str, endpoint: &str, use_emulator: bool) -> Result<Url, TableError> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let raw = if use_emulator {
        format!("http://{}/{}/", endpoint, account_name)
    } else {
        format!("https://{}.table.{}/", account_name, endpoint)
    };
    Url::parse(&raw).map_err(|e| TableError::other(format!("invalid service URL '{}'", raw)).with_source(e))
}

fn quote_key(key: &str) -> String {
    key.replace('\'', "''")
}

fn entity_path(table_name: &str, partition_key: &str, row_key: &str) -> String {
    format!(
        "{}(PartitionKey='{}',RowKey='{}')",
        table_name,
        quote_key(partition_key),
        quote_key(row_key)
    )
}

fn query_url(mut url: Url, query: &TableQuery, continuation: Option<&Continuation>) -> Url {
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(filter) = query.to_odata() {
            pairs.append_pair("$filter", &filter);
        }
        if let Some(top) = query.top {
            pairs.append_pair("$top", &top.to_string());
        }
        if let Some(next) = continuation {
            pairs.append_pair("NextPartitionKey", &next.next_partition_key);
            if let Some(row_key) = &next.next_row_key {
                pairs.append_pair("NextRowKey", row_key);
            }
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    url
}

fn continuation_from(headers: &HeaderMap) -> Option<Continuation> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    header(NEXT_PARTITION_KEY).map(|next_partition_key| Continuation {
        next_partition_key,
        next_row_key: header(NEXT_ROW_KEY),
    })
}

fn etag(headers: &HeaderMap) -> Result<ETag, TableError> {
    headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(ETag::new)
        .ok_or_else(|| TableError::other("response is missing the ETag header"))
}

/// Shared Key Lite string-to-sign: date, then `/account/path`
fn string_to_sign(date: &str, account_name: &str, url: &Url) -> String {
    format!("{}\n/{}{}", date, account_name, url.path())
}

fn sign(key: &[u8], string_to_sign: &str) -> Result<String, TableError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| TableError::other(format!("unusable account key: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(rename = "odata.error")]
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: ErrorMessage,
}

#[derive(Deserialize)]
struct ErrorMessage {
    value: String,
}

/// Build a [`TableError`] from a rejected response
///
/// The JSON error body is preferred; the `x-ms-error-code` header covers
/// bodiless responses such as HEAD or some 404s.
fn parse_error(status: u16, header_code: Option<String>, body: &str) -> TableError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let message = envelope
                .error
                .message
                .value
                .lines()
                .next()
                .unwrap_or_default()
                .to_string();
            TableError::response(status, Some(envelope.error.code), message)
        }
        Err(_) => {
            let message = if body.trim().is_empty() {
                "no error details".to_string()
            } else {
                body.trim().to_string()
            };
            TableError::response(status, header_code, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;
    use crate::repository::{DbErrorKind, Repository};
    use crate::table::client::TABLE_ALREADY_EXISTS;
    use crate::table::TableRepository;

    const EMULATOR_KEY: &str =
        "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

    fn emulator_config(endpoint: &str) -> TableStoreConfig {
        TableStoreConfig {
            account_name: "devstoreaccount1".to_string(),
            account_key: EMULATOR_KEY.to_string(),
            endpoint: endpoint.to_string(),
            use_emulator: true,
            request_timeout_secs: 2,
            ..TableStoreConfig::default()
        }
    }

    #[test]
    fn test_service_urls() {
        let cloud = service_url("acct", "core.windows.net", false).unwrap();
        assert_eq!(cloud.as_str(), "https://acct.table.core.windows.net/");

        let emulator = service_url("devstoreaccount1", "127.0.0.1:10002/", true).unwrap();
        assert_eq!(emulator.as_str(), "http://127.0.0.1:10002/devstoreaccount1/");
    }

    #[test]
    fn test_entity_url_and_signature() {
        let client = HttpTableClient::new(&emulator_config("127.0.0.1:10002")).unwrap();
        let url = client.entity_url("items", "00000000000000000001").unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:10002/devstoreaccount1/items(PartitionKey='items',RowKey='00000000000000000001')"
        );

        let to_sign = string_to_sign("Fri, 16 Oct 2026 08:00:00 GMT", "devstoreaccount1", &url);
        assert_eq!(
            to_sign,
            "Fri, 16 Oct 2026 08:00:00 GMT\n/devstoreaccount1/devstoreaccount1/items(PartitionKey='items',RowKey='00000000000000000001')"
        );
        assert_eq!(
            sign(&client.key, &to_sign).unwrap(),
            "YQT/fv7nxt2yQTBXEdLbc1jVVgAQzIVm9kdOvXkwf64="
        );
    }

    #[test]
    fn test_sign_matches_reference_hmac() {
        assert_eq!(
            sign(b"key", "The quick brown fox jumps over the lazy dog").unwrap(),
            "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg="
        );
    }

    #[test]
    fn test_entity_path_doubles_quotes() {
        assert_eq!(
            entity_path("items", "it's", "a'b"),
            "items(PartitionKey='it''s',RowKey='a''b')"
        );
    }

    #[test]
    fn test_query_url_parameters() {
        let base = Url::parse("https://acct.table.core.windows.net/items()").unwrap();
        let continuation = Continuation {
            next_partition_key: "1!8!aXRlbXM-".to_string(),
            next_row_key: Some("1!28!MDAw".to_string()),
        };
        let url = query_url(base.clone(), &TableQuery::partition("items"), Some(&continuation));

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("$filter".to_string(), "PartitionKey eq 'items'".to_string()),
                ("NextPartitionKey".to_string(), "1!8!aXRlbXM-".to_string()),
                ("NextRowKey".to_string(), "1!28!MDAw".to_string()),
            ]
        );

        let bare = query_url(base, &TableQuery::default(), None);
        assert_eq!(bare.query(), None);
    }

    #[test]
    fn test_continuation_headers() {
        let mut headers = HeaderMap::new();
        assert!(continuation_from(&headers).is_none());

        headers.insert(NEXT_PARTITION_KEY, HeaderValue::from_static("pk"));
        headers.insert(NEXT_ROW_KEY, HeaderValue::from_static("rk"));
        let next = continuation_from(&headers).unwrap();
        assert_eq!(next.next_partition_key, "pk");
        assert_eq!(next.next_row_key.as_deref(), Some("rk"));
    }

    #[test]
    fn test_parse_error_body() {
        let body = r#"{"odata.error":{"code":"TableAlreadyExists","message":{"lang":"en-US","value":"The table specified already exists.\nRequestId:abc"}}}"#;
        let err = parse_error(409, None, body);
        assert!(err.is_table_exists());
        assert_eq!(err.code(), Some(TABLE_ALREADY_EXISTS));
        assert_eq!(err.to_string(), "409 TableAlreadyExists: The table specified already exists.");

        let bare = parse_error(404, Some("ResourceNotFound".to_string()), "");
        assert!(bare.is_not_found());
        assert_eq!(bare.code(), Some("ResourceNotFound"));
    }

    #[test]
    fn test_rejects_missing_credentials() {
        let mut config = emulator_config("127.0.0.1:10002");
        config.account_key = String::new();
        assert!(HttpTableClient::new(&config).is_err());

        config.account_key = "%%%".to_string();
        assert!(HttpTableClient::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_ping_unreachable_is_opaque() {
        let client = HttpTableClient::new(&emulator_config("127.0.0.1:1")).unwrap();
        let repo = TableRepository::new(std::sync::Arc::new(client));

        let err = repo.ping().await.unwrap_err();
        assert_eq!(err.kind(), DbErrorKind::Opaque);
        assert!(err.is_retriable());

        let err = repo.find_by_id(1).await.unwrap_err();
        assert_eq!(err.kind(), DbErrorKind::Opaque);
    }
}
