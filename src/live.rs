//! Live filings sources.
//!
//! A [`LiveFetcher`] turns structured [`FetchCriteria`] into raw documents
//! from an external provider. An empty result means "no matching filings";
//! only a source that cannot be reached returns [`FetchError::Unavailable`].
//!
//! The bundled [`SecApiFetcher`] queries the sec-api.io full-text filing
//! index for recent filings carrying material-contract exhibits and
//! downloads each exhibit.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::LiveConfig;
use crate::error::FetchError;
use crate::models::{DateRange, FetchCriteria, RawDocument, RecordMetadata};
use crate::normalize::classify_contract_type;

#[async_trait]
pub trait LiveFetcher: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, criteria: &FetchCriteria) -> Result<Vec<RawDocument>, FetchError>;
}

/// Fetcher used when `live.provider = "disabled"`.
pub struct DisabledFetcher;

#[async_trait]
impl LiveFetcher for DisabledFetcher {
    fn name(&self) -> &str {
        "disabled"
    }
    async fn fetch(&self, _criteria: &FetchCriteria) -> Result<Vec<RawDocument>, FetchError> {
        Err(FetchError::Unavailable("no live source configured".into()))
    }
}

/// One filing from the query API, reduced to what ingestion needs.
#[derive(Debug, Clone, PartialEq)]
pub struct FilingHit {
    pub exhibit_url: String,
    pub exhibit_type: String,
    pub exhibit_description: Option<String>,
    pub ticker: Option<String>,
    pub company: Option<String>,
    pub filed_at: Option<NaiveDate>,
    pub form_type: Option<String>,
    pub accession_no: Option<String>,
}

impl FilingHit {
    fn into_metadata(self) -> (String, RecordMetadata) {
        let label = format!(
            "{} {}",
            self.exhibit_description.as_deref().unwrap_or(""),
            self.exhibit_url.rsplit('/').next().unwrap_or("")
        );
        let mut extra = BTreeMap::new();
        extra.insert("source_type".to_string(), "sec_live".to_string());
        extra.insert("exhibit_type".to_string(), self.exhibit_type);
        if let Some(acc) = self.accession_no {
            extra.insert("accession_no".to_string(), acc);
        }

        let metadata = RecordMetadata {
            entity: self.company,
            ticker: self.ticker,
            filing_date: self.filed_at,
            doc_type: Some(classify_contract_type(&label).to_string()),
            form_type: self.form_type,
            clause_tags: Vec::new(),
            source_url: Some(self.exhibit_url.clone()),
            extra,
        };
        (self.exhibit_url, metadata)
    }
}

/// Client for the sec-api.io query API.
pub struct SecApiFetcher {
    client: reqwest::Client,
    config: LiveConfig,
    api_key: Option<String>,
}

impl SecApiFetcher {
    pub fn new(config: &LiveConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "live source API key not set; live fetches will report unavailable"
            );
        }
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &LiveConfig, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
            api_key,
        })
    }

    /// Query body for filings of the configured form type with contract
    /// exhibits, newest first.
    pub fn build_query(&self, criteria: &FetchCriteria) -> Value {
        let today = Utc::now().date_naive();
        let range = criteria.date_range.unwrap_or_default();
        let to = range.to.unwrap_or(today);
        let from = range
            .from
            .unwrap_or(to - ChronoDuration::days(self.config.days_back));

        let form_type = criteria
            .doc_type
            .as_deref()
            .filter(|t| looks_like_form_type(t))
            .unwrap_or(self.config.form_type.as_str());

        let mut must = vec![
            json!({ "match": { "formType": form_type } }),
            json!({ "match": { "description": self.config.exhibit_prefix } }),
        ];
        if let Some(entity) = criteria.entity.as_deref() {
            must.push(json!({
                "bool": {
                    "should": [
                        { "match": { "ticker": entity.to_uppercase() } },
                        { "match_phrase": { "companyName": entity } }
                    ],
                    "minimum_should_match": 1
                }
            }));
        }

        json!({
            "query": {
                "bool": {
                    "must": must,
                    "filter": [{
                        "range": {
                            "filedAt": {
                                "gte": from.format("%Y-%m-%d").to_string(),
                                "lte": to.format("%Y-%m-%d").to_string()
                            }
                        }
                    }]
                }
            },
            "from": "0",
            "size": self.config.max_filings.to_string(),
            "sort": [{ "filedAt": { "order": "desc" } }]
        })
    }

    async fn download_exhibit(&self, url: &str) -> Option<String> {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(url, error = %e, "exhibit download failed");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::warn!(url, status = %response.status(), "exhibit download rejected");
            return None;
        }
        match response.text().await {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::warn!(url, error = %e, "exhibit body unreadable");
                None
            }
        }
    }
}

fn looks_like_form_type(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_digit()) && s.contains('-')
}

/// Extract filings that carry an exhibit whose type starts with
/// `exhibit_prefix`. Filings without one are skipped.
pub fn parse_filings(body: &Value, exhibit_prefix: &str) -> Vec<FilingHit> {
    let Some(filings) = body.get("filings").and_then(Value::as_array) else {
        return Vec::new();
    };

    let text = |v: &Value, key: &str| {
        v.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };

    filings
        .iter()
        .filter_map(|filing| {
            let exhibit = filing
                .get("documentFormatFiles")
                .and_then(Value::as_array)?
                .iter()
                .find(|doc| {
                    doc.get("type")
                        .and_then(Value::as_str)
                        .is_some_and(|t| t.starts_with(exhibit_prefix))
                })?;

            Some(FilingHit {
                exhibit_url: text(exhibit, "documentUrl")?,
                exhibit_type: text(exhibit, "type")?,
                exhibit_description: text(exhibit, "description"),
                ticker: text(filing, "ticker"),
                company: text(filing, "companyName"),
                filed_at: filing
                    .get("filedAt")
                    .and_then(Value::as_str)
                    .and_then(|s| s.get(..10))
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
                form_type: text(filing, "formType"),
                accession_no: text(filing, "accessionNo"),
            })
        })
        .collect()
}

#[async_trait]
impl LiveFetcher for SecApiFetcher {
    fn name(&self) -> &str {
        "sec-api"
    }

    async fn fetch(&self, criteria: &FetchCriteria) -> Result<Vec<RawDocument>, FetchError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            FetchError::Unavailable(format!("{} is not set", self.config.api_key_env))
        })?;

        let query = self.build_query(criteria);
        tracing::debug!(%query, "querying live filings");

        let response = self
            .client
            .post(&self.config.base_url)
            .header("Authorization", api_key)
            .json(&query)
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(format!("query request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Unavailable(format!(
                "query API returned {}: {}",
                status, body
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Unavailable(format!("query response unreadable: {}", e)))?;
        let hits = parse_filings(&body, &self.config.exhibit_prefix);
        tracing::info!(filings = hits.len(), "live filings found");

        let mut docs = Vec::with_capacity(hits.len());
        for (i, hit) in hits.into_iter().enumerate() {
            if i > 0 && self.config.download_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.download_delay_ms)).await;
            }
            let Some(text) = self.download_exhibit(&hit.exhibit_url).await else {
                continue;
            };
            let (source_native_id, metadata) = hit.into_metadata();
            docs.push(RawDocument {
                source_native_id,
                text,
                metadata,
            });
        }
        Ok(docs)
    }
}

/// Create the [`LiveFetcher`] named by `live.provider`.
pub fn create_fetcher(config: &LiveConfig) -> Result<Box<dyn LiveFetcher>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledFetcher)),
        "sec-api" => Ok(Box::new(SecApiFetcher::new(config)?)),
        other => bail!("Unknown live provider: {}", other),
    }
}

/// Criteria for a fetch that only bounds the date range.
pub fn recent(days_back: i64) -> FetchCriteria {
    let today = Utc::now().date_naive();
    FetchCriteria {
        date_range: Some(DateRange::new(
            Some(today - ChronoDuration::days(days_back)),
            Some(today),
        )),
        ..Default::default()
    }
}
