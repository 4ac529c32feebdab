use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Method;
use url::Url;

use crate::config::Config;
use crate::data::{DataAccess, Query};
use crate::feed::filter::value_text;
use crate::feed::Row;

/// Table and storage access over the backend's REST interface.
pub struct RestClient {
    config: Config,
    client: Client,
}

impl RestClient {
    pub fn new(config: Config) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, client })
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.config.anon_key)
            .bearer_auth(&self.config.anon_key)
    }

    pub fn query_url(&self, table: &str, query: &Query) -> Result<Url> {
        let mut url = self.config.rest_url(table)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", &compact_select(&query.select));
            for (column, value) in &query.filters {
                let text = value_text(value).unwrap_or_else(|| "null".to_string());
                pairs.append_pair(column, &format!("eq.{}", text));
            }
            if let Some((column, ascending)) = &query.order {
                let direction = if *ascending { "asc" } else { "desc" };
                pairs.append_pair("order", &format!("{}.{}", column, direction));
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url)
    }

    fn row_url(&self, table: &str, id: &str) -> Result<Url> {
        let mut url = self.config.rest_url(table)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{}", id));
        Ok(url)
    }
}

/// Drops whitespace from a select list; the REST interface rejects it.
fn compact_select(select: &str) -> String {
    select.chars().filter(|c| !c.is_whitespace()).collect()
}

fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    anyhow::bail!("{} failed with {}: {}", what, status, body)
}

impl DataAccess for RestClient {
    fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        let url = self.query_url(table, query)?;
        log::debug!("REST GET: {}", url);
        let response = self.request(Method::GET, url).send()?;
        let rows: Vec<Row> = check(response, &format!("Query of '{}'", table))?.json()?;
        log::debug!("REST GET RESULT: {} rows", rows.len());
        Ok(rows)
    }

    fn insert(&self, table: &str, row: Row) -> Result<Row> {
        let url = self.config.rest_url(table)?;
        log::debug!("REST POST: {}", url);
        let response = self
            .request(Method::POST, url)
            .header("Prefer", "return=representation")
            .json(&vec![row])
            .send()?;
        let mut rows: Vec<Row> = check(response, &format!("Insert into '{}'", table))?.json()?;
        rows.pop()
            .with_context(|| format!("Insert into '{}' returned no row", table))
    }

    fn update(&self, table: &str, id: &str, patch: Row) -> Result<()> {
        let url = self.row_url(table, id)?;
        log::debug!("REST PATCH: {}", url);
        let response = self.request(Method::PATCH, url).json(&patch).send()?;
        check(response, &format!("Update of '{}' {}", table, id))?;
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> Result<()> {
        let url = self.row_url(table, id)?;
        log::debug!("REST DELETE: {}", url);
        let response = self.request(Method::DELETE, url).send()?;
        check(response, &format!("Delete from '{}' {}", table, id))?;
        Ok(())
    }

    fn upload_file(&self, bucket: &str, path: &str, content: &[u8]) -> Result<String> {
        let url = self.config.storage_upload_url(bucket, path)?;
        log::debug!("STORAGE PUT: {} ({} bytes)", url, content.len());
        let response = self
            .request(Method::POST, url)
            .header("Content-Type", "application/octet-stream")
            .header("x-upsert", "true")
            .body(content.to_vec())
            .send()?;
        check(response, &format!("Upload to '{}/{}'", bucket, path))?;
        Ok(self.config.storage_public_url(bucket, path)?.to_string())
    }

    fn tables(&self) -> Result<Vec<String>> {
        Ok(self.config.tables.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_query_urls() -> Result<()> {
        let client = RestClient::new(Config::new("https://shop.example.co", "anon")?)?;
        let query = Query::new()
            .select("*, customers (id, name, phone)")
            .eq("source", "website")
            .eq("is_active", true)
            .order("created_at", false)
            .limit(5);
        let url = client.query_url("orders", &query)?;

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/rest/v1/orders");
        assert_eq!(
            pairs,
            vec![
                ("select".to_string(), "*,customers(id,name,phone)".to_string()),
                ("source".to_string(), "eq.website".to_string()),
                ("is_active".to_string(), "eq.true".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "5".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn row_urls_filter_by_id() -> Result<()> {
        let client = RestClient::new(Config::new("https://shop.example.co", "anon")?)?;
        let url = client.row_url("orders", "abc123")?;
        assert_eq!(url.query(), Some("id=eq.abc123"));
        Ok(())
    }
}
