use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use crate::backend::types::{Company, CompanyStatus, Employee};
use crate::config::Config;

const COMPANIES: &str = "companies";
const EMPLOYEES: &str = "employees";

/// Column filter and ordering for a table read.
#[derive(Debug, Default)]
struct TableQuery<'a> {
  /// `(column, value)` pairs, all matched with equality
  eq: Vec<(&'a str, &'a str)>,
  order: Option<&'a str>,
}

/// REST client for the hosted backend's table API.
#[derive(Clone)]
pub struct BackendClient {
  http: reqwest::Client,
  base: Url,
}

impl BackendClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base = config.backend_url()?;
    let api_key = Config::get_api_key()?;

    let mut headers = HeaderMap::new();
    let key = HeaderValue::from_str(&api_key).map_err(|e| eyre!("Invalid API key: {}", e))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
      .map_err(|e| eyre!("Invalid API key: {}", e))?;
    headers.insert("apikey", key);
    headers.insert(AUTHORIZATION, bearer);

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create backend client: {}", e))?;

    Ok(Self { http, base })
  }

  /// Client without credentials, for tests against a local server.
  #[cfg(test)]
  pub fn with_base(base: Url) -> Self {
    let http = reqwest::Client::builder()
      .no_proxy()
      .build()
      .expect("test client");
    Self { http, base }
  }

  /// Get a single company by id
  pub async fn get_company(&self, id: &str) -> Result<Company> {
    let query = TableQuery {
      eq: vec![("id", id)],
      ..TableQuery::default()
    };
    self.select_one(COMPANIES, &query, id).await
  }

  /// Get companies, optionally filtered by status
  pub async fn get_companies(&self, status: Option<CompanyStatus>) -> Result<Vec<Company>> {
    let mut query = TableQuery {
      order: Some("name.asc"),
      ..TableQuery::default()
    };
    if let Some(status) = status {
      query.eq.push(("status", status.as_str()));
    }
    self.select(COMPANIES, &query).await
  }

  /// Get the employees of a company
  pub async fn get_employees(&self, company_id: &str) -> Result<Vec<Employee>> {
    let query = TableQuery {
      eq: vec![("company_id", company_id)],
      order: Some("full_name.asc"),
    };
    self.select(EMPLOYEES, &query).await
  }

  /// Get a single employee by id
  pub async fn get_employee(&self, id: &str) -> Result<Employee> {
    let query = TableQuery {
      eq: vec![("id", id)],
      ..TableQuery::default()
    };
    self.select_one(EMPLOYEES, &query, id).await
  }

  /// Activate or deactivate a company
  pub async fn update_company_status(&self, id: &str, status: CompanyStatus) -> Result<()> {
    let query = TableQuery {
      eq: vec![("id", id)],
      ..TableQuery::default()
    };
    let body = serde_json::json!({ "status": status });
    self.update(COMPANIES, &query, &body).await
  }

  async fn select<T: DeserializeOwned>(&self, table: &str, query: &TableQuery<'_>) -> Result<Vec<T>> {
    let url = table_url(&self.base, table, query)?;

    let response = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to query {}: {}", table, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to query {}: {}", table, e))?;

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} rows: {}", table, e))
  }

  async fn select_one<T: DeserializeOwned>(
    &self,
    table: &str,
    query: &TableQuery<'_>,
    id: &str,
  ) -> Result<T> {
    self
      .select(table, query)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| eyre!("No row with id {} in {}", id, table))
  }

  async fn update<B: Serialize>(&self, table: &str, query: &TableQuery<'_>, body: &B) -> Result<()> {
    let url = table_url(&self.base, table, query)?;

    self
      .http
      .patch(url)
      .header("Prefer", "return=minimal")
      .json(body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to update {}: {}", table, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to update {}: {}", table, e))?;

    Ok(())
  }
}

/// Build `<base>/rest/v1/<table>?select=*&<col>=eq.<value>...`
fn table_url(base: &Url, table: &str, query: &TableQuery<'_>) -> Result<Url> {
  let mut url = base
    .join("rest/v1/")
    .and_then(|u| u.join(table))
    .map_err(|e| eyre!("Invalid table URL for {}: {}", table, e))?;

  {
    let mut pairs = url.query_pairs_mut();
    pairs.append_pair("select", "*");
    for (column, value) in &query.eq {
      pairs.append_pair(column, &format!("eq.{}", value));
    }
    if let Some(order) = query.order {
      pairs.append_pair("order", order);
    }
  }

  Ok(url)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base() -> Url {
    Url::parse("https://project.example.co").unwrap()
  }

  #[test]
  fn test_table_url_without_filters() {
    let url = table_url(&base(), "companies", &TableQuery::default()).unwrap();
    assert_eq!(url.as_str(), "https://project.example.co/rest/v1/companies?select=*");
  }

  #[test]
  fn test_table_url_with_filters_and_order() {
    let query = TableQuery {
      eq: vec![("company_id", "abc"), ("status", "active")],
      order: Some("full_name.asc"),
    };
    let url = table_url(&base(), "employees", &query).unwrap();
    assert_eq!(
      url.as_str(),
      "https://project.example.co/rest/v1/employees?select=*&company_id=eq.abc&status=eq.active&order=full_name.asc"
    );
  }

  #[test]
  fn test_table_url_escapes_values() {
    let query = TableQuery {
      eq: vec![("id", "a b&c")],
      order: None,
    };
    let url = table_url(&base(), "companies", &query).unwrap();
    assert_eq!(
      url.query(),
      Some("select=*&id=eq.a+b%26c")
    );
  }
}
