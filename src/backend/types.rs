use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a company account may use the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompanyStatus {
  Active,
  Inactive,
}

impl CompanyStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Active => "active",
      Self::Inactive => "inactive",
    }
  }
}

/// Row of the `companies` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
  pub id: String,
  pub name: String,
  pub email: Option<String>,
  pub phone: Option<String>,
  pub address: Option<String>,
  pub status: CompanyStatus,
  pub created_at: Option<DateTime<Utc>>,
}

/// Row of the `employees` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
  pub id: String,
  pub company_id: String,
  pub full_name: String,
  pub email: Option<String>,
  pub position: Option<String>,
  pub department: Option<String>,
  #[serde(default)]
  pub is_active: bool,
}
