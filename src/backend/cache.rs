//! Cache keys for HR backend reads.

use crate::cache::QueryKey;

use super::types::CompanyStatus;

/// Query key types for backend reads.
///
/// Every variant embeds the parameters its result depends on, and keys of one
/// variant share a prefix so a whole family can be invalidated with a wildcard.
#[derive(Clone, Debug)]
pub enum HrQueryKey {
  /// A single company by id
  CompanyDetails { id: String },
  /// Company list, optionally filtered by status
  Companies { status: Option<CompanyStatus> },
  /// Employees belonging to a company
  Employees { company_id: String },
  /// A single employee by id
  EmployeeDetails { id: String },
}

impl HrQueryKey {
  /// Wildcard pattern matching every key of this variant.
  pub fn family_pattern(&self) -> &'static str {
    match self {
      Self::CompanyDetails { .. } => "company_details_*",
      Self::Companies { .. } => "companies_*",
      Self::Employees { .. } => "employees_*",
      Self::EmployeeDetails { .. } => "employee_details_*",
    }
  }
}

impl QueryKey for HrQueryKey {
  fn cache_key(&self) -> String {
    match self {
      Self::CompanyDetails { id } => format!("company_details_{}", id),
      Self::Companies { status } => {
        format!("companies_{}", status.map(CompanyStatus::as_str).unwrap_or("all"))
      }
      Self::Employees { company_id } => format!("employees_{}", company_id),
      Self::EmployeeDetails { id } => format!("employee_details_{}", id),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::CompanyDetails { id } => format!("company {}", id),
      Self::Companies { status } => match status {
        Some(s) => format!("{} companies", s.as_str()),
        None => "all companies".to_string(),
      },
      Self::Employees { company_id } => format!("employees of company {}", company_id),
      Self::EmployeeDetails { id } => format!("employee {}", id),
    }
  }
}
