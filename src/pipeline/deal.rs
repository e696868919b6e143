//! CRM deal records as the board sees them.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::pipeline::grouping::title_root;

/// Customer a deal is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRef {
    /// CRM customer type, `company` or `contact`.
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub id: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub company: Option<CompanyRef>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_closing_date: Option<NaiveDate>,
    /// CRM phase id, mapped to a board phase through the configured phase map.
    #[serde(default)]
    pub phase_id: Option<String>,
    #[serde(default)]
    pub estimated_probability: Option<f64>,
    #[serde(default)]
    pub estimated_value: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub custom_fields: Vec<CustomFieldValue>,
}

impl Deal {
    pub fn custom_field(&self, field_id: &str) -> Option<&serde_json::Value> {
        self.custom_fields
            .iter()
            .find(|f| f.id == field_id)
            .map(|f| &f.value)
    }

    /// Text form of a custom field; `None` when absent, null or blank.
    pub fn custom_field_text(&self, field_id: &str) -> Option<String> {
        let text = match self.custom_field(field_id)? {
            serde_json::Value::Null => return None,
            serde_json::Value::String(s) => s.trim().to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => other.to_string(),
        };
        if text.is_empty() { None } else { Some(text) }
    }

    pub fn with_custom_field(mut self, field_id: &str, value: serde_json::Value) -> Self {
        match self.custom_fields.iter_mut().find(|f| f.id == field_id) {
            Some(existing) => existing.value = value,
            None => self.custom_fields.push(CustomFieldValue {
                id: field_id.to_string(),
                value,
            }),
        }
        self
    }

    /// Company label used for grouping and display: name, else customer id.
    pub fn company_label(&self) -> Option<&str> {
        let company = self.company.as_ref()?;
        Some(company.name.as_deref().unwrap_or(&company.id))
    }

    pub fn closing_date_label(&self) -> String {
        self.estimated_closing_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "no date".to_string())
    }

    /// Case-insensitive comparison against the assignee field.
    pub fn is_assigned_to(&self, assignee_field_id: &str, email: &str) -> bool {
        self.custom_field_text(assignee_field_id)
            .is_some_and(|v| v.eq_ignore_ascii_case(email.trim()))
    }
}

/// Payload for creating a deal in the CRM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewDeal {
    pub title: String,
    pub company: Option<CompanyRef>,
    pub estimated_closing_date: Option<NaiveDate>,
    pub estimated_probability: Option<f64>,
    pub estimated_value: Option<Decimal>,
    pub currency: Option<String>,
    pub phase_id: String,
    pub custom_fields: Vec<CustomFieldValue>,
}

impl NewDeal {
    /// Copy of `template` placed in `phase_id` and assigned to `email`. The
    /// title keeps its root and names the new assignee.
    pub fn cloned_from(
        template: &Deal,
        phase_id: &str,
        assignee_field_id: &str,
        email: &str,
        assignee_name: &str,
    ) -> Self {
        let mut custom_fields = template.custom_fields.clone();
        match custom_fields.iter_mut().find(|f| f.id == assignee_field_id) {
            Some(field) => field.value = serde_json::Value::String(email.to_string()),
            None => custom_fields.push(CustomFieldValue {
                id: assignee_field_id.to_string(),
                value: serde_json::Value::String(email.to_string()),
            }),
        }
        Self {
            title: format!("{} ({})", title_root(&template.title), assignee_name),
            company: template.company.clone(),
            estimated_closing_date: template.estimated_closing_date,
            estimated_probability: template.estimated_probability,
            estimated_value: template.estimated_value,
            currency: template.currency.clone(),
            phase_id: phase_id.to_string(),
            custom_fields,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn deal(id: &str, title: &str, company: &str, closing: Option<&str>) -> Deal {
        Deal {
            id: id.to_string(),
            title: title.to_string(),
            company: Some(CompanyRef {
                kind: "company".to_string(),
                id: format!("c-{company}"),
                name: Some(company.to_string()),
            }),
            created_at: None,
            estimated_closing_date: closing
                .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").expect("valid test date")),
            phase_id: None,
            estimated_probability: Some(0.5),
            estimated_value: None,
            currency: None,
            custom_fields: Vec::new(),
        }
    }
}
