//! Pre-built records for import scenarios.

use serde::{Deserialize, Serialize};

/// Header line of a customer CSV export.
pub const CUSTOMER_CSV_HEADER: &str = "id,firstName,lastName,email,gender,contactNo,country,dob";

/// A customer row as found in CRM exports.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: u64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub gender: String,
    pub contact_no: String,
    pub country: String,
    pub dob: String,
}

const FIRST_NAMES: [&str; 6] = ["Ada", "Grace", "Alan", "Edsger", "Barbara", "Ken"];
const LAST_NAMES: [&str; 5] = ["Lovelace", "Hopper", "Turing", "Dijkstra", "Liskov"];
const COUNTRIES: [&str; 4] = ["United Kingdom", "United States", "Netherlands", "Japan"];

/// `count` deterministic customers with ids `1..=count`.
///
/// ```
/// use ironbatch::testing::sample_customers;
///
/// let customers = sample_customers(3);
/// assert_eq!(customers[2].id, 3);
/// assert_eq!(customers, sample_customers(3));
/// ```
#[must_use]
pub fn sample_customers(count: usize) -> Vec<Customer> {
    (1..=count as u64)
        .map(|id| {
            let i = usize::try_from(id).unwrap_or_default();
            let first = FIRST_NAMES[i % FIRST_NAMES.len()];
            let last = LAST_NAMES[i % LAST_NAMES.len()];
            Customer {
                id,
                first_name: first.to_string(),
                last_name: last.to_string(),
                email: format!("{}.{}{id}@example.com", first.to_lowercase(), last.to_lowercase()),
                gender: if id % 2 == 0 { "Female" } else { "Male" }.to_string(),
                contact_no: format!("555-{id:04}"),
                country: COUNTRIES[i % COUNTRIES.len()].to_string(),
                dob: format!("19{:02}-{:02}-{:02}", 50 + id % 50, 1 + id % 12, 1 + id % 28),
            }
        })
        .collect()
}

/// Renders customers as CSV text with the standard header.
#[must_use]
pub fn customers_csv(customers: &[Customer]) -> String {
    let mut out = String::from(CUSTOMER_CSV_HEADER);
    out.push('\n');
    for c in customers {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{}\n",
            c.id, c.first_name, c.last_name, c.email, c.gender, c.contact_no, c.country, c.dob
        ));
    }
    out
}
