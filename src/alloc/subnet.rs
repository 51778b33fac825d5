//! Subnet filtering and candidate selection.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::cloud::{CloudClient, Subnet};
use crate::error::{Error, Result};

/// key=value constraints over subnet tags. An empty filter matches every
/// subnet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter(BTreeMap<String, String>);

impl Filter {
    /// Parse a comma-separated `k=v,k=v` specification.
    pub fn parse(input: &str) -> Result<Self> {
        let mut constraints = BTreeMap::new();
        if input.is_empty() {
            return Ok(Filter(constraints));
        }
        for term in input.split(',') {
            let (key, value) = term.split_once('=').ok_or_else(|| {
                Error::Validation(format!("invalid filter term {term:?}, expected key=value"))
            })?;
            if key.is_empty() || value.is_empty() {
                return Err(Error::Validation(format!(
                    "zero-length side in filter term {term:?}"
                )));
            }
            constraints.insert(key.to_string(), value.to_string());
        }
        Ok(Filter(constraints))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every constraint must be present verbatim in the subnet's tags.
    pub fn matches(&self, subnet: &Subnet) -> bool {
        self.0
            .iter()
            .all(|(key, value)| subnet.tags.get(key) == Some(value))
    }
}

impl FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

/// Subnets matching `filter`, best candidate first: most available
/// addresses, ties broken by identifier ordering.
pub fn eligible_subnets(cloud: &dyn CloudClient, filter: &Filter) -> Result<Vec<Subnet>> {
    let mut subnets: Vec<Subnet> = cloud
        .list_subnets()?
        .into_iter()
        .filter(|s| filter.matches(s))
        .collect();
    subnets.sort_by(|a, b| {
        b.available_addresses
            .cmp(&a.available_addresses)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(subnets)
}

/// The single best subnet under `filter`.
pub fn select_subnet(cloud: &dyn CloudClient, filter: &Filter) -> Result<Subnet> {
    eligible_subnets(cloud, filter)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Validation("no subnet matches the requested filter".to_string()))
}
