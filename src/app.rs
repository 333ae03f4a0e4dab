//! The application state machine: a database of vaccination sites.
//!
//! This is the deterministic half of the bargain. The replica core feeds
//! every live replica the same totally ordered request sequence; [`SiteDb`]
//! guarantees that equal sequences produce equal states and equal outputs.

use crate::wire::{Message, Transaction};
use std::collections::BTreeMap;

/// Availability and location of one vaccination site.
///
/// Availability is kept exactly as entered: a nonnegative count, or the
/// literals `True`/`False` for sites reporting binary availability.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Site {
    pub availability: String,
    pub zip_code: String,
}

/// A mapping from site name to availability details, seeded with one site.
///
/// `BTreeMap` keeps the listing in ascending site-name order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SiteDb {
    sites: BTreeMap<String, Site>,
}

impl Default for SiteDb {
    fn default() -> Self {
        let mut sites = BTreeMap::new();
        sites.insert(
            "Harvard University".to_owned(),
            Site {
                availability: "0".to_owned(),
                zip_code: "02138".to_owned(),
            },
        );
        SiteDb { sites }
    }
}

impl SiteDb {
    pub fn new() -> Self {
        SiteDb::default()
    }

    /// Applies one application request, returning the user-visible output.
    ///
    /// Absent fields behave as empty strings, which miss every site; only
    /// application transactions reach this method.
    pub fn apply(&mut self, request: &Message) -> String {
        let site_name = request.site_name.as_deref().unwrap_or("");
        match request.transaction {
            Transaction::List => self.list(),
            Transaction::View => self.view(site_name),
            Transaction::Edit => {
                self.edit(site_name, request.vaccine_no.as_deref().unwrap_or(""))
            }
            Transaction::New => {
                self.add(site_name, request.zip_code.as_deref().unwrap_or(""))
            }
            _ => String::new(),
        }
    }

    fn list(&self) -> String {
        let mut output = String::from("Availability,ZIP Code,Site Name\n");
        let rows: Vec<String> = self
            .sites
            .iter()
            .map(|(name, site)| format!("{},{},{}", site.availability, site.zip_code, name))
            .collect();
        output.push_str(&rows.join("\n"));
        output
    }

    fn view(&self, site_name: &str) -> String {
        match self.sites.get(site_name) {
            None => "Site does not exist. Choose [l] to view all sites.".to_owned(),
            Some(site) => format!(
                "Availability at {} (ZIP code {}): {}",
                site_name, site.zip_code, site.availability
            ),
        }
    }

    fn edit(&mut self, site_name: &str, vaccine_no: &str) -> String {
        match self.sites.get_mut(site_name) {
            None => "Site does not exist. Choose [l] to view all sites.".to_owned(),
            Some(site) => {
                site.availability = vaccine_no.to_owned();
                format!(
                    "Vaccine availability at {} (ZIP code {}) updated to {}.",
                    site_name, site.zip_code, vaccine_no
                )
            }
        }
    }

    fn add(&mut self, site_name: &str, zip_code: &str) -> String {
        if self.sites.contains_key(site_name) {
            return format!("{site_name} already in database.");
        }
        self.sites.insert(
            site_name.to_owned(),
            Site {
                availability: "0".to_owned(),
                zip_code: zip_code.to_owned(),
            },
        );
        format!("{site_name} (ZIP code {zip_code}) added with vaccine availability 0.")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lists_the_seeded_site() {
        let mut db = SiteDb::new();
        assert_eq!(
            db.apply(&Message::list()),
            "Availability,ZIP Code,Site Name\n0,02138,Harvard University"
        );
    }

    #[test]
    fn views_availability() {
        let mut db = SiteDb::new();
        assert_eq!(
            db.apply(&Message::view("Harvard University")),
            "Availability at Harvard University (ZIP code 02138): 0"
        );
        assert_eq!(
            db.apply(&Message::view("Nowhere")),
            "Site does not exist. Choose [l] to view all sites."
        );
    }

    #[test]
    fn edits_availability_in_place() {
        let mut db = SiteDb::new();
        assert_eq!(
            db.apply(&Message::edit("Harvard University", "10")),
            "Vaccine availability at Harvard University (ZIP code 02138) updated to 10."
        );
        assert_eq!(
            db.apply(&Message::view("Harvard University")),
            "Availability at Harvard University (ZIP code 02138): 10"
        );
        assert_eq!(
            db.apply(&Message::edit("Nowhere", "10")),
            "Site does not exist. Choose [l] to view all sites."
        );
    }

    #[test]
    fn accepts_binary_availability() {
        let mut db = SiteDb::new();
        db.apply(&Message::edit("Harvard University", "True"));
        assert_eq!(
            db.apply(&Message::view("Harvard University")),
            "Availability at Harvard University (ZIP code 02138): True"
        );
    }

    #[test]
    fn adds_new_sites_sorted_by_name() {
        let mut db = SiteDb::new();
        assert_eq!(
            db.apply(&Message::new_site("MIT", "02139")),
            "MIT (ZIP code 02139) added with vaccine availability 0."
        );
        assert_eq!(
            db.apply(&Message::new_site("MIT", "02139")),
            "MIT already in database."
        );
        assert_eq!(
            db.apply(&Message::list()),
            "Availability,ZIP Code,Site Name\n0,02138,Harvard University\n0,02139,MIT"
        );
    }

    #[test]
    fn reads_are_idempotent() {
        let mut db = SiteDb::new();
        let first = db.apply(&Message::list());
        let second = db.apply(&Message::list());
        assert_eq!(first, second);
    }

    #[test]
    fn equal_request_sequences_produce_equal_states() {
        let requests = [
            Message::new_site("MIT", "02139"),
            Message::edit("MIT", "5"),
            Message::edit("Harvard University", "False"),
        ];
        let mut a = SiteDb::new();
        let mut b = SiteDb::new();
        let outputs_a: Vec<String> = requests.iter().map(|r| a.apply(r)).collect();
        let outputs_b: Vec<String> = requests.iter().map(|r| b.apply(r)).collect();
        assert_eq!(outputs_a, outputs_b);
        assert_eq!(a, b);
    }
}
