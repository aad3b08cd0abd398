//! GeoIP/ASN lookup: the external collaborator named in spec.md §1 is the
//! database itself; this module only owns the seam a config reload swaps
//! through [`Context::set_geoip`](crate::context::Context::set_geoip).
//!
//! The lookup is backed by a flat CSV of IPv4 ranges (`csv`, same crate used
//! for MAVG threshold files) rather than a real MaxMind reader — loading the
//! actual on-disk database format is out of scope per spec.md's "GeoIP / ASN
//! lookup" Non-goal.

use crate::error::{FlowError, Result};
use crate::field::accessor::GeoipLookup;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
struct GeoipRow {
    start: u32,
    end: u32,
    country: String,
    city: String,
    asn: u32,
    asd: String,
}

/// A loaded, ordered-by-start-address CSV GeoIP/ASN table.
#[derive(Debug, Default)]
pub struct CsvGeoip {
    rows: Vec<GeoipRow>,
}

impl CsvGeoip {
    /// Loads a geoip CSV (`start,end,country,city,asn,asd` header).
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| FlowError::Config {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;
        let mut rows: Vec<GeoipRow> = Vec::new();
        for row in reader.deserialize() {
            let row: GeoipRow = row.map_err(|e| FlowError::Config {
                path: path.display().to_string(),
                msg: e.to_string(),
            })?;
            rows.push(row);
        }
        rows.sort_by_key(|r| r.start);
        Ok(Self { rows })
    }

    fn find(&self, ip: &[u8]) -> Option<&GeoipRow> {
        if ip.len() != 4 {
            return None;
        }
        let v = u32::from_be_bytes(ip.try_into().unwrap());
        let idx = self.rows.partition_point(|r| r.start <= v);
        if idx == 0 {
            return None;
        }
        let row = &self.rows[idx - 1];
        (row.start..=row.end).contains(&v).then_some(row)
    }
}

impl GeoipLookup for CsvGeoip {
    fn country(&self, ip: &[u8]) -> String {
        self.find(ip).map(|r| r.country.clone()).unwrap_or_else(|| "?".to_string())
    }

    fn city(&self, ip: &[u8]) -> String {
        self.find(ip).map(|r| r.city.clone()).unwrap_or_else(|| "?".to_string())
    }

    fn asn(&self, ip: &[u8]) -> u32 {
        self.find(ip).map(|r| r.asn).unwrap_or(0)
    }

    fn asd(&self, ip: &[u8]) -> String {
        self.find(ip).map(|r| r.asd.clone()).unwrap_or_else(|| "?".to_string())
    }
}

/// Reloads the geoip database, logging and keeping the previous lookup on
/// failure (spec.md §7 reverse-lookup-style "log and keep previous" policy).
pub fn try_reload(path: &Path) -> Option<CsvGeoip> {
    match CsvGeoip::load(path) {
        Ok(db) => Some(db),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "geoip reload failed, keeping previous database");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn looks_up_ip_within_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "start,end,country,city,asn,asd").unwrap();
        writeln!(file, "167772160,167772415,US,Testville,64512,Example ASN").unwrap();
        file.flush().unwrap();

        let db = CsvGeoip::load(file.path()).unwrap();
        let ip = [10u8, 0, 0, 5];
        assert_eq!(db.country(&ip), "US");
        assert_eq!(db.asn(&ip), 64512);

        let miss = [8u8, 8, 8, 8];
        assert_eq!(db.country(&miss), "?");
    }
}
