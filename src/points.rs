//! Ordered site tables and their partitioning into contiguous chunks.

use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum PointsError {
    #[error("Failed to read site table {0}")]
    Read(PathBuf, #[source] csv::Error),
    #[error("Site table {0} must contain a \"gid\" column")]
    MissingGidColumn(PathBuf),
    #[error("Cannot parse site gid from {0:?}")]
    BadGid(String),
    #[error("Cannot parse project points from {0}; expected an integer, a list of integers, a {{start, stop}} range, or a path to a csv site table")]
    Unparsable(Value),
    #[error("Project points table is empty")]
    Empty,
}

/// An ordered table of site gids. The order is significant: splitting
/// produces contiguous chunks in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteTable {
    gids: Vec<i64>,
}

impl SiteTable {
    /// Parse project points from a config value: a single gid, a flat list
    /// of gids, a `{start, stop[, step]}` range, or a path to a csv file
    /// with a `gid` column.
    pub fn parse(value: &Value) -> Result<Self, PointsError> {
        let gids = match value {
            Value::Number(number) => {
                let gid = number.as_i64().ok_or(PointsError::Unparsable(value.clone()))?;
                vec![gid]
            }
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_i64().ok_or(PointsError::Unparsable(value.clone())))
                .collect::<Result<Vec<_>, _>>()?,
            Value::String(path) => return Self::from_csv(Path::new(path)),
            Value::Object(range) => {
                let start = range.get("start").and_then(Value::as_i64).unwrap_or(0);
                let stop = range
                    .get("stop")
                    .and_then(Value::as_i64)
                    .ok_or(PointsError::Unparsable(value.clone()))?;
                let step = range.get("step").and_then(Value::as_i64).unwrap_or(1);
                (start..stop).step_by(step.max(1) as usize).collect()
            }
            _ => return Err(PointsError::Unparsable(value.clone())),
        };

        if gids.is_empty() {
            return Err(PointsError::Empty);
        }

        Ok(Self { gids })
    }

    /// Read a site table from a csv file. Only the `gid` column is kept.
    pub fn from_csv(path: &Path) -> Result<Self, PointsError> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|error| PointsError::Read(path.to_path_buf(), error))?;

        let gid_index = reader
            .headers()
            .map_err(|error| PointsError::Read(path.to_path_buf(), error))?
            .iter()
            .position(|header| header.eq_ignore_ascii_case("gid"))
            .ok_or_else(|| PointsError::MissingGidColumn(path.to_path_buf()))?;

        let mut gids = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|error| PointsError::Read(path.to_path_buf(), error))?;
            let field = record.get(gid_index).unwrap_or_default();
            let gid = field
                .trim()
                .parse::<i64>()
                .map_err(|_| PointsError::BadGid(field.to_owned()))?;
            gids.push(gid);
        }

        if gids.is_empty() {
            return Err(PointsError::Empty);
        }

        Ok(Self { gids })
    }

    pub fn gids(&self) -> &[i64] {
        &self.gids
    }

    pub fn len(&self) -> usize {
        self.gids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gids.is_empty()
    }

    /// Split the table into `nodes` contiguous chunks. The first
    /// `len % nodes` chunks hold one extra site so chunk sizes never differ
    /// by more than one. Requests for more chunks than sites are clamped.
    pub fn split(&self, nodes: usize) -> Vec<SiteTable> {
        let nodes = nodes.max(1);
        let nodes = if nodes > self.gids.len() {
            warn!(
                requested = nodes,
                sites = self.gids.len(),
                "More nodes requested than sites; clamping node count"
            );
            self.gids.len()
        } else {
            nodes
        };

        let base = self.gids.len() / nodes;
        let remainder = self.gids.len() % nodes;

        let mut chunks = Vec::with_capacity(nodes);
        let mut offset = 0;
        for index in 0..nodes {
            let size = base + usize::from(index < remainder);
            chunks.push(SiteTable {
                gids: self.gids[offset..offset + size].to_vec(),
            });
            offset += size;
        }

        chunks
    }

    /// Serialize back into a config value (an explicit gid list).
    pub fn to_value(&self) -> Value {
        Value::Array(self.gids.iter().copied().map(Value::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn parse_scalar_list_and_range() {
        assert_eq!(SiteTable::parse(&json!(7)).unwrap().gids(), &[7]);
        assert_eq!(SiteTable::parse(&json!([3, 1, 2])).unwrap().gids(), &[3, 1, 2]);
        assert_eq!(
            SiteTable::parse(&json!({"start": 2, "stop": 6})).unwrap().gids(),
            &[2, 3, 4, 5]
        );
        assert!(SiteTable::parse(&json!([])).is_err());
        assert!(SiteTable::parse(&json!(true)).is_err());
    }

    #[test]
    fn parse_csv_site_table() {
        let mut file = tempfile::NamedTempFile::with_suffix(".csv").unwrap();
        writeln!(file, "gid,capacity").unwrap();
        for gid in 0..5 {
            writeln!(file, "{gid},{}", gid * 10).unwrap();
        }
        file.flush().unwrap();

        let table = SiteTable::from_csv(file.path()).unwrap();
        assert_eq!(table.gids(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn ten_sites_over_three_nodes() {
        let table = SiteTable::parse(&json!({"start": 0, "stop": 10})).unwrap();
        let chunks = table.split(3);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].gids(), &[0, 1, 2, 3]);
        assert_eq!(chunks[1].gids(), &[4, 5, 6]);
        assert_eq!(chunks[2].gids(), &[7, 8, 9]);
    }

    #[test]
    fn more_nodes_than_sites_clamps() {
        let table = SiteTable::parse(&json!([0, 1])).unwrap();
        let chunks = table.split(5);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|chunk| !chunk.is_empty()));
    }

    #[test]
    fn single_node_is_identity() {
        let table = SiteTable::parse(&json!([4, 5, 6])).unwrap();
        let chunks = table.split(1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], table);
    }
}
