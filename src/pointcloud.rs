//! Point clouds as consumed by the solver: one `id X Y Z` record per line.

use crate::error::{DvcError, Result};

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointRecord {
    pub id: u32,
    pub position: [f64; 3],
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<PointRecord>,
}

impl PointCloud {
    /// Number positions `1..=N` in order.
    pub fn from_positions(positions: impl IntoIterator<Item = [f64; 3]>) -> Self {
        let points = positions
            .into_iter()
            .zip(1..)
            .map(|(position, id)| PointRecord { id, position })
            .collect();
        Self { points }
    }

    pub fn from_records(points: Vec<PointRecord>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[PointRecord] {
        &self.points
    }

    pub fn first(&self) -> Option<&PointRecord> {
        self.points.first()
    }

    pub fn positions(&self) -> impl Iterator<Item = [f64; 3]> + '_ {
        self.points.iter().map(|p| p.position)
    }

    /// Tab separated text with three decimals, as written to `.roi` files.
    pub fn to_roi_string(&self) -> String {
        let mut out = String::with_capacity(self.points.len() * 32);
        for PointRecord { id, position: [x, y, z] } in &self.points {
            // writing into a String cannot fail
            let _ = writeln!(out, "{id}\t{x:.3}\t{y:.3}\t{z:.3}");
        }
        out
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path.as_ref(), self.to_roi_string())?;
        log::info!("Wrote {} points to {}", self.len(), path.as_ref().display());
        Ok(())
    }

    /// Read a `.roi` / `.txt` (tab, `;` or whitespace separated) or `.csv`
    /// point cloud. Ids are kept as written. Rows that are not four numbers
    /// are skipped with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

        let mut points = Vec::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_record(line, is_csv) {
                Ok(record) => points.push(record),
                Err(message) => {
                    log::warn!("{}", DvcError::parse(path, number + 1, message));
                }
            }
        }
        log::info!("Loaded {} points from {}", points.len(), path.display());
        Ok(Self { points })
    }
}

fn parse_record(line: &str, is_csv: bool) -> std::result::Result<PointRecord, String> {
    let fields: Vec<&str> = if is_csv {
        line.split(',').map(str::trim).collect()
    } else {
        line.split(|c: char| c == '\t' || c == ';' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect()
    };
    let [id, x, y, z] = *fields.as_slice() else {
        return Err(format!("expected 4 fields, found {}", fields.len()));
    };
    let number = |field: &str| {
        field
            .parse::<f64>()
            .map_err(|_| format!("{field:?} is not a number"))
    };
    let id = number(id)?;
    if id.fract() != 0.0 || id < 0.0 || id > u32::MAX as f64 {
        return Err(format!("{id} is not a point id"));
    }
    Ok(PointRecord {
        id: id as u32,
        position: [number(x)?, number(y)?, number(z)?],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_text_format() {
        let cloud = PointCloud::from_positions([[1.0, 2.5, -3.25], [0.1234, 10.0, 0.0]]);
        assert_eq!(
            cloud.to_roi_string(),
            "1\t1.000\t2.500\t-3.250\n2\t0.123\t10.000\t0.000\n"
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.roi");
        let cloud = PointCloud::from_records(vec![
            PointRecord { id: 2, position: [1.5, 2.0, 3.125] },
            PointRecord { id: 1, position: [-4.0, 0.0, 7.75] },
        ]);
        cloud.save(&path).unwrap();
        assert_eq!(PointCloud::load(&path).unwrap(), cloud);
    }

    #[test]
    fn csv_with_bom_and_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.csv");
        fs::write(&path, "\u{feff}1,0.5,1.5,2.5\nid,x,y,z\n2, 3, 4, 5\n3,1,2\n").unwrap();
        let cloud = PointCloud::load(&path).unwrap();
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.points()[0].position, [0.5, 1.5, 2.5]);
        assert_eq!(cloud.points()[1].id, 2);
    }

    #[test]
    fn semicolons_and_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.txt");
        fs::write(&path, "1;1.0;2.0;3.0\n2 4 5 6\n\n3\t7\t8\t9\n").unwrap();
        let cloud = PointCloud::load(&path).unwrap();
        let ids: Vec<u32> = cloud.points().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(cloud.points()[2].position, [7.0, 8.0, 9.0]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            PointCloud::load("/nonexistent/cloud.roi"),
            Err(DvcError::Io(_))
        ));
    }
}
