//! Reading what the solver leaves in `dvc_result_<n>/`: a `.stat` file
//! echoing the job's settings and a `.disp` table with one row per point.

use crate::error::{DvcError, Result};

use std::fs;
use std::path::{Path, PathBuf};

pub const RESULT_FOLDER_PREFIX: &str = "dvc_result_";

/// `.disp` columns before the per-point results: id, x, y, z, status.
const DISP_LEADING_COLUMNS: usize = 5;

/// Settings as reported in the `.stat` file.
#[derive(Clone, Debug, PartialEq)]
pub struct RunStatistics {
    pub subvol_geom: String,
    pub subvol_size: u32,
    pub subvol_points: u32,
    pub disp_max: u32,
    pub num_srch_dof: u32,
    pub obj_function: String,
    pub interp_type: String,
    pub rigid_trans: [i64; 3],
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplacementRecord {
    pub id: u32,
    pub position: [f64; 3],
    pub objmin: f64,
    pub u: f64,
    pub v: f64,
    pub w: f64,
    /// `(phi, theta, psi)`, only present for searches with rotations.
    pub rotation: Option<[f64; 3]>,
}

impl DisplacementRecord {
    /// Result columns in `.disp` order.
    pub fn values(&self) -> Vec<f64> {
        let mut values = vec![self.objmin, self.u, self.v, self.w];
        if let Some(rotation) = self.rotation {
            values.extend(rotation);
        }
        values
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSummary {
    pub title: String,
    pub mean: f64,
    pub std_dev: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    pub name: String,
    pub statistics: RunStatistics,
    /// Result column names from the `.disp` header.
    pub columns: Vec<String>,
    pub records: Vec<DisplacementRecord>,
}

impl RunResult {
    pub fn title(&self) -> String {
        format!(
            "{} Points in Subvolume, Subvolume Size: {}",
            self.statistics.subvol_points, self.statistics.subvol_size
        )
    }

    pub fn column_titles(&self) -> Vec<String> {
        self.columns.iter().map(|c| column_title(c)).collect()
    }

    /// Displacements measured from the first point's, which is point0.
    pub fn relative_to_point0(&self) -> Vec<DisplacementRecord> {
        let Some(first) = self.records.first() else {
            return Vec::new();
        };
        let (u0, v0, w0) = (first.u, first.v, first.w);
        self.records
            .iter()
            .map(|r| DisplacementRecord {
                u: r.u - u0,
                v: r.v - v0,
                w: r.w - w0,
                ..*r
            })
            .collect()
    }

    /// Mean and population standard deviation of every result column.
    pub fn column_summaries(&self) -> Vec<ColumnSummary> {
        if self.records.is_empty() {
            return Vec::new();
        }
        let rows: Vec<Vec<f64>> = self.records.iter().map(DisplacementRecord::values).collect();
        let n = rows.len() as f64;
        self.column_titles()
            .into_iter()
            .enumerate()
            .map(|(column, title)| {
                let values: Vec<f64> = rows.iter().filter_map(|row| row.get(column).copied()).collect();
                let mean = values.iter().sum::<f64>() / n;
                let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                ColumnSummary {
                    title,
                    mean,
                    std_dev: variance.sqrt(),
                }
            })
            .collect()
    }
}

/// Display name of a `.disp` column.
pub fn column_title(column: &str) -> String {
    match column {
        "objmin" => "Objective Minimum".to_string(),
        "u" => "Displacement in x".to_string(),
        "v" => "Displacement in y".to_string(),
        "w" => "Displacement in z".to_string(),
        "phi" => "Change in phi".to_string(),
        "the" | "theta" => "Change in theta".to_string(),
        "psi" => "Change in psi".to_string(),
        other => other.to_string(),
    }
}

pub struct ResultsModel;

impl ResultsModel {
    /// Parse one job folder; the files inside are named after it.
    ///
    /// # Errors
    ///
    /// Returns error if the `.stat` or `.disp` file is missing or a `.stat`
    /// field cannot be read. Bad `.disp` rows are skipped with a warning.
    pub fn parse(job_folder: impl AsRef<Path>) -> Result<RunResult> {
        let job_folder = job_folder.as_ref();
        let name = job_folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DvcError::configuration(format!("{} is not a job folder", job_folder.display())))?;
        let statistics = parse_stat(&job_folder.join(format!("{name}.stat")))?;
        let (columns, records) = parse_disp(&job_folder.join(format!("{name}.disp")))?;
        Ok(RunResult {
            name,
            statistics,
            columns,
            records,
        })
    }

    /// Every `dvc_result_<n>` job of a run, in job order.
    pub fn parse_folder(run_folder: impl AsRef<Path>) -> Result<Vec<RunResult>> {
        let mut jobs: Vec<(usize, PathBuf)> = fs::read_dir(run_folder.as_ref())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let index = name.strip_prefix(RESULT_FOLDER_PREFIX)?.parse().ok()?;
                Some((index, entry.path()))
            })
            .collect();
        jobs.sort_by_key(|(index, _)| *index);
        jobs.into_iter().map(|(_, path)| Self::parse(path)).collect()
    }
}

/// Lines of a `.stat` file, addressed by their position in the layout
/// without the optional `vol_endian` line.
struct StatLines<'a> {
    path: &'a Path,
    lines: Vec<&'a str>,
    offset: usize,
}

impl<'a> StatLines<'a> {
    fn new(path: &'a Path, text: &'a str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        let offset = match lines.get(9) {
            Some(line) if line.split('\t').next() == Some("vol_endian") => 1,
            _ => 0,
        };
        Self { path, lines, offset }
    }

    fn error(&self, line: usize, message: String) -> DvcError {
        DvcError::parse(self.path, line + self.offset + 1, message)
    }

    fn field(&self, line: usize, column: usize) -> Result<&'a str> {
        self.lines
            .get(line + self.offset)
            .and_then(|l| l.split('\t').nth(column))
            .map(str::trim)
            .ok_or_else(|| self.error(line, format!("missing field {column}")))
    }

    fn integer(&self, line: usize, column: usize) -> Result<i64> {
        let value = self.field(line, column)?;
        value
            .parse::<i64>()
            .or_else(|_| value.parse::<f64>().map(|v| v.round() as i64))
            .map_err(|_| self.error(line, format!("{value:?} is not a number")))
    }

    fn unsigned(&self, line: usize) -> Result<u32> {
        let value = self.integer(line, 1)?;
        u32::try_from(value).map_err(|_| self.error(line, format!("{value} is out of range")))
    }
}

fn parse_stat(path: &Path) -> Result<RunStatistics> {
    let text = fs::read_to_string(path)?;
    let stat = StatLines::new(path, &text);
    Ok(RunStatistics {
        subvol_geom: stat.field(14, 1)?.to_string(),
        subvol_size: stat.unsigned(15)?,
        subvol_points: stat.unsigned(16)?,
        disp_max: stat.unsigned(20)?,
        num_srch_dof: stat.unsigned(21)?,
        obj_function: stat.field(22, 1)?.to_string(),
        interp_type: stat.field(23, 1)?.to_string(),
        rigid_trans: [stat.integer(25, 1)?, stat.integer(25, 2)?, stat.integer(25, 3)?],
    })
}

fn parse_disp(path: &Path) -> Result<(Vec<String>, Vec<DisplacementRecord>)> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| DvcError::parse(path, 1, "missing header"))?;
    let columns: Vec<String> = header
        .split_whitespace()
        .skip(DISP_LEADING_COLUMNS)
        .map(str::to_string)
        .collect();

    let mut records = Vec::new();
    for (number, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_disp_row(line) {
            Ok(record) => records.push(record),
            Err(message) => log::warn!("{}", DvcError::parse(path, number + 2, message)),
        }
    }
    Ok((columns, records))
}

fn parse_disp_row(line: &str) -> std::result::Result<DisplacementRecord, String> {
    let values = line
        .split_whitespace()
        .map(|field| field.parse::<f64>().map_err(|_| format!("{field:?} is not a number")))
        .collect::<std::result::Result<Vec<f64>, String>>()?;
    let results = values.get(DISP_LEADING_COLUMNS..).unwrap_or(&[]);
    let rotation = match results.len() {
        4 => None,
        n if n >= 7 => Some([results[4], results[5], results[6]]),
        n => return Err(format!("expected 4 or 7 result columns, found {n}")),
    };
    Ok(DisplacementRecord {
        id: values[0] as u32,
        position: [values[1], values[2], values[3]],
        objmin: results[0],
        u: results[1],
        v: results[2],
        w: results[3],
        rotation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_only_row() {
        let record = parse_disp_row("1 0 0 0 0 0.1 1.0 2.0 3.0").unwrap();
        assert_eq!((record.objmin, record.u, record.v, record.w), (0.1, 1.0, 2.0, 3.0));
        assert_eq!(record.rotation, None);
    }

    #[test]
    fn row_with_rotations() {
        let record = parse_disp_row("2\t5\t6\t7\t0\t0.2\t1\t2\t3\t0.01\t0.02\t0.03").unwrap();
        assert_eq!(record.id, 2);
        assert_eq!(record.position, [5.0, 6.0, 7.0]);
        assert_eq!(record.rotation, Some([0.01, 0.02, 0.03]));
    }

    #[test]
    fn short_or_garbled_rows_are_rejected() {
        assert!(parse_disp_row("1 0 0 0 0 0.1 1.0").is_err());
        assert!(parse_disp_row("1 0 0 0 0 0.1 1.0 2.0 nan?").is_err());
    }

    #[test]
    fn titles() {
        assert_eq!(column_title("objmin"), "Objective Minimum");
        assert_eq!(column_title("w"), "Displacement in z");
        assert_eq!(column_title("the"), "Change in theta");
        assert_eq!(column_title("extra"), "extra");
    }
}
