//! The per-run statistics record and its CSV-appendable form.
//!
//! One row per run, header on first write. The configuration snapshot is
//! embedded as a JSON column so rows stay self-describing.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Everything reported about one generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatistics {
    pub run_id: String,
    pub module: String,
    pub algorithm: String,
    pub seed: u64,
    pub coverage: f64,
    pub covered_goals: usize,
    pub total_goals: usize,
    pub archive_size: usize,
    pub iterations: u64,
    pub test_executions: u64,
    pub statement_executions: u64,
    pub mutation_score: Option<f64>,
    pub wall_time_ms: u64,
    /// JSON snapshot of the configuration the run used.
    pub configuration: String,
}

const HEADER: &str = "run_id,module,algorithm,seed,coverage,covered_goals,total_goals,\
archive_size,iterations,test_executions,statement_executions,mutation_score,wall_time_ms,\
configuration";

impl RunStatistics {
    /// The CSV row for this record, fields quoted where needed.
    #[must_use]
    pub fn to_csv_row(&self) -> String {
        let mut row = String::new();
        let fields: Vec<String> = vec![
            self.run_id.clone(),
            self.module.clone(),
            self.algorithm.clone(),
            self.seed.to_string(),
            format!("{:.6}", self.coverage),
            self.covered_goals.to_string(),
            self.total_goals.to_string(),
            self.archive_size.to_string(),
            self.iterations.to_string(),
            self.test_executions.to_string(),
            self.statement_executions.to_string(),
            self.mutation_score
                .map_or(String::new(), |s| format!("{s:.6}")),
            self.wall_time_ms.to_string(),
            self.configuration.clone(),
        ];
        for (index, field) in fields.iter().enumerate() {
            if index > 0 {
                row.push(',');
            }
            let _ = write!(row, "{}", quote_csv(field));
        }
        row
    }
}

fn quote_csv(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Appends the record to the CSV file, writing the header first when the
/// file is new or empty.
pub fn append_csv(path: &Path, statistics: &RunStatistics) -> std::io::Result<()> {
    let needs_header = std::fs::metadata(path).map_or(true, |meta| meta.len() == 0);
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if needs_header {
        writeln!(file, "{HEADER}")?;
    }
    writeln!(file, "{}", statistics.to_csv_row())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunStatistics {
        RunStatistics {
            run_id: "run-1".to_string(),
            module: "triangle".to_string(),
            algorithm: "DynaMosa".to_string(),
            seed: 42,
            coverage: 1.0,
            covered_goals: 8,
            total_goals: 8,
            archive_size: 8,
            iterations: 12,
            test_executions: 640,
            statement_executions: 4_100,
            mutation_score: Some(0.75),
            wall_time_ms: 1_523,
            configuration: "{\"algorithm\":\"DynaMosa\"}".to_string(),
        }
    }

    #[test]
    fn header_is_written_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.csv");
        append_csv(&path, &sample()).expect("first append");
        append_csv(&path, &sample()).expect("second append");
        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("run_id,module,algorithm"));
        assert!(lines[1].starts_with("run-1,triangle"));
        assert_eq!(lines[1], lines[2]);
    }

    #[test]
    fn configuration_snapshot_is_quoted() {
        let row = sample().to_csv_row();
        assert!(row.contains("\"{\"\"algorithm\"\":\"\"DynaMosa\"\"}\""));
    }

    #[test]
    fn missing_mutation_score_is_an_empty_field() {
        let mut statistics = sample();
        statistics.mutation_score = None;
        let row = statistics.to_csv_row();
        assert!(row.contains(",,"));
    }
}
