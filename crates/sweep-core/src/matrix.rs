//! The persisted sweep matrix: one row per planned run, rewritten whole on
//! every status change.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::identity::RunIdentity;
use crate::params::{flag01, na_option, ParameterError, ParameterTuple, RunStatus};
use crate::table::{read_csv, write_csv};

pub const MATRIX_FILE_NAME: &str = "sweep_matrix.csv";

pub const MATRIX_HEADER: [&str; 9] = [
    "run",
    "topology",
    "scenario",
    "attack_rate",
    "trust",
    "lambda",
    "gamma",
    "seed",
    "status",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixRow {
    pub run: RunIdentity,
    pub topology: String,
    pub scenario: String,
    pub attack_rate: u32,
    #[serde(with = "flag01")]
    pub trust: bool,
    #[serde(with = "na_option")]
    pub lambda: Option<u32>,
    #[serde(with = "na_option")]
    pub gamma: Option<u32>,
    pub seed: u64,
    pub status: RunStatus,
}

impl MatrixRow {
    pub fn planned(tuple: &ParameterTuple) -> Self {
        Self::with_status(tuple, RunStatus::Planned)
    }

    pub fn with_status(tuple: &ParameterTuple, status: RunStatus) -> Self {
        Self {
            run: RunIdentity::for_tuple(tuple),
            topology: tuple.topology().to_string(),
            scenario: tuple.scenario().to_string(),
            attack_rate: tuple.attack_rate(),
            trust: tuple.trust_enabled(),
            lambda: tuple.lambda(),
            gamma: tuple.gamma(),
            seed: tuple.seed(),
            status,
        }
    }

    pub fn tuple(&self) -> Result<ParameterTuple, ParameterError> {
        ParameterTuple::new(
            self.topology.clone(),
            self.scenario.clone(),
            self.attack_rate,
            self.trust,
            self.lambda,
            self.gamma,
            self.seed,
        )
    }
}

/// Statuses read from a matrix file of any vintage, keyed by canonical
/// identity. Rows whose run name or status could not be read are kept aside.
#[derive(Debug, Clone, Default)]
pub struct MatrixStatuses {
    pub statuses: BTreeMap<RunIdentity, RunStatus>,
    pub unreadable: Vec<String>,
}

#[derive(Deserialize)]
struct StatusCells {
    run: String,
    status: String,
}

/// Reads only the `run` and `status` columns. Run names go through
/// [`RunIdentity::parse_lenient`], so matrices written by older sweeps load
/// even when their names are not canonical.
pub fn read_statuses(path: &Path) -> Result<MatrixStatuses> {
    let cells: Vec<StatusCells> = read_csv(path)?;
    let mut out = MatrixStatuses::default();
    for row in cells {
        let tuple = RunIdentity::parse_lenient(&row.run);
        let status = row.status.parse::<RunStatus>();
        match (tuple, status) {
            (Ok(tuple), Ok(status)) => {
                out.statuses.insert(RunIdentity::for_tuple(&tuple), status);
            }
            _ => out.unreadable.push(row.run),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct SweepMatrix {
    path: PathBuf,
    rows: Vec<MatrixRow>,
}

impl SweepMatrix {
    /// Builds an all-planned matrix for `tuples`; nothing is written yet.
    pub fn plan(path: &Path, tuples: &[ParameterTuple]) -> Result<Self> {
        let rows: Vec<MatrixRow> = tuples.iter().map(MatrixRow::planned).collect();
        Self::from_rows(path, rows)
    }

    pub fn from_rows(path: &Path, rows: Vec<MatrixRow>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for row in &rows {
            if !seen.insert(row.run.clone()) {
                return Err(anyhow!("duplicate run identity in sweep matrix: {}", row.run));
            }
            let tuple = row
                .tuple()
                .map_err(|e| anyhow!("matrix row {} is inconsistent: {}", row.run, e))?;
            if RunIdentity::for_tuple(&tuple) != row.run {
                return Err(anyhow!(
                    "matrix row {} does not match its parameter columns",
                    row.run
                ));
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            rows,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let rows: Vec<MatrixRow> = read_csv(path)?;
        Self::from_rows(path, rows)
    }

    pub fn save(&self) -> Result<()> {
        write_csv(&self.path, &MATRIX_HEADER, &self.rows)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> &[MatrixRow] {
        &self.rows
    }

    pub fn identities(&self) -> BTreeSet<RunIdentity> {
        self.rows.iter().map(|r| r.run.clone()).collect()
    }

    pub fn status_of(&self, run: &RunIdentity) -> Option<RunStatus> {
        self.rows.iter().find(|r| &r.run == run).map(|r| r.status)
    }

    pub fn count_by_status(&self, status: RunStatus) -> usize {
        self.rows.iter().filter(|r| r.status == status).count()
    }

    /// Moves one row from `planned` to a terminal status and persists the
    /// whole matrix. A row's status changes at most once.
    pub fn record_status(&mut self, run: &RunIdentity, status: RunStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(anyhow!("cannot record non-terminal status for {}", run));
        }
        let row = self
            .rows
            .iter_mut()
            .find(|r| &r.run == run)
            .ok_or_else(|| anyhow!("run {} is not part of the sweep matrix", run))?;
        if row.status.is_terminal() {
            return Err(anyhow!(
                "run {} already finished with status {}",
                run,
                row.status
            ));
        }
        row.status = status;
        self.save()
    }
}
