use indexmap::IndexMap;

use crate::errs::{SpanError, SpanResult};

pub const TREATMENT_COLUMN: &str = "y";
pub const CONTROL_COLUMN: &str = "input";
pub const GC_COLUMN: &str = "GC";
pub const GC2_COLUMN: &str = "GC2";
pub const MAPABILITY_COLUMN: &str = "mapability";

#[derive(Debug, Clone, PartialEq)]
enum Column {
    Int(Vec<i32>),
    Float(Vec<f64>),
}

impl Column {
    fn len(&self) -> usize {
        match self {
            Column::Int(values) => values.len(),
            Column::Float(values) => values.len(),
        }
    }
}

/// Named, column-oriented table with a fixed row count equal to the bin
/// count of its chromosome. The treatment counts live in the required `y`
/// column; covariates and control coverage are optional float columns.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    rows: usize,
    columns: IndexMap<String, Column>,
}

impl DataFrame {
    pub fn with_rows(rows: usize) -> Self {
        Self { rows, columns: IndexMap::new() }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn labels(&self) -> Vec<&str> {
        self.columns.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_column(&self, label: &str) -> bool {
        self.columns.contains_key(label)
    }

    fn check_len(&self, label: &str, len: usize) -> SpanResult<()> {
        if len != self.rows {
            return Err(SpanError::DimensionMismatch(format!(
                "column {label} has {len} rows, dataframe has {}",
                self.rows
            )));
        }
        Ok(())
    }

    pub fn add_int_column(
        &mut self,
        label: &str,
        values: Vec<i32>,
    ) -> SpanResult<()> {
        self.check_len(label, values.len())?;
        self.columns.insert(label.to_owned(), Column::Int(values));
        Ok(())
    }

    pub fn add_float_column(
        &mut self,
        label: &str,
        values: Vec<f64>,
    ) -> SpanResult<()> {
        self.check_len(label, values.len())?;
        self.columns.insert(label.to_owned(), Column::Float(values));
        Ok(())
    }

    pub fn int_column(&self, label: &str) -> SpanResult<&[i32]> {
        match self.columns.get(label) {
            Some(Column::Int(values)) => Ok(values),
            Some(Column::Float(_)) => Err(SpanError::invalid_input(format!(
                "column {label} is a float column"
            ))),
            None => Err(SpanError::invalid_input(format!(
                "no column {label} in dataframe"
            ))),
        }
    }

    pub fn float_column(&self, label: &str) -> SpanResult<&[f64]> {
        match self.columns.get(label) {
            Some(Column::Float(values)) => Ok(values),
            Some(Column::Int(_)) => Err(SpanError::invalid_input(format!(
                "column {label} is an int column"
            ))),
            None => Err(SpanError::invalid_input(format!(
                "no column {label} in dataframe"
            ))),
        }
    }

    /// Values of a column as f64, whatever the storage type.
    pub fn numeric_column(&self, label: &str) -> SpanResult<Vec<f64>> {
        match self.columns.get(label) {
            Some(Column::Float(values)) => Ok(values.clone()),
            Some(Column::Int(values)) => {
                Ok(values.iter().map(|&v| v as f64).collect())
            }
            None => Err(SpanError::invalid_input(format!(
                "no column {label} in dataframe"
            ))),
        }
    }

    pub fn treatment(&self) -> SpanResult<&[i32]> {
        self.int_column(TREATMENT_COLUMN)
    }
}
