use std::env;
use std::fs::File;
use std::path::PathBuf;

use polars::prelude::*;

pub fn project_root() -> PathBuf {
    match env::var_os("PROJECT_ROOT") {
        Some(val) => PathBuf::from(val),
        None => {
            // Fall back to current directory if PROJECT_ROOT not set
            env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        }
    }
}

pub fn read_csv(file_path: &str) -> PolarsResult<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(PathBuf::from(file_path)))?
        .finish()
}

pub fn dataframe_to_csv(df: &mut DataFrame, path: &str, include_header: bool) -> PolarsResult<()> {
    let mut file = File::create(path)
        .map_err(|e| PolarsError::ComputeError(format!("creating {path}: {e}").into()))?;
    CsvWriter::new(&mut file)
        .include_header(include_header)
        .finish(df)?;
    Ok(())
}
