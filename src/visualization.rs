//! Embedding snapshots.
//!
//! Models hand their item embeddings and popularity labels to an
//! [`EmbeddingSink`] on a fixed epoch cadence. Projecting the snapshots to
//! two dimensions and plotting them is left to external tooling; the CSV
//! sink writes them in a form such tooling reads directly.
use std::fs;
use std::path::{Path, PathBuf};

use csv;
use failure;
use ndarray::ArrayView2;
use tracing::debug;

/// Directory snapshots are written to, relative to the working directory.
pub const SNAPSHOT_DIR: &str = "images";

/// File stem of a snapshot: `{model}_t_{exp}_{epoch:03}`.
pub fn snapshot_stem(model: &str, exp: &str, epoch: usize) -> String {
    format!("{}_t_{}_{:03}", model, exp, epoch)
}

/// Destination of embedding snapshots.
pub trait EmbeddingSink {
    /// Store one snapshot. `labels` has one entry per embedding row.
    fn write(
        &mut self,
        stem: &str,
        embeddings: ArrayView2<f32>,
        labels: &[usize],
    ) -> Result<(), failure::Error>;
}

/// Sink discarding every snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EmbeddingSink for NullSink {
    fn write(&mut self, _: &str, _: ArrayView2<f32>, _: &[usize]) -> Result<(), failure::Error> {
        Ok(())
    }
}

/// Writes each snapshot to `{dir}/{stem}.csv`, one row per item:
/// index, label, then the embedding components.
#[derive(Clone, Debug)]
pub struct CsvEmbeddingSink {
    dir: PathBuf,
    written: Vec<PathBuf>,
}

impl Default for CsvEmbeddingSink {
    fn default() -> Self {
        CsvEmbeddingSink::new(SNAPSHOT_DIR)
    }
}

impl CsvEmbeddingSink {
    /// Sink writing into `dir`, created on first use.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        CsvEmbeddingSink {
            dir: dir.as_ref().to_owned(),
            written: Vec::new(),
        }
    }

    /// Paths of the snapshots written so far.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl EmbeddingSink for CsvEmbeddingSink {
    fn write(
        &mut self,
        stem: &str,
        embeddings: ArrayView2<f32>,
        labels: &[usize],
    ) -> Result<(), failure::Error> {
        if labels.len() != embeddings.nrows() {
            bail!(
                "{} labels for {} embedding rows",
                labels.len(),
                embeddings.nrows()
            );
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.csv", stem));
        let mut writer = csv::Writer::from_path(&path)?;

        for (idx, (row, label)) in embeddings.outer_iter().zip(labels).enumerate() {
            let mut record = vec![idx.to_string(), label.to_string()];
            record.extend(row.iter().map(|value| value.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;

        debug!(path = %path.display(), rows = labels.len(), "wrote embedding snapshot");
        self.written.push(path);

        Ok(())
    }
}
