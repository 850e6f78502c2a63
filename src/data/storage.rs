//! Archival sinks for raw datasets.
//!
//! Every parsed datagram is archived before it is buffered. Sink failures are
//! reported to the caller, which logs them and carries on; archival never stops the
//! gateway.
use crate::{
    config::StorageSettings,
    error::{GatewayError, GatewayResult},
};
use async_trait::async_trait;
#[cfg(feature = "storage_csv")]
use {
    crate::data::stats::format_timestamp,
    std::fs::File,
    std::path::{Path, PathBuf},
    tracing::info,
};

/// Destination for raw datasets.
#[async_trait]
pub trait DatasetSink: Send {
    /// Archive one dataset.
    async fn insert(
        &mut self,
        channel_id: &str,
        timestamp: f64,
        dataset: &[i64],
    ) -> GatewayResult<()>;

    /// Flush and release resources.
    async fn shutdown(&mut self) -> GatewayResult<()> {
        Ok(())
    }
}

/// Discards everything. Used when archival is not configured.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl DatasetSink for NullSink {
    async fn insert(
        &mut self,
        _channel_id: &str,
        _timestamp: f64,
        _dataset: &[i64],
    ) -> GatewayResult<()> {
        Ok(())
    }
}

/// Appends datasets as CSV rows `datagram_id,channel,timestamp,dataset`.
///
/// The datagram id starts at 1 and increments for every insert attempt, failed or
/// not, so gaps in the archive show where rows were lost.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    datagram_id: u64,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    /// Open `path` for appending, writing a header if the file is new or empty.
    pub fn open(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let needs_header = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer
                .write_record(["datagram_id", "channel", "timestamp", "dataset"])
                .map_err(|e| GatewayError::Storage(e.to_string()))?;
            writer.flush()?;
        }

        info!(path = %path.display(), "CSV archive opened");
        Ok(Self {
            path,
            writer,
            datagram_id: 1,
        })
    }

    /// Id the next insert will use.
    pub fn next_datagram_id(&self) -> u64 {
        self.datagram_id
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl DatasetSink for CsvSink {
    async fn insert(
        &mut self,
        channel_id: &str,
        timestamp: f64,
        dataset: &[i64],
    ) -> GatewayResult<()> {
        let id = self.datagram_id;
        self.datagram_id += 1;

        let dataset = dataset
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        self.writer
            .write_record(&[
                id.to_string(),
                channel_id.to_string(),
                format_timestamp(timestamp),
                dataset,
            ])
            .map_err(|e| GatewayError::Storage(format!("datagram {id}: {e}")))?;
        self.writer
            .flush()
            .map_err(|e| GatewayError::Storage(format!("datagram {id}: {e}")))
    }

    async fn shutdown(&mut self) -> GatewayResult<()> {
        self.writer.flush()?;
        info!(path = %self.path.display(), "CSV archive closed");
        Ok(())
    }
}

/// Build the configured sink.
///
/// Without a `csv_path` a [`NullSink`] is returned. Asking for CSV archival in a
/// build without the `storage_csv` feature is a configuration error.
pub fn open_sink(settings: &StorageSettings) -> GatewayResult<Box<dyn DatasetSink>> {
    match &settings.csv_path {
        None => Ok(Box::new(NullSink)),
        #[cfg(feature = "storage_csv")]
        Some(path) => Ok(Box::new(CsvSink::open(path)?)),
        #[cfg(not(feature = "storage_csv"))]
        Some(_) => Err(GatewayError::FeatureNotEnabled("storage_csv".to_string())),
    }
}
