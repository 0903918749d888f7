//! Fan-out of log entries to the journal and the remote exporter.
//!
//! The journal is authoritative: its errors propagate to the caller. The
//! exporter is best-effort: it sees an entry only after the journal accepted
//! it, and its failures never surface past its own counters.

use std::io;
use std::sync::Arc;

use tracing::warn;

use crate::exporter::Exporter;
use crate::journal::{Journal, JournalEntry};

pub struct FanOutWriter {
    journal: Journal,
    exporter: Option<Arc<Exporter>>,
}

impl FanOutWriter {
    pub fn new(journal: Journal, exporter: Option<Arc<Exporter>>) -> Self {
        FanOutWriter { journal, exporter }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn exporter(&self) -> Option<&Arc<Exporter>> {
        self.exporter.as_ref()
    }

    /// Write an entry to the journal, then hand it to the exporter.
    pub async fn log(&self, entry: &JournalEntry, provider: &str) -> io::Result<()> {
        self.journal.log(entry).await?;
        if let Some(exporter) = &self.exporter {
            exporter.push(entry, provider);
        }
        Ok(())
    }

    /// Close the exporter first so queued entries drain while journal
    /// handles are still live, then flush the journal.
    pub async fn close(&self) {
        if let Some(exporter) = &self.exporter {
            if let Err(e) = exporter.close().await {
                warn!(error = %e, "exporter did not drain cleanly");
            }
        }
        self.journal.close().await;
    }
}
