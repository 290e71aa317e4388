// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streams phase output into log chunks.

use async_trait::async_trait;
use runway_core::logs::{END_MARKER, START_MARKER};
use runway_core::{Chunk, PhaseKind};

use crate::runner::{PhaseOutput, RunnerError};
use crate::services::LogService;

/// Writes a phase's output as a sequence of chunks.
///
/// The first chunk is prefixed with the start marker and [`close`] writes
/// the end marker. Offsets count bytes, markers included.
///
/// [`close`]: PhaseWriter::close
pub struct PhaseWriter {
    logs: LogService,
    run_id: String,
    phase: PhaseKind,
    offset: i64,
    started: bool,
    closed: bool,
}

impl PhaseWriter {
    /// Create a writer for one phase of a run.
    pub fn new(logs: LogService, run_id: impl Into<String>, phase: PhaseKind) -> Self {
        Self {
            logs,
            run_id: run_id.into(),
            phase,
            offset: 0,
            started: false,
            closed: false,
        }
    }

    /// Offset the next chunk will be written at.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    async fn put(&mut self, data: Vec<u8>) -> runway_core::Result<()> {
        let len = data.len() as i64;
        self.logs
            .put_chunk(Chunk {
                run_id: self.run_id.clone(),
                phase: self.phase,
                offset: self.offset,
                data,
            })
            .await?;
        self.offset += len;
        Ok(())
    }

    /// Mark the end of the stream. Further calls do nothing.
    pub async fn close(&mut self) -> runway_core::Result<()> {
        if self.closed {
            return Ok(());
        }
        let data = if self.started {
            vec![END_MARKER]
        } else {
            vec![START_MARKER, END_MARKER]
        };
        self.put(data).await?;
        self.started = true;
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl PhaseOutput for PhaseWriter {
    async fn write(&mut self, data: &[u8]) -> crate::runner::Result<()> {
        if self.closed {
            return Err(RunnerError::Other("phase log already closed".to_string()));
        }
        if data.is_empty() {
            return Ok(());
        }
        let mut bytes = Vec::with_capacity(data.len() + 1);
        if !self.started {
            bytes.push(START_MARKER);
        }
        bytes.extend_from_slice(data);
        self.put(bytes).await?;
        self.started = true;
        Ok(())
    }
}
