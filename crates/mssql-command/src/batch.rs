//! Batch RPC mode: aggregate several commands into one execution.
//!
//! Every command added to a batch must agree on the column encryption
//! setting; the first add locks it. Per-RPC accounting records rows
//! affected (individual and cumulative) and half-open slices into the
//! session's diagnostic buffers so a fault for command *i* can be
//! reconstructed after the fact.

use std::sync::Arc;

use tds_rpc::RpcRecord;

use crate::command::{ColumnEncryptionSetting, CommandKind};
use crate::error::{Error, Result};
use crate::parameter::ParameterCollection;
use crate::parser::{ServerFault, SessionDiagnostics};

/// One aggregated command inside a batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// The command text or procedure name.
    pub text: String,
    /// Text batch or stored procedure.
    pub kind: CommandKind,
    /// The item's own parameters.
    pub params: ParameterCollection,
    /// The invocation descriptor, including per-RPC accounting.
    pub record: RpcRecord,
}

/// Batch execution state for a command.
#[derive(Debug)]
pub struct BatchMode {
    setting: ColumnEncryptionSetting,
    items: Vec<BatchItem>,
    current: usize,
    diagnostics: Option<Arc<SessionDiagnostics>>,
}

impl BatchMode {
    /// Start a batch; the first command locks the encryption setting.
    #[must_use]
    pub(crate) fn new(setting: ColumnEncryptionSetting) -> Self {
        Self {
            setting,
            items: Vec::new(),
            current: 0,
            diagnostics: None,
        }
    }

    /// The locked encryption setting.
    #[must_use]
    pub fn setting(&self) -> ColumnEncryptionSetting {
        self.setting
    }

    /// Append a command, enforcing setting agreement.
    pub(crate) fn push(&mut self, item: BatchItem, setting: ColumnEncryptionSetting) -> Result<()> {
        if setting != self.setting {
            return Err(Error::InvalidArgument(format!(
                "batch commands must agree on the column encryption setting \
                 (batch is {:?}, command is {setting:?})",
                self.setting
            )));
        }
        self.items.push(item);
        Ok(())
    }

    /// Number of aggregated commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The items, in order.
    #[must_use]
    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    pub(crate) fn items_mut(&mut self) -> &mut Vec<BatchItem> {
        &mut self.items
    }

    /// Index of the item currently executing.
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current
    }

    pub(crate) fn set_current(&mut self, index: usize) {
        self.current = index;
    }

    pub(crate) fn set_diagnostics(&mut self, diagnostics: Arc<SessionDiagnostics>) {
        self.diagnostics = Some(diagnostics);
    }

    /// Rows affected by item `index` alone.
    #[must_use]
    pub fn rows_affected(&self, index: usize) -> Option<u64> {
        self.items.get(index).map(|i| i.record.rows_affected)
    }

    /// Rows affected up to and including item `index`.
    #[must_use]
    pub fn cumulative_rows_affected(&self, index: usize) -> Option<u64> {
        self.items
            .get(index)
            .map(|i| i.record.cumulative_rows_affected)
    }

    /// Reconstruct the faults of item `index`: its error slice followed by
    /// its warning slice.
    #[must_use]
    pub fn get_errors(&self, index: usize) -> Vec<ServerFault> {
        let (Some(item), Some(diags)) = (self.items.get(index), self.diagnostics.as_ref()) else {
            return Vec::new();
        };
        let record = &item.record;
        let mut faults = diags.errors_in(record.errors_start, record.errors_end);
        faults.extend(diags.warnings_in(record.warnings_start, record.warnings_end));
        faults
    }
}
