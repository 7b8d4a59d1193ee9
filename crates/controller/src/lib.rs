/*
 * 5D Labs Backup Controller - Volume Backup Orchestrator for Kubernetes
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Backup controller library
//!
//! Discovers every persistent volume claim mounted by a running pod, runs the pre-backup
//! hooks and launches one backup Job per claim on the node of the mounting pod, with a
//! bounded number of Jobs in flight. The snapshot module is what those Jobs execute.

pub mod logging;
pub mod snapshot;
pub mod tasks;

// Re-export commonly used types
pub use tasks::config::BackupConfig;
pub use tasks::{run_backup, BackupPipeline, BackupSummary, Error, Result, RunIdentity};
