//! State reconciliation: compare bot state files against the OS process
//! table and optionally repair the files.

pub mod observer;
pub mod output;
pub mod reconcile;

pub use observer::{
    classify, default_rules, ClassificationRule, CommandLine, Duplicates, ProcFs, ProcessMap,
    ProcessObserver, ProcessSource, PsAux, RawProcess,
};
pub use output::{append_report, format_report};
pub use reconcile::{FileMap, Reconciler};
