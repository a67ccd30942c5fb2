//! Per-bot JSON state store.
//!
//! Bots publish through [`StateWriter`]; the dashboard and the reconciler
//! read through the scanner functions.

pub mod atomic;
pub mod jsonl;
pub mod scanner;
pub mod writer;

pub use atomic::{temp_path, write_atomic, write_json_atomic};
pub use jsonl::append_json_line;
pub use scanner::{clear_all_states, load_all_states, scan_state_dir};
pub use writer::{Fields, StateWriter};
