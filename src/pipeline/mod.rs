//! Board domain: phases, rows, deals, grouping, employees, drag
//! reconciliation, cross-backend sync and the board coordinator.

pub mod board;
pub mod deal;
pub mod employee;
pub mod grouping;
pub mod phase;
pub mod reconciler;
pub mod row;
pub mod service;
pub mod sync;

pub use board::{Board, BoardHandle, BoardRules, BoardSnapshot};
pub use phase::{Phase, PhaseMap};
pub use row::{GroupKey, RowKey};
pub use service::BoardService;
