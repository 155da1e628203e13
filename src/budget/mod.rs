//! # Budget Pool
//!
//! Cross-stream backpressure credit. Several streams sharing one physical
//! transport debit the same budget id; when it runs dry they stop sending and
//! are woken by the next credit event. Running out of budget is not an error.

mod pool;

pub use pool::{BudgetPool, NO_BUDGET};
