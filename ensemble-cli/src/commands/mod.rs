pub mod impact;
pub mod simulate;
pub mod validate;

pub use impact::{run_impact, run_plan};
pub use simulate::{run_simulate, run_transition};
pub use validate::run_validate;
