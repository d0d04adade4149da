//! Configuration document handling: typed model, schemas, and the
//! load/merge/expand/validate pipeline.

pub mod loader;
pub mod model;
pub mod schema_def;

pub use loader::load;
pub use model::{Filters, FlowConfig, Modifiers, ModuleConfig, ResultSelector, TaskConfig};
