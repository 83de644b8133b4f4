//! Features, tasks, plans and the changes workers produce.

mod change;
mod content;
mod record;
mod feature;
mod plan;

pub use change::*;
pub use content::*;
pub use record::*;
pub use feature::*;
pub use plan::*;
